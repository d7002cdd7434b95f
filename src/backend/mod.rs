//! Model backends: catalogue, request shapes and stream transport.

pub mod models;
pub mod request;
pub mod transport;

pub use models::{ModelInfo, Provider};
pub use request::{ChatParams, CompletionRequest, RequestMessage, build_context, collect_files};
pub use transport::{ChunkStream, CompletionTransport, HttpTransport, StreamHandle, TransportFuture};
