//! Byte-stream transport to the model backends.

use std::future::Future;
use std::pin::Pin;

use futures::{Stream, StreamExt};
use reqwest::Client as ReqwestClient;
use serde_json::Value;
use tracing::{debug, warn};

use crate::backend::models::Provider;
use crate::backend::request::CompletionRequest;
use crate::core::config::{BackendConfig, TimeoutConfig};
use crate::core::errors::{EngineError, EngineResult, error_text_from_payload};

/// Boxed future type used by transport traits.
pub type TransportFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Raw body chunks of an accepted response.
pub type ChunkStream = Pin<Box<dyn Stream<Item = EngineResult<Vec<u8>>> + Send>>;

/// Owns the network stream of one response; dropping or releasing it aborts the body.
pub struct StreamHandle {
    chunks: Option<ChunkStream>,
}

impl StreamHandle {
    /// Wrap an accepted response body.
    #[must_use]
    pub const fn new(chunks: ChunkStream) -> Self {
        Self {
            chunks: Some(chunks),
        }
    }

    /// Next body chunk; `None` at end of body or after release.
    pub async fn next_chunk(&mut self) -> Option<EngineResult<Vec<u8>>> {
        match self.chunks.as_mut() {
            Some(chunks) => chunks.next().await,
            None => None,
        }
    }

    /// Drop the underlying stream.
    pub fn release(&mut self) {
        if self.chunks.take().is_some() {
            debug!("stream handle released");
        }
    }

    /// Whether the stream has been released.
    #[must_use]
    pub const fn is_released(&self) -> bool {
        self.chunks.is_none()
    }
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle")
            .field("released", &self.is_released())
            .finish()
    }
}

/// Opens completion streams: "give me a byte stream and a cancel handle".
pub trait CompletionTransport: Send + Sync {
    /// Send `request` and return the body stream once the backend accepted it.
    ///
    /// # Errors
    /// Returns `Network` when the backend cannot be reached or answers without a
    /// usable error body, and `Backend` with the extracted text otherwise.
    fn open<'a>(
        &'a self,
        request: &'a CompletionRequest,
    ) -> TransportFuture<'a, EngineResult<StreamHandle>>;
}

/// HTTP transport backed by `reqwest`.
#[derive(Clone, Debug)]
pub struct HttpTransport {
    client: ReqwestClient,
    backends: BackendConfig,
}

impl HttpTransport {
    /// Build a client with the configured connect timeout.
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(backends: BackendConfig, timeouts: &TimeoutConfig) -> EngineResult<Self> {
        let client = ReqwestClient::builder()
            .connect_timeout(timeouts.connect())
            .build()?;
        Ok(Self { client, backends })
    }

    fn endpoint(&self, provider: Provider) -> String {
        match provider {
            Provider::Ollama => format!(
                "{}/api/chat",
                self.backends.ollama_base_url.trim_end_matches('/')
            ),
            Provider::OpenAi => format!(
                "{}/chat/completions",
                self.backends.openai_base_url.trim_end_matches('/')
            ),
        }
    }
}

impl CompletionTransport for HttpTransport {
    fn open<'a>(
        &'a self,
        request: &'a CompletionRequest,
    ) -> TransportFuture<'a, EngineResult<StreamHandle>> {
        Box::pin(async move {
            let provider = request.model.provider;
            let url = self.endpoint(provider);
            let body = request.body()?;

            let mut builder = self.client.post(&url).json(&body);
            if provider == Provider::OpenAi {
                if let Some(key) = &self.backends.openai_api_key {
                    builder = builder.bearer_auth(key);
                }
            }

            debug!(url = %url, model = %request.model.id, "opening completion stream");
            let response = builder.send().await?;
            let status = response.status();
            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                return Err(rejection_error(status.as_u16(), &text));
            }

            let chunks = response
                .bytes_stream()
                .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(EngineError::from));
            Ok(StreamHandle::new(Box::pin(chunks)))
        })
    }
}

/// Map a non-ok response to an error, preferring the payload's own text.
fn rejection_error(status: u16, body: &str) -> EngineError {
    match serde_json::from_str::<Value>(body)
        .ok()
        .as_ref()
        .and_then(error_text_from_payload)
    {
        Some(text) => EngineError::Backend(text),
        None => {
            warn!(status, "backend rejected request without a readable error body");
            EngineError::Network(format!("backend returned HTTP {status}"))
        }
    }
}

#[cfg(test)]
pub(crate) mod scripted {
    //! Network-free transport for session and coordinator tests.

    use std::collections::{HashMap, VecDeque};
    use std::sync::Arc;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::{StreamExt, stream};
    use serde_json::Value;
    use tokio::sync::mpsc;

    use super::{CompletionTransport, StreamHandle, TransportFuture};
    use crate::backend::request::CompletionRequest;
    use crate::core::errors::{EngineError, EngineResult};

    /// What happens after the scripted chunks ran out.
    pub(crate) enum Tail {
        End,
        Hang,
        Fail(String),
    }

    /// Behaviour of one `open` call.
    pub(crate) enum Script {
        /// Connection refused.
        Refuse,
        /// Rejected with a structured error body.
        Reject(String),
        /// Never answers.
        HangOnOpen,
        /// Accepted; yields the chunks then follows the tail.
        Body(Vec<Vec<u8>>, Tail),
        /// Accepted; chunks are pushed by the test.
        Live(mpsc::UnboundedReceiver<EngineResult<Vec<u8>>>),
    }

    struct ReleaseGuard(Arc<AtomicUsize>);

    impl Drop for ReleaseGuard {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Scripts keyed by model id, consumed in order.
    #[derive(Default)]
    pub(crate) struct ScriptedTransport {
        scripts: Mutex<HashMap<String, VecDeque<Script>>>,
        requests: Mutex<Vec<Value>>,
        released: Arc<AtomicUsize>,
    }

    impl ScriptedTransport {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub(crate) fn script(&self, model: &str, script: Script) {
            self.scripts
                .lock()
                .unwrap()
                .entry(model.to_string())
                .or_default()
                .push_back(script);
        }

        /// Body made of newline-terminated lines, one chunk each.
        pub(crate) fn lines(lines: &[&str], tail: Tail) -> Script {
            let chunks = lines.iter().map(|line| format!("{line}\n").into_bytes()).collect();
            Script::Body(chunks, tail)
        }

        pub(crate) fn requests(&self) -> Vec<Value> {
            self.requests.lock().unwrap().clone()
        }

        /// Number of accepted streams that have been dropped.
        pub(crate) fn released(&self) -> usize {
            self.released.load(Ordering::SeqCst)
        }
    }

    impl CompletionTransport for ScriptedTransport {
        fn open<'a>(
            &'a self,
            request: &'a CompletionRequest,
        ) -> TransportFuture<'a, EngineResult<StreamHandle>> {
            Box::pin(async move {
                self.requests.lock().unwrap().push(request.body()?);
                let script = self
                    .scripts
                    .lock()
                    .unwrap()
                    .get_mut(&request.model.id)
                    .and_then(VecDeque::pop_front)
                    .unwrap_or(Script::Refuse);

                let chunks: super::ChunkStream = match script {
                    Script::Refuse => return Err(EngineError::Network("connection refused".into())),
                    Script::Reject(text) => return Err(EngineError::Backend(text)),
                    Script::HangOnOpen => std::future::pending().await,
                    Script::Body(chunks, tail) => {
                        let head = stream::iter(chunks.into_iter().map(Ok::<Vec<u8>, EngineError>));
                        match tail {
                            Tail::End => Box::pin(head),
                            Tail::Hang => {
                                Box::pin(head.chain(stream::pending::<EngineResult<Vec<u8>>>()))
                            }
                            Tail::Fail(text) => Box::pin(
                                head.chain(stream::once(async move { Err(EngineError::Network(text)) })),
                            ),
                        }
                    }
                    Script::Live(rx) => Box::pin(stream::unfold(rx, |mut rx| async move {
                        rx.recv().await.map(|item| (item, rx))
                    })),
                };
                let guard = ReleaseGuard(Arc::clone(&self.released));
                let guarded = chunks.map(move |chunk| {
                    let _held = &guard;
                    chunk
                });
                Ok(StreamHandle::new(Box::pin(guarded)))
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_prefers_payload_text() {
        let err = rejection_error(400, r#"{"detail":"model 'x' not found"}"#);
        assert!(matches!(err, EngineError::Backend(text) if text == "model 'x' not found"));
    }

    #[test]
    fn unreadable_rejection_is_a_network_error() {
        let err = rejection_error(502, "<html>bad gateway</html>");
        assert!(err.is_transport());
    }

    #[test]
    fn endpoints_follow_provider() {
        let transport =
            HttpTransport::new(BackendConfig::default(), &TimeoutConfig::default()).unwrap();
        assert_eq!(
            transport.endpoint(Provider::Ollama),
            "http://127.0.0.1:11434/api/chat"
        );
        assert_eq!(
            transport.endpoint(Provider::OpenAi),
            "https://api.openai.com/v1/chat/completions"
        );
    }

    #[tokio::test]
    async fn released_handle_yields_nothing() {
        let chunks = futures::stream::iter(vec![Ok(b"a".to_vec())]);
        let mut handle = StreamHandle::new(Box::pin(chunks));
        handle.release();
        assert!(handle.is_released());
        assert!(handle.next_chunk().await.is_none());
    }
}
