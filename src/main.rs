//! Binary entrypoint that launches the chat engine server.

use std::process::ExitCode;

use chat_engine::start_chat_engine;

/// Load configuration and serve the engine API.
fn main() -> ExitCode {
    start_chat_engine::run()
}
