//! Chat engine server binary.
//! Run with: cargo run --bin chat-engine-server

use std::process::ExitCode;

use chat_engine::start_chat_engine;

fn main() -> ExitCode {
    start_chat_engine::run()
}
