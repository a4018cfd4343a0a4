use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Transport-level failures. Every variant is classified as a transport error
/// by the controller and ends the calling operation.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("cannot reach engine at {endpoint}: {message}")]
    Connect { endpoint: String, message: String },
    #[error("engine did not answer within {0:?}")]
    Timeout(Duration),
    #[error("engine answered HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("malformed engine response: {0}")]
    Decode(String),
    #[error("cannot encode request: {0}")]
    Encode(String),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to start engine {program}: {source}")]
    Spawn {
        program: PathBuf,
        source: std::io::Error,
    },
    #[error("engine exited during startup ({status})")]
    Exited { status: std::process::ExitStatus },
    #[error("engine not ready after {timeout:?}: {last_error}")]
    NotReady {
        timeout: Duration,
        last_error: String,
    },
}
