/// Shared error type used across all AgentRelay crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("transport: {0}")]
    Transport(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("validation: {0}")]
    Validation(String),

    #[error("session {session_id}: {message}")]
    Session {
        session_id: String,
        message: String,
    },

    #[error("config: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
