use thiserror::Error;

/// Errors produced by the relay protocol layer and its collaborators.
#[derive(Debug, Error)]
pub enum ZoneError {
    #[error("codec error: {0}")]
    Codec(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("credential store error: {0}")]
    Store(String),

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("timeout")]
    Timeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for ZoneError {
    fn from(e: serde_json::Error) -> Self {
        ZoneError::Codec(e.to_string())
    }
}

pub type ZoneResult<T> = Result<T, ZoneError>;
