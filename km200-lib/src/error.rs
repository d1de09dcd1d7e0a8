use thiserror::Error;

/// The primary error type for the `km200-lib` library.
#[derive(Error, Debug)]
pub enum KM200Error {
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("{request} was a bad request")]
    BadRequest { request: String },

    #[error("{request} is forbidden")]
    Forbidden { request: String },

    #[error("{request} was not found")]
    NotFound { request: String },

    #[error("{request} was locked")]
    Locked { request: String },

    #[error("{request} resulted in a server error")]
    ServerError { request: String },

    #[error("{request} failed with response code {status}")]
    UnexpectedStatus { request: String, status: u16 },

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Invalid JSON document: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Expanding {path} exceeded the depth limit of {limit}")]
    TreeDepthExceeded { path: String, limit: usize },

    #[error("Operation was cancelled")]
    Cancelled,
}
