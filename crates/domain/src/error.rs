/// Shared error type used across all core crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP: {0}")]
    Http(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("provider {provider}: {message}")]
    Provider { provider: String, message: String },

    #[error("config: {0}")]
    Config(String),

    #[error("auth: {0}")]
    Auth(String),

    #[error("repository: {0}")]
    Repository(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("empty key secret")]
    EmptyKey,

    #[error("duplicate key secret: {0}")]
    DuplicateKey(String),

    #[error("cannot remove the last remaining key")]
    LastKeyDeletion,

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
