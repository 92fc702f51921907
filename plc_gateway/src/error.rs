use thiserror::Error;

/// Gateway-level errors, shared by the store, pollers and both north-bound adapters.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GatewayError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, GatewayError>;
