use thiserror::Error;

#[derive(Error, Debug)]
pub enum KagiError {
    #[error("Lease '{key}' released by thread {thread} which does not own it")]
    OwnershipViolation { key: String, thread: String },

    #[error("Timed out acquiring lease '{key}' after {waited_secs:.3}s")]
    AcquireTimeout { key: String, waited_secs: f64 },

    #[error("Acquisition of lease '{key}' was cancelled after {waited_secs:.3}s")]
    AcquireCancelled { key: String, waited_secs: f64 },

    #[error("Lease store operation failed: {0}")]
    Store(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Configuration file error: {0}")]
    ConfigFile(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, KagiError>;
