use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Invalid value for {name}: {value}")]
    InvalidEnvVar { name: String, value: String },
}

/// Errors returned synchronously to callers of the feed
#[derive(Error, Debug)]
pub enum FeedError {
    #[error("capacity exceeded: {requested} new instruments, {available} slots free")]
    CapacityExceeded { requested: usize, available: usize },

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("unknown slot {0}")]
    UnknownSlot(usize),

    #[error("slot {0} is not degraded")]
    SlotNotDegraded(usize),

    #[error("feed already started")]
    AlreadyStarted,

    #[error("feed not running")]
    NotRunning,

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Failure of one connection attempt or of a live connection
#[derive(Error, Debug, Clone)]
pub enum SlotError {
    /// Socket dropped or refused; retried with backoff
    #[error("connection error: {0}")]
    Transient(String),

    /// Session token rejected; not retried until a fresh token arrives
    #[error("session rejected: {0}")]
    AuthExpired(String),

    #[error("read timeout after {0:?} without data")]
    ReadTimeout(Duration),
}

impl SlotError {
    pub fn is_auth(&self) -> bool {
        matches!(self, SlotError::AuthExpired(_))
    }
}

/// Error raised by a consumer callback; isolated and counted, never propagated
#[derive(Error, Debug, Clone)]
#[error("consumer error: {0}")]
pub struct ConsumerError(pub String);

impl From<String> for ConsumerError {
    fn from(s: String) -> Self {
        ConsumerError(s)
    }
}

impl From<&str> for ConsumerError {
    fn from(s: &str) -> Self {
        ConsumerError(s.to_string())
    }
}
