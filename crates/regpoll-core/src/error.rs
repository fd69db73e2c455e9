use crate::register::RegisterKey;
use std::time::Duration;
use thiserror::Error;

/// Transport-level cause behind a failed connect, read or write.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Fault {
    #[error("i/o error: {0}")]
    Io(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("device exception: {0}")]
    Exception(String),

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("device unreachable: {0}")]
    Unreachable(String),

    #[error("session already released")]
    Closed,
}

impl From<std::io::Error> for Fault {
    fn from(err: std::io::Error) -> Self {
        Fault::Io(err.to_string())
    }
}

/// A session to the device could not be opened.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot connect to {endpoint}: {cause}")]
pub struct ConnectionError {
    pub endpoint: String,
    pub cause: Fault,
}

/// A single register read failed or timed out.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("read of register {key} failed: {cause}")]
pub struct ReadError {
    pub key: RegisterKey,
    pub cause: Fault,
}

/// A write was not applied. Never retried automatically.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("write to register {key} failed: {cause}")]
pub struct WriteError {
    pub key: RegisterKey,
    pub cause: Fault,
}

/// No data could be produced for a whole cycle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CycleFailed {
    #[error("device unreachable: {0}")]
    Unreachable(ConnectionError),

    #[error("no cached fallback: {0}")]
    NoFallback(ReadError),
}

/// Rejected poll configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("no registers configured")]
    NoRegisters,

    #[error("register {0} is listed more than once")]
    DuplicateRegister(RegisterKey),

    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
}
