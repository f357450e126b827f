//! Error taxonomy for sessions, registry and router.

use crate::registry::Topic;
use crate::router::Destination;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Read/write failure or timeout on the hub or a peer socket.
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    /// Too many subscribers on one topic. Treated as a programming fault by callers.
    #[error("topic {topic} already has {limit} subscribers")]
    CapacityExceeded { topic: Topic, limit: usize },
    #[error("destination {0} is closed")]
    DestinationClosed(Destination),
    /// Malformed length field or unexpected command sequence.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("no suitable local IPv4 address for active mode")]
    NoSuitableAddress,
    #[error("already connected to the hub")]
    AlreadyConnected,
    #[error("active mode is not running")]
    NotActive,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<sparrow_core::CommandError> for Error {
    fn from(e: sparrow_core::CommandError) -> Self {
        Error::ProtocolViolation(e.to_string())
    }
}

impl From<sparrow_core::LockError> for Error {
    fn from(e: sparrow_core::LockError) -> Self {
        Error::ProtocolViolation(e.to_string())
    }
}

impl From<sparrow_core::LineEncodeError> for Error {
    fn from(e: sparrow_core::LineEncodeError) -> Self {
        Error::ProtocolViolation(e.to_string())
    }
}
