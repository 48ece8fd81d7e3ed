use std::io;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use super::protocol::JoinDenyReason;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("datagram of {0} bytes is shorter than a packet header")]
    TruncatedHeader(usize),
    #[error("datagram of {0} bytes exceeds the packet MTU")]
    Oversized(usize),
    #[error("message runs past the end of the packet")]
    TruncatedMessage,
    #[error("unknown message index {0}")]
    UnknownMessage(u8),
    #[error("message of {0} bytes can never fit in a packet")]
    MessageTooLarge(usize),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("message definition '{0}' is already registered")]
    DuplicateName(String),
    #[error("message index {0} is already taken by a fixed definition")]
    IndexInUse(u8),
    #[error("message index {0} is reserved")]
    ReservedIndex(u8),
    #[error("message registry is full")]
    Full,
}

#[derive(Debug, Error, Clone)]
pub enum SessionError {
    #[error("failed to bind a socket starting at port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: Arc<io::Error>,
    },
    #[error("join denied: {0}")]
    JoinDenied(JoinDenyReason),
    #[error("join timed out after {0:?}")]
    JoinTimeout(Duration),
    #[error("connection to host lost")]
    HostLost,
    #[error("session is already active")]
    AlreadyActive,
    #[error("cannot resolve host address '{0}'")]
    InvalidAddress(String),
}
