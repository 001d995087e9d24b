use crate::ident::ObjectId;
use std::io;

pub type RemotingResult<T> = Result<T, RemotingError>;

/// Well-known fault type names used to carry error kinds across the wire.
pub const FAULT_UNSUPPORTED: &str = "tether.UnsupportedOperation";
pub const FAULT_NOT_FOUND: &str = "tether.InstanceNotFound";

#[derive(Debug, PartialEq)]
pub enum RemotingError {
    /// Unexpected frame, out-of-sync stream or bad sequence. Fatal to the link.
    Protocol(String),
    /// The operation cannot be remoted (unknown type, unresolvable method).
    Unsupported(String),
    /// The target identifier is unknown on the peer.
    InstanceNotFound(ObjectId),
    /// The invoked method failed on the peer; kind and message are preserved.
    Remote(RemoteFault),
    /// The link terminator fired while the call was outstanding.
    LinkDown,
    /// Strict registration found a different object under an existing id.
    DuplicateRegistration(ObjectId),
    /// The per-process peer table is full.
    TooManyPeers,
    Serialization(String),
    Io(io::ErrorKind),
}

impl From<io::Error> for RemotingError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        RemotingError::Io(io_error.kind())
    }
}

/// A fault raised by the remote side of a call. Travels in `ExceptionReturn`
/// frames and never affects the link itself.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteFault {
    pub exception_type: String,
    pub message: String,
    pub payload: Vec<u8>,
}

impl RemoteFault {
    #[inline]
    pub fn new<T: Into<String>, M: Into<String>>(exception_type: T, message: M) -> RemoteFault {
        RemoteFault {
            exception_type: exception_type.into(),
            message: message.into(),
            payload: Vec::new(),
        }
    }

    #[inline]
    pub fn unsupported<M: Into<String>>(message: M) -> RemoteFault {
        RemoteFault::new(FAULT_UNSUPPORTED, message)
    }

    #[inline]
    pub fn not_found(id: &ObjectId) -> RemoteFault {
        RemoteFault::new(FAULT_NOT_FOUND, id.as_str())
    }

    /// Fold a decoded fault back into the error kind it was derived from.
    pub fn into_error(self) -> RemotingError {
        match self.exception_type.as_str() {
            FAULT_UNSUPPORTED => RemotingError::Unsupported(self.message),
            FAULT_NOT_FOUND => RemotingError::InstanceNotFound(ObjectId::from_string(self.message)),
            _ => RemotingError::Remote(self),
        }
    }
}

impl From<RemotingError> for RemoteFault {
    fn from(err: RemotingError) -> RemoteFault {
        match err {
            RemotingError::Remote(fault) => fault,
            RemotingError::Unsupported(message) => RemoteFault::unsupported(message),
            RemotingError::InstanceNotFound(id) => RemoteFault::not_found(&id),
            other => RemoteFault::new("tether.RemotingError", format!("{:?}", other)),
        }
    }
}
