use std::fmt;
use std::io;

/// Outcome plumbing for non-blocking socket operations. `Wait` means the
/// operation would block and should be retried on the next readiness event,
/// `Closed` means the peer is gone, `Fatal` is everything else.
#[derive(Debug, Eq, PartialEq)]
pub enum NetError {
    Wait,
    Closed,
    Fatal(io::ErrorKind),
}

impl NetError {
    /// True for errors that end the connection.
    #[inline]
    pub fn is_fatal(&self) -> bool {
        !matches!(self, NetError::Wait)
    }
}

impl From<io::Error> for NetError {
    #[inline]
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock => NetError::Wait,
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => NetError::Closed,
            kind => NetError::Fatal(kind),
        }
    }
}

impl fmt::Display for NetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetError::Wait => write!(f, "operation would block"),
            NetError::Closed => write!(f, "peer disconnected"),
            NetError::Fatal(kind) => write!(f, "socket error: {:?}", kind),
        }
    }
}

pub type NetResult<T> = Result<T, NetError>;
