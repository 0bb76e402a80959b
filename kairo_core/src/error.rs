use std::fmt;
use std::io;

/// Coarse error classification used by [`FailureValue`](crate::failure::FailureValue)
/// matching (`check` / `trap`).
///
/// Kinds form a small widening hierarchy: a `ConnectionDone` failure also
/// *is* a `ConnectionClosed` one, the way a subclass matches its parent.
/// See [`ErrorKind::widens_to`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Peer closed the connection cleanly.
    ConnectionDone,
    /// The transport broke underneath us (reset, broken pipe, ...).
    ConnectionLost,
    /// The connection was torn down locally without flushing.
    ConnectionAborted,
    /// Umbrella kind matched by both clean and unclean closes.
    ConnectionClosed,
    ConnectionRefused,
    Timeout,
    AddressInUse,
    /// Caller misuse: double fire, cancel after fire, second producer, ...
    UserError,
    AlreadyCalled,
    AlreadyCancelled,
    NotConnecting,
    /// Wire framing invariant broken.
    ProtocolViolation,
    /// The connection has switched protocols and refuses framed traffic.
    ProtocolSwitched,
    /// No responder registered for a received command.
    UnhandledResponder,
    /// An error transported across the framed protocol.
    RemoteError,
    ResolutionError,
    Unknown,
}

impl ErrorKind {
    /// The kind this one widens to, if any.
    pub fn widens_to(self) -> Option<ErrorKind> {
        match self {
            ErrorKind::ConnectionDone => Some(ErrorKind::ConnectionClosed),
            ErrorKind::ConnectionLost => Some(ErrorKind::ConnectionClosed),
            ErrorKind::ConnectionAborted => Some(ErrorKind::ConnectionLost),
            ErrorKind::AlreadyCalled => Some(ErrorKind::UserError),
            ErrorKind::AlreadyCancelled => Some(ErrorKind::UserError),
            ErrorKind::NotConnecting => Some(ErrorKind::UserError),
            ErrorKind::ProtocolSwitched => Some(ErrorKind::UserError),
            ErrorKind::UnhandledResponder => Some(ErrorKind::RemoteError),
            _ => None,
        }
    }

    /// Whether this kind is, or widens to, `other`.
    pub fn is(self, other: ErrorKind) -> bool {
        let mut cur = Some(self);
        while let Some(k) = cur {
            if k == other {
                return true;
            }
            cur = k.widens_to();
        }
        false
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Framework error values. Each variant carries its [`ErrorKind`] tag.
#[derive(Debug)]
pub enum KairoError {
    ConnectionDone,
    ConnectionLost(String),
    ConnectionAborted,
    ConnectionRefused,
    Timeout,
    AddressInUse(String),
    IoError(io::Error),

    AlreadyCalled,
    AlreadyCancelled,
    NotConnecting,
    UserAborted,
    ProducerAlreadyRegistered,
    NestedReactorCall,
    ReactorNotRunning,
    ReactorNotRestartable,
    UnknownTrigger,
    TlsAlreadyStarted,

    ProtocolViolation(String),
    ProtocolSwitched,
    InvalidSignature(String),
    UnhandledCommand(String),
    RemoteError { code: String, description: String, fatal: bool },
    HostResolutionFailed(String),

    Other(String),
}

impl KairoError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ConnectionDone => ErrorKind::ConnectionDone,
            Self::ConnectionLost(_) => ErrorKind::ConnectionLost,
            Self::ConnectionAborted => ErrorKind::ConnectionAborted,
            Self::ConnectionRefused => ErrorKind::ConnectionRefused,
            Self::Timeout => ErrorKind::Timeout,
            Self::AddressInUse(_) => ErrorKind::AddressInUse,
            Self::IoError(_) => ErrorKind::ConnectionLost,

            Self::AlreadyCalled => ErrorKind::AlreadyCalled,
            Self::AlreadyCancelled => ErrorKind::AlreadyCancelled,
            Self::NotConnecting => ErrorKind::NotConnecting,
            Self::UserAborted => ErrorKind::UserError,
            Self::ProducerAlreadyRegistered => ErrorKind::UserError,
            Self::NestedReactorCall => ErrorKind::UserError,
            Self::ReactorNotRunning => ErrorKind::UserError,
            Self::ReactorNotRestartable => ErrorKind::UserError,
            Self::UnknownTrigger => ErrorKind::UserError,
            Self::TlsAlreadyStarted => ErrorKind::UserError,

            Self::ProtocolViolation(_) => ErrorKind::ProtocolViolation,
            Self::ProtocolSwitched => ErrorKind::ProtocolSwitched,
            Self::InvalidSignature(_) => ErrorKind::UserError,
            Self::UnhandledCommand(_) => ErrorKind::UnhandledResponder,
            Self::RemoteError { .. } => ErrorKind::RemoteError,
            Self::HostResolutionFailed(_) => ErrorKind::ResolutionError,

            Self::Other(_) => ErrorKind::Unknown,
        }
    }
}

impl fmt::Display for KairoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionDone => write!(f, "Connection was closed cleanly"),
            Self::ConnectionLost(why) => write!(f, "Connection to the other side was lost: {}", why),
            Self::ConnectionAborted => write!(f, "Connection was aborted locally"),
            Self::ConnectionRefused => write!(f, "Connection refused"),
            Self::Timeout => write!(f, "Operation timed out"),
            Self::AddressInUse(addr) => write!(f, "Couldn't listen, address in use: {}", addr),
            Self::IoError(err) => write!(f, "I/O error: {}", err),

            Self::AlreadyCalled => write!(f, "Already called"),
            Self::AlreadyCancelled => write!(f, "Already cancelled"),
            Self::NotConnecting => write!(f, "Not currently connecting"),
            Self::UserAborted => write!(f, "Connection cancelled on user request"),
            Self::ProducerAlreadyRegistered => write!(f, "A producer is already registered"),
            Self::NestedReactorCall => write!(f, "Nested call into a running reactor"),
            Self::ReactorNotRunning => write!(f, "Can't stop a reactor that isn't running"),
            Self::ReactorNotRestartable => write!(f, "Reactors cannot be restarted"),
            Self::UnknownTrigger => write!(f, "No such system event trigger"),
            Self::TlsAlreadyStarted => write!(f, "TLS may only be started once per connection"),

            Self::ProtocolViolation(why) => write!(f, "Protocol violation: {}", why),
            Self::ProtocolSwitched => {
                write!(f, "This connection has switched protocols: no framed traffic allowed")
            }
            Self::InvalidSignature(what) => write!(f, "Invalid command signature: {}", what),
            Self::UnhandledCommand(cmd) => write!(f, "Unhandled command: {}", cmd),
            Self::RemoteError { code, description, .. } => {
                write!(f, "Remote error Code<{}>: {}", code, description)
            }
            Self::HostResolutionFailed(h) => write!(f, "Failed to resolve host: {}", h),

            Self::Other(why) => write!(f, "{}", why),
        }
    }
}

impl std::error::Error for KairoError {}

impl From<io::Error> for KairoError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => Self::ConnectionRefused,
            io::ErrorKind::AddrInUse => Self::AddressInUse(err.to_string()),
            io::ErrorKind::TimedOut => Self::Timeout,
            io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe => {
                Self::ConnectionLost(err.to_string())
            }
            _ => Self::IoError(err),
        }
    }
}

pub type Result<T> = std::result::Result<T, KairoError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn widening_is_transitive() {
        assert!(ErrorKind::ConnectionAborted.is(ErrorKind::ConnectionLost));
        assert!(ErrorKind::ConnectionAborted.is(ErrorKind::ConnectionClosed));
        assert!(ErrorKind::ConnectionDone.is(ErrorKind::ConnectionClosed));
        assert!(!ErrorKind::ConnectionDone.is(ErrorKind::ConnectionLost));
        assert!(ErrorKind::AlreadyCalled.is(ErrorKind::UserError));
    }

    #[test]
    fn io_errors_map_to_taxonomy() {
        let refused = KairoError::from(io::Error::from(io::ErrorKind::ConnectionRefused));
        assert_eq!(refused.kind(), ErrorKind::ConnectionRefused);
        let reset = KairoError::from(io::Error::from(io::ErrorKind::ConnectionReset));
        assert_eq!(reset.kind(), ErrorKind::ConnectionLost);
    }
}
