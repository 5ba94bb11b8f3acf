//! Error taxonomy shared by every layer of the core.
//!
//! Each variant carries enough context (message or target path) for a UI to
//! render a specific message. `Error::kind()` gives the fieldless discriminant.

use serde::Serialize;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("SSH protocol error: {0}")]
    Protocol(String),

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    #[error("Is a directory: {0}")]
    IsADirectory(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Channel limit exceeded: {current}/{max}")]
    ChannelLimitExceeded { current: usize, max: usize },

    #[error("Overloaded: {queued} requests already waiting")]
    Overloaded { queued: usize },

    #[error("Unknown connection: {0}")]
    UnknownConnection(String),

    #[error("Unknown transfer: {0}")]
    UnknownTransfer(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("File too large: {path} ({size} bytes, limit {limit})")]
    TooLarge { path: String, size: u64, limit: u64 },

    #[error("Local I/O error on {path}: {message}")]
    LocalIo { path: String, message: String },

    #[error("Storage error: {0}")]
    Storage(String),
}

/// Fieldless discriminant of [`Error`], used for matching and display routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Network,
    Auth,
    Protocol,
    ConnectionLost,
    NotFound,
    NotADirectory,
    IsADirectory,
    AlreadyExists,
    PermissionDenied,
    ChannelLimitExceeded,
    Overloaded,
    UnknownConnection,
    UnknownTransfer,
    InvalidPath,
    InvalidConfig,
    InvalidState,
    Cancelled,
    TooLarge,
    LocalIo,
    Storage,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Network(_) => ErrorKind::Network,
            Error::Auth(_) => ErrorKind::Auth,
            Error::Protocol(_) => ErrorKind::Protocol,
            Error::ConnectionLost(_) => ErrorKind::ConnectionLost,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::NotADirectory(_) => ErrorKind::NotADirectory,
            Error::IsADirectory(_) => ErrorKind::IsADirectory,
            Error::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Error::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Error::ChannelLimitExceeded { .. } => ErrorKind::ChannelLimitExceeded,
            Error::Overloaded { .. } => ErrorKind::Overloaded,
            Error::UnknownConnection(_) => ErrorKind::UnknownConnection,
            Error::UnknownTransfer(_) => ErrorKind::UnknownTransfer,
            Error::InvalidPath(_) => ErrorKind::InvalidPath,
            Error::InvalidConfig(_) => ErrorKind::InvalidConfig,
            Error::InvalidState(_) => ErrorKind::InvalidState,
            Error::Cancelled(_) => ErrorKind::Cancelled,
            Error::TooLarge { .. } => ErrorKind::TooLarge,
            Error::LocalIo { .. } => ErrorKind::LocalIo,
            Error::Storage(_) => ErrorKind::Storage,
        }
    }

    /// Connection-level failures surface from `connect`/`reconnect`.
    pub fn is_connect_error(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Network | ErrorKind::Auth | ErrorKind::Protocol
        )
    }

    /// Errors a chunked transfer may retry after backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::ConnectionLost
                | ErrorKind::Network
                | ErrorKind::ChannelLimitExceeded
                | ErrorKind::Overloaded
        )
    }

    /// A peer hanging up before the session exists is a network failure,
    /// not a lost connection.
    pub fn during_handshake(self) -> Self {
        match self {
            Error::ConnectionLost(reason) => Error::Network(reason),
            other => other,
        }
    }

    pub fn local_io(path: impl Into<String>, err: std::io::Error) -> Self {
        Error::LocalIo {
            path: path.into(),
            message: err.to_string(),
        }
    }
}

impl From<russh::Error> for Error {
    fn from(err: russh::Error) -> Self {
        match err {
            russh::Error::IO(e) => Error::Network(e.to_string()),
            russh::Error::Disconnect => Error::ConnectionLost("disconnected by peer".to_string()),
            other => Error::Protocol(other.to_string()),
        }
    }
}

impl From<russh::keys::Error> for Error {
    fn from(err: russh::keys::Error) -> Self {
        Error::Auth(format!("private key rejected: {}", err))
    }
}

// Serialized as the display string plus kind, for UI collaborators.
impl Serialize for Error {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;
        let mut state = serializer.serialize_struct("Error", 2)?;
        state.serialize_field("kind", &self.kind())?;
        state.serialize_field("message", &self.to_string())?;
        state.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_matches_variant() {
        assert_eq!(Error::NotFound("/a".into()).kind(), ErrorKind::NotFound);
        assert_eq!(
            Error::Overloaded { queued: 3 }.kind(),
            ErrorKind::Overloaded
        );
        assert_eq!(
            Error::ChannelLimitExceeded { current: 4, max: 4 }.kind(),
            ErrorKind::ChannelLimitExceeded
        );
    }

    #[test]
    fn test_connect_errors() {
        assert!(Error::Auth("bad".into()).is_connect_error());
        assert!(Error::Network("timeout".into()).is_connect_error());
        assert!(!Error::NotFound("/x".into()).is_connect_error());
    }

    #[test]
    fn test_handshake_failures_stay_connect_errors() {
        let hangup = Error::from(russh::Error::Disconnect).during_handshake();
        assert_eq!(hangup.kind(), ErrorKind::Network);

        let reset = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        let io = Error::from(russh::Error::IO(reset)).during_handshake();
        assert_eq!(io.kind(), ErrorKind::Network);

        let garbled = Error::from(russh::Error::Inconsistent).during_handshake();
        assert_eq!(garbled.kind(), ErrorKind::Protocol);

        for err in [hangup, io, garbled] {
            assert!(err.is_connect_error());
        }
        assert_eq!(
            Error::Auth("rejected".into()).during_handshake().kind(),
            ErrorKind::Auth
        );
        assert_eq!(
            Error::from(russh::Error::Disconnect).kind(),
            ErrorKind::ConnectionLost
        );
    }

    #[test]
    fn test_transient_errors() {
        assert!(Error::ConnectionLost("eof".into()).is_transient());
        assert!(!Error::PermissionDenied("/etc".into()).is_transient());
        assert!(!Error::Cancelled("t1".into()).is_transient());
    }

    #[test]
    fn test_serialize_includes_kind() {
        let json = serde_json::to_value(Error::AlreadyExists("/tmp/a".into())).unwrap();
        assert_eq!(json["kind"], "already_exists");
        assert_eq!(json["message"], "Already exists: /tmp/a");
    }
}
