//! Client error type

use crate::codec::CodecError;
use crate::connection::Status;
use thiserror::Error;

/// Errors returned by the client.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The connection never became ready. The server may be exiled.
    #[error("{reason}")]
    Connect { server: String, reason: String },

    /// The connection shut down with this command still queued.
    #[error("{0}")]
    Shutdown(String),

    /// The server answered with an error reply.
    #[error("{}", tokens.join(" "))]
    Reply { tokens: Vec<String> },

    #[error("No more valid servers left")]
    NoServersLeft,

    #[error("invalid server address: {0}")]
    InvalidAddress(String),

    #[error("connection {id} is not ready ({status})")]
    NotReady { id: u64, status: Status },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("codec error: {0}")]
    Codec(String),
}

impl Error {
    /// True for failures before the connection was established.
    pub fn is_connecting(&self) -> bool {
        matches!(self, Error::Connect { .. })
    }

    /// True for an error reply whose first token is `keyword`.
    pub fn is_reply(&self, keyword: &str) -> bool {
        match self {
            Error::Reply { tokens } => tokens.first().is_some_and(|t| t == keyword),
            _ => false,
        }
    }
}

impl From<CodecError> for Error {
    fn from(e: CodecError) -> Self {
        Error::Codec(e.to_string())
    }
}

/// Result type for client operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_display() {
        let err = Error::Reply {
            tokens: vec!["CLIENT_ERROR".into(), "bad".into(), "format".into()],
        };
        assert_eq!(err.to_string(), "CLIENT_ERROR bad format");
        assert!(err.is_reply("CLIENT_ERROR"));
        assert!(!err.is_reply("ERROR"));
    }

    #[test]
    fn test_connect_is_tagged() {
        let err = Error::Connect {
            server: "localhost:1".into(),
            reason: "connect timeout".into(),
        };
        assert!(err.is_connecting());
        assert_eq!(err.to_string(), "connect timeout");
        assert!(!Error::Shutdown("Command timeout".into()).is_connecting());
    }
}
