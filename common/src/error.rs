//! Error taxonomy shared by every rgrid crate.
//!
//! The variants mirror how a failure should be handled by the caller:
//!
//! - [`Error::Connection`] - the socket could not be opened or died; the session is gone
//! - [`Error::Authentication`] - the server rejected the credentials; retry with new ones
//! - [`Error::Protocol`] - malformed frame or unexpected directive; the connection is unusable
//! - [`Error::Transfer`] - local I/O failure or byte-count mismatch while moving file data
//! - [`Error::Server`] - the server answered a well-formed request with a negative status
//! - [`Error::InvalidArgument`] - the request was rejected before anything was sent

/// Result alias used by the library crates.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("connection error: {context}")]
    Connection {
        context: String,
        #[source]
        source: Option<std::io::Error>,
    },
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("transfer error: {context}")]
    Transfer {
        context: String,
        #[source]
        source: Option<std::io::Error>,
    },
    #[error("server returned error {code}: {message}")]
    Server { code: i32, message: String },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl Error {
    pub fn connection(context: impl Into<String>, source: std::io::Error) -> Self {
        Error::Connection {
            context: context.into(),
            source: Some(source),
        }
    }

    /// Connection failure that did not originate from an I/O error, e.g. use after close.
    pub fn connection_closed(context: impl Into<String>) -> Self {
        Error::Connection {
            context: context.into(),
            source: None,
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Error::Protocol(message.into())
    }

    pub fn transfer(context: impl Into<String>) -> Self {
        Error::Transfer {
            context: context.into(),
            source: None,
        }
    }

    pub fn transfer_io(context: impl Into<String>, source: std::io::Error) -> Self {
        Error::Transfer {
            context: context.into(),
            source: Some(source),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Error::InvalidArgument(message.into())
    }

    /// Returns true if the caller may retry on the same session (or with new credentials).
    ///
    /// Connection and protocol errors leave the connection in an unknown state and it must be
    /// discarded.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Authentication(_) | Error::Server { .. } | Error::InvalidArgument(_)
        )
    }

    /// Server status code, if the error came from a server reply.
    pub fn server_code(&self) -> Option<i32> {
        match self {
            Error::Server { code, .. } => Some(*code),
            _ => None,
        }
    }
}
