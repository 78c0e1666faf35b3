use thiserror::Error;

/// Crate-wide error type.
///
/// Four kinds are distinguished because they propagate differently:
/// protocol errors are answered with a JSON-RPC error envelope and the
/// session survives; transport errors abort pending exchanges and may
/// close the session; semantic errors surface to the caller as tool-call
/// failures; fatal errors terminate the session without retry.
#[derive(Debug, Error)]
pub enum Error {
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("{0}")]
    Semantic(String),

    #[error("fatal: {0}")]
    Fatal(String),

    /// An error envelope returned by the peer.
    #[error("error from server: {message}")]
    Rpc { code: i64, message: String },

    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    pub fn protocol(message: impl std::fmt::Display) -> Self {
        Error::Protocol(message.to_string())
    }

    pub fn transport(message: impl std::fmt::Display) -> Self {
        Error::Transport(message.to_string())
    }

    pub fn semantic(message: impl std::fmt::Display) -> Self {
        Error::Semantic(message.to_string())
    }

    pub fn fatal(message: impl std::fmt::Display) -> Self {
        Error::Fatal(message.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Protocol(format!("json: {err}"))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Transport(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Transport(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
