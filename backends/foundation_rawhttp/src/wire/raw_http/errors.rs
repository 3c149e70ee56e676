use std::io;

/// Failures while parsing HTTP/1.x messages off the wire.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("invalid HTTP version token: {0:?}")]
    InvalidVersion(String),

    #[error("malformed status line: {0:?}")]
    InvalidStatusLine(String),

    #[error("malformed request line: {0:?}")]
    InvalidRequestLine(String),

    #[error("header line exceeds {limit} bytes")]
    HeaderLineTooLong { limit: usize },

    #[error("header block exceeds {limit} bytes")]
    HeadersTooLarge { limit: usize },

    #[error("header block exceeds {limit} lines")]
    TooManyHeaders { limit: usize },

    #[error("connection closed before the message head was complete")]
    UnexpectedEof,

    #[error("I/O error while reading message: {0}")]
    Io(#[from] io::Error),
}

impl WireError {
    /// True when the failure came from the socket rather than the bytes.
    #[must_use]
    pub fn is_io(&self) -> bool {
        matches!(self, Self::Io(_) | Self::UnexpectedEof)
    }
}

pub type WireResult<T> = std::result::Result<T, WireError>;
