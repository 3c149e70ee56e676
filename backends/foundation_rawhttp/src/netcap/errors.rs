use derive_more::From;

use std::io;

pub type TlsResult<T> = std::result::Result<T, TlsError>;

/// Failures while setting up or running a TLS session over a socket.
#[derive(From, Debug)]
pub enum TlsError {
    /// TLS support was compiled out.
    #[from(ignore)]
    NotSupported,

    /// The client configuration could not be built.
    #[from(ignore)]
    ConnectorCreation(String),

    /// The server name used for SNI is not a valid DNS name or IP.
    #[from(ignore)]
    InvalidServerName(String),

    /// The handshake did not complete.
    #[from(ignore)]
    Handshake(String),

    #[from(ignore)]
    IO(io::Error),
}

impl Eq for TlsError {}

impl PartialEq for TlsError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::IO(m1), Self::IO(m2)) => m1.kind() == m2.kind(),
            (Self::NotSupported, Self::NotSupported) => true,
            (Self::ConnectorCreation(m1), Self::ConnectorCreation(m2))
            | (Self::InvalidServerName(m1), Self::InvalidServerName(m2))
            | (Self::Handshake(m1), Self::Handshake(m2)) => m1 == m2,
            _ => false,
        }
    }
}

impl From<io::Error> for TlsError {
    fn from(value: io::Error) -> Self {
        TlsError::IO(value)
    }
}

impl std::error::Error for TlsError {}

impl core::fmt::Display for TlsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotSupported => write!(f, "TLS support is not enabled"),
            Self::ConnectorCreation(msg) => write!(f, "failed to build TLS connector: {msg}"),
            Self::InvalidServerName(name) => write!(f, "invalid TLS server name: {name}"),
            Self::Handshake(msg) => write!(f, "TLS handshake failed: {msg}"),
            Self::IO(err) => write!(f, "TLS I/O error: {err}"),
        }
    }
}
