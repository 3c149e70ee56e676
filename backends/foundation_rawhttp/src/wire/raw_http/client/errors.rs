use derive_more::From;
use std::io;

use crate::netcap::TlsError;
use crate::wire::raw_http::{Request, WireError};

/// DNS resolution errors.
///
/// These errors occur while turning a hostname into dialable addresses.
#[derive(From, Debug, Clone, PartialEq, Eq)]
pub enum DnsError {
    /// The resolver failed for the given hostname.
    #[from(ignore)]
    ResolutionFailed(String),

    /// Invalid hostname or `host:port` string.
    #[from(ignore)]
    InvalidHost(String),

    /// Resolution succeeded but left no usable address (after the IPv4
    /// filter when dual stack is off).
    #[from(ignore)]
    NoAddressesFound(String),

    /// The deadline passed while waiting for the resolver.
    #[from(ignore)]
    Timeout(String),

    /// I/O error during DNS resolution.
    #[from(ignore)]
    IoError(String),
}

impl From<io::Error> for DnsError {
    fn from(err: io::Error) -> Self {
        DnsError::IoError(err.to_string())
    }
}

impl std::error::Error for DnsError {}

impl core::fmt::Display for DnsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ResolutionFailed(host) => write!(f, "DNS resolution failed for host: {host}"),
            Self::InvalidHost(host) => write!(f, "Invalid hostname: {host}"),
            Self::NoAddressesFound(host) => write!(f, "No addresses found for host: {host}"),
            Self::Timeout(host) => write!(f, "DNS resolution timed out for host: {host}"),
            Self::IoError(err) => write!(f, "I/O error during DNS resolution: {err}"),
        }
    }
}

/// Failures while negotiating a proxy tunnel.
#[derive(From, Debug)]
pub enum ProxyError {
    /// Proxy URL scheme other than http, socks5 or socks5h.
    #[from(ignore)]
    UnsupportedScheme(String),

    #[from(ignore)]
    InvalidUrl(String),

    /// The proxy itself could not be reached.
    #[from(ignore)]
    Connect { proxy: String, reason: String },

    /// HTTP CONNECT answered with something other than 200.
    #[from(ignore)]
    UnexpectedStatus { proxy: String, status: u16 },

    /// The proxy answered CONNECT with bytes that do not parse.
    #[from(ignore)]
    InvalidResponse(String),

    /// SOCKS5 negotiation failed at `stage`.
    #[from(ignore)]
    Socks5 { stage: &'static str, reason: String },

    #[from]
    Io(io::Error),
}

impl std::error::Error for ProxyError {}

impl core::fmt::Display for ProxyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnsupportedScheme(scheme) => write!(f, "unsupported proxy scheme: {scheme}"),
            Self::InvalidUrl(url) => write!(f, "invalid proxy URL: {url}"),
            Self::Connect { proxy, reason } => {
                write!(f, "failed to connect to proxy {proxy}: {reason}")
            }
            Self::UnexpectedStatus { proxy, status } => {
                write!(f, "proxy {proxy} refused CONNECT with status {status}")
            }
            Self::InvalidResponse(reason) => write!(f, "malformed proxy response: {reason}"),
            Self::Socks5 { stage, reason } => write!(f, "SOCKS5 {stage} failed: {reason}"),
            Self::Io(err) => write!(f, "proxy I/O error: {err}"),
        }
    }
}

/// Errors raised while loading client configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Raw HTTP client errors.
#[derive(From, Debug)]
pub enum RawHttpError {
    /// No connection could be made before the dial deadline.
    #[from(ignore)]
    DialTimeout(String),

    #[from]
    Dns(DnsError),

    /// Every resolved address refused or failed; carries the last error.
    #[from(ignore)]
    ConnectFailed(String),

    /// TLS handshake failure, distinct from dial failures.
    #[from]
    TlsHandshake(TlsError),

    #[from]
    Proxy(ProxyError),

    /// The peer sent bytes that do not parse as an HTTP response.
    #[from]
    Protocol(WireError),

    #[from(ignore)]
    WriteFailed(io::Error),

    #[from(ignore)]
    ReadFailed(io::Error),

    /// The call's deadline passed at a blocking point.
    #[from(ignore)]
    DeadlineExceeded(&'static str),

    /// The pipelining client was closed before the request was sent.
    #[from(ignore)]
    PipelineShutdown,

    /// The pipelined connection carrying the request failed.
    #[from(ignore)]
    ConnectionBroken(String),

    #[from(ignore)]
    InvalidUrl(String),

    #[from]
    Config(ConfigError),
}

impl RawHttpError {
    /// True for every flavour of deadline expiry.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::DialTimeout(_) | Self::DeadlineExceeded(_) | Self::Dns(DnsError::Timeout(_)) => {
                true
            }
            Self::WriteFailed(err) | Self::ReadFailed(err) => {
                matches!(err.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock)
            }
            Self::Protocol(WireError::Io(err)) | Self::Proxy(ProxyError::Io(err)) => {
                matches!(err.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock)
            }
            Self::TlsHandshake(TlsError::IO(err)) => err.kind() == io::ErrorKind::TimedOut,
            _ => false,
        }
    }

    /// Maps a write-side I/O error.
    #[must_use]
    pub fn write(err: io::Error) -> Self {
        Self::WriteFailed(err)
    }

    /// Maps a read-side I/O error.
    #[must_use]
    pub fn read(err: io::Error) -> Self {
        Self::ReadFailed(err)
    }
}

impl std::error::Error for RawHttpError {}

impl core::fmt::Display for RawHttpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DialTimeout(addr) => write!(f, "dial timed out: {addr}"),
            Self::Dns(err) => write!(f, "{err}"),
            Self::ConnectFailed(reason) => write!(f, "connection failed: {reason}"),
            Self::TlsHandshake(err) => write!(f, "{err}"),
            Self::Proxy(err) => write!(f, "{err}"),
            Self::Protocol(err) => write!(f, "protocol error: {err}"),
            Self::WriteFailed(err) => write!(f, "failed to write request: {err}"),
            Self::ReadFailed(err) => write!(f, "failed to read response: {err}"),
            Self::DeadlineExceeded(stage) => write!(f, "deadline exceeded while {stage}"),
            Self::PipelineShutdown => write!(f, "pipeline client is shut down"),
            Self::ConnectionBroken(reason) => write!(f, "pipelined connection broken: {reason}"),
            Self::InvalidUrl(url) => write!(f, "invalid URL: {url}"),
            Self::Config(err) => write!(f, "{err}"),
        }
    }
}

pub type RawHttpResult<T> = std::result::Result<T, RawHttpError>;

/// A failed exchange together with the request that was built for it, so
/// callers can see exactly what was (or would have been) sent.
#[derive(Debug)]
pub struct ExchangeError {
    pub request: Option<Request>,
    pub error: RawHttpError,
}

impl ExchangeError {
    #[must_use]
    pub fn new(request: Option<Request>, error: RawHttpError) -> Self {
        Self { request, error }
    }
}

impl From<RawHttpError> for ExchangeError {
    fn from(error: RawHttpError) -> Self {
        Self {
            request: None,
            error,
        }
    }
}

impl std::error::Error for ExchangeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

impl core::fmt::Display for ExchangeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.request {
            Some(request) => write!(
                f,
                "{} {} failed: {}",
                request.method,
                request.target(),
                self.error
            ),
            None => write!(f, "{}", self.error),
        }
    }
}
