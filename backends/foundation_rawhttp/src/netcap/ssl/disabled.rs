//! Stand-ins used when TLS support is compiled out. The stream types are
//! uninhabited, so every `https` dial fails at the connector.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use crate::netcap::{Deadline, TlsError, TlsResult};

#[derive(Clone)]
pub struct RustlsConnector;

impl RustlsConnector {
    /// # Errors
    /// Always [`TlsError::NotSupported`].
    pub fn insecure() -> TlsResult<Self> {
        Err(TlsError::NotSupported)
    }

    /// # Errors
    /// Always [`TlsError::NotSupported`].
    pub fn connect(
        &self,
        _server_name: &str,
        _socket: TcpStream,
        _deadline: Deadline,
    ) -> TlsResult<TlsStream> {
        Err(TlsError::NotSupported)
    }
}

pub enum TlsStream {}

impl TlsStream {
    #[must_use]
    pub fn into_split(self) -> (TlsReadHalf, TlsWriteHalf) {
        match self {}
    }

    #[must_use]
    pub fn socket(&self) -> &TcpStream {
        match *self {}
    }

    /// # Errors
    /// Unreachable.
    pub fn shutdown(&mut self) -> io::Result<()> {
        match *self {}
    }
}

impl Read for TlsStream {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        match *self {}
    }
}

impl Write for TlsStream {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        match *self {}
    }

    fn flush(&mut self) -> io::Result<()> {
        match *self {}
    }
}

pub enum TlsReadHalf {}

impl TlsReadHalf {
    #[must_use]
    pub fn socket(&self) -> &TcpStream {
        match *self {}
    }

    /// # Errors
    /// Unreachable.
    pub fn set_read_timeout(&self, _dur: Option<Duration>) -> io::Result<()> {
        match *self {}
    }

    /// # Errors
    /// Unreachable.
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        match *self {}
    }
}

impl Read for TlsReadHalf {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        match *self {}
    }
}

pub enum TlsWriteHalf {}

impl TlsWriteHalf {
    #[must_use]
    pub fn socket(&self) -> &TcpStream {
        match *self {}
    }

    /// # Errors
    /// Unreachable.
    pub fn set_write_timeout(&self, _dur: Option<Duration>) -> io::Result<()> {
        match *self {}
    }
}

impl Write for TlsWriteHalf {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        match *self {}
    }

    fn flush(&mut self) -> io::Result<()> {
        match *self {}
    }
}
