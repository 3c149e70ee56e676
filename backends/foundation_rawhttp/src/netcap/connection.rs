use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::Duration;

use super::ssl::{TlsReadHalf, TlsStream, TlsWriteHalf};
use super::DeadlineCell;

/// Non-blocking peek: true when the peer closed `socket` or left unread
/// bytes on it.
#[must_use]
pub fn probe_stale(socket: &TcpStream) -> bool {
    if socket.set_nonblocking(true).is_err() {
        return true;
    }

    let mut probe = [0u8; 1];
    let stale = match socket.peek(&mut probe) {
        Err(err) => err.kind() != io::ErrorKind::WouldBlock,
        Ok(_) => true,
    };

    socket.set_nonblocking(false).is_err() || stale
}

/// A live client socket, plain or wrapped in TLS.
pub enum Connection {
    Tcp(TcpStream),
    Tls(TlsStream),
}

impl Connection {
    /// The underlying TCP socket, whatever sits on top of it.
    #[must_use]
    pub fn socket(&self) -> &TcpStream {
        match self {
            Self::Tcp(stream) => stream,
            Self::Tls(stream) => stream.socket(),
        }
    }

    #[must_use]
    pub fn is_tls(&self) -> bool {
        matches!(self, Self::Tls(_))
    }

    /// # Errors
    /// Propagates the socket error.
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.socket().peer_addr()
    }

    /// # Errors
    /// Propagates the socket error.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket().local_addr()
    }

    /// # Errors
    /// Propagates the socket option error.
    pub fn set_read_timeout(&self, dur: Option<Duration>) -> io::Result<()> {
        self.socket().set_read_timeout(dur)
    }

    /// # Errors
    /// Propagates the socket option error.
    pub fn set_write_timeout(&self, dur: Option<Duration>) -> io::Result<()> {
        self.socket().set_write_timeout(dur)
    }

    /// # Errors
    /// Propagates the socket shutdown error.
    pub fn shutdown(&mut self) -> io::Result<()> {
        match self {
            Self::Tcp(stream) => stream.shutdown(Shutdown::Both),
            Self::Tls(stream) => stream.shutdown(),
        }
    }

    /// Checks, without blocking, whether the peer closed the socket or sent
    /// bytes nobody asked for. Either makes the connection unusable for a
    /// new request.
    #[must_use]
    pub fn is_stale(&self) -> bool {
        probe_stale(self.socket())
    }

    /// Splits into halves that can be driven from different threads.
    ///
    /// # Errors
    /// Fails when the socket cannot be duplicated.
    pub fn into_split(self) -> io::Result<(ReadHalf, WriteHalf)> {
        match self {
            Self::Tcp(stream) => {
                let reader = stream.try_clone()?;
                Ok((ReadHalf::Tcp(reader), WriteHalf::Tcp(stream)))
            }
            Self::Tls(stream) => {
                let (reader, writer) = stream.into_split();
                Ok((ReadHalf::Tls(reader), WriteHalf::Tls(writer)))
            }
        }
    }
}

impl core::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = if self.is_tls() { "Tls" } else { "Tcp" };
        f.debug_struct("Connection")
            .field("kind", &kind)
            .field("peer", &self.peer_addr().ok())
            .finish()
    }
}

impl Read for Connection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(stream) => stream.read(buf),
            Self::Tls(stream) => stream.read(buf),
        }
    }
}

impl Write for Connection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(stream) => stream.write(buf),
            Self::Tls(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Tcp(stream) => stream.flush(),
            Self::Tls(stream) => stream.flush(),
        }
    }
}

pub enum ReadHalf {
    Tcp(TcpStream),
    Tls(TlsReadHalf),
}

impl ReadHalf {
    #[must_use]
    pub fn socket(&self) -> &TcpStream {
        match self {
            Self::Tcp(stream) => stream,
            Self::Tls(half) => half.socket(),
        }
    }

    /// # Errors
    /// Propagates the socket option error.
    pub fn set_read_timeout(&self, dur: Option<Duration>) -> io::Result<()> {
        self.socket().set_read_timeout(dur)
    }
}

impl Read for ReadHalf {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(stream) => stream.read(buf),
            Self::Tls(half) => half.read(buf),
        }
    }
}

pub enum WriteHalf {
    Tcp(TcpStream),
    Tls(TlsWriteHalf),
}

impl WriteHalf {
    #[must_use]
    pub fn socket(&self) -> &TcpStream {
        match self {
            Self::Tcp(stream) => stream,
            Self::Tls(half) => half.socket(),
        }
    }

    /// # Errors
    /// Propagates the socket option error.
    pub fn set_write_timeout(&self, dur: Option<Duration>) -> io::Result<()> {
        self.socket().set_write_timeout(dur)
    }

    /// Shuts both directions of the shared socket down, which also wakes a
    /// reader blocked on the other half.
    ///
    /// # Errors
    /// Propagates the socket shutdown error.
    pub fn shutdown(&self) -> io::Result<()> {
        self.socket().shutdown(Shutdown::Both)
    }
}

impl Write for WriteHalf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(stream) => stream.write(buf),
            Self::Tls(half) => half.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Tcp(stream) => stream.flush(),
            Self::Tls(half) => half.flush(),
        }
    }
}

fn timed_out(err: io::Error) -> io::Error {
    if err.kind() == io::ErrorKind::WouldBlock {
        return io::Error::new(io::ErrorKind::TimedOut, "socket deadline exceeded");
    }
    err
}

/// Read half that re-arms the socket timeout from a shared absolute
/// deadline before every read.
pub struct DeadlineReader {
    half: ReadHalf,
    deadline: DeadlineCell,
}

impl DeadlineReader {
    #[must_use]
    pub fn new(half: ReadHalf, deadline: DeadlineCell) -> Self {
        Self { half, deadline }
    }

    #[must_use]
    pub fn get_ref(&self) -> &ReadHalf {
        &self.half
    }
}

impl Read for DeadlineReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.deadline.get().remaining()?;
        self.half.set_read_timeout(remaining)?;
        self.half.read(buf).map_err(timed_out)
    }
}

/// Write half counterpart of [`DeadlineReader`].
pub struct DeadlineWriter {
    half: WriteHalf,
    deadline: DeadlineCell,
}

impl DeadlineWriter {
    #[must_use]
    pub fn new(half: WriteHalf, deadline: DeadlineCell) -> Self {
        Self { half, deadline }
    }

    #[must_use]
    pub fn get_ref(&self) -> &WriteHalf {
        &self.half
    }
}

impl Write for DeadlineWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let remaining = self.deadline.get().remaining()?;
        self.half.set_write_timeout(remaining)?;
        self.half.write(buf).map_err(timed_out)
    }

    fn flush(&mut self) -> io::Result<()> {
        let remaining = self.deadline.get().remaining()?;
        self.half.set_write_timeout(remaining)?;
        self.half.flush().map_err(timed_out)
    }
}
