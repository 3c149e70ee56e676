//! Client side TLS over a blocking `TcpStream` using rustls.
//!
//! Certificates are never validated: the connector exists to talk to
//! arbitrary endpoints, self-signed or otherwise. Handshake signatures are
//! still checked so a broken peer surfaces as a handshake failure.
//!
//! A session can be split into a read half and a write half that run on
//! different threads. Both halves own a clone of the socket and share the
//! rustls session behind a mutex that is only held while moving bytes in
//! or out of the session, never while blocked on the socket for reading.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, ClientConnection, DigitallySignedStruct, SignatureScheme};

use crate::netcap::{Deadline, TlsError, TlsResult};

const TLS_READ_CHUNK: usize = 16 * 1024;

type SharedSession = Arc<Mutex<ClientConnection>>;

fn lock_session(session: &SharedSession) -> io::Result<MutexGuard<'_, ClientConnection>> {
    session
        .lock()
        .map_err(|_| io::Error::other("TLS session lock poisoned"))
}

#[derive(Debug)]
struct AcceptAnyServerCert(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

/// Builds TLS client sessions that accept any server certificate.
#[derive(Clone)]
pub struct RustlsConnector(Arc<ClientConfig>);

impl RustlsConnector {
    /// # Errors
    /// Returns [`TlsError::ConnectorCreation`] when the ring provider rejects
    /// the default protocol versions.
    pub fn insecure() -> TlsResult<Self> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|err| TlsError::ConnectorCreation(err.to_string()))?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert(provider)))
            .with_no_client_auth();
        Ok(Self(Arc::new(config)))
    }

    /// Runs the client handshake over `socket`, sending `server_name` as SNI
    /// (IP literals are accepted and sent without SNI).
    ///
    /// # Errors
    /// [`TlsError::InvalidServerName`] for names rustls cannot represent,
    /// [`TlsError::IO`] with `TimedOut` when the deadline passes and
    /// [`TlsError::Handshake`] for protocol failures.
    pub fn connect(
        &self,
        server_name: &str,
        mut socket: TcpStream,
        deadline: Deadline,
    ) -> TlsResult<TlsStream> {
        let name = ServerName::try_from(server_name.to_owned())
            .map_err(|_| TlsError::InvalidServerName(server_name.to_owned()))?;
        let mut session = ClientConnection::new(self.0.clone(), name)
            .map_err(|err| TlsError::ConnectorCreation(err.to_string()))?;

        while session.is_handshaking() {
            let remaining = deadline.remaining()?;
            socket.set_read_timeout(remaining)?;
            socket.set_write_timeout(remaining)?;

            match session.complete_io(&mut socket) {
                Ok((0, 0)) if session.is_handshaking() => {
                    return Err(TlsError::Handshake(
                        "connection closed during handshake".into(),
                    ));
                }
                Ok(_) => {}
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
                    ) =>
                {
                    return Err(TlsError::IO(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "TLS handshake timed out",
                    )));
                }
                Err(err) => return Err(TlsError::Handshake(err.to_string())),
            }
        }

        socket.set_read_timeout(None)?;
        socket.set_write_timeout(None)?;

        tracing::debug!(
            "TLS session established with {server_name} ({:?})",
            session.protocol_version()
        );

        let session = Arc::new(Mutex::new(session));
        let read_socket = socket.try_clone()?;
        Ok(TlsStream {
            reader: TlsReadHalf {
                session: session.clone(),
                socket: read_socket,
            },
            writer: TlsWriteHalf { session, socket },
        })
    }
}

/// A TLS session over TCP, usable directly or split into halves.
pub struct TlsStream {
    reader: TlsReadHalf,
    writer: TlsWriteHalf,
}

impl TlsStream {
    #[must_use]
    pub fn into_split(self) -> (TlsReadHalf, TlsWriteHalf) {
        (self.reader, self.writer)
    }

    #[must_use]
    pub fn socket(&self) -> &TcpStream {
        &self.writer.socket
    }

    /// Sends close_notify (best effort) and shuts the socket down.
    ///
    /// # Errors
    /// Propagates the socket shutdown error.
    pub fn shutdown(&mut self) -> io::Result<()> {
        if let Ok(mut session) = lock_session(&self.writer.session) {
            session.send_close_notify();
            while session.wants_write() {
                if session.write_tls(&mut self.writer.socket).is_err() {
                    break;
                }
            }
        }
        self.writer.socket.shutdown(Shutdown::Both)
    }
}

impl Read for TlsStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}

impl Write for TlsStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writer.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

/// Read side of a split TLS session.
pub struct TlsReadHalf {
    session: SharedSession,
    socket: TcpStream,
}

impl TlsReadHalf {
    #[must_use]
    pub fn socket(&self) -> &TcpStream {
        &self.socket
    }

    /// # Errors
    /// Propagates the socket option error.
    pub fn set_read_timeout(&self, dur: Option<Duration>) -> io::Result<()> {
        self.socket.set_read_timeout(dur)
    }

    /// # Errors
    /// Propagates the socket error.
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.socket.peer_addr()
    }
}

impl Read for TlsReadHalf {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            {
                let mut session = lock_session(&self.session)?;
                match session.reader().read(buf) {
                    Ok(read) => return Ok(read),
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                    // peer closed the socket without close_notify
                    Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(0),
                    Err(err) => return Err(err),
                }
            }

            let mut raw = [0u8; TLS_READ_CHUNK];
            let read = self.socket.read(&mut raw)?;
            if read == 0 {
                return Ok(0);
            }

            let mut session = lock_session(&self.session)?;
            let mut pending = &raw[..read];
            while !pending.is_empty() {
                session.read_tls(&mut pending)?;
                session
                    .process_new_packets()
                    .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
            }
            while session.wants_write() {
                session.write_tls(&mut self.socket)?;
            }
        }
    }
}

/// Write side of a split TLS session.
pub struct TlsWriteHalf {
    session: SharedSession,
    socket: TcpStream,
}

impl TlsWriteHalf {
    #[must_use]
    pub fn socket(&self) -> &TcpStream {
        &self.socket
    }

    /// # Errors
    /// Propagates the socket option error.
    pub fn set_write_timeout(&self, dur: Option<Duration>) -> io::Result<()> {
        self.socket.set_write_timeout(dur)
    }
}

impl Write for TlsWriteHalf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut session = lock_session(&self.session)?;
        let written = session.writer().write(buf)?;
        while session.wants_write() {
            session.write_tls(&mut self.socket)?;
        }
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut session = lock_session(&self.session)?;
        session.writer().flush()?;
        while session.wants_write() {
            session.write_tls(&mut self.socket)?;
        }
        self.socket.flush()
    }
}
