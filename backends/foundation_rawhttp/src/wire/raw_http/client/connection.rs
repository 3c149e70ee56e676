//! HTTP connections and the dialer that opens them.
//!
//! WHY: The clients need a socket that speaks the wire model, carries its own
//! deadlines and can be tunnelled through a proxy and wrapped in TLS before
//! the first request is written.
//!
//! WHAT: [`HttpConnection`] couples a split [`Connection`] with request
//! serialization and response parsing. Response bodies stream straight off
//! the socket; the connection tracks how much of the current body is still
//! unread so it knows when it may be pooled again. [`HttpDialer`] resolves,
//! tunnels and handshakes new connections, or hands back a pooled one.
//!
//! HOW: The read half sits behind `Arc<Mutex<BufReader<..>>>` so the body
//! stream of a [`Response`] and the connection itself share it. Deadlines are
//! absolute and live in [`DeadlineCell`]s read before every socket call.

use std::collections::VecDeque;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use crate::netcap::ssl::{RustlsConnector, TlsStream};
use crate::netcap::{
    probe_stale, Connection, Deadline, DeadlineCell, DeadlineReader, DeadlineWriter, TlsError,
};
use crate::wire::raw_http::{read_framed_body, Framing, Request, Response, ResponseHead, WireError};

use super::{
    http_connect, socks5_connect, split_host_port, ConnectionPool, DialerOptions, ProxyConfig,
    ProxyError, ProxyScheme, RawHttpError, RawHttpResult, SocksTarget, TcpDialer,
    DEFAULT_MAX_PER_KEY,
};

/// Target scheme of a dial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Http,
    Https,
}

impl Protocol {
    /// `Https` when `url` starts with `https://` in any casing.
    #[must_use]
    pub fn from_url(url: &str) -> Self {
        let is_https = url
            .get(..8)
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case("https://"));
        if is_https {
            Self::Https
        } else {
            Self::Http
        }
    }

    #[must_use]
    pub fn default_port(self) -> u16 {
        match self {
            Self::Http => 80,
            Self::Https => 443,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }
}

impl core::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything needed to open one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialOptions {
    pub protocol: Protocol,
    /// `host:port` of the target.
    pub address: String,
    pub proxy: Option<String>,
    /// Overrides the SNI name taken from `address`.
    pub server_name: Option<String>,
    /// Bounds the TCP dial and proxy negotiation, within `deadline`.
    pub dial_timeout: Option<Duration>,
    /// Bounds the whole dial, TLS handshake included.
    pub deadline: Deadline,
    pub dual_stack: bool,
}

impl DialOptions {
    pub fn new(protocol: Protocol, address: impl Into<String>) -> Self {
        Self {
            protocol,
            address: address.into(),
            proxy: None,
            server_name: None,
            dial_timeout: None,
            deadline: Deadline::none(),
            dual_stack: false,
        }
    }

    #[must_use]
    pub fn with_proxy(mut self, proxy_url: impl Into<String>) -> Self {
        self.proxy = Some(proxy_url.into());
        self
    }

    #[must_use]
    pub fn with_server_name(mut self, server_name: impl Into<String>) -> Self {
        self.server_name = Some(server_name.into());
        self
    }

    #[must_use]
    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_deadline(mut self, deadline: Deadline) -> Self {
        self.deadline = deadline;
        self
    }

    #[must_use]
    pub fn with_dual_stack(mut self, dual_stack: bool) -> Self {
        self.dual_stack = dual_stack;
        self
    }

    /// Pool bucket for connections opened with these options.
    #[must_use]
    pub fn pool_key(&self) -> String {
        let mut key = format!("{}://{}", self.protocol, self.address);
        if let Some(name) = self.server_name.as_deref().filter(|name| !name.is_empty()) {
            key.push_str(" sni=");
            key.push_str(name);
        }
        if let Some(proxy) = &self.proxy {
            key.push_str(" via ");
            key.push_str(proxy);
        }
        key
    }
}

fn lock<T>(mutex: &Mutex<T>) -> io::Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| io::Error::other("connection lock poisoned"))
}

type SharedReader = Arc<Mutex<BufReader<DeadlineReader>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyState {
    Finished,
    Remaining(u64),
    UntilClose,
}

impl From<Framing> for BodyState {
    fn from(framing: Framing) -> Self {
        match framing {
            Framing::Empty | Framing::Length(0) => Self::Finished,
            Framing::Length(length) => Self::Remaining(length),
            Framing::UntilClose => Self::UntilClose,
        }
    }
}

/// The unread part of the current response body, read off the shared
/// socket reader.
struct BodySource {
    reader: SharedReader,
    state: Arc<Mutex<BodyState>>,
}

impl Read for BodySource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = lock(&self.state)?;
        let limit = match *state {
            BodyState::Finished => return Ok(0),
            BodyState::Remaining(left) => usize::try_from(left).map_or(buf.len(), |left| left.min(buf.len())),
            BodyState::UntilClose => buf.len(),
        };

        let read = lock(&self.reader)?.read(&mut buf[..limit])?;
        match *state {
            BodyState::Remaining(left) => {
                if read == 0 && limit > 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("connection closed with {left} body bytes outstanding"),
                    ));
                }
                let left = left - read as u64;
                *state = if left == 0 {
                    BodyState::Finished
                } else {
                    BodyState::Remaining(left)
                };
            }
            BodyState::UntilClose if read == 0 && limit > 0 => *state = BodyState::Finished,
            _ => {}
        }
        Ok(read)
    }
}

/// A client connection that writes [`Request`]s and reads [`Response`]s.
pub struct HttpConnection {
    key: String,
    peer: Option<SocketAddr>,
    tls: bool,
    reader: SharedReader,
    writer: BufWriter<DeadlineWriter>,
    read_deadline: DeadlineCell,
    write_deadline: DeadlineCell,
    body: Arc<Mutex<BodyState>>,
    awaiting: VecDeque<bool>,
    reusable: bool,
    pool: Option<Weak<ConnectionPool>>,
}

impl core::fmt::Debug for HttpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpConnection")
            .field("key", &self.key)
            .field("peer", &self.peer)
            .field("tls", &self.tls)
            .field("awaiting", &self.awaiting.len())
            .field("reusable", &self.reusable)
            .finish_non_exhaustive()
    }
}

impl HttpConnection {
    /// Wraps `connection`; `key` names the pool bucket it returns to.
    ///
    /// # Errors
    /// Fails when the socket cannot be split.
    pub fn new(connection: Connection, key: impl Into<String>) -> io::Result<Self> {
        let peer = connection.peer_addr().ok();
        let tls = connection.is_tls();
        let (read_half, write_half) = connection.into_split()?;

        let read_deadline = DeadlineCell::default();
        let write_deadline = DeadlineCell::default();
        Ok(Self {
            key: key.into(),
            peer,
            tls,
            reader: Arc::new(Mutex::new(BufReader::new(DeadlineReader::new(
                read_half,
                read_deadline.clone(),
            )))),
            writer: BufWriter::new(DeadlineWriter::new(write_half, write_deadline.clone())),
            read_deadline,
            write_deadline,
            body: Arc::new(Mutex::new(BodyState::Finished)),
            awaiting: VecDeque::new(),
            reusable: true,
            pool: None,
        })
    }

    #[must_use]
    pub fn with_pool(mut self, pool: Weak<ConnectionPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    #[must_use]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    #[must_use]
    pub fn is_tls(&self) -> bool {
        self.tls
    }

    fn socket(&self) -> &TcpStream {
        self.writer.get_ref().get_ref().socket()
    }

    pub fn set_deadline(&self, deadline: Deadline) {
        self.read_deadline.set(deadline);
        self.write_deadline.set(deadline);
    }

    pub fn set_read_deadline(&self, deadline: Deadline) {
        self.read_deadline.set(deadline);
    }

    pub fn set_write_deadline(&self, deadline: Deadline) {
        self.write_deadline.set(deadline);
    }

    /// Deadline `timeout` from now for both directions; zero clears it.
    pub fn set_timeout(&self, timeout: Duration) {
        self.set_deadline(Deadline::after(timeout));
    }

    /// Writes `request`. Any unread, length-framed body of the previous
    /// response is drained first so the next response lines up.
    ///
    /// # Errors
    /// [`RawHttpError::WriteFailed`], or [`RawHttpError::ReadFailed`] when
    /// draining the previous body fails.
    pub fn write_request(&mut self, request: &mut Request) -> RawHttpResult<()> {
        self.drain_body().map_err(RawHttpError::read)?;
        request.write_to(&mut self.writer).map_err(RawHttpError::write)?;
        self.awaiting.push_back(request.is_head());
        Ok(())
    }

    /// Reads the next response head. The body streams lazily from the
    /// socket unless `force_read_full_body` is set, in which case it is
    /// read (and gunzipped) completely first.
    ///
    /// # Errors
    /// [`RawHttpError::Protocol`] for unparsable heads,
    /// [`RawHttpError::ReadFailed`] for socket failures and timeouts.
    pub fn read_response(&mut self, force_read_full_body: bool) -> RawHttpResult<Response> {
        let head_request = self.awaiting.pop_front().unwrap_or(false);
        let head = {
            let mut reader = lock(&self.reader).map_err(RawHttpError::read)?;
            ResponseHead::read_from(&mut *reader).map_err(|err| match err {
                WireError::Io(err) => RawHttpError::read(err),
                other => RawHttpError::Protocol(other),
            })?
        };

        let framing = head.framing(head_request);
        self.reusable = head.keep_alive() && framing != Framing::UntilClose;
        tracing::debug!(
            "Response {} from {} ({framing:?}, keep-alive: {})",
            head.status,
            self.key,
            self.reusable
        );

        if force_read_full_body {
            let raw_body = {
                let mut reader = lock(&self.reader).map_err(RawHttpError::read)?;
                read_framed_body(&mut *reader, framing).map_err(RawHttpError::read)?
            };
            self.set_body_state(BodyState::Finished)?;
            return Response::buffered(head, raw_body).map_err(RawHttpError::read);
        }

        self.set_body_state(BodyState::from(framing))?;
        let source = BodySource {
            reader: self.reader.clone(),
            state: self.body.clone(),
        };
        Ok(Response::streaming(head, framing, Box::new(source)))
    }

    fn set_body_state(&self, state: BodyState) -> RawHttpResult<()> {
        *lock(&self.body).map_err(RawHttpError::read)? = state;
        Ok(())
    }

    fn body_state(&self) -> BodyState {
        lock(&self.body).map_or(BodyState::UntilClose, |state| *state)
    }

    /// True once the current response body was read to its end.
    #[must_use]
    pub fn body_finished(&self) -> bool {
        self.body_state() == BodyState::Finished
    }

    /// Discards the rest of a length-framed body. Bodies running until close
    /// are left alone and the connection is marked not reusable.
    ///
    /// # Errors
    /// Propagates read failures, including deadline expiry.
    pub fn drain_body(&mut self) -> io::Result<()> {
        match self.body_state() {
            BodyState::Finished => Ok(()),
            BodyState::UntilClose => {
                self.reusable = false;
                Ok(())
            }
            BodyState::Remaining(left) => {
                let mut source = BodySource {
                    reader: self.reader.clone(),
                    state: self.body.clone(),
                };
                let drained = io::copy(&mut source, &mut io::sink())?;
                tracing::debug!("Drained {drained} of {left} body bytes on {}", self.key);
                Ok(())
            }
        }
    }

    /// Whether the connection can carry another request: keep-alive, no
    /// response outstanding and nothing unread.
    #[must_use]
    pub fn is_reusable(&self) -> bool {
        self.reusable
            && self.awaiting.is_empty()
            && self.body_finished()
            && lock(&self.reader).is_ok_and(|reader| reader.buffer().is_empty())
    }

    /// True when the peer closed the socket or sent bytes nobody asked for.
    #[must_use]
    pub fn is_stale(&self) -> bool {
        let buffered = lock(&self.reader).map_or(true, |reader| !reader.buffer().is_empty());
        buffered || probe_stale(self.socket())
    }

    /// Shuts the socket down.
    pub fn close(mut self) {
        let _ = self.writer.flush();
        if let Err(err) = self.writer.get_ref().get_ref().shutdown() {
            tracing::debug!("Shutdown of {} failed: {err}", self.key);
        }
    }

    /// Returns the connection to its pool when it is reusable, closes it
    /// otherwise.
    pub fn release(self) {
        let pool = self.pool.as_ref().and_then(Weak::upgrade);
        match pool {
            Some(pool) if self.is_reusable() => {
                self.set_deadline(Deadline::none());
                pool.checkin(self);
            }
            _ => self.close(),
        }
    }
}

/// Opens [`HttpConnection`]s directly, through proxies and over TLS,
/// reusing pooled connections when allowed.
#[derive(Clone)]
pub struct HttpDialer {
    tcp: TcpDialer,
    pool: Arc<ConnectionPool>,
    tls: Option<RustlsConnector>,
    reuse: bool,
}

impl core::fmt::Debug for HttpDialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpDialer")
            .field("tcp", &self.tcp)
            .field("pool", &self.pool)
            .field("tls", &self.tls.is_some())
            .field("reuse", &self.reuse)
            .finish()
    }
}

impl Default for HttpDialer {
    fn default() -> Self {
        Self::new(DialerOptions::default())
    }
}

impl HttpDialer {
    #[must_use]
    pub fn new(options: DialerOptions) -> Self {
        Self::with_tcp_dialer(TcpDialer::new(options))
    }

    /// Builds on an existing TCP dialer. Idle pooled connections older than
    /// twice its DNS cache duration are evicted by its sweep.
    #[must_use]
    pub fn with_tcp_dialer(tcp: TcpDialer) -> Self {
        let pool = Arc::new(ConnectionPool::new(
            DEFAULT_MAX_PER_KEY,
            tcp.options().dns_cache_duration.saturating_mul(2),
        ));

        let weak = Arc::downgrade(&pool);
        tcp.add_sweep_hook(move || {
            if let Some(pool) = weak.upgrade() {
                pool.cleanup_stale();
            }
        });

        let tls = match RustlsConnector::insecure() {
            Ok(connector) => Some(connector),
            Err(err) => {
                tracing::debug!("TLS connector unavailable: {err}");
                None
            }
        };

        Self {
            tcp,
            pool,
            tls,
            reuse: true,
        }
    }

    #[must_use]
    pub fn with_connection_reuse(mut self, enabled: bool) -> Self {
        self.reuse = enabled;
        self
    }

    #[must_use]
    pub fn tcp(&self) -> &TcpDialer {
        &self.tcp
    }

    #[must_use]
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Dials with the TCP dialer's default timeout.
    ///
    /// # Errors
    /// See [`HttpDialer::dial_with_options`].
    pub fn dial(&self, protocol: Protocol, address: &str) -> RawHttpResult<HttpConnection> {
        self.dial_timeout(protocol, address, self.tcp.options().dial_timeout)
    }

    /// # Errors
    /// See [`HttpDialer::dial_with_options`].
    pub fn dial_timeout(
        &self,
        protocol: Protocol,
        address: &str,
        timeout: Duration,
    ) -> RawHttpResult<HttpConnection> {
        self.dial_with_options(
            &DialOptions::new(protocol, address)
                .with_dial_timeout(timeout)
                .with_dual_stack(self.tcp.options().dual_stack),
        )
    }

    /// Tunnels to `address` through `proxy_url`; `timeout` bounds the
    /// proxy dial and negotiation.
    ///
    /// # Errors
    /// See [`HttpDialer::dial_with_options`].
    pub fn dial_with_proxy(
        &self,
        protocol: Protocol,
        address: &str,
        proxy_url: &str,
        timeout: Duration,
    ) -> RawHttpResult<HttpConnection> {
        self.dial_with_options(
            &DialOptions::new(protocol, address)
                .with_proxy(proxy_url)
                .with_dial_timeout(timeout)
                .with_dual_stack(self.tcp.options().dual_stack),
        )
    }

    /// Hands out a pooled connection for the same target when one is idle,
    /// otherwise dials (through the proxy, if any) and handshakes TLS for
    /// `https`.
    ///
    /// # Errors
    /// Dial errors ([`RawHttpError::Dns`], [`RawHttpError::DialTimeout`],
    /// [`RawHttpError::ConnectFailed`]), [`RawHttpError::Proxy`] for tunnel
    /// failures and [`RawHttpError::TlsHandshake`].
    pub fn dial_with_options(&self, options: &DialOptions) -> RawHttpResult<HttpConnection> {
        let key = options.pool_key();
        if self.reuse {
            if let Some(connection) = self.pool.checkout(&key) {
                tracing::debug!("Reusing pooled connection for {key}");
                return Ok(connection);
            }
        }

        let dial_deadline = match options.dial_timeout {
            Some(timeout) => options.deadline.min_after(timeout),
            None => options.deadline,
        };

        let socket = match &options.proxy {
            None => self
                .tcp
                .dial_deadline(&options.address, options.dual_stack, dial_deadline)?,
            Some(proxy_url) => self.open_tunnel(proxy_url, options, dial_deadline)?,
        };

        let connection = match options.protocol {
            Protocol::Http => Connection::Tcp(socket),
            Protocol::Https => Connection::Tls(self.handshake(options, socket)?),
        };

        let connection = HttpConnection::new(connection, key)
            .map_err(|err| RawHttpError::ConnectFailed(err.to_string()))?;
        if self.reuse {
            return Ok(connection.with_pool(Arc::downgrade(&self.pool)));
        }
        Ok(connection)
    }

    fn open_tunnel(
        &self,
        proxy_url: &str,
        options: &DialOptions,
        deadline: Deadline,
    ) -> RawHttpResult<TcpStream> {
        let proxy = ProxyConfig::parse(proxy_url)?;
        let mut stream = self
            .tcp
            .dial_deadline(&proxy.address, options.dual_stack, deadline)
            .map_err(|err| match err {
                RawHttpError::DialTimeout(addr) => RawHttpError::DialTimeout(addr),
                other => ProxyError::Connect {
                    proxy: proxy.address.clone(),
                    reason: other.to_string(),
                }
                .into(),
            })?;

        match proxy.scheme {
            ProxyScheme::Http => http_connect(&mut stream, &proxy, &options.address, deadline)?,
            ProxyScheme::Socks5 => {
                let target = self
                    .tcp
                    .resolve(&options.address, options.dual_stack, deadline)?;
                socks5_connect(&mut stream, &proxy, &SocksTarget::Addr(target), deadline)?;
            }
            ProxyScheme::Socks5h => {
                let (host, port) = split_host_port(&options.address)?;
                socks5_connect(&mut stream, &proxy, &SocksTarget::Domain(host, port), deadline)?;
            }
        }
        Ok(stream)
    }

    fn handshake(&self, options: &DialOptions, socket: TcpStream) -> RawHttpResult<TlsStream> {
        let connector = self.tls.as_ref().ok_or(TlsError::NotSupported)?;
        let server_name = match options.server_name.as_deref() {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => split_host_port(&options.address)?.0,
        };
        Ok(connector.connect(&server_name, socket, options.deadline)?)
    }

    /// Stops the DNS sweep and drops every pooled connection.
    pub fn close(&self) {
        self.tcp.close();
        self.pool.clear();
    }
}
