//! Pipelining client: many requests over a few persistent connections.
//!
//! WHY: Request smuggling and desync probes need several requests in flight
//! on one connection, and bulk scans want to avoid a handshake per request.
//!
//! WHAT: Up to `max_connections` connections to one host. Each submission
//! goes to the least-loaded connection with room for it, waiting (bounded
//! by the caller's deadline) when every connection holds
//! `max_pending_requests`. Responses come back in the order requests were
//! written on their connection.
//!
//! HOW: Every connection is split into a writer thread and a reader thread.
//! The writer takes submissions from a queue, writes them and hands them to
//! the reader, which answers them strictly FIFO. Per-connection load is an
//! atomic counter released by a [`Slot`] guard once the caller has its
//! answer; releasing wakes submitters waiting on the capacity condvar.

use std::io::{BufReader, BufWriter, Write};
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::netcap::ssl::RustlsConnector;
use crate::netcap::{Connection, Deadline, DeadlineCell, DeadlineReader, DeadlineWriter, TlsResult};
use crate::wire::raw_http::{
    patch_raw_request, raw_request_version, read_framed_body, Framing, Headers, PatchOptions,
    Request, RequestBody, Response, ResponseHead, Version, WireError,
};

use super::{split_host_port, ExchangeError, RawHttpError, RawHttpResult, TargetUrl, TcpDialer};

pub const DEFAULT_PIPELINE_READ_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_CONNECTIONS: usize = 5;
pub const DEFAULT_MAX_PENDING_REQUESTS: usize = 100;

/// Opens a connection to `host:port` before the deadline.
pub type DialFn = Arc<dyn Fn(&str, Deadline) -> RawHttpResult<Connection> + Send + Sync>;

/// Plain TCP through the given caching dialer.
#[must_use]
pub fn tcp_dial_fn(dialer: TcpDialer) -> DialFn {
    Arc::new(move |addr: &str, deadline: Deadline| {
        let socket = dialer.dial_deadline(addr, dialer.options().dual_stack, deadline)?;
        Ok(Connection::Tcp(socket))
    })
}

/// TLS over TCP, SNI from `server_name` or the dialed host.
///
/// # Errors
/// Fails when no TLS connector can be built.
pub fn tls_dial_fn(dialer: TcpDialer, server_name: Option<String>) -> TlsResult<DialFn> {
    let connector = RustlsConnector::insecure()?;
    Ok(Arc::new(move |addr: &str, deadline: Deadline| {
        let socket = dialer.dial_deadline(addr, dialer.options().dual_stack, deadline)?;
        let name = match &server_name {
            Some(name) => name.clone(),
            None => split_host_port(addr)?.0,
        };
        Ok(Connection::Tls(connector.connect(&name, socket, deadline)?))
    }))
}

#[derive(Clone)]
pub struct PipelineOptions {
    /// Defaults to plain TCP through a private [`TcpDialer`].
    pub dial: Option<DialFn>,
    /// `host:port` every connection goes to.
    pub host: String,
    pub max_connections: usize,
    /// Outstanding requests allowed per connection.
    pub max_pending_requests: usize,
    /// Bounds the read of each response.
    pub read_timeout: Duration,
    pub automatic_host_header: bool,
    pub automatic_content_length: bool,
}

impl core::fmt::Debug for PipelineOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineOptions")
            .field("dial", &self.dial.as_ref().map(|_| "<fn>"))
            .field("host", &self.host)
            .field("max_connections", &self.max_connections)
            .field("max_pending_requests", &self.max_pending_requests)
            .field("read_timeout", &self.read_timeout)
            .field("automatic_host_header", &self.automatic_host_header)
            .field("automatic_content_length", &self.automatic_content_length)
            .finish()
    }
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            dial: None,
            host: String::new(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_pending_requests: DEFAULT_MAX_PENDING_REQUESTS,
            read_timeout: DEFAULT_PIPELINE_READ_TIMEOUT,
            automatic_host_header: true,
            automatic_content_length: true,
        }
    }
}

impl PipelineOptions {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_dial(mut self, dial: DialFn) -> Self {
        self.dial = Some(dial);
        self
    }

    #[must_use]
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    #[must_use]
    pub fn with_max_pending_requests(mut self, max: usize) -> Self {
        self.max_pending_requests = max;
        self
    }

    #[must_use]
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_automatic_host_header(mut self, enabled: bool) -> Self {
        self.automatic_host_header = enabled;
        self
    }

    #[must_use]
    pub fn with_automatic_content_length(mut self, enabled: bool) -> Self {
        self.automatic_content_length = enabled;
        self
    }
}

/// A pipelined response with the request that produced it.
#[derive(Debug)]
pub struct PipelineResponse {
    pub request: Request,
    pub response: Response,
}

#[derive(Debug)]
struct LaneFlags {
    alive: AtomicBool,
    closing: AtomicBool,
}

struct Lane {
    id: u64,
    queue: Sender<Exchange>,
    outstanding: Arc<AtomicUsize>,
    flags: Arc<LaneFlags>,
}

#[derive(Default)]
struct GateState {
    lanes: Vec<Lane>,
    dialing: usize,
    closed: bool,
    threads: Vec<JoinHandle<()>>,
}

struct Shared {
    state: Mutex<GateState>,
    capacity: Condvar,
    next_lane: AtomicU64,
}

impl Shared {
    fn lock(&self) -> RawHttpResult<MutexGuard<'_, GateState>> {
        self.state
            .lock()
            .map_err(|_| RawHttpError::ConnectionBroken("pipeline state poisoned".into()))
    }

    fn wake(&self) {
        drop(self.state.lock());
        self.capacity.notify_all();
    }

    fn forget_lane(&self, id: u64) {
        if let Ok(mut state) = self.state.lock() {
            state.lanes.retain(|lane| lane.id != id);
        }
        self.capacity.notify_all();
    }
}

/// One unit of load on a lane; released when dropped. Must never be
/// dropped while the gate lock is held.
struct Slot {
    shared: Arc<Shared>,
    outstanding: Arc<AtomicUsize>,
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
        self.shared.wake();
    }
}

struct Exchange {
    bytes: Vec<u8>,
    head_request: bool,
    deadline: Deadline,
    reply: SyncSender<RawHttpResult<Response>>,
    slot: Slot,
}

impl Exchange {
    fn resolve(self, result: RawHttpResult<Response>) {
        let _ = self.reply.send(result);
    }
}

fn broken(reason: &str) -> RawHttpError {
    RawHttpError::ConnectionBroken(reason.to_string())
}

struct LaneWriter {
    id: u64,
    writer: BufWriter<DeadlineWriter>,
    deadline: DeadlineCell,
    read_timeout: Duration,
    flags: Arc<LaneFlags>,
}

impl LaneWriter {
    fn run(mut self, queue: &Receiver<Exchange>, in_flight: &Sender<Exchange>) {
        while let Ok(exchange) = queue.recv() {
            if self.flags.closing.load(Ordering::SeqCst) {
                exchange.resolve(Err(RawHttpError::PipelineShutdown));
                continue;
            }
            if !self.flags.alive.load(Ordering::SeqCst) {
                exchange.resolve(Err(broken("connection failed before the request was written")));
                continue;
            }

            self.deadline
                .set(exchange.deadline.min_after(self.read_timeout));
            let written = self
                .writer
                .write_all(&exchange.bytes)
                .and_then(|()| self.writer.flush());

            match written {
                Ok(()) => {
                    if let Err(mpsc::SendError(exchange)) = in_flight.send(exchange) {
                        exchange.resolve(Err(broken("response reader stopped")));
                    }
                }
                Err(err) => {
                    tracing::warn!("Pipelined write on lane {} failed: {err}", self.id);
                    self.flags.alive.store(false, Ordering::SeqCst);
                    exchange.resolve(Err(RawHttpError::write(err)));
                    let _ = self.writer.get_ref().get_ref().shutdown();
                }
            }
        }
        tracing::debug!("Pipeline writer {} stopped", self.id);
    }
}

struct LaneReader {
    id: u64,
    reader: BufReader<DeadlineReader>,
    deadline: DeadlineCell,
    read_timeout: Duration,
    flags: Arc<LaneFlags>,
    shared: Arc<Shared>,
}

impl LaneReader {
    fn read_one(&mut self, head_request: bool) -> RawHttpResult<(Response, bool)> {
        self.deadline.set(Deadline::after(self.read_timeout));
        let head = ResponseHead::read_from(&mut self.reader).map_err(|err| match err {
            WireError::Io(err) => RawHttpError::read(err),
            other => RawHttpError::Protocol(other),
        })?;

        let framing = head.framing(head_request);
        let keep_alive = head.keep_alive() && framing != Framing::UntilClose;
        let raw_body = read_framed_body(&mut self.reader, framing).map_err(RawHttpError::read)?;
        let response = Response::buffered(head, raw_body).map_err(RawHttpError::read)?;
        Ok((response, keep_alive))
    }

    fn run(mut self, in_flight: Receiver<Exchange>) {
        while let Ok(exchange) = in_flight.recv() {
            match self.read_one(exchange.head_request) {
                Ok((response, keep_alive)) => {
                    exchange.resolve(Ok(response));
                    if !keep_alive {
                        tracing::debug!("Pipeline lane {} closed by server", self.id);
                        break;
                    }
                }
                Err(err) => {
                    tracing::warn!("Pipelined read on lane {} failed: {err}", self.id);
                    exchange.resolve(Err(err));
                    break;
                }
            }
        }

        self.flags.alive.store(false, Ordering::SeqCst);
        let _ = self.reader.get_ref().get_ref().socket().shutdown(std::net::Shutdown::Both);
        self.shared.forget_lane(self.id);

        while let Ok(exchange) = in_flight.try_recv() {
            exchange.resolve(Err(broken("connection closed before the response arrived")));
        }
    }
}

/// Pipelining client bound to one host.
///
/// Dropping it closes it; share it across threads behind an `Arc`.
pub struct PipelineClient {
    options: PipelineOptions,
    dial: DialFn,
    dialer: Option<TcpDialer>,
    shared: Arc<Shared>,
}

impl core::fmt::Debug for PipelineClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineClient")
            .field("options", &self.options)
            .field("connections", &self.connection_count())
            .finish_non_exhaustive()
    }
}

impl PipelineClient {
    #[must_use]
    pub fn new(options: PipelineOptions) -> Self {
        let (dial, dialer) = match &options.dial {
            Some(dial) => (dial.clone(), None),
            None => {
                let dialer = TcpDialer::default();
                (tcp_dial_fn(dialer.clone()), Some(dialer))
            }
        };

        Self {
            options,
            dial,
            dialer,
            shared: Arc::new(Shared {
                state: Mutex::new(GateState::default()),
                capacity: Condvar::new(),
                next_lane: AtomicU64::new(0),
            }),
        }
    }

    #[must_use]
    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    /// Live connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.shared.state.lock().map_or(0, |state| {
            state
                .lanes
                .iter()
                .filter(|lane| lane.flags.alive.load(Ordering::SeqCst))
                .count()
        })
    }

    /// # Errors
    /// See [`PipelineClient::do_raw_with_options`].
    pub fn head(&self, url: &str) -> Result<PipelineResponse, ExchangeError> {
        self.do_raw("HEAD", url, None, Headers::new(), None, None)
    }

    /// # Errors
    /// See [`PipelineClient::do_raw_with_options`].
    pub fn get(&self, url: &str) -> Result<PipelineResponse, ExchangeError> {
        self.do_raw("GET", url, None, Headers::new(), None, None)
    }

    /// # Errors
    /// See [`PipelineClient::do_raw_with_options`].
    pub fn post(
        &self,
        url: &str,
        content_type: &str,
        body: impl Into<RequestBody>,
    ) -> Result<PipelineResponse, ExchangeError> {
        let mut headers = Headers::new();
        headers.push("Content-Type", content_type);
        self.do_raw("POST", url, None, headers, Some(body.into()), None)
    }

    /// # Errors
    /// See [`PipelineClient::do_raw_with_options`].
    pub fn do_raw(
        &self,
        method: &str,
        url: &str,
        uri_path: Option<&str>,
        headers: Headers,
        body: Option<RequestBody>,
        raw: Option<&[u8]>,
    ) -> Result<PipelineResponse, ExchangeError> {
        self.do_raw_with_options(method, url, uri_path, headers, body, raw, &self.options)
    }

    /// Builds a request for `url` and pipelines it to the configured host.
    /// Only the automatic header flags of `options` apply per call.
    ///
    /// # Errors
    /// [`RawHttpError::InvalidUrl`], [`RawHttpError::PipelineShutdown`],
    /// [`RawHttpError::DeadlineExceeded`] and connection failures, paired
    /// with the request when it was built.
    #[allow(clippy::too_many_arguments)]
    pub fn do_raw_with_options(
        &self,
        method: &str,
        url: &str,
        uri_path: Option<&str>,
        headers: Headers,
        body: Option<RequestBody>,
        raw: Option<&[u8]>,
        options: &PipelineOptions,
    ) -> Result<PipelineResponse, ExchangeError> {
        let target = TargetUrl::parse(url)?;
        let request = build_request(method, &target, uri_path, headers, body, raw, options);
        self.do_request(request)
    }

    /// Pipelines a ready-made request without a deadline of its own.
    ///
    /// # Errors
    /// See [`PipelineClient::do_request_deadline`].
    pub fn do_request(&self, request: Request) -> Result<PipelineResponse, ExchangeError> {
        self.do_request_deadline(request, Deadline::none())
    }

    /// Pipelines `request`; waiting for capacity and for the response both
    /// give up at `deadline`.
    ///
    /// # Errors
    /// [`RawHttpError::PipelineShutdown`] once closed,
    /// [`RawHttpError::DeadlineExceeded`], dial errors, and
    /// [`RawHttpError::ConnectionBroken`] when the connection carrying the
    /// request fails.
    pub fn do_request_deadline(
        &self,
        mut request: Request,
        deadline: Deadline,
    ) -> Result<PipelineResponse, ExchangeError> {
        let bytes = match request.to_bytes() {
            Ok(bytes) => bytes,
            Err(err) => return Err(ExchangeError::new(Some(request), RawHttpError::write(err))),
        };

        match self.submit(bytes, request.is_head(), deadline) {
            Ok(response) => Ok(PipelineResponse { request, response }),
            Err(err) => Err(ExchangeError::new(Some(request), err)),
        }
    }

    /// Fails queued requests with [`RawHttpError::PipelineShutdown`], lets
    /// written ones finish and closes every connection.
    pub fn close(&self) {
        let (lanes, threads) = {
            let Ok(mut state) = self.shared.state.lock() else {
                return;
            };
            if state.closed {
                return;
            }
            state.closed = true;
            for lane in &state.lanes {
                lane.flags.closing.store(true, Ordering::SeqCst);
            }
            (mem::take(&mut state.lanes), mem::take(&mut state.threads))
        };
        self.shared.capacity.notify_all();
        drop(lanes);

        for handle in threads {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
        if let Some(dialer) = &self.dialer {
            dialer.close();
        }
        tracing::debug!("Pipeline to {} closed", self.options.host);
    }

    fn submit(&self, bytes: Vec<u8>, head_request: bool, deadline: Deadline) -> RawHttpResult<Response> {
        let (mut reply, answer) = mpsc::sync_channel(1);
        let mut bytes = bytes;

        loop {
            let (queue, slot) = self.reserve(deadline)?;
            let exchange = Exchange {
                bytes,
                head_request,
                deadline,
                reply,
                slot,
            };
            match queue.send(exchange) {
                Ok(()) => break,
                Err(mpsc::SendError(returned)) => {
                    bytes = returned.bytes;
                    reply = returned.reply;
                }
            }
        }

        let received = match deadline.remaining() {
            Err(_) => return Err(RawHttpError::DeadlineExceeded("waiting for a pipelined response")),
            Ok(None) => answer.recv().map_err(|_| broken("request dropped by the pipeline")),
            Ok(Some(remaining)) => answer.recv_timeout(remaining).map_err(|err| match err {
                RecvTimeoutError::Timeout => {
                    RawHttpError::DeadlineExceeded("waiting for a pipelined response")
                }
                RecvTimeoutError::Disconnected => broken("request dropped by the pipeline"),
            }),
        };
        received?
    }

    /// Picks a lane and takes one unit of its capacity, opening a new
    /// connection or waiting when needed.
    fn reserve(&self, deadline: Deadline) -> RawHttpResult<(Sender<Exchange>, Slot)> {
        let max_connections = self.options.max_connections.max(1);
        let max_pending = self.options.max_pending_requests.max(1);

        let mut state = self.shared.lock()?;
        loop {
            if state.closed {
                return Err(RawHttpError::PipelineShutdown);
            }
            state
                .lanes
                .retain(|lane| lane.flags.alive.load(Ordering::SeqCst));

            let least = state
                .lanes
                .iter()
                .min_by_key(|lane| lane.outstanding.load(Ordering::SeqCst));
            let load = least.map(|lane| lane.outstanding.load(Ordering::SeqCst));
            let can_dial = state.lanes.len() + state.dialing < max_connections;

            match (least, load) {
                (Some(lane), Some(load)) if load == 0 || (!can_dial && load < max_pending) => {
                    lane.outstanding.fetch_add(1, Ordering::SeqCst);
                    let slot = Slot {
                        shared: self.shared.clone(),
                        outstanding: lane.outstanding.clone(),
                    };
                    return Ok((lane.queue.clone(), slot));
                }
                _ if can_dial => {
                    state.dialing += 1;
                    drop(state);

                    let dialed = (self.dial)(
                        &self.options.host,
                        deadline.min_after(self.options.read_timeout),
                    );

                    state = self.shared.lock()?;
                    state.dialing -= 1;
                    let connection = match dialed {
                        Ok(connection) => connection,
                        Err(err) => {
                            drop(state);
                            self.shared.capacity.notify_all();
                            return Err(err);
                        }
                    };
                    if state.closed {
                        return Err(RawHttpError::PipelineShutdown);
                    }
                    self.open_lane(&mut state, connection)?;
                    self.shared.capacity.notify_all();
                }
                _ => {
                    state = match deadline.remaining() {
                        Err(_) => {
                            return Err(RawHttpError::DeadlineExceeded(
                                "waiting for pipeline capacity",
                            ))
                        }
                        Ok(None) => self
                            .shared
                            .capacity
                            .wait(state)
                            .map_err(|_| broken("pipeline state poisoned"))?,
                        Ok(Some(remaining)) => {
                            self.shared
                                .capacity
                                .wait_timeout(state, remaining)
                                .map_err(|_| broken("pipeline state poisoned"))?
                                .0
                        }
                    };
                }
            }
        }
    }

    fn open_lane(&self, state: &mut GateState, connection: Connection) -> RawHttpResult<()> {
        let id = self.shared.next_lane.fetch_add(1, Ordering::SeqCst);
        let peer = connection.peer_addr().ok();
        let (read_half, write_half) = connection
            .into_split()
            .map_err(|err| RawHttpError::ConnectionBroken(err.to_string()))?;

        let flags = Arc::new(LaneFlags {
            alive: AtomicBool::new(true),
            closing: AtomicBool::new(false),
        });
        let (queue_tx, queue_rx) = mpsc::channel::<Exchange>();
        let (flight_tx, flight_rx) = mpsc::channel::<Exchange>();

        let read_deadline = DeadlineCell::default();
        let write_deadline = DeadlineCell::default();
        let writer = LaneWriter {
            id,
            writer: BufWriter::new(DeadlineWriter::new(write_half, write_deadline.clone())),
            deadline: write_deadline,
            read_timeout: self.options.read_timeout,
            flags: flags.clone(),
        };
        let reader = LaneReader {
            id,
            reader: BufReader::new(DeadlineReader::new(read_half, read_deadline.clone())),
            deadline: read_deadline,
            read_timeout: self.options.read_timeout,
            flags: flags.clone(),
            shared: self.shared.clone(),
        };

        let spawn_failed = |err: std::io::Error| RawHttpError::ConnectionBroken(err.to_string());
        let writer_handle = thread::Builder::new()
            .name(format!("rawhttp-pipe-w{id}"))
            .spawn(move || writer.run(&queue_rx, &flight_tx))
            .map_err(spawn_failed)?;
        let reader_handle = thread::Builder::new()
            .name(format!("rawhttp-pipe-r{id}"))
            .spawn(move || reader.run(flight_rx))
            .map_err(spawn_failed)?;

        state.threads.retain(|handle| !handle.is_finished());
        state.threads.push(writer_handle);
        state.threads.push(reader_handle);
        state.lanes.push(Lane {
            id,
            queue: queue_tx,
            outstanding: Arc::new(AtomicUsize::new(0)),
            flags,
        });

        tracing::debug!("Pipeline lane {id} open to {} ({peer:?})", self.options.host);
        Ok(())
    }
}

impl Drop for PipelineClient {
    fn drop(&mut self) {
        self.close();
    }
}

/// Builds a pipelined request. A Host header with the URL authority is
/// added when the flag is on and the caller sent none; raw bytes are
/// patched the same way as for the single-shot client.
fn build_request(
    method: &str,
    target: &TargetUrl,
    uri_path: Option<&str>,
    mut headers: Headers,
    body: Option<RequestBody>,
    raw: Option<&[u8]>,
    options: &PipelineOptions,
) -> Request {
    if options.automatic_host_header && !headers.contains("Host") {
        headers.push("Host", target.authority.clone());
    }

    let mut request = match uri_path.filter(|path| !path.is_empty()) {
        Some(path) => Request::new(method, path),
        None => {
            let request = Request::new(method, target.path.clone());
            match &target.query {
                Some(query) => request.with_query(query.clone()),
                None => request,
            }
        }
    }
    .with_headers(headers)
    .with_automatic_host(options.automatic_host_header)
    .with_automatic_content_length(options.automatic_content_length);
    request.body = body;

    if let Some(raw) = raw.filter(|raw| !raw.is_empty()) {
        let patch = PatchOptions {
            automatic_host: options.automatic_host_header,
            automatic_content_length: options.automatic_content_length,
        };
        request.version = raw_request_version(raw).unwrap_or(Version::HTTP_1_1);
        request.raw = Some(patch_raw_request(raw, &target.authority, patch));
    }

    request
}
