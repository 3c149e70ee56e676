//! DNS caching TCP dialer.
//!
//! WHY: Scanners dial the same handful of hosts thousands of times; hitting
//! the resolver on every dial is slow and a resolver outage should not stop
//! work on hosts already resolved.
//!
//! WHAT: Resolved addresses are cached per `host:port` for the cache
//! duration. Each dial picks the next cached address round-robin and fails
//! over through the remaining ones. A background thread drops entries older
//! than twice the cache duration and runs registered sweep hooks.
//!
//! HOW: Entries are shared `Arc`s behind one mutex; the cursor is atomic so
//! concurrent dials to one key spread across addresses. Only one caller
//! refreshes a stale entry, others keep dialing from the stale addresses
//! meanwhile. Dial attempts are bounded by an [`Admission`] semaphore.

use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::netcap::Deadline;

use super::{
    Admission, DialerOptions, DnsError, RawHttpError, RawHttpResult, Resolver, SystemResolver,
};

/// Splits `host:port`, accepting bracketed IPv6 hosts.
///
/// # Errors
/// [`DnsError::InvalidHost`] when the port is missing or not a number.
pub fn split_host_port(addr: &str) -> Result<(String, u16), DnsError> {
    let invalid = || DnsError::InvalidHost(addr.to_string());

    let (host, port) = if let Some(rest) = addr.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or_else(invalid)?;
        let port = tail.strip_prefix(':').ok_or_else(invalid)?;
        (host, port)
    } else {
        addr.rsplit_once(':').ok_or_else(invalid)?
    };

    if host.is_empty() || (!addr.starts_with('[') && host.contains(':')) {
        return Err(invalid());
    }
    let port = port.parse::<u16>().map_err(|_| invalid())?;
    Ok((host.to_string(), port))
}

#[derive(Debug)]
struct AddrEntry {
    addrs: Vec<SocketAddr>,
    cursor: AtomicU32,
    resolved_at: Instant,
    pending: AtomicBool,
}

impl AddrEntry {
    fn new(addrs: Vec<SocketAddr>) -> Self {
        Self {
            addrs,
            cursor: AtomicU32::new(0),
            resolved_at: Instant::now(),
            pending: AtomicBool::new(false),
        }
    }

    fn next_index(&self) -> usize {
        self.cursor.fetch_add(1, Ordering::Relaxed) as usize
    }
}

type CacheKey = (String, bool);
type SweepHook = Box<dyn Fn() + Send + Sync>;

struct DialerShared {
    resolver: Arc<dyn Resolver>,
    cache: Mutex<HashMap<CacheKey, Arc<AddrEntry>>>,
    admission: Admission,
    options: DialerOptions,
    hooks: Mutex<Vec<SweepHook>>,
}

impl DialerShared {
    fn sweep(&self) {
        let expiry = self.options.dns_cache_duration.saturating_mul(2);
        if let Ok(mut cache) = self.cache.lock() {
            let before = cache.len();
            cache.retain(|_, entry| entry.resolved_at.elapsed() <= expiry);
            let purged = before - cache.len();
            if purged > 0 {
                tracing::debug!("Purged {purged} expired DNS cache entries");
            }
        }

        if let Ok(hooks) = self.hooks.lock() {
            for hook in hooks.iter() {
                hook();
            }
        }
    }
}

#[derive(Default)]
struct Sweeper {
    stop: Mutex<Option<mpsc::Sender<()>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Sweeper {
    fn start(shared: &Arc<DialerShared>) -> Self {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let weak: Weak<DialerShared> = Arc::downgrade(shared);
        let interval = shared.options.sweep_interval;

        let spawned = thread::Builder::new()
            .name("rawhttp-dns-sweep".into())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => match weak.upgrade() {
                        Some(shared) => shared.sweep(),
                        None => break,
                    },
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            });

        match spawned {
            Ok(handle) => Self {
                stop: Mutex::new(Some(stop_tx)),
                handle: Mutex::new(Some(handle)),
            },
            Err(err) => {
                tracing::warn!("DNS cache sweeper not started: {err}");
                Self::default()
            }
        }
    }

    fn stop(&self) {
        if let Ok(mut stop) = self.stop.lock() {
            stop.take();
        }

        let handle = self.handle.lock().ok().and_then(|mut handle| handle.take());
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.stop();
    }
}

enum AttemptError {
    Timeout,
    Failed(io::Error),
}

/// DNS caching, admission bounded TCP dialer.
///
/// Clones share the cache, the semaphore and the sweep thread; the thread
/// stops when the last clone is dropped or [`TcpDialer::close`] is called.
#[derive(Clone)]
pub struct TcpDialer {
    shared: Arc<DialerShared>,
    sweeper: Arc<Sweeper>,
}

impl Default for TcpDialer {
    fn default() -> Self {
        Self::new(DialerOptions::default())
    }
}

impl core::fmt::Debug for TcpDialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpDialer")
            .field("options", &self.shared.options)
            .field("cached", &self.cache_len())
            .field("available_slots", &self.shared.admission.available())
            .finish_non_exhaustive()
    }
}

impl TcpDialer {
    #[must_use]
    pub fn new(options: DialerOptions) -> Self {
        Self::with_resolver(options, SystemResolver::new())
    }

    pub fn with_resolver(options: DialerOptions, resolver: impl Resolver + 'static) -> Self {
        let shared = Arc::new(DialerShared {
            resolver: Arc::new(resolver),
            cache: Mutex::new(HashMap::new()),
            admission: Admission::new(options.concurrency),
            options,
            hooks: Mutex::new(Vec::new()),
        });
        let sweeper = Arc::new(Sweeper::start(&shared));
        Self { shared, sweeper }
    }

    #[must_use]
    pub fn options(&self) -> &DialerOptions {
        &self.shared.options
    }

    #[must_use]
    pub fn admission(&self) -> &Admission {
        &self.shared.admission
    }

    /// Registers a callback run after every cache sweep.
    pub fn add_sweep_hook(&self, hook: impl Fn() + Send + Sync + 'static) {
        if let Ok(mut hooks) = self.shared.hooks.lock() {
            hooks.push(Box::new(hook));
        }
    }

    /// Runs one sweep immediately.
    pub fn sweep_now(&self) {
        self.shared.sweep();
    }

    /// Stops the sweep thread. Dialing keeps working without expiry.
    pub fn close(&self) {
        self.sweeper.stop();
    }

    #[must_use]
    pub fn cache_len(&self) -> usize {
        self.shared.cache.lock().map_or(0, |cache| cache.len())
    }

    pub fn clear_cache(&self) {
        if let Ok(mut cache) = self.shared.cache.lock() {
            cache.clear();
        }
    }

    /// Dials `addr` (`host:port`, IPv4 only) with the default dial timeout.
    ///
    /// # Errors
    /// [`RawHttpError::Dns`], [`RawHttpError::DialTimeout`] or
    /// [`RawHttpError::ConnectFailed`].
    pub fn dial(&self, addr: &str) -> RawHttpResult<TcpStream> {
        self.dial_timeout(addr, self.shared.options.dial_timeout)
    }

    /// # Errors
    /// See [`TcpDialer::dial`].
    pub fn dial_timeout(&self, addr: &str, timeout: Duration) -> RawHttpResult<TcpStream> {
        self.dial_deadline(addr, false, Deadline::after(timeout))
    }

    /// Like [`TcpDialer::dial`] but keeps IPv6 addresses.
    ///
    /// # Errors
    /// See [`TcpDialer::dial`].
    pub fn dial_dual_stack(&self, addr: &str) -> RawHttpResult<TcpStream> {
        self.dial_dual_stack_timeout(addr, self.shared.options.dial_timeout)
    }

    /// # Errors
    /// See [`TcpDialer::dial`].
    pub fn dial_dual_stack_timeout(&self, addr: &str, timeout: Duration) -> RawHttpResult<TcpStream> {
        self.dial_deadline(addr, true, Deadline::after(timeout))
    }

    /// Dials `addr` before `deadline`, starting at the next round-robin
    /// address and failing over through the rest.
    ///
    /// # Errors
    /// [`RawHttpError::DialTimeout`] once the deadline passes,
    /// [`RawHttpError::ConnectFailed`] with the last error when every
    /// address fails and DNS errors from resolution.
    pub fn dial_deadline(&self, addr: &str, dual_stack: bool, deadline: Deadline) -> RawHttpResult<TcpStream> {
        if deadline.has_elapsed() {
            return Err(RawHttpError::DialTimeout(addr.to_string()));
        }

        let entry = self.resolve_entry(addr, dual_stack, deadline)?;
        let total = entry.addrs.len();
        let start = entry.next_index();

        let mut last_error = None;
        for attempt in 0..total {
            let target = entry.addrs[(start + attempt) % total];
            match self.try_dial(target, deadline) {
                Ok(stream) => {
                    tracing::debug!("Connected to {addr} via {target}");
                    return Ok(stream);
                }
                Err(AttemptError::Timeout) => {
                    tracing::debug!("Dial to {addr} timed out at {target}");
                    return Err(RawHttpError::DialTimeout(addr.to_string()));
                }
                Err(AttemptError::Failed(err)) => {
                    tracing::debug!("Dial to {target} for {addr} failed: {err}");
                    last_error = Some(err);
                }
            }
        }

        Err(RawHttpError::ConnectFailed(match last_error {
            Some(err) => format!("{addr}: {err}"),
            None => addr.to_string(),
        }))
    }

    /// Next round-robin socket address for `addr`, through the cache.
    ///
    /// # Errors
    /// DNS errors or an elapsed deadline.
    pub fn resolve(&self, addr: &str, dual_stack: bool, deadline: Deadline) -> RawHttpResult<SocketAddr> {
        let entry = self.resolve_entry(addr, dual_stack, deadline)?;
        Ok(entry.addrs[entry.next_index() % entry.addrs.len()])
    }

    /// All cached or freshly resolved addresses for `addr`.
    ///
    /// # Errors
    /// DNS errors.
    pub fn lookup(&self, addr: &str, dual_stack: bool) -> RawHttpResult<Vec<SocketAddr>> {
        let entry = self.resolve_entry(addr, dual_stack, Deadline::none())?;
        Ok(entry.addrs.clone())
    }

    fn try_dial(&self, target: SocketAddr, deadline: Deadline) -> Result<TcpStream, AttemptError> {
        if deadline.has_elapsed() {
            return Err(AttemptError::Timeout);
        }

        let Some(_permit) = self.shared.admission.acquire(deadline) else {
            return Err(AttemptError::Timeout);
        };

        let connected = match deadline.remaining() {
            Err(_) => return Err(AttemptError::Timeout),
            Ok(None) => TcpStream::connect(target),
            Ok(Some(remaining)) => TcpStream::connect_timeout(&target, remaining),
        };

        match connected {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                Ok(stream)
            }
            Err(err) if matches!(err.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => {
                Err(AttemptError::Timeout)
            }
            Err(err) => Err(AttemptError::Failed(err)),
        }
    }

    fn resolve_entry(&self, addr: &str, dual_stack: bool, deadline: Deadline) -> RawHttpResult<Arc<AddrEntry>> {
        let key: CacheKey = (addr.to_string(), dual_stack);
        let cache_duration = self.shared.options.dns_cache_duration;

        let cached = {
            let cache = self
                .shared
                .cache
                .lock()
                .map_err(|_| DnsError::ResolutionFailed(addr.to_string()))?;
            match cache.get(&key) {
                Some(entry)
                    if entry.resolved_at.elapsed() > cache_duration
                        && !entry.pending.swap(true, Ordering::AcqRel) =>
                {
                    None
                }
                other => other.cloned(),
            }
        };

        if let Some(entry) = cached {
            return Ok(entry);
        }

        let addrs = match self.resolve_now(addr, dual_stack, deadline) {
            Ok(addrs) => addrs,
            Err(err) => {
                if let Ok(cache) = self.shared.cache.lock() {
                    if let Some(entry) = cache.get(&key) {
                        entry.pending.store(false, Ordering::Release);
                    }
                }
                return Err(err);
            }
        };

        let entry = Arc::new(AddrEntry::new(addrs));
        if let Ok(mut cache) = self.shared.cache.lock() {
            cache.insert(key, entry.clone());
        }
        Ok(entry)
    }

    fn resolve_now(&self, addr: &str, dual_stack: bool, deadline: Deadline) -> RawHttpResult<Vec<SocketAddr>> {
        let (host, port) = split_host_port(addr)?;
        let ips = self.lookup_host(&host, deadline)?;

        let addrs: Vec<SocketAddr> = ips
            .into_iter()
            .filter(|ip| dual_stack || ip.is_ipv4())
            .map(|ip| SocketAddr::new(ip, port))
            .collect();

        if addrs.is_empty() {
            return Err(DnsError::NoAddressesFound(host).into());
        }

        tracing::debug!("Cached {} address(es) for {addr}", addrs.len());
        Ok(addrs)
    }

    fn lookup_host(&self, host: &str, deadline: Deadline) -> RawHttpResult<Vec<std::net::IpAddr>> {
        let remaining = deadline
            .remaining()
            .map_err(|_| DnsError::Timeout(host.to_string()))?;

        let Some(remaining) = remaining else {
            return Ok(self.shared.resolver.lookup_addresses(host)?);
        };

        // the platform resolver cannot be interrupted, so wait on a helper
        // thread and abandon it when the deadline passes
        let (tx, rx) = mpsc::sync_channel(1);
        let resolver = self.shared.resolver.clone();
        let name = host.to_string();
        thread::Builder::new()
            .name("rawhttp-dns-lookup".into())
            .spawn(move || {
                let _ = tx.send(resolver.lookup_addresses(&name));
            })
            .map_err(|err| DnsError::IoError(err.to_string()))?;

        match rx.recv_timeout(remaining) {
            Ok(answer) => Ok(answer?),
            Err(RecvTimeoutError::Timeout) => Err(DnsError::Timeout(host.to_string()).into()),
            Err(RecvTimeoutError::Disconnected) => {
                Err(DnsError::ResolutionFailed(host.to_string()).into())
            }
        }
    }
}
