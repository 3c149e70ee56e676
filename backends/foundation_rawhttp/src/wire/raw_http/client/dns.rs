//! Hostname resolution capability used by the dialer.
//!
//! The dialer owns caching and round-robin selection, so resolvers are
//! plain lookups: hostname in, ordered addresses out.

use std::collections::HashMap;
use std::net::{IpAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::DnsError;

/// Resolves hostnames to IP addresses.
///
/// Implementations must be thread-safe; lookups may run on a helper thread
/// so the dialer can stop waiting when a deadline passes.
pub trait Resolver: Send + Sync {
    /// Ordered addresses for `host`.
    ///
    /// # Errors
    /// Returns a [`DnsError`] when resolution fails or yields nothing.
    fn lookup_addresses(&self, host: &str) -> Result<Vec<IpAddr>, DnsError>;
}

impl<R: Resolver + ?Sized> Resolver for Arc<R> {
    fn lookup_addresses(&self, host: &str) -> Result<Vec<IpAddr>, DnsError> {
        (**self).lookup_addresses(host)
    }
}

/// Parses IP literals, including bracketed IPv6.
#[must_use]
pub fn parse_ip_literal(host: &str) -> Option<IpAddr> {
    let bare = host
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .unwrap_or(host);
    bare.parse().ok()
}

/// Platform resolver via `ToSocketAddrs`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

impl SystemResolver {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Resolver for SystemResolver {
    fn lookup_addresses(&self, host: &str) -> Result<Vec<IpAddr>, DnsError> {
        if host.is_empty() {
            return Err(DnsError::InvalidHost(host.to_string()));
        }

        if let Some(ip) = parse_ip_literal(host) {
            return Ok(vec![ip]);
        }

        let resolved = (host, 0u16)
            .to_socket_addrs()
            .map_err(|err| DnsError::ResolutionFailed(format!("{host}: {err}")))?;

        let mut addrs: Vec<IpAddr> = Vec::new();
        for addr in resolved {
            if !addrs.contains(&addr.ip()) {
                addrs.push(addr.ip());
            }
        }

        if addrs.is_empty() {
            return Err(DnsError::NoAddressesFound(host.to_string()));
        }

        tracing::debug!("Resolved {} to {} address(es)", host, addrs.len());
        Ok(addrs)
    }
}

/// Scripted resolver for tests: fixed answers per host and a call counter.
///
/// Unknown hosts fail with [`DnsError::ResolutionFailed`]. Clones share
/// the answers and the counter.
#[derive(Debug, Clone, Default)]
pub struct MockResolver {
    responses: Arc<Mutex<HashMap<String, Result<Vec<IpAddr>, DnsError>>>>,
    calls: Arc<AtomicUsize>,
}

impl MockResolver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_response(self, host: &str, addrs: Vec<IpAddr>) -> Self {
        self.set_response(host, Ok(addrs));
        self
    }

    #[must_use]
    pub fn with_error(self, host: &str, error: DnsError) -> Self {
        self.set_response(host, Err(error));
        self
    }

    /// Replaces the answer for `host`; visible to every clone.
    pub fn set_response(&self, host: &str, answer: Result<Vec<IpAddr>, DnsError>) {
        if let Ok(mut responses) = self.responses.lock() {
            responses.insert(host.to_string(), answer);
        }
    }

    /// Number of lookups served so far.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Resolver for MockResolver {
    fn lookup_addresses(&self, host: &str) -> Result<Vec<IpAddr>, DnsError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let responses = self
            .responses
            .lock()
            .map_err(|_| DnsError::ResolutionFailed(host.to_string()))?;
        responses
            .get(host)
            .cloned()
            .unwrap_or_else(|| Err(DnsError::ResolutionFailed(host.to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn test_system_resolver_short_circuits_ip_literals() {
        let resolver = SystemResolver::new();
        assert_eq!(
            resolver.lookup_addresses("127.0.0.1").unwrap(),
            vec![IpAddr::V4(Ipv4Addr::LOCALHOST)]
        );
        assert_eq!(
            resolver.lookup_addresses("[::1]").unwrap(),
            vec![IpAddr::V6(Ipv6Addr::LOCALHOST)]
        );
    }

    #[test]
    fn test_system_resolver_resolves_localhost() {
        let addrs = SystemResolver::new().lookup_addresses("localhost").unwrap();
        assert!(addrs.iter().all(IpAddr::is_loopback));
    }

    #[test]
    fn test_system_resolver_rejects_empty_host() {
        assert!(matches!(
            SystemResolver::new().lookup_addresses(""),
            Err(DnsError::InvalidHost(_))
        ));
    }

    #[test]
    fn test_mock_resolver_counts_and_shares_state() {
        let resolver = MockResolver::new()
            .with_response("a.test", vec![IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))])
            .with_error("b.test", DnsError::NoAddressesFound("b.test".into()));
        let clone = resolver.clone();

        assert!(resolver.lookup_addresses("a.test").is_ok());
        assert!(clone.lookup_addresses("b.test").is_err());
        assert!(clone.lookup_addresses("unknown.test").is_err());
        assert_eq!(resolver.calls(), 3);
    }
}
