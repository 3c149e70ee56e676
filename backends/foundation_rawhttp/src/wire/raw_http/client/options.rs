use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::wire::raw_http::Headers;

use super::{ConfigError, DEFAULT_DIAL_CONCURRENCY};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_REDIRECTS: usize = 10;
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_PROXY_DIAL_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_DNS_CACHE_DURATION: Duration = Duration::from_secs(60);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

mod header_pairs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use crate::wire::raw_http::Headers;

    pub fn serialize<S: Serializer>(value: &Headers, serializer: S) -> Result<S::Ok, S::Error> {
        let pairs: Vec<(&str, &str)> = value
            .iter()
            .map(|header| (header.key.as_str(), header.value.as_str()))
            .collect();
        pairs.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Headers, D::Error> {
        let pairs = Vec::<(String, String)>::deserialize(deserializer)?;
        Ok(pairs.into_iter().collect())
    }
}

mod raw_text {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[allow(clippy::ref_option)]
    pub fn serialize<S: Serializer>(value: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        value
            .as_ref()
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
            .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error> {
        Ok(Option::<String>::deserialize(deserializer)?.map(String::into_bytes))
    }
}

/// Settings of the DNS caching dialer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DialerOptions {
    /// Maximum concurrent dial attempts.
    pub concurrency: usize,

    /// How long resolved addresses are trusted.
    #[serde(rename = "dns_cache_duration_ms", with = "millis")]
    pub dns_cache_duration: Duration,

    #[serde(rename = "sweep_interval_ms", with = "millis")]
    pub sweep_interval: Duration,

    /// Used by `dial` and `dial_dual_stack`.
    #[serde(rename = "dial_timeout_ms", with = "millis")]
    pub dial_timeout: Duration,

    /// Keep IPv6 addresses when resolving.
    pub dual_stack: bool,
}

impl Default for DialerOptions {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_DIAL_CONCURRENCY,
            dns_cache_duration: DEFAULT_DNS_CACHE_DURATION,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            dual_stack: false,
        }
    }
}

/// Options of the single-shot client.
///
/// Loaded from TOML with [`ClientOptions::from_toml_str`]; durations are
/// given in milliseconds (`timeout_ms`), custom headers as an array of
/// `[key, value]` pairs and raw bytes as a string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientOptions {
    /// Budget for a whole call, redirects included. Zero disables it.
    #[serde(rename = "timeout_ms", with = "millis")]
    pub timeout: Duration,

    pub follow_redirects: bool,
    pub max_redirects: usize,
    pub automatic_host_header: bool,
    pub automatic_content_length: bool,

    /// Buffer the whole body before returning the response.
    pub force_read_all_body: bool,

    #[serde(with = "header_pairs")]
    pub custom_headers: Headers,

    /// Sent instead of the structured request, after Host/Content-Length
    /// patching.
    #[serde(rename = "custom_raw_request", with = "raw_text")]
    pub custom_raw_bytes: Option<Vec<u8>>,

    /// `http://`, `socks5://` or `socks5h://` proxy URL.
    pub proxy: Option<String>,

    #[serde(rename = "proxy_dial_timeout_ms", with = "millis")]
    pub proxy_dial_timeout: Duration,

    /// TLS server name to send instead of the URL host.
    pub sni: Option<String>,

    /// Keep idle keep-alive connections for later calls to the same address.
    pub connection_reuse: bool,

    pub dialer: DialerOptions,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            follow_redirects: true,
            max_redirects: DEFAULT_MAX_REDIRECTS,
            automatic_host_header: true,
            automatic_content_length: true,
            force_read_all_body: false,
            custom_headers: Headers::new(),
            custom_raw_bytes: None,
            proxy: None,
            proxy_dial_timeout: DEFAULT_PROXY_DIAL_TIMEOUT,
            sni: None,
            connection_reuse: true,
            dialer: DialerOptions::default(),
        }
    }
}

impl ClientOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses and validates options from TOML text.
    ///
    /// # Errors
    /// [`ConfigError::Parse`] for malformed TOML or unknown keys,
    /// [`ConfigError::Invalid`] for values the client cannot run with.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let options: Self = toml::from_str(text)?;
        options.validate()?;
        Ok(options)
    }

    /// # Errors
    /// [`ConfigError::Invalid`] naming the offending setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dialer.concurrency == 0 {
            return Err(ConfigError::Invalid("dialer.concurrency must be positive".into()));
        }
        if self.dialer.sweep_interval.is_zero() {
            return Err(ConfigError::Invalid("dialer.sweep_interval_ms must be positive".into()));
        }
        if let Some(proxy) = &self.proxy {
            super::ProxyConfig::parse(proxy)
                .map_err(|err| ConfigError::Invalid(err.to_string()))?;
        }
        Ok(())
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_follow_redirects(mut self, follow: bool) -> Self {
        self.follow_redirects = follow;
        self
    }

    #[must_use]
    pub fn with_max_redirects(mut self, max: usize) -> Self {
        self.max_redirects = max;
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

    #[must_use]
    pub fn with_force_read_all_body(mut self, enabled: bool) -> Self {
        self.force_read_all_body = enabled;
        self
    }

    #[must_use]
    pub fn with_custom_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom_headers.push(key, value);
        self
    }

    #[must_use]
    pub fn with_custom_raw_bytes(mut self, raw: impl Into<Vec<u8>>) -> Self {
        self.custom_raw_bytes = Some(raw.into());
        self
    }

    #[must_use]
    pub fn with_proxy(mut self, proxy_url: impl Into<String>) -> Self {
        self.proxy = Some(proxy_url.into());
        self
    }

    #[must_use]
    pub fn with_proxy_dial_timeout(mut self, timeout: Duration) -> Self {
        self.proxy_dial_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_sni(mut self, server_name: impl Into<String>) -> Self {
        self.sni = Some(server_name.into());
        self
    }

    #[must_use]
    pub fn with_connection_reuse(mut self, enabled: bool) -> Self {
        self.connection_reuse = enabled;
        self
    }

    #[must_use]
    pub fn with_dialer(mut self, dialer: DialerOptions) -> Self {
        self.dialer = dialer;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = ClientOptions::default();
        assert_eq!(options.timeout, Duration::from_secs(30));
        assert!(options.follow_redirects);
        assert_eq!(options.max_redirects, 10);
        assert!(options.automatic_host_header);
        assert!(options.automatic_content_length);
        assert_eq!(options.dialer.concurrency, 1000);
        assert_eq!(options.dialer.dns_cache_duration, Duration::from_secs(60));
        assert_eq!(options.dialer.dial_timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_from_toml_str() {
        let options = ClientOptions::from_toml_str(
            r#"
            timeout_ms = 5000
            max_redirects = 2
            automatic_host_header = false
            proxy = "socks5h://127.0.0.1:9050"
            custom_headers = [["X-Scan", "1"], ["x-scan", "2"]]
            custom_raw_request = "GET / HTTP/1.1\r\n\r\n"

            [dialer]
            concurrency = 10
            dns_cache_duration_ms = 500
            "#,
        )
        .unwrap();

        assert_eq!(options.timeout, Duration::from_millis(5000));
        assert_eq!(options.max_redirects, 2);
        assert!(!options.automatic_host_header);
        assert!(options.follow_redirects);
        assert_eq!(options.custom_headers.get_all("X-SCAN").count(), 2);
        assert_eq!(options.custom_raw_bytes.as_deref(), Some(&b"GET / HTTP/1.1\r\n\r\n"[..]));
        assert_eq!(options.dialer.concurrency, 10);
        assert_eq!(options.dialer.dns_cache_duration, Duration::from_millis(500));
        assert_eq!(options.dialer.sweep_interval, DEFAULT_SWEEP_INTERVAL);
    }

    #[test]
    fn test_from_toml_rejects_bad_values() {
        assert!(matches!(
            ClientOptions::from_toml_str("unknown_key = 1"),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            ClientOptions::from_toml_str("proxy = \"ftp://proxy:21\""),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            ClientOptions::from_toml_str("[dialer]\nconcurrency = 0"),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_toml_round_trip_of_defaults() {
        let text = toml::to_string(&ClientOptions::default()).unwrap();
        assert_eq!(ClientOptions::from_toml_str(&text).unwrap(), ClientOptions::default());
    }
}
