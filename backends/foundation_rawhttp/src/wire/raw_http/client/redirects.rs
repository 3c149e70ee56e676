use crate::wire::raw_http::Status;

use super::{Protocol, RawHttpError, RawHttpResult};

/// A request URL broken into what the clients dial and send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetUrl {
    pub protocol: Protocol,
    /// Hostname, IPv6 literals in brackets.
    pub host: String,
    pub port: u16,
    /// Host as written in the URL, with the port only when one was given.
    pub authority: String,
    pub path: String,
    pub query: Option<String>,
}

impl TargetUrl {
    /// Parses `raw_url`. The protocol comes from a case-insensitive
    /// `https://` prefix; anything else is plain HTTP. URLs without a
    /// scheme are read as `http://`.
    ///
    /// # Errors
    /// [`RawHttpError::InvalidUrl`] when no host can be found.
    pub fn parse(raw_url: &str) -> RawHttpResult<Self> {
        let invalid = |reason: String| RawHttpError::InvalidUrl(format!("{raw_url}: {reason}"));

        let url = match url::Url::parse(raw_url) {
            Ok(url) => url,
            Err(url::ParseError::RelativeUrlWithoutBase) => url::Url::parse(&format!("http://{raw_url}"))
                .map_err(|err| invalid(err.to_string()))?,
            Err(err) => return Err(invalid(err.to_string())),
        };

        let protocol = Protocol::from_url(raw_url);
        let host = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| invalid("missing host".into()))?
            .to_string();

        let authority = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.clone(),
        };
        let port = url.port().unwrap_or_else(|| protocol.default_port());

        let path = if url.path().is_empty() {
            "/".to_string()
        } else {
            url.path().to_string()
        };

        Ok(Self {
            protocol,
            host,
            port,
            authority,
            path,
            query: url.query().filter(|query| !query.is_empty()).map(str::to_string),
        })
    }

    /// `host:port` to dial.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Path plus `?query` as it goes on the request line.
    #[must_use]
    pub fn request_target(&self) -> String {
        match &self.query {
            Some(query) => format!("{}?{query}", self.path),
            None => self.path.clone(),
        }
    }

    fn origin(&self) -> String {
        format!("{}://{}", self.protocol, self.authority)
    }
}

impl core::fmt::Display for TargetUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.origin(), self.request_target())
    }
}

/// Resolves a `Location` header value against the URL that was requested.
///
/// Supports absolute URLs, scheme-relative (`//host/..`), absolute-path,
/// query-only and relative-path references.
///
/// # Errors
/// [`RawHttpError::InvalidUrl`] when the resolved location does not parse.
pub fn resolve_location(base: &TargetUrl, location: &str) -> RawHttpResult<TargetUrl> {
    let location = location.trim();

    if location.contains("://") {
        return TargetUrl::parse(location);
    }
    if location.starts_with("//") {
        return TargetUrl::parse(&format!("{}:{location}", base.protocol));
    }
    if location.starts_with('/') {
        return TargetUrl::parse(&format!("{}{location}", base.origin()));
    }
    if location.starts_with('?') {
        return TargetUrl::parse(&format!("{}{}{location}", base.origin(), base.path));
    }

    let parent = match base.path.rfind('/') {
        Some(pos) => &base.path[..=pos],
        None => "/",
    };
    TargetUrl::parse(&format!("{}{parent}{location}", base.origin()))
}

/// Progress through a chain of redirects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedirectState {
    pub follow: bool,
    pub max: usize,
    /// Redirects followed so far.
    pub current: usize,
}

impl RedirectState {
    #[must_use]
    pub fn new(follow: bool, max: usize) -> Self {
        Self {
            follow,
            max,
            current: 0,
        }
    }

    /// Whether a response with `status` starts another hop: it must be a
    /// redirect, following must be on and fewer than `max` hops taken.
    #[must_use]
    pub fn should_follow(&self, status: &Status) -> bool {
        self.follow && status.is_redirect() && self.current < self.max
    }

    pub fn advance(&mut self) {
        self.current += 1;
    }
}
