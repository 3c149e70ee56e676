//! Single-shot raw HTTP client.
//!
//! WHY: Scanners need to send exactly the request they built, including
//! odd header casing, duplicate headers and hand-written raw bytes, and
//! still get redirects, timeouts, proxies and TLS handled for them.
//!
//! WHAT: Each call resolves the URL, obtains a connection (pooled, direct or
//! through a proxy), writes one request and reads one response, following
//! redirects up to the configured bound. The whole call, redirects
//! included, shares one absolute deadline.
//!
//! HOW: An explicit loop carrying a [`RedirectState`]. Redirect bodies are
//! drained so keep-alive connections can go back to the pool before the
//! next hop.

use std::io;

use crate::netcap::Deadline;
use crate::wire::raw_http::{
    patch_raw_request, raw_request_version, Headers, PatchOptions, Request, RequestBody, Response,
    Status, Version,
};

use super::{
    resolve_location, ClientOptions, DialOptions, ExchangeError, HttpConnection, HttpDialer,
    RawHttpError, RawHttpResult, RedirectState, TargetUrl,
};

/// Response of a single-shot exchange, together with the request that
/// produced it and the connection its body streams from.
///
/// Dropping it hands the connection back to the pool when the body was
/// read to the end and the server allows keep-alive.
#[derive(Debug)]
pub struct ClientResponse {
    request: Request,
    response: Response,
    connection: Option<HttpConnection>,
}

impl ClientResponse {
    #[must_use]
    pub fn request(&self) -> &Request {
        &self.request
    }

    #[must_use]
    pub fn response(&self) -> &Response {
        &self.response
    }

    pub fn response_mut(&mut self) -> &mut Response {
        &mut self.response
    }

    #[must_use]
    pub fn status(&self) -> &Status {
        &self.response.status
    }

    #[must_use]
    pub fn headers(&self) -> &Headers {
        &self.response.headers
    }

    #[must_use]
    pub fn content_length(&self) -> Option<u64> {
        self.response.content_length()
    }

    /// Reads the rest of the body.
    ///
    /// # Errors
    /// Propagates socket and gzip errors.
    pub fn body_bytes(&mut self) -> io::Result<Vec<u8>> {
        self.response.read_body()
    }

    /// # Errors
    /// Propagates socket and gzip errors.
    pub fn text(&mut self) -> io::Result<String> {
        self.response.text()
    }

    /// Returns the connection to the pool if it can be reused.
    pub fn release(self) {
        drop(self);
    }

    /// Closes the connection regardless of keep-alive.
    pub fn close(mut self) {
        if let Some(connection) = self.connection.take() {
            connection.close();
        }
    }
}

impl Drop for ClientResponse {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.release();
        }
    }
}

/// Client sending one raw request per call.
#[derive(Debug)]
pub struct RawHttpClient {
    dialer: HttpDialer,
    options: ClientOptions,
}

impl Default for RawHttpClient {
    fn default() -> Self {
        Self::new(ClientOptions::default())
    }
}

impl RawHttpClient {
    #[must_use]
    pub fn new(options: ClientOptions) -> Self {
        let dialer =
            HttpDialer::new(options.dialer.clone()).with_connection_reuse(options.connection_reuse);
        Self { dialer, options }
    }

    /// Builds a client around an existing dialer, sharing its DNS cache and
    /// connection pool.
    #[must_use]
    pub fn with_dialer(options: ClientOptions, dialer: HttpDialer) -> Self {
        Self { dialer, options }
    }

    #[must_use]
    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    #[must_use]
    pub fn dialer(&self) -> &HttpDialer {
        &self.dialer
    }

    /// # Errors
    /// See [`RawHttpClient::do_raw_with_options`].
    pub fn head(&self, url: &str) -> Result<ClientResponse, ExchangeError> {
        self.do_raw("HEAD", url, None, Headers::new(), None)
    }

    /// # Errors
    /// See [`RawHttpClient::do_raw_with_options`].
    pub fn get(&self, url: &str) -> Result<ClientResponse, ExchangeError> {
        self.do_raw("GET", url, None, Headers::new(), None)
    }

    /// POSTs `body` with the given `Content-Type`.
    ///
    /// # Errors
    /// See [`RawHttpClient::do_raw_with_options`].
    pub fn post(
        &self,
        url: &str,
        content_type: &str,
        body: impl Into<RequestBody>,
    ) -> Result<ClientResponse, ExchangeError> {
        let mut headers = Headers::new();
        headers.push("Content-Type", content_type);
        self.do_raw("POST", url, None, headers, Some(body.into()))
    }

    /// Sends `request`'s method, headers and body to `url`. A non-empty
    /// `request.path` (with its query) replaces the URL path and query;
    /// otherwise query segments are appended to the URL's own.
    ///
    /// # Errors
    /// See [`RawHttpClient::do_raw_with_options`].
    pub fn do_request(&self, url: &str, mut request: Request) -> Result<ClientResponse, ExchangeError> {
        let mut target = TargetUrl::parse(url)?;
        let uri_path = if request.path.is_empty() {
            if !request.query.is_empty() {
                let mut segments: Vec<String> = target.query.take().into_iter().collect();
                segments.extend(request.query.iter().cloned());
                target.query = Some(segments.join("&"));
            }
            None
        } else {
            Some(request.target())
        };
        let body = request.take_body();
        self.exchange(
            &request.method,
            target,
            uri_path.as_deref(),
            &request.headers,
            body,
            &self.options,
        )
    }

    /// Sends `method` to `url` with the client's options. `uri_path`, when
    /// given, is put on the request line instead of the URL's path and
    /// query.
    ///
    /// # Errors
    /// See [`RawHttpClient::do_raw_with_options`].
    pub fn do_raw(
        &self,
        method: &str,
        url: &str,
        uri_path: Option<&str>,
        headers: Headers,
        body: Option<RequestBody>,
    ) -> Result<ClientResponse, ExchangeError> {
        self.do_raw_with_options(method, url, uri_path, headers, body, &self.options)
    }

    /// Like [`RawHttpClient::do_raw`] with per-call options.
    ///
    /// # Errors
    /// An [`ExchangeError`] carrying the request built for the failing hop,
    /// when one was built, and the [`RawHttpError`] that ended the call.
    pub fn do_raw_with_options(
        &self,
        method: &str,
        url: &str,
        uri_path: Option<&str>,
        headers: Headers,
        body: Option<RequestBody>,
        options: &ClientOptions,
    ) -> Result<ClientResponse, ExchangeError> {
        let target = TargetUrl::parse(url)?;
        self.exchange(method, target, uri_path, &headers, body, options)
    }

    /// The exact bytes `do_raw` would write for the first hop, without
    /// dialing. The automatic Host keeps its leading space and custom raw
    /// bytes come back already patched, so the dump matches the wire rather
    /// than the caller's input.
    ///
    /// # Errors
    /// [`RawHttpError::InvalidUrl`], or a failure reading a streamed body.
    pub fn dump_raw(
        &self,
        method: &str,
        url: &str,
        uri_path: Option<&str>,
        headers: &Headers,
        body: Option<RequestBody>,
    ) -> RawHttpResult<Vec<u8>> {
        let target = TargetUrl::parse(url)?;
        let mut request = build_request(method, &target, uri_path, headers, body, &self.options);
        request.to_bytes().map_err(RawHttpError::write)
    }

    /// Stops the DNS sweep and closes pooled connections.
    pub fn close(&self) {
        self.dialer.close();
    }

    fn exchange(
        &self,
        method: &str,
        mut target: TargetUrl,
        uri_path: Option<&str>,
        headers: &Headers,
        mut body: Option<RequestBody>,
        options: &ClientOptions,
    ) -> Result<ClientResponse, ExchangeError> {
        let deadline = Deadline::after(options.timeout);
        let mut redirects = RedirectState::new(options.follow_redirects, options.max_redirects);

        loop {
            let mut request = build_request(method, &target, uri_path, headers, body.take(), options);

            let mut connection = match self.connect(&target, options, deadline) {
                Ok(connection) => connection,
                Err(err) => return Err(ExchangeError::new(Some(request), err)),
            };
            connection.set_deadline(deadline);

            if let Err(err) = connection.write_request(&mut request) {
                connection.close();
                return Err(ExchangeError::new(Some(request), err));
            }

            let response = match connection.read_response(options.force_read_all_body) {
                Ok(response) => response,
                Err(err) => {
                    connection.close();
                    return Err(ExchangeError::new(Some(request), err));
                }
            };

            let location = response
                .headers
                .get("Location")
                .filter(|location| !location.trim().is_empty())
                .map(str::to_string);
            let next = match location {
                Some(location) if redirects.should_follow(&response.status) => {
                    match resolve_location(&target, &location) {
                        Ok(next) => next,
                        Err(err) => return Err(ExchangeError::new(Some(request), err)),
                    }
                }
                _ => {
                    return Ok(ClientResponse {
                        request,
                        response,
                        connection: Some(connection),
                    })
                }
            };

            let status = response.status.clone();
            drop(response);
            if let Err(err) = connection.drain_body() {
                connection.close();
                return Err(ExchangeError::new(Some(request), RawHttpError::read(err)));
            }
            connection.release();

            redirects.advance();
            tracing::debug!(
                "Following {status} from {target} to {next} ({}/{})",
                redirects.current,
                redirects.max
            );

            body = request.take_body();
            target = next;
        }
    }

    fn connect(
        &self,
        target: &TargetUrl,
        options: &ClientOptions,
        deadline: Deadline,
    ) -> RawHttpResult<HttpConnection> {
        let mut dial = DialOptions::new(target.protocol, target.address())
            .with_deadline(deadline)
            .with_dual_stack(options.dialer.dual_stack);

        if let Some(sni) = options.sni.as_deref().filter(|sni| !sni.is_empty()) {
            dial = dial.with_server_name(sni);
        }

        dial = match options.proxy.as_deref().filter(|proxy| !proxy.is_empty()) {
            Some(proxy) => dial
                .with_proxy(proxy)
                .with_dial_timeout(options.proxy_dial_timeout),
            None if !options.timeout.is_zero() => dial.with_dial_timeout(options.timeout),
            None => dial.with_dial_timeout(options.dialer.dial_timeout),
        };

        if options.connection_reuse {
            return self.dialer.dial_with_options(&dial);
        }
        self.dialer
            .clone()
            .with_connection_reuse(false)
            .dial_with_options(&dial)
    }
}

/// Builds the request for one hop.
///
/// Caller headers come first and the automatic Host header (value with a
/// leading space) replaces any caller `Host`. The options' custom headers
/// follow in order; a custom `Host` replaces the automatic one in place.
/// Raw bytes from the options replace the structured request after Host
/// and Content-Length patching against the URL authority.
fn build_request(
    method: &str,
    target: &TargetUrl,
    uri_path: Option<&str>,
    headers: &Headers,
    body: Option<RequestBody>,
    options: &ClientOptions,
) -> Request {
    let mut headers = headers.clone();
    if options.automatic_host_header {
        headers.set("Host", format!(" {}", target.authority));
    }
    for header in &options.custom_headers {
        if header.key == "Host" {
            headers.set(header.key.clone(), header.value.clone());
        } else {
            headers.push(header.key.clone(), header.value.clone());
        }
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

    if let Some(raw) = options.custom_raw_bytes.as_ref().filter(|raw| !raw.is_empty()) {
        let patch = PatchOptions {
            automatic_host: options.automatic_host_header,
            automatic_content_length: options.automatic_content_length,
        };
        request.version = raw_request_version(raw).unwrap_or(Version::HTTP_1_1);
        request.raw = Some(patch_raw_request(raw, &target.authority, patch));
    }

    request
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(url: &str) -> TargetUrl {
        TargetUrl::parse(url).unwrap()
    }

    /// WHY: Legacy captures carry the automatic Host value with a leading
    /// space; byte-for-byte replays depend on it
    /// WHAT: The serialized request has `Host:  example.com`
    #[test]
    fn test_automatic_host_has_leading_space() {
        let mut request = build_request(
            "GET",
            &target("http://example.com/path?a=1&b=2"),
            None,
            &Headers::new(),
            None,
            &ClientOptions::default(),
        );
        let bytes = String::from_utf8(request.to_bytes().unwrap()).unwrap();
        assert_eq!(bytes, "GET /path?a=1&b=2 HTTP/1.1\r\nHost:  example.com\r\n\r\n");
    }

    #[test]
    fn test_headers_keep_caller_order_and_duplicates() {
        let headers: Headers = [("x-b", "1"), ("X-A", "2"), ("x-b", "3")].into_iter().collect();
        let options = ClientOptions::default()
            .with_automatic_host_header(false)
            .with_custom_header("X-Custom", "c");
        let mut request = build_request("GET", &target("http://h.test/"), Some("/override"), &headers, None, &options);
        let bytes = String::from_utf8(request.to_bytes().unwrap()).unwrap();
        assert_eq!(
            bytes,
            "GET /override HTTP/1.1\r\nx-b: 1\r\nX-A: 2\r\nx-b: 3\r\nX-Custom: c\r\n\r\n"
        );
    }

    #[test]
    fn test_body_gets_content_length() {
        let mut request = build_request(
            "POST",
            &target("http://h.test/submit"),
            None,
            &Headers::new(),
            Some("a=b".into()),
            &ClientOptions::default().with_automatic_host_header(false),
        );
        let bytes = String::from_utf8(request.to_bytes().unwrap()).unwrap();
        assert_eq!(bytes, "POST /submit HTTP/1.1\r\nContent-Length: 3\r\n\r\na=b");
    }

    #[test]
    fn test_custom_raw_bytes_are_patched() {
        let options = ClientOptions::default()
            .with_custom_raw_bytes("GET /x HTTP/1.0\nHost: old\n\nbody".as_bytes());
        let mut request = build_request("GET", &target("http://new.test:81/"), None, &Headers::new(), None, &options);
        assert_eq!(request.version, Version::HTTP_1_0);
        let bytes = String::from_utf8(request.to_bytes().unwrap()).unwrap();
        assert_eq!(
            bytes,
            "GET /x HTTP/1.0\r\nHost: new.test:81\r\nContent-Length: 4\r\n\r\nbody"
        );
    }

    #[test]
    fn test_dump_raw_does_not_dial() {
        let client = RawHttpClient::default();
        let bytes = client
            .dump_raw("OPTIONS", "http://unresolvable.invalid/", Some("*"), &Headers::new(), None)
            .unwrap();
        assert_eq!(bytes, b"OPTIONS * HTTP/1.1\r\nHost:  unresolvable.invalid\r\n\r\n");
        client.close();
    }

    /// WHY: Host header injection needs the caller's value on the wire
    /// WHAT: A custom `Host` replaces the automatic one in its position
    #[test]
    fn test_custom_host_header_wins_over_automatic() {
        let headers: Headers = [("Host", "caller.test"), ("X-A", "1")].into_iter().collect();
        let options = ClientOptions::default()
            .with_custom_header("Host", "evil.test")
            .with_custom_header("X-B", "2");
        let mut request = build_request("GET", &target("http://real.test/"), None, &headers, None, &options);
        let bytes = String::from_utf8(request.to_bytes().unwrap()).unwrap();
        assert_eq!(bytes, "GET / HTTP/1.1\r\nHost: evil.test\r\nX-A: 1\r\nX-B: 2\r\n\r\n");

        let options = ClientOptions::default().with_custom_header("X-B", "2");
        let mut request = build_request("GET", &target("http://real.test/"), None, &headers, None, &options);
        let bytes = String::from_utf8(request.to_bytes().unwrap()).unwrap();
        assert_eq!(bytes, "GET / HTTP/1.1\r\nHost:  real.test\r\nX-A: 1\r\nX-B: 2\r\n\r\n");
    }

    #[test]
    fn test_dump_raw_returns_patched_raw_bytes() {
        let client = RawHttpClient::new(
            ClientOptions::default().with_custom_raw_bytes("POST /r HTTP/1.1\nHost: x\n\nab".as_bytes()),
        );
        let bytes = client
            .dump_raw("GET", "http://dump.test:8080/", None, &Headers::new(), None)
            .unwrap();
        assert_eq!(bytes, b"POST /r HTTP/1.1\r\nHost: dump.test:8080\r\nContent-Length: 2\r\n\r\nab");
        client.close();
    }

    #[test]
    fn test_invalid_url_has_no_request() {
        let client = RawHttpClient::default();
        let err = client.get("http://").unwrap_err();
        assert!(err.request.is_none());
        assert!(matches!(err.error, RawHttpError::InvalidUrl(_)));
        client.close();
    }
}
