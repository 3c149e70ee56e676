use std::fmt;
use std::io::{self, Read, Write};
use std::str::FromStr;

use super::{WireError, WireResult};

pub const CRLF: &str = "\r\n";

/// HTTP protocol version, written on the wire as `HTTP/<major>.<minor>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
}

impl Version {
    pub const HTTP_1_0: Version = Version { major: 1, minor: 0 };
    pub const HTTP_1_1: Version = Version { major: 1, minor: 1 };

    #[must_use]
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    /// Parses exactly `HTTP/X.Y` with single decimal digits.
    ///
    /// # Errors
    /// Returns [`WireError::InvalidVersion`] for any other shape.
    pub fn parse(token: &str) -> WireResult<Self> {
        let bytes = token.as_bytes();
        if bytes.len() != 8
            || !bytes.starts_with(b"HTTP/")
            || !bytes[5].is_ascii_digit()
            || bytes[6] != b'.'
            || !bytes[7].is_ascii_digit()
        {
            return Err(WireError::InvalidVersion(token.to_owned()));
        }

        Ok(Self {
            major: bytes[5] - b'0',
            minor: bytes[7] - b'0',
        })
    }

    /// HTTP/1.1 and later keep connections open unless told otherwise.
    #[must_use]
    pub fn persistent_by_default(&self) -> bool {
        (self.major, self.minor) >= (1, 1)
    }
}

impl Default for Version {
    fn default() -> Self {
        Self::HTTP_1_1
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HTTP/{}.{}", self.major, self.minor)
    }
}

impl FromStr for Version {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// A single header line. Key casing is kept exactly as given.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub key: String,
    pub value: String,
}

impl Header {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    #[must_use]
    pub fn is(&self, name: &str) -> bool {
        self.key.eq_ignore_ascii_case(name)
    }
}

/// Ordered header list. Duplicates and arbitrary casing are preserved and
/// written back in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<Header>);

impl Headers {
    #[must_use]
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.push(Header::new(key, value));
    }

    /// Replaces the value of the first header whose key matches `key`
    /// exactly and drops any later exact matches; appends when absent.
    /// Differently cased keys are left alone.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.0.iter().position(|header| header.key == key) {
            Some(index) => {
                self.0[index].value = value;
                let mut seen = 0usize;
                self.0.retain(|header| {
                    if header.key != key {
                        return true;
                    }
                    seen += 1;
                    seen == 1
                });
            }
            None => self.0.push(Header { key, value }),
        }
    }

    /// First value for `name`, compared case-insensitively.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|header| header.is(name))
            .map(|header| header.value.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.0
            .iter()
            .filter(move |header| header.is(name))
            .map(|header| header.value.as_str())
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.0.iter().any(|header| header.is(name))
    }

    /// Removes every header matching `name` case-insensitively.
    pub fn remove(&mut self, name: &str) {
        self.0.retain(|header| !header.is(name));
    }

    pub fn extend(&mut self, other: &Headers) {
        self.0.extend(other.0.iter().cloned());
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Header> {
        self.0.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True when `name` carries `token` in its comma separated value list.
    #[must_use]
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name)
            .flat_map(|value| value.split(','))
            .any(|part| part.trim().eq_ignore_ascii_case(token))
    }
}

impl<'a> IntoIterator for &'a Headers {
    type Item = &'a Header;
    type IntoIter = std::slice::Iter<'a, Header>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(
            iter.into_iter()
                .map(|(key, value)| Header::new(key, value))
                .collect(),
        )
    }
}

/// Response status code and reason phrase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub code: u16,
    pub reason: String,
}

impl Status {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn is_redirect(&self) -> bool {
        matches!(self.code, 301 | 302 | 303 | 307 | 308)
    }

    #[must_use]
    pub fn is_informational(&self) -> bool {
        (100..200).contains(&self.code)
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.reason)
    }
}

/// Request payload.
pub enum RequestBody {
    /// Fully buffered; length known and replayable.
    Bytes(Vec<u8>),
    /// Read lazily while writing; length unknown.
    Stream(Box<dyn Read + Send>),
    /// A stream that was already written once.
    Consumed,
}

impl RequestBody {
    #[must_use]
    pub fn len(&self) -> Option<u64> {
        match self {
            Self::Bytes(bytes) => Some(bytes.len() as u64),
            Self::Stream(_) | Self::Consumed => None,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Bytes(bytes) => bytes.is_empty(),
            Self::Stream(_) => false,
            Self::Consumed => true,
        }
    }

    pub fn stream(reader: impl Read + Send + 'static) -> Self {
        Self::Stream(Box::new(reader))
    }
}

impl fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
            Self::Stream(_) => f.write_str("Stream"),
            Self::Consumed => f.write_str("Consumed"),
        }
    }
}

impl From<Vec<u8>> for RequestBody {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

impl From<&[u8]> for RequestBody {
    fn from(value: &[u8]) -> Self {
        Self::Bytes(value.to_vec())
    }
}

impl From<String> for RequestBody {
    fn from(value: String) -> Self {
        Self::Bytes(value.into_bytes())
    }
}

impl From<&str> for RequestBody {
    fn from(value: &str) -> Self {
        Self::Bytes(value.as_bytes().to_vec())
    }
}

/// An HTTP request exactly as it will be written.
///
/// When `raw` holds bytes they are sent verbatim and every structured field
/// is ignored for serialization; the fields stay populated so callers can
/// inspect what was asked for.
#[derive(Debug)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub query: Vec<String>,
    pub version: Version,
    pub headers: Headers,
    pub body: Option<RequestBody>,
    pub raw: Option<Vec<u8>>,
    pub automatic_host: bool,
    pub automatic_content_length: bool,
}

impl Request {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            query: Vec::new(),
            version: Version::HTTP_1_1,
            headers: Headers::new(),
            body: None,
            raw: None,
            automatic_host: false,
            automatic_content_length: false,
        }
    }

    #[must_use]
    pub fn with_version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push(key, value);
        self
    }

    #[must_use]
    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    #[must_use]
    pub fn with_query(mut self, segment: impl Into<String>) -> Self {
        self.query.push(segment.into());
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<RequestBody>) -> Self {
        self.body = Some(body.into());
        self
    }

    #[must_use]
    pub fn with_raw(mut self, raw: Vec<u8>) -> Self {
        self.raw = Some(raw);
        self
    }

    #[must_use]
    pub fn with_automatic_content_length(mut self, enabled: bool) -> Self {
        self.automatic_content_length = enabled;
        self
    }

    #[must_use]
    pub fn with_automatic_host(mut self, enabled: bool) -> Self {
        self.automatic_host = enabled;
        self
    }

    /// Body length, known only for buffered bodies.
    #[must_use]
    pub fn content_length(&self) -> Option<u64> {
        self.body.as_ref().and_then(RequestBody::len)
    }

    #[must_use]
    pub fn is_head(&self) -> bool {
        self.method.eq_ignore_ascii_case("HEAD")
    }

    #[must_use]
    pub fn has_raw(&self) -> bool {
        self.raw.as_ref().is_some_and(|raw| !raw.is_empty())
    }

    /// Request target: path followed by `?` and the `&` joined query.
    #[must_use]
    pub fn target(&self) -> String {
        if self.query.is_empty() {
            return self.path.clone();
        }
        format!("{}?{}", self.path, self.query.join("&"))
    }

    pub fn take_body(&mut self) -> Option<RequestBody> {
        self.body.take()
    }

    /// Writes the request to `writer`. A streamed body is consumed and left
    /// as [`RequestBody::Consumed`].
    ///
    /// # Errors
    /// Propagates write failures and errors from a streamed body.
    pub fn write_to<W: Write>(&mut self, writer: &mut W) -> io::Result<()> {
        if let Some(raw) = self.raw.as_ref().filter(|raw| !raw.is_empty()) {
            writer.write_all(raw)?;
            return writer.flush();
        }

        let mut head = format!("{} {} {}{CRLF}", self.method, self.target(), self.version);
        for header in &self.headers {
            head.push_str(&header.key);
            // an empty value leaves the bare key on its own line
            if !header.value.is_empty() {
                head.push_str(": ");
                head.push_str(&header.value);
            }
            head.push_str(CRLF);
        }
        if self.automatic_content_length {
            if let Some(length) = self.content_length() {
                head.push_str(&format!("Content-Length: {length}{CRLF}"));
            }
        }
        head.push_str(CRLF);
        writer.write_all(head.as_bytes())?;

        match self.body.as_mut() {
            Some(RequestBody::Bytes(bytes)) => writer.write_all(bytes)?,
            Some(RequestBody::Stream(reader)) => {
                io::copy(reader, writer)?;
                self.body = Some(RequestBody::Consumed);
            }
            Some(RequestBody::Consumed) | None => {}
        }

        writer.flush()
    }

    /// The exact bytes [`Request::write_to`] would send.
    ///
    /// # Errors
    /// Propagates errors from a streamed body.
    pub fn to_bytes(&mut self) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        self.write_to(&mut out)?;
        Ok(out)
    }
}

/// Splits a request line into method, target and version.
///
/// # Errors
/// Returns [`WireError::InvalidRequestLine`] when fewer than three tokens
/// are present and [`WireError::InvalidVersion`] for a bad version token.
pub fn parse_request_line(line: &str) -> WireResult<(String, String, Version)> {
    let mut parts = line.trim_end_matches(['\r', '\n']).split(' ');
    let (Some(method), Some(target), Some(version)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(WireError::InvalidRequestLine(line.to_owned()));
    };
    if method.is_empty() {
        return Err(WireError::InvalidRequestLine(line.to_owned()));
    }
    Ok((method.to_owned(), target.to_owned(), Version::parse(version)?))
}
