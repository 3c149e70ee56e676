use std::fmt;
use std::io::{self, BufRead, Cursor, Read};

use super::{Headers, Status, Version, WireError, WireResult};

pub const MAX_HEADER_LINE: usize = 64 * 1024;
pub const MAX_HEADER_BLOCK: usize = 1024 * 1024;
pub const MAX_HEADER_LINES: usize = 1000;

/// Blank lines tolerated before the status line.
const MAX_LEADING_BLANK_LINES: usize = 4;

/// Reads one line terminated by `\n`, without the terminator (and without a
/// preceding `\r`). Returns `None` on a clean EOF before any byte.
///
/// # Errors
/// [`WireError::HeaderLineTooLong`] past `limit` bytes,
/// [`WireError::UnexpectedEof`] when the stream ends mid-line.
pub fn read_line<R: BufRead + ?Sized>(reader: &mut R, limit: usize) -> WireResult<Option<String>> {
    let mut line = Vec::new();
    loop {
        let available = match reader.fill_buf() {
            Ok(buf) => buf,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(WireError::Io(err)),
        };

        if available.is_empty() {
            if line.is_empty() {
                return Ok(None);
            }
            return Err(WireError::UnexpectedEof);
        }

        let (consumed, done) = match available.iter().position(|byte| *byte == b'\n') {
            Some(index) => {
                line.extend_from_slice(&available[..index]);
                (index + 1, true)
            }
            None => {
                line.extend_from_slice(available);
                (available.len(), false)
            }
        };
        reader.consume(consumed);

        if line.len() > limit {
            return Err(WireError::HeaderLineTooLong { limit });
        }

        if done {
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
        }
    }
}

/// How the body following a response head is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Empty,
    Length(u64),
    UntilClose,
}

/// Status line and headers of a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub version: Version,
    pub status: Status,
    pub headers: Headers,
}

impl ResponseHead {
    /// Parses `VERSION CODE [REASON]`.
    ///
    /// # Errors
    /// [`WireError::InvalidStatusLine`] or [`WireError::InvalidVersion`].
    pub fn parse_status_line(line: &str) -> WireResult<(Version, Status)> {
        let mut parts = line.splitn(3, ' ');
        let version = parts
            .next()
            .ok_or_else(|| WireError::InvalidStatusLine(line.to_owned()))?;
        let version = Version::parse(version)?;

        let code = parts.next().unwrap_or_default();
        if code.len() != 3 || !code.bytes().all(|b| b.is_ascii_digit()) {
            return Err(WireError::InvalidStatusLine(line.to_owned()));
        }
        let code: u16 = code
            .parse()
            .map_err(|_| WireError::InvalidStatusLine(line.to_owned()))?;

        let reason = parts.next().unwrap_or_default().trim();
        Ok((version, Status::new(code, reason)))
    }

    /// Reads the status line and header block.
    ///
    /// # Errors
    /// Any [`WireError`]; a clean EOF before the status line is
    /// [`WireError::UnexpectedEof`].
    pub fn read_from<R: BufRead + ?Sized>(reader: &mut R) -> WireResult<Self> {
        let mut status_line = None;
        for _ in 0..=MAX_LEADING_BLANK_LINES {
            match read_line(reader, MAX_HEADER_LINE)? {
                None => return Err(WireError::UnexpectedEof),
                Some(line) if line.trim().is_empty() => {}
                Some(line) => {
                    status_line = Some(line);
                    break;
                }
            }
        }
        let status_line = status_line.ok_or_else(|| WireError::InvalidStatusLine(String::new()))?;
        let (version, status) = Self::parse_status_line(&status_line)?;

        let mut headers = Headers::new();
        let mut total = status_line.len();
        loop {
            let Some(line) = read_line(reader, MAX_HEADER_LINE)? else {
                return Err(WireError::UnexpectedEof);
            };
            if line.is_empty() {
                break;
            }

            total += line.len();
            if total > MAX_HEADER_BLOCK {
                return Err(WireError::HeadersTooLarge {
                    limit: MAX_HEADER_BLOCK,
                });
            }
            if headers.len() >= MAX_HEADER_LINES {
                return Err(WireError::TooManyHeaders {
                    limit: MAX_HEADER_LINES,
                });
            }

            match line.split_once(':') {
                Some((key, value)) => headers.push(key.trim_end(), value.trim()),
                None => headers.push(line.trim(), ""),
            }
        }

        Ok(Self {
            version,
            status,
            headers,
        })
    }

    /// Body framing for this head; `head_request` marks a reply to HEAD.
    #[must_use]
    pub fn framing(&self, head_request: bool) -> Framing {
        if head_request || self.status.is_informational() || matches!(self.status.code, 204 | 304)
        {
            return Framing::Empty;
        }

        match self
            .headers
            .get_all("Content-Length")
            .find_map(|value| value.trim().parse::<u64>().ok())
        {
            Some(0) => Framing::Empty,
            Some(length) => Framing::Length(length),
            None => Framing::UntilClose,
        }
    }

    #[must_use]
    pub fn is_gzip(&self) -> bool {
        self.headers
            .get("Content-Encoding")
            .is_some_and(|value| value.trim().eq_ignore_ascii_case("gzip"))
    }

    /// Whether the server expects the connection to stay open.
    #[must_use]
    pub fn keep_alive(&self) -> bool {
        if self.headers.has_token("Connection", "close") {
            return false;
        }
        self.version.persistent_by_default() || self.headers.has_token("Connection", "keep-alive")
    }
}

enum BodyInner {
    Empty,
    Buffered(Cursor<Vec<u8>>),
    Stream(Box<dyn Read + Send>),
}

/// Response payload as a byte stream.
pub struct ResponseBody(BodyInner);

impl ResponseBody {
    #[must_use]
    pub fn empty() -> Self {
        Self(BodyInner::Empty)
    }

    #[must_use]
    pub fn buffered(bytes: Vec<u8>) -> Self {
        Self(BodyInner::Buffered(Cursor::new(bytes)))
    }

    pub fn stream(reader: impl Read + Send + 'static) -> Self {
        Self(BodyInner::Stream(Box::new(reader)))
    }

    #[must_use]
    pub fn is_buffered(&self) -> bool {
        !matches!(self.0, BodyInner::Stream(_))
    }
}

impl Read for ResponseBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.0 {
            BodyInner::Empty => Ok(0),
            BodyInner::Buffered(cursor) => cursor.read(buf),
            BodyInner::Stream(reader) => reader.read(buf),
        }
    }
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            BodyInner::Empty => f.write_str("ResponseBody::Empty"),
            BodyInner::Buffered(cursor) => {
                write!(f, "ResponseBody::Buffered({} bytes)", cursor.get_ref().len())
            }
            BodyInner::Stream(_) => f.write_str("ResponseBody::Stream"),
        }
    }
}

#[cfg(feature = "gzip")]
fn gunzip_reader(source: Box<dyn Read + Send>) -> Box<dyn Read + Send> {
    Box::new(flate2::read::GzDecoder::new(source))
}

#[cfg(not(feature = "gzip"))]
fn gunzip_reader(source: Box<dyn Read + Send>) -> Box<dyn Read + Send> {
    source
}

#[cfg(feature = "gzip")]
fn gunzip_bytes(bytes: Vec<u8>) -> io::Result<Vec<u8>> {
    let mut decoded = Vec::with_capacity(bytes.len() * 2);
    flate2::read::GzDecoder::new(bytes.as_slice()).read_to_end(&mut decoded)?;
    Ok(decoded)
}

#[cfg(not(feature = "gzip"))]
fn gunzip_bytes(bytes: Vec<u8>) -> io::Result<Vec<u8>> {
    Ok(bytes)
}

/// Reads a framed body completely.
///
/// # Errors
/// `UnexpectedEof` when a length-framed body is cut short.
pub fn read_framed_body<R: Read + ?Sized>(source: &mut R, framing: Framing) -> io::Result<Vec<u8>> {
    let mut bytes = Vec::new();
    match framing {
        Framing::Empty => {}
        Framing::Length(length) => {
            source.take(length).read_to_end(&mut bytes)?;
            if (bytes.len() as u64) < length {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("body ended after {} of {length} bytes", bytes.len()),
                ));
            }
        }
        Framing::UntilClose => {
            source.read_to_end(&mut bytes)?;
        }
    }
    Ok(bytes)
}

/// A parsed HTTP response.
///
/// `content_length` is either the value of a usable Content-Length header
/// or the size of a fully buffered body. It is `None` when neither applies,
/// including gzip bodies streamed through the decompressor.
#[derive(Debug)]
pub struct Response {
    pub version: Version,
    pub status: Status,
    pub headers: Headers,
    content_length: Option<u64>,
    body: ResponseBody,
}

impl Response {
    /// Wraps a lazy body stream positioned right after `head`.
    #[must_use]
    pub fn streaming(head: ResponseHead, framing: Framing, source: Box<dyn Read + Send>) -> Self {
        let gzip = head.is_gzip();
        let (content_length, body) = match framing {
            Framing::Empty => (Some(0), ResponseBody::empty()),
            Framing::Length(length) if !gzip => (Some(length), ResponseBody(BodyInner::Stream(source))),
            Framing::Length(_) | Framing::UntilClose => {
                let source = if gzip { gunzip_reader(source) } else { source };
                (None, ResponseBody(BodyInner::Stream(source)))
            }
        };

        Self {
            version: head.version,
            status: head.status,
            headers: head.headers,
            content_length,
            body,
        }
    }

    /// Builds a response around an already read body, gunzipping it when
    /// the head says so.
    ///
    /// # Errors
    /// Propagates gzip decoding failures.
    pub fn buffered(head: ResponseHead, raw_body: Vec<u8>) -> io::Result<Self> {
        let bytes = if head.is_gzip() && !raw_body.is_empty() {
            gunzip_bytes(raw_body)?
        } else {
            raw_body
        };

        Ok(Self {
            version: head.version,
            status: head.status,
            headers: head.headers,
            content_length: Some(bytes.len() as u64),
            body: ResponseBody::buffered(bytes),
        })
    }

    /// Reads a complete response (head and fully buffered body).
    ///
    /// # Errors
    /// Parse failures and I/O errors while reading the body.
    pub fn read_buffered<R: BufRead + ?Sized>(reader: &mut R, head_request: bool) -> WireResult<Self> {
        let head = ResponseHead::read_from(reader)?;
        let framing = head.framing(head_request);
        let raw_body = read_framed_body(reader, framing)?;
        Ok(Self::buffered(head, raw_body)?)
    }

    #[must_use]
    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    #[must_use]
    pub fn head(&self) -> ResponseHead {
        ResponseHead {
            version: self.version,
            status: self.status.clone(),
            headers: self.headers.clone(),
        }
    }

    pub fn body(&mut self) -> &mut ResponseBody {
        &mut self.body
    }

    #[must_use]
    pub fn into_body(self) -> ResponseBody {
        self.body
    }

    /// Reads whatever is left of the body.
    ///
    /// # Errors
    /// Propagates body read errors.
    pub fn read_body(&mut self) -> io::Result<Vec<u8>> {
        let mut bytes = Vec::new();
        self.body.read_to_end(&mut bytes)?;
        Ok(bytes)
    }

    /// Remaining body as text, replacing invalid UTF-8.
    ///
    /// # Errors
    /// Propagates body read errors.
    pub fn text(&mut self) -> io::Result<String> {
        Ok(String::from_utf8_lossy(&self.read_body()?).into_owned())
    }
}
