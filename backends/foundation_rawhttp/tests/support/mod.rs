//! Test servers for the integration suites.
//!
//! WHY: The clients must be exercised against real sockets, including
//! keep-alive reuse, pipelining and proxy tunnels.
//!
//! WHAT: `TestHttpServer` answers HTTP/1.1 requests (several per
//! connection) and records every request head byte for byte.
//! `ConnectProxy` and `Socks5Proxy` open tunnels and record the targets
//! they were asked for.
//!
//! HOW: stdlib `TcpListener`s polled from a background thread; each
//! accepted connection gets its own thread.

#![allow(dead_code)]

use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

type Handler = Arc<dyn Fn(&CapturedRequest) -> HttpResponse + Send + Sync>;

/// A request as the server saw it.
#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub method: String,
    pub target: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// Request line and headers exactly as received, blank line included.
    pub raw_head: Vec<u8>,
}

impl CapturedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn raw_head_text(&self) -> String {
        String::from_utf8_lossy(&self.raw_head).into_owned()
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub status_text: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub delay: Option<Duration>,
    /// Close the connection after writing this response.
    pub close: bool,
}

impl HttpResponse {
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        let body = body.into();
        Self {
            status: 200,
            status_text: "OK".into(),
            headers: vec![
                ("Content-Type".into(), "text/plain".into()),
                ("Content-Length".into(), body.len().to_string()),
            ],
            body,
            delay: None,
            close: false,
        }
    }

    pub fn redirect(location: &str) -> Self {
        Self {
            status: 302,
            status_text: "Found".into(),
            headers: vec![
                ("Location".into(), location.into()),
                ("Content-Length".into(), "0".into()),
            ],
            body: Vec::new(),
            delay: None,
            close: false,
        }
    }

    pub fn status(code: u16, text: &str) -> Self {
        Self {
            status: code,
            status_text: text.into(),
            headers: vec![("Content-Length".into(), "0".into())],
            body: Vec::new(),
            delay: None,
            close: false,
        }
    }

    pub fn with_header(mut self, key: &str, value: &str) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Sends `Connection: close` and hangs up after the response.
    pub fn closing(mut self) -> Self {
        self.headers.push(("Connection".into(), "close".into()));
        self.close = true;
        self
    }

    fn render(&self) -> Vec<u8> {
        let mut head = format!("HTTP/1.1 {} {}\r\n", self.status, self.status_text);
        for (key, value) in &self.headers {
            head.push_str(&format!("{key}: {value}\r\n"));
        }
        head.push_str("\r\n");

        let mut bytes = head.into_bytes();
        bytes.extend_from_slice(&self.body);
        bytes
    }
}

/// Polls `listener` until `running` clears, handing each connection to
/// `serve` on its own thread.
fn accept_loop<F>(listener: TcpListener, running: Arc<AtomicBool>, serve: F) -> thread::JoinHandle<()>
where
    F: Fn(TcpStream) + Send + Sync + 'static,
{
    let serve = Arc::new(serve);
    thread::spawn(move || {
        listener
            .set_nonblocking(true)
            .expect("listener should go non-blocking");

        while running.load(Ordering::Relaxed) {
            match listener.accept() {
                Ok((stream, _)) => {
                    stream
                        .set_nonblocking(false)
                        .expect("accepted stream should block");
                    let serve = serve.clone();
                    thread::spawn(move || serve(stream));
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(5));
                }
                Err(err) => {
                    tracing::info!("test listener accept error: {err}");
                    break;
                }
            }
        }
    })
}

fn read_request(reader: &mut BufReader<TcpStream>) -> io::Result<Option<CapturedRequest>> {
    let mut raw_head = Vec::new();
    let mut lines = Vec::new();
    loop {
        let mut line = Vec::new();
        if reader.read_until(b'\n', &mut line)? == 0 {
            return Ok(None);
        }
        raw_head.extend_from_slice(&line);
        let text = String::from_utf8_lossy(&line).trim_end_matches(['\r', '\n']).to_string();
        if text.is_empty() {
            break;
        }
        lines.push(text);
    }

    let mut request_line = lines.first().map(String::as_str).unwrap_or("").splitn(3, ' ');
    let method = request_line.next().unwrap_or("").to_string();
    let target = request_line.next().unwrap_or("").to_string();
    let version = request_line.next().unwrap_or("").to_string();

    let headers: Vec<(String, String)> = lines
        .iter()
        .skip(1)
        .filter_map(|line| line.split_once(':'))
        .map(|(key, value)| (key.to_string(), value.trim().to_string()))
        .collect();

    let length = headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case("Content-Length"))
        .and_then(|(_, value)| value.parse::<usize>().ok())
        .unwrap_or(0);
    let mut body = vec![0u8; length];
    reader.read_exact(&mut body)?;

    Ok(Some(CapturedRequest {
        method,
        target,
        version,
        headers,
        body,
        raw_head,
    }))
}

/// HTTP/1.1 server answering every request through a handler.
pub struct TestHttpServer {
    addr: SocketAddr,
    running: Arc<AtomicBool>,
    requests: Arc<Mutex<Vec<CapturedRequest>>>,
    connections: Arc<AtomicUsize>,
    handle: Option<thread::JoinHandle<()>>,
}

impl TestHttpServer {
    pub fn start() -> Self {
        Self::with_response(|_| HttpResponse::ok("OK"))
    }

    pub fn with_response<F>(handler: F) -> Self
    where
        F: Fn(&CapturedRequest) -> HttpResponse + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").expect("test server should bind");
        let addr = listener.local_addr().expect("bound listener has an address");
        let running = Arc::new(AtomicBool::new(true));
        let requests = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(AtomicUsize::new(0));
        let handler: Handler = Arc::new(handler);

        let seen = requests.clone();
        let counter = connections.clone();
        let handle = accept_loop(listener, running.clone(), move |stream| {
            counter.fetch_add(1, Ordering::SeqCst);
            if let Err(err) = serve_http(stream, &handler, &seen) {
                tracing::info!("test server connection error: {err}");
            }
        });

        Self {
            addr,
            running,
            requests,
            connections,
            handle: Some(handle),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    /// `127.0.0.1:port`
    pub fn address(&self) -> String {
        self.addr.to_string()
    }

    pub fn requests(&self) -> Vec<CapturedRequest> {
        self.requests.lock().expect("request log").clone()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

impl Drop for TestHttpServer {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn serve_http(
    stream: TcpStream,
    handler: &Handler,
    seen: &Arc<Mutex<Vec<CapturedRequest>>>,
) -> io::Result<()> {
    let mut writer = stream.try_clone()?;
    let mut reader = BufReader::new(stream);

    while let Some(request) = read_request(&mut reader)? {
        seen.lock().expect("request log").push(request.clone());
        let response = handler(&request);
        if let Some(delay) = response.delay {
            thread::sleep(delay);
        }
        writer.write_all(&response.render())?;
        writer.flush()?;
        if response.close {
            let _ = writer.shutdown(Shutdown::Both);
            break;
        }
    }
    Ok(())
}

fn pipe(mut from: TcpStream, mut to: TcpStream) {
    let _ = io::copy(&mut from, &mut to);
    let _ = to.shutdown(Shutdown::Write);
}

fn tunnel(client: TcpStream, upstream: TcpStream) -> io::Result<()> {
    let client_read = client.try_clone()?;
    let upstream_read = upstream.try_clone()?;
    let forward = thread::spawn(move || pipe(client_read, upstream));
    pipe(upstream_read, client);
    let _ = forward.join();
    Ok(())
}

/// HTTP proxy that only understands CONNECT.
pub struct ConnectProxy {
    addr: SocketAddr,
    running: Arc<AtomicBool>,
    requests: Arc<Mutex<Vec<CapturedRequest>>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl ConnectProxy {
    pub fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("proxy should bind");
        let addr = listener.local_addr().expect("bound listener has an address");
        let running = Arc::new(AtomicBool::new(true));
        let requests = Arc::new(Mutex::new(Vec::new()));

        let seen = requests.clone();
        let handle = accept_loop(listener, running.clone(), move |stream| {
            if let Err(err) = serve_connect(stream, &seen) {
                tracing::info!("connect proxy error: {err}");
            }
        });

        Self {
            addr,
            running,
            requests,
            handle: Some(handle),
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn requests(&self) -> Vec<CapturedRequest> {
        self.requests.lock().expect("request log").clone()
    }
}

impl Drop for ConnectProxy {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn serve_connect(stream: TcpStream, seen: &Arc<Mutex<Vec<CapturedRequest>>>) -> io::Result<()> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let Some(request) = read_request(&mut reader)? else {
        return Ok(());
    };
    seen.lock().expect("request log").push(request.clone());

    let mut client = stream;
    if request.method != "CONNECT" {
        client.write_all(b"HTTP/1.1 405 Method Not Allowed\r\nContent-Length: 0\r\n\r\n")?;
        return Ok(());
    }

    let upstream = TcpStream::connect(request.target.as_str())?;
    client.write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")?;
    tunnel(client, upstream)
}

/// SOCKS5 proxy without authentication.
pub struct Socks5Proxy {
    addr: SocketAddr,
    running: Arc<AtomicBool>,
    targets: Arc<Mutex<Vec<String>>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Socks5Proxy {
    pub fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("proxy should bind");
        let addr = listener.local_addr().expect("bound listener has an address");
        let running = Arc::new(AtomicBool::new(true));
        let targets = Arc::new(Mutex::new(Vec::new()));

        let seen = targets.clone();
        let handle = accept_loop(listener, running.clone(), move |stream| {
            if let Err(err) = serve_socks5(stream, &seen) {
                tracing::info!("socks5 proxy error: {err}");
            }
        });

        Self {
            addr,
            running,
            targets,
            handle: Some(handle),
        }
    }

    pub fn url(&self, scheme: &str) -> String {
        format!("{scheme}://{}", self.addr)
    }

    /// Targets requested, as `ip:port` or `domain:port`.
    pub fn targets(&self) -> Vec<String> {
        self.targets.lock().expect("target log").clone()
    }
}

impl Drop for Socks5Proxy {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn serve_socks5(mut client: TcpStream, seen: &Arc<Mutex<Vec<String>>>) -> io::Result<()> {
    let mut greeting = [0u8; 2];
    client.read_exact(&mut greeting)?;
    let mut methods = vec![0u8; usize::from(greeting[1])];
    client.read_exact(&mut methods)?;
    client.write_all(&[5, 0])?;

    let mut request = [0u8; 4];
    client.read_exact(&mut request)?;
    let host = match request[3] {
        1 => {
            let mut ip = [0u8; 4];
            client.read_exact(&mut ip)?;
            std::net::Ipv4Addr::from(ip).to_string()
        }
        3 => {
            let mut len = [0u8; 1];
            client.read_exact(&mut len)?;
            let mut name = vec![0u8; usize::from(len[0])];
            client.read_exact(&mut name)?;
            String::from_utf8_lossy(&name).into_owned()
        }
        _ => {
            client.write_all(&[5, 8, 0, 1, 0, 0, 0, 0, 0, 0])?;
            return Ok(());
        }
    };
    let mut port = [0u8; 2];
    client.read_exact(&mut port)?;
    let target = format!("{host}:{}", u16::from_be_bytes(port));
    seen.lock().expect("target log").push(target.clone());

    let connect_to = if host == "localhost" {
        format!("127.0.0.1:{}", u16::from_be_bytes(port))
    } else {
        target
    };
    let upstream = match TcpStream::connect(connect_to.as_str()) {
        Ok(upstream) => upstream,
        Err(_) => {
            client.write_all(&[5, 5, 0, 1, 0, 0, 0, 0, 0, 0])?;
            return Ok(());
        }
    };
    client.write_all(&[5, 0, 0, 1, 127, 0, 0, 1, 0, 0])?;
    tunnel(client, upstream)
}
