//! Single-shot client against a real local server.
//!
//! WHY: Byte-exact request control only matters if the exact bytes reach
//! the wire; these tests read them back on the server side.
//!
//! WHAT: Request serialization quirks, raw overrides, redirects, gzip,
//! timeouts and keep-alive reuse.
//!
//! HOW: `support::TestHttpServer` records every request head verbatim.

mod support;

use std::time::{Duration, Instant};

use foundation_rawhttp::wire::raw_http::client::{ClientOptions, RawHttpClient, RawHttpError};
use foundation_rawhttp::wire::raw_http::{Headers, Request};
use support::{HttpResponse, TestHttpServer};
use tracing_test::traced_test;

/// WHY: The automatic Host header keeps its historical leading space
/// WHAT: The server receives `Host:  127.0.0.1:port` and the URL query
#[test]
#[traced_test]
fn test_get_sends_exact_request_line_and_host() {
    let server = TestHttpServer::with_response(|_| HttpResponse::ok("hello"));
    let client = RawHttpClient::default();

    let mut response = client.get(&server.url("/path?q=1")).unwrap();
    assert_eq!(response.status().code, 200);
    assert_eq!(response.content_length(), Some(5));
    assert_eq!(response.text().unwrap(), "hello");

    let seen = server.requests();
    assert_eq!(seen.len(), 1);
    assert_eq!(
        seen[0].raw_head_text(),
        format!("GET /path?q=1 HTTP/1.1\r\nHost:  {}\r\n\r\n", server.address())
    );
    client.close();
}

/// WHY: Scanners rely on odd casing, duplicates and order surviving
/// WHAT: Caller headers arrive exactly as given, followed by Host
#[test]
fn test_do_raw_preserves_header_order_and_duplicates() {
    let server = TestHttpServer::start();
    let client = RawHttpClient::default();

    let headers: Headers = [("x-DUP", "1"), ("Accept", "*/*"), ("x-DUP", "2")]
        .into_iter()
        .collect();
    let response = client
        .do_raw("PURGE", &server.url("/ignored"), Some("/../admin"), headers, None)
        .unwrap();
    assert_eq!(response.status().code, 200);
    drop(response);

    let seen = server.requests();
    assert_eq!(
        seen[0].raw_head_text(),
        format!(
            "PURGE /../admin HTTP/1.1\r\nx-DUP: 1\r\nAccept: */*\r\nx-DUP: 2\r\nHost:  {}\r\n\r\n",
            server.address()
        )
    );
    client.close();
}

#[test]
fn test_post_sends_body_with_content_length() {
    let server = TestHttpServer::start();
    let client = RawHttpClient::default();

    let response = client
        .post(&server.url("/form"), "application/x-www-form-urlencoded", "a=1&b=2")
        .unwrap();
    drop(response);

    let seen = server.requests();
    assert_eq!(seen[0].method, "POST");
    assert_eq!(seen[0].header("Content-Type"), Some("application/x-www-form-urlencoded"));
    assert_eq!(seen[0].header("Content-Length"), Some("7"));
    assert_eq!(seen[0].body, b"a=1&b=2");
    client.close();
}

#[test]
fn test_do_request_keeps_path_and_query() {
    let server = TestHttpServer::start();
    let client = RawHttpClient::default();

    let request = Request::new("GET", "/search").with_query("q=rust").with_query("page=2");
    drop(client.do_request(&server.url("/"), request).unwrap());

    assert_eq!(server.requests()[0].target, "/search?q=rust&page=2");
    client.close();
}

/// WHY: Raw overrides must reach the wire with only Host and
/// Content-Length fixed up
/// WHAT: The server sees the raw lines in order plus the patched fields
#[test]
fn test_custom_raw_bytes_reach_the_wire() {
    let server = TestHttpServer::start();
    let options = ClientOptions::default()
        .with_custom_raw_bytes("GET /raw HTTP/1.1\nX-Smuggle: yes\nHost: wrong\n\n".as_bytes());
    let client = RawHttpClient::new(options);

    drop(client.get(&server.url("/not-used")).unwrap());

    let seen = server.requests();
    assert_eq!(
        seen[0].raw_head_text(),
        format!(
            "GET /raw HTTP/1.1\r\nX-Smuggle: yes\r\nHost: {}\r\nContent-Length: 0\r\n\r\n",
            server.address()
        )
    );
    client.close();
}

/// WHY: The redirect bound caps the requests a loop can cost
/// WHAT: With max_redirects = 2 the server sees three requests and the
/// last redirect is returned as-is
#[test]
#[traced_test]
fn test_redirect_loop_stops_at_bound() {
    let server = TestHttpServer::with_response(|_| HttpResponse::redirect("/loop"));
    let client = RawHttpClient::new(ClientOptions::default().with_max_redirects(2));

    let response = client.get(&server.url("/loop")).unwrap();
    assert_eq!(response.status().code, 302);
    drop(response);

    assert_eq!(server.requests().len(), 3);
    client.close();
}

#[test]
fn test_redirect_is_followed_to_target() {
    let server = TestHttpServer::with_response(|request| match request.target.as_str() {
        "/start" => HttpResponse::redirect("/end"),
        _ => HttpResponse::ok("done"),
    });
    let client = RawHttpClient::default();

    let mut response = client.get(&server.url("/start")).unwrap();
    assert_eq!(response.status().code, 200);
    assert_eq!(response.text().unwrap(), "done");
    assert_eq!(response.request().target(), "/end");

    let targets: Vec<String> = server.requests().into_iter().map(|r| r.target).collect();
    assert_eq!(targets, vec!["/start", "/end"]);
    client.close();
}

#[test]
fn test_redirects_can_be_disabled() {
    let server = TestHttpServer::with_response(|_| HttpResponse::redirect("/elsewhere"));
    let client = RawHttpClient::new(ClientOptions::default().with_follow_redirects(false));

    let response = client.get(&server.url("/")).unwrap();
    assert_eq!(response.status().code, 302);
    assert_eq!(response.headers().get("Location"), Some("/elsewhere"));
    drop(response);
    assert_eq!(server.requests().len(), 1);
    client.close();
}

#[cfg(feature = "gzip")]
#[test]
fn test_gzip_body_is_decoded() {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(b"compressed payload").unwrap();
    let compressed = encoder.finish().unwrap();

    let server = TestHttpServer::with_response(move |_| {
        let mut response = HttpResponse::ok(compressed.clone());
        response.headers.push(("Content-Encoding".into(), "gzip".into()));
        response
    });

    let client = RawHttpClient::default();
    let mut response = client.get(&server.url("/gz")).unwrap();
    assert_eq!(response.text().unwrap(), "compressed payload");

    let forced = RawHttpClient::new(ClientOptions::default().with_force_read_all_body(true));
    let mut response = forced.get(&server.url("/gz")).unwrap();
    assert_eq!(response.content_length(), Some(18));
    assert_eq!(response.text().unwrap(), "compressed payload");

    client.close();
    forced.close();
}

/// WHY: One deadline bounds the whole call
/// WHAT: A server slower than the timeout yields a timeout error quickly
#[test]
fn test_slow_server_times_out() {
    let server = TestHttpServer::with_response(|_| {
        HttpResponse::ok("late").with_delay(Duration::from_secs(2))
    });
    let client = RawHttpClient::new(ClientOptions::default().with_timeout(Duration::from_millis(300)));

    let started = Instant::now();
    let err = client.get(&server.url("/slow")).unwrap_err();
    assert!(err.error.is_timeout(), "unexpected error: {err}");
    assert!(err.request.is_some());
    assert!(started.elapsed() < Duration::from_millis(1500));
    client.close();
}

/// WHY: Keep-alive reuse saves a handshake per request
/// WHAT: Two sequential calls share one connection when reuse is on, and
/// open two when it is off
#[test]
fn test_connection_reuse() {
    let server = TestHttpServer::with_response(|_| HttpResponse::ok("pooled"));
    let client = RawHttpClient::default();

    for _ in 0..2 {
        let mut response = client.get(&server.url("/")).unwrap();
        assert_eq!(response.text().unwrap(), "pooled");
    }
    assert_eq!(server.connection_count(), 1);
    client.close();

    let server = TestHttpServer::with_response(|_| HttpResponse::ok("fresh"));
    let client = RawHttpClient::new(ClientOptions::default().with_connection_reuse(false));
    for _ in 0..2 {
        let mut response = client.get(&server.url("/")).unwrap();
        assert_eq!(response.text().unwrap(), "fresh");
    }
    assert_eq!(server.connection_count(), 2);
    client.close();
}

#[test]
fn test_head_has_no_body() {
    let server = TestHttpServer::with_response(|_| HttpResponse::ok("body for GET only"));
    let client = RawHttpClient::default();

    let mut response = client.head(&server.url("/")).unwrap();
    assert_eq!(response.status().code, 200);
    assert!(response.body_bytes().unwrap().is_empty());
    client.close();
}

#[test]
fn test_refused_connection_reports_request() {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let client = RawHttpClient::new(ClientOptions::default().with_timeout(Duration::from_secs(2)));

    let err = client.get(&format!("http://127.0.0.1:{port}/")).unwrap_err();
    assert!(matches!(
        err.error,
        RawHttpError::ConnectFailed(_) | RawHttpError::DialTimeout(_)
    ));
    assert_eq!(err.request.unwrap().method, "GET");
    client.close();
}
