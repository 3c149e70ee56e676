//! Module level helpers backed by the shared default client.

mod support;

use std::time::Duration;

use foundation_rawhttp::wire::raw_http::client::{
    default_client, do_raw, get, init_default_client, post, shutdown_default_client,
    ClientOptions,
};
use foundation_rawhttp::wire::raw_http::Headers;
use serial_test::serial;
use support::{HttpResponse, TestHttpServer};

#[test]
#[serial]
fn test_helpers_use_configured_default_client() {
    shutdown_default_client();
    init_default_client(
        ClientOptions::default()
            .with_timeout(Duration::from_secs(5))
            .with_custom_header("X-Scanner", "rawhttp"),
    )
    .unwrap();

    let server = TestHttpServer::with_response(|request| HttpResponse::ok(request.method.clone()));

    let mut response = get(&server.url("/g")).unwrap();
    assert_eq!(response.text().unwrap(), "GET");

    let mut response = post(&server.url("/p"), "text/plain", "x").unwrap();
    assert_eq!(response.text().unwrap(), "POST");

    let mut response = do_raw("DELETE", &server.url("/d"), None, Headers::new(), None).unwrap();
    assert_eq!(response.text().unwrap(), "DELETE");

    for request in server.requests() {
        assert_eq!(request.header("X-Scanner"), Some("rawhttp"));
    }
    assert_eq!(default_client().options().timeout, Duration::from_secs(5));
    shutdown_default_client();
}

#[test]
#[serial]
fn test_shutdown_resets_to_defaults() {
    shutdown_default_client();
    init_default_client(ClientOptions::default().with_max_redirects(1)).unwrap();
    shutdown_default_client();

    assert_eq!(default_client().options(), &ClientOptions::default());
    shutdown_default_client();
}
