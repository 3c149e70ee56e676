//! Process-wide default client.
//!
//! The module level helpers share one lazily created [`RawHttpClient`].
//! `init_default_client` may configure it once before first use;
//! `shutdown_default_client` closes it so the next use starts afresh.

use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use crate::wire::raw_http::{Headers, RequestBody};

use super::{ClientOptions, ClientResponse, ConfigError, ExchangeError, RawHttpClient};

static DEFAULT_CLIENT: OnceLock<Mutex<Option<Arc<RawHttpClient>>>> = OnceLock::new();

fn slot() -> MutexGuard<'static, Option<Arc<RawHttpClient>>> {
    let slot = DEFAULT_CLIENT.get_or_init(|| Mutex::new(None));
    match slot.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Installs the default client built from `options`.
///
/// # Errors
/// [`ConfigError::Invalid`] when the options do not validate or a default
/// client already exists.
pub fn init_default_client(options: ClientOptions) -> Result<(), ConfigError> {
    options.validate()?;

    let mut slot = slot();
    if slot.is_some() {
        return Err(ConfigError::Invalid(
            "default client is already initialized".into(),
        ));
    }
    *slot = Some(Arc::new(RawHttpClient::new(options)));
    tracing::debug!("Default raw HTTP client initialized");
    Ok(())
}

/// The default client, created with default options on first use.
#[must_use]
pub fn default_client() -> Arc<RawHttpClient> {
    slot()
        .get_or_insert_with(|| Arc::new(RawHttpClient::default()))
        .clone()
}

/// Closes the default client and forgets it.
pub fn shutdown_default_client() {
    let taken = slot().take();
    if let Some(client) = taken {
        client.close();
        tracing::debug!("Default raw HTTP client shut down");
    }
}

/// `GET` through the default client.
///
/// # Errors
/// See [`RawHttpClient::get`].
pub fn get(url: &str) -> Result<ClientResponse, ExchangeError> {
    default_client().get(url)
}

/// `POST` through the default client.
///
/// # Errors
/// See [`RawHttpClient::post`].
pub fn post(
    url: &str,
    content_type: &str,
    body: impl Into<RequestBody>,
) -> Result<ClientResponse, ExchangeError> {
    default_client().post(url, content_type, body)
}

/// # Errors
/// See [`RawHttpClient::do_raw`].
pub fn do_raw(
    method: &str,
    url: &str,
    uri_path: Option<&str>,
    headers: Headers,
    body: Option<RequestBody>,
) -> Result<ClientResponse, ExchangeError> {
    default_client().do_raw(method, url, uri_path, headers, body)
}

/// # Errors
/// See [`RawHttpClient::do_raw_with_options`].
pub fn do_raw_with_options(
    method: &str,
    url: &str,
    uri_path: Option<&str>,
    headers: Headers,
    body: Option<RequestBody>,
    options: &ClientOptions,
) -> Result<ClientResponse, ExchangeError> {
    default_client().do_raw_with_options(method, url, uri_path, headers, body, options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::time::Duration;

    /// WHY: Configuration has to win over lazy creation, and only once
    /// WHAT: A second init fails until the client is shut down
    #[test]
    #[serial]
    fn test_init_once_until_shutdown() {
        shutdown_default_client();

        let options = ClientOptions::default().with_timeout(Duration::from_secs(7));
        init_default_client(options.clone()).unwrap();
        assert_eq!(default_client().options().timeout, Duration::from_secs(7));

        let err = init_default_client(options.clone()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        shutdown_default_client();
        init_default_client(options).unwrap();
        shutdown_default_client();
    }

    #[test]
    #[serial]
    fn test_default_client_is_shared() {
        shutdown_default_client();
        let first = default_client();
        let second = default_client();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.options(), &ClientOptions::default());
        shutdown_default_client();
    }

    #[test]
    #[serial]
    fn test_init_rejects_invalid_options() {
        shutdown_default_client();
        let mut options = ClientOptions::default();
        options.dialer.concurrency = 0;
        assert!(init_default_client(options).is_err());
        assert!(slot().is_none());
    }
}
