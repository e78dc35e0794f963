use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use reqwest::header::{HeaderMap, SET_COOKIE};
use reqwest::Url;

/// Session cookies keyed by host name.
///
/// Only the most recent `set-cookie` value per host is kept, and every path
/// on that host shares it. Ports are not part of the key.
#[derive(Debug, Default)]
pub struct CookieJar {
    cookies: Mutex<HashMap<String, String>>,
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.cookies.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cookie to send with a request to `url`, if its host has one.
    pub fn get(&self, url: &Url) -> Option<String> {
        let host = url.host_str()?;
        self.lock().get(host).cloned()
    }

    /// Replace the cookie stored for `url`'s host.
    pub fn set(&self, url: &Url, cookie: impl Into<String>) {
        if let Some(host) = url.host_str() {
            self.lock().insert(host.to_string(), cookie.into());
        }
    }

    /// Store the response's `set-cookie` value (if present and non-empty)
    /// for the host that produced it.
    pub fn store_from_headers(&self, url: &Url, headers: &HeaderMap) {
        let received = headers
            .get(SET_COOKIE)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty());
        if let Some(cookie) = received {
            log::debug!(
                "[CookieJar] storing session cookie for {}",
                url.host_str().unwrap_or("<no host>")
            );
            self.set(url, cookie);
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
