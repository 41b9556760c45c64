//! # Novira Net
//!
//! Requests, responses, and the network seam used by the cache router.
//!
//! ## Design Goals
//!
//! 1. **Async HTTP**: Non-blocking network requests through `reqwest`
//! 2. **One seam**: Everything that talks to the network goes through [`Fetcher`]
//! 3. **Cheap clones**: Response bodies are `Bytes`, so cache copies share storage

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use novira_common::NoviraError;
use novira_core::{NetConfig, RequestMode, CACHE_MARKER_HEADER};
use reqwest::Client;
use thiserror::Error;
use tracing::{debug, info, trace};
use url::Url;

#[cfg(any(test, feature = "test-util"))]
pub mod mock;

#[cfg(any(test, feature = "test-util"))]
pub use mock::MockFetcher;

/// Errors that can occur in networking.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Network unreachable: {0}")]
    Offline(String),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
}

impl From<NetError> for NoviraError {
    fn from(err: NetError) -> Self {
        NoviraError::network_with_source("fetch failed", err)
    }
}

/// Unique identifier for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl RequestId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

/// HTTP request as seen by the router.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub mode: RequestMode,
    pub body: Option<Bytes>,
}

impl Request {
    /// Create a request with an arbitrary method.
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            id: RequestId::new(),
            url,
            method,
            headers: HeaderMap::new(),
            mode: RequestMode::default(),
            body: None,
        }
    }

    /// Create a GET request.
    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    /// Create a full-document navigation request.
    pub fn navigate(url: Url) -> Self {
        Self::get(url).mode(RequestMode::Navigate)
    }

    /// Parse a URL and create a GET request.
    pub fn parse_get(url: &str) -> Result<Self, NetError> {
        let url = Url::parse(url).map_err(|e| NetError::InvalidUrl(e.to_string()))?;
        Ok(Self::get(url))
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set the request mode.
    pub fn mode(mut self, mode: RequestMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the body.
    pub fn body(mut self, body: Bytes) -> Self {
        self.body = Some(body);
        self
    }

    /// Normalized cache key: method plus URL without fragment.
    pub fn cache_key(&self) -> String {
        cache_key(&self.method, &self.url)
    }
}

/// Build the normalized cache key for a method and URL.
pub fn cache_key(method: &Method, url: &Url) -> String {
    let mut url = url.clone();
    url.set_fragment(None);
    format!("{} {}", method, url)
}

/// HTTP response.
#[derive(Debug, Clone)]
pub struct Response {
    pub url: Url,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Response {
    /// Create a response with no headers.
    pub fn new(url: Url, status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            url,
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    /// Check if request was successful (2xx).
    pub fn ok(&self) -> bool {
        self.status.is_success()
    }

    /// Get a header value as a string.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Whether the router answered this from the cache.
    pub fn is_from_cache(&self) -> bool {
        self.header(CACHE_MARKER_HEADER) == Some("true")
    }

    /// Copy of this response carrying the cache marker.
    pub fn marked_from_cache(&self) -> Self {
        let mut marked = self.clone();
        marked.headers.insert(
            HeaderName::from_static(CACHE_MARKER_HEADER),
            HeaderValue::from_static("true"),
        );
        marked
    }

    /// Get the body as text.
    pub fn text(&self) -> Result<String, NetError> {
        String::from_utf8(self.body.to_vec()).map_err(|e| NetError::RequestFailed(e.to_string()))
    }
}

/// The network, as far as the router is concerned.
pub trait Fetcher: Send + Sync {
    /// Perform the request. Non-2xx statuses are responses, not errors.
    fn fetch(&self, request: Request) -> BoxFuture<'_, Result<Response, NetError>>;
}

impl<F: Fetcher + ?Sized> Fetcher for Arc<F> {
    fn fetch(&self, request: Request) -> BoxFuture<'_, Result<Response, NetError>> {
        (**self).fetch(request)
    }
}

/// `reqwest`-backed fetcher.
pub struct HttpFetcher {
    client: Client,
    timeout: Duration,
}

impl HttpFetcher {
    /// Create a new fetcher.
    pub fn new(config: &NetConfig) -> Result<Self, NetError> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.timeout())
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()
            .map_err(|e| NetError::RequestFailed(e.to_string()))?;

        info!(user_agent = %config.user_agent, "HttpFetcher initialized");

        Ok(Self {
            client,
            timeout: config.timeout(),
        })
    }

    async fn execute(&self, request: Request) -> Result<Response, NetError> {
        debug!(url = %request.url, method = %request.method, "Fetching resource");

        let mut req_builder = self
            .client
            .request(request.method.clone(), request.url.clone());

        for (name, value) in request.headers.iter() {
            req_builder = req_builder.header(name, value);
        }

        if let Some(body) = request.body {
            req_builder = req_builder.body(body);
        }

        let response = req_builder.send().await.map_err(|e| {
            if e.is_timeout() {
                NetError::Timeout(self.timeout)
            } else if e.is_connect() {
                NetError::Offline(e.to_string())
            } else {
                NetError::HttpError(e)
            }
        })?;

        let status = response.status();
        let headers = response.headers().clone();
        let url = response.url().clone();
        let body = response.bytes().await?;

        trace!(
            url = %url,
            status = %status,
            body_len = body.len(),
            "Response received"
        );

        Ok(Response {
            url,
            status,
            headers,
            body,
        })
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, request: Request) -> BoxFuture<'_, Result<Response, NetError>> {
        Box::pin(self.execute(request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builder() {
        let url = Url::parse("https://example.com").unwrap();
        let request = Request::get(url.clone()).header(
            HeaderName::from_static("accept"),
            HeaderValue::from_static("application/json"),
        );

        assert_eq!(request.url, url);
        assert_eq!(request.method, Method::GET);
        assert_eq!(request.mode, RequestMode::Cors);
        assert!(request.headers.contains_key("accept"));
    }

    #[test]
    fn test_navigate_sets_mode() {
        let request = Request::navigate(Url::parse("https://app.test/budgets").unwrap());
        assert_eq!(request.mode, RequestMode::Navigate);
    }

    #[test]
    fn test_request_id_uniqueness() {
        let id1 = RequestId::new();
        let id2 = RequestId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_cache_key_ignores_fragment() {
        let a = Request::parse_get("https://app.test/page#top").unwrap();
        let b = Request::parse_get("https://app.test/page").unwrap();
        assert_eq!(a.cache_key(), b.cache_key());
        assert_eq!(b.cache_key(), "GET https://app.test/page");
    }

    #[test]
    fn test_cache_key_keeps_query() {
        let a = Request::parse_get("https://x.supabase.co/rest/v1/t?select=*").unwrap();
        let b = Request::parse_get("https://x.supabase.co/rest/v1/t").unwrap();
        assert_ne!(a.cache_key(), b.cache_key());
    }

    #[test]
    fn test_marked_from_cache() {
        let url = Url::parse("https://x.supabase.co/rest/v1/t").unwrap();
        let response = Response::new(url, StatusCode::OK, "[]");
        assert!(!response.is_from_cache());

        let marked = response.marked_from_cache();
        assert!(marked.is_from_cache());
        assert_eq!(marked.header("X-From-Cache"), Some("true"));
        assert_eq!(marked.body, response.body);
    }

    #[test]
    fn test_invalid_url() {
        assert!(matches!(
            Request::parse_get("::nope"),
            Err(NetError::InvalidUrl(_))
        ));
    }
}
