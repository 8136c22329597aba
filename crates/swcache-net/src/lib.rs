//! # swcache net
//!
//! Request and response types plus the network seam the caching proxy sits on.
//!
//! ## Design Goals
//!
//! 1. **Plain data**: requests and responses are owned values; bodies are
//!    [`Bytes`] so a response can be handed to the caller and snapshotted into
//!    the store without reading it twice.
//! 2. **One seam**: everything that touches the network goes through
//!    [`Fetcher`], so strategies can be driven by a scripted fetcher in tests.
//! 3. **Cache control**: [`CacheMode::NoStore`] keeps intermediate HTTP caches
//!    out of freshness-sensitive fetches.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{header, HeaderMap, HeaderName, HeaderValue, Method};
use reqwest::Client;
use thiserror::Error;
use tracing::{debug, trace};
use url::Url;

pub mod pattern;

pub use pattern::{PatternType, UrlPattern};

/// Errors that can occur while fetching from the network.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetError {
    #[error("Network unreachable: {0}")]
    Unreachable(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Failed to read body: {0}")]
    Body(String),

    #[error("HTTP client error: {0}")]
    Client(String),
}

impl NetError {
    fn from_reqwest(error: reqwest::Error, timeout: Duration) -> Self {
        if error.is_timeout() {
            NetError::Timeout(timeout)
        } else if error.is_builder() {
            NetError::InvalidUrl(error.to_string())
        } else if error.is_body() || error.is_decode() {
            NetError::Body(error.to_string())
        } else {
            NetError::Unreachable(error.to_string())
        }
    }
}

/// Unique identifier for a request, used to correlate log lines.
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

/// How the request was issued by the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
    /// Top-level page navigation.
    Navigate,
    /// Same-origin only.
    SameOrigin,
    /// Regular CORS request.
    #[default]
    Cors,
    /// Cross-origin without CORS; the answer is opaque.
    NoCors,
}

/// Whether intermediate HTTP caches may answer the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheMode {
    /// Normal HTTP caching.
    #[default]
    Default,
    /// Bypass intermediate caches and revalidate with the origin.
    NoStore,
}

/// An inbound request.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub mode: RequestMode,
    pub cache: CacheMode,
}

impl Request {
    /// Create a GET request.
    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    /// Create a navigation request for a page.
    pub fn navigate(url: Url) -> Self {
        Self::get(url)
            .mode(RequestMode::Navigate)
            .header(header::ACCEPT, HeaderValue::from_static("text/html,application/xhtml+xml,*/*;q=0.8"))
    }

    /// Create a request with an arbitrary method.
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            id: RequestId::new(),
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
            mode: RequestMode::default(),
            cache: CacheMode::default(),
        }
    }

    /// Parse a URL and create a GET request.
    pub fn parse(url: &str) -> Result<Self, NetError> {
        let url = Url::parse(url).map_err(|e| NetError::InvalidUrl(format!("{url}: {e}")))?;
        Ok(Self::get(url))
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set the `Accept` header.
    pub fn accept(self, value: &str) -> Self {
        match HeaderValue::from_str(value) {
            Ok(v) => self.header(header::ACCEPT, v),
            Err(_) => self,
        }
    }

    /// Set the request mode.
    pub fn mode(mut self, mode: RequestMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the cache mode.
    pub fn cache(mut self, cache: CacheMode) -> Self {
        self.cache = cache;
        self
    }

    /// Set the body.
    pub fn body(mut self, body: Bytes) -> Self {
        self.body = Some(body);
        self
    }

    /// The `Accept` header, if present and readable.
    pub fn accept_header(&self) -> Option<&str> {
        self.headers.get(header::ACCEPT).and_then(|v| v.to_str().ok())
    }

    /// Whether this is a page navigation.
    pub fn is_navigation(&self) -> bool {
        self.mode == RequestMode::Navigate
    }
}

/// Response type as seen by the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseType {
    /// Same-origin response.
    #[default]
    Basic,
    /// Cross-origin response with CORS.
    Cors,
    /// Cross-origin no-cors response; status reads as 0.
    Opaque,
}

/// Where a response delivered to the caller came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseSource {
    #[default]
    Network,
    Cache,
    Synthetic,
}

/// A response handed back to the application.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub url: Url,
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub response_type: ResponseType,
    pub source: ResponseSource,
}

impl Response {
    /// Create a network response.
    pub fn new(url: Url, status: u16, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            url,
            status,
            headers,
            body,
            response_type: ResponseType::Basic,
            source: ResponseSource::Network,
        }
    }

    /// Create an opaque response (status 0).
    pub fn opaque(url: Url, body: Bytes) -> Self {
        Self {
            url,
            status: 0,
            headers: HeaderMap::new(),
            body,
            response_type: ResponseType::Opaque,
            source: ResponseSource::Network,
        }
    }

    /// Status is 2xx.
    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_opaque(&self) -> bool {
        self.response_type == ResponseType::Opaque
    }

    /// Whether the response may be written to the response store.
    ///
    /// Only full 200 answers and opaque answers (whose status cannot be
    /// inspected) are kept; other statuses pass through uncached.
    pub fn is_cacheable(&self) -> bool {
        self.status == 200 || self.is_opaque()
    }

    /// Get a header value as a string.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Get the body as text.
    pub fn text(&self) -> Result<String, NetError> {
        String::from_utf8(self.body.to_vec()).map_err(|e| NetError::Body(e.to_string()))
    }

    /// Get the body as JSON.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, NetError> {
        serde_json::from_slice(&self.body).map_err(|e| NetError::Body(e.to_string()))
    }
}

/// The live network as seen by the caching proxy.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetch the request from the network.
    async fn fetch(&self, request: &Request) -> Result<Response, NetError>;
}

/// HTTP loader configuration.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// User agent string.
    pub user_agent: String,
    /// Transport-level timeout for a whole request.
    pub timeout: Duration,
    /// Maximum redirects.
    pub max_redirects: usize,
    /// Origin of the application; no-cors requests elsewhere become opaque.
    pub origin: Option<Url>,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("swcache/{}", env!("CARGO_PKG_VERSION")),
            timeout: Duration::from_secs(30),
            max_redirects: 10,
            origin: None,
        }
    }
}

/// [`Fetcher`] backed by reqwest.
pub struct HttpFetcher {
    client: Client,
    config: LoaderConfig,
}

impl HttpFetcher {
    /// Create a new fetcher.
    pub fn new(config: LoaderConfig) -> Result<Self, NetError> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()
            .map_err(|e| NetError::Client(e.to_string()))?;

        debug!(user_agent = %config.user_agent, timeout = ?config.timeout, "HttpFetcher initialized");

        Ok(Self { client, config })
    }

    fn is_cross_origin(&self, url: &Url) -> bool {
        match &self.config.origin {
            Some(origin) => origin.origin() != url.origin(),
            None => false,
        }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        debug!(id = request.id.raw(), url = %request.url, method = %request.method, "Fetching from network");

        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone())
            .headers(request.headers.clone());

        if request.cache == CacheMode::NoStore {
            builder = builder
                .header(header::CACHE_CONTROL, "no-cache")
                .header(header::PRAGMA, "no-cache");
        }

        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let timeout = self.config.timeout;
        let response = builder
            .send()
            .await
            .map_err(|e| NetError::from_reqwest(e, timeout))?;

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let url = response.url().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| NetError::from_reqwest(e, timeout))?;

        trace!(url = %url, status, body_len = body.len(), "Response received");

        let cross_origin = self.is_cross_origin(&request.url);
        if cross_origin && request.mode == RequestMode::NoCors {
            return Ok(Response::opaque(url, body));
        }

        let mut response = Response::new(url, status, headers, body);
        if cross_origin {
            response.response_type = ResponseType::Cors;
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header as header_eq, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fetcher(origin: Option<&str>) -> HttpFetcher {
        HttpFetcher::new(LoaderConfig {
            timeout: Duration::from_secs(5),
            origin: origin.map(|o| Url::parse(o).unwrap()),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_request_builder() {
        let url = Url::parse("https://example.com/app.js").unwrap();
        let request = Request::get(url.clone())
            .accept("application/javascript")
            .cache(CacheMode::NoStore);

        assert_eq!(request.url, url);
        assert_eq!(request.method, Method::GET);
        assert_eq!(request.accept_header(), Some("application/javascript"));
        assert_eq!(request.cache, CacheMode::NoStore);
        assert!(!request.is_navigation());
    }

    #[test]
    fn test_navigate_sets_mode_and_accept() {
        let request = Request::navigate(Url::parse("https://example.com/").unwrap());
        assert!(request.is_navigation());
        assert!(request.accept_header().unwrap().contains("text/html"));
    }

    #[test]
    fn test_request_id_uniqueness() {
        assert_ne!(RequestId::new(), RequestId::new());
    }

    #[test]
    fn test_parse_rejects_relative_url() {
        assert!(matches!(Request::parse("/logo.png"), Err(NetError::InvalidUrl(_))));
    }

    #[test]
    fn test_cacheable_responses() {
        let url = Url::parse("https://example.com/a").unwrap();
        let ok = Response::new(url.clone(), 200, HeaderMap::new(), Bytes::from_static(b"a"));
        let missing = Response::new(url.clone(), 404, HeaderMap::new(), Bytes::new());
        let partial = Response::new(url.clone(), 206, HeaderMap::new(), Bytes::new());
        let opaque = Response::opaque(url, Bytes::new());

        assert!(ok.is_cacheable());
        assert!(!missing.is_cacheable());
        assert!(!partial.is_cacheable());
        assert!(partial.ok());
        assert!(opaque.is_cacheable());
        assert_eq!(opaque.status, 0);
    }

    #[tokio::test]
    async fn test_fetch_returns_status_headers_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/styles/main.css"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw("body{}", "text/css"),
            )
            .mount(&server)
            .await;

        let request = Request::parse(&format!("{}/styles/main.css", server.uri())).unwrap();
        let response = fetcher(None).fetch(&request).await.unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(response.header("content-type"), Some("text/css"));
        assert_eq!(response.text().unwrap(), "body{}");
        assert_eq!(response.source, ResponseSource::Network);
        assert_eq!(response.response_type, ResponseType::Basic);
    }

    #[tokio::test]
    async fn test_no_store_sends_no_cache_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/index.html"))
            .and(header_eq("cache-control", "no-cache"))
            .and(header_eq("pragma", "no-cache"))
            .respond_with(ResponseTemplate::new(200).set_body_string("fresh"))
            .mount(&server)
            .await;

        let request = Request::parse(&format!("{}/index.html", server.uri()))
            .unwrap()
            .cache(CacheMode::NoStore);
        let response = fetcher(None).fetch(&request).await.unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(response.text().unwrap(), "fresh");
    }

    #[tokio::test]
    async fn test_no_cors_cross_origin_is_opaque() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/font.woff2"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1u8, 2, 3]))
            .mount(&server)
            .await;

        let request = Request::parse(&format!("{}/font.woff2", server.uri()))
            .unwrap()
            .mode(RequestMode::NoCors);
        let response = fetcher(Some("https://app.example.com")).fetch(&request).await.unwrap();

        assert!(response.is_opaque());
        assert_eq!(response.status, 0);
        assert_eq!(response.body.as_ref(), &[1u8, 2, 3]);
    }

    #[tokio::test]
    async fn test_unreachable_host_is_an_error() {
        // Nothing listens on port 9 on localhost.
        let request = Request::parse("http://127.0.0.1:9/").unwrap();
        let result = fetcher(None).fetch(&request).await;
        assert!(matches!(result, Err(NetError::Unreachable(_)) | Err(NetError::Timeout(_))));
    }
}
