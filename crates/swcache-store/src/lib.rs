//! # swcache store
//!
//! Durable key-value storage of HTTP responses, partitioned by generation.
//!
//! ## Architecture
//!
//! ```text
//! ResponseStore
//!     │
//!     ├── generation "v16"
//!     │       └── RequestIdentity (method, url) → StoredResponse
//!     │
//!     └── generation "v17-installing"
//!             └── RequestIdentity (method, url) → StoredResponse
//! ```
//!
//! Stores never pick a generation themselves: every call names one. Which
//! generation is live is decided by the generation manager in `swcache-sw`.
//!
//! Two implementations ship here: [`SqliteStore`] (durable, shareable between
//! processes) and [`MemoryStore`] (tests and ephemeral proxies).

use std::collections::BTreeSet;
use std::fmt;

use bytes::Bytes;
use http::HeaderMap;
use swcache_net::{Request, Response, ResponseSource, ResponseType};
use thiserror::Error;
use url::Url;

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

// ==================== Errors ====================

/// Errors raised by a response store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Storage quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Generation not found: {0}")]
    UnknownGeneration(String),

    #[error("Corrupt entry: {0}")]
    Corrupt(String),

    #[error("Store lock poisoned")]
    Poisoned,

    #[error("Background store task failed: {0}")]
    Task(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Whether the write was rejected for lack of space.
    pub fn is_quota(&self) -> bool {
        matches!(self, StoreError::QuotaExceeded(_))
    }

    /// Whether the write addressed a generation that no longer exists.
    pub fn is_unknown_generation(&self) -> bool {
        matches!(self, StoreError::UnknownGeneration(_))
    }
}

// ==================== Types ====================

/// Cache key of a request: its method and absolute URL.
///
/// Headers play no part. The fragment is dropped because it never reaches
/// the network.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestIdentity {
    method: String,
    url: Url,
}

impl RequestIdentity {
    /// Create an identity from a method and URL.
    pub fn new(method: &str, url: &Url) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        Self {
            method: method.to_ascii_uppercase(),
            url,
        }
    }

    /// Identity of an inbound request.
    pub fn from_request(request: &Request) -> Self {
        Self::new(request.method.as_str(), &request.url)
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

impl fmt::Display for RequestIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}

/// An immutable snapshot of a response as it was accepted into the store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredResponse {
    /// Status code (0 for opaque responses).
    pub status: u16,
    /// Headers in received order, duplicates kept.
    pub headers: HeaderMap,
    /// Body bytes.
    pub body: Bytes,
    /// Cross-origin no-cors response.
    pub opaque: bool,
    /// When the snapshot was taken (ms since epoch).
    pub stored_at: i64,
}

impl StoredResponse {
    /// Snapshot a response. The body is shared, not copied.
    pub fn from_response(response: &Response) -> Self {
        Self {
            status: response.status,
            headers: response.headers.clone(),
            body: response.body.clone(),
            opaque: response.is_opaque(),
            stored_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Replay the snapshot as a response for `url`.
    pub fn to_response(&self, url: &Url) -> Response {
        Response {
            url: url.clone(),
            status: self.status,
            headers: self.headers.clone(),
            body: self.body.clone(),
            response_type: if self.opaque {
                ResponseType::Opaque
            } else {
                ResponseType::Basic
            },
            source: ResponseSource::Cache,
        }
    }

    /// Approximate storage footprint in bytes.
    pub fn size_bytes(&self) -> usize {
        let headers: usize = self
            .headers
            .iter()
            .map(|(name, value)| name.as_str().len() + value.len() + 4)
            .sum();
        self.body.len() + headers
    }
}

// ==================== Store ====================

/// A generation-partitioned response store.
///
/// Implementations must tolerate concurrent callers: deletes are idempotent
/// and puts overwrite, so no lock is needed above the store.
pub trait ResponseStore: Send + Sync {
    /// Look up `identity` in `generation` only.
    fn get(&self, generation: &str, identity: &RequestIdentity) -> Result<Option<StoredResponse>, StoreError>;

    /// Store `response` under `identity`, replacing any previous snapshot.
    ///
    /// Fails with [`StoreError::UnknownGeneration`] if `generation` does not
    /// exist, so a write never brings back a deleted generation.
    fn put(&self, generation: &str, identity: &RequestIdentity, response: &StoredResponse) -> Result<(), StoreError>;

    /// Create an empty generation. No-op if it exists.
    fn create_generation(&self, name: &str) -> Result<(), StoreError>;

    /// Remove a generation and all its entries. Returns whether it existed.
    fn delete_generation(&self, name: &str) -> Result<bool, StoreError>;

    /// Names of every generation present.
    fn list_generations(&self) -> Result<BTreeSet<String>, StoreError>;

    /// Names of every generation present, oldest first. A promoted
    /// generation keeps the age of the partition it was promoted from.
    fn generations_by_age(&self) -> Result<Vec<String>, StoreError>;

    /// Identities stored in a generation.
    fn keys(&self, generation: &str) -> Result<Vec<RequestIdentity>, StoreError>;

    /// Number of entries in a generation.
    fn entry_count(&self, generation: &str) -> Result<usize, StoreError>;

    /// Atomically delete every generation except `from`, then rename `from`
    /// to `to`. If `from` does not exist, `to` is created empty.
    ///
    /// Returns the names that were deleted.
    fn promote_generation(&self, from: &str, to: &str) -> Result<Vec<String>, StoreError>;
}

#[cfg(test)]
pub(crate) mod conformance {
    //! Behaviour every [`ResponseStore`] must share.

    use super::*;
    use http::HeaderValue;

    pub fn identity(path: &str) -> RequestIdentity {
        RequestIdentity::new("GET", &Url::parse(&format!("https://app.example.com{path}")).unwrap())
    }

    pub fn snapshot(body: &'static [u8]) -> StoredResponse {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("image/png"));
        headers.append("set-cookie", HeaderValue::from_static("a=1"));
        headers.append("set-cookie", HeaderValue::from_static("b=2"));
        StoredResponse {
            status: 200,
            headers,
            body: Bytes::from_static(body),
            opaque: false,
            stored_at: 1,
        }
    }

    pub fn put_then_get_preserves_snapshot(store: &dyn ResponseStore) {
        let id = identity("/logo.png");
        let stored = snapshot(b"\x89PNG");
        store.create_generation("v1").unwrap();
        store.put("v1", &id, &stored).unwrap();

        let loaded = store.get("v1", &id).unwrap().unwrap();
        assert_eq!(loaded, stored);
        let cookies: Vec<_> = loaded.headers.get_all("set-cookie").iter().collect();
        assert_eq!(cookies, vec!["a=1", "b=2"]);
    }

    pub fn get_never_falls_back_to_other_generations(store: &dyn ResponseStore) {
        let id = identity("/logo.png");
        store.create_generation("v1").unwrap();
        store.create_generation("v2").unwrap();
        store.put("v1", &id, &snapshot(b"old")).unwrap();

        assert!(store.get("v2", &id).unwrap().is_none());
        assert!(store.get("v3", &id).unwrap().is_none());
    }

    pub fn put_overwrites(store: &dyn ResponseStore) {
        let id = identity("/index.html");
        store.create_generation("v1").unwrap();
        store.put("v1", &id, &snapshot(b"A")).unwrap();
        store.put("v1", &id, &snapshot(b"B")).unwrap();

        assert_eq!(store.get("v1", &id).unwrap().unwrap().body.as_ref(), b"B");
        assert_eq!(store.entry_count("v1").unwrap(), 1);
    }

    pub fn method_is_part_of_identity(store: &dyn ResponseStore) {
        let url = Url::parse("https://app.example.com/data").unwrap();
        store.create_generation("v1").unwrap();
        store.put("v1", &RequestIdentity::new("get", &url), &snapshot(b"get")).unwrap();

        assert!(store.get("v1", &RequestIdentity::new("GET", &url)).unwrap().is_some());
        assert!(store.get("v1", &RequestIdentity::new("HEAD", &url)).unwrap().is_none());
    }

    pub fn delete_generation_is_idempotent(store: &dyn ResponseStore) {
        store.create_generation("v1").unwrap();
        store.put("v1", &identity("/a.js"), &snapshot(b"a")).unwrap();

        assert!(store.delete_generation("v1").unwrap());
        assert!(!store.delete_generation("v1").unwrap());
        assert!(store.list_generations().unwrap().is_empty());
        assert_eq!(store.entry_count("v1").unwrap(), 0);
    }

    pub fn promote_leaves_exactly_the_new_generation(store: &dyn ResponseStore) {
        store.create_generation("v16").unwrap();
        store.create_generation("v17-installing").unwrap();
        store.put("v16", &identity("/old.css"), &snapshot(b"old")).unwrap();
        store.put("v17-installing", &identity("/logo.png"), &snapshot(b"new")).unwrap();

        let retired = store.promote_generation("v17-installing", "v17").unwrap();

        assert_eq!(retired, vec!["v16".to_string()]);
        let names: Vec<_> = store.list_generations().unwrap().into_iter().collect();
        assert_eq!(names, vec!["v17".to_string()]);
        assert_eq!(store.get("v17", &identity("/logo.png")).unwrap().unwrap().body.as_ref(), b"new");
        assert!(store.get("v16", &identity("/old.css")).unwrap().is_none());
    }

    pub fn promote_without_source_creates_empty_target(store: &dyn ResponseStore) {
        store.create_generation("v1").unwrap();
        store.put("v1", &identity("/a.js"), &snapshot(b"a")).unwrap();

        let retired = store.promote_generation("v2-installing", "v2").unwrap();

        assert_eq!(retired, vec!["v1".to_string()]);
        let names: Vec<_> = store.list_generations().unwrap().into_iter().collect();
        assert_eq!(names, vec!["v2".to_string()]);
        assert_eq!(store.entry_count("v2").unwrap(), 0);
    }

    pub fn keys_lists_identities(store: &dyn ResponseStore) {
        store.create_generation("v1").unwrap();
        store.create_generation("v2").unwrap();
        store.put("v1", &identity("/b.js"), &snapshot(b"b")).unwrap();
        store.put("v1", &identity("/a.js"), &snapshot(b"a")).unwrap();
        store.put("v2", &identity("/c.js"), &snapshot(b"c")).unwrap();

        let mut keys = store.keys("v1").unwrap();
        keys.sort();
        assert_eq!(keys, vec![identity("/a.js"), identity("/b.js")]);
    }

    pub fn put_never_recreates_a_deleted_generation(store: &dyn ResponseStore) {
        store.create_generation("v16").unwrap();
        store.promote_generation("v17-installing", "v17").unwrap();

        let err = store.put("v16", &identity("/app.js"), &snapshot(b"stale")).unwrap_err();

        assert!(err.is_unknown_generation());
        let names: Vec<_> = store.list_generations().unwrap().into_iter().collect();
        assert_eq!(names, vec!["v17".to_string()]);
    }

    pub fn generations_by_age_follows_creation_order(store: &dyn ResponseStore) {
        store.create_generation("v9").unwrap();
        store.create_generation("v10").unwrap();
        store.create_generation("v11-installing").unwrap();

        assert_eq!(store.generations_by_age().unwrap(), vec!["v9", "v10", "v11-installing"]);

        store.promote_generation("v11-installing", "v11").unwrap();
        assert_eq!(store.generations_by_age().unwrap(), vec!["v11"]);
    }

    pub fn run_all(make: impl Fn() -> Box<dyn ResponseStore>) {
        put_then_get_preserves_snapshot(make().as_ref());
        get_never_falls_back_to_other_generations(make().as_ref());
        put_overwrites(make().as_ref());
        method_is_part_of_identity(make().as_ref());
        delete_generation_is_idempotent(make().as_ref());
        promote_leaves_exactly_the_new_generation(make().as_ref());
        promote_without_source_creates_empty_target(make().as_ref());
        keys_lists_identities(make().as_ref());
        put_never_recreates_a_deleted_generation(make().as_ref());
        generations_by_age_follows_creation_order(make().as_ref());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn test_identity_normalizes_method_and_fragment() {
        let url = Url::parse("https://example.com/page#section").unwrap();
        let id = RequestIdentity::new("get", &url);

        assert_eq!(id.method(), "GET");
        assert_eq!(id.url().as_str(), "https://example.com/page");
        assert_eq!(id.to_string(), "GET https://example.com/page");
    }

    #[test]
    fn test_identity_ignores_headers() {
        let url = Url::parse("https://example.com/app.js").unwrap();
        let plain = Request::get(url.clone());
        let with_accept = Request::get(url).accept("text/javascript");

        assert_eq!(
            RequestIdentity::from_request(&plain),
            RequestIdentity::from_request(&with_accept)
        );
    }

    #[test]
    fn test_snapshot_replays_as_cache_response() {
        let url = Url::parse("https://fonts.example.net/v.woff2").unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("etag", HeaderValue::from_static("\"abc\""));
        let live = Response::new(url.clone(), 200, headers, Bytes::from_static(b"font"));

        let stored = StoredResponse::from_response(&live);
        let replayed = stored.to_response(&url);

        assert_eq!(replayed.status, live.status);
        assert_eq!(replayed.headers, live.headers);
        assert_eq!(replayed.body, live.body);
        assert_eq!(replayed.source, ResponseSource::Cache);
        assert!(stored.size_bytes() >= 4);
    }

    #[test]
    fn test_opaque_snapshot_stays_opaque() {
        let url = Url::parse("https://cdn.example.net/all.min.css").unwrap();
        let stored = StoredResponse::from_response(&Response::opaque(url.clone(), Bytes::new()));

        assert!(stored.opaque);
        assert_eq!(stored.status, 0);
        assert!(stored.to_response(&url).is_opaque());
    }
}
