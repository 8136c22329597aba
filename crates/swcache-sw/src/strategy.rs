//! Fetch strategies.
//!
//! Each strategy always produces a response. Successful network responses
//! are forwarded untouched; the store keeps its own snapshot, taken from the
//! shared body buffer, through the [`CacheWriter`].

use std::sync::Arc;
use std::time::Duration;

use swcache_common::with_timeout;
use swcache_net::{CacheMode, Fetcher, Request, Response};
use swcache_store::{RequestIdentity, StoredResponse};
use tracing::{debug, warn};

use crate::classify::StrategyTag;
use crate::error::{Result, SwError};
use crate::generation::GenerationManager;
use crate::synthetic::{failure_response, FailureKind};
use crate::writer::CacheWriter;

/// Runs strategies against the current generation and the network.
pub struct StrategyExecutor {
    manager: Arc<GenerationManager>,
    fetcher: Arc<dyn Fetcher>,
    writer: CacheWriter,
    timeout: Duration,
}

impl StrategyExecutor {
    pub fn new(
        manager: Arc<GenerationManager>,
        fetcher: Arc<dyn Fetcher>,
        writer: CacheWriter,
        timeout: Duration,
    ) -> Self {
        Self {
            manager,
            fetcher,
            writer,
            timeout,
        }
    }

    /// Serve `request` with the given strategy.
    pub async fn execute(&self, strategy: StrategyTag, request: &Request) -> Response {
        debug!(id = request.id.raw(), url = %request.url, %strategy, "Executing strategy");
        match strategy {
            StrategyTag::CacheFirst => self.cache_first(request).await,
            StrategyTag::NetworkFirst => self.network_first(request).await,
            StrategyTag::NetworkOnly => self.network_only(request).await,
        }
    }

    /// Stored snapshot if present; otherwise fetch, store and return.
    pub async fn cache_first(&self, request: &Request) -> Response {
        let identity = RequestIdentity::from_request(request);
        let miss = match self.lookup(&identity).await {
            Ok(cached) => {
                debug!(%identity, "Cache hit");
                return cached;
            }
            Err(miss) => miss,
        };

        match self.fetch(request).await {
            Ok(response) => {
                self.store_later(identity, &response);
                response
            }
            Err(e) => {
                debug!(%identity, kind = e.kind(), error = %e, "Cache miss and network failed");
                failure_response(
                    FailureKind::ServiceUnavailable,
                    &request.url,
                    format!("{miss} and the network failed: {e}"),
                )
            }
        }
    }

    /// Fresh from the network, bypassing intermediate caches; the stored
    /// snapshot only when the network fails.
    pub async fn network_first(&self, request: &Request) -> Response {
        let identity = RequestIdentity::from_request(request);
        let fresh = request.clone().cache(CacheMode::NoStore);

        match self.fetch(&fresh).await {
            Ok(response) => {
                self.store_later(identity, &response);
                response
            }
            Err(e) => {
                debug!(%identity, kind = e.kind(), error = %e, "Network failed, trying cache");
                match self.lookup(&identity).await {
                    Ok(cached) => cached,
                    Err(miss) => failure_response(
                        FailureKind::OfflineCacheMiss,
                        &request.url,
                        format!("{e}; {miss}"),
                    ),
                }
            }
        }
    }

    /// Network only. The store is never read or written.
    pub async fn network_only(&self, request: &Request) -> Response {
        let fresh = request.clone().cache(CacheMode::NoStore);
        match self.fetch(&fresh).await {
            Ok(response) => response,
            Err(e) => failure_response(FailureKind::NetworkUnreachable, &request.url, e.to_string()),
        }
    }

    async fn fetch(&self, request: &Request) -> Result<Response> {
        let response = with_timeout(self.timeout, self.fetcher.fetch(request)).await??;
        Ok(response)
    }

    /// Current-generation lookup. Misses, including a failing store, come
    /// back as [`SwError::CacheMiss`].
    async fn lookup(&self, identity: &RequestIdentity) -> Result<Response> {
        match self.manager.get(identity).await {
            Ok(Some(stored)) => Ok(stored.to_response(identity.url())),
            Ok(None) => Err(SwError::CacheMiss(identity.clone())),
            Err(e) => {
                warn!(%identity, kind = e.kind(), error = %e, "Cache read failed; treating as miss");
                Err(SwError::CacheMiss(identity.clone()))
            }
        }
    }

    fn store_later(&self, identity: RequestIdentity, response: &Response) {
        if !response.is_cacheable() {
            debug!(%identity, status = response.status, "Response not cacheable");
            return;
        }
        self.writer.enqueue(identity, StoredResponse::from_response(response));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use http::HeaderMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use swcache_net::NetError;
    use swcache_store::{MemoryStore, ResponseStore};
    use url::Url;

    /// Answers every request with the configured status, or fails when
    /// offline. Records the cache mode of each request.
    struct StubFetcher {
        status: u16,
        offline: bool,
        calls: AtomicUsize,
        modes: Mutex<Vec<CacheMode>>,
    }

    impl StubFetcher {
        fn new(status: u16, offline: bool) -> Arc<Self> {
            Arc::new(Self {
                status,
                offline,
                calls: AtomicUsize::new(0),
                modes: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Fetcher for StubFetcher {
        async fn fetch(&self, request: &Request) -> std::result::Result<Response, NetError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.modes.lock().unwrap().push(request.cache);
            if self.offline {
                return Err(NetError::Unreachable("offline".into()));
            }
            Ok(Response::new(
                request.url.clone(),
                self.status,
                HeaderMap::new(),
                Bytes::from_static(b"live"),
            ))
        }
    }

    async fn executor(store: Arc<dyn ResponseStore>, fetcher: Arc<StubFetcher>) -> (StrategyExecutor, CacheWriter) {
        store.create_generation("v1").unwrap();
        let manager = Arc::new(GenerationManager::open(store, "v1").await.unwrap());
        let writer = CacheWriter::spawn(Arc::clone(&manager));
        let executor = StrategyExecutor::new(manager, fetcher, writer.clone(), Duration::from_secs(5));
        (executor, writer)
    }

    fn request(path: &str) -> Request {
        Request::get(Url::parse(&format!("https://app.example.com{path}")).unwrap())
    }

    #[tokio::test]
    async fn test_non_200_passes_through_uncached() {
        let store: Arc<dyn ResponseStore> = Arc::new(MemoryStore::new());
        let fetcher = StubFetcher::new(404, false);
        let (executor, writer) = executor(Arc::clone(&store), Arc::clone(&fetcher)).await;

        let response = executor.cache_first(&request("/missing.png")).await;
        writer.flush().await;

        assert_eq!(response.status, 404);
        assert_eq!(store.entry_count("v1").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_network_first_bypasses_http_cache() {
        let store: Arc<dyn ResponseStore> = Arc::new(MemoryStore::new());
        let fetcher = StubFetcher::new(200, false);
        let (executor, _writer) = executor(store, Arc::clone(&fetcher)).await;

        executor.network_first(&request("/index.html")).await;
        executor.network_only(&request("/api")).await;
        executor.cache_first(&request("/app.js")).await;

        let modes = fetcher.modes.lock().unwrap().clone();
        assert_eq!(modes, vec![CacheMode::NoStore, CacheMode::NoStore, CacheMode::Default]);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_cache_first_failure_is_service_unavailable() {
        let store: Arc<dyn ResponseStore> = Arc::new(MemoryStore::new());
        let (executor, _writer) = executor(store, StubFetcher::new(200, true)).await;

        let response = executor.cache_first(&request("/app.js")).await;

        assert_eq!(response.status, 503);
        assert_eq!(FailureKind::of(&response), Some(FailureKind::ServiceUnavailable));
    }

    #[tokio::test]
    async fn test_lookup_miss_is_cache_miss() {
        let store: Arc<dyn ResponseStore> = Arc::new(MemoryStore::new());
        let (executor, _writer) = executor(store, StubFetcher::new(200, true)).await;
        let identity = RequestIdentity::from_request(&request("/inbox.html"));

        let miss = executor.lookup(&identity).await.unwrap_err();
        assert!(matches!(&miss, SwError::CacheMiss(id) if *id == identity));
        assert_eq!(miss.kind(), "cache-miss");

        let response = executor.network_first(&request("/inbox.html")).await;
        let body: crate::synthetic::FailureBody = response.json().unwrap();
        assert_eq!(body.error, FailureKind::OfflineCacheMiss);
        assert!(body.message.contains("No cached response for GET https://app.example.com/inbox.html"));
    }

    #[tokio::test]
    async fn test_network_only_never_writes() {
        let store: Arc<dyn ResponseStore> = Arc::new(MemoryStore::new());
        let fetcher = StubFetcher::new(200, false);
        let (executor, writer) = executor(Arc::clone(&store), fetcher).await;

        let response = executor.execute(StrategyTag::NetworkOnly, &request("/messages")).await;
        writer.flush().await;

        assert_eq!(response.body.as_ref(), b"live");
        assert_eq!(store.entry_count("v1").unwrap(), 0);
        assert_eq!(writer.written(), 0);
    }
}
