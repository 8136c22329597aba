//! Fire-and-forget cache population.
//!
//! Strategies hand snapshots to a [`CacheWriter`] and return immediately.
//! One background task applies the writes in the order they were queued, so
//! of two writes to the same identity the later one wins. Failures are
//! logged and counted; they never reach a caller.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use swcache_store::{RequestIdentity, StoredResponse};
use tokio::sync::{mpsc, oneshot};
use tracing::{trace, warn};

use crate::generation::GenerationManager;

enum WriteJob {
    Put {
        identity: RequestIdentity,
        snapshot: StoredResponse,
    },
    Flush(oneshot::Sender<()>),
}

#[derive(Debug, Default)]
struct WriterStats {
    written: AtomicU64,
    failed: AtomicU64,
}

/// Handle to the background cache writer. Cheap to clone.
#[derive(Clone)]
pub struct CacheWriter {
    tx: mpsc::UnboundedSender<WriteJob>,
    stats: Arc<WriterStats>,
}

impl CacheWriter {
    /// Start the writer task on the current runtime.
    ///
    /// The task ends once every handle has been dropped and the queue is
    /// drained.
    pub fn spawn(manager: Arc<GenerationManager>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let stats = Arc::new(WriterStats::default());
        let task_stats = Arc::clone(&stats);

        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                match job {
                    WriteJob::Put { identity, snapshot } => match manager.put(&identity, snapshot).await {
                        Ok(()) => {
                            task_stats.written.fetch_add(1, Ordering::Relaxed);
                            trace!(%identity, "Cache write applied");
                        }
                        Err(e) => {
                            task_stats.failed.fetch_add(1, Ordering::Relaxed);
                            warn!(%identity, kind = e.kind(), error = %e, "Cache write failed; response was still delivered");
                        }
                    },
                    WriteJob::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
        });

        Self { tx, stats }
    }

    /// Queue a snapshot for the current generation.
    pub fn enqueue(&self, identity: RequestIdentity, snapshot: StoredResponse) {
        if self.tx.send(WriteJob::Put { identity, snapshot }).is_err() {
            self.stats.failed.fetch_add(1, Ordering::Relaxed);
            warn!("Cache writer stopped; write dropped");
        }
    }

    /// Wait until every write queued before this call has been applied.
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.tx.send(WriteJob::Flush(done)).is_ok() {
            let _ = wait.await;
        }
    }

    /// Writes applied so far.
    pub fn written(&self) -> u64 {
        self.stats.written.load(Ordering::Relaxed)
    }

    /// Writes that failed or were dropped.
    pub fn failed(&self) -> u64 {
        self.stats.failed.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http::HeaderMap;
    use swcache_net::Response;
    use swcache_store::{MemoryStore, ResponseStore};
    use url::Url;

    fn snapshot(url: &Url, body: &'static [u8]) -> StoredResponse {
        StoredResponse::from_response(&Response::new(url.clone(), 200, HeaderMap::new(), Bytes::from_static(body)))
    }

    async fn active_manager(store: Arc<dyn ResponseStore>) -> Arc<GenerationManager> {
        store.create_generation("v1").unwrap();
        Arc::new(GenerationManager::open(store, "v1").await.unwrap())
    }

    #[tokio::test]
    async fn test_writes_apply_in_queue_order() {
        let store: Arc<dyn ResponseStore> = Arc::new(MemoryStore::new());
        let writer = CacheWriter::spawn(active_manager(Arc::clone(&store)).await);
        let url = Url::parse("https://app.example.com/index.html").unwrap();
        let id = RequestIdentity::new("GET", &url);

        writer.enqueue(id.clone(), snapshot(&url, b"A"));
        writer.enqueue(id.clone(), snapshot(&url, b"B"));
        writer.flush().await;

        assert_eq!(store.get("v1", &id).unwrap().unwrap().body.as_ref(), b"B");
        assert_eq!(writer.written(), 2);
        assert_eq!(writer.failed(), 0);
    }

    #[tokio::test]
    async fn test_failed_write_is_counted_not_raised() {
        let store: Arc<dyn ResponseStore> = Arc::new(MemoryStore::with_quota(8));
        let writer = CacheWriter::spawn(active_manager(Arc::clone(&store)).await);
        let url = Url::parse("https://app.example.com/big.js").unwrap();

        writer.enqueue(RequestIdentity::new("GET", &url), snapshot(&url, b"far more than eight bytes"));
        writer.flush().await;

        assert_eq!(writer.failed(), 1);
        assert_eq!(store.entry_count("v1").unwrap(), 0);
    }
}
