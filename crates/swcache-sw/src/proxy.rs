//! The caching proxy facade.

use std::sync::Arc;

use serde_json::Value;
use swcache_net::{Fetcher, HttpFetcher, Request, Response};
use swcache_store::{ResponseStore, SqliteStore};
use tracing::{error, info};

use crate::classify::{Classifier, StrategyTag};
use crate::config::CacheConfig;
use crate::error::{Result, SwError};
use crate::generation::GenerationManager;
use crate::lifecycle::{Activation, ClientId, ClientRegistry, LifecycleController, MessageOutcome};
use crate::strategy::StrategyExecutor;
use crate::synthetic::{failure_response, FailureKind};
use crate::writer::CacheWriter;

/// One running instance of the caching proxy.
///
/// Several proxies may share a store (e.g. one SQLite file); each keeps its
/// own classifier, writer and connected instances.
pub struct CacheProxy {
    config: CacheConfig,
    classifier: Classifier,
    manager: Arc<GenerationManager>,
    executor: Arc<StrategyExecutor>,
    writer: CacheWriter,
    lifecycle: LifecycleController,
}

impl CacheProxy {
    /// Wire a proxy over an explicit store and fetcher.
    pub async fn new(config: CacheConfig, store: Arc<dyn ResponseStore>, fetcher: Arc<dyn Fetcher>) -> Result<Self> {
        let manager = Arc::new(GenerationManager::open(store, config.version.clone()).await?);
        let writer = CacheWriter::spawn(Arc::clone(&manager));
        let executor = Arc::new(StrategyExecutor::new(
            Arc::clone(&manager),
            Arc::clone(&fetcher),
            writer.clone(),
            config.fetch_timeout(),
        ));
        let lifecycle =
            LifecycleController::new(&config, Arc::clone(&manager), Arc::new(ClientRegistry::new()), fetcher)?;

        Ok(Self {
            classifier: Classifier::from_config(&config),
            config,
            manager,
            executor,
            writer,
            lifecycle,
        })
    }

    /// Open a proxy on the configured SQLite database and the live network.
    pub async fn open(config: CacheConfig) -> Result<Self> {
        let path = config.database_path();
        let store = tokio::task::spawn_blocking(move || SqliteStore::open(path))
            .await
            .map_err(|e| SwError::InvalidState(format!("store open task failed: {e}")))??;
        let fetcher = HttpFetcher::new(config.loader_config()?).map_err(|e| SwError::Config(e.to_string()))?;
        info!(version = %config.version, "Cache proxy opened");
        Self::new(config, Arc::new(store), Arc::new(fetcher)).await
    }

    /// Serve a request.
    ///
    /// The strategy runs on its own task: if the caller stops waiting, the
    /// fetch and its cache write still complete.
    pub async fn handle_fetch(&self, request: Request) -> Response {
        let strategy = self.classify(&request);
        let url = request.url.clone();
        let executor = Arc::clone(&self.executor);

        let task = tokio::spawn(async move { executor.execute(strategy, &request).await });
        match task.await {
            Ok(response) => response,
            Err(e) => {
                error!(url = %url, %strategy, error = %e, "Strategy task failed");
                failure_response(FailureKind::Internal, &url, "The request could not be served")
            }
        }
    }

    pub fn classify(&self, request: &Request) -> StrategyTag {
        self.classifier.classify(request)
    }

    /// Install this build's generation (and activate it with `skip_waiting`).
    pub async fn install(&self) -> Result<Option<Activation>> {
        self.lifecycle.install().await
    }

    pub async fn activate(&self) -> Result<Activation> {
        self.lifecycle.activate().await
    }

    pub async fn handle_message(&self, from: ClientId, message: &Value) -> Result<MessageOutcome> {
        self.lifecycle.handle_message(from, message).await
    }

    /// Wait for queued cache writes.
    pub async fn flush(&self) {
        self.writer.flush().await;
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    pub fn generations(&self) -> &Arc<GenerationManager> {
        &self.manager
    }

    pub fn clients(&self) -> &Arc<ClientRegistry> {
        self.lifecycle.clients()
    }

    pub fn writer(&self) -> &CacheWriter {
        &self.writer
    }
}
