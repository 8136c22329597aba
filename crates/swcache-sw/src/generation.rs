//! Generation management.
//!
//! A generation is one named partition of the response store. This build
//! installs into `<label>-installing`, and activation promotes that staging
//! partition to `<label>` while deleting every other generation in the same
//! store transaction.
//!
//! ```text
//!   Pending ──install──▶ Installing ──ok──▶ Waiting ──activate──▶ Active
//!                            │
//!                            └──asset failed──▶ Retired
//! ```

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::try_join_all;
use swcache_common::{retry_with_backoff, with_timeout, RetryConfig};
use swcache_net::{Fetcher, Request, Response};
use swcache_store::{RequestIdentity, ResponseStore, StoreError, StoredResponse};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{Result, SwError};

/// Suffix marking a generation that is still being installed.
pub const STAGING_SUFFIX: &str = "-installing";

/// Lifecycle state of this build's generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationState {
    /// Not installed yet.
    Pending,
    /// Pre-cache assets are being fetched.
    Installing,
    /// Installed, waiting to be promoted.
    Waiting,
    /// Serving every store operation.
    Active,
    /// Install failed, or a newer generation replaced this one.
    Retired,
}

impl fmt::Display for GenerationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GenerationState::Pending => "pending",
            GenerationState::Installing => "installing",
            GenerationState::Waiting => "waiting",
            GenerationState::Active => "active",
            GenerationState::Retired => "retired",
        };
        f.write_str(name)
    }
}

/// Summary of one stored generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationInfo {
    pub name: String,
    pub entries: usize,
    /// Reads and writes currently go here.
    pub current: bool,
    /// An install in progress (or abandoned).
    pub staging: bool,
}

#[derive(Debug)]
struct ManagerState {
    state: GenerationState,
    /// Generation that answers store operations.
    current: Option<String>,
}

/// Which generation serves the build `label`, given every stored name
/// oldest first: its own generation if present, otherwise the newest other
/// live one.
fn discover(label: &str, names: &[String]) -> (GenerationState, Option<String>) {
    if names.iter().any(|name| name == label) {
        return (GenerationState::Active, Some(label.to_string()));
    }

    let staging = format!("{label}{STAGING_SUFFIX}");
    let live: Vec<&String> = names.iter().filter(|name| !name.ends_with(STAGING_SUFFIX)).collect();
    if live.len() > 1 {
        warn!(?live, "Several live generations found; using the newest");
    }
    // Staged by another instance that has not activated it yet.
    let state = if names.contains(&staging) {
        GenerationState::Waiting
    } else {
        GenerationState::Pending
    };
    (state, live.last().map(|name| (*name).clone()))
}

/// Run a store call on the blocking pool.
pub(crate) async fn run_blocking<T, F>(store: &Arc<dyn ResponseStore>, f: F) -> std::result::Result<T, StoreError>
where
    F: FnOnce(&dyn ResponseStore) -> std::result::Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || f(store.as_ref()))
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
}

/// Owns the current generation name and every transition between
/// generations.
pub struct GenerationManager {
    store: Arc<dyn ResponseStore>,
    label: String,
    inner: RwLock<ManagerState>,
}

impl GenerationManager {
    /// Attach to `store` as the build labelled `label`.
    ///
    /// The live generation is discovered from storage, so several managers
    /// opened on the same store agree on it. If this build's generation is
    /// already present it is `Active`; if only its staging partition is, it
    /// is `Waiting`. Otherwise the most recently created other live
    /// generation keeps serving until this build activates.
    pub async fn open(store: Arc<dyn ResponseStore>, label: impl Into<String>) -> Result<Self> {
        let label = label.into();
        let names = run_blocking(&store, |s| s.generations_by_age()).await?;
        let (state, current) = discover(&label, &names);

        info!(label = %label, %state, current = ?current, "Generation manager opened");

        Ok(Self {
            store,
            label,
            inner: RwLock::new(ManagerState { state, current }),
        })
    }

    /// Version label of this build.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Name this build installs into before activation.
    pub fn staging_name(&self) -> String {
        format!("{}{}", self.label, STAGING_SUFFIX)
    }

    pub async fn state(&self) -> GenerationState {
        self.inner.read().await.state
    }

    /// Generation answering store operations, if any.
    pub async fn current(&self) -> Option<String> {
        self.inner.read().await.current.clone()
    }

    pub fn store(&self) -> &Arc<dyn ResponseStore> {
        &self.store
    }

    // ==================== Store access ====================

    /// Look `identity` up in the current generation.
    ///
    /// A miss in a generation another instance has since deleted is retried
    /// once against the generation that replaced it.
    pub async fn get(&self, identity: &RequestIdentity) -> Result<Option<StoredResponse>> {
        let Some(generation) = self.current().await else {
            return Ok(None);
        };
        if let Some(hit) = self.read_from(generation.clone(), identity.clone()).await? {
            return Ok(Some(hit));
        }

        match self.refresh(&generation).await? {
            Some(next) if next != generation => Ok(self.read_from(next, identity.clone()).await?),
            _ => Ok(None),
        }
    }

    /// Write `snapshot` into the current generation.
    ///
    /// Without a current generation there is nowhere to write and the call
    /// does nothing. If another instance deleted the current generation, the
    /// write follows the generation that replaced it, or is skipped when
    /// none did; a write never recreates a deleted generation.
    pub async fn put(&self, identity: &RequestIdentity, snapshot: StoredResponse) -> Result<()> {
        let Some(generation) = self.current().await else {
            debug!(%identity, "No current generation, write skipped");
            return Ok(());
        };

        match self.write_to(generation.clone(), identity.clone(), snapshot.clone()).await {
            Err(e) if e.is_unknown_generation() => {}
            other => return other.map_err(SwError::StoreWriteFailed),
        }

        match self.refresh(&generation).await.map_err(SwError::StoreWriteFailed)? {
            Some(next) if next != generation => self
                .write_to(next, identity.clone(), snapshot)
                .await
                .map_err(SwError::StoreWriteFailed),
            _ => {
                debug!(%identity, generation = %generation, "Generation gone, write skipped");
                Ok(())
            }
        }
    }

    async fn read_from(
        &self,
        generation: String,
        identity: RequestIdentity,
    ) -> std::result::Result<Option<StoredResponse>, StoreError> {
        run_blocking(&self.store, move |s| s.get(&generation, &identity)).await
    }

    async fn write_to(
        &self,
        generation: String,
        identity: RequestIdentity,
        snapshot: StoredResponse,
    ) -> std::result::Result<(), StoreError> {
        run_blocking(&self.store, move |s| s.put(&generation, &identity, &snapshot)).await
    }

    /// Re-discover the live generation if `stale` is no longer stored.
    ///
    /// Returns the generation now answering store operations. An active
    /// build whose generation was replaced by another build's becomes
    /// `Retired`.
    async fn refresh(&self, stale: &str) -> std::result::Result<Option<String>, StoreError> {
        let names = run_blocking(&self.store, |s| s.generations_by_age()).await?;
        let mut inner = self.inner.write().await;
        if inner.current.as_deref() != Some(stale) || names.iter().any(|name| name == stale) {
            return Ok(inner.current.clone());
        }

        let (found, current) = discover(&self.label, &names);
        match (inner.state, found) {
            (GenerationState::Pending, GenerationState::Active) => inner.state = GenerationState::Active,
            (GenerationState::Active, found) if found != GenerationState::Active => {
                inner.state = GenerationState::Retired;
            }
            _ => {}
        }
        info!(
            stale,
            current = ?current,
            state = %inner.state,
            "Current generation was removed by another instance"
        );
        inner.current = current.clone();
        Ok(current)
    }

    /// Identities stored in the current generation.
    pub async fn keys(&self) -> Result<Vec<RequestIdentity>> {
        let Some(generation) = self.current().await else {
            return Ok(Vec::new());
        };
        let mut keys = run_blocking(&self.store, move |s| s.keys(&generation)).await?;
        keys.sort();
        Ok(keys)
    }

    // ==================== Transitions ====================

    /// Fetch every asset and store it in the staging generation.
    ///
    /// All-or-nothing: the first asset that cannot be fetched (after
    /// `retry.max_attempts` tries) aborts the install, the staging partition
    /// is removed, and the current generation is left untouched.
    pub async fn install(
        &self,
        fetcher: &dyn Fetcher,
        assets: &[Url],
        retry: &RetryConfig,
        timeout: Duration,
    ) -> Result<usize> {
        {
            let mut inner = self.inner.write().await;
            if inner.state == GenerationState::Installing {
                return Err(SwError::InvalidState(format!("{} is already installing", self.label)));
            }
            inner.state = GenerationState::Installing;
        }

        let staging = self.staging_name();
        info!(generation = %staging, assets = assets.len(), "Installing generation");

        match self.populate(&staging, fetcher, assets, retry, timeout).await {
            Ok(count) => {
                self.inner.write().await.state = GenerationState::Waiting;
                info!(generation = %staging, count, "Generation installed");
                Ok(count)
            }
            Err(e) => {
                self.inner.write().await.state = GenerationState::Retired;
                let name = staging.clone();
                if let Err(cleanup) = run_blocking(&self.store, move |s| s.delete_generation(&name)).await {
                    warn!(generation = %staging, error = %cleanup, "Failed to remove aborted install");
                }
                warn!(generation = %staging, error = %e, "Install aborted");
                Err(e)
            }
        }
    }

    async fn populate(
        &self,
        staging: &str,
        fetcher: &dyn Fetcher,
        assets: &[Url],
        retry: &RetryConfig,
        timeout: Duration,
    ) -> Result<usize> {
        let name = staging.to_string();
        run_blocking(&self.store, move |s| {
            s.delete_generation(&name)?;
            s.create_generation(&name)
        })
        .await?;

        let fetches = assets.iter().map(|url| async move {
            fetch_asset(fetcher, url, retry, timeout)
                .await
                .map(|response| (url, response))
                .map_err(|reason| SwError::InstallAborted {
                    generation: staging.to_string(),
                    url: url.to_string(),
                    reason,
                })
        });
        let responses = try_join_all(fetches).await?;

        let entries: Vec<(RequestIdentity, StoredResponse)> = responses
            .iter()
            .map(|(url, response)| (RequestIdentity::new("GET", url), StoredResponse::from_response(response)))
            .collect();
        let count = entries.len();
        let name = staging.to_string();
        run_blocking(&self.store, move |s| {
            entries.iter().try_for_each(|(identity, snapshot)| s.put(&name, identity, snapshot))
        })
        .await
        .map_err(SwError::StoreWriteFailed)?;

        Ok(count)
    }

    /// Promote the waiting generation and delete every other one.
    ///
    /// Returns the names that were deleted.
    pub async fn activate(&self) -> Result<Vec<String>> {
        let mut inner = self.inner.write().await;
        if inner.state != GenerationState::Waiting {
            return Err(SwError::InvalidState(format!(
                "cannot activate {} while {}",
                self.label, inner.state
            )));
        }

        let staging = self.staging_name();
        let label = self.label.clone();
        let retired = run_blocking(&self.store, move |s| s.promote_generation(&staging, &label)).await?;

        inner.state = GenerationState::Active;
        inner.current = Some(self.label.clone());
        info!(generation = %self.label, ?retired, "Generation activated");
        Ok(retired)
    }

    /// Names of every generation in storage.
    pub async fn list_generations(&self) -> Result<BTreeSet<String>> {
        Ok(run_blocking(&self.store, |s| s.list_generations()).await?)
    }

    /// Delete one generation. Deleting a missing generation is a no-op.
    pub async fn delete_generation(&self, name: &str) -> Result<bool> {
        let name = name.to_string();
        Ok(run_blocking(&self.store, move |s| s.delete_generation(&name)).await?)
    }

    /// Delete every generation, active and waiting alike.
    ///
    /// If this build is active its own generation is recreated empty, so
    /// later writes from any instance repopulate it. Returns the names that
    /// were deleted.
    pub async fn clear_all(&self) -> Result<Vec<String>> {
        let recreate = (self.state().await == GenerationState::Active).then(|| self.label.clone());
        let names = run_blocking(&self.store, move |s| {
            let names: Vec<String> = s.list_generations()?.into_iter().collect();
            for name in &names {
                s.delete_generation(name)?;
            }
            if let Some(label) = recreate {
                s.create_generation(&label)?;
            }
            Ok(names)
        })
        .await?;
        info!(deleted = ?names, "Cleared all generations");
        Ok(names)
    }

    /// Name, size and role of every stored generation.
    pub async fn describe(&self) -> Result<Vec<GenerationInfo>> {
        let current = self.current().await;
        let infos = run_blocking(&self.store, move |s| {
            s.list_generations()?
                .into_iter()
                .map(|name| {
                    Ok(GenerationInfo {
                        entries: s.entry_count(&name)?,
                        current: current.as_deref() == Some(name.as_str()),
                        staging: name.ends_with(STAGING_SUFFIX),
                        name,
                    })
                })
                .collect::<std::result::Result<Vec<_>, StoreError>>()
        })
        .await?;
        Ok(infos)
    }
}

impl fmt::Debug for GenerationManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenerationManager").field("label", &self.label).finish()
    }
}

/// Fetch one pre-cache asset, retrying per `retry`. Errors are reported as
/// a reason string for [`SwError::InstallAborted`].
async fn fetch_asset(
    fetcher: &dyn Fetcher,
    url: &Url,
    retry: &RetryConfig,
    timeout: Duration,
) -> std::result::Result<Response, String> {
    retry_with_backoff(retry, |attempt| async move {
        debug!(url = %url, attempt, "Fetching pre-cache asset");
        let request = Request::get(url.clone());
        let response = with_timeout(timeout, fetcher.fetch(&request))
            .await
            .map_err(|e| e.to_string())?
            .map_err(|e| e.to_string())?;
        if !response.ok() && !response.is_opaque() {
            return Err(format!("HTTP {}", response.status));
        }
        Ok(response)
    })
    .await
}
