//! Lifecycle controller and connected instances.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hashbrown::HashMap;
use serde_json::Value;
use swcache_common::RetryConfig;
use swcache_net::Fetcher;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::CacheConfig;
use crate::error::{Result, SwError};
use crate::generation::GenerationManager;
use crate::message::{ControlMessage, OutboundMessage};

// ==================== Clients ====================

/// Identifier of a connected application instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

impl ClientId {
    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// What the registry knows about an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub id: ClientId,
    pub url: Url,
    /// Generation controlling this instance, once claimed.
    pub controller: Option<String>,
}

struct ClientEntry {
    info: ClientInfo,
    tx: mpsc::UnboundedSender<OutboundMessage>,
}

/// The set of connected application instances.
///
/// Delivery is best-effort: a message to an instance whose receiver is gone
/// is dropped and the instance is forgotten.
#[derive(Default)]
pub struct ClientRegistry {
    clients: RwLock<HashMap<ClientId, ClientEntry>>,
    next_id: AtomicU64,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an instance and return its inbox.
    pub async fn connect(&self, url: Url) -> (ClientId, mpsc::UnboundedReceiver<OutboundMessage>) {
        let id = ClientId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let (tx, rx) = mpsc::unbounded_channel();
        debug!(client = id.raw(), url = %url, "Client connected");
        self.clients.write().await.insert(
            id,
            ClientEntry {
                info: ClientInfo {
                    id,
                    url,
                    controller: None,
                },
                tx,
            },
        );
        (id, rx)
    }

    pub async fn disconnect(&self, id: ClientId) -> bool {
        self.clients.write().await.remove(&id).is_some()
    }

    pub async fn get(&self, id: ClientId) -> Option<ClientInfo> {
        self.clients.read().await.get(&id).map(|entry| entry.info.clone())
    }

    /// Every connected instance, ordered by id.
    pub async fn match_all(&self) -> Vec<ClientInfo> {
        let mut all: Vec<ClientInfo> = self.clients.read().await.values().map(|e| e.info.clone()).collect();
        all.sort_by_key(|info| info.id);
        all
    }

    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Put every instance under `generation`. Returns how many were claimed.
    pub async fn claim(&self, generation: &str) -> usize {
        let mut clients = self.clients.write().await;
        for entry in clients.values_mut() {
            entry.info.controller = Some(generation.to_string());
        }
        clients.len()
    }

    /// Send to every instance. Returns how many received it.
    pub async fn broadcast(&self, message: &OutboundMessage) -> usize {
        self.send_where(message, |_| true).await
    }

    /// Send to every instance except `sender`.
    pub async fn broadcast_except(&self, sender: ClientId, message: &OutboundMessage) -> usize {
        self.send_where(message, |id| id != sender).await
    }

    async fn send_where(&self, message: &OutboundMessage, include: impl Fn(ClientId) -> bool) -> usize {
        let mut clients = self.clients.write().await;
        let mut delivered = 0;
        let mut gone = Vec::new();

        for (id, entry) in clients.iter() {
            if !include(*id) {
                continue;
            }
            if entry.tx.send(message.clone()).is_ok() {
                delivered += 1;
            } else {
                gone.push(*id);
            }
        }

        for id in gone {
            warn!(client = id.raw(), kind = message.kind(), "Client went away; message dropped");
            clients.remove(&id);
        }
        delivered
    }
}

// ==================== Controller ====================

/// Result of a completed activation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Activation {
    pub generation: String,
    /// Generations deleted by the activation.
    pub retired: Vec<String>,
    /// Instances taken over.
    pub claimed: usize,
    /// Instances that received the takeover notification.
    pub notified: usize,
}

/// What handling a control message did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOutcome {
    /// A waiting generation was promoted.
    Activated(Activation),
    /// Nothing was waiting.
    NothingWaiting,
    /// Every generation was deleted.
    Cleared(Vec<String>),
    /// Notification relayed to this many instances.
    Relayed(usize),
    /// Message had no `type`.
    Ignored,
}

/// Drives install and activation and handles control messages.
pub struct LifecycleController {
    manager: Arc<GenerationManager>,
    clients: Arc<ClientRegistry>,
    fetcher: Arc<dyn Fetcher>,
    precache: Vec<Url>,
    skip_waiting: bool,
    retry: RetryConfig,
    timeout: Duration,
}

impl LifecycleController {
    pub fn new(
        config: &CacheConfig,
        manager: Arc<GenerationManager>,
        clients: Arc<ClientRegistry>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<Self> {
        Ok(Self {
            manager,
            clients,
            fetcher,
            precache: config.precache_urls()?,
            skip_waiting: config.skip_waiting,
            retry: config.retry_config(),
            timeout: config.fetch_timeout(),
        })
    }

    pub fn clients(&self) -> &Arc<ClientRegistry> {
        &self.clients
    }

    /// Install this build's generation from the pre-cache list.
    ///
    /// With `skip_waiting` the generation is activated right away and the
    /// activation is returned.
    pub async fn install(&self) -> Result<Option<Activation>> {
        self.manager
            .install(self.fetcher.as_ref(), &self.precache, &self.retry, self.timeout)
            .await?;

        if self.skip_waiting {
            debug!(generation = %self.manager.label(), "Skipping wait");
            return self.activate().await.map(Some);
        }
        Ok(None)
    }

    /// Activate the waiting generation, take over every instance and tell
    /// each of them.
    pub async fn activate(&self) -> Result<Activation> {
        let retired = self.manager.activate().await?;
        let generation = self.manager.label().to_string();

        let claimed = self.clients.claim(&generation).await;
        let notified = self
            .clients
            .broadcast(&OutboundMessage::TakeoverOccurred {
                generation: generation.clone(),
            })
            .await;

        info!(%generation, claimed, notified, "Takeover complete");
        Ok(Activation {
            generation,
            retired,
            claimed,
            notified,
        })
    }

    /// Handle a message sent by instance `from`.
    pub async fn handle_message(&self, from: ClientId, message: &Value) -> Result<MessageOutcome> {
        let Some(control) = ControlMessage::parse(message) else {
            debug!(client = from.raw(), "Ignoring message without type");
            return Ok(MessageOutcome::Ignored);
        };

        match control {
            // Activation checks the state under the manager's lock, so of two
            // racing requests exactly one activates.
            ControlMessage::AdvanceToNewGeneration => match self.activate().await {
                Ok(activation) => Ok(MessageOutcome::Activated(activation)),
                Err(SwError::InvalidState(reason)) => {
                    debug!(client = from.raw(), %reason, "Advance requested but nothing is waiting");
                    Ok(MessageOutcome::NothingWaiting)
                }
                Err(e) => Err(e),
            },
            ControlMessage::ClearAllGenerations => Ok(MessageOutcome::Cleared(self.manager.clear_all().await?)),
            ControlMessage::Notify { kind, payload } => {
                let relayed = self
                    .clients
                    .broadcast_except(from, &OutboundMessage::Relay(payload))
                    .await;
                debug!(client = from.raw(), %kind, relayed, "Relayed notification");
                Ok(MessageOutcome::Relayed(relayed))
            }
        }
    }
}
