//! In-memory response store.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use hashbrown::HashMap;
use tracing::{debug, trace};

use crate::{RequestIdentity, ResponseStore, StoreError, StoredResponse};

/// One generation's entries.
#[derive(Debug, Default)]
struct Partition {
    /// Creation sequence number; orders generations by age.
    created: u64,
    entries: HashMap<RequestIdentity, StoredResponse>,
}

impl Partition {
    fn new(created: u64) -> Self {
        Self {
            created,
            entries: HashMap::new(),
        }
    }

    fn size_bytes(&self) -> usize {
        self.entries.values().map(StoredResponse::size_bytes).sum()
    }
}

/// A [`ResponseStore`] that lives as long as the process.
///
/// An optional byte quota makes writes fail the way a full disk would.
#[derive(Debug, Default)]
pub struct MemoryStore {
    partitions: RwLock<HashMap<String, Partition>>,
    sequence: AtomicU64,
    quota_bytes: Option<usize>,
}

impl MemoryStore {
    /// Create an unbounded store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that rejects writes once `quota_bytes` would be exceeded.
    pub fn with_quota(quota_bytes: usize) -> Self {
        Self {
            partitions: RwLock::new(HashMap::new()),
            sequence: AtomicU64::new(0),
            quota_bytes: Some(quota_bytes),
        }
    }

    /// Total bytes held across all generations.
    pub fn size_bytes(&self) -> Result<usize, StoreError> {
        Ok(self.read()?.values().map(Partition::size_bytes).sum())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<String, Partition>>, StoreError> {
        self.partitions.read().map_err(|_| StoreError::Poisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<String, Partition>>, StoreError> {
        self.partitions.write().map_err(|_| StoreError::Poisoned)
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }
}

impl ResponseStore for MemoryStore {
    fn get(&self, generation: &str, identity: &RequestIdentity) -> Result<Option<StoredResponse>, StoreError> {
        let partitions = self.read()?;
        Ok(partitions
            .get(generation)
            .and_then(|p| p.entries.get(identity))
            .cloned())
    }

    fn put(&self, generation: &str, identity: &RequestIdentity, response: &StoredResponse) -> Result<(), StoreError> {
        let mut partitions = self.write()?;
        if !partitions.contains_key(generation) {
            return Err(StoreError::UnknownGeneration(generation.to_string()));
        }

        if let Some(quota) = self.quota_bytes {
            let used: usize = partitions.values().map(Partition::size_bytes).sum();
            let replaced = partitions
                .get(generation)
                .and_then(|p| p.entries.get(identity))
                .map_or(0, StoredResponse::size_bytes);
            let needed = used - replaced + response.size_bytes();
            if needed > quota {
                return Err(StoreError::QuotaExceeded(format!(
                    "{} needs {} bytes, quota is {}",
                    identity, needed, quota
                )));
            }
        }

        if let Some(partition) = partitions.get_mut(generation) {
            partition.entries.insert(identity.clone(), response.clone());
        }
        trace!(generation, %identity, "Stored response");
        Ok(())
    }

    fn create_generation(&self, name: &str) -> Result<(), StoreError> {
        let mut partitions = self.write()?;
        if !partitions.contains_key(name) {
            partitions.insert(name.to_string(), Partition::new(self.next_sequence()));
        }
        Ok(())
    }

    fn delete_generation(&self, name: &str) -> Result<bool, StoreError> {
        let existed = self.write()?.remove(name).is_some();
        if existed {
            debug!(generation = name, "Deleted generation");
        }
        Ok(existed)
    }

    fn list_generations(&self) -> Result<BTreeSet<String>, StoreError> {
        Ok(self.read()?.keys().cloned().collect())
    }

    fn generations_by_age(&self) -> Result<Vec<String>, StoreError> {
        let partitions = self.read()?;
        let mut named: Vec<(u64, &String)> = partitions.iter().map(|(name, p)| (p.created, name)).collect();
        named.sort();
        Ok(named.into_iter().map(|(_, name)| name.clone()).collect())
    }

    fn keys(&self, generation: &str) -> Result<Vec<RequestIdentity>, StoreError> {
        Ok(self
            .read()?
            .get(generation)
            .map(|p| p.entries.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn entry_count(&self, generation: &str) -> Result<usize, StoreError> {
        Ok(self.read()?.get(generation).map_or(0, |p| p.entries.len()))
    }

    fn promote_generation(&self, from: &str, to: &str) -> Result<Vec<String>, StoreError> {
        let mut partitions = self.write()?;

        let source = match partitions.remove(from) {
            Some(source) => source,
            None => Partition::new(self.next_sequence()),
        };
        let mut retired: Vec<String> = partitions.drain().map(|(name, _)| name).collect();
        retired.sort();
        partitions.insert(to.to_string(), source);

        debug!(from, to, ?retired, "Promoted generation");
        Ok(retired)
    }
}
