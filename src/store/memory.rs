use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{Mutex, MutexGuard, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::limits::MAX_QUOTAS_PER_TENANT;
use crate::model::*;

use super::{ConditionalWrite, QuotaStore, SharedQuota, StoreError};

/// Quota records and ledger held in memory.
///
/// Each quota sits behind its own lock; the ledger maps are only written while
/// the owning quota's write lock is held, so a reader holding the quota's read
/// lock sees `reserved` and the ledger in agreement.
pub struct InMemoryStore {
    quotas: DashMap<Ulid, SharedQuota>,
    /// Allocation id → allocation.
    ledger: DashMap<Ulid, Allocation>,
    /// Quota id → its allocation ids in commit order.
    by_quota: DashMap<Ulid, Vec<Ulid>>,
    max_quotas: usize,
    /// Serializes creations so the quota ceiling is exact.
    creating: Mutex<()>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Apply a quota-level event to its record (no locking — caller holds the lock).
fn apply_to_quota(quota: &mut Quota, event: &Event) {
    match event {
        Event::QuotaRevised { params, version, .. } => {
            quota.params = params.clone();
            quota.version = *version;
        }
        Event::QuotaAllocated { allocation, version } => {
            quota.reserved += allocation.quantity;
            quota.version = *version;
        }
        // Creation is handled at the map level, not here
        Event::QuotaCreated { .. } => {}
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            quotas: DashMap::new(),
            ledger: DashMap::new(),
            by_quota: DashMap::new(),
            max_quotas: MAX_QUOTAS_PER_TENANT,
            creating: Mutex::new(()),
        }
    }

    pub fn with_max_quotas(mut self, max_quotas: usize) -> Self {
        self.max_quotas = max_quotas;
        self
    }

    /// Rebuild state from a replayed log. Events for unknown quotas are skipped.
    pub fn from_events(events: Vec<Event>) -> Self {
        let mut quotas: HashMap<Ulid, Quota> = HashMap::new();
        let store = Self::new();
        for event in events {
            match event {
                Event::QuotaCreated { id, params, version } => {
                    quotas.insert(id, Quota::new(id, params, version));
                }
                other => {
                    let quota_id = other.quota_id();
                    let Some(quota) = quotas.get_mut(&quota_id) else {
                        tracing::warn!("replay: event for unknown quota {quota_id} skipped");
                        continue;
                    };
                    apply_to_quota(quota, &other);
                    if let Event::QuotaAllocated { allocation, .. } = other {
                        store.record(allocation);
                    }
                }
            }
        }
        for (id, quota) in quotas {
            store.quotas.insert(id, Arc::new(RwLock::new(quota)));
        }
        store
    }

    pub fn get_quota(&self, id: &Ulid) -> Option<SharedQuota> {
        self.quotas.get(id).map(|e| e.value().clone())
    }

    pub fn contains_quota(&self, id: &Ulid) -> bool {
        self.quotas.contains_key(id)
    }

    /// Hold the creation lock and check `id` may still be created.
    /// The returned guard must live until the quota is installed.
    pub(crate) async fn reserve_slot(&self, id: Ulid) -> Result<MutexGuard<'_, ()>, StoreError> {
        let guard = self.creating.lock().await;
        if self.contains_quota(&id) {
            return Err(StoreError::AlreadyExists(id));
        }
        if self.quotas.len() >= self.max_quotas {
            return Err(StoreError::LimitReached(self.max_quotas));
        }
        Ok(guard)
    }

    pub(crate) fn install(&self, quota: Quota) {
        self.quotas.insert(quota.id, Arc::new(RwLock::new(quota)));
    }

    /// Take the quota's write lock and check it is still at `expected`.
    pub(crate) async fn lock_expected(
        &self,
        quota_id: Ulid,
        expected: VersionToken,
    ) -> Result<OwnedRwLockWriteGuard<Quota>, StoreError> {
        let quota = self
            .get_quota(&quota_id)
            .ok_or(StoreError::NotFound(quota_id))?;
        let guard = quota.write_owned().await;
        if guard.version != expected {
            return Err(StoreError::VersionMismatch {
                quota_id,
                expected,
                actual: guard.version,
            });
        }
        Ok(guard)
    }

    /// Apply a committed event to a locked quota and, for allocations, the ledger.
    pub(crate) fn apply(&self, quota: &mut Quota, event: Event) {
        apply_to_quota(quota, &event);
        if let Event::QuotaAllocated { allocation, .. } = event {
            self.record(allocation);
        }
    }

    fn record(&self, allocation: Allocation) {
        self.by_quota
            .entry(allocation.quota_id)
            .or_default()
            .push(allocation.id);
        self.ledger.insert(allocation.id, allocation);
    }

    /// Ledger entries of a quota, in commit order. Caller holds the quota's lock.
    pub(crate) fn ledger_of(&self, quota_id: &Ulid) -> Vec<Allocation> {
        let Some(ids) = self.by_quota.get(quota_id) else {
            return Vec::new();
        };
        ids.iter()
            .filter_map(|id| self.ledger.get(id).map(|a| a.value().clone()))
            .collect()
    }
}

#[async_trait]
impl QuotaStore for InMemoryStore {
    async fn load(&self, id: Ulid) -> Option<Quota> {
        let quota = self.get_quota(&id)?;
        let guard = quota.read().await;
        Some((*guard).clone())
    }

    async fn load_with_ledger(&self, id: Ulid) -> Option<(Quota, Vec<Allocation>)> {
        let quota = self.get_quota(&id)?;
        let guard = quota.read().await;
        Some(((*guard).clone(), self.ledger_of(&id)))
    }

    async fn get_allocation(&self, id: Ulid) -> Option<Allocation> {
        self.ledger.get(&id).map(|a| a.value().clone())
    }

    fn quota_ids(&self) -> Vec<Ulid> {
        self.quotas.iter().map(|e| *e.key()).collect()
    }

    fn quota_count(&self) -> usize {
        self.quotas.len()
    }

    async fn insert(&self, id: Ulid, params: QuotaParams) -> Result<Quota, StoreError> {
        let _slot = self.reserve_slot(id).await?;
        let quota = Quota::new(id, params, VersionToken::fresh());
        self.install(quota.clone());
        Ok(quota)
    }

    async fn commit(&self, write: ConditionalWrite) -> Result<Quota, StoreError> {
        let mut guard = self.lock_expected(write.quota_id, write.expected).await?;
        let event = write.into_event(VersionToken::fresh());
        self.apply(&mut guard, event);
        Ok((*guard).clone())
    }
}
