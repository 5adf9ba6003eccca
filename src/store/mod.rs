//! Quota record store and allocation ledger.
//!
//! The engine only needs three primitives from persistence: a snapshot read
//! that includes the version token, an insert for new quotas, and a
//! conditional write that applies a change only if the version is unchanged.
//! A ledger insert always travels inside a conditional write, so the quota
//! mutation and its allocation record commit together or not at all.

mod durable;
mod memory;

pub use durable::WalStore;
pub use memory::InMemoryStore;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::model::*;

pub type SharedQuota = Arc<RwLock<Quota>>;

/// What a conditional write does to the quota once its version matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    /// Add `allocation.quantity` to `reserved` and append the allocation to the ledger.
    Allocate(Allocation),
    /// Replace the administrative attributes.
    Revise(QuotaParams),
}

/// Compare-and-swap request against one quota record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionalWrite {
    pub quota_id: Ulid,
    pub expected: VersionToken,
    pub change: Change,
}

impl ConditionalWrite {
    /// The log record this write commits as, stamped with the quota's next version.
    pub(crate) fn into_event(self, version: VersionToken) -> Event {
        match self.change {
            Change::Allocate(allocation) => Event::QuotaAllocated { allocation, version },
            Change::Revise(params) => Event::QuotaRevised {
                id: self.quota_id,
                params,
                version,
            },
        }
    }
}

#[derive(Debug)]
pub enum StoreError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// The record changed since the caller read it.
    VersionMismatch {
        quota_id: Ulid,
        expected: VersionToken,
        actual: VersionToken,
    },
    /// The store already holds its maximum number of quotas.
    LimitReached(usize),
    WalError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::NotFound(id) => write!(f, "quota not found: {id}"),
            StoreError::AlreadyExists(id) => write!(f, "quota already exists: {id}"),
            StoreError::VersionMismatch {
                quota_id,
                expected,
                actual,
            } => write!(
                f,
                "quota {quota_id} is at version {actual}, expected {expected}"
            ),
            StoreError::LimitReached(max) => write!(f, "quota limit of {max} reached"),
            StoreError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

#[async_trait]
pub trait QuotaStore: Send + Sync {
    /// Committed state of a quota, version included.
    async fn load(&self, id: Ulid) -> Option<Quota>;

    /// A quota and its ledger entries in commit order, read under one lock.
    async fn load_with_ledger(&self, id: Ulid) -> Option<(Quota, Vec<Allocation>)>;

    async fn get_allocation(&self, id: Ulid) -> Option<Allocation>;

    fn quota_ids(&self) -> Vec<Ulid>;

    fn quota_count(&self) -> usize;

    /// Create a quota with `reserved = 0` and a fresh version. Refused once
    /// the store holds its maximum number of quotas.
    async fn insert(&self, id: Ulid, params: QuotaParams) -> Result<Quota, StoreError>;

    /// Apply `write.change` iff the quota is still at `write.expected`.
    /// Returns the new committed state.
    async fn commit(&self, write: ConditionalWrite) -> Result<Quota, StoreError>;
}
