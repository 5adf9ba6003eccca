use ulid::Ulid;

use crate::model::VersionToken;
use crate::store::StoreError;

#[derive(Debug)]
pub enum EngineError {
    /// Requested quantity was zero.
    InvalidQuantity,
    QuotaNotFound(Ulid),
    AllocationNotFound(Ulid),
    AlreadyExists(Ulid),
    OverbookingRejected {
        quota_id: Ulid,
        requested: u32,
        available: u32,
    },
    /// The quota changed between read and conditional write (or the caller's
    /// token is stale). Re-read and resubmit.
    ConcurrencyConflict {
        quota_id: Ulid,
        expected: VersionToken,
        actual: VersionToken,
    },
    /// An administrative edit would leave `reserved` above the new bound.
    InvalidCapacity {
        quota_id: Ulid,
        reserved: u32,
        bound: u64,
    },
    LimitExceeded(&'static str),
    StorageError(String),
}

/// Errors grouped by what the caller can do about them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Malformed request; fix it before sending again.
    Input,
    /// Identity does not resolve.
    NotFound,
    /// Does not fit the quota as it stands.
    Capacity,
    /// Lost an optimistic race; a fresh attempt may succeed.
    Conflict,
    Storage,
}

impl EngineError {
    pub fn class(&self) -> ErrorClass {
        match self {
            EngineError::InvalidQuantity
            | EngineError::AlreadyExists(_)
            | EngineError::LimitExceeded(_) => ErrorClass::Input,
            EngineError::QuotaNotFound(_) | EngineError::AllocationNotFound(_) => {
                ErrorClass::NotFound
            }
            EngineError::OverbookingRejected { .. } | EngineError::InvalidCapacity { .. } => {
                ErrorClass::Capacity
            }
            EngineError::ConcurrencyConflict { .. } => ErrorClass::Conflict,
            EngineError::StorageError(_) => ErrorClass::Storage,
        }
    }

    /// True only for conflicts: resubmitting unchanged can succeed.
    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Conflict
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidQuantity => write!(f, "quantity must be positive"),
            EngineError::QuotaNotFound(id) => write!(f, "quota not found: {id}"),
            EngineError::AllocationNotFound(id) => write!(f, "allocation not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::OverbookingRejected {
                quota_id,
                requested,
                available,
            } => write!(
                f,
                "overbooking rejected on quota {quota_id}: requested {requested}, available {available}"
            ),
            EngineError::ConcurrencyConflict {
                quota_id,
                expected,
                actual,
            } => write!(
                f,
                "concurrency conflict on quota {quota_id}: expected version {expected}, found {actual}"
            ),
            EngineError::InvalidCapacity {
                quota_id,
                reserved,
                bound,
            } => write!(
                f,
                "invalid capacity for quota {quota_id}: {reserved} units reserved exceed new bound {bound}"
            ),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::StorageError(e) => write!(f, "storage error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => EngineError::QuotaNotFound(id),
            StoreError::AlreadyExists(id) => EngineError::AlreadyExists(id),
            StoreError::VersionMismatch {
                quota_id,
                expected,
                actual,
            } => EngineError::ConcurrencyConflict {
                quota_id,
                expected,
                actual,
            },
            StoreError::LimitReached(_) => EngineError::LimitExceeded("too many quotas"),
            StoreError::WalError(e) => EngineError::StorageError(e),
        }
    }
}
