use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds.
pub type Ms = i64;

/// Opaque marker replaced on every committed mutation of a quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionToken(Ulid);

impl VersionToken {
    pub fn fresh() -> Self {
        Self(Ulid::new())
    }
}

impl std::fmt::Display for VersionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Administrative attributes of a quota: everything except `reserved` and the version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaParams {
    pub name: String,
    pub product_type: String,
    pub travel_date: NaiveDate,
    /// Guaranteed sellable units.
    pub capacity: u32,
    /// Extra units sellable beyond `capacity` at the operator's risk.
    pub overbooking_limit: u32,
}

impl QuotaParams {
    /// Highest value `reserved` may ever take.
    pub fn bound(&self) -> u64 {
        self.capacity as u64 + self.overbooking_limit as u64
    }
}

/// Committed state of one quota record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Quota {
    pub id: Ulid,
    pub params: QuotaParams,
    /// Units currently granted. Always equals the sum of the quota's ledger quantities.
    pub reserved: u32,
    pub version: VersionToken,
}

impl Quota {
    pub fn new(id: Ulid, params: QuotaParams, version: VersionToken) -> Self {
        Self {
            id,
            params,
            reserved: 0,
            version,
        }
    }

    pub fn available(&self) -> u32 {
        crate::engine::headroom(self.params.capacity, self.params.overbooking_limit, self.reserved)
    }
}

/// One granted claim against a quota. Never mutated after commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub id: Ulid,
    pub quota_id: Ulid,
    /// Opaque booking-side identifier; absent for provisional or administrative holds.
    pub reservation_ref: Option<String>,
    pub quantity: u32,
    pub assigned_at: Ms,
}

/// The event types — flat, no nesting. This is the WAL record format.
///
/// `QuotaAllocated` carries both the ledger entry and the quota's new version,
/// so one record is one atomic commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    QuotaCreated {
        id: Ulid,
        params: QuotaParams,
        version: VersionToken,
    },
    QuotaRevised {
        id: Ulid,
        params: QuotaParams,
        version: VersionToken,
    },
    QuotaAllocated {
        allocation: Allocation,
        version: VersionToken,
    },
}

impl Event {
    pub fn quota_id(&self) -> Ulid {
        match self {
            Event::QuotaCreated { id, .. } | Event::QuotaRevised { id, .. } => *id,
            Event::QuotaAllocated { allocation, .. } => allocation.quota_id,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

/// Read-only projection of a quota, including its remaining headroom.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuotaView {
    pub id: Ulid,
    pub name: String,
    pub product_type: String,
    pub travel_date: NaiveDate,
    pub capacity: u32,
    pub overbooking_limit: u32,
    pub reserved: u32,
    pub available: u32,
    pub version: VersionToken,
}

impl From<&Quota> for QuotaView {
    fn from(q: &Quota) -> Self {
        Self {
            id: q.id,
            name: q.params.name.clone(),
            product_type: q.params.product_type.clone(),
            travel_date: q.params.travel_date,
            capacity: q.params.capacity,
            overbooking_limit: q.params.overbooking_limit,
            reserved: q.reserved,
            available: q.available(),
            version: q.version,
        }
    }
}

/// Narrows `list_quotas`. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuotaFilter {
    pub product_type: Option<String>,
    pub travel_date: Option<NaiveDate>,
}

impl QuotaFilter {
    pub fn matches(&self, params: &QuotaParams) -> bool {
        self.product_type
            .as_ref()
            .is_none_or(|p| *p == params.product_type)
            && self.travel_date.is_none_or(|d| d == params.travel_date)
    }
}

/// A committed state that breaks one of the ledger invariants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditFinding {
    LedgerMismatch {
        quota_id: Ulid,
        reserved: u32,
        ledger_total: u64,
    },
    OverBound {
        quota_id: Ulid,
        reserved: u32,
        bound: u64,
    },
}
