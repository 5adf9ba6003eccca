use crate::engine::{EngineError, ErrorClass};

// ── Allocation metrics ──────────────────────────────────────────

/// Counter: allocation attempts. Labels: outcome.
pub const ALLOCATIONS_TOTAL: &str = "quotad_allocations_total";

/// Histogram: allocate latency in seconds, read through commit.
pub const ALLOCATION_DURATION_SECONDS: &str = "quotad_allocation_duration_seconds";

/// Counter: units granted across all quotas.
pub const UNITS_ALLOCATED_TOTAL: &str = "quotad_units_allocated_total";

/// Counter: administrative quota edits. Labels: outcome.
pub const QUOTA_UPDATES_TOTAL: &str = "quotad_quota_updates_total";

// ── Storage metrics ─────────────────────────────────────────────

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "quotad_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "quotad_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "quotad_wal_flush_batch_size";

/// Counter: completed WAL compactions.
pub const WAL_COMPACTIONS_TOTAL: &str = "quotad_wal_compactions_total";

/// Map an operation result to a short label for metrics.
pub fn outcome_label<T>(result: &Result<T, EngineError>) -> &'static str {
    let Err(e) = result else { return "ok" };
    match e.class() {
        ErrorClass::Input => "invalid",
        ErrorClass::NotFound => "not_found",
        ErrorClass::Capacity if matches!(e, EngineError::InvalidCapacity { .. }) => "invalid_capacity",
        ErrorClass::Capacity => "overbooking_rejected",
        ErrorClass::Conflict => "conflict",
        ErrorClass::Storage => "storage_error",
    }
}
