use std::time::Instant;

use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::{
    outcome_label, ALLOCATIONS_TOTAL, ALLOCATION_DURATION_SECONDS, QUOTA_UPDATES_TOTAL,
    UNITS_ALLOCATED_TOTAL,
};
use crate::store::{Change, ConditionalWrite, QuotaStore};

use super::policy::{admit, bound_holds, Admission};
use super::{Engine, EngineError};

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

pub(crate) fn validate_params(params: &QuotaParams) -> Result<(), EngineError> {
    if params.name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("quota name too long"));
    }
    if params.product_type.len() > MAX_PRODUCT_TYPE_LEN {
        return Err(EngineError::LimitExceeded("product type too long"));
    }
    if params.capacity > MAX_CAPACITY {
        return Err(EngineError::LimitExceeded("capacity too large"));
    }
    if params.overbooking_limit > MAX_CAPACITY {
        return Err(EngineError::LimitExceeded("overbooking limit too large"));
    }
    Ok(())
}

impl<S: QuotaStore> Engine<S> {
    pub async fn create_quota(&self, params: QuotaParams) -> Result<Quota, EngineError> {
        validate_params(&params)?;
        let quota = self.store.insert(Ulid::new(), params).await?;
        tracing::debug!(
            "created quota {} ({}, {}) capacity={} overbooking={}",
            quota.id,
            quota.params.product_type,
            quota.params.travel_date,
            quota.params.capacity,
            quota.params.overbooking_limit
        );
        Ok(quota)
    }

    /// Replace a quota's administrative attributes, guarded by the caller's
    /// last-seen version. Refuses any bound below what is already reserved.
    pub async fn update_quota(
        &self,
        quota_id: Ulid,
        params: QuotaParams,
        expected: VersionToken,
    ) -> Result<Quota, EngineError> {
        let result = self.try_update_quota(quota_id, params, expected).await;
        metrics::counter!(QUOTA_UPDATES_TOTAL, "outcome" => outcome_label(&result)).increment(1);
        result
    }

    async fn try_update_quota(
        &self,
        quota_id: Ulid,
        params: QuotaParams,
        expected: VersionToken,
    ) -> Result<Quota, EngineError> {
        validate_params(&params)?;
        let current = self
            .store
            .load(quota_id)
            .await
            .ok_or(EngineError::QuotaNotFound(quota_id))?;
        if current.version != expected {
            return Err(EngineError::ConcurrencyConflict {
                quota_id,
                expected,
                actual: current.version,
            });
        }
        if !bound_holds(&params, current.reserved) {
            return Err(EngineError::InvalidCapacity {
                quota_id,
                reserved: current.reserved,
                bound: params.bound(),
            });
        }
        let quota = self
            .store
            .commit(ConditionalWrite {
                quota_id,
                expected,
                change: Change::Revise(params),
            })
            .await?;
        tracing::debug!("revised quota {quota_id}: version {}", quota.version);
        Ok(quota)
    }

    /// Claim `quantity` units of a quota.
    ///
    /// One snapshot read, one capacity check, one conditional write. A lost
    /// write race surfaces as `ConcurrencyConflict` and is never retried here.
    pub async fn allocate(
        &self,
        quota_id: Ulid,
        quantity: u32,
        reservation_ref: Option<String>,
    ) -> Result<Allocation, EngineError> {
        let started = Instant::now();
        let result = self.try_allocate(quota_id, quantity, reservation_ref).await;
        metrics::histogram!(ALLOCATION_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
        metrics::counter!(ALLOCATIONS_TOTAL, "outcome" => outcome_label(&result)).increment(1);
        match &result {
            Ok(allocation) => {
                metrics::counter!(UNITS_ALLOCATED_TOTAL).increment(allocation.quantity as u64);
            }
            Err(EngineError::StorageError(e)) => {
                tracing::warn!("allocate on quota {quota_id} failed in storage: {e}");
            }
            Err(_) => {}
        }
        result
    }

    async fn try_allocate(
        &self,
        quota_id: Ulid,
        quantity: u32,
        reservation_ref: Option<String>,
    ) -> Result<Allocation, EngineError> {
        if quantity == 0 {
            return Err(EngineError::InvalidQuantity);
        }
        if let Some(ref r) = reservation_ref
            && r.len() > MAX_RESERVATION_REF_LEN
        {
            return Err(EngineError::LimitExceeded("reservation reference too long"));
        }

        let quota = self
            .store
            .load(quota_id)
            .await
            .ok_or(EngineError::QuotaNotFound(quota_id))?;

        let p = &quota.params;
        if let Admission::Exceeds { available } =
            admit(p.capacity, p.overbooking_limit, quota.reserved, quantity)
        {
            return Err(EngineError::OverbookingRejected {
                quota_id,
                requested: quantity,
                available,
            });
        }

        let allocation = Allocation {
            id: Ulid::new(),
            quota_id,
            reservation_ref,
            quantity,
            assigned_at: now_ms(),
        };
        let committed = self
            .store
            .commit(ConditionalWrite {
                quota_id,
                expected: quota.version,
                change: Change::Allocate(allocation.clone()),
            })
            .await
            .inspect_err(|e| tracing::debug!("allocate on quota {quota_id}: {e}"))?;

        tracing::debug!(
            "granted {quantity} on quota {quota_id} as {} (reserved {}/{})",
            allocation.id,
            committed.reserved,
            committed.params.bound()
        );
        Ok(allocation)
    }
}
