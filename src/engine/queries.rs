use ulid::Ulid;

use crate::model::*;
use crate::store::QuotaStore;

use super::policy::bound_holds;
use super::{Engine, EngineError};

impl<S: QuotaStore> Engine<S> {
    /// Read-only projection of a quota's latest committed state.
    pub async fn get_quota(&self, quota_id: Ulid) -> Result<QuotaView, EngineError> {
        self.store
            .load(quota_id)
            .await
            .map(|q| QuotaView::from(&q))
            .ok_or(EngineError::QuotaNotFound(quota_id))
    }

    /// Quotas matching `filter`, ordered by travel date, then name.
    pub async fn list_quotas(&self, filter: &QuotaFilter) -> Vec<QuotaView> {
        let mut views = Vec::new();
        for id in self.store.quota_ids() {
            if let Some(quota) = self.store.load(id).await
                && filter.matches(&quota.params)
            {
                views.push(QuotaView::from(&quota));
            }
        }
        views.sort_by(|a, b| {
            a.travel_date
                .cmp(&b.travel_date)
                .then_with(|| a.name.cmp(&b.name))
                .then_with(|| a.id.cmp(&b.id))
        });
        views
    }

    /// Ledger entries of a quota, in commit order.
    pub async fn list_allocations(&self, quota_id: Ulid) -> Result<Vec<Allocation>, EngineError> {
        self.store
            .load_with_ledger(quota_id)
            .await
            .map(|(_, ledger)| ledger)
            .ok_or(EngineError::QuotaNotFound(quota_id))
    }

    pub async fn get_allocation(&self, allocation_id: Ulid) -> Result<Allocation, EngineError> {
        self.store
            .get_allocation(allocation_id)
            .await
            .ok_or(EngineError::AllocationNotFound(allocation_id))
    }

    /// Check every quota against its bound and its ledger.
    pub async fn audit(&self) -> Vec<AuditFinding> {
        let mut findings = Vec::new();
        let mut ids = self.store.quota_ids();
        ids.sort();
        for id in ids {
            let Some((quota, ledger)) = self.store.load_with_ledger(id).await else {
                continue;
            };
            let ledger_total: u64 = ledger.iter().map(|a| a.quantity as u64).sum();
            if ledger_total != quota.reserved as u64 {
                findings.push(AuditFinding::LedgerMismatch {
                    quota_id: id,
                    reserved: quota.reserved,
                    ledger_total,
                });
            }
            if !bound_holds(&quota.params, quota.reserved) {
                findings.push(AuditFinding::OverBound {
                    quota_id: id,
                    reserved: quota.reserved,
                    bound: quota.params.bound(),
                });
            }
        }
        findings
    }
}
