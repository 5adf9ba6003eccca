use std::path::PathBuf;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::info;

use crate::compactor;
use crate::engine::Engine;
use crate::limits::*;
use crate::store::QuotaStore;

/// Manages per-tenant engines. Each tenant (an operator or agency) gets its
/// own Engine + WAL + compactor, so quotas of different tenants never share a log.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
}

/// Strip everything but `[A-Za-z0-9_-]` so a tenant name is a safe file stem.
fn sanitize(tenant: &str) -> String {
    tenant
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect()
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
        }
    }

    /// Get or lazily open the engine for `tenant`, replaying its log on first use.
    pub fn get_or_create(&self, tenant: &str) -> std::io::Result<Arc<Engine>> {
        if tenant.len() > MAX_TENANT_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "tenant name too long",
            ));
        }
        let safe_name = sanitize(tenant);
        if safe_name.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty tenant name",
            ));
        }
        if let Some(engine) = self.engines.get(&safe_name) {
            return Ok(engine.value().clone());
        }
        if self.engines.len() >= MAX_TENANTS {
            return Err(std::io::Error::other("too many tenants"));
        }

        // Entry lock serializes concurrent first opens of the same tenant.
        let vacant = match self.engines.entry(safe_name.clone()) {
            Entry::Occupied(existing) => return Ok(existing.get().clone()),
            Entry::Vacant(vacant) => vacant,
        };

        let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
        let engine = Arc::new(Engine::open(wal_path)?);
        info!(
            "opened tenant {safe_name}: {} quotas",
            engine.store().quota_count()
        );

        let compactor_engine = engine.clone();
        let threshold = self.compact_threshold;
        tokio::spawn(async move {
            compactor::run_compactor(compactor_engine, threshold).await;
        });

        vacant.insert(engine.clone());
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        Ok(engine)
    }

    /// Tenants that already have a log in the data directory, sorted.
    pub fn discover(&self) -> std::io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.data_dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "wal")
                && let Some(stem) = path.file_stem().and_then(|s| s.to_str())
                && sanitize(stem) == stem
            {
                names.push(stem.to_string());
            }
        }
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::QuotaParams;
    use chrono::NaiveDate;
    use std::fs;

    fn test_data_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("quotad_test_tenant").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn params() -> QuotaParams {
        QuotaParams {
            name: "Santorini catamaran".into(),
            product_type: "tour".into(),
            travel_date: NaiveDate::from_ymd_opt(2026, 7, 1).unwrap(),
            capacity: 12,
            overbooking_limit: 1,
        }
    }

    #[tokio::test]
    async fn tenant_isolation() {
        let dir = test_data_dir("isolation");
        let tm = TenantManager::new(dir, 1000);

        let eng_a = tm.get_or_create("agency_a").unwrap();
        let eng_b = tm.get_or_create("agency_b").unwrap();

        let quota = eng_a.create_quota(params()).await.unwrap();
        eng_a.allocate(quota.id, 2, None).await.unwrap();

        assert_eq!(eng_a.get_quota(quota.id).await.unwrap().reserved, 2);
        assert!(eng_b.get_quota(quota.id).await.is_err());
    }

    #[tokio::test]
    async fn tenant_lazy_creation() {
        let dir = test_data_dir("lazy");
        let tm = TenantManager::new(dir.clone(), 1000);

        let entries: Vec<_> = fs::read_dir(&dir).unwrap().collect();
        assert!(entries.is_empty());

        let _eng = tm.get_or_create("my_agency").unwrap();
        assert!(dir.join("my_agency.wal").exists());
    }

    #[tokio::test]
    async fn tenant_same_engine_returned() {
        let dir = test_data_dir("same_eng");
        let tm = TenantManager::new(dir, 1000);

        let eng1 = tm.get_or_create("foo").unwrap();
        let eng2 = tm.get_or_create("foo").unwrap();
        assert!(Arc::ptr_eq(&eng1, &eng2));
    }

    #[tokio::test]
    async fn tenant_name_sanitized() {
        let dir = test_data_dir("sanitize");
        let tm = TenantManager::new(dir.clone(), 1000);

        let evil = tm.get_or_create("../evil").unwrap();
        assert!(dir.join("evil.wal").exists());
        // Same file stem, same engine.
        assert!(Arc::ptr_eq(&evil, &tm.get_or_create("evil").unwrap()));

        let result = tm.get_or_create("../..");
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn tenant_name_too_long() {
        let dir = test_data_dir("name_too_long");
        let tm = TenantManager::new(dir, 1000);

        let long_name = "x".repeat(MAX_TENANT_NAME_LEN + 1);
        let err = tm.get_or_create(&long_name).err().unwrap();
        assert!(err.to_string().contains("tenant name too long"));
    }

    #[tokio::test]
    async fn tenant_reopen_replays_log() {
        let dir = test_data_dir("reopen");
        let quota_id;
        {
            let tm = TenantManager::new(dir.clone(), 1000);
            let engine = tm.get_or_create("acme").unwrap();
            quota_id = engine.create_quota(params()).await.unwrap().id;
            engine.allocate(quota_id, 5, Some("BK-5".into())).await.unwrap();
        }
        let tm = TenantManager::new(dir, 1000);
        let engine = tm.get_or_create("acme").unwrap();
        assert_eq!(engine.get_quota(quota_id).await.unwrap().reserved, 5);
    }

    #[tokio::test]
    async fn discover_lists_existing_logs() {
        let dir = test_data_dir("discover");
        fs::write(dir.join("notes.txt"), b"ignore me").unwrap();
        let tm = TenantManager::new(dir, 1000);
        tm.get_or_create("zeta").unwrap();
        tm.get_or_create("alpha").unwrap();
        assert_eq!(tm.discover().unwrap(), vec!["alpha".to_string(), "zeta".to_string()]);
    }
}
