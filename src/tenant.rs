use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::info;

use crate::compactor;
use crate::engine::Engine;
use crate::limits::*;
use crate::model::SlotConfig;
use crate::notify::NotifyHub;
use crate::observability;

/// One engine, WAL file and compactor per tenant. The tenant is the
/// database name of the pgwire connection.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    slot_config: SlotConfig,
}

fn is_file_safe(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

/// WAL file name for a tenant, distinct for distinct tenants. Names made of
/// file-safe characters are used as is; anything else is hex-encoded under a
/// `.hex` suffix, which a plain name cannot produce since it has no dot.
fn wal_file_name(tenant: &str) -> String {
    if tenant.chars().all(is_file_safe) {
        return format!("{tenant}.wal");
    }
    let hex: String = tenant.bytes().map(|b| format!("{b:02x}")).collect();
    format!("{hex}.hex.wal")
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64, slot_config: SlotConfig) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
            slot_config,
        }
    }

    /// Get or lazily create the engine for `tenant`. Must be called inside a
    /// tokio runtime.
    pub fn get_or_create(&self, tenant: &str) -> io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(tenant) {
            return Ok(engine.value().clone());
        }
        if tenant.len() > MAX_TENANT_NAME_LEN {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "tenant name too long"));
        }
        if tenant.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty tenant name"));
        }

        if self.engines.len() >= MAX_TENANTS {
            return Err(io::Error::other("too many tenants"));
        }

        // The shard lock held by the entry keeps two connections from
        // opening the same WAL twice.
        let engine = match self.engines.entry(tenant.to_string()) {
            Entry::Occupied(existing) => return Ok(existing.get().clone()),
            Entry::Vacant(slot) => {
                let wal_path = self.data_dir.join(wal_file_name(tenant));
                let notify = Arc::new(NotifyHub::new());
                let engine = Arc::new(Engine::new(wal_path, notify, self.slot_config)?);
                tokio::spawn(compactor::run_compactor(engine.clone(), self.compact_threshold));
                slot.insert(engine.clone());
                engine
            }
        };

        metrics::gauge!(observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        info!(tenant, "tenant loaded");
        Ok(engine)
    }

    pub fn tenant_count(&self) -> usize {
        self.engines.len()
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::{NaiveDate, Weekday};
    use ulid::Ulid;

    use super::*;
    use crate::model::*;

    fn test_data_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("easyslot_test_tenant").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn manager(name: &str) -> (TenantManager, PathBuf) {
        let dir = test_data_dir(name);
        (TenantManager::new(dir.clone(), 1000, SlotConfig::default()), dir)
    }

    #[tokio::test]
    async fn tenants_are_isolated() {
        let (tm, _) = manager("isolation");
        let clinic_a = tm.get_or_create("clinic_a").unwrap();
        let clinic_b = tm.get_or_create("clinic_b").unwrap();

        let pid = Ulid::new();
        clinic_a.create_provider(pid, None).await.unwrap();
        clinic_b.create_provider(pid, None).await.unwrap();
        clinic_a
            .set_working_plan(
                pid,
                WorkingPlan::default().with_day(Weekday::Mon, WorkingPlanDay::open(540, 600)),
            )
            .await
            .unwrap();

        let monday = NaiveDate::from_ymd_opt(2024, 3, 4).unwrap();
        assert_eq!(clinic_a.compute_slots(pid, monday, 60, None).await.unwrap().len(), 1);
        assert!(clinic_b.compute_slots(pid, monday, 60, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn wal_file_created_lazily() {
        let (tm, dir) = manager("lazy");
        assert_eq!(fs::read_dir(&dir).unwrap().count(), 0);
        tm.get_or_create("my_db").unwrap();
        assert!(dir.join("my_db.wal").exists());
    }

    #[tokio::test]
    async fn same_engine_returned() {
        let (tm, _) = manager("same_engine");
        let first = tm.get_or_create("foo").unwrap();
        let second = tm.get_or_create("foo").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(tm.tenant_count(), 1);
    }

    #[tokio::test]
    async fn unsafe_tenant_name_stays_in_data_dir() {
        let (tm, dir) = manager("sanitize");
        tm.get_or_create("../evil").unwrap();
        assert!(dir.join("2e2e2f6576696c.hex.wal").exists());
        assert!(!dir.join("evil.wal").exists());
        assert!(tm.get_or_create("").is_err());
    }

    #[test]
    fn wal_file_names_are_distinct() {
        let names = ["clinica", "clinic.a", "clinic/a", "636c696e696361", "636c696e696361.hex"];
        let mut files: Vec<_> = names.iter().map(|n| wal_file_name(n)).collect();
        files.sort();
        files.dedup();
        assert_eq!(files.len(), names.len());
    }

    #[tokio::test]
    async fn names_differing_in_unsafe_characters_stay_isolated() {
        let dir = test_data_dir("unsafe_collision");
        {
            let tm = TenantManager::new(dir.clone(), 1000, SlotConfig::default());
            let dotted = tm.get_or_create("clinic.a").unwrap();
            let plain = tm.get_or_create("clinica").unwrap();
            dotted.create_provider(Ulid::new(), None).await.unwrap();
            plain.create_provider(Ulid::new(), None).await.unwrap();
        }
        assert_eq!(fs::read_dir(&dir).unwrap().count(), 2);

        let tm = TenantManager::new(dir, 1000, SlotConfig::default());
        assert_eq!(tm.get_or_create("clinica").unwrap().list_providers().await.len(), 1);
        assert_eq!(tm.get_or_create("clinic.a").unwrap().list_providers().await.len(), 1);
    }

    #[tokio::test]
    async fn tenant_name_too_long() {
        let (tm, _) = manager("name_too_long");
        let Err(err) = tm.get_or_create(&"x".repeat(MAX_TENANT_NAME_LEN + 1)) else {
            panic!("overlong tenant name accepted");
        };
        assert!(err.to_string().contains("tenant name too long"));
    }

    #[tokio::test]
    async fn state_survives_reload() {
        let dir = test_data_dir("reload");
        let pid = Ulid::new();
        let date = NaiveDate::from_ymd_opt(2024, 3, 4).unwrap();
        {
            let tm = TenantManager::new(dir.clone(), 1000, SlotConfig::default());
            let engine = tm.get_or_create("clinic").unwrap();
            engine.create_provider(pid, Some("Dr. Ames".into())).await.unwrap();
            engine
                .upsert_override(DateSpecificOverride {
                    provider_id: pid,
                    date,
                    start: 600,
                    end: 720,
                })
                .await
                .unwrap();
        }

        let tm = TenantManager::new(dir, 1000, SlotConfig::default());
        let engine = tm.get_or_create("clinic").unwrap();
        let overrides = engine.list_overrides(pid).await;
        assert_eq!(overrides.len(), 1);
        assert_eq!((overrides[0].start, overrides[0].end), (600, 720));
    }
}
