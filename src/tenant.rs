use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::clock::{Clock, SystemClock};
use crate::compactor;
use crate::engine::{DEFAULT_LOCK_TIMEOUT, Engine};
use crate::limits::*;

#[derive(Debug)]
pub enum TenantError {
    InvalidName(&'static str),
    TooManyTenants,
    /// No business has been onboarded under this slug.
    UnknownBusiness(String),
    Io(io::Error),
}

impl std::fmt::Display for TenantError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TenantError::InvalidName(why) => write!(f, "invalid business slug: {why}"),
            TenantError::TooManyTenants => write!(f, "too many businesses loaded"),
            TenantError::UnknownBusiness(slug) => write!(f, "business '{slug}' does not exist"),
            TenantError::Io(e) => write!(f, "business store error: {e}"),
        }
    }
}

impl std::error::Error for TenantError {}

impl From<io::Error> for TenantError {
    fn from(e: io::Error) -> Self {
        TenantError::Io(e)
    }
}

/// Per-business engines. Each business gets its own Engine + WAL + compactor,
/// keyed by the database name of the pgwire connection.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    lock_timeout: Duration,
    max_tenants: usize,
    clock: Arc<dyn Clock>,
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            max_tenants: MAX_TENANTS,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Each loaded business holds one open WAL file.
    pub fn with_max_tenants(mut self, max: usize) -> Self {
        self.max_tenants = max.min(MAX_TENANTS);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Engine for an onboarded business. Loads it from disk on first use;
    /// a slug with no WAL is `UnknownBusiness`.
    pub fn open_existing(&self, slug: &str) -> Result<Arc<Engine>, TenantError> {
        let safe = validate_slug(slug)?;
        if let Some(engine) = self.engines.get(&safe) {
            return Ok(engine.value().clone());
        }
        if !self.wal_path(&safe).exists() {
            return Err(TenantError::UnknownBusiness(slug.to_string()));
        }
        self.load(safe)
    }

    /// Engine for a business, creating an empty one if needed. Only onboarding
    /// goes through here.
    pub fn get_or_create(&self, slug: &str) -> Result<Arc<Engine>, TenantError> {
        let safe = validate_slug(slug)?;
        if let Some(engine) = self.engines.get(&safe) {
            return Ok(engine.value().clone());
        }
        self.load(safe)
    }

    pub fn loaded(&self) -> usize {
        self.engines.len()
    }

    fn wal_path(&self, safe: &str) -> PathBuf {
        self.data_dir.join(format!("{safe}.wal"))
    }

    fn load(&self, safe: String) -> Result<Arc<Engine>, TenantError> {
        if self.engines.len() >= self.max_tenants {
            return Err(TenantError::TooManyTenants);
        }
        // The entry guard makes two first connections share one engine.
        let engine = match self.engines.entry(safe.clone()) {
            Entry::Occupied(e) => return Ok(e.get().clone()),
            Entry::Vacant(v) => {
                let engine = Arc::new(
                    Engine::new(self.wal_path(&safe), self.clock.clone())?
                        .with_lock_timeout(self.lock_timeout),
                );
                v.insert(engine.clone());
                engine
            }
        };

        tokio::spawn(compactor::run_compactor(
            Arc::downgrade(&engine),
            self.compact_threshold,
        ));
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        tracing::info!("loaded business '{safe}'");
        Ok(engine)
    }
}

/// A slug is `[A-Za-z0-9_-]+`. Anything else is refused rather than
/// rewritten, so distinct slugs always name distinct businesses and none can
/// escape the data directory.
fn validate_slug(slug: &str) -> Result<String, TenantError> {
    if slug.is_empty() {
        return Err(TenantError::InvalidName("empty"));
    }
    if slug.len() > MAX_TENANT_NAME_LEN {
        return Err(TenantError::InvalidName("too long"));
    }
    if !slug
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(TenantError::InvalidName(
            "only letters, digits, '_' and '-' are allowed",
        ));
    }
    Ok(slug.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use std::fs;
    use ulid::Ulid;

    fn test_data_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotd_test_tenant").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn profile(name: &str) -> BusinessProfile {
        BusinessProfile {
            name: name.into(),
            timezone: "America/Sao_Paulo".into(),
            phone: None,
            address: None,
        }
    }

    fn service(id: Ulid) -> Service {
        Service {
            id,
            name: "Corte".into(),
            duration_minutes: 30,
            capacity: 1,
            price_cents: Some(5000),
            requires_payment: false,
            active: true,
        }
    }

    #[tokio::test]
    async fn businesses_are_isolated() {
        let dir = test_data_dir("isolation");
        let tm = TenantManager::new(dir, 1000);

        let a = tm.get_or_create("studio_a").unwrap();
        let b = tm.get_or_create("studio_b").unwrap();
        a.configure_business(profile("A")).await.unwrap();
        b.configure_business(profile("B")).await.unwrap();

        let sid = Ulid::new();
        a.create_service(service(sid)).await.unwrap();

        assert!(a.get_service(sid).await.is_ok());
        assert!(b.get_service(sid).await.is_err());
        assert_eq!(b.business_profile().await.unwrap().name, "B");
    }

    #[tokio::test]
    async fn unknown_business_is_not_created() {
        let dir = test_data_dir("unknown");
        let tm = TenantManager::new(dir.clone(), 1000);

        assert!(matches!(
            tm.open_existing("nobody"),
            Err(TenantError::UnknownBusiness(_))
        ));
        assert!(!dir.join("nobody.wal").exists());
        assert_eq!(tm.loaded(), 0);

        tm.get_or_create("somebody").unwrap();
        assert!(dir.join("somebody.wal").exists());
        assert!(tm.open_existing("somebody").is_ok());
    }

    #[tokio::test]
    async fn existing_wal_is_loaded_on_demand() {
        let dir = test_data_dir("reload");
        {
            let tm = TenantManager::new(dir.clone(), 1000);
            let engine = tm.get_or_create("barbearia").unwrap();
            engine.configure_business(profile("Barbearia do Zé")).await.unwrap();
        }

        let tm = TenantManager::new(dir, 1000);
        let engine = tm.open_existing("barbearia").unwrap();
        assert_eq!(
            engine.business_profile().await.unwrap().name,
            "Barbearia do Zé"
        );
    }

    #[tokio::test]
    async fn same_engine_returned() {
        let dir = test_data_dir("same_eng");
        let tm = TenantManager::new(dir, 1000);

        let first = tm.get_or_create("foo").unwrap();
        let second = tm.get_or_create("foo").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&first, &tm.open_existing("foo").unwrap()));
    }

    #[tokio::test]
    async fn unsafe_slugs_are_rejected() {
        let dir = test_data_dir("slug_charset");
        let tm = TenantManager::new(dir.clone(), 1000);

        tm.get_or_create("studioa").unwrap();
        for slug in ["studio.a", "../evil", "studio a", "estúdio", "../.."] {
            assert!(
                matches!(tm.get_or_create(slug), Err(TenantError::InvalidName(_))),
                "{slug}"
            );
            assert!(
                matches!(tm.open_existing(slug), Err(TenantError::InvalidName(_))),
                "{slug}"
            );
        }
        assert!(matches!(
            tm.open_existing(""),
            Err(TenantError::InvalidName("empty"))
        ));
        assert!(!dir.join("evil.wal").exists());
        assert_eq!(tm.loaded(), 1);

        let dashed = tm.get_or_create("studio-a_2").unwrap();
        assert!(!Arc::ptr_eq(&dashed, &tm.open_existing("studioa").unwrap()));
    }

    #[tokio::test]
    async fn slug_too_long() {
        let dir = test_data_dir("name_too_long");
        let tm = TenantManager::new(dir, 1000);

        let long_name = "x".repeat(MAX_TENANT_NAME_LEN + 1);
        assert!(matches!(
            tm.get_or_create(&long_name),
            Err(TenantError::InvalidName("too long"))
        ));
    }

    #[tokio::test]
    async fn tenant_count_limit() {
        let dir = test_data_dir("count_limit");
        let tm = TenantManager::new(dir, 1000).with_max_tenants(8);

        for i in 0..8 {
            tm.get_or_create(&format!("t{i}")).unwrap();
        }
        assert!(matches!(
            tm.get_or_create("one_more"),
            Err(TenantError::TooManyTenants)
        ));
    }
}
