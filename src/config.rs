use crate::error::{KagiError, Result};
use crate::locking::registry::LockRegistry;
use crate::locking::timeout::{LeaseTimeoutResolution, LeaseTimeoutResolver, LeaseTimeoutValue};
use crate::store::SqliteLeaseStore;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const CONFIG_FILE_NAME: &str = "config.toml";
const DEFAULT_LEASE_TTL_MS: u64 = 60_000;
const DEFAULT_RENEW_INTERVAL_MS: u64 = 20_000;
const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 600;
const DEFAULT_DB_FILE: &str = "kagi.db";

/// Environment variable overriding the configured acquire timeout.
pub const ACQUIRE_TIMEOUT_ENV: &str = "KAGI_LOCK_TIMEOUT";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct KagiConfig {
    #[serde(default)]
    pub locking: LockingConfig,

    #[serde(default)]
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockingConfig {
    #[serde(default = "default_lease_ttl_ms")]
    pub lease_ttl_ms: u64,

    #[serde(default = "default_renew_interval_ms")]
    pub renew_interval_ms: u64,

    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,

    /// Identifies this process at the store. Generated when absent.
    #[serde(default)]
    pub owner_token: Option<String>,
}

impl Default for LockingConfig {
    fn default() -> Self {
        Self {
            lease_ttl_ms: DEFAULT_LEASE_TTL_MS,
            renew_interval_ms: DEFAULT_RENEW_INTERVAL_MS,
            acquire_timeout_secs: DEFAULT_ACQUIRE_TIMEOUT_SECS,
            owner_token: None,
        }
    }
}

impl LockingConfig {
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms)
    }

    pub fn renew_interval(&self) -> Duration {
        Duration::from_millis(self.renew_interval_ms)
    }

    /// Rejects unusable values. A renew interval at or above the ttl is
    /// accepted but logged: leases may then expire between renewals and be
    /// taken over while the holder still believes it owns the lock.
    pub fn validate(&self) -> Result<()> {
        if self.lease_ttl_ms == 0 {
            return Err(KagiError::InvalidConfig(
                "lease_ttl_ms must be greater than zero".to_string(),
            ));
        }
        if self.renew_interval_ms == 0 {
            return Err(KagiError::InvalidConfig(
                "renew_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.renew_interval_ms >= self.lease_ttl_ms {
            let interval = self.renew_interval_ms;
            let ttl = self.lease_ttl_ms;
            log::warn!(
                "renew_interval_ms ({interval}) is not below lease_ttl_ms ({ttl}); \
                 held leases may expire between renewals"
            );
        }
        Ok(())
    }

    /// Effective acquire timeout, resolved with environment > config >
    /// default precedence.
    pub fn acquire_timeout(&self) -> Result<LeaseTimeoutResolution> {
        let env_value = std::env::var(ACQUIRE_TIMEOUT_ENV).ok();
        LeaseTimeoutResolver::new(
            env_value.as_deref(),
            LeaseTimeoutValue::from_secs(self.acquire_timeout_secs),
            LeaseTimeoutValue::from_secs(DEFAULT_ACQUIRE_TIMEOUT_SECS),
        )
        .resolve()
        .map_err(|err| KagiError::InvalidConfig(err.to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Database file name, relative to the kagi home directory.
    #[serde(default = "default_db_file")]
    pub db_file: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_file: DEFAULT_DB_FILE.to_string(),
        }
    }
}

fn default_lease_ttl_ms() -> u64 {
    DEFAULT_LEASE_TTL_MS
}

fn default_renew_interval_ms() -> u64 {
    DEFAULT_RENEW_INTERVAL_MS
}

fn default_acquire_timeout_secs() -> u64 {
    DEFAULT_ACQUIRE_TIMEOUT_SECS
}

fn default_db_file() -> String {
    DEFAULT_DB_FILE.to_string()
}

impl KagiConfig {
    pub fn load(kagi_home: &Path) -> Result<Self> {
        let config_path = kagi_home.join(CONFIG_FILE_NAME);

        if !config_path.exists() {
            log::debug!("Config file not found at {config_path:?}, using defaults");
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(&config_path)?;
        let config: KagiConfig = toml::from_str(&contents)
            .map_err(|e| KagiError::ConfigFile(format!("Failed to parse config.toml: {e}")))?;

        log::debug!("Loaded config from {config_path:?}");
        Ok(config)
    }

    pub fn save(&self, kagi_home: &Path) -> Result<()> {
        let config_path = kagi_home.join(CONFIG_FILE_NAME);

        // Ensure parent directory exists
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)
            .map_err(|e| KagiError::ConfigFile(format!("Failed to serialize config: {e}")))?;

        fs::write(&config_path, contents)?;
        log::debug!("Saved config to {config_path:?}");
        Ok(())
    }

    /// Opens the configured sqlite store under `kagi_home` and builds a
    /// registry from it.
    pub fn open_registry(&self, kagi_home: &Path) -> Result<LockRegistry> {
        fs::create_dir_all(kagi_home)?;
        let store = SqliteLeaseStore::open(&kagi_home.join(&self.store.db_file))?;
        LockRegistry::new(Arc::new(store), &self.locking)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locking::timeout::LeaseTimeoutSource;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = KagiConfig::default();
        assert_eq!(config.locking.lease_ttl_ms, DEFAULT_LEASE_TTL_MS);
        assert_eq!(config.locking.renew_interval_ms, DEFAULT_RENEW_INTERVAL_MS);
        assert_eq!(config.locking.owner_token, None);
        assert_eq!(config.store.db_file, DEFAULT_DB_FILE);
    }

    #[test]
    fn test_load_missing_config() {
        let temp_dir = TempDir::new().unwrap();
        let config = KagiConfig::load(temp_dir.path()).unwrap();
        assert_eq!(config.locking.lease_ttl_ms, DEFAULT_LEASE_TTL_MS);
    }

    #[test]
    fn test_save_and_load_config() {
        let temp_dir = TempDir::new().unwrap();

        let mut config = KagiConfig::default();
        config.locking.lease_ttl_ms = 30_000;
        config.locking.owner_token = Some("worker-7".to_string());

        config.save(temp_dir.path()).unwrap();

        let loaded = KagiConfig::load(temp_dir.path()).unwrap();
        assert_eq!(loaded.locking.lease_ttl_ms, 30_000);
        assert_eq!(loaded.locking.owner_token, Some("worker-7".to_string()));
    }

    #[test]
    fn test_partial_config() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join(CONFIG_FILE_NAME);

        fs::write(
            &config_path,
            r#"
[locking]
renew_interval_ms = 5000
"#,
        )
        .unwrap();

        let loaded = KagiConfig::load(temp_dir.path()).unwrap();
        assert_eq!(loaded.locking.renew_interval_ms, 5000);
        assert_eq!(loaded.locking.lease_ttl_ms, DEFAULT_LEASE_TTL_MS);
        assert_eq!(loaded.store.db_file, DEFAULT_DB_FILE);
    }

    #[test]
    fn validate_rejects_zero_ttl() {
        let config = LockingConfig {
            lease_ttl_ms: 0,
            ..LockingConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(KagiError::InvalidConfig(_))
        ));
    }

    #[test]
    fn validate_accepts_renew_interval_above_ttl() {
        // Accepted trade-off: the lease may be taken over between renewals.
        let config = LockingConfig {
            lease_ttl_ms: 100,
            renew_interval_ms: 1000,
            ..LockingConfig::default()
        };
        config.validate().unwrap();
    }

    #[test]
    #[serial]
    fn acquire_timeout_prefers_environment() {
        // SAFETY: serialized test, no concurrent env access.
        unsafe { std::env::set_var(ACQUIRE_TIMEOUT_ENV, "7") };
        let config = LockingConfig::default();
        let resolution = config.acquire_timeout().unwrap();
        unsafe { std::env::remove_var(ACQUIRE_TIMEOUT_ENV) };

        assert_eq!(resolution.source, LeaseTimeoutSource::Environment);
        assert_eq!(resolution.value, LeaseTimeoutValue::from_secs(7));
    }

    #[test]
    #[serial]
    fn acquire_timeout_falls_back_to_config() {
        unsafe { std::env::remove_var(ACQUIRE_TIMEOUT_ENV) };
        let config = LockingConfig {
            acquire_timeout_secs: 42,
            ..LockingConfig::default()
        };
        let resolution = config.acquire_timeout().unwrap();
        assert_eq!(resolution.source, LeaseTimeoutSource::Config);
        assert_eq!(resolution.value, LeaseTimeoutValue::from_secs(42));
    }

    #[test]
    fn open_registry_builds_sqlite_backed_registry() {
        let temp_dir = TempDir::new().unwrap();
        let config = KagiConfig::default();
        let registry = config.open_registry(temp_dir.path()).unwrap();
        let handle = registry.get_lock("trace-1");
        handle.acquire().unwrap();
        handle.release().unwrap();
    }
}
