use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{DuosyncError, Result};
use crate::retry::RetryPolicy;
use crate::sync::ConflictPolicyKind;

/// Configuration for both stores and the sync engine
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DuosyncConfig {
    pub local: LocalConfig,
    pub cloud: CloudConfig,
    pub retry: RetryPolicy,
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    /// SQLite database file; `${HOME}` and a leading `~` are expanded
    pub path: PathBuf,
    pub pool_size: usize,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            path: config_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("local.db"),
            pool_size: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudConfig {
    /// `postgres://` URL; the cloud replica is disabled when absent
    pub url: Option<String>,
    /// Access token, applied as the connection password
    pub token: Option<String>,
    pub pool_size: usize,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            url: None,
            token: None,
            pool_size: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Tables to reconcile; empty means every table seen in the local change log
    pub tracked_tables: Vec<String>,
    pub interval_secs: u64,
    pub conflict_policy: ConflictPolicyKind,
    /// Timestamps closer than this are treated as concurrent
    pub clock_skew_tolerance_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            tracked_tables: Vec::new(),
            interval_secs: 300,
            conflict_policy: ConflictPolicyKind::default(),
            clock_skew_tolerance_ms: 0,
        }
    }
}

impl SyncConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn clock_skew_tolerance(&self) -> Duration {
        Duration::from_millis(self.clock_skew_tolerance_ms)
    }
}

/// Get the duosync config directory path (~/.duosync)
pub fn config_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".duosync"))
}

/// Load environment variables from .env files.
///
/// `./.env` is read first, then `~/.duosync/.env`; dotenvy never overwrites
/// a variable that is already set, so the process environment wins.
pub fn load_dotenv() -> Vec<PathBuf> {
    let mut loaded_from = Vec::new();

    if let Ok(path) = dotenvy::dotenv() {
        debug!("Loaded .env from current directory: {}", path.display());
        loaded_from.push(path);
    }

    if let Some(env_file) = config_dir().map(|dir| dir.join(".env")) {
        if env_file.exists() {
            match dotenvy::from_path(&env_file) {
                Ok(()) => {
                    debug!("Loaded .env from ~/.duosync: {}", env_file.display());
                    loaded_from.push(env_file);
                }
                Err(e) => debug!("Failed to load {}: {}", env_file.display(), e),
            }
        }
    }

    loaded_from
}

impl DuosyncConfig {
    /// Get config file path: ~/.duosync/config.toml
    pub fn config_path() -> PathBuf {
        config_dir()
            .unwrap_or_else(|| PathBuf::from(".duosync"))
            .join("config.toml")
    }

    /// Load `~/.duosync/config.toml` (defaults when absent), then apply
    /// `DUOSYNC_*` environment overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = fs::read_to_string(path).map_err(|e| {
                DuosyncError::config(format!("failed to read {}: {}", path.display(), e))
            })?;
            info!("Loaded configuration from {}", path.display());
            Self::from_toml_str(&content)?
        } else {
            debug!("No config file at {}, using defaults", path.display());
            Self::default()
        };

        config.apply_overrides(|key| env::var(key).ok())?;
        config.expand_variables();
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| DuosyncError::config(format!("invalid TOML: {}", e)))
    }

    /// Apply `DUOSYNC_*` overrides from `lookup` (the process environment in production)
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let parse_size = |key: &str, raw: String| -> Result<usize> {
            raw.trim()
                .parse()
                .map_err(|_| DuosyncError::config(format!("{} must be a positive integer, got '{}'", key, raw)))
        };

        if let Some(path) = lookup("DUOSYNC_LOCAL_PATH") {
            self.local.path = PathBuf::from(path);
        }
        if let Some(raw) = lookup("DUOSYNC_LOCAL_POOL_SIZE") {
            self.local.pool_size = parse_size("DUOSYNC_LOCAL_POOL_SIZE", raw)?;
        }
        if let Some(url) = lookup("DUOSYNC_CLOUD_URL") {
            self.cloud.url = Some(url).filter(|u| !u.is_empty());
        }
        if let Some(token) = lookup("DUOSYNC_CLOUD_TOKEN") {
            self.cloud.token = Some(token).filter(|t| !t.is_empty());
        }
        if let Some(raw) = lookup("DUOSYNC_CLOUD_POOL_SIZE") {
            self.cloud.pool_size = parse_size("DUOSYNC_CLOUD_POOL_SIZE", raw)?;
        }
        if let Some(tables) = lookup("DUOSYNC_TRACKED_TABLES") {
            self.sync.tracked_tables = tables
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect();
        }

        Ok(())
    }

    /// Expand `${HOME}` and a leading `~` in the local path
    fn expand_variables(&mut self) {
        let mut vars = HashMap::new();
        if let Some(home) = dirs::home_dir() {
            vars.insert("HOME".to_string(), home.display().to_string());
        }

        let mut path = Self::expand_string(&self.local.path.display().to_string(), &vars);
        if let (Some(rest), Some(home)) = (path.strip_prefix("~/"), vars.get("HOME")) {
            path = format!("{}/{}", home, rest);
        }
        self.local.path = PathBuf::from(path);
    }

    fn expand_string(s: &str, vars: &HashMap<String, String>) -> String {
        let mut result = s.to_string();
        for (key, value) in vars {
            result = result.replace(&format!("${{{}}}", key), value);
        }
        result
    }

    pub fn has_cloud(&self) -> bool {
        self.cloud.url.is_some()
    }

    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.local.pool_size == 0 {
            errors.push("local.pool_size must be at least 1".to_string());
        }
        if self.local.path.as_os_str().is_empty() {
            errors.push("local.path must not be empty".to_string());
        }
        if self.cloud.pool_size == 0 {
            errors.push("cloud.pool_size must be at least 1".to_string());
        }
        if let Some(url) = &self.cloud.url {
            if !(url.starts_with("postgres://") || url.starts_with("postgresql://")) {
                errors.push("cloud.url must start with postgres:// or postgresql://".to_string());
            }
        }
        if self.retry.max_attempts == 0 {
            errors.push("retry.max_attempts must be at least 1".to_string());
        }
        if self.retry.initial_delay > self.retry.max_delay {
            errors.push("retry.initial_delay must not exceed retry.max_delay".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(DuosyncError::config(errors.join("; ")))
        }
    }

    /// Same config with the token masked, for display
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if copy.cloud.token.is_some() {
            copy.cloud.token = Some("********".to_string());
        }
        copy
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| DuosyncError::config(format!("failed to serialize config: {}", e)))
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_toml()?)?;
        Ok(())
    }
}
