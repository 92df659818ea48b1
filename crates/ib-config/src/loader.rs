//! Configuration loader with file and environment variable support

use crate::{AppConfig, ConfigError};
use std::env;
use std::path::PathBuf;
use tracing::info;

/// Fixed location operators install the bridge configuration at
pub const WELL_KNOWN_CONFIG_PATH: &str = "/etc/iam-bridge/config.toml";

/// Search order after the explicit path and `IAM_BRIDGE_CONFIG`
const CONFIG_PATHS: &[&str] = &[
    WELL_KNOWN_CONFIG_PATH,
    "iam-bridge.toml",
    "./config/iam-bridge.toml",
];

/// Configuration loader
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
    apply_env: bool,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None, apply_env: true }
    }

    /// Create a loader with a specific config file path
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self { config_path: Some(path.into()), apply_env: true }
    }

    /// Skip environment overrides (tests)
    pub fn without_env(mut self) -> Self {
        self.apply_env = false;
        self
    }

    /// Load configuration from the first file found, then apply environment
    /// overrides. A missing file is `ConfigError::NotFound`.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let path = self.find_config_file().ok_or(ConfigError::NotFound)?;
        info!(?path, "Loading configuration from file");
        let mut config = AppConfig::from_file(&path)?;

        if self.apply_env {
            apply_env_overrides(&mut config);
        }
        Ok(config)
    }

    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config_path {
            // An explicit path that does not exist is not silently replaced
            return path.exists().then(|| path.clone());
        }

        if let Ok(path) = env::var("IAM_BRIDGE_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        CONFIG_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|path| path.exists())
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn apply_env_overrides(config: &mut AppConfig) {
    // IAM
    if let Ok(val) = env::var("IAM_BRIDGE_ACCESS_KEY") {
        config.iam.access_key = val;
    }
    if let Ok(val) = env::var("IAM_BRIDGE_SECRET_KEY") {
        config.iam.secret_key = val;
    }
    if let Ok(val) = env::var("IAM_BRIDGE_REGION") {
        config.iam.region = val;
    }

    // Directory
    if let Ok(val) = env::var("IAM_BRIDGE_ROOT_DN") {
        config.directory.root_dn = val;
    }

    // Sync
    if let Ok(val) = env::var("IAM_BRIDGE_SYNC_ENABLED") {
        config.sync.enabled = val.parse().unwrap_or(true);
    }
    if let Ok(val) = env::var("IAM_BRIDGE_POLL_PERIOD_SECS") {
        if let Ok(period) = val.parse() {
            config.sync.poll_period_secs = period;
        }
    }
    if let Ok(val) = env::var("IAM_BRIDGE_CLEAR_ON_FIRST_SYNC") {
        config.sync.clear_on_first_sync = val.parse().unwrap_or(true);
    }

    // Auth
    if let Ok(val) = env::var("IAM_BRIDGE_VALIDATOR_TIMEOUT_MS") {
        if let Ok(timeout) = val.parse() {
            config.auth.validator_timeout_ms = timeout;
        }
    }

    // State
    if let Ok(val) = env::var("IAM_BRIDGE_DATABASE_URL") {
        config.state.database_url = val;
    }

    // HTTP
    if let Ok(val) = env::var("IAM_BRIDGE_HTTP_PORT") {
        if let Ok(port) = val.parse() {
            config.http.port = port;
        }
    }
}
