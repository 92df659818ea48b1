//! IAM Bridge Configuration
//!
//! TOML configuration with environment variable overrides. The mirrored
//! authentication path needs the `[iam]` key pair and `[directory] root_dn`;
//! when those are missing the process keeps running with only native
//! authentication (see [`AppConfig::mirror_settings`]).

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

mod loader;

pub use loader::{ConfigLoader, WELL_KNOWN_CONFIG_PATH};

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("No configuration file found")]
    NotFound,

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Root application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub iam: IamConfig,
    pub directory: DirectoryConfig,
    pub sync: SyncConfig,
    pub auth: AuthConfig,
    pub state: StateConfig,
    pub http: HttpConfig,
}

/// Credentials the bridge uses to list the IAM provider
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IamConfig {
    pub access_key: String,
    pub secret_key: String,
    pub region: String,
}

impl Default for IamConfig {
    fn default() -> Self {
        Self {
            access_key: String::new(),
            secret_key: String::new(),
            region: "us-east-1".to_string(),
        }
    }
}

impl std::fmt::Debug for IamConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IamConfig")
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .field("region", &self.region)
            .finish()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    /// Root path under which the users, groups and roles containers live
    pub root_dn: String,
}

/// Poll cycle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub enabled: bool,
    /// Poll period in seconds
    pub poll_period_secs: u64,
    /// Delay before the first cycle in seconds
    pub initial_delay_secs: u64,
    /// Clear the mirrored subtrees on the first cycle recorded by the state store
    pub clear_on_first_sync: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_period_secs: 600,
            initial_delay_secs: 10,
            clear_on_first_sync: true,
        }
    }
}

impl SyncConfig {
    pub fn poll_period(&self) -> Duration {
        Duration::from_secs(self.poll_period_secs)
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_secs(self.initial_delay_secs)
    }
}

/// Bind authentication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Upper bound for one credential validation call in milliseconds
    pub validator_timeout_ms: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            validator_timeout_ms: 5000,
        }
    }
}

impl AuthConfig {
    pub fn validator_timeout(&self) -> Duration {
        Duration::from_millis(self.validator_timeout_ms)
    }
}

/// Durable state (identifier allocations, sync flags)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    pub database_url: String,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://./data/iam-bridge.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

/// Validated settings required by the mirrored path.
#[derive(Clone)]
pub struct MirrorSettings {
    pub access_key: String,
    pub secret_key: String,
    pub region: String,
    pub root_dn: String,
}

impl std::fmt::Debug for MirrorSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MirrorSettings")
            .field("access_key", &self.access_key)
            .field("region", &self.region)
            .field("root_dn", &self.root_dn)
            .finish_non_exhaustive()
    }
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Extract the mirrored-path settings, failing when any of them is blank.
    pub fn mirror_settings(&self) -> Result<MirrorSettings, ConfigError> {
        let required = [
            ("iam.access_key", &self.iam.access_key),
            ("iam.secret_key", &self.iam.secret_key),
            ("directory.root_dn", &self.directory.root_dn),
        ];
        let missing: Vec<&str> = required
            .iter()
            .filter(|(_, v)| v.trim().is_empty())
            .map(|(k, _)| *k)
            .collect();
        if !missing.is_empty() {
            return Err(ConfigError::ValidationError(format!(
                "missing {}",
                missing.join(", ")
            )));
        }
        if self.sync.poll_period_secs == 0 {
            return Err(ConfigError::ValidationError(
                "sync.poll_period_secs must be greater than zero".to_string(),
            ));
        }

        Ok(MirrorSettings {
            access_key: self.iam.access_key.trim().to_string(),
            secret_key: self.iam.secret_key.clone(),
            region: self.iam.region.clone(),
            root_dn: self.directory.root_dn.trim().to_string(),
        })
    }

    /// Generate an example TOML configuration
    pub fn example_toml() -> String {
        r#"# IAM Bridge Configuration
# Environment variables (IAM_BRIDGE_*) override these settings

[iam]
access_key = ""
secret_key = ""
region = "us-east-1"

[directory]
root_dn = "dc=iam,dc=example,dc=com"

[sync]
enabled = true
poll_period_secs = 600
initial_delay_secs = 10
clear_on_first_sync = true

[auth]
validator_timeout_ms = 5000

[state]
database_url = "sqlite://./data/iam-bridge.db"

[http]
host = "0.0.0.0"
port = 8080
"#
        .to_string()
    }
}
