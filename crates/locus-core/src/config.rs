//! Configuration system for Locus.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $LOCUS_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/locus/config.toml
//!   3. ~/.config/locus/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LocusConfig {
    pub resolution: ResolutionConfig,
    pub registry: RegistryConfig,
    pub cache: CacheConfig,
    pub trust: TrustConfig,
    pub directory: DirectoryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolutionConfig {
    /// How many times a coalesced waiter re-arms before giving up.
    pub wait_attempts: u32,
    /// Length of each wait, in milliseconds.
    pub wait_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// How long one attempt at the exclusive map lock may wait, in milliseconds.
    pub lock_attempt_ms: u64,
    /// Restarts after contention before falling back to a blocking acquire.
    pub max_contention_retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Unattached remote service references kept alive. 0 = unbounded.
    pub max_service_references: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustConfig {
    /// If true, only explicitly trusted endpoints pass the access policy.
    pub require_trust: bool,
    /// Endpoint addresses to trust immediately.
    pub trusted: Vec<String>,
    /// Endpoint addresses to deny.
    pub blocked: Vec<String>,
    /// Where runtime trust changes are persisted. Unset = memory only.
    pub persist_path: Option<PathBuf>,
}

/// Static endpoint table served by `locusd`'s built-in directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    pub endpoints: Vec<DirectoryEntry>,
    /// Endpoint addresses `locusd` resolves on startup.
    pub watch: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryEntry {
    /// Endpoint address token (usually urn:uuid:...).
    pub address: String,
    /// Transport URIs the endpoint resolves to.
    pub transports: Vec<String>,
    /// Capabilities reported in its metadata.
    pub capabilities: Vec<String>,
    /// Hosted services (device entries only): endpoint address tokens.
    pub hosted: Vec<String>,
    /// Metadata version.
    pub version: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for ResolutionConfig {
    fn default() -> Self {
        Self {
            wait_attempts: 10,
            wait_interval_ms: 1_000,
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            lock_attempt_ms: 50,
            max_contention_retries: 16,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_service_references: 256,
        }
    }
}

impl ResolutionConfig {
    pub fn wait_interval(&self) -> Duration {
        Duration::from_millis(self.wait_interval_ms)
    }
}

impl RegistryConfig {
    pub fn lock_attempt(&self) -> Duration {
        Duration::from_millis(self.lock_attempt_ms)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("locus")
}

pub fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("locus")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl LocusConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::file_path())
    }

    /// Load from an explicit path, falling back to defaults if it is absent.
    pub fn load_from(path: &std::path::Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(path)
                .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?
        } else {
            LocusConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("LOCUS_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&LocusConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply LOCUS_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Some(v) = env_parse("LOCUS_RESOLUTION__WAIT_ATTEMPTS") {
            self.resolution.wait_attempts = v;
        }
        if let Some(v) = env_parse("LOCUS_RESOLUTION__WAIT_INTERVAL_MS") {
            self.resolution.wait_interval_ms = v;
        }
        if let Some(v) = env_parse("LOCUS_REGISTRY__LOCK_ATTEMPT_MS") {
            self.registry.lock_attempt_ms = v;
        }
        if let Some(v) = env_parse("LOCUS_REGISTRY__MAX_CONTENTION_RETRIES") {
            self.registry.max_contention_retries = v;
        }
        if let Some(v) = env_parse("LOCUS_CACHE__MAX_SERVICE_REFERENCES") {
            self.cache.max_service_references = v;
        }
        if let Ok(v) = std::env::var("LOCUS_TRUST__REQUIRE_TRUST") {
            self.trust.require_trust = v == "true" || v == "1";
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}
