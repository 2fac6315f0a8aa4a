//! Access policy. Decides whether a matched device or service may be used.
//!
//! Three-tier trust model, keyed by endpoint address:
//! - Blocked:    Access denied, never retried
//! - Untrusted:  Allowed unless `require_trust` is set (default for new endpoints)
//! - Trusted:    Always allowed
//!
//! The check runs after metadata arrives and before it is applied, so a
//! denied endpoint never gets a proxy.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use locus_core::config::TrustConfig;
use locus_core::{EndpointReference, Metadata, ResolveError, SecurityKey};

/// Local policy consulted before metadata from an endpoint is accepted.
pub trait AccessPolicy: Send + Sync {
    fn check(
        &self,
        endpoint: &EndpointReference,
        scope: &SecurityKey,
        metadata: &Metadata,
    ) -> Result<(), ResolveError>;
}

/// Policy that admits everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AccessPolicy for AllowAll {
    fn check(&self, _: &EndpointReference, _: &SecurityKey, _: &Metadata) -> Result<(), ResolveError> {
        Ok(())
    }
}

/// Trust level for an endpoint, keyed by its address.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustLevel {
    /// Endpoint is blocked, deny all access
    Blocked,
    /// Endpoint is unknown, allowed unless trust is required
    #[default]
    Untrusted,
    /// Endpoint is trusted, full access
    Trusted,
}

/// Registry of trusted/blocked endpoints.
///
/// When constructed with a `persist_path`, trust rules are written to disk
/// on every mutation and reloaded on startup. Clones share the same rules.
#[derive(Clone)]
pub struct TrustRegistry {
    rules: Arc<DashMap<String, TrustLevel>>,
    require_trust: Arc<AtomicBool>,
    persist_path: Arc<Option<PathBuf>>,
}

impl Default for TrustRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TrustRegistry {
    pub fn new() -> Self {
        Self {
            rules: Arc::new(DashMap::new()),
            require_trust: Arc::new(AtomicBool::new(false)),
            persist_path: Arc::new(None),
        }
    }

    /// Create a registry that persists rules to `path`, starting from the
    /// rules already stored there. A missing file means no rules yet.
    pub fn with_persistence(path: PathBuf) -> Result<Self, TrustStoreError> {
        let snapshot = read_snapshot(&path)?;
        if !snapshot.is_empty() {
            tracing::info!(count = snapshot.len(), path = %path.display(), "loaded persisted trust rules");
        }
        Ok(Self {
            rules: Arc::new(snapshot.into_iter().collect()),
            require_trust: Arc::new(AtomicBool::new(false)),
            persist_path: Arc::new(Some(path)),
        })
    }

    /// Build from config: persistence, require_trust, and the static lists.
    pub fn from_config(config: &TrustConfig) -> Result<Self, TrustStoreError> {
        let registry = match &config.persist_path {
            Some(path) => Self::with_persistence(path.clone())?,
            None => Self::new(),
        };
        registry.apply_config(config);
        Ok(registry)
    }

    /// Apply config: require_trust setting and pre-seeded rules.
    pub fn apply_config(&self, config: &TrustConfig) {
        self.require_trust
            .store(config.require_trust, Ordering::Relaxed);

        // Inserted directly; config-sourced rules are not re-persisted
        for address in &config.trusted {
            self.rules.insert(address.clone(), TrustLevel::Trusted);
            tracing::info!(endpoint = %address, "pre-trusted endpoint from config");
        }
        for address in &config.blocked {
            self.rules.insert(address.clone(), TrustLevel::Blocked);
            tracing::info!(endpoint = %address, "blocked endpoint from config");
        }
    }

    /// Check trust level for an endpoint. Returns Untrusted if no rule exists.
    pub fn level(&self, address: &str) -> TrustLevel {
        self.rules
            .get(address)
            .map(|r| *r.value())
            .unwrap_or(TrustLevel::Untrusted)
    }

    /// Would this endpoint be admitted?
    pub fn is_allowed(&self, address: &str) -> bool {
        match self.level(address) {
            TrustLevel::Blocked => false,
            TrustLevel::Trusted => true,
            TrustLevel::Untrusted => !self.require_trust.load(Ordering::Relaxed),
        }
    }

    /// Mark an endpoint as trusted.
    pub fn trust(&self, address: impl Into<String>) {
        let address = address.into();
        tracing::info!(endpoint = %address, "endpoint trusted");
        self.rules.insert(address, TrustLevel::Trusted);
        self.persist();
    }

    /// Mark an endpoint as blocked. Its metadata will no longer be accepted.
    pub fn block(&self, address: impl Into<String>) {
        let address = address.into();
        tracing::info!(endpoint = %address, "endpoint blocked");
        self.rules.insert(address, TrustLevel::Blocked);
        self.persist();
    }

    /// Remove trust rule, reverting to default (Untrusted).
    pub fn remove(&self, address: &str) {
        self.rules.remove(address);
        self.persist();
    }

    /// List all endpoints with explicit trust rules.
    pub fn list(&self) -> Vec<(String, TrustLevel)> {
        self.rules
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }

    /// Count endpoints by trust level: (trusted, untrusted, blocked).
    pub fn counts(&self) -> (usize, usize, usize) {
        let mut trusted = 0;
        let mut untrusted = 0;
        let mut blocked = 0;

        for entry in self.rules.iter() {
            match *entry.value() {
                TrustLevel::Trusted => trusted += 1,
                TrustLevel::Untrusted => untrusted += 1,
                TrustLevel::Blocked => blocked += 1,
            }
        }

        (trusted, untrusted, blocked)
    }
}

impl AccessPolicy for TrustRegistry {
    fn check(
        &self,
        endpoint: &EndpointReference,
        scope: &SecurityKey,
        _metadata: &Metadata,
    ) -> Result<(), ResolveError> {
        if self.is_allowed(endpoint.address()) {
            Ok(())
        } else {
            tracing::warn!(endpoint = %endpoint, scope = %scope.short_id(), "access denied by trust policy");
            Err(ResolveError::AuthorizationDenied(endpoint.to_string()))
        }
    }
}

// ── Persistence ───────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum TrustStoreError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, serde_json::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(serde_json::Error),
}

/// On-disk form: endpoint address → level, sorted for stable diffs.
type Snapshot = BTreeMap<String, TrustLevel>;

fn read_snapshot(path: &Path) -> Result<Snapshot, TrustStoreError> {
    if !path.exists() {
        return Ok(Snapshot::new());
    }
    let text = std::fs::read_to_string(path)
        .map_err(|e| TrustStoreError::ReadFailed(path.to_path_buf(), e))?;
    serde_json::from_str(&text).map_err(|e| TrustStoreError::ParseFailed(path.to_path_buf(), e))
}

fn write_snapshot(path: &Path, snapshot: &Snapshot) -> Result<(), TrustStoreError> {
    let text = serde_json::to_string_pretty(snapshot).map_err(TrustStoreError::SerializeFailed)?;
    std::fs::write(path, text).map_err(|e| TrustStoreError::WriteFailed(path.to_path_buf(), e))
}

impl TrustRegistry {
    /// Write the current rules out. Mutations keep going in memory if this fails.
    fn persist(&self) {
        let Some(path) = self.persist_path.as_deref() else {
            return;
        };
        let snapshot: Snapshot = self
            .rules
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        if let Err(e) = write_snapshot(path, &snapshot) {
            tracing::warn!(error = %e, "trust rules not persisted");
        }
    }
}
