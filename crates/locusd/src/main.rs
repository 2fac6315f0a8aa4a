//! locusd — Locus resolution daemon.
//!
//! Serves the static endpoint directory from the config file, resolves the
//! watched endpoints through the registry, and logs registry state.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use locus_core::config::{data_dir, LocusConfig};
use locus_core::{EndpointReference, SecurityKey};
use locus_services::{MetadataChange, Reference, ReferenceListener, Registry, TrustRegistry};

mod directory;

use directory::StaticDirectory;

/// Logs registry lifecycle events.
struct LogListener;

impl ReferenceListener for LogListener {
    fn on_created(&self, reference: &Arc<Reference>) {
        tracing::info!(id = %reference.id(), kind = ?reference.kind(), endpoint = %reference.endpoint(), "reference created");
    }

    fn on_changed(&self, reference: &Arc<Reference>, change: MetadataChange) {
        tracing::info!(
            id = %reference.id(),
            endpoint = %reference.endpoint(),
            first = change.first,
            proxy_rebuilt = change.proxy_rebuilt,
            endpoints_changed = change.endpoints_changed,
            "metadata changed"
        );
    }

    fn on_disposed(&self, reference: &Arc<Reference>) {
        tracing::info!(id = %reference.id(), endpoint = %reference.endpoint(), "reference disposed");
    }
}

/// Resolve a device and everything it hosts. Blocking.
fn resolve_watched(registry: &Registry, endpoint: EndpointReference) -> Result<()> {
    let device = registry.device(&endpoint, &SecurityKey::default());
    let address = device
        .address()
        .with_context(|| format!("resolving {endpoint}"))?;
    tracing::info!(endpoint = %endpoint, address = %address, "resolved");

    let metadata = registry
        .refresh_device(&device)
        .with_context(|| format!("fetching metadata for {endpoint}"))?;
    tracing::info!(
        endpoint = %endpoint,
        version = metadata.version,
        hosted = metadata.hosted.len(),
        "device metadata"
    );

    for id in device.services() {
        let Some(service) = registry.get(id) else { continue };
        match registry.refresh_service(&service) {
            Ok(m) => tracing::info!(
                service = %service.endpoint(),
                capabilities = ?m.capabilities,
                "service metadata"
            ),
            Err(e) => tracing::warn!(service = %service.endpoint(), error = %e, "service metadata failed"),
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = LocusConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let mut config = LocusConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        LocusConfig::default()
    });
    tracing::info!(
        path = %LocusConfig::file_path().display(),
        wait_attempts = config.resolution.wait_attempts,
        wait_interval_ms = config.resolution.wait_interval_ms,
        max_service_references = config.cache.max_service_references,
        "locusd starting"
    );

    // Trust
    if config.trust.persist_path.is_none() {
        let dir = data_dir();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
        config.trust.persist_path = Some(dir.join("trust.json"));
    }
    let trust = TrustRegistry::from_config(&config.trust).context("failed to load trust rules")?;
    if config.trust.require_trust {
        tracing::warn!("require_trust enabled, only trusted endpoints are admitted");
    }

    // Registry
    let directory = StaticDirectory::new(tokio::runtime::Handle::current(), &config.directory);
    let registry = Registry::new(directory, Arc::new(trust.clone()), &config);
    registry.add_listener(Arc::new(LogListener));

    // ── Resolve watched endpoints ────────────────────────────────────────────

    for address in config.directory.watch.clone() {
        let registry = registry.clone();
        tokio::task::spawn_blocking(move || {
            let endpoint = EndpointReference::new(address.as_str());
            if let Err(e) = resolve_watched(&registry, endpoint) {
                tracing::warn!(error = %format!("{e:#}"), "watched endpoint failed");
            }
        });
    }

    // ── Status loop ──────────────────────────────────────────────────────────

    let status_task = {
        let registry = registry.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(10));
            loop {
                interval.tick().await;
                let (trusted, untrusted, blocked) = trust.counts();
                tracing::info!(
                    devices = registry.device_count(),
                    services = registry.service_count(),
                    evictable = registry.evictable_count(),
                    trusted,
                    untrusted,
                    blocked,
                    "registry snapshot"
                );
            }
        })
    };

    // ── Wait for exit ────────────────────────────────────────────────────────

    tokio::select! {
        r = tokio::signal::ctrl_c() => {
            r.context("failed to listen for shutdown signal")?;
            tracing::info!("shutting down");
        }
        r = status_task => tracing::error!("status task exited: {:?}", r),
    }

    Ok(())
}
