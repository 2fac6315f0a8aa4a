//! Reference registry: the canonical device and service references.
//!
//! Two maps, identity → (scope → reference), one for devices and one for
//! services, each behind its own `RwLock`. A lookup probes under the shared
//! lock; a miss releases it and asks for the exclusive lock with a bounded
//! wait. A wait that runs out counts as contention and the whole lookup
//! restarts from the probe. No thread ever upgrades a shared lock, so after
//! enough restarts the exclusive lock is taken blocking.
//!
//! Parent/child links are [`ReferenceId`] handles, resolved through an
//! arena. Listener callbacks and disposal happen with no map lock held.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::{DashMap, DashSet};
use parking_lot::RwLock;

use locus_core::config::{LocusConfig, RegistryConfig};
use locus_core::{
    EndpointReference, Location, Messenger, Metadata, ResolveError, ResolvedAddress, SecurityKey,
};

use crate::address::AddressResolver;
use crate::eviction::EvictionCache;
use crate::metadata::{MetadataChange, MetadataResolver};
use crate::reference::{Links, Reference, ReferenceId, ReferenceKind};
use crate::sync::WaitPolicy;
use crate::trust::AccessPolicy;

// ── Listeners ───────────────────────────────────────────────────────────────

/// Observer of reference lifecycle events. Every hook defaults to a no-op.
///
/// Hooks are called with no registry lock held and may call back into the
/// registry.
pub trait ReferenceListener: Send + Sync {
    fn on_created(&self, _reference: &Arc<Reference>) {}
    fn on_changed(&self, _reference: &Arc<Reference>, _change: MetadataChange) {}
    fn on_disposed(&self, _reference: &Arc<Reference>) {}
}

// ── Scoped map ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct LockPolicy {
    attempt: Duration,
    max_restarts: u32,
}

impl From<&RegistryConfig> for LockPolicy {
    fn from(config: &RegistryConfig) -> Self {
        Self {
            attempt: config.lock_attempt(),
            max_restarts: config.max_contention_retries,
        }
    }
}

type ScopeMap = HashMap<SecurityKey, Arc<Reference>>;

struct ScopedMap {
    kind: ReferenceKind,
    entries: RwLock<HashMap<EndpointReference, ScopeMap>>,
}

impl ScopedMap {
    fn new(kind: ReferenceKind) -> Self {
        Self {
            kind,
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn probe(&self, endpoint: &EndpointReference, scope: &SecurityKey) -> Option<Arc<Reference>> {
        self.entries
            .read()
            .get(endpoint)
            .and_then(|scopes| scopes.get(scope))
            .cloned()
    }

    /// Return the reference for `(endpoint, scope)`, building it with
    /// `create` on a miss. The flag is true if this call inserted it.
    fn get_or_create<F>(
        &self,
        endpoint: &EndpointReference,
        scope: &SecurityKey,
        lock: LockPolicy,
        create: F,
    ) -> (Arc<Reference>, bool)
    where
        F: FnOnce() -> Arc<Reference>,
    {
        let mut restarts = 0;
        let mut entries = loop {
            if let Some(existing) = self.probe(endpoint, scope) {
                return (existing, false);
            }
            if restarts >= lock.max_restarts {
                tracing::debug!(
                    kind = ?self.kind,
                    endpoint = %endpoint,
                    restarts,
                    "contention persisted, blocking for exclusive lock"
                );
                break self.entries.write();
            }
            match self.entries.try_write_for(lock.attempt) {
                Some(guard) => break guard,
                None => {
                    restarts += 1;
                    tracing::trace!(kind = ?self.kind, endpoint = %endpoint, restarts, "lock contention, restarting lookup");
                }
            }
        };

        // Another thread may have inserted between the probe and the lock.
        if let Some(existing) = entries.get(endpoint).and_then(|scopes| scopes.get(scope)) {
            return (existing.clone(), false);
        }
        let reference = create();
        entries
            .entry(endpoint.clone())
            .or_default()
            .insert(scope.clone(), reference.clone());
        (reference, true)
    }

    /// Remove `(endpoint, scope)`. With `only`, removal happens only if the
    /// stored reference has that id.
    fn remove(
        &self,
        endpoint: &EndpointReference,
        scope: &SecurityKey,
        only: Option<ReferenceId>,
    ) -> Option<Arc<Reference>> {
        let mut entries = self.entries.write();
        let scopes = entries.get_mut(endpoint)?;
        if let Some(id) = only {
            if scopes.get(scope).map(|r| r.id()) != Some(id) {
                return None;
            }
        }
        let removed = scopes.remove(scope);
        if scopes.is_empty() {
            entries.remove(endpoint);
        }
        removed
    }

    /// Every reference for `endpoint`, across all scopes.
    fn all_scopes(&self, endpoint: &EndpointReference) -> Vec<Arc<Reference>> {
        self.entries
            .read()
            .get(endpoint)
            .map(|scopes| scopes.values().cloned().collect())
            .unwrap_or_default()
    }

    fn len(&self) -> usize {
        self.entries.read().values().map(|scopes| scopes.len()).sum()
    }
}

// ── Registry ────────────────────────────────────────────────────────────────

struct Inner {
    messenger: Arc<dyn Messenger>,
    policy: Arc<dyn AccessPolicy>,
    wait: WaitPolicy,
    lock: LockPolicy,
    devices: ScopedMap,
    services: ScopedMap,
    arena: DashMap<ReferenceId, Arc<Reference>>,
    cache: EvictionCache,
    local: DashSet<EndpointReference>,
    listeners: RwLock<Vec<Arc<dyn ReferenceListener>>>,
    next_id: AtomicU64,
}

/// Shared handle to the registry. Cloning is cheap.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<Inner>,
}

impl Registry {
    pub fn new(
        messenger: Arc<dyn Messenger>,
        policy: Arc<dyn AccessPolicy>,
        config: &LocusConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                messenger,
                policy,
                wait: WaitPolicy::from(&config.resolution),
                lock: LockPolicy::from(&config.registry),
                devices: ScopedMap::new(ReferenceKind::Device),
                services: ScopedMap::new(ReferenceKind::Service),
                arena: DashMap::new(),
                cache: EvictionCache::new(config.cache.max_service_references),
                local: DashSet::new(),
                listeners: RwLock::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn ReferenceListener>) {
        self.inner.listeners.write().push(listener);
    }

    /// Device reference for `(endpoint, scope)`, created on first use.
    pub fn device(&self, endpoint: &EndpointReference, scope: &SecurityKey) -> Arc<Reference> {
        let (reference, created) =
            self.inner
                .devices
                .get_or_create(endpoint, scope, self.inner.lock, || {
                    self.build(ReferenceKind::Device, endpoint, scope)
                });
        if created {
            tracing::debug!(id = %reference.id(), endpoint = %endpoint, scope = %scope.short_id(), "device reference created");
            self.notify(|l| l.on_created(&reference));
        }
        reference
    }

    /// Service reference for `(endpoint, scope)`, created on first use.
    ///
    /// A new remote service is admitted to the eviction cache, which may
    /// push out and dispose the least recently used one. A hit counts as use.
    pub fn service(&self, endpoint: &EndpointReference, scope: &SecurityKey) -> Arc<Reference> {
        let (reference, created) =
            self.inner
                .services
                .get_or_create(endpoint, scope, self.inner.lock, || {
                    self.build(ReferenceKind::Service, endpoint, scope)
                });
        if created {
            tracing::debug!(id = %reference.id(), endpoint = %endpoint, scope = %scope.short_id(), "service reference created");
            self.notify(|l| l.on_created(&reference));
            self.admit(&reference);
        } else {
            self.inner.cache.touch(reference.id());
        }
        reference
    }

    pub fn find_device(&self, endpoint: &EndpointReference, scope: &SecurityKey) -> Option<Arc<Reference>> {
        self.inner.devices.probe(endpoint, scope)
    }

    pub fn find_service(&self, endpoint: &EndpointReference, scope: &SecurityKey) -> Option<Arc<Reference>> {
        let found = self.inner.services.probe(endpoint, scope);
        if let Some(reference) = &found {
            self.inner.cache.touch(reference.id());
        }
        found
    }

    /// Follow a link handle.
    pub fn get(&self, id: ReferenceId) -> Option<Arc<Reference>> {
        self.inner.arena.get(&id).map(|entry| entry.value().clone())
    }

    /// Unregister and dispose a device. Its services lose their parent.
    pub fn remove_device(&self, endpoint: &EndpointReference, scope: &SecurityKey) -> Option<Arc<Reference>> {
        let removed = self.inner.devices.remove(endpoint, scope, None)?;
        self.release(&removed);
        Some(removed)
    }

    /// Unregister and dispose a service.
    pub fn remove_service(&self, endpoint: &EndpointReference, scope: &SecurityKey) -> Option<Arc<Reference>> {
        let removed = self.inner.services.remove(endpoint, scope, None)?;
        self.release(&removed);
        Some(removed)
    }

    /// Link `service` under `device`. The service leaves the eviction cache.
    pub fn attach_service(&self, device: &Arc<Reference>, service: &Arc<Reference>) -> bool {
        if device.is_disposed() || service.is_disposed() || device.kind() != ReferenceKind::Device {
            return false;
        }
        let previous = service.parent();
        if !service.set_parent(Some(device.id())) {
            return false;
        }
        if let Some(old) = previous.filter(|old| *old != device.id()).and_then(|old| self.get(old)) {
            old.remove_service(service.id());
        }
        device.add_service(service.id());
        self.inner.cache.remove(service.id());
        tracing::debug!(device = %device.id(), service = %service.id(), "service attached to device");
        true
    }

    /// Fetch device metadata and link the services it hosts.
    ///
    /// Services no longer listed are detached and become evictable again.
    pub fn refresh_device(&self, device: &Arc<Reference>) -> Result<Arc<Metadata>, ResolveError> {
        let (metadata, change) = device.fetch_metadata()?;
        let scope = device.scope().clone();

        let mut hosted = BTreeSet::new();
        for entry in &metadata.hosted {
            let Some(primary) = entry.endpoints.first() else {
                tracing::debug!(device = %device.id(), service_id = %entry.service_id, "hosted service without endpoints");
                continue;
            };
            let service = self.service(primary, &scope);
            if entry.endpoints.len() > 1 && service.addresses().identities() != entry.endpoints {
                service.addresses().invalidate(&entry.endpoints, None);
            }
            self.attach_service(device, &service);
            hosted.insert(service.id());
        }

        for id in device.services() {
            if hosted.contains(&id) {
                continue;
            }
            device.remove_service(id);
            if let Some(service) = self.get(id) {
                if service.parent() == Some(device.id()) {
                    service.set_parent(None);
                    self.admit(&service);
                }
            }
        }

        if let Some(change) = change {
            tracing::info!(
                device = %device.id(),
                endpoint = %device.endpoint(),
                version = metadata.version,
                hosted = hosted.len(),
                "device metadata refreshed"
            );
            self.notify(|l| l.on_changed(device, change));
        }
        Ok(metadata)
    }

    /// Fetch service metadata, notifying listeners if it changed.
    pub fn refresh_service(&self, service: &Arc<Reference>) -> Result<Arc<Metadata>, ResolveError> {
        let (metadata, change) = service.fetch_metadata()?;
        self.inner.cache.touch(service.id());
        if let Some(change) = change {
            self.notify(|l| l.on_changed(service, change));
        }
        Ok(metadata)
    }

    /// A device announced itself. Merges its transport addresses and marks
    /// metadata stale if the announced version is newer than what we hold.
    pub fn on_hello(
        &self,
        endpoint: &EndpointReference,
        scope: &SecurityKey,
        addresses: Vec<ResolvedAddress>,
        metadata_version: Option<u64>,
    ) -> Arc<Reference> {
        let device = self.device(endpoint, scope);
        if device.location() != Location::Local {
            device.set_location(Location::Remote);
        }
        let added = device.addresses().add_candidates(addresses);

        let held = device.metadata_resolver().current().map(|m| m.version);
        if let (Some(announced), Some(held)) = (metadata_version, held) {
            if announced > held {
                device.metadata_resolver().mark_stale();
            }
        }
        tracing::debug!(device = %device.id(), endpoint = %endpoint, added, "hello");
        device
    }

    /// A device said goodbye. Its addresses are dropped; the next use
    /// resolves from scratch.
    pub fn on_bye(&self, endpoint: &EndpointReference, scope: &SecurityKey) -> bool {
        let Some(device) = self.find_device(endpoint, scope) else {
            return false;
        };
        device.set_location(Location::Unknown);
        device.addresses().invalidate(std::slice::from_ref(endpoint), None);
        tracing::debug!(device = %device.id(), endpoint = %endpoint, "bye");
        true
    }

    /// Declare `endpoint` as hosted by this process. Existing references
    /// become local and leave the eviction cache.
    pub fn register_local(&self, endpoint: EndpointReference) {
        for reference in self
            .inner
            .devices
            .all_scopes(&endpoint)
            .into_iter()
            .chain(self.inner.services.all_scopes(&endpoint))
        {
            reference.set_location(Location::Local);
            self.inner.cache.remove(reference.id());
        }
        tracing::info!(endpoint = %endpoint, "local endpoint registered");
        self.inner.local.insert(endpoint);
    }

    pub fn is_local(&self, endpoint: &EndpointReference) -> bool {
        self.inner.local.contains(endpoint)
    }

    pub fn device_count(&self) -> usize {
        self.inner.devices.len()
    }

    pub fn service_count(&self) -> usize {
        self.inner.services.len()
    }

    /// Number of services currently subject to eviction.
    pub fn evictable_count(&self) -> usize {
        self.inner.cache.len()
    }

    pub fn is_evictable(&self, id: ReferenceId) -> bool {
        self.inner.cache.contains(id)
    }

    // ── Internals ───────────────────────────────────────────────────────────

    fn build(&self, kind: ReferenceKind, endpoint: &EndpointReference, scope: &SecurityKey) -> Arc<Reference> {
        let id = ReferenceId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let location = if self.is_local(endpoint) {
            Location::Local
        } else {
            Location::Remote
        };
        let addresses = AddressResolver::new(
            endpoint.clone(),
            scope.clone(),
            self.inner.messenger.clone(),
            self.inner.wait,
        );
        let metadata = MetadataResolver::new(
            endpoint.clone(),
            scope.clone(),
            addresses.clone(),
            self.inner.messenger.clone(),
            self.inner.policy.clone(),
            self.inner.wait,
        );
        let reference = Arc::new(Reference::new(
            id,
            kind,
            endpoint.clone(),
            scope.clone(),
            location,
            addresses,
            metadata,
        ));
        self.inner.arena.insert(id, reference.clone());
        reference
    }

    fn admit(&self, reference: &Arc<Reference>) {
        if !reference.is_evictable() {
            return;
        }
        let evicted = self.inner.cache.admit(reference.clone());
        // An attach or local registration may have landed since the check above.
        if !reference.is_evictable() {
            self.inner.cache.remove(reference.id());
        }
        if let Some(evicted) = evicted {
            tracing::debug!(
                id = %evicted.id(),
                endpoint = %evicted.endpoint(),
                "evicting least recently used service reference"
            );
            self.inner
                .services
                .remove(evicted.endpoint(), evicted.scope(), Some(evicted.id()));
            self.release(&evicted);
        }
    }

    /// Dispose an unregistered reference and sever its links.
    fn release(&self, reference: &Arc<Reference>) {
        let Some(links) = reference.dispose() else {
            return;
        };
        self.inner.cache.remove(reference.id());
        self.inner.arena.remove(&reference.id());

        match links {
            Links::Service { parent: Some(parent) } => {
                if let Some(device) = self.get(parent) {
                    device.remove_service(reference.id());
                }
            }
            Links::Service { parent: None } => {}
            Links::Device { services } => {
                for id in services {
                    let Some(service) = self.get(id) else { continue };
                    if service.parent() == Some(reference.id()) {
                        service.set_parent(None);
                        self.admit(&service);
                    }
                }
            }
        }

        tracing::debug!(id = %reference.id(), endpoint = %reference.endpoint(), "reference disposed");
        self.notify(|l| l.on_disposed(reference));
    }

    fn notify(&self, event: impl Fn(&dyn ReferenceListener)) {
        let listeners = self.inner.listeners.read().clone();
        for listener in &listeners {
            event(listener.as_ref());
        }
    }
}
