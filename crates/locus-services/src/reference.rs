//! Device and service references: the long-lived handles callers hold.
//!
//! Both kinds share the same resolver pair. What differs is held in a tagged
//! [`Links`] value: a device knows the handles of its hosted services, a
//! service knows the handle of its parent device, if it has one. Links are
//! plain [`ReferenceId`] handles, never owning pointers; the registry's arena
//! turns a handle back into a reference.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use locus_core::{EndpointReference, Location, Metadata, ResolveError, ResolvedAddress, SecurityKey};

use crate::address::AddressResolver;
use crate::metadata::{Lifecycle, MetadataChange, MetadataResolver};

/// Stable handle of a reference within one registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReferenceId(pub(crate) u64);

impl fmt::Display for ReferenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReferenceKind {
    Device,
    Service,
}

/// Kind-specific links to other references.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Links {
    Device { services: BTreeSet<ReferenceId> },
    Service { parent: Option<ReferenceId> },
}

/// Handle to a remote or local device or service.
pub struct Reference {
    id: ReferenceId,
    endpoint: EndpointReference,
    scope: SecurityKey,
    location: Mutex<Location>,
    links: Mutex<Links>,
    addresses: Arc<AddressResolver>,
    metadata: MetadataResolver,
    disposed: AtomicBool,
}

impl Reference {
    pub(crate) fn new(
        id: ReferenceId,
        kind: ReferenceKind,
        endpoint: EndpointReference,
        scope: SecurityKey,
        location: Location,
        addresses: Arc<AddressResolver>,
        metadata: MetadataResolver,
    ) -> Self {
        let links = match kind {
            ReferenceKind::Device => Links::Device {
                services: BTreeSet::new(),
            },
            ReferenceKind::Service => Links::Service { parent: None },
        };
        Self {
            id,
            endpoint,
            scope,
            location: Mutex::new(location),
            links: Mutex::new(links),
            addresses,
            metadata,
            disposed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> ReferenceId {
        self.id
    }

    pub fn kind(&self) -> ReferenceKind {
        match &*self.links.lock() {
            Links::Device { .. } => ReferenceKind::Device,
            Links::Service { .. } => ReferenceKind::Service,
        }
    }

    pub fn endpoint(&self) -> &EndpointReference {
        &self.endpoint
    }

    pub fn scope(&self) -> &SecurityKey {
        &self.scope
    }

    pub fn location(&self) -> Location {
        *self.location.lock()
    }

    pub(crate) fn set_location(&self, location: Location) {
        *self.location.lock() = location;
    }

    /// Current generation of the candidate address set.
    pub fn generation(&self) -> u64 {
        self.addresses.generation()
    }

    /// A reachable transport address for this endpoint.
    pub fn address(&self) -> Result<ResolvedAddress, ResolveError> {
        self.addresses.preferred()
    }

    /// Report that `address`, obtained at `generation`, could not be reached.
    ///
    /// Returns the next address to try, or `None` if the caller's view is
    /// stale and it should call [`address`](Self::address) again.
    pub fn report_address_failure(
        &self,
        address: &ResolvedAddress,
        generation: u64,
    ) -> Result<Option<ResolvedAddress>, ResolveError> {
        self.addresses.report_failure(address, generation)
    }

    pub fn addresses(&self) -> &Arc<AddressResolver> {
        &self.addresses
    }

    /// Up-to-date metadata, fetched through the current address if needed.
    pub fn metadata(&self) -> Result<Arc<Metadata>, ResolveError> {
        self.metadata.get()
    }

    pub(crate) fn fetch_metadata(
        &self,
    ) -> Result<(Arc<Metadata>, Option<MetadataChange>), ResolveError> {
        self.metadata.fetch()
    }

    pub fn metadata_resolver(&self) -> &MetadataResolver {
        &self.metadata
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.metadata.lifecycle()
    }

    /// Parent device of a service reference.
    pub fn parent(&self) -> Option<ReferenceId> {
        match &*self.links.lock() {
            Links::Service { parent } => *parent,
            Links::Device { .. } => None,
        }
    }

    /// Hosted services of a device reference.
    pub fn services(&self) -> Vec<ReferenceId> {
        match &*self.links.lock() {
            Links::Device { services } => services.iter().copied().collect(),
            Links::Service { .. } => Vec::new(),
        }
    }

    /// Set the parent of a service. Returns false for devices.
    pub(crate) fn set_parent(&self, device: Option<ReferenceId>) -> bool {
        match &mut *self.links.lock() {
            Links::Service { parent } => {
                *parent = device;
                true
            }
            Links::Device { .. } => false,
        }
    }

    pub(crate) fn add_service(&self, service: ReferenceId) -> bool {
        match &mut *self.links.lock() {
            Links::Device { services } => services.insert(service),
            Links::Service { .. } => false,
        }
    }

    pub(crate) fn remove_service(&self, service: ReferenceId) {
        if let Links::Device { services } = &mut *self.links.lock() {
            services.remove(&service);
        }
    }

    /// Only remote services without a parent are eligible for eviction.
    pub(crate) fn is_evictable(&self) -> bool {
        self.location() == Location::Remote
            && matches!(&*self.links.lock(), Links::Service { parent: None })
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Mark disposed and release resolver waiters. Returns the links the
    /// registry still has to sever, or `None` if already disposed.
    pub(crate) fn dispose(&self) -> Option<Links> {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return None;
        }
        self.addresses.dispose();
        self.metadata.dispose();
        let links = self.links.lock().clone();
        Some(links)
    }
}

impl fmt::Debug for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reference")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint.address())
            .field("scope", &self.scope.short_id())
            .field("location", &self.location())
            .finish()
    }
}
