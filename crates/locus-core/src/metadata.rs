//! Descriptive metadata fetched from a device or service.

use std::collections::BTreeSet;

use crate::endpoint::EndpointReference;

/// A service hosted on a device, as listed in the device's metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostedService {
    /// Device-local service identifier.
    pub service_id: String,
    /// Endpoints the service is reachable under.
    pub endpoints: Vec<EndpointReference>,
    /// Port types the service implements.
    pub capabilities: BTreeSet<String>,
}

/// Result of a metadata exchange.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    /// Port types (services) or device types (devices).
    pub capabilities: BTreeSet<String>,
    /// Authoritative endpoint set for the referenced device or service.
    /// Empty means the metadata did not say.
    pub endpoints: Vec<EndpointReference>,
    /// Monotonic metadata version announced by the peer.
    pub version: u64,
    /// Hosted services. Always empty for service metadata.
    pub hosted: Vec<HostedService>,
}

impl Metadata {
    /// True if every capability in `previous` is still offered.
    pub fn covers(&self, previous: &BTreeSet<String>) -> bool {
        self.capabilities.is_superset(previous)
    }
}
