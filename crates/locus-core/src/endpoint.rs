//! Endpoint identity and address model.
//!
//! An [`EndpointReference`] names a device or service independently of where
//! it lives. A [`ResolvedAddress`] binds one to a concrete transport URI.
//! A [`SecurityKey`] scopes lookups so that two local security contexts in
//! one process never share a reference object.

use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, Ipv6Addr};
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// URI schemes that are usable as transport addresses without resolution.
const TRANSPORT_SCHEMES: &[&str] = &["http", "https", "soap.udp", "tcp", "udp"];

// ── Endpoint Reference ───────────────────────────────────────────────────────

/// Logical, location-independent identity of a device or service.
///
/// Identity is the address token alone. Reference parameters travel with
/// the endpoint but never take part in equality or hashing.
#[derive(Clone)]
pub struct EndpointReference {
    address: Arc<str>,
    parameters: Option<Bytes>,
}

impl EndpointReference {
    pub fn new(address: impl Into<Arc<str>>) -> Self {
        Self {
            address: address.into(),
            parameters: None,
        }
    }

    /// Attach opaque reference parameters.
    pub fn with_parameters(mut self, parameters: Bytes) -> Self {
        self.parameters = Some(parameters);
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn parameters(&self) -> Option<&Bytes> {
        self.parameters.as_ref()
    }

    /// True if the address token is already a usable transport URI
    /// (as opposed to a URN that must be resolved first).
    pub fn is_transport(&self) -> bool {
        scheme(&self.address)
            .map(|s| TRANSPORT_SCHEMES.iter().any(|t| s.eq_ignore_ascii_case(t)))
            .unwrap_or(false)
    }
}

impl PartialEq for EndpointReference {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for EndpointReference {}

impl Hash for EndpointReference {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
    }
}

impl fmt::Debug for EndpointReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("EndpointReference").field(&self.address).finish()
    }
}

impl fmt::Display for EndpointReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address)
    }
}

impl From<&str> for EndpointReference {
    fn from(address: &str) -> Self {
        Self::new(address)
    }
}

// ── Security Key ──────────────────────────────────────────────────────────────

/// Local credential information used when talking to a remote endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CredentialInfo {
    /// Identifier of the local credential (certificate alias, key name).
    pub id: String,
}

/// Scope under which an endpoint is resolved.
///
/// Combines the outgoing discovery channels (local egress interfaces) with
/// optional local credentials. The default key is empty and is used when
/// no scoping is required.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SecurityKey {
    channels: BTreeSet<String>,
    credentials: Option<CredentialInfo>,
}

impl SecurityKey {
    pub fn new(
        channels: impl IntoIterator<Item = impl Into<String>>,
        credentials: Option<CredentialInfo>,
    ) -> Self {
        Self {
            channels: channels.into_iter().map(Into::into).collect(),
            credentials,
        }
    }

    pub fn channels(&self) -> impl Iterator<Item = &str> {
        self.channels.iter().map(String::as_str)
    }

    pub fn credentials(&self) -> Option<&CredentialInfo> {
        self.credentials.as_ref()
    }

    pub fn is_default(&self) -> bool {
        self.channels.is_empty() && self.credentials.is_none()
    }

    /// Stable BLAKE3 digest of the key, for logs and diagnostics.
    pub fn fingerprint(&self) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        for channel in &self.channels {
            hasher.update(channel.as_bytes());
            hasher.update(&[0]);
        }
        hasher.update(&[0xff]);
        if let Some(credentials) = &self.credentials {
            hasher.update(credentials.id.as_bytes());
        }
        *hasher.finalize().as_bytes()
    }

    /// Short hex form of the fingerprint.
    pub fn short_id(&self) -> String {
        hex::encode(&self.fingerprint()[..4])
    }
}

// ── Protocol Info ─────────────────────────────────────────────────────────────

/// Protocol details learned about an address, mergeable across observations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolInfo {
    /// Protocol versions the peer has been seen speaking.
    pub versions: BTreeSet<u16>,
    /// Largest message the peer accepts, if advertised.
    pub max_message_size: Option<u32>,
}

impl ProtocolInfo {
    pub fn with_version(version: u16) -> Self {
        Self {
            versions: BTreeSet::from([version]),
            max_message_size: None,
        }
    }

    /// Fold another observation into this one.
    pub fn merge(&mut self, other: &ProtocolInfo) {
        self.versions.extend(other.versions.iter().copied());
        self.max_message_size = match (self.max_message_size, other.max_message_size) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
    }
}

// ── Resolved Address ──────────────────────────────────────────────────────────

/// An endpoint bound to a concrete transport URI.
///
/// Equality is by transport URI only, so a set of addresses for a
/// multi-homed endpoint is de-duplicated on the URI.
#[derive(Clone)]
pub struct ResolvedAddress {
    endpoint: EndpointReference,
    transport: Arc<str>,
    protocol: ProtocolInfo,
}

impl ResolvedAddress {
    pub fn new(endpoint: EndpointReference, transport: impl Into<Arc<str>>) -> Self {
        Self {
            endpoint,
            transport: transport.into(),
            protocol: ProtocolInfo::default(),
        }
    }

    pub fn with_protocol(mut self, protocol: ProtocolInfo) -> Self {
        self.protocol = protocol;
        self
    }

    /// An endpoint whose address token is itself a transport URI.
    pub fn direct(endpoint: &EndpointReference) -> Self {
        Self::new(endpoint.clone(), endpoint.address())
    }

    pub fn endpoint(&self) -> &EndpointReference {
        &self.endpoint
    }

    pub fn transport(&self) -> &str {
        &self.transport
    }

    pub fn protocol(&self) -> &ProtocolInfo {
        &self.protocol
    }

    pub fn merge_protocol(&mut self, other: &ProtocolInfo) {
        self.protocol.merge(other);
    }

    /// The literal IP host of the transport URI, if it has one.
    pub fn host_ip(&self) -> Option<IpAddr> {
        let rest = self.transport.split_once("://").map(|(_, r)| r)?;
        let authority = rest.split(['/', '?', '#']).next()?;
        let host_port = authority.rsplit_once('@').map(|(_, h)| h).unwrap_or(authority);

        if let Some(bracketed) = host_port.strip_prefix('[') {
            let end = bracketed.find(']')?;
            let host = &bracketed[..end];
            // Drop any zone id ("fe80::1%eth0")
            let host = host.split('%').next()?;
            return host.parse::<Ipv6Addr>().ok().map(IpAddr::V6);
        }

        let host = host_port.split(':').next()?;
        host.parse::<IpAddr>().ok()
    }

    /// Does this address sit on the same local subnet as `source`?
    ///
    /// IPv4 compares /24 prefixes, IPv6 compares /64 prefixes.
    pub fn same_subnet(&self, source: IpAddr) -> bool {
        match (self.host_ip(), source) {
            (Some(IpAddr::V4(a)), IpAddr::V4(b)) => a.octets()[..3] == b.octets()[..3],
            (Some(IpAddr::V6(a)), IpAddr::V6(b)) => a.segments()[..4] == b.segments()[..4],
            _ => false,
        }
    }
}

impl PartialEq for ResolvedAddress {
    fn eq(&self, other: &Self) -> bool {
        self.transport == other.transport
    }
}

impl Eq for ResolvedAddress {}

impl Hash for ResolvedAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.transport.hash(state);
    }
}

impl fmt::Debug for ResolvedAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedAddress")
            .field("endpoint", &self.endpoint.address())
            .field("transport", &self.transport)
            .finish()
    }
}

impl fmt::Display for ResolvedAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.transport)
    }
}

// ── Location ──────────────────────────────────────────────────────────────────

/// Where the referenced endpoint is hosted relative to this process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Location {
    Local,
    Remote,
    #[default]
    Unknown,
}

fn scheme(uri: &str) -> Option<&str> {
    let (scheme, _) = uri.split_once(':')?;
    if scheme.is_empty() {
        return None;
    }
    // "urn:uuid:..." has no authority; transport URIs do
    if !uri[scheme.len() + 1..].starts_with("//") {
        return None;
    }
    Some(scheme)
}
