//! Boundary to the messaging collaborator.
//!
//! Locus never encodes discovery or metadata messages itself. It hands a
//! request to a [`Messenger`] together with a [`Reply`] callback, and the
//! messenger invokes that callback exactly once, from one of its own worker
//! threads, with an [`Outcome`].

use std::net::IpAddr;

use crate::endpoint::{EndpointReference, ResolvedAddress, SecurityKey};
use crate::metadata::Metadata;

/// What the transport knows about the exchange that produced an outcome.
///
/// Used for source-address affinity when merging resolved addresses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Local address the exchange went out on.
    pub local: Option<IpAddr>,
    /// Address the response came from.
    pub remote: Option<IpAddr>,
    /// Local interface name, if known.
    pub interface: Option<String>,
}

impl ConnectionInfo {
    pub fn from_remote(remote: IpAddr) -> Self {
        Self {
            remote: Some(remote),
            ..Default::default()
        }
    }
}

/// The single completion of an outbound exchange.
#[derive(Debug, Clone)]
pub enum Outcome<T> {
    /// The peer answered with a result.
    Match(T, ConnectionInfo),
    /// The peer answered with a protocol fault.
    Fault(String, ConnectionInfo),
    /// The answer could not be decoded.
    Malformed(String, ConnectionInfo),
    /// The request never reached the peer.
    TransportFailure(String, ConnectionInfo),
    /// No answer arrived in time.
    Timeout(ConnectionInfo),
}

impl<T> Outcome<T> {
    pub fn connection(&self) -> &ConnectionInfo {
        match self {
            Outcome::Match(_, c)
            | Outcome::Fault(_, c)
            | Outcome::Malformed(_, c)
            | Outcome::TransportFailure(_, c)
            | Outcome::Timeout(c) => c,
        }
    }

    /// Short label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Outcome::Match(..) => "match",
            Outcome::Fault(..) => "fault",
            Outcome::Malformed(..) => "malformed",
            Outcome::TransportFailure(..) => "transport_failure",
            Outcome::Timeout(..) => "timeout",
        }
    }
}

/// One-shot completion callback. Consumed on use, so it cannot fire twice.
pub type Reply<T> = Box<dyn FnOnce(Outcome<T>) + Send + 'static>;

/// Outbound messaging used by the resolvers.
///
/// Implementations must not invoke `reply` synchronously from inside the
/// call; completions arrive on the collaborator's own threads.
pub trait Messenger: Send + Sync {
    /// Resolve an endpoint identity to its transport addresses.
    ///
    /// `hint` is a transport address to try first, if any is known.
    fn resolve(
        &self,
        endpoint: &EndpointReference,
        hint: Option<&ResolvedAddress>,
        scope: &SecurityKey,
        reply: Reply<Vec<ResolvedAddress>>,
    );

    /// Fetch descriptive metadata from a concrete address.
    fn fetch_metadata(&self, address: &ResolvedAddress, scope: &SecurityKey, reply: Reply<Metadata>);
}
