//! Locus integration test harness.
//!
//! Tests run the registry and resolvers against a scripted in-process
//! network. The network answers from tables the test fills in, on its own
//! threads, and counts every request it sees. It can also hold replies back
//! so a test can interleave them with invalidations.
//!
//!   cargo test --test integration

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

pub use locus_core::config::LocusConfig;
pub use locus_core::{
    ConnectionInfo, EndpointReference, HostedService, Location, Messenger, Metadata, Outcome,
    Reply, ResolveError, ResolvedAddress, SecurityKey,
};
pub use locus_services::{AllowAll, Reference, Registry, TrustRegistry};

mod eviction;
mod resolution;

// ── Harness ───────────────────────────────────────────────────────────────────

/// Resolve answer for one endpoint identity.
#[derive(Clone, Default)]
pub struct Answer {
    pub transports: Vec<String>,
    /// Source address the answer appears to come from.
    pub source: Option<IpAddr>,
}

/// A reply parked while the network is holding.
pub type Held = Reply<Vec<ResolvedAddress>>;

#[derive(Default)]
pub struct Network {
    pub answers: Mutex<HashMap<String, Answer>>,
    /// Transport URI → metadata served there. Missing means refused.
    pub metadata: Mutex<HashMap<String, Metadata>>,
    /// Every resolve request, by endpoint address.
    pub resolves: Mutex<Vec<String>>,
    /// Every metadata fetch, by transport.
    pub fetches: Mutex<Vec<String>>,
    /// Transports that swallow metadata requests without replying.
    pub quiet: Mutex<Vec<String>>,
    /// Latency applied to every reply.
    pub delay: Mutex<Duration>,
    pub hold: AtomicBool,
    pub held: Mutex<Vec<(String, Held)>>,
}

impl Network {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn answer(&self, endpoint: &str, transports: &[&str]) {
        self.answers.lock().insert(
            endpoint.to_string(),
            Answer {
                transports: transports.iter().map(|t| t.to_string()).collect(),
                source: None,
            },
        );
    }

    pub fn answer_from(&self, endpoint: &str, transports: &[&str], source: &str) {
        self.answers.lock().insert(
            endpoint.to_string(),
            Answer {
                transports: transports.iter().map(|t| t.to_string()).collect(),
                source: source.parse().ok(),
            },
        );
    }

    pub fn serve(&self, transport: &str, metadata: Metadata) {
        self.metadata.lock().insert(transport.to_string(), metadata);
    }

    pub fn resolve_count(&self) -> usize {
        self.resolves.lock().len()
    }

    /// Take the oldest held reply, waiting for one to show up.
    pub fn take_held(&self) -> (String, Held) {
        wait_until(|| !self.held.lock().is_empty());
        self.held.lock().remove(0)
    }
}

impl Messenger for Network {
    fn resolve(
        &self,
        endpoint: &EndpointReference,
        _hint: Option<&ResolvedAddress>,
        _scope: &SecurityKey,
        reply: Reply<Vec<ResolvedAddress>>,
    ) {
        self.resolves.lock().push(endpoint.address().to_string());
        if self.hold.load(Ordering::SeqCst) {
            self.held
                .lock()
                .push((endpoint.address().to_string(), reply));
            return;
        }

        let answer = self.answers.lock().get(endpoint.address()).cloned();
        let endpoint = endpoint.clone();
        let delay = *self.delay.lock();
        thread::spawn(move || {
            thread::sleep(delay);
            match answer {
                Some(answer) => {
                    let addresses = answer
                        .transports
                        .iter()
                        .map(|t| ResolvedAddress::new(endpoint.clone(), t.as_str()))
                        .collect();
                    let connection = answer.source.map(ConnectionInfo::from_remote).unwrap_or_default();
                    reply(Outcome::Match(addresses, connection));
                }
                None => reply(Outcome::Timeout(ConnectionInfo::default())),
            }
        });
    }

    fn fetch_metadata(&self, address: &ResolvedAddress, _scope: &SecurityKey, reply: Reply<Metadata>) {
        self.fetches.lock().push(address.transport().to_string());
        if self.quiet.lock().iter().any(|t| t == address.transport()) {
            return;
        }
        let served = self.metadata.lock().get(address.transport()).cloned();
        let delay = *self.delay.lock();
        thread::spawn(move || {
            thread::sleep(delay);
            match served {
                Some(metadata) => reply(Outcome::Match(metadata, ConnectionInfo::default())),
                None => reply(Outcome::TransportFailure(
                    "connection refused".into(),
                    ConnectionInfo::default(),
                )),
            }
        });
    }
}

/// Config with short waits and the given eviction capacity.
pub fn test_config(capacity: usize) -> LocusConfig {
    let mut config = LocusConfig::default();
    config.resolution.wait_attempts = 300;
    config.resolution.wait_interval_ms = 10;
    config.cache.max_service_references = capacity;
    config
}

/// Config whose coalesced waits give up after `attempts` × `interval_ms`.
pub fn short_wait_config(attempts: u32, interval_ms: u64) -> LocusConfig {
    let mut config = test_config(8);
    config.resolution.wait_attempts = attempts;
    config.resolution.wait_interval_ms = interval_ms;
    config
}

pub fn registry(network: &Arc<Network>, capacity: usize) -> Registry {
    Registry::new(network.clone(), Arc::new(AllowAll), &test_config(capacity))
}

pub fn epr(address: &str) -> EndpointReference {
    EndpointReference::from(address)
}

/// Spin until `cond` holds. Panics after five seconds.
pub fn wait_until(cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(1));
    }
}
