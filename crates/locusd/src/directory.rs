//! Static directory: answers resolve and metadata requests from the
//! endpoint table in the config file.
//!
//! Replies run as tokio tasks, so callbacks arrive on runtime worker threads
//! just as they would from a network messenger.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::runtime::Handle;

use locus_core::config::{DirectoryConfig, DirectoryEntry};
use locus_core::{
    ConnectionInfo, EndpointReference, HostedService, Messenger, Metadata, Outcome, Reply,
    ResolvedAddress, SecurityKey,
};

pub struct StaticDirectory {
    runtime: Handle,
    entries: HashMap<String, DirectoryEntry>,
    /// Transport URI → owning endpoint address.
    transports: HashMap<String, String>,
}

impl StaticDirectory {
    pub fn new(runtime: Handle, config: &DirectoryConfig) -> Arc<Self> {
        let mut entries = HashMap::new();
        let mut transports = HashMap::new();
        for entry in &config.endpoints {
            for transport in &entry.transports {
                transports.insert(transport.clone(), entry.address.clone());
            }
            entries.insert(entry.address.clone(), entry.clone());
        }
        tracing::info!(
            endpoints = entries.len(),
            transports = transports.len(),
            "static directory loaded"
        );
        Arc::new(Self {
            runtime,
            entries,
            transports,
        })
    }

    fn reply<T: Send + 'static>(&self, reply: Reply<T>, outcome: Outcome<T>) {
        self.runtime.spawn(async move { reply(outcome) });
    }

    fn metadata_for(&self, entry: &DirectoryEntry) -> Metadata {
        let hosted = entry
            .hosted
            .iter()
            .map(|address| HostedService {
                service_id: address.clone(),
                endpoints: vec![EndpointReference::new(address.as_str())],
                capabilities: self
                    .entries
                    .get(address)
                    .map(|e| e.capabilities.iter().cloned().collect())
                    .unwrap_or_default(),
            })
            .collect();
        Metadata {
            capabilities: entry.capabilities.iter().cloned().collect(),
            endpoints: Vec::new(),
            version: entry.version,
            hosted,
        }
    }
}

impl Messenger for StaticDirectory {
    fn resolve(
        &self,
        endpoint: &EndpointReference,
        _hint: Option<&ResolvedAddress>,
        scope: &SecurityKey,
        reply: Reply<Vec<ResolvedAddress>>,
    ) {
        let outcome = match self.entries.get(endpoint.address()) {
            Some(entry) if !entry.transports.is_empty() => {
                let addresses: Vec<_> = entry
                    .transports
                    .iter()
                    .map(|t| ResolvedAddress::new(endpoint.clone(), t.as_str()))
                    .collect();
                let connection = addresses
                    .first()
                    .and_then(ResolvedAddress::host_ip)
                    .map(ConnectionInfo::from_remote)
                    .unwrap_or_default();
                Outcome::Match(addresses, connection)
            }
            _ => Outcome::Timeout(ConnectionInfo::default()),
        };
        tracing::debug!(endpoint = %endpoint, scope = %scope.short_id(), outcome = outcome.kind(), "directory resolve");
        self.reply(reply, outcome);
    }

    fn fetch_metadata(&self, address: &ResolvedAddress, _scope: &SecurityKey, reply: Reply<Metadata>) {
        let connection = address
            .host_ip()
            .map(ConnectionInfo::from_remote)
            .unwrap_or_default();
        let owner = self
            .transports
            .get(address.transport())
            .and_then(|owner| self.entries.get(owner));
        let outcome = match owner {
            Some(entry) => Outcome::Match(self.metadata_for(entry), connection),
            None => Outcome::TransportFailure(
                format!("no listener at {}", address.transport()),
                connection,
            ),
        };
        self.reply(reply, outcome);
    }
}
