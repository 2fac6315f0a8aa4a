//! Metadata resolution for a single reference.
//!
//! Same coalescing shape as [`AddressResolver`], one layer up: the first
//! caller to find no usable metadata becomes the driver of a fetch, every
//! later caller waits on the driver's synchronizer. The driver walks the
//! address resolver's candidates until a fetch succeeds or they run out.
//!
//! Messenger callbacks only complete a per-attempt synchronizer. Retries
//! happen on the driving caller's thread, so collaborator threads never block.

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;

use locus_core::{
    EndpointReference, Messenger, Metadata, Outcome, ResolveError, ResolvedAddress, SecurityKey,
};

use crate::address::AddressResolver;
use crate::sync::{Synchronizer, WaitError, WaitPolicy};
use crate::trust::AccessPolicy;

/// Lifecycle of the proxy built from a reference's metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// No metadata has been applied yet.
    New,
    /// Metadata is known to be outdated.
    NeedsUpdate,
    UpToDate,
}

/// What callers may rely on, built from applied metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proxy {
    capabilities: BTreeSet<String>,
    version: u64,
}

impl Proxy {
    fn build(metadata: &Metadata) -> Self {
        Self {
            capabilities: metadata.capabilities.clone(),
            version: metadata.version,
        }
    }

    pub fn capabilities(&self) -> &BTreeSet<String> {
        &self.capabilities
    }

    pub fn version(&self) -> u64 {
        self.version
    }
}

/// Effect of a fetch applied by the driving caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetadataChange {
    /// First metadata ever applied to this reference.
    pub first: bool,
    /// Capabilities were lost, so the proxy was discarded and rebuilt.
    pub proxy_rebuilt: bool,
    /// The authoritative endpoint set changed and addresses were invalidated.
    pub endpoints_changed: bool,
}

type Pending = Arc<Synchronizer<Arc<Metadata>>>;

/// Consecutive wait bounds without driver progress before a waiter gives up.
const STALL_LIMIT: u32 = 2;

struct MetadataState {
    lifecycle: Lifecycle,
    current: Option<Arc<Metadata>>,
    proxy: Option<Proxy>,
    /// Bumped by `mark_stale`; fetches begun earlier are not applied.
    epoch: u64,
    pending: Option<Pending>,
    /// Bumped by the driver at every step, so waiters can tell a slow fetch
    /// from a stalled one.
    progress: u64,
    disposed: bool,
}

/// Per-reference metadata resolver.
pub struct MetadataResolver {
    endpoint: EndpointReference,
    scope: SecurityKey,
    addresses: Arc<AddressResolver>,
    messenger: Arc<dyn Messenger>,
    policy: Arc<dyn AccessPolicy>,
    wait: WaitPolicy,
    state: Mutex<MetadataState>,
}

impl MetadataResolver {
    pub fn new(
        endpoint: EndpointReference,
        scope: SecurityKey,
        addresses: Arc<AddressResolver>,
        messenger: Arc<dyn Messenger>,
        policy: Arc<dyn AccessPolicy>,
        wait: WaitPolicy,
    ) -> Self {
        Self {
            endpoint,
            scope,
            addresses,
            messenger,
            policy,
            wait,
            state: Mutex::new(MetadataState {
                lifecycle: Lifecycle::New,
                current: None,
                proxy: None,
                epoch: 0,
                pending: None,
                progress: 0,
                disposed: false,
            }),
        }
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.state.lock().lifecycle
    }

    /// Last applied metadata, without fetching.
    pub fn current(&self) -> Option<Arc<Metadata>> {
        self.state.lock().current.clone()
    }

    pub fn proxy(&self) -> Option<Proxy> {
        self.state.lock().proxy.clone()
    }

    /// Up-to-date metadata, fetching it if necessary.
    pub fn get(&self) -> Result<Arc<Metadata>, ResolveError> {
        self.fetch().map(|(metadata, _)| metadata)
    }

    /// Like [`get`](Self::get), but also reports what changed when this
    /// call was the one that applied a fresh fetch.
    pub fn fetch(&self) -> Result<(Arc<Metadata>, Option<MetadataChange>), ResolveError> {
        loop {
            let (sync, epoch, driver) = {
                let mut state = self.state.lock();
                if state.disposed {
                    return Err(ResolveError::Disposed(self.endpoint.to_string()));
                }
                if state.lifecycle == Lifecycle::UpToDate {
                    if let Some(metadata) = &state.current {
                        return Ok((metadata.clone(), None));
                    }
                }
                match state.pending.clone() {
                    Some(sync) => (sync, state.epoch, false),
                    None => {
                        let sync = Arc::new(Synchronizer::new(state.epoch));
                        state.pending = Some(sync.clone());
                        (sync, state.epoch, true)
                    }
                }
            };

            if driver {
                let result = match self.drive(epoch) {
                    Ok(Some(fetched)) => Ok(fetched),
                    Ok(None) => {
                        // Superseded by mark_stale or dispose: start over.
                        self.clear_pending(&sync);
                        sync.abandon();
                        continue;
                    }
                    Err(e) => Err(e),
                };
                // Settle before clearing, so a cleared slot always means a settled one.
                match &result {
                    Ok((metadata, _)) => sync.complete(Ok(metadata.clone())),
                    Err(e) => sync.complete(Err(e.clone())),
                }
                self.clear_pending(&sync);
                return result;
            }

            if let Some(metadata) = self.follow(&sync)? {
                return Ok((metadata, None));
            }
        }
    }

    /// Wait on a fetch another caller is driving. `None` means start over.
    ///
    /// The wait is re-armed for as long as the driver keeps stepping through
    /// addresses. A driver that shows no progress for `STALL_LIMIT` bounds
    /// in a row is given up on.
    fn follow(&self, sync: &Pending) -> Result<Option<Arc<Metadata>>, ResolveError> {
        let mut progress = self.state.lock().progress;
        let mut idle = 0;
        loop {
            match sync.wait(self.wait) {
                Ok(metadata) => return Ok(Some(metadata)),
                Err(WaitError::Abandoned) => return Ok(None),
                Err(WaitError::Failed(e)) => return Err(e),
                Err(WaitError::TimedOut) => {}
            }

            let state = self.state.lock();
            if !state.pending.as_ref().is_some_and(|p| Arc::ptr_eq(p, sync)) {
                return Ok(None);
            }
            if state.progress != progress {
                progress = state.progress;
                idle = 0;
                continue;
            }
            idle += 1;
            if idle >= STALL_LIMIT {
                drop(state);
                tracing::warn!(endpoint = %self.endpoint, "metadata fetch stalled, giving up");
                return Err(ResolveError::Timeout(self.endpoint.to_string()));
            }
        }
    }

    /// Record that the driver moved on to a new step.
    fn step(&self) {
        self.state.lock().progress += 1;
    }

    fn clear_pending(&self, sync: &Pending) {
        let mut state = self.state.lock();
        if state.pending.as_ref().is_some_and(|p| Arc::ptr_eq(p, sync)) {
            state.pending = None;
        }
    }

    /// Flag the metadata as outdated. The next `get` refetches.
    pub fn mark_stale(&self) {
        let abandoned = {
            let mut state = self.state.lock();
            state.epoch += 1;
            if state.lifecycle == Lifecycle::UpToDate {
                state.lifecycle = Lifecycle::NeedsUpdate;
            }
            state.pending.take()
        };
        tracing::debug!(endpoint = %self.endpoint, "metadata marked stale");
        if let Some(sync) = abandoned {
            sync.abandon();
        }
    }

    pub(crate) fn dispose(&self) {
        let abandoned = {
            let mut state = self.state.lock();
            state.disposed = true;
            state.proxy = None;
            state.pending.take()
        };
        if let Some(sync) = abandoned {
            sync.abandon();
        }
    }

    /// Fetch from successive candidates until one answers.
    ///
    /// `Ok(None)` means the fetch was superseded before it could be applied.
    fn drive(
        &self,
        epoch: u64,
    ) -> Result<Option<(Arc<Metadata>, Option<MetadataChange>)>, ResolveError> {
        let mut address = self.addresses.preferred()?;
        let mut generation = self.addresses.generation();

        loop {
            self.step();
            let attempt = Arc::new(Synchronizer::new(generation));
            self.send_fetch(&address, attempt.clone());

            let reason = match attempt.wait(self.wait) {
                Ok(metadata) => return self.apply(epoch, metadata, &address),
                Err(WaitError::Failed(ResolveError::Transport { reason, .. })) => reason,
                Err(WaitError::Failed(e)) => return Err(e),
                Err(WaitError::TimedOut) | Err(WaitError::Abandoned) => "no response".to_string(),
            };
            tracing::debug!(
                endpoint = %self.endpoint,
                address = %address,
                reason = %reason,
                "metadata fetch failed, trying next address"
            );

            self.step();
            address = match self.addresses.report_failure(&address, generation) {
                Ok(Some(next)) => next,
                Ok(None) => self.addresses.preferred()?,
                Err(ResolveError::Exhausted(_)) => {
                    // Every fallback is used up; surface the last transport error.
                    return Err(ResolveError::Transport {
                        endpoint: self.endpoint.to_string(),
                        reason,
                    });
                }
                Err(e) => return Err(e),
            };
            generation = self.addresses.generation();
        }
    }

    fn send_fetch(&self, address: &ResolvedAddress, attempt: Pending) {
        let endpoint = self.endpoint.to_string();
        self.messenger.fetch_metadata(
            address,
            &self.scope,
            Box::new(move |outcome: Outcome<Metadata>| {
                let result = match outcome {
                    Outcome::Match(metadata, _) => Ok(Arc::new(metadata)),
                    Outcome::Fault(reason, _) => Err(format!("fault: {reason}")),
                    Outcome::Malformed(reason, _) => Err(format!("malformed response: {reason}")),
                    Outcome::TransportFailure(reason, _) => Err(reason),
                    Outcome::Timeout(_) => Err("timed out".to_string()),
                };
                attempt.complete(result.map_err(|reason| ResolveError::Transport {
                    endpoint: endpoint.clone(),
                    reason,
                }));
            }),
        );
    }

    fn apply(
        &self,
        epoch: u64,
        metadata: Arc<Metadata>,
        via: &ResolvedAddress,
    ) -> Result<Option<(Arc<Metadata>, Option<MetadataChange>)>, ResolveError> {
        self.policy.check(&self.endpoint, &self.scope, &metadata)?;

        let mut change = MetadataChange::default();
        {
            let mut state = self.state.lock();
            if state.epoch != epoch || state.disposed {
                tracing::debug!(endpoint = %self.endpoint, "discarding metadata from superseded fetch");
                return Ok(None);
            }
            change.first = state.current.is_none();

            if let Some(proxy) = &state.proxy {
                if !metadata.covers(&proxy.capabilities) {
                    tracing::info!(
                        endpoint = %self.endpoint,
                        version = metadata.version,
                        "capabilities withdrawn, rebuilding proxy"
                    );
                    state.proxy = None;
                    state.lifecycle = Lifecycle::NeedsUpdate;
                    change.proxy_rebuilt = true;
                }
            }
            state.proxy = Some(Proxy::build(&metadata));
            state.lifecycle = Lifecycle::UpToDate;
            state.current = Some(metadata.clone());
        }

        if !metadata.endpoints.is_empty()
            && !same_endpoints(&metadata.endpoints, &self.addresses.identities())
        {
            self.addresses.invalidate(&metadata.endpoints, Some(via));
            change.endpoints_changed = true;
        }

        tracing::debug!(
            endpoint = %self.endpoint,
            version = metadata.version,
            capabilities = metadata.capabilities.len(),
            "metadata applied"
        );
        Ok(Some((metadata, Some(change))))
    }
}

fn same_endpoints(a: &[EndpointReference], b: &[EndpointReference]) -> bool {
    a.len() == b.len() && a.iter().all(|e| b.contains(e))
}
