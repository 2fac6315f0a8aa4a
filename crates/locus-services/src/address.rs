//! Address resolution for a single reference.
//!
//! Holds the ordered list of transport addresses known for an endpoint and
//! hands out one "preferred" address at a time. When the list runs dry it
//! resolves the next queued identity through the [`Messenger`], coalescing
//! every concurrent caller onto a single outbound request.
//!
//! All state sits behind one per-reference mutex. The messenger is always
//! called with that mutex released.

use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::Arc;

use parking_lot::Mutex;

use locus_core::{
    EndpointReference, Messenger, Outcome, ResolveError, ResolvedAddress, SecurityKey,
};

use crate::sync::{Synchronizer, WaitError, WaitPolicy};

type Pending = Arc<Synchronizer<ResolvedAddress>>;

struct AddressState {
    /// Bumped on every invalidation. Never decreases.
    generation: u64,
    /// Known addresses, in the order they will be tried.
    candidates: Vec<ResolvedAddress>,
    /// Number of candidates already handed out.
    cursor: usize,
    preferred: Option<ResolvedAddress>,
    /// Identities that still need a resolve round-trip.
    unresolved: VecDeque<EndpointReference>,
    /// Current authoritative identity set.
    identities: Vec<EndpointReference>,
    /// Last address known to have reached the endpoint.
    hint: Option<ResolvedAddress>,
    pending: Option<Pending>,
    /// Identity the pending resolve was sent for.
    in_flight: Option<EndpointReference>,
    disposed: bool,
}

impl AddressState {
    fn new(endpoint: &EndpointReference) -> Self {
        let mut state = Self {
            generation: 0,
            candidates: Vec::new(),
            cursor: 0,
            preferred: None,
            unresolved: VecDeque::new(),
            identities: Vec::new(),
            hint: None,
            pending: None,
            in_flight: None,
            disposed: false,
        };
        state.reseed(std::slice::from_ref(endpoint), None);
        state
    }

    fn reseed(&mut self, endpoints: &[EndpointReference], via: Option<&ResolvedAddress>) {
        self.candidates.clear();
        self.cursor = 0;
        self.preferred = None;
        self.unresolved.clear();
        self.in_flight = None;
        self.identities = endpoints.to_vec();
        self.hint = via.cloned();

        if let Some(via) = via {
            if endpoints.contains(via.endpoint()) {
                self.candidates.push(via.clone());
            }
        }
        for endpoint in endpoints {
            if endpoint.is_transport() {
                let direct = ResolvedAddress::direct(endpoint);
                if !self.candidates.contains(&direct) {
                    self.candidates.push(direct);
                }
            } else {
                self.unresolved.push_back(endpoint.clone());
            }
        }
    }

    fn is_current(&self, sync: &Pending) -> bool {
        sync.generation() == self.generation
            && self.pending.as_ref().is_some_and(|p| Arc::ptr_eq(p, sync))
    }

    /// The preferred address, adopting the next unused candidate if needed.
    fn current_or_next(&mut self) -> Option<ResolvedAddress> {
        if let Some(address) = &self.preferred {
            return Some(address.clone());
        }
        let next = self.candidates.get(self.cursor)?.clone();
        self.cursor += 1;
        self.preferred = Some(next.clone());
        Some(next)
    }

    /// Merge newly observed addresses. Addresses on the same subnet as
    /// `source` go ahead of the remaining unused candidates.
    fn merge(&mut self, addresses: Vec<ResolvedAddress>, source: Option<IpAddr>) -> usize {
        let mut insert_at = self.cursor;
        let mut added = 0;
        for address in addresses {
            if let Some(existing) = self.candidates.iter_mut().find(|c| **c == address) {
                existing.merge_protocol(address.protocol());
                continue;
            }
            if source.is_some_and(|ip| address.same_subnet(ip)) {
                self.candidates.insert(insert_at, address);
                insert_at += 1;
            } else {
                self.candidates.push(address);
            }
            added += 1;
        }
        added
    }
}

/// Per-reference address resolver.
pub struct AddressResolver {
    endpoint: EndpointReference,
    scope: SecurityKey,
    messenger: Arc<dyn Messenger>,
    wait: WaitPolicy,
    state: Mutex<AddressState>,
}

impl AddressResolver {
    pub fn new(
        endpoint: EndpointReference,
        scope: SecurityKey,
        messenger: Arc<dyn Messenger>,
        wait: WaitPolicy,
    ) -> Arc<Self> {
        let state = AddressState::new(&endpoint);
        Arc::new(Self {
            endpoint,
            scope,
            messenger,
            wait,
            state: Mutex::new(state),
        })
    }

    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    /// The preferred address, if one is already chosen. Never resolves.
    pub fn cached(&self) -> Option<ResolvedAddress> {
        self.state.lock().preferred.clone()
    }

    /// Snapshot of every known candidate, in trial order.
    pub fn candidates(&self) -> Vec<ResolvedAddress> {
        self.state.lock().candidates.clone()
    }

    /// The identity set addresses are currently resolved from.
    pub fn identities(&self) -> Vec<EndpointReference> {
        self.state.lock().identities.clone()
    }

    /// Return the preferred address, resolving one if necessary.
    ///
    /// Blocks while a resolution is outstanding. Concurrent callers share
    /// that resolution rather than issuing their own.
    pub fn preferred(self: &Arc<Self>) -> Result<ResolvedAddress, ResolveError> {
        loop {
            let sync = {
                let mut state = self.state.lock();
                if state.disposed {
                    return Err(ResolveError::Disposed(self.endpoint.to_string()));
                }
                if let Some(address) = state.current_or_next() {
                    return Ok(address);
                }
                if let Some(sync) = state.pending.clone() {
                    sync
                } else if let Some(next) = state.unresolved.pop_front() {
                    let sync = Arc::new(Synchronizer::new(state.generation));
                    state.pending = Some(sync.clone());
                    state.in_flight = Some(next.clone());
                    let hint = state.hint.clone();
                    drop(state);
                    self.send_resolve(next, hint, sync.clone());
                    sync
                } else {
                    tracing::debug!(endpoint = %self.endpoint, "no candidate address left");
                    return Err(ResolveError::Exhausted(self.endpoint.to_string()));
                }
            };

            match sync.wait(self.wait) {
                Ok(_) | Err(WaitError::Abandoned) => continue,
                Err(WaitError::Failed(_)) if sync.generation() != self.generation() => continue,
                Err(WaitError::Failed(e)) => return Err(e),
                Err(WaitError::TimedOut) => {
                    self.give_up(&sync);
                    return Err(ResolveError::Timeout(self.endpoint.to_string()));
                }
            }
        }
    }

    /// Report that `failed` could not be reached.
    ///
    /// Returns `Ok(None)` when `generation` is stale: the candidate set has
    /// been replaced since the caller obtained the address, and the caller
    /// should start over from [`preferred`](Self::preferred).
    pub fn report_failure(
        self: &Arc<Self>,
        failed: &ResolvedAddress,
        generation: u64,
    ) -> Result<Option<ResolvedAddress>, ResolveError> {
        {
            let mut state = self.state.lock();
            if generation != state.generation {
                tracing::debug!(
                    endpoint = %self.endpoint,
                    reported = generation,
                    current = state.generation,
                    "ignoring failure report from stale generation"
                );
                return Ok(None);
            }
            if state.preferred.as_ref() == Some(failed) {
                state.preferred = None;
                tracing::debug!(endpoint = %self.endpoint, address = %failed, "address failed, trying next");
            }
        }
        self.preferred().map(Some)
    }

    /// Merge addresses learned from discovery traffic.
    ///
    /// If a resolution is outstanding and a usable candidate now exists,
    /// its waiters are released with it.
    pub fn add_candidates(&self, addresses: Vec<ResolvedAddress>) -> usize {
        let mut state = self.state.lock();
        let added = state.merge(addresses, None);
        if added > 0 && state.pending.is_some() {
            if let Some(address) = state.current_or_next() {
                if let Some(sync) = state.pending.take() {
                    // Its reply will be dropped, so the identity goes back in the queue.
                    if let Some(target) = state.in_flight.take() {
                        state.unresolved.push_front(target);
                    }
                    drop(state);
                    sync.complete(Ok(address));
                }
            }
        }
        added
    }

    /// Replace the candidate set after an authoritative change.
    ///
    /// Bumps the generation, so completions and failure reports from before
    /// the call are ignored. `via` is the address the update arrived over;
    /// if it is still part of `endpoints` it is tried first.
    pub fn invalidate(&self, endpoints: &[EndpointReference], via: Option<&ResolvedAddress>) -> u64 {
        let (generation, abandoned) = {
            let mut state = self.state.lock();
            state.generation += 1;
            let abandoned = state.pending.take();
            state.reseed(endpoints, via);
            (state.generation, abandoned)
        };
        tracing::debug!(endpoint = %self.endpoint, generation, "address set invalidated");
        if let Some(sync) = abandoned {
            sync.abandon();
        }
        generation
    }

    /// Stop serving addresses. Outstanding waiters are released.
    pub(crate) fn dispose(&self) {
        let abandoned = {
            let mut state = self.state.lock();
            state.disposed = true;
            state.pending.take()
        };
        if let Some(sync) = abandoned {
            sync.abandon();
        }
    }

    fn send_resolve(
        self: &Arc<Self>,
        target: EndpointReference,
        hint: Option<ResolvedAddress>,
        sync: Pending,
    ) {
        tracing::debug!(
            endpoint = %self.endpoint,
            target = %target,
            generation = sync.generation(),
            scope = %self.scope.short_id(),
            "sending resolve request"
        );
        let resolver = Arc::downgrade(self);
        let callback_sync = sync.clone();
        self.messenger.resolve(
            &target,
            hint.as_ref(),
            &self.scope,
            Box::new(move |outcome: Outcome<Vec<ResolvedAddress>>| {
                if let Some(resolver) = resolver.upgrade() {
                    resolver.on_resolved(&callback_sync, outcome);
                }
            }),
        );
    }

    fn on_resolved(self: &Arc<Self>, sync: &Pending, outcome: Outcome<Vec<ResolvedAddress>>) {
        let mut state = self.state.lock();
        if !state.is_current(sync) {
            tracing::trace!(
                endpoint = %self.endpoint,
                generation = sync.generation(),
                "dropping stale resolve completion"
            );
            return;
        }

        let kind = outcome.kind();
        if let Outcome::Match(addresses, connection) = outcome {
            let added = state.merge(addresses, connection.remote);
            tracing::debug!(endpoint = %self.endpoint, added, "resolve matched");
            if let Some(address) = state.current_or_next() {
                state.pending = None;
                state.in_flight = None;
                drop(state);
                sync.complete(Ok(address));
                return;
            }
        } else {
            tracing::debug!(endpoint = %self.endpoint, outcome = kind, "resolve attempt failed");
        }

        // Nothing usable yet: retransmit on the same synchronizer, waiters stay asleep.
        let next = state.unresolved.pop_front();
        match next {
            Some(next) => {
                state.in_flight = Some(next.clone());
                let hint = state.hint.clone();
                drop(state);
                self.send_resolve(next, hint, sync.clone());
            }
            None => {
                state.pending = None;
                state.in_flight = None;
                drop(state);
                tracing::debug!(endpoint = %self.endpoint, "resolution exhausted");
                sync.complete(Err(ResolveError::Exhausted(self.endpoint.to_string())));
            }
        }
    }

    /// Drop a synchronizer that outlived its wait bound. The identity it was
    /// resolving is queued again, so the next caller sends a fresh request
    /// instead of waiting on a lost callback.
    fn give_up(&self, sync: &Pending) {
        let mut state = self.state.lock();
        if state.is_current(sync) {
            state.pending = None;
            if let Some(target) = state.in_flight.take() {
                state.unresolved.push_front(target);
            }
        }
        drop(state);
        tracing::warn!(endpoint = %self.endpoint, "resolve wait timed out");
        sync.complete(Err(ResolveError::Timeout(self.endpoint.to_string())));
    }
}
