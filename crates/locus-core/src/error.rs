//! Errors surfaced to callers of the resolution layer.
//!
//! Retries (candidate cycling, retransmission, lock contention) are handled
//! internally and never show up here. What does show up is terminal.

/// Terminal failure of an address or metadata resolution.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    /// Every candidate address failed and no unresolved identity is left.
    #[error("no reachable address left for {0}")]
    Exhausted(String),

    /// A local policy check rejected access. Never retried.
    #[error("access to {0} denied by local policy")]
    AuthorizationDenied(String),

    /// The collaborator reported a transport failure that no fallback could cover.
    #[error("transport failure talking to {endpoint}: {reason}")]
    Transport { endpoint: String, reason: String },

    /// A coalesced wait outlived its bound without a completion arriving.
    #[error("timed out waiting for {0}")]
    Timeout(String),

    /// The reference was disposed while the caller was using it.
    #[error("reference for {0} has been disposed")]
    Disposed(String),
}
