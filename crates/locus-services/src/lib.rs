//! locus-services — resolution and lifecycle of device and service references.
//!
//! [`Registry`] hands out the canonical [`Reference`] for an endpoint and
//! scope. Each reference owns an [`AddressResolver`] and a
//! [`MetadataResolver`]; remote services without a parent device are kept in
//! a bounded [`EvictionCache`].

pub mod address;
pub mod eviction;
pub mod metadata;
pub mod reference;
pub mod registry;
mod sync;
pub mod trust;

pub use address::AddressResolver;
pub use eviction::EvictionCache;
pub use metadata::{Lifecycle, MetadataChange, MetadataResolver, Proxy};
pub use reference::{Reference, ReferenceId, ReferenceKind};
pub use registry::{Registry, ReferenceListener};
pub use sync::WaitPolicy;
pub use trust::{AccessPolicy, AllowAll, TrustLevel, TrustRegistry, TrustStoreError};
