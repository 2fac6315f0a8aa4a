//! locus-core — identity and address model, error taxonomy, the messaging
//! boundary, and configuration. All other Locus crates depend on this one.

pub mod config;
pub mod endpoint;
pub mod error;
pub mod messaging;
pub mod metadata;

pub use endpoint::{
    CredentialInfo, EndpointReference, Location, ProtocolInfo, ResolvedAddress, SecurityKey,
};
pub use error::ResolveError;
pub use messaging::{ConnectionInfo, Messenger, Outcome, Reply};
pub use metadata::{HostedService, Metadata};
