//! Error kinds for the registry, interaction control, and communication hub.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    Vector(#[from] accord_core::BoxError),
}

/// Behavioral categories from the routing contract: security failures are
/// fatal for the specific message and surfaced to the hub's caller; routing
/// failures are reported back as `route_message -> false` with no synthetic
/// reply.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("sender identity or message signature invalid")]
    Security,
}
