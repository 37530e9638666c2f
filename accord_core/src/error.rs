//! Error kinds for identity operations and the agent loop.
//!
//! Each concern gets its own `thiserror`-derived enum rather than one
//! flat error type, so callers can match on the failure mode that is
//! actually relevant to them; all of them convert freely into
//! [`crate::BoxError`] for trait-object boundaries.

use thiserror::Error;

/// Failures from [`crate::identity`] key generation, signing, and verification.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("identity has no private key to sign with")]
    NoPrivateKey,

    #[error("unsupported DID format: {0}")]
    UnsupportedDid(String),

    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("signing failed: {0}")]
    Signing(String),
}

/// Failures surfaced by the agent loop ([`crate::agent::Agent`]).
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent is not bound to a hub")]
    NoHub,

    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error("message routing failed: {0}")]
    Routing(String),
}
