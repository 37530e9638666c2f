//! Core identity, message, and agent-loop types for the Accord
//! agent-communication fabric.
//!
//! This crate defines the pieces that do not depend on a particular
//! registry or hub implementation:
//!
//! - [`identity`]: DID-shaped key-pair identities, signing, and verification
//! - [`message`]: immutable, signed messages exchanged between agents
//! - [`model`]: capabilities, skills, and agent registration records
//! - [`agent`]: the agent loop, conversation bookkeeping, and cooldown state
//!
//! [`accord_engine`](https://docs.rs/accord_engine) implements the registry
//! and hub that route messages between [`agent::Agent`] instances;
//! [`accord_vector`](https://docs.rs/accord_vector) implements semantic
//! capability discovery on top of the [`model::EmbeddingModel`] contract
//! defined here.

pub mod agent;
pub mod error;
pub mod identity;
pub mod message;
pub mod model;

/// A type alias for a boxed error that is thread-safe and sendable across threads.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub use agent::{Agent, AgentConfig, ConversationState, ProcessMessage, Reply, RoutingClient};
pub use error::{AgentError, IdentityError};
pub use identity::{AgentIdentity, VerificationStatus};
pub use message::{Message, MessageType, Metadata, ProtocolVersion};
pub use model::{
    AgentProfile, AgentRegistration, AgentType, Capability, EmbeddingModel, InteractionMode, Skill,
};
