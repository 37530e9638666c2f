//! Registry, capability discovery, interaction control, and communication
//! hub for the Accord agent-communication fabric.

pub mod error;
pub mod hub;
pub mod interaction;
pub mod registry;

pub use error::{HubError, RegistryError};
pub use hub::{CollaborationResult, Hub};
pub use interaction::{CooldownCallback, InteractionControl, InteractionResult, TokenConfig};
pub use registry::{index::CapabilityIndex, Registry, RegistrationUpdate};
