//! Pluggable embedding/vector-store backend for semantic capability
//! discovery in the Accord agent-communication fabric.

pub mod backend;
pub mod discovery;
pub mod error;

pub use backend::{Filter, FilterClause, InMemoryBackend, QdrantBackend, ScoredPoint, VectorBackend, VectorPoint};
pub use discovery::VectorDiscoveryService;
pub use error::VectorError;
