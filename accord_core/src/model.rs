//! Capabilities, skills, and agent registration records.

use std::collections::BTreeMap;
use std::future::Future;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::identity::AgentIdentity;
use crate::BoxError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    Human,
    Ai,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionMode {
    HumanToAgent,
    AgentToAgent,
}

/// A named, described operation an agent advertises as directly invocable.
/// `name` is unique within a single registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capability {
    pub name: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<BTreeMap<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<BTreeMap<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// A described competency an agent advertises for discovery but does not
/// expose as a directly invocable entry point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Skill {
    pub name: String,
    pub description: String,
}

/// The advertisable subset of an [`AgentRegistration`] — what discovery and
/// indexing need, without the full registration's bookkeeping fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentProfile {
    pub agent_type: AgentType,
    pub interaction_modes: Vec<InteractionMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub organization: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub developer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub capabilities: Vec<Capability>,
    pub skills: Vec<Skill>,
    pub examples: Vec<String>,
    pub tags: Vec<String>,
    pub auth_schemes: Vec<String>,
    pub default_input_modes: Vec<String>,
    pub default_output_modes: Vec<String>,
}

/// A complete, registrable agent record. `agent_id` is the registry's
/// primary key; `capabilities[*].name` is unique within this record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRegistration {
    pub agent_id: String,
    pub profile: AgentProfile,
    pub identity: AgentIdentity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_address: Option<String>,
    pub custom_metadata: BTreeMap<String, Value>,
    pub registered_at: DateTime<Utc>,
}

impl AgentRegistration {
    /// Every capability name in this registration must be unique;
    /// violating this is a caller bug, not a runtime condition to recover
    /// from, so it is a debug assertion checked at construction sites in
    /// tests rather than a `Result`-returning validator here.
    pub fn has_unique_capability_names(&self) -> bool {
        let mut seen = std::collections::HashSet::new();
        self.profile
            .capabilities
            .iter()
            .all(|c| seen.insert(c.name.as_str()))
    }
}

/// Contract for an external embedding provider. The actual model is an
/// out-of-scope collaborator (see the workspace-level Non-goals); this
/// crate only defines the shape callers in `accord_vector` depend on.
pub trait EmbeddingModel: Send + Sync {
    fn embed_query(&self, text: &str) -> impl Future<Output = Result<Vec<f32>, BoxError>> + Send;

    fn embed_documents(
        &self,
        texts: &[String],
    ) -> impl Future<Output = Result<Vec<Vec<f32>>, BoxError>> + Send;
}

/// Object-safe counterpart of [`EmbeddingModel`] for storing behind `Arc<dyn _>`.
pub trait EmbeddingModelDyn: Send + Sync {
    fn embed_query_dyn(
        &self,
        text: String,
    ) -> std::pin::Pin<Box<dyn Future<Output = Result<Vec<f32>, BoxError>> + Send + '_>>;

    fn embed_documents_dyn(
        &self,
        texts: Vec<String>,
    ) -> std::pin::Pin<Box<dyn Future<Output = Result<Vec<Vec<f32>>, BoxError>> + Send + '_>>;
}

impl<T: EmbeddingModel> EmbeddingModelDyn for T {
    fn embed_query_dyn(
        &self,
        text: String,
    ) -> std::pin::Pin<Box<dyn Future<Output = Result<Vec<f32>, BoxError>> + Send + '_>> {
        Box::pin(async move { self.embed_query(&text).await })
    }

    fn embed_documents_dyn(
        &self,
        texts: Vec<String>,
    ) -> std::pin::Pin<Box<dyn Future<Output = Result<Vec<Vec<f32>>, BoxError>> + Send + '_>> {
        Box::pin(async move { self.embed_documents(&texts).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_capability(name: &str) -> Capability {
        Capability {
            name: name.to_string(),
            description: "does a thing".to_string(),
            input_schema: None,
            output_schema: None,
            version: None,
        }
    }

    #[test]
    fn detects_duplicate_capability_names() {
        let identity = AgentIdentity::create_key_based().unwrap();
        let reg = AgentRegistration {
            agent_id: "a1".to_string(),
            profile: AgentProfile {
                agent_type: AgentType::Ai,
                interaction_modes: vec![InteractionMode::AgentToAgent],
                name: None,
                summary: None,
                description: None,
                version: None,
                organization: None,
                developer: None,
                url: None,
                capabilities: vec![sample_capability("dup"), sample_capability("dup")],
                skills: vec![],
                examples: vec![],
                tags: vec![],
                auth_schemes: vec![],
                default_input_modes: vec![],
                default_output_modes: vec![],
            },
            identity,
            payment_address: None,
            custom_metadata: BTreeMap::new(),
            registered_at: Utc::now(),
        };
        assert!(!reg.has_unique_capability_names());
    }
}
