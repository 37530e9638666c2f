//! The agent registry: the single source of truth for who is registered,
//! their advertised capabilities, and their verification status.

pub mod index;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{Notify, RwLock};

use accord_core::identity::VerificationStatus;
use accord_core::model::{AgentRegistration, AgentType, Capability, InteractionMode, Skill};
use accord_vector::VectorDiscoveryService;

use self::index::CapabilityIndex;
use crate::error::RegistryError;

/// Whitelisted fields [`Registry::update_registration`] may touch. Anything
/// else in the caller's patch is ignored rather than rejected.
#[derive(Debug, Clone, Default)]
pub struct RegistrationUpdate {
    pub capabilities: Option<Vec<Capability>>,
    pub interaction_modes: Option<Vec<InteractionMode>>,
    pub default_input_modes: Option<Vec<String>>,
    pub default_output_modes: Option<Vec<String>>,
    pub payment_address: Option<Option<String>>,
    pub custom_metadata: Option<BTreeMap<String, Value>>,
    pub name: Option<Option<String>>,
    pub summary: Option<Option<String>>,
    pub description: Option<Option<String>>,
    pub version: Option<Option<String>>,
    pub organization: Option<Option<String>>,
    pub developer: Option<Option<String>>,
    pub url: Option<Option<String>>,
    pub auth_schemes: Option<Vec<String>>,
    pub skills: Option<Vec<Skill>>,
    pub examples: Option<Vec<String>>,
    pub tags: Option<Vec<String>>,
}

struct RegistryState {
    agents: HashMap<String, AgentRegistration>,
    index: CapabilityIndex,
}

/// Owns the index and agent map behind a single `RwLock`, per the
/// single-writer-discipline concurrency model. Never a singleton — tests
/// construct as many independent registries as they need.
pub struct Registry {
    state: RwLock<RegistryState>,
    discovery: Arc<VectorDiscoveryService>,
    ready: Notify,
    is_ready: std::sync::atomic::AtomicBool,
}

impl Registry {
    pub fn new(discovery: Arc<VectorDiscoveryService>) -> Arc<Self> {
        Arc::new(Self {
            state: RwLock::new(RegistryState {
                agents: HashMap::new(),
                index: CapabilityIndex::new(),
            }),
            discovery,
            ready: Notify::new(),
            is_ready: std::sync::atomic::AtomicBool::new(false),
        })
    }

    /// Runs the discovery service's initialization protocol once and fires
    /// the readiness signal, whether embedding setup succeeded or the
    /// service fell back to degraded mode.
    pub async fn initialize(&self) -> Result<(), RegistryError> {
        self.discovery.init().await.map_err(RegistryError::Vector)?;
        self.is_ready.store(true, std::sync::atomic::Ordering::SeqCst);
        self.ready.notify_waiters();
        Ok(())
    }

    /// Awaited by `register`/search calls so they never race initialization.
    pub async fn ready(&self) {
        if self.is_ready.load(std::sync::atomic::Ordering::SeqCst) {
            return;
        }
        self.ready.notified().await;
    }

    /// Rejects duplicate `agent_id`s. On success, inserts into the agent
    /// map, marks the identity verified, updates indexes, then updates
    /// vector embeddings — all as one logical step under the write lock.
    /// The registry is never left partially mutated on failure.
    pub async fn register(&self, mut registration: AgentRegistration) -> Result<bool, RegistryError> {
        self.ready().await;

        if !accord_core::identity::verify_identity_format(registration.identity.did()).await {
            return Ok(false);
        }

        let mut state = self.state.write().await;
        if state.agents.contains_key(&registration.agent_id) {
            return Ok(false);
        }

        registration.identity.reverify(VerificationStatus::Verified);
        state.index.insert(&registration);
        state.agents.insert(registration.agent_id.clone(), registration.clone());
        drop(state);

        if self.discovery.update_capability_embeddings(&registration).await.is_err() {
            let mut state = self.state.write().await;
            state.index.remove(&registration);
            state.agents.remove(&registration.agent_id);
            return Ok(false);
        }

        Ok(true)
    }

    /// Idempotent: a second call on an already-removed agent is a no-op
    /// that still returns `true`.
    pub async fn unregister(&self, agent_id: &str) -> bool {
        {
            let mut state = self.state.write().await;
            if let Some(registration) = state.agents.remove(agent_id) {
                state.index.remove(&registration);
            }
        }
        let _ = self.discovery.clear_agent_embeddings_cache(agent_id).await;
        true
    }

    pub async fn update_registration(
        &self,
        agent_id: &str,
        update: RegistrationUpdate,
    ) -> Option<AgentRegistration> {
        let (registration, capabilities_changed) = {
            let mut state = self.state.write().await;
            let existing = state.agents.get(agent_id)?.clone();
            state.index.remove(&existing);

            let mut updated = existing;
            let capabilities_changed = update.capabilities.is_some();
            if let Some(v) = update.capabilities {
                updated.profile.capabilities = v;
            }
            if let Some(v) = update.interaction_modes {
                updated.profile.interaction_modes = v;
            }
            if let Some(v) = update.default_input_modes {
                updated.profile.default_input_modes = v;
            }
            if let Some(v) = update.default_output_modes {
                updated.profile.default_output_modes = v;
            }
            if let Some(v) = update.payment_address {
                updated.payment_address = v;
            }
            if let Some(v) = update.custom_metadata {
                updated.custom_metadata = v;
            }
            if let Some(v) = update.name {
                updated.profile.name = v;
            }
            if let Some(v) = update.summary {
                updated.profile.summary = v;
            }
            if let Some(v) = update.description {
                updated.profile.description = v;
            }
            if let Some(v) = update.version {
                updated.profile.version = v;
            }
            if let Some(v) = update.organization {
                updated.profile.organization = v;
            }
            if let Some(v) = update.developer {
                updated.profile.developer = v;
            }
            if let Some(v) = update.url {
                updated.profile.url = v;
            }
            if let Some(v) = update.auth_schemes {
                updated.profile.auth_schemes = v;
            }
            if let Some(v) = update.skills {
                updated.profile.skills = v;
            }
            if let Some(v) = update.examples {
                updated.profile.examples = v;
            }
            if let Some(v) = update.tags {
                updated.profile.tags = v;
            }

            state.index.insert(&updated);
            state.agents.insert(agent_id.to_string(), updated.clone());
            (updated, capabilities_changed)
        };

        if capabilities_changed {
            let _ = self.discovery.update_capability_embeddings(&registration).await;
        }
        Some(registration)
    }

    /// Exact match first; if nothing matches, falls back to semantic search.
    pub async fn get_by_capability(
        &self,
        name: &str,
        limit: usize,
        threshold: f32,
    ) -> Vec<AgentRegistration> {
        self.ready().await;
        let exact = {
            let state = self.state.read().await;
            state.index.by_capability(name)
        };
        if !exact.is_empty() {
            return self.resolve(exact).await;
        }
        let ids = self
            .get_by_capability_semantic(name, limit, threshold, &HashMap::new())
            .await
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        self.resolve(ids).await
    }

    pub async fn get_by_capability_semantic(
        &self,
        query: &str,
        limit: usize,
        threshold: f32,
        filters: &HashMap<String, Vec<String>>,
    ) -> Vec<(String, f32)> {
        self.ready().await;
        self.discovery
            .find_by_capability_semantic(query, limit, threshold, filters)
            .await
            .unwrap_or_default()
    }

    pub async fn get_by_interaction_mode(&self, mode: InteractionMode) -> Vec<AgentRegistration> {
        let ids = self.state.read().await.index.by_mode(mode);
        self.resolve(ids).await
    }

    pub async fn get_by_organization(&self, org: &str) -> Vec<AgentRegistration> {
        let ids = self.state.read().await.index.by_org(org);
        self.resolve(ids).await
    }

    pub async fn get_by_owner(&self, developer: &str) -> Vec<AgentRegistration> {
        let ids = self.state.read().await.index.by_dev(developer);
        self.resolve(ids).await
    }

    pub async fn get_verified_agents(&self) -> Vec<AgentRegistration> {
        let ids = self.state.read().await.index.verified_agents.clone();
        self.resolve(ids).await
    }

    pub async fn get_all_capabilities(&self) -> Vec<String> {
        self.state.read().await.index.capabilities_by_name.keys().cloned().collect()
    }

    pub async fn get_all_agents(&self) -> Vec<AgentRegistration> {
        self.state.read().await.agents.values().cloned().collect()
    }

    pub async fn get_registration(&self, agent_id: &str) -> Option<AgentRegistration> {
        self.state.read().await.agents.get(agent_id).cloned()
    }

    pub async fn get_agent_type(&self, agent_id: &str) -> Option<AgentType> {
        self.state
            .read()
            .await
            .agents
            .get(agent_id)
            .map(|r| r.profile.agent_type)
    }

    /// Projection over C2: every capability name `agent_id` advertises.
    pub async fn get_capabilities_by_agent(&self, agent_id: &str) -> Vec<String> {
        self.state
            .read()
            .await
            .agents
            .get(agent_id)
            .map(|r| r.profile.capabilities.iter().map(|c| c.name.clone()).collect())
            .unwrap_or_default()
    }

    /// Projection over C2: every agent tagged `tag`.
    pub async fn get_agents_by_tag(&self, tag: &str) -> Vec<AgentRegistration> {
        self.state
            .read()
            .await
            .agents
            .values()
            .filter(|r| r.profile.tags.iter().any(|t| t == tag))
            .cloned()
            .collect()
    }

    async fn resolve(&self, ids: HashSet<String>) -> Vec<AgentRegistration> {
        let state = self.state.read().await;
        ids.into_iter().filter_map(|id| state.agents.get(&id).cloned()).collect()
    }
}
