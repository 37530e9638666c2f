//! In-memory secondary indexes over registered agents.
//!
//! Every update is driven from [`crate::registry::Registry`], which holds
//! the single writer lock this index lives behind — there is no locking
//! here of its own.

use std::collections::{HashMap, HashSet};

use accord_core::model::{AgentRegistration, InteractionMode};

#[derive(Debug, Default)]
pub struct CapabilityIndex {
    pub capabilities_by_name: HashMap<String, HashSet<String>>,
    pub by_interaction_mode: HashMap<InteractionMode, HashSet<String>>,
    pub by_organization: HashMap<String, HashSet<String>>,
    pub by_developer: HashMap<String, HashSet<String>>,
    pub verified_agents: HashSet<String>,
}

impl CapabilityIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `registration` into every applicable index.
    pub fn insert(&mut self, registration: &AgentRegistration) {
        let agent_id = registration.agent_id.clone();
        for cap in &registration.profile.capabilities {
            self.capabilities_by_name
                .entry(cap.name.clone())
                .or_default()
                .insert(agent_id.clone());
        }
        for mode in &registration.profile.interaction_modes {
            self.by_interaction_mode
                .entry(*mode)
                .or_default()
                .insert(agent_id.clone());
        }
        if let Some(org) = &registration.profile.organization {
            self.by_organization.entry(org.clone()).or_default().insert(agent_id.clone());
        }
        if let Some(dev) = &registration.profile.developer {
            self.by_developer.entry(dev.clone()).or_default().insert(agent_id.clone());
        }
        if registration.identity.verification_status() == accord_core::identity::VerificationStatus::Verified {
            self.verified_agents.insert(agent_id);
        }
    }

    /// Removes `registration` from every index it appears in, in one step.
    pub fn remove(&mut self, registration: &AgentRegistration) {
        let agent_id = registration.agent_id.as_str();
        for set in self.capabilities_by_name.values_mut() {
            set.remove(agent_id);
        }
        for set in self.by_interaction_mode.values_mut() {
            set.remove(agent_id);
        }
        for set in self.by_organization.values_mut() {
            set.remove(agent_id);
        }
        for set in self.by_developer.values_mut() {
            set.remove(agent_id);
        }
        self.verified_agents.remove(agent_id);
    }

    pub fn by_capability(&self, name: &str) -> HashSet<String> {
        self.capabilities_by_name.get(name).cloned().unwrap_or_default()
    }

    pub fn by_mode(&self, mode: InteractionMode) -> HashSet<String> {
        self.by_interaction_mode.get(&mode).cloned().unwrap_or_default()
    }

    pub fn by_org(&self, org: &str) -> HashSet<String> {
        self.by_organization.get(org).cloned().unwrap_or_default()
    }

    pub fn by_dev(&self, dev: &str) -> HashSet<String> {
        self.by_developer.get(dev).cloned().unwrap_or_default()
    }
}
