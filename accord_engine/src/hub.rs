//! The communication hub: routes messages between registered agents,
//! correlates request/response pairs, and buffers late replies.

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use moka::future::Cache;
use parking_lot::RwLock as SyncRwLock;
use tokio::sync::{oneshot, Mutex, RwLock};
use uuid::Uuid;

use accord_core::agent::{Agent, RoutingClient};
use accord_core::message::{metadata_keys, Message, MessageType, Metadata};
use accord_core::model::{AgentProfile, AgentRegistration, AgentType};
use accord_core::BoxError;

use crate::error::HubError;
use crate::registry::Registry;

const DEFAULT_MAX_HISTORY: usize = 10_000;
const LATE_RESPONSE_TTL: Duration = Duration::from_secs(300);

type Handler = Arc<dyn Fn(&Message) + Send + Sync>;

enum PendingEntry {
    Waiting(oneshot::Sender<Message>),
    TimedOut,
}

/// The outcome of [`Hub::check_collaboration_result`]. `Message` itself is
/// immutable and signed, so the hub-assigned status travels alongside it
/// rather than being spliced into the message's own metadata.
#[derive(Debug, Clone)]
pub struct CollaborationResult {
    pub message: Message,
    pub status: String,
}

const AGENT_TO_AGENT_TYPES: &[MessageType] = &[
    MessageType::Text,
    MessageType::Command,
    MessageType::Response,
    MessageType::Error,
    MessageType::Verification,
    MessageType::Capability,
    MessageType::Protocol,
    MessageType::RequestCollaboration,
    MessageType::CollaborationResponse,
    MessageType::CollaborationError,
];

/// Owns `active_agents` and the pending-response bookkeeping behind
/// dedicated locks (see the concurrency model); never a singleton.
pub struct Hub {
    registry: Arc<Registry>,
    active_agents: RwLock<HashMap<String, Arc<Agent>>>,
    history: Mutex<VecDeque<Message>>,
    max_history: usize,
    pending_responses: Mutex<HashMap<String, PendingEntry>>,
    late_responses: Cache<String, Message>,
    message_handlers: SyncRwLock<HashMap<String, Vec<Handler>>>,
    global_handlers: SyncRwLock<Vec<Handler>>,
}

impl Hub {
    pub fn new(registry: Arc<Registry>) -> Arc<Self> {
        Self::with_max_history(registry, DEFAULT_MAX_HISTORY)
    }

    pub fn with_max_history(registry: Arc<Registry>, max_history: usize) -> Arc<Self> {
        Arc::new(Self {
            registry,
            active_agents: RwLock::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
            max_history,
            pending_responses: Mutex::new(HashMap::new()),
            late_responses: Cache::builder().time_to_live(LATE_RESPONSE_TTL).build(),
            message_handlers: SyncRwLock::new(HashMap::new()),
            global_handlers: SyncRwLock::new(Vec::new()),
        })
    }

    pub fn add_global_handler(&self, handler: Handler) {
        self.global_handlers.write().push(handler);
    }

    pub fn add_message_handler(&self, agent_id: &str, handler: Handler) {
        self.message_handlers
            .write()
            .entry(agent_id.to_string())
            .or_default()
            .push(handler);
    }

    /// Builds an [`AgentRegistration`] from `agent` plus the supplied
    /// profile, attempts registry registration, and on success binds the
    /// hub back-reference onto the agent.
    pub async fn register_agent(
        self: Arc<Self>,
        agent: Arc<Agent>,
        profile: AgentProfile,
        payment_address: Option<String>,
    ) -> Result<bool, crate::error::RegistryError> {
        let registration = AgentRegistration {
            agent_id: agent.agent_id().to_string(),
            profile,
            identity: agent.identity().clone(),
            payment_address,
            custom_metadata: Default::default(),
            registered_at: chrono::Utc::now(),
        };

        if !self.registry.register(registration).await? {
            return Ok(false);
        }

        agent.bind_hub(self.clone() as Arc<dyn RoutingClient>).await;
        self.active_agents
            .write()
            .await
            .insert(agent.agent_id().to_string(), agent);
        Ok(true)
    }

    pub async fn unregister_agent(&self, agent_id: &str) -> bool {
        let agent = self.active_agents.write().await.remove(agent_id);
        if let Some(agent) = agent {
            agent.unbind_hub().await;
        }
        self.registry.unregister(agent_id).await
    }

    async fn push_history(&self, msg: Message) {
        let mut history = self.history.lock().await;
        history.push_back(msg);
        while history.len() > self.max_history {
            history.pop_front();
        }
    }

    pub async fn history(&self) -> Vec<Message> {
        self.history.lock().await.iter().cloned().collect()
    }

    async fn dispatch_handlers(&self, msg: &Message) {
        let per_agent: Vec<Handler> = self
            .message_handlers
            .read()
            .get(msg.receiver_id())
            .cloned()
            .unwrap_or_default();
        let global: Vec<Handler> = self.global_handlers.read().clone();
        for handler in per_agent.into_iter().chain(global) {
            let msg = msg.clone();
            if std::panic::catch_unwind(AssertUnwindSafe(|| handler(&msg))).is_err() {
                log::error!(receiver_id = msg.receiver_id(); "message handler panicked");
            }
        }
    }

    /// Completes a still-pending request, or stashes a late reply for
    /// [`Hub::check_collaboration_result`] to retrieve.
    async fn correlate_response(&self, msg: &Message) {
        let Some(request_id) = msg.metadata_str(metadata_keys::RESPONSE_TO) else {
            return;
        };
        let mut pending = self.pending_responses.lock().await;
        match pending.remove(request_id) {
            Some(PendingEntry::Waiting(tx)) => {
                let _ = tx.send(msg.clone());
            }
            Some(PendingEntry::TimedOut) => {
                self.late_responses.insert(request_id.to_string(), msg.clone()).await;
            }
            None => {}
        }
    }

    /// Sends `content` to `receiver_id` and awaits a correlated reply up to
    /// `timeout`. On expiry the pending entry is marked `TimedOut` rather
    /// than removed, so a late reply still lands in `late_responses`.
    pub async fn send_message_and_wait_response(
        &self,
        sender: &Agent,
        receiver_id: &str,
        content: impl Into<String>,
        message_type: MessageType,
        timeout: Duration,
    ) -> Result<Option<Message>, BoxError> {
        let request_id = Uuid::new_v4().to_string();
        let mut metadata = Metadata::new();
        metadata.insert(metadata_keys::REQUEST_ID.to_string(), request_id.clone().into());

        let (tx, rx) = oneshot::channel();
        self.pending_responses
            .lock()
            .await
            .insert(request_id.clone(), PendingEntry::Waiting(tx));

        if sender
            .send_message(receiver_id, content, message_type, Some(metadata))
            .await
            .is_err()
        {
            self.pending_responses.lock().await.remove(&request_id);
            return Ok(None);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(msg)) => Ok(Some(msg)),
            _ => {
                if let Some(entry) = self.pending_responses.lock().await.get_mut(&request_id) {
                    *entry = PendingEntry::TimedOut;
                }
                Ok(None)
            }
        }
    }

    /// Sends a `REQUEST_COLLABORATION` message and returns the response's
    /// textual content once correlated.
    pub async fn send_collaboration_request(
        &self,
        sender: &Agent,
        receiver_id: &str,
        task: impl Into<String>,
        timeout: Duration,
    ) -> Result<Option<String>, BoxError> {
        Ok(self
            .send_message_and_wait_response(
                sender,
                receiver_id,
                task,
                MessageType::RequestCollaboration,
                timeout,
            )
            .await?
            .map(|m| m.content().to_string()))
    }

    /// Retrieves a reply that arrived after its `send_and_wait` call
    /// already timed out.
    pub async fn check_collaboration_result(&self, request_id: &str) -> Option<CollaborationResult> {
        let message = self.late_responses.get(request_id).await?;
        self.late_responses.invalidate(request_id).await;
        Some(CollaborationResult {
            message,
            status: "completed_late".to_string(),
        })
    }

    async fn interaction_modes_compatible(&self, sender_id: &str, receiver_id: &str) -> bool {
        let sender_modes = self
            .registry
            .get_registration(sender_id)
            .await
            .map(|r| r.profile.interaction_modes)
            .unwrap_or_default();
        let receiver_modes = self
            .registry
            .get_registration(receiver_id)
            .await
            .map(|r| r.profile.interaction_modes)
            .unwrap_or_default();
        sender_modes.iter().any(|m| receiver_modes.contains(m))
    }
}

#[async_trait]
impl RoutingClient for Hub {
    async fn route_message(&self, msg: Message) -> Result<bool, BoxError> {
        if msg.message_type().is_system_originated() {
            self.push_history(msg).await;
            return Ok(true);
        }

        let agents = self.active_agents.read().await;
        let Some(sender) = agents.get(msg.sender_id()).cloned() else {
            return Ok(false);
        };
        let Some(receiver) = agents.get(msg.receiver_id()).cloned() else {
            return Ok(false);
        };
        drop(agents);

        if matches!(msg.message_type(), MessageType::Cooldown | MessageType::Stop) {
            if msg.message_type() == MessageType::Cooldown && receiver.agent_type() != AgentType::Human {
                return Ok(false);
            }
            self.push_history(msg.clone()).await;
            receiver.receive_message(msg.clone()).await;
            self.correlate_response(&msg).await;
            self.dispatch_handlers(&msg).await;
            return Ok(true);
        }

        if sender.identity().verification_status() != accord_core::identity::VerificationStatus::Verified
            || receiver.identity().verification_status() != accord_core::identity::VerificationStatus::Verified
            || !msg.verify(sender.identity())
        {
            return Err(Box::new(HubError::Security));
        }

        if !self.interaction_modes_compatible(msg.sender_id(), msg.receiver_id()).await {
            return Ok(false);
        }

        if !AGENT_TO_AGENT_TYPES.contains(&msg.message_type()) {
            return Ok(false);
        }

        self.push_history(msg.clone()).await;
        receiver.receive_message(msg.clone()).await;
        self.correlate_response(&msg).await;
        self.dispatch_handlers(&msg).await;
        Ok(true)
    }

    async fn agent_type_of(&self, agent_id: &str) -> Option<AgentType> {
        self.registry.get_agent_type(agent_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use accord_core::agent::{AgentConfig, ProcessMessage, Reply};
    use accord_core::identity::AgentIdentity;
    use accord_core::model::{Capability, InteractionMode};
    use accord_vector::VectorDiscoveryService;
    use async_trait::async_trait as at;

    struct Echo;

    #[at]
    impl ProcessMessage for Echo {
        async fn process_message(&self, _agent: &Agent, msg: &Message) -> Result<Option<Reply>, BoxError> {
            Ok(Some(Reply::new(format!("echo:{}", msg.content()), MessageType::Response)))
        }
    }

    fn make_registry() -> Arc<Registry> {
        let discovery = Arc::new(VectorDiscoveryService::new(None, None));
        Registry::new(discovery)
    }

    fn profile(capability: &str) -> AgentProfile {
        AgentProfile {
            agent_type: AgentType::Ai,
            interaction_modes: vec![InteractionMode::AgentToAgent],
            name: None,
            summary: None,
            description: None,
            version: None,
            organization: None,
            developer: None,
            url: None,
            capabilities: vec![Capability {
                name: capability.to_string(),
                description: "test capability".to_string(),
                input_schema: None,
                output_schema: None,
                version: None,
            }],
            skills: vec![],
            examples: vec![],
            tags: vec![],
            auth_schemes: vec![],
            default_input_modes: vec![],
            default_output_modes: vec![],
        }
    }

    async fn spawn_agent(hub: &Arc<Hub>, agent_id: &str) -> Arc<Agent> {
        let identity = AgentIdentity::create_key_based().unwrap();
        let agent = Agent::new(agent_id, identity, AgentType::Ai, Arc::new(Echo), AgentConfig::default());
        hub.registry.initialize().await.unwrap();
        hub.clone().register_agent(agent.clone(), profile("echo"), None).await.unwrap();
        tokio::spawn(agent.clone().run());
        agent
    }

    #[tokio::test]
    async fn request_response_correlation_returns_matching_reply() {
        let registry = make_registry();
        let hub = Hub::new(registry);
        let a = spawn_agent(&hub, "agent-a").await;
        let _b = spawn_agent(&hub, "agent-b").await;

        let reply = hub
            .send_message_and_wait_response(&a, "agent-b", "ping", MessageType::Text, Duration::from_secs(2))
            .await
            .unwrap();
        let reply = reply.expect("expected a reply before timeout");
        assert_eq!(reply.content(), "echo:ping");
    }

    #[tokio::test]
    async fn unknown_receiver_fails_routing_without_error() {
        let registry = make_registry();
        let hub = Hub::new(registry);
        let a = spawn_agent(&hub, "agent-a").await;

        let result = hub
            .send_message_and_wait_response(&a, "ghost", "hi", MessageType::Text, Duration::from_millis(200))
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn incompatible_interaction_modes_reject_routing() {
        let registry = make_registry();
        let hub = Hub::new(registry);
        registry_ready(&hub).await;

        let identity_a = AgentIdentity::create_key_based().unwrap();
        let agent_a = Agent::new("agent-a", identity_a, AgentType::Ai, Arc::new(Echo), AgentConfig::default());
        let mut profile_a = profile("echo");
        profile_a.interaction_modes = vec![InteractionMode::AgentToAgent];
        hub.clone().register_agent(agent_a.clone(), profile_a, None).await.unwrap();

        let identity_b = AgentIdentity::create_key_based().unwrap();
        let agent_b = Agent::new("agent-b", identity_b, AgentType::Human, Arc::new(Echo), AgentConfig::default());
        let mut profile_b = profile("echo");
        profile_b.interaction_modes = vec![InteractionMode::HumanToAgent];
        hub.clone().register_agent(agent_b.clone(), profile_b, None).await.unwrap();

        let routed = hub.route_message(
            Message::create("agent-a", "agent-b", "hi", agent_a.identity(), MessageType::Text, None).unwrap(),
        );
        assert!(!routed.await.unwrap());
    }

    async fn registry_ready(hub: &Arc<Hub>) {
        hub.registry.initialize().await.unwrap();
    }
}
