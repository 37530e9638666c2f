//! The agent loop: mailbox, conversation bookkeeping, pending-request
//! correlation, and cooldown enforcement.
//!
//! An [`Agent`] owns its mailbox and runs one long-lived loop task
//! ([`Agent::run`]); each inbound message is dispatched to a short-lived
//! child task so a slow [`ProcessMessage::process_message`] implementation
//! never blocks the loop from draining the mailbox. The hub is held as a
//! non-owning `Arc<dyn RoutingClient>` back-reference, bound at registration
//! and cleared at unregistration — this is what keeps the
//! agent-holds-hub/hub-holds-agent relationship acyclic (see the design
//! notes in `SPEC_FULL.md`).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Mutex};

use crate::error::AgentError;
use crate::identity::AgentIdentity;
use crate::message::{metadata_keys, Message, MessageType, Metadata};
use crate::model::AgentType;
use crate::BoxError;

/// Non-owning handle an agent uses to reach back into whatever routes its
/// messages. Implemented by `accord_engine::hub::Hub`; kept in this crate so
/// `accord_core` never depends on `accord_engine`.
#[async_trait]
pub trait RoutingClient: Send + Sync {
    async fn route_message(&self, msg: Message) -> Result<bool, BoxError>;

    /// Looks up a peer's advertised agent type, used by
    /// [`Agent::find_human_in_chain`] to locate the human end of a
    /// delegation chain when synthesizing an error reply.
    async fn agent_type_of(&self, agent_id: &str) -> Option<AgentType>;
}

/// Per-peer conversation bookkeeping.
#[derive(Debug, Clone)]
pub struct ConversationState {
    pub start_time: DateTime<Utc>,
    pub message_count: u32,
    pub last_message_time: DateTime<Utc>,
}

impl ConversationState {
    fn new() -> Self {
        let now = Utc::now();
        Self {
            start_time: now,
            message_count: 0,
            last_message_time: now,
        }
    }

    fn touch(&mut self) {
        self.message_count += 1;
        self.last_message_time = Utc::now();
    }
}

#[derive(Debug, Clone)]
struct PendingRequest {
    request_id: String,
}

/// A reply an agent's message-processing hook wants sent back to the
/// original sender.
#[derive(Debug, Clone)]
pub struct Reply {
    pub content: String,
    pub message_type: MessageType,
    pub metadata: Option<Metadata>,
}

impl Reply {
    pub fn new(content: impl Into<String>, message_type: MessageType) -> Self {
        Self {
            content: content.into(),
            message_type,
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// The subclass-equivalent hook: application logic that decides what to do
/// with an inbound message the base pre-filter (see [`Agent::base_process_message`])
/// did not already answer on its own.
#[async_trait]
pub trait ProcessMessage: Send + Sync {
    async fn process_message(
        &self,
        agent: &Agent,
        msg: &Message,
    ) -> Result<Option<Reply>, BoxError>;
}

/// Static configuration for an [`Agent`]'s loop.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub max_turns_per_conversation: u32,
    pub mailbox_poll_interval: Duration,
    pub processing_timeout: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_turns_per_conversation: 50,
            mailbox_poll_interval: Duration::from_millis(100),
            processing_timeout: Duration::from_secs(180),
        }
    }
}

/// An addressable participant in the fabric.
pub struct Agent {
    agent_id: String,
    identity: AgentIdentity,
    agent_type: AgentType,
    config: AgentConfig,
    handler: Arc<dyn ProcessMessage>,

    mailbox_tx: mpsc::UnboundedSender<Message>,
    mailbox_rx: Mutex<mpsc::UnboundedReceiver<Message>>,

    history: Mutex<Vec<Message>>,
    active_conversations: Mutex<HashMap<String, ConversationState>>,
    pending_requests: Mutex<HashMap<String, PendingRequest>>,
    cooldown_until: Mutex<Option<DateTime<Utc>>>,

    hub: Mutex<Option<Arc<dyn RoutingClient>>>,
    is_running: AtomicBool,
}

impl Agent {
    pub fn new(
        agent_id: impl Into<String>,
        identity: AgentIdentity,
        agent_type: AgentType,
        handler: Arc<dyn ProcessMessage>,
        config: AgentConfig,
    ) -> Arc<Self> {
        let (mailbox_tx, mailbox_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            agent_id: agent_id.into(),
            identity,
            agent_type,
            config,
            handler,
            mailbox_tx,
            mailbox_rx: Mutex::new(mailbox_rx),
            history: Mutex::new(Vec::new()),
            active_conversations: Mutex::new(HashMap::new()),
            pending_requests: Mutex::new(HashMap::new()),
            cooldown_until: Mutex::new(None),
            hub: Mutex::new(None),
            is_running: AtomicBool::new(true),
        })
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn identity(&self) -> &AgentIdentity {
        &self.identity
    }

    pub fn agent_type(&self) -> AgentType {
        self.agent_type
    }

    /// Binds this agent to a hub; called by the hub at `register_agent`.
    pub async fn bind_hub(&self, hub: Arc<dyn RoutingClient>) {
        *self.hub.lock().await = Some(hub);
    }

    /// Clears the hub binding; called by the hub at `unregister_agent`.
    pub async fn unbind_hub(&self) {
        *self.hub.lock().await = None;
    }

    pub fn stop(&self) {
        self.is_running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    pub async fn history(&self) -> Vec<Message> {
        self.history.lock().await.clone()
    }

    pub async fn active_conversation(&self, peer_id: &str) -> Option<ConversationState> {
        self.active_conversations.lock().await.get(peer_id).cloned()
    }

    // -- cooldown -----------------------------------------------------

    pub async fn set_cooldown(&self, duration: Duration) {
        let delta = chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero());
        *self.cooldown_until.lock().await = Some(Utc::now() + delta);
    }

    pub async fn reset_cooldown(&self) {
        *self.cooldown_until.lock().await = None;
    }

    /// Returns the remaining cooldown, if any; a pure read with no side effects.
    pub async fn cooldown_remaining(&self) -> Option<Duration> {
        let until = (*self.cooldown_until.lock().await)?;
        let now = Utc::now();
        if until > now {
            (until - now).to_std().ok()
        } else {
            None
        }
    }

    // -- conversation lifecycle ----------------------------------------

    async fn touch_conversation(&self, peer_id: &str) -> u32 {
        let mut convos = self.active_conversations.lock().await;
        let state = convos.entry(peer_id.to_string()).or_insert_with(ConversationState::new);
        state.touch();
        state.message_count
    }

    /// Ends the conversation with `peer_id`; a destroyed record is recreated
    /// fresh (no bleed-through) the next time either side interacts.
    pub async fn end_conversation(&self, peer_id: &str) {
        self.active_conversations.lock().await.remove(peer_id);
    }

    // -- sending ---------------------------------------------------------

    /// Sends a message to `receiver_id`. If a pending request was recorded
    /// for this peer (an inbound request awaiting correlation), the outgoing
    /// metadata is annotated with `response_to` and the pending record is
    /// consumed.
    pub async fn send_message(
        &self,
        receiver_id: &str,
        content: impl Into<String>,
        message_type: MessageType,
        mut metadata: Option<Metadata>,
    ) -> Result<Message, AgentError> {
        let hub = self
            .hub
            .lock()
            .await
            .clone()
            .ok_or(AgentError::NoHub)?;

        if let Some(pending) = self.pending_requests.lock().await.remove(receiver_id) {
            metadata
                .get_or_insert_with(Metadata::new)
                .insert(metadata_keys::RESPONSE_TO.to_string(), pending.request_id.into());
        }

        let msg = Message::create(
            &self.agent_id,
            receiver_id,
            content,
            &self.identity,
            message_type,
            metadata,
        )?;

        let routed = hub
            .route_message(msg.clone())
            .await
            .map_err(|e| AgentError::Routing(e.to_string()))?;
        if !routed {
            return Err(AgentError::Routing("hub rejected message".to_string()));
        }

        self.history.lock().await.push(msg.clone());
        self.touch_conversation(receiver_id).await;
        Ok(msg)
    }

    /// Enqueues an inbound message and records it in local history. The
    /// mailbox is unbounded, so this never blocks.
    pub async fn receive_message(&self, msg: Message) {
        self.history.lock().await.push(msg.clone());
        self.touch_conversation(msg.sender_id()).await;
        // An unbounded sender only fails if every receiver was dropped,
        // which only happens after `stop()` has torn the loop down.
        let _ = self.mailbox_tx.send(msg);
    }

    /// Walks the active conversations looking for a peer whose advertised
    /// type is `Human`, falling back to the immediate sender if it is
    /// itself human. Used to address an ERROR reply synthesized from deep
    /// inside a multi-hop delegation.
    pub async fn find_human_in_chain(&self, sender_id: &str) -> Option<String> {
        let hub = self.hub.lock().await.clone()?;
        if hub.agent_type_of(sender_id).await == Some(AgentType::Human) {
            return Some(sender_id.to_string());
        }
        let peers: Vec<String> = self.active_conversations.lock().await.keys().cloned().collect();
        for peer in peers {
            if hub.agent_type_of(&peer).await == Some(AgentType::Human) {
                return Some(peer);
            }
        }
        None
    }

    // -- base pre-filter ---------------------------------------------------

    /// The pre-filter every inbound message passes through before the
    /// application hook sees it. `Ok(Some(reply))` means the base layer
    /// produced the terminal reply itself (STOP, cooldown ack, verification
    /// failure, ...); `Ok(None)` means the subclass hook must now decide.
    pub async fn base_process_message(&self, msg: &Message) -> Result<Option<Reply>, AgentError> {
        let sender_id = msg.sender_id().to_string();

        if msg.message_type() == MessageType::Stop || msg.content() == "__EXIT__" {
            self.end_conversation(&sender_id).await;
            return Ok(Some(finalize_reply(
                msg,
                Reply::new("Conversation ended successfully.", MessageType::Ignore)
                    .with_metadata(reason_metadata("conversation_ended")),
            )));
        }

        if msg.message_type() == MessageType::Cooldown {
            return Ok(Some(finalize_reply(
                msg,
                Reply::new("Acknowledged cooldown.", MessageType::Ignore),
            )));
        }

        // Checked against this agent's own identity, not the sender's — the
        // hub is what verifies a message against the actual sender's
        // registered identity before delivery ever reaches this point.
        if !msg.verify(&self.identity) {
            return Ok(Some(finalize_reply(
                msg,
                Reply::new("Message verification failed.", MessageType::Error)
                    .with_metadata(error_type_metadata("verification_failed")),
            )));
        }

        if let Some(remaining) = self.cooldown_remaining().await {
            let mut metadata = Metadata::new();
            metadata.insert(
                metadata_keys::COOLDOWN_REMAINING.to_string(),
                remaining.as_secs().into(),
            );
            return Ok(Some(finalize_reply(
                msg,
                Reply::new("Agent is in cooldown.", MessageType::Cooldown).with_metadata(metadata),
            )));
        }

        let count = self
            .active_conversations
            .lock()
            .await
            .get(&sender_id)
            .map(|c| c.message_count)
            .unwrap_or(0);
        if count >= self.config.max_turns_per_conversation {
            self.end_conversation(&sender_id).await;
            return Ok(Some(finalize_reply(
                msg,
                Reply::new("Maximum conversation turns reached.", MessageType::Stop)
                    .with_metadata(reason_metadata("max_turns_reached")),
            )));
        }

        if let Some(request_id) = msg.metadata_str(metadata_keys::REQUEST_ID) {
            self.pending_requests.lock().await.insert(
                sender_id,
                PendingRequest {
                    request_id: request_id.to_string(),
                },
            );
        }

        Ok(None)
    }

    /// Runs the message-intake loop until [`Agent::stop`] is called.
    /// In-flight processing tasks are allowed to finish; the loop itself
    /// never dies on a handler error.
    pub async fn run(self: Arc<Self>) {
        while self.is_running() {
            let next = {
                let mut rx = self.mailbox_rx.lock().await;
                tokio::time::timeout(self.config.mailbox_poll_interval, rx.recv()).await
            };
            let Ok(Some(msg)) = next else {
                continue;
            };

            let this = Arc::clone(&self);
            tokio::spawn(async move {
                this.process_one(msg).await;
            });
        }
    }

    async fn process_one(self: Arc<Self>, msg: Message) {
        let base_result = self.base_process_message(&msg).await;
        let reply = match base_result {
            Ok(Some(reply)) => Some((msg.sender_id().to_string(), reply)),
            Ok(None) => {
                let handler = Arc::clone(&self.handler);
                let this = Arc::clone(&self);
                let msg_ref = msg.clone();
                match tokio::time::timeout(self.config.processing_timeout, async move {
                    handler.process_message(&this, &msg_ref).await
                })
                .await
                {
                    Ok(Ok(reply)) => reply.map(|r| (msg.sender_id().to_string(), finalize_reply(&msg, r))),
                    Ok(Err(e)) => {
                        log::error!(agent_id = self.agent_id.as_str(), error:? = e; "process_message failed");
                        self.synthesize_error(&msg, &e.to_string()).await
                    }
                    Err(_) => {
                        log::warn!(agent_id = self.agent_id.as_str(); "process_message exceeded workflow timeout");
                        self.synthesize_error(&msg, "processing timed out").await
                    }
                }
            }
            Err(e) => {
                log::error!(agent_id = self.agent_id.as_str(), error:? = e; "base_process_message failed");
                None
            }
        };

        if let Some((target, reply)) = reply {
            if reply.message_type == MessageType::Ignore {
                return;
            }
            if let Err(e) = self
                .send_message(&target, reply.content, reply.message_type, reply.metadata)
                .await
            {
                log::error!(agent_id = self.agent_id.as_str(), error:? = e; "failed to send reply");
            }
        }
    }

    /// Returns the reply paired with its target: processing errors go to the
    /// human found by walking the conversation chain, not the immediate
    /// sender, which may itself be a non-human intermediary.
    async fn synthesize_error(&self, msg: &Message, detail: &str) -> Option<(String, Reply)> {
        let human = self.find_human_in_chain(msg.sender_id()).await?;
        let mut metadata = Metadata::new();
        metadata.insert(
            metadata_keys::ERROR_TYPE.to_string(),
            "processing_error".into(),
        );
        metadata.insert(metadata_keys::ORIGINAL_SENDER.to_string(), msg.sender_id().into());
        let reply = Reply::new(
            format!(
                "I encountered an error while processing your request: {detail}. Please try a different approach or simplify your request."
            ),
            MessageType::Error,
        )
        .with_metadata(metadata);
        Some((human, finalize_reply(msg, reply)))
    }
}

fn reason_metadata(reason: &str) -> Metadata {
    let mut m = Metadata::new();
    m.insert(metadata_keys::REASON.to_string(), reason.into());
    m
}

fn error_type_metadata(kind: &str) -> Metadata {
    let mut m = Metadata::new();
    m.insert(metadata_keys::ERROR_TYPE.to_string(), kind.into());
    m
}

/// Forces `COLLABORATION_RESPONSE` for any reply to an inbound
/// `REQUEST_COLLABORATION` message, preserving the type the reply would
/// otherwise have carried in `metadata.original_message_type`.
fn finalize_reply(inbound: &Message, mut reply: Reply) -> Reply {
    if inbound.message_type() == MessageType::RequestCollaboration
        && reply.message_type != MessageType::CollaborationResponse
    {
        let original = reply.message_type;
        let metadata = reply.metadata.get_or_insert_with(Metadata::new);
        metadata.insert(
            metadata_keys::ORIGINAL_MESSAGE_TYPE.to_string(),
            serde_json::to_value(original).unwrap_or_default(),
        );
        reply.message_type = MessageType::CollaborationResponse;
    }
    reply
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    struct Echo;

    #[async_trait]
    impl ProcessMessage for Echo {
        async fn process_message(
            &self,
            _agent: &Agent,
            msg: &Message,
        ) -> Result<Option<Reply>, BoxError> {
            Ok(Some(Reply::new(
                format!("echo:{}", msg.content()),
                MessageType::Response,
            )))
        }
    }

    struct NullHub {
        delivered: StdMutex<Vec<Message>>,
    }

    #[async_trait]
    impl RoutingClient for NullHub {
        async fn route_message(&self, msg: Message) -> Result<bool, BoxError> {
            self.delivered.lock().unwrap().push(msg);
            Ok(true)
        }
        async fn agent_type_of(&self, _agent_id: &str) -> Option<AgentType> {
            Some(AgentType::Human)
        }
    }

    fn make_agent() -> Arc<Agent> {
        let identity = AgentIdentity::create_key_based().unwrap();
        Agent::new(
            "agent-a",
            identity,
            AgentType::Ai,
            Arc::new(Echo),
            AgentConfig::default(),
        )
    }

    #[tokio::test]
    async fn stop_message_ends_conversation() {
        let agent = make_agent();
        agent.touch_conversation("peer").await;
        assert!(agent.active_conversation("peer").await.is_some());

        let identity = AgentIdentity::create_key_based().unwrap();
        let msg = Message::create("peer", "agent-a", "bye", &identity, MessageType::Stop, None).unwrap();
        let reply = agent.base_process_message(&msg).await.unwrap();
        assert!(reply.is_some());
        assert!(agent.active_conversation("peer").await.is_none());
    }

    #[tokio::test]
    async fn cooldown_blocks_base_processing() {
        let agent = make_agent();
        agent.set_cooldown(Duration::from_secs(5)).await;

        // Base verification checks the inbound signature against this
        // agent's own identity (see `base_process_message`'s doc comment),
        // so a message that should pass it must be signed by that same key.
        let msg =
            Message::create("peer", "agent-a", "hi", agent.identity(), MessageType::Text, None).unwrap();
        let reply = agent.base_process_message(&msg).await.unwrap().unwrap();
        assert_eq!(reply.message_type, MessageType::Cooldown);
    }

    #[tokio::test]
    async fn verification_failure_produces_error_reply() {
        let agent = make_agent();
        let signer = AgentIdentity::create_key_based().unwrap();
        let msg = Message::create("peer", "agent-a", "hi", &signer, MessageType::Text, None).unwrap();
        // `msg` is signed by an unrelated identity, so checking it against
        // this agent's own identity must fail.
        let reply = agent.base_process_message(&msg).await.unwrap();
        assert!(reply.is_some());
        assert_eq!(reply.unwrap().message_type, MessageType::Error);
    }

    #[tokio::test]
    async fn request_collaboration_forces_response_type() {
        let mut metadata = Metadata::new();
        metadata.insert(metadata_keys::REQUEST_ID.to_string(), "req-1".into());
        let signer = AgentIdentity::create_key_based().unwrap();
        let msg = Message::create(
            "peer",
            "agent-a",
            "help",
            &signer,
            MessageType::RequestCollaboration,
            Some(metadata),
        )
        .unwrap();
        let reply = Reply::new("ok", MessageType::Response);
        let finalized = finalize_reply(&msg, reply);
        assert_eq!(finalized.message_type, MessageType::CollaborationResponse);
        assert_eq!(
            finalized
                .metadata
                .unwrap()
                .get(metadata_keys::ORIGINAL_MESSAGE_TYPE)
                .unwrap(),
            "response"
        );
    }
}
