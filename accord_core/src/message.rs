//! Immutable, signed messages exchanged between agents.
//!
//! A [`Message`] is only ever constructed through [`Message::create`], which
//! signs it immediately; there is no public way to build one with a
//! mismatched signature, which is how the "immutable post-construction"
//! invariant from the data model is enforced by the type itself rather than
//! by convention.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::identity::AgentIdentity;

/// Wire-stable message kind. Serializes as the exact lowercase strings used
/// on the wire form (`"request_collaboration"`, not `"RequestCollaboration"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Text,
    Command,
    Response,
    Error,
    Verification,
    Capability,
    Protocol,
    Stop,
    System,
    Cooldown,
    Ignore,
    RequestCollaboration,
    CollaborationResponse,
    CollaborationError,
}

impl MessageType {
    /// System-originated types that route without signature verification.
    pub fn is_system_originated(self) -> bool {
        matches!(self, MessageType::System)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolVersion {
    #[serde(rename = "1.0")]
    V1_0,
    #[serde(rename = "1.1")]
    V1_1,
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        ProtocolVersion::V1_1
    }
}

/// Free-form metadata map. A small, closed set of keys is recognized by the
/// engine (see the constants below); anything else is passthrough and must
/// never influence a routing decision.
pub type Metadata = BTreeMap<String, Value>;

/// Recognized metadata keys. Reading/writing through these constants (rather
/// than ad hoc string literals) is what keeps the "closed set" invariant
/// enforceable by `grep` if nothing else.
pub mod metadata_keys {
    pub const REQUEST_ID: &str = "request_id";
    pub const RESPONSE_TO: &str = "response_to";
    pub const COLLABORATION_CHAIN: &str = "collaboration_chain";
    pub const ORIGINAL_SENDER: &str = "original_sender";
    pub const ERROR_TYPE: &str = "error_type";
    pub const REASON: &str = "reason";
    pub const COOLDOWN_REMAINING: &str = "cooldown_remaining";
    pub const ORIGINAL_MESSAGE_TYPE: &str = "original_message_type";
    pub const HANDLED_ERROR: &str = "handled_error";
    pub const STATUS: &str = "status";
}

/// An immutable, signed message from `sender_id` to `receiver_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    id: Uuid,
    sender_id: String,
    receiver_id: String,
    content: String,
    message_type: MessageType,
    timestamp: DateTime<Utc>,
    metadata: Option<Metadata>,
    protocol_version: ProtocolVersion,
    signature: String,
}

impl Message {
    /// Constructs and immediately signs a message using `sender_identity`.
    /// The signable form is exactly
    /// `"{id}:{sender}:{receiver}:{content}:{timestamp_rfc3339}"`.
    pub fn create(
        sender_id: impl Into<String>,
        receiver_id: impl Into<String>,
        content: impl Into<String>,
        sender_identity: &AgentIdentity,
        message_type: MessageType,
        metadata: Option<Metadata>,
    ) -> Result<Self, crate::error::IdentityError> {
        let id = Uuid::new_v4();
        let sender_id = sender_id.into();
        let receiver_id = receiver_id.into();
        let content = content.into();
        let timestamp = Utc::now();

        let signable = signable_form(&id, &sender_id, &receiver_id, &content, &timestamp);
        let signature = sender_identity.sign(&signable)?;

        Ok(Self {
            id,
            sender_id,
            receiver_id,
            content,
            message_type,
            timestamp,
            metadata,
            protocol_version: ProtocolVersion::default(),
            signature,
        })
    }

    /// Recomputes the signable form and checks it against `sender_identity`.
    pub fn verify(&self, sender_identity: &AgentIdentity) -> bool {
        let signable = signable_form(
            &self.id,
            &self.sender_id,
            &self.receiver_id,
            &self.content,
            &self.timestamp,
        );
        sender_identity.verify(&signable, &self.signature)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn sender_id(&self) -> &str {
        &self.sender_id
    }

    pub fn receiver_id(&self) -> &str {
        &self.receiver_id
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn metadata(&self) -> Option<&Metadata> {
        self.metadata.as_ref()
    }

    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.as_ref()?.get(key)?.as_str()
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        self.protocol_version
    }

    pub fn signature(&self) -> &str {
        &self.signature
    }
}

fn signable_form(
    id: &Uuid,
    sender_id: &str,
    receiver_id: &str,
    content: &str,
    timestamp: &DateTime<Utc>,
) -> String {
    format!(
        "{}:{}:{}:{}:{}",
        id,
        sender_id,
        receiver_id,
        content,
        timestamp.to_rfc3339()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_create_and_verify_round_trip() {
        let identity = AgentIdentity::create_key_based().unwrap();
        let msg = Message::create(
            "agent-a",
            "agent-b",
            "hello",
            &identity,
            MessageType::Text,
            None,
        )
        .unwrap();
        assert!(msg.verify(&identity));
    }

    #[test]
    fn tampering_with_content_breaks_verification() {
        let identity = AgentIdentity::create_key_based().unwrap();
        let mut msg = Message::create(
            "agent-a",
            "agent-b",
            "hello",
            &identity,
            MessageType::Text,
            None,
        )
        .unwrap();
        msg.content = "tampered".to_string();
        assert!(!msg.verify(&identity));
    }

    #[test]
    fn wrong_identity_fails_verification() {
        let identity = AgentIdentity::create_key_based().unwrap();
        let other = AgentIdentity::create_key_based().unwrap();
        let msg = Message::create(
            "agent-a",
            "agent-b",
            "hello",
            &identity,
            MessageType::Text,
            None,
        )
        .unwrap();
        assert!(!msg.verify(&other));
    }

    #[test]
    fn message_type_serializes_snake_case() {
        let json = serde_json::to_string(&MessageType::RequestCollaboration).unwrap();
        assert_eq!(json, "\"request_collaboration\"");
    }
}
