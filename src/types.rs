//! Core type definitions for Griot Live.
//!
//! Three families of types live here:
//!
//! - **Wire messages**: [`ClientMessage`] (inbound, tag-dispatched) and
//!   [`ServerMessage`] (outbound, sequence-stamped by the send loop). Both
//!   serialize as a single JSON object per frame; optional fields that are
//!   `None` are omitted on the wire.
//! - **Agent plumbing**: [`AgentRequest`] / [`AgentResponse`] exchanged
//!   between the orchestrator and sub-agents on the legacy streaming path,
//!   plus [`Intent`] and [`OrchestratorState`].
//! - **Session records**: [`SessionMetadata`], [`ConversationTurn`], and the
//!   [`A2aTask`] envelope for schema-enforced dispatch.
//!
//! # Wire contract
//!
//! Inbound frames are internally tagged by `type`; an unknown tag fails the
//! frame (serde error), which the gateway reports as a protocol error
//! without dropping the connection. Outbound frames carry a strictly
//! increasing `seq` assigned at send time, never at produce time, so dropped
//! messages leave no visible hole.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Current wall-clock time as fractional Unix seconds.
pub(crate) fn now_ts() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

// ============================================================================
// CLIENT → SERVER MESSAGES
// ============================================================================

/// Incoming WebSocket message from a client.
///
/// The `seq` field is client-assigned and informational only; the gateway
/// never reorders or gap-checks it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Opaque base64 PCM audio frame.
    AudioChunk {
        #[serde(default)]
        seq: u64,
        data: String,
    },
    /// A typed user utterance.
    TextInput {
        #[serde(default)]
        seq: u64,
        data: String,
    },
    /// Opaque base64 video frame with optional dimensions.
    VideoFrame {
        #[serde(default)]
        seq: u64,
        data: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        width: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        height: Option<u32>,
    },
    /// Barge-in: stop the current generation.
    Interrupt {
        #[serde(default)]
        seq: u64,
    },
    /// Session-scoped control action (`set_language`, `set_age_group`, ...).
    Control {
        #[serde(default)]
        seq: u64,
        action: String,
        #[serde(default, skip_serializing_if = "Value::is_null")]
        value: Value,
    },
    /// Resume a previous session by id.
    SessionInit {
        #[serde(default)]
        seq: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    /// Client keepalive.
    Ping {
        #[serde(default)]
        seq: u64,
    },
}

// ============================================================================
// SERVER → CLIENT MESSAGES
// ============================================================================

/// Outbound message tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerMessageType {
    AudioChunk,
    TextChunk,
    ImageReady,
    AgentState,
    TurnEnd,
    Interrupted,
    Error,
    SessionCreated,
    Pong,
}

/// Outgoing WebSocket message.
///
/// `seq` is stamped by the connection's send loop immediately before the
/// frame hits the transport; everywhere else it is zero. Construct values
/// through the tag-specific constructors rather than struct literals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerMessage {
    #[serde(rename = "type")]
    pub kind: ServerMessageType,
    #[serde(default)]
    pub seq: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default = "now_ts")]
    pub timestamp: f64,
}

impl ServerMessage {
    fn bare(kind: ServerMessageType) -> Self {
        Self {
            kind,
            seq: 0,
            data: None,
            url: None,
            agent: None,
            state: None,
            error: None,
            session_id: None,
            timestamp: now_ts(),
        }
    }

    /// A buffered, sentence-aligned text chunk.
    pub fn text_chunk(data: impl Into<String>, agent: impl Into<String>) -> Self {
        Self {
            data: Some(data.into()),
            agent: Some(agent.into()),
            ..Self::bare(ServerMessageType::TextChunk)
        }
    }

    /// A pass-through audio frame.
    pub fn audio_chunk(data: impl Into<String>) -> Self {
        Self {
            data: Some(data.into()),
            ..Self::bare(ServerMessageType::AudioChunk)
        }
    }

    /// An async image task resolved; carries the public URL.
    pub fn image_ready(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            agent: Some("visual".to_string()),
            ..Self::bare(ServerMessageType::ImageReady)
        }
    }

    /// Advisory UX hint about a sub-agent's state.
    pub fn agent_state(agent: impl Into<String>, state: impl Into<String>) -> Self {
        Self {
            agent: Some(agent.into()),
            state: Some(state.into()),
            ..Self::bare(ServerMessageType::AgentState)
        }
    }

    /// End of an agent turn.
    pub fn turn_end() -> Self {
        Self::bare(ServerMessageType::TurnEnd)
    }

    /// The current generation was interrupted.
    pub fn interrupted(session_id: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            ..Self::bare(ServerMessageType::Interrupted)
        }
    }

    /// A user-visible error.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::bare(ServerMessageType::Error)
        }
    }

    /// Connection handshake confirmation.
    pub fn session_created(session_id: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            ..Self::bare(ServerMessageType::SessionCreated)
        }
    }

    /// Server keepalive.
    pub fn pong() -> Self {
        Self::bare(ServerMessageType::Pong)
    }

    /// Whether this message may be shed under backpressure.
    ///
    /// `turn_end` and `error` must reach the client; everything else is a
    /// stream element the client can live without.
    pub fn is_droppable(&self) -> bool {
        !matches!(
            self.kind,
            ServerMessageType::TurnEnd | ServerMessageType::Error
        )
    }
}

// ============================================================================
// ORCHESTRATION TYPES
// ============================================================================

/// State machine states for the per-session orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorState {
    Idle,
    Listening,
    Processing,
    Streaming,
    Interrupted,
    Error,
}

/// Detected user intents, as resolved from live-model function calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    RequestStory,
    RequestRiddle,
    AnswerRiddle,
    RequestImage,
    AskCultural,
    Continue,
    Greeting,
    Farewell,
    Clarification,
    Unknown,
}

/// Request from the orchestrator to a sub-agent (legacy streaming path).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRequest {
    pub intent: Intent,
    pub user_input: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub culture: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub theme: Option<String>,
    #[serde(default = "default_age_group")]
    pub age_group: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_context: Option<String>,
    #[serde(default)]
    pub preferences: HashMap<String, String>,
    #[serde(default)]
    pub turn_id: String,
    #[serde(default)]
    pub session_id: String,
}

fn default_age_group() -> String {
    "adult".to_string()
}

impl AgentRequest {
    pub fn new(intent: Intent, user_input: impl Into<String>) -> Self {
        Self {
            intent,
            user_input: user_input.into(),
            culture: None,
            theme: None,
            age_group: default_age_group(),
            session_context: None,
            preferences: HashMap::new(),
            turn_id: String::new(),
            session_id: String::new(),
        }
    }
}

/// Response chunk from a sub-agent (legacy streaming path).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResponse {
    pub agent_name: String,
    pub content: String,
    #[serde(default)]
    pub is_final: bool,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    #[serde(default = "default_confidence")]
    pub cultural_confidence: f64,
    /// Scene description that should trigger a detached image task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visual_moment: Option<String>,
}

fn default_confidence() -> f64 {
    1.0
}

impl AgentResponse {
    pub fn new(agent_name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            agent_name: agent_name.into(),
            content: content.into(),
            is_final: false,
            metadata: HashMap::new(),
            cultural_confidence: 1.0,
            visual_moment: None,
        }
    }

    pub fn final_marker(agent_name: impl Into<String>) -> Self {
        Self {
            is_final: true,
            ..Self::new(agent_name, "")
        }
    }
}

// ============================================================================
// SESSION RECORDS
// ============================================================================

/// Session metadata, created on connect and finalized on disconnect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub session_id: String,
    pub created_at: f64,
    pub last_active: f64,
    pub language_pref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region_pref: Option<String>,
    pub age_group: String,
    pub turn_count: u64,
}

impl SessionMetadata {
    pub fn new(session_id: impl Into<String>) -> Self {
        let now = now_ts();
        Self {
            session_id: session_id.into(),
            created_at: now,
            last_active: now,
            language_pref: "en".to_string(),
            region_pref: None,
            age_group: "adult".to_string(),
            turn_count: 0,
        }
    }
}

/// A single turn in the conversation log. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub turn_id: String,
    /// "user" or "agent".
    pub role: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    pub timestamp: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<Intent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cultural_confidence: Option<f64>,
}

impl ConversationTurn {
    pub fn user(turn_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            turn_id: turn_id.into(),
            role: "user".to_string(),
            content: content.into(),
            agent: None,
            timestamp: now_ts(),
            intent: None,
            cultural_confidence: None,
        }
    }

    pub fn agent(
        turn_id: impl Into<String>,
        agent: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            turn_id: turn_id.into(),
            role: "agent".to_string(),
            content: content.into(),
            agent: Some(agent.into()),
            timestamp: now_ts(),
            intent: None,
            cultural_confidence: None,
        }
    }
}

// ============================================================================
// A2A TASK ENVELOPE
// ============================================================================

/// Lifecycle states of an agent-to-agent task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum A2aTaskState {
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// Envelope for one schema-enforced dispatch between agents.
///
/// `task_type` is the schema name the payload was validated against at
/// creation time; the dispatcher updates `state` and fills `result`/`error`
/// as the call resolves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct A2aTask {
    pub task_id: String,
    pub task_type: String,
    pub payload: Value,
    pub source_agent: String,
    pub target_agent: String,
    pub state: A2aTaskState,
    pub created_at: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_roundtrip() {
        let raw = r#"{"type":"text_input","data":"Tell me a story","seq":1}"#;
        let msg: ClientMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(
            msg,
            ClientMessage::TextInput {
                seq: 1,
                data: "Tell me a story".to_string()
            }
        );

        let reserialized = serde_json::to_string(&msg).unwrap();
        let reparsed: ClientMessage = serde_json::from_str(&reserialized).unwrap();
        assert_eq!(msg, reparsed);
    }

    #[test]
    fn test_client_message_unknown_tag_fails() {
        let raw = r#"{"type":"telepathy","data":"??"}"#;
        assert!(serde_json::from_str::<ClientMessage>(raw).is_err());
    }

    #[test]
    fn test_client_message_control_value_optional() {
        let raw = r#"{"type":"control","action":"set_language","value":"sw"}"#;
        let msg: ClientMessage = serde_json::from_str(raw).unwrap();
        match msg {
            ClientMessage::Control { action, value, .. } => {
                assert_eq!(action, "set_language");
                assert_eq!(value, Value::String("sw".to_string()));
            }
            other => panic!("unexpected variant: {:?}", other),
        }
    }

    #[test]
    fn test_server_message_omits_none_fields() {
        let msg = ServerMessage::text_chunk("Once upon a time...", "story");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "text_chunk");
        assert_eq!(json["data"], "Once upon a time...");
        assert_eq!(json["agent"], "story");
        assert!(json.get("url").is_none());
        assert!(json.get("error").is_none());
        assert!(json.get("session_id").is_none());
    }

    #[test]
    fn test_server_message_roundtrip_drops_nothing_set() {
        let msg = ServerMessage::image_ready("https://cdn.example/img.png");
        let json = serde_json::to_string(&msg).unwrap();
        let back: ServerMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind, ServerMessageType::ImageReady);
        assert_eq!(back.url.as_deref(), Some("https://cdn.example/img.png"));
        assert_eq!(back.agent.as_deref(), Some("visual"));
    }

    #[test]
    fn test_droppable_classification() {
        assert!(ServerMessage::audio_chunk("abcd").is_droppable());
        assert!(ServerMessage::text_chunk("hi", "story").is_droppable());
        assert!(ServerMessage::pong().is_droppable());
        assert!(!ServerMessage::turn_end().is_droppable());
        assert!(!ServerMessage::error("boom").is_droppable());
    }

    #[test]
    fn test_intent_serialization() {
        assert_eq!(
            serde_json::to_string(&Intent::RequestStory).unwrap(),
            "\"request_story\""
        );
        assert_eq!(
            serde_json::to_string(&OrchestratorState::Interrupted).unwrap(),
            "\"interrupted\""
        );
    }

    #[test]
    fn test_conversation_turn_constructors() {
        let user = ConversationTurn::user("turn_1", "hello");
        assert_eq!(user.role, "user");
        assert!(user.agent.is_none());

        let agent = ConversationTurn::agent("turn_1", "story", "Hadithi njoo...");
        assert_eq!(agent.role, "agent");
        assert_eq!(agent.agent.as_deref(), Some("story"));
    }
}
