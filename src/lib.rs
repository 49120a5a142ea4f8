//! # Griot Live
//!
//! A real-time, bidirectional conversational gateway for an oral-storytelling
//! AI agent. Many simultaneous WebSocket clients each hold a persistent
//! duplex session carrying audio, text, and video in both directions; the
//! gateway interleaves the primary live-model stream with specialized
//! sub-agents (story, riddle, cultural grounding, visual) whose outputs are
//! injected back into the model as tool results and forwarded to the client
//! as typed messages.
//!
//! ## Architecture
//!
//! ```text
//! client ⇄ gateway ⇄ orchestrator ⇄ live session ⇄ external model
//!                        │
//!                        ├─ A2A dispatch ─▶ sub-agents ─▶ cultural validator
//!                        │                                      │
//!                        ├──────────◀ streaming controller ◀────┘
//!                        └─ memory manager ─▶ session store
//! ```
//!
//! Three disciplines hold the system together:
//!
//! - **Typed boundaries**: every payload crossing an agent boundary is
//!   validated against a named JSON schema; violations trigger a retry with
//!   corrective instructions, then a safe fallback. No unvalidated payload
//!   reaches the model as a tool result.
//! - **Hot-path grounding**: each chunk a producing agent emits passes
//!   through the cultural validator (knowledge base, heuristics, optional
//!   model verdict, hedging policy) before it can reach the wire.
//! - **Isolation under failure**: per-agent circuit breakers, tight
//!   validation ceilings, fire-and-forget persistence, and a detached image
//!   side-channel that can never block, delay, or fail the primary stream.
//!
//! ## Modules
//!
//! - **gateway**: WebSocket endpoint, connection registry, receive/send
//!   loops, health probes
//! - **orchestrator**: per-session state machine and tool-call routing
//! - **dispatch**: grounding pipeline, circuit breakers, timeout policy
//! - **a2a**: schema-enforced dispatch with retry-with-correction
//! - **schema**: compiled draft-07 contract registry
//! - **agents**: story, riddle, cultural, and visual producers
//! - **live**: duplex adapter over the external live-model session
//! - **textgen**: streaming text-model client for sub-agents
//! - **stream**: output queue and sentence-boundary pacing
//! - **memory** / **store**: turn ring, rolling summary, durable-store seam
//! - **breaker**, **retry**, **knowledge**, **config**, **error**: support

mod breaker;
mod config;
mod dispatch;
mod error;
mod knowledge;
mod memory;
mod orchestrator;
mod schema;
mod store;
mod stream;
mod types;

/// Schema-enforced agent-to-agent dispatch, safe fallbacks, agent cards.
pub mod a2a;

/// Sub-agent implementations and the shared producer contract.
pub mod agents;

/// WebSocket gateway, connection registry, health endpoints.
pub mod gateway;

/// Live-model session adapter and backend seams.
pub mod live;

/// Retry utilities with exponential backoff (used by the text client).
pub mod retry;

/// Streaming text-model client.
pub mod textgen;

// --- Core re-exports ---

pub use breaker::{BreakerStatus, CircuitBreaker, CircuitState};
pub use config::Settings;
pub use dispatch::AgentDispatcher;
pub use error::{Error, Result};
pub use knowledge::{CulturalKnowledge, KbOutcome};
pub use memory::MemoryManager;
pub use orchestrator::{Orchestrator, tool_declarations};
pub use schema::{SchemaRegistry, registry};
pub use store::{MemoryStore, SessionStore};
pub use stream::{OutputQueue, StreamingController};
pub use types::{
    A2aTask, A2aTaskState, AgentRequest, AgentResponse, ClientMessage, ConversationTurn, Intent,
    OrchestratorState, ServerMessage, ServerMessageType, SessionMetadata,
};

/// Commonly used items for embedding the gateway.
pub mod prelude {
    pub use crate::agents::Agent;
    pub use crate::gateway::{AppState, router, serve};
    pub use crate::live::{EchoConnector, LiveBackend, LiveConnector, LiveEvent};
    pub use crate::textgen::{HttpTextClient, TextClientPool, TextModel};
    pub use crate::{
        AgentRequest, AgentResponse, ClientMessage, Error, Intent, MemoryStore, Orchestrator,
        Result, ServerMessage, ServerMessageType, Settings,
    };
}
