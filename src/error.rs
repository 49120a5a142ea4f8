//! Error types for Griot Live
//!
//! One error enum covers the whole crate, mirroring the runtime's error
//! taxonomy: client-protocol faults stay on the connection, schema violations
//! carry the contract name and the validator's messages, agent failures are
//! split into timeout and crash so the dispatcher can answer differently,
//! and persistence failures are always swallowed by callers after logging.

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the gateway and its agents
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP request error (text-model endpoint)
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Malformed inbound client message; non-fatal to the connection
    #[error("Client protocol error: {0}")]
    Protocol(String),

    /// A payload failed validation against a named A2A schema
    #[error("Schema '{schema}' violation: {}", .errors.join("; "))]
    SchemaViolation {
        schema: String,
        errors: Vec<String>,
    },

    /// A sub-agent exceeded its dispatch ceiling
    #[error("Agent '{0}' timed out")]
    AgentTimeout(String),

    /// A sub-agent failed for a non-timeout reason
    #[error("Agent error: {0}")]
    Agent(String),

    /// The live-model adapter surfaced an error event
    #[error("Live model error: {0}")]
    LiveModel(String),

    /// A durable-store operation failed; callers log and swallow
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// The output queue wait exceeded its bound
    #[error("Output queue backpressure timeout")]
    Backpressure,

    /// The connection (or a queue attached to it) is gone
    #[error("Connection closed")]
    ConnectionClosed,

    /// Streaming error
    #[error("Streaming error: {0}")]
    Stream(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Timeout error
    #[error("Request timeout")]
    Timeout,
}

impl Error {
    /// Create a new config error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a new client-protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    /// Create a schema-violation error
    pub fn schema_violation(schema: impl Into<String>, errors: Vec<String>) -> Self {
        Error::SchemaViolation {
            schema: schema.into(),
            errors,
        }
    }

    /// Create an agent-timeout error
    pub fn agent_timeout(agent: impl Into<String>) -> Self {
        Error::AgentTimeout(agent.into())
    }

    /// Create an agent-crash error
    pub fn agent(msg: impl Into<String>) -> Self {
        Error::Agent(msg.into())
    }

    /// Create a live-model error
    pub fn live_model(msg: impl Into<String>) -> Self {
        Error::LiveModel(msg.into())
    }

    /// Create a persistence error
    pub fn persistence(msg: impl Into<String>) -> Self {
        Error::Persistence(msg.into())
    }

    /// Create a new stream error
    pub fn stream(msg: impl Into<String>) -> Self {
        Error::Stream(msg.into())
    }

    /// Create a new invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Error::InvalidInput(msg.into())
    }

    /// Create a timeout error
    pub fn timeout() -> Self {
        Error::Timeout
    }

    /// True for errors the dispatcher records against a circuit breaker
    pub fn counts_as_agent_failure(&self) -> bool {
        matches!(
            self,
            Error::AgentTimeout(_) | Error::Agent(_) | Error::Timeout | Error::Stream(_)
        )
    }
}
