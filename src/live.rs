//! Live-model session adapter
//!
//! Wraps the external duplex model session behind the [`LiveBackend`] trait
//! and normalizes its native event stream onto one queue of [`LiveEvent`]s.
//! The orchestrator talks only to [`LiveSession`]; the SDK-specific backend
//! is a collaborator supplied at connection time through a [`LiveConnector`].
//!
//! A background listener task pumps the backend; consumers pull with
//! [`LiveSession::next_event`], which applies an internal 60-second timeout
//! so a quiet channel never parks the consumer forever — the loop re-checks
//! liveness and keeps waiting while the session is connected.
//!
//! `close()` is idempotent: it flips the `connected` flag, aborts the
//! listener, and releases the backend. The flag (rather than owning
//! references in both directions) is what breaks the orchestrator ↔ adapter
//! ↔ listener cycle.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info};

use crate::Result;

/// How long `next_event` waits before re-checking liveness.
const EVENT_POLL_TIMEOUT: Duration = Duration::from_secs(60);

/// Normalized events surfaced by the live session.
#[derive(Debug, Clone, PartialEq)]
pub enum LiveEvent {
    /// Incremental text from the model.
    Text(String),
    /// Base64 audio frame from the model.
    Audio(String),
    /// The model wants a tool invoked.
    FunctionCall {
        id: String,
        name: String,
        args: Value,
    },
    /// The model finished its turn.
    TurnComplete,
    /// The model detected the user barging in.
    Interrupted,
    /// The backend surfaced an error.
    Error(String),
}

/// A tool declaration advertised to the live model at connect time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDeclaration {
    pub name: String,
    pub description: String,
    /// JSON-schema object describing the parameters.
    pub parameters: Value,
}

/// Seam over the native live-model SDK session.
///
/// Implementations translate these calls into whatever the SDK speaks and
/// yield already-normalized [`LiveEvent`]s from `next_native`.
#[async_trait]
pub trait LiveBackend: Send + Sync + 'static {
    /// Send one opaque base64 audio frame (16 kHz PCM input contract).
    async fn send_audio(&self, audio_b64: &str) -> Result<()>;

    /// Send a text utterance, marked end-of-turn.
    async fn send_text(&self, text: &str) -> Result<()>;

    /// Send one opaque base64 video frame.
    async fn send_video_frame(&self, frame_b64: &str, width: u32, height: u32) -> Result<()>;

    /// Return a tool result to the model.
    async fn send_function_response(&self, call_id: &str, name: &str, result: &str) -> Result<()>;

    /// Best-effort explicit interrupt. Backends that interrupt implicitly on
    /// new audio may keep the default no-op.
    async fn send_interrupt(&self) -> Result<()> {
        Ok(())
    }

    /// Next native event, or `None` when the backend stream closes.
    async fn next_native(&self) -> Result<Option<LiveEvent>>;

    /// Release the native session.
    async fn close(&self) -> Result<()>;
}

/// Factory for live backends; one session is acquired per connection.
#[async_trait]
pub trait LiveConnector: Send + Sync {
    async fn connect(
        &self,
        system_instruction: &str,
        tools: &[ToolDeclaration],
    ) -> Result<Arc<dyn LiveBackend>>;
}

/// A live duplex session with a normalized event queue.
pub struct LiveSession {
    session_id: String,
    backend: Arc<dyn LiveBackend>,
    event_rx: tokio::sync::Mutex<mpsc::Receiver<LiveEvent>>,
    listener: std::sync::Mutex<Option<JoinHandle<()>>>,
    connected: AtomicBool,
}

impl LiveSession {
    /// Wrap a connected backend and start the demultiplexing listener.
    pub fn start(session_id: impl Into<String>, backend: Arc<dyn LiveBackend>) -> Arc<Self> {
        let session_id = session_id.into();
        let (tx, rx) = mpsc::channel::<LiveEvent>(256);

        let listener_backend = backend.clone();
        let listener_id = session_id.clone();
        let listener = tokio::spawn(async move {
            loop {
                match listener_backend.next_native().await {
                    Ok(Some(event)) => {
                        if tx.send(event).await.is_err() {
                            break; // consumer gone
                        }
                    }
                    Ok(None) => {
                        debug!(session_id = %listener_id, "live backend stream ended");
                        break;
                    }
                    Err(e) => {
                        error!(session_id = %listener_id, %e, "live backend receive error");
                        let _ = tx.send(LiveEvent::Error(e.to_string())).await;
                        break;
                    }
                }
            }
        });

        info!(session_id = %session_id, "live session connected");

        Arc::new(Self {
            session_id,
            backend,
            event_rx: tokio::sync::Mutex::new(rx),
            listener: std::sync::Mutex::new(Some(listener)),
            connected: AtomicBool::new(true),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub async fn send_audio(&self, audio_b64: &str) -> Result<()> {
        if !self.is_connected() {
            return Ok(());
        }
        self.backend.send_audio(audio_b64).await
    }

    pub async fn send_text(&self, text: &str) -> Result<()> {
        if !self.is_connected() {
            return Ok(());
        }
        self.backend.send_text(text).await
    }

    pub async fn send_video_frame(&self, frame_b64: &str, width: u32, height: u32) -> Result<()> {
        if !self.is_connected() {
            return Ok(());
        }
        self.backend.send_video_frame(frame_b64, width, height).await
    }

    pub async fn send_function_response(
        &self,
        call_id: &str,
        name: &str,
        result: &str,
    ) -> Result<()> {
        if !self.is_connected() {
            return Ok(());
        }
        self.backend.send_function_response(call_id, name, result).await
    }

    pub async fn send_interrupt(&self) -> Result<()> {
        if !self.is_connected() {
            return Ok(());
        }
        self.backend.send_interrupt().await
    }

    /// Next normalized event; `None` once the session is closed and drained.
    ///
    /// Waits in 60-second slices so liveness can be re-checked on a quiet
    /// channel instead of blocking forever.
    pub async fn next_event(&self) -> Option<LiveEvent> {
        let mut rx = self.event_rx.lock().await;
        loop {
            // Drain whatever is queued even after close.
            match rx.try_recv() {
                Ok(event) => return Some(event),
                Err(mpsc::error::TryRecvError::Disconnected) => return None,
                Err(mpsc::error::TryRecvError::Empty) => {}
            }

            if !self.is_connected() {
                return None;
            }

            match timeout(EVENT_POLL_TIMEOUT, rx.recv()).await {
                Ok(Some(event)) => return Some(event),
                Ok(None) => return None,
                Err(_) => continue, // quiet channel; re-check liveness
            }
        }
    }

    /// Close the session. Safe to call multiple times.
    pub async fn close(&self) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }

        if let Some(handle) = self.listener.lock().expect("listener lock poisoned").take() {
            handle.abort();
        }

        if let Err(e) = self.backend.close().await {
            debug!(session_id = %self.session_id, %e, "backend close reported error");
        }

        info!(session_id = %self.session_id, "live session closed");
    }
}

// ============================================================================
// LOOPBACK BACKEND (development / tests)
// ============================================================================

/// A loopback backend that echoes text inputs as model output.
///
/// Lets the gateway run end-to-end without model credentials: every
/// `send_text` produces a `Text` echo followed by `TurnComplete`.
pub struct EchoBackend {
    events: mpsc::Sender<LiveEvent>,
    queue: tokio::sync::Mutex<mpsc::Receiver<LiveEvent>>,
}

impl EchoBackend {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(64);
        Self {
            events: tx,
            queue: tokio::sync::Mutex::new(rx),
        }
    }
}

impl Default for EchoBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LiveBackend for EchoBackend {
    async fn send_audio(&self, _audio_b64: &str) -> Result<()> {
        Ok(())
    }

    async fn send_text(&self, text: &str) -> Result<()> {
        let _ = self.events.send(LiveEvent::Text(format!("You said: {text}"))).await;
        let _ = self.events.send(LiveEvent::TurnComplete).await;
        Ok(())
    }

    async fn send_video_frame(&self, _frame_b64: &str, _w: u32, _h: u32) -> Result<()> {
        Ok(())
    }

    async fn send_function_response(&self, _id: &str, name: &str, result: &str) -> Result<()> {
        let _ = self
            .events
            .send(LiveEvent::Text(format!("[{name}] {result}")))
            .await;
        let _ = self.events.send(LiveEvent::TurnComplete).await;
        Ok(())
    }

    async fn next_native(&self) -> Result<Option<LiveEvent>> {
        Ok(self.queue.lock().await.recv().await)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Connector producing [`EchoBackend`]s.
pub struct EchoConnector;

#[async_trait]
impl LiveConnector for EchoConnector {
    async fn connect(
        &self,
        _system_instruction: &str,
        _tools: &[ToolDeclaration],
    ) -> Result<Arc<dyn LiveBackend>> {
        Ok(Arc::new(EchoBackend::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_echo_backend_roundtrip() {
        let backend = Arc::new(EchoBackend::new());
        let session = LiveSession::start("sess-test", backend);

        session.send_text("hello").await.unwrap();

        assert_eq!(
            session.next_event().await,
            Some(LiveEvent::Text("You said: hello".to_string()))
        );
        assert_eq!(session.next_event().await, Some(LiveEvent::TurnComplete));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let backend = Arc::new(EchoBackend::new());
        let session = LiveSession::start("sess-test", backend);

        assert!(session.is_connected());
        session.close().await;
        assert!(!session.is_connected());
        session.close().await; // second close is a no-op
        assert!(!session.is_connected());
    }

    #[tokio::test]
    async fn test_sends_after_close_are_noops() {
        let backend = Arc::new(EchoBackend::new());
        let session = LiveSession::start("sess-test", backend);
        session.close().await;

        // No panic, no error: the session silently drops post-close sends.
        session.send_text("too late").await.unwrap();
        session.send_audio("AAAA").await.unwrap();
        assert_eq!(session.next_event().await, None);
    }

    #[tokio::test]
    async fn test_queued_events_drain_after_close() {
        let backend = Arc::new(EchoBackend::new());
        let session = LiveSession::start("sess-test", backend.clone());

        session.send_text("first").await.unwrap();
        // Give the listener a beat to pump both events onto the queue.
        tokio::time::sleep(Duration::from_millis(20)).await;
        session.close().await;

        // Events already demultiplexed are still deliverable.
        assert!(matches!(session.next_event().await, Some(LiveEvent::Text(_))));
        assert_eq!(session.next_event().await, Some(LiveEvent::TurnComplete));
        assert_eq!(session.next_event().await, None);
    }

    #[tokio::test]
    async fn test_function_response_echoes() {
        let backend = Arc::new(EchoBackend::new());
        let session = LiveSession::start("sess-test", backend);

        session
            .send_function_response("call_1", "tell_story", "Once, Anansi...")
            .await
            .unwrap();

        match session.next_event().await {
            Some(LiveEvent::Text(text)) => {
                assert!(text.contains("tell_story"));
                assert!(text.contains("Anansi"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
