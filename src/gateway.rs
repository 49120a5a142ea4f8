//! WebSocket gateway
//!
//! Entry point for all real-time client communication. Each accepted
//! connection gets its own session id, output queue, and orchestrator; the
//! receive loop and the send loop then run concurrently for the connection
//! lifetime, so inbound audio and outbound stream never block each other.
//!
//! Wire contract: one JSON object per text frame. Outbound frames are
//! stamped with a per-connection sequence starting at 1, assigned here at
//! send time — producers upstream never see sequence numbers, which is what
//! lets dropped messages leave no visible hole.
//!
//! A process-wide registry tracks live connections for the readiness
//! endpoint and teardown bookkeeping; nothing else reads it.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agents::visual::{ImageModel, MediaStore};
use crate::config::Settings;
use crate::live::LiveConnector;
use crate::orchestrator::Orchestrator;
use crate::store::SessionStore;
use crate::stream::OutputQueue;
use crate::textgen::TextModel;
use crate::types::{ClientMessage, ServerMessage, now_ts};
use crate::{Error, Result};

/// Idle span after which the send loop emits a keepalive pong.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Registry entry for one live connection.
pub struct ConnectionEntry {
    pub connected_at: f64,
}

/// Shared process state behind the router.
pub struct AppState {
    pub settings: Arc<Settings>,
    pub store: Arc<dyn SessionStore>,
    pub text_model: Arc<dyn TextModel>,
    pub image_model: Option<Arc<dyn ImageModel>>,
    pub media_store: Option<Arc<dyn MediaStore>>,
    pub connector: Arc<dyn LiveConnector>,
    connections: DashMap<String, ConnectionEntry>,
}

impl AppState {
    pub fn new(
        settings: Arc<Settings>,
        store: Arc<dyn SessionStore>,
        text_model: Arc<dyn TextModel>,
        image_model: Option<Arc<dyn ImageModel>>,
        media_store: Option<Arc<dyn MediaStore>>,
        connector: Arc<dyn LiveConnector>,
    ) -> Arc<Self> {
        Arc::new(Self {
            settings,
            store,
            text_model,
            image_model,
            media_store,
            connector,
            connections: DashMap::new(),
        })
    }

    /// Live connection count (readiness surface).
    pub fn active_connections(&self) -> usize {
        self.connections.len()
    }
}

/// Build the HTTP router: the WebSocket endpoint plus health probes.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .with_state(state)
}

/// Bind and serve until the process exits.
pub async fn serve(state: Arc<AppState>) -> Result<()> {
    let addr = state.settings.bind_addr.clone();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| Error::config(format!("cannot bind {addr}: {e}")))?;
    info!(%addr, "gateway listening");

    axum::serve(listener, router(state))
        .await
        .map_err(|e| Error::stream(format!("server error: {e}")))
}

async fn healthz() -> Json<serde_json::Value> {
    Json(json!({ "status": "healthy" }))
}

async fn readyz(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ready",
        "active_connections": state.active_connections(),
    }))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

fn new_session_id() -> String {
    Uuid::new_v4().simple().to_string()[..12].to_string()
}

/// One connection, cradle to grave.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let session_id = new_session_id();
    info!(session_id = %session_id, "websocket connected");

    let queue = Arc::new(OutputQueue::new(state.settings.stream_buffer_high_watermark));
    // Handshake confirmation goes out first, before any model traffic can
    // race it onto the queue.
    let _ = queue.try_push(ServerMessage::session_created(&session_id));

    let orchestrator = match Orchestrator::connect(
        &session_id,
        &state.settings,
        state.store.clone(),
        state.text_model.clone(),
        state.image_model.clone(),
        state.media_store.clone(),
        state.connector.as_ref(),
        queue.clone(),
    )
    .await
    {
        Ok(orchestrator) => orchestrator,
        Err(e) => {
            warn!(session_id = %session_id, %e, "session setup failed");
            let mut socket = socket;
            let mut msg = ServerMessage::error("session setup failed");
            msg.seq = 1;
            if let Ok(frame) = serde_json::to_string(&msg) {
                let _ = socket.send(Message::Text(frame)).await;
            }
            return;
        }
    };

    state.connections.insert(
        session_id.clone(),
        ConnectionEntry {
            connected_at: now_ts(),
        },
    );

    let (sink, stream) = socket.split();
    let send_task = tokio::spawn(send_loop(sink, queue.clone(), session_id.clone()));

    receive_loop(stream, &orchestrator, &queue, &session_id).await;

    // ── Teardown: idempotent, survives partial failure ──
    queue.close();
    orchestrator.shutdown().await;
    let _ = send_task.await;
    state.connections.remove(&session_id);
    info!(session_id = %session_id, "connection cleaned up");
}

/// Drain the output queue onto the transport, stamping sequence numbers.
async fn send_loop(
    mut sink: futures::stream::SplitSink<WebSocket, Message>,
    queue: Arc<OutputQueue>,
    session_id: String,
) {
    let seq = AtomicU64::new(0);

    loop {
        let mut msg = match timeout(KEEPALIVE_INTERVAL, queue.pop()).await {
            Ok(Some(msg)) => msg,
            Ok(None) => break, // queue closed and drained
            Err(_) => ServerMessage::pong(),
        };

        msg.seq = seq.fetch_add(1, Ordering::SeqCst) + 1;

        let frame = match serde_json::to_string(&msg) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(session_id = %session_id, %e, "serialization failed");
                continue;
            }
        };

        if sink.send(Message::Text(frame)).await.is_err() {
            debug!(session_id = %session_id, "send failed, client gone");
            break;
        }
    }
}

/// Deserialize and route inbound frames until the client goes away.
async fn receive_loop(
    mut stream: futures::stream::SplitStream<WebSocket>,
    orchestrator: &Arc<Orchestrator>,
    queue: &Arc<OutputQueue>,
    session_id: &str,
) {
    while let Some(frame) = stream.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue, // binary/ping/pong frames are not protocol
            Err(e) => {
                debug!(session_id, %e, "websocket receive error");
                break;
            }
        };

        if let Err(e) = route_message(&text, orchestrator, queue).await {
            warn!(session_id, %e, "message handling failed");
            let _ = queue.push(ServerMessage::error(e.to_string())).await;
        }
    }
}

/// Parse one frame and dispatch to the orchestrator by tag.
async fn route_message(
    text: &str,
    orchestrator: &Arc<Orchestrator>,
    queue: &Arc<OutputQueue>,
) -> Result<()> {
    let msg: ClientMessage = serde_json::from_str(text)
        .map_err(|e| Error::protocol(format!("malformed message: {e}")))?;

    match msg {
        ClientMessage::AudioChunk { data, .. } => orchestrator.handle_audio_chunk(&data).await?,
        ClientMessage::TextInput { data, .. } => orchestrator.handle_text_input(&data).await?,
        ClientMessage::VideoFrame {
            data,
            width,
            height,
            ..
        } => {
            orchestrator
                .handle_video_frame(&data, width.unwrap_or(640), height.unwrap_or(480))
                .await?
        }
        ClientMessage::Interrupt { .. } => {
            orchestrator.handle_interrupt().await;
            queue
                .push(ServerMessage::interrupted(orchestrator.session_id()))
                .await?;
        }
        ClientMessage::Control { action, value, .. } => {
            orchestrator.handle_control(&action, &value)
        }
        ClientMessage::Ping { .. } => queue.push(ServerMessage::pong()).await?,
        ClientMessage::SessionInit { session_id, .. } => {
            if let Some(session_id) = session_id {
                orchestrator.restore_session(&session_id).await;
            }
        }
    }
    Ok(())
}
