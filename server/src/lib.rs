pub mod config;
pub mod error;
pub mod metrics;
pub mod protocol;
pub mod session;
pub mod telemetry;
pub mod validation;

use std::{future::Future, sync::Arc};

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Request, State,
    },
    middleware::Next,
    response::Response,
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use tokio::{
    net::TcpListener,
    sync::{mpsc, watch},
};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};
use tts_core::{
    scripted::{ScriptedBackend, ScriptedLoader},
    BackendLoader, PiperLoader, SynthesisEngine,
};
use uuid::Uuid;

use crate::{
    config::{BackendKind, ServerConfig},
    metrics::{AppMetrics, MetricsResponse},
    protocol::ServerMessage,
    session::Session,
};

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<SynthesisEngine>,
    pub metrics: Arc<AppMetrics>,
    pub config: Arc<ServerConfig>,
    pub shutdown: watch::Receiver<bool>,
}

impl AppState {
    /// Returns the state and the sender that tells every session to close.
    pub fn new(engine: Arc<SynthesisEngine>, config: ServerConfig) -> (Self, watch::Sender<bool>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let state = Self {
            engine,
            metrics: Arc::new(AppMetrics::new()),
            config: Arc::new(config),
            shutdown: shutdown_rx,
        };
        (state, shutdown_tx)
    }
}

/// Loader for the configured backend
pub fn backend_loader(config: &ServerConfig) -> Box<dyn BackendLoader> {
    match config.backend {
        BackendKind::Piper => Box::new(PiperLoader),
        BackendKind::Scripted => {
            let voice = config.default_voice.as_str();
            Box::new(ScriptedLoader::new(
                ScriptedBackend::tone(1.5, 24_000).with_voices(&[voice]),
            ))
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .route("/ws", get(ws_handler))
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_endpoint))
        .layer(axum::middleware::from_fn(add_request_id))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

/// Serve until `signal` resolves. Sessions are closed through the state's
/// shutdown channel, which the caller triggers alongside `signal`.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    signal: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(signal)
        .await?;
    Ok(())
}

pub async fn health_check() -> &'static str {
    "ok"
}

pub async fn metrics_endpoint(State(state): State<AppState>) -> Json<MetricsResponse> {
    Json(state.metrics.snapshot())
}

// Request ID for tracing
async fn add_request_id(mut request: Request, next: Next) -> Response {
    let request_id = Uuid::new_v4().to_string();
    if let Ok(value) = axum::http::HeaderValue::from_str(&request_id) {
        request.headers_mut().insert("x-request-id", value.clone());
        let mut response = next.run(request).await;
        response.headers_mut().insert("x-request-id", value);
        return response;
    }
    next.run(request).await
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let session_id = Uuid::new_v4();
    info!(session = %session_id, "Client connected");
    let _session_guard = state.metrics.session_opened();

    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ServerMessage>();
    let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();

    // Writer: serialize in order, then close once the session is done
    let writer = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(e) => {
                    error!("Failed to serialize message: {e}");
                    continue;
                }
            };
            if let Err(e) = sink.send(Message::Text(text.into())).await {
                warn!("Failed to send WS message: {e}");
                return;
            }
        }
        let _ = sink.send(Message::Close(None)).await;
    });

    let reader = tokio::spawn(async move {
        while let Some(frame) = stream.next().await {
            let text = match frame {
                Ok(Message::Text(text)) => text.as_str().to_owned(),
                Ok(Message::Binary(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => {
                    debug!("WebSocket receive error: {e}");
                    break;
                }
            };
            if in_tx.send(text).is_err() {
                break;
            }
        }
    });

    let session = Session::new(
        session_id,
        Arc::clone(&state.engine),
        Arc::clone(&state.metrics),
        state.config.max_text_length,
        out_tx,
    );
    session.run(in_rx, state.shutdown.clone()).await;

    reader.abort();
    let _ = writer.await;
    info!(session = %session_id, "Client disconnected");
}
