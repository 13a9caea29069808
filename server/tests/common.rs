//! Common utilities for integration tests

#![allow(dead_code)]

use std::{net::SocketAddr, sync::Arc, time::Duration};

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::watch,
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tts_core::{
    scripted::{ScriptedBackend, ScriptedLoader},
    SynthesisEngine,
};
use tts_server::{
    config::{BackendKind, ServerConfig},
    serve, AppState,
};

pub type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct TestServer {
    pub addr: SocketAddr,
    pub state: AppState,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<anyhow::Result<()>>,
}

impl TestServer {
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = tokio::time::timeout(Duration::from_secs(5), self.task).await;
    }
}

/// Engine over a scripted backend with voices `alba` (default) and `bryce`
pub fn test_state(backend: ScriptedBackend) -> (AppState, watch::Sender<bool>) {
    let config = ServerConfig {
        default_voice: "alba".to_string(),
        backend: BackendKind::Scripted,
        ..ServerConfig::default()
    };
    let engine = SynthesisEngine::new(config.engine_config()).expect("valid engine config");
    engine
        .initialize(&ScriptedLoader::new(backend.with_voices(&["alba", "bryce"])))
        .expect("scripted backend loads");
    AppState::new(Arc::new(engine), config)
}

/// Start a server on an ephemeral port
pub async fn spawn_server(backend: ScriptedBackend) -> TestServer {
    let (state, shutdown) = test_state(backend);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let mut signal = shutdown.subscribe();
    let task = tokio::spawn(serve(listener, state.clone(), async move {
        let _ = signal.changed().await;
    }));
    TestServer {
        addr,
        state,
        shutdown,
        task,
    }
}

pub async fn connect(addr: SocketAddr) -> Client {
    let (client, _response) = connect_async(format!("ws://{addr}/ws"))
        .await
        .expect("WebSocket handshake");
    client
}

pub async fn send_json(client: &mut Client, value: Value) {
    client.send(Message::Text(value.to_string().into())).await.unwrap();
}

pub async fn send_raw(client: &mut Client, text: &str) {
    client.send(Message::Text(text.to_string().into())).await.unwrap();
}

/// Next JSON message, skipping control frames
pub async fn recv_json(client: &mut Client) -> Value {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("timed out waiting for a message")
            .expect("connection closed")
            .expect("WebSocket error");
        match message {
            Message::Text(text) => return serde_json::from_str(text.as_str()).expect("server sent JSON"),
            Message::Close(frame) => panic!("server closed the connection: {frame:?}"),
            _ => continue,
        }
    }
}

/// Messages through the end of the current job (`synthesis_completed` or `error`)
pub async fn collect_job(client: &mut Client) -> Vec<Value> {
    let mut messages = Vec::new();
    loop {
        let message = recv_json(client).await;
        let kind = message["type"].as_str().unwrap_or_default().to_string();
        messages.push(message);
        if kind == "synthesis_completed" || kind == "error" {
            return messages;
        }
    }
}

pub fn of_type<'a>(messages: &'a [Value], kind: &str) -> Vec<&'a Value> {
    messages.iter().filter(|m| m["type"] == kind).collect()
}
