//! HTTP/WebSocket front end.
//!
//! Each upgraded socket gets a reader task forwarding text frames to the
//! distributor and a writer task draining the session's outbound channel.

use crate::distributor::{Distributor, DistributorConfig, DistributorHandle};
use crate::session::Outbound;
use crate::source::FrameSource;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

pub const DEFAULT_BIND: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 8080;

/// Messages buffered between a session and its socket writer
pub const DEFAULT_TRANSPORT_BUFFER: usize = 64;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    pub transport_buffer: usize,
    pub distributor: DistributorConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            port: DEFAULT_PORT,
            transport_buffer: DEFAULT_TRANSPORT_BUFFER,
            distributor: DistributorConfig::default(),
        }
    }
}

/// State shared with axum handlers
#[derive(Clone)]
pub struct AppState {
    pub distributor: DistributorHandle,
    pub transport_buffer: usize,
}

/// Routes: `/ws` for the stream protocol, `/health` for a JSON status summary
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Bind, spawn the distributor and serve until [`ServerHandle::shutdown`]
pub async fn start<S: FrameSource + 'static>(
    config: ServerConfig,
    source: S,
) -> std::io::Result<ServerHandle> {
    let listener = tokio::net::TcpListener::bind((config.bind.as_str(), config.port)).await?;
    let local_addr = listener.local_addr()?;

    let (distributor, distributor_task) = Distributor::new(source, config.distributor).spawn();
    let router = build_router(AppState {
        distributor: distributor.clone(),
        transport_buffer: config.transport_buffer.max(1),
    });

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await;
        if let Err(e) = result {
            log::warn!("Server error: {}", e);
        }
    });

    log::info!("Listening on ws://{}/ws", local_addr);

    Ok(ServerHandle {
        local_addr,
        distributor,
        shutdown_tx: Some(shutdown_tx),
        server,
        distributor_task,
    })
}

/// Running server
pub struct ServerHandle {
    local_addr: SocketAddr,
    distributor: DistributorHandle,
    shutdown_tx: Option<oneshot::Sender<()>>,
    server: JoinHandle<()>,
    distributor_task: JoinHandle<()>,
}

impl ServerHandle {
    /// Address actually bound (resolves port 0)
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// WebSocket URL clients should dial
    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.local_addr)
    }

    pub fn distributor(&self) -> &DistributorHandle {
        &self.distributor
    }

    /// Stop the distributor (closing every session), then the listener
    pub async fn shutdown(mut self) {
        self.distributor.shutdown().await;
        if let Err(e) = (&mut self.distributor_task).await {
            log::warn!("Distributor task failed: {}", e);
        }

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if tokio::time::timeout(SHUTDOWN_GRACE, &mut self.server).await.is_err() {
            log::warn!("Server did not drain within {:?}, aborting", SHUTDOWN_GRACE);
            self.server.abort();
        }
        log::info!("Server on {} stopped", self.local_addr);
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (sink_tx, mut sink_rx) = mpsc::channel::<Outbound>(state.transport_buffer);
    let Some(handle) = state.distributor.connect(sink_tx).await else {
        log::warn!("Distributor unavailable, dropping connection");
        return;
    };

    let (mut ws_tx, mut ws_rx) = socket.split();

    // Ends when the distributor drops the session or the socket fails
    let mut writer = tokio::spawn(async move {
        while let Some(text) = sink_rx.recv().await {
            if ws_tx.send(Message::Text(text.to_string().into())).await.is_err() {
                return;
            }
        }
        let _ = ws_tx.send(Message::Close(None)).await;
    });

    let distributor = state.distributor.clone();
    let mut reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                Message::Text(text) => {
                    if !distributor.message(handle, text.to_string()).await {
                        break;
                    }
                }
                Message::Close(_) => break,
                Message::Binary(_) => log::debug!("{}: ignoring binary message", handle),
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => writer.abort(),
    }

    state.distributor.disconnect(handle).await;
    log::debug!("{} socket closed", handle);
}

async fn health_handler(State(state): State<AppState>) -> Response {
    match state.distributor.health().await {
        Some(report) => (StatusCode::OK, Json(report)).into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "status": "stopped" })),
        )
            .into_response(),
    }
}
