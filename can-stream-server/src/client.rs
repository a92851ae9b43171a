//! Reconnecting WebSocket client for the `/ws` protocol.
//!
//! A background task owns the connection. It moves through
//! `Disconnected → Connecting → Connected`, retries after a fixed delay, and
//! gives up with a terminal `Error` once `max_reconnect_attempts` is exceeded.
//! Inbound frames are batched and appended to a capped history.

use crate::protocol::ClientMessage;
use crate::protocol::ServerMessage;
use crate::queue::BoundedQueue;
use can_frame_decoder::CanFrame;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

pub const DEFAULT_URL: &str = "ws://127.0.0.1:8080/ws";
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(3);
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
pub const DEFAULT_BATCH_INTERVAL: Duration = Duration::from_millis(50);
pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const DEFAULT_HISTORY_CAPACITY: usize = 10_000;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Connection lifecycle as seen by the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error(String),
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Error(reason) => write!(f, "error: {}", reason),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub url: String,
    /// Limit on establishing one connection (TCP + WebSocket handshake)
    pub connect_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub reconnect_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub batch_interval: Duration,
    pub batch_size: usize,
    pub history_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            batch_interval: DEFAULT_BATCH_INTERVAL,
            batch_size: DEFAULT_BATCH_SIZE,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    #[error("not connected")]
    NotConnected,

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("connection attempt timed out after {0:?}")]
    Timeout(Duration),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("gave up after {0} reconnect attempts")]
    ReconnectExhausted(u32),
}

/// Counters kept by the connection task
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientStats {
    pub connection_attempts: u64,
    pub connections: u64,
    /// Consecutive failed attempts since the last successful connection
    pub reconnect_attempts: u32,
    pub connection_errors: u64,
    pub timeouts: u64,
    pub frames_received: u64,
    pub batches_flushed: u64,
    pub messages_sent: u64,
    pub protocol_errors: u64,
    pub history_len: usize,
    pub last_error: Option<String>,
}

/// Notifications for the application
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    State(ConnectionState),
    Batch(Vec<CanFrame>),
    /// Any non-frame server message
    Message(ServerMessage),
}

/// Accumulates inbound frames until the next flush
#[derive(Debug)]
pub struct FrameBatcher {
    buffer: Vec<CanFrame>,
    max_size: usize,
}

impl FrameBatcher {
    pub fn new(max_size: usize) -> Self {
        let max_size = max_size.max(1);
        Self {
            buffer: Vec::with_capacity(max_size),
            max_size,
        }
    }

    /// Buffer a frame; true once the batch has reached its size threshold
    pub fn push(&mut self, frame: CanFrame) -> bool {
        self.buffer.push(frame);
        self.buffer.len() >= self.max_size
    }

    /// Drain the buffered frames
    pub fn take(&mut self) -> Vec<CanFrame> {
        std::mem::take(&mut self.buffer)
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

/// Most recent frames, oldest evicted first
#[derive(Debug)]
pub struct FrameHistory {
    frames: BoundedQueue<CanFrame>,
}

impl FrameHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: BoundedQueue::new(capacity),
        }
    }

    /// Append frames, returning how many old ones were evicted
    pub fn extend(&mut self, frames: impl IntoIterator<Item = CanFrame>) -> usize {
        let mut evicted = 0;
        for frame in frames {
            if self.frames.push_back(frame).is_some() {
                evicted += 1;
            }
        }
        evicted
    }

    /// All retained frames, oldest first
    pub fn snapshot(&self) -> Vec<CanFrame> {
        self.frames.iter().cloned().collect()
    }

    /// Up to `n` newest frames, oldest first
    pub fn latest(&self, n: usize) -> Vec<CanFrame> {
        let skip = self.frames.len().saturating_sub(n);
        self.frames.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.frames.capacity()
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }
}

#[derive(Debug)]
struct Shared {
    history: FrameHistory,
    stats: ClientStats,
    gave_up: bool,
}

/// Client handle. Dropping it stops the connection task.
pub struct ReconnectingClient {
    config: ClientConfig,
    state: Arc<watch::Sender<ConnectionState>>,
    shared: Arc<Mutex<Shared>>,
    events_tx: mpsc::Sender<ClientEvent>,
    events_rx: Option<mpsc::Receiver<ClientEvent>>,
    outbound: Option<mpsc::UnboundedSender<ClientMessage>>,
    task: Option<(oneshot::Sender<()>, JoinHandle<()>)>,
}

impl ReconnectingClient {
    /// Create a disconnected client. Zero heartbeat and batch intervals are
    /// raised to 1 ms.
    pub fn new(mut config: ClientConfig) -> Self {
        config.heartbeat_interval = config.heartbeat_interval.max(crate::MIN_TIMER_PERIOD);
        config.batch_interval = config.batch_interval.max(crate::MIN_TIMER_PERIOD);
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let shared = Shared {
            history: FrameHistory::new(config.history_capacity),
            stats: ClientStats::default(),
            gave_up: false,
        };
        Self {
            config,
            state: Arc::new(state),
            shared: Arc::new(Mutex::new(shared)),
            events_tx,
            events_rx: Some(events_rx),
            outbound: None,
            task: None,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// Receiver notified on every state change
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Take the event receiver; `None` after the first call.
    /// Events are dropped while the receiver is full.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.events_rx.take()
    }

    /// Whether the connection task is alive (connected or retrying)
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|(_, task)| !task.is_finished())
    }

    /// Start the connection task. A no-op while it is running; after the
    /// task gave up this starts a fresh attempt cycle.
    pub fn connect(&mut self) {
        if self.is_running() {
            return;
        }
        if let Some((_, task)) = self.task.take() {
            task.abort();
        }

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = ConnectionTask {
            config: self.config.clone(),
            state: Arc::clone(&self.state),
            shared: Arc::clone(&self.shared),
            events: self.events_tx.clone(),
            outbound: outbound_rx,
            shutdown: shutdown_rx,
        };

        // Leave any terminal error behind before the task gets scheduled
        self.state.send_replace(ConnectionState::Connecting);
        let _ = self.events_tx.try_send(ClientEvent::State(ConnectionState::Connecting));

        log::info!("Connecting to {}", self.config.url);
        self.outbound = Some(outbound_tx);
        self.task = Some((shutdown_tx, tokio::spawn(task.run())));
    }

    /// True once the current attempt cycle exhausted its reconnects
    pub async fn gave_up(&self) -> bool {
        self.shared.lock().await.gave_up
    }

    /// Wait until connected, the task gives up, or `limit` passes
    pub async fn wait_connected(&self, limit: Duration) -> Result<(), ClientError> {
        let mut rx = self.state.subscribe();
        let max_attempts = self.config.max_reconnect_attempts;
        let wait = async {
            loop {
                let state = rx.borrow_and_update().clone();
                if state == ConnectionState::Connected {
                    return Ok(());
                }
                let gave_up = self.shared.lock().await.gave_up;
                if gave_up && matches!(state, ConnectionState::Error(_)) {
                    return Err(ClientError::ReconnectExhausted(max_attempts));
                }
                if !self.is_running() {
                    return Err(if gave_up {
                        ClientError::ReconnectExhausted(max_attempts)
                    } else {
                        ClientError::NotConnected
                    });
                }
                if rx.changed().await.is_err() {
                    return Err(ClientError::NotConnected);
                }
            }
        };
        tokio::time::timeout(limit, wait)
            .await
            .map_err(|_| ClientError::Timeout(limit))?
    }

    /// Flush buffered frames, send a close frame and stop retrying
    pub async fn disconnect(&mut self) {
        self.outbound = None;
        if let Some((shutdown, task)) = self.task.take() {
            let _ = shutdown.send(());
            if let Err(e) = task.await {
                log::warn!("Connection task failed: {}", e);
            }
        }
        self.state.send_replace(ConnectionState::Disconnected);
        log::info!("Disconnected from {}", self.config.url);
    }

    /// Queue a message for the server. Only allowed while connected.
    pub fn send(&self, message: ClientMessage) -> Result<(), ClientError> {
        if self.state() != ConnectionState::Connected {
            return Err(ClientError::NotConnected);
        }
        let outbound = self.outbound.as_ref().ok_or(ClientError::NotConnected)?;
        outbound.send(message).map_err(|_| ClientError::NotConnected)
    }

    pub fn subscribe(&self, message_ids: Vec<u32>) -> Result<(), ClientError> {
        self.send(ClientMessage::Subscribe { message_ids })
    }

    pub fn unsubscribe(&self, message_ids: Vec<u32>) -> Result<(), ClientError> {
        self.send(ClientMessage::Unsubscribe { message_ids })
    }

    /// Replace the server-side bus and id filters; `None` clears one
    pub fn set_filters(
        &self,
        bus_filter: Option<Vec<u8>>,
        id_filter: Option<Vec<u32>>,
    ) -> Result<(), ClientError> {
        self.send(ClientMessage::SetFilters { bus_filter, id_filter })
    }

    pub fn start_stream(&self) -> Result<(), ClientError> {
        self.send(ClientMessage::Start)
    }

    pub fn stop_stream(&self) -> Result<(), ClientError> {
        self.send(ClientMessage::Stop)
    }

    /// Ask the server to transmit `frame` on the bus
    pub fn send_frame(&self, frame: &CanFrame) -> Result<(), ClientError> {
        let frame = serde_json::to_value(frame).map_err(|e| ClientError::Protocol(e.to_string()))?;
        self.send(ClientMessage::SendFrame { frame })
    }

    pub fn request_interface_info(&self) -> Result<(), ClientError> {
        self.send(ClientMessage::GetInterfaceInfo)
    }

    /// Copy of the frame history, oldest first
    pub async fn history(&self) -> Vec<CanFrame> {
        self.shared.lock().await.history.snapshot()
    }

    /// Up to `n` newest frames from history
    pub async fn latest_frames(&self, n: usize) -> Vec<CanFrame> {
        self.shared.lock().await.history.latest(n)
    }

    pub async fn clear_history(&self) {
        self.shared.lock().await.history.clear();
    }

    /// Counters with the current history length filled in
    pub async fn stats(&self) -> ClientStats {
        let shared = self.shared.lock().await;
        ClientStats {
            history_len: shared.history.len(),
            ..shared.stats.clone()
        }
    }
}

enum SessionEnd {
    Shutdown,
    Closed(String),
}

struct ConnectionTask {
    config: ClientConfig,
    state: Arc<watch::Sender<ConnectionState>>,
    shared: Arc<Mutex<Shared>>,
    events: mpsc::Sender<ClientEvent>,
    outbound: mpsc::UnboundedReceiver<ClientMessage>,
    shutdown: oneshot::Receiver<()>,
}

impl ConnectionTask {
    async fn run(mut self) {
        self.shared.lock().await.gave_up = false;
        let mut attempts: u32 = 0;

        loop {
            self.set_state(ConnectionState::Connecting);
            self.shared.lock().await.stats.connection_attempts += 1;

            let attempt = tokio::time::timeout(
                self.config.connect_timeout,
                tokio_tungstenite::connect_async(self.config.url.as_str()),
            );
            let outcome = tokio::select! {
                _ = &mut self.shutdown => {
                    self.set_state(ConnectionState::Disconnected);
                    return;
                }
                outcome = attempt => outcome,
            };

            match outcome {
                Ok(Ok((stream, _response))) => {
                    attempts = 0;
                    {
                        let mut shared = self.shared.lock().await;
                        shared.stats.connections += 1;
                        shared.stats.reconnect_attempts = 0;
                    }
                    log::info!("Connected to {}", self.config.url);
                    self.set_state(ConnectionState::Connected);

                    match self.run_session(stream).await {
                        SessionEnd::Shutdown => {
                            self.set_state(ConnectionState::Disconnected);
                            return;
                        }
                        SessionEnd::Closed(reason) => {
                            log::warn!("Connection to {} lost: {}", self.config.url, reason);
                            self.record_error(ClientError::Connection(reason)).await;
                            self.set_state(ConnectionState::Disconnected);
                        }
                    }
                }
                Ok(Err(e)) => {
                    let error = ClientError::Connection(e.to_string());
                    log::warn!("{}: {}", self.config.url, error);
                    self.set_state(ConnectionState::Error(error.to_string()));
                    self.record_error(error).await;
                }
                Err(_) => {
                    let error = ClientError::Timeout(self.config.connect_timeout);
                    log::warn!("{}: {}", self.config.url, error);
                    self.shared.lock().await.stats.timeouts += 1;
                    self.set_state(ConnectionState::Error(error.to_string()));
                    self.record_error(error).await;
                }
            }

            attempts += 1;
            if attempts > self.config.max_reconnect_attempts {
                let error = ClientError::ReconnectExhausted(self.config.max_reconnect_attempts);
                log::error!("{}: {}", self.config.url, error);
                {
                    let mut shared = self.shared.lock().await;
                    shared.gave_up = true;
                    shared.stats.last_error = Some(error.to_string());
                }
                self.set_state(ConnectionState::Error(error.to_string()));
                return;
            }
            self.shared.lock().await.stats.reconnect_attempts = attempts;

            log::info!(
                "Reconnecting to {} in {:?} (attempt {}/{})",
                self.config.url,
                self.config.reconnect_delay,
                attempts,
                self.config.max_reconnect_attempts
            );
            tokio::select! {
                _ = &mut self.shutdown => {
                    self.set_state(ConnectionState::Disconnected);
                    return;
                }
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
            }
        }
    }

    async fn run_session(&mut self, stream: WsStream) -> SessionEnd {
        let (mut ws_tx, mut ws_rx) = stream.split();
        let mut batcher = FrameBatcher::new(self.config.batch_size);

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        let mut flush = tokio::time::interval(self.config.batch_interval);
        flush.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let end = loop {
            tokio::select! {
                _ = &mut self.shutdown => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break SessionEnd::Shutdown;
                }
                _ = heartbeat.tick() => {
                    if let Err(e) = send_json(&mut ws_tx, &ClientMessage::Heartbeat).await {
                        break SessionEnd::Closed(e.to_string());
                    }
                }
                _ = flush.tick() => self.flush(&mut batcher).await,
                Some(message) = self.outbound.recv() => {
                    if let Err(e) = send_json(&mut ws_tx, &message).await {
                        break SessionEnd::Closed(e.to_string());
                    }
                    self.shared.lock().await.stats.messages_sent += 1;
                }
                incoming = ws_rx.next() => match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if self.handle_text(text.as_str(), &mut batcher).await {
                            self.flush(&mut batcher).await;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame
                            .map(|f| format!("closed by server ({})", f.reason))
                            .unwrap_or_else(|| "closed by server".to_string());
                        break SessionEnd::Closed(reason);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break SessionEnd::Closed(e.to_string()),
                    None => break SessionEnd::Closed("connection reset".to_string()),
                }
            }
        };

        self.flush(&mut batcher).await;
        end
    }

    /// Returns true when the batch should be flushed now
    async fn handle_text(&self, text: &str, batcher: &mut FrameBatcher) -> bool {
        match serde_json::from_str::<ServerMessage>(text) {
            Ok(ServerMessage::Frame { frame }) => {
                self.shared.lock().await.stats.frames_received += 1;
                batcher.push(frame)
            }
            Ok(message) => {
                if let ServerMessage::Error { error } = &message {
                    log::warn!("Server reported: {}", error);
                }
                self.emit(ClientEvent::Message(message));
                false
            }
            Err(e) => {
                let error = ClientError::Protocol(e.to_string());
                log::warn!("{}", error);
                self.shared.lock().await.stats.protocol_errors += 1;
                false
            }
        }
    }

    async fn flush(&self, batcher: &mut FrameBatcher) {
        if batcher.is_empty() {
            return;
        }
        let batch = batcher.take();
        {
            let mut shared = self.shared.lock().await;
            let evicted = shared.history.extend(batch.iter().cloned());
            shared.stats.batches_flushed += 1;
            if evicted > 0 {
                log::trace!("History full, evicted {} frames", evicted);
            }
        }
        log::trace!("Flushed batch of {} frames", batch.len());
        self.emit(ClientEvent::Batch(batch));
    }

    async fn record_error(&self, error: ClientError) {
        let mut shared = self.shared.lock().await;
        shared.stats.connection_errors += 1;
        shared.stats.last_error = Some(error.to_string());
    }

    fn set_state(&self, state: ConnectionState) {
        if *self.state.borrow() == state {
            return;
        }
        log::debug!("Client state: {}", state);
        self.state.send_replace(state.clone());
        self.emit(ClientEvent::State(state));
    }

    fn emit(&self, event: ClientEvent) {
        if let Err(mpsc::error::TrySendError::Full(_)) = self.events.try_send(event) {
            log::trace!("Event receiver full, dropping event");
        }
    }
}

async fn send_json(ws_tx: &mut WsSink, message: &ClientMessage) -> Result<(), ClientError> {
    let json = serde_json::to_string(message).map_err(|e| ClientError::Protocol(e.to_string()))?;
    ws_tx
        .send(Message::text(json))
        .await
        .map_err(|e| ClientError::Connection(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(id: u32) -> CanFrame {
        CanFrame::new(id, vec![id as u8], id as u64)
    }

    #[test]
    fn test_batcher_reports_threshold() {
        let mut batcher = FrameBatcher::new(3);
        assert!(!batcher.push(frame(1)));
        assert!(!batcher.push(frame(2)));
        assert!(batcher.push(frame(3)));
        assert_eq!(batcher.len(), 3);

        let batch = batcher.take();
        assert_eq!(batch.iter().map(|f| f.id).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert!(batcher.is_empty());
    }

    #[test]
    fn test_history_drops_oldest() {
        let mut history = FrameHistory::new(4);
        assert_eq!(history.extend((1..=3).map(frame)), 0);
        assert_eq!(history.extend((4..=6).map(frame)), 2);
        assert_eq!(history.len(), 4);

        let ids: Vec<u32> = history.snapshot().iter().map(|f| f.id).collect();
        assert_eq!(ids, vec![3, 4, 5, 6]);
        let latest: Vec<u32> = history.latest(2).iter().map(|f| f.id).collect();
        assert_eq!(latest, vec![5, 6]);
        assert_eq!(history.latest(10).len(), 4);
    }

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.batch_interval, Duration::from_millis(50));
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.history_capacity, 10_000);
    }

    #[test]
    fn test_zero_intervals_are_clamped() {
        let client = ReconnectingClient::new(ClientConfig {
            heartbeat_interval: Duration::ZERO,
            batch_interval: Duration::ZERO,
            ..Default::default()
        });
        assert_eq!(client.config().heartbeat_interval, Duration::from_millis(1));
        assert_eq!(client.config().batch_interval, Duration::from_millis(1));
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let client = ReconnectingClient::new(ClientConfig::default());
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(client.subscribe(vec![1]), Err(ClientError::NotConnected));
        assert_eq!(client.start_stream(), Err(ClientError::NotConnected));
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        // Bind then release a port so connections are refused
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut client = ReconnectingClient::new(ClientConfig {
            url: format!("ws://{}/ws", addr),
            connect_timeout: Duration::from_secs(2),
            reconnect_delay: Duration::from_millis(10),
            max_reconnect_attempts: 2,
            ..Default::default()
        });
        let mut events = client.take_events().unwrap();

        client.connect();
        let result = client.wait_connected(Duration::from_secs(10)).await;
        assert_eq!(result, Err(ClientError::ReconnectExhausted(2)));
        assert!(matches!(client.state(), ConnectionState::Error(_)));

        let stats = client.stats().await;
        assert_eq!(stats.connection_attempts, 3);
        assert_eq!(stats.connection_errors, 3);
        assert_eq!(stats.connections, 0);
        assert!(stats.last_error.unwrap().contains("gave up"));

        let mut connecting = 0;
        while let Ok(event) = events.try_recv() {
            if event == ClientEvent::State(ConnectionState::Connecting) {
                connecting += 1;
            }
        }
        assert_eq!(connecting, 3);

        // Terminal until connect() is called again
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(client.stats().await.connection_attempts, 3);
        assert!(!client.is_running());

        client.connect();
        let result = client.wait_connected(Duration::from_secs(10)).await;
        assert_eq!(result, Err(ClientError::ReconnectExhausted(2)));
        assert_eq!(client.stats().await.connection_attempts, 6);
    }

    #[tokio::test]
    async fn test_connect_timeout_counts_as_failure() {
        // Accepts TCP through the backlog but never answers the handshake
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut client = ReconnectingClient::new(ClientConfig {
            url: format!("ws://{}/ws", addr),
            connect_timeout: Duration::from_millis(100),
            reconnect_delay: Duration::from_millis(10),
            max_reconnect_attempts: 0,
            ..Default::default()
        });
        client.connect();

        let result = client.wait_connected(Duration::from_secs(10)).await;
        assert_eq!(result, Err(ClientError::ReconnectExhausted(0)));

        let stats = client.stats().await;
        assert_eq!(stats.timeouts, 1);
        assert_eq!(stats.connection_attempts, 1);
        drop(listener);
    }

    #[tokio::test]
    async fn test_disconnect_while_retrying() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut client = ReconnectingClient::new(ClientConfig {
            url: format!("ws://{}/ws", addr),
            reconnect_delay: Duration::from_secs(60),
            ..Default::default()
        });
        client.connect();
        assert!(client.is_running());
        tokio::time::sleep(Duration::from_millis(100)).await;

        client.disconnect().await;
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(!client.is_running());
    }
}
