//! Real-time frame distributor.
//!
//! One task owns the session arena, the frame source and the counters. WebSocket
//! connections talk to it through [`DistributorHandle`]; the source talks to it
//! through its event channel. Nothing here is shared between threads, so no
//! locks guard the session table.

use crate::protocol::{
    normalize_frame, parse_client_message, ClientMessage, DistributorStats, InterfaceInfo,
    ServerMessage,
};
use crate::session::{ClientSession, Outbound, SessionArena, SessionHandle};
use crate::source::{FrameSource, SourceEvent};
use can_frame_decoder::{now_millis, CanFrame};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Default per-session queue capacity
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// Default heartbeat period; sessions silent for twice this long are evicted
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// How often queued messages are retried when no new traffic arrives
const FLUSH_INTERVAL: Duration = Duration::from_millis(100);

const COMMAND_CHANNEL_CAPACITY: usize = 1024;

/// Distributor tuning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributorConfig {
    /// Outbound queue capacity per session
    pub queue_capacity: usize,
    /// Sweep period T
    pub heartbeat_interval: Duration,
}

impl Default for DistributorConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
        }
    }
}

impl DistributorConfig {
    /// Silence longer than this gets a session evicted (2T)
    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_interval * 2
    }
}

/// Answer to `GET /health`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub status: String,
    pub interface: String,
    pub sessions: usize,
    pub streaming: bool,
}

/// Session table, stream lifecycle and broadcast logic
pub struct Distributor<S> {
    sessions: SessionArena,
    source: S,
    streaming: bool,
    config: DistributorConfig,
    stats: DistributorStats,
}

impl<S: FrameSource> Distributor<S> {
    /// Create an idle distributor. A zero heartbeat interval is raised to 1 ms.
    pub fn new(source: S, mut config: DistributorConfig) -> Self {
        config.heartbeat_interval = config.heartbeat_interval.max(crate::MIN_TIMER_PERIOD);
        Self {
            sessions: SessionArena::new(),
            source,
            streaming: false,
            config,
            stats: DistributorStats::default(),
        }
    }

    /// Register a connection. The first session starts the stream.
    pub async fn connect(&mut self, sink: mpsc::Sender<Outbound>, now: Instant) -> SessionHandle {
        let session = ClientSession::new(sink, self.config.queue_capacity, now);
        let handle = self.sessions.insert(session);
        log::info!("{} connected ({} active)", handle, self.sessions.len());

        let status = self.status_message();
        self.send_to(handle, &status);

        if self.sessions.len() == 1 && !self.streaming {
            self.start_streaming(Some(handle)).await;
        }
        handle
    }

    /// Remove a session. The last one out stops the stream.
    /// Returns false if the handle no longer resolves.
    pub async fn disconnect(&mut self, handle: SessionHandle) -> bool {
        let Some(session) = self.sessions.remove(handle) else {
            return false;
        };
        log::info!(
            "{} disconnected ({} delivered, {} dropped, {} active)",
            handle,
            session.delivered(),
            session.dropped(),
            self.sessions.len()
        );

        if self.sessions.is_empty() && self.streaming {
            self.stop_streaming(None).await;
        }
        true
    }

    /// Handle one text frame from a client. Unparseable input gets a single
    /// `error` reply; the connection stays open.
    pub async fn handle_text(&mut self, handle: SessionHandle, text: &str, now: Instant) {
        if self.sessions.get(handle).is_none() {
            log::debug!("Ignoring message for departed {}", handle);
            return;
        }

        match parse_client_message(text) {
            Ok(message) => self.handle_message(handle, message, now).await,
            Err(e) => {
                log::warn!("{}: {}", handle, e);
                self.send_to(handle, &ServerMessage::Error { error: e.to_string() });
            }
        }
    }

    /// Apply one parsed control message from `handle` and send its reply
    pub async fn handle_message(&mut self, handle: SessionHandle, message: ClientMessage, now: Instant) {
        log::debug!("{}: {:?}", handle, message);

        match message {
            ClientMessage::Subscribe { message_ids } => {
                let Some(session) = self.sessions.get_mut(handle) else {
                    return;
                };
                session.subscription.extend(message_ids.iter().copied());
                self.send_to(handle, &ServerMessage::Subscribed { message_ids });
            }
            ClientMessage::Unsubscribe { message_ids } => {
                let Some(session) = self.sessions.get_mut(handle) else {
                    return;
                };
                for id in &message_ids {
                    session.subscription.remove(id);
                }
                self.send_to(handle, &ServerMessage::Unsubscribed { message_ids });
            }
            ClientMessage::SetFilters { bus_filter, id_filter } => {
                let Some(session) = self.sessions.get_mut(handle) else {
                    return;
                };
                session.bus_filter = bus_filter.clone();
                session.id_filter = id_filter.clone();
                self.send_to(handle, &ServerMessage::FiltersUpdated { bus_filter, id_filter });
            }
            ClientMessage::Start => {
                if self.streaming {
                    let status = self.status_message();
                    self.send_to(handle, &status);
                } else {
                    self.start_streaming(Some(handle)).await;
                }
            }
            ClientMessage::Stop => {
                if self.streaming {
                    self.stop_streaming(Some(handle)).await;
                } else {
                    let status = self.status_message();
                    self.send_to(handle, &status);
                }
            }
            ClientMessage::Heartbeat => {
                let Some(session) = self.sessions.get_mut(handle) else {
                    return;
                };
                session.last_heartbeat = now;
                self.send_to(handle, &ServerMessage::Heartbeat { timestamp: now_millis() });
            }
            ClientMessage::SendFrame { frame } => {
                let response = match normalize_frame(&frame, now_millis()) {
                    Ok(frame) => {
                        self.stats.frames_relayed += 1;
                        let recipients = self.broadcast(&frame, Some(handle));
                        log::debug!("{} relayed 0x{:X} to {} sessions", handle, frame.id, recipients);
                        ServerMessage::SendFrameResponse {
                            success: true,
                            frame: Some(frame),
                            error: None,
                        }
                    }
                    Err(e) => ServerMessage::SendFrameResponse {
                        success: false,
                        frame: None,
                        error: Some(e.to_string()),
                    },
                };
                self.send_to(handle, &response);
            }
            ClientMessage::GetInterfaceInfo => {
                let info = ServerMessage::InterfaceInfo(self.interface_info());
                self.send_to(handle, &info);
            }
        }
    }

    /// Deliver a frame to every matching, writable session except `exclude`.
    /// Returns the number of sessions the frame was queued for.
    pub fn broadcast(&mut self, frame: &CanFrame, exclude: Option<SessionHandle>) -> usize {
        let Some(message) = encode(&ServerMessage::Frame { frame: frame.clone() }) else {
            return 0;
        };

        let mut recipients = 0;
        for (handle, session) in self.sessions.iter_mut() {
            if Some(handle) == exclude || !session.wants(frame) || !session.is_writable() {
                continue;
            }
            recipients += 1;
            self.stats.frames_enqueued += 1;
            if session.send(Arc::clone(&message)) {
                self.stats.frames_dropped += 1;
            }
        }

        log::trace!("Frame 0x{:X} queued for {} sessions", frame.id, recipients);
        recipients
    }

    /// React to a frame or error from the source
    pub fn handle_source_event(&mut self, event: SourceEvent) {
        match event {
            SourceEvent::Frame(frame) => {
                if !self.streaming {
                    log::trace!("Discarding 0x{:X}: stream inactive", frame.id);
                    return;
                }
                self.stats.frames_received += 1;
                self.broadcast(&frame, None);
            }
            SourceEvent::Error(reason) => {
                self.stats.source_errors += 1;
                log::warn!("Frame source '{}' error: {}", self.source.name(), reason);
                let error = ServerMessage::Error {
                    error: format!("{}: {}", self.source.name(), reason),
                };
                self.send_to_all(&error);
            }
        }
    }

    /// Evict every session whose last heartbeat is older than 2T
    pub async fn sweep(&mut self, now: Instant) -> Vec<SessionHandle> {
        let timeout = self.config.heartbeat_timeout();
        let stale: Vec<SessionHandle> = self
            .sessions
            .iter()
            .filter(|(_, session)| now.saturating_duration_since(session.last_heartbeat) > timeout)
            .map(|(handle, _)| handle)
            .collect();

        for handle in &stale {
            log::warn!("{} missed heartbeats for over {:?}, evicting", handle, timeout);
            self.stats.sessions_evicted += 1;
            self.disconnect(*handle).await;
        }
        stale
    }

    /// Retry queued messages for every session
    pub fn flush_all(&mut self) {
        for (_, session) in self.sessions.iter_mut() {
            if session.queued() > 0 {
                session.flush();
            }
        }
    }

    async fn start_streaming(&mut self, requester: Option<SessionHandle>) {
        match self.source.start().await {
            Ok(()) => {
                self.streaming = true;
                log::info!("Streaming started from '{}'", self.source.name());
                let status = self.status_message();
                self.send_to_all(&status);
            }
            Err(e) => {
                log::warn!("{}", e);
                self.reply_or_broadcast(requester, &ServerMessage::Error { error: e.to_string() });
            }
        }
    }

    async fn stop_streaming(&mut self, requester: Option<SessionHandle>) {
        match self.source.stop().await {
            Ok(()) => {
                self.streaming = false;
                log::info!("Streaming stopped from '{}'", self.source.name());
                let status = self.status_message();
                self.send_to_all(&status);
            }
            Err(e) => {
                log::warn!("{}", e);
                self.reply_or_broadcast(requester, &ServerMessage::Error { error: e.to_string() });
            }
        }
    }

    fn reply_or_broadcast(&mut self, requester: Option<SessionHandle>, message: &ServerMessage) {
        match requester {
            Some(handle) => self.send_to(handle, message),
            None => self.send_to_all(message),
        }
    }

    fn send_to(&mut self, handle: SessionHandle, message: &ServerMessage) {
        let Some(encoded) = encode(message) else {
            return;
        };
        if let Some(session) = self.sessions.get_mut(handle) {
            if session.send(encoded) {
                self.stats.frames_dropped += 1;
            }
        }
    }

    fn send_to_all(&mut self, message: &ServerMessage) {
        let Some(encoded) = encode(message) else {
            return;
        };
        for (_, session) in self.sessions.iter_mut() {
            if session.send(Arc::clone(&encoded)) {
                self.stats.frames_dropped += 1;
            }
        }
    }

    /// Current `status` message sent on connect and after start/stop
    pub fn status_message(&self) -> ServerMessage {
        ServerMessage::Status {
            connected: self.source.is_connected(),
            interface: self.source.name().to_string(),
            streaming: self.streaming,
        }
    }

    /// Source details and counters for `get_interface_info`
    pub fn interface_info(&self) -> InterfaceInfo {
        InterfaceInfo {
            interface: self.source.name().to_string(),
            connected: self.source.is_connected(),
            streaming: self.streaming,
            sessions: self.sessions.len(),
            stats: self.stats,
        }
    }

    /// Snapshot served at `/health`
    pub fn health(&self) -> HealthReport {
        HealthReport {
            status: "ok".to_string(),
            interface: self.source.name().to_string(),
            sessions: self.sessions.len(),
            streaming: self.streaming,
        }
    }

    /// True while the source is started
    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// Number of live sessions
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Look up a session; `None` once it is gone
    pub fn session(&self, handle: SessionHandle) -> Option<&ClientSession> {
        self.sessions.get(handle)
    }

    /// Copy of the frame counters
    pub fn stats(&self) -> DistributorStats {
        self.stats
    }

    /// Borrow the frame source
    pub fn source(&self) -> &S {
        &self.source
    }

    /// Effective configuration (after clamping)
    pub fn config(&self) -> &DistributorConfig {
        &self.config
    }
}

fn encode(message: &ServerMessage) -> Option<Outbound> {
    match serde_json::to_string(message) {
        Ok(json) => Some(Arc::from(json)),
        Err(e) => {
            log::warn!("Failed to serialize {:?}: {}", message, e);
            None
        }
    }
}

/// Requests from connection tasks to the distributor task
#[derive(Debug)]
pub enum DistributorCommand {
    Connect {
        sink: mpsc::Sender<Outbound>,
        reply: oneshot::Sender<SessionHandle>,
    },
    Message {
        handle: SessionHandle,
        text: String,
    },
    Disconnect {
        handle: SessionHandle,
    },
    Health {
        reply: oneshot::Sender<HealthReport>,
    },
    Shutdown,
}

/// Cloneable front door to a running distributor task
#[derive(Debug, Clone)]
pub struct DistributorHandle {
    tx: mpsc::Sender<DistributorCommand>,
}

impl DistributorHandle {
    /// Register a connection; `None` if the distributor has stopped
    pub async fn connect(&self, sink: mpsc::Sender<Outbound>) -> Option<SessionHandle> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(DistributorCommand::Connect { sink, reply }).await.ok()?;
        rx.await.ok()
    }

    /// Forward a text frame; false if the distributor has stopped
    pub async fn message(&self, handle: SessionHandle, text: String) -> bool {
        self.tx
            .send(DistributorCommand::Message { handle, text })
            .await
            .is_ok()
    }

    /// Drop a session. Unknown handles are ignored.
    pub async fn disconnect(&self, handle: SessionHandle) {
        let _ = self.tx.send(DistributorCommand::Disconnect { handle }).await;
    }

    /// Health snapshot; `None` if the distributor has stopped
    pub async fn health(&self) -> Option<HealthReport> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(DistributorCommand::Health { reply }).await.ok()?;
        rx.await.ok()
    }

    /// Ask the event loop to stop the source and exit
    pub async fn shutdown(&self) {
        let _ = self.tx.send(DistributorCommand::Shutdown).await;
    }
}

impl<S: FrameSource + 'static> Distributor<S> {
    /// Move the distributor onto its own task
    pub fn spawn(self) -> (DistributorHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let task = tokio::spawn(self.run(rx));
        (DistributorHandle { tx }, task)
    }

    /// Event loop: commands, source events, heartbeat sweep and queue retries
    pub async fn run(mut self, mut commands: mpsc::Receiver<DistributorCommand>) {
        let mut source_events = self.source.take_events();
        if source_events.is_none() {
            log::warn!("Frame source '{}' has no event channel", self.source.name());
        }

        let period = self.config.heartbeat_interval;
        let mut sweep = tokio::time::interval_at(Instant::now() + period, period);
        let mut flush = tokio::time::interval(FLUSH_INTERVAL);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(DistributorCommand::Connect { sink, reply }) => {
                        let handle = self.connect(sink, Instant::now()).await;
                        if reply.send(handle).is_err() {
                            self.disconnect(handle).await;
                        }
                    }
                    Some(DistributorCommand::Message { handle, text }) => {
                        self.handle_text(handle, &text, Instant::now()).await;
                    }
                    Some(DistributorCommand::Disconnect { handle }) => {
                        self.disconnect(handle).await;
                    }
                    Some(DistributorCommand::Health { reply }) => {
                        let _ = reply.send(self.health());
                    }
                    Some(DistributorCommand::Shutdown) | None => break,
                },
                event = next_source_event(&mut source_events) => match event {
                    Some(event) => self.handle_source_event(event),
                    None => {
                        log::warn!("Frame source '{}' closed its event channel", self.source.name());
                        source_events = None;
                    }
                },
                _ = sweep.tick() => {
                    self.sweep(Instant::now()).await;
                }
                _ = flush.tick() => self.flush_all(),
            }
        }

        if self.streaming {
            if let Err(e) = self.source.stop().await {
                log::warn!("{}", e);
            }
        }
        log::info!("Distributor stopped ({} sessions dropped)", self.sessions.len());
    }
}

async fn next_source_event(rx: &mut Option<mpsc::Receiver<SourceEvent>>) -> Option<SourceEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
