//! Frame sources feeding the distributor.
//!
//! A source hands out its event receiver once through
//! [`FrameSource::take_events`]; frames and errors arrive on that channel
//! instead of through registered callbacks.

use async_trait::async_trait;
use can_frame_decoder::bitfield;
use can_frame_decoder::{
    now_millis, CanFrame, MessageCatalog, SignalDatabase, SignalDefinition, MAX_DATA_LENGTH,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Capacity of a source's event channel
pub const SOURCE_CHANNEL_CAPACITY: usize = 4096;

/// Something a frame source reports
#[derive(Debug, Clone, PartialEq)]
pub enum SourceEvent {
    Frame(CanFrame),
    Error(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("failed to start source '{name}': {reason}")]
    Start { name: String, reason: String },

    #[error("failed to stop source '{name}': {reason}")]
    Stop { name: String, reason: String },
}

/// Producer of raw frames
#[async_trait]
pub trait FrameSource: Send {
    /// Begin producing frames. Starting a running source is a no-op.
    async fn start(&mut self) -> Result<(), SourceError>;

    /// Stop producing frames. Stopping a stopped source is a no-op.
    async fn stop(&mut self) -> Result<(), SourceError>;

    /// Take the event receiver; `None` after the first call.
    fn take_events(&mut self) -> Option<mpsc::Receiver<SourceEvent>>;

    /// Whether the underlying interface is reachable
    fn is_connected(&self) -> bool;

    /// Interface name reported to clients
    fn name(&self) -> &str;
}

/// Synthetic bus traffic for demos and tests.
///
/// Emits one frame per tick, cycling through `ids`. When a catalog is given,
/// each defined signal sweeps through its raw range; other IDs get an 8-byte
/// little-endian counter.
pub struct SimulatedSource {
    name: String,
    ids: Vec<u32>,
    interval: Duration,
    catalog: Option<Arc<SignalDatabase>>,
    tx: mpsc::Sender<SourceEvent>,
    rx: Option<mpsc::Receiver<SourceEvent>>,
    running: Option<(oneshot::Sender<()>, JoinHandle<()>)>,
}

impl SimulatedSource {
    /// Source cycling through `ids`, one frame per `interval` (at least 1 ms)
    pub fn new(name: impl Into<String>, ids: Vec<u32>, interval: Duration) -> Self {
        let (tx, rx) = mpsc::channel(SOURCE_CHANNEL_CAPACITY);
        Self {
            name: name.into(),
            ids,
            interval: interval.max(crate::MIN_TIMER_PERIOD),
            catalog: None,
            tx,
            rx: Some(rx),
            running: None,
        }
    }

    /// Builder method: synthesize payloads from catalog definitions
    pub fn with_catalog(mut self, catalog: Arc<SignalDatabase>) -> Self {
        if self.ids.is_empty() {
            self.ids = catalog.get_all_can_ids();
        }
        self.catalog = Some(catalog);
        self
    }

    /// Whether the generator task is live
    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }
}

/// Payload for tick `tick` of frame `id`
pub fn synthesize_payload(id: u32, tick: u64, catalog: Option<&SignalDatabase>) -> Vec<u8> {
    let Some(message) = catalog.and_then(|c| c.lookup(id)) else {
        return tick.to_le_bytes().to_vec();
    };

    let mut data = vec![0u8; message.length.min(MAX_DATA_LENGTH)];
    let (plain, multiplexed): (Vec<_>, Vec<_>) =
        message.signals.iter().partition(|s| s.multiplexer.is_none());
    for signal in plain {
        write_sweep(&mut data, id, signal, tick);
    }

    // Only the branch selected by the multiplexor just written
    if let Some(mux) = message.multiplexor() {
        let selected = bitfield::extract(
            &data,
            mux.start_bit as usize,
            mux.length as usize,
            mux.byte_order,
            mux.is_signed(),
        );
        if let Ok(selected) = selected {
            for signal in multiplexed {
                if signal.multiplexer.as_ref().is_some_and(|m| m.is_active(selected as u64)) {
                    write_sweep(&mut data, id, signal, tick);
                }
            }
        }
    }
    data
}

fn write_sweep(data: &mut [u8], id: u32, signal: &SignalDefinition, tick: u64) {
    let Ok((min, max)) = signal.raw_range() else {
        return;
    };
    let span = (max as i128 - min as i128) + 1;
    let raw = (min as i128 + (tick as i128 % span)) as i64;
    if let Err(e) = bitfield::insert(
        data,
        signal.start_bit as usize,
        signal.length as usize,
        signal.byte_order,
        raw,
    ) {
        log::trace!("Not synthesizing '{}' of 0x{:X}: {}", signal.name, id, e);
    }
}

#[async_trait]
impl FrameSource for SimulatedSource {
    async fn start(&mut self) -> Result<(), SourceError> {
        if self.running.is_some() {
            return Ok(());
        }
        if self.ids.is_empty() {
            return Err(SourceError::Start {
                name: self.name.clone(),
                reason: "no frame ids configured".to_string(),
            });
        }

        let (stop_tx, mut stop_rx) = oneshot::channel();
        let tx = self.tx.clone();
        let ids = self.ids.clone();
        let catalog = self.catalog.clone();
        let period = self.interval;
        let name = self.name.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            let mut tick: u64 = 0;
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        let id = ids[(tick % ids.len() as u64) as usize];
                        let round = tick / ids.len() as u64;
                        let data = synthesize_payload(id, round, catalog.as_deref());
                        let frame = CanFrame::new(id, data, now_millis());
                        match tx.try_send(SourceEvent::Frame(frame)) {
                            Ok(()) => {}
                            Err(mpsc::error::TrySendError::Full(_)) => {
                                log::trace!("{}: event channel full, frame dropped", name);
                            }
                            Err(mpsc::error::TrySendError::Closed(_)) => break,
                        }
                        tick = tick.wrapping_add(1);
                    }
                }
            }
            log::debug!("{}: generator stopped after {} frames", name, tick);
        });

        self.running = Some((stop_tx, task));
        log::info!("Simulated source '{}' started ({} ids, every {:?})", self.name, self.ids.len(), self.interval);
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), SourceError> {
        let Some((stop_tx, task)) = self.running.take() else {
            return Ok(());
        };
        let _ = stop_tx.send(());
        task.await.map_err(|e| SourceError::Stop {
            name: self.name.clone(),
            reason: e.to_string(),
        })?;
        log::info!("Simulated source '{}' stopped", self.name);
        Ok(())
    }

    fn take_events(&mut self) -> Option<mpsc::Receiver<SourceEvent>> {
        self.rx.take()
    }

    fn is_connected(&self) -> bool {
        true
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Source fed by another component through an [`mpsc::Sender`], e.g. a bus
/// reader running elsewhere in the process.
pub struct ChannelSource {
    name: String,
    rx: Option<mpsc::Receiver<SourceEvent>>,
    started: bool,
    starts: u32,
    stops: u32,
}

impl ChannelSource {
    /// Create the source and the sender that feeds it
    pub fn new(name: impl Into<String>) -> (Self, mpsc::Sender<SourceEvent>) {
        let (tx, rx) = mpsc::channel(SOURCE_CHANNEL_CAPACITY);
        (
            Self {
                name: name.into(),
                rx: Some(rx),
                started: false,
                starts: 0,
                stops: 0,
            },
            tx,
        )
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Number of effective start transitions
    pub fn start_count(&self) -> u32 {
        self.starts
    }

    /// Number of effective stop transitions
    pub fn stop_count(&self) -> u32 {
        self.stops
    }
}

#[async_trait]
impl FrameSource for ChannelSource {
    async fn start(&mut self) -> Result<(), SourceError> {
        if !self.started {
            self.started = true;
            self.starts += 1;
        }
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), SourceError> {
        if self.started {
            self.started = false;
            self.stops += 1;
        }
        Ok(())
    }

    fn take_events(&mut self) -> Option<mpsc::Receiver<SourceEvent>> {
        self.rx.take()
    }

    fn is_connected(&self) -> bool {
        self.started
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use can_frame_decoder::{ByteOrder, FrameAnalyzer, MessageDefinition};

    fn catalog() -> SignalDatabase {
        let mut db = SignalDatabase::new();
        db.add_message(
            MessageDefinition::new(0x100, "Drive", 4)
                .with_signal(SignalDefinition::new("Gear", 0, 2))
                .with_signal(SignalDefinition::new("Torque", 8, 16).signed().with_byte_order(ByteOrder::BigEndian)),
        );
        db
    }

    #[test]
    fn test_synthesized_payload_decodes() {
        let db = catalog();
        for tick in [0u64, 1, 5, 70_000] {
            let data = synthesize_payload(0x100, tick, Some(&db));
            assert_eq!(data.len(), 4);

            let parsed = FrameAnalyzer::parse_frame(&CanFrame::new(0x100, data, 0), &db);
            assert_eq!(parsed.signals.len(), 2);
            assert_eq!(parsed.signals[0].raw_value, (tick % 4) as i64);
            assert_eq!(parsed.signals[1].raw_value, -32768 + (tick % 65536) as i64);
        }
    }

    #[test]
    fn test_synthesized_payload_fills_selected_branch() {
        let mut db = SignalDatabase::new();
        db.add_message(
            MessageDefinition::new(0x200, "Diagnostics", 3)
                .with_signal(SignalDefinition::new("Page", 0, 1))
                .with_signal(SignalDefinition::new("Oil", 8, 16).multiplexed_by("Page", 0))
                .with_signal(SignalDefinition::new("Fuel", 8, 8).multiplexed_by("Page", 1)),
        );

        for tick in [0u64, 1, 2, 3] {
            let data = synthesize_payload(0x200, tick, Some(&db));
            let parsed = FrameAnalyzer::parse_frame(&CanFrame::new(0x200, data, 0), &db);
            let names: Vec<_> = parsed.signals.iter().map(|s| s.signal_name.as_str()).collect();
            let branch = if tick % 2 == 0 { "Oil" } else { "Fuel" };
            assert_eq!(names, vec!["Page", branch]);
            assert_eq!(parsed.signals[1].raw_value, tick as i64);
        }
    }

    #[test]
    fn test_payload_without_definition_is_counter() {
        assert_eq!(synthesize_payload(0x7FF, 258, None), vec![2, 1, 0, 0, 0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn test_simulated_source_emits_cycling_ids() {
        let mut source = SimulatedSource::new("sim", vec![0x1, 0x2], Duration::from_millis(1));
        let mut events = source.take_events().unwrap();
        assert!(source.take_events().is_none());

        source.start().await.unwrap();
        source.start().await.unwrap();
        assert!(source.is_running());

        let mut ids = Vec::new();
        while ids.len() < 4 {
            if let Some(SourceEvent::Frame(frame)) = events.recv().await {
                ids.push(frame.id);
            }
        }
        assert_eq!(ids, vec![0x1, 0x2, 0x1, 0x2]);

        source.stop().await.unwrap();
        source.stop().await.unwrap();
        assert!(!source.is_running());
    }

    #[tokio::test]
    async fn test_zero_interval_is_clamped() {
        let mut source = SimulatedSource::new("fast", vec![0x7], Duration::ZERO);
        let mut events = source.take_events().unwrap();
        source.start().await.unwrap();

        let first = events.recv().await;
        assert!(matches!(first, Some(SourceEvent::Frame(frame)) if frame.id == 0x7));
        source.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_simulated_source_requires_ids() {
        let mut source = SimulatedSource::new("empty", vec![], Duration::from_millis(1));
        assert!(matches!(source.start().await, Err(SourceError::Start { .. })));
    }

    #[tokio::test]
    async fn test_catalog_supplies_default_ids() {
        let source = SimulatedSource::new("sim", vec![], Duration::from_millis(1))
            .with_catalog(Arc::new(catalog()));
        assert_eq!(source.ids, vec![0x100]);
    }

    #[tokio::test]
    async fn test_channel_source_is_idempotent() {
        let (mut source, _tx) = ChannelSource::new("loop");
        source.start().await.unwrap();
        source.start().await.unwrap();
        assert_eq!(source.start_count(), 1);
        assert!(source.is_connected());

        source.stop().await.unwrap();
        source.stop().await.unwrap();
        assert_eq!(source.stop_count(), 1);
    }
}
