//! Main decoder API
//!
//! [`Decoder`] owns a [`SignalDatabase`] and is the entry point for loading
//! catalogs and decoding frames. The free function [`parse_data_set`] does the
//! same batch analysis against any injected [`MessageCatalog`].

use crate::config::AnalysisConfig;
use crate::message_decoder::FrameAnalyzer;
use crate::signals::{MessageCatalog, MessageDefinition, SignalDatabase};
use crate::types::{CanFrame, DecodedSignalValue, ParsedFrame, Result};
use serde::Serialize;
use std::path::Path;

pub use crate::signals::DatabaseStats;

/// The main decoder struct - entry point for all decoding operations
#[derive(Debug, Default)]
pub struct Decoder {
    /// Internal signal database (loaded from DBC files or built by hand)
    signal_db: SignalDatabase,
}

/// Result of analyzing a batch of frames
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSetResult {
    /// Frames that passed the time and id filters
    pub frames: Vec<CanFrame>,
    /// Decoded values of all analyzed frames, in frame order
    pub values: Vec<DecodedSignalValue>,
    /// Counters describing the run
    pub summary: DataSetSummary,
}

/// Counters for a data-set analysis
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSetSummary {
    /// Frames handed in
    pub total_frames: usize,
    /// Frames left after the pre-decode filters
    pub analyzed_frames: usize,
    /// Values left after the post-decode filters
    pub decoded_values: usize,
    /// Analyzed frames with no catalog entry
    pub unknown_frames: usize,
    /// Analyzed frames whose decode stopped on a definition error
    pub frame_errors: usize,
}

impl Decoder {
    /// Create a new decoder instance
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a DBC file and add its definitions to the signal database
    ///
    /// # Example
    /// ```no_run
    /// use can_frame_decoder::Decoder;
    /// use std::path::Path;
    ///
    /// let mut decoder = Decoder::new();
    /// decoder.add_dbc(Path::new("powertrain.dbc")).unwrap();
    /// ```
    pub fn add_dbc(&mut self, path: &Path) -> Result<()> {
        log::info!("Loading DBC file: {:?}", path);

        for message in crate::signals::dbc::parse_dbc_file(path)? {
            self.signal_db.add_message(message);
        }

        log::info!("DBC file loaded successfully: {:?}", path);
        Ok(())
    }

    /// Load DBC text already in memory
    pub fn add_dbc_str(&mut self, content: &str, source: &str) -> Result<()> {
        for message in crate::signals::dbc::parse_dbc_str(content, source)? {
            self.signal_db.add_message(message);
        }
        Ok(())
    }

    /// Add a single hand-built message definition
    pub fn add_message(&mut self, message: MessageDefinition) {
        self.signal_db.add_message(message);
    }

    /// Borrow the loaded catalog
    pub fn catalog(&self) -> &SignalDatabase {
        &self.signal_db
    }

    /// Give up the decoder and keep the catalog
    pub fn into_catalog(self) -> SignalDatabase {
        self.signal_db
    }

    /// Decode one frame against the loaded catalog
    pub fn parse_frame(&self, frame: &CanFrame) -> ParsedFrame {
        FrameAnalyzer::parse_frame(frame, &self.signal_db)
    }

    /// Filter, decode and summarize a batch of frames
    pub fn parse_data_set(&self, frames: &[CanFrame], config: &AnalysisConfig) -> DataSetResult {
        parse_data_set(frames, &self.signal_db, config)
    }

    /// Get statistics about the loaded signal database
    pub fn database_stats(&self) -> DatabaseStats {
        self.signal_db.stats()
    }
}

/// Filter, decode and summarize a batch of frames against `catalog`
pub fn parse_data_set<C: MessageCatalog + ?Sized>(
    frames: &[CanFrame],
    catalog: &C,
    config: &AnalysisConfig,
) -> DataSetResult {
    let mut summary = DataSetSummary {
        total_frames: frames.len(),
        ..DataSetSummary::default()
    };

    let filtered: Vec<CanFrame> = frames
        .iter()
        .filter(|frame| config.should_process_frame(frame))
        .cloned()
        .collect();
    summary.analyzed_frames = filtered.len();

    let mut values = Vec::new();
    for frame in &filtered {
        let parsed = FrameAnalyzer::parse_frame(frame, catalog);
        if catalog.lookup(frame.id).is_none() {
            summary.unknown_frames += 1;
        } else if parsed.error.is_some() {
            summary.frame_errors += 1;
        }
        values.extend(
            parsed
                .signals
                .into_iter()
                .filter(|value| config.should_keep_value(value)),
        );
    }
    summary.decoded_values = values.len();

    log::debug!(
        "Analyzed {}/{} frames, {} values ({} unknown, {} errors)",
        summary.analyzed_frames,
        summary.total_frames,
        summary.decoded_values,
        summary.unknown_frames,
        summary.frame_errors
    );

    DataSetResult {
        frames: filtered,
        values,
        summary,
    }
}
