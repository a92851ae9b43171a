//! Analysis configuration types
//!
//! Filters applied by [`crate::Decoder::parse_data_set`]: frame-level filters
//! run before decoding, value-level filters after.

use crate::types::{CanFrame, DecodedSignalValue};
use serde::{Deserialize, Serialize};

/// Configuration for a data-set analysis
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisConfig {
    /// Optional: drop frames older than this timestamp (ms, inclusive)
    #[serde(default)]
    pub time_range_start: Option<u64>,

    /// Optional: drop frames newer than this timestamp (ms, inclusive)
    #[serde(default)]
    pub time_range_end: Option<u64>,

    /// Optional: only decode these specific CAN message IDs (empty means all)
    #[serde(default)]
    pub target_ids: Option<Vec<u32>>,

    /// Optional: only keep decoded values of these signals (empty means all)
    #[serde(default)]
    pub signal_filter: Option<Vec<String>>,

    /// Drop decoded values whose physical value is NaN or infinite
    #[serde(default)]
    pub exclude_non_finite: bool,
}

impl AnalysisConfig {
    /// Create a new analysis configuration with no filters
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method: set the time window
    pub fn with_time_range(mut self, start: Option<u64>, end: Option<u64>) -> Self {
        self.time_range_start = start;
        self.time_range_end = end;
        self
    }

    /// Builder method: set the message filter; an empty list clears it
    pub fn with_target_ids(mut self, ids: Vec<u32>) -> Self {
        self.target_ids = if ids.is_empty() { None } else { Some(ids) };
        self
    }

    /// Builder method: set the signal name filter; an empty list clears it
    pub fn with_signal_filter<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        self.signal_filter = if names.is_empty() { None } else { Some(names) };
        self
    }

    /// Builder method: exclude NaN/infinite physical values
    pub fn with_exclude_non_finite(mut self, enabled: bool) -> Self {
        self.exclude_non_finite = enabled;
        self
    }

    /// Check if a timestamp falls inside the configured window
    pub fn in_time_range(&self, timestamp: u64) -> bool {
        self.time_range_start.map_or(true, |start| timestamp >= start)
            && self.time_range_end.map_or(true, |end| timestamp <= end)
    }

    /// Check if a message ID should be processed
    pub fn should_process_message(&self, can_id: u32) -> bool {
        match &self.target_ids {
            Some(ids) if !ids.is_empty() => ids.contains(&can_id),
            _ => true,
        }
    }

    /// Check if a frame passes the pre-decode filters
    pub fn should_process_frame(&self, frame: &CanFrame) -> bool {
        self.in_time_range(frame.timestamp) && self.should_process_message(frame.id)
    }

    /// Check if a decoded value passes the post-decode filters
    pub fn should_keep_value(&self, value: &DecodedSignalValue) -> bool {
        if self.exclude_non_finite && !value.physical_value.is_finite() {
            return false;
        }
        match &self.signal_filter {
            Some(names) if !names.is_empty() => names.iter().any(|name| *name == value.signal_name),
            _ => true,
        }
    }
}
