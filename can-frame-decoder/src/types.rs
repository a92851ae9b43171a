//! Core types for the CAN frame decoder library
//!
//! This module defines the raw frame that flows through the whole system, the
//! decoded values the analyzer emits, and the library error type. Frames and
//! decoded values are transient: they are created per decode call and owned by
//! the caller.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Timestamp type used for display conversions
pub type Timestamp = DateTime<Utc>;

/// Result type for decoder operations
pub type Result<T> = std::result::Result<T, DecoderError>;

/// Highest identifier of a standard (11-bit) frame
pub const MAX_STANDARD_ID: u32 = 0x7FF;

/// Highest identifier of an extended (29-bit) frame
pub const MAX_EXTENDED_ID: u32 = 0x1FFF_FFFF;

/// Maximum payload of a classic CAN frame
pub const MAX_DATA_LENGTH: usize = 8;

/// Raw CAN frame as received from a bus interface or a peer.
///
/// Serializes to the wire shape `{id, data, timestamp, extended, dlc}`. The bus
/// channel is only present when the producer knows it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanFrame {
    /// CAN message ID (11-bit or 29-bit)
    pub id: u32,
    /// Frame data bytes (0-8 bytes)
    pub data: Vec<u8>,
    /// Receipt time in milliseconds since the Unix epoch
    pub timestamp: u64,
    /// True if this is an extended (29-bit) CAN ID
    pub extended: bool,
    /// Data length code - number of data bytes
    pub dlc: u8,
    /// CAN channel number, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<u8>,
}

impl CanFrame {
    /// Build a frame, inferring `extended` from the id and `dlc` from the data.
    pub fn new(id: u32, data: Vec<u8>, timestamp: u64) -> Self {
        Self {
            id,
            dlc: data.len() as u8,
            extended: id > MAX_STANDARD_ID,
            data,
            timestamp,
            channel: None,
        }
    }

    /// Builder method: tag the frame with a bus channel
    pub fn with_channel(mut self, channel: u8) -> Self {
        self.channel = Some(channel);
        self
    }

    /// Convert the millisecond timestamp to a `DateTime<Utc>`
    pub fn datetime(&self) -> Timestamp {
        DateTime::from_timestamp_millis(self.timestamp as i64).unwrap_or_else(Utc::now)
    }

    /// Check the frame is well formed: id fits its format, at most 8 data bytes,
    /// and `dlc` matches the data length.
    pub fn validate(&self) -> Result<()> {
        let max_id = if self.extended { MAX_EXTENDED_ID } else { MAX_STANDARD_ID };
        if self.id > max_id {
            return Err(DecoderError::InvalidFrame(format!(
                "id 0x{:X} exceeds the {} range",
                self.id,
                if self.extended { "29-bit" } else { "11-bit" }
            )));
        }
        if self.data.len() > MAX_DATA_LENGTH {
            return Err(DecoderError::InvalidFrame(format!(
                "data has {} bytes, at most {} allowed",
                self.data.len(),
                MAX_DATA_LENGTH
            )));
        }
        if self.dlc as usize != self.data.len() {
            return Err(DecoderError::InvalidFrame(format!(
                "dlc {} does not match data length {}",
                self.dlc,
                self.data.len()
            )));
        }
        Ok(())
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch
pub fn now_millis() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

/// Errors that can occur during decoding
#[derive(Debug, thiserror::Error)]
pub enum DecoderError {
    #[error("Insufficient data: signal needs {required} bytes, frame has {available}")]
    InsufficientData { required: usize, available: usize },

    #[error("Invalid signal definition: {0}")]
    InvalidSignalDefinition(String),

    #[error("no definition for id 0x{0:X} ({0})")]
    MessageNotFound(u32),

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Failed to parse DBC file: {0}")]
    DbcParseError(String),
}

/// A decoded signal value with engineering units
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecodedSignalValue {
    /// Signal name from the catalog
    pub signal_name: String,
    /// Name of the message carrying the signal
    pub message_name: String,
    /// Raw value before scaling
    pub raw_value: i64,
    /// raw_value * factor + offset
    pub physical_value: f64,
    /// Engineering unit (e.g., "km/h", "°C", "V")
    pub unit: Option<String>,
    /// Timestamp of the frame the value came from
    pub timestamp: u64,
    /// Value description from the value table, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Outcome of decoding a single frame against the catalog
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedFrame {
    /// CAN ID of the decoded frame
    pub can_id: u32,
    /// Message name, or "Unknown" when the catalog has no entry
    pub message_name: String,
    /// Signals that could be decoded
    pub signals: Vec<DecodedSignalValue>,
    /// Frame-level error, if decoding could not complete
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ParsedFrame {
    /// True when the frame decoded without a frame-level error
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_infers_format() {
        let frame = CanFrame::new(0x123, vec![1, 2, 3], 10);
        assert!(!frame.extended);
        assert_eq!(frame.dlc, 3);

        let frame = CanFrame::new(0x18FEF100, vec![], 10);
        assert!(frame.extended);
        assert_eq!(frame.dlc, 0);
    }

    #[test]
    fn test_validate_rejects_bad_frames() {
        let mut frame = CanFrame::new(0x123, vec![0; 8], 0);
        assert!(frame.validate().is_ok());

        frame.dlc = 7;
        assert!(matches!(frame.validate(), Err(DecoderError::InvalidFrame(_))));

        let oversized = CanFrame::new(0x123, vec![0; 9], 0);
        assert!(oversized.validate().is_err());

        let mut bad_id = CanFrame::new(0x123, vec![], 0);
        bad_id.id = 0x800;
        assert!(bad_id.validate().is_err());
    }

    #[test]
    fn test_wire_shape() {
        let frame = CanFrame::new(0x100, vec![0x42], 1_700_000_000_000);
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "id": 256,
                "data": [66],
                "timestamp": 1_700_000_000_000u64,
                "extended": false,
                "dlc": 1
            })
        );

        let tagged = frame.with_channel(1);
        let json = serde_json::to_value(&tagged).unwrap();
        assert_eq!(json["channel"], 1);
    }

    #[test]
    fn test_message_not_found_names_the_id() {
        let message = DecoderError::MessageNotFound(0x7AB).to_string();
        assert_eq!(message, "no definition for id 0x7AB (1963)");
    }

    #[test]
    fn test_datetime_conversion() {
        let frame = CanFrame::new(0x1, vec![], 1_500);
        assert_eq!(frame.datetime().timestamp_millis(), 1_500);
    }
}
