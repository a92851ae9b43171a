//! CAN Frame Decoder Library
//!
//! A stateless, reusable library for turning raw CAN frames into engineering
//! values using a message catalog.
//!
//! # Architecture
//!
//! - [`bitfield`] extracts and assembles raw integers (Intel/Motorola, signed)
//! - [`SignalDecoder`] applies one signal definition to a frame
//! - [`FrameAnalyzer`] resolves the message and decodes all of its signals
//! - [`Decoder`] owns a catalog and runs filtered batch analysis
//!
//! The catalog is consumed through [`MessageCatalog`], so any lookup table can
//! be injected. DBC files are loaded with [`Decoder::add_dbc`].
//!
//! A frame too short for a signal never fails the frame: the signal is
//! skipped. An unknown ID yields an empty result with an error string.
//!
//! # Example Usage
//!
//! ```no_run
//! use can_frame_decoder::{AnalysisConfig, CanFrame, Decoder};
//! use std::path::Path;
//!
//! let mut decoder = Decoder::new();
//! decoder.add_dbc(Path::new("powertrain.dbc")).unwrap();
//!
//! let frames = vec![CanFrame::new(0x123, vec![0x10, 0x27], 1_000)];
//! let config = AnalysisConfig::new().with_exclude_non_finite(true);
//! let result = decoder.parse_data_set(&frames, &config);
//!
//! for value in result.values {
//!     println!("{} = {} {:?}", value.signal_name, value.physical_value, value.unit);
//! }
//! ```

// Public modules
pub mod bitfield;
pub mod config;
pub mod decoder;
pub mod message_decoder;
pub mod signals;
pub mod types;

// Re-export main types for convenience
pub use bitfield::ByteOrder;
pub use config::AnalysisConfig;
pub use decoder::{parse_data_set, DataSetResult, DataSetSummary, DatabaseStats, Decoder};
pub use message_decoder::{FrameAnalyzer, SignalDecoder, UNKNOWN_MESSAGE};
pub use signals::{
    MessageCatalog, MessageDefinition, MultiplexerInfo, SignalDatabase, SignalDefinition, ValueType,
};
pub use types::{
    now_millis, CanFrame, DecodedSignalValue, DecoderError, ParsedFrame, Result, Timestamp,
    MAX_DATA_LENGTH, MAX_EXTENDED_ID, MAX_STANDARD_ID,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_basics() {
        // Smoke test: ensure we can create a decoder
        let decoder = Decoder::new();
        let stats = decoder.database_stats();
        assert_eq!(stats.num_messages, 0);
    }
}
