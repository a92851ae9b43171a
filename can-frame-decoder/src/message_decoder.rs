//! Message Decoding Engine
//!
//! Extracts signal values from raw CAN frames based on the catalog's signal
//! definitions and converts them to physical values.

use crate::bitfield;
use crate::signals::{MessageCatalog, SignalDefinition};
use crate::types::{CanFrame, DecodedSignalValue, DecoderError, ParsedFrame, Result};

/// Message name reported for frames without a catalog entry
pub const UNKNOWN_MESSAGE: &str = "Unknown";

/// Applies a single signal definition to a frame
pub struct SignalDecoder;

impl SignalDecoder {
    /// Decode one signal from a frame.
    ///
    /// # Returns
    /// * `Ok(Some(value))` if the signal was decoded
    /// * `Ok(None)` if the frame is too short for the signal (skipped)
    /// * `Err(_)` if the definition itself is unusable
    pub fn decode(
        frame: &CanFrame,
        signal: &SignalDefinition,
        message_name: &str,
    ) -> Result<Option<DecodedSignalValue>> {
        let raw_value = match bitfield::extract(
            &frame.data,
            signal.start_bit as usize,
            signal.length as usize,
            signal.byte_order,
            signal.is_signed(),
        ) {
            Ok(raw) => raw,
            Err(DecoderError::InsufficientData { required, available }) => {
                log::debug!(
                    "Skipping signal '{}' of 0x{:X}: needs {} bytes, frame has {}",
                    signal.name,
                    frame.id,
                    required,
                    available
                );
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let physical_value = (raw_value as f64) * signal.factor + signal.offset;

        let description = signal
            .value_table
            .as_ref()
            .and_then(|table| table.get(&raw_value))
            .cloned();

        Ok(Some(DecodedSignalValue {
            signal_name: signal.name.clone(),
            message_name: message_name.to_string(),
            raw_value,
            physical_value,
            unit: signal.unit.clone(),
            timestamp: frame.timestamp,
            description,
        }))
    }
}

/// Resolves a frame's message definition and decodes every signal in it
pub struct FrameAnalyzer;

impl FrameAnalyzer {
    /// Decode a frame against `catalog`. Never fails: lookup misses and broken
    /// definitions are reported through [`ParsedFrame::error`].
    pub fn parse_frame<C: MessageCatalog + ?Sized>(frame: &CanFrame, catalog: &C) -> ParsedFrame {
        let Some(message_def) = catalog.lookup(frame.id) else {
            log::trace!("Unknown CAN ID: 0x{:X}", frame.id);
            return ParsedFrame {
                can_id: frame.id,
                message_name: UNKNOWN_MESSAGE.to_string(),
                signals: Vec::new(),
                error: Some(DecoderError::MessageNotFound(frame.id).to_string()),
            };
        };

        let mut signals = Vec::with_capacity(message_def.signals.len());
        let mut error = None;
        let mux_value = message_def
            .multiplexor()
            .and_then(|mux| Self::multiplexor_value(frame, mux));

        for signal in &message_def.signals {
            if let Some(mux) = &signal.multiplexer {
                // Unreadable multiplexor means no branch is active
                if !mux_value.is_some_and(|value| mux.is_active(value)) {
                    continue;
                }
            }

            match SignalDecoder::decode(frame, signal, &message_def.name) {
                Ok(Some(decoded)) => signals.push(decoded),
                Ok(None) => {}
                Err(e) => {
                    log::warn!(
                        "Aborting decode of {} (0x{:X}) at signal '{}': {}",
                        message_def.name,
                        frame.id,
                        signal.name,
                        e
                    );
                    error = Some(format!("signal '{}': {}", signal.name, e));
                    break;
                }
            }
        }

        ParsedFrame {
            can_id: frame.id,
            message_name: message_def.name.clone(),
            signals,
            error,
        }
    }

    fn multiplexor_value(frame: &CanFrame, mux: &SignalDefinition) -> Option<u64> {
        bitfield::extract(
            &frame.data,
            mux.start_bit as usize,
            mux.length as usize,
            mux.byte_order,
            mux.is_signed(),
        )
        .ok()
        .map(|raw| raw as u64)
    }
}
