//! Message catalog
//!
//! The decoding core only needs `lookup(id)`; [`MessageCatalog`] is that seam.
//! [`SignalDatabase`] is the in-memory implementation fed by the DBC loader or
//! by hand-built definitions.

use crate::bitfield::{self, ByteOrder};
use crate::types::{DecoderError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Anything that can resolve a CAN ID to its message layout
pub trait MessageCatalog {
    /// Message definition for `id`, if the catalog has one
    fn lookup(&self, id: u32) -> Option<&MessageDefinition>;
}

impl MessageCatalog for HashMap<u32, MessageDefinition> {
    fn lookup(&self, id: u32) -> Option<&MessageDefinition> {
        self.get(&id)
    }
}

impl<C: MessageCatalog + ?Sized> MessageCatalog for &C {
    fn lookup(&self, id: u32) -> Option<&MessageDefinition> {
        (**self).lookup(id)
    }
}

/// A complete CAN message definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageDefinition {
    /// CAN message ID
    pub id: u32,
    /// Message name
    pub name: String,
    /// Message size in bytes
    pub length: usize,
    /// Sending ECU name (optional)
    pub sending_node: Option<String>,
    /// All signals in this message, in catalog order
    pub signals: Vec<SignalDefinition>,
    /// True if the ID is a 29-bit extended identifier
    #[serde(default)]
    pub extended: bool,
    /// Source file (DBC filename) or other origin label
    #[serde(default)]
    pub source: String,
}

impl MessageDefinition {
    /// Create an empty message definition
    pub fn new(id: u32, name: impl Into<String>, length: usize) -> Self {
        Self {
            id,
            name: name.into(),
            length,
            sending_node: None,
            signals: Vec::new(),
            extended: id > crate::types::MAX_STANDARD_ID,
            source: String::new(),
        }
    }

    /// Builder method: append a signal
    pub fn with_signal(mut self, signal: SignalDefinition) -> Self {
        self.signals.push(signal);
        self
    }

    /// Builder method: set the sending node
    pub fn with_sender(mut self, node: impl Into<String>) -> Self {
        self.sending_node = Some(node.into());
        self
    }

    /// The multiplexor switch signal, if any signal of this message is multiplexed
    pub fn multiplexor(&self) -> Option<&SignalDefinition> {
        let name = self
            .signals
            .iter()
            .find_map(|s| s.multiplexer.as_ref())
            .map(|mux| mux.multiplexer_signal.as_str())?;
        self.signals.iter().find(|s| s.name == name)
    }
}

/// A CAN signal definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalDefinition {
    /// Signal name
    pub name: String,
    /// Start bit in the CAN frame
    pub start_bit: u16,
    /// Length in bits
    pub length: u16,
    /// Byte order
    pub byte_order: ByteOrder,
    /// Value type (signed/unsigned)
    pub value_type: ValueType,
    /// Scale factor to convert raw value to physical value
    pub factor: f64,
    /// Offset to add after scaling
    pub offset: f64,
    /// Minimum physical value
    pub min: f64,
    /// Maximum physical value
    pub max: f64,
    /// Engineering unit (e.g., "km/h", "°C", "V")
    pub unit: Option<String>,
    /// Value table for enum-like values (raw_value -> description)
    pub value_table: Option<HashMap<i64, String>>,
    /// Nodes that consume this signal
    #[serde(default)]
    pub receiving_nodes: Vec<String>,
    /// Set when the signal is only present for certain multiplexor values
    #[serde(default)]
    pub multiplexer: Option<MultiplexerInfo>,
}

/// Multiplexer information for multiplexed signals
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiplexerInfo {
    /// Name of the multiplexor signal that controls this signal
    pub multiplexer_signal: String,
    /// Multiplexor values for which this signal is active
    pub multiplexer_values: Vec<u64>,
}

impl MultiplexerInfo {
    /// Whether the signal is present when the multiplexor reads `value`
    pub fn is_active(&self, value: u64) -> bool {
        self.multiplexer_values.contains(&value)
    }
}

impl SignalDefinition {
    /// Unsigned little-endian signal with identity scaling
    pub fn new(name: impl Into<String>, start_bit: u16, length: u16) -> Self {
        Self {
            name: name.into(),
            start_bit,
            length,
            byte_order: ByteOrder::LittleEndian,
            value_type: ValueType::Unsigned,
            factor: 1.0,
            offset: 0.0,
            min: 0.0,
            max: 0.0,
            unit: None,
            value_table: None,
            receiving_nodes: Vec::new(),
            multiplexer: None,
        }
    }

    pub fn with_byte_order(mut self, byte_order: ByteOrder) -> Self {
        self.byte_order = byte_order;
        self
    }

    pub fn signed(mut self) -> Self {
        self.value_type = ValueType::Signed;
        self
    }

    pub fn with_scaling(mut self, factor: f64, offset: f64) -> Self {
        self.factor = factor;
        self.offset = offset;
        self
    }

    pub fn with_range(mut self, min: f64, max: f64) -> Self {
        self.min = min;
        self.max = max;
        self
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    /// Builder method: present only while `multiplexor` reads `value`
    pub fn multiplexed_by(mut self, multiplexor: impl Into<String>, value: u64) -> Self {
        self.multiplexer = Some(MultiplexerInfo {
            multiplexer_signal: multiplexor.into(),
            multiplexer_values: vec![value],
        });
        self
    }

    pub fn with_value(mut self, raw: i64, description: impl Into<String>) -> Self {
        self.value_table
            .get_or_insert_with(HashMap::new)
            .insert(raw, description.into());
        self
    }

    /// True if raw values are two's complement
    pub fn is_signed(&self) -> bool {
        self.value_type == ValueType::Signed
    }

    /// Raw value range representable by this signal's bit length
    pub fn raw_range(&self) -> Result<(i64, i64)> {
        let length = self.length as u32;
        if length == 0 || length > 64 {
            return Err(DecoderError::InvalidSignalDefinition(format!(
                "signal '{}' has bit length {}",
                self.name, self.length
            )));
        }
        Ok(match (self.value_type, length) {
            (ValueType::Signed, 64) => (i64::MIN, i64::MAX),
            (ValueType::Signed, n) => (-(1i64 << (n - 1)), (1i64 << (n - 1)) - 1),
            (ValueType::Unsigned, 64) | (ValueType::Unsigned, 63) => (0, i64::MAX),
            (ValueType::Unsigned, n) => (0, (1i64 << n) - 1),
        })
    }

    /// Number of payload bytes this signal needs
    pub fn required_bytes(&self) -> usize {
        bitfield::required_bytes(self.start_bit as usize, self.length as usize)
    }
}

/// Value type for signal interpretation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueType {
    /// Signed integer
    Signed,
    /// Unsigned integer
    Unsigned,
}

/// The in-memory signal database
#[derive(Debug, Default)]
pub struct SignalDatabase {
    /// All message definitions by CAN ID (last definition loaded wins)
    messages: HashMap<u32, MessageDefinition>,

    /// Signal name lookup
    /// Key: Signal name, Value: List of (CAN ID, signal index) tuples
    signal_lookup: HashMap<String, Vec<(u32, usize)>>,
}

impl SignalDatabase {
    /// Create a new empty signal database
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a message definition, replacing any earlier one with the same ID
    pub fn add_message(&mut self, message: MessageDefinition) {
        let can_id = message.id;

        if let Some(previous) = self.messages.remove(&can_id) {
            log::debug!(
                "Replacing definition of 0x{:X} ({} from '{}')",
                can_id,
                previous.name,
                previous.source
            );
            for locations in self.signal_lookup.values_mut() {
                locations.retain(|(id, _)| *id != can_id);
            }
            self.signal_lookup.retain(|_, locations| !locations.is_empty());
        }

        for (sig_idx, signal) in message.signals.iter().enumerate() {
            self.signal_lookup
                .entry(signal.name.clone())
                .or_default()
                .push((can_id, sig_idx));
        }

        self.messages.insert(can_id, message);
    }

    /// Get a message definition by CAN ID
    pub fn get_message(&self, can_id: u32) -> Option<&MessageDefinition> {
        self.messages.get(&can_id)
    }

    /// Find all messages containing a specific signal name
    pub fn find_signal(&self, signal_name: &str) -> Vec<(u32, &SignalDefinition)> {
        self.signal_lookup
            .get(signal_name)
            .map(|locations| {
                locations
                    .iter()
                    .filter_map(|(can_id, sig_idx)| {
                        self.get_message(*can_id)
                            .and_then(|msg| msg.signals.get(*sig_idx))
                            .map(|sig| (*can_id, sig))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Iterate over every message definition
    pub fn messages(&self) -> impl Iterator<Item = &MessageDefinition> {
        self.messages.values()
    }

    /// Get database statistics
    pub fn stats(&self) -> DatabaseStats {
        DatabaseStats {
            num_messages: self.messages.len(),
            num_signals: self.messages.values().map(|msg| msg.signals.len()).sum(),
        }
    }

    /// Get all unique CAN IDs in the database
    pub fn get_all_can_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.messages.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

impl MessageCatalog for SignalDatabase {
    fn lookup(&self, id: u32) -> Option<&MessageDefinition> {
        self.get_message(id)
    }
}

/// Database statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DatabaseStats {
    /// Total number of message definitions
    pub num_messages: usize,
    /// Total number of signal definitions
    pub num_signals: usize,
}
