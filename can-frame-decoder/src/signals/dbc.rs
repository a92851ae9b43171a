//! DBC catalog loader
//!
//! The DBC grammar itself is handled by the `can-dbc` crate; this module only
//! converts its output into [`MessageDefinition`]s.

use crate::bitfield::ByteOrder;
use crate::signals::database::{MessageDefinition, MultiplexerInfo, SignalDefinition, ValueType};
use crate::types::{DecoderError, Result, MAX_EXTENDED_ID};
use std::collections::HashMap;
use std::path::Path;

/// DBC marks extended identifiers by setting bit 31
const DBC_EXTENDED_FLAG: u32 = 0x8000_0000;

/// Parse a DBC file and return message definitions
pub fn parse_dbc_file(path: &Path) -> Result<Vec<MessageDefinition>> {
    log::info!("Parsing DBC file: {:?}", path);

    let bytes = std::fs::read(path).map_err(|e| {
        DecoderError::DbcParseError(format!("Failed to read file {:?}: {}", path, e))
    })?;

    // Non-UTF-8 files are usually Windows-1252; map bytes straight to chars
    let content = match String::from_utf8(bytes) {
        Ok(text) => text,
        Err(err) => {
            log::warn!("DBC file is not UTF-8, trying Latin-1 encoding");
            err.into_bytes().iter().map(|&b| b as char).collect()
        }
    };

    let source = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unknown.dbc");

    parse_dbc_str(&content, source)
}

/// Parse DBC text, labelling every definition with `source`
pub fn parse_dbc_str(content: &str, source: &str) -> Result<Vec<MessageDefinition>> {
    let dbc = can_dbc::DBC::from_slice(content.as_bytes()).map_err(|e| {
        DecoderError::DbcParseError(format!("Failed to parse DBC '{}': {:?}", source, e))
    })?;

    let messages: Vec<MessageDefinition> = dbc
        .messages()
        .iter()
        .map(|dbc_msg| convert_message(&dbc, dbc_msg, source))
        .collect();

    log::info!("Parsed {} messages from '{}'", messages.len(), source);
    Ok(messages)
}

fn convert_message(dbc: &can_dbc::DBC, dbc_msg: &can_dbc::Message, source: &str) -> MessageDefinition {
    let raw_id = dbc_msg.message_id().0;
    let extended = raw_id & DBC_EXTENDED_FLAG != 0;
    let id = raw_id & MAX_EXTENDED_ID;

    let multiplexor = dbc_msg
        .signals()
        .iter()
        .find(|sig| matches!(sig.multiplexer_indicator(), can_dbc::MultiplexIndicator::Multiplexor))
        .map(|sig| sig.name().as_str());

    let signals = dbc_msg
        .signals()
        .iter()
        .filter_map(|dbc_sig| {
            let multiplexer = match *dbc_sig.multiplexer_indicator() {
                can_dbc::MultiplexIndicator::MultiplexedSignal(switch_value) => {
                    let Some(name) = multiplexor else {
                        log::warn!(
                            "Skipping multiplexed signal '{}' of {}: message has no multiplexor",
                            dbc_sig.name(),
                            dbc_msg.message_name()
                        );
                        return None;
                    };
                    Some(MultiplexerInfo {
                        multiplexer_signal: name.to_string(),
                        multiplexer_values: vec![switch_value as u64],
                    })
                }
                // Extended multiplexing (SG_MUL_VAL_) is not modelled
                can_dbc::MultiplexIndicator::MultiplexorAndMultiplexedSignal(_) => {
                    log::warn!(
                        "Skipping extended multiplexed signal '{}' of {}",
                        dbc_sig.name(),
                        dbc_msg.message_name()
                    );
                    return None;
                }
                _ => None,
            };
            let descriptions = dbc.value_descriptions_for_signal(can_dbc::MessageId(raw_id), dbc_sig.name());
            Some(convert_signal(dbc_sig, descriptions, multiplexer))
        })
        .collect();

    MessageDefinition {
        id,
        name: dbc_msg.message_name().to_string(),
        length: *dbc_msg.message_size() as usize,
        sending_node: match dbc_msg.transmitter() {
            can_dbc::Transmitter::NodeName(name) => Some(name.to_string()),
            _ => None,
        },
        signals,
        extended,
        source: source.to_string(),
    }
}

/// DBC numbers Motorola bits by the MSB's position inside its byte (bit 7 is
/// the top of byte 0); the codec counts big-endian fields from the MSB of
/// byte 0 onward.
fn codec_start_bit(start_bit: u64, byte_order: ByteOrder) -> u16 {
    let start_bit = match byte_order {
        ByteOrder::LittleEndian => start_bit,
        ByteOrder::BigEndian => (start_bit / 8) * 8 + (7 - start_bit % 8),
    };
    start_bit as u16
}

fn convert_signal(
    dbc_sig: &can_dbc::Signal,
    descriptions: Option<&[can_dbc::ValDescription]>,
    multiplexer: Option<MultiplexerInfo>,
) -> SignalDefinition {
    let byte_order = match *dbc_sig.byte_order() {
        can_dbc::ByteOrder::LittleEndian => ByteOrder::LittleEndian,
        can_dbc::ByteOrder::BigEndian => ByteOrder::BigEndian,
    };

    let value_type = match *dbc_sig.value_type() {
        can_dbc::ValueType::Signed => ValueType::Signed,
        can_dbc::ValueType::Unsigned => ValueType::Unsigned,
    };

    let value_table = descriptions.filter(|d| !d.is_empty()).map(|entries| {
        entries
            .iter()
            .map(|entry| (*entry.a() as i64, entry.b().to_string()))
            .collect::<HashMap<i64, String>>()
    });

    SignalDefinition {
        name: dbc_sig.name().to_string(),
        start_bit: codec_start_bit(*dbc_sig.start_bit() as u64, byte_order),
        length: *dbc_sig.signal_size() as u16,
        byte_order,
        value_type,
        factor: *dbc_sig.factor(),
        offset: *dbc_sig.offset(),
        min: *dbc_sig.min(),
        max: *dbc_sig.max(),
        unit: if dbc_sig.unit().is_empty() {
            None
        } else {
            Some(dbc_sig.unit().to_string())
        },
        value_table,
        receiving_nodes: dbc_sig
            .receivers()
            .iter()
            .filter(|node| node.as_str() != "Vector__XXX")
            .cloned()
            .collect(),
        multiplexer,
    }
}
