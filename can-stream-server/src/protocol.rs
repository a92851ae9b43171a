//! JSON wire protocol spoken over `/ws`.
//!
//! Every message is a JSON object tagged by `type`. Field names are camelCase.

use can_frame_decoder::{CanFrame, MAX_DATA_LENGTH, MAX_EXTENDED_ID, MAX_STANDARD_ID};
use serde::{Deserialize, Serialize};

/// Message types a client may send
pub const CLIENT_MESSAGE_TYPES: &[&str] = &[
    "subscribe",
    "unsubscribe",
    "set_filters",
    "start",
    "stop",
    "heartbeat",
    "send_frame",
    "get_interface_info",
];

/// Client → server messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe {
        #[serde(rename = "messageIds", default)]
        message_ids: Vec<u32>,
    },
    Unsubscribe {
        #[serde(rename = "messageIds", default)]
        message_ids: Vec<u32>,
    },
    SetFilters {
        #[serde(rename = "busFilter", default, skip_serializing_if = "Option::is_none")]
        bus_filter: Option<Vec<u8>>,
        #[serde(rename = "idFilter", default, skip_serializing_if = "Option::is_none")]
        id_filter: Option<Vec<u32>>,
    },
    Start,
    Stop,
    Heartbeat,
    /// The frame stays untyped here so a bad payload can be answered with a
    /// `send_frame_response` instead of a protocol error.
    SendFrame {
        #[serde(default)]
        frame: serde_json::Value,
    },
    GetInterfaceInfo,
}

/// Server → client messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Status {
        connected: bool,
        interface: String,
        streaming: bool,
    },
    Frame {
        frame: CanFrame,
    },
    Error {
        error: String,
    },
    Heartbeat {
        timestamp: u64,
    },
    SendFrameResponse {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        frame: Option<CanFrame>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    InterfaceInfo(InterfaceInfo),
    FiltersUpdated {
        #[serde(rename = "busFilter")]
        bus_filter: Option<Vec<u8>>,
        #[serde(rename = "idFilter")]
        id_filter: Option<Vec<u32>>,
    },
    Subscribed {
        #[serde(rename = "messageIds")]
        message_ids: Vec<u32>,
    },
    Unsubscribed {
        #[serde(rename = "messageIds")]
        message_ids: Vec<u32>,
    },
}

/// Answer to `get_interface_info`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterfaceInfo {
    pub interface: String,
    pub connected: bool,
    pub streaming: bool,
    pub sessions: usize,
    pub stats: DistributorStats,
}

/// Counters kept by the distributor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributorStats {
    /// Frames received from the frame source while streaming
    pub frames_received: u64,
    /// Frames relayed from `send_frame`
    pub frames_relayed: u64,
    /// Frames enqueued onto session queues
    pub frames_enqueued: u64,
    /// Queue entries evicted by overflow
    pub frames_dropped: u64,
    /// Error events reported by the frame source
    pub source_errors: u64,
    /// Sessions removed by the heartbeat sweep
    pub sessions_evicted: u64,
}

/// Errors raised while reading client messages
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("unknown message type '{0}'")]
    UnknownType(String),

    #[error("invalid frame: {0}")]
    InvalidFrame(String),
}

/// Parse one text frame from a client.
pub fn parse_client_message(text: &str) -> Result<ClientMessage, ProtocolError> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

    let msg_type = value
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or_else(|| ProtocolError::Malformed("missing 'type' field".to_string()))?;

    if !CLIENT_MESSAGE_TYPES.contains(&msg_type) {
        return Err(ProtocolError::UnknownType(msg_type.to_string()));
    }

    serde_json::from_value(value).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

/// Shape accepted for `send_frame` payloads before normalization
#[derive(Debug, Deserialize)]
struct FrameInput {
    id: u64,
    #[serde(default)]
    data: Vec<i64>,
    #[serde(default)]
    extended: Option<bool>,
    #[serde(default)]
    dlc: Option<u64>,
    #[serde(default)]
    channel: Option<u8>,
}

/// Validate a client-supplied frame and turn it into a canonical [`CanFrame`]
/// stamped with `received_at`.
pub fn normalize_frame(value: &serde_json::Value, received_at: u64) -> Result<CanFrame, ProtocolError> {
    if !value.is_object() {
        return Err(ProtocolError::InvalidFrame("frame must be an object".to_string()));
    }

    let input: FrameInput = serde_json::from_value(value.clone())
        .map_err(|e| ProtocolError::InvalidFrame(e.to_string()))?;

    if input.id > MAX_EXTENDED_ID as u64 {
        return Err(ProtocolError::InvalidFrame(format!(
            "id {} exceeds the 29-bit range",
            input.id
        )));
    }
    let id = input.id as u32;

    if input.data.len() > MAX_DATA_LENGTH {
        return Err(ProtocolError::InvalidFrame(format!(
            "data has {} bytes, at most {} allowed",
            input.data.len(),
            MAX_DATA_LENGTH
        )));
    }

    let data = input
        .data
        .iter()
        .map(|&byte| {
            u8::try_from(byte)
                .map_err(|_| ProtocolError::InvalidFrame(format!("byte value {} out of range", byte)))
        })
        .collect::<Result<Vec<u8>, _>>()?;

    if let Some(dlc) = input.dlc {
        if dlc as usize != data.len() {
            return Err(ProtocolError::InvalidFrame(format!(
                "dlc {} does not match data length {}",
                dlc,
                data.len()
            )));
        }
    }

    let mut frame = CanFrame::new(id, data, received_at);
    frame.extended = input.extended.unwrap_or(id > MAX_STANDARD_ID);
    frame.channel = input.channel;

    frame
        .validate()
        .map_err(|e| ProtocolError::InvalidFrame(e.to_string()))?;
    Ok(frame)
}
