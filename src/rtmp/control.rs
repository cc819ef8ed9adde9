//! Protocol control messages (type ids 1–6) and User Control events carried
//! on type id 4.
//!
//! Set Chunk Size is special-cased inline by [`crate::rtmp::chunk::ChunkReader`]
//! since it must take effect mid-stream; everything else here is decoded and
//! dispatched by the connection's read loop.

use thiserror::Error;

use super::bytes::{read_u16_be, read_u32_be};
use super::chunk::Message;

pub const CONTROL_CSID: u32 = 2;
pub const CONTROL_STREAM_ID: u32 = 0;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("control message type {0} payload too short: got {1} bytes")]
    Truncated(u8, usize),
    #[error("set chunk size out of range: {0} (must be 1..=65536)")]
    ChunkSizeOutOfRange(u32),
    #[error("unknown user control event type: {0}")]
    UnknownUserControlEvent(u16),
}

pub type ControlResult<T> = Result<T, ControlError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BandwidthLimitType {
    Hard,
    Soft,
    Dynamic,
}

impl BandwidthLimitType {
    fn as_u8(self) -> u8 {
        match self {
            BandwidthLimitType::Hard => 0,
            BandwidthLimitType::Soft => 1,
            BandwidthLimitType::Dynamic => 2,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => BandwidthLimitType::Hard,
            1 => BandwidthLimitType::Soft,
            _ => BandwidthLimitType::Dynamic,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum UserControlEvent {
    StreamBegin { stream_id: u32 },
    StreamEof { stream_id: u32 },
    PingRequest { timestamp: u32 },
    PingResponse { timestamp: u32 },
}

impl UserControlEvent {
    const EVENT_STREAM_BEGIN: u16 = 0;
    const EVENT_STREAM_EOF: u16 = 1;
    const EVENT_PING_REQUEST: u16 = 6;
    const EVENT_PING_RESPONSE: u16 = 7;

    pub fn decode(payload: &[u8]) -> ControlResult<Self> {
        if payload.len() < 2 {
            return Err(ControlError::Truncated(4, payload.len()));
        }
        let event_type = read_u16_be(&payload[0..2]);
        let data = &payload[2..];
        match event_type {
            Self::EVENT_STREAM_BEGIN if data.len() >= 4 => {
                Ok(UserControlEvent::StreamBegin { stream_id: read_u32_be(data) })
            }
            Self::EVENT_STREAM_EOF if data.len() >= 4 => {
                Ok(UserControlEvent::StreamEof { stream_id: read_u32_be(data) })
            }
            Self::EVENT_PING_REQUEST if data.len() >= 4 => {
                Ok(UserControlEvent::PingRequest { timestamp: read_u32_be(data) })
            }
            Self::EVENT_PING_RESPONSE if data.len() >= 4 => {
                Ok(UserControlEvent::PingResponse { timestamp: read_u32_be(data) })
            }
            other => Err(ControlError::UnknownUserControlEvent(other)),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let (event_type, data): (u16, u32) = match *self {
            UserControlEvent::StreamBegin { stream_id } => (Self::EVENT_STREAM_BEGIN, stream_id),
            UserControlEvent::StreamEof { stream_id } => (Self::EVENT_STREAM_EOF, stream_id),
            UserControlEvent::PingRequest { timestamp } => (Self::EVENT_PING_REQUEST, timestamp),
            UserControlEvent::PingResponse { timestamp } => (Self::EVENT_PING_RESPONSE, timestamp),
        };
        let mut out = Vec::with_capacity(6);
        out.extend_from_slice(&event_type.to_be_bytes());
        out.extend_from_slice(&data.to_be_bytes());
        out
    }
}

/// Builds a protocol control [`Message`] (CSID 2, MSID 0) carrying `payload`
/// under `type_id`, timestamped 0.
fn control_message(type_id: u8, payload: Vec<u8>) -> Message {
    Message::new(CONTROL_CSID, 0, type_id, CONTROL_STREAM_ID, payload.into())
}

pub fn set_chunk_size(size: u32) -> Message {
    control_message(1, size.to_be_bytes().to_vec())
}

pub fn abort_message(csid: u32) -> Message {
    control_message(2, csid.to_be_bytes().to_vec())
}

pub fn acknowledgement(sequence_number: u32) -> Message {
    control_message(3, sequence_number.to_be_bytes().to_vec())
}

pub fn user_control(event: UserControlEvent) -> Message {
    control_message(4, event.encode())
}

pub fn window_ack_size(size: u32) -> Message {
    control_message(5, size.to_be_bytes().to_vec())
}

pub fn set_peer_bandwidth(size: u32, limit_type: BandwidthLimitType) -> Message {
    let mut payload = size.to_be_bytes().to_vec();
    payload.push(limit_type.as_u8());
    control_message(6, payload)
}

/// Decodes a Set Peer Bandwidth payload, validating length.
pub fn decode_set_peer_bandwidth(payload: &[u8]) -> ControlResult<(u32, BandwidthLimitType)> {
    if payload.len() < 5 {
        return Err(ControlError::Truncated(6, payload.len()));
    }
    Ok((read_u32_be(&payload[0..4]), BandwidthLimitType::from_u8(payload[4])))
}

pub fn decode_u32_payload(type_id: u8, payload: &[u8]) -> ControlResult<u32> {
    if payload.len() < 4 {
        return Err(ControlError::Truncated(type_id, payload.len()));
    }
    Ok(read_u32_be(&payload[0..4]))
}

/// Validates a requested `SetChunkSize` value.
pub fn validate_chunk_size(size: u32) -> ControlResult<()> {
    if size == 0 || size > 65536 {
        return Err(ControlError::ChunkSizeOutOfRange(size));
    }
    Ok(())
}

/// The fixed triple the server emits immediately after handshake completion:
/// Window Ack Size, Set Peer Bandwidth, Set Chunk Size, in this order.
pub fn control_burst(window_ack_size_value: u32, chunk_size: u32) -> Vec<Message> {
    vec![
        window_ack_size(window_ack_size_value),
        set_peer_bandwidth(window_ack_size_value, BandwidthLimitType::Dynamic),
        set_chunk_size(chunk_size),
    ]
}
