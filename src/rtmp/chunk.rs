//! Chunk header parsing/serialization and per-chunk-stream reassembly.
//!
//! The reader accumulates raw bytes fed to it by the connection's read loop
//! into an internal buffer and repeatedly tries to carve complete chunks —
//! and, once enough chunks have arrived, complete messages — out of it. The
//! feed/read_messages split sidesteps the "EOF mid-header" class of error
//! entirely, since a header is only ever parsed once every one of its bytes
//! has already arrived.

use std::collections::HashMap;

use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use super::bytes::{read_u24_be, read_u32_be, read_u32_le, write_u24_be, EXTENDED_TIMESTAMP_MARKER as EXTENDED_TIMESTAMP_FIELD};

pub const DEFAULT_CHUNK_SIZE: usize = 128;

#[derive(Debug, Error)]
pub enum ChunkError {
    #[error("fmt 3 chunk on csid {0} with no message in progress")]
    Fmt3WithoutContext(u32),
    #[error("fmt 2 chunk on csid {0} with no prior header")]
    Fmt2WithoutContext(u32),
    #[error("chunk payload for csid {0} exceeds its declared message length")]
    PayloadOverflow(u32),
    #[error("invalid chunk stream id {0}: 0 and 1 are reserved basic-header escapes")]
    InvalidCsid(u32),
    #[error("set chunk size out of range: {0} (must be 1..=65536)")]
    ChunkSizeOutOfRange(u32),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ChunkResult<T> = Result<T, ChunkError>;

/// A fully reassembled RTMP message.
#[derive(Debug, Clone)]
pub struct Message {
    pub csid: u32,
    pub timestamp: u32,
    pub type_id: u8,
    pub stream_id: u32,
    pub payload: Bytes,
}

impl Message {
    pub fn new(csid: u32, timestamp: u32, type_id: u8, stream_id: u32, payload: Bytes) -> Self {
        Self { csid, timestamp, type_id, stream_id, payload }
    }

    pub fn len(&self) -> u32 {
        self.payload.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Wire-format descriptor for a single chunk header.
#[derive(Debug, Clone)]
pub struct ChunkHeader {
    pub fmt: u8,
    pub csid: u32,
    pub timestamp: u32,
    pub message_length: u32,
    pub message_type_id: u8,
    pub message_stream_id: u32,
    pub has_extended_timestamp: bool,
    pub extended_timestamp_value: u32,
    pub is_delta: bool,
}

/// Per-chunk-stream reassembly state, reader side.
#[derive(Debug, Default)]
struct ChunkStreamState {
    seen: bool,
    in_progress: bool,
    last_timestamp: u32,
    last_message_length: u32,
    last_type_id: u8,
    last_stream_id: u32,
    last_has_extended_timestamp: bool,
    buffer: Vec<u8>,
    bytes_received: usize,
}

impl ChunkStreamState {
    fn apply_header(&mut self, csid: u32, h: &ChunkHeader) -> ChunkResult<()> {
        match h.fmt {
            0 => {
                self.last_timestamp = h.timestamp;
                self.last_message_length = h.message_length;
                self.last_type_id = h.message_type_id;
                self.last_stream_id = h.message_stream_id;
                self.last_has_extended_timestamp = h.has_extended_timestamp;
                self.buffer.clear();
                self.bytes_received = 0;
                self.in_progress = self.last_message_length > 0;
                self.seen = true;
            }
            1 => {
                if !self.seen {
                    // Lenient first-use rule: treat as absolute timestamp,
                    // stream id 0. Real encoders send FMT1 on a CSID they've
                    // never used before; rejecting it would break them for
                    // no correctness gain.
                    self.last_timestamp = h.timestamp;
                    self.last_stream_id = 0;
                } else {
                    self.last_timestamp = self.last_timestamp.wrapping_add(h.timestamp);
                }
                self.last_message_length = h.message_length;
                self.last_type_id = h.message_type_id;
                self.last_has_extended_timestamp = h.has_extended_timestamp;
                self.buffer.clear();
                self.bytes_received = 0;
                self.in_progress = self.last_message_length > 0;
                self.seen = true;
            }
            2 => {
                if !self.seen {
                    return Err(ChunkError::Fmt2WithoutContext(csid));
                }
                self.last_timestamp = self.last_timestamp.wrapping_add(h.timestamp);
                self.last_has_extended_timestamp = h.has_extended_timestamp;
                self.buffer.clear();
                self.bytes_received = 0;
                self.in_progress = self.last_message_length > 0;
            }
            3 => {
                if !self.seen || !self.in_progress || self.last_message_length == 0 {
                    return Err(ChunkError::Fmt3WithoutContext(csid));
                }
            }
            other => unreachable!("fmt bits always mask to 0..=3, got {other}"),
        }
        Ok(())
    }

    fn bytes_remaining(&self) -> usize {
        if !self.in_progress {
            return 0;
        }
        (self.last_message_length as usize).saturating_sub(self.bytes_received)
    }

    /// Appends freshly-read chunk-data bytes, returning the reassembled
    /// payload once the declared message length has been reached.
    fn append_chunk_data(&mut self, csid: u32, data: &[u8]) -> ChunkResult<Option<Bytes>> {
        if self.bytes_received + data.len() > self.last_message_length as usize {
            return Err(ChunkError::PayloadOverflow(csid));
        }
        self.buffer.extend_from_slice(data);
        self.bytes_received += data.len();

        if self.bytes_received == self.last_message_length as usize {
            let payload = Bytes::copy_from_slice(&self.buffer);
            self.buffer.clear();
            self.bytes_received = 0;
            self.in_progress = false;
            Ok(Some(payload))
        } else {
            Ok(None)
        }
    }
}

/// Dechunks a byte stream fed via [`ChunkReader::feed`] into whole [`Message`]s.
pub struct ChunkReader {
    states: HashMap<u32, ChunkStreamState>,
    buf: Vec<u8>,
    read_chunk_size: usize,
}

impl ChunkReader {
    pub fn new() -> Self {
        Self {
            states: HashMap::new(),
            buf: Vec::with_capacity(64 * 1024),
            read_chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn read_chunk_size(&self) -> usize {
        self.read_chunk_size
    }

    pub fn set_chunk_size(&mut self, size: u32) -> ChunkResult<()> {
        if size == 0 || size > 0x7FFF_FFFF || size as usize > 65536 {
            return Err(ChunkError::ChunkSizeOutOfRange(size));
        }
        self.read_chunk_size = size as usize;
        Ok(())
    }

    /// Appends freshly-received bytes from the transport.
    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Discards whatever message is in progress on `csid` (Abort Message,
    /// type id 2). A no-op if the CSID has no reassembly state.
    pub fn abort(&mut self, csid: u32) {
        if let Some(state) = self.states.get_mut(&csid) {
            state.buffer.clear();
            state.bytes_received = 0;
            state.in_progress = false;
        }
    }

    /// Drains as many complete messages as the currently buffered bytes
    /// allow. A Set Chunk Size control message is applied in-place so that
    /// chunks appearing later in the same buffer are parsed with the new
    /// size.
    pub fn read_messages(&mut self) -> ChunkResult<Vec<Message>> {
        let mut messages = Vec::new();
        while let Some(msg) = self.try_read_one()? {
            if msg.type_id == 1 && msg.stream_id == 0 && msg.payload.len() >= 4 {
                let requested = read_u32_be(&msg.payload[..4]);
                if requested >= 1 && requested <= 65536 {
                    self.read_chunk_size = requested as usize;
                }
            }
            messages.push(msg);
        }
        Ok(messages)
    }

    fn try_read_one(&mut self) -> ChunkResult<Option<Message>> {
        let mut pos = 0usize;

        if self.buf.is_empty() {
            return Ok(None);
        }

        // ── basic header ──
        let first = self.buf[pos];
        let fmt = (first >> 6) & 0x03;
        let low6 = first & 0x3F;
        pos += 1;

        let csid: u32 = match low6 {
            0 => {
                if pos >= self.buf.len() {
                    return Ok(None);
                }
                let id = self.buf[pos] as u32 + 64;
                pos += 1;
                id
            }
            1 => {
                if pos + 1 >= self.buf.len() {
                    return Ok(None);
                }
                let id = self.buf[pos] as u32 + (self.buf[pos + 1] as u32) * 256 + 64;
                pos += 2;
                id
            }
            n => n as u32,
        };
        if csid == 0 || csid == 1 {
            return Err(ChunkError::InvalidCsid(csid));
        }

        // ── message header ──
        let header_len = match fmt {
            0 => 11,
            1 => 7,
            2 => 3,
            3 => 0,
            _ => unreachable!(),
        };
        if pos + header_len > self.buf.len() {
            return Ok(None);
        }

        let prior_extended = self.states.get(&csid).map(|s| s.last_has_extended_timestamp).unwrap_or(false);

        let mut message_length = 0u32;
        let mut message_type_id = 0u8;
        let mut message_stream_id = 0u32;
        let mut timestamp_field = 0u32;

        match fmt {
            0 => {
                timestamp_field = read_u24_be(&self.buf[pos..pos + 3]);
                message_length = read_u24_be(&self.buf[pos + 3..pos + 6]);
                message_type_id = self.buf[pos + 6];
                message_stream_id = read_u32_le(&self.buf[pos + 7..pos + 11]);
                pos += 11;
            }
            1 => {
                timestamp_field = read_u24_be(&self.buf[pos..pos + 3]);
                message_length = read_u24_be(&self.buf[pos + 3..pos + 6]);
                message_type_id = self.buf[pos + 6];
                pos += 7;
            }
            2 => {
                timestamp_field = read_u24_be(&self.buf[pos..pos + 3]);
                pos += 3;
            }
            3 => {}
            _ => unreachable!(),
        }

        let has_extended = if fmt == 3 {
            prior_extended
        } else {
            timestamp_field == EXTENDED_TIMESTAMP_FIELD
        };

        let mut extended_value = timestamp_field;
        if has_extended {
            if pos + 4 > self.buf.len() {
                return Ok(None);
            }
            extended_value = read_u32_be(&self.buf[pos..pos + 4]);
            pos += 4;
        }

        let header = ChunkHeader {
            fmt,
            csid,
            timestamp: extended_value,
            message_length,
            message_type_id,
            message_stream_id,
            has_extended_timestamp: has_extended,
            extended_timestamp_value: extended_value,
            is_delta: fmt == 1 || fmt == 2,
        };

        let state = self.states.entry(csid).or_default();
        state.apply_header(csid, &header)?;

        let remaining = state.bytes_remaining();
        let read_len = remaining.min(self.read_chunk_size);
        if pos + read_len > self.buf.len() {
            return Ok(None);
        }

        let chunk_data = &self.buf[pos..pos + read_len];
        let completed = state.append_chunk_data(csid, chunk_data)?;
        let timestamp = state.last_timestamp;
        let type_id = state.last_type_id;
        let stream_id = state.last_stream_id;
        pos += read_len;

        self.buf.drain(..pos);

        Ok(completed.map(|payload| Message::new(csid, timestamp, type_id, stream_id, payload)))
    }
}

impl Default for ChunkReader {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-CSID send history, mirroring [`ChunkStreamState`] on the write side.
#[derive(Debug, Clone)]
struct SentHistory {
    timestamp: u32,
    message_length: u32,
    type_id: u8,
    stream_id: u32,
}

/// Fragments [`Message`]s back into chunks, choosing the most compressed
/// header format compatible with its own per-CSID sent history
/// (spec.md §4.6).
pub struct ChunkWriter {
    write_chunk_size: usize,
    history: HashMap<u32, SentHistory>,
}

impl ChunkWriter {
    pub fn new() -> Self {
        Self { write_chunk_size: DEFAULT_CHUNK_SIZE, history: HashMap::new() }
    }

    pub fn write_chunk_size(&self) -> usize {
        self.write_chunk_size
    }

    pub fn set_chunk_size(&mut self, size: u32) -> ChunkResult<()> {
        if size == 0 || size as usize > 65536 {
            return Err(ChunkError::ChunkSizeOutOfRange(size));
        }
        self.write_chunk_size = size as usize;
        Ok(())
    }

    /// Serializes `msg` and writes every resulting chunk to `sink`, one
    /// `write_all` call per chunk (spec.md §4.6 step 4).
    pub async fn write_message<W: AsyncWrite + Unpin>(
        &mut self,
        sink: &mut W,
        msg: &Message,
    ) -> ChunkResult<()> {
        let prior = self.history.get(&msg.csid).cloned();

        let fmt = match &prior {
            None => 0u8,
            Some(p) if p.stream_id != msg.stream_id => 0,
            Some(p) if p.message_length == msg.len() && p.type_id == msg.type_id => 2,
            Some(_) => 1,
        };

        let transmitted_field: u32 = match fmt {
            0 => msg.timestamp,
            _ => msg.timestamp.wrapping_sub(prior.as_ref().unwrap().timestamp),
        };
        let extended = transmitted_field >= EXTENDED_TIMESTAMP_FIELD;

        let mut first_chunk = Vec::with_capacity(16 + msg.len() as usize);
        write_basic_header(&mut first_chunk, fmt, msg.csid);
        match fmt {
            0 => {
                write_u24_be(&mut first_chunk, if extended { EXTENDED_TIMESTAMP_FIELD } else { transmitted_field });
                write_u24_be(&mut first_chunk, msg.len());
                first_chunk.push(msg.type_id);
                first_chunk.extend_from_slice(&msg.stream_id.to_le_bytes());
            }
            1 => {
                write_u24_be(&mut first_chunk, if extended { EXTENDED_TIMESTAMP_FIELD } else { transmitted_field });
                write_u24_be(&mut first_chunk, msg.len());
                first_chunk.push(msg.type_id);
            }
            2 => {
                write_u24_be(&mut first_chunk, if extended { EXTENDED_TIMESTAMP_FIELD } else { transmitted_field });
            }
            _ => unreachable!(),
        }
        if extended {
            first_chunk.extend_from_slice(&transmitted_field.to_be_bytes());
        }

        let chunk_size = self.write_chunk_size;
        let payload = &msg.payload;
        let first_len = payload.len().min(chunk_size);
        first_chunk.extend_from_slice(&payload[..first_len]);
        sink.write_all(&first_chunk).await?;

        let mut offset = first_len;
        while offset < payload.len() {
            let take = (payload.len() - offset).min(chunk_size);
            let mut chunk = Vec::with_capacity(8 + take);
            write_basic_header(&mut chunk, 3, msg.csid);
            if extended {
                chunk.extend_from_slice(&transmitted_field.to_be_bytes());
            }
            chunk.extend_from_slice(&payload[offset..offset + take]);
            sink.write_all(&chunk).await?;
            offset += take;
        }

        self.history.insert(
            msg.csid,
            SentHistory {
                timestamp: msg.timestamp,
                message_length: msg.len(),
                type_id: msg.type_id,
                stream_id: msg.stream_id,
            },
        );
        Ok(())
    }
}

impl Default for ChunkWriter {
    fn default() -> Self {
        Self::new()
    }
}

fn write_basic_header(out: &mut Vec<u8>, fmt: u8, csid: u32) {
    if (2..=63).contains(&csid) {
        out.push((fmt << 6) | csid as u8);
    } else if (64..=319).contains(&csid) {
        out.push(fmt << 6);
        out.push((csid - 64) as u8);
    } else {
        out.push((fmt << 6) | 1);
        let adjusted = csid - 64;
        out.push(adjusted as u8);
        out.push((adjusted >> 8) as u8);
    }
}
