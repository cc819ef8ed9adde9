//! The recorder hook (spec.md §6): an optional per-stream observer invoked
//! for each audio/video message received from the publisher. The concrete
//! tag-oriented container writer is out of scope for this core; only the
//! trait contract and a no-op implementation live here.

use crate::rtmp::chunk::Message;

pub type RecorderError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub trait Recorder: Send + Sync {
    fn write_message(&self, msg: &Message) -> Result<(), RecorderError>;
}

/// Default recorder installed on a [`crate::registry::Stream`] when
/// `--record-all` is not set. Discards every message without error.
#[derive(Debug, Default)]
pub struct NullRecorder;

impl Recorder for NullRecorder {
    fn write_message(&self, _msg: &Message) -> Result<(), RecorderError> {
        Ok(())
    }
}

/// Installed instead of [`NullRecorder`] when `--record-all` is set. A
/// real container writer is out of scope for this core (spec.md §1
/// non-goals); this just traces each message so the flag has an
/// observable effect without pulling in a muxer.
#[derive(Debug, Default)]
pub struct LoggingRecorder;

impl Recorder for LoggingRecorder {
    fn write_message(&self, msg: &Message) -> Result<(), RecorderError> {
        tracing::debug!(type_id = msg.type_id, timestamp = msg.timestamp, len = msg.payload.len(), "recording message");
        Ok(())
    }
}
