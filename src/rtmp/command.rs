//! AMF0 command (RPC) parsing and response/onStatus builders.
//!
//! Command messages (type id 20) are a flat sequence of AMF0 values: a
//! command-name string, a transaction id, a command object (often `Null`),
//! then zero or more arguments. This module only encodes/decodes that
//! shape; routing lives in [`crate::connection`], which owns the
//! per-connection session state the handlers need.

use std::sync::atomic::{AtomicU32, Ordering};

use thiserror::Error;

use super::amf0::{self, Amf0Value, AmfError};
use super::chunk::Message;

/// Command responses are sent on this CSID; the exact choice is free as
/// long as the writer's header compression stays self-consistent.
pub const COMMAND_RESPONSE_CSID: u32 = 3;
const COMMAND_TYPE_ID: u8 = 20;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error(transparent)]
    Amf(#[from] AmfError),
    #[error("command message missing its leading name string")]
    MissingName,
}

pub type CommandResult<T> = Result<T, CommandError>;

/// A parsed AMF0 command.
#[derive(Debug, Clone)]
pub struct Command {
    pub name: String,
    pub transaction_id: f64,
    pub command_object: Amf0Value,
    pub arguments: Vec<Amf0Value>,
}

impl Command {
    pub fn parse(payload: &[u8]) -> CommandResult<Self> {
        let values = amf0::decode_all(payload)?;
        let mut iter = values.into_iter();
        let name = match iter.next() {
            Some(Amf0Value::String(s)) => s,
            _ => return Err(CommandError::MissingName),
        };
        let transaction_id = iter.next().and_then(|v| v.as_f64()).unwrap_or(0.0);
        let command_object = iter.next().unwrap_or(Amf0Value::Null);
        let arguments = iter.collect();
        Ok(Command { name, transaction_id, command_object, arguments })
    }

    pub fn argument(&self, index: usize) -> Option<&Amf0Value> {
        self.arguments.get(index)
    }
}

/// Allocates message stream ids for `createStream`, starting at 1.
#[derive(Debug, Default)]
pub struct StreamIdAllocator(AtomicU32);

impl StreamIdAllocator {
    pub fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    pub fn allocate(&self) -> u32 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }
}

fn command_message(stream_id: u32, values: Vec<Amf0Value>) -> Message {
    let payload = amf0::encode_all(&values);
    Message::new(COMMAND_RESPONSE_CSID, 0, COMMAND_TYPE_ID, stream_id, payload.into())
}

/// Builds a `_result` command reply with `transaction_id` echoed back.
pub fn result(transaction_id: f64, stream_id: u32, mut values: Vec<Amf0Value>) -> Message {
    let mut out = vec![Amf0Value::string("_result"), Amf0Value::Number(transaction_id)];
    out.append(&mut values);
    command_message(stream_id, out)
}

/// Builds the `connect` success reply.
pub fn connect_result(transaction_id: f64) -> Message {
    result(
        transaction_id,
        0,
        vec![
            Amf0Value::object([
                ("fmsVer", Amf0Value::string("FMS/3,5,7,7009")),
                ("capabilities", Amf0Value::Number(31.0)),
                ("mode", Amf0Value::Number(1.0)),
            ]),
            Amf0Value::object([
                ("level", Amf0Value::string("status")),
                ("code", Amf0Value::string("NetConnection.Connect.Success")),
                ("description", Amf0Value::string("Connection succeeded.")),
                ("objectEncoding", Amf0Value::Number(0.0)),
            ]),
        ],
    )
}

/// Builds the `createStream` success reply.
pub fn create_stream_result(transaction_id: f64, allocated_stream_id: u32) -> Message {
    result(transaction_id, 0, vec![Amf0Value::Null, Amf0Value::Number(allocated_stream_id as f64)])
}

/// A bare `_result(null)` reply, used for client notifications the relay
/// acknowledges but otherwise ignores (`releaseStream`, `FCPublish`).
pub fn generic_result(transaction_id: f64) -> Message {
    result(transaction_id, 0, vec![Amf0Value::Null])
}

/// Status payload for an `onStatus` reply.
pub struct StatusInfo {
    pub level: &'static str,
    pub code: &'static str,
    pub description: String,
    pub details: Option<String>,
}

impl StatusInfo {
    pub fn status(code: &'static str, description: impl Into<String>) -> Self {
        Self { level: "status", code, description: description.into(), details: None }
    }

    pub fn error(code: &'static str, description: impl Into<String>) -> Self {
        Self { level: "error", code, description: description.into(), details: None }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// Builds an `onStatus` command (transaction id 0, a `Null` command object,
/// then the info object) on `stream_id`.
pub fn on_status(stream_id: u32, info: StatusInfo) -> Message {
    let mut pairs: Vec<(&'static str, Amf0Value)> = vec![
        ("level", Amf0Value::string(info.level)),
        ("code", Amf0Value::string(info.code)),
        ("description", Amf0Value::String(info.description)),
    ];
    if let Some(details) = info.details {
        pairs.push(("details", Amf0Value::String(details)));
    }
    let info_obj = Amf0Value::object(pairs);
    command_message(stream_id, vec![Amf0Value::string("onStatus"), Amf0Value::Number(0.0), Amf0Value::Null, info_obj])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_connect_command() {
        let payload = amf0::encode_all(&[
            Amf0Value::string("connect"),
            Amf0Value::Number(1.0),
            Amf0Value::object([("app", Amf0Value::string("live"))]),
        ]);
        let cmd = Command::parse(&payload).unwrap();
        assert_eq!(cmd.name, "connect");
        assert_eq!(cmd.transaction_id, 1.0);
        assert_eq!(cmd.command_object.get("app").and_then(|v| v.as_str()), Some("live"));
    }

    #[test]
    fn parses_publish_command_arguments() {
        let payload = amf0::encode_all(&[
            Amf0Value::string("publish"),
            Amf0Value::Number(3.0),
            Amf0Value::Null,
            Amf0Value::string("t"),
            Amf0Value::string("live"),
        ]);
        let cmd = Command::parse(&payload).unwrap();
        assert_eq!(cmd.argument(0).and_then(|v| v.as_str()), Some("t"));
        assert_eq!(cmd.argument(1).and_then(|v| v.as_str()), Some("live"));
    }

    #[test]
    fn missing_name_is_an_error() {
        let payload = amf0::encode_all(&[Amf0Value::Number(1.0)]);
        assert!(matches!(Command::parse(&payload), Err(CommandError::MissingName)));
    }

    #[test]
    fn stream_id_allocator_starts_at_one_and_increments() {
        let alloc = StreamIdAllocator::new();
        assert_eq!(alloc.allocate(), 1);
        assert_eq!(alloc.allocate(), 2);
        assert_eq!(alloc.allocate(), 3);
    }

    #[test]
    fn on_status_round_trips_through_command_parse() {
        let msg = on_status(5, StatusInfo::status("NetStream.Play.Start", "Started playing t.").with_details("live/t"));
        let cmd = Command::parse(&msg.payload).unwrap();
        assert_eq!(cmd.name, "onStatus");
        assert_eq!(cmd.command_object, Amf0Value::Null);
        assert_eq!(cmd.argument(0).unwrap().get("code").and_then(|v| v.as_str()), Some("NetStream.Play.Start"));
        assert_eq!(cmd.argument(0).unwrap().get("details").and_then(|v| v.as_str()), Some("live/t"));
    }
}
