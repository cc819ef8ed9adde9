//! RTMP v3 relay server core: handshake, chunk framing, AMF0, protocol
//! control messages, command dispatch, and the stream registry that relays
//! a publisher's media to its subscribers.

pub mod config;
pub mod connection;
pub mod recorder;
pub mod registry;
pub mod rtmp;
pub mod server;
