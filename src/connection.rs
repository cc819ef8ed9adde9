//! Per-connection read loop, write loop, and the bounded outbound queue
//! between them (spec.md §4.9).
//!
//! A connection owns its transport, its [`ChunkReader`]/[`ChunkWriter`], and
//! the outbound queue exclusively; the registry only ever holds a
//! [`ConnectionHandle`], a cheap, cloneable, non-owning reference a `Stream`
//! can submit messages through without reaching into the connection itself.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::recorder::LoggingRecorder;
use crate::registry::Registry;
use crate::rtmp::amf0::Amf0Value;
use crate::rtmp::chunk::{ChunkReader, ChunkWriter, Message};
use crate::rtmp::command::{self, Command, StatusInfo, StreamIdAllocator};
use crate::rtmp::control::{self, UserControlEvent};
use crate::rtmp::handshake;

/// Capacity of the bounded outbound queue between a connection's reader
/// (or the relay broadcasting into a subscriber) and its writer task
/// (spec.md §4.9).
const OUTBOUND_QUEUE_CAPACITY: usize = 100;
/// `SendMessage`'s bounded-wait submission deadline (spec.md §5).
const ENQUEUE_TIMEOUT: Duration = Duration::from_millis(100);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Outcome of [`ConnectionHandle::send_message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    QueueFull,
    Closed,
}

/// A cheap, cloneable, non-owning reference to a connection's outbound
/// queue. This is what a [`crate::registry::Stream`] stores for its
/// publisher and subscribers — the stream never touches the connection's
/// socket, reader, or writer directly.
#[derive(Clone)]
pub struct ConnectionHandle {
    pub id: u64,
    pub peer_addr: SocketAddr,
    tx: mpsc::Sender<Message>,
}

impl ConnectionHandle {
    /// Bounded-wait submission (spec.md §4.9 `SendMessage`): blocks up to
    /// [`ENQUEUE_TIMEOUT`] for room in the queue.
    pub async fn send_message(&self, msg: Message) -> SendOutcome {
        match tokio::time::timeout(ENQUEUE_TIMEOUT, self.tx.send(msg)).await {
            Ok(Ok(())) => SendOutcome::Sent,
            Ok(Err(_)) => SendOutcome::Closed,
            Err(_) => SendOutcome::QueueFull,
        }
    }

    /// Strictly non-blocking submission (spec.md §4.9 `TrySendMessage`),
    /// used by the relay's broadcast loop so a stalled subscriber never
    /// delays the publisher.
    pub fn try_send_message(&self, msg: Message) -> bool {
        self.tx.try_send(msg).is_ok()
    }
}

impl PartialEq for ConnectionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for ConnectionHandle {}

/// Per-connection session state (spec.md §3 `Connection`'s session
/// substructure): negotiated app name, allocated stream ids, and which
/// stream key (if any) this connection is publishing to or subscribed on.
struct Session {
    app: String,
    stream_ids: StreamIdAllocator,
    publishing_key: Option<String>,
    subscribing_key: Option<String>,
    bytes_received: u64,
    last_ack_sent: u64,
    window_ack_size: u32,
}

impl Session {
    fn new(window_ack_size: u32) -> Self {
        Self {
            app: String::new(),
            stream_ids: StreamIdAllocator::new(),
            publishing_key: None,
            subscribing_key: None,
            bytes_received: 0,
            last_ack_sent: 0,
            window_ack_size,
        }
    }
}

/// Runs the handshake and control burst on a freshly accepted socket, then
/// drives the connection until its reader or writer exits (spec.md §4.11
/// steps 2–5). Always unregisters any publisher/subscriber bindings before
/// returning.
pub async fn handle_connection(mut stream: TcpStream, peer_addr: SocketAddr, registry: Arc<Registry>, config: Arc<Config>, shutdown: CancellationToken) {
    let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);

    if let Err(err) = handshake::server_handshake(&mut stream).await {
        tracing::warn!(%peer_addr, %err, "handshake failed");
        return;
    }
    tracing::info!(%peer_addr, connection_id = id, "handshake complete");

    let (mut read_half, mut write_half) = stream.into_split();
    let (tx, mut rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE_CAPACITY);
    // Child of the server-wide shutdown token: either this connection's own
    // reader/writer exiting, or a whole-server shutdown, tears it down.
    let cancel = shutdown.child_token();

    for msg in control::control_burst(config.window_ack_size, config.write_chunk_size) {
        // The queue was just created with spare capacity; this can only
        // fail if the writer has already exited, which cannot happen
        // before it is spawned below.
        let _ = tx.try_send(msg);
    }

    let handle = ConnectionHandle { id, peer_addr, tx: tx.clone() };

    let writer_cancel = cancel.clone();
    let writer_chunk_size = config.write_chunk_size;
    let writer_task = tokio::spawn(async move {
        let mut writer = ChunkWriter::new();
        let _ = writer.set_chunk_size(writer_chunk_size);
        loop {
            tokio::select! {
                _ = writer_cancel.cancelled() => break,
                maybe_msg = rx.recv() => {
                    let Some(msg) = maybe_msg else { break };
                    if msg.type_id == 1 {
                        if let Ok(size) = control::decode_u32_payload(1, &msg.payload) {
                            let _ = writer.set_chunk_size(size);
                        }
                    }
                    if let Err(err) = writer.write_message(&mut write_half, &msg).await {
                        tracing::warn!(connection_id = id, %err, "write failed, closing connection");
                        break;
                    }
                }
            }
        }
        writer_cancel.cancel();
    });

    let mut reader = ChunkReader::new();
    let mut session = Session::new(config.window_ack_size);
    let mut buf = vec![0u8; 65536];

    'reader: loop {
        tokio::select! {
            _ = cancel.cancelled() => break 'reader,
            result = read_half.read(&mut buf) => {
                match result {
                    Ok(0) => break 'reader,
                    Ok(n) => {
                        session.bytes_received += n as u64;
                        if session.window_ack_size > 0
                            && session.bytes_received - session.last_ack_sent >= session.window_ack_size as u64
                        {
                            session.last_ack_sent = session.bytes_received;
                            let _ = handle.send_message(control::acknowledgement(session.bytes_received as u32)).await;
                        }

                        reader.feed(&buf[..n]);
                        match reader.read_messages() {
                            Ok(messages) => {
                                for msg in messages {
                                    dispatch_message(msg, &handle, &mut session, &registry, &config).await;
                                }
                            }
                            Err(err) => {
                                tracing::warn!(connection_id = id, %err, "chunk framing error, closing connection");
                                break 'reader;
                            }
                        }
                    }
                    Err(err) => {
                        tracing::warn!(connection_id = id, %err, "read error, closing connection");
                        break 'reader;
                    }
                }
            }
        }
    }

    cancel.cancel();
    let _ = writer_task.await;
    cleanup(&session, &registry, id).await;
    tracing::info!(%peer_addr, connection_id = id, "connection closed");
}

async fn dispatch_message(msg: Message, handle: &ConnectionHandle, session: &mut Session, registry: &Arc<Registry>, config: &Arc<Config>) {
    match msg.type_id {
        // Abort Message (2) is handled by `ChunkReader` itself, which owns
        // the per-csid reassembly state this message discards; nothing to
        // do at the connection layer.
        2 => {}
        3 => tracing::trace!(connection_id = handle.id, "peer acknowledged bytes received"),
        4 => match UserControlEvent::decode(&msg.payload) {
            Ok(UserControlEvent::PingRequest { timestamp }) => {
                let _ = handle.send_message(control::user_control(UserControlEvent::PingResponse { timestamp })).await;
            }
            Ok(_) => {}
            Err(err) => tracing::debug!(connection_id = handle.id, %err, "malformed user control event"),
        },
        5 => tracing::trace!(connection_id = handle.id, "peer announced a window ack size"),
        6 => tracing::trace!(connection_id = handle.id, "peer announced set peer bandwidth"),
        20 => match Command::parse(&msg.payload) {
            Ok(cmd) => handle_command(cmd, msg.stream_id, handle, session, registry, config).await,
            Err(err) => tracing::debug!(connection_id = handle.id, %err, "dropping unparseable command message"),
        },
        8 | 9 | 18 => {
            // The relay's only installed message handler: route to the
            // stream this connection is publishing, if any. A generic
            // pluggable handler-registration API would be unused
            // generality here — this core has exactly one handler.
            if let Some(key) = &session.publishing_key {
                if let Some(stream) = registry.get_stream(key).await {
                    stream.broadcast_message(msg).await;
                }
            }
        }
        other => tracing::trace!(connection_id = handle.id, type_id = other, "ignoring unhandled message type"),
    }
}

async fn handle_command(cmd: Command, msg_stream_id: u32, handle: &ConnectionHandle, session: &mut Session, registry: &Arc<Registry>, config: &Arc<Config>) {
    match cmd.name.as_str() {
        "connect" => {
            if let Some(app) = cmd.command_object.get("app").and_then(|v| v.as_str()) {
                session.app = app.to_string();
            }
            if let Some(encoding) = cmd.command_object.get("objectEncoding").and_then(|v| v.as_f64()) {
                if encoding != 0.0 {
                    tracing::warn!(connection_id = handle.id, encoding, "rejecting non-AMF0 objectEncoding");
                    let _ = handle
                        .send_message(command::result(
                            cmd.transaction_id,
                            0,
                            vec![Amf0Value::object([
                                ("level", Amf0Value::string("error")),
                                ("code", Amf0Value::string("NetConnection.Connect.Rejected")),
                                ("description", Amf0Value::string("Only AMF0 (objectEncoding 0) is supported.")),
                            ])],
                        ))
                        .await;
                    return;
                }
            }
            let _ = handle.send_message(command::connect_result(cmd.transaction_id)).await;
        }
        "createStream" => {
            let stream_id = session.stream_ids.allocate();
            let _ = handle.send_message(command::create_stream_result(cmd.transaction_id, stream_id)).await;
            let _ = handle.send_message(control::user_control(UserControlEvent::StreamBegin { stream_id })).await;
        }
        "releaseStream" | "FCPublish" | "FCUnpublish" | "deleteStream" => {
            tracing::debug!(connection_id = handle.id, command = %cmd.name, "acknowledging known-but-ignored command");
            if cmd.transaction_id > 0.0 {
                let _ = handle.send_message(command::generic_result(cmd.transaction_id)).await;
            }
        }
        "publish" => {
            let name = cmd.argument(0).and_then(|v| v.as_str()).unwrap_or("");
            let key = format!("{}/{name}", session.app);
            let (stream, _created) = registry.create_stream(&key).await;
            match stream.set_publisher(handle.clone()).await {
                Ok(()) => {
                    session.publishing_key = Some(key.clone());
                    if config.record_all {
                        stream.set_recorder(Arc::new(LoggingRecorder)).await;
                    }
                    tracing::info!(connection_id = handle.id, stream = %key, "publish started");
                    let _ = handle
                        .send_message(command::on_status(msg_stream_id, StatusInfo::status("NetStream.Publish.Start", format!("{key} is now published."))))
                        .await;
                }
                Err(_) => {
                    let _ = handle
                        .send_message(command::on_status(
                            msg_stream_id,
                            StatusInfo::error("NetStream.Publish.BadName", format!("Stream {key} is already being published.")),
                        ))
                        .await;
                }
            }
        }
        "play" => {
            let name = cmd.argument(0).and_then(|v| v.as_str()).unwrap_or("");
            let key = format!("{}/{name}", session.app);
            let stream = registry.get_stream(&key).await;
            let publishing = match &stream {
                Some(s) => s.has_publisher().await,
                None => false,
            };
            if let Some(stream) = stream.filter(|_| publishing) {
                stream.add_subscriber(handle.clone()).await;
                session.subscribing_key = Some(key.clone());
                tracing::info!(connection_id = handle.id, stream = %key, "play started");

                let _ = handle.send_message(control::user_control(UserControlEvent::StreamBegin { stream_id: msg_stream_id })).await;
                let _ = handle
                    .send_message(command::on_status(msg_stream_id, StatusInfo::status("NetStream.Play.Start", format!("Started playing {key}."))))
                    .await;

                let (audio_seq, video_seq) = stream.cached_sequence_headers().await;
                if let Some(mut audio) = audio_seq {
                    audio.timestamp = 0;
                    audio.stream_id = msg_stream_id;
                    let _ = handle.send_message(audio).await;
                }
                if let Some(mut video) = video_seq {
                    video.timestamp = 0;
                    video.stream_id = msg_stream_id;
                    let _ = handle.send_message(video).await;
                }
            } else {
                let _ = handle
                    .send_message(command::on_status(
                        msg_stream_id,
                        StatusInfo::error("NetStream.Play.StreamNotFound", format!("Stream {key} not found.")).with_details(key.clone()),
                    ))
                    .await;
            }
        }
        other => tracing::debug!(connection_id = handle.id, command = other, "ignoring unknown command"),
    }
}

/// Unregisters any publisher/subscriber role this connection held
/// (spec.md §4.11 step 5). A publisher disconnect also notifies
/// subscribers with Stream EOF — spec.md §9 leaves this open since the
/// source doesn't require it, but real players rely on it to stop
/// rendering a dead stream (see DESIGN.md).
async fn cleanup(session: &Session, registry: &Arc<Registry>, id: u64) {
    if let Some(key) = &session.publishing_key {
        if let Some(stream) = registry.get_stream(key).await {
            if stream.clear_publisher(id).await {
                tracing::info!(stream = %key, subscribers = stream.subscriber_count().await, "publisher disconnected");
                stream.broadcast_message(control::user_control(UserControlEvent::StreamEof { stream_id: 0 })).await;
            }
        }
    }
    if let Some(key) = &session.subscribing_key {
        if let Some(stream) = registry.get_stream(key).await {
            stream.remove_subscriber(id).await;
        }
    }
}
