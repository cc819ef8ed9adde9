//! A minimal reference RTMP client used only by this crate's own
//! integration tests (spec.md §1 "a reference client used in tests" —
//! out of scope as a shipped artifact, but the core's own test suite needs
//! something to drive a real `TcpStream` against [`rtmprelay::server`]).

use std::time::Duration;

use rtmprelay::rtmp::amf0::{self, Amf0Value};
use rtmprelay::rtmp::chunk::{ChunkReader, ChunkWriter, Message};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub const COMMAND_CSID: u32 = 3;
pub const MEDIA_CSID: u32 = 4;

/// A connected, handshaken peer that can send commands/media and read back
/// whatever the server relays, using the crate's own chunk codec so these
/// tests exercise the real wire format rather than a shortcut.
pub struct TestClient {
    stream: TcpStream,
    reader: ChunkReader,
    writer: ChunkWriter,
    buf: Vec<u8>,
}

impl TestClient {
    pub async fn connect(addr: std::net::SocketAddr) -> Self {
        let mut stream = TcpStream::connect(addr).await.expect("connect");
        rtmprelay::rtmp::handshake::client_handshake(&mut stream).await.expect("client handshake");
        Self { stream, reader: ChunkReader::new(), writer: ChunkWriter::new(), buf: vec![0u8; 65536] }
    }

    pub async fn send_message(&mut self, msg: &Message) {
        self.writer.write_message(&mut self.stream, msg).await.expect("write message");
    }

    pub async fn send_command(&mut self, stream_id: u32, values: &[Amf0Value]) {
        let payload = amf0::encode_all(values);
        let msg = Message::new(COMMAND_CSID, 0, 20, stream_id, payload.into());
        self.send_message(&msg).await;
    }

    pub async fn send_media(&mut self, type_id: u8, timestamp: u32, stream_id: u32, payload: &[u8]) {
        let msg = Message::new(MEDIA_CSID, timestamp, type_id, stream_id, payload.to_vec().into());
        self.send_message(&msg).await;
    }

    /// Reads the next reassembled message, waiting for more bytes from the
    /// socket as needed. Panics if the peer closes before a message arrives.
    pub async fn read_message(&mut self) -> Message {
        loop {
            let mut pending = self.reader.read_messages().expect("chunk framing error");
            if !pending.is_empty() {
                return pending.remove(0);
            }
            let n = tokio::time::timeout(Duration::from_secs(5), self.stream.read(&mut self.buf))
                .await
                .expect("timed out waiting for a message")
                .expect("read error");
            assert_ne!(n, 0, "peer closed before sending an expected message");
            self.reader.feed(&self.buf[..n]);
        }
    }
}

/// Binds an ephemeral loopback port and runs [`rtmprelay::server::serve`] on
/// a background task. Call [`TestServer::shutdown`] to cancel it and wait
/// for every spawned connection to drain.
pub struct TestServer {
    pub addr: std::net::SocketAddr,
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl TestServer {
    pub async fn start() -> Self {
        Self::start_with(rtmprelay::config::Config {
            interface: "127.0.0.1".into(),
            port: 0,
            window_ack_size: 2_500_000,
            write_chunk_size: 4096,
            record_all: false,
            log_level: "info".into(),
        })
        .await
    }

    pub async fn start_with(config: rtmprelay::config::Config) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind ephemeral port");
        let addr = listener.local_addr().expect("local addr");
        let cancel = CancellationToken::new();
        let registry = std::sync::Arc::new(rtmprelay::registry::Registry::new());
        let config = std::sync::Arc::new(config);
        let task_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            rtmprelay::server::serve(listener, config, registry, task_cancel).await;
        });
        Self { addr, cancel, task }
    }

    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(5), self.task).await;
    }
}

pub fn connect_command(app: &str) -> Vec<Amf0Value> {
    vec![
        Amf0Value::string("connect"),
        Amf0Value::Number(1.0),
        Amf0Value::object([("app", Amf0Value::string(app)), ("objectEncoding", Amf0Value::Number(0.0))]),
    ]
}

pub fn create_stream_command(transaction_id: f64) -> Vec<Amf0Value> {
    vec![Amf0Value::string("createStream"), Amf0Value::Number(transaction_id), Amf0Value::Null]
}

pub fn publish_command(transaction_id: f64, name: &str) -> Vec<Amf0Value> {
    vec![
        Amf0Value::string("publish"),
        Amf0Value::Number(transaction_id),
        Amf0Value::Null,
        Amf0Value::string(name),
        Amf0Value::string("live"),
    ]
}

pub fn play_command(transaction_id: f64, name: &str) -> Vec<Amf0Value> {
    vec![
        Amf0Value::string("play"),
        Amf0Value::Number(transaction_id),
        Amf0Value::Null,
        Amf0Value::string(name),
        Amf0Value::Number(-2.0),
    ]
}
