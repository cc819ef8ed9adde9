//! The stream registry and relay/broadcast logic (spec.md §4.10).
//!
//! `Registry` maps a stream key (`"<app>/<streamName>"`) to a `Stream`.
//! Each `Stream` owns at most one publisher and any number of subscribers,
//! plus the cached audio/video sequence headers late joiners need. Streams
//! never reach back into the registry; the registry is the only owner of
//! the `Arc<Stream>`s it hands out.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::RwLock;

use crate::connection::ConnectionHandle;
use crate::recorder::Recorder;
use crate::rtmp::chunk::Message;
use crate::rtmp::codec;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("stream already has a publisher")]
    PublisherExists,
}

struct StreamInner {
    publisher: Option<ConnectionHandle>,
    subscribers: Vec<ConnectionHandle>,
    audio_codec: Option<&'static str>,
    video_codec: Option<&'static str>,
    audio_sequence_header: Option<Message>,
    video_sequence_header: Option<Message>,
    recorder: Option<Arc<dyn Recorder>>,
}

impl StreamInner {
    fn new() -> Self {
        Self {
            publisher: None,
            subscribers: Vec::new(),
            audio_codec: None,
            video_codec: None,
            audio_sequence_header: None,
            video_sequence_header: None,
            recorder: None,
        }
    }
}

/// A single published stream: one publisher, N subscribers, cached codec
/// sequence headers for late joiners (spec.md §3 `Stream`).
pub struct Stream {
    key: String,
    inner: RwLock<StreamInner>,
}

impl Stream {
    fn new(key: String) -> Self {
        Self { key, inner: RwLock::new(StreamInner::new()) }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Binds `handle` as this stream's sole publisher. Fails if one is
    /// already bound (spec.md §4.10 `SetPublisher`).
    pub async fn set_publisher(&self, handle: ConnectionHandle) -> Result<(), StreamError> {
        let mut inner = self.inner.write().await;
        if inner.publisher.is_some() {
            return Err(StreamError::PublisherExists);
        }
        inner.publisher = Some(handle);
        Ok(())
    }

    pub async fn has_publisher(&self) -> bool {
        self.inner.read().await.publisher.is_some()
    }

    /// Clears the publisher binding if it is still `handle_id` (a
    /// connection that was never the publisher, or already replaced,
    /// leaves the binding untouched).
    pub async fn clear_publisher(&self, handle_id: u64) -> bool {
        let mut inner = self.inner.write().await;
        if inner.publisher.as_ref().map(|p| p.id) == Some(handle_id) {
            inner.publisher = None;
            true
        } else {
            false
        }
    }

    pub async fn add_subscriber(&self, handle: ConnectionHandle) {
        self.inner.write().await.subscribers.push(handle);
    }

    pub async fn remove_subscriber(&self, handle_id: u64) {
        self.inner.write().await.subscribers.retain(|s| s.id != handle_id);
    }

    pub async fn subscriber_count(&self) -> usize {
        self.inner.read().await.subscribers.len()
    }

    pub async fn set_recorder(&self, recorder: Arc<dyn Recorder>) {
        self.inner.write().await.recorder = Some(recorder);
    }

    pub async fn audio_codec(&self) -> Option<&'static str> {
        self.inner.read().await.audio_codec
    }

    pub async fn video_codec(&self) -> Option<&'static str> {
        self.inner.read().await.video_codec
    }

    /// Returns clones of the cached sequence headers, if any, for a
    /// late-joining subscriber (spec.md §8 "late-joiner sequence headers").
    pub async fn cached_sequence_headers(&self) -> (Option<Message>, Option<Message>) {
        let inner = self.inner.read().await;
        (inner.audio_sequence_header.clone(), inner.video_sequence_header.clone())
    }

    /// Routes one audio/video/data message from the publisher to every
    /// subscriber (spec.md §4.10 `BroadcastMessage`).
    pub async fn broadcast_message(&self, msg: Message) {
        let recorder = {
            let mut inner = self.inner.write().await;
            match msg.type_id {
                8 => {
                    if inner.audio_codec.is_none() {
                        inner.audio_codec = codec::detect_audio_codec(&msg.payload).map(|c| c.name());
                    }
                    if codec::is_aac_sequence_header(&msg.payload) {
                        inner.audio_sequence_header = Some(msg.clone());
                    }
                }
                9 => {
                    if inner.video_codec.is_none() {
                        inner.video_codec = codec::detect_video_codec(&msg.payload).map(|c| c.name());
                    }
                    if codec::is_avc_sequence_header(&msg.payload) {
                        inner.video_sequence_header = Some(msg.clone());
                    }
                }
                _ => {}
            }
            inner.recorder.clone()
        };

        if let Some(recorder) = recorder {
            if let Err(err) = recorder.write_message(&msg) {
                tracing::warn!(stream = %self.key, %err, "recorder failed, detaching it");
                self.inner.write().await.recorder = None;
            }
        }

        let subscribers = self.inner.read().await.subscribers.clone();
        for subscriber in &subscribers {
            // Each subscriber gets its own `Bytes` handle: a refcount bump
            // over the same immutable backing storage, not a `memcpy`, but
            // payloads are never mutated post-receipt so no subscriber can
            // observe another's clone changing under it (spec.md §8 "no
            // aliasing"). See DESIGN.md.
            if !subscriber.try_send_message(msg.clone()) {
                tracing::debug!(stream = %self.key, subscriber = subscriber.id, "outbound queue full, dropping message");
            }
        }
    }
}

/// Process-wide map from stream key to `Stream` (spec.md §3 `Registry`).
#[derive(Default)]
pub struct Registry {
    streams: RwLock<HashMap<String, Arc<Stream>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self { streams: RwLock::new(HashMap::new()) }
    }

    /// Idempotent: returns the existing stream if `key` is already
    /// registered, otherwise creates and registers a new one.
    pub async fn create_stream(&self, key: &str) -> (Arc<Stream>, bool) {
        if let Some(existing) = self.streams.read().await.get(key) {
            return (existing.clone(), false);
        }
        let mut streams = self.streams.write().await;
        if let Some(existing) = streams.get(key) {
            return (existing.clone(), false);
        }
        let stream = Arc::new(Stream::new(key.to_string()));
        streams.insert(key.to_string(), stream.clone());
        (stream, true)
    }

    pub async fn get_stream(&self, key: &str) -> Option<Arc<Stream>> {
        self.streams.read().await.get(key).cloned()
    }

    pub async fn delete_stream(&self, key: &str) -> bool {
        self.streams.write().await.remove(key).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::test_support::test_handle;
    use bytes::Bytes;

    fn video_msg(payload: &[u8]) -> Message {
        Message::new(6, 40, 9, 1, Bytes::copy_from_slice(payload))
    }

    #[tokio::test]
    async fn create_stream_is_idempotent() {
        let registry = Registry::new();
        let (a, created_a) = registry.create_stream("live/t").await;
        let (b, created_b) = registry.create_stream("live/t").await;
        assert!(created_a);
        assert!(!created_b);
        assert_eq!(Arc::as_ptr(&a), Arc::as_ptr(&b));
    }

    #[tokio::test]
    async fn second_publisher_is_rejected() {
        let stream = Stream::new("live/t".into());
        let (h1, _rx1) = test_handle(1);
        let (h2, _rx2) = test_handle(2);
        stream.set_publisher(h1).await.unwrap();
        assert!(matches!(stream.set_publisher(h2).await, Err(StreamError::PublisherExists)));
    }

    #[tokio::test]
    async fn broadcast_fans_out_to_every_subscriber_independently() {
        let stream = Stream::new("live/t".into());
        let (h1, mut rx1) = test_handle(1);
        let (h2, mut rx2) = test_handle(2);
        stream.add_subscriber(h1).await;
        stream.add_subscriber(h2).await;

        for i in 0..3u32 {
            stream.broadcast_message(video_msg(&[0x27, 0x01, 0, 0, 0, i as u8])).await;
        }

        for rx in [&mut rx1, &mut rx2] {
            for i in 0..3u32 {
                let got = rx.try_recv().unwrap();
                assert_eq!(got.payload[5], i as u8);
            }
        }
    }

    #[tokio::test]
    async fn video_sequence_header_is_cached_once_and_overwritable() {
        let stream = Stream::new("live/t".into());
        stream.broadcast_message(video_msg(&[0x17, 0x00, 0, 0, 0, 1, 2, 3])).await;
        let (_, video) = stream.cached_sequence_headers().await;
        assert_eq!(video.unwrap().payload[5], 1);

        stream.broadcast_message(video_msg(&[0x17, 0x00, 0, 0, 0, 9])).await;
        let (_, video) = stream.cached_sequence_headers().await;
        assert_eq!(video.unwrap().payload[5], 9);
    }

    #[tokio::test]
    async fn slow_subscriber_only_drops_its_own_messages() {
        let stream = Stream::new("live/t".into());
        let (slow, _slow_rx_never_drained) = test_handle(1);
        let (fast, mut fast_rx) = test_handle(2);
        stream.add_subscriber(slow).await;
        stream.add_subscriber(fast).await;

        // Exceed the slow subscriber's bounded queue (capacity set by
        // test_handle) without draining it.
        for i in 0..200u32 {
            stream.broadcast_message(video_msg(&[0x27, 0x01, 0, 0, 0, (i % 256) as u8])).await;
        }

        let mut received = 0;
        while fast_rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, 200, "fast subscriber sees every message despite the slow one stalling");
    }
}
