//! Push-channel subscription management.
//!
//! The server announces message lifecycle changes over a long-lived GET to
//! `/messages/stream`, framed as server-sent events. [`EventStream`] owns
//! the connect/disconnect lifecycle and guarantees at most one live
//! subscription per session; reconnection policy belongs to the engine.

use crate::auth::Credentials;
use crate::error::ClientError;
use crate::types::MessageEvent;
use async_trait::async_trait;
use futures_util::StreamExt;
use log::{debug, warn};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify, mpsc};

/// An event produced by the stream transport layer.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// One complete frame has been received from the server.
    Frame(String),
    /// The connection was lost or closed.
    Disconnected,
}

/// Represents an active push-channel connection.
/// The transport is a dumb pipe for frames with no knowledge of their JSON
/// payload.
#[async_trait]
pub trait StreamTransport: Send + Sync {
    /// Closes the connection.
    async fn close(&self);
}

/// A factory responsible for opening new push-channel connections.
#[async_trait]
pub trait StreamTransportFactory: Send + Sync {
    /// Opens a connection and returns it, along with its stream of events.
    /// Returning `Ok` means the server accepted the subscription.
    async fn connect(
        &self,
        credentials: &Credentials,
    ) -> Result<(Arc<dyn StreamTransport>, mpsc::Receiver<StreamEvent>), ClientError>;
}

/// What the stream hands to its single listener after frame parsing.
#[derive(Debug, Clone)]
pub enum InboundItem {
    Event(MessageEvent),
    /// The underlying connection is gone; no more events will follow.
    Closed,
}

const FRAME_CHANNEL_CAPACITY: usize = 64;

/// Accumulates SSE bytes into complete frames. A frame is the `data:` lines
/// seen since the last blank-line boundary; comments and non-data fields
/// are ignored. Chunk boundaries carry no meaning, so a partial line is
/// buffered until its newline arrives.
#[derive(Default)]
struct SseFrameAssembler {
    line: Vec<u8>,
    data: Vec<String>,
}

impl SseFrameAssembler {
    fn push_chunk(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut frames = Vec::new();
        for &byte in chunk {
            if byte == b'\n' {
                let line = std::mem::take(&mut self.line);
                if let Some(frame) = self.push_line(&String::from_utf8_lossy(&line)) {
                    frames.push(frame);
                }
            } else {
                self.line.push(byte);
            }
        }
        frames
    }

    fn push_line(&mut self, line: &str) -> Option<String> {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() {
            if self.data.is_empty() {
                return None;
            }
            return Some(self.data.drain(..).collect::<Vec<_>>().join("\n"));
        }
        if let Some(rest) = line.strip_prefix("data:") {
            self.data
                .push(rest.strip_prefix(' ').unwrap_or(rest).to_string());
        }
        None
    }
}

struct SseTransport {
    shutdown: Arc<Notify>,
}

#[async_trait]
impl StreamTransport for SseTransport {
    async fn close(&self) {
        // Wakes the reader task, which drops the response body and with it
        // the connection. `notify_one` stores a permit, so a close that
        // races the task's select is never lost.
        self.shutdown.notify_one();
    }
}

/// Opens the real `/messages/stream` connection. The body is consumed as an
/// async byte stream so `close` can tear the connection down immediately by
/// waking the reader task, which drops the response.
pub struct SseTransportFactory {
    client: reqwest::Client,
    base_url: String,
}

impl SseTransportFactory {
    pub fn new(base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self {
            // No timeout on this client: the subscription is long-lived and
            // quiet periods are normal.
            client: reqwest::Client::new(),
            base_url,
        }
    }
}

#[async_trait]
impl StreamTransportFactory for SseTransportFactory {
    async fn connect(
        &self,
        credentials: &Credentials,
    ) -> Result<(Arc<dyn StreamTransport>, mpsc::Receiver<StreamEvent>), ClientError> {
        let url = format!(
            "{}/messages/stream?token={}",
            self.base_url,
            urlencoding::encode(&credentials.token)
        );
        let response = self
            .client
            .get(&url)
            .header("user", &credentials.user)
            .send()
            .await
            .map_err(|e| ClientError::Transport(e.into()))?;

        match response.status().as_u16() {
            code if (200..300).contains(&code) => {}
            401 | 403 => return Err(ClientError::Unauthorized),
            code => return Err(ClientError::Api { status: code }),
        }

        let (tx, rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        let shutdown = Arc::new(Notify::new());
        let shutdown_handle = shutdown.clone();

        tokio::spawn(async move {
            let mut body = response.bytes_stream();
            let mut assembler = SseFrameAssembler::default();
            let notified = shutdown_handle.notified();
            tokio::pin!(notified);
            loop {
                tokio::select! {
                    _ = &mut notified => {
                        debug!(target: "Carbon/Stream", "close requested, dropping connection");
                        break;
                    }
                    chunk = body.next() => match chunk {
                        Some(Ok(bytes)) => {
                            for frame in assembler.push_chunk(&bytes) {
                                if tx.send(StreamEvent::Frame(frame)).await.is_err() {
                                    // Receiver gone; dropping the body closes
                                    // the connection.
                                    return;
                                }
                            }
                        }
                        Some(Err(e)) => {
                            debug!(target: "Carbon/Stream", "read failed, connection lost: {e}");
                            break;
                        }
                        None => break,
                    },
                }
            }
            let _ = tx.send(StreamEvent::Disconnected).await;
        });

        Ok((Arc::new(SseTransport { shutdown }), rx))
    }
}

/// At most one live push-channel subscription per authenticated session.
///
/// `subscribe` and `unsubscribe` are both idempotent. Parsed events are
/// delivered to the single receiver returned by `subscribe`; malformed
/// frames and unknown discriminants are logged and dropped, never fatal.
pub struct EventStream {
    factory: Arc<dyn StreamTransportFactory>,
    transport: Arc<Mutex<Option<Arc<dyn StreamTransport>>>>,
}

impl EventStream {
    pub fn new(factory: Arc<dyn StreamTransportFactory>) -> Self {
        Self {
            factory,
            transport: Arc::new(Mutex::new(None)),
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.transport.lock().await.is_some()
    }

    /// Opens the subscription. Returns `Ok(None)` when one is already live
    /// (idempotent no-op). On success the caller receives the single event
    /// stream; events are delivered at arrival rate, with no buffering
    /// guarantee beyond the channel capacity if the listener is slow.
    pub async fn subscribe(
        &self,
        credentials: &Credentials,
    ) -> Result<Option<mpsc::Receiver<InboundItem>>, ClientError> {
        let mut slot = self.transport.lock().await;
        if slot.is_some() {
            debug!(target: "Carbon/Stream", "subscribe: already connected, ignoring");
            return Ok(None);
        }

        let (transport, mut raw_rx) = self.factory.connect(credentials).await?;
        *slot = Some(transport.clone());
        drop(slot);

        let (tx, rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        let slot_handle = self.transport.clone();
        tokio::spawn(async move {
            loop {
                match raw_rx.recv().await {
                    Some(StreamEvent::Frame(frame)) => match MessageEvent::from_frame(&frame) {
                        Ok(event) => {
                            if tx.send(InboundItem::Event(event)).await.is_err() {
                                // Listener is gone; tear the connection down.
                                transport.close().await;
                                break;
                            }
                        }
                        Err(ClientError::UnknownEventType(kind)) => {
                            warn!(target: "Carbon/Stream", "dropping event with unknown type '{kind}'");
                        }
                        Err(e) => {
                            warn!(target: "Carbon/Stream", "dropping malformed frame: {e}");
                        }
                    },
                    Some(StreamEvent::Disconnected) | None => {
                        // The connection is already gone; close releases the
                        // reader promptly and is idempotent.
                        transport.close().await;
                        let _ = tx.send(InboundItem::Closed).await;
                        break;
                    }
                }
            }
            // Only clear the slot if it still holds this connection; a
            // newer subscribe may have replaced it already.
            let mut slot = slot_handle.lock().await;
            if let Some(current) = slot.as_ref()
                && Arc::ptr_eq(current, &transport)
            {
                *slot = None;
            }
        });

        Ok(Some(rx))
    }

    /// Closes the subscription if one is live; no-op otherwise. Must be
    /// called whenever the session becomes unauthenticated.
    pub async fn unsubscribe(&self) {
        let transport = self.transport.lock().await.take();
        match transport {
            Some(transport) => transport.close().await,
            None => debug!(target: "Carbon/Stream", "unsubscribe: not connected, ignoring"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assembler_joins_data_lines_until_blank() {
        let mut asm = SseFrameAssembler::default();
        assert_eq!(asm.push_line(": keepalive comment"), None);
        assert_eq!(asm.push_line("event: message"), None);
        assert_eq!(asm.push_line("data: {\"a\":"), None);
        assert_eq!(asm.push_line("data: 1}"), None);
        assert_eq!(asm.push_line(""), Some("{\"a\":\n1}".to_string()));
        // blank line with nothing buffered is not a frame
        assert_eq!(asm.push_line(""), None);
    }

    #[test]
    fn assembler_strips_carriage_returns() {
        let mut asm = SseFrameAssembler::default();
        assert_eq!(asm.push_line("data: x\r"), None);
        assert_eq!(asm.push_line("\r"), Some("x".to_string()));
    }

    #[test]
    fn assembler_handles_lines_split_across_chunks() {
        let mut asm = SseFrameAssembler::default();
        assert_eq!(asm.push_chunk(b"data: {\"a\""), Vec::<String>::new());
        assert_eq!(asm.push_chunk(b":1}\n\ndata: two"), vec!["{\"a\":1}".to_string()]);
        assert_eq!(asm.push_chunk(b"\n\n"), vec!["two".to_string()]);
    }

    struct NoopTransport;

    #[async_trait]
    impl StreamTransport for NoopTransport {
        async fn close(&self) {}
    }

    struct ScriptedFactory {
        frames: Vec<String>,
    }

    #[async_trait]
    impl StreamTransportFactory for ScriptedFactory {
        async fn connect(
            &self,
            _credentials: &Credentials,
        ) -> Result<(Arc<dyn StreamTransport>, mpsc::Receiver<StreamEvent>), ClientError>
        {
            let (tx, rx) = mpsc::channel(16);
            for frame in &self.frames {
                tx.send(StreamEvent::Frame(frame.clone())).await.unwrap();
            }
            tx.send(StreamEvent::Disconnected).await.unwrap();
            Ok((Arc::new(NoopTransport), rx))
        }
    }

    fn creds() -> Credentials {
        Credentials {
            token: "t".into(),
            user: "u".into(),
        }
    }

    #[tokio::test]
    async fn bad_frames_are_dropped_and_stream_continues() {
        let stream = EventStream::new(Arc::new(ScriptedFactory {
            frames: vec![
                "{broken".to_string(),
                r#"{"type":"archived","message":{"id":"x","content":"","edited":false,"ctx":"c","created":1}}"#.to_string(),
                r#"{"type":"created","message":{"id":"m1","content":"hi","edited":false,"ctx":"c1","created":1}}"#.to_string(),
            ],
        }));

        let mut rx = stream.subscribe(&creds()).await.unwrap().unwrap();
        match rx.recv().await.unwrap() {
            InboundItem::Event(MessageEvent::Created(m)) => assert_eq!(m.id, "m1"),
            other => panic!("expected the surviving created event, got {other:?}"),
        }
        assert!(matches!(rx.recv().await.unwrap(), InboundItem::Closed));
    }

    #[tokio::test]
    async fn subscribe_is_idempotent_while_connected() {
        // A factory whose channel stays open keeps the subscription live.
        struct OpenFactory;

        #[async_trait]
        impl StreamTransportFactory for OpenFactory {
            async fn connect(
                &self,
                _credentials: &Credentials,
            ) -> Result<(Arc<dyn StreamTransport>, mpsc::Receiver<StreamEvent>), ClientError>
            {
                let (tx, rx) = mpsc::channel(1);
                // Leak the sender so the stream stays open for the test.
                std::mem::forget(tx);
                Ok((Arc::new(NoopTransport), rx))
            }
        }

        let stream = EventStream::new(Arc::new(OpenFactory));
        let first = stream.subscribe(&creds()).await.unwrap();
        assert!(first.is_some());
        let second = stream.subscribe(&creds()).await.unwrap();
        assert!(second.is_none());
        assert!(stream.is_connected().await);

        stream.unsubscribe().await;
        assert!(!stream.is_connected().await);
        stream.unsubscribe().await; // idempotent
    }
}
