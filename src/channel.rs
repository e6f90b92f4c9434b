//! `Channel` — one multiplexed session over a single long-lived TCP
//! connection (`spec.md` §4.1). Owns a reader task and a writer task that
//! run independently, and the two stream registries (regular calls and
//! heartbeats) that correlate inbound replies with the `Stream` waiting on
//! them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::codec::{Codec, Message, Request, RpcContext};
use crate::error::{Error, Result};
use crate::id;
use crate::stream::Stream;

const WRITER_QUEUE_CAPACITY: usize = 256;

/// State shared between a `Channel` and every `Stream` it owns. Split out
/// from `Channel` itself so a `Stream` can hold a back-reference without
/// holding the reader/writer task handles.
pub(crate) struct ChannelShared {
    regular: Mutex<HashMap<u64, Arc<Stream>>>,
    heartbeats: Mutex<HashMap<u64, Arc<Stream>>>,
    shutdown: AtomicBool,
    shutdown_cause: Mutex<Option<String>>,
    shutdown_tx: broadcast::Sender<()>,
    codec: Arc<dyn Codec>,
}

impl ChannelShared {
    fn new(codec: Arc<dyn Codec>) -> Arc<ChannelShared> {
        let (shutdown_tx, _) = broadcast::channel(1);
        Arc::new(ChannelShared {
            regular: Mutex::new(HashMap::new()),
            heartbeats: Mutex::new(HashMap::new()),
            shutdown: AtomicBool::new(false),
            shutdown_cause: Mutex::new(None),
            shutdown_tx,
            codec,
        })
    }

    #[cfg(test)]
    pub(crate) fn new_for_test() -> Arc<ChannelShared> {
        ChannelShared::new(Arc::new(crate::codec::LengthPrefixedCodec))
    }

    pub(crate) fn remove_regular(&self, local_request_id: u64) {
        self.regular.lock().remove(&local_request_id);
    }

    #[cfg(test)]
    pub(crate) fn insert_regular(&self, stream: Arc<Stream>) {
        self.regular.lock().insert(stream.local_request_id, stream);
    }

    #[cfg(test)]
    pub(crate) fn regular_contains(&self, local_request_id: u64) -> bool {
        self.regular.lock().contains_key(&local_request_id)
    }

    fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Flips the shutdown flag and fans the signal out over the broadcast
    /// channel. Idempotent: only the first caller records the cause and
    /// sends.
    fn close_on_err(&self, cause: impl Into<String>) {
        if !self.shutdown.swap(true, Ordering::SeqCst) {
            *self.shutdown_cause.lock() = Some(cause.into());
            let _ = self.shutdown_tx.send(());
        }
    }

    fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    fn dispatch(self: &Arc<Self>, message: Message) {
        let registry = if message.header.heartbeat {
            &self.heartbeats
        } else {
            &self.regular
        };
        let stream = registry.lock().get(&message.header.request_id).cloned();
        match stream {
            Some(stream) => stream.deliver(message),
            None => log::warn!(
                "missing stream for request id {} (heartbeat={})",
                message.header.request_id,
                message.header.heartbeat
            ),
        }
    }
}

/// A single multiplexed connection. Call `call` to run one request/response
/// round trip; many calls can be in flight on the same `Channel`
/// concurrently, correlated by request id.
pub struct Channel {
    shared: Arc<ChannelShared>,
    writer_tx: mpsc::Sender<Message>,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
}

impl Channel {
    /// Opens a fresh TCP connection and spawns its reader/writer tasks.
    pub async fn connect(addr: &str, codec: Arc<dyn Codec>, connect_timeout: Duration) -> Result<Channel> {
        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::PoolInitFailure(format!("connecting to {addr} timed out")))?
            .map_err(Error::Transport)?;
        Ok(Channel::from_stream(stream, codec))
    }

    fn from_stream(stream: TcpStream, codec: Arc<dyn Codec>) -> Channel {
        let shared = ChannelShared::new(codec);
        let (read_half, write_half) = stream.into_split();
        let (writer_tx, writer_rx) = mpsc::channel(WRITER_QUEUE_CAPACITY);

        let reader_task = tokio::spawn(Channel::reader_loop(shared.clone(), read_half));
        let writer_task = tokio::spawn(Channel::writer_loop(shared.clone(), write_half, writer_rx));

        Channel {
            shared,
            writer_tx,
            reader_task,
            writer_task,
        }
    }

    async fn reader_loop(shared: Arc<ChannelShared>, mut reader: impl AsyncRead + Unpin + Send + 'static) {
        loop {
            match shared.codec.decode(&mut reader).await {
                Ok(message) => shared.dispatch(message),
                Err(e) => {
                    shared.close_on_err(e.to_string());
                    break;
                }
            }
        }
    }

    async fn writer_loop(
        shared: Arc<ChannelShared>,
        mut writer: impl AsyncWrite + Unpin + Send + 'static,
        mut rx: mpsc::Receiver<Message>,
    ) {
        while let Some(message) = rx.recv().await {
            if let Err(e) = shared.codec.write(&mut writer, &message).await {
                shared.close_on_err(e.to_string());
                break;
            }
        }
    }

    fn new_stream(
        &self,
        heartbeat: bool,
        local_request_id: u64,
        origin_request_id: u64,
        ctx: RpcContext,
    ) -> Result<Arc<Stream>> {
        if self.shared.is_shut_down() {
            return Err(Error::ChannelShutdown);
        }
        let stream = Arc::new(Stream::new(self.shared.clone(), local_request_id, origin_request_id, ctx));
        let registry = if heartbeat {
            &self.shared.heartbeats
        } else {
            &self.shared.regular
        };
        registry.lock().insert(local_request_id, stream.clone());
        Ok(stream)
    }

    /// Enqueues `message` onto the writer task's outbound queue, racing the
    /// deadline and channel shutdown (`spec.md` §4.1 `Send`). `shutdown_rx`
    /// is subscribed once by the caller before this runs so that a shutdown
    /// firing between `send` returning and the subsequent `recv` can't slip
    /// through an unsubscribed gap.
    async fn send(&self, message: Message, deadline: Instant, shutdown_rx: &mut broadcast::Receiver<()>) -> Result<()> {
        tokio::select! {
            res = self.writer_tx.send(message) => res.map_err(|_| Error::ChannelShutdown),
            _ = tokio::time::sleep_until(deadline) => Err(Error::SendTimeout),
            _ = shutdown_rx.recv() => Err(Error::ChannelShutdown),
        }
    }

    /// Runs one request/response round trip: `NewStream` → `Send` →
    /// (`Recv` unless the call is asynchronous). Returns `Ok(None)` for an
    /// asynchronous call, since its reply is delivered to `ctx`'s done sink
    /// by the reader task instead of being returned here.
    pub async fn call(&self, request: &Request, ctx: RpcContext, deadline: Instant) -> Result<Option<Message>> {
        if request.method.is_empty() {
            return Err(Error::InvalidMessage);
        }
        let is_async = ctx.async_call;
        let origin_request_id = request.request_id;
        let local_request_id = if origin_request_id != 0 {
            origin_request_id
        } else {
            id::next_request_id()
        };

        let message = self.shared.codec.encode(request, &ctx, local_request_id)?;
        let stream = self.new_stream(message.header.heartbeat, local_request_id, origin_request_id, ctx)?;

        let mut shutdown_rx = self.shared.subscribe_shutdown();
        self.send(message, deadline, &mut shutdown_rx).await?;

        if is_async {
            return Ok(None);
        }

        let message = stream.recv(deadline, &mut shutdown_rx).await?;
        Ok(Some(message))
    }

    /// Sends a heartbeat probe and waits for its reply. Heartbeat streams
    /// are registered in the heartbeat map, not the regular-call map, and —
    /// per `spec.md` §9 — are never removed from it by `recv`'s close; the
    /// map grows by one entry per keepalive tick for the life of the
    /// channel. Mirrored here rather than silently fixed.
    pub(crate) async fn heartbeat(&self, local_request_id: u64, ctx: RpcContext, deadline: Instant) -> Result<Message> {
        let header = crate::codec::MessageHeader {
            request_id: local_request_id,
            heartbeat: true,
            serialize_type: 0,
            proxy: false,
            is_error: false,
        };
        let message = Message::new(header, Vec::new());
        let stream = self.new_stream(true, local_request_id, local_request_id, ctx)?;

        let mut shutdown_rx = self.shared.subscribe_shutdown();
        self.send(message, deadline, &mut shutdown_rx).await?;
        stream.recv(deadline, &mut shutdown_rx).await
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.is_shut_down()
    }

    pub fn shutdown_cause(&self) -> Option<String> {
        self.shared.shutdown_cause.lock().clone()
    }

    /// Idempotent shutdown: marks the channel dead, fans the signal out to
    /// every blocked `Send`/`recv`, and aborts the reader/writer tasks so a
    /// socket stuck mid-read doesn't keep them alive.
    pub fn close(&self, cause: impl Into<String>) {
        self.shared.close_on_err(cause);
        self.reader_task.abort();
        self.writer_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::SerializerRegistry;
    use std::sync::Arc as StdArc;
    use tokio::io::{duplex, split};

    fn registry() -> StdArc<SerializerRegistry> {
        StdArc::new(SerializerRegistry::with_defaults())
    }

    fn spawn_channel_over_duplex(codec: Arc<dyn Codec>) -> (Channel, tokio::io::DuplexStream) {
        let (client_io, server_io) = duplex(4096);
        let (read_half, write_half) = split(client_io);
        let shared = ChannelShared::new(codec);
        let reader_task = tokio::spawn(Channel::reader_loop(shared.clone(), read_half));
        let writer_tx_cap = WRITER_QUEUE_CAPACITY;
        let (writer_tx, writer_rx) = mpsc::channel(writer_tx_cap);
        let writer_task = tokio::spawn(Channel::writer_loop(shared.clone(), write_half, writer_rx));
        (
            Channel {
                shared,
                writer_tx,
                reader_task,
                writer_task,
            },
            server_io,
        )
    }

    #[tokio::test]
    async fn call_round_trips_through_an_echoing_peer() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let codec: Arc<dyn Codec> = Arc::new(crate::codec::LengthPrefixedCodec);
        let (channel, mut server_io) = spawn_channel_over_duplex(codec.clone());

        let echo = tokio::spawn(async move {
            let mut len_buf = [0u8; 4];
            server_io.read_exact(&mut len_buf).await.unwrap();
            let len = u32::from_be_bytes(len_buf) as usize;
            let mut rest = vec![0u8; len];
            server_io.read_exact(&mut rest).await.unwrap();

            let mut frame = Vec::new();
            frame.extend_from_slice(&len_buf);
            frame.extend_from_slice(&rest);
            server_io.write_all(&frame).await.unwrap();
        });

        let request = Request {
            request_id: 0,
            service: "demoService".to_string(),
            method: "ping".to_string(),
            arguments: Vec::new(),
            attachments: HashMap::new(),
            async_call: false,
        };
        let ctx = RpcContext::sync(registry(), false, 0);
        let deadline = Instant::now() + std::time::Duration::from_millis(500);
        let reply = channel.call(&request, ctx, deadline).await.unwrap();
        assert!(reply.is_some());
        echo.await.unwrap();
    }

    #[tokio::test]
    async fn call_with_empty_method_is_rejected() {
        let codec: Arc<dyn Codec> = Arc::new(crate::codec::LengthPrefixedCodec);
        let (channel, _server_io) = spawn_channel_over_duplex(codec);
        let request = Request::default();
        let ctx = RpcContext::sync(registry(), false, 0);
        let deadline = Instant::now() + std::time::Duration::from_millis(50);
        let err = channel.call(&request, ctx, deadline).await.unwrap_err();
        assert!(matches!(err, Error::InvalidMessage));
    }

    #[tokio::test]
    async fn call_after_close_fails_with_channel_shutdown() {
        let codec: Arc<dyn Codec> = Arc::new(crate::codec::LengthPrefixedCodec);
        let (channel, _server_io) = spawn_channel_over_duplex(codec);
        channel.close("test teardown");

        let request = Request {
            request_id: 0,
            service: "demoService".to_string(),
            method: "ping".to_string(),
            arguments: Vec::new(),
            attachments: HashMap::new(),
            async_call: false,
        };
        let ctx = RpcContext::sync(registry(), false, 0);
        let deadline = Instant::now() + std::time::Duration::from_millis(50);
        let err = channel.call(&request, ctx, deadline).await.unwrap_err();
        assert!(matches!(err, Error::ChannelShutdown));
    }
}
