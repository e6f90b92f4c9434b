//! `Stream` — one in-flight RPC bound to a specific `Channel`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::channel::ChannelShared;
use crate::codec::{Message, RpcContext};
use crate::error::{Error, Result};

/// Per-in-flight-call state: the reply slot, the single-slot notification
/// signal, the deadline, and the two request ids described in `spec.md` §3.
///
/// `local_request_id` is what's written on the wire; `origin_request_id` is
/// what the caller sees. They're equal when the caller supplied a nonzero
/// id; otherwise `local_request_id` is freshly generated (see `id.rs`).
pub struct Stream {
    channel: Arc<ChannelShared>,
    pub local_request_id: u64,
    pub origin_request_id: u64,
    reply: Mutex<Option<Message>>,
    notify: Notify,
    ctx: Mutex<RpcContext>,
    closed: AtomicBool,
}

impl Stream {
    pub(crate) fn new(
        channel: Arc<ChannelShared>,
        local_request_id: u64,
        origin_request_id: u64,
        ctx: RpcContext,
    ) -> Stream {
        Stream {
            channel,
            local_request_id,
            origin_request_id,
            reply: Mutex::new(None),
            notify: Notify::new(),
            ctx: Mutex::new(ctx),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_async(&self) -> bool {
        self.ctx.lock().async_call
    }

    /// Dispatches a decoded reply according to the RPC context's async-call
    /// flag (`spec.md` §4.1 `notify`). For a synchronous call this stores
    /// the message and pulses the waiter; for an asynchronous call it
    /// decodes the reply inline and completes the caller's done sink, then
    /// closes itself since nothing else will (a synchronous call's own
    /// `recv` is what normally triggers the close).
    pub(crate) fn deliver(self: &Arc<Self>, message: Message) {
        if self.is_async() {
            self.deliver_async(message);
            self.close();
        } else {
            self.deliver_sync(message);
        }
    }

    fn deliver_sync(&self, mut message: Message) {
        message.header.request_id = self.origin_request_id;
        *self.reply.lock() = Some(message);
        self.notify.notify_one();
    }

    fn deliver_async(&self, mut message: Message) {
        use crate::codec::Exception;

        let mut ctx = self.ctx.lock();
        message.header.proxy = ctx.proxy;
        let serialize_type = message.header.serialize_type;
        let raw_body = std::mem::take(&mut message.body);

        let mut response = message.into_response();
        response.request_id = self.origin_request_id;

        match ctx.extension_factory.get(serialize_type) {
            Some(serializer) => {
                if let Err(e) = response.deserialize_reply(&*serializer, &raw_body) {
                    response.exception = Some(Exception::server_exception(e.to_string()));
                }
            }
            None => {
                response.exception = Some(Exception::server_exception(format!(
                    "no serializer registered for id {serialize_type}"
                )));
            }
        }
        response.processing_time_ms = ctx.async_start.elapsed().as_millis() as u64;
        ctx.complete(response);
    }

    /// Waits for a reply, the deadline, or channel shutdown — whichever
    /// fires first — and always closes the stream on the way out.
    pub(crate) async fn recv(
        self: &Arc<Self>,
        deadline: Instant,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> Result<Message> {
        let result = tokio::select! {
            _ = self.notify.notified() => {
                match self.reply.lock().take() {
                    Some(message) => Ok(message),
                    None => Err(Error::RecvTimeout),
                }
            }
            _ = tokio::time::sleep_until(deadline) => Err(Error::RecvTimeout),
            _ = shutdown_rx.recv() => Err(Error::ChannelShutdown),
        };
        self.close();
        result
    }

    /// Deregisters the stream from its channel's regular-stream registry.
    /// Idempotent. Per `spec.md` §3/§9, this deliberately only ever touches
    /// the regular registry: a heartbeat stream is never removed here, and
    /// persists in the heartbeat map until the channel itself is torn down.
    pub(crate) fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.channel.remove_regular(self.local_request_id);
        }
    }
}
