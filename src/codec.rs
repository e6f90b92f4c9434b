//! The narrow external collaborators `spec.md` §1 calls out: the wire
//! message codec, the Request/Response/Exception data types and their RPC
//! context, and the named-serializer plug-in. The core only reads/writes the
//! specific header fields documented in `spec.md` §6 — it does not define the
//! wire format beyond that.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;

use crate::error::{Error, Result};

/// Header fields the core itself reads or writes. Everything else about the
/// wire format belongs to the external codec.
#[derive(Clone, Debug, Default)]
pub struct MessageHeader {
    pub request_id: u64,
    pub heartbeat: bool,
    pub serialize_type: u8,
    pub proxy: bool,
    pub is_error: bool,
}

#[derive(Clone, Debug, Default)]
pub struct Message {
    pub header: MessageHeader,
    pub body: Vec<u8>,
}

impl Message {
    pub fn new(header: MessageHeader, body: Vec<u8>) -> Message {
        Message { header, body }
    }

    /// Converts a received wire `Message` into a `Response` shell: the
    /// reply body still needs `Response::deserialize_reply` run against it
    /// using the serializer named by `header.serialize_type`.
    pub fn into_response(self) -> Response {
        let exception = if self.header.is_error {
            Some(Exception {
                code: 500,
                message: "remote returned an error response".to_string(),
                exception_type: "ServiceException".to_string(),
            })
        } else {
            None
        };
        Response {
            request_id: self.header.request_id,
            value: None,
            exception,
            processing_time_ms: 0,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct Request {
    pub request_id: u64,
    pub service: String,
    pub method: String,
    pub arguments: Vec<u8>,
    pub attachments: HashMap<String, String>,
    pub async_call: bool,
}

#[derive(Clone, Debug)]
pub struct Exception {
    pub code: i32,
    pub message: String,
    pub exception_type: String,
}

impl Exception {
    pub fn transport_failure(message: impl Into<String>) -> Exception {
        Exception {
            code: 400,
            message: message.into(),
            exception_type: "ServiceException".to_string(),
        }
    }

    pub fn server_exception(message: impl Into<String>) -> Exception {
        Exception {
            code: 500,
            message: message.into(),
            exception_type: "ServiceException".to_string(),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct Response {
    pub request_id: u64,
    pub value: Option<Vec<u8>>,
    pub exception: Option<Exception>,
    pub processing_time_ms: u64,
}

impl Response {
    pub fn error(request_id: u64, exception: Exception) -> Response {
        Response {
            request_id,
            value: None,
            exception: Some(exception),
            processing_time_ms: 0,
        }
    }

    /// Runs the named serializer's reply-decoding step against `raw_body`,
    /// filling in `value`. No-op (leaves `value` untouched) if the response
    /// already carries an exception.
    pub fn deserialize_reply(&mut self, serializer: &dyn Serializer, raw_body: &[u8]) -> Result<()> {
        if self.exception.is_some() {
            return Ok(());
        }
        self.value = Some(serializer.deserialize_reply(raw_body)?);
        Ok(())
    }
}

/// Binds a caller to its eventual reply: the async-call flag, the
/// caller-supplied done sink, the extension factory used to look up a named
/// serializer, and the gzip-size hint / proxy bit forwarded from the
/// endpoint. The Go source keeps "reply holder" and "done channel" as two
/// separate mutable fields written in sequence; here a single
/// `oneshot::Sender<Response>` plays both roles; see DESIGN.md.
pub struct RpcContext {
    pub async_call: bool,
    pub proxy: bool,
    pub gzip_size: i64,
    pub extension_factory: Arc<SerializerRegistry>,
    pub async_start: Instant,
    done: Option<oneshot::Sender<Response>>,
}

impl RpcContext {
    pub fn sync(extension_factory: Arc<SerializerRegistry>, proxy: bool, gzip_size: i64) -> RpcContext {
        RpcContext {
            async_call: false,
            proxy,
            gzip_size,
            extension_factory,
            async_start: Instant::now(),
            done: None,
        }
    }

    pub fn async_with_done(
        extension_factory: Arc<SerializerRegistry>,
        proxy: bool,
        gzip_size: i64,
    ) -> (RpcContext, oneshot::Receiver<Response>) {
        let (tx, rx) = oneshot::channel();
        (
            RpcContext {
                async_call: true,
                proxy,
                gzip_size,
                extension_factory,
                async_start: Instant::now(),
                done: Some(tx),
            },
            rx,
        )
    }

    /// Completes the caller's done sink. Idempotent: a second call is a
    /// silent no-op since `done` has already been taken.
    pub fn complete(&mut self, response: Response) {
        if let Some(done) = self.done.take() {
            let _ = done.send(response);
        }
    }
}

/// A named serializer, looked up by the single-byte discriminant carried in
/// the wire header's `serialize_type` field.
pub trait Serializer: Send + Sync {
    fn id(&self) -> u8;
    fn deserialize_reply(&self, body: &[u8]) -> Result<Vec<u8>>;
}

/// Identity serializer: treats the reply body as already being the decoded
/// value. Used by tests and as the crate's only built-in serializer; real
/// deployments register their own (JSON, Hessian2, etc.) against the ids
/// their wire format actually uses.
#[derive(Debug, Default)]
pub struct IdentitySerializer;

impl Serializer for IdentitySerializer {
    fn id(&self) -> u8 {
        0
    }

    fn deserialize_reply(&self, body: &[u8]) -> Result<Vec<u8>> {
        Ok(body.to_vec())
    }
}

/// The "serialization plug-in" extension factory: named serializers
/// supplied externally and looked up by wire-header byte.
#[derive(Default)]
pub struct SerializerRegistry {
    serializers: HashMap<u8, Arc<dyn Serializer>>,
}

impl SerializerRegistry {
    pub fn new() -> SerializerRegistry {
        SerializerRegistry {
            serializers: HashMap::new(),
        }
    }

    /// A registry pre-populated with the built-in identity serializer.
    pub fn with_defaults() -> SerializerRegistry {
        let mut registry = SerializerRegistry::new();
        registry.register(Arc::new(IdentitySerializer));
        registry
    }

    pub fn register(&mut self, serializer: Arc<dyn Serializer>) {
        self.serializers.insert(serializer.id(), serializer);
    }

    pub fn get(&self, id: u8) -> Option<Arc<dyn Serializer>> {
        self.serializers.get(&id).cloned()
    }
}

/// The "message codec" external collaborator: encodes a `Request` into a
/// wire `Message` and decodes a wire `Message` from a byte stream. The core
/// calls into this but does not define the wire format beyond the header
/// fields on `Message`.
#[async_trait::async_trait]
pub trait Codec: Send + Sync {
    fn encode(&self, request: &Request, ctx: &RpcContext, local_request_id: u64) -> Result<Message>;

    async fn decode(&self, reader: &mut (dyn AsyncRead + Send + Unpin)) -> Result<Message>;

    async fn write(&self, writer: &mut (dyn AsyncWrite + Send + Unpin), message: &Message) -> Result<()>;
}

/// Default codec used by the crate's own tests and the example mock server:
/// `[len: u32 BE][serialize_type: u8][flags: u8][request_id: u64 BE][body]`.
/// `flags` bit 0 is the heartbeat bit, bit 1 is the proxy bit, bit 2 is the
/// is-error bit. Not part of `spec.md` (which treats the codec as external)
/// but needed to drive the crate end-to-end in tests.
#[derive(Debug, Default)]
pub struct LengthPrefixedCodec;

const FLAG_HEARTBEAT: u8 = 0b001;
const FLAG_PROXY: u8 = 0b010;
const FLAG_ERROR: u8 = 0b100;

#[async_trait::async_trait]
impl Codec for LengthPrefixedCodec {
    fn encode(&self, request: &Request, ctx: &RpcContext, local_request_id: u64) -> Result<Message> {
        let mut body = Vec::new();
        body.extend_from_slice(request.method.as_bytes());
        body.push(0);
        body.extend_from_slice(&request.arguments);

        let header = MessageHeader {
            request_id: local_request_id,
            heartbeat: false,
            serialize_type: 0,
            proxy: ctx.proxy,
            is_error: false,
        };
        Ok(Message::new(header, body))
    }

    async fn decode(&self, reader: &mut (dyn AsyncRead + Send + Unpin)) -> Result<Message> {
        let len = reader.read_u32().await.map_err(Error::Transport)? as usize;
        if len < 10 {
            return Err(Error::Decode(format!("frame too short: {len} bytes")));
        }
        let serialize_type = reader.read_u8().await.map_err(Error::Transport)?;
        let flags = reader.read_u8().await.map_err(Error::Transport)?;
        let request_id = reader.read_u64().await.map_err(Error::Transport)?;
        let mut body = vec![0u8; len - 10];
        reader.read_exact(&mut body).await.map_err(Error::Transport)?;

        Ok(Message::new(
            MessageHeader {
                request_id,
                heartbeat: flags & FLAG_HEARTBEAT != 0,
                serialize_type,
                proxy: flags & FLAG_PROXY != 0,
                is_error: flags & FLAG_ERROR != 0,
            },
            body,
        ))
    }

    async fn write(&self, writer: &mut (dyn AsyncWrite + Send + Unpin), message: &Message) -> Result<()> {
        let mut flags = 0u8;
        if message.header.heartbeat {
            flags |= FLAG_HEARTBEAT;
        }
        if message.header.proxy {
            flags |= FLAG_PROXY;
        }
        if message.header.is_error {
            flags |= FLAG_ERROR;
        }

        let len = 10 + message.body.len();
        writer.write_u32(len as u32).await.map_err(Error::Transport)?;
        writer.write_u8(message.header.serialize_type).await.map_err(Error::Transport)?;
        writer.write_u8(flags).await.map_err(Error::Transport)?;
        writer.write_u64(message.header.request_id).await.map_err(Error::Transport)?;
        writer.write_all(&message.body).await.map_err(Error::Transport)?;
        Ok(())
    }
}
