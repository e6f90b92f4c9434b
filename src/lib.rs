//! Client-side multiplexed RPC endpoint core for a Motan-style transport:
//! a small pool of long-lived connections, each multiplexing many
//! concurrent calls correlated by request id, sitting behind a single
//! `Endpoint` facade that tracks availability and keeps itself alive with
//! periodic heartbeats.

pub mod channel;
pub mod codec;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod id;
pub mod pool;
pub mod stream;

pub use channel::Channel;
pub use codec::{Codec, Exception, LengthPrefixedCodec, Message, MessageHeader, Request, Response, RpcContext, Serializer, SerializerRegistry};
pub use config::MotanUrl;
pub use endpoint::{CallOutcome, Endpoint};
pub use error::{Error, Result};
pub use pool::ChannelPool;
pub use stream::Stream;
