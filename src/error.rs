//! Crate-wide error type.
//!
//! Mirrors the error taxonomy from the design notes: pool lease failures,
//! channel shutdown, per-call timeouts, and codec failures are all distinct
//! variants so callers (and the endpoint's failure accounting) can match on
//! them without string comparison.

use std::io;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The endpoint's pool has not been installed yet (`Initialize` never
    /// succeeded).
    #[error("pool is not ready")]
    PoolNotReady,

    /// The channel pool has been closed and can no longer hand out channels.
    #[error("channel pool is closed")]
    PoolClosed,

    /// A lease from the pool could not produce a usable channel (the
    /// replacement connection attempt also failed).
    #[error("no channel available")]
    ChannelAbsent,

    /// The channel's shutdown signal fired while a call was in flight.
    #[error("channel is shut down")]
    ChannelShutdown,

    /// `Send` did not get its buffer onto the writer queue before the
    /// deadline elapsed.
    #[error("send timed out")]
    SendTimeout,

    /// `Recv` did not observe a reply before the deadline elapsed.
    #[error("recv timed out")]
    RecvTimeout,

    /// The message or its header was absent when starting a new stream.
    #[error("invalid message")]
    InvalidMessage,

    /// The external codec failed to encode a request.
    #[error("encode failure: {0}")]
    Encode(String),

    /// The external codec failed to decode a wire message.
    #[error("decode failure: {0}")]
    Decode(String),

    /// An underlying connection read or write failed.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// The channel pool could not be built (one of the N connections failed).
    #[error("pool init failed: {0}")]
    PoolInitFailure(String),
}

impl Error {
    /// Whether this error should count against an endpoint's consecutive
    /// failure threshold. Encode failures are not connectivity problems and
    /// are excluded, matching the propagation policy in the design notes.
    pub fn counts_as_connectivity_failure(&self) -> bool {
        !matches!(self, Error::Encode(_))
    }
}
