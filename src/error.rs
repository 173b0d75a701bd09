//! Error type shared by the client, server and listener.

use std::time::Duration;

use thiserror::Error;

use crate::request::RequestFailure;

/// Errors that can arise anywhere in the request queue.
#[derive(Error, Debug)]
pub enum QueueError {
    /// A constructor or call argument was out of range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A request number above the 15-bit range.
    #[error("request number out of range: {0}")]
    RequestNumberOutOfRange(u16),

    /// Two request numbers too far apart to order.
    #[error("request numbers too far apart to order: reference={reference} candidate={candidate}")]
    AmbiguousSequence { reference: u16, candidate: u16 },

    /// The client was shut down, explicitly or after a failure.
    #[error("the client has begun to shut down")]
    ShutDown,

    /// The dispatcher has no server for this node.
    #[error("no server for node {0}")]
    UnknownNode(i64),

    /// Underlying I/O error from the OS or the peer closing the stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer did not answer in time.
    #[error("no reply within {0:?}")]
    Timeout(Duration),

    /// The remote handler failed while performing a request.
    #[error("request failed: {0}")]
    RequestFailed(RequestFailure),
}

impl QueueError {
    /// Returns true for connectivity faults that a reconnect may cure.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Timeout(_))
    }
}
