//! Contracts between the queue and the code that issues and executes requests.
//!
//! The queue never looks inside a request.  The client side only needs to
//! serialise it and tell it when it is done ([`Request`]); the server side
//! only needs to deserialise and run it ([`RequestHandler`]).  Whatever goes
//! wrong during execution crosses the wire as a [`RequestFailure`]: a kind
//! name and a message, nothing more.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::io;

use tokio::io::AsyncRead;

use crate::error::QueueError;

/// A request queued on the client side.
pub trait Request: Send + Sync + 'static {
    /// Serialise this request.  The bytes must be self-delimiting: the
    /// matching [`RequestHandler::read_request`] consumes exactly these bytes.
    fn write_request(&self, out: &mut Vec<u8>) -> io::Result<()>;

    /// Called once the server has acknowledged performing this request.
    fn completed(&self);

    /// Called when this request will never be acknowledged because the client
    /// shut down or failed.
    fn abandoned(&self) {}
}

impl fmt::Debug for dyn Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Request")
    }
}

/// Server-side reader and executor for one request type.
pub trait RequestHandler: Send + Sync + 'static {
    type Request: Send + 'static;

    /// Read one request payload from `input`.
    ///
    /// Any error closes the connection the request arrived on.
    fn read_request(
        &self,
        input: &mut (dyn AsyncRead + Unpin + Send),
    ) -> impl Future<Output = io::Result<Self::Request>> + Send;

    /// Perform a request.  May block.
    fn perform_request(&self, request: Self::Request) -> Result<(), RequestFailure>;
}

/// Receives failures that stop a client or listener for good.
pub trait FailureReporter: Send + Sync + 'static {
    fn report_failure(&self, error: QueueError);
}

impl<F> FailureReporter for F
where
    F: Fn(QueueError) + Send + Sync + 'static,
{
    fn report_failure(&self, error: QueueError) {
        self(error)
    }
}

// ---------------------------------------------------------------------------
// RequestFailure
// ---------------------------------------------------------------------------

/// Failure kind used for a handler that panicked.
pub const PANIC_KIND: &str = "panic";

/// An execution failure as it travels over the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFailure {
    /// Name of the error type, e.g. `std::io::error::Error`.
    pub kind: String,
    /// Human-readable description.
    pub message: String,
}

impl RequestFailure {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Describe `error` by its type name and display text.
    pub fn from_error<E: std::error::Error>(error: &E) -> Self {
        Self::new(std::any::type_name::<E>(), error.to_string())
    }

    /// Describe a panic payload caught from a handler.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "handler panicked".to_string()
        };
        Self::new(PANIC_KIND, message)
    }
}

impl fmt::Display for RequestFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for RequestFailure {}
