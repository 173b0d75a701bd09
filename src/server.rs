//! Server side of a request queue: one [`RequestQueueServer`] per remote node.
//!
//! The server owns the [`DedupState`] for its node and at most one live
//! connection.  Handing it a new connection aborts the previous one; the
//! dedup state carries over, so a client that reconnects and resends its
//! unacknowledged requests gets each one performed exactly once.
//!
//! # Connection lifecycle
//!
//! ```text
//!  handle_connection(stream)
//!      │  abort previous connection task (drops its socket)
//!      ▼
//!  connection task
//!      ├── write connect ack
//!      └── loop
//!           ├── read request number        EOF / I/O error  ─▶ close
//!           ├── handler.read_request       any error        ─▶ close
//!           ├── classify + perform (blocking pool, under the state lock)
//!           │                              ambiguous number ─▶ close
//!           └── write response
//! ```
//!
//! Requests are performed on the blocking pool while holding the state lock.
//! That keeps execution serialized even while an old connection is being
//! replaced, and a request that has started always records its outcome, even
//! if its connection task is aborted mid-flight.
//!
//! The accessors never take that lock.  They read a copy of the state that
//! each decision publishes, so they return at once even while a slow handler
//! runs.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use crate::dedup::{DedupState, Disposition};
use crate::error::QueueError;
use crate::lock;
use crate::request::{RequestFailure, RequestHandler};
use crate::wire;

/// A per-node server that a listener can hand connections to.
///
/// This is the non-generic face of [`RequestQueueServer`], so that one
/// dispatcher can hold servers for different handler types.
pub trait NodeServer: Send + Sync + 'static {
    fn node_id(&self) -> i64;

    /// Take over `stream`, replacing any current connection.
    fn handle_connection(&self, stream: TcpStream);

    /// Close the current connection, if any.
    fn disconnect(&self);
}

/// The live connection task.
struct ActiveConnection {
    id: u64,
    task: JoinHandle<()>,
}

/// Dedup state shared by the server and its connection tasks.
#[derive(Default)]
struct NodeState {
    /// Held for the whole of a decision, handler call included.
    dedup: Mutex<DedupState>,
    /// Copy of `dedup` as of the last decision.
    published: Mutex<DedupState>,
    /// Set by `reset_failure`, applied to `dedup` at the next sync.
    reset_requested: AtomicBool,
}

impl NodeState {
    /// Apply a pending reset to `dedup`, then publish it.
    fn sync(&self, dedup: &mut DedupState) {
        let mut published = lock(&self.published);
        if self.reset_requested.swap(false, Ordering::AcqRel) {
            dedup.reset_failure();
        }
        *published = dedup.clone();
    }
}

pub struct RequestQueueServer<H: RequestHandler> {
    node_id: i64,
    handler: Arc<H>,
    state: Arc<NodeState>,
    connection: Mutex<Option<ActiveConnection>>,
    next_connection_id: AtomicU64,
}

impl<H: RequestHandler> RequestQueueServer<H> {
    /// Create a server for `node_id`, which must not be negative.
    pub fn new(node_id: i64, handler: H) -> Result<Self, QueueError> {
        if node_id < 0 {
            return Err(QueueError::InvalidArgument(format!(
                "node_id must not be negative: {node_id}"
            )));
        }
        log::debug!("[server node={node_id}] created");
        Ok(Self {
            node_id,
            handler: Arc::new(handler),
            state: Arc::new(NodeState::default()),
            connection: Mutex::new(None),
            next_connection_id: AtomicU64::new(1),
        })
    }

    pub fn node_id(&self) -> i64 {
        self.node_id
    }

    /// Take over `stream` and serve requests from it on a new task,
    /// aborting the previous connection if there is one.
    ///
    /// Must be called from within a tokio runtime.
    pub fn handle_connection(&self, stream: TcpStream) {
        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let mut slot = lock(&self.connection);
        if let Some(old) = slot.take() {
            old.task.abort();
            log::debug!(
                "[server node={}] connection {} replaced by {}",
                self.node_id,
                old.id,
                id
            );
        }
        let task = tokio::spawn(serve_connection(
            self.node_id,
            id,
            stream,
            self.handler.clone(),
            self.state.clone(),
        ));
        *slot = Some(ActiveConnection { id, task });
    }

    /// Close the current connection.  Safe to call repeatedly.
    pub fn disconnect(&self) {
        if let Some(old) = lock(&self.connection).take() {
            old.task.abort();
            log::debug!("[server node={}] connection {} disconnected", self.node_id, old.id);
        }
    }

    /// `true` while a connection task is running.
    pub fn is_connected(&self) -> bool {
        lock(&self.connection)
            .as_ref()
            .is_some_and(|c| !c.task.is_finished())
    }

    /// Number of the last request performed, `None` before the first.
    pub fn last_performed(&self) -> Option<u16> {
        lock(&self.state.published).last_performed()
    }

    /// The failure every request is currently answered with, if any.
    pub fn failure(&self) -> Option<RequestFailure> {
        lock(&self.state.published).failure().cloned()
    }

    /// Clear a sticky failure so that new requests are performed again.
    ///
    /// Does not wait for a running handler; the next request to arrive is
    /// classified as if the failure never happened.
    pub fn reset_failure(&self) {
        let mut published = lock(&self.state.published);
        if let Some(f) = published.failure() {
            log::warn!("[server node={}] clearing sticky failure: {f}", self.node_id);
        }
        published.reset_failure();
        self.state.reset_requested.store(true, Ordering::Release);
    }
}

impl<H: RequestHandler> NodeServer for RequestQueueServer<H> {
    fn node_id(&self) -> i64 {
        RequestQueueServer::node_id(self)
    }

    fn handle_connection(&self, stream: TcpStream) {
        RequestQueueServer::handle_connection(self, stream)
    }

    fn disconnect(&self) {
        RequestQueueServer::disconnect(self)
    }
}

impl<H: RequestHandler> Drop for RequestQueueServer<H> {
    fn drop(&mut self) {
        self.disconnect();
    }
}

// ---------------------------------------------------------------------------
// Connection task
// ---------------------------------------------------------------------------

/// What to do after classifying and possibly performing a request.
enum Verdict {
    Reply(Result<(), RequestFailure>),
    Reject(QueueError),
}

async fn serve_connection<H: RequestHandler>(
    node_id: i64,
    id: u64,
    stream: TcpStream,
    handler: Arc<H>,
    state: Arc<NodeState>,
) {
    log::debug!("[server node={node_id}] connection {id} started");
    match run_connection(node_id, stream, handler, state).await {
        Ok(()) => log::debug!("[server node={node_id}] connection {id} closed by peer"),
        Err(e) if e.is_transient() => {
            log::debug!("[server node={node_id}] connection {id} closed: {e}")
        }
        Err(e) => log::warn!("[server node={node_id}] connection {id} dropped: {e}"),
    }
    // The stream halves are dropped with the task, closing the socket.
}

async fn run_connection<H: RequestHandler>(
    node_id: i64,
    stream: TcpStream,
    handler: Arc<H>,
    state: Arc<NodeState>,
) -> Result<(), QueueError> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    wire::write_connect_ack(&mut writer).await?;

    loop {
        let number = match wire::read_request_number(&mut reader).await {
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let request = handler.read_request(&mut reader).await?;

        let verdict = {
            let handler = handler.clone();
            let state = state.clone();
            tokio::task::spawn_blocking(move || decide(node_id, number, request, &*handler, &state))
                .await
                .map_err(|e| QueueError::Io(std::io::Error::other(e)))?
        };

        match verdict {
            Verdict::Reply(result) => wire::write_response(&mut writer, &result).await?,
            Verdict::Reject(e) => return Err(e),
        }
    }
}

/// Classify `number`, perform the request if it is new, and record the
/// outcome, all under the dedup lock.
fn decide<H: RequestHandler>(
    node_id: i64,
    number: u16,
    request: H::Request,
    handler: &H,
    shared: &NodeState,
) -> Verdict {
    let mut state = lock(&shared.dedup);
    shared.sync(&mut state);
    let verdict = match state.classify(number) {
        Disposition::Perform => {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler.perform_request(request)))
                .unwrap_or_else(|payload| Err(RequestFailure::from_panic(payload)));
            match outcome {
                Ok(()) => {
                    state.record_performed(number);
                    log::trace!("[server node={node_id}] performed request {number}");
                    Verdict::Reply(Ok(()))
                }
                Err(failure) => {
                    log::warn!("[server node={node_id}] request {number} failed: {failure}");
                    state.record_failure(failure.clone());
                    Verdict::Reply(Err(failure))
                }
            }
        }
        Disposition::Duplicate => {
            log::debug!("[server node={node_id}] request {number} already performed");
            Verdict::Reply(Ok(()))
        }
        Disposition::Failed(failure) => Verdict::Reply(Err(failure)),
        Disposition::Reject(e) => Verdict::Reject(e),
    };
    shared.sync(&mut state);
    verdict
}
