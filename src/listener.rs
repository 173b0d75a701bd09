//! Accept loop that routes inbound connections to per-node servers.
//!
//! ```text
//!   Acceptor ──accept──▶ route task ──read node id──▶ ServerDispatcher
//!      ▲                    │ (max_retry patience)          │
//!      │                    ▼                               ▼
//!   retry_wait        drop silently on            server.handle_connection
//!   on failure        timeout / unknown node
//! ```
//!
//! Only failures of `accept` itself count against the retry budget.  A peer
//! that sends garbage, nothing, or an unknown node id costs one dropped
//! connection and is otherwise ignored.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::config::RetryConfig;
use crate::error::QueueError;
use crate::request::FailureReporter;
use crate::retry::{FailureTracker, RetryDecision};
use crate::server::NodeServer;
use crate::socket::Acceptor;
use crate::{lock, read_lock, wire, write_lock};

/// Looks up the server responsible for a remote node.
pub trait ServerDispatcher: Send + Sync + 'static {
    /// Fails with [`QueueError::UnknownNode`] if no server handles `node_id`.
    fn get_server(&self, node_id: i64) -> Result<Arc<dyn NodeServer>, QueueError>;
}

/// A [`ServerDispatcher`] backed by a map from node id to server.
#[derive(Default)]
pub struct ServerRegistry {
    servers: RwLock<HashMap<i64, Arc<dyn NodeServer>>>,
}

impl ServerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `server` under its node id, returning the server it replaces.
    pub fn register(&self, server: Arc<dyn NodeServer>) -> Option<Arc<dyn NodeServer>> {
        write_lock(&self.servers).insert(server.node_id(), server)
    }

    pub fn remove(&self, node_id: i64) -> Option<Arc<dyn NodeServer>> {
        write_lock(&self.servers).remove(&node_id)
    }

    pub fn len(&self) -> usize {
        read_lock(&self.servers).len()
    }

    pub fn is_empty(&self) -> bool {
        read_lock(&self.servers).is_empty()
    }

    /// Disconnect every registered server.  The servers stay registered.
    pub fn shutdown(&self) {
        for server in read_lock(&self.servers).values() {
            server.disconnect();
        }
    }
}

impl ServerDispatcher for ServerRegistry {
    fn get_server(&self, node_id: i64) -> Result<Arc<dyn NodeServer>, QueueError> {
        read_lock(&self.servers)
            .get(&node_id)
            .cloned()
            .ok_or(QueueError::UnknownNode(node_id))
    }
}

// ---------------------------------------------------------------------------
// RequestQueueListener
// ---------------------------------------------------------------------------

pub struct RequestQueueListener {
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RequestQueueListener {
    /// Start accepting connections from `acceptor` on a background task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new<A: Acceptor>(
        acceptor: A,
        dispatcher: Arc<dyn ServerDispatcher>,
        reporter: Arc<dyn FailureReporter>,
        retry: RetryConfig,
    ) -> Result<Self, QueueError> {
        retry.validate()?;
        let cancel = CancellationToken::new();
        let task = tokio::spawn(accept_loop(
            acceptor,
            dispatcher,
            reporter,
            retry,
            cancel.clone(),
        ));
        Ok(Self {
            cancel,
            task: Mutex::new(Some(task)),
        })
    }

    /// `true` until the accept loop has stopped, either through
    /// [`shutdown`](Self::shutdown) or after reporting a failure.
    pub fn is_running(&self) -> bool {
        lock(&self.task).as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop accepting and close the listening socket.  Safe to call
    /// repeatedly; never reports a failure.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let task = lock(&self.task).take();
        if let Some(task) = task {
            let _ = task.await;
            log::debug!("[listener] shut down");
        }
    }
}

impl Drop for RequestQueueListener {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn accept_loop<A: Acceptor>(
    mut acceptor: A,
    dispatcher: Arc<dyn ServerDispatcher>,
    reporter: Arc<dyn FailureReporter>,
    retry: RetryConfig,
    cancel: CancellationToken,
) {
    let mut failures = FailureTracker::new(retry);
    loop {
        let accepted = tokio::select! {
            () = cancel.cancelled() => break,
            r = acceptor.accept() => r,
        };
        match accepted {
            Ok(stream) => {
                failures.record_success();
                tokio::spawn(route_connection(
                    stream,
                    dispatcher.clone(),
                    retry.max_retry,
                    cancel.child_token(),
                ));
            }
            Err(e) => match failures.record_failure() {
                RetryDecision::Retry(wait) => {
                    log::debug!("[listener] accept failed: {e}; retrying in {wait:?}");
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        () = tokio::time::sleep(wait) => {}
                    }
                }
                RetryDecision::GiveUp => {
                    log::warn!("[listener] accept keeps failing, giving up: {e}");
                    reporter.report_failure(QueueError::Io(e));
                    break;
                }
            },
        }
    }
    // Dropping the acceptor closes the listening socket.
}

/// Read the node-id header and hand the connection to its server.
async fn route_connection(
    mut stream: TcpStream,
    dispatcher: Arc<dyn ServerDispatcher>,
    patience: std::time::Duration,
    cancel: CancellationToken,
) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "?".to_string());

    let header = tokio::select! {
        () = cancel.cancelled() => return,
        r = timeout(patience, wire::read_node_id(&mut stream)) => r,
    };
    let node_id = match header {
        Ok(Ok(node_id)) => node_id,
        Ok(Err(e)) => {
            log::debug!("[listener] {peer}: no node id ({e}); dropping");
            return;
        }
        Err(_) => {
            log::debug!("[listener] {peer}: no node id within {patience:?}; dropping");
            return;
        }
    };

    match dispatcher.get_server(node_id) {
        Ok(server) => {
            log::debug!("[listener] {peer}: connection for node {node_id}");
            server.handle_connection(stream);
        }
        Err(e) => log::warn!("[listener] {peer}: dropping connection: {e}"),
    }
}
