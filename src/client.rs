//! Client side of a request queue: an ordered, retransmitting sender to one
//! remote node.
//!
//! [`RequestQueueClient::add_request`] numbers each request and queues it.  A
//! background driver task keeps a connection to the server open, writes
//! every queued request, and pops requests off the front as their
//! acknowledgements come back:
//!
//! ```text
//!   add_request ──▶ PendingQueue ──sender──▶ socket ──▶ server
//!      ▲  (permits)      ▲                               │
//!      │                 └──────receiver◀── responses ◀──┘
//!      └──── permit returned on each success ack
//! ```
//!
//! # Faults
//!
//! - A connectivity fault (connect, read or write error, or no response
//!   within `max_retry`) drops the connection.  The driver reconnects after
//!   `retry_wait` and resends everything still queued with its original
//!   number; the server skips what it already performed.
//! - Faults are reported once they have gone on for longer than `max_retry`
//!   without a response in between.  The client then stops.
//! - A failure acknowledgement is reported straight away and also stops the
//!   client.
//!
//! Once stopped, every request still queued is [`abandoned`], and
//! [`add_request`] fails with [`QueueError::ShutDown`].
//!
//! [`abandoned`]: crate::request::Request::abandoned
//! [`add_request`]: RequestQueueClient::add_request

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::config::ClientConfig;
use crate::error::QueueError;
use crate::lock;
use crate::pending::PendingQueue;
use crate::request::{FailureReporter, Request};
use crate::retry::{FailureTracker, RetryDecision};
use crate::socket::SocketFactory;
use crate::wire;

/// State shared between the caller-facing handle and the driver task.
struct Shared {
    node_id: i64,
    queue: Mutex<PendingQueue>,
    /// One permit per free queue slot.  Closed once the client stops.
    slots: Semaphore,
    /// Signalled when a request is queued.
    queued: Notify,
    /// Signalled when a request is written.
    written: Notify,
    cancel: CancellationToken,
}

pub struct RequestQueueClient {
    shared: Arc<Shared>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl RequestQueueClient {
    /// Start a client that sends requests as node `node_id` to the server
    /// that `factory` connects to.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new<F: SocketFactory>(
        node_id: i64,
        factory: F,
        reporter: Arc<dyn FailureReporter>,
        config: ClientConfig,
    ) -> Result<Self, QueueError> {
        if node_id < 0 {
            return Err(QueueError::InvalidArgument(format!(
                "node_id must not be negative: {node_id}"
            )));
        }
        config.validate()?;
        let queue = PendingQueue::new(config.queue_size)?;

        let shared = Arc::new(Shared {
            node_id,
            queue: Mutex::new(queue),
            slots: Semaphore::new(config.queue_size),
            queued: Notify::new(),
            written: Notify::new(),
            cancel: CancellationToken::new(),
        });
        let driver = tokio::spawn(drive(shared.clone(), factory, reporter, config));
        log::debug!(
            "[client node={node_id}] started, queue_size={}",
            config.queue_size
        );
        Ok(Self {
            shared,
            driver: Mutex::new(Some(driver)),
        })
    }

    pub fn node_id(&self) -> i64 {
        self.shared.node_id
    }

    /// Queue `request` for delivery and return the number assigned to it.
    ///
    /// Waits while the queue is full.  Fails with [`QueueError::ShutDown`]
    /// once the client has stopped, including while waiting.
    pub async fn add_request(&self, request: Arc<dyn Request>) -> Result<u16, QueueError> {
        if self.shared.cancel.is_cancelled() {
            return Err(QueueError::ShutDown);
        }
        let permit = self
            .shared
            .slots
            .acquire()
            .await
            .map_err(|_| QueueError::ShutDown)?;
        // The slot comes back through `add_permits` when the request is
        // acknowledged.
        permit.forget();

        let number = {
            let mut queue = lock(&self.shared.queue);
            if self.shared.cancel.is_cancelled() {
                return Err(QueueError::ShutDown);
            }
            // Slots and queue capacity move together, so a full queue here
            // can only mean the slots were closed under us.
            queue.push(request).map_err(|_| QueueError::ShutDown)?
        };
        self.shared.queued.notify_one();
        log::trace!("[client node={}] queued request {number}", self.shared.node_id);
        Ok(number)
    }

    /// Number of requests queued and not yet acknowledged.
    pub fn pending(&self) -> usize {
        lock(&self.shared.queue).len()
    }

    /// `true` until the client has stopped, by [`shutdown`](Self::shutdown)
    /// or after a reported failure.
    pub fn is_running(&self) -> bool {
        !self.shared.cancel.is_cancelled()
    }

    /// Stop the client, close its connection, and abandon every request
    /// still queued.  Safe to call repeatedly; never reports a failure.
    pub async fn shutdown(&self) {
        self.shared.cancel.cancel();
        let driver = lock(&self.driver).take();
        if let Some(driver) = driver {
            let _ = driver.await;
        }
    }
}

impl Drop for RequestQueueClient {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

// ---------------------------------------------------------------------------
// Driver task
// ---------------------------------------------------------------------------

async fn drive<F: SocketFactory>(
    shared: Arc<Shared>,
    factory: F,
    reporter: Arc<dyn FailureReporter>,
    config: ClientConfig,
) {
    let node_id = shared.node_id;
    let patience = config.retry.max_retry;
    let mut failures = FailureTracker::new(config.retry);

    let fatal = loop {
        let result = tokio::select! {
            () = shared.cancel.cancelled() => break None,
            r = connect(&factory, node_id, patience) => match r {
                Ok(stream) => session(&shared, stream, &mut failures, patience).await,
                Err(e) => Err(e),
            },
        };
        let err = match result {
            // Cancelled mid-session.
            Ok(()) => break None,
            Err(e) if e.is_transient() => e,
            Err(e) => break Some(e),
        };
        match failures.record_failure() {
            RetryDecision::Retry(wait) => {
                log::debug!("[client node={node_id}] connection lost: {err}; retrying in {wait:?}");
                tokio::select! {
                    () = shared.cancel.cancelled() => break None,
                    () = tokio::time::sleep(wait) => {}
                }
            }
            RetryDecision::GiveUp => {
                log::warn!(
                    "[client node={node_id}] no progress for {:?}, giving up: {err}",
                    failures.failing_for().unwrap_or_default()
                );
                break Some(err);
            }
        }
    };

    shared.cancel.cancel();
    shared.slots.close();

    if let Some(err) = fatal {
        reporter.report_failure(err);
    }

    let abandoned = lock(&shared.queue).drain();
    if !abandoned.is_empty() {
        log::debug!(
            "[client node={node_id}] abandoning {} queued request(s)",
            abandoned.len()
        );
    }
    for entry in abandoned {
        entry.request.abandoned();
    }
    log::debug!("[client node={node_id}] stopped");
}

/// Open a connection and send the node-id header.
async fn connect<F: SocketFactory>(
    factory: &F,
    node_id: i64,
    patience: Duration,
) -> Result<F::Stream, QueueError> {
    let mut stream = timeout(patience, factory.create_socket())
        .await
        .map_err(|_| QueueError::Timeout(patience))??;
    wire::write_node_id(&mut stream, node_id).await?;
    Ok(stream)
}

/// Run one connection until it fails.  Returns `Ok(())` only when the
/// client is cancelled.
async fn session<S>(
    shared: &Shared,
    stream: S,
    failures: &mut FailureTracker,
    patience: Duration,
) -> Result<(), QueueError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);

    let accepted = timeout(patience, wire::read_bool(&mut reader))
        .await
        .map_err(|_| QueueError::Timeout(patience))??;
    if !accepted {
        return Err(QueueError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "server refused the connection",
        )));
    }

    let resend = lock(&shared.queue).rewind();
    log::debug!(
        "[client node={}] connected, resending {resend} request(s)",
        shared.node_id
    );

    tokio::select! {
        () = shared.cancel.cancelled() => Ok(()),
        r = send_requests(shared, &mut writer) => r,
        r = receive_responses(shared, &mut reader, failures, patience) => r,
    }
}

/// Write queued requests in order as they become available.
async fn send_requests<W>(shared: &Shared, writer: &mut W) -> Result<(), QueueError>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let next = lock(&shared.queue).next_to_send();
        let Some(entry) = next else {
            shared.queued.notified().await;
            continue;
        };
        let frame = wire::encode_request(entry.number, entry.request.as_ref())?;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        log::trace!(
            "[client node={}] sent request {} (tx {})",
            shared.node_id,
            entry.number,
            entry.tx_count
        );
        shared.written.notify_one();
    }
}

/// Read one response per written request and retire the request it answers.
async fn receive_responses<R>(
    shared: &Shared,
    reader: &mut R,
    failures: &mut FailureTracker,
    patience: Duration,
) -> Result<(), QueueError>
where
    R: AsyncRead + Unpin,
{
    loop {
        let awaiting = lock(&shared.queue).awaiting_ack();
        if !awaiting {
            shared.written.notified().await;
            continue;
        }

        let response = timeout(patience, wire::read_response(reader))
            .await
            .map_err(|_| QueueError::Timeout(patience))??;
        failures.record_success();

        if let Err(failure) = response {
            // The failed request stays queued and is abandoned on the way out.
            log::warn!(
                "[client node={}] server reported failure: {failure}",
                shared.node_id
            );
            return Err(QueueError::RequestFailed(failure));
        }

        let acked = lock(&shared.queue).on_ack();
        if let Some(entry) = acked {
            shared.slots.add_permits(1);
            log::trace!("[client node={}] request {} acknowledged", shared.node_id, entry.number);
            entry.request.completed();
        }
    }
}
