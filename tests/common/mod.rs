//! Shared fixtures for the integration tests.
//!
//! A test request carries an action byte and a `u32` value.  The server-side
//! [`TestHandler`] records every value it performs, in order, and fails or
//! panics when the action says so.

#![allow(dead_code)]

use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use request_queue::{
    wire, FailureReporter, QueueError, Request, RequestFailure, RequestHandler,
    RequestQueueListener, RequestQueueServer, RetryConfig, ServerDispatcher,
};

pub const OK: u8 = 0;
pub const FAIL: u8 = 1;
pub const PANIC: u8 = 2;
/// Performs successfully after blocking for [`SLOW_FOR`].
pub const SLOW: u8 = 3;

pub const SLOW_FOR: Duration = Duration::from_secs(1);

pub const FAILURE_KIND: &str = "test::Refused";

/// Generous upper bound for anything a test waits on.
pub const PATIENCE: Duration = Duration::from_secs(10);

pub fn fast_retry() -> RetryConfig {
    RetryConfig::new(Duration::from_millis(200), Duration::from_millis(10))
}

pub fn patient_retry() -> RetryConfig {
    RetryConfig::new(Duration::from_secs(5), Duration::from_millis(5))
}

// ---------------------------------------------------------------------------
// Server side
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
pub struct TestHandler {
    pub performed: Arc<Mutex<Vec<u32>>>,
}

impl TestHandler {
    pub fn performed(&self) -> Vec<u32> {
        self.performed.lock().unwrap().clone()
    }
}

impl RequestHandler for TestHandler {
    type Request = (u8, u32);

    async fn read_request(
        &self,
        input: &mut (dyn AsyncRead + Unpin + Send),
    ) -> io::Result<(u8, u32)> {
        let action = input.read_u8().await?;
        if action > SLOW {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown action {action}"),
            ));
        }
        let value = input.read_u32().await?;
        Ok((action, value))
    }

    fn perform_request(&self, (action, value): (u8, u32)) -> Result<(), RequestFailure> {
        self.performed.lock().unwrap().push(value);
        match action {
            FAIL => Err(RequestFailure::new(FAILURE_KIND, format!("refused {value}"))),
            PANIC => panic!("exploded on {value}"),
            SLOW => {
                std::thread::sleep(SLOW_FOR);
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

pub fn new_server(node_id: i64) -> (Arc<RequestQueueServer<TestHandler>>, TestHandler) {
    let handler = TestHandler::default();
    let server = RequestQueueServer::new(node_id, handler.clone()).unwrap();
    (Arc::new(server), handler)
}

/// A connected loopback pair: `(server side, client side)`.
pub async fn loopback_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
    (accepted.unwrap().0, client.unwrap())
}

/// Hand a fresh connection to `server` and consume its connect ack.
pub async fn connect_raw(server: &RequestQueueServer<TestHandler>) -> TcpStream {
    let (server_side, mut client) = loopback_pair().await;
    server.handle_connection(server_side);
    let ack = tokio::time::timeout(PATIENCE, wire::read_bool(&mut client))
        .await
        .expect("connect ack timed out")
        .expect("connect ack");
    assert!(ack);
    client
}

/// A request frame as the client would write it.
pub fn frame(number: u16, action: u8, value: u32) -> Vec<u8> {
    let mut buf = number.to_be_bytes().to_vec();
    buf.push(action);
    buf.extend_from_slice(&value.to_be_bytes());
    buf
}

pub async fn send_frames(stream: &mut TcpStream, frames: &[(u16, u8, u32)]) {
    let mut bytes = Vec::new();
    for &(number, action, value) in frames {
        bytes.extend(frame(number, action, value));
    }
    stream.write_all(&bytes).await.unwrap();
}

pub async fn read_response(stream: &mut TcpStream) -> Result<(), RequestFailure> {
    tokio::time::timeout(PATIENCE, wire::read_response(stream))
        .await
        .expect("response timed out")
        .expect("response")
}

/// Wait for the peer to close `stream`, discarding anything it still sends.
pub async fn assert_closed(stream: &mut TcpStream) {
    let mut rest = Vec::new();
    tokio::time::timeout(PATIENCE, stream.read_to_end(&mut rest))
        .await
        .expect("connection was not closed")
        .ok();
}

// ---------------------------------------------------------------------------
// Listener
// ---------------------------------------------------------------------------

pub async fn start_listener(
    dispatcher: Arc<dyn ServerDispatcher>,
    reports: &Reports,
    retry: RetryConfig,
) -> (RequestQueueListener, u16) {
    let socket = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = socket.local_addr().unwrap().port();
    let listener = RequestQueueListener::new(socket, dispatcher, reports.reporter(), retry).unwrap();
    (listener, port)
}

// ---------------------------------------------------------------------------
// Client side
// ---------------------------------------------------------------------------

/// Outcome of one client request: `(value, completed)`.  `completed` is
/// `false` when the request was abandoned.
pub type Event = (u32, bool);

pub struct TestRequest {
    pub action: u8,
    pub value: u32,
    pub events: mpsc::UnboundedSender<Event>,
}

impl TestRequest {
    pub fn new(action: u8, value: u32, events: &mpsc::UnboundedSender<Event>) -> Arc<dyn Request> {
        Arc::new(Self {
            action,
            value,
            events: events.clone(),
        })
    }
}

impl Request for TestRequest {
    fn write_request(&self, out: &mut Vec<u8>) -> io::Result<()> {
        out.push(self.action);
        out.extend_from_slice(&self.value.to_be_bytes());
        Ok(())
    }

    fn completed(&self) {
        let _ = self.events.send((self.value, true));
    }

    fn abandoned(&self) {
        let _ = self.events.send((self.value, false));
    }
}

/// Receive `n` events, failing the test if they take too long.
pub async fn collect_events(rx: &mut mpsc::UnboundedReceiver<Event>, n: usize) -> Vec<Event> {
    let mut events = Vec::with_capacity(n);
    while events.len() < n {
        let event = tokio::time::timeout(PATIENCE, rx.recv())
            .await
            .expect("timed out waiting for request outcome")
            .expect("event channel closed");
        events.push(event);
    }
    events
}

// ---------------------------------------------------------------------------
// Failure reports
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
pub struct Reports {
    seen: Arc<Mutex<Vec<QueueError>>>,
}

impl Reports {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reporter(&self) -> Arc<dyn FailureReporter> {
        let seen = self.seen.clone();
        Arc::new(move |e: QueueError| seen.lock().unwrap().push(e))
    }

    pub fn count(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    pub fn take(&self) -> Vec<QueueError> {
        std::mem::take(&mut *self.seen.lock().unwrap())
    }

    /// Wait until at least `n` failures have been reported.
    pub async fn wait_for(&self, n: usize) {
        tokio::time::timeout(PATIENCE, async {
            while self.count() < n {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("failure was never reported");
    }
}
