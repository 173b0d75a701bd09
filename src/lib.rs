//! `request-queue`: ordered, retransmitting request delivery between nodes,
//! with each request performed exactly once.
//!
//! # Architecture
//!
//! ```text
//!   node A                                          node B
//!  ┌──────────────────────┐                  ┌──────────────────────────┐
//!  │ RequestQueueClient   │  one TCP stream  │ RequestQueueListener     │
//!  │  PendingQueue        │─────────────────▶│   │ node id header       │
//!  │  FailureTracker      │                  │   ▼                      │
//!  └──────────┬───────────┘                  │ ServerDispatcher         │
//!             │ SocketFactory                │   │                      │
//!             │ (reconnects, resends)        │   ▼                      │
//!             │                              │ RequestQueueServer(A)    │
//!             │                              │   DedupState             │
//!             │                              │   RequestHandler         │
//!             ▼                              └──────────────────────────┘
//!     FailureReporter  ◀── only unrecoverable faults
//! ```
//!
//! Each module has a single responsibility:
//! - [`sequence`]: circular ordering of 15-bit request numbers
//! - [`wire`]: frame layouts and async read/write helpers
//! - [`request`]: the `Request` / `RequestHandler` contracts
//! - [`error`]: the crate-wide error type
//! - [`config`]: retry and queue sizing parameters
//! - [`retry`]: fixed-interval retry bookkeeping
//! - [`pending`]: client queue of unacknowledged requests
//! - [`dedup`]: server duplicate detection and sticky failure
//! - [`client`]: per-destination sending client
//! - [`server`]: per-node executing server
//! - [`listener`]: accept loop and node dispatch
//! - [`socket`]: connection sources (socket factory, acceptor)
//! - [`simulator`]: fault-injecting streams for testing

use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub mod client;
pub mod config;
pub mod dedup;
pub mod error;
pub mod listener;
pub mod pending;
pub mod request;
pub mod retry;
pub mod sequence;
pub mod server;
pub mod simulator;
pub mod socket;
pub mod wire;

pub use client::RequestQueueClient;
pub use config::{ClientConfig, RetryConfig, MAX_OUTSTANDING};
pub use error::QueueError;
pub use listener::{RequestQueueListener, ServerDispatcher, ServerRegistry};
pub use request::{FailureReporter, Request, RequestFailure, RequestHandler};
pub use server::{NodeServer, RequestQueueServer};
pub use socket::{Acceptor, SocketFactory, TcpSocketFactory};

// A panic while holding one of these locks leaves plain bookkeeping behind,
// so carry on with whatever state it left.

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read_lock<T>(l: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write_lock<T>(l: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(PoisonError::into_inner)
}
