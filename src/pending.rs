//! Client-side queue of requests awaiting acknowledgement.
//!
//! [`PendingQueue`] holds every request that has been added but not yet
//! acknowledged, in the order its number was assigned.  A cursor splits it
//! into the part already written on the current connection and the part
//! still to be written:
//!
//! ```text
//!  front                 sent                     back
//!    │                    │                        │
//!  ──┼────────────────────┼────────────────────────┼──▶ request numbers
//!    │ <── written, ────▶ │ <── not yet written ─▶ │
//!    │     awaiting ack   │     on this connection │
//! ```
//!
//! - Acknowledgements arrive in order, so an ack always pops the front.
//! - After a reconnect the cursor goes back to the front and everything is
//!   written again with its original number.
//! - Numbers are assigned on entry and wrap at 32768.
//!
//! This module only manages state; socket I/O is the caller's job.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::error::QueueError;
use crate::request::Request;
use crate::sequence;

/// A queued request and its assigned number.
#[derive(Clone)]
pub struct PendingEntry {
    pub number: u16,
    pub request: Arc<dyn Request>,
    /// Times this request has been written to a connection.
    pub tx_count: u32,
}

impl std::fmt::Debug for PendingEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingEntry")
            .field("number", &self.number)
            .field("tx_count", &self.tx_count)
            .finish()
    }
}

#[derive(Debug)]
pub struct PendingQueue {
    entries: VecDeque<PendingEntry>,
    capacity: usize,
    /// Number for the next request added.
    next_number: u16,
    /// How many entries from the front have been written on this connection.
    sent: usize,
}

impl PendingQueue {
    /// Fails with [`QueueError::InvalidArgument`] unless `capacity` is at
    /// least 1.
    pub fn new(capacity: usize) -> Result<Self, QueueError> {
        if capacity == 0 {
            return Err(QueueError::InvalidArgument(
                "queue capacity must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            next_number: 0,
            sent: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    pub fn next_number(&self) -> u16 {
        self.next_number
    }

    /// Append a request under the next number.
    ///
    /// Hands the request back if the queue is full.
    pub fn push(&mut self, request: Arc<dyn Request>) -> Result<u16, Arc<dyn Request>> {
        if self.is_full() {
            return Err(request);
        }
        let number = self.next_number;
        self.next_number = sequence::next(number);
        self.entries.push_back(PendingEntry {
            number,
            request,
            tx_count: 0,
        });
        Ok(number)
    }

    /// Take the next entry to write on the current connection, advancing the
    /// cursor.
    pub fn next_to_send(&mut self) -> Option<PendingEntry> {
        let entry = self.entries.get_mut(self.sent)?;
        entry.tx_count += 1;
        self.sent += 1;
        Some(entry.clone())
    }

    /// `true` when something written on this connection awaits its ack.
    pub fn awaiting_ack(&self) -> bool {
        self.sent > 0
    }

    /// Remove the front entry for an acknowledgement.
    ///
    /// Returns `None` if nothing written on this connection is outstanding.
    pub fn on_ack(&mut self) -> Option<PendingEntry> {
        if self.sent == 0 {
            return None;
        }
        self.sent -= 1;
        self.entries.pop_front()
    }

    /// Prepare for a new connection: everything still queued will be
    /// written again.  Returns how many entries will be resent.
    pub fn rewind(&mut self) -> usize {
        let resend = self.sent;
        self.sent = 0;
        resend
    }

    /// Remove every entry, e.g. to abandon them on shutdown.
    pub fn drain(&mut self) -> Vec<PendingEntry> {
        self.sent = 0;
        self.entries.drain(..).collect()
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
