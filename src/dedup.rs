//! Server-side duplicate detection and sticky failure.
//!
//! [`DedupState`] decides, for each request number that arrives, whether the
//! request is new and must be performed, is a retransmission of something
//! already performed, or cannot be ordered at all:
//!
//! - Only a number **after** `last_performed` (within the certain window) is
//!   performed.
//! - A number equal to or before `last_performed` is a duplicate: it is
//!   acknowledged again without running anything.
//! - A number in the ambiguous zone, or out of range, is rejected.
//! - Once a request has failed, every later request gets the same failure
//!   back without being performed, until [`DedupState::reset_failure`].
//!
//! The state outlives connections: a client that reconnects picks up exactly
//! where the last connection left off.
//!
//! This module only manages state; the connection task does the I/O.

use crate::error::QueueError;
use crate::request::RequestFailure;
use crate::sequence::{self, SequenceOrder, MAX_REQUEST_NUMBER};

/// What the server should do with an incoming request number.
#[derive(Debug)]
pub enum Disposition {
    /// New request: perform it.
    Perform,
    /// Already performed: acknowledge success without performing.
    Duplicate,
    /// An earlier request failed: echo that failure.
    Failed(RequestFailure),
    /// Cannot be ordered: drop the connection.
    Reject(QueueError),
}

#[derive(Debug, Clone, Default)]
pub struct DedupState {
    /// Most recently performed request number, `None` before the first.
    last_performed: Option<u16>,
    /// Failure of an earlier request, echoed to everything after it.
    failure: Option<RequestFailure>,
}

impl DedupState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn classify(&self, number: u16) -> Disposition {
        if let Some(failure) = &self.failure {
            return Disposition::Failed(failure.clone());
        }
        // Before anything is performed, treat the number just before 0 as
        // the last one so that 0 is the first new request.
        let reference = self.last_performed.unwrap_or(MAX_REQUEST_NUMBER);
        match sequence::compare(reference, number) {
            Ok(SequenceOrder::Earlier) => Disposition::Perform,
            Ok(SequenceOrder::NotEarlier) => Disposition::Duplicate,
            Ok(SequenceOrder::Ambiguous) => Disposition::Reject(QueueError::AmbiguousSequence {
                reference,
                candidate: number,
            }),
            Err(e) => Disposition::Reject(e),
        }
    }

    pub fn record_performed(&mut self, number: u16) {
        self.last_performed = Some(number);
    }

    pub fn record_failure(&mut self, failure: RequestFailure) {
        self.failure = Some(failure);
    }

    pub fn reset_failure(&mut self) {
        self.failure = None;
    }

    pub fn last_performed(&self) -> Option<u16> {
        self.last_performed
    }

    pub fn failure(&self) -> Option<&RequestFailure> {
        self.failure.as_ref()
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
