//! Circular comparison of request numbers.
//!
//! Request numbers live in a 15-bit space (`0..=32767`) and wrap around.
//! Deciding whether one number comes "after" another is only safe when the
//! two are close together, so the space is split into three zones relative to
//! a reference number `a`:
//!
//! ```text
//!   diff = (b - a) mod 32768
//!
//!   0            1 ........ 9999   10000 ....... 22767   22768 ...... 32767
//!   │ same       │ b is newer     │  ambiguous        │  b is older       │
//!   NotEarlier   Earlier          (rejected)          NotEarlier
//! ```
//!
//! As long as fewer than [`CERTAIN_WINDOW`] requests are outstanding, every
//! comparison either side needs to make falls in one of the certain zones.
//! A number in the ambiguous zone is a protocol violation.
//!
//! No I/O happens here; this is pure arithmetic.

use crate::error::QueueError;

/// Size of the request number space.
pub const MODULUS: u32 = 32_768;

/// Largest valid request number.
pub const MAX_REQUEST_NUMBER: u16 = (MODULUS - 1) as u16;

/// Distance (forwards or backwards) within which an ordering is certain.
pub const CERTAIN_WINDOW: u32 = 10_000;

/// How one request number relates to a reference number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceOrder {
    /// The reference comes strictly before the candidate: the candidate is new.
    Earlier,
    /// The candidate is the reference itself or lies before it.
    NotEarlier,
    /// Too far apart in either direction to tell.
    Ambiguous,
}

/// Classify `candidate` relative to `reference`.
///
/// Returns [`QueueError::RequestNumberOutOfRange`] if either number is above
/// [`MAX_REQUEST_NUMBER`].
pub fn compare(reference: u16, candidate: u16) -> Result<SequenceOrder, QueueError> {
    check_range(reference)?;
    check_range(candidate)?;

    let diff = (u32::from(candidate) + MODULUS - u32::from(reference)) % MODULUS;
    let order = if diff == 0 {
        SequenceOrder::NotEarlier
    } else if diff < CERTAIN_WINDOW {
        SequenceOrder::Earlier
    } else if diff >= MODULUS - CERTAIN_WINDOW {
        SequenceOrder::NotEarlier
    } else {
        SequenceOrder::Ambiguous
    };
    Ok(order)
}

/// Returns `true` if `reference` is strictly earlier than `candidate`.
///
/// Fails with [`QueueError::AmbiguousSequence`] when the two numbers are too
/// far apart to order.
pub fn is_earlier(reference: u16, candidate: u16) -> Result<bool, QueueError> {
    match compare(reference, candidate)? {
        SequenceOrder::Earlier => Ok(true),
        SequenceOrder::NotEarlier => Ok(false),
        SequenceOrder::Ambiguous => Err(QueueError::AmbiguousSequence {
            reference,
            candidate,
        }),
    }
}

/// The request number that follows `n`, wrapping to `0`.
#[inline]
pub fn next(n: u16) -> u16 {
    if n >= MAX_REQUEST_NUMBER {
        0
    } else {
        n + 1
    }
}

fn check_range(n: u16) -> Result<(), QueueError> {
    if n > MAX_REQUEST_NUMBER {
        Err(QueueError::RequestNumberOutOfRange(n))
    } else {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
