//! Session modifications buffer accounting.
//!
//! The card stages every in-session modification in a bounded buffer.
//! Depending on the product the bound is counted in bytes or in
//! commands; the engine mirrors the consumption to either split the
//! transaction over several sessions or fail before transmitting.

use crate::apdu::APDU_HEADER_LEN;
use log::trace;

/// Calypso per-modification bookkeeping overhead, in bytes.
const MODIFICATION_OVERHEAD: u32 = 6;

/// Mirror of the card's session modifications buffer.
#[derive(Debug, Clone)]
pub struct SessionBuffer {
    max: u32,
    remaining: u32,
    counted_in_bytes: bool,
}

impl SessionBuffer {
    pub fn new(max: u32, counted_in_bytes: bool) -> Self {
        Self {
            max,
            remaining: max,
            counted_in_bytes,
        }
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    /// Cost of one modifying command given its full APDU length.
    pub fn cost_of_apdu(&self, apdu_len: usize) -> u32 {
        if self.counted_in_bytes {
            apdu_len as u32 + MODIFICATION_OVERHEAD - APDU_HEADER_LEN as u32
        } else {
            1
        }
    }

    pub fn has_room_for(&self, cost: u32) -> bool {
        cost <= self.remaining
    }

    pub fn consume(&mut self, cost: u32) {
        debug_assert!(self.has_room_for(cost));
        self.remaining -= cost;
        trace!(
            "session buffer: {} unit(s) consumed, {} remaining",
            cost,
            self.remaining
        );
    }

    /// Back to full capacity, at session rollover.
    pub fn reset(&mut self) {
        self.remaining = self.max;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_mode_cost_is_lc_plus_overhead() {
        let buffer = SessionBuffer::new(430, true);
        // a 16-byte update record: 5-byte header + 16 bytes of data
        assert_eq!(buffer.cost_of_apdu(21), 22);
        // a case-1 command
        assert_eq!(buffer.cost_of_apdu(4), 5);
    }

    #[test]
    fn command_mode_cost_is_one() {
        let buffer = SessionBuffer::new(3, false);
        assert_eq!(buffer.cost_of_apdu(21), 1);
        assert_eq!(buffer.cost_of_apdu(260), 1);
    }

    #[test]
    fn consume_and_reset() {
        let mut buffer = SessionBuffer::new(215, true);
        let cost = buffer.cost_of_apdu(34); // 29-byte update
        assert_eq!(cost, 35);
        for _ in 0..6 {
            assert!(buffer.has_room_for(cost));
            buffer.consume(cost);
        }
        assert_eq!(buffer.remaining(), 5);
        assert!(!buffer.has_room_for(cost));
        buffer.reset();
        assert_eq!(buffer.remaining(), 215);
    }
}
