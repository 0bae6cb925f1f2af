//! Modular intervals over the 16-bit identifier space.

use crate::utils::NodeId;

/// Clockwise arc of the ring starting after `start` and running to `end`.
///
/// All membership tests work on clockwise offsets from `start`, so arcs that
/// wrap past `u16::MAX` back to zero need no special casing. An arc whose two
/// ends coincide covers the whole ring.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct RingInterval {
    pub start: NodeId,
    pub end: NodeId,
}

impl RingInterval {
    pub fn new(start: NodeId, end: NodeId) -> Self {
        RingInterval { start, end }
    }

    /// Half-open membership: `id` in `(start, end]`.
    pub fn contains(&self, id: NodeId) -> bool {
        let span = self.start.distance_to(&self.end);
        let offset = self.start.distance_to(&id);
        if span == 0 {
            return true;
        }
        offset != 0 && offset <= span
    }

    /// Open membership: `id` in `(start, end)`.
    pub fn contains_open(&self, id: NodeId) -> bool {
        let span = self.start.distance_to(&self.end);
        let offset = self.start.distance_to(&id);
        if span == 0 {
            return offset != 0;
        }
        offset != 0 && offset < span
    }
}
