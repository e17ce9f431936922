//! Sequence-ordered packet queue
//!
//! Holds packets that have arrived but are not yet released, ordered by
//! wrap-unwrapped sequence number so iteration order is release order even
//! across the 16-bit wraparound. The queue itself is only a container: the
//! engine owns the release pointers and the big-gap policy.

use std::collections::BTreeMap;

use crate::packet::{Packet, Unwrapper};
use crate::ClockTime;

/// A packet together with its computed running time
#[derive(Debug, Clone)]
pub struct QueuedPacket {
    /// The packet as it arrived
    pub packet: Packet,

    /// Running time assigned by the timeline
    pub pts: ClockTime,
}

/// Outcome of inserting a packet into the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertResult {
    /// The packet was inserted; `head` is set when it became the new front
    Inserted {
        /// The inserted packet sorts before everything already queued
        head: bool,
    },

    /// An entry with the same sequence number is already queued
    Duplicate,
}

/// Ordered buffer of arrived-but-unreleased packets
#[derive(Debug)]
pub struct PacketQueue {
    items: BTreeMap<u64, QueuedPacket>,
    unwrapper: Unwrapper,
}

impl Default for PacketQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self {
            items: BTreeMap::new(),
            unwrapper: Unwrapper::new(16),
        }
    }

    /// Insert a packet, keyed by its sequence number
    pub fn insert(&mut self, queued: QueuedPacket) -> InsertResult {
        let ext = self.unwrapper.unwrap(queued.packet.seqnum as u64);

        if self.items.contains_key(&ext) {
            return InsertResult::Duplicate;
        }

        let head = self
            .items
            .first_key_value()
            .map_or(true, |(first, _)| ext < *first);
        self.items.insert(ext, queued);

        InsertResult::Inserted { head }
    }

    /// Look at the packet with the lowest sequence number
    pub fn peek(&self) -> Option<&QueuedPacket> {
        self.items.first_key_value().map(|(_, q)| q)
    }

    /// Remove and return the packet with the lowest sequence number
    pub fn pop(&mut self) -> Option<QueuedPacket> {
        self.items.pop_first().map(|(_, q)| q)
    }

    /// Number of queued packets
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the queue holds no packets
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Drop all packets and forget the sequence domain
    pub fn clear(&mut self) {
        self.items.clear();
        self.unwrapper.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn queued(seqnum: u16) -> QueuedPacket {
        QueuedPacket {
            packet: Packet::new(seqnum, 0, 0, Bytes::from_static(b"test")),
            pts: 0,
        }
    }

    #[test]
    fn test_insert_in_order() {
        let mut q = PacketQueue::new();
        assert_eq!(q.insert(queued(10)), InsertResult::Inserted { head: true });
        assert_eq!(q.insert(queued(11)), InsertResult::Inserted { head: false });
        assert_eq!(q.insert(queued(12)), InsertResult::Inserted { head: false });

        assert_eq!(q.pop().unwrap().packet.seqnum, 10);
        assert_eq!(q.pop().unwrap().packet.seqnum, 11);
        assert_eq!(q.pop().unwrap().packet.seqnum, 12);
        assert!(q.pop().is_none());
    }

    #[test]
    fn test_insert_reordered() {
        let mut q = PacketQueue::new();
        q.insert(queued(12));
        // an earlier seqnum becomes the new head
        assert_eq!(q.insert(queued(10)), InsertResult::Inserted { head: true });
        q.insert(queued(11));

        assert_eq!(q.peek().unwrap().packet.seqnum, 10);
        assert_eq!(q.pop().unwrap().packet.seqnum, 10);
        assert_eq!(q.pop().unwrap().packet.seqnum, 11);
        assert_eq!(q.pop().unwrap().packet.seqnum, 12);
    }

    #[test]
    fn test_duplicate_detected() {
        let mut q = PacketQueue::new();
        q.insert(queued(10));
        assert_eq!(q.insert(queued(10)), InsertResult::Duplicate);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_order_across_wraparound() {
        let mut q = PacketQueue::new();
        q.insert(queued(65534));
        q.insert(queued(0));
        q.insert(queued(65535));
        q.insert(queued(1));

        assert_eq!(q.pop().unwrap().packet.seqnum, 65534);
        assert_eq!(q.pop().unwrap().packet.seqnum, 65535);
        assert_eq!(q.pop().unwrap().packet.seqnum, 0);
        assert_eq!(q.pop().unwrap().packet.seqnum, 1);
    }

    #[test]
    fn test_clear() {
        let mut q = PacketQueue::new();
        q.insert(queued(10));
        q.insert(queued(11));
        q.clear();
        assert!(q.is_empty());
        // a fresh domain is accepted after clearing
        assert_eq!(q.insert(queued(40000)), InsertResult::Inserted { head: true });
    }
}
