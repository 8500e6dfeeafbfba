//! Fixed ring of pre-allocated receive buffers for the capture read path.
//!
//! Each slot is filled by one datagram and then split off as a frozen
//! [`Bytes`] that the fan-out shares across sessions. By the time the
//! ring wraps back to a slot, its previous packet has normally been
//! dropped by every consumer, so `reserve` reclaims the original
//! allocation instead of allocating a new one.

use bytes::{Bytes, BytesMut};

/// Slots in the default ring.
pub const DEFAULT_SLOTS: usize = 120;

/// Default slot capacity, one Ethernet MTU.
pub const DEFAULT_SLOT_SIZE: usize = 1500;

/// A circular pool of MTU-sized buffers.
#[derive(Debug)]
pub struct PacketPool {
    slots: Vec<BytesMut>,
    slot_size: usize,
    next: usize,
}

impl PacketPool {
    pub fn new(slots: usize, slot_size: usize) -> Self {
        let slots = slots.max(1);
        Self {
            slots: (0..slots).map(|_| BytesMut::with_capacity(slot_size)).collect(),
            slot_size,
            next: 0,
        }
    }

    /// Hand out the next slot, emptied and with at least one slot's
    /// worth of spare capacity.
    pub fn next_slot(&mut self) -> &mut BytesMut {
        let index = self.next;
        self.next = (self.next + 1) % self.slots.len();

        let slot = &mut self.slots[index];
        slot.clear();
        slot.reserve(self.slot_size);
        slot
    }

    /// Split the filled bytes out of `slot` as a shareable packet.
    pub fn take(slot: &mut BytesMut) -> Bytes {
        slot.split().freeze()
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }
}

impl Default for PacketPool {
    fn default() -> Self {
        Self::new(DEFAULT_SLOTS, DEFAULT_SLOT_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    #[test]
    fn default_ring_shape() {
        let pool = PacketPool::default();
        assert_eq!(pool.slot_count(), 120);
        assert_eq!(pool.slot_size(), 1500);
    }

    #[test]
    fn slots_have_mtu_capacity() {
        let mut pool = PacketPool::new(3, 1500);
        for _ in 0..7 {
            let slot = pool.next_slot();
            assert!(slot.is_empty());
            assert!(slot.capacity() >= 1500);
            slot.put_slice(&[1u8; 200]);
            let pkt = PacketPool::take(slot);
            assert_eq!(pkt.len(), 200);
        }
    }

    #[test]
    fn outstanding_packet_survives_wraparound() {
        let mut pool = PacketPool::new(2, 16);
        let slot = pool.next_slot();
        slot.put_slice(b"first");
        let first = PacketPool::take(slot);

        let _ = pool.next_slot();
        let slot = pool.next_slot();
        slot.put_slice(b"third");
        let third = PacketPool::take(slot);

        assert_eq!(&first[..], b"first");
        assert_eq!(&third[..], b"third");
    }

    #[test]
    fn zero_slots_clamped_to_one() {
        let mut pool = PacketPool::new(0, 8);
        assert_eq!(pool.slot_count(), 1);
        let _ = pool.next_slot();
    }
}
