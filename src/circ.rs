// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Port of cpp-ipc/src/libipc/circ/elem_def.h + elem_array.h.
// Lock-free circular buffer primitives for shared-memory IPC.
//
// The circular buffer uses a fixed-size array of 256 elements (indices
// wrap via truncation to u8). Connection tracking uses a 32-bit bitmask,
// supporting up to 32 concurrent receivers in broadcast mode.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::SpinLock;

/// Connection ID type — a 32-bit bitmask (broadcast) or counter (unicast).
pub type ConnId = u32;

/// Truncate a u32 cursor to an 8-bit ring index (0..=255).
#[inline]
pub const fn index_of(cursor: u32) -> u8 {
    cursor as u8
}

/// Maximum number of elements in the circular buffer (2^8 = 256).
pub const ELEM_MAX: usize = 256;

// ---------------------------------------------------------------------------
// ConnHead — connection tracking header stored at the start of the shared
// memory region, shared between all producers and consumers.
// ---------------------------------------------------------------------------

/// Broadcast-mode connection head.
/// Each receiver is assigned a unique bit in the bitmask.
#[repr(C)]
pub struct BroadcastConnHead {
    cc: AtomicU32,
    lock: SpinLock,
    constructed: AtomicBool,
}

impl BroadcastConnHead {
    /// Initialise (idempotent via DCLP).
    pub fn init(&self) {
        if !self.constructed.load(Ordering::Acquire) {
            self.lock.lock();
            if !self.constructed.load(Ordering::Relaxed) {
                self.cc.store(0, Ordering::Relaxed);
                self.constructed.store(true, Ordering::Release);
            }
            self.lock.unlock();
        }
    }

    /// Current connection bitmask.
    pub fn connections(&self, order: Ordering) -> ConnId {
        self.cc.load(order)
    }

    /// Connect a new receiver — finds the first zero bit and sets it.
    /// Returns the bit-mask for this receiver, or 0 if full.
    pub fn connect(&self) -> ConnId {
        let mut k = 0u32;
        loop {
            let curr = self.cc.load(Ordering::Acquire);
            let next = curr | (curr.wrapping_add(1)); // set first 0 bit
            if next == curr {
                return 0; // full
            }
            if self
                .cc
                .compare_exchange_weak(curr, next, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                return next ^ curr; // the bit we just set
            }
            crate::spin_lock::adaptive_yield_pub(&mut k);
        }
    }

    /// Disconnect a receiver by clearing its bits from the bitmask.
    /// Returns the resulting bitmask.
    pub fn disconnect(&self, cc_id: ConnId) -> ConnId {
        self.cc.fetch_and(!cc_id, Ordering::AcqRel) & !cc_id
    }

    /// Set a caller-chosen bit rather than the first free one.
    ///
    /// `connect()` picks the first zero bit for an anonymously-joining
    /// broadcast peer; the slot router instead assigns each receiver a
    /// fixed index up front and needs to mark that exact bit as a holder,
    /// so it calls this instead.
    pub fn set_bit(&self, bit: ConnId) {
        self.cc.fetch_or(bit, Ordering::AcqRel);
    }

    /// Whether the given receiver is still connected.
    pub fn connected(&self, cc_id: ConnId) -> bool {
        (self.connections(Ordering::Acquire) & cc_id) != 0
    }

    /// Number of connected receivers (popcount of the bitmask).
    pub fn conn_count(&self, order: Ordering) -> usize {
        self.cc.load(order).count_ones() as usize
    }
}

/// Unicast-mode connection head.
/// Simple counter of connected receivers.
#[repr(C)]
pub struct UnicastConnHead {
    cc: AtomicU32,
    lock: SpinLock,
    constructed: AtomicBool,
}

impl UnicastConnHead {
    pub fn init(&self) {
        if !self.constructed.load(Ordering::Acquire) {
            self.lock.lock();
            if !self.constructed.load(Ordering::Relaxed) {
                self.cc.store(0, Ordering::Relaxed);
                self.constructed.store(true, Ordering::Release);
            }
            self.lock.unlock();
        }
    }

    pub fn connections(&self, order: Ordering) -> ConnId {
        self.cc.load(order)
    }

    pub fn connect(&self) -> ConnId {
        self.cc.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn disconnect(&self, cc_id: ConnId) -> ConnId {
        if cc_id == !0u32 {
            self.cc.store(0, Ordering::Relaxed);
            return 0;
        }
        self.cc.fetch_sub(1, Ordering::Relaxed) - 1
    }

    pub fn connected(&self, cc_id: ConnId) -> bool {
        (self.connections(Ordering::Acquire) != 0) && (cc_id != 0)
    }

    pub fn conn_count(&self, order: Ordering) -> usize {
        self.connections(order) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Zero-initialized `BroadcastConnHead` on the heap; `init()` sets up
    /// the constructed flag.
    fn new_broadcast() -> Box<BroadcastConnHead> {
        let head: Box<BroadcastConnHead> = unsafe {
            let layout = std::alloc::Layout::new::<BroadcastConnHead>();
            let ptr = std::alloc::alloc_zeroed(layout) as *mut BroadcastConnHead;
            Box::from_raw(ptr)
        };
        head.init();
        head
    }

    fn new_unicast() -> Box<UnicastConnHead> {
        let head: Box<UnicastConnHead> = unsafe {
            let layout = std::alloc::Layout::new::<UnicastConnHead>();
            let ptr = std::alloc::alloc_zeroed(layout) as *mut UnicastConnHead;
            Box::from_raw(ptr)
        };
        head.init();
        head
    }

    #[test]
    fn broadcast_initial_state() {
        let h = new_broadcast();
        assert_eq!(h.connections(Ordering::Relaxed), 0);
        assert_eq!(h.conn_count(Ordering::Relaxed), 0);
    }

    #[test]
    fn broadcast_connect_single() {
        let h = new_broadcast();
        let id = h.connect();
        assert_ne!(id, 0);
        assert_eq!(id, 1);
        assert!(h.connected(id));
        assert_eq!(h.conn_count(Ordering::Relaxed), 1);
    }

    #[test]
    fn broadcast_connect_multiple() {
        let h = new_broadcast();
        let id1 = h.connect();
        let id2 = h.connect();
        let id3 = h.connect();

        assert_eq!(id1, 0b001);
        assert_eq!(id2, 0b010);
        assert_eq!(id3, 0b100);

        assert!(h.connected(id1));
        assert!(h.connected(id2));
        assert!(h.connected(id3));
        assert_eq!(h.conn_count(Ordering::Relaxed), 3);
        assert_eq!(h.connections(Ordering::Relaxed), 0b111);
    }

    #[test]
    fn broadcast_connect_full() {
        let h = new_broadcast();
        for i in 0..32 {
            let id = h.connect();
            assert_ne!(id, 0, "bit {i} should succeed");
        }
        assert_eq!(h.conn_count(Ordering::Relaxed), 32);

        for _ in 0..100 {
            assert_eq!(h.connect(), 0, "full — should return 0");
        }
    }

    #[test]
    fn broadcast_disconnect() {
        let h = new_broadcast();
        let id1 = h.connect();
        let id2 = h.connect();
        assert_eq!(h.conn_count(Ordering::Relaxed), 2);

        h.disconnect(id1);
        assert!(!h.connected(id1));
        assert!(h.connected(id2));
        assert_eq!(h.conn_count(Ordering::Relaxed), 1);
    }

    #[test]
    fn broadcast_disconnect_reconnect() {
        let h = new_broadcast();
        let id1 = h.connect();
        let _id2 = h.connect();

        h.disconnect(id1);
        let id3 = h.connect();
        assert_eq!(id3, id1, "should reuse freed bit");
        assert_eq!(h.conn_count(Ordering::Relaxed), 2);
    }

    #[test]
    fn broadcast_full_free_refill() {
        let h = new_broadcast();
        let mut ids = Vec::new();
        for _ in 0..32 {
            ids.push(h.connect());
        }
        assert_eq!(h.connect(), 0);

        let freed = ids[10];
        h.disconnect(freed);
        assert_eq!(h.conn_count(Ordering::Relaxed), 31);

        let new_id = h.connect();
        assert_eq!(new_id, freed);
        assert_eq!(h.conn_count(Ordering::Relaxed), 32);

        assert_eq!(h.connect(), 0);
    }

    #[test]
    fn broadcast_set_bit_marks_deterministic_holder() {
        let h = new_broadcast();
        h.set_bit(1 << 5);
        assert!(h.connected(1 << 5));
        assert_eq!(h.conn_count(Ordering::Relaxed), 1);
        h.disconnect(1 << 5);
        assert_eq!(h.conn_count(Ordering::Relaxed), 0);
    }

    #[test]
    fn unicast_initial_state() {
        let h = new_unicast();
        assert_eq!(h.connections(Ordering::Relaxed), 0);
        assert_eq!(h.conn_count(Ordering::Relaxed), 0);
    }

    #[test]
    fn unicast_connect_single() {
        let h = new_unicast();
        let id = h.connect();
        assert_eq!(id, 1);
        assert!(h.connected(id));
        assert_eq!(h.conn_count(Ordering::Relaxed), 1);
    }

    #[test]
    fn unicast_connect_multiple() {
        let h = new_unicast();
        for i in 1..=100 {
            let id = h.connect();
            assert_eq!(id, i);
        }
        assert_eq!(h.conn_count(Ordering::Relaxed), 100);
    }

    #[test]
    fn unicast_disconnect() {
        let h = new_unicast();
        let id = h.connect();
        assert_eq!(h.conn_count(Ordering::Relaxed), 1);

        h.disconnect(id);
        assert_eq!(h.conn_count(Ordering::Relaxed), 0);
        assert!(!h.connected(0));
    }

    #[test]
    fn unicast_disconnect_all() {
        let h = new_unicast();
        for _ in 0..5 {
            h.connect();
        }
        assert_eq!(h.conn_count(Ordering::Relaxed), 5);

        h.disconnect(!0u32);
        assert_eq!(h.conn_count(Ordering::Relaxed), 0);
    }

    #[test]
    fn broadcast_concurrent_connect() {
        let h = Box::leak(new_broadcast()) as &'static BroadcastConnHead;
        let mut threads = Vec::new();

        for _ in 0..8 {
            threads.push(std::thread::spawn(move || {
                let id = h.connect();
                assert_ne!(id, 0);
                id
            }));
        }

        let mut ids: Vec<u32> = threads.into_iter().map(|t| t.join().unwrap()).collect();
        ids.sort();

        for (i, &id) in ids.iter().enumerate() {
            assert!(id.is_power_of_two(), "id {id:#x} should be power of two");
            if i > 0 {
                assert_ne!(id, ids[i - 1]);
            }
        }

        assert_eq!(h.conn_count(Ordering::Relaxed), 8);

        unsafe { drop(Box::from_raw(h as *const _ as *mut BroadcastConnHead)) };
    }
}
