// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Fixed-size array of slot descriptors plus their payload bytes, all in
// one shared-memory region. Grounded on the teacher's `chunk_storage.rs`
// (`ChunkInfo` free-list bookkeeping for fixed-size chunks) for the
// "preallocated array of fixed-size records with per-record state"
// shape, and on `circ::BroadcastConnHead` for the per-slot holder
// bitmask (reused directly rather than re-implemented).
//
// A slot's lifecycle is encoded with two bits rather than an explicit
// state enum:
//   owned-by-server:  checked_out = true,  globally_visible = false
//   published:        checked_out = false, globally_visible = true
//   reclaimable:      checked_out = false, globally_visible = false
// `checked_out` and `globally_visible` are never both true: a slot is
// either being written (exclusive) or has been handed off to readers.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use crate::circ::BroadcastConnHead;
use crate::error::{IpcError, Result};
use crate::shm::ShmRegion;

use super::token::SlotToken;

/// Handle to one slot's descriptor, valid for the lifetime of the
/// [`SlotManager`] it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotHandle(u32);

impl SlotHandle {
    pub fn index(&self) -> u32 {
        self.0
    }
}

#[repr(C)]
struct Descriptor {
    holders: BroadcastConnHead,
    globally_visible: AtomicBool,
    checked_out: AtomicBool,
    generation: AtomicU32,
}

const DESC_SIZE: usize = std::mem::size_of::<Descriptor>();

#[repr(C)]
struct Header {
    constructed: AtomicBool,
}

const HEADER_SIZE: usize = std::mem::size_of::<Header>();

/// Owns (when `writable`) or observes (when read-only) a fixed-size array
/// of slot descriptors and their payload storage.
///
/// Both a `slot::Server` and every `slot::Client` attach their own
/// `SlotManager` to the same shared region — `writable` just gates which
/// side is allowed to grow the descriptor table (`add_slot`) and is a
/// logical discipline, not a hardware memory-protection boundary: the
/// descriptor atomics (`checked_out`, `generation`, the holder bitmask)
/// are mutated from both sides by design.
pub struct SlotManager {
    region: Arc<dyn ShmRegion>,
    slot_count: usize,
    slot_size: usize,
    writable: bool,
    next_slot: AtomicU32,
}

impl SlotManager {
    /// Total region size needed to host `slot_count` slots of `slot_size`
    /// payload bytes each.
    pub const fn region_size(slot_count: usize, slot_size: usize) -> usize {
        HEADER_SIZE + slot_count * DESC_SIZE + slot_count * slot_size
    }

    /// Attach to a region sized via [`Self::region_size`].
    ///
    /// Only the writable (server) side should actually perform the
    /// initialization; a read-only attach assumes the writable side has
    /// already constructed the header (or races harmlessly to the same
    /// result, since all fields reset to their zero value either way).
    pub fn attach(
        region: Arc<dyn ShmRegion>,
        slot_count: usize,
        slot_size: usize,
        writable: bool,
    ) -> Self {
        assert!(
            region.len() >= Self::region_size(slot_count, slot_size),
            "slot region too small for requested slot_count/slot_size"
        );
        let manager = Self {
            region,
            slot_count,
            slot_size,
            writable,
            next_slot: AtomicU32::new(0),
        };
        let hdr = manager.header();
        if writable && !hdr.constructed.load(Ordering::Acquire) {
            for i in 0..slot_count {
                let d = manager.descriptor(i);
                d.holders.init();
                d.globally_visible.store(false, Ordering::Relaxed);
                d.checked_out.store(false, Ordering::Relaxed);
                d.generation.store(0, Ordering::Relaxed);
            }
            hdr.constructed.store(true, Ordering::Release);
        }
        manager
    }

    pub fn is_managing_writable_slot_descriptors(&self) -> bool {
        self.writable
    }

    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    fn header(&self) -> &Header {
        unsafe { &*(self.region.as_ptr() as *const Header) }
    }

    fn descriptor(&self, index: usize) -> &Descriptor {
        assert!(index < self.slot_count, "slot index out of range");
        unsafe {
            let base = self.region.as_ptr().add(HEADER_SIZE) as *const Descriptor;
            &*base.add(index)
        }
    }

    fn payload_ptr(&self, index: u32) -> *mut u8 {
        let descriptors_len = self.slot_count * DESC_SIZE;
        unsafe {
            self.region
                .as_mut_ptr()
                .add(HEADER_SIZE + descriptors_len + index as usize * self.slot_size)
        }
    }

    /// Hand back access to the payload bytes a token was issued for.
    ///
    /// # Safety contract
    /// Callers must not retain this slice past the token's consumption.
    pub fn slot_payload_mut(&self, token: &SlotToken) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.payload_ptr(token.index()), self.slot_size) }
    }

    pub fn slot_payload(&self, token: &SlotToken) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.payload_ptr(token.index()), self.slot_size) }
    }

    /// `AddSlot` — admits the next not-yet-issued descriptor index, up to
    /// `slot_count`. Writable side only: this implementation preallocates
    /// the full descriptor array at `attach` time, so `AddSlot` is really
    /// "claim the next slot for bookkeeping" rather than a true dynamic
    /// growth operation.
    pub fn add_slot(&self) -> Result<SlotHandle> {
        if !self.writable {
            return Err(IpcError::ApiMisuse(
                "add_slot called on a read-only slot manager",
            ));
        }
        let next = self.next_slot.fetch_add(1, Ordering::Relaxed);
        if next as usize >= self.slot_count {
            self.next_slot.fetch_sub(1, Ordering::Relaxed);
            return Err(IpcError::ResourceExhausted("slot descriptor table is full"));
        }
        Ok(SlotHandle(next))
    }

    pub fn get_slot_handle_for_index(&self, index: u32) -> Option<SlotHandle> {
        if (index as usize) < self.slot_count {
            Some(SlotHandle(index))
        } else {
            None
        }
    }

    /// `GetSlotAccessToken` — `None` if already checked out.
    pub fn get_slot_access_token(&self, handle: SlotHandle) -> Option<SlotToken> {
        let d = self.descriptor(handle.0 as usize);
        if d.checked_out
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let generation = d.generation.load(Ordering::Relaxed);
            Some(SlotToken::new(handle.0, generation))
        } else {
            None
        }
    }

    fn stale_or_checked_in(&self, d: &Descriptor, token: &SlotToken) -> bool {
        d.generation.load(Ordering::Acquire) != token.generation()
    }

    /// `ReturnSlotAccessToken` — hands the slot back without publishing
    /// it, bumping the generation so any other reference to the same
    /// token value (there shouldn't be one; this is belt-and-braces)
    /// is recognized as stale.
    pub fn return_slot_access_token(&self, token: SlotToken) -> Result<()> {
        let d = self.descriptor(token.index() as usize);
        if self.stale_or_checked_in(d, &token) {
            token.consume();
            return Err(IpcError::ProtocolError("stale slot token returned"));
        }
        d.generation.fetch_add(1, Ordering::Relaxed);
        d.checked_out.store(false, Ordering::Release);
        token.consume();
        Ok(())
    }

    /// Used by `slot::Server::send_slot`: clears `checked_out` without
    /// bumping the generation, since the token's holder (the server)
    /// still implicitly "owns" the write that just happened and nothing
    /// about the slot's identity changed — only its visibility did.
    pub(super) fn finish_publish(&self, token: SlotToken) {
        let d = self.descriptor(token.index() as usize);
        d.checked_out.store(false, Ordering::Release);
        token.consume();
    }

    pub(super) fn mark_published(&self, index: u32) {
        self.descriptor(index as usize)
            .globally_visible
            .store(true, Ordering::Release);
    }

    pub(super) fn mark_reclaimable_if_unheld(&self, index: u32) {
        let d = self.descriptor(index as usize);
        if d.holders.conn_count(Ordering::Acquire) == 0 {
            d.globally_visible.store(false, Ordering::Release);
        }
    }

    pub fn is_globally_visible(&self, index: u32) -> bool {
        self.descriptor(index as usize)
            .globally_visible
            .load(Ordering::Acquire)
    }

    pub(super) fn holders(&self, index: u32) -> &BroadcastConnHead {
        &self.descriptor(index as usize).holders
    }

    /// Bounds-checked variant of [`Self::holders`] for indices that came
    /// out of a receiver-writable queue rather than from a token the
    /// server itself issued — `descriptor` asserts in-range, which would
    /// abort the process on a corrupt or malicious index.
    pub(super) fn holders_checked(&self, index: u32) -> Option<&BroadcastConnHead> {
        if (index as usize) < self.slot_count {
            Some(&self.descriptor(index as usize).holders)
        } else {
            None
        }
    }

    /// Slots that are neither checked out nor currently published —
    /// candidates for `Server::acquire_slot`.
    pub(super) fn is_free(&self, index: u32) -> bool {
        let d = self.descriptor(index as usize);
        !d.checked_out.load(Ordering::Acquire) && !d.globally_visible.load(Ordering::Acquire)
    }
}
