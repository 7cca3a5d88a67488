// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Single-producer / single-consumer byte ring over a shared-memory region.
// Generalizes the teacher's `proto::shm_ring` (a ring of fixed-width `T`
// values with a write/commit and read/commit split) to a raw byte ring of
// variable-length frames, since messages here are not fixed-width records.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::shm::ShmRegion;

#[repr(C)]
struct Header {
    constructed: AtomicBool,
    _pad0: [u8; 7],
    head: AtomicU64,
    _pad1: [u8; 64 - 8],
    tail: AtomicU64,
    _pad2: [u8; 64 - 8],
    notify_request: AtomicBool,
    _pad3: [u8; 7],
}

const HEADER_SIZE: usize = std::mem::size_of::<Header>();

/// Total region size (header + data) needed to host a ring with `capacity`
/// data bytes. Callers size a [`ShmRegion`] with this before calling
/// [`Ring::attach`].
pub const fn region_size_for_capacity(capacity: usize) -> usize {
    HEADER_SIZE + capacity
}

/// A byte ring buffer: capacity `C`, writer-owned head, reader-owned tail,
/// both monotonic counters (never wrapped back to a small modulus — the
/// wrap ambiguity the spec worries about is moot with a 64-bit counter).
///
/// One side must only ever call the writer methods, the other only the
/// reader methods — this is not enforced by the type, matching the
/// teacher's own single-writer/single-reader discipline in `shm_ring`.
pub struct Ring {
    region: Arc<dyn ShmRegion>,
    capacity: usize,
}

impl Ring {
    /// Wrap an already-sized region as a ring, initializing the header on
    /// first use (detected via the `constructed` flag, same
    /// double-checked-locking-free idiom `proto::shm_ring` uses).
    pub fn attach(region: Arc<dyn ShmRegion>) -> Self {
        assert!(
            region.len() > HEADER_SIZE,
            "ring region too small for header"
        );
        let capacity = region.len() - HEADER_SIZE;
        let ring = Self { region, capacity };
        let hdr = ring.header();
        if !hdr.constructed.load(Ordering::Acquire) {
            hdr.head.store(0, Ordering::Relaxed);
            hdr.tail.store(0, Ordering::Relaxed);
            hdr.notify_request.store(false, Ordering::Relaxed);
            hdr.constructed.store(true, Ordering::Release);
        }
        ring
    }

    /// Data capacity in bytes (excludes the header).
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn header(&self) -> &Header {
        unsafe { &*(self.region.as_ptr() as *const Header) }
    }

    fn data_ptr(&self) -> *mut u8 {
        unsafe { self.region.as_mut_ptr().add(HEADER_SIZE) }
    }

    fn copy_in(&self, at: u64, data: &[u8]) {
        let cap = self.capacity;
        let offset = (at % cap as u64) as usize;
        let base = self.data_ptr();
        let first = (cap - offset).min(data.len());
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), base.add(offset), first);
            if first < data.len() {
                std::ptr::copy_nonoverlapping(
                    data.as_ptr().add(first),
                    base,
                    data.len() - first,
                );
            }
        }
    }

    fn copy_out(&self, at: u64, out: &mut [u8]) {
        let cap = self.capacity;
        let offset = (at % cap as u64) as usize;
        let base = self.data_ptr();
        let first = (cap - offset).min(out.len());
        unsafe {
            std::ptr::copy_nonoverlapping(base.add(offset), out.as_mut_ptr(), first);
            if first < out.len() {
                std::ptr::copy_nonoverlapping(base, out.as_mut_ptr().add(first), out.len() - first);
            }
        }
    }

    // --- writer side ---

    /// Bytes free for the writer right now.
    pub fn writable_len(&self) -> usize {
        let hdr = self.header();
        let head = hdr.head.load(Ordering::Relaxed);
        let tail = hdr.tail.load(Ordering::Acquire);
        self.capacity - (head.wrapping_sub(tail) as usize)
    }

    /// Attempt to push `data` as one contiguous frame.
    ///
    /// Succeeds iff the ring currently has `data.len()` bytes free; never
    /// partially writes. On failure, sets the "please wake me when
    /// writable" bit and re-checks available space once more before
    /// giving up, so a reader that freed space between the first check
    /// and the bit being set isn't missed (the classic lost-wakeup
    /// avoidance).
    pub fn try_write(&self, data: &[u8]) -> bool {
        let hdr = self.header();
        let head = hdr.head.load(Ordering::Relaxed);
        let tail = hdr.tail.load(Ordering::Acquire);
        let used = head.wrapping_sub(tail) as usize;
        if data.len() > self.capacity - used {
            hdr.notify_request.store(true, Ordering::Release);
            let tail2 = hdr.tail.load(Ordering::Acquire);
            let used2 = head.wrapping_sub(tail2) as usize;
            if data.len() > self.capacity - used2 {
                return false;
            }
        }
        self.copy_in(head, data);
        hdr.head.store(head.wrapping_add(data.len() as u64), Ordering::Release);
        true
    }

    // --- reader side ---

    /// Bytes currently available for the reader.
    pub fn readable_len(&self) -> usize {
        let hdr = self.header();
        let head = hdr.head.load(Ordering::Acquire);
        let tail = hdr.tail.load(Ordering::Relaxed);
        head.wrapping_sub(tail) as usize
    }

    /// Copy `out.len()` bytes starting at the current tail, without
    /// advancing it. Returns `false` if fewer than `out.len()` bytes are
    /// available.
    pub fn peek(&self, out: &mut [u8]) -> bool {
        if self.readable_len() < out.len() {
            return false;
        }
        let tail = self.header().tail.load(Ordering::Relaxed);
        self.copy_out(tail, out);
        true
    }

    /// Advance the tail by `len` bytes (previously returned by [`peek`]).
    ///
    /// Returns `true` if this read just crossed the "significant free
    /// space" threshold (capacity / 4) from below while the writer had a
    /// pending wake-me request — i.e. the caller must now send a
    /// writable-again notification.
    ///
    /// [`peek`]: Ring::peek
    pub fn commit_read(&self, len: usize) -> bool {
        let hdr = self.header();
        let tail = hdr.tail.load(Ordering::Relaxed);
        let head = hdr.head.load(Ordering::Acquire);
        let used_before = head.wrapping_sub(tail) as usize;
        let free_before = self.capacity - used_before;
        hdr.tail.store(tail.wrapping_add(len as u64), Ordering::Release);
        let free_after = free_before + len;
        let threshold = self.capacity / 4;
        if free_before < threshold && free_after >= threshold {
            return hdr.notify_request.swap(false, Ordering::AcqRel);
        }
        false
    }

    pub fn is_empty(&self) -> bool {
        self.readable_len() == 0
    }
}
