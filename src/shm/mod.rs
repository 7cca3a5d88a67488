// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Cross-platform shared memory handle.
// Delegates to platform::PlatformShm (POSIX or Windows).

use std::io;

use crate::platform::PlatformShm;

/// Open mode for shared memory segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShmOpenMode {
    /// Create exclusively — fail if already exists.
    Create,
    /// Open existing — fail if it does not exist.
    Open,
    /// Create if missing, open if it already exists.
    CreateOrOpen,
}

/// A named, inter-process shared memory region.
///
/// Binary-compatible with `ipc::shm::handle` from the C++ libipc library.
/// The memory layout includes a trailing `atomic<int32_t>` reference counter
/// that is shared between all processes mapping the same segment.
pub struct ShmHandle {
    inner: PlatformShm,
}

impl ShmHandle {
    /// Acquire a named shared memory region of `size` bytes (user-visible).
    ///
    /// The actual mapped region is slightly larger to hold the ref counter.
    pub fn acquire(name: &str, size: usize, mode: ShmOpenMode) -> io::Result<Self> {
        #[cfg(unix)]
        let platform_mode = match mode {
            ShmOpenMode::Create => crate::platform::posix::ShmMode::Create,
            ShmOpenMode::Open => crate::platform::posix::ShmMode::Open,
            ShmOpenMode::CreateOrOpen => crate::platform::posix::ShmMode::CreateOrOpen,
        };
        #[cfg(windows)]
        let platform_mode = match mode {
            ShmOpenMode::Create => crate::platform::windows::ShmMode::Create,
            ShmOpenMode::Open => crate::platform::windows::ShmMode::Open,
            ShmOpenMode::CreateOrOpen => crate::platform::windows::ShmMode::CreateOrOpen,
        };

        let inner = PlatformShm::acquire(name, size, platform_mode)?;
        Ok(Self { inner })
    }

    /// Pointer to the start of the user-visible shared memory region.
    pub fn as_ptr(&self) -> *const u8 {
        self.inner.as_ptr()
    }

    /// Mutable pointer to the start of the user-visible shared memory region.
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.inner.as_mut_ptr()
    }

    /// Total mapped size (including the trailing ref counter).
    pub fn mapped_size(&self) -> usize {
        self.inner.mapped_size()
    }

    /// User-requested size (the usable portion).
    pub fn user_size(&self) -> usize {
        self.inner.user_size()
    }

    /// The platform name used to open the segment.
    #[cfg(unix)]
    pub fn name(&self) -> &str {
        self.inner.name()
    }

    /// Current reference count (number of processes/handles mapping this segment).
    pub fn ref_count(&self) -> i32 {
        self.inner.ref_count()
    }

    /// Force-remove the backing file / kernel object.
    pub fn unlink(&self) {
        self.inner.unlink();
    }

    /// Mutable pointer to the user-visible region (alias for `as_mut_ptr`).
    /// Matches C++ `shm::handle::get()`.
    pub fn get(&self) -> *mut u8 {
        self.inner.as_mut_ptr()
    }

    /// Remove a named shm segment by name without needing an open handle.
    pub fn unlink_by_name(name: &str) {
        PlatformShm::unlink_by_name(name);
    }

    /// Remove the backing storage for a named shm segment.
    pub fn clear_storage(name: &str) {
        PlatformShm::unlink_by_name(name);
    }
}

// ---------------------------------------------------------------------------
// ShmProvider / ShmRegion — the allocator seam the core depends on.
//
// ring.rs and slot::manager never call ShmHandle directly: they go through
// these traits so a host application can swap in its own shared-memory
// allocator (the AUTOSAR Adaptive platform typically owns this). The crate
// ships PosixShmProvider as the default so it's usable standalone.
// ---------------------------------------------------------------------------

use std::sync::Arc;

/// A single mapped shared-memory region.
pub trait ShmRegion: Send + Sync {
    fn as_ptr(&self) -> *const u8;
    fn as_mut_ptr(&self) -> *mut u8;
    fn len(&self) -> usize;
}

/// Acquires and releases named shared-memory regions.
///
/// Implementations decide how a region outlives the handle returned here —
/// `PosixShmProvider` keeps it alive exactly as long as some `Arc<dyn
/// ShmRegion>` referencing it exists, matching `ShmHandle`'s ref-counted
/// unlink-on-last-release behaviour.
pub trait ShmProvider: Send + Sync {
    fn create_or_open(&self, name: &str, size: usize) -> io::Result<Arc<dyn ShmRegion>>;
    fn open_existing(&self, name: &str, size: usize) -> io::Result<Arc<dyn ShmRegion>>;
    fn remove(&self, name: &str);
}

struct PosixShmRegion {
    handle: ShmHandle,
}

impl ShmRegion for PosixShmRegion {
    fn as_ptr(&self) -> *const u8 {
        self.handle.as_ptr()
    }

    fn as_mut_ptr(&self) -> *mut u8 {
        self.handle.as_mut_ptr()
    }

    fn len(&self) -> usize {
        self.handle.user_size()
    }
}

/// Default [`ShmProvider`], backed directly by [`ShmHandle`].
///
/// Named after POSIX for historical reasons (it was the first target) but
/// this works on Windows too, since [`ShmHandle`] already dispatches to
/// `platform::windows` there.
#[derive(Default)]
pub struct PosixShmProvider;

impl PosixShmProvider {
    pub const fn new() -> Self {
        Self
    }
}

impl ShmProvider for PosixShmProvider {
    fn create_or_open(&self, name: &str, size: usize) -> io::Result<Arc<dyn ShmRegion>> {
        let handle = ShmHandle::acquire(name, size, ShmOpenMode::CreateOrOpen)?;
        Ok(Arc::new(PosixShmRegion { handle }))
    }

    fn open_existing(&self, name: &str, size: usize) -> io::Result<Arc<dyn ShmRegion>> {
        let handle = ShmHandle::acquire(name, size, ShmOpenMode::Open)?;
        Ok(Arc::new(PosixShmRegion { handle }))
    }

    fn remove(&self, name: &str) {
        ShmHandle::clear_storage(name);
    }
}

/// A byte-range view into another region, so one shared-memory mapping can
/// host more than one logical structure (e.g. the notification area packs
/// a client→server and a server→client byte ring back to back).
struct SubRegion {
    parent: Arc<dyn ShmRegion>,
    offset: usize,
    len: usize,
}

impl SubRegion {
    /// Carve out `[offset, offset + len)` of `parent`. Panics if the range
    /// doesn't fit — this is a programming error in the caller, not a
    /// runtime condition.
    pub fn new(parent: Arc<dyn ShmRegion>, offset: usize, len: usize) -> Arc<dyn ShmRegion> {
        assert!(
            offset.checked_add(len).is_some_and(|end| end <= parent.len()),
            "sub-region out of bounds"
        );
        Arc::new(Self { parent, offset, len })
    }
}

impl ShmRegion for SubRegion {
    fn as_ptr(&self) -> *const u8 {
        unsafe { self.parent.as_ptr().add(self.offset) }
    }

    fn as_mut_ptr(&self) -> *mut u8 {
        unsafe { self.parent.as_mut_ptr().add(self.offset) }
    }

    fn len(&self) -> usize {
        self.len
    }
}

/// Split a region into two equal-sized, non-overlapping halves.
pub fn split_region_in_half(region: Arc<dyn ShmRegion>) -> (Arc<dyn ShmRegion>, Arc<dyn ShmRegion>) {
    let half = region.len() / 2;
    let first = SubRegion::new(Arc::clone(&region), 0, half);
    let second = SubRegion::new(region, half, half);
    (first, second)
}
