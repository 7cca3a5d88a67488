// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Out-of-band one-byte notification channel. FIFO delivery, built on the
// same byte ring as the data path (ring.rs) for the queue itself, plus
// the teacher's `Waiter` (condvar + mutex + quit flag) for OS-level
// wakeups — this is exactly the "send a byte, wake the other side" job
// `Waiter` already does in the teacher's channel implementation.

use std::sync::Arc;

use crate::error::{IpcError, Result};
use crate::ring::Ring;
use crate::shm::ShmRegion;
use crate::waiter::Waiter;

/// Highest user-addressable notification value. 250..=255 are reserved
/// for internal SafeIPC signals.
pub const USER_MAX: u8 = 249;

/// Internal notification codepoints (see DESIGN.md for why these exact
/// values were picked — the source enumerates the existence of such
/// codepoints but not their numeric assignment).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Internal {
    DataWritten = 250,
    WritableAgain = 251,
    OrderlyCloseBegin = 252,
    HandleExchangeCompleted = 253,
    ProtocolErrorObserved = 254,
    // 255 is reserved/unused.
}

impl TryFrom<u8> for Internal {
    type Error = ();

    fn try_from(v: u8) -> std::result::Result<Self, ()> {
        match v {
            250 => Ok(Internal::DataWritten),
            251 => Ok(Internal::WritableAgain),
            252 => Ok(Internal::OrderlyCloseBegin),
            253 => Ok(Internal::HandleExchangeCompleted),
            254 => Ok(Internal::ProtocolErrorObserved),
            _ => Err(()),
        }
    }
}

/// One direction of the out-of-band notification channel.
pub struct NotificationChannel {
    ring: Ring,
    waiter: Waiter,
}

impl NotificationChannel {
    pub fn attach(region: Arc<dyn ShmRegion>, waiter_name: &str) -> Result<Self> {
        let ring = Ring::attach(region);
        let waiter = Waiter::open(waiter_name).map_err(IpcError::System)?;
        Ok(Self { ring, waiter })
    }

    /// Send a user notification value (must be `<= USER_MAX`).
    pub fn send_user(&self, value: u8) -> Result<()> {
        if value > USER_MAX {
            return Err(IpcError::ApiMisuse("notification value exceeds USER_MAX"));
        }
        self.send_raw(value)
    }

    pub(crate) fn send_internal(&self, value: Internal) -> Result<()> {
        self.send_raw(value as u8)
    }

    fn send_raw(&self, value: u8) -> Result<()> {
        if !self.ring.try_write(&[value]) {
            return Err(IpcError::ResourceExhausted(
                "notification channel is at OS-level capacity",
            ));
        }
        self.waiter.notify().map_err(IpcError::System)?;
        Ok(())
    }

    /// Non-blocking receive of the next queued notification byte, if any.
    pub fn try_recv(&self) -> Option<u8> {
        let mut b = [0u8];
        if self.ring.peek(&mut b) {
            self.ring.commit_read(1);
            Some(b[0])
        } else {
            None
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Block until at least one notification is queued, quit is signalled,
    /// or `timeout_ms` elapses. Returns `false` on timeout.
    pub fn wait(&self, timeout_ms: Option<u64>) -> Result<bool> {
        self.waiter
            .wait_if(|| self.ring.is_empty(), timeout_ms)
            .map_err(IpcError::System)
    }

    /// Wake any thread blocked in [`wait`](Self::wait) and make future
    /// calls return immediately. Used to stop a connection's completion
    /// thread during `Close`.
    pub fn quit(&self) -> Result<()> {
        self.waiter.quit_waiting().map_err(IpcError::System)
    }
}
