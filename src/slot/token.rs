// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Move-only access token for a Core B slot. Grounded on the teacher's
// `ScopedAccess` RAII guard (scoped_access.rs): both represent exclusive
// access that must be given back through an explicit API call rather than
// dropped silently, because the thing being guarded lives in shared memory
// where "just let the destructor run" can't coordinate with another
// process the way it can with a local lock.

/// A linear handle granting exclusive access to one slot's payload bytes.
///
/// Obtained from [`super::manager::SlotManager::get_slot_access_token`] and
/// must be consumed by returning it ([`super::manager::SlotManager::return_slot_access_token`]),
/// publishing it ([`super::server::Server::send_slot`]), or releasing it
/// ([`super::client::Client::release_slot`]). Dropping one without doing
/// so is a programming error: the generation counter it was checked out
/// under would otherwise leak, permanently stranding the slot, so this
/// aborts the process instead of leaking quietly.
pub struct SlotToken {
    index: u32,
    generation: u32,
    consumed: bool,
}

impl SlotToken {
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Self {
            index,
            generation,
            consumed: false,
        }
    }

    /// The slot index this token grants access to.
    pub fn index(&self) -> u32 {
        self.index
    }

    pub(crate) fn generation(&self) -> u32 {
        self.generation
    }

    /// Mark the token as properly disposed of. Only called from within
    /// `slot::manager`/`slot::server`/`slot::client` once the
    /// corresponding shared-memory state transition has been made.
    pub(crate) fn consume(mut self) {
        self.consumed = true;
    }
}

impl std::fmt::Debug for SlotToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotToken")
            .field("index", &self.index)
            .field("generation", &self.generation)
            .finish()
    }
}

impl Drop for SlotToken {
    fn drop(&mut self) {
        if !self.consumed {
            eprintln!(
                "SlotToken for slot {} (generation {}) dropped without being returned, \
                 published, or released — aborting",
                self.index, self.generation
            );
            std::process::abort();
        }
    }
}
