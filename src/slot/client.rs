// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Read side of the slot router: a receiver process attaches a read-only
// `SlotManager` plus its own free/available queue pair, and consumes
// published slots without ever copying their payload.

use std::sync::Mutex;

use crate::error::{IpcError, Result};

use super::manager::SlotManager;
use super::queue::SlotQueue;
use super::server::ReceiverConnState;
use super::token::SlotToken;

/// The read (client) side of a slot router.
pub struct Client {
    manager: SlotManager,
    free_queue: SlotQueue,
    available_queue: SlotQueue,
    state: Mutex<ReceiverConnState>,
}

impl Client {
    pub fn new(manager: SlotManager, free_queue: SlotQueue, available_queue: SlotQueue) -> Self {
        Self {
            manager,
            free_queue,
            available_queue,
            state: Mutex::new(ReceiverConnState::Ok),
        }
    }

    pub fn manager(&self) -> &SlotManager {
        &self.manager
    }

    /// `ReceiveSlot` — `Ok(None)` if nothing is available yet, including
    /// the case where an index has been queued but its global-visibility
    /// flag hasn't been observed set yet (the publisher set the flag
    /// before pushing the index, so this should be rare and momentary,
    /// not a sign of corruption).
    pub fn receive_slot(&self) -> Result<Option<SlotToken>> {
        if *self.state.lock().unwrap() == ReceiverConnState::ProtocolError {
            return Err(IpcError::ProtocolError(
                "receiver is in a protocol-error state",
            ));
        }
        let Some(peeked) = self.available_queue.peek() else {
            return Ok(None);
        };
        if !self.manager.is_globally_visible(peeked) {
            return Ok(None);
        }
        let popped = self
            .available_queue
            .pop()
            .expect("peek just returned Some for the same queue");
        if popped != peeked {
            *self.state.lock().unwrap() = ReceiverConnState::ProtocolError;
            return Err(IpcError::ProtocolError(
                "available queue peek/pop observed different values",
            ));
        }
        let handle = self
            .manager
            .get_slot_handle_for_index(popped)
            .ok_or(IpcError::ProtocolError("published slot index out of range"))?;
        let token = self
            .manager
            .get_slot_access_token(handle)
            .ok_or(IpcError::ProtocolError("published slot already checked out"))?;
        Ok(Some(token))
    }

    /// `AccessSlotContent`.
    pub fn access_slot_content<'a>(&'a self, token: &SlotToken) -> &'a [u8] {
        self.manager.slot_payload(token)
    }

    /// `ReleaseSlot` — return the token and push its index onto the free
    /// queue so the server's `ReclaimSlots` can reuse it.
    pub fn release_slot(&self, token: SlotToken) -> Result<()> {
        let index = token.index();
        self.manager.return_slot_access_token(token)?;
        if !self.free_queue.push(index) {
            // The free queue is sized to the slot count, so this can only
            // happen if the server hasn't drained it in a very long time.
            return Err(IpcError::ResourceExhausted(
                "free queue is full; server has not called ReclaimSlots",
            ));
        }
        Ok(())
    }

    /// `SetCommunicationError` (client side — marks this client's own
    /// view unhealthy, e.g. after observing a protocol violation).
    pub fn set_communication_error(&self) {
        *self.state.lock().unwrap() = ReceiverConnState::ProtocolError;
    }

    pub fn connection_state(&self) -> ReceiverConnState {
        *self.state.lock().unwrap()
    }
}
