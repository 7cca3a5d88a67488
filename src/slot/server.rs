// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Write side of the slot router: one process owns a writable
// `SlotManager` and publishes slots to a set of registered receivers,
// each charged against a per-class concurrent in-flight budget. Grounded
// on the teacher's `proto::shm_ring` writer half for the publish/queue
// shape, and on `circ::BroadcastConnHead` for tracking which receivers
// still hold a given slot.

use std::sync::Mutex;

use crate::error::{IpcError, Result};

use super::manager::SlotManager;
use super::queue::SlotQueue;
use super::token::SlotToken;

/// Observed health of a registered receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverConnState {
    Ok,
    /// The receiver's process is gone (its registered pid no longer
    /// exists) without having been told to leave — a crash, a kill
    /// signal, an OOM kill.
    PeerCrashed,
    /// The receiver left through an explicit, out-of-band departure
    /// signal (see [`Server::mark_receiver_disconnected`]) rather than
    /// being found dead by a liveness probe.
    PeerDisconnected,
    ProtocolError,
}

/// Opaque handle to a registered receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiverHandle(usize);

/// A receiver class: a budget of concurrently in-flight slots shared by
/// every receiver registered under it. Exceeding the budget on a given
/// publication drops that slot for every receiver in the class, rather
/// than for just the offending one — the budget models a downstream
/// resource (e.g. a bounded worker pool) the whole class competes for.
#[derive(Debug, Clone, Copy)]
struct ClassState {
    budget: u32,
    in_flight: u32,
}

struct ReceiverEntry {
    free_queue: SlotQueue,
    available_queue: SlotQueue,
    class: usize,
    state: ReceiverConnState,
    /// The receiving process's pid, if known, used by
    /// [`Server::refresh_receiver_health`] to detect a crash. `None` on
    /// platforms or call sites that never supply one; such a receiver can
    /// only ever be deregistered by explicit API calls, never by an
    /// automatic liveness probe.
    peer_pid: Option<u32>,
}

/// Result of one [`Server::send_slot`] call: which receiver classes had
/// the slot dropped for budget-exhaustion reasons.
#[derive(Debug, Default)]
pub struct DroppedInfo {
    pub dropped_classes: Vec<usize>,
}

fn bit_for(receiver_index: usize) -> u32 {
    1u32 << receiver_index
}

/// The write (server) side of a slot router.
pub struct Server {
    manager: SlotManager,
    max_receivers: usize,
    classes: Mutex<Vec<ClassState>>,
    receivers: Mutex<Vec<Option<ReceiverEntry>>>,
}

impl Server {
    pub fn new(manager: SlotManager, max_receivers: usize) -> Result<Self> {
        if !manager.is_managing_writable_slot_descriptors() {
            return Err(IpcError::ApiMisuse(
                "slot::Server requires a writable SlotManager",
            ));
        }
        if max_receivers > 32 {
            return Err(IpcError::ApiMisuse(
                "slot router supports at most 32 receivers (32-bit holder bitmask)",
            ));
        }
        Ok(Self {
            manager,
            max_receivers,
            classes: Mutex::new(Vec::new()),
            receivers: Mutex::new(Vec::new()),
        })
    }

    pub fn manager(&self) -> &SlotManager {
        &self.manager
    }

    /// Register a new receiver class with a concurrent in-flight budget.
    /// Returns the class id used by [`Self::register_receiver`].
    pub fn register_class(&self, budget: u32) -> usize {
        let mut classes = self.classes.lock().unwrap();
        classes.push(ClassState { budget, in_flight: 0 });
        classes.len() - 1
    }

    /// `CanRegisterReceiver`.
    pub fn can_register_receiver(&self) -> bool {
        let receivers = self.receivers.lock().unwrap();
        receivers.iter().filter(|r| r.is_some()).count() < self.max_receivers
    }

    /// `RegisterReceiver`. `peer_pid`, when known, enables automatic
    /// crash detection via [`Self::refresh_receiver_health`]; pass `None`
    /// if the receiver's process id isn't available.
    pub fn register_receiver(
        &self,
        class: usize,
        free_queue: SlotQueue,
        available_queue: SlotQueue,
        peer_pid: Option<u32>,
    ) -> Result<ReceiverHandle> {
        let mut receivers = self.receivers.lock().unwrap();
        if self.classes.lock().unwrap().get(class).is_none() {
            return Err(IpcError::ApiMisuse("unknown receiver class"));
        }
        let entry = ReceiverEntry {
            free_queue,
            available_queue,
            class,
            state: ReceiverConnState::Ok,
            peer_pid,
        };
        for (i, slot) in receivers.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(entry);
                return Ok(ReceiverHandle(i));
            }
        }
        if receivers.len() >= self.max_receivers {
            return Err(IpcError::ResourceExhausted("receiver table is full"));
        }
        receivers.push(Some(entry));
        Ok(ReceiverHandle(receivers.len() - 1))
    }

    /// `GetReceiverConnectionState`.
    pub fn get_receiver_connection_state(&self, receiver: ReceiverHandle) -> Result<ReceiverConnState> {
        let receivers = self.receivers.lock().unwrap();
        receivers
            .get(receiver.0)
            .and_then(|e| e.as_ref())
            .map(|e| e.state)
            .ok_or(IpcError::ApiMisuse("unknown receiver handle"))
    }

    /// `SetCommunicationError` — marks a receiver unhealthy; future
    /// `SendSlot`/`ReclaimSlots` passes skip it until `RemoveReceiver`.
    pub fn set_communication_error(&self, receiver: ReceiverHandle) -> Result<()> {
        let mut receivers = self.receivers.lock().unwrap();
        let entry = receivers
            .get_mut(receiver.0)
            .and_then(|e| e.as_mut())
            .ok_or(IpcError::ApiMisuse("unknown receiver handle"))?;
        entry.state = ReceiverConnState::ProtocolError;
        Ok(())
    }

    /// Marks a receiver as having left through an explicit, out-of-band
    /// departure signal (not detected by this router itself — the caller
    /// learned it some other way, e.g. its own supervision channel),
    /// distinct from [`Self::refresh_receiver_health`] finding the
    /// process simply gone. Future `SendSlot`/`ReclaimSlots` passes skip
    /// it until `RemoveReceiver`.
    pub fn mark_receiver_disconnected(&self, receiver: ReceiverHandle) -> Result<()> {
        let mut receivers = self.receivers.lock().unwrap();
        let entry = receivers
            .get_mut(receiver.0)
            .and_then(|e| e.as_mut())
            .ok_or(IpcError::ApiMisuse("unknown receiver handle"))?;
        entry.state = ReceiverConnState::PeerDisconnected;
        Ok(())
    }

    /// Polls OS-level liveness of every registered receiver that has a
    /// known pid and still reports `Ok`, transitioning any whose process
    /// has exited to `PeerCrashed`. A maintenance pass the owner invokes
    /// periodically, the same way it invokes `ReclaimSlots`.
    pub fn refresh_receiver_health(&self) {
        let mut receivers = self.receivers.lock().unwrap();
        for slot in receivers.iter_mut() {
            let Some(entry) = slot else { continue };
            if entry.state != ReceiverConnState::Ok {
                continue;
            }
            if let Some(pid) = entry.peer_pid {
                if !crate::platform::process_is_alive(pid) {
                    entry.state = ReceiverConnState::PeerCrashed;
                }
            }
        }
    }

    /// `RemoveReceiver` — frees the registration slot and sweeps every
    /// slot descriptor's holder bit for this receiver in a single pass,
    /// clearing global-visibility on any slot left with no remaining
    /// holder.
    pub fn remove_receiver(&self, receiver: ReceiverHandle) -> Result<()> {
        let mut receivers = self.receivers.lock().unwrap();
        if receivers.get(receiver.0).and_then(|e| e.as_ref()).is_none() {
            return Err(IpcError::ApiMisuse("unknown receiver handle"));
        }
        receivers[receiver.0] = None;
        drop(receivers);

        let bit = bit_for(receiver.0);
        for index in 0..self.manager.slot_count() as u32 {
            let holders = self.manager.holders(index);
            if holders.connected(bit) {
                holders.disconnect(bit);
                self.manager.mark_reclaimable_if_unheld(index);
            }
        }
        Ok(())
    }

    /// `AcquireSlot` — finds a free (not checked out, not published) slot
    /// and checks it out for writing.
    pub fn acquire_slot(&self) -> Result<SlotToken> {
        for index in 0..self.manager.slot_count() as u32 {
            if !self.manager.is_free(index) {
                continue;
            }
            let handle = self.manager.get_slot_handle_for_index(index).unwrap();
            if let Some(token) = self.manager.get_slot_access_token(handle) {
                return Ok(token);
            }
        }
        Err(IpcError::ResourceExhausted("no free slot available"))
    }

    /// `UnacquireSlot` — give back a token without publishing it.
    pub fn unacquire_slot(&self, token: SlotToken) -> Result<()> {
        self.manager.return_slot_access_token(token)
    }

    /// `AccessSlotContent`.
    pub fn access_slot_content<'a>(&'a self, token: &SlotToken) -> &'a mut [u8] {
        self.manager.slot_payload_mut(token)
    }

    /// `SendSlot` — publish the slot the token refers to. The token is
    /// always consumed: on success it transitions to "published and
    /// checked back in"; there is no partial-success case that returns
    /// it to the caller.
    pub fn send_slot(&self, token: SlotToken, dropped: &mut DroppedInfo) -> Result<()> {
        let index = token.index();
        // Set global-visibility before pushing the index anywhere, so a
        // receiver that observes the index via an acquire load also sees
        // the flag set (no reordering window where it sees the index but
        // not the data it names as ready).
        self.manager.mark_published(index);

        let mut receivers = self.receivers.lock().unwrap();
        let mut classes = self.classes.lock().unwrap();
        for (i, slot) in receivers.iter_mut().enumerate() {
            let Some(entry) = slot else { continue };
            if entry.state != ReceiverConnState::Ok {
                continue;
            }
            let class = &mut classes[entry.class];
            if class.in_flight >= class.budget {
                dropped.dropped_classes.push(entry.class);
                continue;
            }
            if entry.available_queue.push(index) {
                self.manager.holders(index).set_bit(bit_for(i));
                class.in_flight += 1;
            } else {
                entry.state = ReceiverConnState::ProtocolError;
            }
        }
        drop(classes);
        drop(receivers);

        self.manager.finish_publish(token);
        if self.manager.holders(index).conn_count(std::sync::atomic::Ordering::Acquire) == 0 {
            // No receiver accepted it (none registered, or every
            // available_queue was full) — nothing will ever reclaim it.
            self.manager.mark_reclaimable_if_unheld(index);
        }
        Ok(())
    }

    /// `ReclaimSlots` — drain every receiver's free queue, clearing their
    /// holder bit on each returned slot and releasing global-visibility
    /// once no holder remains. Returns the number of slots reclaimed, or
    /// a protocol error if any receiver's free queue carried a bad index
    /// — every other receiver is still fully processed first.
    pub fn reclaim_slots(&self) -> Result<usize> {
        let mut receivers = self.receivers.lock().unwrap();
        let mut classes = self.classes.lock().unwrap();
        let mut reclaimed = 0usize;
        let mut saw_protocol_error = false;
        for (i, slot) in receivers.iter_mut().enumerate() {
            let Some(entry) = slot else { continue };
            if entry.state != ReceiverConnState::Ok {
                continue;
            }
            while let Some(index) = entry.free_queue.pop() {
                // `index` came out of the receiver's free queue, which
                // lives in memory the receiver process can write —
                // treat it as untrusted rather than indexing blindly.
                let Some(holders) = self.manager.holders_checked(index) else {
                    entry.state = ReceiverConnState::ProtocolError;
                    saw_protocol_error = true;
                    break;
                };
                holders.disconnect(bit_for(i));
                self.manager.mark_reclaimable_if_unheld(index);
                if let Some(class) = classes.get_mut(entry.class) {
                    class.in_flight = class.in_flight.saturating_sub(1);
                }
                reclaimed += 1;
            }
        }
        if saw_protocol_error {
            return Err(IpcError::ProtocolError(
                "one or more receivers pushed an out-of-range slot index to their free queue",
            ));
        }
        Ok(reclaimed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::ShmRegion;
    use std::sync::{Arc, Mutex as StdMutex};

    struct TestRegion {
        buf: StdMutex<Vec<u8>>,
    }

    impl ShmRegion for TestRegion {
        fn as_ptr(&self) -> *const u8 {
            self.buf.lock().unwrap().as_ptr()
        }
        fn as_mut_ptr(&self) -> *mut u8 {
            self.buf.lock().unwrap().as_mut_ptr()
        }
        fn len(&self) -> usize {
            self.buf.lock().unwrap().len()
        }
    }

    fn region(size: usize) -> Arc<dyn ShmRegion> {
        Arc::new(TestRegion {
            buf: StdMutex::new(vec![0u8; size]),
        })
    }

    fn test_server(slot_count: usize, slot_size: usize) -> Server {
        let manager = SlotManager::attach(
            region(SlotManager::region_size(slot_count, slot_size)),
            slot_count,
            slot_size,
            true,
        );
        Server::new(manager, 32).unwrap()
    }

    fn test_queue(capacity: usize) -> SlotQueue {
        SlotQueue::attach(region(SlotQueue::region_size_for_capacity(capacity)), capacity)
    }

    #[test]
    fn publish_delivers_to_registered_receiver() {
        let server = test_server(4, 16);
        let class = server.register_class(4);
        let free = test_queue(4);
        let available = test_queue(4);
        let receiver = server
            .register_receiver(class, free, test_queue(4), None)
            .unwrap();
        let _ = receiver;

        let token = server.acquire_slot().unwrap();
        let mut dropped = DroppedInfo::default();
        let index = token.index();
        server.send_slot(token, &mut dropped).unwrap();
        assert!(dropped.dropped_classes.is_empty());
        assert!(server.manager().is_globally_visible(index));
        let _ = available;
    }

    #[test]
    fn budget_exhaustion_drops_for_whole_class() {
        let server = test_server(4, 16);
        let class = server.register_class(1);
        let available = test_queue(4);
        server
            .register_receiver(class, test_queue(4), available, None)
            .unwrap();

        let t1 = server.acquire_slot().unwrap();
        let mut dropped = DroppedInfo::default();
        server.send_slot(t1, &mut dropped).unwrap();
        assert!(dropped.dropped_classes.is_empty());

        let t2 = server.acquire_slot().unwrap();
        let mut dropped2 = DroppedInfo::default();
        server.send_slot(t2, &mut dropped2).unwrap();
        assert_eq!(dropped2.dropped_classes, vec![class]);
    }

    #[test]
    fn remove_receiver_sweeps_holder_bits() {
        let server = test_server(2, 16);
        let class = server.register_class(4);
        let receiver = server
            .register_receiver(class, test_queue(4), test_queue(4), None)
            .unwrap();
        let token = server.acquire_slot().unwrap();
        let index = token.index();
        let mut dropped = DroppedInfo::default();
        server.send_slot(token, &mut dropped).unwrap();
        assert!(server.manager().is_globally_visible(index));

        server.remove_receiver(receiver).unwrap();
        assert!(!server.manager().is_globally_visible(index));
    }

    #[test]
    fn reclaim_slots_frees_budget() {
        let server = test_server(2, 16);
        let class = server.register_class(1);
        let free_region = region(SlotQueue::region_size_for_capacity(4));
        let server_side_free = SlotQueue::attach(Arc::clone(&free_region), 4);
        server
            .register_receiver(class, server_side_free, test_queue(4), None)
            .unwrap();
        let token = server.acquire_slot().unwrap();
        let index = token.index();
        let mut dropped = DroppedInfo::default();
        server.send_slot(token, &mut dropped).unwrap();

        // The receiver attaches its own handle to the same shared region
        // and pushes the index back once it's done with the slot (mirrors
        // slot::Client::release_slot).
        let client_side_free = SlotQueue::attach(free_region, 4);
        assert!(client_side_free.push(index));

        let reclaimed = server.reclaim_slots().unwrap();
        assert_eq!(reclaimed, 1);
        assert!(!server.manager().is_globally_visible(index));
    }
}
