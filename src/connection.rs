// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Core A: the point-to-point, bidirectional stream transport. A Connection
// owns two rings (one per direction), a split notification area, and the
// bootstrap handshake state that negotiated them. Shaped after the
// teacher's `ChanInner` in channel.rs (one struct owning every shared
// resource for the lifetime of a connection, cheaply `Clone`-able as an
// `Arc` so callbacks can outlive a `Close`) but restructured from
// broadcast pub-sub to point-to-point.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::config::SafeIpcConfig;
use crate::error::{IpcError, Result};
use crate::frame::{AttachedHandle, Frame, SeqCounter, SeqValidator, COMMON_HEADER_LEN};
use crate::handshake::{self, HandshakeWords, PROTOCOL_VERSION};
use crate::notify::{self, NotificationChannel};
use crate::ring::{self, Ring};
use crate::shm::{self, ShmProvider};

/// A connection endpoint: (domain, port). Both sides of a connection agree
/// on the same identifier; the bootstrap socket and the three shared-memory
/// region names are all derived from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    pub domain: u32,
    pub port: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Client,
    Server,
}

/// Lifecycle state of a connection (spec's state machine). `Created` and
/// `Connecting` are reachable only through the asynchronous connect/accept
/// path before a `Connection` value exists to observe them from; the
/// synchronous constructors return a `Connection` only once it has reached
/// `Connected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Created,
    Connecting,
    Connected,
    Closing,
    Closed,
    ProtocolError,
}

/// Size and presence of the next unread message, without consuming it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingMsgInfo {
    pub size: usize,
}

/// Outcome of [`Connection::receive_sync`]: how much of the message was
/// copied into the caller's buffer, and whether the buffer was too small
/// to hold all of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceivedSync {
    /// Bytes written into the destination buffer, starting at index 0.
    pub len: usize,
    /// `true` if the message was larger than the destination buffer; the
    /// remainder past `len` bytes was discarded, not buffered anywhere.
    pub truncated: bool,
}

struct PendingSend {
    bytes: Vec<u8>,
    completion: Box<dyn FnOnce(Result<()>) + Send>,
}

struct PendingReceive {
    completion: Box<dyn FnOnce(Result<(Vec<u8>, Option<AttachedHandle>)>) + Send>,
}

struct Shared {
    id: ConnectionId,
    send_ring: Ring,
    recv_ring: Ring,
    notify_tx: NotificationChannel,
    notify_rx: NotificationChannel,
    seq_tx: SeqCounter,
    seq_rx: SeqValidator,
    state: Mutex<ConnState>,
    peer_identity: String,
    send_buffer_size: usize,
    receive_buffer_size: usize,
    user_notification_cb: Mutex<Option<Arc<dyn Fn(u8) + Send + Sync>>>,
    pending_send: Mutex<VecDeque<PendingSend>>,
    pending_receive: Mutex<VecDeque<PendingReceive>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    quit: AtomicBool,
    /// Set once a peer-liveness probe (see `check_peer_liveness`) finds
    /// the peer process gone without an `OrderlyCloseBegin` having been
    /// observed first. Read back by every `Disconnected` error this
    /// connection raises afterward.
    abnormal_disconnect: AtomicBool,
}

/// A live point-to-point connection. Cheap to clone (an `Arc` handle); every
/// clone operates on the same underlying rings and state.
#[derive(Clone)]
pub struct Connection(Arc<Shared>);

fn region_names(id: ConnectionId) -> (String, String, String) {
    (
        format!("/safeipc-{}-{}-c2s", id.domain, id.port),
        format!("/safeipc-{}-{}-s2c", id.domain, id.port),
        format!("/safeipc-{}-{}-notify", id.domain, id.port),
    )
}

fn waiter_names(id: ConnectionId) -> (String, String) {
    (
        format!("safeipc-{}-{}-c2s-notify", id.domain, id.port),
        format!("safeipc-{}-{}-s2c-notify", id.domain, id.port),
    )
}

impl Connection {
    /// Client side: dial the bootstrap socket at `(remote.domain,
    /// remote.port)`, negotiate buffer sizes, and attach the shared-memory
    /// regions. Blocks for the full handshake round trip.
    pub fn connect_blocking(
        remote: ConnectionId,
        config: &SafeIpcConfig,
        shm: Arc<dyn ShmProvider>,
    ) -> Result<Connection> {
        let mut stream = handshake::connect(&config.bootstrap_socket_dir, remote.domain, remote.port)?;
        let (c2s_name, s2c_name, notify_name) = region_names(remote);
        let local_words = HandshakeWords {
            version: PROTOCOL_VERSION,
            c2s_size: config.platform_min_buffer_size as u64,
            s2c_size: config.platform_min_buffer_size as u64,
            c2s_region_name: c2s_name.clone(),
            s2c_region_name: s2c_name.clone(),
            notify_region_name: notify_name.clone(),
            peer_identity: String::new(),
        };
        handshake::write_words(&mut stream, &local_words)?;
        let peer_words = handshake::read_words(&mut stream)?;
        let trusted_identity = handshake::peer_identity(&stream)?;

        Self::establish(
            Role::Client,
            remote,
            &local_words,
            &peer_words,
            trusted_identity,
            config,
            shm,
        )
    }

    /// Asynchronous variant of [`connect_blocking`](Self::connect_blocking):
    /// runs the handshake on a background thread and invokes `on_complete`
    /// exactly once with the outcome. The bootstrap handshake is a short
    /// multi-round-trip protocol rather than a single readiness event, so
    /// this does not route through a [`Reactor`](crate::reactor::Reactor) —
    /// it is driven by a dedicated thread instead, the same way the data
    /// path's async operations are (see module docs on the worker thread).
    pub fn connect_async(
        remote: ConnectionId,
        config: SafeIpcConfig,
        shm: Arc<dyn ShmProvider>,
        on_complete: impl FnOnce(Result<Connection>) + Send + 'static,
    ) {
        std::thread::spawn(move || {
            let result = Self::connect_blocking(remote, &config, shm);
            on_complete(result);
        });
    }

    /// Server side: complete the handshake over an already-accepted
    /// bootstrap stream (see `acceptor.rs`).
    pub fn accept_blocking(
        mut stream: std::os::unix::net::UnixStream,
        local: ConnectionId,
        config: &SafeIpcConfig,
        shm: Arc<dyn ShmProvider>,
    ) -> Result<Connection> {
        let peer_words = handshake::read_words(&mut stream)?;
        let (c2s_name, s2c_name, notify_name) = region_names(local);
        let local_words = HandshakeWords {
            version: PROTOCOL_VERSION,
            c2s_size: config.platform_min_buffer_size as u64,
            s2c_size: config.platform_min_buffer_size as u64,
            c2s_region_name: c2s_name,
            s2c_region_name: s2c_name,
            notify_region_name: notify_name,
            peer_identity: String::new(),
        };
        handshake::write_words(&mut stream, &local_words)?;
        let trusted_identity = handshake::peer_identity(&stream)?;

        Self::establish(
            Role::Server,
            local,
            &local_words,
            &peer_words,
            trusted_identity,
            config,
            shm,
        )
    }

    fn establish(
        role: Role,
        id: ConnectionId,
        local_words: &HandshakeWords,
        peer_words: &HandshakeWords,
        trusted_identity: String,
        config: &SafeIpcConfig,
        shm: Arc<dyn ShmProvider>,
    ) -> Result<Connection> {
        if peer_words.version != PROTOCOL_VERSION {
            return Err(IpcError::ProtocolError("protocol version mismatch"));
        }
        if peer_words.c2s_region_name != local_words.c2s_region_name
            || peer_words.s2c_region_name != local_words.s2c_region_name
        {
            return Err(IpcError::ProtocolError(
                "peer derived different shared-memory region names for this connection id",
            ));
        }

        let c2s_size = (local_words.c2s_size.max(peer_words.c2s_size) as usize)
            .max(config.platform_min_buffer_size);
        let s2c_size = (local_words.s2c_size.max(peer_words.s2c_size) as usize)
            .max(config.platform_min_buffer_size);
        let notify_capacity = 4096usize;

        let c2s_region = shm.create_or_open(
            &local_words.c2s_region_name,
            ring::region_size_for_capacity(c2s_size),
        )?;
        let s2c_region = shm.create_or_open(
            &local_words.s2c_region_name,
            ring::region_size_for_capacity(s2c_size),
        )?;
        let notify_region = shm.create_or_open(
            &local_words.notify_region_name,
            2 * ring::region_size_for_capacity(notify_capacity),
        )?;
        let (c2s_notify_region, s2c_notify_region) = shm::split_region_in_half(notify_region);
        let (c2s_waiter, s2c_waiter) = waiter_names(id);

        let (send_ring, recv_ring, notify_tx, notify_rx, send_buffer_size, receive_buffer_size) =
            match role {
                Role::Client => (
                    Ring::attach(c2s_region),
                    Ring::attach(s2c_region),
                    NotificationChannel::attach(c2s_notify_region, &c2s_waiter)?,
                    NotificationChannel::attach(s2c_notify_region, &s2c_waiter)?,
                    c2s_size,
                    s2c_size,
                ),
                Role::Server => (
                    Ring::attach(s2c_region),
                    Ring::attach(c2s_region),
                    NotificationChannel::attach(s2c_notify_region, &s2c_waiter)?,
                    NotificationChannel::attach(c2s_notify_region, &c2s_waiter)?,
                    s2c_size,
                    c2s_size,
                ),
            };

        let shared = Arc::new(Shared {
            id,
            send_ring,
            recv_ring,
            notify_tx,
            notify_rx,
            seq_tx: SeqCounter::new(),
            seq_rx: SeqValidator::new(),
            state: Mutex::new(ConnState::Connected),
            peer_identity: trusted_identity,
            send_buffer_size,
            receive_buffer_size,
            user_notification_cb: Mutex::new(None),
            pending_send: Mutex::new(VecDeque::new()),
            pending_receive: Mutex::new(VecDeque::new()),
            worker: Mutex::new(None),
            quit: AtomicBool::new(false),
            abnormal_disconnect: AtomicBool::new(false),
        });
        log::debug!(
            "connection {}:{} established (send={} recv={})",
            id.domain,
            id.port,
            send_buffer_size,
            receive_buffer_size
        );
        Ok(Connection(shared))
    }

    pub fn id(&self) -> ConnectionId {
        self.0.id
    }

    pub fn state(&self) -> ConnState {
        *self.0.state.lock().unwrap()
    }

    fn check_sendable_state(&self) -> Result<()> {
        Self::check_peer_liveness(&self.0);
        match *self.0.state.lock().unwrap() {
            ConnState::Connected => Ok(()),
            ConnState::ProtocolError => {
                Err(IpcError::ProtocolError("connection latched in protocol-error state"))
            }
            _ => Err(IpcError::Disconnected {
                abnormal: self.0.abnormal_disconnect.load(Ordering::Acquire),
            }),
        }
    }

    fn check_receivable_state(&self) -> Result<()> {
        Self::check_peer_liveness(&self.0);
        match *self.0.state.lock().unwrap() {
            ConnState::Connected | ConnState::Closing => Ok(()),
            ConnState::ProtocolError => {
                Err(IpcError::ProtocolError("connection latched in protocol-error state"))
            }
            _ => Err(IpcError::Disconnected {
                abnormal: self.0.abnormal_disconnect.load(Ordering::Acquire),
            }),
        }
    }

    /// The peer's pid, if the handshake's platform-reported identity
    /// carried one (Linux's `SO_PEERCRED`; other Unixes' `getpeereid`
    /// does not, so this is `None` there).
    fn peer_pid(shared: &Shared) -> Option<u32> {
        shared
            .peer_identity
            .strip_prefix("pid=")
            .and_then(|rest| rest.split(' ').next())
            .and_then(|p| p.parse().ok())
    }

    /// Detect a peer process that vanished without an orderly `Close` —
    /// a crash, a kill signal, an OOM kill — by probing whether its pid
    /// is still alive. No-op once the connection has already left
    /// `Connected`, and a no-op entirely on platforms where the peer's
    /// pid was never recovered at handshake time (see `peer_pid`).
    fn check_peer_liveness(shared: &Shared) {
        if *shared.state.lock().unwrap() != ConnState::Connected {
            return;
        }
        let Some(pid) = Self::peer_pid(shared) else {
            return;
        };
        if !crate::platform::process_is_alive(pid) {
            shared.abnormal_disconnect.store(true, Ordering::Release);
            *shared.state.lock().unwrap() = ConnState::Closed;
            log::warn!(
                "connection {}:{} peer process {} is gone; treating as abnormal disconnect",
                shared.id.domain,
                shared.id.port,
                pid
            );
        }
    }

    // --- send path ---

    fn encode_next(shared: &Shared, payload: &[u8]) -> Result<Vec<u8>> {
        if payload.len() > u32::MAX as usize {
            return Err(IpcError::MessageTooLarge {
                actual: payload.len(),
                limit: u32::MAX as usize,
            });
        }
        let seq = shared.seq_tx.next();
        let frame = Frame {
            seq,
            handle: None,
            payload: payload.to_vec(),
        };
        let bytes = frame.encode();
        if bytes.len() > shared.send_ring.capacity() {
            return Err(IpcError::MessageTooLarge {
                actual: bytes.len(),
                limit: shared.send_ring.capacity(),
            });
        }
        Ok(bytes)
    }

    fn try_send_raw(shared: &Shared, bytes: &[u8]) -> bool {
        if shared.send_ring.try_write(bytes) {
            let _ = shared.notify_tx.send_internal(notify::Internal::DataWritten);
            true
        } else {
            false
        }
    }

    /// Block until `payload` is written, `timeout_ms` elapses (returning
    /// [`IpcError::Busy`]), or the connection becomes unusable.
    pub fn send_sync(&self, payload: &[u8], timeout_ms: Option<u64>) -> Result<()> {
        let shared = &*self.0;
        let bytes = Self::encode_next(shared, payload)?;
        loop {
            self.check_sendable_state()?;
            if Self::try_send_raw(shared, &bytes) {
                return Ok(());
            }
            let woke = shared.notify_rx.wait(Some(timeout_ms.unwrap_or(50)))?;
            Self::drain_notifications(shared);
            if !woke && timeout_ms.is_some() {
                return Err(IpcError::Busy);
            }
        }
    }

    /// Attempt an immediate write; if the ring is full, queue the message
    /// and report completion through `on_backpressure_resolved` once space
    /// frees up. Returns `Ok(())` when the write completed inline (the
    /// callback is then never invoked) or [`IpcError::Busy`] once the
    /// message has been queued.
    pub fn send(
        &self,
        payload: &[u8],
        on_backpressure_resolved: impl FnOnce(Result<()>) + Send + 'static,
    ) -> Result<()> {
        self.check_sendable_state()?;
        let shared = &*self.0;
        let bytes = Self::encode_next(shared, payload)?;
        if Self::try_send_raw(shared, &bytes) {
            return Ok(());
        }
        shared.pending_send.lock().unwrap().push_back(PendingSend {
            bytes,
            completion: Box::new(on_backpressure_resolved),
        });
        self.ensure_worker_started();
        Err(IpcError::Busy)
    }

    /// Always asynchronous: `completion` fires exactly once, whether or not
    /// the write could have completed inline.
    pub fn send_async(
        &self,
        payload: &[u8],
        completion: impl FnOnce(Result<()>) + Send + 'static,
    ) -> Result<()> {
        self.check_sendable_state()?;
        let shared = &*self.0;
        let bytes = Self::encode_next(shared, payload)?;
        shared.pending_send.lock().unwrap().push_back(PendingSend {
            bytes,
            completion: Box::new(completion),
        });
        self.ensure_worker_started();
        Ok(())
    }

    // --- receive path ---

    fn peek_next_frame_len(ring: &Ring) -> Result<Option<usize>> {
        let mut common = [0u8; COMMON_HEADER_LEN];
        if !ring.peek(&mut common) {
            return Ok(None);
        }
        if common[0] == crate::frame::FORMAT_B {
            let mut head = vec![0u8; COMMON_HEADER_LEN + 2];
            if !ring.peek(&mut head) {
                return Ok(None);
            }
            Frame::peeked_total_len(&common, &head[COMMON_HEADER_LEN..]).map(Some)
        } else {
            Frame::peeked_total_len(&common, &[]).map(Some)
        }
    }

    fn try_receive_raw(
        shared: &Shared,
    ) -> Result<Option<(Vec<u8>, Option<AttachedHandle>)>> {
        let Some(total) = Self::peek_next_frame_len(&shared.recv_ring)? else {
            return Ok(None);
        };
        if shared.recv_ring.readable_len() < total {
            return Ok(None);
        }
        let mut buf = vec![0u8; total];
        shared.recv_ring.peek(&mut buf);
        let frame = Frame::decode(&buf)?;
        shared.seq_rx.validate(frame.seq)?;
        if shared.recv_ring.commit_read(total) {
            let _ = shared.notify_tx.send_internal(notify::Internal::WritableAgain);
        }
        Ok(Some((frame.payload, frame.handle)))
    }

    /// Block until a full message is available, `timeout_ms` elapses
    /// (returning [`IpcError::Busy`]), or the connection becomes unusable.
    ///
    /// Copies at most `dst.len()` bytes. A message longer than `dst` has
    /// its remainder discarded rather than buffered, and `truncated` is
    /// reported — the caller never receives a partial message's byte
    /// count alone and mistakes it for a short complete one. Any
    /// attached handle on the message is dropped: synchronous receives
    /// never transfer handles (see [`Connection::receive_async`]).
    pub fn receive_sync(&self, dst: &mut [u8], timeout_ms: Option<u64>) -> Result<ReceivedSync> {
        let shared = &*self.0;
        loop {
            self.check_receivable_state()?;
            if let Some((payload, _handle)) = Self::try_receive_raw(shared)? {
                let len = payload.len().min(dst.len());
                dst[..len].copy_from_slice(&payload[..len]);
                return Ok(ReceivedSync {
                    len,
                    truncated: payload.len() > dst.len(),
                });
            }
            let woke = shared.notify_rx.wait(Some(timeout_ms.unwrap_or(50)))?;
            Self::drain_notifications(shared);
            if !woke && timeout_ms.is_some() {
                return Err(IpcError::Busy);
            }
        }
    }

    /// `completion` fires exactly once: inline if a message is already
    /// fully buffered, otherwise from the connection's worker thread once
    /// one arrives.
    pub fn receive_async(
        &self,
        completion: impl FnOnce(Result<(Vec<u8>, Option<AttachedHandle>)>) + Send + 'static,
    ) -> Result<()> {
        self.check_receivable_state()?;
        let shared = &*self.0;
        if let Some(msg) = Self::try_receive_raw(shared)? {
            completion(Ok(msg));
            return Ok(());
        }
        shared
            .pending_receive
            .lock()
            .unwrap()
            .push_back(PendingReceive {
                completion: Box::new(completion),
            });
        self.ensure_worker_started();
        Ok(())
    }

    /// Size of the next unread message, without consuming it, or `None` if
    /// no complete message has arrived yet.
    pub fn get_pending_msg_info(&self) -> Result<Option<PendingMsgInfo>> {
        self.check_receivable_state()?;
        let shared = &*self.0;
        let Some(total) = Self::peek_next_frame_len(&shared.recv_ring)? else {
            return Ok(None);
        };
        if shared.recv_ring.readable_len() < total {
            return Ok(None);
        }
        let mut buf = vec![0u8; total];
        shared.recv_ring.peek(&mut buf);
        let frame = Frame::decode(&buf)?;
        Ok(Some(PendingMsgInfo {
            size: frame.payload.len(),
        }))
    }

    // --- notifications ---

    pub fn send_notification(&self, value: u8) -> Result<()> {
        self.check_sendable_state()?;
        self.0.notify_tx.send_user(value)
    }

    pub fn register_notification_callback(&self, callback: Arc<dyn Fn(u8) + Send + Sync>) {
        *self.0.user_notification_cb.lock().unwrap() = Some(callback);
        self.ensure_worker_started();
    }

    pub fn unregister_notification_callback(&self) {
        *self.0.user_notification_cb.lock().unwrap() = None;
    }

    fn drain_notifications(shared: &Shared) {
        while let Some(v) = shared.notify_rx.try_recv() {
            if v <= notify::USER_MAX {
                let cb = shared.user_notification_cb.lock().unwrap().clone();
                if let Some(cb) = cb {
                    cb(v);
                }
                continue;
            }
            match notify::Internal::try_from(v) {
                Ok(notify::Internal::OrderlyCloseBegin) => {
                    let mut st = shared.state.lock().unwrap();
                    if *st == ConnState::Connected {
                        *st = ConnState::Closing;
                    }
                }
                Ok(notify::Internal::ProtocolErrorObserved) => {
                    *shared.state.lock().unwrap() = ConnState::ProtocolError;
                }
                _ => {}
            }
        }
    }

    // --- peer introspection ---

    pub fn get_peer_identity(&self) -> &str {
        &self.0.peer_identity
    }

    /// Linux only (`SO_PEERCRED` reports a pid; `getpeereid` on other
    /// Unixes does not), hence the `Option`.
    pub fn get_peer_process_id(&self) -> Option<u32> {
        Self::peer_pid(&self.0)
    }

    fn peer_uid(&self) -> Result<u32> {
        let s = &self.0.peer_identity;
        s.split(' ')
            .find_map(|tok| tok.strip_prefix("uid="))
            .and_then(|v| v.parse().ok())
            .ok_or(IpcError::ProtocolError("peer identity missing uid"))
    }

    /// Compares the peer's reported uid against this process's own — the
    /// closest POSIX analogue to an Adaptive platform integrity-level
    /// check, since POSIX has no mandatory-integrity concept of its own.
    pub fn check_peer_integrity_level(&self) -> Result<()> {
        let peer_uid = self.peer_uid()?;
        let local_uid = unsafe { libc::getuid() };
        if peer_uid == local_uid {
            Ok(())
        } else {
            Err(IpcError::ProtocolError(
                "peer integrity level does not match local trust level",
            ))
        }
    }

    pub fn get_send_buffer_size(&self) -> usize {
        self.0.send_buffer_size
    }

    pub fn get_receive_buffer_size(&self) -> usize {
        self.0.receive_buffer_size
    }

    // --- lifecycle ---

    fn ensure_worker_started(&self) {
        let mut guard = self.0.worker.lock().unwrap();
        if guard.is_none() {
            let shared = Arc::clone(&self.0);
            *guard = Some(std::thread::spawn(move || Self::worker_loop(shared)));
        }
    }

    /// Background completion driver for `send`/`send_async`/`receive_async`
    /// and user-notification callbacks. Started lazily on first async use
    /// so a connection that only calls the `_sync` operations never pays
    /// for a thread. Every callback for one `Connection` runs serialized on
    /// this single thread, matching the crate's single-threaded
    /// cooperative dispatch model.
    fn worker_loop(shared: Arc<Shared>) {
        loop {
            Self::check_peer_liveness(&shared);
            loop {
                let next_ready = {
                    let q = shared.pending_send.lock().unwrap();
                    q.front().map(|item| Self::try_send_raw(&shared, &item.bytes))
                };
                match next_ready {
                    Some(true) => {
                        let item = shared.pending_send.lock().unwrap().pop_front().unwrap();
                        (item.completion)(Ok(()));
                    }
                    Some(false) | None => break,
                }
            }
            loop {
                let has_pending = !shared.pending_receive.lock().unwrap().is_empty();
                if !has_pending {
                    break;
                }
                match Self::try_receive_raw(&shared) {
                    Ok(Some(msg)) => {
                        let item = shared.pending_receive.lock().unwrap().pop_front().unwrap();
                        (item.completion)(Ok(msg));
                    }
                    Ok(None) => break,
                    Err(e) => {
                        let item = shared.pending_receive.lock().unwrap().pop_front();
                        if let Some(item) = item {
                            (item.completion)(Err(e));
                        }
                        break;
                    }
                }
            }
            Self::drain_notifications(&shared);
            if shared.quit.load(Ordering::Acquire) || shared.abnormal_disconnect.load(Ordering::Acquire) {
                break;
            }
            let _ = shared.notify_rx.wait(Some(100));
        }
        let abnormal = shared.abnormal_disconnect.load(Ordering::Acquire);
        let mut sq = shared.pending_send.lock().unwrap();
        while let Some(item) = sq.pop_front() {
            (item.completion)(Err(IpcError::Disconnected { abnormal }));
        }
        drop(sq);
        let mut rq = shared.pending_receive.lock().unwrap();
        while let Some(item) = rq.pop_front() {
            (item.completion)(Err(IpcError::Disconnected { abnormal }));
        }
    }

    /// Orderly teardown: notifies the peer, stops the worker thread, and
    /// fails any still-queued async operations with
    /// [`IpcError::Disconnected`]. Idempotent.
    pub fn close(&self) -> Result<()> {
        {
            let mut st = self.0.state.lock().unwrap();
            if *st == ConnState::Closed {
                return Ok(());
            }
            if *st == ConnState::Connected {
                *st = ConnState::Closing;
            }
        }
        let _ = self.0.notify_tx.send_internal(notify::Internal::OrderlyCloseBegin);
        self.0.quit.store(true, Ordering::Release);
        let _ = self.0.notify_rx.quit();
        let _ = self.0.notify_tx.quit();
        let handle = self.0.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        *self.0.state.lock().unwrap() = ConnState::Closed;
        log::debug!("connection {}:{} closed", self.0.id.domain, self.0.id.port);
        Ok(())
    }

    /// `true` while something besides this handle — most commonly the
    /// worker thread started by an async operation — still holds a strong
    /// reference to the connection's shared state.
    pub fn is_in_use(&self) -> bool {
        Arc::strong_count(&self.0) > 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::PosixShmProvider;

    fn test_config(dir: &str) -> SafeIpcConfig {
        SafeIpcConfig {
            platform_min_buffer_size: 4096,
            bootstrap_socket_dir: dir.to_string(),
            ..SafeIpcConfig::default()
        }
    }

    #[test]
    fn loopback_send_receive_sync() {
        let dir = std::env::temp_dir().to_string_lossy().into_owned();
        let config = test_config(&dir);
        let id = ConnectionId { domain: 424242, port: 7 };

        let listener = handshake::BootstrapListener::bind(&dir, id.domain, id.port).unwrap();
        let shm_client: Arc<dyn ShmProvider> = Arc::new(PosixShmProvider::new());
        let client_config = config.clone();
        let client = std::thread::spawn(move || {
            Connection::connect_blocking(id, &client_config, shm_client).unwrap()
        });

        let stream = listener.accept().unwrap();
        let shm_server: Arc<dyn ShmProvider> = Arc::new(PosixShmProvider::new());
        let server = Connection::accept_blocking(stream, id, &config, shm_server).unwrap();
        let client = client.join().unwrap();

        client.send_sync(b"hello from client", Some(1000)).unwrap();
        let mut buf = [0u8; 64];
        let received = server.receive_sync(&mut buf, Some(1000)).unwrap();
        assert!(!received.truncated);
        assert_eq!(&buf[..received.len], b"hello from client");

        server.send_sync(b"hello back", Some(1000)).unwrap();
        let received = client.receive_sync(&mut buf, Some(1000)).unwrap();
        assert_eq!(&buf[..received.len], b"hello back");

        client.close().unwrap();
        server.close().unwrap();
    }

    #[test]
    fn receive_sync_truncates_when_buffer_is_smaller_than_message() {
        let dir = std::env::temp_dir().to_string_lossy().into_owned();
        let config = test_config(&dir);
        let id = ConnectionId { domain: 424245, port: 13 };

        let listener = handshake::BootstrapListener::bind(&dir, id.domain, id.port).unwrap();
        let shm_client: Arc<dyn ShmProvider> = Arc::new(PosixShmProvider::new());
        let client_config = config.clone();
        let client_thread = std::thread::spawn(move || {
            Connection::connect_blocking(id, &client_config, shm_client).unwrap()
        });
        let stream = listener.accept().unwrap();
        let shm_server: Arc<dyn ShmProvider> = Arc::new(PosixShmProvider::new());
        let server = Connection::accept_blocking(stream, id, &config, shm_server).unwrap();
        let client = client_thread.join().unwrap();

        client.send_sync(b"0123456789", Some(1000)).unwrap();
        let mut buf = [0u8; 4];
        let received = server.receive_sync(&mut buf, Some(1000)).unwrap();
        assert!(received.truncated);
        assert_eq!(received.len, 4);
        assert_eq!(&buf, b"0123");

        client.close().unwrap();
        server.close().unwrap();
    }

    #[test]
    fn send_async_completes_via_worker_thread() {
        let dir = std::env::temp_dir().to_string_lossy().into_owned();
        let config = test_config(&dir);
        let id = ConnectionId { domain: 424243, port: 9 };

        let listener = handshake::BootstrapListener::bind(&dir, id.domain, id.port).unwrap();
        let shm_client: Arc<dyn ShmProvider> = Arc::new(PosixShmProvider::new());
        let client_config = config.clone();
        let client_thread = std::thread::spawn(move || {
            Connection::connect_blocking(id, &client_config, shm_client).unwrap()
        });
        let stream = listener.accept().unwrap();
        let shm_server: Arc<dyn ShmProvider> = Arc::new(PosixShmProvider::new());
        let server = Connection::accept_blocking(stream, id, &config, shm_server).unwrap();
        let client = client_thread.join().unwrap();

        let (tx, rx) = std::sync::mpsc::channel();
        client
            .send_async(b"async payload", move |result| {
                tx.send(result).unwrap();
            })
            .unwrap();
        assert!(rx.recv_timeout(std::time::Duration::from_secs(2)).unwrap().is_ok());

        let mut buf = [0u8; 64];
        let received = server.receive_sync(&mut buf, Some(1000)).unwrap();
        assert_eq!(&buf[..received.len], b"async payload");

        client.close().unwrap();
        server.close().unwrap();
    }

    #[test]
    fn abnormal_disconnect_detected_when_peer_process_exits() {
        let dir = std::env::temp_dir().to_string_lossy().into_owned();
        let config = test_config(&dir);
        let id = ConnectionId { domain: 424246, port: 17 };

        let listener = handshake::BootstrapListener::bind(&dir, id.domain, id.port).unwrap();
        let shm_client: Arc<dyn ShmProvider> = Arc::new(PosixShmProvider::new());
        let client_config = config.clone();
        let client_thread = std::thread::spawn(move || {
            Connection::connect_blocking(id, &client_config, shm_client).unwrap()
        });
        let stream = listener.accept().unwrap();
        let shm_server: Arc<dyn ShmProvider> = Arc::new(PosixShmProvider::new());
        let mut server = Connection::accept_blocking(stream, id, &config, shm_server).unwrap();
        let client = client_thread.join().unwrap();

        // The real handshake reported our own pid on both sides (client
        // and server are threads in this same test process). Stand in a
        // real, separate process for "the peer" and kill it without ever
        // calling `close()` — the crash path has no chance to say
        // goodbye the way `OrderlyCloseBegin` does.
        let mut peer = std::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .expect("spawn stand-in peer process");
        let peer_pid = peer.id();
        {
            let shared =
                Arc::get_mut(&mut server.0).expect("no other handle holds this connection yet");
            shared.peer_identity = format!("pid={peer_pid} uid=0");
        }
        peer.kill().expect("kill stand-in peer process");
        peer.wait().expect("reap stand-in peer process");

        match server.send_sync(b"x", Some(200)) {
            Err(IpcError::Disconnected { abnormal: true }) => {}
            other => panic!("expected an abnormal disconnect, got {other:?}"),
        }
        assert_eq!(server.state(), ConnState::Closed);

        client.close().unwrap();
    }
}
