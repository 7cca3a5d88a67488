// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Server-side listener: a bounded backlog of incomplete handshakes
// behind a single reactor registration on the bootstrap socket. Each
// accepted stream completes its handshake off the reactor thread —
// `handshake.rs`'s multi-round-trip exchange is not a single readiness
// event, the same reasoning `connection.rs`'s `connect_async`/
// `accept_async` already rely on — on a lazily-spawned worker, with the
// in-flight count bounded by a small CAS-claimed bitmask modeled on
// `circ::BroadcastConnHead`'s claim-the-first-free-bit algorithm. The
// bitmask itself isn't reused directly: the backlog is process-local
// bookkeeping, never shared memory, so the shared-memory-oriented type
// doesn't apply, only its lock-free claim/release pattern does.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::SafeIpcConfig;
use crate::connection::{Connection, ConnectionId};
use crate::error::{IpcError, Result};
use crate::handshake::BootstrapListener;
use crate::reactor::{Reactor, Token};
use crate::shm::ShmProvider;

struct Backlog {
    claimed: AtomicU32,
    mask: u32,
}

impl Backlog {
    fn new(max: u32) -> Self {
        let mask = if max >= 32 { u32::MAX } else { (1u32 << max) - 1 };
        Self {
            claimed: AtomicU32::new(0),
            mask,
        }
    }

    /// CAS-claim the first unclaimed bit, mirroring
    /// `circ::BroadcastConnHead::connect`.
    fn try_claim(&self) -> Option<u32> {
        let mut k = 0u32;
        loop {
            let curr = self.claimed.load(Ordering::Acquire);
            let free = !curr & self.mask;
            if free == 0 {
                return None;
            }
            let bit = 1u32 << free.trailing_zeros();
            let next = curr | bit;
            if self
                .claimed
                .compare_exchange_weak(curr, next, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                return Some(bit);
            }
            crate::spin_lock::adaptive_yield_pub(&mut k);
        }
    }

    fn release(&self, bit: u32) {
        self.claimed.fetch_and(!bit, Ordering::AcqRel);
    }
}

type AcceptCompletion = dyn Fn(Result<Connection>) + Send + Sync;

struct Shared {
    listener: BootstrapListener,
    reactor: Arc<dyn Reactor>,
    config: SafeIpcConfig,
    shm: Arc<dyn ShmProvider>,
    local: ConnectionId,
    backlog: Backlog,
    completion: Mutex<Option<Arc<AcceptCompletion>>>,
    token: Mutex<Option<Token>>,
    tainted: AtomicBool,
}

impl Shared {
    fn dispatch(&self, result: Result<Connection>) {
        if let Some(cb) = self.completion.lock().unwrap().as_ref() {
            cb(result);
        }
    }
}

/// Server-side endpoint that turns inbound connection attempts into
/// fully established [`Connection`]s.
pub struct Acceptor(Arc<Shared>);

impl Acceptor {
    /// `Init(s2c_size_cap)` — binds the bootstrap socket for `local` and
    /// folds `s2c_size_cap` into the per-acceptor config every accepted
    /// `Connection`'s handshake negotiates against.
    pub fn init(
        local: ConnectionId,
        s2c_size_cap: usize,
        reactor: Arc<dyn Reactor>,
        shm: Arc<dyn ShmProvider>,
        mut config: SafeIpcConfig,
    ) -> Result<Self> {
        if config.max_backlog == 0 {
            return Err(IpcError::ApiMisuse("max_backlog must be at least 1"));
        }
        let listener =
            BootstrapListener::bind(&config.bootstrap_socket_dir, local.domain, local.port)?;
        listener.set_nonblocking(true)?;
        config.platform_min_buffer_size = config.platform_min_buffer_size.min(s2c_size_cap);
        let backlog = Backlog::new(config.max_backlog.min(32) as u32);
        Ok(Self(Arc::new(Shared {
            listener,
            reactor,
            config,
            shm,
            local,
            backlog,
            completion: Mutex::new(None),
            token: Mutex::new(None),
            tainted: AtomicBool::new(false),
        })))
    }

    /// `AcceptAsync(completion)`. Unlike `Connection::connect_async`'s
    /// one-shot completion, `completion` fires once per accepted stream
    /// for as long as the acceptor is open; calling this again replaces
    /// the previous callback without re-registering the reactor slot.
    pub fn accept_async(
        &self,
        completion: impl Fn(Result<Connection>) + Send + Sync + 'static,
    ) -> Result<()> {
        *self.0.completion.lock().unwrap() = Some(Arc::new(completion));
        if self.0.token.lock().unwrap().is_some() {
            return Ok(());
        }
        let shared = Arc::clone(&self.0);
        let fd = self.0.listener.as_raw_fd();
        let token = self
            .0
            .reactor
            .register_read(fd, Arc::new(move || Self::on_readable(Arc::clone(&shared))))
            .map_err(IpcError::System)?;
        *self.0.token.lock().unwrap() = Some(token);
        Ok(())
    }

    /// Drains every connection the kernel currently has ready, up to the
    /// backlog limit; a full backlog simply leaves the rest queued at the
    /// kernel's listen backlog until a worker releases a slot.
    fn on_readable(shared: Arc<Shared>) {
        loop {
            let Some(bit) = shared.backlog.try_claim() else {
                return;
            };
            let stream = match shared.listener.accept() {
                Ok(stream) => stream,
                Err(IpcError::System(e)) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    shared.backlog.release(bit);
                    return;
                }
                Err(e) => {
                    shared.backlog.release(bit);
                    shared.tainted.store(true, Ordering::Release);
                    shared.dispatch(Err(e));
                    return;
                }
            };
            let worker_shared = Arc::clone(&shared);
            std::thread::spawn(move || {
                let result = Connection::accept_blocking(
                    stream,
                    worker_shared.local,
                    &worker_shared.config,
                    Arc::clone(&worker_shared.shm),
                );
                worker_shared.backlog.release(bit);
                worker_shared.dispatch(result);
            });
        }
    }

    /// Whether an unrecoverable local failure has tainted future accepts
    /// until [`Self::init`] is called again.
    pub fn is_tainted(&self) -> bool {
        self.0.tainted.load(Ordering::Acquire)
    }

    /// `Close`.
    pub fn close(&self) -> Result<()> {
        if let Some(token) = self.0.token.lock().unwrap().take() {
            self.0.reactor.deregister(token).map_err(IpcError::System)?;
        }
        *self.0.completion.lock().unwrap() = None;
        Ok(())
    }
}
