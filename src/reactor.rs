// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// The async I/O event loop the core registers read/write callbacks on.
// The core never hardcodes a concrete reactor — `Connection`/`Acceptor`
// take `Arc<dyn Reactor>` — but `MioReactor` ships as the default so the
// crate is runnable without a host application supplying its own loop.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A callback registered with a [`Reactor`].
///
/// Shared ownership (`Arc`, not `Box`) matters here: a `Connection`'s
/// `Close` drops its own strong reference to the callback, but if the
/// reactor thread is mid-dispatch on that same callback when `Close`
/// runs, the callback (and whatever state it closed over) must stay
/// alive until dispatch returns. Checking `Arc::strong_count() > 1` is
/// how a caller can tell whether a just-deregistered callback is still
/// running.
pub type ReactorCallback = Arc<dyn Fn() + Send + Sync>;

/// Opaque handle to a registration, used to deregister it later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(usize);

/// Readiness-driven dispatch, abstracted so the core stays event-loop
/// agnostic (the host application may already run its own `mio`/`tokio`
/// reactor and just wants safeipc to plug into it).
pub trait Reactor: Send + Sync {
    /// Register `callback` to run whenever `fd` becomes readable.
    fn register_read(&self, fd: RawFd, callback: ReactorCallback) -> io::Result<Token>;

    /// Register `callback` to run whenever `fd` becomes writable.
    fn register_write(&self, fd: RawFd, callback: ReactorCallback) -> io::Result<Token>;

    /// Remove a registration. Does not guarantee a concurrently
    /// in-flight dispatch of that callback is finished by the time this
    /// returns — only that no further dispatch will occur.
    fn deregister(&self, token: Token) -> io::Result<()>;

    /// Drive one iteration of the event loop, blocking up to `timeout`
    /// (or indefinitely if `None`). Returns the number of callbacks
    /// dispatched.
    fn poll(&self, timeout: Option<Duration>) -> io::Result<usize>;
}

struct Entry {
    fd: RawFd,
    interest: mio::Interest,
    callback: ReactorCallback,
}

/// Single-threaded default [`Reactor`] backed by `mio::Poll`.
///
/// Matches the crate's "single-threaded cooperative" scheduling model:
/// every callback registered with one `MioReactor` runs on whichever
/// thread calls [`MioReactor::poll`], never re-entrantly and never on a
/// reactor-owned background thread unless the caller spawns one itself.
pub struct MioReactor {
    poll: Mutex<mio::Poll>,
    entries: Mutex<std::collections::HashMap<usize, Entry>>,
    next_token: AtomicUsize,
}

impl MioReactor {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poll: Mutex::new(mio::Poll::new()?),
            entries: Mutex::new(std::collections::HashMap::new()),
            next_token: AtomicUsize::new(0),
        })
    }

    fn register(
        &self,
        fd: RawFd,
        interest: mio::Interest,
        callback: ReactorCallback,
    ) -> io::Result<Token> {
        let id = self.next_token.fetch_add(1, Ordering::Relaxed);
        let poll = self.poll.lock().unwrap();
        let mut source = mio::unix::SourceFd(&fd);
        poll.registry()
            .register(&mut source, mio::Token(id), interest)?;
        drop(poll);
        self.entries.lock().unwrap().insert(
            id,
            Entry {
                fd,
                interest,
                callback,
            },
        );
        Ok(Token(id))
    }
}

impl Reactor for MioReactor {
    fn register_read(&self, fd: RawFd, callback: ReactorCallback) -> io::Result<Token> {
        self.register(fd, mio::Interest::READABLE, callback)
    }

    fn register_write(&self, fd: RawFd, callback: ReactorCallback) -> io::Result<Token> {
        self.register(fd, mio::Interest::WRITABLE, callback)
    }

    fn deregister(&self, token: Token) -> io::Result<()> {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.remove(&token.0) {
            let poll = self.poll.lock().unwrap();
            let mut source = mio::unix::SourceFd(&entry.fd);
            poll.registry().deregister(&mut source)?;
        }
        Ok(())
    }

    fn poll(&self, timeout: Option<Duration>) -> io::Result<usize> {
        let mut events = mio::Events::with_capacity(64);
        {
            let mut poll = self.poll.lock().unwrap();
            poll.poll(&mut events, timeout)?;
        }
        let mut dispatched = 0;
        // Snapshot the callbacks we need to invoke while holding the lock
        // only briefly, so a callback that re-enters register/deregister
        // on this reactor doesn't deadlock.
        let to_run: Vec<ReactorCallback> = {
            let entries = self.entries.lock().unwrap();
            events
                .iter()
                .filter_map(|ev| entries.get(&ev.token().0))
                .map(|entry| Arc::clone(&entry.callback))
                .collect()
        };
        for cb in to_run {
            cb();
            dispatched += 1;
        }
        Ok(dispatched)
    }
}
