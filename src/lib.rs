// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Same-host shared-memory IPC for Adaptive applications: a point-to-point
// bidirectional stream transport (`connection`, `acceptor`) over paired
// ring buffers and a notification channel, plus a one-writer/many-reader
// zero-copy slot router (`slot`). Built on the same shared-memory,
// named-mutex and lock-free primitives as cpp-ipc.

pub mod shm_name;

mod platform;

pub mod shm;
pub use shm::{ShmHandle, ShmOpenMode};

mod mutex;
pub use mutex::IpcMutex;

mod condition;
pub use condition::IpcCondition;

mod spin_lock;
pub use spin_lock::SpinLock;

mod rw_lock;
pub use rw_lock::RwLock;

mod circ;

mod waiter;
pub use waiter::Waiter;

pub mod error;
pub use error::{IpcError, Result};

pub mod config;
pub use config::SafeIpcConfig;

pub mod reactor;
pub use reactor::{MioReactor, Reactor, ReactorCallback, Token};

pub mod ring;
pub use ring::Ring;

pub mod frame;
pub use frame::{AttachedHandle, Frame, MessageFormat, SeqCounter, SeqValidator};

pub mod notify;
pub use notify::NotificationChannel;

pub mod handshake;

pub mod connection;
pub use connection::{ConnState, Connection, ConnectionId, PendingMsgInfo, ReceivedSync};

pub mod acceptor;
pub use acceptor::Acceptor;

pub mod someip;

pub mod slot;
