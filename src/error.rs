// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Error taxonomy for the connection and slot-router protocols.

use std::io;

/// The error kinds a SafeIPC operation can produce.
///
/// `ApiMisuse` is deliberately not meant to be matched on and recovered
/// from in the usual sense — operations that would otherwise return it
/// instead abort the process (see `slot::token`), because by construction
/// the caller has violated an invariant the protocol cannot repair.
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    /// The peer has not completed the handshake, or has torn down the
    /// connection; no further data-path operations are possible.
    /// `abnormal` distinguishes a peer that called `Close` in the
    /// ordinary way (`false`) from one that vanished without it — process
    /// death, a kill signal, a protocol violation serious enough to tear
    /// the transport down (`true`).
    #[error("connection is disconnected ({})", if *abnormal { "peer did not close it; abnormal" } else { "peer closed it; orderly" })]
    Disconnected { abnormal: bool },

    /// A send could not make progress because the peer isn't draining
    /// its ring fast enough and the caller asked not to block.
    #[error("operation would block: peer is not consuming fast enough")]
    Busy,

    /// A message (or a ring/slot region sized to hold one) exceeds a
    /// hard capacity limit.
    #[error("message of {actual} bytes exceeds the {limit} byte limit")]
    MessageTooLarge { actual: usize, limit: usize },

    /// A resource pool (slots, receivers, backlog entries) is exhausted.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),

    /// A frame or handshake word failed its corruption check, or carried
    /// a value the protocol does not allow (e.g. sequence number 0).
    #[error("protocol error: {0}")]
    ProtocolError(&'static str),

    /// The connection, ring, or slot table has not been opened/attached
    /// yet and an operation that requires it was attempted.
    #[error("object is not initialized")]
    Uninitialized,

    /// The caller violated an API invariant (e.g. dropped a `SlotToken`
    /// without returning it). Constructing this variant is reserved for
    /// call sites that are about to abort, not for normal error returns.
    #[error("API misuse: {0}")]
    ApiMisuse(&'static str),

    /// An underlying OS call (shm, mmap, socket, mutex) failed.
    #[error("system error: {0}")]
    System(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, IpcError>;
