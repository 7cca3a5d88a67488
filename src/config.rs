// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Process-wide configuration: one environment variable read once via
// OnceLock (matching the caching discipline `platform::posix` already
// uses for shm/mutex handles), plus an optional JSON config file.

use std::sync::OnceLock;

/// Default shared-memory ring size when neither the environment variable
/// nor an explicit `SafeIpcConfig` override it.
const BUILTIN_DEFAULT_SHM_SIZE: usize = 128 * 1024;

/// Reads `AMSR_IPC_DEFAULT_SHM_SIZE` (bytes) once per process.
///
/// Invalid or missing values fall back to [`BUILTIN_DEFAULT_SHM_SIZE`].
pub fn default_shm_size() -> usize {
    static VALUE: OnceLock<usize> = OnceLock::new();
    *VALUE.get_or_init(|| {
        std::env::var("AMSR_IPC_DEFAULT_SHM_SIZE")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .filter(|&n| n > 0)
            .unwrap_or(BUILTIN_DEFAULT_SHM_SIZE)
    })
}

/// Tunable limits for a `safeipc` deployment.
///
/// All fields have defaults matching the platform constants used when no
/// config is supplied, so `SafeIpcConfig::default()` behaves identically
/// to not loading a config at all.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct SafeIpcConfig {
    /// Minimum ring buffer size (bytes) a `Connection` will negotiate.
    pub platform_min_buffer_size: usize,
    /// Maximum number of in-flight handshakes an `Acceptor` will queue.
    pub max_backlog: usize,
    /// Maximum number of simultaneously registered Core B receivers.
    pub max_receivers: usize,
    /// Maximum number of distinct receiver classes a `slot::Server` tracks.
    pub max_slot_classes: usize,
    /// Directory the bootstrap Unix domain socket is created in.
    pub bootstrap_socket_dir: String,
}

impl Default for SafeIpcConfig {
    fn default() -> Self {
        Self {
            platform_min_buffer_size: default_shm_size(),
            max_backlog: 16,
            max_receivers: 32,
            max_slot_classes: 8,
            bootstrap_socket_dir: std::env::temp_dir().to_string_lossy().into_owned(),
        }
    }
}

impl SafeIpcConfig {
    /// Parse a `SafeIpcConfig` from a JSON string.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    /// Load and parse a `SafeIpcConfig` from a JSON file on disk.
    pub fn from_json_file(path: impl AsRef<std::path::Path>) -> std::io::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}
