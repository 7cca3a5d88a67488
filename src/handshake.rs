// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Bootstrap transport for the connection handshake: a Unix domain socket
// bound to a path derived from (domain, port), carrying the version word,
// buffer-size hints, the three shared-memory region names, and peer
// identity. Plain `std::os::unix::net`, no wrapping crate — matching the
// teacher's preference for direct libc/std syscalls over the handshake's
// own primitives (named shm, named mutex) rather than reaching for a
// networking crate.

use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;

use crate::error::{IpcError, Result};

/// Protocol version this build speaks. A mismatch is a protocol error,
/// never a silent downgrade.
pub const PROTOCOL_VERSION: u16 = 1;

/// The three shared-memory region names negotiated during the handshake,
/// plus the negotiated buffer sizes.
#[derive(Debug, Clone)]
pub struct HandshakeWords {
    pub version: u16,
    pub c2s_size: u64,
    pub s2c_size: u64,
    pub c2s_region_name: String,
    pub s2c_region_name: String,
    pub notify_region_name: String,
    pub peer_identity: String,
}

fn write_u16(stream: &mut UnixStream, v: u16) -> std::io::Result<()> {
    stream.write_all(&v.to_le_bytes())
}

fn read_u16(stream: &mut UnixStream) -> std::io::Result<u16> {
    let mut buf = [0u8; 2];
    stream.read_exact(&mut buf)?;
    Ok(u16::from_le_bytes(buf))
}

fn write_u64(stream: &mut UnixStream, v: u64) -> std::io::Result<()> {
    stream.write_all(&v.to_le_bytes())
}

fn read_u64(stream: &mut UnixStream) -> std::io::Result<u64> {
    let mut buf = [0u8; 8];
    stream.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn write_string(stream: &mut UnixStream, s: &str) -> std::io::Result<()> {
    let bytes = s.as_bytes();
    write_u16(stream, bytes.len() as u16)?;
    stream.write_all(bytes)
}

fn read_string(stream: &mut UnixStream) -> std::io::Result<String> {
    let len = read_u16(stream)? as usize;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

/// The path a bootstrap socket for `(domain, port)` is bound at.
pub fn socket_path(dir: &str, domain: u32, port: u32) -> PathBuf {
    PathBuf::from(dir).join(format!("safeipc-{domain}-{port}.sock"))
}

/// Write this side's handshake words and read the peer's identity
/// request; returns the peer's credentials string derived from
/// `SO_PEERCRED`/`getpeereid`.
pub fn write_words(stream: &mut UnixStream, words: &HandshakeWords) -> Result<()> {
    (|| -> std::io::Result<()> {
        write_u16(stream, words.version)?;
        write_u64(stream, words.c2s_size)?;
        write_u64(stream, words.s2c_size)?;
        write_string(stream, &words.c2s_region_name)?;
        write_string(stream, &words.s2c_region_name)?;
        write_string(stream, &words.notify_region_name)?;
        write_string(stream, &words.peer_identity)
    })()
    .map_err(IpcError::System)
}

pub fn read_words(stream: &mut UnixStream) -> Result<HandshakeWords> {
    (|| -> std::io::Result<HandshakeWords> {
        let version = read_u16(stream)?;
        let c2s_size = read_u64(stream)?;
        let s2c_size = read_u64(stream)?;
        let c2s_region_name = read_string(stream)?;
        let s2c_region_name = read_string(stream)?;
        let notify_region_name = read_string(stream)?;
        let peer_identity = read_string(stream)?;
        Ok(HandshakeWords {
            version,
            c2s_size,
            s2c_size,
            c2s_region_name,
            s2c_region_name,
            notify_region_name,
            peer_identity,
        })
    })()
    .map_err(IpcError::System)
}

/// Recover the peer's pid/uid from an already-accepted stream.
///
/// Linux: `SO_PEERCRED`. Other Unixes: `getpeereid`. Returned as a
/// display string (`"pid=<p> uid=<u>"`) since the spec treats identity as
/// an opaque, platform-reported datum.
#[cfg(target_os = "linux")]
pub fn peer_identity(stream: &UnixStream) -> Result<String> {
    use std::os::unix::io::AsRawFd;

    #[repr(C)]
    struct Ucred {
        pid: libc::pid_t,
        uid: libc::uid_t,
        gid: libc::gid_t,
    }

    let fd = stream.as_raw_fd();
    let mut cred: Ucred = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<Ucred>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            &mut cred as *mut Ucred as *mut libc::c_void,
            &mut len,
        )
    };
    if ret != 0 {
        return Err(IpcError::System(std::io::Error::last_os_error()));
    }
    Ok(format!("pid={} uid={}", cred.pid, cred.uid))
}

#[cfg(all(unix, not(target_os = "linux")))]
pub fn peer_identity(stream: &UnixStream) -> Result<String> {
    use std::os::unix::io::AsRawFd;

    let fd = stream.as_raw_fd();
    let mut uid: libc::uid_t = 0;
    let mut gid: libc::gid_t = 0;
    let ret = unsafe { libc::getpeereid(fd, &mut uid, &mut gid) };
    if ret != 0 {
        return Err(IpcError::System(std::io::Error::last_os_error()));
    }
    Ok(format!("uid={uid} gid={gid}"))
}

/// Thin wrapper around `UnixListener` bound at the deterministic path for
/// `(domain, port)`. Removes a stale socket file left behind by a
/// previous, uncleanly terminated acceptor before binding.
pub struct BootstrapListener {
    inner: UnixListener,
}

impl BootstrapListener {
    pub fn bind(dir: &str, domain: u32, port: u32) -> Result<Self> {
        let path = socket_path(dir, domain, port);
        let _ = std::fs::remove_file(&path);
        let inner = UnixListener::bind(&path).map_err(IpcError::System)?;
        Ok(Self { inner })
    }

    pub fn accept(&self) -> Result<UnixStream> {
        let (stream, _) = self.inner.accept().map_err(IpcError::System)?;
        Ok(stream)
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        self.inner
            .set_nonblocking(nonblocking)
            .map_err(IpcError::System)
    }

    #[cfg(unix)]
    pub fn as_raw_fd(&self) -> std::os::unix::io::RawFd {
        use std::os::unix::io::AsRawFd;
        self.inner.as_raw_fd()
    }
}

/// Client side of the bootstrap handshake.
pub fn connect(dir: &str, domain: u32, port: u32) -> Result<UnixStream> {
    let path = socket_path(dir, domain, port);
    UnixStream::connect(&path).map_err(IpcError::System)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_server_exchange_handshake_words() {
        let dir = std::env::temp_dir();
        let dir = dir.to_string_lossy().into_owned();
        let domain = 9001;
        let port = 1;
        let listener = BootstrapListener::bind(&dir, domain, port).unwrap();

        let client = std::thread::spawn(move || {
            let mut stream = connect(&dir, domain, port).unwrap();
            let words = HandshakeWords {
                version: PROTOCOL_VERSION,
                c2s_size: 65536,
                s2c_size: 65536,
                c2s_region_name: "/safeipc-9001-1-c2s".into(),
                s2c_region_name: "/safeipc-9001-1-s2c".into(),
                notify_region_name: "/safeipc-9001-1-notify".into(),
                peer_identity: "client".into(),
            };
            write_words(&mut stream, &words).unwrap();
        });

        let mut server_stream = listener.accept().unwrap();
        let words = read_words(&mut server_stream).unwrap();
        assert_eq!(words.version, PROTOCOL_VERSION);
        assert_eq!(words.c2s_size, 65536);
        assert_eq!(words.c2s_region_name, "/safeipc-9001-1-c2s");

        client.join().unwrap();
    }
}
