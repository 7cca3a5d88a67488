// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors

#[cfg(unix)]
pub mod posix;

#[cfg(windows)]
pub mod windows;

// Re-export the platform-specific implementations under a uniform name.

#[cfg(unix)]
pub use posix::PlatformShm;
#[cfg(unix)]
pub use posix::PlatformMutex;

#[cfg(windows)]
pub use windows::PlatformShm;
#[cfg(windows)]
pub use windows::PlatformMutex;

/// Is `pid` still a live process? Used to tell a peer that vanished
/// without an orderly close (crash, kill signal, OOM) from one that is
/// merely quiet. A `false` result is conclusive; a `true` result is
/// best-effort (the pid could have been reused by an unrelated process
/// by the time the caller acts on it).
#[cfg(unix)]
pub fn process_is_alive(pid: u32) -> bool {
    // kill(pid, 0) sends no signal; it only probes permission/existence.
    if unsafe { libc::kill(pid as libc::pid_t, 0) } == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}

#[cfg(windows)]
pub fn process_is_alive(pid: u32) -> bool {
    use windows_sys::Win32::Foundation::CloseHandle;
    use windows_sys::Win32::System::Threading::{
        GetExitCodeProcess, OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION, STILL_ACTIVE,
    };

    unsafe {
        let handle = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid);
        if handle == 0 {
            return false;
        }
        let mut code: u32 = 0;
        let queried = GetExitCodeProcess(handle, &mut code);
        CloseHandle(handle);
        queried != 0 && code == STILL_ACTIVE as u32
    }
}
