//! Foreground process lookup
//!
//! Finds the process group leader currently in the foreground of a terminal
//! and reports its command name. Lookups are best-effort: any failure yields
//! `None`.

use std::os::fd::RawFd;

/// Whether [`resolve_foreground_command`] can return anything on this platform
pub const FOREGROUND_LOOKUP_SUPPORTED: bool =
    cfg!(any(target_os = "linux", target_os = "android", target_os = "macos"));

/// Name of the command in the foreground of the terminal behind `fd`
///
/// On Linux this is the first word of the process command line (usually the
/// path it was started with). On macOS it is the kernel's short process name.
pub fn resolve_foreground_command(fd: RawFd) -> Option<String> {
    // SAFETY: tcgetpgrp only reads from the descriptor
    let pgrp = unsafe { libc::tcgetpgrp(fd) };
    if pgrp <= 0 {
        return None;
    }

    let name = command_name(pgrp);
    tracing::trace!("Foreground of fd {} is pgrp {}: {:?}", fd, pgrp, name);
    name
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn command_name(pid: libc::pid_t) -> Option<String> {
    let cmdline = std::fs::read(format!("/proc/{}/cmdline", pid)).ok()?;
    let first = cmdline.split(|&b| b == 0).next()?;
    if first.is_empty() {
        return None;
    }
    Some(String::from_utf8_lossy(first).into_owned())
}

#[cfg(target_os = "macos")]
fn command_name(pid: libc::pid_t) -> Option<String> {
    let mut buffer = [0u8; 256];
    // SAFETY: proc_name writes at most buffer.len() bytes
    let len = unsafe { libc::proc_name(pid, buffer.as_mut_ptr().cast(), buffer.len() as u32) };
    if len <= 0 {
        return None;
    }
    Some(String::from_utf8_lossy(&buffer[..len as usize]).into_owned())
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "macos")))]
fn command_name(_pid: libc::pid_t) -> Option<String> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pty::PtySession;
    use crate::size::WindowSize;

    #[test]
    fn test_bare_pty_has_no_foreground() {
        let session = PtySession::allocate(WindowSize::default(), None).unwrap();
        assert_eq!(resolve_foreground_command(session.master_fd()), None);
    }

    #[test]
    fn test_bad_fd() {
        assert_eq!(resolve_foreground_command(-1), None);
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    #[test]
    fn test_command_name_of_self() {
        let name = command_name(std::process::id() as libc::pid_t).unwrap();
        assert!(!name.is_empty());
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    #[test]
    fn test_command_name_of_missing_process() {
        assert_eq!(command_name(i32::MAX), None);
    }
}
