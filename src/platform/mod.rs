//! Platform pty primitives
//!
//! Every platform family implements [`PtyBackend`]; the implementation that
//! matches the build target is exported as [`Platform`]. Callers never branch
//! on the platform at runtime.
//!
//! - glibc, musl, BSD, Darwin: `openpty(3)` / `forkpty(3)`
//! - Solaris, illumos: `/dev/ptmx` plus STREAMS modules, with the fork
//!   sequence performed by hand

use std::ffi::CStr;
use std::os::fd::{OwnedFd, RawFd};

use nix::errno::Errno;
use nix::unistd::Pid;

use crate::size::WindowSize;
use crate::termios::TerminalConfig;

mod manual;
#[cfg(not(any(target_os = "solaris", target_os = "illumos")))]
mod native;
#[cfg(any(target_os = "solaris", target_os = "illumos"))]
mod streams;

#[cfg(not(any(target_os = "solaris", target_os = "illumos")))]
pub(crate) type Platform = native::Native;

#[cfg(any(target_os = "solaris", target_os = "illumos"))]
pub(crate) type Platform = streams::Streams;

/// Both ends of a freshly opened pty
pub(crate) struct PtyPair {
    pub master: OwnedFd,
    pub slave: OwnedFd,
}

/// Outcome of a fork-with-pty, seen from one side of the fork
pub(crate) enum Forked {
    /// The slave is now the caller's controlling terminal and stdio
    Child,
    Parent { child: Pid, master: OwnedFd },
}

pub(crate) trait PtyBackend {
    /// Open a pty pair, applying `config` and `size` to the slave.
    fn open_pair(size: WindowSize, config: Option<&TerminalConfig>) -> nix::Result<PtyPair>;

    /// Open a pty pair and fork, attaching the child to the slave.
    ///
    /// # Safety
    ///
    /// Same contract as `fork(2)` in a multi-threaded process: on
    /// [`Forked::Child`] the caller may only perform async-signal-safe
    /// operations until it execs or `_exit`s.
    unsafe fn fork_pty(size: WindowSize, config: Option<&TerminalConfig>) -> nix::Result<Forked>;
}

/// Resolve the slave device path of a pty master
#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) fn pty_name(master: RawFd) -> nix::Result<String> {
    let mut buf = [0 as libc::c_char; 128];
    // SAFETY: buf is writable for its full length
    let ret = unsafe { libc::ptsname_r(master, buf.as_mut_ptr(), buf.len()) };
    if ret != 0 {
        return Err(Errno::from_i32(ret));
    }
    // SAFETY: ptsname_r NUL-terminates on success
    let name = unsafe { CStr::from_ptr(buf.as_ptr()) };
    Ok(name.to_string_lossy().into_owned())
}

/// Resolve the slave device path of a pty master
///
/// `ptsname(3)` returns a static buffer here, so lookups are serialized.
#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub(crate) fn pty_name(master: RawFd) -> nix::Result<String> {
    use std::sync::{Mutex, PoisonError};

    static PTSNAME_LOCK: Mutex<()> = Mutex::new(());

    let _guard = PTSNAME_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
    // SAFETY: the returned buffer is only read while the lock is held
    let name = unsafe { libc::ptsname(master) };
    if name.is_null() {
        return Err(Errno::last());
    }
    // SAFETY: non-null ptsname results are NUL-terminated
    let name = unsafe { CStr::from_ptr(name) };
    Ok(name.to_string_lossy().into_owned())
}
