//! Hand-rolled fork-with-pty for platforms without `forkpty(3)`
//!
//! Mirrors what `login_tty(3)` does in the child: new session, slave as the
//! controlling terminal, slave on fds 0-2. Everything after the fork is a raw
//! syscall; nothing allocates.

use std::os::fd::{IntoRawFd, RawFd};

use nix::unistd::{fork, ForkResult};

use super::{Forked, PtyBackend, PtyPair};
use crate::size::WindowSize;
use crate::termios::TerminalConfig;

#[cfg(not(any(target_os = "solaris", target_os = "illumos")))]
const TIOCSCTTY: libc::c_ulong = libc::TIOCSCTTY as libc::c_ulong;

/// `tIOC | 132` from <sys/termios.h>
#[cfg(any(target_os = "solaris", target_os = "illumos"))]
const TIOCSCTTY: libc::c_ulong = ((b't' as libc::c_ulong) << 8) | 132;

/// Fork onto a pair opened by `B`.
///
/// # Safety
///
/// See [`PtyBackend::fork_pty`].
#[cfg_attr(
    not(any(target_os = "solaris", target_os = "illumos")),
    allow(dead_code)
)]
pub(crate) unsafe fn fork_pty<B: PtyBackend>(
    size: WindowSize,
    config: Option<&TerminalConfig>,
) -> nix::Result<Forked> {
    let PtyPair { master, slave } = B::open_pair(size, config)?;

    // SAFETY: the child branch below only performs async-signal-safe calls
    match unsafe { fork() }? {
        ForkResult::Parent { child } => {
            drop(slave);
            Ok(Forked::Parent { child, master })
        }
        ForkResult::Child => {
            drop(master);
            attach_slave(slave.into_raw_fd());
            Ok(Forked::Child)
        }
    }
}

/// Make `slave` the controlling terminal and stdio of the calling process
fn attach_slave(slave: RawFd) {
    // SAFETY: plain syscalls on descriptors owned by this (child) process
    unsafe {
        libc::setsid();

        if libc::ioctl(slave, TIOCSCTTY as _, 0) == -1 {
            libc::_exit(1);
        }

        libc::dup2(slave, libc::STDIN_FILENO);
        libc::dup2(slave, libc::STDOUT_FILENO);
        libc::dup2(slave, libc::STDERR_FILENO);

        if slave > libc::STDERR_FILENO {
            libc::close(slave);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::Platform;
    use nix::sys::wait::{waitpid, WaitStatus};

    #[test]
    fn test_manual_fork_attaches_controlling_terminal() {
        // SAFETY: the child only issues raw syscalls before _exit
        let forked = unsafe { fork_pty::<Platform>(WindowSize::new(80, 24), None) }
            .expect("Failed to fork");

        match forked {
            Forked::Child => {
                // SAFETY: async-signal-safe calls only
                unsafe {
                    let leader = libc::getsid(0) == libc::getpid();
                    let foreground = libc::tcgetpgrp(libc::STDIN_FILENO) == libc::getpid();
                    let tty = libc::isatty(libc::STDOUT_FILENO) == 1;
                    libc::_exit(if leader && foreground && tty { 0 } else { 1 });
                }
            }
            Forked::Parent { child, master: _master } => {
                let status = waitpid(child, None).expect("Failed to wait");
                assert_eq!(status, WaitStatus::Exited(child, 0));
            }
        }
    }
}
