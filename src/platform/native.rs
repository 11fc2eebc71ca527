//! openpty(3) / forkpty(3) backend
//!
//! glibc, musl, the BSDs and Darwin ship both primitives. `forkpty` performs
//! setsid, TIOCSCTTY and the stdio dup2 dance in the child itself.

use std::os::fd::{FromRawFd, OwnedFd};
use std::ptr;

use nix::errno::Errno;
use nix::unistd::Pid;

use super::{Forked, PtyBackend, PtyPair};
use crate::size::WindowSize;
use crate::termios::TerminalConfig;

pub(crate) struct Native;

impl PtyBackend for Native {
    fn open_pair(size: WindowSize, config: Option<&TerminalConfig>) -> nix::Result<PtyPair> {
        let mut master: libc::c_int = -1;
        let mut slave: libc::c_int = -1;
        let mut winsize = size.to_winsize();
        let mut termios = config.map(TerminalConfig::to_libc);
        let termp = termios
            .as_mut()
            .map_or(ptr::null_mut(), |t| t as *mut libc::termios);

        // SAFETY: all pointers are valid for the duration of the call
        let ret = unsafe {
            libc::openpty(
                &mut master,
                &mut slave,
                ptr::null_mut(),
                termp,
                &mut winsize,
            )
        };
        Errno::result(ret)?;

        // SAFETY: openpty succeeded, both descriptors are open and ours
        Ok(unsafe {
            PtyPair {
                master: OwnedFd::from_raw_fd(master),
                slave: OwnedFd::from_raw_fd(slave),
            }
        })
    }

    unsafe fn fork_pty(size: WindowSize, config: Option<&TerminalConfig>) -> nix::Result<Forked> {
        let mut master: libc::c_int = -1;
        let mut winsize = size.to_winsize();
        let mut termios = config.map(TerminalConfig::to_libc);
        let termp = termios
            .as_mut()
            .map_or(ptr::null_mut(), |t| t as *mut libc::termios);

        // SAFETY: pointers are valid; the caller upholds the post-fork contract
        let pid = unsafe { libc::forkpty(&mut master, ptr::null_mut(), termp, &mut winsize) };

        match Errno::result(pid)? {
            0 => Ok(Forked::Child),
            child => Ok(Forked::Parent {
                child: Pid::from_raw(child),
                // SAFETY: forkpty hands the parent an open master descriptor
                master: unsafe { OwnedFd::from_raw_fd(master) },
            }),
        }
    }
}
