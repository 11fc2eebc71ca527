//! STREAMS pty backend for Solaris and illumos
//!
//! There is no `openpty` here: the clone device is opened directly and the
//! terminal emulation modules are pushed onto the slave by hand.

use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd};

use nix::errno::Errno;
use nix::fcntl::{open, OFlag};
use nix::sys::stat::Mode;

use super::{manual, pty_name, Forked, PtyBackend, PtyPair};
use crate::size::WindowSize;
use crate::termios::TerminalConfig;

/// `I_PUSH` from <stropts.h>: `('S' << 8) | 02`
const I_PUSH: libc::c_int = ((b'S' as libc::c_int) << 8) | 0o2;

/// Pushed in this order: pty emulation, line discipline, BSD compatibility
const STREAMS_MODULES: [&[u8]; 3] = [b"ptem\0", b"ldterm\0", b"ttcompat\0"];

pub(crate) struct Streams;

impl PtyBackend for Streams {
    fn open_pair(size: WindowSize, config: Option<&TerminalConfig>) -> nix::Result<PtyPair> {
        let master = open("/dev/ptmx", OFlag::O_RDWR | OFlag::O_NOCTTY, Mode::empty())?;
        // SAFETY: open succeeded; from here on the master closes on every error path
        let master = unsafe { OwnedFd::from_raw_fd(master) };

        // SAFETY: master is a valid pty clone descriptor
        Errno::result(unsafe { libc::grantpt(master.as_raw_fd()) })?;
        Errno::result(unsafe { libc::unlockpt(master.as_raw_fd()) })?;

        let slave_path = pty_name(master.as_raw_fd())?;
        let slave = open(
            slave_path.as_str(),
            OFlag::O_RDWR | OFlag::O_NOCTTY,
            Mode::empty(),
        )?;
        // SAFETY: open succeeded
        let slave = unsafe { OwnedFd::from_raw_fd(slave) };

        for module in STREAMS_MODULES {
            // SAFETY: module names are NUL-terminated static strings
            let ret = unsafe { libc::ioctl(slave.as_raw_fd(), I_PUSH as _, module.as_ptr()) };
            Errno::result(ret)?;
        }

        if let Some(config) = config {
            config.apply(slave.as_fd())?;
        }

        let winsize = size.to_winsize();
        // SAFETY: TIOCSWINSZ reads a winsize that outlives the call
        let ret = unsafe { libc::ioctl(slave.as_raw_fd(), libc::TIOCSWINSZ as _, &winsize) };
        Errno::result(ret)?;

        Ok(PtyPair { master, slave })
    }

    unsafe fn fork_pty(size: WindowSize, config: Option<&TerminalConfig>) -> nix::Result<Forked> {
        // SAFETY: forwarded from the caller
        unsafe { manual::fork_pty::<Self>(size, config) }
    }
}
