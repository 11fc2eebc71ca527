//! PTY pair allocation
//!
//! Opens a master/slave pair through the platform backend, applies the
//! terminal attributes and geometry to the slave, and switches both ends to
//! non-blocking mode before handing them to the caller.

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

use crate::control;
use crate::error::{PtyError, PtyResult};
use crate::platform::{self, Platform, PtyBackend, PtyPair};
use crate::size::WindowSize;
use crate::termios::TerminalConfig;

/// An open pseudoterminal pair
///
/// Both descriptors are closed when the session is dropped, which releases
/// the pty slot.
#[derive(Debug)]
pub struct PtySession {
    /// The PTY master file descriptor
    master: OwnedFd,
    /// The PTY slave file descriptor, unless taken by the caller
    slave: Option<OwnedFd>,
    /// Path to the slave PTY
    slave_path: String,
}

impl PtySession {
    /// Allocate a new pty pair
    ///
    /// # Arguments
    /// * `size` - Initial window size
    /// * `config` - Terminal attributes for the slave; `None` keeps the
    ///   kernel defaults
    pub fn allocate(size: WindowSize, config: Option<&TerminalConfig>) -> PtyResult<Self> {
        let PtyPair { master, slave } =
            Platform::open_pair(size, config).map_err(PtyError::AllocationFailed)?;

        let slave_path =
            platform::pty_name(master.as_raw_fd()).map_err(PtyError::AllocationFailed)?;

        // On failure both descriptors drop here, so no half-set-up pty escapes
        control::enable_nonblocking(master.as_raw_fd())
            .map_err(PtyError::NonBlockingSetupFailed)?;
        control::enable_nonblocking(slave.as_raw_fd())
            .map_err(PtyError::NonBlockingSetupFailed)?;

        tracing::debug!(
            "Allocated PTY {} ({}x{}), master fd {}",
            slave_path,
            size.cols,
            size.rows,
            master.as_raw_fd()
        );

        Ok(Self {
            master,
            slave: Some(slave),
            slave_path,
        })
    }

    /// Get the raw file descriptor of the PTY master
    pub fn master_fd(&self) -> RawFd {
        self.master.as_raw_fd()
    }

    /// Get the raw file descriptor of the PTY slave, if still held
    pub fn slave_fd(&self) -> Option<RawFd> {
        self.slave.as_ref().map(AsRawFd::as_raw_fd)
    }

    /// Borrow the PTY slave, if still held
    pub fn slave(&self) -> Option<BorrowedFd<'_>> {
        self.slave.as_ref().map(AsFd::as_fd)
    }

    /// Path of the slave device, e.g. `/dev/pts/3`
    pub fn slave_path(&self) -> &str {
        &self.slave_path
    }

    /// Take ownership of the slave descriptor
    pub fn take_slave(&mut self) -> Option<OwnedFd> {
        self.slave.take()
    }

    /// Split into master, slave and slave path
    pub fn into_parts(self) -> (OwnedFd, Option<OwnedFd>, String) {
        (self.master, self.slave, self.slave_path)
    }

    /// Resize the PTY
    pub fn resize(&self, size: WindowSize) -> PtyResult<()> {
        control::resize(self.master_fd(), size)
    }

    /// Current window size of the PTY
    pub fn window_size(&self) -> PtyResult<WindowSize> {
        control::window_size(self.master_fd())
    }
}

impl AsRawFd for PtySession {
    fn as_raw_fd(&self) -> RawFd {
        self.master.as_raw_fd()
    }
}

impl AsFd for PtySession {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.master.as_fd()
    }
}

/// Allocate a pty pair; see [`PtySession::allocate`]
pub fn allocate(size: WindowSize, config: Option<&TerminalConfig>) -> PtyResult<PtySession> {
    PtySession::allocate(size, config)
}
