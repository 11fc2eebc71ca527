//! Error types for PTY supervision

use std::io;

use thiserror::Error;

/// PTY supervisor error type
///
/// Every OS-level failure carries the errno reported by the failing call.
#[derive(Error, Debug)]
pub enum PtyError {
    /// The pty pair could not be created (`openpty`, `/dev/ptmx`, STREAMS setup)
    #[error("Failed to allocate PTY: {0}")]
    AllocationFailed(#[source] nix::Error),

    /// A descriptor could not be switched to non-blocking mode during setup
    #[error("Failed to set PTY descriptor non-blocking: {0}")]
    NonBlockingSetupFailed(#[source] nix::Error),

    /// The fork-with-pty primitive failed
    #[error("Failed to fork PTY child: {0}")]
    ForkFailed(#[source] nix::Error),

    /// A terminal ioctl (resize, geometry query, signal) failed
    #[error("ioctl(2) failed: {0}")]
    IoctlFailed(#[source] nix::Error),

    /// fcntl(2) failed
    #[error("fcntl(2) failed: {0}")]
    FcntlFailed(#[source] nix::Error),

    /// The capability does not exist on this platform
    #[error("{0} is not supported on this platform")]
    Unsupported(&'static str),

    /// A caller-supplied string cannot be passed to the OS (interior NUL)
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A watcher is already armed for this pid
    #[error("Process {0} already has an exit watcher")]
    AlreadyWatched(i32),

    /// The watcher thread could not be started
    #[error("Failed to start exit watcher: {0}")]
    WatcherSpawn(#[source] io::Error),
}

/// Result type for PTY operations
pub type PtyResult<T> = Result<T, PtyError>;
