//! ptyvisor: pseudo-terminal process supervision
//!
//! Allocates pty pairs, forks children onto them as session leaders with the
//! slave as controlling terminal, and reaps those children on background
//! threads. This crate provides:
//!
//! - `termios`: canonical line discipline baseline
//! - `pty`: master/slave allocation
//! - `spawn`: fork, exec and privilege drop on a fresh pty
//! - `reaper`: one-shot exit delivery
//! - `control`: resize, signal and descriptor mode operations
//! - `foreground`: foreground process lookup
//! - `supervisor`: all of the above behind one handle
//!
//! The crate never reads or writes terminal data; the master descriptor
//! belongs to the caller.

pub mod control;
pub mod error;
pub mod foreground;
mod platform;
pub mod pty;
pub mod reaper;
pub mod size;
pub mod spawn;
pub mod supervisor;
pub mod termios;

pub use control::{is_nonblocking, resize, send_signal, set_nonblocking, window_size, SIGNAL_SUPPORTED};
pub use error::{PtyError, PtyResult};
pub use foreground::{resolve_foreground_command, FOREGROUND_LOOKUP_SUPPORTED};
pub use pty::{allocate, PtySession};
pub use reaper::{ExitReaper, ExitRecord};
pub use size::WindowSize;
pub use spawn::{spawn, ChildProcess, SpawnOptions};
pub use supervisor::Supervisor;
pub use termios::TerminalConfig;

pub use nix::sys::signal::Signal;
pub use nix::unistd::{Gid, Pid, Uid};
