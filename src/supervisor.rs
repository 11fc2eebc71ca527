//! Process supervisor facade
//!
//! Bundles allocation, spawning, terminal control and exit reaping behind one
//! handle. The supervisor owns an [`ExitReaper`]; exit callbacks registered
//! with [`Supervisor::fork`] run in whichever thread calls
//! [`Supervisor::dispatch`] or [`Supervisor::dispatch_timeout`].

use std::os::fd::RawFd;
use std::time::Duration;

use nix::sys::signal::Signal;

use crate::control;
use crate::error::PtyResult;
use crate::foreground;
use crate::pty::PtySession;
use crate::reaper::{ExitReaper, ExitRecord};
use crate::size::WindowSize;
use crate::spawn::{self, ChildProcess, SpawnOptions};

/// Spawns children on ptys and tracks their exits
///
/// Callbacks still pending when the supervisor is dropped never run; see
/// [`ExitReaper`].
#[derive(Default)]
pub struct Supervisor {
    reaper: ExitReaper,
}

impl Supervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a child on a new pty and watch it
    ///
    /// `on_exit` runs exactly once, from a later dispatch call, after this
    /// function has returned.
    pub fn fork<F>(&mut self, options: SpawnOptions, on_exit: F) -> PtyResult<ChildProcess>
    where
        F: FnOnce(ExitRecord) + Send + 'static,
    {
        let child = spawn::spawn(options)?;

        if let Err(e) = self.reaper.watch(child.pid(), on_exit) {
            // An unwatched child would never be reaped
            spawn::discard_child(child.pid());
            return Err(e);
        }

        Ok(child)
    }

    /// Allocate a bare pty pair with the default terminal attributes
    pub fn open(&self, cols: u16, rows: u16) -> PtyResult<PtySession> {
        PtySession::allocate(WindowSize::new(cols, rows), None)
    }

    /// Resize the pty behind `fd`
    pub fn resize(&self, fd: RawFd, cols: u16, rows: u16) -> PtyResult<()> {
        control::resize(fd, WindowSize::new(cols, rows))
    }

    /// Signal the foreground process group of the pty behind `fd`
    pub fn kill(&self, fd: RawFd, signal: Signal) -> PtyResult<()> {
        control::send_signal(fd, signal)
    }

    /// Command running in the foreground of the pty behind `fd`
    ///
    /// The slave path is accepted for callers that track it but is not needed
    /// by any lookup.
    pub fn process(&self, fd: RawFd, _tty: Option<&str>) -> Option<String> {
        foreground::resolve_foreground_command(fd)
    }

    /// Deliver ready exits without blocking
    pub fn dispatch(&mut self) -> usize {
        self.reaper.dispatch()
    }

    /// Wait up to `timeout` for an exit and deliver what is ready
    pub fn dispatch_timeout(&mut self, timeout: Duration) -> usize {
        self.reaper.dispatch_timeout(timeout)
    }

    /// Number of children whose exit has not been delivered
    pub fn watching(&self) -> usize {
        self.reaper.watching()
    }

    /// Access the underlying reaper, e.g. to watch children spawned elsewhere
    pub fn reaper_mut(&mut self) -> &mut ExitReaper {
        &mut self.reaper
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Instant;

    #[test]
    fn test_fork_delivers_after_return() {
        let mut supervisor = Supervisor::new();
        let delivered = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&delivered);

        let options = SpawnOptions::new("/bin/sh")
            .unwrap()
            .args(["-c", "exit 3"])
            .unwrap();
        let child = supervisor
            .fork(options, move |record| *sink.lock().unwrap() = Some(record))
            .unwrap();

        // Nothing can be delivered before a dispatch call
        assert!(delivered.lock().unwrap().is_none());
        assert_eq!(supervisor.watching(), 1);
        assert!(child.pid().as_raw() > 0);

        let deadline = Instant::now() + Duration::from_secs(10);
        while supervisor.watching() > 0 && Instant::now() < deadline {
            supervisor.dispatch_timeout(Duration::from_millis(100));
        }
        assert_eq!(*delivered.lock().unwrap(), Some(ExitRecord::exited(3)));
    }

    #[test]
    fn test_reaper_mut_watches_foreign_children() {
        let mut supervisor = Supervisor::new();
        let child = std::process::Command::new("/bin/sh")
            .args(["-c", "exit 9"])
            .spawn()
            .unwrap();
        let pid = nix::unistd::Pid::from_raw(child.id() as i32);

        let (tx, rx) = crossbeam_channel::bounded(1);
        supervisor
            .reaper_mut()
            .watch(pid, move |record| tx.send(record).unwrap())
            .unwrap();
        assert_eq!(supervisor.watching(), 1);

        let deadline = Instant::now() + Duration::from_secs(10);
        while supervisor.watching() > 0 && Instant::now() < deadline {
            supervisor.dispatch_timeout(Duration::from_millis(100));
        }
        assert_eq!(rx.try_recv().unwrap(), ExitRecord::exited(9));
    }

    #[test]
    fn test_open_and_resize() {
        let supervisor = Supervisor::new();
        let session = supervisor.open(80, 24).unwrap();

        supervisor.resize(session.master_fd(), 80, 24).unwrap();
        assert_eq!(session.window_size().unwrap(), WindowSize::new(80, 24));
    }

    #[test]
    fn test_process_on_idle_pty() {
        let supervisor = Supervisor::new();
        let session = supervisor.open(80, 24).unwrap();
        assert_eq!(supervisor.process(session.master_fd(), Some(session.slave_path())), None);
    }
}
