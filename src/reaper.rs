//! Asynchronous exit reaping
//!
//! Every watched child gets its own thread blocked in `waitpid(2)`. When the
//! child terminates, the worker decodes the status into an [`ExitRecord`] and
//! sends it over a channel. Callbacks never run on the worker: they run in
//! whichever thread calls [`ExitReaper::dispatch`], exactly once per child,
//! after which the worker is joined and the callback dropped.
//!
//! A pid can only be watched by one watcher at a time across the whole
//! process. Waiting on a pid that something outside this crate already reaped
//! (`ECHILD`) is reported as a neutral record.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};

use crate::error::{PtyError, PtyResult};

/// How a child terminated
///
/// Both fields default to zero; at most one of them is set for a given exit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExitRecord {
    /// Exit status passed to `exit(3)`
    pub exit_code: i32,
    /// Number of the signal that terminated the process
    pub signal_code: i32,
}

impl ExitRecord {
    /// Record for a normal exit
    pub fn exited(code: i32) -> Self {
        Self {
            exit_code: code,
            signal_code: 0,
        }
    }

    /// Record for a termination by signal
    pub fn signaled(signal: i32) -> Self {
        Self {
            exit_code: 0,
            signal_code: signal,
        }
    }

    /// Whether the child exited cleanly (or its status was unavailable)
    pub fn success(&self) -> bool {
        self.exit_code == 0 && self.signal_code == 0
    }

    /// The terminating signal, if it is one nix knows about
    pub fn signal(&self) -> Option<Signal> {
        if self.signal_code == 0 {
            return None;
        }
        Signal::try_from(self.signal_code).ok()
    }
}

/// An exit that has been reaped but not yet delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ExitEvent {
    pid: Pid,
    record: ExitRecord,
}

type ExitCallback = Box<dyn FnOnce(ExitRecord) + Send>;

struct Watcher {
    on_exit: ExitCallback,
    thread: JoinHandle<()>,
}

/// Pids with a live watcher, across every reaper in the process
static ARMED: Mutex<BTreeSet<libc::pid_t>> = Mutex::new(BTreeSet::new());

fn armed() -> MutexGuard<'static, BTreeSet<libc::pid_t>> {
    ARMED.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Watches children and delivers their exit records
///
/// Dropping the reaper with watchers still armed discards their callbacks
/// unrun. The worker threads keep waiting and still reap their children, so
/// no zombies are left behind, but the exit records go nowhere.
pub struct ExitReaper {
    sender: Sender<ExitEvent>,
    receiver: Receiver<ExitEvent>,
    watchers: HashMap<Pid, Watcher>,
}

impl ExitReaper {
    pub fn new() -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded();
        Self {
            sender,
            receiver,
            watchers: HashMap::new(),
        }
    }

    /// Start watching `pid`
    ///
    /// `on_exit` is invoked once, from a later [`dispatch`](Self::dispatch)
    /// call, with the child's exit record. There is no way to disarm a
    /// watcher; a caller that loses interest should ignore the delivery.
    pub fn watch<F>(&mut self, pid: Pid, on_exit: F) -> PtyResult<()>
    where
        F: FnOnce(ExitRecord) + Send + 'static,
    {
        // A reaped but undelivered pid still belongs to its watcher
        if self.watchers.contains_key(&pid) || !armed().insert(pid.as_raw()) {
            return Err(PtyError::AlreadyWatched(pid.as_raw()));
        }

        let sender = self.sender.clone();
        let spawned = thread::Builder::new()
            .name(format!("pty-reaper-{}", pid))
            .spawn(move || {
                let record = wait_for_exit(pid);
                armed().remove(&pid.as_raw());
                // The reaper may be gone; then nobody is interested
                let _ = sender.send(ExitEvent { pid, record });
            });

        let thread = match spawned {
            Ok(thread) => thread,
            Err(e) => {
                armed().remove(&pid.as_raw());
                return Err(PtyError::WatcherSpawn(e));
            },
        };

        tracing::debug!("Watching pid {} for exit", pid);
        self.watchers.insert(
            pid,
            Watcher {
                on_exit: Box::new(on_exit),
                thread,
            },
        );
        Ok(())
    }

    /// Whether a watcher for `pid` has not delivered yet
    pub fn is_watching(&self, pid: Pid) -> bool {
        self.watchers.contains_key(&pid)
    }

    /// Number of watchers that have not delivered yet
    pub fn watching(&self) -> usize {
        self.watchers.len()
    }

    /// Deliver every exit that is ready, without blocking
    ///
    /// Returns the number of callbacks invoked.
    pub fn dispatch(&mut self) -> usize {
        let mut delivered = 0;
        while let Ok(event) = self.receiver.try_recv() {
            self.deliver(event);
            delivered += 1;
        }
        delivered
    }

    /// Wait up to `timeout` for an exit, then deliver everything ready
    ///
    /// Returns immediately when nothing is being watched.
    pub fn dispatch_timeout(&mut self, timeout: Duration) -> usize {
        if self.watchers.is_empty() {
            return 0;
        }

        match self.receiver.recv_timeout(timeout) {
            Ok(event) => {
                self.deliver(event);
                1 + self.dispatch()
            },
            Err(_) => 0,
        }
    }

    fn deliver(&mut self, event: ExitEvent) {
        let Some(watcher) = self.watchers.remove(&event.pid) else {
            tracing::error!("Exit of pid {} arrived without a watcher", event.pid);
            return;
        };

        if watcher.thread.join().is_err() {
            tracing::error!("Exit watcher for pid {} panicked", event.pid);
        }

        tracing::debug!(
            "Delivering exit of pid {}: code {}, signal {}",
            event.pid,
            event.record.exit_code,
            event.record.signal_code
        );
        (watcher.on_exit)(event.record);
    }
}

impl Default for ExitReaper {
    fn default() -> Self {
        Self::new()
    }
}

/// Block until `pid` terminates
///
/// Any wait failure other than `EINTR` and `ECHILD` means something else is
/// reaping our children, and the process aborts.
fn wait_for_exit(pid: Pid) -> ExitRecord {
    let mut status: libc::c_int = 0;

    loop {
        // SAFETY: status is a valid out-pointer
        let ret = unsafe { libc::waitpid(pid.as_raw(), &mut status, 0) };
        if ret != -1 {
            return decode_status(status);
        }

        match Errno::last() {
            Errno::EINTR => continue,
            Errno::ECHILD => {
                tracing::warn!("pid {} was reaped elsewhere, reporting neutral exit", pid);
                return ExitRecord::default();
            },
            errno => {
                tracing::error!("waitpid({}) failed: {}", pid, errno);
                std::process::abort();
            },
        }
    }
}

/// Decode a raw waitpid status
fn decode_status(status: libc::c_int) -> ExitRecord {
    if libc::WIFEXITED(status) {
        ExitRecord::exited(libc::WEXITSTATUS(status))
    } else if libc::WIFSIGNALED(status) {
        ExitRecord::signaled(libc::WTERMSIG(status))
    } else {
        ExitRecord::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use std::sync::Arc;
    use std::time::Instant;

    fn dispatch_until_idle(reaper: &mut ExitReaper) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while reaper.watching() > 0 && Instant::now() < deadline {
            reaper.dispatch_timeout(Duration::from_millis(100));
        }
        assert_eq!(reaper.watching(), 0, "Timed out waiting for exits");
    }

    #[test]
    fn test_decode_status() {
        assert_eq!(decode_status(7 << 8), ExitRecord::exited(7));
        assert_eq!(decode_status(0), ExitRecord::exited(0));
        assert_eq!(decode_status(libc::SIGKILL), ExitRecord::signaled(libc::SIGKILL));
        // Stopped by SIGSTOP is neither an exit nor a termination
        assert_eq!(decode_status((libc::SIGSTOP << 8) | 0x7f), ExitRecord::default());
    }

    #[test]
    fn test_exit_record_accessors() {
        let record = ExitRecord::signaled(libc::SIGTERM);
        assert_eq!(record.exit_code, 0);
        assert_eq!(record.signal(), Some(Signal::SIGTERM));
        assert!(!record.success());

        assert!(ExitRecord::default().success());
        assert_eq!(ExitRecord::exited(3).signal(), None);
    }

    #[test]
    fn test_exit_record_json() {
        let json = serde_json::to_string(&ExitRecord::exited(7)).unwrap();
        assert_eq!(json, r#"{"exit_code":7,"signal_code":0}"#);
    }

    #[test]
    fn test_reaps_exit_code() {
        let child = Command::new("/bin/sh").args(["-c", "exit 7"]).spawn().unwrap();
        let pid = Pid::from_raw(child.id() as i32);

        let delivered = Arc::new(Mutex::new(Vec::new()));
        let mut reaper = ExitReaper::new();
        let sink = Arc::clone(&delivered);
        reaper
            .watch(pid, move |record| sink.lock().unwrap().push(record))
            .unwrap();
        assert!(reaper.is_watching(pid));

        dispatch_until_idle(&mut reaper);
        assert_eq!(*delivered.lock().unwrap(), vec![ExitRecord::exited(7)]);
        assert!(!reaper.is_watching(pid));

        // Nothing left to deliver
        assert_eq!(reaper.dispatch(), 0);
    }

    #[test]
    fn test_double_watch_rejected() {
        let mut child = Command::new("/bin/sleep").arg("30").spawn().unwrap();
        let pid = Pid::from_raw(child.id() as i32);

        let mut reaper = ExitReaper::new();
        let (tx, rx) = crossbeam_channel::bounded(1);
        reaper.watch(pid, move |record| tx.send(record).unwrap()).unwrap();

        let err = reaper.watch(pid, |_| {}).unwrap_err();
        assert!(matches!(err, PtyError::AlreadyWatched(p) if p == pid.as_raw()));

        // A second reaper cannot steal the pid either
        let mut other = ExitReaper::new();
        assert!(matches!(
            other.watch(pid, |_| {}),
            Err(PtyError::AlreadyWatched(_))
        ));

        child.kill().unwrap();
        dispatch_until_idle(&mut reaper);
        assert_eq!(rx.try_recv().unwrap(), ExitRecord::signaled(libc::SIGKILL));
    }

    #[test]
    fn test_already_reaped_child_is_neutral() {
        let mut child = Command::new("/bin/sh").args(["-c", "exit 5"]).spawn().unwrap();
        let pid = Pid::from_raw(child.id() as i32);
        assert_eq!(child.wait().unwrap().code(), Some(5));

        let mut reaper = ExitReaper::new();
        let (tx, rx) = crossbeam_channel::bounded(1);
        reaper.watch(pid, move |record| tx.send(record).unwrap()).unwrap();

        dispatch_until_idle(&mut reaper);
        assert_eq!(rx.try_recv().unwrap(), ExitRecord::default());
    }

    #[test]
    fn test_callback_runs_on_dispatching_thread() {
        let child = Command::new("/bin/sh").args(["-c", "exit 0"]).spawn().unwrap();
        let pid = Pid::from_raw(child.id() as i32);

        let mut reaper = ExitReaper::new();
        let (tx, rx) = crossbeam_channel::bounded(1);
        reaper
            .watch(pid, move |_| tx.send(thread::current().id()).unwrap())
            .unwrap();

        dispatch_until_idle(&mut reaper);
        assert_eq!(rx.try_recv().unwrap(), thread::current().id());
    }

    #[test]
    fn test_drop_discards_pending_callbacks() {
        let child = Command::new("/bin/sh").args(["-c", "exit 4"]).spawn().unwrap();
        let pid = Pid::from_raw(child.id() as i32);

        let ran = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&ran);
        let mut reaper = ExitReaper::new();
        reaper.watch(pid, move |_| *flag.lock().unwrap() = true).unwrap();
        drop(reaper);

        // The orphaned worker still reaps; the pid is released afterwards
        let deadline = Instant::now() + Duration::from_secs(10);
        while armed().contains(&pid.as_raw()) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(!armed().contains(&pid.as_raw()));
        assert!(!*ran.lock().unwrap());
    }

    #[test]
    fn test_dispatch_timeout_without_watchers() {
        let mut reaper = ExitReaper::new();
        let start = Instant::now();
        assert_eq!(reaper.dispatch_timeout(Duration::from_secs(5)), 0);
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
