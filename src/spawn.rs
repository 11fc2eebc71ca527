//! Child process spawning on a fresh pty
//!
//! All C strings and pointer arrays the child needs are built before the
//! fork. Between fork and exec the child only issues raw syscalls: chdir,
//! setgid/setuid, swapping `environ`, execvp and, on any failure, a write to
//! stderr followed by `_exit(1)`. Nothing allocates there and no destructor
//! runs, so a multi-threaded parent cannot deadlock the child.

use std::ffi::{CString, OsStr};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::ptr;

use nix::errno::Errno;
use nix::sys::signal::{self, SigHandler, Signal};
use nix::unistd::{self, Gid, Pid, Uid};

use crate::control;
use crate::error::{PtyError, PtyResult};
use crate::foreground;
use crate::platform::{self, Forked, Platform, PtyBackend};
use crate::size::WindowSize;
use crate::termios::TerminalConfig;

/// Everything needed to fork and exec a child on a pty
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    /// Executable path or name, also used as argv[0]
    program: CString,
    /// Arguments after argv[0]
    args: Vec<CString>,
    /// `KEY=VALUE` entries forming the child's whole environment
    env: Vec<CString>,
    /// Working directory; empty means inherit
    cwd: Option<CString>,
    /// Initial window size
    size: WindowSize,
    /// Line discipline of the slave
    terminal: TerminalConfig,
    uid: Option<Uid>,
    gid: Option<Gid>,
}

impl SpawnOptions {
    /// Options for running `program` with no arguments and an empty environment
    pub fn new<S: AsRef<OsStr>>(program: S) -> PtyResult<Self> {
        Ok(Self {
            program: c_string("program", program.as_ref())?,
            args: Vec::new(),
            env: Vec::new(),
            cwd: None,
            size: WindowSize::default(),
            terminal: TerminalConfig::default(),
            uid: None,
            gid: None,
        })
    }

    /// Add an argument
    pub fn arg<S: AsRef<OsStr>>(mut self, arg: S) -> PtyResult<Self> {
        self.args.push(c_string("argument", arg.as_ref())?);
        Ok(self)
    }

    /// Add multiple arguments
    pub fn args<I, S>(mut self, args: I) -> PtyResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        for arg in args {
            self = self.arg(arg)?;
        }
        Ok(self)
    }

    /// Set an environment variable
    pub fn env<K: AsRef<OsStr>, V: AsRef<OsStr>>(mut self, key: K, value: V) -> PtyResult<Self> {
        let mut var = key.as_ref().as_bytes().to_vec();
        var.push(b'=');
        var.extend_from_slice(value.as_ref().as_bytes());
        self.env.push(c_string("environment entry", OsStr::from_bytes(&var))?);
        Ok(self)
    }

    /// Add a pre-joined `KEY=VALUE` environment entry
    pub fn env_entry<S: AsRef<OsStr>>(mut self, entry: S) -> PtyResult<Self> {
        self.env.push(c_string("environment entry", entry.as_ref())?);
        Ok(self)
    }

    /// Set multiple environment variables
    pub fn envs<I, K, V>(mut self, vars: I) -> PtyResult<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<OsStr>,
        V: AsRef<OsStr>,
    {
        for (key, value) in vars {
            self = self.env(key, value)?;
        }
        Ok(self)
    }

    /// Copy the supervisor's own environment into the child's
    pub fn inherit_env(self) -> PtyResult<Self> {
        self.envs(std::env::vars_os())
    }

    /// Set the working directory; an empty path keeps the parent's
    pub fn current_dir<S: AsRef<OsStr>>(mut self, dir: S) -> PtyResult<Self> {
        let dir = dir.as_ref();
        self.cwd = if dir.is_empty() {
            None
        } else {
            Some(c_string("working directory", dir)?)
        };
        Ok(self)
    }

    /// Set the initial window size
    pub fn size(mut self, size: WindowSize) -> Self {
        self.size = size;
        self
    }

    /// Replace the terminal attributes
    pub fn terminal(mut self, terminal: TerminalConfig) -> Self {
        self.terminal = terminal;
        self
    }

    /// Reset the terminal attributes to the baseline, with or without UTF-8
    pub fn utf8(mut self, utf8: bool) -> Self {
        self.terminal = TerminalConfig::new(utf8);
        self
    }

    /// Run the child as this user; only honoured together with [`gid`](Self::gid)
    pub fn uid(mut self, uid: Uid) -> Self {
        self.uid = Some(uid);
        self
    }

    /// Run the child with this group; only honoured together with [`uid`](Self::uid)
    pub fn gid(mut self, gid: Gid) -> Self {
        self.gid = Some(gid);
        self
    }

    pub fn program(&self) -> &OsStr {
        OsStr::from_bytes(self.program.as_bytes())
    }

    pub fn window_size(&self) -> WindowSize {
        self.size
    }

    /// Fork and exec the child; see [`spawn`]
    pub fn spawn(self) -> PtyResult<ChildProcess> {
        spawn(self)
    }
}

fn c_string(what: &str, value: &OsStr) -> PtyResult<CString> {
    CString::new(value.as_bytes()).map_err(|_| {
        PtyError::InvalidArgument(format!(
            "{} contains a NUL byte: {:?}",
            what,
            value.to_string_lossy()
        ))
    })
}

/// A child process running on a pty
///
/// The master descriptor is closed when this is dropped. Dropping does not
/// signal or reap the child.
#[derive(Debug)]
pub struct ChildProcess {
    /// Child process ID
    pid: Pid,
    /// The PTY master
    master: OwnedFd,
    /// Path to the slave PTY
    pty_path: String,
}

impl ChildProcess {
    /// Get the child process ID
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Get the raw file descriptor of the PTY master
    pub fn master_fd(&self) -> RawFd {
        self.master.as_raw_fd()
    }

    /// Path of the slave device the child is attached to
    pub fn pty_path(&self) -> &str {
        &self.pty_path
    }

    /// Take the master descriptor
    pub fn into_master(self) -> OwnedFd {
        self.master
    }

    /// Resize the PTY
    pub fn resize(&self, size: WindowSize) -> PtyResult<()> {
        control::resize(self.master_fd(), size)
    }

    /// Current window size of the PTY
    pub fn window_size(&self) -> PtyResult<WindowSize> {
        control::window_size(self.master_fd())
    }

    /// Signal the terminal's foreground process group
    pub fn signal(&self, signal: Signal) -> PtyResult<()> {
        control::send_signal(self.master_fd(), signal)
    }

    /// Command running in the terminal's foreground
    pub fn foreground_command(&self) -> Option<String> {
        foreground::resolve_foreground_command(self.master_fd())
    }
}

impl AsRawFd for ChildProcess {
    fn as_raw_fd(&self) -> RawFd {
        self.master.as_raw_fd()
    }
}

impl AsFd for ChildProcess {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.master.as_fd()
    }
}

/// Fork a child attached to a new pty and exec the requested program
///
/// The child becomes a session leader with the pty slave as its controlling
/// terminal and stdio. The returned master is non-blocking. Nothing reaps the
/// child; arm an [`ExitReaper`](crate::ExitReaper) or use
/// [`Supervisor::fork`](crate::Supervisor::fork).
pub fn spawn(options: SpawnOptions) -> PtyResult<ChildProcess> {
    let program = options.program().to_string_lossy().into_owned();
    let size = options.size;
    let terminal = options.terminal.clone();
    let plan = ExecPlan::new(options);

    // Interrupts must reach the session even if the host ignores SIGINT
    // SAFETY: installs the default disposition, no handler code involved
    if let Err(e) = unsafe { signal::signal(Signal::SIGINT, SigHandler::SigDfl) } {
        tracing::warn!("Failed to reset SIGINT disposition: {}", e);
    }

    // SAFETY: the child branch only runs ExecPlan::exec, which is async-signal-safe
    let forked = unsafe { Platform::fork_pty(size, Some(&terminal)) };

    let (child, master) = match forked {
        Ok(Forked::Child) => plan.exec(),
        Ok(Forked::Parent { child, master }) => (child, master),
        Err(e) => {
            tracing::error!("Failed to fork {}: {}", program, e);
            return Err(PtyError::ForkFailed(e));
        },
    };
    drop(plan);

    if let Err(e) = control::enable_nonblocking(master.as_raw_fd()) {
        discard_child(child);
        return Err(PtyError::NonBlockingSetupFailed(e));
    }

    let pty_path = match platform::pty_name(master.as_raw_fd()) {
        Ok(path) => path,
        Err(e) => {
            discard_child(child);
            return Err(PtyError::AllocationFailed(e));
        },
    };

    tracing::info!("Spawned {} as pid {} on {}", program, child, pty_path);

    Ok(ChildProcess {
        pid: child,
        master,
        pty_path,
    })
}

/// Kill and reap a child nobody is going to watch
pub(crate) fn discard_child(pid: Pid) {
    tracing::warn!("Discarding child {}", pid);
    let _ = signal::kill(pid, Signal::SIGKILL);
    loop {
        match nix::sys::wait::waitpid(pid, None) {
            Err(Errno::EINTR) => continue,
            _ => break,
        }
    }
}

/// Pre-built exec arguments
///
/// The pointer arrays point into the `CString`s owned alongside them and are
/// NUL-terminated, ready for `execvp`.
struct ExecPlan {
    _argv: Vec<CString>,
    argv: Vec<*const libc::c_char>,
    _envp: Vec<CString>,
    envp: Vec<*const libc::c_char>,
    cwd: Option<CString>,
    credentials: Option<(Gid, Uid)>,
}

impl ExecPlan {
    fn new(options: SpawnOptions) -> Self {
        let SpawnOptions {
            program,
            args,
            env,
            cwd,
            uid,
            gid,
            ..
        } = options;

        let mut argv_storage = Vec::with_capacity(args.len() + 1);
        argv_storage.push(program);
        argv_storage.extend(args);

        let argv = null_terminated(&argv_storage);
        let envp = null_terminated(&env);

        let credentials = match (uid, gid) {
            (Some(uid), Some(gid)) => Some((gid, uid)),
            _ => None,
        };

        Self {
            _argv: argv_storage,
            argv,
            _envp: env,
            envp,
            cwd,
            credentials,
        }
    }

    /// Replace the current (forked) process image
    fn exec(&self) -> ! {
        if let Some(cwd) = &self.cwd {
            if unistd::chdir(cwd.as_c_str()).is_err() {
                child_exit(b"chdir(2) failed.\n");
            }
        }

        // Group first: after setuid we may no longer be allowed to setgid
        if let Some((gid, uid)) = self.credentials {
            if unistd::setgid(gid).is_err() {
                child_exit(b"setgid(2) failed.\n");
            }
            if unistd::setuid(uid).is_err() {
                child_exit(b"setuid(2) failed.\n");
            }
        }

        // SAFETY: this process is the single-threaded fork child, and both
        // arrays stay alive until execvp replaces the image
        unsafe {
            replace_environ(self.envp.as_ptr());
            libc::execvp(self.argv[0], self.argv.as_ptr());
        }

        child_exit(b"execvp(3) failed.\n")
    }
}

fn null_terminated(strings: &[CString]) -> Vec<*const libc::c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(ptr::null()))
        .collect()
}

/// Report a post-fork failure and leave without running any cleanup
fn child_exit(message: &[u8]) -> ! {
    // SAFETY: write(2) and _exit(2) are async-signal-safe
    unsafe {
        libc::write(libc::STDERR_FILENO, message.as_ptr().cast(), message.len());
        libc::_exit(1)
    }
}

#[cfg(target_os = "macos")]
unsafe fn replace_environ(envp: *const *const libc::c_char) {
    *libc::_NSGetEnviron() = envp as *mut *mut libc::c_char;
}

#[cfg(not(target_os = "macos"))]
unsafe fn replace_environ(envp: *const *const libc::c_char) {
    extern "C" {
        static mut environ: *const *const libc::c_char;
    }
    environ = envp;
}
