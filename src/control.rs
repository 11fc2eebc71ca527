//! Runtime operations on a live pty
//!
//! All functions take the raw master descriptor; ownership stays with the
//! caller.

use std::os::fd::RawFd;

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::signal::Signal;

use crate::error::{PtyError, PtyResult};
use crate::size::WindowSize;

/// `TIOCSIG`: deliver a signal to the foreground process group of the slave
#[cfg(all(
    any(target_os = "linux", target_os = "android"),
    not(any(
        target_arch = "mips",
        target_arch = "mips64",
        target_arch = "powerpc",
        target_arch = "powerpc64",
        target_arch = "sparc64"
    ))
))]
const TIOCSIG: libc::c_ulong = 0x4004_5436;

#[cfg(all(
    any(target_os = "linux", target_os = "android"),
    any(
        target_arch = "mips",
        target_arch = "mips64",
        target_arch = "powerpc",
        target_arch = "powerpc64",
        target_arch = "sparc64"
    )
))]
const TIOCSIG: libc::c_ulong = 0x8004_5436;

#[cfg(any(target_os = "macos", target_os = "ios"))]
const TIOCSIG: libc::c_ulong = 0x2000_745f;

#[cfg(any(target_os = "freebsd", target_os = "dragonfly"))]
const TIOCSIG: libc::c_ulong = 0x2004_745f;

/// Whether [`send_signal`] can work on this platform
pub const SIGNAL_SUPPORTED: bool = cfg!(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "dragonfly"
));

/// Set the window size of a pty
pub fn resize(fd: RawFd, size: WindowSize) -> PtyResult<()> {
    let winsize = size.to_winsize();

    // SAFETY: TIOCSWINSZ is a valid ioctl for setting window size
    let result = unsafe { libc::ioctl(fd, libc::TIOCSWINSZ as _, &winsize) };

    Errno::result(result).map_err(PtyError::IoctlFailed)?;
    Ok(())
}

/// Get the window size of a pty
pub fn window_size(fd: RawFd) -> PtyResult<WindowSize> {
    let mut winsize = libc::winsize {
        ws_row: 0,
        ws_col: 0,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };

    // SAFETY: TIOCGWINSZ is a valid ioctl for getting window size
    let result = unsafe { libc::ioctl(fd, libc::TIOCGWINSZ as _, &mut winsize) };

    Errno::result(result).map_err(PtyError::IoctlFailed)?;
    Ok(WindowSize::from(winsize))
}

/// Send a signal to the foreground process group of the terminal
///
/// Linux only generates the keyboard signals here: `SIGINT`, `SIGQUIT` and
/// `SIGTSTP`. Any other signal fails with `IoctlFailed(EINVAL)`. The BSDs and
/// Darwin accept any signal number.
#[cfg(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "dragonfly"
))]
pub fn send_signal(fd: RawFd, signal: Signal) -> PtyResult<()> {
    // SAFETY: TIOCSIG takes the signal number by value
    let result = unsafe { libc::ioctl(fd, TIOCSIG as _, signal as libc::c_int) };

    Errno::result(result).map_err(PtyError::IoctlFailed)?;
    tracing::debug!("Sent {:?} to foreground group of fd {}", signal, fd);
    Ok(())
}

/// Send a signal to the foreground process group of the terminal
///
/// No pty signal ioctl exists here; check [`SIGNAL_SUPPORTED`] first.
#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "dragonfly"
)))]
pub fn send_signal(_fd: RawFd, _signal: Signal) -> PtyResult<()> {
    Err(PtyError::Unsupported("pty signal delivery"))
}

/// Put a descriptor in non-blocking mode; already non-blocking is fine
pub fn set_nonblocking(fd: RawFd) -> PtyResult<()> {
    enable_nonblocking(fd).map_err(PtyError::FcntlFailed)
}

/// Whether `O_NONBLOCK` is set on a descriptor
pub fn is_nonblocking(fd: RawFd) -> PtyResult<bool> {
    let flags = fcntl(fd, FcntlArg::F_GETFL).map_err(PtyError::FcntlFailed)?;
    Ok(OFlag::from_bits_truncate(flags).contains(OFlag::O_NONBLOCK))
}

pub(crate) fn enable_nonblocking(fd: RawFd) -> nix::Result<()> {
    let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pty::PtySession;

    #[test]
    fn test_resize_roundtrip() {
        let session = PtySession::allocate(WindowSize::new(80, 24), None).unwrap();

        resize(session.master_fd(), WindowSize::new(120, 40)).unwrap();
        assert_eq!(
            window_size(session.master_fd()).unwrap(),
            WindowSize::new(120, 40)
        );
    }

    #[test]
    fn test_resize_reports_zero_pixels() {
        let session = PtySession::allocate(WindowSize::new(80, 24), None).unwrap();
        resize(session.master_fd(), WindowSize::new(80, 24)).unwrap();

        let mut ws: libc::winsize = unsafe { std::mem::zeroed() };
        let ret = unsafe { libc::ioctl(session.master_fd(), libc::TIOCGWINSZ as _, &mut ws) };
        assert_eq!(ret, 0);
        assert_eq!((ws.ws_col, ws.ws_row), (80, 24));
        assert_eq!((ws.ws_xpixel, ws.ws_ypixel), (0, 0));
    }

    #[test]
    fn test_resize_bad_fd() {
        let err = resize(-1, WindowSize::default()).unwrap_err();
        assert!(matches!(err, PtyError::IoctlFailed(Errno::EBADF)));
    }

    #[test]
    fn test_set_nonblocking_idempotent() {
        let mut fds = [-1; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let [read_end, write_end] = fds;
        assert!(!is_nonblocking(read_end).unwrap());

        set_nonblocking(read_end).unwrap();
        set_nonblocking(read_end).unwrap();
        assert!(is_nonblocking(read_end).unwrap());
        assert!(!is_nonblocking(write_end).unwrap());

        unsafe {
            libc::close(read_end);
            libc::close(write_end);
        }
    }

    #[test]
    fn test_set_nonblocking_bad_fd() {
        assert!(matches!(
            set_nonblocking(-1),
            Err(PtyError::FcntlFailed(Errno::EBADF))
        ));
    }

    #[test]
    fn test_send_signal_capability() {
        let session = PtySession::allocate(WindowSize::default(), None).unwrap();
        let result = send_signal(session.master_fd(), Signal::SIGWINCH);
        if !SIGNAL_SUPPORTED {
            assert!(matches!(result, Err(PtyError::Unsupported(_))));
        }
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    #[test]
    fn test_send_signal_keyboard_signals_only() {
        let session = PtySession::allocate(WindowSize::default(), None).unwrap();

        // Nobody is in the foreground, the ioctl still accepts the request
        send_signal(session.master_fd(), Signal::SIGINT).unwrap();
        assert!(matches!(
            send_signal(session.master_fd(), Signal::SIGTERM),
            Err(PtyError::IoctlFailed(Errno::EINVAL))
        ));
    }
}
