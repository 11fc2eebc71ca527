//! Terminal line discipline configuration
//!
//! [`TerminalConfig`] always starts from the same canonical baseline: cooked
//! mode with echo, signal generation and the usual xterm control characters.
//! Overrides are applied on top of that baseline, so there is never a
//! partially initialized termios handed to the kernel.

use std::os::fd::{AsRawFd, BorrowedFd};

use nix::errno::Errno;
use nix::sys::termios::{
    BaudRate, ControlFlags, InputFlags, LocalFlags, OutputFlags, SpecialCharacterIndices,
};

/// Terminal attributes applied to a freshly allocated pty slave
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalConfig {
    input_flags: InputFlags,
    output_flags: OutputFlags,
    control_flags: ControlFlags,
    local_flags: LocalFlags,
    /// Control characters in the order they are written
    control_chars: Vec<(SpecialCharacterIndices, libc::cc_t)>,
    speed: BaudRate,
    utf8: bool,
}

impl TerminalConfig {
    /// Build the canonical baseline.
    ///
    /// `utf8` adds `IUTF8` to the input flags on platforms that define it, so
    /// that erase in canonical mode removes whole UTF-8 sequences.
    pub fn new(utf8: bool) -> Self {
        #[allow(unused_mut)]
        let mut input_flags = InputFlags::ICRNL
            | InputFlags::IXON
            | InputFlags::IXANY
            | InputFlags::IMAXBEL
            | InputFlags::BRKINT;
        #[cfg(any(target_os = "linux", target_os = "android", target_os = "macos"))]
        if utf8 {
            input_flags |= InputFlags::IUTF8;
        }

        Self {
            input_flags,
            output_flags: OutputFlags::OPOST | OutputFlags::ONLCR,
            control_flags: ControlFlags::CREAD | ControlFlags::CS8 | ControlFlags::HUPCL,
            local_flags: LocalFlags::ICANON
                | LocalFlags::ISIG
                | LocalFlags::IEXTEN
                | LocalFlags::ECHO
                | LocalFlags::ECHOE
                | LocalFlags::ECHOK
                | LocalFlags::ECHOKE
                | LocalFlags::ECHOCTL,
            control_chars: default_control_chars(),
            speed: BaudRate::B38400,
            utf8,
        }
    }

    /// Whether the baseline was built with UTF-8 input handling
    pub fn is_utf8(&self) -> bool {
        self.utf8
    }

    pub fn input_flags(&self) -> InputFlags {
        self.input_flags
    }

    pub fn output_flags(&self) -> OutputFlags {
        self.output_flags
    }

    pub fn control_flags(&self) -> ControlFlags {
        self.control_flags
    }

    pub fn local_flags(&self) -> LocalFlags {
        self.local_flags
    }

    pub fn speed(&self) -> BaudRate {
        self.speed
    }

    /// Control characters in application order
    pub fn control_chars(&self) -> &[(SpecialCharacterIndices, libc::cc_t)] {
        &self.control_chars
    }

    /// Look up the byte bound to a control character
    pub fn control_char(&self, index: SpecialCharacterIndices) -> Option<libc::cc_t> {
        self.control_chars
            .iter()
            .find(|(i, _)| *i == index)
            .map(|&(_, value)| value)
    }

    /// Replace the input flags
    pub fn with_input_flags(mut self, flags: InputFlags) -> Self {
        self.input_flags = flags;
        self
    }

    /// Replace the output flags
    pub fn with_output_flags(mut self, flags: OutputFlags) -> Self {
        self.output_flags = flags;
        self
    }

    /// Replace the control flags
    pub fn with_control_flags(mut self, flags: ControlFlags) -> Self {
        self.control_flags = flags;
        self
    }

    /// Replace the local flags
    pub fn with_local_flags(mut self, flags: LocalFlags) -> Self {
        self.local_flags = flags;
        self
    }

    /// Bind a control character, keeping its position if already present
    pub fn with_control_char(mut self, index: SpecialCharacterIndices, value: libc::cc_t) -> Self {
        match self.control_chars.iter_mut().find(|(i, _)| *i == index) {
            Some(entry) => entry.1 = value,
            None => self.control_chars.push((index, value)),
        }
        self
    }

    /// Set input and output speed
    pub fn with_speed(mut self, speed: BaudRate) -> Self {
        self.speed = speed;
        self
    }

    /// Render into the C structure expected by `openpty`/`forkpty`/`tcsetattr`
    pub fn to_libc(&self) -> libc::termios {
        // SAFETY: termios is a plain C struct for which all-zero is valid
        let mut termios: libc::termios = unsafe { std::mem::zeroed() };
        termios.c_iflag = self.input_flags.bits();
        termios.c_oflag = self.output_flags.bits();
        termios.c_cflag = self.control_flags.bits();
        termios.c_lflag = self.local_flags.bits();
        for &(index, value) in &self.control_chars {
            termios.c_cc[index as usize] = value;
        }

        let speed = self.speed as libc::speed_t;
        // SAFETY: termios is a valid, exclusively borrowed structure
        unsafe {
            libc::cfsetispeed(&mut termios, speed);
            libc::cfsetospeed(&mut termios, speed);
        }
        termios
    }

    /// Apply to a terminal, draining output and discarding pending input
    pub fn apply(&self, fd: BorrowedFd<'_>) -> nix::Result<()> {
        let termios = self.to_libc();
        // SAFETY: fd is a live descriptor and termios outlives the call
        let ret = unsafe { libc::tcsetattr(fd.as_raw_fd(), libc::TCSAFLUSH, &termios) };
        Errno::result(ret).map(drop)
    }
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self::new(true)
    }
}

/// xterm-style control character bindings
fn default_control_chars() -> Vec<(SpecialCharacterIndices, libc::cc_t)> {
    use SpecialCharacterIndices::*;

    #[allow(unused_mut)]
    let mut chars = vec![
        (VEOF, 4),
        (VEOL, 0xff),
        (VEOL2, 0xff),
        (VERASE, 0x7f),
        (VWERASE, 23),
        (VKILL, 21),
        (VREPRINT, 18),
        (VINTR, 3),
        (VQUIT, 0x1c),
        (VSUSP, 26),
        (VSTART, 17),
        (VSTOP, 19),
        (VLNEXT, 22),
        (VDISCARD, 15),
        (VMIN, 1),
        (VTIME, 0),
    ];

    #[cfg(any(target_os = "macos", target_os = "ios"))]
    {
        chars.push((VDSUSP, 25));
        chars.push((VSTATUS, 20));
    }

    chars
}
