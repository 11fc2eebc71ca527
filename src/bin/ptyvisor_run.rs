//! ptyvisor-run - run a command on a supervised PTY
//!
//! Spawns a program on a fresh pty, relays its output to stdout and stdin to
//! the pty, and prints the exit record as JSON once the child is gone.

use std::io::{self, Read, Write};
use std::os::fd::{BorrowedFd, RawFd};
use std::process::ExitCode;
use std::thread;
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};

use ptyvisor::{ExitRecord, PtyResult, SpawnOptions, Supervisor, WindowSize};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

struct Args {
    cols: u16,
    rows: u16,
    cwd: Option<String>,
    env: Vec<String>,
    inherit_env: bool,
    utf8: bool,
    command: Vec<String>,
}

fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let args = match parse_args(std::env::args().skip(1)) {
        Some(args) => args,
        None => {
            print_help();
            return ExitCode::SUCCESS;
        },
    };

    let options = match build_options(&args) {
        Ok(options) => options,
        Err(e) => {
            eprintln!("Invalid command: {}", e);
            return ExitCode::FAILURE;
        },
    };

    let mut supervisor = Supervisor::new();
    let (exit_tx, exit_rx) = crossbeam_channel::bounded(1);
    let child = match supervisor.fork(options, move |record| {
        let _ = exit_tx.send(record);
    }) {
        Ok(child) => child,
        Err(e) => {
            eprintln!("Failed to spawn PTY: {}", e);
            return ExitCode::FAILURE;
        },
    };

    tracing::info!(
        "Running {:?} as pid {} on {}",
        args.command,
        child.pid(),
        child.pty_path()
    );

    // The stdin thread blocks in read(2) and is left behind when we exit
    let master_fd = child.master_fd();
    thread::spawn(move || forward_stdin(master_fd));

    let mut stdout = io::stdout();
    let mut buf = [0u8; 4096];
    let mut record: Option<ExitRecord> = None;

    loop {
        let relay = match relay_output(master_fd, &mut buf, &mut stdout) {
            Ok(relay) => relay,
            Err(e) => {
                tracing::error!("Relay error: {}", e);
                Relay::Closed
            },
        };

        supervisor.dispatch();
        if record.is_none() {
            record = exit_rx.try_recv().ok();
        }

        match (record, relay) {
            // A background job may keep the slave open; stop once it goes quiet
            (Some(record), Relay::Closed | Relay::Idle) => return report(record),
            (None, Relay::Closed) => {
                // Output side is closed; only the exit is left to collect
                supervisor.dispatch_timeout(Duration::from_millis(100));
            },
            _ => {},
        }
    }
}

/// Outcome of one relay pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Relay {
    /// Output was copied
    Data,
    /// Nothing arrived within the poll timeout
    Idle,
    /// The slave side hung up
    Closed,
}

/// Copy whatever is readable from the master to `out`
fn relay_output<W: Write>(fd: RawFd, buf: &mut [u8], out: &mut W) -> io::Result<Relay> {
    // SAFETY: the master stays open for the lifetime of main
    let borrowed_fd = unsafe { BorrowedFd::borrow_raw(fd) };
    let mut fds = [PollFd::new(&borrowed_fd, PollFlags::POLLIN)];

    match poll(&mut fds, 100) {
        Ok(0) => return Ok(Relay::Idle),
        Ok(_) => {},
        Err(Errno::EINTR) => return Ok(Relay::Idle),
        Err(e) => return Err(e.into()),
    }

    let mut copied = false;
    loop {
        match nix::unistd::read(fd, buf) {
            Ok(0) => return Ok(Relay::Closed),
            Ok(n) => {
                out.write_all(&buf[..n])?;
                out.flush()?;
                copied = true;
            },
            Err(Errno::EAGAIN) => {
                return Ok(if copied { Relay::Data } else { Relay::Idle });
            },
            Err(Errno::EINTR) => continue,
            // Linux reports a hung-up slave as EIO
            Err(Errno::EIO) => return Ok(Relay::Closed),
            Err(e) => return Err(e.into()),
        }
    }
}

fn forward_stdin(fd: RawFd) {
    let mut stdin = io::stdin();
    let mut buf = [0u8; 1024];

    loop {
        let n = match stdin.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };

        let mut data = &buf[..n];
        while !data.is_empty() {
            match nix::unistd::write(fd, data) {
                Ok(written) => data = &data[written..],
                Err(Errno::EAGAIN) | Err(Errno::EINTR) => {
                    thread::sleep(Duration::from_millis(10));
                },
                Err(_) => return,
            }
        }
    }
}

fn report(record: ExitRecord) -> ExitCode {
    match serde_json::to_string(&record) {
        Ok(json) => println!("{}", json),
        Err(e) => tracing::error!("Failed to encode exit record: {}", e),
    }

    tracing::info!(
        "Child finished: exit code {}, signal {}",
        record.exit_code,
        record.signal_code
    );

    if record.signal_code != 0 {
        ExitCode::from((128 + record.signal_code).clamp(0, 255) as u8)
    } else {
        ExitCode::from(record.exit_code.clamp(0, 255) as u8)
    }
}

fn build_options(args: &Args) -> PtyResult<SpawnOptions> {
    let (program, rest) = match args.command.split_first() {
        Some((program, rest)) => (program.clone(), rest),
        None => (
            std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string()),
            &[][..],
        ),
    };

    let mut options = SpawnOptions::new(program)?
        .args(rest)?
        .size(WindowSize::new(args.cols, args.rows))
        .utf8(args.utf8);

    if args.inherit_env {
        options = options.inherit_env()?;
    }
    for entry in &args.env {
        options = options.env_entry(entry)?;
    }
    if let Some(cwd) = &args.cwd {
        options = options.current_dir(cwd)?;
    }

    Ok(options)
}

/// Parse the command line; `None` means help was requested
fn parse_args<I: Iterator<Item = String>>(mut argv: I) -> Option<Args> {
    let mut args = Args {
        cols: 80,
        rows: 24,
        cwd: None,
        env: Vec::new(),
        inherit_env: false,
        utf8: true,
        command: Vec::new(),
    };

    while let Some(arg) = argv.next() {
        match arg.as_str() {
            "-c" | "--cols" => {
                if let Some(value) = argv.next() {
                    args.cols = value.parse().unwrap_or(80);
                }
            },
            "-r" | "--rows" => {
                if let Some(value) = argv.next() {
                    args.rows = value.parse().unwrap_or(24);
                }
            },
            "-d" | "--cwd" => args.cwd = argv.next(),
            "-e" | "--env" => {
                if let Some(entry) = argv.next() {
                    args.env.push(entry);
                }
            },
            "--inherit-env" => args.inherit_env = true,
            "--no-utf8" => args.utf8 = false,
            "-h" | "--help" => return None,
            "--" => {
                args.command.extend(argv.by_ref());
            },
            _ => {
                args.command.push(arg);
                args.command.extend(argv.by_ref());
            },
        }
    }

    Some(args)
}

fn print_help() {
    println!("ptyvisor-run - run a command on a supervised PTY");
    println!();
    println!("Usage: ptyvisor-run [OPTIONS] [--] [PROGRAM [ARGS...]]");
    println!();
    println!("Options:");
    println!("  -c, --cols <N>         Set terminal width (default: 80)");
    println!("  -r, --rows <N>         Set terminal height (default: 24)");
    println!("  -d, --cwd <DIR>        Working directory of the child");
    println!("  -e, --env <KEY=VALUE>  Add an environment entry (repeatable)");
    println!("      --inherit-env      Pass this process's environment to the child");
    println!("      --no-utf8          Do not enable UTF-8 input processing");
    println!("  -h, --help             Show this help message");
    println!();
    println!("PROGRAM defaults to $SHELL or /bin/sh. The child starts with an");
    println!("empty environment unless --inherit-env or --env is given.");
    println!("After the child exits its exit record is printed as JSON.");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Option<Args> {
        parse_args(args.iter().map(|s| s.to_string()))
    }

    #[test]
    fn test_parse_options_and_command() {
        let args = parse(&["--cols", "120", "-e", "FOO=bar", "--no-utf8", "--", "ls", "-l"]).unwrap();
        assert_eq!(args.cols, 120);
        assert_eq!(args.rows, 24);
        assert_eq!(args.env, ["FOO=bar"]);
        assert!(!args.utf8);
        assert_eq!(args.command, ["ls", "-l"]);
    }

    #[test]
    fn test_command_stops_option_parsing() {
        let args = parse(&["sh", "-c", "exit 3"]).unwrap();
        assert_eq!(args.command, ["sh", "-c", "exit 3"]);
    }

    #[test]
    fn test_relay_idle_while_slave_held_open() {
        // The held slave stands in for a background job that outlives the child
        let session = ptyvisor::allocate(WindowSize::default(), None).unwrap();
        let mut buf = [0u8; 256];
        let mut out = Vec::new();

        let relay = relay_output(session.master_fd(), &mut buf, &mut out).unwrap();
        assert_eq!(relay, Relay::Idle);
        assert!(out.is_empty());
    }

    #[test]
    fn test_relay_copies_output() {
        let session = ptyvisor::allocate(WindowSize::default(), None).unwrap();
        let slave = session.slave_fd().unwrap();
        nix::unistd::write(slave, b"hello\n").unwrap();

        // The line discipline may hand the text over in pieces
        let mut buf = [0u8; 256];
        let mut out = Vec::new();
        let mut relays = Vec::new();
        while out.len() < 7 && relays.len() < 20 {
            relays.push(relay_output(session.master_fd(), &mut buf, &mut out).unwrap());
        }
        assert!(relays.contains(&Relay::Data));
        assert!(!relays.contains(&Relay::Closed));
        assert_eq!(out, b"hello\r\n");
    }

    #[test]
    fn test_relay_closed_after_hangup() {
        let mut session = ptyvisor::allocate(WindowSize::default(), None).unwrap();
        drop(session.take_slave());

        let mut buf = [0u8; 256];
        let mut out = Vec::new();
        let relay = relay_output(session.master_fd(), &mut buf, &mut out).unwrap();
        assert_eq!(relay, Relay::Closed);
    }

    #[test]
    fn test_help() {
        assert!(parse(&["--help"]).is_none());
    }
}
