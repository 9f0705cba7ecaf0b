//! Descriptor provisioning
//!
//! Allocates the parent-facing and child-facing end of each standard stream
//! before fork. Every descriptor is close-on-exec; the child's `dup2` onto
//! 0/1/2 is what it keeps. Any failure here aborts the launch before a process
//! exists.

use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};

use log::debug;
use nix::fcntl::OFlag;
use nix::pty::{Winsize, openpty};
use nix::sys::termios::{self, LocalFlags, SetArg, SpecialCharacterIndices};
use nix::unistd::pipe2;

use crate::config::{CallArgs, TransportKind};
use crate::errors::{LaunchStage, Result, ShError};

/// End-of-transmission (Ctrl-D), used when a terminal's VEOF can't be read
pub const DEFAULT_VEOF: u8 = 0x04;

/// Both ends of one standard stream
#[derive(Debug)]
pub struct StreamTransport {
    pub kind: TransportKind,
    /// Kept by the parent; `None` when nothing in the parent touches the stream
    pub parent: Option<OwnedFd>,
    /// Duplicated onto the standard slot in the child; `None` inherits the caller's
    pub child: Option<OwnedFd>,
}

impl StreamTransport {
    fn inherit() -> Self {
        Self {
            kind: TransportKind::Inherit,
            parent: None,
            child: None,
        }
    }

    fn pipe(parent_reads: bool) -> Result<Self> {
        let (read, write) = pipe2(OFlag::O_CLOEXEC).map_err(provision_error)?;
        let (parent, child) = if parent_reads {
            (read, write)
        } else {
            (write, read)
        };
        Ok(Self {
            kind: TransportKind::Pipe,
            parent: Some(parent),
            child: Some(child),
        })
    }

    fn tty(size: (u16, u16), raw: bool) -> Result<Self> {
        let winsize = Winsize {
            ws_row: size.0,
            ws_col: size.1,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        let pty = openpty(Some(&winsize), None).map_err(provision_error)?;
        set_cloexec(pty.master.as_raw_fd())?;
        set_cloexec(pty.slave.as_raw_fd())?;

        if raw {
            // no \n -> \r\n translation and friends; must happen before the child runs
            let mut attrs = termios::tcgetattr(&pty.slave).map_err(provision_error)?;
            termios::cfmakeraw(&mut attrs);
            termios::tcsetattr(&pty.slave, SetArg::TCSANOW, &attrs).map_err(provision_error)?;
        }

        Ok(Self {
            kind: TransportKind::Tty,
            parent: Some(pty.master),
            child: Some(pty.slave),
        })
    }

    pub fn is_tty(&self) -> bool {
        self.kind == TransportKind::Tty
    }
}

/// The three standard streams of one launch
#[derive(Debug)]
pub struct Transports {
    pub stdin: StreamTransport,
    pub stdout: StreamTransport,
    pub stderr: StreamTransport,
    /// stdin and stdout share one pty
    pub single_tty: bool,
}

impl Transports {
    /// Allocate transports for `args`
    ///
    /// `direct_stdin` is handed to the child as-is (a file, a raw descriptor,
    /// or an upstream process's stdout).
    pub fn provision(args: &CallArgs, direct_stdin: Option<OwnedFd>) -> Result<Self> {
        if args.fg {
            return Ok(Self {
                stdin: StreamTransport::inherit(),
                stdout: StreamTransport::inherit(),
                stderr: StreamTransport::inherit(),
                single_tty: false,
            });
        }

        let single_tty =
            direct_stdin.is_none() && args.tty_in && args.tty_out && args.unify_ttys;

        let (stdin, stdout) = if single_tty {
            let tty = StreamTransport::tty(args.tty_size, true)?;
            let master = tty.parent.as_ref().map(OwnedFd::try_clone).transpose()?;
            let slave = tty.child.as_ref().map(OwnedFd::try_clone).transpose()?;
            let stdin = StreamTransport {
                kind: TransportKind::Tty,
                parent: master,
                child: slave,
            };
            (stdin, tty)
        } else {
            let stdin = match direct_stdin {
                Some(fd) => StreamTransport {
                    kind: TransportKind::Direct,
                    parent: None,
                    child: Some(fd),
                },
                None if args.tty_in => StreamTransport::tty(args.tty_size, false)?,
                None => StreamTransport::pipe(false)?,
            };
            let stdout = if args.tty_out {
                StreamTransport::tty(args.tty_size, true)?
            } else {
                StreamTransport::pipe(true)?
            };
            (stdin, stdout)
        };

        // stderr is always a pipe of its own unless folded into stdout
        let stderr = if args.err_to_out {
            let child = stdout.child.as_ref().map(OwnedFd::try_clone).transpose()?;
            StreamTransport {
                kind: stdout.kind,
                parent: None,
                child,
            }
        } else {
            StreamTransport::pipe(true)?
        };

        debug!(
            "provisioned stdin={:?} stdout={:?} stderr={:?} single_tty={}",
            stdin.kind, stdout.kind, stderr.kind, single_tty
        );

        Ok(Self {
            stdin,
            stdout,
            stderr,
            single_tty,
        })
    }

    /// Child-side descriptors for slots 0, 1 and 2
    pub fn child_fds(&self) -> [Option<RawFd>; 3] {
        [
            self.stdin.child.as_ref().map(AsRawFd::as_raw_fd),
            self.stdout.child.as_ref().map(AsRawFd::as_raw_fd),
            self.stderr.child.as_ref().map(AsRawFd::as_raw_fd),
        ]
    }

    /// Drop the parent's copies of the child ends once the child has them
    pub fn close_child_ends(&mut self) {
        self.stdin.child = None;
        self.stdout.child = None;
        self.stderr.child = None;
    }
}

fn provision_error(err: nix::errno::Errno) -> ShError {
    ShError::Launch {
        stage: LaunchStage::Provision,
        source: err.into(),
    }
}

/// Mark a descriptor close-on-exec
pub fn set_cloexec(fd: RawFd) -> Result<()> {
    // SAFETY: F_GETFD/F_SETFD only touch descriptor flags
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 || unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } < 0 {
        return Err(ShError::Launch {
            stage: LaunchStage::Provision,
            source: std::io::Error::last_os_error(),
        });
    }
    Ok(())
}

/// Turn off local echo on a terminal we write into
pub fn disable_echo<Fd: AsFd>(fd: Fd) -> Result<()> {
    let mut attrs = termios::tcgetattr(&fd)
        .map_err(|e| ShError::Syscall(format!("tcgetattr failed: {}", e)))?;
    attrs.local_flags.remove(LocalFlags::ECHO);
    termios::tcsetattr(&fd, SetArg::TCSANOW, &attrs)
        .map_err(|e| ShError::Syscall(format!("tcsetattr failed: {}", e)))?;
    Ok(())
}

/// The terminal's end-of-file character
pub fn veof_char<Fd: AsFd>(fd: Fd) -> u8 {
    termios::tcgetattr(fd)
        .map(|attrs| attrs.control_chars[SpecialCharacterIndices::VEOF as usize])
        .unwrap_or(DEFAULT_VEOF)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_args_use_pipes() {
        let transports = Transports::provision(&CallArgs::default(), None).unwrap();
        assert_eq!(transports.stdin.kind, TransportKind::Pipe);
        assert_eq!(transports.stdout.kind, TransportKind::Pipe);
        assert_eq!(transports.stderr.kind, TransportKind::Pipe);
        assert!(!transports.single_tty);
        assert!(transports.child_fds().iter().all(Option::is_some));
    }

    #[test]
    fn fg_inherits_everything() {
        let args = CallArgs {
            fg: true,
            ..Default::default()
        };
        let transports = Transports::provision(&args, None).unwrap();
        assert_eq!(transports.child_fds(), [None, None, None]);
        assert_eq!(transports.stdout.kind, TransportKind::Inherit);
    }

    #[test]
    fn err_to_out_shares_stdout_transport() {
        let args = CallArgs {
            err_to_out: true,
            ..Default::default()
        };
        let transports = Transports::provision(&args, None).unwrap();
        assert!(transports.stderr.parent.is_none());
        assert!(transports.stderr.child.is_some());
        assert_eq!(transports.stderr.kind, TransportKind::Pipe);
    }

    #[test]
    fn unified_tty_when_both_sides_are_ttys() {
        let args = CallArgs {
            tty_in: true,
            tty_out: true,
            ..Default::default()
        };
        let transports = Transports::provision(&args, None).unwrap();
        assert!(transports.single_tty);
        assert!(transports.stdin.is_tty());
        assert!(transports.stdout.is_tty());
        assert_eq!(transports.stderr.kind, TransportKind::Pipe);
    }

    #[test]
    fn tty_out_sets_window_size() {
        let args = CallArgs {
            tty_out: true,
            tty_size: (33, 99),
            ..Default::default()
        };
        let transports = Transports::provision(&args, None).unwrap();
        let master = transports.stdout.parent.as_ref().unwrap();
        let mut ws: libc::winsize = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::ioctl(master.as_raw_fd(), libc::TIOCGWINSZ, &mut ws) };
        assert_eq!(rc, 0);
        assert_eq!((ws.ws_row, ws.ws_col), (33, 99));
    }

    #[test]
    fn direct_stdin_skips_parent_end() {
        let (read, _write) = pipe2(OFlag::O_CLOEXEC).unwrap();
        let transports = Transports::provision(&CallArgs::default(), Some(read)).unwrap();
        assert_eq!(transports.stdin.kind, TransportKind::Direct);
        assert!(transports.stdin.parent.is_none());
    }

    #[test]
    fn close_child_ends_releases_descriptors() {
        let mut transports = Transports::provision(&CallArgs::default(), None).unwrap();
        transports.close_child_ends();
        assert_eq!(transports.child_fds(), [None, None, None]);
        assert!(transports.stdout.parent.is_some());
    }
}
