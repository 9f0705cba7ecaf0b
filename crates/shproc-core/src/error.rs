//! Error types for process launch and completion

use std::fmt;
use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::status::signal_name;

/// Result type for shproc operations
pub type Result<T> = std::result::Result<T, ShError>;

/// How many bytes of each stream an [`ExitFailure`] message shows.
pub const TRUNCATE_CAP: usize = 750;

/// Errors that can occur while launching, running or waiting on a process
#[derive(Error, Debug)]
pub enum ShError {
    /// Setup failed before or during fork/exec; no process remains running.
    #[error("Launch failed during {stage}: {source}")]
    Launch {
        stage: LaunchStage,
        #[source]
        source: io::Error,
    },

    #[error("Command not found: {0}")]
    NotFound(String),

    /// Exit code outside the accepted set.
    #[error("{0}")]
    Exit(ExitFailure),

    /// Terminated by a signal; the exit code is the negated signal number.
    #[error("{0}")]
    Signal(ExitFailure),

    /// `wait()` gave up before the process finished. The process keeps running.
    #[error("Timed out after {0:?} waiting for process")]
    WaitTimeout(Duration),

    /// The configured timeout elapsed and the timeout signal was delivered.
    #[error("Process exceeded its {timeout:?} timeout and was sent signal {signal}")]
    Timeout { timeout: Duration, signal: i32 },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// An I/O loop failed while the process was running.
    #[error("I/O pump error on {stream}: {source}")]
    Pump {
        stream: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("Syscall error: {0}")]
    Syscall(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl ShError {
    /// Exit code carried by exit and signal failures
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ShError::Exit(failure) | ShError::Signal(failure) => Some(failure.exit_code),
            _ => None,
        }
    }

    /// The failure details for exit and signal failures
    pub fn exit_failure(&self) -> Option<&ExitFailure> {
        match self {
            ShError::Exit(failure) | ShError::Signal(failure) => Some(failure),
            _ => None,
        }
    }

    /// Signal failures are exit failures too
    pub fn is_exit_failure(&self) -> bool {
        matches!(self, ShError::Exit(_) | ShError::Signal(_))
    }

    pub fn is_signal(&self) -> bool {
        matches!(self, ShError::Signal(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ShError::Timeout { .. } | ShError::WaitTimeout(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ShError::NotFound(_))
    }
}

/// A process finished with an exit code that was not accepted
#[derive(Debug, Clone)]
pub struct ExitFailure {
    /// Full command line that ran
    pub full_cmd: String,
    /// Aggregated stdout, `None` when it was redirected and not stored
    pub stdout: Option<Vec<u8>>,
    /// Aggregated stderr, `None` when it was redirected and not stored
    pub stderr: Option<Vec<u8>>,
    /// Adjusted exit code (negative for signals)
    pub exit_code: i32,
}

impl ExitFailure {
    pub fn new(
        full_cmd: impl Into<String>,
        stdout: Option<Vec<u8>>,
        stderr: Option<Vec<u8>>,
        exit_code: i32,
    ) -> Self {
        Self {
            full_cmd: full_cmd.into(),
            stdout,
            stderr,
            exit_code,
        }
    }

    pub fn is_code(&self, code: i32) -> bool {
        self.exit_code == code
    }

    /// Signal number when the process was killed by a signal
    pub fn signal(&self) -> Option<i32> {
        (self.exit_code < 0).then_some(-self.exit_code)
    }

    /// `ErrorReturnCode_N` for exit codes, `SignalException_SIGNAME` for signals
    pub fn name(&self) -> String {
        match self.signal() {
            Some(sig) => format!("SignalException_{}", signal_name(sig)),
            None => format!("ErrorReturnCode_{}", self.exit_code),
        }
    }

    pub fn stdout_lossy(&self) -> String {
        self.stdout
            .as_deref()
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .unwrap_or_default()
    }

    pub fn stderr_lossy(&self) -> String {
        self.stderr
            .as_deref()
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .unwrap_or_default()
    }
}

fn truncated(data: Option<&[u8]>, stream: &str) -> String {
    let Some(data) = data else {
        return "<redirected>".to_string();
    };

    let shown = &data[..data.len().min(TRUNCATE_CAP)];
    let mut out = String::from_utf8_lossy(shown).into_owned();
    let delta = data.len() - shown.len();
    if delta > 0 {
        out.push_str(&format!("... ({} more, please see e.{})", delta, stream));
    }
    out
}

impl fmt::Display for ExitFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "\n\n  RAN: {:?}\n\n  STDOUT:\n{}\n\n  STDERR:\n{}",
            self.full_cmd,
            truncated(self.stdout.as_deref(), "stdout"),
            truncated(self.stderr.as_deref(), "stderr"),
        )
    }
}

/// Step of the child setup that failed, relayed from child to parent as one byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LaunchStage {
    Provision = 1,
    Fork = 2,
    Session = 3,
    ProcessGroup = 4,
    Dup = 5,
    ControllingTerminal = 6,
    Chdir = 7,
    Setgid = 8,
    Setuid = 9,
    PreExec = 10,
    CloseFds = 11,
    Handshake = 12,
    Exec = 13,
}

impl LaunchStage {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            1 => LaunchStage::Provision,
            2 => LaunchStage::Fork,
            3 => LaunchStage::Session,
            4 => LaunchStage::ProcessGroup,
            5 => LaunchStage::Dup,
            6 => LaunchStage::ControllingTerminal,
            7 => LaunchStage::Chdir,
            8 => LaunchStage::Setgid,
            9 => LaunchStage::Setuid,
            10 => LaunchStage::PreExec,
            11 => LaunchStage::CloseFds,
            12 => LaunchStage::Handshake,
            13 => LaunchStage::Exec,
            _ => return None,
        })
    }
}

impl fmt::Display for LaunchStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LaunchStage::Provision => "descriptor provisioning",
            LaunchStage::Fork => "fork",
            LaunchStage::Session => "setsid",
            LaunchStage::ProcessGroup => "setpgid",
            LaunchStage::Dup => "descriptor duplication",
            LaunchStage::ControllingTerminal => "controlling terminal setup",
            LaunchStage::Chdir => "chdir",
            LaunchStage::Setgid => "setgid",
            LaunchStage::Setuid => "setuid",
            LaunchStage::PreExec => "pre-exec hook",
            LaunchStage::CloseFds => "descriptor cleanup",
            LaunchStage::Handshake => "session handshake",
            LaunchStage::Exec => "exec",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_failure_display_contains_sections() {
        let failure = ExitFailure::new("/bin/ls /nope", Some(b"".to_vec()), Some(b"no such".to_vec()), 2);
        let msg = failure.to_string();
        assert!(msg.contains("RAN: \"/bin/ls /nope\""));
        assert!(msg.contains("STDOUT:"));
        assert!(msg.contains("no such"));
    }

    #[test]
    fn test_exit_failure_truncates_long_output() {
        let failure = ExitFailure::new("yes", Some(vec![b'y'; 1000]), None, 1);
        let msg = failure.to_string();
        assert!(msg.contains("... (250 more, please see e.stdout)"));
        assert!(msg.contains("<redirected>"));
    }

    #[test]
    fn test_exit_failure_names() {
        assert_eq!(ExitFailure::new("x", None, None, 3).name(), "ErrorReturnCode_3");
        assert_eq!(
            ExitFailure::new("x", None, None, -9).name(),
            "SignalException_SIGKILL"
        );
    }

    #[test]
    fn test_signal_failure_is_exit_failure() {
        let err = ShError::Signal(ExitFailure::new("sleep 5", None, None, -15));
        assert!(err.is_exit_failure());
        assert!(err.is_signal());
        assert_eq!(err.exit_code(), Some(-15));
        assert_eq!(err.exit_failure().and_then(|f| f.signal()), Some(15));
    }

    #[test]
    fn test_timeout_display() {
        let err = ShError::Timeout {
            timeout: Duration::from_secs(1),
            signal: libc::SIGKILL,
        };
        assert!(err.to_string().contains("signal 9"));
        assert!(err.is_timeout());
    }

    #[test]
    fn test_error_from_io() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let err = ShError::from(io_err);
        assert!(err.to_string().contains("IO error"));
    }

    #[test]
    fn test_launch_stage_code_roundtrip() {
        for code in 1..=13u8 {
            let stage = LaunchStage::from_code(code).unwrap();
            assert_eq!(stage.code(), code);
        }
        assert!(LaunchStage::from_code(0).is_none());
        assert!(LaunchStage::from_code(200).is_none());
    }
}
