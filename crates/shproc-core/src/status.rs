//! Exit status reconciliation
//!
//! Turns the raw status reported by the kernel into the adjusted exit code
//! callers see: the exit code for normal termination, the negated signal
//! number for termination by signal.

use std::str::FromStr;

use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;

/// How a reaped process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Normal exit with the given status
    Exited(i32),
    /// Killed by the given signal number
    Signaled(i32),
}

impl ExitOutcome {
    /// Interpret a raw `waitpid` status word
    pub fn from_raw(status: i32) -> Option<Self> {
        if libc::WIFEXITED(status) {
            Some(ExitOutcome::Exited(libc::WEXITSTATUS(status)))
        } else if libc::WIFSIGNALED(status) {
            Some(ExitOutcome::Signaled(libc::WTERMSIG(status)))
        } else {
            None
        }
    }

    /// Interpret a nix wait status; stopped/continued/alive states yield `None`
    pub fn from_wait_status(status: WaitStatus) -> Option<Self> {
        match status {
            WaitStatus::Exited(_, code) => Some(ExitOutcome::Exited(code)),
            WaitStatus::Signaled(_, signal, _) => Some(ExitOutcome::Signaled(signal as i32)),
            _ => None,
        }
    }

    /// Adjusted exit code: negative signal number when signaled
    pub fn exit_code(&self) -> i32 {
        match *self {
            ExitOutcome::Exited(code) => code,
            ExitOutcome::Signaled(sig) => -sig,
        }
    }

    pub fn signal(&self) -> Option<i32> {
        match *self {
            ExitOutcome::Signaled(sig) => Some(sig),
            ExitOutcome::Exited(_) => None,
        }
    }

    /// Whether the adjusted exit code is in the accepted set
    pub fn is_accepted(&self, ok_codes: &[i32]) -> bool {
        ok_codes.contains(&self.exit_code())
    }
}

/// Symbolic name of a signal number (`SIGTERM`), or `SIG<n>` when unknown
pub fn signal_name(sig: i32) -> String {
    match Signal::try_from(sig) {
        Ok(signal) => signal.as_str().to_string(),
        Err(_) => format!("SIG{}", sig),
    }
}

/// Parse `9`, `KILL` or `SIGKILL` into a signal number
pub fn parse_signal(name: &str) -> Option<i32> {
    let name = name.trim();
    if let Ok(num) = name.parse::<i32>() {
        return Signal::try_from(num).ok().map(|s| s as i32);
    }

    let upper = name.to_ascii_uppercase();
    let full = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{}", upper)
    };
    Signal::from_str(&full).ok().map(|s| s as i32)
}
