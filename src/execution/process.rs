//! Process launch
//!
//! `PREPARING -> FORKED -> SYNCHRONIZED -> RUNNING`. Two close-on-exec pipes
//! connect the child back to the parent: the exception relay carries
//! `[stage: u8][errno: i32]` when setup fails, the session pipe carries the
//! child's session and group ids right before exec. The parent reads the relay
//! to EOF first, so by the time `spawn_child` returns the child has either
//! exec'd or been reaped.
//!
//! Between fork and exec the child only makes raw libc calls on memory
//! prepared beforehand.

use std::ffi::CString;
use std::fs::File;
use std::io::Read;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::ptr;

use log::{debug, warn};
use nix::fcntl::OFlag;
use nix::sys::wait::waitpid;
use nix::unistd::{ForkResult, Pid, fork, pipe2, ttyname};

use super::transport::{Transports, disable_echo};
use crate::config::{CallArgs, PreExecFn, ProcessGroupPolicy};
use crate::errors::{LaunchStage, Result, ShError};

/// Exit status of a child that failed before exec
pub const CHILD_SETUP_FAILED: i32 = 255;

const RELAY_LEN: usize = 5;
const SESSION_LEN: usize = 8;

/// A child that made it through exec
#[derive(Debug)]
pub struct Launched {
    pub pid: Pid,
    pub sid: Option<Pid>,
    pub pgid: Option<Pid>,
    /// Controlling terminal, when the child acquired one
    pub ctty: Option<PathBuf>,
    /// Parent ends; child ends are already closed
    pub transports: Transports,
}

/// Everything the child touches, prepared before fork
struct ChildPlan {
    program: CString,
    argv: Vec<CString>,
    envp: Option<Vec<CString>>,
    cwd: Option<CString>,
    stdio: [Option<RawFd>; 3],
    stdin_tty: bool,
    stdout_tty: bool,
    ignore_hup: bool,
    group: ProcessGroupPolicy,
    uid: Option<u32>,
    gid: Option<u32>,
    pre_exec: Option<PreExecFn>,
    /// Sorted descriptors to keep open besides 0-2 and the sync pipes
    keep: Vec<RawFd>,
    pass: Vec<RawFd>,
    relay: RawFd,
    session: RawFd,
}

fn cstring(value: &[u8], what: &str) -> Result<CString> {
    CString::new(value)
        .map_err(|_| ShError::InvalidConfig(format!("{} contains a nul byte", what)))
}

fn null_terminated(strings: &[CString]) -> Vec<*const libc::c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(ptr::null()))
        .collect()
}

/// Fork and exec `program`, wiring the provisioned transports onto 0/1/2
pub fn spawn_child(
    program: &Path,
    args: &[String],
    call_args: &CallArgs,
    cwd: Option<&Path>,
    mut transports: Transports,
) -> Result<Launched> {
    let program_c = cstring(program.as_os_str().as_bytes(), "program path")?;
    let mut argv = vec![program_c.clone()];
    for arg in args {
        argv.push(cstring(arg.as_bytes(), "argument")?);
    }
    let envp = match &call_args.env {
        Some(env) => Some(
            env.iter()
                .map(|(k, v)| cstring(format!("{}={}", k, v).as_bytes(), "environment entry"))
                .collect::<Result<Vec<_>>>()?,
        ),
        None => None,
    };
    let cwd_c = cwd
        .map(|dir| cstring(dir.as_os_str().as_bytes(), "working directory"))
        .transpose()?;

    let (relay_read, relay_write) = pipe2(OFlag::O_CLOEXEC).map_err(|e| ShError::Launch {
        stage: LaunchStage::Provision,
        source: e.into(),
    })?;
    let (session_read, session_write) = pipe2(OFlag::O_CLOEXEC).map_err(|e| ShError::Launch {
        stage: LaunchStage::Provision,
        source: e.into(),
    })?;

    let mut keep: Vec<RawFd> = call_args
        .pass_fds
        .iter()
        .copied()
        .chain([relay_write.as_raw_fd(), session_write.as_raw_fd()])
        .filter(|fd| *fd > 2)
        .collect();
    keep.sort_unstable();
    keep.dedup();

    // a foreground child shares the caller's terminal and job control
    let group = if call_args.fg {
        ProcessGroupPolicy::Inherit
    } else {
        call_args.process_group
    };
    let session_leader = group == ProcessGroupPolicy::NewSession;
    let ctty_source = if transports.stdin.is_tty() {
        transports.stdin.child.as_ref()
    } else if transports.stdout.is_tty() {
        transports.stdout.child.as_ref()
    } else {
        None
    };
    let ctty = if session_leader {
        ctty_source.and_then(|fd| ttyname(fd).ok())
    } else {
        None
    };

    let plan = ChildPlan {
        program: program_c,
        argv,
        envp,
        cwd: cwd_c,
        stdio: transports.child_fds(),
        stdin_tty: transports.stdin.is_tty(),
        stdout_tty: transports.stdout.is_tty(),
        ignore_hup: call_args.is_background(),
        group,
        uid: call_args.uid,
        gid: call_args.gid,
        pre_exec: call_args.pre_exec.clone(),
        keep,
        pass: call_args.pass_fds.clone(),
        relay: relay_write.as_raw_fd(),
        session: session_write.as_raw_fd(),
    };
    let argv_ptrs = null_terminated(&plan.argv);
    let envp_ptrs = plan.envp.as_deref().map(null_terminated);

    // SAFETY: the child branch only calls async-signal-safe functions on
    // memory prepared above and never returns.
    let pid = match unsafe { fork() } {
        Ok(ForkResult::Child) => unsafe {
            child_after_fork(&plan, &argv_ptrs, envp_ptrs.as_deref())
        },
        Ok(ForkResult::Parent { child }) => child,
        Err(e) => {
            return Err(ShError::Launch {
                stage: LaunchStage::Fork,
                source: e.into(),
            });
        }
    };

    drop(relay_write);
    drop(session_write);
    transports.close_child_ends();

    if let Some((stage, errno)) = read_relay(relay_read)? {
        // the child _exit()s right after reporting
        let _ = waitpid(pid, None);
        debug!("child {} failed during {} (errno {})", pid, stage, errno);
        return Err(ShError::Launch {
            stage,
            source: std::io::Error::from_raw_os_error(errno),
        });
    }

    let (sid, pgid) = read_session(session_read)?;

    if transports.stdin.is_tty()
        && let Some(master) = &transports.stdin.parent
        && let Err(e) = disable_echo(master)
    {
        warn!("could not disable echo on stdin tty: {}", e);
    }

    Ok(Launched {
        pid,
        sid: Some(Pid::from_raw(sid)),
        pgid: Some(Pid::from_raw(pgid)),
        ctty,
        transports,
    })
}

fn read_relay(relay: OwnedFd) -> Result<Option<(LaunchStage, i32)>> {
    let mut buf = Vec::with_capacity(RELAY_LEN);
    File::from(relay).read_to_end(&mut buf)?;
    if buf.len() < RELAY_LEN {
        return Ok(None);
    }

    let stage = LaunchStage::from_code(buf[0]).unwrap_or(LaunchStage::Exec);
    let errno = i32::from_le_bytes([buf[1], buf[2], buf[3], buf[4]]);
    Ok(Some((stage, errno)))
}

fn read_session(session: OwnedFd) -> Result<(i32, i32)> {
    let mut buf = [0u8; SESSION_LEN];
    File::from(session)
        .read_exact(&mut buf)
        .map_err(|source| ShError::Launch {
            stage: LaunchStage::Handshake,
            source,
        })?;
    let sid = i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let pgid = i32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
    Ok((sid, pgid))
}

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// Report a failed stage to the parent and exit without unwinding
unsafe fn fail(relay: RawFd, stage: LaunchStage, errno: i32) -> ! {
    let mut buf = [0u8; RELAY_LEN];
    buf[0] = stage.code();
    buf[1..].copy_from_slice(&errno.to_le_bytes());
    unsafe {
        libc::write(relay, buf.as_ptr() as *const libc::c_void, RELAY_LEN);
        libc::_exit(CHILD_SETUP_FAILED)
    }
}

unsafe fn clear_cloexec(fd: RawFd) -> bool {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFD);
        flags >= 0 && libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) >= 0
    }
}

unsafe fn close_range(first: RawFd, last: RawFd) -> bool {
    if first > last {
        return true;
    }
    unsafe {
        let rc = libc::syscall(
            libc::SYS_close_range,
            first as libc::c_uint,
            last as libc::c_uint,
            0 as libc::c_uint,
        );
        if rc == 0 {
            return true;
        }
        if last_errno() != libc::ENOSYS {
            return false;
        }

        // kernels before 5.9
        let max = libc::sysconf(libc::_SC_OPEN_MAX);
        let upper = if max > 0 {
            last.min((max - 1) as RawFd)
        } else {
            last.min(65535)
        };
        for fd in first..=upper {
            libc::close(fd);
        }
        true
    }
}

/// Close everything above stderr except `keep` (sorted)
unsafe fn close_inherited(keep: &[RawFd]) -> bool {
    let mut next = 3;
    for &fd in keep {
        if fd < next {
            continue;
        }
        if unsafe { !close_range(next, fd - 1) } {
            return false;
        }
        next = fd + 1;
    }
    unsafe { close_range(next, RawFd::MAX) }
}

unsafe fn child_after_fork(
    plan: &ChildPlan,
    argv: &[*const libc::c_char],
    envp: Option<&[*const libc::c_char]>,
) -> ! {
    let relay = plan.relay;
    unsafe {
        // Rust ignores SIGPIPE and ignored dispositions survive exec
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
        let mut empty: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut empty);
        libc::pthread_sigmask(libc::SIG_SETMASK, &empty, ptr::null_mut());

        if plan.ignore_hup {
            libc::signal(libc::SIGHUP, libc::SIG_IGN);
        }

        match plan.group {
            ProcessGroupPolicy::NewSession => {
                if libc::setsid() < 0 {
                    fail(relay, LaunchStage::Session, last_errno());
                }
            }
            ProcessGroupPolicy::NewGroup => {
                if libc::setpgid(0, 0) < 0 {
                    fail(relay, LaunchStage::ProcessGroup, last_errno());
                }
            }
            ProcessGroupPolicy::Inherit => {}
        }

        for (slot, fd) in plan.stdio.iter().enumerate() {
            let Some(fd) = *fd else { continue };
            let slot = slot as RawFd;
            let ok = if fd == slot {
                clear_cloexec(fd)
            } else {
                libc::dup2(fd, slot) >= 0
            };
            if !ok {
                fail(relay, LaunchStage::Dup, last_errno());
            }
        }

        if plan.group == ProcessGroupPolicy::NewSession {
            let tty_slot = if plan.stdin_tty {
                Some(0)
            } else if plan.stdout_tty {
                Some(1)
            } else {
                None
            };
            if let Some(slot) = tty_slot
                && libc::ioctl(slot, libc::TIOCSCTTY as _, 0) < 0
            {
                fail(relay, LaunchStage::ControllingTerminal, last_errno());
            }
        }

        if let Some(cwd) = &plan.cwd
            && libc::chdir(cwd.as_ptr()) < 0
        {
            fail(relay, LaunchStage::Chdir, last_errno());
        }

        if let Some(gid) = plan.gid
            && libc::setgid(gid) < 0
        {
            fail(relay, LaunchStage::Setgid, last_errno());
        }

        if let Some(uid) = plan.uid
            && libc::setuid(uid) < 0
        {
            fail(relay, LaunchStage::Setuid, last_errno());
        }

        if let Some(hook) = &plan.pre_exec
            && let Err(e) = hook()
        {
            fail(relay, LaunchStage::PreExec, e.raw_os_error().unwrap_or(libc::EINVAL));
        }

        if !close_inherited(&plan.keep) {
            fail(relay, LaunchStage::CloseFds, last_errno());
        }
        for &fd in &plan.pass {
            if fd > 2 && !clear_cloexec(fd) {
                fail(relay, LaunchStage::CloseFds, last_errno());
            }
        }

        let mut ids = [0u8; SESSION_LEN];
        ids[..4].copy_from_slice(&libc::getsid(0).to_le_bytes());
        ids[4..].copy_from_slice(&libc::getpgid(0).to_le_bytes());
        if libc::write(plan.session, ids.as_ptr() as *const libc::c_void, SESSION_LEN)
            != SESSION_LEN as isize
        {
            fail(relay, LaunchStage::Handshake, last_errno());
        }

        match envp {
            Some(envp) => libc::execve(plan.program.as_ptr(), argv.as_ptr(), envp.as_ptr()),
            None => libc::execv(plan.program.as_ptr(), argv.as_ptr()),
        };
        fail(relay, LaunchStage::Exec, last_errno())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::serial_guard;
    use nix::sys::wait::WaitStatus;
    use std::io::Read;

    fn spawn(program: &str, args: &[&str], call_args: &CallArgs) -> Result<Launched> {
        let transports = Transports::provision(call_args, None)?;
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        spawn_child(Path::new(program), &args, call_args, None, transports)
    }

    #[test]
    fn spawn_runs_program_and_wires_stdout() {
        let _guard = serial_guard();
        let mut launched = spawn("/bin/echo", &["hello"], &CallArgs::default()).unwrap();
        let mut out = String::new();
        File::from(launched.transports.stdout.parent.take().unwrap())
            .read_to_string(&mut out)
            .unwrap();
        assert_eq!(out, "hello\n");
        assert_eq!(waitpid(launched.pid, None).unwrap(), WaitStatus::Exited(launched.pid, 0));
    }

    #[test]
    fn new_session_makes_child_the_leader() {
        let _guard = serial_guard();
        let launched = spawn("/bin/sleep", &["0"], &CallArgs::default()).unwrap();
        assert_eq!(launched.sid, Some(launched.pid));
        assert_eq!(launched.pgid, Some(launched.pid));
        let _ = waitpid(launched.pid, None);
    }

    #[test]
    fn new_group_keeps_session() {
        let _guard = serial_guard();
        let args = CallArgs {
            process_group: ProcessGroupPolicy::NewGroup,
            ..Default::default()
        };
        let launched = spawn("/bin/sleep", &["0"], &args).unwrap();
        assert_eq!(launched.pgid, Some(launched.pid));
        assert_ne!(launched.sid, Some(launched.pid));
        let _ = waitpid(launched.pid, None);
    }

    #[test]
    fn bad_cwd_is_a_launch_failure() {
        let _guard = serial_guard();
        let call_args = CallArgs::default();
        let transports = Transports::provision(&call_args, None).unwrap();
        let err = spawn_child(
            Path::new("/bin/true"),
            &[],
            &call_args,
            Some(Path::new("/definitely/not/a/dir")),
            transports,
        )
        .unwrap_err();
        match err {
            ShError::Launch { stage, source } => {
                assert_eq!(stage, LaunchStage::Chdir);
                assert_eq!(source.raw_os_error(), Some(libc::ENOENT));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn exec_failure_is_relayed() {
        let _guard = serial_guard();
        let dir = tempfile::TempDir::new().unwrap();
        let err = spawn(dir.path().to_str().unwrap(), &[], &CallArgs::default()).unwrap_err();
        assert!(matches!(
            err,
            ShError::Launch {
                stage: LaunchStage::Exec,
                ..
            }
        ));
    }

    #[test]
    fn nul_in_argument_is_rejected_before_fork() {
        let err = spawn("/bin/echo", &["a\0b"], &CallArgs::default()).unwrap_err();
        assert!(matches!(err, ShError::InvalidConfig(_)));
    }

    #[test]
    fn environment_is_replaced_when_given() {
        let _guard = serial_guard();
        let args = CallArgs {
            env: Some(vec![("ONLY_VAR".to_string(), "42".to_string())]),
            ..Default::default()
        };
        let mut launched = spawn("/usr/bin/env", &[], &args).unwrap();
        let mut out = String::new();
        File::from(launched.transports.stdout.parent.take().unwrap())
            .read_to_string(&mut out)
            .unwrap();
        assert_eq!(out, "ONLY_VAR=42\n");
        let _ = waitpid(launched.pid, None);
    }
}
