//! Command templates
//!
//! A [`Command`] is a resolved program plus baked arguments and options. Each
//! call builds an [`Invocation`], which turns into a [`LaunchSpec`] and runs.
//! [`Sh`] is the registry that hands out commands by name.
//!
//! ```ignore
//! use shproc::Sh;
//!
//! let sh = Sh::new();
//! let ls = sh.command("ls")?.bake(["-1"]);
//! let out = ls.invoke().arg("/tmp").run()?.stdout_string()?;
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use log::debug;

use crate::args::{KwValue, compile_args, format_kwargs};
use crate::config::{
    Bufsize, CallArgs, InputSource, LaunchSpec, OutputSink, PipeMode, ProcessGroupPolicy,
    StreamRole,
};
use crate::errors::{Result, ShError};
use crate::execution::handle::{ProcessHandle, ProcessRef, launch};
use crate::execution::pipeline::pipe_into;
use crate::resolve::{resolve_program, which};

/// Launch `spec` and, unless it runs in the background, is iterated or is
/// piped, wait for it
pub fn run(spec: LaunchSpec) -> Result<ProcessHandle> {
    let wait = spec.call_args.waits_on_launch();
    let handle = launch(spec)?;
    if wait {
        handle.wait(None)?;
    }
    Ok(handle)
}

/// A resolved program with baked arguments and options
#[derive(Clone)]
pub struct Command {
    path: PathBuf,
    baked_args: Vec<String>,
    call_args: CallArgs,
}

impl Command {
    /// Resolve `name` along `PATH`
    pub fn new(name: &str) -> Result<Self> {
        let path = which(name, None).ok_or_else(|| ShError::NotFound(name.to_string()))?;
        Ok(Self::from_path(path))
    }

    /// Resolve `name` along the given directories instead of `PATH`
    pub fn with_search_paths(name: &str, paths: &[PathBuf]) -> Result<Self> {
        let path = which(name, Some(paths)).ok_or_else(|| ShError::NotFound(name.to_string()))?;
        Ok(Self::from_path(path))
    }

    /// Use `path` as-is; existence is checked at launch
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            baked_args: Vec::new(),
            call_args: CallArgs::default(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn baked_args(&self) -> &[String] {
        &self.baked_args
    }

    pub fn call_args(&self) -> &CallArgs {
        &self.call_args
    }

    /// A new command with `args` appended to the baked arguments
    pub fn bake<I, S>(&self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut baked = self.clone();
        baked.baked_args.extend(args.into_iter().map(Into::into));
        baked
    }

    /// A new command with keyword arguments appended to the baked arguments
    pub fn bake_kw<K, V>(&self, kwargs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<KwValue>,
    {
        let kwargs: Vec<(String, KwValue)> = kwargs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        let mut baked = self.clone();
        baked.baked_args.extend(format_kwargs(
            &kwargs,
            &self.call_args.long_prefix,
            self.call_args.long_sep.as_deref(),
            false,
        ));
        baked
    }

    /// A new command with changed default options
    pub fn bake_options(&self, f: impl FnOnce(&mut CallArgs)) -> Self {
        let mut baked = self.clone();
        f(&mut baked.call_args);
        baked
    }

    /// Start building a call
    pub fn invoke(&self) -> Invocation {
        Invocation {
            program: self.path.clone(),
            baked_args: self.baked_args.clone(),
            args: Vec::new(),
            kwargs: Vec::new(),
            call_args: self.call_args.clone(),
            stdin: InputSource::default(),
            stdout: OutputSink::default(),
            stderr: OutputSink::default(),
        }
    }

    /// Run with extra positional arguments and default streams
    pub fn run<I, S>(&self, args: I) -> Result<ProcessHandle>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.invoke().args(args).run()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())?;
        for arg in &self.baked_args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("path", &self.path)
            .field("baked_args", &self.baked_args)
            .finish_non_exhaustive()
    }
}

/// One call of a [`Command`]
pub struct Invocation {
    program: PathBuf,
    baked_args: Vec<String>,
    args: Vec<String>,
    kwargs: Vec<(String, KwValue)>,
    call_args: CallArgs,
    stdin: InputSource,
    stdout: OutputSink,
    stderr: OutputSink,
}

impl Invocation {
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Keyword argument, formatted after the positional ones
    pub fn kw(mut self, key: impl Into<String>, value: impl Into<KwValue>) -> Self {
        self.kwargs.push((key.into(), value.into()));
        self
    }

    pub fn stdin(mut self, source: impl Into<InputSource>) -> Self {
        self.stdin = source.into();
        self
    }

    pub fn stdout(mut self, sink: OutputSink) -> Self {
        self.stdout = sink;
        self
    }

    pub fn stderr(mut self, sink: OutputSink) -> Self {
        self.stderr = sink;
        self
    }

    pub fn bg(mut self) -> Self {
        self.call_args.bg = true;
        self
    }

    pub fn fg(mut self) -> Self {
        self.call_args.fg = true;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.call_args.timeout = Some(timeout);
        self
    }

    pub fn timeout_signal(mut self, sig: i32) -> Self {
        self.call_args.timeout_signal = sig;
        self
    }

    pub fn ok_code(mut self, codes: impl Into<Vec<i32>>) -> Self {
        self.call_args.ok_code = codes.into();
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.call_args.cwd = Some(dir.into());
        self
    }

    /// Replace the child's environment
    pub fn env<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.call_args.env = Some(
            vars.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        );
        self
    }

    pub fn tty_in(mut self, tty: bool) -> Self {
        self.call_args.tty_in = tty;
        self
    }

    pub fn tty_out(mut self, tty: bool) -> Self {
        self.call_args.tty_out = tty;
        self
    }

    pub fn tty_size(mut self, rows: u16, cols: u16) -> Self {
        self.call_args.tty_size = (rows, cols);
        self
    }

    pub fn in_bufsize(mut self, bufsize: Bufsize) -> Self {
        self.call_args.in_bufsize = bufsize;
        self
    }

    pub fn out_bufsize(mut self, bufsize: Bufsize) -> Self {
        self.call_args.out_bufsize = bufsize;
        self
    }

    pub fn err_bufsize(mut self, bufsize: Bufsize) -> Self {
        self.call_args.err_bufsize = bufsize;
        self
    }

    pub fn err_to_out(mut self) -> Self {
        self.call_args.err_to_out = true;
        self
    }

    pub fn tee(mut self, role: StreamRole) -> Self {
        self.call_args.tee = Some(role);
        self
    }

    pub fn no_out(mut self) -> Self {
        self.call_args.no_out = true;
        self
    }

    pub fn no_err(mut self) -> Self {
        self.call_args.no_err = true;
        self
    }

    pub fn no_pipe(mut self) -> Self {
        self.call_args.no_pipe = true;
        self
    }

    pub fn piped(mut self, mode: PipeMode) -> Self {
        self.call_args.piped = Some(mode);
        self
    }

    pub fn iter(mut self, role: StreamRole) -> Self {
        self.call_args.iter = Some(role);
        self
    }

    pub fn iter_noblock(mut self, role: StreamRole) -> Self {
        self.call_args.iter_noblock = Some(role);
        self
    }

    pub fn process_group(mut self, policy: ProcessGroupPolicy) -> Self {
        self.call_args.process_group = policy;
        self
    }

    pub fn uid(mut self, uid: u32) -> Self {
        self.call_args.uid = Some(uid);
        self
    }

    pub fn gid(mut self, gid: u32) -> Self {
        self.call_args.gid = Some(gid);
        self
    }

    pub fn pass_fds(mut self, fds: impl Into<Vec<i32>>) -> Self {
        self.call_args.pass_fds = fds.into();
        self
    }

    /// Run in the background and call `f` once the process is reaped
    pub fn done<F>(mut self, f: F) -> Self
    where
        F: Fn(&ProcessRef, bool, i32) + Send + Sync + 'static,
    {
        self.call_args.done = Some(Arc::new(f));
        self
    }

    pub fn bg_exc(mut self) -> Self {
        self.call_args.bg_exc = true;
        self
    }

    pub fn log_msg<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, Option<i32>) -> String + Send + Sync + 'static,
    {
        self.call_args.log_msg = Some(Arc::new(f));
        self
    }

    pub fn pre_exec<F>(mut self, f: F) -> Self
    where
        F: Fn() -> std::io::Result<()> + Send + Sync + 'static,
    {
        self.call_args.pre_exec = Some(Arc::new(f));
        self
    }

    /// Any other option
    pub fn options(mut self, f: impl FnOnce(&mut CallArgs)) -> Self {
        f(&mut self.call_args);
        self
    }

    /// Baked arguments, then positional ones, then formatted keywords
    pub fn into_spec(self) -> LaunchSpec {
        let mut args = self.baked_args;
        args.extend(compile_args(
            &self.args,
            &self.kwargs,
            &self.call_args.long_prefix,
            self.call_args.long_sep.as_deref(),
        ));
        LaunchSpec {
            program: self.program,
            args,
            call_args: self.call_args,
            stdin: self.stdin,
            stdout: self.stdout,
            stderr: self.stderr,
        }
    }

    pub fn run(self) -> Result<ProcessHandle> {
        run(self.into_spec())
    }

    /// Run reading `upstream`'s stdout
    pub fn pipe_from(self, upstream: ProcessHandle) -> Result<ProcessHandle> {
        let spec = self.into_spec();
        let wait = spec.call_args.waits_on_launch();
        let handle = pipe_into(upstream, spec)?;
        if wait {
            handle.wait(None)?;
        }
        Ok(handle)
    }
}

/// Hands out [`Command`]s by name
///
/// Replaces attribute-style lookup: `sh.command("git")` instead of `sh.git`.
/// Names that don't resolve are retried with underscores turned into dashes.
#[derive(Clone, Default)]
pub struct Sh {
    defaults: CallArgs,
    search_paths: Option<Vec<PathBuf>>,
}

impl Sh {
    pub fn new() -> Self {
        Self::default()
    }

    /// Options every command from this registry starts with
    pub fn with_defaults(defaults: CallArgs) -> Self {
        Self {
            defaults,
            search_paths: None,
        }
    }

    /// Search these directories instead of `PATH`
    pub fn search_paths(mut self, paths: Vec<PathBuf>) -> Self {
        self.search_paths = Some(paths);
        self
    }

    pub fn defaults(&self) -> &CallArgs {
        &self.defaults
    }

    pub fn command(&self, name: &str) -> Result<Command> {
        let path = resolve_program(name, self.search_paths.as_deref())?;
        debug!("resolved {} to {}", name, path.display());
        Ok(Command {
            path,
            baked_args: Vec::new(),
            call_args: self.defaults.clone(),
        })
    }
}

impl fmt::Debug for Sh {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sh")
            .field("defaults", &self.defaults)
            .field("search_paths", &self.search_paths)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bake_appends_arguments() {
        let cmd = Command::from_path("/bin/ls").bake(["-l"]);
        let baked = cmd.bake(["-a"]);
        assert_eq!(cmd.baked_args(), ["-l"]);
        assert_eq!(baked.baked_args(), ["-l", "-a"]);
        assert_eq!(baked.to_string(), "/bin/ls -l -a");
    }

    #[test]
    fn test_bake_kw_formats_keywords() {
        let cmd = Command::from_path("/usr/bin/git")
            .bake_kw([("n", KwValue::from(3)), ("no_pager", KwValue::from(true))]);
        assert_eq!(cmd.baked_args(), ["-n", "3", "--no-pager"]);
    }

    #[test]
    fn test_bake_options_does_not_touch_original() {
        let cmd = Command::from_path("/bin/true");
        let quiet = cmd.bake_options(|args| args.no_out = true);
        assert!(quiet.call_args().no_out);
        assert!(!cmd.call_args().no_out);
    }

    #[test]
    fn test_into_spec_orders_arguments() {
        let spec = Command::from_path("/bin/echo")
            .bake(["baked"])
            .invoke()
            .arg("pos")
            .kw("color", "never")
            .kw("v", true)
            .into_spec();
        assert_eq!(spec.args, ["baked", "pos", "--color=never", "-v"]);
    }

    #[test]
    fn test_long_sep_none_splits_value() {
        let spec = Command::from_path("/bin/echo")
            .invoke()
            .options(|args| args.long_sep = None)
            .kw("color", "never")
            .into_spec();
        assert_eq!(spec.args, ["--color", "never"]);
    }

    #[test]
    fn test_unknown_command_is_not_found() {
        let err = Sh::new().command("no_such_program_here_xyz").unwrap_err();
        assert!(err.is_not_found());
        assert!(Command::new("no-such-program-here-xyz").is_err());
    }

    #[test]
    fn test_registry_applies_defaults() {
        let sh = Sh::with_defaults(CallArgs {
            ok_code: vec![0, 1],
            ..Default::default()
        });
        let cmd = sh.command("sh").unwrap();
        assert_eq!(cmd.call_args().ok_code, vec![0, 1]);
        assert!(cmd.path().is_absolute());
    }
}
