use console::style;
use log::{debug, info};
use serde::Serialize;
use shproc::{
    Bufsize, CallArgs, LaunchSpec, OutputSink, PipeMode, Pipeline, ProcessHandle, Sh, ShError,
    parse_signal,
};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Options shared by single runs and pipelines
pub struct RunConfig {
    pub timeout: Option<f64>,
    pub timeout_signal: Option<String>,
    pub ok_codes: Vec<i32>,
    pub cwd: Option<PathBuf>,
    pub tty_in: bool,
    pub tty_out: bool,
    pub bufsize: Bufsize,
    pub err_to_out: bool,
    pub json: bool,
}

/// Printed after the command finishes
#[derive(Debug, Serialize)]
pub struct RunReport {
    pub command: String,
    pub pid: i32,
    pub exit_code: i32,
    pub success: bool,
    pub wall_time_ms: u128,
    pub stdout_bytes: usize,
    pub timed_out: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunConfig {
    fn call_args(&self) -> Result<CallArgs, Box<dyn std::error::Error>> {
        let mut args = CallArgs {
            cwd: self.cwd.clone(),
            tty_in: self.tty_in,
            tty_out: self.tty_out,
            out_bufsize: self.bufsize,
            err_to_out: self.err_to_out,
            ..Default::default()
        };

        if let Some(secs) = self.timeout {
            if !secs.is_finite() || secs <= 0.0 {
                return Err(format!("Invalid timeout: {}", secs).into());
            }
            debug!("Timeout: {}s", secs);
            args.timeout = Some(Duration::from_secs_f64(secs));
        }

        if let Some(name) = &self.timeout_signal {
            args.timeout_signal =
                parse_signal(name).ok_or_else(|| format!("Unknown signal: {}", name))?;
        }

        if !self.ok_codes.is_empty() {
            debug!("Accepted exit codes: {:?}", self.ok_codes);
            args.ok_code = self.ok_codes.clone();
        }

        Ok(args)
    }
}

/// Stdout sink that echoes to our stdout and counts bytes
fn echo_stdout(counter: Arc<AtomicUsize>) -> OutputSink {
    OutputSink::callback(move |chunk: &[u8]| {
        counter.fetch_add(chunk.len(), Ordering::Relaxed);
        let mut out = io::stdout().lock();
        // a closed stdout (e.g. piped into `head`) stops the echo, not the child
        out.write_all(chunk).and_then(|_| out.flush()).is_err()
    })
}

/// Split a stage like `"head -n 3"` into a resolved launch spec
fn stage_spec(sh: &Sh, stage: &str) -> Result<LaunchSpec, Box<dyn std::error::Error>> {
    let mut words = stage.split_whitespace();
    let program = words
        .next()
        .ok_or_else(|| format!("Empty pipeline stage: {:?}", stage))?;
    let command = sh.command(program)?;
    Ok(command.invoke().args(words).into_spec())
}

pub fn run_command(
    program: &str,
    args: Vec<String>,
    config: RunConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let sh = Sh::with_defaults(config.call_args()?);
    let command = sh.command(program)?;
    let counter = Arc::new(AtomicUsize::new(0));

    info!("Executing: {} {:?}", command, args);

    let started = Instant::now();
    let handle = command
        .invoke()
        .args(args)
        .stdout(echo_stdout(Arc::clone(&counter)))
        .stderr(OutputSink::writer(io::stderr()))
        .bg()
        .run()?;

    finish(handle, started, &counter, config.json)
}

pub fn run_pipeline(
    stages: &[String],
    mode: Option<PipeMode>,
    config: RunConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let sh = Sh::with_defaults(config.call_args()?);
    let counter = Arc::new(AtomicUsize::new(0));

    let mut specs = stages
        .iter()
        .map(|stage| stage_spec(&sh, stage))
        .collect::<Result<Vec<_>, _>>()?;

    if let Some(last) = specs.last_mut() {
        last.stdout = echo_stdout(Arc::clone(&counter));
        last.stderr = OutputSink::writer(io::stderr());
        last.call_args.bg = true;
    }

    let mut specs = specs.into_iter();
    let first = specs.next().ok_or("Pipeline needs at least one stage")?;
    let mut pipeline = specs.fold(Pipeline::new(first), Pipeline::pipe);
    if let Some(mode) = mode {
        pipeline = pipeline.streaming(mode);
    }

    info!("Executing pipeline of {} stages ({:?})", pipeline.len(), mode);

    let started = Instant::now();
    let handle = pipeline.run()?;
    finish(handle, started, &counter, config.json)
}

fn finish(
    handle: ProcessHandle,
    started: Instant,
    counter: &AtomicUsize,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let result = handle.wait(None);
    let wall_time_ms = started.elapsed().as_millis();

    info!("Execution completed in {}ms", wall_time_ms);

    let (exit_code, error) = match &result {
        Ok(code) => (*code, None),
        Err(e) => (e.exit_code().unwrap_or(-1), Some(summarize(e))),
    };

    let report = RunReport {
        command: handle.command_line().to_string(),
        pid: handle.pid(),
        exit_code,
        success: result.is_ok(),
        wall_time_ms,
        stdout_bytes: counter.load(Ordering::Relaxed),
        timed_out: result.as_ref().is_err_and(ShError::is_timeout),
        error,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_summary(&report);
    }

    std::process::exit(shell_status(&report));
}

fn summarize(err: &ShError) -> String {
    match err.exit_failure() {
        Some(failure) => failure.name(),
        None => err.to_string(),
    }
}

/// Exit status the way a shell reports it: 128+N for signal N
fn shell_status(report: &RunReport) -> i32 {
    match report.exit_code {
        code if code < 0 => 128 - code,
        _ if report.success => 0,
        0 => 1,
        code => code,
    }
}

fn print_summary(report: &RunReport) {
    let exit_code_styled = if report.success {
        style(report.exit_code).green().bold()
    } else {
        style(report.exit_code).red().bold()
    };

    eprint!(
        "{}={} | {}={} | {}={} | {}={}",
        style("exit_code").dim(),
        exit_code_styled,
        style("pid").dim(),
        style(report.pid).bold(),
        style("wall_time_ms").dim(),
        style(report.wall_time_ms).bold(),
        style("stdout_bytes").dim(),
        style(report.stdout_bytes).bold(),
    );

    if report.timed_out {
        eprint!(
            " | {}={}",
            style("timed_out").red(),
            style("true").red().bold()
        );
    }

    if let Some(error) = &report.error {
        eprint!(" | {}={}", style("error").red(), error);
    }

    eprintln!();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(exit_code: i32, success: bool) -> RunReport {
        RunReport {
            command: "/bin/true".to_string(),
            pid: 1,
            exit_code,
            success,
            wall_time_ms: 0,
            stdout_bytes: 0,
            timed_out: false,
            error: None,
        }
    }

    fn config() -> RunConfig {
        RunConfig {
            timeout: None,
            timeout_signal: None,
            ok_codes: Vec::new(),
            cwd: None,
            tty_in: false,
            tty_out: false,
            bufsize: Bufsize::Line,
            err_to_out: false,
            json: false,
        }
    }

    #[test]
    fn shell_status_follows_shell_conventions() {
        assert_eq!(shell_status(&report(0, true)), 0);
        assert_eq!(shell_status(&report(1, true)), 0);
        assert_eq!(shell_status(&report(3, false)), 3);
        assert_eq!(shell_status(&report(-9, false)), 137);
        assert_eq!(shell_status(&report(0, false)), 1);
    }

    #[test]
    fn call_args_from_config() {
        let mut cfg = config();
        cfg.timeout = Some(1.5);
        cfg.timeout_signal = Some("TERM".to_string());
        cfg.ok_codes = vec![0, 2];

        let args = cfg.call_args().unwrap();
        assert_eq!(args.timeout, Some(Duration::from_millis(1500)));
        assert_eq!(args.timeout_signal, 15);
        assert_eq!(args.ok_code, vec![0, 2]);
    }

    #[test]
    fn bad_timeout_is_rejected() {
        let mut cfg = config();
        cfg.timeout = Some(-1.0);
        assert!(cfg.call_args().is_err());
    }

    #[test]
    fn report_serializes_without_empty_error() {
        let json = serde_json::to_value(report(0, true)).unwrap();
        assert_eq!(json["exit_code"], 0);
        assert!(json.get("error").is_none());
    }
}
