//! Integration tests for shproc
//!
//! These tests run real programs from the base system (`sh`, `cat`, `sleep`)
//! through the public API. They fork, so they run one at a time.

use shproc::{
    Bufsize, Command, InputSource, LaunchSpec, OutputSink, PipeMode, Pipeline, Sh, ShError,
    StreamRole,
};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

static INTEGRATION_TEST_LOCK: Mutex<()> = Mutex::new(());

fn sh() -> Command {
    Sh::new().command("sh").unwrap().bake(["-c"])
}

/// Default configuration: exit 0 and the exact output
#[test]
fn test_printf_scenario() {
    let _lock = INTEGRATION_TEST_LOCK.lock();

    let handle = sh().run(["printf '%s' hi"]).unwrap();

    assert_eq!(handle.exit_code().unwrap(), 0);
    assert_eq!(handle.stdout().unwrap(), b"hi");
}

/// Accepted code sets decide success
#[test]
fn test_exit_code_against_accepted_set() {
    let _lock = INTEGRATION_TEST_LOCK.lock();

    for code in [0, 1, 2, 7] {
        let result = sh()
            .invoke()
            .arg(format!("exit {}", code))
            .ok_code([0, 2])
            .run();
        let accepted = code == 0 || code == 2;
        assert_eq!(result.is_ok(), accepted, "exit {}", code);
        if !accepted {
            assert_eq!(result.unwrap_err().exit_code(), Some(code));
        }
    }
}

/// A signal death records -k and raises a signal failure
#[test]
fn test_signal_termination() {
    let _lock = INTEGRATION_TEST_LOCK.lock();

    let err = sh().run(["kill -TERM $$"]).unwrap_err();

    assert!(err.is_signal());
    let failure = err.exit_failure().unwrap();
    assert_eq!(failure.exit_code, -15);
    assert_eq!(failure.signal(), Some(15));
}

/// Only the first wait reports the failure
#[test]
fn test_wait_is_idempotent() {
    let _lock = INTEGRATION_TEST_LOCK.lock();

    let handle = sh().invoke().arg("exit 5").bg().run().unwrap();

    assert!(handle.wait(None).is_err());
    assert_eq!(handle.wait(None).unwrap(), 5);
    assert_eq!(handle.wait(None).unwrap(), 5);
}

/// Line buffering calls back once per line; unbuffered once per byte
#[test]
fn test_buffering_callback_counts() {
    let _lock = INTEGRATION_TEST_LOCK.lock();

    for (bufsize, expected) in [(Bufsize::Line, 2), (Bufsize::Unbuffered, 12)] {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&calls);
        sh().invoke()
            .arg("printf 'line1\\nline2\\n'")
            .out_bufsize(bufsize)
            .stdout(OutputSink::callback(move |chunk: &[u8]| {
                seen.lock().unwrap().push(chunk.to_vec());
            }))
            .run()
            .unwrap();

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), expected, "{:?}", bufsize);
        assert_eq!(calls.concat(), b"line1\nline2\n");
    }
}

/// Stdin text arrives byte for byte
#[test]
fn test_stdin_round_trip() {
    let _lock = INTEGRATION_TEST_LOCK.lock();

    let cat = Command::new("cat").unwrap();
    let handle = cat.invoke().stdin("abc").run().unwrap();

    assert_eq!(handle.stdout().unwrap(), b"abc");
}

/// Missing programs fail before any process exists
#[test]
fn test_missing_program_is_not_found() {
    let _lock = INTEGRATION_TEST_LOCK.lock();

    let err = Sh::new().command("no_such_binary_for_shproc").unwrap_err();
    assert!(matches!(err, ShError::NotFound(_)));

    let err = shproc::run(LaunchSpec::new("/nonexistent/bin/tool")).unwrap_err();
    assert!(err.is_not_found());
}

/// A wait deadline does not kill the process
#[test]
fn test_wait_timeout_leaves_process_alive() {
    let _lock = INTEGRATION_TEST_LOCK.lock();

    let sleep = Command::new("sleep").unwrap();
    let handle = sleep.invoke().arg("5").bg().run().unwrap();

    let started = Instant::now();
    let err = handle.wait(Some(Duration::from_secs(1))).unwrap_err();
    assert!(matches!(err, ShError::WaitTimeout(_)));
    assert!(started.elapsed() >= Duration::from_millis(900));
    assert!(handle.is_alive());

    handle.kill().unwrap();
    assert!(handle.wait(None).unwrap_err().is_signal());
}

/// Background process: alive right away, done after wait
#[test]
fn test_background_liveness() {
    let _lock = INTEGRATION_TEST_LOCK.lock();

    let sleep = Command::new("sleep").unwrap();
    let handle = sleep.invoke().arg("1").bg().run().unwrap();

    assert!(handle.is_alive());
    assert_eq!(handle.wait(None).unwrap(), 0);
    assert!(!handle.is_alive());
}

/// The configured timeout signals the process
#[test]
fn test_timeout_action() {
    let _lock = INTEGRATION_TEST_LOCK.lock();

    let sleep = Command::new("sleep").unwrap();
    let started = Instant::now();
    let err = sleep
        .invoke()
        .arg("5")
        .timeout(Duration::from_millis(300))
        .timeout_signal(libc::SIGTERM)
        .run()
        .unwrap_err();

    assert!(err.is_timeout());
    assert!(started.elapsed() < Duration::from_secs(3));
}

/// Downstream consumes while an endless upstream keeps producing
#[test]
fn test_streaming_pipeline_with_endless_producer() {
    let _lock = INTEGRATION_TEST_LOCK.lock();

    let (tx, rx) = std::sync::mpsc::channel();
    let upstream = sh()
        .invoke()
        .arg("while :; do echo tick; sleep 0.05; done")
        .into_spec();
    let downstream = sh()
        .invoke()
        .arg("read a; read b; echo \"$a $b\"")
        .stdout(OutputSink::callback(move |chunk: &[u8]| {
            let _ = tx.send(chunk.to_vec());
        }))
        .bg()
        .into_spec();

    let handle = Pipeline::new(upstream)
        .pipe(downstream)
        .streaming(PipeMode::Direct)
        .run()
        .unwrap();

    let line = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(line, b"tick tick\n");

    // the producer only stops once its reader is gone: SIGPIPE
    let err = handle.wait(None).unwrap_err();
    assert_eq!(err.exit_code(), Some(-libc::SIGPIPE));
}

/// A sequential pipeline feeds the whole upstream output downstream
#[test]
fn test_sequential_pipeline() {
    let _lock = INTEGRATION_TEST_LOCK.lock();

    let upstream = sh().invoke().arg("printf 'b\\na\\nc\\n'").into_spec();
    let downstream = Command::new("sort").unwrap().invoke().into_spec();

    let handle = Pipeline::new(upstream).pipe(downstream).run().unwrap();
    assert_eq!(handle.stdout_string().unwrap(), "a\nb\nc\n");
}

/// `pipe_from` chains a piped upstream into a new call
#[test]
fn test_pipe_from_relay() {
    let _lock = INTEGRATION_TEST_LOCK.lock();

    let upstream = sh()
        .invoke()
        .arg("echo one; echo two")
        .piped(PipeMode::Relay)
        .run()
        .unwrap();
    let handle = Command::new("cat")
        .unwrap()
        .invoke()
        .pipe_from(upstream)
        .unwrap();

    assert_eq!(handle.stdout().unwrap(), b"one\ntwo\n");
}

/// Iterating over stderr while stdout is stored
#[test]
fn test_iterate_stderr() {
    let _lock = INTEGRATION_TEST_LOCK.lock();

    let handle = sh()
        .invoke()
        .arg("echo out; echo e1 >&2; echo e2 >&2")
        .iter(StreamRole::Stderr)
        .run()
        .unwrap();

    let chunks: Vec<Vec<u8>> = handle.iter().map(Result::unwrap).collect();
    assert_eq!(chunks.concat(), b"e1\ne2\n");
    assert_eq!(handle.stdout().unwrap(), b"out\n");
}

/// Reading stdin from a file hands the descriptor straight to the child
#[test]
fn test_stdin_from_file_and_stdout_to_file() {
    let _lock = INTEGRATION_TEST_LOCK.lock();

    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.txt");
    let output = dir.path().join("out.txt");
    std::fs::write(&input, "payload\n").unwrap();

    Command::new("cat")
        .unwrap()
        .invoke()
        .stdin(InputSource::Path(input))
        .stdout(OutputSink::Path(output.clone()))
        .run()
        .unwrap();

    assert_eq!(std::fs::read_to_string(output).unwrap(), "payload\n");
}

/// Environment replacement and keyword arguments reach the child
#[test]
fn test_env_and_keyword_arguments() {
    let _lock = INTEGRATION_TEST_LOCK.lock();

    let handle = sh()
        .invoke()
        .arg("echo \"$GREETING\" \"$@\"")
        .arg("prog")
        .kw("name", "value")
        .kw("x", true)
        .env([("GREETING", "hello")])
        .run()
        .unwrap();

    assert_eq!(handle.stdout_string().unwrap(), "hello --name=value -x\n");
}

/// Failure messages carry the command and both streams
#[test]
fn test_failure_message_contents() {
    let _lock = INTEGRATION_TEST_LOCK.lock();

    let err = sh().run(["echo visible; echo problem >&2; exit 9"]).unwrap_err();
    let message = err.to_string();

    assert!(message.contains("RAN:"));
    assert!(message.contains("visible"));
    assert!(message.contains("problem"));
    assert_eq!(err.exit_failure().unwrap().name(), "ErrorReturnCode_9");
}

/// A relayed consumer that quits early ends the producer with SIGPIPE
#[test]
fn test_relay_pipeline_with_early_exit_consumer() {
    let _lock = INTEGRATION_TEST_LOCK.lock();

    let (tx, rx) = std::sync::mpsc::channel();
    std::thread::spawn(move || {
        let sh = Sh::new();
        let upstream = sh.command("yes").unwrap().invoke().arg("hello").into_spec();
        let downstream = sh
            .command("head")
            .unwrap()
            .invoke()
            .args(["-n", "3"])
            .bg()
            .into_spec();

        let handle = Pipeline::new(upstream)
            .pipe(downstream)
            .streaming(PipeMode::Relay)
            .run()
            .unwrap();
        let err = handle.wait(None).unwrap_err();
        let _ = tx.send((err.exit_code(), handle.stdout_string().unwrap()));
    });

    let (code, stdout) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(code, Some(-libc::SIGPIPE));
    assert_eq!(stdout, "hello\nhello\nhello\n");
}
