//! Streams an endless producer into a consumer that stops after a few lines.
//!
//! Run with `cargo run --example streaming_pipeline`.

use shproc::{OutputSink, PipeMode, Pipeline, Sh};
use std::time::Duration;

fn main() -> shproc::Result<()> {
    env_logger::init();

    let sh = Sh::new();
    let producer = sh
        .command("sh")?
        .invoke()
        .args(["-c", "i=0; while :; do i=$((i+1)); echo \"line $i\"; sleep 0.1; done"])
        .into_spec();
    let consumer = sh
        .command("head")?
        .invoke()
        .kw("n", 5)
        .stdout(OutputSink::callback(|chunk: &[u8]| {
            print!("consumer got: {}", String::from_utf8_lossy(chunk));
        }))
        .timeout(Duration::from_secs(10))
        .into_spec();

    let handle = Pipeline::new(producer)
        .pipe(consumer)
        .streaming(PipeMode::Direct)
        .run()?;

    // the producer is killed by SIGPIPE once `head` exits
    match handle.wait(None) {
        Ok(code) => println!("pipeline finished with {}", code),
        Err(e) if e.is_signal() => {
            let name = e.exit_failure().map(|f| f.name()).unwrap_or_default();
            println!("producer stopped: {}", name);
        }
        Err(e) => return Err(e),
    }
    Ok(())
}
