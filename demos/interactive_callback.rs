//! Answers a prompt from an output callback and stops listening afterwards.
//!
//! Run with `cargo run --example interactive_callback`.

use shproc::{CallbackAction, Command, OutputSink, StdinSender};

fn main() -> shproc::Result<()> {
    env_logger::init();

    let script = r#"
        printf 'name? '
        read name
        echo "hello, $name"
    "#;

    let handle = Command::new("sh")?
        .invoke()
        .args(["-c", script])
        .out_bufsize(shproc::Bufsize::Unbuffered)
        .tty_in(true)
        .stdout(OutputSink::interactive({
            let mut seen = Vec::new();
            move |chunk: &[u8], stdin: &StdinSender| {
                seen.extend_from_slice(chunk);
                if seen.ends_with(b"name? ") {
                    stdin.send("shproc\n");
                    seen.clear();
                }
                if seen.ends_with(b"\n") {
                    print!("{}", String::from_utf8_lossy(&seen));
                    return CallbackAction::Stop;
                }
                CallbackAction::Continue
            }
        }))
        .run()?;

    println!("exit code {}", handle.exit_code()?);
    Ok(())
}
