use console::{StyledObject, style};
use env_logger::{Builder, Env};
use log::{Level, LevelFilter};
use std::io::Write;
use std::thread;

/// Level for a `-v` count: warn, info, then debug
fn level_for(verbosity: u8) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        _ => LevelFilter::Debug,
    }
}

fn level_tag(level: Level) -> StyledObject<&'static str> {
    match level {
        Level::Error => style("ERROR").red().bold(),
        Level::Warn => style("WARN ").yellow().bold(),
        Level::Info => style("INFO ").green(),
        Level::Debug => style("DEBUG").cyan(),
        Level::Trace => style("TRACE").dim(),
    }
}

/// Pump threads are named `shproc-in-PID` / `shproc-out-PID`; anything else is ours
fn thread_label(name: Option<&str>) -> &str {
    match name {
        Some(name) if name.starts_with("shproc-") => name,
        _ => "ctl",
    }
}

/// Initialize logger; `RUST_LOG` still wins for module filters
///
/// At debug verbosity each line names the thread it came from, so the output
/// of several processes' pumps can be told apart.
pub fn init_logger(verbosity: u8) {
    let level = level_for(verbosity);
    let env = Env::default().filter_or("RUST_LOG", level.as_str().to_lowercase());
    let show_thread = level >= LevelFilter::Debug;

    Builder::from_env(env)
        .format(move |buf, record| {
            let tag = level_tag(record.level());
            if show_thread {
                let current = thread::current();
                let label = thread_label(current.name());
                writeln!(buf, "{} {} {}", tag, style(label).dim(), record.args())
            } else {
                writeln!(buf, "{} {}", tag, record.args())
            }
        })
        .filter_level(level)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_maps_to_levels() {
        assert_eq!(level_for(0), LevelFilter::Warn);
        assert_eq!(level_for(1), LevelFilter::Info);
        assert_eq!(level_for(5), LevelFilter::Debug);
    }

    #[test]
    fn pump_threads_keep_their_names() {
        assert_eq!(thread_label(Some("shproc-out-42")), "shproc-out-42");
        assert_eq!(thread_label(Some("main")), "ctl");
        assert_eq!(thread_label(None), "ctl");
    }
}
