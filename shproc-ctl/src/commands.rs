use log::info;
use shproc::resolve::which;
use shproc::signal_name;

/// Signals worth listing; realtime signals are left out
const LISTED_SIGNALS: std::ops::RangeInclusive<i32> = 1..=31;

pub fn list_signals() {
    info!("Listing signals");
    println!("Signals (use with --timeout-signal or --ok-code -N):\n");

    for sig in LISTED_SIGNALS {
        let name = signal_name(sig);
        if name != format!("SIG{}", sig) {
            println!("  {:>2}  {}", sig, name);
        }
    }
}

/// Print where `name` resolves; `false` when it doesn't
pub fn which_program(name: &str) -> bool {
    info!("Resolving {}", name);
    match which(name, None) {
        Some(path) => {
            println!("{}", path.display());
            true
        }
        None => {
            println!("{} not found", name);
            false
        }
    }
}
