//! shproc controller CLI - Run commands and pipelines, report how they ended

mod cli;
mod commands;
mod logging;
mod runner;

use clap::Parser;
use cli::{Cli, Commands};
use commands::{list_signals, which_program};
use console::style;
use runner::{RunConfig, run_command, run_pipeline};

fn run_config(cli: &Cli) -> RunConfig {
    RunConfig {
        timeout: cli.timeout,
        timeout_signal: cli.timeout_signal.clone(),
        ok_codes: cli.ok_codes.clone(),
        cwd: cli.cwd.clone(),
        tty_in: cli.tty_in,
        tty_out: cli.tty_out,
        bufsize: cli.buffering.to_bufsize(cli.chunk_size),
        err_to_out: cli.err_to_out,
        json: cli.json,
    }
}

fn fail(err: Box<dyn std::error::Error>) -> ! {
    eprintln!("{} {}", style("error:").red().bold(), err);
    std::process::exit(1);
}

fn main() {
    let cli = Cli::parse();

    logging::init_logger(cli.verbose);

    let config = run_config(&cli);

    if let Some(command) = cli.command {
        match command {
            Commands::Run { program, args } => {
                if let Err(e) = run_command(&program, args, config) {
                    fail(e);
                }
            }
            Commands::Pipe { mode, stages } => {
                if let Err(e) = run_pipeline(&stages, mode.pipe_mode(), config) {
                    fail(e);
                }
            }
            Commands::Which { name } => {
                if !which_program(&name) {
                    std::process::exit(1);
                }
            }
            Commands::Signals => list_signals(),
        }
        return;
    }

    let Some(program) = cli.program else {
        eprintln!("{} No program specified", style("error:").red().bold());
        eprintln!(
            "Try {} for more information",
            style("shproc-ctl --help").cyan()
        );
        std::process::exit(1);
    };

    if let Err(e) = run_command(&program, cli.args, config) {
        fail(e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_signals_runs() {
        list_signals();
    }

    #[test]
    fn which_finds_sh() {
        assert!(which_program("sh"));
        assert!(!which_program("definitely-not-installed-anywhere"));
    }

    #[test]
    fn run_config_uses_buffering_choice() {
        let cli = Cli::try_parse_from(["shproc-ctl", "-b", "bytes", "--chunk-size", "16", "true"])
            .unwrap();
        assert_eq!(run_config(&cli).bufsize, shproc::Bufsize::Bytes(16));
    }
}
