use clap::{Parser, Subcommand, ValueEnum};
use shproc::{Bufsize, PipeMode};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "shproc-ctl")]
#[command(version, about = "Run commands and streaming pipelines", long_about = None)]
#[command(args_conflicts_with_subcommands = true)]
#[command(after_help = "EXAMPLES:
    # Run one command, streaming its output
    shproc-ctl ls -la /tmp
    shproc-ctl --timeout 5 --ok-code 0 --ok-code 1 grep foo notes.txt

    # Pipelines: each stage is one quoted command line
    shproc-ctl pipe 'yes hello' 'head -n 3'
    shproc-ctl pipe --mode direct 'cat big.log' 'grep ERROR'

    # Helpers
    shproc-ctl which python3
    shproc-ctl signals
")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Program to run (direct mode)
    #[arg(value_name = "PROGRAM")]
    pub program: Option<String>,

    /// Program arguments
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,

    /// Kill the process after this many seconds
    #[arg(short, long, value_name = "SECONDS", global = true)]
    pub timeout: Option<f64>,

    /// Signal sent on timeout (name or number)
    #[arg(long, value_name = "SIGNAL", global = true)]
    pub timeout_signal: Option<String>,

    /// Accepted exit code; repeat for several
    #[arg(long = "ok-code", value_name = "CODE", global = true, allow_hyphen_values = true)]
    pub ok_codes: Vec<i32>,

    /// Working directory of the child
    #[arg(short = 'C', long, value_name = "DIR", global = true)]
    pub cwd: Option<PathBuf>,

    /// Give the child a pseudo-terminal for stdout
    #[arg(long, global = true)]
    pub tty_out: bool,

    /// Give the child a pseudo-terminal for stdin
    #[arg(long, global = true)]
    pub tty_in: bool,

    /// Output buffering
    #[arg(short, long, value_enum, default_value_t = Buffering::Line, global = true)]
    pub buffering: Buffering,

    /// Chunk size for --buffering bytes
    #[arg(long, value_name = "BYTES", default_value_t = 4096, global = true)]
    pub chunk_size: usize,

    /// Fold stderr into stdout
    #[arg(long, global = true)]
    pub err_to_out: bool,

    /// Print a JSON report instead of the summary line
    #[arg(long, global = true)]
    pub json: bool,

    /// More log output; repeat for debug
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a program
    Run {
        /// Program to run
        program: String,

        /// Program arguments
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Run a pipeline; each stage is a whitespace-separated command line
    Pipe {
        /// How stages are connected
        #[arg(short, long, value_enum, default_value_t = Mode::Relay)]
        mode: Mode,

        /// Stages, upstream first
        #[arg(required = true, num_args = 2..)]
        stages: Vec<String>,
    },

    /// Resolve a program name along PATH
    Which {
        name: String,
    },

    /// List signal names and numbers
    Signals,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
pub enum Buffering {
    /// One chunk per byte
    None,
    /// One chunk per line
    Line,
    /// Fixed-size chunks (see --chunk-size)
    Bytes,
}

impl Buffering {
    pub fn to_bufsize(self, chunk_size: usize) -> Bufsize {
        match self {
            Buffering::None => Bufsize::Unbuffered,
            Buffering::Line => Bufsize::Line,
            Buffering::Bytes => Bufsize::Bytes(chunk_size),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// Each stage finishes before the next starts
    Sequential,
    /// Stages run together; chunks are relayed by the upstream pump
    Relay,
    /// Stages run together; upstream stdout is downstream stdin
    Direct,
}

impl Mode {
    pub fn pipe_mode(self) -> Option<PipeMode> {
        match self {
            Mode::Sequential => None,
            Mode::Relay => Some(PipeMode::Relay),
            Mode::Direct => Some(PipeMode::Direct),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_direct_mode_with_options() {
        let cli = Cli::try_parse_from([
            "shproc-ctl",
            "--timeout",
            "2.5",
            "--ok-code",
            "1",
            "grep",
            "foo",
            "-r",
        ])
        .unwrap();
        assert_eq!(cli.program.as_deref(), Some("grep"));
        assert_eq!(cli.args, ["foo", "-r"]);
        assert_eq!(cli.timeout, Some(2.5));
        assert_eq!(cli.ok_codes, [1]);
    }

    #[test]
    fn parses_pipe_stages() {
        let cli =
            Cli::try_parse_from(["shproc-ctl", "pipe", "--mode", "direct", "yes", "head -n 1"])
                .unwrap();
        match cli.command {
            Some(Commands::Pipe { mode, stages }) => {
                assert_eq!(mode, Mode::Direct);
                assert_eq!(stages, ["yes", "head -n 1"]);
            }
            _ => panic!("expected pipe subcommand"),
        }
    }

    #[test]
    fn buffering_maps_to_bufsize() {
        assert_eq!(Buffering::None.to_bufsize(8), Bufsize::Unbuffered);
        assert_eq!(Buffering::Bytes.to_bufsize(8), Bufsize::Bytes(8));
    }
}
