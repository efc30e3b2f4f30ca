//! Command-line interface definitions using clap.

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;
use std::time::Duration;

use prewarm::engine::DEFAULT_INTERPRETER;

/// Keep warm, preloaded interpreter processes ready for short-lived runs.
#[derive(Parser, Debug)]
#[command(name = "prewarm")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Interpreter that preloads and runs programs.
    #[arg(long, global = true, env = "PREWARM_INTERPRETER", default_value = DEFAULT_INTERPRETER)]
    pub interpreter: PathBuf,

    /// Enable verbose output (-v info, -vv debug, -vvv trace with span timing).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Disable colored output.
    #[arg(long, global = true, env = "NO_COLOR")]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start a pool and run $SHELL with it registered.
    Serve(ServeArgs),

    /// Exit 0 if a pool is registered in this environment.
    Ping,

    /// Run a program on a warm worker (interactive session if none given).
    Run(RunArgs),

    /// Generate shell completions.
    Completions(CompletionsArgs),
}

/// Arguments for the serve command.
#[derive(Parser, Debug)]
pub struct ServeArgs {
    /// Program every worker runs before it is considered warm.
    pub preloader: PathBuf,

    /// Number of warm workers to keep ready.
    #[arg(
        env = "PREWARM_WORKERS",
        default_value_t = 4,
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    pub workers: u32,

    /// Seconds a job gets to exit after an interrupt before it is killed.
    #[arg(long, env = "PREWARM_GRACE_SECS", default_value_t = 10)]
    pub grace_secs: u64,
}

impl ServeArgs {
    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_secs)
    }
}

/// Arguments for the run command.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Program file followed by its arguments.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "PROGRAM")]
    pub args: Vec<String>,
}

/// Arguments for shell completions.
#[derive(Parser, Debug)]
pub struct CompletionsArgs {
    /// Shell to generate completions for.
    #[arg(value_enum)]
    pub shell: Shell,
}

impl CompletionsArgs {
    /// Generate and print completions to stdout.
    pub fn generate(&self) {
        clap_complete::generate(
            self.shell,
            &mut Cli::command(),
            "prewarm",
            &mut std::io::stdout(),
        );
    }
}
