//! prewarm - warm process pool

mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use owo_colors::{OwoColorize, Stream::Stderr};
use tracing::Level;

use cli::{Cli, Commands};
use prewarm::engine::{Engine, PythonEngine};
use prewarm::logging::{self, LogConfig};
use prewarm::paths;
use prewarm::pool::{COMM_ERROR_EXIT, Job, SignalLatch, SlotConfig, client};
use prewarm::server::{ServerConfig, run_server};

fn main() {
    let cli = Cli::parse();

    if cli.no_color {
        owo_colors::set_override(false);
    }

    let (result, failure_status) = match &cli.command {
        Commands::Serve(args) => (cmd_serve(&cli, args), 1),
        Commands::Ping => (cmd_ping(), 1),
        Commands::Run(args) => (cmd_run(&cli, args), COMM_ERROR_EXIT),
        Commands::Completions(args) => {
            args.generate();
            (Ok(0), 1)
        }
    };

    match result {
        Ok(status) => std::process::exit(status),
        Err(e) => {
            eprintln!(
                "{}: {}",
                "error"
                    .if_supports_color(Stderr, |text| text.red())
                    .if_supports_color(Stderr, |text| text.bold()),
                e
            );
            for cause in e.chain().skip(1) {
                eprintln!(
                    "  {}: {}",
                    "caused by".if_supports_color(Stderr, |text| text.yellow()),
                    cause
                );
            }
            std::process::exit(failure_status);
        }
    }
}

fn init_logging(cli: &Cli, preset: LogConfig) {
    let config = if cli.quiet {
        preset.with_level(Level::ERROR)
    } else {
        preset.with_verbosity(cli.verbose)
    };
    logging::init(config.with_env_overrides());
}

/// Start a pool and a shell registered with it. Returns the shell's status.
fn cmd_serve(cli: &Cli, args: &cli::ServeArgs) -> Result<i32> {
    init_logging(cli, LogConfig::for_pool());

    if !args.preloader.exists() {
        anyhow::bail!("Preloader not found: {}", args.preloader.display());
    }
    let slot = SlotConfig::new(&args.preloader).with_grace(args.grace());
    let config = ServerConfig::new(slot, args.workers as usize);
    let engine = PythonEngine::new(&cli.interpreter);

    let status = run_server(config, engine).context("Pool server failed")?;
    Ok(status)
}

/// Succeeds when a pool is registered and its socket exists.
fn cmd_ping() -> Result<i32> {
    let server =
        paths::registered_server().ok_or(prewarm::error::PrewarmError::NoServer(paths::SERVER_ENV))?;
    if !paths::is_socket(&server) {
        anyhow::bail!("Pool socket is gone: {}", server.display());
    }
    Ok(0)
}

/// Run a program on a warm worker, or directly when no pool is registered.
fn cmd_run(cli: &Cli, args: &cli::RunArgs) -> Result<i32> {
    init_logging(cli, LogConfig::for_client());

    let Some(server) = paths::registered_server() else {
        tracing::debug!("No pool registered; running directly");
        let engine = PythonEngine::new(&cli.interpreter);
        match engine.exec_direct(&args.args)? {}
    };

    // Interrupts belong to the job's process group; the client only notes them.
    let latch = SignalLatch::install()?;
    let job = Job::capture(args.args.clone()).context("Failed to capture invocation")?;
    let termination = client::execute(&server, &job)
        .with_context(|| format!("Lost contact with pool at {}", server.display()))?;
    tracing::debug!(outcome = %termination.description(), "Job finished");
    client::exit_like(termination, latch)
}
