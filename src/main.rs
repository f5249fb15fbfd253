mod bridge;
mod config;
mod process;
mod shutdown;
mod signals;
mod status;
mod supervisor;

use clap::Parser;
use config::{CliOverrides, ConfigError, SupervisorConfig, WardenConfig, DEFAULT_CONFIG_FILE};
use shutdown::ExitDecision;
use std::path::PathBuf;
use std::process::ExitCode;
use supervisor::{Supervisor, SupervisorError};
use tracing_subscriber::EnvFilter;

/// Exit code when the supervisor cannot start at all.
const EXIT_STARTUP_FAILURE: u8 = 1;

/// A Rust CLI tool that supervises a long-running child process and drives
/// a time-bounded graceful shutdown when the console is interrupted or closed.
#[derive(Parser, Debug)]
#[command(name = "warden", version, about)]
pub struct Cli {
    /// Child command and its arguments (a single quoted string is split on whitespace)
    #[arg(value_name = "COMMAND", trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,

    /// Config file path (default: warden.toml, if present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Helper program whose output is relayed into the child on shutdown
    #[arg(short = 's', long, visible_alias = "scommand")]
    shutdown_command: Option<PathBuf>,

    /// Line written to the child's stdin on shutdown
    #[arg(short = 't', long, visible_alias = "stext")]
    shutdown_text: Option<String>,

    /// Working directory for the child and the helper
    #[arg(short = 'd', long, visible_alias = "directory")]
    working_dir: Option<PathBuf>,

    /// Seconds the child may take to exit after the shutdown step (overrides config)
    #[arg(long, value_name = "SECS")]
    shutdown_timeout: Option<u64>,

    /// Hard ceiling in seconds on the whole shutdown sequence (overrides config)
    #[arg(long, value_name = "SECS")]
    absolute_timeout: Option<u64>,

    /// Start a shutdown when this file appears (it is removed first)
    #[arg(long)]
    stop_file: Option<PathBuf>,

    /// Write a JSON status snapshot here on every state change
    #[arg(long)]
    status_file: Option<PathBuf>,

    /// Validate config and print resolved settings, don't run
    #[arg(long)]
    dry_run: bool,

    /// Extra logging (escalation steps, relayed lines)
    #[arg(short, long)]
    verbose: bool,

    /// Only warnings and errors on stderr
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,
}

impl Cli {
    fn overrides(&self) -> CliOverrides {
        CliOverrides {
            command: self.command.clone(),
            working_dir: self.working_dir.clone(),
            shutdown_command: self.shutdown_command.clone(),
            shutdown_text: self.shutdown_text.clone(),
            shutdown_timeout_secs: self.shutdown_timeout,
            absolute_timeout_secs: self.absolute_timeout,
            stop_file: self.stop_file.clone(),
            status_file: self.status_file.clone(),
        }
    }

    fn log_level(&self) -> &'static str {
        if self.verbose {
            "debug"
        } else if self.quiet {
            "warn"
        } else {
            "info"
        }
    }
}

/// Errors that end the process before the child's exit code applies.
#[derive(Debug)]
enum CliError {
    Config(ConfigError),
    CurrentDir(std::io::Error),
    Supervisor(SupervisorError),
}

impl std::fmt::Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CliError::Config(e) => write!(f, "{e}"),
            CliError::CurrentDir(e) => write!(f, "cannot determine current directory: {e}"),
            CliError::Supervisor(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for CliError {}

fn load_config(cli: &Cli) -> Result<SupervisorConfig, CliError> {
    let (path, explicit) = match &cli.config {
        Some(path) => (path.clone(), true),
        None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
    };
    let file_config = WardenConfig::load_or_default(&path, explicit).map_err(CliError::Config)?;
    let cwd = std::env::current_dir().map_err(CliError::CurrentDir)?;
    file_config
        .resolve(cli.overrides(), &cwd)
        .map_err(CliError::Config)
}

fn print_resolved(config: &SupervisorConfig) {
    println!("warden v{}", env!("CARGO_PKG_VERSION"));
    println!("Child command:     {}", config.child);
    println!("Working directory: {}", config.working_dir.display());
    match &config.shutdown.strategy {
        config::ShutdownStrategy::None => println!("Shutdown strategy: none (close streams)"),
        config::ShutdownStrategy::Helper(helper) => println!("Shutdown strategy: helper `{helper}`"),
        config::ShutdownStrategy::Text(text) => println!("Shutdown strategy: text {text:?}"),
    }
    println!("Shutdown timeout:  {}s", config.shutdown.shutdown_timeout.as_secs());
    println!("Absolute timeout:  {}s", config.shutdown.absolute_timeout.as_secs());
    if let Some(stop) = &config.stop_file {
        println!(
            "Stop file:         {} (every {}ms)",
            stop.path.display(),
            stop.poll_interval.as_millis()
        );
    }
    if let Some(status) = &config.status_file {
        println!("Status file:       {}", status.display());
    }
    println!("Dry run: config validated, not running.");
}

async fn run(cli: Cli) -> Result<ExitDecision, CliError> {
    let config = load_config(&cli)?;
    if cli.dry_run {
        print_resolved(&config);
        return Ok(ExitDecision {
            code: 0,
            hard_exit: false,
        });
    }

    let outcome = Supervisor::new(config)
        .run()
        .await
        .map_err(CliError::Supervisor)?;
    Ok(outcome.exit_decision())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.log_level()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .init();

    tracing::debug!(?cli, "parsed CLI arguments");

    match run(cli).await {
        Ok(decision) if decision.hard_exit => std::process::exit(decision.code),
        Ok(decision) => ExitCode::from(u8::try_from(decision.code).unwrap_or(EXIT_STARTUP_FAILURE)),
        Err(e) => {
            tracing::error!(error = %e, "warden failed");
            ExitCode::from(EXIT_STARTUP_FAILURE)
        }
    }
}
