mod commands;
mod format;

use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use perftrace_core::{ConfigError, DataError, PlatformError, StorageError};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// Record process and system performance counters, then analyze them.
#[derive(Parser, Debug)]
#[command(name = "perftrace", version)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Record a session until Ctrl-C or the duration elapses
    Monitor(MonitorArgs),

    /// List running processes
    Processes {
        /// Only show processes whose name contains this text
        #[arg(short, long)]
        filter: Option<String>,
    },

    /// Show the targets and metrics of one or more session files
    Inspect {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Print a downsampled series
    Series {
        #[command(flatten)]
        query: QueryArgs,

        /// Point budget; the output has at most twice as many points
        #[arg(short, long, default_value_t = 1000)]
        points: usize,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Print summary statistics of a series
    Stats {
        #[command(flatten)]
        query: QueryArgs,

        /// Compute over a downsampled series with this point budget
        #[arg(short, long)]
        points: Option<usize>,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Print the default config or its JSON schema
    Config {
        #[command(subcommand)]
        action: ConfigCommand,
    },
}

#[derive(Args, Debug)]
struct MonitorArgs {
    /// Config file (default: perftrace.yaml if present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Process id to monitor (repeatable)
    #[arg(long)]
    pid: Vec<u32>,

    /// Process name to monitor, ignoring case (repeatable)
    #[arg(long)]
    name: Vec<String>,

    /// Seconds between samples
    #[arg(short, long)]
    interval: Option<u64>,

    /// Directory receiving the session file
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Stop after this many seconds
    #[arg(short, long)]
    duration: Option<u64>,
}

#[derive(Args, Debug)]
struct QueryArgs {
    /// Session file
    file: PathBuf,

    /// Target id as shown by `inspect` (0 is the system)
    #[arg(short, long)]
    target: u32,

    /// Metric name, e.g. cpu_percent
    #[arg(short, long)]
    metric: String,

    /// First timestamp (unix seconds, inclusive)
    #[arg(long)]
    from: Option<i64>,

    /// Last timestamp (unix seconds, inclusive)
    #[arg(long)]
    to: Option<i64>,
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// Print the default config as YAML
    Default,
    /// Print the JSON schema of the config file
    Schema,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = match cli.command {
        Command::Monitor(args) => commands::monitor(args).await,
        Command::Processes { filter } => commands::processes(filter.as_deref()),
        Command::Inspect { files } => commands::inspect(files).await,
        Command::Series {
            query,
            points,
            json,
        } => commands::series(&query, points, json),
        Command::Stats {
            query,
            points,
            json,
        } => commands::stats(&query, points, json),
        Command::Config { action } => commands::config(action),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {:#}", "error:".red().bold(), e);
            ExitCode::from(exit_code(&e))
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Maps the first recognised error in the chain to its exit code.
fn exit_code(err: &anyhow::Error) -> u8 {
    for cause in err.chain() {
        if let Some(e) = cause.downcast_ref::<perftrace_core::Error>() {
            return e.exit_code() as u8;
        }
        if cause.is::<ConfigError>() {
            return 1;
        }
        if cause.is::<PlatformError>() {
            return 2;
        }
        if cause.is::<StorageError>() {
            return 4;
        }
        if cause.is::<DataError>() {
            return 5;
        }
    }
    1
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use perftrace_core::TargetError;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_monitor_args() {
        let cli = Cli::parse_from([
            "perftrace", "monitor", "--pid", "1234", "--name", "postgres", "--pid", "99", "-i",
            "5",
        ]);
        match cli.command {
            Command::Monitor(args) => {
                assert_eq!(args.pid, vec![1234, 99]);
                assert_eq!(args.name, vec!["postgres".to_string()]);
                assert_eq!(args.interval, Some(5));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_exit_codes() {
        let target = anyhow::Error::new(perftrace_core::Error::from(TargetError::PidNotFound(4)));
        assert_eq!(exit_code(&target), 3);

        let data = anyhow::Error::new(DataError::UnknownTarget(perftrace_core::TargetId(1)))
            .context("reading series");
        assert_eq!(exit_code(&data), 5);

        let platform = anyhow::Error::new(PlatformError::Unsupported("plan9".into()));
        assert_eq!(exit_code(&platform), 2);

        assert_eq!(exit_code(&anyhow::anyhow!("something else")), 1);
    }
}
