use std::sync::Arc;

use anyhow::Result;
use clap::{CommandFactory, Parser};
use tracing::instrument;

use mfr_tools_mfr::backup::BackupTimestamp;
use mfr_tools_mfr::ddboost::{DdBoost, HelperConfig};
use mfr_tools_mfr::endpoint::{EndpointKind, StorageEndpoint};
use mfr_tools_mfr::{delete, ops, scheduler};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "mfr",
    version,
    about = "Managed file replication of backup sets between Data Domain systems",
    long_about = "`mfr` lists, deletes and replicates backup sets stored on the local and remote Data Domain systems.

Valid formats for TIMESTAMP are 'YYYY-Month-DD HH:MM:SS' and YYYYMMDDHHMMSS. The keywords LATEST and
OLDEST may also be used.

EXAMPLE:
    # Replicate the latest backup set using at most 8 streams on each Data Domain
    mfr --replicate LATEST --max-streams 8 --summary

    # List the backup sets on the remote Data Domain
    mfr --list --remote"
)]
struct Args {
    // Operations
    /// List backup sets available on a Data Domain
    #[arg(long, help_heading = "Operations")]
    list: bool,

    /// List files in a backup set on a Data Domain
    #[arg(long, value_name = "TIMESTAMP", help_heading = "Operations")]
    list_files: Option<String>,

    /// Replicate a backup set from the local to the remote Data Domain
    #[arg(long, value_name = "TIMESTAMP", help_heading = "Operations")]
    replicate: Option<String>,

    /// Recover a backup set from the remote to the local Data Domain
    #[arg(long, value_name = "TIMESTAMP", help_heading = "Operations")]
    recover: Option<String>,

    /// Delete a backup set on a Data Domain
    #[arg(long, value_name = "TIMESTAMP", help_heading = "Operations")]
    delete: Option<String>,

    /// Show I/O streams used for replication on the local and remote Data Domains
    #[arg(long, help_heading = "Operations")]
    show_streams: bool,

    // Operation options
    /// Maximum number of I/O streams to use on each Data Domain for replication/recovery
    #[arg(long, value_name = "N", help_heading = "Operation options")]
    max_streams: Option<i64>,

    /// Perform the operation on the remote Data Domain
    ///
    /// Applicable to --list, --list-files and --delete only.
    #[arg(long, help_heading = "Operation options")]
    remote: bool,

    /// Do not ping the Data Domains before performing an operation
    #[arg(long, help_heading = "Operation options")]
    skip_ping: bool,

    /// Storage unit name on the Data Domain, overrides the configured one
    #[arg(long, value_name = "NAME", help_heading = "Operation options")]
    ddboost_storage_unit: Option<String>,

    /// Validate backup sets against a cluster with this many primary segments
    ///
    /// Invalid sets are marked with '!' and are never replicated.
    #[arg(long, value_name = "N", help_heading = "Operation options")]
    num_primary_segments: Option<usize>,

    /// Do not ask for confirmation before deleting or overwriting backup sets
    #[arg(short = 'a', long, help_heading = "Operation options")]
    non_interactive: bool,

    // Helper settings
    /// Path of the DD Boost helper program (default: $GPHOME/bin/gpddboost)
    #[arg(long, value_name = "PATH", help_heading = "Helper settings")]
    ddboost_path: Option<std::path::PathBuf>,

    /// Delay between checks of running transfers
    ///
    /// This option accepts a human readable duration, e.g. "500ms", "2s".
    #[arg(
        long,
        default_value = "500ms",
        value_name = "DELAY",
        value_parser = humantime::parse_duration,
        help_heading = "Helper settings"
    )]
    poll_interval: std::time::Duration,

    /// How long an interrupted transfer gets to finish before its helper is killed
    #[arg(
        long,
        default_value = "20s",
        value_name = "DELAY",
        value_parser = humantime::parse_duration,
        help_heading = "Helper settings"
    )]
    watchdog: std::time::Duration,

    // Progress & output
    /// Type of progress to show, defaults to a bar unless quiet
    #[arg(long, value_name = "TYPE", help_heading = "Progress & output")]
    progress_type: Option<common::ProgressMode>,

    /// Verbose level (implies "summary"): -v INFO / -vv DEBUG / -vvv TRACE (default: ERROR)
    #[arg(
        short = 'v',
        long = "verbose",
        action = clap::ArgAction::Count,
        help_heading = "Progress & output"
    )]
    verbose: u8,

    /// Print summary at the end
    #[arg(long, help_heading = "Progress & output")]
    summary: bool,

    /// Quiet mode, don't report errors
    #[arg(short = 'q', long = "quiet", help_heading = "Progress & output")]
    quiet: bool,

    // Advanced settings
    /// Number of worker threads, 0 means number of cores
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_workers: usize,
}

#[derive(Debug, Clone)]
enum Operation {
    List,
    ListFiles(BackupTimestamp),
    Replicate(BackupTimestamp, usize),
    Recover(BackupTimestamp, usize),
    Delete(BackupTimestamp),
    ShowStreams,
}

const ONE_OPERATION: &str = "Exactly one of --list, --list-files, --replicate, --recover, \
    --delete, --show-streams should be specified.";

fn parse_timestamp(value: &str) -> Result<BackupTimestamp, String> {
    value.parse().map_err(|_| {
        format!(
            "Invalid timestamp '{value}'\nTimestamp should be one of:\n\tYYYY-Month-DD HH:MM:SS\n\tYYYYMMDDHHMMSS\n\tLATEST/OLDEST"
        )
    })
}

impl Args {
    /// Checks the combination of options, before any endpoint is contacted.
    fn operation(&self) -> Result<Operation, String> {
        let chosen = [
            self.list,
            self.list_files.is_some(),
            self.replicate.is_some(),
            self.recover.is_some(),
            self.delete.is_some(),
            self.show_streams,
        ]
        .iter()
        .filter(|chosen| **chosen)
        .count();
        if chosen != 1 {
            return Err(ONE_OPERATION.to_string());
        }
        let transferring = self.replicate.is_some() || self.recover.is_some();
        let max_streams = match (transferring, self.max_streams) {
            (true, None) => {
                return Err("--max-streams must be specified for replication/recovery.".to_string());
            }
            (true, Some(n)) if n <= 0 => {
                return Err("--max-streams must be a number greater than zero.".to_string());
            }
            (false, Some(_)) => {
                return Err("--max-streams must be used with --replicate/--recover.".to_string());
            }
            (_, n) => n.unwrap_or_default() as usize,
        };
        if self.remote && transferring {
            return Err("--remote cannot be used with --replicate/--recover.".to_string());
        }
        if self.remote && self.show_streams {
            return Err("--remote cannot be used with --show-streams.".to_string());
        }
        if self.show_streams && self.num_primary_segments.is_some() {
            return Err("--num-primary-segments cannot be used with --show-streams.".to_string());
        }
        let operation = if self.list {
            Operation::List
        } else if let Some(ts) = &self.list_files {
            Operation::ListFiles(parse_timestamp(ts)?)
        } else if let Some(ts) = &self.replicate {
            Operation::Replicate(parse_timestamp(ts)?, max_streams)
        } else if let Some(ts) = &self.recover {
            Operation::Recover(parse_timestamp(ts)?, max_streams)
        } else if let Some(ts) = &self.delete {
            Operation::Delete(parse_timestamp(ts)?)
        } else {
            Operation::ShowStreams
        };
        Ok(operation)
    }
}

/// What the run did, printed with --summary.
#[derive(Debug)]
enum Summary {
    Nothing,
    Replicated(scheduler::Summary),
    Deleted(delete::Summary),
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Summary::Nothing => write!(f, "no files transferred or deleted"),
            Summary::Replicated(summary) => write!(f, "{summary}"),
            Summary::Deleted(summary) => write!(f, "{summary}"),
        }
    }
}

async fn connect(
    kind: EndpointKind,
    config: &HelperConfig,
    args: &Args,
) -> Result<Arc<dyn StorageEndpoint>> {
    let endpoint = DdBoost::connect(kind, config, args.ddboost_storage_unit.clone()).await?;
    Ok(Arc::new(endpoint))
}

#[instrument(skip(args))]
async fn async_main(args: Args, operation: Operation) -> Result<Summary> {
    let config = HelperConfig::from_env(args.ddboost_path.clone())?;
    let options = ops::Options {
        primary_segments: args.num_primary_segments,
        non_interactive: args.non_interactive,
    };
    let output = common::OutputConfig {
        quiet: args.quiet,
        verbose: args.verbose,
        print_summary: args.summary,
    };
    let settings = scheduler::Settings {
        helper: config.helper.clone(),
        poll_interval: args.poll_interval,
        watchdog: args.watchdog,
        progress: args.progress_type.unwrap_or(output.progress_mode()),
        ..Default::default()
    };
    let kind = if args.remote {
        EndpointKind::Remote
    } else {
        EndpointKind::Local
    };
    let mut out = std::io::stdout();
    match operation {
        Operation::List | Operation::ListFiles(_) | Operation::Delete(_) => {
            let endpoint = connect(kind, &config, &args).await?;
            if !args.skip_ping {
                ops::check_reachable(std::slice::from_ref(&endpoint)).await?;
            }
            match operation {
                Operation::List => {
                    ops::list_backups(endpoint.as_ref(), &options, &mut out).await?;
                    Ok(Summary::Nothing)
                }
                Operation::ListFiles(ts) => {
                    ops::list_files(endpoint.as_ref(), &ts, &options, &mut out).await?;
                    Ok(Summary::Nothing)
                }
                Operation::Delete(ts) => {
                    let deleted = ops::delete_backup(
                        endpoint,
                        &ts,
                        &options,
                        &settings,
                        &common::confirm,
                        &mut out,
                    )
                    .await?;
                    Ok(deleted.map_or(Summary::Nothing, Summary::Deleted))
                }
                _ => Ok(Summary::Nothing),
            }
        }
        Operation::ShowStreams => {
            let local = connect(EndpointKind::Local, &config, &args).await?;
            let remote = connect(EndpointKind::Remote, &config, &args).await?;
            if !args.skip_ping {
                ops::check_reachable(&[local.clone(), remote.clone()]).await?;
            }
            let report = ops::show_streams(local.as_ref(), remote.as_ref()).await?;
            println!("{report}");
            Ok(Summary::Nothing)
        }
        Operation::Replicate(ts, max_streams) | Operation::Recover(ts, max_streams) => {
            let local = connect(EndpointKind::Local, &config, &args).await?;
            let remote = connect(EndpointKind::Remote, &config, &args).await?;
            if !args.skip_ping {
                ops::check_reachable(&[local.clone(), remote.clone()]).await?;
            }
            let replicating = matches!(operation, Operation::Replicate(..));
            let (source, dest) = if replicating {
                (local, remote)
            } else {
                (remote, local)
            };
            let stop = mfr_tools_mfr::StopSignal::new();
            {
                let stop = stop.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        eprintln!("\nCanceling file transfers.");
                        stop.cancel();
                    }
                });
            }
            let summary = ops::replicate_backup(
                source,
                dest,
                &ts,
                max_streams,
                &options,
                &settings,
                &stop,
                &common::confirm,
                &mut out,
            )
            .await?;
            Ok(summary.map_or(Summary::Nothing, Summary::Replicated))
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    let operation = match args.operation() {
        Ok(operation) => operation,
        Err(message) => Args::command()
            .error(clap::error::ErrorKind::ArgumentConflict, message)
            .exit(),
    };
    let func = {
        let args = args.clone();
        || async_main(args, operation)
    };
    let output = common::OutputConfig {
        quiet: args.quiet,
        verbose: args.verbose,
        print_summary: args.summary,
    };
    let runtime = common::RuntimeConfig {
        max_workers: args.max_workers,
    };
    let res = common::run(output, runtime, func);
    if res.is_none() {
        std::process::exit(1);
    }
    Ok(())
}
