//! The operations offered by the `mfr` tool
//!
//! Each operation writes its report to `out` and returns what it did. Questions to the user go
//! through `confirm`, which the tool skips in non-interactive mode.

use std::io::Write;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tracing::instrument;

use crate::backup::{self, BackupSet, BackupTimestamp};
use crate::delete;
use crate::endpoint::{EndpointError, StorageEndpoint};
use crate::scheduler::{self, Settings};
use crate::transfer::StopSignal;

/// Options shared by the operations.
#[derive(Debug, Clone, Copy, Default)]
pub struct Options {
    /// Validate backup sets against this many primary segments
    pub primary_segments: Option<usize>,
    /// Do not ask before deleting or overwriting anything
    pub non_interactive: bool,
}

fn validated(mut set: BackupSet, options: &Options) -> BackupSet {
    if let Some(segments) = options.primary_segments {
        set.validate(segments);
    }
    set
}

async fn sets_in_dir(
    endpoint: &dyn StorageEndpoint,
    date_dir: &str,
    options: &Options,
) -> Result<Option<Vec<BackupSet>>, EndpointError> {
    let path = format!("{}/{}", endpoint.backup_dir(), date_dir);
    Ok(endpoint.list_dir(&path).await?.map(|lines| {
        backup::parse_listing(&lines)
            .into_iter()
            .map(|set| validated(set, options))
            .collect()
    }))
}

/// Date directories under the default backup directory, or `None` if it does not exist.
async fn date_dirs(endpoint: &dyn StorageEndpoint) -> Result<Option<Vec<String>>, EndpointError> {
    Ok(endpoint
        .list_dir(endpoint.backup_dir())
        .await?
        .map(|lines| backup::parse_backup_dirs(&lines)))
}

/// Finds the backup set named by `timestamp`. Keywords pick the newest or oldest set of the
/// newest or oldest date directory holding any.
#[instrument(skip(endpoint, options), fields(endpoint = %endpoint.name()))]
pub async fn find_backup_set(
    endpoint: &dyn StorageEndpoint,
    timestamp: &BackupTimestamp,
    options: &Options,
) -> Result<Option<BackupSet>, EndpointError> {
    let (Some(date_dir), Some(key)) = (timestamp.date_dir(), timestamp.key()) else {
        let Some(mut dirs) = date_dirs(endpoint).await? else {
            tracing::info!(
                "default backup directory '{}' not found",
                endpoint.backup_dir()
            );
            return Ok(None);
        };
        dirs.sort();
        if *timestamp == BackupTimestamp::Latest {
            dirs.reverse();
        }
        for dir in dirs {
            let mut sets = sets_in_dir(endpoint, &dir, options)
                .await?
                .unwrap_or_default();
            if sets.is_empty() {
                tracing::info!(
                    "no valid backup files in directory {}/{}",
                    endpoint.backup_dir(),
                    dir
                );
                continue;
            }
            return Ok(if *timestamp == BackupTimestamp::Latest {
                sets.pop()
            } else {
                Some(sets.swap_remove(0))
            });
        }
        return Ok(None);
    };
    let sets = sets_in_dir(endpoint, &date_dir, options)
        .await?
        .unwrap_or_default();
    Ok(sets.into_iter().find(|set| set.key() == key))
}

async fn identify(
    endpoint: &dyn StorageEndpoint,
    timestamp: &BackupTimestamp,
    options: &Options,
    out: &mut impl Write,
) -> Result<Option<BackupSet>> {
    if timestamp.is_keyword() {
        writeln!(
            out,
            "Identifying the {} backup set on {} Data Domain.",
            timestamp,
            endpoint.kind()
        )?;
    } else {
        writeln!(
            out,
            "Identifying backup files on {} Data Domain.",
            endpoint.kind()
        )?;
    }
    let set = find_backup_set(endpoint, timestamp, options).await?;
    if set.is_none() {
        if timestamp.is_keyword() {
            writeln!(
                out,
                "No valid backup set found on {} Data Domain.",
                endpoint.kind()
            )?;
        } else {
            writeln!(
                out,
                "Backup '{}' not found on {} Data Domain.",
                timestamp,
                endpoint.kind()
            )?;
        }
    }
    Ok(set)
}

/// Every backup set found under the default backup directory, grouped by date directory.
#[instrument(skip_all, fields(endpoint = %endpoint.name()))]
pub async fn list_backups(
    endpoint: &dyn StorageEndpoint,
    options: &Options,
    out: &mut impl Write,
) -> Result<Vec<BackupSet>> {
    writeln!(out, "Listing backups on {} Data Domain.", endpoint.kind())?;
    let Some(dirs) = date_dirs(endpoint).await? else {
        writeln!(
            out,
            "Default backup directory '{}' not found.",
            endpoint.backup_dir()
        )?;
        return Ok(Vec::new());
    };
    writeln!(out, "Default backup directory: {}", endpoint.backup_dir())?;
    let mut listed = Vec::new();
    for dir in dirs {
        let Some(sets) = sets_in_dir(endpoint, &dir, options).await? else {
            writeln!(
                out,
                "Path {}/{} not found on {} Data Domain.",
                endpoint.backup_dir(),
                dir,
                endpoint.kind()
            )?;
            break;
        };
        for set in sets {
            writeln!(out, "   {set}")?;
            listed.push(set);
        }
    }
    Ok(listed)
}

/// Prints the files of one backup set.
pub async fn list_files(
    endpoint: &dyn StorageEndpoint,
    timestamp: &BackupTimestamp,
    options: &Options,
    out: &mut impl Write,
) -> Result<Option<BackupSet>> {
    let set = identify(endpoint, timestamp, options, out).await?;
    if let Some(set) = &set {
        write!(out, "{}", set.files_table())?;
    }
    Ok(set)
}

async fn delete_set(
    endpoint: Arc<dyn StorageEndpoint>,
    set: &BackupSet,
    settings: &Settings,
) -> Result<delete::Summary, delete::Error> {
    let paths: Vec<String> = set
        .files()
        .iter()
        .map(|file| set.path_of(endpoint.backup_dir(), file))
        .collect();
    delete::delete_files(endpoint, &paths, settings.delete_batch_size)
        .await
        .into_result()
}

/// Deletes every file of a backup set, after asking unless non-interactive.
#[instrument(skip_all, fields(endpoint = %endpoint.name(), backup = %timestamp))]
pub async fn delete_backup(
    endpoint: Arc<dyn StorageEndpoint>,
    timestamp: &BackupTimestamp,
    options: &Options,
    settings: &Settings,
    confirm: &dyn Fn(&str) -> Result<bool>,
    out: &mut impl Write,
) -> Result<Option<delete::Summary>> {
    let Some(set) = identify(endpoint.as_ref(), timestamp, options, out).await? else {
        return Ok(None);
    };
    write!(out, "{}", set.files_table())?;
    out.flush()?;
    if !options.non_interactive {
        let prompt = format!(
            "Delete all the above files from {} Data Domain?",
            endpoint.kind()
        );
        if !confirm(&prompt)? {
            writeln!(out, "Nothing deleted.")?;
            return Ok(None);
        }
    }
    let summary = delete_set(endpoint.clone(), &set, settings)
        .await
        .with_context(|| format!("failed to delete backup '{}'", set.timestamp()))?;
    writeln!(
        out,
        "Backup '{}' deleted from {} Data Domain.",
        set.timestamp(),
        endpoint.kind()
    )?;
    Ok(Some(summary))
}

/// Transfers a backup set from `source` to `dest` with at most `max_streams` streams.
///
/// A set with the same files already on `dest` is left alone, one with different files is
/// deleted first.
#[allow(clippy::too_many_arguments)]
#[instrument(skip_all, fields(source = %source.name(), dest = %dest.name(), backup = %timestamp))]
pub async fn replicate_backup(
    source: Arc<dyn StorageEndpoint>,
    dest: Arc<dyn StorageEndpoint>,
    timestamp: &BackupTimestamp,
    max_streams: usize,
    options: &Options,
    settings: &Settings,
    stop: &StopSignal,
    confirm: &dyn Fn(&str) -> Result<bool>,
    out: &mut impl Write,
) -> Result<Option<scheduler::Summary>> {
    scheduler::validate_cap(max_streams, source.as_ref(), dest.as_ref()).await?;
    let Some(set) = identify(source.as_ref(), timestamp, options, out).await? else {
        return Ok(None);
    };
    if set.is_valid() == Some(false) {
        return Err(anyhow!(
            "Backup '{}' does not appear to be a valid backup set.",
            set.timestamp()
        ));
    }
    writeln!(
        out,
        "Initiating transfer for {} files from {} to {} Data Domain.",
        set.files().len(),
        source.kind(),
        dest.kind()
    )?;
    match find_backup_set(dest.as_ref(), &set.timestamp(), options).await? {
        Some(existing) if existing.same_contents(&set) => {
            writeln!(
                out,
                "Backup {} already present on {} Data Domain.",
                existing.timestamp(),
                dest.kind()
            )?;
            return Ok(None);
        }
        Some(existing) => {
            let message = format!(
                "Backup {} with different set of files found on {} Data Domain. It will be overwritten.",
                existing.timestamp(),
                dest.kind()
            );
            if options.non_interactive {
                writeln!(out, "{message}")?;
            } else {
                out.flush()?;
                if !confirm(&format!("{message} Continue?"))? {
                    return Ok(None);
                }
            }
            delete_set(dest.clone(), &existing, settings)
                .await
                .with_context(|| {
                    format!(
                        "failed to delete backup '{}' from {}",
                        existing.timestamp(),
                        dest.name()
                    )
                })?;
        }
        None => dest.verify_credentials().await?,
    }
    writeln!(
        out,
        "Using at the most {max_streams} I/O streams on each Data Domain."
    )?;
    out.flush()?;
    let summary = scheduler::replicate(
        &set,
        source.clone(),
        dest.clone(),
        max_streams,
        stop,
        settings,
    )
    .await?;
    writeln!(
        out,
        "Backup '{}' transferred from {} to {} Data Domain.",
        set.timestamp(),
        source.kind(),
        dest.kind()
    )?;
    Ok(Some(summary))
}

/// Stream limits and usage of both endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamsReport {
    pub local: String,
    pub remote: String,
    pub local_outbound: usize,
    pub local_inbound: usize,
    pub local_in_use: usize,
    pub remote_outbound: usize,
    pub remote_inbound: usize,
    pub remote_in_use: usize,
}

impl StreamsReport {
    /// Files that may be replicated concurrently right now.
    #[must_use]
    pub fn max_replicate(&self) -> usize {
        self.local_outbound
            .saturating_sub(self.local_in_use)
            .min(self.remote_inbound.saturating_sub(self.remote_in_use))
    }

    /// Files that may be recovered concurrently right now.
    #[must_use]
    pub fn max_recover(&self) -> usize {
        self.remote_outbound
            .saturating_sub(self.remote_in_use)
            .min(self.local_inbound.saturating_sub(self.local_in_use))
    }
}

impl std::fmt::Display for StreamsReport {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let title = format!("{:47}{} {}", "", self.local, self.remote);
        let width = self.local.len();
        writeln!(f, "{title}")?;
        writeln!(f, "{}", "-".repeat(title.len()))?;
        writeln!(
            f,
            "Maximum I/O streams available for replication \t{:<width$}  {}",
            self.local_outbound, self.remote_inbound
        )?;
        writeln!(
            f,
            "Maximum I/O streams available for recovery    \t{:<width$}  {}",
            self.local_inbound, self.remote_outbound
        )?;
        writeln!(
            f,
            "I/O streams currently in use for MFR          \t{:<width$}  {}",
            self.local_in_use, self.remote_in_use
        )?;
        writeln!(f)?;
        writeln!(
            f,
            "No more than {} backup files may be replicated concurrently from {} to {}.",
            self.max_replicate(),
            self.local,
            self.remote
        )?;
        write!(
            f,
            "No more than {} backup files may be recovered concurrently from {} to {}.",
            self.max_recover(),
            self.remote,
            self.local
        )
    }
}

#[instrument(skip_all)]
pub async fn show_streams(
    local: &dyn StorageEndpoint,
    remote: &dyn StorageEndpoint,
) -> Result<StreamsReport, EndpointError> {
    Ok(StreamsReport {
        local: local.name(),
        remote: remote.name(),
        local_outbound: local.outbound_ceiling().await?,
        local_inbound: local.inbound_ceiling().await?,
        local_in_use: local.in_use_streams().await?,
        remote_outbound: remote.outbound_ceiling().await?,
        remote_inbound: remote.inbound_ceiling().await?,
        remote_in_use: remote.in_use_streams().await?,
    })
}

/// Pings the hosts of all `endpoints` concurrently. Any packet loss makes an endpoint
/// unreachable.
#[instrument(skip_all)]
pub async fn check_reachable(endpoints: &[Arc<dyn StorageEndpoint>]) -> Result<()> {
    let pool = remote::WorkerPool::new(endpoints.len().max(1))?;
    let mut names = std::collections::BTreeMap::new();
    for endpoint in endpoints {
        let cmd = crate::ddboost::ping_command(endpoint.hostname());
        names.insert(cmd.name().to_string(), endpoint.name());
        pool.submit(cmd);
    }
    pool.join(None).await;
    let completed = pool.collect_completed();
    pool.halt_and_join().await;
    for cmd in completed {
        let output = cmd
            .results()
            .map(|result| format!("{}{}", result.stdout, result.stderr))
            .unwrap_or_default();
        let loss = crate::ddboost::packet_loss(&output);
        let name = names.get(cmd.name()).cloned().unwrap_or_default();
        tracing::debug!("{}: {}% packet loss", &name, loss);
        if loss > 0 {
            return Err(anyhow!("{} Data Domain not reachable.", name));
        }
    }
    Ok(())
}
