//! Replication of one backup set under a stream budget
//!
//! The scheduler runs a single control loop. Every tick it:
//!
//! 1. aborts the run if any transfer ended `Incomplete`,
//! 2. starts transfers for the next files of the set, as many as the user cap, the live capacity
//!    of both endpoints and the remaining files allow,
//! 3. reports progress and sleeps for the poll interval.
//!
//! The live capacity is re-queried before starting new transfers and is only advisory: other
//! applications using the endpoints can take streams between the query and the start of a helper.
//! The user cap is enforced locally with [`throttle::StreamLimit`] and is never exceeded.
//!
//! On cancel or abort all running transfers are stopped, joined, and every file that may have
//! been written to the destination is deleted from it.

use std::sync::Arc;

use tracing::instrument;

use crate::backup::BackupSet;
use crate::delete;
use crate::endpoint::{EndpointError, StorageEndpoint};
use crate::transfer::{self, StopReason, StopSignal, TransferJob, TransferState, TransferStatus};

#[derive(Debug, Clone)]
pub struct Settings {
    /// Path of the helper program doing the transfers
    pub helper: std::path::PathBuf,
    /// Sleep between two ticks of the control loop
    pub poll_interval: std::time::Duration,
    /// How long a stopped helper gets to exit before it is killed
    pub watchdog: std::time::Duration,
    pub delete_batch_size: usize,
    pub progress: common::ProgressMode,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            helper: crate::ddboost::default_helper(),
            poll_interval: std::time::Duration::from_millis(500),
            watchdog: std::time::Duration::from_secs(20),
            delete_batch_size: delete::DEFAULT_BATCH_SIZE,
            progress: common::ProgressMode::default(),
        }
    }
}

impl Settings {
    fn transfer(&self) -> transfer::Settings {
        transfer::Settings {
            helper: self.helper.clone(),
            watchdog: self.watchdog,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReplicateError {
    #[error("{0}")]
    Validation(String),
    #[error("replication of backup set {backup} canceled")]
    Canceled { backup: String },
    #[error("replication of backup set {backup} aborted: {reason}")]
    Aborted { backup: String, reason: String },
    #[error(transparent)]
    Endpoint(#[from] EndpointError),
    #[error("internal consistency error: {0}")]
    InternalConsistency(String),
}

#[derive(Debug, Default)]
pub struct Summary {
    pub files: usize,
    pub bytes: u64,
    /// Most streams held at the same time
    pub peak_streams: usize,
    pub elapsed: std::time::Duration,
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "files replicated: {}\n\
            bytes replicated: {}\n\
            peak streams: {}\n\
            elapsed: {}",
            self.files,
            bytesize::ByteSize(self.bytes),
            self.peak_streams,
            humantime::format_duration(std::time::Duration::from_millis(
                self.elapsed.as_millis() as u64
            ))
        )
    }
}

/// Checks the user cap against the ceilings of both endpoints and that the pair can be
/// transferred between at all.
pub async fn validate_cap(
    user_cap: usize,
    source: &dyn StorageEndpoint,
    dest: &dyn StorageEndpoint,
) -> Result<(), ReplicateError> {
    if user_cap == 0 {
        return Err(ReplicateError::Validation(
            "maximum number of streams must be greater than 0".to_string(),
        ));
    }
    transfer::helper_args(source, dest, "")
        .map_err(|error| ReplicateError::Validation(error.to_string()))?;
    let outbound = source.outbound_ceiling().await?;
    if user_cap > outbound {
        return Err(ReplicateError::Validation(format!(
            "{} streams requested, {} can send at most {}",
            user_cap,
            source.name(),
            outbound
        )));
    }
    let inbound = dest.inbound_ceiling().await?;
    if user_cap > inbound {
        return Err(ReplicateError::Validation(format!(
            "{} streams requested, {} can receive at most {}",
            user_cap,
            dest.name(),
            inbound
        )));
    }
    Ok(())
}

struct Slot {
    path: String,
    /// Where the file lands on the destination
    dest_path: String,
    status_rx: tokio::sync::watch::Receiver<TransferStatus>,
}

impl Slot {
    fn status(&self) -> TransferStatus {
        *self.status_rx.borrow()
    }
}

enum Outcome {
    Finished,
    Stopped,
}

struct Scheduler<'a> {
    set: &'a BackupSet,
    source: Arc<dyn StorageEndpoint>,
    dest: Arc<dyn StorageEndpoint>,
    stop: &'a StopSignal,
    settings: &'a Settings,
    limit: throttle::StreamLimit,
    progress: common::ByteProgress,
    slots: Vec<Slot>,
    handles: Vec<tokio::task::JoinHandle<()>>,
}

fn progress_detail(
    set: &BackupSet,
    limit: &throttle::StreamLimit,
    statuses: &[TransferStatus],
) -> String {
    let complete = statuses
        .iter()
        .filter(|status| status.state == TransferState::Complete)
        .count();
    format!(
        "{} of {} files done, {} streams in use",
        complete,
        set.files().len(),
        limit.held()
    )
}

impl Scheduler<'_> {
    fn statuses(&self) -> Vec<TransferStatus> {
        self.slots.iter().map(Slot::status).collect()
    }

    async fn live_capacity(&self) -> Result<usize, EndpointError> {
        let sending = self
            .source
            .outbound_ceiling()
            .await?
            .saturating_sub(self.source.in_use_streams().await?);
        let receiving = self
            .dest
            .inbound_ceiling()
            .await?
            .saturating_sub(self.dest.in_use_streams().await?);
        tracing::debug!(
            "live capacity: {} can send {}, {} can receive {}",
            self.source.name(),
            sending,
            self.dest.name(),
            receiving
        );
        Ok(sending.min(receiving))
    }

    fn start_next(&mut self) -> Result<bool, ReplicateError> {
        let Some(file) = self.set.files().get(self.slots.len()).cloned() else {
            return Ok(false);
        };
        let Some(permit) = self.limit.try_acquire() else {
            return Ok(false);
        };
        let path = self.set.path_of(self.source.backup_dir(), &file);
        let dest_path = self.set.path_of(self.dest.backup_dir(), &file);
        let job = TransferJob::new(file, path.clone(), self.source.as_ref(), self.dest.as_ref())
            .map_err(|error| ReplicateError::Aborted {
                backup: self.set.key(),
                reason: error.to_string(),
            })?;
        tracing::debug!("starting transfer of {}", &path);
        let (status_tx, status_rx) = tokio::sync::watch::channel(TransferStatus::default());
        let handle = tokio::spawn(transfer::run_transfer(
            job,
            self.settings.transfer(),
            self.stop.clone(),
            status_tx,
            Some(permit),
        ));
        self.slots.push(Slot {
            path,
            dest_path,
            status_rx,
        });
        self.handles.push(handle);
        Ok(true)
    }

    async fn drive(&mut self) -> Result<Outcome, ReplicateError> {
        let total = self.set.files().len();
        let goal = self.set.total_bytes();
        loop {
            if self.stop.is_stopped() {
                return Ok(Outcome::Stopped);
            }
            if self
                .statuses()
                .iter()
                .any(|status| status.state == TransferState::Incomplete)
            {
                return Err(ReplicateError::Aborted {
                    backup: self.set.key(),
                    reason: "one or more file transfers failed".to_string(),
                });
            }
            let needed = total - self.slots.len();
            let room = self.limit.available();
            if room > 0 && needed > 0 {
                let live = self.live_capacity().await?;
                for _ in 0..room.min(live).min(needed) {
                    if !self.start_next()? {
                        break;
                    }
                }
            }
            let statuses = self.statuses();
            let done: u64 = statuses.iter().map(|status| status.bytes).sum();
            self.progress
                .update(done, || progress_detail(self.set, &self.limit, &statuses));
            let all_terminal = statuses.iter().all(|status| status.state.is_terminal());
            if self.slots.len() == total && all_terminal {
                if done != goal {
                    return Err(ReplicateError::InternalConsistency(format!(
                        "all transfers finished with {done} of {goal} bytes transferred"
                    )));
                }
                if let Some(slot) = self
                    .slots
                    .iter()
                    .find(|slot| slot.status().state != TransferState::Complete)
                {
                    return Err(ReplicateError::InternalConsistency(format!(
                        "transfer of {} finished as {:?} without a stop request",
                        &slot.path,
                        slot.status().state
                    )));
                }
                return Ok(Outcome::Finished);
            }
            tokio::select! {
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
                _ = self.stop.stopped() => {}
            }
        }
    }

    async fn join_all(&mut self) {
        let handles = std::mem::take(&mut self.handles);
        for result in futures::future::join_all(handles).await {
            if let Err(error) = result {
                tracing::error!("transfer task failed: {}", error);
            }
        }
    }

    /// Deletes from the destination every file whose transfer may have written it.
    async fn clean_up(&self) {
        let paths: Vec<String> = self
            .slots
            .iter()
            .filter(|slot| slot.status().state.needs_cleanup())
            .map(|slot| slot.dest_path.clone())
            .collect();
        if paths.is_empty() {
            return;
        }
        tracing::info!(
            "deleting {} transferred files from {}",
            paths.len(),
            self.dest.name()
        );
        let summary =
            delete::delete_files(self.dest.clone(), &paths, self.settings.delete_batch_size)
                .await;
        if !summary.failures.is_empty() {
            tracing::error!(
                "failed to clean up {} files on {}",
                summary.failures.len(),
                self.dest.name()
            );
        }
    }
}

/// Transfers every file of `set` from `source` to `dest`, using at most `user_cap` streams.
///
/// `stop` is shared with the caller, which cancels it to interrupt the run. Any failure aborts
/// the remaining transfers through the same signal.
#[instrument(
    skip_all,
    fields(backup = %set.key(), source = %source.name(), dest = %dest.name(), cap = user_cap)
)]
pub async fn replicate(
    set: &BackupSet,
    source: Arc<dyn StorageEndpoint>,
    dest: Arc<dyn StorageEndpoint>,
    user_cap: usize,
    stop: &StopSignal,
    settings: &Settings,
) -> Result<Summary, ReplicateError> {
    validate_cap(user_cap, source.as_ref(), dest.as_ref()).await?;
    tracing::info!(
        "replicating {} files ({}) with at most {} streams",
        set.files().len(),
        bytesize::ByteSize(set.total_bytes()),
        user_cap
    );
    let mut scheduler = Scheduler {
        set,
        source,
        dest,
        stop,
        settings,
        limit: throttle::StreamLimit::new(user_cap),
        progress: common::ByteProgress::new(
            format!("backup set {}", set.key()),
            set.total_bytes(),
            settings.progress,
        ),
        slots: Vec::new(),
        handles: Vec::new(),
    };
    let outcome = scheduler.drive().await;
    if outcome.is_err() {
        stop.abort();
    }
    scheduler.join_all().await;
    scheduler.progress.finish();
    match outcome {
        Ok(Outcome::Finished) => {
            let summary = Summary {
                files: scheduler.slots.len(),
                bytes: set.total_bytes(),
                peak_streams: scheduler.limit.peak(),
                elapsed: scheduler.progress.elapsed(),
            };
            tracing::info!("backup set {} replicated", set.key());
            Ok(summary)
        }
        Ok(Outcome::Stopped) => {
            scheduler.clean_up().await;
            match stop.reason() {
                Some(StopReason::Abort) => Err(ReplicateError::Aborted {
                    backup: set.key(),
                    reason: "abort requested".to_string(),
                }),
                _ => Err(ReplicateError::Canceled { backup: set.key() }),
            }
        }
        Err(error) => {
            tracing::error!("{}", &error);
            scheduler.clean_up().await;
            Err(error)
        }
    }
}
