//! Transfer of one backup file between the two endpoints
//!
//! The transfer itself is done by the helper program. It prints one line per progress update, a
//! line acknowledging cancellation when it handled an interrupt (it removes the partially written
//! target file itself in that case), and an error line with a vendor code when it fails. Each
//! line is classified into a [`TransferEvent`] and fed to a [`Tracker`], which owns the state
//! machine:
//!
//! ```text
//! Init -> Started -> InProgress -> Complete
//!   |        |           |      -> Incomplete
//!   +--------+-----------+------> Canceled
//! ```
//!
//! Terminal states never change and the number of bytes transferred never decreases.
//!
//! Once a stop is requested the helper is sent SIGINT. Helpers run in their own process group so
//! the terminal's interrupt does not reach them directly. A watchdog kills the whole group if the
//! helper has not exited within the configured timeout.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::io::AsyncBufReadExt;
use tracing::instrument;

use crate::backup::BackupFile;
use crate::endpoint::{self, EndpointKind, StorageEndpoint};

/// One line of helper output, interpreted for a particular file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferEvent {
    Progress { bytes: u64 },
    Canceled,
    Error { code: u32 },
    Unrecognized,
}

#[derive(Debug, Clone)]
pub struct LineClassifier {
    progress: regex::Regex,
    canceled: regex::Regex,
}

impl LineClassifier {
    pub fn new(file_name: &str) -> Result<Self, regex::Error> {
        let name = regex::escape(file_name);
        Ok(Self {
            progress: regex::Regex::new(&format!(
                ".*Replication.*{name} completed [0-9.]* percent[,][ ]([0-9]+) bytes"
            ))?,
            canceled: regex::Regex::new(&format!(".*File copy on ddboost canceled.*{name}"))?,
        })
    }

    /// Progress is checked first, then cancellation, then errors.
    #[must_use]
    pub fn classify(&self, line: &str) -> TransferEvent {
        if let Some(caps) = self.progress.captures(line) {
            return match caps[1].parse() {
                Ok(bytes) => TransferEvent::Progress { bytes },
                Err(_) => TransferEvent::Unrecognized,
            };
        }
        if self.canceled.is_match(line) {
            return TransferEvent::Canceled;
        }
        match endpoint::parse_error_code(&[line]) {
            Some(code) => TransferEvent::Error { code },
            None => TransferEvent::Unrecognized,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    /// About to start the helper
    Init,
    /// Helper started, no progress reported yet
    Started,
    InProgress,
    /// All bytes transferred
    Complete,
    /// The helper failed
    Incomplete,
    /// The helper handled an interrupt and removed what it had written, or was never started
    Canceled,
}

impl TransferState {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferState::Complete | TransferState::Incomplete | TransferState::Canceled
        )
    }

    /// Whether the target file may exist and has to be removed after a cancel or abort.
    #[must_use]
    pub fn needs_cleanup(&self) -> bool {
        matches!(self, TransferState::Complete | TransferState::Incomplete)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferStatus {
    pub state: TransferState,
    pub bytes: u64,
}

impl Default for TransferStatus {
    fn default() -> Self {
        Self {
            state: TransferState::Init,
            bytes: 0,
        }
    }
}

/// State machine of a single transfer.
#[derive(Debug)]
pub struct Tracker {
    name: String,
    size: u64,
    status: TransferStatus,
}

impl Tracker {
    pub fn new(file: &BackupFile) -> Self {
        Self {
            name: file.name.clone(),
            size: file.size,
            status: TransferStatus::default(),
        }
    }

    #[must_use]
    pub fn status(&self) -> TransferStatus {
        self.status
    }

    fn set_state(&mut self, state: TransferState) {
        if self.status.state.is_terminal() {
            tracing::debug!(
                "{}: ignoring transition {:?} -> {:?}",
                self.name,
                self.status.state,
                state
            );
            return;
        }
        tracing::debug!("{}: {:?} -> {:?}", self.name, self.status.state, state);
        self.status.state = state;
    }

    pub fn started(&mut self) {
        if self.status.state == TransferState::Init {
            self.set_state(TransferState::Started);
        }
    }

    /// Ends the transfer in `state` even if it already reached a terminal state.
    pub fn force(&mut self, state: TransferState) {
        tracing::debug!("{}: {:?} -> {:?} (forced)", self.name, self.status.state, state);
        self.status.state = state;
    }

    pub fn apply(&mut self, event: TransferEvent, line: &str) {
        match event {
            TransferEvent::Progress { bytes } if bytes > self.size => {
                tracing::error!(
                    "transfer status not recognized: {}\n\tFile: {}, state: {:?}",
                    line,
                    self.name,
                    self.status.state
                );
            }
            TransferEvent::Progress { bytes } => {
                if self.status.state.is_terminal() {
                    return;
                }
                self.status.bytes = self.status.bytes.max(bytes);
                if self.status.bytes == self.size {
                    self.set_state(TransferState::Complete);
                } else {
                    self.set_state(TransferState::InProgress);
                }
            }
            TransferEvent::Canceled => self.set_state(TransferState::Canceled),
            TransferEvent::Error { code } => {
                tracing::error!(
                    "error in transfer helper (code {}): {}\n\tFile: {}, state: {:?}",
                    code,
                    line,
                    self.name,
                    self.status.state
                );
                self.set_state(TransferState::Incomplete);
            }
            TransferEvent::Unrecognized => {
                if !line.is_empty() {
                    tracing::debug!("unrecognized output: '{}', file: {}", line, self.name);
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The user interrupted the run
    Cancel,
    /// Something failed and the run cannot complete
    Abort,
}

/// Shared request to stop all transfers of a run. Both requests are one-shot and idempotent.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    token: tokio_util::sync::CancellationToken,
    cancel_requested: std::sync::Arc<AtomicBool>,
    abort_requested: std::sync::Arc<AtomicBool>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        if !self.cancel_requested.swap(true, Ordering::AcqRel) {
            tracing::info!("cancel requested");
        }
        self.token.cancel();
    }

    pub fn abort(&self) {
        if !self.abort_requested.swap(true, Ordering::AcqRel) {
            tracing::info!("abort requested");
        }
        self.token.cancel();
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Abort wins when both were requested.
    #[must_use]
    pub fn reason(&self) -> Option<StopReason> {
        if self.abort_requested.load(Ordering::Acquire) {
            Some(StopReason::Abort)
        } else if self.cancel_requested.load(Ordering::Acquire) {
            Some(StopReason::Cancel)
        } else {
            None
        }
    }

    pub async fn stopped(&self) {
        self.token.cancelled().await;
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("invalid endpoint pair: source = {from}, target = {to}")]
    InvalidPair { from: String, to: String },
    #[error("cannot match helper output for this file name")]
    Pattern(#[from] regex::Error),
}

/// Helper arguments moving the file at `path` from `source` to `dest`. Only local to remote
/// (replicate) and remote to local (recover) are possible.
pub fn helper_args(
    source: &dyn StorageEndpoint,
    dest: &dyn StorageEndpoint,
    path: &str,
) -> Result<Vec<String>, TransferError> {
    let (operation, storage_unit) = match (source.kind(), dest.kind()) {
        (EndpointKind::Local, EndpointKind::Remote) => ("--replicate", source.storage_unit()),
        (EndpointKind::Remote, EndpointKind::Local) => ("--recover", dest.storage_unit()),
        _ => {
            let error = TransferError::InvalidPair {
                from: source.name(),
                to: dest.name(),
            };
            tracing::error!("{}", &error);
            return Err(error);
        }
    };
    Ok([
        operation,
        "--from-file",
        path,
        "--to-file",
        path,
        "--ddboost-storage-unit",
        storage_unit,
    ]
    .iter()
    .map(|arg| arg.to_string())
    .collect())
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub helper: std::path::PathBuf,
    /// How long a stopped helper gets to exit before it is killed
    pub watchdog: std::time::Duration,
}

/// One file to transfer, with its helper command line.
#[derive(Debug, Clone)]
pub struct TransferJob {
    pub file: BackupFile,
    pub path: String,
    args: Vec<String>,
    classifier: LineClassifier,
}

impl TransferJob {
    pub fn new(
        file: BackupFile,
        path: String,
        source: &dyn StorageEndpoint,
        dest: &dyn StorageEndpoint,
    ) -> Result<Self, TransferError> {
        let args = helper_args(source, dest, &path)?;
        let classifier = LineClassifier::new(&file.name)?;
        Ok(Self {
            file,
            path,
            args,
            classifier,
        })
    }

    #[must_use]
    pub fn args(&self) -> &[String] {
        &self.args
    }
}

fn signal_group(pid: Option<u32>, signal: nix::sys::signal::Signal) {
    let Some(pid) = pid else {
        return;
    };
    let pgid = nix::unistd::Pid::from_raw(pid as i32);
    match nix::sys::signal::killpg(pgid, signal) {
        Ok(()) => tracing::info!("sent {} to helper pid {}", signal, pid),
        Err(error) => tracing::debug!("failed sending {} to helper pid {}: {}", signal, pid, error),
    }
}

struct Task {
    job: TransferJob,
    tracker: Tracker,
    status_tx: tokio::sync::watch::Sender<TransferStatus>,
}

impl Task {
    fn publish(&self) {
        self.status_tx.send_replace(self.tracker.status());
    }

    fn observe(&mut self, line: &str) {
        let event = self.job.classifier.classify(line);
        self.tracker.apply(event, line);
        self.publish();
    }

    fn finish(&mut self, state: TransferState) {
        self.tracker.force(state);
        self.publish();
    }

    async fn run(
        mut self,
        settings: &Settings,
        stop: &StopSignal,
    ) -> Result<(), anyhow::Error> {
        let mut child = tokio::process::Command::new(&settings.helper)
            .args(self.job.args())
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()?;
        let pid = child.id();
        tracing::info!(
            "helper pid {:?} started, backup file: {}",
            pid,
            &self.job.file.name
        );
        self.tracker.started();
        self.publish();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("helper stdout not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow::anyhow!("helper stderr not captured"))?;
        let mut stdout = tokio::io::BufReader::new(stdout).lines();
        let mut stderr = tokio::io::BufReader::new(stderr).lines();
        let (mut stdout_open, mut stderr_open) = (true, true);
        let mut exit_status = None;
        let mut deadline: Option<tokio::time::Instant> = None;
        let mut killed = false;
        while stdout_open || stderr_open || exit_status.is_none() {
            tokio::select! {
                line = stdout.next_line(), if stdout_open => match line? {
                    Some(line) => self.observe(&line),
                    None => stdout_open = false,
                },
                line = stderr.next_line(), if stderr_open => match line? {
                    Some(line) => self.observe(&line),
                    None => stderr_open = false,
                },
                status = child.wait(), if exit_status.is_none() => {
                    exit_status = Some(status?);
                }
                _ = stop.stopped(), if deadline.is_none() => {
                    deadline = Some(tokio::time::Instant::now() + settings.watchdog);
                    if stop.reason() == Some(StopReason::Abort) {
                        tracing::info!("aborting transfer of {}", &self.job.file.name);
                    } else {
                        tracing::info!("waiting for helper pid {:?} to handle interrupt", pid);
                    }
                    signal_group(pid, nix::sys::signal::Signal::SIGINT);
                }
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(tokio::time::Instant::now)),
                    if deadline.is_some() && !killed => {
                    tracing::warn!("helper pid {:?} did not exit in time, killing it", pid);
                    signal_group(pid, nix::sys::signal::Signal::SIGKILL);
                    killed = true;
                }
            }
        }
        tracing::debug!(
            "helper pid {:?} finished with {:?}, file: {}",
            pid,
            exit_status,
            &self.job.file.name
        );
        if !self.tracker.status().state.is_terminal() {
            if stop.is_stopped() {
                self.finish(TransferState::Canceled);
            } else {
                tracing::error!(
                    "helper exited ({:?}) before transferring {}",
                    exit_status,
                    &self.job.file.name
                );
                self.finish(TransferState::Incomplete);
            }
        }
        Ok(())
    }
}

/// Runs the transfer of `job` to a terminal state, publishing every status change on
/// `status_tx`. `permit` is held until the helper has exited.
#[instrument(skip_all, fields(file = %job.file.name))]
pub async fn run_transfer(
    job: TransferJob,
    settings: Settings,
    stop: StopSignal,
    status_tx: tokio::sync::watch::Sender<TransferStatus>,
    permit: Option<throttle::StreamPermit>,
) {
    let mut task = Task {
        tracker: Tracker::new(&job.file),
        job,
        status_tx,
    };
    if stop.is_stopped() {
        task.finish(TransferState::Canceled);
        return;
    }
    let name = task.job.file.name.clone();
    let status_tx = task.status_tx.clone();
    let outcome = task.run(&settings, &stop).await;
    if let Err(error) = outcome {
        tracing::error!("transfer failed for backup file {}\nReason: {:#}", name, error);
        status_tx.send_modify(|status| status.state = TransferState::Incomplete);
    }
    tracing::info!(
        "finished transfer of {}, state: {:?}",
        name,
        status_tx.borrow().state
    );
    drop(permit);
}
