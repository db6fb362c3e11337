//! Deletion of many files from one endpoint, a fixed-size batch at a time

use std::sync::Arc;

use tracing::instrument;

use crate::endpoint::{EndpointError, StorageEndpoint};

pub const DEFAULT_BATCH_SIZE: usize = 50;

/// Error type for batch deletion that preserves the summary of what was deleted.
///
/// The Display implementation shows the full error chain.
#[derive(Debug, thiserror::Error)]
#[error("{source:#}")]
pub struct Error {
    #[source]
    pub source: anyhow::Error,
    pub summary: Summary,
}

impl Error {
    #[must_use]
    pub fn new(source: anyhow::Error, summary: Summary) -> Self {
        Error { source, summary }
    }
}

#[derive(Debug, Default)]
pub struct Summary {
    pub files_deleted: usize,
    /// Paths that could not be deleted, with the reason.
    pub failures: Vec<(String, EndpointError)>,
}

impl Summary {
    /// Turns recorded failures into an error, for callers that treat any failure as fatal.
    pub fn into_result(self) -> Result<Summary, Error> {
        match self.failures.first() {
            None => Ok(self),
            Some((path, reason)) => Err(Error::new(
                anyhow::anyhow!(
                    "failed to delete {} file(s), first: {}: {}",
                    self.failures.len(),
                    path,
                    reason
                ),
                self,
            )),
        }
    }
}

impl std::ops::Add for Summary {
    type Output = Self;
    fn add(mut self, other: Self) -> Self {
        self.files_deleted += other.files_deleted;
        self.failures.extend(other.failures);
        self
    }
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "files deleted: {}\n\
            delete failures: {}",
            self.files_deleted,
            self.failures.len()
        )
    }
}

/// Deletes `paths` from `endpoint`, at most `batch_size` concurrently. A failed delete is
/// recorded and does not stop the remaining batches.
#[instrument(skip(endpoint, paths), fields(endpoint = %endpoint.name(), count = paths.len()))]
pub async fn delete_files(
    endpoint: Arc<dyn StorageEndpoint>,
    paths: &[String],
    batch_size: usize,
) -> Summary {
    let batch_size = batch_size.max(1);
    let goal = paths.len();
    tracing::debug!("deleting {} files, {} at a time", goal, batch_size);
    let mut summary = Summary::default();
    let mut done = 0;
    for batch in paths.chunks(batch_size) {
        let mut join_set = tokio::task::JoinSet::new();
        for path in batch {
            let endpoint = endpoint.clone();
            let path = path.clone();
            join_set.spawn(async move {
                let result = endpoint.delete_file(&path).await;
                (path, result)
            });
        }
        while let Some(res) = join_set.join_next().await {
            done += 1;
            match res {
                Ok((_, Ok(()))) => summary.files_deleted += 1,
                Ok((path, Err(error))) => {
                    tracing::error!(
                        "delete failed for backup file {} on {}: {}",
                        &path,
                        endpoint.name(),
                        &error
                    );
                    summary.failures.push((path, error));
                }
                Err(error) => {
                    tracing::error!("delete task failed: {}", error);
                    summary.failures.push((
                        "<unknown>".to_string(),
                        EndpointError::Exec {
                            command: "delete".to_string(),
                            reason: error.to_string(),
                        },
                    ));
                }
            }
        }
        tracing::info!(
            "deleting files from {}: {} out of {} files processed",
            endpoint.name(),
            done,
            goal
        );
    }
    summary
}
