//! Copies an artifact tree from one provider to another.
//!
//! The source tree is walked breadth-first from its root item. Folder
//! listing happens on the calling task; file transfers are spawned and
//! bounded by a semaphore so a large tree cannot exhaust descriptors or
//! sockets.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::artifacts::item::ArtifactItem;
use crate::artifacts::provider::ArtifactProvider;
use crate::error::ArtifactError;
use crate::observability::{Observer, ObserverEvent, ObserverMetric};

/// Knobs for one tree transfer.
#[derive(Debug, Clone)]
pub struct TransferOptions {
    /// Maximum number of files in flight at once.
    pub parallel_limit: usize,
    /// Glob matched against each file's relative path.
    pub item_pattern: String,
    /// Extra attempts for a file whose stream failed.
    pub retry_limit: u32,
    /// Pause between attempts.
    pub retry_interval: Duration,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            parallel_limit: 4,
            item_pattern: "**".to_string(),
            retry_limit: 2,
            retry_interval: Duration::from_secs(1),
        }
    }
}

/// What a finished transfer did.
#[derive(Debug, Clone, Default)]
pub struct TransferSummary {
    /// Files written to the destination.
    pub files: usize,
    /// Folders enumerated below the root.
    pub folders: usize,
    /// Files left out by the item pattern, and symbolic links.
    pub skipped: usize,
    /// Bytes written, as reported by the destination.
    pub bytes: u64,
    /// Items as returned by the destination, carrying their destination
    /// address.
    pub items: Vec<ArtifactItem>,
}

impl TransferSummary {
    /// Fold another transfer's totals into this one.
    pub fn merge(&mut self, other: TransferSummary) {
        self.files += other.files;
        self.folders += other.folders;
        self.skipped += other.skipped;
        self.bytes += other.bytes;
        self.items.extend(other.items);
    }
}

/// Drives tree transfers between providers.
pub struct ArtifactEngine {
    observer: Arc<dyn Observer>,
}

impl ArtifactEngine {
    pub fn new(observer: Arc<dyn Observer>) -> Self {
        Self { observer }
    }

    /// Copy every file under `source`'s root that matches the item pattern
    /// into `destination`.
    ///
    /// The first failure cancels the remaining transfers and is returned
    /// once they have wound down. Cancelling `cancel` stops the transfer with
    /// [`ArtifactError::Cancelled`].
    pub async fn transfer(
        &self,
        source: Arc<dyn ArtifactProvider>,
        destination: Arc<dyn ArtifactProvider>,
        options: &TransferOptions,
        cancel: &CancellationToken,
    ) -> Result<TransferSummary, ArtifactError> {
        let pattern = glob::Pattern::new(&options.item_pattern).map_err(|e| {
            ArtifactError::InvalidPattern {
                pattern: options.item_pattern.clone(),
                reason: e.to_string(),
            }
        })?;

        tracing::info!(
            source = source.name(),
            destination = destination.name(),
            parallel_limit = options.parallel_limit,
            pattern = %options.item_pattern,
            "Starting artifact transfer"
        );

        let started = Instant::now();
        let semaphore = Arc::new(Semaphore::new(options.parallel_limit.max(1)));
        let active = Arc::new(AtomicU64::new(0));
        let transfer_cancel = cancel.child_token();
        let mut tasks: JoinSet<Result<(ArtifactItem, u64), ArtifactError>> = JoinSet::new();
        let mut summary = TransferSummary::default();
        let mut first_error: Option<ArtifactError> = None;

        let mut pending: VecDeque<ArtifactItem> = source.get_root_items().await?.into();

        while let Some(item) = pending.pop_front() {
            while let Some(joined) = tasks.try_join_next() {
                self.collect(joined, &mut summary, &mut first_error, &transfer_cancel);
            }
            if first_error.is_some() || transfer_cancel.is_cancelled() {
                break;
            }

            if item.is_folder() {
                if !item.path.is_empty() {
                    summary.folders += 1;
                }
                match source.get_artifact_items(&item).await {
                    Ok(children) => pending.extend(children),
                    Err(e) => {
                        transfer_cancel.cancel();
                        first_error = Some(e);
                        break;
                    }
                }
                continue;
            }

            if item.is_symlink() {
                tracing::debug!(path = %item.path, "Skipping symbolic link");
                summary.skipped += 1;
                continue;
            }

            if !pattern.matches(&item.path) {
                tracing::debug!(path = %item.path, "Skipping item not matching pattern");
                summary.skipped += 1;
                continue;
            }

            let permit = tokio::select! {
                biased;
                _ = transfer_cancel.cancelled() => break,
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(e) => {
                        first_error = Some(ArtifactError::TaskFailed(e.to_string()));
                        transfer_cancel.cancel();
                        break;
                    }
                },
            };

            let job = FileTransfer {
                source: Arc::clone(&source),
                destination: Arc::clone(&destination),
                item,
                retry_limit: options.retry_limit,
                retry_interval: options.retry_interval,
                cancel: transfer_cancel.clone(),
                observer: Arc::clone(&self.observer),
                active: Arc::clone(&active),
            };
            tasks.spawn(async move {
                let result = job.run().await;
                drop(permit);
                result
            });
        }

        while let Some(joined) = tasks.join_next().await {
            self.collect(joined, &mut summary, &mut first_error, &transfer_cancel);
        }

        if let Some(e) = first_error {
            return Err(e);
        }
        if cancel.is_cancelled() {
            return Err(ArtifactError::Cancelled {
                path: String::new(),
            });
        }

        tracing::info!(
            files = summary.files,
            folders = summary.folders,
            skipped = summary.skipped,
            bytes = summary.bytes,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Artifact transfer complete"
        );
        Ok(summary)
    }

    fn collect(
        &self,
        joined: Result<Result<(ArtifactItem, u64), ArtifactError>, tokio::task::JoinError>,
        summary: &mut TransferSummary,
        first_error: &mut Option<ArtifactError>,
        transfer_cancel: &CancellationToken,
    ) {
        let outcome = joined.unwrap_or_else(|e| Err(ArtifactError::TaskFailed(e.to_string())));
        match outcome {
            Ok((item, bytes)) => {
                summary.files += 1;
                summary.bytes += bytes;
                summary.items.push(item);
            }
            Err(e) if first_error.is_none() => {
                transfer_cancel.cancel();
                *first_error = Some(e);
            }
            Err(e) => {
                if !e.is_cancelled() {
                    self.observer.record_event(&ObserverEvent::Error {
                        component: "artifact_engine".into(),
                        message: e.to_string(),
                    });
                }
            }
        }
    }
}

/// One file moving from source to destination, with retries.
struct FileTransfer {
    source: Arc<dyn ArtifactProvider>,
    destination: Arc<dyn ArtifactProvider>,
    item: ArtifactItem,
    retry_limit: u32,
    retry_interval: Duration,
    cancel: CancellationToken,
    observer: Arc<dyn Observer>,
    active: Arc<AtomicU64>,
}

impl FileTransfer {
    async fn run(self) -> Result<(ArtifactItem, u64), ArtifactError> {
        let in_flight = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.observer
            .record_metric(&ObserverMetric::ActiveTransfers(in_flight));

        let result = self.run_with_retries().await;

        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn run_with_retries(&self) -> Result<(ArtifactItem, u64), ArtifactError> {
        let started = Instant::now();
        let mut attempt = 0u32;

        loop {
            match self.attempt().await {
                Ok(written) => {
                    let bytes = written.file_length.or(self.item.file_length).unwrap_or(0);
                    self.observer.record_event(&ObserverEvent::ArtifactTransferred {
                        path: self.item.path.clone(),
                        bytes,
                        duration: started.elapsed(),
                    });
                    self.observer
                        .record_metric(&ObserverMetric::BytesTransferred(bytes));
                    return Ok((written, bytes));
                }
                Err(e) if e.is_transient() && attempt < self.retry_limit => {
                    attempt += 1;
                    tracing::warn!(
                        path = %self.item.path,
                        attempt,
                        max_retries = self.retry_limit,
                        "Artifact transfer failed, retrying: {}",
                        e
                    );
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => {
                            return Err(ArtifactError::Cancelled {
                                path: self.item.path.clone(),
                            });
                        }
                        _ = tokio::time::sleep(self.retry_interval) => {}
                    }
                }
                Err(e) => {
                    if !e.is_cancelled() {
                        tracing::error!(
                            path = %self.item.path,
                            "Artifact transfer failed: {}",
                            e
                        );
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn attempt(&self) -> Result<ArtifactItem, ArtifactError> {
        if self.cancel.is_cancelled() {
            return Err(ArtifactError::Cancelled {
                path: self.item.path.clone(),
            });
        }
        let stream = self.source.get_artifact_item(&self.item).await?;
        self.destination
            .put_artifact_item(self.item.clone(), stream, &self.cancel)
            .await
    }
}
