//! Download scheduling across a bounded worker pool.
//!
//! Granules move through `Queued -> InFlight -> {Succeeded | Retrying ->
//! InFlight | Failed}` (plus `Skipped` for outputs that already exist).
//! A granule's whole lifecycle, retries included, runs inside the single
//! worker that pulled it from the FIFO queue, so no granule is ever driven
//! by two workers at once. The returned result sequence matches the input
//! granule order regardless of completion timing.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_retry2::strategy::jitter;
use tracing::{debug, info, warn};

use crate::download::SubsetFetcher;
use crate::error::DownloadErrorKind;
use crate::shutdown::SharedShutdown;
use crate::types::{DownloadOutcome, DownloadResult, Granule, RetryPolicy};

/// Orchestrates subset downloads over a fixed-size worker pool.
pub struct DownloadScheduler {
    worker_count: usize,
    policy: RetryPolicy,
    force: bool,
    shutdown: SharedShutdown,
    progress: Option<indicatif::ProgressBar>,
}

impl DownloadScheduler {
    /// Create a scheduler with `worker_count` concurrent workers (>= 1).
    pub fn new(worker_count: usize, policy: RetryPolicy, shutdown: SharedShutdown) -> Self {
        Self {
            worker_count: worker_count.max(1),
            policy,
            force: false,
            shutdown,
            progress: None,
        }
    }

    /// Re-download granules even when a completed output already exists.
    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Attach a progress bar advanced once per finished granule.
    pub fn with_progress(mut self, progress: indicatif::ProgressBar) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Drive every granule to a terminal state and return one result per
    /// granule, ordered to match the input sequence.
    ///
    /// Individual granule failures never fail the run; the exit-status
    /// policy over the aggregate belongs to the caller.
    pub async fn run(
        &self,
        granules: Vec<Granule>,
        fetcher: Arc<dyn SubsetFetcher>,
        dest_dir: &Path,
    ) -> Vec<DownloadResult> {
        let total = granules.len();
        if total == 0 {
            return Vec::new();
        }
        info!(granules = total, workers = self.worker_count, "Starting subset downloads");

        let granules = Arc::new(granules);
        let queue: Arc<Mutex<VecDeque<usize>>> = Arc::new(Mutex::new((0..total).collect()));
        let slots: Arc<Mutex<Vec<Option<DownloadResult>>>> =
            Arc::new(Mutex::new((0..total).map(|_| None).collect()));

        let mut workers = Vec::with_capacity(self.worker_count);
        for worker_id in 0..self.worker_count {
            let granules = Arc::clone(&granules);
            let queue = Arc::clone(&queue);
            let slots = Arc::clone(&slots);
            let fetcher = Arc::clone(&fetcher);
            let shutdown = Arc::clone(&self.shutdown);
            let progress = self.progress.clone();
            let dest_dir = dest_dir.to_path_buf();
            let policy = self.policy;
            let force = self.force;

            workers.push(tokio::spawn(async move {
                loop {
                    let index = { queue.lock().await.pop_front() };
                    let Some(index) = index else { break };
                    let granule = &granules[index];

                    let result = if shutdown.is_shutdown_requested() {
                        debug!(worker = worker_id, granule = %granule.id, "Cancelled before dispatch");
                        DownloadResult {
                            granule_id: granule.id.clone(),
                            outcome: DownloadOutcome::Failed {
                                kind: DownloadErrorKind::Cancelled,
                                attempts: 0,
                            },
                        }
                    } else {
                        drive_granule(
                            granule,
                            fetcher.as_ref(),
                            &dest_dir,
                            policy,
                            force,
                            &shutdown,
                        )
                        .await
                    };

                    if let Some(pb) = &progress {
                        pb.inc(1);
                    }
                    slots.lock().await[index] = Some(result);
                }
            }));
        }

        for worker in workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "Download worker panicked");
            }
        }

        let mut slots = slots.lock().await;
        slots
            .iter_mut()
            .enumerate()
            .map(|(index, slot)| {
                slot.take().unwrap_or_else(|| DownloadResult {
                    granule_id: granules[index].id.clone(),
                    outcome: DownloadOutcome::Failed {
                        kind: DownloadErrorKind::Cancelled,
                        attempts: 0,
                    },
                })
            })
            .collect()
    }
}

/// Drive one granule through the retry state machine to a terminal state.
///
/// Kept free of pool mechanics so retry counting, backoff bounds and
/// terminal transitions are testable on their own.
async fn drive_granule(
    granule: &Granule,
    fetcher: &dyn SubsetFetcher,
    dest_dir: &Path,
    policy: RetryPolicy,
    force: bool,
    shutdown: &SharedShutdown,
) -> DownloadResult {
    let terminal = |outcome: DownloadOutcome| DownloadResult {
        granule_id: granule.id.clone(),
        outcome,
    };

    if !force {
        if let Some(reason) = already_present(granule, dest_dir).await {
            debug!(granule = %granule.id, "Skipping: {reason}");
            return terminal(DownloadOutcome::Skipped { reason });
        }
    }

    let mut attempt: u32 = 1;
    loop {
        debug!(granule = %granule.id, attempt, "Dispatching subset download");
        match fetcher.fetch(granule, dest_dir).await {
            Ok((path, bytes)) => {
                info!(granule = %granule.id, bytes, attempts = attempt, "Granule downloaded");
                return terminal(DownloadOutcome::Succeeded {
                    path,
                    bytes,
                    attempts: attempt,
                });
            }
            Err(DownloadErrorKind::Transient(reason)) => {
                if attempt >= policy.max_attempts {
                    warn!(granule = %granule.id, attempts = attempt, "Retries exhausted: {reason}");
                    return terminal(DownloadOutcome::Failed {
                        kind: DownloadErrorKind::Transient(reason),
                        attempts: attempt,
                    });
                }
                let delay = jitter(policy.backoff_delay(attempt));
                warn!(
                    granule = %granule.id,
                    attempt,
                    backoff_ms = delay.as_millis() as u64,
                    "Transient failure, retrying: {reason}"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.wait_for_shutdown() => {
                        return terminal(DownloadOutcome::Failed {
                            kind: DownloadErrorKind::Cancelled,
                            attempts: attempt,
                        });
                    }
                }
                attempt += 1;
            }
            Err(kind) => {
                warn!(granule = %granule.id, attempts = attempt, "Granule failed: {kind}");
                return terminal(DownloadOutcome::Failed {
                    kind,
                    attempts: attempt,
                });
            }
        }
    }
}

/// Single existence check for a completed output. A zero-byte leftover
/// does not count as present.
async fn already_present(granule: &Granule, dest_dir: &Path) -> Option<String> {
    let path: PathBuf = dest_dir.join(&granule.producer_granule_id);
    match tokio::fs::metadata(&path).await {
        Ok(meta) if meta.is_file() && meta.len() > 0 => Some("already present".to_string()),
        _ => None,
    }
}
