// Batched, bounded-concurrency item processing with per-item progress and
// checkpointing.

use std::fmt::Display;
use std::future::Future;

use futures::StreamExt;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::PipelineError;

use super::ProcessingPipeline;
use super::job::JobId;

/// One item whose operation returned an error. The batch carries on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemFailure {
    /// Position of the item in the input sequence.
    pub index: usize,
    pub message: String,
}

/// Result of one [`ProcessingPipeline::process_in_batches`] call.
#[derive(Debug, Clone)]
pub struct BatchOutcome<R> {
    /// Successful results with their input positions, in input order.
    pub results: Vec<(usize, R)>,
    pub failures: Vec<ItemFailure>,
    /// Size of every batch that ran, in order.
    pub batch_sizes: Vec<usize>,
    /// Input position processing started from (non-zero when resuming).
    pub resumed_from: usize,
    /// Stopped early because the job was cancelled.
    pub cancelled: bool,
}

impl<R> Default for BatchOutcome<R> {
    fn default() -> Self {
        Self {
            results: Vec::new(),
            failures: Vec::new(),
            batch_sizes: Vec::new(),
            resumed_from: 0,
            cancelled: false,
        }
    }
}

impl<R> BatchOutcome<R> {
    pub fn processed(&self) -> usize {
        self.results.len() + self.failures.len()
    }

    /// Drop the positions and keep the values.
    pub fn into_values(self) -> Vec<R> {
        self.results.into_iter().map(|(_, r)| r).collect()
    }
}

impl ProcessingPipeline {
    /// Run `operation` over `items` in fixed-size batches on behalf of a job.
    ///
    /// Within a batch at most `concurrency` operations are in flight; they may
    /// finish in any order. Each completion bumps the job's `processed_items`
    /// and `progress`. Between batches the job's cancellation flag is checked
    /// and its checkpoint advanced; a job that arrives with a checkpoint skips
    /// the items before it. A failed item is recorded and does not stop the batch.
    pub async fn process_in_batches<T, R, E, F, Fut>(
        &self,
        job_id: JobId,
        items: Vec<T>,
        operation: F,
    ) -> Result<BatchOutcome<R>, PipelineError>
    where
        T: Send,
        R: Send,
        E: Display + Send,
        F: Fn(T) -> Fut + Send + Sync,
        Fut: Future<Output = Result<R, E>> + Send,
    {
        let total = items.len();
        let start = self
            .get(job_id)
            .ok_or(PipelineError::JobNotFound(job_id))?
            .checkpoint
            .unwrap_or(0)
            .min(total);
        self.update_job(job_id, |job| {
            job.total_items = total as u64;
            job.processed_items = start as u64;
            job.recompute_progress();
        });

        let batch_size = self.settings().batch_size;
        let concurrency = self.settings().concurrency;
        let mut outcome = BatchOutcome {
            resumed_from: start,
            ..BatchOutcome::default()
        };
        if start > 0 {
            info!(job_id = %job_id, start, total, "Resuming from checkpoint");
        }

        let mut remaining = items.into_iter().enumerate().skip(start);
        loop {
            let batch: Vec<(usize, T)> = remaining.by_ref().take(batch_size).collect();
            let Some(&(last_index, _)) = batch.last() else {
                break;
            };
            if self.is_cancelled(job_id) {
                info!(job_id = %job_id, at = batch[0].0, "Batch processing cancelled");
                outcome.cancelled = true;
                break;
            }

            let size = batch.len();
            let operation = &operation;
            let mut in_flight = futures::stream::iter(batch.into_iter().map(|(index, item)| {
                let fut = operation(item);
                async move { (index, fut.await) }
            }))
            .buffer_unordered(concurrency);

            while let Some((index, result)) = in_flight.next().await {
                match result {
                    Ok(value) => outcome.results.push((index, value)),
                    Err(e) => outcome.failures.push(ItemFailure {
                        index,
                        message: e.to_string(),
                    }),
                }
                self.update_job(job_id, |job| {
                    job.processed_items += 1;
                    job.recompute_progress();
                });
            }

            outcome.batch_sizes.push(size);
            self.update_job(job_id, |job| job.checkpoint = Some(last_index + 1));
            debug!(job_id = %job_id, size, through = last_index + 1, total, "Batch complete");
        }

        if !outcome.cancelled {
            // Finished this sequence; a later call starts from the beginning.
            self.update_job(job_id, |job| job.checkpoint = None);
        }
        outcome.results.sort_by_key(|(index, _)| *index);
        outcome.failures.sort_by_key(|f| f.index);
        Ok(outcome)
    }
}
