//! Streaming training batcher
//!
//! Consumes an iterator of raw messages, tokenizes each one, emits a
//! weight-1 record per sliding window of `state_size + 1` tokens, and
//! submits the records to the pool in batches of `batch_size`. A rebuild
//! goes through `BuildChains` (the first batch clears the store);
//! incremental training goes through `BatchUpdate`. Every batch is
//! awaited before the next is submitted, which gives serial application
//! per tenant without any cross-batch ordering assumptions.
//!
//! The source never needs to fit in memory: between batches the batcher
//! samples resident memory and pauses one poll interval while above the
//! configured soft ceiling.

use crate::pool::{Task, TaskOutput, TaskPriority, UpdateOp, WorkerPool};
use markgen_core::mem::resident_memory_bytes;
use markgen_core::{
    records_from_message, EngineConfig, Error, Result, TenantId, TrainingMessage, TrainingRecord,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Progress is logged once per this many batches.
const PROGRESS_LOG_EVERY: usize = 10;
/// Pause length while resident memory is above the soft ceiling.
const MEMORY_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Summary of one training run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrainReport {
    /// Messages consumed from the source.
    pub messages: usize,
    /// Records emitted by windowing.
    pub records: usize,
    /// Batches submitted to the pool.
    pub batches: usize,
    /// Records the stores accepted.
    pub processed: usize,
    /// Messages too short to produce a window.
    pub skipped_short: usize,
}

/// Normalizes message streams into record batches and feeds the pool.
pub struct TrainBatcher {
    pool: Arc<WorkerPool>,
    config: Arc<EngineConfig>,
}

impl TrainBatcher {
    /// Create a batcher over a pool.
    pub fn new(pool: Arc<WorkerPool>, config: Arc<EngineConfig>) -> TrainBatcher {
        TrainBatcher { pool, config }
    }

    /// Stream a message source into a tenant's chains.
    ///
    /// With `rebuild` the tenant's existing chains are cleared by the
    /// first batch; otherwise records merge incrementally. Each batch is
    /// awaited before the next is submitted.
    ///
    /// # Errors
    ///
    /// Propagates the first task-level failure (`Worker`, `Cancelled`,
    /// `Io`). Per-record rejections inside a batch do not abort training;
    /// they reduce `processed` relative to `records`.
    pub fn train<I>(&self, tenant: &TenantId, source: I, rebuild: bool) -> Result<TrainReport>
    where
        I: IntoIterator<Item = TrainingMessage>,
    {
        let state_size = self.config.state_size;
        let batch_size = self.config.batch_size;
        let mut report = TrainReport::default();
        let mut pending: Vec<TrainingRecord> = Vec::with_capacity(batch_size);
        let mut clear_pending = rebuild;

        for message in source {
            report.messages += 1;
            let records = records_from_message(&message.message, state_size);
            if records.is_empty() {
                report.skipped_short += 1;
                continue;
            }
            report.records += records.len();
            pending.extend(records);

            while pending.len() >= batch_size {
                let chunk: Vec<TrainingRecord> = pending.drain(..batch_size).collect();
                report.processed += self.submit_batch(tenant, chunk, rebuild, clear_pending)?;
                clear_pending = false;
                report.batches += 1;

                if report.batches % PROGRESS_LOG_EVERY == 0 {
                    info!(
                        tenant = %tenant,
                        batches = report.batches,
                        records = report.records,
                        "training in progress"
                    );
                }
                self.memory_backoff();
            }
        }

        // Final partial batch; a rebuild with no records still submits
        // the clearing batch so the store ends up empty.
        if !pending.is_empty() || clear_pending {
            let chunk = std::mem::take(&mut pending);
            report.processed += self.submit_batch(tenant, chunk, rebuild, clear_pending)?;
            report.batches += 1;
        }

        info!(
            tenant = %tenant,
            messages = report.messages,
            records = report.records,
            processed = report.processed,
            batches = report.batches,
            skipped_short = report.skipped_short,
            "training finished"
        );
        Ok(report)
    }

    fn submit_batch(
        &self,
        tenant: &TenantId,
        records: Vec<TrainingRecord>,
        rebuild: bool,
        clear_existing: bool,
    ) -> Result<usize> {
        let task = if rebuild {
            Task::BuildChains {
                tenant: tenant.clone(),
                records,
                clear_existing,
            }
        } else {
            Task::BatchUpdate {
                tenant: tenant.clone(),
                updates: records,
                op: UpdateOp::Add,
            }
        };
        let handle = self.pool.submit(TaskPriority::Normal, task);
        match handle.wait()? {
            TaskOutput::Built { processed_count } => Ok(processed_count),
            TaskOutput::Updated { update_count } => Ok(update_count),
            other => Err(Error::worker(format!(
                "unexpected training task output: {:?}",
                other
            ))),
        }
    }

    fn memory_backoff(&self) {
        if let Some(resident) = resident_memory_bytes() {
            if resident > self.config.memory_ceiling_bytes {
                debug!(
                    resident,
                    ceiling = self.config.memory_ceiling_bytes,
                    "resident memory above ceiling; pausing between batches"
                );
                std::thread::sleep(MEMORY_POLL_INTERVAL);
            }
        }
    }
}

/// Parse an external training file: a JSON array of
/// `{ "message": string, "attachments"?: [string] }`.
///
/// # Errors
///
/// `Io` when the file cannot be opened, `InvalidInput` when the body is
/// not the documented format.
pub fn read_training_file(path: &Path) -> Result<Vec<TrainingMessage>> {
    let file = std::fs::File::open(path)
        .map_err(|e| Error::io(format!("open training file {}", path.display()), e))?;
    serde_json::from_reader(std::io::BufReader::new(file)).map_err(|e| {
        Error::invalid_input(format!("malformed training file {}: {}", path.display(), e))
    })
}
