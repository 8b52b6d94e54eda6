// =============================================================================
// Partition Worker: one task per owned partition
// =============================================================================
//
// Loop:
//   1. resume: load the partition's checkpoint, restore stage progress, seek
//   2. read a batch (upstream errors retried with backoff)
//   3. process each record; record-level errors are counted and skipped
//   4. append outputs to the output topic, keyed by pair
//   5. on cadence: flush the output log, then commit the safe position
//
// Ownership is re-checked between batches; a revoked or fenced worker stops
// without committing.  Shutdown flushes and commits before releasing the
// partition.  In historical mode an empty read is end of input: the stage is
// drained, outputs flushed, the final position committed and the worker exits.
// =============================================================================

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::stage::{record_rejection, Stage};
use crate::coordinator::{Coordinator, Lease};
use crate::errors::PipelineError;
use crate::log::{retry_upstream, Backoff, PartitionedLog};
use crate::metrics::StageMetrics;
use crate::runtime_config::{PipelineConfig, StageKind};
use crate::types::RunMode;

/// Per-stage worker tuning, derived from `PipelineConfig`.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub mode: RunMode,
    pub input_topic: String,
    pub output_topic: String,
    pub poll_batch_size: usize,
    pub poll_idle: Duration,
    pub commit_interval: Duration,
    pub commit_every_records: u64,
    pub max_backoff_secs: u64,
    pub restart_delay: Duration,
}

impl WorkerSettings {
    pub fn from_config(cfg: &PipelineConfig, stage: StageKind) -> Self {
        Self {
            mode: cfg.mode,
            input_topic: cfg.input_topic(stage),
            output_topic: cfg.output_topic(stage),
            poll_batch_size: cfg.poll_batch_size,
            poll_idle: Duration::from_millis(cfg.poll_idle_ms),
            commit_interval: cfg.commit_interval(),
            commit_every_records: cfg.commit_every_records,
            max_backoff_secs: cfg.max_backoff_secs,
            restart_delay: Duration::from_millis(cfg.restart_delay_ms),
        }
    }
}

/// Why a worker stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Shutdown requested.
    Shutdown,
    /// Partition moved to another member.
    Revoked,
    /// Historical input fully processed and committed.
    EndOfInput,
}

/// Result of one poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    Processed(usize),
    Empty,
    /// Shutdown arrived while waiting for the upstream log.
    Interrupted,
}

pub struct PartitionWorker<S: Stage> {
    stage: S,
    lease: Lease,
    coordinator: Coordinator,
    log: Arc<dyn PartitionedLog>,
    metrics: Arc<StageMetrics>,
    settings: Arc<WorkerSettings>,
    shutdown: watch::Receiver<bool>,
    backoff: Backoff,
    next_offset: u64,
    /// Offsets below this were processed before the restored checkpoint.
    replay_until: u64,
    uncommitted: u64,
    last_commit: Instant,
}

impl<S: Stage> PartitionWorker<S> {
    pub fn new(
        stage: S,
        lease: Lease,
        coordinator: Coordinator,
        log: Arc<dyn PartitionedLog>,
        metrics: Arc<StageMetrics>,
        settings: Arc<WorkerSettings>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let backoff = Backoff::from_secs(settings.max_backoff_secs);
        Self {
            stage,
            lease,
            coordinator,
            log,
            metrics,
            settings,
            shutdown,
            backoff,
            next_offset: 0,
            replay_until: 0,
            uncommitted: 0,
            last_commit: Instant::now(),
        }
    }

    #[cfg(test)]
    pub fn stage(&self) -> &S {
        &self.stage
    }

    // -------------------------------------------------------------------------
    // Resume
    // -------------------------------------------------------------------------

    /// Restore from the last committed checkpoint; returns the offset reading
    /// resumes at (0 without a checkpoint).
    pub fn resume(&mut self) -> Result<u64, PipelineError> {
        if let Some(checkpoint) = self.coordinator.resume(self.lease.partition)? {
            if !checkpoint.progress.is_null() {
                let progress: S::Progress = serde_json::from_value(checkpoint.progress)
                    .map_err(|e| PipelineError::Checkpoint(format!("invalid progress snapshot: {e}")))?;
                self.stage.restore(progress);
            }
            self.next_offset = checkpoint.position;
            self.replay_until = checkpoint.next_offset;
        }
        self.uncommitted = 0;
        self.last_commit = Instant::now();
        Ok(self.next_offset)
    }

    // -------------------------------------------------------------------------
    // Processing
    // -------------------------------------------------------------------------

    /// Read and process one batch.
    pub async fn poll_batch(&mut self) -> Result<BatchOutcome, PipelineError> {
        let log = Arc::clone(&self.log);
        let settings = Arc::clone(&self.settings);
        let (partition, from) = (self.lease.partition, self.next_offset);

        let batch = retry_upstream(&mut self.backoff, &mut self.shutdown, &self.metrics, || {
            log.read(&settings.input_topic, partition, from, settings.poll_batch_size)
        })
        .await?;
        let Some(batch) = batch else {
            return Ok(BatchOutcome::Interrupted);
        };
        if batch.is_empty() {
            return Ok(BatchOutcome::Empty);
        }

        let count = batch.len();
        for record in batch {
            self.metrics.record_in();
            let outputs = match self.stage.process(&record.payload, record.offset) {
                Ok(outputs) => outputs,
                Err(e) if e.is_record_level() && record.offset < self.replay_until => {
                    // Already counted by the incarnation that committed.
                    self.metrics.replay_skipped();
                    debug!(partition, offset = record.offset, error = %e, "replayed record skipped");
                    Vec::new()
                }
                Err(e) if e.is_record_level() => {
                    record_rejection(&self.metrics, &e);
                    match e {
                        PipelineError::LateTrade { .. } => {
                            debug!(partition, offset = record.offset, error = %e, "late trade dropped")
                        }
                        _ => warn!(partition, offset = record.offset, error = %e, "record skipped"),
                    }
                    Vec::new()
                }
                Err(e) => return Err(e),
            };
            if !self.emit(outputs).await? {
                return Ok(BatchOutcome::Interrupted);
            }
            self.next_offset = record.offset + 1;
            self.uncommitted += 1;
        }
        Ok(BatchOutcome::Processed(count))
    }

    /// Append outputs to the output topic.  `false` when interrupted by
    /// shutdown before every output was written.
    async fn emit(&mut self, outputs: Vec<S::Output>) -> Result<bool, PipelineError> {
        let log = Arc::clone(&self.log);
        let settings = Arc::clone(&self.settings);
        for output in outputs {
            let payload = serde_json::to_vec(&output)
                .map_err(|e| PipelineError::Malformed(format!("failed to serialise output: {e}")))?;
            let key = S::output_key(&output);
            let written = retry_upstream(&mut self.backoff, &mut self.shutdown, &self.metrics, || {
                log.append(&settings.output_topic, key, &payload)
            })
            .await?;
            if written.is_none() {
                return Ok(false);
            }
            S::record_output(&self.metrics, &output);
        }
        Ok(true)
    }

    async fn idle(&mut self) -> Result<bool, PipelineError> {
        let outputs = self.stage.on_idle(Instant::now());
        self.emit(outputs).await
    }

    fn commit_due(&self) -> bool {
        self.uncommitted >= self.settings.commit_every_records
            || self.last_commit.elapsed() >= self.settings.commit_interval
    }

    // -------------------------------------------------------------------------
    // Commit
    // -------------------------------------------------------------------------

    /// Flush the output log and commit the safe position.  Returns the exit
    /// reason when the commit could not happen (fenced, or shutdown while the
    /// log was unreachable).
    pub async fn checkpoint(&mut self) -> Result<Option<WorkerExit>, PipelineError> {
        let log = Arc::clone(&self.log);
        let flushed = retry_upstream(&mut self.backoff, &mut self.shutdown, &self.metrics, || log.flush()).await?;
        if flushed.is_none() {
            warn!(partition = self.lease.partition, "shutdown before output flush; skipping commit");
            return Ok(Some(WorkerExit::Shutdown));
        }

        let position = self.stage.safe_position(self.next_offset);
        let progress = serde_json::to_value(self.stage.progress())
            .map_err(|e| PipelineError::Checkpoint(format!("failed to serialise progress: {e}")))?;

        match self.coordinator.commit(&self.lease, position, self.next_offset, progress) {
            Ok(()) => {}
            Err(e @ PipelineError::Fenced { .. }) => {
                warn!(partition = self.lease.partition, error = %e, "commit fenced");
                return Ok(Some(WorkerExit::Revoked));
            }
            Err(e) => return Err(e),
        }

        self.metrics.commit();
        self.uncommitted = 0;
        self.last_commit = Instant::now();
        info!(
            partition = self.lease.partition,
            position,
            next_offset = self.next_offset,
            metrics = ?self.metrics.snapshot(),
            "checkpoint committed"
        );
        Ok(None)
    }

    // -------------------------------------------------------------------------
    // Main loop
    // -------------------------------------------------------------------------

    pub async fn run(mut self) -> Result<WorkerExit, PipelineError> {
        let position = self.resume()?;
        let partition = self.lease.partition;
        info!(partition, position, generation = self.lease.generation, "partition acquired");

        let exit = loop {
            if *self.shutdown.borrow() {
                break self.checkpoint().await?.unwrap_or(WorkerExit::Shutdown);
            }
            if !self.coordinator.group().is_current(&self.lease) {
                info!(partition, "partition revoked");
                break WorkerExit::Revoked;
            }

            match self.poll_batch().await? {
                BatchOutcome::Interrupted => break WorkerExit::Shutdown,
                BatchOutcome::Processed(_) => {
                    if !self.idle().await? {
                        break WorkerExit::Shutdown;
                    }
                    if self.commit_due() {
                        if let Some(exit) = self.checkpoint().await? {
                            break exit;
                        }
                    }
                }
                BatchOutcome::Empty if self.settings.mode == RunMode::Historical => {
                    let outputs = self.stage.finish();
                    info!(partition, drained = outputs.len(), "end of historical input");
                    if !self.emit(outputs).await? {
                        break WorkerExit::Shutdown;
                    }
                    break self.checkpoint().await?.unwrap_or(WorkerExit::EndOfInput);
                }
                BatchOutcome::Empty => {
                    if !self.idle().await? {
                        break WorkerExit::Shutdown;
                    }
                    if self.commit_due() {
                        if let Some(exit) = self.checkpoint().await? {
                            break exit;
                        }
                    }
                    let poll_idle = self.settings.poll_idle;
                    let sender_gone = tokio::select! {
                        _ = tokio::time::sleep(poll_idle) => false,
                        changed = self.shutdown.changed() => changed.is_err(),
                    };
                    if sender_gone {
                        break self.checkpoint().await?.unwrap_or(WorkerExit::Shutdown);
                    }
                }
            }
        };

        info!(partition, exit = ?exit, "partition released");
        Ok(exit)
    }
}
