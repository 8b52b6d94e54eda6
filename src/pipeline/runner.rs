// =============================================================================
// Stage Runner: one supervised worker task per owned partition
// =============================================================================
//
// The runner joins the consumer group, spawns a worker for every partition it
// is assigned and watches the assignment for changes.  A worker that fails is
// restarted from the last checkpoint after `restart_delay`; a revoked worker
// is not restarted.  In historical mode the runner returns once every owned
// partition reached end of input.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::stage::Stage;
use super::worker::{PartitionWorker, WorkerExit, WorkerSettings};
use crate::coordinator::{Coordinator, Lease};
use crate::errors::PipelineError;
use crate::log::{retry_upstream, Backoff, PartitionedLog};
use crate::metrics::{MetricsSnapshot, StageMetrics};
use crate::types::RunMode;

type StageFactory<S> = Arc<dyn Fn() -> S + Send + Sync>;

pub struct Runner<S: Stage> {
    factory: StageFactory<S>,
    coordinator: Coordinator,
    log: Arc<dyn PartitionedLog>,
    metrics: Arc<StageMetrics>,
    settings: Arc<WorkerSettings>,
}

impl<S: Stage> Runner<S> {
    pub fn new(
        factory: impl Fn() -> S + Send + Sync + 'static,
        coordinator: Coordinator,
        log: Arc<dyn PartitionedLog>,
        metrics: Arc<StageMetrics>,
        settings: Arc<WorkerSettings>,
    ) -> Self {
        Self {
            factory: Arc::new(factory),
            coordinator,
            log,
            metrics,
            settings,
        }
    }

    #[cfg(test)]
    pub fn metrics(&self) -> &Arc<StageMetrics> {
        &self.metrics
    }

    /// Join the group under a generated member id and run until shutdown (or
    /// end of input in historical mode).
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<MetricsSnapshot, PipelineError> {
        let member = self.coordinator.group().join();
        self.run_member(&member, shutdown).await
    }

    /// Run as an already chosen member id.
    #[cfg(test)]
    pub async fn run_as(
        &self,
        member: &str,
        shutdown: watch::Receiver<bool>,
    ) -> Result<MetricsSnapshot, PipelineError> {
        self.coordinator.group().join_as(member);
        self.run_member(member, shutdown).await
    }

    async fn run_member(
        &self,
        member: &str,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<MetricsSnapshot, PipelineError> {
        let group = Arc::clone(self.coordinator.group());
        if !self.ensure_topics(&mut shutdown).await? {
            group.leave(member);
            return Ok(self.metrics.snapshot());
        }
        info!(
            group = %group.group(),
            member,
            generation = group.generation(),
            input = %self.settings.input_topic,
            output = %self.settings.output_topic,
            mode = %self.settings.mode,
            "stage runner started"
        );

        let mut tasks: HashMap<u32, JoinHandle<WorkerExit>> = HashMap::new();
        let mut completed: HashSet<u32> = HashSet::new();

        loop {
            // ── Reap finished workers ───────────────────────────────────────
            let finished: Vec<u32> = tasks
                .iter()
                .filter(|(_, handle)| handle.is_finished())
                .map(|(partition, _)| *partition)
                .collect();
            for partition in finished {
                let Some(handle) = tasks.remove(&partition) else { continue };
                match handle.await {
                    Ok(WorkerExit::EndOfInput) => {
                        completed.insert(partition);
                    }
                    Ok(exit) => info!(partition, exit = ?exit, "worker finished"),
                    Err(e) => error!(partition, error = %e, "worker task panicked; respawning"),
                }
            }

            if *shutdown.borrow() {
                break;
            }

            // ── Spawn workers for newly owned partitions ────────────────────
            let leases = group.assignment(member);
            if self.settings.mode == RunMode::Historical
                && !leases.is_empty()
                && leases.iter().all(|l| completed.contains(&l.partition))
            {
                info!(member, partitions = leases.len(), "historical input fully processed");
                break;
            }
            for lease in leases {
                if tasks.contains_key(&lease.partition) || completed.contains(&lease.partition) {
                    continue;
                }
                let partition = lease.partition;
                tasks.insert(partition, tokio::spawn(self.supervise(lease, shutdown.clone())));
            }

            let poll_idle = self.settings.poll_idle;
            tokio::select! {
                _ = tokio::time::sleep(poll_idle) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        // ── Drain: every worker flushes and commits before we leave ─────────
        for result in join_all(tasks.into_values()).await {
            if let Err(e) = result {
                error!(error = %e, "worker task panicked during shutdown");
            }
        }
        group.leave(member);

        let snapshot = self.metrics.snapshot();
        info!(member, metrics = ?snapshot, "stage runner stopped");
        Ok(snapshot)
    }

    async fn ensure_topics(&self, shutdown: &mut watch::Receiver<bool>) -> Result<bool, PipelineError> {
        let partitions = self.coordinator.group().partitions();
        let mut backoff = Backoff::from_secs(self.settings.max_backoff_secs);
        for topic in [&self.settings.input_topic, &self.settings.output_topic] {
            let log = Arc::clone(&self.log);
            let created = retry_upstream(&mut backoff, shutdown, &self.metrics, || {
                log.create_topic(topic, partitions)
            })
            .await?;
            if created.is_none() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Worker task for one lease, restarted on failure.
    fn supervise(
        &self,
        lease: Lease,
        mut shutdown: watch::Receiver<bool>,
    ) -> impl std::future::Future<Output = WorkerExit> + Send + 'static {
        let factory = Arc::clone(&self.factory);
        let coordinator = self.coordinator.clone();
        let log = Arc::clone(&self.log);
        let metrics = Arc::clone(&self.metrics);
        let settings = Arc::clone(&self.settings);

        async move {
            loop {
                let worker = PartitionWorker::new(
                    factory(),
                    lease.clone(),
                    coordinator.clone(),
                    Arc::clone(&log),
                    Arc::clone(&metrics),
                    Arc::clone(&settings),
                    shutdown.clone(),
                );
                let err = match worker.run().await {
                    Ok(exit) => return exit,
                    Err(e) => e,
                };

                if !coordinator.group().is_current(&lease) {
                    warn!(partition = lease.partition, error = %err, "worker failed after revocation");
                    return WorkerExit::Revoked;
                }
                error!(
                    partition = lease.partition,
                    error = %err,
                    delay_ms = settings.restart_delay.as_millis() as u64,
                    "worker failed; restarting from last checkpoint"
                );
                if *shutdown.borrow() {
                    return WorkerExit::Shutdown;
                }
                tokio::select! {
                    _ = tokio::time::sleep(settings.restart_delay) => {}
                    _ = shutdown.changed() => return WorkerExit::Shutdown,
                }
            }
        }
    }
}
