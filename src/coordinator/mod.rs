// =============================================================================
// Partition / Offset Coordinator
// =============================================================================
//
// Binds workers to partitions (group membership), records durable progress
// (`commit`) and tells a newly assigned worker where to start (`resume`).
// Commits are fenced: only the current lease holder of a partition may write
// its checkpoint.  `GroupLock` keeps a second process off the same group.

pub mod checkpoint;
pub mod group;
pub mod lock;
pub mod partitioner;

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

pub use checkpoint::{Checkpoint, CheckpointStore, FileCheckpointStore};
#[cfg(test)]
pub use checkpoint::MemoryCheckpointStore;
pub use group::{GroupCoordinator, Lease};
pub use lock::GroupLock;
pub use partitioner::partition_for;

use crate::errors::PipelineError;

/// Group membership plus checkpoint storage for one consumer group.
#[derive(Clone)]
pub struct Coordinator {
    group: Arc<GroupCoordinator>,
    store: Arc<dyn CheckpointStore>,
}

impl Coordinator {
    pub fn new(group: Arc<GroupCoordinator>, store: Arc<dyn CheckpointStore>) -> Self {
        Self { group, store }
    }

    pub fn group(&self) -> &Arc<GroupCoordinator> {
        &self.group
    }

    /// Last committed checkpoint of `partition`, `None` for start of stream.
    pub fn resume(&self, partition: u32) -> Result<Option<Checkpoint>, PipelineError> {
        let checkpoint = self.store.load(self.group.group(), partition)?;
        match &checkpoint {
            Some(c) => info!(
                group = %self.group.group(),
                partition,
                position = c.position,
                committed_at = %c.committed_at,
                "resuming from checkpoint"
            ),
            None => info!(group = %self.group.group(), partition, "no checkpoint: starting at offset 0"),
        }
        Ok(checkpoint)
    }

    /// Durably record that `partition` may resume from `position`, with
    /// inputs processed up to `next_offset`.
    pub fn commit(
        &self,
        lease: &Lease,
        position: u64,
        next_offset: u64,
        progress: serde_json::Value,
    ) -> Result<(), PipelineError> {
        self.group.check(lease)?;
        let checkpoint = Checkpoint {
            partition: lease.partition,
            position,
            next_offset: next_offset.max(position),
            member: lease.member.clone(),
            generation: lease.generation,
            committed_at: Utc::now(),
            progress,
        };
        self.store.save(self.group.group(), &checkpoint)?;
        debug!(partition = lease.partition, position, "checkpoint committed");
        Ok(())
    }
}
