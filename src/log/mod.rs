// =============================================================================
// Partitioned Log: the transport between stages
// =============================================================================
//
// Topics are split into partitions; each partition is an append-only sequence
// of records addressed by a dense offset starting at 0.  Records are routed
// to a partition by key (the pair) with the murmur2 partitioner.
//
// Two implementations:
//   - `MemoryLog`  volatile, for tests
//   - `FileLog`    one JSONL file per partition under a root directory
//
// I/O failures surface as `PipelineError::UpstreamUnavailable` and are retried
// with backoff by the worker.
// =============================================================================

pub mod backoff;
pub mod file;
#[cfg(test)]
pub mod memory;

pub use backoff::{retry_upstream, Backoff};
pub use file::FileLog;
#[cfg(test)]
pub use memory::MemoryLog;

use crate::errors::PipelineError;

/// One record read back from a partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub offset: u64,
    pub payload: Vec<u8>,
}

pub trait PartitionedLog: Send + Sync {
    /// Create `topic` with `partitions` partitions.  An existing topic keeps
    /// its partition count.
    fn create_topic(&self, topic: &str, partitions: u32) -> Result<(), PipelineError>;

    fn partition_count(&self, topic: &str) -> Result<u32, PipelineError>;

    /// Up to `max` records of `topic/partition` starting at offset `from`.
    fn read(
        &self,
        topic: &str,
        partition: u32,
        from: u64,
        max: usize,
    ) -> Result<Vec<LogRecord>, PipelineError>;

    /// Append `payload` to the partition chosen by `key`; returns
    /// `(partition, offset)`.
    fn append(&self, topic: &str, key: &str, payload: &[u8]) -> Result<(u32, u64), PipelineError>;

    /// Offset the next appended record of `topic/partition` will get.
    fn end_offset(&self, topic: &str, partition: u32) -> Result<u64, PipelineError>;

    /// Durability barrier for everything appended so far.
    fn flush(&self) -> Result<(), PipelineError>;
}
