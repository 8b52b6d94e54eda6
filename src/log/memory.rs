use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;

use super::{LogRecord, PartitionedLog};
use crate::coordinator::partition_for;
use crate::errors::PipelineError;

/// Volatile partitioned log.  `set_available(false)` simulates an unreachable
/// broker: every call fails with `UpstreamUnavailable` until re-enabled.
pub struct MemoryLog {
    topics: RwLock<HashMap<String, Vec<Vec<Vec<u8>>>>>,
    available: AtomicBool,
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> Result<(), PipelineError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(PipelineError::UpstreamUnavailable("memory log offline".into()))
        }
    }

    /// Every payload of `topic/partition`, in offset order.
    pub fn payloads(&self, topic: &str, partition: u32) -> Vec<Vec<u8>> {
        self.topics
            .read()
            .get(topic)
            .and_then(|parts| parts.get(partition as usize))
            .cloned()
            .unwrap_or_default()
    }

    /// Every payload of `topic`, partition by partition.
    pub fn all_payloads(&self, topic: &str) -> Vec<Vec<u8>> {
        self.topics
            .read()
            .get(topic)
            .map(|parts| parts.iter().flatten().cloned().collect())
            .unwrap_or_default()
    }
}

fn unknown_topic(topic: &str) -> PipelineError {
    PipelineError::UpstreamUnavailable(format!("unknown topic {topic}"))
}

impl PartitionedLog for MemoryLog {
    fn create_topic(&self, topic: &str, partitions: u32) -> Result<(), PipelineError> {
        self.ensure_available()?;
        self.topics
            .write()
            .entry(topic.to_string())
            .or_insert_with(|| vec![Vec::new(); partitions.max(1) as usize]);
        Ok(())
    }

    fn partition_count(&self, topic: &str) -> Result<u32, PipelineError> {
        self.ensure_available()?;
        self.topics
            .read()
            .get(topic)
            .map(|parts| parts.len() as u32)
            .ok_or_else(|| unknown_topic(topic))
    }

    fn read(
        &self,
        topic: &str,
        partition: u32,
        from: u64,
        max: usize,
    ) -> Result<Vec<LogRecord>, PipelineError> {
        self.ensure_available()?;
        let topics = self.topics.read();
        let records = topics
            .get(topic)
            .and_then(|parts| parts.get(partition as usize))
            .ok_or_else(|| unknown_topic(topic))?;
        Ok(records
            .iter()
            .enumerate()
            .skip(from as usize)
            .take(max)
            .map(|(offset, payload)| LogRecord {
                offset: offset as u64,
                payload: payload.clone(),
            })
            .collect())
    }

    fn append(&self, topic: &str, key: &str, payload: &[u8]) -> Result<(u32, u64), PipelineError> {
        self.ensure_available()?;
        let mut topics = self.topics.write();
        let parts = topics.get_mut(topic).ok_or_else(|| unknown_topic(topic))?;
        let partition = partition_for(key, parts.len() as u32);
        let records = &mut parts[partition as usize];
        records.push(payload.to_vec());
        Ok((partition, records.len() as u64 - 1))
    }

    fn end_offset(&self, topic: &str, partition: u32) -> Result<u64, PipelineError> {
        self.ensure_available()?;
        self.topics
            .read()
            .get(topic)
            .and_then(|parts| parts.get(partition as usize))
            .map(|records| records.len() as u64)
            .ok_or_else(|| unknown_topic(topic))
    }

    fn flush(&self) -> Result<(), PipelineError> {
        self.ensure_available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_routes_by_key_and_reads_back() {
        let log = MemoryLog::new();
        log.create_topic("trades", 4).unwrap();
        let (p1, o1) = log.append("trades", "BTC/USD", b"a").unwrap();
        let (p2, o2) = log.append("trades", "BTC/USD", b"b").unwrap();
        assert_eq!(p1, 1);
        assert_eq!(p1, p2);
        assert_eq!((o1, o2), (0, 1));

        let records = log.read("trades", 1, 1, 10).unwrap();
        assert_eq!(records, vec![LogRecord { offset: 1, payload: b"b".to_vec() }]);
        assert_eq!(log.end_offset("trades", 1).unwrap(), 2);
        assert!(log.read("trades", 0, 0, 10).unwrap().is_empty());
    }

    #[test]
    fn create_topic_keeps_existing_partitions() {
        let log = MemoryLog::new();
        log.create_topic("candles", 2).unwrap();
        log.create_topic("candles", 8).unwrap();
        assert_eq!(log.partition_count("candles").unwrap(), 2);
    }

    #[test]
    fn offline_log_is_upstream_unavailable() {
        let log = MemoryLog::new();
        log.create_topic("trades", 1).unwrap();
        log.set_available(false);
        let err = log.read("trades", 0, 0, 1).unwrap_err();
        assert!(err.is_retryable());
        log.set_available(true);
        assert!(log.read("trades", 0, 0, 1).is_ok());
    }
}
