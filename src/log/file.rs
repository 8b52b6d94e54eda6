// =============================================================================
// Directory-backed partitioned log (JSONL)
// =============================================================================
//
//   <root>/<topic>/partition-0000.jsonl
//   <root>/<topic>/partition-0001.jsonl
//   ...
//
// One record per line; the offset of a record is its line number.  A sparse
// index (byte position of every `INDEX_STRIDE`-th line start) is built lazily
// by streaming the file and extended when it grows, so records appended by
// another process become visible.  A read seeks to the nearest indexed line
// and skips forward.  A trailing line without '\n' is a write in progress and
// is not yet indexed.  The first access to a partition still scans the whole
// file once; there is no retention, so files grow without bound.
// =============================================================================

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tracing::info;

use super::{LogRecord, PartitionedLog};
use crate::coordinator::partition_for;
use crate::errors::PipelineError;

/// Lines between two index entries.
const INDEX_STRIDE: u64 = 1024;

#[derive(Debug)]
struct PartitionFile {
    path: PathBuf,
    stride: u64,
    /// Byte position of lines 0, stride, 2 * stride, ...
    sparse_starts: Vec<u64>,
    line_count: u64,
    indexed_len: u64,
    writer: Option<File>,
}

impl PartitionFile {
    fn new(path: PathBuf) -> Self {
        Self::with_stride(path, INDEX_STRIDE)
    }

    fn with_stride(path: PathBuf, stride: u64) -> Self {
        Self {
            path,
            stride: stride.max(1),
            sparse_starts: Vec::new(),
            line_count: 0,
            indexed_len: 0,
            writer: None,
        }
    }

    /// Account for a complete line starting at byte `start`.
    fn index_line(&mut self, start: u64) {
        if self.line_count % self.stride == 0 {
            self.sparse_starts.push(start);
        }
        self.line_count += 1;
    }

    /// Index any complete lines appended since the last refresh.
    fn refresh(&mut self) -> Result<()> {
        let file = File::open(&self.path)
            .with_context(|| format!("failed to open {}", self.path.display()))?;
        let len = file.metadata()?.len();
        if len <= self.indexed_len {
            return Ok(());
        }
        let mut reader = BufReader::new(file);
        reader.seek(SeekFrom::Start(self.indexed_len))?;

        let mut pos = self.indexed_len;
        while pos < len {
            let buf = reader.fill_buf()?;
            if buf.is_empty() {
                break;
            }
            let take = buf.len().min((len - pos) as usize);
            let newlines: Vec<usize> = buf[..take]
                .iter()
                .enumerate()
                .filter(|(_, byte)| **byte == b'\n')
                .map(|(i, _)| i)
                .collect();
            reader.consume(take);
            for i in newlines {
                let start = self.indexed_len;
                self.index_line(start);
                self.indexed_len = pos + i as u64 + 1;
            }
            pos += take as u64;
        }
        Ok(())
    }

    fn read(&mut self, from: u64, max: usize) -> Result<Vec<LogRecord>> {
        self.refresh()?;
        let total = self.line_count;
        if from >= total || max == 0 {
            return Ok(Vec::new());
        }
        let mut reader = BufReader::new(
            File::open(&self.path).with_context(|| format!("failed to open {}", self.path.display()))?,
        );
        let anchor = from / self.stride;
        reader.seek(SeekFrom::Start(self.sparse_starts[anchor as usize]))?;

        let mut line = Vec::new();
        for _ in anchor * self.stride..from {
            line.clear();
            reader.read_until(b'\n', &mut line)?;
        }

        let count = (total - from).min(max as u64);
        let mut records = Vec::with_capacity(count as usize);
        for offset in from..from + count {
            let mut line = Vec::new();
            reader.read_until(b'\n', &mut line)?;
            if line.last() == Some(&b'\n') {
                line.pop();
            }
            records.push(LogRecord { offset, payload: line });
        }
        Ok(records)
    }

    fn append(&mut self, payload: &[u8]) -> Result<u64> {
        self.refresh()?;
        if self.writer.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .with_context(|| format!("failed to open {} for append", self.path.display()))?;
            self.writer = Some(file);
        }
        let Some(writer) = self.writer.as_mut() else {
            anyhow::bail!("writer for {} not open", self.path.display());
        };

        let mut line = Vec::with_capacity(payload.len() + 1);
        line.extend_from_slice(payload);
        line.push(b'\n');
        writer
            .write_all(&line)
            .with_context(|| format!("failed to append to {}", self.path.display()))?;

        let offset = self.line_count;
        let start = self.indexed_len;
        self.index_line(start);
        self.indexed_len += line.len() as u64;
        Ok(offset)
    }

    fn sync(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer
                .sync_data()
                .with_context(|| format!("failed to sync {}", self.path.display()))?;
        }
        Ok(())
    }
}

/// Partitioned log stored as JSONL files under `root`.
pub struct FileLog {
    root: PathBuf,
    partitions: Mutex<HashMap<(String, u32), PartitionFile>>,
}

impl FileLog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            partitions: Mutex::new(HashMap::new()),
        }
    }

    fn topic_dir(&self, topic: &str) -> PathBuf {
        self.root.join(topic)
    }

    fn partition_path(&self, topic: &str, partition: u32) -> PathBuf {
        self.topic_dir(topic).join(format!("partition-{partition:04}.jsonl"))
    }

    fn count_partitions(dir: &Path) -> Result<u32> {
        let entries = std::fs::read_dir(dir)
            .with_context(|| format!("topic directory {} not found", dir.display()))?;
        let mut count = 0;
        for entry in entries {
            let name = entry?.file_name();
            let name = name.to_string_lossy();
            if name.starts_with("partition-") && name.ends_with(".jsonl") {
                count += 1;
            }
        }
        if count == 0 {
            anyhow::bail!("topic directory {} has no partitions", dir.display());
        }
        Ok(count)
    }

    fn with_partition<T>(
        &self,
        topic: &str,
        partition: u32,
        f: impl FnOnce(&mut PartitionFile) -> Result<T>,
    ) -> Result<T> {
        let path = self.partition_path(topic, partition);
        if !path.exists() {
            anyhow::bail!("partition {} does not exist", path.display());
        }
        let mut partitions = self.partitions.lock();
        let file = partitions
            .entry((topic.to_string(), partition))
            .or_insert_with(|| PartitionFile::new(path));
        f(file)
    }
}

fn unavailable(e: anyhow::Error) -> PipelineError {
    PipelineError::UpstreamUnavailable(format!("{e:#}"))
}

impl PartitionedLog for FileLog {
    fn create_topic(&self, topic: &str, partitions: u32) -> Result<(), PipelineError> {
        let dir = self.topic_dir(topic);
        let existing = Self::count_partitions(&dir).ok();
        if existing.is_some() {
            return Ok(());
        }
        (|| -> Result<()> {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create topic dir {}", dir.display()))?;
            for partition in 0..partitions.max(1) {
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(self.partition_path(topic, partition))?;
            }
            Ok(())
        })()
        .map_err(unavailable)?;
        info!(topic, partitions, root = %self.root.display(), "topic created");
        Ok(())
    }

    fn partition_count(&self, topic: &str) -> Result<u32, PipelineError> {
        Self::count_partitions(&self.topic_dir(topic)).map_err(unavailable)
    }

    fn read(
        &self,
        topic: &str,
        partition: u32,
        from: u64,
        max: usize,
    ) -> Result<Vec<LogRecord>, PipelineError> {
        self.with_partition(topic, partition, |p| p.read(from, max))
            .map_err(unavailable)
    }

    fn append(&self, topic: &str, key: &str, payload: &[u8]) -> Result<(u32, u64), PipelineError> {
        if payload.contains(&b'\n') {
            return Err(PipelineError::Malformed("payload contains a newline".into()));
        }
        let partitions = self.partition_count(topic)?;
        let partition = partition_for(key, partitions);
        let offset = self
            .with_partition(topic, partition, |p| p.append(payload))
            .map_err(unavailable)?;
        Ok((partition, offset))
    }

    fn end_offset(&self, topic: &str, partition: u32) -> Result<u64, PipelineError> {
        self.with_partition(topic, partition, |p| {
            p.refresh()?;
            Ok(p.line_count)
        })
        .map_err(unavailable)
    }

    fn flush(&self) -> Result<(), PipelineError> {
        let mut partitions = self.partitions.lock();
        for file in partitions.values_mut() {
            file.sync().map_err(unavailable)?;
        }
        Ok(())
    }
}
