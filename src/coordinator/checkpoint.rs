// =============================================================================
// Checkpoint store: durable per-partition progress
// =============================================================================
//
// A checkpoint records, for one `(consumer group, partition)`:
//   - `position`: the next input offset to read on resume (every output
//     derived from inputs before it has been flushed to the output log)
//   - the stage's replay-relevant progress (watermarks, last emitted keys)
//
// The file store writes `<dir>/<group>/partition-NNNN.json` atomically: the
// tmp file is fsynced before the rename and the directory after it, so
// neither a crash nor a power loss leaves a torn or empty checkpoint.
// =============================================================================

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::PipelineError;

/// Committed progress of one partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub partition: u32,
    /// Next input offset to process on resume.
    pub position: u64,
    /// Input offset processed up to when the checkpoint was taken.  Records in
    /// `[position, next_offset)` are replays on resume.
    #[serde(default)]
    pub next_offset: u64,
    pub member: String,
    pub generation: u64,
    pub committed_at: DateTime<Utc>,
    /// Stage-specific progress snapshot.
    #[serde(default)]
    pub progress: serde_json::Value,
}

/// Durable storage of checkpoints, one writer per partition.
pub trait CheckpointStore: Send + Sync {
    fn load(&self, group: &str, partition: u32) -> Result<Option<Checkpoint>, PipelineError>;

    fn save(&self, group: &str, checkpoint: &Checkpoint) -> Result<(), PipelineError>;
}

// ---------------------------------------------------------------------------
// FileCheckpointStore
// ---------------------------------------------------------------------------

pub struct FileCheckpointStore {
    root: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path(&self, group: &str, partition: u32) -> PathBuf {
        self.root.join(group).join(format!("partition-{partition:04}.json"))
    }

    fn read(path: &Path) -> Result<Option<Checkpoint>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read checkpoint {}", path.display()))?;
        let checkpoint = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse checkpoint {}", path.display()))?;
        Ok(Some(checkpoint))
    }

    fn write(path: &Path, checkpoint: &Checkpoint) -> Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create checkpoint dir {}", dir.display()))?;
        }
        let content =
            serde_json::to_string_pretty(checkpoint).context("failed to serialise checkpoint")?;

        // Atomic write: write and sync a temporary sibling file, then rename.
        let tmp_path = path.with_extension("json.tmp");
        let mut tmp = File::create(&tmp_path)
            .with_context(|| format!("failed to create tmp checkpoint {}", tmp_path.display()))?;
        tmp.write_all(content.as_bytes())
            .with_context(|| format!("failed to write tmp checkpoint {}", tmp_path.display()))?;
        tmp.sync_all()
            .with_context(|| format!("failed to sync tmp checkpoint {}", tmp_path.display()))?;
        drop(tmp);

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp checkpoint to {}", path.display()))?;
        if let Some(dir) = path.parent() {
            sync_dir(dir)?;
        }
        Ok(())
    }
}

/// Persist a rename by syncing the directory entry.
#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)
        .and_then(|d| d.sync_all())
        .with_context(|| format!("failed to sync checkpoint dir {}", dir.display()))
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}

impl CheckpointStore for FileCheckpointStore {
    fn load(&self, group: &str, partition: u32) -> Result<Option<Checkpoint>, PipelineError> {
        Self::read(&self.path(group, partition)).map_err(|e| PipelineError::Checkpoint(format!("{e:#}")))
    }

    fn save(&self, group: &str, checkpoint: &Checkpoint) -> Result<(), PipelineError> {
        Self::write(&self.path(group, checkpoint.partition), checkpoint)
            .map_err(|e| PipelineError::Checkpoint(format!("{e:#}")))
    }
}

// ---------------------------------------------------------------------------
// MemoryCheckpointStore
// ---------------------------------------------------------------------------

#[cfg(test)]
pub use memory::MemoryCheckpointStore;

#[cfg(test)]
mod memory {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};

    use parking_lot::Mutex;

    use super::{Checkpoint, CheckpointStore};
    use crate::errors::PipelineError;

    /// Volatile store for tests.  Writes can be made to fail.
    #[derive(Default)]
    pub struct MemoryCheckpointStore {
        entries: Mutex<HashMap<(String, u32), Checkpoint>>,
        fail_writes: AtomicBool,
    }

    impl MemoryCheckpointStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set_fail_writes(&self, fail: bool) {
            self.fail_writes.store(fail, Ordering::SeqCst);
        }
    }

    impl CheckpointStore for MemoryCheckpointStore {
        fn load(&self, group: &str, partition: u32) -> Result<Option<Checkpoint>, PipelineError> {
            Ok(self.entries.lock().get(&(group.to_string(), partition)).cloned())
        }

        fn save(&self, group: &str, checkpoint: &Checkpoint) -> Result<(), PipelineError> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(PipelineError::Checkpoint("store unavailable".into()));
            }
            self.entries
                .lock()
                .insert((group.to_string(), checkpoint.partition), checkpoint.clone());
            Ok(())
        }
    }
}
