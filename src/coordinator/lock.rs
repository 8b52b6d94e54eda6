// =============================================================================
// Group lock: one process per consumer group
// =============================================================================
//
// Membership and fencing live in memory, so two processes running the same
// group would each own every partition.  The first process takes an exclusive
// OS lock on `<checkpoint dir>/<group>/group.lock` and keeps it until exit;
// the lock is released by the OS if the process dies.  A second process fails
// to start and reports the holder recorded in the file.
// =============================================================================

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::errors::PipelineError;

#[derive(Debug, Serialize, Deserialize)]
struct LockHolder {
    pid: u32,
    acquired_at: DateTime<Utc>,
}

/// Held for the life of the process; dropping it releases the group.
#[derive(Debug)]
pub struct GroupLock {
    _file: File,
}

impl GroupLock {
    pub fn acquire(root: &Path, group: &str) -> Result<Self, PipelineError> {
        let dir = root.join(group);
        std::fs::create_dir_all(&dir)
            .map_err(|e| PipelineError::Checkpoint(format!("failed to create {}: {e}", dir.display())))?;
        let path = dir.join("group.lock");
        let io_err = |e: std::io::Error| PipelineError::Checkpoint(format!("group lock {}: {e}", path.display()));

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(io_err)?;

        if let Err(e) = file.try_lock_exclusive() {
            if e.kind() != fs2::lock_contended_error().kind() {
                return Err(io_err(e));
            }
            return Err(PipelineError::GroupBusy {
                group: group.to_string(),
                holder: describe_holder(&mut file),
            });
        }

        let holder = LockHolder {
            pid: std::process::id(),
            acquired_at: Utc::now(),
        };
        let content = serde_json::to_vec(&holder)
            .map_err(|e| PipelineError::Checkpoint(format!("failed to serialise lock holder: {e}")))?;
        file.set_len(0).map_err(io_err)?;
        file.seek(SeekFrom::Start(0)).map_err(io_err)?;
        file.write_all(&content).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;

        info!(group, pid = holder.pid, lock = %path.display(), "consumer group lock acquired");
        Ok(Self { _file: file })
    }
}

fn describe_holder(file: &mut File) -> String {
    let mut raw = String::new();
    if file.read_to_string(&mut raw).is_err() {
        return "holder unknown".to_string();
    }
    match serde_json::from_str::<LockHolder>(&raw) {
        Ok(h) => format!("pid {} since {}", h.pid, h.acquired_at.to_rfc3339()),
        Err(_) => "holder unknown".to_string(),
    }
}
