//! Finished-task store - per-queue history of completed tasks
//!
//! Tasks are kept in completion order. When a record path is set, every
//! change yields a [`RecordUpdate`] snapshot; the caller hands it to the
//! queue's [`RecordWriter`] after releasing its locks, so no file I/O ever
//! happens under a lock. Updates carry a generation and stale ones are
//! dropped, so the file always ends up matching the latest state.

use super::task::{Task, TaskSummary};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// On-disk shape of the record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinishedRecord {
    pub queue: String,
    pub updated_at: DateTime<Utc>,
    pub tasks: Vec<Task>,
}

#[derive(Debug, Default)]
pub struct FinishedStore {
    tasks: Vec<Task>,
    record_path: Option<PathBuf>,
    generation: u64,
}

/// Change to apply to the on-disk record
#[derive(Debug)]
pub struct RecordUpdate {
    generation: u64,
    write: Option<(PathBuf, FinishedRecord)>,
    remove: Option<PathBuf>,
}

impl FinishedStore {
    /// In-memory only
    pub fn new() -> Self {
        Self::default()
    }

    /// Persisted to `record_path`
    pub fn with_record(record_path: PathBuf) -> Self {
        Self {
            record_path: Some(record_path),
            ..Self::default()
        }
    }

    /// Record file for a queue under a save directory
    pub fn record_path_for(save_path: &Path, queue: &str) -> PathBuf {
        save_path.join(format!("{}.finished.json", queue))
    }

    pub fn push(&mut self, task: Task, queue: &str) -> Option<RecordUpdate> {
        self.tasks.push(task);
        self.snapshot(queue, None)
    }

    pub fn summaries(&self) -> Vec<TaskSummary> {
        self.tasks.iter().map(Task::summary).collect()
    }

    pub fn get(&self, id: u32) -> Result<Task> {
        self.tasks
            .iter()
            .find(|t| t.id == id)
            .cloned()
            .ok_or_else(|| Error::no_such_task(id))
    }

    pub fn clear(&mut self, queue: &str) -> Option<RecordUpdate> {
        self.tasks.clear();
        self.snapshot(queue, None)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Follow a queue rename: the record moves to the new name's file
    pub fn relocate(&mut self, save_path: &Path, new: &str) -> Option<RecordUpdate> {
        let old = self.record_path.take()?;
        let target = Self::record_path_for(save_path, new);
        log::debug!("Finished record {} -> {}", old.display(), target.display());
        self.record_path = Some(target);
        self.snapshot(new, Some(old))
    }

    /// Drop the record file (queue deleted)
    pub fn discard_record(&mut self) -> Option<RecordUpdate> {
        let path = self.record_path.take()?;
        self.generation += 1;
        Some(RecordUpdate {
            generation: self.generation,
            write: None,
            remove: Some(path),
        })
    }

    /// Load a record written earlier
    pub fn load_record(path: &Path) -> Result<FinishedRecord> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    fn snapshot(&mut self, queue: &str, remove: Option<PathBuf>) -> Option<RecordUpdate> {
        let path = self.record_path.clone()?;
        self.generation += 1;
        Some(RecordUpdate {
            generation: self.generation,
            write: Some((
                path,
                FinishedRecord {
                    queue: queue.to_string(),
                    updated_at: Utc::now(),
                    tasks: self.tasks.clone(),
                },
            )),
            remove,
        })
    }
}

/// Applies record updates one at a time, newest wins
#[derive(Debug, Default)]
pub struct RecordWriter {
    applied: tokio::sync::Mutex<u64>,
}

impl RecordWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn apply(&self, update: RecordUpdate) {
        let mut applied = self.applied.lock().await;
        if update.generation <= *applied {
            log::debug!("Skipping stale finished record update {}", update.generation);
            return;
        }
        *applied = update.generation;

        if let Some(path) = &update.remove {
            match tokio::fs::remove_file(path).await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => log::warn!("Failed to remove finished record {}: {}", path.display(), e),
            }
        }
        if let Some((path, record)) = &update.write {
            if let Err(e) = write_record(path, record).await {
                log::warn!("Failed to save finished record {}: {}", path.display(), e);
            }
        }
    }
}

#[cfg(test)]
impl RecordWriter {
    /// Block every `apply` until the guard drops
    pub(crate) async fn stall(&self) -> tokio::sync::MutexGuard<'_, u64> {
        self.applied.lock().await
    }
}

async fn write_record(path: &Path, record: &FinishedRecord) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let json = serde_json::to_vec_pretty(record)?;
    tokio::fs::write(path, json).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::task::TaskSpec;
    use tempfile::TempDir;

    fn done(id: u32, code: i32) -> Task {
        let mut task = Task::new(id, TaskSpec::new("/bin/true"));
        task.mark_running();
        task.mark_done(code);
        task
    }

    #[test]
    fn test_completion_order_and_lookup() {
        let mut store = FinishedStore::new();
        assert!(store.push(done(2, 0), "q").is_none());
        store.push(done(0, 1), "q");

        let ids: Vec<u32> = store.summaries().iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![2, 0]);
        assert_eq!(store.get(0).unwrap().exit_code, Some(1));
        assert!(matches!(store.get(9), Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_record_written_and_cleared() {
        let temp_dir = TempDir::new().unwrap();
        let path = FinishedStore::record_path_for(temp_dir.path(), "build");
        let mut store = FinishedStore::with_record(path.clone());
        let writer = RecordWriter::new();

        writer.apply(store.push(done(0, 0), "build").unwrap()).await;
        let record = FinishedStore::load_record(&path).unwrap();
        assert_eq!(record.queue, "build");
        assert_eq!(record.tasks.len(), 1);

        writer.apply(store.clear("build").unwrap()).await;
        assert!(store.is_empty());
        assert!(FinishedStore::load_record(&path).unwrap().tasks.is_empty());
    }

    #[tokio::test]
    async fn test_stale_update_is_skipped() {
        let temp_dir = TempDir::new().unwrap();
        let path = FinishedStore::record_path_for(temp_dir.path(), "q");
        let mut store = FinishedStore::with_record(path.clone());
        let writer = RecordWriter::new();

        let older = store.push(done(0, 0), "q").unwrap();
        let newer = store.push(done(1, 0), "q").unwrap();
        writer.apply(newer).await;
        writer.apply(older).await;

        assert_eq!(FinishedStore::load_record(&path).unwrap().tasks.len(), 2);
    }

    #[tokio::test]
    async fn test_relocate_and_discard() {
        let temp_dir = TempDir::new().unwrap();
        let old = FinishedStore::record_path_for(temp_dir.path(), "a");
        let mut store = FinishedStore::with_record(old.clone());
        let writer = RecordWriter::new();
        writer.apply(store.push(done(0, 0), "a").unwrap()).await;

        writer
            .apply(store.relocate(temp_dir.path(), "b").unwrap())
            .await;
        let new = FinishedStore::record_path_for(temp_dir.path(), "b");
        assert!(!old.exists());
        let record = FinishedStore::load_record(&new).unwrap();
        assert_eq!(record.queue, "b");
        assert_eq!(record.tasks.len(), 1);

        writer.apply(store.discard_record().unwrap()).await;
        assert!(!new.exists());
        assert!(store.push(done(1, 0), "b").is_none());
    }
}
