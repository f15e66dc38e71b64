use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value;

use super::{JobQueue, JobRecord, JobState};
use crate::errors::QueueError;

/// Queue stored as one JSON file per job under `pending/`, `done/` and
/// `failed/`. State changes are renames, so a record is always in exactly one
/// directory.
pub struct FileQueue {
    root: PathBuf,
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> QueueError + '_ {
    move |source| QueueError::Io {
        path: path.to_path_buf(),
        source,
    }
}

impl FileQueue {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn dir(&self, state: JobState) -> PathBuf {
        self.root.join(state.as_str())
    }

    fn path(&self, state: JobState, key: &str) -> PathBuf {
        self.dir(state).join(format!("{}.json", key))
    }

    pub fn load(path: &Path) -> Result<JobRecord, QueueError> {
        let content = fs::read_to_string(path).map_err(io_err(path))?;
        serde_json::from_str(&content).map_err(|source| QueueError::Corrupt {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Park an unreadable pending file under `failed/` so it stops blocking
    /// the queue.
    fn quarantine(&self, path: &Path) -> Result<(), QueueError> {
        let failed = self.dir(JobState::Failed);
        fs::create_dir_all(&failed).map_err(io_err(&failed))?;
        let name = path.file_name().map(PathBuf::from).unwrap_or_default();
        let target = failed.join(name);
        fs::rename(path, &target).map_err(io_err(path))
    }
}

impl JobQueue for FileQueue {
    fn add(&self, name: &str, kwargs: Value) -> Result<JobRecord, QueueError> {
        let job = JobRecord::new(name, kwargs);
        let tmp_dir = self.root.join("tmp");
        let pending = self.dir(JobState::Pending);
        fs::create_dir_all(&tmp_dir).map_err(io_err(&tmp_dir))?;
        fs::create_dir_all(&pending).map_err(io_err(&pending))?;

        let tmp = tmp_dir.join(format!("{}.json", job.key));
        let json = serde_json::to_vec_pretty(&job).map_err(|source| QueueError::Corrupt {
            path: tmp.clone(),
            source,
        })?;
        fs::write(&tmp, json).map_err(io_err(&tmp))?;
        let target = self.path(JobState::Pending, &job.key);
        fs::rename(&tmp, &target).map_err(io_err(&target))?;
        tracing::debug!(key = %job.key, "Queued job");
        Ok(job)
    }

    fn list(&self, state: JobState) -> Result<Vec<JobRecord>, QueueError> {
        let dir = self.dir(state);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut jobs = Vec::new();
        for entry in fs::read_dir(&dir).map_err(io_err(&dir))? {
            let path = entry.map_err(io_err(&dir))?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::load(&path) {
                Ok(job) => jobs.push(job),
                Err(e @ QueueError::Corrupt { .. }) if state == JobState::Pending => {
                    tracing::error!(error = %e, "Moving unreadable job to failed");
                    self.quarantine(&path)?;
                }
                Err(e) => return Err(e),
            }
        }
        jobs.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.key.cmp(&b.key)));
        Ok(jobs)
    }

    fn finish(&self, job: &JobRecord, state: JobState) -> Result<(), QueueError> {
        if state == JobState::Pending {
            return Ok(());
        }
        let from = self.path(JobState::Pending, &job.key);
        let dir = self.dir(state);
        fs::create_dir_all(&dir).map_err(io_err(&dir))?;
        fs::rename(&from, self.path(state, &job.key)).map_err(io_err(&from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_add_writes_pending_record() {
        let dir = tempfile::tempdir().unwrap();
        let queue = FileQueue::new(dir.path());
        let job = queue.add("update_user_project", json!({"changelog_id": 7})).unwrap();

        let path = dir.path().join("pending").join(format!("{}.json", job.key));
        assert_eq!(FileQueue::load(&path).unwrap(), job);
        assert_eq!(fs::read_dir(dir.path().join("tmp")).unwrap().count(), 0);
    }

    #[test]
    fn test_pending_is_ordered_by_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let queue = FileQueue::new(dir.path());
        let first = queue.add("a", json!({"n": 1})).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = queue.add("b", json!({"n": 2})).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let third = queue.add("a", json!({"n": 3})).unwrap();

        let keys: Vec<_> = queue.pending().unwrap().into_iter().map(|j| j.key).collect();
        assert_eq!(keys, [first.key, second.key, third.key]);
    }

    #[test]
    fn test_finish_moves_between_directories() {
        let dir = tempfile::tempdir().unwrap();
        let queue = FileQueue::new(dir.path());
        let ok = queue.add("a", json!({})).unwrap();
        let bad = queue.add("b", json!({})).unwrap();

        queue.finish(&ok, JobState::Done).unwrap();
        queue.finish(&bad, JobState::Failed).unwrap();

        assert!(queue.pending().unwrap().is_empty());
        assert_eq!(queue.list(JobState::Done).unwrap(), vec![ok]);
        assert_eq!(queue.list(JobState::Failed).unwrap(), vec![bad]);
    }

    #[test]
    fn test_finishing_twice_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let queue = FileQueue::new(dir.path());
        let job = queue.add("a", json!({})).unwrap();
        queue.finish(&job, JobState::Done).unwrap();
        assert!(matches!(
            queue.finish(&job, JobState::Failed),
            Err(QueueError::Io { .. })
        ));
    }

    #[test]
    fn test_corrupt_pending_record_is_quarantined() {
        let dir = tempfile::tempdir().unwrap();
        let queue = FileQueue::new(dir.path());
        let good = queue.add("a", json!({})).unwrap();
        fs::write(dir.path().join("pending").join("garbage.json"), "{not json").unwrap();

        assert_eq!(queue.pending().unwrap(), vec![good]);
        assert!(dir.path().join("failed").join("garbage.json").exists());
    }

    #[test]
    fn test_missing_root_lists_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let queue = FileQueue::new(dir.path().join("nope"));
        assert!(queue.pending().unwrap().is_empty());
    }
}
