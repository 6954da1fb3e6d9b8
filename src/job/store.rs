use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedError};
use crate::job::{Job, JobId, JobStatus};

const DEFAULT_MAX_JOBS: usize = 10_000;

/// Durable job records, as seen by the scheduler core.
///
/// Mutations made through [`JobStore::get_mut`] are only guaranteed durable
/// after [`JobStore::commit`].
pub trait JobStore: Send {
    fn get(&self, id: JobId) -> Option<&Job>;

    fn get_mut(&mut self, id: JobId) -> Option<&mut Job>;

    /// Insert a job. An unbound id is replaced with a freshly allocated one.
    fn submit(&mut self, job: Job) -> Result<JobId>;

    /// Delete the record outright. Returns the removed job, if any.
    fn delete(&mut self, id: JobId) -> Option<Job>;

    /// All jobs in id order.
    fn jobs(&self) -> Box<dyn Iterator<Item = &Job> + '_>;

    fn commit(&mut self) -> Result<()>;
}

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    next_cluster: i32,
    jobs: Vec<Job>,
}

/// In-memory job queue with an optional JSON snapshot file.
#[derive(Debug)]
pub struct JobQueue {
    jobs: BTreeMap<JobId, Job>,
    max_jobs: usize,
    next_cluster: i32,
    snapshot_path: Option<PathBuf>,
    dirty: bool,
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl JobQueue {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_JOBS)
    }

    pub fn with_capacity(max_jobs: usize) -> Self {
        Self {
            jobs: BTreeMap::new(),
            max_jobs,
            next_cluster: 1,
            snapshot_path: None,
            dirty: false,
        }
    }

    /// Open a queue backed by `path`, loading its contents if the file exists.
    pub fn open(path: impl Into<PathBuf>, max_jobs: usize) -> Result<Self> {
        let path = path.into();
        let mut queue = Self::with_capacity(max_jobs);
        if path.exists() {
            let data = fs::read(&path)?;
            let snapshot: Snapshot = serde_json::from_slice(&data)
                .map_err(|e| SchedError::Store(format!("{}: {e}", path.display())))?;
            queue.next_cluster = snapshot.next_cluster.max(1);
            for job in snapshot.jobs {
                queue.next_cluster = queue.next_cluster.max(job.id.cluster + 1);
                queue.jobs.insert(job.id, job);
            }
            tracing::info!(path = %path.display(), jobs = queue.jobs.len(), "Loaded job queue");
        }
        queue.snapshot_path = Some(path);
        Ok(queue)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.jobs.len() >= self.max_jobs
    }

    pub fn count_with_status(&self, status: JobStatus) -> usize {
        self.jobs.values().filter(|j| j.status == status).count()
    }

    fn write_snapshot(&self, path: &Path) -> Result<()> {
        let snapshot = Snapshot {
            next_cluster: self.next_cluster,
            jobs: self.jobs.values().cloned().collect(),
        };
        let data = serde_json::to_vec_pretty(&snapshot)
            .map_err(|e| SchedError::Store(e.to_string()))?;
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, data)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

impl JobStore for JobQueue {
    fn get(&self, id: JobId) -> Option<&Job> {
        self.jobs.get(&id)
    }

    fn get_mut(&mut self, id: JobId) -> Option<&mut Job> {
        let job = self.jobs.get_mut(&id);
        if job.is_some() {
            self.dirty = true;
        }
        job
    }

    fn submit(&mut self, mut job: Job) -> Result<JobId> {
        if self.is_full() {
            return Err(SchedError::QueueFull);
        }
        if job.id.is_unbound() {
            job.id = JobId::new(self.next_cluster, 0);
        }
        self.next_cluster = self.next_cluster.max(job.id.cluster + 1);
        let id = job.id;
        self.jobs.insert(id, job);
        self.dirty = true;
        Ok(id)
    }

    fn delete(&mut self, id: JobId) -> Option<Job> {
        let job = self.jobs.remove(&id);
        if job.is_some() {
            self.dirty = true;
        }
        job
    }

    fn jobs(&self) -> Box<dyn Iterator<Item = &Job> + '_> {
        Box::new(self.jobs.values())
    }

    fn commit(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        if let Some(path) = &self.snapshot_path {
            self.write_snapshot(path)?;
        }
        self.dirty = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Universe;

    fn job(owner: &str) -> Job {
        Job::new(JobId::UNBOUND, owner, Universe::Vanilla)
    }

    #[test]
    fn submit_allocates_increasing_clusters() {
        let mut queue = JobQueue::new();
        let a = queue.submit(job("alice")).unwrap();
        let b = queue.submit(job("bob")).unwrap();
        assert_eq!(a, JobId::new(1, 0));
        assert_eq!(b, JobId::new(2, 0));
        assert_eq!(queue.get(a).unwrap().owner, "alice");
    }

    #[test]
    fn explicit_ids_are_kept() {
        let mut queue = JobQueue::new();
        let id = queue
            .submit(Job::new(JobId::new(40, 2), "alice", Universe::Vanilla))
            .unwrap();
        assert_eq!(id, JobId::new(40, 2));
        assert_eq!(queue.submit(job("bob")).unwrap(), JobId::new(41, 0));
    }

    #[test]
    fn capacity_is_enforced() {
        let mut queue = JobQueue::with_capacity(1);
        queue.submit(job("alice")).unwrap();
        assert!(queue.is_full());
        assert!(matches!(queue.submit(job("bob")), Err(SchedError::QueueFull)));
    }

    #[test]
    fn delete_is_idempotent() {
        let mut queue = JobQueue::new();
        let id = queue.submit(job("alice")).unwrap();
        assert!(queue.delete(id).is_some());
        assert!(queue.delete(id).is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn snapshot_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job_queue.json");

        let mut queue = JobQueue::open(&path, 100).unwrap();
        let id = queue.submit(job("alice")).unwrap();
        queue.get_mut(id).unwrap().set_status(JobStatus::Held);
        queue.commit().unwrap();

        let reopened = JobQueue::open(&path, 100).unwrap();
        assert_eq!(reopened.len(), 1);
        assert_eq!(reopened.get(id).unwrap().status, JobStatus::Held);
        assert_eq!(reopened.count_with_status(JobStatus::Held), 1);
    }

    #[test]
    fn reopened_queue_continues_id_allocation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job_queue.json");

        let mut queue = JobQueue::open(&path, 100).unwrap();
        queue.submit(job("alice")).unwrap();
        queue.submit(job("alice")).unwrap();
        queue.commit().unwrap();

        let mut reopened = JobQueue::open(&path, 100).unwrap();
        assert_eq!(reopened.submit(job("bob")).unwrap(), JobId::new(3, 0));
    }
}
