use std::collections::HashMap;

use crate::handler::{HandlerId, HandlerRecord, HandlerState};
use crate::job::JobId;

/// Owns every handler record, indexed by handler id, process id and job id.
#[derive(Debug, Default)]
pub struct HandlerTable {
    records: HashMap<HandlerId, HandlerRecord>,
    by_pid: HashMap<u32, HandlerId>,
    by_job: HashMap<JobId, HandlerId>,
    next_id: u64,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of a record and assign it an id.
    pub fn insert(&mut self, mut record: HandlerRecord) -> HandlerId {
        self.next_id += 1;
        let id = HandlerId(self.next_id);
        record.id = id;
        if !record.job_id.is_unbound() {
            self.by_job.insert(record.job_id, id);
        }
        if record.pid != 0 {
            self.by_pid.insert(record.pid, id);
        }
        self.records.insert(id, record);
        id
    }

    pub fn get(&self, id: HandlerId) -> Option<&HandlerRecord> {
        self.records.get(&id)
    }

    pub fn get_mut(&mut self, id: HandlerId) -> Option<&mut HandlerRecord> {
        self.records.get_mut(&id)
    }

    pub fn find_by_pid(&self, pid: u32) -> Option<&HandlerRecord> {
        self.by_pid.get(&pid).and_then(|id| self.records.get(id))
    }

    pub fn find_by_job(&self, job_id: JobId) -> Option<&HandlerRecord> {
        self.by_job.get(&job_id).and_then(|id| self.records.get(id))
    }

    pub fn set_pid(&mut self, id: HandlerId, pid: u32) {
        if let Some(record) = self.records.get_mut(&id) {
            if record.pid != 0 {
                self.by_pid.remove(&record.pid);
            }
            record.pid = pid;
            if pid != 0 {
                self.by_pid.insert(pid, id);
            }
        }
    }

    /// Move the job index entry of a handler. No-op if unchanged.
    pub fn rebind(&mut self, id: HandlerId, job_id: JobId) {
        let Some(record) = self.records.get_mut(&id) else {
            return;
        };
        if record.job_id == job_id {
            return;
        }
        let previous = std::mem::replace(&mut record.job_id, job_id);
        if self.by_job.get(&previous) == Some(&id) {
            self.by_job.remove(&previous);
        }
        if !job_id.is_unbound() {
            self.by_job.insert(job_id, id);
        }
    }

    pub fn remove(&mut self, id: HandlerId) -> Option<HandlerRecord> {
        let record = self.records.remove(&id)?;
        if self.by_job.get(&record.job_id) == Some(&id) {
            self.by_job.remove(&record.job_id);
        }
        if record.pid != 0 && self.by_pid.get(&record.pid) == Some(&id) {
            self.by_pid.remove(&record.pid);
        }
        Some(record)
    }

    pub fn iter(&self) -> impl Iterator<Item = &HandlerRecord> {
        self.records.values()
    }

    pub fn ids(&self) -> Vec<HandlerId> {
        let mut ids: Vec<HandlerId> = self.records.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn count_in_state(&self, state: HandlerState) -> usize {
        self.records.values().filter(|r| r.state == state).count()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
