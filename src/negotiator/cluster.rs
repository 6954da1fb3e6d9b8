use std::collections::HashMap;

use crate::ad::{attr, Ad};
use crate::job::{Job, JobId};

/// Stable autocluster ids keyed by resource signature.
///
/// A signature is the owner, the universe and the rendered values of the
/// significant attributes. Jobs whose universe cannot share a queue slot
/// always get a signature of their own.
#[derive(Debug, Default)]
pub struct AutoclusterIndex {
    ids: HashMap<String, u64>,
    next_id: u64,
}

impl AutoclusterIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signature(job: &Job, significant: &[String]) -> String {
        let mut sig = format!("{}|{}", job.owner, job.universe);
        if !job.universe.can_share_queue_slot() {
            sig.push_str(&format!("|job={}", job.id));
        }
        for name in significant {
            let value = job.ad.render(name).unwrap_or_default();
            sig.push_str(&format!("|{name}={value}"));
        }
        sig
    }

    pub fn id_for(&mut self, job: &Job, significant: &[String]) -> u64 {
        let sig = Self::signature(job, significant);
        let next = &mut self.next_id;
        *self.ids.entry(sig).or_insert_with(|| {
            *next += 1;
            *next
        })
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Jobs sharing one autocluster, best job first.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceRequestCluster {
    pub autocluster_id: u64,
    /// Representative request ad: the best job's attributes.
    pub ad: Ad,
    pub jobs: Vec<JobId>,
}

impl ResourceRequestCluster {
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn remove(&mut self, job_id: JobId) -> bool {
        match self.jobs.iter().position(|j| *j == job_id) {
            Some(pos) => {
                self.jobs.remove(pos);
                true
            }
            None => false,
        }
    }
}

/// Group `jobs` into request clusters, ordered by job priority (highest
/// first) and then by job id.
pub fn build_clusters<'a>(
    jobs: impl IntoIterator<Item = &'a Job>,
    index: &mut AutoclusterIndex,
    significant: &[String],
) -> Vec<ResourceRequestCluster> {
    let mut sorted: Vec<&Job> = jobs.into_iter().collect();
    sorted.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));

    let mut order: Vec<u64> = Vec::new();
    let mut clusters: HashMap<u64, ResourceRequestCluster> = HashMap::new();
    for job in sorted {
        let autocluster_id = index.id_for(job, significant);
        clusters
            .entry(autocluster_id)
            .or_insert_with(|| {
                order.push(autocluster_id);
                let mut ad = job.full_ad();
                ad.insert(attr::AUTOCLUSTER_ID, autocluster_id);
                ResourceRequestCluster {
                    autocluster_id,
                    ad,
                    jobs: Vec::new(),
                }
            })
            .jobs
            .push(job.id);
    }
    order
        .into_iter()
        .filter_map(|id| clusters.remove(&id))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Universe;

    fn significant() -> Vec<String> {
        vec!["RequestCpus".to_string(), "RequestMemory".to_string()]
    }

    fn job(cluster: i32, proc: i32, cpus: i64, prio: i32) -> Job {
        Job::new(JobId::new(cluster, proc), "alice", Universe::Vanilla)
            .with_ad(Ad::new().with("RequestCpus", cpus).with("RequestMemory", 1024))
            .with_priority(prio)
    }

    #[test]
    fn identical_jobs_share_an_autocluster() {
        let jobs = vec![job(10, 0, 1, 0), job(10, 1, 1, 0), job(11, 0, 4, 0)];
        let mut index = AutoclusterIndex::new();
        let clusters = build_clusters(&jobs, &mut index, &significant());
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].jobs, vec![JobId::new(10, 0), JobId::new(10, 1)]);
        assert_eq!(clusters[1].jobs, vec![JobId::new(11, 0)]);
        assert_eq!(
            clusters[0].ad.get_i64(attr::AUTOCLUSTER_ID),
            Some(clusters[0].autocluster_id as i64)
        );
    }

    #[test]
    fn higher_priority_clusters_come_first() {
        let jobs = vec![job(10, 0, 1, 0), job(11, 0, 4, 5)];
        let mut index = AutoclusterIndex::new();
        let clusters = build_clusters(&jobs, &mut index, &significant());
        assert_eq!(clusters[0].jobs, vec![JobId::new(11, 0)]);
    }

    #[test]
    fn autocluster_ids_are_stable_across_builds() {
        let jobs = vec![job(10, 0, 1, 0), job(11, 0, 4, 0)];
        let mut index = AutoclusterIndex::new();
        let first = build_clusters(&jobs, &mut index, &significant());
        let second = build_clusters(&jobs[1..], &mut index, &significant());
        assert_eq!(first[1].autocluster_id, second[0].autocluster_id);
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn parallel_jobs_never_share() {
        let a = Job::new(JobId::new(1, 0), "alice", Universe::Parallel);
        let b = Job::new(JobId::new(1, 1), "alice", Universe::Parallel);
        let mut index = AutoclusterIndex::new();
        assert_ne!(
            index.id_for(&a, &significant()),
            index.id_for(&b, &significant())
        );
    }

    #[test]
    fn owners_do_not_mix() {
        let a = job(1, 0, 1, 0);
        let mut b = job(2, 0, 1, 0);
        b.owner = "bob".to_string();
        let mut index = AutoclusterIndex::new();
        assert_ne!(
            index.id_for(&a, &significant()),
            index.id_for(&b, &significant())
        );
    }
}
