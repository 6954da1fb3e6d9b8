use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// `(cluster, proc)` job identifier.
///
/// [`JobId::UNBOUND`] (`-1.-1`) marks a claim or handler that is not bound to
/// any job, and doubles as the "pick a job for me" request when a claim is
/// handed to the job selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId {
    pub cluster: i32,
    pub proc: i32,
}

impl JobId {
    pub const UNBOUND: JobId = JobId {
        cluster: -1,
        proc: -1,
    };

    pub const fn new(cluster: i32, proc: i32) -> Self {
        Self { cluster, proc }
    }

    pub fn is_unbound(&self) -> bool {
        self.cluster < 0 || self.proc < 0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.cluster, self.proc)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseJobIdError(String);

impl fmt::Display for ParseJobIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid job id {:?}, expected <cluster>.<proc>", self.0)
    }
}

impl std::error::Error for ParseJobIdError {}

impl FromStr for JobId {
    type Err = ParseJobIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseJobIdError(s.to_string());
        let (cluster, proc) = s.trim().split_once('.').ok_or_else(err)?;
        Ok(JobId {
            cluster: cluster.parse().map_err(|_| err())?,
            proc: proc.parse().map_err(|_| err())?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_and_parse() {
        let id = JobId::new(10, 3);
        assert_eq!(id.to_string(), "10.3");
        assert_eq!("10.3".parse::<JobId>().unwrap(), id);
        assert!("10".parse::<JobId>().is_err());
        assert!("a.b".parse::<JobId>().is_err());
    }

    #[test]
    fn unbound_sentinel() {
        assert!(JobId::UNBOUND.is_unbound());
        assert!(JobId::new(5, -1).is_unbound());
        assert!(!JobId::new(5, 0).is_unbound());
    }

    #[test]
    fn ordering_is_cluster_then_proc() {
        let mut ids = vec![JobId::new(2, 0), JobId::new(1, 5), JobId::new(1, 0)];
        ids.sort();
        assert_eq!(ids, vec![JobId::new(1, 0), JobId::new(1, 5), JobId::new(2, 0)]);
    }
}
