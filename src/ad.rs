//! Attribute records ("ads").
//!
//! Jobs, resources and negotiation requests are all described by a flat map
//! from attribute name to JSON value. Expression-valued attributes (for
//! example `Requirements`) are stored as strings and handed to an
//! [`Evaluator`](crate::policy::Evaluator).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Well-known attribute names.
pub mod attr {
    pub const CLUSTER_ID: &str = "ClusterId";
    pub const PROC_ID: &str = "ProcId";
    pub const OWNER: &str = "Owner";
    pub const JOB_UNIVERSE: &str = "JobUniverse";
    pub const JOB_PRIO: &str = "JobPrio";
    pub const REQUIREMENTS: &str = "Requirements";
    pub const RANK: &str = "Rank";
    pub const CURRENT_RANK: &str = "CurrentRank";
    pub const REMOTE_HOST: &str = "RemoteHost";
    pub const PARTITIONABLE_SLOT: &str = "PartitionableSlot";
    pub const NEXT_JOB_START_DELAY: &str = "NextJobStartDelay";
    pub const JOB_LEASE_DURATION: &str = "JobLeaseDuration";
    pub const AUTOCLUSTER_ID: &str = "AutoClusterId";
    pub const SCHEDD_NAME: &str = "ScheddName";
    pub const SUBMITTER_TAG: &str = "SubmitterTag";
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ad(BTreeMap<String, Value>);

impl Ad {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: &str, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(name.to_string(), value.into())
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.0.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.0.get(name).and_then(Value::as_str)
    }

    pub fn get_i64(&self, name: &str) -> Option<i64> {
        match self.0.get(name)? {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn get_f64(&self, name: &str) -> Option<f64> {
        match self.0.get(name)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        match self.0.get(name)? {
            Value::Bool(b) => Some(*b),
            Value::String(s) if s.eq_ignore_ascii_case("true") => Some(true),
            Value::String(s) if s.eq_ignore_ascii_case("false") => Some(false),
            _ => None,
        }
    }

    /// Copy every attribute of `other` into this ad, overwriting on conflict.
    pub fn merge(&mut self, other: &Ad) {
        for (k, v) in &other.0 {
            self.0.insert(k.clone(), v.clone());
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.0).unwrap_or_else(|_| "{}".to_string())
    }

    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        if s.trim().is_empty() {
            return Ok(Self::new());
        }
        serde_json::from_str(s)
    }

    /// Render an attribute value the way it appears in an autocluster
    /// signature or a macro substitution.
    pub fn render(&self, name: &str) -> Option<String> {
        self.0.get(name).map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }
}

/// Resolve `$$(Name)` references in string attributes of `job_ad` against
/// `match_ad`. Unresolvable references are left untouched.
pub fn expand_macros(job_ad: &Ad, match_ad: &Ad) -> Ad {
    let mut out = job_ad.clone();
    for (_, value) in out.0.iter_mut() {
        if let Value::String(s) = value {
            if s.contains("$$(") {
                *s = substitute(s, match_ad);
            }
        }
    }
    out
}

fn substitute(input: &str, match_ad: &Ad) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("$$(") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 3..];
        match after.find(')') {
            Some(end) => {
                let name = &after[..end];
                match match_ad.render(name) {
                    Some(v) => out.push_str(&v),
                    None => {
                        out.push_str("$$(");
                        out.push_str(name);
                        out.push(')');
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_getters_accept_numeric_strings() {
        let ad = Ad::new()
            .with("RequestCpus", 4)
            .with("RequestMemory", "2048")
            .with("Weight", 1.5)
            .with("WantIt", "TRUE");
        assert_eq!(ad.get_i64("RequestCpus"), Some(4));
        assert_eq!(ad.get_i64("RequestMemory"), Some(2048));
        assert_eq!(ad.get_f64("Weight"), Some(1.5));
        assert_eq!(ad.get_bool("WantIt"), Some(true));
        assert_eq!(ad.get_str("Missing"), None);
    }

    #[test]
    fn json_round_trip_preserves_values() {
        let ad = Ad::new().with("Owner", "alice").with("JobPrio", 5);
        let parsed = Ad::from_json(&ad.to_json()).unwrap();
        assert_eq!(parsed, ad);
        assert!(Ad::from_json("").unwrap().is_empty());
    }

    #[test]
    fn macros_expand_from_match_ad() {
        let job = Ad::new()
            .with("Cmd", "/opt/$$(Arch)/bin/run")
            .with("Args", "--mem $$(Memory) --x $$(Unknown)")
            .with("Plain", "no macros");
        let slot = Ad::new().with("Arch", "x86_64").with("Memory", 8192);
        let expanded = expand_macros(&job, &slot);
        assert_eq!(expanded.get_str("Cmd"), Some("/opt/x86_64/bin/run"));
        assert_eq!(
            expanded.get_str("Args"),
            Some("--mem 8192 --x $$(Unknown)")
        );
        assert_eq!(expanded.get_str("Plain"), Some("no macros"));
    }

    #[test]
    fn unterminated_macro_is_left_alone() {
        let job = Ad::new().with("Cmd", "run $$(Arch");
        let expanded = expand_macros(&job, &Ad::new().with("Arch", "arm"));
        assert_eq!(expanded.get_str("Cmd"), Some("run $$(Arch"));
    }

    #[test]
    fn merge_overwrites() {
        let mut a = Ad::new().with("A", 1).with("B", 2);
        a.merge(&Ad::new().with("B", 3).with("C", 4));
        assert_eq!(a.get_i64("B"), Some(3));
        assert_eq!(a.len(), 3);
    }
}
