use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::JobId;

/// Job environment as declared by the pipeline.
///
/// Keys are unique; inserting an existing key replaces its value. Iteration
/// order is sorted by key so snapshots written from it are deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobEnv(pub BTreeMap<String, String>);

impl JobEnv {
    /// Create an empty environment.
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Insert a key, returning the previous value if any.
    pub fn insert<K, V>(&mut self, key: K, value: V) -> Option<String>
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.0.insert(key.into(), value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    /// Iterate over all key–value pairs in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K, V> FromIterator<(K, V)> for JobEnv
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// A unit of work accepted from the control plane.
///
/// Immutable once execution begins; state transitions are observed remotely
/// through [`crate::JobState`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Environment declared by the pipeline for this job.
    #[serde(default)]
    pub env: JobEnv,
    /// Upper bound for a single uploaded log chunk.
    #[serde(default = "default_chunks_max_size_bytes")]
    pub chunks_max_size_bytes: u64,
    /// Upper bound for the whole uploaded log.
    #[serde(default = "default_log_max_size_bytes")]
    pub log_max_size_bytes: u64,
    /// Seconds between cancellation polls; `None` uses the agent default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_interval: Option<u64>,
}

impl Job {
    pub fn new(id: impl Into<JobId>) -> Self {
        Self {
            id: id.into(),
            env: JobEnv::new(),
            chunks_max_size_bytes: default_chunks_max_size_bytes(),
            log_max_size_bytes: default_log_max_size_bytes(),
            status_interval: None,
        }
    }

    /// Poll interval requested by the job, if any. Zero means "not set".
    pub fn status_interval(&self) -> Option<Duration> {
        self.status_interval
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

fn default_chunks_max_size_bytes() -> u64 {
    100 * 1024
}

fn default_log_max_size_bytes() -> u64 {
    1024 * 1024 * 1024
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_insert_replaces_existing_key() {
        let mut env = JobEnv::new();
        assert_eq!(env.insert("FOO", "one"), None);
        assert_eq!(env.insert("FOO", "two").as_deref(), Some("one"));
        assert_eq!(env.get("FOO"), Some("two"));
        assert_eq!(env.len(), 1);
    }

    #[test]
    fn env_iterates_in_key_order() {
        let env: JobEnv = [("ZED", "1"), ("ALPHA", "2"), ("MID", "3")]
            .into_iter()
            .collect();
        let keys: Vec<_> = env.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["ALPHA", "MID", "ZED"]);
    }

    #[test]
    fn job_deserializes_with_defaults() {
        let job: Job = serde_json::from_str(r#"{"id":"job-1","env":{"A":"b"}}"#).unwrap();
        assert_eq!(job.id, "job-1");
        assert_eq!(job.env.get("A"), Some("b"));
        assert_eq!(job.chunks_max_size_bytes, 100 * 1024);
        assert!(job.status_interval().is_none());
    }

    #[test]
    fn zero_status_interval_is_unset() {
        let mut job = Job::new("job-1");
        job.status_interval = Some(0);
        assert!(job.status_interval().is_none());
        job.status_interval = Some(3);
        assert_eq!(job.status_interval(), Some(Duration::from_secs(3)));
    }
}
