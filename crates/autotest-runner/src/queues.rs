//! Job queues and the jobs they carry.
//!
//! Queues are lists in the shared store named `{prefix}{queue}`, each entry a
//! JSON [`JobEnvelope`]. The worker only needs to look at queues (names and
//! lengths) and pop from them; how jobs get there is up to the submitter.

use crate::process::ScriptSpec;
use crate::store::SharedStore;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

/// Read-only view of the job queues.
pub trait QueueInfo: Send + Sync {
    fn queue_names(&self) -> Vec<String>;
    fn queue_len(&self, queue: &str) -> Result<usize>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunTestJob {
    pub service_address: String,
    pub user_api_key: String,
    pub server_api_key: String,
    pub test_scripts: ScriptSpec,
    pub files_path: PathBuf,
    pub assignment_id: String,
    pub group_id: String,
    pub group_repo_name: String,
    #[serde(default)]
    pub submission_id: Option<String>,
    pub run_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateScriptsJob {
    pub files_path: PathBuf,
    pub assignment_id: String,
    pub service_address: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Job {
    RunTest(RunTestJob),
    UpdateTestScripts(UpdateScriptsJob),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEnvelope {
    pub id: String,
    pub job: Job,
}

/// Where the job being handled came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobContext {
    pub origin: String,
    pub job_id: String,
}

/// Queues stored as lists in the shared store.
#[derive(Clone)]
pub struct StoreQueues {
    store: Arc<dyn SharedStore>,
    prefix: String,
    names: Vec<String>,
}

impl StoreQueues {
    /// `names` in priority order, highest first.
    pub fn new(store: Arc<dyn SharedStore>, prefix: impl Into<String>, names: Vec<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            names,
        }
    }

    fn key(&self, queue: &str) -> String {
        format!("{}{}", self.prefix, queue)
    }

    pub fn push(&self, queue: &str, envelope: &JobEnvelope) -> Result<()> {
        let raw = serde_json::to_string(envelope)?;
        self.store.rpush(&self.key(queue), &raw)?;
        Ok(())
    }

    /// Pop the next job from the highest-priority non-empty queue.
    pub fn pop_next(&self) -> Result<Option<(JobContext, Job)>> {
        for name in &self.names {
            let Some(raw) = self.store.lpop(&self.key(name))? else {
                continue;
            };
            let envelope: JobEnvelope = serde_json::from_str(&raw)
                .with_context(|| format!("decode job from queue {}: {}", name, raw))?;
            let ctx = JobContext {
                origin: name.clone(),
                job_id: envelope.id,
            };
            return Ok(Some((ctx, envelope.job)));
        }
        Ok(None)
    }
}

impl QueueInfo for StoreQueues {
    fn queue_names(&self) -> Vec<String> {
        self.names.clone()
    }

    fn queue_len(&self, queue: &str) -> Result<usize> {
        Ok(self.store.llen(&self.key(queue))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn update_job(assignment: &str) -> Job {
        Job::UpdateTestScripts(UpdateScriptsJob {
            files_path: PathBuf::from("/tmp/upload"),
            assignment_id: assignment.to_string(),
            service_address: "http://svc".to_string(),
        })
    }

    #[test]
    fn pop_next_prefers_earlier_queues() {
        let queues = StoreQueues::new(
            Arc::new(MemoryStore::new()),
            "q:",
            vec!["high".to_string(), "low".to_string()],
        );
        queues
            .push("low", &JobEnvelope { id: "1".into(), job: update_job("a") })
            .expect("push");
        queues
            .push("high", &JobEnvelope { id: "2".into(), job: update_job("b") })
            .expect("push");
        assert_eq!(queues.queue_len("low").expect("len"), 1);

        let (ctx, job) = queues.pop_next().expect("pop").expect("job");
        assert_eq!(ctx.origin, "high");
        assert_eq!(ctx.job_id, "2");
        assert_eq!(job, update_job("b"));

        let (ctx, _) = queues.pop_next().expect("pop").expect("job");
        assert_eq!(ctx.origin, "low");
        assert!(queues.pop_next().expect("pop").is_none());
    }

    #[test]
    fn run_test_job_decodes_from_json() {
        let raw = r#"{
            "id": "svc-17",
            "job": {
                "type": "run_test",
                "service_address": "http://svc",
                "user_api_key": "u",
                "server_api_key": "s",
                "test_scripts": {"b.sh": 10, "a.sh": null},
                "files_path": "/tmp/files",
                "assignment_id": "1",
                "group_id": "2",
                "group_repo_name": "group_0002",
                "run_id": "17"
            }
        }"#;
        let envelope: JobEnvelope = serde_json::from_str(raw).expect("decode");
        let Job::RunTest(job) = envelope.job else {
            panic!("expected run_test");
        };
        assert_eq!(job.submission_id, None);
        let order: Vec<&str> = job.test_scripts.iter().map(|(n, _)| n).collect();
        assert_eq!(order, vec!["b.sh", "a.sh"]);
    }
}
