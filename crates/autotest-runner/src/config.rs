use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ALLOWED_QUEUES: [&str; 3] = ["high", "low", "batch"];

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerConfig {
    pub redis_url: String,
    pub working_dir: PathBuf,
    pub test_script_dir_name: String,
    pub test_result_dir_name: String,
    pub tester_list_key: String,
    pub script_hash_key: String,
    pub pop_hash_key: String,
    pub queue_prefix: String,
    pub queues: Vec<String>,
    pub default_script_timeout_secs: u64,
    pub report_timeout_secs: u64,
    pub poll_interval_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1/".to_string(),
            working_dir: PathBuf::from("/tmp/autotest"),
            test_script_dir_name: "scripts".to_string(),
            test_result_dir_name: "results".to_string(),
            tester_list_key: "autotest:testers".to_string(),
            script_hash_key: "autotest:current_test_scripts".to_string(),
            pop_hash_key: "autotest:pop_intervals".to_string(),
            queue_prefix: "autotest:queue:".to_string(),
            queues: ALLOWED_QUEUES.iter().map(|q| q.to_string()).collect(),
            default_script_timeout_secs: 30,
            report_timeout_secs: 30,
            poll_interval_ms: 500,
        }
    }
}

impl WorkerConfig {
    /// Load from an optional YAML file, then apply `AUTOTEST_*` environment
    /// overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = fs::read_to_string(path)
                    .with_context(|| format!("read config {}", path.display()))?;
                Self::from_yaml(&raw).with_context(|| format!("parse config {}", path.display()))?
            }
            None => Self::default(),
        };
        config.apply_overrides(|key| env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(raw)?)
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("AUTOTEST_REDIS_URL") {
            self.redis_url = url;
        }
        if let Some(dir) = lookup("AUTOTEST_WORKING_DIR") {
            self.working_dir = PathBuf::from(dir);
        }
        if let Some(queues) = lookup("AUTOTEST_QUEUES") {
            self.queues = queues.split_whitespace().map(str::to_string).collect();
        }
        if let Some(secs) = lookup("AUTOTEST_DEFAULT_TIMEOUT_SECS") {
            self.default_script_timeout_secs = secs
                .trim()
                .parse()
                .map_err(|e| anyhow!("invalid AUTOTEST_DEFAULT_TIMEOUT_SECS '{}': {}", secs, e))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.queues.is_empty() {
            return Err(anyhow!("at least one queue must be configured"));
        }
        if let Some(bad) = self
            .queues
            .iter()
            .find(|q| !ALLOWED_QUEUES.contains(&q.as_str()))
        {
            return Err(anyhow!(
                "unknown queue '{}'; queue names must be one of: {}",
                bad,
                ALLOWED_QUEUES.join(", ")
            ));
        }
        if self.default_script_timeout_secs == 0 {
            return Err(anyhow!("default_script_timeout_secs must be greater than 0"));
        }
        Ok(())
    }

    pub fn test_script_root(&self) -> PathBuf {
        self.working_dir.join(&self.test_script_dir_name)
    }

    pub fn test_result_root(&self) -> PathBuf {
        self.working_dir.join(&self.test_result_dir_name)
    }

    pub fn default_script_timeout(&self) -> Duration {
        Duration::from_secs(self.default_script_timeout_secs)
    }

    pub fn report_timeout(&self) -> Duration {
        Duration::from_secs(self.report_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn yaml_overrides_defaults_field_by_field() {
        let config = WorkerConfig::from_yaml(
            "working_dir: /srv/autotest\nqueues: [high]\ndefault_script_timeout_secs: 5\n",
        )
        .expect("parse");
        assert_eq!(config.working_dir, PathBuf::from("/srv/autotest"));
        assert_eq!(config.queues, vec!["high"]);
        assert_eq!(config.default_script_timeout(), Duration::from_secs(5));
        assert_eq!(config.redis_url, WorkerConfig::default().redis_url);
        assert_eq!(config.test_script_root(), PathBuf::from("/srv/autotest/scripts"));
    }

    #[test]
    fn unknown_yaml_keys_are_rejected() {
        assert!(WorkerConfig::from_yaml("redis: localhost\n").is_err());
    }

    #[test]
    fn env_overrides_apply_after_file() {
        let env: HashMap<&str, &str> = [
            ("AUTOTEST_REDIS_URL", "redis://cache:6380/2"),
            ("AUTOTEST_QUEUES", "batch  low"),
            ("AUTOTEST_DEFAULT_TIMEOUT_SECS", "12"),
        ]
        .into_iter()
        .collect();
        let mut config = WorkerConfig::default();
        config
            .apply_overrides(|k| env.get(k).map(|v| v.to_string()))
            .expect("overrides");
        assert_eq!(config.redis_url, "redis://cache:6380/2");
        assert_eq!(config.queues, vec!["batch", "low"]);
        assert_eq!(config.default_script_timeout_secs, 12);
        config.validate().expect("valid");
    }

    #[test]
    fn unknown_queue_names_fail_validation() {
        let config = WorkerConfig {
            queues: vec!["high".to_string(), "urgent".to_string()],
            ..WorkerConfig::default()
        };
        let err = config.validate().expect_err("urgent is not a queue");
        assert!(err.to_string().contains("urgent"), "{}", err);
    }

    #[test]
    fn bad_timeout_override_is_an_error() {
        let mut config = WorkerConfig::default();
        let err = config
            .apply_overrides(|k| (k == "AUTOTEST_DEFAULT_TIMEOUT_SECS").then(|| "soon".to_string()))
            .expect_err("not a number");
        assert!(err.to_string().contains("AUTOTEST_DEFAULT_TIMEOUT_SECS"));
    }
}
