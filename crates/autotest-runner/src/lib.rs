pub mod config;
pub mod fsutil;
pub mod pool;
pub mod process;
pub mod queues;
pub mod report;
pub mod results;
pub mod stage;
pub mod store;
pub mod telemetry;
pub mod versions;

use anyhow::{Context, Result};
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, info, warn};

pub use config::WorkerConfig;
pub use pool::{TesterIdentity, TesterLease, TesterPool};
pub use process::{CommandTemplate, ScriptSpec};
pub use queues::{Job, JobContext, JobEnvelope, QueueInfo, RunTestJob, StoreQueues, UpdateScriptsJob};
pub use report::{HttpReporter, Reporter, RunReport};
pub use results::ExecutionResult;
pub use store::{MemoryStore, RedisStore, SharedStore, StoreError};
pub use telemetry::QueueTelemetry;
pub use versions::ScriptVersionStore;

use fsutil::{atomic_write_json_pretty, clean_dir_name, clear_dir};
use process::shell_quote;

#[derive(Debug)]
pub struct RunOutcome {
    pub results: Vec<ExecutionResult>,
    pub error: Option<String>,
    pub output_path: Option<PathBuf>,
    pub reported: bool,
}

pub struct Worker {
    config: WorkerConfig,
    pool: TesterPool,
    versions: ScriptVersionStore,
    telemetry: QueueTelemetry,
    queues: Arc<dyn QueueInfo>,
    reporter: Box<dyn Reporter>,
}

/// Clears pop telemetry for every empty queue when a job handler exits,
/// whether it returned, failed or panicked.
struct IdleQueueReset<'a> {
    worker: &'a Worker,
}

impl Drop for IdleQueueReset<'_> {
    fn drop(&mut self) {
        self.worker.clear_idle_queues();
    }
}

impl Worker {
    pub fn new(
        config: WorkerConfig,
        store: Arc<dyn SharedStore>,
        queues: Arc<dyn QueueInfo>,
        reporter: Box<dyn Reporter>,
    ) -> Self {
        Self {
            pool: TesterPool::new(store.clone(), config.tester_list_key.clone()),
            versions: ScriptVersionStore::new(
                store.clone(),
                config.script_hash_key.clone(),
                config.test_script_root(),
            ),
            telemetry: QueueTelemetry::new(store, config.pop_hash_key.clone()),
            config,
            queues,
            reporter,
        }
    }

    /// Worker backed by Redis, store-list queues and the HTTP reporter.
    pub fn connect(config: WorkerConfig) -> Result<(Self, StoreQueues)> {
        let store: Arc<dyn SharedStore> = Arc::new(
            RedisStore::open(&config.redis_url)
                .with_context(|| format!("open redis at {}", config.redis_url))?,
        );
        let queues = StoreQueues::new(
            store.clone(),
            config.queue_prefix.clone(),
            config.queues.clone(),
        );
        let reporter = HttpReporter::new(config.report_timeout())?;
        let worker = Self::new(config, store, Arc::new(queues.clone()), Box::new(reporter));
        Ok((worker, queues))
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn pool(&self) -> &TesterPool {
        &self.pool
    }

    pub fn versions(&self) -> &ScriptVersionStore {
        &self.versions
    }

    pub fn telemetry(&self) -> &QueueTelemetry {
        &self.telemetry
    }

    pub fn handle(&self, ctx: &JobContext, job: &Job) -> Result<()> {
        match job {
            Job::RunTest(job) => self.run_test(ctx, job).map(|_| ()),
            Job::UpdateTestScripts(job) => self.update_test_scripts(ctx, job).map(|_| ()),
        }
    }

    /// Run a batch of test scripts against a submission and report the
    /// results.
    ///
    /// Failures while staging or running are captured in the outcome's
    /// `error` and still produce a result file and a report. Only failing to
    /// obtain a tester at all is returned as an error.
    pub fn run_test(&self, ctx: &JobContext, job: &RunTestJob) -> Result<RunOutcome> {
        let _reset = IdleQueueReset { worker: self };
        info!(
            queue = %ctx.origin,
            job_id = %ctx.job_id,
            run_id = %job.run_id,
            assignment = %job.assignment_id,
            group = %job.group_id,
            "run_test started"
        );

        if let Err(e) = self.telemetry.record_pop(&ctx.origin) {
            warn!(queue = %ctx.origin, error = %e, "failed to record queue pop");
        }
        let queue_len = self
            .queues
            .queue_len(&ctx.origin)
            .map_err(|e| warn!(queue = %ctx.origin, error = %e, "failed to read queue length"))
            .ok();
        let avg_pop_interval = self
            .telemetry
            .average_interval(&ctx.origin)
            .map_err(|e| warn!(queue = %ctx.origin, error = %e, "failed to read pop interval"))
            .ok()
            .flatten()
            .map(|d| d.as_secs_f64());

        let lease = self.pool.acquire()?;
        let staged = job.files_path != lease.working_dir();
        let mut results = Vec::new();
        let mut error = self
            .execute(job, &lease, &mut results)
            .err()
            .map(|e| format!("{:#}", e));
        if let Some(message) = &error {
            warn!(run_id = %job.run_id, error = %message, "test run failed");
        }

        let output_path = match self.store_results(job, &results) {
            Ok(path) => Some(path),
            Err(e) => {
                let message = format!("{:#}", e);
                error!(run_id = %job.run_id, error = %message, "failed to store results");
                error = Some(match error {
                    Some(prev) => format!("{}\n{}", prev, message),
                    None => message,
                });
                None
            }
        };

        if let Err(e) = self.clean_up_tests(&lease, staged) {
            warn!(
                run_id = %job.run_id,
                working_dir = %lease.working_dir().display(),
                error = %format!("{:#}", e),
                "sandbox cleanup failed"
            );
        }
        drop(lease);

        let report = RunReport {
            service_address: job.service_address.clone(),
            assignment_id: job.assignment_id.clone(),
            group_id: job.group_id.clone(),
            server_api_key: job.server_api_key.clone(),
            run_id: job.run_id.clone(),
            test_scripts: results,
            error,
            queue_len,
            avg_pop_interval,
        };
        let reported = match self.reporter.report(&report) {
            Ok(()) => true,
            Err(e) => {
                error!(run_id = %job.run_id, error = %format!("{:#}", e), "failed to report results");
                false
            }
        };

        Ok(RunOutcome {
            results: report.test_scripts,
            error: report.error,
            output_path,
            reported,
        })
    }

    fn execute(
        &self,
        job: &RunTestJob,
        lease: &TesterLease,
        results: &mut Vec<ExecutionResult>,
    ) -> Result<()> {
        let tests_path = lease.working_dir();
        stage::stage_files(
            &self.versions,
            &job.files_path,
            tests_path,
            &job.test_scripts.names(),
            &job.service_address,
            &job.assignment_id,
        )?;
        let cmd = CommandTemplate::test_run(
            &job.service_address,
            &job.user_api_key,
            &job.assignment_id,
            &job.group_id,
            &job.group_repo_name,
            lease.username(),
        );
        *results = process::run_test_scripts(
            &cmd,
            &job.test_scripts,
            tests_path,
            self.config.default_script_timeout(),
        );
        Ok(())
    }

    fn store_results(&self, job: &RunTestJob, results: &[ExecutionResult]) -> Result<PathBuf> {
        let path = self
            .config
            .test_result_root()
            .join(clean_dir_name(&job.service_address))
            .join(&job.assignment_id)
            .join(&job.group_id)
            .join(format!("s{}", job.submission_id.as_deref().unwrap_or("")))
            .join(format!("run_{}", Utc::now().timestamp()))
            .join("output.json");
        atomic_write_json_pretty(&path, results)?;
        debug!(path = %path.display(), "results stored");
        Ok(path)
    }

    /// Give the working directory back in a usable state: permissions
    /// opened up, stray tester processes killed, staged files removed.
    fn clean_up_tests(&self, lease: &TesterLease, staged: bool) -> Result<()> {
        let tests_path = lease.working_dir();
        if let Some(user) = lease.username() {
            let script = format!(
                "chmod -Rf ugo+rwX {}; killall -KILL -u {}",
                shell_quote(&tests_path.to_string_lossy()),
                shell_quote(user)
            );
            // killall exits non-zero when nothing was left running.
            let status = Command::new("sudo")
                .args(["-u", user, "--", "bash", "-c", &script])
                .status()
                .with_context(|| format!("run cleanup as {}", user))?;
            debug!(tester = user, status = %status, "tester processes cleaned up");
        } else {
            open_permissions(tests_path)?;
        }
        if staged {
            clear_dir(tests_path)?;
        }
        Ok(())
    }

    /// Install new test scripts for an assignment and retire the old ones.
    pub fn update_test_scripts(&self, ctx: &JobContext, job: &UpdateScriptsJob) -> Result<PathBuf> {
        let _reset = IdleQueueReset { worker: self };
        info!(
            queue = %ctx.origin,
            job_id = %ctx.job_id,
            assignment = %job.assignment_id,
            service = %job.service_address,
            "update_test_scripts started"
        );
        self.versions
            .replace(&job.service_address, &job.assignment_id, &job.files_path)
    }

    fn clear_idle_queues(&self) {
        for queue in self.queues.queue_names() {
            match self.queues.queue_len(&queue) {
                Ok(0) => {
                    if let Err(e) = self.telemetry.clear(&queue) {
                        warn!(queue = %queue, error = %e, "failed to clear pop telemetry");
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(queue = %queue, error = %e, "failed to read queue length"),
            }
        }
    }

    /// Pull jobs from `source` until it runs dry (`burst`) or forever.
    /// Returns the number of jobs handled.
    pub fn work(&self, source: &StoreQueues, burst: bool) -> Result<usize> {
        let mut handled = 0;
        loop {
            match source.pop_next() {
                Ok(Some((ctx, job))) => {
                    if let Err(e) = self.handle(&ctx, &job) {
                        error!(
                            queue = %ctx.origin,
                            job_id = %ctx.job_id,
                            error = %format!("{:#}", e),
                            "job failed"
                        );
                    }
                    handled += 1;
                }
                Ok(None) if burst => return Ok(handled),
                Ok(None) => thread::sleep(self.config.poll_interval()),
                Err(e) => {
                    error!(error = %format!("{:#}", e), "failed to fetch next job");
                    if burst {
                        return Err(e);
                    }
                    thread::sleep(self.config.poll_interval());
                }
            }
        }
    }
}

fn open_permissions(root: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    for entry in walkdir::WalkDir::new(root) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) if e.io_error().map(|io| io.kind()) == Some(std::io::ErrorKind::NotFound) => {
                continue
            }
            Err(e) => return Err(e.into()),
        };
        let mode = if entry.file_type().is_dir() { 0o777 } else { 0o666 };
        let current = entry.metadata()?.permissions().mode();
        // Keep execute bits on files that had them.
        let mode = mode | (current & 0o111);
        std::fs::set_permissions(entry.path(), std::fs::Permissions::from_mode(mode))
            .with_context(|| format!("chmod {}", entry.path().display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsutil::{ensure_dir, scratch_dir};
    use std::fs;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Captured {
        reports: Mutex<Vec<RunReport>>,
    }

    struct CaptureReporter(Arc<Captured>);

    impl Reporter for CaptureReporter {
        fn report(&self, report: &RunReport) -> Result<()> {
            self.0
                .reports
                .lock()
                .map_err(|_| anyhow::anyhow!("poisoned"))?
                .push(report.clone());
            Ok(())
        }
    }

    fn worker(root: &Path) -> (Worker, Arc<Captured>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let config = WorkerConfig {
            working_dir: root.to_path_buf(),
            queues: vec!["high".to_string(), "low".to_string()],
            default_script_timeout_secs: 1,
            ..WorkerConfig::default()
        };
        let queues = StoreQueues::new(store.clone(), "q:", config.queues.clone());
        let captured = Arc::new(Captured::default());
        let worker = Worker::new(
            config,
            store.clone(),
            Arc::new(queues),
            Box::new(CaptureReporter(captured.clone())),
        );
        (worker, captured, store)
    }

    fn ctx(origin: &str) -> JobContext {
        JobContext {
            origin: origin.to_string(),
            job_id: "job-1".to_string(),
        }
    }

    fn write_script(dir: &Path, name: &str, body: &str) {
        fs::write(dir.join(name), format!("#!/bin/sh\n{}\n", body)).expect("write script");
    }

    fn run_job(files_path: PathBuf, scripts: ScriptSpec) -> RunTestJob {
        RunTestJob {
            service_address: "http://svc".to_string(),
            user_api_key: "u".to_string(),
            server_api_key: "s".to_string(),
            test_scripts: scripts,
            files_path,
            assignment_id: "1".to_string(),
            group_id: "2".to_string(),
            group_repo_name: "repo".to_string(),
            submission_id: Some("5".to_string()),
            run_id: "9".to_string(),
        }
    }

    #[test]
    fn run_test_stages_runs_and_reports_each_script() {
        let root = scratch_dir("worker_end_to_end");
        let (worker, captured, _store) = worker(&root);
        let sandbox = root.join("sandbox");
        ensure_dir(&sandbox).expect("sandbox");
        worker
            .pool()
            .register(&TesterIdentity {
                username: None,
                working_dir: sandbox.clone(),
            })
            .expect("register");

        let upload = root.join("upload");
        ensure_dir(&upload).expect("upload");
        write_script(&upload, "a.sh", r#"test -f submission.txt && echo '{"status": "pass"}'"#);
        write_script(&upload, "b.sh", "sleep 5");
        worker
            .update_test_scripts(
                &ctx("high"),
                &UpdateScriptsJob {
                    files_path: upload,
                    assignment_id: "1".to_string(),
                    service_address: "http://svc".to_string(),
                },
            )
            .expect("install scripts");

        let submission = root.join("submission");
        ensure_dir(&submission).expect("submission");
        fs::write(submission.join("submission.txt"), "answer").expect("submission file");

        let scripts = ScriptSpec::new().with("a.sh", None).with("b.sh", None);
        let outcome = worker
            .run_test(&ctx("high"), &run_job(submission, scripts))
            .expect("run");

        assert_eq!(outcome.error, None);
        assert!(outcome.reported);
        assert_eq!(outcome.results.len(), 2);
        let first = &outcome.results[0];
        assert_eq!(first.file_name, "a.sh");
        assert_eq!(first.tests, vec![serde_json::json!({"status": "pass"})]);
        assert_eq!(first.malformed, None);
        assert_eq!(first.timeout, None);
        let second = &outcome.results[1];
        assert_eq!(second.file_name, "b.sh");
        assert_eq!(second.timeout, Some(std::time::Duration::from_secs(1)));
        assert!(second.tests.is_empty());

        let output = outcome.output_path.expect("result file written");
        assert!(output.to_string_lossy().contains("/1/2/s5/run_"));
        let stored: Vec<serde_json::Value> =
            serde_json::from_str(&fs::read_to_string(&output).expect("read")).expect("decode");
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[1]["timeout"], serde_json::json!(1.0));

        assert_eq!(fs::read_dir(&sandbox).expect("sandbox").count(), 0);
        assert_eq!(worker.pool().available().expect("available"), 1);
        assert_eq!(captured.reports.lock().expect("lock").len(), 1);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn staging_failure_is_reported_and_tester_returned() {
        let root = scratch_dir("worker_staging_failure");
        let (worker, captured, _store) = worker(&root);
        let sandbox = root.join("sandbox");
        ensure_dir(&sandbox).expect("sandbox");
        worker
            .pool()
            .register(&TesterIdentity {
                username: None,
                working_dir: sandbox.clone(),
            })
            .expect("register");

        let mut job = run_job(root.join("does_not_exist"), ScriptSpec::new().with("t.sh", None));
        job.submission_id = None;
        let outcome = worker.run_test(&ctx("high"), &job).expect("run");

        assert!(outcome.results.is_empty());
        let message = outcome.error.as_deref().expect("error recorded");
        assert!(message.contains("does_not_exist"), "{}", message);
        assert!(outcome.reported);
        let output = outcome.output_path.expect("result file written");
        assert!(output.ends_with("output.json"));
        assert!(output
            .to_string_lossy()
            .contains("results/http:__svc/1/2/s/run_"));
        assert_eq!(fs::read_to_string(&output).expect("read").trim(), "[]");
        assert_eq!(worker.pool().available().expect("available"), 1);

        let reports = captured.reports.lock().expect("lock");
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].run_id, "9");
        assert_eq!(reports[0].queue_len, Some(0));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn telemetry_is_reset_for_empty_queues_after_job() {
        let root = scratch_dir("worker_reset");
        let (worker, _captured, store) = worker(&root);
        worker.telemetry().record_pop_at("high", 1.0).expect("pop");
        worker.telemetry().record_pop_at("low", 1.0).expect("pop");
        store.rpush("q:low", "pending").expect("push");

        let upload = root.join("upload");
        ensure_dir(&upload).expect("upload");
        let job = UpdateScriptsJob {
            files_path: upload,
            assignment_id: "1".to_string(),
            service_address: "svc".to_string(),
        };
        worker.update_test_scripts(&ctx("high"), &job).expect("update");

        assert_eq!(worker.telemetry().average_interval("high").expect("avg"), None);
        assert!(worker.telemetry().average_interval("low").expect("avg").is_some());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn telemetry_reset_runs_even_when_job_fails() {
        let root = scratch_dir("worker_reset_failure");
        let (worker, _captured, _store) = worker(&root);
        worker.telemetry().record_pop_at("high", 1.0).expect("pop");
        let job = UpdateScriptsJob {
            files_path: root.join("missing_upload"),
            assignment_id: "1".to_string(),
            service_address: "svc".to_string(),
        };
        assert!(worker.update_test_scripts(&ctx("high"), &job).is_err());
        assert_eq!(worker.telemetry().average_interval("high").expect("avg"), None);
        let leftovers: Vec<_> = fs::read_dir(root.join("scripts/svc/1"))
            .expect("version parent")
            .map(|e| e.expect("entry").file_name())
            .filter(|name| name.to_string_lossy().starts_with("test_scripts_"))
            .collect();
        assert!(leftovers.is_empty(), "{:?}", leftovers);
        let _ = fs::remove_dir_all(root);
    }
}
