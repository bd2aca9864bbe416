//! Running test scripts as subprocesses.
//!
//! Each script runs as the leader of a fresh process group with its stdout
//! and stderr drained on reader threads. When a script outlives its timeout
//! the whole group is sent `SIGKILL`, so forked descendants go with it.

use crate::results::{parse_output, ExecutionResult};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeSet;
use std::fmt;
use std::io::{self, Read};
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use wait_timeout::ChildExt;

/// How long output pipes are drained once a script has exited or been
/// killed.
const PIPE_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Test scripts to run, in run order, with optional per-script timeouts in
/// seconds. Deserialised from a JSON object with key order preserved.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScriptSpec {
    entries: Vec<(String, Option<f64>)>,
}

impl ScriptSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, timeout_secs: Option<f64>) -> Self {
        self.insert(name, timeout_secs);
        self
    }

    /// Add a script, replacing the timeout of an existing entry in place.
    pub fn insert(&mut self, name: impl Into<String>, timeout_secs: Option<f64>) {
        let name = name.into();
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = timeout_secs,
            None => self.entries.push((name, timeout_secs)),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<f64>)> {
        self.entries.iter().map(|(n, t)| (n.as_str(), *t))
    }

    pub fn names(&self) -> BTreeSet<String> {
        self.entries.iter().map(|(n, _)| n.clone()).collect()
    }
}

impl Serialize for ScriptSpec {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (name, timeout) in &self.entries {
            map.serialize_entry(name, timeout)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for ScriptSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct SpecVisitor;

        impl<'de> Visitor<'de> for SpecVisitor {
            type Value = ScriptSpec;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of script file names to timeouts in seconds")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<ScriptSpec, A::Error> {
                let mut spec = ScriptSpec::new();
                while let Some((name, timeout)) = access.next_entry::<String, Option<f64>>()? {
                    spec.insert(name, timeout);
                }
                Ok(spec)
            }
        }

        deserializer.deserialize_map(SpecVisitor)
    }
}

/// Command line for one test script, with `{}` standing for the script name.
///
/// When a sandbox username is set the rendered command is wrapped in
/// `sudo -u <user> -- bash -c "<command>"` so the script runs as that user.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandTemplate {
    argv: Vec<String>,
    username: Option<String>,
}

impl CommandTemplate {
    pub fn new(argv: Vec<String>, username: Option<&str>) -> Self {
        Self {
            argv,
            username: username.map(str::to_string),
        }
    }

    /// The grading service's standard invocation:
    /// `./<script> <service> <user_api_key> <assignment> <group> <repo>`.
    pub fn test_run(
        service_address: &str,
        user_api_key: &str,
        assignment_id: &str,
        group_id: &str,
        group_repo_name: &str,
        username: Option<&str>,
    ) -> Self {
        let argv = [
            "./{}",
            service_address,
            user_api_key,
            assignment_id,
            group_id,
            group_repo_name,
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        Self::new(argv, username)
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn render(&self, script: &str) -> Vec<String> {
        let argv: Vec<String> = self
            .argv
            .iter()
            .map(|part| part.replace("{}", script))
            .collect();
        match &self.username {
            Some(user) => vec![
                "sudo".to_string(),
                "-u".to_string(),
                user.clone(),
                "--".to_string(),
                "bash".to_string(),
                "-c".to_string(),
                shell_join(&argv),
            ],
            None => argv,
        }
    }
}

pub fn shell_join(parts: &[String]) -> String {
    parts
        .iter()
        .map(|p| shell_quote(p))
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        "''".to_string()
    } else if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}

/// Run every script in `scripts`, in order, inside `tests_path`.
///
/// Scripts without a configured timeout get `default_timeout`. A script
/// that fails to start still yields a result, with the failure appended to
/// its stderr.
pub fn run_test_scripts(
    template: &CommandTemplate,
    scripts: &ScriptSpec,
    tests_path: &Path,
    default_timeout: Duration,
) -> Vec<ExecutionResult> {
    scripts
        .iter()
        .map(|(file_name, timeout_secs)| {
            let timeout = timeout_secs
                .filter(|t| t.is_finite() && *t > 0.0)
                .map(Duration::from_secs_f64)
                .unwrap_or(default_timeout);
            run_one(template, file_name, tests_path, timeout)
        })
        .collect()
}

fn run_one(
    template: &CommandTemplate,
    file_name: &str,
    tests_path: &Path,
    timeout: Duration,
) -> ExecutionResult {
    let argv = template.render(file_name);
    let start = Instant::now();
    let captured = execute(&argv, template.username(), tests_path, timeout);
    let (stdout, stderr, timed_out) = match captured {
        Ok(captured) => captured,
        Err(e) => {
            warn!(script = file_name, error = %e, "test script failed to run");
            (String::new(), format!("\n\n{}", e), false)
        }
    };
    let elapsed = start.elapsed();
    if timed_out {
        warn!(script = file_name, timeout_ms = timeout.as_millis() as u64, "test script timed out");
    }
    let time_ms = elapsed.as_secs_f64() * 1000.0;
    info!(
        script = file_name,
        elapsed_ms = time_ms.round() as u64,
        timed_out,
        "test script finished"
    );
    parse_output(
        file_name,
        &stdout,
        &stderr,
        time_ms.round() as u64,
        timed_out.then_some(timeout),
    )
}

/// Returns (stdout, stderr, timed_out).
///
/// `run_as` is the sandbox user the command switches to, if any. Its
/// processes can only be signalled as that user.
fn execute(
    argv: &[String],
    run_as: Option<&str>,
    cwd: &Path,
    timeout: Duration,
) -> io::Result<(String, String, bool)> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty command"))?;
    let mut child = Command::new(program)
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .spawn()?;

    let stdout_reader = spawn_pipe_reader(child.stdout.take());
    let stderr_reader = spawn_pipe_reader(child.stderr.take());

    let timed_out = match child.wait_timeout(timeout) {
        Ok(Some(_status)) => false,
        Ok(None) => {
            kill_group(&mut child, run_as);
            true
        }
        Err(e) => {
            kill_group(&mut child, run_as);
            return Err(e);
        }
    };
    // Descendants left behind by an exited leader would hold the pipes open.
    if !timed_out {
        signal_group(child.id(), run_as);
    }

    // Anything that escaped the group (setsid, double fork) can keep the
    // pipes open forever; stop waiting for it after a grace period.
    let deadline = Instant::now() + PIPE_DRAIN_GRACE;
    let stdout = collect_pipe(stdout_reader, deadline)?;
    let stderr = collect_pipe(stderr_reader, deadline)?;
    Ok((stdout, stderr, timed_out))
}

fn kill_group(child: &mut Child, run_as: Option<&str>) {
    signal_group(child.id(), run_as);
    let _ = child.kill();
    let _ = child.wait();
}

/// SIGKILL the process group led by `pgid`. Members running as the sandbox
/// user are killed through `sudo` as that user.
fn signal_group(pgid: u32, run_as: Option<&str>) {
    if let Err(e) = killpg(Pid::from_raw(pgid as i32), Signal::SIGKILL) {
        debug!(pgid, error = %e, "killpg failed");
    }
    let Some(user) = run_as else {
        return;
    };
    let argv = group_kill_command(user, pgid);
    match Command::new(&argv[0])
        .args(&argv[1..])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
    {
        // kill exits non-zero once the group is already gone.
        Ok(status) => debug!(pgid, tester = user, status = %status, "group kill as tester"),
        Err(e) => warn!(pgid, tester = user, error = %e, "failed to kill group as tester"),
    }
}

fn group_kill_command(user: &str, pgid: u32) -> Vec<String> {
    vec![
        "sudo".to_string(),
        "-u".to_string(),
        user.to_string(),
        "--".to_string(),
        "kill".to_string(),
        "-KILL".to_string(),
        "--".to_string(),
        format!("-{}", pgid),
    ]
}

/// Output read so far from one pipe, plus a signal sent once it hits EOF.
struct PipeReader {
    buf: Arc<Mutex<Vec<u8>>>,
    done: mpsc::Receiver<io::Result<()>>,
}

fn spawn_pipe_reader<R>(pipe: Option<R>) -> Option<PipeReader>
where
    R: Read + Send + 'static,
{
    pipe.map(|mut stream| {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let (tx, done) = mpsc::channel();
        let sink = buf.clone();
        thread::spawn(move || {
            let mut chunk = [0u8; 8192];
            let result = loop {
                match stream.read(&mut chunk) {
                    Ok(0) => break Ok(()),
                    Ok(n) => match sink.lock() {
                        Ok(mut guard) => guard.extend_from_slice(&chunk[..n]),
                        Err(_) => {
                            break Err(io::Error::new(io::ErrorKind::Other, "pipe buffer poisoned"))
                        }
                    },
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => break Err(e),
                }
            };
            let _ = tx.send(result);
        });
        PipeReader { buf, done }
    })
}

/// Wait until `deadline` for the pipe to close, then return whatever was
/// read. A reader still blocked at the deadline is left behind.
fn collect_pipe(reader: Option<PipeReader>, deadline: Instant) -> io::Result<String> {
    let Some(reader) = reader else {
        return Ok(String::new());
    };
    match reader
        .done
        .recv_timeout(deadline.saturating_duration_since(Instant::now()))
    {
        Ok(result) => result?,
        Err(mpsc::RecvTimeoutError::Timeout) => {
            warn!(
                grace_ms = PIPE_DRAIN_GRACE.as_millis() as u64,
                "output pipe still held open by an escaped process; keeping partial output"
            );
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => {
            return Err(io::Error::new(io::ErrorKind::Other, "pipe reader panicked"));
        }
    }
    let bytes = reader
        .buf
        .lock()
        .map_err(|_| io::Error::new(io::ErrorKind::Other, "pipe buffer poisoned"))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}
