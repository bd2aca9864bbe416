use anyhow::{Context, Result};
use autotest_runner::{
    JobContext, RunOutcome, RunTestJob, TesterIdentity, UpdateScriptsJob, Worker,
    WorkerConfig,
};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "autotest", version = "0.3.0", about = "Autotest worker")]
struct Cli {
    /// YAML worker configuration. Falls back to AUTOTEST_CONFIG.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Pull jobs from the configured queues and run them.
    Work {
        /// Exit once every queue is empty.
        #[arg(long)]
        burst: bool,
        #[arg(long)]
        json: bool,
    },
    /// Run a single test job read from a JSON file.
    RunTest {
        job: PathBuf,
        #[arg(long, default_value = "high")]
        queue: String,
        #[arg(long, default_value = "manual")]
        job_id: String,
        #[arg(long)]
        json: bool,
    },
    /// Install new test scripts for an assignment.
    UpdateScripts {
        #[arg(long)]
        files_path: PathBuf,
        #[arg(long)]
        assignment: String,
        #[arg(long)]
        service: String,
        #[arg(long, default_value = "high")]
        queue: String,
        #[arg(long)]
        json: bool,
    },
    /// Manage the pool of sandbox testers.
    Testers {
        #[command(subcommand)]
        action: TesterAction,
    },
}

#[derive(Subcommand)]
enum TesterAction {
    Add {
        #[arg(long)]
        username: Option<String>,
        #[arg(long)]
        working_dir: PathBuf,
    },
    List {
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", format!("{:#}", err)));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("AUTOTEST_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<PathBuf>) -> Result<WorkerConfig> {
    let path = path.or_else(|| std::env::var_os("AUTOTEST_CONFIG").map(PathBuf::from));
    WorkerConfig::load(path.as_deref())
}

fn run_command(cli: Cli) -> Result<Option<Value>> {
    let config = load_config(cli.config)?;
    let (worker, queues) = Worker::connect(config)?;
    match cli.command {
        Commands::Work { burst, json } => {
            tracing::info!(queues = ?worker.config().queues, burst, "worker started");
            let handled = worker.work(&queues, burst)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "work",
                    "handled": handled,
                })));
            }
            println!("handled: {}", handled);
        }
        Commands::RunTest {
            job,
            queue,
            job_id,
            json,
        } => {
            let raw = std::fs::read(&job).with_context(|| format!("read {}", job.display()))?;
            let run: RunTestJob = serde_json::from_slice(&raw)
                .with_context(|| format!("decode run_test job {}", job.display()))?;
            let ctx = JobContext {
                origin: queue,
                job_id,
            };
            let outcome = worker.run_test(&ctx, &run)?;
            if json {
                return Ok(Some(json!({
                    "ok": outcome.error.is_none(),
                    "command": "run-test",
                    "run": outcome_to_json(&outcome),
                })));
            }
            print_outcome(&outcome);
        }
        Commands::UpdateScripts {
            files_path,
            assignment,
            service,
            queue,
            json,
        } => {
            let ctx = JobContext {
                origin: queue,
                job_id: "manual".to_string(),
            };
            let update = UpdateScriptsJob {
                files_path,
                assignment_id: assignment,
                service_address: service,
            };
            let dir = worker.update_test_scripts(&ctx, &update)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "update-scripts",
                    "test_script_dir": dir.display().to_string(),
                })));
            }
            println!("test_script_dir: {}", dir.display());
        }
        Commands::Testers { action } => match action {
            TesterAction::Add {
                username,
                working_dir,
            } => {
                let identity = TesterIdentity {
                    username,
                    working_dir,
                };
                worker.pool().register(&identity)?;
                println!(
                    "registered: {} {}",
                    identity.username.as_deref().unwrap_or("-"),
                    identity.working_dir.display()
                );
            }
            TesterAction::List { json } => {
                let testers = worker.pool().list()?;
                if json {
                    return Ok(Some(json!({
                        "ok": true,
                        "command": "testers-list",
                        "testers": testers,
                    })));
                }
                for tester in testers {
                    println!(
                        "{}\t{}",
                        tester.username.as_deref().unwrap_or("-"),
                        tester.working_dir.display()
                    );
                }
            }
        },
    }
    Ok(None)
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Work { json, .. }
        | Commands::RunTest { json, .. }
        | Commands::UpdateScripts { json, .. } => *json,
        Commands::Testers { action } => match action {
            TesterAction::List { json } => *json,
            TesterAction::Add { .. } => false,
        },
    }
}

fn outcome_to_json(outcome: &RunOutcome) -> Value {
    json!({
        "test_scripts": outcome.results,
        "error": outcome.error,
        "output_path": outcome.output_path.as_ref().map(|p| p.display().to_string()),
        "reported": outcome.reported,
    })
}

fn print_outcome(outcome: &RunOutcome) {
    for result in &outcome.results {
        let status = if result.timeout.is_some() {
            "timeout"
        } else if result.malformed.is_some() {
            "malformed"
        } else {
            "ok"
        };
        println!(
            "{}: {} tests, {} ms, {}",
            result.file_name,
            result.tests.len(),
            result.time_ms,
            status
        );
    }
    if let Some(error) = &outcome.error {
        println!("error: {}", error);
    }
    if let Some(path) = &outcome.output_path {
        println!("output: {}", path.display());
    }
    println!("reported: {}", outcome.reported);
}

fn emit_json(value: &Value) {
    println!(
        "{}",
        serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
    );
}

fn json_error(code: &str, message: String) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
        }
    })
}
