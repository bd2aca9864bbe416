use crate::results::ExecutionResult;
use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use std::time::Duration;
use tracing::info;

/// Everything sent back to the grading service about one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    #[serde(skip)]
    pub service_address: String,
    #[serde(skip)]
    pub assignment_id: String,
    #[serde(skip)]
    pub group_id: String,
    #[serde(skip)]
    pub server_api_key: String,
    #[serde(skip)]
    pub run_id: String,
    pub test_scripts: Vec<ExecutionResult>,
    pub error: Option<String>,
    pub queue_len: Option<usize>,
    /// Seconds.
    pub avg_pop_interval: Option<f64>,
}

impl RunReport {
    /// JSON document carried in the `test_output` field.
    pub fn test_output(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn endpoint(&self) -> String {
        format!(
            "{}/api/assignments/{}/groups/{}/test_script_results",
            self.service_address.trim_end_matches('/'),
            self.assignment_id,
            self.group_id
        )
    }
}

pub trait Reporter: Send + Sync {
    fn report(&self, report: &RunReport) -> Result<()>;
}

/// Posts reports to the grading service's HTTP API.
pub struct HttpReporter {
    client: reqwest::blocking::Client,
}

impl HttpReporter {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .context("build report client")?;
        Ok(Self { client })
    }
}

impl Reporter for HttpReporter {
    fn report(&self, report: &RunReport) -> Result<()> {
        let url = report.endpoint();
        let test_output = report.test_output()?;
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("MarkUsAuth {}", report.server_api_key))
            .header("Accept", "application/json")
            .form(&[
                ("test_run_id", report.run_id.as_str()),
                ("test_output", test_output.as_str()),
            ])
            .send()
            .with_context(|| format!("post results to {}", url))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(anyhow!("results rejected by {}: {} {}", url, status, body));
        }
        info!(run_id = %report.run_id, url = %url, "results reported");
        Ok(())
    }
}
