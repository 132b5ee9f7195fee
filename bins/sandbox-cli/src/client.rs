// Thin HTTP client for the sandbox API

use anyhow::{bail, Context, Result};
use reqwest::StatusCode;
use sandbox_common::{ExecutionResult, JobState, QueueStats, SubmitRequest};
use serde::Deserialize;
use serde_json::Value;
use std::time::{Duration, Instant};
use uuid::Uuid;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitResponse {
    job_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct LanguagesResponse {
    pub supported: Vec<String>,
    pub count: usize,
}

/// One poll of `GET /job/:id`
#[derive(Debug, PartialEq)]
pub enum JobPoll {
    Pending(JobState),
    Finished(ExecutionResult),
    NotFound,
}

pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub async fn submit(&self, request: &SubmitRequest) -> Result<Uuid> {
        let response = self
            .http
            .post(format!("{}/execute", self.base_url))
            .json(request)
            .send()
            .await
            .context("Failed to reach the sandbox API")?;

        let status = response.status();
        let body: Value = response.json().await.context("Invalid response body")?;
        if status != StatusCode::ACCEPTED {
            bail!("{} ({})", error_message(&body), status);
        }
        let accepted: SubmitResponse =
            serde_json::from_value(body).context("Unexpected submit response")?;
        Ok(accepted.job_id)
    }

    pub async fn poll(&self, job_id: Uuid) -> Result<JobPoll> {
        let response = self
            .http
            .get(format!("{}/job/{}", self.base_url, job_id))
            .send()
            .await
            .context("Failed to reach the sandbox API")?;

        let status = response.status();
        let body: Value = response.json().await.context("Invalid response body")?;
        parse_poll(status, body)
    }

    /// Poll until the job is terminal or `max_wait` elapses
    pub async fn wait(
        &self,
        job_id: Uuid,
        interval: Duration,
        max_wait: Duration,
    ) -> Result<ExecutionResult> {
        let started = Instant::now();
        loop {
            match self.poll(job_id).await? {
                JobPoll::Finished(result) => return Ok(result),
                JobPoll::NotFound => bail!("Job {} not found", job_id),
                JobPoll::Pending(_) if started.elapsed() >= max_wait => {
                    bail!("Job {} still pending after {:?}", job_id, max_wait)
                }
                JobPoll::Pending(_) => tokio::time::sleep(interval).await,
            }
        }
    }

    pub async fn languages(&self) -> Result<LanguagesResponse> {
        self.get_json("/languages").await
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        self.get_json("/queue/stats").await
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self
            .http
            .get(format!("{}{}", self.base_url, path))
            .send()
            .await
            .context("Failed to reach the sandbox API")?;
        let status = response.status();
        let body: Value = response.json().await.context("Invalid response body")?;
        if !status.is_success() {
            bail!("{} ({})", error_message(&body), status);
        }
        serde_json::from_value(body).with_context(|| format!("Unexpected response from {}", path))
    }
}

fn error_message(body: &Value) -> String {
    body["message"]
        .as_str()
        .unwrap_or("request failed")
        .to_string()
}

pub fn parse_poll(status: StatusCode, body: Value) -> Result<JobPoll> {
    if status == StatusCode::NOT_FOUND {
        return Ok(JobPoll::NotFound);
    }
    if !status.is_success() {
        bail!("{} ({})", error_message(&body), status);
    }

    match body["status"].as_str() {
        Some("queued") => Ok(JobPoll::Pending(JobState::Queued)),
        Some("active") => Ok(JobPoll::Pending(JobState::Active)),
        _ => {
            let result = serde_json::from_value(body).context("Unexpected job payload")?;
            Ok(JobPoll::Finished(result))
        }
    }
}
