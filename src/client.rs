use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::config::Config;
use crate::runs::model::{AdminRun, RunRecord, RunSnapshot};

#[derive(Debug, Error)]
pub enum ClientError {
    /// Transport failure: DNS, connect, timeout. Pollers retry these on the
    /// next tick.
    #[error("backend unreachable: {0}")]
    Network(#[from] reqwest::Error),
    /// The resource does not exist server-side. Terminal for pollers.
    #[error("not found")]
    NotFound,
    /// The backend answered with a non-2xx status other than 404.
    #[error("backend returned {status}: {body}")]
    Api { status: StatusCode, body: String },
    /// The response body did not match the expected shape.
    #[error("malformed response body: {0}")]
    Decode(#[source] reqwest::Error),
}

/// Read-only view of the backend's run-query endpoints. The backend itself is
/// external; this client never mutates its state.
#[async_trait]
pub trait ApiClient: Send + Sync {
    /// `GET /api/runs/{run_id}`: one run plus its full log history.
    async fn fetch_run(&self, run_id: &str) -> Result<RunSnapshot, ClientError>;
    /// `GET /api/runs`: recent runs.
    async fn list_runs(&self) -> Result<Vec<RunRecord>, ClientError>;
    /// `GET /api/admin/runs?limit=N`: runs with requester metadata.
    async fn admin_runs(&self, limit: usize) -> Result<Vec<AdminRun>, ClientError>;
    /// `GET /api/runs/lookup?session_id=X`: maps a checkout session to a
    /// run id once the backend has created one. `NotFound` until then.
    async fn lookup_run(&self, session_id: &str) -> Result<String, ClientError>;
}

pub struct HttpApiClient {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct RunsResponse {
    #[serde(default)]
    runs: Vec<RunRecord>,
}

#[derive(Deserialize)]
struct AdminRunsResponse {
    #[serde(default)]
    runs: Vec<AdminRun>,
}

#[derive(Deserialize)]
struct LookupResponse {
    run_id: String,
}

impl HttpApiClient {
    pub fn new(config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, ClientError> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self.client.get(&url).query(query).send().await?;

        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Err(ClientError::NotFound);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ClientError::Api { status, body });
        }
        resp.json::<T>().await.map_err(ClientError::Decode)
    }
}

#[async_trait]
impl ApiClient for HttpApiClient {
    async fn fetch_run(&self, run_id: &str) -> Result<RunSnapshot, ClientError> {
        self.get_json(&format!("/api/runs/{run_id}"), &[]).await
    }

    async fn list_runs(&self) -> Result<Vec<RunRecord>, ClientError> {
        let resp: RunsResponse = self.get_json("/api/runs", &[]).await?;
        Ok(resp.runs)
    }

    async fn admin_runs(&self, limit: usize) -> Result<Vec<AdminRun>, ClientError> {
        let limit = limit.to_string();
        let resp: AdminRunsResponse = self
            .get_json("/api/admin/runs", &[("limit", limit.as_str())])
            .await?;
        Ok(resp.runs)
    }

    async fn lookup_run(&self, session_id: &str) -> Result<String, ClientError> {
        let resp: LookupResponse = self
            .get_json("/api/runs/lookup", &[("session_id", session_id)])
            .await?;
        Ok(resp.run_id)
    }
}
