use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineKind {
    PullRequest,
    Release,
}

/// Request to materialize one pipeline execution.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineCreateParams {
    pub source_url: String,
    pub branch: String,
    /// Canonical pull-refs string, `baseRef:baseSHA[,number:sha]*`.
    pub pull_refs: String,
    pub kind: PipelineKind,
    pub context: String,
    pub env: BTreeMap<String, String>,
}

/// Identity the engine assigns to an execution.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ActivityKey {
    pub name: String,
    /// Engine build counter, unique per (repo, branch).
    pub build: String,
}

/// An engine-native resource to be applied to the cluster, kept opaque here.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineResource {
    pub kind: String,
    pub manifest: serde_json::Value,
}

/// Client for the execution engine that turns pipeline parameters into
/// cluster resources and runs them.
#[async_trait]
pub trait PipelineEngine: Send + Sync {
    async fn create(
        &self,
        params: &PipelineCreateParams,
    ) -> Result<(ActivityKey, Vec<PipelineResource>)>;

    async fn apply(&self, key: &ActivityKey, resources: Vec<PipelineResource>) -> Result<()>;
}

/// [`PipelineEngine`] talking to a remote engine service over HTTP.
pub struct HttpEngine {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct CreateResponse {
    key: ActivityKey,
    #[serde(default)]
    resources: Vec<PipelineResource>,
}

#[derive(Debug, Serialize)]
struct ApplyRequest<'a> {
    key: &'a ActivityKey,
    resources: Vec<PipelineResource>,
}

impl HttpEngine {
    pub fn new(base_url: &str) -> Result<HttpEngine> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(60))
            .build()
            .context("Failed to build engine HTTP client")?;
        Ok(HttpEngine { client, base_url: base_url.trim_end_matches('/').to_string() })
    }

    async fn post<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &impl Serialize,
    ) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.client.post(&url).json(body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("POST {url} returned {status}: {body}"));
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl PipelineEngine for HttpEngine {
    async fn create(
        &self,
        params: &PipelineCreateParams,
    ) -> Result<(ActivityKey, Vec<PipelineResource>)> {
        let response: CreateResponse =
            self.post("/pipelines", params).await.context("Failed to create pipeline")?;
        Ok((response.key, response.resources))
    }

    async fn apply(&self, key: &ActivityKey, resources: Vec<PipelineResource>) -> Result<()> {
        let _: serde_json::Value = self
            .post("/pipelines/apply", &ApplyRequest { key, resources })
            .await
            .context("Failed to apply pipeline resources")?;
        Ok(())
    }
}

/// Recording engine for tests: hands out sequential build numbers and
/// remembers every call.
#[derive(Default)]
pub struct RecordingEngine {
    pub state: Mutex<RecordingState>,
}

#[derive(Default)]
pub struct RecordingState {
    pub created: Vec<PipelineCreateParams>,
    pub applied: Vec<ActivityKey>,
    pub fail_apply: bool,
    next_build: u64,
}

#[async_trait]
impl PipelineEngine for RecordingEngine {
    async fn create(
        &self,
        params: &PipelineCreateParams,
    ) -> Result<(ActivityKey, Vec<PipelineResource>)> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.next_build += 1;
        let job = params.env.get("JOB_NAME").cloned().unwrap_or_default();
        let key = ActivityKey {
            name: format!("{}-{}-{}", job, params.branch, state.next_build),
            build: state.next_build.to_string(),
        };
        state.created.push(params.clone());
        Ok((key, Vec::new()))
    }

    async fn apply(&self, key: &ActivityKey, _resources: Vec<PipelineResource>) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.fail_apply {
            return Err(anyhow!("scripted apply failure"));
        }
        state.applied.push(key.clone());
        Ok(())
    }
}
