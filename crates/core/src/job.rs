use std::collections::BTreeMap;
use std::fmt;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::activity::ActivityRecord;

pub const JOB_NAME_ENV: &str = "JOB_NAME";
pub const JOB_TYPE_ENV: &str = "JOB_TYPE";
pub const JOB_SPEC_ENV: &str = "JOB_SPEC";
pub const REPO_NAME_ENV: &str = "REPO_NAME";
pub const REPO_OWNER_ENV: &str = "REPO_OWNER";
pub const PULL_BASE_REF_ENV: &str = "PULL_BASE_REF";
pub const PULL_BASE_SHA_ENV: &str = "PULL_BASE_SHA";
pub const PULL_REFS_ENV: &str = "PULL_REFS";
pub const PULL_NUMBER_ENV: &str = "PULL_NUMBER";
pub const PULL_PULL_SHA_ENV: &str = "PULL_PULL_SHA";

/// Commit status label used when a job does not declare one.
pub const DEFAULT_CONTEXT: &str = "lighthouse";

/// Label carrying the engine build identifier on a job.
pub const BUILD_NUM_LABEL: &str = "lighthouse.jenkins-x.io/buildNum";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    Presubmit,
    Postsubmit,
    Batch,
    Periodic,
}

impl JobType {
    pub fn as_str(self) -> &'static str {
        match self {
            JobType::Presubmit => "presubmit",
            JobType::Postsubmit => "postsubmit",
            JobType::Batch => "batch",
            JobType::Periodic => "periodic",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Execution state of a pipeline.
///
/// States advance `triggered -> pending -> running` and then settle in one of
/// the terminal states. Terminal states never transition again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
    Triggered,
    Pending,
    Running,
    Success,
    Failure,
    Aborted,
    Error,
}

impl PipelineState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PipelineState::Success
                | PipelineState::Failure
                | PipelineState::Aborted
                | PipelineState::Error
        )
    }

    fn rank(self) -> u8 {
        match self {
            PipelineState::Triggered => 0,
            PipelineState::Pending => 1,
            PipelineState::Running => 2,
            _ => 3,
        }
    }

    /// Whether moving to `next` preserves monotonicity. Terminal states admit
    /// no further transitions; non-terminal states never move backwards.
    pub fn can_transition(self, next: PipelineState) -> bool {
        if self == next {
            return true;
        }
        !self.is_terminal() && next.rank() >= self.rank()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PipelineState::Triggered => "triggered",
            PipelineState::Pending => "pending",
            PipelineState::Running => "running",
            PipelineState::Success => "success",
            PipelineState::Failure => "failure",
            PipelineState::Aborted => "aborted",
            PipelineState::Error => "error",
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// A pull request referenced by a job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Pull {
    pub number: u64,
    pub sha: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub title: String,
    #[serde(default, rename = "ref", skip_serializing_if = "String::is_empty")]
    pub pull_ref: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub link: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub author_login: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub commit_link: String,
}

/// The git coordinates a job runs against.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Refs {
    pub org: String,
    pub repo: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub repo_link: String,
    pub base_ref: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub base_sha: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pulls: Vec<Pull>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub clone_url: String,
}

impl Refs {
    pub fn full_name(&self) -> String { format!("{}/{}", self.org, self.repo) }

    /// Canonical pull-refs string: `baseRef:baseSHA[,number:sha]*`.
    pub fn pull_refs(&self) -> String {
        let mut out = format!("{}:{}", self.base_ref, self.base_sha);
        for pull in &self.pulls {
            out.push_str(&format!(",{}:{}", pull.number, pull.sha));
        }
        out
    }
}

/// Parse a canonical pull-refs string back into its parts.
///
/// Inverse of [`Refs::pull_refs`] for well-formed inputs.
pub fn parse_pull_refs(text: &str) -> Result<(String, String, Vec<Pull>)> {
    let mut parts = text.split(',');
    let base = parts.next().unwrap_or_default();
    let (base_ref, base_sha) =
        base.split_once(':').with_context(|| format!("malformed base ref in {text:?}"))?;
    if base_ref.is_empty() {
        bail!("empty base ref in {text:?}");
    }
    let mut pulls = Vec::new();
    for part in parts {
        let (number, sha) =
            part.split_once(':').with_context(|| format!("malformed pull ref {part:?}"))?;
        let number: u64 =
            number.parse().with_context(|| format!("malformed pull number {number:?}"))?;
        pulls.push(Pull { number, sha: sha.to_string(), ..Pull::default() });
    }
    Ok((base_ref.to_string(), base_sha.to_string(), pulls))
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct JobSpec {
    #[serde(rename = "type")]
    pub job_type: JobType,
    /// Logical pipeline name from configuration.
    pub job: String,
    #[serde(default)]
    pub context: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refs: Option<Refs>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub rerun_command: String,
    #[serde(default)]
    pub max_concurrency: u32,
}

impl Default for JobType {
    fn default() -> Self { JobType::Presubmit }
}

impl JobSpec {
    /// The commit status label this job reports under.
    pub fn context(&self) -> &str {
        if self.context.is_empty() { DEFAULT_CONTEXT } else { &self.context }
    }

    /// Environment exported to the pipeline.
    pub fn env_vars(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert(JOB_NAME_ENV.to_string(), self.job.clone());
        env.insert(JOB_TYPE_ENV.to_string(), self.job_type.to_string());
        env.insert(JOB_SPEC_ENV.to_string(), format!("type:{}", self.job_type));
        let Some(refs) = &self.refs else {
            return env;
        };
        env.insert(REPO_NAME_ENV.to_string(), refs.repo.clone());
        env.insert(REPO_OWNER_ENV.to_string(), refs.org.clone());
        env.insert(PULL_BASE_REF_ENV.to_string(), refs.base_ref.clone());
        env.insert(PULL_BASE_SHA_ENV.to_string(), refs.base_sha.clone());
        env.insert(PULL_REFS_ENV.to_string(), refs.pull_refs());
        if self.job_type == JobType::Presubmit
            && let Some(pull) = refs.pulls.first()
        {
            env.insert(PULL_NUMBER_ENV.to_string(), pull.number.to_string());
            env.insert(PULL_PULL_SHA_ENV.to_string(), pull.sha.clone());
        }
        env
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct JobStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<PipelineState>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub activity_name: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub start_time: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub completion_time: Option<OffsetDateTime>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_commit_sha: String,
    /// Last commit status state reported to the provider, as its wire string.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_report_state: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub report_url: String,
    /// Latest progress report from the pipeline engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity: Option<ActivityRecord>,
}

impl JobStatus {
    /// Apply a state transition, refusing any move that would regress the
    /// monotone state machine. Returns whether the state changed.
    pub fn transition(&mut self, next: PipelineState) -> bool {
        match self.state {
            Some(current) if !current.can_transition(next) => {
                tracing::debug!("Refusing state transition {current} -> {next}");
                false
            }
            Some(current) if current == next => false,
            _ => {
                self.state = Some(next);
                true
            }
        }
    }
}

/// A stored pipeline job record.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Job {
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Bumped by the store on every write; guards compare-and-update.
    #[serde(default)]
    pub resource_version: u64,
    pub spec: JobSpec,
    #[serde(default)]
    pub status: JobStatus,
}

/// Reduce a name to the DNS-safe form the cluster accepts.
pub fn to_valid_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.is_empty() && !out.ends_with('-') {
            out.push('-');
        }
    }
    out.trim_end_matches('-').to_string()
}
