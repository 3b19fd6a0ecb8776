use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::job::PipelineState;

/// Progress report emitted by the pipeline engine for one execution.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct ActivityRecord {
    pub name: String,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub repo: String,
    #[serde(default)]
    pub branch: String,
    #[serde(default)]
    pub build_identifier: String,
    #[serde(default)]
    pub context: String,
    #[serde(default)]
    pub git_url: String,
    #[serde(default)]
    pub last_commit_sha: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<PipelineState>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub start_time: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub completion_time: Option<OffsetDateTime>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stages: Vec<ActivityStage>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct ActivityStage {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<PipelineState>,
}

impl ActivityRecord {
    /// Names of stages currently running, in declaration order.
    pub fn running_stages(&self) -> Vec<&str> {
        self.stages
            .iter()
            .filter(|s| s.status == Some(PipelineState::Running))
            .map(|s| s.name.as_str())
            .collect()
    }
}
