use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Provider-neutral commit status state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusState {
    #[default]
    Unknown,
    Pending,
    Running,
    Success,
    Failure,
    Error,
    Canceled,
}

impl StatusState {
    pub fn as_str(self) -> &'static str {
        match self {
            StatusState::Unknown => "unknown",
            StatusState::Pending => "pending",
            StatusState::Running => "running",
            StatusState::Success => "success",
            StatusState::Failure => "failure",
            StatusState::Error => "error",
            StatusState::Canceled => "canceled",
        }
    }

    pub fn parse(text: &str) -> StatusState {
        match text {
            "pending" => StatusState::Pending,
            "running" => StatusState::Running,
            "success" => StatusState::Success,
            "failure" => StatusState::Failure,
            "error" => StatusState::Error,
            "canceled" => StatusState::Canceled,
            _ => StatusState::Unknown,
        }
    }

    /// Whether this state concludes reporting for a commit. Concluded states
    /// are never reported over.
    pub fn is_concluded(self) -> bool {
        matches!(
            self,
            StatusState::Success | StatusState::Failure | StatusState::Error | StatusState::Canceled
        )
    }
}

impl std::fmt::Display for StatusState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct User {
    pub login: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub avatar: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Label {
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Repository {
    #[serde(default)]
    pub id: u64,
    /// Owner (user or organization) of the repository.
    pub namespace: String,
    pub name: String,
    /// Default branch.
    #[serde(default)]
    pub branch: String,
    #[serde(default)]
    pub clone_url: String,
    #[serde(default)]
    pub link: String,
}

impl Repository {
    pub fn full_name(&self) -> String { format!("{}/{}", self.namespace, self.name) }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct PullRequest {
    pub number: u64,
    /// Head commit SHA.
    pub sha: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub author: User,
    #[serde(default)]
    pub labels: Vec<Label>,
    /// `None` when the provider has not computed mergeability yet.
    #[serde(default)]
    pub mergeable: Option<bool>,
    /// Reviewers asked for a review who have not submitted one yet.
    #[serde(default)]
    pub requested_reviewers: Vec<User>,
    #[serde(default)]
    pub head_ref: String,
    #[serde(default)]
    pub base_ref: String,
    #[serde(default)]
    pub base_sha: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub created: Option<OffsetDateTime>,
    #[serde(default)]
    pub link: String,
    #[serde(default)]
    pub closed: bool,
}

impl PullRequest {
    pub fn has_label(&self, name: &str) -> bool { self.labels.iter().any(|l| l.name == name) }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewState {
    #[default]
    Pending,
    Commented,
    Approved,
    ChangesRequested,
    Dismissed,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Review {
    #[serde(default)]
    pub author: User,
    #[serde(default)]
    pub state: ReviewState,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub submitted: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Comment {
    pub id: u64,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub author: User,
}

/// A commit status to create.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct StatusInput {
    pub state: StatusState,
    /// Status label, i.e. the check's context.
    pub label: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub target: String,
}

/// A commit status as reported by the provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct CommitStatus {
    pub state: StatusState,
    pub label: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub target: String,
}

/// A changed file within a pull request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Change {
    pub path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Branch {
    pub name: String,
    #[serde(default)]
    pub sha: String,
}
