use anyhow::Result;
use async_trait::async_trait;
use lighthouse_core::config::MergeMethod;
use thiserror::Error;

use crate::types::{
    Branch, Change, Comment, CommitStatus, PullRequest, Repository, Review, StatusInput,
};

/// Why the provider refused to merge a pull request. Callers match on the
/// variant to decide whether to re-queue, label, or give up.
#[derive(Debug, Error)]
pub enum MergeError {
    #[error("pull request head changed: {0}")]
    ModifiedHead(String),
    #[error("pull request is not mergeable: {0}")]
    Unmergable(String),
    #[error("base branch changed before the merge: {0}")]
    BaseChanged(String),
    #[error("not authorized to push: {0}")]
    UnauthorizedToPush(String),
    #[error("merge commits are forbidden on this repository: {0}")]
    MergeCommitsForbidden(String),
    #[error(transparent)]
    Provider(#[from] anyhow::Error),
}

/// Optional extra parameters for a merge.
#[derive(Debug, Clone, Default)]
pub struct MergeDetails {
    /// Expected head SHA; the provider rejects the merge if the head moved.
    pub sha: String,
    pub method: Option<MergeMethod>,
    pub commit_title: String,
    pub commit_message: String,
}

/// Uniform view over the git provider's API.
///
/// One implementation exists per provider kind; callers hold `Arc<dyn
/// ScmProvider>` and never see provider wire types.
#[async_trait]
pub trait ScmProvider: Send + Sync {
    /// Provider kind: `github`, `gitlab`, `bitbucketserver`, `stash`, `gitea`.
    fn kind(&self) -> &str;

    /// Login of the bot user the client acts as.
    fn bot_name(&self) -> &str;

    async fn get_repo(&self, owner: &str, name: &str) -> Result<Repository>;

    async fn create_repo(&self, owner: &str, name: &str, private: bool) -> Result<Repository>;

    async fn list_branches(&self, owner: &str, name: &str) -> Result<Vec<Branch>>;

    /// Register a webhook subscribed to every event.
    async fn create_hook(&self, owner: &str, name: &str, url: &str, secret: &str) -> Result<()>;

    async fn find_pull_request(&self, owner: &str, name: &str, number: u64)
    -> Result<PullRequest>;

    async fn list_open_pull_requests(&self, owner: &str, name: &str) -> Result<Vec<PullRequest>>;

    async fn merge_pull_request(
        &self,
        owner: &str,
        name: &str,
        number: u64,
        details: MergeDetails,
    ) -> Result<(), MergeError>;

    async fn reopen_pull_request(&self, owner: &str, name: &str, number: u64) -> Result<()>;

    async fn close_pull_request(&self, owner: &str, name: &str, number: u64) -> Result<()>;

    async fn list_comments(&self, owner: &str, name: &str, number: u64) -> Result<Vec<Comment>>;

    async fn create_comment(&self, owner: &str, name: &str, number: u64, body: &str)
    -> Result<()>;

    async fn update_comment(&self, owner: &str, name: &str, id: u64, body: &str) -> Result<()>;

    async fn delete_comment(&self, owner: &str, name: &str, id: u64) -> Result<()>;

    async fn list_reviews(&self, owner: &str, name: &str, number: u64) -> Result<Vec<Review>>;

    async fn request_review(
        &self,
        owner: &str,
        name: &str,
        number: u64,
        logins: &[String],
    ) -> Result<()>;

    async fn unrequest_review(
        &self,
        owner: &str,
        name: &str,
        number: u64,
        logins: &[String],
    ) -> Result<()>;

    async fn create_status(
        &self,
        owner: &str,
        name: &str,
        sha: &str,
        status: &StatusInput,
    ) -> Result<()>;

    async fn list_statuses(&self, owner: &str, name: &str, sha: &str)
    -> Result<Vec<CommitStatus>>;

    async fn list_changes(&self, owner: &str, name: &str, number: u64) -> Result<Vec<Change>>;

    async fn add_label(&self, owner: &str, name: &str, number: u64, label: &str) -> Result<()>;

    async fn remove_label(&self, owner: &str, name: &str, number: u64, label: &str) -> Result<()>;
}
