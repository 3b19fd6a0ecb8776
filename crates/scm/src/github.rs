use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use lighthouse_core::config::MergeMethod;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::json;

use crate::provider::{MergeDetails, MergeError, ScmProvider};
use crate::types::{
    Branch, Change, Comment, CommitStatus, Label, PullRequest, Repository, Review, ReviewState,
    StatusInput, StatusState, User,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const PAGE_SIZE: usize = 100;

/// GitHub (and GitHub Enterprise) REST implementation of [`ScmProvider`].
#[derive(Clone)]
pub struct GithubProvider {
    client: reqwest::Client,
    api_base: String,
    token: String,
    bot: String,
}

impl GithubProvider {
    /// `server_url` empty targets github.com; otherwise the enterprise host.
    pub fn new(server_url: &str, token: &str, bot: &str) -> Result<GithubProvider> {
        let api_base = if server_url.is_empty() {
            "https://api.github.com".to_string()
        } else {
            format!("{}/api/v3", server_url.trim_end_matches('/'))
        };
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .user_agent("lighthouse")
            .build()
            .context("Failed to build HTTP client")?;
        Ok(GithubProvider { client, api_base, token: token.to_string(), bot: bot.to_string() })
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.api_base, path))
            .bearer_auth(&self.token)
            .header(reqwest::header::ACCEPT, "application/vnd.github+json")
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self.request(Method::GET, path).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("GET {path} returned {status}: {body}"));
        }
        Ok(response.json().await?)
    }

    async fn send_json(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<()> {
        let mut request = self.request(method.clone(), path);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("{method} {path} returned {status}: {body}"));
        }
        Ok(())
    }

    /// Fetch every page of a list endpoint. `path` must not carry a query.
    async fn get_all_pages<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<Vec<T>> {
        let mut items = Vec::new();
        let mut page = 1;
        loop {
            let batch: Vec<T> =
                self.get_json(&format!("{path}?per_page={PAGE_SIZE}&page={page}")).await?;
            let len = batch.len();
            items.extend(batch);
            if len < PAGE_SIZE {
                return Ok(items);
            }
            page += 1;
        }
    }
}

#[async_trait]
impl ScmProvider for GithubProvider {
    fn kind(&self) -> &str { "github" }

    fn bot_name(&self) -> &str { &self.bot }

    async fn get_repo(&self, owner: &str, name: &str) -> Result<Repository> {
        let wire: GhRepository = self.get_json(&format!("/repos/{owner}/{name}")).await?;
        Ok(wire.into())
    }

    async fn create_repo(&self, owner: &str, name: &str, private: bool) -> Result<Repository> {
        let body = json!({"name": name, "private": private});
        // Personal repos are created under the authenticated user.
        let path = if owner == self.bot { "/user/repos".to_string() } else { format!("/orgs/{owner}/repos") };
        let response = self
            .request(Method::POST, &path)
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(anyhow!("POST {path} returned {status}: {text}"));
        }
        let wire: GhRepository = response.json().await?;
        Ok(wire.into())
    }

    async fn list_branches(&self, owner: &str, name: &str) -> Result<Vec<Branch>> {
        let wire: Vec<GhBranch> =
            self.get_all_pages(&format!("/repos/{owner}/{name}/branches")).await?;
        Ok(wire.into_iter().map(|b| Branch { name: b.name, sha: b.commit.sha }).collect())
    }

    async fn create_hook(&self, owner: &str, name: &str, url: &str, secret: &str) -> Result<()> {
        let mut config = json!({"url": url, "content_type": "json"});
        if !secret.is_empty() {
            config["secret"] = json!(secret);
        }
        self.send_json(
            Method::POST,
            &format!("/repos/{owner}/{name}/hooks"),
            Some(json!({"config": config, "events": ["*"], "active": true})),
        )
        .await
    }

    async fn find_pull_request(
        &self,
        owner: &str,
        name: &str,
        number: u64,
    ) -> Result<PullRequest> {
        let wire: GhPullRequest =
            self.get_json(&format!("/repos/{owner}/{name}/pulls/{number}")).await?;
        Ok(wire.into())
    }

    async fn list_open_pull_requests(&self, owner: &str, name: &str) -> Result<Vec<PullRequest>> {
        let mut pulls = Vec::new();
        let mut page = 1;
        loop {
            let batch: Vec<GhPullRequest> = self
                .get_json(&format!(
                    "/repos/{owner}/{name}/pulls?state=open&per_page={PAGE_SIZE}&page={page}"
                ))
                .await?;
            let len = batch.len();
            pulls.extend(batch.into_iter().map(PullRequest::from));
            if len < PAGE_SIZE {
                return Ok(pulls);
            }
            page += 1;
        }
    }

    async fn merge_pull_request(
        &self,
        owner: &str,
        name: &str,
        number: u64,
        details: MergeDetails,
    ) -> Result<(), MergeError> {
        let mut body = json!({});
        if !details.sha.is_empty() {
            body["sha"] = json!(details.sha);
        }
        if let Some(method) = details.method {
            body["merge_method"] = json!(method.as_str());
        }
        if !details.commit_title.is_empty() {
            body["commit_title"] = json!(details.commit_title);
        }
        if !details.commit_message.is_empty() {
            body["commit_message"] = json!(details.commit_message);
        }
        let response = self
            .request(Method::PUT, &format!("/repos/{owner}/{name}/pulls/{number}/merge"))
            .json(&body)
            .send()
            .await
            .map_err(|e| MergeError::Provider(e.into()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let message = response.text().await.unwrap_or_default();
        Err(classify_merge_failure(status, &message, details.method))
    }

    async fn reopen_pull_request(&self, owner: &str, name: &str, number: u64) -> Result<()> {
        self.send_json(
            Method::PATCH,
            &format!("/repos/{owner}/{name}/pulls/{number}"),
            Some(json!({"state": "open"})),
        )
        .await
    }

    async fn close_pull_request(&self, owner: &str, name: &str, number: u64) -> Result<()> {
        self.send_json(
            Method::PATCH,
            &format!("/repos/{owner}/{name}/pulls/{number}"),
            Some(json!({"state": "closed"})),
        )
        .await
    }

    async fn list_comments(&self, owner: &str, name: &str, number: u64) -> Result<Vec<Comment>> {
        let wire: Vec<GhComment> =
            self.get_all_pages(&format!("/repos/{owner}/{name}/issues/{number}/comments")).await?;
        Ok(wire.into_iter().map(Comment::from).collect())
    }

    async fn create_comment(
        &self,
        owner: &str,
        name: &str,
        number: u64,
        body: &str,
    ) -> Result<()> {
        self.send_json(
            Method::POST,
            &format!("/repos/{owner}/{name}/issues/{number}/comments"),
            Some(json!({"body": body})),
        )
        .await
    }

    async fn update_comment(&self, owner: &str, name: &str, id: u64, body: &str) -> Result<()> {
        self.send_json(
            Method::PATCH,
            &format!("/repos/{owner}/{name}/issues/comments/{id}"),
            Some(json!({"body": body})),
        )
        .await
    }

    async fn delete_comment(&self, owner: &str, name: &str, id: u64) -> Result<()> {
        self.send_json(Method::DELETE, &format!("/repos/{owner}/{name}/issues/comments/{id}"), None)
            .await
    }

    async fn list_reviews(&self, owner: &str, name: &str, number: u64) -> Result<Vec<Review>> {
        let wire: Vec<GhReview> =
            self.get_all_pages(&format!("/repos/{owner}/{name}/pulls/{number}/reviews")).await?;
        Ok(wire.into_iter().map(Review::from).collect())
    }

    async fn request_review(
        &self,
        owner: &str,
        name: &str,
        number: u64,
        logins: &[String],
    ) -> Result<()> {
        self.send_json(
            Method::POST,
            &format!("/repos/{owner}/{name}/pulls/{number}/requested_reviewers"),
            Some(json!({"reviewers": logins})),
        )
        .await
        .with_context(|| format!("requesting review from {logins:?}"))
    }

    async fn unrequest_review(
        &self,
        owner: &str,
        name: &str,
        number: u64,
        logins: &[String],
    ) -> Result<()> {
        self.send_json(
            Method::DELETE,
            &format!("/repos/{owner}/{name}/pulls/{number}/requested_reviewers"),
            Some(json!({"reviewers": logins})),
        )
        .await
        .with_context(|| format!("unrequesting review from {logins:?}"))
    }

    async fn create_status(
        &self,
        owner: &str,
        name: &str,
        sha: &str,
        status: &StatusInput,
    ) -> Result<()> {
        let mut body = json!({
            "state": to_github_state(status.state),
            "context": status.label,
            "description": status.description,
        });
        if !status.target.is_empty() {
            body["target_url"] = json!(status.target);
        }
        self.send_json(Method::POST, &format!("/repos/{owner}/{name}/statuses/{sha}"), Some(body))
            .await
    }

    async fn list_statuses(
        &self,
        owner: &str,
        name: &str,
        sha: &str,
    ) -> Result<Vec<CommitStatus>> {
        let wire: Vec<GhStatus> =
            self.get_all_pages(&format!("/repos/{owner}/{name}/commits/{sha}/statuses")).await?;
        Ok(wire.into_iter().map(CommitStatus::from).collect())
    }

    async fn list_changes(&self, owner: &str, name: &str, number: u64) -> Result<Vec<Change>> {
        let wire: Vec<GhFile> =
            self.get_all_pages(&format!("/repos/{owner}/{name}/pulls/{number}/files")).await?;
        Ok(wire.into_iter().map(|f| Change { path: f.filename }).collect())
    }

    async fn add_label(&self, owner: &str, name: &str, number: u64, label: &str) -> Result<()> {
        self.send_json(
            Method::POST,
            &format!("/repos/{owner}/{name}/issues/{number}/labels"),
            Some(json!({"labels": [label]})),
        )
        .await
    }

    async fn remove_label(&self, owner: &str, name: &str, number: u64, label: &str) -> Result<()> {
        self.send_json(
            Method::DELETE,
            &format!("/repos/{owner}/{name}/issues/{number}/labels/{label}"),
            None,
        )
        .await
    }
}

/// GitHub only reports pending/success/failure/error on commit statuses.
fn to_github_state(state: StatusState) -> &'static str {
    match state {
        StatusState::Success => "success",
        StatusState::Failure => "failure",
        StatusState::Error | StatusState::Canceled => "error",
        _ => "pending",
    }
}

fn classify_merge_failure(
    status: StatusCode,
    message: &str,
    method: Option<MergeMethod>,
) -> MergeError {
    let lower = message.to_ascii_lowercase();
    match status {
        StatusCode::CONFLICT if lower.contains("head branch was modified") => {
            MergeError::ModifiedHead(message.to_string())
        }
        StatusCode::CONFLICT if lower.contains("base branch was modified") => {
            MergeError::BaseChanged(message.to_string())
        }
        StatusCode::METHOD_NOT_ALLOWED
            if method == Some(MergeMethod::Merge) && lower.contains("not allowed") =>
        {
            MergeError::MergeCommitsForbidden(message.to_string())
        }
        StatusCode::METHOD_NOT_ALLOWED | StatusCode::CONFLICT => {
            MergeError::Unmergable(message.to_string())
        }
        StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED => {
            MergeError::UnauthorizedToPush(message.to_string())
        }
        _ => MergeError::Provider(anyhow!("merge returned {status}: {message}")),
    }
}

// GitHub wire shapes.

#[derive(Debug, Default, Deserialize)]
struct GhUser {
    #[serde(default)]
    login: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    avatar_url: String,
}

impl From<GhUser> for User {
    fn from(wire: GhUser) -> Self {
        User { login: wire.login, name: wire.name.unwrap_or_default(), avatar: wire.avatar_url }
    }
}

#[derive(Debug, Deserialize)]
struct GhRepository {
    #[serde(default)]
    id: u64,
    name: String,
    #[serde(default)]
    owner: GhUser,
    #[serde(default)]
    default_branch: String,
    #[serde(default)]
    clone_url: String,
    #[serde(default)]
    html_url: String,
}

impl From<GhRepository> for Repository {
    fn from(wire: GhRepository) -> Self {
        Repository {
            id: wire.id,
            namespace: wire.owner.login,
            name: wire.name,
            branch: wire.default_branch,
            clone_url: wire.clone_url,
            link: wire.html_url,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct GhRef {
    #[serde(rename = "ref", default)]
    name: String,
    #[serde(default)]
    sha: String,
}

#[derive(Debug, Deserialize)]
struct GhPullRequest {
    number: u64,
    #[serde(default)]
    title: String,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    user: GhUser,
    #[serde(default)]
    labels: Vec<Label>,
    #[serde(default)]
    mergeable: Option<bool>,
    #[serde(default)]
    requested_reviewers: Vec<GhUser>,
    #[serde(default)]
    head: GhRef,
    #[serde(default)]
    base: GhRef,
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default)]
    html_url: String,
    #[serde(default)]
    state: String,
}

impl From<GhPullRequest> for PullRequest {
    fn from(wire: GhPullRequest) -> Self {
        let created = wire.created_at.as_deref().and_then(|t| {
            time::OffsetDateTime::parse(t, &time::format_description::well_known::Rfc3339).ok()
        });
        PullRequest {
            number: wire.number,
            sha: wire.head.sha,
            title: wire.title,
            body: wire.body.unwrap_or_default(),
            author: wire.user.into(),
            labels: wire.labels,
            mergeable: wire.mergeable,
            requested_reviewers: wire.requested_reviewers.into_iter().map(User::from).collect(),
            head_ref: wire.head.name,
            base_ref: wire.base.name,
            base_sha: wire.base.sha,
            created,
            link: wire.html_url,
            closed: wire.state == "closed",
        }
    }
}

#[derive(Debug, Deserialize)]
struct GhBranch {
    name: String,
    #[serde(default)]
    commit: GhCommitRef,
}

#[derive(Debug, Default, Deserialize)]
struct GhCommitRef {
    #[serde(default)]
    sha: String,
}

#[derive(Debug, Deserialize)]
struct GhComment {
    id: u64,
    #[serde(default)]
    body: String,
    #[serde(default)]
    user: GhUser,
}

impl From<GhComment> for Comment {
    fn from(wire: GhComment) -> Self {
        Comment { id: wire.id, body: wire.body, author: wire.user.into() }
    }
}

#[derive(Debug, Deserialize)]
struct GhReview {
    #[serde(default)]
    user: GhUser,
    #[serde(default)]
    state: String,
    #[serde(default)]
    submitted_at: Option<String>,
}

impl From<GhReview> for Review {
    fn from(wire: GhReview) -> Self {
        let state = match wire.state.to_ascii_uppercase().as_str() {
            "APPROVED" => ReviewState::Approved,
            "CHANGES_REQUESTED" => ReviewState::ChangesRequested,
            "COMMENTED" => ReviewState::Commented,
            "DISMISSED" => ReviewState::Dismissed,
            _ => ReviewState::Pending,
        };
        let submitted = wire.submitted_at.as_deref().and_then(|t| {
            time::OffsetDateTime::parse(t, &time::format_description::well_known::Rfc3339).ok()
        });
        Review { author: wire.user.into(), state, submitted }
    }
}

#[derive(Debug, Deserialize)]
struct GhStatus {
    #[serde(default)]
    state: String,
    #[serde(default)]
    context: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    target_url: Option<String>,
}

impl From<GhStatus> for CommitStatus {
    fn from(wire: GhStatus) -> Self {
        CommitStatus {
            state: StatusState::parse(&wire.state),
            label: wire.context,
            description: wire.description.unwrap_or_default(),
            target: wire.target_url.unwrap_or_default(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct GhFile {
    filename: String,
}
