use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use thiserror::Error;

use crate::types::{Comment, Label, PullRequest, Repository, Review, ReviewState, User};

/// Kinds of webhook events, plus the synthetic `activity` payload the status
/// reconciler fans out to external plugins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WebhookKind {
    Push,
    PullRequest,
    Branch,
    IssueComment,
    PullRequestComment,
    Review,
    Ping,
    Activity,
}

impl WebhookKind {
    pub fn as_str(self) -> &'static str {
        match self {
            WebhookKind::Push => "push",
            WebhookKind::PullRequest => "pull_request",
            WebhookKind::Branch => "branch",
            WebhookKind::IssueComment => "issue_comment",
            WebhookKind::PullRequestComment => "pull_request_comment",
            WebhookKind::Review => "review",
            WebhookKind::Ping => "ping",
            WebhookKind::Activity => "activity",
        }
    }
}

impl std::fmt::Display for WebhookKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed webhook event carrying the minimal payload handlers need.
#[derive(Debug, Clone)]
pub enum Webhook {
    Push(PushHook),
    PullRequest(PullRequestHook),
    Branch(BranchHook),
    IssueComment(IssueCommentHook),
    PullRequestComment(PullRequestCommentHook),
    Review(ReviewHook),
    Ping(PingHook),
}

impl Webhook {
    pub fn kind(&self) -> WebhookKind {
        match self {
            Webhook::Push(_) => WebhookKind::Push,
            Webhook::PullRequest(_) => WebhookKind::PullRequest,
            Webhook::Branch(_) => WebhookKind::Branch,
            Webhook::IssueComment(_) => WebhookKind::IssueComment,
            Webhook::PullRequestComment(_) => WebhookKind::PullRequestComment,
            Webhook::Review(_) => WebhookKind::Review,
            Webhook::Ping(_) => WebhookKind::Ping,
        }
    }

    pub fn repository(&self) -> Option<&Repository> {
        match self {
            Webhook::Push(h) => Some(&h.repository),
            Webhook::PullRequest(h) => Some(&h.repository),
            Webhook::Branch(h) => Some(&h.repository),
            Webhook::IssueComment(h) => Some(&h.repository),
            Webhook::PullRequestComment(h) => Some(&h.repository),
            Webhook::Review(h) => Some(&h.repository),
            Webhook::Ping(h) => h.repository.as_ref(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookAction {
    Opened,
    Reopened,
    Synchronized,
    Closed,
    Created,
    Edited,
    Deleted,
    Labeled,
    Unlabeled,
    Submitted,
    Other,
}

impl HookAction {
    fn parse(text: &str) -> HookAction {
        match text {
            "opened" => HookAction::Opened,
            "reopened" => HookAction::Reopened,
            "synchronize" | "synchronized" => HookAction::Synchronized,
            "closed" => HookAction::Closed,
            "created" => HookAction::Created,
            "edited" => HookAction::Edited,
            "deleted" => HookAction::Deleted,
            "labeled" => HookAction::Labeled,
            "unlabeled" => HookAction::Unlabeled,
            "submitted" => HookAction::Submitted,
            _ => HookAction::Other,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PushHook {
    /// Full git ref that was pushed, e.g. `refs/heads/master`.
    pub git_ref: String,
    pub before: String,
    pub after: String,
    pub repository: Repository,
    pub sender: User,
}

impl PushHook {
    /// Branch name with the `refs/heads/` prefix stripped.
    pub fn branch(&self) -> &str { self.git_ref.strip_prefix("refs/heads/").unwrap_or(&self.git_ref) }
}

#[derive(Debug, Clone)]
pub struct PullRequestHook {
    pub action: HookAction,
    pub pull_request: PullRequest,
    pub repository: Repository,
    pub sender: User,
}

#[derive(Debug, Clone)]
pub struct BranchHook {
    pub action: HookAction,
    pub git_ref: String,
    pub repository: Repository,
    pub sender: User,
}

#[derive(Debug, Clone)]
pub struct IssueCommentHook {
    pub action: HookAction,
    pub issue_number: u64,
    pub issue_title: String,
    pub is_pull_request: bool,
    pub comment: Comment,
    pub repository: Repository,
    pub sender: User,
}

#[derive(Debug, Clone)]
pub struct PullRequestCommentHook {
    pub action: HookAction,
    pub pull_request: PullRequest,
    pub comment: Comment,
    pub repository: Repository,
    pub sender: User,
}

#[derive(Debug, Clone)]
pub struct ReviewHook {
    pub action: HookAction,
    pub pull_request: PullRequest,
    pub review: Review,
    pub repository: Repository,
}

#[derive(Debug, Clone)]
pub struct PingHook {
    pub repository: Option<Repository>,
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("missing event kind header")]
    MissingKind,
    #[error("missing signature header")]
    MissingSignature,
    #[error("malformed signature header")]
    MalformedSignature,
    #[error("signature mismatch")]
    SignatureMismatch,
    #[error("empty payload")]
    EmptyPayload,
    #[error("malformed payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Validate `signature` (`sha256=<hex>`) over `body` with `secret`.
pub fn validate_signature(
    secret: &str,
    signature: Option<&str>,
    body: &[u8],
) -> Result<(), ParseError> {
    let signature = signature.ok_or(ParseError::MissingSignature)?;
    let hex_digest =
        signature.strip_prefix("sha256=").ok_or(ParseError::MalformedSignature)?;
    let digest = hex::decode(hex_digest).map_err(|_| ParseError::MalformedSignature)?;
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|_| ParseError::MalformedSignature)?;
    mac.update(body);
    mac.verify_slice(&digest).map_err(|_| ParseError::SignatureMismatch)
}

/// Sign `body` with `secret`, producing the header value for re-dispatch.
pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Parse a webhook envelope into the event union.
///
/// When `secret` is set the signature is validated first. Returns `Ok(None)`
/// for event kinds this system does not dispatch on.
pub fn parse_webhook(
    kind: &str,
    signature: Option<&str>,
    body: &[u8],
    secret: Option<&str>,
) -> Result<Option<Webhook>, ParseError> {
    if let Some(secret) = secret.filter(|s| !s.is_empty()) {
        validate_signature(secret, signature, body)?;
    }
    if body.is_empty() {
        return Err(ParseError::EmptyPayload);
    }
    let hook = match kind {
        "push" => {
            let wire: WirePush = serde_json::from_slice(body)?;
            Some(Webhook::Push(PushHook {
                git_ref: wire.git_ref,
                before: wire.before,
                after: wire.after,
                repository: wire.repository.into(),
                sender: wire.sender.into(),
            }))
        }
        "pull_request" => {
            let wire: WirePullRequestEvent = serde_json::from_slice(body)?;
            Some(Webhook::PullRequest(PullRequestHook {
                action: HookAction::parse(&wire.action),
                pull_request: wire.pull_request.into(),
                repository: wire.repository.into(),
                sender: wire.sender.into(),
            }))
        }
        "create" | "delete" => {
            let wire: WireBranchEvent = serde_json::from_slice(body)?;
            Some(Webhook::Branch(BranchHook {
                action: if kind == "create" { HookAction::Created } else { HookAction::Deleted },
                git_ref: wire.git_ref,
                repository: wire.repository.into(),
                sender: wire.sender.into(),
            }))
        }
        "issue_comment" => {
            let wire: WireIssueCommentEvent = serde_json::from_slice(body)?;
            Some(Webhook::IssueComment(IssueCommentHook {
                action: HookAction::parse(&wire.action),
                issue_number: wire.issue.number,
                issue_title: wire.issue.title,
                is_pull_request: wire.issue.pull_request.is_some(),
                comment: wire.comment.into(),
                repository: wire.repository.into(),
                sender: wire.sender.into(),
            }))
        }
        "pull_request_review_comment" => {
            let wire: WirePullRequestCommentEvent = serde_json::from_slice(body)?;
            Some(Webhook::PullRequestComment(PullRequestCommentHook {
                action: HookAction::parse(&wire.action),
                pull_request: wire.pull_request.into(),
                comment: wire.comment.into(),
                repository: wire.repository.into(),
                sender: wire.sender.into(),
            }))
        }
        "pull_request_review" => {
            let wire: WireReviewEvent = serde_json::from_slice(body)?;
            Some(Webhook::Review(ReviewHook {
                action: HookAction::parse(&wire.action),
                pull_request: wire.pull_request.into(),
                review: wire.review.into(),
                repository: wire.repository.into(),
            }))
        }
        "ping" => {
            let wire: WirePing = serde_json::from_slice(body)?;
            Some(Webhook::Ping(PingHook { repository: wire.repository.map(Into::into) }))
        }
        _ => None,
    };
    Ok(hook)
}

// Wire shapes, kept private to the parser.

#[derive(Debug, Default, Deserialize)]
struct WireUser {
    #[serde(default)]
    login: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    avatar_url: String,
}

impl From<WireUser> for User {
    fn from(wire: WireUser) -> Self {
        User { login: wire.login, name: wire.name.unwrap_or_default(), avatar: wire.avatar_url }
    }
}

#[derive(Debug, Default, Deserialize)]
struct WireRepository {
    #[serde(default)]
    id: u64,
    name: String,
    #[serde(default)]
    owner: WireUser,
    #[serde(default)]
    default_branch: String,
    #[serde(default)]
    clone_url: String,
    #[serde(default)]
    html_url: String,
}

impl From<WireRepository> for Repository {
    fn from(wire: WireRepository) -> Self {
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
struct WireRef {
    #[serde(rename = "ref", default)]
    name: String,
    #[serde(default)]
    sha: String,
}

#[derive(Debug, Deserialize)]
struct WirePullRequest {
    number: u64,
    #[serde(default)]
    title: String,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    user: WireUser,
    #[serde(default)]
    labels: Vec<Label>,
    #[serde(default)]
    mergeable: Option<bool>,
    #[serde(default)]
    requested_reviewers: Vec<WireUser>,
    #[serde(default)]
    head: WireRef,
    #[serde(default)]
    base: WireRef,
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default)]
    html_url: String,
    #[serde(default)]
    state: String,
}

impl From<WirePullRequest> for PullRequest {
    fn from(wire: WirePullRequest) -> Self {
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

#[derive(Debug, Default, Deserialize)]
struct WireComment {
    #[serde(default)]
    id: u64,
    #[serde(default)]
    body: String,
    #[serde(default)]
    user: WireUser,
}

impl From<WireComment> for Comment {
    fn from(wire: WireComment) -> Self {
        Comment { id: wire.id, body: wire.body, author: wire.user.into() }
    }
}

#[derive(Debug, Deserialize)]
struct WirePush {
    #[serde(rename = "ref")]
    git_ref: String,
    #[serde(default)]
    before: String,
    #[serde(default)]
    after: String,
    repository: WireRepository,
    #[serde(default)]
    sender: WireUser,
}

#[derive(Debug, Deserialize)]
struct WirePullRequestEvent {
    action: String,
    pull_request: WirePullRequest,
    repository: WireRepository,
    #[serde(default)]
    sender: WireUser,
}

#[derive(Debug, Deserialize)]
struct WireBranchEvent {
    #[serde(rename = "ref", default)]
    git_ref: String,
    repository: WireRepository,
    #[serde(default)]
    sender: WireUser,
}

#[derive(Debug, Default, Deserialize)]
struct WireIssue {
    #[serde(default)]
    number: u64,
    #[serde(default)]
    title: String,
    #[serde(default)]
    pull_request: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct WireIssueCommentEvent {
    action: String,
    issue: WireIssue,
    comment: WireComment,
    repository: WireRepository,
    #[serde(default)]
    sender: WireUser,
}

#[derive(Debug, Deserialize)]
struct WirePullRequestCommentEvent {
    action: String,
    pull_request: WirePullRequest,
    comment: WireComment,
    repository: WireRepository,
    #[serde(default)]
    sender: WireUser,
}

#[derive(Debug, Default, Deserialize)]
struct WireReview {
    #[serde(default)]
    user: WireUser,
    #[serde(default)]
    state: String,
    #[serde(default)]
    submitted_at: Option<String>,
}

impl From<WireReview> for Review {
    fn from(wire: WireReview) -> Self {
        let state = match wire.state.to_ascii_lowercase().as_str() {
            "approved" => ReviewState::Approved,
            "changes_requested" => ReviewState::ChangesRequested,
            "commented" => ReviewState::Commented,
            "dismissed" => ReviewState::Dismissed,
            _ => ReviewState::Pending,
        };
        let submitted = wire.submitted_at.as_deref().and_then(|t| {
            time::OffsetDateTime::parse(t, &time::format_description::well_known::Rfc3339).ok()
        });
        Review { author: wire.user.into(), state, submitted }
    }
}

#[derive(Debug, Deserialize)]
struct WireReviewEvent {
    action: String,
    pull_request: WirePullRequest,
    review: WireReview,
    repository: WireRepository,
}

#[derive(Debug, Deserialize)]
struct WirePing {
    #[serde(default)]
    repository: Option<WireRepository>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const PR_BODY: &str = r#"{
        "action": "opened",
        "pull_request": {
            "number": 7,
            "title": "Add thing",
            "user": {"login": "dev"},
            "head": {"ref": "feature", "sha": "abc"},
            "base": {"ref": "master", "sha": "def"},
            "labels": [{"name": "p/high"}],
            "requested_reviewers": [{"login": "alice"}],
            "state": "open"
        },
        "repository": {
            "name": "repo",
            "owner": {"login": "org"},
            "default_branch": "master",
            "clone_url": "https://github.com/org/repo.git",
            "html_url": "https://github.com/org/repo"
        },
        "sender": {"login": "dev"}
    }"#;

    #[test]
    fn test_parse_pull_request_event() {
        let hook = parse_webhook("pull_request", None, PR_BODY.as_bytes(), None).unwrap().unwrap();
        assert_eq!(hook.kind(), WebhookKind::PullRequest);
        assert_eq!(hook.repository().unwrap().full_name(), "org/repo");
        let Webhook::PullRequest(pr) = hook else {
            panic!("expected pull request hook");
        };
        assert_eq!(pr.action, HookAction::Opened);
        assert_eq!(pr.pull_request.number, 7);
        assert_eq!(pr.pull_request.sha, "abc");
        assert_eq!(pr.pull_request.base_ref, "master");
        assert!(pr.pull_request.has_label("p/high"));
        assert_eq!(pr.pull_request.requested_reviewers[0].login, "alice");
    }

    #[test]
    fn test_parse_unknown_kind() {
        let hook = parse_webhook("workflow_dispatch", None, b"{}", None).unwrap();
        assert!(hook.is_none());
    }

    #[test]
    fn test_signature_validation() {
        let secret = "topsecret";
        let body = PR_BODY.as_bytes();
        let header = sign(secret, body);

        let hook = parse_webhook("pull_request", Some(&header), body, Some(secret)).unwrap();
        assert!(hook.is_some());

        let err = parse_webhook("pull_request", Some("sha256=00ff"), body, Some(secret))
            .expect_err("bad signature must fail");
        assert!(matches!(err, ParseError::SignatureMismatch));

        let err = parse_webhook("pull_request", None, body, Some(secret))
            .expect_err("missing signature must fail");
        assert!(matches!(err, ParseError::MissingSignature));

        let err = parse_webhook("pull_request", Some("nosha"), body, Some(secret))
            .expect_err("malformed signature must fail");
        assert!(matches!(err, ParseError::MalformedSignature));
    }

    #[test]
    fn test_parse_push_branch() {
        let body = r#"{
            "ref": "refs/heads/master",
            "before": "000",
            "after": "abc",
            "repository": {"name": "repo", "owner": {"login": "org"}},
            "sender": {"login": "dev"}
        }"#;
        let hook = parse_webhook("push", None, body.as_bytes(), None).unwrap().unwrap();
        let Webhook::Push(push) = hook else {
            panic!("expected push hook");
        };
        assert_eq!(push.branch(), "master");
        assert_eq!(push.after, "abc");
    }

    #[test]
    fn test_parse_ping() {
        let hook = parse_webhook("ping", None, b"{\"zen\": \"ok\"}", None).unwrap().unwrap();
        assert_eq!(hook.kind(), WebhookKind::Ping);
    }
}
