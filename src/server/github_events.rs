//! GitHub webhook payloads mapped onto engine events.

use serde::Deserialize;

use crate::engine::EventKind;
use crate::models::{PullRequestContext, Repo};

#[derive(Debug, Deserialize)]
struct PullRequestPayload {
    action: String,
    number: u64,
    pull_request: PullRequestBody,
    repository: RepositoryBody,
}

#[derive(Debug, Deserialize)]
struct PullRequestBody {
    head: BranchBody,
    base: BranchBody,
    user: UserBody,
    #[serde(default)]
    merged: bool,
}

#[derive(Debug, Deserialize)]
struct BranchBody {
    sha: String,
    #[serde(rename = "ref")]
    branch: String,
    repo: Option<RepositoryBody>,
}

#[derive(Debug, Deserialize)]
struct RepositoryBody {
    full_name: String,
    clone_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UserBody {
    login: String,
}

#[derive(Debug, Deserialize)]
struct IssueCommentPayload {
    action: String,
    issue: IssueBody,
    comment: CommentBody,
    repository: RepositoryBody,
}

#[derive(Debug, Deserialize)]
struct IssueBody {
    number: u64,
    /// Present only when the issue is a pull request.
    #[serde(default)]
    pull_request: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct CommentBody {
    body: String,
    user: UserBody,
}

/// A webhook the engine should handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookEvent {
    pub pull: PullRequestContext,
    pub kind: EventKind,
}

/// Map an `X-GitHub-Event` type and body to an engine event.
///
/// `Ok(None)` for event types and actions that need no handling.
pub fn parse_webhook(
    event_type: &str,
    body: &[u8],
    hostname: &str,
) -> Result<Option<WebhookEvent>, serde_json::Error> {
    match event_type {
        "pull_request" => parse_pull_request(serde_json::from_slice(body)?, hostname),
        "issue_comment" => parse_issue_comment(serde_json::from_slice(body)?, hostname),
        _ => Ok(None),
    }
}

fn repo(body: &RepositoryBody, hostname: &str) -> Repo {
    let mut repo = Repo::new(hostname, &body.full_name);
    if let Some(url) = &body.clone_url {
        repo.clone_url = url.clone();
    }
    repo
}

fn parse_pull_request(
    payload: PullRequestPayload,
    hostname: &str,
) -> Result<Option<WebhookEvent>, serde_json::Error> {
    let kind = match payload.action.as_str() {
        "opened" | "reopened" | "ready_for_review" => EventKind::PullRequestOpened,
        "synchronize" => EventKind::PullRequestUpdated,
        "closed" => EventKind::PullRequestClosed {
            merged: payload.pull_request.merged,
        },
        _ => return Ok(None),
    };
    let base_repo = &payload.repository.full_name;
    // A deleted head repository can only have been a fork.
    let is_fork = payload
        .pull_request
        .head
        .repo
        .as_ref()
        .is_none_or(|head| !head.full_name.eq_ignore_ascii_case(base_repo));

    Ok(Some(WebhookEvent {
        pull: PullRequestContext {
            repo: repo(&payload.repository, hostname),
            number: payload.number,
            head_sha: payload.pull_request.head.sha,
            base_sha: payload.pull_request.base.sha,
            head_ref: payload.pull_request.head.branch,
            is_fork,
            author: payload.pull_request.user.login,
        },
        kind,
    }))
}

fn parse_issue_comment(
    payload: IssueCommentPayload,
    hostname: &str,
) -> Result<Option<WebhookEvent>, serde_json::Error> {
    if payload.action != "created" || payload.issue.pull_request.is_none() {
        return Ok(None);
    }
    // Head, base and fork status are filled in by the engine.
    Ok(Some(WebhookEvent {
        pull: PullRequestContext {
            repo: repo(&payload.repository, hostname),
            number: payload.issue.number,
            head_sha: String::new(),
            base_sha: String::new(),
            head_ref: String::new(),
            is_fork: false,
            author: String::new(),
        },
        kind: EventKind::CommentCreated {
            comment: payload.comment.body,
            author: payload.comment.user.login,
        },
    }))
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opened_pull_request() {
        let body = fixtures::pull_request("opened", "acme/infra", false);
        let event = parse_webhook("pull_request", body.as_bytes(), "github.com")
            .unwrap()
            .unwrap();
        assert_eq!(event.kind, EventKind::PullRequestOpened);
        assert_eq!(event.pull.number, 7);
        assert_eq!(event.pull.head_sha, "abc123");
        assert_eq!(event.pull.base_sha, "def456");
        assert_eq!(event.pull.head_ref, "feature");
        assert_eq!(event.pull.author, "dev");
        assert!(!event.pull.is_fork);
        assert_eq!(event.pull.repo.allowlist_id(), "github.com/acme/infra");
    }

    #[test]
    fn test_synchronize_and_closed() {
        let body = fixtures::pull_request("synchronize", "acme/infra", false);
        let event = parse_webhook("pull_request", body.as_bytes(), "github.com")
            .unwrap()
            .unwrap();
        assert_eq!(event.kind, EventKind::PullRequestUpdated);

        let body = fixtures::pull_request("closed", "acme/infra", true);
        let event = parse_webhook("pull_request", body.as_bytes(), "github.com")
            .unwrap()
            .unwrap();
        assert_eq!(event.kind, EventKind::PullRequestClosed { merged: true });
    }

    #[test]
    fn test_fork_detected() {
        let body = fixtures::pull_request("opened", "mallory/infra", false);
        let event = parse_webhook("pull_request", body.as_bytes(), "github.com")
            .unwrap()
            .unwrap();
        assert!(event.pull.is_fork);
    }

    #[test]
    fn test_ignored_actions_and_types() {
        let body = fixtures::pull_request("labeled", "acme/infra", false);
        assert!(
            parse_webhook("pull_request", body.as_bytes(), "github.com")
                .unwrap()
                .is_none()
        );
        assert!(parse_webhook("push", b"{}", "github.com").unwrap().is_none());
    }

    #[test]
    fn test_comment_on_pull_request() {
        let body = fixtures::issue_comment("planlock plan", true);
        let event = parse_webhook("issue_comment", body.as_bytes(), "github.com")
            .unwrap()
            .unwrap();
        assert_eq!(
            event.kind,
            EventKind::CommentCreated {
                comment: "planlock plan".into(),
                author: "reviewer".into()
            }
        );
        assert_eq!(event.pull.number, 7);
    }

    #[test]
    fn test_comment_on_plain_issue_ignored() {
        let body = fixtures::issue_comment("planlock plan", false);
        assert!(
            parse_webhook("issue_comment", body.as_bytes(), "github.com")
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_malformed_body_is_error() {
        assert!(parse_webhook("pull_request", b"not json", "github.com").is_err());
    }
}
