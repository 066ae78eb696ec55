//! GitHub REST client.

use async_trait::async_trait;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;

use super::{Approval, CommitState, PullDetails, VcsClient};
use crate::errors::VcsError;
use crate::models::PrRef;

const PER_PAGE: usize = 100;
const USER_AGENT: &str = "planlock";
const STATUS_CONTEXT: &str = "planlock";
/// GitHub rejects longer status descriptions.
const MAX_STATUS_DESCRIPTION: usize = 140;

#[derive(Debug, Deserialize)]
struct PullResponse {
    head: PullBranch,
    base: Option<PullBranch>,
    user: Option<ReviewUser>,
    mergeable: Option<bool>,
    mergeable_state: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PullBranch {
    sha: String,
    #[serde(rename = "ref", default)]
    branch: String,
    repo: Option<PullRepo>,
}

#[derive(Debug, Deserialize)]
struct PullRepo {
    full_name: String,
}

#[derive(Debug, Deserialize)]
struct ReviewResponse {
    state: String,
    user: Option<ReviewUser>,
    submitted_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Deserialize)]
struct ReviewUser {
    login: String,
}

#[derive(Debug, Deserialize)]
struct FileResponse {
    filename: String,
    previous_filename: Option<String>,
}

#[derive(Debug, Clone)]
pub struct GitHubClient {
    http: reqwest::Client,
    api_base: String,
    token: String,
    target_url: Option<String>,
}

/// API root for a GitHub host; Enterprise hosts serve it under `/api/v3`.
pub fn api_base_for(hostname: &str) -> String {
    if hostname == "github.com" {
        "https://api.github.com".to_string()
    } else {
        format!("https://{}/api/v3", hostname)
    }
}

impl GitHubClient {
    pub fn new(hostname: &str, token: &str) -> Self {
        Self::with_api_base(&api_base_for(hostname), token)
    }

    pub fn with_api_base(api_base: &str, token: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base: api_base.trim_end_matches('/').to_string(),
            token: token.to_string(),
            target_url: None,
        }
    }

    /// Link commit statuses to this URL.
    pub fn with_target_url(mut self, url: &str) -> Self {
        self.target_url = Some(url.to_string());
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_base, path)
    }

    fn authed(&self, req: RequestBuilder) -> RequestBuilder {
        req.header("Authorization", format!("Bearer {}", self.token))
            .header("User-Agent", USER_AGENT)
            .header("Accept", "application/vnd.github+json")
    }

    async fn send(&self, req: RequestBuilder, operation: &str) -> Result<Response, VcsError> {
        let resp = self
            .authed(req)
            .send()
            .await
            .map_err(|e| VcsError::Transient(format!("{}: {}", operation, e)))?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let rate_limited = status == StatusCode::FORBIDDEN
            && resp
                .headers()
                .get("x-ratelimit-remaining")
                .is_some_and(|v| v.as_bytes() == b"0");
        let body = resp.text().await.unwrap_or_default();
        let message = format!("{}: GitHub returned {}: {}", operation, status, body.trim());
        if is_transient_status(status) || rate_limited {
            Err(VcsError::Transient(message))
        } else {
            Err(VcsError::Permanent(message))
        }
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
        operation: &str,
    ) -> Result<T, VcsError> {
        let req = self.http.get(self.url(path)).query(query);
        self.send(req, operation)
            .await?
            .json::<T>()
            .await
            .map_err(|e| VcsError::Permanent(format!("{}: invalid response: {}", operation, e)))
    }

    /// Fetch every page of a list endpoint.
    async fn get_all_pages<T: DeserializeOwned>(
        &self,
        path: &str,
        operation: &str,
    ) -> Result<Vec<T>, VcsError> {
        let mut all = Vec::new();
        let mut page = 1u32;
        loop {
            let items: Vec<T> = self
                .get_json(
                    path,
                    &[("per_page", PER_PAGE.to_string()), ("page", page.to_string())],
                    operation,
                )
                .await?;
            let count = items.len();
            all.extend(items);
            if count < PER_PAGE {
                break;
            }
            page += 1;
        }
        Ok(all)
    }

    async fn get_pull(&self, pr: &PrRef) -> Result<PullResponse, VcsError> {
        self.get_json(
            &format!("/repos/{}/pulls/{}", pr.repo, pr.number),
            &[],
            "get_pull",
        )
        .await
    }
}

fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn truncate_description(description: &str) -> String {
    if description.chars().count() <= MAX_STATUS_DESCRIPTION {
        return description.to_string();
    }
    let mut cut: String = description.chars().take(MAX_STATUS_DESCRIPTION - 3).collect();
    cut.push_str("...");
    cut
}

#[async_trait]
impl VcsClient for GitHubClient {
    async fn post_comment(&self, pr: &PrRef, body: &str) -> Result<(), VcsError> {
        let req = self
            .http
            .post(self.url(&format!("/repos/{}/issues/{}/comments", pr.repo, pr.number)))
            .json(&serde_json::json!({ "body": body }));
        self.send(req, "post_comment").await.map(|_| ())
    }

    async fn set_commit_status(
        &self,
        pr: &PrRef,
        sha: &str,
        state: CommitState,
        description: &str,
    ) -> Result<(), VcsError> {
        let mut payload = serde_json::json!({
            "state": state.as_str(),
            "description": truncate_description(description),
            "context": STATUS_CONTEXT,
        });
        if let Some(url) = &self.target_url {
            payload["target_url"] = serde_json::Value::String(url.clone());
        }
        let req = self
            .http
            .post(self.url(&format!("/repos/{}/statuses/{}", pr.repo, sha)))
            .json(&payload);
        self.send(req, "set_commit_status").await.map(|_| ())
    }

    async fn list_approvals(&self, pr: &PrRef) -> Result<Vec<Approval>, VcsError> {
        let reviews: Vec<ReviewResponse> = self
            .get_all_pages(
                &format!("/repos/{}/pulls/{}/reviews", pr.repo, pr.number),
                "list_approvals",
            )
            .await?;
        Ok(reviews
            .into_iter()
            .filter(|r| r.state == "APPROVED")
            .map(|r| Approval {
                user: r.user.map(|u| u.login).unwrap_or_default(),
                submitted_at: r.submitted_at,
            })
            .collect())
    }

    async fn get_mergeability(&self, pr: &PrRef) -> Result<bool, VcsError> {
        let pull = self.get_pull(pr).await?;
        let state_ok = matches!(
            pull.mergeable_state.as_deref(),
            Some("clean") | Some("unstable") | Some("has_hooks")
        );
        Ok(pull.mergeable == Some(true) && state_ok)
    }

    async fn get_changed_files(&self, pr: &PrRef) -> Result<Vec<String>, VcsError> {
        let files: Vec<FileResponse> = self
            .get_all_pages(
                &format!("/repos/{}/pulls/{}/files", pr.repo, pr.number),
                "get_changed_files",
            )
            .await?;
        let mut paths = Vec::with_capacity(files.len());
        for file in files {
            paths.push(file.filename);
            if let Some(previous) = file.previous_filename {
                paths.push(previous);
            }
        }
        Ok(paths)
    }

    async fn get_pull_request(&self, pr: &PrRef) -> Result<PullDetails, VcsError> {
        let pull = self.get_pull(pr).await?;
        let head_repo = pull.head.repo.as_ref().map(|r| r.full_name.as_str());
        // A deleted head repository can only have been a fork.
        let is_fork = head_repo.is_none_or(|name| !name.eq_ignore_ascii_case(&pr.repo));
        Ok(PullDetails {
            head_sha: pull.head.sha,
            base_sha: pull.base.map(|b| b.sha).unwrap_or_default(),
            head_ref: pull.head.branch,
            author: pull.user.map(|u| u.login).unwrap_or_default(),
            is_fork,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Path, Query};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use std::collections::HashMap;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn pr() -> PrRef {
        PrRef::new("acme/infra", 5)
    }

    #[test]
    fn test_api_base_for_enterprise() {
        assert_eq!(api_base_for("github.com"), "https://api.github.com");
        assert_eq!(api_base_for("ghe.acme.io"), "https://ghe.acme.io/api/v3");
    }

    #[test]
    fn test_truncate_description() {
        assert_eq!(truncate_description("short"), "short");
        let long = "x".repeat(300);
        let cut = truncate_description(&long);
        assert_eq!(cut.chars().count(), MAX_STATUS_DESCRIPTION);
        assert!(cut.ends_with("..."));
    }

    #[tokio::test]
    async fn test_changed_files_paginates_and_includes_renames() {
        let router = Router::new().route(
            "/repos/acme/infra/pulls/5/files",
            get(|Query(q): Query<HashMap<String, String>>| async move {
                let page: usize = q.get("page").and_then(|p| p.parse().ok()).unwrap_or(1);
                let files: Vec<serde_json::Value> = if page == 1 {
                    (0..PER_PAGE)
                        .map(|i| serde_json::json!({ "filename": format!("f{i}.tf") }))
                        .collect()
                } else {
                    vec![serde_json::json!({ "filename": "new/main.tf", "previous_filename": "old/main.tf" })]
                };
                Json(files)
            }),
        );
        let client = GitHubClient::with_api_base(&serve(router).await, "t");
        let files = client.get_changed_files(&pr()).await.unwrap();
        assert_eq!(files.len(), PER_PAGE + 2);
        assert!(files.contains(&"old/main.tf".to_string()));
    }

    #[tokio::test]
    async fn test_head_sha_and_mergeability() {
        let router = Router::new().route(
            "/repos/acme/infra/pulls/5",
            get(|| async {
                Json(serde_json::json!({
                    "head": { "sha": "abc123", "ref": "feature", "repo": { "full_name": "acme/infra" } },
                    "base": { "sha": "def456", "ref": "main", "repo": { "full_name": "acme/infra" } },
                    "user": { "login": "dev" },
                    "mergeable": true,
                    "mergeable_state": "clean"
                }))
            }),
        );
        let client = GitHubClient::with_api_base(&serve(router).await, "t");
        assert_eq!(client.get_head_sha(&pr()).await.unwrap(), "abc123");
        let details = client.get_pull_request(&pr()).await.unwrap();
        assert_eq!(details.base_sha, "def456");
        assert_eq!(details.head_ref, "feature");
        assert_eq!(details.author, "dev");
        assert!(!details.is_fork);
        assert!(client.get_mergeability(&pr()).await.unwrap());
    }

    #[tokio::test]
    async fn test_pull_from_fork() {
        let router = Router::new().route(
            "/repos/acme/infra/pulls/5",
            get(|| async {
                Json(serde_json::json!({
                    "head": { "sha": "abc123", "ref": "patch-1", "repo": { "full_name": "mallory/infra" } },
                    "base": { "sha": "def456", "ref": "main", "repo": { "full_name": "acme/infra" } },
                    "mergeable": null
                }))
            }),
        );
        let client = GitHubClient::with_api_base(&serve(router).await, "t");
        assert!(client.get_pull_request(&pr()).await.unwrap().is_fork);
        assert!(!client.get_mergeability(&pr()).await.unwrap());
    }

    #[tokio::test]
    async fn test_approvals_filter_state() {
        let router = Router::new().route(
            "/repos/acme/infra/pulls/5/reviews",
            get(|| async {
                Json(serde_json::json!([
                    { "state": "COMMENTED", "user": { "login": "a" } },
                    { "state": "APPROVED", "user": { "login": "b" } }
                ]))
            }),
        );
        let client = GitHubClient::with_api_base(&serve(router).await, "t");
        let approvals = client.list_approvals(&pr()).await.unwrap();
        assert_eq!(approvals.len(), 1);
        assert_eq!(approvals[0].user, "b");
    }

    #[tokio::test]
    async fn test_error_classification() {
        let router = Router::new()
            .route(
                "/repos/acme/infra/issues/5/comments",
                post(|| async { (axum::http::StatusCode::BAD_GATEWAY, "upstream") }),
            )
            .route(
                "/repos/acme/infra/statuses/{sha}",
                post(|Path(_sha): Path<String>| async { axum::http::StatusCode::NOT_FOUND }),
            );
        let client = GitHubClient::with_api_base(&serve(router).await, "t");
        let err = client.post_comment(&pr(), "hi").await.unwrap_err();
        assert!(err.is_transient(), "{err}");
        let err = client
            .set_commit_status(&pr(), "abc", CommitState::Pending, "running")
            .await
            .unwrap_err();
        assert!(matches!(err, VcsError::Permanent(_)));
    }
}
