//! VCS host collaborator: comments, commit statuses and pull request facts.

pub mod github;
pub mod retry;

pub use github::GitHubClient;
pub use retry::{RetryPolicy, RetryingVcs};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::VcsError;
use crate::models::PrRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitState {
    Pending,
    Success,
    Failure,
}

impl CommitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommitState::Pending => "pending",
            CommitState::Success => "success",
            CommitState::Failure => "failure",
        }
    }
}

/// One approving review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Approval {
    pub user: String,
    pub submitted_at: Option<DateTime<Utc>>,
}

/// Current state of a pull request as the host reports it.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PullDetails {
    pub head_sha: String,
    pub base_sha: String,
    pub head_ref: String,
    pub author: String,
    /// Head branch lives in a different repository.
    pub is_fork: bool,
}

#[async_trait]
pub trait VcsClient: Send + Sync {
    async fn post_comment(&self, pr: &PrRef, body: &str) -> Result<(), VcsError>;

    async fn set_commit_status(
        &self,
        pr: &PrRef,
        sha: &str,
        state: CommitState,
        description: &str,
    ) -> Result<(), VcsError>;

    async fn list_approvals(&self, pr: &PrRef) -> Result<Vec<Approval>, VcsError>;

    async fn get_mergeability(&self, pr: &PrRef) -> Result<bool, VcsError>;

    /// Repository-relative paths touched by the pull request, including the
    /// old path of renamed files.
    async fn get_changed_files(&self, pr: &PrRef) -> Result<Vec<String>, VcsError>;

    async fn get_pull_request(&self, pr: &PrRef) -> Result<PullDetails, VcsError>;

    async fn get_head_sha(&self, pr: &PrRef) -> Result<String, VcsError> {
        Ok(self.get_pull_request(pr).await?.head_sha)
    }
}
