//! Bounded exponential backoff for transient VCS failures.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::{Approval, CommitState, PullDetails, VcsClient};
use crate::errors::VcsError;
use crate::models::PrRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(5),
        }
    }
}

/// Run `op` until it succeeds, fails permanently, or attempts run out.
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, operation: &str, mut op: F) -> Result<T, VcsError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, VcsError>>,
{
    let mut backoff = policy.initial_backoff;
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_transient() => return Err(e),
            Err(e) if attempt >= policy.max_attempts => {
                return Err(VcsError::RetriesExhausted {
                    operation: operation.to_string(),
                    attempts: attempt,
                    last: e.to_string(),
                });
            }
            Err(e) => {
                tracing::warn!(operation, attempt, error = %e, "transient VCS failure, retrying");
                tokio::time::sleep(backoff).await;
                backoff = backoff.saturating_mul(2).min(policy.max_backoff);
                attempt += 1;
            }
        }
    }
}

/// Wraps a client so every call is retried under one policy.
#[derive(Clone)]
pub struct RetryingVcs {
    inner: Arc<dyn VcsClient>,
    policy: RetryPolicy,
}

impl RetryingVcs {
    pub fn new(inner: Arc<dyn VcsClient>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl VcsClient for RetryingVcs {
    async fn post_comment(&self, pr: &PrRef, body: &str) -> Result<(), VcsError> {
        retry(&self.policy, "post_comment", || self.inner.post_comment(pr, body)).await
    }

    async fn set_commit_status(
        &self,
        pr: &PrRef,
        sha: &str,
        state: CommitState,
        description: &str,
    ) -> Result<(), VcsError> {
        retry(&self.policy, "set_commit_status", || {
            self.inner.set_commit_status(pr, sha, state, description)
        })
        .await
    }

    async fn list_approvals(&self, pr: &PrRef) -> Result<Vec<Approval>, VcsError> {
        retry(&self.policy, "list_approvals", || self.inner.list_approvals(pr)).await
    }

    async fn get_mergeability(&self, pr: &PrRef) -> Result<bool, VcsError> {
        retry(&self.policy, "get_mergeability", || self.inner.get_mergeability(pr)).await
    }

    async fn get_changed_files(&self, pr: &PrRef) -> Result<Vec<String>, VcsError> {
        retry(&self.policy, "get_changed_files", || self.inner.get_changed_files(pr)).await
    }

    async fn get_pull_request(&self, pr: &PrRef) -> Result<PullDetails, VcsError> {
        retry(&self.policy, "get_pull_request", || self.inner.get_pull_request(pr)).await
    }
}
