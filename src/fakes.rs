//! In-memory collaborators for tests.
//!
//! Public so integration tests under `tests/` can drive the engine without a
//! VCS host, git remote or infrastructure tool.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::errors::{ConfigError, VcsError};
use crate::models::{PrRef, Repo};
use crate::project::{RepoConfig, RepoConfigLoader};
use crate::runner::{ToolInvoker, ToolOutput, ToolRequest, WorkingDirProvider};
use crate::vcs::{Approval, CommitState, PullDetails, VcsClient};

fn guard<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

/// A posted commit status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedStatus {
    pub pr: PrRef,
    pub sha: String,
    pub state: CommitState,
    pub description: String,
}

/// Scriptable VCS host that records what it is asked to post.
#[derive(Debug, Default)]
pub struct FakeVcs {
    comments: Mutex<Vec<(PrRef, String)>>,
    statuses: Mutex<Vec<RecordedStatus>>,
    approvals: Mutex<HashMap<PrRef, Vec<Approval>>>,
    mergeable: Mutex<HashMap<PrRef, bool>>,
    changed_files: Mutex<HashMap<PrRef, Vec<String>>>,
    heads: Mutex<HashMap<PrRef, String>>,
    forks: Mutex<HashSet<PrRef>>,
    transient_failures: AtomicUsize,
    calls: AtomicUsize,
}

impl FakeVcs {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` calls fail with a transient error.
    pub fn fail_next(&self, n: usize) {
        self.transient_failures.store(n, Ordering::SeqCst);
    }

    pub fn set_head(&self, pr: &PrRef, sha: &str) {
        guard(&self.heads).insert(pr.clone(), sha.to_string());
    }

    pub fn set_fork(&self, pr: &PrRef) {
        guard(&self.forks).insert(pr.clone());
    }

    pub fn set_changed_files(&self, pr: &PrRef, files: &[&str]) {
        guard(&self.changed_files).insert(pr.clone(), files.iter().map(|f| f.to_string()).collect());
    }

    pub fn approve(&self, pr: &PrRef, user: &str) {
        guard(&self.approvals).entry(pr.clone()).or_default().push(Approval {
            user: user.to_string(),
            submitted_at: None,
        });
    }

    pub fn set_mergeable(&self, pr: &PrRef, mergeable: bool) {
        guard(&self.mergeable).insert(pr.clone(), mergeable);
    }

    pub fn comments_for(&self, pr: &PrRef) -> Vec<String> {
        guard(&self.comments)
            .iter()
            .filter(|(p, _)| p == pr)
            .map(|(_, body)| body.clone())
            .collect()
    }

    pub fn all_comments(&self) -> Vec<(PrRef, String)> {
        guard(&self.comments).clone()
    }

    pub fn statuses_for(&self, pr: &PrRef) -> Vec<RecordedStatus> {
        guard(&self.statuses)
            .iter()
            .filter(|s| s.pr == *pr)
            .cloned()
            .collect()
    }

    /// Total calls made, including failed ones.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn enter(&self) -> Result<(), VcsError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.transient_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transient_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(VcsError::Transient("simulated 502".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl VcsClient for FakeVcs {
    async fn post_comment(&self, pr: &PrRef, body: &str) -> Result<(), VcsError> {
        self.enter()?;
        guard(&self.comments).push((pr.clone(), body.to_string()));
        Ok(())
    }

    async fn set_commit_status(
        &self,
        pr: &PrRef,
        sha: &str,
        state: CommitState,
        description: &str,
    ) -> Result<(), VcsError> {
        self.enter()?;
        guard(&self.statuses).push(RecordedStatus {
            pr: pr.clone(),
            sha: sha.to_string(),
            state,
            description: description.to_string(),
        });
        Ok(())
    }

    async fn list_approvals(&self, pr: &PrRef) -> Result<Vec<Approval>, VcsError> {
        self.enter()?;
        Ok(guard(&self.approvals).get(pr).cloned().unwrap_or_default())
    }

    async fn get_mergeability(&self, pr: &PrRef) -> Result<bool, VcsError> {
        self.enter()?;
        Ok(guard(&self.mergeable).get(pr).copied().unwrap_or(false))
    }

    async fn get_changed_files(&self, pr: &PrRef) -> Result<Vec<String>, VcsError> {
        self.enter()?;
        Ok(guard(&self.changed_files).get(pr).cloned().unwrap_or_default())
    }

    async fn get_pull_request(&self, pr: &PrRef) -> Result<PullDetails, VcsError> {
        self.enter()?;
        let head_sha = guard(&self.heads)
            .get(pr)
            .cloned()
            .ok_or_else(|| VcsError::Permanent(format!("no head recorded for {}", pr)))?;
        Ok(PullDetails {
            head_sha,
            base_sha: "base".to_string(),
            head_ref: format!("branch-{}", pr.number),
            author: "dev".to_string(),
            is_fork: guard(&self.forks).contains(pr),
        })
    }
}

/// Tool double keyed on the first argument (`init`, `plan`, `apply`, ...).
///
/// Steps succeed with output `ran <args>` unless scripted otherwise.
#[derive(Debug, Default)]
pub struct ScriptedTool {
    calls: Mutex<Vec<ToolRequest>>,
    failures: Mutex<HashMap<String, (i32, String)>>,
    unstartable: Mutex<HashSet<String>>,
    responses: Mutex<HashMap<String, String>>,
    blocking: Mutex<HashSet<String>>,
    blocked: Notify,
    is_blocked: AtomicBool,
    release: Notify,
}

impl ScriptedTool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_on(&self, step: &str, exit_code: i32, output: &str) {
        guard(&self.failures).insert(step.to_string(), (exit_code, output.to_string()));
    }

    /// Invocations of `step` fail as if the binary could not be spawned.
    pub fn fail_to_start(&self, step: &str) {
        guard(&self.unstartable).insert(step.to_string());
    }

    pub fn respond(&self, step: &str, output: &str) {
        guard(&self.responses).insert(step.to_string(), output.to_string());
    }

    /// Invocations of `step` wait until cancelled or [`ScriptedTool::unblock`].
    pub fn block_on(&self, step: &str) {
        guard(&self.blocking).insert(step.to_string());
    }

    pub fn unblock(&self) {
        guard(&self.blocking).clear();
        self.release.notify_waiters();
    }

    /// Resolve once some invocation is waiting in a blocked step.
    pub async fn wait_until_blocked(&self) {
        if self.is_blocked.load(Ordering::SeqCst) {
            return;
        }
        self.blocked.notified().await;
    }

    pub fn calls(&self) -> Vec<ToolRequest> {
        guard(&self.calls).clone()
    }

    /// Calls whose first argument is `step`.
    pub fn calls_for(&self, step: &str) -> Vec<ToolRequest> {
        guard(&self.calls)
            .iter()
            .filter(|c| c.args.first().map(String::as_str) == Some(step))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ToolInvoker for ScriptedTool {
    async fn run(&self, request: ToolRequest, cancel: CancellationToken) -> Result<ToolOutput> {
        let step = request.args.first().cloned().unwrap_or_default();
        let joined = request.args.join(" ");
        guard(&self.calls).push(request);
        if guard(&self.unstartable).contains(&step) {
            anyhow::bail!("simulated start failure for {}", step);
        }

        if guard(&self.blocking).contains(&step) {
            let released = self.release.notified();
            self.is_blocked.store(true, Ordering::SeqCst);
            self.blocked.notify_one();
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Ok(ToolOutput {
                        output: format!("ran {}\ninterrupted\n", joined),
                        exit_code: None,
                        timed_out: false,
                        cancelled: true,
                    });
                }
                _ = released => {}
            }
        }

        if let Some((code, output)) = guard(&self.failures).get(&step).cloned() {
            return Ok(ToolOutput {
                output,
                exit_code: Some(code),
                ..Default::default()
            });
        }
        let output = guard(&self.responses)
            .get(&step)
            .cloned()
            .unwrap_or_else(|| format!("ran {}\n", joined));
        Ok(ToolOutput {
            output,
            exit_code: Some(0),
            ..Default::default()
        })
    }
}

/// Working copies as plain directories pre-populated with project dirs.
#[derive(Debug)]
pub struct LocalWorkingDir {
    root: PathBuf,
    dirs: Vec<String>,
    clones: AtomicUsize,
    fail: AtomicBool,
}

impl LocalWorkingDir {
    pub fn new(root: impl AsRef<Path>, dirs: &[&str]) -> Self {
        Self {
            root: root.as_ref().join("repos"),
            dirs: dirs.iter().map(|d| d.to_string()).collect(),
            clones: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
        }
    }

    pub fn clone_count(&self) -> usize {
        self.clones.load(Ordering::SeqCst)
    }

    pub fn fail_clones(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    fn populate(&self, dest: &Path, sha: &str) -> Result<()> {
        for dir in &self.dirs {
            let path = dest.join(dir);
            std::fs::create_dir_all(&path)?;
            std::fs::write(path.join("main.tf"), format!("# {}\n", sha))?;
        }
        std::fs::create_dir_all(dest.join(".git"))?;
        std::fs::write(dest.join(".git").join("HEAD"), sha)?;
        Ok(())
    }
}

#[async_trait]
impl WorkingDirProvider for LocalWorkingDir {
    fn path_for(&self, repo: &Repo, pr: u64, workspace: &str) -> PathBuf {
        self.root
            .join(repo.owner())
            .join(repo.name())
            .join(pr.to_string())
            .join(workspace)
    }

    async fn clone_repo(&self, _repo: &Repo, _pr: u64, sha: &str, dest: &Path) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("simulated clone failure");
        }
        self.clones.fetch_add(1, Ordering::SeqCst);
        self.populate(dest, sha)
    }

    async fn update(&self, dest: &Path, _pr: u64, sha: &str) -> Result<()> {
        self.populate(dest, sha)
    }

    async fn delete(&self, dest: &Path) -> Result<()> {
        match std::fs::remove_dir_all(dest) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_pr(&self, repo: &Repo, pr: u64) -> Result<()> {
        let dir = self.root.join(repo.owner()).join(repo.name()).join(pr.to_string());
        self.delete(&dir).await
    }
}

/// Serves one fixed configuration for every repository.
#[derive(Debug)]
pub struct StaticRepoConfig {
    config: Result<RepoConfig, String>,
    loads: AtomicUsize,
}

impl StaticRepoConfig {
    pub fn new(config: RepoConfig) -> Self {
        Self {
            config: Ok(config),
            loads: AtomicUsize::new(0),
        }
    }

    /// Every load fails as an invalid configuration.
    pub fn invalid(message: &str) -> Self {
        Self {
            config: Err(message.to_string()),
            loads: AtomicUsize::new(0),
        }
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RepoConfigLoader for StaticRepoConfig {
    async fn load(&self, _repo: &Repo) -> Result<RepoConfig, ConfigError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        self.config.clone().map_err(ConfigError::Invalid)
    }
}
