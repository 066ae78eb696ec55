//! Shared identity types: repositories, pull requests and project keys.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Workspace used when a command or project does not name one.
pub const DEFAULT_WORKSPACE: &str = "default";

/// A repository on the VCS host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Repo {
    /// Host name, e.g. `github.com`.
    pub hostname: String,
    /// `owner/name`.
    pub full_name: String,
    /// URL the working-directory provider clones from.
    pub clone_url: String,
}

impl Repo {
    pub fn new(hostname: &str, full_name: &str) -> Self {
        Self {
            hostname: hostname.to_string(),
            full_name: full_name.to_string(),
            clone_url: format!("https://{}/{}.git", hostname, full_name),
        }
    }

    pub fn owner(&self) -> &str {
        self.full_name.split('/').next().unwrap_or("")
    }

    pub fn name(&self) -> &str {
        self.full_name.split('/').nth(1).unwrap_or("")
    }

    /// `hostname/owner/name`, the form matched by the repository allow-list.
    pub fn allowlist_id(&self) -> String {
        format!("{}/{}", self.hostname, self.full_name)
    }
}

/// Stable reference to one pull request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PrRef {
    pub repo: String,
    pub number: u64,
}

impl PrRef {
    pub fn new(repo: &str, number: u64) -> Self {
        Self {
            repo: repo.to_string(),
            number,
        }
    }
}

impl fmt::Display for PrRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.repo, self.number)
    }
}

/// Everything the engine knows about a pull request for one event.
///
/// `head_sha` moves forward as the author pushes; a newer head supersedes
/// any in-flight work for the same pull request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestContext {
    pub repo: Repo,
    pub number: u64,
    pub head_sha: String,
    pub base_sha: String,
    pub head_ref: String,
    pub is_fork: bool,
    pub author: String,
}

impl PullRequestContext {
    pub fn pr_ref(&self) -> PrRef {
        PrRef::new(&self.repo.full_name, self.number)
    }
}

/// Identity of one deployable configuration: repository, directory, workspace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProjectKey {
    pub repo: String,
    pub dir: String,
    pub workspace: String,
}

impl ProjectKey {
    pub fn new(repo: &str, dir: &str, workspace: &str) -> Self {
        Self {
            repo: repo.to_string(),
            dir: clean_relative_path(dir).unwrap_or_else(|| dir.to_string()),
            workspace: workspace.to_string(),
        }
    }
}

impl fmt::Display for ProjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.repo, self.dir, self.workspace)
    }
}

/// Lexically normalize a repository-relative path.
///
/// Returns `None` for absolute paths and paths that climb above the
/// repository root. The repository root itself is `"."`.
pub fn clean_relative_path(path: &str) -> Option<String> {
    if path.starts_with('/') || path.starts_with('\\') {
        return None;
    }
    let mut parts: Vec<&str> = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                parts.pop()?;
            }
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        Some(".".to_string())
    } else {
        Some(parts.join("/"))
    }
}
