//! Policy gate: which pull requests may run commands, and when `apply`
//! is permitted.
//!
//! Checks short-circuit in a fixed order: allow-list, fork, then the apply
//! requirements (approval before mergeability).

pub mod allowlist;
pub mod signature;

pub use allowlist::RepoAllowlist;
pub use signature::verify_signature;

use crate::errors::PolicyError;
use crate::models::{PullRequestContext, Repo};
use crate::project::ApplyRequirement;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicyConfig {
    pub allow_fork_prs: bool,
    pub require_approval: bool,
    pub require_mergeable: bool,
}

/// Facts about a pull request gathered from the VCS host before `apply`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyFacts {
    pub approved: bool,
    pub mergeable: bool,
}

#[derive(Debug, Clone)]
pub struct PolicyGate {
    allowlist: RepoAllowlist,
    config: PolicyConfig,
}

impl PolicyGate {
    pub fn new(allowlist: RepoAllowlist, config: PolicyConfig) -> Self {
        Self { allowlist, config }
    }

    pub fn check_repo(&self, repo: &Repo) -> Result<(), PolicyError> {
        if self.allowlist.is_allowed(repo) {
            Ok(())
        } else {
            Err(PolicyError::RepoNotAllowed(repo.allowlist_id()))
        }
    }

    pub fn check_fork(&self, pull: &PullRequestContext) -> Result<(), PolicyError> {
        if pull.is_fork && !self.config.allow_fork_prs {
            return Err(PolicyError::ForkNotAllowed);
        }
        Ok(())
    }

    /// Allow-list then fork.
    pub fn check_pull(&self, pull: &PullRequestContext) -> Result<(), PolicyError> {
        self.check_repo(&pull.repo)?;
        self.check_fork(pull)
    }

    /// Requirements every apply must meet, from server configuration.
    pub fn global_requirements(&self) -> Vec<ApplyRequirement> {
        let mut reqs = Vec::new();
        if self.config.require_approval {
            reqs.push(ApplyRequirement::Approved);
        }
        if self.config.require_mergeable {
            reqs.push(ApplyRequirement::Mergeable);
        }
        reqs
    }

    /// Check `requirements` against `facts`, approval first.
    pub fn check_apply(
        &self,
        requirements: &[ApplyRequirement],
        facts: &ApplyFacts,
    ) -> Result<(), PolicyError> {
        if requirements.contains(&ApplyRequirement::Approved) && !facts.approved {
            return Err(PolicyError::ApprovalRequired);
        }
        if requirements.contains(&ApplyRequirement::Mergeable) && !facts.mergeable {
            return Err(PolicyError::NotMergeable);
        }
        Ok(())
    }
}
