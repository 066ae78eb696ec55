//! Run lifecycle: phases, results and retained plans.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::command::CommandName;
use crate::models::ProjectKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Queued,
    Initializing,
    Planning,
    PlanSucceeded,
    PlanFailed,
    Applying,
    Applied,
    ApplyFailed,
    Superseded,
}

impl RunPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunPhase::PlanSucceeded
                | RunPhase::PlanFailed
                | RunPhase::Applied
                | RunPhase::ApplyFailed
                | RunPhase::Superseded
        )
    }
}

/// Validate a phase transition.
///
/// `PlanSucceeded` is terminal for the plan run; the follow-up apply starts
/// a fresh run from it. Any non-terminal phase may be superseded.
pub fn is_valid_transition(from: RunPhase, to: RunPhase) -> bool {
    use RunPhase::*;
    if to == Superseded {
        return !from.is_terminal();
    }
    matches!(
        (from, to),
        (Queued, Initializing)
            | (Initializing, Planning)
            | (Initializing, Applying)
            | (Initializing, PlanFailed)
            | (Initializing, ApplyFailed)
            | (Planning, PlanSucceeded)
            | (Planning, PlanFailed)
            | (PlanSucceeded, Applying)
            | (Applying, Applied)
            | (Applying, ApplyFailed)
    )
}

/// One (project, command) execution.
#[derive(Debug, Clone, Serialize)]
pub struct Run {
    pub id: Uuid,
    pub project: ProjectKey,
    pub command: CommandName,
    pub owner_pr: u64,
    pub head_sha: String,
    pub phase: RunPhase,
    pub started_at: DateTime<Utc>,
}

impl Run {
    pub fn new(project: ProjectKey, command: CommandName, owner_pr: u64, head_sha: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            project,
            command,
            owner_pr,
            head_sha: head_sha.to_string(),
            phase: RunPhase::Queued,
            started_at: Utc::now(),
        }
    }

    /// Move to `to` if the transition is allowed; returns whether it moved.
    pub fn advance(&mut self, to: RunPhase) -> bool {
        if is_valid_transition(self.phase, to) {
            self.phase = to;
            true
        } else {
            tracing::warn!(run = %self.id, from = ?self.phase, to = ?to, "rejected run phase transition");
            false
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Succeeded,
    Failed,
}

/// Why a project failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// Tool exited non-zero.
    Tool { exit_code: Option<i32> },
    Timeout { secs: u64 },
    /// Another pull request holds the lock.
    LockHeld { by_pr: u64 },
    /// A per-project apply requirement was not met.
    Policy(String),
    /// Apply without a successful plan for the current head.
    MissingPlan,
    /// Cloning or updating the working copy failed.
    Workspace(String),
    /// The lock store failed for this project.
    Lock(String),
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Tool {
                exit_code: Some(code),
            } => write!(f, "tool exited with status {}", code),
            FailureKind::Tool { exit_code: None } => write!(f, "tool was terminated"),
            FailureKind::Timeout { secs } => write!(f, "tool timed out after {}s", secs),
            FailureKind::LockHeld { by_pr } => {
                write!(f, "project is locked by pull request #{}", by_pr)
            }
            FailureKind::Policy(msg) => f.write_str(msg),
            FailureKind::MissingPlan => write!(
                f,
                "no successful plan for the current commit, run plan first"
            ),
            FailureKind::Workspace(msg) => write!(f, "preparing working copy failed: {}", msg),
            FailureKind::Lock(msg) => write!(f, "lock store error: {}", msg),
        }
    }
}

/// Result of one project's run, consumed once by the report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunResult {
    pub project: ProjectKey,
    pub project_name: Option<String>,
    pub command: CommandName,
    pub outcome: Outcome,
    pub output: String,
    pub failure: Option<FailureKind>,
}

impl RunResult {
    pub fn succeeded(
        project: ProjectKey,
        project_name: Option<String>,
        command: CommandName,
        output: String,
    ) -> Self {
        Self {
            project,
            project_name,
            command,
            outcome: Outcome::Succeeded,
            output,
            failure: None,
        }
    }

    pub fn failed(
        project: ProjectKey,
        project_name: Option<String>,
        command: CommandName,
        output: String,
        failure: FailureKind,
    ) -> Self {
        Self {
            project,
            project_name,
            command,
            outcome: Outcome::Failed,
            output,
            failure: Some(failure),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Succeeded
    }
}

/// A successful plan kept for a later apply of the same head commit.
/// Also written next to the plan file so it survives a restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanRecord {
    pub project: ProjectKey,
    pub head_sha: String,
    pub plan_file: String,
    pub planned_at: DateTime<Utc>,
}

/// What a run produced: a result, or nothing because a newer head arrived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed(RunResult),
    Superseded { project: ProjectKey },
}

impl RunOutcome {
    pub fn into_result(self) -> Option<RunResult> {
        match self {
            RunOutcome::Completed(result) => Some(result),
            RunOutcome::Superseded { .. } => None,
        }
    }
}
