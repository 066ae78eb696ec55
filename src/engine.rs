//! Event handling: the single entry point the transport calls.
//!
//! Events for one pull request are processed in the order they were
//! received; events for different pull requests run concurrently. A new
//! head commit is observed at receipt, before waiting for the pull
//! request's turn, so it can cancel runs started by earlier events. A close
//! cancels the pull request's runs at receipt for the same reason.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::command::{Command, CommandName, CommandParser, help_text};
use crate::errors::{EngineError, LockError, VcsError};
use crate::locking::{Lock, LockManager};
use crate::models::{PrRef, PullRequestContext};
use crate::policy::{ApplyFacts, PolicyGate};
use crate::project::{ApplyRequirement, Project, ProjectResolver, RepoConfig, RepoConfigLoader};
use crate::report::{CommandReport, DEFAULT_MAX_COMMENT_CHARS};
use crate::runner::{FailureKind, Outcome, RunOrchestrator, RunOutcome, RunResult};
use crate::vcs::{CommitState, VcsClient};

/// What happened on the VCS host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    PullRequestOpened,
    PullRequestUpdated,
    CommentCreated { comment: String, author: String },
    PullRequestClosed { merged: bool },
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::PullRequestOpened => "pull_request_opened",
            EventKind::PullRequestUpdated => "pull_request_updated",
            EventKind::CommentCreated { .. } => "comment_created",
            EventKind::PullRequestClosed { .. } => "pull_request_closed",
        }
    }

    /// Events whose payload carries an authoritative head commit.
    fn carries_head(&self) -> bool {
        matches!(
            self,
            EventKind::PullRequestOpened | EventKind::PullRequestUpdated
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub comment_prefix: String,
    /// Release a project's lock after a successful apply.
    pub release_lock_on_apply: bool,
    pub max_comment_chars: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            comment_prefix: "planlock".to_string(),
            release_lock_on_apply: false,
            max_comment_chars: DEFAULT_MAX_COMMENT_CHARS,
        }
    }
}

/// Receipt-order gate for one pull request.
#[derive(Debug)]
struct Turnstile {
    next_ticket: AtomicU64,
    now_serving: watch::Sender<u64>,
}

impl Turnstile {
    fn new() -> Self {
        Self {
            next_ticket: AtomicU64::new(0),
            now_serving: watch::Sender::new(0),
        }
    }

    fn ticket(&self) -> u64 {
        self.next_ticket.fetch_add(1, Ordering::SeqCst)
    }

    /// No ticket is waiting or being served.
    fn is_idle(&self) -> bool {
        *self.now_serving.borrow() == self.next_ticket.load(Ordering::SeqCst)
    }

    async fn wait(self: Arc<Self>, ticket: u64) -> Turn {
        let mut rx = self.now_serving.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|serving| *serving == ticket).await;
        Turn { turnstile: self }
    }
}

/// Held while an event is processed; admits the next ticket on drop.
struct Turn {
    turnstile: Arc<Turnstile>,
}

impl Drop for Turn {
    fn drop(&mut self) {
        self.turnstile.now_serving.send_modify(|serving| *serving += 1);
    }
}

/// Where an event stands in line: its pull request's turnstile ticket and
/// its global receipt sequence.
struct Receipt {
    turnstile: Arc<Turnstile>,
    ticket: u64,
    seq: u64,
}

pub struct Engine {
    config: EngineConfig,
    parser: CommandParser,
    policy: PolicyGate,
    locks: Arc<dyn LockManager>,
    vcs: Arc<dyn VcsClient>,
    repo_configs: Arc<dyn RepoConfigLoader>,
    runner: RunOrchestrator,
    turnstiles: Mutex<HashMap<PrRef, Arc<Turnstile>>>,
    /// Receipt sequence across all pull requests.
    receipts: AtomicU64,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        policy: PolicyGate,
        locks: Arc<dyn LockManager>,
        vcs: Arc<dyn VcsClient>,
        repo_configs: Arc<dyn RepoConfigLoader>,
        runner: RunOrchestrator,
    ) -> Self {
        Self {
            parser: CommandParser::new(config.comment_prefix.clone()),
            config,
            policy,
            locks,
            vcs,
            repo_configs,
            runner,
            turnstiles: Mutex::new(HashMap::new()),
            receipts: AtomicU64::new(0),
        }
    }

    pub fn runner(&self) -> &RunOrchestrator {
        &self.runner
    }

    /// Every lock currently held.
    pub async fn status(&self) -> Result<Vec<Lock>, EngineError> {
        Ok(self.locks.list().await?)
    }

    /// Process one event to completion.
    pub async fn handle_event(
        &self,
        pull: PullRequestContext,
        kind: EventKind,
    ) -> Result<(), EngineError> {
        let receipt = self.receive(&pull, &kind);
        self.process(receipt, pull, kind).await
    }

    /// Record receipt now and process on a spawned task.
    pub fn submit(
        self: &Arc<Self>,
        pull: PullRequestContext,
        kind: EventKind,
    ) -> JoinHandle<Result<(), EngineError>> {
        let receipt = self.receive(&pull, &kind);
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let result = engine.process(receipt, pull, kind).await;
            if let Err(e) = &result {
                tracing::error!(error = %e, kind = ?e.kind(), "event dropped");
            }
            result
        })
    }

    fn receive(&self, pull: &PullRequestContext, kind: &EventKind) -> Receipt {
        let pr = pull.pr_ref();
        let receipt = {
            let mut map = self
                .turnstiles
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let turnstile = Arc::clone(
                map.entry(pr.clone())
                    .or_insert_with(|| Arc::new(Turnstile::new())),
            );
            Receipt {
                ticket: turnstile.ticket(),
                seq: self.receipts.fetch_add(1, Ordering::SeqCst),
                turnstile,
            }
        };

        if self.policy.check_repo(&pull.repo).is_ok() {
            if kind.carries_head() {
                self.runner.observe_head(&pr, &pull.head_sha, receipt.seq);
            }
            if matches!(kind, EventKind::PullRequestClosed { .. }) {
                let cancelled = self.runner.cancel_pr(&pr);
                if cancelled > 0 {
                    tracing::info!(pr = %pr, cancelled, "pull request closed, cancelled in-flight runs");
                }
            }
        }
        receipt
    }

    /// Forget the pull request's turnstile if nothing is queued on it.
    fn retire_turnstile(&self, pr: &PrRef, turnstile: &Arc<Turnstile>) {
        let mut map = self
            .turnstiles
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if turnstile.is_idle() && map.get(pr).is_some_and(|t| Arc::ptr_eq(t, turnstile)) {
            map.remove(pr);
        }
    }

    #[tracing::instrument(
        skip_all,
        fields(repo = %pull.repo.full_name, pr = pull.number, event = kind.name())
    )]
    async fn process(
        &self,
        receipt: Receipt,
        pull: PullRequestContext,
        kind: EventKind,
    ) -> Result<(), EngineError> {
        let Receipt {
            turnstile,
            ticket,
            seq,
        } = receipt;
        let turn = Arc::clone(&turnstile).wait(ticket).await;
        let pr = pull.pr_ref();
        let closed = matches!(kind, EventKind::PullRequestClosed { .. });
        let result = match kind {
            EventKind::PullRequestOpened | EventKind::PullRequestUpdated => {
                self.on_pull_updated(&pull).await
            }
            EventKind::CommentCreated { comment, author } => {
                self.on_comment(pull, &comment, &author, seq).await
            }
            EventKind::PullRequestClosed { merged } => self.on_closed(&pull, merged).await,
        };
        drop(turn);
        if closed {
            self.retire_turnstile(&pr, &turnstile);
        }
        result
    }

    async fn on_pull_updated(&self, pull: &PullRequestContext) -> Result<(), EngineError> {
        let pr = pull.pr_ref();
        if let Err(e) = self.policy.check_pull(pull) {
            tracing::info!(reason = %e, "not autoplanning");
            return Ok(());
        }
        if !self.runner.is_current(&pr, &pull.head_sha) {
            tracing::info!(head = %pull.head_sha, "head already superseded, skipping autoplan");
            return Ok(());
        }

        let changed = self.vcs_read(&pr, self.vcs.get_changed_files(&pr)).await?;
        let config = self.load_config(pull).await?;
        let projects = ProjectResolver::new(&config).resolve_autoplan(&changed);
        if projects.is_empty() {
            tracing::info!(changed = changed.len(), "no projects matched changed files");
            return Ok(());
        }
        self.run_plans(pull, &projects, &[]).await
    }

    async fn on_comment(
        &self,
        mut pull: PullRequestContext,
        comment: &str,
        author: &str,
        receipt: u64,
    ) -> Result<(), EngineError> {
        let pr = pull.pr_ref();
        let parsed = self.parser.parse(comment);
        if matches!(parsed, Ok(None)) {
            return Ok(());
        }
        if let Err(e) = self.policy.check_repo(&pull.repo) {
            tracing::info!(reason = %e, "rejected command");
            self.notify(&pr, &error_comment(&e.to_string())).await;
            return Ok(());
        }
        let cmd = match parsed {
            Ok(Some(cmd)) => cmd,
            Ok(None) => return Ok(()),
            Err(e) => {
                self.notify(&pr, &error_comment(&e.to_string())).await;
                return Ok(());
            }
        };
        tracing::info!(author, command = %cmd.name, "received command");

        if cmd.name == CommandName::Help {
            self.notify(&pr, &help_text(self.parser.prefix())).await;
            return Ok(());
        }

        // Comment payloads carry no head or fork information.
        let details = self.vcs_read(&pr, self.vcs.get_pull_request(&pr)).await?;
        pull.head_sha = details.head_sha;
        pull.base_sha = details.base_sha;
        pull.head_ref = details.head_ref;
        pull.author = details.author;
        pull.is_fork = details.is_fork;
        if let Err(e) = self.policy.check_fork(&pull) {
            self.notify(&pr, &error_comment(&e.to_string())).await;
            return Ok(());
        }
        self.runner.observe_head(&pr, &pull.head_sha, receipt);
        if !self.runner.is_current(&pr, &pull.head_sha) {
            tracing::info!(head = %pull.head_sha, "command read a head older than a later event's");
            self.notify(
                &pr,
                &error_comment(
                    "the pull request was updated while this command was queued, comment again to run it on the latest commit",
                ),
            )
            .await;
            return Ok(());
        }

        let config = self.load_config(&pull).await?;
        match cmd.name {
            CommandName::Plan => self.plan_command(&pull, &config, &cmd).await,
            CommandName::Apply => self.apply_command(&pull, &config, &cmd).await,
            CommandName::Unlock => self.unlock_command(&pull, &config, &cmd).await,
            CommandName::Help => Ok(()),
        }
    }

    async fn plan_command(
        &self,
        pull: &PullRequestContext,
        config: &RepoConfig,
        cmd: &Command,
    ) -> Result<(), EngineError> {
        let pr = pull.pr_ref();
        let Some(projects) = self.targets(pull, config, cmd).await? else {
            return Ok(());
        };

        if projects.is_empty() {
            self.notify(
                &pr,
                &format!(
                    "Ran Plan for 0 projects: no modified files matched any project's autoplan patterns.\n\n\
                     * To plan a specific project, comment `{} plan -d <dir>` or `{} plan -p <name>`",
                    self.parser.prefix(),
                    self.parser.prefix()
                ),
            )
            .await;
            let empty = CommandReport::new(CommandName::Plan, Vec::new());
            self.set_status(&pr, &pull.head_sha, CommitState::Success, &empty.status_description())
                .await;
            return Ok(());
        }
        self.run_plans(pull, &projects, &cmd.extra_args).await
    }

    /// Resolve a command's projects, fetching changed files or held locks
    /// only when the command needs them. `None` once a resolution error has
    /// been commented.
    async fn targets(
        &self,
        pull: &PullRequestContext,
        config: &RepoConfig,
        cmd: &Command,
    ) -> Result<Option<Vec<Project>>, EngineError> {
        let pr = pull.pr_ref();
        let untargeted = !cmd.has_explicit_target();
        let changed = if untargeted && cmd.name == CommandName::Plan {
            self.vcs_read(&pr, self.vcs.get_changed_files(&pr)).await?
        } else {
            Vec::new()
        };
        let locked: Vec<_> = if untargeted && cmd.name != CommandName::Plan {
            self.locks
                .locked_by(&pr)
                .await?
                .into_iter()
                .map(|lock| lock.project)
                .collect()
        } else {
            Vec::new()
        };
        match ProjectResolver::new(config).resolve(cmd, &changed, &locked) {
            Ok(projects) => Ok(Some(projects)),
            Err(e) => {
                self.notify(&pr, &error_comment(&e.to_string())).await;
                Ok(None)
            }
        }
    }

    /// Plan `projects`, take locks for the ones that succeed, report.
    async fn run_plans(
        &self,
        pull: &PullRequestContext,
        projects: &[Project],
        extra_args: &[String],
    ) -> Result<(), EngineError> {
        let pr = pull.pr_ref();
        self.set_status(&pr, &pull.head_sha, CommitState::Pending, "Plan in progress")
            .await;

        let mut blocked: HashMap<usize, RunResult> = HashMap::new();
        let mut runnable = Vec::new();
        let mut held_before = HashSet::new();
        for (i, project) in projects.iter().enumerate() {
            let key = project.key(&pull.repo.full_name);
            match self.locks.get(&key).await {
                Ok(Some(lock)) if !lock.is_owned_by(&pr) => {
                    blocked.insert(
                        i,
                        failed(project, pull, CommandName::Plan, FailureKind::LockHeld { by_pr: lock.owner_pr }),
                    );
                }
                Ok(held) => {
                    if held.is_some() {
                        held_before.insert(key);
                    }
                    runnable.push((i, project.clone()));
                }
                Err(e) => {
                    tracing::error!(project = %key, error = %e, "lock lookup failed");
                    blocked.insert(
                        i,
                        failed(project, pull, CommandName::Plan, FailureKind::Lock(e.to_string())),
                    );
                }
            }
        }

        let to_plan: Vec<Project> = runnable.iter().map(|(_, p)| p.clone()).collect();
        let outcomes = self.runner.plan_projects(pull, &to_plan, extra_args).await;

        if !self.runner.is_current(&pr, &pull.head_sha) {
            tracing::info!(head = %pull.head_sha, "plan superseded by a newer commit, discarding results");
            return Ok(());
        }

        let mut planned: HashMap<usize, RunResult> = HashMap::new();
        let mut locked = Vec::new();
        for ((i, project), outcome) in runnable.into_iter().zip(outcomes) {
            let RunOutcome::Completed(result) = outcome else {
                continue;
            };
            let result = if result.is_success() {
                let result = self.lock_after_plan(pull, &project, result).await;
                if result.is_success() {
                    locked.push(result.project.clone());
                }
                result
            } else {
                result
            };
            planned.insert(i, result);
        }

        // Taking locks awaits the store; a newer head may have landed.
        if !self.runner.is_current(&pr, &pull.head_sha) {
            tracing::info!(head = %pull.head_sha, "head moved while taking locks, discarding results");
            self.runner.forget_plans(pull, &locked).await;
            for key in locked.iter().filter(|key| !held_before.contains(*key)) {
                if let Err(e) = self.locks.release(key, &pr).await {
                    tracing::warn!(project = %key, error = %e, "failed to release lock of superseded plan");
                }
            }
            return Ok(());
        }

        let results: Vec<RunResult> = (0..projects.len())
            .filter_map(|i| blocked.remove(&i).or_else(|| planned.remove(&i)))
            .collect();
        if results.is_empty() {
            return Ok(());
        }
        self.publish(pull, CommandReport::new(CommandName::Plan, results))
            .await;
        Ok(())
    }

    /// Take the lock for a successful plan. Losing the race turns the result
    /// into a failure and drops the plan.
    async fn lock_after_plan(
        &self,
        pull: &PullRequestContext,
        project: &Project,
        result: RunResult,
    ) -> RunResult {
        let pr = pull.pr_ref();
        let key = project.key(&pull.repo.full_name);
        match self.locks.try_acquire(&key, &pr).await {
            Ok(_) => result,
            Err(e) => {
                self.runner.forget_plans(pull, std::slice::from_ref(&key)).await;
                let failure = match e {
                    LockError::Held { by_pr, .. } => FailureKind::LockHeld { by_pr },
                    other => {
                        tracing::error!(project = %key, error = %other, "lock acquire failed");
                        FailureKind::Lock(other.to_string())
                    }
                };
                RunResult::failed(key, project.name.clone(), CommandName::Plan, result.output, failure)
            }
        }
    }

    async fn apply_command(
        &self,
        pull: &PullRequestContext,
        config: &RepoConfig,
        cmd: &Command,
    ) -> Result<(), EngineError> {
        let pr = pull.pr_ref();
        let Some(projects) = self.targets(pull, config, cmd).await? else {
            return Ok(());
        };

        if projects.is_empty() {
            self.notify(
                &pr,
                &format!(
                    "Ran Apply for 0 projects: this pull request holds no locks.\n\n\
                     * Run `{} plan` first.",
                    self.parser.prefix()
                ),
            )
            .await;
            return Ok(());
        }

        let global = self.policy.global_requirements();
        let needs_approval = global.contains(&ApplyRequirement::Approved)
            || projects
                .iter()
                .any(|p| p.apply_requirements.contains(&ApplyRequirement::Approved));
        let needs_mergeable = global.contains(&ApplyRequirement::Mergeable)
            || projects
                .iter()
                .any(|p| p.apply_requirements.contains(&ApplyRequirement::Mergeable));
        let facts = ApplyFacts {
            approved: needs_approval
                && !self.vcs_read(&pr, self.vcs.list_approvals(&pr)).await?.is_empty(),
            mergeable: needs_mergeable
                && self.vcs_read(&pr, self.vcs.get_mergeability(&pr)).await?,
        };
        if let Err(e) = self.policy.check_apply(&global, &facts) {
            self.notify(&pr, &error_comment(&e.to_string())).await;
            return Ok(());
        }

        self.set_status(&pr, &pull.head_sha, CommitState::Pending, "Apply in progress")
            .await;

        let mut results = Vec::new();
        for project in &projects {
            if let Some(result) = self.apply_one(pull, project, &facts, &cmd.extra_args).await {
                results.push(result);
            }
        }

        if !self.runner.is_current(&pr, &pull.head_sha) {
            tracing::info!(head = %pull.head_sha, "apply superseded by a newer commit, discarding results");
            return Ok(());
        }
        if results.is_empty() {
            return Ok(());
        }
        self.publish(pull, CommandReport::new(CommandName::Apply, results))
            .await;
        Ok(())
    }

    /// `None` when the run was superseded.
    async fn apply_one(
        &self,
        pull: &PullRequestContext,
        project: &Project,
        facts: &ApplyFacts,
        extra_args: &[String],
    ) -> Option<RunResult> {
        let pr = pull.pr_ref();
        let key = project.key(&pull.repo.full_name);

        if let Err(e) = self.policy.check_apply(&project.apply_requirements, facts) {
            return Some(failed(project, pull, CommandName::Apply, FailureKind::Policy(e.to_string())));
        }

        match self.locks.get(&key).await {
            Ok(Some(lock)) if !lock.is_owned_by(&pr) => {
                return Some(failed(
                    project,
                    pull,
                    CommandName::Apply,
                    FailureKind::LockHeld { by_pr: lock.owner_pr },
                ));
            }
            Ok(Some(_)) => {}
            Ok(None) => return Some(failed(project, pull, CommandName::Apply, FailureKind::MissingPlan)),
            Err(e) => {
                tracing::error!(project = %key, error = %e, "lock lookup failed");
                return Some(failed(project, pull, CommandName::Apply, FailureKind::Lock(e.to_string())));
            }
        }
        // Re-stamp, and confirm ownership under the key's write path.
        if let Err(e) = self.locks.try_acquire(&key, &pr).await {
            let failure = match e {
                LockError::Held { by_pr, .. } => FailureKind::LockHeld { by_pr },
                other => FailureKind::Lock(other.to_string()),
            };
            return Some(failed(project, pull, CommandName::Apply, failure));
        }

        let result = self
            .runner
            .apply_project(pull, project, extra_args)
            .await
            .into_result()?;

        if result.is_success() && self.config.release_lock_on_apply {
            match self.locks.release(&key, &pr).await {
                Ok(_) => tracing::info!(project = %key, "released lock after apply"),
                Err(e) => tracing::warn!(project = %key, error = %e, "failed to release lock after apply"),
            }
        }
        Some(result)
    }

    async fn unlock_command(
        &self,
        pull: &PullRequestContext,
        config: &RepoConfig,
        cmd: &Command,
    ) -> Result<(), EngineError> {
        let pr = pull.pr_ref();

        if cmd.has_explicit_target() {
            let Some(projects) = self.targets(pull, config, cmd).await? else {
                return Ok(());
            };
            let Some(project) = projects.first() else {
                return Ok(());
            };
            let key = project.key(&pull.repo.full_name);
            return match self.locks.release(&key, &pr).await {
                Ok(lock) => {
                    self.runner.forget_plans(pull, std::slice::from_ref(&key)).await;
                    self.notify(&pr, &unlocked_comment(&[lock])).await;
                    Ok(())
                }
                Err(e) if e.kind() == crate::errors::ErrorKind::User => {
                    self.notify(&pr, &error_comment(&e.to_string())).await;
                    Ok(())
                }
                Err(e) => Err(e.into()),
            };
        }

        let released = self.locks.release_all(&pr).await?;
        let keys: Vec<_> = released.iter().map(|l| l.project.clone()).collect();
        self.runner.forget_plans(pull, &keys).await;
        if released.is_empty() {
            self.notify(&pr, "No locks are held by this pull request.").await;
        } else {
            self.notify(&pr, &unlocked_comment(&released)).await;
        }
        Ok(())
    }

    async fn on_closed(&self, pull: &PullRequestContext, merged: bool) -> Result<(), EngineError> {
        let pr = pull.pr_ref();
        if self.policy.check_repo(&pull.repo).is_err() {
            return Ok(());
        }
        let cancelled = self.runner.cancel_pr(&pr);
        let released = self.locks.release_all(&pr).await?;
        if let Err(e) = self.runner.forget_pr(pull).await {
            tracing::warn!(error = %format!("{:#}", e), "failed to delete working copies");
        }
        tracing::info!(merged, cancelled, released = released.len(), "pull request closed");

        if !released.is_empty() {
            let mut body = String::from(
                "Locks and plans deleted for the projects and workspaces modified in this pull request:\n\n",
            );
            for lock in &released {
                body.push_str(&format!(
                    "- dir: `{}` workspace: `{}`\n",
                    lock.project.dir, lock.project.workspace
                ));
            }
            self.notify(&pr, &body).await;
        }
        Ok(())
    }

    async fn load_config(&self, pull: &PullRequestContext) -> Result<RepoConfig, EngineError> {
        self.repo_configs.load(&pull.repo).await.map_err(|e| {
            tracing::error!(error = %e, "invalid repository configuration");
            EngineError::from(e)
        })
    }

    /// Await a VCS read; on failure tell the pull request to try again.
    async fn vcs_read<T>(
        &self,
        pr: &PrRef,
        call: impl std::future::Future<Output = Result<T, VcsError>>,
    ) -> Result<T, EngineError> {
        match call.await {
            Ok(value) => Ok(value),
            Err(e) => {
                tracing::warn!(error = %e, "VCS request failed");
                if e.is_transient() || matches!(e, VcsError::RetriesExhausted { .. }) {
                    self.notify(
                        pr,
                        &error_comment(&format!("{}. Please try again in a few minutes", e)),
                    )
                    .await;
                }
                Err(e.into())
            }
        }
    }

    /// Best-effort comment.
    async fn notify(&self, pr: &PrRef, body: &str) {
        if let Err(e) = self.vcs.post_comment(pr, body).await {
            tracing::warn!(error = %e, "failed to post comment");
        }
    }

    /// Best-effort commit status.
    async fn set_status(&self, pr: &PrRef, sha: &str, state: CommitState, description: &str) {
        if let Err(e) = self.vcs.set_commit_status(pr, sha, state, description).await {
            tracing::warn!(error = %e, "failed to set commit status");
        }
    }

    async fn publish(&self, pull: &PullRequestContext, report: CommandReport) {
        let pr = pull.pr_ref();
        let body = report.render(self.parser.prefix(), self.config.max_comment_chars);
        self.notify(&pr, &body).await;
        let state = match report.overall() {
            Outcome::Succeeded => CommitState::Success,
            Outcome::Failed => CommitState::Failure,
        };
        self.set_status(&pr, &pull.head_sha, state, &report.status_description())
            .await;
    }
}

fn failed(
    project: &Project,
    pull: &PullRequestContext,
    command: CommandName,
    failure: FailureKind,
) -> RunResult {
    RunResult::failed(
        project.key(&pull.repo.full_name),
        project.name.clone(),
        command,
        String::new(),
        failure,
    )
}

fn error_comment(message: &str) -> String {
    format!("**Error:** {}.", message.trim_end_matches('.'))
}

fn unlocked_comment(locks: &[Lock]) -> String {
    let mut body = String::from("Deleted locks and plans for:\n\n");
    for lock in locks {
        body.push_str(&format!(
            "- dir: `{}` workspace: `{}`\n",
            lock.project.dir, lock.project.workspace
        ));
    }
    body
}
