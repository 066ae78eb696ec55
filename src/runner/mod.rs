//! Run orchestration: checkout, init, plan and apply per project.
//!
//! The orchestrator owns every [`Run`], [`RunResult`] and [`PlanRecord`].
//! It tracks the newest head commit seen per pull request, ordered by event
//! receipt; a run started on an older head is cancelled and its result
//! discarded. Plan records are also kept as JSON beside the plan file, so an
//! apply after a restart finds the plan it was given.
//!
//! Working copies are keyed by (repo, pr, workspace). Plans of projects that
//! share a working copy check it out once, under that copy's mutex, then run
//! concurrently in their own directories.

pub mod state;
pub mod tool;
pub mod workdir;

pub use state::{
    FailureKind, Outcome, PlanRecord, Run, RunOutcome, RunPhase, RunResult, is_valid_transition,
};
pub use tool::{ProcessToolInvoker, ToolInvoker, ToolOutput, ToolRequest};
pub use workdir::{GitWorkingDir, WorkingDirProvider};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::command::CommandName;
use crate::locking::file::write_json_atomic;
use crate::models::{PrRef, ProjectKey, PullRequestContext};
use crate::project::Project;

struct ActiveRun {
    run: Run,
    pr: PrRef,
    cancel: CancellationToken,
}

/// Checked-out commit of one working copy.
type CheckoutScope = Arc<tokio::sync::Mutex<Option<String>>>;

/// Newest head of a pull request and the receipt of the event that reported it.
#[derive(Debug, Clone)]
struct ObservedHead {
    sha: String,
    receipt: u64,
}

pub struct RunOrchestrator {
    tool: Arc<dyn ToolInvoker>,
    workdirs: Arc<dyn WorkingDirProvider>,
    tool_timeout: Duration,
    heads: Mutex<HashMap<PrRef, ObservedHead>>,
    active: Mutex<HashMap<Uuid, ActiveRun>>,
    plans: Mutex<HashMap<(PrRef, ProjectKey), PlanRecord>>,
    checkouts: Mutex<HashMap<PathBuf, CheckoutScope>>,
}

fn locked<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panic while holding one of these maps leaves it consistent.
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl RunOrchestrator {
    pub fn new(
        tool: Arc<dyn ToolInvoker>,
        workdirs: Arc<dyn WorkingDirProvider>,
        tool_timeout: Duration,
    ) -> Self {
        Self {
            tool,
            workdirs,
            tool_timeout,
            heads: Mutex::new(HashMap::new()),
            active: Mutex::new(HashMap::new()),
            plans: Mutex::new(HashMap::new()),
            checkouts: Mutex::new(HashMap::new()),
        }
    }

    /// Record `sha` as the newest head of `pr`, cancelling runs on any other
    /// head. `receipt` orders events; a head reported by an event received
    /// before the one that set the current head is ignored. Returns how many
    /// runs were cancelled.
    pub fn observe_head(&self, pr: &PrRef, sha: &str, receipt: u64) -> usize {
        {
            let mut heads = locked(&self.heads);
            let known = heads
                .get(pr)
                .map(|head| (head.receipt, head.sha == sha));
            let observed = ObservedHead {
                sha: sha.to_string(),
                receipt,
            };
            match known {
                Some((seen, same)) if receipt < seen => {
                    if !same {
                        tracing::info!(pr = %pr, head = sha, "ignoring head reported by an earlier event");
                    }
                    return 0;
                }
                Some((_, true)) => {
                    heads.insert(pr.clone(), observed);
                    return 0;
                }
                _ => {
                    heads.insert(pr.clone(), observed);
                }
            }
        }

        let active = locked(&self.active);
        let mut cancelled = 0;
        for entry in active.values() {
            if entry.pr == *pr && entry.run.head_sha != sha {
                entry.cancel.cancel();
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            tracing::info!(pr = %pr, head = sha, cancelled, "newer head superseded in-flight runs");
        }
        cancelled
    }

    /// True when `sha` is the newest head seen for `pr`, or none was seen.
    pub fn is_current(&self, pr: &PrRef, sha: &str) -> bool {
        locked(&self.heads)
            .get(pr)
            .is_none_or(|head| head.sha == sha)
    }

    /// Cancel every in-flight run of `pr`.
    pub fn cancel_pr(&self, pr: &PrRef) -> usize {
        let active = locked(&self.active);
        let mut cancelled = 0;
        for entry in active.values().filter(|e| e.pr == *pr) {
            entry.cancel.cancel();
            cancelled += 1;
        }
        cancelled
    }

    /// Snapshot of in-flight runs.
    pub fn active_runs(&self) -> Vec<Run> {
        locked(&self.active)
            .values()
            .map(|entry| entry.run.clone())
            .collect()
    }

    pub fn plan_record(&self, pr: &PrRef, key: &ProjectKey) -> Option<PlanRecord> {
        locked(&self.plans).get(&(pr.clone(), key.clone())).cloned()
    }

    /// Drop the plans of `keys`, in memory and on disk.
    pub async fn forget_plans(&self, pull: &PullRequestContext, keys: &[ProjectKey]) {
        let pr = pull.pr_ref();
        for key in keys {
            self.discard_plan(pull, &pr, key).await;
        }
    }

    /// Drop all state for a closed pull request and delete its working copies.
    pub async fn forget_pr(&self, pull: &PullRequestContext) -> anyhow::Result<()> {
        let pr = pull.pr_ref();
        locked(&self.heads).remove(&pr);
        locked(&self.plans).retain(|(owner, _), _| *owner != pr);
        let pr_root = self.workdirs.path_for(&pull.repo, pull.number, "");
        locked(&self.checkouts).retain(|path, _| !path.starts_with(&pr_root));
        self.workdirs.delete_pr(&pull.repo, pull.number).await
    }

    /// Plan every project concurrently.
    pub async fn plan_projects(
        &self,
        pull: &PullRequestContext,
        projects: &[Project],
        extra_args: &[String],
    ) -> Vec<RunOutcome> {
        futures::future::join_all(
            projects
                .iter()
                .map(|project| self.plan_project(pull, project, extra_args)),
        )
        .await
    }

    #[tracing::instrument(skip_all, fields(pr = pull.number, project = %project.display_name()))]
    pub async fn plan_project(
        &self,
        pull: &PullRequestContext,
        project: &Project,
        extra_args: &[String],
    ) -> RunOutcome {
        let key = project.key(&pull.repo.full_name);
        let (id, cancel) = self.register(pull, &key, CommandName::Plan);
        let outcome = self.execute_plan(id, &cancel, pull, project, &key, extra_args).await;
        self.deregister(id);
        outcome
    }

    #[tracing::instrument(skip_all, fields(pr = pull.number, project = %project.display_name()))]
    pub async fn apply_project(
        &self,
        pull: &PullRequestContext,
        project: &Project,
        extra_args: &[String],
    ) -> RunOutcome {
        let key = project.key(&pull.repo.full_name);
        let (id, cancel) = self.register(pull, &key, CommandName::Apply);
        let outcome = self.execute_apply(id, &cancel, pull, project, &key, extra_args).await;
        self.deregister(id);
        outcome
    }

    async fn execute_plan(
        &self,
        id: Uuid,
        cancel: &CancellationToken,
        pull: &PullRequestContext,
        project: &Project,
        key: &ProjectKey,
        extra_args: &[String],
    ) -> RunOutcome {
        let pr = pull.pr_ref();
        let fail = |output: String, failure: FailureKind| {
            RunOutcome::Completed(RunResult::failed(
                key.clone(),
                project.name.clone(),
                CommandName::Plan,
                output,
                failure,
            ))
        };

        self.advance(id, RunPhase::Initializing);
        let project_dir = match self.prepare(pull, project).await {
            Ok(dir) => dir,
            Err(message) => {
                if self.superseded(cancel, &pr, &pull.head_sha) {
                    return self.supersede(id, key);
                }
                self.advance(id, RunPhase::PlanFailed);
                return fail(String::new(), FailureKind::Workspace(message));
            }
        };

        self.advance(id, RunPhase::Planning);
        let env = tool_env(pull, project);
        let mut steps = vec![tool::init_args()];
        steps.extend(tool::workspace_select_args(&project.workspace));
        steps.push(tool::plan_args(&project.workspace, extra_args));

        let mut last = ToolOutput::default();
        for args in steps {
            let invoked = self.invoke(&project_dir, args, &env, cancel).await;
            if self.superseded(cancel, &pr, &pull.head_sha) {
                return self.supersede(id, key);
            }
            last = match invoked {
                Ok(out) => out,
                Err(e) => {
                    self.advance(id, RunPhase::PlanFailed);
                    self.discard_plan(pull, &pr, key).await;
                    return fail(format!("{:#}", e), FailureKind::Tool { exit_code: None });
                }
            };
            if !last.success() {
                self.advance(id, RunPhase::PlanFailed);
                self.discard_plan(pull, &pr, key).await;
                let failure = self.classify(&last);
                return fail(last.output, failure);
            }
        }

        self.advance(id, RunPhase::PlanSucceeded);
        let record = PlanRecord {
            project: key.clone(),
            head_sha: pull.head_sha.clone(),
            plan_file: tool::plan_file_name(&project.workspace),
            planned_at: Utc::now(),
        };
        self.persist_plan(pull, &record).await;
        locked(&self.plans).insert((pr, key.clone()), record);
        tracing::info!(head = %pull.head_sha, "plan succeeded");
        RunOutcome::Completed(RunResult::succeeded(
            key.clone(),
            project.name.clone(),
            CommandName::Plan,
            last.output,
        ))
    }

    async fn execute_apply(
        &self,
        id: Uuid,
        cancel: &CancellationToken,
        pull: &PullRequestContext,
        project: &Project,
        key: &ProjectKey,
        extra_args: &[String],
    ) -> RunOutcome {
        let pr = pull.pr_ref();
        let fail = |output: String, failure: FailureKind| {
            RunOutcome::Completed(RunResult::failed(
                key.clone(),
                project.name.clone(),
                CommandName::Apply,
                output,
                failure,
            ))
        };

        self.advance(id, RunPhase::Initializing);
        let has_plan = self
            .load_plan(pull, &pr, key)
            .await
            .is_some_and(|record| record.head_sha == pull.head_sha);
        if !has_plan {
            self.advance(id, RunPhase::ApplyFailed);
            return fail(String::new(), FailureKind::MissingPlan);
        }

        let project_dir = match self.prepare(pull, project).await {
            Ok(dir) => dir,
            Err(message) => {
                if self.superseded(cancel, &pr, &pull.head_sha) {
                    return self.supersede(id, key);
                }
                self.advance(id, RunPhase::ApplyFailed);
                return fail(String::new(), FailureKind::Workspace(message));
            }
        };

        self.advance(id, RunPhase::Applying);
        let env = tool_env(pull, project);
        let args = tool::apply_args(&project.workspace, extra_args);
        let invoked = self.invoke(&project_dir, args, &env, cancel).await;
        if self.superseded(cancel, &pr, &pull.head_sha) {
            return self.supersede(id, key);
        }
        let out = match invoked {
            Ok(out) => out,
            Err(e) => {
                self.advance(id, RunPhase::ApplyFailed);
                return fail(format!("{:#}", e), FailureKind::Tool { exit_code: None });
            }
        };

        if out.success() {
            self.advance(id, RunPhase::Applied);
            self.discard_plan(pull, &pr, key).await;
            tracing::info!(head = %pull.head_sha, "apply succeeded");
            RunOutcome::Completed(RunResult::succeeded(
                key.clone(),
                project.name.clone(),
                CommandName::Apply,
                out.output,
            ))
        } else {
            self.advance(id, RunPhase::ApplyFailed);
            let failure = self.classify(&out);
            fail(out.output, failure)
        }
    }

    /// `<working copy>/<dir>/<workspace>.tfplan.json`
    fn plan_record_path(&self, pull: &PullRequestContext, key: &ProjectKey) -> PathBuf {
        self.workdirs
            .path_for(&pull.repo, pull.number, &key.workspace)
            .join(&key.dir)
            .join(format!("{}.json", tool::plan_file_name(&key.workspace)))
    }

    async fn persist_plan(&self, pull: &PullRequestContext, record: &PlanRecord) {
        let path = self.plan_record_path(pull, &record.project);
        let Some(dir) = path.parent().map(Path::to_path_buf) else {
            return;
        };
        let record = record.clone();
        let written = tokio::task::spawn_blocking({
            let path = path.clone();
            move || write_json_atomic(&dir, &path, &record)
        })
        .await;
        match written {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to persist plan record")
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "plan record task failed")
            }
        }
    }

    /// The plan record for `key`, from memory or, after a restart, from disk.
    async fn load_plan(
        &self,
        pull: &PullRequestContext,
        pr: &PrRef,
        key: &ProjectKey,
    ) -> Option<PlanRecord> {
        if let Some(record) = self.plan_record(pr, key) {
            return Some(record);
        }
        let path = self.plan_record_path(pull, key);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to read plan record");
                return None;
            }
        };
        match serde_json::from_slice::<PlanRecord>(&raw) {
            Ok(record) if record.project == *key => {
                tracing::info!(project = %key, head = %record.head_sha, "restored plan record from disk");
                locked(&self.plans).insert((pr.clone(), key.clone()), record.clone());
                Some(record)
            }
            Ok(record) => {
                tracing::warn!(path = %path.display(), found = %record.project, "plan record is for another project");
                None
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "ignoring corrupt plan record");
                None
            }
        }
    }

    async fn discard_plan(&self, pull: &PullRequestContext, pr: &PrRef, key: &ProjectKey) {
        locked(&self.plans).remove(&(pr.clone(), key.clone()));
        let path = self.plan_record_path(pull, key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to delete plan record"),
        }
    }

    fn register(
        &self,
        pull: &PullRequestContext,
        key: &ProjectKey,
        command: CommandName,
    ) -> (Uuid, CancellationToken) {
        let run = Run::new(key.clone(), command, pull.number, &pull.head_sha);
        let id = run.id;
        let cancel = CancellationToken::new();
        locked(&self.active).insert(
            id,
            ActiveRun {
                run,
                pr: pull.pr_ref(),
                cancel: cancel.clone(),
            },
        );
        // A newer head may have landed before registration.
        if !self.is_current(&pull.pr_ref(), &pull.head_sha) {
            cancel.cancel();
        }
        (id, cancel)
    }

    fn deregister(&self, id: Uuid) {
        locked(&self.active).remove(&id);
    }

    fn advance(&self, id: Uuid, to: RunPhase) {
        if let Some(entry) = locked(&self.active).get_mut(&id) {
            entry.run.advance(to);
        }
    }

    fn superseded(&self, cancel: &CancellationToken, pr: &PrRef, sha: &str) -> bool {
        cancel.is_cancelled() || !self.is_current(pr, sha)
    }

    fn supersede(&self, id: Uuid, key: &ProjectKey) -> RunOutcome {
        self.advance(id, RunPhase::Superseded);
        tracing::info!(project = %key, "run superseded, discarding result");
        RunOutcome::Superseded {
            project: key.clone(),
        }
    }

    fn classify(&self, out: &ToolOutput) -> FailureKind {
        if out.timed_out {
            FailureKind::Timeout {
                secs: self.tool_timeout.as_secs(),
            }
        } else {
            FailureKind::Tool {
                exit_code: out.exit_code,
            }
        }
    }

    async fn invoke(
        &self,
        dir: &Path,
        args: Vec<String>,
        env: &[(String, String)],
        cancel: &CancellationToken,
    ) -> anyhow::Result<ToolOutput> {
        let request = ToolRequest {
            working_dir: dir.to_path_buf(),
            args,
            env: env.to_vec(),
            timeout: self.tool_timeout,
        };
        self.tool.run(request, cancel.clone()).await
    }

    fn checkout_scope(&self, dest: &Path) -> CheckoutScope {
        locked(&self.checkouts)
            .entry(dest.to_path_buf())
            .or_default()
            .clone()
    }

    /// Ensure the working copy for the project's workspace is at the PR head;
    /// returns the project directory inside it.
    async fn prepare(&self, pull: &PullRequestContext, project: &Project) -> Result<PathBuf, String> {
        let dest = self
            .workdirs
            .path_for(&pull.repo, pull.number, &project.workspace);
        let scope = self.checkout_scope(&dest);
        let mut checked_out = scope.lock().await;

        if checked_out.as_deref() != Some(pull.head_sha.as_str()) {
            let result = if dest.join(".git").exists() {
                self.workdirs
                    .update(&dest, pull.number, &pull.head_sha)
                    .await
            } else {
                self.workdirs
                    .clone_repo(&pull.repo, pull.number, &pull.head_sha, &dest)
                    .await
            };
            if let Err(e) = result {
                *checked_out = None;
                tracing::warn!(dest = %dest.display(), error = %format!("{:#}", e), "working copy preparation failed");
                return Err(format!("{:#}", e));
            }
            *checked_out = Some(pull.head_sha.clone());
        }
        drop(checked_out);

        let project_dir = dest.join(&project.dir);
        if !project_dir.is_dir() {
            return Err(format!(
                "directory \"{}\" does not exist at commit {}",
                project.dir, pull.head_sha
            ));
        }
        Ok(project_dir)
    }
}

/// Environment passed to every tool invocation.
fn tool_env(pull: &PullRequestContext, project: &Project) -> Vec<(String, String)> {
    vec![
        ("TF_IN_AUTOMATION".into(), "true".into()),
        ("PLANLOCK_REPO".into(), pull.repo.full_name.clone()),
        ("PLANLOCK_PULL_NUM".into(), pull.number.to_string()),
        ("PLANLOCK_PULL_AUTHOR".into(), pull.author.clone()),
        ("PLANLOCK_HEAD_COMMIT".into(), pull.head_sha.clone()),
        ("PLANLOCK_BASE_COMMIT".into(), pull.base_sha.clone()),
        ("PLANLOCK_HEAD_BRANCH".into(), pull.head_ref.clone()),
        ("PLANLOCK_DIR".into(), project.dir.clone()),
        ("PLANLOCK_WORKSPACE".into(), project.workspace.clone()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{LocalWorkingDir, ScriptedTool};
    use crate::models::Repo;

    fn pull(sha: &str) -> PullRequestContext {
        PullRequestContext {
            repo: Repo::new("github.com", "acme/infra"),
            number: 1,
            head_sha: sha.into(),
            base_sha: "base".into(),
            head_ref: "feature".into(),
            is_fork: false,
            author: "dev".into(),
        }
    }

    fn orchestrator(
        tool: Arc<ScriptedTool>,
    ) -> (tempfile::TempDir, Arc<LocalWorkingDir>, RunOrchestrator) {
        let data = tempfile::tempdir().unwrap();
        let workdirs = Arc::new(LocalWorkingDir::new(data.path(), &["staging", "production"]));
        let orch = RunOrchestrator::new(tool, workdirs.clone(), Duration::from_secs(60));
        (data, workdirs, orch)
    }

    #[tokio::test]
    async fn test_plan_success_records_plan() {
        let tool = Arc::new(ScriptedTool::new());
        let (_data, _wd, orch) = orchestrator(tool.clone());
        let project = Project::adhoc("staging", "default");
        orch.observe_head(&pull("a1").pr_ref(), "a1", 0);

        let outcome = orch.plan_project(&pull("a1"), &project, &[]).await;
        let result = outcome.into_result().unwrap();
        assert!(result.is_success());
        assert!(result.output.contains("plan"));

        let record = orch
            .plan_record(&pull("a1").pr_ref(), &project.key("acme/infra"))
            .unwrap();
        assert_eq!(record.head_sha, "a1");
        assert_eq!(record.plan_file, "default.tfplan");

        let calls = tool.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].args[0], "init");
        assert_eq!(calls[1].args[0], "plan");
        assert!(calls[1].working_dir.ends_with("staging"));
    }

    #[tokio::test]
    async fn test_non_default_workspace_selects_it() {
        let tool = Arc::new(ScriptedTool::new());
        let (_data, _wd, orch) = orchestrator(tool.clone());
        let project = Project::adhoc("staging", "blue");
        orch.plan_project(&pull("a1"), &project, &["-var".into(), "x=1".into()])
            .await;
        let calls = tool.calls();
        assert_eq!(calls[1].args, vec!["workspace", "select", "-or-create", "blue"]);
        assert_eq!(calls[2].args.last().unwrap(), "x=1");
        assert!(calls[2].working_dir.to_string_lossy().contains("/1/blue/"));
    }

    #[tokio::test]
    async fn test_plan_failure_keeps_no_record() {
        let tool = Arc::new(ScriptedTool::new());
        tool.fail_on("plan", 1, "Error: bad config");
        let (_data, _wd, orch) = orchestrator(tool);
        let project = Project::adhoc("staging", "default");

        let result = orch
            .plan_project(&pull("a1"), &project, &[])
            .await
            .into_result()
            .unwrap();
        assert_eq!(result.outcome, Outcome::Failed);
        assert_eq!(result.failure, Some(FailureKind::Tool { exit_code: Some(1) }));
        assert!(result.output.contains("Error: bad config"));
        assert!(
            orch.plan_record(&pull("a1").pr_ref(), &project.key("acme/infra"))
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_missing_directory_fails_project() {
        let tool = Arc::new(ScriptedTool::new());
        let (_data, _wd, orch) = orchestrator(tool.clone());
        let result = orch
            .plan_project(&pull("a1"), &Project::adhoc("nowhere", "default"), &[])
            .await
            .into_result()
            .unwrap();
        assert!(matches!(result.failure, Some(FailureKind::Workspace(_))));
        assert!(tool.calls().is_empty());
    }

    #[tokio::test]
    async fn test_apply_requires_plan_for_current_head() {
        let tool = Arc::new(ScriptedTool::new());
        let (_data, _wd, orch) = orchestrator(tool.clone());
        let project = Project::adhoc("staging", "default");

        let result = orch
            .apply_project(&pull("a1"), &project, &[])
            .await
            .into_result()
            .unwrap();
        assert_eq!(result.failure, Some(FailureKind::MissingPlan));

        orch.plan_project(&pull("a1"), &project, &[]).await;
        orch.observe_head(&pull("a2").pr_ref(), "a2", 1);
        let stale = orch
            .apply_project(&pull("a2"), &project, &[])
            .await
            .into_result()
            .unwrap();
        assert_eq!(stale.failure, Some(FailureKind::MissingPlan));
    }

    #[tokio::test]
    async fn test_apply_success_consumes_plan() {
        let tool = Arc::new(ScriptedTool::new());
        let (_data, _wd, orch) = orchestrator(tool.clone());
        let project = Project::adhoc("staging", "default");
        orch.plan_project(&pull("a1"), &project, &[]).await;

        let result = orch
            .apply_project(&pull("a1"), &project, &[])
            .await
            .into_result()
            .unwrap();
        assert!(result.is_success());
        assert_eq!(tool.calls().last().unwrap().args.last().unwrap(), "default.tfplan");
        assert!(
            orch.plan_record(&pull("a1").pr_ref(), &project.key("acme/infra"))
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_apply_failure_keeps_plan() {
        let tool = Arc::new(ScriptedTool::new());
        tool.fail_on("apply", 1, "Error: quota");
        let (_data, _wd, orch) = orchestrator(tool);
        let project = Project::adhoc("staging", "default");
        orch.plan_project(&pull("a1"), &project, &[]).await;

        let result = orch
            .apply_project(&pull("a1"), &project, &[])
            .await
            .into_result()
            .unwrap();
        assert_eq!(result.outcome, Outcome::Failed);
        assert!(
            orch.plan_record(&pull("a1").pr_ref(), &project.key("acme/infra"))
                .is_some()
        );
    }

    #[tokio::test]
    async fn test_newer_head_supersedes_in_flight_plan() {
        let tool = Arc::new(ScriptedTool::new());
        tool.block_on("plan");
        let (_data, _wd, orch) = orchestrator(tool.clone());
        let orch = Arc::new(orch);
        let project = Project::adhoc("staging", "default");
        orch.observe_head(&pull("a1").pr_ref(), "a1", 0);

        let running = {
            let orch = Arc::clone(&orch);
            let project = project.clone();
            tokio::spawn(async move { orch.plan_project(&pull("a1"), &project, &[]).await })
        };
        tool.wait_until_blocked().await;
        assert_eq!(orch.active_runs().len(), 1);

        assert_eq!(orch.observe_head(&pull("a2").pr_ref(), "a2", 1), 1);
        let outcome = running.await.unwrap();
        assert!(matches!(outcome, RunOutcome::Superseded { .. }));
        assert!(orch.active_runs().is_empty());
        assert!(
            orch.plan_record(&pull("a1").pr_ref(), &project.key("acme/infra"))
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_plan_projects_runs_all() {
        let tool = Arc::new(ScriptedTool::new());
        let (_data, workdirs, orch) = orchestrator(tool);
        let projects = vec![
            Project::adhoc("staging", "default"),
            Project::adhoc("production", "default"),
        ];
        let outcomes = orch.plan_projects(&pull("a1"), &projects, &[]).await;
        assert_eq!(outcomes.len(), 2);
        assert!(
            outcomes
                .into_iter()
                .all(|o| o.into_result().is_some_and(|r| r.is_success()))
        );
        // One checkout shared by both projects.
        assert_eq!(workdirs.clone_count(), 1);
    }

    #[tokio::test]
    async fn test_forget_pr_drops_state_and_copies() {
        let tool = Arc::new(ScriptedTool::new());
        let (_data, workdirs, orch) = orchestrator(tool);
        let project = Project::adhoc("staging", "default");
        orch.plan_project(&pull("a1"), &project, &[]).await;

        orch.forget_pr(&pull("a1")).await.unwrap();
        assert!(
            orch.plan_record(&pull("a1").pr_ref(), &project.key("acme/infra"))
                .is_none()
        );
        assert!(!workdirs.path_for(&pull("a1").repo, 1, "default").exists());
    }

    #[test]
    fn test_head_from_earlier_event_does_not_roll_back() {
        let tool = Arc::new(ScriptedTool::new());
        let (_data, _wd, orch) = orchestrator(tool);
        let pr = pull("a1").pr_ref();

        orch.observe_head(&pr, "a2", 5);
        // A slower read for an event received earlier still sees a1.
        assert_eq!(orch.observe_head(&pr, "a1", 3), 0);
        assert!(orch.is_current(&pr, "a2"));
        assert!(!orch.is_current(&pr, "a1"));

        // Later events move the head, even back to an earlier sha.
        orch.observe_head(&pr, "a1", 6);
        assert!(orch.is_current(&pr, "a1"));
    }

    #[tokio::test]
    async fn test_plan_record_survives_restart() {
        let tool = Arc::new(ScriptedTool::new());
        let (_data, workdirs, orch) = orchestrator(tool.clone());
        let project = Project::adhoc("staging", "default");
        let key = project.key("acme/infra");
        orch.plan_project(&pull("a1"), &project, &[]).await;
        let sidecar = workdirs
            .path_for(&pull("a1").repo, 1, "default")
            .join("staging")
            .join("default.tfplan.json");
        assert!(sidecar.exists());
        drop(orch);

        let restarted = RunOrchestrator::new(tool.clone(), workdirs.clone(), Duration::from_secs(60));
        assert!(restarted.plan_record(&pull("a1").pr_ref(), &key).is_none());
        let result = restarted
            .apply_project(&pull("a1"), &project, &[])
            .await
            .into_result()
            .unwrap();
        assert!(result.is_success(), "unexpected failure: {:?}", result.failure);
        assert_eq!(tool.calls_for("apply").len(), 1);
        // Consumed on success.
        assert!(!sidecar.exists());
    }

    #[tokio::test]
    async fn test_persisted_plan_for_old_head_is_not_applied() {
        let tool = Arc::new(ScriptedTool::new());
        let (_data, workdirs, orch) = orchestrator(tool.clone());
        let project = Project::adhoc("staging", "default");
        orch.plan_project(&pull("a1"), &project, &[]).await;
        drop(orch);

        let restarted = RunOrchestrator::new(tool.clone(), workdirs, Duration::from_secs(60));
        let result = restarted
            .apply_project(&pull("a2"), &project, &[])
            .await
            .into_result()
            .unwrap();
        assert_eq!(result.failure, Some(FailureKind::MissingPlan));
        assert!(tool.calls_for("apply").is_empty());
    }

    #[tokio::test]
    async fn test_forget_plans_removes_persisted_record() {
        let tool = Arc::new(ScriptedTool::new());
        let (_data, workdirs, orch) = orchestrator(tool.clone());
        let project = Project::adhoc("staging", "default");
        let key = project.key("acme/infra");
        orch.plan_project(&pull("a1"), &project, &[]).await;

        orch.forget_plans(&pull("a1"), std::slice::from_ref(&key)).await;
        drop(orch);
        let restarted = RunOrchestrator::new(tool, workdirs, Duration::from_secs(60));
        let result = restarted
            .apply_project(&pull("a1"), &project, &[])
            .await
            .into_result()
            .unwrap();
        assert_eq!(result.failure, Some(FailureKind::MissingPlan));
    }

    #[tokio::test]
    async fn test_tool_start_failure() {
        let tool = Arc::new(ScriptedTool::new());
        tool.fail_to_start("init");
        let (_data, _wd, orch) = orchestrator(tool);
        let project = Project::adhoc("staging", "default");

        let result = orch
            .plan_project(&pull("a1"), &project, &[])
            .await
            .into_result()
            .unwrap();
        assert_eq!(result.failure, Some(FailureKind::Tool { exit_code: None }));
        assert!(result.output.contains("simulated start failure"));

        // On a superseded head the same failure is discarded, not reported.
        orch.observe_head(&pull("a2").pr_ref(), "a2", 1);
        let outcome = orch.plan_project(&pull("a1"), &project, &[]).await;
        assert!(matches!(outcome, RunOutcome::Superseded { .. }));
    }
}
