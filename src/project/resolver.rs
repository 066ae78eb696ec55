//! Maps a command onto the projects it targets.

use std::collections::BTreeSet;

use super::{Project, RepoConfig};
use crate::command::Command;
use crate::errors::ResolveError;
use crate::models::{DEFAULT_WORKSPACE, ProjectKey};

/// Filename suffixes that make a directory plannable in an undeclared repo.
const UNDECLARED_AUTOPLAN_SUFFIXES: [&str; 2] = [".tf", ".tfvars"];

/// Stateless; borrows the repository configuration per call.
#[derive(Debug, Clone, Copy)]
pub struct ProjectResolver<'a> {
    config: &'a RepoConfig,
}

impl<'a> ProjectResolver<'a> {
    pub fn new(config: &'a RepoConfig) -> Self {
        Self { config }
    }

    /// Resolve a command that names its target.
    ///
    /// `-w` alone targets the repository root in that workspace.
    pub fn resolve_explicit(&self, cmd: &Command) -> Result<Project, ResolveError> {
        if let Some(name) = &cmd.project_name {
            return self
                .config
                .find_by_name(name)
                .cloned()
                .ok_or_else(|| ResolveError::UnknownProject(name.clone()));
        }

        let dir = cmd.dir.as_deref().unwrap_or(".");
        let workspace = cmd.workspace.as_deref().unwrap_or(DEFAULT_WORKSPACE);
        if !self.config.declared {
            return Ok(Project::adhoc(dir, workspace));
        }
        self.config
            .find_by_dir(dir, workspace)
            .cloned()
            .ok_or_else(|| ResolveError::UnknownDir {
                dir: dir.to_string(),
                workspace: workspace.to_string(),
            })
    }

    /// Projects whose autoplan patterns match a changed file, in declaration
    /// order. Projects with autoplan disabled are skipped.
    pub fn resolve_autoplan(&self, changed_files: &[String]) -> Vec<Project> {
        if !self.config.declared {
            return undeclared_autoplan(changed_files);
        }
        self.config
            .projects
            .iter()
            .filter(|p| p.autoplan.enabled && p.matches_changed_files(changed_files))
            .cloned()
            .collect()
    }

    /// Projects behind the given locks. Locks on keys no longer declared
    /// still resolve, so they can be applied or unlocked.
    pub fn resolve_locked(&self, locked: &[ProjectKey]) -> Vec<Project> {
        let mut keys: Vec<&ProjectKey> = locked.iter().collect();
        keys.sort();
        keys.into_iter()
            .map(|key| {
                self.config
                    .find_by_dir(&key.dir, &key.workspace)
                    .cloned()
                    .unwrap_or_else(|| Project::adhoc(&key.dir, &key.workspace))
            })
            .collect()
    }

    /// Resolve `cmd` given the facts the engine gathered for it. `changed_files`
    /// is only consulted for an untargeted plan, `locked` for an untargeted
    /// apply or unlock.
    pub fn resolve(
        &self,
        cmd: &Command,
        changed_files: &[String],
        locked: &[ProjectKey],
    ) -> Result<Vec<Project>, ResolveError> {
        use crate::command::CommandName;

        if cmd.has_explicit_target() {
            return Ok(vec![self.resolve_explicit(cmd)?]);
        }
        Ok(match cmd.name {
            CommandName::Plan => self.resolve_autoplan(changed_files),
            CommandName::Apply | CommandName::Unlock => self.resolve_locked(locked),
            CommandName::Help => Vec::new(),
        })
    }
}

fn undeclared_autoplan(changed_files: &[String]) -> Vec<Project> {
    let dirs: BTreeSet<String> = changed_files
        .iter()
        .filter(|file| {
            UNDECLARED_AUTOPLAN_SUFFIXES
                .iter()
                .any(|suffix| file.ends_with(suffix))
        })
        .map(|file| match file.rsplit_once('/') {
            Some((dir, _)) => dir.to_string(),
            None => ".".to_string(),
        })
        .collect();
    dirs.into_iter()
        .map(|dir| Project::adhoc(&dir, DEFAULT_WORKSPACE))
        .collect()
}
