//! Projects: the deployable units a command targets.

pub mod config;
pub mod resolver;

pub use config::{FileRepoConfigLoader, RepoConfig, RepoConfigLoader};
pub use resolver::ProjectResolver;

use glob::{MatchOptions, Pattern};
use serde::{Deserialize, Serialize};

use crate::models::{DEFAULT_WORKSPACE, ProjectKey, clean_relative_path};

/// Autoplan pattern used when a project declares none.
pub const DEFAULT_AUTOPLAN_PATTERN: &str = "**/*.tf*";

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Extra checks a project demands before `apply`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApplyRequirement {
    Approved,
    Mergeable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AutoplanConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Globs relative to the project dir. `../` may reach sibling modules.
    #[serde(default = "default_when_modified")]
    pub when_modified: Vec<String>,
}

fn default_true() -> bool {
    true
}

fn default_when_modified() -> Vec<String> {
    vec![DEFAULT_AUTOPLAN_PATTERN.to_string()]
}

fn default_workspace() -> String {
    DEFAULT_WORKSPACE.to_string()
}

impl Default for AutoplanConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            when_modified: default_when_modified(),
        }
    }
}

/// One declared project from the repository configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Project {
    #[serde(default)]
    pub name: Option<String>,
    pub dir: String,
    #[serde(default = "default_workspace")]
    pub workspace: String,
    #[serde(default)]
    pub autoplan: AutoplanConfig,
    #[serde(default)]
    pub apply_requirements: Vec<ApplyRequirement>,
}

impl Project {
    /// A project that is not declared anywhere: default autoplan, no extra
    /// apply requirements.
    pub fn adhoc(dir: &str, workspace: &str) -> Self {
        Self {
            name: None,
            dir: clean_relative_path(dir).unwrap_or_else(|| dir.to_string()),
            workspace: workspace.to_string(),
            autoplan: AutoplanConfig::default(),
            apply_requirements: Vec::new(),
        }
    }

    pub fn key(&self, repo_full_name: &str) -> ProjectKey {
        ProjectKey::new(repo_full_name, &self.dir, &self.workspace)
    }

    /// Name for reports: the declared name, else `dir@workspace`.
    pub fn display_name(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => format!("{}@{}", self.dir, self.workspace),
        }
    }

    /// Autoplan patterns joined onto the project dir.
    ///
    /// Patterns that would climb above the repository root are dropped.
    pub fn autoplan_patterns(&self) -> Vec<String> {
        self.autoplan
            .when_modified
            .iter()
            .filter_map(|pattern| {
                let joined = if self.dir == "." {
                    pattern.clone()
                } else {
                    format!("{}/{}", self.dir, pattern)
                };
                clean_relative_path(&joined)
            })
            .collect()
    }

    /// True when any changed file matches one of the autoplan patterns,
    /// either as a glob or, for literal patterns, as a directory prefix.
    pub fn matches_changed_files(&self, changed_files: &[String]) -> bool {
        let patterns = self.autoplan_patterns();
        changed_files.iter().any(|file| {
            let file = file.trim_start_matches("./");
            patterns.iter().any(|pattern| path_matches(pattern, file))
        })
    }
}

fn is_literal(pattern: &str) -> bool {
    !pattern.contains(['*', '?', '['])
}

fn path_matches(pattern: &str, file: &str) -> bool {
    if is_literal(pattern) {
        return pattern == "."
            || file == pattern
            || file
                .strip_prefix(pattern)
                .is_some_and(|rest| rest.starts_with('/'));
    }
    Pattern::new(pattern)
        .map(|p| p.matches_with(file, MATCH_OPTIONS))
        .unwrap_or(false)
}
