//! Repository configuration: which projects a repository declares.
//!
//! Loaded from `<repo_config_dir>/<owner>/<name>.yaml`:
//!
//! ```yaml
//! version: 1
//! projects:
//!   - name: staging
//!     dir: envs/staging
//!     workspace: default
//!     autoplan:
//!       when_modified: ["**/*.tf*", "../../modules/**/*.tf"]
//!     apply_requirements: [approved]
//! ```
//!
//! A repository without a file gets an undeclared configuration: any
//! directory may be targeted explicitly and autoplan follows the
//! directories of changed `.tf` files.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::Project;
use crate::command::parser::is_valid_workspace;
use crate::errors::ConfigError;
use crate::models::{Repo, clean_relative_path};

pub const SUPPORTED_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RepoConfig {
    pub version: u32,
    #[serde(default)]
    pub projects: Vec<Project>,
    /// False when no configuration file exists for the repository.
    #[serde(skip, default = "declared_default")]
    pub declared: bool,
}

fn declared_default() -> bool {
    true
}

impl RepoConfig {
    /// Configuration for a repository without a file.
    pub fn undeclared() -> Self {
        Self {
            version: SUPPORTED_VERSION,
            projects: Vec::new(),
            declared: false,
        }
    }

    pub fn from_yaml(raw: &str, path: &Path) -> Result<Self, ConfigError> {
        let mut config: RepoConfig =
            serde_yaml::from_str(raw).map_err(|e| ConfigError::Parse {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
        config.normalize_and_validate(path)?;
        Ok(config)
    }

    fn normalize_and_validate(&mut self, path: &Path) -> Result<(), ConfigError> {
        let invalid = |message: String| ConfigError::Invalid(format!("{}: {}", path.display(), message));

        if self.version != SUPPORTED_VERSION {
            return Err(invalid(format!(
                "unsupported version {}, expected {}",
                self.version, SUPPORTED_VERSION
            )));
        }

        let mut names = HashSet::new();
        let mut pairs = HashSet::new();
        for project in &mut self.projects {
            project.dir = clean_relative_path(&project.dir).ok_or_else(|| {
                invalid(format!(
                    "project dir \"{}\" must be relative and inside the repository",
                    project.dir
                ))
            })?;
            if !is_valid_workspace(&project.workspace) {
                return Err(invalid(format!("invalid workspace \"{}\"", project.workspace)));
            }
            if let Some(name) = &project.name
                && !names.insert(name.clone())
            {
                return Err(invalid(format!("duplicate project name \"{}\"", name)));
            }
            if !pairs.insert((project.dir.clone(), project.workspace.clone())) {
                return Err(invalid(format!(
                    "dir \"{}\" with workspace \"{}\" is declared twice",
                    project.dir, project.workspace
                )));
            }
            for pattern in &project.autoplan.when_modified {
                glob::Pattern::new(pattern).map_err(|e| {
                    invalid(format!("invalid autoplan pattern \"{}\": {}", pattern, e))
                })?;
            }
        }
        Ok(())
    }

    pub fn find_by_name(&self, name: &str) -> Option<&Project> {
        self.projects
            .iter()
            .find(|p| p.name.as_deref() == Some(name))
    }

    pub fn find_by_dir(&self, dir: &str, workspace: &str) -> Option<&Project> {
        self.projects
            .iter()
            .find(|p| p.dir == dir && p.workspace == workspace)
    }
}

/// Source of repository configuration.
#[async_trait]
pub trait RepoConfigLoader: Send + Sync {
    async fn load(&self, repo: &Repo) -> Result<RepoConfig, ConfigError>;
}

/// Reads `<root>/<owner>/<name>.yaml`.
#[derive(Debug, Clone)]
pub struct FileRepoConfigLoader {
    root: PathBuf,
}

impl FileRepoConfigLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, repo: &Repo) -> PathBuf {
        self.root
            .join(repo.owner())
            .join(format!("{}.yaml", repo.name()))
    }
}

#[async_trait]
impl RepoConfigLoader for FileRepoConfigLoader {
    async fn load(&self, repo: &Repo) -> Result<RepoConfig, ConfigError> {
        let path = self.path_for(repo);
        match tokio::fs::read_to_string(&path).await {
            Ok(raw) => RepoConfig::from_yaml(&raw, &path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(repo = %repo.full_name, path = %path.display(), "no repo config, using defaults");
                Ok(RepoConfig::undeclared())
            }
            Err(source) => Err(ConfigError::Read { path, source }),
        }
    }
}
