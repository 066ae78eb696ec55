//! Repository allow-list: comma-separated `hostname/owner/name` globs.

use glob::{MatchOptions, Pattern};

use crate::errors::ConfigError;
use crate::models::Repo;

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: false,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

#[derive(Debug, Clone)]
pub struct RepoAllowlist {
    patterns: Vec<Pattern>,
}

impl RepoAllowlist {
    /// Parse `github.com/acme/*,github.com/other/infra`.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        if raw.contains("://") {
            return Err(ConfigError::Invalid(
                "--repo-allowlist cannot contain ://, should be hostnames only".to_string(),
            ));
        }
        let patterns = raw
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(|entry| {
                Pattern::new(entry).map_err(|e| {
                    ConfigError::Invalid(format!("invalid --repo-allowlist entry \"{}\": {}", entry, e))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    pub fn is_allowed(&self, repo: &Repo) -> bool {
        let id = repo.allowlist_id();
        self.patterns
            .iter()
            .any(|pattern| pattern.matches_with(&id, MATCH_OPTIONS))
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}
