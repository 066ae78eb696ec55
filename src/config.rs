//! Server configuration.
//!
//! Settings come from four layers, highest precedence first: command-line
//! flags, `PLANLOCK_*` environment variables, a TOML file, then defaults.
//! Each layer is a [`ConfigLayer`] of optional values; [`ConfigLayer::or`]
//! merges them and [`ServerConfig::resolve`] fills defaults and validates.
//!
//! ```toml
//! repo-allowlist = "github.com/acme/*"
//! gh-user = "planlock-bot"
//! gh-token = "ghp_..."
//! data-dir = "~/.planlock"
//! release-lock-on-apply = true
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::engine::EngineConfig;
use crate::errors::ConfigError;
use crate::policy::{PolicyConfig, RepoAllowlist};
use crate::report::DEFAULT_MAX_COMMENT_CHARS;

pub const DEFAULT_PORT: u16 = 4141;
pub const DEFAULT_HOSTNAME: &str = "github.com";
pub const DEFAULT_COMMENT_PREFIX: &str = "planlock";
pub const DEFAULT_TOOL_BINARY: &str = "terraform";
pub const DEFAULT_TOOL_TIMEOUT_SECS: u64 = 3600;
pub const DEFAULT_DATA_DIR: &str = "~/.planlock";
pub const ENV_PREFIX: &str = "PLANLOCK_";

/// Smallest comment ceiling that still fits headers and some output.
const MIN_COMMENT_CHARS: usize = 1024;
const REDACTED: &str = "<redacted>";

/// One source of settings. Unset fields defer to lower layers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ConfigLayer {
    pub public_url: Option<String>,
    pub allow_fork_prs: Option<bool>,
    pub data_dir: Option<PathBuf>,
    pub gh_hostname: Option<String>,
    pub gh_user: Option<String>,
    pub gh_token: Option<String>,
    pub gh_webhook_secret: Option<String>,
    pub log_level: Option<String>,
    pub log_format: Option<String>,
    pub port: Option<u16>,
    pub repo_allowlist: Option<String>,
    pub require_approval: Option<bool>,
    pub require_mergeable: Option<bool>,
    pub comment_prefix: Option<String>,
    pub tool_binary: Option<String>,
    pub tool_timeout_secs: Option<u64>,
    pub release_lock_on_apply: Option<bool>,
    pub repo_config_dir: Option<PathBuf>,
    pub max_comment_chars: Option<usize>,
}

macro_rules! merge_layers {
    ($high:expr, $low:expr, $($field:ident),+ $(,)?) => {
        ConfigLayer {
            $($field: $high.$field.or($low.$field),)+
        }
    };
}

impl ConfigLayer {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Read `PLANLOCK_<SETTING>` variables through `lookup`.
    pub fn from_env(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |name: &str| {
            lookup(&format!("{}{}", ENV_PREFIX, name)).filter(|value| !value.is_empty())
        };
        Ok(Self {
            public_url: get("PUBLIC_URL"),
            allow_fork_prs: parse_env(&get, "ALLOW_FORK_PRS")?,
            data_dir: get("DATA_DIR").map(PathBuf::from),
            gh_hostname: get("GH_HOSTNAME"),
            gh_user: get("GH_USER"),
            gh_token: get("GH_TOKEN"),
            gh_webhook_secret: get("GH_WEBHOOK_SECRET"),
            log_level: get("LOG_LEVEL"),
            log_format: get("LOG_FORMAT"),
            port: parse_env(&get, "PORT")?,
            repo_allowlist: get("REPO_ALLOWLIST"),
            require_approval: parse_env(&get, "REQUIRE_APPROVAL")?,
            require_mergeable: parse_env(&get, "REQUIRE_MERGEABLE")?,
            comment_prefix: get("COMMENT_PREFIX"),
            tool_binary: get("TOOL_BINARY"),
            tool_timeout_secs: parse_env(&get, "TOOL_TIMEOUT_SECS")?,
            release_lock_on_apply: parse_env(&get, "RELEASE_LOCK_ON_APPLY")?,
            repo_config_dir: get("REPO_CONFIG_DIR").map(PathBuf::from),
            max_comment_chars: parse_env(&get, "MAX_COMMENT_CHARS")?,
        })
    }

    /// Values from `self`, falling back to `lower`.
    pub fn or(self, lower: ConfigLayer) -> ConfigLayer {
        merge_layers!(
            self,
            lower,
            public_url,
            allow_fork_prs,
            data_dir,
            gh_hostname,
            gh_user,
            gh_token,
            gh_webhook_secret,
            log_level,
            log_format,
            port,
            repo_allowlist,
            require_approval,
            require_mergeable,
            comment_prefix,
            tool_binary,
            tool_timeout_secs,
            release_lock_on_apply,
            repo_config_dir,
            max_comment_chars,
        )
    }
}

fn parse_env<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Result<Option<T>, ConfigError> {
    match get(name) {
        None => Ok(None),
        Some(raw) => raw.trim().parse().map(Some).map_err(|_| {
            ConfigError::Invalid(format!(
                "{}{} has an invalid value {:?}",
                ENV_PREFIX, name, raw
            ))
        }),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            _ => Err(ConfigError::Invalid(
                "invalid log level: not one of debug, info, warn, error".to_string(),
            )),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Fmt,
    Json,
}

impl FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fmt" => Ok(LogFormat::Fmt),
            "json" => Ok(LogFormat::Json),
            _ => Err(ConfigError::Invalid(
                "invalid log format: not one of fmt, json".to_string(),
            )),
        }
    }
}

/// Fully resolved and validated server settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ServerConfig {
    pub public_url: String,
    pub allow_fork_prs: bool,
    pub data_dir: PathBuf,
    pub gh_hostname: String,
    pub gh_user: String,
    pub gh_token: String,
    /// `None` disables signature checks.
    pub gh_webhook_secret: Option<String>,
    pub log_level: LogLevel,
    pub log_format: LogFormat,
    pub port: u16,
    pub repo_allowlist: String,
    pub require_approval: bool,
    pub require_mergeable: bool,
    pub comment_prefix: String,
    pub tool_binary: String,
    pub tool_timeout_secs: u64,
    pub release_lock_on_apply: bool,
    pub repo_config_dir: PathBuf,
    pub max_comment_chars: usize,
}

impl ServerConfig {
    /// Fill defaults into the merged `layer` and validate.
    ///
    /// `home` expands a leading `~` in paths; relative paths are joined to `cwd`.
    pub fn resolve(layer: ConfigLayer, home: Option<&Path>, cwd: &Path) -> Result<Self, ConfigError> {
        let repo_allowlist = layer
            .repo_allowlist
            .filter(|raw| !raw.trim().is_empty())
            .ok_or_else(|| {
                ConfigError::Invalid("--repo-allowlist must be set for security purposes".into())
            })?;
        // Surfaces the `://` and glob errors.
        RepoAllowlist::parse(&repo_allowlist)?;

        let gh_user = layer
            .gh_user
            .map(|user| user.trim_start_matches('@').to_string())
            .unwrap_or_default();
        let gh_token = layer.gh_token.unwrap_or_default();
        if gh_user.is_empty() || gh_token.is_empty() {
            return Err(ConfigError::Invalid(
                "--gh-user and --gh-token must both be set".into(),
            ));
        }

        let log_level = match layer.log_level {
            Some(raw) => raw.parse()?,
            None => LogLevel::Info,
        };
        let log_format = match layer.log_format {
            Some(raw) => raw.parse()?,
            None => LogFormat::Fmt,
        };

        let comment_prefix = layer
            .comment_prefix
            .unwrap_or_else(|| DEFAULT_COMMENT_PREFIX.to_string());
        if comment_prefix.is_empty() || comment_prefix.contains(char::is_whitespace) {
            return Err(ConfigError::Invalid(
                "--comment-prefix must be a single non-empty word".into(),
            ));
        }

        let tool_timeout_secs = layer.tool_timeout_secs.unwrap_or(DEFAULT_TOOL_TIMEOUT_SECS);
        if tool_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "--tool-timeout-secs must be greater than 0".into(),
            ));
        }
        let max_comment_chars = layer.max_comment_chars.unwrap_or(DEFAULT_MAX_COMMENT_CHARS);
        if max_comment_chars < MIN_COMMENT_CHARS {
            return Err(ConfigError::Invalid(format!(
                "--max-comment-chars must be at least {}",
                MIN_COMMENT_CHARS
            )));
        }

        let data_dir = absolute_path(
            &layer
                .data_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR)),
            home,
            cwd,
        )?;
        let repo_config_dir = match layer.repo_config_dir {
            Some(dir) => absolute_path(&dir, home, cwd)?,
            None => data_dir.join("repos.d"),
        };

        let port = layer.port.unwrap_or(DEFAULT_PORT);
        Ok(Self {
            public_url: layer
                .public_url
                .unwrap_or_else(|| format!("http://localhost:{}", port))
                .trim_end_matches('/')
                .to_string(),
            allow_fork_prs: layer.allow_fork_prs.unwrap_or(false),
            data_dir,
            gh_hostname: layer
                .gh_hostname
                .unwrap_or_else(|| DEFAULT_HOSTNAME.to_string()),
            gh_user,
            gh_token,
            gh_webhook_secret: layer.gh_webhook_secret.filter(|s| !s.is_empty()),
            log_level,
            log_format,
            port,
            repo_allowlist,
            require_approval: layer.require_approval.unwrap_or(false),
            require_mergeable: layer.require_mergeable.unwrap_or(false),
            comment_prefix,
            tool_binary: layer
                .tool_binary
                .unwrap_or_else(|| DEFAULT_TOOL_BINARY.to_string()),
            tool_timeout_secs,
            release_lock_on_apply: layer.release_lock_on_apply.unwrap_or(false),
            repo_config_dir,
            max_comment_chars,
        })
    }

    /// Copy safe to print.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        copy.gh_token = REDACTED.to_string();
        if copy.gh_webhook_secret.is_some() {
            copy.gh_webhook_secret = Some(REDACTED.to_string());
        }
        copy
    }

    pub fn policy(&self) -> PolicyConfig {
        PolicyConfig {
            allow_fork_prs: self.allow_fork_prs,
            require_approval: self.require_approval,
            require_mergeable: self.require_mergeable,
        }
    }

    pub fn engine(&self) -> EngineConfig {
        EngineConfig {
            comment_prefix: self.comment_prefix.clone(),
            release_lock_on_apply: self.release_lock_on_apply,
            max_comment_chars: self.max_comment_chars,
        }
    }

    pub fn allowlist(&self) -> Result<RepoAllowlist, ConfigError> {
        RepoAllowlist::parse(&self.repo_allowlist)
    }
}

fn absolute_path(path: &Path, home: Option<&Path>, cwd: &Path) -> Result<PathBuf, ConfigError> {
    let expanded = match path.strip_prefix("~") {
        Ok(rest) => {
            let home = home.ok_or_else(|| {
                ConfigError::Invalid(format!(
                    "cannot expand ~ in {}: home directory is unknown",
                    path.display()
                ))
            })?;
            home.join(rest)
        }
        Err(_) => path.to_path_buf(),
    };
    Ok(if expanded.is_absolute() {
        expanded
    } else {
        cwd.join(expanded)
    })
}
