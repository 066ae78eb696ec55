//! Operator commands issued through pull-request comments.
//!
//! A comment such as `planlock plan -d staging -- -var foo=bar` becomes a
//! [`Command`]. Parsing lives in [`parser`]; this module holds the types and
//! the help text.

pub mod parser;

pub use parser::CommandParser;

use serde::{Deserialize, Serialize};

/// The four commands an operator can issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandName {
    Plan,
    Apply,
    Unlock,
    Help,
}

impl CommandName {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandName::Plan => "plan",
            CommandName::Apply => "apply",
            CommandName::Unlock => "unlock",
            CommandName::Help => "help",
        }
    }
}

impl std::fmt::Display for CommandName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CommandName {
    type Err = crate::errors::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plan" => Ok(CommandName::Plan),
            "apply" => Ok(CommandName::Apply),
            "unlock" => Ok(CommandName::Unlock),
            "help" => Ok(CommandName::Help),
            other => Err(crate::errors::ParseError::UnknownCommand(other.to_string())),
        }
    }
}

/// A parsed operator command. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub name: CommandName,
    /// Repository-relative directory, already normalized.
    pub dir: Option<String>,
    pub workspace: Option<String>,
    pub project_name: Option<String>,
    /// Tokens after `--`, passed to the tool verbatim.
    pub extra_args: Vec<String>,
}

impl Command {
    pub fn new(name: CommandName) -> Self {
        Self {
            name,
            dir: None,
            workspace: None,
            project_name: None,
            extra_args: Vec::new(),
        }
    }

    /// True when the operator named a project, directory or workspace.
    pub fn has_explicit_target(&self) -> bool {
        self.dir.is_some() || self.workspace.is_some() || self.project_name.is_some()
    }
}

/// Markdown posted in reply to `help`.
pub fn help_text(prefix: &str) -> String {
    format!(
        "```cmake\n\
planlock\n\
Plan and apply infrastructure changes from pull request comments.\n\
\n\
Usage:\n  \
{p} <command> [options] [-- tool flags]\n\
\n\
Commands:\n  \
plan     Runs plan for projects changed in this pull request.\n           \
Use -d/-w or -p to plan one project.\n  \
apply    Applies the plans of every project this pull request has locked.\n           \
Use -d/-w or -p to apply one project.\n  \
unlock   Releases every lock held by this pull request,\n           \
or just one with -d/-w or -p.\n  \
help     Shows this message.\n\
\n\
Options:\n  \
-d, --dir <dir>              Repository-relative project directory.\n  \
-w, --workspace <workspace>  Tool workspace (default \"default\").\n  \
-p, --project <name>         Project name from the repository configuration.\n  \
--                           Everything after is passed to the tool.\n\
```",
        p = prefix
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_name_round_trip_strings() {
        for name in [
            CommandName::Plan,
            CommandName::Apply,
            CommandName::Unlock,
            CommandName::Help,
        ] {
            assert_eq!(name.as_str().parse::<CommandName>().unwrap(), name);
        }
    }

    #[test]
    fn test_command_name_rejects_unknown() {
        let err = "destroy".parse::<CommandName>().unwrap_err();
        assert!(err.to_string().contains("destroy"));
    }

    #[test]
    fn test_explicit_target() {
        let mut cmd = Command::new(CommandName::Plan);
        assert!(!cmd.has_explicit_target());
        cmd.workspace = Some("prod".into());
        assert!(cmd.has_explicit_target());
    }

    #[test]
    fn test_help_text_uses_prefix() {
        let text = help_text("planlock");
        assert!(text.contains("planlock <command>"));
        assert!(text.contains("--project"));
    }
}
