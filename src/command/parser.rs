//! Comment parser.
//!
//! Grammar: `<prefix> [plan|apply|unlock|help] [flags] [-- tool args...]`.
//! Comments that do not begin with the prefix token are not commands and
//! parse to `Ok(None)`.

use std::sync::LazyLock;

use regex::Regex;

use super::{Command, CommandName};
use crate::errors::ParseError;
use crate::models::clean_relative_path;

static WORKSPACE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_.-]+$").expect("valid workspace regex"));

/// Parses operator comments that start with a fixed prefix.
#[derive(Debug, Clone)]
pub struct CommandParser {
    prefix: String,
}

#[derive(Clone, Copy)]
enum Flag {
    Dir,
    Workspace,
    Project,
}

impl Flag {
    fn lookup(token: &str) -> Option<Self> {
        match token {
            "-d" | "--dir" => Some(Flag::Dir),
            "-w" | "--workspace" => Some(Flag::Workspace),
            "-p" | "--project" => Some(Flag::Project),
            _ => None,
        }
    }

    fn long(self) -> &'static str {
        match self {
            Flag::Dir => "--dir",
            Flag::Workspace => "--workspace",
            Flag::Project => "--project",
        }
    }
}

/// True when `name` is an acceptable workspace name.
pub fn is_valid_workspace(name: &str) -> bool {
    WORKSPACE_RE.is_match(name)
}

impl CommandParser {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Parse one comment.
    ///
    /// `Ok(None)` means the comment is not addressed to us. A bare prefix is
    /// `help`.
    pub fn parse(&self, comment: &str) -> Result<Option<Command>, ParseError> {
        let comment = comment.trim();
        if comment.contains('\n') {
            return Ok(None);
        }
        if comment.split_whitespace().next() != Some(self.prefix.as_str()) {
            return Ok(None);
        }

        let tokens = tokenize(comment)?;
        let mut rest = tokens.into_iter().skip(1);

        let name = match rest.next() {
            None => return Ok(Some(Command::new(CommandName::Help))),
            Some(word) => word.parse::<CommandName>()?,
        };
        let mut cmd = Command::new(name);

        while let Some(token) = rest.next() {
            if token == "--" {
                cmd.extra_args = rest.by_ref().collect();
                break;
            }

            let (flag_token, inline_value) = match token.split_once('=') {
                Some((flag, value)) if token.starts_with("--") => {
                    (flag.to_string(), Some(value.to_string()))
                }
                _ => (token.clone(), None),
            };

            let Some(flag) = Flag::lookup(&flag_token) else {
                if token.starts_with('-') {
                    return Err(ParseError::UnknownFlag(flag_token));
                }
                return Err(ParseError::UnexpectedArgument(token));
            };

            let value = match inline_value {
                Some(v) => v,
                None => rest
                    .next()
                    .ok_or_else(|| ParseError::MissingValue(flag_token.clone()))?,
            };
            if value.is_empty() {
                return Err(ParseError::MissingValue(flag_token));
            }

            match flag {
                Flag::Dir => {
                    let cleaned =
                        clean_relative_path(&value).ok_or(ParseError::InvalidDir(value))?;
                    cmd.dir = Some(cleaned);
                }
                Flag::Workspace => {
                    if !is_valid_workspace(&value) {
                        return Err(ParseError::InvalidWorkspace(value));
                    }
                    cmd.workspace = Some(value);
                }
                Flag::Project => cmd.project_name = Some(value),
            }
        }

        if cmd.project_name.is_some() {
            let other = if cmd.dir.is_some() {
                Some(Flag::Dir)
            } else if cmd.workspace.is_some() {
                Some(Flag::Workspace)
            } else {
                None
            };
            if let Some(other) = other {
                return Err(ParseError::ConflictingFlags {
                    first: Flag::Project.long().to_string(),
                    second: other.long().to_string(),
                });
            }
        }

        if matches!(cmd.name, CommandName::Help | CommandName::Unlock)
            && !cmd.extra_args.is_empty()
        {
            return Err(ParseError::ExtraArgsNotAllowed(cmd.name.to_string()));
        }

        Ok(Some(cmd))
    }
}

/// Split on whitespace, keeping `'...'` and `"..."` spans whole.
fn tokenize(input: &str) -> Result<Vec<String>, ParseError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote: Option<char> = None;

    for c in input.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if c == '\'' || c == '"' => {
                quote = Some(c);
                in_token = true;
            }
            None if c.is_whitespace() => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            None => {
                current.push(c);
                in_token = true;
            }
        }
    }

    if quote.is_some() {
        return Err(ParseError::UnterminatedQuote(input.to_string()));
    }
    if in_token {
        tokens.push(current);
    }
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser() -> CommandParser {
        CommandParser::new("planlock")
    }

    fn parse_ok(comment: &str) -> Command {
        parser()
            .parse(comment)
            .expect("parse should succeed")
            .expect("comment should be a command")
    }

    #[test]
    fn test_ignores_comments_without_prefix() {
        assert_eq!(parser().parse("looks good to me").unwrap(), None);
        assert_eq!(parser().parse("planlockplan").unwrap(), None);
        assert_eq!(parser().parse("").unwrap(), None);
    }

    #[test]
    fn test_ignores_multiline_comments() {
        assert_eq!(parser().parse("planlock plan\nplease").unwrap(), None);
    }

    #[test]
    fn test_bare_prefix_is_help() {
        assert_eq!(parse_ok("planlock").name, CommandName::Help);
        assert_eq!(parse_ok("  planlock help  ").name, CommandName::Help);
    }

    #[test]
    fn test_plan_with_dir() {
        let cmd = parse_ok("planlock plan -d staging");
        assert_eq!(cmd.name, CommandName::Plan);
        assert_eq!(cmd.dir.as_deref(), Some("staging"));
        assert_eq!(cmd.workspace, None);
        assert!(cmd.extra_args.is_empty());
    }

    #[test]
    fn test_apply_without_flags_has_no_target() {
        let cmd = parse_ok("planlock apply");
        assert_eq!(cmd.name, CommandName::Apply);
        assert!(!cmd.has_explicit_target());
    }

    #[test]
    fn test_long_flags_and_inline_values() {
        let cmd = parse_ok("planlock plan --dir=./prod/ --workspace blue");
        assert_eq!(cmd.dir.as_deref(), Some("prod"));
        assert_eq!(cmd.workspace.as_deref(), Some("blue"));
    }

    #[test]
    fn test_project_flag() {
        let cmd = parse_ok("planlock apply -p networking");
        assert_eq!(cmd.project_name.as_deref(), Some("networking"));
    }

    #[test]
    fn test_extra_args_pass_verbatim() {
        let cmd = parse_ok(r#"planlock plan -d staging -- -var "name=a b" -target=x"#);
        assert_eq!(cmd.extra_args, vec!["-var", "name=a b", "-target=x"]);
    }

    #[test]
    fn test_quoted_flag_value() {
        let cmd = parse_ok("planlock plan -d 'modules/vpc'");
        assert_eq!(cmd.dir.as_deref(), Some("modules/vpc"));
    }

    #[test]
    fn test_unknown_flag_names_token() {
        let err = parser().parse("planlock plan --force").unwrap_err();
        assert_eq!(err, ParseError::UnknownFlag("--force".into()));
        assert!(err.to_string().contains("--force"));
    }

    #[test]
    fn test_unknown_command() {
        let err = parser().parse("planlock destroy").unwrap_err();
        assert_eq!(err, ParseError::UnknownCommand("destroy".into()));
    }

    #[test]
    fn test_stray_argument() {
        let err = parser().parse("planlock plan staging").unwrap_err();
        assert_eq!(err, ParseError::UnexpectedArgument("staging".into()));
    }

    #[test]
    fn test_missing_value() {
        let err = parser().parse("planlock plan -d").unwrap_err();
        assert_eq!(err, ParseError::MissingValue("-d".into()));
    }

    #[test]
    fn test_project_conflicts_with_dir() {
        let err = parser().parse("planlock plan -p app -d staging").unwrap_err();
        assert!(matches!(err, ParseError::ConflictingFlags { .. }));
        let err = parser().parse("planlock plan -w prod -p app").unwrap_err();
        assert!(matches!(err, ParseError::ConflictingFlags { .. }));
    }

    #[test]
    fn test_dir_cannot_escape_repo() {
        let err = parser().parse("planlock plan -d ../secrets").unwrap_err();
        assert_eq!(err, ParseError::InvalidDir("../secrets".into()));
        assert!(parser().parse("planlock plan -d /etc").is_err());
    }

    #[test]
    fn test_workspace_charset() {
        let err = parser().parse("planlock plan -w 'prod;rm'").unwrap_err();
        assert_eq!(err, ParseError::InvalidWorkspace("prod;rm".into()));
    }

    #[test]
    fn test_unlock_and_help_reject_extra_args() {
        assert_eq!(
            parser().parse("planlock unlock -- -force").unwrap_err(),
            ParseError::ExtraArgsNotAllowed("unlock".into())
        );
        assert!(parser().parse("planlock help -- x").is_err());
    }

    #[test]
    fn test_unterminated_quote() {
        let err = parser().parse("planlock plan -d 'staging").unwrap_err();
        assert!(matches!(err, ParseError::UnterminatedQuote(_)));
    }

    #[test]
    fn test_custom_prefix() {
        let p = CommandParser::new("atlas");
        assert!(p.parse("planlock plan").unwrap().is_none());
        assert_eq!(p.parse("atlas plan").unwrap().unwrap().name, CommandName::Plan);
    }
}
