//! Aggregating per-project results into one comment and one commit status.

use crate::command::CommandName;
use crate::runner::{Outcome, RunResult};

/// Default comment size ceiling, in characters.
pub const DEFAULT_MAX_COMMENT_CHARS: usize = 65_536;

const TRUNCATION_MARKER: &str = "...(output truncated)...\n";

#[derive(Debug, Clone)]
pub struct CommandReport {
    pub command: CommandName,
    pub results: Vec<RunResult>,
}

impl CommandReport {
    pub fn new(command: CommandName, results: Vec<RunResult>) -> Self {
        Self { command, results }
    }

    /// Succeeded only if every targeted project succeeded.
    pub fn overall(&self) -> Outcome {
        if self.results.iter().all(RunResult::is_success) {
            Outcome::Succeeded
        } else {
            Outcome::Failed
        }
    }

    pub fn succeeded_count(&self) -> usize {
        self.results.iter().filter(|r| r.is_success()).count()
    }

    /// e.g. `2/3 projects planned successfully`.
    pub fn status_description(&self) -> String {
        let verb = match self.command {
            CommandName::Plan => "planned",
            CommandName::Apply => "applied",
            CommandName::Unlock => "unlocked",
            CommandName::Help => "handled",
        };
        format!(
            "{}/{} projects {} successfully",
            self.succeeded_count(),
            self.results.len(),
            verb
        )
    }

    /// Markdown comment no longer than `max_chars` characters. Each project's
    /// output shares the space left after headers, keeping its tail.
    pub fn render(&self, prefix: &str, max_chars: usize) -> String {
        let skeleton = self.render_with(prefix, |_| String::new());
        let outputs = self.results.iter().filter(|r| !r.output.is_empty()).count();
        let per_output = if outputs == 0 {
            0
        } else {
            // One extra char per output for a closing newline.
            max_chars.saturating_sub(char_len(&skeleton) + outputs) / outputs
        };

        let rendered = self.render_with(prefix, |output| truncate_tail(output, per_output));
        if char_len(&rendered) <= max_chars {
            rendered
        } else {
            truncate_tail(&rendered, max_chars)
        }
    }

    fn render_with(&self, prefix: &str, output: impl Fn(&str) -> String) -> String {
        let mut out = String::new();
        let n = self.results.len();
        out.push_str(&format!(
            "Ran {} for {} project{}:\n\n",
            title_case(self.command),
            n,
            if n == 1 { "" } else { "s" }
        ));
        for (i, result) in self.results.iter().enumerate() {
            out.push_str(&format!("{}. {}\n", i + 1, project_heading(result)));
        }
        out.push('\n');

        for (i, result) in self.results.iter().enumerate() {
            out.push_str(&format!("### {}. {}\n", i + 1, project_heading(result)));
            match (&result.outcome, &result.failure) {
                (Outcome::Succeeded, _) => {
                    out.push_str(&format!("**{} succeeded.**\n", title_case(result.command)));
                }
                (Outcome::Failed, Some(failure)) => {
                    out.push_str(&format!(
                        "**{} failed:** {}\n",
                        title_case(result.command),
                        failure
                    ));
                }
                (Outcome::Failed, None) => {
                    out.push_str(&format!("**{} failed.**\n", title_case(result.command)));
                }
            }
            if !result.output.is_empty() {
                out.push_str("```diff\n");
                out.push_str(&output(&result.output));
                if !out.ends_with('\n') {
                    out.push('\n');
                }
                out.push_str("```\n");
            }
            if result.command == CommandName::Plan && result.is_success() {
                out.push_str(&format!(
                    "* To apply this plan, comment `{} apply {}`\n* To discard it, comment `{} unlock {}`\n",
                    prefix,
                    target_flags(result),
                    prefix,
                    target_flags(result)
                ));
            }
            out.push_str("\n---\n");
        }

        if self.command == CommandName::Plan && self.succeeded_count() > 0 {
            out.push_str(&format!(
                "* To apply all plans from this pull request, comment `{} apply`\n",
                prefix
            ));
        }
        out
    }
}

fn title_case(name: CommandName) -> &'static str {
    match name {
        CommandName::Plan => "Plan",
        CommandName::Apply => "Apply",
        CommandName::Unlock => "Unlock",
        CommandName::Help => "Help",
    }
}

fn project_heading(result: &RunResult) -> String {
    let base = format!(
        "dir: `{}` workspace: `{}`",
        result.project.dir, result.project.workspace
    );
    match &result.project_name {
        Some(name) => format!("project: `{}` {}", name, base),
        None => base,
    }
}

fn target_flags(result: &RunResult) -> String {
    match &result.project_name {
        Some(name) => format!("-p {}", name),
        None => format!("-d {} -w {}", result.project.dir, result.project.workspace),
    }
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Keep the last characters of `s` so the result is at most `max` chars,
/// marking the cut.
pub fn truncate_tail(s: &str, max: usize) -> String {
    let len = char_len(s);
    if len <= max {
        return s.to_string();
    }
    let marker_len = char_len(TRUNCATION_MARKER);
    if max <= marker_len {
        return s.chars().skip(len - max).collect();
    }
    let keep = max - marker_len;
    let tail: String = s.chars().skip(len - keep).collect();
    format!("{}{}", TRUNCATION_MARKER, tail)
}
