//! Typed error hierarchy for planlock.
//!
//! One enum per subsystem:
//! - `ParseError`: operator comment syntax
//! - `ResolveError`: command target → declared project
//! - `PolicyError`: allow-list, fork, approval and mergeability checks
//! - `LockError`: lock store
//! - `ConfigError`: server and repository configuration
//! - `VcsError`: VCS host API calls
//! - `EngineError`: what `Engine::handle_event` gives back to the transport
//!
//! Every enum maps onto an `ErrorKind`, which decides how the engine reacts:
//! user errors are commented, transient errors are retried, fatal errors
//! drop the event, tool errors fail the run.

use std::path::PathBuf;

use thiserror::Error;

use crate::models::ProjectKey;

/// How an error is surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad syntax, unknown project, policy violation. Commented, not retried.
    User,
    /// Rate limit, 5xx, store contention. Retried with backoff.
    Transient,
    /// Corrupt store, invalid configuration. Logged; the event is dropped.
    Fatal,
    /// The external tool exited non-zero or timed out.
    Tool,
}

/// Errors from parsing an operator comment.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("unknown command \"{0}\"; valid commands are plan, apply, unlock and help")]
    UnknownCommand(String),

    #[error("unknown flag \"{0}\"")]
    UnknownFlag(String),

    #[error("flag \"{0}\" needs a value")]
    MissingValue(String),

    #[error("unexpected argument \"{0}\"; pass tool arguments after --")]
    UnexpectedArgument(String),

    #[error("cannot use {first} together with {second}")]
    ConflictingFlags { first: String, second: String },

    #[error("invalid directory \"{0}\": must be relative and stay inside the repository")]
    InvalidDir(String),

    #[error("invalid workspace \"{0}\": only letters, digits, '-', '_' and '.' are allowed")]
    InvalidWorkspace(String),

    #[error("{0} does not accept extra arguments")]
    ExtraArgsNotAllowed(String),

    #[error("unterminated quote in \"{0}\"")]
    UnterminatedQuote(String),
}

/// Errors from resolving a command target to declared projects.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("no project named \"{0}\" is declared in the repository configuration")]
    UnknownProject(String),

    #[error("no project is declared for dir \"{dir}\" and workspace \"{workspace}\"")]
    UnknownDir { dir: String, workspace: String },
}

/// Errors from the policy gate.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyError {
    #[error("repository {0} is not on the allow-list")]
    RepoNotAllowed(String),

    #[error("commands cannot be run on pull requests from forks")]
    ForkNotAllowed,

    #[error("pull request must be approved before running apply")]
    ApprovalRequired,

    #[error("pull request must be mergeable before running apply")]
    NotMergeable,
}

/// Errors from the lock store.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("{project} is locked by pull request #{by_pr}")]
    Held { project: ProjectKey, by_pr: u64 },

    #[error("{project} is locked by pull request #{owner}, only the owner can unlock it")]
    NotOwner { project: ProjectKey, owner: u64 },

    #[error("{project} is not locked")]
    NotLocked { project: ProjectKey },

    #[error("lock record {path} is corrupt: {message}")]
    Corrupt { path: PathBuf, message: String },

    #[error("lock store I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("lock store at {0} is in use by another process")]
    StoreBusy(PathBuf),

    #[error("lock store task failed: {0}")]
    TaskFailed(String),
}

impl LockError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LockError::Held { .. } | LockError::NotOwner { .. } | LockError::NotLocked { .. } => {
                ErrorKind::User
            }
            LockError::Io { .. } | LockError::TaskFailed(_) => ErrorKind::Transient,
            LockError::Corrupt { .. } | LockError::StoreBusy(_) => ErrorKind::Fatal,
        }
    }
}

/// Errors from server or repository configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Message is shown verbatim to the operator.
    #[error("{0}")]
    Invalid(String),

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// Errors from the VCS host.
#[derive(Debug, Clone, Error)]
pub enum VcsError {
    #[error("transient VCS failure: {0}")]
    Transient(String),

    #[error("VCS request failed: {0}")]
    Permanent(String),

    #[error("{operation} still failing after {attempts} attempts: {last}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        last: String,
    },
}

impl VcsError {
    pub fn is_transient(&self) -> bool {
        matches!(self, VcsError::Transient(_))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            VcsError::Transient(_) | VcsError::RetriesExhausted { .. } => ErrorKind::Transient,
            VcsError::Permanent(_) => ErrorKind::Fatal,
        }
    }
}

/// Errors returned from `Engine::handle_event`.
///
/// User errors never reach this type; the engine comments them and returns `Ok`.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("lock store: {0}")]
    Lock(#[from] LockError),

    #[error("configuration: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Vcs(#[from] VcsError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Lock(e) => e.kind(),
            EngineError::Config(_) => ErrorKind::Fatal,
            EngineError::Vcs(e) => e.kind(),
            EngineError::Other(_) => ErrorKind::Fatal,
        }
    }
}
