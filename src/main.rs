use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};

use planlock::config::{ConfigLayer, DEFAULT_DATA_DIR, LogFormat, ServerConfig};
use planlock::locking::FileLockManager;

#[derive(Parser)]
#[command(name = "planlock")]
#[command(version, about = "Pull-request driven plan/apply with per-project locks")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the webhook server
    Server(ServerArgs),
    /// Print the merged, validated configuration with secrets redacted
    Config(ServerArgs),
    /// List locks persisted in a data directory
    Locks {
        /// Data directory (default ~/.planlock)
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
}

/// Flags override `PLANLOCK_*` variables, which override the config file.
#[derive(Args, Debug, Default)]
pub struct ServerArgs {
    /// TOML config file
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// URL the VCS host links commit statuses to
    #[arg(long)]
    pub public_url: Option<String>,
    /// Allow commands on pull requests from forks
    #[arg(long)]
    pub allow_fork_prs: bool,
    /// Where locks and working copies live
    #[arg(long)]
    pub data_dir: Option<PathBuf>,
    #[arg(long)]
    pub gh_hostname: Option<String>,
    #[arg(long)]
    pub gh_user: Option<String>,
    #[arg(long)]
    pub gh_token: Option<String>,
    /// Secret used to verify webhook signatures
    #[arg(long)]
    pub gh_webhook_secret: Option<String>,
    /// debug, info, warn or error
    #[arg(long)]
    pub log_level: Option<String>,
    /// fmt or json
    #[arg(long)]
    pub log_format: Option<String>,
    #[arg(long)]
    pub port: Option<u16>,
    /// Comma-separated hostname/owner/repo globs, e.g. github.com/acme/*
    #[arg(long)]
    pub repo_allowlist: Option<String>,
    #[arg(long)]
    pub require_approval: bool,
    #[arg(long)]
    pub require_mergeable: bool,
    /// Word that starts a command comment
    #[arg(long)]
    pub comment_prefix: Option<String>,
    /// Infrastructure tool executable
    #[arg(long)]
    pub tool_binary: Option<String>,
    #[arg(long)]
    pub tool_timeout_secs: Option<u64>,
    /// Release a project's lock after a successful apply
    #[arg(long)]
    pub release_lock_on_apply: bool,
    /// Directory of <owner>/<repo>.yaml project configs
    #[arg(long)]
    pub repo_config_dir: Option<PathBuf>,
    #[arg(long)]
    pub max_comment_chars: Option<usize>,
}

impl ServerArgs {
    fn layer(&self) -> ConfigLayer {
        ConfigLayer {
            public_url: self.public_url.clone(),
            allow_fork_prs: self.allow_fork_prs.then_some(true),
            data_dir: self.data_dir.clone(),
            gh_hostname: self.gh_hostname.clone(),
            gh_user: self.gh_user.clone(),
            gh_token: self.gh_token.clone(),
            gh_webhook_secret: self.gh_webhook_secret.clone(),
            log_level: self.log_level.clone(),
            log_format: self.log_format.clone(),
            port: self.port,
            repo_allowlist: self.repo_allowlist.clone(),
            require_approval: self.require_approval.then_some(true),
            require_mergeable: self.require_mergeable.then_some(true),
            comment_prefix: self.comment_prefix.clone(),
            tool_binary: self.tool_binary.clone(),
            tool_timeout_secs: self.tool_timeout_secs,
            release_lock_on_apply: self.release_lock_on_apply.then_some(true),
            repo_config_dir: self.repo_config_dir.clone(),
            max_comment_chars: self.max_comment_chars,
        }
    }

    fn resolve(&self) -> Result<ServerConfig> {
        let env = ConfigLayer::from_env(|name| std::env::var(name).ok())?;
        let file = match &self.config {
            Some(path) => ConfigLayer::from_file(path)?,
            None => ConfigLayer::default(),
        };
        let cwd = std::env::current_dir().context("Failed to read current directory")?;
        let config = ServerConfig::resolve(
            self.layer().or(env).or(file),
            dirs::home_dir().as_deref(),
            &cwd,
        )?;
        Ok(config)
    }
}

fn init_tracing(config: &ServerConfig) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("planlock={}", config.log_level)));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match config.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Fmt => builder.init(),
    }
}

fn default_data_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Failed to find home directory; pass --data-dir")?;
    Ok(home.join(DEFAULT_DATA_DIR.trim_start_matches("~/")))
}

fn print_locks(data_dir: &Path, json: bool) -> Result<()> {
    let locks = FileLockManager::snapshot(data_dir)
        .with_context(|| format!("Failed to read locks under {}", data_dir.display()))?;
    if json {
        println!("{}", serde_json::to_string_pretty(&locks)?);
        return Ok(());
    }
    if locks.is_empty() {
        println!("No locks held.");
        return Ok(());
    }
    println!(
        "{:<30} {:<30} {:<15} {:>6}  LOCKED AT",
        "REPO", "DIR", "WORKSPACE", "PR"
    );
    for lock in locks {
        println!(
            "{:<30} {:<30} {:<15} {:>6}  {}",
            lock.project.repo,
            lock.project.dir,
            lock.project.workspace,
            lock.owner_pr,
            lock.locked_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Server(args) => {
            let config = args.resolve()?;
            init_tracing(&config);
            planlock::server::start_server(config).await?;
        }
        Commands::Config(args) => {
            let config = args.resolve()?;
            print!("{}", toml::to_string(&config.redacted())?);
        }
        Commands::Locks { data_dir, json } => {
            let data_dir = match data_dir {
                Some(dir) => dir,
                None => default_data_dir()?,
            };
            print_locks(&data_dir, json)?;
        }
    }

    Ok(())
}
