//! warden: watch labeled issues and pull requests, implement and review them
//! with a coding agent running in isolated git worktrees.

use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::info;

use warden::clear::{ClearOutcome, ClearTarget, clear_items};
use warden::coordinator::Coordinator;
use warden::core::types::{ItemKey, WorkItemKind};
use warden::exit_codes;
use warden::io::agent::ClaudeInvoker;
use warden::io::config::{DEFAULT_CONFIG_FILE, WardenConfig, load_config, render_config, resolve_token};
use warden::io::github::GithubClient;
use warden::io::isolation::IsolationManager;
use warden::io::store::WorkItemStore;
use warden::logging;
use warden::orphans::{list_worktrees, prune_orphans, render_listings};
use warden::status::{load_report, render_report};
use warden::workflow::WorkflowEnd;

#[derive(Parser)]
#[command(
    name = "warden",
    version,
    about = "Turn labeled GitHub issues into pull requests and review labeled PRs"
)]
struct Cli {
    /// Config file.
    #[arg(long, global = true, env = "WARDEN_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Debug-level logging (overridden by RUST_LOG).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Poll for labeled work until interrupted.
    Run {
        /// Run a single poll cycle, wait for launched work, and exit.
        #[arg(long)]
        once: bool,
    },
    /// Show recorded work items grouped by status.
    Status,
    /// Forget recorded work items so they are picked up again.
    Clear {
        /// issue (or feature), review (or pr).
        kind: Option<String>,
        number: Option<u64>,
        /// Clear every record.
        #[arg(long, conflicts_with_all = ["kind", "number"])]
        all: bool,
        /// Skip the confirmation prompt for --all.
        #[arg(short, long)]
        yes: bool,
    },
    /// Print the effective configuration.
    Config,
    /// List isolations and flag the ones no record owns.
    Worktrees {
        /// Remove orphaned isolations.
        #[arg(long)]
        prune: bool,
    },
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    let code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::ERROR
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("start async runtime")?;
    runtime.block_on(dispatch(cli))
}

async fn dispatch(cli: Cli) -> Result<i32> {
    let cfg = load_config(&cli.config).with_context(|| format!("load {}", cli.config.display()))?;
    match cli.command {
        Command::Run { once } => cmd_run(&cfg, once).await,
        Command::Status => cmd_status(&cfg),
        Command::Clear {
            kind,
            number,
            all,
            yes,
        } => cmd_clear(&cfg, kind.as_deref(), number, all, yes),
        Command::Config => cmd_config(&cfg, &cli.config),
        Command::Worktrees { prune } => cmd_worktrees(&cfg, prune).await,
    }
}

async fn cmd_run(cfg: &WardenConfig, once: bool) -> Result<i32> {
    let token = resolve_token()?;
    let host = GithubClient::new(&cfg.github.api_url, &cfg.github.repo, &token)
        .context("create GitHub client")?;
    let agent = ClaudeInvoker::new(cfg.agent.clone());
    let coordinator = Coordinator::bootstrap(cfg, Arc::new(host), Arc::new(agent)).await?;

    if once {
        let finished = coordinator.run_once().await?;
        if finished.is_empty() {
            println!("No work dispatched.");
        }
        for (key, end) in &finished {
            println!("{}", describe_end(*key, end));
        }
        return Ok(exit_codes::OK);
    }

    let handle = coordinator.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, stopping");
            handle.stop();
        }
    });
    coordinator.start().await?;
    Ok(exit_codes::OK)
}

fn describe_end(key: ItemKey, end: &WorkflowEnd) -> String {
    match end {
        WorkflowEnd::Completed {
            related_number: Some(pr),
        } => format!("{key}: completed (PR #{pr})"),
        WorkflowEnd::Completed { related_number: None } => format!("{key}: completed"),
        WorkflowEnd::Failed {
            message,
            preserved: Some(path),
        } => format!("{key}: failed: {message} (kept {})", path.display()),
        WorkflowEnd::Failed {
            message,
            preserved: None,
        } => format!("{key}: failed: {message}"),
    }
}

fn cmd_status(cfg: &WardenConfig) -> Result<i32> {
    let store = WorkItemStore::open(cfg.state_file_path());
    let report = load_report(&store)?;
    print!("{}", render_report(&report));
    Ok(exit_codes::OK)
}

fn cmd_clear(
    cfg: &WardenConfig,
    kind: Option<&str>,
    number: Option<u64>,
    all: bool,
    yes: bool,
) -> Result<i32> {
    let target = match (all, kind, number) {
        (true, _, _) => ClearTarget::All,
        (false, Some(kind), Some(number)) => {
            ClearTarget::One(ItemKey::new(kind.parse::<WorkItemKind>()?, number))
        }
        _ => bail!("specify <kind> <number> or --all"),
    };
    let store = WorkItemStore::open(cfg.state_file_path());
    let outcome = clear_items(&store, target, |count| {
        if yes {
            return Ok(true);
        }
        confirm(&format!("Clear all {count} work item records?"))
    })?;
    match outcome {
        ClearOutcome::Removed(0) => {
            println!("Nothing to clear.");
            Ok(exit_codes::NOTHING_DONE)
        }
        ClearOutcome::Removed(count) => {
            println!("Cleared {count} record(s).");
            Ok(exit_codes::OK)
        }
        ClearOutcome::NotFound => {
            println!("No record for that work item.");
            Ok(exit_codes::NOTHING_DONE)
        }
        ClearOutcome::Cancelled => {
            println!("Cancelled.");
            Ok(exit_codes::NOTHING_DONE)
        }
    }
}

fn confirm(question: &str) -> Result<bool> {
    eprint!("{question} [y/N] ");
    std::io::stderr().flush().context("flush prompt")?;
    let mut answer = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut answer)
        .context("read confirmation")?;
    Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}

fn cmd_config(cfg: &WardenConfig, path: &Path) -> Result<i32> {
    let source = if path.exists() {
        path.display().to_string()
    } else {
        "defaults".to_string()
    };
    println!("# effective configuration (from {source}; token not shown)");
    print!("{}", render_config(cfg)?);
    Ok(exit_codes::OK)
}

async fn cmd_worktrees(cfg: &WardenConfig, prune: bool) -> Result<i32> {
    let manager = IsolationManager::new(&cfg.repo_path, cfg.worktree_base_path());
    let store = WorkItemStore::open(cfg.state_file_path());
    let listings = list_worktrees(&manager, &store).await?;
    print!("{}", render_listings(&listings));
    if prune {
        let removed = prune_orphans(&manager, &listings).await;
        println!("Removed {} orphaned isolation(s).", removed.len());
    }
    Ok(exit_codes::OK)
}
