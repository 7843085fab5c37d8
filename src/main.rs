//! # Overseer: Long-Lived Agent Supervisor
//!
//! Runs the supervisor control loop with an in-process worker pool and a
//! stdin console.
//!
//! Usage:
//!   overseer                          # Start with ~/.overseer/config.toml
//!   overseer --config ./overseer.toml # Custom config
//!   overseer --workers 4 --verbose    # More workers, debug logging
//!   overseer --log-json               # One JSON object per log line
//!
//! Console commands:
//!   /status            Queue, workers, budget and providers
//!   /review [reason]   Queue a review task
//!   /evolve on|off     Toggle evolution mode
//!   /cancel <id>       Cancel a pending or running task
//!   anything else      Submitted as an interactive task

use anyhow::Result;
use clap::Parser;
use overseer_core::config::OverseerConfig;
use overseer_providers::{OpenAiCompatibleClient, ProviderRouter, RouterMode, resolve_endpoints};
use overseer_scheduler::{LogNotifier, Notifier, WebhookNotifier};
use overseer_supervisor::{
    LlmDuplicateJudge, LlmExecutor, RunOutcome, Supervisor, SupervisorHandle, TokioWorkerRuntime,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncBufReadExt;
use tracing_subscriber::EnvFilter;

/// Chat id used for the owner when none is configured.
const CONSOLE_CHAT_ID: i64 = 0;

#[derive(Parser)]
#[command(
    name = "overseer",
    version,
    about = "🛰️ Overseer — task queue, watchdog and provider failover for autonomous agents"
)]
struct Cli {
    /// Config file (default: ~/.overseer/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Data directory for snapshots and the journal
    #[arg(long)]
    data_dir: Option<String>,

    /// Number of workers
    #[arg(short, long)]
    workers: Option<usize>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

fn expand_path(p: &str) -> String {
    shellexpand::tilde(p).to_string()
}

fn load_config(cli: &Cli) -> Result<OverseerConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let mut config = OverseerConfig::load_from(path)?;
            config.apply_env();
            config
        }
        None => OverseerConfig::load()?,
    };
    if let Some(dir) = &cli.data_dir {
        config.data_dir = dir.clone();
    }
    if let Some(workers) = cli.workers {
        config.workers = workers.max(1);
    }
    if config.owner_chat_id.is_none() {
        tracing::info!("👤 No owner chat configured, using the console ({CONSOLE_CHAT_ID})");
        config.owner_chat_id = Some(CONSOLE_CHAT_ID);
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        "overseer=debug,overseer_supervisor=debug,overseer_scheduler=debug,overseer_providers=debug"
    } else {
        "info"
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_current_span(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .init();
    }

    let config = load_config(&cli)?;
    let data_dir = PathBuf::from(expand_path(&config.data_dir));
    std::fs::create_dir_all(&data_dir)?;

    // Providers
    let endpoints = resolve_endpoints(&config.router.order, &config.router.model_pools);
    let credentialed: Vec<&str> = endpoints
        .iter()
        .filter(|e| e.has_credentials())
        .map(|e| e.name.as_str())
        .collect();
    if credentialed.is_empty() {
        tracing::warn!("⚠️ No provider credentials found; every task will fail until keys are set");
    } else {
        tracing::info!("🔌 Providers with credentials: {}", credentialed.join(", "));
    }
    let router = Arc::new(ProviderRouter::new(
        endpoints,
        RouterMode::parse(&config.router.mode),
        config.router.cooldown_secs,
    ));

    // Collaborators
    let notifier: Arc<dyn Notifier> = match &config.notify.webhook_url {
        Some(url) if !url.trim().is_empty() => {
            tracing::info!("📡 Notifications → webhook");
            Arc::new(WebhookNotifier::new(url.trim()))
        }
        _ => Arc::new(LogNotifier::new()),
    };
    let judge = Arc::new(LlmDuplicateJudge::new(router.clone()));
    let executor = Arc::new(LlmExecutor::new(
        router.clone(),
        OpenAiCompatibleClient::new(Duration::from_secs(120), 2048),
    ));

    let (events_tx, events_rx) = tokio::sync::mpsc::channel(256);
    let runtime = Arc::new(TokioWorkerRuntime::new(config.workers, executor, events_tx));
    let (handle, commands_rx) = SupervisorHandle::channel(64);

    let supervisor = Supervisor::new(config, &data_dir, router, runtime, notifier, judge);

    tokio::spawn(console(handle));

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    match supervisor.run(events_rx, commands_rx, shutdown).await {
        RunOutcome::Shutdown => Ok(()),
        RunOutcome::Restart { reason } => {
            tracing::info!("🔁 Restarting ({reason})");
            reexec()
        }
    }
}

/// Read owner commands from stdin until EOF.
async fn console(handle: SupervisorHandle) {
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!("⚠️ Console read failed: {e}");
                break;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Err(e) = run_command(&handle, line).await {
            tracing::warn!("⚠️ {e}");
        }
    }
    tracing::debug!("Console closed");
}

async fn run_command(handle: &SupervisorHandle, line: &str) -> Result<()> {
    let (cmd, arg) = match line.split_once(char::is_whitespace) {
        Some((cmd, arg)) => (cmd, arg.trim()),
        None => (line, ""),
    };
    match cmd {
        "/status" => println!("{}", handle.status().await?.render()),
        "/review" => match handle
            .review(if arg.is_empty() { "owner_request" } else { arg })
            .await?
        {
            Some(id) => println!("🔍 Review queued: {id}"),
            None => println!("🔍 A review is already queued"),
        },
        "/evolve" => match arg {
            "on" => handle.set_evolution(true).await?,
            "off" => handle.set_evolution(false).await?,
            _ => println!("Usage: /evolve on|off"),
        },
        "/cancel" if !arg.is_empty() => {
            let ok = handle.cancel(arg).await?;
            println!("🛑 Cancel {arg}: {}", if ok { "✅" } else { "❌" });
        }
        "/cancel" => println!("Usage: /cancel <task_id>"),
        _ => {
            let id = handle.submit(line, None).await?;
            println!("📥 Queued {id}");
        }
    }
    Ok(())
}

/// Replace this process with a fresh copy of itself.
#[cfg(unix)]
fn reexec() -> Result<()> {
    use std::os::unix::process::CommandExt;
    let exe = std::env::current_exe()?;
    let err = std::process::Command::new(exe)
        .args(std::env::args_os().skip(1))
        .exec();
    Err(anyhow::anyhow!("re-exec failed: {err}"))
}

#[cfg(not(unix))]
fn reexec() -> Result<()> {
    let exe = std::env::current_exe()?;
    std::process::Command::new(exe)
        .args(std::env::args_os().skip(1))
        .spawn()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_flags() {
        Cli::command().debug_assert();

        let cli = Cli::try_parse_from(["overseer", "--log-json", "-w", "3"]).unwrap();
        assert!(cli.log_json);
        assert!(!cli.verbose);
        assert_eq!(cli.workers, Some(3));

        let cli = Cli::try_parse_from(["overseer"]).unwrap();
        assert!(!cli.log_json);
    }
}
