//! termpilotd: load an agent roster, spawn every agent, and stream
//! orchestrator events to stdout as JSON lines until interrupted.

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde::Deserialize;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use termpilot_core::sanitize::OutputBatcher;
use termpilot_core::{AgentConfig, Orchestrator, OrchestratorEvent};

#[derive(Parser, Debug)]
#[command(name = "termpilotd", about = "Terminal AI agent orchestration daemon")]
struct Args {
    /// Agent roster file.
    #[arg(short, long, default_value = "agents.yaml")]
    config: PathBuf,

    /// Also print this agent's coalesced terminal output to stdout.
    #[arg(long)]
    tail: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RosterConfig {
    agents: Vec<AgentConfig>,
}

/// RUST_LOG wins, then TERMPILOT_LOG_LEVEL, then info.
fn log_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = std::env::var("TERMPILOT_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        EnvFilter::new(level)
    })
}

fn load_roster(path: &PathBuf) -> anyhow::Result<RosterConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading roster {}", path.display()))?;
    let roster: RosterConfig =
        serde_yaml::from_str(&text).with_context(|| format!("parsing roster {}", path.display()))?;
    Ok(roster)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(log_filter())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let roster = load_roster(&args.config)?;
    info!(config = %args.config.display(), agents = roster.agents.len(), "roster loaded");

    let orchestrator = Orchestrator::new();
    let mut events = orchestrator.subscribe();

    for config in roster.agents {
        let id = config.id.clone();
        if let Err(e) = orchestrator.spawn_agent(config).await {
            error!(agent_id = %id, error = %e, "failed to spawn agent");
        }
    }

    // Coalesce the tailed agent's raw output into readable batches
    // instead of printing every PTY chunk on its own line.
    let tail_agent = args.tail.clone();
    let tail_batcher = tail_agent.as_ref().map(|_| {
        let (batcher, mut rx) = OutputBatcher::new(Duration::from_millis(50), 32 * 1024);
        tokio::spawn(async move {
            while let Some(batch) = rx.recv().await {
                let text = termpilot_core::sanitize::sanitize(&batch);
                let mut stdout = std::io::stdout().lock();
                let _ = stdout.write_all(text.as_bytes());
                let _ = stdout.flush();
            }
        });
        batcher
    });

    let event_loop = async {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let (Some(batcher), OrchestratorEvent::AgentOutput { agent_id, data, .. }) =
                        (tail_batcher.as_ref(), &event)
                    {
                        if Some(agent_id) == tail_agent.as_ref() {
                            batcher.push(data.as_bytes());
                            continue;
                        }
                    }
                    match serde_json::to_string(&event) {
                        Ok(line) => println!("{line}"),
                        Err(e) => warn!(error = %e, "event serialization failed"),
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "event stream lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    };

    tokio::select! {
        _ = event_loop => {}
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
        }
    }

    orchestrator.shutdown().await;
    Ok(())
}
