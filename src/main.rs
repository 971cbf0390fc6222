use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use agent_dispatch::Dispatcher;
use agent_dispatch::agents::{AgentRegistry, DefaultAgent, SalesAgent};
use agent_dispatch::config::DispatchConfig;
use agent_dispatch::pipeline::{Envelope, RoutingTable};
use agent_dispatch::store::{ExecutionStore, LibSqlBackend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = Arc::new(DispatchConfig::from_env().context("invalid configuration")?);

    eprintln!("agent-dispatch v{}", env!("CARGO_PKG_VERSION"));

    // ── Routing table ───────────────────────────────────────────────────
    let table = match &config.rules_path {
        Some(path) => {
            eprintln!("   Rules: {}", path.display());
            RoutingTable::from_file(path)
                .with_context(|| format!("failed to load routing rules from {}", path.display()))?
        }
        None => {
            eprintln!("   Rules: built-in");
            RoutingTable::builtin()
        }
    };

    // ── Agents ──────────────────────────────────────────────────────────
    let registry = AgentRegistry::builder()
        .register(Arc::new(DefaultAgent::new()))
        .register(Arc::new(SalesAgent::new()))
        .default_agent(config.default_agent.clone())
        .build()
        .context("failed to build agent registry")?;
    eprintln!("   Agents: {}", registry.names().join(", "));

    // ── Database ────────────────────────────────────────────────────────
    let store: Arc<dyn ExecutionStore> = if config.db_path.as_os_str() == ":memory:" {
        eprintln!("   Database: in-memory");
        Arc::new(LibSqlBackend::new_memory().await?)
    } else {
        eprintln!("   Database: {}", config.db_path.display());
        Arc::new(
            LibSqlBackend::new_local(&config.db_path)
                .await
                .with_context(|| format!("failed to open database at {}", config.db_path.display()))?,
        )
    };

    let dispatcher = Dispatcher::new(Arc::clone(&config), table, registry, store)?;
    eprintln!("   Reading envelopes from stdin (one JSON object per line)\n");

    // ── NDJSON loop ─────────────────────────────────────────────────────
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let mut pending: Vec<Envelope> = Vec::with_capacity(config.max_concurrent);
    let mut line_no = 0usize;

    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Envelope>(&line) {
            Ok(envelope) => pending.push(envelope),
            Err(e) => {
                tracing::warn!(line = line_no, error = %e, "Skipping malformed envelope");
                continue;
            }
        }
        if pending.len() >= config.max_concurrent {
            flush(&dispatcher, &mut pending, &mut stdout).await?;
        }
    }
    flush(&dispatcher, &mut pending, &mut stdout).await?;

    Ok(())
}

/// Submit buffered envelopes and write one outcome per line.
async fn flush(
    dispatcher: &Dispatcher,
    pending: &mut Vec<Envelope>,
    stdout: &mut tokio::io::Stdout,
) -> anyhow::Result<()> {
    if pending.is_empty() {
        return Ok(());
    }
    let outcomes = dispatcher.submit_batch(std::mem::take(pending)).await;
    for outcome in outcomes {
        let mut line = serde_json::to_vec(&outcome)?;
        line.push(b'\n');
        stdout.write_all(&line).await?;
    }
    stdout.flush().await?;
    Ok(())
}
