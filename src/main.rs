//! Presence Sync demo
//!
//! Runs one Authority and a handful of Replicas over an in-memory bus,
//! walks them through a co-browsing script, and reports whether every
//! Replica converged.
//!
//! ## Usage
//!
//! ```bash
//! # Two replicas, quiet
//! presence-sync
//!
//! # Drop every third delta and watch recovery at debug level
//! presence-sync -vv --replicas 3 --drop-every 3
//!
//! # Per-participant JSONL logs
//! presence-sync -v --log-dir ./logs
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use presence_sync_core::logging::{read_entries, LoggingBuilder};
use presence_sync_core::{
    DetailAction, JsonMap, LocalAction, MemoryNetwork, Role, SessionConfig, SessionId,
    SnapshotReason, SyncConfig, SyncSession,
};
use serde_json::json;

/// Presence Sync - Authority/Replica co-browsing demo
#[derive(Parser, Debug)]
#[command(name = "presence-sync")]
#[command(version = "0.1.0")]
#[command(about = "Run an Authority and Replicas over an in-memory bus")]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Number of replicas
    #[arg(short, long, default_value_t = 2)]
    replicas: usize,

    /// Drop every Nth DELTA frame on the bus (0 = lossless)
    #[arg(long, default_value_t = 0)]
    drop_every: u64,

    /// Pause between scripted steps, in milliseconds
    #[arg(long, default_value_t = 150)]
    step_ms: u64,

    /// Session id (random if omitted)
    #[arg(long)]
    session: Option<String>,

    /// JSON file with protocol tunables
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Write per-participant JSONL logs here
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

/// The walkthrough an agent gives a customer
fn script() -> Vec<(&'static str, LocalAction)> {
    let object = |value: serde_json::Value| value.as_object().cloned().unwrap_or_default();
    vec![
        (
            "open catalog",
            LocalAction::Navigate {
                view: "catalog".into(),
                params: object(json!({"category": "fiber"})),
            },
        ),
        (
            "share packages",
            LocalAction::SharePackages(vec!["A1".into(), "B2".into(), "C3".into()]),
        ),
        ("compare A1", LocalAction::ToggleCompare("A1".into())),
        ("compare B2", LocalAction::ToggleCompare("B2".into())),
        (
            "open compare view",
            LocalAction::Navigate {
                view: "compare".into(),
                params: JsonMap::new(),
            },
        ),
        (
            "open A1 details",
            LocalAction::Detail(DetailAction::OpenPackage {
                package_id: "A1".into(),
            }),
        ),
        (
            "switch to pricing tab",
            LocalAction::Detail(DetailAction::from_name(
                "tab-change",
                object(json!({"tab": "pricing"})),
            )),
        ),
        ("agent selects A1", LocalAction::Select("A1".into())),
        (
            "go to payment",
            LocalAction::Navigate {
                view: "payment".into(),
                params: JsonMap::new(),
            },
        ),
        ("billing step", LocalAction::PaymentStep("billing".into())),
        ("review step", LocalAction::PaymentStep("review".into())),
    ]
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut logging = LoggingBuilder::new().with_verbosity(cli.verbose);
    if let Some(dir) = &cli.log_dir {
        logging = logging.with_logs_dir(dir);
    }
    logging.init().context("Failed to initialize logging")?;

    let sync = match &cli.config {
        Some(path) => SyncConfig::from_json_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => SyncConfig::default(),
    };
    let session_id = cli
        .session
        .clone()
        .map(SessionId)
        .unwrap_or_else(SessionId::generate);

    let network = MemoryNetwork::new();
    if cli.drop_every > 0 {
        let every = cli.drop_every;
        let deltas = AtomicU64::new(0);
        network.set_drop_filter(move |frame| {
            frame.data.contains("\"op\":\"DELTA\"")
                && (deltas.fetch_add(1, Ordering::SeqCst) + 1) % every == 0
        });
    }

    let authority = SyncSession::start(
        SessionConfig::new(Role::Authority, "agent", session_id.clone()).with_sync(sync.clone()),
        Arc::new(network.join("agent")),
    )?;

    let mut replicas = Vec::with_capacity(cli.replicas);
    for i in 1..=cli.replicas {
        let id = format!("customer-{}", i);
        let replica = SyncSession::start(
            SessionConfig::new(Role::Replica, id.as_str(), session_id.clone())
                .with_sync(sync.clone()),
            Arc::new(network.join(id.as_str())),
        )?;
        replicas.push((id, replica));
    }

    println!("Session {} with {} replica(s)", session_id, cli.replicas);
    tokio::time::sleep(sync.bootstrap_delay() + Duration::from_millis(100)).await;

    for (step, (label, action)) in script().into_iter().enumerate() {
        let seq = authority.apply_local_action(action)?;
        authority.update_cursor(0.1 * step as f64, 0.5)?;
        println!("  [{:>2}] {:<24} seq={}", step + 1, label, seq);
        tokio::time::sleep(Duration::from_millis(cli.step_ms)).await;
    }

    // One customer scrolls; the agent follows along.
    if let Some((_, first)) = replicas.first() {
        for y in [0.1, 0.2, 0.35, 0.5] {
            first.update_scroll("package-list", y, 0.0)?;
        }
    }

    // Anything still lost gets one last baseline.
    authority.send_snapshot(SnapshotReason::Manual)?;
    tokio::time::sleep(sync.ack_timeout() * 2).await;

    let reference = authority.state();
    println!();
    println!(
        "Authority   seq={:<3} view={:<10} pending_acks={:?}",
        reference.seq,
        reference.view.as_str(),
        authority.pending_acks()
    );

    let mut converged = true;
    for (id, replica) in &replicas {
        let state = replica.state();
        let matches = state.seq == reference.seq
            && state.view == reference.view
            && state.shared_packages == reference.shared_packages
            && state.selection == reference.selection
            && state.metadata == reference.metadata;
        converged &= matches;
        let stats = replica.stats();
        println!(
            "{:<11} seq={:<3} view={:<10} applied={} gaps={} snapshots={} {}",
            id,
            state.seq,
            state.view.as_str(),
            stats.deltas_applied,
            stats.gaps_detected,
            stats.snapshots_applied,
            if matches { "✓" } else { "✗ diverged" }
        );
    }

    let stats = authority.stats();
    println!(
        "\nDeltas sent={} acks={} retransmitted={} lost={}",
        stats.deltas_sent, stats.acks_received, stats.retransmissions, stats.deltas_lost
    );
    if let Some(scroll) = reference.scroll_positions.get("package-list") {
        println!("Agent sees package-list scrolled to {:.0}%", scroll.percent_y * 100.0);
    }

    authority.shutdown();
    for (_, replica) in &replicas {
        replica.shutdown();
    }

    if let Some(dir) = &cli.log_dir {
        let entries = read_entries(dir)?;
        println!("{} log entries written to {}", entries.len(), dir.display());
    }

    if converged {
        println!("All replicas converged");
        Ok(())
    } else {
        anyhow::bail!("Replicas diverged from the authority")
    }
}
