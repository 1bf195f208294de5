use std::net::IpAddr;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use clap::Parser;
use colored::*;
use tracing::{debug, info};

use flowguard::cli::{Cli, CommandResult, Commands, Switch};
use flowguard::config::EngineConfig;
use flowguard::control::{ControlClient, StatsReply};
use flowguard::stats::aggregator::StatsAggregator;
use flowguard::sync::snapshot::{PolicySnapshot, SnapshotSlot};
use flowguard::sync::store::{ConfigStore, ConfigTransport, JsonFileTransport};
use flowguard::utils::logging::{self, LogLevel};
use flowguard::{daemon, Decision, PolicyEngine};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", "error:".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> CommandResult<()> {
    let config = EngineConfig::load(cli.config.as_deref())?;

    let level = if cli.quiet {
        LogLevel::Error
    } else if cli.verbose {
        config.log_level().more_verbose()
    } else {
        config.log_level()
    };
    let is_daemon = matches!(cli.command, Commands::Run);
    let log_file = if is_daemon { config.log_file.as_deref() } else { None };
    logging::init_logging(level, log_file, true, is_daemon)?;

    match cli.command {
        Commands::Run => {
            info!("flowguard {} starting", env!("CARGO_PKG_VERSION"));
            daemon::run(config).await?;
        }
        Commands::Reload => {
            let reply = ControlClient::new(config.control_addr)?.reload().await?;
            if reply.published {
                println!("Published configuration v{}", reply.version);
            } else {
                println!("Configuration v{} already live", reply.version);
            }
        }
        Commands::Snapshot { offline } => {
            let summary = if offline {
                let bundle = JsonFileTransport::new(&config.store_path).read_bundle().await?;
                PolicySnapshot::from_bundle(&bundle).summary()
            } else {
                ControlClient::new(config.control_addr)?.snapshot().await?
            };
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Stats { offline } => {
            let reply = if offline {
                let stats = StatsAggregator::load(&config.stats_path, config.top_domains_capacity).await?;
                StatsReply::from_aggregator(&stats)
            } else {
                ControlClient::new(config.control_addr)?.stats().await?
            };
            println!("{}", serde_json::to_string_pretty(&reply)?);
        }
        Commands::Replay { hex: encoded, file, client } => {
            let payload = match (encoded, file) {
                (_, Some(path)) => tokio::fs::read(path).await?,
                (Some(text), None) => hex::decode(text.trim().replace([' ', ':'], ""))?,
                (None, None) => Vec::new(),
            };
            replay(&config.store_path, &payload, client).await?;
        }
        Commands::Block { domain, category } => {
            let entry = store(&config).add_blocked_domain(&domain, category).await?;
            println!("Blocked {} ({})", entry.domain, entry.category);
            notify_daemon(&config).await;
        }
        Commands::Unblock { domain } => {
            store(&config).remove_blocked_domain(&domain).await?;
            println!("Unblocked {}", domain);
            notify_daemon(&config).await;
        }
        Commands::BlockCategory { category } => {
            let added = store(&config).block_category(category).await?;
            println!("{}: {} domains added", category, added);
            notify_daemon(&config).await;
        }
        Commands::UnblockCategory { category } => {
            let removed = store(&config).unblock_category(category).await?;
            println!("{}: {} domains removed", category, removed);
            notify_daemon(&config).await;
        }
        Commands::Protection { state } => {
            let enabled = state == Switch::On;
            store(&config).set_protection_enabled(enabled).await?;
            println!("Protection {}", if enabled { "on".green() } else { "off".yellow() });
            notify_daemon(&config).await;
        }
    }

    Ok(())
}

fn store(config: &EngineConfig) -> ConfigStore {
    ConfigStore::new(Arc::new(JsonFileTransport::new(&config.store_path)))
}

/// Best effort; a daemon that is not running picks the change up on its next poll
async fn notify_daemon(config: &EngineConfig) {
    let reply = match ControlClient::new(config.control_addr) {
        Ok(client) => client.reload().await,
        Err(e) => Err(e),
    };
    match reply {
        Ok(reply) => debug!("Daemon now on v{}", reply.version),
        Err(e) => debug!("Daemon not notified: {}", e),
    }
}

async fn replay(store_path: &Path, payload: &[u8], client: Option<IpAddr>) -> CommandResult<()> {
    let bundle = JsonFileTransport::new(store_path).read_bundle().await?;
    let snapshot = PolicySnapshot::from_bundle(&bundle);
    let engine = PolicyEngine::new(Arc::new(SnapshotSlot::with_snapshot(snapshot)));

    let outcome = engine.decide_packet(payload, client);
    println!("payload:  {} bytes", payload.len());
    match &outcome.name {
        Some(name) => println!("name:     {}", name.cyan()),
        None => println!("name:     {}", "<none extracted>".dimmed()),
    }
    if let Some(id) = outcome.device_id {
        println!("device:   {}", id);
    }
    if let Some(rule) = &outcome.matched_rule {
        println!("rule:     {}", rule);
    }
    let decision = match outcome.decision {
        Decision::Allowed => outcome.decision.to_string().green(),
        Decision::Blocked(_) => outcome.decision.to_string().red().bold(),
    };
    println!("decision: {} (snapshot v{})", decision, outcome.snapshot_version);
    Ok(())
}
