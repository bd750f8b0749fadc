//! Pool Coordinator - command-line entry point

use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pool_coordinator::{
    config::{Args, Command},
    liveness::{HeartbeatOracle, LivenessOracle, OwnerHeartbeatPublisher, StaticOracle},
    nats::{spawn_heartbeat_listener, spawn_termination_listener, NatsClient},
    reaper::spawn_event_reaper,
    store::{sled_store::SledStoreConfig, SledStore},
    PoolCoordinator, Slot,
};

/// Buffered termination events awaiting reclamation
const TERMINATION_QUEUE: usize = 256;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    let log_level = args.log_level.clone();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("pool_coordinator={},info", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    // Needs no store, and must not take the store lock
    if let Command::Heartbeat {
        owner,
        interval_secs,
        host,
    } = args.command.clone()
    {
        let nats = NatsClient::new(&args.nats, "pool-owner-heartbeat").await?;
        let mut publisher = OwnerHeartbeatPublisher::new(owner, nats)
            .with_interval(Duration::from_secs(interval_secs.max(1)));
        if let Some(host) = host {
            publisher = publisher.with_host(host);
        }
        let task = publisher.start();

        tokio::signal::ctrl_c().await.ok();
        info!(owner = %publisher.owner(), "Received shutdown signal");
        publisher.stop();
        if let Err(e) = task.await {
            warn!("Heartbeat publisher ended abnormally: {}", e);
        }
        return Ok(());
    }

    let config = args.coordinator_config()?;
    let store = Arc::new(SledStore::open(SledStoreConfig {
        db_path: args.store_path.clone(),
        ..Default::default()
    })?);

    match args.command.clone() {
        Command::Usage { json } => {
            let coordinator = PoolCoordinator::new(store.clone(), Arc::new(StaticOracle::new()), config)?;
            let mut rows = Vec::new();
            for pool in coordinator.pools() {
                rows.push((pool.id.clone(), coordinator.pool_usage(&pool.id).await?));
            }
            if json {
                let mut map = serde_json::Map::new();
                for (id, usage) in rows {
                    map.insert(id, serde_json::to_value(usage)?);
                }
                println!("{}", serde_json::to_string_pretty(&map)?);
            } else {
                println!("{:<24} {:>10} {:>10}", "POOL", "CURRENT", "CAPACITY");
                for (id, usage) in rows {
                    println!("{:<24} {:>10} {:>10}", id, usage.current, usage.capacity.to_string());
                }
            }
        }

        Command::Allocate { owner, pools } => {
            let coordinator = PoolCoordinator::new(store.clone(), Arc::new(StaticOracle::new()), config)?;
            let candidates = if pools.is_empty() {
                coordinator.pools().iter().map(|p| p.id.clone()).collect()
            } else {
                pools
            };
            let slot = coordinator.allocate(&candidates, &owner).await?;
            println!("{}", serde_json::to_string(&slot)?);
        }

        Command::Release { pool, slot, owner } => {
            let coordinator = PoolCoordinator::new(store.clone(), Arc::new(StaticOracle::new()), config)?;
            let slot = Slot {
                pool_id: pool,
                name: slot,
                owner,
            };
            if coordinator.release(&slot).await? {
                println!("released {}", slot);
            } else {
                println!("{} was not held", slot);
            }
        }

        Command::Reap { live } => {
            info!(live = live.len(), "Reaping against explicit live set");
            let oracle = Arc::new(StaticOracle::with_tokens(live));
            let coordinator = PoolCoordinator::new(store.clone(), oracle, config)?;
            let report = coordinator.reap_once().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }

        Command::Run => {
            info!("======================================");
            info!("  Pool Coordinator - reaper daemon");
            info!("======================================");
            info!("Store: {} (locked while running)", args.store_path.display());
            info!("  other subcommands cannot open this store until shutdown");
            for pool in &config.pools {
                info!("  pool {}: capacity {}, prefix {}", pool.id, pool.capacity, pool.name_prefix);
            }
            info!("NATS: {}", args.nats.nats_url);
            info!("Reap interval: {}s (jitter {}s)", args.reap_interval_secs, args.reap_jitter_secs);
            info!("Heartbeat stale after: {}s", args.heartbeat_stale_secs);
            info!("======================================");

            let nats = match NatsClient::new(&args.nats, "pool-coordinator").await {
                Ok(client) => client,
                Err(e) => {
                    error!("NATS connection failed: {}", e);
                    std::process::exit(1);
                }
            };

            let oracle = Arc::new(HeartbeatOracle::new(args.heartbeat_stale_threshold()));
            let coordinator = PoolCoordinator::new(
                store.clone(),
                Arc::clone(&oracle) as Arc<dyn LivenessOracle>,
                config,
            )?;

            let heartbeats = spawn_heartbeat_listener(&nats, Arc::clone(&oracle)).await?;
            let (events_tx, events_rx) = mpsc::channel(TERMINATION_QUEUE);
            let terminations =
                spawn_termination_listener(&nats, Some(Arc::clone(&oracle)), events_tx).await?;
            let event_reaper = spawn_event_reaper(coordinator.reaper(), events_rx);

            let pruner = {
                let oracle = Arc::clone(&oracle);
                let period = args.heartbeat_stale_threshold().max(Duration::from_secs(1));
                tokio::spawn(async move {
                    let mut interval = tokio::time::interval(period);
                    loop {
                        interval.tick().await;
                        let pruned = oracle.prune();
                        if pruned > 0 {
                            info!(pruned, "Pruned silent owners from heartbeat table");
                        }
                    }
                })
            };

            let reaper = coordinator.start_reaper_with(args.reaper_config());

            tokio::signal::ctrl_c().await.ok();
            info!("Received shutdown signal");

            reaper.stop().await;
            heartbeats.abort();
            terminations.abort();
            pruner.abort();
            if let Err(e) = event_reaper.await {
                warn!("Event reaper ended abnormally: {}", e);
            }
            info!("Pool coordinator shut down");
        }

        // Handled before the store is opened
        Command::Heartbeat { .. } => {}
    }

    store.flush().await?;
    Ok(())
}
