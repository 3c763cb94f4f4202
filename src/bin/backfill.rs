//! chain-mirror-backfill - vote history backfill pool
//!
//! Watches `account_data` for accounts flagged `analyze: true` and replays
//! their recent votes into the mirror.
//!
//! Environment variables:
//!   ANALYZER_WORKERS - worker tasks (default: 4, clamped to CPU count)
//!   POLL_INTERVAL_MS - scan interval for flagged accounts (default: 250)
//!   HORIZON_DAYS - how far back votes are replayed (default: 100)
//!   PAGE_SIZE - history entries per request (default: 1000)

use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use chain_mirror::{
    backfill::BackfillMaster, config::BackfillCli, handlers::MirrorContext, logging,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    let cli = BackfillCli::parse();
    logging::init(&cli.log);

    if let Err(e) = cli.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    let config = cli.backfill.backfill_config();
    info!("======================================");
    info!("  chain-mirror backfill pool");
    info!("======================================");
    info!("MongoDB: {} ({})", cli.store.mongodb_uri, cli.store.mongodb_db);
    info!("Ledger nodes: {}", cli.rpc.node_list().join(", "));
    info!("Workers: {}", config.worker_count());
    info!("Horizon: {} days, page size {}", cli.backfill.horizon_days, config.page_size);
    info!("======================================");

    let store = match cli.store.open().await {
        Ok(store) => store,
        Err(_) => std::process::exit(1),
    };
    let ledger = match cli.rpc.ledger() {
        Ok(ledger) => Arc::new(ledger),
        Err(e) => {
            error!("Ledger client failed to start: {}", e);
            std::process::exit(1);
        }
    };

    let ctx = MirrorContext::new(store, ledger, cli.backfill.handler_settings());
    let master = BackfillMaster::new(ctx, config);

    tokio::select! {
        result = master.run() => {
            if let Err(e) = result {
                error!("Backfill master stopped: {}", e);
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    Ok(())
}
