//! chain-mirror - block listener for the Hive to MongoDB mirror

use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use chain_mirror::{
    config::{CursorCommand, ListenerCli, ListenerCommand},
    handlers::MirrorContext,
    listener::{BlockCursor, BlockListener},
    logging,
    repair::RepairPass,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let cli = ListenerCli::parse();
    logging::init(&cli.log);

    if let Err(e) = cli.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    let command = cli.command();
    let settings = cli.listener.handler_settings();

    info!("======================================");
    info!("  chain-mirror block listener");
    info!("======================================");
    info!("Command: {:?}", command);
    info!(
        "MongoDB: {} ({}, {})",
        cli.store.mongodb_uri, cli.store.mongodb_db, cli.store.mongodb_images_db
    );
    info!("Ledger nodes: {}", cli.rpc.node_list().join(", "));
    info!("Batch size: {}, tip lead: {}", cli.listener.batch_size, cli.listener.tip_lead);
    info!(
        "Image community: {}",
        settings.image_community.as_deref().unwrap_or("disabled")
    );
    info!(
        "Tag commands: {}",
        settings.tag_command_account.as_deref().unwrap_or("disabled")
    );
    info!("======================================");

    let store = match cli.store.open().await {
        Ok(store) => store,
        Err(_) => std::process::exit(1),
    };

    if let ListenerCommand::Cursor { action } = &command {
        let cursor = BlockCursor::new(store);
        match action {
            CursorCommand::Show => match cursor.load().await? {
                Some(num) => info!("Block cursor at {}", num),
                None => info!("Block cursor is not set"),
            },
            CursorCommand::Set { block } => cursor.set(*block).await?,
            CursorCommand::Rewind { blocks } => {
                cursor.rewind(*blocks).await?;
            }
        }
        return Ok(());
    }

    let ledger = match cli.rpc.ledger() {
        Ok(ledger) => Arc::new(ledger),
        Err(e) => {
            error!("Ledger client failed to start: {}", e);
            std::process::exit(1);
        }
    };
    let ctx = MirrorContext::new(store, ledger, settings);
    let repair = RepairPass::new(ctx.clone()).with_batch_size(cli.listener.repair_batch_size);

    if command == ListenerCommand::Repair {
        for (db, report) in repair.run().await? {
            info!(db = ?db, ?report, "Repair finished");
        }
        return Ok(());
    }

    // Heal interrupted writes from the previous run before following the chain
    if let Err(e) = repair.run().await {
        error!("Startup repair pass failed: {}", e);
    }

    let mut listener = match BlockListener::start(ctx, cli.listener.listener_config()).await {
        Ok(listener) => listener.with_repair(repair),
        Err(e) => {
            error!("Block listener failed to start: {}", e);
            std::process::exit(1);
        }
    };

    tokio::select! {
        result = listener.run() => {
            if let Err(e) = result {
                error!("Block listener stopped: {}", e);
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    Ok(())
}
