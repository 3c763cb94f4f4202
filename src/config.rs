//! Configuration for the mirror binaries
//!
//! CLI arguments and environment variables via clap. Shared argument
//! groups are flattened into the listener and backfill commands.

use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::{error, warn};

use crate::backfill::BackfillConfig;
use crate::db::{MemoryStore, MirrorStore, MongoClient};
use crate::handlers::{HandlerSettings, COMMAND_NAMESPACE, DEFAULT_TAG_COMMAND_PHRASE};
use crate::listener::{ListenerConfig, DEFAULT_REWIND, MAX_BATCH_SIZE};
use crate::repair::REPAIR_BATCH_SIZE;
use crate::rpc::{HttpLedger, RetryPolicy};
use crate::types::Result;

/// Public ledger API nodes used when none are configured
pub const DEFAULT_HIVE_NODES: &str =
    "api.hive.blog,api.deathwing.me,hive-api.arcange.eu,hived.emre.sh,api.openhive.network";

/// MongoDB connection
#[derive(Args, Debug, Clone)]
pub struct StoreArgs {
    /// MongoDB connection URI
    #[arg(long, env = "MONGODB_URI", default_value = "mongodb://localhost:27017")]
    pub mongodb_uri: String,

    /// Database of the general mirror
    #[arg(long, env = "MONGODB_DB", default_value = "hive-discover")]
    pub mongodb_db: String,

    /// Database of the image community mirror
    #[arg(long, env = "MONGODB_IMAGES_DB", default_value = "images")]
    pub mongodb_images_db: String,

    /// Fall back to an in-memory store when MongoDB is unreachable
    #[arg(long, env = "DEV_MODE", default_value = "false")]
    pub dev_mode: bool,
}

impl StoreArgs {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.mongodb_db.trim().is_empty() || self.mongodb_images_db.trim().is_empty() {
            return Err("MONGODB_DB and MONGODB_IMAGES_DB must not be empty".to_string());
        }
        if self.mongodb_db == self.mongodb_images_db {
            return Err("MONGODB_DB and MONGODB_IMAGES_DB must differ".to_string());
        }
        Ok(())
    }

    /// Connect to MongoDB and create indexes; memory store in dev mode
    pub async fn open(&self) -> Result<Arc<dyn MirrorStore>> {
        match MongoClient::new(&self.mongodb_uri, &self.mongodb_db, &self.mongodb_images_db).await {
            Ok(client) => {
                client.ensure_indexes().await;
                Ok(Arc::new(client))
            }
            Err(e) if self.dev_mode => {
                warn!("MongoDB connection failed (dev mode, continuing in memory): {}", e);
                Ok(Arc::new(MemoryStore::new()))
            }
            Err(e) => {
                error!("MongoDB connection failed: {}", e);
                Err(e)
            }
        }
    }
}

/// Ledger RPC pool
#[derive(Args, Debug, Clone)]
pub struct RpcArgs {
    /// Comma-separated list of ledger API nodes
    #[arg(long, env = "HIVE_NODES", default_value = DEFAULT_HIVE_NODES)]
    pub hive_nodes: String,

    /// Per-request timeout in milliseconds
    #[arg(long, env = "RPC_TIMEOUT_MS", default_value = "10000")]
    pub rpc_timeout_ms: u64,

    /// Attempts per call before the error surfaces
    #[arg(long, env = "RPC_MAX_ATTEMPTS", default_value = "5")]
    pub rpc_max_attempts: u32,

    /// Fixed delay between attempts in milliseconds
    #[arg(long, env = "RPC_RETRY_DELAY_MS", default_value = "1500")]
    pub rpc_retry_delay_ms: u64,
}

impl RpcArgs {
    pub fn node_list(&self) -> Vec<String> {
        self.hive_nodes
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(
            self.rpc_max_attempts,
            Duration::from_millis(self.rpc_retry_delay_ms),
        )
    }

    pub fn ledger(&self) -> Result<HttpLedger> {
        HttpLedger::new(
            self.node_list(),
            Duration::from_millis(self.rpc_timeout_ms),
            self.retry_policy(),
        )
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.node_list().is_empty() {
            return Err("HIVE_NODES must list at least one node".to_string());
        }
        if self.rpc_max_attempts == 0 {
            return Err("RPC_MAX_ATTEMPTS must be at least 1".to_string());
        }
        if self.rpc_timeout_ms == 0 {
            return Err("RPC_TIMEOUT_MS must be positive".to_string());
        }
        Ok(())
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Logging
#[derive(Args, Debug, Clone)]
pub struct LogArgs {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value = "text")]
    pub log_format: LogFormat,
}

impl LogArgs {
    pub fn validate(&self) -> std::result::Result<(), String> {
        match self.log_level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
            other => Err(format!("LOG_LEVEL '{}' is not a log level", other)),
        }
    }
}

/// Block listener tuning and handler switches
#[derive(Args, Debug, Clone)]
pub struct ListenerArgs {
    /// Blocks fetched per batch (at most 50)
    #[arg(long, env = "BATCH_SIZE", default_value = "50")]
    pub batch_size: u64,

    /// Blocks kept between the cursor and the irreversible tip
    #[arg(long, env = "TIP_LEAD", default_value = "5")]
    pub tip_lead: u64,

    /// Sleep at the tip in milliseconds
    #[arg(long, env = "IDLE_DELAY_MS", default_value = "2000")]
    pub idle_delay_ms: u64,

    /// Identity ids checked per repair round trip
    #[arg(long, env = "REPAIR_BATCH_SIZE", default_value_t = REPAIR_BATCH_SIZE)]
    pub repair_batch_size: usize,

    /// Custom-json id carrying control commands
    #[arg(long, env = "COMMAND_NAMESPACE", default_value = COMMAND_NAMESPACE)]
    pub command_namespace: String,

    /// Account whose replies may carry tag commands
    #[arg(long, env = "TAG_COMMAND_ACCOUNT")]
    pub tag_command_account: Option<String>,

    /// First word of a tag command
    #[arg(long, env = "TAG_COMMAND_PHRASE", default_value = DEFAULT_TAG_COMMAND_PHRASE)]
    pub tag_command_phrase: String,

    /// Community whose image posts are mirrored into the image database
    #[arg(long, env = "IMAGE_COMMUNITY")]
    pub image_community: Option<String>,
}

impl ListenerArgs {
    pub fn listener_config(&self) -> ListenerConfig {
        ListenerConfig {
            batch_size: self.batch_size,
            tip_lead: self.tip_lead,
            idle_delay: Duration::from_millis(self.idle_delay_ms),
            repair_when_idle: true,
        }
    }

    pub fn handler_settings(&self) -> HandlerSettings {
        let non_empty = |v: &Option<String>| {
            v.as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        HandlerSettings {
            command_namespace: self.command_namespace.clone(),
            tag_command_account: non_empty(&self.tag_command_account),
            tag_command_phrase: self.tag_command_phrase.clone(),
            image_community: non_empty(&self.image_community),
        }
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.batch_size == 0 || self.batch_size > MAX_BATCH_SIZE {
            return Err(format!("BATCH_SIZE must be between 1 and {}", MAX_BATCH_SIZE));
        }
        if self.repair_batch_size == 0 {
            return Err("REPAIR_BATCH_SIZE must be positive".to_string());
        }
        if self.tag_command_phrase.trim().is_empty() {
            return Err("TAG_COMMAND_PHRASE must not be empty".to_string());
        }
        if self.command_namespace.trim().is_empty() {
            return Err("COMMAND_NAMESPACE must not be empty".to_string());
        }
        Ok(())
    }
}

/// Block listener for the ledger mirror
#[derive(Parser, Debug, Clone)]
#[command(name = "chain-mirror")]
#[command(about = "Mirror Hive posts, votes and accounts into MongoDB")]
#[command(version)]
pub struct ListenerCli {
    #[command(subcommand)]
    pub command: Option<ListenerCommand>,

    #[command(flatten)]
    pub store: StoreArgs,

    #[command(flatten)]
    pub rpc: RpcArgs,

    #[command(flatten)]
    pub log: LogArgs,

    #[command(flatten)]
    pub listener: ListenerArgs,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum ListenerCommand {
    /// Ingest blocks from the cursor onward (default)
    Run,
    /// Inspect or move the block cursor
    Cursor {
        #[command(subcommand)]
        action: CursorCommand,
    },
    /// Run one repair pass and exit
    Repair,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum CursorCommand {
    /// Print the current cursor
    Show,
    /// Seed or override the cursor
    Set { block: u64 },
    /// Step the cursor back by a safety buffer
    Rewind {
        #[arg(default_value_t = DEFAULT_REWIND)]
        blocks: u64,
    },
}

impl ListenerCli {
    pub fn command(&self) -> ListenerCommand {
        self.command.clone().unwrap_or(ListenerCommand::Run)
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        self.store.validate()?;
        self.log.validate()?;
        self.listener.validate()?;
        // Cursor administration never talks to the ledger
        if matches!(self.command(), ListenerCommand::Run | ListenerCommand::Repair) {
            self.rpc.validate()?;
        }
        Ok(())
    }
}

/// Backfill pool for vote histories
#[derive(Parser, Debug, Clone)]
#[command(name = "chain-mirror-backfill")]
#[command(about = "Backfill the vote history of accounts flagged for analysis")]
#[command(version)]
pub struct BackfillCli {
    #[command(flatten)]
    pub store: StoreArgs,

    #[command(flatten)]
    pub rpc: RpcArgs,

    #[command(flatten)]
    pub log: LogArgs,

    #[command(flatten)]
    pub backfill: BackfillArgs,
}

#[derive(Args, Debug, Clone)]
pub struct BackfillArgs {
    /// Worker tasks, clamped to available parallelism
    #[arg(long, env = "ANALYZER_WORKERS", default_value = "4")]
    pub analyzer_workers: usize,

    /// Interval between scans for flagged accounts in milliseconds
    #[arg(long, env = "POLL_INTERVAL_MS", default_value = "250")]
    pub poll_interval_ms: u64,

    /// How far back votes are backfilled
    #[arg(long, env = "HORIZON_DAYS", default_value = "100")]
    pub horizon_days: i64,

    /// History entries per request
    #[arg(long, env = "PAGE_SIZE", default_value = "1000")]
    pub page_size: u64,

    /// Delay before retrying a failed page in milliseconds
    #[arg(long, env = "PAGE_RETRY_DELAY_MS", default_value = "1500")]
    pub page_retry_delay_ms: u64,

    /// Image community; votes are also applied to its mirror when set
    #[arg(long, env = "IMAGE_COMMUNITY")]
    pub image_community: Option<String>,
}

impl BackfillArgs {
    pub fn backfill_config(&self) -> BackfillConfig {
        BackfillConfig {
            workers: self.analyzer_workers,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            horizon: chrono::Duration::days(self.horizon_days),
            page_size: self.page_size,
            retry_delay: Duration::from_millis(self.page_retry_delay_ms),
        }
    }

    pub fn handler_settings(&self) -> HandlerSettings {
        HandlerSettings {
            image_community: self
                .image_community
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.analyzer_workers == 0 {
            return Err("ANALYZER_WORKERS must be at least 1".to_string());
        }
        if self.poll_interval_ms == 0 {
            return Err("POLL_INTERVAL_MS must be positive".to_string());
        }
        if self.horizon_days <= 0 {
            return Err("HORIZON_DAYS must be positive".to_string());
        }
        if self.page_size == 0 || self.page_size > 1000 {
            return Err("PAGE_SIZE must be between 1 and 1000".to_string());
        }
        Ok(())
    }
}

impl BackfillCli {
    pub fn validate(&self) -> std::result::Result<(), String> {
        self.store.validate()?;
        self.rpc.validate()?;
        self.log.validate()?;
        self.backfill.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listener(args: &[&str]) -> ListenerCli {
        let mut argv = vec!["chain-mirror"];
        argv.extend_from_slice(args);
        ListenerCli::parse_from(argv)
    }

    #[test]
    fn test_listener_defaults() {
        let cli = listener(&[]);
        assert_eq!(cli.command(), ListenerCommand::Run);
        assert_eq!(cli.listener.batch_size, 50);
        assert_eq!(cli.rpc.node_list().len(), 5);
        assert!(cli.validate().is_ok());
    }

    #[test]
    fn test_cursor_subcommands() {
        let cli = listener(&["cursor", "rewind"]);
        assert_eq!(
            cli.command(),
            ListenerCommand::Cursor {
                action: CursorCommand::Rewind { blocks: 150 }
            }
        );
        let cli = listener(&["cursor", "set", "81000000"]);
        assert_eq!(
            cli.command(),
            ListenerCommand::Cursor {
                action: CursorCommand::Set { block: 81_000_000 }
            }
        );
    }

    #[test]
    fn test_batch_size_is_capped() {
        let cli = listener(&["--batch-size", "51"]);
        assert!(cli.validate().is_err());
    }

    #[test]
    fn test_blank_optional_settings_are_disabled() {
        let cli = listener(&["--image-community", " ", "--tag-command-account", "hive-discover"]);
        let settings = cli.listener.handler_settings();
        assert_eq!(settings.image_community, None);
        assert_eq!(settings.tag_command_account.as_deref(), Some("hive-discover"));
    }

    #[test]
    fn test_backfill_validation() {
        let cli = BackfillCli::parse_from(["chain-mirror-backfill", "--page-size", "0"]);
        assert!(cli.validate().is_err());
        let cli = BackfillCli::parse_from(["chain-mirror-backfill"]);
        assert!(cli.validate().is_ok());
        assert_eq!(cli.backfill.backfill_config().horizon.num_days(), 100);
    }
}
