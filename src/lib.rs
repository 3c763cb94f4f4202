//! chain-mirror - Hive blockchain to MongoDB mirror
//!
//! Follows the irreversible head of the ledger and keeps a queryable
//! mirror of posts, votes, accounts and moderation state.
//!
//! ## Components
//!
//! - **Listener**: block ingestion loop with a persisted cursor
//! - **Handlers**: comment, vote, account-update and control command handlers
//! - **Repair**: consistency pass over the four post facets
//! - **Backfill**: master/worker pool replaying account vote histories
//! - **Content**: markdown normalization, moderation gates and tag commands

pub mod backfill;
pub mod config;
pub mod content;
pub mod db;
pub mod handlers;
pub mod ids;
pub mod listener;
pub mod logging;
pub mod posts;
pub mod repair;
pub mod rpc;
pub mod types;

pub use config::{BackfillCli, ListenerCli};
pub use types::{MirrorError, Result};
