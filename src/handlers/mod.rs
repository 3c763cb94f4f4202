//! Operation handlers
//!
//! Each handler consumes the operations of one kind from a single block
//! and turns them into store mutations. Handlers never fail as a whole:
//! per-operation errors are logged and counted in the returned report so
//! sibling operations and sibling handlers keep going.

pub mod account_update;
pub mod accounts;
pub mod comment;
pub mod custom_json;
pub mod vote;

use std::sync::Arc;

use crate::content::Normalizer;
use crate::db::{LogicalDb, MirrorStore};
use crate::ids::IdAllocator;
use crate::posts::Posts;
use crate::rpc::Ledger;

pub use account_update::handle_account_updates;
pub use comment::{handle_comments, ingest_post, CommentOutcome, IncomingPost};
pub use custom_json::{handle_custom_json, ControlCommand};
pub use vote::{apply_vote_edges, handle_votes};

/// Custom-json id carrying control commands
pub const COMMAND_NAMESPACE: &str = "config_hive_discover";

/// Default first word of a tag command reply
pub const DEFAULT_TAG_COMMAND_PHRASE: &str = "!discover-tags";

/// Handler behavior switches
#[derive(Debug, Clone)]
pub struct HandlerSettings {
    pub command_namespace: String,
    /// Account whose replies may carry tag commands; disabled when unset
    pub tag_command_account: Option<String>,
    pub tag_command_phrase: String,
    /// Community whose image posts are mirrored into the image database
    pub image_community: Option<String>,
}

impl Default for HandlerSettings {
    fn default() -> Self {
        Self {
            command_namespace: COMMAND_NAMESPACE.to_string(),
            tag_command_account: None,
            tag_command_phrase: DEFAULT_TAG_COMMAND_PHRASE.to_string(),
            image_community: None,
        }
    }
}

/// Shared dependencies of the handlers, the repair pass and the backfill pool
#[derive(Clone)]
pub struct MirrorContext {
    pub store: Arc<dyn MirrorStore>,
    pub ledger: Arc<dyn Ledger>,
    pub ids: IdAllocator,
    pub normalizer: Normalizer,
    pub posts: Posts,
    pub settings: HandlerSettings,
}

impl MirrorContext {
    pub fn new(
        store: Arc<dyn MirrorStore>,
        ledger: Arc<dyn Ledger>,
        settings: HandlerSettings,
    ) -> Self {
        Self {
            posts: Posts::new(store.clone()),
            store,
            ledger,
            ids: IdAllocator::default(),
            normalizer: Normalizer::new(),
            settings,
        }
    }

    /// Logical databases that may hold posts
    pub fn mirror_dbs(&self) -> &'static [LogicalDb] {
        if self.settings.image_community.is_some() {
            &LogicalDb::ALL
        } else {
            &[LogicalDb::General]
        }
    }
}

/// Counts from one handler run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandlerReport {
    pub applied: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl HandlerReport {
    pub fn merge(&mut self, other: HandlerReport) {
        self.applied += other.applied;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }

    pub fn total(&self) -> usize {
        self.applied + self.skipped + self.failed
    }
}
