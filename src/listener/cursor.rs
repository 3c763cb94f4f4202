//! Persisted block cursor

use std::sync::Arc;

use bson::doc;
use tracing::info;

use crate::db::schemas::{CursorDoc, CURSOR_TAG};
use crate::db::{find_one_typed, Entity, LogicalDb, MirrorStore};
use crate::types::{MirrorError, Result};

/// Default number of blocks stepped back by a rewind
pub const DEFAULT_REWIND: u64 = 150;

/// Highest fully processed block, stored in `stats`
#[derive(Clone)]
pub struct BlockCursor {
    store: Arc<dyn MirrorStore>,
}

impl BlockCursor {
    pub fn new(store: Arc<dyn MirrorStore>) -> Self {
        Self { store }
    }

    /// Current position, `None` when never seeded
    pub async fn load(&self) -> Result<Option<u64>> {
        let cursor: Option<CursorDoc> = find_one_typed(
            self.store.as_ref(),
            LogicalDb::General,
            Entity::Stats,
            doc! { "tag": CURSOR_TAG },
        )
        .await?;

        cursor
            .map(|c| {
                u64::try_from(c.current_num).map_err(|_| {
                    MirrorError::Config(format!("block cursor is negative: {}", c.current_num))
                })
            })
            .transpose()
    }

    /// Position required to start ingesting
    pub async fn require(&self) -> Result<u64> {
        self.load().await?.ok_or_else(|| {
            MirrorError::Config(format!(
                "block cursor '{}' is not set; seed it with `cursor set <block>`",
                CURSOR_TAG
            ))
        })
    }

    /// Persist a new position
    pub async fn store(&self, num: u64) -> Result<()> {
        let num = i64::try_from(num)
            .map_err(|_| MirrorError::Internal(format!("block number {} out of range", num)))?;
        self.store
            .update_one(
                LogicalDb::General,
                Entity::Stats,
                doc! { "tag": CURSOR_TAG },
                doc! { "$set": { "current_num": num } },
                true,
            )
            .await?;
        Ok(())
    }

    /// Operator override of the position
    pub async fn set(&self, num: u64) -> Result<()> {
        let previous = self.load().await?;
        self.store(num).await?;
        info!(?previous, current = num, "Block cursor set");
        Ok(())
    }

    /// Step the cursor back by a safety buffer after a fault
    pub async fn rewind(&self, blocks: u64) -> Result<u64> {
        let current = self.require().await?;
        let target = current.saturating_sub(blocks);
        self.store(target).await?;
        info!(from = current, to = target, "Block cursor rewound");
        Ok(target)
    }
}
