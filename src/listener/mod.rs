//! Block ingestion loop
//!
//! One cursor per process. Each step fetches a bounded run of blocks after
//! the cursor, applies them in order and only then advances the cursor, so
//! a crash mid-batch replays the batch on restart. Handlers are idempotent,
//! which makes the replay harmless.

pub mod batch;
pub mod cursor;

use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::handlers::MirrorContext;
use crate::repair::RepairPass;
use crate::types::Result;

pub use batch::{apply_block, BlockReport, OperationBatch};
pub use cursor::{BlockCursor, DEFAULT_REWIND};

/// Most blocks requested in one batch
pub const MAX_BATCH_SIZE: u64 = 50;

/// Listener tuning
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Blocks fetched per step, at most [`MAX_BATCH_SIZE`]
    pub batch_size: u64,
    /// Blocks kept between the cursor and the irreversible tip
    pub tip_lead: u64,
    /// Sleep when caught up with the tip
    pub idle_delay: Duration,
    /// Run the repair pass while idle at the tip
    pub repair_when_idle: bool,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            batch_size: MAX_BATCH_SIZE,
            tip_lead: 5,
            idle_delay: Duration::from_millis(2000),
            repair_when_idle: true,
        }
    }
}

/// Where the loop currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Fetching,
    Applying,
    Advancing,
}

/// Result of one loop step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Blocks `from..=to` applied and the cursor moved to `to`
    Advanced { from: u64, to: u64 },
    /// Not enough irreversible blocks yet
    AtTip,
}

pub struct BlockListener {
    ctx: MirrorContext,
    config: ListenerConfig,
    cursor: BlockCursor,
    position: u64,
    state: LoopState,
    repair: RepairPass,
}

impl BlockListener {
    /// Load the persisted cursor; fails when it was never seeded
    pub async fn start(ctx: MirrorContext, config: ListenerConfig) -> Result<Self> {
        let cursor = BlockCursor::new(ctx.store.clone());
        let position = cursor.require().await?;
        let config = ListenerConfig {
            batch_size: config.batch_size.clamp(1, MAX_BATCH_SIZE),
            ..config
        };

        info!(
            cursor = position,
            batch_size = config.batch_size,
            tip_lead = config.tip_lead,
            "Block listener starting"
        );

        Ok(Self {
            repair: RepairPass::new(ctx.clone()),
            ctx,
            config,
            cursor,
            position,
            state: LoopState::Idle,
        })
    }

    pub fn with_repair(mut self, repair: RepairPass) -> Self {
        self.repair = repair;
        self
    }

    /// Last fully applied block
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Fetch, apply and persist one batch of blocks
    pub async fn step(&mut self) -> Result<StepOutcome> {
        self.state = LoopState::Fetching;
        let tip = match self.ctx.ledger.chain_tip().await {
            Ok(tip) => tip,
            Err(e) => {
                self.state = LoopState::Idle;
                return Err(e);
            }
        };

        let next = self.position + 1;
        if tip < next + self.config.tip_lead {
            self.state = LoopState::Idle;
            return Ok(StepOutcome::AtTip);
        }

        let end = tip - self.config.tip_lead;
        let count = (end - self.position).min(self.config.batch_size);
        let blocks = match self.ctx.ledger.block_operations(next, count).await {
            Ok(blocks) => blocks,
            Err(e) => {
                self.state = LoopState::Idle;
                return Err(e);
            }
        };

        self.state = LoopState::Applying;
        let mut failed = 0;
        let mut last = self.position;
        for block in blocks {
            let num = block.num;
            if num != last + 1 {
                warn!(expected = last + 1, got = num, "Block out of sequence");
            }
            failed += apply_block(&self.ctx, block).await.failed();
            last = num;
        }

        self.state = LoopState::Advancing;
        let to = next + count - 1;
        self.cursor.store(to).await?;
        self.position = to;
        self.state = LoopState::Idle;

        if failed > 0 {
            warn!(from = next, to, failed, "Batch applied with handler failures");
        } else {
            debug!(from = next, to, "Batch applied");
        }
        Ok(StepOutcome::Advanced { from: next, to })
    }

    /// Run until the ledger becomes unreachable
    pub async fn run(&mut self) -> Result<()> {
        loop {
            match self.step().await {
                Ok(StepOutcome::Advanced { to, .. }) => {
                    debug!(cursor = to, "Cursor advanced");
                }
                Ok(StepOutcome::AtTip) => {
                    if self.config.repair_when_idle {
                        // Repair problems never stop ingestion
                        if let Err(e) = self.repair.run().await {
                            error!("Repair pass failed: {}", e);
                        }
                    }
                    tokio::time::sleep(self.config.idle_delay).await;
                }
                Err(e) => {
                    error!(cursor = self.position, "Ledger unavailable: {}", e);
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Entity, LogicalDb, MemoryStore};
    use crate::handlers::HandlerSettings;
    use crate::rpc::{Operation, ScriptedLedger, VoteOp};
    use crate::types::MirrorError;
    use chrono::Utc;
    use std::sync::Arc;

    fn context(ledger: Arc<ScriptedLedger>) -> (Arc<MemoryStore>, MirrorContext) {
        let store = Arc::new(MemoryStore::default());
        let ctx = MirrorContext::new(store.clone(), ledger, HandlerSettings::default());
        (store, ctx)
    }

    fn config() -> ListenerConfig {
        ListenerConfig {
            batch_size: 3,
            tip_lead: 0,
            idle_delay: Duration::from_millis(1),
            repair_when_idle: false,
        }
    }

    #[tokio::test]
    async fn test_start_requires_cursor() {
        let (_, ctx) = context(Arc::new(ScriptedLedger::new()));
        let result = BlockListener::start(ctx, config()).await;
        assert!(matches!(result, Err(MirrorError::Config(_))));
    }

    #[tokio::test]
    async fn test_step_advances_in_batches() {
        let ledger = Arc::new(ScriptedLedger::new());
        ledger.set_tip(107);
        let (store, ctx) = context(ledger);
        BlockCursor::new(store.clone()).set(100).await.unwrap();

        let mut listener = BlockListener::start(ctx, config()).await.unwrap();
        assert_eq!(
            listener.step().await.unwrap(),
            StepOutcome::Advanced { from: 101, to: 103 }
        );
        assert_eq!(
            listener.step().await.unwrap(),
            StepOutcome::Advanced { from: 104, to: 106 }
        );
        assert_eq!(
            listener.step().await.unwrap(),
            StepOutcome::Advanced { from: 107, to: 107 }
        );
        assert_eq!(listener.step().await.unwrap(), StepOutcome::AtTip);
        assert_eq!(listener.state(), LoopState::Idle);

        let persisted = BlockCursor::new(store.clone()).load().await.unwrap();
        assert_eq!(persisted, Some(107));
    }

    #[tokio::test]
    async fn test_tip_lead_holds_back() {
        let ledger = Arc::new(ScriptedLedger::new());
        ledger.set_tip(104);
        let (store, ctx) = context(ledger);
        BlockCursor::new(store).set(100).await.unwrap();

        let cfg = ListenerConfig {
            tip_lead: 5,
            ..config()
        };
        let mut listener = BlockListener::start(ctx, cfg).await.unwrap();
        assert_eq!(listener.step().await.unwrap(), StepOutcome::AtTip);
        assert_eq!(listener.position(), 100);
    }

    #[tokio::test]
    async fn test_batch_stops_short_of_tip_lead() {
        let ledger = Arc::new(ScriptedLedger::new());
        ledger.set_tip(110);
        let (store, ctx) = context(ledger);
        BlockCursor::new(store.clone()).set(100).await.unwrap();

        let cfg = ListenerConfig {
            batch_size: MAX_BATCH_SIZE,
            tip_lead: 5,
            ..config()
        };
        let mut listener = BlockListener::start(ctx, cfg).await.unwrap();
        assert_eq!(
            listener.step().await.unwrap(),
            StepOutcome::Advanced { from: 101, to: 105 }
        );
        assert_eq!(listener.step().await.unwrap(), StepOutcome::AtTip);
        assert_eq!(BlockCursor::new(store).load().await.unwrap(), Some(105));
    }

    #[tokio::test]
    async fn test_ledger_failure_keeps_cursor() {
        let ledger = Arc::new(ScriptedLedger::new());
        ledger.push_op(
            101,
            Utc::now(),
            "t",
            Operation::Vote(VoteOp {
                voter: "alice".into(),
                author: "bob".into(),
                permlink: "p".into(),
                weight: 100,
            }),
        );
        let (store, ctx) = context(ledger.clone());
        BlockCursor::new(store.clone()).set(100).await.unwrap();
        let mut listener = BlockListener::start(ctx, config()).await.unwrap();

        ledger.fail_next(1);
        assert!(listener.step().await.is_err());
        assert_eq!(BlockCursor::new(store.clone()).load().await.unwrap(), Some(100));

        listener.step().await.unwrap();
        assert_eq!(listener.position(), 101);
        // The vote auto-created its voter
        assert_eq!(store.len(LogicalDb::General, Entity::AccountInfo), 1);
    }
}
