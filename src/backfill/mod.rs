//! Vote backfill pool
//!
//! When an account is flagged for analysis its older votes are read from
//! the ledger history and applied to the mirror. A master task schedules
//! accounts onto a fixed set of worker tasks over a control channel.

pub mod master;
pub mod messages;
pub mod worker;

use std::time::Duration;

pub use master::{BackfillMaster, MasterState};
pub use messages::{ToMaster, ToWorker, WorkerId};
pub use worker::{AnalyzeReport, BackfillWorker};

/// How far back a backfill reaches
pub const HORIZON_DAYS: i64 = 100;

/// History entries per request
pub const PAGE_SIZE: u64 = 1000;

/// Backfill pool settings
#[derive(Debug, Clone)]
pub struct BackfillConfig {
    /// Requested worker count, clamped to available parallelism
    pub workers: usize,
    pub poll_interval: Duration,
    pub horizon: chrono::Duration,
    pub page_size: u64,
    /// Fixed delay before retrying a failed page
    pub retry_delay: Duration,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            poll_interval: Duration::from_millis(250),
            horizon: chrono::Duration::days(HORIZON_DAYS),
            page_size: PAGE_SIZE,
            retry_delay: Duration::from_millis(1500),
        }
    }
}

impl BackfillConfig {
    /// Workers actually started
    pub fn worker_count(&self) -> usize {
        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        self.workers.clamp(1, parallelism.max(1))
    }
}
