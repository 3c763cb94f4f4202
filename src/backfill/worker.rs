//! Backfill worker
//!
//! Walks one account's vote history backward from the newest entry and
//! applies every vote it cast inside the horizon.

use std::collections::HashSet;

use bson::{doc, DateTime as BsonDateTime};
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::messages::{ToMaster, ToWorker, WorkerId};
use super::BackfillConfig;
use crate::db::schemas::AccountInfoDoc;
use crate::db::{find_one_typed, Entity, LogicalDb};
use crate::handlers::{apply_vote_edges, MirrorContext};
use crate::rpc::{HistoryEntry, Operation, VoteOp};
use crate::types::{MirrorError, Result};

/// Counts from one account job
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AnalyzeReport {
    pub pages: usize,
    pub votes: usize,
    pub applied: u64,
}

pub struct BackfillWorker {
    id: WorkerId,
    ctx: MirrorContext,
    config: BackfillConfig,
}

impl BackfillWorker {
    pub fn new(id: WorkerId, ctx: MirrorContext, config: BackfillConfig) -> Self {
        Self { id, ctx, config }
    }

    /// Announce liveness, then serve jobs until the master hangs up
    ///
    /// Returns an error on the first job that fails for a non-transient
    /// reason; the supervisor then replaces the worker.
    pub async fn run(
        self,
        mut jobs: mpsc::Receiver<ToWorker>,
        master: mpsc::Sender<ToMaster>,
    ) -> Result<()> {
        master
            .send(ToMaster::Alive { pid: self.id })
            .await
            .map_err(|_| MirrorError::Channel("master is gone".into()))?;
        debug!(worker = self.id, "Worker ready");

        while let Some(ToWorker::Analyze { account_id }) = jobs.recv().await {
            self.analyze(account_id).await?;
            if master
                .send(ToMaster::Finished {
                    pid: self.id,
                    account_id,
                })
                .await
                .is_err()
            {
                break;
            }
        }

        debug!(worker = self.id, "Worker shutting down");
        Ok(())
    }

    /// Backfill the votes of one account
    pub async fn analyze(&self, account_id: i64) -> Result<AnalyzeReport> {
        let store = self.ctx.store.as_ref();
        let mut report = AnalyzeReport::default();

        let account: Option<AccountInfoDoc> = find_one_typed(
            store,
            LogicalDb::General,
            Entity::AccountInfo,
            doc! { "_id": account_id },
        )
        .await?;
        let Some(account) = account else {
            warn!(worker = self.id, account_id, "Account to analyze does not exist");
            return Ok(report);
        };

        store
            .update_one(
                LogicalDb::General,
                Entity::AccountData,
                doc! { "_id": account_id },
                doc! { "$set": { "make_feed": true, "loading": true } },
                true,
            )
            .await?;

        let horizon = Utc::now() - self.config.horizon;
        let page_size = self.config.page_size.max(1);
        let mut start: i64 = -1;
        let mut seen: HashSet<(String, String)> = HashSet::new();

        loop {
            let limit = if start < 0 {
                page_size
            } else {
                page_size.min(start as u64 + 1)
            };
            let page = self.fetch_page(&account.name, start, limit).await?;
            report.pages += 1;

            let Some(oldest) = page.first().map(|e| e.id) else {
                break;
            };
            // Advance before applying so a retry never re-reads this page
            start = oldest - 1;

            let mut crossed = false;
            let mut votes: Vec<VoteOp> = Vec::new();
            for entry in page.into_iter().rev() {
                if entry.timestamp <= horizon {
                    crossed = true;
                    break;
                }
                if let Operation::Vote(vote) = entry.op {
                    // Newest vote on a post decides
                    let key = (vote.author.clone(), vote.permlink.clone());
                    if vote.voter == account.name && seen.insert(key) {
                        votes.push(vote);
                    }
                }
            }

            report.votes += votes.len();
            if !votes.is_empty() {
                report.applied += self.apply(account_id, &votes).await?;
            }

            if crossed || oldest <= 0 {
                break;
            }
        }

        store
            .update_one(
                LogicalDb::General,
                Entity::AccountData,
                doc! { "_id": account_id },
                doc! { "$set": {
                    "last_analyze": BsonDateTime::now(),
                    "loading": false,
                } },
                true,
            )
            .await?;

        info!(
            worker = self.id,
            account = %account.name,
            pages = report.pages,
            votes = report.votes,
            "Account backfilled"
        );
        Ok(report)
    }

    async fn fetch_page(&self, account: &str, start: i64, limit: u64) -> Result<Vec<HistoryEntry>> {
        loop {
            match self.ctx.ledger.account_history(account, start, limit).await {
                Ok(page) => return Ok(page),
                Err(e) if e.is_transient() => {
                    warn!(
                        worker = self.id,
                        account,
                        start,
                        "History page failed, retrying: {}",
                        e
                    );
                    tokio::time::sleep(self.config.retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn apply(&self, voter_id: i64, votes: &[VoteOp]) -> Result<u64> {
        loop {
            match apply_vote_edges(&self.ctx, voter_id, votes).await {
                Ok(outcome) => return Ok(outcome.modified),
                Err(e) if e.is_transient() => {
                    warn!(worker = self.id, voter_id, "Vote write failed, retrying: {}", e);
                    tokio::time::sleep(self.config.retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
