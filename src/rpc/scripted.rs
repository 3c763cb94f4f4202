//! In-memory ledger for dev runs and tests
//!
//! Blocks, contents and account histories are seeded up front. Transport
//! failures can be injected to exercise retry and fatal paths.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;

use super::client::Ledger;
use super::types::{
    BlockOperation, BlockOperations, CommentOp, Content, HistoryEntry, Operation, VoteOp,
};
use crate::types::{MirrorError, Result};

/// A recorded `account_history` request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryCall {
    pub account: String,
    pub start: i64,
    pub limit: u64,
}

#[derive(Default)]
pub struct ScriptedLedger {
    tip: AtomicU64,
    blocks: DashMap<u64, Vec<BlockOperation>>,
    contents: DashMap<(String, String), Content>,
    histories: DashMap<String, Vec<HistoryEntry>>,
    history_calls: Mutex<Vec<HistoryCall>>,
    failures: AtomicU32,
}

impl ScriptedLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_tip(&self, tip: u64) {
        self.tip.store(tip, Ordering::SeqCst);
    }

    /// Append an operation to a block, raising the tip to cover it
    pub fn push_op(&self, block: u64, timestamp: DateTime<Utc>, trx_id: &str, op: Operation) {
        self.blocks.entry(block).or_default().push(BlockOperation {
            trx_id: trx_id.to_string(),
            block,
            timestamp,
            op,
        });
        self.tip.fetch_max(block, Ordering::SeqCst);
    }

    /// Publish a post: the comment goes into `block` and becomes fetchable content
    pub fn publish(&self, block: u64, timestamp: DateTime<Utc>, comment: CommentOp) {
        self.put_content(Content {
            author: comment.author.clone(),
            permlink: comment.permlink.clone(),
            parent_author: comment.parent_author.clone(),
            parent_permlink: comment.parent_permlink.clone(),
            title: comment.title.clone(),
            body: comment.body.clone(),
            json_metadata: comment.json_metadata.clone(),
            created: timestamp.format("%Y-%m-%dT%H:%M:%S").to_string(),
        });
        let trx_id = format!("trx-{}-{}", block, comment.permlink);
        self.push_op(block, timestamp, &trx_id, Operation::Comment(comment));
    }

    pub fn put_content(&self, content: Content) {
        self.contents
            .insert((content.author.clone(), content.permlink.clone()), content);
    }

    pub fn remove_content(&self, author: &str, permlink: &str) {
        self.contents
            .remove(&(author.to_string(), permlink.to_string()));
    }

    /// Append a vote to an account's history with the next sequence id
    pub fn push_history_vote(&self, account: &str, timestamp: DateTime<Utc>, vote: VoteOp) {
        let mut history = self.histories.entry(account.to_string()).or_default();
        let id = history.len() as i64;
        history.push(HistoryEntry {
            id,
            trx_id: format!("trx-history-{}", id),
            timestamp,
            op: Operation::Vote(vote),
        });
    }

    /// Fail the next `count` calls with a transport error
    pub fn fail_next(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    pub async fn history_calls(&self) -> Vec<HistoryCall> {
        self.history_calls.lock().await.clone()
    }

    fn take_failure(&self) -> Result<()> {
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(MirrorError::Rpc("injected transport failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Ledger for ScriptedLedger {
    async fn chain_tip(&self) -> Result<u64> {
        self.take_failure()?;
        Ok(self.tip.load(Ordering::SeqCst))
    }

    async fn block_operations(&self, from: u64, count: u64) -> Result<Vec<BlockOperations>> {
        self.take_failure()?;
        Ok((from..from + count)
            .map(|num| BlockOperations {
                num,
                operations: self
                    .blocks
                    .get(&num)
                    .map(|ops| ops.clone())
                    .unwrap_or_default(),
            })
            .collect())
    }

    async fn content(&self, author: &str, permlink: &str) -> Result<Option<Content>> {
        self.take_failure()?;
        Ok(self
            .contents
            .get(&(author.to_string(), permlink.to_string()))
            .map(|c| c.clone()))
    }

    async fn account_history(
        &self,
        account: &str,
        start: i64,
        limit: u64,
    ) -> Result<Vec<HistoryEntry>> {
        self.history_calls.lock().await.push(HistoryCall {
            account: account.to_string(),
            start,
            limit,
        });
        self.take_failure()?;

        let Some(history) = self.histories.get(account) else {
            return Ok(Vec::new());
        };

        let eligible: Vec<&HistoryEntry> = history
            .iter()
            .filter(|e| start < 0 || e.id <= start)
            .collect();
        let skip = eligible.len().saturating_sub(limit as usize);
        Ok(eligible.into_iter().skip(skip).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vote(n: usize) -> VoteOp {
        VoteOp {
            voter: "alice".into(),
            author: "bob".into(),
            permlink: format!("post-{}", n),
            weight: 100,
        }
    }

    #[tokio::test]
    async fn test_history_pages_backward() {
        let ledger = ScriptedLedger::new();
        for n in 0..10 {
            ledger.push_history_vote("alice", Utc::now(), vote(n));
        }

        let newest = ledger.account_history("alice", -1, 4).await.unwrap();
        assert_eq!(newest.iter().map(|e| e.id).collect::<Vec<_>>(), vec![6, 7, 8, 9]);

        let older = ledger.account_history("alice", 5, 4).await.unwrap();
        assert_eq!(older.iter().map(|e| e.id).collect::<Vec<_>>(), vec![2, 3, 4, 5]);

        assert_eq!(ledger.history_calls().await.len(), 2);
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let ledger = ScriptedLedger::new();
        ledger.set_tip(5);
        ledger.fail_next(1);
        assert!(ledger.chain_tip().await.is_err());
        assert_eq!(ledger.chain_tip().await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_publish_makes_content_fetchable() {
        let ledger = ScriptedLedger::new();
        let comment = CommentOp {
            author: "bob".into(),
            permlink: "hello".into(),
            parent_permlink: "life".into(),
            body: "text".into(),
            ..Default::default()
        };
        ledger.publish(3, Utc::now(), comment);
        assert_eq!(ledger.chain_tip().await.unwrap(), 3);
        assert!(ledger.content("bob", "hello").await.unwrap().is_some());
        assert_eq!(ledger.block_operations(3, 1).await.unwrap()[0].operations.len(), 1);
    }
}
