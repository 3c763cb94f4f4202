//! Consistency repair pass
//!
//! A post is healthy when all four facets exist. Interrupted writes leave
//! posts with missing facets (or facets without an identity); the repair
//! pass finds those ids, removes every facet and replays the content from
//! the ledger. Content the ledger no longer has is gone for good.

use std::collections::{BTreeMap, BTreeSet};

use bson::{doc, Bson, Document};
use futures::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use crate::db::{doc_id, Entity, FindSpec, LogicalDb};
use crate::handlers::{ingest_post, IncomingPost, MirrorContext};
use crate::rpc::parse_ledger_time;
use crate::types::Result;

/// Identity ids checked per round trip
pub const REPAIR_BATCH_SIZE: usize = 4096;

/// Concurrent ledger lookups while resurrecting
const RESURRECT_CONCURRENCY: usize = 16;

/// Result of repairing one logical database
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RepairReport {
    /// Counts matched, nothing scanned
    pub skipped: bool,
    pub checked: u64,
    pub corrupted: usize,
    pub resurrected: usize,
    pub lost: usize,
}

/// Where a corrupted post can be re-fetched from
#[derive(Debug, Clone)]
struct PostKey {
    author: String,
    permlink: String,
    timestamp: Option<bson::DateTime>,
}

pub struct RepairPass {
    ctx: MirrorContext,
    batch_size: usize,
}

impl RepairPass {
    pub fn new(ctx: MirrorContext) -> Self {
        Self {
            ctx,
            batch_size: REPAIR_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Repair every logical database
    pub async fn run(&self) -> Result<Vec<(LogicalDb, RepairReport)>> {
        let mut reports = Vec::with_capacity(LogicalDb::ALL.len());
        for db in LogicalDb::ALL {
            reports.push((db, self.run_db(db).await?));
        }
        Ok(reports)
    }

    pub async fn run_db(&self, db: LogicalDb) -> Result<RepairReport> {
        let mut report = RepairReport::default();
        let store = self.ctx.store.as_ref();

        let mut counts = Vec::with_capacity(Entity::POST_FACETS.len());
        for entity in Entity::POST_FACETS {
            counts.push(store.count(db, entity, doc! {}).await?);
        }
        if counts.windows(2).all(|w| w[0] == w[1]) {
            report.skipped = true;
            return Ok(report);
        }
        info!(db = ?db, ?counts, "Facet counts differ, scanning posts");

        let mut corrupted: BTreeMap<i64, Option<PostKey>> = BTreeMap::new();

        // Identities missing a dependent facet
        let mut last = None;
        loop {
            let batch = self.page(db, Entity::PostInfo, last).await?;
            let Some(tail) = batch.last() else { break };
            last = doc_id(tail);
            report.checked += batch.len() as u64;

            let ids: Vec<i64> = batch.iter().filter_map(doc_id).collect();
            let mut missing = BTreeSet::new();
            for entity in [Entity::PostText, Entity::PostData, Entity::PostRaw] {
                missing.extend(self.missing_in(db, entity, &ids).await?);
            }
            for post in &batch {
                if let Some(id) = doc_id(post).filter(|id| missing.contains(id)) {
                    corrupted.insert(id, identity_key(post));
                }
            }
        }

        // Dependent facets without an identity
        for entity in [Entity::PostText, Entity::PostData, Entity::PostRaw] {
            let mut last = None;
            loop {
                let batch = self.page(db, entity, last).await?;
                let Some(tail) = batch.last() else { break };
                last = doc_id(tail);

                let ids: Vec<i64> = batch.iter().filter_map(doc_id).collect();
                for id in self.missing_in(db, Entity::PostInfo, &ids).await? {
                    corrupted.entry(id).or_insert(None);
                }
            }
        }

        if corrupted.is_empty() {
            debug!(db = ?db, "No corrupted posts found");
            return Ok(report);
        }

        // Orphans can still be identified through their raw payload
        let unknown: Vec<i64> = corrupted
            .iter()
            .filter(|(_, key)| key.is_none())
            .map(|(id, _)| *id)
            .collect();
        if !unknown.is_empty() {
            let raws = store
                .find(
                    db,
                    Entity::PostRaw,
                    doc! { "_id": { "$in": unknown } },
                    FindSpec::projection(doc! { "_id": 1, "raw": 1, "timestamp": 1 }),
                )
                .await?;
            for raw in raws {
                if let (Some(id), Some(key)) = (doc_id(&raw), raw_key(&raw)) {
                    corrupted.insert(id, Some(key));
                }
            }
        }

        report.corrupted = corrupted.len();
        let ids: Vec<i64> = corrupted.keys().copied().collect();
        self.ctx.posts.delete(db, &ids).await?;
        info!(db = ?db, corrupted = report.corrupted, "Removed corrupted posts");

        let keys: Vec<PostKey> = corrupted.into_values().flatten().collect();
        report.lost = report.corrupted - keys.len();

        let results: Vec<bool> = stream::iter(keys)
            .map(|key| self.resurrect(db, key))
            .buffer_unordered(RESURRECT_CONCURRENCY)
            .collect()
            .await;
        for restored in results {
            if restored {
                report.resurrected += 1;
            } else {
                report.lost += 1;
            }
        }

        info!(
            db = ?db,
            checked = report.checked,
            corrupted = report.corrupted,
            resurrected = report.resurrected,
            lost = report.lost,
            "Repair pass finished"
        );
        Ok(report)
    }

    async fn page(
        &self,
        db: LogicalDb,
        entity: Entity,
        after: Option<i64>,
    ) -> Result<Vec<Document>> {
        let filter = match after {
            Some(id) => doc! { "_id": { "$gt": id } },
            None => doc! {},
        };
        let projection = match entity {
            Entity::PostInfo => doc! { "_id": 1, "author": 1, "permlink": 1, "timestamp": 1 },
            _ => doc! { "_id": 1 },
        };
        self.ctx
            .store
            .find(
                db,
                entity,
                filter,
                FindSpec::projection(projection)
                    .sort(doc! { "_id": 1 })
                    .limit(self.batch_size as i64),
            )
            .await
    }

    /// Ids of `ids` with no document in `entity`
    async fn missing_in(&self, db: LogicalDb, entity: Entity, ids: &[i64]) -> Result<Vec<i64>> {
        let found: BTreeSet<i64> = self
            .ctx
            .store
            .find(
                db,
                entity,
                doc! { "_id": { "$in": ids.to_vec() } },
                FindSpec::projection(doc! { "_id": 1 }),
            )
            .await?
            .iter()
            .filter_map(doc_id)
            .collect();
        Ok(ids.iter().copied().filter(|id| !found.contains(id)).collect())
    }

    /// Replay one post from the ledger; `true` when it is back in `db`
    async fn resurrect(&self, db: LogicalDb, key: PostKey) -> bool {
        match self.try_resurrect(db, &key).await {
            Ok(restored) => restored,
            Err(e) => {
                warn!(
                    author = %key.author,
                    permlink = %key.permlink,
                    "Could not resurrect post: {}",
                    e
                );
                false
            }
        }
    }

    async fn try_resurrect(&self, db: LogicalDb, key: &PostKey) -> Result<bool> {
        let Some(content) = self.ctx.ledger.content(&key.author, &key.permlink).await? else {
            debug!(
                author = %key.author,
                permlink = %key.permlink,
                "Post no longer on the ledger"
            );
            return Ok(false);
        };

        let timestamp = match parse_ledger_time(&content.created) {
            Ok(created) => created,
            Err(_) => match key.timestamp {
                Some(stored) => stored.to_chrono(),
                None => {
                    warn!(
                        author = %key.author,
                        permlink = %key.permlink,
                        created = %content.created,
                        "No creation time for post"
                    );
                    return Ok(false);
                }
            },
        };

        ingest_post(
            &self.ctx,
            IncomingPost {
                comment: content.as_comment(),
                timestamp,
            },
        )
        .await?;

        Ok(self
            .ctx
            .posts
            .find_identity(db, &key.author, &key.permlink)
            .await?
            .is_some())
    }
}

fn identity_key(doc: &Document) -> Option<PostKey> {
    Some(PostKey {
        author: doc.get_str("author").ok()?.to_string(),
        permlink: doc.get_str("permlink").ok()?.to_string(),
        timestamp: doc.get_datetime("timestamp").ok().copied(),
    })
}

fn raw_key(doc: &Document) -> Option<PostKey> {
    let raw = doc.get_document("raw").ok()?;
    Some(PostKey {
        author: raw.get_str("author").ok()?.to_string(),
        permlink: raw.get_str("permlink").ok()?.to_string(),
        timestamp: match doc.get("timestamp") {
            Some(Bson::DateTime(dt)) => Some(*dt),
            _ => None,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{MemoryStore, MirrorStore};
    use crate::handlers::{handle_comments, HandlerSettings};
    use crate::rpc::{CommentOp, Envelope, ScriptedLedger};
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;

    const BODY: &str = "one two three four five six seven eight nine ten eleven";

    fn post(author: &str, permlink: &str) -> CommentOp {
        CommentOp {
            parent_author: String::new(),
            parent_permlink: "hive".into(),
            author: author.into(),
            permlink: permlink.into(),
            title: format!("Title of {}", permlink),
            body: BODY.into(),
            json_metadata: r#"{"tags":["hive"]}"#.into(),
        }
    }

    async fn setup(
        posts: &[CommentOp],
    ) -> (Arc<MemoryStore>, Arc<ScriptedLedger>, MirrorContext) {
        let store = Arc::new(MemoryStore::default());
        let ledger = Arc::new(ScriptedLedger::new());
        let ctx = MirrorContext::new(store.clone(), ledger.clone(), HandlerSettings::default());
        let when = Utc.with_ymd_and_hms(2022, 3, 1, 12, 0, 0).unwrap();

        let mut envelopes = Vec::new();
        for op in posts {
            ledger.publish(10, when, op.clone());
            envelopes.push(Envelope {
                block: 10,
                trx_id: "trx".into(),
                timestamp: when,
                op: op.clone(),
            });
        }
        handle_comments(&ctx, envelopes).await;
        (store, ledger, ctx)
    }

    #[tokio::test]
    async fn test_consistent_store_is_skipped() {
        let (_, _, ctx) = setup(&[post("alice", "a")]).await;
        let report = RepairPass::new(ctx).run_db(LogicalDb::General).await.unwrap();
        assert!(report.skipped);
        assert_eq!(report.checked, 0);
    }

    #[tokio::test]
    async fn test_missing_facet_is_resurrected() {
        let (store, _, ctx) = setup(&[post("alice", "a"), post("bob", "b")]).await;
        let id = ctx
            .posts
            .find_identity(LogicalDb::General, "alice", "a")
            .await
            .unwrap()
            .unwrap()._id;
        store
            .delete_many(LogicalDb::General, Entity::PostText, doc! { "_id": id })
            .await
            .unwrap();

        let report = RepairPass::new(ctx.clone())
            .with_batch_size(1)
            .run_db(LogicalDb::General)
            .await
            .unwrap();
        assert_eq!(report.checked, 2);
        assert_eq!(report.corrupted, 1);
        assert_eq!(report.resurrected, 1);

        for entity in Entity::POST_FACETS {
            assert_eq!(store.len(LogicalDb::General, entity), 2);
        }
        let restored = ctx
            .posts
            .find_identity(LogicalDb::General, "alice", "a")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            restored.timestamp.to_chrono(),
            Utc.with_ymd_and_hms(2022, 3, 1, 12, 0, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn test_orphan_without_upstream_content_is_removed() {
        let (store, ledger, ctx) = setup(&[post("alice", "a")]).await;
        let id = ctx
            .posts
            .find_identity(LogicalDb::General, "alice", "a")
            .await
            .unwrap()
            .unwrap()._id;
        store
            .delete_many(LogicalDb::General, Entity::PostInfo, doc! { "_id": id })
            .await
            .unwrap();
        ledger.remove_content("alice", "a");

        let report = RepairPass::new(ctx).run_db(LogicalDb::General).await.unwrap();
        assert_eq!(report.corrupted, 1);
        assert_eq!(report.lost, 1);
        assert!(store.is_empty());
    }
}
