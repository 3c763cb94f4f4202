//! In-memory mirror store
//!
//! Used when running without MongoDB (dev mode) and by the test suite.
//! Honors `_id` uniqueness and the unique indexes declared by the schemas
//! so conflict handling behaves like the real store. Write failures can
//! be injected per collection to simulate a crash between facet writes.

use async_trait::async_trait;
use bson::{oid::ObjectId, Document};
use dashmap::{DashMap, DashSet};
use tracing::warn;

use super::query;
use super::schemas::unique_keys;
use super::store::{BulkOutcome, Entity, FindSpec, LogicalDb, MirrorStore, UpdateSummary, WriteOp};
use crate::types::{MirrorError, Result};

type CollectionKey = (LogicalDb, Entity);

/// Mirror store backed by process memory
#[derive(Default)]
pub struct MemoryStore {
    collections: DashMap<CollectionKey, Vec<Document>>,
    failing: DashSet<CollectionKey>,
}

impl MemoryStore {
    pub fn new() -> Self {
        warn!("Mirror store running in memory-only mode (no MongoDB)");
        Self::default()
    }

    /// Make every write to a collection fail until cleared
    pub fn fail_writes(&self, db: LogicalDb, entity: Entity) {
        self.failing.insert((db, entity));
    }

    pub fn clear_failures(&self) {
        self.failing.clear();
    }

    /// Sorted copy of every non-empty collection
    pub fn snapshot(&self) -> Vec<(CollectionKey, Vec<Document>)> {
        let mut out: Vec<(CollectionKey, Vec<Document>)> = self
            .collections
            .iter()
            .filter(|entry| !entry.value().is_empty())
            .map(|entry| {
                let mut docs = entry.value().clone();
                query::sort_docs(&mut docs, &bson::doc! { "_id": 1 });
                (*entry.key(), docs)
            })
            .collect();
        out.sort_by_key(|(key, _)| *key);
        out
    }

    /// Number of documents in a collection
    pub fn len(&self, db: LogicalDb, entity: Entity) -> usize {
        self.collections
            .get(&(db, entity))
            .map(|docs| docs.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.collections.iter().all(|entry| entry.value().is_empty())
    }

    fn check_writable(&self, db: LogicalDb, entity: Entity) -> Result<()> {
        if self.failing.contains(&(db, entity)) {
            return Err(MirrorError::Database(format!(
                "injected write failure on {:?}/{}",
                db,
                entity.collection_name()
            )));
        }
        Ok(())
    }

    fn insert_into(docs: &mut Vec<Document>, entity: Entity, mut doc: Document) -> Result<()> {
        if !doc.contains_key("_id") {
            doc.insert("_id", ObjectId::new());
        }

        if let Some(id) = doc.get("_id") {
            if docs
                .iter()
                .any(|d| d.get("_id").is_some_and(|other| query::values_equal(other, id)))
            {
                return Err(MirrorError::Duplicate(format!(
                    "{} _id {}",
                    entity.collection_name(),
                    id
                )));
            }
        }

        for keys in unique_keys(entity) {
            let conflict = docs.iter().any(|existing| {
                keys.iter().all(|key| {
                    match (query::lookup(existing, key), query::lookup(&doc, key)) {
                        (Some(a), Some(b)) => query::values_equal(a, b),
                        (None, None) => true,
                        _ => false,
                    }
                })
            });
            if conflict {
                return Err(MirrorError::Duplicate(format!(
                    "{} unique index on {}",
                    entity.collection_name(),
                    keys.join(",")
                )));
            }
        }

        docs.push(doc);
        Ok(())
    }

    fn update_in(
        docs: &mut Vec<Document>,
        entity: Entity,
        filter: &Document,
        update: &Document,
        upsert: bool,
        multi: bool,
    ) -> Result<UpdateSummary> {
        let mut summary = UpdateSummary::default();

        for doc in docs.iter_mut().filter(|d| query::matches(d, filter)) {
            summary.matched += 1;
            if query::apply_update(doc, update, false)? {
                summary.modified += 1;
            }
            if !multi {
                break;
            }
        }

        if summary.matched == 0 && upsert {
            let mut seeded = query::upsert_seed(filter);
            query::apply_update(&mut seeded, update, true)?;
            Self::insert_into(docs, entity, seeded)?;
            summary.upserted = true;
        }

        Ok(summary)
    }
}

#[async_trait]
impl MirrorStore for MemoryStore {
    async fn find_one(
        &self,
        db: LogicalDb,
        entity: Entity,
        filter: Document,
    ) -> Result<Option<Document>> {
        Ok(self.collections.get(&(db, entity)).and_then(|docs| {
            docs.iter()
                .find(|d| query::matches(d, &filter))
                .cloned()
        }))
    }

    async fn find(
        &self,
        db: LogicalDb,
        entity: Entity,
        filter: Document,
        spec: FindSpec,
    ) -> Result<Vec<Document>> {
        let mut found: Vec<Document> = match self.collections.get(&(db, entity)) {
            Some(docs) => docs
                .iter()
                .filter(|d| query::matches(d, &filter))
                .cloned()
                .collect(),
            None => return Ok(Vec::new()),
        };

        if let Some(sort) = &spec.sort {
            query::sort_docs(&mut found, sort);
        }

        let skip = spec.skip.unwrap_or(0) as usize;
        let limit = match spec.limit {
            Some(n) if n > 0 => n as usize,
            _ => usize::MAX,
        };

        Ok(found
            .into_iter()
            .skip(skip)
            .take(limit)
            .map(|d| match &spec.projection {
                Some(projection) => query::project(&d, projection),
                None => d,
            })
            .collect())
    }

    async fn insert_one(&self, db: LogicalDb, entity: Entity, doc: Document) -> Result<()> {
        self.check_writable(db, entity)?;
        let mut docs = self.collections.entry((db, entity)).or_default();
        Self::insert_into(&mut docs, entity, doc)
    }

    async fn update_one(
        &self,
        db: LogicalDb,
        entity: Entity,
        filter: Document,
        update: Document,
        upsert: bool,
    ) -> Result<UpdateSummary> {
        self.check_writable(db, entity)?;
        let mut docs = self.collections.entry((db, entity)).or_default();
        Self::update_in(&mut docs, entity, &filter, &update, upsert, false)
    }

    async fn update_many(
        &self,
        db: LogicalDb,
        entity: Entity,
        filter: Document,
        update: Document,
    ) -> Result<UpdateSummary> {
        self.check_writable(db, entity)?;
        let mut docs = self.collections.entry((db, entity)).or_default();
        Self::update_in(&mut docs, entity, &filter, &update, false, true)
    }

    async fn delete_many(&self, db: LogicalDb, entity: Entity, filter: Document) -> Result<u64> {
        self.check_writable(db, entity)?;
        let Some(mut docs) = self.collections.get_mut(&(db, entity)) else {
            return Ok(0);
        };
        let before = docs.len();
        docs.retain(|d| !query::matches(d, &filter));
        Ok((before - docs.len()) as u64)
    }

    async fn bulk_write(
        &self,
        db: LogicalDb,
        entity: Entity,
        ops: Vec<WriteOp>,
    ) -> Result<BulkOutcome> {
        self.check_writable(db, entity)?;
        let mut docs = self.collections.entry((db, entity)).or_default();
        let mut outcome = BulkOutcome::default();
        let mut first_error = None;

        for op in ops {
            let result = match op {
                WriteOp::InsertOne(doc) => match Self::insert_into(&mut docs, entity, doc) {
                    Ok(()) => {
                        outcome.inserted += 1;
                        Ok(())
                    }
                    Err(MirrorError::Duplicate(_)) => {
                        outcome.duplicates += 1;
                        Ok(())
                    }
                    Err(e) => Err(e),
                },
                WriteOp::UpdateOne {
                    filter,
                    update,
                    upsert,
                } => match Self::update_in(&mut docs, entity, &filter, &update, upsert, false) {
                    Ok(summary) => {
                        record_update(&mut outcome, summary);
                        Ok(())
                    }
                    Err(MirrorError::Duplicate(_)) => {
                        outcome.duplicates += 1;
                        Ok(())
                    }
                    Err(e) => Err(e),
                },
                WriteOp::UpdateMany { filter, update } => {
                    Self::update_in(&mut docs, entity, &filter, &update, false, true)
                        .map(|s| record_update(&mut outcome, s))
                }
                WriteOp::DeleteMany { filter } => {
                    let before = docs.len();
                    docs.retain(|d| !query::matches(d, &filter));
                    outcome.deleted += (before - docs.len()) as u64;
                    Ok(())
                }
            };

            // Unordered: keep going, report the first failure at the end
            if let Err(e) = result {
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(outcome),
        }
    }

    async fn count(&self, db: LogicalDb, entity: Entity, filter: Document) -> Result<u64> {
        Ok(self
            .collections
            .get(&(db, entity))
            .map(|docs| docs.iter().filter(|d| query::matches(d, &filter)).count() as u64)
            .unwrap_or(0))
    }
}

fn record_update(outcome: &mut BulkOutcome, summary: UpdateSummary) {
    outcome.matched += summary.matched;
    outcome.modified += summary.modified;
    if summary.upserted {
        outcome.upserted += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[tokio::test]
    async fn test_insert_enforces_unique_index() {
        let store = MemoryStore::default();
        store
            .insert_one(
                LogicalDb::General,
                Entity::AccountInfo,
                doc! { "_id": 1_i64, "name": "alice" },
            )
            .await
            .unwrap();

        let err = store
            .insert_one(
                LogicalDb::General,
                Entity::AccountInfo,
                doc! { "_id": 2_i64, "name": "alice" },
            )
            .await
            .unwrap_err();
        assert!(err.is_duplicate());

        let err = store
            .insert_one(
                LogicalDb::General,
                Entity::AccountInfo,
                doc! { "_id": 1_i64, "name": "bob" },
            )
            .await
            .unwrap_err();
        assert!(err.is_duplicate());
    }

    #[tokio::test]
    async fn test_upsert_creates_from_filter() {
        let store = MemoryStore::default();
        let summary = store
            .update_one(
                LogicalDb::General,
                Entity::Stats,
                doc! { "tag": "CURRENT_BLOCK_NUM" },
                doc! { "$set": { "current_num": 10_i64 } },
                true,
            )
            .await
            .unwrap();
        assert!(summary.upserted);

        let found = store
            .find_one(LogicalDb::General, Entity::Stats, doc! { "tag": "CURRENT_BLOCK_NUM" })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.get_i64("current_num").unwrap(), 10);
    }

    #[tokio::test]
    async fn test_bulk_write_counts_duplicates() {
        let store = MemoryStore::default();
        let outcome = store
            .bulk_write(
                LogicalDb::General,
                Entity::PostData,
                vec![
                    WriteOp::InsertOne(doc! { "_id": 1_i64 }),
                    WriteOp::InsertOne(doc! { "_id": 1_i64 }),
                    WriteOp::UpdateOne {
                        filter: doc! { "_id": 1_i64 },
                        update: doc! { "$addToSet": { "votes": 5_i64 } },
                        upsert: false,
                    },
                ],
            )
            .await
            .unwrap();
        assert_eq!(outcome.inserted, 1);
        assert_eq!(outcome.duplicates, 1);
        assert_eq!(outcome.modified, 1);
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let store = MemoryStore::default();
        store.fail_writes(LogicalDb::General, Entity::PostText);
        let err = store
            .insert_one(LogicalDb::General, Entity::PostText, doc! { "_id": 1_i64 })
            .await
            .unwrap_err();
        assert!(matches!(err, MirrorError::Database(_)));

        store.clear_failures();
        store
            .insert_one(LogicalDb::General, Entity::PostText, doc! { "_id": 1_i64 })
            .await
            .unwrap();
        assert_eq!(store.len(LogicalDb::General, Entity::PostText), 1);
    }

    #[tokio::test]
    async fn test_find_sort_limit_projection() {
        let store = MemoryStore::default();
        for id in [3_i64, 1, 2] {
            store
                .insert_one(
                    LogicalDb::Images,
                    Entity::PostInfo,
                    doc! { "_id": id, "author": "a", "permlink": format!("p{}", id) },
                )
                .await
                .unwrap();
        }

        let found = store
            .find(
                LogicalDb::Images,
                Entity::PostInfo,
                doc! { "_id": { "$gt": 1_i64 } },
                FindSpec::projection(doc! { "_id": 1 })
                    .sort(doc! { "_id": 1 })
                    .limit(1),
            )
            .await
            .unwrap();
        assert_eq!(found, vec![doc! { "_id": 2_i64 }]);
    }
}
