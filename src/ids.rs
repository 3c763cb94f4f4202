//! Random integer identifier allocation
//!
//! Candidates are drawn in batches and checked against the target
//! collection in one query. Only documents present at query time count;
//! a concurrent insert of the same id surfaces later as a duplicate-key
//! conflict, which callers treat as a lost race.

use std::ops::RangeInclusive;

use bson::doc;
use rand::Rng;
use tracing::debug;

use crate::db::{doc_id, Entity, FindSpec, LogicalDb, MirrorStore};
use crate::types::Result;

/// Range identifiers are drawn from
pub const ID_RANGE: RangeInclusive<i64> = 1..=i32::MAX as i64;

/// Candidates checked per query
pub const CANDIDATE_BATCH: usize = 64;

#[derive(Debug, Clone)]
pub struct IdAllocator {
    range: RangeInclusive<i64>,
    batch: usize,
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self {
            range: ID_RANGE,
            batch: CANDIDATE_BATCH,
        }
    }
}

impl IdAllocator {
    pub fn new(range: RangeInclusive<i64>, batch: usize) -> Self {
        Self {
            range,
            batch: batch.max(1),
        }
    }

    fn candidates(&self) -> Vec<i64> {
        let mut rng = rand::thread_rng();
        let mut out: Vec<i64> = Vec::with_capacity(self.batch);
        while out.len() < self.batch {
            let id = rng.gen_range(self.range.clone());
            if !out.contains(&id) {
                out.push(id);
            }
            // Tiny ranges (tests) cannot fill a whole batch with distinct ids
            if out.len() as u128 >= self.range_len() {
                break;
            }
        }
        out
    }

    fn range_len(&self) -> u128 {
        (*self.range.end() as i128 - *self.range.start() as i128 + 1).max(0) as u128
    }

    /// An id not used by any document of `entity` in `db`
    pub async fn allocate(
        &self,
        store: &dyn MirrorStore,
        db: LogicalDb,
        entity: Entity,
    ) -> Result<i64> {
        let mut rounds = 0u32;
        loop {
            rounds += 1;
            let candidates = self.candidates();
            let taken: Vec<i64> = store
                .find(
                    db,
                    entity,
                    doc! { "_id": { "$in": candidates.clone() } },
                    FindSpec::projection(doc! { "_id": 1 }),
                )
                .await?
                .iter()
                .filter_map(doc_id)
                .collect();

            if let Some(id) = candidates.into_iter().find(|c| !taken.contains(c)) {
                if rounds > 1 {
                    debug!(
                        collection = entity.collection_name(),
                        rounds, "Identifier allocated after collisions"
                    );
                }
                return Ok(id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;

    #[tokio::test]
    async fn test_allocates_in_range() {
        let store = MemoryStore::default();
        let ids = IdAllocator::default();
        let id = ids
            .allocate(&store, LogicalDb::General, Entity::PostInfo)
            .await
            .unwrap();
        assert!(ID_RANGE.contains(&id));
    }

    #[tokio::test]
    async fn test_skips_used_ids() {
        let store = MemoryStore::default();
        for id in 1..=4_i64 {
            let account = doc! { "_id": id, "name": format!("u{}", id) };
            store
                .insert_one(LogicalDb::General, Entity::AccountInfo, account)
                .await
                .unwrap();
        }
        let ids = IdAllocator::new(1..=5, 8);
        for _ in 0..10 {
            let id = ids
                .allocate(&store, LogicalDb::General, Entity::AccountInfo)
                .await
                .unwrap();
            assert_eq!(id, 5);
        }
    }
}
