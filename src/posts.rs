//! Post mutation interface
//!
//! The only way post facets are written or removed. Creation writes the
//! identity facet first; once it lands the post is committed and the
//! other three facets follow concurrently. Deletion removes the three
//! dependent facets before the identity so an interrupted delete still
//! shows up as a count mismatch for the repair pass.

use std::sync::Arc;

use bson::{doc, DateTime, Document};
use tracing::{debug, warn};

use crate::db::schemas::{PostDataDoc, PostInfoDoc, PostRawDoc, PostTextDoc};
use crate::db::{doc_id, find_one_typed, insert_typed, Entity, FindSpec, LogicalDb, MirrorStore};
use crate::types::{MirrorError, Result};

/// All four facets of one post
#[derive(Debug, Clone, PartialEq)]
pub struct PostRecord {
    pub info: PostInfoDoc,
    pub text: PostTextDoc,
    pub data: PostDataDoc,
    pub raw: PostRawDoc,
}

impl PostRecord {
    pub fn id(&self) -> i64 {
        self.info._id
    }

    pub fn timestamp(&self) -> DateTime {
        self.info.timestamp
    }
}

/// Result of a create call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    /// Identity already present; nothing written
    AlreadyExists,
}

#[derive(Clone)]
pub struct Posts {
    store: Arc<dyn MirrorStore>,
}

impl Posts {
    pub fn new(store: Arc<dyn MirrorStore>) -> Self {
        Self { store }
    }

    pub async fn find_identity(
        &self,
        db: LogicalDb,
        author: &str,
        permlink: &str,
    ) -> Result<Option<PostInfoDoc>> {
        find_one_typed(
            self.store.as_ref(),
            db,
            Entity::PostInfo,
            post_filter(author, permlink),
        )
        .await
    }

    pub async fn text(&self, db: LogicalDb, id: i64) -> Result<Option<PostTextDoc>> {
        find_one_typed(self.store.as_ref(), db, Entity::PostText, doc! { "_id": id }).await
    }

    pub async fn data(&self, db: LogicalDb, id: i64) -> Result<Option<PostDataDoc>> {
        find_one_typed(self.store.as_ref(), db, Entity::PostData, doc! { "_id": id }).await
    }

    pub async fn raw(&self, db: LogicalDb, id: i64) -> Result<Option<PostRawDoc>> {
        find_one_typed(self.store.as_ref(), db, Entity::PostRaw, doc! { "_id": id }).await
    }

    /// Ids of every post by `author`
    pub async fn ids_by_author(&self, db: LogicalDb, author: &str) -> Result<Vec<i64>> {
        let docs = self
            .store
            .find(
                db,
                Entity::PostInfo,
                doc! { "author": author },
                FindSpec::projection(doc! { "_id": 1 }),
            )
            .await?;
        Ok(docs.iter().filter_map(doc_id).collect())
    }

    /// Write all four facets, identity first
    pub async fn create(&self, db: LogicalDb, record: &PostRecord) -> Result<CreateOutcome> {
        let store = self.store.as_ref();
        match insert_typed(store, db, Entity::PostInfo, &record.info).await {
            Ok(()) => {}
            Err(e) if e.is_duplicate() => {
                debug!(
                    author = %record.info.author,
                    permlink = %record.info.permlink,
                    "Post identity already present"
                );
                return Ok(CreateOutcome::AlreadyExists);
            }
            Err(e) => return Err(e),
        }

        let (text, data, raw) = tokio::join!(
            insert_typed(store, db, Entity::PostText, &record.text),
            insert_typed(store, db, Entity::PostData, &record.data),
            insert_typed(store, db, Entity::PostRaw, &record.raw),
        );

        let failures: Vec<String> = [text, data, raw]
            .into_iter()
            .filter_map(|r| r.err())
            .filter(|e| !e.is_duplicate())
            .map(|e| e.to_string())
            .collect();

        if !failures.is_empty() {
            warn!(
                post_id = record.id(),
                "Partial post write left for repair: {}",
                failures.join("; ")
            );
            return Err(MirrorError::Database(format!(
                "partial write of post {}: {}",
                record.id(),
                failures.join("; ")
            )));
        }

        Ok(CreateOutcome::Created)
    }

    /// Delete all facets of `ids`, returning how many identities went away
    pub async fn delete(&self, db: LogicalDb, ids: &[i64]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let filter = doc! { "_id": { "$in": ids.to_vec() } };
        let store = self.store.as_ref();
        let (text, data, raw) = tokio::join!(
            store.delete_many(db, Entity::PostText, filter.clone()),
            store.delete_many(db, Entity::PostData, filter.clone()),
            store.delete_many(db, Entity::PostRaw, filter.clone()),
        );
        text?;
        data?;
        raw?;

        store.delete_many(db, Entity::PostInfo, filter).await
    }

    /// Replace the tag string and merge `tags` into the raw metadata tags
    pub async fn retag(
        &self,
        db: LogicalDb,
        id: i64,
        tag_str: &str,
        tags: &[String],
    ) -> Result<()> {
        let store = self.store.as_ref();
        let (text, raw) = tokio::join!(
            store.update_one(
                db,
                Entity::PostText,
                doc! { "_id": id },
                doc! { "$set": { "tag_str": tag_str } },
                false,
            ),
            store.update_one(
                db,
                Entity::PostRaw,
                doc! { "_id": id },
                doc! { "$addToSet": { "raw.json_metadata.tags": { "$each": tags.to_vec() } } },
                false,
            ),
        );
        text?;
        raw?;
        Ok(())
    }
}

/// Identity filter for a post
pub fn post_filter(author: &str, permlink: &str) -> Document {
    doc! { "author": author, "permlink": permlink }
}
