//! Mirror store abstraction
//!
//! Every read and write of the mirror goes through [`MirrorStore`]. Two
//! implementations exist: [`super::MongoClient`] for production and
//! [`super::MemoryStore`] for dev mode and tests. Both speak the same
//! BSON filter/update dialect, restricted to the operators the pipeline
//! uses.

use async_trait::async_trait;
use bson::Document;
use serde::{de::DeserializeOwned, Serialize};

use super::schemas::{
    ACCOUNT_DATA_COLLECTION, ACCOUNT_INFO_COLLECTION, BANNED_COLLECTION, POST_DATA_COLLECTION,
    POST_INFO_COLLECTION, POST_RAW_COLLECTION, POST_TEXT_COLLECTION, STATS_COLLECTION,
};
use crate::types::Result;

/// Logical database inside one MongoDB deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LogicalDb {
    /// The general mirror
    General,
    /// The image community mirror (same shapes)
    Images,
}

impl LogicalDb {
    pub const ALL: [LogicalDb; 2] = [LogicalDb::General, LogicalDb::Images];
}

/// Named entity collection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Entity {
    PostInfo,
    PostText,
    PostData,
    PostRaw,
    AccountInfo,
    AccountData,
    Banned,
    Stats,
}

impl Entity {
    /// The four post facets, identity first
    pub const POST_FACETS: [Entity; 4] = [
        Entity::PostInfo,
        Entity::PostText,
        Entity::PostData,
        Entity::PostRaw,
    ];

    pub const ALL: [Entity; 8] = [
        Entity::PostInfo,
        Entity::PostText,
        Entity::PostData,
        Entity::PostRaw,
        Entity::AccountInfo,
        Entity::AccountData,
        Entity::Banned,
        Entity::Stats,
    ];

    /// MongoDB collection name
    pub fn collection_name(&self) -> &'static str {
        match self {
            Entity::PostInfo => POST_INFO_COLLECTION,
            Entity::PostText => POST_TEXT_COLLECTION,
            Entity::PostData => POST_DATA_COLLECTION,
            Entity::PostRaw => POST_RAW_COLLECTION,
            Entity::AccountInfo => ACCOUNT_INFO_COLLECTION,
            Entity::AccountData => ACCOUNT_DATA_COLLECTION,
            Entity::Banned => BANNED_COLLECTION,
            Entity::Stats => STATS_COLLECTION,
        }
    }
}

/// Options for `find`
#[derive(Debug, Clone, Default)]
pub struct FindSpec {
    pub projection: Option<Document>,
    pub sort: Option<Document>,
    pub limit: Option<i64>,
    pub skip: Option<u64>,
}

impl FindSpec {
    pub fn projection(projection: Document) -> Self {
        Self {
            projection: Some(projection),
            ..Default::default()
        }
    }

    pub fn sort(mut self, sort: Document) -> Self {
        self.sort = Some(sort);
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// One write inside a bulk request
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    InsertOne(Document),
    UpdateOne {
        filter: Document,
        update: Document,
        upsert: bool,
    },
    UpdateMany {
        filter: Document,
        update: Document,
    },
    DeleteMany {
        filter: Document,
    },
}

/// Result of a single update call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateSummary {
    pub matched: u64,
    pub modified: u64,
    pub upserted: bool,
}

/// Result of an unordered bulk write
///
/// Duplicate-key failures on inserts are counted, not raised.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkOutcome {
    pub inserted: u64,
    pub matched: u64,
    pub modified: u64,
    pub upserted: u64,
    pub deleted: u64,
    pub duplicates: u64,
}

impl BulkOutcome {
    pub fn absorb(&mut self, other: BulkOutcome) {
        self.inserted += other.inserted;
        self.matched += other.matched;
        self.modified += other.modified;
        self.upserted += other.upserted;
        self.deleted += other.deleted;
        self.duplicates += other.duplicates;
    }
}

/// Storage primitives over named entity collections
#[async_trait]
pub trait MirrorStore: Send + Sync {
    async fn find_one(
        &self,
        db: LogicalDb,
        entity: Entity,
        filter: Document,
    ) -> Result<Option<Document>>;

    async fn find(
        &self,
        db: LogicalDb,
        entity: Entity,
        filter: Document,
        spec: FindSpec,
    ) -> Result<Vec<Document>>;

    /// Insert one document, `MirrorError::Duplicate` on a unique-key conflict
    async fn insert_one(&self, db: LogicalDb, entity: Entity, doc: Document) -> Result<()>;

    async fn update_one(
        &self,
        db: LogicalDb,
        entity: Entity,
        filter: Document,
        update: Document,
        upsert: bool,
    ) -> Result<UpdateSummary>;

    async fn update_many(
        &self,
        db: LogicalDb,
        entity: Entity,
        filter: Document,
        update: Document,
    ) -> Result<UpdateSummary>;

    async fn delete_many(&self, db: LogicalDb, entity: Entity, filter: Document) -> Result<u64>;

    /// Unordered bulk write against one collection
    async fn bulk_write(
        &self,
        db: LogicalDb,
        entity: Entity,
        ops: Vec<WriteOp>,
    ) -> Result<BulkOutcome>;

    async fn count(&self, db: LogicalDb, entity: Entity, filter: Document) -> Result<u64>;
}

/// Find one document and decode it
pub async fn find_one_typed<T: DeserializeOwned>(
    store: &dyn MirrorStore,
    db: LogicalDb,
    entity: Entity,
    filter: Document,
) -> Result<Option<T>> {
    match store.find_one(db, entity, filter).await? {
        Some(doc) => Ok(Some(bson::from_document(doc)?)),
        None => Ok(None),
    }
}

/// Encode and insert one document
pub async fn insert_typed<T: Serialize>(
    store: &dyn MirrorStore,
    db: LogicalDb,
    entity: Entity,
    value: &T,
) -> Result<()> {
    let doc = bson::to_document(value)?;
    store.insert_one(db, entity, doc).await
}

/// Read the `_id` of a document as an integer id
pub fn doc_id(doc: &Document) -> Option<i64> {
    match doc.get("_id")? {
        bson::Bson::Int64(v) => Some(*v),
        bson::Bson::Int32(v) => Some(i64::from(*v)),
        _ => None,
    }
}
