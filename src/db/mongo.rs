//! MongoDB client and mirror store implementation
//!
//! One client serves both logical databases. Bulk writes are issued as raw
//! `insert`/`update`/`delete` commands with `ordered: false` so a block's
//! vote or profile mutations cost one round trip per kind and work on any
//! server version.

use async_trait::async_trait;
use bson::{doc, Bson, Document};
use futures_util::TryStreamExt;
use mongodb::{
    options::{FindOptions, IndexOptions, UpdateOptions},
    Client, Collection, IndexModel,
};
use tracing::{debug, info, warn};

use super::schemas::indexes_for;
use super::store::{BulkOutcome, Entity, FindSpec, LogicalDb, MirrorStore, UpdateSummary, WriteOp};
use crate::types::error::DUPLICATE_KEY_CODE;
use crate::types::{MirrorError, Result};

/// Trait for schemas that provide index definitions
pub trait IntoIndexes {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)>;
}

/// MongoDB client wrapper
#[derive(Clone)]
pub struct MongoClient {
    client: Client,
    general_db: String,
    images_db: String,
}

impl MongoClient {
    /// Connect and verify the deployment answers
    pub async fn new(uri: &str, general_db: &str, images_db: &str) -> Result<Self> {
        info!("Connecting to MongoDB at {}", uri);

        // Use serverSelectionTimeoutMS to avoid hanging on unreachable MongoDB
        let timeout_uri = if uri.contains('?') {
            format!("{}&serverSelectionTimeoutMS=3000&connectTimeoutMS=3000", uri)
        } else {
            format!("{}?serverSelectionTimeoutMS=3000&connectTimeoutMS=3000", uri)
        };

        let client = Client::with_uri_str(&timeout_uri)
            .await
            .map_err(|e| MirrorError::Database(format!("Failed to connect to MongoDB: {}", e)))?;

        client
            .database(general_db)
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| MirrorError::Database(format!("MongoDB ping failed: {}", e)))?;

        info!(
            "Connected to MongoDB databases '{}' and '{}'",
            general_db, images_db
        );

        Ok(Self {
            client,
            general_db: general_db.to_string(),
            images_db: images_db.to_string(),
        })
    }

    /// Database name backing a logical database
    pub fn db_name(&self, db: LogicalDb) -> &str {
        match db {
            LogicalDb::General => &self.general_db,
            LogicalDb::Images => &self.images_db,
        }
    }

    fn collection(&self, db: LogicalDb, entity: Entity) -> Collection<Document> {
        self.client
            .database(self.db_name(db))
            .collection::<Document>(entity.collection_name())
    }

    /// Create schema-defined indexes in both logical databases
    ///
    /// Failures are logged and skipped; an index that already exists with
    /// different options should not stop ingestion.
    pub async fn ensure_indexes(&self) {
        for db in LogicalDb::ALL {
            for entity in Entity::ALL {
                let indices: Vec<IndexModel> = indexes_for(entity)
                    .into_iter()
                    .map(|(keys, opts)| IndexModel::builder().keys(keys).options(opts).build())
                    .collect();

                if indices.is_empty() {
                    continue;
                }

                if let Err(e) = self.collection(db, entity).create_indexes(indices).await {
                    warn!(
                        db = self.db_name(db),
                        collection = entity.collection_name(),
                        "Failed to create indexes: {}",
                        e
                    );
                }
            }
        }
    }

    async fn run_write_command(&self, db: LogicalDb, command: Document) -> Result<Document> {
        self.client
            .database(self.db_name(db))
            .run_command(command)
            .await
            .map_err(MirrorError::from)
    }
}

/// Split a write command response into (n, nModified, upserted, duplicates)
fn read_write_response(response: &Document) -> Result<(u64, u64, u64, u64)> {
    let n = number(response.get("n"));
    let modified = number(response.get("nModified"));
    let upserted = response
        .get_array("upserted")
        .map(|a| a.len() as u64)
        .unwrap_or(0);

    let mut duplicates = 0;
    if let Ok(errors) = response.get_array("writeErrors") {
        for error in errors.iter().filter_map(Bson::as_document) {
            let code = number(error.get("code")) as i32;
            if code == DUPLICATE_KEY_CODE {
                duplicates += 1;
            } else {
                let message = error.get_str("errmsg").unwrap_or("unknown write error");
                return Err(MirrorError::Database(format!(
                    "bulk write error {}: {}",
                    code, message
                )));
            }
        }
    }

    Ok((n, modified, upserted, duplicates))
}

fn number(value: Option<&Bson>) -> u64 {
    match value {
        Some(Bson::Int32(v)) => (*v).max(0) as u64,
        Some(Bson::Int64(v)) => (*v).max(0) as u64,
        Some(Bson::Double(v)) => v.max(0.0) as u64,
        _ => 0,
    }
}

#[async_trait]
impl MirrorStore for MongoClient {
    async fn find_one(
        &self,
        db: LogicalDb,
        entity: Entity,
        filter: Document,
    ) -> Result<Option<Document>> {
        self.collection(db, entity)
            .find_one(filter)
            .await
            .map_err(|e| MirrorError::Database(format!("Find failed: {}", e)))
    }

    async fn find(
        &self,
        db: LogicalDb,
        entity: Entity,
        filter: Document,
        spec: FindSpec,
    ) -> Result<Vec<Document>> {
        let options = FindOptions::builder()
            .projection(spec.projection)
            .sort(spec.sort)
            .limit(spec.limit)
            .skip(spec.skip)
            .build();

        let cursor = self
            .collection(db, entity)
            .find(filter)
            .with_options(options)
            .await
            .map_err(|e| MirrorError::Database(format!("Find failed: {}", e)))?;

        cursor
            .try_collect()
            .await
            .map_err(|e| MirrorError::Database(format!("Cursor read failed: {}", e)))
    }

    async fn insert_one(&self, db: LogicalDb, entity: Entity, doc: Document) -> Result<()> {
        self.collection(db, entity).insert_one(doc).await?;
        Ok(())
    }

    async fn update_one(
        &self,
        db: LogicalDb,
        entity: Entity,
        filter: Document,
        update: Document,
        upsert: bool,
    ) -> Result<UpdateSummary> {
        let result = self
            .collection(db, entity)
            .update_one(filter, update)
            .with_options(UpdateOptions::builder().upsert(upsert).build())
            .await?;

        Ok(UpdateSummary {
            matched: result.matched_count,
            modified: result.modified_count,
            upserted: result.upserted_id.is_some(),
        })
    }

    async fn update_many(
        &self,
        db: LogicalDb,
        entity: Entity,
        filter: Document,
        update: Document,
    ) -> Result<UpdateSummary> {
        let result = self
            .collection(db, entity)
            .update_many(filter, update)
            .await?;

        Ok(UpdateSummary {
            matched: result.matched_count,
            modified: result.modified_count,
            upserted: false,
        })
    }

    async fn delete_many(&self, db: LogicalDb, entity: Entity, filter: Document) -> Result<u64> {
        let result = self.collection(db, entity).delete_many(filter).await?;
        Ok(result.deleted_count)
    }

    async fn bulk_write(
        &self,
        db: LogicalDb,
        entity: Entity,
        ops: Vec<WriteOp>,
    ) -> Result<BulkOutcome> {
        let collection = entity.collection_name();
        let mut inserts = Vec::new();
        let mut updates = Vec::new();
        let mut deletes = Vec::new();

        for op in ops {
            match op {
                WriteOp::InsertOne(doc) => inserts.push(Bson::Document(doc)),
                WriteOp::UpdateOne {
                    filter,
                    update,
                    upsert,
                } => updates.push(Bson::Document(
                    doc! { "q": filter, "u": update, "upsert": upsert, "multi": false },
                )),
                WriteOp::UpdateMany { filter, update } => updates.push(Bson::Document(
                    doc! { "q": filter, "u": update, "upsert": false, "multi": true },
                )),
                WriteOp::DeleteMany { filter } => {
                    deletes.push(Bson::Document(doc! { "q": filter, "limit": 0 }))
                }
            }
        }

        let mut outcome = BulkOutcome::default();

        if !inserts.is_empty() {
            let response = self
                .run_write_command(
                    db,
                    doc! { "insert": collection, "documents": inserts, "ordered": false },
                )
                .await?;
            let (n, _, _, duplicates) = read_write_response(&response)?;
            outcome.inserted += n;
            outcome.duplicates += duplicates;
        }

        if !updates.is_empty() {
            let response = self
                .run_write_command(
                    db,
                    doc! { "update": collection, "updates": updates, "ordered": false },
                )
                .await?;
            let (n, modified, upserted, _) = read_write_response(&response)?;
            outcome.matched += n.saturating_sub(upserted);
            outcome.modified += modified;
            outcome.upserted += upserted;
        }

        if !deletes.is_empty() {
            let response = self
                .run_write_command(
                    db,
                    doc! { "delete": collection, "deletes": deletes, "ordered": false },
                )
                .await?;
            let (n, _, _, _) = read_write_response(&response)?;
            outcome.deleted += n;
        }

        debug!(
            db = self.db_name(db),
            collection,
            inserted = outcome.inserted,
            modified = outcome.modified,
            duplicates = outcome.duplicates,
            "Bulk write applied"
        );

        Ok(outcome)
    }

    async fn count(&self, db: LogicalDb, entity: Entity, filter: Document) -> Result<u64> {
        let collection = self.collection(db, entity);
        // Exact count; collection metadata can be stale after an unclean shutdown
        Ok(collection.count_documents(filter).await?)
    }
}

#[cfg(test)]
mod tests {
    // Store behavior is exercised against MemoryStore; these cover the
    // command response parsing only.
    use super::*;

    #[test]
    fn test_read_write_response_counts_duplicates() {
        let response = doc! {
            "n": 3,
            "ok": 1.0,
            "writeErrors": [
                { "index": 1, "code": 11000, "errmsg": "E11000 duplicate key" },
            ],
        };
        let (n, modified, upserted, duplicates) = read_write_response(&response).unwrap();
        assert_eq!((n, modified, upserted, duplicates), (3, 0, 0, 1));
    }

    #[test]
    fn test_read_write_response_rejects_other_errors() {
        let response = doc! {
            "n": 0,
            "writeErrors": [ { "index": 0, "code": 121, "errmsg": "validation failed" } ],
        };
        assert!(read_write_response(&response).is_err());
    }

    #[test]
    fn test_update_response_upserts() {
        let response = doc! { "n": 2_i64, "nModified": 1, "upserted": [ { "index": 0, "_id": 5 } ] };
        let (n, modified, upserted, _) = read_write_response(&response).unwrap();
        assert_eq!((n, modified, upserted), (2, 1, 1));
    }
}
