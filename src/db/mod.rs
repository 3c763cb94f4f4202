//! Database layer for the mirror
//!
//! MongoDB client, schema definitions and the store abstraction shared by
//! the listener, repair pass and backfill pool.

pub mod memory;
pub mod mongo;
pub mod query;
pub mod schemas;
pub mod store;

pub use memory::MemoryStore;
pub use mongo::{IntoIndexes, MongoClient};
pub use store::{
    doc_id, find_one_typed, insert_typed, BulkOutcome, Entity, FindSpec, LogicalDb, MirrorStore,
    UpdateSummary, WriteOp,
};
