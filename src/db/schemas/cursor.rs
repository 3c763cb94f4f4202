//! Block cursor schema

use bson::{doc, Document};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};

use crate::db::mongo::IntoIndexes;

/// Collection name for pipeline stats
pub const STATS_COLLECTION: &str = "stats";

/// Tag of the block cursor document
pub const CURSOR_TAG: &str = "CURRENT_BLOCK_NUM";

/// Highest fully processed block
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct CursorDoc {
    pub tag: String,
    pub current_num: i64,
}

impl IntoIndexes for CursorDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![(
            doc! { "tag": 1 },
            Some(
                IndexOptions::builder()
                    .unique(true)
                    .name("tag_unique".to_string())
                    .build(),
            ),
        )]
    }
}
