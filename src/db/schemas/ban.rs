//! Ban list schema
//!
//! An entry bans either a whole account (`name`) or a single post
//! (`author` + `permlink`).

use bson::{doc, Document};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};

use crate::db::mongo::IntoIndexes;

/// Collection name for bans
pub const BANNED_COLLECTION: &str = "banned";

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct BanDoc {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub permlink: Option<String>,
}

impl BanDoc {
    pub fn account(name: &str) -> Self {
        Self {
            name: Some(name.to_string()),
            ..Default::default()
        }
    }

    pub fn post(author: &str, permlink: &str) -> Self {
        Self {
            name: None,
            author: Some(author.to_string()),
            permlink: Some(permlink.to_string()),
        }
    }
}

impl IntoIndexes for BanDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![
            (
                doc! { "name": 1 },
                Some(
                    IndexOptions::builder()
                        .name("name_index".to_string())
                        .sparse(true)
                        .build(),
                ),
            ),
            (
                doc! { "author": 1, "permlink": 1 },
                Some(
                    IndexOptions::builder()
                        .name("author_permlink_index".to_string())
                        .sparse(true)
                        .build(),
                ),
            ),
        ]
    }
}
