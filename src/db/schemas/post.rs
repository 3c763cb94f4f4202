//! Post facet schemas
//!
//! A post is stored as four documents sharing one integer `_id`:
//! identity (`post_info`), searchable text (`post_text`), derived data
//! (`post_data`) and the raw ledger payload (`post_raw`).

use bson::{doc, DateTime, Document};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};

use crate::db::mongo::IntoIndexes;

/// Collection name for post identity
pub const POST_INFO_COLLECTION: &str = "post_info";

/// Collection name for normalized post text
pub const POST_TEXT_COLLECTION: &str = "post_text";

/// Collection name for derived post data
pub const POST_DATA_COLLECTION: &str = "post_data";

/// Collection name for raw post payloads
pub const POST_RAW_COLLECTION: &str = "post_raw";

/// Identity facet
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PostInfoDoc {
    pub _id: i64,

    pub author: String,

    pub permlink: String,

    /// Community tag or first tag of the post
    #[serde(default)]
    pub parent_permlink: String,

    pub timestamp: DateTime,

    /// Image URLs, only kept in the image community mirror
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
}

impl IntoIndexes for PostInfoDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![
            (
                doc! { "author": 1, "permlink": 1 },
                Some(
                    IndexOptions::builder()
                        .unique(true)
                        .name("author_permlink_unique".to_string())
                        .build(),
                ),
            ),
            (
                doc! { "parent_permlink": 1, "timestamp": -1 },
                Some(
                    IndexOptions::builder()
                        .name("community_timestamp_index".to_string())
                        .build(),
                ),
            ),
            (
                doc! { "images": 1 },
                Some(
                    IndexOptions::builder()
                        .name("images_index".to_string())
                        .sparse(true)
                        .build(),
                ),
            ),
        ]
    }
}

/// Text facet, used for full-text search
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PostTextDoc {
    pub _id: i64,

    pub title: String,

    pub body: String,

    pub tag_str: String,

    pub timestamp: DateTime,
}

impl IntoIndexes for PostTextDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![(
            doc! { "title": "text", "body": "text", "tag_str": "text" },
            Some(
                IndexOptions::builder()
                    .name("text_search_index".to_string())
                    .default_language("none".to_string())
                    .build(),
            ),
        )]
    }
}

/// Derived facet
///
/// Categories, language and embeddings are filled by an external batch
/// process and start out null.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PostDataDoc {
    pub _id: i64,

    #[serde(default)]
    pub categories: Option<Vec<f64>>,

    #[serde(default)]
    pub lang: Option<Document>,

    #[serde(default)]
    pub doc_vectors: Option<Document>,

    /// Voter account ids (set semantics)
    #[serde(default)]
    pub votes: Vec<i64>,

    pub timestamp: DateTime,
}

impl IntoIndexes for PostDataDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![(
            doc! { "votes": 1 },
            Some(
                IndexOptions::builder()
                    .name("votes_index".to_string())
                    .build(),
            ),
        )]
    }
}

/// Plain-text rendering kept next to the raw payload
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct PlainText {
    pub body: String,
}

/// Raw facet
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PostRawDoc {
    pub _id: i64,

    pub timestamp: DateTime,

    /// The comment operation as delivered, metadata parsed
    pub raw: Document,

    pub plain: PlainText,
}

impl IntoIndexes for PostRawDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![]
    }
}
