//! Database schemas for the mirror
//!
//! Defines MongoDB document structures for post facets, accounts, bans
//! and the block cursor.

mod account;
mod ban;
mod cursor;
mod post;

pub use account::{
    AccountDataDoc, AccountInfoDoc, Acceptance, Profile, ACCOUNT_DATA_COLLECTION,
    ACCOUNT_INFO_COLLECTION,
};
pub use ban::{BanDoc, BANNED_COLLECTION};
pub use cursor::{CursorDoc, CURSOR_TAG, STATS_COLLECTION};
pub use post::{
    PlainText, PostDataDoc, PostInfoDoc, PostRawDoc, PostTextDoc, POST_DATA_COLLECTION,
    POST_INFO_COLLECTION, POST_RAW_COLLECTION, POST_TEXT_COLLECTION,
};

use bson::Document;
use mongodb::options::IndexOptions;

use super::mongo::IntoIndexes;
use super::store::Entity;

/// Index definitions of the schema stored in `entity`
pub fn indexes_for(entity: Entity) -> Vec<(Document, Option<IndexOptions>)> {
    match entity {
        Entity::PostInfo => PostInfoDoc::into_indices(),
        Entity::PostText => PostTextDoc::into_indices(),
        Entity::PostData => PostDataDoc::into_indices(),
        Entity::PostRaw => PostRawDoc::into_indices(),
        Entity::AccountInfo => AccountInfoDoc::into_indices(),
        Entity::AccountData => AccountDataDoc::into_indices(),
        Entity::Banned => BanDoc::into_indices(),
        Entity::Stats => CursorDoc::into_indices(),
    }
}

/// Key sets of the unique indexes on `entity`, excluding `_id`
pub fn unique_keys(entity: Entity) -> Vec<Vec<String>> {
    indexes_for(entity)
        .into_iter()
        .filter(|(_, opts)| opts.as_ref().and_then(|o| o.unique).unwrap_or(false))
        .map(|(keys, _)| keys.keys().cloned().collect())
        .collect()
}
