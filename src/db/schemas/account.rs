//! Account schemas
//!
//! `account_info` holds the permanent identity, `account_data` holds
//! moderation and backfill state that may be dropped and recreated.

use bson::{doc, DateTime, Document};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};

use crate::db::mongo::IntoIndexes;

/// Collection name for account identity
pub const ACCOUNT_INFO_COLLECTION: &str = "account_info";

/// Collection name for account data
pub const ACCOUNT_DATA_COLLECTION: &str = "account_data";

/// Public profile fields taken from account metadata
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct Profile {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub about: Option<String>,

    /// Display name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Profile {
    pub fn is_empty(&self) -> bool {
        self.location.is_none() && self.about.is_none() && self.name.is_none()
    }

    /// `$set` body merging only the present fields
    pub fn merge_fields(&self) -> Document {
        let mut set = Document::new();
        if let Some(location) = &self.location {
            set.insert("profile.location", location.clone());
        }
        if let Some(about) = &self.about {
            set.insert("profile.about", about.clone());
        }
        if let Some(name) = &self.name {
            set.insert("profile.name", name.clone());
        }
        set
    }
}

/// Account identity document
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct AccountInfoDoc {
    pub _id: i64,

    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile: Option<Profile>,
}

impl AccountInfoDoc {
    pub fn new(id: i64, name: &str) -> Self {
        Self {
            _id: id,
            name: name.to_string(),
            profile: None,
        }
    }
}

impl IntoIndexes for AccountInfoDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![(
            doc! { "name": 1 },
            Some(
                IndexOptions::builder()
                    .unique(true)
                    .name("name_unique".to_string())
                    .build(),
            ),
        )]
    }
}

/// Terms acceptance record
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Acceptance {
    pub timestamp: DateTime,
    pub trx_id: String,
}

/// Account data document
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct AccountDataDoc {
    pub _id: i64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub accept: Option<Acceptance>,

    /// Backfill currently running
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loading: Option<bool>,

    /// Backfill requested
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analyze: Option<bool>,

    /// Feed needs rebuilding downstream
    #[serde(skip_serializing_if = "Option::is_none")]
    pub make_feed: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_analyze: Option<DateTime>,
}

impl IntoIndexes for AccountDataDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![(
            doc! { "analyze": 1 },
            Some(
                IndexOptions::builder()
                    .name("analyze_index".to_string())
                    .sparse(true)
                    .build(),
            ),
        )]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_merge_fields_skips_missing() {
        let profile = Profile {
            location: Some("Berlin".into()),
            about: None,
            name: Some("Alice".into()),
        };
        let set = profile.merge_fields();
        assert_eq!(set.get_str("profile.location").unwrap(), "Berlin");
        assert_eq!(set.get_str("profile.name").unwrap(), "Alice");
        assert!(!set.contains_key("profile.about"));
    }

    #[test]
    fn test_account_info_omits_empty_profile() {
        let doc = bson::to_document(&AccountInfoDoc::new(5, "bob")).unwrap();
        assert!(!doc.contains_key("profile"));
        assert_eq!(doc.get_i64("_id").unwrap(), 5);
    }
}
