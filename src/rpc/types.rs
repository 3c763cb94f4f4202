//! Ledger operation model
//!
//! Block and history payloads carry loosely typed JSON. They are decoded
//! into [`Operation`], a closed set of the operation kinds the mirror acts
//! on. Everything else becomes [`Operation::Other`], and payloads of a
//! known kind that fail to decode become [`Operation::Unparsed`] so a
//! single bad operation never takes down its block.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::types::{MirrorError, Result};

/// A top-level post or a reply
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommentOp {
    #[serde(default)]
    pub parent_author: String,
    #[serde(default)]
    pub parent_permlink: String,
    pub author: String,
    pub permlink: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub json_metadata: String,
}

impl CommentOp {
    pub fn is_reply(&self) -> bool {
        !self.parent_author.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VoteOp {
    pub voter: String,
    pub author: String,
    pub permlink: String,
    #[serde(default)]
    pub weight: i64,
}

impl VoteOp {
    /// A zero or negative weight withdraws a previous upvote
    pub fn is_upvote(&self) -> bool {
        self.weight > 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccountUpdateOp {
    pub account: String,
    #[serde(default)]
    pub json_metadata: String,
    #[serde(default)]
    pub posting_json_metadata: String,
}

impl AccountUpdateOp {
    /// Metadata carrying the profile; posting metadata wins when present
    pub fn profile_metadata(&self) -> &str {
        if self.posting_json_metadata.trim().is_empty() {
            &self.json_metadata
        } else {
            &self.posting_json_metadata
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CustomJsonOp {
    #[serde(default)]
    pub required_auths: Vec<String>,
    #[serde(default)]
    pub required_posting_auths: Vec<String>,
    pub id: String,
    #[serde(default)]
    pub json: String,
}

impl CustomJsonOp {
    /// The account acting through this operation
    pub fn acting_account(&self) -> Option<&str> {
        self.required_posting_auths
            .first()
            .or_else(|| self.required_auths.first())
            .map(String::as_str)
    }
}

/// Decoded ledger operation
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Comment(CommentOp),
    Vote(VoteOp),
    AccountUpdate(AccountUpdateOp),
    CustomJson(CustomJsonOp),
    /// A kind the mirror does not act on
    Other(String),
    /// A recognized kind whose payload could not be decoded
    Unparsed { kind: String, reason: String },
}

impl Operation {
    /// Decode from the operation name and its payload
    ///
    /// Names may carry the `_operation` suffix used by the history API.
    pub fn from_parts(name: &str, payload: Value) -> Self {
        let kind = name.strip_suffix("_operation").unwrap_or(name);
        let decoded = match kind {
            "comment" => serde_json::from_value(payload).map(Operation::Comment),
            "vote" => serde_json::from_value(payload).map(Operation::Vote),
            "account_update" | "account_update2" => {
                serde_json::from_value(payload).map(Operation::AccountUpdate)
            }
            "custom_json" => serde_json::from_value(payload).map(Operation::CustomJson),
            other => return Operation::Other(other.to_string()),
        };

        decoded.unwrap_or_else(|e| Operation::Unparsed {
            kind: kind.to_string(),
            reason: e.to_string(),
        })
    }

    /// Decode from either wire shape: `["vote", {..}]` or `{"type": "vote_operation", "value": {..}}`
    pub fn from_wire(value: Value) -> Self {
        match value {
            Value::Array(mut parts) if parts.len() == 2 => {
                let payload = parts.pop().unwrap_or(Value::Null);
                match parts.pop() {
                    Some(Value::String(name)) => Self::from_parts(&name, payload),
                    _ => Self::unparsed("array operation without a name"),
                }
            }
            Value::Object(mut map) => {
                let payload = map.remove("value").unwrap_or(Value::Null);
                match map.remove("type") {
                    Some(Value::String(name)) => Self::from_parts(&name, payload),
                    _ => Self::unparsed("object operation without a type"),
                }
            }
            _ => Self::unparsed("unrecognized operation shape"),
        }
    }

    fn unparsed(reason: &str) -> Self {
        Operation::Unparsed {
            kind: "unknown".to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Parse a ledger timestamp (`2021-06-01T12:00:00`, UTC without offset)
pub fn parse_ledger_time(raw: &str) -> Result<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S")
        .map(|naive| naive.and_utc())
        .or_else(|_| DateTime::parse_from_rfc3339(raw).map(|dt| dt.with_timezone(&Utc)))
        .map_err(|e| MirrorError::Malformed(format!("bad timestamp '{}': {}", raw, e)))
}

fn de_ledger_time<'de, D>(deserializer: D) -> std::result::Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_ledger_time(&raw).map_err(serde::de::Error::custom)
}

fn de_operation<'de, D>(deserializer: D) -> std::result::Result<Operation, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Operation::from_wire)
}

/// One operation inside a block
#[derive(Debug, Clone, Deserialize)]
pub struct BlockOperation {
    #[serde(default)]
    pub trx_id: String,
    pub block: u64,
    #[serde(deserialize_with = "de_ledger_time")]
    pub timestamp: DateTime<Utc>,
    #[serde(deserialize_with = "de_operation")]
    pub op: Operation,
}

/// All operations of one block, in ledger order
#[derive(Debug, Clone)]
pub struct BlockOperations {
    pub num: u64,
    pub operations: Vec<BlockOperation>,
}

/// An operation of a classified kind with its ledger position
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope<T> {
    pub block: u64,
    pub trx_id: String,
    pub timestamp: DateTime<Utc>,
    pub op: T,
}

/// Post content as returned by `get_content`
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Content {
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub permlink: String,
    #[serde(default)]
    pub parent_author: String,
    #[serde(default)]
    pub parent_permlink: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub json_metadata: String,
    #[serde(default)]
    pub created: String,
}

impl Content {
    /// The ledger answers unknown content with an empty record
    pub fn exists(&self) -> bool {
        !self.author.is_empty()
    }

    pub fn as_comment(&self) -> CommentOp {
        CommentOp {
            parent_author: self.parent_author.clone(),
            parent_permlink: self.parent_permlink.clone(),
            author: self.author.clone(),
            permlink: self.permlink.clone(),
            title: self.title.clone(),
            body: self.body.clone(),
            json_metadata: self.json_metadata.clone(),
        }
    }
}

/// Chain properties used to find the tip
#[derive(Debug, Clone, Deserialize)]
pub struct DynamicGlobalProperties {
    pub head_block_number: u64,
    pub last_irreversible_block_num: u64,
}

/// One entry of an account's operation history
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub id: i64,
    pub trx_id: String,
    pub timestamp: DateTime<Utc>,
    pub op: Operation,
}

#[derive(Debug, Deserialize)]
struct RawHistoryItem {
    #[serde(default)]
    trx_id: String,
    timestamp: String,
    op: Value,
}

/// Response body of `account_history_api.get_account_history`
#[derive(Debug, Deserialize)]
pub struct AccountHistory {
    history: Vec<(i64, RawHistoryItem)>,
}

impl AccountHistory {
    /// Entries in ascending id order, dropping items that do not decode
    pub fn into_entries(self) -> Vec<HistoryEntry> {
        let mut entries: Vec<HistoryEntry> = self
            .history
            .into_iter()
            .filter_map(|(id, item)| match parse_ledger_time(&item.timestamp) {
                Ok(timestamp) => Some(HistoryEntry {
                    id,
                    trx_id: item.trx_id,
                    timestamp,
                    op: Operation::from_wire(item.op),
                }),
                Err(e) => {
                    warn!(history_id = id, "Dropping malformed history entry: {}", e);
                    None
                }
            })
            .collect();
        entries.sort_by_key(|e| e.id);
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_condenser_vote() {
        let op = Operation::from_wire(json!([
            "vote",
            { "voter": "alice", "author": "bob", "permlink": "hello", "weight": 10000 }
        ]));
        match op {
            Operation::Vote(v) => {
                assert_eq!(v.voter, "alice");
                assert!(v.is_upvote());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_history_shape() {
        let op = Operation::from_wire(json!({
            "type": "vote_operation",
            "value": { "voter": "a", "author": "b", "permlink": "c", "weight": 0 }
        }));
        assert!(matches!(op, Operation::Vote(ref v) if !v.is_upvote()));
    }

    #[test]
    fn test_malformed_known_kind_is_unparsed() {
        let op = Operation::from_wire(json!(["comment", { "author": 5 }]));
        assert!(matches!(op, Operation::Unparsed { ref kind, .. } if kind == "comment"));
    }

    #[test]
    fn test_unknown_kind_is_other() {
        let op = Operation::from_wire(json!(["transfer", { "from": "a" }]));
        assert_eq!(op, Operation::Other("transfer".into()));
    }

    #[test]
    fn test_block_operation_deserialize() {
        let raw = json!({
            "trx_id": "abc",
            "block": 42,
            "trx_in_block": 0,
            "op_in_trx": 0,
            "virtual_op": 0,
            "timestamp": "2021-06-01T12:00:00",
            "op": ["custom_json", {
                "required_auths": [],
                "required_posting_auths": ["alice"],
                "id": "config_hive_discover",
                "json": "{\"cmd\":\"accept\"}"
            }]
        });
        let op: BlockOperation = serde_json::from_value(raw).unwrap();
        assert_eq!(op.block, 42);
        match op.op {
            Operation::CustomJson(c) => assert_eq!(c.acting_account(), Some("alice")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_account_history_sorted() {
        let raw = json!({ "history": [
            [7, { "trx_id": "t7", "timestamp": "2021-06-01T12:00:00", "op": { "type": "vote_operation", "value": { "voter": "a", "author": "b", "permlink": "c", "weight": 1 } } }],
            [3, { "trx_id": "t3", "timestamp": "2021-05-01T12:00:00", "op": { "type": "vote_operation", "value": { "voter": "a", "author": "b", "permlink": "d", "weight": 1 } } }]
        ]});
        let history: AccountHistory = serde_json::from_value(raw).unwrap();
        let entries = history.into_entries();
        assert_eq!(entries.iter().map(|e| e.id).collect::<Vec<_>>(), vec![3, 7]);
    }

    #[test]
    fn test_bad_history_timestamp_drops_only_that_entry() {
        let raw = json!({ "history": [
            [4, { "trx_id": "t4", "timestamp": "yesterday", "op": { "type": "vote_operation", "value": { "voter": "a", "author": "b", "permlink": "c", "weight": 1 } } }],
            [5, { "trx_id": "t5", "timestamp": "2021-06-01T12:00:00", "op": { "type": "vote_operation", "value": { "voter": "a", "author": "b", "permlink": "d", "weight": 1 } } }]
        ]});
        let history: AccountHistory = serde_json::from_value(raw).unwrap();
        let entries = history.into_entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, 5);
        assert_eq!(entries[0].trx_id, "t5");
    }

    #[test]
    fn test_posting_metadata_preferred() {
        let op = AccountUpdateOp {
            account: "a".into(),
            json_metadata: "{}".into(),
            posting_json_metadata: "{\"profile\":{}}".into(),
        };
        assert_eq!(op.profile_metadata(), "{\"profile\":{}}");
    }
}
