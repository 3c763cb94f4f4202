//! Ledger RPC access
//!
//! `HttpLedger` talks JSON-RPC 2.0 to a pool of equivalent nodes;
//! `ScriptedLedger` serves seeded data for dev runs and tests.

pub mod client;
pub mod retry;
pub mod scripted;
pub mod types;

pub use client::{HttpLedger, Ledger};
pub use retry::{retry, RetryPolicy};
pub use scripted::ScriptedLedger;
pub use types::{
    parse_ledger_time, AccountUpdateOp, BlockOperation, BlockOperations, CommentOp, Content,
    CustomJsonOp, Envelope, HistoryEntry, Operation, VoteOp,
};
