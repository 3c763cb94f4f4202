//! Control command handler
//!
//! Custom-json operations in the command namespace carry account-level
//! commands: accepting the data policy, banning and unbanning. Commands
//! of one block run one after another in block order.

use bson::{doc, DateTime as BsonDateTime};
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use super::accounts::{find_account_id, is_banned_name, resolve_or_create};
use super::{HandlerReport, MirrorContext};
use crate::db::schemas::{Acceptance, BanDoc};
use crate::db::{insert_typed, Entity, LogicalDb};
use crate::rpc::{CustomJsonOp, Envelope};
use crate::types::Result;

/// Commands understood in the command namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "cmd", rename_all = "lowercase")]
pub enum ControlCommand {
    Accept,
    Ban,
    Unban,
}

impl ControlCommand {
    /// Decode a command payload; `None` for malformed or unknown commands
    pub fn parse(json: &str) -> Option<Self> {
        serde_json::from_str(json).ok()
    }
}

/// Handle the custom-json operations of one block
pub async fn handle_custom_json(
    ctx: &MirrorContext,
    operations: Vec<Envelope<CustomJsonOp>>,
) -> HandlerReport {
    let mut report = HandlerReport::default();

    for envelope in operations {
        if envelope.op.id != ctx.settings.command_namespace {
            report.skipped += 1;
            continue;
        }
        let Some(account) = envelope.op.acting_account().map(str::to_string) else {
            warn!(block = envelope.block, "Command without an acting account");
            report.skipped += 1;
            continue;
        };
        let Some(command) = ControlCommand::parse(&envelope.op.json) else {
            debug!(
                block = envelope.block,
                account = %account,
                json = %envelope.op.json,
                "Ignoring unrecognized command"
            );
            report.skipped += 1;
            continue;
        };

        let result = match command {
            ControlCommand::Accept => accept(ctx, &account, &envelope).await,
            ControlCommand::Ban => ban(ctx, &account).await,
            ControlCommand::Unban => unban(ctx, &account).await,
        };

        match result {
            Ok(()) => report.applied += 1,
            Err(e) => {
                error!(
                    block = envelope.block,
                    account = %account,
                    ?command,
                    "Error while handling command: {}",
                    e
                );
                report.failed += 1;
            }
        }
    }

    report
}

/// Lift any ban, make sure the account exists and record the acceptance
async fn accept(
    ctx: &MirrorContext,
    account: &str,
    envelope: &Envelope<CustomJsonOp>,
) -> Result<()> {
    let store = ctx.store.as_ref();
    store
        .delete_many(LogicalDb::General, Entity::Banned, doc! { "name": account })
        .await?;

    let Some(id) = resolve_or_create(ctx, account, None).await? else {
        return Ok(());
    };

    let acceptance = Acceptance {
        timestamp: BsonDateTime::from_chrono(envelope.timestamp),
        trx_id: envelope.trx_id.clone(),
    };
    let accept = bson::to_bson(&acceptance)?;
    let summary = store
        .update_one(
            LogicalDb::General,
            Entity::AccountData,
            doc! { "_id": id, "accept": { "$exists": false } },
            doc! { "$set": { "accept": accept.clone() } },
            false,
        )
        .await?;

    let recorded = if summary.matched > 0 {
        true
    } else {
        match store
            .insert_one(
                LogicalDb::General,
                Entity::AccountData,
                doc! { "_id": id, "accept": accept },
            )
            .await
        {
            Ok(()) => true,
            // Already accepted earlier
            Err(e) if e.is_duplicate() => false,
            Err(e) => return Err(e),
        }
    };

    if recorded {
        info!(account, id, trx_id = %envelope.trx_id, "Account accepted");
    }
    Ok(())
}

/// Record the ban, then remove the account and everything it contributed
///
/// The ban entry goes in first so concurrent handlers of the same block
/// stop admitting the account. A replay finds the entry and runs the
/// cascade again while anything of the account is left.
async fn ban(ctx: &MirrorContext, account: &str) -> Result<()> {
    let store = ctx.store.as_ref();
    let account_id = find_account_id(store, account).await?;

    if is_banned_name(store, account).await? {
        if account_id.is_none() && !has_posts(ctx, account).await? {
            debug!(account, "Already banned");
            return Ok(());
        }
        warn!(account, "Banned account still has data, resuming cascade");
    } else {
        match insert_typed(store, LogicalDb::General, Entity::Banned, &BanDoc::account(account))
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_duplicate() => {}
            Err(e) => return Err(e),
        }
    }

    let mut removed_posts = 0;
    for db in LogicalDb::ALL {
        let ids = ctx.posts.ids_by_author(db, account).await?;
        removed_posts += ctx.posts.delete(db, &ids).await?;

        if let Some(id) = account_id {
            store
                .update_many(
                    db,
                    Entity::PostData,
                    doc! { "votes": id },
                    doc! { "$pull": { "votes": id } },
                )
                .await?;
        }
    }

    if let Some(id) = account_id {
        store
            .delete_many(LogicalDb::General, Entity::AccountData, doc! { "_id": id })
            .await?;
        store
            .delete_many(LogicalDb::General, Entity::AccountInfo, doc! { "_id": id })
            .await?;
    }

    info!(account, removed_posts, "Account banned");
    Ok(())
}

async fn has_posts(ctx: &MirrorContext, account: &str) -> Result<bool> {
    for db in LogicalDb::ALL {
        if !ctx.posts.ids_by_author(db, account).await?.is_empty() {
            return Ok(true);
        }
    }
    Ok(false)
}

async fn unban(ctx: &MirrorContext, account: &str) -> Result<()> {
    let removed = ctx
        .store
        .delete_many(LogicalDb::General, Entity::Banned, doc! { "name": account })
        .await?;
    if removed > 0 {
        info!(account, "Account unbanned");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{MemoryStore, MirrorStore};
    use crate::handlers::accounts::is_post_blocked;
    use crate::handlers::HandlerSettings;
    use crate::rpc::ScriptedLedger;
    use std::sync::Arc;

    #[test]
    fn test_parse_commands() {
        let parse = ControlCommand::parse;
        assert_eq!(parse(r#"{"cmd":"accept"}"#), Some(ControlCommand::Accept));
        assert_eq!(parse(r#"{"cmd":"ban","reason":"x"}"#), Some(ControlCommand::Ban));
        assert_eq!(parse(r#"{"cmd":"unban"}"#), Some(ControlCommand::Unban));
    }

    #[test]
    fn test_unknown_or_malformed_ignored() {
        assert_eq!(ControlCommand::parse(r#"{"cmd":"delete"}"#), None);
        assert_eq!(ControlCommand::parse("nope"), None);
        assert_eq!(ControlCommand::parse(r#"{"other":1}"#), None);
    }

    fn context() -> (Arc<MemoryStore>, MirrorContext) {
        let store = Arc::new(MemoryStore::default());
        let ctx = MirrorContext::new(
            store.clone(),
            Arc::new(ScriptedLedger::new()),
            HandlerSettings::default(),
        );
        (store, ctx)
    }

    async fn seed_account(store: &MemoryStore, name: &str, id: i64) {
        store
            .insert_one(LogicalDb::General, Entity::AccountInfo, doc! { "_id": id, "name": name })
            .await
            .unwrap();
        store
            .insert_one(
                LogicalDb::General,
                Entity::PostInfo,
                doc! { "_id": 900_i64, "author": name, "permlink": "p" },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_interrupted_ban_still_blocks_and_replay_finishes() {
        let (store, ctx) = context();
        seed_account(&store, "bob", 7).await;

        store.fail_writes(LogicalDb::General, Entity::AccountInfo);
        assert!(ban(&ctx, "bob").await.is_err());
        assert_eq!(store.len(LogicalDb::General, Entity::Banned), 1);
        assert!(is_post_blocked(store.as_ref(), "bob", "other").await.unwrap());

        store.clear_failures();
        ban(&ctx, "bob").await.unwrap();
        assert!(find_account_id(store.as_ref(), "bob").await.unwrap().is_none());
        assert_eq!(store.len(LogicalDb::General, Entity::PostInfo), 0);
        assert_eq!(store.len(LogicalDb::General, Entity::Banned), 1);
    }

    #[tokio::test]
    async fn test_ban_entry_with_leftover_data_resumes_cascade() {
        let (store, ctx) = context();
        seed_account(&store, "bob", 7).await;
        store
            .insert_one(LogicalDb::General, Entity::Banned, doc! { "name": "bob" })
            .await
            .unwrap();

        ban(&ctx, "bob").await.unwrap();
        assert_eq!(store.len(LogicalDb::General, Entity::AccountInfo), 0);
        assert_eq!(store.len(LogicalDb::General, Entity::PostInfo), 0);
    }
}
