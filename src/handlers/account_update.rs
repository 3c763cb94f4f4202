//! Account-update handler
//!
//! Profile fields are merged into existing accounts; unknown accounts
//! are created with the profile unless banned. Writes of one block go
//! out as a single bulk write.

use std::collections::HashMap;

use bson::{doc, Document};
use futures::future::join_all;
use tracing::{debug, error, warn};

use super::accounts::{find_account_id, is_banned_name};
use super::{HandlerReport, MirrorContext};
use crate::content::parse_profile;
use crate::db::schemas::Profile;
use crate::db::{Entity, LogicalDb, WriteOp};
use crate::rpc::{AccountUpdateOp, Envelope};
use crate::types::Result;

/// Profile merge prepared for one account
#[derive(Debug, Clone)]
struct ProfileWrite {
    account: String,
    fields: Document,
    /// Id to use if the account is still missing when the write lands
    create_id: Option<i64>,
}

impl ProfileWrite {
    /// Keyed by name so an account created meanwhile by another handler
    /// receives the merge instead of a conflicting insert
    fn op(&self) -> WriteOp {
        let mut update = doc! { "$set": self.fields.clone() };
        if let Some(id) = self.create_id {
            update.insert("$setOnInsert", doc! { "_id": id });
        }
        WriteOp::UpdateOne {
            filter: doc! { "name": self.account.as_str() },
            update,
            upsert: self.create_id.is_some(),
        }
    }

    fn merge_op(&self) -> WriteOp {
        WriteOp::UpdateOne {
            filter: doc! { "name": self.account.as_str() },
            update: doc! { "$set": self.fields.clone() },
            upsert: false,
        }
    }
}

async fn profile_write(
    ctx: &MirrorContext,
    account: &str,
    profile: Profile,
) -> Result<Option<ProfileWrite>> {
    let store = ctx.store.as_ref();
    let fields = profile.merge_fields();

    if find_account_id(store, account).await?.is_some() {
        return Ok(Some(ProfileWrite {
            account: account.to_string(),
            fields,
            create_id: None,
        }));
    }

    if is_banned_name(store, account).await? {
        return Ok(None);
    }

    let id = ctx
        .ids
        .allocate(store, LogicalDb::General, Entity::AccountInfo)
        .await?;
    Ok(Some(ProfileWrite {
        account: account.to_string(),
        fields,
        create_id: Some(id),
    }))
}

/// Handle the account updates of one block
pub async fn handle_account_updates(
    ctx: &MirrorContext,
    updates: Vec<Envelope<AccountUpdateOp>>,
) -> HandlerReport {
    let mut report = HandlerReport::default();

    // Last update per account wins
    let total = updates.len();
    let mut latest: HashMap<String, Envelope<AccountUpdateOp>> = HashMap::new();
    for envelope in updates {
        latest.insert(envelope.op.account.clone(), envelope);
    }
    report.skipped += total - latest.len();

    let prepared = join_all(latest.into_values().map(|envelope| async move {
        let result = match parse_profile(envelope.op.profile_metadata()) {
            Some(profile) => profile_write(ctx, &envelope.op.account, profile).await,
            None => Ok(None),
        };
        (envelope, result)
    }))
    .await;

    let mut writes = Vec::new();
    for (envelope, result) in prepared {
        match result {
            Ok(Some(write)) => writes.push(write),
            Ok(None) => report.skipped += 1,
            Err(e) => {
                error!(
                    block = envelope.block,
                    account = %envelope.op.account,
                    "Error while handling account update: {}",
                    e
                );
                report.failed += 1;
            }
        }
    }

    if !writes.is_empty() {
        report.merge(write_profiles(ctx, &writes).await);
    }
    report
}

/// Send prepared profile writes as one bulk write
async fn write_profiles(ctx: &MirrorContext, writes: &[ProfileWrite]) -> HandlerReport {
    let mut report = HandlerReport::default();
    let count = writes.len();
    let store = ctx.store.as_ref();

    let outcome = match store
        .bulk_write(
            LogicalDb::General,
            Entity::AccountInfo,
            writes.iter().map(ProfileWrite::op).collect(),
        )
        .await
    {
        Ok(outcome) => outcome,
        Err(e) => {
            error!("Error while entering account updates: {}", e);
            report.failed += count;
            return report;
        }
    };
    debug!(
        upserted = outcome.upserted,
        modified = outcome.modified,
        "Account updates applied"
    );

    if outcome.duplicates > 0 {
        // Another writer created some of these accounts first; merge into theirs
        warn!(
            duplicates = outcome.duplicates,
            "Account creation raced, merging profiles by name"
        );
        if let Err(e) = store
            .bulk_write(
                LogicalDb::General,
                Entity::AccountInfo,
                writes.iter().map(ProfileWrite::merge_op).collect(),
            )
            .await
        {
            error!("Error while merging raced account updates: {}", e);
            report.failed += count;
            return report;
        }
    }

    report.applied += count;
    report
}
