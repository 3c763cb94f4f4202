//! Account lookups, ban checks and lazy account creation

use bson::doc;
use tracing::debug;

use super::MirrorContext;
use crate::db::schemas::{AccountInfoDoc, Profile};
use crate::db::{doc_id, insert_typed, Entity, LogicalDb, MirrorStore};
use crate::types::{MirrorError, Result};

/// Attempts at creating an account when racing another writer
const CREATE_ATTEMPTS: usize = 3;

pub async fn find_account_id(store: &dyn MirrorStore, name: &str) -> Result<Option<i64>> {
    Ok(store
        .find_one(LogicalDb::General, Entity::AccountInfo, doc! { "name": name })
        .await?
        .as_ref()
        .and_then(doc_id))
}

pub async fn is_banned_name(store: &dyn MirrorStore, name: &str) -> Result<bool> {
    Ok(store
        .find_one(LogicalDb::General, Entity::Banned, doc! { "name": name })
        .await?
        .is_some())
}

pub async fn is_banned_post(
    store: &dyn MirrorStore,
    author: &str,
    permlink: &str,
) -> Result<bool> {
    Ok(store
        .find_one(
            LogicalDb::General,
            Entity::Banned,
            doc! { "author": author, "permlink": permlink },
        )
        .await?
        .is_some())
}

/// Whether a post may enter the mirror
pub async fn is_post_blocked(
    store: &dyn MirrorStore,
    author: &str,
    permlink: &str,
) -> Result<bool> {
    Ok(is_banned_name(store, author).await? || is_banned_post(store, author, permlink).await?)
}

/// Id of `name`, creating the account unless it is banned
///
/// `None` means the account is banned and was not created.
pub async fn resolve_or_create(
    ctx: &MirrorContext,
    name: &str,
    profile: Option<Profile>,
) -> Result<Option<i64>> {
    let store = ctx.store.as_ref();
    let mut last_error = None;

    for _ in 0..CREATE_ATTEMPTS {
        if let Some(id) = find_account_id(store, name).await? {
            return Ok(Some(id));
        }
        if is_banned_name(store, name).await? {
            debug!(account = name, "Not creating banned account");
            return Ok(None);
        }

        let id = ctx
            .ids
            .allocate(store, LogicalDb::General, Entity::AccountInfo)
            .await?;
        let account = AccountInfoDoc {
            _id: id,
            name: name.to_string(),
            profile: profile.clone(),
        };

        match insert_typed(store, LogicalDb::General, Entity::AccountInfo, &account).await {
            Ok(()) => {
                debug!(account = name, id, "Account created");
                return Ok(Some(id));
            }
            // Lost a race on the name or the id; look again
            Err(e) if e.is_duplicate() => last_error = Some(e),
            Err(e) => return Err(e),
        }
    }

    Err(last_error.unwrap_or_else(|| {
        MirrorError::Internal(format!("could not create account {}", name))
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::handlers::HandlerSettings;
    use crate::rpc::ScriptedLedger;
    use std::sync::Arc;

    fn context() -> (Arc<MemoryStore>, MirrorContext) {
        let store = Arc::new(MemoryStore::default());
        let ctx = MirrorContext::new(
            store.clone(),
            Arc::new(ScriptedLedger::new()),
            HandlerSettings::default(),
        );
        (store, ctx)
    }

    #[tokio::test]
    async fn test_resolve_creates_once() {
        let (store, ctx) = context();
        let first = resolve_or_create(&ctx, "alice", None).await.unwrap().unwrap();
        let second = resolve_or_create(&ctx, "alice", None).await.unwrap().unwrap();
        assert_eq!(first, second);
        assert_eq!(store.len(LogicalDb::General, Entity::AccountInfo), 1);
    }

    #[tokio::test]
    async fn test_banned_account_not_created() {
        let (store, ctx) = context();
        store
            .insert_one(LogicalDb::General, Entity::Banned, doc! { "name": "spammer" })
            .await
            .unwrap();
        assert_eq!(resolve_or_create(&ctx, "spammer", None).await.unwrap(), None);
        assert!(find_account_id(store.as_ref(), "spammer").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_post_ban_blocks_only_that_post() {
        let (store, _) = context();
        store
            .insert_one(
                LogicalDb::General,
                Entity::Banned,
                doc! { "author": "bob", "permlink": "bad" },
            )
            .await
            .unwrap();
        assert!(is_post_blocked(store.as_ref(), "bob", "bad").await.unwrap());
        assert!(!is_post_blocked(store.as_ref(), "bob", "good").await.unwrap());
    }
}
