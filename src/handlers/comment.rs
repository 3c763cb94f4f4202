//! Comment handler
//!
//! Top-level posts become four-facet post records. Replies are ignored
//! unless they are tag commands addressed to the command account.

use std::collections::HashMap;

use bson::DateTime as BsonDateTime;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use tracing::{debug, error, info};

use super::accounts::is_post_blocked;
use super::{HandlerReport, MirrorContext};
use crate::content::{is_patch, slugify, NormalizedPost, TagCommand};
use crate::db::schemas::{PlainText, PostDataDoc, PostInfoDoc, PostRawDoc, PostTextDoc};
use crate::db::{Entity, LogicalDb};
use crate::posts::{CreateOutcome, PostRecord};
use crate::rpc::{CommentOp, Envelope};
use crate::types::Result;

/// A comment to ingest with the time it was made
#[derive(Debug, Clone)]
pub struct IncomingPost {
    pub comment: CommentOp,
    pub timestamp: DateTime<Utc>,
}

impl From<Envelope<CommentOp>> for IncomingPost {
    fn from(envelope: Envelope<CommentOp>) -> Self {
        Self {
            comment: envelope.op,
            timestamp: envelope.timestamp,
        }
    }
}

/// What ingesting one comment did to the general mirror
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommentOutcome {
    Created(i64),
    /// Material edit: facets recreated under the same id
    Edited(i64),
    Unchanged(i64),
    Banned,
    /// Dropped by the normalizer's moderation gates
    Rejected,
    /// Patch body whose full content the ledger no longer has
    Unavailable,
    Retagged(i64),
    /// Reply or command that touches nothing
    Ignored,
}

impl CommentOutcome {
    fn applied(&self) -> bool {
        matches!(
            self,
            CommentOutcome::Created(_) | CommentOutcome::Edited(_) | CommentOutcome::Retagged(_)
        )
    }
}

/// Handle the comments of one block
///
/// Comments on the same post are applied in block order; different
/// posts are handled concurrently.
pub async fn handle_comments(
    ctx: &MirrorContext,
    comments: Vec<Envelope<CommentOp>>,
) -> HandlerReport {
    let mut groups: Vec<Vec<Envelope<CommentOp>>> = Vec::new();
    let mut index: HashMap<(String, String), usize> = HashMap::new();
    for envelope in comments {
        let key = (envelope.op.author.clone(), envelope.op.permlink.clone());
        match index.get(&key) {
            Some(&slot) => groups[slot].push(envelope),
            None => {
                index.insert(key, groups.len());
                groups.push(vec![envelope]);
            }
        }
    }

    let results = join_all(groups.into_iter().map(|group| async move {
        let mut report = HandlerReport::default();
        for envelope in group {
            let block = envelope.block;
            let author = envelope.op.author.clone();
            let permlink = envelope.op.permlink.clone();
            match handle_comment(ctx, envelope).await {
                Ok(outcome) if outcome.applied() => {
                    debug!(block, %author, %permlink, ?outcome, "Comment applied");
                    report.applied += 1;
                }
                Ok(_) => report.skipped += 1,
                Err(e) => {
                    error!(block, %author, %permlink, "Error while handling comment: {}", e);
                    report.failed += 1;
                }
            }
        }
        report
    }))
    .await;

    results.into_iter().fold(HandlerReport::default(), |mut acc, r| {
        acc.merge(r);
        acc
    })
}

async fn handle_comment(
    ctx: &MirrorContext,
    envelope: Envelope<CommentOp>,
) -> Result<CommentOutcome> {
    if envelope.op.is_reply() {
        return handle_reply(ctx, &envelope.op).await;
    }
    ingest_post(ctx, envelope.into()).await
}

/// Apply a tag command reply, if it is one
async fn handle_reply(ctx: &MirrorContext, reply: &CommentOp) -> Result<CommentOutcome> {
    let settings = &ctx.settings;
    if settings.tag_command_account.as_deref() != Some(reply.parent_author.as_str()) {
        return Ok(CommentOutcome::Ignored);
    }
    let Some(command) = TagCommand::parse(&settings.tag_command_phrase, &reply.body) else {
        return Ok(CommentOutcome::Ignored);
    };

    let tag_str = slugify(&command.tags.join(" "));
    let mut outcome = CommentOutcome::Ignored;
    for &db in ctx.mirror_dbs() {
        let Some(info) = ctx
            .posts
            .find_identity(db, &reply.author, &command.permlink)
            .await?
        else {
            continue;
        };
        ctx.posts.retag(db, info._id, &tag_str, &command.tags).await?;
        if db == LogicalDb::General {
            outcome = CommentOutcome::Retagged(info._id);
        }
    }

    if outcome != CommentOutcome::Ignored {
        info!(
            author = %reply.author,
            permlink = %command.permlink,
            tags = %tag_str,
            "Post retagged by command"
        );
    }
    Ok(outcome)
}

/// Run one top-level post through moderation and into every target mirror
///
/// Shared by live ingestion and the repair pass.
pub async fn ingest_post(ctx: &MirrorContext, incoming: IncomingPost) -> Result<CommentOutcome> {
    let IncomingPost {
        mut comment,
        timestamp,
    } = incoming;

    if is_post_blocked(ctx.store.as_ref(), &comment.author, &comment.permlink).await? {
        debug!(author = %comment.author, permlink = %comment.permlink, "Post is banned");
        return Ok(CommentOutcome::Banned);
    }

    if is_patch(&comment.body) {
        match ctx.ledger.content(&comment.author, &comment.permlink).await? {
            Some(content) => {
                comment.title = content.title;
                comment.body = content.body;
                comment.json_metadata = content.json_metadata;
            }
            None => return Ok(CommentOutcome::Unavailable),
        }
    }

    let normalized = ctx
        .normalizer
        .normalize(&comment.title, &comment.body, &comment.json_metadata);
    if !normalized.accepted() {
        debug!(
            author = %comment.author,
            permlink = %comment.permlink,
            verdict = ?normalized.verdict,
            "Post dropped by moderation"
        );
        // An edit that fails moderation takes the mirrored post down with it
        drop_stale(ctx, &comment, &[]).await?;
        return Ok(CommentOutcome::Rejected);
    }

    let mut targets = vec![LogicalDb::General];
    let in_image_community = ctx.settings.image_community.as_deref()
        == Some(comment.parent_permlink.as_str());
    if in_image_community && !normalized.images.is_empty() {
        targets.push(LogicalDb::Images);
    }
    drop_stale(ctx, &comment, &targets).await?;

    let mut outcome = CommentOutcome::Ignored;
    for db in targets {
        let result = write_post(ctx, db, &comment, &normalized, timestamp).await?;
        if db == LogicalDb::General {
            outcome = result;
        }
    }
    Ok(outcome)
}

/// Delete the post from every mirror db outside `keep`
async fn drop_stale(ctx: &MirrorContext, comment: &CommentOp, keep: &[LogicalDb]) -> Result<()> {
    for &db in ctx.mirror_dbs() {
        if keep.contains(&db) {
            continue;
        }
        let Some(existing) = ctx
            .posts
            .find_identity(db, &comment.author, &comment.permlink)
            .await?
        else {
            continue;
        };
        ctx.posts.delete(db, &[existing._id]).await?;
        info!(
            db = ?db,
            post_id = existing._id,
            author = %comment.author,
            permlink = %comment.permlink,
            "Post removed after edit"
        );
    }
    Ok(())
}

async fn write_post(
    ctx: &MirrorContext,
    db: LogicalDb,
    comment: &CommentOp,
    normalized: &NormalizedPost,
    timestamp: DateTime<Utc>,
) -> Result<CommentOutcome> {
    let posts = &ctx.posts;

    if let Some(existing) = posts
        .find_identity(db, &comment.author, &comment.permlink)
        .await?
    {
        let id = existing._id;
        let text = posts.text(db, id).await?;
        let unchanged = text.is_some_and(|t| {
            t.title == normalized.title
                && t.body == normalized.body
                && t.tag_str == normalized.tag_str
        });
        if unchanged {
            return Ok(CommentOutcome::Unchanged(id));
        }

        let votes = posts
            .data(db, id)
            .await?
            .map(|data| data.votes)
            .unwrap_or_default();
        let record = build_record(id, db, comment, normalized, existing.timestamp, votes)?;
        posts.delete(db, &[id]).await?;
        posts.create(db, &record).await?;
        info!(
            db = ?db,
            post_id = id,
            author = %comment.author,
            permlink = %comment.permlink,
            "Post edited"
        );
        return Ok(CommentOutcome::Edited(id));
    }

    let id = ctx
        .ids
        .allocate(ctx.store.as_ref(), db, Entity::PostInfo)
        .await?;
    let record = build_record(
        id,
        db,
        comment,
        normalized,
        BsonDateTime::from_chrono(timestamp),
        Vec::new(),
    )?;

    match posts.create(db, &record).await? {
        CreateOutcome::Created => Ok(CommentOutcome::Created(id)),
        CreateOutcome::AlreadyExists => Ok(CommentOutcome::Unchanged(id)),
    }
}

fn build_record(
    id: i64,
    db: LogicalDb,
    comment: &CommentOp,
    normalized: &NormalizedPost,
    timestamp: BsonDateTime,
    votes: Vec<i64>,
) -> Result<PostRecord> {
    let mut raw = bson::to_document(comment)?;
    raw.insert("json_metadata", bson::to_bson(&normalized.metadata)?);

    let images = match db {
        LogicalDb::Images => normalized.images.clone(),
        LogicalDb::General => Vec::new(),
    };

    Ok(PostRecord {
        info: PostInfoDoc {
            _id: id,
            author: comment.author.clone(),
            permlink: comment.permlink.clone(),
            parent_permlink: comment.parent_permlink.clone(),
            timestamp,
            images,
        },
        text: PostTextDoc {
            _id: id,
            title: normalized.title.clone(),
            body: normalized.body.clone(),
            tag_str: normalized.tag_str.clone(),
            timestamp,
        },
        data: PostDataDoc {
            _id: id,
            categories: None,
            lang: None,
            doc_vectors: None,
            votes,
            timestamp,
        },
        raw: PostRawDoc {
            _id: id,
            timestamp,
            raw,
            plain: PlainText {
                body: normalized.plain_body.clone(),
            },
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{MemoryStore, MirrorStore};
    use crate::handlers::HandlerSettings;
    use crate::rpc::{Content, ScriptedLedger};
    use bson::doc;
    use std::sync::Arc;

    const BODY: &str = "one two three four five six seven eight nine ten eleven";

    fn context(settings: HandlerSettings) -> (Arc<MemoryStore>, Arc<ScriptedLedger>, MirrorContext) {
        let store = Arc::new(MemoryStore::default());
        let ledger = Arc::new(ScriptedLedger::new());
        let ctx = MirrorContext::new(store.clone(), ledger.clone(), settings);
        (store, ledger, ctx)
    }

    fn envelope(comment: CommentOp) -> Envelope<CommentOp> {
        Envelope {
            block: 1,
            trx_id: "trx".into(),
            timestamp: Utc::now(),
            op: comment,
        }
    }

    fn post(permlink: &str, body: &str, metadata: &str) -> CommentOp {
        CommentOp {
            parent_author: String::new(),
            parent_permlink: "photography".into(),
            author: "bob".into(),
            permlink: permlink.into(),
            title: "Title".into(),
            body: body.into(),
            json_metadata: metadata.into(),
        }
    }

    #[tokio::test]
    async fn test_plain_reply_is_ignored() {
        let (store, _, ctx) = context(HandlerSettings::default());
        let mut reply = post("re-hello", BODY, "{}");
        reply.parent_author = "alice".into();
        let report = handle_comments(&ctx, vec![envelope(reply)]).await;
        assert_eq!(report.skipped, 1);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_patch_body_resolved_from_ledger() {
        let (store, ledger, ctx) = context(HandlerSettings::default());
        ledger.put_content(Content {
            author: "bob".into(),
            permlink: "hello".into(),
            parent_permlink: "photography".into(),
            title: "Title".into(),
            body: BODY.into(),
            json_metadata: "{}".into(),
            ..Default::default()
        });
        let outcome = handle_comment(&ctx, envelope(post("hello", "@@ -1,2 +1,3 @@ x", "{}")))
            .await
            .unwrap();
        assert!(matches!(outcome, CommentOutcome::Created(_)));
        let text = store
            .find_one(LogicalDb::General, Entity::PostText, doc! {})
            .await
            .unwrap()
            .unwrap();
        assert_eq!(text.get_str("body").unwrap(), BODY);
    }

    #[tokio::test]
    async fn test_image_community_post_mirrored() {
        let (store, _, ctx) = context(HandlerSettings {
            image_community: Some("photography".into()),
            ..Default::default()
        });
        let metadata = r#"{"image":["https://img.example/a.jpg"],"tags":["photo"]}"#;
        handle_comments(&ctx, vec![envelope(post("hello", BODY, metadata))]).await;

        let general = store
            .find_one(LogicalDb::General, Entity::PostInfo, doc! {})
            .await
            .unwrap()
            .unwrap();
        assert!(!general.contains_key("images"));

        let images = store
            .find_one(LogicalDb::Images, Entity::PostInfo, doc! {})
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            images.get_array("images").unwrap(),
            &vec![bson::Bson::String("https://img.example/a.jpg".into())]
        );
        for entity in Entity::POST_FACETS {
            assert_eq!(store.len(LogicalDb::Images, entity), 1);
        }
    }

    #[tokio::test]
    async fn test_tag_command_retags_own_post() {
        let (store, _, ctx) = context(HandlerSettings {
            tag_command_account: Some("discover".into()),
            ..Default::default()
        });
        handle_comments(&ctx, vec![envelope(post("hello", BODY, r#"{"tags":["life"]}"#))]).await;

        let mut command = post("re-discover", "!discover-tags hello Travel food", "{}");
        command.parent_author = "discover".into();
        let report = handle_comments(&ctx, vec![envelope(command)]).await;
        assert_eq!(report.applied, 1);

        let text = store
            .find_one(LogicalDb::General, Entity::PostText, doc! {})
            .await
            .unwrap()
            .unwrap();
        assert_eq!(text.get_str("tag_str").unwrap(), "travel food");
        let raw = store
            .find_one(LogicalDb::General, Entity::PostRaw, doc! {})
            .await
            .unwrap()
            .unwrap();
        let tags = raw
            .get_document("raw")
            .unwrap()
            .get_document("json_metadata")
            .unwrap()
            .get_array("tags")
            .unwrap();
        let tags: Vec<&str> = tags.iter().filter_map(|t| t.as_str()).collect();
        assert_eq!(tags, vec!["life", "travel", "food"]);
    }

    #[tokio::test]
    async fn test_create_then_edit_in_same_block() {
        let (store, _, ctx) = context(HandlerSettings::default());
        let edited = format!("{} twelve", BODY);
        let report = handle_comments(
            &ctx,
            vec![
                envelope(post("hello", BODY, "{}")),
                envelope(post("hello", &edited, "{}")),
            ],
        )
        .await;
        assert_eq!(report.applied, 2);
        assert_eq!(store.len(LogicalDb::General, Entity::PostInfo), 1);
        let text = store
            .find_one(LogicalDb::General, Entity::PostText, doc! {})
            .await
            .unwrap()
            .unwrap();
        assert!(text.get_str("body").unwrap().ends_with("twelve"));
    }

    #[tokio::test]
    async fn test_edit_failing_moderation_removes_post() {
        let (store, _, ctx) = context(HandlerSettings::default());
        handle_comments(&ctx, vec![envelope(post("hello", BODY, r#"{"tags":["hive"]}"#))]).await;
        assert_eq!(store.len(LogicalDb::General, Entity::PostInfo), 1);

        let opted_out = post("hello", BODY, r#"{"tags":["hive","stop_discover"]}"#);
        let outcome = handle_comment(&ctx, envelope(opted_out)).await.unwrap();
        assert_eq!(outcome, CommentOutcome::Rejected);
        for entity in Entity::POST_FACETS {
            assert_eq!(store.len(LogicalDb::General, entity), 0);
        }
    }

    #[tokio::test]
    async fn test_edit_below_word_minimum_removes_post() {
        let (store, _, ctx) = context(HandlerSettings::default());
        handle_comments(&ctx, vec![envelope(post("hello", BODY, "{}"))]).await;

        let outcome = handle_comment(&ctx, envelope(post("hello", "deleted", "{}")))
            .await
            .unwrap();
        assert_eq!(outcome, CommentOutcome::Rejected);
        assert!(ctx
            .posts
            .find_identity(LogicalDb::General, "bob", "hello")
            .await
            .unwrap()
            .is_none());
        assert_eq!(store.len(LogicalDb::General, Entity::PostText), 0);
    }

    #[tokio::test]
    async fn test_edit_without_images_leaves_image_mirror() {
        let (store, _, ctx) = context(HandlerSettings {
            image_community: Some("photography".into()),
            ..Default::default()
        });
        let metadata = r#"{"image":["https://img.example/a.jpg"]}"#;
        handle_comments(&ctx, vec![envelope(post("hello", BODY, metadata))]).await;
        assert_eq!(store.len(LogicalDb::Images, Entity::PostInfo), 1);

        let edited = format!("{} twelve", BODY);
        let outcome = handle_comment(&ctx, envelope(post("hello", &edited, "{}")))
            .await
            .unwrap();
        assert!(matches!(outcome, CommentOutcome::Edited(_)));
        assert_eq!(store.len(LogicalDb::General, Entity::PostInfo), 1);
        for entity in Entity::POST_FACETS {
            assert_eq!(store.len(LogicalDb::Images, entity), 0);
        }
    }
}
