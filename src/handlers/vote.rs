//! Vote handler
//!
//! A vote is a membership edge between a voter account id and a post's
//! voter set. Upvotes add with `$addToSet`, withdrawn votes pull, so
//! replaying a vote leaves the set unchanged. All edges of one block go
//! out as one unordered bulk write per database.

use std::collections::HashMap;

use bson::doc;
use futures::future::join_all;
use tracing::{debug, error};

use super::accounts::resolve_or_create;
use super::{HandlerReport, MirrorContext};
use crate::db::{BulkOutcome, Entity, LogicalDb, WriteOp};
use crate::rpc::{Envelope, VoteOp};
use crate::types::Result;

fn vote_write(post_id: i64, voter_id: i64, upvote: bool) -> WriteOp {
    let update = if upvote {
        doc! { "$addToSet": { "votes": voter_id } }
    } else {
        doc! { "$pull": { "votes": voter_id } }
    };
    WriteOp::UpdateOne {
        filter: doc! { "_id": post_id },
        update,
        upsert: false,
    }
}

/// Writes for one vote in every mirror holding the post
async fn edges_for(
    ctx: &MirrorContext,
    voter_id: i64,
    vote: &VoteOp,
) -> Result<Vec<(LogicalDb, WriteOp)>> {
    let mut edges = Vec::new();
    for &db in ctx.mirror_dbs() {
        if let Some(post) = ctx
            .posts
            .find_identity(db, &vote.author, &vote.permlink)
            .await?
        {
            edges.push((db, vote_write(post._id, voter_id, vote.is_upvote())));
        }
    }
    Ok(edges)
}

async fn write_edges(
    ctx: &MirrorContext,
    edges: Vec<(LogicalDb, WriteOp)>,
) -> Result<BulkOutcome> {
    let mut by_db: HashMap<LogicalDb, Vec<WriteOp>> = HashMap::new();
    for (db, op) in edges {
        by_db.entry(db).or_default().push(op);
    }

    let mut outcome = BulkOutcome::default();
    for (db, ops) in by_db {
        outcome.absorb(ctx.store.bulk_write(db, Entity::PostData, ops).await?);
    }
    Ok(outcome)
}

/// Handle the votes of one block
pub async fn handle_votes(ctx: &MirrorContext, votes: Vec<Envelope<VoteOp>>) -> HandlerReport {
    let mut report = HandlerReport::default();

    // Only the last vote of a voter on a post within the block counts
    let total = votes.len();
    let mut latest: HashMap<(String, String, String), Envelope<VoteOp>> = HashMap::new();
    for envelope in votes {
        let key = (
            envelope.op.voter.clone(),
            envelope.op.author.clone(),
            envelope.op.permlink.clone(),
        );
        latest.insert(key, envelope);
    }
    report.skipped += total - latest.len();

    let resolved = join_all(latest.into_values().map(|envelope| async move {
        let vote = &envelope.op;
        let result = match resolve_or_create(ctx, &vote.voter, None).await {
            Ok(Some(voter_id)) => edges_for(ctx, voter_id, vote).await,
            Ok(None) => Ok(Vec::new()),
            Err(e) => Err(e),
        };
        (envelope, result)
    }))
    .await;

    let mut edges = Vec::new();
    for (envelope, result) in resolved {
        match result {
            Ok(found) if found.is_empty() => report.skipped += 1,
            Ok(found) => {
                report.applied += 1;
                edges.extend(found);
            }
            Err(e) => {
                error!(
                    block = envelope.block,
                    voter = %envelope.op.voter,
                    author = %envelope.op.author,
                    permlink = %envelope.op.permlink,
                    "Error while handling vote: {}",
                    e
                );
                report.failed += 1;
            }
        }
    }

    if edges.is_empty() {
        return report;
    }

    match write_edges(ctx, edges).await {
        Ok(outcome) => debug!(modified = outcome.modified, "Votes applied"),
        Err(e) => {
            error!("Error while entering votes: {}", e);
            report.failed += report.applied;
            report.applied = 0;
        }
    }
    report
}

/// Apply a known voter's votes, as found in its history
///
/// Votes on posts outside the mirror are skipped.
pub async fn apply_vote_edges(
    ctx: &MirrorContext,
    voter_id: i64,
    votes: &[VoteOp],
) -> Result<BulkOutcome> {
    let found = join_all(votes.iter().map(|vote| edges_for(ctx, voter_id, vote))).await;
    let mut edges = Vec::new();
    for result in found {
        edges.extend(result?);
    }
    if edges.is_empty() {
        return Ok(BulkOutcome::default());
    }
    write_edges(ctx, edges).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upvote_adds_to_set() {
        match vote_write(9, 4, true) {
            WriteOp::UpdateOne { filter, update, .. } => {
                assert_eq!(filter, doc! { "_id": 9_i64 });
                assert_eq!(update, doc! { "$addToSet": { "votes": 4_i64 } });
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unvote_pulls() {
        match vote_write(9, 4, false) {
            WriteOp::UpdateOne { update, .. } => {
                assert_eq!(update, doc! { "$pull": { "votes": 4_i64 } });
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
