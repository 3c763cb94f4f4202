//! Block classification and application

use tracing::{debug, warn};

use crate::handlers::{
    handle_account_updates, handle_comments, handle_custom_json, handle_votes, HandlerReport,
    MirrorContext,
};
use crate::rpc::{
    AccountUpdateOp, BlockOperations, CommentOp, CustomJsonOp, Envelope, Operation, VoteOp,
};

/// Operations of one block split into the four handler groups
#[derive(Debug, Default)]
pub struct OperationBatch {
    pub comments: Vec<Envelope<CommentOp>>,
    pub votes: Vec<Envelope<VoteOp>>,
    pub account_updates: Vec<Envelope<AccountUpdateOp>>,
    pub custom_json: Vec<Envelope<CustomJsonOp>>,
    pub ignored: usize,
    pub unparsed: usize,
}

impl OperationBatch {
    pub fn classify(block: BlockOperations) -> Self {
        let mut batch = Self::default();

        for operation in block.operations {
            let (block, trx_id, timestamp) = (operation.block, operation.trx_id, operation.timestamp);
            macro_rules! envelope {
                ($op:expr) => {
                    Envelope {
                        block,
                        trx_id,
                        timestamp,
                        op: $op,
                    }
                };
            }

            match operation.op {
                Operation::Comment(op) => batch.comments.push(envelope!(op)),
                Operation::Vote(op) => batch.votes.push(envelope!(op)),
                Operation::AccountUpdate(op) => batch.account_updates.push(envelope!(op)),
                Operation::CustomJson(op) => batch.custom_json.push(envelope!(op)),
                Operation::Other(_) => batch.ignored += 1,
                Operation::Unparsed { kind, reason } => {
                    warn!(block, kind = %kind, "Dropping unparsable operation: {}", reason);
                    batch.unparsed += 1;
                }
            }
        }

        batch
    }

    pub fn relevant(&self) -> usize {
        self.comments.len()
            + self.votes.len()
            + self.account_updates.len()
            + self.custom_json.len()
    }
}

/// Reports of the four handlers for one block
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockReport {
    pub comments: HandlerReport,
    pub votes: HandlerReport,
    pub account_updates: HandlerReport,
    pub custom_json: HandlerReport,
}

impl BlockReport {
    pub fn failed(&self) -> usize {
        self.comments.failed
            + self.votes.failed
            + self.account_updates.failed
            + self.custom_json.failed
    }
}

/// Apply one block: the four groups run concurrently
pub async fn apply_block(ctx: &MirrorContext, block: BlockOperations) -> BlockReport {
    let num = block.num;
    let batch = OperationBatch::classify(block);
    if batch.relevant() == 0 {
        return BlockReport::default();
    }

    let (comments, votes, account_updates, custom_json) = tokio::join!(
        handle_comments(ctx, batch.comments),
        handle_votes(ctx, batch.votes),
        handle_account_updates(ctx, batch.account_updates),
        handle_custom_json(ctx, batch.custom_json),
    );

    let report = BlockReport {
        comments,
        votes,
        account_updates,
        custom_json,
    };
    debug!(
        block = num,
        comments = report.comments.applied,
        votes = report.votes.applied,
        account_updates = report.account_updates.applied,
        commands = report.custom_json.applied,
        failed = report.failed(),
        "Block applied"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::BlockOperation;
    use chrono::Utc;

    fn op(op: Operation) -> BlockOperation {
        BlockOperation {
            trx_id: "t".into(),
            block: 5,
            timestamp: Utc::now(),
            op,
        }
    }

    #[test]
    fn test_classify_splits_groups() {
        let block = BlockOperations {
            num: 5,
            operations: vec![
                op(Operation::Vote(VoteOp::default())),
                op(Operation::Vote(VoteOp::default())),
                op(Operation::Comment(CommentOp::default())),
                op(Operation::Other("transfer".into())),
                op(Operation::Unparsed {
                    kind: "comment".into(),
                    reason: "bad".into(),
                }),
            ],
        };
        let batch = OperationBatch::classify(block);
        assert_eq!(batch.votes.len(), 2);
        assert_eq!(batch.comments.len(), 1);
        assert_eq!(batch.ignored, 1);
        assert_eq!(batch.unparsed, 1);
        assert_eq!(batch.relevant(), 3);
        assert_eq!(batch.votes[0].block, 5);
    }
}
