//! JSON-RPC client for the ledger node pool

use std::time::Duration;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::retry::{retry, RetryPolicy};
use super::types::{
    AccountHistory, BlockOperation, BlockOperations, Content, DynamicGlobalProperties,
    HistoryEntry,
};
use crate::types::{MirrorError, Result};

/// Bit of `vote_operation` in the history API's low operation filter
pub const VOTE_OPERATION_FILTER: u64 = 1;

/// Read access to the ledger
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Last irreversible block number
    async fn chain_tip(&self) -> Result<u64>;

    /// Operations of `count` consecutive blocks starting at `from`, ascending
    async fn block_operations(&self, from: u64, count: u64) -> Result<Vec<BlockOperations>>;

    /// Current content of a post, `None` when the ledger does not know it
    async fn content(&self, author: &str, permlink: &str) -> Result<Option<Content>>;

    /// Vote history entries with id `<= start` (`-1` for newest), at most `limit`, ascending
    async fn account_history(
        &self,
        account: &str,
        start: i64,
        limit: u64,
    ) -> Result<Vec<HistoryEntry>>;
}

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    method: &'a str,
    params: &'a Value,
    id: u64,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

impl RpcResponse {
    fn into_result(self, method: &str) -> Result<Value> {
        if let Some(error) = self.error {
            return Err(MirrorError::Rpc(format!(
                "{} returned error {}: {}",
                method, error.code, error.message
            )));
        }
        self.result
            .ok_or_else(|| MirrorError::Rpc(format!("{} returned no result", method)))
    }
}

/// Ledger client over HTTP, choosing a random node per attempt
pub struct HttpLedger {
    http: reqwest::Client,
    nodes: Vec<String>,
    retry: RetryPolicy,
}

impl HttpLedger {
    pub fn new(nodes: Vec<String>, timeout: Duration, retry: RetryPolicy) -> Result<Self> {
        let nodes: Vec<String> = nodes
            .into_iter()
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .map(|n| {
                if n.starts_with("http://") || n.starts_with("https://") {
                    n
                } else {
                    format!("https://{}", n)
                }
            })
            .collect();

        if nodes.is_empty() {
            return Err(MirrorError::Config("no ledger RPC nodes configured".into()));
        }

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| MirrorError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { http, nodes, retry })
    }

    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }

    fn pick_node(&self) -> &str {
        self.nodes
            .choose(&mut rand::thread_rng())
            .map(String::as_str)
            .unwrap_or_default()
    }

    async fn post<B: Serialize + ?Sized, R: DeserializeOwned>(
        &self,
        node: &str,
        body: &B,
    ) -> Result<R> {
        let response = self.http.post(node).json(body).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(MirrorError::Rpc(format!("{} answered HTTP {}", node, status)));
        }
        // A node answering garbage is a node problem; another node may do better
        response
            .json::<R>()
            .await
            .map_err(|e| MirrorError::Rpc(format!("{} sent an undecodable body: {}", node, e)))
    }

    /// One JSON-RPC call with retries
    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        let params = &params;
        let value = retry(self.retry, method, || async move {
            let node = self.pick_node();
            let request = RpcRequest {
                jsonrpc: "2.0",
                method,
                params,
                id: 1,
            };
            let response: RpcResponse = self.post(node, &request).await?;
            response.into_result(method)
        })
        .await?;

        serde_json::from_value(value).map_err(|e| {
            MirrorError::Malformed(format!("{} result has unexpected shape: {}", method, e))
        })
    }
}

/// Decode a block's operation list, dropping operations that do not parse
fn decode_block(num: u64, result: Value) -> BlockOperations {
    let items = match result {
        Value::Array(items) => items,
        Value::Null => Vec::new(),
        other => {
            warn!(block = num, "Unexpected block payload: {}", other);
            Vec::new()
        }
    };

    let operations = items
        .into_iter()
        .filter_map(|item| match serde_json::from_value::<BlockOperation>(item) {
            Ok(op) => Some(op),
            Err(e) => {
                warn!(block = num, "Dropping malformed operation: {}", e);
                None
            }
        })
        .collect();

    BlockOperations { num, operations }
}

#[async_trait]
impl Ledger for HttpLedger {
    async fn chain_tip(&self) -> Result<u64> {
        let props: DynamicGlobalProperties = self
            .call("condenser_api.get_dynamic_global_properties", json!([]))
            .await?;
        Ok(props.last_irreversible_block_num)
    }

    async fn block_operations(&self, from: u64, count: u64) -> Result<Vec<BlockOperations>> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let params: Vec<Value> = (from..from + count).map(|n| json!([n, false])).collect();
        let params = &params;

        let responses: Vec<RpcResponse> = retry(self.retry, "get_ops_in_block", || async move {
            let node = self.pick_node();
            let batch: Vec<RpcRequest> = params
                .iter()
                .zip(from..)
                .map(|(p, id)| RpcRequest {
                    jsonrpc: "2.0",
                    method: "condenser_api.get_ops_in_block",
                    params: p,
                    id,
                })
                .collect();
            let responses: Vec<RpcResponse> = self.post(node, &batch).await?;
            if responses.len() as u64 != count {
                return Err(MirrorError::Rpc(format!(
                    "{} answered {} of {} batched calls",
                    node,
                    responses.len(),
                    count
                )));
            }
            Ok(responses)
        })
        .await?;

        let mut blocks = Vec::with_capacity(responses.len());
        for response in responses {
            let num = response
                .id
                .ok_or_else(|| MirrorError::Malformed("batched response without id".into()))?;
            let result = response.into_result("condenser_api.get_ops_in_block")?;
            blocks.push(decode_block(num, result));
        }
        blocks.sort_by_key(|b| b.num);

        debug!(from, count, "Fetched block operations");
        Ok(blocks)
    }

    async fn content(&self, author: &str, permlink: &str) -> Result<Option<Content>> {
        let content: Content = self
            .call("condenser_api.get_content", json!([author, permlink]))
            .await?;
        Ok(content.exists().then_some(content))
    }

    async fn account_history(
        &self,
        account: &str,
        start: i64,
        limit: u64,
    ) -> Result<Vec<HistoryEntry>> {
        let history: AccountHistory = self
            .call(
                "account_history_api.get_account_history",
                json!({
                    "account": account,
                    "start": start,
                    "limit": limit,
                    "operation_filter_low": VOTE_OPERATION_FILTER,
                }),
            )
            .await?;
        Ok(history.into_entries())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::types::Operation;

    #[test]
    fn test_new_adds_scheme_and_drops_blanks() {
        let ledger = HttpLedger::new(
            vec!["api.hive.blog".into(), " ".into(), "http://localhost:8091".into()],
            Duration::from_secs(5),
            RetryPolicy::default(),
        )
        .unwrap();
        assert_eq!(
            ledger.nodes(),
            &["https://api.hive.blog".to_string(), "http://localhost:8091".to_string()]
        );
    }

    #[test]
    fn test_new_requires_nodes() {
        let result = HttpLedger::new(vec![], Duration::from_secs(5), RetryPolicy::default());
        assert!(matches!(result, Err(MirrorError::Config(_))));
    }

    #[test]
    fn test_rpc_error_body_is_rpc_error() {
        let response: RpcResponse = serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "error": { "code": -32000, "message": "overloaded" }
        }))
        .unwrap();
        assert!(matches!(
            response.into_result("condenser_api.get_content"),
            Err(MirrorError::Rpc(_))
        ));
    }

    #[test]
    fn test_decode_block_drops_bad_operations() {
        let block = decode_block(
            10,
            json!([
                { "trx_id": "a", "block": 10, "timestamp": "2021-06-01T12:00:00",
                  "op": ["vote", { "voter": "x", "author": "y", "permlink": "z", "weight": 100 }] },
                { "trx_id": "b", "block": 10, "timestamp": "not a time", "op": ["vote", {}] }
            ]),
        );
        assert_eq!(block.num, 10);
        assert_eq!(block.operations.len(), 1);
        assert!(matches!(block.operations[0].op, Operation::Vote(_)));
    }
}
