//! Chain-log source
//!
//! `LogSource` is the seam between the engine and whatever serves logs.
//! `JsonRpcLogSource` implements it over `eth_getLogs`, `eth_blockNumber`
//! and `eth_getBlockByNumber`. Tests plug in an in-memory source.

use crate::error::{Result, SyncError};
use crate::pipeline::types::{Address, RawLog};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// `eth_getLogs` filter: any of `addresses`, any of `topic0s`, inclusive range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFilter {
    pub addresses: Vec<Address>,
    pub topic0s: Vec<String>,
    pub from_block: u64,
    pub to_block: u64,
}

#[async_trait]
pub trait LogSource: Send + Sync {
    /// All logs matching `filter`. Delivery within the range is assumed gap-free.
    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<RawLog>>;

    /// Current head block.
    async fn get_block_number(&self) -> Result<u64>;

    /// Block header timestamp (unix seconds).
    async fn get_block_timestamp(&self, number: u64) -> Result<i64>;
}

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

/// Log object as returned by `eth_getLogs`. Quantities are hex strings.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcLog {
    address: Option<String>,
    #[serde(default)]
    topics: Vec<String>,
    data: Option<String>,
    block_number: Option<String>,
    transaction_hash: Option<String>,
    transaction_index: Option<String>,
    log_index: Option<String>,
    /// Non-standard, but several providers include it
    block_timestamp: Option<String>,
    #[serde(default)]
    removed: bool,
}

impl From<RpcLog> for RawLog {
    fn from(log: RpcLog) -> Self {
        RawLog {
            address: log.address,
            topics: log.topics,
            data: log.data,
            block_number: log.block_number.as_deref().and_then(parse_quantity),
            transaction_hash: log.transaction_hash,
            transaction_index: log.transaction_index.as_deref().and_then(parse_quantity),
            log_index: log.log_index.as_deref().and_then(parse_quantity),
            block_time: log
                .block_timestamp
                .as_deref()
                .and_then(parse_quantity)
                .and_then(|t| i64::try_from(t).ok()),
            removed: log.removed,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RpcBlockHeader {
    timestamp: String,
}

/// Parse a JSON-RPC hex quantity (`0x1a`).
pub fn parse_quantity(s: &str) -> Option<u64> {
    let digits = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X"))?;
    if digits.is_empty() {
        return None;
    }
    u64::from_str_radix(digits, 16).ok()
}

fn quantity(n: u64) -> String {
    format!("0x{:x}", n)
}

/// JSON-RPC log source over HTTP.
pub struct JsonRpcLogSource {
    client: reqwest::Client,
    url: String,
    next_id: AtomicU64,
}

impl JsonRpcLogSource {
    pub fn new(url: &str, timeout_ms: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()?;
        Ok(Self {
            client,
            url: url.to_string(),
            next_id: AtomicU64::new(1),
        })
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<Option<T>> {
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };

        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| classify(method, e))?;

        if !response.status().is_success() {
            return Err(SyncError::Source(format!(
                "{} returned HTTP {}",
                method,
                response.status()
            )));
        }

        let body: RpcResponse<T> = response.json().await.map_err(|e| classify(method, e))?;
        if let Some(err) = body.error {
            return Err(SyncError::Source(format!(
                "{} error {}: {}",
                method, err.code, err.message
            )));
        }
        Ok(body.result)
    }
}

fn classify(method: &str, e: reqwest::Error) -> SyncError {
    if e.is_timeout() {
        SyncError::Timeout(method.to_string())
    } else {
        SyncError::Http(e)
    }
}

#[async_trait]
impl LogSource for JsonRpcLogSource {
    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<RawLog>> {
        let addresses: Vec<&str> = filter.addresses.iter().map(|a| a.as_str()).collect();
        let params = json!([{
            "address": addresses,
            "topics": [filter.topic0s],
            "fromBlock": quantity(filter.from_block),
            "toBlock": quantity(filter.to_block),
        }]);

        let logs: Vec<RpcLog> = self.call("eth_getLogs", params).await?.unwrap_or_default();
        log::debug!(
            "eth_getLogs [{}, {}] -> {} logs",
            filter.from_block,
            filter.to_block,
            logs.len()
        );
        Ok(logs.into_iter().map(RawLog::from).collect())
    }

    async fn get_block_number(&self) -> Result<u64> {
        let raw: String = self
            .call("eth_blockNumber", json!([]))
            .await?
            .ok_or_else(|| SyncError::Source("eth_blockNumber returned null".into()))?;
        parse_quantity(&raw)
            .ok_or_else(|| SyncError::Source(format!("bad block number {:?}", raw)))
    }

    async fn get_block_timestamp(&self, number: u64) -> Result<i64> {
        let header: RpcBlockHeader = self
            .call("eth_getBlockByNumber", json!([quantity(number), false]))
            .await?
            .ok_or_else(|| SyncError::Source(format!("block {} not found", number)))?;
        parse_quantity(&header.timestamp)
            .and_then(|t| i64::try_from(t).ok())
            .ok_or_else(|| SyncError::Source(format!("bad timestamp {:?}", header.timestamp)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_quantity() {
        assert_eq!(parse_quantity("0x0"), Some(0));
        assert_eq!(parse_quantity("0x1a"), Some(26));
        assert_eq!(parse_quantity("0X10"), Some(16));
        assert_eq!(parse_quantity("0x"), None);
        assert_eq!(parse_quantity("26"), None);
        assert_eq!(parse_quantity("0xzz"), None);
    }

    #[test]
    fn test_rpc_log_conversion() {
        let body = r#"{
            "jsonrpc": "2.0",
            "id": 1,
            "result": [{
                "address": "0x39053d51b77dc0d36036fc1fcc8cb819df8ef37a",
                "topics": ["0xc3ee9f2e5fda98e8066a1f745b2df9285f416fe98cf2559cd21484b3d8743304"],
                "data": "0x",
                "blockNumber": "0x3e8",
                "transactionHash": "0x1111111111111111111111111111111111111111111111111111111111111111",
                "transactionIndex": "0x2",
                "logIndex": "0x5",
                "removed": false
            }]
        }"#;

        let resp: RpcResponse<Vec<RpcLog>> = serde_json::from_str(body).unwrap();
        let logs: Vec<RawLog> = resp.result.unwrap().into_iter().map(RawLog::from).collect();

        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].block_number, Some(1_000));
        assert_eq!(logs[0].transaction_index, Some(2));
        assert_eq!(logs[0].log_index, Some(5));
        assert_eq!(logs[0].block_time, None);
        assert!(!logs[0].removed);
    }

    #[test]
    fn test_rpc_error_shape() {
        let body = r#"{"jsonrpc":"2.0","id":3,"error":{"code":-32005,"message":"query returned more than 10000 results"}}"#;
        let resp: RpcResponse<Vec<RpcLog>> = serde_json::from_str(body).unwrap();
        assert!(resp.result.is_none());
        let err = resp.error.unwrap();
        assert_eq!(err.code, -32005);
        assert!(err.message.contains("10000"));
    }
}
