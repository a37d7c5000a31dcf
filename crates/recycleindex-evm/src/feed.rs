//! `Feed` implementation over an EVM node's WebSocket endpoint.

use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::Address;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use recycleindex_core::error::IndexerError;
use recycleindex_core::feed::{EventKind, EventReceiver, Feed, FeedEvent};

use crate::contract::{decode_log, topic0};
use crate::rpc::{block_timestamp_from_json, hex_quantity, parse_hex_u64, RawLog};
use crate::ws::WsRpcClient;

/// Connection settings for [`WsFeed`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvmFeedConfig {
    /// Node WebSocket endpoint.
    pub rpc_url: String,
    /// Deployed RecycleChain contract.
    pub contract_address: String,
    /// Largest block span per `eth_getLogs` request.
    pub max_block_range: u64,
    /// Buffered events per live subscription.
    pub channel_capacity: usize,
    /// Per-request timeout for every JSON-RPC call.
    pub request_timeout_ms: u64,
}

impl Default for EvmFeedConfig {
    fn default() -> Self {
        Self {
            rpc_url: "ws://127.0.0.1:8545".into(),
            contract_address: String::new(),
            max_block_range: 2_000,
            channel_capacity: 1_024,
            request_timeout_ms: 30_000,
        }
    }
}

/// Split `[from, to]` into inclusive chunks of at most `max` blocks.
pub fn block_chunks(from: u64, to: u64, max: u64) -> Vec<(u64, u64)> {
    let max = max.max(1);
    let mut chunks = Vec::new();
    let mut start = from;
    while start <= to {
        let end = start.saturating_add(max - 1).min(to);
        chunks.push((start, end));
        if end == u64::MAX {
            break;
        }
        start = end + 1;
    }
    chunks
}

/// Ledger feed backed by a node's JSON-RPC WebSocket.
///
/// The socket opens on first use, so historical queries work before
/// [`Feed::connect`] is called.
pub struct WsFeed {
    config: EvmFeedConfig,
    address: Address,
    client: Mutex<Option<Arc<WsRpcClient>>>,
    subscriptions: Mutex<Vec<String>>,
}

impl WsFeed {
    pub fn new(config: EvmFeedConfig) -> Result<Self, IndexerError> {
        let address: Address = config.contract_address.parse().map_err(|e| {
            IndexerError::Config(format!(
                "invalid contract address '{}': {e}",
                config.contract_address
            ))
        })?;
        Ok(Self {
            config,
            address,
            client: Mutex::new(None),
            subscriptions: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &EvmFeedConfig {
        &self.config
    }

    /// Log filter for one event kind.
    fn filter(&self, kind: EventKind) -> Value {
        json!({
            "address": format!("0x{}", hex::encode(self.address.as_slice())),
            "topics": [format!("0x{}", hex::encode(topic0(kind).as_slice()))],
        })
    }

    async fn client(&self) -> Result<Arc<WsRpcClient>, IndexerError> {
        let mut guard = self.client.lock().await;
        if let Some(client) = guard.as_ref() {
            if !client.is_closed() {
                return Ok(client.clone());
            }
            warn!(url = %self.config.rpc_url, "WS connection lost; reconnecting");
        }
        let client = WsRpcClient::connect(self.config.rpc_url.clone())
            .await?
            .with_request_timeout(Duration::from_millis(self.config.request_timeout_ms));
        let client = Arc::new(client);
        *guard = Some(client.clone());
        Ok(client)
    }

    async fn get_logs(&self, kind: EventKind, from: u64, to: u64) -> Result<Vec<RawLog>, IndexerError> {
        let mut filter = self.filter(kind);
        filter["fromBlock"] = Value::String(hex_quantity(from));
        filter["toBlock"] = Value::String(hex_quantity(to));

        let result = self.client().await?.call("eth_getLogs", vec![filter]).await?;
        serde_json::from_value(result)
            .map_err(|e| IndexerError::Feed(format!("eth_getLogs: bad response: {e}")))
    }
}

#[async_trait]
impl Feed for WsFeed {
    async fn connect(&self) -> Result<(), IndexerError> {
        self.client().await?;
        info!(url = %self.config.rpc_url, contract = %self.address, "feed connected");
        Ok(())
    }

    async fn subscribe(&self, kind: EventKind) -> Result<EventReceiver, IndexerError> {
        let client = self.client().await?;
        let (id, mut notifications) = client
            .subscribe("logs", vec![self.filter(kind)])
            .await?;
        self.subscriptions.lock().await.push(id.clone());

        let (tx, rx) = mpsc::channel(self.config.channel_capacity);
        tokio::spawn(async move {
            while let Some(value) = notifications.recv().await {
                let log: RawLog = match serde_json::from_value(value) {
                    Ok(log) => log,
                    Err(e) => {
                        warn!(%kind, error = %e, "unparseable log notification");
                        continue;
                    }
                };
                if log.is_removed() {
                    debug!(%kind, tx_hash = ?log.tx_hash, "skipping removed log");
                    continue;
                }
                match decode_log(&log) {
                    Ok(event) => {
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(%kind, error = %e, "skipping undecodable log"),
                }
            }
            debug!(%kind, subscription = %id, "log forwarder finished");
        });
        Ok(rx)
    }

    async fn unsubscribe_all(&self) -> Result<(), IndexerError> {
        let ids: Vec<String> = self.subscriptions.lock().await.drain(..).collect();
        let client = self.client.lock().await.clone();
        let Some(client) = client else {
            return Ok(());
        };
        for id in ids {
            if let Err(e) = client.unsubscribe(&id).await {
                warn!(subscription = %id, error = %e, "eth_unsubscribe failed");
            }
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), IndexerError> {
        if let Some(client) = self.client.lock().await.take() {
            client.close();
            info!(url = %client.url(), "feed disconnected");
        }
        Ok(())
    }

    async fn query_historical(
        &self,
        kind: EventKind,
        from: u64,
        to: u64,
    ) -> Result<Vec<FeedEvent>, IndexerError> {
        let mut events = Vec::new();
        for (start, end) in block_chunks(from, to, self.config.max_block_range) {
            let logs = self.get_logs(kind, start, end).await?;
            debug!(%kind, from = start, to = end, logs = logs.len(), "fetched logs");
            for log in logs.iter().filter(|l| !l.is_removed()) {
                match decode_log(log) {
                    Ok(event) => events.push(event),
                    Err(e) => warn!(%kind, error = %e, "skipping undecodable log"),
                }
            }
        }
        Ok(events)
    }

    async fn block_timestamp(&self, block_number: u64) -> Result<Option<i64>, IndexerError> {
        let block = self
            .client()
            .await?
            .call(
                "eth_getBlockByNumber",
                vec![Value::String(hex_quantity(block_number)), Value::Bool(false)],
            )
            .await?;
        if block.is_null() {
            return Ok(None);
        }
        block_timestamp_from_json(&block).map(Some).ok_or_else(|| {
            IndexerError::Feed(format!("block {block_number} has no valid timestamp"))
        })
    }

    async fn current_block_number(&self) -> Result<u64, IndexerError> {
        let head = self.client().await?.call("eth_blockNumber", vec![]).await?;
        head.as_str()
            .and_then(parse_hex_u64)
            .ok_or_else(|| IndexerError::Feed(format!("eth_blockNumber: unexpected result {head}")))
    }
}
