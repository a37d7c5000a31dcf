//! WebSocket JSON-RPC client with `eth_subscribe` fan-out.
//!
//! A background task owns the socket. Callers talk to it through a command
//! channel; responses come back on per-request oneshots and subscription
//! notifications on per-subscription channels. The client does not
//! reconnect: when the socket closes every pending call fails and every
//! subscription channel closes.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use recycleindex_core::error::IndexerError;

use crate::rpc::{JsonRpcRequest, JsonRpcResponse};

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, IndexerError>>>>>;

/// Command sent from callers to the background WS task.
enum WsCommand {
    Send {
        req: JsonRpcRequest,
        tx: oneshot::Sender<Result<Value, IndexerError>>,
    },
    /// Drop the pending entry of a call that timed out.
    Forget(u64),
    Close,
}

// ─── Subscriptions ────────────────────────────────────────────────────────────

#[derive(Default)]
struct SubscriptionTable {
    senders: HashMap<String, mpsc::UnboundedSender<Value>>,
    /// Notifications that beat their `eth_subscribe` response.
    early: HashMap<String, Vec<Value>>,
    /// Unsubscribed ids; their late notifications are discarded.
    removed: HashSet<String>,
}

/// Routes `eth_subscription` notifications to their subscriber.
#[derive(Clone, Default)]
pub(crate) struct Subscriptions {
    table: Arc<Mutex<SubscriptionTable>>,
}

impl Subscriptions {
    fn lock(&self) -> std::sync::MutexGuard<'_, SubscriptionTable> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn register(&self, id: &str) -> mpsc::UnboundedReceiver<Value> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut table = self.lock();
        table.removed.remove(id);
        for message in table.early.remove(id).unwrap_or_default() {
            let _ = tx.send(message);
        }
        table.senders.insert(id.to_string(), tx);
        rx
    }

    pub(crate) fn dispatch(&self, id: &str, message: Value) {
        let mut table = self.lock();
        if table.removed.contains(id) {
            return;
        }
        match table.senders.get(id) {
            Some(tx) => {
                let _ = tx.send(message);
            }
            None => table.early.entry(id.to_string()).or_default().push(message),
        }
    }

    pub(crate) fn remove(&self, id: &str) {
        let mut table = self.lock();
        table.senders.remove(id);
        table.early.remove(id);
        table.removed.insert(id.to_string());
    }

    fn clear(&self) {
        let mut table = self.lock();
        table.senders.clear();
        table.early.clear();
        table.removed.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().senders.len()
    }
}

// ─── Client ───────────────────────────────────────────────────────────────────

/// WebSocket JSON-RPC client.
pub struct WsRpcClient {
    url: String,
    cmd_tx: mpsc::UnboundedSender<WsCommand>,
    subscriptions: Subscriptions,
    next_id: AtomicU64,
    request_timeout: Duration,
}

impl WsRpcClient {
    /// Connect to `url` and start the background task.
    pub async fn connect(url: impl Into<String>) -> Result<Self, IndexerError> {
        let url = url.into();
        info!(url = %url, "connecting via WebSocket");
        let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| IndexerError::Feed(format!("connect to {url} failed: {e}")))?;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let subscriptions = Subscriptions::default();
        tokio::spawn(ws_task(ws_stream, cmd_rx, subscriptions.clone()));

        Ok(Self {
            url,
            cmd_tx,
            subscriptions,
            next_id: AtomicU64::new(1),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        })
    }

    /// Fail calls that get no response within `timeout`.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// `true` once the socket task has ended.
    pub fn is_closed(&self) -> bool {
        self.cmd_tx.is_closed()
    }

    /// Send a request and wait for its result, at most the request timeout.
    pub async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, IndexerError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(WsCommand::Send {
                req: JsonRpcRequest::new(id, method, params),
                tx,
            })
            .map_err(|_| IndexerError::Feed("WS task closed".into()))?;
        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(response) => {
                response.map_err(|_| IndexerError::Feed("WS response dropped".into()))?
            }
            Err(_) => {
                let _ = self.cmd_tx.send(WsCommand::Forget(id));
                Err(IndexerError::Feed(format!(
                    "{method} timed out after {}ms",
                    self.request_timeout.as_millis()
                )))
            }
        }
    }

    /// `eth_subscribe(kind, ...params)`; returns the subscription id and its
    /// notification channel.
    pub async fn subscribe(
        &self,
        kind: &str,
        params: Vec<Value>,
    ) -> Result<(String, mpsc::UnboundedReceiver<Value>), IndexerError> {
        let params = std::iter::once(Value::String(kind.to_string()))
            .chain(params)
            .collect();
        let id = self.call("eth_subscribe", params).await?;
        let id = id
            .as_str()
            .ok_or_else(|| IndexerError::Feed(format!("unexpected subscription id {id}")))?
            .to_string();
        let rx = self.subscriptions.register(&id);
        debug!(subscription = %id, kind, "subscribed");
        Ok((id, rx))
    }

    /// `eth_unsubscribe`; the notification channel closes either way.
    pub async fn unsubscribe(&self, id: &str) -> Result<bool, IndexerError> {
        self.subscriptions.remove(id);
        let done = self
            .call("eth_unsubscribe", vec![Value::String(id.to_string())])
            .await?;
        Ok(done.as_bool().unwrap_or(false))
    }

    /// Number of live subscription channels.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Close the socket. Pending calls fail.
    pub fn close(&self) {
        let _ = self.cmd_tx.send(WsCommand::Close);
    }
}

impl Drop for WsRpcClient {
    fn drop(&mut self) {
        self.close();
    }
}

/// Background task that owns the WebSocket connection.
async fn ws_task<S>(
    ws_stream: tokio_tungstenite::WebSocketStream<S>,
    mut cmd_rx: mpsc::UnboundedReceiver<WsCommand>,
    subscriptions: Subscriptions,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
    let (mut sink, mut stream) = ws_stream.split();

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    None | Some(WsCommand::Close) => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                    Some(WsCommand::Send { req, tx }) => {
                        let msg = match serde_json::to_string(&req) {
                            Ok(msg) => msg,
                            Err(e) => {
                                let _ = tx.send(Err(IndexerError::Feed(e.to_string())));
                                continue;
                            }
                        };
                        lock(&pending).insert(req.id, tx);
                        if sink.send(Message::Text(msg.into())).await.is_err() {
                            break;
                        }
                    }
                    Some(WsCommand::Forget(id)) => {
                        lock(&pending).remove(&id);
                    }
                }
            }
            msg = stream.next() => {
                match msg {
                    None => break,
                    Some(Err(e)) => {
                        warn!(error = %e, "WS receive error");
                        break;
                    }
                    Some(Ok(Message::Text(text))) => {
                        handle_message(text.as_str(), &pending, &subscriptions);
                    }
                    Some(Ok(Message::Close(_))) => break,
                    _ => {}
                }
            }
        }
    }

    warn!("WS connection closed");
    for (_, tx) in lock(&pending).drain() {
        let _ = tx.send(Err(IndexerError::Feed("connection closed".into())));
    }
    subscriptions.clear();
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn handle_message(text: &str, pending: &PendingMap, subscriptions: &Subscriptions) {
    let Ok(val) = serde_json::from_str::<Value>(text) else {
        debug!("failed to parse WS message as JSON");
        return;
    };

    if val.get("method").and_then(|m| m.as_str()) == Some("eth_subscription") {
        let params = &val["params"];
        if let Some(id) = params["subscription"].as_str() {
            subscriptions.dispatch(id, params["result"].clone());
        }
        return;
    }

    let resp = match serde_json::from_value::<JsonRpcResponse>(val) {
        Ok(resp) => resp,
        Err(e) => {
            debug!(error = %e, "unrecognised WS message");
            return;
        }
    };
    let Some(id) = resp.id else { return };
    if let Some(tx) = lock(pending).remove(&id) {
        let result = resp
            .into_result()
            .map_err(|e| IndexerError::Feed(e.to_string()));
        let _ = tx.send(result);
    }
}
