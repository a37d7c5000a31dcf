//! recycleindex-evm: RecycleChain contract events from an EVM node.
//!
//! # Architecture
//!
//! ```text
//! WsFeed (Feed impl)
//!   ├── WsRpcClient  (JSON-RPC 2.0 over WebSocket, eth_subscribe fan-out)
//!   ├── eth_getLogs  (range split into max_block_range chunks)
//!   └── contract     (topic0 per event, ABI decoding of log data)
//! ```

pub mod contract;
pub mod feed;
pub mod rpc;
pub mod ws;

pub use contract::{decode_log, event_signature, kind_for_topic, topic0};
pub use feed::{EvmFeedConfig, WsFeed};
pub use rpc::RawLog;
pub use ws::WsRpcClient;
