//! Block reference → wall-clock timestamp resolution.

use chrono::{DateTime, TimeZone, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tracing::warn;

use crate::error::IndexerError;
use crate::feed::Feed;

/// Default number of block timestamps kept in memory.
pub const DEFAULT_CACHE_BLOCKS: usize = 256;

#[derive(Default)]
struct BlockTimeCache {
    times: HashMap<u64, DateTime<Utc>>,
    order: VecDeque<u64>,
}

/// Resolves block numbers to timestamps through the feed.
///
/// Successful lookups are memoized in a bounded window (oldest evicted
/// first); failures are not cached.
pub struct TimestampResolver {
    feed: Arc<dyn Feed>,
    cache: Mutex<BlockTimeCache>,
    capacity: usize,
}

impl TimestampResolver {
    pub fn new(feed: Arc<dyn Feed>) -> Self {
        Self::with_capacity(feed, DEFAULT_CACHE_BLOCKS)
    }

    pub fn with_capacity(feed: Arc<dyn Feed>, capacity: usize) -> Self {
        Self {
            feed,
            cache: Mutex::new(BlockTimeCache::default()),
            capacity,
        }
    }

    /// Resolve the timestamp of `block`.
    ///
    /// An absent block reference degrades to the current time with a
    /// warning. A lookup that fails, or finds no such block, is
    /// `BlockLookupFailed`.
    pub async fn resolve(&self, block: Option<u64>) -> Result<DateTime<Utc>, IndexerError> {
        let Some(block_number) = block else {
            warn!("no block number provided, using current time");
            return Ok(Utc::now());
        };

        if let Some(ts) = self.cached(block_number) {
            return Ok(ts);
        }

        let seconds = self
            .feed
            .block_timestamp(block_number)
            .await
            .map_err(|e| IndexerError::BlockLookupFailed {
                block_number,
                reason: e.to_string(),
            })?
            .ok_or_else(|| IndexerError::BlockLookupFailed {
                block_number,
                reason: "block not found".into(),
            })?;

        let ts = Utc
            .timestamp_opt(seconds, 0)
            .single()
            .ok_or_else(|| IndexerError::BlockLookupFailed {
                block_number,
                reason: format!("timestamp {seconds} out of range"),
            })?;

        self.remember(block_number, ts);
        Ok(ts)
    }

    fn cached(&self, block_number: u64) -> Option<DateTime<Utc>> {
        let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.times.get(&block_number).copied()
    }

    fn remember(&self, block_number: u64, ts: DateTime<Utc>) {
        if self.capacity == 0 {
            return;
        }
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        if cache.times.insert(block_number, ts).is_none() {
            cache.order.push_back(block_number);
        }
        while cache.order.len() > self.capacity {
            if let Some(oldest) = cache.order.pop_front() {
                cache.times.remove(&oldest);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::MemoryFeed;

    #[tokio::test]
    async fn resolves_block_timestamp() {
        let feed = Arc::new(MemoryFeed::new());
        feed.insert_block(100, 1_700_000_100);
        let resolver = TimestampResolver::new(feed);

        let ts = resolver.resolve(Some(100)).await.unwrap();
        assert_eq!(ts.timestamp(), 1_700_000_100);
    }

    #[tokio::test]
    async fn missing_block_reference_uses_now() {
        let resolver = TimestampResolver::new(Arc::new(MemoryFeed::new()));
        let before = Utc::now();
        let ts = resolver.resolve(None).await.unwrap();
        let after = Utc::now();
        assert!(ts >= before - chrono::Duration::seconds(5));
        assert!(ts <= after + chrono::Duration::seconds(5));
    }

    #[tokio::test]
    async fn unknown_block_fails() {
        let resolver = TimestampResolver::new(Arc::new(MemoryFeed::new()));
        let err = resolver.resolve(Some(42)).await.unwrap_err();
        assert!(matches!(err, IndexerError::BlockLookupFailed { block_number: 42, .. }));
    }

    #[tokio::test]
    async fn offline_feed_fails_and_is_not_cached() {
        let feed = Arc::new(MemoryFeed::new());
        feed.insert_block(7, 1_000);
        feed.set_offline(true);
        let resolver = TimestampResolver::new(feed.clone());

        assert!(matches!(
            resolver.resolve(Some(7)).await,
            Err(IndexerError::BlockLookupFailed { .. })
        ));

        feed.set_offline(false);
        assert_eq!(resolver.resolve(Some(7)).await.unwrap().timestamp(), 1_000);
    }

    #[tokio::test]
    async fn repeated_block_is_looked_up_once() {
        let feed = Arc::new(MemoryFeed::new());
        feed.insert_block(5, 500);
        let resolver = TimestampResolver::new(feed.clone());

        for _ in 0..3 {
            resolver.resolve(Some(5)).await.unwrap();
        }
        assert_eq!(feed.block_lookups(), 1);
    }

    #[tokio::test]
    async fn cache_evicts_oldest_block() {
        let feed = Arc::new(MemoryFeed::new());
        for b in 1..=3 {
            feed.insert_block(b, b as i64 * 10);
        }
        let resolver = TimestampResolver::with_capacity(feed.clone(), 2);

        resolver.resolve(Some(1)).await.unwrap();
        resolver.resolve(Some(2)).await.unwrap();
        resolver.resolve(Some(3)).await.unwrap(); // evicts 1
        assert_eq!(feed.block_lookups(), 3);

        resolver.resolve(Some(3)).await.unwrap();
        assert_eq!(feed.block_lookups(), 3);
        resolver.resolve(Some(1)).await.unwrap();
        assert_eq!(feed.block_lookups(), 4);
    }
}
