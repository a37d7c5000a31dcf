//! Raw feed event → canonical record decoding.
//!
//! The only I/O performed here is the timestamp lookup, so the same
//! normalizer serves both the live and the backfill drivers.

use alloy_primitives::U256;
use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::error::IndexerError;
use crate::feed::{EventKind, EventPayload, FeedEvent};
use crate::status::{map_status, LifecycleStatus};
use crate::timestamp::TimestampResolver;
use crate::types::{Manufacturer, Product, ToxicItem};

/// A batch of freshly created items for one product.
#[derive(Debug, Clone, PartialEq)]
pub struct ProductItemBatch {
    pub product_id: String,
    pub item_ids: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

/// A status change applied to a set of items.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub item_ids: Vec<String>,
    pub status: LifecycleStatus,
    pub timestamp: DateTime<Utc>,
}

/// Feed-shape-independent domain change, ready for the applier.
#[derive(Debug, Clone, PartialEq)]
pub enum CanonicalRecord {
    Manufacturer(Manufacturer),
    Product(Product),
    ProductItems(ProductItemBatch),
    StatusUpdate(StatusUpdate),
    ToxicItem(ToxicItem),
}

impl CanonicalRecord {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Manufacturer(_) => EventKind::ManufacturerRegistered,
            Self::Product(_) => EventKind::ProductCreated,
            Self::ProductItems(_) => EventKind::ProductItemsAdded,
            Self::StatusUpdate(_) => EventKind::ProductItemsStatusChanged,
            Self::ToxicItem(_) => EventKind::ToxicItemCreated,
        }
    }
}

pub struct Normalizer {
    timestamps: Arc<TimestampResolver>,
}

impl Normalizer {
    pub fn new(timestamps: Arc<TimestampResolver>) -> Self {
        Self { timestamps }
    }

    pub async fn normalize(&self, event: &FeedEvent) -> Result<CanonicalRecord, IndexerError> {
        let block = event.meta.block_number;
        match &event.payload {
            EventPayload::ManufacturerRegistered {
                id,
                name,
                location,
                contact,
            } => Ok(CanonicalRecord::Manufacturer(Manufacturer {
                id: id.clone(),
                name: name.clone(),
                location: location.clone(),
                contact: contact.clone(),
                timestamp: self.timestamps.resolve(block).await?,
            })),

            EventPayload::ProductCreated {
                product_id,
                name,
                manufacturer,
            } => Ok(CanonicalRecord::Product(Product {
                id: product_id.to_string(),
                name: name.clone(),
                manufacturer_id: manufacturer.clone(),
                timestamp: self.timestamps.resolve(block).await?,
            })),

            EventPayload::ProductItemsAdded {
                product_item_ids,
                product_id,
            } => Ok(CanonicalRecord::ProductItems(ProductItemBatch {
                product_id: product_id.to_string(),
                item_ids: product_item_ids.clone(),
                timestamp: self.timestamps.resolve(block).await?,
            })),

            EventPayload::ProductItemsStatusChanged {
                product_item_ids,
                status_index,
            } => {
                // Map first: a bad index must not cost a block lookup.
                let status = status_from_index(*status_index)?;
                Ok(CanonicalRecord::StatusUpdate(StatusUpdate {
                    item_ids: product_item_ids.clone(),
                    status,
                    timestamp: self.timestamps.resolve(block).await?,
                }))
            }

            EventPayload::ToxicItemCreated {
                product_id,
                name,
                weight,
            } => {
                let weight = coerce_weight(*weight)?;
                Ok(CanonicalRecord::ToxicItem(ToxicItem {
                    product_id: product_id.to_string(),
                    name: name.clone(),
                    weight,
                    timestamp: self.timestamps.resolve(block).await?,
                }))
            }
        }
    }
}

fn status_from_index(index: U256) -> Result<LifecycleStatus, IndexerError> {
    let index =
        u64::try_from(index).map_err(|_| IndexerError::InvalidStatusIndex(index.to_string()))?;
    map_status(index)
}

/// Coerce an on-chain uint to a float weight. Values past `f64` precision
/// lose low digits, matching a plain numeric conversion of the decimal.
fn coerce_weight(weight: U256) -> Result<f64, IndexerError> {
    weight
        .to_string()
        .parse::<f64>()
        .map_err(|e| IndexerError::malformed(EventKind::ToxicItemCreated.name(), e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::{EventMeta, MemoryFeed};

    fn normalizer() -> (Arc<MemoryFeed>, Normalizer) {
        let feed = Arc::new(MemoryFeed::new());
        feed.insert_block(100, 1_700_000_100);
        feed.insert_block(101, 1_700_000_101);
        let resolver = Arc::new(TimestampResolver::new(feed.clone()));
        (feed, Normalizer::new(resolver))
    }

    #[tokio::test]
    async fn manufacturer_registered() {
        let (_, n) = normalizer();
        let ev = FeedEvent::at_block(
            EventPayload::ManufacturerRegistered {
                id: "1".into(),
                name: "Acme".into(),
                location: "NY".into(),
                contact: "c@acme.com".into(),
            },
            100,
        );
        let CanonicalRecord::Manufacturer(m) = n.normalize(&ev).await.unwrap() else {
            panic!("expected manufacturer");
        };
        assert_eq!(m.id, "1");
        assert_eq!(m.name, "Acme");
        assert_eq!(m.location, "NY");
        assert_eq!(m.contact, "c@acme.com");
        assert_eq!(m.timestamp.timestamp(), 1_700_000_100);
    }

    #[tokio::test]
    async fn product_id_is_stringified() {
        let (_, n) = normalizer();
        let ev = FeedEvent::at_block(
            EventPayload::ProductCreated {
                product_id: U256::from(7u64),
                name: "Widget".into(),
                manufacturer: "1".into(),
            },
            101,
        );
        let record = n.normalize(&ev).await.unwrap();
        assert_eq!(record.kind(), EventKind::ProductCreated);
        let CanonicalRecord::Product(p) = record else {
            panic!("expected product");
        };
        assert_eq!(p.id, "7");
        assert_eq!(p.manufacturer_id, "1");
        assert_eq!(p.timestamp.timestamp(), 1_700_000_101);
    }

    #[tokio::test]
    async fn items_share_one_timestamp() {
        let (_, n) = normalizer();
        let ev = FeedEvent::at_block(
            EventPayload::ProductItemsAdded {
                product_item_ids: vec!["501".into(), "502".into()],
                product_id: U256::from(7u64),
            },
            100,
        );
        let CanonicalRecord::ProductItems(batch) = n.normalize(&ev).await.unwrap() else {
            panic!("expected item batch");
        };
        assert_eq!(batch.product_id, "7");
        assert_eq!(batch.item_ids, vec!["501", "502"]);
        assert_eq!(batch.timestamp.timestamp(), 1_700_000_100);
    }

    #[tokio::test]
    async fn status_change_maps_index() {
        let (_, n) = normalizer();
        let ev = FeedEvent::at_block(
            EventPayload::ProductItemsStatusChanged {
                product_item_ids: vec!["501".into()],
                status_index: U256::from(3u64),
            },
            101,
        );
        let CanonicalRecord::StatusUpdate(update) = n.normalize(&ev).await.unwrap() else {
            panic!("expected status update");
        };
        assert_eq!(update.status, LifecycleStatus::Recycled);
    }

    #[tokio::test]
    async fn invalid_status_index_skips_block_lookup() {
        let (feed, n) = normalizer();
        for index in [U256::from(4u64), U256::MAX] {
            let ev = FeedEvent::at_block(
                EventPayload::ProductItemsStatusChanged {
                    product_item_ids: vec!["501".into()],
                    status_index: index,
                },
                100,
            );
            let err = n.normalize(&ev).await.unwrap_err();
            assert!(matches!(err, IndexerError::InvalidStatusIndex(_)));
        }
        assert_eq!(feed.block_lookups(), 0);
    }

    #[tokio::test]
    async fn toxic_weight_is_numeric() {
        let (_, n) = normalizer();
        let ev = FeedEvent::at_block(
            EventPayload::ToxicItemCreated {
                product_id: U256::from(7u64),
                name: "Lead".into(),
                weight: U256::from(250u64),
            },
            100,
        );
        let CanonicalRecord::ToxicItem(t) = n.normalize(&ev).await.unwrap() else {
            panic!("expected toxic item");
        };
        assert_eq!(t.product_id, "7");
        assert_eq!(t.weight, 250.0);
    }

    #[tokio::test]
    async fn unknown_block_aborts_record() {
        let (_, n) = normalizer();
        let ev = FeedEvent::new(
            EventPayload::ProductItemsAdded {
                product_item_ids: vec!["1".into()],
                product_id: U256::from(1u64),
            },
            EventMeta::at_block(999),
        );
        assert!(matches!(
            n.normalize(&ev).await,
            Err(IndexerError::BlockLookupFailed { block_number: 999, .. })
        ));
    }
}
