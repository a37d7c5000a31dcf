//! Canonical record → store writes.
//!
//! Every public `apply_*` call maps to exactly one `Store::apply_atomic`
//! unit: primary rows and their audit rows commit together or not at all.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::IndexerError;
use crate::normalize::{CanonicalRecord, ProductItemBatch, StatusUpdate};
use crate::status::LifecycleStatus;
use crate::store::{Store, WriteOp, WriteSummary};
use crate::types::{EntityKind, Manufacturer, Product, ProductItem, ToxicItem, Transaction};

// ─── Retry configuration ──────────────────────────────────────────────────────

/// Bounded wait for a toxic item's parent product.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToxicRetryConfig {
    /// Total number of existence checks, including the first.
    pub max_attempts: u32,
    /// Fixed pause after every failed check.
    pub delay_ms: u64,
}

impl Default for ToxicRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay_ms: 1_000,
        }
    }
}

impl ToxicRetryConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

/// What happens to a toxic item whose product never shows up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrphanPolicy {
    /// Give up without inserting and without an error.
    #[default]
    Drop,
    /// Fail with `ParentNotFoundAfterRetry`.
    Error,
}

/// Result of one successful apply call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied(WriteSummary),
    /// Nothing was written; the record was abandoned on purpose.
    Dropped,
}

// ─── Applier ──────────────────────────────────────────────────────────────────

pub struct Applier {
    store: Arc<dyn Store>,
    retry: ToxicRetryConfig,
    orphans: OrphanPolicy,
}

impl Applier {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            retry: ToxicRetryConfig::default(),
            orphans: OrphanPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: ToxicRetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_orphan_policy(mut self, orphans: OrphanPolicy) -> Self {
        self.orphans = orphans;
        self
    }

    /// Dispatch a record to its apply operation.
    ///
    /// `cancel` only interrupts the toxic-item retry wait; a store call that
    /// is already running is never abandoned.
    pub async fn apply(
        &self,
        record: CanonicalRecord,
        cancel: &CancellationToken,
    ) -> Result<ApplyOutcome, IndexerError> {
        match record {
            CanonicalRecord::Manufacturer(m) => self.apply_manufacturer(m).await,
            CanonicalRecord::Product(p) => self.apply_product(p).await,
            CanonicalRecord::ProductItems(batch) => self.apply_product_item_batch(batch).await,
            CanonicalRecord::StatusUpdate(update) => self.apply_status_update(update).await,
            CanonicalRecord::ToxicItem(item) => self.apply_toxic_item(item, cancel).await,
        }
    }

    pub async fn apply_manufacturer(&self, m: Manufacturer) -> Result<ApplyOutcome, IndexerError> {
        let id = m.id.clone();
        let summary = self
            .store
            .apply_atomic(vec![WriteOp::InsertManufacturer(m)])
            .await?;
        info!(manufacturer = %id, "manufacturer registered");
        Ok(ApplyOutcome::Applied(summary))
    }

    pub async fn apply_product(&self, p: Product) -> Result<ApplyOutcome, IndexerError> {
        let id = p.id.clone();
        let summary = self.store.apply_atomic(vec![WriteOp::InsertProduct(p)]).await?;
        info!(product = %id, "product created");
        Ok(ApplyOutcome::Applied(summary))
    }

    /// Insert every item as `MANUFACTURED` with one creation audit row each.
    pub async fn apply_product_item_batch(
        &self,
        batch: ProductItemBatch,
    ) -> Result<ApplyOutcome, IndexerError> {
        let ProductItemBatch {
            product_id,
            item_ids,
            timestamp,
        } = batch;
        let count = item_ids.len();

        let mut ops = Vec::with_capacity(count * 2);
        for id in item_ids {
            ops.push(WriteOp::InsertProductItem(ProductItem {
                id: id.clone(),
                product_id: product_id.clone(),
                status: LifecycleStatus::Manufactured,
                timestamp,
            }));
            ops.push(WriteOp::AppendTransaction(Transaction {
                product_item_id: id,
                status: LifecycleStatus::Manufactured,
                timestamp,
            }));
        }

        let summary = self.store.apply_atomic(ops).await?;
        info!(product = %product_id, items = count, "product items added");
        Ok(ApplyOutcome::Applied(summary))
    }

    /// Overwrite the status of every listed item and append one audit row
    /// per id. Ids without an item row update nothing.
    pub async fn apply_status_update(
        &self,
        update: StatusUpdate,
    ) -> Result<ApplyOutcome, IndexerError> {
        let StatusUpdate {
            item_ids,
            status,
            timestamp,
        } = update;
        let requested = item_ids.len() as u64;

        let mut ops = Vec::with_capacity(item_ids.len() + 1);
        ops.push(WriteOp::UpdateItemStatus {
            item_ids: item_ids.clone(),
            status,
            timestamp,
        });
        ops.extend(item_ids.into_iter().map(|id| {
            WriteOp::AppendTransaction(Transaction {
                product_item_id: id,
                status,
                timestamp,
            })
        }));

        let summary = self.store.apply_atomic(ops).await?;
        if summary.updated < requested {
            debug!(
                requested,
                updated = summary.updated,
                %status,
                "status update matched fewer items than listed"
            );
        }
        info!(items = requested, %status, "product item status changed");
        Ok(ApplyOutcome::Applied(summary))
    }

    /// Insert a toxic item once its product exists.
    ///
    /// The product is checked up to `max_attempts` times with a fixed pause
    /// after each miss. On exhaustion the item is dropped (or rejected under
    /// `OrphanPolicy::Error`).
    pub async fn apply_toxic_item(
        &self,
        item: ToxicItem,
        cancel: &CancellationToken,
    ) -> Result<ApplyOutcome, IndexerError> {
        let attempts = self.retry.max_attempts;
        for attempt in 1..=attempts {
            if self.store.exists(EntityKind::Product, &item.product_id).await? {
                let product_id = item.product_id.clone();
                let summary = self
                    .store
                    .apply_atomic(vec![WriteOp::InsertToxicItem(item)])
                    .await?;
                info!(product = %product_id, attempt, "toxic item created");
                return Ok(ApplyOutcome::Applied(summary));
            }

            debug!(
                product = %item.product_id,
                attempt,
                max_attempts = attempts,
                "product not found for toxic item, waiting"
            );
            tokio::select! {
                _ = cancel.cancelled() => return Err(IndexerError::Cancelled),
                _ = tokio::time::sleep(self.retry.delay()) => {}
            }
        }

        match self.orphans {
            OrphanPolicy::Drop => {
                debug!(product = %item.product_id, "toxic item dropped, product never appeared");
                Ok(ApplyOutcome::Dropped)
            }
            OrphanPolicy::Error => {
                warn!(product = %item.product_id, attempts, "toxic item parent missing");
                Err(IndexerError::ParentNotFoundAfterRetry {
                    product_id: item.product_id,
                    attempts,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::{DateTime, Utc};

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    async fn seeded() -> (Arc<MemoryStore>, Applier) {
        let store = Arc::new(MemoryStore::new());
        let applier = Applier::new(store.clone());
        applier
            .apply_manufacturer(Manufacturer {
                id: "m1".into(),
                name: "Acme".into(),
                location: "NY".into(),
                contact: "c@acme.com".into(),
                timestamp: ts(100),
            })
            .await
            .unwrap();
        applier
            .apply_product(Product {
                id: "7".into(),
                name: "Widget".into(),
                manufacturer_id: "m1".into(),
                timestamp: ts(101),
            })
            .await
            .unwrap();
        (store, applier)
    }

    fn toxic(product_id: &str) -> ToxicItem {
        ToxicItem {
            product_id: product_id.into(),
            name: "Lead".into(),
            weight: 12.5,
            timestamp: ts(200),
        }
    }

    #[tokio::test]
    async fn batch_writes_items_and_history() {
        let (store, applier) = seeded().await;
        let outcome = applier
            .apply_product_item_batch(ProductItemBatch {
                product_id: "7".into(),
                item_ids: vec!["501".into(), "502".into()],
                timestamp: ts(102),
            })
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ApplyOutcome::Applied(WriteSummary {
                inserted: 4,
                updated: 0
            })
        );
        let item = store.product_item("502").unwrap();
        assert_eq!(item.status, LifecycleStatus::Manufactured);
        assert_eq!(store.transactions_for("501").len(), 1);
    }

    #[tokio::test]
    async fn batch_for_unknown_product_is_dangling() {
        let (store, applier) = seeded().await;
        let err = applier
            .apply_product_item_batch(ProductItemBatch {
                product_id: "99".into(),
                item_ids: vec!["1".into()],
                timestamp: ts(102),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, IndexerError::DanglingReference { .. }));
        assert!(store.snapshot().transactions.is_empty());
    }

    #[tokio::test]
    async fn status_update_for_unknown_ids_only_appends_history() {
        let (store, applier) = seeded().await;
        let outcome = applier
            .apply_status_update(StatusUpdate {
                item_ids: vec!["ghost".into()],
                status: LifecycleStatus::Sold,
                timestamp: ts(103),
            })
            .await
            .unwrap();
        let ApplyOutcome::Applied(summary) = outcome else {
            panic!("expected applied");
        };
        assert_eq!(summary.updated, 0);
        assert_eq!(store.transactions_for("ghost").len(), 1);
    }

    #[tokio::test]
    async fn duplicate_product_is_not_retried() {
        let (store, applier) = seeded().await;
        let err = applier
            .apply_product(Product {
                id: "7".into(),
                name: "Widget".into(),
                manufacturer_id: "m1".into(),
                timestamp: ts(101),
            })
            .await
            .unwrap_err();
        assert!(err.is_constraint_violation());
        assert_eq!(store.exists_checks(), 0);
    }

    #[tokio::test]
    async fn toxic_item_with_existing_product_inserts_at_once() {
        let (store, applier) = seeded().await;
        let outcome = applier
            .apply_toxic_item(toxic("7"), &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(outcome, ApplyOutcome::Applied(_)));
        assert_eq!(store.exists_checks(), 1);
        assert_eq!(store.toxic_items().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn toxic_item_gives_up_silently() {
        let (store, applier) = seeded().await;
        let started = tokio::time::Instant::now();
        let outcome = applier
            .apply_toxic_item(toxic("404"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Dropped);
        assert_eq!(store.exists_checks(), 5);
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(5) && waited < Duration::from_secs(6));
        assert!(store.toxic_items().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn strict_policy_reports_missing_parent() {
        let (_, applier) = seeded().await;
        let applier = applier
            .with_retry(ToxicRetryConfig {
                max_attempts: 2,
                delay_ms: 10,
            })
            .with_orphan_policy(OrphanPolicy::Error);
        let err = applier
            .apply_toxic_item(toxic("404"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            IndexerError::ParentNotFoundAfterRetry { attempts: 2, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_interrupts_retry_wait() {
        let (store, applier) = seeded().await;
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1_500)).await;
            trigger.cancel();
        });
        let err = applier
            .apply_toxic_item(toxic("404"), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, IndexerError::Cancelled));
        assert_eq!(store.exists_checks(), 2);
    }
}
