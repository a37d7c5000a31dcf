//! SQLite store backend.
//!
//! Every `apply_atomic` call runs in one sqlx transaction, so a failing op
//! rolls back the whole unit. Foreign keys are enforced by SQLite itself.
//!
//! # Usage
//! ```rust,no_run
//! use recycleindex_storage::sqlite::SqliteStore;
//!
//! # async fn example() -> Result<(), recycleindex_core::IndexerError> {
//! // File-backed (persistent)
//! let store = SqliteStore::open("./recycle.db").await?;
//!
//! // In-memory (tests / ephemeral)
//! let store = SqliteStore::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tracing::debug;

use recycleindex_core::error::IndexerError;
use recycleindex_core::status::LifecycleStatus;
use recycleindex_core::store::{Store, WriteOp, WriteSummary};
use recycleindex_core::types::{
    EntityKind, Manufacturer, Product, ProductItem, ToxicItem, Transaction,
};

const SCHEMA: [&str; 7] = [
    "CREATE TABLE IF NOT EXISTS manufacturers (
        id        TEXT PRIMARY KEY,
        name      TEXT NOT NULL,
        location  TEXT NOT NULL,
        contact   TEXT NOT NULL,
        timestamp TEXT NOT NULL
    );",
    "CREATE TABLE IF NOT EXISTS products (
        id              TEXT PRIMARY KEY,
        name            TEXT NOT NULL,
        manufacturer_id TEXT NOT NULL REFERENCES manufacturers (id),
        timestamp       TEXT NOT NULL
    );",
    "CREATE TABLE IF NOT EXISTS product_items (
        id         TEXT PRIMARY KEY,
        product_id TEXT NOT NULL REFERENCES products (id),
        status     TEXT NOT NULL,
        timestamp  TEXT NOT NULL
    );",
    // No FK: status updates for unknown items still leave an audit row.
    "CREATE TABLE IF NOT EXISTS transactions (
        id              INTEGER PRIMARY KEY AUTOINCREMENT,
        product_item_id TEXT NOT NULL,
        status          TEXT NOT NULL,
        timestamp       TEXT NOT NULL
    );",
    "CREATE TABLE IF NOT EXISTS toxic_items (
        id         INTEGER PRIMARY KEY AUTOINCREMENT,
        product_id TEXT NOT NULL REFERENCES products (id),
        name       TEXT NOT NULL,
        weight     REAL NOT NULL,
        timestamp  TEXT NOT NULL
    );",
    "CREATE INDEX IF NOT EXISTS idx_transactions_item ON transactions (product_item_id);",
    "CREATE INDEX IF NOT EXISTS idx_toxic_items_product ON toxic_items (product_id);",
];

/// Row counts per table, for status reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableCounts {
    pub manufacturers: u64,
    pub products: u64,
    pub product_items: u64,
    pub transactions: u64,
    pub toxic_items: u64,
}

/// SQLite-backed [`Store`].
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./recycle.db"`) or a full
    /// SQLite URL (`"sqlite:./recycle.db"`).
    pub async fn open(path: &str) -> Result<Self, IndexerError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}")
        };
        let options = SqliteConnectOptions::from_str(&url)
            .map_err(storage_err)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .connect_with(options)
            .await
            .map_err(storage_err)?;

        let store = Self { pool };
        store.init_schema().await?;
        debug!(path, "sqlite store opened");
        Ok(store)
    }

    /// Open an in-memory SQLite database.
    ///
    /// All data is lost when the pool is dropped. Ideal for tests.
    pub async fn in_memory() -> Result<Self, IndexerError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(storage_err)?
            .foreign_keys(true);

        // Each connection to `:memory:` is a separate database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(storage_err)?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), IndexerError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(storage_err)?;
        }
        Ok(())
    }

    // ─── Queries ────────────────────────────────────────────────────────────────

    pub async fn manufacturer(&self, id: &str) -> Result<Option<Manufacturer>, IndexerError> {
        let row = sqlx::query(
            "SELECT id, name, location, contact, timestamp FROM manufacturers WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(row.map(|r| Manufacturer {
            id: r.get("id"),
            name: r.get("name"),
            location: r.get("location"),
            contact: r.get("contact"),
            timestamp: r.get("timestamp"),
        }))
    }

    pub async fn product(&self, id: &str) -> Result<Option<Product>, IndexerError> {
        let row = sqlx::query(
            "SELECT id, name, manufacturer_id, timestamp FROM products WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(row.map(|r| Product {
            id: r.get("id"),
            name: r.get("name"),
            manufacturer_id: r.get("manufacturer_id"),
            timestamp: r.get("timestamp"),
        }))
    }

    pub async fn product_item(&self, id: &str) -> Result<Option<ProductItem>, IndexerError> {
        let row = sqlx::query(
            "SELECT id, product_id, status, timestamp FROM product_items WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;

        row.map(|r| {
            Ok(ProductItem {
                id: r.get("id"),
                product_id: r.get("product_id"),
                status: status_column(&r)?,
                timestamp: r.get("timestamp"),
            })
        })
        .transpose()
    }

    /// Status history of one item, oldest first.
    pub async fn transactions_for(&self, item_id: &str) -> Result<Vec<Transaction>, IndexerError> {
        let rows = sqlx::query(
            "SELECT product_item_id, status, timestamp FROM transactions
             WHERE product_item_id = ? ORDER BY id",
        )
        .bind(item_id)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        rows.iter()
            .map(|r| {
                Ok(Transaction {
                    product_item_id: r.get("product_item_id"),
                    status: status_column(r)?,
                    timestamp: r.get("timestamp"),
                })
            })
            .collect()
    }

    pub async fn toxic_items_for(&self, product_id: &str) -> Result<Vec<ToxicItem>, IndexerError> {
        let rows = sqlx::query(
            "SELECT product_id, name, weight, timestamp FROM toxic_items
             WHERE product_id = ? ORDER BY id",
        )
        .bind(product_id)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(rows
            .iter()
            .map(|r| ToxicItem {
                product_id: r.get("product_id"),
                name: r.get("name"),
                weight: r.get("weight"),
                timestamp: r.get("timestamp"),
            })
            .collect())
    }

    pub async fn counts(&self) -> Result<TableCounts, IndexerError> {
        let row = sqlx::query(
            "SELECT
                (SELECT COUNT(*) FROM manufacturers) AS manufacturers,
                (SELECT COUNT(*) FROM products)      AS products,
                (SELECT COUNT(*) FROM product_items) AS product_items,
                (SELECT COUNT(*) FROM transactions)  AS transactions,
                (SELECT COUNT(*) FROM toxic_items)   AS toxic_items",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(TableCounts {
            manufacturers: row.get::<i64, _>("manufacturers") as u64,
            products: row.get::<i64, _>("products") as u64,
            product_items: row.get::<i64, _>("product_items") as u64,
            transactions: row.get::<i64, _>("transactions") as u64,
            toxic_items: row.get::<i64, _>("toxic_items") as u64,
        })
    }
}

// ─── Store impl ──────────────────────────────────────────────────────────────

#[async_trait]
impl Store for SqliteStore {
    async fn apply_atomic(&self, ops: Vec<WriteOp>) -> Result<WriteSummary, IndexerError> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        let mut summary = WriteSummary::default();

        for op in &ops {
            let result = match op {
                WriteOp::InsertManufacturer(m) => sqlx::query(
                    "INSERT INTO manufacturers (id, name, location, contact, timestamp)
                     VALUES (?, ?, ?, ?, ?)",
                )
                .bind(&m.id)
                .bind(&m.name)
                .bind(&m.location)
                .bind(&m.contact)
                .bind(m.timestamp)
                .execute(&mut *tx)
                .await
                .map(|_| summary.inserted += 1),

                WriteOp::InsertProduct(p) => sqlx::query(
                    "INSERT INTO products (id, name, manufacturer_id, timestamp)
                     VALUES (?, ?, ?, ?)",
                )
                .bind(&p.id)
                .bind(&p.name)
                .bind(&p.manufacturer_id)
                .bind(p.timestamp)
                .execute(&mut *tx)
                .await
                .map(|_| summary.inserted += 1),

                WriteOp::InsertProductItem(item) => sqlx::query(
                    "INSERT INTO product_items (id, product_id, status, timestamp)
                     VALUES (?, ?, ?, ?)",
                )
                .bind(&item.id)
                .bind(&item.product_id)
                .bind(item.status.as_str())
                .bind(item.timestamp)
                .execute(&mut *tx)
                .await
                .map(|_| summary.inserted += 1),

                WriteOp::UpdateItemStatus {
                    item_ids,
                    status,
                    timestamp,
                } => {
                    let mut outcome = Ok(());
                    for id in item_ids {
                        match sqlx::query(
                            "UPDATE product_items SET status = ?, timestamp = ? WHERE id = ?",
                        )
                        .bind(status.as_str())
                        .bind(*timestamp)
                        .bind(id)
                        .execute(&mut *tx)
                        .await
                        {
                            Ok(done) => summary.updated += done.rows_affected(),
                            Err(e) => {
                                outcome = Err(e);
                                break;
                            }
                        }
                    }
                    outcome
                }

                WriteOp::AppendTransaction(t) => sqlx::query(
                    "INSERT INTO transactions (product_item_id, status, timestamp)
                     VALUES (?, ?, ?)",
                )
                .bind(&t.product_item_id)
                .bind(t.status.as_str())
                .bind(t.timestamp)
                .execute(&mut *tx)
                .await
                .map(|_| summary.inserted += 1),

                WriteOp::InsertToxicItem(t) => sqlx::query(
                    "INSERT INTO toxic_items (product_id, name, weight, timestamp)
                     VALUES (?, ?, ?, ?)",
                )
                .bind(&t.product_id)
                .bind(&t.name)
                .bind(t.weight)
                .bind(t.timestamp)
                .execute(&mut *tx)
                .await
                .map(|_| summary.inserted += 1),
            };

            // Dropping `tx` without commit rolls the unit back.
            if let Err(e) = result {
                return Err(map_write_error(op, e));
            }
        }

        tx.commit().await.map_err(storage_err)?;
        debug!(
            ops = ops.len(),
            inserted = summary.inserted,
            updated = summary.updated,
            "unit committed"
        );
        Ok(summary)
    }

    async fn exists(&self, kind: EntityKind, id: &str) -> Result<bool, IndexerError> {
        let sql = match kind {
            EntityKind::Manufacturer => "SELECT 1 FROM manufacturers WHERE id = ?",
            EntityKind::Product => "SELECT 1 FROM products WHERE id = ?",
            EntityKind::ProductItem => "SELECT 1 FROM product_items WHERE id = ?",
            EntityKind::Transaction | EntityKind::ToxicItem => {
                return Err(IndexerError::Store(format!(
                    "{kind} rows are not addressable by id"
                )))
            }
        };
        let row = sqlx::query(sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(row.is_some())
    }
}

// ─── Error mapping ───────────────────────────────────────────────────────────

fn storage_err(e: sqlx::Error) -> IndexerError {
    IndexerError::Store(e.to_string())
}

/// Translate a constraint failure into the domain error for `op`.
fn map_write_error(op: &WriteOp, e: sqlx::Error) -> IndexerError {
    let (unique, foreign_key) = match &e {
        sqlx::Error::Database(db) => (
            db.is_unique_violation() || db.message().contains("UNIQUE constraint failed"),
            db.is_foreign_key_violation() || db.message().contains("FOREIGN KEY constraint failed"),
        ),
        _ => (false, false),
    };

    match op {
        WriteOp::InsertManufacturer(m) if unique => IndexerError::DuplicateEntity {
            entity: EntityKind::Manufacturer,
            id: m.id.clone(),
        },
        WriteOp::InsertProduct(p) if unique => IndexerError::DuplicateEntity {
            entity: EntityKind::Product,
            id: p.id.clone(),
        },
        WriteOp::InsertProduct(p) if foreign_key => IndexerError::DanglingReference {
            entity: EntityKind::Product,
            id: p.id.clone(),
            target: EntityKind::Manufacturer,
            target_id: p.manufacturer_id.clone(),
        },
        WriteOp::InsertProductItem(item) if unique => IndexerError::DuplicateEntity {
            entity: EntityKind::ProductItem,
            id: item.id.clone(),
        },
        WriteOp::InsertProductItem(item) if foreign_key => IndexerError::DanglingReference {
            entity: EntityKind::ProductItem,
            id: item.id.clone(),
            target: EntityKind::Product,
            target_id: item.product_id.clone(),
        },
        WriteOp::InsertToxicItem(t) if foreign_key => IndexerError::DanglingReference {
            entity: EntityKind::ToxicItem,
            id: t.name.clone(),
            target: EntityKind::Product,
            target_id: t.product_id.clone(),
        },
        _ => storage_err(e),
    }
}

fn status_column(row: &SqliteRow) -> Result<LifecycleStatus, IndexerError> {
    let raw: String = row.get("status");
    raw.parse()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
