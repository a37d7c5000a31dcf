//! Error types for the recycleindex pipeline.

use thiserror::Error;

use crate::types::EntityKind;

/// Errors that can occur while normalizing and applying ledger events.
#[derive(Debug, Error)]
pub enum IndexerError {
    #[error("invalid status index {0}")]
    InvalidStatusIndex(String),

    #[error("block lookup failed for block {block_number}: {reason}")]
    BlockLookupFailed { block_number: u64, reason: String },

    #[error("{entity} '{id}' already exists")]
    DuplicateEntity { entity: EntityKind, id: String },

    #[error("{entity} '{id}' references missing {target} '{target_id}'")]
    DanglingReference {
        entity: EntityKind,
        id: String,
        target: EntityKind,
        target_id: String,
    },

    #[error("malformed {kind} event: {reason}")]
    MalformedEvent { kind: String, reason: String },

    #[error("product '{product_id}' still missing after {attempts} attempts")]
    ParentNotFoundAfterRetry { product_id: String, attempts: u32 },

    #[error("feed error: {0}")]
    Feed(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("cannot {operation} while {state}")]
    InvalidState { operation: String, state: String },

    #[error("invalid block range {from}..={to}")]
    InvalidRange { from: u64, to: u64 },

    #[error("cancelled by shutdown")]
    Cancelled,

    #[error("config error: {0}")]
    Config(String),
}

impl IndexerError {
    /// Returns `true` for store constraint violations (never retried).
    pub fn is_constraint_violation(&self) -> bool {
        matches!(
            self,
            Self::DuplicateEntity { .. } | Self::DanglingReference { .. }
        )
    }

    /// Returns `true` if the event is dropped rather than failed.
    pub fn is_dropped(&self) -> bool {
        matches!(
            self,
            Self::MalformedEvent { .. } | Self::ParentNotFoundAfterRetry { .. }
        )
    }

    pub fn malformed(kind: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedEvent {
            kind: kind.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_constraint_violations() {
        let dup = IndexerError::DuplicateEntity {
            entity: EntityKind::Manufacturer,
            id: "0x1".into(),
        };
        assert!(dup.is_constraint_violation());
        assert!(!dup.is_dropped());
        assert_eq!(dup.to_string(), "manufacturer '0x1' already exists");

        let dangling = IndexerError::DanglingReference {
            entity: EntityKind::Product,
            id: "7".into(),
            target: EntityKind::Manufacturer,
            target_id: "0x1".into(),
        };
        assert!(dangling.is_constraint_violation());
    }

    #[test]
    fn malformed_is_dropped() {
        let err = IndexerError::malformed("ProductItemsStatusChanged", "missing block number");
        assert!(err.is_dropped());
        assert!(!IndexerError::Feed("down".into()).is_dropped());
    }
}
