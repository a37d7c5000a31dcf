//! Product item lifecycle status and the on-chain status index table.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::IndexerError;

/// Lifecycle state of a product item.
///
/// Transitions are not enforced: any status received from the ledger
/// overwrites the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleStatus {
    Manufactured,
    Sold,
    Returned,
    Recycled,
}

/// Ordered by the contract's status enum.
const STATUS_TABLE: [LifecycleStatus; 4] = [
    LifecycleStatus::Manufactured,
    LifecycleStatus::Sold,
    LifecycleStatus::Returned,
    LifecycleStatus::Recycled,
];

/// Map a contract status index to its lifecycle state.
pub fn map_status(index: u64) -> Result<LifecycleStatus, IndexerError> {
    usize::try_from(index)
        .ok()
        .and_then(|i| STATUS_TABLE.get(i).copied())
        .ok_or_else(|| IndexerError::InvalidStatusIndex(index.to_string()))
}

impl LifecycleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manufactured => "MANUFACTURED",
            Self::Sold => "SOLD",
            Self::Returned => "RETURNED",
            Self::Recycled => "RECYCLED",
        }
    }
}

impl std::fmt::Display for LifecycleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LifecycleStatus {
    type Err = IndexerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        STATUS_TABLE
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| IndexerError::Store(format!("unknown lifecycle status '{s}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_every_defined_index() {
        assert_eq!(map_status(0).unwrap(), LifecycleStatus::Manufactured);
        assert_eq!(map_status(1).unwrap(), LifecycleStatus::Sold);
        assert_eq!(map_status(2).unwrap(), LifecycleStatus::Returned);
        assert_eq!(map_status(3).unwrap(), LifecycleStatus::Recycled);
    }

    #[test]
    fn rejects_out_of_range_index() {
        for index in [4, 5, 255, u64::MAX] {
            let err = map_status(index).unwrap_err();
            assert!(matches!(err, IndexerError::InvalidStatusIndex(ref s) if *s == index.to_string()));
        }
    }

    #[test]
    fn name_roundtrip() {
        for status in STATUS_TABLE {
            assert_eq!(status.as_str().parse::<LifecycleStatus>().unwrap(), status);
        }
        assert!("BROKEN".parse::<LifecycleStatus>().is_err());
        assert_eq!(
            serde_json::to_string(&LifecycleStatus::Recycled).unwrap(),
            "\"RECYCLED\""
        );
    }
}
