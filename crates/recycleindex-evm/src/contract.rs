//! RecycleChain contract events: signatures, topics and log decoding.
//!
//! No event parameter is indexed, so every argument is ABI-decoded from the
//! log data and `topics[0]` alone identifies the event.

use alloy_core::dyn_abi::{DynSolType, DynSolValue};
use alloy_primitives::{keccak256, B256, U256};

use recycleindex_core::error::IndexerError;
use recycleindex_core::feed::{EventKind, EventMeta, EventPayload, FeedEvent};

use crate::rpc::RawLog;

/// Canonical Solidity signature of `kind`.
pub fn event_signature(kind: EventKind) -> &'static str {
    match kind {
        EventKind::ManufacturerRegistered => "ManufacturerRegistered(address,string,string,string)",
        EventKind::ProductCreated => "ProductCreated(uint256,string,address)",
        EventKind::ProductItemsAdded => "ProductItemsAdded(string[],uint256)",
        EventKind::ProductItemsStatusChanged => "ProductItemsStatusChanged(string[],uint8)",
        EventKind::ToxicItemCreated => "ToxicItemCreated(uint256,string,uint256)",
    }
}

/// `keccak256` of the event signature.
pub fn topic0(kind: EventKind) -> B256 {
    keccak256(event_signature(kind).as_bytes())
}

pub fn kind_for_topic(topic: &B256) -> Option<EventKind> {
    EventKind::ALL.into_iter().find(|k| topic0(*k) == *topic)
}

fn data_types(kind: EventKind) -> Vec<DynSolType> {
    let strings = || DynSolType::Array(Box::new(DynSolType::String));
    match kind {
        EventKind::ManufacturerRegistered => vec![
            DynSolType::Address,
            DynSolType::String,
            DynSolType::String,
            DynSolType::String,
        ],
        EventKind::ProductCreated => vec![
            DynSolType::Uint(256),
            DynSolType::String,
            DynSolType::Address,
        ],
        EventKind::ProductItemsAdded => vec![strings(), DynSolType::Uint(256)],
        EventKind::ProductItemsStatusChanged => vec![strings(), DynSolType::Uint(8)],
        EventKind::ToxicItemCreated => vec![
            DynSolType::Uint(256),
            DynSolType::String,
            DynSolType::Uint(256),
        ],
    }
}

/// Decode a contract log into a typed feed event.
///
/// Unknown topics, undecodable data and removed logs are `MalformedEvent`.
pub fn decode_log(log: &RawLog) -> Result<FeedEvent, IndexerError> {
    let topic = log
        .topics
        .first()
        .ok_or_else(|| IndexerError::malformed("log", "no topics"))?;
    let topic: B256 = topic
        .parse()
        .map_err(|e| IndexerError::malformed("log", format!("bad topic0 '{topic}': {e}")))?;
    let kind = kind_for_topic(&topic)
        .ok_or_else(|| IndexerError::malformed("log", format!("unknown topic0 {topic}")))?;

    if log.is_removed() {
        return Err(IndexerError::malformed(kind.name(), "log removed by reorg"));
    }

    let data = hex::decode(log.data.strip_prefix("0x").unwrap_or(&log.data))
        .map_err(|e| IndexerError::malformed(kind.name(), format!("bad data hex: {e}")))?;
    let decoded = DynSolType::Tuple(data_types(kind))
        .abi_decode_params(&data)
        .map_err(|e| IndexerError::malformed(kind.name(), e.to_string()))?;
    let DynSolValue::Tuple(values) = decoded else {
        return Err(IndexerError::malformed(kind.name(), "expected tuple"));
    };

    let mut args = Args {
        kind,
        values: values.into_iter(),
    };
    let payload = match kind {
        EventKind::ManufacturerRegistered => EventPayload::ManufacturerRegistered {
            id: args.address()?,
            name: args.string()?,
            location: args.string()?,
            contact: args.string()?,
        },
        EventKind::ProductCreated => EventPayload::ProductCreated {
            product_id: args.uint()?,
            name: args.string()?,
            manufacturer: args.address()?,
        },
        EventKind::ProductItemsAdded => EventPayload::ProductItemsAdded {
            product_item_ids: args.strings()?,
            product_id: args.uint()?,
        },
        EventKind::ProductItemsStatusChanged => EventPayload::ProductItemsStatusChanged {
            product_item_ids: args.strings()?,
            status_index: args.uint()?,
        },
        EventKind::ToxicItemCreated => EventPayload::ToxicItemCreated {
            product_id: args.uint()?,
            name: args.string()?,
            weight: args.uint()?,
        },
    };

    Ok(FeedEvent::new(
        payload,
        EventMeta {
            block_number: log.block_number_u64(),
            log_index: log.log_index_u32(),
            tx_hash: log.tx_hash.clone(),
        },
    ))
}

/// Positional reader over decoded arguments.
struct Args {
    kind: EventKind,
    values: std::vec::IntoIter<DynSolValue>,
}

impl Args {
    fn next(&mut self) -> Result<DynSolValue, IndexerError> {
        self.values
            .next()
            .ok_or_else(|| IndexerError::malformed(self.kind.name(), "missing argument"))
    }

    fn mismatch(&self, expected: &str) -> IndexerError {
        IndexerError::malformed(self.kind.name(), format!("expected {expected}"))
    }

    /// Addresses render in EIP-55 checksum form.
    fn address(&mut self) -> Result<String, IndexerError> {
        match self.next()? {
            DynSolValue::Address(a) => Ok(a.to_checksum(None)),
            _ => Err(self.mismatch("address")),
        }
    }

    fn string(&mut self) -> Result<String, IndexerError> {
        match self.next()? {
            DynSolValue::String(s) => Ok(s),
            _ => Err(self.mismatch("string")),
        }
    }

    fn uint(&mut self) -> Result<U256, IndexerError> {
        match self.next()? {
            DynSolValue::Uint(v, _) => Ok(v),
            _ => Err(self.mismatch("uint")),
        }
    }

    fn strings(&mut self) -> Result<Vec<String>, IndexerError> {
        match self.next()? {
            DynSolValue::Array(items) => items
                .into_iter()
                .map(|v| match v {
                    DynSolValue::String(s) => Ok(s),
                    _ => Err(self.mismatch("string[]")),
                })
                .collect(),
            _ => Err(self.mismatch("string[]")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::Address;

    const ACME: &str = "0x5FbDB2315678afecb367f032d93F642f64180aa3";

    fn log_for(kind: EventKind, args: Vec<DynSolValue>) -> RawLog {
        RawLog {
            address: ACME.to_lowercase(),
            topics: vec![format!("0x{}", hex::encode(topic0(kind).as_slice()))],
            data: format!("0x{}", hex::encode(DynSolValue::Tuple(args).abi_encode_params())),
            block_number: Some("0x64".into()),
            tx_hash: Some("0xfeed".into()),
            log_index: Some("0x2".into()),
            removed: None,
        }
    }

    fn strings(ids: &[&str]) -> DynSolValue {
        DynSolValue::Array(ids.iter().map(|s| DynSolValue::String(s.to_string())).collect())
    }

    #[test]
    fn topics_are_distinct_and_reversible() {
        for kind in EventKind::ALL {
            assert_eq!(kind_for_topic(&topic0(kind)), Some(kind));
        }
        assert_eq!(kind_for_topic(&B256::ZERO), None);
    }

    #[test]
    fn decodes_manufacturer_registered() {
        let addr: Address = ACME.parse().unwrap();
        let log = log_for(
            EventKind::ManufacturerRegistered,
            vec![
                DynSolValue::Address(addr),
                DynSolValue::String("Acme".into()),
                DynSolValue::String("NY".into()),
                DynSolValue::String("ops@acme.example".into()),
            ],
        );
        let ev = decode_log(&log).unwrap();
        assert_eq!(ev.meta.block_number, Some(100));
        assert_eq!(ev.meta.log_index, Some(2));
        assert_eq!(
            ev.payload,
            EventPayload::ManufacturerRegistered {
                id: ACME.into(),
                name: "Acme".into(),
                location: "NY".into(),
                contact: "ops@acme.example".into(),
            }
        );
    }

    #[test]
    fn decodes_product_created_with_checksummed_owner() {
        let addr: Address = ACME.parse().unwrap();
        let log = log_for(
            EventKind::ProductCreated,
            vec![
                DynSolValue::Uint(U256::from(7u64), 256),
                DynSolValue::String("Widget".into()),
                DynSolValue::Address(addr),
            ],
        );
        let EventPayload::ProductCreated {
            product_id,
            manufacturer,
            ..
        } = decode_log(&log).unwrap().payload
        else {
            panic!("expected ProductCreated");
        };
        assert_eq!(product_id, U256::from(7u64));
        assert_eq!(manufacturer, ACME);
    }

    #[test]
    fn decodes_item_batches_and_status() {
        let added = log_for(
            EventKind::ProductItemsAdded,
            vec![strings(&["501", "502"]), DynSolValue::Uint(U256::from(7u64), 256)],
        );
        assert_eq!(
            decode_log(&added).unwrap().payload,
            EventPayload::ProductItemsAdded {
                product_item_ids: vec!["501".into(), "502".into()],
                product_id: U256::from(7u64),
            }
        );

        let changed = log_for(
            EventKind::ProductItemsStatusChanged,
            vec![strings(&["501"]), DynSolValue::Uint(U256::from(3u64), 8)],
        );
        assert_eq!(
            decode_log(&changed).unwrap().payload,
            EventPayload::ProductItemsStatusChanged {
                product_item_ids: vec!["501".into()],
                status_index: U256::from(3u64),
            }
        );
    }

    #[test]
    fn decodes_toxic_item() {
        let log = log_for(
            EventKind::ToxicItemCreated,
            vec![
                DynSolValue::Uint(U256::from(7u64), 256),
                DynSolValue::String("Lead".into()),
                DynSolValue::Uint(U256::from(40u64), 256),
            ],
        );
        assert_eq!(decode_log(&log).unwrap().kind(), EventKind::ToxicItemCreated);
    }

    #[test]
    fn rejects_unknown_topic_and_truncated_data() {
        let mut log = log_for(
            EventKind::ProductItemsAdded,
            vec![strings(&["1"]), DynSolValue::Uint(U256::from(1u64), 256)],
        );
        log.data = "0x00".into();
        assert!(matches!(decode_log(&log), Err(IndexerError::MalformedEvent { .. })));

        log.topics = vec![format!("0x{}", hex::encode(B256::ZERO.as_slice()))];
        assert!(matches!(decode_log(&log), Err(IndexerError::MalformedEvent { .. })));
    }

    #[test]
    fn removed_log_is_rejected() {
        let mut log = log_for(
            EventKind::ToxicItemCreated,
            vec![
                DynSolValue::Uint(U256::from(7u64), 256),
                DynSolValue::String("Lead".into()),
                DynSolValue::Uint(U256::from(40u64), 256),
            ],
        );
        log.removed = Some(true);
        assert!(decode_log(&log).is_err());
    }
}
