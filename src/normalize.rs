//! Transaction Normalization
//!
//! Converts heterogeneous raw payloads (bare hashes or loosely-typed
//! transaction records with missing fields) into the canonical
//! [`MempoolTransaction`]. Quantity parsing is lenient: 0x-hex or decimal
//! strings, with unparseable values degrading to `None` (value to 0) rather
//! than failing the record.

use crate::transport::Transport;
use crate::types::{current_timestamp_millis, ChainId, MempoolTransaction, RawTransaction, RawTxPayload};
use alloy::primitives::{Address, Bytes, TxHash, U256};
use thiserror::Error;

/// Reasons a raw payload cannot become a canonical transaction
#[derive(Error, Debug)]
pub enum NormalizeError {
    #[error("payload is missing required field `{0}`")]
    MissingField(&'static str),

    #[error("payload field `{field}` is invalid: {value}")]
    InvalidField { field: &'static str, value: String },

    #[error("transaction {0} could not be fetched: {1}")]
    LookupFailed(TxHash, String),

    #[error("transaction {0} is not known to the endpoint")]
    NotFound(TxHash),
}

/// Parse a 0x-hex or decimal quantity string
pub fn parse_quantity(s: &str) -> Option<U256> {
    let s = s.trim();
    if let Some(hex_digits) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        U256::from_str_radix(hex_digits, 16).ok()
    } else {
        U256::from_str_radix(s, 10).ok()
    }
}

fn parse_u128(s: &str) -> Option<u128> {
    parse_quantity(s).and_then(|v| u128::try_from(v).ok())
}

fn parse_u64(s: &str) -> Option<u64> {
    parse_quantity(s).and_then(|v| u64::try_from(v).ok())
}

fn parse_u8(s: &str) -> Option<u8> {
    parse_quantity(s).and_then(|v| u8::try_from(v).ok())
}

/// Parse a hex string to bytes (with or without 0x prefix)
pub fn hex_to_bytes(hex_str: &str) -> Option<Vec<u8>> {
    let hex_str = hex_str.strip_prefix("0x").unwrap_or(hex_str);
    hex::decode(hex_str).ok()
}

/// Normalize an already-expanded raw record.
///
/// Records missing `hash` or `from` are rejected; everything else coerces
/// with defaults (`value` to 0, `nonce` to 0, `input` to empty).
pub fn normalize_raw(
    chain_id: ChainId,
    raw: RawTransaction,
) -> Result<MempoolTransaction, NormalizeError> {
    let hash_str = raw.hash.ok_or(NormalizeError::MissingField("hash"))?;
    let hash: TxHash = hash_str
        .parse()
        .map_err(|_| NormalizeError::InvalidField {
            field: "hash",
            value: hash_str.clone(),
        })?;

    let from_str = raw.from.ok_or(NormalizeError::MissingField("from"))?;
    let from: Address = from_str
        .parse()
        .map_err(|_| NormalizeError::InvalidField {
            field: "from",
            value: from_str.clone(),
        })?;

    // An absent or unparseable recipient means contract creation
    let to = raw
        .to
        .as_deref()
        .filter(|s| !s.is_empty())
        .and_then(|s| s.parse::<Address>().ok());

    let value = raw
        .value
        .as_deref()
        .and_then(parse_quantity)
        .unwrap_or_default();

    let input = raw
        .input
        .as_deref()
        .and_then(hex_to_bytes)
        .map(Bytes::from)
        .unwrap_or_default();

    Ok(MempoolTransaction {
        chain_id,
        hash,
        from,
        to,
        value,
        gas_price: raw.gas_price.as_deref().and_then(parse_u128),
        max_fee_per_gas: raw.max_fee_per_gas.as_deref().and_then(parse_u128),
        max_priority_fee_per_gas: raw.max_priority_fee_per_gas.as_deref().and_then(parse_u128),
        gas: raw.gas.as_deref().and_then(parse_u64),
        nonce: raw.nonce.as_deref().and_then(parse_u64).unwrap_or_default(),
        input,
        block_number: raw.block_number.as_deref().and_then(parse_u64),
        timestamp: Some(current_timestamp_millis()),
        tx_type: raw.tx_type.as_deref().and_then(parse_u8),
    })
}

/// Normalize a subscription payload, resolving bare hashes through the
/// delivering transport.
pub async fn normalize(
    chain_id: ChainId,
    payload: RawTxPayload,
    transport: &dyn Transport,
) -> Result<MempoolTransaction, NormalizeError> {
    let raw = match payload {
        RawTxPayload::Transaction(raw) => raw,
        RawTxPayload::Hash(hash) => match transport.transaction_by_hash(hash).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return Err(NormalizeError::NotFound(hash)),
            Err(e) => return Err(NormalizeError::LookupFailed(hash, e.to_string())),
        },
    };
    normalize_raw(chain_id, raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MockTransport, TransportError};

    const HASH: &str = "0x1111111111111111111111111111111111111111111111111111111111111111";
    const FROM: &str = "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266";
    const TO: &str = "0x7a250d5630B4cF539739dF2C5dAcb4c659F2488D";

    fn raw_tx() -> RawTransaction {
        RawTransaction {
            hash: Some(HASH.to_string()),
            from: Some(FROM.to_string()),
            to: Some(TO.to_string()),
            value: Some("0x1bc16d674ec80000".to_string()),
            gas_price: Some("0x4a817c800".to_string()),
            nonce: Some("0x2a".to_string()),
            input: Some("0x38ed1739".to_string()),
            ..Default::default()
        }
    }

    // ==================== parse_quantity tests ====================

    #[test]
    fn test_parse_quantity_hex() {
        assert_eq!(parse_quantity("0x2a"), Some(U256::from(42)));
        assert_eq!(parse_quantity("0X2A"), Some(U256::from(42)));
    }

    #[test]
    fn test_parse_quantity_decimal() {
        assert_eq!(parse_quantity("1000000000000000000"), Some(U256::from(10).pow(U256::from(18))));
    }

    #[test]
    fn test_parse_quantity_zero() {
        assert_eq!(parse_quantity("0x0"), Some(U256::ZERO));
        assert_eq!(parse_quantity("0"), Some(U256::ZERO));
    }

    #[test]
    fn test_parse_quantity_garbage() {
        assert_eq!(parse_quantity("0xzz"), None);
        assert_eq!(parse_quantity("-5"), None);
        assert_eq!(parse_quantity(""), None);
    }

    // ==================== hex_to_bytes tests ====================

    #[test]
    fn test_hex_to_bytes_with_prefix() {
        assert_eq!(hex_to_bytes("0x38ed1739"), Some(vec![0x38, 0xed, 0x17, 0x39]));
    }

    #[test]
    fn test_hex_to_bytes_without_prefix() {
        assert_eq!(hex_to_bytes("38ed1739"), Some(vec![0x38, 0xed, 0x17, 0x39]));
    }

    #[test]
    fn test_hex_to_bytes_empty() {
        assert_eq!(hex_to_bytes("0x"), Some(Vec::new()));
    }

    #[test]
    fn test_hex_to_bytes_invalid() {
        assert_eq!(hex_to_bytes("0xGGGG"), None);
    }

    // ==================== normalize_raw tests ====================

    #[test]
    fn test_normalize_full_record() {
        let tx = normalize_raw(1, raw_tx()).unwrap();
        assert_eq!(tx.chain_id, 1);
        assert_eq!(tx.hash, HASH.parse::<TxHash>().unwrap());
        assert_eq!(tx.from, FROM.parse::<Address>().unwrap());
        assert_eq!(tx.to, Some(TO.parse::<Address>().unwrap()));
        assert_eq!(tx.value, U256::from(2_000_000_000_000_000_000u128));
        assert_eq!(tx.gas_price, Some(20_000_000_000));
        assert_eq!(tx.nonce, 42);
        assert_eq!(tx.input.as_ref(), [0x38, 0xed, 0x17, 0x39]);
        assert!(tx.timestamp.is_some());
    }

    #[test]
    fn test_normalize_missing_hash_rejected() {
        let mut raw = raw_tx();
        raw.hash = None;
        assert!(matches!(
            normalize_raw(1, raw),
            Err(NormalizeError::MissingField("hash"))
        ));
    }

    #[test]
    fn test_normalize_missing_from_rejected() {
        let mut raw = raw_tx();
        raw.from = None;
        assert!(matches!(
            normalize_raw(1, raw),
            Err(NormalizeError::MissingField("from"))
        ));
    }

    #[test]
    fn test_normalize_invalid_hash_rejected() {
        let mut raw = raw_tx();
        raw.hash = Some("0x1234".to_string());
        assert!(matches!(
            normalize_raw(1, raw),
            Err(NormalizeError::InvalidField { field: "hash", .. })
        ));
    }

    #[test]
    fn test_normalize_absent_to_is_contract_creation() {
        let mut raw = raw_tx();
        raw.to = None;
        let tx = normalize_raw(1, raw).unwrap();
        assert!(tx.is_contract_creation());
    }

    #[test]
    fn test_normalize_empty_to_is_contract_creation() {
        let mut raw = raw_tx();
        raw.to = Some(String::new());
        let tx = normalize_raw(1, raw).unwrap();
        assert!(tx.is_contract_creation());
    }

    #[test]
    fn test_normalize_unparseable_value_defaults_to_zero() {
        let mut raw = raw_tx();
        raw.value = Some("not-a-number".to_string());
        let tx = normalize_raw(1, raw).unwrap();
        assert_eq!(tx.value, U256::ZERO);
    }

    #[test]
    fn test_normalize_absent_value_defaults_to_zero() {
        let mut raw = raw_tx();
        raw.value = None;
        let tx = normalize_raw(1, raw).unwrap();
        assert_eq!(tx.value, U256::ZERO);
    }

    #[test]
    fn test_normalize_absent_nonce_defaults_to_zero() {
        let mut raw = raw_tx();
        raw.nonce = None;
        let tx = normalize_raw(1, raw).unwrap();
        assert_eq!(tx.nonce, 0);
    }

    #[test]
    fn test_normalize_absent_input_defaults_to_empty() {
        let mut raw = raw_tx();
        raw.input = None;
        let tx = normalize_raw(1, raw).unwrap();
        assert!(tx.input.is_empty());
    }

    #[test]
    fn test_normalize_optional_fee_fields_stay_none() {
        let tx = normalize_raw(1, raw_tx()).unwrap();
        assert_eq!(tx.max_fee_per_gas, None);
        assert_eq!(tx.max_priority_fee_per_gas, None);
        assert_eq!(tx.gas, None);
        assert_eq!(tx.block_number, None);
    }

    // ==================== normalize payload tests ====================

    #[tokio::test]
    async fn test_normalize_expanded_payload_skips_lookup() {
        let mut transport = MockTransport::new();
        transport.expect_transaction_by_hash().never();

        let payload = RawTxPayload::Transaction(raw_tx());
        let tx = normalize(1, payload, &transport).await.unwrap();
        assert_eq!(tx.nonce, 42);
    }

    #[tokio::test]
    async fn test_normalize_hash_payload_resolves_via_transport() {
        let mut transport = MockTransport::new();
        transport
            .expect_transaction_by_hash()
            .returning(|_| Ok(Some(raw_tx())));

        let hash: TxHash = HASH.parse().unwrap();
        let tx = normalize(1, RawTxPayload::Hash(hash), &transport).await.unwrap();
        assert_eq!(tx.hash, hash);
    }

    #[tokio::test]
    async fn test_normalize_hash_payload_lookup_miss() {
        let mut transport = MockTransport::new();
        transport.expect_transaction_by_hash().returning(|_| Ok(None));

        let hash: TxHash = HASH.parse().unwrap();
        let result = normalize(1, RawTxPayload::Hash(hash), &transport).await;
        assert!(matches!(result, Err(NormalizeError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_normalize_hash_payload_lookup_failure() {
        let mut transport = MockTransport::new();
        transport
            .expect_transaction_by_hash()
            .returning(|_| Err(TransportError::Rpc("boom".to_string())));

        let hash: TxHash = HASH.parse().unwrap();
        let result = normalize(1, RawTxPayload::Hash(hash), &transport).await;
        assert!(matches!(result, Err(NormalizeError::LookupFailed(_, _))));
    }
}
