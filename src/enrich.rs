//! Transaction Enrichment
//!
//! Derives the consumer-facing summary, labels and metadata bag from a
//! decoded transaction. Pure functions, no collaborators.

use crate::decoder::{METHOD_NATIVE_TRANSFER, METHOD_PLAIN_CALL};
use crate::types::{DecodedTransaction, EnrichedTransaction};
use alloy::primitives::utils::format_ether;
use alloy::primitives::U256;
use std::collections::HashMap;

/// Format a wei amount as whole units (18 decimals), trimming trailing
/// zeros: 2×10^18 becomes "2", 15×10^17 becomes "1.5"
pub fn format_wei(value: U256) -> String {
    let formatted = format_ether(value);
    let trimmed = formatted.trim_end_matches('0').trim_end_matches('.');
    if trimmed.is_empty() {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Whether a method string is a synthetic classification rather than a
/// decoded function name
fn is_synthetic_method(method: &str) -> bool {
    method == METHOD_NATIVE_TRANSFER || method == METHOD_PLAIN_CALL
}

fn build_summary(decoded: &DecodedTransaction) -> Option<String> {
    let named_method = decoded
        .method
        .as_deref()
        .filter(|m| !is_synthetic_method(m));

    if let (Some(protocol), Some(method)) = (&decoded.protocol, named_method) {
        return Some(format!("{} • {}", protocol.name, method));
    }
    if let Some(method) = named_method {
        return Some(method.to_string());
    }
    if decoded.tx.value > U256::ZERO {
        if let Some(to) = decoded.tx.to {
            return Some(format!("Transfer {} to {}", format_wei(decoded.tx.value), to));
        }
    }
    None
}

fn build_labels(decoded: &DecodedTransaction) -> Vec<String> {
    let mut labels = Vec::new();
    if let Some(protocol) = &decoded.protocol {
        labels.push(format!("protocol:{}", protocol.name));
        if let Some(category) = &protocol.category {
            labels.push(format!("category:{category}"));
        }
    }
    if let Some(method) = &decoded.method {
        labels.push(format!("method:{method}"));
    }
    if decoded.tx.value > U256::ZERO {
        labels.push("transfer".to_string());
    }
    labels
}

fn build_metadata(decoded: &DecodedTransaction) -> HashMap<String, String> {
    let mut metadata = HashMap::new();
    if let Some(protocol) = &decoded.protocol {
        metadata.insert("protocol".to_string(), protocol.name.clone());
        if let Some(category) = &protocol.category {
            metadata.insert("category".to_string(), category.clone());
        }
        metadata.insert("confidence".to_string(), protocol.confidence.to_string());
    }
    metadata.insert("formattedValue".to_string(), format_wei(decoded.tx.value));
    metadata.insert(
        "hasCalldata".to_string(),
        (!decoded.tx.input.is_empty()).to_string(),
    );
    if let Some(signature) = &decoded.function_signature {
        metadata.insert("functionSignature".to_string(), signature.clone());
    }
    if let Some(signature) = &decoded.raw_method_signature {
        metadata.insert("rawMethodSignature".to_string(), signature.clone());
    }
    metadata
}

/// Derive summary, labels and metadata for a decoded transaction
pub fn enrich(decoded: DecodedTransaction) -> EnrichedTransaction {
    let summary = build_summary(&decoded);
    let labels = build_labels(&decoded);
    let metadata = build_metadata(&decoded);
    EnrichedTransaction {
        tx: decoded,
        summary,
        labels,
        metadata,
    }
}
