//! Transaction Filtering
//!
//! Caller-supplied filter specifications evaluated as a pure predicate over
//! enriched transactions. Every populated clause must hold; an absent
//! filter passes everything.

use crate::types::EnrichedTransaction;
use alloy::primitives::{Address, U256};
use serde::{Deserialize, Serialize};

/// Filter specification for a subscription.
///
/// Clauses combine with logical AND; `None` clauses are ignored. The
/// camelCase serde shape lets callers ship filters as JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TransactionFilter {
    /// Match when `to` or `from` is in the set
    pub addresses: Option<Vec<Address>>,
    /// Match when the resolved protocol name is in the set
    pub protocols: Option<Vec<String>>,
    /// Match when the resolved protocol category is in the set
    pub categories: Option<Vec<String>>,
    /// Match when the method name is in the set
    pub methods: Option<Vec<String>>,
    /// Inclusive lower bound on value in wei
    pub min_value_wei: Option<U256>,
    /// Inclusive upper bound on value in wei
    pub max_value_wei: Option<U256>,
}

impl TransactionFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_addresses(mut self, addresses: Vec<Address>) -> Self {
        self.addresses = Some(addresses);
        self
    }

    pub fn with_protocols(mut self, protocols: Vec<String>) -> Self {
        self.protocols = Some(protocols);
        self
    }

    pub fn with_categories(mut self, categories: Vec<String>) -> Self {
        self.categories = Some(categories);
        self
    }

    pub fn with_methods(mut self, methods: Vec<String>) -> Self {
        self.methods = Some(methods);
        self
    }

    pub fn with_min_value_wei(mut self, min: U256) -> Self {
        self.min_value_wei = Some(min);
        self
    }

    pub fn with_max_value_wei(mut self, max: U256) -> Self {
        self.max_value_wei = Some(max);
        self
    }

    /// Whether no clause is populated
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Serialize the filter to JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize a filter from JSON
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Evaluate a filter against an enriched transaction.
///
/// A `None` filter always passes. Address comparison is case-insensitive by
/// construction: both sides are parsed [`Address`] values.
pub fn passes(enriched: &EnrichedTransaction, filter: Option<&TransactionFilter>) -> bool {
    let Some(filter) = filter else {
        return true;
    };
    let decoded = &enriched.tx;
    let tx = &decoded.tx;

    if let Some(addresses) = &filter.addresses {
        let to_match = tx.to.map_or(false, |to| addresses.contains(&to));
        if !to_match && !addresses.contains(&tx.from) {
            return false;
        }
    }

    if let Some(protocols) = &filter.protocols {
        match &decoded.protocol {
            Some(p) if protocols.contains(&p.name) => {}
            _ => return false,
        }
    }

    if let Some(categories) = &filter.categories {
        match decoded.protocol.as_ref().and_then(|p| p.category.as_ref()) {
            Some(category) if categories.contains(category) => {}
            _ => return false,
        }
    }

    if let Some(methods) = &filter.methods {
        match &decoded.method {
            Some(method) if methods.contains(method) => {}
            _ => return false,
        }
    }

    if let Some(min) = filter.min_value_wei {
        if tx.value < min {
            return false;
        }
    }

    if let Some(max) = filter.max_value_wei {
        if tx.value > max {
            return false;
        }
    }

    true
}
