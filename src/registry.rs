//! Collaborator Registries
//!
//! Trait boundaries for the external chain-metadata and protocol-knowledge
//! services, plus in-memory implementations used as fixtures. Fetching and
//! caching the underlying data is out of scope; these traits are the seam
//! the pipeline consumes it through.

use crate::types::{ChainId, Endpoint, ProtocolInfo};
use alloy::json_abi::JsonAbi;
use alloy::primitives::Address;
use async_trait::async_trait;
use std::collections::HashMap;

/// Chain metadata boundary: which chains are known and which endpoints
/// serve them
pub trait ChainRegistry: Send + Sync {
    fn is_supported(&self, chain_id: ChainId) -> bool;

    /// Candidate endpoints for a chain, in configuration order
    fn endpoints(&self, chain_id: ChainId) -> Vec<Endpoint>;
}

/// Protocol knowledge boundary: address-to-protocol mappings, contract
/// interfaces and 4-byte signature lookups
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProtocolRegistry: Send + Sync {
    /// Best-effort protocol lookup for a contract address; `None` on any
    /// failure, never an error
    fn lookup(&self, address: Address, chain_id: ChainId) -> Option<ProtocolInfo>;

    /// Fetch a contract interface (multi-source fallback behind this seam)
    async fn interface(&self, address: Address, chain_id: ChainId) -> Option<JsonAbi>;

    /// Resolve a 4-byte selector to a full `name(type,...)` signature
    async fn function_signature(&self, selector: [u8; 4]) -> Option<String>;
}

/// In-memory [`ChainRegistry`] built from configuration
#[derive(Debug, Clone, Default)]
pub struct StaticChainRegistry {
    chains: HashMap<ChainId, Vec<Endpoint>>,
}

impl StaticChainRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a chain with its candidate endpoints
    pub fn with_chain(mut self, chain_id: ChainId, endpoints: Vec<Endpoint>) -> Self {
        self.chains.insert(chain_id, endpoints);
        self
    }
}

impl ChainRegistry for StaticChainRegistry {
    fn is_supported(&self, chain_id: ChainId) -> bool {
        self.chains.contains_key(&chain_id)
    }

    fn endpoints(&self, chain_id: ChainId) -> Vec<Endpoint> {
        self.chains.get(&chain_id).cloned().unwrap_or_default()
    }
}

/// In-memory [`ProtocolRegistry`] for fixtures and tests
#[derive(Debug, Clone, Default)]
pub struct StaticProtocolRegistry {
    protocols: HashMap<(ChainId, Address), ProtocolInfo>,
    interfaces: HashMap<(ChainId, Address), JsonAbi>,
    signatures: HashMap<[u8; 4], String>,
}

impl StaticProtocolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_protocol(
        mut self,
        chain_id: ChainId,
        address: Address,
        info: ProtocolInfo,
    ) -> Self {
        self.protocols.insert((chain_id, address), info);
        self
    }

    pub fn with_interface(mut self, chain_id: ChainId, address: Address, abi: JsonAbi) -> Self {
        self.interfaces.insert((chain_id, address), abi);
        self
    }

    pub fn with_signature(mut self, selector: [u8; 4], signature: impl Into<String>) -> Self {
        self.signatures.insert(selector, signature.into());
        self
    }
}

#[async_trait]
impl ProtocolRegistry for StaticProtocolRegistry {
    fn lookup(&self, address: Address, chain_id: ChainId) -> Option<ProtocolInfo> {
        self.protocols.get(&(chain_id, address)).cloned()
    }

    async fn interface(&self, address: Address, chain_id: ChainId) -> Option<JsonAbi> {
        self.interfaces.get(&(chain_id, address)).cloned()
    }

    async fn function_signature(&self, selector: [u8; 4]) -> Option<String> {
        self.signatures.get(&selector).cloned()
    }
}
