//! Core Data Model
//!
//! Canonical transaction records flowing through the pipeline, the endpoint
//! descriptor used by health management, and the loose provider-shaped payload
//! that raw node responses deserialize into.

use alloy::dyn_abi::DynSolValue;
use alloy::primitives::{Address, Bytes, TxHash, U256};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::LazyLock;
use std::time::{SystemTime, UNIX_EPOCH};

/// EVM chain identifier (e.g. 1 for Ethereum mainnet)
pub type ChainId = u64;

/// Reliability score assigned to an endpoint that has never been probed
pub const INITIAL_RELIABILITY: f64 = 0.5;

/// Label assigned to endpoints whose hostname matches no known provider
pub const UNKNOWN_PROVIDER: &str = "Unknown";

/// Transport capability of an endpoint, fixed by configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Push subscriptions over a persistent connection
    Websocket,
    /// Point queries and interval polling only
    Http,
}

impl TransportKind {
    /// Whether this transport can serve push subscriptions
    pub fn is_streaming(&self) -> bool {
        matches!(self, TransportKind::Websocket)
    }
}

/// Preferred transport for a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportPreference {
    /// Try streaming first, fall back to polling
    Auto,
    /// Require streaming; still falls back to polling after reporting an error
    Streaming,
    /// Polling only
    Polling,
}

/// Lifecycle state of a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    /// Created, attachment in progress
    Connecting,
    /// At least one streaming watcher attached
    Active,
    /// Streaming unavailable, at least one polling watcher attached
    Fallback,
    /// Terminal; no further transitions or deliveries
    Closed,
}

/// Static lookup table mapping hostname substrings to provider labels
static KNOWN_PROVIDERS: LazyLock<Vec<(&'static str, &'static str)>> = LazyLock::new(|| {
    vec![
        ("infura", "Infura"),
        ("alchemy", "Alchemy"),
        ("quicknode", "QuickNode"),
        ("quiknode", "QuickNode"),
        ("ankr", "Ankr"),
        ("llamarpc", "LlamaNodes"),
        ("blastapi", "Blast"),
        ("chainstack", "Chainstack"),
        ("publicnode", "PublicNode"),
        ("drpc", "dRPC"),
        ("1rpc", "1RPC"),
        ("cloudflare", "Cloudflare"),
        ("tenderly", "Tenderly"),
        ("getblock", "GetBlock"),
        ("grove", "Grove"),
        ("gateway.fm", "Gateway.fm"),
    ]
});

/// Extract the hostname portion of an endpoint URL
fn hostname_of(url: &str) -> &str {
    let rest = url.split("://").nth(1).unwrap_or(url);
    let host_port = rest.split('/').next().unwrap_or(rest);
    host_port.split(':').next().unwrap_or(host_port)
}

/// Derive a provider label from an endpoint URL hostname.
///
/// Matching is a best-effort substring comparison against a known-provider
/// table; anything unmatched lands in the single `"Unknown"` bucket, which
/// means diversity selection degrades to non-diverse behavior when most
/// endpoints are unrecognized.
pub fn provider_label_for(url: &str) -> String {
    let host = hostname_of(url).to_ascii_lowercase();
    for (needle, label) in KNOWN_PROVIDERS.iter() {
        if host.contains(needle) {
            return (*label).to_string();
        }
    }
    UNKNOWN_PROVIDER.to_string()
}

/// One RPC-reachable endpoint for a chain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    /// RPC URL (http(s):// or ws(s)://)
    pub url: String,
    /// Transport capability, fixed by configuration
    pub transport_kind: TransportKind,
    /// Provider label derived once from the URL hostname
    pub provider_label: String,
    /// Reliability snapshot in [0, 1]; the canonical score lives in the
    /// health manager and is mutated only there
    pub reliability: f64,
}

impl Endpoint {
    /// Create an endpoint, deriving its provider label from the URL
    pub fn new(url: impl Into<String>, transport_kind: TransportKind) -> Self {
        let url = url.into();
        let provider_label = provider_label_for(&url);
        Self {
            url,
            transport_kind,
            provider_label,
            reliability: INITIAL_RELIABILITY,
        }
    }
}

/// Protocol identification for a contract address
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolInfo {
    /// Protocol name (e.g. "Uniswap V2")
    pub name: String,
    /// Protocol category (e.g. "dex"), if classified
    pub category: Option<String>,
    /// Lookup confidence in [0, 1]
    pub confidence: f64,
    /// Which source produced the mapping
    pub source: String,
}

/// Raw provider-shaped transaction payload.
///
/// Providers disagree on which fields they populate for pending
/// transactions, so everything is optional and quantities arrive as 0x-hex
/// or decimal strings. The normalizer turns this into a
/// [`MempoolTransaction`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawTransaction {
    pub hash: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub value: Option<String>,
    pub gas_price: Option<String>,
    pub max_fee_per_gas: Option<String>,
    pub max_priority_fee_per_gas: Option<String>,
    pub gas: Option<String>,
    pub nonce: Option<String>,
    pub input: Option<String>,
    pub block_number: Option<String>,
    #[serde(rename = "type")]
    pub tx_type: Option<String>,
}

impl From<&alloy::rpc::types::Transaction> for RawTransaction {
    fn from(tx: &alloy::rpc::types::Transaction) -> Self {
        use alloy::consensus::Transaction as _;
        use alloy::network::TransactionResponse;
        Self {
            hash: Some(format!("{:#x}", tx.tx_hash())),
            from: Some(format!("{:#x}", tx.from)),
            to: TransactionResponse::to(tx).map(|a| format!("{a:#x}")),
            value: Some(tx.value().to_string()),
            gas_price: TransactionResponse::gas_price(tx).map(|v| v.to_string()),
            max_fee_per_gas: TransactionResponse::max_fee_per_gas(tx).map(|v| v.to_string()),
            max_priority_fee_per_gas: tx.max_priority_fee_per_gas().map(|v| v.to_string()),
            gas: Some(tx.gas_limit().to_string()),
            nonce: Some(tx.nonce().to_string()),
            input: Some(format!("0x{}", hex::encode(tx.input()))),
            block_number: tx.block_number.map(|n| n.to_string()),
            tx_type: tx.transaction_type().map(|t| t.to_string()),
        }
    }
}

/// What a pending-transaction subscription delivers: some providers push
/// bare hashes, others push expanded transaction records
#[derive(Debug, Clone)]
pub enum RawTxPayload {
    Hash(TxHash),
    Transaction(RawTransaction),
}

/// Canonical pending transaction after normalization
#[derive(Debug, Clone, PartialEq)]
pub struct MempoolTransaction {
    pub chain_id: ChainId,
    /// Transaction hash
    pub hash: TxHash,
    /// Sender address
    pub from: Address,
    /// Recipient address (None for contract creation)
    pub to: Option<Address>,
    /// Transaction value in wei (0 if absent or unparseable)
    pub value: U256,
    pub gas_price: Option<u128>,
    pub max_fee_per_gas: Option<u128>,
    pub max_priority_fee_per_gas: Option<u128>,
    /// Gas limit
    pub gas: Option<u64>,
    pub nonce: u64,
    /// Calldata (empty if absent)
    pub input: Bytes,
    pub block_number: Option<u64>,
    /// Receipt time in unix milliseconds
    pub timestamp: Option<u64>,
    pub tx_type: Option<u8>,
}

impl MempoolTransaction {
    /// Whether this transaction deploys a contract
    pub fn is_contract_creation(&self) -> bool {
        self.to.is_none()
    }
}

/// Canonical transaction plus protocol/calldata resolution
#[derive(Debug, Clone)]
pub struct DecodedTransaction {
    pub tx: MempoolTransaction,
    /// Protocol the target address belongs to, if known
    pub protocol: Option<ProtocolInfo>,
    /// Short method name ("swapExactTokensForTokens", "contractCreation", ...)
    pub method: Option<String>,
    /// 4-byte selector as 0x-hex, when calldata has one
    pub function_signature: Option<String>,
    /// Full `name(type,type,...)` signature, when resolved
    pub raw_method_signature: Option<String>,
    /// Decoded arguments, when an interface match succeeded
    pub args: Option<Vec<DynSolValue>>,
    /// Name of the interface that decoded the calldata
    pub abi_name: Option<String>,
}

/// Decoded transaction plus consumer-facing derivations
#[derive(Debug, Clone)]
pub struct EnrichedTransaction {
    pub tx: DecodedTransaction,
    /// Human-readable one-liner, when one can be derived
    pub summary: Option<String>,
    /// Categorical labels in derivation order
    pub labels: Vec<String>,
    /// Key/value bag of derived details
    pub metadata: HashMap<String, String>,
}

/// Get current timestamp in milliseconds
pub fn current_timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
