//! Mempool Sentry
//!
//! This crate provides components for watching pending blockchain
//! transactions across multiple RPC providers: endpoint health probing and
//! diverse selection, streaming and polling subscriptions with automatic
//! fallback, and a normalize → dedupe → decode → enrich → filter pipeline
//! delivering protocol-aware events to a consumer.

pub mod decoder;
pub mod dedupe;
pub mod enrich;
pub mod filter;
pub mod health;
pub mod normalize;
pub mod registry;
pub mod subscription;
pub mod transport;
pub mod types;

// Re-export commonly used types
pub use decoder::{extract_method_id, Decoder};
pub use dedupe::Deduplicator;
pub use enrich::{enrich, format_wei};
pub use filter::{passes, TransactionFilter};
pub use health::{
    EndpointHealthManager, HealthConfig, HealthError, HealthRecord, SelectionOptions,
};
pub use registry::{
    ChainRegistry, ProtocolRegistry, StaticChainRegistry, StaticProtocolRegistry,
};
pub use subscription::{
    StatsSnapshot, SubscribeRequest, SubscriptionController, SubscriptionHandle, WatchError,
    WatcherConfig,
};
pub use transport::{
    AlloyTransport, AlloyTransportFactory, Transport, TransportError, TransportFactory,
};
pub use types::{
    ChainId, DecodedTransaction, Endpoint, EnrichedTransaction, MempoolTransaction, ProtocolInfo,
    RawTransaction, RawTxPayload, SubscriptionStatus, TransportKind, TransportPreference,
};
