//! Transport Boundary
//!
//! A thin capability-typed handle to one RPC endpoint: point queries plus a
//! push subscription primitive for pending transactions. Whether an endpoint
//! can stream is fixed by configuration via [`TransportKind`], never probed
//! at runtime.

use crate::types::{Endpoint, RawTransaction, RawTxPayload, TransportKind};
use alloy::eips::BlockNumberOrTag;
use alloy::primitives::TxHash;
use alloy::providers::{Provider, ProviderBuilder, RootProvider};
use alloy::rpc::types::BlockTransactions;
use alloy::transports::BoxTransport;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Buffered payloads per streaming subscription before backpressure applies
pub const SUBSCRIPTION_BUFFER: usize = 1024;

/// Errors that can occur talking to an endpoint
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("rpc request failed: {0}")]
    Rpc(String),

    #[error("subscription failed: {0}")]
    Subscription(String),

    #[error("transport does not support pending-transaction subscriptions")]
    SubscriptionsUnsupported,

    #[error("invalid endpoint url: {0}")]
    InvalidUrl(String),
}

/// Handle to one RPC endpoint.
///
/// All calls may fail; failures surface as [`TransportError`] and must never
/// crash a watcher loop. [`Transport::subscribe_pending`] is only served by
/// streaming-capable transports; polling transports return
/// [`TransportError::SubscriptionsUnsupported`].
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Static transport capability
    fn kind(&self) -> TransportKind;

    /// Fetch the latest block number (used as the liveness probe)
    async fn latest_block_number(&self) -> Result<u64, TransportError>;

    /// Point lookup of a transaction by hash; `None` when the endpoint does
    /// not know the hash
    async fn transaction_by_hash(&self, hash: TxHash)
        -> Result<Option<RawTransaction>, TransportError>;

    /// Fetch the pending block's transaction list
    async fn pending_block_transactions(&self) -> Result<Vec<RawTransaction>, TransportError>;

    /// Open a push subscription for pending transactions. Payloads arrive on
    /// the returned channel in connection order; dropping the receiver ends
    /// the subscription.
    async fn subscribe_pending(&self) -> Result<mpsc::Receiver<RawTxPayload>, TransportError>;
}

/// Opens a [`Transport`] for an [`Endpoint`]
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn open(&self, endpoint: &Endpoint) -> Result<Arc<dyn Transport>, TransportError>;
}

/// Warn when an endpoint URL scheme disagrees with its configured capability
fn check_url_scheme(endpoint: &Endpoint) {
    let streaming_url = endpoint.url.starts_with("ws://") || endpoint.url.starts_with("wss://");
    if endpoint.transport_kind.is_streaming() != streaming_url {
        warn!(
            url = %endpoint.url,
            kind = ?endpoint.transport_kind,
            "endpoint url scheme does not match its configured transport kind"
        );
    }
}

/// [`Transport`] backed by an alloy provider (HTTP, WebSocket or IPC by URL
/// scheme)
pub struct AlloyTransport {
    kind: TransportKind,
    provider: RootProvider<BoxTransport>,
}

impl AlloyTransport {
    /// Connect to the endpoint's URL
    pub async fn connect(endpoint: &Endpoint) -> Result<Self, TransportError> {
        check_url_scheme(endpoint);

        let provider = ProviderBuilder::new()
            .on_builtin(&endpoint.url)
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        debug!(url = %endpoint.url, "connected to endpoint");

        Ok(Self {
            kind: endpoint.transport_kind,
            provider,
        })
    }
}

#[async_trait]
impl Transport for AlloyTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn latest_block_number(&self) -> Result<u64, TransportError> {
        self.provider
            .get_block_number()
            .await
            .map_err(|e| TransportError::Rpc(e.to_string()))
    }

    async fn transaction_by_hash(
        &self,
        hash: TxHash,
    ) -> Result<Option<RawTransaction>, TransportError> {
        let tx = self
            .provider
            .get_transaction_by_hash(hash)
            .await
            .map_err(|e| TransportError::Rpc(e.to_string()))?;
        Ok(tx.as_ref().map(RawTransaction::from))
    }

    async fn pending_block_transactions(&self) -> Result<Vec<RawTransaction>, TransportError> {
        let block = self
            .provider
            .get_block_by_number(BlockNumberOrTag::Pending, true.into())
            .await
            .map_err(|e| TransportError::Rpc(e.to_string()))?;

        let Some(block) = block else {
            return Ok(Vec::new());
        };

        match &block.transactions {
            BlockTransactions::Full(txs) => Ok(txs.iter().map(RawTransaction::from).collect()),
            // A hashes-only pending block carries nothing to normalize here;
            // hash payloads are the streaming path's concern
            _ => Ok(Vec::new()),
        }
    }

    async fn subscribe_pending(&self) -> Result<mpsc::Receiver<RawTxPayload>, TransportError> {
        if !self.kind.is_streaming() {
            return Err(TransportError::SubscriptionsUnsupported);
        }

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);

        // Prefer expanded transactions; many providers only serve hashes
        match self.provider.subscribe_full_pending_transactions().await {
            Ok(mut sub) => {
                tokio::spawn(async move {
                    loop {
                        match sub.recv().await {
                            Ok(full) => {
                                let payload = RawTxPayload::Transaction((&full).into());
                                if tx.send(payload).await.is_err() {
                                    break;
                                }
                            }
                            Err(RecvError::Lagged(skipped)) => {
                                warn!(skipped, "pending-transaction stream lagged");
                            }
                            Err(RecvError::Closed) => break,
                        }
                    }
                });
            }
            Err(e) => {
                debug!(error = %e, "full pending subscription unavailable, using hashes");
                let mut sub = self
                    .provider
                    .subscribe_pending_transactions()
                    .await
                    .map_err(|e| TransportError::Subscription(e.to_string()))?;
                tokio::spawn(async move {
                    loop {
                        match sub.recv().await {
                            Ok(hash) => {
                                if tx.send(RawTxPayload::Hash(hash)).await.is_err() {
                                    break;
                                }
                            }
                            Err(RecvError::Lagged(skipped)) => {
                                warn!(skipped, "pending-transaction stream lagged");
                            }
                            Err(RecvError::Closed) => break,
                        }
                    }
                });
            }
        }

        Ok(rx)
    }
}

/// [`TransportFactory`] producing [`AlloyTransport`] connections
#[derive(Debug, Clone, Default)]
pub struct AlloyTransportFactory;

#[async_trait]
impl TransportFactory for AlloyTransportFactory {
    async fn open(&self, endpoint: &Endpoint) -> Result<Arc<dyn Transport>, TransportError> {
        let transport = AlloyTransport::connect(endpoint).await?;
        Ok(Arc::new(transport))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==================== TransportError tests ====================

    #[test]
    fn test_transport_error_display() {
        let err = TransportError::Connection("refused".to_string());
        assert!(err.to_string().contains("refused"));

        let err = TransportError::SubscriptionsUnsupported;
        assert!(err.to_string().contains("subscriptions"));
    }

    // ==================== MockTransport tests ====================

    #[test]
    fn test_mock_transport_block_number() {
        let mut transport = MockTransport::new();
        transport.expect_kind().return_const(TransportKind::Http);
        transport
            .expect_latest_block_number()
            .returning(|| Ok(19_000_000));

        assert_eq!(transport.kind(), TransportKind::Http);
        let block = tokio_test::block_on(transport.latest_block_number()).unwrap();
        assert_eq!(block, 19_000_000);
    }

    #[test]
    fn test_subscription_buffer_reasonable() {
        assert!(SUBSCRIPTION_BUFFER >= 64);
        assert!(SUBSCRIPTION_BUFFER <= 65_536);
    }
}
