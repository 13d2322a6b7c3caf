//! Subscription Controller
//!
//! Owns one state machine per active subscription, drives transport
//! selection and streaming-to-polling fallback, and wires the pipeline:
//! normalize → dedupe → decode → enrich → filter → delivery.
//!
//! Per-endpoint failures are isolated: an attach or runtime error on one
//! endpoint is reported to the caller's error handler and never tears down
//! sibling watchers. Only a fully exhausted attach path closes the
//! subscription.

use crate::decoder::Decoder;
use crate::dedupe::Deduplicator;
use crate::enrich::enrich;
use crate::filter::{passes, TransactionFilter};
use crate::health::{EndpointHealthManager, HealthError, SelectionOptions};
use crate::normalize::normalize;
use crate::registry::{ChainRegistry, ProtocolRegistry};
use crate::transport::{Transport, TransportFactory};
use crate::types::{
    current_timestamp_millis, ChainId, Endpoint, EnrichedTransaction, RawTxPayload,
    SubscriptionStatus, TransportPreference,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Default interval between pending-block polls
pub const DEFAULT_POLLING_INTERVAL_MS: u64 = 4_000;

/// Default number of endpoints attached per subscription
pub const DEFAULT_ENDPOINT_COUNT: usize = 2;

/// Default reliability floor for endpoint selection
pub const DEFAULT_MIN_RELIABILITY: f64 = 0.3;

/// Identifier of one `subscribe()` call
pub type SubscriptionId = u64;

/// Callback receiving batches of enriched transactions
pub type TransactionsCallback = Arc<dyn Fn(Vec<EnrichedTransaction>) + Send + Sync>;

/// Callback receiving non-fatal diagnostics
pub type ErrorCallback = Arc<dyn Fn(WatchError) + Send + Sync>;

/// Errors surfaced by subscription management
#[derive(Error, Debug)]
pub enum WatchError {
    #[error("chain {0} is not supported")]
    UnsupportedChain(ChainId),

    #[error(transparent)]
    Selection(#[from] HealthError),

    #[error("failed to attach endpoint {url}: {reason}")]
    Attach { url: String, reason: String },

    #[error("endpoint {url} failed while watching: {reason}")]
    Watcher { url: String, reason: String },

    #[error("no streaming endpoint attached for chain {0}, falling back to polling")]
    StreamingUnavailable(ChainId),

    #[error("no streaming or polling transport could be attached for chain {0}")]
    AttachExhausted(ChainId),
}

/// Configuration for the subscription controller
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WatcherConfig {
    /// Interval between pending-block polls in milliseconds
    pub polling_interval_ms: u64,
    /// Endpoints attached per subscription unless the request overrides it
    pub endpoint_count: usize,
    /// Reliability floor passed to endpoint selection
    pub min_reliability: f64,
    /// Whether selection prefers distinct providers
    pub prefer_diverse: bool,
    /// Window during which a repeated transaction hash is suppressed
    pub dedupe_ttl_ms: u64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            polling_interval_ms: DEFAULT_POLLING_INTERVAL_MS,
            endpoint_count: DEFAULT_ENDPOINT_COUNT,
            min_reliability: DEFAULT_MIN_RELIABILITY,
            prefer_diverse: true,
            dedupe_ttl_ms: crate::dedupe::DEDUPE_TTL_MS,
        }
    }
}

impl WatcherConfig {
    pub fn with_polling_interval_ms(mut self, ms: u64) -> Self {
        self.polling_interval_ms = ms;
        self
    }

    pub fn with_endpoint_count(mut self, count: usize) -> Self {
        self.endpoint_count = count;
        self
    }

    pub fn with_min_reliability(mut self, floor: f64) -> Self {
        self.min_reliability = floor;
        self
    }

    pub fn with_dedupe_ttl_ms(mut self, ms: u64) -> Self {
        self.dedupe_ttl_ms = ms;
        self
    }
}

/// A `subscribe()` call
pub struct SubscribeRequest {
    pub chain_id: ChainId,
    pub transport_preference: TransportPreference,
    /// Overrides the configured endpoint count when set
    pub endpoint_count: Option<usize>,
    pub filter: Option<TransactionFilter>,
    pub on_transactions: TransactionsCallback,
    pub on_error: Option<ErrorCallback>,
}

impl SubscribeRequest {
    pub fn new(
        chain_id: ChainId,
        on_transactions: impl Fn(Vec<EnrichedTransaction>) + Send + Sync + 'static,
    ) -> Self {
        Self {
            chain_id,
            transport_preference: TransportPreference::Auto,
            endpoint_count: None,
            filter: None,
            on_transactions: Arc::new(on_transactions),
            on_error: None,
        }
    }

    pub fn with_transport_preference(mut self, preference: TransportPreference) -> Self {
        self.transport_preference = preference;
        self
    }

    pub fn with_endpoint_count(mut self, count: usize) -> Self {
        self.endpoint_count = Some(count);
        self
    }

    pub fn with_filter(mut self, filter: TransactionFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_on_error(
        mut self,
        on_error: impl Fn(WatchError) + Send + Sync + 'static,
    ) -> Self {
        self.on_error = Some(Arc::new(on_error));
        self
    }
}

/// Counters owned by one subscription
#[derive(Debug, Default)]
struct SubscriptionStats {
    received: AtomicU64,
    dropped: AtomicU64,
    /// Unix milliseconds of the last delivery; 0 means never
    last_activity_ms: AtomicU64,
}

/// Point-in-time view of a subscription's counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    /// Transactions delivered to the caller
    pub received: u64,
    /// Duplicates suppressed by the dedup window
    pub dropped: u64,
    /// Unix milliseconds of the last delivery
    pub last_activity_at: Option<u64>,
}

/// State owned exclusively by one subscription
struct SubscriptionInner {
    id: SubscriptionId,
    chain_id: ChainId,
    filter: Option<TransactionFilter>,
    dedupe: Deduplicator,
    stats: SubscriptionStats,
    status_tx: watch::Sender<SubscriptionStatus>,
    watchers: Mutex<Vec<JoinHandle<()>>>,
    on_transactions: TransactionsCallback,
    on_error: Option<ErrorCallback>,
}

impl SubscriptionInner {
    fn status(&self) -> SubscriptionStatus {
        *self.status_tx.borrow()
    }

    fn is_closed(&self) -> bool {
        self.status() == SubscriptionStatus::Closed
    }

    /// Apply a status transition, enforcing monotonicity: `Connecting` may
    /// move anywhere, `Active`/`Fallback` may only close, `Closed` is final.
    fn transition(&self, next: SubscriptionStatus) -> bool {
        self.status_tx.send_if_modified(|current| {
            let allowed = match (*current, next) {
                (a, b) if a == b => false,
                (SubscriptionStatus::Closed, _) => false,
                (SubscriptionStatus::Connecting, _) => true,
                (_, SubscriptionStatus::Closed) => true,
                _ => false,
            };
            if allowed {
                *current = next;
            }
            allowed
        })
    }

    fn report_error(&self, error: WatchError) {
        warn!(subscription = self.id, error = %error, "subscription error");
        if let Some(on_error) = &self.on_error {
            on_error(error);
        }
    }

    /// Register a watcher task, aborting it immediately if the subscription
    /// closed while it was being attached
    fn register_watcher(&self, worker: JoinHandle<()>) {
        let mut watchers = self
            .watchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if self.is_closed() {
            worker.abort();
        } else {
            watchers.push(worker);
        }
    }

    fn deliver(&self, batch: Vec<EnrichedTransaction>) {
        if batch.is_empty() || self.is_closed() {
            return;
        }
        self.stats
            .received
            .fetch_add(batch.len() as u64, Ordering::Relaxed);
        self.stats
            .last_activity_ms
            .store(current_timestamp_millis(), Ordering::Relaxed);
        (self.on_transactions)(batch);
    }

    fn snapshot(&self) -> StatsSnapshot {
        let last = self.stats.last_activity_ms.load(Ordering::Relaxed);
        StatsSnapshot {
            received: self.stats.received.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
            last_activity_at: (last > 0).then_some(last),
        }
    }
}

/// Caller-facing handle to one subscription
pub struct SubscriptionHandle {
    inner: Arc<SubscriptionInner>,
    controller: Arc<SubscriptionController>,
}

impl SubscriptionHandle {
    pub fn id(&self) -> SubscriptionId {
        self.inner.id
    }

    pub fn chain_id(&self) -> ChainId {
        self.inner.chain_id
    }

    pub fn status(&self) -> SubscriptionStatus {
        self.inner.status()
    }

    /// Observe status transitions. Dropping the receiver cancels the
    /// observer; the final observed value is `Closed`.
    pub fn watch_status(&self) -> watch::Receiver<SubscriptionStatus> {
        self.inner.status_tx.subscribe()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.snapshot()
    }

    /// Cancel every watcher and close the subscription. Idempotent.
    pub fn unsubscribe(&self) {
        self.controller.unsubscribe(self.inner.id);
    }
}

/// Orchestrates subscriptions over health-selected endpoints
pub struct SubscriptionController {
    health: Arc<EndpointHealthManager>,
    factory: Arc<dyn TransportFactory>,
    chains: Arc<dyn ChainRegistry>,
    decoder: Decoder,
    config: WatcherConfig,
    subscriptions: Mutex<HashMap<SubscriptionId, Arc<SubscriptionInner>>>,
    next_id: AtomicU64,
}

impl SubscriptionController {
    pub fn new(
        health: Arc<EndpointHealthManager>,
        factory: Arc<dyn TransportFactory>,
        chains: Arc<dyn ChainRegistry>,
        protocols: Arc<dyn ProtocolRegistry>,
        config: WatcherConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            health,
            factory,
            chains,
            decoder: Decoder::new(protocols),
            config,
            subscriptions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        })
    }

    /// Number of live subscriptions
    pub fn subscription_count(&self) -> usize {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Create a subscription. Fails synchronously for an unknown chain;
    /// attachment itself proceeds asynchronously and is observable through
    /// the handle's status channel.
    pub fn subscribe(
        self: &Arc<Self>,
        request: SubscribeRequest,
    ) -> Result<SubscriptionHandle, WatchError> {
        if !self.chains.is_supported(request.chain_id) {
            return Err(WatchError::UnsupportedChain(request.chain_id));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (status_tx, _) = watch::channel(SubscriptionStatus::Connecting);
        let inner = Arc::new(SubscriptionInner {
            id,
            chain_id: request.chain_id,
            filter: request.filter,
            dedupe: Deduplicator::new(Duration::from_millis(self.config.dedupe_ttl_ms)),
            stats: SubscriptionStats::default(),
            status_tx,
            watchers: Mutex::new(Vec::new()),
            on_transactions: request.on_transactions,
            on_error: request.on_error,
        });

        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, inner.clone());

        info!(subscription = id, chain = request.chain_id, "subscription created");

        let controller = Arc::clone(self);
        let subscription = inner.clone();
        let preference = request.transport_preference;
        let count = request.endpoint_count.unwrap_or(self.config.endpoint_count);
        tokio::spawn(async move {
            controller.attach(subscription, preference, count).await;
        });

        Ok(SubscriptionHandle {
            inner,
            controller: Arc::clone(self),
        })
    }

    /// Cancel every watcher of a subscription, clear its dedup state,
    /// transition it to `Closed` and drop it from the registry. Idempotent.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        let removed = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        if let Some(subscription) = removed {
            Self::teardown(&subscription);
        }
    }

    fn teardown(subscription: &SubscriptionInner) {
        subscription.transition(SubscriptionStatus::Closed);

        let watchers = {
            let mut guard = subscription
                .watchers
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *guard)
        };
        let cancelled = watchers.len();
        for watcher in watchers {
            watcher.abort();
        }
        subscription.dedupe.clear();

        info!(
            subscription = subscription.id,
            cancelled, "subscription closed"
        );
    }

    fn selection_options(&self, count: usize, include_streaming: bool) -> SelectionOptions {
        SelectionOptions {
            count,
            min_reliability: self.config.min_reliability,
            include_streaming,
            prefer_diverse: self.config.prefer_diverse,
        }
    }

    /// Attachment algorithm: streaming first for `Streaming`/`Auto`
    /// preferences, then polling; close only when both paths attach nothing.
    async fn attach(
        self: Arc<Self>,
        subscription: Arc<SubscriptionInner>,
        preference: TransportPreference,
        count: usize,
    ) {
        let chain_id = subscription.chain_id;

        if matches!(
            preference,
            TransportPreference::Streaming | TransportPreference::Auto
        ) {
            let mut attached = 0usize;
            match self
                .health
                .diverse_healthy_endpoints(chain_id, self.selection_options(count, true))
                .await
            {
                Ok(endpoints) => {
                    for endpoint in endpoints
                        .iter()
                        .filter(|e| e.transport_kind.is_streaming())
                    {
                        if subscription.is_closed() {
                            return;
                        }
                        match self.attach_streaming(&subscription, endpoint).await {
                            Ok(()) => attached += 1,
                            Err(error) => subscription.report_error(error),
                        }
                    }
                }
                Err(error) => subscription.report_error(WatchError::Selection(error)),
            }

            if attached > 0 {
                subscription.transition(SubscriptionStatus::Active);
                info!(
                    subscription = subscription.id,
                    watchers = attached,
                    "streaming watchers attached"
                );
                return;
            }
            if preference == TransportPreference::Streaming {
                subscription.report_error(WatchError::StreamingUnavailable(chain_id));
            }
        }

        let mut attached = 0usize;
        match self
            .health
            .diverse_healthy_endpoints(chain_id, self.selection_options(count, false))
            .await
        {
            Ok(endpoints) => {
                for endpoint in &endpoints {
                    if subscription.is_closed() {
                        return;
                    }
                    match self.attach_polling(&subscription, endpoint).await {
                        Ok(()) => attached += 1,
                        Err(error) => subscription.report_error(error),
                    }
                }
            }
            Err(error) => subscription.report_error(WatchError::Selection(error)),
        }

        if attached > 0 {
            subscription.transition(SubscriptionStatus::Fallback);
            info!(
                subscription = subscription.id,
                watchers = attached,
                "polling watchers attached"
            );
            return;
        }

        subscription.report_error(WatchError::AttachExhausted(chain_id));
        self.unsubscribe(subscription.id);
    }

    /// Attach a push watcher to one streaming endpoint
    async fn attach_streaming(
        self: &Arc<Self>,
        subscription: &Arc<SubscriptionInner>,
        endpoint: &Endpoint,
    ) -> Result<(), WatchError> {
        let transport =
            self.factory
                .open(endpoint)
                .await
                .map_err(|e| WatchError::Attach {
                    url: endpoint.url.clone(),
                    reason: e.to_string(),
                })?;
        let mut payloads =
            transport
                .subscribe_pending()
                .await
                .map_err(|e| WatchError::Attach {
                    url: endpoint.url.clone(),
                    reason: e.to_string(),
                })?;

        let controller = Arc::clone(self);
        let subscription_task = Arc::clone(subscription);
        let url = endpoint.url.clone();
        let worker = tokio::spawn(async move {
            while let Some(payload) = payloads.recv().await {
                if subscription_task.is_closed() {
                    return;
                }
                if let Some(enriched) = controller
                    .process_payload(&subscription_task, transport.as_ref(), payload)
                    .await
                {
                    subscription_task.deliver(vec![enriched]);
                }
            }
            if !subscription_task.is_closed() {
                subscription_task.report_error(WatchError::Watcher {
                    url: url.clone(),
                    reason: "pending-transaction stream ended".to_string(),
                });
            }
            debug!(url = %url, "streaming watcher finished");
        });

        subscription.register_watcher(worker);
        debug!(subscription = subscription.id, url = %endpoint.url, "streaming watcher attached");
        Ok(())
    }

    /// Attach a fixed-interval poll watcher to one endpoint
    async fn attach_polling(
        self: &Arc<Self>,
        subscription: &Arc<SubscriptionInner>,
        endpoint: &Endpoint,
    ) -> Result<(), WatchError> {
        let transport =
            self.factory
                .open(endpoint)
                .await
                .map_err(|e| WatchError::Attach {
                    url: endpoint.url.clone(),
                    reason: e.to_string(),
                })?;

        let controller = Arc::clone(self);
        let subscription_task = Arc::clone(subscription);
        let url = endpoint.url.clone();
        let poll_interval = Duration::from_millis(self.config.polling_interval_ms);
        let worker = tokio::spawn(async move {
            let mut ticker = interval(poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if subscription_task.is_closed() {
                    return;
                }
                match transport.pending_block_transactions().await {
                    Ok(raw_transactions) => {
                        let mut batch = Vec::new();
                        for raw in raw_transactions {
                            if subscription_task.is_closed() {
                                return;
                            }
                            let payload = RawTxPayload::Transaction(raw);
                            if let Some(enriched) = controller
                                .process_payload(&subscription_task, transport.as_ref(), payload)
                                .await
                            {
                                batch.push(enriched);
                            }
                        }
                        subscription_task.deliver(batch);
                    }
                    Err(e) => subscription_task.report_error(WatchError::Watcher {
                        url: url.clone(),
                        reason: e.to_string(),
                    }),
                }
            }
        });

        subscription.register_watcher(worker);
        debug!(subscription = subscription.id, url = %endpoint.url, "polling watcher attached");
        Ok(())
    }

    /// Run one raw payload through the pipeline. Returns the enriched
    /// transaction when it survives normalization, dedup and filtering.
    async fn process_payload(
        &self,
        subscription: &SubscriptionInner,
        transport: &dyn Transport,
        payload: RawTxPayload,
    ) -> Option<EnrichedTransaction> {
        if subscription.is_closed() {
            return None;
        }

        let normalized = match normalize(subscription.chain_id, payload, transport).await {
            Ok(tx) => tx,
            Err(e) => {
                warn!(subscription = subscription.id, error = %e, "skipping payload");
                return None;
            }
        };

        if !subscription.dedupe.should_process(normalized.hash) {
            subscription.stats.dropped.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let decoded = self.decoder.decode(normalized).await;
        let enriched = enrich(decoded);

        if !passes(&enriched, subscription.filter.as_ref()) {
            return None;
        }
        // A watcher cancelled mid-flight may still get here; drop its payload
        if subscription.is_closed() {
            return None;
        }
        Some(enriched)
    }
}
