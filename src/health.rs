//! Endpoint Health Management
//!
//! Probes candidate RPC endpoints, maintains a time-windowed health cache
//! and an exponential-moving-average reliability score per endpoint, and
//! selects healthy (optionally provider-diverse) endpoint subsets on demand.
//!
//! The health cache and reliability scores are the only mutable state shared
//! across subscriptions and chains; both live inside one manager instance
//! that is constructed with its collaborators and torn down with them.

use crate::registry::ChainRegistry;
use crate::transport::TransportFactory;
use crate::types::{ChainId, Endpoint, INITIAL_RELIABILITY};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Probe timeout for a single liveness check
pub const DEFAULT_PROBE_TIMEOUT_MS: u64 = 5_000;

/// How long a healthy record stays cached
pub const HEALTHY_TTL_MS: u64 = 300_000;

/// How long an unhealthy record stays cached. Strictly shorter than the
/// healthy TTL so a dead endpoint is not hammered while a recovered one is
/// re-checked quickly.
pub const UNHEALTHY_TTL_MS: u64 = 60_000;

/// Maximum endpoints probed concurrently per selection call
pub const MAX_PROBE_FANOUT: usize = 8;

/// EMA smoothing factor for reliability updates
pub const RELIABILITY_ALPHA: f64 = 0.1;

/// Errors raised by endpoint selection
#[derive(Error, Debug, PartialEq, Eq)]
pub enum HealthError {
    #[error("no endpoints configured for chain {0}")]
    NoEndpoints(ChainId),

    #[error("no healthy endpoints available for chain {0}")]
    NoHealthyEndpoints(ChainId),
}

/// Configuration for health probing and caching
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HealthConfig {
    /// Probe timeout in milliseconds
    pub probe_timeout_ms: u64,
    /// Healthy record TTL in milliseconds
    pub healthy_ttl_ms: u64,
    /// Unhealthy record TTL in milliseconds
    pub unhealthy_ttl_ms: u64,
    /// Maximum concurrent probes per selection call
    pub max_probe_fanout: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_timeout_ms: DEFAULT_PROBE_TIMEOUT_MS,
            healthy_ttl_ms: HEALTHY_TTL_MS,
            unhealthy_ttl_ms: UNHEALTHY_TTL_MS,
            max_probe_fanout: MAX_PROBE_FANOUT,
        }
    }
}

impl HealthConfig {
    pub fn with_probe_timeout_ms(mut self, ms: u64) -> Self {
        self.probe_timeout_ms = ms;
        self
    }

    pub fn with_ttls_ms(mut self, healthy: u64, unhealthy: u64) -> Self {
        self.healthy_ttl_ms = healthy;
        self.unhealthy_ttl_ms = unhealthy;
        self
    }

    pub fn with_max_probe_fanout(mut self, fanout: usize) -> Self {
        self.max_probe_fanout = fanout;
        self
    }
}

/// Result of one endpoint liveness probe
#[derive(Debug, Clone)]
pub struct HealthRecord {
    pub healthy: bool,
    pub latency_ms: u64,
    pub block_number: Option<u64>,
    pub error: Option<String>,
    pub recorded_at: Instant,
}

impl HealthRecord {
    /// Whether this record is still within its TTL
    fn is_fresh(&self, config: &HealthConfig) -> bool {
        let ttl_ms = if self.healthy {
            config.healthy_ttl_ms
        } else {
            config.unhealthy_ttl_ms
        };
        self.recorded_at.elapsed() < Duration::from_millis(ttl_ms)
    }
}

/// Options for diverse endpoint selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SelectionOptions {
    /// How many endpoints to select
    pub count: usize,
    /// Reliability floor an endpoint must meet to be considered
    pub min_reliability: f64,
    /// Whether streaming-capable endpoints are eligible (false restricts to
    /// HTTP)
    pub include_streaming: bool,
    /// Whether phase 1 should prefer one endpoint per distinct provider
    pub prefer_diverse: bool,
}

impl Default for SelectionOptions {
    fn default() -> Self {
        Self {
            count: 2,
            min_reliability: 0.0,
            include_streaming: false,
            prefer_diverse: true,
        }
    }
}

/// Apply one success/failure observation to a reliability score.
///
/// `score' = score + (1 - score) * α` on success, `score * (1 - α)` on
/// failure, clamped to [0, 1] regardless of input history.
pub fn reliability_update(score: f64, success: bool) -> f64 {
    let updated = if success {
        score + (1.0 - score) * RELIABILITY_ALPHA
    } else {
        score * (1.0 - RELIABILITY_ALPHA)
    };
    updated.clamp(0.0, 1.0)
}

/// Probes endpoints and selects healthy, diverse subsets per chain
pub struct EndpointHealthManager {
    factory: Arc<dyn TransportFactory>,
    chains: Arc<dyn ChainRegistry>,
    config: HealthConfig,
    cache: Mutex<HashMap<(ChainId, String), HealthRecord>>,
    reliability: Mutex<HashMap<(ChainId, String), f64>>,
}

impl EndpointHealthManager {
    pub fn new(
        factory: Arc<dyn TransportFactory>,
        chains: Arc<dyn ChainRegistry>,
        config: HealthConfig,
    ) -> Self {
        Self {
            factory,
            chains,
            config,
            cache: Mutex::new(HashMap::new()),
            reliability: Mutex::new(HashMap::new()),
        }
    }

    /// Current reliability score for an endpoint
    pub fn reliability(&self, chain_id: ChainId, url: &str) -> f64 {
        self.reliability
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(chain_id, url.to_string()))
            .copied()
            .unwrap_or(INITIAL_RELIABILITY)
    }

    /// Number of cached health records (observability helper)
    pub fn cached_record_count(&self) -> usize {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn record_outcome(&self, chain_id: ChainId, url: &str, success: bool) {
        let mut scores = self
            .reliability
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let score = scores
            .entry((chain_id, url.to_string()))
            .or_insert(INITIAL_RELIABILITY);
        *score = reliability_update(*score, success);
    }

    /// Check one endpoint's health, serving a cached record while it is
    /// within its TTL and probing otherwise.
    pub async fn check_health(&self, chain_id: ChainId, endpoint: &Endpoint) -> HealthRecord {
        let key = (chain_id, endpoint.url.clone());
        {
            let cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(record) = cache.get(&key) {
                if record.is_fresh(&self.config) {
                    return record.clone();
                }
            }
        }

        let record = self.probe(chain_id, endpoint).await;
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, record.clone());
        record
    }

    async fn probe(&self, chain_id: ChainId, endpoint: &Endpoint) -> HealthRecord {
        let started = Instant::now();
        let probe_timeout = Duration::from_millis(self.config.probe_timeout_ms);

        let outcome = match self.factory.open(endpoint).await {
            Ok(transport) => match timeout(probe_timeout, transport.latest_block_number()).await {
                Ok(Ok(block)) => Ok(block),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err(format!(
                    "probe timed out after {}ms",
                    self.config.probe_timeout_ms
                )),
            },
            Err(e) => Err(e.to_string()),
        };

        let latency_ms = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(block) => {
                self.record_outcome(chain_id, &endpoint.url, true);
                debug!(url = %endpoint.url, latency_ms, block, "endpoint probe ok");
                HealthRecord {
                    healthy: true,
                    latency_ms,
                    block_number: Some(block),
                    error: None,
                    recorded_at: Instant::now(),
                }
            }
            Err(error) => {
                self.record_outcome(chain_id, &endpoint.url, false);
                warn!(url = %endpoint.url, latency_ms, error = %error, "endpoint probe failed");
                HealthRecord {
                    healthy: false,
                    latency_ms,
                    block_number: None,
                    error: Some(error),
                    recorded_at: Instant::now(),
                }
            }
        }
    }

    /// Stamp an endpoint with its current reliability snapshot
    fn snapshot(&self, chain_id: ChainId, mut endpoint: Endpoint) -> Endpoint {
        endpoint.reliability = self.reliability(chain_id, &endpoint.url);
        endpoint
    }

    /// Probe a set of endpoints concurrently, isolating per-probe failures,
    /// and return the healthy ones with their records.
    async fn probe_concurrently(
        self: &Arc<Self>,
        chain_id: ChainId,
        endpoints: Vec<Endpoint>,
    ) -> Vec<(Endpoint, HealthRecord)> {
        let mut set = JoinSet::new();
        for endpoint in endpoints {
            let manager = Arc::clone(self);
            set.spawn(async move {
                let record = manager.check_health(chain_id, &endpoint).await;
                (endpoint, record)
            });
        }

        let mut healthy = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((endpoint, record)) if record.healthy => healthy.push((endpoint, record)),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "probe task failed"),
            }
        }
        healthy
    }

    /// Select up to `count` healthy HTTP endpoints, fastest first.
    pub async fn healthy_endpoints(
        self: &Arc<Self>,
        chain_id: ChainId,
        count: usize,
    ) -> Result<Vec<Endpoint>, HealthError> {
        let mut candidates: Vec<Endpoint> = self
            .chains
            .endpoints(chain_id)
            .into_iter()
            .filter(|e| !e.transport_kind.is_streaming())
            .collect();

        if candidates.is_empty() {
            return Err(HealthError::NoEndpoints(chain_id));
        }
        candidates.truncate(self.config.max_probe_fanout);

        let mut healthy = self.probe_concurrently(chain_id, candidates).await;
        if healthy.is_empty() {
            return Err(HealthError::NoHealthyEndpoints(chain_id));
        }

        healthy.sort_by_key(|(_, record)| record.latency_ms);
        Ok(healthy
            .into_iter()
            .take(count)
            .map(|(endpoint, _)| self.snapshot(chain_id, endpoint))
            .collect())
    }

    /// Two-phase selection of up to `opts.count` healthy endpoints.
    ///
    /// Phase 1 (only when `prefer_diverse`) walks candidates grouped by
    /// provider label and accepts at most one healthy endpoint per distinct
    /// provider. Phase 2 fills any remaining quota from the still-unused
    /// eligible endpoints, probed concurrently, first healthy wins.
    pub async fn diverse_healthy_endpoints(
        self: &Arc<Self>,
        chain_id: ChainId,
        opts: SelectionOptions,
    ) -> Result<Vec<Endpoint>, HealthError> {
        let candidates = self.chains.endpoints(chain_id);
        if candidates.is_empty() {
            return Err(HealthError::NoEndpoints(chain_id));
        }

        let eligible = |e: &Endpoint| {
            (opts.include_streaming || !e.transport_kind.is_streaming())
                && self.reliability(chain_id, &e.url) >= opts.min_reliability
        };

        let mut selected: Vec<Endpoint> = Vec::new();
        let mut used_urls: HashSet<String> = HashSet::new();

        if opts.prefer_diverse {
            // Group candidates by provider label, preserving first-seen order
            let mut order: Vec<String> = Vec::new();
            let mut groups: HashMap<String, Vec<&Endpoint>> = HashMap::new();
            for endpoint in &candidates {
                if !groups.contains_key(&endpoint.provider_label) {
                    order.push(endpoint.provider_label.clone());
                }
                groups
                    .entry(endpoint.provider_label.clone())
                    .or_default()
                    .push(endpoint);
            }

            for label in order {
                if selected.len() >= opts.count {
                    break;
                }
                let Some(group) = groups.get(&label) else {
                    continue;
                };
                let Some(endpoint) = group.iter().find(|e| eligible(e)) else {
                    continue;
                };

                let record = self.check_health(chain_id, endpoint).await;
                if record.healthy {
                    used_urls.insert(endpoint.url.clone());
                    selected.push(self.snapshot(chain_id, (*endpoint).clone()));
                }
            }
        }

        if selected.len() < opts.count {
            let remaining_quota = opts.count - selected.len();
            let remaining: Vec<Endpoint> = candidates
                .iter()
                .filter(|e| eligible(e) && !used_urls.contains(&e.url))
                .cloned()
                .collect();

            let healthy = self.probe_concurrently(chain_id, remaining).await;
            for (endpoint, _) in healthy.into_iter().take(remaining_quota) {
                selected.push(self.snapshot(chain_id, endpoint));
            }
        }

        if selected.is_empty() {
            return Err(HealthError::NoHealthyEndpoints(chain_id));
        }
        Ok(selected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Transport, TransportError};
    use crate::types::{RawTransaction, RawTxPayload, TransportKind};
    use alloy::primitives::TxHash;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use tokio::sync::mpsc;

    /// Scripted endpoint behavior for health tests
    struct ScriptedTransport {
        kind: TransportKind,
        fail: Arc<AtomicBool>,
        delay_ms: u64,
        probes: Arc<AtomicU64>,
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        fn kind(&self) -> TransportKind {
            self.kind
        }

        async fn latest_block_number(&self) -> Result<u64, TransportError> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            if self.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            }
            if self.fail.load(Ordering::SeqCst) {
                Err(TransportError::Rpc("scripted failure".to_string()))
            } else {
                Ok(19_000_000)
            }
        }

        async fn transaction_by_hash(
            &self,
            _hash: TxHash,
        ) -> Result<Option<RawTransaction>, TransportError> {
            Ok(None)
        }

        async fn pending_block_transactions(&self) -> Result<Vec<RawTransaction>, TransportError> {
            Ok(Vec::new())
        }

        async fn subscribe_pending(&self) -> Result<mpsc::Receiver<RawTxPayload>, TransportError> {
            Err(TransportError::SubscriptionsUnsupported)
        }
    }

    #[derive(Default)]
    struct ScriptedFactory {
        transports: Mutex<HashMap<String, Arc<ScriptedTransport>>>,
    }

    impl ScriptedFactory {
        fn add(&self, url: &str, transport: ScriptedTransport) {
            self.transports
                .lock()
                .unwrap()
                .insert(url.to_string(), Arc::new(transport));
        }
    }

    #[async_trait]
    impl crate::transport::TransportFactory for ScriptedFactory {
        async fn open(
            &self,
            endpoint: &Endpoint,
        ) -> Result<Arc<dyn Transport>, TransportError> {
            self.transports
                .lock()
                .unwrap()
                .get(&endpoint.url)
                .cloned()
                .map(|t| t as Arc<dyn Transport>)
                .ok_or_else(|| TransportError::Connection("unknown endpoint".to_string()))
        }
    }

    struct Fixture {
        factory: Arc<ScriptedFactory>,
        registry: crate::registry::StaticChainRegistry,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                factory: Arc::new(ScriptedFactory::default()),
                registry: crate::registry::StaticChainRegistry::new(),
            }
        }

        fn endpoint(
            &mut self,
            url: &str,
            kind: TransportKind,
            fail: bool,
            delay_ms: u64,
        ) -> (Endpoint, Arc<AtomicBool>, Arc<AtomicU64>) {
            let fail_flag = Arc::new(AtomicBool::new(fail));
            let probes = Arc::new(AtomicU64::new(0));
            self.factory.add(
                url,
                ScriptedTransport {
                    kind,
                    fail: fail_flag.clone(),
                    delay_ms,
                    probes: probes.clone(),
                },
            );
            (Endpoint::new(url, kind), fail_flag, probes)
        }

        fn manager(self, chain_id: ChainId, endpoints: Vec<Endpoint>, config: HealthConfig) -> Arc<EndpointHealthManager> {
            let registry = Arc::new(self.registry.with_chain(chain_id, endpoints));
            Arc::new(EndpointHealthManager::new(self.factory, registry, config))
        }
    }

    // ==================== reliability_update tests ====================

    #[test]
    fn test_reliability_update_success_moves_toward_one() {
        let updated = reliability_update(0.5, true);
        assert!(updated > 0.5);
        assert!((updated - 0.55).abs() < 1e-9);
    }

    #[test]
    fn test_reliability_update_failure_moves_toward_zero() {
        let updated = reliability_update(0.5, false);
        assert!((updated - 0.45).abs() < 1e-9);
    }

    #[test]
    fn test_reliability_stays_clamped_over_long_histories() {
        let mut score = INITIAL_RELIABILITY;
        for _ in 0..10_000 {
            score = reliability_update(score, true);
            assert!((0.0..=1.0).contains(&score));
        }
        assert!(score > 0.99);

        for _ in 0..10_000 {
            score = reliability_update(score, false);
            assert!((0.0..=1.0).contains(&score));
        }
        assert!(score < 0.01);
    }

    #[test]
    fn test_reliability_clamps_out_of_range_input() {
        assert_eq!(reliability_update(2.0, false), 1.0);
        assert_eq!(reliability_update(-1.0, true), 0.0);
    }

    // ==================== TTL configuration tests ====================

    #[test]
    fn test_unhealthy_ttl_strictly_shorter_than_healthy() {
        let config = HealthConfig::default();
        assert!(config.unhealthy_ttl_ms < config.healthy_ttl_ms);
    }

    // ==================== check_health tests ====================

    #[tokio::test]
    async fn test_check_health_probe_success() {
        let mut fixture = Fixture::new();
        let (ep, _, _) = fixture.endpoint("https://a.example.org", TransportKind::Http, false, 0);
        let manager = fixture.manager(1, vec![ep.clone()], HealthConfig::default());

        let record = manager.check_health(1, &ep).await;
        assert!(record.healthy);
        assert_eq!(record.block_number, Some(19_000_000));
        assert!(record.error.is_none());
    }

    #[tokio::test]
    async fn test_check_health_probe_failure_records_error() {
        let mut fixture = Fixture::new();
        let (ep, _, _) = fixture.endpoint("https://bad.example.org", TransportKind::Http, true, 0);
        let manager = fixture.manager(1, vec![ep.clone()], HealthConfig::default());

        let record = manager.check_health(1, &ep).await;
        assert!(!record.healthy);
        assert!(record.error.is_some());
        assert!(manager.reliability(1, &ep.url) < INITIAL_RELIABILITY);
    }

    #[tokio::test]
    async fn test_check_health_serves_cached_record_within_ttl() {
        let mut fixture = Fixture::new();
        let (ep, fail, probes) =
            fixture.endpoint("https://a.example.org", TransportKind::Http, false, 0);
        let manager = fixture.manager(1, vec![ep.clone()], HealthConfig::default());

        let first = manager.check_health(1, &ep).await;
        assert!(first.healthy);
        assert_eq!(probes.load(Ordering::SeqCst), 1);
        assert_eq!(manager.cached_record_count(), 1);

        // Flip the endpoint to failing; the fresh cache entry must win
        fail.store(true, Ordering::SeqCst);
        let second = manager.check_health(1, &ep).await;
        assert!(second.healthy);
        assert_eq!(probes.load(Ordering::SeqCst), 1, "cached record was re-probed");
    }

    #[tokio::test]
    async fn test_check_health_reprobes_after_unhealthy_ttl() {
        let mut fixture = Fixture::new();
        let (ep, fail, probes) =
            fixture.endpoint("https://a.example.org", TransportKind::Http, true, 0);
        let config = HealthConfig::default().with_ttls_ms(5_000, 20);
        let manager = fixture.manager(1, vec![ep.clone()], config);

        assert!(!manager.check_health(1, &ep).await.healthy);
        fail.store(false, Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(40)).await;
        let record = manager.check_health(1, &ep).await;
        assert!(record.healthy, "unhealthy record should expire quickly");
        assert_eq!(probes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_probe_timeout_marks_unhealthy() {
        let mut fixture = Fixture::new();
        let (ep, _, _) = fixture.endpoint("https://slow.example.org", TransportKind::Http, false, 200);
        let config = HealthConfig::default().with_probe_timeout_ms(20);
        let manager = fixture.manager(1, vec![ep.clone()], config);

        let record = manager.check_health(1, &ep).await;
        assert!(!record.healthy);
        assert!(record.error.as_deref().unwrap_or("").contains("timed out"));
    }

    // ==================== healthy_endpoints tests ====================

    #[tokio::test]
    async fn test_healthy_endpoints_sorted_by_latency() {
        let mut fixture = Fixture::new();
        let (slow, _, _) = fixture.endpoint("https://slow.example.org", TransportKind::Http, false, 50);
        let (fast, _, _) = fixture.endpoint("https://fast.example.org", TransportKind::Http, false, 0);
        let manager = fixture.manager(1, vec![slow, fast], HealthConfig::default());

        let selected = manager.healthy_endpoints(1, 2).await.unwrap();
        assert_eq!(selected.len(), 2);
        assert_eq!(selected[0].url, "https://fast.example.org");
        assert_eq!(selected[1].url, "https://slow.example.org");
    }

    #[tokio::test]
    async fn test_healthy_endpoints_excludes_streaming_candidates() {
        let mut fixture = Fixture::new();
        let (ws, _, _) = fixture.endpoint("wss://ws.example.org", TransportKind::Websocket, false, 0);
        let manager = fixture.manager(1, vec![ws], HealthConfig::default());

        let result = manager.healthy_endpoints(1, 1).await;
        assert_eq!(result.unwrap_err(), HealthError::NoEndpoints(1));
    }

    #[tokio::test]
    async fn test_healthy_endpoints_no_candidates() {
        let fixture = Fixture::new();
        let manager = fixture.manager(1, vec![], HealthConfig::default());

        let result = manager.healthy_endpoints(1, 2).await;
        assert_eq!(result.unwrap_err(), HealthError::NoEndpoints(1));
    }

    #[tokio::test]
    async fn test_healthy_endpoints_all_unhealthy() {
        let mut fixture = Fixture::new();
        let (a, _, _) = fixture.endpoint("https://a.example.org", TransportKind::Http, true, 0);
        let (b, _, _) = fixture.endpoint("https://b.example.org", TransportKind::Http, true, 0);
        let manager = fixture.manager(1, vec![a, b], HealthConfig::default());

        let result = manager.healthy_endpoints(1, 2).await;
        assert_eq!(result.unwrap_err(), HealthError::NoHealthyEndpoints(1));
    }

    #[tokio::test]
    async fn test_one_failing_probe_does_not_fail_siblings() {
        let mut fixture = Fixture::new();
        let (bad, _, _) = fixture.endpoint("https://bad.example.org", TransportKind::Http, true, 0);
        let (good, _, _) = fixture.endpoint("https://good.example.org", TransportKind::Http, false, 0);
        let manager = fixture.manager(1, vec![bad, good], HealthConfig::default());

        let selected = manager.healthy_endpoints(1, 2).await.unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].url, "https://good.example.org");
    }

    #[tokio::test]
    async fn test_probe_fanout_cap_limits_candidates() {
        let mut fixture = Fixture::new();
        let mut endpoints = Vec::new();
        let mut probe_counters = Vec::new();
        for i in 0..6 {
            let url = format!("https://node-{i}.example.org");
            let (ep, _, probes) = fixture.endpoint(&url, TransportKind::Http, false, 0);
            endpoints.push(ep);
            probe_counters.push(probes);
        }
        let config = HealthConfig::default().with_max_probe_fanout(3);
        let manager = fixture.manager(1, endpoints, config);

        manager.healthy_endpoints(1, 6).await.unwrap();
        let probed: u64 = probe_counters.iter().map(|p| p.load(Ordering::SeqCst)).sum();
        assert_eq!(probed, 3);
    }

    // ==================== diverse_healthy_endpoints tests ====================

    #[tokio::test]
    async fn test_diverse_selection_picks_distinct_providers() {
        let mut fixture = Fixture::new();
        let (a, _, _) =
            fixture.endpoint("wss://mainnet.infura.io/ws", TransportKind::Websocket, false, 0);
        let (b, _, _) = fixture.endpoint(
            "wss://eth-mainnet.g.alchemy.com/v2",
            TransportKind::Websocket,
            false,
            0,
        );
        let (c, _, _) = fixture.endpoint("wss://rpc.ankr.com/eth/ws", TransportKind::Websocket, false, 0);
        let manager = fixture.manager(1, vec![a, b, c], HealthConfig::default());

        let opts = SelectionOptions {
            count: 2,
            include_streaming: true,
            prefer_diverse: true,
            ..Default::default()
        };
        let selected = manager.diverse_healthy_endpoints(1, opts).await.unwrap();

        assert_eq!(selected.len(), 2);
        assert_ne!(selected[0].provider_label, selected[1].provider_label);
    }

    #[tokio::test]
    async fn test_diverse_selection_one_per_provider_in_phase_one() {
        let mut fixture = Fixture::new();
        // Two Infura endpoints and one Ankr endpoint
        let (a, _, _) =
            fixture.endpoint("wss://mainnet.infura.io/ws/1", TransportKind::Websocket, false, 0);
        let (b, _, _) =
            fixture.endpoint("wss://mainnet.infura.io/ws/2", TransportKind::Websocket, false, 0);
        let (c, _, _) = fixture.endpoint("wss://rpc.ankr.com/eth/ws", TransportKind::Websocket, false, 0);
        let manager = fixture.manager(1, vec![a, b, c], HealthConfig::default());

        let opts = SelectionOptions {
            count: 2,
            include_streaming: true,
            prefer_diverse: true,
            ..Default::default()
        };
        let selected = manager.diverse_healthy_endpoints(1, opts).await.unwrap();

        let labels: HashSet<_> = selected.iter().map(|e| e.provider_label.clone()).collect();
        assert_eq!(labels.len(), 2, "expected two distinct providers: {labels:?}");
    }

    #[tokio::test]
    async fn test_diverse_selection_phase_two_fills_quota() {
        let mut fixture = Fixture::new();
        // Only one provider label available, but three endpoints
        let (a, _, _) =
            fixture.endpoint("wss://mainnet.infura.io/ws/1", TransportKind::Websocket, false, 0);
        let (b, _, _) =
            fixture.endpoint("wss://mainnet.infura.io/ws/2", TransportKind::Websocket, false, 0);
        let (c, _, _) =
            fixture.endpoint("wss://mainnet.infura.io/ws/3", TransportKind::Websocket, false, 0);
        let manager = fixture.manager(1, vec![a, b, c], HealthConfig::default());

        let opts = SelectionOptions {
            count: 3,
            include_streaming: true,
            prefer_diverse: true,
            ..Default::default()
        };
        let selected = manager.diverse_healthy_endpoints(1, opts).await.unwrap();
        assert_eq!(selected.len(), 3);
    }

    #[tokio::test]
    async fn test_diverse_selection_respects_reliability_floor() {
        let mut fixture = Fixture::new();
        let (a, _, _) = fixture.endpoint("https://a.example.org", TransportKind::Http, true, 0);
        let (b, _, _) = fixture.endpoint("https://b.example.org", TransportKind::Http, false, 0);
        let config = HealthConfig::default().with_ttls_ms(5_000, 1);
        let manager = fixture.manager(1, vec![a.clone(), b], config);

        // Drive endpoint A's reliability below the floor
        for _ in 0..10 {
            manager.check_health(1, &a).await;
            tokio::time::sleep(Duration::from_millis(3)).await;
        }
        assert!(manager.reliability(1, &a.url) < 0.3);

        let opts = SelectionOptions {
            count: 2,
            min_reliability: 0.3,
            include_streaming: false,
            prefer_diverse: false,
        };
        let selected = manager.diverse_healthy_endpoints(1, opts).await.unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].url, "https://b.example.org");
    }

    #[tokio::test]
    async fn test_diverse_selection_streaming_excluded_by_default() {
        let mut fixture = Fixture::new();
        let (ws, _, _) = fixture.endpoint("wss://ws.example.org", TransportKind::Websocket, false, 0);
        let (http, _, _) = fixture.endpoint("https://http.example.org", TransportKind::Http, false, 0);
        let manager = fixture.manager(1, vec![ws, http], HealthConfig::default());

        let opts = SelectionOptions {
            count: 2,
            include_streaming: false,
            prefer_diverse: true,
            ..Default::default()
        };
        let selected = manager.diverse_healthy_endpoints(1, opts).await.unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].url, "https://http.example.org");
    }

    #[tokio::test]
    async fn test_diverse_selection_nothing_healthy() {
        let mut fixture = Fixture::new();
        let (a, _, _) = fixture.endpoint("https://a.example.org", TransportKind::Http, true, 0);
        let manager = fixture.manager(1, vec![a], HealthConfig::default());

        let result = manager
            .diverse_healthy_endpoints(1, SelectionOptions::default())
            .await;
        assert_eq!(result.unwrap_err(), HealthError::NoHealthyEndpoints(1));
    }

    #[tokio::test]
    async fn test_selection_stamps_reliability_snapshot() {
        let mut fixture = Fixture::new();
        let (a, _, _) = fixture.endpoint("https://a.example.org", TransportKind::Http, false, 0);
        let manager = fixture.manager(1, vec![a], HealthConfig::default());

        let selected = manager.healthy_endpoints(1, 1).await.unwrap();
        // One successful probe lifts reliability above the initial 0.5
        assert!(selected[0].reliability > INITIAL_RELIABILITY);
    }
}
