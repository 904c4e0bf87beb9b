use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::{spawn, time::sleep};
use tracing::{info, warn};

use cowrite_core::{
    HubConfig,
    bus::DocumentBus,
    cache::{MemoryCache, SharedCache},
    config::DocumentBackend,
    content::ContentCache,
    documents::{DocumentGateway, MemoryDocumentGateway},
    limiter::RateLimiter,
    presence::PresenceRegistry,
    queue::PersistenceQueue,
};

use crate::{
    auth::AccessTokenSigner,
    document_api::HttpDocumentGateway,
    ws::relay::{SocketRegistry, TopicSubscriptions},
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<HubConfig>,
    pub cache: SharedCache,
    pub presence: PresenceRegistry,
    pub limiter: RateLimiter,
    pub content: ContentCache,
    pub queue: PersistenceQueue,
    pub bus: DocumentBus,
    pub documents: Arc<dyn DocumentGateway>,
    pub signer: Arc<AccessTokenSigner>,
    pub sockets: Arc<SocketRegistry>,
    pub topics: Arc<TopicSubscriptions>,
    pub metrics: Arc<HubMetrics>,
}

/// Build the hub with the configured backends and start its periodic
/// duties.
pub fn build_state(config: HubConfig) -> AppState {
    let cache: SharedCache = Arc::new(MemoryCache::new());
    let documents = create_document_gateway(&config);
    build_state_with(config, cache, documents)
}

/// Build the hub around externally supplied backends. Several states built
/// over one shared cache behave as separate instances of one cluster, which
/// is how the cross-instance tests run.
pub fn build_state_with(
    config: HubConfig,
    cache: SharedCache,
    documents: Arc<dyn DocumentGateway>,
) -> AppState {
    let metrics = Arc::new(HubMetrics::default());
    let presence = PresenceRegistry::new(cache.clone(), config.session_ttl());
    let limiter = RateLimiter::new(cache.clone(), config.rate_limit_config());
    let content = ContentCache::new(cache.clone(), config.cache_ttl());
    let queue = PersistenceQueue::new(
        cache.clone(),
        config.queue_max_attempts,
        config.queue_backoff(),
    );
    let bus = DocumentBus::new(cache.clone());
    let sockets = Arc::new(SocketRegistry::new());
    let topics = Arc::new(TopicSubscriptions::new(
        bus.clone(),
        sockets.clone(),
        metrics.clone(),
    ));

    let state = AppState {
        config: Arc::new(config),
        cache,
        presence,
        limiter,
        content,
        queue,
        bus,
        documents,
        signer: Arc::new(AccessTokenSigner::new()),
        sockets,
        topics,
        metrics,
    };

    spawn_background_tasks(&state);

    state
}

fn create_document_gateway(config: &HubConfig) -> Arc<dyn DocumentGateway> {
    match config.document_backend {
        DocumentBackend::Memory => Arc::new(MemoryDocumentGateway::new()),
        DocumentBackend::Http => {
            let base_url = config
                .document_api_url
                .clone()
                .expect("validated configuration carries a document api url");
            Arc::new(HttpDocumentGateway::new(base_url))
        }
    }
}

fn spawn_background_tasks(state: &AppState) {
    let limiter = state.limiter.clone();
    let gc_interval = state.config.limiter_gc_interval();
    spawn(async move {
        loop {
            sleep(gc_interval).await;
            match limiter.collect_garbage().await {
                Ok(report) => {
                    if report.timestamps_removed > 0 || report.buckets_dropped > 0 {
                        info!(
                            buckets_scanned = report.buckets_scanned,
                            buckets_dropped = report.buckets_dropped,
                            timestamps_removed = report.timestamps_removed,
                            "rate limiter garbage collected"
                        );
                    }
                }
                Err(error) => warn!(%error, "rate limiter garbage collection failed"),
            }
        }
    });

    let presence = state.presence.clone();
    let sweep_interval = state.config.stale_sweep_interval();
    spawn(async move {
        loop {
            sleep(sweep_interval).await;
            match presence.sweep_stale().await {
                Ok(report) => {
                    if report.sessions_removed > 0 {
                        info!(
                            documents_scanned = report.documents_scanned,
                            sessions_removed = report.sessions_removed,
                            "swept stale presence sessions"
                        );
                    }
                }
                Err(error) => warn!(%error, "presence sweep failed"),
            }
        }
    });
}

impl AppState {
    /// Close every local socket with a normal closure and eagerly clear its
    /// presence, ahead of process exit. Sessions on other instances are
    /// untouched.
    ///
    /// Firing each connection's shutdown lever makes its read loop stop and
    /// its writer flush a close frame; the connection task then runs its own
    /// tear-down. Anything that has not wound down within the grace period
    /// (and any socket registered mid-drain) gets the same tear-down
    /// directly — it is idempotent, so the two paths may race.
    pub async fn drain(&self) {
        let mut draining = self.sockets.drain_all();
        info!(sockets = draining.len(), "draining local connections");
        for (_, handle) in &draining {
            handle.shutdown();
        }

        for _ in 0..100 {
            if draining.iter().all(|(_, handle)| handle.is_closed()) {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }

        draining.extend(self.sockets.drain_all());
        for (socket_id, handle) in &draining {
            handle.shutdown();
            crate::ws::connection::cleanup_connection(self, socket_id, handle).await;
        }

        let snapshot = self.metrics.snapshot();
        info!(
            relayed_frames = snapshot.relayed_frames,
            dropped_frames = snapshot.dropped_frames,
            rate_limited = snapshot.rate_limited,
            "gateway drained"
        );
    }
}

#[derive(Default)]
pub struct HubMetrics {
    connections: AtomicUsize,
    relayed_frames: AtomicU64,
    dropped_frames: AtomicU64,
    rate_limited: AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub connections: usize,
    pub relayed_frames: u64,
    pub dropped_frames: u64,
    pub rate_limited: u64,
}

impl HubMetrics {
    pub fn inc_connections(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_connections(&self) {
        self.connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn inc_relayed(&self) {
        self.relayed_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_dropped(&self) {
        self.dropped_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections: self.connections.load(Ordering::Relaxed),
            relayed_frames: self.relayed_frames.load(Ordering::Relaxed),
            dropped_frames: self.dropped_frames.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
        }
    }
}
