// src/core/state.rs

//! Defines the central `ServerState` struct, holding all shared server-wide
//! state. It is wrapped in an `Arc` and passed to every task and handler,
//! providing a single source of truth for configuration and dynamic state.

use crate::config::Config;
use crate::connection::{ConnectionManager, ConnectionRateLimiter, WriterConfig};
use crate::core::cluster::{ClusterTransport, ClusterView, HashPartitionService, NodeId, PartitionService};
use crate::core::counters::CounterManager;
use crate::core::crdt::{HlcClock, Timestamp};
use crate::core::handler::query::PendingClusterQuery;
use crate::core::handler::regulator::PipelineRegulator;
use crate::core::handler::write_concern::WriteConcernTracker;
use crate::core::interceptor::OpInterceptor;
use crate::core::journal::JournalManager;
use crate::core::locks::{LockManager, composite_holder};
use crate::core::permissions::PermissionPolicy;
use crate::core::query::QueryRegistry;
use crate::core::resolver::ResolverManager;
use crate::core::search::{MemorySearchIndex, SearchIndex, SearchSubscriptions};
use crate::core::storage::{StorageDriver, StorageManager};
use crate::core::topics::TopicManager;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;
use wildmatch::WildMatch;

/// The central struct holding all shared, server-wide state.
pub struct ServerState {
    pub config: Config,
    pub node_id: NodeId,
    /// The node HLC clock; ticked on every inbound frame carrying timestamps.
    pub clock: HlcClock,
    /// The session table. Sole writer of session entries.
    pub connections: ConnectionManager,
    pub rate_limiter: ConnectionRateLimiter,
    /// The map registry. Sole creator of maps.
    pub storage: StorageManager,
    pub cluster: Arc<ClusterView>,
    pub partitions: Arc<dyn PartitionService>,
    pub transport: Arc<dyn ClusterTransport>,
    pub policy: PermissionPolicy,
    pub query_registry: QueryRegistry,
    /// In-flight scatter/gather reads, keyed by request id.
    pub pending_queries: DashMap<String, Arc<PendingClusterQuery>>,
    pub write_concern: Arc<WriteConcernTracker>,
    pub regulator: PipelineRegulator,
    pub topics: TopicManager,
    pub locks: LockManager,
    pub counters: CounterManager,
    pub journal: JournalManager,
    pub search: Arc<dyn SearchIndex>,
    pub search_subs: SearchSubscriptions,
    pub resolvers: ResolverManager,
    interceptors: RwLock<Vec<Arc<dyn OpInterceptor>>>,
    /// Leader-only GC report table: peer id -> reported minimum HLC.
    pub gc_reports: DashMap<NodeId, Timestamp>,
    pub writer_config: WriterConfig,
    pub shutdown_tx: broadcast::Sender<()>,
}

impl std::fmt::Debug for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerState")
            .field("node_id", &self.node_id)
            .field("sessions", &self.connections.count())
            .finish()
    }
}

impl ServerState {
    /// Initializes the entire server state from the given configuration.
    /// This is the main factory function for creating the shared context.
    pub fn initialize(
        config: Config,
        driver: Arc<dyn StorageDriver>,
        transport: Arc<dyn ClusterTransport>,
    ) -> Arc<Self> {
        let node_id = config.effective_node_id();
        info!("Initializing coordinator state for node '{}'", node_id);

        let cluster = Arc::new(ClusterView::new(node_id.clone()));
        if config.cluster.enabled && !config.cluster.seed_members.is_empty() {
            cluster.update_members(config.cluster.seed_members.clone());
        }
        let partitions: Arc<dyn PartitionService> = Arc::new(HashPartitionService::new(
            cluster.clone(),
            config.cluster.partition_count,
            config.cluster.backup_count,
        ));

        let policy = PermissionPolicy::new(
            config.permissions.rules.clone(),
            config.permissions.field_rules.clone(),
            config.allowed_maps.clone(),
            config.enable_mutations,
            config.enable_subscriptions,
        );

        let writer_config = WriterConfig::preset(&config.writer.preset).unwrap_or_default();
        let (shutdown_tx, _) = broadcast::channel(1);

        Arc::new(Self {
            node_id: node_id.clone(),
            clock: HlcClock::new(node_id),
            connections: ConnectionManager::new(config.heartbeat.timeout),
            rate_limiter: ConnectionRateLimiter::new(
                config.admission.max_connections_per_second,
                config.admission.max_pending_connections,
            ),
            storage: StorageManager::new(driver),
            cluster,
            partitions,
            transport,
            policy,
            query_registry: QueryRegistry::new(),
            pending_queries: DashMap::new(),
            write_concern: Arc::new(WriteConcernTracker::new()),
            regulator: PipelineRegulator::new(
                config.pipeline.max_pending_ops,
                config.pipeline.force_sync_threshold,
            ),
            topics: TopicManager::new(),
            locks: LockManager::new(),
            counters: CounterManager::new(),
            journal: JournalManager::new(config.journal.enabled, config.journal.capacity),
            search: Arc::new(MemorySearchIndex::new()),
            search_subs: SearchSubscriptions::new(),
            resolvers: ResolverManager::new(),
            interceptors: RwLock::new(Vec::new()),
            gc_reports: DashMap::new(),
            writer_config,
            shutdown_tx,
            config,
        })
    }

    pub fn register_interceptor(&self, interceptor: Arc<dyn OpInterceptor>) {
        self.interceptors.write().push(interceptor);
    }

    pub fn interceptors(&self) -> Vec<Arc<dyn OpInterceptor>> {
        self.interceptors.read().clone()
    }

    /// True if the search index covers `map`.
    pub fn search_enabled_for(&self, map: &str) -> bool {
        self.config.search.enabled
            && (self.config.search.maps.is_empty()
                || self
                    .config
                    .search
                    .maps
                    .iter()
                    .any(|p| WildMatch::new(p).matches(map)))
    }

    /// The composite lock-holder id for a local session.
    pub fn local_holder(&self, session_id: u64) -> String {
        composite_holder(&self.node_id, session_id)
    }

    /// The earliest last-active HLC across this node's sessions, or the
    /// current clock position when no sessions are connected. Feeds GC
    /// consensus.
    pub fn min_session_hlc(&self) -> Timestamp {
        self.connections
            .all_sessions()
            .iter()
            .map(|s| s.last_hlc())
            .min()
            .unwrap_or_else(|| self.clock.current())
    }
}
