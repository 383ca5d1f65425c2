use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;
use std::sync::atomic::AtomicI64;
use std::sync::Arc;

/// Prometheus metrics for the consensus node.
#[derive(Clone)]
pub struct Metrics {
    pub registry: Arc<std::sync::Mutex<Registry>>,

    pub consensus_height: Gauge<i64, AtomicI64>,
    pub consensus_round: Gauge<i64, AtomicI64>,
    pub consensus_proposals_received: Counter,
    pub consensus_votes_received: Counter,
    pub consensus_timeouts: Counter,
    pub consensus_equivocations: Counter,
    pub consensus_block_commit_duration: Histogram,
    pub consensus_rounds_per_height: Histogram,

    pub wal_write_duration: Histogram,
    pub wal_bytes_written: Counter,

    pub block_finalize_duration: Histogram,
    pub block_txs_committed: Counter,

    pub eventbus_subscribers_dropped: Counter,
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let consensus_height = Gauge::<i64, AtomicI64>::default();
        registry.register(
            "lockstep_consensus_height",
            "Current consensus height",
            consensus_height.clone(),
        );

        let consensus_round = Gauge::<i64, AtomicI64>::default();
        registry.register(
            "lockstep_consensus_round",
            "Current consensus round",
            consensus_round.clone(),
        );

        let consensus_proposals_received = Counter::default();
        registry.register(
            "lockstep_consensus_proposals_received_total",
            "Proposals received",
            consensus_proposals_received.clone(),
        );

        let consensus_votes_received = Counter::default();
        registry.register(
            "lockstep_consensus_votes_received_total",
            "Votes received",
            consensus_votes_received.clone(),
        );

        let consensus_timeouts = Counter::default();
        registry.register(
            "lockstep_consensus_timeouts_total",
            "Timeouts fired",
            consensus_timeouts.clone(),
        );

        let consensus_equivocations = Counter::default();
        registry.register(
            "lockstep_consensus_equivocations_total",
            "Conflicting vote pairs detected",
            consensus_equivocations.clone(),
        );

        let consensus_block_commit_duration = Histogram::new(exponential_buckets(0.01, 2.0, 12));
        registry.register(
            "lockstep_consensus_block_commit_duration_seconds",
            "Time from entering a height to commit",
            consensus_block_commit_duration.clone(),
        );

        let consensus_rounds_per_height = Histogram::new(exponential_buckets(1.0, 2.0, 8));
        registry.register(
            "lockstep_consensus_rounds_per_height",
            "Rounds needed to commit",
            consensus_rounds_per_height.clone(),
        );

        let wal_write_duration = Histogram::new(exponential_buckets(0.0001, 2.0, 12));
        registry.register(
            "lockstep_wal_write_duration_seconds",
            "WAL append latency",
            wal_write_duration.clone(),
        );

        let wal_bytes_written = Counter::default();
        registry.register(
            "lockstep_wal_bytes_written_total",
            "Bytes appended to the WAL",
            wal_bytes_written.clone(),
        );

        let block_finalize_duration = Histogram::new(exponential_buckets(0.001, 2.0, 14));
        registry.register(
            "lockstep_block_finalize_duration_seconds",
            "Application finalize + persist latency",
            block_finalize_duration.clone(),
        );

        let block_txs_committed = Counter::default();
        registry.register(
            "lockstep_block_txs_committed_total",
            "Transactions committed",
            block_txs_committed.clone(),
        );

        let eventbus_subscribers_dropped = Counter::default();
        registry.register(
            "lockstep_eventbus_subscribers_dropped_total",
            "Slow event subscribers dropped",
            eventbus_subscribers_dropped.clone(),
        );

        Self {
            registry: Arc::new(std::sync::Mutex::new(registry)),
            consensus_height,
            consensus_round,
            consensus_proposals_received,
            consensus_votes_received,
            consensus_timeouts,
            consensus_equivocations,
            consensus_block_commit_duration,
            consensus_rounds_per_height,
            wal_write_duration,
            wal_bytes_written,
            block_finalize_duration,
            block_txs_committed,
            eventbus_subscribers_dropped,
        }
    }

    /// Prometheus text exposition format.
    pub fn encode(&self) -> String {
        let mut buf = String::new();
        let registry = self.registry.lock().unwrap();
        prometheus_client::encoding::text::encode(&mut buf, &registry).unwrap_or_default();
        buf
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
