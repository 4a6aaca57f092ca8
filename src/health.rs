//! Health server for Kubernetes probes and Prometheus metrics
//!
//! - `/healthz` liveness
//! - `/readyz` readiness, false until the controller runs and again during shutdown
//! - `/metrics` Prometheus text format

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::{EncodeLabel, EncodeLabelSet, LabelSetEncoder};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use tokio::net::TcpListener;
use tokio::sync::RwLock;

/// Address the health server binds to
pub const HEALTH_ADDR: &str = "0.0.0.0:8080";

/// Per-cluster labels
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct ReconcileLabels {
    pub namespace: String,
    pub name: String,
}

impl EncodeLabelSet for ReconcileLabels {
    fn encode(&self, encoder: &mut LabelSetEncoder) -> Result<(), std::fmt::Error> {
        ("namespace", self.namespace.as_str()).encode(encoder.encode_label())?;
        ("name", self.name.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct StateLabels {
    pub state: String,
}

impl EncodeLabelSet for StateLabels {
    fn encode(&self, encoder: &mut LabelSetEncoder) -> Result<(), std::fmt::Error> {
        ("state", self.state.as_str()).encode(encoder.encode_label())
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct PhaseLabels {
    pub phase: String,
}

impl EncodeLabelSet for PhaseLabels {
    fn encode(&self, encoder: &mut LabelSetEncoder) -> Result<(), std::fmt::Error> {
        ("phase", self.phase.as_str()).encode(encoder.encode_label())
    }
}

/// Shared metrics state
pub struct Metrics {
    pub reconciliations_total: Family<ReconcileLabels, Counter>,
    pub reconciliation_errors_total: Family<ReconcileLabels, Counter>,
    pub reconcile_duration_seconds: Family<ReconcileLabels, Histogram>,

    /// Completed upgrade phases, labelled with the phase entered
    pub upgrade_phase_transitions: Family<PhaseLabels, Counter>,

    // Fleet metrics
    pub clusters_total: Family<StateLabels, Gauge>,
    pub cluster_nodes_desired: Family<ReconcileLabels, Gauge>,
    pub cluster_nodes_ready: Family<ReconcileLabels, Gauge>,

    /// Last observed state per cluster, source of `clusters_total`
    cluster_states: Mutex<HashMap<ReconcileLabels, String>>,

    registry: Registry,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

fn labels(namespace: &str, name: &str) -> ReconcileLabels {
    ReconcileLabels {
        namespace: namespace.to_string(),
        name: name.to_string(),
    }
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let reconciliations_total = Family::<ReconcileLabels, Counter>::default();
        registry.register(
            "patroni_operator_reconciliations",
            "Total number of reconciliations",
            reconciliations_total.clone(),
        );

        let reconciliation_errors_total = Family::<ReconcileLabels, Counter>::default();
        registry.register(
            "patroni_operator_reconciliation_errors",
            "Total number of reconciliation errors",
            reconciliation_errors_total.clone(),
        );

        let reconcile_duration_seconds =
            Family::<ReconcileLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.001, 2.0, 15))
            });
        registry.register(
            "patroni_operator_reconcile_duration_seconds",
            "Duration of reconciliation in seconds",
            reconcile_duration_seconds.clone(),
        );

        let upgrade_phase_transitions = Family::<PhaseLabels, Counter>::default();
        registry.register(
            "patroni_operator_upgrade_phase_transitions",
            "Upgrade phases entered",
            upgrade_phase_transitions.clone(),
        );

        let clusters_total = Family::<StateLabels, Gauge>::default();
        registry.register(
            "patroni_operator_clusters_total",
            "Number of PatroniPostgres clusters by state",
            clusters_total.clone(),
        );

        let cluster_nodes_desired = Family::<ReconcileLabels, Gauge>::default();
        registry.register(
            "patroni_operator_cluster_nodes_desired",
            "Nodes declared for each cluster",
            cluster_nodes_desired.clone(),
        );

        let cluster_nodes_ready = Family::<ReconcileLabels, Gauge>::default();
        registry.register(
            "patroni_operator_cluster_nodes_ready",
            "Ready database pods of each cluster",
            cluster_nodes_ready.clone(),
        );

        Self {
            reconciliations_total,
            reconciliation_errors_total,
            reconcile_duration_seconds,
            upgrade_phase_transitions,
            clusters_total,
            cluster_nodes_desired,
            cluster_nodes_ready,
            cluster_states: Mutex::new(HashMap::new()),
            registry,
        }
    }

    /// Record a successful reconciliation
    pub fn record_reconcile(&self, namespace: &str, name: &str, duration_secs: f64) {
        let labels = labels(namespace, name);
        self.reconciliations_total.get_or_create(&labels).inc();
        self.reconcile_duration_seconds
            .get_or_create(&labels)
            .observe(duration_secs);
    }

    /// Record a failed reconciliation
    pub fn record_error(&self, namespace: &str, name: &str) {
        self.reconciliation_errors_total
            .get_or_create(&labels(namespace, name))
            .inc();
    }

    pub fn record_phase_transition(&self, phase: &str) {
        self.upgrade_phase_transitions
            .get_or_create(&PhaseLabels {
                phase: phase.to_string(),
            })
            .inc();
    }

    /// Record the state and size of one cluster and refresh the fleet gauges
    pub fn observe_cluster(&self, namespace: &str, name: &str, state: &str, nodes: i64, ready: i64) {
        let key = labels(namespace, name);
        self.cluster_nodes_desired.get_or_create(&key).set(nodes);
        self.cluster_nodes_ready.get_or_create(&key).set(ready);

        let Ok(mut states) = self.cluster_states.lock() else {
            return;
        };
        states.insert(key, state.to_string());
        self.refresh_state_counts(&states);
    }

    /// Drop a deleted cluster from the fleet gauges
    pub fn forget_cluster(&self, namespace: &str, name: &str) {
        let key = labels(namespace, name);
        self.cluster_nodes_desired.remove(&key);
        self.cluster_nodes_ready.remove(&key);

        let Ok(mut states) = self.cluster_states.lock() else {
            return;
        };
        if states.remove(&key).is_some() {
            self.refresh_state_counts(&states);
        }
    }

    fn refresh_state_counts(&self, states: &HashMap<ReconcileLabels, String>) {
        let mut counts: HashMap<&str, i64> = HashMap::new();
        for state in states.values() {
            *counts.entry(state.as_str()).or_default() += 1;
        }
        self.clusters_total.clear();
        for (state, count) in counts {
            self.clusters_total
                .get_or_create(&StateLabels {
                    state: state.to_string(),
                })
                .set(count);
        }
    }

    /// Encode metrics to Prometheus text format
    fn encode(&self) -> String {
        let mut buffer = String::new();
        if let Err(e) = encode(&mut buffer, &self.registry) {
            tracing::error!("Failed to encode metrics: {}", e);
            return String::new();
        }
        buffer
    }
}

/// Shared state for the health server
pub struct HealthState {
    pub ready: RwLock<bool>,
    pub metrics: Metrics,
    /// Unix time of the last successful reconcile
    pub last_reconcile: AtomicU64,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    pub fn new() -> Self {
        Self {
            ready: RwLock::new(false),
            metrics: Metrics::new(),
            last_reconcile: AtomicU64::new(0),
        }
    }

    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    pub async fn is_ready(&self) -> bool {
        *self.ready.read().await
    }

    pub fn touch(&self) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        self.last_reconcile.store(now, Ordering::Relaxed);
    }
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn readyz(State(state): State<Arc<HealthState>>) -> Response {
    if state.is_ready().await {
        (StatusCode::OK, "ready").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response()
    }
}

async fn metrics(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let body = state.metrics.encode();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

/// Create the health server router
pub fn create_router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Serve health and metrics endpoints on [`HEALTH_ADDR`]
pub async fn run_health_server(state: Arc<HealthState>) -> Result<(), std::io::Error> {
    let app = create_router(state);

    let listener = TcpListener::bind(HEALTH_ADDR).await?;
    tracing::info!("Health server listening on {}", HEALTH_ADDR);

    axum::serve(listener, app).await
}
