use std::sync::Arc;

use kube::Client;

use crate::config::OperatorConfig;
use crate::controller::error::{BackoffConfig, RetryTracker};
use crate::health::HealthState;

/// Shared context for the controller
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Image registry and worker image
    pub config: Arc<OperatorConfig>,
    /// Metrics sink, absent when running without the health server
    pub health_state: Option<Arc<HealthState>>,
    pub backoff: BackoffConfig,
    /// Failed passes since each cluster's last success
    pub retries: Arc<RetryTracker>,
}

impl Context {
    pub fn new(client: Client, config: OperatorConfig) -> Self {
        Self {
            client,
            config: Arc::new(config),
            health_state: None,
            backoff: BackoffConfig::default(),
            retries: Arc::new(RetryTracker::default()),
        }
    }

    pub fn with_health_state(mut self, state: Arc<HealthState>) -> Self {
        self.health_state = Some(state);
        self
    }
}
