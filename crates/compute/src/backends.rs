use std::sync::Arc;

use geoanomaly_core::Clock;
use geoanomaly_queue::{ResultCache, TaskQueue};
use geoanomaly_storage::{AnomalyStore, EvaluationLedger, ObservationStore};

/// Handles to every external collaborator the scheduler and workers share.
#[derive(Clone)]
pub struct Backends {
    pub observations: Arc<dyn ObservationStore>,
    pub anomalies: Arc<dyn AnomalyStore>,
    pub ledger: Arc<dyn EvaluationLedger>,
    pub queue: Arc<dyn TaskQueue>,
    pub cache: Arc<dyn ResultCache>,
    pub clock: Arc<dyn Clock>,
}

impl Backends {
    /// Use one store for observations, anomalies and the ledger.
    pub fn with_store<S>(
        store: Arc<S>,
        queue: Arc<dyn TaskQueue>,
        cache: Arc<dyn ResultCache>,
        clock: Arc<dyn Clock>,
    ) -> Self
    where
        S: ObservationStore + AnomalyStore + EvaluationLedger + 'static,
    {
        Self {
            observations: store.clone(),
            anomalies: store.clone(),
            ledger: store,
            queue,
            cache,
            clock,
        }
    }
}
