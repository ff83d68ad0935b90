use std::sync::Arc;

use crate::config::Config;
use crate::engine::locator::AmbulanceLocator;
use crate::engine::requests::RequestService;
use crate::engine::tracker::{RequestTracker, TrackerSettings};
use crate::observability::metrics::Metrics;
use crate::store::DocumentStore;

pub struct AppState {
    pub config: Config,
    pub store: Arc<dyn DocumentStore>,
    pub locator: AmbulanceLocator,
    pub tracker: RequestTracker,
    pub requests: RequestService,
    pub metrics: Metrics,
}

impl AppState {
    pub fn new(config: Config, store: Arc<dyn DocumentStore>) -> Self {
        let metrics = Metrics::new();

        Self {
            locator: AmbulanceLocator::new(store.clone(), config.query_timeout(), metrics.clone()),
            tracker: RequestTracker::new(
                store.clone(),
                TrackerSettings::from(&config),
                metrics.clone(),
            ),
            requests: RequestService::new(store.clone()),
            store,
            config,
            metrics,
        }
    }
}
