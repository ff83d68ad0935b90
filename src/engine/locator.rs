use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::AppError;
use crate::geo::haversine_km;
use crate::models::ambulance::{Ambulance, AmbulanceStatus, Coordinate, RankedAmbulance};
use crate::observability::metrics::Metrics;
use crate::store::{AmbulanceQuery, DocumentStore, AMBULANCES};

pub const DEFAULT_RADIUS_KM: f64 = 10.0;
pub const DEFAULT_CANDIDATE_POOL_SIZE: usize = 20;

/// Finds available ambulances around a point.
///
/// The store returns a bounded pool of the most recently updated available
/// ambulances; distance filtering and ranking happen here.
pub struct AmbulanceLocator {
    store: Arc<dyn DocumentStore>,
    query_timeout: Duration,
    metrics: Metrics,
}

impl AmbulanceLocator {
    pub fn new(store: Arc<dyn DocumentStore>, query_timeout: Duration, metrics: Metrics) -> Self {
        Self {
            store,
            query_timeout,
            metrics,
        }
    }

    pub async fn find_nearby(
        &self,
        origin: Coordinate,
        radius_km: f64,
        candidate_pool_size: usize,
    ) -> Result<Vec<RankedAmbulance>, AppError> {
        let start = Instant::now();
        let result = self.query(origin, radius_km, candidate_pool_size).await;

        let outcome = if result.is_ok() { "success" } else { "error" };
        self.metrics
            .nearby_query_latency_seconds
            .with_label_values(&[outcome])
            .observe(start.elapsed().as_secs_f64());
        self.metrics
            .nearby_queries_total
            .with_label_values(&[outcome])
            .inc();

        match &result {
            Ok(ranked) => debug!(
                lat = origin.lat,
                lng = origin.lng,
                radius_km,
                found = ranked.len(),
                "nearby ambulances ranked"
            ),
            Err(err) => warn!(error = %err, "nearby ambulance query failed"),
        }

        result
    }

    async fn query(
        &self,
        origin: Coordinate,
        radius_km: f64,
        candidate_pool_size: usize,
    ) -> Result<Vec<RankedAmbulance>, AppError> {
        origin.validate()?;
        if !(radius_km.is_finite() && radius_km > 0.0) {
            return Err(AppError::Validation(format!(
                "radius must be a positive number of km, got {radius_km}"
            )));
        }
        if candidate_pool_size == 0 {
            return Err(AppError::Validation(
                "candidate pool size must be > 0".to_string(),
            ));
        }

        let query = AmbulanceQuery {
            status: AmbulanceStatus::Available,
            limit: candidate_pool_size,
        };
        let documents = timeout(self.query_timeout, self.store.query_ambulances(query))
            .await
            .map_err(|_| {
                AppError::Retrieval(format!(
                    "ambulance query timed out after {}ms",
                    self.query_timeout.as_millis()
                ))
            })??;

        let candidates = documents
            .into_iter()
            .map(|doc| doc.decode::<Ambulance>(AMBULANCES))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(rank_candidates(&origin, candidates, radius_km))
    }
}

/// Annotates each candidate with its distance from `origin`, drops those
/// beyond `radius_km` and sorts the rest nearest first. Equal distances keep
/// their retrieval order.
pub fn rank_candidates(
    origin: &Coordinate,
    candidates: Vec<Ambulance>,
    radius_km: f64,
) -> Vec<RankedAmbulance> {
    let mut ranked: Vec<RankedAmbulance> = candidates
        .into_iter()
        .map(|ambulance| RankedAmbulance {
            distance_km: haversine_km(origin, &ambulance.location),
            ambulance,
        })
        .filter(|candidate| candidate.distance_km <= radius_km)
        .collect();

    ranked.sort_by(|a, b| a.distance_km.total_cmp(&b.distance_km));
    ranked
}
