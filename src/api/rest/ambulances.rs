use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::{get, patch, post};
use axum::Json;
use axum::Router;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::ambulance::{Ambulance, AmbulanceStatus, Coordinate, RankedAmbulance};
use crate::state::AppState;
use crate::store::load_ambulance;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/ambulances", post(register_ambulance))
        .route("/ambulances/nearby", get(find_nearby))
        .route("/ambulances/:id/location", patch(update_ambulance_location))
        .route("/ambulances/:id/status", patch(update_ambulance_status))
}

#[derive(Deserialize)]
pub struct NearbyParams {
    pub lat: f64,
    pub lng: f64,
    pub radius_km: Option<f64>,
    pub limit: Option<usize>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterAmbulanceRequest {
    pub vehicle_number: String,
    #[serde(rename = "type", default)]
    pub vehicle_type: String,
    pub driver_name: String,
    pub driver_phone: String,
    pub location: Coordinate,
    pub status: Option<AmbulanceStatus>,
}

#[derive(Deserialize)]
pub struct UpdateLocationRequest {
    pub location: Coordinate,
}

#[derive(Deserialize)]
pub struct UpdateStatusRequest {
    pub status: AmbulanceStatus,
}

async fn find_nearby(
    State(state): State<Arc<AppState>>,
    Query(params): Query<NearbyParams>,
) -> Result<Json<Vec<RankedAmbulance>>, AppError> {
    let ranked = state
        .locator
        .find_nearby(
            Coordinate::new(params.lat, params.lng),
            params.radius_km.unwrap_or(state.config.search_radius_km),
            params.limit.unwrap_or(state.config.candidate_pool_size),
        )
        .await?;

    Ok(Json(ranked))
}

async fn register_ambulance(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<RegisterAmbulanceRequest>,
) -> Result<Json<Ambulance>, AppError> {
    if payload.vehicle_number.trim().is_empty() {
        return Err(AppError::Validation(
            "vehicleNumber cannot be empty".to_string(),
        ));
    }
    if payload.driver_name.trim().is_empty() {
        return Err(AppError::Validation("driverName cannot be empty".to_string()));
    }
    payload.location.validate()?;

    let ambulance = Ambulance {
        id: Uuid::new_v4().to_string(),
        location: payload.location,
        status: payload.status.unwrap_or(AmbulanceStatus::Available),
        vehicle_number: payload.vehicle_number,
        vehicle_type: payload.vehicle_type,
        driver_name: payload.driver_name,
        driver_phone: payload.driver_phone,
        current_request_id: None,
        last_updated: Utc::now(),
    };

    let document = serde_json::to_value(&ambulance)
        .map_err(|err| AppError::Internal(format!("failed to encode ambulance: {err}")))?;
    state.store.put_ambulance(&ambulance.id, document).await?;

    Ok(Json(ambulance))
}

async fn update_ambulance_location(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(payload): Json<UpdateLocationRequest>,
) -> Result<Json<Ambulance>, AppError> {
    payload.location.validate()?;

    state
        .store
        .update_ambulance(&id, json!({ "location": payload.location }))
        .await?;

    Ok(Json(load_ambulance(state.store.as_ref(), &id).await?))
}

async fn update_ambulance_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(payload): Json<UpdateStatusRequest>,
) -> Result<Json<Ambulance>, AppError> {
    let fields = match payload.status {
        // Back in service: no longer bound to a request.
        AmbulanceStatus::Available => json!({ "status": payload.status, "currentRequestId": null }),
        status => json!({ "status": status }),
    };

    state.store.update_ambulance(&id, fields).await?;

    Ok(Json(load_ambulance(state.store.as_ref(), &id).await?))
}
