use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::Json;
use axum::Router;

use crate::api::rest::ws;
use crate::error::AppError;
use crate::identity::CurrentUser;
use crate::models::request::{NewRequest, Request};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/requests", post(create_request).get(list_requests))
        .route("/requests/:id", get(get_request))
        .route("/requests/:id/track", get(ws::track_handler))
}

async fn create_request(
    State(state): State<Arc<AppState>>,
    user: CurrentUser,
    Json(payload): Json<NewRequest>,
) -> Result<Json<Request>, AppError> {
    let request = state.requests.create_request(&user, payload).await?;
    Ok(Json(request))
}

async fn list_requests(
    State(state): State<Arc<AppState>>,
    user: CurrentUser,
) -> Result<Json<Vec<Request>>, AppError> {
    Ok(Json(state.requests.list_user_requests(&user.uid).await?))
}

async fn get_request(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Request>, AppError> {
    Ok(Json(state.requests.get_request(&id).await?))
}
