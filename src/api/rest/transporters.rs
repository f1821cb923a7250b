use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, patch, put};
use axum::Json;
use axum::Router;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use serde::Deserialize;
use uuid::Uuid;

use crate::dispatch;
use crate::error::AppError;
use crate::models::job::Job;
use crate::models::transporter::{AvailabilityRecord, GeoPoint};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/transporters", get(list_transporters))
        .route("/transporters/:id", put(upsert_transporter))
        .route("/transporters/:id/status", patch(update_status))
        .route("/transporters/:id/location", patch(update_location))
        .route("/transporters/:id/offers", get(list_offers))
}

#[derive(Deserialize)]
pub struct UpsertTransporterRequest {
    pub name: String,
    pub location: GeoPoint,
    pub accuracy_m: f64,
    pub heading: Option<f64>,
    #[serde(default)]
    pub verified: bool,
    pub max_active_jobs: Option<u8>,
}

#[derive(Deserialize)]
pub struct UpdateStatusRequest {
    pub online: bool,
}

#[derive(Deserialize)]
pub struct UpdateLocationRequest {
    pub location: GeoPoint,
    pub accuracy_m: f64,
    pub heading: Option<f64>,
}

async fn list_transporters(State(state): State<Arc<AppState>>) -> Json<Vec<AvailabilityRecord>> {
    let transporters = state
        .transporters
        .iter()
        .map(|entry| entry.value().clone())
        .collect();
    Json(transporters)
}

async fn upsert_transporter(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpsertTransporterRequest>,
) -> Result<Json<AvailabilityRecord>, AppError> {
    if payload.name.trim().is_empty() {
        return Err(AppError::Validation("name cannot be empty".to_string()));
    }
    if !payload.location.in_range() {
        return Err(AppError::Validation("location out of range".to_string()));
    }
    if payload.max_active_jobs == Some(0) {
        return Err(AppError::Validation(
            "max_active_jobs must be > 0".to_string(),
        ));
    }

    let max_active_jobs = payload
        .max_active_jobs
        .unwrap_or(state.config.default_max_active_jobs);

    let record = match state.transporters.entry(id) {
        Entry::Occupied(mut entry) => {
            let record = entry.get_mut();
            record.name = payload.name;
            record.location = payload.location;
            record.accuracy_m = payload.accuracy_m;
            record.heading = payload.heading;
            record.verified = payload.verified;
            record.max_active_jobs = max_active_jobs;
            record.updated_at = Utc::now();
            record.clone()
        }
        Entry::Vacant(entry) => entry
            .insert(AvailabilityRecord {
                id,
                name: payload.name,
                location: payload.location,
                accuracy_m: payload.accuracy_m,
                heading: payload.heading,
                online: true,
                verified: payload.verified,
                active_jobs: 0,
                max_active_jobs,
                updated_at: Utc::now(),
            })
            .clone(),
    };

    Ok(Json(record))
}

async fn update_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateStatusRequest>,
) -> Result<Json<AvailabilityRecord>, AppError> {
    let mut record = state
        .transporters
        .get_mut(&id)
        .ok_or_else(|| AppError::NotFound(format!("transporter {} not found", id)))?;

    // Going offline stops new offers; jobs already in custody stay bound.
    record.online = payload.online;
    record.updated_at = Utc::now();

    Ok(Json(record.clone()))
}

async fn update_location(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateLocationRequest>,
) -> Result<Json<AvailabilityRecord>, AppError> {
    if !payload.location.in_range() {
        return Err(AppError::Validation("location out of range".to_string()));
    }

    let record = {
        let mut record = state
            .transporters
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("transporter {} not found", id)))?;

        record.location = payload.location;
        record.accuracy_m = payload.accuracy_m;
        record.heading = payload.heading;
        record.updated_at = Utc::now();
        record.clone()
    };

    // The heartbeat response never waits on watcher delivery.
    let fan_state = state.clone();
    tokio::spawn(async move {
        fan_state
            .fanout
            .publish_location(id, payload.location, payload.accuracy_m, payload.heading);
    });

    Ok(Json(record))
}

async fn list_offers(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<Job>>, AppError> {
    Ok(Json(dispatch::open_offers(&state, id)?))
}
