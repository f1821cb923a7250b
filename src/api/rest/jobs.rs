use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::dispatch::{self, DispatchTicket};
use crate::error::AppError;
use crate::models::job::{Actor, Job, JobStatus, Package, Place, Priority};
use crate::models::transporter::GeoPoint;
use crate::pricing::{self, PriceBreakdown, ServiceCategory};
use crate::state::AppState;
use crate::store::{AdvanceContext, Advanced, NewJob};

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/quotes", post(create_quote))
        .route("/jobs", post(create_job))
        .route("/jobs/:id", get(get_job))
        .route("/jobs/:id/accept", post(accept_job))
        .route("/jobs/:id/advance", post(advance_job))
        .route("/jobs/:id/cancel", post(cancel_job))
}

#[derive(Deserialize)]
pub struct QuoteRequest {
    pub category: ServiceCategory,
    pub pickup: GeoPoint,
    pub dropoff: GeoPoint,
    pub weight_kg: f64,
    #[serde(default)]
    pub add_ons: Vec<String>,
}

#[derive(Serialize)]
pub struct QuoteResponse {
    pub category: ServiceCategory,
    pub distance_km: f64,
    pub estimated_duration_min: u32,
    pub price: PriceBreakdown,
    pub currency: String,
}

#[derive(Deserialize)]
pub struct CreateJobRequest {
    pub customer_id: Uuid,
    pub category: ServiceCategory,
    #[serde(default)]
    pub priority: Priority,
    pub pickup: Place,
    pub dropoff: Place,
    pub package: Package,
    #[serde(default)]
    pub add_ons: Vec<String>,
    pub scheduled_pickup: Option<DateTime<Utc>>,
    /// Total shown at quote time; booking fails if the recomputed price has
    /// drifted beyond the configured tolerance.
    pub quoted_total: Option<f64>,
}

#[derive(Deserialize)]
pub struct AcceptRequest {
    pub transporter_id: Uuid,
}

#[derive(Deserialize)]
pub struct AdvanceRequest {
    pub transporter_id: Uuid,
    pub status: JobStatus,
    pub note: Option<String>,
    pub location: Option<GeoPoint>,
}

#[derive(Deserialize)]
pub struct CancelRequest {
    pub customer_id: Uuid,
    pub note: Option<String>,
}

async fn create_quote(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<QuoteRequest>,
) -> Result<Json<QuoteResponse>, AppError> {
    let distance_km = pricing::validate_shipment(
        payload.category,
        &payload.pickup,
        &payload.dropoff,
        payload.weight_kg,
    )?;
    let price = pricing::quote(
        distance_km,
        payload.weight_kg,
        payload.category,
        &payload.add_ons,
    );

    Ok(Json(QuoteResponse {
        category: payload.category,
        distance_km,
        estimated_duration_min: pricing::estimate_duration_min(distance_km, payload.category),
        price,
        currency: state.config.currency.clone(),
    }))
}

async fn create_job(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateJobRequest>,
) -> Result<Json<Job>, AppError> {
    let job = state.store.create(
        NewJob {
            customer_id: payload.customer_id,
            category: payload.category,
            priority: payload.priority,
            pickup: payload.pickup,
            dropoff: payload.dropoff,
            package: payload.package,
            add_ons: payload.add_ons,
            scheduled_pickup: payload.scheduled_pickup,
            quoted_total: payload.quoted_total,
        },
        state.config.price_tolerance,
        &state.config.currency,
    )?;

    state.fanout.open_channel(job.id);
    state.fanout.subscribe(job.customer_id, job.id);
    // No other writer can reach a job this new: its id only leaves through
    // the response and the dispatch queue below.
    state.fanout.publish_status(&job);
    dispatch::enqueue_dispatch(&state, DispatchTicket::first(job.id)).await?;

    state
        .metrics
        .jobs_created_total
        .with_label_values(&[job.category.as_str()])
        .inc();

    Ok(Json(job))
}

async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Job>, AppError> {
    Ok(Json(state.store.get(id)?))
}

async fn accept_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<AcceptRequest>,
) -> Result<Json<Job>, AppError> {
    let job = dispatch::accept_job(&state, id, payload.transporter_id).await?;
    Ok(Json(job))
}

async fn advance_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<AdvanceRequest>,
) -> Result<Json<Job>, AppError> {
    let advanced = state.store.advance(
        id,
        payload.status,
        Actor::Transporter(payload.transporter_id),
        AdvanceContext {
            note: payload.note,
            location: payload.location,
        },
        |job| {
            state.fanout.publish_status(job);
        },
    )?;

    finish_transition(&state, &advanced);
    Ok(Json(advanced.job))
}

async fn cancel_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<CancelRequest>,
) -> Result<Json<Job>, AppError> {
    let advanced = state.store.advance(
        id,
        JobStatus::Cancelled,
        Actor::Customer(payload.customer_id),
        AdvanceContext {
            note: payload.note,
            location: None,
        },
        |job| {
            state.fanout.publish_status(job);
        },
    )?;

    finish_transition(&state, &advanced);
    Ok(Json(advanced.job))
}

/// Post-transition bookkeeping shared by advance and cancel: free the
/// transporter's slot, send the push notices, tear the channel down on
/// terminal states. The status event itself already went out under the
/// store guard, ahead of the teardown here.
fn finish_transition(state: &AppState, advanced: &Advanced) {
    if let Some(transporter_id) = advanced.released_transporter {
        if let Some(mut record) = state.transporters.get_mut(&transporter_id) {
            record.active_jobs = record.active_jobs.saturating_sub(1);
            record.updated_at = Utc::now();
        }

        if advanced.job.status == JobStatus::Cancelled {
            let push = state.push.clone();
            let body = format!("{} was cancelled by the customer", advanced.job.reference);
            tokio::spawn(async move {
                push.notify(transporter_id, "Job cancelled", &body).await;
            });
        }
    }

    if advanced.job.status == JobStatus::Delivered {
        let push = state.push.clone();
        let customer_id = advanced.job.customer_id;
        let body = format!("{} has been delivered", advanced.job.reference);
        tokio::spawn(async move {
            push.notify(customer_id, "Delivered", &body).await;
        });
    }

    if advanced.job.status.is_terminal() {
        state.fanout.close_job(advanced.job.id);
    }
}
