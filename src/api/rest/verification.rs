use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::Json;
use axum::Router;
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/verification/send", post(send_code))
        .route("/verification/check", post(check_code))
}

#[derive(Deserialize)]
pub struct SendCodeRequest {
    pub phone: String,
}

#[derive(Deserialize)]
pub struct CheckCodeRequest {
    pub phone: String,
    pub code: String,
}

#[derive(Serialize)]
pub struct CheckCodeResponse {
    pub verified: bool,
}

async fn send_code(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<SendCodeRequest>,
) -> Result<StatusCode, AppError> {
    let phone = payload.phone.trim();
    if phone.is_empty() {
        return Err(AppError::Validation("phone cannot be empty".to_string()));
    }

    state.sms.send_code(phone).await?;
    Ok(StatusCode::ACCEPTED)
}

async fn check_code(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CheckCodeRequest>,
) -> Result<Json<CheckCodeResponse>, AppError> {
    let verified = state
        .sms
        .check_code(payload.phone.trim(), payload.code.trim())
        .await?;

    Ok(Json(CheckCodeResponse { verified }))
}
