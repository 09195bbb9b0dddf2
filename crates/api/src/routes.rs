//! HTTP routes
//!
//! - `POST /webhooks/billing` signed billing-provider events
//! - `GET /api/v1/usage` entitlement for the bearer user
//! - `POST /api/v1/transformations` paywalled image transformation
//! - `GET /health`

use axum::{
    extract::{rejection::JsonRejection, State},
    http::HeaderMap,
    middleware,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use venuelens_billing::Usage;

use crate::auth::{optional_auth, MaybeUser};
use crate::error::{ApiError, ApiResult, TransformationFailure};
use crate::state::AppState;
use crate::transform::{TransformRequest, Variant};

/// Header carrying the provider signature
pub const SIGNATURE_HEADER: &str = "stripe-signature";

pub fn create_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/usage", get(get_usage))
        .route("/transformations", post(create_transformation))
        .layer(middleware::from_fn_with_state(
            state.verifier.clone(),
            optional_auth,
        ));

    Router::new()
        .route("/health", get(health))
        .route("/webhooks/billing", post(billing_webhook))
        .nest("/api/v1", api)
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    let counter_store = if state.metering.gate.ensure_writable().is_ok() {
        "ok"
    } else {
        "degraded"
    };
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "counter_store": counter_store
    }))
}

/// Signature failures and unparseable envelopes are rejected. Everything
/// after that is acknowledged, whatever processing made of it.
async fn billing_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Json<Value>> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!("Billing webhook without signature header");
            ApiError::InvalidSignature
        })?;

    let event = state.metering.webhooks.verify_event(&body, signature)?;
    let disposition = state.metering.webhooks.handle_event(&event).await;

    tracing::info!(
        event_id = %event.id,
        event_type = %event.type_,
        disposition = disposition.label(),
        "Billing webhook processed"
    );

    Ok(Json(json!({
        "received": true,
        "disposition": disposition.label()
    })))
}

async fn get_usage(
    State(state): State<AppState>,
    MaybeUser(user_id): MaybeUser,
) -> ApiResult<Json<Usage>> {
    let Some(user_id) = user_id else {
        return Err(ApiError::AuthenticationRequired {
            free_view: Usage::free_view(),
        });
    };
    Ok(Json(state.metering.entitlements.usage(user_id).await?))
}

#[derive(Debug, Deserialize)]
pub struct TransformationRequest {
    pub image_id: String,
    pub themes: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct TransformationResponse {
    pub image_id: String,
    pub variants: Vec<Variant>,
    pub cost: i64,
    pub remaining: i64,
}

/// One credit per theme, debited only after the remote call succeeds
async fn create_transformation(
    State(state): State<AppState>,
    MaybeUser(user_id): MaybeUser,
    payload: Result<Json<TransformationRequest>, JsonRejection>,
) -> ApiResult<Json<TransformationResponse>> {
    let Some(user_id) = user_id else {
        return Err(ApiError::AuthenticationRequired {
            free_view: Usage::free_view(),
        });
    };
    let Json(payload) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;

    let themes: Vec<String> = payload
        .themes
        .into_iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();
    if themes.is_empty() {
        return Err(ApiError::BadRequest("At least one theme is required".into()));
    }
    if payload.image_id.trim().is_empty() {
        return Err(ApiError::BadRequest("image_id is required".into()));
    }

    let cost = themes.len() as i64;
    let transform = state.transform.clone();
    let image_id = payload.image_id;

    let response = state
        .metering
        .paywall
        .run(Some(user_id), cost, |usage| async move {
            let allowed = usage.tier.max_prompts_per_image();
            if themes.len() > allowed {
                return Err(TransformationFailure::TooManyThemes {
                    requested: themes.len(),
                    allowed,
                    tier: usage.tier.as_str().to_string(),
                });
            }

            let request = TransformRequest {
                user_id,
                image_id: image_id.clone(),
                themes,
            };
            let output = transform.transform(&request).await?;

            Ok(TransformationResponse {
                image_id,
                variants: output.variants,
                cost,
                remaining: (usage.remaining - cost).max(0),
            })
        })
        .await?;

    Ok(Json(response))
}
