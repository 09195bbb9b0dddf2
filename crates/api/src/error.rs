//! API error types

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use venuelens_billing::{BillingError, PaywallError, Usage};

use crate::transform::TransformError;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Authentication required")]
    AuthenticationRequired { free_view: Usage },

    #[error("Credit limit reached")]
    LimitReached { usage: Usage, upgrade_url: String },

    #[error("Usage tracking temporarily unavailable")]
    Unavailable(String),

    #[error("Invalid webhook signature")]
    InvalidSignature,

    #[error("{0}")]
    BadRequest(String),

    #[error("Transformation failed: {0}")]
    Upstream(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::AuthenticationRequired { .. } => StatusCode::UNAUTHORIZED,
            ApiError::LimitReached { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::InvalidSignature | ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ApiError::AuthenticationRequired { .. } => "authentication_required",
            ApiError::LimitReached { .. } => "limit_reached",
            ApiError::Unavailable(_) => "usage_unavailable",
            ApiError::InvalidSignature => "invalid_signature",
            ApiError::BadRequest(_) => "invalid_request",
            ApiError::Upstream(_) => "transformation_failed",
            ApiError::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        let message = match &self {
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "Internal server error");
                "Internal server error".to_string()
            }
            ApiError::Unavailable(msg) => {
                tracing::warn!(error = %msg, "Counter store unavailable");
                self.to_string()
            }
            other => other.to_string(),
        };

        let mut body = json!({
            "error": self.kind(),
            "message": message,
            "code": status.as_u16()
        });

        let extra: Option<Value> = match &self {
            ApiError::AuthenticationRequired { free_view } => Some(json!({ "usage": free_view })),
            ApiError::LimitReached { usage, upgrade_url } => Some(json!({
                "usage": usage,
                "upgrade_url": upgrade_url
            })),
            ApiError::Unavailable(_) => Some(json!({ "retryable": true })),
            _ => None,
        };
        if let (Some(Value::Object(extra)), Value::Object(map)) = (extra, &mut body) {
            map.extend(extra);
        }

        (status, Json(body)).into_response()
    }
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::AuthenticationRequired => ApiError::AuthenticationRequired {
                free_view: Usage::free_view(),
            },
            BillingError::CounterStoreUnavailable(msg) => ApiError::Unavailable(msg),
            BillingError::WebhookSignatureInvalid => ApiError::InvalidSignature,
            BillingError::WebhookMalformed(msg) => {
                ApiError::BadRequest(format!("Malformed event: {}", msg))
            }
            BillingError::InvalidInput(msg) => ApiError::BadRequest(msg),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

/// Failure inside the paywalled transformation
#[derive(Debug, thiserror::Error)]
pub enum TransformationFailure {
    #[error("{requested} themes requested, the {tier} plan allows {allowed}")]
    TooManyThemes {
        requested: usize,
        allowed: usize,
        tier: String,
    },

    #[error(transparent)]
    Remote(#[from] TransformError),
}

impl From<PaywallError<TransformationFailure>> for ApiError {
    fn from(err: PaywallError<TransformationFailure>) -> Self {
        match err {
            PaywallError::AuthenticationRequired { free_view } => {
                ApiError::AuthenticationRequired { free_view }
            }
            PaywallError::LimitReached { usage, upgrade_url } => {
                ApiError::LimitReached { usage, upgrade_url }
            }
            PaywallError::Unavailable(msg) => ApiError::Unavailable(msg),
            PaywallError::Billing(e) => e.into(),
            PaywallError::Operation(failure @ TransformationFailure::TooManyThemes { .. }) => {
                ApiError::BadRequest(failure.to_string())
            }
            PaywallError::Operation(TransformationFailure::Remote(e)) => {
                ApiError::Upstream(e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use venuelens_shared::Tier;

    async fn body_json(err: ApiError) -> (StatusCode, Value) {
        let response = err.into_response();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_limit_reached_body() {
        let usage = Usage::compute(50, 50, Tier::Pro);
        let (status, body) = body_json(ApiError::LimitReached {
            usage,
            upgrade_url: "/pricing".into(),
        })
        .await;

        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["error"], "limit_reached");
        assert_eq!(body["code"], 429);
        assert_eq!(body["usage"]["remaining"], 0);
        assert_eq!(body["upgrade_url"], "/pricing");
    }

    #[tokio::test]
    async fn test_internal_error_hides_detail() {
        let (status, body) = body_json(ApiError::Internal("pool timed out".into())).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["message"], "Internal server error");
    }

    #[test]
    fn test_billing_error_mapping() {
        assert!(matches!(
            ApiError::from(BillingError::CounterStoreUnavailable("down".into())),
            ApiError::Unavailable(_)
        ));
        assert!(matches!(
            ApiError::from(BillingError::WebhookSignatureInvalid),
            ApiError::InvalidSignature
        ));
        assert!(matches!(
            ApiError::from(BillingError::Provider("boom".into())),
            ApiError::Internal(_)
        ));
    }
}
