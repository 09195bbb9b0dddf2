//! Remote image-transformation client
//!
//! The transformation itself is opaque: one request per image, one variant
//! per theme. Any error or non-2xx reply counts as a failed operation, so the
//! caller is never debited for it.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    #[error("transformation service timed out")]
    Timeout,

    #[error("transformation service returned status {0}")]
    Status(u16),

    #[error("transformation request failed: {0}")]
    Request(String),

    #[error("invalid transformation response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for TransformError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransformError::Timeout
        } else if err.is_decode() {
            TransformError::Decode(err.to_string())
        } else {
            TransformError::Request(err.to_string())
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TransformRequest {
    pub user_id: Uuid,
    pub image_id: String,
    pub themes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variant {
    pub theme: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformOutput {
    pub variants: Vec<Variant>,
}

#[async_trait]
pub trait TransformClient: Send + Sync {
    async fn transform(&self, request: &TransformRequest)
        -> Result<TransformOutput, TransformError>;
}

/// HTTP client for the transformation service
#[derive(Clone)]
pub struct HttpTransformClient {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpTransformClient {
    pub fn new(base_url: &str, timeout_secs: u64) -> Result<Self, TransformError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/transform", base_url.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl TransformClient for HttpTransformClient {
    async fn transform(
        &self,
        request: &TransformRequest,
    ) -> Result<TransformOutput, TransformError> {
        tracing::debug!(
            user_id = %request.user_id,
            image_id = %request.image_id,
            themes = request.themes.len(),
            "Calling transformation service"
        );

        let response = self.client.post(&self.endpoint).json(request).send().await?;

        let status = response.status();
        if !status.is_success() {
            tracing::warn!(
                image_id = %request.image_id,
                status = status.as_u16(),
                "Transformation service rejected request"
            );
            return Err(TransformError::Status(status.as_u16()));
        }

        Ok(response.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_trims_trailing_slash() {
        let client = HttpTransformClient::new("http://transform.local/", 5).unwrap();
        assert_eq!(client.endpoint, "http://transform.local/transform");
    }
}
