//! Billing error types

use venuelens_shared::{ConfigError, CounterError};

#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    #[error("Authentication required")]
    AuthenticationRequired,

    #[error("Counter store unavailable: {0}")]
    CounterStoreUnavailable(String),

    #[error("Invalid webhook signature")]
    WebhookSignatureInvalid,

    #[error("Malformed webhook payload: {0}")]
    WebhookMalformed(String),

    #[error("Unknown customer: {0}")]
    UnknownCustomer(String),

    #[error("Billing provider timed out after {0}s")]
    ProviderTimeout(u64),

    #[error("Billing provider error: {0}")]
    Provider(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl BillingError {
    /// Transient failures worth retrying later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BillingError::CounterStoreUnavailable(_)
                | BillingError::ProviderTimeout(_)
                | BillingError::Database(_)
        )
    }
}

impl From<CounterError> for BillingError {
    fn from(err: CounterError) -> Self {
        BillingError::CounterStoreUnavailable(err.to_string())
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(err: stripe::StripeError) -> Self {
        BillingError::Provider(err.to_string())
    }
}

impl From<ConfigError> for BillingError {
    fn from(err: ConfigError) -> Self {
        BillingError::Config(err.to_string())
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
