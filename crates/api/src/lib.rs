// API crate clippy configuration
#![allow(clippy::result_large_err)] // ApiError carries usage snapshots
// Test code patterns:
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! VenueLens API Library
//!
//! HTTP surface of the metering subsystem: the billing webhook receiver,
//! the usage endpoint and the paywalled transformation endpoint.

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;
pub mod transform;


pub use auth::{AuthUser, JwtVerifier};
pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
pub use transform::{HttpTransformClient, TransformClient};
