//! Application state

use std::sync::Arc;

use venuelens_billing::MeteringService;

use crate::auth::JwtVerifier;
use crate::transform::TransformClient;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub metering: MeteringService,
    pub verifier: JwtVerifier,
    pub transform: Arc<dyn TransformClient>,
}

impl AppState {
    pub fn new(
        metering: MeteringService,
        verifier: JwtVerifier,
        transform: Arc<dyn TransformClient>,
    ) -> Self {
        Self {
            metering,
            verifier,
            transform,
        }
    }
}
