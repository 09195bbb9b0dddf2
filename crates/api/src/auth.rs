//! Bearer-token identity extraction
//!
//! Tokens are HS256 JWTs whose `sub` claim is the user UUID. Metered
//! endpoints accept anonymous callers and answer them with the free view,
//! so authentication is optional here and enforced by the paywall.

use std::convert::Infallible;

use axum::{
    extract::{FromRequestParts, Request, State},
    http::{header::AUTHORIZATION, request::Parts},
    middleware::Next,
    response::Response,
};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Invalid or expired token")]
    InvalidToken,
    #[error("Token subject is not a user id")]
    InvalidSubject,
}

/// Validates bearer tokens
#[derive(Clone)]
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    pub fn validate(&self, token: &str) -> Result<Uuid, AuthError> {
        let data = decode::<Claims>(token, &self.key, &self.validation)
            .map_err(|_| AuthError::InvalidToken)?;
        Uuid::parse_str(&data.claims.sub).map_err(|_| AuthError::InvalidSubject)
    }
}

/// Authenticated caller, inserted into request extensions
#[derive(Debug, Clone, Copy)]
pub struct AuthUser {
    pub user_id: Uuid,
}

fn extract_bearer_token(request: &Request) -> Option<&str> {
    request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|header| header.strip_prefix("Bearer "))
}

/// Middleware that optionally authenticates. An invalid token is treated
/// as anonymous.
pub async fn optional_auth(
    State(verifier): State<JwtVerifier>,
    mut request: Request,
    next: Next,
) -> Response {
    let auth_user = match extract_bearer_token(&request) {
        Some(token) => match verifier.validate(token) {
            Ok(user_id) => Some(AuthUser { user_id }),
            Err(err) => {
                tracing::debug!(
                    path = %request.uri().path(),
                    error = %err,
                    "optional_auth: token rejected, continuing anonymously"
                );
                None
            }
        },
        None => None,
    };

    if let Some(auth_user) = auth_user {
        request.extensions_mut().insert(auth_user);
    }
    next.run(request).await
}

/// The caller's user id, if authenticated
#[derive(Debug, Clone, Copy)]
pub struct MaybeUser(pub Option<Uuid>);

impl<S> FromRequestParts<S> for MaybeUser
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(MaybeUser(
            parts.extensions.get::<AuthUser>().map(|user| user.user_id),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, get_current_timestamp, EncodingKey, Header};

    fn token(secret: &str, sub: &str, exp: u64) -> String {
        encode(
            &Header::default(),
            &Claims {
                sub: sub.to_string(),
                exp,
            },
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn test_valid_token_yields_user() {
        let user = Uuid::new_v4();
        let verifier = JwtVerifier::new("secret");
        let t = token("secret", &user.to_string(), get_current_timestamp() + 3600);
        assert_eq!(verifier.validate(&t).unwrap(), user);
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let verifier = JwtVerifier::new("secret");
        let t = token("other", &Uuid::new_v4().to_string(), get_current_timestamp() + 3600);
        assert!(matches!(verifier.validate(&t), Err(AuthError::InvalidToken)));
    }

    #[test]
    fn test_expired_token_rejected() {
        let verifier = JwtVerifier::new("secret");
        let t = token("secret", &Uuid::new_v4().to_string(), get_current_timestamp() - 3600);
        assert!(matches!(verifier.validate(&t), Err(AuthError::InvalidToken)));
    }

    #[test]
    fn test_non_uuid_subject_rejected() {
        let verifier = JwtVerifier::new("secret");
        let t = token("secret", "alice", get_current_timestamp() + 3600);
        assert!(matches!(
            verifier.validate(&t),
            Err(AuthError::InvalidSubject)
        ));
    }
}
