//! Auth Port (ambient stack): the core depends only on the `TokenVerifier`
//! trait. The default adapter verifies HS256 JWTs, following the claims
//! shape and extractor pattern of the teacher's original JWT auth.

use axum::{
    RequestPartsExt,
    extract::FromRequestParts,
    http::{StatusCode, request::Parts},
    response::{IntoResponse, Response},
};
use axum_extra::{
    TypedHeader,
    headers::{Authorization, authorization::Bearer},
};
use chrono::{Duration, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::web::AppState;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    pub sub: String,
    pub operator: bool,
    pub exp: i64,
    pub iat: i64,
}

impl Claims {
    pub fn new(subject: &str, operator: bool, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            sub: subject.to_string(),
            operator,
            exp: (now + ttl).timestamp(),
            iat: now.timestamp(),
        }
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing authorization token")]
    MissingToken,
    #[error("invalid token")]
    InvalidToken,
    #[error("auth configuration error")]
    Configuration,
    #[error("insufficient permissions")]
    InsufficientPermissions,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = match self {
            AuthError::MissingToken | AuthError::InvalidToken => StatusCode::UNAUTHORIZED,
            AuthError::InsufficientPermissions => StatusCode::FORBIDDEN,
            AuthError::Configuration => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let payload = crate::error::ErrorPayload {
            code: "auth_required",
            message: self.to_string(),
        };
        (status, axum::Json(payload)).into_response()
    }
}

/// Port the web layer depends on: anything that can turn a bearer token into
/// verified claims. Lets delivery-layer tests stub verification without a
/// real signing key.
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<Claims, AuthError>;
}

pub struct JwtVerifier {
    decoding_key: DecodingKey,
    encoding_key: EncodingKey,
}

impl JwtVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_ref()),
            encoding_key: EncodingKey::from_secret(secret.as_ref()),
        }
    }

    pub fn from_env() -> Result<Self, AuthError> {
        let secret = std::env::var("JWT_SECRET").map_err(|_| AuthError::Configuration)?;
        Ok(Self::new(&secret))
    }

    pub fn issue(&self, subject: &str, operator: bool) -> Result<String, AuthError> {
        let claims = Claims::new(subject, operator, Duration::seconds(crate::model::ttl::AUTH_TOKEN_SECS));
        encode(&Header::default(), &claims, &self.encoding_key).map_err(|_| AuthError::Configuration)
    }
}

impl TokenVerifier for JwtVerifier {
    fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        decode::<Claims>(token, &self.decoding_key, &Validation::default())
            .map(|data| data.claims)
            .map_err(|_| AuthError::InvalidToken)
    }
}

/// An authenticated caller, extracted for any endpoint requiring a bearer
/// token (`POST /api/v1/position`).
#[derive(Debug, Clone)]
pub struct AuthenticatedUser(pub Claims);

impl FromRequestParts<AppState> for AuthenticatedUser {
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let TypedHeader(Authorization(bearer)) = parts
            .extract::<TypedHeader<Authorization<Bearer>>>()
            .await
            .map_err(|_| AuthError::MissingToken)?;
        let claims = state.token_verifier.verify(bearer.token())?;
        Ok(AuthenticatedUser(claims))
    }
}

/// An authenticated operator, required for `POST /api/v1/invalidate/{deviceId}`.
#[derive(Debug, Clone)]
pub struct OperatorUser(pub Claims);

impl FromRequestParts<AppState> for OperatorUser {
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let AuthenticatedUser(claims) = AuthenticatedUser::from_request_parts(parts, state).await?;
        if !claims.operator {
            return Err(AuthError::InsufficientPermissions);
        }
        Ok(OperatorUser(claims))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_token_round_trips_through_verify() {
        let verifier = JwtVerifier::new("test-secret");
        let token = verifier.issue("pilot-42", false).unwrap();
        let claims = verifier.verify(&token).unwrap();
        assert_eq!(claims.sub, "pilot-42");
        assert!(!claims.operator);
    }

    #[test]
    fn operator_flag_is_carried_through_claims() {
        let verifier = JwtVerifier::new("test-secret");
        let token = verifier.issue("ops-1", true).unwrap();
        let claims = verifier.verify(&token).unwrap();
        assert!(claims.operator);
    }
}
