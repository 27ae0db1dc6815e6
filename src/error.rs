//! Crate-wide HTTP error taxonomy (§6, §7): typed errors carrying a
//! machine-readable code, surfaced as `{ code, message }` JSON.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Serialize)]
pub struct ErrorPayload {
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("invalid latitude")]
    InvalidLatitude,
    #[error("invalid longitude")]
    InvalidLongitude,
    #[error("invalid radius")]
    InvalidRadius,
    #[error("invalid bounds")]
    InvalidBounds,
    #[error("invalid air types filter")]
    InvalidAirTypes,
    #[error("invalid ground types filter")]
    InvalidGroundTypes,
    #[error("invalid max age")]
    InvalidMaxAge,
    #[error("missing addr")]
    MissingAddr,
    #[error("invalid addr format")]
    InvalidAddrFormat,
    #[error("invalid format")]
    InvalidFormat,
    #[error("track not found")]
    TrackNotFound,
    #[error("track empty")]
    TrackEmpty,
    #[error("historical store unavailable")]
    HistoryUnavailable,
    #[error("internal error: {0}")]
    Internal(String),
    #[error("marshal error: {0}")]
    Marshal(String),
    #[error("authentication required")]
    AuthRequired,
}

impl QueryError {
    fn code(&self) -> &'static str {
        match self {
            Self::InvalidLatitude => "invalid_latitude",
            Self::InvalidLongitude => "invalid_longitude",
            Self::InvalidRadius => "invalid_radius",
            Self::InvalidBounds => "invalid_bounds",
            Self::InvalidAirTypes => "invalid_air_types",
            Self::InvalidGroundTypes => "invalid_ground_types",
            Self::InvalidMaxAge => "invalid_max_age",
            Self::MissingAddr => "missing_addr",
            Self::InvalidAddrFormat => "invalid_addr_format",
            Self::InvalidFormat => "invalid_format",
            Self::TrackNotFound => "track_not_found",
            Self::TrackEmpty => "track_empty",
            Self::HistoryUnavailable => "mysql_unavailable",
            Self::Internal(_) => "internal_error",
            Self::Marshal(_) => "marshal_error",
            Self::AuthRequired => "auth_required",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::TrackNotFound => StatusCode::NOT_FOUND,
            Self::HistoryUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) | Self::Marshal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::AuthRequired => StatusCode::UNAUTHORIZED,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for QueryError {
    fn into_response(self) -> Response {
        let status = self.status();
        let payload = ErrorPayload {
            code: self.code(),
            message: self.to_string(),
        };
        (status, Json(payload)).into_response()
    }
}
