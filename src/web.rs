//! HTTP + WebSocket delivery layer (§6): thin `axum` handlers over the
//! Query Service, Validator, and Broadcast Manager. Content negotiation is
//! JSON by default; `Accept: application/x-protobuf` gets the same
//! `bincode`-framed body used for broadcast batches.

use anyhow::Result;
use axum::{
    Json, Router,
    body::Body,
    extract::{
        Path, Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderMap, Request, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::CorsLayer;
use tracing::{error, info};
use uuid::Uuid;

use crate::auth::{AuthenticatedUser, OperatorUser, TokenVerifier};
use crate::broadcast::BroadcastManager;
use crate::decoder::AirTracking;
use crate::error::QueryError;
use crate::geo::Bounds;
use crate::model::{AircraftKind, DeviceId, Position};
use crate::orchestrator::Orchestrator;
use crate::protocol;
use crate::query::{KindFilters, QueryService};

#[derive(Clone)]
pub struct AppState {
    pub query_service: Arc<QueryService>,
    pub orchestrator: Arc<Orchestrator>,
    pub broadcast: Arc<BroadcastManager>,
    pub token_verifier: Arc<dyn TokenVerifier>,
}

/// Render `value` as JSON, or as a `bincode` frame when the caller's
/// `Accept` header names `application/x-protobuf` (§6).
fn respond<T: Serialize>(headers: &HeaderMap, value: &T) -> Response {
    let wants_binary = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("application/x-protobuf"))
        .unwrap_or(false);

    if wants_binary {
        match protocol::encode(value) {
            Ok(bytes) => ([(header::CONTENT_TYPE, "application/x-protobuf")], bytes).into_response(),
            Err(err) => QueryError::Marshal(err.to_string()).into_response(),
        }
    } else {
        Json(value).into_response()
    }
}

fn parse_bounds(raw: &str) -> Result<Bounds, QueryError> {
    let parts: Vec<&str> = raw.split(',').collect();
    let [sw_lat, sw_lon, ne_lat, ne_lon] = parts.as_slice() else {
        return Err(QueryError::InvalidBounds);
    };
    let parse = |s: &str| s.parse::<f64>().map_err(|_| QueryError::InvalidBounds);
    let sw = Position::new(parse(sw_lat)?, parse(sw_lon)?).ok_or(QueryError::InvalidBounds)?;
    let ne = Position::new(parse(ne_lat)?, parse(ne_lon)?).ok_or(QueryError::InvalidBounds)?;
    Bounds::new(sw, ne).map_err(|_| QueryError::InvalidBounds)
}

fn parse_kind_filters(types: Option<&str>, default: KindFilters) -> KindFilters {
    let Some(types) = types else { return default };
    let mut filters = KindFilters::default();
    for kind in types.split(',') {
        match kind.trim() {
            "pilots" => filters.pilots = true,
            "stations" => filters.stations = true,
            "thermals" => filters.thermals = true,
            "ground_objects" => filters.ground_objects = true,
            _ => {}
        }
    }
    filters
}

#[derive(Debug, Deserialize)]
pub struct SnapshotQuery {
    lat: f64,
    lon: f64,
    radius: f64,
    #[serde(default)]
    pilots: Option<bool>,
    #[serde(default)]
    stations: Option<bool>,
    #[serde(default)]
    thermals: Option<bool>,
    #[serde(default)]
    ground_objects: Option<bool>,
}

async fn snapshot(State(state): State<AppState>, headers: HeaderMap, Query(q): Query<SnapshotQuery>) -> Response {
    let center = match Position::new(q.lat, q.lon) {
        Some(p) => p,
        None => return QueryError::InvalidLatitude.into_response(),
    };
    let filters = KindFilters {
        pilots: q.pilots.unwrap_or(true),
        stations: q.stations.unwrap_or(true),
        thermals: q.thermals.unwrap_or(true),
        ground_objects: q.ground_objects.unwrap_or(true),
    };

    match state.query_service.snapshot(center, q.radius, filters).await {
        Ok(snapshot) => respond(&headers, &snapshot),
        Err(err) => err.into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct BoundsQuery {
    bounds: String,
    #[serde(default)]
    types: Option<String>,
}

async fn pilots(State(state): State<AppState>, headers: HeaderMap, Query(q): Query<BoundsQuery>) -> Response {
    let bounds = match parse_bounds(&q.bounds) {
        Ok(b) => b,
        Err(err) => return err.into_response(),
    };
    let filters = parse_kind_filters(q.types.as_deref(), KindFilters {
        pilots: true,
        ..Default::default()
    });
    respond(&headers, &state.query_service.by_bounds(bounds, filters))
}

#[derive(Debug, Deserialize)]
pub struct ThermalsQuery {
    bounds: String,
    #[serde(default)]
    min_quality: Option<u8>,
}

async fn thermals(State(state): State<AppState>, headers: HeaderMap, Query(q): Query<ThermalsQuery>) -> Response {
    let bounds = match parse_bounds(&q.bounds) {
        Ok(b) => b,
        Err(err) => return err.into_response(),
    };
    let mut results = state.query_service.by_bounds(bounds, KindFilters {
        thermals: true,
        ..Default::default()
    });
    if let Some(min_quality) = q.min_quality {
        results.retain(|obj| matches!(obj, crate::model::LiveObject::Thermal(t) if t.quality >= min_quality));
    }
    respond(&headers, &results)
}

async fn stations(State(state): State<AppState>, headers: HeaderMap, Query(q): Query<BoundsQuery>) -> Response {
    let bounds = match parse_bounds(&q.bounds) {
        Ok(b) => b,
        Err(err) => return err.into_response(),
    };
    let results = state.query_service.by_bounds(bounds, KindFilters {
        stations: true,
        ..Default::default()
    });
    respond(&headers, &results)
}

#[derive(Debug, Deserialize)]
pub struct TrackQuery {
    #[serde(default = "default_hours")]
    hours: u32,
    #[serde(default, rename = "filter-level")]
    filter_level: Option<u8>,
    #[serde(default)]
    format: Option<String>,
}

fn default_hours() -> u32 {
    12
}

async fn track(State(state): State<AppState>, headers: HeaderMap, Path(addr): Path<String>, Query(q): Query<TrackQuery>) -> Response {
    let device_id: DeviceId = match addr.parse() {
        Ok(id) => id,
        Err(_) => return QueryError::InvalidAddrFormat.into_response(),
    };
    let level = q.filter_level.unwrap_or(2);
    match state.query_service.track(device_id, q.hours, level).await {
        Ok(track) => match q.format.as_deref() {
            None | Some("json") => respond(&headers, &track),
            Some("geojson") => Json(crate::track_filter::to_geojson(&track)).into_response(),
            Some(_) => QueryError::InvalidFormat.into_response(),
        },
        Err(err) => err.into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct PositionRequest {
    pub lat: f64,
    pub lon: f64,
    pub altitude_m: f64,
    pub speed_kmh: f64,
    pub climb_ms: f64,
    pub heading_deg: f64,
}

async fn submit_position(State(state): State<AppState>, AuthenticatedUser(claims): AuthenticatedUser, Json(body): Json<PositionRequest>) -> Response {
    let Ok(device_id): Result<DeviceId, _> = claims.sub.parse() else {
        return QueryError::InvalidAddrFormat.into_response();
    };
    if Position::new(body.lat, body.lon).is_none() {
        return QueryError::InvalidLatitude.into_response();
    }

    state
        .orchestrator
        .submit_position(device_id, AirTracking {
            lat: body.lat,
            lon: body.lon,
            altitude_m: body.altitude_m,
            track_online: true,
            aircraft: AircraftKind::Unknown,
            speed_kmh: body.speed_kmh,
            climb_ms: body.climb_ms,
            heading_deg: body.heading_deg,
        })
        .await;

    StatusCode::ACCEPTED.into_response()
}

async fn invalidate(State(state): State<AppState>, _operator: OperatorUser, Path(device_id): Path<String>) -> Response {
    let device_id: DeviceId = match device_id.parse() {
        Ok(id) => id,
        Err(_) => return QueryError::InvalidAddrFormat.into_response(),
    };
    state.orchestrator.validator().invalidate(device_id);
    state.orchestrator.spatial_index().remove(device_id);
    StatusCode::NO_CONTENT.into_response()
}

async fn validation_state(State(state): State<AppState>, Path(device_id): Path<String>) -> Response {
    let device_id: DeviceId = match device_id.parse() {
        Ok(id) => id,
        Err(_) => return QueryError::InvalidAddrFormat.into_response(),
    };
    match state.orchestrator.validator().state_snapshot(device_id) {
        Some(snapshot) => Json(snapshot).into_response(),
        None => QueryError::TrackNotFound.into_response(),
    }
}

#[derive(Debug, Serialize)]
struct ValidationMetrics {
    admitted_devices: usize,
    tracked_devices: usize,
    parse_error_count: u64,
    by_kind: Vec<crate::validator::KindMetrics>,
}

async fn validation_metrics(State(state): State<AppState>) -> Response {
    let validator = state.orchestrator.validator();
    let (admitted, total) = validator.admission_counts();
    Json(ValidationMetrics {
        admitted_devices: admitted,
        tracked_devices: total,
        parse_error_count: state.orchestrator.parse_error_count(),
        by_kind: validator.kind_metrics(),
    })
    .into_response()
}

#[derive(Debug, Serialize)]
struct HealthStatus {
    status: &'static str,
    hot_cache: bool,
    history: bool,
}

async fn health(State(state): State<AppState>) -> Response {
    let report = state.orchestrator.health_check().await;
    let status = if report.hot_cache && report.history { "ok" } else { "degraded" };
    let code = if status == "ok" { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (
        code,
        Json(HealthStatus {
            status,
            hot_cache: report.hot_cache,
            history: report.history,
        }),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    lat: f64,
    lon: f64,
    radius: f64,
}

/// WebSocket fan-out (§4.H): not part of the named REST surface in §6, but
/// the transport the Broadcast Manager exists to drive. One subscription
/// per connection; batches forwarded as JSON text frames.
async fn stream(ws: WebSocketUpgrade, State(state): State<AppState>, Query(q): Query<StreamQuery>) -> Response {
    let Some(center) = Position::new(q.lat, q.lon) else {
        return QueryError::InvalidLatitude.into_response();
    };
    ws.on_upgrade(move |socket| handle_stream(socket, state, center, q.radius))
}

async fn handle_stream(mut socket: WebSocket, state: AppState, center: Position, radius_km: f64) {
    let (client_id, rx) = state.broadcast.subscribe(center, radius_km);

    loop {
        tokio::select! {
            batch = rx.recv_async() => {
                let Ok(batch) = batch else { break };
                let Ok(json) = serde_json::to_string(&*batch) else { continue };
                if socket.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => state.broadcast.touch(client_id),
                    Some(Err(_)) => break,
                }
            }
        }
    }

    state.broadcast.unsubscribe(client_id);
}

fn format_query_params(query_string: &str) -> String {
    if query_string.is_empty() {
        return String::new();
    }
    format!(" {}", query_string.replace('&', " "))
}

async fn request_logging_middleware(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let query = format_query_params(request.uri().query().unwrap_or(""));
    let request_id = Uuid::new_v4().to_string()[..8].to_string();
    let start = Instant::now();

    info!("started {} {} [{}{}]", method, path, request_id, query);
    let response = next.run(request).await;
    info!(
        "completed {} {} [{}{}] {} in {:.2}ms",
        method,
        path,
        request_id,
        query,
        response.status().as_u16(),
        start.elapsed().as_secs_f64() * 1000.0
    );
    response
}

async fn sentry_error_middleware(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let response = next.run(request).await;

    if response.status().is_server_error() {
        let status = response.status();
        error!("http {} error on {} {}", status.as_u16(), method, uri);
        sentry::configure_scope(|scope| {
            scope.set_tag("http.method", method.as_str());
            scope.set_tag("http.url", uri.to_string());
            scope.set_tag("http.status_code", status.as_u16().to_string());
        });
        sentry::capture_message(&format!("http {} error on {} {}", status.as_u16(), method, uri), sentry::Level::Error);
    }

    response
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/snapshot", get(snapshot))
        .route("/api/v1/pilots", get(pilots))
        .route("/api/v1/thermals", get(thermals))
        .route("/api/v1/stations", get(stations))
        .route("/api/v1/track/{addr}", get(track))
        .route("/api/v1/position", post(submit_position))
        .route("/api/v1/invalidate/{deviceId}", post(invalidate))
        .route("/api/v1/validation/{deviceId}", get(validation_state))
        .route("/api/v1/validation/metrics", get(validation_metrics))
        .route("/api/v1/stream", get(stream))
        .route("/health", get(health))
        .with_state(state)
        .layer(middleware::from_fn(request_logging_middleware))
        .layer(middleware::from_fn(sentry_error_middleware))
        .layer(CorsLayer::permissive())
}

pub async fn start_web_server(interface: String, port: u16, state: AppState) -> Result<()> {
    sentry::configure_scope(|scope| {
        scope.set_tag("operation", "web-server");
    });
    info!("starting web server on {}:{}", interface, port);

    let app = router(state);
    let listener = tokio::net::TcpListener::bind(format!("{interface}:{port}")).await?;
    info!("web server listening on http://{}:{}", interface, port);
    axum::serve(listener, app).await?;
    Ok(())
}
