//! FANET realtime telemetry backend: ingest, validate, cache, and serve
//! live air-tracking, thermal, and weather-station positions over HTTP and
//! WebSocket.

pub mod auth;
pub mod broadcast;
pub mod bus;
pub mod config;
pub mod decoder;
pub mod error;
pub mod geo;
pub mod hot_cache;
pub mod history;
pub mod instance_lock;
pub mod log_format;
pub mod metrics;
pub mod model;
pub mod orchestrator;
pub mod protocol;
pub mod query;
pub mod schema;
pub mod spatial_index;
pub mod track_filter;
pub mod validator;
pub mod web;

pub use error::QueryError;
pub use model::{DeviceId, LiveObject, Position};
pub use orchestrator::Orchestrator;
pub use query::QueryService;
