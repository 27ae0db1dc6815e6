//! Layered configuration: a TOML file plus environment-variable overrides,
//! validated at startup, with an optional hot-reload watcher for the
//! tunables that can change at runtime.

use anyhow::{Context, Result};
use notify::{Event, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    pub nats_url: String,
    pub subject: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HotCacheConfig {
    pub redis_url: String,
    pub flush_threshold: usize,
    pub idle_flush_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    pub database_url: String,
    pub pool_size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastConfig {
    pub publish_channel_capacity: usize,
    pub client_queue_capacity: usize,
    pub batch_max_size: usize,
    pub batch_window_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    pub interface: String,
    pub port: u16,
    pub jwt_secret_env: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub bus: BusConfig,
    pub hot_cache: HotCacheConfig,
    pub history: HistoryConfig,
    pub broadcast: BroadcastConfig,
    pub web: WebConfig,
    pub metrics: MetricsConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bus: BusConfig {
                nats_url: "nats://127.0.0.1:4222".to_string(),
                subject: "fb.b.*.f.*".to_string(),
            },
            hot_cache: HotCacheConfig {
                redis_url: "redis://127.0.0.1:6379".to_string(),
                flush_threshold: 100,
                idle_flush_ms: 100,
            },
            history: HistoryConfig {
                database_url: "postgres://localhost/fanet".to_string(),
                pool_size: 10,
            },
            broadcast: BroadcastConfig {
                publish_channel_capacity: 1000,
                client_queue_capacity: 200,
                batch_max_size: 50,
                batch_window_ms: 100,
            },
            web: WebConfig {
                interface: "0.0.0.0".to_string(),
                port: 8080,
                jwt_secret_env: "JWT_SECRET".to_string(),
            },
            metrics: MetricsConfig { port: 9090 },
        }
    }
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(path).with_context(|| format!("reading config file {}", path.display()))?;
            toml::from_str(&raw).with_context(|| format!("parsing config file {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("FANET_NATS_URL") {
            self.bus.nats_url = url;
        }
        if let Ok(url) = std::env::var("FANET_REDIS_URL") {
            self.hot_cache.redis_url = url;
        }
        if let Ok(url) = std::env::var("DATABASE_URL") {
            self.history.database_url = url;
        }
        if let Ok(port) = std::env::var("FANET_WEB_PORT").ok().and_then(|v| v.parse().ok()) {
            self.web.port = port;
        }
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.broadcast.batch_max_size > 0, "broadcast.batch_max_size must be positive");
        anyhow::ensure!(self.hot_cache.flush_threshold > 0, "hot_cache.flush_threshold must be positive");
        anyhow::ensure!(self.history.pool_size > 0, "history.pool_size must be positive");
        Ok(())
    }
}

/// Watches `path` for changes and publishes freshly-loaded configs on a
/// `tokio::sync::watch` channel, following the debounced file-watch idiom
/// used for the ingest stream config.
pub fn spawn_config_watcher(path: PathBuf) -> Result<watch::Receiver<Arc<AppConfig>>> {
    let initial = Arc::new(AppConfig::load(&path)?);
    let (tx, rx) = watch::channel(initial);

    std::thread::spawn(move || {
        let (notify_tx, notify_rx) = std::sync::mpsc::channel::<notify::Result<Event>>();
        let mut watcher = match notify::recommended_watcher(notify_tx) {
            Ok(w) => w,
            Err(err) => {
                tracing::error!(%err, "failed to create config watcher");
                return;
            }
        };
        if let Err(err) = watcher.watch(&path, RecursiveMode::NonRecursive) {
            tracing::error!(%err, "failed to watch config file");
            return;
        }

        let mut last_reload = std::time::Instant::now();
        for event in notify_rx {
            let Ok(event) = event else { continue };
            if !matches!(event.kind, notify::EventKind::Modify(_) | notify::EventKind::Create(_)) {
                continue;
            }
            if last_reload.elapsed() < Duration::from_millis(500) {
                continue;
            }
            last_reload = std::time::Instant::now();

            match AppConfig::load(&path) {
                Ok(config) => {
                    tracing::info!("reloaded configuration from {}", path.display());
                    let _ = tx.send(Arc::new(config));
                }
                Err(err) => tracing::warn!(%err, "config reload failed, keeping previous configuration"),
            }
        }
    });

    Ok(rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(AppConfig::default().validate().is_ok());
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = AppConfig::load(Path::new("/nonexistent/fanet-config.toml")).unwrap();
        assert_eq!(config.web.port, 8080);
    }
}
