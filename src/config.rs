//! Runtime configuration: a plain value snapshotted atomically on `POST
//! /config`, loaded from `PROXY_CONFIG_FILE` (default `config.json`) at
//! startup, and rewritten on SIGINT/SIGTERM. Mirrors
//! `original_source/proxy/config/config.go`.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

fn default_true() -> bool {
    true
}

/// Closed set of configuration options the control surface can inspect
/// and replace at runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub debug: bool,
    pub real_ip_header: bool,
    /// Leaf certificate lifetime in hours. Non-positive produces
    /// immediately-invalid leaves, useful for exercising expiry handling.
    pub certificate_lifetime: i64,
    pub mitm: bool,
    pub perform_delay: u64,
    pub require_approval: bool,
    #[serde(default = "default_true")]
    pub provide_request_body: bool,
    #[serde(default = "default_true")]
    pub provide_response_body: bool,
    pub get_client_process_info: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            debug: false,
            real_ip_header: false,
            certificate_lifetime: 24 * 7,
            mitm: false,
            perform_delay: 0,
            require_approval: false,
            provide_request_body: true,
            provide_response_body: true,
            get_client_process_info: false,
        }
    }
}

/// Shared, atomically-replaceable configuration handle. Readers clone the
/// snapshot they need; in-flight requests keep the snapshot they started
/// with where correctness requires stability (notably the MITM decision
/// taken at `Init`, see engine.rs).
#[derive(Clone)]
pub struct SharedConfig(Arc<RwLock<Config>>);

impl SharedConfig {
    pub fn new(config: Config) -> Self {
        Self(Arc::new(RwLock::new(config)))
    }

    pub async fn snapshot(&self) -> Config {
        self.0.read().await.clone()
    }

    pub async fn replace(&self, config: Config) {
        *self.0.write().await = config;
    }
}

pub fn config_file_path() -> PathBuf {
    std::env::var("PROXY_CONFIG_FILE")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config.json"))
}

/// Loads config from disk if present; missing/empty/unparseable files are
/// treated as "use defaults", matching `setConfigFromFile`'s forgiving
/// behavior in the original.
pub fn load_from_file(path: &PathBuf) -> Config {
    match std::fs::read_to_string(path) {
        Ok(contents) if !contents.trim().is_empty() => {
            serde_json::from_str(&contents).unwrap_or_else(|err| {
                tracing::warn!(error = %err, path = %path.display(), "failed to parse config file, using defaults");
                Config::default()
            })
        }
        Ok(_) => Config::default(),
        Err(err) => {
            tracing::warn!(error = %err, path = %path.display(), "no usable config file, using defaults");
            Config::default()
        }
    }
}

pub fn save_to_file(path: &PathBuf, config: &Config) {
    match serde_json::to_vec_pretty(config) {
        Ok(data) => {
            if let Err(err) = std::fs::write(path, data) {
                tracing::error!(error = %err, path = %path.display(), "failed to save config file");
            }
        }
        Err(err) => tracing::error!(error = %err, "failed to marshal config"),
    }
}

/// Installs a SIGINT/SIGTERM handler that snapshots the config to disk
/// before the process exits. Mirrors `config.go`'s `saveConfigFile`.
pub fn spawn_signal_save_task(config: SharedConfig, path: PathBuf) {
    tokio::spawn(async move {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(s) => s,
            Err(err) => {
                tracing::error!(error = %err, "failed to install SIGTERM handler");
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
        tracing::info!("received shutdown signal, saving config file");
        let snapshot = config.snapshot().await;
        save_to_file(&path, &snapshot);
        std::process::exit(0);
    });
}
