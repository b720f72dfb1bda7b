//! Runtime settings, layered from an optional TOML file and `MILKSCAN_*`
//! environment variables (`__` separates nested keys, e.g.
//! `MILKSCAN_AUTH__API_KEY`).

use crate::config::MAX_CONTENT_LENGTH;
use crate::inference::{LabelSet, TensorLayout};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::PathBuf;

/// Config file read when no path is given
pub const DEFAULT_CONFIG_FILE: &str = "milkscan.toml";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub models: ModelSettings,
    pub pool: PoolSettings,
    pub auth: AuthSettings,
    pub labels: LabelSet,
    pub log: LogSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Largest accepted request body in bytes
    pub max_content_length: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        ServerSettings {
            host: "0.0.0.0".into(),
            port: 7860,
            max_content_length: MAX_CONTENT_LENGTH,
        }
    }
}

/// Where one model file comes from
#[derive(Debug, Clone, Deserialize)]
pub struct ModelSource {
    /// Local file, preferred when it exists
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Model hub repository, e.g. `user/model`
    pub repo_id: String,
    pub file_name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    pub segmentation: ModelSource,
    pub classifier: ModelSource,
    /// Defaults to the platform cache directory
    pub cache_dir: Option<PathBuf>,
    /// ONNX sessions per model; each can run one inference at a time
    pub sessions_per_model: usize,
    pub intra_threads: Option<usize>,
    pub input_layout: TensorLayout,
}

impl Default for ModelSettings {
    fn default() -> Self {
        ModelSettings {
            segmentation: ModelSource {
                path: Some(PathBuf::from("models/u2net.onnx")),
                repo_id: "iamSubha16/background_removal_model".into(),
                file_name: "u2net.onnx".into(),
            },
            classifier: ModelSource {
                path: Some(PathBuf::from(
                    "models/milk_adulterant_detector_model_v7.onnx",
                )),
                repo_id: "iamSubha16/milk_adulterant_detector_model_v7".into(),
                file_name: "milk_adulterant_detector_model_v7.onnx".into(),
            },
            cache_dir: None,
            sessions_per_model: 1,
            intra_threads: None,
            input_layout: TensorLayout::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Concurrent pipeline runs
    pub workers: usize,
    /// Requests allowed to wait for a worker before new ones are rejected
    pub queue_capacity: usize,
}

impl Default for PoolSettings {
    fn default() -> Self {
        PoolSettings {
            workers: std::thread::available_parallelism()
                .map(usize::from)
                .unwrap_or(2),
            queue_capacity: 32,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    /// Web API key of the identity provider project
    pub api_key: Option<String>,
    /// Token lookup endpoint
    pub verify_url: String,
    /// Base64 cookie key of at least 64 bytes; random when unset
    pub secret_key: Option<String>,
    pub session_hours: i64,
    /// Mark the session cookie `Secure` (enable behind HTTPS)
    pub secure_cookies: bool,
}

impl Default for AuthSettings {
    fn default() -> Self {
        AuthSettings {
            api_key: None,
            verify_url: "https://identitytoolkit.googleapis.com/v1/accounts:lookup".into(),
            secret_key: None,
            session_hours: 24,
            secure_cookies: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub filter: String,
}

impl Default for LogSettings {
    fn default() -> Self {
        LogSettings {
            filter: "info".into(),
        }
    }
}

impl Settings {
    /// Read `path` (if it exists) and then the environment
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let mut settings: Settings = Config::builder()
            .add_source(File::with_name(path).required(false))
            .add_source(
                Environment::with_prefix("MILKSCAN")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;

        // hosting platforms hand the port over in `PORT`
        if let Some(port) = std::env::var("PORT").ok().and_then(|p| p.parse().ok()) {
            settings.server.port = port;
        }
        Ok(settings)
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
