//! Server configuration.
//!
//! Supports loading from YAML files with environment variable overrides.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Server configuration loaded from YAML with environment overrides.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Port to bind the HTTP server to.
    /// Override: `PULSECAST_BIND_PORT`
    pub bind_port: u16,

    /// Path of the SQLite database file.
    /// Override: `PULSECAST_DATABASE_PATH`
    pub database_path: PathBuf,

    /// Path or name of the encoder binary.
    /// Override: `FFMPEG_PATH`
    pub encoder_binary: PathBuf,

    /// Base RTMP ingest URL (stream key appended per session).
    /// Override: `PULSECAST_INGEST_BASE_URL`
    pub ingest_base_url: String,

    /// Directory for per-session encoder logs.
    pub log_dir: PathBuf,

    /// Directory for concat manifests (system temp dir when unset).
    pub manifest_dir: Option<PathBuf>,

    /// Audio bitrate for re-encoded output, e.g. "128k".
    pub audio_bitrate: String,

    /// Global cap on concurrently active sessions.
    /// Override: `MAX_CONCURRENT_STREAMS`
    pub max_concurrent_streams: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let defaults = pulsecast_core::Config::default();
        Self {
            bind_port: 8350,
            database_path: defaults.database_path,
            encoder_binary: defaults.encoder.binary,
            ingest_base_url: defaults.encoder.ingest_base_url,
            log_dir: defaults.encoder.log_dir,
            manifest_dir: defaults.encoder.manifest_dir,
            audio_bitrate: defaults.encoder.audio_bitrate,
            max_concurrent_streams: defaults.limits.max_concurrent_streams,
        }
    }
}

impl ServerConfig {
    /// Loads configuration from a YAML file, then applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Applies environment variable overrides to the configuration.
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("PULSECAST_BIND_PORT") {
            if let Ok(port) = val.parse() {
                self.bind_port = port;
            }
        }

        if let Ok(val) = std::env::var("PULSECAST_DATABASE_PATH") {
            self.database_path = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("FFMPEG_PATH") {
            self.encoder_binary = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("PULSECAST_INGEST_BASE_URL") {
            self.ingest_base_url = val;
        }

        if let Ok(val) = std::env::var("MAX_CONCURRENT_STREAMS") {
            if let Ok(cap) = val.parse() {
                self.max_concurrent_streams = cap;
            }
        }
    }

    /// Converts to pulsecast-core's Config type.
    pub fn to_core_config(&self) -> pulsecast_core::Config {
        pulsecast_core::Config {
            preferred_port: self.bind_port,
            database_path: self.database_path.clone(),
            encoder: pulsecast_core::EncoderSettings {
                binary: self.encoder_binary.clone(),
                ingest_base_url: self.ingest_base_url.clone(),
                log_dir: self.log_dir.clone(),
                manifest_dir: self.manifest_dir.clone(),
                audio_bitrate: self.audio_bitrate.clone(),
            },
            limits: pulsecast_core::StreamLimits {
                max_concurrent_streams: self.max_concurrent_streams,
            },
        }
    }
}
