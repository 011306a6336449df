//! Core configuration types.
//!
//! Provides [`Config`] with its nested [`EncoderSettings`] and
//! [`StreamLimits`] groups. The server binary builds this from its YAML
//! config plus environment overrides; tests build it directly.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::constants::DEFAULT_MAX_CONCURRENT_STREAMS;

/// Settings for the external encoder binary and its outputs.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct EncoderSettings {
    /// Path or name of the encoder binary (resolved via `PATH` if bare).
    pub binary: PathBuf,

    /// Base RTMP ingest URL; the per-session stream key is appended as the
    /// final path segment.
    pub ingest_base_url: String,

    /// Directory for per-session encoder logs.
    pub log_dir: PathBuf,

    /// Directory for concat manifests. `None` uses the system temp dir.
    pub manifest_dir: Option<PathBuf>,

    /// Audio bitrate for re-encoded (music playlist) output, e.g. "128k".
    pub audio_bitrate: String,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("ffmpeg"),
            ingest_base_url: "rtmp://a.rtmp.youtube.com/live2".to_string(),
            log_dir: PathBuf::from("logs/ffmpeg"),
            manifest_dir: None,
            audio_bitrate: "128k".to_string(),
        }
    }
}

impl EncoderSettings {
    /// Resolves the manifest directory, falling back to the system temp dir.
    pub fn manifest_dir(&self) -> PathBuf {
        self.manifest_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }

    /// The short process image name of the encoder binary, used to verify
    /// that a stored pid still belongs to an encoder process.
    pub fn binary_name(&self) -> String {
        self.binary
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "ffmpeg".to_string())
    }

    /// Validates the settings.
    pub fn validate(&self) -> Result<(), String> {
        if self.ingest_base_url.is_empty() {
            return Err("ingest_base_url must not be empty".to_string());
        }
        if self.ingest_base_url.ends_with('/') {
            return Err("ingest_base_url must not end with '/'".to_string());
        }
        if self.audio_bitrate.is_empty() {
            return Err("audio_bitrate must not be empty".to_string());
        }
        Ok(())
    }
}

/// Concurrency limits enforced by admission.
#[derive(Debug, Serialize, Deserialize, Clone, Copy)]
pub struct StreamLimits {
    /// Global cap on concurrently active sessions.
    pub max_concurrent_streams: usize,
}

impl Default for StreamLimits {
    fn default() -> Self {
        Self {
            max_concurrent_streams: DEFAULT_MAX_CONCURRENT_STREAMS,
        }
    }
}

impl StreamLimits {
    /// Validates the limits.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_concurrent_streams == 0 {
            return Err("max_concurrent_streams must be >= 1".to_string());
        }
        Ok(())
    }
}

/// Configuration for the Pulsecast core.
///
/// All fields have sensible defaults.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct Config {
    /// Preferred port for the HTTP/WS server (0 = auto-allocate).
    pub preferred_port: u16,

    /// Path of the SQLite database file.
    pub database_path: PathBuf,

    /// Encoder invocation settings.
    pub encoder: EncoderSettings,

    /// Concurrency limits.
    pub limits: StreamLimits,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            preferred_port: 0,
            database_path: PathBuf::from("pulsecast.db"),
            encoder: EncoderSettings::default(),
            limits: StreamLimits::default(),
        }
    }
}

impl Config {
    /// Validates the whole configuration.
    pub fn validate(&self) -> Result<(), String> {
        self.encoder.validate()?;
        self.limits.validate()?;
        Ok(())
    }
}
