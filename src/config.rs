use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Environment variable overriding the config file location
pub const CONFIG_ENV: &str = "FOOTFALL_CONFIG";

const MAX_CONFLICT_RETRIES: u32 = 32;
/// One day
const MAX_IDLE_EVICTION_SECONDS: u64 = 86_400;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{field} must be {expected}, got {value}")]
    OutOfRange {
        field: &'static str,
        expected: &'static str,
        value: String,
    },
    #[error("database.postgresql_url is required for the postgresql backend")]
    MissingPostgresUrl,
    #[error("this build has no PostgreSQL support (enable the `postgres` feature)")]
    PostgresUnavailable,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub identity: IdentityConfig,

    #[serde(default)]
    pub buffer: BufferConfig,

    #[serde(default)]
    pub detection: DetectionConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub embedder: EmbedderConfig,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    #[default]
    Sqlite,
    Postgresql,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub backend: DatabaseType,

    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: PathBuf,

    /// e.g. "host=localhost user=footfall dbname=footfall"
    #[serde(default)]
    pub postgresql_url: Option<String>,

    #[serde(default)]
    pub pool_size: Option<u32>,
}

fn default_sqlite_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("footfall")
        .join("footfall.db")
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: DatabaseType::default(),
            sqlite_path: default_sqlite_path(),
            postgresql_url: None,
            pool_size: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Minimum cosine similarity for two embeddings to be the same person
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,

    /// Longest gap between sightings that still continues a visit
    #[serde(default = "default_reentry_window_minutes")]
    pub reentry_window_minutes: u32,

    #[serde(default = "default_max_conflict_retries")]
    pub max_conflict_retries: u32,
}

fn default_similarity_threshold() -> f32 {
    crate::identity::matcher::DEFAULT_SIMILARITY_THRESHOLD
}

fn default_reentry_window_minutes() -> u32 {
    crate::identity::session::DEFAULT_REENTRY_WINDOW_MINUTES
}

fn default_max_conflict_retries() -> u32 {
    3
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: default_similarity_threshold(),
            reentry_window_minutes: default_reentry_window_minutes(),
            max_conflict_retries: default_max_conflict_retries(),
        }
    }
}

impl IdentityConfig {
    pub fn reentry_window(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.reentry_window_minutes))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferConfig {
    /// How long a track is watched before its best sample is emitted
    #[serde(default = "default_observe_seconds")]
    pub observe_seconds: f64,

    /// Tracks not updated for this long are dropped from the buffer
    #[serde(default = "default_idle_eviction_seconds")]
    pub idle_eviction_seconds: u64,
}

fn default_observe_seconds() -> f64 {
    crate::identity::buffer::DEFAULT_OBSERVE_SECONDS
}

fn default_idle_eviction_seconds() -> u64 {
    300
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            observe_seconds: default_observe_seconds(),
            idle_eviction_seconds: default_idle_eviction_seconds(),
        }
    }
}

impl BufferConfig {
    pub fn observe_window(&self) -> chrono::Duration {
        chrono::Duration::milliseconds((self.observe_seconds * 1000.0).round() as i64)
    }

    pub fn idle_eviction(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.idle_eviction_seconds as i64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// Detections below this tracker confidence never reach the extractor
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f32,
}

fn default_min_confidence() -> f32 {
    0.35
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            min_confidence: default_min_confidence(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_extract_timeout_ms")]
    pub extract_timeout_ms: u64,

    #[serde(default = "default_resolve_timeout_ms")]
    pub resolve_timeout_ms: u64,
}

fn default_extract_timeout_ms() -> u64 {
    2_000
}

fn default_resolve_timeout_ms() -> u64 {
    5_000
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            extract_timeout_ms: default_extract_timeout_ms(),
            resolve_timeout_ms: default_resolve_timeout_ms(),
        }
    }
}

impl PipelineConfig {
    pub fn extract_timeout(&self) -> Duration {
        Duration::from_millis(self.extract_timeout_ms)
    }

    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_millis(self.resolve_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbedderConfig {
    /// UltraFace RFB-320 detection model
    #[serde(default = "default_detection_model")]
    pub detection_model: PathBuf,

    /// ArcFace embedding model (512-dim output)
    #[serde(default = "default_embedding_model")]
    pub embedding_model: PathBuf,

    #[serde(default = "default_intra_threads")]
    pub intra_threads: usize,
}

fn models_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from(".local/share"))
        .join("footfall/models")
}

fn default_detection_model() -> PathBuf {
    models_dir().join("ultraface-320.onnx")
}

fn default_embedding_model() -> PathBuf {
    models_dir().join("arcface-resnet100.onnx")
}

fn default_intra_threads() -> usize {
    4
}

impl Default for EmbedderConfig {
    fn default() -> Self {
        Self {
            detection_model: default_detection_model(),
            embedding_model: default_embedding_model(),
            intra_threads: default_intra_threads(),
        }
    }
}

impl Config {
    /// Load from `path`, `$FOOTFALL_CONFIG`, or the default location.
    ///
    /// A default config file is written when none exists yet.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(path) => path.to_path_buf(),
            None => Self::config_path(),
        };

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)
                .with_context(|| format!("reading {}", config_path.display()))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("parsing {}", config_path.display()))?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(&config_path)?;
            Ok(config)
        }
    }

    pub fn save_to(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(config_path, content)?;

        Ok(())
    }

    pub fn config_path() -> PathBuf {
        if let Some(path) = std::env::var_os(CONFIG_ENV) {
            return PathBuf::from(path);
        }
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("footfall")
            .join("config.toml")
    }

    /// Reject settings the resolver cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let threshold = self.identity.similarity_threshold;
        if !threshold.is_finite() || !(-1.0..=1.0).contains(&threshold) {
            return Err(out_of_range("identity.similarity_threshold", "within [-1, 1]", threshold));
        }
        if self.identity.reentry_window_minutes == 0 {
            return Err(out_of_range("identity.reentry_window_minutes", "positive", 0));
        }
        if self.identity.max_conflict_retries > MAX_CONFLICT_RETRIES {
            return Err(out_of_range(
                "identity.max_conflict_retries",
                "at most 32",
                self.identity.max_conflict_retries,
            ));
        }

        let observe = self.buffer.observe_seconds;
        if !observe.is_finite() || observe < 0.0 {
            return Err(out_of_range("buffer.observe_seconds", "a non-negative number", observe));
        }
        if self.buffer.idle_eviction_seconds > MAX_IDLE_EVICTION_SECONDS {
            return Err(out_of_range(
                "buffer.idle_eviction_seconds",
                "at most 86400",
                self.buffer.idle_eviction_seconds,
            ));
        }
        if (self.buffer.idle_eviction_seconds as f64) < observe {
            return Err(out_of_range(
                "buffer.idle_eviction_seconds",
                "at least buffer.observe_seconds",
                self.buffer.idle_eviction_seconds,
            ));
        }

        let confidence = self.detection.min_confidence;
        if !confidence.is_finite() || !(0.0..=1.0).contains(&confidence) {
            return Err(out_of_range("detection.min_confidence", "within [0, 1]", confidence));
        }

        if self.pipeline.extract_timeout_ms == 0 {
            return Err(out_of_range("pipeline.extract_timeout_ms", "positive", 0));
        }
        if self.pipeline.resolve_timeout_ms == 0 {
            return Err(out_of_range("pipeline.resolve_timeout_ms", "positive", 0));
        }
        if self.embedder.intra_threads == 0 {
            return Err(out_of_range("embedder.intra_threads", "positive", 0));
        }

        if self.database.backend == DatabaseType::Postgresql {
            if !cfg!(feature = "postgres") {
                return Err(ConfigError::PostgresUnavailable);
            }
            if self.database.postgresql_url.is_none() {
                return Err(ConfigError::MissingPostgresUrl);
            }
        }
        if self.database.pool_size == Some(0) {
            return Err(out_of_range("database.pool_size", "positive", 0));
        }

        Ok(())
    }
}

fn out_of_range(field: &'static str, expected: &'static str, value: impl ToString) -> ConfigError {
    ConfigError::OutOfRange {
        field,
        expected,
        value: value.to_string(),
    }
}
