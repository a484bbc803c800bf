use faceid_pipeline::{ChannelConfig, GuardConfig};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("required setting {0} is not set")]
    Missing(&'static str),
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: &'static str },
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Optional TOML file named by `FACEID_CONFIG`. Environment variables win.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    gallery_path: Option<PathBuf>,
    model_dir: Option<PathBuf>,
    topic: Option<String>,
    crop_channel: Option<String>,
    response_channel: Option<String>,
    max_distance: Option<f32>,
    dedup_capacity: Option<usize>,
    dedup_ttl_secs: Option<u64>,
    batch_size: Option<usize>,
    max_receives: Option<u32>,
}

/// Daemon configuration, loaded from `FACEID_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Embedding gallery artifact (JSON).
    pub gallery_path: PathBuf,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Inbound topic the detection stage subscribes to.
    pub topic: String,
    /// Channel carrying face crops to the recognition stage.
    pub crop_channel: String,
    /// Channel receiving identification results.
    pub response_channel: String,
    /// Euclidean cutoff above which a match is reported as "unknown".
    /// Unset means the nearest gallery entry always wins.
    pub max_distance: Option<f32>,
    pub dedup_capacity: usize,
    pub dedup_ttl_secs: u64,
    /// Maximum face-crop records per recognition batch.
    pub batch_size: usize,
    /// Deliveries per message before it is dead-lettered.
    pub max_receives: u32,
}

impl Config {
    /// Load configuration from the optional file and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        let file = match std::env::var("FACEID_CONFIG") {
            Ok(path) => read_file(Path::new(&path))?,
            Err(_) => FileConfig::default(),
        };
        Self::from_sources(file, |key| std::env::var(key).ok())
    }

    fn from_sources(
        file: FileConfig,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let string = |key: &str, fallback: Option<String>| {
            env(key).filter(|v| !v.is_empty()).or(fallback)
        };

        let gallery_path = string("FACEID_GALLERY_PATH", None)
            .map(PathBuf::from)
            .or(file.gallery_path)
            .ok_or(ConfigError::Missing("FACEID_GALLERY_PATH"))?;
        let model_dir = string("FACEID_MODEL_DIR", None)
            .map(PathBuf::from)
            .or(file.model_dir)
            .unwrap_or_else(faceid_core::default_model_dir);

        let cfg = Self {
            gallery_path,
            model_dir,
            topic: string("FACEID_TOPIC", file.topic).ok_or(ConfigError::Missing("FACEID_TOPIC"))?,
            crop_channel: string("FACEID_CROP_CHANNEL", file.crop_channel)
                .ok_or(ConfigError::Missing("FACEID_CROP_CHANNEL"))?,
            response_channel: string("FACEID_RESPONSE_CHANNEL", file.response_channel)
                .ok_or(ConfigError::Missing("FACEID_RESPONSE_CHANNEL"))?,
            max_distance: parsed(&env, "FACEID_MAX_DISTANCE").or(file.max_distance),
            dedup_capacity: parsed(&env, "FACEID_DEDUP_CAPACITY")
                .or(file.dedup_capacity)
                .unwrap_or(10_000),
            dedup_ttl_secs: parsed(&env, "FACEID_DEDUP_TTL_SECS")
                .or(file.dedup_ttl_secs)
                .unwrap_or(900),
            batch_size: parsed(&env, "FACEID_BATCH_SIZE")
                .or(file.batch_size)
                .unwrap_or(10)
                .max(1),
            max_receives: parsed(&env, "FACEID_MAX_RECEIVES")
                .or(file.max_receives)
                .unwrap_or(5),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if let Some(max) = self.max_distance {
            if !max.is_finite() || max < 0.0 {
                return Err(ConfigError::Invalid {
                    key: "FACEID_MAX_DISTANCE",
                    reason: "must be a finite, non-negative distance",
                });
            }
        }
        if self.dedup_capacity == 0 {
            return Err(ConfigError::Invalid {
                key: "FACEID_DEDUP_CAPACITY",
                reason: "must be at least 1",
            });
        }
        if self.dedup_ttl_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "FACEID_DEDUP_TTL_SECS",
                reason: "must be at least 1",
            });
        }
        Ok(())
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> String {
        self.model_dir
            .join("det_10g.onnx")
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> String {
        self.model_dir
            .join("w600k_r50.onnx")
            .to_string_lossy()
            .into_owned()
    }

    pub fn channels(&self) -> ChannelConfig {
        ChannelConfig::new(&self.crop_channel, &self.response_channel)
    }

    pub fn guard_config(&self) -> GuardConfig {
        GuardConfig {
            capacity: self.dedup_capacity,
            ttl: Duration::from_secs(self.dedup_ttl_secs),
        }
    }
}

fn read_file(path: &Path) -> Result<FileConfig, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    Ok(toml::from_str(&text)?)
}

fn parsed<T: std::str::FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = env(key)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable setting");
            None
        }
    }
}
