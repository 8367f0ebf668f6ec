//! Daemon configuration.
//!
//! Defaults, overlaid by an optional TOML file (`ROLLCALL_CONFIG`), overlaid
//! by `ROLLCALL_*` environment variables. Every recognition threshold in
//! the pipeline is adjustable per deployment.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use rollcall_core::liveness::LivenessConfig;
use rollcall_core::quality::{QualityConfigError, QualityWeights};
use rollcall_core::types::MatchThresholds;
use rollcall_core::DetectorSelector;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("unknown detector selector '{0}' (expected accurate, fast or classical)")]
    BadSelector(String),
    #[error(transparent)]
    Quality(#[from] QualityConfigError),
}

pub struct Config {
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Detection model selection (accuracy vs. speed, or forced classical).
    pub detector: DetectorSelector,
    /// Distance and confidence gates for a positive match.
    pub thresholds: MatchThresholds,
    pub quality_weights: QualityWeights,
    /// Minimum overall quality for a recognition frame.
    pub quality_min_recognize: f32,
    /// Minimum overall quality for an enrollment photo.
    pub quality_min_enroll: f32,
    pub liveness: LivenessConfig,
    /// Number of rows in the dashboard recent-activity feed.
    pub recent_feed_size: usize,
    /// Run on the session bus (development mode).
    pub session_bus: bool,
}

/// Optional file overrides; anything absent keeps its default.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    model_dir: Option<PathBuf>,
    db_path: Option<PathBuf>,
    detector: Option<String>,
    distance_threshold: Option<f32>,
    confidence_threshold: Option<f32>,
    quality_min_recognize: Option<f32>,
    quality_min_enroll: Option<f32>,
    recent_feed_size: Option<usize>,
    quality_weights: Option<FileQualityWeights>,
    liveness: Option<FileLiveness>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileQualityWeights {
    sharpness: f32,
    brightness: f32,
    size: f32,
    contrast: f32,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileLiveness {
    enabled: Option<bool>,
    min_skin_ratio: Option<f32>,
    min_texture_variance: Option<f32>,
    min_edge_density: Option<f32>,
    max_edge_density: Option<f32>,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rollcall");

        Self {
            model_dir: PathBuf::from("/usr/share/rollcall/models"),
            db_path: data_dir.join("attendance.db"),
            detector: DetectorSelector::Accurate,
            thresholds: MatchThresholds::default(),
            quality_weights: QualityWeights::default(),
            quality_min_recognize: 0.5,
            quality_min_enroll: 0.6,
            liveness: LivenessConfig::default(),
            recent_feed_size: 10,
            session_bus: false,
        }
    }
}

impl Config {
    /// Resolve the effective configuration: defaults ← file ← environment.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        let file_path = std::env::var("ROLLCALL_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/etc/rollcall/config.toml"));
        if file_path.exists() {
            config.apply_file(&file_path)?;
        }

        config.apply_env();
        config.quality_weights.validate()?;
        Ok(config)
    }

    fn apply_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let file: FileConfig = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        if let Some(v) = file.model_dir {
            self.model_dir = v;
        }
        if let Some(v) = file.db_path {
            self.db_path = v;
        }
        if let Some(v) = file.detector {
            self.detector =
                DetectorSelector::parse(&v).ok_or(ConfigError::BadSelector(v))?;
        }
        if let Some(v) = file.distance_threshold {
            self.thresholds.distance = v;
        }
        if let Some(v) = file.confidence_threshold {
            self.thresholds.confidence = v;
        }
        if let Some(v) = file.quality_min_recognize {
            self.quality_min_recognize = v;
        }
        if let Some(v) = file.quality_min_enroll {
            self.quality_min_enroll = v;
        }
        if let Some(v) = file.recent_feed_size {
            self.recent_feed_size = v;
        }
        if let Some(w) = file.quality_weights {
            self.quality_weights = QualityWeights {
                sharpness: w.sharpness,
                brightness: w.brightness,
                size: w.size,
                contrast: w.contrast,
            };
        }
        if let Some(l) = file.liveness {
            if let Some(v) = l.enabled {
                self.liveness.enabled = v;
            }
            if let Some(v) = l.min_skin_ratio {
                self.liveness.min_skin_ratio = v;
            }
            if let Some(v) = l.min_texture_variance {
                self.liveness.min_texture_variance = v;
            }
            if let Some(v) = l.min_edge_density {
                self.liveness.min_edge_density = v;
            }
            if let Some(v) = l.max_edge_density {
                self.liveness.max_edge_density = v;
            }
        }
        Ok(())
    }

    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("ROLLCALL_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("ROLLCALL_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("ROLLCALL_DETECTOR") {
            if let Some(selector) = DetectorSelector::parse(&v) {
                self.detector = selector;
            } else {
                tracing::warn!(value = %v, "ignoring unknown ROLLCALL_DETECTOR");
            }
        }
        self.thresholds.distance = env_f32("ROLLCALL_DISTANCE_THRESHOLD", self.thresholds.distance);
        self.thresholds.confidence =
            env_f32("ROLLCALL_CONFIDENCE_THRESHOLD", self.thresholds.confidence);
        self.quality_min_recognize =
            env_f32("ROLLCALL_QUALITY_MIN", self.quality_min_recognize);
        self.quality_min_enroll = env_f32("ROLLCALL_QUALITY_MIN_ENROLL", self.quality_min_enroll);
        self.liveness.enabled = std::env::var("ROLLCALL_LIVENESS_ENABLED")
            .map(|v| v != "0")
            .unwrap_or(self.liveness.enabled);
        self.liveness.min_skin_ratio =
            env_f32("ROLLCALL_LIVENESS_MIN_SKIN_RATIO", self.liveness.min_skin_ratio);
        self.liveness.min_texture_variance = env_f32(
            "ROLLCALL_LIVENESS_MIN_TEXTURE_VARIANCE",
            self.liveness.min_texture_variance,
        );
        self.recent_feed_size = env_usize("ROLLCALL_RECENT_FEED_SIZE", self.recent_feed_size);
        self.session_bus = std::env::var("ROLLCALL_SESSION_BUS").is_ok() || self.session_bus;
    }
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.quality_weights.validate().unwrap();
        assert_eq!(config.detector, DetectorSelector::Accurate);
        assert!((config.thresholds.distance - 0.4).abs() < 1e-6);
        assert!((config.thresholds.confidence - 0.85).abs() < 1e-6);
        assert!(config.liveness.enabled);
    }

    #[test]
    fn file_overlay_applies_partial_overrides() {
        let dir = std::env::temp_dir().join(format!("rollcall-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(
            &path,
            r#"
detector = "classical"
distance_threshold = 0.35

[liveness]
enabled = false
"#,
        )
        .unwrap();

        let mut config = Config::default();
        config.apply_file(&path).unwrap();
        assert_eq!(config.detector, DetectorSelector::Classical);
        assert!((config.thresholds.distance - 0.35).abs() < 1e-6);
        assert!(!config.liveness.enabled);
        // Untouched values keep their defaults.
        assert!((config.thresholds.confidence - 0.85).abs() < 1e-6);
        assert!((config.liveness.min_skin_ratio - 0.3).abs() < 1e-6);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn unknown_detector_in_file_is_an_error() {
        let dir = std::env::temp_dir().join(format!("rollcall-config-bad-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(&path, "detector = \"cnn\"\n").unwrap();

        let mut config = Config::default();
        let err = config.apply_file(&path).unwrap_err();
        assert!(matches!(err, ConfigError::BadSelector(_)));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn unknown_keys_in_file_are_rejected() {
        let dir = std::env::temp_dir().join(format!("rollcall-config-keys-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(&path, "tolernace = 0.6\n").unwrap();

        let mut config = Config::default();
        assert!(matches!(
            config.apply_file(&path).unwrap_err(),
            ConfigError::Parse { .. }
        ));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
