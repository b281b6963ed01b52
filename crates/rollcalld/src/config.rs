use crate::pipeline::PunchPolicy;
use rollcall_core::{LivenessConfig, MatcherConfig};
use rollcall_hw::SourceOptions;
use rollcall_ledger::LedgerConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid setting {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Daemon configuration: defaults, then the optional TOML file, then
/// `ROLLCALL_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    pub data_dir: PathBuf,
    /// Enrolled embeddings (default: `<data_dir>/embeddings.json`).
    pub gallery_path: PathBuf,
    /// Attendance database (default: `<data_dir>/attendance.db`).
    pub db_path: PathBuf,
    pub ear_threshold: f32,
    pub match_threshold: f32,
    pub duplicate_threshold: f32,
    pub cooldown_secs: u64,
    /// Local hour at which automatic punches switch from in to out.
    pub punch_boundary_hour: u32,
    pub auto_mode: bool,
    pub manual_mode: bool,
    /// Processing cadence of the engine loop.
    pub frame_interval_ms: u64,
    pub open_timeout_ms: u64,
    pub retry_backoff_ms: u64,
    /// Serve on the system bus instead of the session bus.
    pub system_bus: bool,
}

/// On-disk form; every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    camera_device: Option<String>,
    model_dir: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    gallery_path: Option<PathBuf>,
    db_path: Option<PathBuf>,
    ear_threshold: Option<f32>,
    match_threshold: Option<f32>,
    duplicate_threshold: Option<f32>,
    cooldown_secs: Option<u64>,
    punch_boundary_hour: Option<u32>,
    auto_mode: Option<bool>,
    manual_mode: Option<bool>,
    frame_interval_ms: Option<u64>,
    open_timeout_ms: Option<u64>,
    retry_backoff_ms: Option<u64>,
    system_bus: Option<bool>,
}

impl Config {
    /// Load from `$ROLLCALL_CONFIG` (or the XDG config file, if present)
    /// and the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(|key: &str| std::env::var(key).ok())
    }

    /// [`Config::load`] with an explicit environment lookup.
    pub fn load_from(env: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let file = match config_file_path(&env) {
            Some(path) => Some(read_file(&path)?),
            None => None,
        };
        let config = Self::from_sources(file.unwrap_or_default(), env)?;
        Ok(config)
    }

    fn from_sources(
        file: FileConfig,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let data_dir = env("ROLLCALL_DATA_DIR")
            .map(PathBuf::from)
            .or(file.data_dir)
            .unwrap_or_else(|| default_data_dir(&env));
        let model_dir = env("ROLLCALL_MODEL_DIR")
            .map(PathBuf::from)
            .or(file.model_dir)
            .unwrap_or_else(|| PathBuf::from("/usr/share/rollcall/models"));
        let gallery_path = env("ROLLCALL_GALLERY_PATH")
            .map(PathBuf::from)
            .or(file.gallery_path)
            .unwrap_or_else(|| data_dir.join("embeddings.json"));
        let db_path = env("ROLLCALL_DB_PATH")
            .map(PathBuf::from)
            .or(file.db_path)
            .unwrap_or_else(|| data_dir.join("attendance.db"));

        let config = Self {
            camera_device: env("ROLLCALL_CAMERA_DEVICE")
                .or(file.camera_device)
                .unwrap_or_else(|| "/dev/video0".to_string()),
            model_dir,
            data_dir,
            gallery_path,
            db_path,
            ear_threshold: parsed(&env, "ROLLCALL_EAR_THRESHOLD", file.ear_threshold, 0.25),
            match_threshold: parsed(&env, "ROLLCALL_MATCH_THRESHOLD", file.match_threshold, 0.5),
            duplicate_threshold: parsed(
                &env,
                "ROLLCALL_DUPLICATE_THRESHOLD",
                file.duplicate_threshold,
                0.5,
            ),
            cooldown_secs: parsed(&env, "ROLLCALL_COOLDOWN_SECS", file.cooldown_secs, 60),
            punch_boundary_hour: parsed(
                &env,
                "ROLLCALL_PUNCH_BOUNDARY_HOUR",
                file.punch_boundary_hour,
                14,
            ),
            auto_mode: flag(&env, "ROLLCALL_AUTO_MODE", file.auto_mode, true),
            manual_mode: flag(&env, "ROLLCALL_MANUAL_MODE", file.manual_mode, true),
            frame_interval_ms: parsed(&env, "ROLLCALL_FRAME_INTERVAL_MS", file.frame_interval_ms, 33),
            open_timeout_ms: parsed(&env, "ROLLCALL_OPEN_TIMEOUT_MS", file.open_timeout_ms, 3000),
            retry_backoff_ms: parsed(&env, "ROLLCALL_RETRY_BACKOFF_MS", file.retry_backoff_ms, 10),
            system_bus: flag(&env, "ROLLCALL_SYSTEM_BUS", file.system_bus, false),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.punch_boundary_hour > 24 {
            return Err(ConfigError::Invalid {
                key: "punch_boundary_hour",
                reason: format!("{} is not an hour of the day", self.punch_boundary_hour),
            });
        }
        for (key, value) in [
            ("ear_threshold", self.ear_threshold),
            ("match_threshold", self.match_threshold),
            ("duplicate_threshold", self.duplicate_threshold),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(ConfigError::Invalid {
                    key,
                    reason: format!("{value} must be a positive number"),
                });
            }
        }
        Ok(())
    }

    /// Path to the SCRFD detection model.
    pub fn detector_model_path(&self) -> String {
        self.model_path("det_10g.onnx")
    }

    /// Path to the face embedding model.
    pub fn embedder_model_path(&self) -> String {
        self.model_path("face_embedder.onnx")
    }

    /// Path to the 468-point face mesh model.
    pub fn mesh_model_path(&self) -> String {
        self.model_path("face_mesh.onnx")
    }

    fn model_path(&self, file: &str) -> String {
        self.model_dir.join(file).to_string_lossy().into_owned()
    }

    pub fn liveness_config(&self) -> LivenessConfig {
        LivenessConfig {
            ear_threshold: self.ear_threshold,
            ..LivenessConfig::default()
        }
    }

    pub fn matcher_config(&self) -> MatcherConfig {
        MatcherConfig {
            match_threshold: self.match_threshold,
            duplicate_threshold: self.duplicate_threshold,
        }
    }

    pub fn ledger_config(&self) -> LedgerConfig {
        LedgerConfig {
            cooldown: Duration::from_secs(self.cooldown_secs),
        }
    }

    pub fn punch_policy(&self) -> PunchPolicy {
        PunchPolicy {
            boundary_hour: self.punch_boundary_hour,
        }
    }

    pub fn source_options(&self) -> SourceOptions {
        SourceOptions {
            open_timeout: Duration::from_millis(self.open_timeout_ms),
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
        }
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }
}

fn config_file_path(env: &impl Fn(&str) -> Option<String>) -> Option<PathBuf> {
    if let Some(explicit) = env("ROLLCALL_CONFIG") {
        return Some(PathBuf::from(explicit));
    }
    let base = env("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| env("HOME").map(|h| PathBuf::from(h).join(".config")))?;
    let path = base.join("rollcall/rollcall.toml");
    path.exists().then_some(path)
}

fn read_file(path: &Path) -> Result<FileConfig, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let file = toml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    tracing::info!(path = %path.display(), "config file loaded");
    Ok(file)
}

fn default_data_dir(env: &impl Fn(&str) -> Option<String>) -> PathBuf {
    env("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            let home = env("HOME").unwrap_or_else(|| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall")
}

/// Environment beats file beats default. Unparseable env values are ignored.
fn parsed<T: std::str::FromStr>(
    env: &impl Fn(&str) -> Option<String>,
    key: &str,
    file: Option<T>,
    default: T,
) -> T {
    match env(key).map(|v| v.parse::<T>()) {
        Some(Ok(v)) => v,
        Some(Err(_)) => {
            tracing::warn!(key, "ignoring unparseable environment override");
            file.unwrap_or(default)
        }
        None => file.unwrap_or(default),
    }
}

fn flag(env: &impl Fn(&str) -> Option<String>, key: &str, file: Option<bool>, default: bool) -> bool {
    env(key).map(|v| v != "0").or(file).unwrap_or(default)
}
