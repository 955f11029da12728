use std::path::{Path, PathBuf};
use std::time::Duration;

use livegate_core::LivenessConfig;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
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
}

/// Daemon configuration: engine tuning from an optional TOML file, daemon
/// wiring from `LIVEGATE_*` environment variables.
pub struct Config {
    /// Directory of replay frames plus their `.json` annotation sidecars.
    pub frames_dir: PathBuf,
    /// JSON gallery of enrolled subject embeddings.
    pub gallery_path: PathBuf,
    /// Attendance log, one JSON record per line.
    pub attendance_log: PathBuf,
    /// Maximum embedding distance for a gallery match.
    pub match_tolerance: f32,
    /// Minimum `(1 - distance) * 100` for a match to count as known.
    pub min_match_accuracy: f32,
    /// Pause between frames; replay runs at roughly camera speed.
    pub frame_interval: Duration,
    /// Seed for challenge selection. Unset means entropy.
    pub seed: Option<u64>,
    /// Program run once per confirmation with the subject id as argument.
    pub notify_command: Option<String>,
    pub liveness: LivenessConfig,
}

impl Config {
    /// Load the engine section from `LIVEGATE_CONFIG` (if set), then apply
    /// `LIVEGATE_*` overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Same as [`Config::from_env`], reading variables through `var`.
    fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut liveness = match var("LIVEGATE_CONFIG") {
            Some(path) => load_liveness(Path::new(&path))?,
            None => LivenessConfig::default(),
        };
        if let Some(require) = env_bool(&var, "LIVEGATE_REQUIRE_LIVENESS") {
            liveness.require_liveness = require;
        }
        if let Some(strict) = env_bool(&var, "LIVEGATE_STRICT_SPOOF") {
            liveness.spoof.strict = strict;
        }

        let data_dir = var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = var("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("livegate");
        let path = |key: &str| var(key).map(PathBuf::from);

        Ok(Self {
            frames_dir: path("LIVEGATE_FRAMES_DIR").unwrap_or_else(|| data_dir.join("frames")),
            gallery_path: path("LIVEGATE_GALLERY").unwrap_or_else(|| data_dir.join("gallery.json")),
            attendance_log: path("LIVEGATE_ATTENDANCE_LOG")
                .unwrap_or_else(|| data_dir.join("attendance.jsonl")),
            match_tolerance: env_f32(&var, "LIVEGATE_MATCH_TOLERANCE", 0.6),
            min_match_accuracy: env_f32(&var, "LIVEGATE_MIN_MATCH_ACCURACY", 50.0),
            frame_interval: Duration::from_millis(env_u64(&var, "LIVEGATE_FRAME_INTERVAL_MS", 33)),
            seed: var("LIVEGATE_SEED").and_then(|v| v.parse().ok()),
            notify_command: var("LIVEGATE_NOTIFY_CMD").filter(|v| !v.is_empty()),
            liveness: liveness.validated(),
        })
    }
}

/// Parse an engine config file. Missing sections and fields take defaults.
pub fn load_liveness(path: &Path) -> Result<LivenessConfig, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_liveness(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn parse_liveness(text: &str) -> Result<LivenessConfig, toml::de::Error> {
    toml::from_str(text)
}

fn env_bool(var: impl Fn(&str) -> Option<String>, key: &str) -> Option<bool> {
    var(key).map(|v| v != "0" && !v.eq_ignore_ascii_case("false"))
}

fn env_f32(var: impl Fn(&str) -> Option<String>, key: &str, default: f32) -> f32 {
    var(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u64(var: impl Fn(&str) -> Option<String>, key: &str, default: u64) -> u64 {
    var(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}
