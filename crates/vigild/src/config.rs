use std::path::PathBuf;
use std::time::Duration;
use vigil_camera::WorkerConfig;
use vigil_core::EngineConfig;

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Directory for unknown-face snapshots.
    pub snapshot_dir: PathBuf,
    /// Cosine similarity threshold for a positive identification.
    pub similarity_threshold: f32,
    /// Minutes without a re-match before an open attendance record is
    /// closed.
    pub absence_timeout_mins: u64,
    /// Seconds before the identity cache is considered stale.
    pub cache_staleness_secs: u64,
    /// Per-source frame rate ceiling.
    pub frame_fps: u32,
    /// Requested capture resolution for local devices.
    pub frame_width: u32,
    pub frame_height: u32,
    /// Consecutive failed reads before a source is reconnected.
    pub failure_threshold: u32,
}

impl Config {
    /// Load configuration from `VIGIL_*` environment variables with
    /// defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("vigil");

        let db_path = std::env::var("VIGIL_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("attendance.db"));

        let snapshot_dir = std::env::var("VIGIL_SNAPSHOT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("unknown_snapshots"));

        Self {
            db_path,
            snapshot_dir,
            similarity_threshold: env_f32("VIGIL_SIMILARITY_THRESHOLD", 0.6),
            absence_timeout_mins: env_u64("VIGIL_ABSENCE_TIMEOUT_MINS", 10),
            cache_staleness_secs: env_u64("VIGIL_CACHE_STALENESS_SECS", 30),
            frame_fps: env_u32("VIGIL_FRAME_FPS", 15),
            frame_width: env_u32("VIGIL_FRAME_WIDTH", 640),
            frame_height: env_u32("VIGIL_FRAME_HEIGHT", 480),
            failure_threshold: env_u32("VIGIL_FAILURE_THRESHOLD", 20),
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            similarity_threshold: self.similarity_threshold,
            absence_timeout: Duration::from_secs(self.absence_timeout_mins * 60),
            cache_staleness: Duration::from_secs(self.cache_staleness_secs),
            snapshot_dir: self.snapshot_dir.clone(),
        }
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            frame_interval: Duration::from_millis(1000 / u64::from(self.frame_fps.max(1))),
            failure_threshold: self.failure_threshold,
            ..WorkerConfig::default()
        }
    }
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
