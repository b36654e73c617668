//! Environment-driven configuration loading.
//!
//! Policy (what these values mean to the state machine) lives in
//! `engine::EngineConfig`; this module only parses env vars into that shape,
//! the way `ConfigService` used to load settings from the database — minus
//! the database.

use std::path::PathBuf;
use std::time::Duration;

use engine::EngineConfig;

use crate::error::{Error, Result};

/// Process-wide configuration, loaded once at startup from the environment
/// (with `.env` support via `dotenvy`, see `main.rs`).
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Directory holding the source video files routes resolve `source_id`
    /// against.
    pub source_root: PathBuf,
    /// Root directory under which each source gets its own SegmentStore.
    pub store_root: PathBuf,
    /// Path or name of the ffmpeg binary to launch.
    pub ffmpeg_binary: String,
    /// Path or name of the ffprobe binary to launch.
    pub ffprobe_binary: String,
    /// Codec name ServeFullVideo treats as eligible for passthrough.
    pub compatible_codec: String,
    pub engine: EngineConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let source_root = env_path("SOURCE_ROOT", "sources");
        let store_root = env_path("STORE_ROOT", "tmp/transcode");
        let ffmpeg_binary = env_string("FFMPEG_BINARY", "ffmpeg");
        let ffprobe_binary = env_string("FFPROBE_BINARY", "ffprobe");
        let compatible_codec = env_string("COMPATIBLE_CODEC", "h264");

        let mut engine = EngineConfig::default();
        if let Some(v) = env_u64("SEGMENT_DURATION_SECS") {
            engine.segment_duration_secs = v;
        }
        if let Some(v) = env_u64("GOAL_MIN") {
            engine.goal_min = v;
        }
        if let Some(v) = env_u64("GOAL_MAX") {
            engine.goal_max = v;
        }
        if let Some(v) = env_u64("LOOK_BEHIND") {
            engine.look_behind = v;
        }
        if let Some(v) = env_u64("WAIT_TIMEOUT_SECS") {
            engine.wait_timeout = Duration::from_secs(v);
        }
        if let Some(v) = env_u64("IDLE_TIMEOUT_SECS") {
            engine.idle_timeout = Duration::from_secs(v);
        }
        if let Some(v) = env_u64("MANAGER_IDLE_TIMEOUT_SECS") {
            engine.manager_idle_timeout = Duration::from_secs(v);
        }

        if engine.goal_max > engine::config::GOAL_MAX_CAP {
            return Err(Error::config(format!(
                "GOAL_MAX {} exceeds the auto-scaling cap of {}",
                engine.goal_max,
                engine::config::GOAL_MAX_CAP
            )));
        }

        Ok(Self {
            source_root,
            store_root,
            ffmpeg_binary,
            ffprobe_binary,
            compatible_codec,
            engine,
        })
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_path(key: &str, default: &str) -> PathBuf {
    PathBuf::from(env_string(key, default))
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn goal_max_above_the_cap_is_rejected() {
        // SAFETY: this test only ever runs single-threaded within this
        // process's test harness; env var mutation here does not race other
        // tests reading the same keys.
        unsafe {
            std::env::set_var("GOAL_MAX", "999");
        }
        let result = AppConfig::from_env();
        unsafe {
            std::env::remove_var("GOAL_MAX");
        }
        assert!(result.is_err());
    }

    #[test]
    fn defaults_are_used_when_env_is_unset() {
        unsafe {
            std::env::remove_var("STORE_ROOT");
            std::env::remove_var("FFMPEG_BINARY");
        }
        let config = AppConfig::from_env().unwrap();
        assert_eq!(config.ffmpeg_binary, "ffmpeg");
        assert_eq!(config.store_root, PathBuf::from("tmp/transcode"));
    }
}
