//! Named interfaces for the collaborators the engine treats as out of
//! scope: source probing and encoder argument synthesis (§6).

use std::path::Path;

use async_trait::async_trait;

use crate::error::EngineError;

/// Source metadata captured once, at supervisor creation.
#[derive(Debug, Clone)]
pub struct ProbeInfo {
    pub width: u32,
    pub height: u32,
    pub duration_secs: f64,
    pub frame_rate: f64,
    pub codec_name: String,
    pub bit_rate: u64,
    pub rotation: i32,
}

/// Probes a source file for the metadata the supervisor and ladder
/// construction need. Implemented by shelling out to ffprobe in `server`;
/// the engine only ever calls the trait.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, source_path: &Path) -> Result<ProbeInfo, EngineError>;
}

/// Synthesizes encoder argv for a given start position and output target.
///
/// `output_pattern` is either an HLS segment filename pattern (when
/// `is_hls` is true) or `pipe:1` for the full-video passthrough encoder.
/// One instance is bound to a single (source, quality) pair — ladder
/// construction (picking which qualities exist and their target
/// resolution/bitrate) happens before an `ArgvBuilder` is built, not
/// inside it.
pub trait ArgvBuilder: Send + Sync {
    fn build_args(&self, start_second: f64, output_pattern: &str, is_hls: bool) -> Vec<String>;
}

/// Builds the `ArgvBuilder` for one quality rung of one source. A
/// StreamSupervisor calls this once per quality, lazily, the first time
/// that quality is requested.
pub trait ArgvBuilderFactory: Send + Sync {
    fn build_for(&self, source_path: &Path, quality: &str) -> std::sync::Arc<dyn ArgvBuilder>;
}
