//! StreamSupervisor: the per-source collection of Streams (§4.5).

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::process::Child;
use tokio::sync::Notify;
use tracing::info;

use crate::collaborators::{ArgvBuilderFactory, ProbeInfo};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::store::SegmentStore;
use crate::stream::Stream;

/// What `ServeFullVideo` hands back: either a file to stream as-is, or a
/// live one-shot encoder whose stdout is the response body (§4.4.6).
pub enum FullVideoResponse {
    Passthrough(PathBuf),
    Transcoded(Child),
}

struct SupervisorInner {
    source_id: String,
    source_path: PathBuf,
    probe: ProbeInfo,
    store: SegmentStore,
    config: EngineConfig,
    binary_path: String,
    argv_builder_factory: Arc<dyn ArgvBuilderFactory>,
    compatible_codec: String,
    ladder: Vec<String>,
    streams: DashMap<String, Stream>,
    idle_ticks: AtomicU64,
    close: Notify,
}

#[derive(Clone)]
pub struct StreamSupervisor(Arc<SupervisorInner>);

impl StreamSupervisor {
    /// Create a supervisor for a source. Creates the SegmentStore directory
    /// empty (§4.3) and starts the supervisor's own idle loop.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        source_id: String,
        source_path: PathBuf,
        source_root: PathBuf,
        probe: ProbeInfo,
        config: EngineConfig,
        binary_path: String,
        argv_builder_factory: Arc<dyn ArgvBuilderFactory>,
        compatible_codec: String,
        ladder: Vec<String>,
    ) -> Result<Self, EngineError> {
        let store = SegmentStore::create(source_root)?;
        let supervisor = Self(Arc::new(SupervisorInner {
            source_id,
            source_path,
            probe,
            store,
            config,
            binary_path,
            argv_builder_factory,
            compatible_codec,
            ladder,
            streams: DashMap::new(),
            idle_ticks: AtomicU64::new(0),
            close: Notify::new(),
        }));
        supervisor.spawn_idle_loop();
        Ok(supervisor)
    }

    pub fn source_id(&self) -> &str {
        &self.0.source_id
    }

    pub fn probe(&self) -> &ProbeInfo {
        &self.0.probe
    }

    /// Get the Stream for `quality`, creating and starting it on first use.
    fn stream_for(&self, quality: &str) -> Stream {
        if let Some(existing) = self.0.streams.get(quality) {
            return existing.clone();
        }
        let argv_builder = self
            .0
            .argv_builder_factory
            .build_for(&self.0.source_path, quality);
        let stream = Stream::new(
            quality.to_string(),
            self.0.store.clone(),
            self.0.config.clone(),
            self.0.binary_path.clone(),
            argv_builder,
        );
        stream.spawn_run_loop();
        self.0
            .streams
            .entry(quality.to_string())
            .or_insert(stream)
            .clone()
    }

    /// `ServeChunkFor(quality, id)`: delegate to the Stream.
    pub async fn serve_chunk_for(&self, quality: &str, id: u64) -> Result<PathBuf, EngineError> {
        self.stream_for(quality).serve_chunk(id).await
    }

    /// `ServeFullVideoFor(quality)` (§4.4.6): passthrough when the source is
    /// already the compatible codec and quality is "max"; otherwise spawn a
    /// one-shot encoder whose stdout is the response body. This encoder is
    /// independent of any Stream's `encoder` field.
    pub async fn serve_full_video_for(&self, quality: &str) -> Result<FullVideoResponse, EngineError> {
        if quality == "max" && self.0.probe.codec_name == self.0.compatible_codec {
            return Ok(FullVideoResponse::Passthrough(self.0.source_path.clone()));
        }

        let argv_builder = self
            .0
            .argv_builder_factory
            .build_for(&self.0.source_path, quality);
        let args = argv_builder.build_args(0.0, "pipe:1", false);
        let mut cmd = process_utils::tokio_command(&self.0.binary_path);
        cmd.args(&args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true);
        let child = cmd
            .spawn()
            .map_err(|err| EngineError::FatalConfig(format!("{}: {err}", self.0.binary_path)))?;
        Ok(FullVideoResponse::Transcoded(child))
    }

    /// The full quality ladder this source was built with (not just the
    /// qualities already requested), for playlist emission (out of core).
    pub fn qualities(&self) -> &[String] {
        &self.0.ladder
    }

    /// `ServeIndex` (out of core): a master playlist listing one
    /// `EXT-X-STREAM-INF` variant per ladder rung.
    pub fn serve_index(&self) -> EngineResult<String> {
        let mut body = String::from("#EXTM3U\n#EXT-X-VERSION:3\n");
        for quality in &self.0.ladder {
            body.push_str(&format!(
                "#EXT-X-STREAM-INF:BANDWIDTH={},NAME=\"{quality}\"\n{quality}.m3u8\n",
                self.0.probe.bit_rate.max(1)
            ));
        }
        Ok(body)
    }

    /// `ServeListFor(quality)` (out of core): a VOD media playlist whose
    /// segment count is `ceil(duration / D)` and whose last segment's
    /// EXTINF is the remainder, per spec.md §4.4.6.
    pub fn serve_list_for(&self, quality: &str) -> EngineResult<String> {
        if !self.0.ladder.iter().any(|q| q == quality) {
            return Err(EngineError::NotFound(quality.to_string()));
        }
        let segment_duration = self.0.config.segment_duration_secs as f64;
        let duration = self.0.probe.duration_secs.max(0.0);
        let count = (duration / segment_duration).ceil() as u64;

        let mut body = String::from("#EXTM3U\n#EXT-X-VERSION:3\n");
        body.push_str(&format!(
            "#EXT-X-TARGETDURATION:{}\n",
            segment_duration.ceil() as u64
        ));
        body.push_str("#EXT-X-PLAYLIST-TYPE:VOD\n");
        for id in 0..count {
            let remaining = duration - (id as f64) * segment_duration;
            let extinf = remaining.min(segment_duration).max(0.0);
            body.push_str(&format!("#EXTINF:{extinf:.3},\n{quality}-{id:06}.ts\n"));
        }
        body.push_str("#EXT-X-ENDLIST\n");
        Ok(body)
    }

    /// Background idle loop every tick_interval (§4.5): once every Stream
    /// has had no live encoder for T_manager, destroy.
    fn spawn_idle_loop(&self) {
        let supervisor = self.clone();
        let threshold = {
            let tick_secs = supervisor.0.config.tick_interval.as_secs().max(1);
            (supervisor.0.config.manager_idle_timeout.as_secs() / tick_secs).max(1)
        };
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(supervisor.0.config.tick_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let all_idle = {
                    let mut idle = true;
                    for entry in supervisor.0.streams.iter() {
                        if !entry.value().is_idle().await {
                            idle = false;
                            break;
                        }
                    }
                    idle
                };
                if all_idle {
                    let ticks = supervisor.0.idle_ticks.fetch_add(1, Ordering::AcqRel) + 1;
                    if ticks >= threshold {
                        supervisor.destroy();
                        break;
                    }
                } else {
                    supervisor.0.idle_ticks.store(0, Ordering::Release);
                }
            }
        });
    }

    /// Stop every Stream and remove the SegmentStore directory, then fire
    /// `closeSignal`.
    pub fn destroy(&self) {
        info!(source_id = %self.0.source_id, "destroying idle supervisor");
        for entry in self.0.streams.iter() {
            entry.value().stop();
        }
        self.0.store.destroy();
        self.0.close.notify_waiters();
    }

    /// Subscribe to this supervisor's single-fire close notification.
    pub fn on_close(&self) -> impl std::future::Future<Output = ()> + '_ {
        self.0.close.notified()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedArgvBuilder;

    impl crate::collaborators::ArgvBuilder for FixedArgvBuilder {
        fn build_args(&self, start_second: f64, output_pattern: &str, _is_hls: bool) -> Vec<String> {
            vec!["-ss".into(), start_second.to_string(), output_pattern.into()]
        }
    }

    struct FixedArgvBuilderFactory;

    impl ArgvBuilderFactory for FixedArgvBuilderFactory {
        fn build_for(&self, _source_path: &std::path::Path, _quality: &str) -> Arc<dyn crate::collaborators::ArgvBuilder> {
            Arc::new(FixedArgvBuilder)
        }
    }

    fn test_supervisor(root: PathBuf, duration_secs: f64) -> StreamSupervisor {
        StreamSupervisor::create(
            "source-1".into(),
            PathBuf::from("/tmp/source-1.mp4"),
            root,
            ProbeInfo {
                width: 1280,
                height: 720,
                duration_secs,
                frame_rate: 30.0,
                codec_name: "h264".into(),
                bit_rate: 2_000_000,
                rotation: 0,
            },
            EngineConfig::default(),
            "/bin/true".into(),
            Arc::new(FixedArgvBuilderFactory),
            "h264".into(),
            vec!["max".into()],
        )
        .unwrap()
    }

    #[test]
    fn serve_index_lists_every_ladder_rung() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = test_supervisor(dir.path().to_path_buf(), 90.0);
        let body = supervisor.serve_index().unwrap();
        assert!(body.starts_with("#EXTM3U"));
        assert!(body.contains("max.m3u8"));
    }

    #[test]
    fn serve_list_for_unknown_quality_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = test_supervisor(dir.path().to_path_buf(), 90.0);
        assert!(matches!(
            supervisor.serve_list_for("4k"),
            Err(EngineError::NotFound(_))
        ));
    }

    #[test]
    fn serve_list_for_last_segment_extinf_is_the_remainder() {
        let dir = tempfile::tempdir().unwrap();
        // 10s of source at D=3s: 3 full segments plus a 1s remainder.
        let mut config = EngineConfig::default();
        config.segment_duration_secs = 3;
        let supervisor = StreamSupervisor::create(
            "source-1".into(),
            PathBuf::from("/tmp/source-1.mp4"),
            dir.path().to_path_buf(),
            ProbeInfo {
                width: 1280,
                height: 720,
                duration_secs: 10.0,
                frame_rate: 30.0,
                codec_name: "h264".into(),
                bit_rate: 2_000_000,
                rotation: 0,
            },
            config,
            "/bin/true".into(),
            Arc::new(FixedArgvBuilderFactory),
            "h264".into(),
            vec!["max".into()],
        )
        .unwrap();

        let body = supervisor.serve_list_for("max").unwrap();
        assert!(body.contains("#EXT-X-ENDLIST"));
        assert!(body.contains("max-000003.ts"));
        assert!(body.contains("#EXTINF:1.000,\nmax-000003.ts"));
    }

    #[test]
    fn serve_list_for_emits_a_parseable_media_playlist() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = test_supervisor(dir.path().to_path_buf(), 10.0);
        let body = supervisor.serve_list_for("max").unwrap();
        let parsed = m3u8_rs::parse_media_playlist(body.as_bytes());
        assert!(parsed.is_ok(), "generated media playlist failed to parse: {body}");
    }
}
