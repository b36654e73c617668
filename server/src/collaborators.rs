//! Minimal concrete implementations of the engine's named collaborators
//! (§6): an ffprobe-shelling `Prober` and a ladder-free, single-rung
//! `ArgvBuilder` that always emits H.264/AAC. Ladder construction and
//! hardware-accel selection are out of scope; these exist only so the
//! binary has something to invoke.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use engine::{ArgvBuilder, ArgvBuilderFactory, EngineError, ProbeInfo, Prober};
use serde_json::Value;

/// Shells out to `ffprobe -print_format json -show_format -show_streams`
/// and picks the first video stream's metadata.
pub struct FfprobeProber {
    binary_path: String,
}

impl FfprobeProber {
    pub fn new(binary_path: impl Into<String>) -> Self {
        Self {
            binary_path: binary_path.into(),
        }
    }
}

#[async_trait]
impl Prober for FfprobeProber {
    async fn probe(&self, source_path: &Path) -> Result<ProbeInfo, EngineError> {
        let mut cmd = process_utils::tokio_command(&self.binary_path);
        cmd.args([
            "-v",
            "error",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
        ])
        .arg(source_path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null());

        let output = cmd
            .output()
            .await
            .map_err(|err| EngineError::FatalConfig(format!("{}: {err}", self.binary_path)))?;

        if !output.status.success() {
            return Err(EngineError::FatalConfig(format!(
                "{} exited with {:?} probing {}",
                self.binary_path,
                output.status.code(),
                source_path.display()
            )));
        }

        let json: Value = serde_json::from_slice(&output.stdout).map_err(|err| {
            EngineError::FatalConfig(format!("failed to parse ffprobe output: {err}"))
        })?;

        parse_probe_info(&json)
            .ok_or_else(|| EngineError::FatalConfig("no video stream in ffprobe output".into()))
    }
}

fn parse_probe_info(json: &Value) -> Option<ProbeInfo> {
    let video_stream = json["streams"]
        .as_array()?
        .iter()
        .find(|s| s["codec_type"].as_str() == Some("video"))?;

    let duration_secs = json["format"]["duration"]
        .as_str()
        .and_then(|s| s.parse::<f64>().ok())
        .or_else(|| video_stream["duration"].as_str().and_then(|s| s.parse().ok()))
        .unwrap_or(0.0);

    let frame_rate = video_stream["r_frame_rate"]
        .as_str()
        .and_then(parse_rational)
        .unwrap_or(0.0);

    let bit_rate = video_stream["bit_rate"]
        .as_str()
        .and_then(|s| s.parse::<u64>().ok())
        .or_else(|| json["format"]["bit_rate"].as_str().and_then(|s| s.parse().ok()))
        .unwrap_or(0);

    let rotation = video_stream["side_data_list"]
        .as_array()
        .and_then(|list| list.iter().find_map(|sd| sd["rotation"].as_i64()))
        .unwrap_or(0) as i32;

    Some(ProbeInfo {
        width: video_stream["width"].as_u64().unwrap_or(0) as u32,
        height: video_stream["height"].as_u64().unwrap_or(0) as u32,
        duration_secs,
        frame_rate,
        codec_name: video_stream["codec_name"].as_str().unwrap_or("").to_string(),
        bit_rate,
        rotation,
    })
}

/// Parses ffprobe's `"30000/1001"`-style rational frame rate strings.
fn parse_rational(raw: &str) -> Option<f64> {
    let (num, den) = raw.split_once('/')?;
    let num: f64 = num.parse().ok()?;
    let den: f64 = den.parse().ok()?;
    if den == 0.0 { None } else { Some(num / den) }
}

/// A single always-on H.264/AAC encoding profile, bound to one source path.
/// `quality` is accepted for interface compatibility but ignored — there is
/// only one rung ("max").
struct SingleRungArgvBuilder {
    source_path: std::path::PathBuf,
    segment_duration_secs: u64,
}

impl ArgvBuilder for SingleRungArgvBuilder {
    fn build_args(&self, start_second: f64, output_pattern: &str, is_hls: bool) -> Vec<String> {
        let start_number = if self.segment_duration_secs == 0 {
            0
        } else {
            (start_second / self.segment_duration_secs as f64).round() as u64
        };

        let mut args = vec![
            "-ss".to_string(),
            start_second.to_string(),
            "-i".to_string(),
            self.source_path.to_string_lossy().into_owned(),
            "-map".to_string(),
            "0:v:0".to_string(),
            "-map".to_string(),
            "0:a:0?".to_string(),
            "-c:v".to_string(),
            "libx264".to_string(),
            "-preset".to_string(),
            "veryfast".to_string(),
            "-c:a".to_string(),
            "aac".to_string(),
        ];

        if is_hls {
            args.extend([
                "-f".to_string(),
                "hls".to_string(),
                "-hls_time".to_string(),
                self.segment_duration_secs.to_string(),
                "-hls_list_size".to_string(),
                "0".to_string(),
                "-hls_segment_type".to_string(),
                "mpegts".to_string(),
                "-start_number".to_string(),
                start_number.to_string(),
                "-hls_segment_filename".to_string(),
                output_pattern.to_string(),
                "-f".to_string(),
                "hls".to_string(),
                "/dev/null".to_string(),
            ]);
        } else {
            args.extend([
                "-f".to_string(),
                "mp4".to_string(),
                "-movflags".to_string(),
                "frag_keyframe+empty_moov+faststart".to_string(),
                output_pattern.to_string(),
            ]);
        }

        args
    }
}

pub struct SingleRungArgvBuilderFactory {
    segment_duration_secs: u64,
}

impl SingleRungArgvBuilderFactory {
    pub fn new(segment_duration_secs: u64) -> Self {
        Self {
            segment_duration_secs,
        }
    }
}

impl ArgvBuilderFactory for SingleRungArgvBuilderFactory {
    fn build_for(&self, source_path: &Path, _quality: &str) -> Arc<dyn ArgvBuilder> {
        Arc::new(SingleRungArgvBuilder {
            source_path: source_path.to_path_buf(),
            segment_duration_secs: self.segment_duration_secs,
        })
    }
}

/// Quality ladder for a probed source. Ladder construction is out of scope
/// (§1); this always returns the single rung the concrete `ArgvBuilder`
/// actually knows how to produce.
pub fn build_ladder(_probe: &ProbeInfo) -> Vec<String> {
    vec!["max".to_string()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_rational_divides_numerator_by_denominator() {
        assert_eq!(parse_rational("30000/1001"), Some(30000.0 / 1001.0));
        assert_eq!(parse_rational("25/1"), Some(25.0));
        assert_eq!(parse_rational("0/0"), None);
    }

    #[test]
    fn parse_probe_info_picks_the_first_video_stream() {
        let json: Value = serde_json::json!({
            "format": { "duration": "90.5", "bit_rate": "1200000" },
            "streams": [
                { "codec_type": "audio", "codec_name": "aac" },
                {
                    "codec_type": "video",
                    "codec_name": "h264",
                    "width": 1280,
                    "height": 720,
                    "r_frame_rate": "30/1",
                    "bit_rate": "2000000"
                }
            ]
        });
        let probe = parse_probe_info(&json).unwrap();
        assert_eq!(probe.codec_name, "h264");
        assert_eq!(probe.width, 1280);
        assert_eq!(probe.height, 720);
        assert_eq!(probe.duration_secs, 90.5);
        assert_eq!(probe.frame_rate, 30.0);
        assert_eq!(probe.bit_rate, 2_000_000);
    }

    #[test]
    fn parse_probe_info_with_no_video_stream_returns_none() {
        let json: Value = serde_json::json!({
            "format": {},
            "streams": [{ "codec_type": "audio" }]
        });
        assert!(parse_probe_info(&json).is_none());
    }

    #[test]
    fn single_rung_argv_builder_labels_start_number_from_start_second() {
        let factory = SingleRungArgvBuilderFactory::new(3);
        let builder = factory.build_for(Path::new("/videos/in.mp4"), "max");
        let args = builder.build_args(12.0, "/tmp/store/max-%06d.ts", true);
        let start_number_idx = args.iter().position(|a| a == "-start_number").unwrap();
        assert_eq!(args[start_number_idx + 1], "4");
    }

    #[test]
    fn build_ladder_is_a_single_rung() {
        let probe = ProbeInfo {
            width: 1920,
            height: 1080,
            duration_secs: 10.0,
            frame_rate: 30.0,
            codec_name: "h264".into(),
            bit_rate: 1,
            rotation: 0,
        };
        assert_eq!(build_ladder(&probe), vec!["max".to_string()]);
    }
}
