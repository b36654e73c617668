//! Playlist, segment, and full-video routes (SPEC addition, §6): the HTTP
//! surface the engine's `ServeChunk`/`ServeFullVideo` operations are
//! actually reached through. Playlist text emission and request-path
//! parsing are out of core per spec.md §1 ("HTTP routing, playlist text
//! emission ... config file loading"), so this module keeps both as plain,
//! regex-driven glue around `StreamSupervisor`.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use axum::body::Body;
use axum::extract::{Path as AxumPath, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use regex::Regex;
use tokio_util::io::ReaderStream;

use crate::api::error::{ApiError, ApiResult};
use crate::api::server::AppState;
use engine::FullVideoResponse;

pub fn router() -> Router<AppState> {
    Router::new().route("/{source_id}/{target}", get(serve_target))
}

static CHUNK_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?P<quality>[^./]+)-(?P<id>\d{6})\.(?P<ext>ts|mp4)$").unwrap());
static LIST_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?P<quality>[^./]+)\.m3u8$").unwrap());
static FULL_VIDEO_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?P<quality>[^./]+)\.mp4$").unwrap());

async fn serve_target(
    State(state): State<AppState>,
    AxumPath((source_id, target)): AxumPath<(String, String)>,
) -> Response {
    match dispatch(&state, &source_id, &target).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn dispatch(state: &AppState, source_id: &str, target: &str) -> ApiResult<Response> {
    let source_path = resolve_source_path(state, source_id)?;

    if target == "index.m3u8" {
        let supervisor = state
            .registry
            .get_or_create(source_id, &source_path)
            .await?;
        let body = supervisor.serve_index()?;
        return Ok(playlist_response(body));
    }

    if let Some(caps) = LIST_PATTERN.captures(target) {
        let quality = &caps["quality"];
        let supervisor = state
            .registry
            .get_or_create(source_id, &source_path)
            .await?;
        let body = supervisor.serve_list_for(quality)?;
        return Ok(playlist_response(body));
    }

    if let Some(caps) = CHUNK_PATTERN.captures(target) {
        let quality = &caps["quality"];
        let id: u64 = caps["id"]
            .parse()
            .map_err(|_| ApiError::bad_request("segment id out of range"))?;
        let supervisor = state
            .registry
            .get_or_create(source_id, &source_path)
            .await?;
        let path = supervisor.serve_chunk_for(quality, id).await?;
        return Ok(serve_segment_file(&path).await?);
    }

    if let Some(caps) = FULL_VIDEO_PATTERN.captures(target) {
        let quality = &caps["quality"];
        let supervisor = state
            .registry
            .get_or_create(source_id, &source_path)
            .await?;
        return serve_full_video(&supervisor, quality).await;
    }

    Err(ApiError::bad_request(format!(
        "'{target}' does not match any known playlist, segment, or full-video filename pattern"
    )))
}

/// Resolves `source_id` to a source file. Ladder construction and catalog
/// lookups are out of scope; this treats `source_id` as a URL-encoded
/// filename directly under the configured `store_root`'s sibling source
/// directory, rejecting path traversal.
fn resolve_source_path(state: &AppState, source_id: &str) -> ApiResult<PathBuf> {
    if source_id.is_empty() || source_id.contains("..") || source_id.contains('/') {
        return Err(ApiError::bad_request("invalid source id"));
    }
    let decoded = urlencoding_decode(source_id);
    let path = state.source_root.join(decoded);
    if !path.exists() {
        return Err(ApiError::not_found(format!("unknown source '{source_id}'")));
    }
    Ok(path)
}

/// Decodes `%XX` percent-escapes in a single path segment (axum already
/// handles the routing-level decoding for most requests; this is a
/// defensive second pass for source ids containing reserved characters
/// like spaces encoded by strict clients).
fn urlencoding_decode(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(byte) = u8::from_str_radix(&raw[i + 1..i + 3], 16) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8(out).unwrap_or_else(|_| raw.to_string())
}

fn playlist_response(body: String) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/vnd.apple.mpegurl")],
        body,
    )
        .into_response()
}

async fn serve_segment_file(path: &Path) -> ApiResult<Response> {
    let content_type = match path.extension().and_then(|e| e.to_str()) {
        Some("ts") => "video/MP2T",
        _ => "video/mp4",
    };
    stream_file(path, content_type).await
}

async fn stream_file(path: &Path, content_type: &'static str) -> ApiResult<Response> {
    let file = tokio::fs::File::open(path)
        .await
        .map_err(|err| ApiError::from(crate::error::Error::Io(err)))?;
    let stream = ReaderStream::new(file);
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, content_type)],
        Body::from_stream(stream),
    )
        .into_response())
}

async fn serve_full_video(
    supervisor: &engine::StreamSupervisor,
    quality: &str,
) -> ApiResult<Response> {
    match supervisor.serve_full_video_for(quality).await? {
        FullVideoResponse::Passthrough(path) => Ok(stream_file(&path, "video/mp4").await?),
        FullVideoResponse::Transcoded(mut child) => {
            let stdout = child.stdout.take().ok_or_else(|| {
                ApiError::from(crate::error::Error::Other(
                    "full-video encoder has no stdout pipe".into(),
                ))
            })?;
            tokio::spawn(async move {
                let _ = child.wait().await;
            });
            let stream = ReaderStream::new(stdout);
            Ok((
                StatusCode::OK,
                [(header::CONTENT_TYPE, "video/mp4")],
                Body::from_stream(stream),
            )
                .into_response())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urlencoding_decode_handles_percent_escapes() {
        assert_eq!(urlencoding_decode("my%20video.mp4"), "my video.mp4");
        assert_eq!(urlencoding_decode("plain.mp4"), "plain.mp4");
    }

    #[test]
    fn chunk_pattern_extracts_quality_and_id() {
        let caps = CHUNK_PATTERN.captures("max-000042.ts").unwrap();
        assert_eq!(&caps["quality"], "max");
        assert_eq!(&caps["id"], "000042");
        assert_eq!(&caps["ext"], "ts");
    }

    #[test]
    fn list_pattern_does_not_match_a_chunk_filename() {
        assert!(LIST_PATTERN.captures("max-000042.ts").is_none());
        assert!(LIST_PATTERN.captures("max.m3u8").is_some());
    }

    #[test]
    fn full_video_pattern_matches_a_bare_quality_mp4_name() {
        // The chunk pattern is tried first in dispatch(), so a genuine
        // chunk filename like "max-000042.mp4" never reaches this pattern
        // even though the pattern alone would also match it.
        assert!(FULL_VIDEO_PATTERN.captures("max.mp4").is_some());
    }
}
