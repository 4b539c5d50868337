//! HTTP boundary exposed to the UI collaborator.
//!
//! Thin by design: handlers validate, delegate to the scheduler / store /
//! cache admin, and translate outcomes into status codes. All bodies are
//! JSON except the upload (multipart in) and the download (MP4 out).

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    body::{Body, Bytes},
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::{header, StatusCode},
    response::Response,
    routing::{get, post},
    BoxError, Json, Router,
};
use futures::{Stream, TryStreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::{fs::File, io::BufWriter};
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::warn;
use uuid::Uuid;

use crate::cache::admin::AdminError;
use crate::cache::{sanitize_asset_id, CacheAdmin};
use crate::config::Config;
use crate::jobs::{BgmMode, BgmSpec, ExportQuality, JobStatus, JobStore, VideoSlot};
use crate::scheduler::RenderScheduler;

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub store: Arc<JobStore>,
    pub scheduler: Arc<RenderScheduler>,
    pub admin: Arc<CacheAdmin>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/upload", post(upload_media))
        .route("/api/render", post(submit_render).get(list_renders))
        .route("/api/render/:job_id", get(get_render))
        .route("/api/render/:job_id/cancel", post(cancel_render))
        .route("/api/download/:job_id", get(download_output))
        .route("/api/cache/stats", get(cache_stats))
        .route("/api/cache/clear", post(clear_cache))
        .route("/api/asset/:asset_id/purge", post(purge_asset))
        .layer(DefaultBodyLimit::disable())
        .with_state(state)
}

type ApiError = (StatusCode, Json<Value>);

fn bad_request(message: impl Into<String>) -> ApiError {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message.into() })))
}

async fn health() -> Json<Value> {
    Json(json!({ "ok": true }))
}

/// Accept a multipart upload and store it under `{assetId}-{originalName}`.
/// The file streams to a staging name first so a broken connection never
/// leaves a half-written upload under its final name.
async fn upload_media(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
    let upload_dir = state.config.upload_dir();
    let mut asset_id: Option<String> = None;
    let mut staged: Option<(PathBuf, String)> = None;

    while let Ok(Some(field)) = multipart.next_field().await {
        if field.name() == Some("assetId") {
            asset_id = field.text().await.ok();
            continue;
        }

        let Some(file_name) = field.file_name().map(sanitize_file_name) else {
            continue;
        };
        if file_name.is_empty() {
            return Err(bad_request("upload has no usable file name"));
        }

        let staging = upload_dir.join(format!(".incoming-{}", Uuid::new_v4()));
        stream_to_file(&staging, field)
            .await
            .map_err(|(status, message)| (status, Json(json!({ "error": message }))))?;
        staged = Some((staging, file_name));
    }

    let Some((staging, file_name)) = staged else {
        return Err(bad_request("no file field in upload"));
    };

    let asset = sanitize_asset_id(&asset_id.unwrap_or_else(|| Uuid::new_v4().to_string()));
    let final_path = upload_dir.join(format!("{asset}-{file_name}"));
    tokio::fs::rename(&staging, &final_path).await.map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": format!("could not store upload: {e}") })),
        )
    })?;

    Ok(Json(json!({ "path": final_path })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderRequest {
    pub name: Option<String>,
    pub export_quality: Option<ExportQuality>,
    pub video1: Option<VideoSlot>,
    #[serde(default)]
    pub video2: Option<VideoSlot>,
    #[serde(default)]
    pub bgm: Option<BgmSpec>,
}

async fn submit_render(
    State(state): State<AppState>,
    Json(req): Json<RenderRequest>,
) -> Result<Json<Value>, ApiError> {
    let Some(video1) = req.video1 else {
        return Err(bad_request("video1 is required"));
    };

    let mut referenced = vec![video1.path.clone()];
    if let Some(v2) = &req.video2 {
        referenced.push(v2.path.clone());
    }
    if let Some(bgm) = &req.bgm {
        referenced.push(bgm.path.clone());
    }
    for path in referenced {
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(bad_request(format!(
                "referenced upload {} does not exist",
                path.display()
            )));
        }
    }

    if let Some(bgm) = &req.bgm {
        if bgm.mode == BgmMode::Video2Only && req.video2.is_none() {
            return Err(bad_request("bgm mode VIDEO2_ONLY requires video2"));
        }
    }

    let job_id = state.scheduler.submit(
        req.name.unwrap_or_else(|| String::from("Untitled")),
        req.export_quality.unwrap_or(ExportQuality::Hd1080),
        video1,
        req.video2,
        req.bgm,
    );
    Ok(Json(json!({ "jobId": job_id })))
}

async fn list_renders(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.store.list()))
}

async fn get_render(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    match state.store.get(&job_id) {
        Some(job) => Ok(Json(json!(job))),
        None => Err((StatusCode::NOT_FOUND, Json(json!({ "status": "missing" })))),
    }
}

async fn cancel_render(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state
        .scheduler
        .cancel(&job_id)
        .map_err(bad_request)?;
    Ok(Json(json!({ "ok": true })))
}

async fn download_output(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Response, ApiError> {
    let not_ready = || {
        (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "output not available" })),
        )
    };

    let job = state.store.get(&job_id).ok_or_else(not_ready)?;
    if job.status != JobStatus::Completed {
        return Err(not_ready());
    }
    let output_path = job.output_path.ok_or_else(not_ready)?;
    let file = File::open(&output_path).await.map_err(|_| not_ready())?;

    let response = Response::builder()
        .header(header::CONTENT_TYPE, "video/mp4")
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{job_id}.mp4\""),
        )
        .body(Body::from_stream(ReaderStream::new(file)))
        .map_err(|e| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            )
        })?;
    Ok(response)
}

async fn cache_stats(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.admin.stats()))
}

#[derive(Debug, Default, Deserialize)]
struct ClearRequest {
    #[serde(default)]
    force: bool,
}

async fn clear_cache(
    State(state): State<AppState>,
    body: Option<Json<ClearRequest>>,
) -> Result<Json<Value>, ApiError> {
    let force = body.map(|Json(req)| req.force).unwrap_or(false);
    match state.admin.clear(force).await {
        Ok(outcome) => Ok(Json(json!({
            "ok": true,
            "before": outcome.before,
            "after": outcome.after,
        }))),
        Err(AdminError::Busy(message)) => {
            Err((StatusCode::CONFLICT, Json(json!({ "error": message }))))
        }
        Err(e) => {
            warn!("cache clear failed: {}", e);
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            ))
        }
    }
}

async fn purge_asset(
    State(state): State<AppState>,
    Path(asset_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state.admin.purge_asset(&asset_id).map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        )
    })?;
    Ok(Json(json!({ "ok": true })))
}

/// Save a `Stream` to a file
async fn stream_to_file<S, E>(path: &PathBuf, stream: S) -> Result<(), (StatusCode, String)>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Into<BoxError>,
{
    async {
        let body_with_io_error = stream.map_err(|err| io::Error::new(io::ErrorKind::Other, err));
        let body_reader = StreamReader::new(body_with_io_error);
        futures::pin_mut!(body_reader);

        let mut file = BufWriter::new(File::create(path).await?);
        tokio::io::copy(&mut body_reader, &mut file).await?;

        Ok::<_, io::Error>(())
    }
    .await
    .map_err(|err| (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))
}

/// Keep only the final path component of a client-supplied name, restricted
/// to filesystem-safe characters. Traversal fragments never reach the disk.
fn sanitize_file_name(name: &str) -> String {
    let base = std::path::Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    base.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures::stream;
    use std::fs;
    use tempfile::tempdir;

    #[tokio::test]
    async fn stream_to_file_writes_stream_contents() {
        let temp_dir = tempdir().unwrap();
        let file_path = temp_dir.path().join("test_file.bin");

        type E = std::io::Error;
        let test_data = "Hello, montage!";
        let mock_stream = stream::iter(vec![Ok::<Bytes, E>(Bytes::from(test_data))]);

        let result = stream_to_file(&file_path, mock_stream).await;
        assert!(result.is_ok());

        let file_contents = fs::read_to_string(file_path).unwrap();
        assert_eq!(file_contents, test_data);
    }

    #[tokio::test]
    async fn stream_to_file_surfaces_stream_errors() {
        let temp_dir = tempdir().unwrap();
        let file_path = temp_dir.path().join("test_file.bin");

        let mock_stream = stream::iter(vec![Err("Test error")]);
        let result = stream_to_file(&file_path, mock_stream).await;

        assert!(result.is_err());
        assert_eq!(
            result.unwrap_err(),
            (StatusCode::INTERNAL_SERVER_ERROR, "Test error".to_string())
        );
    }

    #[test]
    fn file_names_are_stripped_to_their_final_component() {
        assert_eq!(sanitize_file_name("clip.mp4"), "clip.mp4");
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("/root/clip.mp4"), "clip.mp4");
        assert_eq!(sanitize_file_name("my clip (1).mp4"), "my_clip__1_.mp4");
    }

    #[test]
    fn render_request_accepts_the_documented_wire_shape() {
        let req: RenderRequest = serde_json::from_str(
            r#"{
                "name": "demo",
                "exportQuality": "720p",
                "video1": {"path": "/data/uploads/a-clip.mp4", "duration": 3.0},
                "video2": null,
                "bgm": {"path": "/data/uploads/b-track.mp3", "playLength": 6.0,
                        "volumeDb": -14, "mode": "FULL", "loop": false}
            }"#,
        )
        .unwrap();

        assert_eq!(req.export_quality, Some(ExportQuality::Hd720));
        assert!(req.video1.is_some());
        assert!(req.video2.is_none());
        let bgm = req.bgm.unwrap();
        assert_eq!(bgm.mode, BgmMode::Full);
        assert_eq!(bgm.volume_db, Some(-14.0));
    }

    #[test]
    fn render_request_tolerates_a_minimal_body() {
        let req: RenderRequest = serde_json::from_str(
            r#"{"video1": {"path": "/data/uploads/a-clip.mp4", "duration": 3.0}}"#,
        )
        .unwrap();
        assert!(req.name.is_none());
        assert!(req.export_quality.is_none());
        assert!(req.bgm.is_none());
    }
}
