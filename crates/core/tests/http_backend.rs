use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::{Multipart, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tempfile::tempdir;
use url::Url;

use krafity_core::canvas::{Canvas, Shape, META_CONTEXT};
use krafity_core::jobs::backend::ClipRequest;
use krafity_core::jobs::{HttpJobBackend, JobBackend, JobPoller, PollState};
use krafity_core::media::{ExtractedFrame, FrameExtractor, FramePosition};
use krafity_core::session::{SessionOptions, StoryboardSession};
use krafity_core::types::JobStatus;

const MEDIA_BYTES: &[u8] = b"not really an mp4";

struct MockBackend {
    base_url: String,
    polls: Mutex<HashMap<String, u32>>,
    submitted: Mutex<Vec<Value>>,
}

async fn spawn_backend() -> (String, Arc<MockBackend>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock backend");
    let base_url = format!("http://{}", listener.local_addr().expect("local addr"));
    let state = Arc::new(MockBackend {
        base_url: base_url.clone(),
        polls: Mutex::new(HashMap::new()),
        submitted: Mutex::new(Vec::new()),
    });

    let api = Router::new()
        .route("/api/jobs/video", post(submit_clip))
        .route("/api/jobs/video/merge", post(merge_videos))
        .route("/api/jobs/video/{job_id}", get(job_status))
        .route("/api/context/extract", post(extract_context))
        .route("/media/{name}", get(media));
    let router = Router::new()
        .merge(api.clone())
        .nest("/proxy", api)
        .with_state(state.clone());

    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("mock backend serves");
    });
    (base_url, state)
}

async fn submit_clip(
    State(state): State<Arc<MockBackend>>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    state.submitted.lock().expect("lock").push(body);
    (
        StatusCode::ACCEPTED,
        Json(json!({ "job_id": "job-new", "status": "pending" })),
    )
}

/// `job-*` ids report pending once, then done. `gone` is unknown.
async fn job_status(
    State(state): State<Arc<MockBackend>>,
    Path(job_id): Path<String>,
) -> (StatusCode, Json<Value>) {
    if job_id == "gone" {
        return (StatusCode::NOT_FOUND, Json(json!({ "detail": "job not found" })));
    }

    let polls = {
        let mut polls = state.polls.lock().expect("lock");
        let count = polls.entry(job_id.clone()).or_insert(0);
        *count += 1;
        *count
    };
    if polls < 2 {
        (
            StatusCode::ACCEPTED,
            Json(json!({ "job_id": job_id, "status": "pending", "video_url": null })),
        )
    } else {
        (
            StatusCode::OK,
            Json(json!({
                "job_id": job_id,
                "status": "done",
                "video_url": format!("{}/media/{job_id}.mp4", state.base_url),
            })),
        )
    }
}

async fn merge_videos(Json(body): Json<Value>) -> Response {
    let urls = body["video_urls"].as_array().map(Vec::len).unwrap_or(0);
    if urls < 2 {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "At least two videos are required" })),
        )
            .into_response();
    }
    (StatusCode::OK, format!("merged:{urls}").into_bytes()).into_response()
}

async fn extract_context(mut multipart: Multipart) -> (StatusCode, Json<Value>) {
    while let Ok(Some(field)) = multipart.next_field().await {
        if field.name() != Some("file") {
            continue;
        }
        let file_name = field.file_name().map(ToString::to_string);
        let content_type = field.content_type().map(ToString::to_string);
        let bytes = field.bytes().await.expect("file bytes");
        return (
            StatusCode::OK,
            Json(json!({
                "file_name": file_name,
                "content_type": content_type,
                "size": bytes.len(),
                "scene": "rainy street",
            })),
        );
    }
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": "missing file part" })),
    )
}

async fn media(Path(_name): Path<String>) -> Vec<u8> {
    MEDIA_BYTES.to_vec()
}

fn client(base_url: &str) -> HttpJobBackend {
    HttpJobBackend::new(base_url, Duration::from_secs(5)).expect("backend client")
}

#[tokio::test]
async fn status_poll_keeps_http_status_and_lenient_body() {
    let (base_url, _state) = spawn_backend().await;
    let backend = client(&base_url);

    let first = backend.job_status("job-7").await.expect("first poll");
    assert_eq!(first.http_status, 202);
    assert_eq!(first.body.as_ref().map(|body| body.status.as_str()), Some("pending"));

    let second = backend.job_status("job-7").await.expect("second poll");
    assert_eq!(second.http_status, 200);
    let body = second.body.expect("done body");
    assert_eq!(body.status, "done");
    assert_eq!(
        body.video_url,
        Some(format!("{base_url}/media/job-7.mp4"))
    );

    let gone = backend.job_status("gone").await.expect("404 is a response");
    assert_eq!(gone.http_status, 404);
    assert!(gone.body.is_none());
}

#[tokio::test]
async fn status_poll_sends_job_id_as_one_segment() {
    let (base_url, state) = spawn_backend().await;
    let backend = client(&base_url);
    let job_id = "clip 7/../../x?y#z";

    let response = backend.job_status(job_id).await.expect("poll");
    assert_eq!(response.http_status, 202);
    assert_eq!(state.polls.lock().expect("lock").get(job_id), Some(&1));
}

#[tokio::test]
async fn base_url_path_prefix_is_kept() {
    let (base_url, state) = spawn_backend().await;

    for prefixed in [format!("{base_url}/proxy"), format!("{base_url}/proxy/")] {
        let backend = client(&prefixed);
        let response = backend.job_status("job-9").await.expect("poll");
        assert!(response.body.is_some());
    }
    assert_eq!(state.polls.lock().expect("lock").get("job-9"), Some(&2));
}

#[tokio::test]
async fn submit_posts_the_clip_request() {
    let (base_url, state) = spawn_backend().await;
    let backend = client(&base_url);

    let submitted = backend
        .submit_clip(&ClipRequest {
            prompt: "dolly in on the lighthouse".to_string(),
            start_image_url: Some("https://cdn/frame.png".to_string()),
            duration_seconds: None,
        })
        .await
        .expect("submit");
    assert_eq!(submitted.job_id, "job-new");
    assert_eq!(submitted.status.as_deref(), Some("pending"));
    assert_eq!(
        state.submitted.lock().expect("lock").as_slice(),
        &[json!({
            "prompt": "dolly in on the lighthouse",
            "start_image_url": "https://cdn/frame.png",
        })]
    );
}

#[tokio::test]
async fn merge_returns_bytes_or_surfaces_error_body() {
    let (base_url, _state) = spawn_backend().await;
    let backend = client(&base_url);

    let merged = backend
        .merge_videos(&["a".to_string(), "b".to_string(), "c".to_string()])
        .await
        .expect("merge");
    assert_eq!(merged, b"merged:3".to_vec());

    let err = backend
        .merge_videos(&["a".to_string()])
        .await
        .expect_err("single clip is rejected by the backend");
    assert!(err.to_string().contains("At least two videos are required"));
}

#[tokio::test]
async fn context_extraction_uploads_multipart_file() {
    let (base_url, _state) = spawn_backend().await;
    let backend = client(&base_url);

    let context = backend
        .extract_context(MEDIA_BYTES.to_vec(), "clip-3.mp4")
        .await
        .expect("context");
    assert_eq!(context["file_name"], "clip-3.mp4");
    assert_eq!(context["content_type"], "video/mp4");
    assert_eq!(context["size"], MEDIA_BYTES.len());
}

#[tokio::test]
async fn fetch_media_reads_http_and_file_urls() {
    let (base_url, _state) = spawn_backend().await;
    let backend = client(&base_url);

    let remote = backend
        .fetch_media(&format!("{base_url}/media/x.mp4"))
        .await
        .expect("http media");
    assert_eq!(remote, MEDIA_BYTES);

    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("local.mp4");
    std::fs::write(&path, b"local bytes").expect("write media");
    let url = Url::from_file_path(&path).expect("file url");
    let local = backend.fetch_media(url.as_str()).await.expect("file media");
    assert_eq!(local, b"local bytes");
}

struct StaticExtractor;

#[async_trait]
impl FrameExtractor for StaticExtractor {
    async fn extract(
        &self,
        _media_url: &str,
        _position: FramePosition,
    ) -> anyhow::Result<ExtractedFrame> {
        Ok(ExtractedFrame {
            png: Vec::new(),
            width: 1280,
            height: 720,
        })
    }
}

#[tokio::test]
async fn poller_drives_http_job_to_completion() {
    let (base_url, _state) = spawn_backend().await;
    let dir = tempdir().expect("tempdir");

    let mut canvas = Canvas::new();
    canvas
        .insert(Shape::frame("f1", 0.0, 0.0, 640.0, 360.0))
        .expect("frame inserts");
    canvas
        .insert(Shape::frame("f2", 720.0, 0.0, 320.0, 320.0))
        .expect("frame inserts");
    canvas
        .insert(Shape::arrow("a1", "f1", "f2", 0).with_job("job-1", JobStatus::Pending))
        .expect("arrow inserts");
    let session = StoryboardSession::new(
        canvas,
        Arc::new(client(&base_url)),
        Arc::new(StaticExtractor),
        SessionOptions::new(dir.path()),
    );
    let poller = JobPoller::new(session.clone(), Duration::from_millis(20));

    let handles = poller.watch_pending();
    assert_eq!(handles.len(), 1);
    let outcome = handles
        .into_iter()
        .next()
        .expect("one loop")
        .await
        .expect("loop joins");
    assert_eq!(outcome.state, PollState::Done);
    assert_eq!(outcome.ticks, 2);
    outcome
        .effects
        .expect("completion pipeline")
        .await
        .expect("pipeline joins");

    let canvas = session.canvas_snapshot();
    let edge = canvas.get("a1").expect("edge");
    assert_eq!(edge.meta_str("status"), Some("done"));
    assert_eq!(
        edge.meta_str("video_url"),
        Some(format!("{base_url}/media/job-1.mp4").as_str())
    );
    let context = edge.meta.get(META_CONTEXT).expect("context stored");
    assert_eq!(context["file_name"], "job-1.mp4");
    assert_eq!(context["scene"], "rainy street");

    let image = canvas.get("f2").and_then(Shape::image).expect("thumbnail");
    assert!((image.width - 320.0).abs() < 1e-9);
    assert!((image.height - 180.0).abs() < 1e-9);
    assert!((image.y - 70.0).abs() < 1e-9);
    assert!(session.pending_jobs().is_empty());
}
