use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use tempfile::{tempdir, TempDir};
use tokio::sync::Notify;

use krafity_core::canvas::{Canvas, Shape, META_CONTEXT};
use krafity_core::jobs::backend::{ClipRequest, JobStatusBody, JobStatusResponse, SubmittedJob};
use krafity_core::jobs::poller::AbandonReason;
use krafity_core::jobs::{JobBackend, JobPoller, PollState};
use krafity_core::media::{ExtractedFrame, FrameExtractor, FramePosition};
use krafity_core::session::{SessionOptions, StoryboardSession};
use krafity_core::types::JobStatus;

/// Holds every status request until the test releases it.
#[derive(Default)]
struct GatedBackend {
    entered: Notify,
    release: Notify,
    reply: Mutex<Option<JobStatusResponse>>,
    context_calls: AtomicUsize,
}

impl GatedBackend {
    fn replying_done(video_url: &str) -> Self {
        let backend = Self::default();
        *backend.reply.lock().expect("lock") = Some(JobStatusResponse {
            http_status: 200,
            body: Some(JobStatusBody {
                status: "done".to_string(),
                video_url: Some(video_url.to_string()),
            }),
        });
        backend
    }
}

#[async_trait]
impl JobBackend for GatedBackend {
    async fn submit_clip(&self, _request: &ClipRequest) -> Result<SubmittedJob> {
        bail!("submission is not exercised here")
    }

    async fn job_status(&self, _job_id: &str) -> Result<JobStatusResponse> {
        self.entered.notify_one();
        self.release.notified().await;
        match self.reply.lock().expect("lock").clone() {
            Some(reply) => Ok(reply),
            None => bail!("no reply scripted"),
        }
    }

    async fn merge_videos(&self, _video_urls: &[String]) -> Result<Vec<u8>> {
        bail!("merge is not exercised here")
    }

    async fn extract_context(&self, _media: Vec<u8>, _file_name: &str) -> Result<Value> {
        self.context_calls.fetch_add(1, Ordering::SeqCst);
        Ok(json!({ "scene": "harbor at dusk" }))
    }

    async fn fetch_media(&self, _media_url: &str) -> Result<Vec<u8>> {
        Ok(b"clip".to_vec())
    }
}

struct StaticExtractor;

#[async_trait]
impl FrameExtractor for StaticExtractor {
    async fn extract(&self, _media_url: &str, _position: FramePosition) -> Result<ExtractedFrame> {
        Ok(ExtractedFrame {
            png: Vec::new(),
            width: 1920,
            height: 1080,
        })
    }
}

fn session_with(backend: Arc<GatedBackend>) -> (TempDir, JobPoller) {
    let dir = tempdir().expect("tempdir");
    let mut canvas = Canvas::new();
    canvas
        .insert(Shape::frame("f1", 0.0, 0.0, 640.0, 360.0))
        .expect("frame inserts");
    canvas
        .insert(Shape::frame("f2", 720.0, 0.0, 640.0, 360.0))
        .expect("frame inserts");
    canvas
        .insert(Shape::arrow("a1", "f1", "f2", 0).with_job("job-1", JobStatus::Pending))
        .expect("arrow inserts");

    let session = StoryboardSession::new(
        canvas,
        backend,
        Arc::new(StaticExtractor),
        SessionOptions::new(dir.path()),
    );
    (dir, JobPoller::new(session, Duration::from_secs(2)))
}

#[tokio::test(start_paused = true)]
async fn arrow_deleted_during_request_discards_the_result() {
    let backend = Arc::new(GatedBackend::replying_done("https://cdn/clip.mp4"));
    let (_dir, poller) = session_with(backend.clone());

    let handle = poller.start("a1", "job-1").expect("loop starts");
    backend.entered.notified().await;
    poller.session().remove_shape("a1").expect("arrow existed");
    backend.release.notify_one();

    let outcome = handle.await.expect("loop joins");
    assert_eq!(outcome.state, PollState::Abandoned);
    assert_eq!(outcome.reason, Some(AbandonReason::EdgeRemoved));
    assert!(outcome.effects.is_none());
    assert!(!poller.session().registry().is_completed("job-1"));
    assert_eq!(backend.context_calls.load(Ordering::SeqCst), 0);
    assert!(poller
        .session()
        .canvas_snapshot()
        .get("f2")
        .and_then(Shape::image)
        .is_none());
}

#[tokio::test(start_paused = true)]
async fn completion_races_with_loop_and_runs_once() {
    let backend = Arc::new(GatedBackend::replying_done("https://cdn/clip.mp4"));
    let (_dir, poller) = session_with(backend.clone());

    let handle = poller.start("a1", "job-1").expect("loop starts");
    assert!(poller.start("a1", "job-1").is_none());
    backend.entered.notified().await;

    let effects = poller
        .complete("a1", "job-1", "https://cdn/clip.mp4")
        .expect("first completion wins");
    backend.release.notify_one();

    let outcome = handle.await.expect("loop joins");
    assert!(outcome.effects.is_none());
    effects.await.expect("effects join");

    assert_eq!(backend.context_calls.load(Ordering::SeqCst), 1);
    let canvas = poller.session().canvas_snapshot();
    let edge = canvas.get("a1").expect("edge");
    assert_eq!(edge.meta_str("status"), Some("done"));
    assert_eq!(edge.meta.get(META_CONTEXT), Some(&json!({ "scene": "harbor at dusk" })));

    let image = canvas.get("f2").and_then(Shape::image).expect("thumbnail placed");
    assert!((image.width - 640.0).abs() < 1e-9);
    assert!((image.height - 360.0).abs() < 1e-9);
    assert!(image.src.starts_with("file://"));
}

#[tokio::test(start_paused = true)]
async fn shutdown_cancels_in_flight_request() {
    let backend = Arc::new(GatedBackend::replying_done("https://cdn/clip.mp4"));
    let (_dir, poller) = session_with(backend.clone());

    let handle = poller.start("a1", "job-1").expect("loop starts");
    backend.entered.notified().await;
    poller.shutdown();

    let outcome = handle.await.expect("loop joins");
    assert_eq!(outcome.state, PollState::Abandoned);
    assert_eq!(outcome.reason, Some(AbandonReason::Cancelled));
    assert_eq!(poller.session().registry().active_count(), 0);
    assert_eq!(
        poller
            .session()
            .canvas_snapshot()
            .get("a1")
            .and_then(|edge| edge.meta_str("status")),
        Some("pending")
    );
}
