use std::fs;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use url::Url;

/// Body of `POST /api/jobs/video`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClipRequest {
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_image_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<u32>,
}

/// Acknowledgement returned when a clip job is accepted.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SubmittedJob {
    pub job_id: String,
    #[serde(default)]
    pub status: Option<String>,
}

/// Status document from `GET /api/jobs/video/{job_id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusBody {
    pub status: String,
    #[serde(default)]
    pub video_url: Option<String>,
}

/// Raw outcome of a status query. The HTTP status is kept separate from
/// the body because the poller treats anything outside 200/202 as final.
#[derive(Debug, Clone, PartialEq)]
pub struct JobStatusResponse {
    pub http_status: u16,
    pub body: Option<JobStatusBody>,
}

#[derive(Debug, Serialize)]
struct MergeRequest<'a> {
    video_urls: &'a [String],
}

#[derive(Debug, Deserialize)]
struct MergeErrorBody {
    error: String,
}

/// The REST job backend, as seen by the session.
#[async_trait]
pub trait JobBackend: Send + Sync {
    async fn submit_clip(&self, request: &ClipRequest) -> Result<SubmittedJob>;

    async fn job_status(&self, job_id: &str) -> Result<JobStatusResponse>;

    /// Concatenates clips in list order and returns the merged media bytes.
    async fn merge_videos(&self, video_urls: &[String]) -> Result<Vec<u8>>;

    async fn extract_context(&self, media: Vec<u8>, file_name: &str) -> Result<Value>;

    async fn fetch_media(&self, media_url: &str) -> Result<Vec<u8>>;
}

#[derive(Debug, Clone)]
pub struct HttpJobBackend {
    base_url: Url,
    client: reqwest::Client,
}

impl HttpJobBackend {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base_url = Url::parse(base_url).context("invalid job backend base URL")?;
        if base_url.cannot_be_a_base() {
            bail!("job backend base URL cannot carry a path: {base_url}");
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self { base_url, client })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Appends `segments` below the base URL's own path. Each segment is
    /// percent-encoded, so opaque ids cannot add query strings or walk up.
    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| anyhow!("job backend base URL cannot carry a path: {}", self.base_url))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

#[async_trait]
impl JobBackend for HttpJobBackend {
    /// `POST /api/jobs/video`: queue a clip generation.
    async fn submit_clip(&self, request: &ClipRequest) -> Result<SubmittedJob> {
        let url = self.url(&["api", "jobs", "video"])?;
        let resp = self
            .client
            .post(url)
            .json(request)
            .send()
            .await
            .context("failed to reach job backend")?;

        if !resp.status().is_success() {
            bail!("/api/jobs/video returned HTTP {}", resp.status().as_u16());
        }

        resp.json::<SubmittedJob>()
            .await
            .context("failed to parse job submission response")
    }

    /// `GET /api/jobs/video/{job_id}`: one poll tick.
    async fn job_status(&self, job_id: &str) -> Result<JobStatusResponse> {
        let url = self.url(&["api", "jobs", "video", job_id])?;
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("failed to poll job {job_id}"))?;

        let http_status = resp.status().as_u16();
        let body = match resp.bytes().await {
            Ok(bytes) => serde_json::from_slice::<JobStatusBody>(&bytes).ok(),
            Err(error) => {
                debug!(job_id, %error, "Failed to read job status body");
                None
            }
        };

        Ok(JobStatusResponse { http_status, body })
    }

    /// `POST /api/jobs/video/merge`: raw media on success, `{error}` otherwise.
    async fn merge_videos(&self, video_urls: &[String]) -> Result<Vec<u8>> {
        let url = self.url(&["api", "jobs", "video", "merge"])?;
        let resp = self
            .client
            .post(url)
            .json(&MergeRequest { video_urls })
            .send()
            .await
            .context("failed to reach merge endpoint")?;

        let status = resp.status();
        let bytes = resp
            .bytes()
            .await
            .context("failed to read merge response")?;

        if let Ok(body) = serde_json::from_slice::<MergeErrorBody>(&bytes) {
            bail!("merge failed: {}", body.error);
        }
        if !status.is_success() {
            bail!("/api/jobs/video/merge returned HTTP {}", status.as_u16());
        }
        if bytes.is_empty() {
            bail!("merge endpoint returned an empty body");
        }

        Ok(bytes.to_vec())
    }

    /// `POST /api/context/extract`: multipart upload of the clip.
    async fn extract_context(&self, media: Vec<u8>, file_name: &str) -> Result<Value> {
        let url = self.url(&["api", "context", "extract"])?;
        let mime = mime_guess::from_path(file_name).first_or_octet_stream();
        let part = Part::bytes(media)
            .file_name(file_name.to_string())
            .mime_str(mime.essence_str())
            .context("invalid media content type")?;
        let form = Form::new().part("file", part);

        let resp = self
            .client
            .post(url)
            .multipart(form)
            .send()
            .await
            .context("failed to reach context extraction endpoint")?;

        if !resp.status().is_success() {
            bail!(
                "/api/context/extract returned HTTP {}",
                resp.status().as_u16()
            );
        }

        resp.json::<Value>()
            .await
            .context("failed to parse context extraction response")
    }

    async fn fetch_media(&self, media_url: &str) -> Result<Vec<u8>> {
        let parsed =
            Url::parse(media_url).with_context(|| format!("invalid media URL: {media_url}"))?;

        if parsed.scheme() == "file" {
            let path = parsed
                .to_file_path()
                .map_err(|_| anyhow!("media URL is not a local path: {media_url}"))?;
            return fs::read(&path)
                .with_context(|| format!("failed to read media file: {}", path.display()));
        }

        let resp = self
            .client
            .get(parsed)
            .send()
            .await
            .with_context(|| format!("failed to download {media_url}"))?;

        if resp.status() != StatusCode::OK {
            bail!("media download returned HTTP {}", resp.status().as_u16());
        }

        let bytes = resp
            .bytes()
            .await
            .with_context(|| format!("failed to read media body from {media_url}"))?;
        Ok(bytes.to_vec())
    }
}

/// File name used for multipart uploads, taken from the URL's last segment.
pub fn media_file_name(media_url: &str) -> String {
    Url::parse(media_url)
        .ok()
        .and_then(|url| {
            url.path_segments()
                .and_then(|mut segments| segments.next_back().map(ToString::to_string))
        })
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "clip.mp4".to_string())
}
