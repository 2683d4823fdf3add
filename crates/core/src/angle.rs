//! Camera-angle re-rendering through a hosted Gradio space.
//!
//! Each configured token gets its own authenticated client. Requests run
//! through [`CredentialRotator::execute_degraded`], so a throttled token
//! hands over to the next one and an out-of-memory worker is retried at a
//! smaller resolution.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use crate::config::GenerationConfig;
use crate::media::image_dimensions;
use crate::rotator::{Connector, CredentialRotator, RotationError, ServiceError};
use crate::types::Dimensions;

pub const AZIMUTH_STEP: u32 = 45;
pub const AZIMUTH_MAX: u32 = 315;
pub const ELEVATION_STEP: i32 = 30;
pub const ELEVATION_MIN: i32 = -30;
pub const ELEVATION_MAX: i32 = 60;
pub const DISTANCES: [f64; 3] = [0.6, 1.0, 1.4];

const DISTANCE_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AngleError {
    #[error("azimuth {0} is not a multiple of 45 between 0 and 315")]
    Azimuth(u32),
    #[error("elevation {0} is not one of -30, 0, 30 or 60")]
    Elevation(i32),
    #[error("distance {0} is not one of 0.6, 1.0 or 1.4")]
    Distance(f64),
}

/// A point on the camera grid: degrees around the subject, degrees above
/// the horizon, and a zoom factor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraAngle {
    azimuth: u32,
    elevation: i32,
    distance: f64,
}

impl CameraAngle {
    pub fn new(azimuth: u32, elevation: i32, distance: f64) -> Result<Self, AngleError> {
        if azimuth > AZIMUTH_MAX || azimuth % AZIMUTH_STEP != 0 {
            return Err(AngleError::Azimuth(azimuth));
        }
        if !(ELEVATION_MIN..=ELEVATION_MAX).contains(&elevation)
            || (elevation - ELEVATION_MIN) % ELEVATION_STEP != 0
        {
            return Err(AngleError::Elevation(elevation));
        }
        let distance = DISTANCES
            .iter()
            .copied()
            .find(|candidate| (candidate - distance).abs() < DISTANCE_TOLERANCE)
            .ok_or(AngleError::Distance(distance))?;

        Ok(Self {
            azimuth,
            elevation,
            distance,
        })
    }

    pub fn azimuth(&self) -> u32 {
        self.azimuth
    }

    pub fn elevation(&self) -> i32 {
        self.elevation
    }

    pub fn distance(&self) -> f64 {
        self.distance
    }
}

/// Inference parameters that stay fixed for every call.
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceSettings {
    pub api_name: String,
    pub seed: u64,
    pub randomize_seed: bool,
    pub true_guidance_scale: f64,
    pub num_inference_steps: u32,
    pub resolution_caps: Vec<u32>,
}

impl From<&GenerationConfig> for InferenceSettings {
    fn from(config: &GenerationConfig) -> Self {
        Self {
            api_name: config.api_name.clone(),
            seed: config.seed,
            randomize_seed: config.randomize_seed,
            true_guidance_scale: config.true_guidance_scale,
            num_inference_steps: config.num_inference_steps,
            resolution_caps: config.resolution_caps.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct EventHandle {
    event_id: String,
}

/// Opens one authenticated client per token against a Gradio space.
#[derive(Debug, Clone)]
pub struct GradioSpaceConnector {
    space_url: Url,
    timeout: Duration,
}

impl GradioSpaceConnector {
    pub fn new(space_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let space_url = Url::parse(space_url).context("invalid generation space URL")?;
        anyhow::ensure!(
            !space_url.cannot_be_a_base(),
            "generation space URL cannot carry a path: {space_url}"
        );
        Ok(Self { space_url, timeout })
    }

    pub fn space_url(&self) -> &Url {
        &self.space_url
    }
}

#[async_trait]
impl Connector for GradioSpaceConnector {
    type Handle = SpaceSession;

    async fn connect(&self, credential: &str) -> Result<SpaceSession, ServiceError> {
        let mut headers = HeaderMap::new();
        let mut bearer = HeaderValue::from_str(&format!("Bearer {credential}"))
            .map_err(|_| ServiceError::new("credential contains invalid header characters"))?;
        bearer.set_sensitive(true);
        headers.insert(AUTHORIZATION, bearer);

        let client = reqwest::Client::builder()
            .timeout(self.timeout)
            .default_headers(headers)
            .build()
            .map_err(|error| ServiceError::new(format!("failed to build HTTP client: {error}")))?;

        let session = SpaceSession {
            client,
            space_url: self.space_url.clone(),
        };
        let resp = session
            .client
            .get(session.url(&["config"])?)
            .send()
            .await
            .map_err(|error| ServiceError::new(format!("failed to reach space: {error}")))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ServiceError::from_http(status.as_u16(), &body));
        }

        debug!(space = %session.space_url, "Connected to generation space");
        Ok(session)
    }
}

/// An authenticated connection to the space, cached per credential.
#[derive(Debug, Clone)]
pub struct SpaceSession {
    client: reqwest::Client,
    space_url: Url,
}

impl SpaceSession {
    fn url(&self, segments: &[&str]) -> Result<Url, ServiceError> {
        let mut url = self.space_url.clone();
        url.path_segments_mut()
            .map_err(|()| {
                ServiceError::new(format!("space URL cannot carry a path: {}", self.space_url))
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// `POST /gradio_api/upload`; returns the server-side path of the file.
    pub async fn upload(&self, bytes: Vec<u8>, file_name: &str) -> Result<String, ServiceError> {
        let mime = mime_guess::from_path(file_name).first_or_octet_stream();
        let part = Part::bytes(bytes)
            .file_name(file_name.to_string())
            .mime_str(mime.essence_str())
            .map_err(|error| ServiceError::new(format!("invalid image content type: {error}")))?;
        let form = Form::new().part("files", part);

        let resp = self
            .client
            .post(self.url(&["gradio_api", "upload"])?)
            .multipart(form)
            .send()
            .await
            .map_err(|error| ServiceError::new(format!("upload failed: {error}")))?;
        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|error| ServiceError::new(format!("failed to read upload response: {error}")))?;
        if !status.is_success() {
            return Err(ServiceError::from_http(status.as_u16(), &body));
        }

        let paths: Vec<String> = serde_json::from_str(&body)
            .map_err(|error| ServiceError::new(format!("unexpected upload response: {error}")))?;
        paths
            .into_iter()
            .next()
            .ok_or_else(|| ServiceError::new("upload response listed no files"))
    }

    /// Queues a call and reads its event stream to the end. Returns the
    /// `data` array of the `complete` event.
    pub async fn predict(&self, api_name: &str, data: Vec<Value>) -> Result<Value, ServiceError> {
        let resp = self
            .client
            .post(self.url(&["gradio_api", "call", api_name])?)
            .json(&json!({ "data": data }))
            .send()
            .await
            .map_err(|error| ServiceError::new(format!("call to {api_name} failed: {error}")))?;
        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|error| ServiceError::new(format!("failed to read call response: {error}")))?;
        if !status.is_success() {
            return Err(ServiceError::from_http(status.as_u16(), &body));
        }
        let handle: EventHandle = serde_json::from_str(&body)
            .map_err(|error| ServiceError::new(format!("unexpected call response: {error}")))?;

        let resp = self
            .client
            .get(self.url(&["gradio_api", "call", api_name, &handle.event_id])?)
            .send()
            .await
            .map_err(|error| ServiceError::new(format!("event stream failed: {error}")))?;
        let status = resp.status();
        let stream = resp
            .text()
            .await
            .map_err(|error| ServiceError::new(format!("event stream interrupted: {error}")))?;
        if !status.is_success() {
            return Err(ServiceError::from_http(status.as_u16(), &stream));
        }

        parse_sse_result(&stream)
    }

    /// Resolves the output element into a URL that can be fetched directly.
    pub fn output_url(&self, data: &Value) -> Option<String> {
        extract_output_url(&self.space_url, data)
    }
}

/// Reads a Gradio event stream. `complete` yields its data payload,
/// `error` becomes a classified [`ServiceError`]; heartbeats and progress
/// events are skipped.
pub fn parse_sse_result(stream: &str) -> Result<Value, ServiceError> {
    let mut event = "";
    for line in stream.lines() {
        let line = line.trim_end_matches('\r');
        if let Some(name) = line.strip_prefix("event:") {
            event = name.trim();
            continue;
        }
        let Some(payload) = line.strip_prefix("data:") else {
            continue;
        };
        let payload = payload.trim();

        match event {
            "complete" => {
                return serde_json::from_str(payload).map_err(|error| {
                    ServiceError::new(format!("malformed completion payload: {error}"))
                });
            }
            "error" => {
                return Err(ServiceError::new(error_message(payload)));
            }
            _ => {}
        }
    }

    Err(ServiceError::new("event stream ended without a result"))
}

fn error_message(payload: &str) -> String {
    match serde_json::from_str::<Value>(payload) {
        Ok(Value::String(message)) => message,
        Ok(Value::Null) => "space reported an error without a message".to_string(),
        Ok(Value::Object(map)) => map
            .get("error")
            .or_else(|| map.get("message"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| payload.to_string()),
        _ if payload.is_empty() => "space reported an error without a message".to_string(),
        _ => payload.to_string(),
    }
}

/// Picks the output image out of a `complete` payload. Accepts a bare
/// URL, a Gradio file object with `url` or `path`, or a gallery whose
/// first entry is one of those.
pub fn extract_output_url(space_url: &Url, data: &Value) -> Option<String> {
    let first = match data {
        Value::Array(items) => items.first()?,
        other => other,
    };

    match first {
        Value::String(raw) if raw.starts_with("http://") || raw.starts_with("https://") => {
            Some(raw.clone())
        }
        Value::String(path) => file_url(space_url, path),
        Value::Object(map) => {
            if let Some(url) = map.get("url").and_then(Value::as_str) {
                return Some(url.to_string());
            }
            if let Some(path) = map.get("path").and_then(Value::as_str) {
                return file_url(space_url, path);
            }
            map.get("image")
                .and_then(|inner| extract_output_url(space_url, inner))
        }
        Value::Array(_) => extract_output_url(space_url, first),
        _ => None,
    }
}

/// `{space}/gradio_api/file={path}`, relative to any prefix the space URL
/// carries. The path stays unencoded; Gradio expects its slashes verbatim.
fn file_url(space_url: &Url, path: &str) -> Option<String> {
    let mut base = space_url.clone();
    if !base.path().ends_with('/') {
        let with_slash = format!("{}/", base.path());
        base.set_path(&with_slash);
    }
    base.join(&format!("gradio_api/file={path}"))
        .ok()
        .map(String::from)
}

/// Positional inputs of the camera-edit endpoint.
fn build_inputs(
    uploaded_path: &str,
    angle: CameraAngle,
    size: Dimensions,
    settings: &InferenceSettings,
) -> Vec<Value> {
    vec![
        json!({ "path": uploaded_path, "meta": { "_type": "gradio.FileData" } }),
        json!(angle.azimuth),
        json!(angle.elevation),
        json!(angle.distance),
        json!(settings.seed),
        json!(settings.randomize_seed),
        json!(settings.true_guidance_scale),
        json!(settings.num_inference_steps),
        json!(size.height),
        json!(size.width),
    ]
}

#[derive(Debug, Error)]
pub enum AngleGenerationError {
    #[error(transparent)]
    Angle(#[from] AngleError),
    #[error("failed to read source image: {0:#}")]
    Image(anyhow::Error),
    #[error(transparent)]
    Rotation(#[from] RotationError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedAngle {
    pub url: String,
    pub size: Dimensions,
}

pub struct AngleGenerator<C: Connector = GradioSpaceConnector> {
    rotator: Arc<CredentialRotator<C>>,
    settings: InferenceSettings,
}

impl AngleGenerator<GradioSpaceConnector> {
    pub fn from_config(config: &GenerationConfig) -> anyhow::Result<Self> {
        let connector = GradioSpaceConnector::new(&config.space_url, config.request_timeout())?;
        let rotator = CredentialRotator::new(connector, config.resolved_credentials());
        Ok(Self::new(Arc::new(rotator), InferenceSettings::from(config)))
    }
}

impl<C: Connector> AngleGenerator<C> {
    pub fn new(rotator: Arc<CredentialRotator<C>>, settings: InferenceSettings) -> Self {
        Self { rotator, settings }
    }

    pub fn rotator(&self) -> &CredentialRotator<C> {
        &self.rotator
    }

    pub fn settings(&self) -> &InferenceSettings {
        &self.settings
    }
}

impl AngleGenerator<GradioSpaceConnector> {
    /// Re-renders `image` from `angle` and returns the output image URL.
    pub async fn generate(
        &self,
        image: &[u8],
        file_name: &str,
        angle: CameraAngle,
    ) -> Result<GeneratedAngle, AngleGenerationError> {
        let (width, height) = image_dimensions(image).map_err(AngleGenerationError::Image)?;
        let source = Dimensions::new(width, height);
        let settings = &self.settings;

        let result = self
            .rotator
            .execute_degraded(source, &settings.resolution_caps, |session, size| async move {
                let path = session.upload(image.to_vec(), file_name).await?;
                let data = session
                    .predict(&settings.api_name, build_inputs(&path, angle, size, settings))
                    .await?;
                let url = session
                    .output_url(&data)
                    .ok_or_else(|| ServiceError::new("completion carried no output image"))?;
                Ok::<_, ServiceError>(GeneratedAngle { url, size })
            })
            .await?;

        info!(
            azimuth = angle.azimuth,
            elevation = angle.elevation,
            width = result.size.width,
            height = result.size.height,
            "Generated camera angle"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn space() -> Url {
        Url::parse("https://space.example").expect("url")
    }

    #[test]
    fn test_angle_grid_accepts_valid_points() {
        let angle = CameraAngle::new(315, -30, 1.4).expect("valid angle");
        assert_eq!(angle.azimuth(), 315);
        assert_eq!(angle.elevation(), -30);
        assert_eq!(angle.distance(), 1.4);
        assert!(CameraAngle::new(0, 60, 0.6).is_ok());
        assert!(CameraAngle::new(90, 0, 1.0000001).is_ok());
    }

    #[test]
    fn test_angle_grid_rejects_off_grid_values() {
        assert_eq!(CameraAngle::new(30, 0, 1.0), Err(AngleError::Azimuth(30)));
        assert_eq!(CameraAngle::new(360, 0, 1.0), Err(AngleError::Azimuth(360)));
        assert_eq!(CameraAngle::new(0, 90, 1.0), Err(AngleError::Elevation(90)));
        assert_eq!(CameraAngle::new(0, -60, 1.0), Err(AngleError::Elevation(-60)));
        assert_eq!(CameraAngle::new(0, 15, 1.0), Err(AngleError::Elevation(15)));
        assert_eq!(CameraAngle::new(0, 0, 0.8), Err(AngleError::Distance(0.8)));
    }

    #[test]
    fn test_sse_complete_returns_data() {
        let stream = "event: generating\ndata: null\n\nevent: heartbeat\ndata: null\n\n\
                      event: complete\ndata: [{\"url\": \"https://space.example/out.png\"}]\n\n";
        let data = parse_sse_result(stream).expect("complete event");
        assert_eq!(
            extract_output_url(&space(), &data).as_deref(),
            Some("https://space.example/out.png")
        );
    }

    #[test]
    fn test_sse_error_message_is_classified() {
        let err = parse_sse_result("event: error\ndata: \"CUDA out of memory\"\n\n")
            .expect_err("error event");
        assert!(err.is_transient());

        let err = parse_sse_result("event: error\ndata: \"You have exceeded your GPU quota\"\n\n")
            .expect_err("error event");
        assert!(err.is_quota());

        let err = parse_sse_result("event: error\ndata: null\n\n").expect_err("error event");
        assert!(err.message.contains("without a message"));
        assert!(!err.is_quota() && !err.is_transient());
    }

    #[test]
    fn test_sse_without_result_is_an_error() {
        let err = parse_sse_result("event: heartbeat\ndata: null\n\n").expect_err("no result");
        assert!(err.message.contains("without a result"));
    }

    #[test]
    fn test_output_url_from_path_and_gallery() {
        let data = json!([{ "path": "/tmp/gradio/out.webp" }]);
        assert_eq!(
            extract_output_url(&space(), &data).as_deref(),
            Some("https://space.example/gradio_api/file=/tmp/gradio/out.webp")
        );

        let gallery = json!([[{ "image": { "url": "https://cdn.example/a.png" } }]]);
        assert_eq!(
            extract_output_url(&space(), &gallery).as_deref(),
            Some("https://cdn.example/a.png")
        );

        assert_eq!(extract_output_url(&space(), &json!([])), None);
        assert_eq!(extract_output_url(&space(), &json!([42])), None);
    }

    #[test]
    fn test_urls_stay_under_space_prefix() {
        let proxied = Url::parse("https://host.example/proxy").expect("url");
        assert_eq!(
            file_url(&proxied, "/tmp/gradio/out.webp").as_deref(),
            Some("https://host.example/proxy/gradio_api/file=/tmp/gradio/out.webp")
        );

        let session = SpaceSession {
            client: reqwest::Client::new(),
            space_url: Url::parse("https://host.example/proxy/").expect("url"),
        };
        let events = session
            .url(&["gradio_api", "call", "infer", "ev/1?x"])
            .expect("url");
        assert_eq!(
            events.as_str(),
            "https://host.example/proxy/gradio_api/call/infer/ev%2F1%3Fx"
        );
    }

    #[test]
    fn test_inputs_carry_angle_and_size() {
        let settings = InferenceSettings::from(&GenerationConfig::default());
        let angle = CameraAngle::new(45, 30, 0.6).expect("angle");
        let inputs = build_inputs("/tmp/in.png", angle, Dimensions::new(768, 432), &settings);
        assert_eq!(inputs.len(), 10);
        assert_eq!(inputs[0]["path"], "/tmp/in.png");
        assert_eq!(inputs[1], json!(45));
        assert_eq!(inputs[2], json!(30));
        assert_eq!(inputs[3], json!(0.6));
        assert_eq!(inputs[8], json!(432));
        assert_eq!(inputs[9], json!(768));
    }
}
