//! Canvas document: the flat, loosely-typed shape list the editor hands us.
//!
//! Frames and arrows carry free-form `props`/`meta` objects. Nothing here
//! interprets them beyond the keys below; `graph::FrameGraph::reconstruct`
//! turns them into typed records.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::{ImagePlacement, JobStatus};

pub const SHAPE_FRAME: &str = "frame";
pub const SHAPE_ARROW: &str = "arrow";

pub const PROP_WIDTH: &str = "w";
pub const PROP_HEIGHT: &str = "h";
pub const PROP_IMAGE: &str = "image";
pub const PROP_START: &str = "start";
pub const PROP_END: &str = "end";

pub const META_JOB_ID: &str = "job_id";
pub const META_STATUS: &str = "status";
pub const META_VIDEO_URL: &str = "video_url";
pub const META_BRANCH_INDEX: &str = "branch_index";
pub const META_ELAPSED_SECONDS: &str = "elapsed_seconds";
pub const META_CONTEXT: &str = "context";
pub const META_PROMPT: &str = "prompt";

pub const DEFAULT_FRAME_WIDTH: f64 = 640.0;
pub const DEFAULT_FRAME_HEIGHT: f64 = 360.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shape {
    pub id: String,
    #[serde(rename = "type")]
    pub shape_type: String,
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    #[serde(default)]
    pub props: Map<String, Value>,
    #[serde(default)]
    pub meta: Map<String, Value>,
    /// Keys this client does not interpret, written back untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Shape {
    pub fn frame(id: impl Into<String>, x: f64, y: f64, width: f64, height: f64) -> Self {
        let mut props = Map::new();
        props.insert(PROP_WIDTH.to_string(), Value::from(width));
        props.insert(PROP_HEIGHT.to_string(), Value::from(height));
        Self {
            id: id.into(),
            shape_type: SHAPE_FRAME.to_string(),
            x,
            y,
            props,
            meta: Map::new(),
            extra: Map::new(),
        }
    }

    pub fn arrow(
        id: impl Into<String>,
        start: impl Into<String>,
        end: impl Into<String>,
        branch_index: u32,
    ) -> Self {
        let mut props = Map::new();
        props.insert(PROP_START.to_string(), Value::String(start.into()));
        props.insert(PROP_END.to_string(), Value::String(end.into()));
        let mut meta = Map::new();
        meta.insert(META_BRANCH_INDEX.to_string(), Value::from(branch_index));
        Self {
            id: id.into(),
            shape_type: SHAPE_ARROW.to_string(),
            x: 0.0,
            y: 0.0,
            props,
            meta,
            extra: Map::new(),
        }
    }

    pub fn with_job(mut self, job_id: impl Into<String>, status: JobStatus) -> Self {
        self.meta
            .insert(META_JOB_ID.to_string(), Value::String(job_id.into()));
        self.with_status(status)
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.meta.insert(
            META_STATUS.to_string(),
            Value::String(status.as_str().to_string()),
        );
        self
    }

    pub fn with_video(mut self, video_url: impl Into<String>) -> Self {
        self.meta
            .insert(META_VIDEO_URL.to_string(), Value::String(video_url.into()));
        self
    }

    pub fn is_frame(&self) -> bool {
        self.shape_type == SHAPE_FRAME
    }

    pub fn is_arrow(&self) -> bool {
        self.shape_type == SHAPE_ARROW
    }

    pub fn prop_f64(&self, key: &str) -> Option<f64> {
        self.props.get(key).and_then(Value::as_f64)
    }

    pub fn prop_str(&self, key: &str) -> Option<&str> {
        self.props.get(key).and_then(Value::as_str)
    }

    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.meta.get(key).and_then(Value::as_str)
    }

    pub fn meta_u64(&self, key: &str) -> Option<u64> {
        self.meta.get(key).and_then(Value::as_u64)
    }

    pub fn frame_size(&self) -> (f64, f64) {
        (
            self.prop_f64(PROP_WIDTH).unwrap_or(DEFAULT_FRAME_WIDTH),
            self.prop_f64(PROP_HEIGHT).unwrap_or(DEFAULT_FRAME_HEIGHT),
        )
    }

    pub fn image(&self) -> Option<ImagePlacement> {
        self.props
            .get(PROP_IMAGE)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CanvasDocument {
    #[serde(default)]
    pub shapes: Vec<Shape>,
}

/// In-memory canvas. Shape order is the document order and is preserved
/// across edits; it doubles as the stable secondary ordering key.
#[derive(Debug, Clone, Default)]
pub struct Canvas {
    shapes: Vec<Shape>,
    index: HashMap<String, usize>,
    revision: u64,
}

impl Canvas {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_document(document: CanvasDocument) -> Result<Self> {
        let mut canvas = Self::new();
        for shape in document.shapes {
            canvas.insert(shape)?;
        }
        canvas.revision = 0;
        Ok(canvas)
    }

    pub fn to_document(&self) -> CanvasDocument {
        CanvasDocument {
            shapes: self.shapes.clone(),
        }
    }

    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read canvas file: {}", path.display()))?;
        if raw.trim().is_empty() {
            return Ok(Self::new());
        }

        let document: CanvasDocument = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse canvas JSON: {}", path.display()))?;
        Self::from_document(document)
            .with_context(|| format!("invalid canvas document: {}", path.display()))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create canvas directory: {}", parent.display())
            })?;
        }

        let encoded = serde_json::to_string_pretty(&self.to_document())
            .context("failed to serialize canvas JSON")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write canvas file: {}", path.display()))
    }

    pub fn shapes(&self) -> &[Shape] {
        &self.shapes
    }

    pub fn get(&self, id: &str) -> Option<&Shape> {
        self.index.get(id).map(|&pos| &self.shapes[pos])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Bumped on every effective mutation.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn insert(&mut self, shape: Shape) -> Result<()> {
        if self.index.contains_key(&shape.id) {
            bail!("duplicate shape id: {}", shape.id);
        }

        self.index.insert(shape.id.clone(), self.shapes.len());
        self.shapes.push(shape);
        self.revision += 1;
        Ok(())
    }

    pub fn remove(&mut self, id: &str) -> Option<Shape> {
        let pos = self.index.remove(id)?;
        let removed = self.shapes.remove(pos);
        for slot in self.index.values_mut() {
            if *slot > pos {
                *slot -= 1;
            }
        }
        self.revision += 1;
        Some(removed)
    }

    /// Applies `edit` to a shape's metadata. Returns false if the shape is
    /// gone; the revision only moves when the metadata actually changed.
    pub fn update_meta<F>(&mut self, id: &str, edit: F) -> bool
    where
        F: FnOnce(&mut Map<String, Value>),
    {
        let Some(&pos) = self.index.get(id) else {
            return false;
        };

        let shape = &mut self.shapes[pos];
        let before = shape.meta.clone();
        edit(&mut shape.meta);
        if shape.meta != before {
            self.revision += 1;
        }
        true
    }

    pub fn set_prop(&mut self, id: &str, key: &str, value: Value) -> bool {
        let Some(&pos) = self.index.get(id) else {
            return false;
        };

        let shape = &mut self.shapes[pos];
        if shape.props.get(key) != Some(&value) {
            shape.props.insert(key.to_string(), value);
            self.revision += 1;
        }
        true
    }

    /// Arrows that carry a job id and have not reached a terminal status.
    pub fn pending_jobs(&self) -> Vec<(String, String)> {
        self.shapes
            .iter()
            .filter(|shape| shape.is_arrow())
            .filter(|shape| {
                shape
                    .meta_str(META_STATUS)
                    .map(JobStatus::parse_lenient)
                    .is_some_and(|status| status == JobStatus::Pending)
            })
            .filter_map(|shape| {
                let job_id = shape.meta_str(META_JOB_ID)?.trim();
                (!job_id.is_empty()).then(|| (shape.id.clone(), job_id.to_string()))
            })
            .collect()
    }
}
