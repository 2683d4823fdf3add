//! One open storyboard: the canvas, the graph derived from it, and the
//! collaborators that jobs and merges talk to.
//!
//! Every canvas mutation happens inside a single `std::sync::Mutex`
//! critical section and rebuilds the graph before the lock is released, so
//! readers never see a graph that disagrees with the canvas. Nothing awaits
//! while a lock is held.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, bail, Context, Result};
use serde_json::{Map, Value};
use tracing::{debug, info};
use url::Url;
use uuid::Uuid;

use crate::canvas::{
    Canvas, Shape, META_CONTEXT, META_ELAPSED_SECONDS, META_PROMPT, META_STATUS, META_VIDEO_URL,
    PROP_END, PROP_IMAGE,
};
use crate::graph::FrameGraph;
use crate::jobs::backend::{media_file_name, ClipRequest, JobBackend};
use crate::jobs::registry::JobRegistry;
use crate::media::{fit_within, FrameExtractor, FramePosition};
use crate::types::{ImagePlacement, JobStatus};

pub const FRAMES_DIR_NAME: &str = "frames";
pub const MERGED_DIR_NAME: &str = "merged";
pub const DEFAULT_PLACEMENT_GAP: f64 = 80.0;

#[derive(Debug, Clone, PartialEq)]
pub struct SessionOptions {
    pub data_dir: PathBuf,
    pub placement_gap: f64,
}

impl SessionOptions {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            placement_gap: DEFAULT_PLACEMENT_GAP,
        }
    }
}

/// What a new child frame hangs off and what its arrow carries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChildSpec {
    pub job_id: Option<String>,
    pub status: Option<JobStatus>,
    pub video_url: Option<String>,
    pub prompt: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildFrame {
    pub frame_id: String,
    pub edge_id: String,
    pub branch_index: u32,
}

/// Result of writing a terminal `done` onto an edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedEdge {
    pub edge_id: String,
    pub downstream_frame: Option<String>,
}

#[derive(Clone)]
pub struct StoryboardSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    canvas: Mutex<Canvas>,
    graph: Mutex<Arc<FrameGraph>>,
    registry: Arc<JobRegistry>,
    backend: Arc<dyn JobBackend>,
    extractor: Arc<dyn FrameExtractor>,
    options: SessionOptions,
}

impl StoryboardSession {
    pub fn new(
        canvas: Canvas,
        backend: Arc<dyn JobBackend>,
        extractor: Arc<dyn FrameExtractor>,
        options: SessionOptions,
    ) -> Self {
        let graph = Arc::new(FrameGraph::reconstruct(canvas.shapes()));
        Self {
            inner: Arc::new(SessionInner {
                canvas: Mutex::new(canvas),
                graph: Mutex::new(graph),
                registry: Arc::new(JobRegistry::new()),
                backend,
                extractor,
                options,
            }),
        }
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.inner.registry
    }

    pub fn backend(&self) -> &Arc<dyn JobBackend> {
        &self.inner.backend
    }

    pub fn extractor(&self) -> &Arc<dyn FrameExtractor> {
        &self.inner.extractor
    }

    pub fn data_dir(&self) -> &Path {
        &self.inner.options.data_dir
    }

    pub fn placement_gap(&self) -> f64 {
        self.inner.options.placement_gap
    }

    fn lock_canvas(&self) -> MutexGuard<'_, Canvas> {
        self.inner
            .canvas
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn store_graph(&self, graph: FrameGraph) -> Arc<FrameGraph> {
        let graph = Arc::new(graph);
        let mut slot = self
            .inner
            .graph
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = Arc::clone(&graph);
        graph
    }

    /// Rebuilds the frame graph from the current canvas.
    pub fn reconstruct_graph(&self) -> Arc<FrameGraph> {
        let canvas = self.lock_canvas();
        self.store_graph(FrameGraph::reconstruct(canvas.shapes()))
    }

    /// Latest reconstructed graph. Cheap; callers keep the `Arc` as a
    /// consistent snapshot while the canvas moves on.
    pub fn graph(&self) -> Arc<FrameGraph> {
        let slot = self
            .inner
            .graph
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(&slot)
    }

    pub fn canvas_snapshot(&self) -> Canvas {
        self.lock_canvas().clone()
    }

    /// Runs `edit` against the canvas and rebuilds the graph if anything
    /// changed, all inside one critical section.
    pub fn with_canvas_mut<R>(&self, edit: impl FnOnce(&mut Canvas) -> R) -> R {
        let mut canvas = self.lock_canvas();
        let before = canvas.revision();
        let result = edit(&mut canvas);
        if canvas.revision() != before {
            self.store_graph(FrameGraph::reconstruct(canvas.shapes()));
        }
        result
    }

    pub fn edge_exists(&self, edge_id: &str) -> bool {
        self.lock_canvas()
            .get(edge_id)
            .is_some_and(Shape::is_arrow)
    }

    pub fn update_edge(&self, edge_id: &str, edit: impl FnOnce(&mut Map<String, Value>)) -> bool {
        self.with_canvas_mut(|canvas| {
            if !canvas.get(edge_id).is_some_and(Shape::is_arrow) {
                return false;
            }
            canvas.update_meta(edge_id, edit)
        })
    }

    pub fn set_elapsed_seconds(&self, edge_id: &str, seconds: u64) -> bool {
        self.update_edge(edge_id, |meta| {
            meta.insert(META_ELAPSED_SECONDS.to_string(), Value::from(seconds));
        })
    }

    pub fn mark_edge_failed(&self, edge_id: &str) -> bool {
        self.update_edge(edge_id, |meta| {
            meta.insert(
                META_STATUS.to_string(),
                Value::String(JobStatus::Error.as_str().to_string()),
            );
        })
    }

    /// Writes `done` and the media URL together. `None` if the arrow is gone.
    pub fn complete_edge(&self, edge_id: &str, video_url: &str) -> Option<CompletedEdge> {
        self.with_canvas_mut(|canvas| {
            let downstream_frame = {
                let edge = canvas.get(edge_id).filter(|shape| shape.is_arrow())?;
                edge.prop_str(PROP_END)
                    .filter(|target| canvas.get(target).is_some_and(Shape::is_frame))
                    .map(ToString::to_string)
            };

            canvas.update_meta(edge_id, |meta| {
                meta.insert(
                    META_STATUS.to_string(),
                    Value::String(JobStatus::Done.as_str().to_string()),
                );
                meta.insert(
                    META_VIDEO_URL.to_string(),
                    Value::String(video_url.to_string()),
                );
                meta.remove(META_ELAPSED_SECONDS);
            });

            Some(CompletedEdge {
                edge_id: edge_id.to_string(),
                downstream_frame,
            })
        })
    }

    pub fn set_frame_image(&self, frame_id: &str, image: &ImagePlacement) -> Result<bool> {
        let value = serde_json::to_value(image).context("failed to encode image placement")?;
        Ok(self.with_canvas_mut(|canvas| {
            canvas.get(frame_id).is_some_and(Shape::is_frame)
                && canvas.set_prop(frame_id, PROP_IMAGE, value)
        }))
    }

    pub fn insert_shape(&self, shape: Shape) -> Result<()> {
        self.with_canvas_mut(|canvas| canvas.insert(shape))
    }

    pub fn remove_shape(&self, shape_id: &str) -> Option<Shape> {
        self.with_canvas_mut(|canvas| canvas.remove(shape_id))
    }

    /// Adds a frame beside `parent_id` and links it with an arrow carrying
    /// the next free branch index. Siblings stack downwards by branch.
    pub fn insert_child_frame(&self, parent_id: &str, child: ChildSpec) -> Result<ChildFrame> {
        let gap = self.placement_gap();
        self.with_canvas_mut(|canvas| -> Result<ChildFrame> {
            let parent = canvas
                .get(parent_id)
                .filter(|shape| shape.is_frame())
                .ok_or_else(|| anyhow!("unknown frame: {parent_id}"))?;
            let (width, height) = parent.frame_size();
            let (parent_x, parent_y) = (parent.x, parent.y);

            let graph = FrameGraph::reconstruct(canvas.shapes());
            let branch_index = graph.next_branch_index(parent_id)?;

            let frame_id = format!("frame-{}", Uuid::new_v4());
            let edge_id = format!("arrow-{}", Uuid::new_v4());
            let frame = Shape::frame(
                frame_id.clone(),
                parent_x + width + gap,
                parent_y + f64::from(branch_index) * (height + gap),
                width,
                height,
            );

            let mut arrow =
                Shape::arrow(edge_id.clone(), parent_id, frame_id.clone(), branch_index);
            arrow = match (child.job_id, child.status) {
                (Some(job_id), status) => {
                    arrow.with_job(job_id, status.unwrap_or(JobStatus::Pending))
                }
                (None, Some(status)) => arrow.with_status(status),
                (None, None) => arrow,
            };
            if let Some(video_url) = child.video_url {
                arrow = arrow.with_video(video_url);
            }
            if let Some(prompt) = child.prompt {
                arrow
                    .meta
                    .insert(META_PROMPT.to_string(), Value::String(prompt));
            }

            canvas.insert(frame)?;
            canvas.insert(arrow)?;
            debug!(
                parent_id,
                frame_id = %frame_id,
                edge_id = %edge_id,
                branch_index,
                "Inserted child frame"
            );

            Ok(ChildFrame {
                frame_id,
                edge_id,
                branch_index,
            })
        })
    }

    /// Submits a clip job continuing from `parent_id` and records the
    /// pending arrow. Polling is started by the caller.
    pub async fn submit_clip(
        &self,
        parent_id: &str,
        prompt: &str,
    ) -> Result<(ChildFrame, String)> {
        let start_image_url = {
            let canvas = self.lock_canvas();
            let parent = canvas
                .get(parent_id)
                .filter(|shape| shape.is_frame())
                .ok_or_else(|| anyhow!("unknown frame: {parent_id}"))?;
            parent.image().map(|image| image.src)
        };

        let request = ClipRequest {
            prompt: prompt.to_string(),
            start_image_url,
            duration_seconds: None,
        };
        let submitted = self.inner.backend.submit_clip(&request).await?;
        if submitted.job_id.trim().is_empty() {
            bail!("job backend returned an empty job id");
        }

        let child = self.insert_child_frame(
            parent_id,
            ChildSpec {
                job_id: Some(submitted.job_id.clone()),
                status: Some(JobStatus::Pending),
                video_url: None,
                prompt: Some(prompt.to_string()),
            },
        )?;
        info!(job_id = %submitted.job_id, edge_id = %child.edge_id, "Clip job submitted");
        Ok((child, submitted.job_id))
    }

    pub fn pending_jobs(&self) -> Vec<(String, String)> {
        self.lock_canvas().pending_jobs()
    }

    /// Samples a frame of `media_url` and fits it into `frame_id` as its
    /// starting image.
    pub async fn attach_frame_image(
        &self,
        frame_id: &str,
        media_url: &str,
        position: FramePosition,
    ) -> Result<ImagePlacement> {
        let frame = self.inner.extractor.extract(media_url, position).await?;
        let (dest_width, dest_height) = {
            let canvas = self.lock_canvas();
            canvas
                .get(frame_id)
                .filter(|shape| shape.is_frame())
                .map(Shape::frame_size)
                .ok_or_else(|| anyhow!("frame {frame_id} no longer exists"))?
        };

        let placement = fit_within(
            f64::from(frame.width),
            f64::from(frame.height),
            dest_width,
            dest_height,
        )
        .ok_or_else(|| anyhow!("cannot fit {}x{} frame", frame.width, frame.height))?;

        let src = self.save_frame_png(&frame.png)?;
        let image = placement.into_image(src);
        if !self.set_frame_image(frame_id, &image)? {
            bail!("frame {frame_id} was removed before its image was attached");
        }
        Ok(image)
    }

    /// Uploads the clip for scene-context extraction and stores the result
    /// on the edge.
    pub async fn extract_context(&self, edge_id: &str, media_url: &str) -> Result<()> {
        let media = self.inner.backend.fetch_media(media_url).await?;
        let context = self
            .inner
            .backend
            .extract_context(media, &media_file_name(media_url))
            .await?;

        if !self.update_edge(edge_id, |meta| {
            meta.insert(META_CONTEXT.to_string(), context);
        }) {
            bail!("edge {edge_id} was removed before context was stored");
        }
        Ok(())
    }

    pub fn save_frame_png(&self, png: &[u8]) -> Result<String> {
        self.store_media(FRAMES_DIR_NAME, &format!("{}.png", Uuid::new_v4()), png)
    }

    /// Writes `bytes` under `<data_dir>/<subdir>/` and returns its `file://` URL.
    pub fn store_media(&self, subdir: &str, file_name: &str, bytes: &[u8]) -> Result<String> {
        let dir = self.data_dir().join(subdir);
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create media directory: {}", dir.display()))?;
        let dir = dir
            .canonicalize()
            .with_context(|| format!("failed to resolve media directory: {}", dir.display()))?;

        let path = dir.join(file_name);
        fs::write(&path, bytes)
            .with_context(|| format!("failed to write media file: {}", path.display()))?;

        Url::from_file_path(&path)
            .map(String::from)
            .map_err(|_| anyhow!("cannot express {} as a file URL", path.display()))
    }
}
