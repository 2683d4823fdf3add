use std::fmt;
use std::str::FromStr;

use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::graph::{FrameEdge, FrameGraph, GraphError};
use crate::media::FramePosition;
use crate::session::{ChildSpec, StoryboardSession, MERGED_DIR_NAME};
use crate::types::JobStatus;

pub const MIN_CLIPS_TO_MERGE: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergeMode {
    /// Every completed clip below the node, depth-first in branch order.
    #[default]
    Subtree,
    /// Only the clips on the way from the root down to the node.
    Path,
}

impl MergeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Subtree => "subtree",
            Self::Path => "path",
        }
    }
}

impl fmt::Display for MergeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MergeMode {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "subtree" => Ok(Self::Subtree),
            "path" => Ok(Self::Path),
            other => Err(format!("unknown merge mode: {other} (expected subtree or path)")),
        }
    }
}

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("need at least two completed clips to merge, found {found}")]
    NotEnoughClips { found: usize },
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error("merge request failed: {0:#}")]
    Collaborator(anyhow::Error),
    #[error("failed to store merged clip: {0:#}")]
    Storage(anyhow::Error),
}

impl MergeError {
    /// Rejections the user can fix by completing more clips or picking
    /// another node, as opposed to failures of the merge service itself.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::NotEnoughClips { .. } | Self::Graph(_))
    }
}

/// Clip URLs in concatenation order plus the frame the chain ends at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectedChain {
    pub urls: Vec<String>,
    pub terminal_node: String,
    pub skipped_edges: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    pub mode: MergeMode,
    pub urls: Vec<String>,
    pub merged_url: String,
    pub frame_id: String,
    pub edge_id: String,
    pub thumbnail_attached: bool,
}

/// Walks the graph from `node_id` and keeps only finished clips, in order.
pub fn collect_clip_urls(
    graph: &FrameGraph,
    node_id: &str,
    mode: MergeMode,
) -> Result<CollectedChain, GraphError> {
    if graph.node(node_id).is_none() {
        return Err(GraphError::UnknownNode(node_id.to_string()));
    }

    let edges: Vec<&FrameEdge> = match mode {
        MergeMode::Subtree => graph.subtree_edges(node_id)?,
        MergeMode::Path => graph.path_edges(node_id),
    };

    let terminal_node = match mode {
        MergeMode::Subtree => edges
            .last()
            .map(|edge| edge.target.clone())
            .unwrap_or_else(|| node_id.to_string()),
        MergeMode::Path => node_id.to_string(),
    };

    let mut urls = Vec::new();
    let mut skipped_edges = Vec::new();
    for edge in edges {
        match edge.completed_media() {
            Some(url) => urls.push(url.to_string()),
            None => skipped_edges.push(edge.id.clone()),
        }
    }

    Ok(CollectedChain {
        urls,
        terminal_node,
        skipped_edges,
    })
}

/// Merges a chain of clips and splices the result back onto the canvas.
#[derive(Clone)]
pub struct ChainMerger {
    session: StoryboardSession,
}

impl ChainMerger {
    pub fn new(session: StoryboardSession) -> Self {
        Self { session }
    }

    pub async fn merge(&self, node_id: &str, mode: MergeMode) -> Result<MergeOutcome, MergeError> {
        let graph = self.session.reconstruct_graph();
        let chain = collect_clip_urls(&graph, node_id, mode)?;
        if chain.urls.len() < MIN_CLIPS_TO_MERGE {
            return Err(MergeError::NotEnoughClips {
                found: chain.urls.len(),
            });
        }
        if !chain.skipped_edges.is_empty() {
            info!(
                skipped = chain.skipped_edges.len(),
                "Skipping unfinished clips in merge"
            );
        }

        let bytes = self
            .session
            .backend()
            .merge_videos(&chain.urls)
            .await
            .map_err(MergeError::Collaborator)?;

        let file_name = format!("merged_{}.mp4", Uuid::new_v4());
        let merged_url = self
            .session
            .store_media(MERGED_DIR_NAME, &file_name, &bytes)
            .map_err(MergeError::Storage)?;

        let child = self
            .session
            .insert_child_frame(
                &chain.terminal_node,
                ChildSpec {
                    status: Some(JobStatus::Done),
                    video_url: Some(merged_url.clone()),
                    ..Default::default()
                },
            )
            .map_err(MergeError::Storage)?;
        self.session.reconstruct_graph();
        info!(
            mode = %mode,
            clips = chain.urls.len(),
            frame_id = %child.frame_id,
            "Merged clip chain"
        );

        let thumbnail_attached = match self
            .session
            .attach_frame_image(&child.frame_id, &merged_url, FramePosition::First)
            .await
        {
            Ok(_) => true,
            Err(error) => {
                warn!(frame_id = %child.frame_id, "Merged thumbnail failed: {error:#}");
                false
            }
        };

        Ok(MergeOutcome {
            mode,
            urls: chain.urls,
            merged_url,
            frame_id: child.frame_id,
            edge_id: child.edge_id,
            thumbnail_attached,
        })
    }
}
