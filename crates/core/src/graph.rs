use std::collections::{BTreeMap, HashMap, HashSet};

use petgraph::stable_graph::{EdgeIndex, NodeIndex, StableDiGraph};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::canvas::{
    Shape, META_BRANCH_INDEX, META_JOB_ID, META_STATUS, META_VIDEO_URL, PROP_END, PROP_START,
};
use crate::types::{ImagePlacement, JobStatus};

#[derive(Debug, Clone, PartialEq)]
pub struct FrameNode {
    pub id: String,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    pub image: Option<ImagePlacement>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FrameEdge {
    pub id: String,
    pub source: String,
    pub target: String,
    pub branch_index: u32,
    pub job_id: Option<String>,
    pub status: Option<JobStatus>,
    pub video_url: Option<String>,
    /// Position of the arrow in the canvas document.
    pub canvas_order: usize,
}

impl FrameEdge {
    /// The clip URL, if this edge finished successfully.
    pub fn completed_media(&self) -> Option<&str> {
        if self.status != Some(JobStatus::Done) {
            return None;
        }

        self.video_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChildLink {
    pub edge_id: String,
    pub node_id: String,
    pub branch_index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("duplicate frame id: {0}")]
    DuplicateNode(String),
    #[error("duplicate edge id: {0}")]
    DuplicateEdge(String),
    #[error("unknown frame id: {0}")]
    UnknownNode(String),
    #[error("edge '{edge}' connects frame '{node}' to itself")]
    SelfLoop { edge: String, node: String },
    #[error("edge '{edge}' would give frame '{node}' a second parent")]
    SharedParent { edge: String, node: String },
    #[error("branch index {branch_index} is already used under frame '{parent}'")]
    DuplicateBranch { parent: String, branch_index: u32 },
    #[error("cycle detected at frame '{0}'")]
    Cycle(String),
    #[error("no branch index left under frame '{0}'")]
    BranchIndexExhausted(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RejectedEdge {
    pub edge_id: String,
    pub reason: GraphError,
}

/// Tree of frames joined by clip edges, derived from the canvas.
///
/// `insert_node` and `attach_edge` are the only ways in; both refuse
/// anything that would break the tree shape, so every query can assume a
/// forest with unique sibling branch indices.
#[derive(Debug, Clone, Default)]
pub struct FrameGraph {
    graph: StableDiGraph<FrameNode, FrameEdge>,
    node_ids: HashMap<String, NodeIndex>,
    edge_ids: HashMap<String, EdgeIndex>,
    rejected: Vec<RejectedEdge>,
}

impl FrameGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds the graph from scratch out of a shape list.
    pub fn reconstruct(shapes: &[Shape]) -> Self {
        let mut graph = Self::new();

        for shape in shapes.iter().filter(|shape| shape.is_frame()) {
            let (width, height) = shape.frame_size();
            let node = FrameNode {
                id: shape.id.clone(),
                x: shape.x,
                y: shape.y,
                width,
                height,
                image: shape.image(),
            };
            if let Err(err) = graph.insert_node(node) {
                debug!(shape_id = %shape.id, error = %err, "Skipping frame shape");
            }
        }

        let mut pending_unindexed = Vec::new();
        for (canvas_order, shape) in shapes.iter().enumerate() {
            if !shape.is_arrow() {
                continue;
            }

            let (Some(source), Some(target)) = (shape.prop_str(PROP_START), shape.prop_str(PROP_END))
            else {
                debug!(shape_id = %shape.id, "Skipping arrow without both bindings");
                continue;
            };

            let mut edge = FrameEdge {
                id: shape.id.clone(),
                source: source.to_string(),
                target: target.to_string(),
                branch_index: 0,
                job_id: shape.meta_str(META_JOB_ID).map(ToString::to_string),
                status: shape.meta_str(META_STATUS).map(JobStatus::parse_lenient),
                video_url: shape.meta_str(META_VIDEO_URL).map(ToString::to_string),
                canvas_order,
            };

            match shape
                .meta_u64(META_BRANCH_INDEX)
                .and_then(|raw| u32::try_from(raw).ok())
            {
                Some(branch_index) => {
                    edge.branch_index = branch_index;
                    graph.attach_or_reject(edge);
                }
                None => pending_unindexed.push(edge),
            }
        }

        // Arrows without an explicit index take the next free slot under
        // their parent, in canvas order, once explicit indices are placed.
        for mut edge in pending_unindexed {
            match graph.next_branch_index(&edge.source) {
                Ok(branch_index) => {
                    edge.branch_index = branch_index;
                    graph.attach_or_reject(edge);
                }
                Err(reason) => graph.reject(edge.id, reason),
            }
        }

        graph
    }

    fn attach_or_reject(&mut self, edge: FrameEdge) {
        let edge_id = edge.id.clone();
        if let Err(reason) = self.attach_edge(edge) {
            self.reject(edge_id, reason);
        }
    }

    fn reject(&mut self, edge_id: String, reason: GraphError) {
        warn!(edge_id = %edge_id, error = %reason, "Rejected arrow while rebuilding frame graph");
        self.rejected.push(RejectedEdge { edge_id, reason });
    }

    pub fn insert_node(&mut self, node: FrameNode) -> Result<NodeIndex, GraphError> {
        if self.node_ids.contains_key(&node.id) {
            return Err(GraphError::DuplicateNode(node.id));
        }

        let node_id = node.id.clone();
        let index = self.graph.add_node(node);
        self.node_ids.insert(node_id, index);
        Ok(index)
    }

    pub fn attach_edge(&mut self, edge: FrameEdge) -> Result<EdgeIndex, GraphError> {
        if self.edge_ids.contains_key(&edge.id) {
            return Err(GraphError::DuplicateEdge(edge.id));
        }
        let source_idx = self.index_of(&edge.source)?;
        let target_idx = self.index_of(&edge.target)?;

        if source_idx == target_idx {
            return Err(GraphError::SelfLoop {
                edge: edge.id,
                node: edge.target,
            });
        }

        if self
            .graph
            .edges_directed(target_idx, Direction::Incoming)
            .next()
            .is_some()
        {
            return Err(GraphError::SharedParent {
                edge: edge.id,
                node: edge.target,
            });
        }

        if self
            .graph
            .edges_directed(source_idx, Direction::Outgoing)
            .any(|sibling| sibling.weight().branch_index == edge.branch_index)
        {
            return Err(GraphError::DuplicateBranch {
                parent: edge.source,
                branch_index: edge.branch_index,
            });
        }

        if self.ancestors_of(source_idx)?.contains(&target_idx) {
            return Err(GraphError::Cycle(edge.target));
        }

        let edge_id = edge.id.clone();
        let index = self.graph.add_edge(source_idx, target_idx, edge);
        self.edge_ids.insert(edge_id, index);
        Ok(index)
    }

    pub fn rejected(&self) -> &[RejectedEdge] {
        &self.rejected
    }

    pub fn node_count(&self) -> usize {
        self.node_ids.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edge_ids.len()
    }

    pub fn node(&self, node_id: &str) -> Option<&FrameNode> {
        self.node_ids
            .get(node_id)
            .and_then(|&idx| self.graph.node_weight(idx))
    }

    pub fn edge(&self, edge_id: &str) -> Option<&FrameEdge> {
        self.edge_ids
            .get(edge_id)
            .and_then(|&idx| self.graph.edge_weight(idx))
    }

    pub fn parent_edge(&self, node_id: &str) -> Option<&FrameEdge> {
        let idx = *self.node_ids.get(node_id)?;
        self.graph
            .edges_directed(idx, Direction::Incoming)
            .next()
            .map(|edge| edge.weight())
    }

    /// Frames without an incoming edge, in insertion order.
    pub fn roots(&self) -> Vec<&FrameNode> {
        self.graph
            .node_indices()
            .filter(|&idx| {
                self.graph
                    .edges_directed(idx, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .map(|idx| &self.graph[idx])
            .collect()
    }

    /// Outgoing edges with their child frames, ascending by branch index.
    pub fn children(&self, node_id: &str) -> Vec<(&FrameEdge, &FrameNode)> {
        let Some(&idx) = self.node_ids.get(node_id) else {
            return Vec::new();
        };

        let mut children: Vec<(&FrameEdge, &FrameNode)> = self
            .graph
            .edges_directed(idx, Direction::Outgoing)
            .map(|edge| (edge.weight(), &self.graph[edge.target()]))
            .collect();
        children.sort_by(|(a, _), (b, _)| {
            a.branch_index
                .cmp(&b.branch_index)
                .then_with(|| a.canvas_order.cmp(&b.canvas_order))
        });
        children
    }

    /// Every frame with its ordered children.
    pub fn adjacency(&self) -> BTreeMap<String, Vec<ChildLink>> {
        self.node_ids
            .keys()
            .map(|node_id| {
                let links = self
                    .children(node_id)
                    .into_iter()
                    .map(|(edge, child)| ChildLink {
                        edge_id: edge.id.clone(),
                        node_id: child.id.clone(),
                        branch_index: edge.branch_index,
                    })
                    .collect();
                (node_id.clone(), links)
            })
            .collect()
    }

    /// One past the highest sibling index, or 0 for a frame with no
    /// children. Fails once a sibling already sits at `u32::MAX`.
    pub fn next_branch_index(&self, node_id: &str) -> Result<u32, GraphError> {
        match self
            .children(node_id)
            .iter()
            .map(|(edge, _)| edge.branch_index)
            .max()
        {
            Some(highest) => highest
                .checked_add(1)
                .ok_or_else(|| GraphError::BranchIndexExhausted(node_id.to_string())),
            None => Ok(0),
        }
    }

    /// Root-to-node frame sequence; empty for an unknown frame.
    pub fn frame_path(&self, node_id: &str) -> Vec<&FrameNode> {
        let Some(&idx) = self.node_ids.get(node_id) else {
            return Vec::new();
        };

        match self.ancestors_of(idx) {
            Ok(mut chain) => {
                chain.reverse();
                chain.push(idx);
                chain.into_iter().map(|i| &self.graph[i]).collect()
            }
            Err(err) => {
                warn!(node_id, error = %err, "Frame path walk aborted");
                Vec::new()
            }
        }
    }

    /// Incoming edges along `frame_path`, root side first. The root has no
    /// incoming edge, so this is one shorter than the frame path.
    pub fn path_edges(&self, node_id: &str) -> Vec<&FrameEdge> {
        self.frame_path(node_id)
            .into_iter()
            .filter_map(|node| self.parent_edge(&node.id))
            .collect()
    }

    /// Depth-first pre-order walk of every edge below `node_id`, following
    /// branch-index order at each frame.
    pub fn subtree_edges(&self, node_id: &str) -> Result<Vec<&FrameEdge>, GraphError> {
        if !self.node_ids.contains_key(node_id) {
            return Err(GraphError::UnknownNode(node_id.to_string()));
        }

        let mut ordered = Vec::new();
        let mut visited: HashSet<&str> = HashSet::from([node_id]);
        let mut stack: Vec<&FrameEdge> = self
            .children(node_id)
            .into_iter()
            .rev()
            .map(|(edge, _)| edge)
            .collect();

        while let Some(edge) = stack.pop() {
            if !visited.insert(edge.target.as_str()) {
                return Err(GraphError::Cycle(edge.target.clone()));
            }
            ordered.push(edge);
            stack.extend(
                self.children(&edge.target)
                    .into_iter()
                    .rev()
                    .map(|(child_edge, _)| child_edge),
            );
        }

        Ok(ordered)
    }

    /// Every root-to-leaf frame path, roots and branches in order.
    pub fn leaf_paths(&self) -> Vec<Vec<&FrameNode>> {
        let mut paths = Vec::new();
        for root in self.roots() {
            let mut stack = vec![root];
            while let Some(node) = stack.pop() {
                let children = self.children(&node.id);
                if children.is_empty() {
                    paths.push(self.frame_path(&node.id));
                }
                stack.extend(children.into_iter().rev().map(|(_, child)| child));
            }
        }
        paths
    }

    fn index_of(&self, node_id: &str) -> Result<NodeIndex, GraphError> {
        self.node_ids
            .get(node_id)
            .copied()
            .ok_or_else(|| GraphError::UnknownNode(node_id.to_string()))
    }

    /// Parents of `idx`, nearest first.
    fn ancestors_of(&self, idx: NodeIndex) -> Result<Vec<NodeIndex>, GraphError> {
        let mut chain = Vec::new();
        let mut seen = HashSet::from([idx]);
        let mut current = idx;

        while let Some(edge) = self
            .graph
            .edges_directed(current, Direction::Incoming)
            .next()
        {
            current = edge.source();
            if !seen.insert(current) {
                return Err(GraphError::Cycle(self.graph[current].id.clone()));
            }
            chain.push(current);
        }

        Ok(chain)
    }
}
