//! Vertex arena and static topology
//!
//! Owns every vertex record. Ids are dense arena indices and are never
//! reused. Static edge mutation happens outside any turn (enforced by
//! `&mut` access through the engine) and keeps levels consistent eagerly:
//! after every attach, each downstream vertex's level is one plus the
//! maximum of its predecessors' levels.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::debug;

use crate::error::{Error, Result};
use crate::flags::Flag;
use crate::types::VertexId;
use crate::vertex::{ReactiveNode, Vertex};

#[derive(Debug, Default)]
pub(crate) struct Graph {
    vertices: Vec<Option<Vertex>>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node and return its vertex id.
    pub fn add(&mut self, node: Arc<dyn ReactiveNode>) -> VertexId {
        let id = VertexId(self.vertices.len() as u32);
        let vertex = Vertex::new(node);
        vertex.flags.set(Flag::INITIAL);
        if vertex.node.is_input() {
            vertex.flags.set(Flag::ROOT);
        }
        debug!(vertex = %id, node_type = vertex.node.node_type(), "vertex created");
        self.vertices.push(Some(vertex));
        id
    }

    /// Destroy a vertex. Edges must have been detached first: a vertex is
    /// destroyed only once nothing references it.
    pub fn remove(&mut self, id: VertexId) {
        let vertex = self.vertex(id);
        {
            let edges = vertex.edges.read().expect("shift lock poisoned");
            assert!(
                edges.successors.is_empty() && edges.predecessors.is_empty(),
                "destroying vertex {id} with live edges"
            );
        }
        debug!(vertex = %id, "vertex destroyed");
        self.vertices[id.index()] = None;
    }

    pub fn vertex(&self, id: VertexId) -> &Vertex {
        self.vertices[id.index()]
            .as_ref()
            .unwrap_or_else(|| panic!("dead vertex id {id}"))
    }

    pub fn try_vertex(&self, id: VertexId) -> Option<&Vertex> {
        self.vertices.get(id.index()).and_then(|slot| slot.as_ref())
    }

    /// Add the edge parent → child, raising the child's level and its
    /// downstream closure as needed.
    pub fn attach(&mut self, child: VertexId, parent: VertexId) -> Result<()> {
        self.try_vertex(child).ok_or(Error::VertexNotFound(child))?;
        self.try_vertex(parent).ok_or(Error::VertexNotFound(parent))?;
        if child == parent || self.reaches(child, parent) {
            return Err(Error::CycleDetected { child, parent });
        }

        {
            let mut edges = self
                .vertex(parent)
                .edges
                .write()
                .expect("shift lock poisoned");
            edges.successors.push(child);
        }
        {
            let mut edges = self
                .vertex(child)
                .edges
                .write()
                .expect("shift lock poisoned");
            edges.predecessors.push(parent);
        }

        let parent_level = self.vertex(parent).level();
        let child_vertex = self.vertex(child);
        if parent_level >= child_vertex.level() {
            child_vertex.level.store(parent_level + 1, Ordering::Relaxed);
            self.invalidate_successors(child, false);
        }
        debug!(child = %child, parent = %parent, level = self.vertex(child).level(), "edge attached");
        Ok(())
    }

    /// Remove the edge parent → child. Levels are not lowered; monotonicity
    /// still holds with the remaining edges.
    pub fn detach(&mut self, child: VertexId, parent: VertexId) -> Result<()> {
        self.try_vertex(child).ok_or(Error::VertexNotFound(child))?;
        self.try_vertex(parent).ok_or(Error::VertexNotFound(parent))?;

        {
            let mut edges = self
                .vertex(parent)
                .edges
                .write()
                .expect("shift lock poisoned");
            edges.successors.retain(|&s| s != child);
        }
        {
            let mut edges = self
                .vertex(child)
                .edges
                .write()
                .expect("shift lock poisoned");
            edges.predecessors.retain(|&p| p != parent);
        }
        debug!(child = %child, parent = %parent, "edge detached");
        Ok(())
    }

    /// Recompute levels across the downstream closure of `root`: each
    /// descendant becomes one plus the maximum of its predecessors' levels.
    /// With `mark_repeated`, a still-queued descendant whose level changed
    /// gets the `repeated` flag so its re-execution is accounted for.
    pub fn invalidate_successors(&self, root: VertexId, mark_repeated: bool) {
        let mut frontier = VecDeque::new();
        frontier.push_back(root);

        while let Some(current) = frontier.pop_front() {
            for succ in self.vertex(current).successors() {
                let vertex = self.vertex(succ);
                let fresh = vertex
                    .predecessors()
                    .iter()
                    .map(|&p| self.vertex(p).level())
                    .max()
                    .map(|m| m + 1)
                    .unwrap_or(0);
                if fresh != vertex.level() {
                    vertex.level.store(fresh, Ordering::Relaxed);
                    if mark_repeated && vertex.flags.test(Flag::QUEUED) {
                        vertex.flags.set(Flag::REPEATED);
                    }
                    frontier.push_back(succ);
                }
            }
        }
    }

    /// True if `to` is reachable from `from` along successor edges.
    fn reaches(&self, from: VertexId, to: VertexId) -> bool {
        let mut seen = vec![false; self.vertices.len()];
        let mut frontier = VecDeque::new();
        frontier.push_back(from);
        while let Some(current) = frontier.pop_front() {
            if current == to {
                return true;
            }
            for succ in self.vertex(current).successors() {
                if !seen[succ.index()] {
                    seen[succ.index()] = true;
                    frontier.push_back(succ);
                }
            }
        }
        false
    }
}
