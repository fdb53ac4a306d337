//! Vertex records and the node capability trait
//!
//! A vertex is the engine's bookkeeping for one reactive node: its level,
//! wait-count, status flags, and shift-locked edge lists. The node's own
//! behaviour lives behind [`ReactiveNode`].

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::engine::TickContext;
use crate::error::Result;
use crate::flags::VertexFlags;
use crate::turn::Turn;
use crate::types::VertexId;

/// Predecessor and successor id lists, guarded by the vertex's shift lock.
#[derive(Debug, Default)]
pub(crate) struct EdgeLists {
    pub predecessors: Vec<VertexId>,
    pub successors: Vec<VertexId>,
}

/// Engine-side record for one vertex.
pub(crate) struct Vertex {
    pub node: Arc<dyn ReactiveNode>,
    /// Shift lock: writer for edge mutation, reader for pulse fan-out and
    /// level recomputation.
    pub edges: RwLock<EdgeLists>,
    pub flags: VertexFlags,
    /// One plus the maximum predecessor level; sources sit at 0.
    pub level: AtomicU32,
    /// Marked predecessors still to settle this turn. Counts down; an
    /// underflow is a mark inconsistency.
    pub wait_count: AtomicU32,
    /// At least one marked predecessor pulsed this turn.
    pub should_update: AtomicBool,
    /// Turn-id holding this vertex's participation; 0 when free.
    pub owner: AtomicU64,
    /// Last turn in which the vertex pulsed, idled, or was skip-settled.
    pub settled_turn: AtomicU64,
}

impl Vertex {
    pub fn new(node: Arc<dyn ReactiveNode>) -> Self {
        Self {
            node,
            edges: RwLock::new(EdgeLists::default()),
            flags: VertexFlags::new(),
            level: AtomicU32::new(0),
            wait_count: AtomicU32::new(0),
            should_update: AtomicBool::new(false),
            owner: AtomicU64::new(0),
            settled_turn: AtomicU64::new(0),
        }
    }

    pub fn level(&self) -> u32 {
        self.level.load(Ordering::Relaxed)
    }

    pub fn settled_in(&self, turn_id: u64) -> bool {
        self.settled_turn.load(Ordering::Acquire) == turn_id
    }

    /// Snapshot the successor list under the shift lock's read side.
    pub fn successors(&self) -> Vec<VertexId> {
        self.edges.read().expect("shift lock poisoned").successors.clone()
    }

    /// Snapshot the predecessor list under the shift lock's read side.
    pub fn predecessors(&self) -> Vec<VertexId> {
        self.edges.read().expect("shift lock poisoned").predecessors.clone()
    }
}

impl std::fmt::Debug for Vertex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vertex")
            .field("node_type", &self.node.node_type())
            .field("level", &self.level())
            .finish_non_exhaustive()
    }
}

/// Behaviour the engine requires of every reactive node.
///
/// Nodes are shared across the engine and any typed handles the driver
/// holds, and their `tick` runs on worker threads, so implementations use
/// interior mutability for their own state.
pub trait ReactiveNode: Send + Sync {
    /// Recompute this vertex for the turn. Must end by calling exactly one
    /// of [`TickContext::pulse`] or [`TickContext::idle_pulse`], or by
    /// returning early after a level-raising
    /// [`TickContext::attach_parent`].
    ///
    /// Input vertices are never ticked; the default panics.
    fn tick(&self, cx: &TickContext<'_>) -> Result<()>;

    /// Input vertices: absorb externally submitted values for this turn and
    /// report whether anything changed. Non-input vertices keep the
    /// default.
    fn apply_input(&self, _turn: &Turn) -> bool {
        false
    }

    /// Number of predecessors this node was constructed with.
    fn dependency_count(&self) -> usize;

    fn is_input(&self) -> bool {
        false
    }

    /// Whether this node may rewire its own predecessors mid-turn.
    fn is_dynamic(&self) -> bool {
        false
    }

    /// Short static name for logs and instrumentation.
    fn node_type(&self) -> &'static str;
}
