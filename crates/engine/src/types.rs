//! Core engine types
//!
//! Identifiers, turn flags, configuration, and the instrumentation sink.

use std::fmt;

/// Dense arena index identifying a vertex. Indices are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VertexId(pub u32);

impl VertexId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for VertexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Monotonically increasing turn identifier. Ids start at 1; 0 is reserved
/// as the "no turn" sentinel in per-vertex bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TurnId(pub u64);

impl fmt::Display for TurnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// Per-turn flag set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TurnFlags(u8);

impl TurnFlags {
    /// The turn consents to being merged with another consenting turn
    /// before propagation.
    pub const ALLOW_MERGING: TurnFlags = TurnFlags(1);

    pub const fn empty() -> Self {
        TurnFlags(0)
    }

    pub const fn contains(self, other: TurnFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: TurnFlags) -> TurnFlags {
        TurnFlags(self.0 | other.0)
    }
}

/// How turns are admitted relative to each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnMode {
    /// One turn at a time, strictly in turn-id order.
    Exclusive,
    /// Turns with disjoint marked sets propagate concurrently; conflicting
    /// turns are ordered by turn-id at the marking gate.
    Concurrent,
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub turn_mode: TurnMode,
    /// Execute each level's working set on the worker pool.
    pub parallel: bool,
    /// Size of the dedicated rayon pool. `None` uses the global pool.
    pub worker_threads: Option<usize>,
    /// Sequential mode only: permute each working set with this seed before
    /// executing it. Exercises order independence within a level.
    pub level_shuffle_seed: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            turn_mode: TurnMode::Exclusive,
            parallel: false,
            worker_threads: None,
            level_shuffle_seed: None,
        }
    }
}

/// Timing record for one vertex execution, in nanoseconds measured from the
/// engine's construction epoch.
#[derive(Debug, Clone, Copy)]
pub struct TickSpan {
    pub vertex: VertexId,
    pub turn: TurnId,
    pub began_ns: u64,
    pub ended_ns: u64,
}

/// Injected instrumentation sink, invoked after every vertex execution.
pub type TickObserver = Box<dyn Fn(TickSpan) + Send + Sync>;
