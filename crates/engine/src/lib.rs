//! Ripple propagation engine
//!
//! Schedules recomputation of a reactive dependency graph in atomic turns.
//! Vertices are ordered by topological level; within a turn, each level's
//! working set may execute in parallel, and vertices may rewire their own
//! predecessor edges mid-turn (dynamic reattachment).

pub mod engine;
pub mod error;
pub mod flags;
pub mod graph;
pub mod queue;
pub mod shuffle;
pub mod turn;
pub mod types;
pub mod vertex;

pub use engine::{Engine, TickContext};
pub use error::{Error, Result};
pub use flags::VertexFlags;
pub use turn::Turn;
pub use types::{
    EngineConfig, TickObserver, TickSpan, TurnFlags, TurnId, TurnMode, VertexId,
};
pub use vertex::ReactiveNode;
