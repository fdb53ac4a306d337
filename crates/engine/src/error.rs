//! Engine errors

use thiserror::Error;

use crate::types::VertexId;

/// Engine result type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the engine.
///
/// Contract violations (a tick that never settles, a wait-count underflow,
/// ticking an input vertex) are programmer errors and panic instead.
#[derive(Debug, Error)]
pub enum Error {
    /// A user-supplied transform failed during `Tick`. The turn is aborted;
    /// the engine stays usable for future turns.
    #[error("transform failed at vertex {vertex}")]
    Transform {
        vertex: VertexId,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },

    #[error("vertex not found: {0}")]
    VertexNotFound(VertexId),

    #[error("attaching {child} to {parent} would create a cycle")]
    CycleDetected { child: VertexId, parent: VertexId },

    #[error("failed to build worker pool")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),
}
