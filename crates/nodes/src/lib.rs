//! Reactive nodes for the ripple engine
//!
//! Event streams (discrete sequences) and signals (continuously valued
//! cells), implemented against the engine's node contract: sources absorb
//! external input, derived nodes recompute in `Tick` and settle with a
//! pulse or idle pulse, and flatten rewires its inner stream mid-turn.

pub mod buffer;
pub mod event;
pub mod signal;

pub use buffer::EventBuffer;
pub use event::{filter, flatten, map, merge, try_map, EventSource, EventStream, Events};
pub use signal::{signal_map, signal_zip, Signal, SignalCell, SignalLike};

/// Error type user transforms may fail with; surfaced out of `propagate`
/// wrapped in the engine's transform error.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;
