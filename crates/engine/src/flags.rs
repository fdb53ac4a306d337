//! Per-vertex status flags
//!
//! A compact atomic bitset. Flags are written from worker threads during
//! pulse fan-out, so every accessor goes through atomics; the level barrier
//! between working sets provides the ordering that matters.

use std::sync::atomic::{AtomicU8, Ordering};

/// One status flag. The bit layout is private to this module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Flag(u8);

impl Flag {
    /// Vertex is in the scheduled queue (or the pending release buffer).
    pub const QUEUED: Flag = Flag(1 << 0);
    /// Vertex participates in the current turn.
    pub const MARKED: Flag = Flag(1 << 1);
    /// Most recent recomputation this turn produced output.
    pub const CHANGED: Flag = Flag(1 << 2);
    /// Marked vertex settled by the idle cascade without running.
    pub const DEFERRED: Flag = Flag(1 << 3);
    /// Vertex was re-enqueued for another execution this turn.
    pub const REPEATED: Flag = Flag(1 << 4);
    /// Set at creation, cleared the first time the vertex is marked.
    pub const INITIAL: Flag = Flag(1 << 5);
    /// Vertex is an input (source) vertex.
    pub const ROOT: Flag = Flag(1 << 6);
}

/// Atomic flag set for one vertex.
#[derive(Debug, Default)]
pub struct VertexFlags(AtomicU8);

impl VertexFlags {
    pub fn new() -> Self {
        Self(AtomicU8::new(0))
    }

    pub fn test(&self, flag: Flag) -> bool {
        self.0.load(Ordering::Relaxed) & flag.0 != 0
    }

    pub fn set(&self, flag: Flag) {
        self.0.fetch_or(flag.0, Ordering::Relaxed);
    }

    pub fn clear(&self, flag: Flag) {
        self.0.fetch_and(!flag.0, Ordering::Relaxed);
    }

    /// Set `flag` and report whether it was already set. Exactly one caller
    /// observes `false`; queue release relies on this.
    pub fn test_and_set(&self, flag: Flag) -> bool {
        self.0.fetch_or(flag.0, Ordering::AcqRel) & flag.0 != 0
    }

    /// Clear several flags in one store cycle.
    pub fn clear_all(&self, flags: &[Flag]) {
        let mask: u8 = flags.iter().fold(0, |m, f| m | f.0);
        self.0.fetch_and(!mask, Ordering::Relaxed);
    }
}
