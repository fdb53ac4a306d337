//! Turn-stamped event buffers
//!
//! An event buffer is valid for exactly one turn-id: the first access under
//! a newer turn clears it. The stamp-and-clear step is serialised under the
//! buffer's mutex so parallel readers of a shared parent cannot race the
//! clear.

use std::sync::Mutex;

use ripple_engine::{Turn, TurnId};

#[derive(Debug)]
struct BufferInner<E> {
    turn: Option<TurnId>,
    events: Vec<E>,
}

/// Ordered events on one event-stream vertex for the current turn.
#[derive(Debug)]
pub struct EventBuffer<E> {
    inner: Mutex<BufferInner<E>>,
}

impl<E> EventBuffer<E> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(BufferInner {
                turn: None,
                events: Vec::new(),
            }),
        }
    }

    /// Stamp the buffer with `turn`. On a stale stamp (or `force`) the
    /// buffer is cleared unless `no_clear`; the no-clear form is for
    /// sources that have already written this turn's values.
    pub fn set_current_turn(&self, turn: &Turn, force: bool, no_clear: bool) {
        let mut inner = self.inner.lock().expect("event buffer poisoned");
        if inner.turn != Some(turn.id()) || force {
            inner.turn = Some(turn.id());
            if !no_clear {
                inner.events.clear();
            }
        }
    }

    /// Stamp with `turn` (clearing stale residue), then read the events.
    /// A parent that did not run this turn reads as empty, never as the
    /// previous turn's values.
    pub fn with_events<R>(&self, turn: &Turn, f: impl FnOnce(&[E]) -> R) -> R {
        let mut inner = self.inner.lock().expect("event buffer poisoned");
        if inner.turn != Some(turn.id()) {
            inner.turn = Some(turn.id());
            inner.events.clear();
        }
        f(&inner.events)
    }

    /// Append values produced in `turn`. The caller has already stamped
    /// the buffer for this turn.
    pub fn extend(&self, turn: &Turn, values: impl IntoIterator<Item = E>) {
        let mut inner = self.inner.lock().expect("event buffer poisoned");
        debug_assert_eq!(inner.turn, Some(turn.id()), "append to unstamped buffer");
        inner.events.extend(values);
    }

    pub fn push(&self, turn: &Turn, value: E) {
        self.extend(turn, std::iter::once(value));
    }

    /// Number of events currently buffered.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("event buffer poisoned").events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<E: Clone> EventBuffer<E> {
    /// Copy out whatever the most recent turn left behind. Driver-side
    /// read; does not stamp.
    pub fn snapshot(&self) -> Vec<E> {
        self.inner
            .lock()
            .expect("event buffer poisoned")
            .events
            .clone()
    }
}

impl<E> Default for EventBuffer<E> {
    fn default() -> Self {
        Self::new()
    }
}
