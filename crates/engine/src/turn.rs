//! Turns and the admission gate
//!
//! A turn is one atomic propagation pass: an id from the engine's monotonic
//! source, a flag set, and the input vertices submitted for it. The
//! [`TurnGate`] admits turns to the marking phase strictly in id order and
//! parks a marking turn that runs into a vertex still owned by an older,
//! running turn.

use std::collections::BTreeSet;
use std::sync::{Condvar, Mutex};

use crate::types::{TurnFlags, TurnId, VertexId};

/// One propagation pass.
#[derive(Debug)]
pub struct Turn {
    id: TurnId,
    flags: TurnFlags,
    pub(crate) inputs: Vec<VertexId>,
}

impl Turn {
    pub(crate) fn new(id: TurnId, flags: TurnFlags) -> Self {
        Self {
            id,
            flags,
            inputs: Vec::new(),
        }
    }

    pub fn id(&self) -> TurnId {
        self.id
    }

    pub fn flags(&self) -> TurnFlags {
        self.flags
    }

    /// Submit an input vertex for this turn. Duplicates are tolerated; the
    /// admission pass applies each input once.
    pub fn add_input(&mut self, input: VertexId) {
        if !self.inputs.contains(&input) {
            self.inputs.push(input);
        }
    }

    pub fn can_merge(&self, other: &Turn) -> bool {
        self.flags.contains(TurnFlags::ALLOW_MERGING)
            && other.flags.contains(TurnFlags::ALLOW_MERGING)
    }

    pub(crate) fn absorb(&mut self, other: Turn) {
        for input in other.inputs {
            self.add_input(input);
        }
    }
}

#[derive(Debug)]
struct GateState {
    /// Turn-id currently allowed into the marking phase.
    next_admit: u64,
    /// Ids retired without propagating (merged turns) that are still ahead
    /// of `next_admit`.
    retired: BTreeSet<u64>,
}

/// Orders turn admission and wakes turns blocked on vertex ownership.
#[derive(Debug)]
pub(crate) struct TurnGate {
    state: Mutex<GateState>,
    admit_cv: Condvar,
    release: Mutex<()>,
    release_cv: Condvar,
}

impl TurnGate {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GateState {
                next_admit: 1,
                retired: BTreeSet::new(),
            }),
            admit_cv: Condvar::new(),
            release: Mutex::new(()),
            release_cv: Condvar::new(),
        }
    }

    /// Block until `id` is the next turn allowed to mark.
    pub fn wait_admission(&self, id: TurnId) {
        let mut state = self.state.lock().expect("turn gate poisoned");
        assert!(
            state.next_admit <= id.0,
            "turn {id} admitted twice"
        );
        while state.next_admit != id.0 {
            state = self.admit_cv.wait(state).expect("turn gate poisoned");
        }
    }

    /// Admit the next turn-id, skipping over retired ids.
    pub fn advance(&self) {
        let mut state = self.state.lock().expect("turn gate poisoned");
        state.next_admit += 1;
        while {
            let next = state.next_admit;
            state.retired.remove(&next)
        } {
            state.next_admit += 1;
        }
        self.admit_cv.notify_all();
    }

    /// Drop an id from the admission sequence without propagating it.
    pub fn retire(&self, id: TurnId) {
        let mut state = self.state.lock().expect("turn gate poisoned");
        if state.next_admit == id.0 {
            state.next_admit += 1;
            while {
                let next = state.next_admit;
                state.retired.remove(&next)
            } {
                state.next_admit += 1;
            }
            self.admit_cv.notify_all();
        } else {
            state.retired.insert(id.0);
        }
    }

    /// Run `try_claim` until it succeeds, parking between attempts. Wakeups
    /// come from [`TurnGate::notify_release`] at turn completion.
    pub fn wait_owner_release(&self, mut try_claim: impl FnMut() -> bool) {
        if try_claim() {
            return;
        }
        let mut guard = self.release.lock().expect("turn gate poisoned");
        loop {
            if try_claim() {
                return;
            }
            guard = self.release_cv.wait(guard).expect("turn gate poisoned");
        }
    }

    /// Wake every turn parked on vertex ownership.
    pub fn notify_release(&self) {
        let _guard = self.release.lock().expect("turn gate poisoned");
        self.release_cv.notify_all();
    }
}
