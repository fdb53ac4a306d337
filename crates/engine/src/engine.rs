//! Propagation core
//!
//! Drives turns over the vertex arena: admits inputs, marks the reachable
//! subtree, then drains the topological queue level by level. Within a
//! level the working set has no internal edges, so it may execute on the
//! worker pool; vertices settle back into the engine through the hooks on
//! [`TickContext`], which feed the release buffer the driver drains between
//! levels.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use rayon::prelude::*;
use tracing::{debug, instrument, trace};

use crate::error::Result;
use crate::flags::Flag;
use crate::graph::Graph;
use crate::queue::TopoQueue;
use crate::shuffle::{shuffle, SplitMix64};
use crate::turn::{Turn, TurnGate};
use crate::types::{
    EngineConfig, TickObserver, TickSpan, TurnFlags, TurnId, TurnMode, VertexId,
};
use crate::vertex::{ReactiveNode, Vertex};

/// Per-turn scratch: the scheduled queue, the marked set, and the release
/// buffer worker threads push into.
struct PropagState {
    queue: TopoQueue,
    released: Mutex<Vec<VertexId>>,
    marked: Vec<VertexId>,
}

impl PropagState {
    fn new() -> Self {
        Self {
            queue: TopoQueue::new(),
            released: Mutex::new(Vec::new()),
            marked: Vec::new(),
        }
    }
}

/// Capability handed to a running `Tick`. A tick must end by calling
/// exactly one of [`pulse`](Self::pulse) / [`idle_pulse`](Self::idle_pulse),
/// or by returning early after a level-raising
/// [`attach_parent`](Self::attach_parent).
pub struct TickContext<'a> {
    engine: &'a Engine,
    turn: &'a Turn,
    vertex: VertexId,
    state: &'a PropagState,
}

impl TickContext<'_> {
    pub fn engine(&self) -> &Engine {
        self.engine
    }

    pub fn turn(&self) -> &Turn {
        self.turn
    }

    pub fn vertex(&self) -> VertexId {
        self.vertex
    }

    /// The recomputation produced output: mark changed and fan out.
    pub fn pulse(&self) {
        self.assert_unsettled();
        self.engine.settle(self.vertex, self.turn, self.state, true);
    }

    /// The recomputation produced nothing: fan out without marking changed.
    pub fn idle_pulse(&self) {
        self.assert_unsettled();
        self.engine.settle(self.vertex, self.turn, self.state, false);
    }

    /// Attach a new predecessor mid-turn. Returns true when the new parent
    /// raised this vertex's level: the vertex has been re-enqueued and the
    /// tick must return without settling.
    pub fn attach_parent(&self, parent: VertexId) -> bool {
        self.engine
            .dynamic_attach(self.vertex, parent, self.turn, self.state)
    }

    /// Detach a predecessor mid-turn.
    pub fn detach_parent(&self, parent: VertexId) {
        self.engine.dynamic_detach(self.vertex, parent, self.turn);
    }

    fn assert_unsettled(&self) {
        assert!(
            !self
                .engine
                .graph
                .vertex(self.vertex)
                .settled_in(self.turn.id().0),
            "vertex {} settled twice in turn {}",
            self.vertex,
            self.turn.id()
        );
    }
}

/// The propagation engine. Construction and topology mutation take `&mut`;
/// turns run through `&self`, which is what lets concurrent-mode drivers
/// share the engine across threads.
pub struct Engine {
    graph: Graph,
    config: EngineConfig,
    pool: Option<rayon::ThreadPool>,
    next_turn: AtomicU64,
    gate: TurnGate,
    observer: Option<TickObserver>,
    epoch: Instant,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        let pool = match (config.parallel, config.worker_threads) {
            (true, Some(threads)) => Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(threads)
                    .build()?,
            ),
            _ => None,
        };
        Ok(Self {
            graph: Graph::new(),
            config,
            pool,
            next_turn: AtomicU64::new(0),
            gate: TurnGate::new(),
            observer: None,
            epoch: Instant::now(),
        })
    }

    /// Install the instrumentation sink invoked after every vertex
    /// execution.
    pub fn set_tick_observer(&mut self, observer: TickObserver) {
        self.observer = Some(observer);
    }

    // ---- topology (outside any turn) ----

    /// Register a node; the create hook of the node lifecycle.
    pub fn add_vertex(&mut self, node: Arc<dyn ReactiveNode>) -> VertexId {
        self.graph.add(node)
    }

    /// Destroy a vertex. All edges must have been detached first.
    pub fn remove_vertex(&mut self, id: VertexId) {
        self.graph.remove(id);
    }

    /// Static edge attach. Rejects cycles and keeps levels consistent.
    pub fn attach(&mut self, child: VertexId, parent: VertexId) -> Result<()> {
        self.graph.attach(child, parent)
    }

    /// Static edge detach.
    pub fn detach(&mut self, child: VertexId, parent: VertexId) -> Result<()> {
        self.graph.detach(child, parent)
    }

    // ---- turns ----

    /// Issue the next turn id.
    pub fn begin_turn(&self, flags: TurnFlags) -> Turn {
        let id = TurnId(self.next_turn.fetch_add(1, Ordering::Relaxed) + 1);
        Turn::new(id, flags)
    }

    /// Merge a later turn into an earlier one before propagation. Both
    /// turns must carry `ALLOW_MERGING`; the merged id leaves the admission
    /// sequence.
    pub fn merge_turns(&self, into: &mut Turn, other: Turn) {
        assert!(
            into.can_merge(&other),
            "merging turns that do not both allow it"
        );
        assert!(
            into.id() < other.id(),
            "turns merge into the earlier turn"
        );
        self.gate.retire(other.id());
        into.absorb(other);
    }

    /// Run one turn to completion. Returns only at quiescence; a transform
    /// error aborts the turn and surfaces unchanged.
    #[instrument(skip_all, fields(turn = %turn.id()))]
    pub fn propagate(&self, turn: &Turn) -> Result<()> {
        self.gate.wait_admission(turn.id());

        // Claim the downstream closure of every submitted input before
        // touching any input buffer: a conflicting turn must not mutate a
        // source this turn still owns.
        let mut state = PropagState::new();
        for &input in &turn.inputs {
            assert!(
                self.graph.vertex(input).flags.test(Flag::ROOT),
                "vertex {input} submitted as input but is not an input vertex"
            );
            self.mark_subtree(input, turn, &mut state);
        }
        self.compute_wait_counts(turn, &state);

        if self.config.turn_mode == TurnMode::Concurrent {
            self.gate.advance();
        }

        let mut changed = Vec::new();
        let mut idle = Vec::new();
        for &input in &turn.inputs {
            if self.graph.vertex(input).node.apply_input(turn) {
                changed.push(input);
            } else {
                idle.push(input);
            }
        }
        trace!(
            submitted = turn.inputs.len(),
            changed = changed.len(),
            "inputs admitted"
        );

        let result = self.run_turn(&changed, &idle, turn, &mut state);
        self.finish_turn(turn, &state, result.is_ok());

        if self.config.turn_mode == TurnMode::Exclusive {
            self.gate.advance();
        }
        result
    }

    // ---- inspection ----

    pub fn level(&self, id: VertexId) -> u32 {
        self.graph.vertex(id).level()
    }

    pub fn wait_count(&self, id: VertexId) -> u32 {
        self.graph.vertex(id).wait_count.load(Ordering::Acquire)
    }

    pub fn should_update(&self, id: VertexId) -> bool {
        self.graph.vertex(id).should_update.load(Ordering::Relaxed)
    }

    pub fn is_changed(&self, id: VertexId) -> bool {
        self.graph.vertex(id).flags.test(Flag::CHANGED)
    }

    /// True if the vertex was settled by the idle cascade without running
    /// in its most recent turn.
    pub fn is_deferred(&self, id: VertexId) -> bool {
        self.graph.vertex(id).flags.test(Flag::DEFERRED)
    }

    /// True until the vertex participates in its first turn.
    pub fn is_initial(&self, id: VertexId) -> bool {
        self.graph.vertex(id).flags.test(Flag::INITIAL)
    }

    pub fn successors(&self, id: VertexId) -> Vec<VertexId> {
        self.graph.vertex(id).successors()
    }

    pub fn predecessors(&self, id: VertexId) -> Vec<VertexId> {
        self.graph.vertex(id).predecessors()
    }

    // ---- marking ----

    /// BFS along successor edges from a changed input: claim each vertex
    /// for this turn, set `marked`, reset the per-turn bookkeeping.
    fn mark_subtree(&self, root: VertexId, turn: &Turn, state: &mut PropagState) {
        let mut frontier = VecDeque::from([root]);
        while let Some(current) = frontier.pop_front() {
            let vertex = self.graph.vertex(current);
            if !self.claim(vertex, current, turn) {
                continue;
            }
            vertex.flags.set(Flag::MARKED);
            vertex.flags.clear_all(&[
                Flag::CHANGED,
                Flag::DEFERRED,
                Flag::REPEATED,
                Flag::QUEUED,
                Flag::INITIAL,
            ]);
            vertex.should_update.store(false, Ordering::Relaxed);
            vertex.wait_count.store(0, Ordering::Relaxed);
            state.marked.push(current);
            for succ in vertex.successors() {
                frontier.push_back(succ);
            }
        }
        trace!(root = %root, marked = state.marked.len(), "subtree marked");
    }

    /// Claim participation of `vertex` for this turn. False means the turn
    /// already owns it (BFS revisit). A vertex owned by an older running
    /// turn parks this turn until that owner releases.
    fn claim(&self, vertex: &Vertex, id: VertexId, turn: &Turn) -> bool {
        let turn_id = turn.id().0;
        let claim = |owner: &AtomicU64| {
            owner
                .compare_exchange(0, turn_id, Ordering::AcqRel, Ordering::Acquire)
        };
        match claim(&vertex.owner) {
            Ok(_) => true,
            Err(current) if current == turn_id => false,
            Err(current) => {
                // The gate admits turns in id order, so the holder is older.
                debug_assert!(current < turn_id);
                debug!(vertex = %id, holder = current, turn = turn_id, "waiting on older turn");
                self.gate
                    .wait_owner_release(|| claim(&vertex.owner).is_ok());
                true
            }
        }
    }

    /// Second marking pass: wait-count := number of marked predecessors.
    fn compute_wait_counts(&self, turn: &Turn, state: &PropagState) {
        for &id in &state.marked {
            let vertex = self.graph.vertex(id);
            let waits = vertex
                .predecessors()
                .iter()
                .filter(|&&pred| {
                    let pv = self.graph.vertex(pred);
                    pv.flags.test(Flag::MARKED)
                        && pv.owner.load(Ordering::Acquire) == turn.id().0
                })
                .count() as u32;
            vertex.wait_count.store(waits, Ordering::Release);
        }
    }

    // ---- propagation loop ----

    fn run_turn(
        &self,
        changed: &[VertexId],
        idle: &[VertexId],
        turn: &Turn,
        state: &mut PropagState,
    ) -> Result<()> {
        for &input in changed {
            self.settle(input, turn, state, true);
        }
        // A submitted input that did not change still settles, so its
        // marked subtree drains through the idle cascade.
        for &input in idle {
            self.settle(input, turn, state, false);
        }
        self.drain_released(state);

        let mut working = Vec::new();
        let mut stalled = 0usize;
        loop {
            let graph = &self.graph;
            let Some(level) = state
                .queue
                .fetch_next_level(|id| graph.vertex(id).level(), &mut working)
            else {
                break;
            };

            // Entries re-enqueued by a dynamic attach may still wait on the
            // new parent; push them back until its settle arrives.
            let mut runnable = Vec::with_capacity(working.len());
            for &id in &working {
                let vertex = self.graph.vertex(id);
                if vertex.wait_count.load(Ordering::Acquire) > 0 {
                    debug_assert!(vertex.flags.test(Flag::REPEATED));
                    state.queue.push(id);
                    continue;
                }
                vertex.flags.clear_all(&[Flag::QUEUED, Flag::REPEATED]);
                runnable.push(id);
            }
            trace!(level, count = runnable.len(), "level drained");

            if runnable.is_empty() {
                stalled += 1;
                assert!(stalled < 2, "propagation stalled at level {level}");
                continue;
            }
            stalled = 0;

            self.execute_level(&mut runnable, level, turn, state)?;
            self.drain_released(state);
        }
        Ok(())
    }

    fn execute_level(
        &self,
        runnable: &mut Vec<VertexId>,
        level: u32,
        turn: &Turn,
        state: &PropagState,
    ) -> Result<()> {
        if self.config.parallel && runnable.len() > 1 {
            let tick = |&id: &VertexId| self.run_vertex(id, turn, state);
            let results: Vec<Result<()>> = match &self.pool {
                Some(pool) => pool.install(|| runnable.par_iter().map(tick).collect()),
                None => runnable.par_iter().map(tick).collect(),
            };
            // Check sequentially after the join
            for result in results {
                result?;
            }
        } else {
            if let Some(seed) = self.config.level_shuffle_seed {
                let mut rng =
                    SplitMix64::new(seed ^ turn.id().0 ^ ((level as u64) << 32));
                shuffle(runnable, &mut rng);
            }
            for &id in runnable.iter() {
                self.run_vertex(id, turn, state)?;
            }
        }
        Ok(())
    }

    fn run_vertex(&self, id: VertexId, turn: &Turn, state: &PropagState) -> Result<()> {
        let vertex = self.graph.vertex(id);
        debug_assert!(vertex.flags.test(Flag::MARKED));
        trace!(vertex = %id, node_type = vertex.node.node_type(), "tick");

        let cx = TickContext {
            engine: self,
            turn,
            vertex: id,
            state,
        };
        let began = self.observer.as_ref().map(|_| self.epoch.elapsed());
        let result = vertex.node.tick(&cx);
        if let (Some(observer), Some(began)) = (self.observer.as_ref(), began) {
            observer(TickSpan {
                vertex: id,
                turn: turn.id(),
                began_ns: began.as_nanos() as u64,
                ended_ns: self.epoch.elapsed().as_nanos() as u64,
            });
        }
        result?;

        assert!(
            vertex.settled_in(turn.id().0) || vertex.flags.test(Flag::QUEUED),
            "vertex {id} ticked without pulse, idle pulse, or re-enqueue"
        );
        Ok(())
    }

    // ---- settle fan-out ----

    /// Record a settle for `id` and fan out to its marked successors. A
    /// released successor with no pulsed predecessor is skip-settled in
    /// place (the idle cascade), so downstream wait-counts always drain.
    fn settle(&self, id: VertexId, turn: &Turn, state: &PropagState, pulsed: bool) {
        let mut work = vec![(id, pulsed)];
        while let Some((current, pulsed)) = work.pop() {
            let vertex = self.graph.vertex(current);
            if pulsed {
                vertex.flags.set(Flag::CHANGED);
            }
            // The settled store and the successor snapshot share the shift
            // lock's read side; a dynamic attach (writer) therefore sees a
            // consistent settled/successors pair when deciding whether a
            // wait-count bump is still owed.
            let successors = {
                let edges = vertex.edges.read().expect("shift lock poisoned");
                vertex.settled_turn.store(turn.id().0, Ordering::Release);
                edges.successors.clone()
            };
            trace!(vertex = %current, pulsed, fanout = successors.len(), "settled");

            for succ in successors {
                let sv = self.graph.vertex(succ);
                if !sv.flags.test(Flag::MARKED) {
                    continue;
                }
                if pulsed {
                    sv.should_update.store(true, Ordering::Relaxed);
                }
                let prev = sv.wait_count.fetch_sub(1, Ordering::AcqRel);
                assert!(prev > 0, "wait-count underflow at vertex {succ}");
                if prev == 1 {
                    if sv.should_update.load(Ordering::Relaxed) {
                        self.release(succ, state);
                    } else {
                        sv.flags.set(Flag::DEFERRED);
                        work.push((succ, false));
                    }
                }
            }
        }
    }

    /// Exactly-once transfer into the release buffer; the driver moves the
    /// buffer into the queue between levels.
    fn release(&self, id: VertexId, state: &PropagState) {
        let vertex = self.graph.vertex(id);
        if !vertex.flags.test_and_set(Flag::QUEUED) {
            state
                .released
                .lock()
                .expect("release buffer poisoned")
                .push(id);
        }
    }

    fn drain_released(&self, state: &mut PropagState) {
        let released = std::mem::take(
            &mut *state.released.lock().expect("release buffer poisoned"),
        );
        for id in released {
            state.queue.push(id);
        }
    }

    // ---- dynamic reattachment ----

    fn dynamic_attach(
        &self,
        child: VertexId,
        parent: VertexId,
        turn: &Turn,
        state: &PropagState,
    ) -> bool {
        let parent_vertex = self.graph.vertex(parent);
        let child_vertex = self.graph.vertex(child);

        {
            // Writer side of the parent's shift lock: the edge insert, the
            // settled check, and the wait bump form one step relative to
            // the parent's own settle.
            let mut edges = parent_vertex.edges.write().expect("shift lock poisoned");
            edges.successors.push(child);
            if parent_vertex.flags.test(Flag::MARKED)
                && parent_vertex.owner.load(Ordering::Acquire) == turn.id().0
                && !parent_vertex.settled_in(turn.id().0)
            {
                child_vertex.wait_count.fetch_add(1, Ordering::AcqRel);
            }
        }
        {
            let mut edges = child_vertex.edges.write().expect("shift lock poisoned");
            edges.predecessors.push(parent);
        }

        let parent_level = parent_vertex.level();
        let raised = parent_level >= child_vertex.level();
        if raised {
            child_vertex.level.store(parent_level + 1, Ordering::Relaxed);
            child_vertex.should_update.store(true, Ordering::Relaxed);
            child_vertex.flags.set(Flag::REPEATED);
            self.release(child, state);
            self.graph.invalidate_successors(child, true);
            debug!(
                child = %child,
                parent = %parent,
                level = parent_level + 1,
                "dynamic attach raised level"
            );
        } else {
            debug!(child = %child, parent = %parent, "dynamic attach below level");
        }
        raised
    }

    fn dynamic_detach(&self, child: VertexId, parent: VertexId, turn: &Turn) {
        let parent_vertex = self.graph.vertex(parent);
        {
            let mut edges = parent_vertex.edges.write().expect("shift lock poisoned");
            edges.successors.retain(|&s| s != child);
        }
        // A dynamic detach is issued by the child's own tick, so every
        // marked predecessor of the child, the old parent included, has
        // already settled; no wait-count adjustment is owed.
        debug_assert!(
            !parent_vertex.flags.test(Flag::MARKED)
                || parent_vertex.owner.load(Ordering::Acquire) != turn.id().0
                || parent_vertex.settled_in(turn.id().0)
        );
        let child_vertex = self.graph.vertex(child);
        {
            let mut edges = child_vertex.edges.write().expect("shift lock poisoned");
            edges.predecessors.retain(|&p| p != parent);
        }
        debug!(child = %child, parent = %parent, "dynamic detach");
    }

    // ---- completion ----

    /// Release the turn's marked set. On success every wait-count has
    /// drained; on abort wait-counts stay as they fell and the next turn's
    /// marking re-initialises them.
    fn finish_turn(&self, turn: &Turn, state: &PropagState, completed: bool) {
        for &id in &state.marked {
            let vertex = self.graph.vertex(id);
            if completed {
                debug_assert_eq!(
                    vertex.wait_count.load(Ordering::Acquire),
                    0,
                    "wait-count not drained at {id}"
                );
            }
            vertex.flags.clear_all(&[Flag::MARKED, Flag::QUEUED]);
            vertex.owner.store(0, Ordering::Release);
        }
        self.gate.notify_release();
        debug!(marked = state.marked.len(), completed, "turn finished");
    }
}
