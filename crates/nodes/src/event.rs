//! Event-stream nodes
//!
//! Sources absorb externally pushed values; derived streams recompute from
//! their parents' buffers each turn and pulse only when they produced
//! output. Flatten follows a signal of streams and rewires its inner
//! dependency mid-turn when the signal switches.

use std::sync::{Arc, Mutex};

use tracing::debug;

use ripple_engine::{
    Engine, Error, ReactiveNode, Result, TickContext, Turn, VertexId,
};

use crate::buffer::EventBuffer;
use crate::signal::Signal;
use crate::BoxError;

/// Buffer access the engine-facing node layer exposes to readers of an
/// event-stream vertex.
pub trait EventStream<E>: ReactiveNode {
    fn buffer(&self) -> &EventBuffer<E>;
}

/// Cloneable handle to an event-stream vertex. Equality is vertex identity,
/// which is what lets a signal of streams detect an inner switch.
pub struct Events<E> {
    id: VertexId,
    node: Arc<dyn EventStream<E>>,
}

impl<E> Events<E> {
    pub(crate) fn new(id: VertexId, node: Arc<dyn EventStream<E>>) -> Self {
        Self { id, node }
    }

    pub fn id(&self) -> VertexId {
        self.id
    }

    pub fn node(&self) -> &Arc<dyn EventStream<E>> {
        &self.node
    }
}

impl<E: Clone> Events<E> {
    /// Driver-side read of what the most recent turn left in the buffer.
    pub fn snapshot(&self) -> Vec<E> {
        self.node.buffer().snapshot()
    }
}

impl<E> Clone for Events<E> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            node: Arc::clone(&self.node),
        }
    }
}

impl<E> PartialEq for Events<E> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<E> std::fmt::Debug for Events<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Events").field(&self.id).finish()
    }
}

// ---- source ----

struct SourceNode<E> {
    pending: Mutex<Vec<E>>,
    out: EventBuffer<E>,
}

impl<E: Send + Sync + 'static> ReactiveNode for SourceNode<E> {
    fn tick(&self, cx: &TickContext<'_>) -> Result<()> {
        panic!("ticked event source {}", cx.vertex());
    }

    fn apply_input(&self, turn: &Turn) -> bool {
        let mut pending = self.pending.lock().expect("source poisoned");
        if pending.is_empty() {
            return false;
        }
        // Clear the previous turn's residue, then land this turn's values
        self.out.set_current_turn(turn, true, false);
        self.out.extend(turn, pending.drain(..));
        true
    }

    fn dependency_count(&self) -> usize {
        0
    }

    fn is_input(&self) -> bool {
        true
    }

    fn node_type(&self) -> &'static str {
        "EventSource"
    }
}

impl<E: Send + Sync + 'static> EventStream<E> for SourceNode<E> {
    fn buffer(&self) -> &EventBuffer<E> {
        &self.out
    }
}

/// Input event stream. Values pushed between turns are admitted the next
/// time the vertex is submitted to a turn.
pub struct EventSource<E> {
    handle: Events<E>,
    node: Arc<SourceNode<E>>,
}

impl<E: Send + Sync + 'static> EventSource<E> {
    pub fn new(engine: &mut Engine) -> Self {
        let node = Arc::new(SourceNode {
            pending: Mutex::new(Vec::new()),
            out: EventBuffer::new(),
        });
        let id = engine.add_vertex(node.clone());
        Self {
            handle: Events::new(id, node.clone()),
            node,
        }
    }

    /// Queue a value for the next turn this source is submitted to.
    pub fn push(&self, value: E) {
        self.node.pending.lock().expect("source poisoned").push(value);
    }

    pub fn id(&self) -> VertexId {
        self.handle.id()
    }

    pub fn events(&self) -> Events<E> {
        self.handle.clone()
    }
}

// ---- map ----

type TransformFn<In, Out> =
    Box<dyn Fn(&In) -> std::result::Result<Out, BoxError> + Send + Sync>;

struct MapNode<In, Out> {
    source: Events<In>,
    func: TransformFn<In, Out>,
    out: EventBuffer<Out>,
}

impl<In, Out> ReactiveNode for MapNode<In, Out>
where
    In: Send + Sync + 'static,
    Out: Send + Sync + 'static,
{
    fn tick(&self, cx: &TickContext<'_>) -> Result<()> {
        let turn = cx.turn();
        self.out.set_current_turn(turn, true, false);

        let produced: std::result::Result<Vec<Out>, BoxError> = self
            .source
            .node()
            .buffer()
            .with_events(turn, |events| events.iter().map(|e| (self.func)(e)).collect());
        let produced = produced.map_err(|source| Error::Transform {
            vertex: cx.vertex(),
            source,
        })?;

        let count = produced.len();
        self.out.extend(turn, produced);
        if count > 0 {
            cx.pulse();
        } else {
            cx.idle_pulse();
        }
        Ok(())
    }

    fn dependency_count(&self) -> usize {
        1
    }

    fn node_type(&self) -> &'static str {
        "EventMap"
    }
}

impl<In, Out> EventStream<Out> for MapNode<In, Out>
where
    In: Send + Sync + 'static,
    Out: Send + Sync + 'static,
{
    fn buffer(&self) -> &EventBuffer<Out> {
        &self.out
    }
}

fn map_node<In, Out>(
    engine: &mut Engine,
    source: &Events<In>,
    func: TransformFn<In, Out>,
) -> Events<Out>
where
    In: Send + Sync + 'static,
    Out: Send + Sync + 'static,
{
    let node = Arc::new(MapNode {
        source: source.clone(),
        func,
        out: EventBuffer::new(),
    });
    let id = engine.add_vertex(node.clone());
    engine
        .attach(id, source.id())
        .expect("fresh vertex cannot form a cycle");
    Events::new(id, node)
}

/// Transform every event of `source`.
pub fn map<In, Out>(
    engine: &mut Engine,
    source: &Events<In>,
    func: impl Fn(&In) -> Out + Send + Sync + 'static,
) -> Events<Out>
where
    In: Send + Sync + 'static,
    Out: Send + Sync + 'static,
{
    map_node(engine, source, Box::new(move |e| Ok(func(e))))
}

/// Transform every event of `source` with a fallible function. A failure
/// aborts the turn and surfaces out of `propagate`.
pub fn try_map<In, Out>(
    engine: &mut Engine,
    source: &Events<In>,
    func: impl Fn(&In) -> std::result::Result<Out, BoxError> + Send + Sync + 'static,
) -> Events<Out>
where
    In: Send + Sync + 'static,
    Out: Send + Sync + 'static,
{
    map_node(engine, source, Box::new(func))
}

// ---- filter ----

struct FilterNode<E> {
    source: Events<E>,
    predicate: Box<dyn Fn(&E) -> bool + Send + Sync>,
    out: EventBuffer<E>,
}

impl<E> ReactiveNode for FilterNode<E>
where
    E: Clone + Send + Sync + 'static,
{
    fn tick(&self, cx: &TickContext<'_>) -> Result<()> {
        let turn = cx.turn();
        self.out.set_current_turn(turn, true, false);

        let passed: Vec<E> = self.source.node().buffer().with_events(turn, |events| {
            events
                .iter()
                .filter(|e| (self.predicate)(e))
                .cloned()
                .collect()
        });

        let count = passed.len();
        self.out.extend(turn, passed);
        if count > 0 {
            cx.pulse();
        } else {
            cx.idle_pulse();
        }
        Ok(())
    }

    fn dependency_count(&self) -> usize {
        1
    }

    fn node_type(&self) -> &'static str {
        "EventFilter"
    }
}

impl<E> EventStream<E> for FilterNode<E>
where
    E: Clone + Send + Sync + 'static,
{
    fn buffer(&self) -> &EventBuffer<E> {
        &self.out
    }
}

/// Keep only the events `predicate` accepts. Dropping everything yields an
/// idle pulse, which cuts propagation downstream.
pub fn filter<E>(
    engine: &mut Engine,
    source: &Events<E>,
    predicate: impl Fn(&E) -> bool + Send + Sync + 'static,
) -> Events<E>
where
    E: Clone + Send + Sync + 'static,
{
    let node = Arc::new(FilterNode {
        source: source.clone(),
        predicate: Box::new(predicate),
        out: EventBuffer::new(),
    });
    let id = engine.add_vertex(node.clone());
    engine
        .attach(id, source.id())
        .expect("fresh vertex cannot form a cycle");
    Events::new(id, node)
}

// ---- merge ----

struct MergeNode<E> {
    sources: Vec<Events<E>>,
    out: EventBuffer<E>,
}

impl<E> ReactiveNode for MergeNode<E>
where
    E: Clone + Send + Sync + 'static,
{
    fn tick(&self, cx: &TickContext<'_>) -> Result<()> {
        let turn = cx.turn();
        self.out.set_current_turn(turn, true, false);

        let mut count = 0;
        for source in &self.sources {
            let events: Vec<E> = source
                .node()
                .buffer()
                .with_events(turn, |events| events.to_vec());
            count += events.len();
            self.out.extend(turn, events);
        }

        if count > 0 {
            cx.pulse();
        } else {
            cx.idle_pulse();
        }
        Ok(())
    }

    fn dependency_count(&self) -> usize {
        self.sources.len()
    }

    fn node_type(&self) -> &'static str {
        "EventMerge"
    }
}

impl<E> EventStream<E> for MergeNode<E>
where
    E: Clone + Send + Sync + 'static,
{
    fn buffer(&self) -> &EventBuffer<E> {
        &self.out
    }
}

/// Merge several streams, in source order within the turn.
pub fn merge<E>(engine: &mut Engine, sources: &[Events<E>]) -> Events<E>
where
    E: Clone + Send + Sync + 'static,
{
    let node = Arc::new(MergeNode {
        sources: sources.to_vec(),
        out: EventBuffer::new(),
    });
    let id = engine.add_vertex(node.clone());
    for source in sources {
        engine
            .attach(id, source.id())
            .expect("fresh vertex cannot form a cycle");
    }
    Events::new(id, node)
}

// ---- flatten ----

struct FlattenNode<E> {
    outer: Signal<Events<E>>,
    inner: Mutex<Events<E>>,
    out: EventBuffer<E>,
}

impl<E> ReactiveNode for FlattenNode<E>
where
    E: Clone + Send + Sync + 'static,
{
    fn tick(&self, cx: &TickContext<'_>) -> Result<()> {
        let turn = cx.turn();
        self.out.set_current_turn(turn, true, false);

        let current = self.outer.get();
        let switched = {
            let mut inner = self.inner.lock().expect("flatten poisoned");
            if current != *inner {
                Some(std::mem::replace(&mut *inner, current.clone()))
            } else {
                None
            }
        };
        if let Some(old) = switched {
            debug!(
                vertex = %cx.vertex(),
                from = %old.id(),
                to = %current.id(),
                "inner stream switched"
            );
            cx.detach_parent(old.id());
            if cx.attach_parent(current.id()) {
                // Level raised: re-enqueued behind the new inner; the rerun
                // merges its events.
                return Ok(());
            }
        }

        let inner = self.inner.lock().expect("flatten poisoned").clone();
        let events: Vec<E> = inner
            .node()
            .buffer()
            .with_events(turn, |events| events.to_vec());
        let count = events.len();
        self.out.extend(turn, events);
        if count > 0 {
            cx.pulse();
        } else {
            cx.idle_pulse();
        }
        Ok(())
    }

    fn dependency_count(&self) -> usize {
        2
    }

    fn is_dynamic(&self) -> bool {
        true
    }

    fn node_type(&self) -> &'static str {
        "EventFlatten"
    }
}

impl<E> EventStream<E> for FlattenNode<E>
where
    E: Clone + Send + Sync + 'static,
{
    fn buffer(&self) -> &EventBuffer<E> {
        &self.out
    }
}

/// Follow a signal of streams: the result carries the events of whichever
/// inner stream the signal currently holds, switching dependencies
/// mid-turn when the signal changes.
pub fn flatten<E>(engine: &mut Engine, outer: &Signal<Events<E>>) -> Events<E>
where
    E: Clone + Send + Sync + 'static,
{
    let initial = outer.get();
    let node = Arc::new(FlattenNode {
        outer: outer.clone(),
        inner: Mutex::new(initial.clone()),
        out: EventBuffer::new(),
    });
    let id = engine.add_vertex(node.clone());
    engine
        .attach(id, outer.id())
        .expect("fresh vertex cannot form a cycle");
    engine
        .attach(id, initial.id())
        .expect("fresh vertex cannot form a cycle");
    Events::new(id, node)
}
