//! Signal nodes
//!
//! Continuously valued cells. A derived signal recomputes in `Tick` and
//! pulses only when the new value differs from the stored one, so an
//! unchanged recomputation cuts propagation downstream.

use std::sync::{Arc, Mutex, RwLock};

use ripple_engine::{Engine, ReactiveNode, Result, TickContext, Turn, VertexId};

/// Read access the engine-side graph needs from any signal vertex.
pub trait SignalLike<T>: ReactiveNode {
    /// Current value of the signal.
    fn value(&self) -> T;
}

/// Cloneable handle to a signal vertex.
pub struct Signal<T> {
    id: VertexId,
    node: Arc<dyn SignalLike<T>>,
}

impl<T> Signal<T> {
    pub(crate) fn new(id: VertexId, node: Arc<dyn SignalLike<T>>) -> Self {
        Self { id, node }
    }

    pub fn id(&self) -> VertexId {
        self.id
    }

    pub fn get(&self) -> T {
        self.node.value()
    }
}

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            node: Arc::clone(&self.node),
        }
    }
}

/// Input signal cell: `set` stages a value, the turn's input admission
/// applies it and reports whether it differs from the stored one.
pub struct SignalCell<T> {
    signal: Signal<T>,
    node: Arc<CellNode<T>>,
}

struct CellNode<T> {
    value: RwLock<T>,
    pending: Mutex<Option<T>>,
}

impl<T> SignalCell<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    pub fn new(engine: &mut Engine, initial: T) -> Self {
        let node = Arc::new(CellNode {
            value: RwLock::new(initial),
            pending: Mutex::new(None),
        });
        let id = engine.add_vertex(node.clone());
        Self {
            signal: Signal::new(id, node.clone()),
            node,
        }
    }

    /// Stage a value for the next turn this cell is submitted to.
    pub fn set(&self, value: T) {
        *self.node.pending.lock().expect("signal cell poisoned") = Some(value);
    }

    pub fn id(&self) -> VertexId {
        self.signal.id()
    }

    pub fn signal(&self) -> Signal<T> {
        self.signal.clone()
    }

    pub fn get(&self) -> T {
        self.signal.get()
    }
}

impl<T> ReactiveNode for CellNode<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn tick(&self, cx: &TickContext<'_>) -> Result<()> {
        panic!("ticked signal cell {}", cx.vertex());
    }

    fn apply_input(&self, _turn: &Turn) -> bool {
        let staged = self.pending.lock().expect("signal cell poisoned").take();
        match staged {
            Some(value) => {
                let mut current = self.value.write().expect("signal cell poisoned");
                if *current != value {
                    *current = value;
                    true
                } else {
                    false
                }
            }
            None => false,
        }
    }

    fn dependency_count(&self) -> usize {
        0
    }

    fn is_input(&self) -> bool {
        true
    }

    fn node_type(&self) -> &'static str {
        "SignalCell"
    }
}

impl<T> SignalLike<T> for CellNode<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn value(&self) -> T {
        self.value.read().expect("signal cell poisoned").clone()
    }
}

type LiftFn<A, T> = Box<dyn Fn(&A) -> T + Send + Sync>;
type Lift2Fn<A, B, T> = Box<dyn Fn(&A, &B) -> T + Send + Sync>;

struct MapSignalNode<A, T> {
    source: Signal<A>,
    func: LiftFn<A, T>,
    value: RwLock<T>,
}

impl<A, T> ReactiveNode for MapSignalNode<A, T>
where
    A: Send + Sync + 'static,
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn tick(&self, cx: &TickContext<'_>) -> Result<()> {
        let fresh = (self.func)(&self.source.get());
        let changed = {
            let mut value = self.value.write().expect("signal poisoned");
            if *value != fresh {
                *value = fresh;
                true
            } else {
                false
            }
        };
        if changed {
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
        "SignalMap"
    }
}

impl<A, T> SignalLike<T> for MapSignalNode<A, T>
where
    A: Send + Sync + 'static,
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn value(&self) -> T {
        self.value.read().expect("signal poisoned").clone()
    }
}

/// Derive a signal by mapping another. The initial value is computed from
/// the source's current value.
pub fn signal_map<A, T>(
    engine: &mut Engine,
    source: &Signal<A>,
    func: impl Fn(&A) -> T + Send + Sync + 'static,
) -> Signal<T>
where
    A: Send + Sync + 'static,
    T: Clone + PartialEq + Send + Sync + 'static,
{
    let initial = func(&source.get());
    let node = Arc::new(MapSignalNode {
        source: source.clone(),
        func: Box::new(func) as LiftFn<A, T>,
        value: RwLock::new(initial),
    });
    let id = engine.add_vertex(node.clone());
    engine
        .attach(id, source.id())
        .expect("fresh vertex cannot form a cycle");
    Signal::new(id, node)
}

struct ZipSignalNode<A, B, T> {
    left: Signal<A>,
    right: Signal<B>,
    func: Lift2Fn<A, B, T>,
    value: RwLock<T>,
}

impl<A, B, T> ReactiveNode for ZipSignalNode<A, B, T>
where
    A: Send + Sync + 'static,
    B: Send + Sync + 'static,
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn tick(&self, cx: &TickContext<'_>) -> Result<()> {
        let fresh = (self.func)(&self.left.get(), &self.right.get());
        let changed = {
            let mut value = self.value.write().expect("signal poisoned");
            if *value != fresh {
                *value = fresh;
                true
            } else {
                false
            }
        };
        if changed {
            cx.pulse();
        } else {
            cx.idle_pulse();
        }
        Ok(())
    }

    fn dependency_count(&self) -> usize {
        2
    }

    fn node_type(&self) -> &'static str {
        "SignalZip"
    }
}

impl<A, B, T> SignalLike<T> for ZipSignalNode<A, B, T>
where
    A: Send + Sync + 'static,
    B: Send + Sync + 'static,
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn value(&self) -> T {
        self.value.read().expect("signal poisoned").clone()
    }
}

/// Combine two signals into one.
pub fn signal_zip<A, B, T>(
    engine: &mut Engine,
    left: &Signal<A>,
    right: &Signal<B>,
    func: impl Fn(&A, &B) -> T + Send + Sync + 'static,
) -> Signal<T>
where
    A: Send + Sync + 'static,
    B: Send + Sync + 'static,
    T: Clone + PartialEq + Send + Sync + 'static,
{
    let initial = func(&left.get(), &right.get());
    let node = Arc::new(ZipSignalNode {
        left: left.clone(),
        right: right.clone(),
        func: Box::new(func) as Lift2Fn<A, B, T>,
        value: RwLock::new(initial),
    });
    let id = engine.add_vertex(node.clone());
    engine
        .attach(id, left.id())
        .expect("fresh vertex cannot form a cycle");
    engine
        .attach(id, right.id())
        .expect("fresh vertex cannot form a cycle");
    Signal::new(id, node)
}
