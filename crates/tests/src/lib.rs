//! Integration harness for the ripple engine
//!
//! Engine constructors per scheduling mode, closure-driven probe vertices,
//! a tick recorder built on the engine's instrumentation hook, and the
//! invariant checks the end-to-end tests assert at turn boundaries.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};

use indexmap::IndexMap;

use ripple_engine::{
    Engine, EngineConfig, ReactiveNode, Result, TickContext, TickSpan, Turn,
    TurnFlags, TurnId, TurnMode, VertexId,
};

/// Opt-in log output for a test run (`RUST_LOG=ripple_engine=trace`).
pub fn init_tracing() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "off".into()),
            )
            .try_init();
    });
}

pub fn sequential() -> Engine {
    Engine::new(EngineConfig::default()).expect("engine construction")
}

pub fn sequential_seeded(seed: u64) -> Engine {
    Engine::new(EngineConfig {
        level_shuffle_seed: Some(seed),
        ..EngineConfig::default()
    })
    .expect("engine construction")
}

pub fn parallel(workers: usize) -> Engine {
    Engine::new(EngineConfig {
        parallel: true,
        worker_threads: Some(workers),
        ..EngineConfig::default()
    })
    .expect("engine construction")
}

pub fn concurrent() -> Engine {
    Engine::new(EngineConfig {
        turn_mode: TurnMode::Concurrent,
        ..EngineConfig::default()
    })
    .expect("engine construction")
}

/// Begin a turn over `inputs` and run it to completion.
pub fn run(engine: &Engine, inputs: &[VertexId]) {
    let mut turn = engine.begin_turn(TurnFlags::empty());
    for &input in inputs {
        turn.add_input(input);
    }
    engine.propagate(&turn).expect("turn failed");
}

// ---- tick recording ----

/// Records every vertex execution through the engine's tick observer.
#[derive(Clone)]
pub struct TickRecorder {
    spans: Arc<Mutex<Vec<TickSpan>>>,
    names: Arc<Mutex<IndexMap<VertexId, String>>>,
}

impl TickRecorder {
    pub fn install(engine: &mut Engine) -> Self {
        let recorder = Self {
            spans: Arc::new(Mutex::new(Vec::new())),
            names: Arc::new(Mutex::new(IndexMap::new())),
        };
        let sink = Arc::clone(&recorder.spans);
        engine.set_tick_observer(Box::new(move |span| {
            sink.lock().unwrap().push(span);
        }));
        recorder
    }

    /// Label a vertex for readable order assertions.
    pub fn name(&self, id: VertexId, label: &str) {
        self.names.lock().unwrap().insert(id, label.to_string());
    }

    pub fn spans(&self) -> Vec<TickSpan> {
        self.spans.lock().unwrap().clone()
    }

    pub fn count(&self, id: VertexId) -> usize {
        self.spans().iter().filter(|s| s.vertex == id).count()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.lock().unwrap().is_empty()
    }

    pub fn clear(&self) {
        self.spans.lock().unwrap().clear();
    }

    /// Vertex labels in execution start order.
    pub fn ticked_order(&self) -> Vec<String> {
        let names = self.names.lock().unwrap();
        let mut spans = self.spans();
        spans.sort_by_key(|s| s.began_ns);
        spans
            .iter()
            .map(|s| {
                names
                    .get(&s.vertex)
                    .cloned()
                    .unwrap_or_else(|| s.vertex.to_string())
            })
            .collect()
    }

    /// True when every execution of `first` finished before any execution
    /// of `second` began.
    pub fn ran_before(&self, first: VertexId, second: VertexId) -> bool {
        let spans = self.spans();
        let last_end = spans
            .iter()
            .filter(|s| s.vertex == first)
            .map(|s| s.ended_ns)
            .max();
        let first_begin = spans
            .iter()
            .filter(|s| s.vertex == second)
            .map(|s| s.began_ns)
            .min();
        match (last_end, first_begin) {
            (Some(end), Some(begin)) => end <= begin,
            _ => false,
        }
    }

    /// Wall-clock window of a turn's executions: (first begin, last end).
    pub fn turn_window(&self, turn: TurnId) -> Option<(u64, u64)> {
        let spans = self.spans();
        let of_turn: Vec<_> = spans.iter().filter(|s| s.turn == turn).collect();
        let begin = of_turn.iter().map(|s| s.began_ns).min()?;
        let end = of_turn.iter().map(|s| s.ended_ns).max()?;
        Some((begin, end))
    }
}

// ---- probe vertices ----

/// Armable input vertex: reports a change exactly when armed.
pub struct InputProbe {
    armed: AtomicBool,
}

impl InputProbe {
    pub fn arm(&self) {
        self.armed.store(true, Ordering::Release);
    }
}

impl ReactiveNode for InputProbe {
    fn tick(&self, cx: &TickContext<'_>) -> Result<()> {
        panic!("ticked input probe {}", cx.vertex());
    }

    fn apply_input(&self, _turn: &Turn) -> bool {
        self.armed.swap(false, Ordering::AcqRel)
    }

    fn dependency_count(&self) -> usize {
        0
    }

    fn is_input(&self) -> bool {
        true
    }

    fn node_type(&self) -> &'static str {
        "InputProbe"
    }
}

pub fn input(engine: &mut Engine) -> (VertexId, Arc<InputProbe>) {
    let node = Arc::new(InputProbe {
        armed: AtomicBool::new(false),
    });
    let id = engine.add_vertex(node.clone());
    (id, node)
}

/// Closure-driven non-input vertex for scheduling assertions.
pub struct Relay {
    behaviour: Box<dyn Fn(&TickContext<'_>) -> Result<()> + Send + Sync>,
    deps: usize,
    ticks: AtomicUsize,
}

impl Relay {
    pub fn ticks(&self) -> usize {
        self.ticks.load(Ordering::Relaxed)
    }
}

impl ReactiveNode for Relay {
    fn tick(&self, cx: &TickContext<'_>) -> Result<()> {
        self.ticks.fetch_add(1, Ordering::Relaxed);
        (self.behaviour)(cx)
    }

    fn dependency_count(&self) -> usize {
        self.deps
    }

    fn node_type(&self) -> &'static str {
        "Relay"
    }
}

pub fn relay(
    engine: &mut Engine,
    parents: &[VertexId],
    behaviour: impl Fn(&TickContext<'_>) -> Result<()> + Send + Sync + 'static,
) -> (VertexId, Arc<Relay>) {
    let node = Arc::new(Relay {
        behaviour: Box::new(behaviour),
        deps: parents.len(),
        ticks: AtomicUsize::new(0),
    });
    let id = engine.add_vertex(node.clone());
    for &parent in parents {
        engine.attach(id, parent).expect("attach");
    }
    (id, node)
}

/// Relay that just pulses.
pub fn pulse_relay(engine: &mut Engine, parents: &[VertexId]) -> (VertexId, Arc<Relay>) {
    relay(engine, parents, |cx| {
        cx.pulse();
        Ok(())
    })
}

/// Relay that sleeps, then pulses. For wall-clock scheduling tests.
pub fn sleepy_relay(
    engine: &mut Engine,
    parents: &[VertexId],
    sleep: std::time::Duration,
) -> (VertexId, Arc<Relay>) {
    relay(engine, parents, move |cx| {
        std::thread::sleep(sleep);
        cx.pulse();
        Ok(())
    })
}

// ---- invariant checks ----

/// Level monotonicity: level(u) < level(v) for every edge u → v.
pub fn assert_level_monotonic(engine: &Engine, vertices: &[VertexId]) {
    for &v in vertices {
        for succ in engine.successors(v) {
            assert!(
                engine.level(v) < engine.level(succ),
                "level not monotonic on edge {v} -> {succ}: {} vs {}",
                engine.level(v),
                engine.level(succ)
            );
        }
    }
}

/// Wait-count balance: every listed vertex has drained to zero.
pub fn assert_waits_drained(engine: &Engine, vertices: &[VertexId]) {
    for &v in vertices {
        assert_eq!(engine.wait_count(v), 0, "wait-count not drained at {v}");
    }
}
