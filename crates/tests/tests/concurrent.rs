//! Parallel and concurrent scheduling tests
//!
//! Wall-clock properties: a level's working set really runs on the worker
//! pool, disjoint turns overlap in concurrent mode, conflicting turns are
//! ordered, and exclusive mode serialises whole turns.

use std::time::{Duration, Instant};

use ripple_engine::{TurnFlags, TurnId};
use ripple_tests as harness;
use ripple_tests::TickRecorder;

/// Ten heavy vertices at one level finish in well under the serial sum of
/// their tick times on a four-worker pool.
#[test]
fn parallel_level_beats_serial_sum() {
    harness::init_tracing();
    let sleep = Duration::from_millis(25);
    let count = 10;

    let mut engine = harness::parallel(4);
    let (a, probe) = harness::input(&mut engine);
    let relays: Vec<_> = (0..count)
        .map(|_| harness::sleepy_relay(&mut engine, &[a], sleep))
        .collect();

    probe.arm();
    let started = Instant::now();
    harness::run(&engine, &[a]);
    let wall = started.elapsed();

    let serial = sleep * count;
    assert!(
        wall < serial.mul_f64(0.75),
        "parallel wall time {wall:?} not under serial sum {serial:?}"
    );
    for (_, relay) in &relays {
        assert_eq!(relay.ticks(), 1);
    }
}

/// Concurrent mode: two turns over disjoint subtrees overlap in wall time,
/// and a third turn that shares a subtree with the first waits for it.
#[test]
fn disjoint_turns_overlap_and_conflicts_wait() {
    let sleep = Duration::from_millis(100);

    let mut engine = harness::concurrent();
    let recorder = TickRecorder::install(&mut engine);

    let (a1, p1) = harness::input(&mut engine);
    let (r1, _) = harness::sleepy_relay(&mut engine, &[a1], sleep);
    let (a2, p2) = harness::input(&mut engine);
    let (r2, _) = harness::sleepy_relay(&mut engine, &[a2], sleep);
    recorder.name(r1, "r1");
    recorder.name(r2, "r2");

    p1.arm();
    p2.arm();

    let mut turn1 = engine.begin_turn(TurnFlags::empty());
    turn1.add_input(a1);
    let mut turn2 = engine.begin_turn(TurnFlags::empty());
    turn2.add_input(a2);
    let mut turn3 = engine.begin_turn(TurnFlags::empty());
    turn3.add_input(a1);

    let mut completions: Vec<(u64, Instant)> = Vec::new();
    std::thread::scope(|scope| {
        let handles: Vec<_> = [turn1, turn2, turn3]
            .into_iter()
            .map(|turn| {
                let engine = &engine;
                scope.spawn(move || {
                    engine.propagate(&turn).unwrap();
                    (turn.id().0, Instant::now())
                })
            })
            .collect();
        for handle in handles {
            completions.push(handle.join().unwrap());
        }
    });

    // Turns 1 and 2 touched disjoint subtrees: their executions overlapped
    let (begin1, end1) = recorder.turn_window(TurnId(1)).unwrap();
    let (begin2, end2) = recorder.turn_window(TurnId(2)).unwrap();
    assert!(
        begin1 < end2 && begin2 < end1,
        "disjoint turns did not overlap: t1=({begin1},{end1}) t2=({begin2},{end2})"
    );

    // Turn 3 shares a1's subtree with turn 1 and must finish after it
    let finished = |id: u64| {
        completions
            .iter()
            .find(|(turn, _)| *turn == id)
            .map(|(_, at)| *at)
            .unwrap()
    };
    assert!(finished(3) >= finished(1), "conflicting turn did not wait");
    assert_eq!(recorder.count(r1), 1);
    assert_eq!(recorder.count(r2), 1);
}

/// Exclusive mode: turns never overlap, in turn-id order.
#[test]
fn exclusive_turns_serialise() {
    let sleep = Duration::from_millis(40);

    let mut engine = harness::sequential();
    let recorder = TickRecorder::install(&mut engine);

    let (a1, p1) = harness::input(&mut engine);
    let (r1, _) = harness::sleepy_relay(&mut engine, &[a1], sleep);
    let (a2, p2) = harness::input(&mut engine);
    let (r2, _) = harness::sleepy_relay(&mut engine, &[a2], sleep);

    p1.arm();
    p2.arm();

    let mut turn1 = engine.begin_turn(TurnFlags::empty());
    turn1.add_input(a1);
    let mut turn2 = engine.begin_turn(TurnFlags::empty());
    turn2.add_input(a2);

    std::thread::scope(|scope| {
        let engine = &engine;
        // Submit out of order; admission still runs 1 then 2
        let second = scope.spawn(move || engine.propagate(&turn2).unwrap());
        let first = scope.spawn(move || engine.propagate(&turn1).unwrap());
        first.join().unwrap();
        second.join().unwrap();
    });

    let (_, end1) = recorder.turn_window(TurnId(1)).unwrap();
    let (begin2, _) = recorder.turn_window(TurnId(2)).unwrap();
    assert!(end1 <= begin2, "exclusive turns overlapped");
    assert_eq!(recorder.count(r1), 1);
    assert_eq!(recorder.count(r2), 1);
}
