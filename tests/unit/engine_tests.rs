//! Run lifecycle and supervision tests.
//!
//! Every ending (completion, fault, panic, stop) must tear the run down
//! exactly once: held keys released, its time-flow scope popped, one report
//! delivered.

use std::sync::Arc;
use std::time::Duration;

use live_harness::engine::{
    Fault, OperatorChannel, Progress, PumpEnv, Run, RunPhase, RunStatus, TickContext, TimeFlow,
    TimeFlowStack, MAX_TIME_SCALE,
};
use live_harness::loader::{MethodDef, Op};
use live_harness::target::{InputEvent, SimulatedTarget};
use live_harness::wire::messages::LogLevel;
use live_harness::AppError;

use super::support::{self, RecordingOperator};

const TICK: Duration = Duration::from_secs(1);

fn spin(_cx: &mut TickContext<'_>) -> Result<Progress, Fault> {
    Ok(Progress::Pending)
}

fn wait(seconds: f64) -> Op {
    Op::Wait { seconds }
}

fn log(message: &str) -> Op {
    Op::Log {
        message: message.to_owned(),
    }
}

#[test]
fn run_completes_and_reports_once() {
    let (_target, engine) = support::engine(Duration::from_secs(5));
    let operator = RecordingOperator::new();
    let code = support::load_type(
        "Smoke",
        &[MethodDef::entry_point(
            "passes",
            "it passes",
            0,
            vec![log("hello"), wait(2.0), log("bye")],
        )],
    );

    let run_id = support::start_entry(&engine, &code, TimeFlow::Normal, &operator);
    assert_eq!(engine.active_runs(), vec![run_id.clone()]);

    let report = support::tick_until_report(&engine, TICK, 10).expect("run should finish");
    assert_eq!(report.run_id, run_id);
    assert_eq!(report.entry, "Smoke.passes");
    assert_eq!(report.status, RunStatus::Completed);
    assert!(report.completed);
    assert!(report.message.is_none());
    assert!(report.finished_at >= report.started_at);

    assert_eq!(operator.info_lines(), vec!["hello", "bye"]);
    assert!(engine.active_runs().is_empty());

    for _ in 0..3 {
        assert!(engine.tick(TICK).is_empty());
    }
    assert_eq!(operator.report_count(), 1);
}

#[test]
fn fault_tears_down_once_and_releases_held_keys() {
    let (target, engine) = support::engine(Duration::from_secs(5));
    let operator = RecordingOperator::new();
    let code = support::load_type(
        "Smoke",
        &[MethodDef::entry_point(
            "fails",
            "holds a key then fails",
            0,
            vec![
                Op::KeyDown { key: "w".into() },
                wait(1.0),
                Op::Fail {
                    message: "boom".into(),
                },
            ],
        )],
    );

    support::start_entry(&engine, &code, TimeFlow::Normal, &operator);
    assert_eq!(engine.time_flow().depth(), 1);

    engine.tick(TICK);
    assert_eq!(target.held_keys(), vec!["w"]);

    let report = support::tick_until_report(&engine, TICK, 5).expect("run should fault");
    assert_eq!(report.status, RunStatus::Faulted);
    assert!(!report.completed);
    let message = report.message.expect("fault message");
    assert!(message.starts_with("boom at Smoke.fails+2"), "{message}");

    assert!(target.held_keys().is_empty());
    let releases = target
        .events()
        .iter()
        .filter(|event| matches!(event, InputEvent::KeyUp { key } if key == "w"))
        .count();
    assert_eq!(releases, 1);
    assert_eq!(engine.time_flow().depth(), 0);

    for _ in 0..3 {
        engine.tick(TICK);
    }
    assert_eq!(operator.report_count(), 1);
    let errors = operator
        .logs
        .lock()
        .iter()
        .filter(|(_, level, _)| *level == LogLevel::Error)
        .count();
    assert_eq!(errors, 1);
}

#[test]
fn run_phases_follow_the_lifecycle() {
    let target = SimulatedTarget::new(vec![]);
    let stack = TimeFlowStack::new();
    let operator = RecordingOperator::new();
    let mut step = 0;
    let task = move |cx: &mut TickContext<'_>| -> Result<Progress, Fault> {
        step += 1;
        if step == 1 {
            assert!(cx.inputs.is_empty());
            cx.key_down("w")?;
            assert!(cx.inputs.contains("w"));
            return Ok(Progress::Pending);
        }
        cx.key_up("w")?;
        assert!(!cx.inputs.contains("w"));
        assert!(cx.inputs.is_empty());
        Ok(Progress::Finished)
    };

    let mut run = Run::new(
        "Closure.steps",
        Box::new(task),
        TimeFlow::Frozen,
        Arc::clone(&operator) as Arc<dyn OperatorChannel>,
        None,
    );
    assert_eq!(run.phase(), RunPhase::Created);

    run.apply_time_flow(&stack);
    assert_eq!(run.phase(), RunPhase::TimeFlowApplied);
    assert_eq!(stack.current(), TimeFlow::Frozen);

    let env = PumpEnv {
        tick: 1,
        delta: Duration::ZERO,
        target: &target,
        time_flow: &stack,
        pause_grace: Duration::from_secs(5),
    };
    assert!(run.pump(env).is_none());
    assert_eq!(run.phase(), RunPhase::Pumping);
    assert_eq!(target.held_keys(), vec!["w"]);

    let report = run.pump(PumpEnv { tick: 2, ..env }).expect("second tick ends the run");
    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(run.phase(), RunPhase::TornDown);
    assert!(run.is_torn_down());
    assert_eq!(stack.depth(), 0);

    assert!(run.pump(PumpEnv { tick: 3, ..env }).is_none());
    assert_eq!(operator.report_count(), 1);
}

#[test]
fn panicking_task_is_contained() {
    let (target, engine) = support::engine(Duration::from_secs(5));
    let operator = RecordingOperator::new();
    let task = |cx: &mut TickContext<'_>| -> Result<Progress, Fault> {
        cx.key_down("shift")?;
        panic!("kaboom");
    };

    engine
        .start(
            "Closure.panics",
            Box::new(task),
            TimeFlow::Normal,
            Arc::clone(&operator) as Arc<dyn OperatorChannel>,
            None,
        )
        .expect("start");

    let reports = engine.tick(TICK);
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].status, RunStatus::Faulted);
    let message = reports[0].message.clone().expect("message");
    assert!(message.contains("task panicked: kaboom"), "{message}");
    assert!(target.held_keys().is_empty());
    assert_eq!(engine.time_flow().depth(), 0);
    assert!(engine.active_runs().is_empty());
}

#[test]
fn stop_request_cancels_at_next_tick() {
    let (_target, engine) = support::engine(Duration::from_secs(5));
    let operator = RecordingOperator::new();
    let code = support::load_type(
        "Smoke",
        &[MethodDef::entry_point("waits", "waits", 0, vec![wait(100.0)])],
    );
    let run_id = support::start_entry(&engine, &code, TimeFlow::Normal, &operator);
    engine.tick(TICK);

    engine.stop_run(&run_id, None).expect("stop live run");
    let reports = engine.tick(TICK);
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].status, RunStatus::Cancelled);
    assert_eq!(engine.time_flow().depth(), 0);

    let err = engine.stop_run(&run_id, None).expect_err("already gone");
    assert!(matches!(err, AppError::NotFound(_)));
}

#[test]
fn stop_is_limited_to_the_owner() {
    let (_target, engine) = support::engine(Duration::from_secs(5));
    let operator = RecordingOperator::new();
    let owner = uuid::Uuid::new_v4();
    let handle = engine
        .start(
            "Closure.spins",
            Box::new(spin),
            TimeFlow::Normal,
            Arc::clone(&operator) as Arc<dyn OperatorChannel>,
            Some(owner),
        )
        .expect("start");

    let stranger = uuid::Uuid::new_v4();
    assert!(engine.stop_run(&handle.run_id, Some(stranger)).is_err());
    assert_eq!(engine.stop_owned_by(stranger), 0);
    assert_eq!(engine.stop_owned_by(owner), 1);

    let reports = engine.tick(TICK);
    assert_eq!(reports[0].status, RunStatus::Cancelled);
    assert_eq!(reports[0].owner, Some(owner));
}

#[test]
fn degenerate_time_flow_is_rejected_at_start() {
    let (_target, engine) = support::engine(Duration::from_secs(5));
    let operator = RecordingOperator::new();
    let task = |_cx: &mut TickContext<'_>| -> Result<Progress, Fault> { Ok(Progress::Finished) };

    let err = engine
        .start(
            "Closure.never",
            Box::new(task),
            TimeFlow::Accelerated { scale: 0.0 },
            Arc::clone(&operator) as Arc<dyn OperatorChannel>,
            None,
        )
        .expect_err("zero scale is invalid");
    assert!(matches!(err, AppError::Protocol(_)));
    assert!(engine.active_runs().is_empty());
    assert_eq!(engine.time_flow().depth(), 0);
}

#[test]
fn oversized_scale_is_rejected_and_huge_deltas_saturate() {
    let (target, engine) = support::engine(Duration::from_secs(5));
    let operator = RecordingOperator::new();

    let err = engine
        .start(
            "Closure.spins",
            Box::new(spin),
            TimeFlow::Accelerated { scale: 1e30 },
            Arc::clone(&operator) as Arc<dyn OperatorChannel>,
            None,
        )
        .expect_err("scale above the bound is invalid");
    assert!(matches!(err, AppError::Protocol(_)));
    assert!(engine.active_runs().is_empty());
    assert_eq!(engine.time_flow().depth(), 0);

    engine
        .start(
            "Closure.spins",
            Box::new(spin),
            TimeFlow::Accelerated {
                scale: MAX_TIME_SCALE,
            },
            Arc::clone(&operator) as Arc<dyn OperatorChannel>,
            None,
        )
        .expect("scale at the bound is accepted");

    // A policy pushed straight onto the stack skips validation; the frame
    // loop must still survive it.
    let scope = engine.time_flow().push(TimeFlow::Accelerated { scale: f32::MAX });
    for _ in 0..3 {
        assert!(engine.tick(TICK).is_empty());
    }
    assert_eq!(target.clock(), Duration::MAX);
    assert_eq!(engine.active_runs().len(), 1);
    drop(scope);

    engine.stop_all();
    let reports = engine.tick(TICK);
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].status, RunStatus::Cancelled);
    assert_eq!(engine.time_flow().depth(), 0);
}

#[test]
fn accelerated_run_advances_logical_time_faster() {
    let (target, engine) = support::engine(Duration::from_secs(5));
    let operator = RecordingOperator::new();
    let code = support::load_type(
        "Smoke",
        &[MethodDef::entry_point(
            "waits",
            "waits four seconds",
            0,
            vec![wait(4.0), log("done")],
        )],
    );
    support::start_entry(
        &engine,
        &code,
        TimeFlow::Accelerated { scale: 4.0 },
        &operator,
    );
    assert_eq!(engine.time_flow().current(), TimeFlow::Accelerated { scale: 4.0 });

    assert!(engine.tick(TICK).is_empty());
    let reports = engine.tick(TICK);
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].status, RunStatus::Completed);
    assert_eq!(target.clock(), Duration::from_secs(8));

    assert_eq!(engine.time_flow().current(), TimeFlow::Normal);
    engine.tick(TICK);
    assert_eq!(target.clock(), Duration::from_secs(9));
}

#[test]
fn frame_skipping_uses_fixed_logical_steps() {
    let (target, engine) = support::engine(Duration::from_secs(5));
    let operator = RecordingOperator::new();
    let code = support::load_type(
        "Smoke",
        &[MethodDef::entry_point("waits", "waits", 0, vec![wait(1.0)])],
    );
    support::start_entry(
        &engine,
        &code,
        TimeFlow::FrameSkipping { step_ms: 500 },
        &operator,
    );

    let tiny = Duration::from_millis(10);
    assert!(engine.tick(tiny).is_empty());
    assert!(engine.tick(tiny).is_empty());
    let reports = engine.tick(tiny);
    assert_eq!(reports.len(), 1);
    assert_eq!(target.clock(), Duration::from_millis(1500));
}

#[test]
fn concurrent_runs_share_the_top_time_flow() {
    let (_target, engine) = support::engine(Duration::from_secs(5));
    let operator = RecordingOperator::new();

    let first = engine
        .start(
            "Closure.first",
            Box::new(spin),
            TimeFlow::Accelerated { scale: 2.0 },
            Arc::clone(&operator) as Arc<dyn OperatorChannel>,
            None,
        )
        .expect("start first");
    let second = engine
        .start(
            "Closure.second",
            Box::new(spin),
            TimeFlow::Frozen,
            Arc::clone(&operator) as Arc<dyn OperatorChannel>,
            None,
        )
        .expect("start second");
    assert_eq!(engine.time_flow().current(), TimeFlow::Frozen);

    engine.stop_run(&second.run_id, None).expect("stop second");
    engine.tick(TICK);
    assert_eq!(engine.time_flow().current(), TimeFlow::Accelerated { scale: 2.0 });

    engine.stop_run(&first.run_id, None).expect("stop first");
    engine.tick(TICK);
    assert_eq!(engine.time_flow().current(), TimeFlow::Normal);
    assert_eq!(operator.report_count(), 2);
}

#[test]
fn stop_all_cancels_every_run() {
    let (_target, engine) = support::engine(Duration::from_secs(5));
    let operator = RecordingOperator::new();
    for name in ["Closure.a", "Closure.b", "Closure.c"] {
        engine
            .start(
                name,
                Box::new(spin),
                TimeFlow::Normal,
                Arc::clone(&operator) as Arc<dyn OperatorChannel>,
                None,
            )
            .expect("start");
    }

    engine.stop_all();
    let reports = engine.tick(TICK);
    assert_eq!(reports.len(), 3);
    assert!(reports.iter().all(|r| r.status == RunStatus::Cancelled));
    assert_eq!(engine.time_flow().depth(), 0);
}
