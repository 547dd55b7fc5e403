//! Process suspension protocol: join, results, resume and interplay with
//! plain events.

use std::sync::{Arc, Mutex};

use simforge_core::error::{ModelResult, SimError};
use simforge_core::process::{Process, ProcessContext};
use simforge_core::sim::{ErrorAction, ProcessState, SimExecState};
use simforge_core::simulation::Simulation;
use simforge_core::test_utils::*;

#[test]
fn join_waits_for_the_result() {
    let sim = Simulation::default();
    let p2 = sim
        .activate_named("p2", |ctx: &ProcessContext| {
            ctx.wait_for(5.0)?;
            Ok(42)
        })
        .unwrap();

    let target = p2.clone();
    let p1 = sim
        .activate_named("p1", move |ctx: &ProcessContext| {
            ctx.wait_for(1.0)?;
            // p2 is still waiting for its wake-up at 5.0.
            let before = (target.state(), target.next_wake_time());
            let early = target.get();
            target.join(ctx)?;
            Ok((before, early.is_err(), ctx.sim_time(), target.get()?))
        })
        .unwrap();

    sim.perform_run().unwrap();

    let (before, early_failed, joined_at, value) = p1.get().unwrap();
    assert_eq!(before, (ProcessState::Scheduled, Some(5.0)));
    assert!(early_failed);
    assert_eq!(joined_at, 5.0);
    assert_eq!(value, 42);
    assert_eq!(p2.get().unwrap(), 42);
}

#[test]
fn join_on_terminated_process_returns_immediately() {
    let sim = Simulation::default();
    let quick = sim.activate_named("quick", |_: &ProcessContext| Ok("done")).unwrap();
    let target = quick.clone();
    let waiter = sim
        .activate_named("waiter", move |ctx: &ProcessContext| {
            ctx.wait_for(3.0)?;
            target.join(ctx)?;
            Ok(ctx.sim_time())
        })
        .unwrap();
    sim.perform_run().unwrap();
    assert_eq!(waiter.get().unwrap(), 3.0);
    assert_eq!(quick.get().unwrap(), "done");
}

#[test]
fn several_joiners_all_wake() {
    let sim = Simulation::default();
    let worker = sim
        .activate_named("worker", |ctx: &ProcessContext| {
            ctx.wait_for(2.0)?;
            Ok(7u32)
        })
        .unwrap();
    let mut waiters = Vec::new();
    for i in 0..3 {
        let target = worker.clone();
        waiters.push(
            sim.activate_named(format!("waiter-{i}"), move |ctx: &ProcessContext| {
                target.join(ctx)?;
                Ok(target.get()? + i)
            })
            .unwrap(),
        );
    }
    sim.perform_run().unwrap();
    let values: Vec<u32> = waiters.iter().map(|w| w.get().unwrap()).collect();
    assert_eq!(values, [7, 8, 9]);
}

#[test]
fn joining_a_failed_process_reports_the_failure() {
    let sim = Simulation::default();
    sim.set_error_handler(|_| ErrorAction::Recover);
    let broken = sim
        .activate_named("broken", |ctx: &ProcessContext| -> ModelResult<u32> {
            ctx.wait_for(1.0)?;
            Err(TestError("spindle failure").into())
        })
        .unwrap();
    let target = broken.clone();
    let observer = sim
        .activate_named("observer", move |ctx: &ProcessContext| {
            target.join(ctx)?;
            Ok(match target.get() {
                Err(SimError::ProcessFailed { source, .. }) => source.to_string(),
                other => format!("{other:?}"),
            })
        })
        .unwrap();

    sim.perform_run().unwrap();
    assert_eq!(observer.get().unwrap(), "spindle failure");
    assert_eq!(sim.state(), SimExecState::Finished);
}

#[test]
fn producer_resumes_passive_consumer() {
    let sim = Simulation::default();
    let buffer = Arc::new(Mutex::new(Vec::<f64>::new()));
    let rec = Recorder::new();

    let consumer_buffer = Arc::clone(&buffer);
    let consumer_rec = rec.clone();
    let consumer = sim
        .activate_named("consumer", move |ctx: &ProcessContext| -> ModelResult {
            loop {
                let next = consumer_buffer.lock().unwrap().pop();
                match next {
                    Some(item) => consumer_rec.record(ctx.sim_time(), format!("took {item}")),
                    None => ctx.suspend()?,
                }
            }
        })
        .unwrap();

    let producer_buffer = Arc::clone(&buffer);
    let target: Process<()> = consumer.clone();
    sim.activate_named("producer", move |ctx: &ProcessContext| -> ModelResult {
        for item in [1.0, 2.0, 3.0] {
            ctx.wait_for(1.0)?;
            producer_buffer.lock().unwrap().push(item);
            if target.state() == ProcessState::Passive {
                target.resume()?;
            }
        }
        Ok(())
    })
    .unwrap();

    sim.perform_run().unwrap();
    assert_eq!(
        rec.entries(),
        [
            (1.0, "took 1".to_string()),
            (2.0, "took 2".to_string()),
            (3.0, "took 3".to_string())
        ]
    );
    // The consumer was left suspended and got aborted at run end.
    assert!(consumer.is_terminated());
    assert!(matches!(
        consumer.failure().as_deref().and_then(|e| e.downcast_ref::<SimError>()),
        Some(SimError::Aborted { .. })
    ));
}

#[test]
fn events_and_processes_interleave_in_time_order() {
    let sim = Simulation::default();
    let rec = Recorder::new();
    let proc_rec = rec.clone();
    sim.activate_named("stepper", move |ctx: &ProcessContext| -> ModelResult {
        for _ in 0..3 {
            ctx.wait_for(2.0)?;
            proc_rec.record(ctx.sim_time(), "process");
        }
        Ok(())
    })
    .unwrap();
    for t in [1.0, 3.0, 5.0] {
        sim.schedule_at(t, rec.recorder("event")).unwrap();
    }

    sim.perform_run().unwrap();
    assert_eq!(rec.times(), [1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    assert_eq!(
        rec.labels(),
        ["event", "process", "event", "process", "event", "process"]
    );
}

#[test]
fn panicking_body_is_a_model_error() {
    let sim = Simulation::default();
    let p = sim
        .activate_named("fragile", |ctx: &ProcessContext| -> ModelResult<()> {
            ctx.wait_for(1.0)?;
            panic!("bearing seized");
        })
        .unwrap();
    let err = sim.perform_run().unwrap_err();
    assert_eq!(sim.sim_time(), 1.0);
    assert!(err.to_string().contains("bearing seized"));
    assert!(p.is_terminated());
}

#[test]
fn process_created_before_run_starts_at_initial_time() {
    let sim = Simulation::default();
    let p = sim.process("late-starter", |ctx: &ProcessContext| Ok(ctx.sim_time()));
    assert_eq!(p.state(), ProcessState::Created);
    p.awake_in(4.0).unwrap();
    assert_eq!(p.state(), ProcessState::Scheduled);
    sim.perform_run().unwrap();
    assert_eq!(p.get().unwrap(), 4.0);
}
