//! A small job shop built from components: a source feeding two machine
//! groups. Checks lifecycle order, scoped results and hook error routing.

use std::any::Any;
use std::sync::{Arc, Mutex};

use simforge_core::component::{Component, Group};
use simforge_core::error::{ModelResult, SimError};
use simforge_core::process::ProcessContext;
use simforge_core::resource::Resource;
use simforge_core::results::ResultScope;
use simforge_core::sim::{ErrorAction, SimExecState};
use simforge_core::simulation::Simulation;
use simforge_core::test_utils::{Counter, Recorder, TestError};

// ===========================================================================
// Components
// ===========================================================================

type Log = Arc<Mutex<Vec<String>>>;

/// The part of a machine that job processes use.
#[derive(Debug, Clone)]
struct Station {
    resource: Resource,
    process_time: f64,
    processed: Counter,
    busy_time: Arc<Mutex<f64>>,
}

impl Station {
    /// Process one job.
    fn work(&self, ctx: &ProcessContext) -> ModelResult {
        self.resource.seize(ctx)?;
        ctx.wait_for(self.process_time)?;
        *self.busy_time.lock().unwrap() += self.process_time;
        self.processed.increment();
        self.resource.release(ctx.sim())?;
        Ok(())
    }
}

#[derive(Debug)]
struct Machine {
    label: &'static str,
    station: Station,
    log: Log,
}

impl Machine {
    fn new(label: &'static str, process_time: f64, log: &Log) -> Self {
        Self {
            label,
            station: Station {
                resource: Resource::new(label, 1),
                process_time,
                processed: Counter::new(),
                busy_time: Arc::new(Mutex::new(0.0)),
            },
            log: Arc::clone(log),
        }
    }
}

impl Component for Machine {
    fn init(&mut self, _sim: &Simulation) -> ModelResult {
        self.log.lock().unwrap().push(format!("init:{}", self.label));
        Ok(())
    }

    fn sim_start(&mut self, _sim: &Simulation) -> ModelResult {
        self.log.lock().unwrap().push(format!("start:{}", self.label));
        Ok(())
    }

    fn sim_end(&mut self, _sim: &Simulation) -> ModelResult {
        self.log.lock().unwrap().push(format!("end:{}", self.label));
        Ok(())
    }

    fn produce_results(&mut self, results: &mut ResultScope<'_>) {
        results.put("processed", self.station.processed.get());
        results.put("busyTime", *self.station.busy_time.lock().unwrap());
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Releases `jobs` jobs at fixed intervals; each visits the machines at the
/// given hierarchical paths in order.
#[derive(Debug)]
struct Source {
    jobs: u32,
    interval: f64,
    route: Vec<&'static str>,
}

impl Component for Source {
    fn init(&mut self, sim: &Simulation) -> ModelResult {
        let mut route = Vec::new();
        for path in &self.route {
            let id = sim
                .component_by_hierarchical_name(path)
                .ok_or_else(|| TestError("unknown machine in route"))?;
            let handle = sim
                .with_component(id, |m: &mut Machine| m.station.clone())
                .ok_or_else(|| TestError("route target is not a machine"))?;
            route.push(handle);
        }

        let (jobs, interval) = (self.jobs, self.interval);
        sim.activate_named("source", move |ctx: &ProcessContext| -> ModelResult {
            for n in 0..jobs {
                let route = route.clone();
                let job = ctx.sim().process(format!("job-{n}"), move |ctx: &ProcessContext| -> ModelResult {
                    for machine in &route {
                        machine.work(ctx)?;
                    }
                    Ok(())
                });
                job.awake_in(0.0)?;
                ctx.wait_for(interval)?;
            }
            Ok(())
        })?;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

fn build_shop(sim: &Simulation, log: &Log) {
    let shop = sim.add_component("shop", Group).unwrap();
    let cutting = sim.add_child(shop, "cutting", Group).unwrap();
    sim.add_child(cutting, "saw", Machine::new("saw", 2.0, log))
        .unwrap();
    let finishing = sim.add_child(shop, "finishing", Group).unwrap();
    sim.add_child(finishing, "polish", Machine::new("polish", 1.0, log))
        .unwrap();
    sim.add_component(
        "source",
        Source {
            jobs: 3,
            interval: 1.0,
            route: vec!["sim.shop.cutting.saw", "sim.shop.finishing.polish"],
        },
    )
    .unwrap();
}

// ===========================================================================
// Tests
// ===========================================================================

#[test]
fn job_shop_runs_and_reports_scoped_results() {
    let sim = Simulation::default();
    let log = Log::default();
    build_shop(&sim, &log);

    let results = sim.perform_run().unwrap();

    // Saw: jobs start at 0, 2, 4 -> done at 2, 4, 6. Polish: 2-3, 4-5, 6-7.
    assert_eq!(results.get_f64("simTime"), Some(7.0));
    assert_eq!(results.get_u64("sim.shop.cutting.saw.processed"), Some(3));
    assert_eq!(results.get_u64("sim.shop.finishing.polish.processed"), Some(3));
    assert_eq!(results.get_f64("sim.shop.cutting.saw.busyTime"), Some(6.0));
    assert_eq!(results.get_f64("sim.shop.finishing.polish.busyTime"), Some(3.0));
}

#[test]
fn lifecycle_hooks_run_top_down_then_bottom_up() {
    let sim = Simulation::default();
    let log = Log::default();
    build_shop(&sim, &log);
    sim.perform_run().unwrap();

    assert_eq!(
        *log.lock().unwrap(),
        [
            "init:saw",
            "init:polish",
            "start:saw",
            "start:polish",
            "end:polish",
            "end:saw"
        ]
    );
}

#[test]
fn components_are_reachable_after_the_run() {
    let sim = Simulation::default();
    let log = Log::default();
    build_shop(&sim, &log);
    sim.perform_run().unwrap();

    let saw = sim
        .component_by_hierarchical_name("sim.shop.cutting.saw")
        .unwrap();
    let processed = sim.with_component(saw, |m: &mut Machine| m.station.processed.get());
    assert_eq!(processed, Some(3));
    let name = sim.with_components(|tree| tree.hierarchical_name(saw));
    assert_eq!(name.as_deref(), Some("sim.shop.cutting.saw"));
    assert!(sim.with_component(saw, |_: &mut Source| ()).is_none());
}

#[test]
fn duplicate_component_names_are_rejected() {
    let sim = Simulation::default();
    sim.add_component("shop", Group).unwrap();
    assert!(matches!(
        sim.add_component("shop", Group),
        Err(SimError::Component(_))
    ));
}

#[derive(Debug)]
struct FailingInit;

impl Component for FailingInit {
    fn init(&mut self, _sim: &Simulation) -> ModelResult {
        Err(TestError("calibration missing").into())
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[test]
fn hook_failure_aborts_without_a_handler() {
    let sim = Simulation::default();
    sim.add_component("gauge", FailingInit).unwrap();
    sim.schedule_at(1.0, |_| Ok(())).unwrap();

    match sim.perform_run() {
        Err(SimError::Model { origin, time, .. }) => {
            assert_eq!(origin, "init of component 'sim.gauge'");
            assert_eq!(time, 0.0);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(sim.state(), SimExecState::Error);
    assert_eq!(sim.events_processed(), 0);
}

#[test]
fn hook_failure_can_be_recovered() {
    let sim = Simulation::default();
    let errors = Recorder::new();
    let seen = errors.clone();
    sim.set_error_handler(move |err| {
        seen.record(0.0, err.to_string());
        ErrorAction::Recover
    });
    sim.add_component("gauge", FailingInit).unwrap();
    sim.schedule_at(1.0, |_| Ok(())).unwrap();

    sim.perform_run().unwrap();
    assert_eq!(errors.labels(), ["calibration missing"]);
    assert_eq!(sim.sim_time(), 1.0);
}
