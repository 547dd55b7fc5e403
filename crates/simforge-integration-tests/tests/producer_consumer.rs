//! The same single-server queue written three ways: as cooperating
//! processes, as jobs seizing a resource, and as plain events. All three
//! draw from identical random streams, so they must agree exactly.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Exp};
use simforge_core::config::SimConfig;
use simforge_core::error::ModelResult;
use simforge_core::process::ProcessContext;
use simforge_core::resource::Resource;
use simforge_core::sim::{ProcessState, SimExecState};
use simforge_core::simulation::Simulation;
use simforge_core::test_utils::Counter;

const SEED: u64 = 23;
const NUM_ARRIVALS: u64 = 10;
const MEAN_INTER_ARRIVAL: f64 = 1.0;
const MEAN_SERVICE: f64 = 0.85;

/// Outcome of the model for seed 23: two jobs are still in the system when
/// the last one arrives.
const EXPECTED: Outcome = Outcome {
    num_created: 10,
    num_served: 8,
    sim_time: 13.695017764345064,
};

// ===========================================================================
// Random streams
// ===========================================================================

/// Exponential draws from one ChaCha stream of the shared seed.
struct Draws {
    rng: ChaCha8Rng,
    dist: Exp<f64>,
}

impl Draws {
    fn new(stream: u64, mean: f64) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(SEED);
        rng.set_stream(stream);
        Self {
            rng,
            dist: Exp::new(1.0 / mean).unwrap(),
        }
    }

    fn arrivals() -> Self {
        Self::new(0, MEAN_INTER_ARRIVAL)
    }

    fn services() -> Self {
        Self::new(1, MEAN_SERVICE)
    }

    fn next(&mut self) -> f64 {
        self.dist.sample(&mut self.rng)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Outcome {
    num_created: u64,
    num_served: u64,
    sim_time: f64,
}

fn run(sim: &Simulation) -> Outcome {
    let results = sim.perform_run().unwrap();
    assert_eq!(sim.state(), SimExecState::Finished);
    Outcome {
        num_created: results.get_u64("numCreated").unwrap(),
        num_served: results.get_u64("numServed").unwrap(),
        sim_time: results.get_f64("simTime").unwrap(),
    }
}

/// Record the counters and stop the run. Called at the last arrival.
fn close_shop(sim: &Simulation, created: &Counter, served: &Counter) -> ModelResult {
    sim.add_result("numCreated", created.get());
    sim.add_result("numServed", served.get());
    sim.end()?;
    Ok(())
}

// ===========================================================================
// Encoding 1: producer and consumer processes
// ===========================================================================

fn with_processes() -> Outcome {
    let sim = Simulation::new(SimConfig::new("processes")).unwrap();
    let queue = Arc::new(Mutex::new(VecDeque::new()));
    let created = Counter::new();
    let served = Counter::new();

    let server = {
        let queue = Arc::clone(&queue);
        let served = served.clone();
        let mut services = Draws::services();
        sim.activate_named("server", move |ctx: &ProcessContext| -> ModelResult {
            loop {
                let next = queue.lock().unwrap().pop_front();
                match next {
                    Some(_job) => {
                        ctx.wait_for(services.next())?;
                        served.increment();
                    }
                    None => ctx.suspend()?,
                }
            }
        })
        .unwrap()
    };

    let mut arrivals = Draws::arrivals();
    sim.activate_named("source", move |ctx: &ProcessContext| -> ModelResult {
        for job in 0..NUM_ARRIVALS {
            ctx.wait_for(arrivals.next())?;
            queue.lock().unwrap().push_back(job);
            created.increment();
            if server.state() == ProcessState::Passive {
                server.resume()?;
            }
        }
        close_shop(ctx.sim(), &created, &served)
    })
    .unwrap();

    run(&sim)
}

// ===========================================================================
// Encoding 2: one process per job, seizing a resource
// ===========================================================================

fn with_resource() -> Outcome {
    let sim = Simulation::new(SimConfig::new("resource")).unwrap();
    let machine = Resource::new("machine", 1);
    let services = Arc::new(Mutex::new(Draws::services()));
    let created = Counter::new();
    let served = Counter::new();

    let mut arrivals = Draws::arrivals();
    sim.activate_named("source", move |ctx: &ProcessContext| -> ModelResult {
        for job in 0..NUM_ARRIVALS {
            ctx.wait_for(arrivals.next())?;
            created.increment();

            let machine = machine.clone();
            let services = Arc::clone(&services);
            let served = served.clone();
            let job = ctx.sim().process(format!("job-{job}"), move |ctx: &ProcessContext| -> ModelResult {
                machine.seize(ctx)?;
                let service = services.lock().unwrap().next();
                ctx.wait_for(service)?;
                served.increment();
                machine.release(ctx.sim())?;
                Ok(())
            });
            job.awake_in(0.0)?;
        }
        close_shop(ctx.sim(), &created, &served)
    })
    .unwrap();

    run(&sim)
}

// ===========================================================================
// Encoding 3: plain events
// ===========================================================================

struct Shop {
    waiting: u64,
    busy: bool,
    created: Counter,
    served: Counter,
    arrivals: Draws,
    services: Draws,
}

type SharedShop = Arc<Mutex<Shop>>;

fn on_arrival(sim: &Simulation, shop: SharedShop) -> ModelResult {
    let (service, next_arrival) = {
        let mut s = shop.lock().unwrap();
        s.created.increment();
        let service = if s.busy {
            s.waiting += 1;
            None
        } else {
            s.busy = true;
            Some(s.services.next())
        };
        let next = (s.created.get() < NUM_ARRIVALS).then(|| s.arrivals.next());
        (service, next)
    };

    if let Some(service) = service {
        let shop = Arc::clone(&shop);
        sim.schedule_in(service, move |sim: &Simulation| on_departure(sim, shop))?;
    }
    match next_arrival {
        Some(delay) => {
            sim.schedule_in(delay, move |sim: &Simulation| on_arrival(sim, shop))?;
            Ok(())
        }
        None => {
            let s = shop.lock().unwrap();
            close_shop(sim, &s.created, &s.served)
        }
    }
}

fn on_departure(sim: &Simulation, shop: SharedShop) -> ModelResult {
    let service = {
        let mut s = shop.lock().unwrap();
        s.served.increment();
        if s.waiting > 0 {
            s.waiting -= 1;
            Some(s.services.next())
        } else {
            s.busy = false;
            None
        }
    };
    if let Some(service) = service {
        sim.schedule_in(service, move |sim: &Simulation| on_departure(sim, shop))?;
    }
    Ok(())
}

fn with_events() -> Outcome {
    let sim = Simulation::new(SimConfig::new("events")).unwrap();
    let mut shop = Shop {
        waiting: 0,
        busy: false,
        created: Counter::new(),
        served: Counter::new(),
        arrivals: Draws::arrivals(),
        services: Draws::services(),
    };
    let first = shop.arrivals.next();
    let shop = Arc::new(Mutex::new(shop));
    sim.schedule_at(first, move |sim: &Simulation| on_arrival(sim, shop))
        .unwrap();
    run(&sim)
}

// ===========================================================================
// Tests
// ===========================================================================

#[test]
fn all_encodings_agree() {
    let processes = with_processes();
    let resource = with_resource();
    let events = with_events();

    assert_eq!(processes, EXPECTED);
    assert!(processes.num_served < processes.num_created);

    assert_eq!(processes, resource);
    assert_eq!(processes, events);
    assert_eq!(processes.sim_time.to_bits(), resource.sim_time.to_bits());
    assert_eq!(processes.sim_time.to_bits(), events.sim_time.to_bits());
}

#[test]
fn run_ends_at_the_last_arrival() {
    let mut arrivals = Draws::arrivals();
    let mut last_arrival = 0.0;
    for _ in 0..NUM_ARRIVALS {
        last_arrival += arrivals.next();
    }
    assert_eq!(with_processes().sim_time, last_arrival);
}

#[test]
fn encodings_are_deterministic() {
    assert_eq!(with_events(), with_events());
    assert_eq!(with_resource(), with_resource());
}
