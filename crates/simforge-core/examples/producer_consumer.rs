//! A single-server queue written as two processes.
//!
//! Run with `RUST_LOG=debug` to see the kernel's lifecycle logs, or with
//! `RUST_LOG=simforge::trace=trace` for the model's trace lines only.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Exp};
use simforge_core::config::SimConfig;
use simforge_core::error::ModelResult;
use simforge_core::process::ProcessContext;
use simforge_core::sim::ProcessState;
use simforge_core::simulation::Simulation;
use tracing_subscriber::EnvFilter;

const NUM_ARRIVALS: u32 = 10;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let sim = Simulation::new(SimConfig::new("shop"))?;
    let queue = Arc::new(Mutex::new(VecDeque::new()));
    let served = Arc::new(Mutex::new(0u32));

    let server_queue = Arc::clone(&queue);
    let server_served = Arc::clone(&served);
    let mut service = ChaCha8Rng::seed_from_u64(24);
    let service_time = Exp::new(1.0 / 0.85)?;
    let server = sim.activate_named("server", move |ctx: &ProcessContext| -> ModelResult {
        loop {
            let next = server_queue.lock().unwrap().pop_front();
            match next {
                Some(job) => {
                    ctx.wait_for(service_time.sample(&mut service))?;
                    *server_served.lock().unwrap() += 1;
                    ctx.sim().trace(&[&"served", &job]);
                }
                None => ctx.suspend()?,
            }
        }
    })?;

    let source_queue = Arc::clone(&queue);
    let mut arrivals = ChaCha8Rng::seed_from_u64(23);
    let inter_arrival = Exp::new(1.0)?;
    sim.activate_named("source", move |ctx: &ProcessContext| -> ModelResult {
        for job in 1..=NUM_ARRIVALS {
            ctx.wait_for(inter_arrival.sample(&mut arrivals))?;
            source_queue.lock().unwrap().push_back(job);
            ctx.sim().trace(&[&"arrived", &job]);
            if server.state() == ProcessState::Passive {
                server.resume()?;
            }
        }
        ctx.sim().add_result("numCreated", NUM_ARRIVALS);
        ctx.sim().end()?;
        Ok(())
    })?;

    let mut results = sim.perform_run()?;
    results.insert("numServed", *served.lock().unwrap());
    println!("{}", serde_json::to_string_pretty(&results)?);
    Ok(())
}
