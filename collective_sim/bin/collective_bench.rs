/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use clap::Parser;
use collective_engine::CollectiveKind;
use collective_engine::Communicator;
use collective_engine::EngineConfig;
use collective_sim::NetworkConfig;
use collective_sim::Simulation;
use collective_sim::Workload;
use collective_sim::run_threaded;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Cli {
    /// The collective to run
    #[arg(long, default_value = "allreduce")]
    kind: CollectiveKind,

    /// Number of ranks
    #[arg(long, default_value_t = 8)]
    ranks: usize,

    /// Elements per rank
    #[arg(long, default_value_t = 1024)]
    count: usize,

    /// Bytes per element
    #[arg(long, default_value_t = 8)]
    type_size: usize,

    #[arg(long, default_value_t = 0)]
    root: usize,

    /// Number of iterations
    #[arg(long, default_value_t = 1)]
    iterations: usize,

    /// Move sizes only, no bytes
    #[arg(long)]
    phantom: bool,

    /// Algorithm for the collective, overriding the configuration
    #[arg(long)]
    algorithm: Option<String>,

    /// YAML network model for the simulated network
    #[arg(long)]
    network: Option<PathBuf>,

    /// YAML engine configuration, layered over `COLLECTIVE_*` settings
    #[arg(long, env = "COLLECTIVE_CONFIG")]
    config: Option<PathBuf>,

    /// Run on OS threads instead of the simulated network
    #[arg(long)]
    threads: bool,
}

fn simulated(args: &Cli, config: &EngineConfig, workload: &Workload) -> anyhow::Result<()> {
    let network = match &args.network {
        Some(path) => NetworkConfig::from_yaml_file(path)?,
        None => NetworkConfig::default(),
    };
    let mut sim = Simulation::new(args.ranks, &network, config)?;
    let comm = Arc::new(Communicator::world(args.ranks)?);
    let mut times = Vec::with_capacity(args.iterations);
    for iteration in 0..args.iterations {
        let start = sim.now();
        sim.start_all(|rank| workload.operation(comm.clone(), 0, rank))?;
        let done = sim.run()?;
        if done.len() != args.ranks {
            for (rank, report) in sim.deadlock_check() {
                eprintln!("rank {}: {}", rank, report);
            }
            anyhow::bail!(
                "iteration {}: only {} of {} ranks completed",
                iteration,
                done.len(),
                args.ranks
            );
        }
        let end = done.iter().map(|r| r.at).max().unwrap_or_default();
        let elapsed = Duration::from_nanos(end).saturating_sub(start);
        tracing::info!(iteration, elapsed_us = elapsed.as_secs_f64() * 1e6, "iteration done");
        times.push(elapsed);
    }
    let messages = sim.net().records().len();
    report("simulated", args, &times);
    println!("Messages: {}", messages);
    Ok(())
}

fn threaded(args: &Cli, config: &EngineConfig, workload: &Workload) -> anyhow::Result<()> {
    let comm = Arc::new(Communicator::world(args.ranks)?);
    let mut times = Vec::with_capacity(args.iterations);
    for _ in 0..args.iterations {
        #[allow(clippy::disallowed_methods)]
        let start = Instant::now();
        let done = run_threaded(args.ranks, config, |rank| {
            workload.operation(comm.clone(), 0, rank)
        })?;
        times.push(start.elapsed());
        anyhow::ensure!(done.len() == args.ranks, "not every rank completed");
    }
    report("wall clock", args, &times);
    Ok(())
}

fn report(clock: &str, args: &Cli, times: &[Duration]) {
    let micros = |d: &Duration| d.as_secs_f64() * 1e6;
    let total: Duration = times.iter().sum();
    let avg = micros(&total) / times.len().max(1) as f64;
    let min = times.iter().min().map(micros).unwrap_or_default();
    let max = times.iter().max().map(micros).unwrap_or_default();
    println!("Results ({}):", clock);
    println!("Collective: {} over {} ranks", args.kind, args.ranks);
    println!("Payload: {} x {} bytes per rank", args.count, args.type_size);
    println!("Iterations: {}", times.len());
    println!("Average time: {:.3} us", avg);
    println!("Min time: {:.3} us", min);
    println!("Max time: {:.3} us", max);
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Cli::parse();

    let mut config = EngineConfig::from_env();
    if let Some(path) = &args.config {
        config.merge(&EngineConfig::from_yaml(path)?);
    }
    if let Some(algorithm) = &args.algorithm {
        config.algorithms.insert(args.kind, algorithm.clone());
    }
    let workload = Workload {
        kind: args.kind,
        count: args.count,
        type_size: args.type_size,
        root: args.root,
        phantom: args.phantom,
        persistent: false,
    };
    tracing::info!(kind = %args.kind, ranks = args.ranks, threads = args.threads, "starting benchmark");
    if args.threads {
        threaded(&args, &config, &workload)
    } else {
        simulated(&args, &config, &workload)
    }
}
