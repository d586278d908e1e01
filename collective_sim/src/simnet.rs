/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! A discrete-event network for running collective engines.
//!
//! Every physical rank gets a [`SimTransport`]. Sends are scheduled for
//! delivery at a simulated time computed from the sender's injection queue,
//! the message size, the link bandwidth and the edge latency. A
//! [`Simulation`] owns one engine per rank and fires events in time order,
//! handing each delivered message to its destination engine.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::rc::Rc;
use std::time::Duration;

use collective_engine::CollectiveEngine;
use collective_engine::CollectiveError;
use collective_engine::CollectiveKey;
use collective_engine::Completion;
use collective_engine::CqId;
use collective_engine::EngineConfig;
use collective_engine::Message;
use collective_engine::Operation;
use collective_engine::PhysicalRank;
use collective_engine::StuckReport;
use collective_engine::Transport;
use collective_engine::TransportError;
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::SmallRng;
use serde::Deserialize;
use serde::Serialize;
use serde_with::serde_as;

/// Simulated time in nanoseconds.
pub type SimulatorTimeInstant = u64;

/// Errors raised while simulating.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum SimNetError {
    /// An invalid parameter was encountered.
    #[error("invalid arg: {0}")]
    InvalidArg(String),

    /// A rank outside the simulated network.
    #[error("invalid node: {0}")]
    InvalidNode(PhysicalRank),

    /// An engine rejected an operation or a message.
    #[error("rank {rank}: {source}")]
    Engine {
        rank: PhysicalRank,
        #[source]
        source: CollectiveError,
    },
}

#[serde_as]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SimNetEdgeInfo {
    #[serde_as(as = "serde_with::DurationSeconds<f64>")]
    pub latency: Duration,
}

/// A per-edge latency override.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeConfig {
    pub src: PhysicalRank,
    pub dst: PhysicalRank,
    pub metadata: SimNetEdgeInfo,
}

/// Random extra latency, reproducible from its seed. Lets later messages
/// overtake earlier ones.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JitterConfig {
    #[serde_as(as = "serde_with::DurationSeconds<f64>")]
    pub max: Duration,
    pub seed: u64,
}

/// The network model.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Latency of every edge without an override.
    #[serde_as(as = "serde_with::DurationSeconds<f64>")]
    pub latency: Duration,
    /// Link bandwidth in bytes per second.
    pub bandwidth: f64,
    /// Per-message cost of putting a message on the wire. Messages from one
    /// rank are injected one after another.
    #[serde_as(as = "serde_with::DurationSeconds<f64>")]
    pub injection: Duration,
    pub edges: Vec<EdgeConfig>,
    pub jitter: Option<JitterConfig>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            latency: Duration::from_micros(1),
            bandwidth: 10e9,
            injection: Duration::from_nanos(100),
            edges: Vec::new(),
            jitter: None,
        }
    }
}

impl NetworkConfig {
    /// Create a new configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, SimNetError> {
        let config: NetworkConfig = serde_yaml::from_str(yaml)
            .map_err(|err| SimNetError::InvalidArg(format!("failed to parse config: {}", err)))?;
        if config.bandwidth.is_nan() || config.bandwidth <= 0.0 {
            return Err(SimNetError::InvalidArg(format!(
                "bandwidth must be positive, got {}",
                config.bandwidth
            )));
        }
        Ok(config)
    }

    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self, anyhow::Error> {
        let yaml = fs::read_to_string(path)?;
        Ok(Self::from_yaml(&yaml)?)
    }
}

/// Bookkeeping for one message on the wire.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SimulatorEventRecord {
    pub summary: String,
    /// When the sender handed the message to the network.
    pub start_at: SimulatorTimeInstant,
    /// When the message reached its destination.
    pub end_at: SimulatorTimeInstant,
}

/// When a rank finished an occurrence.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompletionRecord {
    pub rank: PhysicalRank,
    pub key: CollectiveKey,
    pub epoch: u64,
    pub at: SimulatorTimeInstant,
    pub completion: Completion,
}

struct ScheduledEvent {
    time: SimulatorTimeInstant,
    message: Message,
}

struct State {
    size: usize,
    now: SimulatorTimeInstant,
    /// Events by delivery time; events at one instant fire in the order
    /// they were scheduled.
    scheduled_events: BTreeMap<SimulatorTimeInstant, VecDeque<ScheduledEvent>>,
    /// When each rank's injection queue is next free.
    nic_free: Vec<SimulatorTimeInstant>,
    latency: SimulatorTimeInstant,
    edges: HashMap<(PhysicalRank, PhysicalRank), SimulatorTimeInstant>,
    bandwidth: f64,
    injection: SimulatorTimeInstant,
    jitter: Option<(SimulatorTimeInstant, SmallRng)>,
    records: Vec<SimulatorEventRecord>,
    flows: u64,
}

fn nanos(duration: Duration) -> SimulatorTimeInstant {
    duration.as_nanos().try_into().unwrap_or(u64::MAX)
}

fn summary(message: &Message) -> String {
    match message {
        Message::Work(work) => format!(
            "{} epoch {}: rank {} -> {} round {} ({} bytes)",
            work.key,
            work.epoch,
            work.src_rank,
            work.dst_rank,
            work.round,
            work.payload.len()
        ),
        Message::Ack(ack) => format!(
            "{} epoch {}: ack flow {} to rank {}",
            ack.key, ack.epoch, ack.header.flow_id, ack.local_rank
        ),
    }
}

impl State {
    fn new(size: usize, config: &NetworkConfig) -> Self {
        Self {
            size,
            now: 0,
            scheduled_events: BTreeMap::new(),
            nic_free: vec![0; size],
            latency: nanos(config.latency),
            edges: config
                .edges
                .iter()
                .map(|e| ((e.src, e.dst), nanos(e.metadata.latency)))
                .collect(),
            bandwidth: config.bandwidth,
            injection: nanos(config.injection),
            jitter: config
                .jitter
                .as_ref()
                .map(|j| (nanos(j.max), SmallRng::seed_from_u64(j.seed))),
            records: Vec::new(),
            flows: 0,
        }
    }

    fn schedule(&mut self, time: SimulatorTimeInstant, message: Message) {
        self.records.push(SimulatorEventRecord {
            summary: summary(&message),
            start_at: self.now,
            end_at: time,
        });
        self.scheduled_events
            .entry(time)
            .or_default()
            .push_back(ScheduledEvent { time, message });
    }

    fn send(&mut self, src: PhysicalRank, message: Message) -> Result<(), TransportError> {
        let dst = message.header().dst;
        if dst >= self.size {
            return Err(TransportError::UnknownDestination(dst));
        }
        let bytes = message.wire_len() as f64;
        let transfer = (bytes / self.bandwidth * 1e9) as SimulatorTimeInstant;
        let start = self.now.max(self.nic_free[src]);
        let injected = start + self.injection + transfer;
        self.nic_free[src] = injected;
        let latency = self.edges.get(&(src, dst)).copied().unwrap_or(self.latency);
        let jitter = match &mut self.jitter {
            Some((max, rng)) if *max > 0 => rng.gen_range(0..*max),
            _ => 0,
        };
        if let Some(ack) = message.as_work().and_then(|w| w.ack()) {
            self.schedule(injected, ack);
        }
        self.schedule(injected + latency + jitter, message);
        Ok(())
    }

    fn pop(&mut self) -> Option<ScheduledEvent> {
        let mut entry = self.scheduled_events.first_entry()?;
        let events = entry.get_mut();
        let event = events.pop_front();
        if events.is_empty() {
            entry.remove();
        }
        event
    }
}

/// A handle on the shared network state.
#[derive(Clone)]
pub struct SimNet {
    state: Rc<RefCell<State>>,
}

impl SimNet {
    pub fn new(size: usize, config: &NetworkConfig) -> Self {
        Self {
            state: Rc::new(RefCell::new(State::new(size, config))),
        }
    }

    pub fn size(&self) -> usize {
        self.state.borrow().size
    }

    /// The transport of `rank`.
    pub fn transport(&self, rank: PhysicalRank) -> Result<SimTransport, SimNetError> {
        if rank >= self.size() {
            return Err(SimNetError::InvalidNode(rank));
        }
        Ok(SimTransport {
            rank,
            net: self.clone(),
        })
    }

    pub fn now(&self) -> SimulatorTimeInstant {
        self.state.borrow().now
    }

    /// Events not yet fired.
    pub fn in_flight(&self) -> usize {
        self.state
            .borrow()
            .scheduled_events
            .values()
            .map(VecDeque::len)
            .sum()
    }

    pub fn records(&self) -> Vec<SimulatorEventRecord> {
        self.state.borrow().records.clone()
    }

    /// Advance the clock to the earliest event and return its message.
    fn next_event(&self) -> Option<Message> {
        let mut state = self.state.borrow_mut();
        let event = state.pop()?;
        state.now = state.now.max(event.time);
        Some(event.message)
    }
}

/// One rank's endpoint on a [`SimNet`].
pub struct SimTransport {
    rank: PhysicalRank,
    net: SimNet,
}

impl Transport for SimTransport {
    fn rank(&self) -> PhysicalRank {
        self.rank
    }

    fn send(&mut self, message: Message) -> Result<(), TransportError> {
        self.net.state.borrow_mut().send(self.rank, message)
    }

    /// Delivery is driven by the [`Simulation`], which hands every message
    /// to its engine when it arrives; there is never anything to poll.
    fn blocking_poll(&mut self, cq: CqId) -> Result<Message, TransportError> {
        Err(TransportError::Idle { rank: self.rank, cq })
    }

    fn allocate_flow_id(&mut self) -> u64 {
        let mut state = self.net.state.borrow_mut();
        state.flows += 1;
        state.flows
    }
}

/// One engine per rank on a shared simulated network.
pub struct Simulation {
    net: SimNet,
    engines: Vec<CollectiveEngine<SimTransport>>,
    completions: Vec<CompletionRecord>,
}

impl Simulation {
    pub fn new(size: usize, network: &NetworkConfig, config: &EngineConfig) -> Result<Self, SimNetError> {
        if size == 0 {
            return Err(SimNetError::InvalidArg("a simulation needs at least one rank".to_string()));
        }
        let net = SimNet::new(size, network);
        let engines = (0..size)
            .map(|rank| {
                CollectiveEngine::new(net.transport(rank)?, size, config.clone())
                    .map_err(|source| SimNetError::Engine { rank, source })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            net,
            engines,
            completions: Vec::new(),
        })
    }

    pub fn size(&self) -> usize {
        self.engines.len()
    }

    pub fn net(&self) -> &SimNet {
        &self.net
    }

    /// Simulated time elapsed.
    pub fn now(&self) -> Duration {
        Duration::from_nanos(self.net.now())
    }

    pub fn engine(&self, rank: PhysicalRank) -> Option<&CollectiveEngine<SimTransport>> {
        self.engines.get(rank)
    }

    pub fn engine_mut(&mut self, rank: PhysicalRank) -> Option<&mut CollectiveEngine<SimTransport>> {
        self.engines.get_mut(rank)
    }

    /// Start `op` on `rank` at the current simulated time.
    pub fn start(&mut self, rank: PhysicalRank, op: Operation) -> Result<(), SimNetError> {
        let engine = self
            .engines
            .get_mut(rank)
            .ok_or(SimNetError::InvalidNode(rank))?;
        let done = engine
            .start(op)
            .map_err(|source| SimNetError::Engine { rank, source })?;
        if let Some(completion) = done {
            self.record(rank, completion);
        }
        Ok(())
    }

    /// Start `op(rank)` on every rank.
    pub fn start_all(&mut self, op: impl Fn(PhysicalRank) -> Operation) -> Result<(), SimNetError> {
        for rank in 0..self.size() {
            self.start(rank, op(rank))?;
        }
        Ok(())
    }

    /// Fire the next event. Returns false when none is left.
    pub fn step(&mut self) -> Result<bool, SimNetError> {
        let Some(message) = self.net.next_event() else {
            return Ok(false);
        };
        let rank = message.header().dst;
        let engine = self
            .engines
            .get_mut(rank)
            .ok_or(SimNetError::InvalidNode(rank))?;
        if let Some(completion) = engine
            .incoming(message)
            .map_err(|source| SimNetError::Engine { rank, source })?
        {
            self.record(rank, completion);
        }
        Ok(true)
    }

    /// Fire events until the network is quiet, and return the completions
    /// since the last call.
    pub fn run(&mut self) -> Result<Vec<CompletionRecord>, SimNetError> {
        while self.step()? {}
        Ok(std::mem::take(&mut self.completions))
    }

    /// Stuck reports of every rank.
    pub fn deadlock_check(&self) -> Vec<(PhysicalRank, StuckReport)> {
        self.engines
            .iter()
            .enumerate()
            .flat_map(|(rank, engine)| {
                engine
                    .deadlock_check()
                    .into_iter()
                    .map(move |report| (rank, report))
            })
            .collect()
    }

    fn record(&mut self, rank: PhysicalRank, completion: Completion) {
        let at = self.net.now();
        tracing::debug!(rank, key = %completion.key, epoch = completion.epoch, at, "rank completed");
        self.completions.push(CompletionRecord {
            rank,
            key: completion.key,
            epoch: completion.epoch,
            at,
            completion,
        });
    }
}
