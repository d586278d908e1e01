/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! An in-memory mesh of engines for tests.

use std::cell::RefCell;
use std::rc::Rc;

use rand::Rng;
use rand::SeedableRng;
use rand::rngs::SmallRng;

use crate::config::EngineConfig;
use crate::engine::CollectiveEngine;
use crate::error::CollectiveError;
use crate::instance::Completion;
use crate::message::Message;
use crate::operation::Operation;
use crate::transport::CqId;
use crate::transport::PhysicalRank;
use crate::transport::Transport;
use crate::transport::TransportError;

/// The order in which the mesh hands out messages in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    Fifo,
    Lifo,
    Shuffled(u64),
}

struct Wire {
    size: usize,
    in_flight: Vec<Message>,
    rng: Option<SmallRng>,
    lifo: bool,
    flows: u64,
    /// Refuse every send.
    closed: bool,
}

impl Wire {
    fn new(size: usize, delivery: Delivery) -> Self {
        Self {
            size,
            in_flight: Vec::new(),
            rng: match delivery {
                Delivery::Shuffled(seed) => Some(SmallRng::seed_from_u64(seed)),
                _ => None,
            },
            lifo: delivery == Delivery::Lifo,
            flows: 0,
            closed: false,
        }
    }

    /// The index of the next message among those matching `select`.
    fn next_index(&mut self, select: impl Fn(&Message) -> bool) -> Option<usize> {
        let candidates: Vec<usize> = self
            .in_flight
            .iter()
            .enumerate()
            .filter(|(_, m)| select(m))
            .map(|(i, _)| i)
            .collect();
        if candidates.is_empty() {
            return None;
        }
        let pick = match &mut self.rng {
            Some(rng) => rng.gen_range(0..candidates.len()),
            None if self.lifo => candidates.len() - 1,
            None => 0,
        };
        Some(candidates[pick])
    }

    fn take(&mut self, select: impl Fn(&Message) -> bool) -> Option<Message> {
        let index = self.next_index(select)?;
        Some(self.in_flight.remove(index))
    }
}

/// One rank's end of the mesh.
pub(crate) struct MeshTransport {
    rank: PhysicalRank,
    wire: Rc<RefCell<Wire>>,
}

impl Transport for MeshTransport {
    fn rank(&self) -> PhysicalRank {
        self.rank
    }

    fn send(&mut self, message: Message) -> Result<(), TransportError> {
        let mut wire = self.wire.borrow_mut();
        if wire.closed {
            return Err(TransportError::Closed);
        }
        let dst = message.header().dst;
        if dst >= wire.size {
            return Err(TransportError::UnknownDestination(dst));
        }
        // Injection is immediate.
        if let Some(ack) = message.as_work().and_then(|w| w.ack()) {
            wire.in_flight.push(ack);
        }
        wire.in_flight.push(message);
        Ok(())
    }

    fn blocking_poll(&mut self, cq: CqId) -> Result<Message, TransportError> {
        let rank = self.rank;
        self.wire
            .borrow_mut()
            .take(|m| m.header().dst == rank && m.header().cq == cq)
            .ok_or(TransportError::Idle { rank, cq })
    }

    fn allocate_flow_id(&mut self) -> u64 {
        let mut wire = self.wire.borrow_mut();
        wire.flows += 1;
        wire.flows
    }
}

/// `size` engines sharing one wire.
pub(crate) struct Mesh {
    pub engines: Vec<CollectiveEngine<MeshTransport>>,
    wire: Rc<RefCell<Wire>>,
}

impl Mesh {
    pub fn new(size: usize, delivery: Delivery) -> Self {
        Self::with_config(size, delivery, EngineConfig::default())
    }

    pub fn with_config(size: usize, delivery: Delivery, config: EngineConfig) -> Self {
        let wire = Rc::new(RefCell::new(Wire::new(size, delivery)));
        let engines = (0..size)
            .map(|rank| {
                let transport = MeshTransport {
                    rank,
                    wire: wire.clone(),
                };
                CollectiveEngine::new(transport, size, config.clone()).unwrap()
            })
            .collect();
        Self { engines, wire }
    }

    pub fn start(&mut self, rank: PhysicalRank, op: Operation) -> Result<Option<Completion>, CollectiveError> {
        self.engines[rank].start(op)
    }

    /// Start `op(rank)` on every rank; returns the completions that were
    /// immediate.
    pub fn start_all(&mut self, op: impl Fn(PhysicalRank) -> Operation) -> Vec<(PhysicalRank, Completion)> {
        let mut done = Vec::new();
        for rank in 0..self.engines.len() {
            if let Some(completion) = self.start(rank, op(rank)).unwrap() {
                done.push((rank, completion));
            }
        }
        done
    }

    /// Put a message on the wire as if a peer had sent it.
    pub fn inject(&mut self, message: Message) {
        self.wire.borrow_mut().in_flight.push(message);
    }

    /// Make every send fail until reopened.
    pub fn set_closed(&mut self, closed: bool) {
        self.wire.borrow_mut().closed = closed;
    }

    pub fn in_flight(&self) -> usize {
        self.wire.borrow().in_flight.len()
    }

    /// Deliver messages until none are in flight.
    pub fn try_run(&mut self) -> Result<Vec<(PhysicalRank, Completion)>, CollectiveError> {
        let mut done = Vec::new();
        loop {
            let next = self.wire.borrow_mut().take(|_| true);
            let Some(message) = next else {
                return Ok(done);
            };
            let dst = message.header().dst;
            if let Some(completion) = self.engines[dst].incoming(message)? {
                done.push((dst, completion));
            }
        }
    }

    pub fn run(&mut self) -> Vec<(PhysicalRank, Completion)> {
        self.try_run().unwrap()
    }
}
