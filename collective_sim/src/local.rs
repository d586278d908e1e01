/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! An in-process network of OS threads.
//!
//! Each rank runs on its own thread and owns a [`LocalTransport`]. Messages
//! travel over unbounded tokio channels; [`Transport::blocking_poll`] parks
//! the calling thread until a message for the requested queue arrives.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::thread;

use collective_engine::CollectiveEngine;
use collective_engine::CollectiveError;
use collective_engine::Completion;
use collective_engine::CqId;
use collective_engine::EngineConfig;
use collective_engine::Message;
use collective_engine::Operation;
use collective_engine::PhysicalRank;
use collective_engine::Transport;
use collective_engine::TransportError;
use tokio::sync::mpsc;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::mpsc::UnboundedSender;

/// The endpoints of a fully connected in-process network.
pub struct LocalNetwork {
    transports: Vec<LocalTransport>,
}

impl LocalNetwork {
    pub fn new(size: usize) -> Self {
        let (senders, receivers): (Vec<_>, Vec<_>) =
            (0..size).map(|_| mpsc::unbounded_channel::<Message>()).unzip();
        let flows = Arc::new(AtomicU64::new(0));
        let transports = receivers
            .into_iter()
            .enumerate()
            .map(|(rank, inbox)| LocalTransport {
                rank,
                peers: senders.clone(),
                inbox,
                held: HashMap::new(),
                flows: flows.clone(),
            })
            .collect();
        Self { transports }
    }

    pub fn into_transports(self) -> Vec<LocalTransport> {
        self.transports
    }
}

pub struct LocalTransport {
    rank: PhysicalRank,
    peers: Vec<UnboundedSender<Message>>,
    inbox: UnboundedReceiver<Message>,
    /// Messages that arrived for queues nobody was polling.
    held: HashMap<CqId, VecDeque<Message>>,
    flows: Arc<AtomicU64>,
}

impl Transport for LocalTransport {
    fn rank(&self) -> PhysicalRank {
        self.rank
    }

    fn send(&mut self, message: Message) -> Result<(), TransportError> {
        let dst = message.header().dst;
        let peer = self
            .peers
            .get(dst)
            .ok_or(TransportError::UnknownDestination(dst))?;
        let ack = message.as_work().and_then(|w| w.ack());
        peer.send(message).map_err(|_| TransportError::Closed)?;
        if let Some(ack) = ack {
            self.peers[self.rank]
                .send(ack)
                .map_err(|_| TransportError::Closed)?;
        }
        Ok(())
    }

    fn blocking_poll(&mut self, cq: CqId) -> Result<Message, TransportError> {
        if let Some(message) = self.held.get_mut(&cq).and_then(VecDeque::pop_front) {
            return Ok(message);
        }
        loop {
            let message = self.inbox.blocking_recv().ok_or(TransportError::Closed)?;
            if message.header().cq == cq {
                return Ok(message);
            }
            tracing::trace!(rank = self.rank, cq = message.header().cq, "holding message for another queue");
            self.held.entry(message.header().cq).or_default().push_back(message);
        }
    }

    fn allocate_flow_id(&mut self) -> u64 {
        self.flows.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Run `op(rank)` on `size` threads, one engine each, after a barrier.
/// Returns every rank's completion, by rank.
pub fn run_threaded<F>(size: usize, config: &EngineConfig, op: F) -> Result<Vec<Completion>, CollectiveError>
where
    F: Fn(PhysicalRank) -> Operation + Sync,
{
    let transports = LocalNetwork::new(size).into_transports();
    thread::scope(|scope| {
        let handles: Vec<_> = transports
            .into_iter()
            .map(|transport| {
                let op = &op;
                scope.spawn(move || -> Result<Completion, CollectiveError> {
                    let rank = transport.rank();
                    let mut engine = CollectiveEngine::new(transport, size, config.clone())?;
                    engine.wait_barrier()?;
                    let op = op(rank);
                    let cq = op.cq;
                    let completion = match engine.start(op)? {
                        Some(completion) => completion,
                        None => engine.block_until_next(cq)?,
                    };
                    tracing::debug!(rank, key = %completion.key, "thread finished");
                    Ok(completion)
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| {
                handle
                    .join()
                    .unwrap_or_else(|panic| std::panic::resume_unwind(panic))
            })
            .collect()
    })
}
