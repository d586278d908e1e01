/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! One occurrence of a collective on one physical rank.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::actor::CollectiveActor;
use crate::actor::Link;
use crate::actor::StuckReport;
use crate::algorithm::Algorithm;
use crate::communicator::Communicator;
use crate::error::CollectiveError;
use crate::kind::CollectiveKey;
use crate::message::AckMessage;
use crate::message::WorkMessage;
use crate::operation::Operation;
use crate::transport::CqId;
use crate::transport::Transport;

/// The result of one finished occurrence on one physical rank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub key: CollectiveKey,
    pub epoch: u64,
    pub cq: CqId,
    /// Per resident communicator rank, its destination buffer (or the
    /// engine-allocated result when none was given). `None` for ranks that
    /// produce no data, or phantom runs without a destination.
    pub outputs: BTreeMap<usize, Option<Vec<u8>>>,
}

impl Completion {
    pub fn output(&self, rank: usize) -> Option<&[u8]> {
        self.outputs.get(&rank)?.as_deref()
    }

    /// The output of the only (or lowest) resident rank.
    pub fn into_output(self) -> Option<Vec<u8>> {
        self.outputs.into_values().next().flatten()
    }
}

/// Binds an algorithm occurrence to its key, communicator and the actors of
/// the communicator ranks resident here.
#[derive(Debug)]
pub struct CollectiveInstance {
    key: CollectiveKey,
    comm: Arc<Communicator>,
    algorithm: Arc<dyn Algorithm>,
    cq: CqId,
    persistent: bool,
    epoch: u64,
    /// Communicator ranks living on this physical rank.
    resident: Vec<usize>,
    actors: BTreeMap<usize, CollectiveActor>,
    outputs: BTreeMap<usize, Option<Vec<u8>>>,
    /// Messages for resident ranks that have not joined yet.
    deferred: Vec<WorkMessage>,
    complete: bool,
}

impl CollectiveInstance {
    pub(crate) fn new(
        key: CollectiveKey,
        comm: Arc<Communicator>,
        algorithm: Arc<dyn Algorithm>,
        epoch: u64,
        cq: CqId,
        persistent: bool,
        resident: Vec<usize>,
    ) -> Self {
        Self {
            key,
            comm,
            algorithm,
            cq,
            persistent,
            epoch,
            resident,
            actors: BTreeMap::new(),
            outputs: BTreeMap::new(),
            deferred: Vec::new(),
            complete: false,
        }
    }

    pub fn key(&self) -> CollectiveKey {
        self.key
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn cq(&self) -> CqId {
        self.cq
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn algorithm(&self) -> &str {
        self.algorithm.name()
    }

    /// Whether `rank` has started in this occurrence.
    pub fn joined(&self, rank: usize) -> bool {
        self.actors.contains_key(&rank) || self.outputs.contains_key(&rank)
    }

    /// Live actors.
    pub fn actor_count(&self) -> usize {
        self.actors.len()
    }

    /// Start the actor of `rank` and hand it the messages that arrived for
    /// it before it joined.
    pub(crate) fn join(
        &mut self,
        transport: &mut dyn Transport,
        acknowledged: bool,
        op: Operation,
        rank: usize,
    ) -> Result<Option<Completion>, CollectiveError> {
        if self.complete || self.joined(rank) {
            return Err(CollectiveError::TagInUse { key: self.key });
        }
        let mut actor = CollectiveActor::new(
            self.key,
            op.layout(rank),
            self.algorithm.clone(),
            op.reduction,
            op.src.as_ref(),
            op.dst,
        )?;
        let mut link = Link {
            transport,
            comm: &self.comm,
            key: self.key,
            epoch: self.epoch,
            cq: self.cq,
            acknowledged,
        };
        actor.start(&mut link)?;
        let (mine, others): (Vec<_>, Vec<_>) = std::mem::take(&mut self.deferred)
            .into_iter()
            .partition(|m| m.dst_rank == rank);
        self.deferred = others;
        for message in mine {
            actor.recv(&mut link, message)?;
        }
        tracing::trace!(key = %self.key, epoch = self.epoch, rank, "actor joined");
        self.actors.insert(rank, actor);
        Ok(self.check_done())
    }

    pub(crate) fn deliver(
        &mut self,
        transport: &mut dyn Transport,
        acknowledged: bool,
        message: WorkMessage,
    ) -> Result<Option<Completion>, CollectiveError> {
        if self.complete || message.epoch != self.epoch {
            return Err(CollectiveError::protocol(
                self.key,
                format!(
                    "message for epoch {} reached {} occurrence {}",
                    message.epoch,
                    if self.complete { "complete" } else { "live" },
                    self.epoch
                ),
            ));
        }
        let rank = message.dst_rank;
        if !self.resident.contains(&rank) {
            return Err(CollectiveError::protocol(
                self.key,
                format!(
                    "rank {} is not resident on physical rank {}",
                    rank,
                    transport.rank()
                ),
            ));
        }
        let Some(actor) = self.actors.get_mut(&rank) else {
            if self.outputs.contains_key(&rank) {
                return Err(CollectiveError::protocol(
                    self.key,
                    format!("message from rank {} after rank {} finished", message.src_rank, rank),
                ));
            }
            self.deferred.push(message);
            return Ok(None);
        };
        let mut link = Link {
            transport,
            comm: &self.comm,
            key: self.key,
            epoch: self.epoch,
            cq: self.cq,
            acknowledged,
        };
        actor.recv(&mut link, message)?;
        Ok(self.check_done())
    }

    pub(crate) fn ack(
        &mut self,
        transport: &mut dyn Transport,
        acknowledged: bool,
        ack: &AckMessage,
    ) -> Result<Option<Completion>, CollectiveError> {
        let Some(actor) = self.actors.get_mut(&ack.local_rank) else {
            return Err(CollectiveError::protocol(
                self.key,
                format!("acknowledgement for rank {} with no live actor", ack.local_rank),
            ));
        };
        let mut link = Link {
            transport,
            comm: &self.comm,
            key: self.key,
            epoch: self.epoch,
            cq: self.cq,
            acknowledged,
        };
        actor.ack(&mut link, ack.header.flow_id)?;
        Ok(self.check_done())
    }

    /// Make a complete persistent instance ready for the next occurrence.
    pub(crate) fn rearm(&mut self, epoch: u64, cq: CqId) {
        self.epoch = epoch;
        self.cq = cq;
        self.complete = false;
        self.outputs.clear();
        self.deferred.clear();
    }

    /// Undo [`Self::rearm`] after the occurrence failed to start.
    pub(crate) fn disarm(&mut self, epoch: u64, cq: CqId) {
        self.epoch = epoch;
        self.cq = cq;
        self.complete = true;
        self.actors.clear();
        self.outputs.clear();
        self.deferred.clear();
    }

    pub fn stuck_reports(&self) -> Vec<StuckReport> {
        if self.complete {
            return Vec::new();
        }
        self.actors
            .values()
            .filter_map(|actor| actor.stuck(self.epoch))
            .collect()
    }

    /// Collect the results of finished actors; complete once every resident
    /// rank has one.
    fn check_done(&mut self) -> Option<Completion> {
        let finished: Vec<usize> = self
            .actors
            .iter()
            .filter(|(_, actor)| actor.is_done())
            .map(|(rank, _)| *rank)
            .collect();
        for rank in finished {
            if let Some(mut actor) = self.actors.remove(&rank) {
                self.outputs.insert(rank, actor.finish());
            }
        }
        if self.outputs.len() < self.resident.len() {
            return None;
        }
        self.complete = true;
        Some(Completion {
            key: self.key,
            epoch: self.epoch,
            cq: self.cq,
            outputs: std::mem::take(&mut self.outputs),
        })
    }
}
