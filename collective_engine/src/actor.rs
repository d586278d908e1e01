/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The collective actor: the one executor shared by every algorithm.
//!
//! An actor owns one participant's action graph and buffers. It issues
//! every action whose dependencies have completed, counts down the
//! dependencies of each action's dependents as it completes, and is done
//! when no action is left. Sends complete on injection (or on the
//! transport's acknowledgement when so configured); receives complete when
//! the matching message is applied. Messages that arrive before their
//! receive is issued are kept aside until it is.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::algorithm::Algorithm;
use crate::algorithm::Layout;
use crate::buffer::ActorBuffers;
use crate::buffer::BufferSlot;
use crate::communicator::Communicator;
use crate::dag::Action;
use crate::dag::ActionId;
use crate::dag::ActionKind;
use crate::dag::BufferPolicy;
use crate::dag::Dag;
use crate::dag::RecvOp;
use crate::dag::Segment;
use crate::error::CollectiveError;
use crate::kind::CollectiveKey;
use crate::message::Header;
use crate::message::Message;
use crate::message::Payload;
use crate::message::WorkMessage;
use crate::reduce::Reduction;
use crate::transport::CqId;
use crate::transport::Transport;

/// Everything an actor needs to put messages on the wire.
pub(crate) struct Link<'a> {
    pub transport: &'a mut dyn Transport,
    pub comm: &'a Communicator,
    pub key: CollectiveKey,
    pub epoch: u64,
    pub cq: CqId,
    /// Sends wait for the transport's acknowledgement.
    pub acknowledged: bool,
}

impl Link<'_> {
    fn send(&mut self, from: usize, action: &Action, payload: Payload) -> Result<u64, CollectiveError> {
        let dst = self.comm.rank_to_physical(action.partner)?;
        let flow_id = self.transport.allocate_flow_id();
        let message = WorkMessage {
            header: Header {
                src: self.transport.rank(),
                dst,
                cq: self.cq,
                flow_id,
            },
            key: self.key,
            epoch: self.epoch,
            src_rank: from,
            dst_rank: action.partner,
            round: action.round,
            nelems: action.nelems(),
            payload,
            ack_requested: self.acknowledged,
        };
        self.transport.send(Message::Work(message))?;
        Ok(flow_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum Phase {
    /// Graph built and buffers staged.
    Init,
    Running,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ActionState {
    Blocked,
    Issued,
    Done,
}

/// Why an actor that is not done cannot make progress by itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StuckReport {
    pub key: CollectiveKey,
    pub epoch: u64,
    pub rank: usize,
    /// `(partner, round)` of every issued receive still waiting.
    pub waiting_on: Vec<(usize, u32)>,
    /// Actions still blocked on dependencies.
    pub blocked: usize,
}

impl fmt::Display for StuckReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} epoch {} rank {}: waiting on {:?}, {} blocked",
            self.key, self.epoch, self.rank, self.waiting_on, self.blocked
        )
    }
}

pub struct CollectiveActor {
    key: CollectiveKey,
    layout: Layout,
    dag: Dag,
    algorithm: Arc<dyn Algorithm>,
    reduction: Option<Reduction>,
    unmet: Vec<usize>,
    states: Vec<ActionState>,
    recv_index: HashMap<(usize, u32), ActionId>,
    early: HashMap<ActionId, WorkMessage>,
    awaiting_ack: HashMap<u64, ActionId>,
    buffers: Option<ActorBuffers>,
    scratch: Vec<BufferSlot>,
    last_recv: Option<Payload>,
    remaining: usize,
    phase: Phase,
}

impl CollectiveActor {
    pub fn new(
        key: CollectiveKey,
        layout: Layout,
        algorithm: Arc<dyn Algorithm>,
        reduction: Option<Reduction>,
        src: Option<&Bytes>,
        dst: Option<Vec<u8>>,
    ) -> Result<Self, CollectiveError> {
        let dag = algorithm.build_dag(&layout)?;
        let buffers = algorithm
            .init_buffers(&layout, src, dst)
            .map_err(|err| CollectiveError::BufferTooSmall {
                kind: layout.kind,
                tag: layout.tag,
                needed: err.needed,
                actual: err.actual,
            })?;
        let unmet = (0..dag.len()).map(|id| dag.dependencies(id).len()).collect();
        let recv_index = dag.recvs().map(|a| ((a.partner, a.round), a.id)).collect();
        Ok(Self {
            key,
            remaining: dag.len(),
            states: vec![ActionState::Blocked; dag.len()],
            unmet,
            recv_index,
            layout,
            dag,
            algorithm,
            reduction,
            early: HashMap::new(),
            awaiting_ack: HashMap::new(),
            buffers: Some(buffers),
            scratch: Vec::new(),
            last_recv: None,
            phase: Phase::Init,
        })
    }

    pub fn rank(&self) -> usize {
        self.layout.me
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_done(&self) -> bool {
        self.phase == Phase::Done
    }

    pub fn dag(&self) -> &Dag {
        &self.dag
    }

    /// Bytes currently held in scratch regions.
    pub fn scratch_bytes(&self) -> usize {
        self.scratch.iter().map(BufferSlot::len).sum()
    }

    /// Issue the initially ready actions.
    pub(crate) fn start(&mut self, link: &mut Link<'_>) -> Result<(), CollectiveError> {
        if self.phase != Phase::Init {
            return Err(CollectiveError::protocol(self.key, "actor started twice"));
        }
        self.phase = Phase::Running;
        let ready = self.dag.initial().into();
        self.run(link, ready)
    }

    /// Apply a message addressed to this actor.
    pub(crate) fn recv(&mut self, link: &mut Link<'_>, message: WorkMessage) -> Result<(), CollectiveError> {
        let partner = message.src_rank;
        let round = message.round;
        let Some(&id) = self.recv_index.get(&(partner, round)) else {
            return Err(CollectiveError::protocol(
                self.key,
                format!(
                    "rank {} has no receive from rank {} in round {}",
                    self.layout.me, partner, round
                ),
            ));
        };
        match self.states[id] {
            ActionState::Done => Err(CollectiveError::protocol(
                self.key,
                format!(
                    "rank {} got a second message from rank {} in round {}",
                    self.layout.me, partner, round
                ),
            )),
            ActionState::Blocked => {
                if self.early.contains_key(&id) {
                    return Err(CollectiveError::protocol(
                        self.key,
                        format!("duplicate early message from rank {} in round {}", partner, round),
                    ));
                }
                tracing::trace!(key = %self.key, rank = self.layout.me, partner, round, "holding early message");
                self.early.insert(id, message);
                Ok(())
            }
            ActionState::Issued => {
                self.land(id, message)?;
                let mut ready = VecDeque::new();
                self.complete(id, &mut ready);
                self.run(link, ready)
            }
        }
    }

    /// Complete the send that was injected with `flow_id`.
    pub(crate) fn ack(&mut self, link: &mut Link<'_>, flow_id: u64) -> Result<(), CollectiveError> {
        let Some(id) = self.awaiting_ack.remove(&flow_id) else {
            return Err(CollectiveError::protocol(
                self.key,
                format!("unexpected acknowledgement for flow {}", flow_id),
            ));
        };
        let mut ready = VecDeque::new();
        self.complete(id, &mut ready);
        self.run(link, ready)
    }

    /// Take the result out of a done actor.
    pub fn finish(&mut self) -> Option<Vec<u8>> {
        let buffers = self.buffers.take()?;
        self.algorithm.finalize(&self.layout, buffers)
    }

    pub fn stuck(&self, epoch: u64) -> Option<StuckReport> {
        if self.is_done() || !self.awaiting_ack.is_empty() {
            return None;
        }
        let waiting_on = self
            .dag
            .recvs()
            .filter(|a| self.states[a.id] == ActionState::Issued)
            .map(|a| (a.partner, a.round))
            .collect();
        let blocked = self
            .states
            .iter()
            .filter(|s| **s == ActionState::Blocked)
            .count();
        Some(StuckReport {
            key: self.key,
            epoch,
            rank: self.layout.me,
            waiting_on,
            blocked,
        })
    }

    fn run(&mut self, link: &mut Link<'_>, mut ready: VecDeque<ActionId>) -> Result<(), CollectiveError> {
        while let Some(id) = ready.pop_front() {
            self.states[id] = ActionState::Issued;
            match self.dag.action(id).kind {
                ActionKind::Send => {
                    let payload = self.outgoing(id)?;
                    let flow_id = link.send(self.layout.me, self.dag.action(id), payload)?;
                    if link.acknowledged {
                        self.awaiting_ack.insert(flow_id, id);
                    } else {
                        self.complete(id, &mut ready);
                    }
                }
                ActionKind::Recv => {
                    if let Some(message) = self.early.remove(&id) {
                        self.land(id, message)?;
                        self.complete(id, &mut ready);
                    }
                }
            }
        }
        if self.remaining == 0 && self.phase == Phase::Running {
            self.phase = Phase::Done;
            self.scratch.clear();
            self.last_recv = None;
            tracing::trace!(key = %self.key, rank = self.layout.me, "actor done");
        }
        Ok(())
    }

    fn complete(&mut self, id: ActionId, ready: &mut VecDeque<ActionId>) {
        self.states[id] = ActionState::Done;
        self.remaining -= 1;
        for &dependent in self.dag.dependents(id) {
            self.unmet[dependent] -= 1;
            if self.unmet[dependent] == 0 {
                ready.push_back(dependent);
            }
        }
    }

    fn outgoing(&mut self, id: ActionId) -> Result<Payload, CollectiveError> {
        let action = self.dag.action(id);
        let Some(buffers) = &self.buffers else {
            return Err(CollectiveError::protocol(self.key, "send after finish"));
        };
        let policy = action.policy;
        let read = |work: &BufferSlot| {
            work.read(&action.segments, self.layout.type_size)
                .map_err(|err| CollectiveError::protocol(self.key, err.to_string()))
        };
        let payload = match (policy, &self.last_recv) {
            (BufferPolicy::PrevRecv, Some(payload)) => payload.clone(),
            _ => read(&buffers.work)?,
        };
        match policy {
            // Sent out of a packed scratch region.
            BufferPolicy::UnpackTemp => self.stage(&payload),
            _ => Ok(payload),
        }
    }

    /// Copy `payload` into a new scratch region, held until the actor is
    /// done, and return a view of the region.
    fn stage(&mut self, payload: &Payload) -> Result<Payload, CollectiveError> {
        let slot = temp(payload);
        let staged = slot
            .read(&[Segment::new(0, slot.len())], 1)
            .map_err(|err| CollectiveError::protocol(self.key, err.to_string()))?;
        self.scratch.push(slot);
        Ok(staged)
    }

    fn land(&mut self, id: ActionId, message: WorkMessage) -> Result<(), CollectiveError> {
        let action = self.dag.action(id);
        let expected = action.nelems();
        let bytes = self.layout.bytes(expected);
        if message.nelems != expected || message.payload.len() != bytes {
            return Err(CollectiveError::protocol(
                self.key,
                format!(
                    "rank {} expected {} elements ({} bytes) from rank {} in round {}, got {} ({} bytes)",
                    self.layout.me,
                    expected,
                    bytes,
                    action.partner,
                    action.round,
                    message.nelems,
                    message.payload.len()
                ),
            ));
        }
        // Non-contiguous data lands packed in scratch and is unpacked from
        // there.
        let payload = if action.policy == BufferPolicy::UnpackTemp {
            self.stage(&message.payload)?
        } else {
            message.payload
        };
        let action = self.dag.action(id);
        let Some(buffers) = self.buffers.as_mut() else {
            return Err(CollectiveError::protocol(self.key, "receive after finish"));
        };
        let type_size = self.layout.type_size;
        let applied = match action.op {
            RecvOp::Copy => buffers.work.write(&action.segments, type_size, &payload),
            RecvOp::Reduce => {
                let Some(reduction) = &self.reduction else {
                    return Err(CollectiveError::MissingReduction {
                        kind: self.layout.kind,
                        tag: self.layout.tag,
                    });
                };
                buffers
                    .work
                    .reduce(&action.segments, type_size, &payload, reduction)
            }
        };
        applied.map_err(|err| CollectiveError::protocol(self.key, err.to_string()))?;
        self.last_recv = Some(payload);
        Ok(())
    }
}

/// A scratch region holding a packed payload.
fn temp(payload: &Payload) -> BufferSlot {
    match payload {
        Payload::Data(bytes) => BufferSlot::Scratch(bytes.to_vec()),
        Payload::Phantom(len) => BufferSlot::Phantom(*len),
    }
}

impl fmt::Debug for CollectiveActor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectiveActor")
            .field("key", &self.key)
            .field("rank", &self.layout.me)
            .field("algorithm", &self.algorithm.name())
            .field("phase", &self.phase)
            .field("remaining", &self.remaining)
            .finish()
    }
}
