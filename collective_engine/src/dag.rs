/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Action graphs: the send/receive steps one participant executes for one
//! occurrence of a collective, with their dependencies.
//!
//! Graphs are assembled with a [`DagBuilder`]. Dependencies may only name
//! actions that already exist, so every graph the builder accepts is acyclic
//! and, when non-empty, has at least one initially ready action.

use std::collections::HashSet;

/// Index of an action within its graph.
pub type ActionId = usize;

/// Round number used by steps that fold surplus ranks into a power-of-two
/// group before the main rounds.
pub const FOLD_IN: u32 = u32::MAX - 1;

/// Round number used by steps that hand results back to folded ranks.
pub const FOLD_OUT: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ActionKind {
    Send,
    Recv,
}

/// Where an action reads or writes its data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum BufferPolicy {
    /// Directly in the actor's working buffer.
    InPlace,
    /// Forward the payload of the most recent completed receive as is.
    PrevRecv,
    /// Through a scratch region owned by the actor until it is done. Used
    /// for packed or non-contiguous data.
    UnpackTemp,
}

/// What a receive does with the arriving data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecvOp {
    Copy,
    Reduce,
}

/// A range of elements within the working buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Segment {
    pub offset: usize,
    pub nelems: usize,
}

impl Segment {
    pub fn new(offset: usize, nelems: usize) -> Self {
        Self { offset, nelems }
    }

    /// The segment covering elements `[start, end)`.
    pub fn span(start: usize, end: usize) -> Self {
        Self {
            offset: start,
            nelems: end.saturating_sub(start),
        }
    }

    pub fn end(&self) -> usize {
        self.offset + self.nelems
    }
}

/// One send or receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action {
    pub id: ActionId,
    pub kind: ActionKind,
    /// Communicator rank of the peer.
    pub partner: usize,
    /// Algorithm round; a receive is matched by `(partner, round)`.
    pub round: u32,
    /// Element ranges, packed in order into one message.
    pub segments: Vec<Segment>,
    pub policy: BufferPolicy,
    pub op: RecvOp,
}

impl Action {
    pub fn nelems(&self) -> usize {
        self.segments.iter().map(|s| s.nelems).sum()
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DagError {
    #[error("action {action} depends on unknown action {dependency}")]
    UnknownDependency {
        action: ActionId,
        dependency: ActionId,
    },

    #[error("partner {partner} out of range for group of size {size}")]
    PartnerOutOfRange { partner: usize, size: usize },

    #[error("two receives from partner {partner} in round {round}")]
    DuplicateRecv { partner: usize, round: u32 },
}

/// A validated action graph.
#[derive(Debug, Clone)]
pub struct Dag {
    actions: Vec<Action>,
    dependents: Vec<Vec<ActionId>>,
    dependencies: Vec<Vec<ActionId>>,
}

impl Dag {
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    pub fn action(&self, id: ActionId) -> &Action {
        &self.actions[id]
    }

    /// Actions that wait on `id`.
    pub fn dependents(&self, id: ActionId) -> &[ActionId] {
        &self.dependents[id]
    }

    /// Actions `id` waits on.
    pub fn dependencies(&self, id: ActionId) -> &[ActionId] {
        &self.dependencies[id]
    }

    /// Actions with no dependencies, in insertion order.
    pub fn initial(&self) -> Vec<ActionId> {
        (0..self.len())
            .filter(|id| self.dependencies[*id].is_empty())
            .collect()
    }

    /// Number of actions on the longest dependency chain.
    pub fn depth(&self) -> usize {
        let mut depth = vec![0usize; self.len()];
        for id in 0..self.len() {
            depth[id] = 1 + self.dependencies[id]
                .iter()
                .map(|dep| depth[*dep])
                .max()
                .unwrap_or(0);
        }
        depth.into_iter().max().unwrap_or(0)
    }

    pub fn sends(&self) -> impl Iterator<Item = &Action> {
        self.actions.iter().filter(|a| a.kind == ActionKind::Send)
    }

    pub fn recvs(&self) -> impl Iterator<Item = &Action> {
        self.actions.iter().filter(|a| a.kind == ActionKind::Recv)
    }
}

/// Incrementally builds a [`Dag`].
///
/// Actions can be added with explicit dependencies ([`DagBuilder::send`],
/// [`DagBuilder::recv`]) or in rounds: after [`DagBuilder::next_round`],
/// [`DagBuilder::round_send`] waits for every action of the previous
/// non-empty round, and [`DagBuilder::round_recv`] additionally waits for the
/// sends already added to the current round.
#[derive(Debug)]
pub struct DagBuilder {
    size: usize,
    actions: Vec<Action>,
    dependencies: Vec<Vec<ActionId>>,
    recvs: HashSet<(usize, u32)>,
    previous: Vec<ActionId>,
    current: Vec<ActionId>,
    current_sends: Vec<ActionId>,
    error: Option<DagError>,
}

impl DagBuilder {
    /// A builder for a participant of a group with `size` ranks.
    pub fn new(size: usize) -> Self {
        Self {
            size,
            actions: Vec::new(),
            dependencies: Vec::new(),
            recvs: HashSet::new(),
            previous: Vec::new(),
            current: Vec::new(),
            current_sends: Vec::new(),
            error: None,
        }
    }

    pub fn send(
        &mut self,
        partner: usize,
        round: u32,
        segments: Vec<Segment>,
        policy: BufferPolicy,
        deps: &[ActionId],
    ) -> ActionId {
        self.push(ActionKind::Send, partner, round, segments, policy, RecvOp::Copy, deps)
    }

    pub fn recv(
        &mut self,
        partner: usize,
        round: u32,
        segments: Vec<Segment>,
        policy: BufferPolicy,
        op: RecvOp,
        deps: &[ActionId],
    ) -> ActionId {
        if !self.recvs.insert((partner, round)) && self.error.is_none() {
            self.error = Some(DagError::DuplicateRecv { partner, round });
        }
        self.push(ActionKind::Recv, partner, round, segments, policy, op, deps)
    }

    /// Close the current round. Empty rounds are skipped over.
    pub fn next_round(&mut self) {
        if !self.current.is_empty() {
            self.previous = std::mem::take(&mut self.current);
        }
        self.current_sends.clear();
    }

    pub fn round_send(
        &mut self,
        partner: usize,
        round: u32,
        segments: Vec<Segment>,
        policy: BufferPolicy,
    ) -> ActionId {
        let deps = self.previous.clone();
        let id = self.send(partner, round, segments, policy, &deps);
        self.current.push(id);
        self.current_sends.push(id);
        id
    }

    pub fn round_recv(
        &mut self,
        partner: usize,
        round: u32,
        segments: Vec<Segment>,
        policy: BufferPolicy,
        op: RecvOp,
    ) -> ActionId {
        let mut deps = self.previous.clone();
        deps.extend_from_slice(&self.current_sends);
        let id = self.recv(partner, round, segments, policy, op, &deps);
        self.current.push(id);
        id
    }

    pub fn build(self) -> Result<Dag, DagError> {
        if let Some(err) = self.error {
            return Err(err);
        }
        let mut dependents = vec![Vec::new(); self.actions.len()];
        for (id, deps) in self.dependencies.iter().enumerate() {
            for dep in deps {
                dependents[*dep].push(id);
            }
        }
        Ok(Dag {
            actions: self.actions,
            dependents,
            dependencies: self.dependencies,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn push(
        &mut self,
        kind: ActionKind,
        partner: usize,
        round: u32,
        segments: Vec<Segment>,
        policy: BufferPolicy,
        op: RecvOp,
        deps: &[ActionId],
    ) -> ActionId {
        let id = self.actions.len();
        if self.error.is_none() {
            if partner >= self.size {
                self.error = Some(DagError::PartnerOutOfRange {
                    partner,
                    size: self.size,
                });
            } else if let Some(dependency) = deps.iter().copied().find(|dep| *dep >= id) {
                self.error = Some(DagError::UnknownDependency {
                    action: id,
                    dependency,
                });
            }
        }
        let mut deps = deps.to_vec();
        deps.sort_unstable();
        deps.dedup();
        self.actions.push(Action {
            id,
            kind,
            partner,
            round,
            segments,
            policy,
            op,
        });
        self.dependencies.push(deps);
        id
    }
}
