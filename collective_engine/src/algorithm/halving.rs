/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The reduce family on a recursive halving/doubling skeleton.
//!
//! Groups whose size `n` is not a power of two are first folded onto the
//! largest power of two `p <= n`: among the first `2r` ranks (`r = n - p`)
//! each even rank hands its whole vector to its odd neighbour and sits out
//! the main rounds, getting its result back at the end. The remaining `p`
//! ranks are numbered densely as virtual ranks.
//!
//! In the halving rounds each virtual rank splits its current window of
//! blocks with the partner at the round's stride, sends the half it gives
//! up and reduces the half it keeps. Allreduce then reverses the rounds to
//! gather the reduced blocks back (doubling); reduce-scatter stops after
//! halving; reduce gathers the blocks up a binomial tree to the root.

use std::ops::Range;

use bytes::Bytes;

use crate::algorithm::Algorithm;
use crate::algorithm::Layout;
use crate::buffer::ActorBuffers;
use crate::buffer::BufferError;
use crate::dag::BufferPolicy;
use crate::dag::Dag;
use crate::dag::DagBuilder;
use crate::dag::DagError;
use crate::dag::FOLD_IN;
use crate::dag::FOLD_OUT;
use crate::dag::RecvOp;
use crate::dag::Segment;
use crate::kind::CollectiveKind;

/// The fold of `n` ranks onto a power of two.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fold {
    pub n: usize,
    pub p: usize,
    pub r: usize,
}

impl Fold {
    pub fn new(n: usize) -> Self {
        let n = n.max(1);
        let p = 1 << (usize::BITS - 1 - n.leading_zeros());
        Self { n, p, r: n - p }
    }

    /// Number of halving (or doubling) rounds.
    pub fn rounds(&self) -> u32 {
        self.p.trailing_zeros()
    }

    /// The virtual rank of `rank`, or `None` if it is folded away.
    pub fn virtual_rank(&self, rank: usize) -> Option<usize> {
        if rank < 2 * self.r {
            (rank % 2 == 1).then_some(rank / 2)
        } else {
            Some(rank - self.r)
        }
    }

    pub fn real_rank(&self, virtual_rank: usize) -> usize {
        if virtual_rank < self.r {
            2 * virtual_rank + 1
        } else {
            virtual_rank + self.r
        }
    }

    /// Add the fold-in step for `rank`, where `to_comm` maps positions in
    /// the folded numbering to communicator ranks. Returns the virtual
    /// rank, or `None` for ranks folded away.
    fn fold_in(
        &self,
        b: &mut DagBuilder,
        rank: usize,
        to_comm: impl Fn(usize) -> usize,
        whole: &[Segment],
        policy: BufferPolicy,
    ) -> Option<usize> {
        if rank < 2 * self.r {
            if rank % 2 == 0 {
                b.round_send(to_comm(rank + 1), FOLD_IN, whole.to_vec(), BufferPolicy::InPlace);
            } else {
                b.round_recv(to_comm(rank - 1), FOLD_IN, whole.to_vec(), policy, RecvOp::Reduce);
            }
            b.next_round();
        }
        self.virtual_rank(rank)
    }
}

/// One halving round as seen by one virtual rank.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Step {
    partner: usize,
    keep: Range<usize>,
    give: Range<usize>,
}

/// The halving rounds of virtual rank `v` among `p`. With `ascending`
/// strides the round-`k` partner is `v ^ 2^k`; otherwise strides start at
/// `p/2`, which leaves `v` with block `v`.
fn halving_steps(v: usize, p: usize, ascending: bool) -> Vec<Step> {
    let rounds = p.trailing_zeros();
    let mut window = 0..p;
    let mut steps = Vec::with_capacity(rounds as usize);
    for k in 0..rounds {
        let mask = if ascending { 1 << k } else { p >> (k + 1) };
        let mid = (window.start + window.end) / 2;
        let (keep, give) = if v & mask == 0 {
            (window.start..mid, mid..window.end)
        } else {
            (mid..window.end, window.start..mid)
        };
        steps.push(Step {
            partner: v ^ mask,
            keep: keep.clone(),
            give,
        });
        window = keep;
    }
    steps
}

/// Element segment of the virtual blocks `blocks`, where block `i` starts
/// at element `bound(i)`.
fn blocks(blocks: &Range<usize>, bound: &impl Fn(usize) -> usize) -> Vec<Segment> {
    vec![Segment::span(bound(blocks.start), bound(blocks.end))]
}

fn whole(layout: &Layout) -> Vec<Segment> {
    vec![Segment::new(0, layout.count)]
}

/// Bandwidth-optimal allreduce: reduce-scatter by recursive halving, then
/// allgather by recursive doubling.
#[derive(Debug)]
pub struct HalvingAllreduce;

impl Algorithm for HalvingAllreduce {
    fn name(&self) -> &'static str {
        "halving"
    }

    fn kind(&self) -> CollectiveKind {
        CollectiveKind::Allreduce
    }

    fn build_dag(&self, layout: &Layout) -> Result<Dag, DagError> {
        let fold = Fold::new(layout.size);
        let policy = layout.recv_policy();
        let all = whole(layout);
        let mut b = DagBuilder::new(layout.size);
        let Some(v) = fold.fold_in(&mut b, layout.me, |r| r, &all, policy) else {
            b.round_recv(layout.me + 1, FOLD_OUT, all, policy, RecvOp::Copy);
            return b.build();
        };

        let count = layout.count;
        let p = fold.p;
        let bound = move |i: usize| i * count / p;
        let steps = halving_steps(v, p, true);
        let mut round = 1;
        for step in &steps {
            let partner = fold.real_rank(step.partner);
            b.round_send(partner, round, blocks(&step.give, &bound), BufferPolicy::InPlace);
            b.round_recv(partner, round, blocks(&step.keep, &bound), policy, RecvOp::Reduce);
            b.next_round();
            round += 1;
        }
        for step in steps.iter().rev() {
            let partner = fold.real_rank(step.partner);
            b.round_send(partner, round, blocks(&step.keep, &bound), BufferPolicy::InPlace);
            b.round_recv(partner, round, blocks(&step.give, &bound), policy, RecvOp::Copy);
            b.next_round();
            round += 1;
        }
        if layout.me < 2 * fold.r {
            b.round_send(layout.me - 1, FOLD_OUT, all, BufferPolicy::InPlace);
        }
        b.build()
    }
}

/// Latency-optimal allreduce: every round exchanges and reduces the whole
/// vector with the partner at distance `2^k`.
#[derive(Debug)]
pub struct RecursiveDoublingAllreduce;

impl Algorithm for RecursiveDoublingAllreduce {
    fn name(&self) -> &'static str {
        "recursive_doubling"
    }

    fn kind(&self) -> CollectiveKind {
        CollectiveKind::Allreduce
    }

    fn build_dag(&self, layout: &Layout) -> Result<Dag, DagError> {
        let fold = Fold::new(layout.size);
        let policy = layout.recv_policy();
        let all = whole(layout);
        let mut b = DagBuilder::new(layout.size);
        let Some(v) = fold.fold_in(&mut b, layout.me, |r| r, &all, policy) else {
            b.round_recv(layout.me + 1, FOLD_OUT, all, policy, RecvOp::Copy);
            return b.build();
        };
        for k in 0..fold.rounds() {
            let partner = fold.real_rank(v ^ (1 << k));
            b.round_send(partner, 1 + k, all.clone(), BufferPolicy::InPlace);
            b.round_recv(partner, 1 + k, all.clone(), policy, RecvOp::Reduce);
            b.next_round();
        }
        if layout.me < 2 * fold.r {
            b.round_send(layout.me - 1, FOLD_OUT, all, BufferPolicy::InPlace);
        }
        b.build()
    }
}

/// Reduce-scatter with equal blocks: the halving rounds alone, with strides
/// chosen so that each virtual rank ends on the blocks of the real ranks it
/// stands for.
#[derive(Debug)]
pub struct HalvingReduceScatter;

impl Algorithm for HalvingReduceScatter {
    fn name(&self) -> &'static str {
        "halving"
    }

    fn kind(&self) -> CollectiveKind {
        CollectiveKind::ReduceScatter
    }

    fn build_dag(&self, layout: &Layout) -> Result<Dag, DagError> {
        let n = layout.size;
        let count = layout.count;
        let fold = Fold::new(n);
        let policy = layout.recv_policy();
        let all = vec![Segment::new(0, n * count)];
        let mine = vec![Segment::new(layout.me * count, count)];
        let mut b = DagBuilder::new(n);
        let Some(v) = fold.fold_in(&mut b, layout.me, |r| r, &all, policy) else {
            b.round_recv(layout.me + 1, FOLD_OUT, mine, policy, RecvOp::Copy);
            return b.build();
        };

        // Virtual rank i stands for real ranks [start(i), start(i + 1)).
        let r = fold.r;
        let bound = move |i: usize| if i < r { 2 * i * count } else { (i + r) * count };
        for (k, step) in halving_steps(v, fold.p, false).iter().enumerate() {
            let partner = fold.real_rank(step.partner);
            let round = 1 + k as u32;
            b.round_send(partner, round, blocks(&step.give, &bound), BufferPolicy::InPlace);
            b.round_recv(partner, round, blocks(&step.keep, &bound), policy, RecvOp::Reduce);
            b.next_round();
        }
        if layout.me < 2 * fold.r {
            let folded = layout.me - 1;
            b.round_send(
                folded,
                FOLD_OUT,
                vec![Segment::new(folded * count, count)],
                BufferPolicy::InPlace,
            );
        }
        b.build()
    }

    fn init_buffers(
        &self,
        layout: &Layout,
        src: Option<&Bytes>,
        dst: Option<Vec<u8>>,
    ) -> Result<ActorBuffers, BufferError> {
        layout.stage(src, dst, layout.size * layout.count, 0, false)
    }

    fn finalize(&self, layout: &Layout, buffers: ActorBuffers) -> Option<Vec<u8>> {
        let start = layout.bytes(layout.me * layout.count);
        buffers.deliver(start..start + layout.bytes(layout.count))
    }
}

/// Reduce to a root: halving rounds, then a binomial gather of the reduced
/// blocks to virtual rank 0, which hands the result to the root when the
/// root was folded away. Ranks are taken relative to the root.
#[derive(Debug)]
pub struct HalvingReduce;

impl Algorithm for HalvingReduce {
    fn name(&self) -> &'static str {
        "halving"
    }

    fn kind(&self) -> CollectiveKind {
        CollectiveKind::Reduce
    }

    fn build_dag(&self, layout: &Layout) -> Result<Dag, DagError> {
        let fold = Fold::new(layout.size);
        let policy = layout.recv_policy();
        let all = whole(layout);
        let rel = layout.rel();
        let to_comm = |r: usize| layout.abs(r);
        let mut b = DagBuilder::new(layout.size);
        let Some(v) = fold.fold_in(&mut b, rel, to_comm, &all, policy) else {
            if rel == 0 {
                b.round_recv(to_comm(fold.real_rank(0)), FOLD_OUT, all, policy, RecvOp::Copy);
            }
            return b.build();
        };

        let count = layout.count;
        let p = fold.p;
        let bound = move |i: usize| i * count / p;
        let steps = halving_steps(v, p, false);
        let mut round = 1;
        for step in &steps {
            let partner = to_comm(fold.real_rank(step.partner));
            b.round_send(partner, round, blocks(&step.give, &bound), BufferPolicy::InPlace);
            b.round_recv(partner, round, blocks(&step.keep, &bound), policy, RecvOp::Reduce);
            b.next_round();
            round += 1;
        }

        // Virtual rank v now owns block v. Gather up the binomial tree.
        let mut mask = 1;
        while mask < p {
            if v & mask != 0 {
                let partner = to_comm(fold.real_rank(v - mask));
                b.round_send(partner, round, blocks(&(v..v + mask), &bound), BufferPolicy::InPlace);
                break;
            }
            let partner = to_comm(fold.real_rank(v + mask));
            let window = v + mask..v + 2 * mask;
            b.round_recv(partner, round, blocks(&window, &bound), policy, RecvOp::Copy);
            b.next_round();
            mask <<= 1;
            round += 1;
        }
        if v == 0 && rel != 0 {
            b.round_send(to_comm(0), FOLD_OUT, all, BufferPolicy::InPlace);
        }
        b.build()
    }

    fn init_buffers(
        &self,
        layout: &Layout,
        src: Option<&Bytes>,
        dst: Option<Vec<u8>>,
    ) -> Result<ActorBuffers, BufferError> {
        layout.stage(src, dst, layout.count, 0, layout.is_root())
    }
}
