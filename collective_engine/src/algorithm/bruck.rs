/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Bruck-style algorithms: `ceil(log2 n)` rounds of exchanges at
//! power-of-two distances, on a buffer rotated so that this rank's own data
//! sits first.

use bytes::Bytes;

use crate::algorithm::Algorithm;
use crate::algorithm::Layout;
use crate::algorithm::fill;
use crate::algorithm::offsets;
use crate::buffer::ActorBuffers;
use crate::buffer::BufferError;
use crate::dag::BufferPolicy;
use crate::dag::Dag;
use crate::dag::DagBuilder;
use crate::dag::DagError;
use crate::dag::RecvOp;
use crate::dag::Segment;
use crate::kind::CollectiveKind;

/// Allgather and allgatherv. Position `j` of the working buffer holds the
/// block of rank `me + j`; in round `k` a rank sends its first
/// `min(2^k, n - 2^k)` blocks to `me - 2^k` and appends the same number
/// from `me + 2^k`.
#[derive(Debug)]
pub struct BruckAllgather(pub CollectiveKind);

impl BruckAllgather {
    fn rotated_offsets(layout: &Layout) -> Vec<usize> {
        let n = layout.size;
        offsets((0..n).map(|j| layout.count_of((layout.me + j) % n)))
    }
}

impl Algorithm for BruckAllgather {
    fn name(&self) -> &'static str {
        "bruck"
    }

    fn kind(&self) -> CollectiveKind {
        self.0
    }

    fn build_dag(&self, layout: &Layout) -> Result<Dag, DagError> {
        let n = layout.size;
        let me = layout.me;
        let off = Self::rotated_offsets(layout);
        let mut b = DagBuilder::new(n);
        let mut stride = 1;
        let mut round = 0;
        while stride < n {
            let blocks = stride.min(n - stride);
            b.round_send(
                (me + n - stride) % n,
                round,
                vec![Segment::span(off[0], off[blocks])],
                BufferPolicy::InPlace,
            );
            b.round_recv(
                (me + stride) % n,
                round,
                vec![Segment::span(off[stride], off[stride + blocks])],
                layout.recv_policy(),
                RecvOp::Copy,
            );
            b.next_round();
            stride <<= 1;
            round += 1;
        }
        b.build()
    }

    fn init_buffers(
        &self,
        layout: &Layout,
        src: Option<&Bytes>,
        dst: Option<Vec<u8>>,
    ) -> Result<ActorBuffers, BufferError> {
        layout.stage(src, dst, layout.output_elems(), 0, false)
    }

    fn finalize(&self, layout: &Layout, buffers: ActorBuffers) -> Option<Vec<u8>> {
        let n = layout.size;
        let ActorBuffers { work, dst } = buffers;
        let work = work.into_vec()?;
        let rotated = Self::rotated_offsets(layout);
        let mut out = Vec::with_capacity(work.len());
        for rank in 0..n {
            let j = (rank + n - layout.me) % n;
            out.extend_from_slice(work.get(layout.bytes(rotated[j])..layout.bytes(rotated[j + 1]))?);
        }
        Some(fill(dst, out))
    }
}

/// Dissemination barrier: in round `k` notify `me + 2^k` and wait for
/// `me - 2^k`.
#[derive(Debug)]
pub struct DisseminationBarrier;

impl Algorithm for DisseminationBarrier {
    fn name(&self) -> &'static str {
        "bruck"
    }

    fn kind(&self) -> CollectiveKind {
        CollectiveKind::Barrier
    }

    fn build_dag(&self, layout: &Layout) -> Result<Dag, DagError> {
        let n = layout.size;
        let me = layout.me;
        let mut b = DagBuilder::new(n);
        let mut stride = 1;
        let mut round = 0;
        while stride < n {
            b.round_send((me + stride) % n, round, Vec::new(), BufferPolicy::InPlace);
            b.round_recv(
                (me + n - stride) % n,
                round,
                Vec::new(),
                BufferPolicy::InPlace,
                RecvOp::Copy,
            );
            b.next_round();
            stride <<= 1;
            round += 1;
        }
        b.build()
    }

    fn finalize(&self, _layout: &Layout, _buffers: ActorBuffers) -> Option<Vec<u8>> {
        None
    }
}

/// All-to-all. Position `j` starts with the block for rank `me + j`; in
/// round `k` every block whose position has bit `k` set moves `2^k` ranks
/// forward. A round's blocks are gathered into one message; non-contiguous
/// elements go through scratch on both ends.
#[derive(Debug)]
pub struct BruckAlltoall;

impl Algorithm for BruckAlltoall {
    fn name(&self) -> &'static str {
        "bruck"
    }

    fn kind(&self) -> CollectiveKind {
        CollectiveKind::Alltoall
    }

    fn build_dag(&self, layout: &Layout) -> Result<Dag, DagError> {
        let n = layout.size;
        let me = layout.me;
        let count = layout.count;
        let policy = layout.recv_policy();
        let mut b = DagBuilder::new(n);
        let mut stride = 1;
        let mut round = 0;
        while stride < n {
            let moving: Vec<Segment> = (0..n)
                .filter(|j| j & stride != 0)
                .map(|j| Segment::new(j * count, count))
                .collect();
            b.round_send(
                (me + stride) % n,
                round,
                moving.clone(),
                policy,
            );
            b.round_recv(
                (me + n - stride) % n,
                round,
                moving,
                policy,
                RecvOp::Copy,
            );
            b.next_round();
            stride <<= 1;
            round += 1;
        }
        b.build()
    }

    fn init_buffers(
        &self,
        layout: &Layout,
        src: Option<&Bytes>,
        dst: Option<Vec<u8>>,
    ) -> Result<ActorBuffers, BufferError> {
        let n = layout.size;
        let block = layout.bytes(layout.count);
        let total = layout.bytes(n * layout.count);
        let Some(input) = layout.contribution(src.map(|b| &b[..]), dst.as_deref()) else {
            return ActorBuffers::stage(None, dst, total, 0, false);
        };
        let mut rotated = Vec::with_capacity(total);
        for j in 0..n {
            let start = ((layout.me + j) % n) * block;
            rotated.extend_from_slice(input.get(start..start + block).unwrap_or(&[]));
        }
        ActorBuffers::stage(Some(&rotated), dst, total, 0, false)
    }

    fn finalize(&self, layout: &Layout, buffers: ActorBuffers) -> Option<Vec<u8>> {
        let n = layout.size;
        let block = layout.bytes(layout.count);
        let ActorBuffers { work, dst } = buffers;
        let work = work.into_vec()?;
        let mut out = Vec::with_capacity(work.len());
        // Position j now holds the block from rank me - j.
        for from in 0..n {
            let j = (layout.me + n - from) % n;
            out.extend_from_slice(work.get(j * block..(j + 1) * block)?);
        }
        Some(fill(dst, out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithm::tests::layout;

    #[test]
    fn test_allgather_rounds() {
        let dag = BruckAllgather(CollectiveKind::Allgather)
            .build_dag(&layout(CollectiveKind::Allgather, 5, 1, 0, 2))
            .unwrap();
        let sends: Vec<(usize, Vec<Segment>)> =
            dag.sends().map(|a| (a.partner, a.segments.clone())).collect();
        assert_eq!(
            sends,
            vec![
                (0, vec![Segment::new(0, 2)]),
                (4, vec![Segment::new(0, 4)]),
                (2, vec![Segment::new(0, 2)]),
            ]
        );
        let recvs: Vec<(usize, Vec<Segment>)> =
            dag.recvs().map(|a| (a.partner, a.segments.clone())).collect();
        assert_eq!(
            recvs,
            vec![
                (2, vec![Segment::new(2, 2)]),
                (3, vec![Segment::new(4, 4)]),
                (0, vec![Segment::new(8, 2)]),
            ]
        );
    }

    #[test]
    fn test_allgatherv_message_sizes_agree() {
        let counts = vec![3, 0, 1, 5];
        let n = counts.len();
        let dags: Vec<Dag> = (0..n)
            .map(|me| {
                let mut l = layout(CollectiveKind::Allgatherv, n, me, 0, 0);
                l.counts = counts.clone();
                BruckAllgather(CollectiveKind::Allgatherv).build_dag(&l).unwrap()
            })
            .collect();
        for (me, dag) in dags.iter().enumerate() {
            for send in dag.sends() {
                let recv = dags[send.partner]
                    .recvs()
                    .find(|r| r.partner == me && r.round == send.round)
                    .unwrap();
                assert_eq!(recv.nelems(), send.nelems());
            }
        }
    }

    #[test]
    fn test_alltoall_moves_bit_blocks() {
        let dag = BruckAlltoall
            .build_dag(&layout(CollectiveKind::Alltoall, 4, 0, 0, 1))
            .unwrap();
        let segments: Vec<Vec<Segment>> = dag.sends().map(|a| a.segments.clone()).collect();
        assert_eq!(
            segments,
            vec![
                vec![Segment::new(1, 1), Segment::new(3, 1)],
                vec![Segment::new(2, 1), Segment::new(3, 1)],
            ]
        );
    }

    #[test]
    fn test_alltoall_policy_follows_layout() {
        let mut l = layout(CollectiveKind::Alltoall, 4, 2, 0, 1);
        let dag = BruckAlltoall.build_dag(&l).unwrap();
        assert!(dag.sends().chain(dag.recvs()).all(|a| a.policy == BufferPolicy::InPlace));

        l.contiguous = false;
        let dag = BruckAlltoall.build_dag(&l).unwrap();
        assert!(dag.sends().chain(dag.recvs()).all(|a| a.policy == BufferPolicy::UnpackTemp));
    }

    #[test]
    fn test_barrier_has_no_payload() {
        let dag = DisseminationBarrier
            .build_dag(&layout(CollectiveKind::Barrier, 3, 0, 0, 0))
            .unwrap();
        assert_eq!(dag.len(), 4);
        assert!(dag.actions().iter().all(|a| a.nelems() == 0));
    }
}
