/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Tree algorithms: binary-tree broadcast and binomial gather/scatter.

use bytes::Bytes;

use crate::algorithm::Algorithm;
use crate::algorithm::Layout;
use crate::algorithm::fill;
use crate::algorithm::offsets;
use crate::buffer::ActorBuffers;
use crate::buffer::BufferError;
use crate::dag::ActionId;
use crate::dag::BufferPolicy;
use crate::dag::Dag;
use crate::dag::DagBuilder;
use crate::dag::DagError;
use crate::dag::RecvOp;
use crate::dag::Segment;
use crate::kind::CollectiveKind;

/// Smallest power of two not below `n`.
fn round_up(n: usize) -> usize {
    n.max(1).next_power_of_two()
}

/// Broadcast down a binary tree rooted at `root`. The root fans out to
/// offsets `P/2, P/4, ..., 1` and every other participant receives once
/// from the start of the window it falls in, forwarding into the lower
/// half of that window when it sits at an even offset.
#[derive(Debug)]
pub struct BinaryTreeBcast;

impl BinaryTreeBcast {
    fn init_root(&self, b: &mut DagBuilder, layout: &Layout, round_nproc: usize) {
        let nproc = layout.size;
        let mut gap = round_nproc / 2;
        while gap > 0 {
            if gap < nproc {
                let partner = layout.abs(gap);
                b.send(partner, 0, whole(layout), BufferPolicy::InPlace, &[]);
            }
            gap /= 2;
        }
    }

    fn init_child(&self, b: &mut DagBuilder, layout: &Layout, offset_me: usize, round_nproc: usize) {
        let mut window_start = 0;
        let mut window_split = round_nproc / 2;
        let mut window_size = window_split;
        while window_size > 0 && offset_me != window_split {
            if offset_me > window_split {
                window_start = window_split;
            }
            window_size /= 2;
            window_split = window_start + window_size;
        }
        let parent = layout.abs(window_start);
        let recv = b.recv(
            parent,
            0,
            whole(layout),
            layout.recv_policy(),
            RecvOp::Copy,
            &[],
        );
        tracing::trace!(
            rank = layout.me,
            window_start,
            window_split,
            window_end = window_split + window_size,
            "bcast window"
        );
        let window_stop = layout.size.min(window_split + window_size);
        // Odd offsets are leaves.
        if offset_me % 2 == 0 {
            self.init_internal(b, layout, offset_me, window_size, window_stop, recv);
        }
    }

    fn init_internal(
        &self,
        b: &mut DagBuilder,
        layout: &Layout,
        offset_me: usize,
        window_size: usize,
        window_stop: usize,
        recv: ActionId,
    ) {
        // Packed data is forwarded as received, without unpacking again.
        let policy = if layout.contiguous {
            BufferPolicy::InPlace
        } else {
            BufferPolicy::PrevRecv
        };
        let mut stride = window_size;
        while stride > 0 {
            let partner = offset_me + stride;
            if partner < window_stop {
                b.send(layout.abs(partner), 0, whole(layout), policy, &[recv]);
            }
            stride /= 2;
        }
    }
}

fn whole(layout: &Layout) -> Vec<Segment> {
    vec![Segment::new(0, layout.count)]
}

impl Algorithm for BinaryTreeBcast {
    fn name(&self) -> &'static str {
        "binary_tree"
    }

    fn kind(&self) -> CollectiveKind {
        CollectiveKind::Bcast
    }

    fn build_dag(&self, layout: &Layout) -> Result<Dag, DagError> {
        let mut b = DagBuilder::new(layout.size);
        let round_nproc = round_up(layout.size);
        if layout.is_root() {
            self.init_root(&mut b, layout, round_nproc);
        } else {
            self.init_child(&mut b, layout, layout.rel(), round_nproc);
        }
        b.build()
    }
}

/// Gather to the root along a binomial tree. Blocks are kept in order of
/// rank relative to the root; a participant at relative rank `r` collects
/// `[r, r + 2^k)` before passing it up. Serves both gather and gatherv.
#[derive(Debug)]
pub struct BinomialGather(pub CollectiveKind);

impl BinomialGather {
    fn rotated_offsets(layout: &Layout) -> Vec<usize> {
        offsets((0..layout.size).map(|rel| layout.count_of(layout.abs(rel))))
    }
}

impl Algorithm for BinomialGather {
    fn name(&self) -> &'static str {
        "binary_tree"
    }

    fn kind(&self) -> CollectiveKind {
        self.0
    }

    fn build_dag(&self, layout: &Layout) -> Result<Dag, DagError> {
        let n = layout.size;
        let rel = layout.rel();
        let off = Self::rotated_offsets(layout);
        let mut b = DagBuilder::new(n);
        let mut mask = 1;
        let mut round = 0;
        while mask < n {
            if rel & mask != 0 {
                let window = Segment::span(off[rel], off[(rel + mask).min(n)]);
                b.round_send(layout.abs(rel - mask), round, vec![window], BufferPolicy::InPlace);
                break;
            }
            if rel + mask < n {
                let window = Segment::span(off[rel + mask], off[(rel + 2 * mask).min(n)]);
                b.round_recv(
                    layout.abs(rel + mask),
                    round,
                    vec![window],
                    layout.recv_policy(),
                    RecvOp::Copy,
                );
            }
            b.next_round();
            mask <<= 1;
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
        let off = Self::rotated_offsets(layout);
        let rel = layout.rel();
        layout.stage(src, dst, off[layout.size], off[rel], false)
    }

    fn finalize(&self, layout: &Layout, buffers: ActorBuffers) -> Option<Vec<u8>> {
        if !layout.is_root() {
            return buffers.dst;
        }
        let ActorBuffers { work, dst } = buffers;
        let work = work.into_vec()?;
        let rotated = Self::rotated_offsets(layout);
        let mut out = Vec::with_capacity(work.len());
        for rank in 0..layout.size {
            let rel = (rank + layout.size - layout.root) % layout.size;
            let range = layout.bytes(rotated[rel])..layout.bytes(rotated[rel + 1]);
            out.extend_from_slice(work.get(range)?);
        }
        Some(fill(dst, out))
    }
}

/// Scatter from the root along a binomial tree, the reverse of
/// [`BinomialGather`]. Serves both scatter and scatterv.
#[derive(Debug)]
pub struct BinomialScatter(pub CollectiveKind);

impl Algorithm for BinomialScatter {
    fn name(&self) -> &'static str {
        "binary_tree"
    }

    fn kind(&self) -> CollectiveKind {
        self.0
    }

    fn build_dag(&self, layout: &Layout) -> Result<Dag, DagError> {
        let n = layout.size;
        let rel = layout.rel();
        let off = BinomialGather::rotated_offsets(layout);
        let mut b = DagBuilder::new(n);
        let mut mask = round_up(n) / 2;
        while mask > 0 {
            let round = mask.trailing_zeros();
            if rel % (2 * mask) == 0 {
                if rel + mask < n {
                    let window = Segment::span(off[rel + mask], off[(rel + 2 * mask).min(n)]);
                    b.round_send(layout.abs(rel + mask), round, vec![window], BufferPolicy::InPlace);
                }
            } else if rel % (2 * mask) == mask {
                let window = Segment::span(off[rel], off[(rel + mask).min(n)]);
                b.round_recv(
                    layout.abs(rel - mask),
                    round,
                    vec![window],
                    layout.recv_policy(),
                    RecvOp::Copy,
                );
            }
            b.next_round();
            mask /= 2;
        }
        b.build()
    }

    fn init_buffers(
        &self,
        layout: &Layout,
        src: Option<&Bytes>,
        dst: Option<Vec<u8>>,
    ) -> Result<ActorBuffers, BufferError> {
        let off = BinomialGather::rotated_offsets(layout);
        let total = off[layout.size];
        let input = layout.contribution(src.map(|b| &b[..]), dst.as_deref());
        let Some(input) = input else {
            return ActorBuffers::stage(None, dst, layout.bytes(total), 0, false);
        };
        // The root's blocks are in rank order; the tree wants them relative
        // to the root.
        let absolute = offsets((0..layout.size).map(|rank| layout.count_of(rank)));
        let mut rotated = Vec::with_capacity(input.len());
        for rel in 0..layout.size {
            let rank = layout.abs(rel);
            let range = layout.bytes(absolute[rank])..layout.bytes(absolute[rank + 1]);
            rotated.extend_from_slice(input.get(range).unwrap_or(&[]));
        }
        ActorBuffers::stage(Some(&rotated), dst, layout.bytes(total), 0, false)
    }

    fn finalize(&self, layout: &Layout, buffers: ActorBuffers) -> Option<Vec<u8>> {
        let off = BinomialGather::rotated_offsets(layout);
        let rel = layout.rel();
        buffers.deliver(layout.bytes(off[rel])..layout.bytes(off[rel + 1]))
    }
}
