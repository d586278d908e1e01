/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Operations sized for benchmarking.

use std::sync::Arc;

use collective_engine::CollectiveKind;
use collective_engine::Communicator;
use collective_engine::Operation;
use collective_engine::ReduceOp;
use collective_engine::Reduction;
use collective_engine::Tag;

/// Wrapping sum over unsigned elements of `type_size` bytes.
pub fn sum_of_size(type_size: usize) -> Option<Reduction> {
    match type_size {
        1 => Reduction::of::<u8>(ReduceOp::Sum),
        2 => Reduction::of::<u16>(ReduceOp::Sum),
        4 => Reduction::of::<u32>(ReduceOp::Sum),
        8 => Reduction::of::<u64>(ReduceOp::Sum),
        16 => Reduction::of::<u128>(ReduceOp::Sum),
        _ => None,
    }
}

/// What a benchmark runs on every rank.
#[derive(Debug, Clone)]
pub struct Workload {
    pub kind: CollectiveKind,
    /// Elements per rank; every rank gets the same count in the
    /// variable-count kinds.
    pub count: usize,
    pub type_size: usize,
    pub root: usize,
    /// Run without buffers, moving sizes only.
    pub phantom: bool,
    pub persistent: bool,
}

impl Workload {
    /// The operation of communicator rank `rank`, with zeroed buffers sized
    /// for it unless phantom.
    pub fn operation(&self, comm: Arc<Communicator>, tag: Tag, rank: usize) -> Operation {
        let n = comm.size();
        let mut op = Operation::new(self.kind, comm, tag, self.count, self.type_size).with_root(self.root);
        if self.kind.is_variable() {
            op = op.with_counts(vec![self.count; n]);
            op.count = 0;
            if self.kind == CollectiveKind::Alltoallv {
                op.recv_counts = vec![self.count; n];
            }
        }
        if self.kind.needs_reduction() {
            if let Some(reduction) = sum_of_size(self.type_size) {
                op = op.with_reduction(reduction);
            }
        }
        if self.persistent {
            op = op.persistent();
        }
        if self.phantom {
            return op;
        }
        let layout = op.layout(rank);
        let input = layout.bytes(layout.input_elems());
        let output = layout.bytes(layout.output_elems());
        if input > 0 {
            op = op.with_src(vec![0u8; input]);
        }
        if output > 0 {
            op = op.with_dst(vec![0u8; output]);
        }
        op
    }
}
