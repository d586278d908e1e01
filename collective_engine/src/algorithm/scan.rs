/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Inclusive prefix reduction.

use crate::algorithm::Algorithm;
use crate::algorithm::Layout;
use crate::dag::BufferPolicy;
use crate::dag::Dag;
use crate::dag::DagBuilder;
use crate::dag::DagError;
use crate::dag::RecvOp;
use crate::dag::Segment;
use crate::kind::CollectiveKind;

/// In round `k` every rank passes its running prefix to the rank `2^k`
/// above it and folds in the one from `2^k` below.
#[derive(Debug)]
pub struct RecursiveDoublingScan;

impl Algorithm for RecursiveDoublingScan {
    fn name(&self) -> &'static str {
        "recursive_doubling"
    }

    fn kind(&self) -> CollectiveKind {
        CollectiveKind::Scan
    }

    fn build_dag(&self, layout: &Layout) -> Result<Dag, DagError> {
        let n = layout.size;
        let me = layout.me;
        let all = vec![Segment::new(0, layout.count)];
        let mut b = DagBuilder::new(n);
        let mut stride = 1;
        let mut round = 0;
        while stride < n {
            if me + stride < n {
                b.round_send(me + stride, round, all.clone(), BufferPolicy::InPlace);
            }
            if me >= stride {
                b.round_recv(
                    me - stride,
                    round,
                    all.clone(),
                    layout.recv_policy(),
                    RecvOp::Reduce,
                );
            }
            b.next_round();
            stride <<= 1;
            round += 1;
        }
        b.build()
    }
}
