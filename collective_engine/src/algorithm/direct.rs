/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Direct exchange: one round in which every rank sends each peer its
//! block and receives one back.

use bytes::Bytes;

use crate::algorithm::Algorithm;
use crate::algorithm::Layout;
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

/// All-to-all and all-to-all-v. The working buffer holds the outgoing
/// blocks followed by the incoming ones; the rank's own block is copied
/// across when buffers are staged.
#[derive(Debug)]
pub struct DirectAlltoall(pub CollectiveKind);

struct Areas {
    send: Vec<usize>,
    recv: Vec<usize>,
}

impl Areas {
    fn of(layout: &Layout) -> Self {
        let n = layout.size;
        if layout.kind == CollectiveKind::Alltoallv {
            Self {
                send: offsets(layout.counts.iter().copied()),
                recv: offsets(layout.recv_counts.iter().copied()),
            }
        } else {
            Self {
                send: offsets(std::iter::repeat(layout.count).take(n)),
                recv: offsets(std::iter::repeat(layout.count).take(n)),
            }
        }
    }

    fn send_total(&self) -> usize {
        self.send.last().copied().unwrap_or(0)
    }

    fn recv_total(&self) -> usize {
        self.recv.last().copied().unwrap_or(0)
    }

    fn outgoing(&self, rank: usize) -> Segment {
        Segment::span(self.send[rank], self.send[rank + 1])
    }

    fn incoming(&self, rank: usize) -> Segment {
        let base = self.send_total();
        Segment::span(base + self.recv[rank], base + self.recv[rank + 1])
    }
}

impl Algorithm for DirectAlltoall {
    fn name(&self) -> &'static str {
        "direct"
    }

    fn kind(&self) -> CollectiveKind {
        self.0
    }

    fn build_dag(&self, layout: &Layout) -> Result<Dag, DagError> {
        let n = layout.size;
        let me = layout.me;
        let areas = Areas::of(layout);
        let mut b = DagBuilder::new(n);
        let peers: Vec<usize> = (1..n).map(|i| (me + i) % n).collect();
        for &peer in &peers {
            b.round_send(peer, 0, vec![areas.outgoing(peer)], BufferPolicy::InPlace);
        }
        for &peer in &peers {
            b.round_recv(
                peer,
                0,
                vec![areas.incoming(peer)],
                layout.recv_policy(),
                RecvOp::Copy,
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
        let areas = Areas::of(layout);
        let total = areas.send_total() + areas.recv_total();
        let mut buffers = layout.stage(src, dst, total, 0, false)?;
        let own = areas.outgoing(layout.me);
        let into = areas.incoming(layout.me);
        let nelems = own.nelems.min(into.nelems);
        let block = buffers.work.read(&[Segment::new(own.offset, nelems)], layout.type_size)?;
        buffers
            .work
            .write(&[Segment::new(into.offset, nelems)], layout.type_size, &block)?;
        Ok(buffers)
    }

    fn finalize(&self, layout: &Layout, buffers: ActorBuffers) -> Option<Vec<u8>> {
        let areas = Areas::of(layout);
        let start = layout.bytes(areas.send_total());
        buffers.deliver(start..start + layout.bytes(areas.recv_total()))
    }
}
