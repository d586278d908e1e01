/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Operation descriptors: everything a participant passes when it starts a
//! collective.

use std::sync::Arc;

use bytes::Bytes;

use crate::algorithm::Layout;
use crate::communicator::Communicator;
use crate::error::CollectiveError;
use crate::kind::CollectiveKey;
use crate::kind::CollectiveKind;
use crate::kind::Tag;
use crate::reduce::Reduction;
use crate::transport::CqId;

/// One participant's request to take part in a collective.
///
/// Build one with the constructor for the kind, then attach buffers and
/// options. Without a source, the destination is used in place; without
/// either buffer the operation runs on phantom payloads that carry sizes
/// but no bytes.
#[derive(Debug, Clone)]
pub struct Operation {
    pub kind: CollectiveKind,
    pub comm: Arc<Communicator>,
    pub tag: Tag,
    /// Elements per rank for fixed-count kinds.
    pub count: usize,
    pub type_size: usize,
    pub src: Option<Bytes>,
    pub dst: Option<Vec<u8>>,
    pub reduction: Option<Reduction>,
    pub root: usize,
    /// Per-rank counts for variable-count kinds. For all-to-all-v, the
    /// counts this rank sends to each peer.
    pub counts: Vec<usize>,
    /// For all-to-all-v, the counts this rank receives from each peer.
    pub recv_counts: Vec<usize>,
    pub cq: CqId,
    /// Whether elements are laid out contiguously. Non-contiguous data goes
    /// through scratch buffers, and is not supported by the variable-count
    /// kinds.
    pub contiguous: bool,
    pub persistent: bool,
    /// The communicator rank this operation is for. Defaults to the lowest
    /// rank resident on the calling physical rank.
    pub rank: Option<usize>,
}

impl Operation {
    pub fn new(
        kind: CollectiveKind,
        comm: Arc<Communicator>,
        tag: Tag,
        count: usize,
        type_size: usize,
    ) -> Self {
        Self {
            kind,
            comm,
            tag,
            count,
            type_size,
            src: None,
            dst: None,
            reduction: None,
            root: 0,
            counts: Vec::new(),
            recv_counts: Vec::new(),
            cq: 0,
            contiguous: true,
            persistent: false,
            rank: None,
        }
    }

    pub fn bcast(comm: Arc<Communicator>, tag: Tag, root: usize, count: usize, type_size: usize) -> Self {
        Self::new(CollectiveKind::Bcast, comm, tag, count, type_size).with_root(root)
    }

    pub fn allreduce(
        comm: Arc<Communicator>,
        tag: Tag,
        count: usize,
        type_size: usize,
        reduction: Reduction,
    ) -> Self {
        Self::new(CollectiveKind::Allreduce, comm, tag, count, type_size).with_reduction(reduction)
    }

    pub fn reduce(
        comm: Arc<Communicator>,
        tag: Tag,
        root: usize,
        count: usize,
        type_size: usize,
        reduction: Reduction,
    ) -> Self {
        Self::new(CollectiveKind::Reduce, comm, tag, count, type_size)
            .with_root(root)
            .with_reduction(reduction)
    }

    /// Each rank contributes `comm.size()` blocks of `count` elements and
    /// receives the reduction of its own block.
    pub fn reduce_scatter(
        comm: Arc<Communicator>,
        tag: Tag,
        count: usize,
        type_size: usize,
        reduction: Reduction,
    ) -> Self {
        Self::new(CollectiveKind::ReduceScatter, comm, tag, count, type_size)
            .with_reduction(reduction)
    }

    pub fn scan(
        comm: Arc<Communicator>,
        tag: Tag,
        count: usize,
        type_size: usize,
        reduction: Reduction,
    ) -> Self {
        Self::new(CollectiveKind::Scan, comm, tag, count, type_size).with_reduction(reduction)
    }

    pub fn allgather(comm: Arc<Communicator>, tag: Tag, count: usize, type_size: usize) -> Self {
        Self::new(CollectiveKind::Allgather, comm, tag, count, type_size)
    }

    pub fn allgatherv(comm: Arc<Communicator>, tag: Tag, counts: Vec<usize>, type_size: usize) -> Self {
        Self::new(CollectiveKind::Allgatherv, comm, tag, 0, type_size).with_counts(counts)
    }

    pub fn alltoall(comm: Arc<Communicator>, tag: Tag, count: usize, type_size: usize) -> Self {
        Self::new(CollectiveKind::Alltoall, comm, tag, count, type_size)
    }

    pub fn alltoallv(
        comm: Arc<Communicator>,
        tag: Tag,
        send_counts: Vec<usize>,
        recv_counts: Vec<usize>,
        type_size: usize,
    ) -> Self {
        let mut op = Self::new(CollectiveKind::Alltoallv, comm, tag, 0, type_size).with_counts(send_counts);
        op.recv_counts = recv_counts;
        op
    }

    pub fn gather(comm: Arc<Communicator>, tag: Tag, root: usize, count: usize, type_size: usize) -> Self {
        Self::new(CollectiveKind::Gather, comm, tag, count, type_size).with_root(root)
    }

    /// `counts` must be given on every rank, not only at the root.
    pub fn gatherv(
        comm: Arc<Communicator>,
        tag: Tag,
        root: usize,
        counts: Vec<usize>,
        type_size: usize,
    ) -> Self {
        Self::new(CollectiveKind::Gatherv, comm, tag, 0, type_size)
            .with_root(root)
            .with_counts(counts)
    }

    pub fn scatter(comm: Arc<Communicator>, tag: Tag, root: usize, count: usize, type_size: usize) -> Self {
        Self::new(CollectiveKind::Scatter, comm, tag, count, type_size).with_root(root)
    }

    /// `counts` must be given on every rank, not only at the root.
    pub fn scatterv(
        comm: Arc<Communicator>,
        tag: Tag,
        root: usize,
        counts: Vec<usize>,
        type_size: usize,
    ) -> Self {
        Self::new(CollectiveKind::Scatterv, comm, tag, 0, type_size)
            .with_root(root)
            .with_counts(counts)
    }

    pub fn barrier(comm: Arc<Communicator>, tag: Tag) -> Self {
        Self::new(CollectiveKind::Barrier, comm, tag, 0, 1)
    }

    pub fn with_src(mut self, src: impl Into<Bytes>) -> Self {
        self.src = Some(src.into());
        self
    }

    pub fn with_dst(mut self, dst: Vec<u8>) -> Self {
        self.dst = Some(dst);
        self
    }

    pub fn with_root(mut self, root: usize) -> Self {
        self.root = root;
        self
    }

    pub fn with_reduction(mut self, reduction: Reduction) -> Self {
        self.reduction = Some(reduction);
        self
    }

    pub fn with_counts(mut self, counts: Vec<usize>) -> Self {
        self.counts = counts;
        self
    }

    pub fn on_queue(mut self, cq: CqId) -> Self {
        self.cq = cq;
        self
    }

    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }

    pub fn as_rank(mut self, rank: usize) -> Self {
        self.rank = Some(rank);
        self
    }

    pub fn non_contiguous(mut self) -> Self {
        self.contiguous = false;
        self
    }

    pub fn key(&self) -> CollectiveKey {
        CollectiveKey::new(self.kind, self.comm.id(), self.tag)
    }

    /// The view of communicator rank `me`.
    pub fn layout(&self, me: usize) -> Layout {
        Layout {
            kind: self.kind,
            tag: self.tag,
            size: self.comm.size(),
            me,
            root: self.root,
            count: self.count,
            type_size: self.type_size,
            counts: self.counts.clone(),
            recv_counts: self.recv_counts.clone(),
            contiguous: self.contiguous,
        }
    }

    /// Check everything that can be checked before any message moves, for
    /// the participant at communicator rank `me`.
    pub fn validate(&self, me: usize) -> Result<(), CollectiveError> {
        let kind = self.kind;
        let tag = self.tag;
        let size = self.comm.size();
        if me >= size {
            return Err(CollectiveError::RankOutOfRange {
                kind,
                tag,
                rank: me,
                size,
            });
        }
        if kind.is_rooted() && self.root >= size {
            return Err(CollectiveError::RankOutOfRange {
                kind,
                tag,
                rank: self.root,
                size,
            });
        }
        if kind != CollectiveKind::Barrier && self.type_size == 0 {
            return Err(CollectiveError::unsupported(kind, "zero-sized elements"));
        }
        if kind.needs_reduction() {
            let Some(reduction) = &self.reduction else {
                return Err(CollectiveError::MissingReduction { kind, tag });
            };
            if reduction.type_size() != self.type_size {
                return Err(CollectiveError::CountMismatch {
                    kind,
                    tag,
                    what: "bytes per element",
                    expected: self.type_size,
                    actual: reduction.type_size(),
                });
            }
        }
        if kind.is_variable() {
            if !self.contiguous {
                return Err(CollectiveError::unsupported(
                    kind,
                    "variable-count collectives require contiguous data",
                ));
            }
            if self.counts.len() != size {
                return Err(CollectiveError::CountMismatch {
                    kind,
                    tag,
                    what: "counts",
                    expected: size,
                    actual: self.counts.len(),
                });
            }
            if kind == CollectiveKind::Alltoallv && self.recv_counts.len() != size {
                return Err(CollectiveError::CountMismatch {
                    kind,
                    tag,
                    what: "receive counts",
                    expected: size,
                    actual: self.recv_counts.len(),
                });
            }
        }

        let layout = self.layout(me);
        let input = layout.bytes(layout.input_elems());
        let output = layout.bytes(layout.output_elems());
        let too_small = |needed: usize, actual: usize| CollectiveError::BufferTooSmall {
            kind,
            tag,
            needed,
            actual,
        };
        if let Some(src) = &self.src {
            if src.len() < input {
                return Err(too_small(input, src.len()));
            }
        }
        if let Some(dst) = &self.dst {
            let mut needed = output;
            if self.src.is_none() {
                needed = needed.max(layout.bytes(layout.input_offset()) + input);
            }
            if dst.len() < needed {
                return Err(too_small(needed, dst.len()));
            }
        }
        Ok(())
    }
}
