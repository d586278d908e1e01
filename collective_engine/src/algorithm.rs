/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The algorithm family. An [`Algorithm`] turns one participant's view of
//! an operation, its [`Layout`], into an action graph and says how the
//! participant's buffers are staged before and delivered after. Execution
//! is shared: every algorithm runs on the same [`crate::actor`].
//!
//! Strategies are looked up per operation kind in an [`AlgorithmTable`],
//! which an engine owns. Kinds may have several strategies; one is selected
//! at a time.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::buffer::ActorBuffers;
use crate::buffer::BufferError;
use crate::config::EngineConfig;
use crate::dag::BufferPolicy;
use crate::dag::Dag;
use crate::dag::DagError;
use crate::error::CollectiveError;
use crate::kind::CollectiveKind;
use crate::kind::Tag;

pub mod bruck;
pub mod direct;
pub mod halving;
pub mod scan;
pub mod tree;

/// One participant's view of an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub kind: CollectiveKind,
    pub tag: Tag,
    /// Communicator size.
    pub size: usize,
    /// This participant's communicator rank.
    pub me: usize,
    pub root: usize,
    /// Elements per rank for fixed-count kinds.
    pub count: usize,
    pub type_size: usize,
    /// Per-rank element counts of variable-count kinds; the send counts of
    /// all-to-all-v.
    pub counts: Vec<usize>,
    /// Receive counts of all-to-all-v.
    pub recv_counts: Vec<usize>,
    pub contiguous: bool,
}

impl Layout {
    pub fn is_root(&self) -> bool {
        self.me == self.root
    }

    /// This participant's rank relative to the root.
    pub fn rel(&self) -> usize {
        (self.me + self.size - self.root % self.size) % self.size
    }

    /// The communicator rank at position `rel` relative to the root.
    pub fn abs(&self, rel: usize) -> usize {
        (rel + self.root) % self.size
    }

    /// Elements contributed by or destined to `rank`.
    pub fn count_of(&self, rank: usize) -> usize {
        if self.kind.is_variable() {
            self.counts.get(rank).copied().unwrap_or(0)
        } else {
            self.count
        }
    }

    pub fn bytes(&self, elems: usize) -> usize {
        elems * self.type_size
    }

    /// Receives go through scratch when the data is not contiguous.
    pub fn recv_policy(&self) -> BufferPolicy {
        if self.contiguous {
            BufferPolicy::InPlace
        } else {
            BufferPolicy::UnpackTemp
        }
    }

    /// Elements this participant contributes.
    pub fn input_elems(&self) -> usize {
        use CollectiveKind::*;
        let n = self.size;
        let c = self.count;
        match self.kind {
            Bcast => {
                if self.is_root() {
                    c
                } else {
                    0
                }
            }
            Allreduce | Reduce | Scan | Allgather | Gather => c,
            ReduceScatter | Alltoall => n * c,
            Allgatherv | Gatherv => self.count_of(self.me),
            Alltoallv => self.counts.iter().sum(),
            Scatter => {
                if self.is_root() {
                    n * c
                } else {
                    0
                }
            }
            Scatterv => {
                if self.is_root() {
                    self.counts.iter().sum()
                } else {
                    0
                }
            }
            Barrier => 0,
        }
    }

    /// Elements of result this participant ends up with.
    pub fn output_elems(&self) -> usize {
        use CollectiveKind::*;
        let n = self.size;
        let c = self.count;
        match self.kind {
            Bcast | Allreduce | Scan | ReduceScatter | Scatter => c,
            Reduce => {
                if self.is_root() {
                    c
                } else {
                    0
                }
            }
            Allgather | Alltoall => n * c,
            Allgatherv => self.counts.iter().sum(),
            Alltoallv => self.recv_counts.iter().sum(),
            Gather => {
                if self.is_root() {
                    n * c
                } else {
                    0
                }
            }
            Gatherv => {
                if self.is_root() {
                    self.counts.iter().sum()
                } else {
                    0
                }
            }
            Scatterv => self.count_of(self.me),
            Barrier => 0,
        }
    }

    /// Where an in-place contribution sits in the destination, in
    /// elements.
    pub fn input_offset(&self) -> usize {
        use CollectiveKind::*;
        match self.kind {
            Allgather => self.me * self.count,
            Allgatherv => self.counts.iter().take(self.me).sum(),
            Gather if self.is_root() => self.me * self.count,
            Gatherv if self.is_root() => self.counts.iter().take(self.me).sum(),
            _ => 0,
        }
    }

    /// The caller's contribution: `src`, or for in-place operations the
    /// matching region of `dst`. `None` when nothing is contributed.
    pub fn contribution<'a>(&self, src: Option<&'a [u8]>, dst: Option<&'a [u8]>) -> Option<&'a [u8]> {
        let len = self.bytes(self.input_elems());
        if len == 0 {
            return None;
        }
        match (src, dst) {
            (Some(src), _) => Some(&src[..len.min(src.len())]),
            (None, Some(dst)) => {
                let start = self.bytes(self.input_offset()).min(dst.len());
                Some(&dst[start..(start + len).min(dst.len())])
            }
            (None, None) => None,
        }
    }

    /// Stage a working buffer of `work_elems` with the contribution at
    /// element `at`.
    pub fn stage(
        &self,
        src: Option<&Bytes>,
        dst: Option<Vec<u8>>,
        work_elems: usize,
        at: usize,
        reuse_dst: bool,
    ) -> Result<ActorBuffers, BufferError> {
        let input = self
            .contribution(src.map(|b| &b[..]), dst.as_deref())
            .map(<[u8]>::to_vec);
        ActorBuffers::stage(
            input.as_deref(),
            dst,
            self.bytes(work_elems),
            self.bytes(at),
            reuse_dst,
        )
    }
}

/// Exclusive prefix sums, with the total appended.
pub fn offsets(counts: impl IntoIterator<Item = usize>) -> Vec<usize> {
    let mut out = vec![0];
    let mut total = 0;
    for count in counts {
        total += count;
        out.push(total);
    }
    out
}

/// Copy `data` into the caller's destination when it can hold it, else
/// return `data` itself.
pub fn fill(dst: Option<Vec<u8>>, data: Vec<u8>) -> Vec<u8> {
    match dst {
        Some(mut out) if out.len() >= data.len() => {
            out[..data.len()].copy_from_slice(&data);
            out
        }
        _ => data,
    }
}

/// A strategy for one collective kind.
pub trait Algorithm: Send + Sync + fmt::Debug {
    /// Name used to select the strategy in configuration.
    fn name(&self) -> &'static str;

    fn kind(&self) -> CollectiveKind;

    /// The action graph of the participant described by `layout`.
    fn build_dag(&self, layout: &Layout) -> Result<Dag, DagError>;

    /// Stage the working buffer. By default the contribution lands at the
    /// start of a buffer sized for the output, which may be the caller's
    /// destination.
    fn init_buffers(
        &self,
        layout: &Layout,
        src: Option<&Bytes>,
        dst: Option<Vec<u8>>,
    ) -> Result<ActorBuffers, BufferError> {
        let elems = layout.input_elems().max(layout.output_elems());
        layout.stage(src, dst, elems, 0, true)
    }

    /// The participant's result. Participants without one get their
    /// destination back untouched.
    fn finalize(&self, layout: &Layout, buffers: ActorBuffers) -> Option<Vec<u8>> {
        let out = layout.bytes(layout.output_elems());
        if out == 0 {
            return buffers.dst;
        }
        buffers.deliver(0..out)
    }
}

/// The strategies an engine can run, and which one is selected per kind.
#[derive(Clone, Default)]
pub struct AlgorithmTable {
    available: BTreeMap<CollectiveKind, BTreeMap<&'static str, Arc<dyn Algorithm>>>,
    selected: BTreeMap<CollectiveKind, &'static str>,
}

impl AlgorithmTable {
    /// A table with no strategies.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Every built-in strategy. The first one listed for a kind is
    /// selected.
    pub fn with_defaults() -> Self {
        use CollectiveKind::*;
        let mut table = Self::empty();
        let builtin: Vec<Arc<dyn Algorithm>> = vec![
            Arc::new(tree::BinaryTreeBcast),
            Arc::new(halving::HalvingAllreduce),
            Arc::new(halving::RecursiveDoublingAllreduce),
            Arc::new(halving::HalvingReduce),
            Arc::new(halving::HalvingReduceScatter),
            Arc::new(scan::RecursiveDoublingScan),
            Arc::new(bruck::BruckAllgather(Allgather)),
            Arc::new(bruck::BruckAllgather(Allgatherv)),
            Arc::new(bruck::BruckAlltoall),
            Arc::new(direct::DirectAlltoall(Alltoall)),
            Arc::new(direct::DirectAlltoall(Alltoallv)),
            Arc::new(tree::BinomialGather(Gather)),
            Arc::new(tree::BinomialGather(Gatherv)),
            Arc::new(tree::BinomialScatter(Scatter)),
            Arc::new(tree::BinomialScatter(Scatterv)),
            Arc::new(bruck::DisseminationBarrier),
        ];
        for algorithm in builtin {
            table.add(algorithm);
        }
        table
    }

    /// The built-in strategies with the selections in `config` applied.
    pub fn from_config(config: &EngineConfig) -> Result<Self, CollectiveError> {
        let mut table = Self::with_defaults();
        for (kind, name) in &config.algorithms {
            table.select(*kind, name)?;
        }
        Ok(table)
    }

    /// Make `algorithm` available, selecting it if its kind had nothing
    /// selected.
    pub fn add(&mut self, algorithm: Arc<dyn Algorithm>) {
        let kind = algorithm.kind();
        let name = algorithm.name();
        self.available.entry(kind).or_default().insert(name, algorithm);
        self.selected.entry(kind).or_insert(name);
    }

    /// Make `algorithm` available and select it.
    pub fn register(&mut self, algorithm: Arc<dyn Algorithm>) {
        let kind = algorithm.kind();
        let name = algorithm.name();
        self.add(algorithm);
        self.selected.insert(kind, name);
    }

    pub fn select(&mut self, kind: CollectiveKind, name: &str) -> Result<(), CollectiveError> {
        let found = self
            .available
            .get(&kind)
            .and_then(|by_name| by_name.get_key_value(name))
            .map(|(name, _)| *name)
            .ok_or_else(|| CollectiveError::UnknownAlgorithm {
                kind,
                name: name.to_string(),
            })?;
        self.selected.insert(kind, found);
        Ok(())
    }

    /// The selected strategy for `kind`.
    pub fn get(&self, kind: CollectiveKind) -> Result<Arc<dyn Algorithm>, CollectiveError> {
        self.selected
            .get(&kind)
            .and_then(|name| self.available.get(&kind)?.get(name))
            .cloned()
            .ok_or_else(|| CollectiveError::unsupported(kind, "no algorithm registered"))
    }

    pub fn selected(&self, kind: CollectiveKind) -> Option<&'static str> {
        self.selected.get(&kind).copied()
    }

    /// Names of the strategies available for `kind`.
    pub fn names(&self, kind: CollectiveKind) -> Vec<&'static str> {
        self.available
            .get(&kind)
            .map(|by_name| by_name.keys().copied().collect())
            .unwrap_or_default()
    }
}

impl fmt::Debug for AlgorithmTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.selected.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use strum::IntoEnumIterator;

    use super::*;

    pub(crate) fn layout(kind: CollectiveKind, size: usize, me: usize, root: usize, count: usize) -> Layout {
        Layout {
            kind,
            tag: 0,
            size,
            me,
            root,
            count,
            type_size: 8,
            counts: Vec::new(),
            recv_counts: Vec::new(),
            contiguous: true,
        }
    }

    #[test]
    fn test_defaults_cover_every_kind() {
        let table = AlgorithmTable::with_defaults();
        for kind in CollectiveKind::iter() {
            let algorithm = table.get(kind).unwrap();
            assert_eq!(algorithm.kind(), kind);
        }
        assert_eq!(table.selected(CollectiveKind::Allreduce), Some("halving"));
        assert_eq!(table.selected(CollectiveKind::Alltoall), Some("bruck"));
        assert_eq!(
            table.names(CollectiveKind::Allreduce),
            vec!["halving", "recursive_doubling"]
        );
    }

    #[test]
    fn test_select_from_config() {
        let mut config = EngineConfig::default();
        config
            .algorithms
            .insert(CollectiveKind::Alltoall, "direct".to_string());
        let table = AlgorithmTable::from_config(&config).unwrap();
        assert_eq!(table.get(CollectiveKind::Alltoall).unwrap().name(), "direct");

        config
            .algorithms
            .insert(CollectiveKind::Bcast, "pipeline".to_string());
        let err = AlgorithmTable::from_config(&config).unwrap_err();
        assert!(matches!(err, CollectiveError::UnknownAlgorithm { .. }));
    }

    #[test]
    fn test_empty_table_is_unsupported() {
        let table = AlgorithmTable::empty();
        let err = table.get(CollectiveKind::Scan).unwrap_err();
        assert_eq!(err.class(), crate::error::ErrorClass::Unsupported);
    }

    #[test]
    fn test_layout_sizes() {
        let mut l = layout(CollectiveKind::Allgatherv, 3, 2, 0, 0);
        l.counts = vec![1, 4, 2];
        assert_eq!(l.input_elems(), 2);
        assert_eq!(l.output_elems(), 7);
        assert_eq!(l.input_offset(), 5);

        let l = layout(CollectiveKind::Gather, 4, 1, 3, 2);
        assert_eq!(l.rel(), 2);
        assert_eq!(l.abs(2), 1);
        assert_eq!(l.output_elems(), 0);
        assert_eq!(l.input_offset(), 0);

        let l = layout(CollectiveKind::Bcast, 4, 0, 0, 3);
        let dst = vec![9u8; 24];
        assert_eq!(l.contribution(None, Some(&dst)).unwrap().len(), 24);
        let l = layout(CollectiveKind::Bcast, 4, 1, 0, 3);
        assert!(l.contribution(None, Some(&dst)).is_none());
    }

    #[test]
    fn test_offsets_and_fill() {
        assert_eq!(offsets([2, 0, 3]), vec![0, 2, 2, 5]);
        assert_eq!(fill(Some(vec![0; 4]), vec![1, 2]), vec![1, 2, 0, 0]);
        assert_eq!(fill(Some(vec![0; 1]), vec![1, 2]), vec![1, 2]);
        assert_eq!(fill(None, vec![3]), vec![3]);
    }
}
