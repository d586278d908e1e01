/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Collective operation kinds and the key that identifies one occurrence.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

use crate::communicator::CommId;

/// Caller-chosen integer distinguishing concurrent occurrences of the same
/// collective kind. Negative tags are reserved for the engine's own work.
pub type Tag = i32;

/// The collective operations the engine knows how to execute.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumIter,
    strum::EnumString,
    strum::IntoStaticStr
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CollectiveKind {
    Allreduce,
    ReduceScatter,
    Reduce,
    Scan,
    Allgather,
    Allgatherv,
    Alltoall,
    Alltoallv,
    Bcast,
    Gather,
    Gatherv,
    Scatter,
    Scatterv,
    Barrier,
}

impl CollectiveKind {
    /// Variable-count ("v") variants take per-rank element counts.
    pub fn is_variable(self) -> bool {
        matches!(
            self,
            Self::Allgatherv | Self::Alltoallv | Self::Gatherv | Self::Scatterv
        )
    }

    /// Kinds that combine contributions with a reduction function.
    pub fn needs_reduction(self) -> bool {
        matches!(
            self,
            Self::Allreduce | Self::ReduceScatter | Self::Reduce | Self::Scan
        )
    }

    /// Kinds with a distinguished root participant.
    pub fn is_rooted(self) -> bool {
        matches!(
            self,
            Self::Reduce | Self::Bcast | Self::Gather | Self::Gatherv | Self::Scatter | Self::Scatterv
        )
    }
}

/// Identifies one occurrence of a collective on this engine. Lookups of
/// instances and early messages are always keyed by this, never by the
/// communicator alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CollectiveKey {
    pub kind: CollectiveKind,
    pub comm: CommId,
    pub tag: Tag,
}

impl CollectiveKey {
    pub fn new(kind: CollectiveKind, comm: CommId, tag: Tag) -> Self {
        Self { kind, comm, tag }
    }
}

impl fmt::Display for CollectiveKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]@{}", self.kind, self.tag, self.comm)
    }
}
