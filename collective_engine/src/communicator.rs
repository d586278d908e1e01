/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Communicators map a dense collective-local rank space onto physical
//! ranks. A communicator is immutable once built; new groups are derived
//! from existing ones by duplication, subsetting, splitting, or by laying a
//! Cartesian grid over them.

use std::collections::BTreeMap;
use std::fmt;

use serde::Deserialize;
use serde::Serialize;

use crate::transport::PhysicalRank;

/// Names a communicator. Peers agree on ids the same way they agree on
/// tags: by constructing the same groups in the same order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CommId(pub u64);

impl CommId {
    /// The communicator spanning every physical rank.
    pub const WORLD: CommId = CommId(0);
}

impl fmt::Display for CommId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "comm{}", self.0)
    }
}

/// Errors building or querying communicators.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CommunicatorError {
    #[error("rank {rank} out of range for communicator of size {size}")]
    RankOutOfRange { rank: usize, size: usize },

    #[error("communicator must have at least one rank")]
    Empty,

    #[error("expected {expected} entries, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    #[error("rank {rank} listed more than once")]
    DuplicateRank { rank: usize },

    #[error("coordinate {coord} off the grid in non-periodic dimension {dim}")]
    OffGrid { dim: usize, coord: i64 },
}

/// A group of participants with a dense local ranking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Communicator {
    id: CommId,
    rank_to_physical: Vec<PhysicalRank>,
    // Several local ranks may live on one physical rank.
    physical_to_rank: BTreeMap<PhysicalRank, Vec<usize>>,
}

impl Communicator {
    /// The world communicator: local rank `i` is physical rank `i`.
    pub fn world(size: usize) -> Result<Self, CommunicatorError> {
        Self::from_ranks(CommId::WORLD, (0..size).collect())
    }

    /// A communicator whose local rank `i` lives on `ranks[i]`. Physical
    /// ranks may repeat.
    pub fn from_ranks(id: CommId, ranks: Vec<PhysicalRank>) -> Result<Self, CommunicatorError> {
        if ranks.is_empty() {
            return Err(CommunicatorError::Empty);
        }
        let mut physical_to_rank: BTreeMap<PhysicalRank, Vec<usize>> = BTreeMap::new();
        for (rank, physical) in ranks.iter().enumerate() {
            physical_to_rank.entry(*physical).or_default().push(rank);
        }
        Ok(Self {
            id,
            rank_to_physical: ranks,
            physical_to_rank,
        })
    }

    pub fn id(&self) -> CommId {
        self.id
    }

    pub fn size(&self) -> usize {
        self.rank_to_physical.len()
    }

    /// The physical rank hosting local rank `rank`.
    pub fn rank_to_physical(&self, rank: usize) -> Result<PhysicalRank, CommunicatorError> {
        self.rank_to_physical
            .get(rank)
            .copied()
            .ok_or(CommunicatorError::RankOutOfRange {
                rank,
                size: self.size(),
            })
    }

    /// The lowest local rank hosted on `physical`, if any.
    pub fn physical_to_rank(&self, physical: PhysicalRank) -> Option<usize> {
        self.local_ranks_of(physical).first().copied()
    }

    /// Every local rank hosted on `physical`, ascending.
    pub fn local_ranks_of(&self, physical: PhysicalRank) -> &[usize] {
        self.physical_to_rank
            .get(&physical)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn contains(&self, physical: PhysicalRank) -> bool {
        self.physical_to_rank.contains_key(&physical)
    }

    /// Physical rank of every local rank, indexed by local rank.
    pub fn ranks(&self) -> &[PhysicalRank] {
        &self.rank_to_physical
    }

    /// The same group under a new id.
    pub fn dup(&self, id: CommId) -> Self {
        Self {
            id,
            ..self.clone()
        }
    }

    /// A subgroup holding `members` (local ranks of `self`) in the given
    /// order.
    pub fn create(&self, id: CommId, members: &[usize]) -> Result<Self, CommunicatorError> {
        let mut seen = vec![false; self.size()];
        let mut ranks = Vec::with_capacity(members.len());
        for &rank in members {
            let physical = self.rank_to_physical(rank)?;
            if std::mem::replace(&mut seen[rank], true) {
                return Err(CommunicatorError::DuplicateRank { rank });
            }
            ranks.push(physical);
        }
        Self::from_ranks(id, ranks)
    }

    /// Partition the group by color. `entries[rank]` is the `(color, key)`
    /// chosen by each local rank, or `None` for ranks that join no group.
    /// Within a color, ranks are ordered by ascending key, ties broken by
    /// their rank in `self`. Colors receive consecutive ids starting at
    /// `first_id`, in ascending color order.
    pub fn split(
        &self,
        first_id: CommId,
        entries: &[Option<(i32, i32)>],
    ) -> Result<BTreeMap<i32, Self>, CommunicatorError> {
        if entries.len() != self.size() {
            return Err(CommunicatorError::SizeMismatch {
                expected: self.size(),
                actual: entries.len(),
            });
        }
        let mut colors: BTreeMap<i32, Vec<(i32, usize)>> = BTreeMap::new();
        for (rank, entry) in entries.iter().enumerate() {
            if let Some((color, key)) = entry {
                colors.entry(*color).or_default().push((*key, rank));
            }
        }
        let mut out = BTreeMap::new();
        for (index, (color, mut members)) in colors.into_iter().enumerate() {
            members.sort();
            let ranks: Vec<usize> = members.into_iter().map(|(_, rank)| rank).collect();
            let comm = self.create(CommId(first_id.0 + index as u64), &ranks)?;
            out.insert(color, comm);
        }
        Ok(out)
    }
}

/// A communicator with a row-major Cartesian grid laid over its ranks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CartesianCommunicator {
    comm: Communicator,
    dims: Vec<usize>,
    periodic: Vec<bool>,
    strides: Vec<usize>,
}

impl CartesianCommunicator {
    /// Lay a grid of `dims` over `comm`. The grid must cover the
    /// communicator exactly.
    pub fn new(
        comm: Communicator,
        dims: Vec<usize>,
        periodic: Vec<bool>,
    ) -> Result<Self, CommunicatorError> {
        if periodic.len() != dims.len() {
            return Err(CommunicatorError::SizeMismatch {
                expected: dims.len(),
                actual: periodic.len(),
            });
        }
        let cells: usize = dims.iter().product();
        if cells != comm.size() {
            return Err(CommunicatorError::SizeMismatch {
                expected: comm.size(),
                actual: cells,
            });
        }
        let mut strides = vec![1; dims.len()];
        for dim in (0..dims.len().saturating_sub(1)).rev() {
            strides[dim] = strides[dim + 1] * dims[dim + 1];
        }
        Ok(Self {
            comm,
            dims,
            periodic,
            strides,
        })
    }

    pub fn communicator(&self) -> &Communicator {
        &self.comm
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Grid coordinates of local rank `rank`.
    pub fn coords(&self, rank: usize) -> Result<Vec<usize>, CommunicatorError> {
        if rank >= self.comm.size() {
            return Err(CommunicatorError::RankOutOfRange {
                rank,
                size: self.comm.size(),
            });
        }
        Ok(self
            .strides
            .iter()
            .zip(&self.dims)
            .map(|(stride, dim)| (rank / stride) % dim)
            .collect())
    }

    /// Local rank at `coords`. Periodic dimensions wrap; others must be in
    /// range.
    pub fn rank_of(&self, coords: &[i64]) -> Result<usize, CommunicatorError> {
        if coords.len() != self.dims.len() {
            return Err(CommunicatorError::SizeMismatch {
                expected: self.dims.len(),
                actual: coords.len(),
            });
        }
        let mut rank = 0;
        for (dim, &coord) in coords.iter().enumerate() {
            let extent = self.dims[dim] as i64;
            let wrapped = if self.periodic[dim] {
                coord.rem_euclid(extent)
            } else if (0..extent).contains(&coord) {
                coord
            } else {
                return Err(CommunicatorError::OffGrid { dim, coord });
            };
            rank += wrapped as usize * self.strides[dim];
        }
        Ok(rank)
    }

    /// The `(source, destination)` pair for a shift of `disp` along `dim`
    /// from `rank`. Either side is `None` when it falls off a non-periodic
    /// edge.
    pub fn shift(
        &self,
        rank: usize,
        dim: usize,
        disp: i64,
    ) -> Result<(Option<usize>, Option<usize>), CommunicatorError> {
        if dim >= self.dims.len() {
            return Err(CommunicatorError::RankOutOfRange {
                rank: dim,
                size: self.dims.len(),
            });
        }
        let here: Vec<i64> = self.coords(rank)?.into_iter().map(|c| c as i64).collect();
        let neighbor = |delta: i64| {
            let mut at = here.clone();
            at[dim] += delta;
            match self.rank_of(&at) {
                Ok(rank) => Ok(Some(rank)),
                Err(CommunicatorError::OffGrid { .. }) => Ok(None),
                Err(err) => Err(err),
            }
        };
        Ok((neighbor(-disp)?, neighbor(disp)?))
    }
}
