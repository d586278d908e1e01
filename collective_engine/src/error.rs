/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Errors raised by the collective engine.

use crate::communicator::CommunicatorError;
use crate::dag::DagError;
use crate::kind::CollectiveKey;
use crate::kind::CollectiveKind;
use crate::kind::Tag;
use crate::transport::TransportError;

/// Broad classes of failure. Every class is fatal to the operation that
/// raised it; none is retried inside the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorClass {
    /// The caller asked for something the engine cannot do with the given
    /// arguments: bad rank, live tag reuse, missing reduction.
    Configuration,
    /// The operation is well formed but deliberately not implemented.
    Unsupported,
    /// Peers disagree about group membership, tags, or the algorithm.
    Protocol,
    /// The transport collaborator failed.
    Transport,
}

/// Errors returned by engine operations.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum CollectiveError {
    /// A rank (root or resident rank) lies outside the communicator.
    #[error("{kind}[{tag}]: rank {rank} out of range for communicator of size {size}")]
    RankOutOfRange {
        kind: CollectiveKind,
        tag: Tag,
        rank: usize,
        size: usize,
    },

    /// The calling physical rank holds no rank in the communicator.
    #[error("{key}: physical rank {physical} is not a member of the communicator")]
    NotAMember { key: CollectiveKey, physical: usize },

    /// The communicator maps a rank onto a physical rank outside the world.
    #[error("{key}: communicator names physical rank {physical}, world has {world}")]
    OutsideWorld {
        key: CollectiveKey,
        physical: usize,
        world: usize,
    },

    /// A non-persistent occurrence with this key is still running.
    #[error("{key}: tag is still in use by an incomplete collective")]
    TagInUse { key: CollectiveKey },

    /// A reduction kind was started without a reduction function.
    #[error("{kind}[{tag}]: reduction function required")]
    MissingReduction { kind: CollectiveKind, tag: Tag },

    /// Per-rank counts or buffer lengths disagree with the communicator.
    #[error("{kind}[{tag}]: expected {expected} {what}, got {actual}")]
    CountMismatch {
        kind: CollectiveKind,
        tag: Tag,
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    /// A caller buffer cannot hold the bytes the operation touches.
    #[error("{kind}[{tag}]: buffer of {actual} bytes, need {needed}")]
    BufferTooSmall {
        kind: CollectiveKind,
        tag: Tag,
        needed: usize,
        actual: usize,
    },

    /// The operation is not implemented for these arguments.
    #[error("{kind}: unsupported: {reason}")]
    Unsupported {
        kind: CollectiveKind,
        reason: String,
    },

    /// No strategy with this name is registered for the kind.
    #[error("{kind}: unknown algorithm {name:?}")]
    UnknownAlgorithm { kind: CollectiveKind, name: String },

    /// An incoming message cannot be matched to any action.
    #[error("{key}: protocol error: {reason}")]
    Protocol { key: CollectiveKey, reason: String },

    /// An algorithm produced a malformed action graph.
    #[error(transparent)]
    InvalidDag(#[from] DagError),

    /// The transport failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Communicator construction or lookup failed.
    #[error(transparent)]
    Communicator(#[from] CommunicatorError),
}

impl CollectiveError {
    /// The failure class of this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::RankOutOfRange { .. }
            | Self::NotAMember { .. }
            | Self::OutsideWorld { .. }
            | Self::TagInUse { .. }
            | Self::MissingReduction { .. }
            | Self::CountMismatch { .. }
            | Self::BufferTooSmall { .. }
            | Self::UnknownAlgorithm { .. }
            | Self::Communicator(_) => ErrorClass::Configuration,
            Self::Unsupported { .. } => ErrorClass::Unsupported,
            Self::Protocol { .. } | Self::InvalidDag(_) => ErrorClass::Protocol,
            Self::Transport(_) => ErrorClass::Transport,
        }
    }

    pub(crate) fn protocol(key: CollectiveKey, reason: impl Into<String>) -> Self {
        Self::Protocol {
            key,
            reason: reason.into(),
        }
    }

    pub(crate) fn unsupported(kind: CollectiveKind, reason: impl Into<String>) -> Self {
        Self::Unsupported {
            kind,
            reason: reason.into(),
        }
    }
}
