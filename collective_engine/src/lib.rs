/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! A collective communication engine.
//!
//! Group operations (broadcast, reductions, gathers, scatters, all-to-all,
//! scan and barrier, with their variable-count variants) run as distributed
//! algorithms. Each participant executes an action graph of point-to-point
//! sends and receives; the graph comes from a pluggable [`Algorithm`] and
//! is executed by one shared actor.
//!
//! # Structure
//!
//! * A [`Communicator`] names a group with a dense local ranking on top of
//!   physical ranks. Several local ranks may share a physical rank.
//! * An [`Operation`] is one participant's request: kind, communicator,
//!   tag, buffers and counts.
//! * A [`CollectiveEngine`] owns all instances of one physical rank and
//!   talks to the network only through a [`Transport`].
//!
//! Messages that arrive before the local call that starts their collective
//! are queued, so peers need not start at the same time.
//!
//! | Entity     | Keyed by                          |
//! |------------|-----------------------------------|
//! | Instance   | `kind[tag]@comm`                  |
//! | Occurrence | instance key and epoch            |
//! | Receive    | sender's local rank and round     |

pub mod actor;
pub mod algorithm;
pub mod buffer;
pub mod communicator;
pub mod config;
pub mod dag;
pub mod engine;
pub mod error;
pub mod instance;
pub mod kind;
pub mod message;
pub mod operation;
pub mod reduce;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_utils;

pub use actor::StuckReport;
pub use algorithm::Algorithm;
pub use algorithm::AlgorithmTable;
pub use algorithm::Layout;
pub use communicator::CartesianCommunicator;
pub use communicator::CommId;
pub use communicator::Communicator;
pub use config::EngineConfig;
pub use config::SendCompletion;
pub use engine::CollectiveEngine;
pub use error::CollectiveError;
pub use error::ErrorClass;
pub use instance::Completion;
pub use kind::CollectiveKey;
pub use kind::CollectiveKind;
pub use kind::Tag;
pub use message::Message;
pub use message::Payload;
pub use operation::Operation;
pub use reduce::ReduceOp;
pub use reduce::Reduction;
pub use transport::CqId;
pub use transport::PhysicalRank;
pub use transport::Transport;
pub use transport::TransportError;
