/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The narrow interface through which the engine reaches the network.

use crate::message::Message;

/// Identifies a physical process (simulated node/rank) on the network.
pub type PhysicalRank = usize;

/// Identifies a completion queue: a caller-chosen sink for messages and
/// completion notifications.
pub type CqId = u32;

/// Errors returned by a transport.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum TransportError {
    /// The destination rank is not part of the network.
    #[error("unknown destination rank {0}")]
    UnknownDestination(PhysicalRank),

    /// The network has been shut down.
    #[error("transport closed")]
    Closed,

    /// Nothing is in flight that could ever arrive on this queue.
    #[error("rank {rank} has nothing in flight for completion queue {cq}")]
    Idle { rank: PhysicalRank, cq: CqId },
}

/// A point-to-point transport as seen by one physical rank.
///
/// Implementations deliver every message sent with [`Transport::send`] to the
/// destination's [`Transport::blocking_poll`] on the queue named in the
/// message header. When a work message asks for an acknowledgement, the
/// transport returns [`crate::message::WorkMessage::ack`] to the sender once
/// the message has been injected.
pub trait Transport {
    /// The physical rank this endpoint belongs to.
    fn rank(&self) -> PhysicalRank;

    /// Enqueue a message. Never blocks.
    fn send(&mut self, message: Message) -> Result<(), TransportError>;

    /// Suspend until a message for `cq` is available, and return it.
    fn blocking_poll(&mut self, cq: CqId) -> Result<Message, TransportError>;

    /// A process-unique identifier for matching outstanding operations.
    fn allocate_flow_id(&mut self) -> u64;
}
