/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Messages exchanged between collective engines.

use bytes::Bytes;
use enum_as_inner::EnumAsInner;

use crate::kind::CollectiveKey;
use crate::transport::CqId;
use crate::transport::PhysicalRank;

/// Routing information common to every message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub src: PhysicalRank,
    pub dst: PhysicalRank,
    /// Queue on the destination that receives the message.
    pub cq: CqId,
    pub flow_id: u64,
}

/// Message body. Phantom payloads carry only a size, for runs that model
/// communication volume without moving bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Data(Bytes),
    Phantom(usize),
}

impl Payload {
    /// Size in bytes, real or modeled.
    pub fn len(&self) -> usize {
        match self {
            Self::Data(bytes) => bytes.len(),
            Self::Phantom(len) => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_phantom(&self) -> bool {
        matches!(self, Self::Phantom(_))
    }
}

/// Collective payload sent by one actor to another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkMessage {
    pub header: Header,
    pub key: CollectiveKey,
    /// Occurrence number of a persistent collective; zero otherwise.
    pub epoch: u64,
    /// Communicator rank of the sending actor.
    pub src_rank: usize,
    /// Communicator rank of the receiving actor.
    pub dst_rank: usize,
    /// Algorithm round of the send action; matches exactly one receive.
    pub round: u32,
    pub nelems: usize,
    pub payload: Payload,
    pub ack_requested: bool,
}

impl WorkMessage {
    /// The injection acknowledgement for this message, if one was requested.
    pub fn ack(&self) -> Option<Message> {
        if !self.ack_requested {
            return None;
        }
        Some(Message::Ack(AckMessage {
            header: Header {
                src: self.header.dst,
                dst: self.header.src,
                cq: self.header.cq,
                flow_id: self.header.flow_id,
            },
            key: self.key,
            epoch: self.epoch,
            local_rank: self.src_rank,
        }))
    }
}

/// Tells a sender that one of its sends has been injected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckMessage {
    pub header: Header,
    pub key: CollectiveKey,
    pub epoch: u64,
    /// Communicator rank of the actor whose send completed.
    pub local_rank: usize,
}

/// Everything a transport carries for the engine.
#[derive(Debug, Clone, PartialEq, Eq, EnumAsInner)]
pub enum Message {
    Work(WorkMessage),
    Ack(AckMessage),
}

impl Message {
    pub fn header(&self) -> &Header {
        match self {
            Self::Work(work) => &work.header,
            Self::Ack(ack) => &ack.header,
        }
    }

    pub fn key(&self) -> CollectiveKey {
        match self {
            Self::Work(work) => work.key,
            Self::Ack(ack) => ack.key,
        }
    }

    pub fn epoch(&self) -> u64 {
        match self {
            Self::Work(work) => work.epoch,
            Self::Ack(ack) => ack.epoch,
        }
    }

    /// Bytes on the wire, used by simulated networks to model transfer time.
    pub fn wire_len(&self) -> usize {
        match self {
            Self::Work(work) => work.payload.len(),
            Self::Ack(_) => 0,
        }
    }
}
