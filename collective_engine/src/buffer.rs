/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Ownership of the buffers an actor works on.

use std::ops::Range;

use bytes::Bytes;

use crate::dag::Segment;
use crate::message::Payload;
use crate::reduce::Reduction;

/// A segment list that does not fit the buffer or the payload.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("segments need {needed} bytes, have {actual}")]
pub struct BufferError {
    pub needed: usize,
    pub actual: usize,
}

/// A working buffer and who owns it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BufferSlot {
    /// The caller's destination buffer, handed back on completion.
    Caller(Vec<u8>),
    /// Allocated by the engine for this occurrence.
    Scratch(Vec<u8>),
    /// No storage; only sizes are tracked.
    Phantom(usize),
}

impl BufferSlot {
    pub fn scratch(len: usize) -> Self {
        Self::Scratch(vec![0; len])
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Caller(buf) | Self::Scratch(buf) => buf.len(),
            Self::Phantom(len) => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_phantom(&self) -> bool {
        matches!(self, Self::Phantom(_))
    }

    pub fn bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Caller(buf) | Self::Scratch(buf) => Some(buf),
            Self::Phantom(_) => None,
        }
    }

    fn bytes_mut(&mut self) -> Option<&mut [u8]> {
        match self {
            Self::Caller(buf) | Self::Scratch(buf) => Some(buf),
            Self::Phantom(_) => None,
        }
    }

    /// Copy `data` in at byte offset `at`. Phantom slots ignore the data.
    pub fn copy_in(&mut self, at: usize, data: &[u8]) -> Result<(), BufferError> {
        let len = self.len();
        let end = at + data.len();
        if end > len {
            return Err(BufferError {
                needed: end,
                actual: len,
            });
        }
        if let Some(buf) = self.bytes_mut() {
            buf[at..end].copy_from_slice(data);
        }
        Ok(())
    }

    /// Pack `segments` into one payload.
    pub fn read(&self, segments: &[Segment], type_size: usize) -> Result<Payload, BufferError> {
        let total = self.check(segments, type_size)?;
        Ok(match self.bytes() {
            Some(buf) => {
                let mut out = Vec::with_capacity(total);
                for range in byte_ranges(segments, type_size) {
                    out.extend_from_slice(&buf[range]);
                }
                Payload::Data(Bytes::from(out))
            }
            None => Payload::Phantom(total),
        })
    }

    /// Unpack `payload` over `segments`.
    pub fn write(
        &mut self,
        segments: &[Segment],
        type_size: usize,
        payload: &Payload,
    ) -> Result<(), BufferError> {
        self.combine(segments, type_size, payload, |dst, src| {
            dst.copy_from_slice(src)
        })
    }

    /// Reduce `payload` into `segments`.
    pub fn reduce(
        &mut self,
        segments: &[Segment],
        type_size: usize,
        payload: &Payload,
        reduction: &Reduction,
    ) -> Result<(), BufferError> {
        self.combine(segments, type_size, payload, |dst, src| {
            reduction.apply(dst, src)
        })
    }

    /// The buffer contents, unless phantom.
    pub fn into_vec(self) -> Option<Vec<u8>> {
        match self {
            Self::Caller(buf) | Self::Scratch(buf) => Some(buf),
            Self::Phantom(_) => None,
        }
    }

    fn combine(
        &mut self,
        segments: &[Segment],
        type_size: usize,
        payload: &Payload,
        mut apply: impl FnMut(&mut [u8], &[u8]),
    ) -> Result<(), BufferError> {
        let total = self.check(segments, type_size)?;
        if payload.len() != total {
            return Err(BufferError {
                needed: total,
                actual: payload.len(),
            });
        }
        // Phantom on either side moves no bytes.
        let (Some(buf), Payload::Data(data)) = (self.bytes_mut(), payload) else {
            return Ok(());
        };
        let mut cursor = 0;
        for range in byte_ranges(segments, type_size) {
            let len = range.len();
            apply(&mut buf[range], &data[cursor..cursor + len]);
            cursor += len;
        }
        Ok(())
    }

    fn check(&self, segments: &[Segment], type_size: usize) -> Result<usize, BufferError> {
        let end = segments
            .iter()
            .map(|s| s.end() * type_size)
            .max()
            .unwrap_or(0);
        if end > self.len() {
            return Err(BufferError {
                needed: end,
                actual: self.len(),
            });
        }
        Ok(segments.iter().map(|s| s.nelems * type_size).sum())
    }
}

fn byte_ranges(segments: &[Segment], type_size: usize) -> impl Iterator<Item = Range<usize>> + '_ {
    segments
        .iter()
        .map(move |s| s.offset * type_size..s.end() * type_size)
}

/// The buffers of one actor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActorBuffers {
    /// What the action graph reads and writes.
    pub work: BufferSlot,
    /// The caller's destination when it is not itself the working buffer.
    /// Filled when the actor finishes.
    pub dst: Option<Vec<u8>>,
}

impl ActorBuffers {
    /// A working buffer of `len` bytes seeded with `input` at byte offset
    /// `at`. When `reuse_dst` is set and the destination is large enough the
    /// destination itself becomes the working buffer. With neither input nor
    /// destination the buffers are phantom.
    pub fn stage(
        input: Option<&[u8]>,
        dst: Option<Vec<u8>>,
        len: usize,
        at: usize,
        reuse_dst: bool,
    ) -> Result<Self, BufferError> {
        let (mut work, dst) = match dst {
            Some(buf) if reuse_dst && buf.len() >= len => (BufferSlot::Caller(buf), None),
            dst if input.is_none() && dst.is_none() => (BufferSlot::Phantom(len), dst),
            dst => (BufferSlot::scratch(len), dst),
        };
        if let Some(input) = input {
            work.copy_in(at, input)?;
        }
        Ok(Self { work, dst })
    }

    /// Hand back the bytes of the working buffer in `range`: in the
    /// caller's destination when there is one, else in a fresh vector.
    pub fn deliver(self, range: Range<usize>) -> Option<Vec<u8>> {
        match (self.work, self.dst) {
            (BufferSlot::Caller(buf), _) => Some(buf),
            (BufferSlot::Phantom(_), dst) => dst,
            (BufferSlot::Scratch(buf), dst) => {
                let range = range.start.min(buf.len())..range.end.min(buf.len());
                let data = &buf[range];
                match dst {
                    Some(mut out) if out.len() >= data.len() => {
                        out[..data.len()].copy_from_slice(data);
                        Some(out)
                    }
                    _ => Some(data.to_vec()),
                }
            }
        }
    }
}
