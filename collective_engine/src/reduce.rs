/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Reduction functions applied by the reduce family of collectives.
//!
//! A [`Reduction`] combines two equally sized byte buffers elementwise,
//! `acc = acc (op) incoming`. Reductions for the primitive numeric types are
//! built from a [`ReduceOp`]; arbitrary user functions are wrapped with
//! [`Reduction::custom`].

use std::fmt;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;

/// A type-erased reduction over whole buffers.
pub type ReduceFn = Arc<dyn Fn(&mut [u8], &[u8]) + Send + Sync>;

/// Predefined reduction operators.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumIter,
    strum::EnumString
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ReduceOp {
    Sum,
    Prod,
    Min,
    Max,
    BitAnd,
    BitOr,
    BitXor,
}

/// A fixed-size element that predefined operators apply to.
pub trait Element: Copy + Send + Sync + 'static {
    const NAME: &'static str;

    fn read(bytes: &[u8]) -> Self;

    fn write(self, out: &mut [u8]);

    /// `None` when `op` is not defined for this type.
    fn combine(op: ReduceOp, left: Self, right: Self) -> Option<Self>;
}

macro_rules! int_element {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Element for $ty {
                const NAME: &'static str = stringify!($ty);

                fn read(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(bytes);
                    <$ty>::from_ne_bytes(raw)
                }

                fn write(self, out: &mut [u8]) {
                    out.copy_from_slice(&self.to_ne_bytes());
                }

                fn combine(op: ReduceOp, left: Self, right: Self) -> Option<Self> {
                    Some(match op {
                        ReduceOp::Sum => left.wrapping_add(right),
                        ReduceOp::Prod => left.wrapping_mul(right),
                        ReduceOp::Min => left.min(right),
                        ReduceOp::Max => left.max(right),
                        ReduceOp::BitAnd => left & right,
                        ReduceOp::BitOr => left | right,
                        ReduceOp::BitXor => left ^ right,
                    })
                }
            }
        )*
    };
}

macro_rules! float_element {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Element for $ty {
                const NAME: &'static str = stringify!($ty);

                fn read(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(bytes);
                    <$ty>::from_ne_bytes(raw)
                }

                fn write(self, out: &mut [u8]) {
                    out.copy_from_slice(&self.to_ne_bytes());
                }

                fn combine(op: ReduceOp, left: Self, right: Self) -> Option<Self> {
                    match op {
                        ReduceOp::Sum => Some(left + right),
                        ReduceOp::Prod => Some(left * right),
                        ReduceOp::Min => Some(left.min(right)),
                        ReduceOp::Max => Some(left.max(right)),
                        ReduceOp::BitAnd | ReduceOp::BitOr | ReduceOp::BitXor => None,
                    }
                }
            }
        )*
    };
}

int_element!(u8, i8, u16, i16, u32, i32, u64, i64, u128, i128);
float_element!(f32, f64);

/// A combine function together with the element size it expects.
#[derive(Clone)]
pub struct Reduction {
    name: String,
    type_size: usize,
    apply: ReduceFn,
}

impl Reduction {
    /// The predefined operator `op` over elements of type `T`. Returns
    /// `None` when the operator is not defined for `T` (bitwise operators on
    /// floats).
    pub fn of<T: Element>(op: ReduceOp) -> Option<Self> {
        let size = std::mem::size_of::<T>();
        // Probe once so that undefined combinations fail at construction.
        let zero = T::read(&vec![0u8; size]);
        T::combine(op, zero, zero)?;
        let apply: ReduceFn = Arc::new(move |acc: &mut [u8], incoming: &[u8]| {
            for (left, right) in acc.chunks_exact_mut(size).zip(incoming.chunks_exact(size)) {
                if let Some(value) = T::combine(op, T::read(left), T::read(right)) {
                    value.write(left);
                }
            }
        });
        Some(Self {
            name: format!("{}<{}>", op, T::NAME),
            type_size: size,
            apply,
        })
    }

    /// Wrap a user function that combines `incoming` into `acc`. Both
    /// slices always have the same length, a multiple of `type_size`.
    pub fn custom(
        name: impl Into<String>,
        type_size: usize,
        apply: impl Fn(&mut [u8], &[u8]) + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            type_size,
            apply: Arc::new(apply),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn type_size(&self) -> usize {
        self.type_size
    }

    /// `acc = acc (op) incoming`, elementwise. Extra bytes in the longer
    /// slice are left alone.
    pub fn apply(&self, acc: &mut [u8], incoming: &[u8]) {
        let len = acc.len().min(incoming.len());
        (self.apply)(&mut acc[..len], &incoming[..len]);
    }
}

impl fmt::Debug for Reduction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reduction")
            .field("name", &self.name)
            .field("type_size", &self.type_size)
            .finish()
    }
}

/// Encode a slice of elements in native byte order.
pub fn to_bytes<T: Element>(values: &[T]) -> Vec<u8> {
    let size = std::mem::size_of::<T>();
    let mut out = vec![0u8; values.len() * size];
    for (value, chunk) in values.iter().zip(out.chunks_exact_mut(size)) {
        value.write(chunk);
    }
    out
}

/// Decode native byte order elements. Trailing partial elements are
/// ignored.
pub fn from_bytes<T: Element>(bytes: &[u8]) -> Vec<T> {
    bytes
        .chunks_exact(std::mem::size_of::<T>())
        .map(T::read)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sum_i64() {
        let sum = Reduction::of::<i64>(ReduceOp::Sum).unwrap();
        assert_eq!(sum.type_size(), 8);
        assert_eq!(sum.name(), "sum<i64>");
        let mut acc = to_bytes(&[1i64, -2, 40]);
        sum.apply(&mut acc, &to_bytes(&[2i64, 2, 2]));
        assert_eq!(from_bytes::<i64>(&acc), vec![3, 0, 42]);
    }

    #[test]
    fn test_min_max_float() {
        let max = Reduction::of::<f64>(ReduceOp::Max).unwrap();
        let mut acc = to_bytes(&[1.5f64, -3.0]);
        max.apply(&mut acc, &to_bytes(&[0.5f64, 7.25]));
        assert_eq!(from_bytes::<f64>(&acc), vec![1.5, 7.25]);
        assert!(Reduction::of::<f32>(ReduceOp::BitXor).is_none());
    }

    #[test]
    fn test_bitwise_and_wrapping() {
        let xor = Reduction::of::<u8>(ReduceOp::BitXor).unwrap();
        let mut acc = vec![0b1100u8, 0xff];
        xor.apply(&mut acc, &[0b1010, 0x0f]);
        assert_eq!(acc, vec![0b0110, 0xf0]);

        let prod = Reduction::of::<u8>(ReduceOp::Prod).unwrap();
        let mut acc = vec![16u8];
        prod.apply(&mut acc, &[17]);
        assert_eq!(acc, vec![16]);
    }

    #[test]
    fn test_custom() {
        let concat_max = Reduction::custom("bytewise_max", 1, |acc, incoming| {
            for (a, b) in acc.iter_mut().zip(incoming) {
                *a = (*a).max(*b);
            }
        });
        let mut acc = vec![1, 9, 3];
        concat_max.apply(&mut acc, &[4, 2, 3, 100]);
        assert_eq!(acc, vec![4, 9, 3]);
        assert!(format!("{:?}", concat_max).contains("bytewise_max"));
    }
}
