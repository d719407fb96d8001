//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022-2023 Evan Cox <evanacox00@gmail.com>. All rights reserved. //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

use std::fmt;

#[cfg(feature = "enable-serde")]
use serde::{Deserialize, Serialize};

/// A low-level type: the only type information the legalizer works with.
///
/// These carry size and shape but no semantic meaning, there is no signedness
/// and no distinction between a 32-bit float and a 32-bit integer. A type is
/// a scalar of N bits, a vector of K scalar lanes, or a pointer in some
/// address space.
///
/// These are tiny and freely copied, the whole thing packs into 8 bytes.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum Llt {
    /// A scalar of the given bit width, e.g. `s32`.
    Scalar {
        /// The width of the scalar in bits.
        bits: u32,
    },
    /// A vector of `lanes` scalar elements, e.g. `<4 x s16>`.
    Vector {
        /// The number of lanes. Always at least 2.
        lanes: u16,
        /// The width of each lane in bits.
        elt_bits: u32,
    },
    /// A pointer in the given address space, e.g. `p0`.
    Pointer {
        /// The address space.
        space: u16,
        /// The width of the pointer in bits.
        bits: u32,
    },
}

impl Llt {
    /// Creates a scalar type of `bits` bits.
    #[inline]
    pub const fn scalar(bits: u32) -> Self {
        Self::Scalar { bits }
    }

    /// Creates a vector type of `lanes` lanes of `elt_bits`-bit scalars.
    ///
    /// A one-lane vector is just the scalar, so that is what you get.
    #[inline]
    pub const fn vector(lanes: u16, elt_bits: u32) -> Self {
        if lanes == 1 {
            Self::Scalar { bits: elt_bits }
        } else {
            Self::Vector { lanes, elt_bits }
        }
    }

    /// Creates a pointer type in address space `space` with the given width.
    #[inline]
    pub const fn pointer(space: u16, bits: u32) -> Self {
        Self::Pointer { space, bits }
    }

    /// Checks whether `self` is a scalar.
    #[inline]
    pub const fn is_scalar(self) -> bool {
        matches!(self, Self::Scalar { .. })
    }

    /// Checks whether `self` is a vector.
    #[inline]
    pub const fn is_vector(self) -> bool {
        matches!(self, Self::Vector { .. })
    }

    /// Checks whether `self` is a pointer.
    #[inline]
    pub const fn is_pointer(self) -> bool {
        matches!(self, Self::Pointer { .. })
    }

    /// Total size of the type in bits. For vectors this is lanes times the
    /// lane width.
    #[inline]
    pub const fn size_bits(self) -> u32 {
        match self {
            Self::Scalar { bits } => bits,
            Self::Vector { lanes, elt_bits } => (lanes as u32) * elt_bits,
            Self::Pointer { bits, .. } => bits,
        }
    }

    /// Total size of the type in whole bytes, rounding up.
    #[inline]
    pub const fn size_bytes(self) -> u64 {
        (self.size_bits() as u64 + 7) / 8
    }

    /// The number of lanes. Scalars and pointers count as one lane.
    #[inline]
    pub const fn lanes(self) -> u16 {
        match self {
            Self::Vector { lanes, .. } => lanes,
            _ => 1,
        }
    }

    /// The type of a single lane. For scalars and pointers this is `self`.
    #[inline]
    pub const fn element(self) -> Self {
        match self {
            Self::Vector { elt_bits, .. } => Self::Scalar { bits: elt_bits },
            other => other,
        }
    }

    /// The width of a single lane in bits.
    #[inline]
    pub const fn element_bits(self) -> u32 {
        match self {
            Self::Vector { elt_bits, .. } => elt_bits,
            Self::Scalar { bits } => bits,
            Self::Pointer { bits, .. } => bits,
        }
    }

    /// Returns the same element type with a different lane count.
    ///
    /// Only meaningful for vectors and scalars, a count of one collapses to
    /// the scalar element.
    #[inline]
    pub const fn with_lanes(self, lanes: u16) -> Self {
        Self::vector(lanes, self.element_bits())
    }
}

impl fmt::Display for Llt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Scalar { bits } => write!(f, "s{bits}"),
            Self::Vector { lanes, elt_bits } => write!(f, "<{lanes} x s{elt_bits}>"),
            Self::Pointer { space, .. } => write!(f, "p{space}"),
        }
    }
}

impl fmt::Debug for Llt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_eq_size;

    #[test]
    fn llt_is_small() {
        assert_eq_size!(Llt, u64);
    }

    #[test]
    fn scalar_properties() {
        let s32 = Llt::scalar(32);

        assert!(s32.is_scalar());
        assert_eq!(s32.size_bits(), 32);
        assert_eq!(s32.size_bytes(), 4);
        assert_eq!(s32.lanes(), 1);
        assert_eq!(s32.element(), s32);
        assert_eq!(format!("{s32}"), "s32");
    }

    #[test]
    fn vector_properties() {
        let v = Llt::vector(5, 16);

        assert!(v.is_vector());
        assert_eq!(v.size_bits(), 80);
        assert_eq!(v.lanes(), 5);
        assert_eq!(v.element(), Llt::scalar(16));
        assert_eq!(format!("{v}"), "<5 x s16>");
    }

    #[test]
    fn one_lane_vector_is_scalar() {
        assert_eq!(Llt::vector(1, 32), Llt::scalar(32));
        assert_eq!(Llt::vector(4, 8).with_lanes(1), Llt::scalar(8));
    }

    #[test]
    fn odd_width_rounds_up_in_bytes() {
        assert_eq!(Llt::scalar(1).size_bytes(), 1);
        assert_eq!(Llt::scalar(17).size_bytes(), 3);
    }

    #[test]
    fn pointer_properties() {
        let p0 = Llt::pointer(0, 64);

        assert!(p0.is_pointer());
        assert_eq!(p0.size_bits(), 64);
        assert_eq!(format!("{p0}"), "p0");
    }
}
