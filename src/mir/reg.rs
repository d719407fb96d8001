//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022-2023 Evan Cox <evanacox00@gmail.com>. All rights reserved. //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

use crate::arena::ArenaKey;
use crate::utility::Packable;
use std::fmt;

#[cfg(feature = "enable-serde")]
use serde::{Deserialize, Serialize};

/// A class of register that a physical register can be in.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
#[repr(u16)]
pub enum RegClass {
    /// The register class for integer (and pointer) values.
    Int = 0,
    /// The register class for floating-point and vector values.
    Float = 1,
}

/// Represents a single physical register on a CPU. The register class is
/// stored in one bit, while the register number is in the bits above it.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
#[repr(transparent)]
pub struct PReg {
    data: u16,
}

impl PReg {
    /// Creates a register with a given number and class.
    #[inline]
    pub const fn with_class(class: RegClass, hw_number: usize) -> Self {
        Self {
            data: ((hw_number as u16) << 1) | (class as u16),
        }
    }

    /// Creates an integer register with a given hardware number.
    #[inline]
    pub const fn int(hw_number: usize) -> Self {
        Self::with_class(RegClass::Int, hw_number)
    }

    /// Creates a floating-point register with a given hardware number.
    #[inline]
    pub const fn float(hw_number: usize) -> Self {
        Self::with_class(RegClass::Float, hw_number)
    }

    /// The "index" of the register. This is effectively the identity of the
    /// physical register itself, no other physical register will have the
    /// same index.
    ///
    /// This is intended for usage in storing registers in an array.
    #[inline]
    pub const fn identity(self) -> usize {
        self.data as usize
    }

    /// Gets the physical "number" of the register that identifies it
    /// **within the class of that register**. This value may overlap with
    /// other register classes.
    #[inline]
    pub const fn hw_number(self) -> usize {
        (self.data >> 1) as usize
    }

    /// Gets what type of register this register is for.
    #[inline]
    pub const fn class(self) -> RegClass {
        if self.data & 1 == 0 {
            RegClass::Int
        } else {
            RegClass::Float
        }
    }
}

impl fmt::Debug for PReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = match self.class() {
            RegClass::Int => 'x',
            RegClass::Float => 'v',
        };

        write!(f, "{prefix}{}", self.hw_number())
    }
}

/// Represents a single **virtual** register. These are dense `u32` keys into
/// the register table of a [`FunctionBody`](super::FunctionBody), which holds
/// the [`Llt`](super::Llt) of each one.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
#[repr(transparent)]
pub struct VReg {
    data: u32,
}

impl ArenaKey for VReg {
    #[inline]
    fn key_new(index: usize) -> Self {
        // the packed `Reg` representation only leaves 31 bits for the index
        debug_assert!(index < (u32::MAX >> 1) as usize);

        Self { data: index as u32 }
    }

    #[inline]
    fn key_index(self) -> usize {
        self.data as usize
    }
}

impl Packable for VReg {
    #[inline]
    fn reserved_null() -> Self {
        Self { data: u32::MAX }
    }

    #[inline]
    fn is_reserved_null(&self) -> bool {
        self.data == u32::MAX
    }
}

impl fmt::Debug for VReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.data)
    }
}

/// A register that an instruction operand can refer to.
///
/// This stores either a [`VReg`] or a [`PReg`] in the upper 31 bits of its
/// data, with a discriminator in the lowest bit. Virtual registers are the
/// common case, physical registers only appear around ABI boundaries
/// (copies in and out of argument and return registers).
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct Reg {
    data: u32,
}

impl Reg {
    /// Creates a new [`Reg`] from a physical register.
    #[inline]
    pub const fn from_preg(reg: PReg) -> Self {
        Self {
            // lsb is 0, signals preg
            data: (reg.data as u32) << 1,
        }
    }

    /// Creates a new [`Reg`] from a virtual register.
    #[inline]
    pub const fn from_vreg(reg: VReg) -> Self {
        Self {
            // lsb is 1, signals vreg
            data: (reg.data << 1) | 1,
        }
    }

    /// If `self` is a [`VReg`], returns it.
    #[inline]
    pub const fn as_vreg(self) -> Option<VReg> {
        if self.is_vreg() {
            Some(VReg {
                data: self.data >> 1,
            })
        } else {
            None
        }
    }

    /// If `self` is a [`PReg`], returns it.
    #[inline]
    pub const fn as_preg(self) -> Option<PReg> {
        if self.is_preg() {
            Some(PReg {
                data: (self.data >> 1) as u16,
            })
        } else {
            None
        }
    }

    /// Checks if `self` is a [`VReg`].
    #[inline]
    pub const fn is_vreg(self) -> bool {
        self.data & 1 != 0
    }

    /// Checks if `self` is a [`PReg`].
    #[inline]
    pub const fn is_preg(self) -> bool {
        !self.is_vreg()
    }
}

impl From<VReg> for Reg {
    fn from(reg: VReg) -> Self {
        Self::from_vreg(reg)
    }
}

impl From<PReg> for Reg {
    fn from(reg: PReg) -> Self {
        Self::from_preg(reg)
    }
}

impl fmt::Debug for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(v) = self.as_vreg() {
            fmt::Debug::fmt(&v, f)
        } else if let Some(p) = self.as_preg() {
            fmt::Debug::fmt(&p, f)
        } else {
            unreachable!()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_eq_size;

    #[test]
    fn sizes() {
        assert_eq_size!(PReg, u16);
        assert_eq_size!(VReg, u32);
        assert_eq_size!(Reg, u32);
    }

    #[test]
    fn preg_class_and_number() {
        let x3 = PReg::int(3);
        let v3 = PReg::float(3);

        assert_eq!(x3.class(), RegClass::Int);
        assert_eq!(v3.class(), RegClass::Float);
        assert_eq!(x3.hw_number(), 3);
        assert_eq!(v3.hw_number(), 3);
        assert_ne!(x3.identity(), v3.identity());
    }

    #[test]
    fn reg_roundtrips() {
        let v = VReg::key_new(42);
        let p = PReg::float(7);

        let rv = Reg::from_vreg(v);
        let rp = Reg::from_preg(p);

        assert!(rv.is_vreg());
        assert!(rp.is_preg());
        assert_eq!(rv.as_vreg(), Some(v));
        assert_eq!(rv.as_preg(), None);
        assert_eq!(rp.as_preg(), Some(p));
        assert_eq!(rp.as_vreg(), None);
    }
}
