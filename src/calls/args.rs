//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022-2023 Evan Cox <evanacox00@gmail.com>. All rights reserved. //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

use crate::mir::{ArgAttributes, CallConv, Llt, PReg, Reg};
use smallbitvec::SmallBitVec;
use smallvec::SmallVec;

/// How a value is extended when its location is wider than it is.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ExtKind {
    /// The location matches the value exactly.
    None,
    /// Upper bits are zeroed.
    Zero,
    /// Upper bits replicate the sign bit.
    Sign,
    /// Upper bits are unspecified.
    Any,
}

impl ExtKind {
    /// Derives the extension from signature attributes, defaulting to
    /// unspecified upper bits.
    pub fn from_attrs(attrs: ArgAttributes) -> Self {
        if attrs.zext {
            Self::Zero
        } else if attrs.sext {
            Self::Sign
        } else {
            Self::Any
        }
    }
}

/// Where one part of a value lives across a call boundary.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Loc {
    /// A physical register.
    Reg(PReg),
    /// A slot in the outgoing (or incoming) stack argument area.
    Stack {
        /// Byte offset from the base of the argument area.
        offset: i64,
        /// Size of the slot in bytes.
        size: u64,
    },
}

/// One completed assignment: where the part goes, the type it must have at
/// that location, and how to widen it to that type.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct AssignRecord {
    /// The assigned location.
    pub loc: Loc,
    /// The type the value has at the location.
    pub loc_ty: Llt,
    /// The extension used to reach `loc_ty`.
    pub ext: ExtKind,
}

/// One indivisible part of a logical argument or return value, produced by
/// value splitting and consumed by an assigner.
#[derive(Clone, Debug)]
pub struct ArgDescriptor {
    /// The virtual register holding the part.
    pub reg: Reg,
    /// The part's type.
    pub ty: Llt,
    /// Attributes inherited from the signature.
    pub attrs: ArgAttributes,
    /// Whether the argument is a fixed (non-variadic) one at this call
    /// site.
    pub is_fixed: bool,
}

impl ArgDescriptor {
    /// Creates a descriptor for a fixed argument with no attributes.
    pub fn new(reg: Reg, ty: Llt) -> Self {
        Self {
            reg,
            ty,
            attrs: ArgAttributes::default(),
            is_fixed: true,
        }
    }
}

/// Cumulative allocation state threaded through a [`ConvAssigner`] over one
/// argument list.
pub struct CcState {
    allocated: SmallBitVec,
    next_stack_offset: u64,
    conv: CallConv,
    varargs: bool,
}

impl CcState {
    /// Creates a fresh state for one assignment pass.
    pub fn new(conv: CallConv, varargs: bool) -> Self {
        Self {
            allocated: SmallBitVec::new(),
            next_stack_offset: 0,
            conv,
            varargs,
        }
    }

    /// The convention being assigned for.
    pub fn conv(&self) -> CallConv {
        self.conv
    }

    /// Whether the list being assigned is variadic.
    pub fn varargs(&self) -> bool {
        self.varargs
    }

    /// Checks whether `reg` was already handed out.
    pub fn is_allocated(&self, reg: PReg) -> bool {
        self.allocated
            .get(reg.identity())
            .unwrap_or(false)
    }

    /// Marks `reg` as handed out.
    pub fn allocate(&mut self, reg: PReg) {
        let id = reg.identity();

        while self.allocated.len() <= id {
            self.allocated.push(false);
        }

        self.allocated.set(id, true);
    }

    /// Reserves `size` bytes of stack at `align`, returning the slot's byte
    /// offset.
    pub fn alloc_stack(&mut self, size: u64, align: u64) -> i64 {
        debug_assert!(align.is_power_of_two());

        let offset = (self.next_stack_offset + align - 1) & !(align - 1);

        self.next_stack_offset = offset + size;

        offset as i64
    }

    /// The total stack bytes reserved so far.
    pub fn stack_bytes(&self) -> u64 {
        self.next_stack_offset
    }
}

/// A target's calling-convention assignment function for one direction of
/// one convention.
///
/// Stateless apart from the explicitly threaded [`CcState`]. Returning
/// `None` refuses the value, which the caller surfaces as a lowering
/// refusal rather than a hard error.
pub trait ConvAssigner {
    /// Assigns the `idx`-th part to a location.
    fn assign(
        &self,
        idx: usize,
        ty: Llt,
        attrs: ArgAttributes,
        is_fixed: bool,
        state: &mut CcState,
    ) -> Option<AssignRecord>;
}

/// Who a call site targets.
#[derive(Clone, Debug)]
pub enum Callee {
    /// A named function.
    Direct {
        /// The symbol name.
        name: String,
        /// Whether the symbol is weakly linked and externally visible.
        weak: bool,
    },
    /// A function address held in a register.
    Indirect(Reg),
}

/// Everything describing one call site before lowering.
#[derive(Clone, Debug)]
pub struct CallDescriptor {
    /// The call target.
    pub callee: Callee,
    /// The callee's calling convention.
    pub conv: CallConv,
    /// The arguments, in source order, already split into parts.
    pub args: Vec<ArgDescriptor>,
    /// The returned value, if the callee produces one.
    pub ret: Option<ArgDescriptor>,
    /// Whether the call site passes a variable argument list.
    pub varargs: bool,
    /// The call is in tail position and may become a tail call.
    pub is_tail_candidate: bool,
    /// The call must become a tail call or fail.
    pub is_must_tail: bool,
}

/// A callee-saved register preservation mask.
#[derive(Clone, Default, Debug)]
pub struct RegMask {
    bits: SmallBitVec,
}

impl RegMask {
    /// Creates a mask preserving nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a mask preserving every listed register.
    pub fn preserving(regs: impl IntoIterator<Item = PReg>) -> Self {
        let mut mask = Self::new();

        for reg in regs {
            mask.preserve(reg);
        }

        mask
    }

    /// Marks `reg` as preserved across the call.
    pub fn preserve(&mut self, reg: PReg) {
        let id = reg.identity();

        while self.bits.len() <= id {
            self.bits.push(false);
        }

        self.bits.set(id, true);
    }

    /// Checks whether `reg` survives the call.
    pub fn preserves(&self, reg: PReg) -> bool {
        self.bits.get(reg.identity()).unwrap_or(false)
    }

    /// Checks whether everything `other` preserves is preserved by `self`
    /// too.
    pub fn covers(&self, other: &RegMask) -> bool {
        (0..other.bits.len())
            .filter(|&i| other.bits[i])
            .all(|i| self.bits.get(i).unwrap_or(false))
    }

    /// Iterates over the preserved registers as identity indices.
    pub(crate) fn preserved_ids(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.bits.len()).filter(|&i| self.bits[i])
    }
}

/// Splits a logical value into indivisible parts, one descriptor per part.
///
/// Scalars wider than a machine register split into register-sized pieces
/// in little-endian order when the width is an exact multiple. Anything
/// else that does not fit a register is refused.
pub fn split_value_types(
    desc: &ArgDescriptor,
    reg_size_bits: u32,
) -> Option<SmallVec<[Llt; 2]>> {
    let bits = desc.ty.size_bits();

    if bits <= reg_size_bits || !desc.ty.is_scalar() {
        return Some(smallvec::smallvec![desc.ty]);
    }

    if bits % reg_size_bits != 0 {
        return None;
    }

    let part = Llt::scalar(reg_size_bits);

    Some((0..bits / reg_size_bits).map(|_| part).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::ArenaKey;
    use crate::mir::VReg;

    #[test]
    fn state_tracks_registers_and_stack() {
        let mut state = CcState::new(CallConv::C, false);
        let x0 = PReg::int(0);

        assert!(!state.is_allocated(x0));
        state.allocate(x0);
        assert!(state.is_allocated(x0));

        assert_eq!(state.alloc_stack(8, 8), 0);
        assert_eq!(state.alloc_stack(4, 8), 8);
        assert_eq!(state.alloc_stack(8, 8), 16);
        assert_eq!(state.stack_bytes(), 24);
    }

    #[test]
    fn mask_coverage_is_superset() {
        let small = RegMask::preserving([PReg::int(19), PReg::int(20)]);
        let big = RegMask::preserving([PReg::int(19), PReg::int(20), PReg::int(21)]);

        assert!(big.covers(&small));
        assert!(!small.covers(&big));
        assert!(big.covers(&big));
    }

    #[test]
    fn wide_scalars_split_into_register_pieces() {
        let desc = ArgDescriptor::new(Reg::from_vreg(VReg::key_new(0)), Llt::scalar(128));
        let parts = split_value_types(&desc, 64).expect("splits");

        assert_eq!(parts.as_slice(), [Llt::scalar(64), Llt::scalar(64)]);

        let narrow = ArgDescriptor::new(Reg::from_vreg(VReg::key_new(1)), Llt::scalar(32));

        assert_eq!(
            split_value_types(&narrow, 64).expect("fits").as_slice(),
            [Llt::scalar(32)]
        );

        let odd = ArgDescriptor::new(Reg::from_vreg(VReg::key_new(2)), Llt::scalar(96));

        assert!(split_value_types(&odd, 64).is_none());
    }
}
