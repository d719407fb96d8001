//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022-2023 Evan Cox <evanacox00@gmail.com>. All rights reserved. //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

use crate::calls::{AssignRecord, CcState, ConvAssigner, ExtKind, Loc, RegMask, TargetAbi};
use crate::mir::{ArgAttributes, CallConv, Llt, PReg};

/// The AArch64 AAPCS argument assigner.
///
/// Scalars and pointers take `x0..=x7`, vectors take `v0..=v7`, everything
/// past that goes to 8-byte stack slots. Variadic arguments never use
/// registers, matching the Apple variant of the convention.
pub struct Arm64Assigner;

const MAX_REG_ARGS: usize = 8;

impl ConvAssigner for Arm64Assigner {
    fn assign(
        &self,
        _idx: usize,
        ty: Llt,
        attrs: ArgAttributes,
        is_fixed: bool,
        state: &mut CcState,
    ) -> Option<AssignRecord> {
        let loc_ty = if ty.is_scalar() && ty.size_bits() < 32 {
            Llt::scalar(32)
        } else {
            ty
        };
        let ext = if loc_ty == ty {
            ExtKind::None
        } else {
            ExtKind::from_attrs(attrs)
        };

        if is_fixed {
            let candidates: fn(usize) -> PReg = if ty.is_vector() {
                PReg::float
            } else {
                PReg::int
            };

            for n in 0..MAX_REG_ARGS {
                let reg = candidates(n);

                if !state.is_allocated(reg) {
                    state.allocate(reg);

                    return Some(AssignRecord {
                        loc: Loc::Reg(reg),
                        loc_ty,
                        ext,
                    });
                }
            }
        }

        let size = loc_ty.size_bytes().max(8);
        let offset = state.alloc_stack(size, 8);

        Some(AssignRecord {
            loc: Loc::Stack { offset, size },
            loc_ty,
            ext,
        })
    }
}

/// The AArch64 [`TargetAbi`].
pub struct Arm64Abi;

impl Arm64Abi {
    /// The stack pointer's encoding number.
    pub const SP: PReg = PReg::int(31);
}

impl TargetAbi for Arm64Abi {
    fn assigner(&self, _conv: CallConv, _varargs: bool) -> &dyn ConvAssigner {
        &Arm64Assigner
    }

    fn ret_assigner(&self, _conv: CallConv) -> &dyn ConvAssigner {
        &Arm64Assigner
    }

    fn preserved_mask(&self, conv: CallConv) -> RegMask {
        let mut mask = RegMask::preserving((19..=28).map(PReg::int));

        // preserve_most additionally keeps the temporaries alive
        if conv == CallConv::PreserveMost {
            for n in 9..=15 {
                mask.preserve(PReg::int(n));
            }
        }

        mask
    }

    fn may_tail_call(&self, conv: CallConv) -> bool {
        matches!(
            conv,
            CallConv::C | CallConv::Fast | CallConv::PreserveMost
        )
    }

    fn guarantees_tco(&self, conv: CallConv) -> bool {
        conv == CallConv::Fast
    }

    fn stack_pointer(&self) -> PReg {
        Self::SP
    }

    fn pointer_ty(&self) -> Llt {
        Llt::pointer(0, 64)
    }

    fn reg_size_bits(&self) -> u32 {
        64
    }

    fn ret_location_ty(&self, _conv: CallConv, ty: Llt) -> Option<Llt> {
        // small vectors come back widened to a full 64-bit unit when the
        // lane width divides evenly
        if ty.is_vector() && ty.size_bits() < 64 {
            return if 64 % ty.element_bits() == 0 {
                Some(Llt::vector(
                    (64 / ty.element_bits()) as u16,
                    ty.element_bits(),
                ))
            } else {
                None
            };
        }

        if ty.is_scalar() && ty.size_bits() < 32 {
            return Some(Llt::scalar(32));
        }

        Some(ty)
    }

    fn weak_callee_tail_callable(&self) -> bool {
        // the linker may rewrite an unresolved weak call to a nop
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ninth_argument_spills_to_the_stack() {
        let s64 = Llt::scalar(64);
        let mut state = CcState::new(CallConv::C, false);

        for i in 0..8 {
            let record = Arm64Assigner
                .assign(i, s64, ArgAttributes::default(), true, &mut state)
                .expect("assigns");

            assert_eq!(record.loc, Loc::Reg(PReg::int(i)));
        }

        let ninth = Arm64Assigner
            .assign(8, s64, ArgAttributes::default(), true, &mut state)
            .expect("assigns");

        assert_eq!(ninth.loc, Loc::Stack { offset: 0, size: 8 });
    }

    #[test]
    fn vectors_use_their_own_register_file() {
        let v4 = Llt::vector(4, 32);
        let s64 = Llt::scalar(64);
        let mut state = CcState::new(CallConv::C, false);

        let vec = Arm64Assigner
            .assign(0, v4, ArgAttributes::default(), true, &mut state)
            .expect("assigns");
        let scalar = Arm64Assigner
            .assign(1, s64, ArgAttributes::default(), true, &mut state)
            .expect("assigns");

        assert_eq!(vec.loc, Loc::Reg(PReg::float(0)));
        assert_eq!(scalar.loc, Loc::Reg(PReg::int(0)));
    }

    #[test]
    fn variadic_arguments_never_use_registers() {
        let s64 = Llt::scalar(64);
        let mut state = CcState::new(CallConv::C, true);

        let record = Arm64Assigner
            .assign(0, s64, ArgAttributes::default(), false, &mut state)
            .expect("assigns");

        assert!(matches!(record.loc, Loc::Stack { .. }));
    }

    #[test]
    fn narrow_scalars_promote_to_word_locations() {
        let s8 = Llt::scalar(8);
        let mut attrs = ArgAttributes::default();

        attrs.zext = true;

        let mut state = CcState::new(CallConv::C, false);
        let record = Arm64Assigner
            .assign(0, s8, attrs, true, &mut state)
            .expect("assigns");

        assert_eq!(record.loc_ty, Llt::scalar(32));
        assert_eq!(record.ext, ExtKind::Zero);
    }

    #[test]
    fn preserve_most_covers_the_default_mask() {
        let c = Arm64Abi.preserved_mask(CallConv::C);
        let most = Arm64Abi.preserved_mask(CallConv::PreserveMost);

        assert!(most.covers(&c));
        assert!(!c.covers(&most));
    }
}
