//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022-2023 Evan Cox <evanacox00@gmail.com>. All rights reserved. //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

use crate::dense_arena_key;
use crate::mir::{Block, FrameIdx, PReg, Reg};
use smallvec::SmallVec;
use std::ops;

#[cfg(feature = "enable-serde")]
use serde::{Deserialize, Serialize};

dense_arena_key! {
    /// A reference to a single instruction in a
    /// [`FunctionBody`](super::FunctionBody).
    pub struct Inst;
}

/// Every operation the IR can express.
///
/// All of these are type-generic, the operand types live in the register
/// table rather than in the opcode. The handful at the bottom are the
/// machine-level pseudos that call lowering emits, the legalizer never
/// inspects those.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum Opcode {
    /// A register-to-register copy, possibly crossing the virtual/physical
    /// boundary.
    Copy,
    /// Produces an undefined value of its result type.
    ImplicitDef,
    /// Truncates a scalar or vector to a narrower type.
    Trunc,
    /// Sign-extends to a wider type.
    Sext,
    /// Zero-extends to a wider type.
    Zext,
    /// Extends to a wider type with undefined high bits.
    Anyext,
    /// Concatenates N same-sized scalar sources into one wide scalar.
    MergeValues,
    /// Splits one wide scalar into N same-sized scalar results.
    UnmergeValues,
    /// Concatenates vector sources into a longer vector.
    ConcatVectors,
    /// Builds a vector out of scalar lanes.
    BuildVector,
    /// Extracts a sub-value at a bit offset.
    Extract,
    /// Inserts a sub-value into a larger value at a bit offset.
    Insert,
    /// Sign-extends the low `imm` bits of the source in place.
    SextInReg,

    /// Integer addition.
    Add,
    /// Integer subtraction.
    Sub,
    /// Integer multiplication.
    Mul,
    /// Bitwise and.
    And,
    /// Bitwise or.
    Or,
    /// Bitwise xor.
    Xor,
    /// Logical left shift.
    Shl,
    /// Logical right shift.
    LShr,
    /// Arithmetic right shift.
    AShr,
    /// Integer negation.
    Neg,
    /// Counts set bits.
    Ctpop,
    /// Counts leading zeros.
    Ctlz,
    /// Counts leading zeros, undefined on a zero input.
    CtlzZeroUndef,
    /// Counts trailing zeros.
    Cttz,
    /// Counts trailing zeros, undefined on a zero input.
    CttzZeroUndef,
    /// Signed minimum.
    SMin,
    /// Signed maximum.
    SMax,
    /// Unsigned minimum.
    UMin,
    /// Unsigned maximum.
    UMax,

    /// Floating-point addition.
    FAdd,
    /// Floating-point subtraction.
    FSub,
    /// Floating-point negation.
    FNeg,

    /// Integer/pointer comparison producing an `s1` (or vector of `s1`).
    Icmp,
    /// Two-way select on an `s1` condition.
    Select,
    /// Materializes an integer constant.
    Constant,
    /// Materializes a floating-point constant (stored as raw bits).
    FConstant,

    /// Loads a value from memory.
    Load,
    /// Stores a value to memory.
    Store,
    /// Materializes the address of a fixed stack object.
    FrameIndex,
    /// Materializes the address of a global symbol.
    GlobalAddr,
    /// Offsets a pointer by a byte amount.
    PtrAdd,
    /// Reinterprets a pointer as an integer.
    PtrToInt,
    /// Reinterprets an integer as a pointer.
    IntToPtr,

    /// Merges values from predecessor blocks.
    Phi,
    /// An unconditional branch.
    Br,
    /// A conditional branch on an `s1`.
    BrCond,
    /// Marks an unreachable point in the function.
    Unreachable,

    // machine-level pseudos emitted by call lowering, opaque to the
    // legalization engine
    /// Returns from the function.
    Ret,
    /// A call to another function.
    Call,
    /// A call lowered into a terminating branch.
    TailCall,
    /// Reserves the outgoing argument area before a call.
    AdjustStackDown,
    /// Releases the outgoing argument area after a call.
    AdjustStackUp,
}

impl Opcode {
    /// Checks if the instruction ends a basic block.
    pub fn is_terminator(self) -> bool {
        matches!(
            self,
            Self::Br | Self::BrCond | Self::Unreachable | Self::Ret | Self::TailCall
        )
    }

    /// Checks if the instruction has effects beyond its register results,
    /// i.e. whether it must be kept alive even when its results are unused.
    pub fn has_side_effects(self) -> bool {
        matches!(
            self,
            Self::Store
                | Self::Call
                | Self::TailCall
                | Self::Ret
                | Self::Br
                | Self::BrCond
                | Self::Unreachable
                | Self::AdjustStackDown
                | Self::AdjustStackUp
        )
    }
}

/// A comparison predicate for [`Opcode::Icmp`].
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum CondCode {
    /// Equal.
    Eq,
    /// Not equal.
    Ne,
    /// Signed less than.
    Slt,
    /// Signed less than or equal.
    Sle,
    /// Signed greater than.
    Sgt,
    /// Signed greater than or equal.
    Sge,
    /// Unsigned less than.
    Ult,
    /// Unsigned less than or equal.
    Ule,
    /// Unsigned greater than.
    Ugt,
    /// Unsigned greater than or equal.
    Uge,
}

impl CondCode {
    /// Checks if the predicate compares with signed semantics.
    pub fn is_signed(self) -> bool {
        matches!(self, Self::Slt | Self::Sle | Self::Sgt | Self::Sge)
    }
}

/// Fast-math flags attached to floating-point instructions.
///
/// Rewrites must preserve the flags of the instruction being rewritten on
/// its replacements, and must not inherit flags from anywhere else.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Default)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct MathFlags(u8);

impl MathFlags {
    /// No flags set.
    pub const NONE: Self = Self(0);
    /// Assume no NaN inputs or outputs.
    pub const NNAN: Self = Self(1 << 0);
    /// Assume no infinite inputs or outputs.
    pub const NINF: Self = Self(1 << 1);
    /// Treat the sign of zero as insignificant.
    pub const NSZ: Self = Self(1 << 2);
    /// Allow reciprocal approximations.
    pub const ARCP: Self = Self(1 << 3);
    /// Allow floating-point contraction.
    pub const CONTRACT: Self = Self(1 << 4);
    /// Allow reassociation.
    pub const REASSOC: Self = Self(1 << 5);

    /// Computes the union of two flag sets.
    #[inline]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Checks if every flag in `other` is also set in `self`.
    #[inline]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Checks if no flags are set.
    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl ops::BitOr for MathFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl std::fmt::Debug for MathFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names = [
            (Self::NNAN, "nnan"),
            (Self::NINF, "ninf"),
            (Self::NSZ, "nsz"),
            (Self::ARCP, "arcp"),
            (Self::CONTRACT, "contract"),
            (Self::REASSOC, "reassoc"),
        ];

        let mut list = f.debug_set();

        for (flag, name) in names {
            if self.contains(flag) {
                list.entry(&name);
            }
        }

        list.finish()
    }
}

/// A single (non-result) operand of an instruction.
#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum Operand {
    /// A register input.
    Reg(Reg),
    /// An immediate integer, e.g. the value of a [`Opcode::Constant`] or
    /// the bit offset of an [`Opcode::Extract`].
    Imm(i64),
    /// Raw bits of a floating-point immediate.
    Bits(u64),
    /// A branch target.
    Block(Block),
    /// A comparison predicate.
    Cond(CondCode),
    /// A fixed stack object, for [`Opcode::FrameIndex`].
    Frame(FrameIdx),
    /// The name of an external function, for calls.
    Symbol(Box<str>),
}

impl Operand {
    /// If the operand is a register, returns it.
    #[inline]
    pub fn as_reg(&self) -> Option<Reg> {
        match self {
            Self::Reg(r) => Some(*r),
            _ => None,
        }
    }

    /// If the operand is an immediate, returns it.
    #[inline]
    pub fn as_imm(&self) -> Option<i64> {
        match self {
            Self::Imm(v) => Some(*v),
            _ => None,
        }
    }
}

/// The payload of a single instruction.
///
/// Results are explicit in `defs`, inputs and attachments in `args`.
/// The implicit lists record physical registers read or written as a side
/// channel of the ABI, e.g. argument registers of a call.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct InstData {
    pub(crate) opcode: Opcode,
    pub(crate) defs: SmallVec<[Reg; 1]>,
    pub(crate) args: SmallVec<[Operand; 2]>,
    pub(crate) flags: MathFlags,
    pub(crate) implicit_uses: SmallVec<[PReg; 2]>,
    pub(crate) implicit_defs: SmallVec<[PReg; 2]>,
}

impl InstData {
    /// Creates an instruction with no results or operands.
    pub fn new(opcode: Opcode) -> Self {
        Self {
            opcode,
            defs: SmallVec::default(),
            args: SmallVec::default(),
            flags: MathFlags::NONE,
            implicit_uses: SmallVec::default(),
            implicit_defs: SmallVec::default(),
        }
    }

    /// Sets the result registers.
    pub fn with_defs(mut self, defs: impl IntoIterator<Item = Reg>) -> Self {
        self.defs = defs.into_iter().collect();
        self
    }

    /// Sets the operands.
    pub fn with_args(mut self, args: impl IntoIterator<Item = Operand>) -> Self {
        self.args = args.into_iter().collect();
        self
    }

    /// Sets the fast-math flags.
    pub fn with_flags(mut self, flags: MathFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Appends a physical register that the instruction implicitly reads.
    pub fn with_implicit_use(mut self, preg: PReg) -> Self {
        self.implicit_uses.push(preg);
        self
    }

    /// Appends a physical register that the instruction implicitly writes.
    pub fn with_implicit_def(mut self, preg: PReg) -> Self {
        self.implicit_defs.push(preg);
        self
    }

    /// The operation this instruction performs.
    #[inline]
    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    /// The result registers.
    #[inline]
    pub fn defs(&self) -> &[Reg] {
        &self.defs
    }

    /// The operands.
    #[inline]
    pub fn args(&self) -> &[Operand] {
        &self.args
    }

    /// The fast-math flags.
    #[inline]
    pub fn flags(&self) -> MathFlags {
        self.flags
    }

    /// The physical registers the instruction implicitly reads.
    #[inline]
    pub fn implicit_uses(&self) -> &[PReg] {
        &self.implicit_uses
    }

    /// The physical registers the instruction implicitly writes.
    #[inline]
    pub fn implicit_defs(&self) -> &[PReg] {
        &self.implicit_defs
    }

    /// The `i`-th result register.
    #[inline]
    pub fn def(&self, i: usize) -> Reg {
        self.defs[i]
    }

    /// The `i`-th operand, which must be a register.
    #[inline]
    pub fn arg_reg(&self, i: usize) -> Reg {
        self.args[i]
            .as_reg()
            .expect("operand was expected to be a register")
    }

    /// The `i`-th operand, which must be an immediate.
    #[inline]
    pub fn arg_imm(&self, i: usize) -> i64 {
        self.args[i]
            .as_imm()
            .expect("operand was expected to be an immediate")
    }

    /// Iterates over every register operand.
    pub fn reg_args(&self) -> impl Iterator<Item = Reg> + '_ {
        self.args.iter().filter_map(Operand::as_reg)
    }

    /// Checks whether any result or operand touches a physical register,
    /// including the implicit lists.
    pub fn touches_pregs(&self) -> bool {
        !self.implicit_uses.is_empty()
            || !self.implicit_defs.is_empty()
            || self.defs.iter().any(|r| r.is_preg())
            || self.reg_args().any(|r| r.is_preg())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::ArenaKey;
    use crate::mir::VReg;

    #[test]
    fn math_flags_union_and_contains() {
        let f = MathFlags::NNAN | MathFlags::NSZ;

        assert!(f.contains(MathFlags::NNAN));
        assert!(f.contains(MathFlags::NSZ));
        assert!(!f.contains(MathFlags::NINF));
        assert!(MathFlags::NONE.is_empty());
    }

    #[test]
    fn terminators_and_side_effects() {
        assert!(Opcode::Br.is_terminator());
        assert!(Opcode::Ret.is_terminator());
        assert!(!Opcode::Add.is_terminator());

        assert!(Opcode::Store.has_side_effects());
        assert!(!Opcode::Load.has_side_effects());
        assert!(!Opcode::Ctpop.has_side_effects());
    }

    #[test]
    fn reg_args_skips_non_registers() {
        let a = Reg::from_vreg(VReg::key_new(0));
        let b = Reg::from_vreg(VReg::key_new(1));

        let data = InstData::new(Opcode::Extract)
            .with_defs([a])
            .with_args([Operand::Reg(b), Operand::Imm(32)]);

        let regs: Vec<_> = data.reg_args().collect();

        assert_eq!(regs, [b]);
        assert_eq!(data.arg_imm(1), 32);
    }

    #[test]
    fn touches_pregs_sees_implicit_lists() {
        use crate::mir::PReg;

        let v = Reg::from_vreg(VReg::key_new(0));
        let plain = InstData::new(Opcode::Add).with_defs([v]);
        let call = InstData::new(Opcode::Call).with_implicit_use(PReg::int(0));

        assert!(!plain.touches_pregs());
        assert!(call.touches_pregs());
    }
}
