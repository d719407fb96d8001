//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022-2023 Evan Cox <evanacox00@gmail.com>. All rights reserved. //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

use crate::legalize::{legality_types, LegalityPolicy, LegalityQuery, LegalizeAction};
use crate::mir::{
    CondCode, Inst, Llt, MathFlags, ObservedBody, Opcode, Operand, Reg,
};
use smallvec::SmallVec;

/// Marker error: no strategy could make the instruction legal.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct UnableToLegalize;

/// What a successful legalization step did.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum LegalizeResult {
    /// The policy accepted the instruction as is, nothing changed.
    AlreadyLegal,
    /// The instruction was rewritten. It may need another look before it
    /// is legal.
    Legalized,
}

/// Applies one legalization step to one instruction.
///
/// Each strategy rewrites the instruction in place where possible: the
/// original instruction becomes the final instruction of its replacement
/// sequence, keeping its result registers, and the observer sees it as a
/// change rather than an erase/create pair.
pub struct LegalizeHelper<'o, 'a> {
    ob: &'o mut ObservedBody<'a>,
    policy: &'o dyn LegalityPolicy,
}

impl<'o, 'a> LegalizeHelper<'o, 'a> {
    /// Creates a helper over `ob` consulting `policy`.
    pub fn new(ob: &'o mut ObservedBody<'a>, policy: &'o dyn LegalityPolicy) -> Self {
        Self { ob, policy }
    }

    /// Queries the policy about `inst` and applies whatever strategy it
    /// picks.
    pub fn legalize_step(&mut self, inst: Inst) -> Result<LegalizeResult, UnableToLegalize> {
        let types = legality_types(self.ob.body(), inst);
        let action = self.policy.action(LegalityQuery {
            opcode: self.ob.body().inst(inst).opcode(),
            types: &types,
        });

        match action {
            LegalizeAction::Legal => Ok(LegalizeResult::AlreadyLegal),
            LegalizeAction::WidenScalar { slot, ty } => {
                self.widen_scalar(inst, slot, ty)?;
                Ok(LegalizeResult::Legalized)
            }
            LegalizeAction::NarrowScalar { slot, ty } => {
                self.narrow_scalar(inst, slot, ty)?;
                Ok(LegalizeResult::Legalized)
            }
            LegalizeAction::FewerElements { slot, ty } => {
                self.fewer_elements(inst, slot, ty)?;
                Ok(LegalizeResult::Legalized)
            }
            LegalizeAction::MoreElements { slot, ty } => {
                self.more_elements(inst, slot, ty)?;
                Ok(LegalizeResult::Legalized)
            }
            LegalizeAction::Lower => {
                self.lower(inst)?;
                Ok(LegalizeResult::Legalized)
            }
            LegalizeAction::Libcall => {
                self.libcall(inst)?;
                Ok(LegalizeResult::Legalized)
            }
            LegalizeAction::Unsupported => Err(UnableToLegalize),
        }
    }

    fn ty_of(&self, reg: Reg) -> Llt {
        self.ob
            .body()
            .value_ty(reg)
            .expect("expected a virtual register")
    }

    fn src(&self, inst: Inst, i: usize) -> Reg {
        self.ob.body().inst(inst).arg_reg(i)
    }

    fn dst(&self, inst: Inst) -> Reg {
        self.ob.body().inst(inst).def(0)
    }

    /// Replaces `inst`'s result with a fresh register of type `wide`, and
    /// returns `(old_def, wide_def)`. The caller must eventually define
    /// `old_def` again.
    fn detach_wide_def(&mut self, inst: Inst, wide: Llt) -> (Reg, Reg) {
        let old = self.dst(inst);
        let wide_def = self.ob.create_vreg(wide);

        self.ob.mutate(inst, |data| data.defs[0] = wide_def);

        (old, wide_def)
    }

    /// Defines `old` from `value`, truncating if `value` is wider.
    fn restore_def(&mut self, old: Reg, value: Reg) {
        let op = if self.ty_of(old) == self.ty_of(value) {
            Opcode::Copy
        } else {
            Opcode::Trunc
        };

        self.ob.build_into(op, old, [Operand::Reg(value)], MathFlags::NONE);
    }

    /// Performs the operation at a wider scalar type and truncates the
    /// result back.
    pub fn widen_scalar(
        &mut self,
        inst: Inst,
        _slot: usize,
        wide: Llt,
    ) -> Result<(), UnableToLegalize> {
        let opcode = self.ob.body().inst(inst).opcode();

        match opcode {
            Opcode::Add
            | Opcode::Sub
            | Opcode::Mul
            | Opcode::And
            | Opcode::Or
            | Opcode::Xor => self.widen_binop(inst, wide, Opcode::Zext, Opcode::Zext),

            Opcode::Shl | Opcode::LShr => self.widen_binop(inst, wide, Opcode::Zext, Opcode::Zext),
            Opcode::AShr => self.widen_binop(inst, wide, Opcode::Sext, Opcode::Zext),

            Opcode::Neg => {
                self.ob.set_insertion_before(inst);

                let src = self.src(inst, 0);
                let wide_src = self.ob.build_cast(Opcode::Zext, wide, src);
                let (old, wide_def) = self.detach_wide_def(inst, wide);

                self.ob.mutate(inst, |data| {
                    data.args[0] = Operand::Reg(wide_src);
                });
                self.ob.set_insertion_after(inst);
                self.restore_def(old, wide_def);

                Ok(())
            }

            Opcode::Icmp => {
                let cond = match self.ob.body().inst(inst).args()[0] {
                    Operand::Cond(c) => c,
                    _ => return Err(UnableToLegalize),
                };
                let ext = if cond.is_signed() {
                    Opcode::Sext
                } else {
                    Opcode::Zext
                };

                self.ob.set_insertion_before(inst);

                let lhs = self.src(inst, 1);
                let rhs = self.src(inst, 2);
                let wide_lhs = self.ob.build_cast(ext, wide, lhs);
                let wide_rhs = self.ob.build_cast(ext, wide, rhs);

                self.ob.mutate(inst, |data| {
                    data.args[1] = Operand::Reg(wide_lhs);
                    data.args[2] = Operand::Reg(wide_rhs);
                });

                Ok(())
            }

            Opcode::Select => {
                self.ob.set_insertion_before(inst);

                let t = self.src(inst, 1);
                let f = self.src(inst, 2);
                let wide_t = self.ob.build_cast(Opcode::Zext, wide, t);
                let wide_f = self.ob.build_cast(Opcode::Zext, wide, f);
                let (old, wide_def) = self.detach_wide_def(inst, wide);

                self.ob.mutate(inst, |data| {
                    data.args[1] = Operand::Reg(wide_t);
                    data.args[2] = Operand::Reg(wide_f);
                });
                self.ob.set_insertion_after(inst);
                self.restore_def(old, wide_def);

                Ok(())
            }

            Opcode::Constant => {
                self.ob.set_insertion_before(inst);

                let (old, wide_def) = self.detach_wide_def(inst, wide);

                self.ob.set_insertion_after(inst);
                self.restore_def(old, wide_def);

                Ok(())
            }

            Opcode::Ctpop | Opcode::Ctlz | Opcode::CtlzZeroUndef | Opcode::Cttz
            | Opcode::CttzZeroUndef => self.widen_bit_count(inst, wide),

            Opcode::SextInReg => {
                self.ob.set_insertion_before(inst);

                let src = self.src(inst, 0);
                let wide_src = self.ob.build_cast(Opcode::Anyext, wide, src);
                let (old, wide_def) = self.detach_wide_def(inst, wide);

                self.ob.mutate(inst, |data| {
                    data.args[0] = Operand::Reg(wide_src);
                });
                self.ob.set_insertion_after(inst);
                self.restore_def(old, wide_def);

                Ok(())
            }

            Opcode::MergeValues => self.widen_merge(inst, wide),

            Opcode::BuildVector => {
                let lanes = self.ob.body().inst(inst).args().len();
                let old_ty = self.ty_of(self.dst(inst));
                let wide_vec = Llt::vector(old_ty.lanes(), wide.size_bits());

                self.ob.set_insertion_before(inst);

                let mut wide_lanes = SmallVec::<[Reg; 8]>::new();

                for i in 0..lanes {
                    let lane = self.src(inst, i);

                    wide_lanes.push(self.ob.build_cast(Opcode::Anyext, wide, lane));
                }

                let (old, wide_def) = self.detach_wide_def(inst, wide_vec);

                self.ob.mutate(inst, |data| {
                    for (arg, wide_lane) in data.args.iter_mut().zip(wide_lanes) {
                        *arg = Operand::Reg(wide_lane);
                    }
                });
                self.ob.set_insertion_after(inst);
                self.restore_def(old, wide_def);

                Ok(())
            }

            _ => Err(UnableToLegalize),
        }
    }

    fn widen_binop(
        &mut self,
        inst: Inst,
        wide: Llt,
        lhs_ext: Opcode,
        rhs_ext: Opcode,
    ) -> Result<(), UnableToLegalize> {
        self.ob.set_insertion_before(inst);

        let lhs = self.src(inst, 0);
        let rhs = self.src(inst, 1);
        let wide_lhs = self.ob.build_cast(lhs_ext, wide, lhs);
        let wide_rhs = self.ob.build_cast(rhs_ext, wide, rhs);
        let (old, wide_def) = self.detach_wide_def(inst, wide);

        self.ob.mutate(inst, |data| {
            data.args[0] = Operand::Reg(wide_lhs);
            data.args[1] = Operand::Reg(wide_rhs);
        });
        self.ob.set_insertion_after(inst);
        self.restore_def(old, wide_def);

        Ok(())
    }

    /// Widens the bit-counting operations, applying the corrections each
    /// one needs to stay exact at the wider width.
    fn widen_bit_count(&mut self, inst: Inst, wide: Llt) -> Result<(), UnableToLegalize> {
        let opcode = self.ob.body().inst(inst).opcode();
        let src = self.src(inst, 0);
        let src_bits = self.ty_of(src).size_bits();

        if wide.size_bits() <= src_bits {
            return Err(UnableToLegalize);
        }

        self.ob.set_insertion_before(inst);

        let wide_src = match opcode {
            // a counted guard bit stops the count at the original width
            Opcode::Cttz => {
                let zext = self.ob.build_cast(Opcode::Zext, wide, src);
                let guard = self.ob.build_constant(wide, 1i64 << src_bits);

                self.ob.build_binop(Opcode::Or, wide, zext, guard, MathFlags::NONE)
            }
            // zero extension keeps the trailing and popcount results exact
            _ => self.ob.build_cast(Opcode::Zext, wide, src),
        };

        let (old, wide_def) = self.detach_wide_def(inst, wide);

        self.ob.mutate(inst, |data| {
            data.args[0] = Operand::Reg(wide_src);
        });
        self.ob.set_insertion_after(inst);

        let result = match opcode {
            // the wider input has extra leading zeros, subtract them off
            Opcode::Ctlz | Opcode::CtlzZeroUndef => {
                let delta = self
                    .ob
                    .build_constant(wide, (wide.size_bits() - src_bits) as i64);

                self.ob
                    .build_binop(Opcode::Sub, wide, wide_def, delta, MathFlags::NONE)
            }
            _ => wide_def,
        };

        self.restore_def(old, result);

        Ok(())
    }

    /// Widens the source-part type of a `MergeValues`.
    fn widen_merge(&mut self, inst: Inst, wide: Llt) -> Result<(), UnableToLegalize> {
        let dst = self.dst(inst);
        let dst_ty = self.ty_of(dst);
        let parts: SmallVec<[Reg; 8]> = self.ob.body().inst(inst).reg_args().collect();
        let part_bits = self.ty_of(parts[0]).size_bits();
        let wide_bits = wide.size_bits();

        if wide_bits >= dst_ty.size_bits() {
            // shift the parts into place inside one wide integer
            self.ob.set_insertion_before(inst);

            let mut acc = self.ob.build_cast(Opcode::Zext, wide, parts[0]);

            for (i, &part) in parts.iter().enumerate().skip(1) {
                let wide_part = self.ob.build_cast(Opcode::Zext, wide, part);
                let amt = self.ob.build_constant(wide, (i as u32 * part_bits) as i64);
                let shifted =
                    self.ob
                        .build_binop(Opcode::Shl, wide, wide_part, amt, MathFlags::NONE);

                acc = self
                    .ob
                    .build_binop(Opcode::Or, wide, acc, shifted, MathFlags::NONE);
            }

            let final_op = if dst_ty.is_pointer() {
                let int = if wide_bits == dst_ty.size_bits() {
                    acc
                } else {
                    self.ob.build_cast(Opcode::Trunc, Llt::scalar(dst_ty.size_bits()), acc)
                };

                self.ob.mutate(inst, |data| {
                    data.opcode = Opcode::IntToPtr;
                    data.args.clear();
                    data.args.push(Operand::Reg(int));
                });
                return Ok(());
            } else if wide_bits == dst_ty.size_bits() {
                (Opcode::Copy, acc)
            } else {
                (Opcode::Trunc, acc)
            };

            self.ob.mutate(inst, |data| {
                data.opcode = final_op.0;
                data.args.clear();
                data.args.push(Operand::Reg(final_op.1));
            });

            return Ok(());
        }

        // group the parts into wider sub-merges, padding with undef
        if wide_bits % part_bits != 0 {
            return Err(UnableToLegalize);
        }

        let group = (wide_bits / part_bits) as usize;

        self.ob.set_insertion_before(inst);

        let mut padded = parts.clone();

        while padded.len() % group != 0 {
            let part_ty = Llt::scalar(part_bits);
            padded.push(self.ob.build_undef(part_ty));
        }

        let mut wide_parts = SmallVec::<[Reg; 4]>::new();

        for chunk in padded.chunks(group) {
            wide_parts.push(self.ob.build_merge(wide, chunk.iter().copied()));
        }

        if wide_parts.len() == 1 {
            let only = wide_parts[0];

            self.ob.mutate(inst, |data| {
                data.opcode = Opcode::Trunc;
                data.args.clear();
                data.args.push(Operand::Reg(only));
            });
        } else {
            let padded_bits = wide_bits * wide_parts.len() as u32;

            if padded_bits == dst_ty.size_bits() {
                self.ob.mutate(inst, |data| {
                    data.args.clear();
                    data.args.extend(wide_parts.iter().map(|&r| Operand::Reg(r)));
                });
            } else {
                let big = self
                    .ob
                    .build_merge(Llt::scalar(padded_bits), wide_parts.iter().copied());

                self.ob.mutate(inst, |data| {
                    data.opcode = Opcode::Trunc;
                    data.args.clear();
                    data.args.push(Operand::Reg(big));
                });
            }
        }

        Ok(())
    }

    /// Splits a scalar operation into pieces of type `narrow`.
    pub fn narrow_scalar(
        &mut self,
        inst: Inst,
        _slot: usize,
        narrow: Llt,
    ) -> Result<(), UnableToLegalize> {
        let opcode = self.ob.body().inst(inst).opcode();

        match opcode {
            Opcode::Constant => {
                let dst_ty = self.ty_of(self.dst(inst));
                let total = dst_ty.size_bits();
                let n = narrow.size_bits();

                if total % n != 0 || !dst_ty.is_scalar() {
                    return Err(UnableToLegalize);
                }

                let value = self.ob.body().inst(inst).arg_imm(0);
                let pieces = total / n;

                self.ob.set_insertion_before(inst);

                let mut parts = SmallVec::<[Reg; 4]>::new();

                for i in 0..pieces {
                    let mask = if n >= 64 { -1i64 } else { (1i64 << n) - 1 };
                    let piece = (value >> (i * n)) & mask;

                    parts.push(self.ob.build_constant(narrow, piece));
                }

                self.ob.mutate(inst, |data| {
                    data.opcode = Opcode::MergeValues;
                    data.args.clear();
                    data.args.extend(parts.iter().map(|&r| Operand::Reg(r)));
                });

                Ok(())
            }

            Opcode::And | Opcode::Or | Opcode::Xor => {
                let dst_ty = self.ty_of(self.dst(inst));
                let total = dst_ty.size_bits();
                let n = narrow.size_bits();

                if total % n != 0 || !dst_ty.is_scalar() {
                    return Err(UnableToLegalize);
                }

                let pieces = (total / n) as usize;
                let lhs = self.src(inst, 0);
                let rhs = self.src(inst, 1);

                self.ob.set_insertion_before(inst);

                let lhs_parts = self.ob.build_unmerge(narrow, pieces, lhs);
                let rhs_parts = self.ob.build_unmerge(narrow, pieces, rhs);
                let mut results = SmallVec::<[Reg; 4]>::new();

                for (l, r) in lhs_parts.iter().zip(rhs_parts.iter()) {
                    results.push(self.ob.build_binop(opcode, narrow, *l, *r, MathFlags::NONE));
                }

                self.ob.mutate(inst, |data| {
                    data.opcode = Opcode::MergeValues;
                    data.args.clear();
                    data.args.extend(results.iter().map(|&r| Operand::Reg(r)));
                });

                Ok(())
            }

            Opcode::SextInReg => self.narrow_sext_inreg(inst, narrow),

            _ => Err(UnableToLegalize),
        }
    }

    fn narrow_sext_inreg(&mut self, inst: Inst, narrow: Llt) -> Result<(), UnableToLegalize> {
        let dst_ty = self.ty_of(self.dst(inst));
        let total = dst_ty.size_bits();
        let n = narrow.size_bits();
        let imm = self.ob.body().inst(inst).arg_imm(1) as u32;
        let src = self.src(inst, 0);

        if imm <= n {
            // the whole extension fits in one narrow piece
            self.ob.set_insertion_before(inst);

            let t = self.ob.build_cast(Opcode::Trunc, narrow, src);
            let s = self.ob.build_sext_inreg(narrow, t, imm);

            self.ob.mutate(inst, |data| {
                data.opcode = Opcode::Sext;
                data.args.clear();
                data.args.push(Operand::Reg(s));
            });

            return Ok(());
        }

        if total % n != 0 {
            return Err(UnableToLegalize);
        }

        let pieces = (total / n) as usize;
        let boundary = ((imm - 1) / n) as usize;
        let bits_in_boundary = imm - (boundary as u32) * n;

        self.ob.set_insertion_before(inst);

        let parts = self.ob.build_unmerge(narrow, pieces, src);
        let extended = if bits_in_boundary == n {
            parts[boundary]
        } else {
            self.ob.build_sext_inreg(narrow, parts[boundary], bits_in_boundary)
        };
        let fill_amt = self.ob.build_constant(narrow, (n - 1) as i64);
        let fill = self
            .ob
            .build_binop(Opcode::AShr, narrow, extended, fill_amt, MathFlags::NONE);

        let mut results = SmallVec::<[Reg; 4]>::new();

        for (i, &part) in parts.iter().enumerate() {
            results.push(match i.cmp(&boundary) {
                std::cmp::Ordering::Less => part,
                std::cmp::Ordering::Equal => extended,
                std::cmp::Ordering::Greater => fill,
            });
        }

        self.ob.mutate(inst, |data| {
            data.opcode = Opcode::MergeValues;
            data.args.clear();
            data.args.extend(results.iter().map(|&r| Operand::Reg(r)));
        });

        Ok(())
    }

    fn is_elementwise(opcode: Opcode) -> bool {
        matches!(
            opcode,
            Opcode::Add
                | Opcode::Sub
                | Opcode::Mul
                | Opcode::And
                | Opcode::Or
                | Opcode::Xor
                | Opcode::FAdd
                | Opcode::FSub
                | Opcode::SMin
                | Opcode::SMax
                | Opcode::UMin
                | Opcode::UMax
                | Opcode::Neg
                | Opcode::FNeg
        )
    }

    /// Splits a vector operation into pieces of at most `to.lanes()` lanes,
    /// carving sources with bit-offset extracts and reassembling the result
    /// with inserts into an undef.
    pub fn fewer_elements(
        &mut self,
        inst: Inst,
        _slot: usize,
        to: Llt,
    ) -> Result<(), UnableToLegalize> {
        let opcode = self.ob.body().inst(inst).opcode();

        if !Self::is_elementwise(opcode) {
            return Err(UnableToLegalize);
        }

        let dst = self.dst(inst);
        let orig = self.ty_of(dst);
        let n = orig.lanes() as u32;
        let k = to.lanes() as u32;
        let elt = orig.element_bits();

        if !orig.is_vector() || to.element_bits() != elt || k >= n {
            return Err(UnableToLegalize);
        }

        let flags = self.ob.body().inst(inst).flags();
        let srcs: SmallVec<[Reg; 2]> = self.ob.body().inst(inst).reg_args().collect();

        self.ob.set_insertion_before(inst);

        // carve and compute each piece, the remainder piece keeps its
        // natural width
        let mut pieces = SmallVec::<[(Reg, u32); 4]>::new();
        let mut off = 0u32;

        while off < n {
            let lanes = (n - off).min(k);
            let piece_ty = Llt::vector(lanes as u16, elt);
            let bit_off = off * elt;

            let mut piece_srcs = SmallVec::<[Reg; 2]>::new();

            for &src in &srcs {
                piece_srcs.push(self.ob.build_extract(piece_ty, src, bit_off));
            }

            let result = if piece_srcs.len() == 2 {
                self.ob
                    .build_binop(opcode, piece_ty, piece_srcs[0], piece_srcs[1], flags)
            } else {
                self.ob.build_unop(opcode, piece_ty, piece_srcs[0], flags)
            };

            pieces.push((result, bit_off));
            off += lanes;
        }

        // reassemble into an undef, the original instruction becomes the
        // last insert
        let mut acc = self.ob.build_undef(orig);

        for &(piece, bit_off) in &pieces[..pieces.len() - 1] {
            acc = self.ob.build_insert(orig, acc, piece, bit_off);
        }

        let (last, last_off) = *pieces.last().expect("at least one piece");

        self.ob.mutate(inst, |data| {
            data.opcode = Opcode::Insert;
            data.flags = MathFlags::NONE;
            data.args.clear();
            data.args.push(Operand::Reg(acc));
            data.args.push(Operand::Reg(last));
            data.args.push(Operand::Imm(last_off as i64));
        });

        Ok(())
    }

    /// Pads a vector operation out to `to.lanes()` lanes with undef filler
    /// and extracts the original lanes back out of the result.
    ///
    /// Only integral multiples of the source lane count are supported.
    pub fn more_elements(
        &mut self,
        inst: Inst,
        _slot: usize,
        to: Llt,
    ) -> Result<(), UnableToLegalize> {
        let opcode = self.ob.body().inst(inst).opcode();

        if !Self::is_elementwise(opcode) {
            return Err(UnableToLegalize);
        }

        let dst = self.dst(inst);
        let orig = self.ty_of(dst);
        let n = orig.lanes() as u32;
        let m = to.lanes() as u32;
        let elt = orig.element_bits();

        if !orig.is_vector() || to.element_bits() != elt || m <= n || m % n != 0 {
            return Err(UnableToLegalize);
        }

        let ratio = (m / n) as usize;
        let flags = self.ob.body().inst(inst).flags();
        let srcs: SmallVec<[Reg; 2]> = self.ob.body().inst(inst).reg_args().collect();

        self.ob.set_insertion_before(inst);

        let mut wide_srcs = SmallVec::<[Reg; 2]>::new();

        for &src in &srcs {
            let undef = self.ob.build_undef(orig);
            let mut parts = SmallVec::<[Reg; 4]>::new();

            parts.push(src);

            for _ in 1..ratio {
                parts.push(undef);
            }

            wide_srcs.push(self.ob.build_concat(to, parts));
        }

        let wide_def = self.ob.create_vreg(to);
        let wide_op = if wide_srcs.len() == 2 {
            crate::mir::InstData::new(opcode)
                .with_defs([wide_def])
                .with_args([Operand::Reg(wide_srcs[0]), Operand::Reg(wide_srcs[1])])
                .with_flags(flags)
        } else {
            crate::mir::InstData::new(opcode)
                .with_defs([wide_def])
                .with_args([Operand::Reg(wide_srcs[0])])
                .with_flags(flags)
        };

        self.ob.insert(wide_op);

        // the original lanes sit at offset zero of the padded result
        self.ob.mutate(inst, |data| {
            data.opcode = Opcode::Extract;
            data.flags = MathFlags::NONE;
            data.args.clear();
            data.args.push(Operand::Reg(wide_def));
            data.args.push(Operand::Imm(0));
        });

        Ok(())
    }

    fn available(&self, opcode: Opcode, ty: Llt) -> bool {
        let types = [ty, ty];

        matches!(
            self.policy.action(LegalityQuery {
                opcode,
                types: &types,
            }),
            LegalizeAction::Legal | LegalizeAction::Libcall
        )
    }

    /// Replaces the instruction with simpler instructions of the same
    /// semantics.
    pub fn lower(&mut self, inst: Inst) -> Result<(), UnableToLegalize> {
        let opcode = self.ob.body().inst(inst).opcode();

        match opcode {
            Opcode::Cttz => self.lower_cttz(inst),
            Opcode::CttzZeroUndef => {
                self.ob.mutate(inst, |data| data.opcode = Opcode::Cttz);
                Ok(())
            }
            Opcode::Ctlz => self.lower_ctlz(inst),
            Opcode::CtlzZeroUndef => {
                self.ob.mutate(inst, |data| data.opcode = Opcode::Ctlz);
                Ok(())
            }

            Opcode::SMin | Opcode::SMax | Opcode::UMin | Opcode::UMax => {
                let pred = match opcode {
                    Opcode::SMin => CondCode::Slt,
                    Opcode::SMax => CondCode::Sgt,
                    Opcode::UMin => CondCode::Ult,
                    _ => CondCode::Ugt,
                };
                let ty = self.ty_of(self.dst(inst));
                let cmp_ty = Llt::vector(ty.lanes(), 1);
                let lhs = self.src(inst, 0);
                let rhs = self.src(inst, 1);

                self.ob.set_insertion_before(inst);

                let cmp = self.ob.build_icmp(pred, cmp_ty, lhs, rhs);

                self.ob.mutate(inst, |data| {
                    data.opcode = Opcode::Select;
                    data.args.clear();
                    data.args.push(Operand::Reg(cmp));
                    data.args.push(Operand::Reg(lhs));
                    data.args.push(Operand::Reg(rhs));
                });

                Ok(())
            }

            Opcode::FNeg => {
                let ty = self.ty_of(self.dst(inst));

                if !ty.is_scalar() {
                    return Err(UnableToLegalize);
                }

                let src = self.src(inst, 0);

                self.ob.set_insertion_before(inst);

                // only the instruction's own flags survive onto the fsub
                let neg_zero = 1u64 << (ty.size_bits() - 1);
                let zero = self.ob.build_fconstant(ty, neg_zero);

                self.ob.mutate(inst, |data| {
                    data.opcode = Opcode::FSub;
                    data.args.clear();
                    data.args.push(Operand::Reg(zero));
                    data.args.push(Operand::Reg(src));
                });

                Ok(())
            }

            Opcode::Neg => {
                let ty = self.ty_of(self.dst(inst));
                let src = self.src(inst, 0);

                self.ob.set_insertion_before(inst);

                let zero = self.ob.build_constant(ty, 0);

                self.ob.mutate(inst, |data| {
                    data.opcode = Opcode::Sub;
                    data.args.clear();
                    data.args.push(Operand::Reg(zero));
                    data.args.push(Operand::Reg(src));
                });

                Ok(())
            }

            Opcode::SextInReg => {
                let ty = self.ty_of(self.dst(inst));
                let imm = self.ob.body().inst(inst).arg_imm(1) as u32;
                let src = self.src(inst, 0);

                self.ob.set_insertion_before(inst);

                let amt = self.ob.build_constant(ty, (ty.size_bits() - imm) as i64);
                let shl = self.ob.build_binop(Opcode::Shl, ty, src, amt, MathFlags::NONE);

                self.ob.mutate(inst, |data| {
                    data.opcode = Opcode::AShr;
                    data.args.clear();
                    data.args.push(Operand::Reg(shl));
                    data.args.push(Operand::Reg(amt));
                });

                Ok(())
            }

            _ => Err(UnableToLegalize),
        }
    }

    fn lower_cttz(&mut self, inst: Inst) -> Result<(), UnableToLegalize> {
        let ty = self.ty_of(self.dst(inst));
        let src = self.src(inst, 0);
        let bits = ty.size_bits();

        if self.available(Opcode::CttzZeroUndef, ty) {
            // cttz(x) == x == 0 ? bitwidth : cttz_zero_undef(x)
            self.ob.set_insertion_before(inst);

            let czu = self.ob.build_unop(Opcode::CttzZeroUndef, ty, src, MathFlags::NONE);
            let zero = self.ob.build_constant(ty, 0);
            let cmp = self
                .ob
                .build_icmp(CondCode::Eq, Llt::vector(ty.lanes(), 1), src, zero);
            let width = self.ob.build_constant(ty, bits as i64);

            self.ob.mutate(inst, |data| {
                data.opcode = Opcode::Select;
                data.args.clear();
                data.args.push(Operand::Reg(cmp));
                data.args.push(Operand::Reg(width));
                data.args.push(Operand::Reg(czu));
            });

            return Ok(());
        }

        // isolate the lowest set bit: ~x & (x - 1) has exactly the trailing
        // zeros of x set
        self.ob.set_insertion_before(inst);

        let neg_one = self.ob.build_constant(ty, -1);
        let not = self.ob.build_binop(Opcode::Xor, ty, src, neg_one, MathFlags::NONE);
        let minus_one = self.ob.build_binop(Opcode::Add, ty, src, neg_one, MathFlags::NONE);
        let mask = self.ob.build_binop(Opcode::And, ty, not, minus_one, MathFlags::NONE);

        if self.available(Opcode::Ctlz, ty) {
            // cttz(x) == bitwidth - ctlz(~x & (x - 1))
            let width = self.ob.build_constant(ty, bits as i64);
            let lead = self.ob.build_unop(Opcode::Ctlz, ty, mask, MathFlags::NONE);

            self.ob.mutate(inst, |data| {
                data.opcode = Opcode::Sub;
                data.args.clear();
                data.args.push(Operand::Reg(width));
                data.args.push(Operand::Reg(lead));
            });
        } else {
            // cttz(x) == ctpop(~x & (x - 1))
            self.ob.mutate(inst, |data| {
                data.opcode = Opcode::Ctpop;
                data.args.clear();
                data.args.push(Operand::Reg(mask));
            });
        }

        Ok(())
    }

    fn lower_ctlz(&mut self, inst: Inst) -> Result<(), UnableToLegalize> {
        let ty = self.ty_of(self.dst(inst));
        let src = self.src(inst, 0);
        let bits = ty.size_bits();

        if self.available(Opcode::CtlzZeroUndef, ty) {
            // ctlz(x) == x == 0 ? bitwidth : ctlz_zero_undef(x)
            self.ob.set_insertion_before(inst);

            let czu = self.ob.build_unop(Opcode::CtlzZeroUndef, ty, src, MathFlags::NONE);
            let zero = self.ob.build_constant(ty, 0);
            let cmp = self
                .ob
                .build_icmp(CondCode::Eq, Llt::vector(ty.lanes(), 1), src, zero);
            let width = self.ob.build_constant(ty, bits as i64);

            self.ob.mutate(inst, |data| {
                data.opcode = Opcode::Select;
                data.args.clear();
                data.args.push(Operand::Reg(cmp));
                data.args.push(Operand::Reg(width));
                data.args.push(Operand::Reg(czu));
            });

            return Ok(());
        }

        // smear the highest set bit downward, then the leading zeros are
        // exactly the zeros of the smeared value
        self.ob.set_insertion_before(inst);

        let mut x = src;
        let mut shift = 1u32;

        while shift < bits {
            let amt = self.ob.build_constant(ty, shift as i64);
            let shr = self.ob.build_binop(Opcode::LShr, ty, x, amt, MathFlags::NONE);

            x = self.ob.build_binop(Opcode::Or, ty, x, shr, MathFlags::NONE);
            shift *= 2;
        }

        let neg_one = self.ob.build_constant(ty, -1);
        let not = self.ob.build_binop(Opcode::Xor, ty, x, neg_one, MathFlags::NONE);

        self.ob.mutate(inst, |data| {
            data.opcode = Opcode::Ctpop;
            data.args.clear();
            data.args.push(Operand::Reg(not));
        });

        Ok(())
    }

    /// Replaces the instruction with a call to the runtime routine of the
    /// same semantics.
    pub fn libcall(&mut self, inst: Inst) -> Result<(), UnableToLegalize> {
        let opcode = self.ob.body().inst(inst).opcode();
        let ty = self.ty_of(self.dst(inst));

        let name = libcall_name(opcode, ty).ok_or(UnableToLegalize)?;
        let src = self.src(inst, 0);

        self.ob.mutate(inst, |data| {
            data.opcode = Opcode::Call;
            data.flags = MathFlags::NONE;
            data.args.clear();
            data.args.push(Operand::Symbol(name.into()));
            data.args.push(Operand::Reg(src));
        });

        Ok(())
    }
}

/// The runtime routine implementing `opcode` at scalar type `ty`, if one
/// exists.
pub fn libcall_name(opcode: Opcode, ty: Llt) -> Option<&'static str> {
    if !ty.is_scalar() {
        return None;
    }

    match (opcode, ty.size_bits()) {
        (Opcode::Ctpop, 32) => Some("__popcountsi2"),
        (Opcode::Ctpop, 64) => Some("__popcountdi2"),
        (Opcode::Ctlz | Opcode::CtlzZeroUndef, 32) => Some("__clzsi2"),
        (Opcode::Ctlz | Opcode::CtlzZeroUndef, 64) => Some("__clzdi2"),
        (Opcode::Cttz | Opcode::CttzZeroUndef, 32) => Some("__ctzsi2"),
        (Opcode::Cttz | Opcode::CttzZeroUndef, 64) => Some("__ctzdi2"),
        _ => None,
    }
}
