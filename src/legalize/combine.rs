//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022-2023 Evan Cox <evanacox00@gmail.com>. All rights reserved. //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

use crate::mir::{Inst, MathFlags, ObservedBody, Opcode, Operand, Reg};
use smallvec::{smallvec, SmallVec};

/// Folds producer/consumer pairs of cast and merge artifacts.
///
/// The combiner only rewrites and forwards, it never erases. A successful
/// combine hands back the instructions it made dead, in the order they must
/// be erased (users before producers). The caller owns the erasing so its
/// observer sees every removal.
pub struct ArtifactCombiner;

impl ArtifactCombiner {
    /// Tries to fold `inst` into whatever produced its input.
    ///
    /// Returns `None` when no rule applies, which includes the producer not
    /// being another artifact.
    pub fn try_combine(
        &self,
        ob: &mut ObservedBody<'_>,
        inst: Inst,
    ) -> Option<SmallVec<[Inst; 4]>> {
        match ob.body().inst(inst).opcode() {
            Opcode::Anyext | Opcode::Zext | Opcode::Sext => self.combine_ext(ob, inst),
            Opcode::Trunc => self.combine_trunc(ob, inst),
            Opcode::UnmergeValues => self.combine_unmerge(ob, inst),
            Opcode::Extract => self.combine_extract(ob, inst),
            _ => None,
        }
    }

    /// The attached defining instruction of `reg`, if any.
    fn producer(&self, ob: &ObservedBody<'_>, reg: Reg) -> Option<Inst> {
        let vreg = reg.as_vreg()?;
        let def = ob.body().def_of(vreg)?;

        ob.body().is_attached(def).then_some(def)
    }

    /// How many of `inst`'s register operands are `reg`.
    fn uses_in(&self, ob: &ObservedBody<'_>, inst: Inst, reg: Reg) -> u32 {
        ob.body()
            .inst(inst)
            .reg_args()
            .filter(|&r| r == reg)
            .count() as u32
    }

    /// Checks whether erasing `user` leaves `producer` with no uses at all,
    /// making it safe to erase too.
    fn dies_with(&self, ob: &ObservedBody<'_>, producer: Inst, user: Inst) -> bool {
        let data = ob.body().inst(producer);

        if data.opcode().has_side_effects() || data.touches_pregs() {
            return false;
        }

        data.defs().iter().all(|&d| {
            let vreg = match d.as_vreg() {
                Some(v) => v,
                None => return false,
            };

            ob.body().use_count(vreg) == self.uses_in(ob, user, d)
        })
    }

    /// `ext(trunc x)` folds by the relation of the outer width to the width
    /// of `x`. Any extension of undef is undef.
    fn combine_ext(&self, ob: &mut ObservedBody<'_>, inst: Inst) -> Option<SmallVec<[Inst; 4]>> {
        let opcode = ob.body().inst(inst).opcode();
        let src = ob.body().inst(inst).arg_reg(0);
        let producer = self.producer(ob, src)?;

        match ob.body().inst(producer).opcode() {
            Opcode::ImplicitDef => {
                ob.mutate(inst, |data| {
                    data.opcode = Opcode::ImplicitDef;
                    data.args.clear();
                });

                Some(self.dead_after_rewrite(ob, producer, inst))
            }

            Opcode::Trunc => {
                let x = ob.body().inst(producer).arg_reg(0);
                let dst = ob.body().inst(inst).def(0);
                let dst_bits = ob.body().value_ty(dst)?.size_bits();
                let x_ty = ob.body().value_ty(x)?;
                let trunc_bits = ob.body().value_ty(src)?.size_bits();

                if dst_bits == x_ty.size_bits() {
                    // the pair is an identity up to the bits the trunc
                    // dropped
                    match opcode {
                        Opcode::Anyext => {
                            let dst_vreg = dst.as_vreg()?;

                            ob.replace_all_uses(dst_vreg, x);

                            let mut dead = smallvec![inst];

                            if self.dies_with(ob, producer, inst) {
                                dead.push(producer);
                            }

                            return Some(dead);
                        }
                        Opcode::Zext => {
                            ob.set_insertion_before(inst);

                            let mask = if trunc_bits >= 64 {
                                -1i64
                            } else {
                                (1i64 << trunc_bits) - 1
                            };
                            let mask = ob.build_constant(x_ty, mask);

                            ob.mutate(inst, |data| {
                                data.opcode = Opcode::And;
                                data.args.clear();
                                data.args.push(Operand::Reg(x));
                                data.args.push(Operand::Reg(mask));
                            });
                        }
                        _ => {
                            ob.mutate(inst, |data| {
                                data.opcode = Opcode::SextInReg;
                                data.args.clear();
                                data.args.push(Operand::Reg(x));
                                data.args.push(Operand::Imm(trunc_bits as i64));
                            });
                        }
                    }

                    Some(self.dead_after_rewrite(ob, producer, inst))
                } else if opcode == Opcode::Anyext {
                    // skip the trunc, keeping whichever direction remains
                    let op = if dst_bits < x_ty.size_bits() {
                        Opcode::Trunc
                    } else {
                        Opcode::Anyext
                    };

                    ob.mutate(inst, |data| {
                        data.opcode = op;
                        data.args.clear();
                        data.args.push(Operand::Reg(x));
                    });

                    Some(self.dead_after_rewrite(ob, producer, inst))
                } else {
                    None
                }
            }

            _ => None,
        }
    }

    /// `trunc(ext y)` folds by the relation of the outer width to the width
    /// of `y`.
    fn combine_trunc(&self, ob: &mut ObservedBody<'_>, inst: Inst) -> Option<SmallVec<[Inst; 4]>> {
        let src = ob.body().inst(inst).arg_reg(0);
        let producer = self.producer(ob, src)?;
        let producer_op = ob.body().inst(producer).opcode();

        match producer_op {
            Opcode::ImplicitDef => {
                ob.mutate(inst, |data| {
                    data.opcode = Opcode::ImplicitDef;
                    data.args.clear();
                });

                Some(self.dead_after_rewrite(ob, producer, inst))
            }

            Opcode::Anyext | Opcode::Zext | Opcode::Sext => {
                let y = ob.body().inst(producer).arg_reg(0);
                let dst = ob.body().inst(inst).def(0);
                let dst_bits = ob.body().value_ty(dst)?.size_bits();
                let y_bits = ob.body().value_ty(y)?.size_bits();

                if dst_bits == y_bits {
                    let dst_vreg = dst.as_vreg()?;

                    ob.replace_all_uses(dst_vreg, y);

                    let mut dead = smallvec![inst];

                    if self.dies_with(ob, producer, inst) {
                        dead.push(producer);
                    }

                    Some(dead)
                } else {
                    // skip the extension, keeping whichever direction
                    // remains
                    let op = if dst_bits < y_bits {
                        Opcode::Trunc
                    } else {
                        producer_op
                    };

                    ob.mutate(inst, |data| {
                        data.opcode = op;
                        data.args.clear();
                        data.args.push(Operand::Reg(y));
                    });

                    Some(self.dead_after_rewrite(ob, producer, inst))
                }
            }

            _ => None,
        }
    }

    /// `unmerge(merge)` forwards each part, `unmerge(undef)` becomes one
    /// undef per part.
    fn combine_unmerge(
        &self,
        ob: &mut ObservedBody<'_>,
        inst: Inst,
    ) -> Option<SmallVec<[Inst; 4]>> {
        let src = ob.body().inst(inst).arg_reg(0);
        let producer = self.producer(ob, src)?;

        match ob.body().inst(producer).opcode() {
            Opcode::ImplicitDef => {
                let defs: SmallVec<[Reg; 4]> =
                    ob.body().inst(inst).defs().iter().copied().collect();

                ob.set_insertion_before(inst);

                for &def in &defs[1..] {
                    ob.build_into(Opcode::ImplicitDef, def, [], MathFlags::NONE);
                }

                ob.mutate(inst, |data| {
                    data.opcode = Opcode::ImplicitDef;
                    data.args.clear();
                    data.defs.truncate(1);
                });

                Some(self.dead_after_rewrite(ob, producer, inst))
            }

            Opcode::MergeValues => {
                let parts: SmallVec<[Reg; 4]> =
                    ob.body().inst(producer).reg_args().collect();
                let defs: SmallVec<[Reg; 4]> =
                    ob.body().inst(inst).defs().iter().copied().collect();

                if parts.len() != defs.len() {
                    return None;
                }

                for (&def, &part) in defs.iter().zip(parts.iter()) {
                    if ob.body().value_ty(def) != ob.body().value_ty(part) {
                        return None;
                    }
                }

                for (&def, &part) in defs.iter().zip(parts.iter()) {
                    ob.replace_all_uses(def.as_vreg()?, part);
                }

                let mut dead = smallvec![inst];

                if self.dies_with(ob, producer, inst) {
                    dead.push(producer);
                }

                Some(dead)
            }

            _ => None,
        }
    }

    /// `extract(insert)` forwards the inserted value on an exact overlap
    /// and looks through the insert when the ranges are disjoint.
    fn combine_extract(
        &self,
        ob: &mut ObservedBody<'_>,
        inst: Inst,
    ) -> Option<SmallVec<[Inst; 4]>> {
        let src = ob.body().inst(inst).arg_reg(0);
        let producer = self.producer(ob, src)?;

        if ob.body().inst(producer).opcode() == Opcode::ImplicitDef {
            ob.mutate(inst, |data| {
                data.opcode = Opcode::ImplicitDef;
                data.args.clear();
            });

            return Some(self.dead_after_rewrite(ob, producer, inst));
        }

        if ob.body().inst(producer).opcode() != Opcode::Insert {
            return None;
        }

        let ext_off = ob.body().inst(inst).arg_imm(1) as u32;
        let ins_off = ob.body().inst(producer).arg_imm(2) as u32;
        let base = ob.body().inst(producer).arg_reg(0);
        let value = ob.body().inst(producer).arg_reg(1);

        let dst = ob.body().inst(inst).def(0);
        let ext_bits = ob.body().value_ty(dst)?.size_bits();
        let val_bits = ob.body().value_ty(value)?.size_bits();

        if ext_off == ins_off && ob.body().value_ty(dst) == ob.body().value_ty(value) {
            ob.replace_all_uses(dst.as_vreg()?, value);

            let mut dead = smallvec![inst];

            if self.dies_with(ob, producer, inst) {
                dead.push(producer);
            }

            return Some(dead);
        }

        if ext_off + ext_bits <= ins_off || ins_off + val_bits <= ext_off {
            // the extract never sees the inserted bits
            ob.mutate(inst, |data| data.args[0] = Operand::Reg(base));

            return Some(self.dead_after_rewrite(ob, producer, inst));
        }

        None
    }

    /// After rewriting `user` away from `producer`, the producer may have
    /// lost its last use.
    fn dead_after_rewrite(
        &self,
        ob: &ObservedBody<'_>,
        producer: Inst,
        _user: Inst,
    ) -> SmallVec<[Inst; 4]> {
        let data = ob.body().inst(producer);

        if data.opcode().has_side_effects() || data.touches_pregs() {
            return SmallVec::new();
        }

        let unused = data.defs().iter().all(|&d| match d.as_vreg() {
            Some(v) => ob.body().use_count(v) == 0,
            None => false,
        });

        if unused {
            smallvec![producer]
        } else {
            SmallVec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mir::{
        Block, CallConv, FunctionBody, InstData, Llt, NoopObserver, Signature,
    };

    fn body_with_block() -> (FunctionBody, Block) {
        let mut f = FunctionBody::new("f", Signature::new(CallConv::C));
        let b0 = f.create_block();

        (f, b0)
    }

    fn opcodes(f: &FunctionBody, block: Block) -> Vec<Opcode> {
        f.block_insts(block)
            .iter()
            .map(|&i| f.inst(i).opcode())
            .collect()
    }

    #[test]
    fn anyext_of_trunc_to_same_width_forwards() {
        let (mut f, b0) = body_with_block();
        let s32 = Llt::scalar(32);
        let s16 = Llt::scalar(16);

        let x = Reg::from_vreg(f.create_vreg(s32));
        let narrow = Reg::from_vreg(f.create_vreg(s16));
        let wide = Reg::from_vreg(f.create_vreg(s32));
        let sum = Reg::from_vreg(f.create_vreg(s32));

        let trunc = f.insert_inst(
            InstData::new(Opcode::Trunc)
                .with_defs([narrow])
                .with_args([Operand::Reg(x)]),
            b0,
            0,
        );
        let ext = f.insert_inst(
            InstData::new(Opcode::Anyext)
                .with_defs([wide])
                .with_args([Operand::Reg(narrow)]),
            b0,
            1,
        );
        f.insert_inst(
            InstData::new(Opcode::Add)
                .with_defs([sum])
                .with_args([Operand::Reg(wide), Operand::Reg(wide)]),
            b0,
            2,
        );

        let mut observer = NoopObserver;
        let mut ob = ObservedBody::new(&mut f, &mut observer);
        let dead = ArtifactCombiner
            .try_combine(&mut ob, ext)
            .expect("should combine");

        assert_eq!(dead.as_slice(), [ext, trunc]);

        let add = f.block_insts(b0)[2];

        assert_eq!(f.inst(add).arg_reg(0), x);
        assert_eq!(f.inst(add).arg_reg(1), x);
    }

    #[test]
    fn zext_of_trunc_becomes_mask() {
        let (mut f, b0) = body_with_block();
        let s32 = Llt::scalar(32);
        let s8 = Llt::scalar(8);

        let x = Reg::from_vreg(f.create_vreg(s32));
        let narrow = Reg::from_vreg(f.create_vreg(s8));
        let wide = Reg::from_vreg(f.create_vreg(s32));

        f.insert_inst(
            InstData::new(Opcode::Trunc)
                .with_defs([narrow])
                .with_args([Operand::Reg(x)]),
            b0,
            0,
        );
        let ext = f.insert_inst(
            InstData::new(Opcode::Zext)
                .with_defs([wide])
                .with_args([Operand::Reg(narrow)]),
            b0,
            1,
        );

        let mut observer = NoopObserver;
        let mut ob = ObservedBody::new(&mut f, &mut observer);

        ArtifactCombiner
            .try_combine(&mut ob, ext)
            .expect("should combine");

        assert_eq!(f.inst(ext).opcode(), Opcode::And);
        assert_eq!(f.inst(ext).arg_reg(0), x);

        let mask_def = f.inst(ext).arg_reg(1).as_vreg().expect("vreg");
        let mask = f.def_of(mask_def).expect("defined");

        assert_eq!(f.inst(mask).opcode(), Opcode::Constant);
        assert_eq!(f.inst(mask).arg_imm(0), 0xff);
    }

    #[test]
    fn sext_of_trunc_becomes_sext_inreg() {
        let (mut f, b0) = body_with_block();
        let s64 = Llt::scalar(64);
        let s16 = Llt::scalar(16);

        let x = Reg::from_vreg(f.create_vreg(s64));
        let narrow = Reg::from_vreg(f.create_vreg(s16));
        let wide = Reg::from_vreg(f.create_vreg(s64));

        f.insert_inst(
            InstData::new(Opcode::Trunc)
                .with_defs([narrow])
                .with_args([Operand::Reg(x)]),
            b0,
            0,
        );
        let ext = f.insert_inst(
            InstData::new(Opcode::Sext)
                .with_defs([wide])
                .with_args([Operand::Reg(narrow)]),
            b0,
            1,
        );

        let mut observer = NoopObserver;
        let mut ob = ObservedBody::new(&mut f, &mut observer);

        ArtifactCombiner
            .try_combine(&mut ob, ext)
            .expect("should combine");

        assert_eq!(f.inst(ext).opcode(), Opcode::SextInReg);
        assert_eq!(f.inst(ext).arg_reg(0), x);
        assert_eq!(f.inst(ext).arg_imm(1), 16);
    }

    #[test]
    fn trunc_of_wider_ext_keeps_a_trunc() {
        let (mut f, b0) = body_with_block();
        let s64 = Llt::scalar(64);
        let s32 = Llt::scalar(32);
        let s16 = Llt::scalar(16);

        let y = Reg::from_vreg(f.create_vreg(s32));
        let wide = Reg::from_vreg(f.create_vreg(s64));
        let out = Reg::from_vreg(f.create_vreg(s16));

        f.insert_inst(
            InstData::new(Opcode::Zext)
                .with_defs([wide])
                .with_args([Operand::Reg(y)]),
            b0,
            0,
        );
        let trunc = f.insert_inst(
            InstData::new(Opcode::Trunc)
                .with_defs([out])
                .with_args([Operand::Reg(wide)]),
            b0,
            1,
        );

        let mut observer = NoopObserver;
        let mut ob = ObservedBody::new(&mut f, &mut observer);

        ArtifactCombiner
            .try_combine(&mut ob, trunc)
            .expect("should combine");

        assert_eq!(f.inst(trunc).opcode(), Opcode::Trunc);
        assert_eq!(f.inst(trunc).arg_reg(0), y);
    }

    #[test]
    fn unmerge_of_merge_forwards_parts() {
        let (mut f, b0) = body_with_block();
        let s64 = Llt::scalar(64);
        let s32 = Llt::scalar(32);

        let lo = Reg::from_vreg(f.create_vreg(s32));
        let hi = Reg::from_vreg(f.create_vreg(s32));
        let whole = Reg::from_vreg(f.create_vreg(s64));
        let a = Reg::from_vreg(f.create_vreg(s32));
        let b = Reg::from_vreg(f.create_vreg(s32));
        let sum = Reg::from_vreg(f.create_vreg(s32));

        let merge = f.insert_inst(
            InstData::new(Opcode::MergeValues)
                .with_defs([whole])
                .with_args([Operand::Reg(lo), Operand::Reg(hi)]),
            b0,
            0,
        );
        let unmerge = f.insert_inst(
            InstData::new(Opcode::UnmergeValues)
                .with_defs([a, b])
                .with_args([Operand::Reg(whole)]),
            b0,
            1,
        );
        f.insert_inst(
            InstData::new(Opcode::Add)
                .with_defs([sum])
                .with_args([Operand::Reg(a), Operand::Reg(b)]),
            b0,
            2,
        );

        let mut observer = NoopObserver;
        let mut ob = ObservedBody::new(&mut f, &mut observer);
        let dead = ArtifactCombiner
            .try_combine(&mut ob, unmerge)
            .expect("should combine");

        assert_eq!(dead.as_slice(), [unmerge, merge]);

        let add = f.block_insts(b0)[2];

        assert_eq!(f.inst(add).arg_reg(0), lo);
        assert_eq!(f.inst(add).arg_reg(1), hi);
    }

    #[test]
    fn unmerge_of_undef_becomes_undefs() {
        let (mut f, b0) = body_with_block();
        let s64 = Llt::scalar(64);
        let s32 = Llt::scalar(32);

        let whole = Reg::from_vreg(f.create_vreg(s64));
        let a = Reg::from_vreg(f.create_vreg(s32));
        let b = Reg::from_vreg(f.create_vreg(s32));

        f.insert_inst(
            InstData::new(Opcode::ImplicitDef).with_defs([whole]),
            b0,
            0,
        );
        let unmerge = f.insert_inst(
            InstData::new(Opcode::UnmergeValues)
                .with_defs([a, b])
                .with_args([Operand::Reg(whole)]),
            b0,
            1,
        );

        let mut observer = NoopObserver;
        let mut ob = ObservedBody::new(&mut f, &mut observer);

        ArtifactCombiner
            .try_combine(&mut ob, unmerge)
            .expect("should combine");

        assert_eq!(
            opcodes(&f, b0),
            [Opcode::ImplicitDef, Opcode::ImplicitDef, Opcode::ImplicitDef]
        );
        assert_eq!(f.inst(unmerge).defs(), [a]);

        let b_def = f.def_of(b.as_vreg().expect("vreg")).expect("defined");

        assert_eq!(f.inst(b_def).opcode(), Opcode::ImplicitDef);
    }

    #[test]
    fn extract_of_exact_insert_forwards_value() {
        let (mut f, b0) = body_with_block();
        let s64 = Llt::scalar(64);
        let s16 = Llt::scalar(16);

        let base = Reg::from_vreg(f.create_vreg(s64));
        let value = Reg::from_vreg(f.create_vreg(s16));
        let inserted = Reg::from_vreg(f.create_vreg(s64));
        let out = Reg::from_vreg(f.create_vreg(s16));
        let sum = Reg::from_vreg(f.create_vreg(s16));

        f.insert_inst(
            InstData::new(Opcode::Insert).with_defs([inserted]).with_args([
                Operand::Reg(base),
                Operand::Reg(value),
                Operand::Imm(16),
            ]),
            b0,
            0,
        );
        let extract = f.insert_inst(
            InstData::new(Opcode::Extract)
                .with_defs([out])
                .with_args([Operand::Reg(inserted), Operand::Imm(16)]),
            b0,
            1,
        );
        f.insert_inst(
            InstData::new(Opcode::Add)
                .with_defs([sum])
                .with_args([Operand::Reg(out), Operand::Reg(out)]),
            b0,
            2,
        );

        let mut observer = NoopObserver;
        let mut ob = ObservedBody::new(&mut f, &mut observer);
        let dead = ArtifactCombiner
            .try_combine(&mut ob, extract)
            .expect("should combine");

        assert_eq!(dead.len(), 2);

        let add = f.block_insts(b0)[2];

        assert_eq!(f.inst(add).arg_reg(0), value);
    }

    #[test]
    fn extract_disjoint_from_insert_reads_the_base() {
        let (mut f, b0) = body_with_block();
        let s64 = Llt::scalar(64);
        let s16 = Llt::scalar(16);

        let base = Reg::from_vreg(f.create_vreg(s64));
        let value = Reg::from_vreg(f.create_vreg(s16));
        let inserted = Reg::from_vreg(f.create_vreg(s64));
        let out = Reg::from_vreg(f.create_vreg(s16));

        f.insert_inst(
            InstData::new(Opcode::Insert).with_defs([inserted]).with_args([
                Operand::Reg(base),
                Operand::Reg(value),
                Operand::Imm(48),
            ]),
            b0,
            0,
        );
        let extract = f.insert_inst(
            InstData::new(Opcode::Extract)
                .with_defs([out])
                .with_args([Operand::Reg(inserted), Operand::Imm(0)]),
            b0,
            1,
        );

        let mut observer = NoopObserver;
        let mut ob = ObservedBody::new(&mut f, &mut observer);

        ArtifactCombiner
            .try_combine(&mut ob, extract)
            .expect("should combine");

        assert_eq!(f.inst(extract).opcode(), Opcode::Extract);
        assert_eq!(f.inst(extract).arg_reg(0), base);
    }

    #[test]
    fn unrelated_producer_does_not_combine() {
        let (mut f, b0) = body_with_block();
        let s32 = Llt::scalar(32);
        let s16 = Llt::scalar(16);

        let a = Reg::from_vreg(f.create_vreg(s32));
        let b = Reg::from_vreg(f.create_vreg(s32));
        let sum = Reg::from_vreg(f.create_vreg(s32));
        let out = Reg::from_vreg(f.create_vreg(s16));

        f.insert_inst(
            InstData::new(Opcode::Add)
                .with_defs([sum])
                .with_args([Operand::Reg(a), Operand::Reg(b)]),
            b0,
            0,
        );
        let trunc = f.insert_inst(
            InstData::new(Opcode::Trunc)
                .with_defs([out])
                .with_args([Operand::Reg(sum)]),
            b0,
            1,
        );

        let mut observer = NoopObserver;
        let mut ob = ObservedBody::new(&mut f, &mut observer);

        assert!(ArtifactCombiner.try_combine(&mut ob, trunc).is_none());
    }
}
