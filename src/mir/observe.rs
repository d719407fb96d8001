//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022-2023 Evan Cox <evanacox00@gmail.com>. All rights reserved. //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

use crate::mir::{
    Block, CondCode, FrameIdx, FunctionBody, Inst, InstData, Llt, MathFlags, Opcode, Operand, Reg,
    VReg,
};
use crate::utility::SaHashMap;
use smallvec::SmallVec;

/// Receives a callback for every IR change made through an
/// [`ObservedBody`].
///
/// The driver's worklist tracker implements this so that newly created and
/// rewritten instructions are re-enqueued and erased ones are dropped from
/// its queues, no matter how deep inside a rewrite the change happened.
pub trait ChangeObserver {
    /// A new instruction was inserted.
    fn created_inst(&mut self, body: &FunctionBody, inst: Inst);

    /// An instruction is about to be rewritten in place. Fires before the
    /// payload changes.
    fn changing_inst(&mut self, body: &FunctionBody, inst: Inst);

    /// An in-place rewrite finished. Fires after the payload changed.
    fn changed_inst(&mut self, body: &FunctionBody, inst: Inst);

    /// An instruction is about to be erased. Fires while its operands are
    /// still readable.
    fn erasing_inst(&mut self, body: &FunctionBody, inst: Inst);
}

/// An observer that ignores every change. Used when building a function
/// before any legalization runs.
pub struct NoopObserver;

impl ChangeObserver for NoopObserver {
    fn created_inst(&mut self, _: &FunctionBody, _: Inst) {}

    fn changing_inst(&mut self, _: &FunctionBody, _: Inst) {}

    fn changed_inst(&mut self, _: &FunctionBody, _: Inst) {}

    fn erasing_inst(&mut self, _: &FunctionBody, _: Inst) {}
}

/// Pairs a function body with the single active [`ChangeObserver`] for the
/// scope of a transformation.
///
/// Every creation, in-place rewrite, erasure and use-replacement flows
/// through this type, so the observer cannot be bypassed while one is
/// installed. Dropping the wrapper uninstalls the observer, there is never
/// more than one active at a time and it cannot outlive the pass that
/// installed it.
///
/// New instructions go to the insertion point, which advances past each
/// inserted instruction so a sequence of `build_*` calls appears in program
/// order.
pub struct ObservedBody<'a> {
    body: &'a mut FunctionBody,
    observer: &'a mut dyn ChangeObserver,
    point: Option<(Block, usize)>,
    consts: Option<SaHashMap<(Block, Llt, i64), Reg>>,
}

impl<'a> ObservedBody<'a> {
    /// Installs `observer` over `body`.
    pub fn new(body: &'a mut FunctionBody, observer: &'a mut dyn ChangeObserver) -> Self {
        Self {
            body,
            observer,
            point: None,
            consts: None,
        }
    }

    /// Enables constant deduplication: repeated requests for the same
    /// integer constant in the same block reuse one materialization.
    pub fn enable_constant_cache(&mut self) {
        if self.consts.is_none() {
            self.consts = Some(SaHashMap::default());
        }
    }

    /// Read access to the underlying function.
    pub fn body(&self) -> &FunctionBody {
        self.body
    }

    /// Creates a fresh virtual register of type `ty`.
    pub fn create_vreg(&mut self, ty: Llt) -> Reg {
        Reg::from_vreg(self.body.create_vreg(ty))
    }

    /// Appends a new, empty basic block.
    pub fn create_block(&mut self) -> Block {
        self.body.create_block()
    }

    /// Mutable access to the frame-layout facts. Frame bookkeeping is not
    /// an IR change, so it bypasses the observer.
    pub fn frame_mut(&mut self) -> &mut crate::mir::FrameInfo {
        self.body.frame_mut()
    }

    /// Marks a physical register as live into the entry block.
    pub fn add_live_in(&mut self, preg: crate::mir::PReg) {
        self.body.add_live_in(preg);
    }

    /// Places the insertion point at `index` within `block`.
    pub fn set_insertion_point(&mut self, block: Block, index: usize) {
        debug_assert!(index <= self.body.block_insts(block).len());

        self.point = Some((block, index));
    }

    /// Places the insertion point immediately before `inst`.
    pub fn set_insertion_before(&mut self, inst: Inst) {
        let block = self.body.parent(inst).expect("instruction was erased");
        let index = self.body.position_in_block(inst).expect("instruction was erased");

        self.point = Some((block, index));
    }

    /// Places the insertion point immediately after `inst`.
    pub fn set_insertion_after(&mut self, inst: Inst) {
        let block = self.body.parent(inst).expect("instruction was erased");
        let index = self.body.position_in_block(inst).expect("instruction was erased");

        self.point = Some((block, index + 1));
    }

    /// Places the insertion point at the end of `block`.
    pub fn set_insertion_at_end(&mut self, block: Block) {
        self.point = Some((block, self.body.block_insts(block).len()));
    }

    /// The current insertion point.
    pub fn insertion_point(&self) -> (Block, usize) {
        self.point.expect("no insertion point set")
    }

    /// Inserts `data` at the insertion point and notifies the observer.
    pub fn insert(&mut self, data: InstData) -> Inst {
        let (block, index) = self.point.expect("no insertion point set");
        let inst = self.body.insert_inst(data, block, index);

        self.point = Some((block, index + 1));
        self.observer.created_inst(self.body, inst);

        inst
    }

    /// Rewrites `inst` in place, bracketing the change with observer
    /// callbacks.
    pub fn mutate(&mut self, inst: Inst, f: impl FnOnce(&mut InstData)) {
        self.observer.changing_inst(self.body, inst);
        self.body.rewrite_inst(inst, f);
        self.observer.changed_inst(self.body, inst);
    }

    /// Erases `inst`, leaving a tombstone. The observer is notified while
    /// the operands are still readable.
    pub fn erase(&mut self, inst: Inst) {
        self.observer.erasing_inst(self.body, inst);

        // keep the insertion point stable when erasing above it
        if let (Some((pblock, pindex)), Some(block), Some(index)) = (
            self.point,
            self.body.parent(inst),
            self.body.position_in_block(inst),
        ) {
            if pblock == block && index < pindex {
                self.point = Some((pblock, pindex - 1));
            }
        }

        self.body.unlink_inst(inst);
    }

    /// Rewrites every use of `from` to read `to` instead. The definition of
    /// `from` is left alone.
    pub fn replace_all_uses(&mut self, from: VReg, to: Reg) {
        let mut users = Vec::new();

        for block in self.body.blocks().collect::<Vec<_>>() {
            for &inst in self.body.block_insts(block) {
                let reads_from = self
                    .body
                    .inst(inst)
                    .reg_args()
                    .any(|r| r.as_vreg() == Some(from));

                if reads_from {
                    users.push(inst);
                }
            }
        }

        for inst in users {
            self.mutate(inst, |data| {
                for arg in data.args.iter_mut() {
                    if let Operand::Reg(r) = arg {
                        if r.as_vreg() == Some(from) {
                            *arg = Operand::Reg(to);
                        }
                    }
                }
            });
        }
    }

    fn build(&mut self, data: InstData) -> (Reg, Inst) {
        let def = data.def(0);
        let inst = self.insert(data);

        (def, inst)
    }

    /// Inserts an instruction that defines the *existing* register `dst`.
    ///
    /// This is how a rewrite hands the original result register over to the
    /// final instruction of a replacement sequence.
    pub fn build_into(
        &mut self,
        opcode: Opcode,
        dst: Reg,
        args: impl IntoIterator<Item = Operand>,
        flags: MathFlags,
    ) -> Inst {
        self.insert(
            InstData::new(opcode)
                .with_defs([dst])
                .with_args(args)
                .with_flags(flags),
        )
    }

    /// Builds a copy of `src` into a fresh register of type `ty`.
    pub fn build_copy(&mut self, ty: Llt, src: Reg) -> Reg {
        let dst = self.create_vreg(ty);

        self.build(
            InstData::new(Opcode::Copy)
                .with_defs([dst])
                .with_args([Operand::Reg(src)]),
        )
        .0
    }

    /// Builds a copy into an existing register, typically a physical one.
    pub fn build_copy_to(&mut self, dst: Reg, src: Reg) -> Inst {
        self.insert(
            InstData::new(Opcode::Copy)
                .with_defs([dst])
                .with_args([Operand::Reg(src)]),
        )
    }

    /// Builds an undefined value of type `ty`.
    pub fn build_undef(&mut self, ty: Llt) -> Reg {
        let dst = self.create_vreg(ty);

        self.build(InstData::new(Opcode::ImplicitDef).with_defs([dst])).0
    }

    /// Materializes the integer constant `value` at type `ty`.
    ///
    /// With the constant cache enabled this reuses an earlier
    /// materialization of the same constant in the same block when it is
    /// still attached above the insertion point.
    pub fn build_constant(&mut self, ty: Llt, value: i64) -> Reg {
        let (block, index) = self.point.expect("no insertion point set");

        if let Some(cache) = self.consts.as_ref() {
            if let Some(&reg) = cache.get(&(block, ty, value)) {
                let still_valid = reg
                    .as_vreg()
                    .and_then(|v| self.body.def_of(v))
                    .and_then(|def| {
                        let pos = self.body.position_in_block(def)?;

                        Some(self.body.parent(def) == Some(block) && pos < index)
                    })
                    .unwrap_or(false);

                if still_valid {
                    return reg;
                }
            }
        }

        let dst = self.create_vreg(ty);
        let (reg, _) = self.build(
            InstData::new(Opcode::Constant)
                .with_defs([dst])
                .with_args([Operand::Imm(value)]),
        );

        if let Some(cache) = self.consts.as_mut() {
            cache.insert((block, ty, value), reg);
        }

        reg
    }

    /// Materializes a floating-point constant from raw `bits` at type `ty`.
    pub fn build_fconstant(&mut self, ty: Llt, bits: u64) -> Reg {
        let dst = self.create_vreg(ty);

        self.build(
            InstData::new(Opcode::FConstant)
                .with_defs([dst])
                .with_args([Operand::Bits(bits)]),
        )
        .0
    }

    /// Builds a cast (`Trunc`, the extensions, or the pointer casts) of
    /// `src` to type `ty`.
    pub fn build_cast(&mut self, opcode: Opcode, ty: Llt, src: Reg) -> Reg {
        debug_assert!(matches!(
            opcode,
            Opcode::Trunc
                | Opcode::Sext
                | Opcode::Zext
                | Opcode::Anyext
                | Opcode::PtrToInt
                | Opcode::IntToPtr
        ));

        let dst = self.create_vreg(ty);

        self.build(
            InstData::new(opcode)
                .with_defs([dst])
                .with_args([Operand::Reg(src)]),
        )
        .0
    }

    /// Builds a two-operand instruction producing a fresh register of type
    /// `ty`.
    pub fn build_binop(
        &mut self,
        opcode: Opcode,
        ty: Llt,
        lhs: Reg,
        rhs: Reg,
        flags: MathFlags,
    ) -> Reg {
        let dst = self.create_vreg(ty);

        self.build(
            InstData::new(opcode)
                .with_defs([dst])
                .with_args([Operand::Reg(lhs), Operand::Reg(rhs)])
                .with_flags(flags),
        )
        .0
    }

    /// Builds a one-operand instruction producing a fresh register of type
    /// `ty`. The bit-counting operations take their result type here, which
    /// may differ from the source type.
    pub fn build_unop(&mut self, opcode: Opcode, ty: Llt, src: Reg, flags: MathFlags) -> Reg {
        let dst = self.create_vreg(ty);

        self.build(
            InstData::new(opcode)
                .with_defs([dst])
                .with_args([Operand::Reg(src)])
                .with_flags(flags),
        )
        .0
    }

    /// Builds an integer comparison. `ty` is the result type, `s1` or a
    /// vector of `s1`.
    pub fn build_icmp(&mut self, cond: CondCode, ty: Llt, lhs: Reg, rhs: Reg) -> Reg {
        let dst = self.create_vreg(ty);

        self.build(
            InstData::new(Opcode::Icmp)
                .with_defs([dst])
                .with_args([Operand::Cond(cond), Operand::Reg(lhs), Operand::Reg(rhs)]),
        )
        .0
    }

    /// Builds a select between `if_true` and `if_false` on `cond`.
    pub fn build_select(&mut self, ty: Llt, cond: Reg, if_true: Reg, if_false: Reg) -> Reg {
        let dst = self.create_vreg(ty);

        self.build(
            InstData::new(Opcode::Select).with_defs([dst]).with_args([
                Operand::Reg(cond),
                Operand::Reg(if_true),
                Operand::Reg(if_false),
            ]),
        )
        .0
    }

    /// Builds a `SextInReg` of the low `bits` bits of `src`.
    pub fn build_sext_inreg(&mut self, ty: Llt, src: Reg, bits: u32) -> Reg {
        let dst = self.create_vreg(ty);

        self.build(
            InstData::new(Opcode::SextInReg)
                .with_defs([dst])
                .with_args([Operand::Reg(src), Operand::Imm(bits as i64)]),
        )
        .0
    }

    /// Merges same-sized scalar `parts` into one wide scalar of type `ty`.
    pub fn build_merge(&mut self, ty: Llt, parts: impl IntoIterator<Item = Reg>) -> Reg {
        let dst = self.create_vreg(ty);

        self.build(
            InstData::new(Opcode::MergeValues)
                .with_defs([dst])
                .with_args(parts.into_iter().map(Operand::Reg)),
        )
        .0
    }

    /// Splits `src` into `n` results of type `part_ty`.
    pub fn build_unmerge(&mut self, part_ty: Llt, n: usize, src: Reg) -> SmallVec<[Reg; 4]> {
        let defs: SmallVec<[Reg; 4]> = (0..n).map(|_| self.create_vreg(part_ty)).collect();

        self.insert(
            InstData::new(Opcode::UnmergeValues)
                .with_defs(defs.iter().copied())
                .with_args([Operand::Reg(src)]),
        );

        defs
    }

    /// Concatenates vector `parts` into one vector of type `ty`.
    pub fn build_concat(&mut self, ty: Llt, parts: impl IntoIterator<Item = Reg>) -> Reg {
        let dst = self.create_vreg(ty);

        self.build(
            InstData::new(Opcode::ConcatVectors)
                .with_defs([dst])
                .with_args(parts.into_iter().map(Operand::Reg)),
        )
        .0
    }

    /// Builds a vector of type `ty` out of scalar `lanes`.
    pub fn build_build_vector(&mut self, ty: Llt, lanes: impl IntoIterator<Item = Reg>) -> Reg {
        let dst = self.create_vreg(ty);

        self.build(
            InstData::new(Opcode::BuildVector)
                .with_defs([dst])
                .with_args(lanes.into_iter().map(Operand::Reg)),
        )
        .0
    }

    /// Extracts a value of type `ty` from `src` at bit offset `offset`.
    pub fn build_extract(&mut self, ty: Llt, src: Reg, offset: u32) -> Reg {
        let dst = self.create_vreg(ty);

        self.build(
            InstData::new(Opcode::Extract)
                .with_defs([dst])
                .with_args([Operand::Reg(src), Operand::Imm(offset as i64)]),
        )
        .0
    }

    /// Inserts `value` into `base` at bit offset `offset`, producing a fresh
    /// register of type `ty`.
    pub fn build_insert(&mut self, ty: Llt, base: Reg, value: Reg, offset: u32) -> Reg {
        let dst = self.create_vreg(ty);

        self.build(
            InstData::new(Opcode::Insert).with_defs([dst]).with_args([
                Operand::Reg(base),
                Operand::Reg(value),
                Operand::Imm(offset as i64),
            ]),
        )
        .0
    }

    /// Materializes the address of fixed stack object `idx` as a pointer of
    /// type `ty`.
    pub fn build_frame_index(&mut self, ty: Llt, idx: FrameIdx) -> Reg {
        let dst = self.create_vreg(ty);

        self.build(
            InstData::new(Opcode::FrameIndex)
                .with_defs([dst])
                .with_args([Operand::Frame(idx)]),
        )
        .0
    }

    /// Builds a pointer offset by a register amount.
    pub fn build_ptr_add(&mut self, ty: Llt, base: Reg, offset: Reg) -> Reg {
        let dst = self.create_vreg(ty);

        self.build(
            InstData::new(Opcode::PtrAdd)
                .with_defs([dst])
                .with_args([Operand::Reg(base), Operand::Reg(offset)]),
        )
        .0
    }

    /// Builds a load of type `ty` from `addr`.
    pub fn build_load(&mut self, ty: Llt, addr: Reg) -> Reg {
        let dst = self.create_vreg(ty);

        self.build(
            InstData::new(Opcode::Load)
                .with_defs([dst])
                .with_args([Operand::Reg(addr)]),
        )
        .0
    }

    /// Builds a store of `value` to `addr`.
    pub fn build_store(&mut self, value: Reg, addr: Reg) -> Inst {
        self.insert(
            InstData::new(Opcode::Store)
                .with_args([Operand::Reg(value), Operand::Reg(addr)]),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mir::{CallConv, Signature};

    #[derive(Default)]
    struct Recorder {
        created: Vec<Inst>,
        changed: Vec<Inst>,
        erased: Vec<Inst>,
    }

    impl ChangeObserver for Recorder {
        fn created_inst(&mut self, _: &FunctionBody, inst: Inst) {
            self.created.push(inst);
        }

        fn changing_inst(&mut self, _: &FunctionBody, _: Inst) {}

        fn changed_inst(&mut self, _: &FunctionBody, inst: Inst) {
            self.changed.push(inst);
        }

        fn erasing_inst(&mut self, _: &FunctionBody, inst: Inst) {
            self.erased.push(inst);
        }
    }

    fn body() -> FunctionBody {
        FunctionBody::new("f", Signature::new(CallConv::C))
    }

    #[test]
    fn insertions_appear_in_program_order() {
        let mut f = body();
        let b0 = f.create_block();
        let mut obs = Recorder::default();
        let mut ob = ObservedBody::new(&mut f, &mut obs);
        let s32 = Llt::scalar(32);

        ob.set_insertion_at_end(b0);

        let a = ob.build_constant(s32, 1);
        let b = ob.build_constant(s32, 2);
        let c = ob.build_binop(Opcode::Add, s32, a, b, MathFlags::NONE);

        let insts = f.block_insts(b0).to_vec();

        assert_eq!(insts.len(), 3);
        assert_eq!(obs.created, insts);
        assert_eq!(f.inst(insts[2]).opcode(), Opcode::Add);
        assert_eq!(f.inst(insts[2]).def(0), c);
        assert_eq!(f.use_count(a.as_vreg().unwrap()), 1);
    }

    #[test]
    fn observer_sees_mutation_and_erasure() {
        let mut f = body();
        let b0 = f.create_block();
        let mut obs = Recorder::default();
        let mut ob = ObservedBody::new(&mut f, &mut obs);
        let s32 = Llt::scalar(32);

        ob.set_insertion_at_end(b0);

        let a = ob.build_constant(s32, 5);
        let neg = ob.build_unop(Opcode::Neg, s32, a, MathFlags::NONE);
        let neg_inst = ob.body().def_of(neg.as_vreg().unwrap()).unwrap();

        ob.mutate(neg_inst, |data| data.opcode = Opcode::Ctpop);
        ob.erase(neg_inst);

        assert_eq!(obs.changed, [neg_inst]);
        assert_eq!(obs.erased, [neg_inst]);
        assert!(!f.is_attached(neg_inst));
        assert_eq!(f.use_count(a.as_vreg().unwrap()), 0);
    }

    #[test]
    fn replace_all_uses_rewrites_readers_only() {
        let mut f = body();
        let b0 = f.create_block();
        let mut obs = NoopObserver;
        let mut ob = ObservedBody::new(&mut f, &mut obs);
        let s32 = Llt::scalar(32);

        ob.set_insertion_at_end(b0);

        let old = ob.build_constant(s32, 1);
        let new = ob.build_constant(s32, 2);
        let sum = ob.build_binop(Opcode::Add, s32, old, old, MathFlags::NONE);

        ob.replace_all_uses(old.as_vreg().unwrap(), new);

        let sum_inst = f.def_of(sum.as_vreg().unwrap()).unwrap();
        let args: Vec<_> = f.inst(sum_inst).reg_args().collect();

        assert_eq!(args, [new, new]);
        assert_eq!(f.use_count(old.as_vreg().unwrap()), 0);
        assert_eq!(f.use_count(new.as_vreg().unwrap()), 2);
        // the definition of `old` is untouched
        assert!(f.def_of(old.as_vreg().unwrap()).is_some());
    }

    #[test]
    fn constant_cache_reuses_in_block() {
        let mut f = body();
        let b0 = f.create_block();
        let mut obs = NoopObserver;
        let mut ob = ObservedBody::new(&mut f, &mut obs);
        let s32 = Llt::scalar(32);

        ob.enable_constant_cache();
        ob.set_insertion_at_end(b0);

        let a = ob.build_constant(s32, 42);
        let b = ob.build_constant(s32, 42);
        let c = ob.build_constant(s32, 43);

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(f.block_insts(b0).len(), 2);
    }

    #[test]
    fn constant_cache_ignores_erased_entries() {
        let mut f = body();
        let b0 = f.create_block();
        let mut obs = NoopObserver;
        let mut ob = ObservedBody::new(&mut f, &mut obs);
        let s32 = Llt::scalar(32);

        ob.enable_constant_cache();
        ob.set_insertion_at_end(b0);

        let a = ob.build_constant(s32, 42);
        let def = ob.body().def_of(a.as_vreg().unwrap()).unwrap();

        ob.erase(def);

        let b = ob.build_constant(s32, 42);

        assert_ne!(a, b);
        assert_eq!(f.block_insts(b0).len(), 1);
    }

    #[test]
    fn erase_above_keeps_insertion_point_stable() {
        let mut f = body();
        let b0 = f.create_block();
        let mut obs = NoopObserver;
        let mut ob = ObservedBody::new(&mut f, &mut obs);
        let s32 = Llt::scalar(32);

        ob.set_insertion_at_end(b0);

        let a = ob.build_constant(s32, 1);
        let _b = ob.build_constant(s32, 2);
        let a_def = ob.body().def_of(a.as_vreg().unwrap()).unwrap();

        ob.erase(a_def);

        // still appends at the end rather than in the middle
        let c = ob.build_constant(s32, 3);
        let c_def = f.def_of(c.as_vreg().unwrap()).unwrap();

        assert_eq!(*f.block_insts(b0).last().unwrap(), c_def);
    }
}
