//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022-2023 Evan Cox <evanacox00@gmail.com>. All rights reserved. //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

use crate::arena::{ArenaKey, ArenaMap, SecondaryMap};
use crate::dense_arena_key;
use crate::mir::{Inst, InstData, Llt, Operand, PReg, Reg, VReg};
use crate::utility::PackedOption;
use smallvec::SmallVec;

#[cfg(feature = "enable-serde")]
use serde::{Deserialize, Serialize};

dense_arena_key! {
    /// A reference to a single basic block in a [`FunctionBody`].
    pub struct Block;

    /// A reference to a fixed stack object in a function's frame.
    pub struct FrameIdx;
}

/// The calling conventions a function or call site can use.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum CallConv {
    /// The platform's default C convention.
    C,
    /// A convention that permits guaranteed tail-call optimization.
    Fast,
    /// A convention for rarely-executed calls.
    Cold,
    /// A convention that preserves most registers at the call site.
    PreserveMost,
}

/// Attributes attached to a single parameter or return value in a
/// [`Signature`].
#[derive(Copy, Clone, Eq, PartialEq, Default, Debug)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct ArgAttributes {
    /// The value is zero-extended to fill its register.
    pub zext: bool,
    /// The value is sign-extended to fill its register.
    pub sext: bool,
    /// The argument is a by-value aggregate of the given byte size, passed
    /// through a hidden stack copy.
    pub byval: Option<u64>,
    /// The argument is forced into a register.
    pub inreg: bool,
    /// The argument is threaded through a dedicated error register.
    pub error_reg: bool,
    /// The part belongs to a block of parts that must land in consecutive
    /// registers.
    pub in_consecutive_regs: bool,
    /// The part is the last of its consecutive-register block.
    pub in_consecutive_regs_last: bool,
}

/// One parameter or return value in a [`Signature`].
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct AbiParam {
    /// The IR-level type of the value.
    pub ty: Llt,
    /// ABI attributes for the value.
    pub attrs: ArgAttributes,
}

impl AbiParam {
    /// Creates a parameter with no attributes.
    pub fn new(ty: Llt) -> Self {
        Self {
            ty,
            attrs: ArgAttributes::default(),
        }
    }
}

/// The ABI-visible signature of a function.
#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct Signature {
    /// The calling convention of the function.
    pub conv: CallConv,
    /// The parameters, in source order.
    pub params: Vec<AbiParam>,
    /// The return value, if the function returns one.
    pub ret: Option<AbiParam>,
    /// Whether the function takes a variable argument list.
    pub varargs: bool,
}

impl Signature {
    /// Creates a signature with no parameters and no return value.
    pub fn new(conv: CallConv) -> Self {
        Self {
            conv,
            params: Vec::default(),
            ret: None,
            varargs: false,
        }
    }

    /// Adds a parameter, builder style.
    pub fn with_param(mut self, param: AbiParam) -> Self {
        self.params.push(param);
        self
    }

    /// Sets the return value, builder style.
    pub fn with_ret(mut self, ret: AbiParam) -> Self {
        self.ret = Some(ret);
        self
    }
}

/// A single fixed object in the function's stack frame, addressed relative
/// to the incoming stack pointer.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct FixedStackObject {
    /// Size of the object in bytes.
    pub size: u64,
    /// Offset from the incoming stack pointer, in bytes.
    pub offset: i64,
    /// Whether the object is immutable for the duration of the function.
    pub immutable: bool,
}

/// Frame-layout facts that call lowering records about a function.
#[derive(Clone, Default, Debug)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct FrameInfo {
    objects: ArenaMap<FrameIdx, FixedStackObject>,
    bytes_in_stack_arg_area: u64,
    has_tail_call: bool,
}

impl FrameInfo {
    /// Creates a fixed object at `offset` from the incoming stack pointer.
    pub fn create_fixed_object(&mut self, size: u64, offset: i64, immutable: bool) -> FrameIdx {
        self.objects.insert(FixedStackObject {
            size,
            offset,
            immutable,
        })
    }

    /// Gets a previously created fixed object.
    pub fn object(&self, idx: FrameIdx) -> FixedStackObject {
        self.objects[idx]
    }

    /// The number of bytes of the caller's frame that this function's own
    /// stack arguments occupy.
    pub fn bytes_in_stack_arg_area(&self) -> u64 {
        self.bytes_in_stack_arg_area
    }

    /// Records the size of the incoming stack argument area.
    pub fn set_bytes_in_stack_arg_area(&mut self, bytes: u64) {
        self.bytes_in_stack_arg_area = bytes;
    }

    /// Whether any call in the function was lowered as a tail call.
    pub fn has_tail_call(&self) -> bool {
        self.has_tail_call
    }

    /// Records that a call was lowered as a tail call.
    pub fn set_has_tail_call(&mut self) {
        self.has_tail_call = true;
    }
}

#[derive(Clone, Default, Debug)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
struct BlockData {
    insts: Vec<Inst>,
}

/// A function being legalized: basic blocks, the instruction arena, the
/// virtual register table, and the ABI facts call lowering needs.
///
/// Reads go directly through this type. All mutation during legalization
/// goes through [`ObservedBody`](super::ObservedBody) so that the change
/// observer sees every creation, rewrite and erasure.
///
/// Erased instructions stay in the arena as tombstones with no parent
/// block, instruction keys are never reused within a function.
pub struct FunctionBody {
    name: String,
    sig: Signature,
    blocks: ArenaMap<Block, BlockData>,
    insts: ArenaMap<Inst, InstData>,
    parents: SecondaryMap<Inst, PackedOption<Block>>,
    vregs: ArenaMap<VReg, Llt>,
    defs: SecondaryMap<VReg, PackedOption<Inst>>,
    use_counts: SecondaryMap<VReg, u32>,
    live_ins: SmallVec<[PReg; 8]>,
    frame: FrameInfo,
}

impl FunctionBody {
    /// Creates an empty function with the given name and signature.
    pub fn new(name: impl Into<String>, sig: Signature) -> Self {
        Self {
            name: name.into(),
            sig,
            blocks: ArenaMap::default(),
            insts: ArenaMap::default(),
            parents: SecondaryMap::default(),
            vregs: ArenaMap::default(),
            defs: SecondaryMap::default(),
            use_counts: SecondaryMap::default(),
            live_ins: SmallVec::default(),
            frame: FrameInfo::default(),
        }
    }

    /// The name of the function.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The signature of the function.
    pub fn sig(&self) -> &Signature {
        &self.sig
    }

    /// The calling convention of the function.
    pub fn conv(&self) -> CallConv {
        self.sig.conv
    }

    /// Appends a new, empty basic block.
    pub fn create_block(&mut self) -> Block {
        self.blocks.insert(BlockData::default())
    }

    /// The entry block. The first block created is the entry.
    pub fn entry_block(&self) -> Block {
        debug_assert!(!self.blocks.is_empty());

        self.blocks.keys().next().expect("function has no blocks")
    }

    /// Iterates over every block in creation order.
    pub fn blocks(&self) -> impl Iterator<Item = Block> {
        self.blocks.keys()
    }

    /// The number of blocks in the function.
    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// The instructions of `block`, in program order.
    pub fn block_insts(&self, block: Block) -> &[Inst] {
        &self.blocks[block].insts
    }

    /// The payload of an instruction. Valid for tombstones too, their
    /// payload is whatever it was at erasure time.
    pub fn inst(&self, inst: Inst) -> &InstData {
        &self.insts[inst]
    }

    /// Checks whether the instruction is still attached to a block, i.e.
    /// has not been erased.
    pub fn is_attached(&self, inst: Inst) -> bool {
        self.parents[inst].is_some()
    }

    /// The block an instruction lives in, or `None` for tombstones.
    pub fn parent(&self, inst: Inst) -> Option<Block> {
        self.parents[inst].expand()
    }

    /// The position of `inst` within its block.
    pub fn position_in_block(&self, inst: Inst) -> Option<usize> {
        let block = self.parent(inst)?;

        self.blocks[block].insts.iter().position(|&i| i == inst)
    }

    /// Creates a fresh virtual register of type `ty`.
    pub fn create_vreg(&mut self, ty: Llt) -> VReg {
        self.vregs.insert(ty)
    }

    /// The type of a virtual register.
    pub fn vreg_ty(&self, vreg: VReg) -> Llt {
        self.vregs[vreg]
    }

    /// The type of a register, if it is virtual. Physical registers carry
    /// no type.
    pub fn value_ty(&self, reg: Reg) -> Option<Llt> {
        reg.as_vreg().map(|v| self.vregs[v])
    }

    /// The instruction that defines `vreg`, if any.
    pub fn def_of(&self, vreg: VReg) -> Option<Inst> {
        self.defs[vreg].expand()
    }

    /// The number of instruction operands that read `vreg`.
    pub fn use_count(&self, vreg: VReg) -> u32 {
        self.use_counts[vreg]
    }

    /// The physical registers live into the entry block.
    pub fn live_ins(&self) -> &[PReg] {
        &self.live_ins
    }

    /// Marks a physical register as live into the entry block.
    pub fn add_live_in(&mut self, preg: PReg) {
        if !self.live_ins.contains(&preg) {
            self.live_ins.push(preg);
        }
    }

    /// The frame-layout facts recorded so far.
    pub fn frame(&self) -> &FrameInfo {
        &self.frame
    }

    /// Mutable access to the frame-layout facts.
    pub fn frame_mut(&mut self) -> &mut FrameInfo {
        &mut self.frame
    }

    /// The successor blocks of `block`, read off its terminator.
    pub fn block_successors(&self, block: Block) -> SmallVec<[Block; 2]> {
        let mut succs = SmallVec::new();

        if let Some(&term) = self.blocks[block].insts.last() {
            let data = &self.insts[term];

            if data.opcode().is_terminator() {
                for arg in data.args() {
                    if let Operand::Block(b) = arg {
                        if !succs.contains(b) {
                            succs.push(*b);
                        }
                    }
                }
            }
        }

        succs
    }

    /// Computes a reverse post-order over the blocks reachable from the
    /// entry.
    pub fn rpo(&self) -> Vec<Block> {
        let mut postorder = Vec::with_capacity(self.blocks.len());
        let mut visited = smallbitvec::sbvec![false; self.blocks.len()];
        let mut stack: Vec<(Block, usize)> = Vec::new();

        if self.blocks.is_empty() {
            return postorder;
        }

        let entry = self.entry_block();

        visited.set(entry.key_index(), true);
        stack.push((entry, 0));

        while let Some((block, next)) = stack.pop() {
            let succs = self.block_successors(block);

            if next < succs.len() {
                stack.push((block, next + 1));

                let succ = succs[next];

                if !visited[succ.key_index()] {
                    visited.set(succ.key_index(), true);
                    stack.push((succ, 0));
                }
            } else {
                postorder.push(block);
            }
        }

        postorder.reverse();
        postorder
    }

    pub(crate) fn insert_inst(&mut self, data: InstData, block: Block, index: usize) -> Inst {
        let inst = self.insts.insert(data);

        self.parents.insert(inst, PackedOption::some(block));
        self.blocks[block].insts.insert(index, inst);
        self.attach_counts(inst);

        inst
    }

    pub(crate) fn unlink_inst(&mut self, inst: Inst) {
        debug_assert!(self.is_attached(inst), "erasing a tombstone");

        self.detach_counts(inst);

        let block = self.parents[inst].expand().expect("instruction has no parent");
        let pos = self.blocks[block]
            .insts
            .iter()
            .position(|&i| i == inst)
            .expect("instruction not in its parent block");

        self.blocks[block].insts.remove(pos);
        self.parents.insert(inst, PackedOption::none());
    }

    pub(crate) fn rewrite_inst(&mut self, inst: Inst, f: impl FnOnce(&mut InstData)) {
        self.detach_counts(inst);
        f(&mut self.insts[inst]);
        self.attach_counts(inst);
    }

    fn attach_counts(&mut self, inst: Inst) {
        let uses: SmallVec<[VReg; 4]> = self.insts[inst]
            .reg_args()
            .filter_map(|r| r.as_vreg())
            .collect();
        let defs: SmallVec<[VReg; 2]> = self.insts[inst]
            .defs()
            .iter()
            .filter_map(|r| r.as_vreg())
            .collect();

        for v in uses {
            self.use_counts[v] += 1;
        }

        for v in defs {
            self.defs.insert(v, PackedOption::some(inst));
        }
    }

    fn detach_counts(&mut self, inst: Inst) {
        let uses: SmallVec<[VReg; 4]> = self.insts[inst]
            .reg_args()
            .filter_map(|r| r.as_vreg())
            .collect();
        let defs: SmallVec<[VReg; 2]> = self.insts[inst]
            .defs()
            .iter()
            .filter_map(|r| r.as_vreg())
            .collect();

        for v in uses {
            debug_assert!(self.use_counts[v] > 0);

            self.use_counts[v] -= 1;
        }

        for v in defs {
            if self.defs[v].expand() == Some(inst) {
                self.defs.insert(v, PackedOption::none());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mir::Opcode;

    fn body() -> FunctionBody {
        FunctionBody::new("f", Signature::new(CallConv::C))
    }

    #[test]
    fn blocks_and_entry() {
        let mut f = body();
        let b0 = f.create_block();
        let b1 = f.create_block();

        assert_eq!(f.entry_block(), b0);
        assert_eq!(f.num_blocks(), 2);
        assert_eq!(f.blocks().collect::<Vec<_>>(), [b0, b1]);
    }

    #[test]
    fn insert_tracks_defs_and_uses() {
        let mut f = body();
        let b0 = f.create_block();
        let s32 = Llt::scalar(32);

        let a = f.create_vreg(s32);
        let d = f.create_vreg(s32);

        let add = f.insert_inst(
            InstData::new(Opcode::Add)
                .with_defs([Reg::from_vreg(d)])
                .with_args([
                    Operand::Reg(Reg::from_vreg(a)),
                    Operand::Reg(Reg::from_vreg(a)),
                ]),
            b0,
            0,
        );

        assert_eq!(f.def_of(d), Some(add));
        assert_eq!(f.use_count(a), 2);
        assert_eq!(f.use_count(d), 0);
        assert_eq!(f.parent(add), Some(b0));
    }

    #[test]
    fn unlink_leaves_tombstone() {
        let mut f = body();
        let b0 = f.create_block();
        let s32 = Llt::scalar(32);

        let a = f.create_vreg(s32);
        let d = f.create_vreg(s32);

        let neg = f.insert_inst(
            InstData::new(Opcode::Neg)
                .with_defs([Reg::from_vreg(d)])
                .with_args([Operand::Reg(Reg::from_vreg(a))]),
            b0,
            0,
        );

        f.unlink_inst(neg);

        assert!(!f.is_attached(neg));
        assert_eq!(f.parent(neg), None);
        assert_eq!(f.def_of(d), None);
        assert_eq!(f.use_count(a), 0);
        assert!(f.block_insts(b0).is_empty());
        // payload is still readable
        assert_eq!(f.inst(neg).opcode(), Opcode::Neg);
    }

    #[test]
    fn rewrite_fixes_counts() {
        let mut f = body();
        let b0 = f.create_block();
        let s32 = Llt::scalar(32);

        let a = f.create_vreg(s32);
        let b = f.create_vreg(s32);
        let d = f.create_vreg(s32);

        let inst = f.insert_inst(
            InstData::new(Opcode::Neg)
                .with_defs([Reg::from_vreg(d)])
                .with_args([Operand::Reg(Reg::from_vreg(a))]),
            b0,
            0,
        );

        f.rewrite_inst(inst, |data| {
            data.args[0] = Operand::Reg(Reg::from_vreg(b));
        });

        assert_eq!(f.use_count(a), 0);
        assert_eq!(f.use_count(b), 1);
        assert_eq!(f.def_of(d), Some(inst));
    }

    #[test]
    fn successors_and_rpo() {
        let mut f = body();
        let b0 = f.create_block();
        let b1 = f.create_block();
        let b2 = f.create_block();
        let s1 = Llt::scalar(1);
        let c = f.create_vreg(s1);

        f.insert_inst(
            InstData::new(Opcode::BrCond).with_args([
                Operand::Reg(Reg::from_vreg(c)),
                Operand::Block(b1),
                Operand::Block(b2),
            ]),
            b0,
            0,
        );
        f.insert_inst(InstData::new(Opcode::Br).with_args([Operand::Block(b2)]), b1, 0);
        f.insert_inst(InstData::new(Opcode::Unreachable), b2, 0);

        assert_eq!(f.block_successors(b0).as_slice(), [b1, b2]);

        let rpo = f.rpo();

        assert_eq!(rpo[0], b0);
        assert_eq!(rpo.len(), 3);
        assert!(rpo.iter().position(|&b| b == b1) < rpo.iter().position(|&b| b == b2));
    }

    #[test]
    fn frame_objects() {
        let mut f = body();
        let idx = f.frame_mut().create_fixed_object(8, 16, true);
        let obj = f.frame().object(idx);

        assert_eq!(obj.size, 8);
        assert_eq!(obj.offset, 16);
        assert!(obj.immutable);
        assert!(!f.frame().has_tail_call());
    }
}
