//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022-2023 Evan Cox <evanacox00@gmail.com>. All rights reserved. //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

use crate::calls::{ArgDescriptor, AssignRecord, CcState, ConvAssigner, ExtKind, Loc};
use crate::mir::{Llt, MathFlags, ObservedBody, Opcode, Operand, PReg, Reg};
use smallvec::SmallVec;

/// Widens `value` to `loc_ty` per the assignment's extension mode. Returns
/// the value unchanged when the location already matches.
pub fn extend_register(ob: &mut ObservedBody<'_>, value: Reg, loc_ty: Llt, ext: ExtKind) -> Reg {
    match ob.body().value_ty(value) {
        Some(ty) if ty != loc_ty => {
            let opcode = match ext {
                ExtKind::Zero => Opcode::Zext,
                ExtKind::Sign => Opcode::Sext,
                ExtKind::Any | ExtKind::None => Opcode::Anyext,
            };

            ob.build_cast(opcode, loc_ty, value)
        }
        _ => value,
    }
}

/// One direction of value marshalling at a call boundary.
///
/// The three implementations share this contract and the assignment walk in
/// [`handle_assignments`], differing only in which side of the boundary
/// they materialize.
pub trait ValueHandler {
    /// Whether values flow from the ABI locations into the function, rather
    /// than out of it.
    fn is_incoming(&self) -> bool;

    /// Materializes the address of the stack slot at `offset` in the
    /// argument area.
    fn stack_address(&mut self, ob: &mut ObservedBody<'_>, offset: i64, size: u64) -> Reg;

    /// Marshals `value` between `preg` and its virtual register.
    fn assign_to_reg(
        &mut self,
        ob: &mut ObservedBody<'_>,
        preg: PReg,
        value: Reg,
        loc_ty: Llt,
        ext: ExtKind,
    );

    /// Marshals `value` between the stack slot at `addr` and its virtual
    /// register.
    fn assign_to_address(
        &mut self,
        ob: &mut ObservedBody<'_>,
        value: Reg,
        addr: Reg,
        loc_ty: Llt,
        ext: ExtKind,
    );
}

/// Runs `assigner` over `parts` and hands each resulting location to
/// `handler`.
///
/// Returns the assignment records, or `None` when the assigner refuses a
/// part.
pub fn handle_assignments(
    ob: &mut ObservedBody<'_>,
    handler: &mut dyn ValueHandler,
    assigner: &dyn ConvAssigner,
    state: &mut CcState,
    parts: &[ArgDescriptor],
) -> Option<SmallVec<[AssignRecord; 8]>> {
    let mut records = SmallVec::new();

    for (i, part) in parts.iter().enumerate() {
        let record = assigner.assign(i, part.ty, part.attrs, part.is_fixed, state)?;

        match record.loc {
            Loc::Reg(preg) => {
                handler.assign_to_reg(ob, preg, part.reg, record.loc_ty, record.ext);
            }
            Loc::Stack { offset, size } => {
                let addr = handler.stack_address(ob, offset, size);

                handler.assign_to_address(ob, part.reg, addr, record.loc_ty, record.ext);
            }
        }

        records.push(record);
    }

    Some(records)
}

/// Marshals outgoing values: call arguments and function returns.
///
/// Register parts are extended and copied into their physical registers,
/// stack parts are stored into the outgoing argument area. For tail calls
/// the stores target fixed caller-frame slots shifted by the frame-size
/// delta instead of offsets from the stack pointer.
pub struct OutgoingArgs {
    /// The physical registers carrying outgoing values, for the call
    /// instruction's implicit-use list.
    pub implicit_uses: SmallVec<[PReg; 8]>,
    sp: PReg,
    ptr_ty: Llt,
    is_tail: bool,
    fp_diff: i64,
}

impl OutgoingArgs {
    /// Creates a handler for an ordinary call or return.
    pub fn new(sp: PReg, ptr_ty: Llt) -> Self {
        Self {
            implicit_uses: SmallVec::new(),
            sp,
            ptr_ty,
            is_tail: false,
            fp_diff: 0,
        }
    }

    /// Creates a handler for a tail call with the given frame-size delta.
    pub fn tail(sp: PReg, ptr_ty: Llt, fp_diff: i64) -> Self {
        Self {
            implicit_uses: SmallVec::new(),
            sp,
            ptr_ty,
            is_tail: true,
            fp_diff,
        }
    }
}

impl ValueHandler for OutgoingArgs {
    fn is_incoming(&self) -> bool {
        false
    }

    fn stack_address(&mut self, ob: &mut ObservedBody<'_>, offset: i64, size: u64) -> Reg {
        if self.is_tail {
            // the slot lives in the caller's own incoming argument area,
            // shifted so it lines up after the stack pointer is reset
            let idx = ob
                .frame_mut()
                .create_fixed_object(size, offset + self.fp_diff, true);

            return ob.build_frame_index(self.ptr_ty, idx);
        }

        let sp = ob.build_copy(self.ptr_ty, Reg::from_preg(self.sp));
        let off = ob.build_constant(Llt::scalar(64), offset);

        ob.build_ptr_add(self.ptr_ty, sp, off)
    }

    fn assign_to_reg(
        &mut self,
        ob: &mut ObservedBody<'_>,
        preg: PReg,
        value: Reg,
        loc_ty: Llt,
        ext: ExtKind,
    ) {
        let extended = extend_register(ob, value, loc_ty, ext);

        ob.build_copy_to(Reg::from_preg(preg), extended);
        self.implicit_uses.push(preg);
    }

    fn assign_to_address(
        &mut self,
        ob: &mut ObservedBody<'_>,
        value: Reg,
        addr: Reg,
        loc_ty: Llt,
        ext: ExtKind,
    ) {
        let extended = extend_register(ob, value, loc_ty, ext);

        ob.build_store(extended, addr);
    }
}

/// Marshals incoming formal arguments at function entry.
///
/// Register parts are marked live-in and copied out of their physical
/// registers, stack parts become fixed frame objects that are loaded from.
pub struct FormalArgs {
    /// High-water mark of the incoming stack argument area, in bytes.
    pub stack_used: u64,
    ptr_ty: Llt,
}

impl FormalArgs {
    /// Creates a handler for function entry.
    pub fn new(ptr_ty: Llt) -> Self {
        Self {
            stack_used: 0,
            ptr_ty,
        }
    }
}

fn copy_in(ob: &mut ObservedBody<'_>, from: Reg, value: Reg, loc_ty: Llt) {
    if ob.body().value_ty(value) == Some(loc_ty) {
        ob.build_copy_to(value, from);
    } else {
        // the location was wider, take the low bits
        let wide = ob.build_copy(loc_ty, from);

        ob.build_into(Opcode::Trunc, value, [Operand::Reg(wide)], MathFlags::NONE);
    }
}

impl ValueHandler for FormalArgs {
    fn is_incoming(&self) -> bool {
        true
    }

    fn stack_address(&mut self, ob: &mut ObservedBody<'_>, offset: i64, size: u64) -> Reg {
        let idx = ob.frame_mut().create_fixed_object(size, offset, true);

        self.stack_used = self.stack_used.max((offset as u64) + size);

        ob.build_frame_index(self.ptr_ty, idx)
    }

    fn assign_to_reg(
        &mut self,
        ob: &mut ObservedBody<'_>,
        preg: PReg,
        value: Reg,
        loc_ty: Llt,
        _ext: ExtKind,
    ) {
        ob.add_live_in(preg);
        copy_in(ob, Reg::from_preg(preg), value, loc_ty);
    }

    fn assign_to_address(
        &mut self,
        ob: &mut ObservedBody<'_>,
        value: Reg,
        addr: Reg,
        loc_ty: Llt,
        _ext: ExtKind,
    ) {
        if ob.body().value_ty(value) == Some(loc_ty) {
            ob.build_into(Opcode::Load, value, [Operand::Reg(addr)], MathFlags::NONE);
        } else {
            let wide = ob.build_load(loc_ty, addr);

            ob.build_into(Opcode::Trunc, value, [Operand::Reg(wide)], MathFlags::NONE);
        }
    }
}

/// Marshals values returned by a call back into virtual registers.
///
/// Identical to [`FormalArgs`] register handling except the physical
/// register becomes an implicit definition of the call instruction rather
/// than a block live-in.
pub struct CallResults {
    /// The physical registers the call defines, for its implicit-def list.
    pub implicit_defs: SmallVec<[PReg; 2]>,
    ptr_ty: Llt,
}

impl CallResults {
    /// Creates a handler for the results of one call.
    pub fn new(ptr_ty: Llt) -> Self {
        Self {
            implicit_defs: SmallVec::new(),
            ptr_ty,
        }
    }
}

impl ValueHandler for CallResults {
    fn is_incoming(&self) -> bool {
        true
    }

    fn stack_address(&mut self, ob: &mut ObservedBody<'_>, offset: i64, size: u64) -> Reg {
        let idx = ob.frame_mut().create_fixed_object(size, offset, false);

        ob.build_frame_index(self.ptr_ty, idx)
    }

    fn assign_to_reg(
        &mut self,
        ob: &mut ObservedBody<'_>,
        preg: PReg,
        value: Reg,
        loc_ty: Llt,
        _ext: ExtKind,
    ) {
        self.implicit_defs.push(preg);
        copy_in(ob, Reg::from_preg(preg), value, loc_ty);
    }

    fn assign_to_address(
        &mut self,
        ob: &mut ObservedBody<'_>,
        value: Reg,
        addr: Reg,
        loc_ty: Llt,
        _ext: ExtKind,
    ) {
        if ob.body().value_ty(value) == Some(loc_ty) {
            ob.build_into(Opcode::Load, value, [Operand::Reg(addr)], MathFlags::NONE);
        } else {
            let wide = ob.build_load(loc_ty, addr);

            ob.build_into(Opcode::Trunc, value, [Operand::Reg(wide)], MathFlags::NONE);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mir::{
        Block, CallConv, FunctionBody, InstData, NoopObserver, Signature,
    };

    fn body_with_block() -> (FunctionBody, Block) {
        let mut f = FunctionBody::new("f", Signature::new(CallConv::C));
        let b0 = f.create_block();

        (f, b0)
    }

    #[test]
    fn outgoing_register_part_is_extended_and_copied() {
        let (mut f, b0) = body_with_block();
        let s32 = Llt::scalar(32);
        let s64 = Llt::scalar(64);
        let p0 = Llt::pointer(0, 64);

        let value = Reg::from_vreg(f.create_vreg(s32));

        let mut observer = NoopObserver;
        let mut ob = ObservedBody::new(&mut f, &mut observer);

        ob.set_insertion_at_end(b0);

        let mut handler = OutgoingArgs::new(PReg::int(31), p0);

        handler.assign_to_reg(&mut ob, PReg::int(0), value, s64, ExtKind::Zero);

        assert_eq!(handler.implicit_uses.as_slice(), [PReg::int(0)]);

        let insts = f.block_insts(b0);

        assert_eq!(f.inst(insts[0]).opcode(), Opcode::Zext);
        assert_eq!(f.inst(insts[1]).opcode(), Opcode::Copy);
        assert_eq!(f.inst(insts[1]).def(0), Reg::from_preg(PReg::int(0)));
    }

    #[test]
    fn outgoing_stack_part_stores_relative_to_sp() {
        let (mut f, b0) = body_with_block();
        let s64 = Llt::scalar(64);
        let p0 = Llt::pointer(0, 64);

        let value = Reg::from_vreg(f.create_vreg(s64));

        let mut observer = NoopObserver;
        let mut ob = ObservedBody::new(&mut f, &mut observer);

        ob.set_insertion_at_end(b0);

        let mut handler = OutgoingArgs::new(PReg::int(31), p0);
        let addr = handler.stack_address(&mut ob, 8, 8);

        handler.assign_to_address(&mut ob, value, addr, s64, ExtKind::None);

        let ops: Vec<_> = f
            .block_insts(b0)
            .iter()
            .map(|&i| f.inst(i).opcode())
            .collect();

        assert_eq!(
            ops,
            [Opcode::Copy, Opcode::Constant, Opcode::PtrAdd, Opcode::Store]
        );
    }

    #[test]
    fn tail_outgoing_stack_part_uses_shifted_frame_slot() {
        let (mut f, b0) = body_with_block();
        let p0 = Llt::pointer(0, 64);

        let mut observer = NoopObserver;
        let mut ob = ObservedBody::new(&mut f, &mut observer);

        ob.set_insertion_at_end(b0);

        let mut handler = OutgoingArgs::tail(PReg::int(31), p0, 16);

        handler.stack_address(&mut ob, 8, 8);

        let fi = f.block_insts(b0)[0];

        assert_eq!(f.inst(fi).opcode(), Opcode::FrameIndex);

        let idx = match f.inst(fi).args()[0] {
            Operand::Frame(idx) => idx,
            ref other => panic!("expected frame operand, got {other:?}"),
        };

        assert_eq!(f.frame().object(idx).offset, 24);
    }

    #[test]
    fn formal_register_part_is_live_in_and_truncated() {
        let (mut f, b0) = body_with_block();
        let s32 = Llt::scalar(32);
        let s64 = Llt::scalar(64);
        let p0 = Llt::pointer(0, 64);

        let value = Reg::from_vreg(f.create_vreg(s32));

        let mut observer = NoopObserver;
        let mut ob = ObservedBody::new(&mut f, &mut observer);

        ob.set_insertion_at_end(b0);

        let mut handler = FormalArgs::new(p0);

        handler.assign_to_reg(&mut ob, PReg::int(0), value, s64, ExtKind::Any);

        assert!(f.live_ins().contains(&PReg::int(0)));

        let insts = f.block_insts(b0);

        assert_eq!(f.inst(insts[0]).opcode(), Opcode::Copy);
        assert_eq!(f.inst(insts[1]).opcode(), Opcode::Trunc);
        assert_eq!(f.inst(insts[1]).def(0), value);
    }

    #[test]
    fn formal_stack_part_tracks_area_high_water() {
        let (mut f, b0) = body_with_block();
        let s64 = Llt::scalar(64);
        let p0 = Llt::pointer(0, 64);

        let value = Reg::from_vreg(f.create_vreg(s64));

        let mut observer = NoopObserver;
        let mut ob = ObservedBody::new(&mut f, &mut observer);

        ob.set_insertion_at_end(b0);

        let mut handler = FormalArgs::new(p0);
        let addr = handler.stack_address(&mut ob, 16, 8);

        handler.assign_to_address(&mut ob, value, addr, s64, ExtKind::None);

        assert_eq!(handler.stack_used, 24);

        let load = f.block_insts(b0)[1];

        assert_eq!(f.inst(load).opcode(), Opcode::Load);
        assert_eq!(f.inst(load).def(0), value);
    }

    #[test]
    fn call_results_collect_implicit_defs() {
        let (mut f, b0) = body_with_block();
        let s64 = Llt::scalar(64);
        let p0 = Llt::pointer(0, 64);

        let value = Reg::from_vreg(f.create_vreg(s64));

        f.insert_inst(InstData::new(Opcode::Call), b0, 0);

        let mut observer = NoopObserver;
        let mut ob = ObservedBody::new(&mut f, &mut observer);

        ob.set_insertion_at_end(b0);

        let mut handler = CallResults::new(p0);

        handler.assign_to_reg(&mut ob, PReg::int(0), value, s64, ExtKind::None);

        assert_eq!(handler.implicit_defs.as_slice(), [PReg::int(0)]);
        // results are not entry live-ins
        assert!(f.live_ins().is_empty());
    }
}
