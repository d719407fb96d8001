//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022-2023 Evan Cox <evanacox00@gmail.com>. All rights reserved. //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

use crate::calls::{
    handle_assignments, split_value_types, ArgDescriptor, AssignRecord, CallDescriptor,
    CallResults, Callee, CcState, ConvAssigner, FormalArgs, Loc, OutgoingArgs, RegMask,
};
use crate::mir::{
    ArgAttributes, CallConv, FunctionBody, InstData, Llt, Opcode, Operand, ObservedBody, PReg,
    Reg,
};
use smallvec::SmallVec;
use std::error::Error;
use std::fmt;

/// The ways call lowering can refuse to proceed.
///
/// Refusal is not fatal to the surrounding pipeline, the caller decides
/// whether another lowering path exists. The exception is a must-tail call
/// that cannot be a tail call, which has no correct fallback.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CallLoweringError {
    /// A value's type cannot be split into machine-sized parts.
    UnsupportedValue {
        /// The offending type.
        ty: Llt,
    },
    /// The convention's assignment function refused a part.
    AssignmentRefused,
    /// A vector return value cannot be padded to its required location
    /// type, the lane counts are not an exact multiple.
    UnsupportedReturnPadding {
        /// The logical value's type.
        value: Llt,
        /// The location type the convention requires.
        location: Llt,
    },
    /// A call marked must-tail failed tail-call eligibility. Lowering it as
    /// an ordinary call would break the guarantee the source required.
    MustTailNotEligible,
}

impl fmt::Display for CallLoweringError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedValue { ty } => {
                write!(f, "cannot split a value of type `{ty}` for a call boundary")
            }
            Self::AssignmentRefused => {
                write!(f, "the calling convention refused to assign an argument")
            }
            Self::UnsupportedReturnPadding { value, location } => {
                write!(
                    f,
                    "cannot pad a return value of type `{value}` to its location type `{location}`"
                )
            }
            Self::MustTailNotEligible => {
                write!(f, "a must-tail call site failed tail-call eligibility")
            }
        }
    }
}

impl Error for CallLoweringError {}

/// Everything a target supplies to drive generic call lowering.
pub trait TargetAbi {
    /// The assignment function for arguments of `conv`.
    fn assigner(&self, conv: CallConv, varargs: bool) -> &dyn ConvAssigner;

    /// The assignment function for return values of `conv`.
    fn ret_assigner(&self, conv: CallConv) -> &dyn ConvAssigner;

    /// The callee-saved preservation mask of `conv`.
    fn preserved_mask(&self, conv: CallConv) -> RegMask;

    /// Whether `conv` is on the allow-list of tail-callable conventions.
    fn may_tail_call(&self, conv: CallConv) -> bool;

    /// Whether `conv` guarantees tail-call optimization wherever it is
    /// legal.
    fn guarantees_tco(&self, conv: CallConv) -> bool;

    /// The stack pointer register.
    fn stack_pointer(&self) -> PReg;

    /// The pointer type used for stack addresses.
    fn pointer_ty(&self) -> Llt;

    /// The width of a general-purpose register in bits.
    fn reg_size_bits(&self) -> u32;

    /// The location type a return value of `ty` must occupy under `conv`,
    /// or `None` when the type cannot be returned.
    fn ret_location_ty(&self, conv: CallConv, ty: Llt) -> Option<Llt>;

    /// Whether a weakly-linked external callee may still be tail-called on
    /// this platform.
    fn weak_callee_tail_callable(&self) -> bool;

    /// The alignment of the outgoing argument area in bytes.
    fn stack_align(&self) -> u64 {
        16
    }
}

fn align_to(x: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());

    (x + align - 1) & !(align - 1)
}

/// Runs `assigner` over part types without touching any IR, yielding the
/// records and the stack bytes the assignment would need.
fn simulate_assignment(
    assigner: &dyn ConvAssigner,
    parts: &[(Llt, ArgAttributes, bool)],
    conv: CallConv,
    varargs: bool,
) -> Option<(SmallVec<[AssignRecord; 8]>, u64)> {
    let mut state = CcState::new(conv, varargs);
    let mut records = SmallVec::new();

    for (i, &(ty, attrs, is_fixed)) in parts.iter().enumerate() {
        records.push(assigner.assign(i, ty, attrs, is_fixed, &mut state)?);
    }

    Some((records, state.stack_bytes()))
}

/// Splits call arguments to part types only, for assignment simulation.
fn split_to_part_types(
    args: &[ArgDescriptor],
    reg_size_bits: u32,
) -> Option<Vec<(Llt, ArgAttributes, bool)>> {
    let mut parts = Vec::new();

    for arg in args {
        for ty in split_value_types(arg, reg_size_bits)? {
            parts.push((ty, arg.attrs, arg.is_fixed));
        }
    }

    Some(parts)
}

/// Splits call arguments into one descriptor per part, materializing
/// unmerges for multi-part values at the current insertion point.
fn split_outgoing_args(
    ob: &mut ObservedBody<'_>,
    args: &[ArgDescriptor],
    reg_size_bits: u32,
) -> Result<Vec<ArgDescriptor>, CallLoweringError> {
    let mut parts = Vec::new();

    for arg in args {
        let tys = split_value_types(arg, reg_size_bits)
            .ok_or(CallLoweringError::UnsupportedValue { ty: arg.ty })?;

        if tys.len() == 1 {
            parts.push(arg.clone());
            continue;
        }

        let pieces = ob.build_unmerge(tys[0], tys.len(), arg.reg);
        let last = pieces.len() - 1;

        for (i, (piece, ty)) in pieces.into_iter().zip(tys).enumerate() {
            let mut attrs = arg.attrs;

            attrs.in_consecutive_regs = true;
            attrs.in_consecutive_regs_last = i == last;

            parts.push(ArgDescriptor {
                reg: piece,
                ty,
                attrs,
                is_fixed: arg.is_fixed,
            });
        }
    }

    Ok(parts)
}

/// Lowers the function's formal arguments at the top of the entry block.
///
/// `arg_regs` names the virtual register receiving each parameter, in
/// signature order. Records the size of the incoming stack argument area on
/// the frame.
pub fn lower_formal_arguments(
    ob: &mut ObservedBody<'_>,
    abi: &dyn TargetAbi,
    arg_regs: &[Reg],
) -> Result<(), CallLoweringError> {
    let sig = ob.body().sig().clone();

    debug_assert_eq!(sig.params.len(), arg_regs.len());

    let entry = ob.body().entry_block();

    ob.set_insertion_point(entry, 0);

    let mut parts = Vec::new();
    let mut merges: Vec<(Reg, SmallVec<[Reg; 2]>)> = Vec::new();

    for (param, &value) in sig.params.iter().zip(arg_regs) {
        let desc = ArgDescriptor {
            reg: value,
            ty: param.ty,
            attrs: param.attrs,
            is_fixed: true,
        };
        let tys = split_value_types(&desc, abi.reg_size_bits())
            .ok_or(CallLoweringError::UnsupportedValue { ty: param.ty })?;

        if tys.len() == 1 {
            parts.push(desc);
            continue;
        }

        let mut piece_regs = SmallVec::new();

        for (i, &ty) in tys.iter().enumerate() {
            let piece = ob.create_vreg(ty);
            let mut attrs = param.attrs;

            attrs.in_consecutive_regs = true;
            attrs.in_consecutive_regs_last = i == tys.len() - 1;

            parts.push(ArgDescriptor {
                reg: piece,
                ty,
                attrs,
                is_fixed: true,
            });
            piece_regs.push(piece);
        }

        merges.push((value, piece_regs));
    }

    let mut handler = FormalArgs::new(abi.pointer_ty());
    let mut state = CcState::new(sig.conv, sig.varargs);
    let assigner = abi.assigner(sig.conv, sig.varargs);

    handle_assignments(ob, &mut handler, assigner, &mut state, &parts)
        .ok_or(CallLoweringError::AssignmentRefused)?;

    for (value, pieces) in merges {
        ob.build_into(
            Opcode::MergeValues,
            value,
            pieces.into_iter().map(Operand::Reg),
            crate::mir::MathFlags::NONE,
        );
    }

    let stack_used = handler.stack_used;

    ob.frame_mut().set_bytes_in_stack_arg_area(stack_used);

    Ok(())
}

/// Lowers a return of `value` (or a bare return) at the current insertion
/// point.
///
/// A 1-bit return is always zero-extended to 8 bits before any extension
/// the convention itself implies. Vector returns narrower than their
/// required location are padded with undefined lanes, but only when the
/// location's lane count is an exact multiple of the value's.
pub fn lower_return(
    ob: &mut ObservedBody<'_>,
    abi: &dyn TargetAbi,
    value: Option<Reg>,
) -> Result<(), CallLoweringError> {
    let conv = ob.body().conv();
    let ret_attrs = ob.body().sig().ret.map(|r| r.attrs).unwrap_or_default();

    let mut implicit_uses: SmallVec<[PReg; 2]> = SmallVec::new();

    if let Some(value) = value {
        let ty = ob
            .body()
            .value_ty(value)
            .expect("return value must be a virtual register");

        // booleans are canonically zero-based no matter what extension the
        // convention would otherwise apply
        let (value, ty) = if ty == Llt::scalar(1) {
            (ob.build_cast(Opcode::Zext, Llt::scalar(8), value), Llt::scalar(8))
        } else {
            (value, ty)
        };

        let loc_ty = abi
            .ret_location_ty(conv, ty)
            .ok_or(CallLoweringError::UnsupportedValue { ty })?;

        let (value, ty) = if ty.is_vector() && loc_ty.is_vector() && loc_ty != ty {
            if loc_ty.element_bits() != ty.element_bits()
                || loc_ty.lanes() % ty.lanes() != 0
                || loc_ty.lanes() <= ty.lanes()
            {
                return Err(CallLoweringError::UnsupportedReturnPadding {
                    value: ty,
                    location: loc_ty,
                });
            }

            let ratio = (loc_ty.lanes() / ty.lanes()) as usize;
            let undef = ob.build_undef(ty);
            let mut pieces: SmallVec<[Reg; 4]> = SmallVec::new();

            pieces.push(value);

            for _ in 1..ratio {
                pieces.push(undef);
            }

            (ob.build_concat(loc_ty, pieces), loc_ty)
        } else {
            (value, ty)
        };

        let desc = ArgDescriptor {
            reg: value,
            ty,
            attrs: ret_attrs,
            is_fixed: true,
        };
        let mut handler = OutgoingArgs::new(abi.stack_pointer(), abi.pointer_ty());
        let mut state = CcState::new(conv, false);

        handle_assignments(ob, &mut handler, abi.ret_assigner(conv), &mut state, &[desc])
            .ok_or(CallLoweringError::AssignmentRefused)?;

        implicit_uses = handler.implicit_uses.into_iter().collect();
    }

    let mut data = InstData::new(Opcode::Ret);

    for preg in implicit_uses {
        data = data.with_implicit_use(preg);
    }

    ob.insert(data);

    Ok(())
}

/// Decides whether a call site may be lowered as a tail call.
///
/// The checks run in a fixed precedence order, any failure disqualifies.
pub fn is_eligible_for_tail_call(
    body: &FunctionBody,
    abi: &dyn TargetAbi,
    desc: &CallDescriptor,
) -> bool {
    // 1: the site must be in tail position at all
    if !desc.is_tail_candidate {
        return false;
    }

    // 2: an error-propagation register cannot be rematerialized after a
    // tail branch
    if desc.args.iter().any(|a| a.attrs.error_reg) {
        return false;
    }

    // 3: the callee's convention must be tail-callable at all
    if !abi.may_tail_call(desc.conv) {
        return false;
    }

    // 4: byval, inreg or error-register parameters of the caller make
    // frame reuse unsafe
    let caller_sig = body.sig();

    if caller_sig.params.iter().any(|p| {
        p.attrs.byval.is_some() || p.attrs.inreg || p.attrs.error_reg
    }) {
        return false;
    }

    // 5: the linker may turn an unresolved weak call into a no-op, which
    // only works for a call-and-return
    if let Callee::Direct { weak: true, .. } = desc.callee {
        if !abi.weak_callee_tail_callable() {
            return false;
        }
    }

    // 6: under guaranteed TCO eligibility collapses to matching
    // conventions
    if abi.guarantees_tco(desc.conv) {
        return desc.conv == caller_sig.conv;
    }

    let parts = match split_to_part_types(&desc.args, abi.reg_size_bits()) {
        Some(parts) => parts,
        None => return false,
    };

    // 7: caller and callee must pass these arguments the same way, and
    // the callee must preserve at least what the caller's convention does
    let caller_conv = caller_sig.conv;

    if desc.conv != caller_conv {
        let as_callee = simulate_assignment(
            abi.assigner(desc.conv, desc.varargs),
            &parts,
            desc.conv,
            desc.varargs,
        );
        let as_caller = simulate_assignment(
            abi.assigner(caller_conv, desc.varargs),
            &parts,
            caller_conv,
            desc.varargs,
        );

        match (as_callee, as_caller) {
            (Some((a, _)), Some((b, _))) if a == b => {}
            _ => return false,
        }

        if !abi
            .preserved_mask(desc.conv)
            .covers(&abi.preserved_mask(caller_conv))
        {
            return false;
        }
    }

    // 8: outgoing arguments must fit the caller's incoming area, variadic
    // stack parts are out, and a callee-saved register argument must be a
    // straight forward of that same incoming register
    let (records, stack_bytes) = match simulate_assignment(
        abi.assigner(desc.conv, desc.varargs),
        &parts,
        desc.conv,
        desc.varargs,
    ) {
        Some(sim) => sim,
        None => return false,
    };

    if stack_bytes > body.frame().bytes_in_stack_arg_area() {
        return false;
    }

    let caller_mask = abi.preserved_mask(caller_conv);
    let mut part_iter = desc.args.iter().flat_map(|arg| {
        let n = split_value_types(arg, abi.reg_size_bits()).map_or(0, |t| t.len());

        std::iter::repeat(arg).take(n)
    });

    for record in &records {
        let arg = match part_iter.next() {
            Some(arg) => arg,
            None => return false,
        };

        match record.loc {
            Loc::Stack { .. } if !arg.is_fixed => return false,
            Loc::Reg(preg) if caller_mask.preserves(preg) => {
                if !is_forward_of(body, arg.reg, preg) {
                    return false;
                }
            }
            _ => {}
        }
    }

    true
}

/// Checks that `value` is a plain copy of the incoming physical register
/// `preg`, not a freshly computed value.
fn is_forward_of(body: &FunctionBody, value: Reg, preg: PReg) -> bool {
    let def = match value.as_vreg().and_then(|v| body.def_of(v)) {
        Some(def) => def,
        None => return false,
    };
    let data = body.inst(def);

    data.opcode() == Opcode::Copy
        && data.reg_args().next() == Some(Reg::from_preg(preg))
}

/// Lowers one call site at the current insertion point. Returns whether a
/// tail branch was produced.
///
/// Tail-call-eligible candidates become tail branches, everything else gets
/// the full stack-adjust/marshal/call/unmarshal sequence. A must-tail site
/// that fails eligibility is an error, never a silent ordinary call.
pub fn lower_call(
    ob: &mut ObservedBody<'_>,
    abi: &dyn TargetAbi,
    desc: &CallDescriptor,
) -> Result<bool, CallLoweringError> {
    let eligible = is_eligible_for_tail_call(ob.body(), abi, desc);

    if desc.is_must_tail && !eligible {
        return Err(CallLoweringError::MustTailNotEligible);
    }

    if eligible {
        lower_tail_call(ob, abi, desc)?;

        return Ok(true);
    }

    let parts = split_outgoing_args(ob, &desc.args, abi.reg_size_bits())?;
    let part_tys: Vec<_> = parts.iter().map(|p| (p.ty, p.attrs, p.is_fixed)).collect();

    let (_, stack_needed) = simulate_assignment(
        abi.assigner(desc.conv, desc.varargs),
        &part_tys,
        desc.conv,
        desc.varargs,
    )
    .ok_or(CallLoweringError::AssignmentRefused)?;

    let bytes = align_to(stack_needed, abi.stack_align());

    ob.insert(InstData::new(Opcode::AdjustStackDown).with_args([Operand::Imm(bytes as i64)]));

    let mut handler = OutgoingArgs::new(abi.stack_pointer(), abi.pointer_ty());
    let mut state = CcState::new(desc.conv, desc.varargs);

    handle_assignments(
        ob,
        &mut handler,
        abi.assigner(desc.conv, desc.varargs),
        &mut state,
        &parts,
    )
    .ok_or(CallLoweringError::AssignmentRefused)?;

    let mut call_data = InstData::new(Opcode::Call).with_args([callee_operand(&desc.callee)]);

    for &preg in &handler.implicit_uses {
        call_data = call_data.with_implicit_use(preg);
    }

    let call = ob.insert(call_data);

    if let Some(ret) = &desc.ret {
        let mut results = CallResults::new(abi.pointer_ty());
        let mut ret_state = CcState::new(desc.conv, false);

        handle_assignments(
            ob,
            &mut results,
            abi.ret_assigner(desc.conv),
            &mut ret_state,
            std::slice::from_ref(ret),
        )
        .ok_or(CallLoweringError::AssignmentRefused)?;

        let defs = results.implicit_defs;

        ob.mutate(call, |data| {
            for &preg in &defs {
                data.implicit_defs.push(preg);
            }
        });
    }

    ob.insert(InstData::new(Opcode::AdjustStackUp).with_args([Operand::Imm(bytes as i64)]));

    Ok(false)
}

fn callee_operand(callee: &Callee) -> Operand {
    match callee {
        Callee::Direct { name, .. } => Operand::Symbol(name.clone().into_boxed_str()),
        Callee::Indirect(reg) => Operand::Reg(*reg),
    }
}

/// Lowers an eligible call site as a tail branch.
///
/// Under guaranteed TCO the frame-size delta between caller and callee
/// shifts every outgoing stack slot, so the values land where the callee
/// expects them once the stack pointer is reset. A negative delta means the
/// callee needs more argument space than the caller reserved.
fn lower_tail_call(
    ob: &mut ObservedBody<'_>,
    abi: &dyn TargetAbi,
    desc: &CallDescriptor,
) -> Result<(), CallLoweringError> {
    let parts = split_outgoing_args(ob, &desc.args, abi.reg_size_bits())?;
    let part_tys: Vec<_> = parts.iter().map(|p| (p.ty, p.attrs, p.is_fixed)).collect();

    let caller_conv = ob.body().conv();
    let fp_diff = if abi.guarantees_tco(desc.conv) && desc.conv == caller_conv {
        let (_, stack_needed) = simulate_assignment(
            abi.assigner(desc.conv, desc.varargs),
            &part_tys,
            desc.conv,
            desc.varargs,
        )
        .ok_or(CallLoweringError::AssignmentRefused)?;

        let reserved = ob.body().frame().bytes_in_stack_arg_area();

        reserved as i64 - align_to(stack_needed, abi.stack_align()) as i64
    } else {
        0
    };

    let mut handler = OutgoingArgs::tail(abi.stack_pointer(), abi.pointer_ty(), fp_diff);
    let mut state = CcState::new(desc.conv, desc.varargs);

    handle_assignments(
        ob,
        &mut handler,
        abi.assigner(desc.conv, desc.varargs),
        &mut state,
        &parts,
    )
    .ok_or(CallLoweringError::AssignmentRefused)?;

    let mut data = InstData::new(Opcode::TailCall)
        .with_args([callee_operand(&desc.callee), Operand::Imm(fp_diff)]);

    for &preg in &handler.implicit_uses {
        data = data.with_implicit_use(preg);
    }

    ob.insert(data);
    ob.frame_mut().set_has_tail_call();

    Ok(())
}
