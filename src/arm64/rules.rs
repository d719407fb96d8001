//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022-2023 Evan Cox <evanacox00@gmail.com>. All rights reserved. //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

use crate::legalize::{LegalizeAction, RuleSet};
use crate::mir::{Llt, Opcode};

/// Builds the AArch64 legality table.
///
/// Integer arithmetic is native at 32 and 64 bits and at the NEON vector
/// shapes, everything narrower widens to a word. There is no native
/// trailing-zero count, so `cttz` lowers through `clz`, and population
/// counts outside the vector unit go through the runtime.
pub fn legalization_rules() -> RuleSet {
    let s1 = Llt::scalar(1);
    let s32 = Llt::scalar(32);
    let s64 = Llt::scalar(64);
    let p0 = Llt::pointer(0, 64);
    let v8s8 = Llt::vector(8, 8);
    let v16s8 = Llt::vector(16, 8);
    let v4s16 = Llt::vector(4, 16);
    let v8s16 = Llt::vector(8, 16);
    let v2s32 = Llt::vector(2, 32);
    let v4s32 = Llt::vector(4, 32);
    let v2s64 = Llt::vector(2, 64);

    let widen_dst = LegalizeAction::WidenScalar { slot: 0, ty: s32 };
    let mut rules = RuleSet::new();

    for op in [
        Opcode::Add,
        Opcode::Sub,
        Opcode::Mul,
        Opcode::And,
        Opcode::Or,
        Opcode::Xor,
    ] {
        rules
            .op(op)
            .legal_for(&[
                &[s32],
                &[s64],
                &[v8s8],
                &[v16s8],
                &[v4s16],
                &[v8s16],
                &[v2s32],
                &[v4s32],
                &[v2s64],
            ])
            .fallback(widen_dst);
    }

    for op in [Opcode::Shl, Opcode::LShr, Opcode::AShr] {
        rules
            .op(op)
            .legal_for(&[&[s32], &[s64]])
            .fallback(widen_dst);
    }

    rules
        .op(Opcode::Neg)
        .legal_for(&[&[s32], &[s64]])
        .fallback(LegalizeAction::Lower);

    for op in [Opcode::FAdd, Opcode::FSub] {
        rules
            .op(op)
            .legal_for(&[&[s32], &[s64], &[v2s32], &[v4s32], &[v2s64]]);
    }

    rules
        .op(Opcode::FNeg)
        .legal_for(&[&[s32], &[s64]])
        .fallback(LegalizeAction::Lower);

    // no scalar min/max instructions before FEAT_CSSC
    for op in [Opcode::SMin, Opcode::SMax, Opcode::UMin, Opcode::UMax] {
        rules.op(op).fallback(LegalizeAction::Lower);
    }

    rules
        .op(Opcode::Ctlz)
        .legal_for(&[&[s32, s32], &[s64, s64]])
        .fallback(widen_dst);
    rules
        .op(Opcode::Ctpop)
        .legal_for(&[&[v8s8, v8s8], &[v16s8, v16s8]])
        .fallback(LegalizeAction::Libcall);

    for op in [
        Opcode::Cttz,
        Opcode::CtlzZeroUndef,
        Opcode::CttzZeroUndef,
        Opcode::SextInReg,
    ] {
        rules.op(op).fallback(LegalizeAction::Lower);
    }

    rules
        .op(Opcode::Icmp)
        .legal_for(&[&[s1, s32], &[s1, s64], &[s1, p0]])
        .fallback(LegalizeAction::WidenScalar { slot: 1, ty: s32 });
    rules
        .op(Opcode::Select)
        .legal_for(&[&[s32], &[s64], &[p0]])
        .fallback(widen_dst);

    rules
        .op(Opcode::Constant)
        .legal_for(&[&[s32], &[s64], &[p0]])
        .fallback(widen_dst);
    rules.op(Opcode::FConstant).legal_for(&[&[s32], &[s64]]);

    // casts and the artifact family stay as emitted, the combiner is what
    // keeps them in check
    for op in [
        Opcode::Trunc,
        Opcode::Sext,
        Opcode::Zext,
        Opcode::Anyext,
        Opcode::MergeValues,
        Opcode::UnmergeValues,
        Opcode::ConcatVectors,
        Opcode::BuildVector,
        Opcode::Extract,
        Opcode::Insert,
        Opcode::ImplicitDef,
    ] {
        rules.op(op).fallback(LegalizeAction::Legal);
    }

    for op in [
        Opcode::Load,
        Opcode::Store,
        Opcode::FrameIndex,
        Opcode::GlobalAddr,
        Opcode::PtrAdd,
        Opcode::PtrToInt,
        Opcode::IntToPtr,
        Opcode::Phi,
        Opcode::Br,
        Opcode::BrCond,
        Opcode::Unreachable,
        Opcode::Ret,
        Opcode::Call,
        Opcode::TailCall,
        Opcode::AdjustStackDown,
        Opcode::AdjustStackUp,
    ] {
        rules.op(op).fallback(LegalizeAction::Legal);
    }

    rules
}
