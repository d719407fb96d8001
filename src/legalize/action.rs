//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022-2023 Evan Cox <evanacox00@gmail.com>. All rights reserved. //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

use crate::mir::{FunctionBody, Inst, Llt, Opcode};
use crate::utility::SaHashMap;
use smallvec::SmallVec;

/// The verdict a [`LegalityPolicy`] hands back for one instruction.
///
/// Every non-`Legal` verdict names a rewrite strategy. The shape-changing
/// verdicts carry which type slot of the query is wrong and the type it
/// should become.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum LegalizeAction {
    /// The instruction is acceptable as is.
    Legal,
    /// Split a scalar type into narrower pieces.
    NarrowScalar {
        /// Which entry of the type query to change.
        slot: usize,
        /// The scalar type to narrow to.
        ty: Llt,
    },
    /// Perform the operation at a wider scalar type and truncate back.
    WidenScalar {
        /// Which entry of the type query to change.
        slot: usize,
        /// The scalar type to widen to.
        ty: Llt,
    },
    /// Split a vector operation into pieces with fewer lanes.
    FewerElements {
        /// Which entry of the type query to change.
        slot: usize,
        /// The vector type each piece should have.
        ty: Llt,
    },
    /// Pad a vector operation out to more lanes with undefined filler.
    MoreElements {
        /// Which entry of the type query to change.
        slot: usize,
        /// The vector type to pad to.
        ty: Llt,
    },
    /// Replace the instruction with simpler instructions.
    Lower,
    /// Replace the instruction with a call to a runtime routine.
    Libcall,
    /// No strategy can make this instruction legal.
    Unsupported,
}

/// The question put to a policy: an opcode plus the type of each of its
/// type slots (see [`legality_types`]).
#[derive(Copy, Clone, Debug)]
pub struct LegalityQuery<'a> {
    /// The opcode being queried.
    pub opcode: Opcode,
    /// The types occupying the opcode's type slots.
    pub types: &'a [Llt],
}

/// A target's legality oracle.
///
/// The engine treats this as opaque and assumes it is deterministic for
/// the duration of a run.
pub trait LegalityPolicy {
    /// Decides what to do about one opcode/type combination.
    fn action(&self, query: LegalityQuery<'_>) -> LegalizeAction;
}

/// Computes the type-slot vector used to query a policy about `inst`.
///
/// Slot 0 is the principal type: the first result, or for result-less
/// instructions the first meaningful operand. Instructions that relate two
/// distinct types (casts, the bit counts, compares, memory operations and
/// the merge/split family) expose the secondary type in slot 1.
pub fn legality_types(body: &FunctionBody, inst: Inst) -> SmallVec<[Llt; 2]> {
    let data = body.inst(inst);
    let mut types = SmallVec::new();

    let def_ty = data
        .defs()
        .first()
        .and_then(|&r| body.value_ty(r));
    let first_arg_ty = data.reg_args().next().and_then(|r| body.value_ty(r));

    match data.opcode() {
        // two-type instructions: result in slot 0, source in slot 1
        Opcode::Trunc
        | Opcode::Sext
        | Opcode::Zext
        | Opcode::Anyext
        | Opcode::PtrToInt
        | Opcode::IntToPtr
        | Opcode::Ctpop
        | Opcode::Ctlz
        | Opcode::CtlzZeroUndef
        | Opcode::Cttz
        | Opcode::CttzZeroUndef
        | Opcode::Icmp
        | Opcode::MergeValues
        | Opcode::UnmergeValues
        | Opcode::ConcatVectors
        | Opcode::Extract
        | Opcode::Load
        | Opcode::PtrAdd => {
            types.extend(def_ty);
            types.extend(first_arg_ty);
        }

        // result plus the value being inserted
        Opcode::Insert => {
            types.extend(def_ty);
            types.extend(
                data.reg_args()
                    .nth(1)
                    .and_then(|r| body.value_ty(r)),
            );
        }

        // no results: the stored value and the address
        Opcode::Store => {
            types.extend(first_arg_ty);
            types.extend(
                data.reg_args()
                    .nth(1)
                    .and_then(|r| body.value_ty(r)),
            );
        }

        Opcode::BrCond => {
            types.extend(first_arg_ty);
        }

        Opcode::Br | Opcode::Unreachable => {}

        // everything else is described by its principal type
        _ => {
            types.extend(def_ty.or(first_arg_ty));
        }
    }

    types
}

#[derive(Clone, Debug, Default)]
struct OpRules {
    exact: Vec<(SmallVec<[Llt; 2]>, LegalizeAction)>,
    fallback: Option<LegalizeAction>,
}

/// A table-driven [`LegalityPolicy`].
///
/// Per opcode, the most specific exact-type rule wins (first declared
/// match), then the opcode's fallback action, then `Unsupported`. `Copy`
/// is legal at any type unless a rule says otherwise.
#[derive(Clone, Debug, Default)]
pub struct RuleSet {
    ops: SaHashMap<Opcode, OpRules>,
}

/// Fluent rule builder for one opcode, returned by [`RuleSet::op`].
pub struct RulesFor<'a> {
    rules: &'a mut OpRules,
}

impl RulesFor<'_> {
    /// Marks each of the given type-slot combinations legal.
    pub fn legal_for(self, combinations: &[&[Llt]]) -> Self {
        for tys in combinations {
            self.rules
                .exact
                .push((SmallVec::from_slice(tys), LegalizeAction::Legal));
        }

        self
    }

    /// Attaches `action` to one exact type-slot combination.
    pub fn action_for(self, tys: &[Llt], action: LegalizeAction) -> Self {
        self.rules.exact.push((SmallVec::from_slice(tys), action));
        self
    }

    /// Sets the action taken when no exact rule matches.
    pub fn fallback(self, action: LegalizeAction) -> Self {
        self.rules.fallback = Some(action);
        self
    }
}

impl RuleSet {
    /// Creates a rule set with no rules.
    pub fn new() -> Self {
        Self::default()
    }

    /// Accesses (creating if needed) the rules for `opcode`.
    pub fn op(&mut self, opcode: Opcode) -> RulesFor<'_> {
        RulesFor {
            rules: self.ops.entry(opcode).or_default(),
        }
    }
}

impl LegalityPolicy for RuleSet {
    fn action(&self, query: LegalityQuery<'_>) -> LegalizeAction {
        if let Some(rules) = self.ops.get(&query.opcode) {
            for (tys, action) in &rules.exact {
                if tys.as_slice() == query.types {
                    return *action;
                }
            }

            if let Some(fallback) = rules.fallback {
                return fallback;
            }
        }

        if query.opcode == Opcode::Copy {
            return LegalizeAction::Legal;
        }

        LegalizeAction::Unsupported
    }
}
