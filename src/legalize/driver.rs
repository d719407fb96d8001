//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022-2023 Evan Cox <evanacox00@gmail.com>. All rights reserved. //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

use crate::legalize::{
    classify, ArtifactCombiner, InstClass, InstWorklist, LegalityPolicy, LegalizeHelper,
    LegalizeResult,
};
use crate::mir::{ChangeObserver, FunctionBody, Inst, ObservedBody, Opcode};
use std::error::Error;
use std::fmt;

/// Knobs for a [`Legalizer`] run.
#[derive(Copy, Clone, Debug, Default)]
pub struct LegalizerOptions {
    /// Deduplicate integer constants materialized within one rewrite.
    pub cse: bool,
}

/// The ways a legalization run can fail.
///
/// Any failure leaves the function in a partially rewritten but internally
/// consistent state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LegalizeError {
    /// The policy gave up on an instruction and no strategy applied.
    UnableToLegalize {
        /// Name of the function being legalized.
        func: String,
        /// The offending instruction.
        inst: Inst,
        /// Its opcode at the time of failure.
        opcode: Opcode,
    },
    /// Artifacts remained that could neither combine nor legalize, and no
    /// further progress was possible.
    StuckArtifacts {
        /// Name of the function being legalized.
        func: String,
        /// Every artifact left stuck when progress stopped.
        stuck: Vec<Inst>,
    },
    /// A rewrite changed the number of basic blocks, which legalization
    /// must never do.
    BlockCountChanged {
        /// Name of the function being legalized.
        func: String,
        /// Block count before the run.
        before: usize,
        /// Block count after the run.
        after: usize,
    },
}

impl fmt::Display for LegalizeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnableToLegalize { func, opcode, .. } => {
                write!(f, "unable to legalize `{opcode:?}` in function '{func}'")
            }
            Self::StuckArtifacts { func, stuck } => {
                write!(
                    f,
                    "{} artifact(s) could not be eliminated in function '{func}'",
                    stuck.len()
                )
            }
            Self::BlockCountChanged {
                func,
                before,
                after,
            } => {
                write!(
                    f,
                    "legalizing function '{func}' changed the block count from {before} to {after}"
                )
            }
        }
    }
}

impl Error for LegalizeError {}

/// The driver's [`ChangeObserver`]: routes every created or rewritten
/// instruction into the right queue and drops erased ones, so the queues
/// never hold stale work no matter how deep inside a rewrite the change
/// happened.
struct WorklistTracker {
    insts: InstWorklist,
    artifacts: InstWorklist,
}

impl WorklistTracker {
    fn new() -> Self {
        Self {
            insts: InstWorklist::new(),
            artifacts: InstWorklist::new(),
        }
    }

    /// Seeds both queues from the whole function, reverse-postorder over
    /// blocks and forward within each block, so popping works bottom-up.
    fn seed(&mut self, body: &FunctionBody) {
        for block in body.rpo() {
            for &inst in body.block_insts(block) {
                match classify(body.inst(inst)) {
                    InstClass::Artifact => self.artifacts.deferred_insert(inst),
                    InstClass::Ordinary => self.insts.deferred_insert(inst),
                    InstClass::NotApplicable => {}
                }
            }
        }

        self.insts.finalize();
        self.artifacts.finalize();
    }

    /// Puts `inst` in the queue its current opcode calls for, and out of
    /// the other.
    fn route(&mut self, body: &FunctionBody, inst: Inst) {
        match classify(body.inst(inst)) {
            InstClass::Artifact => {
                self.insts.remove(inst);
                self.artifacts.insert(inst);
            }
            InstClass::Ordinary => {
                self.artifacts.remove(inst);
                self.insts.insert(inst);
            }
            InstClass::NotApplicable => {
                self.insts.remove(inst);
                self.artifacts.remove(inst);
            }
        }
    }

    /// Requeues the attached definers of `inst`'s register operands. Their
    /// use counts are about to change, which can make them dead or newly
    /// combinable.
    fn requeue_definers(&mut self, body: &FunctionBody, inst: Inst) {
        let definers: smallvec::SmallVec<[Inst; 4]> = body
            .inst(inst)
            .reg_args()
            .filter_map(|r| r.as_vreg())
            .filter_map(|v| body.def_of(v))
            .filter(|&def| body.is_attached(def) && def != inst)
            .collect();

        for def in definers {
            self.route(body, def);
        }
    }
}

impl ChangeObserver for WorklistTracker {
    fn created_inst(&mut self, body: &FunctionBody, inst: Inst) {
        self.route(body, inst);
    }

    fn changing_inst(&mut self, body: &FunctionBody, inst: Inst) {
        self.requeue_definers(body, inst);
    }

    fn changed_inst(&mut self, body: &FunctionBody, inst: Inst) {
        self.route(body, inst);
    }

    fn erasing_inst(&mut self, body: &FunctionBody, inst: Inst) {
        self.requeue_definers(body, inst);
        self.insts.remove(inst);
        self.artifacts.remove(inst);
    }
}

/// Checks whether `inst` computes values nobody reads and is free of side
/// effects, making it safe to erase.
fn is_trivially_dead(body: &FunctionBody, inst: Inst) -> bool {
    let data = body.inst(inst);

    if data.opcode().has_side_effects() || data.touches_pregs() || data.defs().is_empty() {
        return false;
    }

    data.defs().iter().all(|&d| match d.as_vreg() {
        Some(v) => body.use_count(v) == 0,
        None => false,
    })
}

/// Rewrites a function until every instruction is legal under a policy.
///
/// Runs two worklists to a fixed point: ordinary instructions are handed to
/// the [`LegalizeHelper`], artifacts go to the [`ArtifactCombiner`] first
/// and only fall back to the helper when nothing folds. Artifacts that can
/// do neither are retried as long as some other rewrite is still making
/// progress, and reported stuck once nothing moves.
pub struct Legalizer<'p> {
    policy: &'p dyn LegalityPolicy,
    options: LegalizerOptions,
}

impl<'p> Legalizer<'p> {
    /// Creates a legalizer with default options.
    pub fn new(policy: &'p dyn LegalityPolicy) -> Self {
        Self {
            policy,
            options: LegalizerOptions::default(),
        }
    }

    /// Creates a legalizer with explicit options.
    pub fn with_options(policy: &'p dyn LegalityPolicy, options: LegalizerOptions) -> Self {
        Self { policy, options }
    }

    fn observed<'a>(
        &self,
        body: &'a mut FunctionBody,
        tracker: &'a mut WorklistTracker,
    ) -> ObservedBody<'a> {
        let mut ob = ObservedBody::new(body, tracker);

        if self.options.cse {
            ob.enable_constant_cache();
        }

        ob
    }

    /// Legalizes `body` to a fixed point.
    ///
    /// Returns whether anything changed. On error the function is left in
    /// whatever consistent state the run reached.
    pub fn run(&self, body: &mut FunctionBody) -> Result<bool, LegalizeError> {
        let blocks_before = body.num_blocks();
        let mut tracker = WorklistTracker::new();
        let mut changed = false;

        tracker.seed(body);

        loop {
            // ordinary instructions first, every artifact combine can
            // reveal more of them
            while let Some(inst) = tracker.insts.pop() {
                if !body.is_attached(inst) {
                    continue;
                }

                if is_trivially_dead(body, inst) {
                    self.observed(body, &mut tracker).erase(inst);
                    changed = true;
                    continue;
                }

                let result = {
                    let mut ob = self.observed(body, &mut tracker);
                    let mut helper = LegalizeHelper::new(&mut ob, self.policy);

                    helper.legalize_step(inst)
                };

                match result {
                    Ok(LegalizeResult::AlreadyLegal) => {}
                    Ok(LegalizeResult::Legalized) => changed = true,
                    Err(_) => {
                        return Err(LegalizeError::UnableToLegalize {
                            func: body.name().to_string(),
                            inst,
                            opcode: body.inst(inst).opcode(),
                        });
                    }
                }
            }

            if tracker.artifacts.is_empty() {
                if tracker.insts.is_empty() {
                    break;
                }

                continue;
            }

            // artifacts: combine away, or legalize, or set aside for retry
            let mut retry = Vec::new();
            let mut progress = false;

            while let Some(artifact) = tracker.artifacts.pop() {
                if !body.is_attached(artifact) {
                    continue;
                }

                if is_trivially_dead(body, artifact) {
                    self.observed(body, &mut tracker).erase(artifact);
                    changed = true;
                    progress = true;
                    continue;
                }

                let mut ob = self.observed(body, &mut tracker);

                if let Some(dead) = ArtifactCombiner.try_combine(&mut ob, artifact) {
                    for inst in dead {
                        if ob.body().is_attached(inst) {
                            ob.erase(inst);
                        }
                    }

                    changed = true;
                    progress = true;
                    continue;
                }

                let mut helper = LegalizeHelper::new(&mut ob, self.policy);

                match helper.legalize_step(artifact) {
                    Ok(LegalizeResult::AlreadyLegal) => {}
                    Ok(LegalizeResult::Legalized) => {
                        changed = true;
                        progress = true;
                    }
                    Err(_) => retry.push(artifact),
                }
            }

            if retry.is_empty() {
                if tracker.insts.is_empty() && tracker.artifacts.is_empty() {
                    break;
                }

                continue;
            }

            if !progress {
                return Err(LegalizeError::StuckArtifacts {
                    func: body.name().to_string(),
                    stuck: retry,
                });
            }

            // something else moved, those artifacts deserve another look
            for artifact in retry {
                tracker.artifacts.insert(artifact);
            }
        }

        let blocks_after = body.num_blocks();

        if blocks_after != blocks_before {
            return Err(LegalizeError::BlockCountChanged {
                func: body.name().to_string(),
                before: blocks_before,
                after: blocks_after,
            });
        }

        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::legalize::{LegalizeAction, RuleSet};
    use crate::mir::{
        Block, CallConv, InstData, Llt, Operand, Reg, Signature,
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
    fn legal_function_is_left_alone() {
        let (mut f, b0) = body_with_block();
        let s32 = Llt::scalar(32);

        let a = Reg::from_vreg(f.create_vreg(s32));
        let b = Reg::from_vreg(f.create_vreg(s32));
        let sum = Reg::from_vreg(f.create_vreg(s32));

        f.insert_inst(
            InstData::new(Opcode::Add)
                .with_defs([sum])
                .with_args([Operand::Reg(a), Operand::Reg(b)]),
            b0,
            0,
        );
        f.insert_inst(
            InstData::new(Opcode::Ret).with_args([Operand::Reg(sum)]),
            b0,
            1,
        );

        let mut rules = RuleSet::new();

        rules.op(Opcode::Add).legal_for(&[&[s32]]);

        let legalizer = Legalizer::new(&rules);

        assert_eq!(legalizer.run(&mut f), Ok(false));
        assert_eq!(opcodes(&f, b0), [Opcode::Add, Opcode::Ret]);
    }

    #[test]
    fn running_twice_is_idempotent() {
        let (mut f, b0) = body_with_block();
        let s16 = Llt::scalar(16);
        let s32 = Llt::scalar(32);

        let a = Reg::from_vreg(f.create_vreg(s16));
        let b = Reg::from_vreg(f.create_vreg(s16));
        let sum = Reg::from_vreg(f.create_vreg(s16));

        f.insert_inst(
            InstData::new(Opcode::Add)
                .with_defs([sum])
                .with_args([Operand::Reg(a), Operand::Reg(b)]),
            b0,
            0,
        );
        f.insert_inst(
            InstData::new(Opcode::Ret).with_args([Operand::Reg(sum)]),
            b0,
            1,
        );

        let mut rules = RuleSet::new();

        rules
            .op(Opcode::Add)
            .legal_for(&[&[s32]])
            .fallback(LegalizeAction::WidenScalar { slot: 0, ty: s32 });
        rules.op(Opcode::Zext).fallback(LegalizeAction::Legal);
        rules.op(Opcode::Trunc).fallback(LegalizeAction::Legal);

        let legalizer = Legalizer::new(&rules);

        assert_eq!(legalizer.run(&mut f), Ok(true));

        let after_first = opcodes(&f, b0);

        assert_eq!(legalizer.run(&mut f), Ok(false));
        assert_eq!(opcodes(&f, b0), after_first);
    }

    #[test]
    fn widening_folds_the_artifacts_it_creates() {
        let (mut f, b0) = body_with_block();
        let s8 = Llt::scalar(8);
        let s32 = Llt::scalar(32);

        let x = Reg::from_vreg(f.create_vreg(s32));
        let y = Reg::from_vreg(f.create_vreg(s32));
        let nx = Reg::from_vreg(f.create_vreg(s8));
        let ny = Reg::from_vreg(f.create_vreg(s8));
        let sum = Reg::from_vreg(f.create_vreg(s8));
        let out = Reg::from_vreg(f.create_vreg(s32));

        f.insert_inst(
            InstData::new(Opcode::Trunc)
                .with_defs([nx])
                .with_args([Operand::Reg(x)]),
            b0,
            0,
        );
        f.insert_inst(
            InstData::new(Opcode::Trunc)
                .with_defs([ny])
                .with_args([Operand::Reg(y)]),
            b0,
            1,
        );
        f.insert_inst(
            InstData::new(Opcode::Add)
                .with_defs([sum])
                .with_args([Operand::Reg(nx), Operand::Reg(ny)]),
            b0,
            2,
        );
        f.insert_inst(
            InstData::new(Opcode::Zext)
                .with_defs([out])
                .with_args([Operand::Reg(sum)]),
            b0,
            3,
        );
        f.insert_inst(
            InstData::new(Opcode::Ret).with_args([Operand::Reg(out)]),
            b0,
            4,
        );

        let mut rules = RuleSet::new();

        rules
            .op(Opcode::Add)
            .legal_for(&[&[s32]])
            .fallback(LegalizeAction::WidenScalar { slot: 0, ty: s32 });
        rules.op(Opcode::And).legal_for(&[&[s32]]);
        rules.op(Opcode::Constant).legal_for(&[&[s32]]);

        let legalizer = Legalizer::new(&rules);

        assert_eq!(legalizer.run(&mut f), Ok(true));

        // every narrow value and every cast folded away
        for block in f.blocks().collect::<Vec<_>>() {
            for &inst in f.block_insts(block) {
                let data = f.inst(inst);

                assert!(
                    !matches!(
                        data.opcode(),
                        Opcode::Trunc | Opcode::Zext | Opcode::Sext | Opcode::Anyext
                    ),
                    "leftover artifact {:?}",
                    data.opcode()
                );

                for &def in data.defs() {
                    assert_ne!(f.value_ty(def), Some(s8), "leftover narrow value");
                }
            }
        }
    }

    #[test]
    fn unsupported_instruction_reports_its_opcode() {
        let (mut f, b0) = body_with_block();
        let s32 = Llt::scalar(32);

        let a = Reg::from_vreg(f.create_vreg(s32));
        let dst = Reg::from_vreg(f.create_vreg(s32));
        let out = Reg::from_vreg(f.create_vreg(s32));

        f.insert_inst(
            InstData::new(Opcode::Mul)
                .with_defs([dst])
                .with_args([Operand::Reg(a), Operand::Reg(a)]),
            b0,
            0,
        );
        f.insert_inst(
            InstData::new(Opcode::Add)
                .with_defs([out])
                .with_args([Operand::Reg(dst), Operand::Reg(dst)]),
            b0,
            1,
        );
        f.insert_inst(
            InstData::new(Opcode::Ret).with_args([Operand::Reg(out)]),
            b0,
            2,
        );

        let mut rules = RuleSet::new();

        rules.op(Opcode::Add).legal_for(&[&[s32]]);

        let legalizer = Legalizer::new(&rules);

        match legalizer.run(&mut f) {
            Err(LegalizeError::UnableToLegalize { opcode, .. }) => {
                assert_eq!(opcode, Opcode::Mul);
            }
            other => panic!("expected UnableToLegalize, got {other:?}"),
        }
    }

    #[test]
    fn uncombinable_illegal_artifact_is_stuck() {
        let (mut f, b0) = body_with_block();
        let s32 = Llt::scalar(32);
        let s64 = Llt::scalar(64);

        let x = Reg::from_vreg(f.create_vreg(s32));
        let wide = Reg::from_vreg(f.create_vreg(s64));

        let ext = f.insert_inst(
            InstData::new(Opcode::Zext)
                .with_defs([wide])
                .with_args([Operand::Reg(x)]),
            b0,
            0,
        );
        f.insert_inst(
            InstData::new(Opcode::Ret).with_args([Operand::Reg(wide)]),
            b0,
            1,
        );

        let rules = RuleSet::new();
        let legalizer = Legalizer::new(&rules);

        match legalizer.run(&mut f) {
            Err(LegalizeError::StuckArtifacts { stuck, .. }) => {
                assert_eq!(stuck, [ext]);
            }
            other => panic!("expected StuckArtifacts, got {other:?}"),
        }
    }

    #[test]
    fn legal_artifact_is_not_stuck() {
        let (mut f, b0) = body_with_block();
        let s32 = Llt::scalar(32);
        let s64 = Llt::scalar(64);

        let x = Reg::from_vreg(f.create_vreg(s32));
        let wide = Reg::from_vreg(f.create_vreg(s64));

        f.insert_inst(
            InstData::new(Opcode::Zext)
                .with_defs([wide])
                .with_args([Operand::Reg(x)]),
            b0,
            0,
        );
        f.insert_inst(
            InstData::new(Opcode::Ret).with_args([Operand::Reg(wide)]),
            b0,
            1,
        );

        let mut rules = RuleSet::new();

        rules.op(Opcode::Zext).legal_for(&[&[s64, s32]]);

        let legalizer = Legalizer::new(&rules);

        assert_eq!(legalizer.run(&mut f), Ok(false));
        assert_eq!(opcodes(&f, b0), [Opcode::Zext, Opcode::Ret]);
    }

    #[test]
    fn dead_chains_are_erased_producers_after_users() {
        let (mut f, b0) = body_with_block();
        let s32 = Llt::scalar(32);

        let c = Reg::from_vreg(f.create_vreg(s32));
        let n = Reg::from_vreg(f.create_vreg(s32));

        f.insert_inst(
            InstData::new(Opcode::Constant)
                .with_defs([c])
                .with_args([Operand::Imm(7)]),
            b0,
            0,
        );
        f.insert_inst(
            InstData::new(Opcode::Neg)
                .with_defs([n])
                .with_args([Operand::Reg(c)]),
            b0,
            1,
        );
        f.insert_inst(InstData::new(Opcode::Ret), b0, 2);

        let rules = RuleSet::new();
        let legalizer = Legalizer::new(&rules);

        // nothing is marked legal, but nothing live needs legalizing either
        assert_eq!(legalizer.run(&mut f), Ok(true));
        assert_eq!(opcodes(&f, b0), [Opcode::Ret]);
    }

    #[test]
    fn lowering_cascades_until_legal() {
        let (mut f, b0) = body_with_block();
        let s32 = Llt::scalar(32);
        let s1 = Llt::scalar(1);

        let a = Reg::from_vreg(f.create_vreg(s32));
        let b = Reg::from_vreg(f.create_vreg(s32));
        let m = Reg::from_vreg(f.create_vreg(s32));

        f.insert_inst(
            InstData::new(Opcode::UMax)
                .with_defs([m])
                .with_args([Operand::Reg(a), Operand::Reg(b)]),
            b0,
            0,
        );
        f.insert_inst(
            InstData::new(Opcode::Ret).with_args([Operand::Reg(m)]),
            b0,
            1,
        );

        let mut rules = RuleSet::new();

        rules.op(Opcode::UMax).fallback(LegalizeAction::Lower);
        rules.op(Opcode::Icmp).legal_for(&[&[s1, s32]]);
        rules.op(Opcode::Select).legal_for(&[&[s32]]);

        let legalizer = Legalizer::new(&rules);

        assert_eq!(legalizer.run(&mut f), Ok(true));
        assert_eq!(opcodes(&f, b0), [Opcode::Icmp, Opcode::Select, Opcode::Ret]);
    }
}
