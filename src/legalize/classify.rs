//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022-2023 Evan Cox <evanacox00@gmail.com>. All rights reserved. //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

use crate::mir::{InstData, Opcode};

/// How the driver routes an instruction.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum InstClass {
    /// A cast/merge connective that rewrites leave behind. These go to the
    /// artifact queue and are given to the artifact combiner first.
    Artifact,
    /// A generic instruction that goes to the main queue and is legalized
    /// against the policy.
    Ordinary,
    /// A machine-level instruction the engine does not process at all.
    NotApplicable,
}

/// Classifies an instruction for worklist routing.
///
/// Classification depends only on the opcode, so an in-place rewrite that
/// changes the opcode can move an instruction between queues.
pub fn classify(data: &InstData) -> InstClass {
    match data.opcode() {
        Opcode::ImplicitDef
        | Opcode::Trunc
        | Opcode::Sext
        | Opcode::Zext
        | Opcode::Anyext
        | Opcode::MergeValues
        | Opcode::UnmergeValues
        | Opcode::ConcatVectors
        | Opcode::BuildVector
        | Opcode::Extract
        | Opcode::Insert => InstClass::Artifact,

        Opcode::Ret
        | Opcode::Call
        | Opcode::TailCall
        | Opcode::AdjustStackDown
        | Opcode::AdjustStackUp => InstClass::NotApplicable,

        _ => InstClass::Ordinary,
    }
}
