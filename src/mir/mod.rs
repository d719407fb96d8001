//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022-2023 Evan Cox <evanacox00@gmail.com>. All rights reserved. //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

//! The machine-level IR that the legalizer transforms.
//!
//! This is a flat, register-based representation. Every value is a virtual
//! register with a low-level type ([`Llt`]), instructions are opcode plus
//! operand list ([`InstData`]), and a [`FunctionBody`] owns the arenas that
//! instructions, blocks and registers live in.
//!
//! All mutation during legalization goes through an [`ObservedBody`], which
//! reports creations, rewrites and erasures to a [`ChangeObserver`] so the
//! driver's worklists never go stale.

mod body;
mod inst;
mod observe;
mod reg;
mod types;

pub use body::*;
pub use inst::*;
pub use observe::*;
pub use reg::*;
pub use types::*;
