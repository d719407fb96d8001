//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022-2023 Evan Cox <evanacox00@gmail.com>. All rights reserved. //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

//! The legalization engine.
//!
//! Rewrites a [`FunctionBody`](crate::mir::FunctionBody) until every
//! instruction is one the target's [`LegalityPolicy`] accepts. The driver
//! runs a worklist to a fixed point, one queue for ordinary instructions
//! and one for the cast/merge artifacts that rewrites leave behind, with an
//! artifact combiner folding matching producer/consumer pairs away.

mod action;
mod classify;
mod combine;
mod driver;
mod helper;
mod worklist;

pub use action::*;
pub use classify::*;
pub use combine::*;
pub use driver::*;
pub use helper::*;
pub use worklist::*;
