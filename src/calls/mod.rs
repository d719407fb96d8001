//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022-2023 Evan Cox <evanacox00@gmail.com>. All rights reserved. //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

//! Generic call lowering.
//!
//! Turns function entries, returns and call sites into explicit register
//! copies, stack traffic and call instructions, driven by a target-supplied
//! [`TargetAbi`]. Values are split into machine-sized parts, handed to the
//! convention's assignment function, and marshalled by one of three
//! [`ValueHandler`] roles depending on which side of the boundary they
//! cross. Call sites in tail position are lowered as tail branches when the
//! eligibility checks allow it.

mod args;
mod handler;
mod lower;

pub use args::*;
pub use handler::*;
pub use lower::*;
