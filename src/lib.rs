//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022-2023 Evan Cox <evanacox00@gmail.com>. All rights reserved. //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

#![allow(dead_code)]
#![deny(
    unreachable_pub,
    missing_docs,
    missing_abi,
    rust_2018_idioms,
    rustdoc::broken_intra_doc_links,
    rustdoc::private_intra_doc_links
)]

//! # Beryl
//!
//! A generic-MIR legalization engine and call-lowering framework. Target
//! code describes what it can execute through a [`LegalityPolicy`], and the
//! [`Legalizer`] rewrites everything else into equivalent instructions the
//! target accepts. The [`calls`] module turns function entries, returns and
//! call sites into explicit register and stack traffic for a target ABI.
//!
//! [`LegalityPolicy`]: legalize::LegalityPolicy
//! [`Legalizer`]: legalize::Legalizer

pub mod arena;
pub mod arm64;
pub mod calls;
pub mod legalize;
pub mod mir;
pub mod utility;

pub use legalize::Legalizer;
