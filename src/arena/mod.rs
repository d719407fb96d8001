//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022-2023 Evan Cox <evanacox00@gmail.com>. All rights reserved. //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

//! A simple typed arena module.
//!
//! The primary arena does not allow deletion and hands out dense `u32` keys,
//! while [`SecondaryMap`] associates extra data with keys from a primary map.
//! Instructions, blocks and virtual registers all live in these arenas, so
//! a key is the universal currency for naming an entity anywhere in the
//! legalizer.
//!
//! Very similar to `id_arena` and other simple typed arena crates, except
//! this one ties in better with the specific needs of this crate (and does
//! less safety checks in exchange for significantly reduced overhead per
//! slot).

mod key;
mod map;
mod secondary;

pub use key::ArenaKey;
pub use map::ArenaMap;
pub use secondary::SecondaryMap;

use std::fmt;
use std::fmt::{Debug, Formatter};

pub(in crate::arena) fn debug_write_map<'a, K, V>(
    f: &mut Formatter<'_>,
    name: &'static str,
    it: impl Iterator<Item = (K, &'a V)>,
) -> fmt::Result
where
    K: ArenaKey,
    V: Debug + 'a,
{
    write!(f, "{name} ")?;

    f.debug_map().entries(it).finish()
}
