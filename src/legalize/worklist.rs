//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022-2023 Evan Cox <evanacox00@gmail.com>. All rights reserved. //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

use crate::mir::Inst;
use crate::utility::SaHashSet;

/// A LIFO worklist of instructions with duplicate suppression.
///
/// The list starts in a staging phase: [`deferred_insert`](Self::deferred_insert)
/// accumulates the seed without making anything poppable, then
/// [`finalize`](Self::finalize) flips the list into its active phase.
/// Once active, [`insert`](Self::insert) pushes to the top.
///
/// Removal is lazy. [`remove`](Self::remove) only drops the instruction
/// from the presence set, stale stack entries are skipped on pop. An
/// instruction re-inserted after removal is yielded again.
pub struct InstWorklist {
    stack: Vec<Inst>,
    present: SaHashSet<Inst>,
    finalized: bool,
}

impl InstWorklist {
    /// Creates an empty worklist in the staging phase.
    pub fn new() -> Self {
        Self {
            stack: Vec::default(),
            present: SaHashSet::default(),
            finalized: false,
        }
    }

    /// Stages `inst` during the seeding phase. No effect if it is already
    /// staged.
    pub fn deferred_insert(&mut self, inst: Inst) {
        debug_assert!(!self.finalized, "worklist was already finalized");

        if self.present.insert(inst) {
            self.stack.push(inst);
        }
    }

    /// Ends the staging phase. Staged instructions become poppable, with
    /// the last-staged one on top.
    pub fn finalize(&mut self) {
        debug_assert!(!self.finalized, "worklist was already finalized");

        self.finalized = true;
    }

    /// Pushes `inst` onto the top of the active list. No effect if it is
    /// already pending.
    pub fn insert(&mut self, inst: Inst) {
        debug_assert!(self.finalized, "worklist was not finalized yet");

        if self.present.insert(inst) {
            self.stack.push(inst);
        }
    }

    /// Drops `inst` from the pending set if it is there.
    pub fn remove(&mut self, inst: Inst) {
        self.present.remove(&inst);
    }

    /// Checks whether `inst` is pending.
    pub fn contains(&self, inst: Inst) -> bool {
        self.present.contains(&inst)
    }

    /// Pops the most recently pushed pending instruction.
    pub fn pop(&mut self) -> Option<Inst> {
        debug_assert!(self.finalized, "worklist was not finalized yet");

        while let Some(inst) = self.stack.pop() {
            if self.present.remove(&inst) {
                return Some(inst);
            }
        }

        None
    }

    /// The number of pending instructions.
    pub fn len(&self) -> usize {
        self.present.len()
    }

    /// Checks if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.present.is_empty()
    }
}

impl Default for InstWorklist {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::ArenaKey;

    fn inst(n: usize) -> Inst {
        Inst::key_new(n)
    }

    #[test]
    fn staged_pops_in_lifo_order() {
        let mut wl = InstWorklist::new();

        wl.deferred_insert(inst(0));
        wl.deferred_insert(inst(1));
        wl.deferred_insert(inst(2));
        wl.finalize();

        assert_eq!(wl.len(), 3);
        assert_eq!(wl.pop(), Some(inst(2)));
        assert_eq!(wl.pop(), Some(inst(1)));
        assert_eq!(wl.pop(), Some(inst(0)));
        assert_eq!(wl.pop(), None);
    }

    #[test]
    fn duplicates_are_suppressed() {
        let mut wl = InstWorklist::new();

        wl.deferred_insert(inst(0));
        wl.deferred_insert(inst(0));
        wl.finalize();
        wl.insert(inst(1));
        wl.insert(inst(1));

        assert_eq!(wl.len(), 2);
        assert_eq!(wl.pop(), Some(inst(1)));
        assert_eq!(wl.pop(), Some(inst(0)));
        assert_eq!(wl.pop(), None);
    }

    #[test]
    fn removal_is_lazy_but_effective() {
        let mut wl = InstWorklist::new();

        wl.deferred_insert(inst(0));
        wl.deferred_insert(inst(1));
        wl.finalize();
        wl.remove(inst(1));

        assert!(!wl.contains(inst(1)));
        assert_eq!(wl.pop(), Some(inst(0)));
        assert_eq!(wl.pop(), None);
    }

    #[test]
    fn reinsert_after_remove_is_yielded_once() {
        let mut wl = InstWorklist::new();

        wl.deferred_insert(inst(0));
        wl.finalize();
        wl.remove(inst(0));
        wl.insert(inst(0));

        assert_eq!(wl.pop(), Some(inst(0)));
        assert_eq!(wl.pop(), None);
    }

    #[test]
    fn pop_after_reprocess_insert() {
        let mut wl = InstWorklist::new();

        wl.deferred_insert(inst(0));
        wl.finalize();

        assert_eq!(wl.pop(), Some(inst(0)));

        // processing mutated it, observer re-inserts
        wl.insert(inst(0));

        assert_eq!(wl.pop(), Some(inst(0)));
        assert_eq!(wl.pop(), None);
    }
}
