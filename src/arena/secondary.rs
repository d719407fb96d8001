//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022-2023 Evan Cox <evanacox00@gmail.com>. All rights reserved. //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

use crate::arena::ArenaKey;
use smallbitvec::SmallBitVec;
use std::fmt::{Debug, Formatter};
use std::marker::PhantomData;
use std::ops::{Index, IndexMut};
use std::fmt;

/// Intended to be a dense secondary mapping `K -> V` for keys from a primary
/// [`ArenaMap`](super::ArenaMap). This is used to associate extra data with
/// most (but ideally *all*) keys from a given primary map.
///
/// Slots that were never written read back as the map's default value, which
/// makes this suitable for side tables like use counts (default zero) or the
/// defining instruction of a register (default
/// [`PackedOption::none`](crate::utility::PackedOption)). A dense bitset
/// tracks which slots were actually written so removal can restore the
/// default.
///
/// ```
/// # use beryl::dense_arena_key;
/// # use beryl::arena::*;
/// dense_arena_key! { struct Player; }
///
/// let mut players = ArenaMap::new();
/// let p1: Player = players.insert("John");
/// let p2 = players.insert("Bob");
///
/// let mut health = SecondaryMap::new();
/// health.insert(p1, 200);
///
/// assert_eq!(health[p1], 200);
/// assert_eq!(health[p2], 0); // default
/// ```
#[derive(Clone)]
pub struct SecondaryMap<K: ArenaKey, V: Clone> {
    slots: Vec<V>,
    present: SmallBitVec,
    default: V,
    _unused: PhantomData<fn() -> K>,
}

impl<K: ArenaKey, V: Clone + Default> SecondaryMap<K, V> {
    /// Creates an empty map whose unset slots read as `V::default()`.
    #[inline]
    pub fn new() -> Self {
        Self::with_default(V::default())
    }
}

impl<K: ArenaKey, V: Clone> SecondaryMap<K, V> {
    /// Creates an empty map whose unset slots read as `default`.
    #[inline]
    pub fn with_default(default: V) -> Self {
        Self {
            slots: Vec::default(),
            present: SmallBitVec::default(),
            default,
            _unused: PhantomData,
        }
    }

    /// Checks whether `key` was ever explicitly inserted (and not removed).
    #[inline]
    pub fn contains(&self, key: K) -> bool {
        self.present.get(key.key_index()).unwrap_or(false)
    }

    /// Associates `value` with `key`, growing the map as needed.
    pub fn insert(&mut self, key: K, value: V) {
        self.grow_for(key.key_index());

        self.slots[key.key_index()] = value;
        self.present.set(key.key_index(), true);
    }

    /// Restores `key` to the default, returning the previous value if one
    /// was explicitly inserted.
    pub fn remove(&mut self, key: K) -> Option<V> {
        if !self.contains(key) {
            return None;
        }

        let idx = key.key_index();
        let prev = std::mem::replace(&mut self.slots[idx], self.default.clone());

        self.present.set(idx, false);

        Some(prev)
    }

    /// Gets the value for `key` if it was explicitly inserted.
    #[inline]
    pub fn get(&self, key: K) -> Option<&V> {
        if self.contains(key) {
            Some(&self.slots[key.key_index()])
        } else {
            None
        }
    }

    /// Iterates over `(key, value)` pairs that were explicitly inserted.
    pub fn iter(&self) -> impl Iterator<Item = (K, &V)> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(i, _)| self.present.get(*i).unwrap_or(false))
            .map(|(i, v)| (K::key_new(i), v))
    }

    fn grow_for(&mut self, idx: usize) {
        while self.slots.len() <= idx {
            self.slots.push(self.default.clone());
            self.present.push(false);
        }
    }
}

impl<K: ArenaKey, V: Clone + Default> Default for SecondaryMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: ArenaKey, V: Clone> Index<K> for SecondaryMap<K, V> {
    type Output = V;

    fn index(&self, key: K) -> &Self::Output {
        if key.key_index() < self.slots.len() {
            &self.slots[key.key_index()]
        } else {
            &self.default
        }
    }
}

impl<K: ArenaKey, V: Clone> IndexMut<K> for SecondaryMap<K, V> {
    fn index_mut(&mut self, key: K) -> &mut Self::Output {
        self.grow_for(key.key_index());
        self.present.set(key.key_index(), true);

        &mut self.slots[key.key_index()]
    }
}

impl<K, V> Debug for SecondaryMap<K, V>
where
    K: ArenaKey,
    V: Clone + Debug,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        super::debug_write_map(f, "SecondaryMap", self.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dense_arena_key;

    dense_arena_key! { struct E; }

    #[test]
    fn unset_reads_default() {
        let map = SecondaryMap::<E, u32>::new();

        assert_eq!(map[E::key_new(4)], 0);
        assert!(!map.contains(E::key_new(4)));
    }

    #[test]
    fn insert_and_read_back() {
        let mut map = SecondaryMap::<E, u32>::new();
        let k = E::key_new(2);

        map.insert(k, 7);

        assert_eq!(map[k], 7);
        assert!(map.contains(k));
        assert_eq!(map[E::key_new(0)], 0);
        assert!(!map.contains(E::key_new(0)));
    }

    #[test]
    fn index_mut_grows() {
        let mut map = SecondaryMap::<E, u32>::new();
        let k = E::key_new(9);

        map[k] += 3;
        map[k] += 1;

        assert_eq!(map[k], 4);
    }

    #[test]
    fn remove_restores_default() {
        let mut map = SecondaryMap::<E, u32>::with_default(99);
        let k = E::key_new(1);

        map.insert(k, 5);

        assert_eq!(map.remove(k), Some(5));
        assert_eq!(map[k], 99);
        assert_eq!(map.remove(k), None);
    }

    #[test]
    fn iter_skips_unset() {
        let mut map = SecondaryMap::<E, u32>::new();

        map.insert(E::key_new(1), 10);
        map.insert(E::key_new(3), 30);

        let pairs: Vec<_> = map.iter().map(|(k, v)| (k.key_index(), *v)).collect();

        assert_eq!(pairs, [(1, 10), (3, 30)]);
    }
}
