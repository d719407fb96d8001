//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022-2023 Evan Cox <evanacox00@gmail.com>. All rights reserved. //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

use crate::arena;
use crate::arena::ArenaKey;
use std::fmt::{Debug, Formatter};
use std::marker::PhantomData;
use std::ops::{Index, IndexMut};
use std::{fmt, slice};

#[cfg(feature = "enable-serde")]
use serde::{Deserialize, Serialize};

/// This is meant to act as a primary mapping of `K -> V`, where `K` is some
/// key type and `V` is the value being stored. Other mappings that use the
/// same key as an existing [`ArenaMap`] should use
/// [`SecondaryMap`](super::SecondaryMap) instead.
///
/// This is effectively a typed wrapper around `Vec<T>`, the main advantage is
/// that it does not implicitly convert into array types (i.e. it actually
/// acts like a map instead of a sequence) and it only allows indexing with
/// the correct type.
///
/// ```
/// # use beryl::dense_arena_key;
/// # use beryl::arena::ArenaMap;
/// dense_arena_key! {
///     struct Name;
/// }
///
/// let mut blocks = ArenaMap::new();
/// let bb: Name = blocks.insert("Hello!");
///
/// assert_eq!(blocks[bb], "Hello!");
/// ```
#[derive(Clone)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct ArenaMap<K: ArenaKey, V> {
    slots: Vec<V>,
    _unused: PhantomData<fn() -> K>,
}

impl<K: ArenaKey, V> ArenaMap<K, V> {
    /// Creates a new, empty arena. This creates the underlying [`Vec`] with
    /// [`Vec::default`].
    #[inline]
    pub fn new() -> Self {
        Self {
            slots: Vec::default(),
            _unused: PhantomData,
        }
    }

    /// Creates an empty arena with an initial capacity. This creates the
    /// underlying [`Vec`] with [`Vec::with_capacity`].
    #[inline]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            _unused: PhantomData,
        }
    }

    /// Checks if the arena contains a given key, i.e. whether a given key
    /// has been returned from [`Self::insert`] at some point.
    #[inline]
    pub fn contains(&self, key: K) -> bool {
        key.key_index() < self.slots.len()
    }

    /// Accesses the arena and gets the value associated with a given key.
    /// If the key doesn't exist, `None` is returned.
    #[inline]
    pub fn get(&self, key: K) -> Option<&V> {
        self.slots.get(key.key_index())
    }

    /// Accesses the arena and gets the value associated with a given key,
    /// mutably. If the key doesn't exist, `None` is returned.
    #[inline]
    pub fn get_mut(&mut self, key: K) -> Option<&mut V> {
        self.slots.get_mut(key.key_index())
    }

    /// Adds an item into the arena, and returns a key that can be used to
    /// access that data later.
    #[inline]
    pub fn insert(&mut self, value: V) -> K {
        self.slots.push(value);

        K::key_new(self.slots.len() - 1)
    }

    /// Gets the key that *will be* returned by [`Self::insert`] when it's
    /// called next. This key is not valid until that [`Self::insert`] call
    /// occurs.
    #[inline]
    pub fn next_key(&self) -> K {
        K::key_new(self.slots.len())
    }

    /// Gets the number of elements that have been pushed into the arena.
    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Checks if the arena has had any elements pushed into it.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Returns an iterator that iterates over the (valid) keys of the arena.
    /// Keys are yielded in increasing insertion order.
    pub fn keys(&self) -> impl DoubleEndedIterator<Item = K> + ExactSizeIterator {
        (0..self.slots.len()).map(K::key_new)
    }

    /// Returns an iterator that iterates over the values in the arena.
    pub fn values(&self) -> slice::Iter<'_, V> {
        self.slots.as_slice().iter()
    }

    /// Returns an iterator that iterates over the values in the arena,
    /// giving mutable references instead of shared references.
    pub fn values_mut(&mut self) -> slice::IterMut<'_, V> {
        self.slots.as_mut_slice().iter_mut()
    }

    /// Returns an iterator that iterates over the values in the arena,
    /// and the keys that map to those values.
    pub fn iter(&self) -> impl Iterator<Item = (K, &V)> + ExactSizeIterator {
        self.values()
            .enumerate()
            .map(|(i, value)| (K::key_new(i), value))
    }

    /// Returns an iterator that iterates over the values in the arena,
    /// and the keys that map to those values. Returns mutable references
    /// instead of shared references.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (K, &mut V)> + ExactSizeIterator {
        self.values_mut()
            .enumerate()
            .map(|(i, value)| (K::key_new(i), value))
    }
}

impl<K: ArenaKey, T> Default for ArenaMap<K, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> PartialEq for ArenaMap<K, V>
where
    K: ArenaKey,
    V: PartialEq,
{
    fn eq(&self, other: &Self) -> bool {
        self.values().eq(other.values())
    }
}

impl<K, V> Eq for ArenaMap<K, V>
where
    K: ArenaKey,
    V: Eq,
{
}

impl<K, V> Debug for ArenaMap<K, V>
where
    K: ArenaKey,
    V: Debug,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        arena::debug_write_map(f, "ArenaMap", self.iter())
    }
}

impl<K: ArenaKey, T> Index<K> for ArenaMap<K, T> {
    type Output = T;

    fn index(&self, key: K) -> &Self::Output {
        self.slots
            .get(key.key_index())
            .expect("tried to access invalid key on `ArenaMap`")
    }
}

impl<K: ArenaKey, T> IndexMut<K> for ArenaMap<K, T> {
    fn index_mut(&mut self, key: K) -> &mut Self::Output {
        &mut self.slots[key.key_index()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dense_arena_key;

    dense_arena_key! { struct E; }

    #[test]
    #[should_panic(expected = "tried to access invalid key on `ArenaMap`")]
    fn out_of_bounds() {
        // hide the stack trace, assuming this test panics as it's supposed to.
        std::panic::set_hook(Box::new(|_| {}));

        let mut m1 = ArenaMap::<E, i32>::new();
        let m2 = ArenaMap::<E, i32>::new();

        let k = m1.insert(6);

        let _ = m2[k];
    }

    #[test]
    fn insert() {
        let mut m = ArenaMap::new();
        let k0: E = m.insert(12);
        let k1 = m.insert(33);

        assert_eq!(m[k0], 12);
        assert_eq!(m[k1], 33);
        assert_eq!(&mut m[k1], &mut 33);

        let v: Vec<E> = m.keys().collect();
        assert_eq!(v, [k0, k1]);
    }

    #[test]
    fn next_key() {
        let mut m = ArenaMap::new();
        let k0: E = m.next_key();
        let k1 = m.insert(12);

        assert_eq!(k0, k1);
        assert_eq!(m[k0], m[k1]);
    }

    #[test]
    fn get() {
        let mut m = ArenaMap::new();
        let k0: E = m.insert(12);
        let k1 = m.next_key();

        assert_eq!(m.get(k0), Some(&12));
        assert_eq!(m.get(k1), None);
    }

    #[test]
    fn len_is_empty() {
        let mut m = ArenaMap::<E, i32>::new();

        assert_eq!(m.len(), 0);
        assert!(m.is_empty());

        m.insert(15);

        assert_eq!(m.len(), 1);
        assert!(!m.is_empty());
    }

    #[test]
    fn iter() {
        let mut m: ArenaMap<E, usize> = ArenaMap::new();

        m.insert(12);
        m.insert(33);

        let mut i = 0;

        for (key, value) in m.iter() {
            assert_eq!(key.key_index(), i);
            match i {
                0 => assert_eq!(*value, 12),
                1 => assert_eq!(*value, 33),
                _ => panic!(),
            }
            i += 1;
        }
    }

    #[test]
    fn contiguous_keys() {
        let mut m: ArenaMap<E, i32> = ArenaMap::new();
        let mut prev: E = E::key_new(0);

        for i in 0..100 {
            m.insert(i);
        }

        for key in m.keys().skip(1) {
            assert_eq!(prev.key_index(), key.key_index() - 1);

            prev = key;
        }
    }
}
