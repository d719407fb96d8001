//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022-2023 Evan Cox <evanacox00@gmail.com>. All rights reserved. //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

use std::fmt::Debug;

/// Models a type that can act as a key for the arena map types.
///
/// Note that in most cases this trait should not be implemented directly,
/// prefer to use the [`dense_arena_key`](crate::dense_arena_key) macro that
/// provides the implementation for you.
pub trait ArenaKey: Copy + Eq + Debug {
    /// Creates a new key from a given arena index. This checks that the index
    /// is representable in the internal storage type, overflowing keys would
    /// silently alias otherwise.
    fn key_new(index: usize) -> Self;

    /// Converts the internal storage type into a `usize` index.
    ///
    /// This conversion is lossless.
    fn key_index(self) -> usize;
}

/// Creates a type-safe key for an [`ArenaMap`](crate::arena::ArenaMap) and
/// associated data structures, with [`u32`] as the underlying data type.
///
/// Note that this also implements `Packable` with the highest value of `u32`
/// being reserved, so these keys can be stored in a
/// [`PackedOption`](crate::utility::PackedOption) at no extra cost.
///
/// ```
/// # use beryl::dense_arena_key;
/// # use beryl::arena::ArenaMap;
/// dense_arena_key! {
///     pub struct DenseRef;
/// }
///
/// type DenseMapping = ArenaMap<DenseRef, String>;
/// ```
#[macro_export]
macro_rules! dense_arena_key {
    ( $(#[$outer:meta])* $vis:vis struct $name:ident; $($rest:tt)* ) => {
        $(#[$outer])*
        #[repr(transparent)]
        #[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
        #[cfg_attr(feature = "enable-serde", derive(serde::Serialize, serde::Deserialize))]
        $vis struct $name(u32);

        impl $crate::arena::ArenaKey for $name {
            #[inline]
            fn key_new(index: usize) -> Self {
                use std::convert::TryInto;

                Self(index.try_into().expect("index is not representable with key type"))
            }

            #[inline]
            fn key_index(self) -> usize {
                self.0 as usize
            }
        }

        impl $crate::utility::Packable for $name {
            #[inline]
            fn reserved_null() -> Self {
                Self(u32::MAX)
            }

            #[inline]
            fn is_reserved_null(&self) -> bool {
                self.0 == u32::MAX
            }
        }

        impl ::std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
                ::std::write!(f, "{}({})", ::std::stringify!($name), self.0)
            }
        }

        $crate::dense_arena_key!($($rest)*);
    };

    () => {}
}

#[cfg(test)]
mod tests {
    use crate::arena::*;
    use crate::dense_arena_key;
    use crate::utility::Packable;
    use static_assertions::assert_eq_size;

    #[test]
    fn reserved_key_works() {
        dense_arena_key! { struct K; }

        let mut map = ArenaMap::<K, i32>::default();

        let k1 = map.insert(15);
        let k2 = map.insert(32);
        let k3 = K::reserved_null();

        assert!(k3.is_reserved_null());
        assert!(!k2.is_reserved_null());
        assert!(!k1.is_reserved_null());
    }

    #[test]
    fn dense_arena_key_is_u32() {
        dense_arena_key! { struct Key; }

        assert_eq_size!(Key, u32);
    }

    #[test]
    fn can_use_dense_arena_key_in_map() {
        dense_arena_key! { struct Key; }

        let mut map = ArenaMap::new();
        let k1: Key = map.insert(1);
        let k2: Key = map.insert(2);
        let k3: Key = map.insert(3);

        assert_eq!(map[k1], 1);
        assert_eq!(map[k2], 2);
        assert_eq!(map[k3], 3);
    }
}
