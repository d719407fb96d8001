//======---------------------------------------------------------------======//
//                                                                           //
// Copyright 2022-2023 Evan Cox <evanacox00@gmail.com>. All rights reserved. //
//                                                                           //
// Use of this source code is governed by a BSD-style license that can be    //
// found in the LICENSE.txt file at the root of this project, or at the      //
// following link: https://opensource.org/licenses/BSD-3-Clause              //
//                                                                           //
//======---------------------------------------------------------------======//

use std::fmt::{Debug, Formatter, Result};
use std::mem;

#[cfg(feature = "enable-serde")]
use serde::{Deserialize, Serialize};

/// Helper trait for a type that can be packed into a `PackedOption`.
///
/// These types need to have some null-ish value that they can reserve,
/// that value will be used to distinguish between `None` and `Some`.
/// Arena keys reserve their maximum index for this purpose.
pub trait Packable: Copy {
    /// Returns the reserved null value of the type.
    fn reserved_null() -> Self;

    /// Checks whether `self` is the reserved null value.
    fn is_reserved_null(&self) -> bool;
}

/// Provides an [`Option`]-like type for (valid) arena keys without paying
/// any extra cost to store the flag. It takes up exactly as much space as
/// the key would on its own, while also storing whether or not the key
/// actually exists.
///
/// Relies on the null state of a key to distinguish between "none" and "some".
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct PackedOption<T: Packable>(T);

impl<T: Packable> PackedOption<T> {
    /// Creates a `None` instance of `PackedOption`.
    #[inline]
    pub fn none() -> Self {
        Self(T::reserved_null())
    }

    /// Creates a `Some` instance of `PackedOption`.
    ///
    /// `value` must not be the reserved null value.
    #[inline]
    pub fn some(value: T) -> Self {
        debug_assert!(!value.is_reserved_null());

        Self(value)
    }

    /// Returns `true` if the packed option is a `None` value.
    #[inline]
    pub fn is_none(&self) -> bool {
        self.0.is_reserved_null()
    }

    /// Returns `true` if the packed option is a `Some` value.
    #[inline]
    pub fn is_some(&self) -> bool {
        !self.is_none()
    }

    /// Expand the packed option into a normal `Option` that can
    /// be pattern-matched on as expected.
    #[inline]
    pub fn expand(self) -> Option<T> {
        if self.is_none() {
            None
        } else {
            Some(self.0)
        }
    }

    /// Maps a `PackedOption<T>` to `Option<U>` by applying a function to a
    /// contained value.
    #[inline]
    pub fn map<U, F>(self, f: F) -> Option<U>
    where
        F: FnOnce(T) -> U,
    {
        self.expand().map(f)
    }

    /// Unwrap a packed `Some` value or panic with `msg`.
    #[inline]
    pub fn expect(self, msg: &str) -> T {
        self.expand().expect(msg)
    }

    /// Takes the value out of the packed option, leaving a `None` in its place.
    #[inline]
    pub fn take(&mut self) -> Option<T> {
        mem::replace(self, Self::none()).expand()
    }
}

impl<T: Packable> Default for PackedOption<T> {
    fn default() -> Self {
        Self::none()
    }
}

impl<T: Packable> From<Option<T>> for PackedOption<T> {
    fn from(opt: Option<T>) -> Self {
        match opt {
            None => Self::none(),
            Some(t) => Self::some(t),
        }
    }
}

impl<T: Packable> From<PackedOption<T>> for Option<T> {
    fn from(opt: PackedOption<T>) -> Self {
        opt.expand()
    }
}

impl<T> Debug for PackedOption<T>
where
    T: Packable + Debug,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        self.expand().fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    struct Small(u8);

    impl Packable for Small {
        fn reserved_null() -> Self {
            Small(u8::MAX)
        }

        fn is_reserved_null(&self) -> bool {
            self.0 == u8::MAX
        }
    }

    #[test]
    fn observer_methods() {
        let none = PackedOption::<Small>::default();
        let some = PackedOption::some(Small(15));

        assert_eq!(none.is_none(), true);
        assert_eq!(none.is_some(), false);
        assert_eq!(some.is_none(), false);
        assert_eq!(some.is_some(), true);
        assert_eq!(some.expand(), Some(Small(15)));
    }

    #[test]
    fn take_leaves_none() {
        let mut opt = PackedOption::some(Small(3));

        assert_eq!(opt.take(), Some(Small(3)));
        assert_eq!(opt.is_none(), true);
        assert_eq!(opt.take(), None);
    }

    #[test]
    fn no_extra_storage() {
        use static_assertions::assert_eq_size;

        assert_eq_size!(PackedOption<Small>, Small);
    }
}
