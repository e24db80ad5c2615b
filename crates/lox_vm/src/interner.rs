use std::rc::Rc;

use crate::object::{fnv1a_hash, LoxString, StrRef};
use crate::table::Table;

/// The string-intern pool. Backed by the same open-addressed table used for
/// globals, keyed on nothing but used purely as a deduplicating set via
/// [`Table::find_string`].
#[derive(Default)]
pub struct Interner {
    strings: Table<()>,
}

impl Interner {
    pub fn new() -> Self {
        Interner { strings: Table::new() }
    }

    /// Returns the unique interned reference for `text`, allocating and
    /// registering a new `LoxString` only if one isn't already interned.
    pub fn intern(&mut self, text: &str) -> StrRef {
        let hash = fnv1a_hash(text.as_bytes());
        if let Some(existing) = self.strings.find_string(text, hash) {
            return existing;
        }
        let s = Rc::new(LoxString { chars: text.into(), hash });
        self.strings.set(Rc::clone(&s), ());
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_same_bytes_yields_same_reference() {
        let mut i = Interner::new();
        let a = i.intern("hello");
        let b = i.intern("hello");
        assert!(Rc::ptr_eq(&a, &b));
    }

    #[test]
    fn interning_different_bytes_yields_different_references() {
        let mut i = Interner::new();
        let a = i.intern("hello");
        let b = i.intern("world");
        assert!(!Rc::ptr_eq(&a, &b));
    }
}
