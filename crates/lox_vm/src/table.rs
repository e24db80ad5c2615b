use std::rc::Rc;

use crate::object::StrRef;

const MAX_LOAD: f64 = 0.75;
const INITIAL_CAPACITY: usize = 8;

enum Slot<V> {
    Empty,
    Tombstone,
    Occupied(StrRef, V),
}

/// Open-addressed hash table with linear probing and tombstone deletion,
/// keyed by interned string references. Backs both the intern pool (as
/// `Table<()>`, via [`find_string`](Table::find_string)) and the global
/// variable environment (`Table<Value>`). Probing uses `hash & (capacity -
/// 1)`, a mask rather than `%`, since capacity is always a power of two.
pub struct Table<V> {
    entries: Vec<Slot<V>>,
    count: usize,
}

impl<V> Table<V> {
    pub fn new() -> Self {
        Table { entries: Vec::new(), count: 0 }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Finds the slot `key` occupies, or the first reusable slot (a
    /// tombstone, or the first empty slot if no tombstone was seen) on the
    /// probe chain. Identity comparison only — callers with raw bytes use
    /// [`find_string`](Table::find_string) instead.
    fn find_slot(entries: &[Slot<V>], key: &StrRef) -> usize {
        let capacity = entries.len();
        let mask = capacity - 1;
        let mut index = (key.hash as usize) & mask;
        let mut tombstone: Option<usize> = None;
        loop {
            match &entries[index] {
                Slot::Empty => return tombstone.unwrap_or(index),
                Slot::Tombstone => {
                    if tombstone.is_none() {
                        tombstone = Some(index);
                    }
                }
                Slot::Occupied(k, _) => {
                    if Rc::ptr_eq(k, key) {
                        return index;
                    }
                }
            }
            index = (index + 1) & mask;
        }
    }

    fn grow(&mut self, new_capacity: usize) {
        let mut new_entries: Vec<Slot<V>> = Vec::with_capacity(new_capacity);
        for _ in 0..new_capacity {
            new_entries.push(Slot::Empty);
        }
        let old_entries = std::mem::replace(&mut self.entries, Vec::new());
        self.count = 0;
        for slot in old_entries {
            if let Slot::Occupied(key, value) = slot {
                let index = Self::find_slot(&new_entries, &key);
                new_entries[index] = Slot::Occupied(key, value);
                self.count += 1;
            }
        }
        self.entries = new_entries;
    }

    fn ensure_capacity(&mut self) {
        if self.capacity() == 0 {
            self.grow(INITIAL_CAPACITY);
        } else if (self.count + 1) as f64 > self.capacity() as f64 * MAX_LOAD {
            self.grow(self.capacity() * 2);
        }
    }

    /// Inserts or overwrites. Returns `true` if this was a new key (the slot
    /// was empty or a tombstone), `false` if it overwrote a live entry —
    /// `SET_GLOBAL` depends on this signal to detect undefined-variable
    /// assignment.
    pub fn set(&mut self, key: StrRef, value: V) -> bool {
        self.ensure_capacity();
        let index = Self::find_slot(&self.entries, &key);
        let is_new = !matches!(self.entries[index], Slot::Occupied(..));
        if is_new && matches!(self.entries[index], Slot::Empty) {
            self.count += 1;
        }
        self.entries[index] = Slot::Occupied(key, value);
        is_new
    }

    pub fn get(&self, key: &StrRef) -> Option<&V> {
        if self.capacity() == 0 {
            return None;
        }
        let index = Self::find_slot(&self.entries, key);
        match &self.entries[index] {
            Slot::Occupied(_, v) => Some(v),
            _ => None,
        }
    }

    pub fn delete(&mut self, key: &StrRef) -> bool {
        if self.capacity() == 0 {
            return false;
        }
        let index = Self::find_slot(&self.entries, key);
        if matches!(self.entries[index], Slot::Occupied(..)) {
            self.entries[index] = Slot::Tombstone;
            true
        } else {
            false
        }
    }

    /// Byte-wise lookup, used only during string interning: compares
    /// `(length, hash, chars)` rather than reference identity, since at
    /// this point no `StrRef` for `chars` exists yet.
    pub fn find_string(&self, chars: &str, hash: u32) -> Option<StrRef> {
        if self.capacity() == 0 {
            return None;
        }
        let mask = self.capacity() - 1;
        let mut index = (hash as usize) & mask;
        loop {
            match &self.entries[index] {
                Slot::Empty => return None,
                Slot::Tombstone => {}
                Slot::Occupied(key, _) => {
                    if key.hash == hash && key.chars.as_ref() == chars {
                        return Some(Rc::clone(key));
                    }
                }
            }
            index = (index + 1) & mask;
        }
    }
}

impl<V> Default for Table<V> {
    fn default() -> Self {
        Table::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::LoxString;

    fn s(text: &str) -> StrRef {
        Rc::new(LoxString::new(text))
    }

    #[test]
    fn set_and_get_round_trip() {
        let mut t: Table<i32> = Table::new();
        let k = s("a");
        assert!(t.set(Rc::clone(&k), 1));
        assert_eq!(t.get(&k), Some(&1));
    }

    #[test]
    fn set_existing_key_returns_false_and_overwrites() {
        let mut t: Table<i32> = Table::new();
        let k = s("a");
        assert!(t.set(Rc::clone(&k), 1));
        assert!(!t.set(Rc::clone(&k), 2));
        assert_eq!(t.get(&k), Some(&2));
    }

    #[test]
    fn delete_then_get_is_none_but_probe_chain_survives() {
        let mut t: Table<i32> = Table::new();
        let a = s("a");
        let b = s("b");
        t.set(Rc::clone(&a), 1);
        t.set(Rc::clone(&b), 2);
        assert!(t.delete(&a));
        assert_eq!(t.get(&a), None);
        assert_eq!(t.get(&b), Some(&2));
    }

    #[test]
    fn grows_past_load_factor() {
        let mut t: Table<i32> = Table::new();
        let keys: Vec<StrRef> = (0..20).map(|i| s(&format!("k{i}"))).collect();
        for (i, k) in keys.iter().enumerate() {
            t.set(Rc::clone(k), i as i32);
        }
        for (i, k) in keys.iter().enumerate() {
            assert_eq!(t.get(k), Some(&(i as i32)));
        }
    }

    #[test]
    fn find_string_dedups_by_bytes() {
        let mut t: Table<()> = Table::new();
        let a = s("hello");
        t.set(Rc::clone(&a), ());
        let found = t.find_string("hello", fnv(b"hello"));
        assert!(found.is_some());
        assert!(Rc::ptr_eq(&found.unwrap(), &a));
    }

    fn fnv(bytes: &[u8]) -> u32 {
        crate::object::fnv1a_hash(bytes)
    }
}
