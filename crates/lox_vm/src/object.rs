use std::rc::Rc;

use crate::chunk::Chunk;
use crate::value::Value;

const FNV_OFFSET_BASIS: u32 = 2166136261;
const FNV_PRIME: u32 = 16777619;

/// FNV-1a over raw bytes, matching the reference VM's `HashString`.
pub fn fnv1a_hash(bytes: &[u8]) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// An interned, heap-allocated Lox string. Two `StrRef`s are equal as Lox
/// values iff they point at the same `LoxString` — interning guarantees
/// that equal byte sequences always share one allocation.
#[derive(Debug)]
pub struct LoxString {
    pub chars: Box<str>,
    pub hash: u32,
}

pub type StrRef = Rc<LoxString>;

impl LoxString {
    pub fn new(chars: &str) -> Self {
        LoxString {
            chars: chars.into(),
            hash: fnv1a_hash(chars.as_bytes()),
        }
    }
}

/// A compiled function: name (absent for the top-level script), arity, and
/// its own chunk of bytecode.
#[derive(Debug)]
pub struct ObjFunction {
    pub name: Option<StrRef>,
    pub arity: u8,
    pub chunk: Chunk,
}

impl ObjFunction {
    pub fn new(name: Option<StrRef>) -> Self {
        ObjFunction {
            name,
            arity: 0,
            chunk: Chunk::new(),
        }
    }

    pub fn display_name(&self) -> String {
        match &self.name {
            Some(n) => format!("<fn {}>", n.chars),
            None => "<script>".to_string(),
        }
    }
}

/// Wraps an [`ObjFunction`]. Carries no captured environment: functions in
/// this VM only ever reach enclosing state through globals, by name. The
/// opcode and object variant exist so a future revision could add real
/// upvalues without changing the calling convention.
#[derive(Debug)]
pub struct ObjClosure {
    pub function: Rc<ObjFunction>,
}

pub type NativeFn = fn(&[Value]) -> Result<Value, String>;

pub struct ObjNative {
    pub name: StrRef,
    pub function: NativeFn,
}

impl std::fmt::Debug for ObjNative {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ObjNative({})", self.name.chars)
    }
}
