//! The runtime value model.
//!
//! Every Cinder value is an [`Object`] living in a [`Heap`] slot and named
//! by an [`ObjRef`]. Values are a closed set of variants; the capability
//! operations (hash, compare, copy, count, coercions, printing) dispatch by
//! match and live as methods on the heap, since most of them need to read
//! through references.
//!
//! `none`, `true` and `false` are static singletons at fixed slots, so
//! reference equality is identity for them.

use std::fmt::Write;

use crate::error::{Error, ErrorKind};
use crate::runtime::heap::Heap;
use crate::runtime::map::MapData;

/// A reference to a heap slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjRef(pub(crate) u32);

impl ObjRef {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Instance flag: the object is not heap-owned and must never be freed.
pub const FLAG_STATIC: u8 = 1;

/// Host function signature for native functions.
pub type HostFn = fn(&mut Heap, &[ObjRef]) -> Result<Vec<ObjRef>, Error>;

/// A host callable exposed to scripts.
#[derive(Clone, Copy)]
pub struct NativeFn {
    pub name: &'static str,
    /// Expected argument count; `None` accepts any arity.
    pub argc: Option<usize>,
    pub func: HostFn,
}

impl std::fmt::Debug for NativeFn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NativeFn({})", self.name)
    }
}

#[derive(Debug)]
pub enum ObjectKind {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<ObjRef>),
    Map(MapData),

    /// A scope chain link: `vars` is the scope's variable map, `prev` the
    /// enclosing scope. The chain is built once and never relinked, so it is
    /// acyclic by construction.
    Closure { vars: ObjRef, prev: Option<ObjRef> },

    /// A script function: the executable it was compiled into, its entry
    /// instruction, its arity, and the scope it closed over.
    Function {
        exe: usize,
        entry: usize,
        argc: usize,
        captured: ObjRef,
    },

    Native(NativeFn),
}

#[derive(Debug)]
pub struct Object {
    pub kind: ObjectKind,
    pub flags: u8,
}

impl Object {
    pub fn new(kind: ObjectKind) -> Self {
        Object { kind, flags: 0 }
    }

    pub fn is_static(&self) -> bool {
        self.flags & FLAG_STATIC != 0
    }

    pub fn type_desc(&self) -> &'static TypeDesc {
        type_desc_of(&self.kind)
    }

    /// Passes every outgoing object reference to the visitor, as a writable
    /// slot so a relocating collector could rewrite it.
    pub fn walk(&mut self, visit: &mut dyn FnMut(&mut ObjRef)) {
        match &mut self.kind {
            ObjectKind::List(items) => {
                for item in items {
                    visit(item);
                }
            }
            ObjectKind::Map(map) => map.walk(visit),
            ObjectKind::Closure { vars, prev } => {
                visit(vars);
                if let Some(prev) = prev {
                    visit(prev);
                }
            }
            ObjectKind::Function { captured, .. } => visit(captured),
            _ => {}
        }
    }
}

// =============================================================================
// TYPE DESCRIPTORS
// =============================================================================

/// Classification tag on the builtin scalar types, used to pick coercion
/// fast paths without inspecting the value itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Atomic {
    None,
    Bool,
    Int,
    Float,
    Str,
}

/// Process-wide descriptor for a builtin type.
#[derive(Debug)]
pub struct TypeDesc {
    pub name: &'static str,
    pub atomic: Option<Atomic>,
}

pub static TYPE_NONE: TypeDesc = TypeDesc {
    name: "none",
    atomic: Some(Atomic::None),
};
pub static TYPE_BOOL: TypeDesc = TypeDesc {
    name: "bool",
    atomic: Some(Atomic::Bool),
};
pub static TYPE_INT: TypeDesc = TypeDesc {
    name: "int",
    atomic: Some(Atomic::Int),
};
pub static TYPE_FLOAT: TypeDesc = TypeDesc {
    name: "float",
    atomic: Some(Atomic::Float),
};
pub static TYPE_STR: TypeDesc = TypeDesc {
    name: "string",
    atomic: Some(Atomic::Str),
};
pub static TYPE_LIST: TypeDesc = TypeDesc {
    name: "list",
    atomic: None,
};
pub static TYPE_MAP: TypeDesc = TypeDesc {
    name: "map",
    atomic: None,
};
pub static TYPE_CLOSURE: TypeDesc = TypeDesc {
    name: "closure",
    atomic: None,
};
pub static TYPE_FUNCTION: TypeDesc = TypeDesc {
    name: "function",
    atomic: None,
};
pub static TYPE_NATIVE: TypeDesc = TypeDesc {
    name: "native function",
    atomic: None,
};

// =============================================================================
// CAPABILITIES
// =============================================================================

const FNV_OFFSET: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

impl Heap {
    pub fn type_name(&self, r: ObjRef) -> &'static str {
        self.get(r).type_desc().name
    }

    /// Hash capability. Only the immutable scalars are hashable; everything
    /// else fails, which is what makes composite values unusable as map keys.
    pub fn key_hash(&self, r: ObjRef) -> Result<u64, Error> {
        match &self.get(r).kind {
            ObjectKind::None => Ok(0x6e6f6e65),
            ObjectKind::Bool(b) => Ok(if *b { 1 } else { 2 }),
            ObjectKind::Int(v) => Ok(*v as u64),
            ObjectKind::Float(v) => {
                // 0.0 and -0.0 compare equal, so they must hash equally too.
                let v = if *v == 0.0 { 0.0 } else { *v };
                Ok(v.to_bits())
            }
            ObjectKind::Str(s) => Ok(fnv1a(s.as_bytes())),
            other => Err(Error::user(
                ErrorKind::UnhashableKey,
                format!("value of type {} cannot be hashed", type_desc_of(other).name),
            )),
        }
    }

    /// Compare capability: structural equality for scalars of the same type,
    /// identity for everything else. Values of different types are unequal.
    pub fn compare(&self, a: ObjRef, b: ObjRef) -> bool {
        if a == b {
            return true;
        }
        match (&self.get(a).kind, &self.get(b).kind) {
            (ObjectKind::None, ObjectKind::None) => true,
            (ObjectKind::Bool(x), ObjectKind::Bool(y)) => x == y,
            (ObjectKind::Int(x), ObjectKind::Int(y)) => x == y,
            (ObjectKind::Float(x), ObjectKind::Float(y)) => x == y,
            (ObjectKind::Str(x), ObjectKind::Str(y)) => x == y,
            _ => false,
        }
    }

    /// Copy capability, used when a value becomes a map key. Singletons copy
    /// to themselves; scalars are duplicated so later mutation of the
    /// caller's object can never disturb the map's hash stability.
    pub fn copy_value(&mut self, r: ObjRef) -> Result<ObjRef, Error> {
        let kind = match &self.get(r).kind {
            ObjectKind::None | ObjectKind::Bool(_) => return Ok(r),
            ObjectKind::Int(v) => ObjectKind::Int(*v),
            ObjectKind::Float(v) => ObjectKind::Float(*v),
            ObjectKind::Str(s) => ObjectKind::Str(s.clone()),
            other => {
                return Err(Error::user(
                    ErrorKind::UnhashableKey,
                    format!(
                        "value of type {} cannot be used as a map key",
                        type_desc_of(other).name
                    ),
                ));
            }
        };
        self.alloc(kind)
    }

    /// Count capability: cardinality of collections, character count of
    /// strings.
    pub fn count(&self, r: ObjRef) -> Result<i64, Error> {
        match &self.get(r).kind {
            ObjectKind::Str(s) => Ok(s.chars().count() as i64),
            ObjectKind::List(items) => Ok(items.len() as i64),
            ObjectKind::Map(map) => Ok(map.count() as i64),
            other => Err(Error::user(
                ErrorKind::Runtime,
                format!("value of type {} has no count", type_desc_of(other).name),
            )),
        }
    }

    pub fn to_bool(&self, r: ObjRef) -> Result<bool, Error> {
        match &self.get(r).kind {
            ObjectKind::None => Ok(false),
            ObjectKind::Bool(b) => Ok(*b),
            ObjectKind::Int(v) => Ok(*v != 0),
            ObjectKind::Float(v) => Ok(*v != 0.0),
            ObjectKind::Str(s) => Ok(!s.is_empty()),
            ObjectKind::List(items) => Ok(!items.is_empty()),
            ObjectKind::Map(map) => Ok(map.count() > 0),
            other => Err(Error::user(
                ErrorKind::Runtime,
                format!(
                    "value of type {} cannot be interpreted as a boolean",
                    type_desc_of(other).name
                ),
            )),
        }
    }

    pub fn to_int(&self, r: ObjRef) -> Result<i64, Error> {
        match &self.get(r).kind {
            ObjectKind::Int(v) => Ok(*v),
            ObjectKind::Float(v) => Ok(*v as i64),
            ObjectKind::Bool(b) => Ok(if *b { 1 } else { 0 }),
            other => Err(Error::user(
                ErrorKind::Runtime,
                format!(
                    "value of type {} cannot be interpreted as an integer",
                    type_desc_of(other).name
                ),
            )),
        }
    }

    pub fn to_float(&self, r: ObjRef) -> Result<f64, Error> {
        match &self.get(r).kind {
            ObjectKind::Float(v) => Ok(*v),
            ObjectKind::Int(v) => Ok(*v as f64),
            other => Err(Error::user(
                ErrorKind::Runtime,
                format!(
                    "value of type {} cannot be interpreted as a float",
                    type_desc_of(other).name
                ),
            )),
        }
    }

    /// Print capability: human-readable rendering into any writer.
    pub fn write_value(&self, r: ObjRef, out: &mut dyn Write) -> std::fmt::Result {
        match &self.get(r).kind {
            ObjectKind::None => out.write_str("none"),
            ObjectKind::Bool(b) => write!(out, "{}", b),
            ObjectKind::Int(v) => write!(out, "{}", v),
            ObjectKind::Float(v) => write!(out, "{:.2}", v),
            ObjectKind::Str(s) => out.write_str(s),
            ObjectKind::List(items) => {
                out.write_str("[")?;
                for (i, &item) in items.iter().enumerate() {
                    if i > 0 {
                        out.write_str(", ")?;
                    }
                    self.write_value(item, out)?;
                }
                out.write_str("]")
            }
            ObjectKind::Map(map) => {
                out.write_str("{")?;
                for i in 0..map.count() {
                    if i > 0 {
                        out.write_str(", ")?;
                    }
                    let (key, val) = map.entry(i);
                    self.write_value(key, out)?;
                    out.write_str(": ")?;
                    self.write_value(val, out)?;
                }
                out.write_str("}")
            }
            ObjectKind::Closure { .. } => out.write_str("<closure>"),
            ObjectKind::Function { .. } => out.write_str("<function>"),
            ObjectKind::Native(native) => write!(out, "<native function {}>", native.name),
        }
    }

    /// Convenience wrapper over [`Heap::write_value`].
    pub fn display(&self, r: ObjRef) -> String {
        let mut text = String::new();
        let _ = self.write_value(r, &mut text);
        text
    }
}

fn type_desc_of(kind: &ObjectKind) -> &'static TypeDesc {
    match kind {
        ObjectKind::None => &TYPE_NONE,
        ObjectKind::Bool(_) => &TYPE_BOOL,
        ObjectKind::Int(_) => &TYPE_INT,
        ObjectKind::Float(_) => &TYPE_FLOAT,
        ObjectKind::Str(_) => &TYPE_STR,
        ObjectKind::List(_) => &TYPE_LIST,
        ObjectKind::Map(_) => &TYPE_MAP,
        ObjectKind::Closure { .. } => &TYPE_CLOSURE,
        ObjectKind::Function { .. } => &TYPE_FUNCTION,
        ObjectKind::Native(_) => &TYPE_NATIVE,
    }
}
