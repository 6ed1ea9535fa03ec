//! Lexical scope chains.
//!
//! A closure is a singly-linked list of scope maps. Lookup scans from the
//! innermost scope outward and stops at the first hit; writes always go to
//! the innermost map, which is the interpreter's business, not the chain's.

use crate::error::{Error, ErrorKind};
use crate::runtime::heap::Heap;
use crate::runtime::object::{ObjRef, ObjectKind};

impl Heap {
    /// Links a new scope over `parent`. `parent` must itself be a closure.
    pub fn new_closure(&mut self, parent: Option<ObjRef>, vars: ObjRef) -> Result<ObjRef, Error> {
        if let Some(parent) = parent {
            if !matches!(self.get(parent).kind, ObjectKind::Closure { .. }) {
                return Err(Error::user(
                    ErrorKind::Runtime,
                    "enclosing scope is not a closure",
                ));
            }
        }
        self.alloc(ObjectKind::Closure { vars, prev: parent })
    }

    /// A fresh scope with an empty variable map.
    pub fn new_scope(&mut self, parent: Option<ObjRef>) -> Result<ObjRef, Error> {
        let vars = self.new_map(0)?;
        self.new_closure(parent, vars)
    }

    /// The innermost variable map of a scope chain.
    pub fn closure_vars(&self, closure: ObjRef) -> Result<ObjRef, Error> {
        match &self.get(closure).kind {
            ObjectKind::Closure { vars, .. } => Ok(*vars),
            _ => Err(Error::internal(
                ErrorKind::Internal,
                "scope operation on a non-closure",
            )),
        }
    }

    /// Walks the chain outward, returning the first binding of `key`.
    /// Errors (an unhashable key, for instance) abort the walk.
    pub fn closure_select(&self, closure: ObjRef, key: ObjRef) -> Result<Option<ObjRef>, Error> {
        let mut current = Some(closure);

        while let Some(link) = current {
            let (vars, prev) = match &self.get(link).kind {
                ObjectKind::Closure { vars, prev } => (*vars, *prev),
                _ => {
                    return Err(Error::internal(
                        ErrorKind::Internal,
                        "scope operation on a non-closure",
                    ));
                }
            };

            if let Some(found) = self.map_select(vars, key)? {
                return Ok(Some(found));
            }
            current = prev;
        }

        Ok(None)
    }
}
