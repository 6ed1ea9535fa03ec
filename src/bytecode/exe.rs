//! The executable form of a compiled program, and the forward-reference
//! machinery used while building it.
//!
//! Forward jump targets are not known at emission time. The builder hands
//! out [`Promise`] cells instead; the compiler resolves each one once the
//! target instruction index is known, and [`ExeBuilder::finalize`] rewrites
//! every promise operand into a plain integer. An unresolved promise at that
//! point is a compiler bug, not a user error.

use std::cell::Cell;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::bytecode::op::{Instr, Opcode, Operand};
use crate::error::{Error, ErrorKind};
use crate::lang::source::Source;

// =============================================================================
// PROMISE
// =============================================================================

/// A write-once cell buffering a jump target.
///
/// Cloning a promise clones the handle, not the cell: every clone observes
/// the same resolution.
#[derive(Debug, Clone)]
pub struct Promise {
    cell: Rc<Cell<Option<i64>>>,
}

impl Promise {
    pub fn new() -> Self {
        Promise {
            cell: Rc::new(Cell::new(None)),
        }
    }

    /// Stores the payload. Resolving again with the same payload is a no-op;
    /// resolving with a different payload is an internal error.
    pub fn resolve(&self, value: i64) -> Result<(), Error> {
        match self.cell.get() {
            None => {
                self.cell.set(Some(value));
                Ok(())
            }
            Some(existing) if existing == value => Ok(()),
            Some(existing) => Err(Error::internal(
                ErrorKind::Internal,
                format!("jump target resolved twice: {} then {}", existing, value),
            )),
        }
    }

    pub fn get(&self) -> Option<i64> {
        self.cell.get()
    }

    pub fn is_resolved(&self) -> bool {
        self.cell.get().is_some()
    }
}

impl Default for Promise {
    fn default() -> Self {
        Promise::new()
    }
}

impl PartialEq for Promise {
    fn eq(&self, other: &Self) -> bool {
        self.cell.get() == other.cell.get()
    }
}

// =============================================================================
// BUILDER
// =============================================================================

/// Accumulates instructions during one compile pass.
pub struct ExeBuilder {
    instrs: Vec<Instr>,
    source: Rc<Source>,
}

impl ExeBuilder {
    pub fn new(source: Rc<Source>) -> Self {
        ExeBuilder {
            instrs: Vec::new(),
            source,
        }
    }

    pub fn append(&mut self, opcode: Opcode, operands: Vec<Operand>, offset: usize, length: usize) {
        self.instrs.push(Instr {
            opcode,
            operands,
            offset,
            length,
        });
    }

    /// Number of instructions emitted so far. Resolving a promise to this
    /// value points it at the next instruction to be appended.
    pub fn count(&self) -> i64 {
        self.instrs.len() as i64
    }

    /// Replaces every promise operand with its payload and freezes the
    /// instruction vector.
    pub fn finalize(self) -> Result<Executable, Error> {
        let mut instrs = self.instrs;

        for instr in &mut instrs {
            for operand in &mut instr.operands {
                if let Operand::Promise(promise) = operand {
                    match promise.get() {
                        Some(value) => *operand = Operand::Int(value),
                        None => {
                            return Err(Error::internal(
                                ErrorKind::UnresolvedJumpTarget,
                                format!(
                                    "unresolved jump target in {} at source offset {}",
                                    instr.opcode.name(),
                                    instr.offset
                                ),
                            ));
                        }
                    }
                }
            }
        }

        Ok(Executable {
            instrs,
            source: self.source,
        })
    }
}

// =============================================================================
// EXECUTABLE
// =============================================================================

/// A finalized, immutable instruction vector bound to its source text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Executable {
    instrs: Vec<Instr>,
    #[serde(skip)]
    source: Rc<Source>,
}

impl Executable {
    pub fn len(&self) -> usize {
        self.instrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instrs.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Instr> {
        self.instrs.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Instr> {
        self.instrs.iter()
    }

    pub fn source(&self) -> &Rc<Source> {
        &self.source
    }
}

impl std::ops::Index<usize> for Executable {
    type Output = Instr;

    fn index(&self, index: usize) -> &Instr {
        &self.instrs[index]
    }
}
