//! # Cinder Abstract Syntax Tree
//!
//! This module defines the source handle and the Abstract Syntax Tree (AST)
//! for the Cinder language. The AST is produced by the parser and consumed
//! by the bytecode compiler.
//!
//! Every node carries its `(offset, length)` byte span into the source text;
//! the compiler copies these spans onto the instructions it emits so that
//! runtime faults can point back at the program.

pub mod ast;
pub mod source;
