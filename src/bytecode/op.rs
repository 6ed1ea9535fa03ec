use serde::{Deserialize, Serialize};

use crate::bytecode::exe::Promise;

// =============================================================================
// OPCODE - Bytecode instructions
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Opcode {
    // literals and variables
    PushInt,
    PushFlt,
    PushStr,
    PushVar,
    PushNne,
    PushTru,
    PushFls,
    PushLst,
    PushMap,
    PushFun,

    // unary
    Not,
    Pos,
    Neg,

    // binary
    Add,
    Sub,
    Mul,
    Div,
    Eql,
    Nql,
    Lss,
    Leq,
    Grt,
    Geq,
    And,
    Or,

    // indexing
    Select,
    Insert,
    /// Like `Insert` but leaves the assigned value on top of the stack.
    /// Used for index targets inside tuple assignments.
    Insert2,

    // variables and stack hygiene
    Ass,
    Pop,

    // control flow; targets are absolute instruction indices
    Jump,
    JumpIfNotAndPop,
    JumpIfAndPop,

    Call,
    Return,
}

impl Opcode {
    pub fn name(self) -> &'static str {
        match self {
            Opcode::PushInt => "PUSHINT",
            Opcode::PushFlt => "PUSHFLT",
            Opcode::PushStr => "PUSHSTR",
            Opcode::PushVar => "PUSHVAR",
            Opcode::PushNne => "PUSHNNE",
            Opcode::PushTru => "PUSHTRU",
            Opcode::PushFls => "PUSHFLS",
            Opcode::PushLst => "PUSHLST",
            Opcode::PushMap => "PUSHMAP",
            Opcode::PushFun => "PUSHFUN",
            Opcode::Not => "NOT",
            Opcode::Pos => "POS",
            Opcode::Neg => "NEG",
            Opcode::Add => "ADD",
            Opcode::Sub => "SUB",
            Opcode::Mul => "MUL",
            Opcode::Div => "DIV",
            Opcode::Eql => "EQL",
            Opcode::Nql => "NQL",
            Opcode::Lss => "LSS",
            Opcode::Leq => "LEQ",
            Opcode::Grt => "GRT",
            Opcode::Geq => "GEQ",
            Opcode::And => "AND",
            Opcode::Or => "OR",
            Opcode::Select => "SELECT",
            Opcode::Insert => "INSERT",
            Opcode::Insert2 => "INSERT2",
            Opcode::Ass => "ASS",
            Opcode::Pop => "POP",
            Opcode::Jump => "JUMP",
            Opcode::JumpIfNotAndPop => "JUMPIFNOTANDPOP",
            Opcode::JumpIfAndPop => "JUMPIFANDPOP",
            Opcode::Call => "CALL",
            Opcode::Return => "RETURN",
        }
    }
}

// =============================================================================
// OPERAND
// =============================================================================

/// An instruction operand.
///
/// `Promise` operands exist only while the builder is live; finalization
/// replaces each one with the `Int` it resolved to, which is why the variant
/// is excluded from serialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operand {
    Int(i64),
    Float(f64),
    Str(String),
    #[serde(skip)]
    Promise(Promise),
}

impl Operand {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Operand::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Operand::Float(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Operand::Str(value) => Some(value),
            _ => None,
        }
    }
}

impl std::fmt::Display for Operand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operand::Int(value) => write!(f, "{}", value),
            Operand::Float(value) => write!(f, "{}", value),
            Operand::Str(value) => write!(f, "{:?}", value),
            Operand::Promise(promise) => match promise.get() {
                Some(value) => write!(f, "{}", value),
                None => write!(f, "?"),
            },
        }
    }
}

// =============================================================================
// INSTRUCTION
// =============================================================================

/// One bytecode instruction with the byte span of the AST node it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instr {
    pub opcode: Opcode,
    pub operands: Vec<Operand>,
    pub offset: usize,
    pub length: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operand_accessors() {
        assert_eq!(Operand::Int(3).as_int(), Some(3));
        assert_eq!(Operand::Int(3).as_float(), None);
        assert_eq!(Operand::Float(1.5).as_float(), Some(1.5));
        assert_eq!(Operand::Str("x".to_string()).as_str(), Some("x"));
    }

    #[test]
    fn test_finalized_instr_round_trips_through_json() {
        let instr = Instr {
            opcode: Opcode::PushStr,
            operands: vec![Operand::Str("hello".to_string())],
            offset: 4,
            length: 7,
        };

        let json = serde_json::to_string(&instr).unwrap();
        let back: Instr = serde_json::from_str(&json).unwrap();
        assert_eq!(instr, back);
    }

    #[test]
    fn test_promise_operand_does_not_serialize() {
        let instr = Instr {
            opcode: Opcode::Jump,
            operands: vec![Operand::Promise(Promise::new())],
            offset: 0,
            length: 0,
        };

        assert!(serde_json::to_string(&instr).is_err());
    }
}
