pub mod compile;
pub mod disasm;
pub mod exe;
pub mod op;

pub use exe::{ExeBuilder, Executable, Promise};
pub use op::{Instr, Opcode, Operand};
