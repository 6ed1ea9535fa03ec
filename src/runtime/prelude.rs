//! The standard prelude.
//!
//! Ordinary Cinder source compiled and executed into the global scope
//! before user code runs. Nothing here is special to the compiler or the
//! VM; it goes through the same pipeline as any program.

use crate::bytecode::compile::compile;
use crate::error::{Error, ErrorKind};
use crate::frontend::lexer::Lexer;
use crate::frontend::parser::Parser;
use crate::lang::source::Source;
use crate::runtime::vm::Vm;

pub const PRELUDE: &str = r#"# Standard helpers available to every program.

fun abs(x) {
    if x < 0: return -x;
    return x;
}

fun min(a, b) {
    if a < b: return a;
    return b;
}

fun max(a, b) {
    if a > b: return a;
    return b;
}

fun Numeric(x) {
    t = typeName(x);
    return t == "int" or t == "float";
}

fun Callable(x) {
    t = typeName(x);
    return t == "function" or t == "native function";
}

fun stringFromInteger(n) {
    digits = ["0", "1", "2", "3", "4", "5", "6", "7", "8", "9"];
    if n < 0: return "-" + stringFromInteger(-n);
    if n < 10: return digits[n];
    rest = n / 10;
    return stringFromInteger(rest) + digits[n - rest * 10];
}
"#;

/// Compiles and runs the prelude in the VM's global scope. A failure here
/// is a build defect, not a user mistake, so everything is reported as
/// internal.
pub fn install(vm: &mut Vm) -> Result<(), Error> {
    let tokens = Lexer::new(PRELUDE)
        .tokenize()
        .map_err(|e| Error::internal(ErrorKind::Internal, format!("prelude: {}", e)))?;
    let source = Source::new(Some("<prelude>".to_string()), PRELUDE);
    let ast = Parser::new(tokens, source)
        .parse()
        .map_err(|e| Error::internal(ErrorKind::Internal, format!("prelude: {}", e)))?;
    let exe = compile(&ast)?;
    vm.load_and_run(exe)
}
