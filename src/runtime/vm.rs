//! The bytecode interpreter.
//!
//! Executes [`Executable`]s against the managed heap: a value stack of
//! object references, a frame stack for calls, and a current scope chain
//! for variable lookup. Function values carry the index of the executable
//! they were compiled into plus their entry instruction, so several loaded
//! programs (the prelude, then user code) can call across each other while
//! sharing one global scope.
//!
//! Runtime faults are reported through the shared error channel, prefixed
//! with the `file:line:column` of the instruction that raised them.

use std::rc::Rc;

use crate::bytecode::exe::Executable;
use crate::bytecode::op::{Instr, Opcode};
use crate::error::{Error, ErrorKind};
use crate::runtime::heap::Heap;
use crate::runtime::object::{Atomic, NativeFn, ObjRef, ObjectKind};

const MAX_FRAMES: usize = 10_000;

struct Frame {
    exe: usize,
    return_ip: usize,
    scope: ObjRef,
    returns: usize,
}

pub struct Vm {
    heap: Heap,
    globals: ObjRef,
    stack: Vec<ObjRef>,
    frames: Vec<Frame>,
    exes: Vec<Rc<Executable>>,
}

impl Vm {
    pub fn new() -> Result<Self, Error> {
        Self::with_heap(Heap::new())
    }

    /// Builds a VM over a caller-provided heap (tests use this to shrink
    /// the budget).
    pub fn with_heap(mut heap: Heap) -> Result<Self, Error> {
        let globals = heap.new_scope(None)?;
        let mut vm = Vm {
            heap,
            globals,
            stack: Vec::new(),
            frames: Vec::new(),
            exes: Vec::new(),
        };
        vm.register_natives()?;
        Ok(vm)
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    /// Binds a value in the global scope.
    pub fn define_global(&mut self, name: &str, value: ObjRef) -> Result<(), Error> {
        let key = self.heap.new_str(name)?;
        let vars = self.heap.closure_vars(self.globals)?;
        self.heap.map_insert(vars, key, value)
    }

    /// Looks a name up in the global scope.
    pub fn global(&mut self, name: &str) -> Result<Option<ObjRef>, Error> {
        let key = self.heap.new_str(name)?;
        self.heap.closure_select(self.globals, key)
    }

    fn register_natives(&mut self) -> Result<(), Error> {
        let natives: &[NativeFn] = &[
            NativeFn {
                name: "print",
                argc: None,
                func: native_print,
            },
            NativeFn {
                name: "count",
                argc: Some(1),
                func: native_count,
            },
            NativeFn {
                name: "typeName",
                argc: Some(1),
                func: native_type_name,
            },
        ];

        for &native in natives {
            let r = self.heap.new_native(native)?;
            self.define_global(native.name, r)?;
        }
        Ok(())
    }

    /// Loads an executable and runs it to its program-level return.
    pub fn load_and_run(&mut self, exe: Executable) -> Result<(), Error> {
        let index = self.exes.len();
        tracing::debug!(exe = index, instructions = exe.len(), "running executable");
        self.exes.push(Rc::new(exe));
        self.execute(index)
    }

    fn execute(&mut self, exe_index: usize) -> Result<(), Error> {
        let frame_floor = self.frames.len();
        let mut exe = Rc::clone(&self.exes[exe_index]);
        let mut exe_idx = exe_index;
        let mut scope = self.globals;
        let mut ip = 0usize;

        loop {
            if self.heap.should_collect() {
                self.collect_garbage(scope);
            }

            let instr = match exe.get(ip) {
                Some(instr) => instr,
                None => {
                    return Err(Error::internal(
                        ErrorKind::Internal,
                        format!("instruction pointer {} out of range", ip),
                    ));
                }
            };

            match instr.opcode {
                Opcode::PushInt => {
                    let value = int_op(instr, 0)?;
                    let r = self.heap.new_int(value).map_err(|e| locate(&exe, ip, e))?;
                    self.stack.push(r);
                }

                Opcode::PushFlt => {
                    let value = float_op(instr, 0)?;
                    let r = self.heap.new_float(value).map_err(|e| locate(&exe, ip, e))?;
                    self.stack.push(r);
                }

                Opcode::PushStr => {
                    let value = str_op(instr, 0)?;
                    let r = self.heap.new_str(value).map_err(|e| locate(&exe, ip, e))?;
                    self.stack.push(r);
                }

                Opcode::PushVar => {
                    let name = str_op(instr, 0)?;
                    let key = self.heap.new_str(name).map_err(|e| locate(&exe, ip, e))?;
                    match self
                        .heap
                        .closure_select(scope, key)
                        .map_err(|e| locate(&exe, ip, e))?
                    {
                        Some(value) => self.stack.push(value),
                        None => {
                            return Err(fault(
                                &exe,
                                ip,
                                format!("undefined variable '{}'", name),
                            ));
                        }
                    }
                }

                Opcode::PushNne => self.stack.push(Heap::NONE),
                Opcode::PushTru => self.stack.push(Heap::TRUE),
                Opcode::PushFls => self.stack.push(Heap::FALSE),

                Opcode::PushLst => {
                    let hint = int_op(instr, 0)?.max(0) as usize;
                    let r = self.heap.new_list(hint).map_err(|e| locate(&exe, ip, e))?;
                    self.stack.push(r);
                }

                Opcode::PushMap => {
                    let hint = int_op(instr, 0)?.max(0) as usize;
                    let r = self.heap.new_map(hint).map_err(|e| locate(&exe, ip, e))?;
                    self.stack.push(r);
                }

                Opcode::PushFun => {
                    let entry = int_op(instr, 0)?;
                    let argc = int_op(instr, 1)?;
                    let r = self
                        .heap
                        .new_function(exe_idx, entry as usize, argc as usize, scope)
                        .map_err(|e| locate(&exe, ip, e))?;
                    self.stack.push(r);
                }

                Opcode::Not => {
                    let v = self.pop()?;
                    let b = self.heap.to_bool(v).map_err(|e| locate(&exe, ip, e))?;
                    self.stack.push(self.heap.from_bool(!b));
                }

                Opcode::Pos => {
                    let v = self.pop()?;
                    match self.heap.get(v).kind {
                        ObjectKind::Int(_) | ObjectKind::Float(_) => self.stack.push(v),
                        _ => {
                            return Err(fault(
                                &exe,
                                ip,
                                format!(
                                    "unary '+' requires a number, got {}",
                                    self.heap.type_name(v)
                                ),
                            ));
                        }
                    }
                }

                Opcode::Neg => {
                    let v = self.pop()?;
                    let r = match self.heap.get(v).kind {
                        ObjectKind::Int(value) => self.heap.new_int(value.wrapping_neg()),
                        ObjectKind::Float(value) => self.heap.new_float(-value),
                        _ => {
                            return Err(fault(
                                &exe,
                                ip,
                                format!(
                                    "unary '-' requires a number, got {}",
                                    self.heap.type_name(v)
                                ),
                            ));
                        }
                    }
                    .map_err(|e| locate(&exe, ip, e))?;
                    self.stack.push(r);
                }

                Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    let r = self
                        .arith(instr.opcode, a, b)
                        .map_err(|e| locate(&exe, ip, e))?;
                    self.stack.push(r);
                }

                Opcode::Eql => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    let equal = self.heap.compare(a, b);
                    self.stack.push(self.heap.from_bool(equal));
                }

                Opcode::Nql => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    let equal = self.heap.compare(a, b);
                    self.stack.push(self.heap.from_bool(!equal));
                }

                Opcode::Lss | Opcode::Leq | Opcode::Grt | Opcode::Geq => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    let result = self
                        .ordering(instr.opcode, a, b)
                        .map_err(|e| locate(&exe, ip, e))?;
                    self.stack.push(self.heap.from_bool(result));
                }

                Opcode::And | Opcode::Or => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    let a = self.heap.to_bool(a).map_err(|e| locate(&exe, ip, e))?;
                    let b = self.heap.to_bool(b).map_err(|e| locate(&exe, ip, e))?;
                    let result = if instr.opcode == Opcode::And {
                        a && b
                    } else {
                        a || b
                    };
                    self.stack.push(self.heap.from_bool(result));
                }

                Opcode::Select => {
                    let index = self.pop()?;
                    let set = self.pop()?;
                    let r = self.select(&exe, ip, set, index)?;
                    self.stack.push(r);
                }

                Opcode::Insert => {
                    let value = self.pop()?;
                    let key = self.pop()?;
                    let set = self.pop()?;
                    self.insert(&exe, ip, set, key, value)?;
                    self.stack.push(set);
                }

                Opcode::Insert2 => {
                    let index = self.pop()?;
                    let set = self.pop()?;
                    let value = self.peek()?;
                    self.insert(&exe, ip, set, index, value)?;
                }

                Opcode::Ass => {
                    let name = str_op(instr, 0)?;
                    let value = self.peek()?;
                    let key = self.heap.new_str(name).map_err(|e| locate(&exe, ip, e))?;
                    let vars = self.heap.closure_vars(scope)?;
                    self.heap
                        .map_insert(vars, key, value)
                        .map_err(|e| locate(&exe, ip, e))?;
                }

                Opcode::Pop => {
                    let k = int_op(instr, 0)?;
                    for _ in 0..k {
                        self.pop()?;
                    }
                }

                Opcode::Jump => {
                    ip = int_op(instr, 0)? as usize;
                    continue;
                }

                Opcode::JumpIfNotAndPop => {
                    let target = int_op(instr, 0)? as usize;
                    let v = self.pop()?;
                    if !self.heap.to_bool(v).map_err(|e| locate(&exe, ip, e))? {
                        ip = target;
                        continue;
                    }
                }

                Opcode::JumpIfAndPop => {
                    let target = int_op(instr, 0)? as usize;
                    let v = self.pop()?;
                    if self.heap.to_bool(v).map_err(|e| locate(&exe, ip, e))? {
                        ip = target;
                        continue;
                    }
                }

                Opcode::Call => {
                    let argc = int_op(instr, 0)? as usize;
                    let returns = int_op(instr, 1)? as usize;
                    let callee = self.pop()?;

                    match self.heap.get(callee).kind {
                        ObjectKind::Function {
                            exe: callee_exe,
                            entry,
                            argc: arity,
                            captured,
                        } => {
                            if argc != arity {
                                return Err(fault(
                                    &exe,
                                    ip,
                                    format!("function takes {} arguments, got {}", arity, argc),
                                ));
                            }
                            if self.frames.len() >= MAX_FRAMES {
                                return Err(fault(&exe, ip, "call stack overflow"));
                            }
                            if self.stack.len() < argc {
                                return Err(Error::internal(
                                    ErrorKind::Internal,
                                    "value stack underflow in call",
                                ));
                            }

                            // The callee binds parameters first-to-last, so
                            // flip the argument block to put the first one
                            // on top.
                            let base = self.stack.len() - argc;
                            self.stack[base..].reverse();

                            let vars =
                                self.heap.new_map(argc).map_err(|e| locate(&exe, ip, e))?;
                            let callee_scope = self
                                .heap
                                .new_closure(Some(captured), vars)
                                .map_err(|e| locate(&exe, ip, e))?;

                            self.frames.push(Frame {
                                exe: exe_idx,
                                return_ip: ip + 1,
                                scope,
                                returns,
                            });

                            scope = callee_scope;
                            exe_idx = callee_exe;
                            exe = Rc::clone(&self.exes[callee_exe]);
                            ip = entry;
                            continue;
                        }

                        ObjectKind::Native(native) => {
                            if let Some(expected) = native.argc {
                                if argc != expected {
                                    return Err(fault(
                                        &exe,
                                        ip,
                                        format!(
                                            "{} takes {} arguments, got {}",
                                            native.name, expected, argc
                                        ),
                                    ));
                                }
                            }
                            if self.stack.len() < argc {
                                return Err(Error::internal(
                                    ErrorKind::Internal,
                                    "value stack underflow in call",
                                ));
                            }

                            let base = self.stack.len() - argc;
                            let args: Vec<ObjRef> = self.stack.split_off(base);
                            let mut results = (native.func)(&mut self.heap, &args)
                                .map_err(|e| locate(&exe, ip, e))?;

                            results.truncate(returns);
                            while results.len() < returns {
                                results.push(Heap::NONE);
                            }
                            self.stack.extend(results);
                        }

                        _ => {
                            return Err(fault(
                                &exe,
                                ip,
                                format!(
                                    "value of type {} is not callable",
                                    self.heap.type_name(callee)
                                ),
                            ));
                        }
                    }
                }

                Opcode::Return => {
                    let k = int_op(instr, 0)? as usize;
                    if self.stack.len() < k {
                        return Err(Error::internal(
                            ErrorKind::Internal,
                            "value stack underflow in return",
                        ));
                    }
                    let mut values = self.stack.split_off(self.stack.len() - k);

                    if self.frames.len() == frame_floor {
                        // Program-level return.
                        return Ok(());
                    }

                    let frame = match self.frames.pop() {
                        Some(frame) => frame,
                        None => {
                            return Err(Error::internal(
                                ErrorKind::Internal,
                                "frame stack underflow",
                            ));
                        }
                    };

                    values.truncate(frame.returns);
                    while values.len() < frame.returns {
                        values.push(Heap::NONE);
                    }
                    self.stack.extend(values);

                    scope = frame.scope;
                    exe_idx = frame.exe;
                    exe = Rc::clone(&self.exes[frame.exe]);
                    ip = frame.return_ip;
                    continue;
                }
            }

            ip += 1;
        }
    }

    // ──────────────────────────── helpers ────────────────────────────

    fn pop(&mut self) -> Result<ObjRef, Error> {
        self.stack
            .pop()
            .ok_or_else(|| Error::internal(ErrorKind::Internal, "value stack underflow"))
    }

    fn peek(&self) -> Result<ObjRef, Error> {
        self.stack
            .last()
            .copied()
            .ok_or_else(|| Error::internal(ErrorKind::Internal, "value stack underflow"))
    }

    fn collect_garbage(&mut self, scope: ObjRef) {
        let mut roots = self.stack.clone();
        roots.push(self.globals);
        roots.push(scope);
        for frame in &self.frames {
            roots.push(frame.scope);
        }
        self.heap.collect(&roots);
    }

    fn arith(&mut self, opcode: Opcode, a: ObjRef, b: ObjRef) -> Result<ObjRef, Error> {
        if let (ObjectKind::Int(x), ObjectKind::Int(y)) =
            (&self.heap.get(a).kind, &self.heap.get(b).kind)
        {
            let (x, y) = (*x, *y);
            let value = match opcode {
                Opcode::Add => x.wrapping_add(y),
                Opcode::Sub => x.wrapping_sub(y),
                Opcode::Mul => x.wrapping_mul(y),
                Opcode::Div => {
                    if y == 0 {
                        return Err(Error::user(ErrorKind::Runtime, "division by zero"));
                    }
                    x.wrapping_div(y)
                }
                _ => {
                    return Err(Error::internal(
                        ErrorKind::Internal,
                        "non-arithmetic opcode in arithmetic path",
                    ));
                }
            };
            return self.heap.new_int(value);
        }

        if opcode == Opcode::Add {
            if let (ObjectKind::Str(x), ObjectKind::Str(y)) =
                (&self.heap.get(a).kind, &self.heap.get(b).kind)
            {
                let joined = format!("{}{}", x, y);
                return self.heap.new_str(joined);
            }
        }

        let x = self.numeric(a, opcode)?;
        let y = self.numeric(b, opcode)?;
        let value = match opcode {
            Opcode::Add => x + y,
            Opcode::Sub => x - y,
            Opcode::Mul => x * y,
            Opcode::Div => x / y,
            _ => {
                return Err(Error::internal(
                    ErrorKind::Internal,
                    "non-arithmetic opcode in arithmetic path",
                ));
            }
        };
        self.heap.new_float(value)
    }

    fn numeric(&self, r: ObjRef, opcode: Opcode) -> Result<f64, Error> {
        // The atomic tag spares a second look at the value representation.
        match self.heap.get(r).type_desc().atomic {
            Some(Atomic::Int) | Some(Atomic::Float) => self.heap.to_float(r),
            _ => Err(Error::user(
                ErrorKind::Runtime,
                format!(
                    "operands of {} must be numbers, got {}",
                    opcode.name(),
                    self.heap.type_name(r)
                ),
            )),
        }
    }

    fn ordering(&self, opcode: Opcode, a: ObjRef, b: ObjRef) -> Result<bool, Error> {
        // Integer pairs compare exactly; any float promotes both sides.
        let result = if let (ObjectKind::Int(x), ObjectKind::Int(y)) =
            (&self.heap.get(a).kind, &self.heap.get(b).kind)
        {
            match opcode {
                Opcode::Lss => x < y,
                Opcode::Leq => x <= y,
                Opcode::Grt => x > y,
                Opcode::Geq => x >= y,
                _ => {
                    return Err(Error::internal(
                        ErrorKind::Internal,
                        "non-ordering opcode in ordering path",
                    ));
                }
            }
        } else {
            let x = self.numeric(a, opcode)?;
            let y = self.numeric(b, opcode)?;
            match opcode {
                Opcode::Lss => x < y,
                Opcode::Leq => x <= y,
                Opcode::Grt => x > y,
                Opcode::Geq => x >= y,
                _ => {
                    return Err(Error::internal(
                        ErrorKind::Internal,
                        "non-ordering opcode in ordering path",
                    ));
                }
            }
        };
        Ok(result)
    }

    fn select(
        &mut self,
        exe: &Executable,
        ip: usize,
        set: ObjRef,
        index: ObjRef,
    ) -> Result<ObjRef, Error> {
        match &self.heap.get(set).kind {
            ObjectKind::List(_) => {
                let i = match self.heap.get(index).kind {
                    ObjectKind::Int(i) => i,
                    _ => {
                        return Err(fault(
                            exe,
                            ip,
                            format!(
                                "list index must be an integer, got {}",
                                self.heap.type_name(index)
                            ),
                        ));
                    }
                };
                self.heap.list_select(set, i).map_err(|e| locate(exe, ip, e))
            }
            ObjectKind::Map(_) => {
                match self
                    .heap
                    .map_select(set, index)
                    .map_err(|e| locate(exe, ip, e))?
                {
                    Some(value) => Ok(value),
                    None => Err(fault(
                        exe,
                        ip,
                        format!("map has no key {}", self.heap.display(index)),
                    )),
                }
            }
            _ => Err(fault(
                exe,
                ip,
                format!(
                    "value of type {} cannot be indexed",
                    self.heap.type_name(set)
                ),
            )),
        }
    }

    fn insert(
        &mut self,
        exe: &Executable,
        ip: usize,
        set: ObjRef,
        key: ObjRef,
        value: ObjRef,
    ) -> Result<(), Error> {
        match &self.heap.get(set).kind {
            ObjectKind::List(_) => {
                let i = match self.heap.get(key).kind {
                    ObjectKind::Int(i) => i,
                    _ => {
                        return Err(fault(
                            exe,
                            ip,
                            format!(
                                "list index must be an integer, got {}",
                                self.heap.type_name(key)
                            ),
                        ));
                    }
                };
                self.heap
                    .list_insert(set, i, value)
                    .map_err(|e| locate(exe, ip, e))
            }
            ObjectKind::Map(_) => self
                .heap
                .map_insert(set, key, value)
                .map_err(|e| locate(exe, ip, e)),
            _ => Err(fault(
                exe,
                ip,
                format!(
                    "cannot insert into a value of type {}",
                    self.heap.type_name(set)
                ),
            )),
        }
    }
}

// ──────────────────────────── operand access ────────────────────────────

fn int_op(instr: &Instr, index: usize) -> Result<i64, Error> {
    instr
        .operands
        .get(index)
        .and_then(|o| o.as_int())
        .ok_or_else(|| {
            Error::internal(
                ErrorKind::Internal,
                format!("{} missing integer operand {}", instr.opcode.name(), index),
            )
        })
}

fn float_op(instr: &Instr, index: usize) -> Result<f64, Error> {
    instr
        .operands
        .get(index)
        .and_then(|o| o.as_float())
        .ok_or_else(|| {
            Error::internal(
                ErrorKind::Internal,
                format!("{} missing float operand {}", instr.opcode.name(), index),
            )
        })
}

fn str_op(instr: &Instr, index: usize) -> Result<&str, Error> {
    instr
        .operands
        .get(index)
        .and_then(|o| o.as_str())
        .ok_or_else(|| {
            Error::internal(
                ErrorKind::Internal,
                format!("{} missing string operand {}", instr.opcode.name(), index),
            )
        })
}

// ──────────────────────────── error location ────────────────────────────

fn locate(exe: &Executable, ip: usize, mut err: Error) -> Error {
    if let Some(instr) = exe.get(ip) {
        let (line, col) = exe.source().line_col(instr.offset);
        err.message = format!("{}:{}:{}: {}", exe.source().name(), line, col, err.message);
    }
    err
}

fn fault(exe: &Executable, ip: usize, message: impl Into<String>) -> Error {
    locate(exe, ip, Error::user(ErrorKind::Runtime, message.into()))
}

// ──────────────────────────── native functions ────────────────────────────

fn native_print(heap: &mut Heap, args: &[ObjRef]) -> Result<Vec<ObjRef>, Error> {
    let mut text = String::new();
    for &arg in args {
        let _ = heap.write_value(arg, &mut text);
    }
    println!("{}", text);
    Ok(Vec::new())
}

fn native_count(heap: &mut Heap, args: &[ObjRef]) -> Result<Vec<ObjRef>, Error> {
    let n = heap.count(args[0])?;
    Ok(vec![heap.new_int(n)?])
}

fn native_type_name(heap: &mut Heap, args: &[ObjRef]) -> Result<Vec<ObjRef>, Error> {
    let name = heap.type_name(args[0]);
    Ok(vec![heap.new_str(name)?])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::compile::compile;
    use crate::frontend::lexer::Lexer;
    use crate::frontend::parser::Parser;
    use crate::lang::source::Source;

    fn compile_src(src: &str) -> Executable {
        let tokens = Lexer::new(src).tokenize().unwrap();
        let source = Source::new(None, src);
        let ast = Parser::new(tokens, source).parse().unwrap();
        compile(&ast).unwrap()
    }

    fn run(src: &str) -> Vm {
        let mut vm = Vm::new().unwrap();
        vm.load_and_run(compile_src(src)).unwrap();
        vm
    }

    fn run_err(src: &str) -> Error {
        let mut vm = Vm::new().unwrap();
        vm.load_and_run(compile_src(src)).unwrap_err()
    }

    fn global_int(vm: &mut Vm, name: &str) -> i64 {
        let r = vm.global(name).unwrap().expect("global not defined");
        match vm.heap().get(r).kind {
            ObjectKind::Int(v) => v,
            ref other => panic!("expected int, got {:?}", other),
        }
    }

    fn global_display(vm: &mut Vm, name: &str) -> String {
        let r = vm.global(name).unwrap().expect("global not defined");
        vm.heap().display(r)
    }

    // =========================================================================
    // Arithmetic and logic
    // =========================================================================

    #[test]
    fn test_integer_arithmetic() {
        let mut vm = run("x = 2 + 3 * 4 - 1;");
        assert_eq!(global_int(&mut vm, "x"), 13);
    }

    #[test]
    fn test_integer_division_truncates() {
        let mut vm = run("x = 7 / 2;");
        assert_eq!(global_int(&mut vm, "x"), 3);
    }

    #[test]
    fn test_float_promotion() {
        let mut vm = run("x = 1 + 0.5;");
        assert_eq!(global_display(&mut vm, "x"), "1.50");
    }

    #[test]
    fn test_string_concatenation() {
        let mut vm = run("x = \"foo\" + \"bar\";");
        assert_eq!(global_display(&mut vm, "x"), "foobar");
    }

    #[test]
    fn test_comparisons_and_logic() {
        let mut vm = run("a = 1 < 2 and 2 <= 2; b = 3 > 4 or not false;");
        assert_eq!(global_display(&mut vm, "a"), "true");
        assert_eq!(global_display(&mut vm, "b"), "true");
    }

    #[test]
    fn test_equality_is_structural() {
        let mut vm = run("a = \"x\" == \"x\"; b = 1 == 1.0; c = 1 != 2;");
        assert_eq!(global_display(&mut vm, "a"), "true");
        // different types are never equal
        assert_eq!(global_display(&mut vm, "b"), "false");
        assert_eq!(global_display(&mut vm, "c"), "true");
    }

    #[test]
    fn test_division_by_zero() {
        let err = run_err("x = 1 / 0;");
        assert_eq!(err.kind, ErrorKind::Runtime);
        assert!(err.message.contains("division by zero"));
    }

    // =========================================================================
    // Variables and control flow
    // =========================================================================

    #[test]
    fn test_undefined_variable_reports_location() {
        let err = run_err("x = 1;\ny = missing;");
        assert!(err.message.contains("undefined variable 'missing'"));
        assert!(err.message.contains(":2:"));
    }

    #[test]
    fn test_if_else() {
        let mut vm = run("if 1 < 2: x = 10; else x = 20;");
        assert_eq!(global_int(&mut vm, "x"), 10);

        let mut vm = run("if 1 > 2: x = 10; else x = 20;");
        assert_eq!(global_int(&mut vm, "x"), 20);
    }

    #[test]
    fn test_while_loop() {
        let mut vm = run("n = 5; sum = 0; while n > 0: { sum = sum + n; n = n - 1; }");
        assert_eq!(global_int(&mut vm, "sum"), 15);
    }

    #[test]
    fn test_do_while_runs_body_once() {
        let mut vm = run("x = 100; do x = x + 1; while false;");
        assert_eq!(global_int(&mut vm, "x"), 101);
    }

    #[test]
    fn test_break_exits_innermost_loop() {
        let mut vm = run("i = 0; while true: { i = i + 1; if i == 3: break; }");
        assert_eq!(global_int(&mut vm, "i"), 3);
    }

    #[test]
    fn test_break_exits_do_while() {
        let mut vm = run("i = 0; do { i = i + 1; if i == 2: break; } while true;");
        assert_eq!(global_int(&mut vm, "i"), 2);
    }

    #[test]
    fn test_nested_loops_break_inner_only() {
        let mut vm = run(
            "total = 0; i = 0; while i < 3: { j = 0; while true: { j = j + 1; if j == 2: break; } total = total + j; i = i + 1; }",
        );
        assert_eq!(global_int(&mut vm, "total"), 6);
    }

    // =========================================================================
    // Functions
    // =========================================================================

    #[test]
    fn test_function_call() {
        let mut vm = run("fun add(a, b) return a + b; x = add(2, 3);");
        assert_eq!(global_int(&mut vm, "x"), 5);
    }

    #[test]
    fn test_argument_binding_order() {
        let mut vm = run("fun sub(a, b) return a - b; x = sub(10, 4);");
        assert_eq!(global_int(&mut vm, "x"), 6);
    }

    #[test]
    fn test_recursion() {
        let mut vm = run("fun fib(n) { if n < 2: return n; return fib(n-1) + fib(n-2); } x = fib(12);");
        assert_eq!(global_int(&mut vm, "x"), 144);
    }

    #[test]
    fn test_multi_value_return() {
        let mut vm = run("fun two() return 1, 2; a, b = two();");
        assert_eq!(global_int(&mut vm, "a"), 1);
        assert_eq!(global_int(&mut vm, "b"), 2);
    }

    #[test]
    fn test_short_return_pads_with_none() {
        let mut vm = run("fun one() return 1; a, b = one();");
        assert_eq!(global_int(&mut vm, "a"), 1);
        assert_eq!(global_display(&mut vm, "b"), "none");
    }

    #[test]
    fn test_extra_returns_are_dropped() {
        let mut vm = run("fun two() return 1, 2; a = two();");
        assert_eq!(global_int(&mut vm, "a"), 1);
    }

    #[test]
    fn test_function_without_return_yields_none() {
        let mut vm = run("fun noop(x) x + 1; a = noop(1);");
        assert_eq!(global_display(&mut vm, "a"), "none");
    }

    #[test]
    fn test_closure_captures_definition_scope() {
        let mut vm = run(
            "fun outer(a) { fun inner(b) return a + b; return inner; } f = outer(10); x = f(5);",
        );
        assert_eq!(global_int(&mut vm, "x"), 15);
    }

    #[test]
    fn test_wrong_argument_count() {
        let err = run_err("fun f(a) return a; x = f(1, 2);");
        assert!(err.message.contains("takes 1 arguments, got 2"));
    }

    #[test]
    fn test_calling_a_non_function() {
        let err = run_err("x = 5; x(1);");
        assert!(err.message.contains("not callable"));
    }

    #[test]
    fn test_runaway_recursion_is_caught() {
        let err = run_err("fun loop_(n) return loop_(n); x = loop_(1);");
        assert!(err.message.contains("call stack overflow"));
    }

    // =========================================================================
    // Lists and maps
    // =========================================================================

    #[test]
    fn test_list_literal_and_index() {
        let mut vm = run("l = [10, 20, 30]; x = l[1];");
        assert_eq!(global_int(&mut vm, "x"), 20);
    }

    #[test]
    fn test_list_write_and_append() {
        let mut vm = run("l = [1, 2]; l[0] = 9; l[2] = 3; n = count(l);");
        assert_eq!(global_display(&mut vm, "l"), "[9, 2, 3]");
        assert_eq!(global_int(&mut vm, "n"), 3);
    }

    #[test]
    fn test_list_index_out_of_range() {
        let err = run_err("l = [1]; x = l[5];");
        assert!(err.message.contains("out of range"));
    }

    #[test]
    fn test_map_literal_and_lookup() {
        let mut vm = run("m = {\"a\": 1, \"b\": 2}; x = m[\"a\"] + m[\"b\"];");
        assert_eq!(global_int(&mut vm, "x"), 3);
    }

    #[test]
    fn test_map_write_and_overwrite() {
        let mut vm = run("m = {}; m[\"k\"] = 1; m[\"k\"] = 2; x = m[\"k\"]; n = count(m);");
        assert_eq!(global_int(&mut vm, "x"), 2);
        assert_eq!(global_int(&mut vm, "n"), 1);
    }

    #[test]
    fn test_map_missing_key_is_an_error() {
        let err = run_err("m = {}; x = m[\"nope\"];");
        assert!(err.message.contains("no key"));
    }

    #[test]
    fn test_index_assignment_result_value() {
        // INSERT2 leaves the assigned value as the expression result.
        let mut vm = run("l = [0]; x = (l[0] = 42);");
        assert_eq!(global_int(&mut vm, "x"), 42);
        assert_eq!(global_display(&mut vm, "l"), "[42]");
    }

    #[test]
    fn test_many_map_entries_grow_during_execution() {
        let mut vm = run(
            "m = {}; i = 0; while i < 50: { m[i] = i * 2; i = i + 1; } x = m[49]; n = count(m);",
        );
        assert_eq!(global_int(&mut vm, "x"), 98);
        assert_eq!(global_int(&mut vm, "n"), 50);
    }

    // =========================================================================
    // Natives and coercions
    // =========================================================================

    #[test]
    fn test_type_name_native() {
        let mut vm = run("a = typeName(1); b = typeName(\"s\"); c = typeName(none);");
        assert_eq!(global_display(&mut vm, "a"), "int");
        assert_eq!(global_display(&mut vm, "b"), "string");
        assert_eq!(global_display(&mut vm, "c"), "none");
    }

    #[test]
    fn test_count_native_on_strings() {
        let mut vm = run("n = count(\"hello\");");
        assert_eq!(global_int(&mut vm, "n"), 5);
    }

    #[test]
    fn test_truthiness_of_conditions() {
        let mut vm = run("x = 0; if \"\": x = 1; if \"a\": x = x + 2; if 0: x = x + 4; if 7: x = x + 8;");
        assert_eq!(global_int(&mut vm, "x"), 10);
    }

    // =========================================================================
    // Collection under load
    // =========================================================================

    #[test]
    fn test_garbage_is_collected_during_execution() {
        let heap = Heap::with_limit(64 * 1024);
        let mut vm = Vm::with_heap(heap).unwrap();

        // Every iteration makes several short-lived objects; without
        // collection this would blow the 64 KiB budget many times over.
        let src = "i = 0; while i < 2000: { s = \"aaaa\" + \"bbbb\"; i = i + 1; }";
        vm.load_and_run(compile_src(src)).unwrap();

        assert_eq!(global_int(&mut vm, "i"), 2000);
    }

    #[test]
    fn test_reachable_values_survive_collection() {
        let heap = Heap::with_limit(64 * 1024);
        let mut vm = Vm::with_heap(heap).unwrap();

        let src = "keep = [1, 2, 3]; i = 0; while i < 2000: { s = \"xx\" + \"yy\"; i = i + 1; } x = keep[2];";
        vm.load_and_run(compile_src(src)).unwrap();
        assert_eq!(global_int(&mut vm, "x"), 3);
    }
}
