//! Lowers the AST into bytecode.
//!
//! The entry point is [`compile`], which walks the statement tree and writes
//! instructions into an [`ExeBuilder`]. Forward jump targets (the end of a
//! loop, the else branch, the instruction after an inlined function body)
//! are emitted as [`Promise`] operands and resolved as soon as the target
//! index is known; finalization turns them into plain integers.
//!
//! Some semantic errors are caught at this phase (`break` outside a loop,
//! bad assignment targets, tuple arity problems). Any error aborts the whole
//! pass; no partial executable is ever returned.

use crate::bytecode::exe::{ExeBuilder, Executable, Promise};
use crate::bytecode::op::{Opcode, Operand};
use crate::error::{Error, ErrorKind};
use crate::lang::ast::{Ast, BinaryOp, Expr, ExprKind, Node, NodeKind, Param, UnaryOp};

/// Static bound on flattened tuple size, for both assignment targets and
/// return values.
pub const MAX_TUPLE: usize = 32;

/// Serializes an AST into bytecode.
///
/// Returns the finalized [`Executable`], or the first error encountered.
pub fn compile(ast: &Ast) -> Result<Executable, Error> {
    let mut cg = Codegen {
        builder: ExeBuilder::new(ast.source.clone()),
    };

    cg.emit_node(&ast.root, None)?;

    // Program-level tail, so execution always ends on a return.
    cg.emit(
        Opcode::Return,
        vec![Operand::Int(0)],
        ast.source.len(),
        0,
    );

    let exe = cg.builder.finalize()?;
    tracing::debug!(instructions = exe.len(), "compiled program");
    Ok(exe)
}

struct Codegen {
    builder: ExeBuilder,
}

impl Codegen {
    fn emit(&mut self, opcode: Opcode, operands: Vec<Operand>, offset: usize, length: usize) {
        self.builder.append(opcode, operands, offset, length);
    }

    fn emit_pop1(&mut self, offset: usize, length: usize) {
        self.emit(Opcode::Pop, vec![Operand::Int(1)], offset, length);
    }

    fn emit_ass(&mut self, name: &str, offset: usize, length: usize) {
        self.emit(
            Opcode::Ass,
            vec![Operand::Str(name.to_string())],
            offset,
            length,
        );
    }

    // ──────────────────────────── statements ────────────────────────────

    /// `break_dest` names the instruction immediately after the innermost
    /// loop; `None` outside of loops.
    fn emit_node(&mut self, node: &Node, break_dest: Option<&Promise>) -> Result<(), Error> {
        match &node.kind {
            NodeKind::Expr(expr) => self.emit_expr(expr, break_dest),

            NodeKind::Break => {
                let dest = break_dest.ok_or_else(|| {
                    Error::user(ErrorKind::BreakOutsideLoop, "break not inside a loop")
                })?;
                self.emit(
                    Opcode::Jump,
                    vec![Operand::Promise(dest.clone())],
                    node.offset,
                    node.length,
                );
                Ok(())
            }

            NodeKind::IfElse {
                condition,
                true_branch,
                false_branch,
            } => self.emit_if_else(node, condition, true_branch, false_branch.as_deref(), break_dest),

            NodeKind::While { condition, body } => {
                // start:
                //   <condition>
                //   JUMPIFNOTANDPOP end
                //   <body>
                //   JUMP start
                // end:
                let start = Promise::new();
                let end = Promise::new();

                start.resolve(self.builder.count())?;

                self.emit_expr(condition, break_dest)?;
                self.emit(
                    Opcode::JumpIfNotAndPop,
                    vec![Operand::Promise(end.clone())],
                    condition.offset,
                    condition.length,
                );

                self.emit_node(body, Some(&end))?;
                if body.is_expr() {
                    self.emit_pop1(body.offset, 0);
                }

                self.emit(
                    Opcode::Jump,
                    vec![Operand::Promise(start)],
                    node.offset,
                    node.length,
                );

                end.resolve(self.builder.count())?;
                Ok(())
            }

            NodeKind::DoWhile { body, condition } => {
                // start:
                //   <body>
                //   <condition>
                //   JUMPIFANDPOP start
                //
                // The back-edge target is already known, so it is emitted as
                // a direct integer rather than a promise.
                let end = Promise::new();
                let start = self.builder.count();

                self.emit_node(body, Some(&end))?;
                if body.is_expr() {
                    self.emit_pop1(body.offset, 0);
                }

                self.emit_expr(condition, break_dest)?;
                self.emit(
                    Opcode::JumpIfAndPop,
                    vec![Operand::Int(start)],
                    condition.offset,
                    condition.length,
                );

                end.resolve(self.builder.count())?;
                Ok(())
            }

            NodeKind::Compound(stmts) => {
                for stmt in stmts {
                    self.emit_node(stmt, break_dest)?;
                    if stmt.is_expr() {
                        self.emit_pop1(stmt.offset, 0);
                    }
                }
                Ok(())
            }

            NodeKind::Return(value) => {
                let mut tuple = Vec::new();
                if let Some(value) = value {
                    flatten_tuple(value, &mut tuple)?;
                }

                for item in &tuple {
                    self.emit_expr(item, break_dest)?;
                }

                self.emit(
                    Opcode::Return,
                    vec![Operand::Int(tuple.len() as i64)],
                    node.offset,
                    node.length,
                );
                Ok(())
            }

            NodeKind::Func { name, params, body } => {
                self.emit_func(node, name, params, body)
            }
        }
    }

    fn emit_if_else(
        &mut self,
        node: &Node,
        condition: &Expr,
        true_branch: &Node,
        false_branch: Option<&Node>,
        break_dest: Option<&Promise>,
    ) -> Result<(), Error> {
        self.emit_expr(condition, break_dest)?;

        if let Some(false_branch) = false_branch {
            let else_offset = Promise::new();
            let done_offset = Promise::new();

            self.emit(
                Opcode::JumpIfNotAndPop,
                vec![Operand::Promise(else_offset.clone())],
                node.offset,
                node.length,
            );

            self.emit_node(true_branch, break_dest)?;
            if true_branch.is_expr() {
                self.emit_pop1(true_branch.offset, 0);
            }

            self.emit(
                Opcode::Jump,
                vec![Operand::Promise(done_offset.clone())],
                node.offset,
                node.length,
            );

            else_offset.resolve(self.builder.count())?;

            self.emit_node(false_branch, break_dest)?;
            if false_branch.is_expr() {
                self.emit_pop1(false_branch.offset, 0);
            }

            done_offset.resolve(self.builder.count())?;
        } else {
            let done_offset = Promise::new();

            self.emit(
                Opcode::JumpIfNotAndPop,
                vec![Operand::Promise(done_offset.clone())],
                node.offset,
                node.length,
            );

            self.emit_node(true_branch, break_dest)?;
            if true_branch.is_expr() {
                self.emit_pop1(true_branch.offset, 0);
            }

            done_offset.resolve(self.builder.count())?;
        }

        Ok(())
    }

    /// Function bodies are inlined into the same instruction stream: the
    /// definition site pushes a function value, binds it, then jumps over
    /// the body. The function value holds only the entry index and the
    /// capturing scope.
    fn emit_func(
        &mut self,
        node: &Node,
        name: &str,
        params: &[Param],
        body: &Node,
    ) -> Result<(), Error> {
        let func_index = Promise::new();
        let jump_index = Promise::new();

        self.emit(
            Opcode::PushFun,
            vec![
                Operand::Promise(func_index.clone()),
                Operand::Int(params.len() as i64),
            ],
            node.offset,
            node.length,
        );

        self.emit_ass(name, node.offset, node.length);
        self.emit_pop1(node.offset, node.length);

        // Jump past the inlined body.
        self.emit(
            Opcode::Jump,
            vec![Operand::Promise(jump_index.clone())],
            node.offset,
            node.length,
        );

        func_index.resolve(self.builder.count())?;

        // Bind the arguments the caller left on the stack.
        for param in params {
            self.emit_ass(&param.name, param.offset, param.length);
            self.emit_pop1(param.offset, param.length);
        }

        // `break` does not cross function boundaries.
        self.emit_node(body, None)?;
        if body.is_expr() {
            self.emit_pop1(body.offset + body.length, 0);
        }

        // In case the body didn't already return.
        self.emit(Opcode::Return, vec![Operand::Int(0)], body.offset, 0);

        jump_index.resolve(self.builder.count())?;
        Ok(())
    }

    // ──────────────────────────── expressions ────────────────────────────

    fn emit_expr(&mut self, expr: &Expr, break_dest: Option<&Promise>) -> Result<(), Error> {
        match &expr.kind {
            ExprKind::Pair(_, _) => Err(Error::user(
                ErrorKind::TupleOutsideAssignment,
                "tuple outside of assignment or return statement",
            )),

            ExprKind::Unary(op, operand) => {
                self.emit_expr(operand, break_dest)?;
                let opcode = match op {
                    UnaryOp::Not => Opcode::Not,
                    UnaryOp::Pos => Opcode::Pos,
                    UnaryOp::Neg => Opcode::Neg,
                };
                self.emit(opcode, vec![], expr.offset, expr.length);
                Ok(())
            }

            ExprKind::Binary(op, lhs, rhs) => {
                self.emit_expr(lhs, break_dest)?;
                self.emit_expr(rhs, break_dest)?;
                self.emit(binop_to_opcode(*op), vec![], expr.offset, expr.length);
                Ok(())
            }

            ExprKind::Assign(lhs, rhs) => self.emit_assignment(expr, lhs, rhs, break_dest),

            ExprKind::Int(value) => {
                self.emit(
                    Opcode::PushInt,
                    vec![Operand::Int(*value)],
                    expr.offset,
                    expr.length,
                );
                Ok(())
            }

            ExprKind::Float(value) => {
                self.emit(
                    Opcode::PushFlt,
                    vec![Operand::Float(*value)],
                    expr.offset,
                    expr.length,
                );
                Ok(())
            }

            ExprKind::Str(value) => {
                self.emit(
                    Opcode::PushStr,
                    vec![Operand::Str(value.clone())],
                    expr.offset,
                    expr.length,
                );
                Ok(())
            }

            ExprKind::Ident(name) => {
                self.emit(
                    Opcode::PushVar,
                    vec![Operand::Str(name.clone())],
                    expr.offset,
                    expr.length,
                );
                Ok(())
            }

            ExprKind::List(items) => {
                // PUSHLST
                // PUSHINT <index>
                // <item>
                // INSERT
                self.emit(
                    Opcode::PushLst,
                    vec![Operand::Int(items.len() as i64)],
                    expr.offset,
                    expr.length,
                );

                for (i, item) in items.iter().enumerate() {
                    self.emit(
                        Opcode::PushInt,
                        vec![Operand::Int(i as i64)],
                        item.offset,
                        item.length,
                    );
                    self.emit_expr(item, break_dest)?;
                    self.emit(Opcode::Insert, vec![], item.offset, item.length);
                }
                Ok(())
            }

            ExprKind::Map(entries) => {
                self.emit(
                    Opcode::PushMap,
                    vec![Operand::Int(entries.len() as i64)],
                    expr.offset,
                    expr.length,
                );

                for (key, value) in entries {
                    self.emit_expr(key, break_dest)?;
                    self.emit_expr(value, break_dest)?;
                    self.emit(Opcode::Insert, vec![], value.offset, value.length);
                }
                Ok(())
            }

            ExprKind::Call { func, args } => {
                self.emit_call(func, args, expr.offset, expr.length, break_dest, 1)
            }

            ExprKind::Select { set, index } => {
                self.emit_expr(set, break_dest)?;
                self.emit_expr(index, break_dest)?;
                self.emit(Opcode::Select, vec![], expr.offset, expr.length);
                Ok(())
            }

            ExprKind::None => {
                self.emit(Opcode::PushNne, vec![], expr.offset, expr.length);
                Ok(())
            }

            ExprKind::True => {
                self.emit(Opcode::PushTru, vec![], expr.offset, expr.length);
                Ok(())
            }

            ExprKind::False => {
                self.emit(Opcode::PushFls, vec![], expr.offset, expr.length);
                Ok(())
            }
        }
    }

    fn emit_call(
        &mut self,
        func: &Expr,
        args: &[Expr],
        offset: usize,
        length: usize,
        break_dest: Option<&Promise>,
        returns: i64,
    ) -> Result<(), Error> {
        for arg in args {
            self.emit_expr(arg, break_dest)?;
        }

        self.emit_expr(func, break_dest)?;

        self.emit(
            Opcode::Call,
            vec![Operand::Int(args.len() as i64), Operand::Int(returns)],
            offset,
            length,
        );
        Ok(())
    }

    /// Targets are stored in reverse so that the first-bound value is the
    /// one left on the stack as the expression's result.
    fn emit_assignment(
        &mut self,
        expr: &Expr,
        lhs: &Expr,
        rhs: &Expr,
        break_dest: Option<&Promise>,
    ) -> Result<(), Error> {
        let mut tuple = Vec::new();
        flatten_tuple(lhs, &mut tuple)?;

        if tuple.len() == 1 {
            self.emit_expr(rhs, break_dest)?;
        } else {
            match &rhs.kind {
                ExprKind::Call { func, args } => {
                    self.emit_call(
                        func,
                        args,
                        rhs.offset,
                        rhs.length,
                        break_dest,
                        tuple.len() as i64,
                    )?;
                }
                _ => {
                    return Err(Error::user(
                        ErrorKind::TupleArityMismatch,
                        format!("assigning to {} variables only 1 value", tuple.len()),
                    ));
                }
            }
        }

        for i in 0..tuple.len() {
            let item = tuple[tuple.len() - 1 - i];
            match &item.kind {
                ExprKind::Ident(name) => {
                    self.emit_ass(name, item.offset, item.length);
                }

                ExprKind::Select { set, index } => {
                    self.emit_expr(set, break_dest)?;
                    self.emit_expr(index, break_dest)?;
                    self.emit(Opcode::Insert2, vec![], item.offset, item.length);
                }

                _ => {
                    return Err(Error::user(
                        ErrorKind::InvalidAssignmentTarget,
                        "assigning to something that can't be assigned to",
                    ));
                }
            }

            if i + 1 < tuple.len() {
                self.emit_pop1(expr.offset, 0);
            }
        }

        Ok(())
    }
}

fn binop_to_opcode(op: BinaryOp) -> Opcode {
    match op {
        BinaryOp::Add => Opcode::Add,
        BinaryOp::Sub => Opcode::Sub,
        BinaryOp::Mul => Opcode::Mul,
        BinaryOp::Div => Opcode::Div,
        BinaryOp::Eql => Opcode::Eql,
        BinaryOp::Nql => Opcode::Nql,
        BinaryOp::Lss => Opcode::Lss,
        BinaryOp::Leq => Opcode::Leq,
        BinaryOp::Grt => Opcode::Grt,
        BinaryOp::Geq => Opcode::Geq,
        BinaryOp::And => Opcode::And,
        BinaryOp::Or => Opcode::Or,
    }
}

/// Flattens a comma pair tree into its leaves, in source order.
fn flatten_tuple<'a>(expr: &'a Expr, tuple: &mut Vec<&'a Expr>) -> Result<(), Error> {
    if let ExprKind::Pair(head, tail) = &expr.kind {
        flatten_tuple(head, tuple)?;
        flatten_tuple(tail, tuple)?;
    } else {
        if tuple.len() == MAX_TUPLE {
            return Err(Error::user(
                ErrorKind::TuplePairTooLarge,
                format!("tuples are limited to {} elements", MAX_TUPLE),
            ));
        }
        tuple.push(expr);
    }
    Ok(())
}
