//! Recursive-descent parser for Cinder.
//!
//! Consumes the lexer's token stream and produces an [`Ast`]. Statement and
//! expression nodes carry byte spans assembled from the first and last token
//! they cover.
//!
//! One structural quirk worth knowing: a program consisting of exactly one
//! statement is returned as that statement, while longer programs are
//! wrapped in a compound node spanning the whole file. Compound context is
//! what inserts the value-discarding `POP` after expression statements, so
//! the two shapes compile slightly differently.

use std::rc::Rc;

use crate::frontend::lexer::{Spanned, Token};
use crate::lang::ast::{Ast, BinaryOp, Expr, ExprKind, Node, NodeKind, Param, UnaryOp};
use crate::lang::source::Source;

#[derive(Debug)]
pub struct ParserError {
    pub message: String,
    pub line: usize,
    pub col: usize,
}

impl std::fmt::Display for ParserError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}: {}", self.line, self.col, self.message)
    }
}

impl std::error::Error for ParserError {}

pub struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    /// End (offset + length) of the most recently consumed token.
    prev_end: usize,
    source: Rc<Source>,
}

impl Parser {
    pub fn new(tokens: Vec<Spanned>, source: Rc<Source>) -> Self {
        Parser {
            tokens,
            pos: 0,
            prev_end: 0,
            source,
        }
    }

    pub fn parse(&mut self) -> Result<Ast, ParserError> {
        let mut stmts = Vec::new();
        while !self.at_end() {
            stmts.push(self.statement()?);
        }

        let root = if stmts.len() == 1 {
            stmts.remove(0)
        } else {
            Node {
                kind: NodeKind::Compound(stmts),
                offset: 0,
                length: self.source.len(),
            }
        };

        Ok(Ast {
            root,
            source: self.source.clone(),
        })
    }

    // ─────────────────────────── token plumbing ───────────────────────────

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|s| &s.token)
    }

    fn current_offset(&self) -> usize {
        self.tokens
            .get(self.pos)
            .map(|s| s.offset)
            .unwrap_or(self.source.len())
    }

    fn advance(&mut self) -> Option<Spanned> {
        let spanned = self.tokens.get(self.pos).cloned();
        if let Some(s) = &spanned {
            self.prev_end = s.offset + s.length;
        }
        self.pos += 1;
        spanned
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &Token, what: &str) -> Result<Spanned, ParserError> {
        if self.peek() == Some(token) {
            Ok(self.advance().expect("peeked token must exist"))
        } else {
            Err(self.error(format!("expected {}", what)))
        }
    }

    fn error(&self, message: impl Into<String>) -> ParserError {
        let offset = if self.pos < self.tokens.len() {
            self.current_offset()
        } else {
            self.prev_end
        };
        let (line, col) = self.source.line_col(offset);
        ParserError {
            message: message.into(),
            line,
            col,
        }
    }

    // ──────────────────────────── statements ────────────────────────────

    fn statement(&mut self) -> Result<Node, ParserError> {
        let start = self.current_offset();

        match self.peek() {
            Some(Token::LBrace) => {
                self.advance();
                let mut stmts = Vec::new();
                while self.peek() != Some(&Token::RBrace) {
                    if self.at_end() {
                        return Err(self.error("expected '}' to close block"));
                    }
                    stmts.push(self.statement()?);
                }
                self.advance(); // '}'
                Ok(self.node(NodeKind::Compound(stmts), start))
            }

            Some(Token::KwIf) => {
                self.advance();
                let condition = self.expr()?;
                self.expect(&Token::Colon, "':' after if condition")?;
                let true_branch = Box::new(self.statement()?);
                let false_branch = if self.eat(&Token::KwElse) {
                    Some(Box::new(self.statement()?))
                } else {
                    None
                };
                Ok(self.node(
                    NodeKind::IfElse {
                        condition,
                        true_branch,
                        false_branch,
                    },
                    start,
                ))
            }

            Some(Token::KwWhile) => {
                self.advance();
                let condition = self.expr()?;
                self.expect(&Token::Colon, "':' after while condition")?;
                let body = Box::new(self.statement()?);
                Ok(self.node(NodeKind::While { condition, body }, start))
            }

            Some(Token::KwDo) => {
                self.advance();
                let body = Box::new(self.statement()?);
                self.expect(&Token::KwWhile, "'while' after do body")?;
                let condition = self.expr()?;
                self.expect(&Token::Semicolon, "';' after do-while condition")?;
                Ok(self.node(NodeKind::DoWhile { body, condition }, start))
            }

            Some(Token::KwFun) => {
                self.advance();
                let name = self.expect_ident("function name")?;
                self.expect(&Token::LParen, "'(' after function name")?;
                let mut params = Vec::new();
                if self.peek() != Some(&Token::RParen) {
                    loop {
                        let param_start = self.current_offset();
                        let param_name = self.expect_ident("parameter name")?;
                        params.push(Param {
                            name: param_name,
                            offset: param_start,
                            length: self.prev_end - param_start,
                        });
                        if !self.eat(&Token::Comma) {
                            break;
                        }
                    }
                }
                self.expect(&Token::RParen, "')' after parameters")?;
                let body = Box::new(self.statement()?);
                Ok(self.node(NodeKind::Func { name, params, body }, start))
            }

            Some(Token::KwBreak) => {
                self.advance();
                self.expect(&Token::Semicolon, "';' after break")?;
                Ok(self.node(NodeKind::Break, start))
            }

            Some(Token::KwReturn) => {
                self.advance();
                let value = if self.peek() == Some(&Token::Semicolon) {
                    None
                } else {
                    Some(self.expr()?)
                };
                self.expect(&Token::Semicolon, "';' after return value")?;
                Ok(self.node(NodeKind::Return(value), start))
            }

            Some(_) => {
                let expr = self.expr()?;
                self.expect(&Token::Semicolon, "';' after expression")?;
                Ok(expr.into_node())
            }

            None => Err(self.error("expected a statement")),
        }
    }

    fn node(&self, kind: NodeKind, start: usize) -> Node {
        Node {
            kind,
            offset: start,
            length: self.prev_end - start,
        }
    }

    fn expect_ident(&mut self, what: &str) -> Result<String, ParserError> {
        match self.peek() {
            Some(Token::Ident(_)) => {
                let spanned = self.advance().expect("peeked token must exist");
                match spanned.token {
                    Token::Ident(name) => Ok(name),
                    _ => unreachable!(),
                }
            }
            _ => Err(self.error(format!("expected {}", what))),
        }
    }

    // ──────────────────────────── expressions ────────────────────────────

    /// Assignment level. `lhs = rhs` is right-associative; the left side is
    /// a comma tuple whose shape the compiler validates.
    fn expr(&mut self) -> Result<Expr, ParserError> {
        let start = self.current_offset();
        let lhs = self.tuple()?;

        if self.eat(&Token::Assign) {
            let rhs = self.expr()?;
            Ok(self.expr_at(
                ExprKind::Assign(Box::new(lhs), Box::new(rhs)),
                start,
            ))
        } else {
            Ok(lhs)
        }
    }

    /// Comma tuples, built as a right-nested pair tree so that in-order
    /// traversal recovers source order.
    fn tuple(&mut self) -> Result<Expr, ParserError> {
        let mut items = vec![self.or_expr()?];
        while self.eat(&Token::Comma) {
            items.push(self.or_expr()?);
        }

        let mut expr = items.pop().expect("tuple has at least one item");
        while let Some(prev) = items.pop() {
            let offset = prev.offset;
            let length = expr.offset + expr.length - offset;
            expr = Expr {
                kind: ExprKind::Pair(Box::new(prev), Box::new(expr)),
                offset,
                length,
            };
        }
        Ok(expr)
    }

    fn or_expr(&mut self) -> Result<Expr, ParserError> {
        let mut expr = self.and_expr()?;
        while self.eat(&Token::KwOr) {
            let rhs = self.and_expr()?;
            expr = self.binary(BinaryOp::Or, expr, rhs);
        }
        Ok(expr)
    }

    fn and_expr(&mut self) -> Result<Expr, ParserError> {
        let mut expr = self.equality()?;
        while self.eat(&Token::KwAnd) {
            let rhs = self.equality()?;
            expr = self.binary(BinaryOp::And, expr, rhs);
        }
        Ok(expr)
    }

    fn equality(&mut self) -> Result<Expr, ParserError> {
        let mut expr = self.comparison()?;
        loop {
            let op = match self.peek() {
                Some(Token::EqEq) => BinaryOp::Eql,
                Some(Token::BangEq) => BinaryOp::Nql,
                _ => break,
            };
            self.advance();
            let rhs = self.comparison()?;
            expr = self.binary(op, expr, rhs);
        }
        Ok(expr)
    }

    fn comparison(&mut self) -> Result<Expr, ParserError> {
        let mut expr = self.term()?;
        loop {
            let op = match self.peek() {
                Some(Token::Lt) => BinaryOp::Lss,
                Some(Token::LtEq) => BinaryOp::Leq,
                Some(Token::Gt) => BinaryOp::Grt,
                Some(Token::GtEq) => BinaryOp::Geq,
                _ => break,
            };
            self.advance();
            let rhs = self.term()?;
            expr = self.binary(op, expr, rhs);
        }
        Ok(expr)
    }

    fn term(&mut self) -> Result<Expr, ParserError> {
        let mut expr = self.factor()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => break,
            };
            self.advance();
            let rhs = self.factor()?;
            expr = self.binary(op, expr, rhs);
        }
        Ok(expr)
    }

    fn factor(&mut self) -> Result<Expr, ParserError> {
        let mut expr = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                _ => break,
            };
            self.advance();
            let rhs = self.unary()?;
            expr = self.binary(op, expr, rhs);
        }
        Ok(expr)
    }

    fn unary(&mut self) -> Result<Expr, ParserError> {
        let start = self.current_offset();
        let op = match self.peek() {
            Some(Token::KwNot) => Some(UnaryOp::Not),
            Some(Token::Plus) => Some(UnaryOp::Pos),
            Some(Token::Minus) => Some(UnaryOp::Neg),
            _ => None,
        };

        if let Some(op) = op {
            self.advance();
            let operand = self.unary()?;
            Ok(self.expr_at(ExprKind::Unary(op, Box::new(operand)), start))
        } else {
            self.postfix()
        }
    }

    fn postfix(&mut self) -> Result<Expr, ParserError> {
        let start = self.current_offset();
        let mut expr = self.primary()?;

        loop {
            if self.eat(&Token::LParen) {
                let mut args = Vec::new();
                if self.peek() != Some(&Token::RParen) {
                    loop {
                        args.push(self.or_expr()?);
                        if !self.eat(&Token::Comma) {
                            break;
                        }
                    }
                }
                self.expect(&Token::RParen, "')' after arguments")?;
                expr = self.expr_at(
                    ExprKind::Call {
                        func: Box::new(expr),
                        args,
                    },
                    start,
                );
            } else if self.eat(&Token::LBracket) {
                let index = self.or_expr()?;
                self.expect(&Token::RBracket, "']' after index")?;
                expr = self.expr_at(
                    ExprKind::Select {
                        set: Box::new(expr),
                        index: Box::new(index),
                    },
                    start,
                );
            } else {
                break;
            }
        }

        Ok(expr)
    }

    fn primary(&mut self) -> Result<Expr, ParserError> {
        let start = self.current_offset();

        let spanned = match self.advance() {
            Some(s) => s,
            None => return Err(self.error("expected an expression")),
        };

        let kind = match spanned.token {
            Token::Int(value) => ExprKind::Int(value),
            Token::Float(value) => ExprKind::Float(value),
            Token::Str(value) => ExprKind::Str(value),
            Token::Ident(name) => ExprKind::Ident(name),
            Token::KwTrue => ExprKind::True,
            Token::KwFalse => ExprKind::False,
            Token::KwNone => ExprKind::None,

            Token::LParen => {
                let expr = self.expr()?;
                self.expect(&Token::RParen, "')' after expression")?;
                return Ok(expr);
            }

            Token::LBracket => {
                let mut items = Vec::new();
                if self.peek() != Some(&Token::RBracket) {
                    loop {
                        items.push(self.or_expr()?);
                        if !self.eat(&Token::Comma) {
                            break;
                        }
                    }
                }
                self.expect(&Token::RBracket, "']' after list items")?;
                ExprKind::List(items)
            }

            Token::LBrace => {
                let mut entries = Vec::new();
                if self.peek() != Some(&Token::RBrace) {
                    loop {
                        let key = self.or_expr()?;
                        self.expect(&Token::Colon, "':' after map key")?;
                        let value = self.or_expr()?;
                        entries.push((key, value));
                        if !self.eat(&Token::Comma) {
                            break;
                        }
                    }
                }
                self.expect(&Token::RBrace, "'}' after map entries")?;
                ExprKind::Map(entries)
            }

            other => {
                return Err(self.error(format!("unexpected token {:?}", other)));
            }
        };

        Ok(self.expr_at(kind, start))
    }

    fn binary(&self, op: BinaryOp, lhs: Expr, rhs: Expr) -> Expr {
        let offset = lhs.offset;
        Expr {
            kind: ExprKind::Binary(op, Box::new(lhs), Box::new(rhs)),
            offset,
            length: self.prev_end - offset,
        }
    }

    fn expr_at(&self, kind: ExprKind, start: usize) -> Expr {
        Expr {
            kind,
            offset: start,
            length: self.prev_end - start,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::lexer::Lexer;

    fn parse(src: &str) -> Ast {
        let tokens = Lexer::new(src).tokenize().unwrap();
        let source = Source::new(None, src);
        Parser::new(tokens, source).parse().unwrap()
    }

    fn parse_err(src: &str) -> ParserError {
        let tokens = Lexer::new(src).tokenize().unwrap();
        let source = Source::new(None, src);
        Parser::new(tokens, source).parse().unwrap_err()
    }

    #[test]
    fn test_single_statement_is_root() {
        let ast = parse("return 1;");
        assert!(matches!(ast.root.kind, NodeKind::Return(Some(_))));
    }

    #[test]
    fn test_multiple_statements_wrap_in_compound() {
        let ast = parse("x = 1; y = 2;");
        match &ast.root.kind {
            NodeKind::Compound(stmts) => assert_eq!(stmts.len(), 2),
            other => panic!("expected compound, got {:?}", other),
        }
    }

    #[test]
    fn test_precedence() {
        // 1 + 2 * 3 parses as 1 + (2 * 3)
        let ast = parse("1 + 2 * 3;");
        match &ast.root.kind {
            NodeKind::Expr(Expr {
                kind: ExprKind::Binary(BinaryOp::Add, lhs, rhs),
                ..
            }) => {
                assert!(matches!(lhs.kind, ExprKind::Int(1)));
                assert!(matches!(rhs.kind, ExprKind::Binary(BinaryOp::Mul, _, _)));
            }
            other => panic!("expected binary add, got {:?}", other),
        }
    }

    #[test]
    fn test_comparison_binds_tighter_than_or() {
        let ast = parse("a == 1 or b == 2;");
        match &ast.root.kind {
            NodeKind::Expr(Expr {
                kind: ExprKind::Binary(BinaryOp::Or, lhs, rhs),
                ..
            }) => {
                assert!(matches!(lhs.kind, ExprKind::Binary(BinaryOp::Eql, _, _)));
                assert!(matches!(rhs.kind, ExprKind::Binary(BinaryOp::Eql, _, _)));
            }
            other => panic!("expected or at top, got {:?}", other),
        }
    }

    #[test]
    fn test_if_else() {
        let ast = parse("if x < 0: return -x; else return x;");
        match &ast.root.kind {
            NodeKind::IfElse {
                false_branch: Some(_),
                ..
            } => {}
            other => panic!("expected if-else, got {:?}", other),
        }
    }

    #[test]
    fn test_while_with_block() {
        let ast = parse("while n > 0: { n = n - 1; }");
        match &ast.root.kind {
            NodeKind::While { body, .. } => {
                assert!(matches!(body.kind, NodeKind::Compound(_)));
            }
            other => panic!("expected while, got {:?}", other),
        }
    }

    #[test]
    fn test_do_while() {
        let ast = parse("do { x = x + 1; } while x < 10;");
        assert!(matches!(ast.root.kind, NodeKind::DoWhile { .. }));
    }

    #[test]
    fn test_function_definition() {
        let ast = parse("fun add(a, b) return a + b;");
        match &ast.root.kind {
            NodeKind::Func { name, params, body } => {
                assert_eq!(name, "add");
                assert_eq!(params.len(), 2);
                assert_eq!(params[0].name, "a");
                assert!(matches!(body.kind, NodeKind::Return(Some(_))));
            }
            other => panic!("expected function, got {:?}", other),
        }
    }

    #[test]
    fn test_tuple_assignment() {
        let ast = parse("a, b = f(x);");
        match &ast.root.kind {
            NodeKind::Expr(Expr {
                kind: ExprKind::Assign(lhs, rhs),
                ..
            }) => {
                assert!(matches!(lhs.kind, ExprKind::Pair(_, _)));
                assert!(matches!(rhs.kind, ExprKind::Call { .. }));
            }
            other => panic!("expected assignment, got {:?}", other),
        }
    }

    #[test]
    fn test_pair_tree_is_right_nested() {
        let ast = parse("a, b, c = f();");
        match &ast.root.kind {
            NodeKind::Expr(Expr {
                kind: ExprKind::Assign(lhs, _),
                ..
            }) => match &lhs.kind {
                ExprKind::Pair(head, tail) => {
                    assert!(matches!(head.kind, ExprKind::Ident(_)));
                    assert!(matches!(tail.kind, ExprKind::Pair(_, _)));
                }
                other => panic!("expected pair, got {:?}", other),
            },
            other => panic!("expected assignment, got {:?}", other),
        }
    }

    #[test]
    fn test_index_and_call_chain() {
        let ast = parse("table[key](1)[0];");
        match &ast.root.kind {
            NodeKind::Expr(expr) => {
                assert!(matches!(expr.kind, ExprKind::Select { .. }));
            }
            other => panic!("expected expression, got {:?}", other),
        }
    }

    #[test]
    fn test_list_and_map_literals() {
        let ast = parse("x = [1, 2.5, \"s\"];");
        match &ast.root.kind {
            NodeKind::Expr(Expr {
                kind: ExprKind::Assign(_, rhs),
                ..
            }) => match &rhs.kind {
                ExprKind::List(items) => assert_eq!(items.len(), 3),
                other => panic!("expected list, got {:?}", other),
            },
            other => panic!("expected assignment, got {:?}", other),
        }

        let ast = parse("x = {\"a\": 1, \"b\": 2};");
        match &ast.root.kind {
            NodeKind::Expr(Expr {
                kind: ExprKind::Assign(_, rhs),
                ..
            }) => match &rhs.kind {
                ExprKind::Map(entries) => assert_eq!(entries.len(), 2),
                other => panic!("expected map, got {:?}", other),
            },
            other => panic!("expected assignment, got {:?}", other),
        }
    }

    #[test]
    fn test_brace_statement_is_block_not_map() {
        let ast = parse("{ x = 1; }");
        assert!(matches!(ast.root.kind, NodeKind::Compound(_)));
    }

    #[test]
    fn test_spans_cover_statements() {
        let src = "while n > 0: { n = n - 1; }";
        let ast = parse(src);
        assert_eq!(ast.root.offset, 0);
        assert_eq!(ast.root.length, src.len());
    }

    #[test]
    fn test_missing_semicolon() {
        let err = parse_err("x = 1");
        assert!(err.message.contains("expected ';'"));
    }

    #[test]
    fn test_error_position_is_line_col() {
        let err = parse_err("x = 1;\ny = ;");
        assert_eq!(err.line, 2);
        assert!(err.col > 1);
    }

    #[test]
    fn test_empty_program() {
        let ast = parse("");
        match &ast.root.kind {
            NodeKind::Compound(stmts) => assert!(stmts.is_empty()),
            other => panic!("expected empty compound, got {:?}", other),
        }
    }
}
