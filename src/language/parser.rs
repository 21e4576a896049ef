use crate::language::{
    ast::*,
    errors::{SyntaxError, SyntaxErrors},
    lexer::lex,
    span::{LineIndex, Location, Span},
    token::{Token, TokenKind},
};
use std::{path::PathBuf, sync::Arc};

pub fn parse_script(source: &str, external_file: Option<PathBuf>) -> Result<Program, SyntaxErrors> {
    let tokens = match lex(source) {
        Ok(tokens) => tokens,
        Err(errors) => {
            let errs = errors
                .into_iter()
                .map(|err| SyntaxError::new(err.message, err.span))
                .collect();
            return Err(SyntaxErrors::new(errs));
        }
    };
    Parser::new(source, tokens).parse(external_file)
}

struct Parser {
    lines: LineIndex,
    tokens: Vec<Token>,
    pos: usize,
    errors: Vec<SyntaxError>,
    function_depth: usize,
    nesting: usize,
}

/// Deepest expression or statement nesting accepted before parsing gives up.
const MAX_NESTING: usize = 128;

impl Parser {
    fn new(source: &str, tokens: Vec<Token>) -> Self {
        Self {
            lines: LineIndex::new(source),
            tokens,
            pos: 0,
            errors: Vec::new(),
            function_depth: 0,
            nesting: 0,
        }
    }

    fn parse(mut self, external_file: Option<PathBuf>) -> Result<Program, SyntaxErrors> {
        let mut statements = Vec::new();
        let mut functions = Vec::new();

        while !self.is_eof() {
            if self.matches(TokenKind::Semi) {
                continue;
            }

            if self.check(TokenKind::Function) {
                match self.parse_function() {
                    Ok(def) => functions.push(Arc::new(def)),
                    Err(err) => {
                        self.report(err);
                        self.synchronize();
                    }
                }
                continue;
            }

            match self.parse_statement() {
                Ok(statement) => statements.push(statement),
                Err(err) => {
                    self.report(err);
                    self.synchronize();
                }
            }
        }

        if self.errors.is_empty() {
            Ok(Program {
                statements,
                functions,
                external_file,
            })
        } else {
            Err(SyntaxErrors::new(self.errors))
        }
    }

    fn parse_function(&mut self) -> Result<FunctionDef, SyntaxError> {
        let start = self.expect(TokenKind::Function)?.span.start;
        if self.function_depth > 0 {
            return Err(SyntaxError::new(
                "Function declarations are only allowed at the top level",
                Span::new(start, self.current_span_start()),
            ));
        }
        let name = self.expect_identifier("Expected function name")?;
        self.expect(TokenKind::LParen)?;
        let mut params: Vec<String> = Vec::new();
        if !self.check(TokenKind::RParen) {
            loop {
                let param = self.expect_identifier("Expected parameter name")?;
                if params.contains(&param.name) {
                    return Err(SyntaxError::new(
                        format!("Duplicate parameter `{}`", param.name),
                        param.span,
                    ));
                }
                params.push(param.name);
                if self.matches(TokenKind::Comma) {
                    continue;
                }
                break;
            }
        }
        self.expect(TokenKind::RParen)?;

        self.function_depth += 1;
        let body = self.parse_block();
        self.function_depth -= 1;
        let body = body?;

        Ok(FunctionDef {
            name: name.name,
            params,
            location: self.locate(Span::new(start, body.span.end)),
            body,
        })
    }

    fn parse_block(&mut self) -> Result<Block, SyntaxError> {
        let start = self.expect(TokenKind::LBrace)?.span.start;
        let statements = self.parse_statement_list()?;
        let end = self.expect(TokenKind::RBrace)?.span.end;
        Ok(Block {
            statements,
            span: Span::new(start, end),
        })
    }

    fn parse_statement_list(&mut self) -> Result<Vec<Statement>, SyntaxError> {
        let mut statements = Vec::new();
        while !self.check(TokenKind::RBrace)
            && !self.check(TokenKind::Case)
            && !self.check(TokenKind::Default)
            && !self.is_eof()
        {
            if self.matches(TokenKind::Semi) {
                continue;
            }
            if self.check(TokenKind::Function) {
                // Reuse the declaration parser so the nesting error points at the keyword.
                self.function_depth += 1;
                let result = self.parse_function();
                self.function_depth -= 1;
                result?;
                continue;
            }
            statements.push(self.parse_statement()?);
        }
        Ok(statements)
    }

    fn parse_statement(&mut self) -> Result<Statement, SyntaxError> {
        self.nested(Self::parse_statement_inner)
    }

    fn parse_statement_inner(&mut self) -> Result<Statement, SyntaxError> {
        let start = self.current_span_start();
        let kind = match self.peek_kind() {
            Some(TokenKind::LBrace) => StatementKind::Block(self.parse_block()?),
            Some(TokenKind::Semi) => {
                let span = self.advance().span;
                StatementKind::Block(Block {
                    statements: Vec::new(),
                    span,
                })
            }
            Some(TokenKind::Var | TokenKind::Local) => {
                self.advance();
                let stmt = self.parse_declaration(DeclKind::Var, false)?;
                self.expect_terminator()?;
                StatementKind::Declare(stmt)
            }
            Some(TokenKind::Const) => {
                self.advance();
                self.consume_optional(TokenKind::Var);
                let stmt = self.parse_declaration(DeclKind::Const, true)?;
                self.expect_terminator()?;
                StatementKind::Declare(stmt)
            }
            Some(TokenKind::Reg) => {
                self.advance();
                let stmt = self.parse_declaration(DeclKind::Register, false)?;
                self.expect_terminator()?;
                StatementKind::Declare(stmt)
            }
            Some(TokenKind::Global) => {
                self.advance();
                let stmt = self.parse_declaration(DeclKind::Global, false)?;
                self.expect_terminator()?;
                StatementKind::Declare(stmt)
            }
            Some(TokenKind::If) => {
                self.advance();
                StatementKind::If(self.parse_if()?)
            }
            Some(TokenKind::While) => {
                self.advance();
                let condition = self.parse_parenthesized()?;
                let body = Box::new(self.parse_statement()?);
                StatementKind::While(WhileStmt { condition, body })
            }
            Some(TokenKind::Do) => {
                self.advance();
                let body = Box::new(self.parse_statement()?);
                self.expect(TokenKind::While)?;
                let condition = self.parse_parenthesized()?;
                self.expect_terminator()?;
                StatementKind::DoWhile(WhileStmt { condition, body })
            }
            Some(TokenKind::For) => {
                self.advance();
                self.parse_for()?
            }
            Some(TokenKind::Switch) => {
                self.advance();
                StatementKind::Switch(self.parse_switch()?)
            }
            Some(TokenKind::Return) => {
                self.advance();
                let value = if self.at_terminator() {
                    None
                } else {
                    Some(self.parse_expression()?)
                };
                self.expect_terminator()?;
                StatementKind::Return(value)
            }
            Some(TokenKind::Break) => {
                self.advance();
                self.expect_terminator()?;
                StatementKind::Break
            }
            Some(TokenKind::Continue) => {
                self.advance();
                self.expect_terminator()?;
                StatementKind::Continue
            }
            _ => {
                let expr = self.parse_expression()?;
                self.expect_terminator()?;
                StatementKind::Expr(expr)
            }
        };
        let end = self.last_span_end(start);
        Ok(Statement {
            kind,
            location: self.locate(Span::new(start, end)),
        })
    }

    fn parse_declaration(
        &mut self,
        kind: DeclKind,
        requires_value: bool,
    ) -> Result<DeclareStmt, SyntaxError> {
        let name = self.expect_identifier("Expected variable name")?;
        let value = if self.matches(TokenKind::Eq) {
            Some(self.parse_expression()?)
        } else if requires_value {
            return Err(
                SyntaxError::new(format!("Constant `{}` needs a value", name.name), name.span)
                    .with_help("write `const name = value;`"),
            );
        } else {
            None
        };
        Ok(DeclareStmt {
            kind,
            name: name.name,
            value,
        })
    }

    fn parse_if(&mut self) -> Result<IfStmt, SyntaxError> {
        let condition = self.parse_parenthesized()?;
        let then_branch = Box::new(self.parse_statement()?);
        let else_branch = if self.matches(TokenKind::Else) {
            Some(Box::new(self.parse_statement()?))
        } else {
            None
        };
        Ok(IfStmt {
            condition,
            then_branch,
            else_branch,
        })
    }

    fn parse_for(&mut self) -> Result<StatementKind, SyntaxError> {
        self.expect(TokenKind::LParen)?;

        let declares = matches!(self.peek_kind(), Some(TokenKind::Var | TokenKind::Local));
        let offset = usize::from(declares);
        if matches!(self.peek_kind_n(offset), Some(TokenKind::Identifier(_)))
            && self.peek_kind_n(offset + 1) == Some(TokenKind::In)
        {
            if declares {
                self.advance();
            }
            let binding = self.expect_identifier("Expected loop variable")?;
            self.expect(TokenKind::In)?;
            let iterable = self.parse_expression()?;
            self.expect(TokenKind::RParen)?;
            let body = Box::new(self.parse_statement()?);
            return Ok(StatementKind::ForIn(ForInStmt {
                binding: binding.name,
                iterable,
                body,
            }));
        }

        let init = if self.matches(TokenKind::Semi) {
            None
        } else {
            let start = self.current_span_start();
            let kind = if self.matches(TokenKind::Var) || self.matches(TokenKind::Local) {
                StatementKind::Declare(self.parse_declaration(DeclKind::Var, false)?)
            } else {
                StatementKind::Expr(self.parse_expression()?)
            };
            let end = self.last_span_end(start);
            self.expect(TokenKind::Semi)?;
            Some(Box::new(Statement {
                kind,
                location: self.locate(Span::new(start, end)),
            }))
        };
        let condition = if self.check(TokenKind::Semi) {
            None
        } else {
            Some(self.parse_expression()?)
        };
        self.expect(TokenKind::Semi)?;
        let step = if self.check(TokenKind::RParen) {
            None
        } else {
            Some(self.parse_expression()?)
        };
        self.expect(TokenKind::RParen)?;
        let body = Box::new(self.parse_statement()?);
        Ok(StatementKind::For(ForStmt {
            init,
            condition,
            step,
            body,
        }))
    }

    fn parse_switch(&mut self) -> Result<SwitchStmt, SyntaxError> {
        let subject = self.parse_parenthesized()?;
        self.expect(TokenKind::LBrace)?;
        let mut cases = Vec::new();
        let mut default = None;
        while !self.check(TokenKind::RBrace) && !self.is_eof() {
            if self.matches(TokenKind::Default) {
                if default.is_some() {
                    return Err(self.error_here("Duplicate default case"));
                }
                self.expect(TokenKind::Colon)?;
                default = Some(self.parse_statement_list()?);
                continue;
            }
            self.expect(TokenKind::Case)?;
            let mut values = vec![self.parse_expression()?];
            while self.matches(TokenKind::Comma) {
                values.push(self.parse_expression()?);
            }
            self.expect(TokenKind::Colon)?;
            // Stacked `case a: case b:` labels share the following body.
            while self.matches(TokenKind::Case) {
                values.push(self.parse_expression()?);
                self.expect(TokenKind::Colon)?;
            }
            let body = self.parse_statement_list()?;
            cases.push(SwitchCase { values, body });
        }
        self.expect(TokenKind::RBrace)?;
        Ok(SwitchStmt {
            subject,
            cases,
            default,
        })
    }

    fn parse_parenthesized(&mut self) -> Result<Expr, SyntaxError> {
        self.expect(TokenKind::LParen)?;
        let expr = self.parse_expression()?;
        self.expect(TokenKind::RParen)?;
        Ok(expr)
    }

    fn parse_expression(&mut self) -> Result<Expr, SyntaxError> {
        self.nested(Self::parse_assignment)
    }

    /// Runs `parse` one nesting level deeper, failing past [`MAX_NESTING`].
    fn nested<T>(
        &mut self,
        parse: impl FnOnce(&mut Self) -> Result<T, SyntaxError>,
    ) -> Result<T, SyntaxError> {
        if self.nesting >= MAX_NESTING {
            return Err(self.error_here("Nesting is too deep"));
        }
        self.nesting += 1;
        let result = parse(self);
        self.nesting -= 1;
        result
    }

    fn parse_assignment(&mut self) -> Result<Expr, SyntaxError> {
        let target = self.parse_conditional()?;
        let op = match self.peek_kind() {
            Some(TokenKind::Eq) => None,
            Some(TokenKind::PlusEq) => Some(BinaryOp::Add),
            Some(TokenKind::MinusEq) => Some(BinaryOp::Sub),
            Some(TokenKind::StarEq) => Some(BinaryOp::Mul),
            Some(TokenKind::SlashEq) => Some(BinaryOp::Div),
            Some(TokenKind::PercentEq) => Some(BinaryOp::Rem),
            _ => return Ok(target),
        };
        let op_span = self.advance().span;
        if !is_assignable(&target) {
            return Err(SyntaxError::new("Cannot assign to this expression", op_span));
        }
        let value = self.parse_expression()?;
        let span = target.span().union(value.span());
        Ok(Expr::Assign {
            op,
            target: Box::new(target),
            value: Box::new(value),
            span,
        })
    }

    fn parse_conditional(&mut self) -> Result<Expr, SyntaxError> {
        let condition = self.parse_binary(0)?;
        if !self.matches(TokenKind::Question) {
            return Ok(condition);
        }
        let then_value = self.parse_expression()?;
        self.expect(TokenKind::Colon)?;
        let else_value = self.parse_expression()?;
        let span = condition.span().union(else_value.span());
        Ok(Expr::Conditional {
            condition: Box::new(condition),
            then_value: Box::new(then_value),
            else_value: Box::new(else_value),
            span,
        })
    }

    fn parse_binary(&mut self, min_prec: u8) -> Result<Expr, SyntaxError> {
        let mut left = self.parse_unary()?;

        loop {
            let (op, prec) = match self.current_binary_op() {
                Some(info) => info,
                None => break,
            };
            if prec < min_prec {
                break;
            }
            self.advance();
            let right = self.parse_binary(prec + 1)?;
            let span = left.span().union(right.span());
            left = match op {
                InfixOp::Logical(op) => Expr::Logical {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                    span,
                },
                InfixOp::Binary(op) => Expr::Binary {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                    span,
                },
            };
        }

        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, SyntaxError> {
        let start = self.current_span_start();
        let op = match self.peek_kind() {
            Some(TokenKind::Minus) => Some(UnaryOp::Neg),
            Some(TokenKind::Bang) => Some(UnaryOp::Not),
            Some(TokenKind::Tilde) => Some(UnaryOp::BitNot),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let expr = self.nested(Self::parse_unary)?;
            let span = Span::new(start, expr.span().end);
            return Ok(Expr::Unary {
                op,
                expr: Box::new(expr),
                span,
            });
        }
        let update = match self.peek_kind() {
            Some(TokenKind::PlusPlus) => Some(UpdateOp::Increment),
            Some(TokenKind::MinusMinus) => Some(UpdateOp::Decrement),
            _ => None,
        };
        if let Some(op) = update {
            let op_span = self.advance().span;
            let target = self.nested(Self::parse_unary)?;
            if !is_assignable(&target) {
                return Err(SyntaxError::new("Cannot increment this expression", op_span));
            }
            let span = Span::new(start, target.span().end);
            return Ok(Expr::Update {
                op,
                prefix: true,
                target: Box::new(target),
                span,
            });
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<Expr, SyntaxError> {
        let mut expr = self.parse_primary()?;
        loop {
            if self.matches(TokenKind::LParen) {
                let span_start = expr.span().start;
                let args = self.parse_arguments(TokenKind::RParen)?;
                let end = self.expect(TokenKind::RParen)?.span.end;
                expr = Expr::Call {
                    callee: Box::new(expr),
                    args,
                    span: Span::new(span_start, end),
                };
                continue;
            }
            if self.matches(TokenKind::Dot) {
                let field = self.expect_identifier("Expected property name after '.'")?;
                let span = expr.span().union(field.span);
                expr = Expr::Member {
                    base: Box::new(expr),
                    field: field.name,
                    span,
                };
                continue;
            }
            if self.matches(TokenKind::LBracket) {
                let index = self.parse_expression()?;
                let end = self.expect(TokenKind::RBracket)?.span.end;
                let span = Span::new(expr.span().start, end);
                expr = Expr::Index {
                    base: Box::new(expr),
                    index: Box::new(index),
                    span,
                };
                continue;
            }
            let update = match self.peek_kind() {
                Some(TokenKind::PlusPlus) => Some(UpdateOp::Increment),
                Some(TokenKind::MinusMinus) => Some(UpdateOp::Decrement),
                _ => None,
            };
            if let Some(op) = update {
                if !is_assignable(&expr) {
                    return Err(self.error_here("Cannot increment this expression"));
                }
                let end = self.advance().span.end;
                let span = Span::new(expr.span().start, end);
                expr = Expr::Update {
                    op,
                    prefix: false,
                    target: Box::new(expr),
                    span,
                };
                continue;
            }
            break;
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr, SyntaxError> {
        match self.peek_kind() {
            Some(TokenKind::Identifier(name)) => {
                let span = self.advance().span;
                Ok(Expr::Identifier(Identifier { name, span }))
            }
            Some(TokenKind::Integer(value)) => {
                let span = self.advance().span;
                Ok(Expr::Literal(Literal::Int(value, span)))
            }
            Some(TokenKind::Float(value)) => {
                let span = self.advance().span;
                Ok(Expr::Literal(Literal::Float(value, span)))
            }
            Some(TokenKind::String(value)) => {
                let span = self.advance().span;
                Ok(Expr::Literal(Literal::String(value, span)))
            }
            Some(TokenKind::True) => {
                let span = self.advance().span;
                Ok(Expr::Literal(Literal::Bool(true, span)))
            }
            Some(TokenKind::False) => {
                let span = self.advance().span;
                Ok(Expr::Literal(Literal::Bool(false, span)))
            }
            Some(TokenKind::Undefined) => {
                let span = self.advance().span;
                Ok(Expr::Literal(Literal::Undefined(span)))
            }
            Some(TokenKind::LParen) => {
                self.advance();
                let expr = self.parse_expression()?;
                self.expect(TokenKind::RParen)?;
                Ok(expr)
            }
            Some(TokenKind::LBracket) => {
                let start = self.advance().span.start;
                let items = self.parse_arguments(TokenKind::RBracket)?;
                let end = self.expect(TokenKind::RBracket)?.span.end;
                Ok(Expr::Array(items, Span::new(start, end)))
            }
            Some(TokenKind::LBrace) => self.parse_object_literal(),
            _ => Err(self.error_here("Unexpected token in expression")),
        }
    }

    fn parse_object_literal(&mut self) -> Result<Expr, SyntaxError> {
        let start = self.expect(TokenKind::LBrace)?.span.start;
        let mut entries = Vec::new();
        while !self.check(TokenKind::RBrace) {
            let key = match self.peek_kind() {
                Some(TokenKind::Identifier(name)) | Some(TokenKind::String(name)) => {
                    self.advance();
                    name
                }
                _ => return Err(self.error_here("Expected property name")),
            };
            self.expect(TokenKind::Colon)?;
            let value = self.parse_expression()?;
            entries.push(ObjectEntry { key, value });
            if !self.matches(TokenKind::Comma) {
                break;
            }
        }
        let end = self.expect(TokenKind::RBrace)?.span.end;
        Ok(Expr::Object(entries, Span::new(start, end)))
    }

    fn parse_arguments(&mut self, close: TokenKind) -> Result<Vec<Expr>, SyntaxError> {
        let mut args = Vec::new();
        if !self.check(close.clone()) {
            loop {
                args.push(self.parse_expression()?);
                if self.matches(TokenKind::Comma) {
                    if self.check(close.clone()) {
                        break;
                    }
                    continue;
                }
                break;
            }
        }
        Ok(args)
    }

    fn current_binary_op(&self) -> Option<(InfixOp, u8)> {
        use InfixOp::{Binary, Logical};
        match self.peek_kind() {
            Some(TokenKind::PipePipe) => Some((Logical(LogicalOp::Or), 1)),
            Some(TokenKind::AmpersandAmpersand) => Some((Logical(LogicalOp::And), 2)),
            Some(TokenKind::Pipe) => Some((Binary(BinaryOp::BitOr), 3)),
            Some(TokenKind::Caret) => Some((Binary(BinaryOp::BitXor), 4)),
            Some(TokenKind::Ampersand) => Some((Binary(BinaryOp::BitAnd), 5)),
            Some(TokenKind::EqEq) => Some((Binary(BinaryOp::Eq), 6)),
            Some(TokenKind::BangEq) => Some((Binary(BinaryOp::NotEq), 6)),
            Some(TokenKind::Lt) => Some((Binary(BinaryOp::Lt), 7)),
            Some(TokenKind::LtEq) => Some((Binary(BinaryOp::LtEq), 7)),
            Some(TokenKind::Gt) => Some((Binary(BinaryOp::Gt), 7)),
            Some(TokenKind::GtEq) => Some((Binary(BinaryOp::GtEq), 7)),
            Some(TokenKind::LtLt) => Some((Binary(BinaryOp::Shl), 8)),
            Some(TokenKind::GtGt) => Some((Binary(BinaryOp::Shr), 8)),
            Some(TokenKind::Plus) => Some((Binary(BinaryOp::Add), 9)),
            Some(TokenKind::Minus) => Some((Binary(BinaryOp::Sub), 9)),
            Some(TokenKind::Star) => Some((Binary(BinaryOp::Mul), 10)),
            Some(TokenKind::Slash) => Some((Binary(BinaryOp::Div), 10)),
            Some(TokenKind::Percent) => Some((Binary(BinaryOp::Rem), 10)),
            _ => None,
        }
    }

    fn at_terminator(&self) -> bool {
        matches!(
            self.peek_kind(),
            Some(TokenKind::Semi | TokenKind::RBrace | TokenKind::Eof) | None
        )
    }

    /// `;` is required unless the statement is the last one before `}` or EOF.
    fn expect_terminator(&mut self) -> Result<(), SyntaxError> {
        if self.matches(TokenKind::Semi) || self.at_terminator() {
            Ok(())
        } else {
            Err(self.error_here("Expected ';'"))
        }
    }

    fn expect_identifier(&mut self, msg: &str) -> Result<Identifier, SyntaxError> {
        match self.peek_kind() {
            Some(TokenKind::Identifier(name)) => {
                let span = self.advance().span;
                Ok(Identifier { name, span })
            }
            _ => Err(self.error_here(msg)),
        }
    }

    fn expect(&mut self, kind: TokenKind) -> Result<&Token, SyntaxError> {
        if self.check(kind.clone()) {
            Ok(self.advance())
        } else {
            Err(self.error_here(&format!("Expected {}", describe(&kind))))
        }
    }

    fn consume_optional(&mut self, kind: TokenKind) -> bool {
        self.matches(kind)
    }

    fn matches(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        matches!(self.peek_kind(), Some(tk) if tk == kind)
    }

    fn peek_kind(&self) -> Option<TokenKind> {
        self.tokens.get(self.pos).map(|t| t.kind.clone())
    }

    fn peek_kind_n(&self, n: usize) -> Option<TokenKind> {
        self.tokens.get(self.pos + n).map(|t| t.kind.clone())
    }

    fn advance(&mut self) -> &Token {
        let index = self.pos.min(self.tokens.len().saturating_sub(1));
        self.pos = (self.pos + 1).min(self.tokens.len());
        &self.tokens[index]
    }

    fn is_eof(&self) -> bool {
        matches!(self.peek_kind(), Some(TokenKind::Eof) | None)
    }

    fn current_span_start(&self) -> usize {
        self.tokens
            .get(self.pos)
            .map(|t| t.span.start)
            .unwrap_or_else(|| self.tokens.last().map(|t| t.span.end).unwrap_or(0))
    }

    fn last_span_end(&self, fallback: usize) -> usize {
        if self.pos == 0 {
            return fallback;
        }
        self.tokens
            .get(self.pos - 1)
            .map(|t| t.span.end)
            .unwrap_or(fallback)
    }

    fn locate(&self, span: Span) -> Location {
        self.lines.locate(span)
    }

    fn error_here(&self, message: &str) -> SyntaxError {
        let span = self
            .tokens
            .get(self.pos)
            .map(|t| t.span)
            .unwrap_or_else(|| {
                self.tokens
                    .last()
                    .map(|t| t.span)
                    .unwrap_or_else(|| Span::new(0, 0))
            });
        SyntaxError::new(message.to_string(), span)
    }

    fn report(&mut self, err: SyntaxError) {
        self.errors.push(err);
    }

    /// Skips to the next statement boundary after an error.
    fn synchronize(&mut self) {
        while !self.is_eof() {
            match self.peek_kind() {
                Some(TokenKind::Semi) => {
                    self.advance();
                    return;
                }
                Some(
                    TokenKind::Function
                    | TokenKind::Var
                    | TokenKind::Const
                    | TokenKind::Reg
                    | TokenKind::Global,
                ) => return,
                _ => {
                    self.advance();
                }
            }
        }
    }
}

#[derive(Clone, Copy)]
enum InfixOp {
    Binary(BinaryOp),
    Logical(LogicalOp),
}

fn is_assignable(expr: &Expr) -> bool {
    matches!(
        expr,
        Expr::Identifier(_) | Expr::Member { .. } | Expr::Index { .. }
    )
}

fn describe(kind: &TokenKind) -> String {
    let text = match kind {
        TokenKind::LParen => "'('",
        TokenKind::RParen => "')'",
        TokenKind::LBrace => "'{'",
        TokenKind::RBrace => "'}'",
        TokenKind::LBracket => "'['",
        TokenKind::RBracket => "']'",
        TokenKind::Semi => "';'",
        TokenKind::Colon => "':'",
        TokenKind::Comma => "','",
        TokenKind::In => "'in'",
        TokenKind::While => "'while'",
        TokenKind::Case => "'case'",
        TokenKind::Function => "'function'",
        other => return format!("{:?}", other),
    };
    text.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(src: &str) -> Program {
        parse_script(src, None).expect("parse")
    }

    #[test]
    fn hoists_functions_and_keeps_top_level_statements() {
        let program = parse(
            r#"
var a = 1;
function onNoteOn(note, velocity) {
    a += note;
}
reg r = 2;
"#,
        );
        assert_eq!(program.statements.len(), 2);
        assert_eq!(program.functions.len(), 1);
        assert_eq!(program.functions[0].params, vec!["note", "velocity"]);
    }

    #[test]
    fn statements_carry_line_and_column() {
        let program = parse("var a = 1;\n  var b = a * 2;\n");
        let second = &program.statements[1];
        assert_eq!(second.location.line, 2);
        assert_eq!(second.location.column, 3);
    }

    #[test]
    fn precedence_binds_multiplication_tighter_than_addition() {
        let program = parse("x = 1 + 2 * 3;");
        let StatementKind::Expr(Expr::Assign { value, .. }) = &program.statements[0].kind else {
            panic!("expected assignment");
        };
        let Expr::Binary { op, right, .. } = value.as_ref() else {
            panic!("expected binary");
        };
        assert_eq!(*op, BinaryOp::Add);
        assert!(matches!(
            right.as_ref(),
            Expr::Binary {
                op: BinaryOp::Mul,
                ..
            }
        ));
    }

    #[test]
    fn for_in_and_c_style_loops_are_distinguished() {
        let program = parse("for (x in list) {}\nfor (var i = 0; i < 4; i++) {}");
        assert!(matches!(program.statements[0].kind, StatementKind::ForIn(_)));
        assert!(matches!(program.statements[1].kind, StatementKind::For(_)));
    }

    #[test]
    fn nested_function_declaration_is_rejected() {
        let errors = parse_script("function a() { function b() {} }", None).expect_err("nested");
        assert!(errors.errors[0].message.contains("top level"));
    }

    #[test]
    fn assignment_to_call_is_a_syntax_error() {
        let errors = parse_script("f() = 2;", None).expect_err("bad target");
        assert_eq!(errors.errors[0].message, "Cannot assign to this expression");
    }

    #[test]
    fn switch_collects_cases_and_default() {
        let program = parse("switch (x) { case 1: case 2: y = 1; break; default: y = 0; }");
        let StatementKind::Switch(switch) = &program.statements[0].kind else {
            panic!("expected switch");
        };
        assert_eq!(switch.cases.len(), 1);
        assert_eq!(switch.cases[0].values.len(), 2);
        assert!(switch.default.is_some());
    }

    #[test]
    fn const_without_value_reports_help() {
        let errors = parse_script("const var k;", None).expect_err("missing value");
        assert!(errors.errors[0].help.is_some());
    }

    #[test]
    fn deeply_nested_input_is_a_syntax_error() {
        let parens = format!("var x = {}1{};", "(".repeat(100_000), ")".repeat(100_000));
        let errors = parse_script(&parens, None).expect_err("too deep");
        assert_eq!(errors.errors[0].message, "Nesting is too deep");

        let blocks = format!("{}{}", "{".repeat(100_000), "}".repeat(100_000));
        assert!(parse_script(&blocks, None).is_err());

        let negations = format!("var y = {}1;", "!".repeat(100_000));
        assert!(parse_script(&negations, None).is_err());
    }

    #[test]
    fn moderate_nesting_parses() {
        let depth = 40;
        parse(&format!("var x = {}1{};", "(".repeat(depth), ")".repeat(depth)));
        parse(&format!("{}var y = 1;{}", "{".repeat(depth), "}".repeat(depth)));
    }
}
