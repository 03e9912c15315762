use std::ops::Range;

use super::lexer::{tokenize, Spanned, Token};
use crate::codegen::function::Function;
use crate::codegen::value::ValueKind;
use crate::error::{CodegenError, SourcePos};

#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub span: Range<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Number(f32),
    Name(String),
    Control {
        name: String,
        kind: ValueKind,
    },
    Unary {
        op: Function,
        operand: Box<Expr>,
    },
    Binary {
        op: Function,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Call {
        name: String,
        name_span: Range<usize>,
        args: Vec<Expr>,
    },
    Tuple(Vec<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    Local(String),
    Control { name: String, kind: ValueKind },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub target: Target,
    pub target_span: Range<usize>,
    pub value: Expr,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Program {
    pub statements: Vec<Statement>,
}

/// Deepest expression tree the parser builds. Nested parentheses, calls,
/// tuples, unary minus and every operator of a chain count one level each.
pub const MAX_NESTING: u32 = 256;

pub fn parse(source: &str) -> Result<Program, CodegenError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    parser.program()
}

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    depth: u32,
}

impl Parser {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)].token
    }

    fn span(&self) -> Range<usize> {
        self.tokens[self.pos.min(self.tokens.len() - 1)].span.clone()
    }

    fn bump(&mut self) -> Spanned {
        let token = self.tokens[self.pos.min(self.tokens.len() - 1)].clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn error<T>(&self, message: impl Into<String>) -> Result<T, CodegenError> {
        Err(CodegenError::Parse {
            message: message.into(),
            pos: SourcePos::span(self.span()),
        })
    }

    fn expect(&mut self, token: Token, what: &str) -> Result<Spanned, CodegenError> {
        if *self.peek() == token {
            Ok(self.bump())
        } else {
            self.error(format!("expected {}", what))
        }
    }

    fn descend(&mut self) -> Result<(), CodegenError> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return self.error(format!(
                "expression nested deeper than {} levels",
                MAX_NESTING
            ));
        }
        Ok(())
    }

    fn skip_separators(&mut self) {
        while *self.peek() == Token::Separator {
            self.bump();
        }
    }

    fn program(&mut self) -> Result<Program, CodegenError> {
        let mut program = Program::default();
        self.skip_separators();
        while *self.peek() != Token::Eof {
            program.statements.push(self.statement()?);
            match self.peek() {
                Token::Separator => self.skip_separators(),
                Token::Eof => {}
                _ => return self.error("expected end of statement"),
            }
        }
        Ok(program)
    }

    fn statement(&mut self) -> Result<Statement, CodegenError> {
        let first = self.bump();
        let Token::Ident(name) = first.token else {
            return Err(CodegenError::Parse {
                message: "expected an assignment target".into(),
                pos: SourcePos::span(first.span),
            });
        };

        let (target, target_span) = if *self.peek() == Token::Colon {
            self.bump();
            let (kind, end) = self.control_kind()?;
            (Target::Control { name, kind }, first.span.start..end)
        } else {
            (Target::Local(name), first.span)
        };

        self.expect(Token::Assign, "`=`")?;
        let value = self.expr()?;
        Ok(Statement {
            target,
            target_span,
            value,
        })
    }

    fn control_kind(&mut self) -> Result<(ValueKind, usize), CodegenError> {
        let token = self.bump();
        let kind = match &token.token {
            Token::Ident(kind) if kind == "num" => ValueKind::Num,
            Token::Ident(kind) if kind == "midi" => ValueKind::Midi,
            _ => {
                return Err(CodegenError::Parse {
                    message: "expected control kind `num` or `midi`".into(),
                    pos: SourcePos::span(token.span),
                })
            }
        };
        Ok((kind, token.span.end))
    }

    fn expr(&mut self) -> Result<Expr, CodegenError> {
        self.descend()?;
        let expr = self.comparison()?;
        self.depth -= 1;
        Ok(expr)
    }

    fn comparison(&mut self) -> Result<Expr, CodegenError> {
        let lhs = self.additive()?;
        let Some(op) = comparison_op(self.peek()) else {
            return Ok(lhs);
        };
        self.bump();
        let rhs = self.additive()?;
        if comparison_op(self.peek()).is_some() {
            let span = self.span();
            return Err(CodegenError::InvalidOperator {
                op: "chained comparison".into(),
                pos: SourcePos::span(span),
            });
        }
        Ok(binary(op, lhs, rhs))
    }

    fn additive(&mut self) -> Result<Expr, CodegenError> {
        let depth = self.depth;
        let mut lhs = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                Token::Plus => Function::Add,
                Token::Minus => Function::Sub,
                _ => {
                    self.depth = depth;
                    return Ok(lhs);
                }
            };
            self.descend()?;
            self.bump();
            let rhs = self.multiplicative()?;
            lhs = binary(op, lhs, rhs);
        }
    }

    fn multiplicative(&mut self) -> Result<Expr, CodegenError> {
        let depth = self.depth;
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Token::Star => Function::Mul,
                Token::Slash => Function::Div,
                Token::Percent => Function::Mod,
                _ => {
                    self.depth = depth;
                    return Ok(lhs);
                }
            };
            self.descend()?;
            self.bump();
            let rhs = self.unary()?;
            lhs = binary(op, lhs, rhs);
        }
    }

    fn unary(&mut self) -> Result<Expr, CodegenError> {
        if *self.peek() == Token::Minus {
            self.descend()?;
            let start = self.bump().span.start;
            let operand = self.unary()?;
            self.depth -= 1;
            let span = start..operand.span.end;
            return Ok(Expr {
                kind: ExprKind::Unary {
                    op: Function::Neg,
                    operand: Box::new(operand),
                },
                span,
            });
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, CodegenError> {
        let token = self.bump();
        let start = token.span.start;
        match token.token {
            Token::Number(value) => Ok(Expr {
                kind: ExprKind::Number(value),
                span: token.span,
            }),
            Token::Ident(name) => match self.peek() {
                Token::LParen => {
                    self.bump();
                    let args = self.list(Token::RParen, "`)`")?;
                    Ok(Expr {
                        kind: ExprKind::Call {
                            name,
                            name_span: token.span,
                            args,
                        },
                        span: start..self.previous_end(),
                    })
                }
                Token::Colon => {
                    self.bump();
                    let (kind, end) = self.control_kind()?;
                    Ok(Expr {
                        kind: ExprKind::Control { name, kind },
                        span: start..end,
                    })
                }
                _ => Ok(Expr {
                    kind: ExprKind::Name(name),
                    span: token.span,
                }),
            },
            Token::LParen => {
                let inner = self.expr()?;
                self.expect(Token::RParen, "`)`")?;
                Ok(Expr {
                    kind: inner.kind,
                    span: start..self.previous_end(),
                })
            }
            Token::LBracket => {
                let items = self.list(Token::RBracket, "`]`")?;
                Ok(Expr {
                    kind: ExprKind::Tuple(items),
                    span: start..self.previous_end(),
                })
            }
            _ => Err(CodegenError::Parse {
                message: "expected an expression".into(),
                pos: SourcePos::span(token.span),
            }),
        }
    }

    /// Comma separated expressions up to and including `close`.
    fn list(&mut self, close: Token, what: &str) -> Result<Vec<Expr>, CodegenError> {
        let mut items = Vec::new();
        if *self.peek() == close {
            self.bump();
            return Ok(items);
        }
        loop {
            items.push(self.expr()?);
            if *self.peek() == Token::Comma {
                self.bump();
                continue;
            }
            self.expect(close, what)?;
            return Ok(items);
        }
    }

    fn previous_end(&self) -> usize {
        self.tokens[self.pos.saturating_sub(1)].span.end
    }
}

fn comparison_op(token: &Token) -> Option<Function> {
    Some(match token {
        Token::Less => Function::Less,
        Token::Greater => Function::Greater,
        Token::LessEq => Function::LessEq,
        Token::GreaterEq => Function::GreaterEq,
        Token::EqEq => Function::Equal,
        Token::NotEq => Function::NotEqual,
        _ => return None,
    })
}

fn binary(op: Function, lhs: Expr, rhs: Expr) -> Expr {
    let span = lhs.span.start..rhs.span.end;
    Expr {
        kind: ExprKind::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        },
        span,
    }
}
