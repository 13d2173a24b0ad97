//! A minimal textual front end for the stack machine.
//!
//! The wire protocol this crate is a collaborator for ships expressions as
//! an already-tokenized opcode stream (out of scope here, per the spec);
//! this compiler exists so tests, the CLI, and the auto-indexer's
//! deterministic ICB names have a human-writable source form to compile
//! from. Grammar, in increasing precedence:
//!
//! ```text
//! expr   := or
//! or     := and ( "||" and )*
//! and    := not ( "&&" not )*
//! not    := "!" not | cmp
//! cmp    := add ( ("==" | "!=" | "<" | "<=" | ">" | ">=") add )?
//! add    := mul ( ("+" | "-") mul )*
//! mul    := unary ( ("*" | "/") unary )*
//! unary  := "-" unary | primary
//! primary := NUMBER | STRING | "true" | "false" | "null"
//!          | "$" DIGIT          (register load)
//!          | IDENT              (field load)
//!          | IDENT "(" expr ("," expr)* ")"   (contains/union)
//!          | "(" expr ")"
//! ```

use crate::error::{CompilationFailedSnafu, RpnError, RpnResult};
use crate::expr::Expr;
use crate::token::Token;
use snafu::OptionExt as _;

#[derive(Debug, Clone, PartialEq)]
enum Lex {
    Num(f64),
    Str(String),
    Ident(String),
    Register(u8),
    Op(String),
    LParen,
    RParen,
    Comma,
}

fn lex(src: &str) -> RpnResult<Vec<Lex>> {
    let mut chars = src.chars().peekable();
    let mut out = Vec::new();

    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\n' | '\r' => {
                chars.next();
            }
            '(' => {
                chars.next();
                out.push(Lex::LParen);
            }
            ')' => {
                chars.next();
                out.push(Lex::RParen);
            }
            ',' => {
                chars.next();
                out.push(Lex::Comma);
            }
            '"' => {
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some(c) => s.push(c),
                        None => {
                            return CompilationFailedSnafu { reason: "unterminated string literal" }
                                .fail();
                        }
                    }
                }
                out.push(Lex::Str(s));
            }
            '$' => {
                chars.next();
                let mut digits = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() {
                        digits.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let idx: u8 = digits
                    .parse()
                    .ok()
                    .context(CompilationFailedSnafu { reason: "invalid register index" })?;
                out.push(Lex::Register(idx));
            }
            '=' | '!' | '<' | '>' | '&' | '|' | '+' | '-' | '*' | '/' => {
                let mut op = String::new();
                op.push(c);
                chars.next();
                if matches!(c, '=' | '!' | '<' | '>' | '&' | '|') {
                    if let Some(&next) = chars.peek() {
                        if (c == '=' && next == '=')
                            || (c == '!' && next == '=')
                            || (c == '<' && next == '=')
                            || (c == '>' && next == '=')
                            || (c == '&' && next == '&')
                            || (c == '|' && next == '|')
                        {
                            op.push(next);
                            chars.next();
                        }
                    }
                }
                out.push(Lex::Op(op));
            }
            c if c.is_ascii_digit() => {
                let mut s = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() || d == '.' {
                        s.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let n: f64 = s
                    .parse()
                    .ok()
                    .context(CompilationFailedSnafu { reason: "invalid number literal" })?;
                out.push(Lex::Num(n));
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut s = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_alphanumeric() || d == '_' || d == '.' {
                        s.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                out.push(Lex::Ident(s));
            }
            other => {
                return CompilationFailedSnafu { reason: format!("unexpected character '{other}'") }
                    .fail();
            }
        }
    }

    Ok(out)
}

struct Parser {
    tokens: Vec<Lex>,
    pos: usize,
    out: Vec<Token>,
}

impl Parser {
    fn peek(&self) -> Option<&Lex> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Lex> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn eat_op(&mut self, op: &str) -> bool {
        if matches!(self.peek(), Some(Lex::Op(o)) if o == op) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expr(&mut self) -> RpnResult<()> {
        self.or_expr()
    }

    fn or_expr(&mut self) -> RpnResult<()> {
        self.and_expr()?;
        while self.eat_op("||") {
            self.and_expr()?;
            self.out.push(Token::Or);
        }
        Ok(())
    }

    fn and_expr(&mut self) -> RpnResult<()> {
        self.not_expr()?;
        while self.eat_op("&&") {
            self.not_expr()?;
            self.out.push(Token::And);
        }
        Ok(())
    }

    fn not_expr(&mut self) -> RpnResult<()> {
        if self.eat_op("!") {
            self.not_expr()?;
            self.out.push(Token::Not);
            Ok(())
        } else {
            self.cmp_expr()
        }
    }

    fn cmp_expr(&mut self) -> RpnResult<()> {
        self.add_expr()?;
        let op = match self.peek() {
            Some(Lex::Op(o)) if ["==", "!=", "<", "<=", ">", ">="].contains(&o.as_str()) => {
                o.clone()
            }
            _ => return Ok(()),
        };
        self.pos += 1;
        self.add_expr()?;
        self.out.push(match op.as_str() {
            "==" => Token::Eq,
            "!=" => Token::Ne,
            "<" => Token::Lt,
            "<=" => Token::Le,
            ">" => Token::Gt,
            _ => Token::Ge,
        });
        Ok(())
    }

    fn add_expr(&mut self) -> RpnResult<()> {
        self.mul_expr()?;
        loop {
            if self.eat_op("+") {
                self.mul_expr()?;
                self.out.push(Token::Add);
            } else if self.eat_op("-") {
                self.mul_expr()?;
                self.out.push(Token::Sub);
            } else {
                break;
            }
        }
        Ok(())
    }

    fn mul_expr(&mut self) -> RpnResult<()> {
        self.unary()?;
        loop {
            if self.eat_op("*") {
                self.unary()?;
                self.out.push(Token::Mul);
            } else if self.eat_op("/") {
                self.unary()?;
                self.out.push(Token::Div);
            } else {
                break;
            }
        }
        Ok(())
    }

    fn unary(&mut self) -> RpnResult<()> {
        if self.eat_op("-") {
            // `-x` compiles to `0 - x` so the postfix stream stays a flat
            // left-to-right instruction list.
            self.out.push(Token::PushDouble(0.0));
            self.unary()?;
            self.out.push(Token::Sub);
            return Ok(());
        }
        self.primary()
    }

    fn primary(&mut self) -> RpnResult<()> {
        match self.bump() {
            Some(Lex::Num(n)) => {
                self.out.push(Token::PushDouble(n));
                Ok(())
            }
            Some(Lex::Str(s)) => {
                self.out.push(Token::PushString(s));
                Ok(())
            }
            Some(Lex::Register(r)) => {
                self.out.push(Token::LoadRegister(r));
                Ok(())
            }
            Some(Lex::Ident(name)) => {
                match name.as_str() {
                    "true" => self.out.push(Token::PushBool(true)),
                    "false" => self.out.push(Token::PushBool(false)),
                    "null" => self.out.push(Token::PushNull),
                    _ if matches!(self.peek(), Some(Lex::LParen)) => {
                        self.pos += 1;
                        self.expr()?;
                        while matches!(self.peek(), Some(Lex::Comma)) {
                            self.pos += 1;
                            self.expr()?;
                        }
                        if !matches!(self.bump(), Some(Lex::RParen)) {
                            return CompilationFailedSnafu { reason: "expected ')'" }.fail();
                        }
                        match name.as_str() {
                            "contains" => self.out.push(Token::Contains),
                            "union" => self.out.push(Token::Union),
                            other => {
                                return CompilationFailedSnafu {
                                    reason: format!("unknown function '{other}'"),
                                }
                                .fail();
                            }
                        }
                    }
                    _ => self.out.push(Token::LoadField(name)),
                }
                Ok(())
            }
            Some(Lex::LParen) => {
                self.expr()?;
                if !matches!(self.bump(), Some(Lex::RParen)) {
                    return CompilationFailedSnafu { reason: "expected ')'" }.fail();
                }
                Ok(())
            }
            other => CompilationFailedSnafu { reason: format!("unexpected token: {other:?}") }
                .fail(),
        }
    }
}

/// Compile a textual filter/selection expression into an opaque [`Expr`].
pub fn compile(src: &str) -> RpnResult<Expr> {
    let tokens = lex(src)?;
    let mut parser = Parser { tokens, pos: 0, out: Vec::new() };
    parser.expr()?;
    if parser.pos != parser.tokens.len() {
        return CompilationFailedSnafu { reason: "trailing input after expression" }.fail();
    }
    Ok(Expr::from_tokens(parser.out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::EvalContext;
    use crate::eval::eval;
    use crate::value::Value;
    use selva_core::NodeId;
    use std::collections::BTreeMap;

    struct FakeCtx {
        node: NodeId,
        fields: BTreeMap<String, Value>,
    }

    impl EvalContext for FakeCtx {
        fn register_node(&self, idx: u8) -> Option<NodeId> {
            (idx == 0).then_some(self.node)
        }

        fn field(&self, _node: NodeId, field: &str) -> Option<Value> {
            self.fields.get(field).cloned()
        }
    }

    fn ctx() -> FakeCtx {
        let mut fields = BTreeMap::new();
        fields.insert("type".to_string(), Value::String("ma".to_string()));
        fields.insert("score".to_string(), Value::Double(3.0));
        FakeCtx { node: "ma1".parse().unwrap(), fields }
    }

    #[test]
    fn equality_filter() {
        let expr = compile(r#"type == "ma""#).unwrap();
        let v = eval(&expr, &ctx()).unwrap();
        assert_eq!(v, Value::Bool(true));
    }

    #[test]
    fn arithmetic_and_compare() {
        let expr = compile("score > 1 && score < 10").unwrap();
        assert_eq!(eval(&expr, &ctx()).unwrap(), Value::Bool(true));
    }

    #[test]
    fn negation() {
        let expr = compile("-score + 5").unwrap();
        assert_eq!(eval(&expr, &ctx()).unwrap(), Value::Double(2.0));
    }

    #[test]
    fn missing_field_is_null() {
        let expr = compile("missing == null").unwrap();
        assert_eq!(eval(&expr, &ctx()).unwrap(), Value::Bool(true));
    }
}
