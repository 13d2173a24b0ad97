use crate::context::EvalContext;
use crate::error::{RpnError, RpnResult};
use crate::expr::Expr;
use crate::token::Token;
use crate::value::Value;

/// Evaluate a compiled expression against a context, producing whichever of
/// the four result shapes the expression's tokens build up to. Filters
/// collapse the result with [`Value::truthy`]; field-selection expressions
/// expect a [`Value::StringSet`].
pub fn eval(expr: &Expr, ctx: &dyn EvalContext) -> RpnResult<Value> {
    let mut stack: Vec<Value> = Vec::new();

    for tok in &expr.tokens() {
        match tok {
            Token::PushNull => stack.push(Value::Null),
            Token::PushBool(b) => stack.push(Value::Bool(*b)),
            Token::PushDouble(d) => stack.push(Value::Double(*d)),
            Token::PushString(s) => stack.push(Value::String(s.clone())),
            Token::LoadRegister(idx) => {
                let node = ctx
                    .register_node(*idx)
                    .ok_or(RpnError::RegisterOob { idx: *idx })?;
                stack.push(Value::String(node.to_string()));
            }
            Token::LoadField(name) => {
                let node = ctx
                    .register_node(0)
                    .ok_or(RpnError::RegisterOob { idx: 0 })?;
                stack.push(ctx.field(node, name).unwrap_or(Value::Null));
            }
            Token::Not => {
                let v = pop(&mut stack)?;
                stack.push(Value::Bool(!v.truthy()));
            }
            Token::And => {
                let b = pop(&mut stack)?;
                let a = pop(&mut stack)?;
                stack.push(Value::Bool(a.truthy() && b.truthy()));
            }
            Token::Or => {
                let b = pop(&mut stack)?;
                let a = pop(&mut stack)?;
                stack.push(Value::Bool(a.truthy() || b.truthy()));
            }
            Token::Eq => {
                let b = pop(&mut stack)?;
                let a = pop(&mut stack)?;
                stack.push(Value::Bool(values_eq(&a, &b)));
            }
            Token::Ne => {
                let b = pop(&mut stack)?;
                let a = pop(&mut stack)?;
                stack.push(Value::Bool(!values_eq(&a, &b)));
            }
            Token::Lt | Token::Le | Token::Gt | Token::Ge => {
                let b = pop(&mut stack)?;
                let a = pop(&mut stack)?;
                let (a, b) = (numeric(&a)?, numeric(&b)?);
                let result = match tok {
                    Token::Lt => a < b,
                    Token::Le => a <= b,
                    Token::Gt => a > b,
                    Token::Ge => a >= b,
                    _ => unreachable!(),
                };
                stack.push(Value::Bool(result));
            }
            Token::Add | Token::Sub | Token::Mul | Token::Div => {
                let b = pop(&mut stack)?;
                let a = pop(&mut stack)?;
                let (a, b) = (numeric(&a)?, numeric(&b)?);
                let result = match tok {
                    Token::Add => a + b,
                    Token::Sub => a - b,
                    Token::Mul => a * b,
                    Token::Div => {
                        if b == 0.0 {
                            return Err(RpnError::DivideByZero);
                        }
                        a / b
                    }
                    _ => unreachable!(),
                };
                stack.push(Value::Double(result));
            }
            Token::Contains => {
                let set = pop(&mut stack)?;
                let needle = pop(&mut stack)?;
                let set = set
                    .as_string_set()
                    .ok_or(RpnError::TypeMismatch { expected: "set", got: set.type_name() })?;
                let needle = needle
                    .as_str()
                    .ok_or(RpnError::TypeMismatch { expected: "string", got: needle.type_name() })?;
                stack.push(Value::Bool(set.contains(needle)));
            }
            Token::Union => {
                let b = pop(&mut stack)?;
                let a = pop(&mut stack)?;
                let mut a = a
                    .as_string_set()
                    .ok_or(RpnError::TypeMismatch { expected: "set", got: a.type_name() })?
                    .clone();
                let b = b
                    .as_string_set()
                    .ok_or(RpnError::TypeMismatch { expected: "set", got: b.type_name() })?;
                a.extend(b.iter().cloned());
                stack.push(Value::StringSet(a));
            }
        }
    }

    stack.pop().ok_or(RpnError::StackUnderflow)
}

/// Convenience wrapper for filter expressions: `None`/absent expressions are
/// treated as an unconditional match, matching "filter expression is true or
/// absent" in the marker-refresh contract.
pub fn eval_bool(expr: Option<&Expr>, ctx: &dyn EvalContext) -> RpnResult<bool> {
    match expr {
        None => Ok(true),
        Some(expr) => Ok(eval(expr, ctx)?.truthy()),
    }
}

/// Convenience wrapper for field-selection expressions, which must resolve
/// to a set of field names to follow.
pub fn eval_string_set(
    expr: &Expr,
    ctx: &dyn EvalContext,
) -> RpnResult<std::collections::BTreeSet<String>> {
    let v = eval(expr, ctx)?;
    match v {
        Value::StringSet(s) => Ok(s),
        Value::String(s) => Ok(std::iter::once(s).collect()),
        Value::Null => Ok(Default::default()),
        other => Err(RpnError::TypeMismatch { expected: "set", got: other.type_name() }),
    }
}

fn pop(stack: &mut Vec<Value>) -> RpnResult<Value> {
    stack.pop().ok_or(RpnError::StackUnderflow)
}

fn numeric(v: &Value) -> RpnResult<f64> {
    v.as_double().ok_or(RpnError::TypeMismatch { expected: "double", got: v.type_name() })
}

fn values_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Double(a), Value::Double(b)) => a == b,
        (Value::String(a), Value::String(b)) => a == b,
        (Value::StringSet(a), Value::StringSet(b)) => a == b,
        _ => false,
    }
}
