use super::parser::{BinaryOp, Expr, LogicalOp, UnaryOp};
use super::value::Value;
use super::EvalError;
use crate::timefmt;
use std::cmp::Ordering;
use std::sync::Arc;

const MAX_CALL_DEPTH: usize = 32;

/// Read-only evaluation context for a single rule.
pub struct Context<'a> {
    pub state: &'a Value,
    pub rule: &'a Value,
    pub now_ms: i64,
}

impl Context<'_> {
    fn agents(&self) -> Value {
        match self.state.get("agents") {
            Some(v @ Value::Object(_)) => v.clone(),
            _ => Value::Object(Arc::default()),
        }
    }

    fn crons(&self) -> Value {
        match self.state.get("crons") {
            Some(v @ Value::Array(_)) => v.clone(),
            _ => Value::Array(Arc::default()),
        }
    }

    fn resources(&self) -> Value {
        match self.state.get("resources") {
            Some(v @ Value::Object(_)) => v.clone(),
            _ => Value::Object(Arc::default()),
        }
    }

    fn lookup(&self, name: &str) -> Result<Value, EvalError> {
        Ok(match name {
            "state" => self.state.clone(),
            "rule" => self.rule.clone(),
            "now" => Value::Number(self.now_ms as f64),
            "agents" => self.agents(),
            "crons" => self.crons(),
            "resources" => self.resources(),
            "Infinity" => Value::Number(f64::INFINITY),
            "NaN" => Value::Number(f64::NAN),
            "agent" | "cron" | "minutesAgo" | "hoursAgo" => {
                return Err(EvalError::HelperNotCalled(name.to_string()))
            }
            _ => return Err(EvalError::UnknownIdentifier(name.to_string())),
        })
    }

    fn call_helper(&self, name: &str, args: &[Value]) -> Result<Value, EvalError> {
        let arg = args.first().cloned().unwrap_or_default();
        match name {
            "agent" => Ok(self
                .agents()
                .get(&arg.to_text())
                .cloned()
                .unwrap_or_default()),
            "cron" => {
                let Value::Array(crons) = self.crons() else {
                    return Ok(Value::Null);
                };
                Ok(crons
                    .iter()
                    .find(|c| {
                        c.get("id").is_some_and(|id| id.strict_equals(&arg))
                            || c.get("name").is_some_and(|n| n.strict_equals(&arg))
                    })
                    .cloned()
                    .unwrap_or_default())
            }
            "minutesAgo" => Ok(Value::Number(self.elapsed_ms(&arg) / 60_000.0)),
            "hoursAgo" => Ok(Value::Number(self.elapsed_ms(&arg) / 3_600_000.0)),
            _ => Err(EvalError::UnknownFunction(name.to_string())),
        }
    }

    /// Missing timestamps are infinitely old; unparseable ones are NaN.
    fn elapsed_ms(&self, ts: &Value) -> f64 {
        if !ts.truthy() {
            return f64::INFINITY;
        }
        let then = match ts {
            Value::Number(n) => *n,
            Value::Str(s) => timefmt::parse_millis(s).map_or(f64::NAN, |ms| ms as f64),
            _ => f64::NAN,
        };
        self.now_ms as f64 - then
    }
}

enum Chain {
    Value(Value),
    Short,
}

pub struct Interpreter<'c, 'a> {
    ctx: &'c Context<'a>,
    scope: Vec<(String, Value)>,
    depth: usize,
}

impl<'c, 'a> Interpreter<'c, 'a> {
    pub fn new(ctx: &'c Context<'a>) -> Self {
        Self {
            ctx,
            scope: Vec::new(),
            depth: 0,
        }
    }

    pub fn eval(&mut self, expr: &Expr) -> Result<Value, EvalError> {
        match expr {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Ident(name) => self.lookup(name),
            Expr::Member { .. } | Expr::Index { .. } | Expr::Call { .. } => {
                Ok(match self.chain(expr)? {
                    Chain::Value(v) => v,
                    Chain::Short => Value::Null,
                })
            }
            Expr::Lambda { .. } => Err(EvalError::BareLambda),
            Expr::Unary { op, operand } => {
                let v = self.eval(operand)?;
                Ok(match op {
                    UnaryOp::Not => Value::Bool(!v.truthy()),
                    UnaryOp::Neg => Value::Number(-v.to_number()),
                    UnaryOp::Plus => Value::Number(v.to_number()),
                })
            }
            Expr::Logical { op, left, right } => {
                let l = self.eval(left)?;
                match (op, l.truthy()) {
                    (LogicalOp::And, false) | (LogicalOp::Or, true) => Ok(l),
                    _ => self.eval(right),
                }
            }
            Expr::Conditional {
                test,
                consequent,
                alternate,
            } => {
                if self.eval(test)?.truthy() {
                    self.eval(consequent)
                } else {
                    self.eval(alternate)
                }
            }
            Expr::Binary { op, left, right } => {
                let l = self.eval(left)?;
                let r = self.eval(right)?;
                Ok(binary(*op, &l, &r))
            }
        }
    }

    fn lookup(&self, name: &str) -> Result<Value, EvalError> {
        if let Some((_, v)) = self.scope.iter().rev().find(|(n, _)| n == name) {
            return Ok(v.clone());
        }
        self.ctx.lookup(name)
    }

    fn chain(&mut self, expr: &Expr) -> Result<Chain, EvalError> {
        match expr {
            Expr::Member {
                object,
                property,
                optional,
            } => {
                let Chain::Value(obj) = self.chain(object)? else {
                    return Ok(Chain::Short);
                };
                if *optional && obj.is_null() {
                    return Ok(Chain::Short);
                }
                member(&obj, property).map(Chain::Value)
            }
            Expr::Index {
                object,
                index,
                optional,
            } => {
                let Chain::Value(obj) = self.chain(object)? else {
                    return Ok(Chain::Short);
                };
                if *optional && obj.is_null() {
                    return Ok(Chain::Short);
                }
                let key = self.eval(index)?;
                index_value(&obj, &key).map(Chain::Value)
            }
            Expr::Call {
                callee,
                args,
                optional,
            } => self.call(callee, args, *optional),
            other => self.eval(other).map(Chain::Value),
        }
    }

    fn call(&mut self, callee: &Expr, args: &[Expr], optional: bool) -> Result<Chain, EvalError> {
        match callee {
            Expr::Ident(name) if !self.scope.iter().any(|(n, _)| n == name) => {
                let values = args
                    .iter()
                    .map(|a| self.eval(a))
                    .collect::<Result<Vec<_>, _>>()?;
                self.ctx.call_helper(name, &values).map(Chain::Value)
            }
            Expr::Member {
                object,
                property,
                optional: member_optional,
            } => {
                let Chain::Value(receiver) = self.chain(object)? else {
                    return Ok(Chain::Short);
                };
                if (*member_optional || optional) && receiver.is_null() {
                    return Ok(Chain::Short);
                }
                self.method(&receiver, property, args).map(Chain::Value)
            }
            other => {
                let target = self.eval(other)?;
                if optional && target.is_null() {
                    return Ok(Chain::Short);
                }
                Err(EvalError::NotCallable(target.type_name()))
            }
        }
    }

    fn method(&mut self, receiver: &Value, name: &str, args: &[Expr]) -> Result<Value, EvalError> {
        match receiver {
            Value::Array(items) => self.array_method(items, name, args),
            Value::Str(s) => {
                let arg = match args.first() {
                    Some(a) => self.eval(a)?.to_text(),
                    None => "undefined".to_string(),
                };
                Ok(match name {
                    "includes" => Value::Bool(s.contains(arg.as_str())),
                    "startsWith" => Value::Bool(s.starts_with(arg.as_str())),
                    "endsWith" => Value::Bool(s.ends_with(arg.as_str())),
                    "toLowerCase" => Value::string(s.to_lowercase()),
                    "toUpperCase" => Value::string(s.to_uppercase()),
                    _ => return Err(unknown_method(receiver, name)),
                })
            }
            Value::Null => Err(EvalError::NullMember {
                property: name.to_string(),
            }),
            _ => Err(unknown_method(receiver, name)),
        }
    }

    fn array_method(
        &mut self,
        items: &Arc<Vec<Value>>,
        name: &str,
        args: &[Expr],
    ) -> Result<Value, EvalError> {
        if name == "includes" {
            let needle = match args.first() {
                Some(a) => self.eval(a)?,
                None => Value::Null,
            };
            let same = |v: &Value| match (v, &needle) {
                (Value::Number(a), Value::Number(b)) => a == b || (a.is_nan() && b.is_nan()),
                _ => v.strict_equals(&needle),
            };
            return Ok(Value::Bool(items.iter().any(same)));
        }

        let (params, body) = match args.first() {
            Some(Expr::Lambda { params, body }) => (params, body),
            _ if matches!(name, "some" | "every" | "filter" | "find" | "map") => {
                return Err(EvalError::ExpectedCallback(name.to_string()))
            }
            _ => return Err(EvalError::UnknownMethod {
                method: name.to_string(),
                receiver: "array",
            }),
        };

        match name {
            "some" => {
                for (i, item) in items.iter().enumerate() {
                    if self.apply(params, body, item, i)?.truthy() {
                        return Ok(Value::Bool(true));
                    }
                }
                Ok(Value::Bool(false))
            }
            "every" => {
                for (i, item) in items.iter().enumerate() {
                    if !self.apply(params, body, item, i)?.truthy() {
                        return Ok(Value::Bool(false));
                    }
                }
                Ok(Value::Bool(true))
            }
            "find" => {
                for (i, item) in items.iter().enumerate() {
                    if self.apply(params, body, item, i)?.truthy() {
                        return Ok(item.clone());
                    }
                }
                Ok(Value::Null)
            }
            "filter" => {
                let mut out = Vec::new();
                for (i, item) in items.iter().enumerate() {
                    if self.apply(params, body, item, i)?.truthy() {
                        out.push(item.clone());
                    }
                }
                Ok(Value::Array(Arc::new(out)))
            }
            "map" => {
                let mut out = Vec::with_capacity(items.len());
                for (i, item) in items.iter().enumerate() {
                    out.push(self.apply(params, body, item, i)?);
                }
                Ok(Value::Array(Arc::new(out)))
            }
            _ => Err(EvalError::UnknownMethod {
                method: name.to_string(),
                receiver: "array",
            }),
        }
    }

    fn apply(
        &mut self,
        params: &[String],
        body: &Expr,
        item: &Value,
        index: usize,
    ) -> Result<Value, EvalError> {
        if self.depth >= MAX_CALL_DEPTH {
            return Err(EvalError::TooDeep);
        }
        let bound = [item.clone(), Value::Number(index as f64)];
        let mark = self.scope.len();
        for (param, value) in params.iter().zip(bound) {
            self.scope.push((param.clone(), value));
        }
        self.depth += 1;
        let result = self.eval(body);
        self.depth -= 1;
        self.scope.truncate(mark);
        result
    }
}

fn unknown_method(receiver: &Value, name: &str) -> EvalError {
    EvalError::UnknownMethod {
        method: name.to_string(),
        receiver: receiver.type_name(),
    }
}

fn member(obj: &Value, property: &str) -> Result<Value, EvalError> {
    match obj {
        Value::Null => Err(EvalError::NullMember {
            property: property.to_string(),
        }),
        Value::Object(map) => Ok(map.get(property).cloned().unwrap_or_default()),
        Value::Array(items) if property == "length" => Ok(Value::Number(items.len() as f64)),
        Value::Str(s) if property == "length" => Ok(Value::Number(s.chars().count() as f64)),
        _ => Ok(Value::Null),
    }
}

fn index_value(obj: &Value, key: &Value) -> Result<Value, EvalError> {
    match (obj, key) {
        (Value::Array(items), Value::Number(n)) => {
            if *n >= 0.0 && n.fract() == 0.0 {
                Ok(items.get(*n as usize).cloned().unwrap_or_default())
            } else {
                Ok(Value::Null)
            }
        }
        (Value::Str(s), Value::Number(n)) => {
            if *n >= 0.0 && n.fract() == 0.0 {
                Ok(s
                    .chars()
                    .nth(*n as usize)
                    .map(|c| Value::string(c.to_string()))
                    .unwrap_or_default())
            } else {
                Ok(Value::Null)
            }
        }
        _ => member(obj, &key.to_text()),
    }
}

fn binary(op: BinaryOp, l: &Value, r: &Value) -> Value {
    match op {
        BinaryOp::StrictEq => Value::Bool(l.strict_equals(r)),
        BinaryOp::StrictNe => Value::Bool(!l.strict_equals(r)),
        BinaryOp::LooseEq => Value::Bool(l.loose_equals(r)),
        BinaryOp::LooseNe => Value::Bool(!l.loose_equals(r)),
        BinaryOp::Lt => Value::Bool(compare(l, r) == Some(Ordering::Less)),
        BinaryOp::Le => Value::Bool(matches!(
            compare(l, r),
            Some(Ordering::Less | Ordering::Equal)
        )),
        BinaryOp::Gt => Value::Bool(compare(l, r) == Some(Ordering::Greater)),
        BinaryOp::Ge => Value::Bool(matches!(
            compare(l, r),
            Some(Ordering::Greater | Ordering::Equal)
        )),
        BinaryOp::Add => match (l, r) {
            (Value::Str(_), _) | (_, Value::Str(_)) => {
                Value::string(format!("{}{}", l.to_text(), r.to_text()))
            }
            _ => Value::Number(l.to_number() + r.to_number()),
        },
        BinaryOp::Sub => Value::Number(l.to_number() - r.to_number()),
        BinaryOp::Mul => Value::Number(l.to_number() * r.to_number()),
        BinaryOp::Div => Value::Number(l.to_number() / r.to_number()),
        BinaryOp::Rem => Value::Number(l.to_number() % r.to_number()),
    }
}

fn compare(l: &Value, r: &Value) -> Option<Ordering> {
    match (l, r) {
        (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
        _ => l.to_number().partial_cmp(&r.to_number()),
    }
}
