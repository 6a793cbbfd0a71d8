//! Expression evaluation against a data context.
//!
//! Conditions, assignment values, foreach sources and message parameters are
//! all expressions evaluated against the instance data object. The built-in
//! language supports:
//!
//! - `ctx.field` - data field access (`ctx.field.nested` for nested access,
//!   numeric segments index into arrays, bare `ctx` is the whole object)
//! - literals - `null`, `true`, `false`, numbers, `"strings"` (single or
//!   double quoted), `[1, 2, 3]`
//! - `==` `!=` `>` `>=` `<` `<=` - comparisons
//! - `!expr`, `expr && expr`, `expr || expr` - boolean operators
//! - `+` `-` `*` `/` `%` - arithmetic (`+` concatenates when either side
//!   is a string)
//! - `(expr)` - grouping
//!
//! Examples:
//! - `ctx.enabled` - truthy check
//! - `ctx.amount > 100 && ctx.approved` - compound condition
//! - `ctx.retries + 1` - counter increment
//! - `"order-" + ctx.id` - string building
//!
//! Expressions are compiled once at chart load time. Programmatic models can
//! bypass the parser entirely with [`Expr::native`], which wraps an arbitrary
//! Rust closure over the data object.

use crate::error::{EvalError, ModelError};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Binary operators of the expression language.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    And,
    Or,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

impl BinaryOp {
    fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
        }
    }
}

/// A native expression: an arbitrary Rust closure over the data object.
#[derive(Clone)]
pub struct NativeExpr(Arc<dyn Fn(&Value) -> Result<Value, EvalError> + Send + Sync>);

impl fmt::Debug for NativeExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<native>")
    }
}

/// A compiled expression.
#[derive(Debug, Clone)]
pub enum Expr {
    /// A literal value.
    Literal(Value),
    /// A dotted path into the data object. Empty path is the whole object.
    Path(String),
    /// Logical negation of the operand's truthiness.
    Not(Box<Expr>),
    /// Numeric negation.
    Neg(Box<Expr>),
    /// A binary operation.
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    /// A Rust closure supplied by a programmatic model.
    Native(NativeExpr),
}

impl Expr {
    /// Parses an expression from a string.
    pub fn parse(s: &str) -> Result<Self, ModelError> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(ModelError::InvalidExpression {
                expr: s.to_string(),
                reason: "empty expression".to_string(),
            });
        }

        let mut parser = Parser::new(trimmed);
        let expr = parser.parse_expr().map_err(|reason| {
            ModelError::InvalidExpression {
                expr: s.to_string(),
                reason,
            }
        })?;

        parser.skip_whitespace();
        if parser.pos < parser.input.len() {
            return Err(ModelError::InvalidExpression {
                expr: s.to_string(),
                reason: format!("unexpected trailing input at offset {}", parser.pos),
            });
        }

        Ok(expr)
    }

    /// Wraps a Rust closure as an expression.
    pub fn native<F>(f: F) -> Self
    where
        F: Fn(&Value) -> Result<Value, EvalError> + Send + Sync + 'static,
    {
        Expr::Native(NativeExpr(Arc::new(f)))
    }

    /// A literal value expression.
    pub fn literal(value: impl Into<Value>) -> Self {
        Expr::Literal(value.into())
    }

    /// Evaluates the expression against a data object.
    pub fn evaluate(&self, data: &Value) -> Result<Value, EvalError> {
        match self {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Path(path) => Ok(get_path(data, path)),
            Expr::Not(inner) => Ok(Value::Bool(!is_truthy(&inner.evaluate(data)?))),
            Expr::Neg(inner) => {
                let value = inner.evaluate(data)?;
                match as_f64(&value) {
                    Some(n) => number_value(-n, value.as_i64().and_then(|i| i.checked_neg())),
                    None => Err(EvalError::type_error(format!(
                        "cannot negate {}",
                        type_name(&value)
                    ))),
                }
            }
            Expr::Binary { op, left, right } => evaluate_binary(*op, left, right, data),
            Expr::Native(native) => (native.0)(data),
        }
    }

    /// Evaluates the expression and reduces the result to its truthiness.
    pub fn evaluate_bool(&self, data: &Value) -> Result<bool, EvalError> {
        Ok(is_truthy(&self.evaluate(data)?))
    }
}

fn evaluate_binary(op: BinaryOp, left: &Expr, right: &Expr, data: &Value) -> Result<Value, EvalError> {
    // Short-circuit the boolean operators.
    match op {
        BinaryOp::And => {
            if !left.evaluate_bool(data)? {
                return Ok(Value::Bool(false));
            }
            return Ok(Value::Bool(right.evaluate_bool(data)?));
        }
        BinaryOp::Or => {
            if left.evaluate_bool(data)? {
                return Ok(Value::Bool(true));
            }
            return Ok(Value::Bool(right.evaluate_bool(data)?));
        }
        _ => {}
    }

    let lhs = left.evaluate(data)?;
    let rhs = right.evaluate(data)?;

    match op {
        BinaryOp::Eq => Ok(Value::Bool(values_equal(&lhs, &rhs))),
        BinaryOp::Ne => Ok(Value::Bool(!values_equal(&lhs, &rhs))),
        BinaryOp::Gt => Ok(Value::Bool(compare_numeric(&lhs, &rhs, |l, r| l > r))),
        BinaryOp::Ge => Ok(Value::Bool(compare_numeric(&lhs, &rhs, |l, r| l >= r))),
        BinaryOp::Lt => Ok(Value::Bool(compare_numeric(&lhs, &rhs, |l, r| l < r))),
        BinaryOp::Le => Ok(Value::Bool(compare_numeric(&lhs, &rhs, |l, r| l <= r))),
        BinaryOp::Add => {
            // String on either side means concatenation.
            if lhs.is_string() || rhs.is_string() {
                return Ok(Value::String(format!(
                    "{}{}",
                    display_value(&lhs),
                    display_value(&rhs)
                )));
            }
            arithmetic(op, &lhs, &rhs)
        }
        BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => {
            arithmetic(op, &lhs, &rhs)
        }
        BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
    }
}

fn arithmetic(op: BinaryOp, lhs: &Value, rhs: &Value) -> Result<Value, EvalError> {
    let (lf, rf) = match (as_f64(lhs), as_f64(rhs)) {
        (Some(l), Some(r)) => (l, r),
        _ => {
            return Err(EvalError::type_error(format!(
                "'{}' requires numbers, got {} and {}",
                op.symbol(),
                type_name(lhs),
                type_name(rhs)
            )))
        }
    };

    // Integer arithmetic when both operands are integers and the operation
    // stays in integer range. Division always produces a float.
    if let (Some(li), Some(ri)) = (lhs.as_i64(), rhs.as_i64()) {
        let int_result = match op {
            BinaryOp::Add => li.checked_add(ri),
            BinaryOp::Sub => li.checked_sub(ri),
            BinaryOp::Mul => li.checked_mul(ri),
            BinaryOp::Mod => {
                if ri == 0 {
                    return Err(EvalError::type_error("modulo by zero"));
                }
                li.checked_rem(ri)
            }
            _ => None,
        };
        if let Some(i) = int_result {
            return Ok(Value::Number(i.into()));
        }
    }

    let result = match op {
        BinaryOp::Add => lf + rf,
        BinaryOp::Sub => lf - rf,
        BinaryOp::Mul => lf * rf,
        BinaryOp::Div => lf / rf,
        BinaryOp::Mod => lf % rf,
        _ => unreachable!(),
    };
    number_value(result, None)
}

fn number_value(f: f64, int: Option<i64>) -> Result<Value, EvalError> {
    if let Some(i) = int {
        return Ok(Value::Number(i.into()));
    }
    serde_json::Number::from_f64(f)
        .map(Value::Number)
        .ok_or_else(|| EvalError::type_error(format!("non-finite result: {}", f)))
}

/// Walks a dotted path into a value. Missing fields resolve to null.
pub fn get_path(data: &Value, path: &str) -> Value {
    if path.is_empty() {
        return data.clone();
    }

    let mut current = data;
    for part in path.split('.') {
        match current {
            Value::Object(map) => {
                current = map.get(part).unwrap_or(&Value::Null);
            }
            Value::Array(items) => match part.parse::<usize>() {
                Ok(index) => current = items.get(index).unwrap_or(&Value::Null),
                Err(_) => return Value::Null,
            },
            _ => return Value::Null,
        }
    }
    current.clone()
}

/// Truthiness of a value: null, false, 0, "", [] and {} are falsy.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Value equality: numbers compare numerically, other types structurally.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => a
            .as_f64()
            .zip(b.as_f64())
            .map(|(a, b)| (a - b).abs() < f64::EPSILON)
            .unwrap_or(false),
        _ => a == b,
    }
}

fn compare_numeric<F>(a: &Value, b: &Value, op: F) -> bool
where
    F: Fn(f64, f64) -> bool,
{
    match (as_f64(a), as_f64(b)) {
        (Some(a), Some(b)) => op(a, b),
        _ => false,
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

/// A writable dotted path into the data object.
///
/// The `ctx.` prefix used by expressions is accepted but optional, so
/// `order.total` and `ctx.order.total` name the same field. Assignment
/// creates intermediate objects as needed and fails if an intermediate
/// is not an object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    raw: String,
    segments: Vec<String>,
}

impl Location {
    /// Parses a location path such as `order.total` or `ctx.order.total`.
    pub fn parse(s: &str) -> Result<Self, ModelError> {
        let trimmed = s.trim();
        let rest = match trimmed.strip_prefix("ctx.") {
            Some(rest) => rest,
            None if trimmed == "ctx" => {
                return Err(ModelError::InvalidLocation {
                    location: s.to_string(),
                    reason: "cannot assign to the data root".to_string(),
                });
            }
            None => trimmed,
        };

        if rest.is_empty() {
            return Err(ModelError::InvalidLocation {
                location: s.to_string(),
                reason: "empty field name".to_string(),
            });
        }

        let segments: Vec<String> = rest.split('.').map(|s| s.to_string()).collect();
        for segment in &segments {
            if segment.is_empty()
                || !segment.chars().all(|c| c.is_alphanumeric() || c == '_')
            {
                return Err(ModelError::InvalidLocation {
                    location: s.to_string(),
                    reason: format!("invalid path segment '{}'", segment),
                });
            }
        }

        Ok(Self {
            raw: trimmed.to_string(),
            segments,
        })
    }

    /// The location as written.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// The path relative to the data object root.
    pub fn path(&self) -> String {
        self.segments.join(".")
    }

    /// Reads the current value at this location. Missing fields are null.
    pub fn read(&self, data: &Value) -> Value {
        get_path(data, &self.path())
    }

    /// Writes a value at this location, creating intermediate objects.
    pub fn assign(&self, data: &mut Value, value: Value) -> Result<(), EvalError> {
        if !data.is_object() {
            return Err(EvalError::Assign {
                location: self.raw.clone(),
                reason: "data root is not an object".to_string(),
            });
        }

        let mut current = data;
        for (i, segment) in self.segments.iter().enumerate() {
            let map = current.as_object_mut().ok_or_else(|| EvalError::Assign {
                location: self.raw.clone(),
                reason: format!(
                    "'{}' is not an object",
                    self.segments[..i].join(".")
                ),
            })?;

            if i == self.segments.len() - 1 {
                map.insert(segment.clone(), value);
                return Ok(());
            }

            current = map
                .entry(segment.clone())
                .or_insert_with(|| Value::Object(Default::default()));
        }
        unreachable!("segments is never empty")
    }
}

/// Recursive descent parser for the expression grammar.
struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn parse_expr(&mut self) -> Result<Expr, String> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_and()?;
        self.skip_whitespace();

        while self.peek_str("||") {
            self.pos += 2;
            let right = self.parse_and()?;
            left = Expr::Binary {
                op: BinaryOp::Or,
                left: Box::new(left),
                right: Box::new(right),
            };
            self.skip_whitespace();
        }

        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_comparison()?;
        self.skip_whitespace();

        while self.peek_str("&&") {
            self.pos += 2;
            let right = self.parse_comparison()?;
            left = Expr::Binary {
                op: BinaryOp::And,
                left: Box::new(left),
                right: Box::new(right),
            };
            self.skip_whitespace();
        }

        Ok(left)
    }

    fn parse_comparison(&mut self) -> Result<Expr, String> {
        let left = self.parse_additive()?;
        self.skip_whitespace();

        let op = if self.peek_str("==") {
            Some((BinaryOp::Eq, 2))
        } else if self.peek_str("!=") {
            Some((BinaryOp::Ne, 2))
        } else if self.peek_str(">=") {
            Some((BinaryOp::Ge, 2))
        } else if self.peek_str("<=") {
            Some((BinaryOp::Le, 2))
        } else if self.peek_char() == Some('>') {
            Some((BinaryOp::Gt, 1))
        } else if self.peek_char() == Some('<') {
            Some((BinaryOp::Lt, 1))
        } else {
            None
        };

        match op {
            Some((op, len)) => {
                self.pos += len;
                let right = self.parse_additive()?;
                Ok(Expr::Binary {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                })
            }
            None => Ok(left),
        }
    }

    fn parse_additive(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_multiplicative()?;
        self.skip_whitespace();

        loop {
            let op = match self.peek_char() {
                Some('+') => BinaryOp::Add,
                // Reject "-" that is part of "->" or a comparison follow-up;
                // a bare minus here is always subtraction.
                Some('-') => BinaryOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_multiplicative()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
            self.skip_whitespace();
        }

        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_unary()?;
        self.skip_whitespace();

        loop {
            let op = match self.peek_char() {
                Some('*') => BinaryOp::Mul,
                Some('/') => BinaryOp::Div,
                Some('%') => BinaryOp::Mod,
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
            self.skip_whitespace();
        }

        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, String> {
        self.skip_whitespace();

        if self.peek_char() == Some('!') && !self.peek_str("!=") {
            self.pos += 1;
            let inner = self.parse_unary()?; // Recursive to allow !!ctx.a
            return Ok(Expr::Not(Box::new(inner)));
        }

        if self.peek_char() == Some('-') {
            self.pos += 1;
            let inner = self.parse_unary()?;
            return Ok(Expr::Neg(Box::new(inner)));
        }

        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, String> {
        self.skip_whitespace();

        match self.peek_char() {
            Some('(') => {
                self.pos += 1;
                let expr = self.parse_expr()?;
                self.skip_whitespace();
                if self.peek_char() != Some(')') {
                    return Err("expected ')'".to_string());
                }
                self.pos += 1;
                Ok(expr)
            }
            Some(quote) if quote == '"' || quote == '\'' => {
                let s = self.parse_string(quote)?;
                Ok(Expr::Literal(Value::String(s)))
            }
            Some('[') => self.parse_array(),
            Some(c) if c.is_ascii_digit() => {
                let n = self.parse_number()?;
                Ok(Expr::Literal(n))
            }
            Some(_) => self.parse_keyword_or_path(),
            None => Err("unexpected end of expression".to_string()),
        }
    }

    fn parse_keyword_or_path(&mut self) -> Result<Expr, String> {
        let start = self.pos;
        while let Some(c) = self.peek_char() {
            if c.is_alphanumeric() || c == '_' || c == '.' {
                self.pos += c.len_utf8();
            } else {
                break;
            }
        }

        let word = &self.input[start..self.pos];
        match word {
            "true" => Ok(Expr::Literal(Value::Bool(true))),
            "false" => Ok(Expr::Literal(Value::Bool(false))),
            "null" => Ok(Expr::Literal(Value::Null)),
            "ctx" => Ok(Expr::Path(String::new())),
            _ => {
                let field = word.strip_prefix("ctx.").ok_or_else(|| {
                    format!("expected a literal or a 'ctx.' path, found '{}'", word)
                })?;
                if field.is_empty() || field.ends_with('.') || field.contains("..") {
                    return Err(format!("malformed path '{}'", word));
                }
                Ok(Expr::Path(field.to_string()))
            }
        }
    }

    fn parse_array(&mut self) -> Result<Expr, String> {
        // past '['
        self.pos += 1;
        let mut items = Vec::new();

        loop {
            self.skip_whitespace();
            if self.peek_char() == Some(']') {
                self.pos += 1;
                return Ok(Expr::Literal(Value::Array(items)));
            }

            let item = self.parse_literal_value()?;
            items.push(item);

            self.skip_whitespace();
            match self.peek_char() {
                Some(',') => self.pos += 1,
                Some(']') => {}
                _ => return Err("expected ',' or ']' in array".to_string()),
            }
        }
    }

    fn parse_literal_value(&mut self) -> Result<Value, String> {
        self.skip_whitespace();
        match self.peek_char() {
            Some(quote) if quote == '"' || quote == '\'' => {
                Ok(Value::String(self.parse_string(quote)?))
            }
            Some('-') => {
                self.pos += 1;
                match self.parse_number()? {
                    Value::Number(n) => {
                        if let Some(i) = n.as_i64() {
                            Ok(Value::Number((-i).into()))
                        } else {
                            serde_json::Number::from_f64(-n.as_f64().unwrap_or(0.0))
                                .map(Value::Number)
                                .ok_or_else(|| "invalid number".to_string())
                        }
                    }
                    _ => unreachable!(),
                }
            }
            Some(c) if c.is_ascii_digit() => self.parse_number(),
            _ => {
                if self.peek_str("true") {
                    self.pos += 4;
                    Ok(Value::Bool(true))
                } else if self.peek_str("false") {
                    self.pos += 5;
                    Ok(Value::Bool(false))
                } else if self.peek_str("null") {
                    self.pos += 4;
                    Ok(Value::Null)
                } else {
                    Err("expected a literal".to_string())
                }
            }
        }
    }

    fn parse_string(&mut self, quote: char) -> Result<String, String> {
        // past opening quote
        self.pos += 1;
        let start = self.pos;

        while let Some(c) = self.peek_char() {
            if c == quote {
                let s = self.input[start..self.pos].to_string();
                self.pos += 1;
                // Minimal escape handling: the delimiter and \\.
                return Ok(s
                    .replace(&format!("\\{}", quote), &quote.to_string())
                    .replace("\\\\", "\\"));
            }
            if c == '\\' {
                self.pos += 1;
                if let Some(escaped) = self.peek_char() {
                    self.pos += escaped.len_utf8();
                }
            } else {
                self.pos += c.len_utf8();
            }
        }

        Err("unterminated string".to_string())
    }

    fn parse_number(&mut self) -> Result<Value, String> {
        let start = self.pos;

        while let Some(c) = self.peek_char() {
            if c.is_ascii_digit() {
                self.pos += 1;
            } else {
                break;
            }
        }

        let mut is_float = false;
        if self.peek_char() == Some('.')
            && self.input[self.pos + 1..]
                .chars()
                .next()
                .map(|c| c.is_ascii_digit())
                .unwrap_or(false)
        {
            is_float = true;
            self.pos += 1;
            while let Some(c) = self.peek_char() {
                if c.is_ascii_digit() {
                    self.pos += 1;
                } else {
                    break;
                }
            }
        }

        let text = &self.input[start..self.pos];
        if text.is_empty() {
            return Err("expected a number".to_string());
        }

        if is_float {
            let f: f64 = text
                .parse()
                .map_err(|_| format!("invalid number: '{}'", text))?;
            serde_json::Number::from_f64(f)
                .map(Value::Number)
                .ok_or_else(|| format!("invalid number: '{}'", text))
        } else {
            let i: i64 = text
                .parse()
                .map_err(|_| format!("invalid number: '{}'", text))?;
            Ok(Value::Number(i.into()))
        }
    }

    fn skip_whitespace(&mut self) {
        while let Some(c) = self.peek_char() {
            if c.is_whitespace() {
                self.pos += c.len_utf8();
            } else {
                break;
            }
        }
    }

    fn peek_char(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn peek_str(&self, s: &str) -> bool {
        self.input[self.pos..].starts_with(s)
    }
}
