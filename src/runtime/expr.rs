//! Symbolic expression resolution for action templates
//!
//! Action and guard configuration is plain JSON. Any string that starts with
//! `$` is an expression evaluated against a scope object exposing
//! `context`, `item` and `result`; everything else is a literal (`$$` escapes
//! a leading dollar). Resolution is pure: it never touches the store.

use serde_json::{Map, Number, Value, json};

use super::error::ExprError;

/// Pure template resolution hook
pub trait ExpressionResolver: Send + Sync {
    /// Resolve every expression inside `template` against `scope`
    fn resolve(&self, template: &Value, scope: &Value) -> Result<Value, ExprError>;
}

/// Build the scope object templates are resolved against
pub fn scope(context: &Value, item: &Value, result: &Value) -> Value {
    json!({ "context": context, "item": item, "result": result })
}

/// Interpret a resolved value as a condition
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(text) => !text.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Built-in expression language
///
/// Grammar, lowest precedence first: `||`, `&&`, `== !=`, `< <= > >=`,
/// `+ -`, `* / %`, unary `! -`, then literals, parenthesised expressions
/// and paths such as `context.items[0].title`. Paths may repeat the `$`
/// prefix (`$context.a + $item.b`). Missing path segments yield `null`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Expressions;

impl ExpressionResolver for Expressions {
    fn resolve(&self, template: &Value, scope: &Value) -> Result<Value, ExprError> {
        match template {
            Value::String(text) => {
                if let Some(escaped) = text.strip_prefix("$$") {
                    Ok(Value::String(format!("${}", escaped)))
                } else if let Some(source) = text.strip_prefix('$') {
                    evaluate(source, scope)
                } else {
                    Ok(template.clone())
                }
            }
            Value::Array(items) => items
                .iter()
                .map(|item| self.resolve(item, scope))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(map) => {
                let mut resolved = Map::new();
                for (key, value) in map {
                    resolved.insert(key.clone(), self.resolve(value, scope)?);
                }
                Ok(Value::Object(resolved))
            }
            _ => Ok(template.clone()),
        }
    }
}

/// Evaluate a single expression (without its leading `$`)
pub fn evaluate(source: &str, scope: &Value) -> Result<Value, ExprError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser {
        source,
        tokens,
        pos: 0,
    };
    let node = parser.parse_or()?;
    if parser.pos != parser.tokens.len() {
        return Err(parse_error(source, "unexpected trailing input"));
    }
    node.eval(source, scope)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(Number),
    Str(String),
    Path(Vec<Segment>),
    Literal(Value),
    Op(&'static str),
    LParen,
    RParen,
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Key(String),
    Index(usize),
}

const OPERATORS: [&str; 15] = [
    "||", "&&", "==", "!=", "<=", ">=", "<", ">", "+", "-", "*", "/", "%", "!", "=",
];

fn tokenize(source: &str) -> Result<Vec<Token>, ExprError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if c == '(' {
            tokens.push(Token::LParen);
            i += 1;
        } else if c == ')' {
            tokens.push(Token::RParen);
            i += 1;
        } else if c.is_ascii_digit() {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            let text: String = chars[start..i].iter().collect();
            tokens.push(Token::Number(parse_number(source, &text)?));
        } else if c == '\'' || c == '"' {
            let quote = c;
            let mut text = String::new();
            i += 1;
            loop {
                match chars.get(i) {
                    None => return Err(parse_error(source, "unterminated string")),
                    Some('\\') => {
                        if let Some(next) = chars.get(i + 1) {
                            text.push(*next);
                        }
                        i += 2;
                    }
                    Some(ch) if *ch == quote => {
                        i += 1;
                        break;
                    }
                    Some(ch) => {
                        text.push(*ch);
                        i += 1;
                    }
                }
            }
            tokens.push(Token::Str(text));
        } else if c == '$' || c == '_' || c.is_alphabetic() {
            if c == '$' {
                i += 1;
            }
            let (segments, next) = read_path(source, &chars, i)?;
            i = next;
            let literal = match segments.as_slice() {
                [Segment::Key(word)] if word == "true" => Some(Value::Bool(true)),
                [Segment::Key(word)] if word == "false" => Some(Value::Bool(false)),
                [Segment::Key(word)] if word == "null" => Some(Value::Null),
                _ => None,
            };
            tokens.push(match literal {
                Some(value) => Token::Literal(value),
                None => Token::Path(segments),
            });
        } else {
            let rest: String = chars[i..].iter().take(2).collect();
            let op = OPERATORS
                .iter()
                .find(|op| rest.starts_with(**op))
                .ok_or_else(|| parse_error(source, &format!("unexpected character '{}'", c)))?;
            if *op == "=" {
                return Err(parse_error(source, "use '==' for comparison"));
            }
            tokens.push(Token::Op(*op));
            i += op.len();
        }
    }

    Ok(tokens)
}

fn read_path(source: &str, chars: &[char], mut i: usize) -> Result<(Vec<Segment>, usize), ExprError> {
    let mut segments = Vec::new();
    let read_ident = |i: &mut usize| -> Result<String, ExprError> {
        let start = *i;
        while *i < chars.len() && (chars[*i].is_alphanumeric() || chars[*i] == '_') {
            *i += 1;
        }
        if start == *i {
            return Err(parse_error(source, "expected identifier"));
        }
        Ok(chars[start..*i].iter().collect())
    };

    segments.push(Segment::Key(read_ident(&mut i)?));
    loop {
        match chars.get(i) {
            Some('.') => {
                i += 1;
                segments.push(Segment::Key(read_ident(&mut i)?));
            }
            Some('[') => {
                let start = i + 1;
                let mut end = start;
                while end < chars.len() && chars[end].is_ascii_digit() {
                    end += 1;
                }
                if chars.get(end) != Some(&']') || end == start {
                    return Err(parse_error(source, "expected numeric index"));
                }
                let text: String = chars[start..end].iter().collect();
                let index = text
                    .parse()
                    .map_err(|_| parse_error(source, "index out of range"))?;
                segments.push(Segment::Index(index));
                i = end + 1;
            }
            _ => break,
        }
    }
    Ok((segments, i))
}

fn parse_number(source: &str, text: &str) -> Result<Number, ExprError> {
    if let Ok(int) = text.parse::<i64>() {
        return Ok(Number::from(int));
    }
    text.parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .ok_or_else(|| parse_error(source, &format!("invalid number '{}'", text)))
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BinOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

#[derive(Debug, Clone)]
enum Node {
    Literal(Value),
    Path(Vec<Segment>),
    Not(Box<Node>),
    Neg(Box<Node>),
    Binary(BinOp, Box<Node>, Box<Node>),
}

struct Parser<'a> {
    source: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser<'_> {
    fn peek_op(&self) -> Option<&'static str> {
        match self.tokens.get(self.pos) {
            Some(Token::Op(op)) => Some(*op),
            _ => None,
        }
    }

    fn binary_level(
        &mut self,
        ops: &[(&str, BinOp)],
        next: fn(&mut Self) -> Result<Node, ExprError>,
    ) -> Result<Node, ExprError> {
        let mut left = next(self)?;
        while let Some(op) = self.peek_op() {
            let Some((_, bin)) = ops.iter().find(|(text, _)| *text == op) else {
                break;
            };
            self.pos += 1;
            let right = next(self)?;
            left = Node::Binary(*bin, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_or(&mut self) -> Result<Node, ExprError> {
        self.binary_level(&[("||", BinOp::Or)], Self::parse_and)
    }

    fn parse_and(&mut self) -> Result<Node, ExprError> {
        self.binary_level(&[("&&", BinOp::And)], Self::parse_equality)
    }

    fn parse_equality(&mut self) -> Result<Node, ExprError> {
        self.binary_level(&[("==", BinOp::Eq), ("!=", BinOp::Ne)], Self::parse_comparison)
    }

    fn parse_comparison(&mut self) -> Result<Node, ExprError> {
        self.binary_level(
            &[
                ("<", BinOp::Lt),
                ("<=", BinOp::Le),
                (">", BinOp::Gt),
                (">=", BinOp::Ge),
            ],
            Self::parse_additive,
        )
    }

    fn parse_additive(&mut self) -> Result<Node, ExprError> {
        self.binary_level(&[("+", BinOp::Add), ("-", BinOp::Sub)], Self::parse_multiplicative)
    }

    fn parse_multiplicative(&mut self) -> Result<Node, ExprError> {
        self.binary_level(
            &[("*", BinOp::Mul), ("/", BinOp::Div), ("%", BinOp::Rem)],
            Self::parse_unary,
        )
    }

    fn parse_unary(&mut self) -> Result<Node, ExprError> {
        match self.peek_op() {
            Some("!") => {
                self.pos += 1;
                Ok(Node::Not(Box::new(self.parse_unary()?)))
            }
            Some("-") => {
                self.pos += 1;
                Ok(Node::Neg(Box::new(self.parse_unary()?)))
            }
            _ => self.parse_primary(),
        }
    }

    fn parse_primary(&mut self) -> Result<Node, ExprError> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or_else(|| parse_error(self.source, "unexpected end of expression"))?;
        self.pos += 1;
        match token {
            Token::Number(n) => Ok(Node::Literal(Value::Number(n))),
            Token::Str(text) => Ok(Node::Literal(Value::String(text))),
            Token::Literal(value) => Ok(Node::Literal(value)),
            Token::Path(segments) => Ok(Node::Path(segments)),
            Token::LParen => {
                let inner = self.parse_or()?;
                match self.tokens.get(self.pos) {
                    Some(Token::RParen) => {
                        self.pos += 1;
                        Ok(inner)
                    }
                    _ => Err(parse_error(self.source, "expected ')'")),
                }
            }
            Token::RParen | Token::Op(_) => {
                Err(parse_error(self.source, "expected a value"))
            }
        }
    }
}

impl Node {
    fn eval(&self, source: &str, scope: &Value) -> Result<Value, ExprError> {
        match self {
            Node::Literal(value) => Ok(value.clone()),
            Node::Path(segments) => Ok(lookup(scope, segments)),
            Node::Not(inner) => Ok(Value::Bool(!truthy(&inner.eval(source, scope)?))),
            Node::Neg(inner) => {
                let value = inner.eval(source, scope)?;
                if let Some(int) = value.as_i64() {
                    if let Some(negated) = int.checked_neg() {
                        return Ok(Value::from(negated));
                    }
                }
                let number = value
                    .as_f64()
                    .ok_or_else(|| type_error(source, "cannot negate a non-number"))?;
                float(source, -number)
            }
            Node::Binary(BinOp::Or, left, right) => {
                if truthy(&left.eval(source, scope)?) {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(truthy(&right.eval(source, scope)?)))
            }
            Node::Binary(BinOp::And, left, right) => {
                if !truthy(&left.eval(source, scope)?) {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(truthy(&right.eval(source, scope)?)))
            }
            Node::Binary(op, left, right) => {
                let left = left.eval(source, scope)?;
                let right = right.eval(source, scope)?;
                apply(source, *op, &left, &right)
            }
        }
    }
}

fn lookup(scope: &Value, segments: &[Segment]) -> Value {
    let mut current = scope;
    for segment in segments {
        let next = match segment {
            Segment::Key(key) => current.get(key.as_str()),
            Segment::Index(index) => current.get(*index),
        };
        match next {
            Some(value) => current = value,
            None => return Value::Null,
        }
    }
    current.clone()
}

fn apply(source: &str, op: BinOp, left: &Value, right: &Value) -> Result<Value, ExprError> {
    match op {
        BinOp::Eq => Ok(Value::Bool(loosely_equal(left, right))),
        BinOp::Ne => Ok(Value::Bool(!loosely_equal(left, right))),
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            let ordering = match (left, right) {
                (Value::String(a), Value::String(b)) => a.cmp(b),
                _ => {
                    let (a, b) = numbers(source, left, right)?;
                    a.partial_cmp(&b)
                        .ok_or_else(|| type_error(source, "numbers are not comparable"))?
                }
            };
            Ok(Value::Bool(match op {
                BinOp::Lt => ordering.is_lt(),
                BinOp::Le => ordering.is_le(),
                BinOp::Gt => ordering.is_gt(),
                _ => ordering.is_ge(),
            }))
        }
        BinOp::Add if left.is_string() || right.is_string() => {
            Ok(Value::String(format!("{}{}", display(left), display(right))))
        }
        BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Rem => {
            arithmetic(source, op, left, right)
        }
        BinOp::Or => Ok(Value::Bool(truthy(left) || truthy(right))),
        BinOp::And => Ok(Value::Bool(truthy(left) && truthy(right))),
    }
}

fn arithmetic(source: &str, op: BinOp, left: &Value, right: &Value) -> Result<Value, ExprError> {
    if let (Some(a), Some(b)) = (left.as_i64(), right.as_i64()) {
        let exact = match op {
            BinOp::Add => a.checked_add(b),
            BinOp::Sub => a.checked_sub(b),
            BinOp::Mul => a.checked_mul(b),
            BinOp::Div if a.checked_rem(b) == Some(0) => a.checked_div(b),
            BinOp::Rem => a.checked_rem(b),
            _ => None,
        };
        if let Some(value) = exact {
            return Ok(Value::from(value));
        }
    }

    let (a, b) = numbers(source, left, right)?;
    let value = match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div | BinOp::Rem if b == 0.0 => {
            return Err(type_error(source, "division by zero"));
        }
        BinOp::Div => a / b,
        _ => a % b,
    };
    float(source, value)
}

fn numbers(source: &str, left: &Value, right: &Value) -> Result<(f64, f64), ExprError> {
    match (left.as_f64(), right.as_f64()) {
        (Some(a), Some(b)) => Ok((a, b)),
        _ => Err(type_error(
            source,
            &format!("expected numbers, found {} and {}", left, right),
        )),
    }
}

fn loosely_equal(left: &Value, right: &Value) -> bool {
    match (left.as_f64(), right.as_f64()) {
        (Some(a), Some(b)) if left.is_number() && right.is_number() => a == b,
        _ => left == right,
    }
}

fn display(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn float(source: &str, value: f64) -> Result<Value, ExprError> {
    Number::from_f64(value)
        .map(Value::Number)
        .ok_or_else(|| type_error(source, "result is not a finite number"))
}

fn parse_error(source: &str, reason: &str) -> ExprError {
    ExprError::Parse {
        expr: source.to_string(),
        reason: reason.to_string(),
    }
}

fn type_error(source: &str, reason: &str) -> ExprError {
    ExprError::Type {
        expr: source.to_string(),
        reason: reason.to_string(),
    }
}
