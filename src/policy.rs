//! Policy evaluation over pairs of ads.
//!
//! The scheduler treats the policy language as opaque: it only ever asks
//! "is this expression true for (my, target)?" or "what number does it
//! yield?". [`SimpleEvaluator`] is the bundled implementation and understands
//! a small boolean/comparison grammar:
//!
//! ```text
//! expr    := or
//! or      := and ("||" and)*
//! and     := unary ("&&" unary)*
//! unary   := "!" unary | cmp
//! cmp     := primary (("==" | "!=" | "<" | "<=" | ">" | ">=") primary)?
//! primary := number | "string" | true | false | ident | "(" expr ")"
//! ident   := ("MY." | "TARGET.")? name
//! ```

use serde_json::Value;

use crate::ad::Ad;

pub trait Evaluator: Send + Sync {
    /// `None` means the expression was undefined or not boolean.
    fn eval_bool(&self, expr: &str, my: &Ad, target: &Ad) -> Option<bool>;

    fn eval_number(&self, expr: &str, my: &Ad, target: &Ad) -> Option<f64>;
}

#[derive(Debug, Clone, Default)]
pub struct SimpleEvaluator;

impl Evaluator for SimpleEvaluator {
    fn eval_bool(&self, expr: &str, my: &Ad, target: &Ad) -> Option<bool> {
        match evaluate(expr, my, target)? {
            Val::Bool(b) => Some(b),
            Val::Num(n) => Some(n != 0.0),
            _ => None,
        }
    }

    fn eval_number(&self, expr: &str, my: &Ad, target: &Ad) -> Option<f64> {
        match evaluate(expr, my, target)? {
            Val::Num(n) => Some(n),
            Val::Bool(b) => Some(if b { 1.0 } else { 0.0 }),
            Val::Str(s) => s.trim().parse().ok(),
            Val::Undefined => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Val {
    Num(f64),
    Str(String),
    Bool(bool),
    Undefined,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Str(String),
    Ident(String),
    Op(&'static str),
    LParen,
    RParen,
}

fn evaluate(expr: &str, my: &Ad, target: &Ad) -> Option<Val> {
    let tokens = tokenize(expr)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
        my,
        target,
    };
    let val = parser.or()?;
    if parser.pos != parser.tokens.len() {
        return None;
    }
    Some(val)
}

fn tokenize(input: &str) -> Option<Vec<Token>> {
    const OPS: [&str; 10] = ["&&", "||", "==", "!=", "<=", ">=", "<", ">", "!", "="];
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    'outer: while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if c == '(' {
            tokens.push(Token::LParen);
            i += 1;
            continue;
        }
        if c == ')' {
            tokens.push(Token::RParen);
            i += 1;
            continue;
        }
        if c == '"' {
            let start = i + 1;
            let mut end = start;
            while end < chars.len() && chars[end] != '"' {
                end += 1;
            }
            if end >= chars.len() {
                return None;
            }
            tokens.push(Token::Str(chars[start..end].iter().collect()));
            i = end + 1;
            continue;
        }
        if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).is_some_and(|d| d.is_ascii_digit()))
        {
            let start = i;
            i += 1;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            let text: String = chars[start..i].iter().collect();
            tokens.push(Token::Num(text.parse().ok()?));
            continue;
        }
        if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.')
            {
                i += 1;
            }
            tokens.push(Token::Ident(chars[start..i].iter().collect()));
            continue;
        }
        for op in OPS {
            let len = op.len();
            if i + len <= chars.len() && chars[i..i + len].iter().copied().eq(op.chars()) {
                // A lone "=" is accepted as equality.
                tokens.push(Token::Op(if op == "=" { "==" } else { op }));
                i += len;
                continue 'outer;
            }
        }
        return None;
    }
    Some(tokens)
}

/// Deepest nesting of parentheses and negations an expression may use.
const MAX_NESTING: usize = 256;

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
    my: &'a Ad,
    target: &'a Ad,
}

impl Parser<'_> {
    fn peek_op(&self) -> Option<&'static str> {
        match self.tokens.get(self.pos) {
            Some(Token::Op(op)) => Some(*op),
            _ => None,
        }
    }

    fn nested<T>(&mut self, parse: impl FnOnce(&mut Self) -> Option<T>) -> Option<T> {
        if self.depth >= MAX_NESTING {
            return None;
        }
        self.depth += 1;
        let result = parse(self);
        self.depth -= 1;
        result
    }

    fn or(&mut self) -> Option<Val> {
        let mut left = self.and()?;
        while self.peek_op() == Some("||") {
            self.pos += 1;
            let right = self.and()?;
            left = match (truthy(&left), truthy(&right)) {
                (Some(true), _) | (_, Some(true)) => Val::Bool(true),
                (Some(false), Some(false)) => Val::Bool(false),
                _ => Val::Undefined,
            };
        }
        Some(left)
    }

    fn and(&mut self) -> Option<Val> {
        let mut left = self.unary()?;
        while self.peek_op() == Some("&&") {
            self.pos += 1;
            let right = self.unary()?;
            left = match (truthy(&left), truthy(&right)) {
                (Some(false), _) | (_, Some(false)) => Val::Bool(false),
                (Some(true), Some(true)) => Val::Bool(true),
                _ => Val::Undefined,
            };
        }
        Some(left)
    }

    fn unary(&mut self) -> Option<Val> {
        if self.peek_op() == Some("!") {
            self.pos += 1;
            let inner = self.nested(Self::unary)?;
            return Some(match truthy(&inner) {
                Some(b) => Val::Bool(!b),
                None => Val::Undefined,
            });
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Option<Val> {
        let left = self.primary()?;
        let op = match self.peek_op() {
            Some(op @ ("==" | "!=" | "<" | "<=" | ">" | ">=")) => op,
            _ => return Some(left),
        };
        self.pos += 1;
        let right = self.primary()?;
        Some(compare(op, &left, &right))
    }

    fn primary(&mut self) -> Option<Val> {
        let token = self.tokens.get(self.pos)?.clone();
        self.pos += 1;
        match token {
            Token::Num(n) => Some(Val::Num(n)),
            Token::Str(s) => Some(Val::Str(s)),
            Token::Ident(name) => Some(self.lookup(&name)),
            Token::LParen => {
                let val = self.nested(Self::or)?;
                match self.tokens.get(self.pos) {
                    Some(Token::RParen) => {
                        self.pos += 1;
                        Some(val)
                    }
                    _ => None,
                }
            }
            Token::RParen | Token::Op(_) => None,
        }
    }

    fn lookup(&self, name: &str) -> Val {
        if name.eq_ignore_ascii_case("true") {
            return Val::Bool(true);
        }
        if name.eq_ignore_ascii_case("false") {
            return Val::Bool(false);
        }
        if name.eq_ignore_ascii_case("undefined") {
            return Val::Undefined;
        }
        let (scope, attr) = match name.split_once('.') {
            Some((scope, attr)) if scope.eq_ignore_ascii_case("my") => (Some(true), attr),
            Some((scope, attr)) if scope.eq_ignore_ascii_case("target") => (Some(false), attr),
            _ => (None, name),
        };
        let value = match scope {
            Some(true) => self.my.get(attr),
            Some(false) => self.target.get(attr),
            None => self.my.get(attr).or_else(|| self.target.get(attr)),
        };
        match value {
            Some(Value::Bool(b)) => Val::Bool(*b),
            Some(Value::Number(n)) => n.as_f64().map(Val::Num).unwrap_or(Val::Undefined),
            Some(Value::String(s)) => Val::Str(s.clone()),
            _ => Val::Undefined,
        }
    }
}

fn truthy(v: &Val) -> Option<bool> {
    match v {
        Val::Bool(b) => Some(*b),
        Val::Num(n) => Some(*n != 0.0),
        _ => None,
    }
}

fn compare(op: &str, left: &Val, right: &Val) -> Val {
    let ordering = match (left, right) {
        (Val::Num(a), Val::Num(b)) => a.partial_cmp(b),
        (Val::Str(a), Val::Str(b)) => Some(a.to_lowercase().cmp(&b.to_lowercase())),
        (Val::Bool(a), Val::Bool(b)) => Some(a.cmp(b)),
        (Val::Str(s), Val::Num(n)) => s.trim().parse::<f64>().ok().and_then(|a| a.partial_cmp(n)),
        (Val::Num(n), Val::Str(s)) => s.trim().parse::<f64>().ok().and_then(|b| n.partial_cmp(&b)),
        _ => None,
    };
    let Some(ordering) = ordering else {
        return Val::Undefined;
    };
    use std::cmp::Ordering::*;
    Val::Bool(match op {
        "==" => ordering == Equal,
        "!=" => ordering != Equal,
        "<" => ordering == Less,
        "<=" => ordering != Greater,
        ">" => ordering == Greater,
        ">=" => ordering != Less,
        _ => return Val::Undefined,
    })
}
