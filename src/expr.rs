//! Expression Engine - formulas bound to nodes
//!
//! Formulas are parsed once when a node is declared and evaluated lazily
//! against an [`Environment`]. A lookup that cannot be answered yet yields
//! [`Resolution::Deferred`], which is distinct from a hard error.
//!
//! Precedence, loosest first: `? :`, `or`, `and`, `not`, comparisons,
//! `|`, `^`, `&`, shifts, `+ -`, `* / %`, unary `- ~ !`.

use thiserror::Error;

use crate::convert;
use crate::error::{BuildError, Result};
use crate::value::Value;

/// Outcome of a lookup or evaluation that may not be answerable yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution<T> {
    Resolved(T),
    Deferred(String),
}

impl<T> Resolution<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Resolution<U> {
        match self {
            Self::Resolved(v) => Resolution::Resolved(f(v)),
            Self::Deferred(why) => Resolution::Deferred(why),
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, Self::Resolved(_))
    }

    pub fn resolved(self) -> Option<T> {
        match self {
            Self::Resolved(v) => Some(v),
            Self::Deferred(_) => None,
        }
    }

    /// Turn a deferral into a hard error, for callers that cannot wait.
    pub fn require(self, node: &str, what: &str) -> Result<T> {
        match self {
            Self::Resolved(v) => Ok(v),
            Self::Deferred(why) => Err(BuildError::component(
                node,
                format!("{what} cannot be resolved: {why}"),
            )),
        }
    }
}

/// Unwrap a `Result<Resolution<T>>`, returning early with the deferral.
#[macro_export]
macro_rules! resolved {
    ($e:expr) => {
        match $e? {
            $crate::expr::Resolution::Resolved(v) => v,
            $crate::expr::Resolution::Deferred(why) => {
                return Ok($crate::expr::Resolution::Deferred(why))
            }
        }
    };
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExprError {
    #[error("syntax error in {formula:?}: {message}")]
    Syntax { formula: String, message: String },

    #[error("unmatched bracket in {0:?}")]
    UnmatchedBracket(String),

    #[error("'?' and ':' do not pair up in {0:?}")]
    TernaryMismatch(String),

    #[error("malformed path {path:?}: {message}")]
    MalformedPath { path: String, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Shl,
    Shr,
    BitAnd,
    BitOr,
    BitXor,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
    BitNot,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Path(String),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Ternary(Box<Expr>, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Int(i128),
    Str(String),
    Bool(bool),
    Path(String),
    Op(BinOp),
    Not,
    Tilde,
    And,
    Or,
    LParen,
    RParen,
    Question,
    Colon,
}

fn is_path_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_' || c == '{'
}

fn tokenize(src: &str) -> std::result::Result<Vec<Token>, ExprError> {
    let chars: Vec<char> = src.chars().collect();
    let syntax = |message: String| ExprError::Syntax {
        formula: src.to_string(),
        message,
    };
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let operand_expected = matches!(
            tokens.last(),
            None | Some(
                Token::Op(_)
                    | Token::Not
                    | Token::Tilde
                    | Token::And
                    | Token::Or
                    | Token::LParen
                    | Token::Question
                    | Token::Colon
            )
        );
        match c {
            c if c.is_whitespace() => i += 1,
            '0'..='9' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let v = convert::parse_int(&text)
                    .map_err(|_| syntax(format!("invalid number {text:?}")))?;
                tokens.push(Token::Int(v));
            }
            '"' | '\'' => {
                let quote = c;
                let mut text = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(syntax("unterminated string".into())),
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
            }
            '/' if operand_expected && chars.get(i + 1).copied().is_some_and(is_path_start) => {
                let (path, next) = read_path(&chars, i, src)?;
                tokens.push(Token::Path(path));
                i = next;
            }
            c if is_path_start(c) => {
                let (path, next) = read_path(&chars, i, src)?;
                i = next;
                tokens.push(match path.to_ascii_lowercase().as_str() {
                    "true" => Token::Bool(true),
                    "false" => Token::Bool(false),
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    _ => Token::Path(path),
                });
            }
            _ => {
                let next = chars.get(i + 1).copied();
                let (token, width) = match (c, next) {
                    ('(', _) => (Token::LParen, 1),
                    (')', _) => (Token::RParen, 1),
                    ('?', _) => (Token::Question, 1),
                    (':', _) => (Token::Colon, 1),
                    ('~', _) => (Token::Tilde, 1),
                    ('!', Some('=')) => (Token::Op(BinOp::Ne), 2),
                    ('!', _) => (Token::Not, 1),
                    ('=', Some('=')) => (Token::Op(BinOp::Eq), 2),
                    ('<', Some('<')) => (Token::Op(BinOp::Shl), 2),
                    ('<', Some('=')) => (Token::Op(BinOp::Le), 2),
                    ('<', _) => (Token::Op(BinOp::Lt), 1),
                    ('>', Some('>')) => (Token::Op(BinOp::Shr), 2),
                    ('>', Some('=')) => (Token::Op(BinOp::Ge), 2),
                    ('>', _) => (Token::Op(BinOp::Gt), 1),
                    ('&', Some('&')) => (Token::And, 2),
                    ('&', _) => (Token::Op(BinOp::BitAnd), 1),
                    ('|', Some('|')) => (Token::Or, 2),
                    ('|', _) => (Token::Op(BinOp::BitOr), 1),
                    ('^', _) => (Token::Op(BinOp::BitXor), 1),
                    ('+', _) => (Token::Op(BinOp::Add), 1),
                    ('-', _) => (Token::Op(BinOp::Sub), 1),
                    ('*', _) => (Token::Op(BinOp::Mul), 1),
                    ('/', _) => (Token::Op(BinOp::Div), 1),
                    ('%', _) => (Token::Op(BinOp::Mod), 1),
                    ('[', _) | (']', _) => return Err(ExprError::UnmatchedBracket(src.to_string())),
                    _ => return Err(syntax(format!("unexpected character {c:?}"))),
                };
                tokens.push(token);
                i += width;
            }
        }
    }
    Ok(tokens)
}

/// Read a path token: names, `.property`, `{placeholder}`, balanced `[...]`
/// and `/` separators that are directly followed by another segment.
fn read_path(chars: &[char], start: usize, src: &str) -> std::result::Result<(String, usize), ExprError> {
    let mut i = start;
    let mut out = String::new();
    if chars[i] == '/' {
        out.push('/');
        i += 1;
    }
    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_ascii_alphanumeric() || c == '_' || c == '.' => {
                out.push(c);
                i += 1;
            }
            '{' => {
                let close = chars[i..]
                    .iter()
                    .position(|ch| *ch == '}')
                    .ok_or_else(|| ExprError::UnmatchedBracket(src.to_string()))?;
                out.extend(&chars[i..=i + close]);
                i += close + 1;
            }
            '[' => {
                let mut depth = 0usize;
                let mut j = i;
                loop {
                    match chars.get(j) {
                        None => return Err(ExprError::UnmatchedBracket(src.to_string())),
                        Some('[') => depth += 1,
                        Some(']') => {
                            depth -= 1;
                            if depth == 0 {
                                break;
                            }
                        }
                        Some(_) => {}
                    }
                    j += 1;
                }
                out.extend(&chars[i..=j]);
                i = j + 1;
            }
            '/' if chars.get(i + 1).copied().is_some_and(is_path_start) => {
                out.push('/');
                i += 1;
            }
            _ => break,
        }
    }
    Ok((out, i))
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    src: &'a str,
}

impl<'a> Parser<'a> {
    fn syntax(&self, message: impl Into<String>) -> ExprError {
        ExprError::Syntax {
            formula: self.src.to_string(),
            message: message.into(),
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn parse(mut self) -> std::result::Result<Expr, ExprError> {
        if self.tokens.is_empty() {
            return Err(self.syntax("empty formula"));
        }
        let expr = self.ternary()?;
        match self.peek() {
            None => Ok(expr),
            Some(Token::RParen) => Err(ExprError::UnmatchedBracket(self.src.to_string())),
            Some(Token::Colon) => Err(ExprError::TernaryMismatch(self.src.to_string())),
            Some(t) => Err(self.syntax(format!("unexpected token {t:?}"))),
        }
    }

    fn ternary(&mut self) -> std::result::Result<Expr, ExprError> {
        let cond = self.or()?;
        if !self.eat(&Token::Question) {
            return Ok(cond);
        }
        let then = self.ternary()?;
        if !self.eat(&Token::Colon) {
            return Err(ExprError::TernaryMismatch(self.src.to_string()));
        }
        let otherwise = self.ternary()?;
        Ok(Expr::Ternary(Box::new(cond), Box::new(then), Box::new(otherwise)))
    }

    fn or(&mut self) -> std::result::Result<Expr, ExprError> {
        let mut lhs = self.and()?;
        while self.eat(&Token::Or) {
            let rhs = self.and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and(&mut self) -> std::result::Result<Expr, ExprError> {
        let mut lhs = self.not()?;
        while self.eat(&Token::And) {
            let rhs = self.not()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn not(&mut self) -> std::result::Result<Expr, ExprError> {
        if self.eat(&Token::Not) {
            let inner = self.not()?;
            return Ok(Expr::Unary(UnaryOp::Not, Box::new(inner)));
        }
        self.binary(0)
    }

    /// Left-associative binary levels, loosest first.
    fn binary(&mut self, level: usize) -> std::result::Result<Expr, ExprError> {
        const LEVELS: &[&[BinOp]] = &[
            &[BinOp::Eq, BinOp::Ne, BinOp::Lt, BinOp::Le, BinOp::Gt, BinOp::Ge],
            &[BinOp::BitOr],
            &[BinOp::BitXor],
            &[BinOp::BitAnd],
            &[BinOp::Shl, BinOp::Shr],
            &[BinOp::Add, BinOp::Sub],
            &[BinOp::Mul, BinOp::Div, BinOp::Mod],
        ];
        if level == LEVELS.len() {
            return self.unary();
        }
        let mut lhs = self.binary(level + 1)?;
        while let Some(Token::Op(op)) = self.peek() {
            let op = *op;
            if !LEVELS[level].contains(&op) {
                break;
            }
            self.pos += 1;
            let rhs = self.binary(level + 1)?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> std::result::Result<Expr, ExprError> {
        let op = match self.peek() {
            Some(Token::Op(BinOp::Sub)) => UnaryOp::Neg,
            Some(Token::Tilde) => UnaryOp::BitNot,
            Some(Token::Not) => UnaryOp::Not,
            _ => return self.primary(),
        };
        self.pos += 1;
        let inner = self.unary()?;
        Ok(Expr::Unary(op, Box::new(inner)))
    }

    fn primary(&mut self) -> std::result::Result<Expr, ExprError> {
        match self.next() {
            Some(Token::Int(v)) => Ok(Expr::Literal(Value::Int(v))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::Str(s))),
            Some(Token::Bool(b)) => Ok(Expr::Literal(Value::Bool(b))),
            Some(Token::Path(p)) => Ok(Expr::Path(p)),
            Some(Token::LParen) => {
                let inner = self.ternary()?;
                if !self.eat(&Token::RParen) {
                    return Err(ExprError::UnmatchedBracket(self.src.to_string()));
                }
                Ok(inner)
            }
            Some(Token::RParen) => Err(ExprError::UnmatchedBracket(self.src.to_string())),
            Some(Token::Colon) | Some(Token::Question) => {
                Err(ExprError::TernaryMismatch(self.src.to_string()))
            }
            Some(t) => Err(self.syntax(format!("unexpected token {t:?}"))),
            None => Err(self.syntax("unexpected end of formula")),
        }
    }
}

pub fn parse_expr(src: &str) -> std::result::Result<Expr, ExprError> {
    let tokens = tokenize(src)?;
    Parser { tokens, pos: 0, src }.parse()
}

/// A parsed formula together with its source text.
#[derive(Debug, Clone, PartialEq)]
pub struct Formula {
    source: String,
    expr: Expr,
}

impl Formula {
    pub fn parse(source: &str) -> std::result::Result<Self, ExprError> {
        Ok(Self {
            source: source.to_string(),
            expr: parse_expr(source)?,
        })
    }

    pub fn literal(value: Value) -> Self {
        Self {
            source: value.to_string(),
            expr: Expr::Literal(value),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn as_literal(&self) -> Option<&Value> {
        match &self.expr {
            Expr::Literal(v) => Some(v),
            _ => None,
        }
    }

    /// The referenced path when the formula is nothing but a path.
    pub fn as_path(&self) -> Option<&str> {
        match &self.expr {
            Expr::Path(p) => Some(p),
            _ => None,
        }
    }

    pub fn evaluate(&self, env: &dyn Environment) -> Result<Resolution<Value>> {
        match eval(&self.expr, env) {
            Ok(v) => Ok(Resolution::Resolved(v)),
            Err(Halt::Deferred(why)) => Ok(Resolution::Deferred(why)),
            Err(Halt::Failed(e)) => Err(e),
        }
    }
}

/// One `/`-separated step of a path after placeholder substitution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub name: String,
    pub index: Option<usize>,
}

/// A fully evaluated path, ready for the tree to resolve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lookup {
    pub absolute: bool,
    pub steps: Vec<Step>,
    pub property: Option<String>,
}

/// What formulas can see of the world.
pub trait Environment {
    /// Name of the node the formula belongs to, for error traces.
    fn origin_name(&self) -> String;

    /// `{index}` and `{parent_index}` substitution.
    fn placeholder(&self, key: &str) -> Result<Option<usize>>;

    fn lookup(&self, lookup: &Lookup) -> Result<Resolution<Value>>;
}

enum Halt {
    Deferred(String),
    Failed(BuildError),
}

impl From<BuildError> for Halt {
    fn from(e: BuildError) -> Self {
        Self::Failed(e)
    }
}

type Eval<T> = std::result::Result<T, Halt>;

fn fail(env: &dyn Environment, message: impl Into<String>) -> Halt {
    Halt::Failed(BuildError::component(&env.origin_name(), message))
}

fn lift<T>(r: Result<Resolution<T>>) -> Eval<T> {
    match r? {
        Resolution::Resolved(v) => Ok(v),
        Resolution::Deferred(why) => Err(Halt::Deferred(why)),
    }
}

fn eval(expr: &Expr, env: &dyn Environment) -> Eval<Value> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Path(p) => eval_path(p, env),
        Expr::Unary(op, inner) => {
            let v = eval(inner, env)?;
            match op {
                UnaryOp::Not => Ok(Value::Bool(!v.truthy())),
                UnaryOp::Neg => int_of(&v, env)?
                    .checked_neg()
                    .map(Value::Int)
                    .ok_or_else(|| fail(env, "integer overflow")),
                UnaryOp::BitNot => Ok(Value::Int(!int_of(&v, env)?)),
            }
        }
        Expr::And(a, b) => {
            if !eval(a, env)?.truthy() {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(eval(b, env)?.truthy()))
        }
        Expr::Or(a, b) => {
            if eval(a, env)?.truthy() {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(eval(b, env)?.truthy()))
        }
        Expr::Ternary(cond, then, otherwise) => {
            if eval(cond, env)?.truthy() {
                eval(then, env)
            } else {
                eval(otherwise, env)
            }
        }
        Expr::Binary(op, a, b) => {
            let lhs = eval(a, env)?;
            let rhs = eval(b, env)?;
            binary(*op, &lhs, &rhs, env)
        }
    }
}

fn int_of(v: &Value, env: &dyn Environment) -> Eval<i128> {
    v.as_int()
        .map_err(|e| fail(env, format!("expected integer, got {}: {e}", v.type_name())))
}

fn floor_div(a: i128, b: i128) -> Option<i128> {
    let q = a.checked_div(b)?;
    if a % b != 0 && ((a < 0) != (b < 0)) {
        Some(q - 1)
    } else {
        Some(q)
    }
}

fn binary(op: BinOp, lhs: &Value, rhs: &Value, env: &dyn Environment) -> Eval<Value> {
    use std::cmp::Ordering;

    match op {
        BinOp::Eq => return Ok(Value::Bool(lhs.loosely_equals(rhs))),
        BinOp::Ne => return Ok(Value::Bool(!lhs.loosely_equals(rhs))),
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            let ord = lhs.compare(rhs).map_err(|e| fail(env, e.to_string()))?;
            let result = match op {
                BinOp::Lt => ord == Ordering::Less,
                BinOp::Le => ord != Ordering::Greater,
                BinOp::Gt => ord == Ordering::Greater,
                _ => ord != Ordering::Less,
            };
            return Ok(Value::Bool(result));
        }
        BinOp::Add => match (lhs, rhs) {
            (Value::Str(a), Value::Str(b)) => return Ok(Value::Str(format!("{a}{b}"))),
            (Value::Bytes(a), Value::Bytes(b)) => return Ok(Value::Bytes([a.as_slice(), b].concat())),
            _ => {}
        },
        _ => {}
    }

    let a = int_of(lhs, env)?;
    let b = int_of(rhs, env)?;
    let overflow = || fail(env, "integer overflow");
    let result = match op {
        BinOp::Add => a.checked_add(b).ok_or_else(overflow)?,
        BinOp::Sub => a.checked_sub(b).ok_or_else(overflow)?,
        BinOp::Mul => a.checked_mul(b).ok_or_else(overflow)?,
        BinOp::Div => {
            if b == 0 {
                return Err(fail(env, "division by zero"));
            }
            floor_div(a, b).ok_or_else(overflow)?
        }
        BinOp::Mod => {
            if b == 0 {
                return Err(fail(env, "modulo by zero"));
            }
            let q = floor_div(a, b).ok_or_else(overflow)?;
            a - b * q
        }
        BinOp::Shl | BinOp::Shr => {
            let shift = u32::try_from(b)
                .ok()
                .filter(|s| *s < 128)
                .ok_or_else(|| fail(env, format!("invalid shift amount {b}")))?;
            if op == BinOp::Shl {
                a.checked_shl(shift).ok_or_else(overflow)?
            } else {
                a >> shift
            }
        }
        BinOp::BitAnd => a & b,
        BinOp::BitOr => a | b,
        BinOp::BitXor => a ^ b,
        _ => unreachable!("comparison operators return early"),
    };
    Ok(Value::Int(result))
}

/// Replace `{index}` / `{parent_index}` with the enclosing entry indices.
fn substitute(raw: &str, env: &dyn Environment) -> Eval<String> {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let close = rest[open..]
            .find('}')
            .ok_or_else(|| fail(env, format!("unmatched '{{' in {raw:?}")))?;
        let key = &rest[open + 1..open + close];
        let index = env
            .placeholder(key)?
            .ok_or_else(|| fail(env, format!("no enclosing repetition for {{{key}}}")))?;
        out.push_str(&index.to_string());
        rest = &rest[open + close + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Split on `/` outside brackets.
fn split_steps(path: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    for (i, c) in path.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => depth -= 1,
            '/' if depth == 0 => {
                parts.push(&path[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&path[start..]);
    parts
}

/// Split bracket content on the first top-level `:` that is not part of a ternary.
fn split_range(inner: &str) -> Option<(&str, &str)> {
    let mut depth = 0i32;
    let mut pending_ternaries = 0i32;
    for (i, c) in inner.char_indices() {
        match c {
            '(' | '[' => depth += 1,
            ')' | ']' => depth -= 1,
            '?' if depth == 0 => pending_ternaries += 1,
            ':' if depth == 0 => {
                if pending_ternaries == 0 {
                    return Some((&inner[..i], &inner[i + 1..]));
                }
                pending_ternaries -= 1;
            }
            _ => {}
        }
    }
    None
}

fn malformed(env: &dyn Environment, path: &str, message: &str) -> Halt {
    Halt::Failed(BuildError::component(
        &env.origin_name(),
        ExprError::MalformedPath {
            path: path.to_string(),
            message: message.to_string(),
        }
        .to_string(),
    ))
}

fn eval_sub(text: &str, env: &dyn Environment) -> Eval<Value> {
    let expr = parse_expr(text).map_err(|e| fail(env, e.to_string()))?;
    eval(&expr, env)
}

fn eval_index(text: &str, env: &dyn Environment, path: &str) -> Eval<usize> {
    let v = eval_sub(text, env)?;
    let i = int_of(&v, env)?;
    usize::try_from(i).map_err(|_| malformed(env, path, "negative index"))
}

fn eval_path(raw: &str, env: &dyn Environment) -> Eval<Value> {
    let path = substitute(raw, env)?;
    if let Ok(v) = convert::parse_int(&path) {
        return Ok(Value::Int(v));
    }

    let absolute = path.starts_with('/');
    let body = if absolute { &path[1..] } else { path.as_str() };
    let parts = split_steps(body);
    let mut steps = Vec::with_capacity(parts.len());
    let mut property = None;
    let mut range = None;

    for (n, part) in parts.iter().enumerate() {
        let last = n + 1 == parts.len();
        let name_end = part.find(|c| c == '[' || c == '.').unwrap_or(part.len());
        let name = &part[..name_end];
        if name.is_empty() {
            return Err(malformed(env, &path, "empty segment"));
        }
        let mut rest = &part[name_end..];
        let mut index = None;

        if rest.starts_with('[') {
            let close = matching_bracket(rest).ok_or_else(|| malformed(env, &path, "unmatched '['"))?;
            let inner = &rest[1..close];
            match split_range(inner) {
                Some((lo, hi)) if last && rest[close + 1..].is_empty() => {
                    range = Some((lo.to_string(), hi.to_string()));
                }
                Some(_) => return Err(malformed(env, &path, "range only allowed at the end")),
                None => index = Some(eval_index(inner, env, &path)?),
            }
            rest = &rest[close + 1..];
        }

        if let Some(prop_part) = rest.strip_prefix('.') {
            if !last {
                return Err(malformed(env, &path, "property must be the last element"));
            }
            let prop_end = prop_part.find('[').unwrap_or(prop_part.len());
            let prop = &prop_part[..prop_end];
            if prop.is_empty() || !prop.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Err(malformed(env, &path, "invalid property name"));
            }
            property = Some(prop.to_string());
            let tail = &prop_part[prop_end..];
            if !tail.is_empty() {
                let close = matching_bracket(tail).ok_or_else(|| malformed(env, &path, "unmatched '['"))?;
                if close + 1 != tail.len() {
                    return Err(malformed(env, &path, "trailing characters after range"));
                }
                let (lo, hi) = split_range(&tail[1..close])
                    .ok_or_else(|| malformed(env, &path, "expected [start:end]"))?;
                range = Some((lo.to_string(), hi.to_string()));
            }
        } else if !rest.is_empty() {
            return Err(malformed(env, &path, "unexpected characters"));
        }

        steps.push(Step {
            name: name.to_string(),
            index,
        });
    }

    if range.is_some() {
        match property.as_deref() {
            None => property = Some("data".to_string()),
            Some("data") | Some("value") => {}
            Some(_) => return Err(malformed(env, &path, "ranges apply to .data or .value only")),
        }
    }

    // Bounds are evaluated before the lookup itself.
    let bounds = match &range {
        Some((lo, hi)) => Some((eval_index(lo, env, &path)?, eval_index(hi, env, &path)?)),
        None => None,
    };

    let lookup = Lookup {
        absolute,
        steps,
        property,
    };
    let value = lift(env.lookup(&lookup))?;

    match bounds {
        None => Ok(value),
        Some((start, end)) => {
            let bytes = value.as_bytes().map_err(|e| fail(env, e.to_string()))?;
            let (lo, hi, reverse) = if start > end {
                (end, start, true)
            } else {
                (start, end, false)
            };
            if hi > bytes.len() {
                return Err(fail(
                    env,
                    format!("range [{start}:{end}] outside {} byte(s)", bytes.len()),
                ));
            }
            let mut slice = bytes[lo..hi].to_vec();
            if reverse {
                slice.reverse();
            }
            Ok(Value::Bytes(slice))
        }
    }
}

fn matching_bracket(text: &str) -> Option<usize> {
    let mut depth = 0i32;
    for (i, c) in text.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct MapEnv {
        values: HashMap<String, Value>,
        index: Option<usize>,
    }

    impl MapEnv {
        fn new() -> Self {
            Self {
                values: HashMap::new(),
                index: None,
            }
        }

        fn with(mut self, key: &str, v: Value) -> Self {
            self.values.insert(key.to_string(), v);
            self
        }
    }

    impl Environment for MapEnv {
        fn origin_name(&self) -> String {
            "test".to_string()
        }

        fn placeholder(&self, key: &str) -> Result<Option<usize>> {
            Ok(match key {
                "index" => self.index,
                _ => None,
            })
        }

        fn lookup(&self, lookup: &Lookup) -> Result<Resolution<Value>> {
            let mut key: Vec<String> = lookup
                .steps
                .iter()
                .map(|s| match s.index {
                    Some(i) => format!("{}[{}]", s.name, i),
                    None => s.name.clone(),
                })
                .collect();
            if let Some(p) = &lookup.property {
                key.push(format!(".{p}"));
            }
            let key = key.join("/").replace("/.", ".");
            Ok(match self.values.get(&key) {
                Some(v) => Resolution::Resolved(v.clone()),
                None => Resolution::Deferred(format!("{key} unknown")),
            })
        }
    }

    fn eval_str(src: &str, env: &MapEnv) -> Resolution<Value> {
        Formula::parse(src).unwrap().evaluate(env).unwrap()
    }

    fn int(src: &str) -> i128 {
        match eval_str(src, &MapEnv::new()) {
            Resolution::Resolved(v) => v.as_int().unwrap(),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_arithmetic_precedence() {
        assert_eq!(int("2 + 3 * 4"), 14);
        assert_eq!(int("(2 + 3) * 4"), 20);
        assert_eq!(int("10 - 4 - 3"), 3);
        assert_eq!(int("100 / 10 / 5"), 2);
        assert_eq!(int("1 << 4 | 1"), 17);
    }

    #[test]
    fn test_ternary() {
        assert_eq!(int("1 == 1 ? 0xA : 0xB"), 10);
        assert_eq!(int("1 == 2 ? 0xA : 0xB"), 11);
        assert_eq!(int("0 ? 1 : 1 ? 2 : 3"), 2);
    }

    #[test]
    fn test_ternary_is_lazy() {
        let env = MapEnv::new();
        // The untaken branch references an unknown node and would defer.
        assert_eq!(eval_str("true ? 1 : missing.value", &env), Resolution::Resolved(Value::Int(1)));
        assert!(!eval_str("false ? 1 : missing.value", &env).is_resolved());
    }

    #[test]
    fn test_floor_division_and_modulo() {
        assert_eq!(int("-7 / 2"), -4);
        assert_eq!(int("-7 % 2"), 1);
        assert_eq!(int("7 % -2"), -1);
    }

    #[test]
    fn test_logical_precedence() {
        let env = MapEnv::new();
        assert_eq!(eval_str("true or false and false", &env), Resolution::Resolved(Value::Bool(true)));
        assert_eq!(eval_str("not 1 == 2", &env), Resolution::Resolved(Value::Bool(true)));
        assert_eq!(eval_str("TRUE && !False", &env), Resolution::Resolved(Value::Bool(true)));
    }

    #[test]
    fn test_string_literals() {
        let env = MapEnv::new();
        assert_eq!(
            eval_str(r#""a\"b" + 'c'"#, &env),
            Resolution::Resolved(Value::Str("a\"bc".into()))
        );
    }

    #[test]
    fn test_paths_and_properties() {
        let env = MapEnv::new()
            .with("header/len.size", Value::Int(4))
            .with("a", Value::Int(6));
        assert_eq!(eval_str("header/len.size * 2", &env), Resolution::Resolved(Value::Int(8)));
        assert_eq!(eval_str("a / 2", &env), Resolution::Resolved(Value::Int(3)));
        assert_eq!(eval_str("a/2", &env), Resolution::Resolved(Value::Int(3)));
    }

    #[test]
    fn test_placeholder_index() {
        let mut env = MapEnv::new().with("rows[2].value", Value::Int(9));
        env.index = Some(2);
        assert_eq!(eval_str("rows[{index}].value", &env), Resolution::Resolved(Value::Int(9)));
        assert_eq!(eval_str("{index} * 4", &env), Resolution::Resolved(Value::Int(8)));
    }

    #[test]
    fn test_range_indexing() {
        let env = MapEnv::new()
            .with("blob.data", Value::Bytes(vec![1, 2, 3, 4, 5]))
            .with("n", Value::Int(1));
        assert_eq!(
            eval_str("blob.data[n:n + 2]", &env),
            Resolution::Resolved(Value::Bytes(vec![2, 3]))
        );
        assert_eq!(
            eval_str("blob.data[4:0]", &env),
            Resolution::Resolved(Value::Bytes(vec![4, 3, 2, 1]))
        );
        assert!(Formula::parse("blob.data[0:9]").unwrap().evaluate(&env).is_err());
    }

    #[test]
    fn test_coercions() {
        let env = MapEnv::new()
            .with("magic", Value::Bytes(vec![0x12, 0x34]))
            .with("tag", Value::Bytes(b"FW".to_vec()));
        assert_eq!(eval_str("magic == 0x1234", &env), Resolution::Resolved(Value::Bool(true)));
        assert_eq!(eval_str("tag == \"FW\"", &env), Resolution::Resolved(Value::Bool(true)));
        assert_eq!(eval_str("magic + 1", &env), Resolution::Resolved(Value::Int(0x1235)));
    }

    #[test]
    fn test_deferred_is_not_an_error() {
        let env = MapEnv::new();
        assert!(matches!(eval_str("later.size + 1", &env), Resolution::Deferred(_)));
    }

    #[test]
    fn test_syntax_errors() {
        assert!(matches!(Formula::parse("(1 + 2"), Err(ExprError::UnmatchedBracket(_))));
        assert!(matches!(Formula::parse("1 + 2)"), Err(ExprError::UnmatchedBracket(_))));
        assert!(matches!(Formula::parse("a[1"), Err(ExprError::UnmatchedBracket(_))));
        assert!(matches!(Formula::parse("1 ? 2"), Err(ExprError::TernaryMismatch(_))));
        assert!(matches!(Formula::parse("1 : 2"), Err(ExprError::TernaryMismatch(_))));
        assert!(Formula::parse("").is_err());
    }

    #[test]
    fn test_runtime_errors_carry_node_name() {
        let err = Formula::parse("1 / 0").unwrap().evaluate(&MapEnv::new()).unwrap_err();
        assert!(err.to_string().contains("test"));
    }

    #[test]
    fn test_as_path() {
        assert_eq!(Formula::parse("/settings/version").unwrap().as_path(), Some("/settings/version"));
        assert_eq!(Formula::parse("3").unwrap().as_literal(), Some(&Value::Int(3)));
    }
}
