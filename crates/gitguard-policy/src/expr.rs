//! The rule condition language.
//!
//! Conditions are small boolean expressions over a JSON input document:
//! dotted path references, literals, comparisons, `&&`/`||`/`!`, parentheses,
//! and a handful of functions (`contains`, `matches`, `starts_with`,
//! `count`). A path that does not exist resolves to null, and any comparison
//! against null is false, so rules degrade to "not fired" rather than
//! erroring when a field is absent.
//!
//! Evaluation resolves every path through a recording resolver; the recorded
//! set becomes the receipt's `inputs_used`. Short-circuited operands are
//! neither read nor recorded, which keeps the set sound.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::fmt;

use serde_json::Value;

/// A parsed condition expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    /// Dotted path into the input document, e.g. `pr.lines_changed`.
    Path(Vec<String>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(CompareOp, Box<Expr>, Box<Expr>),
    Call(Func, Vec<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        };
        f.write_str(s)
    }
}

/// Built-in functions callable from conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Func {
    /// `contains(list_or_string, value)`
    Contains,
    /// `matches(value, regex)`
    Matches,
    /// `starts_with(value, prefix)`
    StartsWith,
    /// `count(list_or_string)`
    Count,
}

impl Func {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "contains" => Some(Func::Contains),
            "matches" => Some(Func::Matches),
            "starts_with" => Some(Func::StartsWith),
            "count" => Some(Func::Count),
            _ => None,
        }
    }

    fn arity(&self) -> usize {
        match self {
            Func::Contains | Func::Matches | Func::StartsWith => 2,
            Func::Count => 1,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Func::Contains => "contains",
            Func::Matches => "matches",
            Func::StartsWith => "starts_with",
            Func::Count => "count",
        }
    }
}

/// Parse or evaluation failure for one rule condition.
#[derive(Debug, Clone, PartialEq)]
pub struct ExprError(pub String);

impl fmt::Display for ExprError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for ExprError {}

fn err<T>(msg: impl Into<String>) -> Result<T, ExprError> {
    Err(ExprError(msg.into()))
}

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Str(String),
    Num(f64),
    True,
    False,
    Null,
    LParen,
    RParen,
    Comma,
    Dot,
    Not,
    And,
    Or,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

fn lex(src: &str) -> Result<Vec<Tok>, ExprError> {
    let mut toks = Vec::new();
    let bytes: Vec<char> = src.chars().collect();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                toks.push(Tok::LParen);
                i += 1;
            }
            ')' => {
                toks.push(Tok::RParen);
                i += 1;
            }
            ',' => {
                toks.push(Tok::Comma);
                i += 1;
            }
            '.' => {
                toks.push(Tok::Dot);
                i += 1;
            }
            '&' => {
                if bytes.get(i + 1) == Some(&'&') {
                    toks.push(Tok::And);
                    i += 2;
                } else {
                    return err("single '&' (use '&&')");
                }
            }
            '|' => {
                if bytes.get(i + 1) == Some(&'|') {
                    toks.push(Tok::Or);
                    i += 2;
                } else {
                    return err("single '|' (use '||')");
                }
            }
            '=' => {
                if bytes.get(i + 1) == Some(&'=') {
                    toks.push(Tok::Eq);
                    i += 2;
                } else {
                    return err("single '=' (use '==')");
                }
            }
            '!' => {
                if bytes.get(i + 1) == Some(&'=') {
                    toks.push(Tok::Ne);
                    i += 2;
                } else {
                    toks.push(Tok::Not);
                    i += 1;
                }
            }
            '<' => {
                if bytes.get(i + 1) == Some(&'=') {
                    toks.push(Tok::Le);
                    i += 2;
                } else {
                    toks.push(Tok::Lt);
                    i += 1;
                }
            }
            '>' => {
                if bytes.get(i + 1) == Some(&'=') {
                    toks.push(Tok::Ge);
                    i += 2;
                } else {
                    toks.push(Tok::Gt);
                    i += 1;
                }
            }
            '"' | '\'' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                loop {
                    match bytes.get(i) {
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some('\\') => {
                            match bytes.get(i + 1) {
                                Some(&esc) if esc == quote || esc == '\\' => s.push(esc),
                                Some('n') => s.push('\n'),
                                Some('t') => s.push('\t'),
                                // Unknown escapes pass through untouched so
                                // regex literals like "\." keep their meaning.
                                Some(&other) => {
                                    s.push('\\');
                                    s.push(other);
                                }
                                None => return err("unterminated string literal"),
                            }
                            i += 2;
                        }
                        Some(&ch) => {
                            s.push(ch);
                            i += 1;
                        }
                        None => return err("unterminated string literal"),
                    }
                }
                toks.push(Tok::Str(s));
            }
            '0'..='9' => {
                let start = i;
                while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == '.') {
                    // A digit followed by `.` could also start a path, but
                    // numbers never begin an identifier, so the dot is part
                    // of the literal here.
                    i += 1;
                }
                let text: String = bytes[start..i].iter().collect();
                match text.parse::<f64>() {
                    Ok(n) => toks.push(Tok::Num(n)),
                    Err(_) => return err(format!("bad number literal: {}", text)),
                }
            }
            '-' => {
                // Negative number literal.
                let start = i;
                i += 1;
                if i >= bytes.len() || !bytes[i].is_ascii_digit() {
                    return err("'-' must start a number literal");
                }
                while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == '.') {
                    i += 1;
                }
                let text: String = bytes[start..i].iter().collect();
                match text.parse::<f64>() {
                    Ok(n) => toks.push(Tok::Num(n)),
                    Err(_) => return err(format!("bad number literal: {}", text)),
                }
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == '_') {
                    i += 1;
                }
                let word: String = bytes[start..i].iter().collect();
                toks.push(match word.as_str() {
                    "true" => Tok::True,
                    "false" => Tok::False,
                    "null" => Tok::Null,
                    _ => Tok::Ident(word),
                });
            }
            other => return err(format!("unexpected character: {:?}", other)),
        }
    }
    Ok(toks)
}

// ---------------------------------------------------------------------------
// Parser (recursive descent: or > and > compare > unary > primary)
// ---------------------------------------------------------------------------

struct Parser {
    toks: Vec<Tok>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Tok> {
        self.toks.get(self.pos)
    }

    fn bump(&mut self) -> Option<Tok> {
        let tok = self.toks.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn expect(&mut self, tok: &Tok, what: &str) -> Result<(), ExprError> {
        match self.bump() {
            Some(t) if &t == tok => Ok(()),
            other => err(format!("expected {}, found {:?}", what, other)),
        }
    }

    fn parse_or(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Tok::Or) {
            self.bump();
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_compare()?;
        while self.peek() == Some(&Tok::And) {
            self.bump();
            let right = self.parse_compare()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_compare(&mut self) -> Result<Expr, ExprError> {
        let left = self.parse_unary()?;
        let op = match self.peek() {
            Some(Tok::Eq) => CompareOp::Eq,
            Some(Tok::Ne) => CompareOp::Ne,
            Some(Tok::Lt) => CompareOp::Lt,
            Some(Tok::Le) => CompareOp::Le,
            Some(Tok::Gt) => CompareOp::Gt,
            Some(Tok::Ge) => CompareOp::Ge,
            _ => return Ok(left),
        };
        self.bump();
        let right = self.parse_unary()?;
        Ok(Expr::Compare(op, Box::new(left), Box::new(right)))
    }

    fn parse_unary(&mut self) -> Result<Expr, ExprError> {
        if self.peek() == Some(&Tok::Not) {
            self.bump();
            let inner = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, ExprError> {
        match self.bump() {
            Some(Tok::LParen) => {
                let inner = self.parse_or()?;
                self.expect(&Tok::RParen, "')'")?;
                Ok(inner)
            }
            Some(Tok::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Tok::Num(n)) => {
                let num = serde_json::Number::from_f64(n)
                    .ok_or_else(|| ExprError("non-finite number literal".into()))?;
                Ok(Expr::Literal(Value::Number(num)))
            }
            Some(Tok::True) => Ok(Expr::Literal(Value::Bool(true))),
            Some(Tok::False) => Ok(Expr::Literal(Value::Bool(false))),
            Some(Tok::Null) => Ok(Expr::Literal(Value::Null)),
            Some(Tok::Ident(first)) => {
                // Function call or dotted path.
                if self.peek() == Some(&Tok::LParen) {
                    let func = Func::from_name(&first)
                        .ok_or_else(|| ExprError(format!("unknown function: {}", first)))?;
                    self.bump();
                    let mut args = Vec::new();
                    if self.peek() != Some(&Tok::RParen) {
                        loop {
                            args.push(self.parse_or()?);
                            if self.peek() == Some(&Tok::Comma) {
                                self.bump();
                            } else {
                                break;
                            }
                        }
                    }
                    self.expect(&Tok::RParen, "')'")?;
                    if args.len() != func.arity() {
                        return err(format!(
                            "{} takes {} argument(s), got {}",
                            func.name(),
                            func.arity(),
                            args.len()
                        ));
                    }
                    return Ok(Expr::Call(func, args));
                }
                let mut segments = vec![first];
                while self.peek() == Some(&Tok::Dot) {
                    self.bump();
                    match self.bump() {
                        Some(Tok::Ident(seg)) => segments.push(seg),
                        other => return err(format!("expected path segment, found {:?}", other)),
                    }
                }
                Ok(Expr::Path(segments))
            }
            other => err(format!("expected expression, found {:?}", other)),
        }
    }
}

/// Parse a condition expression.
pub fn parse(src: &str) -> Result<Expr, ExprError> {
    let toks = lex(src)?;
    if toks.is_empty() {
        return err("empty condition");
    }
    let mut parser = Parser { toks, pos: 0 };
    let expr = parser.parse_or()?;
    if parser.pos != parser.toks.len() {
        return err(format!(
            "trailing tokens after expression: {:?}",
            &parser.toks[parser.pos..]
        ));
    }
    Ok(expr)
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Evaluation context: the input document plus the recorded read set.
pub struct EvalCtx<'a> {
    input: &'a Value,
    used: RefCell<BTreeSet<String>>,
}

impl<'a> EvalCtx<'a> {
    pub fn new(input: &'a Value) -> Self {
        Self {
            input,
            used: RefCell::new(BTreeSet::new()),
        }
    }

    /// Paths dereferenced so far, sorted.
    pub fn inputs_used(&self) -> Vec<String> {
        self.used.borrow().iter().cloned().collect()
    }

    fn resolve(&self, segments: &[String]) -> Value {
        self.used.borrow_mut().insert(segments.join("."));
        let mut current = self.input;
        for seg in segments {
            match current.get(seg) {
                Some(next) => current = next,
                None => return Value::Null,
            }
        }
        current.clone()
    }
}

/// Evaluate an expression to its boolean result.
///
/// The top level of a rule condition must produce a boolean; inner
/// subexpressions may produce any JSON value.
pub fn eval_bool(expr: &Expr, ctx: &EvalCtx<'_>) -> Result<bool, ExprError> {
    match eval(expr, ctx)? {
        Value::Bool(b) => Ok(b),
        Value::Null => Ok(false),
        other => err(format!("condition is not a boolean: {}", other)),
    }
}

fn eval(expr: &Expr, ctx: &EvalCtx<'_>) -> Result<Value, ExprError> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Path(segments) => Ok(ctx.resolve(segments)),
        Expr::Not(inner) => Ok(Value::Bool(!eval_bool(inner, ctx)?)),
        Expr::And(l, r) => {
            // Short-circuit: a false left side never reads the right side.
            if !eval_bool(l, ctx)? {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(eval_bool(r, ctx)?))
        }
        Expr::Or(l, r) => {
            if eval_bool(l, ctx)? {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(eval_bool(r, ctx)?))
        }
        Expr::Compare(op, l, r) => {
            let lv = eval(l, ctx)?;
            let rv = eval(r, ctx)?;
            Ok(Value::Bool(compare(*op, &lv, &rv)))
        }
        Expr::Call(func, args) => eval_call(*func, args, ctx),
    }
}

/// Compare two JSON values. Any comparison involving null is false.
fn compare(op: CompareOp, left: &Value, right: &Value) -> bool {
    if left.is_null() || right.is_null() {
        return false;
    }
    match op {
        CompareOp::Eq => left == right,
        CompareOp::Ne => left != right,
        CompareOp::Lt | CompareOp::Le | CompareOp::Gt | CompareOp::Ge => {
            let ordering = match (left, right) {
                (Value::Number(a), Value::Number(b)) => {
                    match (a.as_f64(), b.as_f64()) {
                        (Some(a), Some(b)) => a.partial_cmp(&b),
                        _ => None,
                    }
                }
                (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
                _ => None,
            };
            match (op, ordering) {
                (CompareOp::Lt, Some(std::cmp::Ordering::Less)) => true,
                (CompareOp::Le, Some(o)) => o != std::cmp::Ordering::Greater,
                (CompareOp::Gt, Some(std::cmp::Ordering::Greater)) => true,
                (CompareOp::Ge, Some(o)) => o != std::cmp::Ordering::Less,
                _ => false,
            }
        }
    }
}

fn eval_call(func: Func, args: &[Expr], ctx: &EvalCtx<'_>) -> Result<Value, ExprError> {
    match func {
        Func::Contains => {
            let container = eval(&args[0], ctx)?;
            let item = eval(&args[1], ctx)?;
            let found = match (&container, &item) {
                (Value::Array(list), needle) => list.iter().any(|v| v == needle),
                (Value::String(haystack), Value::String(needle)) => haystack.contains(needle),
                (Value::Null, _) => false,
                _ => {
                    return err("contains() wants a list or string as first argument");
                }
            };
            Ok(Value::Bool(found))
        }
        Func::Matches => {
            let value = eval(&args[0], ctx)?;
            let pattern = eval(&args[1], ctx)?;
            let (Value::String(value), Value::String(pattern)) = (&value, &pattern) else {
                if value.is_null() {
                    return Ok(Value::Bool(false));
                }
                return err("matches() wants string arguments");
            };
            let re = regex::Regex::new(pattern)
                .map_err(|e| ExprError(format!("bad regex in matches(): {}", e)))?;
            Ok(Value::Bool(re.is_match(value)))
        }
        Func::StartsWith => {
            let value = eval(&args[0], ctx)?;
            let prefix = eval(&args[1], ctx)?;
            let (Value::String(value), Value::String(prefix)) = (&value, &prefix) else {
                if value.is_null() {
                    return Ok(Value::Bool(false));
                }
                return err("starts_with() wants string arguments");
            };
            Ok(Value::Bool(value.starts_with(prefix)))
        }
        Func::Count => {
            let value = eval(&args[0], ctx)?;
            let n = match &value {
                Value::Array(list) => list.len(),
                Value::String(s) => s.chars().count(),
                Value::Null => 0,
                _ => return err("count() wants a list or string"),
            };
            Ok(Value::Number(serde_json::Number::from(n)))
        }
    }
}
