#![forbid(unsafe_code)]

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use sx_types::{Row, Value, format_value};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExprError {
    #[error("malformed numeric literal: {0}")]
    MalformedNumber(String),
    #[error("expression nesting exceeds the depth limit of {limit}")]
    TooDeep { limit: usize },
}

// ── Tokenizer ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    Concat,
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Token {
    Number(f64),
    Text(String),
    ColumnRef(String),
    Ident(String),
    Op(OpKind),
    LParen,
    RParen,
    Comma,
}

/// Scan an expression string into a flat token sequence.
///
/// The scanner is lenient: whitespace is skipped, unterminated quoted
/// literals consume to end of input, and unrecognized characters are
/// dropped one at a time. The single failure mode is a digits-and-dots
/// run that does not parse as a float (`1.2.3`); that surfaces as
/// [`ExprError::MalformedNumber`] so the outer boundary can fall back to
/// the verbatim expression.
pub fn tokenize(expr: &str) -> Result<Vec<Token>, ExprError> {
    let chars: Vec<char> = expr.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        // Text literal 'text' and column reference "name". No escape
        // processing; the first matching quote terminates.
        if c == '\'' || c == '"' {
            let start = i + 1;
            let mut j = start;
            while j < chars.len() && chars[j] != c {
                j += 1;
            }
            let contents: String = chars[start..j].iter().collect();
            tokens.push(if c == '\'' {
                Token::Text(contents)
            } else {
                Token::ColumnRef(contents)
            });
            i = j + 1;
            continue;
        }

        // Numeric literal: digits and dots, also `.5` style. The run is
        // maximal; multiple embedded dots are handed to the float parser
        // unchanged rather than rejected by the scanner.
        if c.is_ascii_digit()
            || (c == '.' && chars.get(i + 1).is_some_and(|ch| ch.is_ascii_digit()))
        {
            let start = i;
            let mut j = i;
            while j < chars.len() && (chars[j].is_ascii_digit() || chars[j] == '.') {
                j += 1;
            }
            let raw: String = chars[start..j].iter().collect();
            let value = raw
                .parse::<f64>()
                .map_err(|_| ExprError::MalformedNumber(raw.clone()))?;
            tokens.push(Token::Number(value));
            i = j;
            continue;
        }

        // Two-character operators before one-character operators.
        if i + 1 < chars.len() {
            let two = match (c, chars[i + 1]) {
                ('|', '|') => Some(OpKind::Concat),
                ('!', '=') => Some(OpKind::Ne),
                ('>', '=') => Some(OpKind::Ge),
                ('<', '=') => Some(OpKind::Le),
                _ => None,
            };
            if let Some(op) = two {
                tokens.push(Token::Op(op));
                i += 2;
                continue;
            }
        }

        let one = match c {
            '=' => Some(OpKind::Eq),
            '>' => Some(OpKind::Gt),
            '<' => Some(OpKind::Lt),
            '+' => Some(OpKind::Add),
            '-' => Some(OpKind::Sub),
            '*' => Some(OpKind::Mul),
            '/' => Some(OpKind::Div),
            _ => None,
        };
        if let Some(op) = one {
            tokens.push(Token::Op(op));
            i += 1;
            continue;
        }

        match c {
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
                continue;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
                continue;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
                continue;
            }
            _ => {}
        }

        // Identifier: function names. Case is preserved here; dispatch
        // lowercases at call time.
        if c.is_alphabetic() || c == '_' {
            let start = i;
            let mut j = i;
            while j < chars.len() && (chars[j].is_alphanumeric() || chars[j] == '_') {
                j += 1;
            }
            tokens.push(Token::Ident(chars[start..j].iter().collect()));
            i = j;
            continue;
        }

        // Anything else: skip one character.
        i += 1;
    }
    Ok(tokens)
}

// ── AST ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateKind {
    Count,
    Sum,
    Min,
    Max,
    Unique,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Expr {
    Literal {
        value: Value,
    },
    ColumnRef {
        name: String,
    },
    Concat {
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Compare {
        op: CompareOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Arith {
        op: ArithOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Negate {
        expr: Box<Expr>,
    },
    If {
        cond: Box<Expr>,
        when_true: Box<Expr>,
        when_false: Box<Expr>,
    },
    Round {
        value: Box<Expr>,
        digits: Option<Box<Expr>>,
    },
    Aggregate {
        func: AggregateKind,
        arg: Option<Box<Expr>>,
    },
    UnknownCall {
        name: String,
    },
}

// ── Parser ─────────────────────────────────────────────────────────────

const MAX_DEPTH: usize = 64;

/// Parse a token sequence into an [`Expr`] AST.
///
/// Grammar, lowest to highest binding:
///   concat   → compare ( "||" compare )*
///   compare  → additive ( ("="|"!="|">"|"<"|">="|"<=") additive )?
///   additive → multiplicative ( ("+"|"-") multiplicative )*
///   multiplicative → unary ( ("*"|"/") unary )*
///   unary    → "-" unary | primary
///   primary  → NUMBER | TEXT | COLUMNREF | IDENT "(" args ")" | "(" concat ")"
///
/// The parser is defensive rather than strict: a missing operand, a stray
/// structural token, or an unmatched parenthesis degrades the affected
/// sub-expression to an absent literal and consumption continues. Tokens
/// past the first complete `concat` production are ignored. The only
/// error is the nesting-depth guard.
pub fn parse(tokens: &[Token]) -> Result<Expr, ExprError> {
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    parser.parse_concat()
}

/// Tokenize and parse in one step.
pub fn parse_expression(expr: &str) -> Result<Expr, ExprError> {
    parse(&tokenize(expr)?)
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    depth: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn enter(&mut self) -> Result<(), ExprError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(ExprError::TooDeep { limit: MAX_DEPTH });
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    fn eat_comma(&mut self) {
        if matches!(self.peek(), Some(Token::Comma)) {
            self.pos += 1;
        }
    }

    fn eat_rparen(&mut self) {
        if matches!(self.peek(), Some(Token::RParen)) {
            self.pos += 1;
        }
    }

    fn parse_concat(&mut self) -> Result<Expr, ExprError> {
        self.enter()?;
        let out = self.parse_concat_chain();
        self.leave();
        out
    }

    fn parse_concat_chain(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_compare()?;
        while matches!(self.peek(), Some(Token::Op(OpKind::Concat))) {
            self.pos += 1;
            let right = self.parse_compare()?;
            left = Expr::Concat {
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    // At most one comparison per level; a second comparison operator at
    // the same level is left unconsumed.
    fn parse_compare(&mut self) -> Result<Expr, ExprError> {
        let left = self.parse_additive()?;
        if let Some(Token::Op(op)) = self.peek() {
            let op = match op {
                OpKind::Eq => Some(CompareOp::Eq),
                OpKind::Ne => Some(CompareOp::Ne),
                OpKind::Gt => Some(CompareOp::Gt),
                OpKind::Lt => Some(CompareOp::Lt),
                OpKind::Ge => Some(CompareOp::Ge),
                OpKind::Le => Some(CompareOp::Le),
                _ => None,
            };
            if let Some(op) = op {
                self.pos += 1;
                let right = self.parse_additive()?;
                return Ok(Expr::Compare {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                });
            }
        }
        Ok(left)
    }

    fn parse_additive(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Op(OpKind::Add)) => ArithOp::Add,
                Some(Token::Op(OpKind::Sub)) => ArithOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_multiplicative()?;
            left = Expr::Arith {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Op(OpKind::Mul)) => ArithOp::Mul,
                Some(Token::Op(OpKind::Div)) => ArithOp::Div,
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Expr::Arith {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ExprError> {
        if matches!(self.peek(), Some(Token::Op(OpKind::Sub))) {
            self.enter()?;
            self.pos += 1;
            let inner = self.parse_unary();
            self.leave();
            return Ok(Expr::Negate {
                expr: Box::new(inner?),
            });
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, ExprError> {
        let Some(token) = self.peek().cloned() else {
            return Ok(Expr::Literal {
                value: Value::Absent,
            });
        };
        match token {
            Token::Number(v) => {
                self.pos += 1;
                Ok(Expr::Literal {
                    value: Value::Number(v),
                })
            }
            Token::Text(v) => {
                self.pos += 1;
                Ok(Expr::Literal {
                    value: Value::Text(v),
                })
            }
            Token::ColumnRef(name) => {
                self.pos += 1;
                Ok(Expr::ColumnRef { name })
            }
            Token::Ident(name) => {
                self.pos += 1;
                if matches!(self.peek(), Some(Token::LParen)) {
                    self.pos += 1;
                    self.parse_call(&name)
                } else {
                    // A bare identifier has no meaning.
                    Ok(Expr::Literal {
                        value: Value::Absent,
                    })
                }
            }
            Token::LParen => {
                self.pos += 1;
                let inner = self.parse_concat()?;
                self.eat_rparen();
                Ok(inner)
            }
            Token::RParen | Token::Comma | Token::Op(_) => {
                // Stray structural token in operand position: consume it
                // and degrade to absent.
                self.pos += 1;
                Ok(Expr::Literal {
                    value: Value::Absent,
                })
            }
        }
    }

    // ── Function calls ──

    fn parse_call(&mut self, name: &str) -> Result<Expr, ExprError> {
        match name.to_lowercase().as_str() {
            "if" => self.parse_if(),
            "round" => self.parse_round(),
            "count" => self.parse_aggregate(AggregateKind::Count),
            "sum" => self.parse_aggregate(AggregateKind::Sum),
            "min" => self.parse_aggregate(AggregateKind::Min),
            "max" => self.parse_aggregate(AggregateKind::Max),
            "unique" => self.parse_aggregate(AggregateKind::Unique),
            _ => {
                self.skip_to_rparen();
                Ok(Expr::UnknownCall {
                    name: name.to_owned(),
                })
            }
        }
    }

    fn parse_if(&mut self) -> Result<Expr, ExprError> {
        let cond = self.parse_concat()?;
        self.eat_comma();
        let when_true = self.parse_concat()?;
        self.eat_comma();
        let when_false = self.parse_concat()?;
        self.eat_rparen();
        Ok(Expr::If {
            cond: Box::new(cond),
            when_true: Box::new(when_true),
            when_false: Box::new(when_false),
        })
    }

    fn parse_round(&mut self) -> Result<Expr, ExprError> {
        let value = self.parse_concat()?;
        let digits = if matches!(self.peek(), Some(Token::Comma)) {
            self.pos += 1;
            Some(Box::new(self.parse_concat()?))
        } else {
            None
        };
        self.eat_rparen();
        Ok(Expr::Round {
            value: Box::new(value),
            digits,
        })
    }

    // The aggregate argument span is captured once by scanning to the
    // matching closing parenthesis, then parsed into an owned sub-AST
    // that the evaluator replays against every table row.
    fn parse_aggregate(&mut self, func: AggregateKind) -> Result<Expr, ExprError> {
        if matches!(self.peek(), Some(Token::RParen)) {
            self.pos += 1;
            return Ok(Expr::Aggregate { func, arg: None });
        }
        let span = self.capture_argument_span();
        let mut inner = Parser {
            tokens: &self.tokens[span],
            pos: 0,
            depth: self.depth,
        };
        let arg = inner.parse_concat()?;
        Ok(Expr::Aggregate {
            func,
            arg: Some(Box::new(arg)),
        })
    }

    fn capture_argument_span(&mut self) -> std::ops::Range<usize> {
        let start = self.pos;
        let mut depth = 1usize;
        while self.pos < self.tokens.len() {
            match self.tokens[self.pos] {
                Token::LParen => depth += 1,
                Token::RParen => {
                    depth -= 1;
                    if depth == 0 {
                        let span = start..self.pos;
                        self.pos += 1;
                        return span;
                    }
                }
                _ => {}
            }
            self.pos += 1;
        }
        // Unterminated call: the span runs to end of input.
        start..self.tokens.len()
    }

    fn skip_to_rparen(&mut self) {
        let mut depth = 1usize;
        while self.pos < self.tokens.len() {
            match self.tokens[self.pos] {
                Token::LParen => depth += 1,
                Token::RParen => {
                    depth -= 1;
                    if depth == 0 {
                        self.pos += 1;
                        return;
                    }
                }
                _ => {}
            }
            self.pos += 1;
        }
    }
}

// ── Evaluator ──────────────────────────────────────────────────────────

/// Evaluation scope: the full table plus, in row context, one current row.
///
/// Aggregate functions are always table-scoped; they install each table
/// row in turn and ignore the outer row.
#[derive(Debug, Clone, Copy)]
pub struct EvalContext<'a> {
    table: &'a [Row],
    row: Option<&'a Row>,
}

impl<'a> EvalContext<'a> {
    #[must_use]
    pub fn with_row(table: &'a [Row], row: &'a Row) -> Self {
        Self {
            table,
            row: Some(row),
        }
    }

    #[must_use]
    pub fn table_only(table: &'a [Row]) -> Self {
        Self { table, row: None }
    }
}

/// Evaluate an AST against a context. Never fails; every anomaly
/// (missing column, coercion failure, division by zero, unknown function)
/// resolves to [`Value::Absent`].
#[must_use]
pub fn evaluate(expr: &Expr, ctx: &EvalContext<'_>) -> Value {
    match expr {
        Expr::Literal { value } => value.clone(),
        Expr::ColumnRef { name } => ctx
            .row
            .and_then(|row| row.get(name))
            .cloned()
            .unwrap_or(Value::Absent),
        Expr::Concat { left, right } => {
            let mut out = evaluate(left, ctx).to_text();
            out.push_str(&evaluate(right, ctx).to_text());
            Value::Text(out)
        }
        Expr::Compare { op, left, right } => {
            let left = evaluate(left, ctx);
            let right = evaluate(right, ctx);
            Value::Bool(compare_values(*op, &left, &right))
        }
        Expr::Arith { op, left, right } => {
            let left = evaluate(left, ctx);
            let right = evaluate(right, ctx);
            apply_arith(*op, &left, &right)
        }
        Expr::Negate { expr } => match evaluate(expr, ctx).to_number() {
            Some(v) => Value::Number(-v),
            None => Value::Absent,
        },
        Expr::If {
            cond,
            when_true,
            when_false,
        } => {
            let branch = if evaluate(cond, ctx).truthy() {
                when_true
            } else {
                when_false
            };
            evaluate(branch, ctx)
        }
        Expr::Round { value, digits } => apply_round(value, digits.as_deref(), ctx),
        Expr::Aggregate { func, arg } => evaluate_aggregate(*func, arg.as_deref(), ctx.table),
        Expr::UnknownCall { .. } => Value::Absent,
    }
}

/// Comparison first attempts numeric coercion of both sides; if either
/// side fails, both fall back to lexicographic comparison of their string
/// renderings.
fn compare_values(op: CompareOp, left: &Value, right: &Value) -> bool {
    if let (Some(lf), Some(rf)) = (left.to_number(), right.to_number()) {
        return match op {
            CompareOp::Eq => lf == rf,
            CompareOp::Ne => lf != rf,
            CompareOp::Gt => lf > rf,
            CompareOp::Lt => lf < rf,
            CompareOp::Ge => lf >= rf,
            CompareOp::Le => lf <= rf,
        };
    }
    let ls = left.to_text();
    let rs = right.to_text();
    match op {
        CompareOp::Eq => ls == rs,
        CompareOp::Ne => ls != rs,
        CompareOp::Gt => ls > rs,
        CompareOp::Lt => ls < rs,
        CompareOp::Ge => ls >= rs,
        CompareOp::Le => ls <= rs,
    }
}

fn apply_arith(op: ArithOp, left: &Value, right: &Value) -> Value {
    let (Some(lf), Some(rf)) = (left.to_number(), right.to_number()) else {
        return Value::Absent;
    };
    match op {
        ArithOp::Add => Value::Number(lf + rf),
        ArithOp::Sub => Value::Number(lf - rf),
        ArithOp::Mul => Value::Number(lf * rf),
        ArithOp::Div => {
            if rf == 0.0 {
                Value::Absent
            } else {
                Value::Number(lf / rf)
            }
        }
    }
}

// Ties round half away from zero, the native f64 convention.
fn apply_round(value: &Expr, digits: Option<&Expr>, ctx: &EvalContext<'_>) -> Value {
    let Some(num) = evaluate(value, ctx).to_number() else {
        return Value::Absent;
    };
    let ndigits = match digits.map(|d| evaluate(d, ctx)) {
        None | Some(Value::Absent) => None,
        Some(Value::Text(t)) if t.is_empty() => None,
        // Non-coercible digit counts fall back to integer rounding.
        Some(v) => v.to_number().map(|d| d.trunc().clamp(-322.0, 322.0) as i32),
    };
    match ndigits {
        None => Value::Number(num.round()),
        Some(d) => {
            let factor = 10f64.powi(d);
            let scaled = num * factor;
            // A digit count past f64 precision leaves the value unchanged.
            if !scaled.is_finite() {
                return Value::Number(num);
            }
            Value::Number(scaled.round() / factor)
        }
    }
}

// ── Aggregates ─────────────────────────────────────────────────────────

fn evaluate_aggregate(kind: AggregateKind, arg: Option<&Expr>, table: &[Row]) -> Value {
    let Some(arg) = arg else {
        return match kind {
            AggregateKind::Count => Value::Number(table.len() as f64),
            _ => Value::Absent,
        };
    };

    let per_row: Vec<Value> = table
        .iter()
        .map(|row| evaluate(arg, &EvalContext::with_row(table, row)))
        .collect();

    match kind {
        AggregateKind::Count => {
            Value::Number(per_row.iter().filter(|v| v.truthy()).count() as f64)
        }
        AggregateKind::Sum => Value::Number(per_row.iter().filter_map(Value::to_number).sum()),
        AggregateKind::Min | AggregateKind::Max => fold_min_max(kind, &per_row),
        AggregateKind::Unique => {
            let mut seen = BTreeSet::new();
            for value in &per_row {
                let rendered = value.to_text();
                if !rendered.is_empty() {
                    seen.insert(rendered);
                }
            }
            Value::Number(seen.len() as f64)
        }
    }
}

// Rows rendering empty are excluded. When every retained row coerces
// numerically the extremum is numeric; otherwise all retained rows
// compare by string rendering and the result is text.
fn fold_min_max(kind: AggregateKind, values: &[Value]) -> Value {
    let mut retained: Vec<(Option<f64>, String)> = Vec::new();
    for value in values {
        if value.is_absent() {
            continue;
        }
        let rendered = value.to_text();
        if rendered.is_empty() {
            continue;
        }
        retained.push((value.to_number(), rendered));
    }
    if retained.is_empty() {
        return Value::Absent;
    }

    if retained.iter().all(|(num, _)| num.is_some()) {
        let numbers = retained.iter().filter_map(|(num, _)| *num);
        let out = match kind {
            AggregateKind::Min => numbers.fold(f64::INFINITY, f64::min),
            _ => numbers.fold(f64::NEG_INFINITY, f64::max),
        };
        return Value::Number(out);
    }

    let texts = retained.into_iter().map(|(_, rendered)| rendered);
    let out = match kind {
        AggregateKind::Min => texts.min(),
        _ => texts.max(),
    };
    out.map_or(Value::Absent, Value::Text)
}

// ── Public boundary ────────────────────────────────────────────────────

/// Evaluate an expression string against a current row and a table, and
/// render the result.
///
/// This is the only operation the host calls. It never panics and never
/// signals failure: an empty expression yields the empty string, and any
/// internal error falls back to returning the expression verbatim.
#[must_use]
pub fn evaluate_expression(expr: &str, current_row: &Row, table: &[Row]) -> String {
    if expr.is_empty() {
        return String::new();
    }
    match evaluate_checked(expr, current_row, table) {
        Ok(rendered) => rendered,
        Err(_error) => {
            #[cfg(feature = "tracing")]
            tracing::debug!(
                error = %_error,
                expression = expr,
                "status expression fell back to verbatim text"
            );
            expr.to_owned()
        }
    }
}

/// [`evaluate_expression`] with the internal error surfaced, for tests
/// and tooling that must not have failures masked by the fallback.
pub fn evaluate_checked(expr: &str, current_row: &Row, table: &[Row]) -> Result<String, ExprError> {
    let tokens = tokenize(expr)?;
    let ast = parse(&tokens)?;
    let ctx = EvalContext::with_row(table, current_row);
    Ok(format_value(&evaluate(&ast, &ctx)))
}
