//! Field-level patches and the arithmetic expression AST.

use crate::record::Record;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Callback computing a new field value from the record being patched.
pub type Updater = Arc<dyn Fn(&Record) -> Value + Send + Sync>;

/// Errors from parsing an arithmetic expression.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExprError {
    /// The expression contained no terms.
    #[error("empty expression")]
    Empty,
    /// An unexpected character was found.
    #[error("unexpected character {0:?} at offset {1}")]
    UnexpectedChar(char, usize),
    /// A string literal was not closed.
    #[error("unterminated string literal")]
    UnterminatedString,
    /// An operator was not followed by a term.
    #[error("dangling operator {0:?}")]
    DanglingOperator(ExprOp),
    /// Two terms appeared without an operator between them.
    #[error("expected operator before term")]
    MissingOperator,
}

/// Binary operator in an expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExprOp {
    /// Addition; concatenation when either side is text.
    Add,
    /// Subtraction.
    Sub,
    /// Multiplication.
    Mul,
    /// Division.
    Div,
    /// Remainder.
    Rem,
}

/// A single operand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Term {
    /// Reference to a field of the record being patched.
    Field(String),
    /// Integer literal.
    Int(i64),
    /// Floating point literal.
    Float(f64),
    /// String literal.
    Text(String),
}

impl Term {
    fn resolve(&self, record: &Record) -> Value {
        match self {
            Term::Field(name) => record.field(name).cloned().unwrap_or(Value::Null),
            Term::Int(n) => Value::Int(*n),
            Term::Float(f) => Value::Float(*f),
            Term::Text(s) => Value::Text(s.clone()),
        }
    }
}

/// A parsed arithmetic expression over record fields.
///
/// Grammar: `term (op term)*` with operators `+ - * / %`, integer and
/// float literals, single-quoted string literals and bare field names.
/// Evaluation is strictly left to right with no precedence, matching the
/// original expression semantics; there is no dynamic code evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expr {
    first: Term,
    rest: Vec<(ExprOp, Term)>,
}

impl Expr {
    /// Parses an expression such as `p1 + p2 + 2` or `name + '!'`.
    pub fn parse(input: &str) -> Result<Self, ExprError> {
        let tokens = tokenize(input)?;
        let mut iter = tokens.into_iter();

        let first = match iter.next() {
            Some(Token::Term(term)) => term,
            Some(Token::Op(op)) => return Err(ExprError::DanglingOperator(op)),
            None => return Err(ExprError::Empty),
        };

        let mut rest = Vec::new();
        loop {
            let op = match iter.next() {
                None => break,
                Some(Token::Op(op)) => op,
                Some(Token::Term(_)) => return Err(ExprError::MissingOperator),
            };
            match iter.next() {
                Some(Token::Term(term)) => rest.push((op, term)),
                _ => return Err(ExprError::DanglingOperator(op)),
            }
        }

        Ok(Self { first, rest })
    }

    /// Evaluates the expression against a record's current fields.
    ///
    /// Missing fields resolve to `Null`, which behaves as zero in
    /// arithmetic and as the empty string in concatenation.
    pub fn eval(&self, record: &Record) -> Value {
        let mut acc = self.first.resolve(record);
        for (op, term) in &self.rest {
            acc = apply(*op, acc, term.resolve(record));
        }
        acc
    }
}

fn apply(op: ExprOp, lhs: Value, rhs: Value) -> Value {
    if op == ExprOp::Add {
        // Text on either side turns addition into concatenation.
        if matches!(lhs, Value::Text(_)) || matches!(rhs, Value::Text(_)) {
            return Value::Text(format!("{lhs}{rhs}"));
        }
    }

    let a = lhs.as_number().unwrap_or(0.0);
    let b = rhs.as_number().unwrap_or(0.0);
    let result = match op {
        ExprOp::Add => a + b,
        ExprOp::Sub => a - b,
        ExprOp::Mul => a * b,
        ExprOp::Div => a / b,
        ExprOp::Rem => a % b,
    };

    let both_int = matches!(lhs, Value::Int(_) | Value::Null) && matches!(rhs, Value::Int(_) | Value::Null);
    if both_int && result.is_finite() && result.fract() == 0.0 {
        Value::Int(result as i64)
    } else {
        Value::Float(result)
    }
}

enum Token {
    Term(Term),
    Op(ExprOp),
}

fn tokenize(input: &str) -> Result<Vec<Token>, ExprError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' => i += 1,
            '+' => {
                tokens.push(Token::Op(ExprOp::Add));
                i += 1;
            }
            '-' => {
                tokens.push(Token::Op(ExprOp::Sub));
                i += 1;
            }
            '*' => {
                tokens.push(Token::Op(ExprOp::Mul));
                i += 1;
            }
            '/' => {
                tokens.push(Token::Op(ExprOp::Div));
                i += 1;
            }
            '%' => {
                tokens.push(Token::Op(ExprOp::Rem));
                i += 1;
            }
            '\'' => {
                let start = i + 1;
                let mut j = start;
                while j < chars.len() && chars[j] != '\'' {
                    j += 1;
                }
                if j == chars.len() {
                    return Err(ExprError::UnterminatedString);
                }
                tokens.push(Token::Term(Term::Text(chars[start..j].iter().collect())));
                i = j + 1;
            }
            '0'..='9' | '.' => {
                let start = i;
                let mut seen_dot = false;
                while i < chars.len() && (chars[i].is_ascii_digit() || (chars[i] == '.' && !seen_dot))
                {
                    if chars[i] == '.' {
                        seen_dot = true;
                    }
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                if seen_dot {
                    let parsed = text
                        .parse::<f64>()
                        .map_err(|_| ExprError::UnexpectedChar('.', start))?;
                    tokens.push(Token::Term(Term::Float(parsed)));
                } else {
                    let parsed = text
                        .parse::<i64>()
                        .map_err(|_| ExprError::UnexpectedChar(c, start))?;
                    tokens.push(Token::Term(Term::Int(parsed)));
                }
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Term(Term::Field(chars[start..i].iter().collect())));
            }
            other => return Err(ExprError::UnexpectedChar(other, i)),
        }
    }

    Ok(tokens)
}

/// How one field of a patch is computed.
#[derive(Clone)]
pub enum FieldUpdate {
    /// Replace the field with a literal value.
    Set(Value),
    /// Compute the new value from the record being patched.
    Compute(Updater),
    /// Evaluate a parsed arithmetic expression over the record's fields.
    Expr(Expr),
}

impl fmt::Debug for FieldUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldUpdate::Set(value) => f.debug_tuple("Set").field(value).finish(),
            FieldUpdate::Compute(_) => f.write_str("Compute(<fn>)"),
            FieldUpdate::Expr(expr) => f.debug_tuple("Expr").field(expr).finish(),
        }
    }
}

impl FieldUpdate {
    /// Computes the value this update assigns, given the current record.
    pub fn evaluate(&self, record: &Record) -> Value {
        match self {
            FieldUpdate::Set(value) => value.clone(),
            FieldUpdate::Compute(updater) => updater(record),
            FieldUpdate::Expr(expr) => expr.eval(record),
        }
    }
}

/// Replica metadata adjustments carried alongside a patch.
///
/// Only the local store interprets these; remote backends ignore them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MetaPatch {
    /// New value for the locally-modified flag.
    pub dirty: Option<bool>,
    /// New value for the soft-deleted flag.
    pub deleted: Option<bool>,
    /// New last-write stamp.
    pub stamp: Option<u64>,
}

impl MetaPatch {
    /// Returns true if nothing is adjusted.
    pub fn is_empty(&self) -> bool {
        self.dirty.is_none() && self.deleted.is_none() && self.stamp.is_none()
    }
}

/// A field-level patch applied to every record matching a filter.
///
/// Computed entries (`Compute`, `Expr`) are evaluated per record against
/// its pre-patch fields. Patches queued while offline are replayed
/// verbatim: the queue holds the same shared updater callbacks, not a
/// snapshot of their results.
#[derive(Debug, Clone, Default)]
pub struct Patch {
    /// Field name to update rule.
    pub fields: BTreeMap<String, FieldUpdate>,
    /// Replica metadata adjustments (local store only).
    pub meta: MetaPatch,
}

impl Patch {
    /// Creates an empty patch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a literal assignment, builder style.
    pub fn set(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields
            .insert(name.into(), FieldUpdate::Set(value.into()));
        self
    }

    /// Adds a computed assignment, builder style.
    pub fn compute(
        mut self,
        name: impl Into<String>,
        updater: impl Fn(&Record) -> Value + Send + Sync + 'static,
    ) -> Self {
        self.fields
            .insert(name.into(), FieldUpdate::Compute(Arc::new(updater)));
        self
    }

    /// Adds an expression assignment, builder style.
    pub fn expr(mut self, name: impl Into<String>, expr: Expr) -> Self {
        self.fields.insert(name.into(), FieldUpdate::Expr(expr));
        self
    }

    /// Returns true if the patch assigns no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Returns a copy with different metadata adjustments.
    pub fn with_meta(&self, meta: MetaPatch) -> Patch {
        Patch {
            fields: self.fields.clone(),
            meta,
        }
    }

    /// Applies the patch to a record in place.
    ///
    /// All computed entries see the record's pre-patch fields.
    pub fn apply(&self, record: &mut Record) {
        let before = record.clone();
        for (name, update) in &self.fields {
            let value = update.evaluate(&before);
            record.set_field(name.clone(), value);
        }
        if let Some(dirty) = self.meta.dirty {
            record.meta.dirty = dirty;
        }
        if let Some(deleted) = self.meta.deleted {
            record.meta.deleted = deleted;
        }
        if let Some(stamp) = self.meta.stamp {
            record.meta.stamp = stamp;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn record(pairs: &[(&str, Value)]) -> Record {
        let mut r = Record::new();
        for (name, value) in pairs {
            r.set_field(*name, value.clone());
        }
        r
    }

    #[test]
    fn parse_and_eval_left_to_right() {
        // no precedence: (p1 + p2) * 2
        let expr = Expr::parse("p1 + p2 * 2").unwrap();
        let r = record(&[("p1", Value::Int(1)), ("p2", Value::Int(2))]);
        assert_eq!(expr.eval(&r), Value::Int(6));
    }

    #[test]
    fn eval_string_concat() {
        let expr = Expr::parse("name + '-suffix'").unwrap();
        let r = record(&[("name", Value::Text("core".into()))]);
        assert_eq!(expr.eval(&r), Value::Text("core-suffix".into()));
    }

    #[test]
    fn eval_floats_and_remainder() {
        let expr = Expr::parse("x / 2").unwrap();
        let r = record(&[("x", Value::Int(5))]);
        assert_eq!(expr.eval(&r), Value::Float(2.5));

        let expr = Expr::parse("x % 3").unwrap();
        assert_eq!(expr.eval(&r), Value::Int(2));
    }

    #[test]
    fn missing_field_is_zero() {
        let expr = Expr::parse("absent + 2").unwrap();
        assert_eq!(expr.eval(&Record::new()), Value::Int(2));
    }

    #[test]
    fn parse_errors() {
        assert_eq!(Expr::parse(""), Err(ExprError::Empty));
        assert_eq!(
            Expr::parse("a +"),
            Err(ExprError::DanglingOperator(ExprOp::Add))
        );
        assert_eq!(Expr::parse("a b"), Err(ExprError::MissingOperator));
        assert_eq!(Expr::parse("'open"), Err(ExprError::UnterminatedString));
        assert!(matches!(
            Expr::parse("a ? b"),
            Err(ExprError::UnexpectedChar('?', _))
        ));
    }

    #[test]
    fn patch_sees_pre_patch_fields() {
        // p2 doubles the *old* p1 even though p1 is assigned first
        let patch = Patch::new()
            .set("p1", 1i64)
            .compute("p2", |r| {
                Value::Int(r.field("p1").and_then(|v| v.as_int()).unwrap_or(0) * 2)
            })
            .expr("p3", Expr::parse("p1 + p2 + 2").unwrap());

        let mut r = record(&[("p1", Value::Int(10)), ("p2", Value::Int(5))]);
        patch.apply(&mut r);

        assert_eq!(r.field("p1"), Some(&Value::Int(1)));
        assert_eq!(r.field("p2"), Some(&Value::Int(20)));
        assert_eq!(r.field("p3"), Some(&Value::Int(17)));
    }

    #[test]
    fn meta_patch_applies() {
        let patch = Patch::new().set("a", 1i64).with_meta(MetaPatch {
            dirty: Some(true),
            deleted: None,
            stamp: Some(42),
        });
        let mut r = Record::new();
        patch.apply(&mut r);
        assert!(r.meta.dirty);
        assert_eq!(r.meta.stamp, 42);
    }

    proptest! {
        #[test]
        fn eval_never_panics(
            a in -1000i64..1000,
            b in 0i64..1000,
            op in prop::sample::select(vec!["+", "-", "*", "/", "%"]),
        ) {
            let source = format!("x {op} y {op} {b}");
            let expr = Expr::parse(&source).unwrap();
            let r = record(&[("x", Value::Int(a)), ("y", Value::Int(b))]);
            let _ = expr.eval(&r);
        }

        #[test]
        fn tokenizer_accepts_field_names(name in "[a-z_][a-z0-9_]{0,10}") {
            let expr = Expr::parse(&name).unwrap();
            let r = record(&[(name.as_str(), Value::Int(7))]);
            prop_assert_eq!(expr.eval(&r), Value::Int(7));
        }
    }
}
