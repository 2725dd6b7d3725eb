//! Boolean guard expressions for conditional breakpoints.
//!
//! Grammar (informal):
//! - **Paths**: `state.reward.latest.reward_total`, `state.deps.pending.0`
//! - **Literals**: `0.8`, `-1`, `'text'`, `"text"`, `true`, `false`, `null`
//! - **Comparisons**: `==`, `!=`, `>=`, `<=`, `>`, `<`
//! - **Boolean operators**: `!a`, `a && b`, `a || b` (`&&` binds tighter)
//! - **Grouping**: `( ... )`
//!
//! Expressions are parsed once into an [`Expr`] when a template is loaded and
//! then evaluated against a JSON context. A path that does not resolve is
//! *undefined*: it equals only `null` and every ordering comparison against it
//! is false, so a guard over missing data never fires by accident.

use std::fmt;

use serde_json::Value;
use thiserror::Error;

/// Maximum accepted expression length in bytes.
const MAX_EXPR_BYTES: usize = 4096;
/// Maximum nesting depth of groups and negations.
const MAX_NESTING: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExprError {
    #[error("expression is empty")]
    Empty,
    #[error("expression exceeds {max} bytes ({actual})")]
    TooLarge { max: usize, actual: usize },
    #[error("expression nesting exceeds {max} at {position}")]
    TooDeep { max: usize, position: usize },
    #[error("unexpected `{found}` at {position}, expected {expected}")]
    Unexpected {
        expected: &'static str,
        found: String,
        position: usize,
    },
    #[error("unterminated string starting at {position}")]
    UnterminatedString { position: usize },
    #[error("invalid number `{raw}` at {position}")]
    InvalidNumber { raw: String, position: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Ge,
    Le,
    Gt,
    Lt,
}

impl fmt::Display for CmpOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self {
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
            CmpOp::Ge => ">=",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Lt => "<",
        };
        f.write_str(op)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Literal(Value),
    Path(Vec<String>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Or(Vec<Expr>),
    And(Vec<Expr>),
    Not(Box<Expr>),
    Compare { left: Operand, op: CmpOp, right: Operand },
    /// Bare operand: true only when it resolves to boolean `true`.
    Truthy(Operand),
}

/// Parse and evaluate in one go. Prefer [`parse`] + [`Expr::eval`] for guards
/// evaluated more than once.
pub fn eval_boolean(input: &str, context: &Value) -> Result<bool, ExprError> {
    Ok(parse(input)?.eval(context))
}

/// Parse an expression into its AST.
pub fn parse(input: &str) -> Result<Expr, ExprError> {
    if input.len() > MAX_EXPR_BYTES {
        return Err(ExprError::TooLarge {
            max: MAX_EXPR_BYTES,
            actual: input.len(),
        });
    }
    let tokens = Lexer::new(input).lex()?;
    let mut parser = Parser {
        tokens,
        index: 0,
        depth: 0,
    };
    let expr = parser.parse_or()?;
    parser.expect_eof()?;
    Ok(expr)
}

/// Value resolved from the context during evaluation.
#[derive(Debug, Clone, PartialEq)]
enum Resolved<'a> {
    Undefined,
    Value(&'a Value),
    Owned(Value),
}

impl Resolved<'_> {
    fn value(&self) -> Option<&Value> {
        match self {
            Resolved::Undefined => None,
            Resolved::Value(v) => Some(v),
            Resolved::Owned(v) => Some(v),
        }
    }
}

impl Expr {
    pub fn eval(&self, context: &Value) -> bool {
        match self {
            Expr::Or(parts) => parts.iter().any(|p| p.eval(context)),
            Expr::And(parts) => parts.iter().all(|p| p.eval(context)),
            Expr::Not(inner) => !inner.eval(context),
            Expr::Truthy(operand) => {
                matches!(resolve(operand, context).value(), Some(Value::Bool(true)))
            }
            Expr::Compare { left, op, right } => {
                compare(&resolve(left, context), *op, &resolve(right, context))
            }
        }
    }
}

fn resolve<'a>(operand: &Operand, context: &'a Value) -> Resolved<'a> {
    match operand {
        Operand::Literal(v) => Resolved::Owned(v.clone()),
        Operand::Path(segments) => {
            let mut current = context;
            for segment in segments {
                let next = match current {
                    Value::Object(map) => map.get(segment),
                    Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
                    _ => None,
                };
                match next {
                    Some(v) => current = v,
                    None => return Resolved::Undefined,
                }
            }
            Resolved::Value(current)
        }
    }
}

fn compare(left: &Resolved<'_>, op: CmpOp, right: &Resolved<'_>) -> bool {
    match op {
        CmpOp::Eq => equals(left, right),
        CmpOp::Ne => !equals(left, right),
        CmpOp::Ge | CmpOp::Le | CmpOp::Gt | CmpOp::Lt => {
            let ordering = match (left.value(), right.value()) {
                (Some(Value::Number(a)), Some(Value::Number(b))) => {
                    match (a.as_f64(), b.as_f64()) {
                        (Some(a), Some(b)) => a.partial_cmp(&b),
                        _ => None,
                    }
                }
                (Some(Value::String(a)), Some(Value::String(b))) => Some(a.cmp(b)),
                _ => None,
            };
            let Some(ordering) = ordering else {
                return false;
            };
            match op {
                CmpOp::Ge => ordering.is_ge(),
                CmpOp::Le => ordering.is_le(),
                CmpOp::Gt => ordering.is_gt(),
                CmpOp::Lt => ordering.is_lt(),
                CmpOp::Eq | CmpOp::Ne => false,
            }
        }
    }
}

fn equals(left: &Resolved<'_>, right: &Resolved<'_>) -> bool {
    match (left.value(), right.value()) {
        (None, None) => false,
        (None, Some(other)) | (Some(other), None) => other.is_null(),
        (Some(Value::Number(a)), Some(Value::Number(b))) => a.as_f64() == b.as_f64(),
        (Some(a), Some(b)) => a == b,
    }
}

// ----------------------------------------------------------------------------
// Lexer
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Path(Vec<String>),
    Number(f64),
    Str(String),
    True,
    False,
    Null,
    Cmp(CmpOp),
    And,
    Or,
    Not,
    LParen,
    RParen,
    Eof,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Path(p) => p.join("."),
            Token::Number(n) => n.to_string(),
            Token::Str(s) => format!("'{s}'"),
            Token::True => "true".to_string(),
            Token::False => "false".to_string(),
            Token::Null => "null".to_string(),
            Token::Cmp(op) => op.to_string(),
            Token::And => "&&".to_string(),
            Token::Or => "||".to_string(),
            Token::Not => "!".to_string(),
            Token::LParen => "(".to_string(),
            Token::RParen => ")".to_string(),
            Token::Eof => "end of input".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
struct Spanned {
    token: Token,
    position: usize,
}

struct Lexer<'a> {
    input: &'a str,
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Lexer<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            input,
            bytes: input.as_bytes(),
            offset: 0,
        }
    }

    fn lex(mut self) -> Result<Vec<Spanned>, ExprError> {
        let mut tokens = Vec::new();
        while self.offset < self.bytes.len() {
            let start = self.offset;
            let ch = self.bytes[start];
            let token = match ch {
                b' ' | b'\t' | b'\n' | b'\r' => {
                    self.offset += 1;
                    continue;
                }
                b'(' => self.single(Token::LParen),
                b')' => self.single(Token::RParen),
                b'&' => self.pair(b'&', Token::And, "&&")?,
                b'|' => self.pair(b'|', Token::Or, "||")?,
                b'=' => self.pair(b'=', Token::Cmp(CmpOp::Eq), "==")?,
                b'!' => {
                    if self.peek() == Some(b'=') {
                        self.offset += 2;
                        Token::Cmp(CmpOp::Ne)
                    } else {
                        self.single(Token::Not)
                    }
                }
                b'>' | b'<' => {
                    let with_eq = self.peek() == Some(b'=');
                    self.offset += if with_eq { 2 } else { 1 };
                    Token::Cmp(match (ch, with_eq) {
                        (b'>', true) => CmpOp::Ge,
                        (b'>', false) => CmpOp::Gt,
                        (b'<', true) => CmpOp::Le,
                        _ => CmpOp::Lt,
                    })
                }
                b'\'' | b'"' => self.string(ch)?,
                b'-' | b'0'..=b'9' => self.number()?,
                b'a'..=b'z' | b'A'..=b'Z' | b'_' => self.word(),
                _ => {
                    return Err(ExprError::Unexpected {
                        expected: "path, literal, or operator",
                        found: self.input[start..].chars().next().unwrap_or('?').to_string(),
                        position: start,
                    });
                }
            };
            tokens.push(Spanned {
                token,
                position: start,
            });
        }
        if tokens.is_empty() {
            return Err(ExprError::Empty);
        }
        tokens.push(Spanned {
            token: Token::Eof,
            position: self.offset,
        });
        Ok(tokens)
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.offset + 1).copied()
    }

    fn single(&mut self, token: Token) -> Token {
        self.offset += 1;
        token
    }

    fn pair(&mut self, second: u8, token: Token, expected: &'static str) -> Result<Token, ExprError> {
        if self.peek() == Some(second) {
            self.offset += 2;
            return Ok(token);
        }
        Err(ExprError::Unexpected {
            expected,
            found: char::from(self.bytes[self.offset]).to_string(),
            position: self.offset,
        })
    }

    fn string(&mut self, quote: u8) -> Result<Token, ExprError> {
        let start = self.offset;
        self.offset += 1;
        let mut out = String::new();
        let mut chars = self.input[self.offset..].char_indices();
        while let Some((i, c)) = chars.next() {
            match c {
                '\\' => match chars.next() {
                    Some((_, escaped)) => out.push(escaped),
                    None => break,
                },
                c if c as u32 == u32::from(quote) => {
                    self.offset += i + 1;
                    return Ok(Token::Str(out));
                }
                c => out.push(c),
            }
        }
        Err(ExprError::UnterminatedString { position: start })
    }

    fn number(&mut self) -> Result<Token, ExprError> {
        let start = self.offset;
        if self.bytes[start] == b'-' {
            self.offset += 1;
        }
        while let Some(&b) = self.bytes.get(self.offset) {
            if b.is_ascii_digit() || b == b'.' {
                self.offset += 1;
            } else {
                break;
            }
        }
        let raw = &self.input[start..self.offset];
        raw.parse::<f64>()
            .ok()
            .filter(|n| n.is_finite())
            .map(Token::Number)
            .ok_or_else(|| ExprError::InvalidNumber {
                raw: raw.to_string(),
                position: start,
            })
    }

    fn word(&mut self) -> Token {
        let start = self.offset;
        while let Some(&b) = self.bytes.get(self.offset) {
            // `-` only continues a word, so step ids like `write-tests` stay one segment.
            if b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-') {
                self.offset += 1;
            } else {
                break;
            }
        }
        let raw = &self.input[start..self.offset];
        match raw {
            "true" => Token::True,
            "false" => Token::False,
            "null" => Token::Null,
            _ => Token::Path(raw.split('.').map(str::to_string).collect()),
        }
    }
}

// ----------------------------------------------------------------------------
// Parser
// ----------------------------------------------------------------------------

struct Parser {
    tokens: Vec<Spanned>,
    index: usize,
    depth: usize,
}

impl Parser {
    fn current(&self) -> &Spanned {
        let last = self.tokens.len() - 1;
        &self.tokens[self.index.min(last)]
    }

    fn advance(&mut self) -> Token {
        let token = self.current().token.clone();
        if self.index < self.tokens.len() - 1 {
            self.index += 1;
        }
        token
    }

    fn matches(&mut self, token: &Token) -> bool {
        if &self.current().token == token {
            self.advance();
            return true;
        }
        false
    }

    fn unexpected(&self, expected: &'static str) -> ExprError {
        ExprError::Unexpected {
            expected,
            found: self.current().token.describe(),
            position: self.current().position,
        }
    }

    fn enter(&mut self) -> Result<(), ExprError> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(ExprError::TooDeep {
                max: MAX_NESTING,
                position: self.current().position,
            });
        }
        Ok(())
    }

    fn parse_or(&mut self) -> Result<Expr, ExprError> {
        let mut parts = vec![self.parse_and()?];
        while self.matches(&Token::Or) {
            parts.push(self.parse_and()?);
        }
        Ok(if parts.len() == 1 {
            parts.remove(0)
        } else {
            Expr::Or(parts)
        })
    }

    fn parse_and(&mut self) -> Result<Expr, ExprError> {
        let mut parts = vec![self.parse_unary()?];
        while self.matches(&Token::And) {
            parts.push(self.parse_unary()?);
        }
        Ok(if parts.len() == 1 {
            parts.remove(0)
        } else {
            Expr::And(parts)
        })
    }

    fn parse_unary(&mut self) -> Result<Expr, ExprError> {
        if self.matches(&Token::Not) {
            self.enter()?;
            let inner = self.parse_unary()?;
            self.depth -= 1;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, ExprError> {
        if self.matches(&Token::LParen) {
            self.enter()?;
            let inner = self.parse_or()?;
            if !self.matches(&Token::RParen) {
                return Err(self.unexpected(")"));
            }
            self.depth -= 1;
            return Ok(inner);
        }
        let left = self.parse_operand()?;
        if let Token::Cmp(op) = self.current().token {
            self.advance();
            let right = self.parse_operand()?;
            return Ok(Expr::Compare { left, op, right });
        }
        Ok(Expr::Truthy(left))
    }

    fn parse_operand(&mut self) -> Result<Operand, ExprError> {
        let operand = match &self.current().token {
            Token::Path(segments) => {
                if segments.iter().any(String::is_empty) {
                    return Err(self.unexpected("path segment"));
                }
                Operand::Path(segments.clone())
            }
            Token::Number(n) => Operand::Literal(
                serde_json::Number::from_f64(*n)
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
            ),
            Token::Str(s) => Operand::Literal(Value::String(s.clone())),
            Token::True => Operand::Literal(Value::Bool(true)),
            Token::False => Operand::Literal(Value::Bool(false)),
            Token::Null => Operand::Literal(Value::Null),
            _ => return Err(self.unexpected("path or literal")),
        };
        self.advance();
        Ok(operand)
    }

    fn expect_eof(&self) -> Result<(), ExprError> {
        if self.current().token == Token::Eof {
            return Ok(());
        }
        Err(self.unexpected("end of input"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> Value {
        json!({
            "state": {
                "status": "ACTIVE",
                "reward": {"latest": {"reward_total": 0.55, "decision": "redo"}},
                "deps": {"pending": ["child-1"], "completed": []},
                "flags": {"ready": true},
                "missing_value": null
            }
        })
    }

    #[test]
    fn numeric_comparisons() {
        assert!(eval_boolean("state.reward.latest.reward_total < 0.8", &ctx()).expect("eval"));
        assert!(!eval_boolean("state.reward.latest.reward_total >= 0.8", &ctx()).expect("eval"));
        assert!(eval_boolean("state.reward.latest.reward_total == 0.55", &ctx()).expect("eval"));
    }

    #[test]
    fn string_and_array_paths() {
        assert!(eval_boolean("state.status == 'ACTIVE'", &ctx()).expect("eval"));
        assert!(eval_boolean("state.deps.pending.0 == \"child-1\"", &ctx()).expect("eval"));
        assert!(eval_boolean("state.deps.pending.1 == null", &ctx()).expect("eval"));
    }

    #[test]
    fn hyphenated_step_ids_are_path_segments() {
        let c = json!({"state": {"steps": {"write-tests": {"attempts": 2}}}});
        assert!(eval_boolean("state.steps.write-tests.attempts >= 2", &c).expect("eval"));
        assert!(eval_boolean("state.steps.write-tests.attempts > -1", &c).expect("eval"));
        assert!(eval_boolean("state.steps.write-tests.attempts>-1", &c).expect("eval"));
        assert!(!eval_boolean("state.steps.write", &c).expect("eval"));
    }

    #[test]
    fn and_binds_tighter_than_or() {
        // false && false || true  => (false && false) || true => true
        let expr = "state.status == 'X' && state.flags.ready || state.flags.ready";
        assert!(eval_boolean(expr, &ctx()).expect("eval"));
        // true || false && false => true || (false && false) => true
        let expr = "state.flags.ready || state.status == 'X' && false";
        assert!(eval_boolean(expr, &ctx()).expect("eval"));
        let expr = "(state.flags.ready || true) && state.status == 'X'";
        assert!(!eval_boolean(expr, &ctx()).expect("eval"));
    }

    #[test]
    fn undefined_paths_fail_closed() {
        let c = ctx();
        assert!(!eval_boolean("state.nope > 0", &c).expect("eval"));
        assert!(!eval_boolean("state.nope < 0", &c).expect("eval"));
        assert!(!eval_boolean("state.nope == 0", &c).expect("eval"));
        assert!(!eval_boolean("state.nope == 'ACTIVE'", &c).expect("eval"));
        assert!(!eval_boolean("state.nope", &c).expect("eval"));
        assert!(!eval_boolean("state.nope == state.also_nope", &c).expect("eval"));
        assert!(eval_boolean("state.nope == null", &c).expect("eval"));
        assert!(eval_boolean("state.missing_value == null", &c).expect("eval"));
    }

    #[test]
    fn negation_and_not_equal() {
        assert!(eval_boolean("!(state.status == 'DONE')", &ctx()).expect("eval"));
        assert!(eval_boolean("state.status != 'DONE'", &ctx()).expect("eval"));
        assert!(!eval_boolean("!state.flags.ready", &ctx()).expect("eval"));
    }

    #[test]
    fn mismatched_types_never_order() {
        assert!(!eval_boolean("state.status > 1", &ctx()).expect("eval"));
        assert!(!eval_boolean("state.flags.ready == 1", &ctx()).expect("eval"));
    }

    #[test]
    fn malformed_expressions_are_rejected() {
        assert_eq!(parse("   "), Err(ExprError::Empty));
        assert!(matches!(
            parse("state.a = 1"),
            Err(ExprError::Unexpected { expected: "==", .. })
        ));
        assert!(matches!(parse("state.a == 'x"), Err(ExprError::UnterminatedString { .. })));
        assert!(matches!(parse("(state.a == 1"), Err(ExprError::Unexpected { .. })));
        assert!(matches!(parse("state.a == 1 state.b"), Err(ExprError::Unexpected { .. })));
        assert!(matches!(parse("state.a == 1.2.3"), Err(ExprError::InvalidNumber { .. })));
        assert!(matches!(parse("state..a"), Err(ExprError::Unexpected { .. })));
        assert!(matches!(parse("&& true"), Err(ExprError::Unexpected { .. })));
        assert!(matches!(parse("state.a == #"), Err(ExprError::Unexpected { .. })));
    }

    #[test]
    fn nesting_is_bounded() {
        let deep = format!("{}true{}", "(".repeat(40), ")".repeat(40));
        assert!(matches!(parse(&deep), Err(ExprError::TooDeep { .. })));
    }
}
