//! Built-in filter expression language.
//!
//! A deliberately small, side-effect free language over the fact header and
//! payload:
//!
//! ```text
//! header.type == "UserCreated" && (payload.age >= 18 || !payload.minor)
//! payload.country in ["DE", "AT"]
//! ```
//!
//! Paths start at `header` or `payload`; missing fields evaluate to `null`.
//! Numbers compare numerically, strings lexicographically; ordering values of
//! different kinds is an error. The whole expression must produce a boolean.
//! Negations and parentheses nest at most [`MAX_DEPTH`] levels deep.

use super::script::{ScriptCompiler, ScriptPredicate};
use crate::error::MatchError;
use crate::types::Hash;
use serde_json::Value;
use std::cmp::Ordering;
use std::sync::Arc;

/// Deepest nesting of `!` and parentheses a script may use.
pub const MAX_DEPTH: usize = 64;

/// Compiles expression sources into [`Expression`] predicates.
pub struct ExpressionCompiler;

impl ScriptCompiler for ExpressionCompiler {
    fn compile(&self, source: &str, hash: &Hash) -> Result<Arc<dyn ScriptPredicate>, MatchError> {
        let compile_error = |message: String| MatchError::Compile {
            hash: hash.to_hex(),
            message,
        };
        let tokens = tokenize(source).map_err(compile_error)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
        };
        let expr = parser.parse_or().map_err(compile_error)?;
        if let Some(token) = parser.peek() {
            return Err(compile_error(format!("unexpected trailing {token:?}")));
        }
        Ok(Arc::new(Expression {
            root: expr,
            hash: hash.to_hex(),
        }))
    }
}

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    Dot,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Not,
    And,
    Or,
    Cmp(CmpOp),
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum Root {
    Header,
    Payload,
}

#[derive(Debug)]
enum Expr {
    Literal(Value),
    Path(Root, Vec<String>),
    Not(Box<Expr>),
    All(Vec<Expr>),
    Any(Vec<Expr>),
    Compare(Box<Expr>, CmpOp, Box<Expr>),
    In(Box<Expr>, Vec<Value>),
}

fn tokenize(source: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            c if c.is_whitespace() => i += 1,
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '&' if next == Some('&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if next == Some('|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '=' if next == Some('=') => {
                tokens.push(Token::Cmp(CmpOp::Eq));
                i += 2;
            }
            '!' if next == Some('=') => {
                tokens.push(Token::Cmp(CmpOp::Ne));
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '<' | '>' => {
                let op = match (c, next == Some('=')) {
                    ('<', true) => CmpOp::Le,
                    ('<', false) => CmpOp::Lt,
                    (_, true) => CmpOp::Ge,
                    (_, false) => CmpOp::Gt,
                };
                tokens.push(Token::Cmp(op));
                i += if next == Some('=') { 2 } else { 1 };
            }
            '"' | '\'' => {
                let quote = c;
                let mut text = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err("unterminated string literal".into()),
                        Some('\\') => {
                            let escaped = chars.get(i + 1).ok_or("dangling escape")?;
                            text.push(*escaped);
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
            c if c.is_ascii_digit() || (c == '-' && next.is_some_and(|n| n.is_ascii_digit())) => {
                let start = i;
                i += 1;
                while i < chars.len()
                    && (chars[i].is_ascii_digit()
                        || (chars[i] == '.'
                            && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit())
                            && tokens.last() != Some(&Token::Dot)))
                {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let num = text
                    .parse::<f64>()
                    .map_err(|_| format!("invalid number {text}"))?;
                tokens.push(Token::Num(num));
            }
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '$')
                {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => return Err(format!("unexpected character {other:?}")),
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn expect(&mut self, expected: Token) -> Result<(), String> {
        match self.advance() {
            Some(t) if t == expected => Ok(()),
            Some(t) => Err(format!("expected {expected:?}, found {t:?}")),
            None => Err(format!("expected {expected:?}, found end of input")),
        }
    }

    /// Runs `parse` one nesting level deeper.
    fn nested<T>(&mut self, parse: impl FnOnce(&mut Self) -> Result<T, String>) -> Result<T, String> {
        if self.depth >= MAX_DEPTH {
            return Err(format!("expression nested deeper than {MAX_DEPTH} levels"));
        }
        self.depth += 1;
        let result = parse(self);
        self.depth -= 1;
        result
    }

    // Operator chains are flat so their length never adds recursion.
    fn parse_or(&mut self) -> Result<Expr, String> {
        let first = self.parse_and()?;
        if self.peek() != Some(&Token::Or) {
            return Ok(first);
        }
        let mut terms = vec![first];
        while self.peek() == Some(&Token::Or) {
            self.advance();
            terms.push(self.parse_and()?);
        }
        Ok(Expr::Any(terms))
    }

    fn parse_and(&mut self) -> Result<Expr, String> {
        let first = self.parse_unary()?;
        if self.peek() != Some(&Token::And) {
            return Ok(first);
        }
        let mut terms = vec![first];
        while self.peek() == Some(&Token::And) {
            self.advance();
            terms.push(self.parse_unary()?);
        }
        Ok(Expr::All(terms))
    }

    fn parse_unary(&mut self) -> Result<Expr, String> {
        if self.peek() == Some(&Token::Not) {
            self.advance();
            let inner = self.nested(Self::parse_unary)?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, String> {
        let left = self.parse_primary()?;
        match self.peek() {
            Some(Token::Cmp(op)) => {
                let op = *op;
                self.advance();
                let right = self.parse_primary()?;
                Ok(Expr::Compare(Box::new(left), op, Box::new(right)))
            }
            Some(Token::Ident(word)) if word == "in" => {
                self.advance();
                self.expect(Token::LBracket)?;
                let mut items = Vec::new();
                if self.peek() != Some(&Token::RBracket) {
                    loop {
                        match self.parse_primary()? {
                            Expr::Literal(v) => items.push(v),
                            _ => return Err("only literals are allowed in an `in` list".into()),
                        }
                        if self.peek() == Some(&Token::Comma) {
                            self.advance();
                        } else {
                            break;
                        }
                    }
                }
                self.expect(Token::RBracket)?;
                Ok(Expr::In(Box::new(left), items))
            }
            _ => Ok(left),
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, String> {
        match self.advance() {
            Some(Token::LParen) => {
                let inner = self.nested(Self::parse_or)?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Num(n)) => Ok(Expr::Literal(number(n))),
            Some(Token::Ident(word)) => match word.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" => Ok(Expr::Literal(Value::Null)),
                "header" => Ok(Expr::Path(Root::Header, self.parse_segments()?)),
                "payload" => Ok(Expr::Path(Root::Payload, self.parse_segments()?)),
                other => Err(format!("unknown identifier {other:?}")),
            },
            Some(t) => Err(format!("unexpected {t:?}")),
            None => Err("unexpected end of input".into()),
        }
    }

    fn parse_segments(&mut self) -> Result<Vec<String>, String> {
        let mut segments = Vec::new();
        while self.peek() == Some(&Token::Dot) {
            self.advance();
            match self.advance() {
                Some(Token::Ident(name)) => segments.push(name),
                Some(Token::Num(n)) if n >= 0.0 && n.fract() == 0.0 => {
                    segments.push((n as u64).to_string())
                }
                other => return Err(format!("expected field name after '.', found {other:?}")),
            }
        }
        Ok(segments)
    }
}

fn number(n: f64) -> Value {
    serde_json::Number::from_f64(n)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

/// A compiled expression.
pub struct Expression {
    root: Expr,
    hash: String,
}

impl Expression {
    fn error(&self, message: impl Into<String>) -> MatchError {
        MatchError::Evaluation {
            hash: self.hash.clone(),
            message: message.into(),
        }
    }

    fn eval(&self, expr: &Expr, header: &Value, payload: &Value) -> Result<Value, MatchError> {
        match expr {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Path(root, segments) => {
                let mut current = match root {
                    Root::Header => header,
                    Root::Payload => payload,
                };
                for segment in segments {
                    current = match current {
                        Value::Object(map) => map.get(segment).unwrap_or(&Value::Null),
                        Value::Array(items) => segment
                            .parse::<usize>()
                            .ok()
                            .and_then(|i| items.get(i))
                            .unwrap_or(&Value::Null),
                        _ => &Value::Null,
                    };
                }
                Ok(current.clone())
            }
            Expr::Not(inner) => Ok(Value::Bool(!self.eval_bool(inner, header, payload)?)),
            Expr::All(terms) => {
                for term in terms {
                    if !self.eval_bool(term, header, payload)? {
                        return Ok(Value::Bool(false));
                    }
                }
                Ok(Value::Bool(true))
            }
            Expr::Any(terms) => {
                for term in terms {
                    if self.eval_bool(term, header, payload)? {
                        return Ok(Value::Bool(true));
                    }
                }
                Ok(Value::Bool(false))
            }
            Expr::Compare(l, op, r) => {
                let left = self.eval(l, header, payload)?;
                let right = self.eval(r, header, payload)?;
                let result = match op {
                    CmpOp::Eq => values_equal(&left, &right),
                    CmpOp::Ne => !values_equal(&left, &right),
                    _ => {
                        let ordering = compare(&left, &right).ok_or_else(|| {
                            self.error(format!("cannot order {left} and {right}"))
                        })?;
                        match op {
                            CmpOp::Lt => ordering == Ordering::Less,
                            CmpOp::Le => ordering != Ordering::Greater,
                            CmpOp::Gt => ordering == Ordering::Greater,
                            _ => ordering != Ordering::Less,
                        }
                    }
                };
                Ok(Value::Bool(result))
            }
            Expr::In(needle, items) => {
                let value = self.eval(needle, header, payload)?;
                Ok(Value::Bool(items.iter().any(|item| values_equal(&value, item))))
            }
        }
    }

    fn eval_bool(&self, expr: &Expr, header: &Value, payload: &Value) -> Result<bool, MatchError> {
        match self.eval(expr, header, payload)? {
            Value::Bool(b) => Ok(b),
            other => Err(self.error(format!("expected a boolean operand, got {other}"))),
        }
    }
}

impl ScriptPredicate for Expression {
    fn evaluate(&self, header: &Value, payload: &Value) -> Result<bool, MatchError> {
        match self.eval(&self.root, header, payload)? {
            Value::Bool(b) => Ok(b),
            other => Err(MatchError::NotBoolean {
                hash: self.hash.clone(),
                got: other.to_string(),
            }),
        }
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn eval(source: &str, header: Value, payload: Value) -> Result<bool, MatchError> {
        let hash = Hash::from_bytes(source.as_bytes());
        ExpressionCompiler
            .compile(source, &hash)?
            .evaluate(&header, &payload)
    }

    #[test]
    fn test_comparisons() {
        let payload = json!({"age": 21, "name": "ada", "tags": ["x", "y"]});
        assert!(eval("payload.age >= 18", json!({}), payload.clone()).unwrap());
        assert!(eval("payload.age == 21.0", json!({}), payload.clone()).unwrap());
        assert!(!eval("payload.age < 21", json!({}), payload.clone()).unwrap());
        assert!(eval("payload.name != 'bob'", json!({}), payload.clone()).unwrap());
        assert!(eval("payload.tags.1 == \"y\"", json!({}), payload.clone()).unwrap());
        assert!(eval("payload.missing == null", json!({}), payload).unwrap());

        let nested = json!({"items": [{"name": "first"}]});
        assert!(eval("payload.items.0.name == 'first'", json!({}), nested).unwrap());
    }

    #[test]
    fn test_boolean_operators_and_grouping() {
        let header = json!({"type": "UserCreated"});
        let payload = json!({"age": 12, "minor": true});
        let source = "header.type == 'UserCreated' && (payload.age >= 18 || payload.minor)";
        assert!(eval(source, header.clone(), payload.clone()).unwrap());
        assert!(!eval("!payload.minor", header, payload).unwrap());
    }

    #[test]
    fn test_in_list() {
        let payload = json!({"country": "AT"});
        assert!(eval("payload.country in ['DE', 'AT']", json!({}), payload.clone()).unwrap());
        assert!(!eval("payload.country in []", json!({}), payload).unwrap());
    }

    #[test]
    fn test_non_boolean_result_is_error() {
        let result = eval("payload.age", json!({}), json!({"age": 3}));
        assert!(matches!(result, Err(MatchError::NotBoolean { .. })));
    }

    #[test]
    fn test_ordering_mismatched_kinds_is_error() {
        let result = eval("payload.age > 'x'", json!({}), json!({"age": 3}));
        assert!(matches!(result, Err(MatchError::Evaluation { .. })));
    }

    #[test]
    fn test_nesting_is_bounded() {
        let within = format!("{}true", "!".repeat(MAX_DEPTH));
        assert!(eval(&within, json!({}), json!({})).unwrap());

        for source in [
            format!("{}true", "!".repeat(200_000)),
            format!("{}true{}", "(".repeat(200_000), ")".repeat(200_000)),
        ] {
            let hash = Hash::from_bytes(source.as_bytes());
            assert!(matches!(
                ExpressionCompiler.compile(&source, &hash),
                Err(MatchError::Compile { .. })
            ));
        }
    }

    #[test]
    fn test_long_operator_chains() {
        let source = vec!["payload.ok"; 100_000].join(" && ");
        assert!(eval(&source, json!({}), json!({"ok": true})).unwrap());
        let source = vec!["payload.ok"; 100_000].join(" || ");
        assert!(!eval(&source, json!({}), json!({"ok": false})).unwrap());
    }

    #[test]
    fn test_syntax_errors() {
        for source in ["payload.x ==", "(payload.x == 1", "foo == 1", "payload.x == 1 )", "'open"] {
            let hash = Hash::from_bytes(source.as_bytes());
            assert!(
                matches!(ExpressionCompiler.compile(source, &hash), Err(MatchError::Compile { .. })),
                "{source} should not compile"
            );
        }
    }
}
