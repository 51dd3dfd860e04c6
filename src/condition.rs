//! Restricted boolean expression evaluation for conditional branching.
//!
//! Conditional nodes carry a small expression evaluated against exactly three
//! bindings: `item` (the first item of the batch, or an empty object),
//! `items` (the full batch), and the `len(..)` function. Nothing else is in
//! scope — no arbitrary computation, no state access, no side effects. The
//! evaluator is a hand-written tokenizer + recursive-descent parser over that
//! closed grammar.
//!
//! Supported syntax: dotted/indexed paths rooted at `item` or `items`
//! (`item.score`, `items[0].tag`), number/string/bool/null literals,
//! comparisons (`==`, `!=`, `<`, `<=`, `>`, `>=`), boolean combinators
//! (`&&`, `||`, `!`) and parentheses.
//!
//! Parse and evaluation failures are reported as errors; the executor treats
//! both as falsy and takes the `else` branch.

use miette::Diagnostic;
use serde_json::Value;
use thiserror::Error;

/// Errors raised while parsing or evaluating a condition expression.
#[derive(Debug, Error, Diagnostic)]
pub enum CondError {
    #[error("condition parse error: {0}")]
    #[diagnostic(code(loomflow::condition::parse))]
    Parse(String),

    #[error("condition evaluation error: {0}")]
    #[diagnostic(code(loomflow::condition::eval))]
    Eval(String),
}

/// A parsed, reusable condition expression.
#[derive(Debug, Clone)]
pub struct Condition {
    ast: Expr,
}

impl Condition {
    /// Parse an expression source string.
    pub fn parse(src: &str) -> Result<Self, CondError> {
        let tokens = tokenize(src)?;
        let mut parser = Parser { tokens, pos: 0 };
        let ast = parser.parse_or()?;
        if parser.pos != parser.tokens.len() {
            return Err(CondError::Parse(format!(
                "unexpected trailing input at token {}",
                parser.pos
            )));
        }
        Ok(Self { ast })
    }

    /// Evaluate against the two bindings and coerce the result to a boolean.
    pub fn evaluate(&self, item: &Value, items: &Value) -> Result<bool, CondError> {
        let value = eval(&self.ast, item, items)?;
        Ok(truthy(&value))
    }
}

/// JSON truthiness: `null`, `false`, `0`, empty strings, arrays and objects
/// are falsy; everything else is truthy.
#[must_use]
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Resolve a dotted/indexed field path (`a.b[1].c`) against a JSON value.
///
/// Returns `None` when any segment is missing or the shapes do not match.
/// Shared by the transform nodes, which express their field selections in the
/// same restricted path syntax.
#[must_use]
pub fn resolve_path(root: &Value, path: &str) -> Option<Value> {
    let segments = parse_path_segments(path).ok()?;
    let mut current = root;
    for segment in &segments {
        match segment {
            Seg::Field(name) => current = current.as_object()?.get(name)?,
            Seg::Index(idx) => current = current.as_array()?.get(*idx)?,
        }
    }
    Some(current.clone())
}

fn parse_path_segments(path: &str) -> Result<Vec<Seg>, CondError> {
    let tokens = tokenize(path)?;
    let mut parser = Parser { tokens, pos: 0 };
    let first = match parser.next() {
        Some(Token::Ident(name)) => Seg::Field(name),
        other => {
            return Err(CondError::Parse(format!(
                "path must start with a field name, got {other:?}"
            )));
        }
    };
    let mut segments = vec![first];
    parser.parse_path_tail(&mut segments)?;
    if parser.pos != parser.tokens.len() {
        return Err(CondError::Parse("unexpected trailing path input".into()));
    }
    Ok(segments)
}

#[derive(Debug, Clone)]
enum Expr {
    Or(Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Cmp(Box<Expr>, CmpOp, Box<Expr>),
    Len(Box<Expr>),
    Lit(Value),
    Path { root: Root, segments: Vec<Seg> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Root {
    Item,
    Items,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Seg {
    Field(String),
    Index(usize),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Str(String),
    OpenParen,
    CloseParen,
    OpenBracket,
    CloseBracket,
    Dot,
    AndAnd,
    OrOr,
    Bang,
    Cmp(CmpOp),
}

fn tokenize(src: &str) -> Result<Vec<Token>, CondError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = src.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\r' | '\n' => i += 1,
            '(' => {
                tokens.push(Token::OpenParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::CloseParen);
                i += 1;
            }
            '[' => {
                tokens.push(Token::OpenBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::CloseBracket);
                i += 1;
            }
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            '&' if chars.get(i + 1) == Some(&'&') => {
                tokens.push(Token::AndAnd);
                i += 2;
            }
            '|' if chars.get(i + 1) == Some(&'|') => {
                tokens.push(Token::OrOr);
                i += 2;
            }
            '=' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Cmp(CmpOp::Eq));
                i += 2;
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Cmp(CmpOp::Ne));
                i += 2;
            }
            '!' => {
                tokens.push(Token::Bang);
                i += 1;
            }
            '<' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Cmp(CmpOp::Le));
                i += 2;
            }
            '<' => {
                tokens.push(Token::Cmp(CmpOp::Lt));
                i += 1;
            }
            '>' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Cmp(CmpOp::Ge));
                i += 2;
            }
            '>' => {
                tokens.push(Token::Cmp(CmpOp::Gt));
                i += 1;
            }
            '\'' | '"' => {
                let quote = c;
                let mut text = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(&ch) => {
                            text.push(ch);
                            i += 1;
                        }
                        None => return Err(CondError::Parse("unterminated string".into())),
                    }
                }
                tokens.push(Token::Str(text));
            }
            '-' | '0'..='9' => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let number = text
                    .parse::<f64>()
                    .map_err(|_| CondError::Parse(format!("bad number literal '{text}'")))?;
                tokens.push(Token::Number(number));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(Token::Ident(word));
            }
            other => return Err(CondError::Parse(format!("unexpected character '{other}'"))),
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, expected: &Token) -> Result<(), CondError> {
        match self.next() {
            Some(ref token) if token == expected => Ok(()),
            other => Err(CondError::Parse(format!(
                "expected {expected:?}, got {other:?}"
            ))),
        }
    }

    fn parse_or(&mut self) -> Result<Expr, CondError> {
        let mut left = self.parse_and()?;
        while matches!(self.peek(), Some(Token::OrOr)) {
            self.next();
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, CondError> {
        let mut left = self.parse_not()?;
        while matches!(self.peek(), Some(Token::AndAnd)) {
            self.next();
            let right = self.parse_not()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, CondError> {
        if matches!(self.peek(), Some(Token::Bang)) {
            self.next();
            return Ok(Expr::Not(Box::new(self.parse_not()?)));
        }
        self.parse_cmp()
    }

    fn parse_cmp(&mut self) -> Result<Expr, CondError> {
        let left = self.parse_operand()?;
        if let Some(Token::Cmp(op)) = self.peek().cloned() {
            self.next();
            let right = self.parse_operand()?;
            return Ok(Expr::Cmp(Box::new(left), op, Box::new(right)));
        }
        Ok(left)
    }

    fn parse_operand(&mut self) -> Result<Expr, CondError> {
        match self.next() {
            Some(Token::OpenParen) => {
                let inner = self.parse_or()?;
                self.expect(&Token::CloseParen)?;
                Ok(inner)
            }
            Some(Token::Number(n)) => Ok(Expr::Lit(number_value(n))),
            Some(Token::Str(s)) => Ok(Expr::Lit(Value::String(s))),
            Some(Token::Ident(word)) => match word.as_str() {
                "true" => Ok(Expr::Lit(Value::Bool(true))),
                "false" => Ok(Expr::Lit(Value::Bool(false))),
                "null" => Ok(Expr::Lit(Value::Null)),
                "len" => {
                    self.expect(&Token::OpenParen)?;
                    let inner = self.parse_or()?;
                    self.expect(&Token::CloseParen)?;
                    Ok(Expr::Len(Box::new(inner)))
                }
                "item" => self.parse_path(Root::Item),
                "items" => self.parse_path(Root::Items),
                other => Err(CondError::Parse(format!(
                    "unknown binding '{other}' (only item, items and len are in scope)"
                ))),
            },
            other => Err(CondError::Parse(format!("unexpected token {other:?}"))),
        }
    }

    fn parse_path(&mut self, root: Root) -> Result<Expr, CondError> {
        let mut segments = Vec::new();
        self.parse_path_tail(&mut segments)?;
        Ok(Expr::Path { root, segments })
    }

    fn parse_path_tail(&mut self, segments: &mut Vec<Seg>) -> Result<(), CondError> {
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.next();
                    match self.next() {
                        Some(Token::Ident(name)) => segments.push(Seg::Field(name)),
                        other => {
                            return Err(CondError::Parse(format!(
                                "expected field name after '.', got {other:?}"
                            )));
                        }
                    }
                }
                Some(Token::OpenBracket) => {
                    self.next();
                    match self.next() {
                        Some(Token::Number(n)) if n >= 0.0 && n.fract() == 0.0 => {
                            segments.push(Seg::Index(n as usize));
                        }
                        other => {
                            return Err(CondError::Parse(format!(
                                "expected non-negative integer index, got {other:?}"
                            )));
                        }
                    }
                    self.expect(&Token::CloseBracket)?;
                }
                _ => return Ok(()),
            }
        }
    }
}

fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < (i64::MAX as f64) {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}

fn eval(expr: &Expr, item: &Value, items: &Value) -> Result<Value, CondError> {
    match expr {
        Expr::Or(l, r) => {
            let left = eval(l, item, items)?;
            if truthy(&left) {
                Ok(left)
            } else {
                eval(r, item, items)
            }
        }
        Expr::And(l, r) => {
            let left = eval(l, item, items)?;
            if truthy(&left) {
                eval(r, item, items)
            } else {
                Ok(left)
            }
        }
        Expr::Not(inner) => Ok(Value::Bool(!truthy(&eval(inner, item, items)?))),
        Expr::Cmp(l, op, r) => {
            let left = eval(l, item, items)?;
            let right = eval(r, item, items)?;
            compare(&left, *op, &right).map(Value::Bool)
        }
        Expr::Len(inner) => {
            let value = eval(inner, item, items)?;
            let len = match &value {
                Value::Array(a) => a.len(),
                Value::String(s) => s.chars().count(),
                Value::Object(o) => o.len(),
                other => {
                    return Err(CondError::Eval(format!("len() of non-collection {other}")));
                }
            };
            Ok(Value::from(len as u64))
        }
        Expr::Lit(value) => Ok(value.clone()),
        Expr::Path { root, segments } => {
            let base = match root {
                Root::Item => item,
                Root::Items => items,
            };
            let mut current = base;
            for segment in segments {
                let next = match segment {
                    Seg::Field(name) => current.as_object().and_then(|o| o.get(name)),
                    Seg::Index(idx) => current.as_array().and_then(|a| a.get(*idx)),
                };
                match next {
                    Some(value) => current = value,
                    // Missing segments read as null, which is falsy.
                    None => return Ok(Value::Null),
                }
            }
            Ok(current.clone())
        }
    }
}

fn compare(left: &Value, op: CmpOp, right: &Value) -> Result<bool, CondError> {
    match op {
        CmpOp::Eq => Ok(left == right),
        CmpOp::Ne => Ok(left != right),
        CmpOp::Lt | CmpOp::Le | CmpOp::Gt | CmpOp::Ge => {
            let ordering = match (left, right) {
                (Value::Number(a), Value::Number(b)) => {
                    let (a, b) = (a.as_f64().unwrap_or(f64::NAN), b.as_f64().unwrap_or(f64::NAN));
                    a.partial_cmp(&b)
                        .ok_or_else(|| CondError::Eval("NaN in numeric comparison".into()))?
                }
                (Value::String(a), Value::String(b)) => a.cmp(b),
                (l, r) => {
                    return Err(CondError::Eval(format!(
                        "cannot order {l} against {r}"
                    )));
                }
            };
            Ok(match op {
                CmpOp::Lt => ordering.is_lt(),
                CmpOp::Le => ordering.is_le(),
                CmpOp::Gt => ordering.is_gt(),
                CmpOp::Ge => ordering.is_ge(),
                CmpOp::Eq | CmpOp::Ne => unreachable!(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn check(expr: &str, item: Value, items: Value) -> bool {
        Condition::parse(expr)
            .unwrap()
            .evaluate(&item, &items)
            .unwrap()
    }

    #[test]
    fn len_of_items() {
        assert!(check("len(items) > 0", json!({}), json!([{"a": 1}])));
        assert!(!check("len(items) > 0", json!({}), json!([])));
    }

    #[test]
    fn field_paths_and_comparisons() {
        let item = json!({"score": 5, "tag": "hot", "nested": {"flag": true}});
        let items = json!([item.clone()]);
        assert!(check("item.score >= 5", item.clone(), items.clone()));
        assert!(check("item.tag == 'hot'", item.clone(), items.clone()));
        assert!(check("item.nested.flag", item.clone(), items.clone()));
        assert!(!check("item.missing", item, items));
    }

    #[test]
    fn boolean_combinators() {
        let item = json!({"a": 1, "b": 0});
        let items = json!([item.clone()]);
        assert!(check("item.a == 1 && !item.b", item.clone(), items.clone()));
        assert!(check("item.b || item.a", item, items));
    }

    #[test]
    fn indexed_paths() {
        let items = json!([{"tag": "x"}, {"tag": "y"}]);
        assert!(check("items[1].tag == 'y'", json!({}), items));
    }

    #[test]
    fn parse_failures() {
        assert!(Condition::parse("item &&").is_err());
        assert!(Condition::parse("exec('rm -rf')").is_err());
        assert!(Condition::parse("len(items").is_err());
    }

    #[test]
    fn eval_failures_do_not_panic() {
        let cond = Condition::parse("item.a < 'b'").unwrap();
        assert!(cond.evaluate(&json!({"a": 1}), &json!([])).is_err());
    }

    #[test]
    fn resolve_path_walks_nesting() {
        let root = json!({"a": {"b": [10, 20]}});
        assert_eq!(resolve_path(&root, "a.b[1]"), Some(json!(20)));
        assert_eq!(resolve_path(&root, "a.c"), None);
        assert_eq!(resolve_path(&root, "a"), Some(json!({"b": [10, 20]})));
    }
}
