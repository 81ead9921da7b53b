//! Default expression evaluator
//!
//! A small, dependency-free evaluator covering what guard and precondition
//! expressions need in tests and simple deployments: dotted-path lookup into
//! the scope, literals, comparisons, and boolean connectives.
//!
//! ```text
//! expr       := or
//! or         := and ( ("||" | "or") and )*
//! and        := unary ( ("&&" | "and") unary )*
//! unary      := ("!" | "not") unary | comparison
//! comparison := term ( ("=" | "==" | "!=" | "<" | "<=" | ">" | ">=") term )?
//! term       := literal | path | "(" expr ")"
//! ```
//!
//! Missing paths evaluate to `null`, so `state.missing = "x"` is simply
//! false rather than an error. Numbers compare as floats; strings compare
//! lexicographically. Any richer syntax belongs in a real expression engine
//! plugged into the [`ExpressionEvaluator`] port.

use serde_json::{Map, Value};

use crate::error::{CoreError, Result};
use crate::ports::{is_truthy, ExpressionEvaluator};

/// The default path/literal/comparison evaluator
#[derive(Debug, Clone, Default)]
pub struct PathExpressionEvaluator;

impl PathExpressionEvaluator {
    /// Create the evaluator
    pub fn new() -> Self {
        Self
    }
}

impl ExpressionEvaluator for PathExpressionEvaluator {
    fn evaluate(&self, expr: &str, scope: &Map<String, Value>) -> Result<Value> {
        let tokens = tokenize(expr).map_err(|msg| CoreError::expression(expr, msg))?;
        let mut parser = Parser {
            tokens: &tokens,
            pos: 0,
            scope,
        };
        let value = parser.or_expr().map_err(|msg| CoreError::expression(expr, msg))?;
        if parser.pos != tokens.len() {
            return Err(CoreError::expression(expr, "trailing input"));
        }
        Ok(value)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Str(String),
    True,
    False,
    Null,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Not,
    Dot,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> std::result::Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&ch) = chars.peek() {
        match ch {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '.' => {
                chars.next();
                tokens.push(Token::Dot);
            }
            '=' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                }
                tokens.push(Token::Eq);
            }
            '!' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Ne);
                } else {
                    tokens.push(Token::Not);
                }
            }
            '<' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Le);
                } else {
                    tokens.push(Token::Lt);
                }
            }
            '>' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Ge);
                } else {
                    tokens.push(Token::Gt);
                }
            }
            '&' => {
                chars.next();
                if chars.next() != Some('&') {
                    return Err("expected '&&'".to_string());
                }
                tokens.push(Token::And);
            }
            '|' => {
                chars.next();
                if chars.next() != Some('|') {
                    return Err("expected '||'".to_string());
                }
                tokens.push(Token::Or);
            }
            '"' | '\'' => {
                let quote = ch;
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some(c) if c == quote => break,
                        Some('\\') => match chars.next() {
                            Some(esc) => s.push(esc),
                            None => return Err("unterminated escape".to_string()),
                        },
                        Some(c) => s.push(c),
                        None => return Err("unterminated string literal".to_string()),
                    }
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() || c == '-' => {
                let mut s = String::new();
                s.push(c);
                chars.next();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_digit() || c == '.' {
                        // a dot followed by a non-digit is path syntax, not a decimal
                        if c == '.' {
                            let mut lookahead = chars.clone();
                            lookahead.next();
                            if !lookahead.peek().map_or(false, |n| n.is_ascii_digit()) {
                                break;
                            }
                        }
                        s.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let n: f64 = s.parse().map_err(|_| format!("bad number '{}'", s))?;
                tokens.push(Token::Number(n));
            }
            c if c.is_alphanumeric() || c == '_' => {
                let mut s = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_alphanumeric() || c == '_' || c == '-' {
                        s.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(match s.as_str() {
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    _ => Token::Ident(s),
                });
            }
            other => return Err(format!("unexpected character '{}'", other)),
        }
    }

    Ok(tokens)
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    scope: &'a Map<String, Value>,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<&Token> {
        let token = self.tokens.get(self.pos);
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn or_expr(&mut self) -> std::result::Result<Value, String> {
        let mut left = self.and_expr()?;
        while self.peek() == Some(&Token::Or) {
            self.bump();
            let right = self.and_expr()?;
            left = Value::Bool(is_truthy(&left) || is_truthy(&right));
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> std::result::Result<Value, String> {
        let mut left = self.unary()?;
        while self.peek() == Some(&Token::And) {
            self.bump();
            let right = self.unary()?;
            left = Value::Bool(is_truthy(&left) && is_truthy(&right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> std::result::Result<Value, String> {
        if self.peek() == Some(&Token::Not) {
            self.bump();
            let value = self.unary()?;
            return Ok(Value::Bool(!is_truthy(&value)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> std::result::Result<Value, String> {
        let left = self.term()?;
        let op = match self.peek() {
            Some(Token::Eq) => Cmp::Eq,
            Some(Token::Ne) => Cmp::Ne,
            Some(Token::Lt) => Cmp::Lt,
            Some(Token::Le) => Cmp::Le,
            Some(Token::Gt) => Cmp::Gt,
            Some(Token::Ge) => Cmp::Ge,
            _ => return Ok(left),
        };
        self.bump();
        let right = self.term()?;
        Ok(Value::Bool(compare(&left, &right, op)))
    }

    fn term(&mut self) -> std::result::Result<Value, String> {
        match self.bump().cloned() {
            Some(Token::LParen) => {
                let value = self.or_expr()?;
                match self.bump() {
                    Some(Token::RParen) => Ok(value),
                    _ => Err("expected ')'".to_string()),
                }
            }
            Some(Token::Number(n)) => Ok(serde_json::Number::from_f64(n)
                .map(Value::Number)
                .unwrap_or(Value::Null)),
            Some(Token::Str(s)) => Ok(Value::String(s)),
            Some(Token::True) => Ok(Value::Bool(true)),
            Some(Token::False) => Ok(Value::Bool(false)),
            Some(Token::Null) => Ok(Value::Null),
            Some(Token::Ident(first)) => {
                let mut segments = vec![first];
                while self.peek() == Some(&Token::Dot) {
                    self.bump();
                    match self.bump().cloned() {
                        Some(Token::Ident(next)) => segments.push(next),
                        _ => return Err("expected identifier after '.'".to_string()),
                    }
                }
                Ok(lookup(self.scope, &segments))
            }
            other => Err(format!("unexpected token {:?}", other)),
        }
    }
}

#[derive(Clone, Copy)]
enum Cmp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

fn compare(left: &Value, right: &Value, op: Cmp) -> bool {
    match op {
        Cmp::Eq => loose_eq(left, right),
        Cmp::Ne => !loose_eq(left, right),
        Cmp::Lt | Cmp::Le | Cmp::Gt | Cmp::Ge => {
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
            match ordering {
                Some(ord) => match op {
                    Cmp::Lt => ord.is_lt(),
                    Cmp::Le => ord.is_le(),
                    Cmp::Gt => ord.is_gt(),
                    Cmp::Ge => ord.is_ge(),
                    _ => unreachable!(),
                },
                None => false,
            }
        }
    }
}

// numbers compare as floats so 1 == 1.0; everything else uses Value equality
fn loose_eq(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        },
        _ => left == right,
    }
}

fn lookup(scope: &Map<String, Value>, segments: &[String]) -> Value {
    let mut current = match scope.get(&segments[0]) {
        Some(value) => value,
        None => return Value::Null,
    };
    for segment in &segments[1..] {
        match current {
            Value::Object(map) => match map.get(segment) {
                Some(value) => current = value,
                None => return Value::Null,
            },
            _ => return Value::Null,
        }
    }
    current.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scope() -> Map<String, Value> {
        json!({
            "status": "OK",
            "state": {"ready": true, "count": 3},
            "client": {"tier": "gold", "score": 7.5},
            "empty": ""
        })
        .as_object()
        .cloned()
        .unwrap()
    }

    fn eval(expr: &str) -> Value {
        PathExpressionEvaluator::new().evaluate(expr, &scope()).unwrap()
    }

    #[test]
    fn path_lookup_resolves_nested_keys() {
        assert_eq!(eval("status"), json!("OK"));
        assert_eq!(eval("state.ready"), json!(true));
        assert_eq!(eval("client.missing"), Value::Null);
        assert_eq!(eval("missing.deep.path"), Value::Null);
    }

    #[test]
    fn comparisons() {
        assert_eq!(eval("status = \"OK\""), json!(true));
        assert_eq!(eval("status == 'OK'"), json!(true));
        assert_eq!(eval("status != \"OK\""), json!(false));
        assert_eq!(eval("state.count > 2"), json!(true));
        assert_eq!(eval("state.count <= 2"), json!(false));
        assert_eq!(eval("client.score >= 7.5"), json!(true));
        assert_eq!(eval("state.count = 3.0"), json!(true));
    }

    #[test]
    fn boolean_connectives() {
        assert_eq!(eval("state.ready && status = \"OK\""), json!(true));
        assert_eq!(eval("state.ready and empty"), json!(false));
        assert_eq!(eval("empty || state.count"), json!(true));
        assert_eq!(eval("!empty"), json!(true));
        assert_eq!(eval("not state.ready"), json!(false));
        assert_eq!(eval("(empty or false) or (state.count > 1 and true)"), json!(true));
    }

    #[test]
    fn literals() {
        assert_eq!(eval("true"), json!(true));
        assert_eq!(eval("null"), Value::Null);
        assert_eq!(eval("-2 < 1"), json!(true));
    }

    #[test]
    fn ordering_on_mixed_types_is_false() {
        assert_eq!(eval("status > 1"), json!(false));
    }

    #[test]
    fn syntax_errors_are_reported() {
        let evaluator = PathExpressionEvaluator::new();
        assert!(evaluator.evaluate("status =", &scope()).is_err());
        assert!(evaluator.evaluate("(status", &scope()).is_err());
        assert!(evaluator.evaluate("a ~ b", &scope()).is_err());
        assert!(evaluator.evaluate("status status", &scope()).is_err());
    }

    #[test]
    fn evaluate_all_truthy_short_circuits() {
        let evaluator = PathExpressionEvaluator::new();
        let exprs = vec!["state.ready".to_string(), "empty".to_string()];
        assert!(!evaluator.evaluate_all_truthy(&exprs, &scope()).unwrap());
        assert!(evaluator.evaluate_all_truthy(&[], &scope()).unwrap());
    }
}
