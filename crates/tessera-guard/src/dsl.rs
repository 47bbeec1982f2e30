//! The routing-policy expression DSL.
//!
//! A safe, expression-only sublanguage evaluated against a UOW's attribute
//! map plus a closed set of reserved metadata names. The grammar admits
//! literals (numbers, strings, booleans, null, lists and tuples), variable
//! references, the comparisons `< <= > >= == !=`, membership `in` /
//! `not in`, the logical connectives `and` / `or` / `not`, and parentheses.
//! Nothing else parses: no function calls, attribute access, subscripts,
//! arithmetic or bitwise operators.
//!
//! Validation runs once at blueprint import ([`validate`]); evaluation
//! ([`evaluate`]) interprets the parsed tree against an attribute map with
//! no access to anything outside it.

use serde_json::Value;
use thiserror::Error;

use tessera_types::AttrMap;

/// Reserved metadata names available in every evaluation scope.
pub const RESERVED_METADATA: [&str; 5] = [
    "uow_id",
    "child_count",
    "finished_child_count",
    "status",
    "parent_id",
];

/// Errors raised by the DSL.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DslError {
    /// Malformed input or a forbidden construct.
    #[error("DSL syntax error at position {position}: {message}")]
    Syntax {
        /// Byte offset of the offending token.
        position: usize,
        /// What went wrong.
        message: String,
    },

    /// A variable outside the permitted set (import time) or missing from
    /// the scope (runtime).
    #[error("DSL attribute error: '{0}' is not available")]
    Attribute(String),

    /// A runtime type mismatch.
    #[error("DSL evaluation error: {0}")]
    Evaluation(String),
}

impl DslError {
    fn syntax(position: usize, message: impl Into<String>) -> Self {
        Self::Syntax {
            position,
            message: message.into(),
        }
    }
}

//─────────────────────────────
//  Tokens
//─────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    Null,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    And,
    Or,
    Not,
    In,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
}

fn lex(input: &str) -> Result<Vec<(Token, usize)>, DslError> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        // The language itself is ASCII; only string literals may carry
        // arbitrary UTF-8 (handled in the quote branch below).
        if !bytes[i].is_ascii() {
            return Err(DslError::syntax(i, "non-ASCII input outside a string literal"));
        }
        let c = bytes[i] as char;
        match c {
            ' ' | '\t' | '\r' | '\n' => i += 1,
            '(' => {
                tokens.push((Token::LParen, i));
                i += 1;
            }
            ')' => {
                tokens.push((Token::RParen, i));
                i += 1;
            }
            '[' => {
                tokens.push((Token::LBracket, i));
                i += 1;
            }
            ']' => {
                tokens.push((Token::RBracket, i));
                i += 1;
            }
            ',' => {
                tokens.push((Token::Comma, i));
                i += 1;
            }
            '<' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push((Token::Le, i));
                    i += 2;
                } else if bytes.get(i + 1) == Some(&b'<') {
                    return Err(DslError::syntax(i, "bitwise operators are not allowed"));
                } else {
                    tokens.push((Token::Lt, i));
                    i += 1;
                }
            }
            '>' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push((Token::Ge, i));
                    i += 2;
                } else if bytes.get(i + 1) == Some(&b'>') {
                    return Err(DslError::syntax(i, "bitwise operators are not allowed"));
                } else {
                    tokens.push((Token::Gt, i));
                    i += 1;
                }
            }
            '=' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push((Token::Eq, i));
                    i += 2;
                } else {
                    // A single '=' reads as equality; assignment does not
                    // exist in this language.
                    tokens.push((Token::Eq, i));
                    i += 1;
                }
            }
            '!' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push((Token::Ne, i));
                    i += 2;
                } else {
                    return Err(DslError::syntax(i, "unexpected '!'"));
                }
            }
            '\'' | '"' => {
                let quote = c;
                let start = i;
                i += 1;
                let mut text = String::new();
                loop {
                    match input[i..].chars().next() {
                        None => return Err(DslError::syntax(start, "unterminated string literal")),
                        Some('\\') => {
                            match input[i + 1..].chars().next() {
                                Some('\\') => text.push('\\'),
                                Some('\'') => text.push('\''),
                                Some('"') => text.push('"'),
                                Some(other) => {
                                    return Err(DslError::syntax(
                                        i,
                                        format!("unsupported escape: \\{other}"),
                                    ))
                                }
                                None => {
                                    return Err(DslError::syntax(start, "unterminated string literal"))
                                }
                            }
                            i += 2;
                        }
                        Some(ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(ch) => {
                            text.push(ch);
                            i += ch.len_utf8();
                        }
                    }
                }
                tokens.push((Token::Str(text), start));
            }
            '0'..='9' => {
                let start = i;
                let mut is_float = false;
                while i < bytes.len() {
                    match bytes[i] as char {
                        '0'..='9' => i += 1,
                        '.' if !is_float => {
                            is_float = true;
                            i += 1;
                        }
                        _ => break,
                    }
                }
                let text = &input[start..i];
                if is_float {
                    let value = text
                        .parse::<f64>()
                        .map_err(|_| DslError::syntax(start, format!("bad number: {text}")))?;
                    tokens.push((Token::Float(value), start));
                } else {
                    let value = text
                        .parse::<i64>()
                        .map_err(|_| DslError::syntax(start, format!("bad number: {text}")))?;
                    tokens.push((Token::Int(value), start));
                }
            }
            '-' => {
                // Literal negative numbers only; there is no arithmetic.
                let start = i;
                i += 1;
                if !matches!(bytes.get(i).map(|b| *b as char), Some('0'..='9')) {
                    return Err(DslError::syntax(start, "arithmetic operators are not allowed"));
                }
                let digits_start = i;
                let mut is_float = false;
                while i < bytes.len() {
                    match bytes[i] as char {
                        '0'..='9' => i += 1,
                        '.' if !is_float => {
                            is_float = true;
                            i += 1;
                        }
                        _ => break,
                    }
                }
                let text = &input[digits_start..i];
                if is_float {
                    let value = text
                        .parse::<f64>()
                        .map_err(|_| DslError::syntax(start, format!("bad number: -{text}")))?;
                    tokens.push((Token::Float(-value), start));
                } else {
                    let value = text
                        .parse::<i64>()
                        .map_err(|_| DslError::syntax(start, format!("bad number: -{text}")))?;
                    tokens.push((Token::Int(-value), start));
                }
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < bytes.len() {
                    let ch = bytes[i] as char;
                    if ch.is_alphanumeric() || ch == '_' {
                        i += 1;
                    } else {
                        break;
                    }
                }
                let word = &input[start..i];
                let token = match word {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "in" => Token::In,
                    "true" | "True" => Token::Bool(true),
                    "false" | "False" => Token::Bool(false),
                    "null" | "None" => Token::Null,
                    _ => Token::Ident(word.to_string()),
                };
                tokens.push((token, start));
            }
            other => {
                return Err(DslError::syntax(
                    i,
                    format!("unsupported character: '{other}'"),
                ))
            }
        }
    }

    Ok(tokens)
}

//─────────────────────────────
//  AST and parser
//─────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum CmpOp {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    In,
    NotIn,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Var(String),
    List(Vec<Expr>),
    Compare {
        left: Box<Expr>,
        op: CmpOp,
        right: Box<Expr>,
    },
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Not(Box<Expr>),
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn position(&self) -> usize {
        self.tokens
            .get(self.pos)
            .map(|(_, p)| *p)
            .unwrap_or(usize::MAX)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(t, _)| t.clone());
        self.pos += 1;
        token
    }

    fn expect(&mut self, expected: Token, what: &str) -> Result<(), DslError> {
        let position = self.position();
        match self.advance() {
            Some(token) if token == expected => Ok(()),
            _ => Err(DslError::syntax(position, format!("expected {what}"))),
        }
    }

    fn parse_expression(&mut self) -> Result<Expr, DslError> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr, DslError> {
        let first = self.parse_and()?;
        if self.peek() != Some(&Token::Or) {
            return Ok(first);
        }
        let mut terms = vec![first];
        while self.peek() == Some(&Token::Or) {
            self.advance();
            terms.push(self.parse_and()?);
        }
        Ok(Expr::Or(terms))
    }

    fn parse_and(&mut self) -> Result<Expr, DslError> {
        let first = self.parse_not()?;
        if self.peek() != Some(&Token::And) {
            return Ok(first);
        }
        let mut terms = vec![first];
        while self.peek() == Some(&Token::And) {
            self.advance();
            terms.push(self.parse_not()?);
        }
        Ok(Expr::And(terms))
    }

    fn parse_not(&mut self) -> Result<Expr, DslError> {
        if self.peek() == Some(&Token::Not) {
            self.advance();
            // 'not in' never reaches here: it is consumed inside
            // parse_comparison after an operand.
            let operand = self.parse_not()?;
            return Ok(Expr::Not(Box::new(operand)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, DslError> {
        let left = self.parse_operand()?;

        let op = match self.peek() {
            Some(Token::Lt) => Some(CmpOp::Lt),
            Some(Token::Le) => Some(CmpOp::Le),
            Some(Token::Gt) => Some(CmpOp::Gt),
            Some(Token::Ge) => Some(CmpOp::Ge),
            Some(Token::Eq) => Some(CmpOp::Eq),
            Some(Token::Ne) => Some(CmpOp::Ne),
            Some(Token::In) => Some(CmpOp::In),
            Some(Token::Not) => {
                // Only 'not in' is legal after an operand.
                let position = self.position();
                self.advance();
                if self.peek() == Some(&Token::In) {
                    Some(CmpOp::NotIn)
                } else {
                    return Err(DslError::syntax(position, "expected 'in' after 'not'"));
                }
            }
            _ => None,
        };

        match op {
            None => Ok(left),
            Some(op) => {
                if !matches!(op, CmpOp::NotIn) {
                    self.advance();
                } else {
                    // 'not' was already consumed; consume the 'in'.
                    self.advance();
                }
                let right = self.parse_operand()?;
                Ok(Expr::Compare {
                    left: Box::new(left),
                    op,
                    right: Box::new(right),
                })
            }
        }
    }

    fn parse_operand(&mut self) -> Result<Expr, DslError> {
        let position = self.position();
        match self.advance() {
            Some(Token::Int(n)) => Ok(Expr::Literal(Value::from(n))),
            Some(Token::Float(f)) => Ok(Expr::Literal(
                serde_json::Number::from_f64(f)
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
            )),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Bool(b)) => Ok(Expr::Literal(Value::Bool(b))),
            Some(Token::Null) => Ok(Expr::Literal(Value::Null)),
            Some(Token::Ident(name)) => Ok(Expr::Var(name)),
            Some(Token::LParen) => {
                let inner = self.parse_expression()?;
                // A trailing comma makes this a tuple literal.
                if self.peek() == Some(&Token::Comma) {
                    let mut items = vec![inner];
                    while self.peek() == Some(&Token::Comma) {
                        self.advance();
                        if self.peek() == Some(&Token::RParen) {
                            break;
                        }
                        items.push(self.parse_expression()?);
                    }
                    self.expect(Token::RParen, "')'")?;
                    return Ok(Expr::List(items));
                }
                self.expect(Token::RParen, "')'")?;
                Ok(inner)
            }
            Some(Token::LBracket) => {
                let mut items = Vec::new();
                if self.peek() == Some(&Token::RBracket) {
                    self.advance();
                    return Ok(Expr::List(items));
                }
                loop {
                    items.push(self.parse_expression()?);
                    match self.advance() {
                        Some(Token::Comma) => {
                            if self.peek() == Some(&Token::RBracket) {
                                self.advance();
                                break;
                            }
                        }
                        Some(Token::RBracket) => break,
                        _ => return Err(DslError::syntax(position, "expected ',' or ']'")),
                    }
                }
                Ok(Expr::List(items))
            }
            _ => Err(DslError::syntax(position, "expected an operand")),
        }
    }
}

fn parse(condition: &str) -> Result<Expr, DslError> {
    let tokens = lex(condition)?;
    if tokens.is_empty() {
        return Err(DslError::syntax(0, "empty condition"));
    }
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_expression()?;
    if parser.pos != parser.tokens.len() {
        return Err(DslError::syntax(
            parser.position(),
            "unexpected trailing input",
        ));
    }
    Ok(expr)
}

//─────────────────────────────
//  Validation and evaluation
//─────────────────────────────

fn collect_vars<'a>(expr: &'a Expr, out: &mut Vec<&'a str>) {
    match expr {
        Expr::Var(name) => out.push(name),
        Expr::List(items) | Expr::And(items) | Expr::Or(items) => {
            for item in items {
                collect_vars(item, out);
            }
        }
        Expr::Compare { left, right, .. } => {
            collect_vars(left, out);
            collect_vars(right, out);
        }
        Expr::Not(inner) => collect_vars(inner, out),
        Expr::Literal(_) => {}
    }
}

/// Validate a condition at blueprint-import time: it must parse, and every
/// variable it references must be a declared attribute or reserved metadata.
pub fn validate<S: std::hash::BuildHasher>(
    condition: &str,
    permitted: &std::collections::HashSet<String, S>,
) -> Result<(), DslError> {
    let expr = parse(condition)?;
    let mut vars = Vec::new();
    collect_vars(&expr, &mut vars);
    for name in vars {
        if !permitted.contains(name) && !RESERVED_METADATA.contains(&name) {
            return Err(DslError::Attribute(name.to_string()));
        }
    }
    Ok(())
}

/// Evaluate a condition against an attribute map.
///
/// Missing variables raise [`DslError::Attribute`]; operand type mismatches
/// raise [`DslError::Evaluation`].
pub fn evaluate(condition: &str, scope: &AttrMap) -> Result<bool, DslError> {
    let expr = parse(condition)?;
    match eval(&expr, scope)? {
        Value::Bool(b) => Ok(b),
        other => Err(DslError::Evaluation(format!(
            "condition must produce a boolean, got {other}"
        ))),
    }
}

fn eval(expr: &Expr, scope: &AttrMap) -> Result<Value, DslError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Var(name) => scope
            .get(name)
            .cloned()
            .ok_or_else(|| DslError::Attribute(name.clone())),
        Expr::List(items) => {
            let values = items
                .iter()
                .map(|item| eval(item, scope))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Value::Array(values))
        }
        Expr::Not(inner) => match eval(inner, scope)? {
            Value::Bool(b) => Ok(Value::Bool(!b)),
            other => Err(DslError::Evaluation(format!(
                "'not' requires a boolean, got {other}"
            ))),
        },
        Expr::And(terms) => {
            for term in terms {
                match eval(term, scope)? {
                    Value::Bool(false) => return Ok(Value::Bool(false)),
                    Value::Bool(true) => {}
                    other => {
                        return Err(DslError::Evaluation(format!(
                            "'and' requires booleans, got {other}"
                        )))
                    }
                }
            }
            Ok(Value::Bool(true))
        }
        Expr::Or(terms) => {
            for term in terms {
                match eval(term, scope)? {
                    Value::Bool(true) => return Ok(Value::Bool(true)),
                    Value::Bool(false) => {}
                    other => {
                        return Err(DslError::Evaluation(format!(
                            "'or' requires booleans, got {other}"
                        )))
                    }
                }
            }
            Ok(Value::Bool(false))
        }
        Expr::Compare { left, op, right } => {
            let lhs = eval(left, scope)?;
            let rhs = eval(right, scope)?;
            compare(&lhs, op, &rhs).map(Value::Bool)
        }
    }
}

fn compare(lhs: &Value, op: &CmpOp, rhs: &Value) -> Result<bool, DslError> {
    match op {
        CmpOp::Eq => Ok(lhs == rhs),
        CmpOp::Ne => Ok(lhs != rhs),
        CmpOp::In => membership(lhs, rhs),
        CmpOp::NotIn => membership(lhs, rhs).map(|contained| !contained),
        ordered => {
            let ordering = order(lhs, rhs)?;
            Ok(match ordered {
                CmpOp::Lt => ordering == std::cmp::Ordering::Less,
                CmpOp::Le => ordering != std::cmp::Ordering::Greater,
                CmpOp::Gt => ordering == std::cmp::Ordering::Greater,
                CmpOp::Ge => ordering != std::cmp::Ordering::Less,
                _ => unreachable!("equality and membership handled above"),
            })
        }
    }
}

fn membership(needle: &Value, haystack: &Value) -> Result<bool, DslError> {
    match haystack {
        Value::Array(items) => Ok(items.contains(needle)),
        Value::String(text) => match needle {
            Value::String(sub) => Ok(text.contains(sub.as_str())),
            other => Err(DslError::Evaluation(format!(
                "'in' over a string requires a string operand, got {other}"
            ))),
        },
        other => Err(DslError::Evaluation(format!(
            "'in' requires a list or string, got {other}"
        ))),
    }
}

fn order(lhs: &Value, rhs: &Value) -> Result<std::cmp::Ordering, DslError> {
    match (lhs, rhs) {
        (Value::Number(a), Value::Number(b)) => {
            let a = a.as_f64().ok_or_else(|| bad_number(lhs))?;
            let b = b.as_f64().ok_or_else(|| bad_number(rhs))?;
            a.partial_cmp(&b)
                .ok_or_else(|| DslError::Evaluation("numbers are not comparable".to_string()))
        }
        (Value::String(a), Value::String(b)) => Ok(a.cmp(b)),
        (a, b) => Err(DslError::Evaluation(format!(
            "cannot order {a} against {b}"
        ))),
    }
}

fn bad_number(value: &Value) -> DslError {
    DslError::Evaluation(format!("{value} is not a finite number"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;

    fn scope(pairs: &[(&str, Value)]) -> AttrMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn permitted(names: &[&str]) -> HashSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn simple_comparisons() {
        let s = scope(&[("risk_score", json!(9)), ("amount", json!(1500))]);
        assert!(evaluate("risk_score > 8", &s).unwrap());
        assert!(!evaluate("risk_score > 10", &s).unwrap());
        assert!(evaluate("amount >= 1000", &s).unwrap());
        assert!(!evaluate("amount <= 1000", &s).unwrap());
    }

    #[test]
    fn string_comparisons() {
        let s = scope(&[("status", json!("ACTIVE"))]);
        assert!(evaluate("status == 'ACTIVE'", &s).unwrap());
        assert!(!evaluate("status == 'PENDING'", &s).unwrap());
        assert!(evaluate("status != 'FAILED'", &s).unwrap());
    }

    #[test]
    fn logical_connectives() {
        let s = scope(&[
            ("risk_score", json!(9)),
            ("amount", json!(500)),
            ("is_flagged", json!(true)),
        ]);
        assert!(evaluate("risk_score > 8 and amount < 1000", &s).unwrap());
        assert!(!evaluate("risk_score > 8 and amount > 1000", &s).unwrap());
        assert!(evaluate("risk_score > 100 or is_flagged", &s).unwrap());
        assert!(!evaluate("not is_flagged", &s).unwrap());
    }

    #[test]
    fn membership() {
        let s = scope(&[("status", json!("ACTIVE")), ("code", json!(7))]);
        assert!(evaluate("status in ['ACTIVE', 'PENDING']", &s).unwrap());
        assert!(evaluate("status not in ['FAILED']", &s).unwrap());
        assert!(evaluate("code in [1, 7, 9]", &s).unwrap());
        assert!(evaluate("status in ('ACTIVE', 'PENDING')", &s).unwrap());
    }

    #[test]
    fn null_comparison() {
        let s = scope(&[("parent_id", Value::Null)]);
        assert!(evaluate("parent_id == None", &s).unwrap());
        assert!(evaluate("parent_id == null", &s).unwrap());
    }

    #[test]
    fn parenthesized_grouping() {
        let s = scope(&[("a", json!(1)), ("b", json!(2)), ("c", json!(3))]);
        assert!(evaluate("(a == 1 or b == 0) and c == 3", &s).unwrap());
        assert!(!evaluate("a == 1 and (b == 0 or c == 0)", &s).unwrap());
    }

    #[test]
    fn missing_attribute_is_an_attribute_error() {
        let s = scope(&[]);
        assert_eq!(
            evaluate("ghost > 1", &s).unwrap_err(),
            DslError::Attribute("ghost".into())
        );
    }

    #[test]
    fn type_mismatch_is_an_evaluation_error() {
        let s = scope(&[("amount", json!("plenty"))]);
        assert!(matches!(
            evaluate("amount > 100", &s).unwrap_err(),
            DslError::Evaluation(_)
        ));
    }

    #[test]
    fn forbidden_constructs_fail_to_parse() {
        let s = scope(&[("a", json!(1))]);
        for condition in [
            "a + 1 > 0",
            "a * 2 == 2",
            "a | 1",
            "a << 2",
            "len(a) > 0",
            "a.b == 1",
            "a[0] == 1",
            "__import__",
        ] {
            let result = evaluate(condition, &s);
            assert!(
                !matches!(result, Ok(_)),
                "'{condition}' should not evaluate"
            );
        }
    }

    #[test]
    fn call_syntax_is_rejected() {
        // 'f(1)' parses 'f' then has trailing input; there is no call form.
        let err = parse("f(1)").unwrap_err();
        assert!(matches!(err, DslError::Syntax { .. }));
    }

    #[test]
    fn unbalanced_parentheses_are_syntax_errors() {
        assert!(matches!(parse("(a > 1"), Err(DslError::Syntax { .. })));
        assert!(matches!(parse("a > "), Err(DslError::Syntax { .. })));
        assert!(matches!(parse(""), Err(DslError::Syntax { .. })));
    }

    #[test]
    fn validation_accepts_declared_attributes_and_metadata() {
        let permitted = permitted(&["risk_score", "amount"]);
        validate("risk_score > 8 and amount < 1000", &permitted).unwrap();
        validate("child_count <= 5 and status == 'ACTIVE'", &permitted).unwrap();
        validate("parent_id == None", &permitted).unwrap();
    }

    #[test]
    fn validation_rejects_undeclared_attributes() {
        let permitted = permitted(&["risk_score"]);
        assert_eq!(
            validate("actor_secret == 1", &permitted).unwrap_err(),
            DslError::Attribute("actor_secret".into())
        );
    }

    #[test]
    fn string_literals_may_carry_utf8() {
        let s = scope(&[("note", json!("café"))]);
        assert!(evaluate("note == 'café'", &s).unwrap());
        // Outside string literals the language is ASCII.
        assert!(matches!(parse("café > 1"), Err(DslError::Syntax { .. })));
    }

    #[test]
    fn negative_number_literals_parse() {
        let s = scope(&[("delta", json!(-5))]);
        assert!(evaluate("delta == -5", &s).unwrap());
        assert!(evaluate("delta < -1", &s).unwrap());
    }

    #[test]
    fn non_boolean_result_is_rejected() {
        let s = scope(&[("amount", json!(5))]);
        assert!(matches!(
            evaluate("amount", &s).unwrap_err(),
            DslError::Evaluation(_)
        ));
    }
}
