//! The boolean expression language used by `Ingester.filter.expression`.
//! Leaves are dot-notated field paths; operators are
//! `= != > >= < <= IN NOT IN CONTAINS STARTS_WITH ENDS_WITH EXISTS NOT EXISTS`;
//! logical precedence is `NOT > AND > OR`, with parentheses to override.
//!
//! Parse failures never block ingestion: the caller falls back to list-based
//! rules for that source. Runtime evaluation errors (type mismatch, a
//! missing field without an `EXISTS` guard) do the same.

use std::fmt;

use serde_json::Value;

use crate::event::{Category, Event, Severity};

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Str(String),
    Num(f64),
    List(Vec<String>),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CmpOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    In,
    NotIn,
    Contains,
    StartsWith,
    EndsWith,
}

#[derive(Debug, Clone)]
pub enum Expr {
    Exists { path: String, negated: bool },
    Cmp { path: String, op: CmpOp, value: Literal },
    Macro(MacroKind),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MacroKind {
    IsCritical,
    IsHigh,
    IsSecurity,
    IsCompliance,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError(pub String);

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "expression parse error: {}", self.0)
    }
}

impl std::error::Error for ParseError {}

/// Runtime evaluation outcome. `Indeterminate` covers both a type mismatch
/// and a missing required field without an `EXISTS` guard — both fall
/// through to list-based rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalOutcome {
    True,
    False,
    Indeterminate,
}

pub fn parse(input: &str) -> Result<Expr, ParseError> {
    let tokens = tokenize(input)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_or()?;
    if parser.pos != parser.tokens.len() {
        return Err(ParseError(format!("unexpected trailing input at token {}", parser.pos)));
    }
    Ok(expr)
}

pub fn eval(expr: &Expr, event: &Event) -> EvalOutcome {
    match expr {
        Expr::Macro(kind) => eval_macro(*kind, event),
        Expr::Exists { path, negated } => {
            let present = resolve_path(event, path).is_some();
            bool_outcome(present != *negated)
        }
        Expr::Cmp { path, op, value } => eval_cmp(event, path, *op, value),
        Expr::Not(inner) => match eval(inner, event) {
            EvalOutcome::True => EvalOutcome::False,
            EvalOutcome::False => EvalOutcome::True,
            EvalOutcome::Indeterminate => EvalOutcome::Indeterminate,
        },
        Expr::And(a, b) => match (eval(a, event), eval(b, event)) {
            (EvalOutcome::False, _) | (_, EvalOutcome::False) => EvalOutcome::False,
            (EvalOutcome::True, EvalOutcome::True) => EvalOutcome::True,
            _ => EvalOutcome::Indeterminate,
        },
        Expr::Or(a, b) => match (eval(a, event), eval(b, event)) {
            (EvalOutcome::True, _) | (_, EvalOutcome::True) => EvalOutcome::True,
            (EvalOutcome::False, EvalOutcome::False) => EvalOutcome::False,
            _ => EvalOutcome::Indeterminate,
        },
    }
}

fn bool_outcome(b: bool) -> EvalOutcome {
    if b {
        EvalOutcome::True
    } else {
        EvalOutcome::False
    }
}

fn eval_macro(kind: MacroKind, event: &Event) -> EvalOutcome {
    bool_outcome(match kind {
        MacroKind::IsCritical => event.severity == Severity::Critical,
        MacroKind::IsHigh => event.severity == Severity::High,
        MacroKind::IsSecurity => event.category == Category::Security,
        MacroKind::IsCompliance => event.category == Category::Compliance,
    })
}

/// Resolves a `spec.`-prefixed dot path against the event. The `spec.`
/// prefix mirrors the persisted `Observation.spec` shape even though
/// evaluation happens on the pre-creation `Event`.
fn resolve_path(event: &Event, path: &str) -> Option<Value> {
    let path = path.strip_prefix("spec.").unwrap_or(path);
    let (head, rest) = path.split_once('.').unwrap_or((path, ""));
    match head {
        "source" => Some(Value::String(event.source.clone())),
        "category" => Some(Value::String(event.category.as_str().to_string())),
        "severity" => Some(Value::String(event.severity.as_str().to_string())),
        "eventType" | "event_type" => Some(Value::String(event.event_type.clone())),
        "namespace" => event.effective_namespace().map(|n| Value::String(n.to_string())),
        "resource" => {
            let r = event.resource.as_ref()?;
            match rest {
                "kind" => r.kind.clone().map(Value::String),
                "name" => r.name.clone().map(Value::String),
                "namespace" => r.namespace.clone().map(Value::String),
                "apiVersion" | "api_version" => r.api_version.clone().map(Value::String),
                "uid" => r.uid.clone().map(Value::String),
                _ => None,
            }
        }
        "details" => event.details_path(rest).cloned(),
        _ => None,
    }
}

fn eval_cmp(event: &Event, path: &str, op: CmpOp, value: &Literal) -> EvalOutcome {
    let actual = match resolve_path(event, path) {
        Some(v) => v,
        None => return EvalOutcome::Indeterminate,
    };

    let is_severity_path = path.trim_start_matches("spec.") == "severity";

    match op {
        CmpOp::In | CmpOp::NotIn => {
            let Literal::List(options) = value else {
                return EvalOutcome::Indeterminate;
            };
            let Some(actual_str) = actual.as_str() else {
                return EvalOutcome::Indeterminate;
            };
            let found = options.iter().any(|o| o == actual_str);
            bool_outcome(found == matches!(op, CmpOp::In))
        }
        CmpOp::Contains | CmpOp::StartsWith | CmpOp::EndsWith => {
            let (Some(actual_str), Literal::Str(s)) = (actual.as_str(), value) else {
                return EvalOutcome::Indeterminate;
            };
            bool_outcome(match op {
                CmpOp::Contains => actual_str.contains(s.as_str()),
                CmpOp::StartsWith => actual_str.starts_with(s.as_str()),
                CmpOp::EndsWith => actual_str.ends_with(s.as_str()),
                _ => unreachable!(),
            })
        }
        CmpOp::Eq | CmpOp::Ne => {
            let eq = values_equal(&actual, value);
            bool_outcome(eq == matches!(op, CmpOp::Eq))
        }
        CmpOp::Gt | CmpOp::Ge | CmpOp::Lt | CmpOp::Le => {
            if is_severity_path {
                let Some(actual_str) = actual.as_str() else {
                    return EvalOutcome::Indeterminate;
                };
                let Literal::Str(s) = value else {
                    return EvalOutcome::Indeterminate;
                };
                let a_rank = Severity::canonicalize(actual_str).rank();
                let b_rank = Severity::canonicalize(s).rank();
                bool_outcome(match op {
                    CmpOp::Gt => a_rank > b_rank,
                    CmpOp::Ge => a_rank >= b_rank,
                    CmpOp::Lt => a_rank < b_rank,
                    CmpOp::Le => a_rank <= b_rank,
                    _ => unreachable!(),
                })
            } else {
                let Some(a_num) = actual.as_f64() else {
                    return EvalOutcome::Indeterminate;
                };
                let Literal::Num(b_num) = value else {
                    return EvalOutcome::Indeterminate;
                };
                bool_outcome(match op {
                    CmpOp::Gt => a_num > *b_num,
                    CmpOp::Ge => a_num >= *b_num,
                    CmpOp::Lt => a_num < *b_num,
                    CmpOp::Le => a_num <= *b_num,
                    _ => unreachable!(),
                })
            }
        }
    }
}

fn values_equal(actual: &Value, expected: &Literal) -> bool {
    match expected {
        Literal::Str(s) => actual.as_str().map(|a| a == s).unwrap_or(false),
        Literal::Num(n) => actual.as_f64().map(|a| a == *n).unwrap_or(false),
        Literal::List(_) => false,
    }
}

// --- lexer ---

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Path(String),
    Str(String),
    Num(f64),
    LBracket,
    RBracket,
    Comma,
    LParen,
    RParen,
    And,
    Or,
    Not,
    In,
    Exists,
    Contains,
    StartsWith,
    EndsWith,
    Op(CmpOp),
    MacroTok(MacroKind),
}

fn tokenize(input: &str) -> Result<Vec<Token>, ParseError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        match c {
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
            '"' | '\'' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                while i < chars.len() && chars[i] != quote {
                    s.push(chars[i]);
                    i += 1;
                }
                if i >= chars.len() {
                    return Err(ParseError("unterminated string literal".into()));
                }
                i += 1;
                tokens.push(Token::Str(s));
            }
            '=' => {
                tokens.push(Token::Op(CmpOp::Eq));
                i += 1;
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Op(CmpOp::Ne));
                    i += 2;
                } else {
                    return Err(ParseError("stray '!'".into()));
                }
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Op(CmpOp::Ge));
                    i += 2;
                } else {
                    tokens.push(Token::Op(CmpOp::Gt));
                    i += 1;
                }
            }
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Op(CmpOp::Le));
                    i += 2;
                } else {
                    tokens.push(Token::Op(CmpOp::Lt));
                    i += 1;
                }
            }
            _ if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit())) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let s: String = chars[start..i].iter().collect();
                let n = s
                    .parse::<f64>()
                    .map_err(|_| ParseError(format!("invalid number literal '{s}'")))?;
                tokens.push(Token::Num(n));
            }
            _ if c.is_alphanumeric() || c == '_' || c == '.' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.')
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(keyword_or_path(&word)?);
            }
            _ => return Err(ParseError(format!("unexpected character '{c}'"))),
        }
    }
    Ok(tokens)
}

fn keyword_or_path(word: &str) -> Result<Token, ParseError> {
    Ok(match word.to_ascii_uppercase().as_str() {
        "AND" => Token::And,
        "OR" => Token::Or,
        "NOT" => Token::Not,
        "IN" => Token::In,
        "EXISTS" => Token::Exists,
        "CONTAINS" => Token::Contains,
        "STARTS_WITH" => Token::StartsWith,
        "ENDS_WITH" => Token::EndsWith,
        "IS_CRITICAL" => Token::MacroTok(MacroKind::IsCritical),
        "IS_HIGH" => Token::MacroTok(MacroKind::IsHigh),
        "IS_SECURITY" => Token::MacroTok(MacroKind::IsSecurity),
        "IS_COMPLIANCE" => Token::MacroTok(MacroKind::IsCompliance),
        _ => Token::Path(word.to_string()),
    })
}

// --- recursive descent parser ---

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn parse_or(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_and()?;
        while matches!(self.peek(), Some(Token::Or)) {
            self.advance();
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_not()?;
        while matches!(self.peek(), Some(Token::And)) {
            self.advance();
            let right = self.parse_not()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, ParseError> {
        if matches!(self.peek(), Some(Token::Not)) {
            self.advance();
            let inner = self.parse_not()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        match self.peek() {
            Some(Token::LParen) => {
                self.advance();
                let inner = self.parse_or()?;
                match self.advance() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(ParseError("expected ')'".into())),
                }
            }
            Some(Token::MacroTok(kind)) => {
                let kind = *kind;
                self.advance();
                Ok(Expr::Macro(kind))
            }
            Some(Token::Path(_)) => self.parse_comparison(),
            other => Err(ParseError(format!("unexpected token {other:?}"))),
        }
    }

    fn parse_comparison(&mut self) -> Result<Expr, ParseError> {
        let path = match self.advance() {
            Some(Token::Path(p)) => p,
            _ => return Err(ParseError("expected field path".into())),
        };

        match self.peek() {
            Some(Token::Exists) => {
                self.advance();
                Ok(Expr::Exists { path, negated: false })
            }
            Some(Token::Not) => {
                self.advance();
                match self.advance() {
                    Some(Token::Exists) => Ok(Expr::Exists { path, negated: true }),
                    Some(Token::In) => {
                        let value = self.parse_value()?;
                        Ok(Expr::Cmp {
                            path,
                            op: CmpOp::NotIn,
                            value,
                        })
                    }
                    other => Err(ParseError(format!("expected EXISTS or IN after NOT, got {other:?}"))),
                }
            }
            Some(Token::In) => {
                self.advance();
                let value = self.parse_value()?;
                Ok(Expr::Cmp {
                    path,
                    op: CmpOp::In,
                    value,
                })
            }
            Some(Token::Contains) => {
                self.advance();
                let value = self.parse_value()?;
                Ok(Expr::Cmp {
                    path,
                    op: CmpOp::Contains,
                    value,
                })
            }
            Some(Token::StartsWith) => {
                self.advance();
                let value = self.parse_value()?;
                Ok(Expr::Cmp {
                    path,
                    op: CmpOp::StartsWith,
                    value,
                })
            }
            Some(Token::EndsWith) => {
                self.advance();
                let value = self.parse_value()?;
                Ok(Expr::Cmp {
                    path,
                    op: CmpOp::EndsWith,
                    value,
                })
            }
            Some(Token::Op(op)) => {
                let op = *op;
                self.advance();
                let value = self.parse_value()?;
                Ok(Expr::Cmp { path, op, value })
            }
            other => Err(ParseError(format!("expected operator after field path, got {other:?}"))),
        }
    }

    fn parse_value(&mut self) -> Result<Literal, ParseError> {
        match self.advance() {
            Some(Token::Str(s)) => Ok(Literal::Str(s)),
            Some(Token::Num(n)) => Ok(Literal::Num(n)),
            Some(Token::LBracket) => {
                let mut items = Vec::new();
                loop {
                    match self.advance() {
                        Some(Token::Str(s)) => items.push(s),
                        Some(Token::RBracket) => break,
                        other => return Err(ParseError(format!("expected string in list, got {other:?}"))),
                    }
                    match self.peek() {
                        Some(Token::Comma) => {
                            self.advance();
                        }
                        Some(Token::RBracket) => {
                            self.advance();
                            break;
                        }
                        other => return Err(ParseError(format!("expected ',' or ']', got {other:?}"))),
                    }
                }
                Ok(Literal::List(items))
            }
            other => Err(ParseError(format!("expected value, got {other:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use std::collections::BTreeMap;

    fn event(severity: Severity, namespace: &str) -> Event {
        Event {
            source: "falco".into(),
            category: Category::Security,
            severity,
            event_type: "runtime_threat".into(),
            resource: None,
            details: BTreeMap::new(),
            namespace: Some(namespace.to_string()),
            detected_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn severity_comparison_respects_canonical_rank_not_string_order() {
        let expr = parse("spec.severity >= \"HIGH\"").unwrap();
        assert_eq!(eval(&expr, &event(Severity::Critical, "prod")), EvalOutcome::True);
        assert_eq!(eval(&expr, &event(Severity::Medium, "prod")), EvalOutcome::False);
    }

    #[test]
    fn scenario_3_filter_expression() {
        let expr = parse(r#"spec.severity >= "HIGH" AND spec.namespace NOT IN ["kube-system"]"#).unwrap();
        assert_eq!(eval(&expr, &event(Severity::High, "prod")), EvalOutcome::True);
        assert_eq!(eval(&expr, &event(Severity::High, "kube-system")), EvalOutcome::False);
        assert_eq!(eval(&expr, &event(Severity::Medium, "prod")), EvalOutcome::False);
    }

    #[test]
    fn missing_field_without_exists_guard_is_indeterminate() {
        let expr = parse("spec.details.vulnerabilityID = \"CVE-1\"").unwrap();
        assert_eq!(eval(&expr, &event(Severity::High, "prod")), EvalOutcome::Indeterminate);
    }

    #[test]
    fn exists_guard_handles_missing_field_as_false() {
        let expr = parse("spec.details.vulnerabilityID EXISTS").unwrap();
        assert_eq!(eval(&expr, &event(Severity::High, "prod")), EvalOutcome::False);
    }

    #[test]
    fn macros_expand_to_equality_checks() {
        let expr = parse("is_critical").unwrap();
        assert_eq!(eval(&expr, &event(Severity::Critical, "prod")), EvalOutcome::True);
        assert_eq!(eval(&expr, &event(Severity::High, "prod")), EvalOutcome::False);
    }

    #[test]
    fn precedence_is_not_then_and_then_or() {
        // NOT binds tighter than AND, which binds tighter than OR.
        let expr = parse("is_critical OR is_high AND NOT is_security").unwrap();
        // is_high AND NOT is_security -> false (event is security); OR is_critical -> true
        assert_eq!(eval(&expr, &event(Severity::Critical, "prod")), EvalOutcome::True);
    }

    #[test]
    fn parse_error_is_reported_not_panicked() {
        assert!(parse("spec.severity >=").is_err());
        assert!(parse("((unbalanced").is_err());
    }
}
