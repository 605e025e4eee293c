//! Condition expressions for `conditional` branches and loop exit checks.
//!
//! A small language over the run's variable context: `${path}` references,
//! string/number/bool literals, comparisons, `&& || !`, and parentheses.
//! `${build.success}` alone is a valid condition; so is
//! `${tests.output} != '' && ${attempts} < 3`.

use serde_json::Value;
use thiserror::Error;

use crate::template::TemplateContext;

#[derive(Debug, Error)]
pub enum ConditionError {
    #[error("cannot parse condition '{expression}': {message}")]
    Parse { expression: String, message: String },

    #[error("unknown variable '{name}' in condition '{expression}'")]
    UnknownVariable { name: String, expression: String },

    #[error("type error in condition '{expression}': {message}")]
    Type { expression: String, message: String },
}

#[derive(Debug, Clone, PartialEq)]
enum CondValue {
    Bool(bool),
    Number(f64),
    Str(String),
    Null,
}

impl CondValue {
    fn truthy(&self) -> bool {
        match self {
            CondValue::Bool(b) => *b,
            CondValue::Number(n) => *n != 0.0,
            CondValue::Str(s) => !s.is_empty() && s != "false",
            CondValue::Null => false,
        }
    }

    fn as_number(&self) -> Option<f64> {
        match self {
            CondValue::Number(n) => Some(*n),
            CondValue::Str(s) => s.trim().parse().ok(),
            CondValue::Bool(_) | CondValue::Null => None,
        }
    }

    fn render(&self) -> String {
        match self {
            CondValue::Bool(b) => b.to_string(),
            CondValue::Number(n) => n.to_string(),
            CondValue::Str(s) => s.clone(),
            CondValue::Null => String::new(),
        }
    }

    fn from_json(value: &Value) -> Self {
        match value {
            Value::Bool(b) => CondValue::Bool(*b),
            Value::Number(n) => CondValue::Number(n.as_f64().unwrap_or(0.0)),
            Value::String(s) => CondValue::Str(s.clone()),
            Value::Null => CondValue::Null,
            other => CondValue::Str(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    LParen,
    RParen,
    And,
    Or,
    Not,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Literal(CondValue),
    Var(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug)]
enum Expr {
    Literal(CondValue),
    Var(String),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare {
        op: CompareOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
}

#[derive(Debug, Clone, Default)]
pub struct ConditionEvaluator;

impl ConditionEvaluator {
    pub fn new() -> Self {
        Self
    }

    pub fn evaluate(
        &self,
        expression: &str,
        context: &TemplateContext,
    ) -> Result<bool, ConditionError> {
        let tokens = tokenize(expression).map_err(|message| ConditionError::Parse {
            expression: expression.to_string(),
            message,
        })?;
        let expr = Parser::new(tokens)
            .parse()
            .map_err(|message| ConditionError::Parse {
                expression: expression.to_string(),
                message,
            })?;
        Ok(self.eval(&expr, context, expression)?.truthy())
    }

    fn eval(
        &self,
        expr: &Expr,
        context: &TemplateContext,
        expression: &str,
    ) -> Result<CondValue, ConditionError> {
        match expr {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Var(path) => match context.resolve(path) {
                Some(value) => Ok(CondValue::from_json(value)),
                None => Err(ConditionError::UnknownVariable {
                    name: path.clone(),
                    expression: expression.to_string(),
                }),
            },
            Expr::Not(inner) => Ok(CondValue::Bool(
                !self.eval(inner, context, expression)?.truthy(),
            )),
            Expr::And(left, right) => {
                let left = self.eval(left, context, expression)?.truthy();
                if !left {
                    return Ok(CondValue::Bool(false));
                }
                Ok(CondValue::Bool(
                    self.eval(right, context, expression)?.truthy(),
                ))
            }
            Expr::Or(left, right) => {
                let left = self.eval(left, context, expression)?.truthy();
                if left {
                    return Ok(CondValue::Bool(true));
                }
                Ok(CondValue::Bool(
                    self.eval(right, context, expression)?.truthy(),
                ))
            }
            Expr::Compare { op, left, right } => {
                let left = self.eval(left, context, expression)?;
                let right = self.eval(right, context, expression)?;
                self.compare(*op, &left, &right, expression)
            }
        }
    }

    fn compare(
        &self,
        op: CompareOp,
        left: &CondValue,
        right: &CondValue,
        expression: &str,
    ) -> Result<CondValue, ConditionError> {
        let result = match op {
            CompareOp::Eq | CompareOp::Ne => {
                let equal = match (left.as_number(), right.as_number()) {
                    (Some(l), Some(r)) => l == r,
                    _ => left.render() == right.render(),
                };
                if op == CompareOp::Eq {
                    equal
                } else {
                    !equal
                }
            }
            CompareOp::Lt | CompareOp::Le | CompareOp::Gt | CompareOp::Ge => {
                let (Some(l), Some(r)) = (left.as_number(), right.as_number()) else {
                    return Err(ConditionError::Type {
                        expression: expression.to_string(),
                        message: format!(
                            "ordering comparison needs numbers, got '{}' and '{}'",
                            left.render(),
                            right.render()
                        ),
                    });
                };
                match op {
                    CompareOp::Lt => l < r,
                    CompareOp::Le => l <= r,
                    CompareOp::Gt => l > r,
                    CompareOp::Ge => l >= r,
                    _ => unreachable!(),
                }
            }
        };
        Ok(CondValue::Bool(result))
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '&' => {
                if chars.get(i + 1) == Some(&'&') {
                    tokens.push(Token::And);
                    i += 2;
                } else {
                    return Err("expected '&&'".to_string());
                }
            }
            '|' => {
                if chars.get(i + 1) == Some(&'|') {
                    tokens.push(Token::Or);
                    i += 2;
                } else {
                    return Err("expected '||'".to_string());
                }
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ne);
                    i += 2;
                } else {
                    tokens.push(Token::Not);
                    i += 1;
                }
            }
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Eq);
                    i += 2;
                } else {
                    return Err("expected '=='".to_string());
                }
            }
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Le);
                    i += 2;
                } else {
                    tokens.push(Token::Lt);
                    i += 1;
                }
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ge);
                    i += 2;
                } else {
                    tokens.push(Token::Gt);
                    i += 1;
                }
            }
            '$' => {
                if chars.get(i + 1) != Some(&'{') {
                    return Err("expected '${' after '$'".to_string());
                }
                let start = i + 2;
                let mut end = start;
                while end < chars.len() && chars[end] != '}' {
                    end += 1;
                }
                if end == chars.len() {
                    return Err("unterminated '${'".to_string());
                }
                let path: String = chars[start..end].iter().collect();
                if path.trim().is_empty() {
                    return Err("empty variable reference".to_string());
                }
                tokens.push(Token::Var(path.trim().to_string()));
                i = end + 1;
            }
            '\'' | '"' => {
                let quote = c;
                let start = i + 1;
                let mut end = start;
                while end < chars.len() && chars[end] != quote {
                    end += 1;
                }
                if end == chars.len() {
                    return Err("unterminated string literal".to_string());
                }
                tokens.push(Token::Literal(CondValue::Str(
                    chars[start..end].iter().collect(),
                )));
                i = end + 1;
            }
            c if c.is_ascii_digit() || c == '-' => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let raw: String = chars[start..i].iter().collect();
                let number = raw
                    .parse::<f64>()
                    .map_err(|_| format!("bad number '{raw}'"))?;
                tokens.push(Token::Literal(CondValue::Number(number)));
            }
            c if c.is_ascii_alphabetic() => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                match word.as_str() {
                    "true" => tokens.push(Token::Literal(CondValue::Bool(true))),
                    "false" => tokens.push(Token::Literal(CondValue::Bool(false))),
                    "null" => tokens.push(Token::Literal(CondValue::Null)),
                    other => return Err(format!("unexpected word '{other}'")),
                }
            }
            other => return Err(format!("unexpected character '{other}'")),
        }
    }

    if tokens.is_empty() {
        return Err("empty condition".to_string());
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    position: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            position: 0,
        }
    }

    fn parse(mut self) -> Result<Expr, String> {
        let expr = self.or_expr()?;
        if self.position != self.tokens.len() {
            return Err(format!(
                "trailing tokens after position {}",
                self.position
            ));
        }
        Ok(expr)
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.position).cloned();
        if token.is_some() {
            self.position += 1;
        }
        token
    }

    fn or_expr(&mut self) -> Result<Expr, String> {
        let mut left = self.and_expr()?;
        while self.peek() == Some(&Token::Or) {
            self.advance();
            let right = self.and_expr()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Expr, String> {
        let mut left = self.unary()?;
        while self.peek() == Some(&Token::And) {
            self.advance();
            let right = self.unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, String> {
        if self.peek() == Some(&Token::Not) {
            self.advance();
            return Ok(Expr::Not(Box::new(self.unary()?)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, String> {
        let left = self.primary()?;
        let op = match self.peek() {
            Some(Token::Eq) => CompareOp::Eq,
            Some(Token::Ne) => CompareOp::Ne,
            Some(Token::Lt) => CompareOp::Lt,
            Some(Token::Le) => CompareOp::Le,
            Some(Token::Gt) => CompareOp::Gt,
            Some(Token::Ge) => CompareOp::Ge,
            _ => return Ok(left),
        };
        self.advance();
        let right = self.primary()?;
        Ok(Expr::Compare {
            op,
            left: Box::new(left),
            right: Box::new(right),
        })
    }

    fn primary(&mut self) -> Result<Expr, String> {
        match self.advance() {
            Some(Token::LParen) => {
                let expr = self.or_expr()?;
                match self.advance() {
                    Some(Token::RParen) => Ok(expr),
                    _ => Err("expected ')'".to_string()),
                }
            }
            Some(Token::Literal(value)) => Ok(Expr::Literal(value)),
            Some(Token::Var(path)) => Ok(Expr::Var(path)),
            Some(other) => Err(format!("unexpected token {other:?}")),
            None => Err("condition ended unexpectedly".to_string()),
        }
    }
}
