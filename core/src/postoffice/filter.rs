//! Message selectors
//!
//! A small SQL-like language evaluated against message headers and
//! properties:
//!
//! ```text
//! color = 'red' AND weight > 2.5
//! NOT (region <> 'eu' OR CVPriority < 5)
//! urgent = TRUE AND owner IS NOT NULL
//! ```
//!
//! Header identifiers: `CVPriority`, `CVDurable`, `CVTimestamp`,
//! `CVExpiration`, `CVMessageID`. Any other identifier names a property.
//! Comparisons with a missing property are false.

use std::cmp::Ordering;

use crate::protocol::{Message, PropertyValue};
use crate::{CorvidError, Result};

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Long(i64),
    Double(f64),
    Op(CompareOp),
    LParen,
    RParen,
    Minus,
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

#[derive(Debug, Clone, PartialEq)]
enum Value {
    Bool(bool),
    Long(i64),
    Double(f64),
    Str(String),
    Null,
}

#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Literal(Value),
    Identifier(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Compare(Operand, CompareOp, Operand),
    IsNull(Operand, bool),
    Operand(Operand),
}

/// A parsed selector
#[derive(Debug, Clone)]
pub struct Filter {
    expression: String,
    root: Expr,
}

impl PartialEq for Filter {
    fn eq(&self, other: &Self) -> bool {
        self.expression == other.expression
    }
}

impl Filter {
    pub fn parse(expression: &str) -> Result<Self> {
        let tokens = tokenize(expression)?;
        let mut parser = Parser { tokens, pos: 0 };
        let root = parser.parse_or()?;
        if parser.pos != parser.tokens.len() {
            return Err(invalid(expression, "unexpected trailing input"));
        }
        Ok(Self {
            expression: expression.to_string(),
            root,
        })
    }

    /// `None` and blank expressions mean "no filter"
    pub fn from_option(expression: Option<&str>) -> Result<Option<Self>> {
        match expression {
            Some(e) if !e.trim().is_empty() => Self::parse(e).map(Some),
            _ => Ok(None),
        }
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn matches(&self, message: &Message) -> bool {
        eval(&self.root, message)
    }
}

/// True when `filter` is absent or accepts the message
pub fn accepts(filter: Option<&Filter>, message: &Message) -> bool {
    filter.map_or(true, |f| f.matches(message))
}

fn invalid(expression: &str, reason: &str) -> CorvidError {
    CorvidError::InvalidFilter(format!("{reason} in '{expression}'"))
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '=' => {
                tokens.push(Token::Op(CompareOp::Eq));
                i += 1;
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Op(CompareOp::Ne));
                i += 2;
            }
            '<' => match chars.get(i + 1) {
                Some('>') => {
                    tokens.push(Token::Op(CompareOp::Ne));
                    i += 2;
                }
                Some('=') => {
                    tokens.push(Token::Op(CompareOp::Le));
                    i += 2;
                }
                _ => {
                    tokens.push(Token::Op(CompareOp::Lt));
                    i += 1;
                }
            },
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Op(CompareOp::Ge));
                    i += 2;
                } else {
                    tokens.push(Token::Op(CompareOp::Gt));
                    i += 1;
                }
            }
            '\'' => {
                let mut value = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(invalid(input, "unterminated string")),
                        Some('\'') if chars.get(i + 1) == Some(&'\'') => {
                            value.push('\'');
                            i += 2;
                        }
                        Some('\'') => {
                            i += 1;
                            break;
                        }
                        Some(ch) => {
                            value.push(*ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(value));
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let token = if text.contains('.') {
                    text.parse::<f64>()
                        .map(Token::Double)
                        .map_err(|_| invalid(input, "malformed number"))?
                } else {
                    text.parse::<i64>()
                        .map(Token::Long)
                        .map_err(|_| invalid(input, "malformed number"))?
                };
                tokens.push(token);
            }
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || matches!(chars[i], '_' | '$' | '.'))
                {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => {
                return Err(invalid(input, &format!("unexpected character '{other}'")));
            }
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

    fn peek_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(word)) if word.eq_ignore_ascii_case(keyword))
    }

    fn expect_keyword(&mut self, keyword: &str) -> Result<()> {
        if self.peek_keyword(keyword) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(&format!("expected {keyword}")))
        }
    }

    fn error(&self, reason: &str) -> CorvidError {
        CorvidError::InvalidFilter(format!("{reason} at token {}", self.pos))
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut left = self.parse_and()?;
        while self.peek_keyword("OR") {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut left = self.parse_not()?;
        while self.peek_keyword("AND") {
            self.pos += 1;
            let right = self.parse_not()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr> {
        if self.peek_keyword("NOT") {
            self.pos += 1;
            return Ok(Expr::Not(Box::new(self.parse_not()?)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr> {
        if self.peek() == Some(&Token::LParen) {
            self.pos += 1;
            let inner = self.parse_or()?;
            if self.peek() != Some(&Token::RParen) {
                return Err(self.error("expected ')'"));
            }
            self.pos += 1;
            return Ok(inner);
        }

        let left = self.parse_operand()?;
        if self.peek_keyword("IS") {
            self.pos += 1;
            let negated = self.peek_keyword("NOT");
            if negated {
                self.pos += 1;
            }
            self.expect_keyword("NULL")?;
            return Ok(Expr::IsNull(left, negated));
        }
        if let Some(Token::Op(op)) = self.peek().cloned() {
            self.pos += 1;
            let right = self.parse_operand()?;
            return Ok(Expr::Compare(left, op, right));
        }
        Ok(Expr::Operand(left))
    }

    fn parse_operand(&mut self) -> Result<Operand> {
        let token = self
            .peek()
            .cloned()
            .ok_or_else(|| self.error("unexpected end of expression"))?;
        self.pos += 1;
        match token {
            Token::Str(s) => Ok(Operand::Literal(Value::Str(s))),
            Token::Long(v) => Ok(Operand::Literal(Value::Long(v))),
            Token::Double(v) => Ok(Operand::Literal(Value::Double(v))),
            Token::Minus => match self.peek().cloned() {
                Some(Token::Long(v)) => {
                    self.pos += 1;
                    Ok(Operand::Literal(Value::Long(-v)))
                }
                Some(Token::Double(v)) => {
                    self.pos += 1;
                    Ok(Operand::Literal(Value::Double(-v)))
                }
                _ => Err(self.error("expected number after '-'")),
            },
            Token::Ident(word) => {
                if word.eq_ignore_ascii_case("TRUE") {
                    Ok(Operand::Literal(Value::Bool(true)))
                } else if word.eq_ignore_ascii_case("FALSE") {
                    Ok(Operand::Literal(Value::Bool(false)))
                } else if ["AND", "OR", "NOT", "IS", "NULL"]
                    .iter()
                    .any(|k| word.eq_ignore_ascii_case(k))
                {
                    Err(self.error(&format!("unexpected keyword {word}")))
                } else {
                    Ok(Operand::Identifier(word))
                }
            }
            _ => Err(self.error("expected operand")),
        }
    }
}

fn resolve(operand: &Operand, message: &Message) -> Value {
    match operand {
        Operand::Literal(value) => value.clone(),
        Operand::Identifier(name) => match name.as_str() {
            "CVPriority" => Value::Long(i64::from(message.priority)),
            "CVDurable" => Value::Bool(message.durable),
            "CVTimestamp" => Value::Long(message.timestamp),
            "CVExpiration" => Value::Long(message.expiration),
            "CVMessageID" => Value::Long(message.message_id as i64),
            _ => match message.property(name) {
                Some(PropertyValue::Bool(v)) => Value::Bool(*v),
                Some(PropertyValue::Long(v)) => Value::Long(*v),
                Some(PropertyValue::Double(v)) => Value::Double(*v),
                Some(PropertyValue::String(v)) => Value::Str(v.clone()),
                None => Value::Null,
            },
        },
    }
}

fn compare_values(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Long(a), Value::Long(b)) => Some(a.cmp(b)),
        (Value::Long(a), Value::Double(b)) => (*a as f64).partial_cmp(b),
        (Value::Double(a), Value::Long(b)) => a.partial_cmp(&(*b as f64)),
        (Value::Double(a), Value::Double(b)) => a.partial_cmp(b),
        (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn eval(expr: &Expr, message: &Message) -> bool {
    match expr {
        Expr::And(a, b) => eval(a, message) && eval(b, message),
        Expr::Or(a, b) => eval(a, message) || eval(b, message),
        Expr::Not(inner) => !eval(inner, message),
        Expr::IsNull(operand, negated) => {
            let is_null = resolve(operand, message) == Value::Null;
            is_null != *negated
        }
        Expr::Operand(operand) => resolve(operand, message) == Value::Bool(true),
        Expr::Compare(left, op, right) => {
            let left = resolve(left, message);
            let right = resolve(right, message);
            let Some(ordering) = compare_values(&left, &right) else {
                return false;
            };
            match (op, &left) {
                (CompareOp::Eq, _) => ordering == Ordering::Equal,
                (CompareOp::Ne, _) => ordering != Ordering::Equal,
                (_, Value::Bool(_)) => false,
                (CompareOp::Lt, _) => ordering == Ordering::Less,
                (CompareOp::Le, _) => ordering != Ordering::Greater,
                (CompareOp::Gt, _) => ordering == Ordering::Greater,
                (CompareOp::Ge, _) => ordering != Ordering::Less,
            }
        }
    }
}
