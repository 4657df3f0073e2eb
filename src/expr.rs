//! # Restricted Expressions
//!
//! ## Responsibility
//! Evaluate the small expression language used by tuning declarations:
//! conditions deciding whether a variable must change, and computed desired
//! values derived from the shared environment.
//!
//! The grammar is limited to literals, identifiers, arithmetic, comparison and
//! boolean operators.  There are no calls, attribute access or indexing, so a
//! declaration can read configuration values but never execute anything.
//!
//! ## Guarantees
//! - Parsing happens once, at declaration load time; evaluation never parses.
//! - Unknown identifiers, type mismatches and division by zero are errors,
//!   never silent `false`.

use std::fmt;
use std::str::FromStr;

use crate::error::{OptimizeError, Result};
use crate::value::{Params, TypedValue};

// ---------------------------------------------------------------------------
// Tokens
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Int(i64),
    Double(f64),
    Str(String),
    Ident(String),
    Op(BinaryOp),
    Not,
    LParen,
    RParen,
}

fn tokenize(src: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }

        if c.is_ascii_digit() {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            let text: String = chars[start..i].iter().collect();
            let token = if text.contains('.') {
                text.parse().map(Token::Double)
                    .map_err(|_| OptimizeError::Expr(format!("bad number '{}'", text)))?
            } else {
                text.parse().map(Token::Int)
                    .map_err(|_| OptimizeError::Expr(format!("bad number '{}'", text)))?
            };
            tokens.push(token);
            continue;
        }

        if c == '\'' || c == '"' {
            let quote = c;
            let mut text = String::new();
            i += 1;
            loop {
                match chars.get(i) {
                    None => return Err(OptimizeError::Expr(format!("unterminated string in '{}'", src))),
                    Some('\\') => {
                        if let Some(next) = chars.get(i + 1) {
                            text.push(*next);
                        }
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
            continue;
        }

        if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            let word: String = chars[start..i].iter().collect();
            tokens.push(match word.as_str() {
                "and" => Token::Op(BinaryOp::And),
                "or" => Token::Op(BinaryOp::Or),
                "not" => Token::Not,
                _ => Token::Ident(word),
            });
            continue;
        }

        let two: String = chars[i..(i + 2).min(chars.len())].iter().collect();
        let (token, width) = match two.as_str() {
            "==" => (Token::Op(BinaryOp::Eq), 2),
            "!=" => (Token::Op(BinaryOp::Ne), 2),
            "<=" => (Token::Op(BinaryOp::Le), 2),
            ">=" => (Token::Op(BinaryOp::Ge), 2),
            _ => match c {
                '<' => (Token::Op(BinaryOp::Lt), 1),
                '>' => (Token::Op(BinaryOp::Gt), 1),
                '+' => (Token::Op(BinaryOp::Add), 1),
                '-' => (Token::Op(BinaryOp::Sub), 1),
                '*' => (Token::Op(BinaryOp::Mul), 1),
                '/' => (Token::Op(BinaryOp::Div), 1),
                '%' => (Token::Op(BinaryOp::Rem), 1),
                '(' => (Token::LParen, 1),
                ')' => (Token::RParen, 1),
                other => {
                    return Err(OptimizeError::Expr(format!(
                        "unexpected character '{}' in '{}'",
                        other, src
                    )))
                }
            },
        };
        tokens.push(token);
        i += width;
    }

    Ok(tokens)
}

// ---------------------------------------------------------------------------
// AST
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
}

impl BinaryOp {
    fn binding_power(self) -> (u8, u8) {
        match self {
            BinaryOp::Or => (1, 2),
            BinaryOp::And => (3, 4),
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => (7, 8),
            BinaryOp::Add | BinaryOp::Sub => (9, 10),
            BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => (11, 12),
        }
    }
}

const NOT_BP: u8 = 5;
const NEG_BP: u8 = 13;

/// Parsed expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(TypedValue),
    Ident(String),
    Not(Box<Expr>),
    Neg(Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
}

struct Parser<'a> {
    src: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn error(&self, what: &str) -> OptimizeError {
        OptimizeError::Expr(format!("{} in '{}'", what, self.src))
    }

    fn parse_bp(&mut self, min_bp: u8) -> Result<Expr> {
        let mut lhs = match self.next() {
            Some(Token::Int(i)) => Expr::Literal(TypedValue::Int(i)),
            Some(Token::Double(f)) => Expr::Literal(TypedValue::Double(f)),
            Some(Token::Str(s)) => Expr::Literal(TypedValue::Str(s)),
            Some(Token::Ident(name)) => match name.as_str() {
                "true" | "True" => Expr::Literal(TypedValue::Bool(true)),
                "false" | "False" => Expr::Literal(TypedValue::Bool(false)),
                "none" | "None" => Expr::Literal(TypedValue::None),
                _ => Expr::Ident(name),
            },
            Some(Token::LParen) => {
                let inner = self.parse_bp(0)?;
                if self.next() != Some(Token::RParen) {
                    return Err(self.error("expected ')'"));
                }
                inner
            }
            Some(Token::Not) => Expr::Not(Box::new(self.parse_bp(NOT_BP)?)),
            Some(Token::Op(BinaryOp::Sub)) => Expr::Neg(Box::new(self.parse_bp(NEG_BP)?)),
            Some(other) => return Err(self.error(&format!("unexpected token {:?}", other))),
            None => return Err(self.error("unexpected end of expression")),
        };

        while let Some(Token::Op(op)) = self.peek() {
            let op = *op;
            let (lbp, rbp) = op.binding_power();
            if lbp < min_bp {
                break;
            }
            self.pos += 1;
            let rhs = self.parse_bp(rbp)?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }

        Ok(lhs)
    }
}

impl Expr {
    /// Parse a complete expression.
    pub fn parse(src: &str) -> Result<Self> {
        let mut parser = Parser { src, tokens: tokenize(src)?, pos: 0 };
        let expr = parser.parse_bp(0)?;
        if parser.pos != parser.tokens.len() {
            return Err(parser.error("trailing tokens"));
        }
        Ok(expr)
    }

    /// Evaluate with `lookup` resolving every identifier.
    pub fn eval(&self, lookup: &dyn Fn(&str) -> Option<TypedValue>) -> Result<TypedValue> {
        match self {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Ident(name) => lookup(name)
                .ok_or_else(|| OptimizeError::Expr(format!("unknown name '{}'", name))),
            Expr::Not(inner) => Ok(TypedValue::Bool(!inner.eval(lookup)?.is_truthy())),
            Expr::Neg(inner) => match inner.eval(lookup)? {
                TypedValue::Int(i) => Ok(TypedValue::Int(-i)),
                TypedValue::Double(f) => Ok(TypedValue::Double(-f)),
                other => Err(OptimizeError::Expr(format!("cannot negate '{}'", other))),
            },
            Expr::Binary(BinaryOp::And, l, r) => {
                let ok = l.eval(lookup)?.is_truthy() && r.eval(lookup)?.is_truthy();
                Ok(TypedValue::Bool(ok))
            }
            Expr::Binary(BinaryOp::Or, l, r) => {
                let ok = l.eval(lookup)?.is_truthy() || r.eval(lookup)?.is_truthy();
                Ok(TypedValue::Bool(ok))
            }
            Expr::Binary(op, l, r) => apply_binary(*op, l.eval(lookup)?, r.eval(lookup)?),
        }
    }

    /// Evaluate against the shared environment only.
    pub fn eval_in(&self, env: &Params) -> Result<TypedValue> {
        self.eval(&|name: &str| env.get(name).map(TypedValue::from_json))
    }
}

fn apply_binary(op: BinaryOp, l: TypedValue, r: TypedValue) -> Result<TypedValue> {
    use std::cmp::Ordering;

    let ordering = |l: &TypedValue, r: &TypedValue| {
        l.partial_cmp(r)
            .ok_or_else(|| OptimizeError::Expr(format!("cannot compare '{}' with '{}'", l, r)))
    };

    let result = match op {
        BinaryOp::Eq => TypedValue::Bool(l == r),
        BinaryOp::Ne => TypedValue::Bool(l != r),
        BinaryOp::Lt => TypedValue::Bool(ordering(&l, &r)? == Ordering::Less),
        BinaryOp::Le => TypedValue::Bool(ordering(&l, &r)? != Ordering::Greater),
        BinaryOp::Gt => TypedValue::Bool(ordering(&l, &r)? == Ordering::Greater),
        BinaryOp::Ge => TypedValue::Bool(ordering(&l, &r)? != Ordering::Less),
        BinaryOp::Add => match (&l, &r) {
            (TypedValue::Str(a), TypedValue::Str(b)) => TypedValue::Str(format!("{}{}", a, b)),
            _ => arithmetic(op, &l, &r)?,
        },
        _ => arithmetic(op, &l, &r)?,
    };
    Ok(result)
}

fn arithmetic(op: BinaryOp, l: &TypedValue, r: &TypedValue) -> Result<TypedValue> {
    let mismatch = || OptimizeError::Expr(format!("unsupported operands '{}' and '{}'", l, r));

    if let (TypedValue::Int(a), TypedValue::Int(b)) = (l, r) {
        let (a, b) = (*a, *b);
        let v = match op {
            BinaryOp::Add => a.checked_add(b),
            BinaryOp::Sub => a.checked_sub(b),
            BinaryOp::Mul => a.checked_mul(b),
            BinaryOp::Rem => a.checked_rem(b),
            BinaryOp::Div if b != 0 => return Ok(TypedValue::Double(a as f64 / b as f64)),
            _ => None,
        };
        return v
            .map(TypedValue::Int)
            .ok_or_else(|| OptimizeError::Expr(format!("arithmetic overflow or division by zero: {} {:?} {}", a, op, b)));
    }

    let a = l.as_f64().ok_or_else(mismatch)?;
    let b = r.as_f64().ok_or_else(mismatch)?;
    let v = match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div | BinaryOp::Rem if b == 0.0 => {
            return Err(OptimizeError::Expr("division by zero".to_string()))
        }
        BinaryOp::Div => a / b,
        BinaryOp::Rem => a % b,
        _ => return Err(mismatch()),
    };
    Ok(TypedValue::Double(v))
}

// ---------------------------------------------------------------------------
// Condition
// ---------------------------------------------------------------------------

/// Decides whether a variable must be modified given its desired and current
/// values.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Condition {
    #[default]
    NotEqual,
    Equal,
    Greater,
    GreaterOrEqual,
    Less,
    LessOrEqual,
    Always,
    Never,
    /// `lambda <desired>, <current>: <body>`; other names come from the
    /// shared environment.
    Lambda {
        desired: String,
        current: String,
        body: Expr,
        source: String,
    },
}

impl FromStr for Condition {
    type Err = OptimizeError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let named = match trimmed.to_ascii_lowercase().as_str() {
            "not_equal" | "ne" | "!=" => Some(Condition::NotEqual),
            "equal" | "eq" | "==" => Some(Condition::Equal),
            "greater" | "gt" | ">" => Some(Condition::Greater),
            "greater_or_equal" | "ge" | ">=" => Some(Condition::GreaterOrEqual),
            "less" | "lt" | "<" => Some(Condition::Less),
            "less_or_equal" | "le" | "<=" => Some(Condition::LessOrEqual),
            "always" => Some(Condition::Always),
            "never" => Some(Condition::Never),
            _ => None,
        };
        if let Some(c) = named {
            return Ok(c);
        }

        let rest = trimmed
            .strip_prefix("lambda")
            .filter(|r| r.starts_with(char::is_whitespace))
            .ok_or_else(|| OptimizeError::Expr(format!("unknown condition '{}'", trimmed)))?;
        let (head, body) = rest
            .split_once(':')
            .ok_or_else(|| OptimizeError::Expr(format!("lambda without ':' in '{}'", trimmed)))?;
        let params: Vec<&str> = head.split(',').map(str::trim).collect();
        let valid = |p: &str| !p.is_empty() && p.chars().all(|c| c.is_alphanumeric() || c == '_');
        match params.as_slice() {
            [desired, current] if valid(desired) && valid(current) => Ok(Condition::Lambda {
                desired: desired.to_string(),
                current: current.to_string(),
                body: Expr::parse(body)?,
                source: trimmed.to_string(),
            }),
            _ => Err(OptimizeError::Expr(format!(
                "condition lambda must take exactly two parameters: '{}'",
                trimmed
            ))),
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::NotEqual => write!(f, "not_equal"),
            Condition::Equal => write!(f, "equal"),
            Condition::Greater => write!(f, "greater"),
            Condition::GreaterOrEqual => write!(f, "greater_or_equal"),
            Condition::Less => write!(f, "less"),
            Condition::LessOrEqual => write!(f, "less_or_equal"),
            Condition::Always => write!(f, "always"),
            Condition::Never => write!(f, "never"),
            Condition::Lambda { source, .. } => write!(f, "{}", source),
        }
    }
}

impl Condition {
    /// Whether the change from `current` to `desired` should be applied.
    pub fn holds(&self, desired: &TypedValue, current: &TypedValue, env: &Params) -> Result<bool> {
        let compare = |op| apply_binary(op, desired.clone(), current.clone()).map(|v| v.is_truthy());
        match self {
            Condition::NotEqual => Ok(desired != current),
            Condition::Equal => Ok(desired == current),
            Condition::Greater => compare(BinaryOp::Gt),
            Condition::GreaterOrEqual => compare(BinaryOp::Ge),
            Condition::Less => compare(BinaryOp::Lt),
            Condition::LessOrEqual => compare(BinaryOp::Le),
            Condition::Always => Ok(true),
            Condition::Never => Ok(false),
            Condition::Lambda { desired: d, current: c, body, .. } => {
                let lookup = |name: &str| {
                    if name == d {
                        Some(desired.clone())
                    } else if name == c {
                        Some(current.clone())
                    } else {
                        env.get(name).map(TypedValue::from_json)
                    }
                };
                Ok(body.eval(&lookup)?.is_truthy())
            }
        }
    }
}
