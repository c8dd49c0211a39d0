//! Deterministic formula evaluation over resolved values.
//!
//! ```text
//! expr   = term (('+' | '-') term)*
//! term   = unary (('*' | '/') unary)*
//! unary  = '-' unary | atom
//! atom   = number | ident | ident '(' expr (',' expr)* ')' | '(' expr ')'
//! ```
//!
//! Functions: `min(a, b)`, `max(a, b)`, `abs(a)`.

use crate::core::plan::Formula;
use crate::error::{Error, Result};
use crate::pipeline::divergence::case_id;
use crate::pipeline::records::{AnalysisRecord, ArbitrationDecision, CalculationReport};
use std::collections::BTreeMap;

/// Deepest allowed nesting of parentheses, calls and unary minus.
const MAX_NESTING: usize = 64;

/// Longest formula accepted, in tokens.
const MAX_TOKENS: usize = 1024;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
    Comma,
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
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
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            c if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n = text
                    .parse::<f64>()
                    .map_err(|_| Error::Calculation(format!("invalid number '{}'", text)))?;
                tokens.push(Token::Number(n));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_ascii_alphanumeric() || chars[i] == '_' || chars[i] == '.')
                {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => {
                return Err(Error::Calculation(format!(
                    "unexpected character '{}'",
                    other
                )))
            }
        }
        if tokens.len() > MAX_TOKENS {
            return Err(Error::Calculation(format!(
                "formula longer than {} tokens",
                MAX_TOKENS
            )));
        }
    }
    Ok(tokens)
}

/// A parsed formula expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Field(String),
    Neg(Box<Expr>),
    Binary(Box<Expr>, BinOp, Box<Expr>),
    Call(String, Vec<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
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

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn expect(&mut self, expected: Token) -> Result<()> {
        match self.next() {
            Some(t) if t == expected => Ok(()),
            other => Err(Error::Calculation(format!(
                "expected {:?}, found {:?}",
                expected, other
            ))),
        }
    }

    fn expr(&mut self) -> Result<Expr> {
        let mut left = self.term()?;
        while let Some(op) = match self.peek() {
            Some(Token::Plus) => Some(BinOp::Add),
            Some(Token::Minus) => Some(BinOp::Sub),
            _ => None,
        } {
            self.pos += 1;
            let right = self.term()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn term(&mut self) -> Result<Expr> {
        let mut left = self.unary()?;
        while let Some(op) = match self.peek() {
            Some(Token::Star) => Some(BinOp::Mul),
            Some(Token::Slash) => Some(BinOp::Div),
            _ => None,
        } {
            self.pos += 1;
            let right = self.unary()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn nested<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        if self.depth >= MAX_NESTING {
            return Err(Error::Calculation(format!(
                "formula nested deeper than {} levels",
                MAX_NESTING
            )));
        }
        self.depth += 1;
        let result = f(self);
        self.depth -= 1;
        result
    }

    fn unary(&mut self) -> Result<Expr> {
        if self.peek() == Some(&Token::Minus) {
            self.pos += 1;
            return self.nested(|p| Ok(Expr::Neg(Box::new(p.unary()?))));
        }
        self.nested(Self::atom)
    }

    fn atom(&mut self) -> Result<Expr> {
        match self.next() {
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::LParen) => {
                let inner = self.expr()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Ident(name)) => {
                if self.peek() != Some(&Token::LParen) {
                    return Ok(Expr::Field(name));
                }
                self.pos += 1;
                let mut args = vec![self.expr()?];
                while self.peek() == Some(&Token::Comma) {
                    self.pos += 1;
                    args.push(self.expr()?);
                }
                self.expect(Token::RParen)?;
                Ok(Expr::Call(name, args))
            }
            other => Err(Error::Calculation(format!("unexpected token {:?}", other))),
        }
    }
}

/// Parse an expression, rejecting trailing input.
pub fn parse(expression: &str) -> Result<Expr> {
    let mut parser = Parser {
        tokens: tokenize(expression)?,
        pos: 0,
        depth: 0,
    };
    let expr = parser.expr()?;
    if parser.pos < parser.tokens.len() {
        return Err(Error::Calculation(format!(
            "unexpected trailing input in '{}'",
            expression
        )));
    }
    Ok(expr)
}

impl Expr {
    /// Evaluate against `fields`. `formula` names the formula for errors.
    pub fn eval(&self, formula: &str, fields: &BTreeMap<String, f64>) -> Result<f64> {
        match self {
            Expr::Number(n) => Ok(*n),
            Expr::Field(name) => {
                fields
                    .get(name)
                    .copied()
                    .ok_or_else(|| Error::FormulaInputMissing {
                        formula: formula.to_string(),
                        field: name.clone(),
                    })
            }
            Expr::Neg(inner) => Ok(-inner.eval(formula, fields)?),
            Expr::Binary(left, op, right) => {
                let l = left.eval(formula, fields)?;
                let r = right.eval(formula, fields)?;
                match op {
                    BinOp::Add => Ok(l + r),
                    BinOp::Sub => Ok(l - r),
                    BinOp::Mul => Ok(l * r),
                    BinOp::Div if r == 0.0 => Err(Error::Calculation(format!(
                        "division by zero in '{}'",
                        formula
                    ))),
                    BinOp::Div => Ok(l / r),
                }
            }
            Expr::Call(name, args) => {
                let values = args
                    .iter()
                    .map(|a| a.eval(formula, fields))
                    .collect::<Result<Vec<f64>>>()?;
                match (name.as_str(), values.as_slice()) {
                    ("min", [a, b]) => Ok(a.min(*b)),
                    ("max", [a, b]) => Ok(a.max(*b)),
                    ("abs", [a]) => Ok(a.abs()),
                    _ => Err(Error::Calculation(format!(
                        "unknown function {}/{} in '{}'",
                        name,
                        values.len(),
                        formula
                    ))),
                }
            }
        }
    }
}

/// Resolved value per input and dimension: the arbitrated value where a
/// decision exists, otherwise the mean of agent scores.
pub fn resolve_values<'a>(
    records: impl IntoIterator<Item = &'a AnalysisRecord>,
    decisions: &[ArbitrationDecision],
) -> BTreeMap<String, BTreeMap<String, f64>> {
    let mut sums: BTreeMap<String, BTreeMap<String, (f64, usize)>> = BTreeMap::new();
    for record in records {
        let per_input = sums.entry(record.input_id.clone()).or_default();
        for (dimension, score) in &record.dimension_scores {
            let entry = per_input.entry(dimension.clone()).or_insert((0.0, 0));
            entry.0 += score;
            entry.1 += 1;
        }
    }
    let arbitrated: BTreeMap<&str, f64> = decisions
        .iter()
        .map(|d| (d.divergence_case_id.as_str(), d.winning_value))
        .collect();

    sums.into_iter()
        .map(|(input_id, dims)| {
            let values = dims
                .into_iter()
                .map(|(dimension, (sum, count))| {
                    let value = arbitrated
                        .get(case_id(&input_id, &dimension).as_str())
                        .copied()
                        .unwrap_or(sum / count as f64);
                    (dimension, value)
                })
                .collect();
            (input_id, values)
        })
        .collect()
}

/// Evaluate `formulas` in order for every input. Earlier results are visible
/// to later formulas.
pub fn calculate(
    formulas: &[Formula],
    resolved: BTreeMap<String, BTreeMap<String, f64>>,
) -> Result<CalculationReport> {
    let parsed = formulas
        .iter()
        .map(|f| parse(&f.expression).map(|expr| (f.name.as_str(), expr)))
        .collect::<Result<Vec<_>>>()?;

    let mut derived = BTreeMap::new();
    for (input_id, values) in &resolved {
        let mut fields = values.clone();
        let mut outputs = BTreeMap::new();
        for (name, expr) in &parsed {
            let value = expr.eval(name, &fields)?;
            fields.insert(name.to_string(), value);
            outputs.insert(name.to_string(), value);
        }
        derived.insert(input_id.clone(), outputs);
    }
    Ok(CalculationReport { resolved, derived })
}
