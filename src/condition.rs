//! Compact boolean expression language for edge conditions.
//!
//! Conditions are evaluated against a completing node's output mapping and
//! the workflow variables, e.g. `output.x > 5 && variables.mode == "fast"`.
//! The grammar is deliberately small:
//!
//! ```text
//! expr    := and ("||" and)*
//! and     := unary ("&&" unary)*
//! unary   := "!" unary | "(" expr ")" | operand (relop operand)?
//! operand := literal | path
//! relop   := == != > < >= <=
//! literal := integer | decimal | "string" | 'string' | true | false | null
//! path    := ident ("." ident)*
//! ```
//!
//! Paths resolve from three roots: `output` (the message payload), `input`
//! (alias of `output`; graph files use both spellings), and `variables`
//! (the workflow variable map). A missing path yields null; null compared
//! with any operator other than `==`/`!=` is false. A bare path is a
//! truthiness test: non-null, non-false, non-zero, non-empty.
//!
//! Expressions are compiled once (surfacing syntax errors at graph load)
//! and evaluated many times.

use miette::Diagnostic;
use serde_json::Value;
use thiserror::Error;

use crate::message::ValueMap;

/// Errors raised while compiling or evaluating a condition.
#[derive(Debug, Error, Diagnostic)]
pub enum ConditionError {
    #[error("syntax error at offset {offset}: {detail}")]
    #[diagnostic(
        code(loomflow::condition::syntax),
        help("Conditions look like `output.x > 5 && variables.mode == \"fast\"`.")
    )]
    Syntax { offset: usize, detail: String },

    #[error("unknown identifier root `{root}`")]
    #[diagnostic(
        code(loomflow::condition::unknown_root),
        help("Paths must start with `output.`, `input.`, or `variables.`.")
    )]
    UnknownRoot { root: String },

    #[error("unterminated string literal starting at offset {offset}")]
    #[diagnostic(code(loomflow::condition::unterminated_string))]
    UnterminatedString { offset: usize },
}

#[derive(Clone, Debug, PartialEq)]
enum Token {
    And,
    Or,
    Not,
    LParen,
    RParen,
    Op(RelOp),
    Literal(Value),
    Path(Vec<String>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RelOp {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
}

#[derive(Clone, Debug)]
enum Expr {
    Or(Vec<Expr>),
    And(Vec<Expr>),
    Not(Box<Expr>),
    Compare(Operand, RelOp, Operand),
    Truthy(Operand),
}

#[derive(Clone, Debug)]
enum Operand {
    Literal(Value),
    Path(Vec<String>),
}

/// A parsed, reusable condition expression.
#[derive(Clone, Debug)]
pub struct CompiledCondition {
    source: String,
    expr: Expr,
}

impl CompiledCondition {
    /// Compile an expression, surfacing syntax errors eagerly.
    pub fn compile(source: &str) -> Result<Self, ConditionError> {
        let tokens = lex(source)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.expr()?;
        if parser.pos != parser.tokens.len() {
            return Err(ConditionError::Syntax {
                offset: source.len(),
                detail: "trailing input after expression".into(),
            });
        }
        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    /// The original expression text.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate against an output mapping and workflow variables.
    pub fn evaluate(&self, output: &ValueMap, variables: &ValueMap) -> bool {
        eval(&self.expr, output, variables)
    }
}

fn lex(source: &str) -> Result<Vec<Token>, ConditionError> {
    let bytes = source.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            ' ' | '\t' | '\r' | '\n' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '&' if bytes.get(i + 1) == Some(&b'&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if bytes.get(i + 1) == Some(&b'|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '!' if bytes.get(i + 1) == Some(&b'=') => {
                tokens.push(Token::Op(RelOp::Ne));
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '=' if bytes.get(i + 1) == Some(&b'=') => {
                tokens.push(Token::Op(RelOp::Eq));
                i += 2;
            }
            '>' if bytes.get(i + 1) == Some(&b'=') => {
                tokens.push(Token::Op(RelOp::Ge));
                i += 2;
            }
            '>' => {
                tokens.push(Token::Op(RelOp::Gt));
                i += 1;
            }
            '<' if bytes.get(i + 1) == Some(&b'=') => {
                tokens.push(Token::Op(RelOp::Le));
                i += 2;
            }
            '<' => {
                tokens.push(Token::Op(RelOp::Lt));
                i += 1;
            }
            '"' | '\'' => {
                let quote = c;
                let start = i;
                i += 1;
                let mut text = String::new();
                loop {
                    match bytes.get(i) {
                        None => return Err(ConditionError::UnterminatedString { offset: start }),
                        Some(&b) if b as char == quote => {
                            i += 1;
                            break;
                        }
                        Some(&b'\\') => {
                            if let Some(&escaped) = bytes.get(i + 1) {
                                text.push(escaped as char);
                                i += 2;
                            } else {
                                return Err(ConditionError::UnterminatedString { offset: start });
                            }
                        }
                        Some(&b) => {
                            text.push(b as char);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Literal(Value::String(text)));
            }
            c if c.is_ascii_digit() || c == '-' => {
                let start = i;
                i += 1;
                while i < bytes.len()
                    && ((bytes[i] as char).is_ascii_digit() || bytes[i] == b'.')
                {
                    i += 1;
                }
                let text = &source[start..i];
                let number: f64 = text.parse().map_err(|_| ConditionError::Syntax {
                    offset: start,
                    detail: format!("invalid number `{text}`"),
                })?;
                let value = serde_json::Number::from_f64(number)
                    .map(Value::Number)
                    .unwrap_or(Value::Null);
                tokens.push(Token::Literal(value));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < bytes.len()
                    && ((bytes[i] as char).is_ascii_alphanumeric()
                        || bytes[i] == b'_'
                        || bytes[i] == b'.')
                {
                    i += 1;
                }
                let word = &source[start..i];
                match word {
                    "true" => tokens.push(Token::Literal(Value::Bool(true))),
                    "false" => tokens.push(Token::Literal(Value::Bool(false))),
                    "null" => tokens.push(Token::Literal(Value::Null)),
                    _ => {
                        let segments: Vec<String> =
                            word.split('.').map(str::to_string).collect();
                        match segments[0].as_str() {
                            "output" | "input" | "variables" => {
                                tokens.push(Token::Path(segments));
                            }
                            other => {
                                return Err(ConditionError::UnknownRoot {
                                    root: other.to_string(),
                                });
                            }
                        }
                    }
                }
            }
            other => {
                return Err(ConditionError::Syntax {
                    offset: i,
                    detail: format!("unexpected character `{other}`"),
                });
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

    fn bump(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expr(&mut self) -> Result<Expr, ConditionError> {
        let first = self.and()?;
        let mut arms = vec![first];
        while matches!(self.peek(), Some(Token::Or)) {
            self.bump();
            arms.push(self.and()?);
        }
        Ok(if arms.len() == 1 {
            arms.pop().unwrap()
        } else {
            Expr::Or(arms)
        })
    }

    fn and(&mut self) -> Result<Expr, ConditionError> {
        let first = self.unary()?;
        let mut arms = vec![first];
        while matches!(self.peek(), Some(Token::And)) {
            self.bump();
            arms.push(self.unary()?);
        }
        Ok(if arms.len() == 1 {
            arms.pop().unwrap()
        } else {
            Expr::And(arms)
        })
    }

    fn unary(&mut self) -> Result<Expr, ConditionError> {
        match self.peek() {
            Some(Token::Not) => {
                self.bump();
                Ok(Expr::Not(Box::new(self.unary()?)))
            }
            Some(Token::LParen) => {
                self.bump();
                let inner = self.expr()?;
                match self.bump() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(self.syntax("expected `)`")),
                }
            }
            _ => self.comparison(),
        }
    }

    fn comparison(&mut self) -> Result<Expr, ConditionError> {
        let left = self.operand()?;
        if let Some(Token::Op(op)) = self.peek().cloned() {
            self.bump();
            let right = self.operand()?;
            Ok(Expr::Compare(left, op, right))
        } else {
            Ok(Expr::Truthy(left))
        }
    }

    fn operand(&mut self) -> Result<Operand, ConditionError> {
        match self.bump() {
            Some(Token::Literal(value)) => Ok(Operand::Literal(value)),
            Some(Token::Path(path)) => Ok(Operand::Path(path)),
            _ => Err(self.syntax("expected a literal or identifier path")),
        }
    }

    fn syntax(&self, detail: &str) -> ConditionError {
        ConditionError::Syntax {
            offset: self.pos,
            detail: detail.to_string(),
        }
    }
}

fn eval(expr: &Expr, output: &ValueMap, variables: &ValueMap) -> bool {
    match expr {
        Expr::Or(arms) => arms.iter().any(|a| eval(a, output, variables)),
        Expr::And(arms) => arms.iter().all(|a| eval(a, output, variables)),
        Expr::Not(inner) => !eval(inner, output, variables),
        Expr::Truthy(operand) => truthy(&resolve(operand, output, variables)),
        Expr::Compare(left, op, right) => compare(
            &resolve(left, output, variables),
            *op,
            &resolve(right, output, variables),
        ),
    }
}

fn resolve(operand: &Operand, output: &ValueMap, variables: &ValueMap) -> Value {
    match operand {
        Operand::Literal(value) => value.clone(),
        Operand::Path(path) => {
            let map = match path[0].as_str() {
                "variables" => variables,
                // `input` is accepted as an alias; both resolve against the
                // mapping under evaluation.
                _ => output,
            };
            let Some(first) = path.get(1) else {
                return Value::Null;
            };
            let mut current = match map.get(first) {
                Some(value) => value.clone(),
                None => return Value::Null,
            };
            for segment in &path[2..] {
                current = match current.get(segment) {
                    Some(value) => value.clone(),
                    None => return Value::Null,
                };
            }
            current
        }
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

fn compare(left: &Value, op: RelOp, right: &Value) -> bool {
    // Null is only comparable with equality operators.
    if left.is_null() || right.is_null() {
        return match op {
            RelOp::Eq => left.is_null() && right.is_null(),
            RelOp::Ne => left.is_null() != right.is_null(),
            _ => false,
        };
    }

    if let (Some(l), Some(r)) = (as_number(left), as_number(right)) {
        return match op {
            RelOp::Eq => l == r,
            RelOp::Ne => l != r,
            RelOp::Gt => l > r,
            RelOp::Lt => l < r,
            RelOp::Ge => l >= r,
            RelOp::Le => l <= r,
        };
    }

    // Fallback: case-insensitive string comparison.
    let l = render(left).to_lowercase();
    let r = render(right).to_lowercase();
    match op {
        RelOp::Eq => l == r,
        RelOp::Ne => l != r,
        RelOp::Gt => l > r,
        RelOp::Lt => l < r,
        RelOp::Ge => l >= r,
        RelOp::Le => l <= r,
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
