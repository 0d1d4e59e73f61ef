//! Tokeniser and parser for step condition expressions.
//!
//! The grammar, lowest precedence first:
//!
//! ```text
//! expr       := or
//! or         := and ("||" and)*
//! and        := unary ("&&" unary)*
//! unary      := "!" unary | "(" expr ")" | comparison
//! comparison := operand (("==" | "!=") operand)?
//!             | func "(" operand "," operand ")"
//! operand    := path | number | string | "true" | "false"
//! func       := "contains" | "startsWith" | "endsWith"
//! ```
//!
//! Paths are dotted identifiers (`env.BRANCH`,
//! `steps.build.outputs.exitCode`); resolution lives in the evaluator.

use std::fmt;

/// A parsed expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Or(Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Compare {
        op: CompareOp,
        left: Operand,
        right: Operand,
    },
    Call {
        func: CallFunc,
        subject: Operand,
        needle: Operand,
    },
    /// A bare operand, evaluated for truthiness.
    Operand(Operand),
}

/// Equality operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
}

/// Built-in string predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallFunc {
    Contains,
    StartsWith,
    EndsWith,
}

impl CallFunc {
    fn from_ident(ident: &str) -> Option<Self> {
        match ident {
            "contains" => Some(Self::Contains),
            "startsWith" => Some(Self::StartsWith),
            "endsWith" => Some(Self::EndsWith),
            _ => None,
        }
    }
}

/// A leaf value in an expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// A dotted context path, resolved at evaluation time.
    Path(String),
    Number(f64),
    Str(String),
    Bool(bool),
}

/// Error from tokenising or parsing an expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    /// The offending expression.
    pub expr: String,
    /// Why it was rejected.
    pub reason: String,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid expression {:?}: {}", self.expr, self.reason)
    }
}

impl std::error::Error for ParseError {}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Str(String),
    LParen,
    RParen,
    Comma,
    Not,
    AndAnd,
    OrOr,
    EqEq,
    NotEq,
}

fn tokenize(raw: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = raw.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\n' | '\r' => {
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
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            '&' => {
                chars.next();
                if chars.next_if_eq(&'&').is_none() {
                    return Err("expected '&&'".to_string());
                }
                tokens.push(Token::AndAnd);
            }
            '|' => {
                chars.next();
                if chars.next_if_eq(&'|').is_none() {
                    return Err("expected '||'".to_string());
                }
                tokens.push(Token::OrOr);
            }
            '=' => {
                chars.next();
                if chars.next_if_eq(&'=').is_none() {
                    return Err("expected '=='".to_string());
                }
                tokens.push(Token::EqEq);
            }
            '!' => {
                chars.next();
                if chars.next_if_eq(&'=').is_some() {
                    tokens.push(Token::NotEq);
                } else {
                    tokens.push(Token::Not);
                }
            }
            '\'' | '"' => {
                let quote = c;
                chars.next();
                let mut literal = String::new();
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == quote {
                        closed = true;
                        break;
                    }
                    literal.push(c);
                }
                if !closed {
                    return Err("unterminated string literal".to_string());
                }
                tokens.push(Token::Str(literal));
            }
            c if c.is_ascii_digit() => {
                let mut literal = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_digit() || c == '.' {
                        literal.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let value = literal
                    .parse::<f64>()
                    .map_err(|_| format!("bad number literal {literal:?}"))?;
                tokens.push(Token::Number(value));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-' {
                        ident.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(ident));
            }
            // Negative number literal.
            '-' => {
                chars.next();
                let mut literal = String::from("-");
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_digit() || c == '.' {
                        literal.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let value = literal
                    .parse::<f64>()
                    .map_err(|_| format!("bad number literal {literal:?}"))?;
                tokens.push(Token::Number(value));
            }
            other => return Err(format!("unexpected character {other:?}")),
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    position: usize,
}

impl Parser {
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

    fn eat(&mut self, expected: &Token) -> Result<(), String> {
        match self.advance() {
            Some(token) if &token == expected => Ok(()),
            Some(token) => Err(format!("expected {expected:?}, found {token:?}")),
            None => Err(format!("expected {expected:?}, found end of input")),
        }
    }

    fn expr(&mut self) -> Result<Expr, String> {
        self.or()
    }

    fn or(&mut self) -> Result<Expr, String> {
        let mut left = self.and()?;
        while self.peek() == Some(&Token::OrOr) {
            self.advance();
            let right = self.and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr, String> {
        let mut left = self.unary()?;
        while self.peek() == Some(&Token::AndAnd) {
            self.advance();
            let right = self.unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, String> {
        match self.peek() {
            Some(Token::Not) => {
                self.advance();
                Ok(Expr::Not(Box::new(self.unary()?)))
            }
            Some(Token::LParen) => {
                self.advance();
                let inner = self.expr()?;
                self.eat(&Token::RParen)?;
                Ok(inner)
            }
            _ => self.comparison(),
        }
    }

    fn comparison(&mut self) -> Result<Expr, String> {
        // Function call?
        if let Some(Token::Ident(ident)) = self.peek()
            && let Some(func) = CallFunc::from_ident(ident)
            && self.tokens.get(self.position + 1) == Some(&Token::LParen)
        {
            self.advance();
            self.advance();
            let subject = self.operand()?;
            self.eat(&Token::Comma)?;
            let needle = self.operand()?;
            self.eat(&Token::RParen)?;
            return Ok(Expr::Call {
                func,
                subject,
                needle,
            });
        }

        let left = self.operand()?;
        let op = match self.peek() {
            Some(Token::EqEq) => Some(CompareOp::Eq),
            Some(Token::NotEq) => Some(CompareOp::Ne),
            _ => None,
        };
        match op {
            Some(op) => {
                self.advance();
                let right = self.operand()?;
                Ok(Expr::Compare { op, left, right })
            }
            None => Ok(Expr::Operand(left)),
        }
    }

    fn operand(&mut self) -> Result<Operand, String> {
        match self.advance() {
            Some(Token::Ident(ident)) => Ok(match ident.as_str() {
                "true" => Operand::Bool(true),
                "false" => Operand::Bool(false),
                _ => Operand::Path(ident),
            }),
            Some(Token::Number(value)) => Ok(Operand::Number(value)),
            Some(Token::Str(literal)) => Ok(Operand::Str(literal)),
            Some(token) => Err(format!("expected a value, found {token:?}")),
            None => Err("expected a value, found end of input".to_string()),
        }
    }
}

/// Parses an expression string into an AST.
///
/// # Errors
///
/// Returns an error on lexical or syntactic problems, including trailing
/// input.
pub fn parse(raw: &str) -> Result<Expr, ParseError> {
    let err = |reason: String| ParseError {
        expr: raw.to_string(),
        reason,
    };
    let tokens = tokenize(raw).map_err(err)?;
    if tokens.is_empty() {
        return Err(ParseError {
            expr: raw.to_string(),
            reason: "empty expression".to_string(),
        });
    }
    let mut parser = Parser {
        tokens,
        position: 0,
    };
    let expr = parser.expr().map_err(|reason| ParseError {
        expr: raw.to_string(),
        reason,
    })?;
    if parser.position != parser.tokens.len() {
        return Err(ParseError {
            expr: raw.to_string(),
            reason: format!("unexpected trailing input at token {}", parser.position),
        });
    }
    Ok(expr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_path() {
        let expr = parse("env.DEPLOY").unwrap();
        assert_eq!(expr, Expr::Operand(Operand::Path("env.DEPLOY".to_string())));
    }

    #[test]
    fn parses_comparison() {
        let expr = parse("steps.s1.outputs.exitCode == 0").unwrap();
        assert_eq!(
            expr,
            Expr::Compare {
                op: CompareOp::Eq,
                left: Operand::Path("steps.s1.outputs.exitCode".to_string()),
                right: Operand::Number(0.0),
            }
        );
    }

    #[test]
    fn and_binds_tighter_than_or() {
        let expr = parse("a || b && c").unwrap();
        match expr {
            Expr::Or(left, right) => {
                assert_eq!(*left, Expr::Operand(Operand::Path("a".to_string())));
                assert!(matches!(*right, Expr::And(..)));
            }
            other => panic!("expected Or at the top, got {other:?}"),
        }
    }

    #[test]
    fn parentheses_group() {
        let expr = parse("(a || b) && c").unwrap();
        match expr {
            Expr::And(left, _) => assert!(matches!(*left, Expr::Or(..))),
            other => panic!("expected And at the top, got {other:?}"),
        }
    }

    #[test]
    fn not_binds_tightest() {
        let expr = parse("!a && b").unwrap();
        match expr {
            Expr::And(left, _) => assert!(matches!(*left, Expr::Not(_))),
            other => panic!("expected And at the top, got {other:?}"),
        }
    }

    #[test]
    fn parses_calls() {
        let expr = parse("contains(env.BRANCH, \"release/\")").unwrap();
        assert_eq!(
            expr,
            Expr::Call {
                func: CallFunc::Contains,
                subject: Operand::Path("env.BRANCH".to_string()),
                needle: Operand::Str("release/".to_string()),
            }
        );
        assert!(parse("startsWith(env.REF, 'refs/tags/')").is_ok());
        assert!(parse("endsWith(env.FILE, '.json')").is_ok());
    }

    #[test]
    fn single_quotes_and_double_quotes() {
        assert_eq!(
            parse("'x' == \"x\"").unwrap(),
            Expr::Compare {
                op: CompareOp::Eq,
                left: Operand::Str("x".to_string()),
                right: Operand::Str("x".to_string()),
            }
        );
    }

    #[test]
    fn rejects_malformed_input() {
        assert!(parse("").is_err());
        assert!(parse("a &&").is_err());
        assert!(parse("a == ").is_err());
        assert!(parse("(a").is_err());
        assert!(parse("a = b").is_err());
        assert!(parse("'unterminated").is_err());
        assert!(parse("a b").is_err());
        assert!(parse("contains(a)").is_err());
    }

    #[test]
    fn negative_numbers() {
        assert_eq!(
            parse("env.N == -1").unwrap(),
            Expr::Compare {
                op: CompareOp::Eq,
                left: Operand::Path("env.N".to_string()),
                right: Operand::Number(-1.0),
            }
        );
    }
}
