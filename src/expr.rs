//! Expression sublanguage used by FILTER predicates and MAP functions.
//!
//! ```text
//! a > 3 and b != 'x'
//! not is_null(c) | col["unit price"] * 2 >= 10
//! _ * 2 + a            (MAP: `_` is the mapped column)
//! ```
//!
//! Parsing produces a small AST that is validated against the working schema
//! before being lowered to an engine expression, so a typo in a column name
//! surfaces as not-found instead of an engine error deep in a collect.

use crate::error::{Error, Result};
use polars::prelude::*;
use std::ops::{Add, Div, Mul, Rem, Sub};

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Identifier(String),
    Int(i64),
    Float(f64),
    String(String),
    Op(String),
    LParen,
    RParen,
    LBracket,
    RBracket,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinOp {
    Or,
    And,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Column(String),
    Placeholder,
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    Null,
    Not(Box<Node>),
    Neg(Box<Node>),
    Binary(BinOp, Box<Node>, Box<Node>),
    Call(String, Box<Node>),
}

const FUNCTIONS: &[&str] = &[
    "abs",
    "floor",
    "ceil",
    "upper",
    "lower",
    "len",
    "is_null",
    "is_not_null",
    "not",
];

fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\n' | '\r' => {
                chars.next();
            }
            '(' => {
                tokens.push(Token::LParen);
                chars.next();
            }
            ')' => {
                tokens.push(Token::RParen);
                chars.next();
            }
            '[' => {
                tokens.push(Token::LBracket);
                chars.next();
            }
            ']' => {
                tokens.push(Token::RBracket);
                chars.next();
            }
            '"' | '\'' => {
                let quote = c;
                chars.next();
                let mut value = String::new();
                let mut closed = false;
                while let Some(c) = chars.next() {
                    if c == '\\' {
                        match chars.next() {
                            Some('n') => value.push('\n'),
                            Some('t') => value.push('\t'),
                            Some(other) => value.push(other),
                            None => return Err("Unterminated escape sequence in string".into()),
                        }
                    } else if c == quote {
                        closed = true;
                        break;
                    } else {
                        value.push(c);
                    }
                }
                if !closed {
                    return Err("Unterminated string literal".into());
                }
                tokens.push(Token::String(value));
            }
            '`' => {
                chars.next();
                let mut name = String::new();
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == '`' {
                        closed = true;
                        break;
                    }
                    name.push(c);
                }
                if !closed {
                    return Err("Unterminated `quoted` column name".into());
                }
                tokens.push(Token::Identifier(name));
            }
            '=' | '<' | '>' | '!' => {
                chars.next();
                let mut op = c.to_string();
                if let Some(&next) = chars.peek() {
                    if next == '=' || (c == '<' && next == '>') {
                        op.push(next);
                        chars.next();
                    }
                }
                let op = match op.as_str() {
                    "=" => "==".to_string(),
                    "<>" => "!=".to_string(),
                    "!" => "not".to_string(),
                    _ => op,
                };
                tokens.push(Token::Op(op));
            }
            '+' | '-' | '*' | '/' | '%' | '&' | '|' => {
                chars.next();
                // accept C-style doubled logical operators too
                if (c == '&' || c == '|') && chars.peek() == Some(&c) {
                    chars.next();
                }
                tokens.push(Token::Op(c.to_string()));
            }
            '~' => {
                chars.next();
                tokens.push(Token::Op("not".into()));
            }
            c if c.is_ascii_digit() || c == '.' => {
                let mut text = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() || d == '.' || d == '_' {
                        if d != '_' {
                            text.push(d);
                        }
                        chars.next();
                    } else if (d == 'e' || d == 'E') && !text.contains(['e', 'E']) {
                        text.push(d);
                        chars.next();
                        if let Some(&sign) = chars.peek() {
                            if sign == '-' || sign == '+' {
                                text.push(sign);
                                chars.next();
                            }
                        }
                    } else {
                        break;
                    }
                }
                if text.contains(['.', 'e', 'E']) {
                    let v = text
                        .parse::<f64>()
                        .map_err(|_| format!("Invalid number: {}", text))?;
                    tokens.push(Token::Float(v));
                } else {
                    let v = text
                        .parse::<i64>()
                        .map_err(|_| format!("Invalid number: {}", text))?;
                    tokens.push(Token::Int(v));
                }
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_alphanumeric() || d == '_' {
                        ident.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Identifier(ident));
            }
            other => return Err(format!("Unexpected character '{}'", other)),
        }
    }

    Ok(tokens)
}

/// Deepest expression tree the parser will build.
const MAX_DEPTH: usize = 256;

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
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn peek_keyword(&self, words: &[&str]) -> bool {
        match self.peek() {
            Some(Token::Op(op)) => words.contains(&op.as_str()),
            Some(Token::Identifier(id)) => words.contains(&id.to_lowercase().as_str()),
            _ => false,
        }
    }

    /// Each nested node goes one level deeper; callers restore the level on success.
    fn descend(&mut self) -> Result<(), String> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err("expression nested too deeply".to_string());
        }
        Ok(())
    }

    fn expect(&mut self, want: Token) -> Result<(), String> {
        match self.next() {
            Some(t) if t == want => Ok(()),
            Some(t) => Err(format!("Expected {:?}, found {:?}", want, t)),
            None => Err(format!("Expected {:?}, found end of expression", want)),
        }
    }

    fn parse_or(&mut self) -> Result<Node, String> {
        let depth = self.depth;
        self.descend()?;
        let mut left = self.parse_and()?;
        while self.peek_keyword(&["|", "or"]) {
            self.next();
            self.descend()?;
            let right = self.parse_and()?;
            left = Node::Binary(BinOp::Or, Box::new(left), Box::new(right));
        }
        self.depth = depth;
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Node, String> {
        let depth = self.depth;
        let mut left = self.parse_not()?;
        while self.peek_keyword(&["&", "and"]) {
            self.next();
            self.descend()?;
            let right = self.parse_not()?;
            left = Node::Binary(BinOp::And, Box::new(left), Box::new(right));
        }
        self.depth = depth;
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Node, String> {
        // `not[...]` is the bracket call form, handled as a function
        let bracket_call = matches!(self.tokens.get(self.pos + 1), Some(Token::LBracket));
        if self.peek_keyword(&["not"]) && !bracket_call {
            self.next();
            let depth = self.depth;
            self.descend()?;
            let inner = self.parse_not()?;
            self.depth = depth;
            return Ok(Node::Not(Box::new(inner)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Node, String> {
        let left = self.parse_additive()?;
        let op = match self.peek() {
            Some(Token::Op(op)) => match op.as_str() {
                "==" => Some(BinOp::Eq),
                "!=" => Some(BinOp::NotEq),
                "<" => Some(BinOp::Lt),
                "<=" => Some(BinOp::LtEq),
                ">" => Some(BinOp::Gt),
                ">=" => Some(BinOp::GtEq),
                _ => None,
            },
            _ => None,
        };
        match op {
            Some(op) => {
                self.next();
                let right = self.parse_additive()?;
                Ok(Node::Binary(op, Box::new(left), Box::new(right)))
            }
            None => Ok(left),
        }
    }

    fn parse_additive(&mut self) -> Result<Node, String> {
        let depth = self.depth;
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Op(op)) if op == "+" => BinOp::Add,
                Some(Token::Op(op)) if op == "-" => BinOp::Sub,
                _ => break,
            };
            self.next();
            self.descend()?;
            let right = self.parse_multiplicative()?;
            left = Node::Binary(op, Box::new(left), Box::new(right));
        }
        self.depth = depth;
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<Node, String> {
        let depth = self.depth;
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Op(op)) if op == "*" => BinOp::Mul,
                Some(Token::Op(op)) if op == "/" => BinOp::Div,
                Some(Token::Op(op)) if op == "%" => BinOp::Rem,
                _ => break,
            };
            self.next();
            self.descend()?;
            let right = self.parse_unary()?;
            left = Node::Binary(op, Box::new(left), Box::new(right));
        }
        self.depth = depth;
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Node, String> {
        if matches!(self.peek(), Some(Token::Op(op)) if op == "-") {
            self.next();
            let depth = self.depth;
            self.descend()?;
            let inner = self.parse_unary()?;
            self.depth = depth;
            return Ok(match inner {
                Node::Int(v) => Node::Int(-v),
                Node::Float(v) => Node::Float(-v),
                other => Node::Neg(Box::new(other)),
            });
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Node, String> {
        match self.next() {
            Some(Token::Int(v)) => Ok(Node::Int(v)),
            Some(Token::Float(v)) => Ok(Node::Float(v)),
            Some(Token::String(s)) => Ok(Node::Str(s)),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Identifier(id)) => self.parse_identifier(id),
            Some(t) => Err(format!("Unexpected token {:?}", t)),
            None => Err("Unexpected end of expression".to_string()),
        }
    }

    fn parse_identifier(&mut self, id: String) -> Result<Node, String> {
        let close = match self.peek() {
            Some(Token::LParen) => Some(Token::RParen),
            Some(Token::LBracket) => Some(Token::RBracket),
            _ => None,
        };
        let lower = id.to_lowercase();
        if let Some(close) = close {
            self.next();
            let node = if lower == "col" {
                match self.next() {
                    Some(Token::String(name)) => Node::Column(name),
                    _ => return Err("col[...] takes a quoted column name".to_string()),
                }
            } else if FUNCTIONS.contains(&lower.as_str()) {
                let arg = self.parse_or()?;
                if lower == "not" {
                    Node::Not(Box::new(arg))
                } else {
                    Node::Call(lower, Box::new(arg))
                }
            } else {
                return Err(format!(
                    "Unknown function: {}. Valid: {}",
                    id,
                    FUNCTIONS.join(", ")
                ));
            };
            self.expect(close)?;
            return Ok(node);
        }
        Ok(match lower.as_str() {
            "true" => Node::Bool(true),
            "false" => Node::Bool(false),
            "null" | "none" => Node::Null,
            "_" => Node::Placeholder,
            _ => Node::Column(id),
        })
    }
}

/// A parsed FILTER or MAP expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    root: Node,
}

impl Expression {
    pub fn parse(source: &str) -> Result<Self> {
        let invalid = |msg: String| Error::Validation(format!("invalid expression `{}`: {}", source, msg));
        if source.trim().is_empty() {
            return Err(invalid("expression is empty".into()));
        }
        let tokens = tokenize(source).map_err(invalid)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
        };
        let root = parser.parse_or().map_err(invalid)?;
        if let Some(t) = parser.peek() {
            return Err(invalid(format!("unexpected trailing token {:?}", t)));
        }
        Ok(Self {
            source: source.to_string(),
            root,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Column names referenced directly, in first-use order.
    pub fn columns(&self) -> Vec<String> {
        fn walk(node: &Node, out: &mut Vec<String>) {
            match node {
                Node::Column(name) => {
                    if !out.contains(name) {
                        out.push(name.clone());
                    }
                }
                Node::Not(inner) | Node::Neg(inner) | Node::Call(_, inner) => walk(inner, out),
                Node::Binary(_, l, r) => {
                    walk(l, out);
                    walk(r, out);
                }
                _ => {}
            }
        }
        let mut out = Vec::new();
        walk(&self.root, &mut out);
        out
    }

    pub fn uses_placeholder(&self) -> bool {
        fn walk(node: &Node) -> bool {
            match node {
                Node::Placeholder => true,
                Node::Not(inner) | Node::Neg(inner) | Node::Call(_, inner) => walk(inner),
                Node::Binary(_, l, r) => walk(l) || walk(r),
                _ => false,
            }
        }
        walk(&self.root)
    }

    /// Not-found for the first referenced column missing from `available`.
    pub fn check_columns(&self, available: &[String]) -> Result<()> {
        for name in self.columns() {
            if !available.contains(&name) {
                return Err(Error::NotFound(format!(
                    "column '{}' referenced by `{}` does not exist",
                    name, self.source
                )));
            }
        }
        Ok(())
    }

    /// Lower to an engine expression. `placeholder` names the column bound to `_`.
    pub fn to_polars(&self, placeholder: Option<&str>) -> Result<Expr> {
        lower(&self.root, placeholder).map_err(|msg| {
            Error::Validation(format!("invalid expression `{}`: {}", self.source, msg))
        })
    }
}

fn lower(node: &Node, placeholder: Option<&str>) -> Result<Expr, String> {
    Ok(match node {
        Node::Column(name) => col(name.as_str()),
        Node::Placeholder => match placeholder {
            Some(name) => col(name),
            None => return Err("`_` is only valid in map expressions".to_string()),
        },
        Node::Int(v) => lit(*v),
        Node::Float(v) => lit(*v),
        Node::Str(s) => lit(s.as_str()),
        Node::Bool(b) => lit(*b),
        Node::Null => lit(Null {}),
        Node::Not(inner) => lower(inner, placeholder)?.not(),
        Node::Neg(inner) => lit(0).sub(lower(inner, placeholder)?),
        Node::Call(name, arg) => {
            let expr = lower(arg, placeholder)?;
            match name.as_str() {
                "abs" => expr.abs(),
                "floor" => expr.floor(),
                "ceil" => expr.ceil(),
                "upper" => expr.str().to_uppercase(),
                "lower" => expr.str().to_lowercase(),
                "len" => expr.str().len_chars(),
                "is_null" => expr.is_null(),
                "is_not_null" => expr.is_not_null(),
                other => return Err(format!("Unknown function: {}", other)),
            }
        }
        Node::Binary(op, l, r) => {
            // `x == null` means a null test, not a comparison that is always null
            match (op, l.as_ref(), r.as_ref()) {
                (BinOp::Eq, other, Node::Null) | (BinOp::Eq, Node::Null, other) => {
                    return Ok(lower(other, placeholder)?.is_null())
                }
                (BinOp::NotEq, other, Node::Null) | (BinOp::NotEq, Node::Null, other) => {
                    return Ok(lower(other, placeholder)?.is_not_null())
                }
                _ => {}
            }
            let l = lower(l, placeholder)?;
            let r = lower(r, placeholder)?;
            match op {
                BinOp::Or => l.or(r),
                BinOp::And => l.and(r),
                BinOp::Eq => l.eq(r),
                BinOp::NotEq => l.neq(r),
                BinOp::Lt => l.lt(r),
                BinOp::LtEq => l.lt_eq(r),
                BinOp::Gt => l.gt(r),
                BinOp::GtEq => l.gt_eq(r),
                BinOp::Add => l.add(r),
                BinOp::Sub => l.sub(r),
                BinOp::Mul => l.mul(r),
                BinOp::Div => l.div(r),
                BinOp::Rem => l.rem(r),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lowered(src: &str) -> Expr {
        Expression::parse(src).unwrap().to_polars(None).unwrap()
    }

    #[test]
    fn test_comparison_and_logic() {
        assert_eq!(lowered("a > 10"), col("a").gt(lit(10i64)));
        assert_eq!(lowered("a = 10"), col("a").eq(lit(10i64)));
        assert_eq!(lowered("a <> 1.5"), col("a").neq(lit(1.5f64)));
        assert_eq!(
            lowered("a > 10 or a < 5 and b == 'x'"),
            col("a")
                .gt(lit(10i64))
                .or(col("a").lt(lit(5i64)).and(col("b").eq(lit("x"))))
        );
        assert_eq!(
            lowered("(a > 10 | a < 5) & b != \"x\""),
            col("a")
                .gt(lit(10i64))
                .or(col("a").lt(lit(5i64)))
                .and(col("b").neq(lit("x")))
        );
    }

    #[test]
    fn test_arithmetic_precedence() {
        assert_eq!(
            lowered("a + 1 * 2"),
            col("a").add(lit(1i64).mul(lit(2i64)))
        );
        assert_eq!(lowered("-3 + a"), lit(-3i64).add(col("a")));
    }

    #[test]
    fn test_not_forms() {
        let expected = col("a").gt(lit(1i64)).not();
        assert_eq!(lowered("not a > 1"), expected);
        assert_eq!(lowered("~(a > 1)"), expected);
        assert_eq!(lowered("not[a > 1]"), expected);
    }

    #[test]
    fn test_functions_and_quoted_columns() {
        assert_eq!(lowered("is_null(b)"), col("b").is_null());
        assert_eq!(lowered("b == null"), col("b").is_null());
        assert_eq!(lowered("upper[b] == 'X'"), col("b").str().to_uppercase().eq(lit("X")));
        assert_eq!(lowered("col[\"unit price\"] > 2"), col("unit price").gt(lit(2i64)));
        assert_eq!(lowered("`unit price` > 2"), col("unit price").gt(lit(2i64)));
    }

    #[test]
    fn test_placeholder() {
        let e = Expression::parse("_ * 2").unwrap();
        assert!(e.uses_placeholder());
        assert_eq!(e.to_polars(Some("a")).unwrap(), col("a").mul(lit(2i64)));
        assert!(matches!(e.to_polars(None), Err(Error::Validation(_))));
    }

    #[test]
    fn test_columns_and_check() {
        let e = Expression::parse("a > 1 and b == 'x' or a < 0").unwrap();
        assert_eq!(e.columns(), vec!["a".to_string(), "b".to_string()]);
        assert!(e.check_columns(&["a".into(), "b".into()]).is_ok());
        assert!(e.check_columns(&["a".into()]).unwrap_err().is_not_found());
    }

    #[test]
    fn test_malformed() {
        for bad in ["", "a >", "(a > 1", "a > 1)", "'open", "a $ b", "frobnicate(a)", "col[a]"] {
            assert!(
                matches!(Expression::parse(bad), Err(Error::Validation(_))),
                "expected validation error for {bad:?}"
            );
        }
    }

    #[test]
    fn test_nesting_is_bounded() {
        let shallow = format!("{}a > 1{}", "(".repeat(50), ")".repeat(50));
        assert!(Expression::parse(&shallow).is_ok());

        let deep = format!("{}a > 1{}", "(".repeat(50_000), ")".repeat(50_000));
        match Expression::parse(&deep) {
            Err(Error::Validation(msg)) => assert!(msg.contains("nested too deeply")),
            other => panic!("unexpected {other:?}"),
        }
        for deep in ["-".repeat(10_000) + "a", "not ".repeat(10_000) + "a", "a + ".repeat(10_000) + "a"] {
            assert!(matches!(Expression::parse(&deep), Err(Error::Validation(_))));
        }
    }
}
