//! The expression language UDFs are written in.
//!
//! A UDF is a projection list: `price * qty AS total, upper(name) AS name`.
//! Expressions follow Python operator precedence:
//! `or` < `and` < `not` < comparisons < `+ -` < `* / // %` < unary `-`.
//! Identifiers may be back-quoted to use names that clash with keywords.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};
use crate::types::{format_float, Scalar};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
}

impl BinaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::FloorDiv => "//",
            BinaryOp::Mod => "%",
            BinaryOp::Eq => "==",
            BinaryOp::NotEq => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::LtEq => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::GtEq => ">=",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
        }
    }

    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Eq
                | BinaryOp::NotEq
                | BinaryOp::Lt
                | BinaryOp::LtEq
                | BinaryOp::Gt
                | BinaryOp::GtEq
        )
    }

    pub fn is_arithmetic(self) -> bool {
        matches!(
            self,
            BinaryOp::Add
                | BinaryOp::Sub
                | BinaryOp::Mul
                | BinaryOp::Div
                | BinaryOp::FloorDiv
                | BinaryOp::Mod
        )
    }

    fn binding_power(self) -> (u8, u8) {
        match self {
            BinaryOp::Or => (1, 2),
            BinaryOp::And => (3, 4),
            BinaryOp::Eq
            | BinaryOp::NotEq
            | BinaryOp::Lt
            | BinaryOp::LtEq
            | BinaryOp::Gt
            | BinaryOp::GtEq => (7, 8),
            BinaryOp::Add | BinaryOp::Sub => (9, 10),
            BinaryOp::Mul | BinaryOp::Div | BinaryOp::FloorDiv | BinaryOp::Mod => (11, 12),
        }
    }
}

const NOT_BP: u8 = 5;
const NEG_BP: u8 = 13;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Function {
    Int,
    Float,
    Str,
    Bool,
    Len,
    Upper,
    Lower,
    Strip,
    Abs,
    Round,
    Sqrt,
    Log,
    Exp,
    Sin,
    Cos,
    IsNull,
    Coalesce,
}

impl Function {
    pub fn from_name(name: &str) -> Option<Function> {
        let f = match name {
            "int" => Function::Int,
            "float" => Function::Float,
            "str" => Function::Str,
            "bool" => Function::Bool,
            "len" => Function::Len,
            "upper" => Function::Upper,
            "lower" => Function::Lower,
            "strip" => Function::Strip,
            "abs" => Function::Abs,
            "round" => Function::Round,
            "sqrt" => Function::Sqrt,
            "log" => Function::Log,
            "exp" => Function::Exp,
            "sin" => Function::Sin,
            "cos" => Function::Cos,
            "is_null" => Function::IsNull,
            "coalesce" => Function::Coalesce,
            _ => return None,
        };
        Some(f)
    }

    pub fn name(self) -> &'static str {
        match self {
            Function::Int => "int",
            Function::Float => "float",
            Function::Str => "str",
            Function::Bool => "bool",
            Function::Len => "len",
            Function::Upper => "upper",
            Function::Lower => "lower",
            Function::Strip => "strip",
            Function::Abs => "abs",
            Function::Round => "round",
            Function::Sqrt => "sqrt",
            Function::Log => "log",
            Function::Exp => "exp",
            Function::Sin => "sin",
            Function::Cos => "cos",
            Function::IsNull => "is_null",
            Function::Coalesce => "coalesce",
        }
    }

    /// Accepted argument counts as `(min, max)`.
    pub fn arity(self) -> (usize, usize) {
        match self {
            Function::Coalesce => (1, usize::MAX),
            _ => (1, 1),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Scalar),
    Column(String),
    Unary {
        op: UnaryOp,
        expr: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Call {
        func: Function,
        args: Vec<Expr>,
    },
}

impl Expr {
    pub fn parse(src: &str) -> Result<Expr> {
        let mut p = Parser::new(src)?;
        let e = p.expr(0)?;
        p.expect_end()?;
        Ok(e)
    }

    /// Column names referenced anywhere in the expression, in first-use order.
    pub fn columns(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_columns(&mut out);
        out
    }

    fn collect_columns<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expr::Literal(_) => {}
            Expr::Column(c) => {
                if !out.contains(&c.as_str()) {
                    out.push(c);
                }
            }
            Expr::Unary { expr, .. } => expr.collect_columns(out),
            Expr::Binary { left, right, .. } => {
                left.collect_columns(out);
                right.collect_columns(out);
            }
            Expr::Call { args, .. } => args.iter().for_each(|a| a.collect_columns(out)),
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Literal(Scalar::Str(s)) => {
                write!(f, "'{}'", s.replace('\\', "\\\\").replace('\'', "\\'"))
            }
            Expr::Literal(Scalar::Null) => f.write_str("null"),
            Expr::Literal(Scalar::Bool(b)) => write!(f, "{b}"),
            Expr::Literal(Scalar::F64(x)) => f.write_str(&format_float(*x)),
            Expr::Literal(v) => write!(f, "{v}"),
            Expr::Column(c) if is_plain_ident(c) => f.write_str(c),
            Expr::Column(c) => write!(f, "`{c}`"),
            Expr::Unary {
                op: UnaryOp::Neg,
                expr,
            } => write!(f, "-{expr}"),
            Expr::Unary {
                op: UnaryOp::Not,
                expr,
            } => write!(f, "not {expr}"),
            Expr::Binary { op, left, right } => write!(f, "({left} {} {right})", op.symbol()),
            Expr::Call { func, args } => {
                write!(f, "{}(", func.name())?;
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{a}")?;
                }
                f.write_str(")")
            }
        }
    }
}

fn is_plain_ident(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !is_keyword(s)
}

fn is_keyword(s: &str) -> bool {
    ["and", "or", "not", "as", "true", "false", "null", "none"]
        .iter()
        .any(|k| s.eq_ignore_ascii_case(k))
}

/// One output column of a UDF.
#[derive(Debug, Clone, PartialEq)]
pub struct Projection {
    pub alias: Option<String>,
    pub expr: Expr,
}

impl Projection {
    /// Output column name: the alias, the referenced column, or `_<position>`.
    pub fn output_name(&self, position: usize) -> String {
        match (&self.alias, &self.expr) {
            (Some(a), _) => a.clone(),
            (None, Expr::Column(c)) => c.clone(),
            (None, _) => format!("_{position}"),
        }
    }
}

/// A parsed UDF. Serializes as its source text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Udf {
    source: String,
    projections: Vec<Projection>,
}

impl Udf {
    pub fn parse(src: &str) -> Result<Udf> {
        let mut p = Parser::new(src)?;
        let mut projections = Vec::new();
        loop {
            let expr = p.expr(0)?;
            let alias = if p.eat_keyword("as") {
                Some(p.ident()?)
            } else {
                None
            };
            projections.push(Projection { alias, expr });
            if !p.eat_sym(",") {
                break;
            }
        }
        p.expect_end()?;
        Ok(Udf {
            source: src.trim().to_string(),
            projections,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn projections(&self) -> &[Projection] {
        &self.projections
    }

    pub fn len(&self) -> usize {
        self.projections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.projections.is_empty()
    }

    /// The single expression of a one-column UDF.
    pub fn single(&self) -> Option<&Expr> {
        match self.projections.as_slice() {
            [p] => Some(&p.expr),
            _ => None,
        }
    }

    pub fn output_names(&self) -> Vec<String> {
        self.projections
            .iter()
            .enumerate()
            .map(|(i, p)| p.output_name(i))
            .collect()
    }
}

impl fmt::Display for Udf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl TryFrom<String> for Udf {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Udf::parse(&s)
    }
}

impl From<Udf> for String {
    fn from(u: Udf) -> String {
        u.source
    }
}

// ---------------------------------------------------------------------------
// Lexer

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Quoted(String),
    Int(i64),
    Float(f64),
    Str(String),
    Sym(&'static str),
    End,
}

const SYMBOLS: [&str; 15] = [
    "//", "==", "!=", "<=", ">=", "+", "-", "*", "/", "%", "<", ">", "(", ")", ",",
];

fn err(pos: usize, msg: impl Into<String>) -> Error {
    Error::Expr {
        pos,
        msg: msg.into(),
    }
}

fn tokenize(src: &str) -> Result<Vec<(Tok, usize)>> {
    let bytes = src.as_bytes();
    let mut out = Vec::new();
    let mut i = 0;

    'outer: while i < bytes.len() {
        let c = bytes[i];
        if c.is_ascii_whitespace() {
            i += 1;
            continue;
        }
        let start = i;

        if c.is_ascii_digit() || (c == b'.' && bytes.get(i + 1).is_some_and(u8::is_ascii_digit)) {
            let mut is_float = false;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if i < bytes.len() && bytes[i] == b'.' {
                is_float = true;
                i += 1;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
            }
            if i < bytes.len() && (bytes[i] == b'e' || bytes[i] == b'E') {
                let mut j = i + 1;
                if j < bytes.len() && (bytes[j] == b'+' || bytes[j] == b'-') {
                    j += 1;
                }
                if j < bytes.len() && bytes[j].is_ascii_digit() {
                    is_float = true;
                    i = j;
                    while i < bytes.len() && bytes[i].is_ascii_digit() {
                        i += 1;
                    }
                }
            }
            let text = &src[start..i];
            let tok = if is_float {
                Tok::Float(
                    text.parse()
                        .map_err(|_| err(start, format!("bad number '{text}'")))?,
                )
            } else {
                Tok::Int(
                    text.parse()
                        .map_err(|_| err(start, format!("integer out of range '{text}'")))?,
                )
            };
            out.push((tok, start));
            continue;
        }

        if c.is_ascii_alphabetic() || c == b'_' {
            while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                i += 1;
            }
            out.push((Tok::Ident(src[start..i].to_string()), start));
            continue;
        }

        if c == b'`' {
            let close = src[i + 1..]
                .find('`')
                .ok_or_else(|| err(start, "unterminated quoted identifier"))?;
            out.push((Tok::Quoted(src[i + 1..i + 1 + close].to_string()), start));
            i += close + 2;
            continue;
        }

        if c == b'\'' || c == b'"' {
            let quote = c as char;
            let mut s = String::new();
            let mut chars = src[i + 1..].char_indices();
            while let Some((off, ch)) = chars.next() {
                if ch == quote {
                    i = i + 1 + off + 1;
                    out.push((Tok::Str(s), start));
                    continue 'outer;
                }
                if ch == '\\' {
                    match chars.next() {
                        Some((_, 'n')) => s.push('\n'),
                        Some((_, 't')) => s.push('\t'),
                        Some((_, other)) => s.push(other),
                        None => break,
                    }
                } else {
                    s.push(ch);
                }
            }
            return Err(err(start, "unterminated string literal"));
        }

        for sym in SYMBOLS {
            if src[i..].starts_with(sym) {
                out.push((Tok::Sym(sym), start));
                i += sym.len();
                continue 'outer;
            }
        }
        let ch = src[i..].chars().next().unwrap_or('?');
        return Err(err(start, format!("unexpected character '{ch}'")));
    }

    out.push((Tok::End, src.len()));
    Ok(out)
}

// ---------------------------------------------------------------------------
// Pratt parser

struct Parser {
    toks: Vec<(Tok, usize)>,
    pos: usize,
}

impl Parser {
    fn new(src: &str) -> Result<Self> {
        Ok(Self {
            toks: tokenize(src)?,
            pos: 0,
        })
    }

    fn peek(&self) -> &Tok {
        &self.toks[self.pos.min(self.toks.len() - 1)].0
    }

    fn offset(&self) -> usize {
        self.toks[self.pos.min(self.toks.len() - 1)].1
    }

    fn bump(&mut self) -> Tok {
        let t = self.peek().clone();
        if self.pos < self.toks.len() - 1 {
            self.pos += 1;
        }
        t
    }

    fn eat_sym(&mut self, sym: &str) -> bool {
        if matches!(self.peek(), Tok::Sym(s) if *s == sym) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn at_keyword(&self, kw: &str) -> bool {
        matches!(self.peek(), Tok::Ident(s) if s.eq_ignore_ascii_case(kw))
    }

    fn eat_keyword(&mut self, kw: &str) -> bool {
        if self.at_keyword(kw) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn ident(&mut self) -> Result<String> {
        let at = self.offset();
        match self.bump() {
            Tok::Ident(s) if !is_keyword(&s) => Ok(s),
            Tok::Quoted(s) => Ok(s),
            other => Err(err(at, format!("expected a name, found {other:?}"))),
        }
    }

    fn expect_end(&self) -> Result<()> {
        match self.peek() {
            Tok::End => Ok(()),
            other => Err(err(self.offset(), format!("unexpected trailing {other:?}"))),
        }
    }

    fn peek_binary(&self) -> Option<BinaryOp> {
        let op = match self.peek() {
            Tok::Sym("+") => BinaryOp::Add,
            Tok::Sym("-") => BinaryOp::Sub,
            Tok::Sym("*") => BinaryOp::Mul,
            Tok::Sym("/") => BinaryOp::Div,
            Tok::Sym("//") => BinaryOp::FloorDiv,
            Tok::Sym("%") => BinaryOp::Mod,
            Tok::Sym("==") => BinaryOp::Eq,
            Tok::Sym("!=") => BinaryOp::NotEq,
            Tok::Sym("<") => BinaryOp::Lt,
            Tok::Sym("<=") => BinaryOp::LtEq,
            Tok::Sym(">") => BinaryOp::Gt,
            Tok::Sym(">=") => BinaryOp::GtEq,
            Tok::Ident(s) if s.eq_ignore_ascii_case("and") => BinaryOp::And,
            Tok::Ident(s) if s.eq_ignore_ascii_case("or") => BinaryOp::Or,
            _ => return None,
        };
        Some(op)
    }

    fn expr(&mut self, min_bp: u8) -> Result<Expr> {
        let mut lhs = self.prefix()?;
        while let Some(op) = self.peek_binary() {
            let (l_bp, r_bp) = op.binding_power();
            if l_bp < min_bp {
                break;
            }
            self.bump();
            let rhs = self.expr(r_bp)?;
            lhs = Expr::Binary {
                op,
                left: Box::new(lhs),
                right: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn prefix(&mut self) -> Result<Expr> {
        let at = self.offset();
        match self.bump() {
            Tok::Int(i) => Ok(Expr::Literal(Scalar::I64(i))),
            Tok::Float(f) => Ok(Expr::Literal(Scalar::F64(f))),
            Tok::Str(s) => Ok(Expr::Literal(Scalar::Str(s))),
            Tok::Quoted(name) => Ok(Expr::Column(name)),
            Tok::Sym("-") => {
                let inner = self.expr(NEG_BP)?;
                Ok(match inner {
                    Expr::Literal(Scalar::I64(i)) => Expr::Literal(Scalar::I64(-i)),
                    Expr::Literal(Scalar::F64(f)) => Expr::Literal(Scalar::F64(-f)),
                    other => Expr::Unary {
                        op: UnaryOp::Neg,
                        expr: Box::new(other),
                    },
                })
            }
            Tok::Sym("(") => {
                let e = self.expr(0)?;
                if !self.eat_sym(")") {
                    return Err(err(self.offset(), "expected ')'"));
                }
                Ok(e)
            }
            Tok::Ident(word) => self.word(word, at),
            other => Err(err(at, format!("unexpected {other:?}"))),
        }
    }

    fn word(&mut self, word: String, at: usize) -> Result<Expr> {
        match word.to_ascii_lowercase().as_str() {
            "true" => return Ok(Expr::Literal(Scalar::Bool(true))),
            "false" => return Ok(Expr::Literal(Scalar::Bool(false))),
            "null" | "none" => return Ok(Expr::Literal(Scalar::Null)),
            _ => {}
        }
        if word.eq_ignore_ascii_case("not") {
            let inner = self.expr(NOT_BP)?;
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                expr: Box::new(inner),
            });
        }
        if is_keyword(&word) {
            return Err(err(at, format!("unexpected keyword '{word}'")));
        }
        if self.eat_sym("(") {
            let func = Function::from_name(&word)
                .ok_or_else(|| err(at, format!("unknown function '{word}'")))?;
            let mut args = Vec::new();
            if !self.eat_sym(")") {
                loop {
                    args.push(self.expr(0)?);
                    if self.eat_sym(")") {
                        break;
                    }
                    if !self.eat_sym(",") {
                        return Err(err(self.offset(), "expected ',' or ')'"));
                    }
                }
            }
            let (min, max) = func.arity();
            if args.len() < min || args.len() > max {
                return Err(err(
                    at,
                    format!("{}() takes {} argument(s), got {}", func.name(), min, args.len()),
                ));
            }
            return Ok(Expr::Call { func, args });
        }
        Ok(Expr::Column(word))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn col(c: &str) -> Box<Expr> {
        Box::new(Expr::Column(c.to_string()))
    }

    #[test]
    fn precedence_follows_python() {
        let e = Expr::parse("a + b * 2 > 3 and not c").unwrap();
        assert_eq!(e.to_string(), "(((a + (b * 2)) > 3) and not c)");

        let e = Expr::parse("-x // 2 % 3").unwrap();
        assert_eq!(e.to_string(), "((-x // 2) % 3)");

        let e = Expr::parse("a or b and c").unwrap();
        assert_eq!(e.to_string(), "(a or (b and c))");
    }

    #[test]
    fn literals_and_calls() {
        let e = Expr::parse("coalesce(x, 'n/a', null)").unwrap();
        match e {
            Expr::Call { func, args } => {
                assert_eq!(func, Function::Coalesce);
                assert_eq!(args.len(), 3);
                assert_eq!(args[2], Expr::Literal(Scalar::Null));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            Expr::parse("-2.5").unwrap(),
            Expr::Literal(Scalar::F64(-2.5))
        );
        assert_eq!(
            Expr::parse("1e3").unwrap(),
            Expr::Literal(Scalar::F64(1000.0))
        );
        assert_eq!(
            Expr::parse("\"it's\"").unwrap(),
            Expr::Literal(Scalar::Str("it's".into()))
        );
    }

    #[test]
    fn quoted_identifiers() {
        let e = Expr::parse("`unit price` * 2").unwrap();
        assert_eq!(
            e,
            Expr::Binary {
                op: BinaryOp::Mul,
                left: col("unit price"),
                right: Box::new(Expr::Literal(Scalar::I64(2))),
            }
        );
        assert_eq!(e.to_string(), "(`unit price` * 2)");
    }

    #[test]
    fn projection_lists() {
        let udf = Udf::parse("price * qty AS total, name, len(name)").unwrap();
        assert_eq!(udf.len(), 3);
        assert_eq!(udf.output_names(), vec!["total", "name", "_2"]);
        assert!(udf.single().is_none());

        let udf = Udf::parse("x as y").unwrap();
        assert_eq!(udf.output_names(), vec!["y"]);
        assert_eq!(udf.single(), Some(&Expr::Column("x".into())));
    }

    #[test]
    fn column_listing() {
        let e = Expr::parse("a + b * a - upper(c)").unwrap();
        assert_eq!(e.columns(), vec!["a", "b", "c"]);
    }

    #[test]
    fn parse_errors_carry_positions() {
        match Expr::parse("a + ") {
            Err(Error::Expr { pos, .. }) => assert_eq!(pos, 4),
            other => panic!("unexpected {other:?}"),
        }
        assert!(Expr::parse("frobnicate(a)").is_err());
        assert!(Expr::parse("len(a, b)").is_err());
        assert!(Expr::parse("'open").is_err());
        assert!(Expr::parse("a b").is_err());
        assert!(Udf::parse("a AS").is_err());
    }

    #[test]
    fn udf_serializes_as_source() {
        let udf = Udf::parse("a + 1 AS b").unwrap();
        let json = serde_json::to_string(&udf).unwrap();
        assert_eq!(json, "\"a + 1 AS b\"");
        let back: Udf = serde_json::from_str(&json).unwrap();
        assert_eq!(back, udf);
        assert!(serde_json::from_str::<Udf>("\"a +\"").is_err());
    }
}
