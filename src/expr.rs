//! Predicate AST accepted by the index.

use crate::error::IndexError;
use std::fmt;

/// Binary operators of the predicate language.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Eq,
    Neq,
    EqRegex,
    NeqRegex,
    Lt,
    Lte,
    Gt,
    Gte,
    And,
    Or,
}

impl BinaryOp {
    fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Eq => "=",
            BinaryOp::Neq => "!=",
            BinaryOp::EqRegex => "=~",
            BinaryOp::NeqRegex => "!~",
            BinaryOp::Lt => "<",
            BinaryOp::Lte => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Gte => ">=",
            BinaryOp::And => "AND",
            BinaryOp::Or => "OR",
        }
    }
}

/// Kind of a variable reference. Only tag references can be answered by the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VarKind {
    Tag,
    Field,
    Unknown,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Paren(Box<Expr>),
    BooleanLiteral(bool),
    VarRef {
        name: String,
        kind: VarKind,
    },
    StringLiteral(String),
    /// Regex source; compiled when a tag filter is built.
    RegexLiteral(String),
    NumberLiteral(f64),
    IntegerLiteral(i64),
}

impl Expr {
    pub fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Expr {
        Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    pub fn tag(name: impl Into<String>) -> Expr {
        Expr::VarRef {
            name: name.into(),
            kind: VarKind::Tag,
        }
    }

    pub fn field(name: impl Into<String>) -> Expr {
        Expr::VarRef {
            name: name.into(),
            kind: VarKind::Field,
        }
    }

    pub fn string(s: impl Into<String>) -> Expr {
        Expr::StringLiteral(s.into())
    }

    pub fn regex(s: impl Into<String>) -> Expr {
        Expr::RegexLiteral(s.into())
    }

    /// `key = 'value'`
    pub fn tag_eq(key: &str, value: &str) -> Expr {
        Expr::binary(BinaryOp::Eq, Expr::tag(key), Expr::string(value))
    }

    /// `key != 'value'`
    pub fn tag_neq(key: &str, value: &str) -> Expr {
        Expr::binary(BinaryOp::Neq, Expr::tag(key), Expr::string(value))
    }

    /// `key =~ /pattern/`
    pub fn tag_match(key: &str, pattern: &str) -> Expr {
        Expr::binary(BinaryOp::EqRegex, Expr::tag(key), Expr::regex(pattern))
    }

    /// `key !~ /pattern/`
    pub fn tag_not_match(key: &str, pattern: &str) -> Expr {
        Expr::binary(BinaryOp::NeqRegex, Expr::tag(key), Expr::regex(pattern))
    }

    pub fn and(lhs: Expr, rhs: Expr) -> Expr {
        Expr::binary(BinaryOp::And, lhs, rhs)
    }

    pub fn or(lhs: Expr, rhs: Expr) -> Expr {
        Expr::binary(BinaryOp::Or, lhs, rhs)
    }

    pub fn paren(inner: Expr) -> Expr {
        Expr::Paren(Box::new(inner))
    }

    /// Strips any number of enclosing parentheses.
    pub fn unparen(&self) -> &Expr {
        let mut e = self;
        while let Expr::Paren(inner) = e {
            e = inner;
        }
        e
    }

    /// Splits a (possibly parenthesised) binary expression into its parts.
    pub fn as_binary(&self) -> Result<(BinaryOp, &Expr, &Expr), IndexError> {
        match self.unparen() {
            Expr::Binary { op, lhs, rhs } => Ok((*op, lhs, rhs)),
            other => Err(IndexError::InvalidExpr(format!(
                "expected binary expression, got {}",
                other
            ))),
        }
    }

    pub fn is_binary(&self) -> bool {
        matches!(self.unparen(), Expr::Binary { .. })
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Binary { op, lhs, rhs } => write!(f, "{} {} {}", lhs, op.symbol(), rhs),
            Expr::Paren(inner) => write!(f, "({})", inner),
            Expr::BooleanLiteral(b) => write!(f, "{}", b),
            Expr::VarRef { name, kind } => match kind {
                VarKind::Tag => write!(f, "{}::tag", name),
                VarKind::Field => write!(f, "{}::field", name),
                VarKind::Unknown => write!(f, "{}", name),
            },
            Expr::StringLiteral(s) => write!(f, "'{}'", s.replace('\'', "\\'")),
            Expr::RegexLiteral(r) => write!(f, "/{}/", r.replace('/', "\\/")),
            Expr::NumberLiteral(n) => write!(f, "{}", n),
            Expr::IntegerLiteral(i) => write!(f, "{}", i),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_readable() {
        let e = Expr::and(
            Expr::tag_eq("host", "a"),
            Expr::paren(Expr::tag_match("region", "^eu")),
        );
        assert_eq!(e.to_string(), "host::tag = 'a' AND (region::tag =~ /^eu/)");
    }

    #[test]
    fn as_binary_strips_parens() {
        let e = Expr::paren(Expr::paren(Expr::tag_eq("a", "b")));
        let (op, lhs, rhs) = e.as_binary().unwrap();
        assert_eq!(op, BinaryOp::Eq);
        assert_eq!(lhs, &Expr::tag("a"));
        assert_eq!(rhs, &Expr::string("b"));
        assert!(Expr::BooleanLiteral(true).as_binary().is_err());
    }
}
