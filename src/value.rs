//! Literal values extracted from the parsed AST.
//!
//! The planner never evaluates expressions; it only needs literals far enough
//! to hand them to the router for segment lookups and to render them back
//! into pushed-down SQL text.

use serde::{Deserialize, Serialize};
use sqlparser::ast::{Value as AstValue, ValueWithSpan};
use sqlparser::tokenizer::Span;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Literal {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(String),
}

impl Literal {
    pub fn from_ast(value: &AstValue) -> Option<Literal> {
        match value {
            AstValue::Null => Some(Literal::Null),
            AstValue::Boolean(b) => Some(Literal::Boolean(*b)),
            AstValue::Number(n, _) => {
                if let Ok(i) = n.parse::<i64>() {
                    Some(Literal::Integer(i))
                } else {
                    n.parse::<f64>().ok().map(Literal::Float)
                }
            }
            AstValue::SingleQuotedString(s)
            | AstValue::DoubleQuotedString(s)
            | AstValue::EscapedStringLiteral(s)
            | AstValue::NationalStringLiteral(s) => Some(Literal::String(s.clone())),
            _ => None,
        }
    }

    pub fn from_ast_spanned(value: &ValueWithSpan) -> Option<Literal> {
        Literal::from_ast(&value.value)
    }
}

/// A spanless `NULL` literal, for synthesising placeholder projections.
pub fn null_value_with_span() -> ValueWithSpan {
    ValueWithSpan {
        value: AstValue::Null,
        span: Span::empty(),
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Null => write!(f, "NULL"),
            Literal::Boolean(b) => write!(f, "{}", b),
            Literal::Integer(i) => write!(f, "{}", i),
            Literal::Float(v) => write!(f, "{}", v),
            Literal::String(s) => write!(f, "'{}'", s.replace('\'', "''")),
        }
    }
}
