use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};

/// A literal operand of a filter comparison.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Time(DateTime<Utc>),
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "'{}'", s.replace('\'', "''")),
            Self::Time(t) => f.write_str(&t.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
        }
    }
}

impl From<&str> for Literal {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for Literal {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<&String> for Literal {
    fn from(value: &String) -> Self {
        Self::String(value.clone())
    }
}

impl From<bool> for Literal {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Literal {
    fn from(value: i64) -> Self {
        Self::Number(value as f64)
    }
}

impl From<u32> for Literal {
    fn from(value: u32) -> Self {
        Self::Number(f64::from(value))
    }
}

impl From<DateTime<Utc>> for Literal {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Time(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shape {
    Comparison,
    And,
    Or,
    /// Raw text of unknown precedence, always parenthesized when combined.
    Raw,
}

/// Builder for filter strings.
///
/// Operands of `and` are parenthesized when they could otherwise bind
/// differently, so combining builders never changes their meaning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    text: String,
    shape: Shape,
}

impl Filter {
    fn compare(field: &str, op: &str, value: impl Into<Literal>) -> Self {
        Self {
            text: format!("{field} {op} {}", value.into()),
            shape: Shape::Comparison,
        }
    }

    pub fn eq(field: &str, value: impl Into<Literal>) -> Self {
        Self::compare(field, "eq", value)
    }

    pub fn ne(field: &str, value: impl Into<Literal>) -> Self {
        Self::compare(field, "ne", value)
    }

    pub fn lt(field: &str, value: impl Into<Literal>) -> Self {
        Self::compare(field, "lt", value)
    }

    pub fn gt(field: &str, value: impl Into<Literal>) -> Self {
        Self::compare(field, "gt", value)
    }

    pub fn is_null(field: &str) -> Self {
        Self::compare(field, "eq", Literal::Null)
    }

    /// Wraps an externally supplied filter, such as a scan scope.
    pub fn raw(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            shape: Shape::Raw,
        }
    }

    /// `field ne v1 and field ne v2 ...`
    pub fn not_in<I, V>(field: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Literal>,
    {
        values
            .into_iter()
            .map(|v| Self::ne(field, v))
            .reduce(Self::and)
            .unwrap_or_else(|| Self::raw(""))
    }

    pub fn and(self, other: Filter) -> Self {
        if self.is_empty() {
            return other;
        }
        if other.is_empty() {
            return self;
        }
        let lhs = self.operand_of(Shape::And);
        let rhs = other.operand_of(Shape::And);
        Self {
            text: format!("{lhs} and {rhs}"),
            shape: Shape::And,
        }
    }

    pub fn or(self, other: Filter) -> Self {
        if self.is_empty() {
            return other;
        }
        if other.is_empty() {
            return self;
        }
        let lhs = self.operand_of(Shape::Or);
        let rhs = other.operand_of(Shape::Or);
        Self {
            text: format!("{lhs} or {rhs}"),
            shape: Shape::Or,
        }
    }

    pub fn group(self) -> Self {
        if self.is_empty() {
            return self;
        }
        Self {
            text: format!("({})", self.text),
            shape: Shape::Comparison,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    fn operand_of(&self, parent: Shape) -> String {
        let needs_parens = match (self.shape, parent) {
            (Shape::Raw, _) => true,
            (Shape::Or, Shape::And) => true,
            _ => false,
        };
        if needs_parens {
            format!("({})", self.text)
        } else {
            self.text.clone()
        }
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl From<Filter> for String {
    fn from(filter: Filter) -> Self {
        filter.text
    }
}
