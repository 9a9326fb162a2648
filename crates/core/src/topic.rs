// Topic filters
//
// A topic names one table and, optionally, one column predicate:
//   orders
//   drums:status=eq.full
//   batches:quantity=gte.100
//   scans:station=in.(dock-1,dock-2)

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde_json::Value;
use thiserror::Error;

use crate::source::ChangeNotification;

/// Topic parse failure
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TopicError {
    #[error("topic is empty")]
    Empty,

    #[error("invalid table name '{0}'")]
    InvalidTable(String),

    #[error("malformed filter '{0}', expected column=op.value")]
    MalformedFilter(String),

    #[error("unknown filter operator '{0}'")]
    UnknownOperator(String),
}

/// Comparison operator of a topic filter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
    In,
}

impl FilterOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOp::Eq => "eq",
            FilterOp::Neq => "neq",
            FilterOp::Lt => "lt",
            FilterOp::Lte => "lte",
            FilterOp::Gt => "gt",
            FilterOp::Gte => "gte",
            FilterOp::In => "in",
        }
    }
}

impl FromStr for FilterOp {
    type Err = TopicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "eq" => Ok(FilterOp::Eq),
            "neq" => Ok(FilterOp::Neq),
            "lt" => Ok(FilterOp::Lt),
            "lte" => Ok(FilterOp::Lte),
            "gt" => Ok(FilterOp::Gt),
            "gte" => Ok(FilterOp::Gte),
            "in" => Ok(FilterOp::In),
            other => Err(TopicError::UnknownOperator(other.to_string())),
        }
    }
}

/// Column predicate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    pub column: String,
    pub op: FilterOp,
    /// Literal operands; exactly one unless `op` is `In`
    pub values: Vec<String>,
}

impl Filter {
    fn parse(raw: &str) -> Result<Self, TopicError> {
        let malformed = || TopicError::MalformedFilter(raw.to_string());

        let (column, rest) = raw.split_once('=').ok_or_else(malformed)?;
        let (op, operand) = rest.split_once('.').ok_or_else(malformed)?;
        if column.is_empty() || !is_identifier(column) {
            return Err(malformed());
        }
        let op: FilterOp = op.parse()?;

        let values = if op == FilterOp::In {
            let inner = operand
                .strip_prefix('(')
                .and_then(|s| s.strip_suffix(')'))
                .ok_or_else(malformed)?;
            let values: Vec<String> = inner.split(',').map(|v| v.trim().to_string()).collect();
            if values.iter().any(|v| v.is_empty()) {
                return Err(malformed());
            }
            values
        } else {
            vec![operand.to_string()]
        };

        Ok(Self {
            column: column.to_string(),
            op,
            values,
        })
    }

    /// Evaluate against one row; a missing column never matches
    pub fn matches(&self, row: &Value) -> bool {
        let Some(field) = row.get(&self.column) else {
            return false;
        };

        let ordering = |literal: &str| compare(field, literal);
        match self.op {
            FilterOp::Eq => ordering(&self.values[0]) == Some(Ordering::Equal),
            FilterOp::Neq => ordering(&self.values[0]) != Some(Ordering::Equal),
            FilterOp::Lt => ordering(&self.values[0]) == Some(Ordering::Less),
            FilterOp::Lte => matches!(
                ordering(&self.values[0]),
                Some(Ordering::Less | Ordering::Equal)
            ),
            FilterOp::Gt => ordering(&self.values[0]) == Some(Ordering::Greater),
            FilterOp::Gte => matches!(
                ordering(&self.values[0]),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            FilterOp::In => self
                .values
                .iter()
                .any(|v| ordering(v) == Some(Ordering::Equal)),
        }
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.op == FilterOp::In {
            write!(f, "{}=in.({})", self.column, self.values.join(","))
        } else {
            write!(f, "{}={}.{}", self.column, self.op.as_str(), self.values[0])
        }
    }
}

/// Order a JSON field relative to a filter literal.
///
/// Returns `None` when the two are not comparable.
fn compare(field: &Value, literal: &str) -> Option<Ordering> {
    match field {
        Value::String(s) => Some(s.as_str().cmp(literal)),
        Value::Number(n) => {
            let lhs = n.as_f64()?;
            let rhs: f64 = literal.parse().ok()?;
            lhs.partial_cmp(&rhs)
        }
        Value::Bool(b) => {
            let rhs: bool = literal.parse().ok()?;
            (*b == rhs).then_some(Ordering::Equal)
        }
        Value::Null => (literal == "null").then_some(Ordering::Equal),
        Value::Array(_) | Value::Object(_) => None,
    }
}

fn is_identifier(s: &str) -> bool {
    s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

// ============================================================================
// Topic
// ============================================================================

/// Named filter a listener subscribes to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topic {
    pub table: String,
    pub filter: Option<Filter>,
}

impl Topic {
    /// Topic covering every change on `table`
    pub fn table(table: impl Into<String>) -> Result<Self, TopicError> {
        let table = table.into();
        validate_table(&table)?;
        Ok(Self {
            table,
            filter: None,
        })
    }

    pub fn matches(&self, notification: &ChangeNotification) -> bool {
        if notification.table != self.table {
            return false;
        }
        match (&self.filter, notification.filter_row()) {
            (None, _) => true,
            (Some(filter), Some(row)) => filter.matches(row),
            (Some(_), None) => false,
        }
    }
}

fn validate_table(table: &str) -> Result<(), TopicError> {
    if table.is_empty() {
        return Err(TopicError::Empty);
    }
    if !is_identifier(table) {
        return Err(TopicError::InvalidTable(table.to_string()));
    }
    Ok(())
}

impl FromStr for Topic {
    type Err = TopicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(TopicError::Empty);
        }

        match s.split_once(':') {
            None => Topic::table(s),
            Some((table, filter)) => {
                validate_table(table)?;
                Ok(Self {
                    table: table.to_string(),
                    filter: Some(Filter::parse(filter)?),
                })
            }
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.filter {
            Some(filter) => write!(f, "{}:{}", self.table, filter),
            None => f.write_str(&self.table),
        }
    }
}
