//! User-level filters. Filters arrive as MongoDB-style JSON documents
//! (`{"id": {"$gt": 5}}`) and are evaluated row-wise; the comparison leaves
//! that can be proven against zone maps feed data skipping in [`crate::stats`].

use serde_json::Value as JsonValue;

use crate::error::{DeltaResult, Error};
use crate::value::{value_cmp, value_eq, Row, Value};

/// Comparison operators supported on filter leaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    Between,
}

/// The right-hand side of a comparison.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    One(Value),
    Many(Vec<Value>),
    Range(Value, Value),
}

/// A parsed filter tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    True,
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Nor(Vec<Filter>),
    Not(Box<Filter>),
    Compare {
        column: String,
        op: CompareOp,
        operand: Operand,
    },
}

impl Filter {
    /// A filter that matches every row.
    pub fn all() -> Self {
        Filter::True
    }

    /// Parse a MongoDB-style filter document.
    pub fn parse(doc: &JsonValue) -> DeltaResult<Self> {
        let obj = doc
            .as_object()
            .ok_or_else(|| Error::validation("filter must be a JSON object"))?;
        let mut clauses = Vec::with_capacity(obj.len());
        for (key, value) in obj {
            match key.as_str() {
                "$and" => clauses.push(Filter::And(Self::parse_list(value, "$and")?)),
                "$or" => clauses.push(Filter::Or(Self::parse_list(value, "$or")?)),
                "$nor" => clauses.push(Filter::Nor(Self::parse_list(value, "$nor")?)),
                "$not" => clauses.push(Filter::Not(Box::new(Self::parse(value)?))),
                key if key.starts_with('$') => {
                    return Err(Error::validation(format!("unknown filter operator {key:?}")))
                }
                column => clauses.push(Self::parse_field(column, value)?),
            }
        }
        Ok(match clauses.len() {
            0 => Filter::True,
            1 => clauses.remove(0),
            _ => Filter::And(clauses),
        })
    }

    fn parse_list(value: &JsonValue, op: &str) -> DeltaResult<Vec<Filter>> {
        let items = value
            .as_array()
            .ok_or_else(|| Error::validation(format!("{op} expects an array of filters")))?;
        items.iter().map(Self::parse).collect()
    }

    fn parse_field(column: &str, value: &JsonValue) -> DeltaResult<Filter> {
        // An object whose keys all start with '$' is a set of operators;
        // anything else is shorthand for equality.
        let operators = match value.as_object() {
            Some(map) if map.keys().all(|k| k.starts_with('$')) && !map.is_empty() => map,
            _ => {
                return Ok(Filter::Compare {
                    column: column.to_string(),
                    op: CompareOp::Eq,
                    operand: Operand::One(json_to_value(value)?),
                })
            }
        };
        let mut clauses = Vec::with_capacity(operators.len());
        for (op_key, operand) in operators {
            let (op, operand) = match op_key.as_str() {
                "$eq" => (CompareOp::Eq, Operand::One(json_to_value(operand)?)),
                "$ne" => (CompareOp::Ne, Operand::One(json_to_value(operand)?)),
                "$gt" => (CompareOp::Gt, Operand::One(json_to_value(operand)?)),
                "$gte" => (CompareOp::Gte, Operand::One(json_to_value(operand)?)),
                "$lt" => (CompareOp::Lt, Operand::One(json_to_value(operand)?)),
                "$lte" => (CompareOp::Lte, Operand::One(json_to_value(operand)?)),
                "$in" => (CompareOp::In, Operand::Many(json_to_values(operand, "$in")?)),
                "$between" => {
                    let bounds = json_to_values(operand, "$between")?;
                    let [low, high]: [Value; 2] = bounds
                        .try_into()
                        .map_err(|_| Error::validation("$between expects [low, high]"))?;
                    (CompareOp::Between, Operand::Range(low, high))
                }
                other => {
                    return Err(Error::validation(format!(
                        "unknown comparison operator {other:?} on column {column:?}"
                    )))
                }
            };
            clauses.push(Filter::Compare {
                column: column.to_string(),
                op,
                operand,
            });
        }
        Ok(match clauses.len() {
            1 => clauses.remove(0),
            _ => Filter::And(clauses),
        })
    }

    /// Evaluate the filter against a row. Missing columns read as null; null
    /// never satisfies an ordered comparison.
    pub fn matches(&self, row: &Row) -> bool {
        match self {
            Filter::True => true,
            Filter::And(fs) => fs.iter().all(|f| f.matches(row)),
            Filter::Or(fs) => fs.iter().any(|f| f.matches(row)),
            Filter::Nor(fs) => !fs.iter().any(|f| f.matches(row)),
            Filter::Not(f) => !f.matches(row),
            Filter::Compare {
                column,
                op,
                operand,
            } => {
                let actual = row.get(column).unwrap_or(&Value::Null);
                compare(actual, *op, operand)
            }
        }
    }

    /// Columns referenced anywhere in the filter.
    pub fn referenced_columns(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_columns(&mut out);
        out.sort_unstable();
        out.dedup();
        out
    }

    fn collect_columns<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Filter::True => {}
            Filter::And(fs) | Filter::Or(fs) | Filter::Nor(fs) => {
                fs.iter().for_each(|f| f.collect_columns(out))
            }
            Filter::Not(f) => f.collect_columns(out),
            Filter::Compare { column, .. } => out.push(column),
        }
    }
}

fn compare(actual: &Value, op: CompareOp, operand: &Operand) -> bool {
    use std::cmp::Ordering::*;
    match (op, operand) {
        (CompareOp::Eq, Operand::One(v)) => value_eq(actual, v),
        (CompareOp::Ne, Operand::One(v)) => !value_eq(actual, v),
        (CompareOp::Gt, Operand::One(v)) => value_cmp(actual, v) == Some(Greater),
        (CompareOp::Gte, Operand::One(v)) => {
            matches!(value_cmp(actual, v), Some(Greater | Equal))
        }
        (CompareOp::Lt, Operand::One(v)) => value_cmp(actual, v) == Some(Less),
        (CompareOp::Lte, Operand::One(v)) => matches!(value_cmp(actual, v), Some(Less | Equal)),
        (CompareOp::In, Operand::Many(vs)) => vs.iter().any(|v| value_eq(actual, v)),
        (CompareOp::Between, Operand::Range(low, high)) => {
            matches!(value_cmp(actual, low), Some(Greater | Equal))
                && matches!(value_cmp(actual, high), Some(Less | Equal))
        }
        _ => false,
    }
}

fn json_to_value(value: &JsonValue) -> DeltaResult<Value> {
    Ok(serde_json::from_value(value.clone())?)
}

fn json_to_values(value: &JsonValue, op: &str) -> DeltaResult<Vec<Value>> {
    let items = value
        .as_array()
        .ok_or_else(|| Error::validation(format!("{op} expects an array")))?;
    items.iter().map(json_to_value).collect()
}
