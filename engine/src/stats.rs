//! Per-file statistics and zone-map based data skipping.
//!
//! Every written data file carries `{numRecords, minValues, maxValues,
//! nullCount}` in its `add.stats` JSON. Reads translate the user filter into
//! zone-map predicates and prune files whose ranges provably exclude every
//! matching row.

use std::cmp::Ordering;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::DeltaResult;
use crate::predicate::{CompareOp, Filter, Operand};
use crate::value::{value_cmp, Row, Value};

/// Zone map for a single column of a single file or row group.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ColumnZone {
    pub min: Option<Value>,
    pub max: Option<Value>,
    pub null_count: u64,
}

/// File-level statistics, serialized into `add.stats` as a JSON string.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileStats {
    pub num_records: u64,
    #[serde(default)]
    pub min_values: HashMap<String, Value>,
    #[serde(default)]
    pub max_values: HashMap<String, Value>,
    #[serde(default)]
    pub null_count: HashMap<String, u64>,
}

impl FileStats {
    /// Derive statistics from materialized rows.
    pub fn from_rows<'a>(rows: impl IntoIterator<Item = &'a Row>) -> Self {
        let mut stats = FileStats::default();
        for row in rows {
            stats.num_records += 1;
            for (column, value) in row {
                if value.is_null() {
                    *stats.null_count.entry(column.clone()).or_default() += 1;
                    continue;
                }
                stats.null_count.entry(column.clone()).or_default();
                match stats.min_values.get(column) {
                    Some(current) if value_cmp(value, current) != Some(Ordering::Less) => {}
                    _ => {
                        stats.min_values.insert(column.clone(), value.clone());
                    }
                }
                match stats.max_values.get(column) {
                    Some(current) if value_cmp(value, current) != Some(Ordering::Greater) => {}
                    _ => {
                        stats.max_values.insert(column.clone(), value.clone());
                    }
                }
            }
        }
        stats
    }

    pub fn parse(stats_json: &str) -> DeltaResult<Self> {
        Ok(serde_json::from_str(stats_json)?)
    }

    pub fn to_json(&self) -> DeltaResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// The zone map for one column. Bounds are `None` when the file carries no
    /// statistic for the column, which conservatively disables skipping.
    pub fn zone(&self, column: &str) -> ColumnZone {
        ColumnZone {
            min: self.min_values.get(column).cloned(),
            max: self.max_values.get(column).cloned(),
            null_count: self.null_count.get(column).copied().unwrap_or(0),
        }
    }

    /// Merge another file's statistics into this one (used when bin-packing
    /// several source files into one output).
    pub fn merge(&mut self, other: &FileStats) {
        self.num_records += other.num_records;
        for (column, count) in &other.null_count {
            *self.null_count.entry(column.clone()).or_default() += count;
        }
        for (column, value) in &other.min_values {
            match self.min_values.get(column) {
                Some(current) if value_cmp(value, current) != Some(Ordering::Less) => {}
                _ => {
                    self.min_values.insert(column.clone(), value.clone());
                }
            }
        }
        for (column, value) in &other.max_values {
            match self.max_values.get(column) {
                Some(current) if value_cmp(value, current) != Some(Ordering::Greater) => {}
                _ => {
                    self.max_values.insert(column.clone(), value.clone());
                }
            }
        }
    }
}

/// True iff the zone provably excludes every row satisfying `op operand`.
/// Any unknown bound returns false.
pub fn can_skip_zone_map(zone: &ColumnZone, op: CompareOp, operand: &Operand) -> bool {
    let (Some(min), Some(max)) = (&zone.min, &zone.max) else {
        return false;
    };
    use Ordering::*;
    match (op, operand) {
        (CompareOp::Eq, Operand::One(v)) => {
            value_cmp(max, v) == Some(Less) || value_cmp(min, v) == Some(Greater)
        }
        // `ne` can only be excluded by a constant column with no nulls
        (CompareOp::Ne, Operand::One(v)) => {
            zone.null_count == 0
                && value_cmp(min, v) == Some(Equal)
                && value_cmp(max, v) == Some(Equal)
        }
        (CompareOp::Gt, Operand::One(v)) => matches!(value_cmp(max, v), Some(Less | Equal)),
        (CompareOp::Gte, Operand::One(v)) => value_cmp(max, v) == Some(Less),
        (CompareOp::Lt, Operand::One(v)) => matches!(value_cmp(min, v), Some(Greater | Equal)),
        (CompareOp::Lte, Operand::One(v)) => value_cmp(min, v) == Some(Greater),
        (CompareOp::In, Operand::Many(vs)) => {
            !vs.is_empty()
                && vs
                    .iter()
                    .all(|v| can_skip_zone_map(zone, CompareOp::Eq, &Operand::One(v.clone())))
        }
        (CompareOp::Between, Operand::Range(low, high)) => {
            value_cmp(max, low) == Some(Less) || value_cmp(min, high) == Some(Greater)
        }
        _ => false,
    }
}

/// True iff the file's statistics prove that no row can satisfy `filter`.
///
/// Only comparison leaves reachable through conjunctions contribute;
/// `$or`, `$not`, and `$nor` subtrees pass through unpruned.
pub fn can_skip_file(stats: Option<&FileStats>, filter: &Filter) -> bool {
    let Some(stats) = stats else { return false };
    can_skip(stats, filter)
}

fn can_skip(stats: &FileStats, filter: &Filter) -> bool {
    match filter {
        Filter::And(fs) => fs.iter().any(|f| can_skip(stats, f)),
        Filter::Compare {
            column,
            op,
            operand,
        } => can_skip_zone_map(&stats.zone(column), *op, operand),
        Filter::True | Filter::Or(_) | Filter::Not(_) | Filter::Nor(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rows() -> Vec<Row> {
        (1..=10)
            .map(|id| {
                [
                    ("id".to_string(), Value::Integer(id)),
                    (
                        "name".to_string(),
                        if id == 3 {
                            Value::Null
                        } else {
                            Value::String(format!("n{id}"))
                        },
                    ),
                ]
                .into_iter()
                .collect()
            })
            .collect()
    }

    #[test]
    fn stats_from_rows() {
        let stats = FileStats::from_rows(rows().iter());
        assert_eq!(stats.num_records, 10);
        assert_eq!(stats.min_values["id"], Value::Integer(1));
        assert_eq!(stats.max_values["id"], Value::Integer(10));
        assert_eq!(stats.null_count["name"], 1);
        assert_eq!(stats.null_count["id"], 0);
    }

    #[test]
    fn stats_json_round_trip() {
        let stats = FileStats::from_rows(rows().iter());
        let text = stats.to_json().unwrap();
        assert!(text.contains("numRecords"));
        assert_eq!(FileStats::parse(&text).unwrap(), stats);
    }

    #[test]
    fn skip_decisions() {
        let stats = FileStats::from_rows(rows().iter());
        let skip = |doc| can_skip_file(Some(&stats), &Filter::parse(&doc).unwrap());

        assert!(skip(json!({"id": 42})));
        assert!(!skip(json!({"id": 10})));
        assert!(skip(json!({"id": {"$gt": 10}})));
        assert!(!skip(json!({"id": {"$gte": 10}})));
        assert!(skip(json!({"id": {"$lt": 1}})));
        assert!(skip(json!({"id": {"$between": [11, 20]}})));
        assert!(skip(json!({"id": {"$in": [0, 11]}})));
        assert!(!skip(json!({"id": {"$in": [0, 5]}})));
        // conjunction skips when any conjunct is excluded
        assert!(skip(json!({"name": "n1", "id": {"$lt": 0}})));
        // disjunctions pass through unpruned
        assert!(!skip(json!({"$or": [{"id": 42}]})));
        // unknown column bounds prevent skipping
        assert!(!skip(json!({"other": 1})));
    }

    #[test]
    fn ne_needs_constant_column_without_nulls() {
        let constant: Vec<Row> = (0..3)
            .map(|_| [("id".to_string(), Value::Integer(7))].into_iter().collect())
            .collect();
        let stats = FileStats::from_rows(constant.iter());
        assert!(can_skip_file(
            Some(&stats),
            &Filter::parse(&json!({"id": {"$ne": 7}})).unwrap()
        ));
        assert!(!can_skip_file(
            Some(&stats),
            &Filter::parse(&json!({"id": {"$ne": 8}})).unwrap()
        ));
    }

    #[test]
    fn merge_widens_bounds() {
        let mut a = FileStats::from_rows(rows().iter());
        let more: Vec<Row> = vec![[("id".to_string(), Value::Integer(50))].into_iter().collect()];
        let b = FileStats::from_rows(more.iter());
        a.merge(&b);
        assert_eq!(a.num_records, 11);
        assert_eq!(a.max_values["id"], Value::Integer(50));
        assert_eq!(a.min_values["id"], Value::Integer(1));
    }
}
