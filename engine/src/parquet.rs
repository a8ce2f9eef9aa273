//! The columnar file adapter: dynamic rows in and out of parquet, with
//! row-group statistics for zone-map pruning.

use std::collections::HashMap;
use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, BinaryArray, BinaryBuilder, BooleanArray, BooleanBuilder, Float64Array,
    Float64Builder, Int64Array, Int64Builder, RecordBatch, StringArray, StringBuilder,
    TimestampNanosecondArray, TimestampNanosecondBuilder,
};
use arrow::datatypes::{DataType as ArrowDataType, Field, Schema as ArrowSchema, TimeUnit};
use bytes::Bytes;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::file::properties::WriterProperties;

use crate::error::{DeltaResult, Error};
use crate::predicate::Filter;
use crate::schema::{DataType, StructType};
use crate::stats::{ColumnZone, FileStats};
use crate::value::{Row, Value};

/// Statistics of one written row group.
#[derive(Debug, Clone, PartialEq)]
pub struct RowGroupStats {
    pub num_rows: u64,
    pub column_stats: HashMap<String, ColumnZone>,
}

/// Result of writing rows through the adapter.
#[derive(Debug, Clone)]
pub struct ParquetOutput {
    pub bytes: Bytes,
    pub row_groups: Vec<RowGroupStats>,
    /// File-level statistics (the row-group stats merged).
    pub stats: FileStats,
}

#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    /// Rows per row group; `None` writes a single group.
    pub row_group_size: Option<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
    /// Project to these columns; `None` reads everything.
    pub columns: Option<Vec<String>>,
    /// Read only these row groups; `None` reads all.
    pub row_groups: Option<Vec<usize>>,
    /// Row-level filter applied after decode.
    pub filter: Option<Filter>,
}

/// Columnar reader/writer contract. The engine treats the file encoding as a
/// black box that yields rows and zone maps.
pub trait ParquetAdapter: Send + Sync + std::fmt::Debug {
    fn write(
        &self,
        rows: &[Row],
        schema: &StructType,
        options: &WriteOptions,
    ) -> DeltaResult<ParquetOutput>;

    fn read(&self, bytes: Bytes, options: &ReadOptions) -> DeltaResult<Vec<Row>>;
}

/// The default adapter, backed by the arrow and parquet crates.
#[derive(Debug, Default, Clone, Copy)]
pub struct ArrowParquetAdapter;

fn arrow_type(data_type: DataType) -> ArrowDataType {
    match data_type {
        DataType::Boolean => ArrowDataType::Boolean,
        DataType::Integer | DataType::Long => ArrowDataType::Int64,
        DataType::Float | DataType::Double => ArrowDataType::Float64,
        DataType::String => ArrowDataType::Utf8,
        DataType::Binary => ArrowDataType::Binary,
        DataType::Timestamp => ArrowDataType::Timestamp(TimeUnit::Nanosecond, None),
    }
}

fn arrow_schema(schema: &StructType) -> Arc<ArrowSchema> {
    let fields: Vec<Field> = schema
        .fields
        .iter()
        .map(|f| Field::new(&f.name, arrow_type(f.data_type), true))
        .collect();
    Arc::new(ArrowSchema::new(fields))
}

fn build_column(
    rows: &[Row],
    name: &str,
    data_type: DataType,
) -> DeltaResult<ArrayRef> {
    macro_rules! build {
        ($builder:expr, $pattern:pat => $value:expr) => {{
            let mut builder = $builder;
            for row in rows {
                match row.get(name) {
                    None | Some(Value::Null) => builder.append_null(),
                    Some($pattern) => builder.append_value($value),
                    Some(other) => {
                        return Err(Error::validation(format!(
                            "column {name:?} expected {data_type:?}, row has {}",
                            other.type_name()
                        )))
                    }
                }
            }
            Arc::new(builder.finish()) as ArrayRef
        }};
    }
    Ok(match data_type {
        DataType::Boolean => build!(BooleanBuilder::new(), Value::Boolean(v) => *v),
        DataType::Integer | DataType::Long => build!(Int64Builder::new(), Value::Integer(v) => *v),
        DataType::Float | DataType::Double => build!(Float64Builder::new(), Value::Float(v) => *v),
        DataType::String => build!(StringBuilder::new(), Value::String(v) => v.as_str()),
        DataType::Binary => build!(BinaryBuilder::new(), Value::Bytes(v) => v.as_slice()),
        DataType::Timestamp => {
            build!(TimestampNanosecondBuilder::new(), Value::Timestamp(v) => *v)
        }
    })
}

fn to_record_batch(rows: &[Row], schema: &StructType) -> DeltaResult<RecordBatch> {
    let arrow_schema = arrow_schema(schema);
    let columns = schema
        .fields
        .iter()
        .map(|f| build_column(rows, &f.name, f.data_type))
        .collect::<DeltaResult<Vec<_>>>()?;
    Ok(RecordBatch::try_new(arrow_schema, columns)?)
}

fn column_value(array: &ArrayRef, index: usize) -> DeltaResult<Value> {
    if array.is_null(index) {
        return Ok(Value::Null);
    }
    let any = array.as_any();
    let value = if let Some(a) = any.downcast_ref::<BooleanArray>() {
        Value::Boolean(a.value(index))
    } else if let Some(a) = any.downcast_ref::<Int64Array>() {
        Value::Integer(a.value(index))
    } else if let Some(a) = any.downcast_ref::<Float64Array>() {
        Value::Float(a.value(index))
    } else if let Some(a) = any.downcast_ref::<StringArray>() {
        Value::String(a.value(index).to_string())
    } else if let Some(a) = any.downcast_ref::<BinaryArray>() {
        Value::Bytes(a.value(index).to_vec())
    } else if let Some(a) = any.downcast_ref::<TimestampNanosecondArray>() {
        Value::Timestamp(a.value(index))
    } else {
        return Err(Error::validation(format!(
            "unsupported arrow column type {:?}",
            array.data_type()
        )));
    };
    Ok(value)
}

impl ParquetAdapter for ArrowParquetAdapter {
    fn write(
        &self,
        rows: &[Row],
        schema: &StructType,
        options: &WriteOptions,
    ) -> DeltaResult<ParquetOutput> {
        let batch = to_record_batch(rows, schema)?;
        let mut properties = WriterProperties::builder();
        if let Some(size) = options.row_group_size {
            properties = properties.set_max_row_group_size(size.max(1));
        }
        let mut buffer = Vec::new();
        let mut writer =
            ArrowWriter::try_new(&mut buffer, batch.schema(), Some(properties.build()))?;
        writer.write(&batch)?;
        writer.close()?;

        let group_size = options.row_group_size.unwrap_or(rows.len()).max(1);
        let mut row_groups = Vec::new();
        let mut stats = FileStats::default();
        for chunk in rows.chunks(group_size) {
            let chunk_stats = FileStats::from_rows(chunk.iter());
            row_groups.push(RowGroupStats {
                num_rows: chunk_stats.num_records,
                column_stats: schema
                    .field_names()
                    .map(|name| (name.to_string(), chunk_stats.zone(name)))
                    .collect(),
            });
            stats.merge(&chunk_stats);
        }
        Ok(ParquetOutput {
            bytes: Bytes::from(buffer),
            row_groups,
            stats,
        })
    }

    fn read(&self, bytes: Bytes, options: &ReadOptions) -> DeltaResult<Vec<Row>> {
        let mut builder = ParquetRecordBatchReaderBuilder::try_new(bytes)?;
        if let Some(columns) = &options.columns {
            let file_schema = builder.schema().clone();
            let indices: Vec<usize> = columns
                .iter()
                .map(|name| {
                    file_schema.index_of(name).map_err(|_| {
                        Error::validation(format!("column {name:?} is not in the file"))
                    })
                })
                .collect::<DeltaResult<_>>()?;
            let mask =
                parquet::arrow::ProjectionMask::roots(builder.parquet_schema(), indices);
            builder = builder.with_projection(mask);
        }
        if let Some(row_groups) = &options.row_groups {
            builder = builder.with_row_groups(row_groups.clone());
        }
        let reader = builder.build()?;

        let mut rows = Vec::new();
        for batch in reader {
            let batch = batch?;
            let schema = batch.schema();
            for index in 0..batch.num_rows() {
                let mut row = Row::with_capacity(batch.num_columns());
                for (column, field) in batch.columns().iter().zip(schema.fields()) {
                    row.insert(field.name().clone(), column_value(column, index)?);
                }
                if options
                    .filter
                    .as_ref()
                    .map_or(true, |filter| filter.matches(&row))
                {
                    rows.push(row);
                }
            }
        }
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::StructField;
    use serde_json::json;

    fn schema() -> StructType {
        StructType::new([
            StructField::new("id", DataType::Integer, false),
            StructField::new("name", DataType::String, true),
            StructField::new("score", DataType::Double, true),
            StructField::new("ok", DataType::Boolean, true),
            StructField::new("at", DataType::Timestamp, true),
            StructField::new("blob", DataType::Binary, true),
        ])
    }

    fn sample_rows(n: i64) -> Vec<Row> {
        (0..n)
            .map(|i| {
                let row: Row = [
                    ("id".to_string(), Value::Integer(i)),
                    (
                        "name".to_string(),
                        if i % 5 == 0 {
                            Value::Null
                        } else {
                            Value::String(format!("row-{i}"))
                        },
                    ),
                    ("score".to_string(), Value::Float(i as f64 / 2.0)),
                    ("ok".to_string(), Value::Boolean(i % 2 == 0)),
                    ("at".to_string(), Value::Timestamp(1_700_000_000_000_000_000 + i)),
                    ("blob".to_string(), Value::Bytes(vec![i as u8; 3])),
                ]
                .into_iter()
                .collect();
                schema().normalize_row(row).unwrap()
            })
            .collect()
    }

    #[test]
    fn write_read_round_trip() {
        let adapter = ArrowParquetAdapter;
        let rows = sample_rows(20);
        let output = adapter
            .write(&rows, &schema(), &WriteOptions::default())
            .unwrap();
        assert_eq!(output.stats.num_records, 20);
        assert_eq!(output.row_groups.len(), 1);
        assert_eq!(output.stats.null_count["name"], 4);

        let back = adapter.read(output.bytes, &ReadOptions::default()).unwrap();
        assert_eq!(back, rows);
    }

    #[test]
    fn row_groups_carry_zone_maps() {
        let adapter = ArrowParquetAdapter;
        let rows = sample_rows(10);
        let output = adapter
            .write(
                &rows,
                &schema(),
                &WriteOptions {
                    row_group_size: Some(4),
                },
            )
            .unwrap();
        assert_eq!(output.row_groups.len(), 3);
        assert_eq!(output.row_groups[0].num_rows, 4);
        let zone = &output.row_groups[0].column_stats["id"];
        assert_eq!(zone.min, Some(Value::Integer(0)));
        assert_eq!(zone.max, Some(Value::Integer(3)));
        assert_eq!(output.stats.max_values["id"], Value::Integer(9));
    }

    #[test]
    fn projection_and_filter() {
        let adapter = ArrowParquetAdapter;
        let rows = sample_rows(10);
        let output = adapter
            .write(&rows, &schema(), &WriteOptions::default())
            .unwrap();

        let options = ReadOptions {
            columns: Some(vec!["id".to_string(), "ok".to_string()]),
            row_groups: None,
            filter: Some(Filter::parse(&json!({"id": {"$gte": 8}})).unwrap()),
        };
        let narrow = adapter.read(output.bytes, &options).unwrap();
        assert_eq!(narrow.len(), 2);
        assert_eq!(narrow[0].len(), 2);
        assert_eq!(narrow[0]["id"], Value::Integer(8));
        assert!(narrow[0].get("name").is_none());
    }

    #[test]
    fn type_mismatch_is_a_validation_error() {
        let adapter = ArrowParquetAdapter;
        let row: Row = [("id".to_string(), Value::String("oops".to_string()))]
            .into_iter()
            .collect();
        let schema = StructType::new([StructField::new("id", DataType::Integer, true)]);
        assert!(matches!(
            adapter.write(&[row], &schema, &WriteOptions::default()),
            Err(Error::Validation(_))
        ));
    }
}
