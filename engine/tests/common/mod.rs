//! Shared fixtures for the integration suites.
#![allow(dead_code)]

use std::collections::HashMap;

use delta_engine::schema::{DataType, StructField, StructType};
use delta_engine::storage::memory_backend;
use delta_engine::table_properties::ENABLE_CHANGE_DATA_FEED;
use delta_engine::{Row, Table, Value};
use url::Url;

pub fn id_name_schema() -> StructType {
    StructType::new([
        StructField::new("id", DataType::Integer, false),
        StructField::new("name", DataType::String, true),
    ])
}

pub fn row(id: i64, name: &str) -> Row {
    [
        ("id".to_string(), Value::Integer(id)),
        ("name".to_string(), Value::String(name.to_string())),
    ]
    .into_iter()
    .collect()
}

pub fn memory_table() -> Table {
    Table::new(Url::parse("memory:///table").unwrap(), memory_backend())
}

/// An empty `{id, name}` table on a fresh in-memory backend.
pub async fn create_table() -> Table {
    memory_table()
        .create(id_name_schema())
        .execute()
        .await
        .expect("create table")
}

/// Same, with change data capture enabled.
pub async fn create_cdc_table() -> Table {
    let config: HashMap<String, String> =
        [(ENABLE_CHANGE_DATA_FEED.to_string(), "true".to_string())]
            .into_iter()
            .collect();
    memory_table()
        .create(id_name_schema())
        .with_configuration(config)
        .execute()
        .await
        .expect("create cdc table")
}

pub fn ids_of(rows: &[Row]) -> Vec<i64> {
    let mut ids: Vec<i64> = rows
        .iter()
        .map(|row| row["id"].as_i64().expect("id column"))
        .collect();
    ids.sort_unstable();
    ids
}
