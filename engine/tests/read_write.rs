//! Append + read paths: basic writes, partitioned layout, time travel,
//! history, checkpoints.

use std::collections::HashMap;

use delta_engine::path::extract_partition_values_from_path;
use delta_engine::schema::{DataType, StructField, StructType};
use delta_engine::storage::memory_backend;
use delta_engine::table_properties::CHECKPOINT_INTERVAL;
use delta_engine::{Filter, Table, Value};
use url::Url;

mod common;
use common::{create_table, ids_of, row};

#[tokio::test]
async fn append_then_read() {
    let table = create_table().await;
    let result = table
        .write(vec![row(1, "A"), row(2, "B")])
        .await
        .unwrap();
    assert_eq!(result.version, 1);
    assert_eq!(result.files_added, 1);
    assert_eq!(result.rows_written, 2);

    let rows = table.read(&Filter::all()).await.unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(ids_of(&rows), vec![1, 2]);
    assert_eq!(rows[0]["name"], Value::String("A".to_string()));

    // the log holds versions 0 (protocol+metadata) and 1 (commitInfo+add)
    let snapshot = table.snapshot().await.unwrap();
    assert_eq!(snapshot.version(), 1);
    let log = table.storage().list("_delta_log").await.unwrap();
    let mut names: Vec<_> = log.iter().map(|m| m.path.as_str()).collect();
    names.sort_unstable();
    assert_eq!(
        names,
        vec![
            "_delta_log/00000000000000000000.json",
            "_delta_log/00000000000000000001.json",
        ]
    );
}

#[tokio::test]
async fn filtered_read_uses_row_filter() {
    let table = create_table().await;
    table
        .write((1..=10).map(|i| row(i, "x")).collect())
        .await
        .unwrap();
    let filter = Filter::parse(&serde_json::json!({"id": {"$between": [3, 5]}})).unwrap();
    let rows = table.read(&filter).await.unwrap();
    assert_eq!(ids_of(&rows), vec![3, 4, 5]);
}

#[tokio::test]
async fn rejects_rows_that_do_not_match_schema() {
    let table = create_table().await;
    let bad: delta_engine::Row = [
        ("id".to_string(), Value::String("not an int".to_string())),
    ]
    .into_iter()
    .collect();
    assert!(table.write(vec![bad]).await.is_err());
    assert!(table.write(vec![]).await.is_err());
}

#[tokio::test]
async fn partitioned_writes_use_hive_paths() {
    let schema = StructType::new([
        StructField::new("id", DataType::Integer, false),
        StructField::new("region", DataType::String, true),
    ]);
    let table = Table::new(Url::parse("memory:///t").unwrap(), memory_backend())
        .create(schema)
        .with_partition_columns(vec!["region".to_string()])
        .execute()
        .await
        .unwrap();

    let rows = vec![
        [
            ("id".to_string(), Value::Integer(1)),
            ("region".to_string(), Value::String("eu".to_string())),
        ]
        .into_iter()
        .collect(),
        [
            ("id".to_string(), Value::Integer(2)),
            ("region".to_string(), Value::String("us".to_string())),
        ]
        .into_iter()
        .collect(),
    ];
    let result = table.write(rows).await.unwrap();
    assert_eq!(result.files_added, 2);

    let snapshot = table.snapshot().await.unwrap();
    for add in snapshot.files() {
        let parsed = extract_partition_values_from_path(&add.path);
        assert_eq!(parsed, add.partition_values);
        assert!(add.path.starts_with("region="));
    }

    // partition pruning keeps only the matching file
    let filter = Filter::parse(&serde_json::json!({"region": "eu"})).unwrap();
    let rows = table.read(&filter).await.unwrap();
    assert_eq!(ids_of(&rows), vec![1]);
}

#[tokio::test]
async fn time_travel_and_history() {
    let table = create_table().await;
    table.write(vec![row(1, "A")]).await.unwrap();
    table.write(vec![row(2, "B")]).await.unwrap();

    let v1 = table.snapshot_at(1).await.unwrap();
    assert_eq!(v1.num_files(), 1);
    let v2 = table.snapshot_at(2).await.unwrap();
    assert_eq!(v2.num_files(), 2);

    let history = table.history(None).await.unwrap();
    assert_eq!(history.len(), 3);
    assert_eq!(history[0].version, 2);
    assert_eq!(history[0].operation.as_deref(), Some("WRITE"));
    assert_eq!(history[0].read_version, Some(1));
    assert_eq!(history[0].is_blind_append, Some(true));
    assert_eq!(history[2].operation.as_deref(), Some("CREATE TABLE"));

    let limited = table.history(Some(1)).await.unwrap();
    assert_eq!(limited.len(), 1);
}

#[tokio::test]
async fn checkpoint_interval_consolidates_replay() {
    let config: HashMap<String, String> =
        [(CHECKPOINT_INTERVAL.to_string(), "2".to_string())].into_iter().collect();
    let table = Table::new(Url::parse("memory:///t").unwrap(), memory_backend())
        .create(common::id_name_schema())
        .with_configuration(config)
        .execute()
        .await
        .unwrap();

    for i in 0..5 {
        table.write(vec![row(i, "x")]).await.unwrap();
    }
    let pointer = delta_engine::checkpoint::last_checkpoint(table.storage().as_ref())
        .await
        .expect("a checkpoint should have been written");
    assert!(pointer.version >= 2);

    // replay from the checkpoint equals full state
    let snapshot = table.snapshot().await.unwrap();
    assert_eq!(snapshot.version(), 5);
    let rows = table.read(&Filter::all()).await.unwrap();
    assert_eq!(rows.len(), 5);
}
