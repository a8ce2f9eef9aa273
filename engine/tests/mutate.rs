//! Row-level mutation: updates and deletes through deletion vectors and
//! rewrites, and merge upserts.

use std::collections::HashMap;

use delta_engine::table::DeleteStrategy;
use delta_engine::{Filter, Value};

mod common;
use common::{create_table, ids_of, row};

#[tokio::test]
async fn update_one_row_in_a_hundred_uses_a_deletion_vector() {
    let table = create_table().await;
    table
        .write((1..=100).map(|i| row(i, &format!("n{i}"))).collect())
        .await
        .unwrap();

    let filter = Filter::parse(&serde_json::json!({"id": 50})).unwrap();
    let updates: HashMap<String, Value> =
        [("name".to_string(), Value::String("X".to_string()))].into_iter().collect();
    let result = table.update(&filter, &updates).await.unwrap();
    assert_eq!(result.version, Some(2));
    assert_eq!(result.rows_updated, 1);
    assert_eq!(result.files_with_new_deletion_vectors, 1);
    assert_eq!(result.files_rewritten, 0);

    // the original file is masked by a DV over row index 49, the updated row
    // lives in a new one-row file
    let snapshot = table.snapshot().await.unwrap();
    assert_eq!(snapshot.num_files(), 2);
    let masked = snapshot
        .files()
        .find(|add| add.deletion_vector.is_some())
        .expect("original file keeps its path with a deletion vector");
    let descriptor = masked.deletion_vector.as_ref().unwrap();
    assert_eq!(descriptor.cardinality, 1);
    let bitmap = descriptor.load(table.storage().as_ref()).await.unwrap();
    assert!(bitmap.contains(49));

    let rows = table.read(&Filter::all()).await.unwrap();
    assert_eq!(rows.len(), 100);
    let updated: Vec<_> = rows
        .iter()
        .filter(|r| r["id"] == Value::Integer(50))
        .collect();
    assert_eq!(updated.len(), 1);
    assert_eq!(updated[0]["name"], Value::String("X".to_string()));
}

#[tokio::test]
async fn update_most_rows_rewrites_the_file() {
    let table = create_table().await;
    table
        .write((1..=10).map(|i| row(i, "old")).collect())
        .await
        .unwrap();

    let filter = Filter::parse(&serde_json::json!({"id": {"$lte": 9}})).unwrap();
    let updates: HashMap<String, Value> =
        [("name".to_string(), Value::String("new".to_string()))].into_iter().collect();
    let result = table.update(&filter, &updates).await.unwrap();
    assert_eq!(result.rows_updated, 9);
    assert_eq!(result.files_rewritten, 1);
    assert_eq!(result.files_with_new_deletion_vectors, 0);

    let rows = table.read(&Filter::all()).await.unwrap();
    assert_eq!(rows.len(), 10);
    let renamed = rows
        .iter()
        .filter(|r| r["name"] == Value::String("new".to_string()))
        .count();
    assert_eq!(renamed, 9);
}

#[tokio::test]
async fn update_with_no_matches_commits_nothing() {
    let table = create_table().await;
    table.write(vec![row(1, "a")]).await.unwrap();
    let filter = Filter::parse(&serde_json::json!({"id": 999})).unwrap();
    let updates: HashMap<String, Value> =
        [("name".to_string(), Value::String("x".to_string()))].into_iter().collect();
    let result = table.update(&filter, &updates).await.unwrap();
    assert_eq!(result.version, None);
    assert_eq!(table.snapshot().await.unwrap().version(), 1);
}

#[tokio::test]
async fn delete_small_fraction_uses_deletion_vector() {
    let table = create_table().await;
    table
        .write((1..=100).map(|i| row(i, "x")).collect())
        .await
        .unwrap();

    let filter = Filter::parse(&serde_json::json!({"id": {"$in": [3, 7]}})).unwrap();
    let result = table.delete(&filter).await.unwrap();
    assert_eq!(result.rows_deleted, 2);
    assert_eq!(result.files_with_new_deletion_vectors, 1);

    let rows = table.read(&Filter::all()).await.unwrap();
    assert_eq!(rows.len(), 98);
    assert!(!ids_of(&rows).contains(&3));

    // a second delete merges into the existing vector
    let filter = Filter::parse(&serde_json::json!({"id": 11})).unwrap();
    table.delete(&filter).await.unwrap();
    let snapshot = table.snapshot().await.unwrap();
    let masked = snapshot.files().find(|a| a.deletion_vector.is_some()).unwrap();
    assert_eq!(masked.deletion_vector.as_ref().unwrap().cardinality, 3);
    assert_eq!(table.read(&Filter::all()).await.unwrap().len(), 97);
}

#[tokio::test]
async fn delete_everything_drops_the_file() {
    let table = create_table().await;
    table
        .write((1..=5).map(|i| row(i, "x")).collect())
        .await
        .unwrap();
    let result = table.delete(&Filter::all()).await.unwrap();
    assert_eq!(result.rows_deleted, 5);
    let snapshot = table.snapshot().await.unwrap();
    assert_eq!(snapshot.num_files(), 0);
    assert!(table.read(&Filter::all()).await.unwrap().is_empty());
}

#[tokio::test]
async fn forced_rewrite_strategy_never_writes_vectors() {
    let table = create_table().await;
    table
        .write((1..=100).map(|i| row(i, "x")).collect())
        .await
        .unwrap();
    let filter = Filter::parse(&serde_json::json!({"id": 1})).unwrap();
    let result = table
        .delete_with(&filter, DeleteStrategy::Rewrite, Default::default())
        .await
        .unwrap();
    assert_eq!(result.files_rewritten, 1);
    assert_eq!(result.files_with_new_deletion_vectors, 0);
    assert_eq!(table.read(&Filter::all()).await.unwrap().len(), 99);
}

#[tokio::test]
async fn merge_upserts_and_deletes() {
    let table = create_table().await;
    table
        .write(vec![row(1, "a"), row(2, "b"), row(3, "c")])
        .await
        .unwrap();

    // id=2 gets updated, id=3 deleted, id=4 inserted, id=5 skipped
    let source = vec![row(2, "b2"), row(3, "doomed"), row(4, "d"), row(5, "skip me")];
    let result = table
        .merge(vec!["id".to_string()])
        .when_matched(|existing, incoming| {
            match existing["id"].as_i64() {
                Some(3) => None,
                _ => Some(incoming.clone()),
            }
        })
        .when_not_matched(|incoming| {
            match incoming["id"].as_i64() {
                Some(5) => None,
                _ => Some(incoming.clone()),
            }
        })
        .execute(source)
        .await
        .unwrap();

    assert_eq!(result.rows_updated, 1);
    assert_eq!(result.rows_deleted, 1);
    assert_eq!(result.rows_inserted, 1);
    assert_eq!(result.rows_skipped, 1);

    let rows = table.read(&Filter::all()).await.unwrap();
    assert_eq!(ids_of(&rows), vec![1, 2, 4]);
    let two = rows.iter().find(|r| r["id"] == Value::Integer(2)).unwrap();
    assert_eq!(two["name"], Value::String("b2".to_string()));
}

#[tokio::test]
async fn merge_defaults_are_plain_upsert() {
    let table = create_table().await;
    table.write(vec![row(1, "old")]).await.unwrap();
    let result = table
        .merge(vec!["id".to_string()])
        .execute(vec![row(1, "new"), row(2, "fresh")])
        .await
        .unwrap();
    assert_eq!(result.rows_updated, 1);
    assert_eq!(result.rows_inserted, 1);

    let rows = table.read(&Filter::all()).await.unwrap();
    assert_eq!(ids_of(&rows), vec![1, 2]);
    let one = rows.iter().find(|r| r["id"] == Value::Integer(1)).unwrap();
    assert_eq!(one["name"], Value::String("new".to_string()));
}
