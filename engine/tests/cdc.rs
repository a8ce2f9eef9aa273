//! Change data capture: version reads, time reads, ordering, filters, and
//! subscriptions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use delta_engine::cdc::{
    ChangeDataFilter, ChangeRecord, ChangeType, OpCode, SubscribeOptions,
};
use delta_engine::{CdcErrorKind, Error, Filter, Value};

mod common;
use common::{create_cdc_table, create_table, row};

#[tokio::test]
async fn insert_then_update_yields_ordered_records() {
    let table = create_cdc_table().await;
    table.write(vec![row(1, "A")]).await.unwrap();

    let filter = Filter::parse(&serde_json::json!({"id": 1})).unwrap();
    let updates: HashMap<String, Value> =
        [("name".to_string(), Value::String("A2".to_string()))].into_iter().collect();
    table.update(&filter, &updates).await.unwrap();

    let records = table.changes_between(1, 2).await.unwrap();
    let kinds: Vec<ChangeType> = records.iter().map(|r| r.change_type).collect();
    assert_eq!(
        kinds,
        vec![
            ChangeType::Insert,
            ChangeType::UpdatePreimage,
            ChangeType::UpdatePostimage,
        ]
    );
    assert_eq!(records[0].commit_version, 1);
    assert_eq!(records[0].data["name"], Value::String("A".to_string()));
    assert_eq!(records[1].commit_version, 2);
    assert_eq!(records[1].data["name"], Value::String("A".to_string()));
    assert_eq!(records[2].data["name"], Value::String("A2".to_string()));

    // total order: (commit_version, intra-commit position)
    let seqs: Vec<u64> = records.iter().map(|r| r.seq).collect();
    let mut sorted = seqs.clone();
    sorted.sort_unstable();
    assert_eq!(seqs, sorted);
}

#[tokio::test]
async fn delete_and_merge_emit_change_records() {
    let table = create_cdc_table().await;
    table.write(vec![row(1, "a"), row(2, "b")]).await.unwrap();

    let filter = Filter::parse(&serde_json::json!({"id": 1})).unwrap();
    table.delete(&filter).await.unwrap();
    let records = table.changes_between(2, 2).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].change_type, ChangeType::Delete);
    assert_eq!(records[0].data["id"], Value::Integer(1));

    table
        .merge(vec!["id".to_string()])
        .execute(vec![row(2, "b2"), row(3, "c")])
        .await
        .unwrap();
    let records = table.changes_between(3, 3).await.unwrap();
    let kinds: Vec<ChangeType> = records.iter().map(|r| r.change_type).collect();
    assert_eq!(
        kinds,
        vec![
            ChangeType::UpdatePreimage,
            ChangeType::UpdatePostimage,
            ChangeType::Insert,
        ]
    );
}

#[tokio::test]
async fn version_range_validation() {
    let table = create_cdc_table().await;
    table.write(vec![row(1, "a")]).await.unwrap();

    let err = table.changes_between(2, 1).await.unwrap_err();
    assert!(matches!(
        err,
        Error::ChangeDataCapture {
            kind: CdcErrorKind::InvalidVersionRange,
            ..
        }
    ));
    let err = table.changes_between(0, 99).await.unwrap_err();
    assert!(matches!(
        err,
        Error::ChangeDataCapture {
            kind: CdcErrorKind::InvalidVersionRange,
            ..
        }
    ));
}

#[tokio::test]
async fn disabled_tables_reject_cdc_reads() {
    let table = create_table().await;
    table.write(vec![row(1, "a")]).await.unwrap();
    let err = table.changes_between(1, 1).await.unwrap_err();
    assert!(matches!(
        err,
        Error::ChangeDataCapture {
            kind: CdcErrorKind::CdcNotEnabled,
            ..
        }
    ));
}

#[tokio::test]
async fn time_range_reads_resolve_to_versions() {
    let table = create_cdc_table().await;
    table.write(vec![row(1, "a")]).await.unwrap();
    table.write(vec![row(2, "b")]).await.unwrap();

    let history = table.history(None).await.unwrap();
    let t1 = history.iter().find(|h| h.version == 1).unwrap().timestamp.unwrap();
    let t2 = history.iter().find(|h| h.version == 2).unwrap().timestamp.unwrap();

    // both bounds inclusive
    let records = table.changes_between_timestamps(t1, t2).await.unwrap();
    assert_eq!(records.len(), 2);

    let none = table.changes_between_timestamps(t2 + 60_000, t2 + 120_000).await.unwrap();
    assert!(none.is_empty());

    let err = table.changes_between_timestamps(t2, t1 - 1).await;
    assert!(matches!(
        err,
        Err(Error::ChangeDataCapture {
            kind: CdcErrorKind::InvalidTimeRange,
            ..
        })
    ));
}

#[tokio::test]
async fn consumer_filters_apply_after_read() {
    let table = create_cdc_table().await;
    table.write(vec![row(1, "a"), row(2, "b")]).await.unwrap();
    let filter = Filter::parse(&serde_json::json!({"id": 1})).unwrap();
    table.delete(&filter).await.unwrap();

    let records = table.changes_between(1, 2).await.unwrap();
    assert_eq!(records.len(), 3);

    let deletes_only = ChangeDataFilter {
        operations: Some([OpCode::Delete].into_iter().collect()),
        ..Default::default()
    };
    let filtered: Vec<&ChangeRecord> =
        records.iter().filter(|r| deletes_only.applies(r)).collect();
    assert_eq!(filtered.len(), 1);
    assert_eq!(filtered[0].change_type, ChangeType::Delete);
}

#[tokio::test]
async fn subscription_delivers_new_commits_in_order() {
    let table = create_cdc_table().await;
    let received: Arc<Mutex<Vec<ChangeRecord>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();

    let subscription = table
        .subscribe(
            Box::new(move |record| {
                sink.lock().unwrap().push(record);
                Ok(())
            }),
            SubscribeOptions {
                poll_interval: Duration::from_millis(20),
                ..Default::default()
            },
            None,
        )
        .await
        .unwrap();

    table.write(vec![row(1, "a")]).await.unwrap();
    table.write(vec![row(2, "b")]).await.unwrap();

    // give the poll loop time to observe both commits
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        if received.lock().unwrap().len() >= 2 {
            break;
        }
    }
    {
        let got = received.lock().unwrap();
        assert_eq!(got.len(), 2);
        assert!(got[0].seq < got[1].seq);
        assert_eq!(got[0].data["id"], Value::Integer(1));
    }

    // after unsubscribe the loop stops and no further records arrive
    subscription.join().await;
    table.write(vec![row(3, "c")]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(received.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn subscription_handler_errors_go_to_callback() {
    let table = create_cdc_table().await;
    let errors: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = errors.clone();
    let delivered = Arc::new(Mutex::new(0usize));
    let counter = delivered.clone();

    let subscription = table
        .subscribe(
            Box::new(move |_| {
                *counter.lock().unwrap() += 1;
                Err("handler exploded".into())
            }),
            SubscribeOptions {
                poll_interval: Duration::from_millis(20),
                ..Default::default()
            },
            Some(Box::new(move |err| {
                sink.lock().unwrap().push(err.to_string());
            })),
        )
        .await
        .unwrap();

    table.write(vec![row(1, "a")]).await.unwrap();
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        if !errors.lock().unwrap().is_empty() {
            break;
        }
    }
    subscription.join().await;

    assert_eq!(*delivered.lock().unwrap(), 1);
    let got = errors.lock().unwrap();
    assert_eq!(got.len(), 1);
    assert!(got[0].contains("handler exploded"));
}
