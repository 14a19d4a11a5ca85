//! Versioned adapter against an in-memory SQLite database.

use std::sync::Arc;
use std::time::Duration;

use extpg::prelude::*;
use extpg::registry::RemotePool;
use extpg::versioned::{DELETED, IS_LATEST, RESTORE_OF, USER_ID, VERSION};
use pretty_assertions::assert_eq;

const URL: &str = "sqlite::memory:";

const DOCS_DDL: &str = "CREATE TABLE docs (
    _version_id INTEGER PRIMARY KEY,
    id INTEGER NOT NULL,
    title TEXT,
    pages INTEGER,
    _version INTEGER NOT NULL,
    _is_latest BOOLEAN NOT NULL,
    _deleted BOOLEAN NOT NULL,
    _time TEXT,
    _userid INTEGER,
    _restore_of_version INTEGER
)";

async fn docs() -> VersionedTable {
    docs_with_pool().await.0
}

async fn docs_with_pool() -> (VersionedTable, Arc<RemotePool>) {
    let registry = Arc::new(ConnectionRegistry::new().with_max_connections(1));
    let pool = registry.acquire(&ConnectionIdentity::url(URL)).await.unwrap();
    sqlx::query(DOCS_DDL).execute(pool.pool()).await.unwrap();

    let config = TableConfig::from_json(&serde_json::json!({
        "connection_string": URL,
        "table": "docs",
        "versioned": true,
        "fields": [
            {"name": "id", "type": "Integer", "primary_key": true},
            {"name": "title", "type": "String"},
            {"name": "pages", "type": "Integer"},
        ],
    }))
    .unwrap();
    (VersionedTable::new(registry, config).unwrap(), pool)
}

fn record(pairs: &[(&str, Value)]) -> Row {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

fn titled(title: &str) -> Row {
    record(&[("title", Value::from(title))])
}

async fn head(table: &VersionedTable, id: i64) -> Option<Row> {
    table
        .get_rows(&Where::new().eq("id", id), &SelectOptions::new())
        .await
        .unwrap()
        .into_iter()
        .next()
}

fn int(row: &Row, field: &str) -> Option<i64> {
    row.get(field).and_then(Value::as_i64)
}

#[tokio::test]
async fn test_create_assigns_keys() {
    let table = docs().await;
    assert_eq!(table.create(&titled("a"), Some(7)).await.unwrap(), 1);
    assert_eq!(table.create(&titled("b"), None).await.unwrap(), 2);
    let explicit = record(&[("id", Value::Int(10)), ("title", Value::from("c"))]);
    assert_eq!(table.create(&explicit, None).await.unwrap(), 10);
    assert_eq!(table.create(&titled("d"), None).await.unwrap(), 11);

    let first = head(&table, 1).await.unwrap();
    assert_eq!(int(&first, VERSION), Some(1));
    assert_eq!(int(&first, USER_ID), Some(7));
    assert_eq!(first.get(IS_LATEST), Some(&Value::Bool(true)));
    assert_eq!(first.get(DELETED), Some(&Value::Bool(false)));
    assert_eq!(first.get(RESTORE_OF), Some(&Value::Null));
}

#[tokio::test]
async fn test_create_with_taken_key_fails() {
    let table = docs().await;
    let rec = record(&[("id", Value::Int(5)), ("title", Value::from("a"))]);
    table.create(&rec, None).await.unwrap();
    let err = table.create(&rec, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConstraintViolation);
}

#[tokio::test]
async fn test_metadata_fields_cannot_be_written() {
    let table = docs().await;
    let err = table
        .create(&record(&[("_version", Value::Int(4))]), None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let id = table.create(&titled("a"), None).await.unwrap();
    let err = table
        .update(&record(&[("_deleted", Value::Bool(true))]), &Value::Int(id), None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn test_update_overlays_and_keeps_history() {
    let table = docs().await;
    let id = table
        .create(&record(&[("title", Value::from("draft")), ("pages", Value::Int(3))]), None)
        .await
        .unwrap();
    table.update(&titled("final"), &Value::Int(id), Some(2)).await.unwrap();

    let current = head(&table, id).await.unwrap();
    assert_eq!(current.get("title"), Some(&Value::from("final")));
    assert_eq!(int(&current, "pages"), Some(3));
    assert_eq!(int(&current, VERSION), Some(2));
    assert_eq!(int(&current, USER_ID), Some(2));

    let history = table.get_history(&Value::Int(id)).await.unwrap();
    let versions: Vec<_> = history.iter().map(|r| int(r, VERSION)).collect();
    assert_eq!(versions, vec![Some(1), Some(2)]);
    assert_eq!(history[0].get("title"), Some(&Value::from("draft")));
    assert_eq!(history[0].get(IS_LATEST), Some(&Value::Bool(false)));
    assert_eq!(table.count_rows(&Where::new()).await.unwrap(), 1);
}

#[tokio::test]
async fn test_update_of_missing_entity_fails() {
    let table = docs().await;
    let err = table.update(&titled("x"), &Value::Int(42), None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_delete_hides_entity_without_new_version() {
    let table = docs().await;
    let id = table.create(&titled("a"), None).await.unwrap();
    let other = table.create(&titled("b"), None).await.unwrap();
    table.delete(&Value::Int(id), Some(9)).await.unwrap();

    assert_eq!(head(&table, id).await, None);
    assert_eq!(table.count_rows(&Where::new()).await.unwrap(), 1);
    assert!(head(&table, other).await.is_some());

    let history = table.get_history(&Value::Int(id)).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].get(DELETED), Some(&Value::Bool(true)));
    assert_eq!(history[0].get(IS_LATEST), Some(&Value::Bool(true)));
    assert_eq!(int(&history[0], USER_ID), Some(9));

    // The predicate asks about deletion, so no visibility filter applies.
    let deleted = table
        .get_rows(&Where::new().eq(DELETED, true), &SelectOptions::new())
        .await
        .unwrap();
    assert_eq!(deleted.len(), 1);

    let err = table.delete(&Value::Int(id), None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    let err = table.update(&titled("c"), &Value::Int(id), None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_restore_after_delete() {
    let table = docs().await;
    let id = table.create(&titled("P1"), None).await.unwrap();
    table.update(&titled("P2"), &Value::Int(id), None).await.unwrap();
    table.delete(&Value::Int(id), None).await.unwrap();

    let version = table.restore(&Value::Int(id), 1, Some(4)).await.unwrap();
    assert_eq!(version, 3);

    let current = head(&table, id).await.unwrap();
    assert_eq!(current.get("title"), Some(&Value::from("P1")));
    assert_eq!(int(&current, VERSION), Some(3));
    assert_eq!(int(&current, RESTORE_OF), Some(1));
    assert_eq!(current.get(DELETED), Some(&Value::Bool(false)));

    let history = table.get_history(&Value::Int(id)).await.unwrap();
    assert_eq!(history.len(), 3);
    let latest: Vec<_> = history
        .iter()
        .filter(|r| r.get(IS_LATEST) == Some(&Value::Bool(true)))
        .collect();
    assert_eq!(latest.len(), 1);
}

#[tokio::test]
async fn test_restore_of_unknown_version_fails() {
    let table = docs().await;
    let id = table.create(&titled("a"), None).await.unwrap();
    let err = table.restore(&Value::Int(id), 5, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    let err = table.restore(&Value::Int(99), 1, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_delete_rows_soft_deletes_matching_heads() {
    let table = docs().await;
    for (title, pages) in [("a", 1), ("b", 10), ("c", 20)] {
        table
            .insert_row(&record(&[("title", Value::from(title)), ("pages", Value::Int(pages))]), None)
            .await
            .unwrap();
    }
    let n = table.delete_rows(&Where::new().gte("pages", 10), Some(1)).await.unwrap();
    assert_eq!(n, 2);
    assert_eq!(table.count_rows(&Where::new()).await.unwrap(), 1);
    assert_eq!(
        table.count_rows(&Where::new().eq(DELETED, true)).await.unwrap(),
        2
    );
}

#[tokio::test]
async fn test_reads_see_only_current_heads() {
    let table = docs().await;
    let a = table
        .create(&record(&[("title", Value::from("a")), ("pages", Value::Int(2))]), None)
        .await
        .unwrap();
    table.create(&record(&[("pages", Value::Int(5))]), None).await.unwrap();
    table
        .update(&record(&[("pages", Value::Int(4))]), &Value::Int(a), None)
        .await
        .unwrap();

    let pages = table.distinct_values("pages", &Where::new()).await.unwrap();
    assert_eq!(pages, vec![Value::Int(4), Value::Int(5)]);

    let result = table
        .aggregation_query(
            &[AggregationSpec::new("total", AggregateFunc::Sum, "pages")],
            &Where::new(),
            &SelectOptions::new(),
        )
        .await
        .unwrap();
    assert_eq!(result.rows()[0].get("total"), Some(&Value::Int(9)));
}

#[tokio::test]
async fn test_concurrent_updates_serialize() {
    let table = docs().await;
    let id = table.create(&titled("v1"), None).await.unwrap();

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let table = table.clone();
            tokio::spawn(async move {
                table
                    .update(&record(&[("pages", Value::Int(i))]), &Value::Int(id), None)
                    .await
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let history = table.get_history(&Value::Int(id)).await.unwrap();
    let versions: Vec<_> = history.iter().filter_map(|r| int(r, VERSION)).collect();
    assert_eq!(versions, (1..=9).collect::<Vec<i64>>());
    let latest = history
        .iter()
        .filter(|r| r.get(IS_LATEST) == Some(&Value::Bool(true)))
        .count();
    assert_eq!(latest, 1);
}

#[tokio::test]
async fn test_create_and_update_waiting_on_the_pool_both_finish() {
    let (table, pool) = docs_with_pool().await;
    let held = pool.pool().acquire().await.unwrap();

    let creator = table.clone();
    let create = tokio::spawn(async move {
        let rec = record(&[("id", Value::Int(1)), ("title", Value::from("a"))]);
        creator.create(&rec, None).await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    let updater = table.clone();
    let update = tokio::spawn(async move {
        updater.update(&titled("b"), &Value::Int(1), None).await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    drop(held);

    let both = tokio::time::timeout(Duration::from_secs(5), async {
        (create.await.unwrap(), update.await.unwrap())
    })
    .await
    .unwrap();
    assert_eq!(both.0.unwrap(), 1);
    both.1.unwrap();
    assert_eq!(head(&table, 1).await.unwrap().get("title"), Some(&Value::from("b")));
}

/// Makes every retire of a head a no-op, as if another writer had already
/// retired it.
const SWALLOW_RETIRE: &str = "CREATE TRIGGER swallow_retire BEFORE UPDATE ON docs
    WHEN OLD._is_latest = 1 AND (NEW._is_latest = 0 OR NEW._deleted = 1)
    BEGIN SELECT RAISE(IGNORE); END";

#[tokio::test]
async fn test_lost_head_rolls_back_with_conflict() {
    let (table, pool) = docs_with_pool().await;
    let id = table.create(&titled("P1"), None).await.unwrap();
    table.update(&titled("P2"), &Value::Int(id), None).await.unwrap();
    sqlx::query(SWALLOW_RETIRE).execute(pool.pool()).await.unwrap();

    let err = table.update(&titled("P3"), &Value::Int(id), None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    let err = table.restore(&Value::Int(id), 1, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    let err = table.delete(&Value::Int(id), None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    let history = table.get_history(&Value::Int(id)).await.unwrap();
    let versions: Vec<_> = history.iter().filter_map(|r| int(r, VERSION)).collect();
    assert_eq!(versions, vec![1, 2]);
    let current = head(&table, id).await.unwrap();
    assert_eq!(current.get("title"), Some(&Value::from("P2")));
    assert_eq!(current.get(DELETED), Some(&Value::Bool(false)));
}
