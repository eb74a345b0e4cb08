//! One-time copy of the local tables into the replicated store.

use std::collections::HashSet;

use futures::future::join_all;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::db::TableStore;
use crate::document::{Origin, ReplicatedStore};
use crate::error::SyncError;
use crate::models::{record_id, TableKey};

/// Rows written per document transaction.
pub const BULK_LOAD_CHUNK_SIZE: usize = 50;

/// Copies every row of every synchronized table into the store.
///
/// Tables are read concurrently. Rows go in under [`Origin::LocalBulkLoad`] so
/// the reconciler never writes them back. Rows without an id are skipped, as
/// are tables that cannot be read. Returns the number of rows that changed the
/// store.
pub async fn bulk_load(
    tables: &TableStore,
    store: &Mutex<ReplicatedStore>,
    chunk_size: usize,
) -> Result<usize, SyncError> {
    let lists = join_all(
        TableKey::ALL
            .into_iter()
            .map(|table| async move { (table, tables.list(table).await) }),
    )
    .await;

    let mut written = 0;
    for (table, rows) in lists {
        let rows = match rows {
            Ok(rows) => rows,
            Err(e) => {
                warn!(table = %table, error = %e, "Failed to read table, skipping");
                continue;
            }
        };
        let rows: Vec<(String, Value)> = rows
            .into_iter()
            .filter_map(|row| match record_id(&row) {
                Some(id) => Some((id.to_string(), row)),
                None => {
                    warn!(table = %table, "Skipping row without id");
                    None
                }
            })
            .collect();

        let mut store = store.lock().await;
        for chunk in rows.chunks(chunk_size.max(1)) {
            written += store.set_many(table, chunk, Origin::LocalBulkLoad)?;
        }
        debug!(table = %table, rows = rows.len(), "Table loaded");
    }

    Ok(written)
}

/// Removes rows from the store that no longer exist in the local tables.
///
/// Deletions go out under [`Origin::LocalUserWrite`] so peers drop the rows
/// too. Returns the number of rows removed.
pub async fn prune_deleted(
    tables: &TableStore,
    store: &Mutex<ReplicatedStore>,
) -> Result<usize, SyncError> {
    let mut removed = 0;
    for table in TableKey::ALL {
        let ids: HashSet<String> = match tables.ids(table).await {
            Ok(ids) => ids.into_iter().collect(),
            Err(e) => {
                warn!(table = %table, error = %e, "Failed to read table ids, skipping");
                continue;
            }
        };

        let mut store = store.lock().await;
        for key in store.keys(table) {
            if !ids.contains(&key) && store.delete(table, &key, Origin::LocalUserWrite)? {
                debug!(table = %table, id = %key, "Pruned row deleted locally");
                removed += 1;
            }
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{init_memory_db, WriteSource};
    use serde_json::json;
    use tokio::sync::mpsc;

    async fn setup() -> TableStore {
        TableStore::new(init_memory_db().await.unwrap())
    }

    #[tokio::test]
    async fn test_loads_every_table() {
        let tables = setup().await;
        tables
            .add(TableKey::Sessions, json!({"id": "s1"}), WriteSource::User)
            .await
            .unwrap();
        tables
            .add(TableKey::Messages, json!({"id": "m1", "content": "hi"}), WriteSource::User)
            .await
            .unwrap();
        tables
            .add(TableKey::Plugins, json!({"identifier": "search"}), WriteSource::User)
            .await
            .unwrap();

        let store = Mutex::new(ReplicatedStore::new());
        let written = bulk_load(&tables, &store, BULK_LOAD_CHUNK_SIZE)
            .await
            .unwrap();
        assert_eq!(written, 3);

        let store = store.lock().await;
        assert_eq!(
            store.get(TableKey::Messages, "m1").unwrap(),
            Some(json!({"id": "m1", "content": "hi"}))
        );
        assert!(store.get(TableKey::Plugins, "search").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_chunks_into_separate_batches() {
        let tables = setup().await;
        for i in 0..5 {
            tables
                .add(
                    TableKey::Topics,
                    json!({ "id": format!("t{}", i) }),
                    WriteSource::User,
                )
                .await
                .unwrap();
        }

        let mut store = ReplicatedStore::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        store.observe(TableKey::Topics, tx);
        let store = Mutex::new(store);

        bulk_load(&tables, &store, 2).await.unwrap();

        let mut sizes = Vec::new();
        while let Ok(batch) = rx.try_recv() {
            assert_eq!(batch.origin, Origin::LocalBulkLoad);
            sizes.push(batch.changes.len());
        }
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[tokio::test]
    async fn test_reload_is_noop() {
        let tables = setup().await;
        tables
            .add(TableKey::Sessions, json!({"id": "s1"}), WriteSource::User)
            .await
            .unwrap();

        let store = Mutex::new(ReplicatedStore::new());
        bulk_load(&tables, &store, BULK_LOAD_CHUNK_SIZE)
            .await
            .unwrap();
        let written = bulk_load(&tables, &store, BULK_LOAD_CHUNK_SIZE)
            .await
            .unwrap();
        assert_eq!(written, 0);
    }

    #[tokio::test]
    async fn test_bad_row_does_not_stop_other_tables() {
        let tables = setup().await;
        tables
            .add(TableKey::Sessions, json!({"id": "s1"}), WriteSource::User)
            .await
            .unwrap();
        tables
            .add(TableKey::Plugins, json!({"identifier": "search"}), WriteSource::User)
            .await
            .unwrap();
        sqlx::query("INSERT INTO topics (id, data, updated_at) VALUES ('t1', 'not json', 0)")
            .execute(tables.pool())
            .await
            .unwrap();

        let store = Mutex::new(ReplicatedStore::new());
        let written = bulk_load(&tables, &store, BULK_LOAD_CHUNK_SIZE)
            .await
            .unwrap();
        assert_eq!(written, 2);

        let store = store.lock().await;
        assert!(store.contains(TableKey::Sessions, "s1"));
        assert!(store.contains(TableKey::Plugins, "search"));
        assert!(store.is_empty(TableKey::Topics));
    }

    #[tokio::test]
    async fn test_prune_removes_rows_deleted_locally() {
        let tables = setup().await;
        for id in ["m1", "m2"] {
            tables
                .add(TableKey::Messages, json!({ "id": id }), WriteSource::User)
                .await
                .unwrap();
        }
        let mut store = ReplicatedStore::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        store.observe(TableKey::Messages, tx);
        let store = Mutex::new(store);
        bulk_load(&tables, &store, BULK_LOAD_CHUNK_SIZE)
            .await
            .unwrap();
        while rx.try_recv().is_ok() {}

        // The hook for this delete never reached the store
        tables
            .delete(TableKey::Messages, "m1", WriteSource::User)
            .await
            .unwrap();
        bulk_load(&tables, &store, BULK_LOAD_CHUNK_SIZE)
            .await
            .unwrap();
        assert!(store.lock().await.contains(TableKey::Messages, "m1"));

        assert_eq!(prune_deleted(&tables, &store).await.unwrap(), 1);
        assert_eq!(store.lock().await.keys(TableKey::Messages), vec!["m2"]);

        let batch = rx.try_recv().unwrap();
        assert_eq!(batch.origin, Origin::LocalUserWrite);
        assert_eq!(batch.changes[0].key, "m1");
        assert_eq!(batch.changes[0].action, crate::document::KeyAction::Delete);

        assert_eq!(prune_deleted(&tables, &store).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_prune_keeps_undecodable_rows() {
        let tables = setup().await;
        sqlx::query("INSERT INTO topics (id, data, updated_at) VALUES ('t1', 'not json', 0)")
            .execute(tables.pool())
            .await
            .unwrap();
        let store = Mutex::new(ReplicatedStore::new());
        store
            .lock()
            .await
            .set(TableKey::Topics, "t1", &json!({"id": "t1"}), Origin::RemoteMerge)
            .unwrap();

        assert_eq!(prune_deleted(&tables, &store).await.unwrap(), 0);
        assert!(store.lock().await.contains(TableKey::Topics, "t1"));
    }

    #[tokio::test]
    async fn test_skips_rows_without_id() {
        let tables = setup().await;
        // Written straight to SQLite, bypassing the id check in `add`
        sqlx::query("INSERT INTO topics (id, data, updated_at) VALUES ('x', '{\"title\":\"orphan\"}', 0)")
            .execute(tables.pool())
            .await
            .unwrap();

        let store = Mutex::new(ReplicatedStore::new());
        let written = bulk_load(&tables, &store, BULK_LOAD_CHUNK_SIZE)
            .await
            .unwrap();
        assert_eq!(written, 0);
        assert!(store.lock().await.is_empty(TableKey::Topics));
    }
}
