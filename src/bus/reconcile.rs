//! Applies merged document changes to the local tables.

use futures::future::join_all;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::db::{TableError, TableStore, WriteSource};
use crate::document::{ChangeBatch, ReplicatedStore};
use crate::models::{record_id, RowChange, SyncAction, SyncEvent, TableKey};

/// Reconciles one change batch into the local table store.
///
/// Batches with a local origin are skipped. For remote batches every touched
/// key is brought in line with the document concurrently; the returned event
/// lists the rows that actually changed and is `None` when nothing did.
pub async fn reconcile_batch(
    tables: &TableStore,
    store: &Mutex<ReplicatedStore>,
    batch: &ChangeBatch,
) -> Option<SyncEvent> {
    if batch.origin.is_local() {
        debug!(table = %batch.table, origin = %batch.origin, "Skipping local batch");
        return None;
    }

    let snapshot: Vec<(String, Option<Value>)> = {
        let store = store.lock().await;
        batch
            .changes
            .iter()
            .map(|change| {
                let value = store.get(batch.table, &change.key).unwrap_or_else(|e| {
                    warn!(key = %change.key, error = %e, "Failed to read merged row");
                    None
                });
                (change.key.clone(), value)
            })
            .collect()
    };

    let results = join_all(
        snapshot
            .into_iter()
            .map(|(key, remote)| apply_row(tables, batch.table, key, remote)),
    )
    .await;

    let changes: Vec<RowChange> = results.into_iter().flatten().collect();
    if changes.is_empty() {
        return None;
    }

    Some(SyncEvent {
        table_key: batch.table,
        changes,
    })
}

/// Makes the local row match the merged value. Failures are logged and skipped.
async fn apply_row(
    tables: &TableStore,
    table: TableKey,
    key: String,
    remote: Option<Value>,
) -> Option<RowChange> {
    match write_row(tables, table, &key, remote).await {
        Ok(action) => action.map(|action| RowChange { id: key, action }),
        Err(e) => {
            warn!(table = %table, id = %key, error = %e, "Failed to reconcile row");
            None
        }
    }
}

async fn write_row(
    tables: &TableStore,
    table: TableKey,
    key: &str,
    remote: Option<Value>,
) -> Result<Option<SyncAction>, TableError> {
    if let Some(remote) = &remote {
        if record_id(remote) != Some(key) {
            warn!(
                table = %table,
                key,
                id = ?record_id(remote),
                "Merged row id does not match its key, skipping"
            );
            return Ok(None);
        }
    }

    let local = tables.get(table, key).await?;

    match (remote, local) {
        (Some(remote), Some(local)) if remote == local => Ok(None),
        (Some(remote), local) => {
            tables.put(table, remote, WriteSource::Sync).await?;
            Ok(Some(if local.is_some() {
                SyncAction::Update
            } else {
                SyncAction::Add
            }))
        }
        (None, Some(_)) => {
            tables.delete(table, key, WriteSource::Sync).await?;
            Ok(Some(SyncAction::Delete))
        }
        (None, None) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_memory_db;
    use crate::document::{KeyAction, KeyChange, Origin};
    use serde_json::json;

    async fn setup() -> (TableStore, Mutex<ReplicatedStore>) {
        let tables = TableStore::new(init_memory_db().await.unwrap());
        (tables, Mutex::new(ReplicatedStore::new()))
    }

    fn batch(table: TableKey, origin: Origin, keys: &[(&str, KeyAction)]) -> ChangeBatch {
        ChangeBatch {
            table,
            origin,
            changes: keys
                .iter()
                .map(|(key, action)| KeyChange {
                    key: key.to_string(),
                    action: *action,
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_local_batches_never_touch_tables() {
        let (tables, store) = setup().await;
        store
            .lock()
            .await
            .set(TableKey::Sessions, "s1", &json!({"id": "s1"}), Origin::LocalBulkLoad)
            .unwrap();

        for origin in [Origin::LocalBulkLoad, Origin::LocalUserWrite] {
            let batch = batch(TableKey::Sessions, origin, &[("s1", KeyAction::Put)]);
            assert!(reconcile_batch(&tables, &store, &batch).await.is_none());
        }
        assert_eq!(tables.count(TableKey::Sessions).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_remote_batch_adds_updates_and_deletes() {
        let (tables, store) = setup().await;
        tables
            .add(TableKey::Topics, json!({"id": "t1", "title": "old"}), WriteSource::User)
            .await
            .unwrap();
        tables
            .add(TableKey::Topics, json!({"id": "t3"}), WriteSource::User)
            .await
            .unwrap();
        {
            let mut store = store.lock().await;
            store
                .set(
                    TableKey::Topics,
                    "t1",
                    &json!({"id": "t1", "title": "new"}),
                    Origin::RemoteMerge,
                )
                .unwrap();
            store
                .set(TableKey::Topics, "t2", &json!({"id": "t2"}), Origin::RemoteMerge)
                .unwrap();
        }

        let batch = batch(
            TableKey::Topics,
            Origin::RemoteMerge,
            &[
                ("t1", KeyAction::Put),
                ("t2", KeyAction::Put),
                ("t3", KeyAction::Delete),
            ],
        );
        let event = reconcile_batch(&tables, &store, &batch).await.unwrap();

        assert_eq!(event.table_key, TableKey::Topics);
        assert_eq!(
            event.changes,
            vec![
                RowChange {
                    id: "t1".to_string(),
                    action: SyncAction::Update
                },
                RowChange {
                    id: "t2".to_string(),
                    action: SyncAction::Add
                },
                RowChange {
                    id: "t3".to_string(),
                    action: SyncAction::Delete
                },
            ]
        );
        assert_eq!(
            tables.get(TableKey::Topics, "t1").await.unwrap(),
            Some(json!({"id": "t1", "title": "new"}))
        );
        assert!(tables.get(TableKey::Topics, "t3").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_repeated_batch_is_idempotent() {
        let (tables, store) = setup().await;
        store
            .lock()
            .await
            .set(
                TableKey::Sessions,
                "s1",
                &json!({"id": "s1", "title": "x"}),
                Origin::RemoteMerge,
            )
            .unwrap();
        let batch = batch(TableKey::Sessions, Origin::RemoteMerge, &[("s1", KeyAction::Put)]);

        assert!(reconcile_batch(&tables, &store, &batch).await.is_some());
        let first = tables.list(TableKey::Sessions).await.unwrap();

        assert!(reconcile_batch(&tables, &store, &batch).await.is_none());
        assert_eq!(tables.list(TableKey::Sessions).await.unwrap(), first);
    }

    #[tokio::test]
    async fn test_reconciled_writes_are_tagged_sync() {
        let (tables, store) = setup().await;
        let mut hooks = tables.subscribe();
        store
            .lock()
            .await
            .set(TableKey::Messages, "m1", &json!({"id": "m1"}), Origin::RemoteMerge)
            .unwrap();

        let batch = batch(TableKey::Messages, Origin::RemoteMerge, &[("m1", KeyAction::Put)]);
        reconcile_batch(&tables, &store, &batch).await;

        let change = hooks.try_recv().unwrap();
        assert_eq!(change.source, WriteSource::Sync);
    }

    #[tokio::test]
    async fn test_row_with_mismatched_id_is_skipped() {
        let (tables, store) = setup().await;
        tables
            .add(TableKey::Sessions, json!({"id": "x", "title": "mine"}), WriteSource::User)
            .await
            .unwrap();
        store
            .lock()
            .await
            .set(
                TableKey::Sessions,
                "x",
                &json!({"id": "y", "title": "renamed"}),
                Origin::RemoteMerge,
            )
            .unwrap();

        let batch = batch(TableKey::Sessions, Origin::RemoteMerge, &[("x", KeyAction::Put)]);
        assert!(reconcile_batch(&tables, &store, &batch).await.is_none());

        assert_eq!(
            tables.list(TableKey::Sessions).await.unwrap(),
            vec![json!({"id": "x", "title": "mine"})]
        );
    }

    #[tokio::test]
    async fn test_failed_row_does_not_stop_batch() {
        let (tables, store) = setup().await;
        {
            let mut store = store.lock().await;
            // No id field: never written to the table
            store
                .set(TableKey::Topics, "bad", &json!({"title": "?"}), Origin::RemoteMerge)
                .unwrap();
            store
                .set(TableKey::Topics, "t1", &json!({"id": "t1"}), Origin::RemoteMerge)
                .unwrap();
        }

        let batch = batch(
            TableKey::Topics,
            Origin::RemoteMerge,
            &[("bad", KeyAction::Put), ("t1", KeyAction::Put)],
        );
        let event = reconcile_batch(&tables, &store, &batch).await.unwrap();

        assert_eq!(event.changes.len(), 1);
        assert!(event.contains("t1"));
        assert_eq!(tables.count(TableKey::Topics).await.unwrap(), 1);
    }
}
