//! Local table store for the synchronized collections.
//!
//! Each table holds JSON rows keyed by their id. Every successful write is
//! announced on a hook channel (`creating`, `updating`, `replacing`,
//! `deleting`) tagged with the [`WriteSource`] that caused it, which is how the
//! sync engine tells user writes apart from the writes it performs itself.

use chrono::Utc;
use serde_json::Value;
use sqlx::SqlitePool;
use tokio::sync::broadcast;
use tracing::warn;

use crate::models::{record_id, TableKey};

/// Buffer of pending hook events per subscriber.
const HOOK_CAPACITY: usize = 1024;

/// Who performed a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteSource {
    /// Application code acting for the local user.
    User,
    /// The sync engine applying a change received from a peer.
    Sync,
}

/// The hook that fired for a write.
#[derive(Debug, Clone, PartialEq)]
pub enum TableHook {
    /// A row was created; carries the stored row.
    Creating(Value),
    /// Some fields of a row were changed.
    Updating {
        /// The full row after the change.
        row: Value,
        /// Only the fields that were written.
        changes: Value,
    },
    /// A row was replaced as a whole; carries the new row.
    Replacing(Value),
    /// A row was removed.
    Deleting,
}

/// A hook event for one row.
#[derive(Debug, Clone, PartialEq)]
pub struct TableChange {
    pub table: TableKey,
    pub id: String,
    pub hook: TableHook,
    pub source: WriteSource,
}

/// Error type for table operations.
#[derive(Debug)]
pub enum TableError {
    /// Error talking to SQLite.
    Sqlite(sqlx::Error),
    /// Stored or supplied row is not valid JSON.
    Json(serde_json::Error),
    /// Row has neither `id` nor `identifier`.
    MissingId(TableKey),
    /// Row already exists.
    Duplicate(TableKey, String),
    /// Update patch is not an object or would change the row's id.
    InvalidPatch(TableKey, String),
}

impl std::fmt::Display for TableError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TableError::Sqlite(e) => write!(f, "SQLite error: {}", e),
            TableError::Json(e) => write!(f, "Invalid row JSON: {}", e),
            TableError::MissingId(table) => {
                write!(f, "Row for table '{}' has no id field", table)
            }
            TableError::Duplicate(table, id) => {
                write!(f, "Row '{}' already exists in table '{}'", id, table)
            }
            TableError::InvalidPatch(table, reason) => {
                write!(f, "Invalid update for table '{}': {}", table, reason)
            }
        }
    }
}

impl std::error::Error for TableError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TableError::Sqlite(e) => Some(e),
            TableError::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for TableError {
    fn from(e: sqlx::Error) -> Self {
        TableError::Sqlite(e)
    }
}

impl From<serde_json::Error> for TableError {
    fn from(e: serde_json::Error) -> Self {
        TableError::Json(e)
    }
}

/// Row store backing the synchronized tables.
///
/// Cloning is cheap; clones share the pool and the hook channel.
#[derive(Clone)]
pub struct TableStore {
    pool: SqlitePool,
    hooks: broadcast::Sender<TableChange>,
}

#[derive(sqlx::FromRow)]
struct RowData {
    data: String,
}

#[derive(sqlx::FromRow)]
struct IdRowData {
    id: String,
    data: String,
}

impl TableStore {
    pub fn new(pool: SqlitePool) -> Self {
        let (hooks, _) = broadcast::channel(HOOK_CAPACITY);
        Self { pool, hooks }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Subscribes to hook events for every table.
    pub fn subscribe(&self) -> broadcast::Receiver<TableChange> {
        self.hooks.subscribe()
    }

    /// Returns all rows of a table in insertion order.
    ///
    /// Rows whose stored JSON cannot be decoded are skipped with a warning.
    pub async fn list(&self, table: TableKey) -> Result<Vec<Value>, TableError> {
        let sql = format!("SELECT id, data FROM {} ORDER BY rowid", table.table_name());
        let rows: Vec<IdRowData> = sqlx::query_as(&sql).fetch_all(&self.pool).await?;

        Ok(rows
            .into_iter()
            .filter_map(|row| match serde_json::from_str(&row.data) {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!(table = %table, id = %row.id, error = %e, "Skipping undecodable row");
                    None
                }
            })
            .collect())
    }

    /// Returns the ids of all rows of a table, decodable or not.
    pub async fn ids(&self, table: TableKey) -> Result<Vec<String>, TableError> {
        let sql = format!("SELECT id FROM {} ORDER BY rowid", table.table_name());
        Ok(sqlx::query_scalar(&sql).fetch_all(&self.pool).await?)
    }

    pub async fn get(&self, table: TableKey, id: &str) -> Result<Option<Value>, TableError> {
        let sql = format!("SELECT data FROM {} WHERE id = ?", table.table_name());
        let row: Option<RowData> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(serde_json::from_str(&row.data)?)),
            None => Ok(None),
        }
    }

    pub async fn count(&self, table: TableKey) -> Result<i64, TableError> {
        let sql = format!("SELECT COUNT(*) FROM {}", table.table_name());
        let count: (i64,) = sqlx::query_as(&sql).fetch_one(&self.pool).await?;
        Ok(count.0)
    }

    /// Inserts a new row and returns its id.
    pub async fn add(
        &self,
        table: TableKey,
        item: Value,
        source: WriteSource,
    ) -> Result<String, TableError> {
        let id = record_id(&item)
            .ok_or(TableError::MissingId(table))?
            .to_string();

        let sql = format!(
            "INSERT INTO {} (id, data, updated_at) VALUES (?, ?, ?) ON CONFLICT(id) DO NOTHING",
            table.table_name()
        );
        let result = sqlx::query(&sql)
            .bind(&id)
            .bind(serde_json::to_string(&item)?)
            .bind(Utc::now().timestamp_millis())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(TableError::Duplicate(table, id));
        }

        self.emit(table, &id, TableHook::Creating(item), source);
        Ok(id)
    }

    /// Merges `changes` into an existing row (top-level keys only).
    ///
    /// Returns `false` when no row with that id exists. `changes` must be an
    /// object and must not change the row's id.
    pub async fn update(
        &self,
        table: TableKey,
        id: &str,
        changes: &Value,
        source: WriteSource,
    ) -> Result<bool, TableError> {
        let Some(mut row) = self.get(table, id).await? else {
            return Ok(false);
        };

        let Some(updates) = changes.as_object() else {
            return Err(TableError::InvalidPatch(
                table,
                "changes must be a JSON object".to_string(),
            ));
        };
        match row.as_object_mut() {
            Some(fields) => {
                for (key, value) in updates {
                    fields.insert(key.clone(), value.clone());
                }
            }
            None => row = changes.clone(),
        }

        if record_id(&row) != Some(id) {
            return Err(TableError::InvalidPatch(
                table,
                format!("row '{}' cannot change its id", id),
            ));
        }

        self.write(table, id, &row).await?;
        self.emit(
            table,
            id,
            TableHook::Updating {
                row,
                changes: changes.clone(),
            },
            source,
        );
        Ok(true)
    }

    /// Inserts or replaces a whole row. Returns `true` if the row was created.
    pub async fn put(
        &self,
        table: TableKey,
        item: Value,
        source: WriteSource,
    ) -> Result<bool, TableError> {
        let id = record_id(&item)
            .ok_or(TableError::MissingId(table))?
            .to_string();
        let existed = self.get(table, &id).await?.is_some();

        self.write(table, &id, &item).await?;

        let hook = if existed {
            TableHook::Replacing(item)
        } else {
            TableHook::Creating(item)
        };
        self.emit(table, &id, hook, source);
        Ok(!existed)
    }

    /// Removes a row. Returns `false` if it did not exist.
    pub async fn delete(
        &self,
        table: TableKey,
        id: &str,
        source: WriteSource,
    ) -> Result<bool, TableError> {
        let sql = format!("DELETE FROM {} WHERE id = ?", table.table_name());
        let result = sqlx::query(&sql).bind(id).execute(&self.pool).await?;

        if result.rows_affected() == 0 {
            return Ok(false);
        }

        self.emit(table, id, TableHook::Deleting, source);
        Ok(true)
    }

    async fn write(&self, table: TableKey, id: &str, item: &Value) -> Result<(), TableError> {
        let sql = format!(
            r#"
            INSERT INTO {} (id, data, updated_at) VALUES (?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET data = excluded.data, updated_at = excluded.updated_at
            "#,
            table.table_name()
        );
        sqlx::query(&sql)
            .bind(id)
            .bind(serde_json::to_string(item)?)
            .bind(Utc::now().timestamp_millis())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    fn emit(&self, table: TableKey, id: &str, hook: TableHook, source: WriteSource) {
        // Ignore send errors (no subscribers)
        let _ = self.hooks.send(TableChange {
            table,
            id: id.to_string(),
            hook,
            source,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_memory_db;
    use serde_json::json;

    async fn setup() -> TableStore {
        TableStore::new(init_memory_db().await.unwrap())
    }

    #[tokio::test]
    async fn test_add_and_get() {
        let store = setup().await;

        let id = store
            .add(
                TableKey::Sessions,
                json!({"id": "s1", "title": "hello"}),
                WriteSource::User,
            )
            .await
            .unwrap();
        assert_eq!(id, "s1");

        let row = store.get(TableKey::Sessions, "s1").await.unwrap().unwrap();
        assert_eq!(row["title"], "hello");
        assert!(store.get(TableKey::Topics, "s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_add_uses_identifier_fallback() {
        let store = setup().await;

        let id = store
            .add(
                TableKey::Plugins,
                json!({"identifier": "web-search", "enabled": true}),
                WriteSource::User,
            )
            .await
            .unwrap();
        assert_eq!(id, "web-search");
        assert!(store
            .get(TableKey::Plugins, "web-search")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_add_without_id_fails() {
        let store = setup().await;

        let result = store
            .add(TableKey::Topics, json!({"title": "x"}), WriteSource::User)
            .await;
        assert!(matches!(result, Err(TableError::MissingId(TableKey::Topics))));
    }

    #[tokio::test]
    async fn test_add_duplicate_fails() {
        let store = setup().await;
        let item = json!({"id": "m1"});

        store
            .add(TableKey::Messages, item.clone(), WriteSource::User)
            .await
            .unwrap();
        let result = store.add(TableKey::Messages, item, WriteSource::User).await;
        assert!(matches!(result, Err(TableError::Duplicate(_, _))));
    }

    #[tokio::test]
    async fn test_list_preserves_insertion_order() {
        let store = setup().await;

        for id in ["c", "a", "b"] {
            store
                .add(TableKey::Topics, json!({ "id": id }), WriteSource::User)
                .await
                .unwrap();
        }

        let ids: Vec<String> = store
            .list(TableKey::Topics)
            .await
            .unwrap()
            .iter()
            .map(|row| row["id"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
        assert_eq!(store.count(TableKey::Topics).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_update_merges_fields() {
        let store = setup().await;
        store
            .add(
                TableKey::Sessions,
                json!({"id": "s1", "title": "old", "pinned": false}),
                WriteSource::User,
            )
            .await
            .unwrap();

        let updated = store
            .update(
                TableKey::Sessions,
                "s1",
                &json!({"title": "new"}),
                WriteSource::User,
            )
            .await
            .unwrap();
        assert!(updated);

        let row = store.get(TableKey::Sessions, "s1").await.unwrap().unwrap();
        assert_eq!(row, json!({"id": "s1", "title": "new", "pinned": false}));
    }

    #[tokio::test]
    async fn test_update_hook_carries_only_changed_fields() {
        let store = setup().await;
        store
            .add(
                TableKey::Sessions,
                json!({"id": "s1", "title": "old", "pinned": false}),
                WriteSource::User,
            )
            .await
            .unwrap();
        let mut hooks = store.subscribe();

        store
            .update(
                TableKey::Sessions,
                "s1",
                &json!({"title": "new"}),
                WriteSource::User,
            )
            .await
            .unwrap();

        let change = hooks.try_recv().unwrap();
        assert_eq!(
            change.hook,
            TableHook::Updating {
                row: json!({"id": "s1", "title": "new", "pinned": false}),
                changes: json!({"title": "new"}),
            }
        );
    }

    #[tokio::test]
    async fn test_update_rejects_id_change() {
        let store = setup().await;
        store
            .add(TableKey::Sessions, json!({"id": "x"}), WriteSource::User)
            .await
            .unwrap();

        let result = store
            .update(TableKey::Sessions, "x", &json!({"id": "y"}), WriteSource::User)
            .await;
        assert!(matches!(result, Err(TableError::InvalidPatch(_, _))));

        // Restating the same id is fine
        assert!(store
            .update(
                TableKey::Sessions,
                "x",
                &json!({"id": "x", "title": "t"}),
                WriteSource::User
            )
            .await
            .unwrap());
        assert_eq!(
            store.get(TableKey::Sessions, "x").await.unwrap(),
            Some(json!({"id": "x", "title": "t"}))
        );
    }

    #[tokio::test]
    async fn test_update_rejects_non_object_patch() {
        let store = setup().await;
        store
            .add(TableKey::Topics, json!({"id": "t1"}), WriteSource::User)
            .await
            .unwrap();

        let result = store
            .update(TableKey::Topics, "t1", &json!("oops"), WriteSource::User)
            .await;
        assert!(matches!(result, Err(TableError::InvalidPatch(TableKey::Topics, _))));
        assert_eq!(
            store.get(TableKey::Topics, "t1").await.unwrap(),
            Some(json!({"id": "t1"}))
        );
    }

    #[tokio::test]
    async fn test_list_skips_undecodable_rows() {
        let store = setup().await;
        store
            .add(TableKey::Topics, json!({"id": "good"}), WriteSource::User)
            .await
            .unwrap();
        sqlx::query("INSERT INTO topics (id, data, updated_at) VALUES ('bad', 'not json', 0)")
            .execute(store.pool())
            .await
            .unwrap();

        let rows = store.list(TableKey::Topics).await.unwrap();
        assert_eq!(rows, vec![json!({"id": "good"})]);
        assert_eq!(store.ids(TableKey::Topics).await.unwrap(), vec!["good", "bad"]);
    }

    #[tokio::test]
    async fn test_update_missing_row() {
        let store = setup().await;
        let updated = store
            .update(TableKey::Sessions, "nope", &json!({"a": 1}), WriteSource::User)
            .await
            .unwrap();
        assert!(!updated);
    }

    #[tokio::test]
    async fn test_put_replaces_row() {
        let store = setup().await;

        let created = store
            .put(
                TableKey::Sessions,
                json!({"id": "s1", "title": "a", "extra": 1}),
                WriteSource::Sync,
            )
            .await
            .unwrap();
        assert!(created);

        let created = store
            .put(
                TableKey::Sessions,
                json!({"id": "s1", "title": "b"}),
                WriteSource::Sync,
            )
            .await
            .unwrap();
        assert!(!created);

        let row = store.get(TableKey::Sessions, "s1").await.unwrap().unwrap();
        assert_eq!(row, json!({"id": "s1", "title": "b"}));
    }

    #[tokio::test]
    async fn test_delete() {
        let store = setup().await;
        store
            .add(TableKey::Messages, json!({"id": "m1"}), WriteSource::User)
            .await
            .unwrap();

        assert!(store
            .delete(TableKey::Messages, "m1", WriteSource::User)
            .await
            .unwrap());
        assert!(!store
            .delete(TableKey::Messages, "m1", WriteSource::User)
            .await
            .unwrap());
        assert!(store.get(TableKey::Messages, "m1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_hooks_carry_source() {
        let store = setup().await;
        let mut hooks = store.subscribe();

        store
            .add(TableKey::Topics, json!({"id": "t1"}), WriteSource::User)
            .await
            .unwrap();
        store
            .put(
                TableKey::Topics,
                json!({"id": "t1", "title": "x"}),
                WriteSource::Sync,
            )
            .await
            .unwrap();
        store
            .delete(TableKey::Topics, "t1", WriteSource::User)
            .await
            .unwrap();

        let first = hooks.try_recv().unwrap();
        assert_eq!(first.id, "t1");
        assert_eq!(first.source, WriteSource::User);
        assert!(matches!(first.hook, TableHook::Creating(_)));

        let second = hooks.try_recv().unwrap();
        assert_eq!(second.source, WriteSource::Sync);
        assert_eq!(
            second.hook,
            TableHook::Replacing(json!({"id": "t1", "title": "x"}))
        );

        let third = hooks.try_recv().unwrap();
        assert_eq!(third.hook, TableHook::Deleting);
        assert!(hooks.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_no_hook_for_noop_delete() {
        let store = setup().await;
        let mut hooks = store.subscribe();

        store
            .delete(TableKey::Topics, "missing", WriteSource::User)
            .await
            .unwrap();
        assert!(hooks.try_recv().is_err());
    }
}
