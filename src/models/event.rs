use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use super::TableKey;

/// Status surfaced to the UI layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// Connected to peers, data not yet synchronized.
    Ready,
    /// Bulk load or reconciliation in progress.
    Syncing,
    /// Steady state.
    Synced,
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncStatus::Ready => write!(f, "ready"),
            SyncStatus::Syncing => write!(f, "syncing"),
            SyncStatus::Synced => write!(f, "synced"),
        }
    }
}

/// What happened to a row after a remote change was reconciled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncAction {
    Add,
    Update,
    Delete,
}

impl fmt::Display for SyncAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncAction::Add => write!(f, "add"),
            SyncAction::Update => write!(f, "update"),
            SyncAction::Delete => write!(f, "delete"),
        }
    }
}

/// A single reconciled row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowChange {
    pub id: String,
    pub action: SyncAction,
}

/// Emitted once per table per reconciled batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncEvent {
    pub table_key: TableKey,
    pub changes: Vec<RowChange>,
}

impl SyncEvent {
    pub fn contains(&self, id: &str) -> bool {
        self.changes.iter().any(|c| c.id == id)
    }
}

/// Extracts the unique id of a synced record.
///
/// Rows carry `id`; older rows only carry `identifier`.
pub fn record_id(item: &Value) -> Option<&str> {
    item.get("id")
        .and_then(Value::as_str)
        .or_else(|| item.get("identifier").and_then(Value::as_str))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_id_prefers_id() {
        let item = json!({"id": "a", "identifier": "b"});
        assert_eq!(record_id(&item), Some("a"));
    }

    #[test]
    fn test_record_id_falls_back_to_identifier() {
        let item = json!({"identifier": "plugin-search"});
        assert_eq!(record_id(&item), Some("plugin-search"));
    }

    #[test]
    fn test_record_id_missing() {
        assert_eq!(record_id(&json!({"title": "x"})), None);
        assert_eq!(record_id(&json!({"id": 7})), None);
        assert_eq!(record_id(&json!("s1")), None);
    }

    #[test]
    fn test_sync_event_json_shape() {
        let event = SyncEvent {
            table_key: TableKey::Topics,
            changes: vec![RowChange {
                id: "t1".to_string(),
                action: SyncAction::Update,
            }],
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["tableKey"], "topics");
        assert_eq!(json["changes"][0]["action"], "update");
        assert!(event.contains("t1"));
        assert!(!event.contains("t2"));
    }

    #[test]
    fn test_status_display() {
        assert_eq!(SyncStatus::Ready.to_string(), "ready");
        assert_eq!(SyncStatus::Syncing.to_string(), "syncing");
        assert_eq!(SyncStatus::Synced.to_string(), "synced");
    }
}
