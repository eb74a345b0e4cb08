use std::collections::{BTreeSet, HashMap};

use automerge::sync::{self, SyncDoc};
use automerge::transaction::Transactable;
use automerge::{AutoCommit, ChangeHash, ObjType, PatchAction, Prop, ReadDoc, Value as AmValue, ROOT};
use serde_json::Value;
use tokio::sync::mpsc;

use super::value::{read_value, write_value};
use super::DocumentError;
use crate::models::TableKey;

/// Where a change to the replicated store came from.
///
/// Every write is tagged so observers can tell their own writes apart from
/// changes merged in from peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Initial copy of the local tables into the store.
    LocalBulkLoad,
    /// A user write mirrored from the local table store.
    LocalUserWrite,
    /// Changes received from a peer.
    RemoteMerge,
}

impl Origin {
    pub fn is_local(&self) -> bool {
        !matches!(self, Origin::RemoteMerge)
    }
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Origin::LocalBulkLoad => write!(f, "local-bulk-load"),
            Origin::LocalUserWrite => write!(f, "local-user-write"),
            Origin::RemoteMerge => write!(f, "remote-merge"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAction {
    /// Key was added or its value changed.
    Put,
    /// Key was removed.
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyChange {
    pub key: String,
    pub action: KeyAction,
}

/// All keys of one table touched by a single transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeBatch {
    pub table: TableKey,
    pub origin: Origin,
    pub changes: Vec<KeyChange>,
}

/// In-memory replicated store holding one Automerge document per table.
#[derive(Default)]
pub struct ReplicatedStore {
    docs: HashMap<TableKey, AutoCommit>,
    observers: HashMap<TableKey, mpsc::UnboundedSender<ChangeBatch>>,
}

impl ReplicatedStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn doc_mut(&mut self, table: TableKey) -> &mut AutoCommit {
        self.docs.entry(table).or_insert_with(AutoCommit::new)
    }

    /// Returns the current value of a row.
    pub fn get(&self, table: TableKey, key: &str) -> Result<Option<Value>, DocumentError> {
        match self.docs.get(&table) {
            Some(doc) => read_value(doc, &ROOT, key),
            None => Ok(None),
        }
    }

    pub fn keys(&self, table: TableKey) -> Vec<String> {
        self.docs
            .get(&table)
            .map(|doc| doc.keys(ROOT).collect())
            .unwrap_or_default()
    }

    pub fn len(&self, table: TableKey) -> usize {
        self.docs
            .get(&table)
            .map(|doc| doc.length(ROOT))
            .unwrap_or(0)
    }

    pub fn is_empty(&self, table: TableKey) -> bool {
        self.len(table) == 0
    }

    pub fn contains(&self, table: TableKey, key: &str) -> bool {
        self.docs
            .get(&table)
            .and_then(|doc| doc.get(ROOT, key).ok().flatten())
            .is_some()
    }

    /// Writes one row. Returns `false` if the stored value was already equal.
    pub fn set(
        &mut self,
        table: TableKey,
        key: &str,
        value: &Value,
        origin: Origin,
    ) -> Result<bool, DocumentError> {
        let doc = self.doc_mut(table);
        let changed = write_row(doc, key, value, true)?;
        doc.commit();

        if changed {
            self.emit(ChangeBatch {
                table,
                origin,
                changes: vec![KeyChange {
                    key: key.to_string(),
                    action: KeyAction::Put,
                }],
            });
        }
        Ok(changed)
    }

    /// Writes only the given fields of a row, leaving its other fields alone.
    ///
    /// A missing row is created from `fields`. Returns `false` if every field
    /// already held the given value.
    pub fn merge(
        &mut self,
        table: TableKey,
        key: &str,
        fields: &Value,
        origin: Origin,
    ) -> Result<bool, DocumentError> {
        let doc = self.doc_mut(table);
        let changed = write_row(doc, key, fields, false)?;
        doc.commit();

        if changed {
            self.emit(ChangeBatch {
                table,
                origin,
                changes: vec![KeyChange {
                    key: key.to_string(),
                    action: KeyAction::Put,
                }],
            });
        }
        Ok(changed)
    }

    /// Writes many rows in a single transaction. Returns the number changed.
    pub fn set_many(
        &mut self,
        table: TableKey,
        rows: &[(String, Value)],
        origin: Origin,
    ) -> Result<usize, DocumentError> {
        let doc = self.doc_mut(table);
        let mut changes = Vec::new();
        for (key, value) in rows {
            if write_row(doc, key, value, true)? {
                changes.push(KeyChange {
                    key: key.clone(),
                    action: KeyAction::Put,
                });
            }
        }
        doc.commit();

        let count = changes.len();
        if count > 0 {
            self.emit(ChangeBatch {
                table,
                origin,
                changes,
            });
        }
        Ok(count)
    }

    /// Removes a row. Returns `false` if it was not present.
    pub fn delete(
        &mut self,
        table: TableKey,
        key: &str,
        origin: Origin,
    ) -> Result<bool, DocumentError> {
        let doc = self.doc_mut(table);
        if doc.get(ROOT, key)?.is_none() {
            return Ok(false);
        }
        doc.delete(ROOT, key)?;
        doc.commit();

        self.emit(ChangeBatch {
            table,
            origin,
            changes: vec![KeyChange {
                key: key.to_string(),
                action: KeyAction::Delete,
            }],
        });
        Ok(true)
    }

    /// Installs the change observer for a table.
    ///
    /// A live observer is kept; returns `false` in that case. A closed one is
    /// replaced.
    pub fn observe(&mut self, table: TableKey, sink: mpsc::UnboundedSender<ChangeBatch>) -> bool {
        match self.observers.get(&table) {
            Some(existing) if !existing.is_closed() => false,
            _ => {
                self.observers.insert(table, sink);
                true
            }
        }
    }

    pub fn is_observed(&self, table: TableKey) -> bool {
        self.observers
            .get(&table)
            .is_some_and(|sink| !sink.is_closed())
    }

    pub fn heads(&mut self, table: TableKey) -> Vec<ChangeHash> {
        self.doc_mut(table).get_heads().to_vec()
    }

    /// Generates the next sync message for a peer, if one is needed.
    pub fn generate_sync_message(
        &mut self,
        table: TableKey,
        state: &mut sync::State,
    ) -> Option<Vec<u8>> {
        self.doc_mut(table)
            .sync()
            .generate_sync_message(state)
            .map(|msg| msg.encode())
    }

    /// Applies a sync message from a peer.
    ///
    /// When the message changed the document, the touched keys are delivered
    /// to the table's observer as a [`Origin::RemoteMerge`] batch and returned.
    pub fn receive_sync_message(
        &mut self,
        table: TableKey,
        state: &mut sync::State,
        message: &[u8],
    ) -> Result<Option<ChangeBatch>, DocumentError> {
        let msg =
            sync::Message::decode(message).map_err(|e| DocumentError::Decode(e.to_string()))?;

        let doc = self.doc_mut(table);
        let before = doc.get_heads().to_vec();
        doc.sync().receive_sync_message(state, msg)?;
        let after = doc.get_heads().to_vec();

        if before == after {
            return Ok(None);
        }

        let mut touched = BTreeSet::new();
        for patch in doc.diff(&before, &after) {
            let key = match (patch.path.first(), patch.action) {
                (Some((_, Prop::Map(key))), _) => key.clone(),
                (None, PatchAction::PutMap { key, .. }) => key,
                (None, PatchAction::DeleteMap { key }) => key,
                _ => continue,
            };
            touched.insert(key);
        }

        let mut changes = Vec::with_capacity(touched.len());
        for key in touched {
            let action = if doc.get(ROOT, key.as_str())?.is_some() {
                KeyAction::Put
            } else {
                KeyAction::Delete
            };
            changes.push(KeyChange { key, action });
        }

        if changes.is_empty() {
            return Ok(None);
        }

        let batch = ChangeBatch {
            table,
            origin: Origin::RemoteMerge,
            changes,
        };
        self.emit(batch.clone());
        Ok(Some(batch))
    }

    fn emit(&self, batch: ChangeBatch) {
        if let Some(sink) = self.observers.get(&batch.table) {
            // Ignore send errors (observer gone)
            let _ = sink.send(batch);
        }
    }
}

/// Writes a row field by field so only changed fields produce operations.
///
/// With `replace`, fields of the stored row that `value` lacks are deleted.
fn write_row(
    doc: &mut AutoCommit,
    key: &str,
    value: &Value,
    replace: bool,
) -> Result<bool, DocumentError> {
    let existing = match doc.get(ROOT, key)? {
        Some((AmValue::Object(ObjType::Map), id)) => Some(id),
        _ => None,
    };

    match (existing, value.as_object()) {
        (Some(row), Some(fields)) => {
            let mut changed = false;
            for (field, new) in fields {
                if read_value(doc, &row, field.as_str())?.as_ref() != Some(new) {
                    write_value(doc, &row, field.as_str(), new)?;
                    changed = true;
                }
            }

            if !replace {
                return Ok(changed);
            }
            let stale: Vec<String> = doc
                .keys(&row)
                .filter(|field| !fields.contains_key(field))
                .collect();
            for field in stale {
                doc.delete(&row, field.as_str())?;
                changed = true;
            }
            Ok(changed)
        }
        _ => {
            if read_value(doc, &ROOT, key)?.as_ref() == Some(value) {
                return Ok(false);
            }
            write_value(doc, &ROOT, key, value)?;
            Ok(true)
        }
    }
}
