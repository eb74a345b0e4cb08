use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The fixed set of tables kept in sync between peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TableKey {
    Sessions,
    SessionGroups,
    Topics,
    Messages,
    Plugins,
}

impl TableKey {
    /// Every synchronized table, in bulk-load order.
    pub const ALL: [TableKey; 5] = [
        TableKey::Sessions,
        TableKey::SessionGroups,
        TableKey::Topics,
        TableKey::Messages,
        TableKey::Plugins,
    ];

    /// Key used on the wire and as the replicated document id.
    pub fn as_str(&self) -> &'static str {
        match self {
            TableKey::Sessions => "sessions",
            TableKey::SessionGroups => "sessionGroups",
            TableKey::Topics => "topics",
            TableKey::Messages => "messages",
            TableKey::Plugins => "plugins",
        }
    }

    /// Name of the backing SQLite table.
    pub fn table_name(&self) -> &'static str {
        match self {
            TableKey::Sessions => "sessions",
            TableKey::SessionGroups => "session_groups",
            TableKey::Topics => "topics",
            TableKey::Messages => "messages",
            TableKey::Plugins => "plugins",
        }
    }
}

impl fmt::Display for TableKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TableKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_lowercase();
        TableKey::ALL
            .into_iter()
            .find(|t| t.as_str().to_lowercase() == lower || t.table_name() == lower)
            .ok_or_else(|| {
                format!(
                    "Invalid table '{}'. Valid options: sessions, sessionGroups, topics, messages, plugins",
                    s
                )
            })
    }
}
