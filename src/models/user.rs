use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Identifies a peer group. Peers sharing a name (and password, if set)
/// replicate with each other.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncChannel {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl SyncChannel {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            password: None,
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Opaque room id handed to the relay.
    ///
    /// The relay never sees the channel name or password, only a SHA-256 over
    /// the length-prefixed name and a marker byte for the password.
    pub fn room_id(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update((self.name.len() as u64).to_be_bytes());
        hasher.update(self.name.as_bytes());
        match &self.password {
            Some(password) => {
                hasher.update([1u8]);
                hasher.update(password.as_bytes());
            }
            None => hasher.update([0u8]),
        }
        format!("{:x}", hasher.finalize())
    }
}

/// Identity of the local device, published as presence payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncUser {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browser: Option<String>,
    #[serde(default)]
    pub is_mobile: bool,
}

impl SyncUser {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            device: None,
            os: None,
            browser: None,
            is_mobile: false,
        }
    }

    /// Builds the local identity from configuration and the build target.
    pub fn from_env(device_id: Option<String>, device_name: Option<String>) -> Self {
        let os = std::env::consts::OS;
        Self {
            id: device_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            name: device_name,
            device: Some(std::env::consts::ARCH.to_string()),
            os: Some(os.to_string()),
            browser: None,
            is_mobile: matches!(os, "android" | "ios"),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Display shape of one connected peer (self included).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRecord {
    #[serde(flatten)]
    pub user: SyncUser,
    #[serde(rename = "clientID")]
    pub client_id: u32,
    pub current: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_id_is_stable() {
        let a = SyncChannel::new("room1");
        let b = SyncChannel::new("room1");
        assert_eq!(a.room_id(), b.room_id());
        assert_eq!(a.room_id().len(), 64);
        assert!(!a.room_id().contains("room1"));
    }

    #[test]
    fn test_room_id_depends_on_password() {
        let open = SyncChannel::new("room1");
        let locked = SyncChannel::new("room1").with_password("secret");
        let other = SyncChannel::new("room1").with_password("other");

        assert_ne!(open.room_id(), locked.room_id());
        assert_ne!(locked.room_id(), other.room_id());
    }

    #[test]
    fn test_room_id_separates_name_from_password() {
        let joined = SyncChannel::new("team:secret");
        let split = SyncChannel::new("team").with_password("secret");
        assert_ne!(joined.room_id(), split.room_id());

        let empty = SyncChannel::new("team").with_password("");
        assert_ne!(empty.room_id(), SyncChannel::new("team").room_id());
        assert_ne!(
            SyncChannel::new("ab").with_password("c").room_id(),
            SyncChannel::new("a").with_password("bc").room_id()
        );
    }

    #[test]
    fn test_sync_user_from_env() {
        let user = SyncUser::from_env(Some("device-1".to_string()), Some("laptop".to_string()));
        assert_eq!(user.id, "device-1");
        assert_eq!(user.name.as_deref(), Some("laptop"));
        assert_eq!(user.os.as_deref(), Some(std::env::consts::OS));

        let generated = SyncUser::from_env(None, None);
        assert!(Uuid::parse_str(&generated.id).is_ok());
    }

    #[test]
    fn test_presence_record_json_shape() {
        let record = PresenceRecord {
            user: SyncUser::new("u1").with_name("Alice"),
            client_id: 42,
            current: true,
        };

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["id"], "u1");
        assert_eq!(json["name"], "Alice");
        assert_eq!(json["clientID"], 42);
        assert_eq!(json["current"], true);
        assert_eq!(json["isMobile"], false);
    }
}
