//! Device identity and the credential resolution seam.
//!
//! The fleet registry proper lives elsewhere; the coordinator only needs to
//! turn an opaque credential into an identity and to stamp activity. Both
//! go through [`DeviceDirectory`] so the concrete registry (database,
//! static roster, external service) stays pluggable.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

pub type DeviceId = String;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub name: String,
    /// The credential this device authenticates with; echoed in observer
    /// bookkeeping messages.
    pub token: String,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(default)]
    pub online: bool,
}

#[async_trait]
pub trait DeviceDirectory: Send + Sync {
    /// Resolves an opaque credential. `None` means unknown, not an error.
    async fn resolve(&self, credential: &str) -> anyhow::Result<Option<Device>>;

    /// Stamps activity: refreshes last-seen and flips the device online.
    async fn touch(&self, id: &DeviceId) -> anyhow::Result<()>;

    async fn mark_offline(&self, id: &DeviceId) -> anyhow::Result<()>;
}

#[derive(Debug, Deserialize)]
struct RosterEntry {
    token: String,
    #[serde(default)]
    id: Option<String>,
    name: String,
}

#[derive(Debug, Deserialize)]
struct RosterFile {
    #[serde(default)]
    devices: Vec<RosterEntry>,
}

/// Static roster: a YAML list of known devices resolved by token.
#[derive(Default)]
pub struct DeviceRoster {
    by_token: RwLock<HashMap<String, Device>>,
}

impl DeviceRoster {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_yaml(text: &str) -> anyhow::Result<Self> {
        let file: RosterFile = serde_yaml::from_str(text)?;
        let mut by_token = HashMap::new();
        for entry in file.devices {
            let id = entry.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            by_token.insert(
                entry.token.clone(),
                Device { id, name: entry.name, token: entry.token, last_seen: None, online: false },
            );
        }
        Ok(Self { by_token: RwLock::new(by_token) })
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml(&text)
    }

    pub fn len(&self) -> usize {
        self.by_token.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DeviceDirectory for DeviceRoster {
    async fn resolve(&self, credential: &str) -> anyhow::Result<Option<Device>> {
        Ok(self.by_token.read().get(credential).cloned())
    }

    async fn touch(&self, id: &DeviceId) -> anyhow::Result<()> {
        let mut map = self.by_token.write();
        if let Some(d) = map.values_mut().find(|d| &d.id == id) {
            d.last_seen = Some(Utc::now());
            d.online = true;
        }
        Ok(())
    }

    async fn mark_offline(&self, id: &DeviceId) -> anyhow::Result<()> {
        let mut map = self.by_token.write();
        if let Some(d) = map.values_mut().find(|d| &d.id == id) {
            d.online = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROSTER: &str = r#"
devices:
  - token: tok-a
    id: edge-01
    name: lobby sensor
  - token: tok-b
    name: unnamed-id
"#;

    #[tokio::test]
    async fn resolves_known_tokens_only() {
        let roster = DeviceRoster::from_yaml(ROSTER).unwrap();
        assert_eq!(roster.len(), 2);
        let d = roster.resolve("tok-a").await.unwrap().unwrap();
        assert_eq!(d.id, "edge-01");
        assert_eq!(d.name, "lobby sensor");
        assert!(roster.resolve("tok-z").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_id_gets_generated() {
        let roster = DeviceRoster::from_yaml(ROSTER).unwrap();
        let d = roster.resolve("tok-b").await.unwrap().unwrap();
        assert!(!d.id.is_empty());
    }

    #[tokio::test]
    async fn touch_marks_online_and_offline_reverts() {
        let roster = DeviceRoster::from_yaml(ROSTER).unwrap();
        roster.touch(&"edge-01".to_string()).await.unwrap();
        let d = roster.resolve("tok-a").await.unwrap().unwrap();
        assert!(d.online);
        assert!(d.last_seen.is_some());
        roster.mark_offline(&"edge-01".to_string()).await.unwrap();
        let d = roster.resolve("tok-a").await.unwrap().unwrap();
        assert!(!d.online);
    }
}
