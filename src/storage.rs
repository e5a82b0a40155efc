//! Persistent key-value storage
//!
//! A small synchronous key-value interface with an in-memory and a JSON file
//! backend, plus [`PersistedState`], the typed view the controllers use.
//! Persistence failures are logged and swallowed: a broken disk must never
//! break a live wallet session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, warn};

use crate::caip::{CaipNetworkId, Namespace};
use crate::error::ConnectError;

/// Storage keys
pub mod keys {
    use crate::caip::Namespace;

    pub const CONNECTED_CONNECTOR_ID: &str = "connected-connector-id";
    pub const ACTIVE_NETWORK_ID: &str = "active-network-id";
    pub const ACTIVE_NAMESPACE: &str = "active-namespace";
    pub const RECENT_CONNECTIONS: &str = "recent-connections";

    pub fn connected_connector_id(namespace: &Namespace) -> String {
        format!("{}:{}", CONNECTED_CONNECTOR_ID, namespace)
    }

    pub fn recent_connections(namespace: &Namespace) -> String {
        format!("{}:{}", RECENT_CONNECTIONS, namespace)
    }
}

/// Key-value backend
pub trait Storage: Send + Sync {
    fn get_item(&self, key: &str) -> Result<Option<String>, ConnectError>;
    fn set_item(&self, key: &str, value: &str) -> Result<(), ConnectError>;
    fn remove_item(&self, key: &str) -> Result<(), ConnectError>;
}

/// Process-local storage
#[derive(Debug, Default)]
pub struct MemoryStorage {
    items: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>, ConnectError> {
        let items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(items.get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), ConnectError> {
        let mut items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        items.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<(), ConnectError> {
        let mut items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        items.remove(key);
        Ok(())
    }
}

/// Write-through JSON document on disk
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    items: Mutex<BTreeMap<String, String>>,
}

impl FileStorage {
    /// Open (or lazily create) the document at `path`
    pub fn open(path: &Path) -> Result<Self, ConnectError> {
        let items = match std::fs::read_to_string(path) {
            Ok(raw) if raw.trim().is_empty() => BTreeMap::new(),
            Ok(raw) => serde_json::from_str(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path: path.to_path_buf(),
            items: Mutex::new(items),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self, items: &BTreeMap<String, String>) -> Result<(), ConnectError> {
        let raw = serde_json::to_string_pretty(items)?;
        std::fs::write(&self.path, raw)?;
        Ok(())
    }
}

impl Storage for FileStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>, ConnectError> {
        let items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(items.get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), ConnectError> {
        let mut items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        items.insert(key.to_string(), value.to_string());
        self.flush(&items)
    }

    fn remove_item(&self, key: &str) -> Result<(), ConnectError> {
        let mut items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        if items.remove(key).is_some() {
            self.flush(&items)?;
        }
        Ok(())
    }
}

/// A connector the user connected with recently
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecentConnection {
    pub connector_id: String,
    pub last_used_address: Option<String>,
    pub last_used_at: DateTime<Utc>,
}

/// Typed access to everything the orchestrator persists
#[derive(Clone)]
pub struct PersistedState {
    storage: Arc<dyn Storage>,
    max_recent: usize,
}

impl PersistedState {
    pub fn new(storage: Arc<dyn Storage>, max_recent: usize) -> Self {
        Self {
            storage,
            max_recent,
        }
    }

    fn read(&self, key: &str) -> Option<String> {
        match self.storage.get_item(key) {
            Ok(value) => value,
            Err(e) => {
                warn!("Failed to read {}: {}", key, e);
                None
            }
        }
    }

    fn write(&self, key: &str, value: &str) {
        if let Err(e) = self.storage.set_item(key, value) {
            warn!("Failed to persist {}: {}", key, e);
        }
    }

    fn remove(&self, key: &str) {
        if let Err(e) = self.storage.remove_item(key) {
            warn!("Failed to remove {}: {}", key, e);
        }
    }

    // ========================================================================
    // Connected connectors
    // ========================================================================

    pub fn get_connected_connector_id(&self, namespace: &Namespace) -> Option<String> {
        self.read(&keys::connected_connector_id(namespace))
            .filter(|id| !id.is_empty())
    }

    pub fn set_connected_connector_id(&self, namespace: &Namespace, connector_id: &str) {
        self.write(&keys::connected_connector_id(namespace), connector_id);
    }

    pub fn delete_connected_connector_id(&self, namespace: &Namespace) {
        self.remove(&keys::connected_connector_id(namespace));
    }

    // ========================================================================
    // Active network
    // ========================================================================

    pub fn get_active_caip_network_id(&self) -> Option<CaipNetworkId> {
        let raw = self.read(keys::ACTIVE_NETWORK_ID)?;
        match raw.parse() {
            Ok(id) => Some(id),
            Err(e) => {
                warn!("Ignoring stored network id: {}", e);
                None
            }
        }
    }

    pub fn set_active_caip_network_id(&self, caip_network_id: &CaipNetworkId) {
        self.write(keys::ACTIVE_NETWORK_ID, &caip_network_id.to_string());
        self.write(keys::ACTIVE_NAMESPACE, caip_network_id.namespace().as_str());
    }

    pub fn delete_active_caip_network_id(&self) {
        self.remove(keys::ACTIVE_NETWORK_ID);
    }

    pub fn get_active_namespace(&self) -> Option<Namespace> {
        self.read(keys::ACTIVE_NAMESPACE)
            .filter(|ns| !ns.is_empty())
            .map(Namespace::new)
    }

    // ========================================================================
    // Recent connections
    // ========================================================================

    pub fn get_recent_connections(&self, namespace: &Namespace) -> Vec<RecentConnection> {
        let Some(raw) = self.read(&keys::recent_connections(namespace)) else {
            return Vec::new();
        };
        serde_json::from_str(&raw).unwrap_or_else(|e| {
            warn!("Discarding corrupt recent connections for {}: {}", namespace, e);
            Vec::new()
        })
    }

    /// Move `connector_id` to the front of the recent list
    pub fn add_recent_connection(
        &self,
        namespace: &Namespace,
        connector_id: &str,
        address: Option<&str>,
    ) {
        let mut recent = self.get_recent_connections(namespace);
        recent.retain(|r| !r.connector_id.eq_ignore_ascii_case(connector_id));
        recent.insert(
            0,
            RecentConnection {
                connector_id: connector_id.to_string(),
                last_used_address: address.map(str::to_string),
                last_used_at: Utc::now(),
            },
        );
        recent.truncate(self.max_recent.max(1));

        match serde_json::to_string(&recent) {
            Ok(raw) => self.write(&keys::recent_connections(namespace), &raw),
            Err(e) => warn!("Failed to encode recent connections: {}", e),
        }
        debug!("Recorded recent connection {} for {}", connector_id, namespace);
    }
}

impl std::fmt::Debug for PersistedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistedState")
            .field("max_recent", &self.max_recent)
            .finish()
    }
}
