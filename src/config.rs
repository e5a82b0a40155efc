//! Orchestrator configuration

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::ConnectError;
use crate::walletconnect::NamespaceOverrides;

/// What a second connect/switch on a busy namespace does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationPolicy {
    /// Fail fast with `OperationInProgress`
    #[default]
    Reject,
    /// Queue behind the running operation
    Wait,
}

/// Configuration for the connection orchestrator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConnectConfig {
    /// How long a WalletConnect pairing URI stays valid
    pub pairing_expiry_secs: u64,
    /// Connections kept per namespace before the oldest inactive one is evicted
    pub max_connections_per_namespace: usize,
    /// Entries kept in the recently-used connector list
    pub max_recent_connections: usize,
    /// Keep the app usable on a network the dApp did not request
    pub allow_unsupported_chain: bool,
    /// Offer network switching (and so the unsupported-chain view)
    pub enable_network_switch: bool,
    pub operation_policy: OperationPolicy,
    /// Caller overrides applied on top of the generated proposal namespaces
    pub namespace_overrides: Option<NamespaceOverrides>,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            pairing_expiry_secs: 240,
            max_connections_per_namespace: 5,
            max_recent_connections: 5,
            allow_unsupported_chain: false,
            enable_network_switch: true,
            operation_policy: OperationPolicy::Reject,
            namespace_overrides: None,
        }
    }
}

impl ConnectConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from a JSON file; missing fields fall back to defaults
    pub fn from_file(path: &Path) -> Result<Self, ConnectError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConnectError::Config(format!("{}: {}", path.display(), e)))?;
        serde_json::from_str(&raw)
            .map_err(|e| ConnectError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn pairing_expiry(&self) -> Duration {
        Duration::from_secs(self.pairing_expiry_secs)
    }

    pub fn with_pairing_expiry(mut self, expiry: Duration) -> Self {
        self.pairing_expiry_secs = expiry.as_secs();
        self
    }

    pub fn with_operation_policy(mut self, policy: OperationPolicy) -> Self {
        self.operation_policy = policy;
        self
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections_per_namespace = max;
        self
    }

    pub fn with_allow_unsupported_chain(mut self, allow: bool) -> Self {
        self.allow_unsupported_chain = allow;
        self
    }

    pub fn with_namespace_overrides(mut self, overrides: NamespaceOverrides) -> Self {
        self.namespace_overrides = Some(overrides);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ConnectConfig::default();
        assert_eq!(config.pairing_expiry(), Duration::from_secs(240));
        assert_eq!(config.operation_policy, OperationPolicy::Reject);
        assert!(config.enable_network_switch);
        assert!(!config.allow_unsupported_chain);
    }

    #[test]
    fn test_from_file_partial() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"pairingExpirySecs": 60, "operationPolicy": "wait"}}"#
        )
        .unwrap();

        let config = ConnectConfig::from_file(file.path()).unwrap();
        assert_eq!(config.pairing_expiry_secs, 60);
        assert_eq!(config.operation_policy, OperationPolicy::Wait);
        assert_eq!(config.max_connections_per_namespace, 5);
    }

    #[test]
    fn test_from_file_missing() {
        let err = ConnectConfig::from_file(Path::new("/nonexistent/multiconnect.json"));
        assert!(matches!(err, Err(ConnectError::Config(_))));
    }
}
