//! Connection Error Types
//!
//! Unified error handling for every connect, switch and disconnect flow.

use std::fmt;
use std::time::Duration;

use crate::caip::Namespace;

/// Errors surfaced by controllers, adapters and the WalletConnect transport
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectError {
    /// No connector with this id is registered for the namespace
    ConnectorNotFound {
        connector_id: String,
        namespace: Namespace,
    },

    /// The connector exists but its provider is gone or refuses to talk
    ProviderUnavailable { connector_id: String },

    /// The user dismissed the wallet prompt
    UserRejected(String),

    /// The wallet does not know the requested network
    UnsupportedNetwork(String),

    /// Another connect/switch for the same scope is still running
    OperationInProgress(String),

    /// The pairing URI was never approved
    PairingExpired {
        elapsed: Duration,
        namespaces: Vec<Namespace>,
    },

    /// The dApp closed the pairing before approval
    PairingCancelled,

    /// A provider event invalidated the operation while it was in flight
    Superseded(Namespace),

    /// No chain adapter handles the namespace
    AdapterNotFound(Namespace),

    /// The namespace has no active connection to route a request to
    NotConnected(Namespace),

    /// The provider answered with an unclassified error
    Provider { code: i64, message: String },

    /// Relay / session transport failure
    Transport(String),

    /// Malformed CAIP-2 or CAIP-10 identifier
    InvalidCaip(String),

    /// Persistence failure
    Storage(String),

    /// Configuration could not be loaded
    Config(String),

    /// Embedded wallet failure
    Wallet(String),
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectError::ConnectorNotFound {
                connector_id,
                namespace,
            } => write!(f, "Connector {} not found in {}", connector_id, namespace),
            ConnectError::ProviderUnavailable { connector_id } => {
                write!(f, "Provider unavailable for connector {}", connector_id)
            }
            ConnectError::UserRejected(msg) => write!(f, "User rejected the request: {}", msg),
            ConnectError::UnsupportedNetwork(id) => write!(f, "Unsupported network: {}", id),
            ConnectError::OperationInProgress(scope) => {
                write!(f, "Operation already in progress for {}", scope)
            }
            ConnectError::PairingExpired {
                elapsed,
                namespaces,
            } => {
                let names: Vec<&str> = namespaces.iter().map(|n| n.as_str()).collect();
                write!(
                    f,
                    "Pairing expired after {}s (requested: {})",
                    elapsed.as_secs(),
                    names.join(", ")
                )
            }
            ConnectError::PairingCancelled => write!(f, "Pairing cancelled"),
            ConnectError::Superseded(ns) => {
                write!(f, "Operation on {} superseded by a provider event", ns)
            }
            ConnectError::AdapterNotFound(ns) => write!(f, "No adapter registered for {}", ns),
            ConnectError::NotConnected(ns) => write!(f, "No active connection in {}", ns),
            ConnectError::Provider { code, message } => {
                write!(f, "Provider error [{}]: {}", code, message)
            }
            ConnectError::Transport(msg) => write!(f, "Transport error: {}", msg),
            ConnectError::InvalidCaip(value) => write!(f, "Invalid CAIP identifier: {}", value),
            ConnectError::Storage(msg) => write!(f, "Storage error: {}", msg),
            ConnectError::Config(msg) => write!(f, "Config error: {}", msg),
            ConnectError::Wallet(msg) => write!(f, "Wallet error: {}", msg),
        }
    }
}

impl std::error::Error for ConnectError {}

impl ConnectError {
    /// Whether retrying the same call later can succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ConnectError::OperationInProgress(_)
                | ConnectError::PairingExpired { .. }
                | ConnectError::Superseded(_)
                | ConnectError::Transport(_)
        )
    }

    pub fn is_user_rejection(&self) -> bool {
        matches!(self, ConnectError::UserRejected(_))
    }
}

impl From<serde_json::Error> for ConnectError {
    fn from(err: serde_json::Error) -> Self {
        ConnectError::Storage(err.to_string())
    }
}

impl From<std::io::Error> for ConnectError {
    fn from(err: std::io::Error) -> Self {
        ConnectError::Storage(err.to_string())
    }
}
