//! Raw wallet provider surface
//!
//! A provider is the handle a wallet hands the dApp: a JSON-RPC style
//! `request` plus a stream of native events. Only the namespace adapters
//! look at what flows through it.

use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::error::ConnectError;

/// A native event as emitted by the wallet
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderEvent {
    pub name: String,
    pub data: Value,
}

impl ProviderEvent {
    pub fn new(name: &str, data: Value) -> Self {
        Self {
            name: name.to_string(),
            data,
        }
    }
}

/// JSON-RPC error returned by a wallet
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("[{code}] {message}")]
pub struct ProviderError {
    pub code: i64,
    pub message: String,
}

impl ProviderError {
    pub const USER_REJECTED: i64 = 4001;
    pub const UNAUTHORIZED: i64 = 4100;
    pub const UNSUPPORTED_METHOD: i64 = 4200;
    pub const DISCONNECTED: i64 = 4900;
    pub const CHAIN_DISCONNECTED: i64 = 4901;
    pub const UNRECOGNIZED_CHAIN: i64 = 4902;
    /// WalletConnect session-request rejection codes
    pub const WC_USER_REJECTED: i64 = 5000;
    pub const WC_USER_REJECTED_METHODS: i64 = 5002;

    pub fn new(code: i64, message: &str) -> Self {
        Self {
            code,
            message: message.to_string(),
        }
    }

    pub fn user_rejected() -> Self {
        Self::new(Self::USER_REJECTED, "User rejected the request.")
    }

    pub fn unsupported_method(method: &str) -> Self {
        Self::new(
            Self::UNSUPPORTED_METHOD,
            &format!("Method {} is not supported", method),
        )
    }

    /// Classify into the crate error taxonomy
    pub fn into_connect_error(self, connector_id: &str) -> ConnectError {
        match self.code {
            Self::USER_REJECTED | Self::WC_USER_REJECTED | Self::WC_USER_REJECTED_METHODS => {
                ConnectError::UserRejected(self.message)
            }
            Self::UNRECOGNIZED_CHAIN => ConnectError::UnsupportedNetwork(self.message),
            Self::UNAUTHORIZED | Self::DISCONNECTED | Self::CHAIN_DISCONNECTED => {
                ConnectError::ProviderUnavailable {
                    connector_id: connector_id.to_string(),
                }
            }
            code => ConnectError::Provider {
                code,
                message: self.message,
            },
        }
    }
}

/// What an injected, announced or embedded wallet exposes
#[async_trait]
pub trait WalletProvider: Send + Sync {
    async fn request(&self, method: &str, params: Value) -> Result<Value, ProviderError>;

    /// Native event stream
    fn events(&self) -> broadcast::Receiver<ProviderEvent>;
}

/// Shared, cloneable provider reference carried by connectors
#[derive(Clone)]
pub struct ProviderHandle(Arc<dyn WalletProvider>);

impl ProviderHandle {
    pub fn new(provider: Arc<dyn WalletProvider>) -> Self {
        Self(provider)
    }

    pub fn same_as(&self, other: &ProviderHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl<P: WalletProvider + 'static> From<Arc<P>> for ProviderHandle {
    fn from(provider: Arc<P>) -> Self {
        Self(provider)
    }
}

impl Deref for ProviderHandle {
    type Target = dyn WalletProvider;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl fmt::Debug for ProviderHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ProviderHandle(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_user_rejection() {
        for code in [4001, 5000, 5002] {
            let err = ProviderError::new(code, "nope").into_connect_error("io.metamask");
            assert!(err.is_user_rejection(), "code {}", code);
        }
    }

    #[test]
    fn test_classify_unsupported_chain() {
        let err = ProviderError::new(4902, "Unrecognized chain ID").into_connect_error("x");
        assert!(matches!(err, ConnectError::UnsupportedNetwork(_)));
    }

    #[test]
    fn test_classify_disconnected() {
        let err = ProviderError::new(4900, "Disconnected").into_connect_error("io.rabby");
        assert_eq!(
            err,
            ConnectError::ProviderUnavailable {
                connector_id: "io.rabby".to_string()
            }
        );
    }

    #[test]
    fn test_unclassified_passes_code() {
        let err = ProviderError::new(-32603, "Internal").into_connect_error("x");
        assert!(matches!(err, ConnectError::Provider { code: -32603, .. }));
    }
}
