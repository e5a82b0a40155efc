//! Embedded wallets
//!
//! Local-key wallets that answer the same provider requests as browser
//! wallets, so the namespace adapters drive them unchanged. They back the
//! auth connector and the CLI.

pub mod evm;
pub mod solana;

use crate::adapter::{ProviderError, ProviderHandle};
use crate::caip::Namespace;
use crate::connector::{ids, Connector, ConnectorKind};
use crate::error::ConnectError;

/// Common wallet error type
#[derive(Debug, thiserror::Error)]
pub enum WalletError {
    #[error("Invalid private key: {0}")]
    InvalidPrivateKey(String),

    #[error("Signing failed: {0}")]
    SigningFailed(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid params: {0}")]
    InvalidParams(String),
}

impl From<WalletError> for ConnectError {
    fn from(err: WalletError) -> Self {
        ConnectError::Wallet(err.to_string())
    }
}

impl From<WalletError> for ProviderError {
    fn from(err: WalletError) -> Self {
        let code = match err {
            WalletError::InvalidParams(_) | WalletError::InvalidAddress(_) => -32602,
            _ => -32603,
        };
        ProviderError::new(code, &err.to_string())
    }
}

/// The auth connector of `namespace`, backed by an embedded wallet
pub fn auth_connector(namespace: Namespace, provider: ProviderHandle) -> Connector {
    Connector::new(ids::AUTH, "Auth", namespace, ConnectorKind::Auth).with_provider(provider)
}

pub use evm::EvmWallet;
pub use solana::SolanaWallet;
