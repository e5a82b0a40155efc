//! Adapter Blueprint
//!
//! Every namespace plugs into the orchestrator through [`ChainAdapter`]. An
//! adapter is the only code allowed to know its ecosystem's native RPC and
//! event shapes; the controllers only see the canonical [`AdapterEvent`]s.

pub mod bitcoin;
pub mod evm;
pub mod provider;
pub mod registry;
pub mod solana;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::caip::{CaipNetwork, CaipNetworkId, Namespace};
use crate::connector::Connector;
use crate::error::ConnectError;
use crate::types::Account;

pub use bitcoin::BitcoinAdapter;
pub use evm::EvmAdapter;
pub use provider::{ProviderError, ProviderEvent, ProviderHandle, WalletProvider};
pub use registry::ProviderRegistry;
pub use solana::SolanaAdapter;

/// Canonical provider events
#[derive(Debug, Clone, PartialEq)]
pub enum AdapterEvent {
    AccountsChanged {
        connector_id: String,
        accounts: Vec<Account>,
    },
    ChainChanged {
        connector_id: String,
        caip_network_id: CaipNetworkId,
    },
    /// Terminal: the wallet ended the session
    Disconnect { connector_id: String },
}

impl AdapterEvent {
    pub fn connector_id(&self) -> &str {
        match self {
            AdapterEvent::AccountsChanged { connector_id, .. }
            | AdapterEvent::ChainChanged { connector_id, .. }
            | AdapterEvent::Disconnect { connector_id } => connector_id,
        }
    }
}

/// Options for [`ChainAdapter::connect`]
#[derive(Debug, Clone, Default)]
pub struct ConnectParams {
    /// Network the dApp would like the wallet on after connecting
    pub network: Option<CaipNetwork>,
}

/// Outcome of a successful connect
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectResult {
    /// Address selected by the wallet
    pub address: String,
    pub accounts: Vec<Account>,
    pub chain_id: Option<CaipNetworkId>,
}

/// Contract every namespace implementation provides
#[async_trait]
pub trait ChainAdapter: Send + Sync {
    fn namespace(&self) -> &Namespace;

    // ========================================================================
    // Discovery
    // ========================================================================

    /// Enumerate reachable wallets. Safe to call repeatedly.
    async fn discover_connectors(&self) -> Vec<Connector>;

    // ========================================================================
    // Session
    // ========================================================================

    async fn connect(
        &self,
        connector_id: &str,
        params: &ConnectParams,
    ) -> Result<ConnectResult, ConnectError>;

    /// Accounts the wallet currently exposes, without prompting
    async fn get_accounts(&self, connector_id: &str) -> Result<Vec<Account>, ConnectError>;

    /// Best effort; succeeds when already disconnected
    async fn disconnect(&self, connector_id: &str) -> Result<(), ConnectError>;

    async fn switch_network(
        &self,
        connector_id: &str,
        network: &CaipNetwork,
    ) -> Result<(), ConnectError>;

    // ========================================================================
    // Signing
    // ========================================================================

    async fn sign_message(
        &self,
        connector_id: &str,
        address: &str,
        message: &str,
    ) -> Result<String, ConnectError>;

    /// Request payloads are opaque to the orchestrator
    async fn send_transaction(
        &self,
        connector_id: &str,
        request: Value,
    ) -> Result<String, ConnectError>;

    // ========================================================================
    // Events
    // ========================================================================

    fn subscribe(&self) -> broadcast::Receiver<AdapterEvent>;
}
