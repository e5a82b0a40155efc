//! WalletConnect
//!
//! The relay protocol itself (encryption, websocket relay) lives behind
//! [`WalletConnectTransport`]. This module owns what the orchestrator needs
//! from it: pairing URIs, the namespace proposal and the parsing of approved
//! sessions.

pub mod namespaces;
pub mod pairing;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tokio::sync::{broadcast, oneshot};

use crate::caip::CaipNetworkId;
use crate::error::ConnectError;

pub use namespaces::{
    apply_namespace_overrides, canonical_chain, chains_from_session, connections_from_session,
    create_namespaces, default_methods, NamespaceOverrides, ProposalNamespace, ProposalNamespaces,
};
pub use pairing::PairingUri;

/// What a session granted for one namespace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionNamespace {
    /// CAIP-10 accounts
    pub accounts: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chains: Option<Vec<String>>,
    pub methods: Vec<String>,
    pub events: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerMetadata {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub icons: Vec<String>,
}

/// An approved WalletConnect session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub topic: String,
    pub namespaces: BTreeMap<String, SessionNamespace>,
    #[serde(default)]
    pub peer: Option<PeerMetadata>,
    /// Unix seconds
    #[serde(default)]
    pub expiry: i64,
}

/// A proposal waiting for the wallet to scan and approve
pub struct PendingPairing {
    pub uri: PairingUri,
    pub approval: oneshot::Receiver<Result<Session, ConnectError>>,
}

/// Session lifecycle notifications from the relay
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The wallet (or relay) ended the session
    Deleted { topic: String },
    /// The wallet changed the granted namespaces
    Updated {
        topic: String,
        namespaces: BTreeMap<String, SessionNamespace>,
    },
}

/// Relay client consumed by the connection controller
#[async_trait]
pub trait WalletConnectTransport: Send + Sync {
    /// Publish a proposal and return its pairing URI
    async fn connect(
        &self,
        optional_namespaces: &ProposalNamespaces,
    ) -> Result<PendingPairing, ConnectError>;

    /// Drop a pairing that was never approved
    async fn revoke_pairing(&self, topic: &str) -> Result<(), ConnectError>;

    /// Currently live session, if any
    async fn active_session(&self) -> Option<Session>;

    async fn disconnect_session(&self, topic: &str) -> Result<(), ConnectError>;

    async fn request(
        &self,
        topic: &str,
        chain_id: &CaipNetworkId,
        method: &str,
        params: Value,
    ) -> Result<Value, ConnectError>;

    fn subscribe(&self) -> broadcast::Receiver<SessionEvent>;
}
