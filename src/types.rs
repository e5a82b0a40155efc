//! Connection records shared by adapters and controllers

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::caip::CaipNetworkId;

/// Role of a Bitcoin address inside a multi-address wallet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressPurpose {
    Payment,
    #[serde(alias = "ordinals")]
    Ordinal,
    #[serde(alias = "stacks")]
    Stx,
}

/// A single account exposed by a wallet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub purpose: Option<AddressPurpose>,
}

impl Account {
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            purpose: None,
        }
    }

    pub fn with_purpose(mut self, purpose: AddressPurpose) -> Self {
        self.purpose = Some(purpose);
        self
    }

    /// Hex addresses compare case-insensitively, everything else exactly
    pub fn matches(&self, address: &str) -> bool {
        if self.address.starts_with("0x") {
            self.address.eq_ignore_ascii_case(address)
        } else {
            self.address == address
        }
    }
}

/// An established link between a connector and the dApp within one namespace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub connector_id: String,
    pub accounts: Vec<Account>,
    pub caip_network_id: Option<CaipNetworkId>,
}

impl Connection {
    pub fn new(connector_id: &str, accounts: Vec<Account>) -> Self {
        Self {
            connector_id: connector_id.to_string(),
            accounts,
            caip_network_id: None,
        }
    }

    pub fn with_network(mut self, caip_network_id: CaipNetworkId) -> Self {
        self.caip_network_id = Some(caip_network_id);
        self
    }

    pub fn primary_address(&self) -> Option<&str> {
        self.accounts.first().map(|a| a.address.as_str())
    }

    pub fn has_address(&self, address: &str) -> bool {
        self.accounts.iter().any(|a| a.matches(address))
    }

    pub fn is_connector(&self, connector_id: &str) -> bool {
        self.connector_id.eq_ignore_ascii_case(connector_id)
    }
}

/// Per-namespace connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Disconnected => write!(f, "disconnected"),
            ConnectionStatus::Connecting => write!(f, "connecting"),
            ConnectionStatus::Connected => write!(f, "connected"),
        }
    }
}
