//! Chain-agnostic identifiers
//!
//! CAIP-2 network ids (`eip155:1`) and CAIP-10 account ids
//! (`eip155:1:0xabc...`) keep addresses unambiguous across namespaces and
//! across chains inside one namespace.

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;

use crate::error::ConnectError;

/// An independent blockchain ecosystem ("eip155", "solana", "bip122", ...)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Namespace(String);

impl Namespace {
    pub const EIP155: &'static str = "eip155";
    pub const SOLANA: &'static str = "solana";
    pub const BIP122: &'static str = "bip122";

    pub fn new(namespace: impl Into<String>) -> Self {
        Self(namespace.into())
    }

    pub fn eip155() -> Self {
        Self::new(Self::EIP155)
    }

    pub fn solana() -> Self {
        Self::new(Self::SOLANA)
    }

    pub fn bip122() -> Self {
        Self::new(Self::BIP122)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Namespace {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl Borrow<str> for Namespace {
    fn borrow(&self) -> &str {
        &self.0
    }
}

fn valid_namespace(s: &str) -> bool {
    (3..=8).contains(&s.len())
        && s.chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

fn valid_reference(s: &str) -> bool {
    (1..=32).contains(&s.len())
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// CAIP-2 network identifier: `<namespace>:<reference>`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CaipNetworkId {
    namespace: Namespace,
    reference: String,
}

impl CaipNetworkId {
    pub fn new(namespace: Namespace, reference: impl Into<String>) -> Result<Self, ConnectError> {
        let reference = reference.into();
        if !valid_namespace(namespace.as_str()) || !valid_reference(&reference) {
            return Err(ConnectError::InvalidCaip(format!("{}:{}", namespace, reference)));
        }
        Ok(Self {
            namespace,
            reference,
        })
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Chain reference inside the namespace ("1", "5eykt4Us...", ...)
    pub fn reference(&self) -> &str {
        &self.reference
    }
}

impl fmt::Display for CaipNetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.reference)
    }
}

impl FromStr for CaipNetworkId {
    type Err = ConnectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (namespace, reference) = s
            .split_once(':')
            .ok_or_else(|| ConnectError::InvalidCaip(s.to_string()))?;
        Self::new(Namespace::new(namespace), reference)
    }
}

impl TryFrom<String> for CaipNetworkId {
    type Error = ConnectError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CaipNetworkId> for String {
    fn from(value: CaipNetworkId) -> Self {
        value.to_string()
    }
}

/// CAIP-10 account identifier: `<namespace>:<reference>:<address>`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CaipAddress {
    network: CaipNetworkId,
    address: String,
}

impl CaipAddress {
    pub fn new(network: CaipNetworkId, address: impl Into<String>) -> Result<Self, ConnectError> {
        let address = address.into();
        if address.is_empty() || address.len() > 128 || address.contains(':') {
            return Err(ConnectError::InvalidCaip(format!("{}:{}", network, address)));
        }
        Ok(Self { network, address })
    }

    pub fn network(&self) -> &CaipNetworkId {
        &self.network
    }

    pub fn namespace(&self) -> &Namespace {
        self.network.namespace()
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

impl fmt::Display for CaipAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.network, self.address)
    }
}

impl FromStr for CaipAddress {
    type Err = ConnectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.splitn(3, ':').collect();
        if parts.len() != 3 {
            return Err(ConnectError::InvalidCaip(s.to_string()));
        }
        let network = CaipNetworkId::new(Namespace::new(parts[0]), parts[1])?;
        Self::new(network, parts[2])
    }
}

impl TryFrom<String> for CaipAddress {
    type Error = ConnectError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CaipAddress> for String {
    fn from(value: CaipAddress) -> Self {
        value.to_string()
    }
}

/// A network a dApp can request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaipNetwork {
    /// Chain reference ("1", "137", "5eykt4Us...")
    pub id: String,
    pub caip_network_id: CaipNetworkId,
    pub name: String,
    /// Default HTTP RPC endpoint
    pub rpc_url: Option<String>,
    pub testnet: bool,
}

impl CaipNetwork {
    pub fn new(caip_network_id: CaipNetworkId, name: &str) -> Self {
        Self {
            id: caip_network_id.reference().to_string(),
            caip_network_id,
            name: name.to_string(),
            rpc_url: None,
            testnet: false,
        }
    }

    pub fn with_rpc_url(mut self, rpc_url: &str) -> Self {
        self.rpc_url = Some(rpc_url.to_string());
        self
    }

    pub fn testnet(mut self) -> Self {
        self.testnet = true;
        self
    }

    pub fn namespace(&self) -> &Namespace {
        self.caip_network_id.namespace()
    }
}

/// Well-known networks
pub mod networks {
    use super::{CaipNetwork, CaipNetworkId, Namespace};

    pub const SOLANA_MAINNET_REF: &str = "5eykt4UsFv8P8NJdTREpY1vzqKqZKvdp";
    pub const SOLANA_DEVNET_REF: &str = "EtWTRABZaYq6iMfeYKouRu166VU2xqa1";
    pub const SOLANA_TESTNET_REF: &str = "4uhcVJyU9pJkvQyS88uRDiswHXSCkY3z";
    pub const BITCOIN_MAINNET_REF: &str = "000000000019d6689c085ae165831e93";
    pub const BITCOIN_TESTNET_REF: &str = "000000000933ea01ad0ee984209779ba";

    fn network(namespace: Namespace, reference: &str, name: &str) -> CaipNetwork {
        // Constant references are valid CAIP-2 by construction
        let id = CaipNetworkId {
            namespace,
            reference: reference.to_string(),
        };
        CaipNetwork::new(id, name)
    }

    pub fn mainnet() -> CaipNetwork {
        network(Namespace::eip155(), "1", "Ethereum").with_rpc_url("https://cloudflare-eth.com")
    }

    pub fn polygon() -> CaipNetwork {
        network(Namespace::eip155(), "137", "Polygon").with_rpc_url("https://polygon-rpc.com")
    }

    pub fn arbitrum() -> CaipNetwork {
        network(Namespace::eip155(), "42161", "Arbitrum One")
            .with_rpc_url("https://arb1.arbitrum.io/rpc")
    }

    pub fn sepolia() -> CaipNetwork {
        network(Namespace::eip155(), "11155111", "Sepolia")
            .with_rpc_url("https://rpc.sepolia.org")
            .testnet()
    }

    pub fn solana() -> CaipNetwork {
        network(Namespace::solana(), SOLANA_MAINNET_REF, "Solana")
            .with_rpc_url("https://api.mainnet-beta.solana.com")
    }

    pub fn solana_devnet() -> CaipNetwork {
        network(Namespace::solana(), SOLANA_DEVNET_REF, "Solana Devnet")
            .with_rpc_url("https://api.devnet.solana.com")
            .testnet()
    }

    pub fn bitcoin() -> CaipNetwork {
        network(Namespace::bip122(), BITCOIN_MAINNET_REF, "Bitcoin")
    }

    pub fn bitcoin_testnet() -> CaipNetwork {
        network(Namespace::bip122(), BITCOIN_TESTNET_REF, "Bitcoin Testnet").testnet()
    }

    /// Every preset, used by the CLI's `--networks all`
    pub fn all() -> Vec<CaipNetwork> {
        vec![
            mainnet(),
            polygon(),
            arbitrum(),
            sepolia(),
            solana(),
            solana_devnet(),
            bitcoin(),
            bitcoin_testnet(),
        ]
    }

    /// Look a preset up by its CAIP-2 id
    pub fn by_id(caip_network_id: &str) -> Option<CaipNetwork> {
        all()
            .into_iter()
            .find(|n| n.caip_network_id.to_string() == caip_network_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_network_id() {
        let id: CaipNetworkId = "eip155:137".parse().unwrap();
        assert_eq!(id.namespace().as_str(), "eip155");
        assert_eq!(id.reference(), "137");
        assert_eq!(id.to_string(), "eip155:137");
    }

    #[test]
    fn test_reject_malformed_network_id() {
        assert!("eip155".parse::<CaipNetworkId>().is_err());
        assert!("EIP155:1".parse::<CaipNetworkId>().is_err());
        assert!("eip155:".parse::<CaipNetworkId>().is_err());
    }

    #[test]
    fn test_parse_caip_address() {
        let addr: CaipAddress = "solana:5eykt4UsFv8P8NJdTREpY1vzqKqZKvdp:7S3P4HxJpyyigGzodYwHtCxZyUQe9JiBMHyRWXArAaKv"
            .parse()
            .unwrap();
        assert_eq!(addr.namespace().as_str(), "solana");
        assert_eq!(addr.address(), "7S3P4HxJpyyigGzodYwHtCxZyUQe9JiBMHyRWXArAaKv");
        assert_eq!(addr.network().reference(), networks::SOLANA_MAINNET_REF);
    }

    #[test]
    fn test_same_address_differs_across_chains() {
        let a: CaipAddress = "eip155:1:0xabc".parse().unwrap();
        let b: CaipAddress = "eip155:137:0xabc".parse().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_serde_as_string() {
        let id: CaipNetworkId = "bip122:000000000019d6689c085ae165831e93".parse().unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"bip122:000000000019d6689c085ae165831e93\"");
        let back: CaipNetworkId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_presets_lookup() {
        let polygon = networks::by_id("eip155:137").unwrap();
        assert_eq!(polygon.name, "Polygon");
        assert_eq!(polygon.namespace(), &Namespace::eip155());
        assert!(networks::by_id("eip155:999999").is_none());
    }
}
