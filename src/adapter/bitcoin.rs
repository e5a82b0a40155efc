//! Bitcoin adapter (sats-connect style providers)
//!
//! Wallets expose several addresses with a purpose each (payment, ordinals,
//! stacks). Address classification uses bech32 for segwit / taproot and
//! base58 for legacy outputs.

use async_trait::async_trait;
use bech32::Variant;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::{AdapterEvent, ChainAdapter, ConnectParams, ConnectResult, ProviderEvent, ProviderRegistry};
use crate::caip::{networks, CaipNetwork, CaipNetworkId, Namespace};
use crate::connector::Connector;
use crate::error::ConnectError;
use crate::types::{Account, AddressPurpose};

/// Which chain an address belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitcoinNetwork {
    Mainnet,
    Testnet,
    Regtest,
}

/// Output type of an address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressKind {
    Legacy,
    Segwit,
    Taproot,
}

/// Classify a Bitcoin address, `None` when it is not one
pub fn classify_address(address: &str) -> Option<(BitcoinNetwork, AddressKind)> {
    let lower = address.to_ascii_lowercase();
    if lower.starts_with("bc1") || lower.starts_with("tb1") || lower.starts_with("bcrt1") {
        let (hrp, data, variant) = bech32::decode(address).ok()?;
        let network = match hrp.as_str() {
            "bc" => BitcoinNetwork::Mainnet,
            "tb" => BitcoinNetwork::Testnet,
            "bcrt" => BitcoinNetwork::Regtest,
            _ => return None,
        };
        let version = data.first()?.to_u8();
        return match (version, variant) {
            (0, Variant::Bech32) => Some((network, AddressKind::Segwit)),
            (1, Variant::Bech32m) => Some((network, AddressKind::Taproot)),
            _ => None,
        };
    }

    let bytes = bs58::decode(address).into_vec().ok()?;
    if bytes.len() != 25 {
        return None;
    }
    match bytes[0] {
        0x00 | 0x05 => Some((BitcoinNetwork::Mainnet, AddressKind::Legacy)),
        0x6f | 0xc4 => Some((BitcoinNetwork::Testnet, AddressKind::Legacy)),
        _ => None,
    }
}

fn network_reference(network: BitcoinNetwork) -> &'static str {
    match network {
        BitcoinNetwork::Mainnet => networks::BITCOIN_MAINNET_REF,
        BitcoinNetwork::Testnet | BitcoinNetwork::Regtest => networks::BITCOIN_TESTNET_REF,
    }
}

fn caip_network_id(network: BitcoinNetwork) -> Option<CaipNetworkId> {
    CaipNetworkId::new(Namespace::bip122(), network_reference(network)).ok()
}

/// Wallet-side network names used by `networkChange` / `wallet_changeNetwork`
fn wallet_network_name(reference: &str) -> Option<&'static str> {
    match reference {
        networks::BITCOIN_MAINNET_REF => Some("Mainnet"),
        networks::BITCOIN_TESTNET_REF => Some("Testnet"),
        _ => None,
    }
}

fn network_from_wallet_name(name: &str) -> Option<BitcoinNetwork> {
    match name.to_ascii_lowercase().as_str() {
        "mainnet" => Some(BitcoinNetwork::Mainnet),
        "testnet" | "testnet4" | "signet" => Some(BitcoinNetwork::Testnet),
        "regtest" => Some(BitcoinNetwork::Regtest),
        _ => None,
    }
}

/// `{addresses: [...]}` or a bare list of `{address, purpose}`
fn parse_accounts(value: &Value) -> (Vec<Account>, Option<BitcoinNetwork>) {
    let list = value
        .get("addresses")
        .and_then(Value::as_array)
        .or_else(|| value.as_array());
    let Some(list) = list else {
        return (Vec::new(), None);
    };

    let mut network = None;
    let mut accounts = Vec::new();
    for entry in list {
        let Some(address) = entry.get("address").and_then(Value::as_str) else {
            continue;
        };
        let purpose: Option<AddressPurpose> = entry
            .get("purpose")
            .and_then(|p| serde_json::from_value(p.clone()).ok());

        match classify_address(address) {
            Some((net, kind)) => {
                network.get_or_insert(net);
                let purpose = purpose.unwrap_or(match kind {
                    AddressKind::Taproot => AddressPurpose::Ordinal,
                    AddressKind::Segwit | AddressKind::Legacy => AddressPurpose::Payment,
                });
                accounts.push(Account::new(address).with_purpose(purpose));
            }
            // Stacks addresses ride along but are not Bitcoin outputs
            None if purpose == Some(AddressPurpose::Stx) => {
                accounts.push(Account::new(address).with_purpose(AddressPurpose::Stx));
            }
            None => warn!("Dropping malformed Bitcoin address {}", address),
        }
    }

    // Payment address first: it is the one the dApp signs with
    accounts.sort_by_key(|a| a.purpose != Some(AddressPurpose::Payment));
    (accounts, network)
}

fn string_field(value: &Value, field: &str, method: &str) -> Result<String, ConnectError> {
    value
        .get(field)
        .and_then(Value::as_str)
        .or_else(|| value.as_str())
        .map(str::to_string)
        .ok_or_else(|| ConnectError::Provider {
            code: -32603,
            message: format!("{} returned no {}", method, field),
        })
}

fn normalize_event(connector_id: &str, event: &ProviderEvent) -> Vec<AdapterEvent> {
    let connector_id = connector_id.to_string();
    match event.name.as_str() {
        "accountChange" => {
            let (accounts, _) = parse_accounts(&event.data);
            vec![AdapterEvent::AccountsChanged {
                connector_id,
                accounts,
            }]
        }
        "networkChange" => event
            .data
            .get("network")
            .and_then(|n| n.get("name").or(Some(n)))
            .and_then(Value::as_str)
            .and_then(network_from_wallet_name)
            .and_then(caip_network_id)
            .map(|caip_network_id| AdapterEvent::ChainChanged {
                connector_id,
                caip_network_id,
            })
            .into_iter()
            .collect(),
        "disconnect" => vec![AdapterEvent::Disconnect { connector_id }],
        _ => Vec::new(),
    }
}

pub struct BitcoinAdapter {
    namespace: Namespace,
    registry: ProviderRegistry,
}

impl BitcoinAdapter {
    pub fn new() -> Self {
        Self {
            namespace: Namespace::bip122(),
            registry: ProviderRegistry::new(Namespace::bip122(), normalize_event),
        }
    }

    pub async fn register_provider(&self, connector: Connector) -> bool {
        self.registry.register(connector).await
    }

    async fn request_addresses(&self, connector_id: &str) -> Result<(Vec<Account>, Option<BitcoinNetwork>), ConnectError> {
        let provider = self.registry.provider(connector_id).await?;
        let params = json!({ "purposes": ["payment", "ordinals"] });
        let raw = provider
            .request("getAccountAddresses", params)
            .await
            .map_err(|e| e.into_connect_error(connector_id))?;
        Ok(parse_accounts(&raw))
    }
}

impl Default for BitcoinAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChainAdapter for BitcoinAdapter {
    fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    async fn discover_connectors(&self) -> Vec<Connector> {
        self.registry.connectors().await
    }

    async fn connect(
        &self,
        connector_id: &str,
        params: &ConnectParams,
    ) -> Result<ConnectResult, ConnectError> {
        let (accounts, network) = self.request_addresses(connector_id).await?;
        let address = accounts
            .first()
            .map(|a| a.address.clone())
            .ok_or_else(|| ConnectError::ProviderUnavailable {
                connector_id: connector_id.to_string(),
            })?;

        let mut chain_id = network.and_then(caip_network_id);
        if let Some(wanted) = params.network.as_ref().filter(|n| n.namespace() == &self.namespace) {
            if chain_id.as_ref() != Some(&wanted.caip_network_id) {
                match self.switch_network(connector_id, wanted).await {
                    Ok(()) => chain_id = Some(wanted.caip_network_id.clone()),
                    Err(e) => warn!("{} stayed off {}: {}", connector_id, wanted.caip_network_id, e),
                }
            }
        }

        let provider = self.registry.provider(connector_id).await?;
        self.registry.listen(connector_id, &provider);
        info!("Bitcoin connector {} connected as {}", connector_id, address);

        Ok(ConnectResult {
            address,
            accounts,
            chain_id,
        })
    }

    async fn get_accounts(&self, connector_id: &str) -> Result<Vec<Account>, ConnectError> {
        let (accounts, _) = self.request_addresses(connector_id).await?;
        if !accounts.is_empty() && !self.registry.is_listening(connector_id) {
            let provider = self.registry.provider(connector_id).await?;
            self.registry.listen(connector_id, &provider);
        }
        Ok(accounts)
    }

    async fn disconnect(&self, connector_id: &str) -> Result<(), ConnectError> {
        self.registry.unlisten(connector_id);
        let Ok(provider) = self.registry.provider(connector_id).await else {
            return Ok(());
        };
        if let Err(e) = provider.request("wallet_renouncePermissions", json!(null)).await {
            debug!("{} kept permissions: {}", connector_id, e);
        }
        Ok(())
    }

    async fn switch_network(
        &self,
        connector_id: &str,
        network: &CaipNetwork,
    ) -> Result<(), ConnectError> {
        let name = (network.namespace() == &self.namespace)
            .then(|| wallet_network_name(&network.id))
            .flatten()
            .ok_or_else(|| ConnectError::UnsupportedNetwork(network.caip_network_id.to_string()))?;

        let provider = self.registry.provider(connector_id).await?;
        provider
            .request("wallet_changeNetwork", json!({ "name": name }))
            .await
            .map_err(|e| e.into_connect_error(connector_id))?;
        Ok(())
    }

    async fn sign_message(
        &self,
        connector_id: &str,
        address: &str,
        message: &str,
    ) -> Result<String, ConnectError> {
        let provider = self.registry.provider(connector_id).await?;
        let raw = provider
            .request("signMessage", json!({ "address": address, "message": message }))
            .await
            .map_err(|e| e.into_connect_error(connector_id))?;
        string_field(&raw, "signature", "signMessage")
    }

    async fn send_transaction(
        &self,
        connector_id: &str,
        request: Value,
    ) -> Result<String, ConnectError> {
        let provider = self.registry.provider(connector_id).await?;
        let raw = provider
            .request("sendTransfer", request)
            .await
            .map_err(|e| e.into_connect_error(connector_id))?;
        string_field(&raw, "txid", "sendTransfer")
    }

    fn subscribe(&self) -> broadcast::Receiver<AdapterEvent> {
        self.registry.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::ProviderHandle;
    use crate::connector::ConnectorKind;
    use crate::testing::FakeProvider;
    use std::sync::Arc;

    // BIP-173 / BIP-350 test vectors
    const SEGWIT: &str = "bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4";
    const TAPROOT: &str = "bc1p0xlxvlhemja6c4dqv22uapctqupfhlxm9h8z3k2e72q4k9hcz7vqzk5jj0";
    const TESTNET_SEGWIT: &str = "tb1qrp33g0q5c5txsp9arysrx4k6zdkfs4nce4xj0gdcccefvpysxf3q0sl5k7";
    const LEGACY: &str = "1BvBMSEYstWetqTFn5Au4m4GFg7xJaNVN2";

    #[test]
    fn test_classify_addresses() {
        assert_eq!(
            classify_address(SEGWIT),
            Some((BitcoinNetwork::Mainnet, AddressKind::Segwit))
        );
        assert_eq!(
            classify_address(TAPROOT),
            Some((BitcoinNetwork::Mainnet, AddressKind::Taproot))
        );
        assert_eq!(
            classify_address(TESTNET_SEGWIT),
            Some((BitcoinNetwork::Testnet, AddressKind::Segwit))
        );
        assert_eq!(
            classify_address(LEGACY),
            Some((BitcoinNetwork::Mainnet, AddressKind::Legacy))
        );
        assert_eq!(classify_address("0xdeadbeef"), None);
    }

    #[test]
    fn test_purpose_inferred_and_payment_first() {
        let raw = json!({"addresses": [
            {"address": TAPROOT},
            {"address": SEGWIT},
        ]});
        let (accounts, network) = parse_accounts(&raw);
        assert_eq!(network, Some(BitcoinNetwork::Mainnet));
        assert_eq!(accounts[0].address, SEGWIT);
        assert_eq!(accounts[0].purpose, Some(AddressPurpose::Payment));
        assert_eq!(accounts[1].purpose, Some(AddressPurpose::Ordinal));
    }

    #[tokio::test]
    async fn test_connect_reports_mainnet() {
        let provider = Arc::new(FakeProvider::new());
        provider.respond(
            "getAccountAddresses",
            json!({"addresses": [{"address": SEGWIT, "purpose": "payment"}]}),
        );
        let adapter = BitcoinAdapter::new();
        adapter
            .register_provider(
                Connector::new("xverse", "Xverse", Namespace::bip122(), ConnectorKind::Announced)
                    .with_provider(ProviderHandle::from(provider.clone())),
            )
            .await;

        let result = adapter
            .connect("xverse", &ConnectParams::default())
            .await
            .unwrap();
        assert_eq!(result.address, SEGWIT);
        assert_eq!(
            result.chain_id.unwrap().reference(),
            networks::BITCOIN_MAINNET_REF
        );
    }

    #[tokio::test]
    async fn test_switch_to_unknown_network() {
        let adapter = BitcoinAdapter::new();
        let err = adapter
            .switch_network("xverse", &networks::mainnet())
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectError::UnsupportedNetwork(_)));
    }

    #[test]
    fn test_network_change_event() {
        let event = ProviderEvent::new("networkChange", json!({"network": {"name": "Testnet"}}));
        let events = normalize_event("xverse", &event);
        assert!(matches!(
            &events[0],
            AdapterEvent::ChainChanged { caip_network_id, .. }
                if caip_network_id.reference() == networks::BITCOIN_TESTNET_REF
        ));
    }
}
