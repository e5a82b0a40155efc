//! Solana adapter (wallet-standard providers)

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::{AdapterEvent, ChainAdapter, ConnectParams, ConnectResult, ProviderEvent, ProviderRegistry};
use crate::caip::{networks, CaipNetwork, CaipNetworkId, Namespace};
use crate::connector::Connector;
use crate::error::ConnectError;
use crate::types::Account;

pub struct SolanaAdapter {
    namespace: Namespace,
    registry: ProviderRegistry,
}

impl SolanaAdapter {
    pub fn new() -> Self {
        Self {
            namespace: Namespace::solana(),
            registry: ProviderRegistry::new(Namespace::solana(), normalize_event),
        }
    }

    /// Register a wallet-standard wallet
    pub async fn register_provider(&self, connector: Connector) -> bool {
        self.registry.register(connector).await
    }
}

impl Default for SolanaAdapter {
    fn default() -> Self {
        Self::new()
    }
}

/// A Solana address is the base58 form of a 32-byte public key
pub fn is_valid_address(address: &str) -> bool {
    bs58::decode(address)
        .into_vec()
        .map(|bytes| bytes.len() == 32)
        .unwrap_or(false)
}

/// wallet-standard chain names to CAIP-2
pub fn standard_chain_to_caip(chain: &str) -> Option<CaipNetworkId> {
    let reference = match chain {
        "solana:mainnet" => networks::SOLANA_MAINNET_REF,
        "solana:devnet" => networks::SOLANA_DEVNET_REF,
        "solana:testnet" => networks::SOLANA_TESTNET_REF,
        other => return other.parse().ok(),
    };
    CaipNetworkId::new(Namespace::solana(), reference).ok()
}

/// `{accounts: [{address, chains}]}` or a bare account list
fn parse_accounts(value: &Value) -> (Vec<Account>, Option<CaipNetworkId>) {
    let list = value
        .get("accounts")
        .and_then(Value::as_array)
        .or_else(|| value.as_array());
    let Some(list) = list else {
        return (Vec::new(), None);
    };

    let mut chain = None;
    let mut accounts = Vec::new();
    for entry in list {
        let address = entry
            .get("address")
            .and_then(Value::as_str)
            .or_else(|| entry.as_str());
        let Some(address) = address else {
            continue;
        };
        if !is_valid_address(address) {
            warn!("Dropping malformed Solana address {}", address);
            continue;
        }
        if chain.is_none() {
            chain = entry
                .get("chains")
                .and_then(Value::as_array)
                .and_then(|chains| chains.iter().filter_map(Value::as_str).find_map(standard_chain_to_caip));
        }
        accounts.push(Account::new(address));
    }
    (accounts, chain)
}

fn signature_from(value: &Value, method: &str) -> Result<String, ConnectError> {
    value
        .get("signature")
        .and_then(Value::as_str)
        .or_else(|| value.as_str())
        .map(str::to_string)
        .ok_or_else(|| ConnectError::Provider {
            code: -32603,
            message: format!("{} returned no signature", method),
        })
}

fn normalize_event(connector_id: &str, event: &ProviderEvent) -> Vec<AdapterEvent> {
    let connector_id = connector_id.to_string();
    match event.name.as_str() {
        // wallet-standard `change` carries whichever properties changed
        "change" => {
            let mut events = Vec::new();
            if event.data.get("accounts").is_some() {
                let (accounts, _) = parse_accounts(&event.data);
                events.push(AdapterEvent::AccountsChanged {
                    connector_id: connector_id.clone(),
                    accounts,
                });
            }
            let chain = event
                .data
                .get("chains")
                .and_then(Value::as_array)
                .and_then(|chains| chains.iter().filter_map(Value::as_str).find_map(standard_chain_to_caip));
            if let Some(caip_network_id) = chain {
                events.push(AdapterEvent::ChainChanged {
                    connector_id,
                    caip_network_id,
                });
            }
            events
        }
        "disconnect" => vec![AdapterEvent::Disconnect { connector_id }],
        _ => Vec::new(),
    }
}

#[async_trait]
impl ChainAdapter for SolanaAdapter {
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
        let provider = self.registry.provider(connector_id).await?;
        let raw = provider
            .request("standard:connect", json!({}))
            .await
            .map_err(|e| e.into_connect_error(connector_id))?;

        let (accounts, reported_chain) = parse_accounts(&raw);
        let address = accounts
            .first()
            .map(|a| a.address.clone())
            .ok_or_else(|| ConnectError::ProviderUnavailable {
                connector_id: connector_id.to_string(),
            })?;

        // Wallets do not switch clusters; the dApp picks the RPC
        let chain_id = params
            .network
            .as_ref()
            .filter(|n| n.namespace() == &self.namespace)
            .map(|n| n.caip_network_id.clone())
            .or(reported_chain);

        self.registry.listen(connector_id, &provider);
        info!("Solana connector {} connected as {}", connector_id, address);

        Ok(ConnectResult {
            address,
            accounts,
            chain_id,
        })
    }

    async fn get_accounts(&self, connector_id: &str) -> Result<Vec<Account>, ConnectError> {
        let provider = self.registry.provider(connector_id).await?;
        let raw = provider
            .request("standard:accounts", json!({}))
            .await
            .map_err(|e| e.into_connect_error(connector_id))?;
        let (accounts, _) = parse_accounts(&raw);

        if !accounts.is_empty() && !self.registry.is_listening(connector_id) {
            self.registry.listen(connector_id, &provider);
        }
        Ok(accounts)
    }

    async fn disconnect(&self, connector_id: &str) -> Result<(), ConnectError> {
        self.registry.unlisten(connector_id);
        let Ok(provider) = self.registry.provider(connector_id).await else {
            return Ok(());
        };
        if let Err(e) = provider.request("standard:disconnect", json!({})).await {
            debug!("{} disconnect failed: {}", connector_id, e);
        }
        Ok(())
    }

    async fn switch_network(
        &self,
        connector_id: &str,
        network: &CaipNetwork,
    ) -> Result<(), ConnectError> {
        if network.namespace() != &self.namespace {
            return Err(ConnectError::UnsupportedNetwork(
                network.caip_network_id.to_string(),
            ));
        }
        // Cluster selection is dApp-side; only make sure the wallet is reachable
        self.registry.provider(connector_id).await?;
        Ok(())
    }

    async fn sign_message(
        &self,
        connector_id: &str,
        address: &str,
        message: &str,
    ) -> Result<String, ConnectError> {
        let provider = self.registry.provider(connector_id).await?;
        let params = json!({
            "account": address,
            "message": bs58::encode(message.as_bytes()).into_string(),
        });
        let raw = provider
            .request("solana:signMessage", params)
            .await
            .map_err(|e| e.into_connect_error(connector_id))?;
        signature_from(&raw, "solana:signMessage")
    }

    async fn send_transaction(
        &self,
        connector_id: &str,
        request: Value,
    ) -> Result<String, ConnectError> {
        let provider = self.registry.provider(connector_id).await?;
        let raw = provider
            .request("solana:signAndSendTransaction", json!({ "transaction": request }))
            .await
            .map_err(|e| e.into_connect_error(connector_id))?;
        signature_from(&raw, "solana:signAndSendTransaction")
    }

    fn subscribe(&self) -> broadcast::Receiver<AdapterEvent> {
        self.registry.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{ProviderError, ProviderHandle};
    use crate::connector::ConnectorKind;
    use crate::testing::FakeProvider;
    use std::sync::Arc;

    const PUBKEY: &str = "TokenkegQfeZyiNwAJbNbGKPFXCWuBvf9Ss623VQ5DA";

    async fn adapter_with(provider: &Arc<FakeProvider>) -> SolanaAdapter {
        let adapter = SolanaAdapter::new();
        adapter
            .register_provider(
                Connector::new("phantom", "Phantom", Namespace::solana(), ConnectorKind::Announced)
                    .with_provider(ProviderHandle::from(provider.clone())),
            )
            .await;
        adapter
    }

    #[test]
    fn test_address_validation() {
        assert!(is_valid_address(PUBKEY));
        assert!(!is_valid_address("0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266"));
        assert!(!is_valid_address("abc"));
    }

    #[test]
    fn test_standard_chain_mapping() {
        assert_eq!(
            standard_chain_to_caip("solana:devnet").unwrap().reference(),
            networks::SOLANA_DEVNET_REF
        );
        assert!(standard_chain_to_caip("nonsense").is_none());
    }

    #[tokio::test]
    async fn test_connect_reads_wallet_standard_accounts() {
        let provider = Arc::new(FakeProvider::new());
        provider.respond(
            "standard:connect",
            json!({"accounts": [{"address": PUBKEY, "chains": ["solana:mainnet"]}]}),
        );
        let adapter = adapter_with(&provider).await;

        let result = adapter
            .connect("phantom", &ConnectParams::default())
            .await
            .unwrap();
        assert_eq!(result.address, PUBKEY);
        assert_eq!(
            result.chain_id.unwrap().reference(),
            networks::SOLANA_MAINNET_REF
        );
    }

    #[tokio::test]
    async fn test_connect_rejected() {
        let provider = Arc::new(FakeProvider::new());
        provider.fail("standard:connect", ProviderError::user_rejected());
        let adapter = adapter_with(&provider).await;

        let err = adapter
            .connect("phantom", &ConnectParams::default())
            .await
            .unwrap_err();
        assert!(err.is_user_rejection());
    }

    #[test]
    fn test_change_event_splits() {
        let event = ProviderEvent::new(
            "change",
            json!({"accounts": [{"address": PUBKEY}], "chains": ["solana:devnet"]}),
        );
        let events = normalize_event("phantom", &event);
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], AdapterEvent::AccountsChanged { accounts, .. } if accounts.len() == 1));
        assert!(matches!(&events[1], AdapterEvent::ChainChanged { .. }));
    }
}
