//! EVM adapter (EIP-1193 providers)
//!
//! Speaks `eth_requestAccounts`, `eth_accounts`, `eth_chainId`,
//! `wallet_switchEthereumChain`, `personal_sign` and `eth_sendTransaction`,
//! and maps `accountsChanged` / `chainChanged` / `disconnect`.

use async_trait::async_trait;
use ethers_core::types::Address;
use ethers_core::utils::to_checksum;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::{
    AdapterEvent, ChainAdapter, ConnectParams, ConnectResult, ProviderEvent, ProviderHandle,
    ProviderRegistry,
};
use crate::caip::{CaipNetwork, CaipNetworkId, Namespace};
use crate::connector::{Connector, ConnectorKind};
use crate::error::ConnectError;
use crate::types::Account;

/// EIP-6963 provider info
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Eip6963ProviderInfo {
    pub uuid: String,
    pub name: String,
    pub icon: String,
    pub rdns: String,
}

pub struct EvmAdapter {
    namespace: Namespace,
    registry: ProviderRegistry,
}

impl EvmAdapter {
    pub fn new() -> Self {
        Self {
            namespace: Namespace::eip155(),
            registry: ProviderRegistry::new(Namespace::eip155(), normalize_event),
        }
    }

    /// Register an injected or embedded provider
    pub async fn register_provider(&self, connector: Connector) -> bool {
        self.registry.register(connector).await
    }

    /// Handle an `eip6963:announceProvider` event
    pub async fn announce(&self, info: Eip6963ProviderInfo, provider: ProviderHandle) -> bool {
        let connector = Connector::new(
            &info.rdns,
            &info.name,
            Namespace::eip155(),
            ConnectorKind::Announced,
        )
        .with_icon(&info.icon)
        .with_rdns(&info.rdns)
        .with_provider(provider);
        self.registry.register(connector).await
    }

    async fn chain_id(&self, provider: &ProviderHandle, connector_id: &str) -> Option<u64> {
        match provider.request("eth_chainId", json!([])).await {
            Ok(value) => parse_chain_id(&value),
            Err(e) => {
                warn!("eth_chainId failed for {}: {}", connector_id, e);
                None
            }
        }
    }
}

impl Default for EvmAdapter {
    fn default() -> Self {
        Self::new()
    }
}

/// Normalize to an EIP-55 checksummed address
pub fn checksum_address(address: &str) -> Result<String, ConnectError> {
    let parsed: Address = address
        .parse()
        .map_err(|_| ConnectError::InvalidCaip(format!("eip155 address {}", address)))?;
    Ok(to_checksum(&parsed, None))
}

/// `0x89`, `"137"` or `137`
pub fn parse_chain_id(value: &Value) -> Option<u64> {
    match value {
        Value::String(s) => match s.strip_prefix("0x") {
            Some(hex) => u64::from_str_radix(hex, 16).ok(),
            None => s.parse().ok(),
        },
        Value::Number(n) => n.as_u64(),
        _ => None,
    }
}

fn caip_network_id(chain_id: u64) -> Option<CaipNetworkId> {
    CaipNetworkId::new(Namespace::eip155(), chain_id.to_string()).ok()
}

fn parse_accounts(value: &Value) -> Vec<Account> {
    let Some(list) = value.as_array() else {
        return Vec::new();
    };
    list.iter()
        .filter_map(Value::as_str)
        .filter_map(|raw| match checksum_address(raw) {
            Ok(address) => Some(Account::new(&address)),
            Err(_) => {
                warn!("Dropping malformed EVM address {}", raw);
                None
            }
        })
        .collect()
}

fn normalize_event(connector_id: &str, event: &ProviderEvent) -> Vec<AdapterEvent> {
    let connector_id = connector_id.to_string();
    match event.name.as_str() {
        "accountsChanged" => vec![AdapterEvent::AccountsChanged {
            connector_id,
            accounts: parse_accounts(&event.data),
        }],
        "chainChanged" => parse_chain_id(&event.data)
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

#[async_trait]
impl ChainAdapter for EvmAdapter {
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
            .request("eth_requestAccounts", json!([]))
            .await
            .map_err(|e| e.into_connect_error(connector_id))?;
        let accounts = parse_accounts(&raw);
        let address = accounts
            .first()
            .map(|a| a.address.clone())
            .ok_or_else(|| ConnectError::ProviderUnavailable {
                connector_id: connector_id.to_string(),
            })?;

        let mut chain_id = self.chain_id(&provider, connector_id).await;
        if let Some(network) = params.network.as_ref().filter(|n| n.namespace() == &self.namespace) {
            let wanted: Option<u64> = network.id.parse().ok();
            if wanted.is_some() && wanted != chain_id {
                match self.switch_network(connector_id, network).await {
                    Ok(()) => chain_id = wanted,
                    Err(e) => warn!(
                        "{} connected but stayed off {}: {}",
                        connector_id, network.caip_network_id, e
                    ),
                }
            }
        }

        self.registry.listen(connector_id, &provider);
        info!("EVM connector {} connected as {}", connector_id, address);

        Ok(ConnectResult {
            address,
            accounts,
            chain_id: chain_id.and_then(caip_network_id),
        })
    }

    async fn get_accounts(&self, connector_id: &str) -> Result<Vec<Account>, ConnectError> {
        let provider = self.registry.provider(connector_id).await?;
        let raw = provider
            .request("eth_accounts", json!([]))
            .await
            .map_err(|e| e.into_connect_error(connector_id))?;
        let accounts = parse_accounts(&raw);

        // Rehydrated sessions need their event forwarder back
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

        let params = json!([{ "eth_accounts": {} }]);
        if let Err(e) = provider.request("wallet_revokePermissions", params).await {
            debug!("{} did not revoke permissions: {}", connector_id, e);
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
        let chain_id: u64 = network
            .id
            .parse()
            .map_err(|_| ConnectError::InvalidCaip(network.caip_network_id.to_string()))?;

        let provider = self.registry.provider(connector_id).await?;
        let params = json!([{ "chainId": format!("0x{:x}", chain_id) }]);
        provider
            .request("wallet_switchEthereumChain", params)
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
        let payload = format!("0x{}", hex::encode(message.as_bytes()));
        let signature = provider
            .request("personal_sign", json!([payload, address]))
            .await
            .map_err(|e| e.into_connect_error(connector_id))?;

        signature
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ConnectError::Provider {
                code: -32603,
                message: "personal_sign returned a non-string signature".to_string(),
            })
    }

    async fn send_transaction(
        &self,
        connector_id: &str,
        request: Value,
    ) -> Result<String, ConnectError> {
        let provider = self.registry.provider(connector_id).await?;
        let hash = provider
            .request("eth_sendTransaction", json!([request]))
            .await
            .map_err(|e| e.into_connect_error(connector_id))?;

        hash.as_str()
            .map(str::to_string)
            .ok_or_else(|| ConnectError::Provider {
                code: -32603,
                message: "eth_sendTransaction returned a non-string hash".to_string(),
            })
    }

    fn subscribe(&self) -> broadcast::Receiver<AdapterEvent> {
        self.registry.subscribe()
    }
}
