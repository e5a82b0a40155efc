//! Chain Controller
//!
//! Tracks, per namespace, the requested and approved networks and the
//! selected account, plus the global "current chain" pointer the UI renders.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, warn};

use super::{ConnectorController, Epochs, NamespaceGuards};
use crate::adapter::ChainAdapter;
use crate::caip::{CaipAddress, CaipNetwork, CaipNetworkId, Namespace};
use crate::config::ConnectConfig;
use crate::connector::ids;
use crate::error::ConnectError;
use crate::storage::PersistedState;
use crate::store::{Store, Subscription};
use crate::types::ConnectionStatus;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NetworkState {
    /// Network the namespace is currently on
    pub caip_network: Option<CaipNetwork>,
    /// Networks the dApp asked for
    pub requested: Vec<CaipNetwork>,
    /// Networks the wallet granted (WalletConnect sessions)
    pub approved_ids: Vec<CaipNetworkId>,
    pub supports_all_networks: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AccountState {
    pub address: Option<String>,
    pub caip_address: Option<CaipAddress>,
    pub status: ConnectionStatus,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NamespaceState {
    pub network: NetworkState,
    pub account: AccountState,
}

impl NamespaceState {
    fn refresh_caip_address(&mut self) {
        self.account.caip_address = match (&self.network.caip_network, &self.account.address) {
            (Some(network), Some(address)) => {
                CaipAddress::new(network.caip_network_id.clone(), address.as_str()).ok()
            }
            _ => None,
        };
    }

    fn is_supported(&self, caip_network_id: &CaipNetworkId) -> bool {
        if self.network.supports_all_networks {
            return true;
        }
        if !self.network.approved_ids.is_empty() {
            return self.network.approved_ids.contains(caip_network_id);
        }
        self.network.requested.is_empty()
            || self
                .network
                .requested
                .iter()
                .any(|n| &n.caip_network_id == caip_network_id)
    }
}

/// What the network area of the UI should show
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChainView {
    #[default]
    Ready,
    /// Connected wallet is on a network the dApp cannot use
    UnsupportedChain,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChainState {
    pub active_namespace: Option<Namespace>,
    pub active_caip_network: Option<CaipNetwork>,
    pub active_caip_address: Option<CaipAddress>,
    pub chains: BTreeMap<Namespace, NamespaceState>,
    pub view: ChainView,
}

impl ChainState {
    /// Mirror the namespace's network and account into the active pointers
    fn sync_active(&mut self) {
        let Some(active) = &self.active_namespace else {
            return;
        };
        if let Some(entry) = self.chains.get(active) {
            self.active_caip_network = entry.network.caip_network.clone();
            self.active_caip_address = entry.account.caip_address.clone();
        }
    }
}

pub struct ChainController {
    store: Store<ChainState>,
    adapters: RwLock<BTreeMap<Namespace, Arc<dyn ChainAdapter>>>,
    connectors: Arc<ConnectorController>,
    config: ConnectConfig,
    persisted: PersistedState,
    guards: Arc<NamespaceGuards>,
    network_epochs: Epochs,
}

impl ChainController {
    pub fn new(
        config: ConnectConfig,
        persisted: PersistedState,
        connectors: Arc<ConnectorController>,
    ) -> Self {
        Self {
            store: Store::default(),
            adapters: RwLock::new(BTreeMap::new()),
            connectors,
            guards: Arc::new(NamespaceGuards::new(config.operation_policy)),
            config,
            persisted,
            network_epochs: Epochs::default(),
        }
    }

    /// Register adapters and requested networks, then restore the stored
    /// active network when it is still requested
    pub fn initialize(&self, adapters: Vec<Arc<dyn ChainAdapter>>, networks: Vec<CaipNetwork>) {
        {
            let mut registered = self.adapters.write().unwrap_or_else(PoisonError::into_inner);
            for adapter in &adapters {
                registered.insert(adapter.namespace().clone(), adapter.clone());
            }
        }

        let stored = self.persisted.get_active_caip_network_id();
        let stored_namespace = self.persisted.get_active_namespace();

        self.store.set_state(|s| {
            for adapter in &adapters {
                s.chains.entry(adapter.namespace().clone()).or_default();
            }
            for network in &networks {
                let entry = s.chains.entry(network.namespace().clone()).or_default();
                if !entry.network.requested.contains(network) {
                    entry.network.requested.push(network.clone());
                }
            }
            for entry in s.chains.values_mut() {
                entry.network.caip_network = entry.network.requested.first().cloned();
            }

            let restored = stored.as_ref().and_then(|id| {
                networks.iter().find(|n| &n.caip_network_id == id).cloned()
            });
            let active = restored
                .or_else(|| {
                    stored_namespace
                        .as_ref()
                        .and_then(|ns| networks.iter().find(|n| n.namespace() == ns).cloned())
                })
                .or_else(|| networks.first().cloned());

            if let Some(network) = active {
                if let Some(entry) = s.chains.get_mut(network.namespace()) {
                    entry.network.caip_network = Some(network.clone());
                }
                s.active_namespace = Some(network.namespace().clone());
                s.active_caip_network = Some(network);
            }
        });

        let state = self.store.get_state();
        info!(
            "Initialized {} namespaces, active network {}",
            state.chains.len(),
            state
                .active_caip_network
                .as_ref()
                .map(|n| n.caip_network_id.to_string())
                .unwrap_or_else(|| "none".to_string())
        );
    }

    pub fn state(&self) -> ChainState {
        self.store.get_state()
    }

    pub fn store(&self) -> &Store<ChainState> {
        &self.store
    }

    pub(crate) fn guards(&self) -> Arc<NamespaceGuards> {
        self.guards.clone()
    }

    pub fn adapter(&self, namespace: &Namespace) -> Option<Arc<dyn ChainAdapter>> {
        let adapters = self.adapters.read().unwrap_or_else(PoisonError::into_inner);
        adapters.get(namespace).cloned()
    }

    pub fn adapters(&self) -> Vec<Arc<dyn ChainAdapter>> {
        let adapters = self.adapters.read().unwrap_or_else(PoisonError::into_inner);
        adapters.values().cloned().collect()
    }

    pub fn namespaces(&self) -> Vec<Namespace> {
        self.store.read(|s| s.chains.keys().cloned().collect())
    }

    pub fn has_namespace(&self, namespace: &Namespace) -> bool {
        self.store.read(|s| s.chains.contains_key(namespace))
    }

    pub fn namespace_state(&self, namespace: &Namespace) -> Option<NamespaceState> {
        self.store.read(|s| s.chains.get(namespace).cloned())
    }

    // ========================================================================
    // Active pointers
    // ========================================================================

    pub fn active_namespace(&self) -> Option<Namespace> {
        self.store.read(|s| s.active_namespace.clone())
    }

    pub fn active_caip_network(&self) -> Option<CaipNetwork> {
        self.store.read(|s| s.active_caip_network.clone())
    }

    pub fn active_caip_address(&self) -> Option<CaipAddress> {
        self.store.read(|s| s.active_caip_address.clone())
    }

    pub fn view(&self) -> ChainView {
        self.store.read(|s| s.view)
    }

    /// Network the namespace is currently on
    pub fn caip_network(&self, namespace: &Namespace) -> Option<CaipNetwork> {
        self.store.read(|s| {
            s.chains
                .get(namespace)
                .and_then(|c| c.network.caip_network.clone())
        })
    }

    pub fn set_active_namespace(&self, namespace: &Namespace) {
        let changed = self.store.set_state_if(|s| {
            if !s.chains.contains_key(namespace) || s.active_namespace.as_ref() == Some(namespace) {
                return false;
            }
            s.active_namespace = Some(namespace.clone());
            s.sync_active();
            true
        });
        if changed {
            if let Some(network) = self.active_caip_network() {
                self.persisted
                    .set_active_caip_network_id(&network.caip_network_id);
            }
            debug!("Active namespace is now {}", namespace);
        }
    }

    /// Move the UI's current-chain pointer. A connected wallet on a network
    /// the dApp cannot use routes to the unsupported-chain view.
    pub fn set_active_caip_network(&self, network: CaipNetwork) {
        let namespace = network.namespace().clone();
        self.store.set_state(|s| {
            let entry = s.chains.entry(namespace.clone()).or_default();
            entry.network.caip_network = Some(network.clone());
            entry.refresh_caip_address();
            s.active_namespace = Some(namespace.clone());
            s.sync_active();
        });
        self.persisted
            .set_active_caip_network_id(&network.caip_network_id);
        info!("Active network set to {}", network.caip_network_id);
        self.check_view(&namespace, &network.caip_network_id);
    }

    /// Ask the active wallet to move to `network`
    pub async fn switch_active_network(&self, network: CaipNetwork) -> Result<(), ConnectError> {
        let namespace = network.namespace().clone();
        let adapter = self
            .adapter(&namespace)
            .ok_or_else(|| ConnectError::AdapterNotFound(namespace.clone()))?;
        let _guard = self.guards.acquire(&namespace).await?;

        let Some(connector_id) = self.connectors.get_active_connector_id(&namespace) else {
            self.set_active_caip_network(network);
            return Ok(());
        };

        if connector_id == ids::WALLET_CONNECT {
            // The session decides; only approved chains are reachable
            if !self.check_if_supported_network(&namespace, &network.caip_network_id) {
                self.show_unsupported_chain();
                return Err(ConnectError::UnsupportedNetwork(
                    network.caip_network_id.to_string(),
                ));
            }
            self.set_active_caip_network(network);
            return Ok(());
        }

        let epoch = self.network_epochs.get(&namespace);
        info!(
            "Switching {} to {} via {}",
            namespace, network.caip_network_id, connector_id
        );
        match adapter.switch_network(&connector_id, &network).await {
            Ok(()) => {
                if self.network_epochs.get(&namespace) != epoch {
                    warn!(
                        "Switch to {} superseded by a wallet chain change",
                        network.caip_network_id
                    );
                    return Err(ConnectError::Superseded(namespace));
                }
                self.set_active_caip_network(network);
                Ok(())
            }
            Err(e @ ConnectError::UnsupportedNetwork(_)) => {
                warn!("{} cannot reach {}: {}", connector_id, network.caip_network_id, e);
                self.show_unsupported_chain();
                Err(e)
            }
            Err(e) => {
                warn!("Network switch failed: {}", e);
                Err(e)
            }
        }
    }

    // ========================================================================
    // Requested / approved networks
    // ========================================================================

    /// Requested networks with the approved ones first
    pub fn get_requested_caip_networks(&self, namespace: &Namespace) -> Vec<CaipNetwork> {
        self.store.read(|s| {
            let Some(entry) = s.chains.get(namespace) else {
                return Vec::new();
            };
            let (mut approved, rest): (Vec<CaipNetwork>, Vec<CaipNetwork>) = entry
                .network
                .requested
                .iter()
                .cloned()
                .partition(|n| entry.network.approved_ids.contains(&n.caip_network_id));
            approved.extend(rest);
            approved
        })
    }

    pub fn get_all_requested_caip_networks(&self) -> Vec<CaipNetwork> {
        self.store.read(|s| {
            s.chains
                .values()
                .flat_map(|c| c.network.requested.iter().cloned())
                .collect()
        })
    }

    pub fn get_all_approved_caip_network_ids(&self) -> Vec<CaipNetworkId> {
        self.store.read(|s| {
            s.chains
                .values()
                .flat_map(|c| c.network.approved_ids.iter().cloned())
                .collect()
        })
    }

    pub fn set_approved_caip_networks(
        &self,
        namespace: &Namespace,
        approved_ids: Vec<CaipNetworkId>,
        supports_all_networks: bool,
    ) {
        self.store.set_state(|s| {
            let entry = s.chains.entry(namespace.clone()).or_default();
            entry.network.approved_ids = approved_ids;
            entry.network.supports_all_networks = supports_all_networks;
        });
    }

    pub fn check_if_supported_network(
        &self,
        namespace: &Namespace,
        caip_network_id: &CaipNetworkId,
    ) -> bool {
        self.store.read(|s| {
            s.chains
                .get(namespace)
                .map_or(false, |c| c.is_supported(caip_network_id))
        })
    }

    pub fn add_network(&self, network: CaipNetwork) {
        self.store.set_state(|s| {
            let entry = s.chains.entry(network.namespace().clone()).or_default();
            if !entry.network.requested.contains(&network) {
                entry.network.requested.push(network);
            }
        });
    }

    pub fn remove_network(&self, caip_network_id: &CaipNetworkId) {
        self.store.set_state(|s| {
            if let Some(entry) = s.chains.get_mut(caip_network_id.namespace()) {
                entry
                    .network
                    .requested
                    .retain(|n| &n.caip_network_id != caip_network_id);
            }
        });
    }

    /// Forget what the wallet approved
    pub fn reset_network(&self, namespace: &Namespace) {
        self.store.set_state(|s| {
            if let Some(entry) = s.chains.get_mut(namespace) {
                entry.network.approved_ids.clear();
                entry.network.supports_all_networks = false;
            }
            if s.active_namespace.as_ref() == Some(namespace) {
                s.view = ChainView::Ready;
            }
        });
    }

    pub fn dismiss_unsupported_chain(&self) {
        self.store.set_state(|s| s.view = ChainView::Ready);
    }

    fn show_unsupported_chain(&self) {
        self.store.set_state(|s| s.view = ChainView::UnsupportedChain);
    }

    fn check_view(&self, namespace: &Namespace, caip_network_id: &CaipNetworkId) {
        let flag = self.config.enable_network_switch && !self.config.allow_unsupported_chain;
        self.store.set_state_if(|s| {
            if s.active_namespace.as_ref() != Some(namespace) {
                return false;
            }
            let Some(entry) = s.chains.get(namespace) else {
                return false;
            };
            let connected = entry.account.status == ConnectionStatus::Connected;
            let next = if flag && connected && !entry.is_supported(caip_network_id) {
                ChainView::UnsupportedChain
            } else {
                ChainView::Ready
            };
            if next == s.view {
                return false;
            }
            if next == ChainView::UnsupportedChain {
                warn!("{} is not supported by this dApp", caip_network_id);
            }
            s.view = next;
            true
        });
    }

    // ========================================================================
    // Account
    // ========================================================================

    pub fn set_account_address(&self, namespace: &Namespace, address: Option<&str>) {
        self.store.set_state(|s| {
            let entry = s.chains.entry(namespace.clone()).or_default();
            entry.account.address = address.map(str::to_string);
            entry.refresh_caip_address();
            s.sync_active();
        });
    }

    pub fn account_address(&self, namespace: &Namespace) -> Option<String> {
        self.store
            .read(|s| s.chains.get(namespace).and_then(|c| c.account.address.clone()))
    }

    pub fn set_account_status(&self, namespace: &Namespace, status: ConnectionStatus) {
        self.store.set_state(|s| {
            s.chains.entry(namespace.clone()).or_default().account.status = status;
        });
    }

    pub fn account_status(&self, namespace: &Namespace) -> ConnectionStatus {
        self.store.read(|s| {
            s.chains
                .get(namespace)
                .map(|c| c.account.status)
                .unwrap_or_default()
        })
    }

    /// Back to disconnected: no address, nothing approved
    pub fn reset_account(&self, namespace: &Namespace) {
        self.store.set_state(|s| {
            if let Some(entry) = s.chains.get_mut(namespace) {
                entry.account = AccountState::default();
                entry.network.approved_ids.clear();
                entry.network.supports_all_networks = false;
            }
            if s.active_namespace.as_ref() == Some(namespace) {
                s.view = ChainView::Ready;
            }
            s.sync_active();
        });
    }

    pub fn subscribe_view<C>(&self, callback: C) -> Subscription
    where
        C: FnMut(ChainView) + Send + 'static,
    {
        self.store.subscribe(|s| s.view, callback)
    }

    // ========================================================================
    // Wallet-reported networks
    // ========================================================================

    /// The active wallet moved to another chain on its own. Supersedes any
    /// in-flight switch for the namespace.
    pub fn handle_chain_changed(&self, namespace: &Namespace, caip_network_id: &CaipNetworkId) {
        self.network_epochs.bump(namespace);
        info!("Wallet moved {} to {}", namespace, caip_network_id);
        self.apply_wallet_network(namespace, caip_network_id);
    }

    /// Record the chain a wallet reports, without superseding anything
    pub(crate) fn apply_wallet_network(
        &self,
        namespace: &Namespace,
        caip_network_id: &CaipNetworkId,
    ) {
        let network = self.resolve_network(namespace, caip_network_id);
        if self.active_namespace().as_ref() == Some(namespace) {
            self.set_active_caip_network(network);
            return;
        }
        self.store.set_state(|s| {
            let entry = s.chains.entry(namespace.clone()).or_default();
            entry.network.caip_network = Some(network);
            entry.refresh_caip_address();
        });
    }

    /// A requested network, or a bare one for chains the dApp never listed
    fn resolve_network(&self, namespace: &Namespace, caip_network_id: &CaipNetworkId) -> CaipNetwork {
        self.store
            .read(|s| {
                s.chains.get(namespace).and_then(|c| {
                    c.network
                        .requested
                        .iter()
                        .find(|n| &n.caip_network_id == caip_network_id)
                        .cloned()
                })
            })
            .unwrap_or_else(|| {
                CaipNetwork::new(caip_network_id.clone(), &caip_network_id.to_string())
            })
    }
}
