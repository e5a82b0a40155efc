//! MultiConnect facade
//!
//! Wires the connector, chain and connection controllers to a set of
//! namespace adapters and an optional WalletConnect transport, and runs one
//! listener task per event source for as long as the client lives.

use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::adapter::{AdapterEvent, ChainAdapter};
use crate::caip::{CaipAddress, CaipNetwork, Namespace};
use crate::config::ConnectConfig;
use crate::connector::{ids, Connector, ConnectorKind};
use crate::controllers::{ChainController, ConnectionController, ConnectorController, DisconnectParams};
use crate::error::ConnectError;
use crate::storage::{MemoryStorage, PersistedState, Storage};
use crate::types::{Connection, ConnectionStatus};
use crate::walletconnect::{SessionEvent, WalletConnectTransport};

/// Builder for [`MultiConnect`]
#[derive(Default)]
pub struct MultiConnectBuilder {
    config: ConnectConfig,
    storage: Option<Arc<dyn Storage>>,
    adapters: Vec<Arc<dyn ChainAdapter>>,
    networks: Vec<CaipNetwork>,
    transport: Option<Arc<dyn WalletConnectTransport>>,
}

impl MultiConnectBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: ConnectConfig) -> Self {
        self.config = config;
        self
    }

    /// Defaults to an in-memory store
    pub fn storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn adapter(mut self, adapter: Arc<dyn ChainAdapter>) -> Self {
        self.adapters.push(adapter);
        self
    }

    /// Networks the dApp requests, first one is the default
    pub fn networks(mut self, networks: Vec<CaipNetwork>) -> Self {
        self.networks = networks;
        self
    }

    pub fn transport(mut self, transport: Arc<dyn WalletConnectTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub async fn build(self) -> Result<MultiConnect, ConnectError> {
        if self.networks.is_empty() {
            return Err(ConnectError::Config(
                "at least one network is required".to_string(),
            ));
        }
        let mut namespaces: Vec<Namespace> = Vec::new();
        for adapter in &self.adapters {
            if namespaces.contains(adapter.namespace()) {
                return Err(ConnectError::Config(format!(
                    "more than one adapter for {}",
                    adapter.namespace()
                )));
            }
            namespaces.push(adapter.namespace().clone());
        }

        let storage = self
            .storage
            .unwrap_or_else(|| Arc::new(MemoryStorage::new()));
        let persisted = PersistedState::new(storage, self.config.max_recent_connections);

        let connectors = Arc::new(ConnectorController::new(persisted.clone()));
        let chains = Arc::new(ChainController::new(
            self.config.clone(),
            persisted.clone(),
            connectors.clone(),
        ));
        chains.initialize(self.adapters.clone(), self.networks);

        let client_connectors = connectors.clone();
        let connection = Arc::new(ConnectionController::new(
            self.config,
            persisted,
            chains.clone(),
            connectors,
            self.transport.clone(),
        ));

        let mut client = MultiConnect {
            connectors: client_connectors,
            chains,
            connection,
            has_transport: self.transport.is_some(),
            listeners: Vec::new(),
        };
        client.rediscover().await;
        client
            .connectors
            .filter_by_namespaces(&client.chains.namespaces());

        for adapter in &self.adapters {
            let handle = spawn_adapter_listener(
                adapter.namespace().clone(),
                adapter.subscribe(),
                client.connection.clone(),
            );
            client.listeners.push(handle);
        }
        if let Some(transport) = &self.transport {
            let handle = spawn_session_listener(transport.subscribe(), client.connection.clone());
            client.listeners.push(handle);
        }

        info!(
            "MultiConnect ready: {} namespace(s), {} connector(s)",
            client.chains.namespaces().len(),
            client.connectors.state().all_connectors.len()
        );
        Ok(client)
    }
}

fn spawn_adapter_listener(
    namespace: Namespace,
    mut rx: broadcast::Receiver<AdapterEvent>,
    connection: Arc<ConnectionController>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => connection.handle_adapter_event(&namespace, event),
                Err(RecvError::Lagged(missed)) => {
                    warn!("{} adapter events lagged, {} dropped", namespace, missed);
                }
                Err(RecvError::Closed) => {
                    debug!("{} adapter event stream closed", namespace);
                    break;
                }
            }
        }
    })
}

fn spawn_session_listener(
    mut rx: broadcast::Receiver<SessionEvent>,
    connection: Arc<ConnectionController>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => connection.handle_session_event(event),
                Err(RecvError::Lagged(missed)) => {
                    warn!("WalletConnect session events lagged, {} dropped", missed);
                }
                Err(RecvError::Closed) => {
                    debug!("WalletConnect session event stream closed");
                    break;
                }
            }
        }
    })
}

/// Multi-namespace wallet connection client
pub struct MultiConnect {
    connectors: Arc<ConnectorController>,
    chains: Arc<ChainController>,
    connection: Arc<ConnectionController>,
    has_transport: bool,
    listeners: Vec<JoinHandle<()>>,
}

impl MultiConnect {
    pub fn builder() -> MultiConnectBuilder {
        MultiConnectBuilder::new()
    }

    pub fn connectors(&self) -> &Arc<ConnectorController> {
        &self.connectors
    }

    pub fn chains(&self) -> &Arc<ChainController> {
        &self.chains
    }

    pub fn connection(&self) -> &Arc<ConnectionController> {
        &self.connection
    }

    /// Ask every adapter for its connectors again. Returns how many were new.
    pub async fn rediscover(&self) -> usize {
        let before = self.connectors.state().all_connectors.len();
        for adapter in self.chains.adapters() {
            let discovered = adapter.discover_connectors().await;
            debug!("{} adapter offers {} connector(s)", adapter.namespace(), discovered.len());
            self.connectors.set_connectors(discovered);
            if self.has_transport {
                self.connectors.add_connector(Connector::new(
                    ids::WALLET_CONNECT,
                    "WalletConnect",
                    adapter.namespace().clone(),
                    ConnectorKind::WalletConnect,
                ));
            }
        }
        self.connectors.state().all_connectors.len() - before
    }

    /// Restore the previous session, re-verifying every stored connection
    pub async fn rehydrate(&self) -> usize {
        self.connection.rehydrate().await
    }

    pub async fn connect_external(
        &self,
        connector_id: &str,
        namespace: &Namespace,
    ) -> Result<Connection, ConnectError> {
        self.connection
            .connect_external(connector_id, namespace)
            .await
    }

    pub async fn connect_walletconnect(&self) -> Result<Vec<Connection>, ConnectError> {
        self.connection.connect_walletconnect().await
    }

    pub fn cancel_walletconnect(&self) -> bool {
        self.connection.cancel_walletconnect()
    }

    pub async fn switch_account(
        &self,
        connection: &Connection,
        address: &str,
        namespace: &Namespace,
    ) -> Result<(), ConnectError> {
        self.connection
            .switch_account(connection, address, namespace)
            .await
    }

    pub async fn disconnect(&self, params: DisconnectParams) -> Result<(), ConnectError> {
        self.connection.disconnect(params).await
    }

    pub async fn switch_network(&self, network: CaipNetwork) -> Result<(), ConnectError> {
        self.chains.switch_active_network(network).await
    }

    pub fn get_connections(&self, namespace: &Namespace) -> Vec<Connection> {
        self.connection.get_connections(namespace)
    }

    pub fn get_active_connection(&self, namespace: &Namespace) -> Option<Connection> {
        self.connection.get_active_connection(namespace)
    }

    pub fn status(&self, namespace: &Namespace) -> ConnectionStatus {
        self.connection.status(namespace)
    }

    pub fn active_caip_network(&self) -> Option<CaipNetwork> {
        self.chains.active_caip_network()
    }

    pub fn active_caip_address(&self) -> Option<CaipAddress> {
        self.chains.active_caip_address()
    }

    pub async fn sign_message(
        &self,
        namespace: &Namespace,
        message: &str,
    ) -> Result<String, ConnectError> {
        self.connection.sign_message(namespace, message).await
    }

    pub async fn send_transaction(
        &self,
        namespace: &Namespace,
        request: Value,
    ) -> Result<String, ConnectError> {
        self.connection.send_transaction(namespace, request).await
    }
}

impl std::fmt::Debug for MultiConnect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiConnect")
            .field("namespaces", &self.chains.namespaces())
            .field("walletconnect", &self.has_transport)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl Drop for MultiConnect {
    fn drop(&mut self) {
        for handle in self.listeners.drain(..) {
            handle.abort();
        }
    }
}
