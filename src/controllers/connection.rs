//! Connection Controller
//!
//! The three mutating entry points (external connect, WalletConnect pairing
//! and disconnect / account switching) plus everything wallets report back
//! on their own: account and chain changes, disconnects, session deletion.

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{ChainController, ConnectorController, Epochs, NamespaceGuards};
use crate::adapter::{AdapterEvent, ChainAdapter, ConnectParams};
use crate::caip::Namespace;
use crate::config::ConnectConfig;
use crate::connector::ids;
use crate::error::ConnectError;
use crate::storage::PersistedState;
use crate::store::{Store, Subscription};
use crate::types::{Account, Connection, ConnectionStatus};
use crate::walletconnect::{
    chains_from_session, connections_from_session, create_namespaces, PendingPairing, Session,
    SessionEvent, WalletConnectTransport,
};

/// Pairing and session bookkeeping
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WalletConnectState {
    /// URI to render as QR code or deep link
    pub uri: Option<String>,
    pub pairing_topic: Option<String>,
    pub pairing_expiry: Option<DateTime<Utc>>,
    /// The last pairing ended without an approved session
    pub error: bool,
    pub session_topic: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionState {
    /// Most recently used first
    pub connections: BTreeMap<Namespace, Vec<Connection>>,
    /// A connected namespace is moving to another wallet
    pub switching_connection: bool,
    pub wc: WalletConnectState,
}

/// Scope of a disconnect: one connector, one namespace, or everything
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DisconnectParams {
    pub id: Option<String>,
    pub namespace: Option<Namespace>,
}

impl DisconnectParams {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn namespace(namespace: Namespace) -> Self {
        Self {
            id: None,
            namespace: Some(namespace),
        }
    }

    pub fn connector(connector_id: &str, namespace: Namespace) -> Self {
        Self {
            id: Some(connector_id.to_string()),
            namespace: Some(namespace),
        }
    }
}

/// Clears the WalletConnect in-flight flag however the pairing ends
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct ConnectionController {
    store: Store<ConnectionState>,
    chains: Arc<ChainController>,
    connectors: Arc<ConnectorController>,
    config: ConnectConfig,
    persisted: PersistedState,
    transport: Option<Arc<dyn WalletConnectTransport>>,
    guards: Arc<NamespaceGuards>,
    epochs: Epochs,
    wc_in_flight: AtomicBool,
    wc_cancel: Mutex<Option<oneshot::Sender<()>>>,
}

impl ConnectionController {
    pub fn new(
        config: ConnectConfig,
        persisted: PersistedState,
        chains: Arc<ChainController>,
        connectors: Arc<ConnectorController>,
        transport: Option<Arc<dyn WalletConnectTransport>>,
    ) -> Self {
        Self {
            store: Store::default(),
            guards: chains.guards(),
            chains,
            connectors,
            config,
            persisted,
            transport,
            epochs: Epochs::default(),
            wc_in_flight: AtomicBool::new(false),
            wc_cancel: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.store.get_state()
    }

    pub fn store(&self) -> &Store<ConnectionState> {
        &self.store
    }

    pub fn chains(&self) -> &Arc<ChainController> {
        &self.chains
    }

    pub fn connectors(&self) -> &Arc<ConnectorController> {
        &self.connectors
    }

    fn adapter(&self, namespace: &Namespace) -> Result<Arc<dyn ChainAdapter>, ConnectError> {
        self.chains
            .adapter(namespace)
            .ok_or_else(|| ConnectError::AdapterNotFound(namespace.clone()))
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn get_connections(&self, namespace: &Namespace) -> Vec<Connection> {
        self.store
            .read(|s| s.connections.get(namespace).cloned().unwrap_or_default())
    }

    /// Replace the namespace's connection list. Drops the active selection if
    /// the new list no longer contains it.
    pub fn set_connections(&self, namespace: &Namespace, connections: Vec<Connection>) {
        let orphaned = self
            .connectors
            .get_active_connector_id(namespace)
            .is_some_and(|id| !connections.iter().any(|c| c.is_connector(&id)));
        if orphaned {
            self.connectors.remove_active_connector_id(namespace);
            self.chains.reset_account(namespace);
        }
        self.store.set_state(|s| {
            s.connections.insert(namespace.clone(), connections);
        });
    }

    pub fn get_active_connection(&self, namespace: &Namespace) -> Option<Connection> {
        let active = self.connectors.get_active_connector_id(namespace)?;
        self.get_connections(namespace)
            .into_iter()
            .find(|c| c.is_connector(&active))
    }

    pub fn status(&self, namespace: &Namespace) -> ConnectionStatus {
        self.chains.account_status(namespace)
    }

    pub fn wc_state(&self) -> WalletConnectState {
        self.store.read(|s| s.wc.clone())
    }

    pub fn subscribe_connections<C>(&self, namespace: &Namespace, callback: C) -> Subscription
    where
        C: FnMut(Vec<Connection>) + Send + 'static,
    {
        let namespace = namespace.clone();
        self.store.subscribe(
            move |s| s.connections.get(&namespace).cloned().unwrap_or_default(),
            callback,
        )
    }

    // ========================================================================
    // External connectors
    // ========================================================================

    /// Connect through the namespace adapter and make the connector active.
    /// A failure leaves any previous session of the namespace untouched.
    pub async fn connect_external(
        &self,
        connector_id: &str,
        namespace: &Namespace,
    ) -> Result<Connection, ConnectError> {
        let _guard = self.guards.acquire(namespace).await?;
        self.connect_external_locked(connector_id, namespace).await
    }

    async fn connect_external_locked(
        &self,
        connector_id: &str,
        namespace: &Namespace,
    ) -> Result<Connection, ConnectError> {
        let adapter = self.adapter(namespace)?;
        let connector = self
            .connectors
            .get_connector_by_id(connector_id, Some(namespace))
            .ok_or_else(|| ConnectError::ConnectorNotFound {
                connector_id: connector_id.to_string(),
                namespace: namespace.clone(),
            })?;
        let connector_id = connector.id.as_str();

        let epoch = self.epochs.get(namespace);
        let switching = self.chains.account_status(namespace) == ConnectionStatus::Connected;
        if switching {
            self.store.set_state(|s| s.switching_connection = true);
        } else {
            self.chains
                .set_account_status(namespace, ConnectionStatus::Connecting);
        }
        info!("Connecting {} in {}", connector_id, namespace);

        let params = ConnectParams {
            network: self.chains.caip_network(namespace),
        };
        let outcome = adapter.connect(connector_id, &params).await;
        let superseded = self.epochs.get(namespace) != epoch;

        let result = match outcome {
            Ok(result) if !superseded => result,
            Ok(_) => {
                warn!("Connect of {} in {} superseded by a wallet event", connector_id, namespace);
                self.abandon_connect(namespace, switching);
                return Err(ConnectError::Superseded(namespace.clone()));
            }
            Err(e) => {
                warn!("Connect of {} in {} failed: {}", connector_id, namespace, e);
                self.abandon_connect(namespace, switching);
                return Err(e);
            }
        };

        let mut accounts = result.accounts;
        if !accounts.iter().any(|a| a.matches(&result.address)) {
            accounts.insert(0, Account::new(&result.address));
        }
        let mut connection = Connection::new(connector_id, accounts);
        if let Some(chain_id) = result.chain_id {
            connection = connection.with_network(chain_id);
        }

        self.apply_connection(namespace, connection.clone(), &result.address, true);
        info!("Connected {} in {} as {}", connector_id, namespace, result.address);
        Ok(connection)
    }

    /// Undo the transient state of a connect that did not land
    fn abandon_connect(&self, namespace: &Namespace, switching: bool) {
        if switching {
            self.store.set_state(|s| s.switching_connection = false);
        } else if self.chains.account_status(namespace) == ConnectionStatus::Connecting {
            self.chains
                .set_account_status(namespace, ConnectionStatus::Disconnected);
        }
    }

    /// Upsert `connection` at the front of the list and select it
    fn apply_connection(
        &self,
        namespace: &Namespace,
        connection: Connection,
        address: &str,
        activate: bool,
    ) {
        let connector_id = connection.connector_id.clone();
        let network = connection.caip_network_id.clone();
        let cap = self.config.max_connections_per_namespace.max(1);

        self.store.set_state(|s| {
            let list = s.connections.entry(namespace.clone()).or_default();
            list.retain(|c| !c.is_connector(&connector_id));
            list.insert(0, connection);
            for evicted in list.drain(cap.min(list.len())..) {
                debug!("Evicting {} from {}", evicted.connector_id, namespace);
            }
            s.switching_connection = false;
        });

        self.connectors
            .set_active_connector_id(namespace, &connector_id);
        self.chains.set_account_address(namespace, Some(address));
        self.chains
            .set_account_status(namespace, ConnectionStatus::Connected);
        if activate {
            self.chains.set_active_namespace(namespace);
        }
        if let Some(chain_id) = network {
            self.chains.apply_wallet_network(namespace, &chain_id);
        }
        self.persisted
            .add_recent_connection(namespace, &connector_id, Some(address));
    }

    /// Select `address` of `connection`, reconnecting only when the wallet is
    /// not reachable yet
    pub async fn switch_account(
        &self,
        connection: &Connection,
        address: &str,
        namespace: &Namespace,
    ) -> Result<(), ConnectError> {
        let _guard = self.guards.acquire(namespace).await?;
        let target = connection.connector_id.as_str();
        let existing = self
            .get_connections(namespace)
            .into_iter()
            .find(|c| c.is_connector(target));

        let active = self.connectors.get_active_connector_id(namespace);
        if active.is_some_and(|id| id.eq_ignore_ascii_case(target)) {
            ensure_exposed(existing.as_ref().unwrap_or(connection), address)?;
            debug!("Selecting {} on {} in {}", address, target, namespace);
            self.chains.set_account_address(namespace, Some(address));
            self.persisted
                .add_recent_connection(namespace, target, Some(address));
            return Ok(());
        }

        if let Some(existing) = existing {
            ensure_exposed(&existing, address)?;
            info!("Promoting {} to active in {}", target, namespace);
            self.apply_connection(namespace, existing, address, true);
            return Ok(());
        }

        let connected = self.connect_external_locked(target, namespace).await?;
        if connected.has_address(address) {
            self.chains.set_account_address(namespace, Some(address));
            self.persisted
                .add_recent_connection(namespace, target, Some(address));
        } else {
            warn!(
                "{} did not expose {} in {}, keeping its first account",
                target, address, namespace
            );
        }
        Ok(())
    }

    // ========================================================================
    // Disconnect
    // ========================================================================

    /// Disconnect one connector, one namespace or everything. Never promotes
    /// another connection to active.
    pub async fn disconnect(&self, params: DisconnectParams) -> Result<(), ConnectError> {
        if let Some(namespace) = &params.namespace {
            if !self.chains.has_namespace(namespace) {
                return Err(ConnectError::AdapterNotFound(namespace.clone()));
            }
        }

        let mut namespaces: Vec<Namespace> = match (&params.namespace, &params.id) {
            (Some(namespace), _) => vec![namespace.clone()],
            (None, Some(id)) => self.namespaces_using(id),
            (None, None) => {
                let mut all = self.chains.namespaces();
                all.extend(self.store.read(|s| s.connections.keys().cloned().collect::<Vec<_>>()));
                all
            }
        };
        namespaces.sort();
        namespaces.dedup();

        // In-flight connects on these namespaces lose
        for namespace in &namespaces {
            self.epochs.bump(namespace);
        }
        let mut guards = Vec::with_capacity(namespaces.len());
        for namespace in &namespaces {
            guards.push(self.guards.wait(namespace).await);
        }

        for namespace in &namespaces {
            match &params.id {
                Some(id) => self.disconnect_connector(namespace, id).await,
                None => self.disconnect_namespace(namespace).await,
            }
        }
        drop(guards);

        self.close_session_if_unused().await;
        Ok(())
    }

    async fn disconnect_connector(&self, namespace: &Namespace, connector_id: &str) {
        let was_active = self.is_active(namespace, connector_id);
        let known = self
            .get_connections(namespace)
            .iter()
            .any(|c| c.is_connector(connector_id));
        if !known && !was_active {
            debug!("{} is not connected in {}", connector_id, namespace);
            return;
        }

        self.disconnect_adapter(namespace, connector_id).await;
        if was_active {
            self.connectors.remove_active_connector_id(namespace);
        }
        self.store.set_state(|s| {
            if let Some(list) = s.connections.get_mut(namespace) {
                list.retain(|c| !c.is_connector(connector_id));
            }
        });
        if was_active {
            self.chains.reset_account(namespace);
        }
        info!("Disconnected {} from {}", connector_id, namespace);
    }

    async fn disconnect_namespace(&self, namespace: &Namespace) {
        let mut connector_ids: Vec<String> = self
            .get_connections(namespace)
            .into_iter()
            .map(|c| c.connector_id)
            .collect();
        if let Some(active) = self.connectors.get_active_connector_id(namespace) {
            if !connector_ids.iter().any(|id| id.eq_ignore_ascii_case(&active)) {
                connector_ids.push(active);
            }
        }

        for connector_id in &connector_ids {
            self.disconnect_adapter(namespace, connector_id).await;
        }
        self.connectors.remove_active_connector_id(namespace);
        self.store.set_state(|s| {
            s.connections.remove(namespace);
        });
        self.chains.reset_account(namespace);
        if !connector_ids.is_empty() {
            info!("Disconnected {} connector(s) from {}", connector_ids.len(), namespace);
        }
    }

    async fn disconnect_adapter(&self, namespace: &Namespace, connector_id: &str) {
        // WalletConnect sessions span namespaces and close once unused
        if connector_id == ids::WALLET_CONNECT {
            return;
        }
        let Some(adapter) = self.chains.adapter(namespace) else {
            return;
        };
        if let Err(e) = adapter.disconnect(connector_id).await {
            warn!("Adapter disconnect of {} in {} failed: {}", connector_id, namespace, e);
        }
    }

    async fn close_session_if_unused(&self) {
        let Some(transport) = &self.transport else {
            return;
        };
        let (topic, in_use) = self.store.read(|s| {
            (
                s.wc.session_topic.clone(),
                s.connections
                    .values()
                    .flatten()
                    .any(|c| c.is_connector(ids::WALLET_CONNECT)),
            )
        });
        let Some(topic) = topic else {
            return;
        };
        if in_use {
            return;
        }

        if let Err(e) = transport.disconnect_session(&topic).await {
            warn!("Failed to close WalletConnect session {}: {}", topic, e);
        }
        self.store.set_state(|s| s.wc.session_topic = None);
        info!("Closed WalletConnect session {}", topic);
    }

    fn is_active(&self, namespace: &Namespace, connector_id: &str) -> bool {
        self.connectors
            .get_active_connector_id(namespace)
            .is_some_and(|id| id.eq_ignore_ascii_case(connector_id))
    }

    fn namespaces_using(&self, connector_id: &str) -> Vec<Namespace> {
        let mut namespaces: Vec<Namespace> = self.store.read(|s| {
            s.connections
                .iter()
                .filter(|(_, list)| list.iter().any(|c| c.is_connector(connector_id)))
                .map(|(ns, _)| ns.clone())
                .collect()
        });
        for namespace in self.chains.namespaces() {
            if self.is_active(&namespace, connector_id) && !namespaces.contains(&namespace) {
                namespaces.push(namespace);
            }
        }
        namespaces
    }

    /// Drop a connection the wallet ended. Supersedes in-flight operations.
    fn remove_connection(&self, namespace: &Namespace, connector_id: &str) {
        self.epochs.bump(namespace);
        let was_active = self.is_active(namespace, connector_id);
        if was_active {
            self.connectors.remove_active_connector_id(namespace);
        }
        self.store.set_state(|s| {
            if let Some(list) = s.connections.get_mut(namespace) {
                list.retain(|c| !c.is_connector(connector_id));
            }
        });
        if was_active {
            self.chains.reset_account(namespace);
        }
    }

    // ========================================================================
    // Provider events
    // ========================================================================

    pub fn handle_adapter_event(&self, namespace: &Namespace, event: AdapterEvent) {
        let connector_id = event.connector_id().to_string();
        let terminal = match &event {
            AdapterEvent::AccountsChanged { accounts, .. } => accounts.is_empty(),
            AdapterEvent::Disconnect { .. } => true,
            AdapterEvent::ChainChanged { .. } => false,
        };

        if terminal {
            info!("{} ended its session in {}", connector_id, namespace);
            self.remove_connection(namespace, &connector_id);
            return;
        }

        let is_active = self.is_active(namespace, &connector_id);
        let known = self
            .get_connections(namespace)
            .iter()
            .any(|c| c.is_connector(&connector_id));
        if !is_active && !known {
            debug!("Ignoring event from unconnected {} in {}", connector_id, namespace);
            return;
        }

        match event {
            AdapterEvent::AccountsChanged { accounts, .. } => {
                let Some(address) = accounts.first().map(|a| a.address.clone()) else {
                    return;
                };
                debug!("{} switched to {} in {}", connector_id, address, namespace);
                self.store.set_state(|s| {
                    let connection = s
                        .connections
                        .get_mut(namespace)
                        .and_then(|list| list.iter_mut().find(|c| c.is_connector(&connector_id)));
                    if let Some(connection) = connection {
                        connection.accounts = accounts;
                    }
                });
                if is_active {
                    self.chains.set_account_address(namespace, Some(&address));
                    self.persisted
                        .add_recent_connection(namespace, &connector_id, Some(&address));
                }
            }
            AdapterEvent::ChainChanged {
                caip_network_id, ..
            } => {
                self.store.set_state(|s| {
                    let connection = s
                        .connections
                        .get_mut(namespace)
                        .and_then(|list| list.iter_mut().find(|c| c.is_connector(&connector_id)));
                    if let Some(connection) = connection {
                        connection.caip_network_id = Some(caip_network_id.clone());
                    }
                });
                if is_active {
                    self.chains.handle_chain_changed(namespace, &caip_network_id);
                }
            }
            AdapterEvent::Disconnect { .. } => {}
        }
    }

    // ========================================================================
    // WalletConnect
    // ========================================================================

    /// Publish a proposal for every requested network and wait for the wallet.
    /// Only namespaces the session actually grants get a connection.
    pub async fn connect_walletconnect(&self) -> Result<Vec<Connection>, ConnectError> {
        let transport = self.transport.clone().ok_or_else(|| {
            ConnectError::Transport("no WalletConnect transport configured".to_string())
        })?;
        if self.wc_in_flight.swap(true, Ordering::SeqCst) {
            return Err(ConnectError::OperationInProgress(
                ids::WALLET_CONNECT.to_string(),
            ));
        }
        let _in_flight = InFlight(&self.wc_in_flight);

        let networks = self.chains.get_all_requested_caip_networks();
        let proposal = create_namespaces(&networks, self.config.namespace_overrides.as_ref());
        let requested: Vec<Namespace> = proposal.keys().map(|k| Namespace::new(k.as_str())).collect();

        let PendingPairing { uri, approval } = match transport.connect(&proposal).await {
            Ok(pending) => pending,
            Err(e) => {
                warn!("WalletConnect proposal failed: {}", e);
                self.store.set_state(|s| s.wc.error = true);
                return Err(e);
            }
        };

        let expiry = self.config.pairing_expiry();
        let (cancel_tx, cancel_rx) = oneshot::channel();
        *self.wc_cancel.lock().unwrap_or_else(PoisonError::into_inner) = Some(cancel_tx);
        let expires_at = chrono::Duration::from_std(expiry)
            .ok()
            .map(|ttl| Utc::now() + ttl);
        self.store.set_state(|s| {
            s.wc.uri = Some(uri.to_string());
            s.wc.pairing_topic = Some(uri.topic.clone());
            s.wc.pairing_expiry = expires_at;
            s.wc.error = false;
        });
        info!(
            "Pairing {} issued for {} namespace(s), expires in {}s",
            uri.topic,
            requested.len(),
            expiry.as_secs()
        );

        let started = Instant::now();
        let outcome = tokio::select! {
            approved = approval => approved.unwrap_or_else(|_| {
                Err(ConnectError::Transport("pairing approval channel closed".to_string()))
            }),
            _ = tokio::time::sleep(expiry) => Err(ConnectError::PairingExpired {
                elapsed: started.elapsed(),
                namespaces: requested.clone(),
            }),
            _ = cancel_rx => Err(ConnectError::PairingCancelled),
        };
        self.wc_cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        match outcome {
            Ok(session) => {
                self.store.set_state(|s| {
                    s.wc.uri = None;
                    s.wc.pairing_topic = None;
                    s.wc.pairing_expiry = None;
                    s.wc.error = false;
                });
                // Queue behind operations already running on the granted
                // namespaces, in the same order disconnect locks them
                let granted: Vec<Namespace> = connections_from_session(&session)
                    .into_keys()
                    .filter(|ns| self.chains.has_namespace(ns))
                    .collect();
                let mut guards = Vec::with_capacity(granted.len());
                for namespace in &granted {
                    guards.push(self.guards.wait(namespace).await);
                }
                let connections = self.apply_session(&session);
                drop(guards);
                info!(
                    "WalletConnect session {} approved for {} namespace(s)",
                    session.topic,
                    connections.len()
                );
                Ok(connections)
            }
            Err(e) => {
                if let Err(revoke) = transport.revoke_pairing(&uri.topic).await {
                    debug!("Failed to revoke pairing {}: {}", uri.topic, revoke);
                }
                if e == ConnectError::PairingCancelled {
                    info!("Pairing {} cancelled", uri.topic);
                    self.reset_wc_connection();
                } else {
                    warn!("Pairing {} failed: {}", uri.topic, e);
                    self.store.set_state(|s| {
                        s.wc.uri = None;
                        s.wc.pairing_expiry = None;
                        s.wc.error = true;
                    });
                }
                Err(e)
            }
        }
    }

    /// The user closed the connect view. Returns whether a pairing was pending.
    pub fn cancel_walletconnect(&self) -> bool {
        let sender = self
            .wc_cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match sender {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }

    /// Forget pairing state, keeping any live session
    pub fn reset_wc_connection(&self) {
        self.store.set_state(|s| {
            s.wc = WalletConnectState {
                session_topic: s.wc.session_topic.take(),
                ..WalletConnectState::default()
            };
        });
    }

    fn apply_session(&self, session: &Session) -> Vec<Connection> {
        let granted = connections_from_session(session);
        let approved = chains_from_session(&session.namespaces);
        let preferred = self
            .chains
            .active_namespace()
            .filter(|ns| granted.contains_key(ns))
            .or_else(|| granted.keys().next().cloned());

        let mut applied = Vec::new();
        for (namespace, connection) in granted {
            if !self.chains.has_namespace(&namespace) {
                warn!("Session granted unrequested namespace {}", namespace);
                continue;
            }
            let Some(address) = connection.primary_address().map(str::to_string) else {
                continue;
            };
            let approved_ids = approved
                .iter()
                .filter(|id| id.namespace() == &namespace)
                .cloned()
                .collect();
            self.chains
                .set_approved_caip_networks(&namespace, approved_ids, false);
            let activate = preferred.as_ref() == Some(&namespace);
            self.apply_connection(&namespace, connection.clone(), &address, activate);
            applied.push(connection);
        }

        self.store
            .set_state(|s| s.wc.session_topic = Some(session.topic.clone()));
        applied
    }

    pub fn handle_session_event(&self, event: SessionEvent) {
        let current = self.store.read(|s| s.wc.session_topic.clone());
        match event {
            SessionEvent::Deleted { topic } => {
                if current.as_deref() != Some(topic.as_str()) {
                    debug!("Ignoring deletion of unknown session {}", topic);
                    return;
                }
                info!("WalletConnect session {} ended by the wallet", topic);
                for namespace in self.namespaces_using(ids::WALLET_CONNECT) {
                    self.remove_connection(&namespace, ids::WALLET_CONNECT);
                }
                self.store.set_state(|s| s.wc.session_topic = None);
            }
            SessionEvent::Updated { topic, namespaces } => {
                if current.as_deref() != Some(topic.as_str()) {
                    debug!("Ignoring update of unknown session {}", topic);
                    return;
                }
                let session = Session {
                    topic,
                    namespaces,
                    peer: None,
                    expiry: 0,
                };
                let granted = connections_from_session(&session);
                let approved = chains_from_session(&session.namespaces);

                for namespace in self.namespaces_using(ids::WALLET_CONNECT) {
                    let Some(connection) = granted.get(&namespace) else {
                        info!("Session {} no longer grants {}", session.topic, namespace);
                        self.remove_connection(&namespace, ids::WALLET_CONNECT);
                        continue;
                    };
                    let approved_ids = approved
                        .iter()
                        .filter(|id| id.namespace() == &namespace)
                        .cloned()
                        .collect();
                    self.chains
                        .set_approved_caip_networks(&namespace, approved_ids, false);
                    self.handle_adapter_event(
                        &namespace,
                        AdapterEvent::AccountsChanged {
                            connector_id: ids::WALLET_CONNECT.to_string(),
                            accounts: connection.accounts.clone(),
                        },
                    );
                }
            }
        }
    }

    // ========================================================================
    // Rehydration
    // ========================================================================

    /// Re-verify every stored connection with its wallet. Returns how many
    /// namespaces came back connected.
    pub async fn rehydrate(&self) -> usize {
        let namespaces = self.chains.namespaces();
        let restored = join_all(namespaces.iter().map(|ns| self.rehydrate_namespace(ns))).await;
        let count = restored.into_iter().filter(|ok| *ok).count();
        info!("Rehydrated {} of {} namespace(s)", count, namespaces.len());
        count
    }

    async fn rehydrate_namespace(&self, namespace: &Namespace) -> bool {
        let Some(connector_id) = self.connectors.stored_connector_id(namespace) else {
            return false;
        };
        let _guard = match self.guards.acquire(namespace).await {
            Ok(guard) => guard,
            Err(e) => {
                warn!("Skipping rehydration of {}: {}", namespace, e);
                return false;
            }
        };
        let epoch = self.epochs.get(namespace);
        self.chains
            .set_account_status(namespace, ConnectionStatus::Connecting);
        debug!("Re-verifying {} in {}", connector_id, namespace);

        let verified = if connector_id == ids::WALLET_CONNECT {
            self.session_connection(namespace).await
        } else {
            self.verify_external(namespace, &connector_id).await
        };

        match verified {
            Ok(Some(connection)) if self.epochs.get(namespace) == epoch => {
                let Some(address) = connection.primary_address().map(str::to_string) else {
                    self.forget(namespace);
                    return false;
                };
                info!("Restored {} in {} as {}", connector_id, namespace, address);
                self.apply_connection(namespace, connection, &address, false);
                true
            }
            Ok(Some(_)) => {
                warn!("Rehydration of {} superseded by a wallet event", namespace);
                self.forget(namespace);
                false
            }
            Ok(None) => {
                info!("{} no longer authorized in {}", connector_id, namespace);
                self.forget(namespace);
                false
            }
            Err(e) => {
                warn!("Could not re-verify {} in {}: {}", connector_id, namespace, e);
                self.forget(namespace);
                false
            }
        }
    }

    async fn verify_external(
        &self,
        namespace: &Namespace,
        connector_id: &str,
    ) -> Result<Option<Connection>, ConnectError> {
        let accounts = self.adapter(namespace)?.get_accounts(connector_id).await?;
        if accounts.is_empty() {
            return Ok(None);
        }
        let mut connection = Connection::new(connector_id, accounts);
        if let Some(network) = self.chains.caip_network(namespace) {
            connection = connection.with_network(network.caip_network_id);
        }
        Ok(Some(connection))
    }

    async fn session_connection(
        &self,
        namespace: &Namespace,
    ) -> Result<Option<Connection>, ConnectError> {
        let transport = self.transport.as_ref().ok_or_else(|| {
            ConnectError::Transport("no WalletConnect transport configured".to_string())
        })?;
        let Some(session) = transport.active_session().await else {
            return Ok(None);
        };
        let Some(mut connection) = connections_from_session(&session).remove(namespace) else {
            return Ok(None);
        };

        let approved: Vec<_> = chains_from_session(&session.namespaces)
            .into_iter()
            .filter(|id| id.namespace() == namespace)
            .collect();
        // Stay on the stored network when the session still grants it
        if let Some(current) = self.chains.caip_network(namespace) {
            if approved.contains(&current.caip_network_id) {
                connection.caip_network_id = Some(current.caip_network_id);
            }
        }
        self.chains
            .set_approved_caip_networks(namespace, approved, false);
        self.store
            .set_state(|s| s.wc.session_topic = Some(session.topic.clone()));
        Ok(Some(connection))
    }

    fn forget(&self, namespace: &Namespace) {
        self.connectors.remove_active_connector_id(namespace);
        self.store.set_state(|s| {
            s.connections.remove(namespace);
        });
        self.chains.reset_account(namespace);
    }

    // ========================================================================
    // Signing
    // ========================================================================

    fn active_account(&self, namespace: &Namespace) -> Result<(String, String), ConnectError> {
        let connector_id = self
            .connectors
            .get_active_connector_id(namespace)
            .ok_or_else(|| ConnectError::NotConnected(namespace.clone()))?;
        let address = self
            .chains
            .account_address(namespace)
            .ok_or_else(|| ConnectError::NotConnected(namespace.clone()))?;
        Ok((connector_id, address))
    }

    pub async fn sign_message(
        &self,
        namespace: &Namespace,
        message: &str,
    ) -> Result<String, ConnectError> {
        let (connector_id, address) = self.active_account(namespace)?;
        debug!("Signing with {} in {}", connector_id, namespace);

        if connector_id != ids::WALLET_CONNECT {
            return self
                .adapter(namespace)?
                .sign_message(&connector_id, &address, message)
                .await;
        }

        let (method, params) = match namespace.as_str() {
            Namespace::EIP155 => (
                "personal_sign",
                json!([format!("0x{}", hex::encode(message)), address]),
            ),
            Namespace::SOLANA => (
                "solana_signMessage",
                json!({
                    "message": bs58::encode(message.as_bytes()).into_string(),
                    "pubkey": address,
                }),
            ),
            _ => ("signMessage", json!({ "address": address, "message": message })),
        };
        let value = self.walletconnect_request(namespace, method, params).await?;
        string_result(value, method, &["signature"])
    }

    /// `request` is passed to the wallet as-is
    pub async fn send_transaction(
        &self,
        namespace: &Namespace,
        request: Value,
    ) -> Result<String, ConnectError> {
        let (connector_id, _) = self.active_account(namespace)?;
        debug!("Sending transaction with {} in {}", connector_id, namespace);

        if connector_id != ids::WALLET_CONNECT {
            return self
                .adapter(namespace)?
                .send_transaction(&connector_id, request)
                .await;
        }

        let (method, params) = match namespace.as_str() {
            Namespace::EIP155 => ("eth_sendTransaction", json!([request])),
            Namespace::SOLANA => (
                "solana_signAndSendTransaction",
                json!({ "transaction": request }),
            ),
            _ => ("sendTransfer", request),
        };
        let value = self.walletconnect_request(namespace, method, params).await?;
        string_result(value, method, &["signature", "txid", "hash"])
    }

    async fn walletconnect_request(
        &self,
        namespace: &Namespace,
        method: &str,
        params: Value,
    ) -> Result<Value, ConnectError> {
        let transport = self.transport.as_ref().ok_or_else(|| {
            ConnectError::Transport("no WalletConnect transport configured".to_string())
        })?;
        let topic = self
            .store
            .read(|s| s.wc.session_topic.clone())
            .ok_or_else(|| ConnectError::NotConnected(namespace.clone()))?;
        let chain_id = self
            .chains
            .caip_network(namespace)
            .map(|n| n.caip_network_id)
            .or_else(|| {
                self.get_active_connection(namespace)
                    .and_then(|c| c.caip_network_id)
            })
            .ok_or_else(|| ConnectError::NotConnected(namespace.clone()))?;

        debug!("WalletConnect {} on {}", method, chain_id);
        transport.request(&topic, &chain_id, method, params).await
    }
}

fn ensure_exposed(connection: &Connection, address: &str) -> Result<(), ConnectError> {
    if connection.has_address(address) {
        return Ok(());
    }
    Err(ConnectError::Provider {
        code: -32602,
        message: format!("{} does not expose {}", connection.connector_id, address),
    })
}

/// A bare string result, or the first of `keys` present in an object
fn string_result(value: Value, method: &str, keys: &[&str]) -> Result<String, ConnectError> {
    if let Some(s) = value.as_str() {
        return Ok(s.to_string());
    }
    keys.iter()
        .find_map(|key| value.get(*key).and_then(Value::as_str))
        .map(str::to_string)
        .ok_or_else(|| ConnectError::Provider {
            code: -32603,
            message: format!("{} returned no result", method),
        })
}
