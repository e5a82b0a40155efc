//! Scripted test doubles for providers, adapters and the WalletConnect relay

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, Notify};

use crate::adapter::{
    AdapterEvent, ChainAdapter, ConnectParams, ConnectResult, ProviderError, ProviderEvent,
    WalletProvider,
};
use crate::caip::{CaipNetwork, CaipNetworkId, Namespace};
use crate::connector::{Connector, ConnectorKind};
use crate::error::ConnectError;
use crate::types::Account;
use crate::walletconnect::{
    PairingUri, PendingPairing, ProposalNamespaces, Session, SessionEvent, SessionNamespace,
    WalletConnectTransport,
};

fn locked<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Provider
// ============================================================================

/// Wallet provider answering from a script. Unscripted methods fail with 4200.
pub struct FakeProvider {
    responses: Mutex<HashMap<String, Result<Value, ProviderError>>>,
    calls: Mutex<Vec<(String, Value)>>,
    events: broadcast::Sender<ProviderEvent>,
}

impl FakeProvider {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            responses: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            events,
        }
    }

    pub fn respond(&self, method: &str, value: Value) {
        locked(&self.responses).insert(method.to_string(), Ok(value));
    }

    pub fn fail(&self, method: &str, error: ProviderError) {
        locked(&self.responses).insert(method.to_string(), Err(error));
    }

    pub fn emit(&self, name: &str, data: Value) {
        let _ = self.events.send(ProviderEvent::new(name, data));
    }

    pub fn calls(&self) -> Vec<(String, Value)> {
        locked(&self.calls).clone()
    }
}

#[async_trait]
impl WalletProvider for FakeProvider {
    async fn request(&self, method: &str, params: Value) -> Result<Value, ProviderError> {
        locked(&self.calls).push((method.to_string(), params));
        locked(&self.responses)
            .get(method)
            .cloned()
            .unwrap_or_else(|| Err(ProviderError::unsupported_method(method)))
    }

    fn events(&self) -> broadcast::Receiver<ProviderEvent> {
        self.events.subscribe()
    }
}

// ============================================================================
// Adapter
// ============================================================================

/// Chain adapter with a connect spy and scriptable outcomes
pub struct FakeAdapter {
    namespace: Namespace,
    connectors: Mutex<Vec<Connector>>,
    accounts: Mutex<HashMap<String, Result<Vec<Account>, ConnectError>>>,
    connect_errors: Mutex<HashMap<String, ConnectError>>,
    switch_errors: Mutex<HashMap<CaipNetworkId, ConnectError>>,
    chain_ids: Mutex<HashMap<String, CaipNetworkId>>,
    connect_calls: Mutex<Vec<String>>,
    disconnect_calls: Mutex<Vec<String>>,
    switch_calls: Mutex<Vec<CaipNetworkId>>,
    gate: Mutex<Option<Arc<Notify>>>,
    /// Notified each time `connect` or `switch_network` is entered
    pub entered: Arc<Notify>,
    events: broadcast::Sender<AdapterEvent>,
}

impl FakeAdapter {
    pub fn new(namespace: Namespace) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            namespace,
            connectors: Mutex::new(Vec::new()),
            accounts: Mutex::new(HashMap::new()),
            connect_errors: Mutex::new(HashMap::new()),
            switch_errors: Mutex::new(HashMap::new()),
            chain_ids: Mutex::new(HashMap::new()),
            connect_calls: Mutex::new(Vec::new()),
            disconnect_calls: Mutex::new(Vec::new()),
            switch_calls: Mutex::new(Vec::new()),
            gate: Mutex::new(None),
            entered: Arc::new(Notify::new()),
            events,
        }
    }

    /// Register a wallet exposing `addresses`
    pub fn with_wallet(self, connector_id: &str, name: &str, addresses: &[&str]) -> Self {
        let connector = Connector::new(
            connector_id,
            name,
            self.namespace.clone(),
            ConnectorKind::Announced,
        );
        locked(&self.connectors).push(connector);
        self.set_accounts(connector_id, addresses);
        self
    }

    pub fn with_connector(self, connector: Connector) -> Self {
        locked(&self.connectors).push(connector);
        self
    }

    pub fn set_accounts(&self, connector_id: &str, addresses: &[&str]) {
        let accounts = addresses.iter().map(|a| Account::new(a)).collect();
        locked(&self.accounts).insert(connector_id.to_string(), Ok(accounts));
    }

    pub fn fail_accounts(&self, connector_id: &str, error: ConnectError) {
        locked(&self.accounts).insert(connector_id.to_string(), Err(error));
    }

    pub fn fail_connect(&self, connector_id: &str, error: ConnectError) {
        locked(&self.connect_errors).insert(connector_id.to_string(), error);
    }

    pub fn fail_switch(&self, network: &CaipNetworkId, error: ConnectError) {
        locked(&self.switch_errors).insert(network.clone(), error);
    }

    /// Chain the wallet reports after connecting
    pub fn set_chain(&self, connector_id: &str, chain: CaipNetworkId) {
        locked(&self.chain_ids).insert(connector_id.to_string(), chain);
    }

    /// Hold every `connect` and `switch_network` until the returned gate is
    /// notified
    pub fn hold(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *locked(&self.gate) = Some(gate.clone());
        gate
    }

    pub fn connect_count(&self, connector_id: &str) -> usize {
        locked(&self.connect_calls)
            .iter()
            .filter(|id| *id == connector_id)
            .count()
    }

    pub fn disconnect_calls(&self) -> Vec<String> {
        locked(&self.disconnect_calls).clone()
    }

    pub fn switch_calls(&self) -> Vec<CaipNetworkId> {
        locked(&self.switch_calls).clone()
    }

    pub fn emit(&self, event: AdapterEvent) {
        let _ = self.events.send(event);
    }

    async fn wait_at_gate(&self) {
        self.entered.notify_one();
        let gate = locked(&self.gate).clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
    }

    fn known(&self, connector_id: &str) -> Result<(), ConnectError> {
        if locked(&self.connectors).iter().any(|c| c.id == connector_id) {
            Ok(())
        } else {
            Err(ConnectError::ConnectorNotFound {
                connector_id: connector_id.to_string(),
                namespace: self.namespace.clone(),
            })
        }
    }
}

#[async_trait]
impl ChainAdapter for FakeAdapter {
    fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    async fn discover_connectors(&self) -> Vec<Connector> {
        locked(&self.connectors).clone()
    }

    async fn connect(
        &self,
        connector_id: &str,
        params: &ConnectParams,
    ) -> Result<ConnectResult, ConnectError> {
        locked(&self.connect_calls).push(connector_id.to_string());
        self.wait_at_gate().await;

        self.known(connector_id)?;
        if let Some(error) = locked(&self.connect_errors).get(connector_id).cloned() {
            return Err(error);
        }
        let accounts = locked(&self.accounts)
            .get(connector_id)
            .cloned()
            .unwrap_or_else(|| Ok(Vec::new()))?;
        let address = accounts
            .first()
            .map(|a| a.address.clone())
            .ok_or_else(|| ConnectError::ProviderUnavailable {
                connector_id: connector_id.to_string(),
            })?;
        let chain_id = locked(&self.chain_ids)
            .get(connector_id)
            .cloned()
            .or_else(|| params.network.as_ref().map(|n| n.caip_network_id.clone()));

        Ok(ConnectResult {
            address,
            accounts,
            chain_id,
        })
    }

    async fn get_accounts(&self, connector_id: &str) -> Result<Vec<Account>, ConnectError> {
        self.known(connector_id)?;
        locked(&self.accounts)
            .get(connector_id)
            .cloned()
            .unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn disconnect(&self, connector_id: &str) -> Result<(), ConnectError> {
        locked(&self.disconnect_calls).push(connector_id.to_string());
        Ok(())
    }

    async fn switch_network(
        &self,
        connector_id: &str,
        network: &CaipNetwork,
    ) -> Result<(), ConnectError> {
        self.known(connector_id)?;
        locked(&self.switch_calls).push(network.caip_network_id.clone());
        self.wait_at_gate().await;
        match locked(&self.switch_errors).get(&network.caip_network_id) {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    async fn sign_message(
        &self,
        connector_id: &str,
        address: &str,
        message: &str,
    ) -> Result<String, ConnectError> {
        self.known(connector_id)?;
        Ok(format!("{}:{}:{}", connector_id, address, message))
    }

    async fn send_transaction(
        &self,
        connector_id: &str,
        _request: Value,
    ) -> Result<String, ConnectError> {
        self.known(connector_id)?;
        Ok(format!("tx-{}", connector_id))
    }

    fn subscribe(&self) -> broadcast::Receiver<AdapterEvent> {
        self.events.subscribe()
    }
}

// ============================================================================
// WalletConnect
// ============================================================================

/// Relay stand-in: proposals wait until the test approves or rejects them
pub struct FakeTransport {
    pending: Mutex<Option<oneshot::Sender<Result<Session, ConnectError>>>>,
    proposals: Mutex<Vec<ProposalNamespaces>>,
    revoked: Mutex<Vec<String>>,
    closed: Mutex<Vec<String>>,
    requests: Mutex<Vec<(String, String, Value)>>,
    session: Mutex<Option<Session>>,
    /// Notified when a proposal is published
    pub proposed: Arc<Notify>,
    events: broadcast::Sender<SessionEvent>,
}

impl FakeTransport {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            pending: Mutex::new(None),
            proposals: Mutex::new(Vec::new()),
            revoked: Mutex::new(Vec::new()),
            closed: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
            session: Mutex::new(None),
            proposed: Arc::new(Notify::new()),
            events,
        }
    }

    /// Approve the pending proposal
    pub fn approve(&self, session: Session) {
        *locked(&self.session) = Some(session.clone());
        if let Some(tx) = locked(&self.pending).take() {
            let _ = tx.send(Ok(session));
        }
    }

    pub fn reject(&self, error: ConnectError) {
        if let Some(tx) = locked(&self.pending).take() {
            let _ = tx.send(Err(error));
        }
    }

    /// Pretend a session survived from a previous run
    pub fn restore_session(&self, session: Session) {
        *locked(&self.session) = Some(session);
    }

    pub fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    pub fn proposals(&self) -> Vec<ProposalNamespaces> {
        locked(&self.proposals).clone()
    }

    pub fn revoked(&self) -> Vec<String> {
        locked(&self.revoked).clone()
    }

    pub fn closed(&self) -> Vec<String> {
        locked(&self.closed).clone()
    }

    pub fn requests(&self) -> Vec<(String, String, Value)> {
        locked(&self.requests).clone()
    }
}

#[async_trait]
impl WalletConnectTransport for FakeTransport {
    async fn connect(
        &self,
        optional_namespaces: &ProposalNamespaces,
    ) -> Result<PendingPairing, ConnectError> {
        let (tx, approval) = oneshot::channel();
        *locked(&self.pending) = Some(tx);
        locked(&self.proposals).push(optional_namespaces.clone());
        self.proposed.notify_one();
        Ok(PendingPairing {
            uri: PairingUri::generate(Duration::from_secs(240)),
            approval,
        })
    }

    async fn revoke_pairing(&self, topic: &str) -> Result<(), ConnectError> {
        locked(&self.pending).take();
        locked(&self.revoked).push(topic.to_string());
        Ok(())
    }

    async fn active_session(&self) -> Option<Session> {
        locked(&self.session).clone()
    }

    async fn disconnect_session(&self, topic: &str) -> Result<(), ConnectError> {
        locked(&self.session).take();
        locked(&self.closed).push(topic.to_string());
        Ok(())
    }

    async fn request(
        &self,
        topic: &str,
        chain_id: &CaipNetworkId,
        method: &str,
        params: Value,
    ) -> Result<Value, ConnectError> {
        locked(&self.requests).push((chain_id.to_string(), method.to_string(), params));
        Ok(json!(format!("{}:{}", topic, method)))
    }

    fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }
}

/// Session granting `accounts` (CAIP-10) grouped by namespace
pub fn session(topic: &str, accounts: &[&str]) -> Session {
    let mut namespaces = std::collections::BTreeMap::new();
    for account in accounts {
        let ns = account.split(':').next().unwrap_or_default().to_string();
        let entry = namespaces
            .entry(ns)
            .or_insert_with(|| SessionNamespace {
                accounts: Vec::new(),
                chains: None,
                methods: Vec::new(),
                events: Vec::new(),
            });
        entry.accounts.push(account.to_string());
    }
    Session {
        topic: topic.to_string(),
        namespaces,
        peer: None,
        expiry: 0,
    }
}
