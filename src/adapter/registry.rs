//! Per-namespace provider registry
//!
//! Holds the connectors an adapter has discovered, resolves provider handles
//! and runs one forwarding task per connected provider that turns native
//! events into canonical [`AdapterEvent`]s.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{AdapterEvent, ProviderEvent, ProviderHandle};
use crate::caip::Namespace;
use crate::connector::Connector;
use crate::error::ConnectError;

/// Maps one native provider event to zero or more canonical events
pub type EventNormalizer = fn(&str, &ProviderEvent) -> Vec<AdapterEvent>;

const EVENT_CAPACITY: usize = 64;

pub struct ProviderRegistry {
    namespace: Namespace,
    connectors: RwLock<Vec<Connector>>,
    events: broadcast::Sender<AdapterEvent>,
    listeners: Mutex<HashMap<String, JoinHandle<()>>>,
    normalize: EventNormalizer,
}

impl ProviderRegistry {
    pub fn new(namespace: Namespace, normalize: EventNormalizer) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            namespace,
            connectors: RwLock::new(Vec::new()),
            events,
            listeners: Mutex::new(HashMap::new()),
            normalize,
        }
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Add a connector, or replace the one with the same id (re-announcement).
    /// Returns `true` when the connector is new.
    pub async fn register(&self, connector: Connector) -> bool {
        if connector.namespace() != &self.namespace {
            warn!(
                "Ignoring {} connector {} in {} registry",
                connector.namespace(),
                connector.id,
                self.namespace
            );
            return false;
        }

        let mut connectors = self.connectors.write().await;
        if let Some(existing) = connectors.iter_mut().find(|c| c.id == connector.id) {
            let replaced = match (&existing.provider, &connector.provider) {
                (Some(old), Some(new)) => !old.same_as(new),
                (None, Some(_)) => true,
                _ => false,
            };
            debug!("Re-announced {} connector {}", self.namespace, connector.id);
            let id = connector.id.clone();
            let provider = connector.provider.clone();
            *existing = connector;

            if replaced && self.is_listening(&id) {
                if let Some(provider) = provider {
                    self.listen(&id, &provider);
                }
            }
            return false;
        }

        info!("Registered {} connector {}", self.namespace, connector.id);
        connectors.push(connector);
        true
    }

    pub async fn connectors(&self) -> Vec<Connector> {
        self.connectors.read().await.clone()
    }

    pub async fn connector(&self, connector_id: &str) -> Option<Connector> {
        self.connectors
            .read()
            .await
            .iter()
            .find(|c| c.id == connector_id)
            .cloned()
    }

    /// Provider for `connector_id`, or the matching taxonomy error
    pub async fn provider(&self, connector_id: &str) -> Result<ProviderHandle, ConnectError> {
        let connectors = self.connectors.read().await;
        let connector = connectors
            .iter()
            .find(|c| c.id == connector_id)
            .ok_or_else(|| ConnectError::ConnectorNotFound {
                connector_id: connector_id.to_string(),
                namespace: self.namespace.clone(),
            })?;

        connector
            .provider
            .clone()
            .ok_or_else(|| ConnectError::ProviderUnavailable {
                connector_id: connector_id.to_string(),
            })
    }

    // ========================================================================
    // Events
    // ========================================================================

    pub fn subscribe(&self) -> broadcast::Receiver<AdapterEvent> {
        self.events.subscribe()
    }

    pub fn emit(&self, event: AdapterEvent) {
        // No receivers is fine: nobody is listening yet
        let _ = self.events.send(event);
    }

    /// Forward `provider`'s native events, replacing any previous forwarder
    /// for the connector
    pub fn listen(&self, connector_id: &str, provider: &ProviderHandle) {
        let mut rx = provider.events();
        let tx = self.events.clone();
        let normalize = self.normalize;
        let id = connector_id.to_string();

        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        debug!("Provider event from {}: {}", id, event.name);
                        for canonical in normalize(&id, &event) {
                            let _ = tx.send(canonical);
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!("Provider {} lagged, {} events dropped", id, missed);
                    }
                    Err(RecvError::Closed) => {
                        debug!("Provider {} event stream closed", id);
                        break;
                    }
                }
            }
        });

        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = listeners.insert(connector_id.to_string(), handle) {
            previous.abort();
        }
    }

    pub fn is_listening(&self, connector_id: &str) -> bool {
        let listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        listeners
            .get(connector_id)
            .is_some_and(|handle| !handle.is_finished())
    }

    pub fn unlisten(&self, connector_id: &str) {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = listeners.remove(connector_id) {
            handle.abort();
        }
    }
}

impl Drop for ProviderRegistry {
    fn drop(&mut self) {
        let listeners = self.listeners.get_mut().unwrap_or_else(PoisonError::into_inner);
        for (_, handle) in listeners.drain() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::ConnectorKind;
    use crate::testing::FakeProvider;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn passthrough(connector_id: &str, event: &ProviderEvent) -> Vec<AdapterEvent> {
        match event.name.as_str() {
            "disconnect" => vec![AdapterEvent::Disconnect {
                connector_id: connector_id.to_string(),
            }],
            _ => Vec::new(),
        }
    }

    fn connector(provider: &Arc<FakeProvider>) -> Connector {
        Connector::new(
            "io.metamask",
            "MetaMask",
            Namespace::eip155(),
            ConnectorKind::Announced,
        )
        .with_provider(ProviderHandle::from(provider.clone()))
    }

    #[tokio::test]
    async fn test_reannounce_replaces_without_duplicating() {
        let registry = ProviderRegistry::new(Namespace::eip155(), passthrough);
        let first = Arc::new(FakeProvider::new());
        let second = Arc::new(FakeProvider::new());

        assert!(registry.register(connector(&first)).await);
        assert!(!registry.register(connector(&second)).await);

        let connectors = registry.connectors().await;
        assert_eq!(connectors.len(), 1);
        let handle = registry.provider("io.metamask").await.unwrap();
        assert!(handle.same_as(&ProviderHandle::from(second)));
    }

    #[tokio::test]
    async fn test_rejects_foreign_namespace() {
        let registry = ProviderRegistry::new(Namespace::solana(), passthrough);
        let provider = Arc::new(FakeProvider::new());
        assert!(!registry.register(connector(&provider)).await);
        assert!(registry.connectors().await.is_empty());
    }

    #[tokio::test]
    async fn test_provider_lookup_errors() {
        let registry = ProviderRegistry::new(Namespace::eip155(), passthrough);
        registry
            .register(Connector::new(
                "bare",
                "Bare",
                Namespace::eip155(),
                ConnectorKind::Injected,
            ))
            .await;

        assert!(matches!(
            registry.provider("missing").await,
            Err(ConnectError::ConnectorNotFound { .. })
        ));
        assert!(matches!(
            registry.provider("bare").await,
            Err(ConnectError::ProviderUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_listen_forwards_normalized_events() {
        let registry = ProviderRegistry::new(Namespace::eip155(), passthrough);
        let provider = Arc::new(FakeProvider::new());
        let handle = ProviderHandle::from(provider.clone());
        let mut events = registry.subscribe();

        registry.listen("io.metamask", &handle);
        provider.emit("somethingElse", json!(null));
        provider.emit("disconnect", json!({"code": 4900}));

        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            AdapterEvent::Disconnect {
                connector_id: "io.metamask".to_string()
            }
        );

        registry.unlisten("io.metamask");
        assert!(!registry.is_listening("io.metamask"));
    }
}
