//! Connector Controller
//!
//! Owns the raw connector registry, the merged view derived from it and the
//! per-namespace active selection.

use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::caip::Namespace;
use crate::connector::{ids, merge_connectors, Connector, ConnectorKind, MergedConnector};
use crate::storage::PersistedState;
use crate::store::{Store, Subscription};

#[derive(Debug, Clone, Default)]
pub struct ConnectorState {
    /// Every connector ever registered, in registration order
    pub all_connectors: Vec<Connector>,
    /// Merged view over the enabled namespaces
    pub connectors: Vec<MergedConnector>,
    pub active_connector_ids: BTreeMap<Namespace, String>,
    /// Namespaces absent from the map are enabled
    pub filter_by_namespace_map: BTreeMap<Namespace, bool>,
}

impl ConnectorState {
    fn is_enabled(&self, namespace: &Namespace) -> bool {
        self.filter_by_namespace_map
            .get(namespace)
            .copied()
            .unwrap_or(true)
    }

    fn remerge(&mut self) {
        let enabled: Vec<Connector> = self
            .all_connectors
            .iter()
            .filter(|c| self.is_enabled(c.namespace()))
            .cloned()
            .collect();
        self.connectors = merge_connectors(&enabled);
    }
}

pub struct ConnectorController {
    store: Store<ConnectorState>,
    persisted: PersistedState,
}

impl ConnectorController {
    pub fn new(persisted: PersistedState) -> Self {
        Self {
            store: Store::default(),
            persisted,
        }
    }

    pub fn state(&self) -> ConnectorState {
        self.store.get_state()
    }

    pub fn store(&self) -> &Store<ConnectorState> {
        &self.store
    }

    // ========================================================================
    // Registry
    // ========================================================================

    /// Register a connector unless one with the same name is already known in
    /// its namespace. Returns whether it was added.
    pub fn add_connector(&self, connector: Connector) -> bool {
        let added = self.store.set_state_if(|s| {
            if s.all_connectors.iter().any(|c| c.same_identity(&connector)) {
                return false;
            }
            s.all_connectors.push(connector.clone());
            s.remerge();
            true
        });

        if added {
            info!(
                "Added {} connector {} ({})",
                connector.namespace(),
                connector.id,
                connector.kind
            );
        } else {
            debug!(
                "Connector {} already registered in {}",
                connector.name,
                connector.namespace()
            );
        }
        added
    }

    /// Register a batch with a single notification
    pub fn set_connectors(&self, connectors: Vec<Connector>) {
        self.store.set_state(|s| {
            for connector in connectors {
                if !s.all_connectors.iter().any(|c| c.same_identity(&connector)) {
                    s.all_connectors.push(connector);
                }
            }
            s.remerge();
        });
    }

    /// Recompute the merged view from the raw registry
    pub fn merge_connectors(&self) -> Vec<MergedConnector> {
        self.store.set_state(ConnectorState::remerge);
        self.get_connectors()
    }

    pub fn get_connectors(&self) -> Vec<MergedConnector> {
        self.store.read(|s| s.connectors.clone())
    }

    /// Enable exactly `namespaces`
    pub fn filter_by_namespaces(&self, namespaces: &[Namespace]) {
        self.store.set_state(|s| {
            let known: Vec<Namespace> = s
                .all_connectors
                .iter()
                .map(|c| c.namespace().clone())
                .chain(s.filter_by_namespace_map.keys().cloned())
                .collect();
            for namespace in known {
                let enabled = namespaces.contains(&namespace);
                s.filter_by_namespace_map.insert(namespace, enabled);
            }
            for namespace in namespaces {
                s.filter_by_namespace_map.insert(namespace.clone(), true);
            }
            s.remerge();
        });
    }

    pub fn filter_by_namespace(&self, namespace: &Namespace, enabled: bool) {
        self.store.set_state(|s| {
            s.filter_by_namespace_map.insert(namespace.clone(), enabled);
            s.remerge();
        });
    }

    // ========================================================================
    // Lookup
    // ========================================================================

    pub fn get_connectors_by_namespace(&self, namespace: &Namespace) -> Vec<Connector> {
        self.store.read(|s| {
            s.all_connectors
                .iter()
                .filter(|c| c.namespace() == namespace)
                .cloned()
                .collect()
        })
    }

    /// Ids are only unique inside a namespace; without one the first match wins
    pub fn get_connector_by_id(
        &self,
        connector_id: &str,
        namespace: Option<&Namespace>,
    ) -> Option<Connector> {
        self.store.read(|s| {
            s.all_connectors
                .iter()
                .find(|c| {
                    c.id.eq_ignore_ascii_case(connector_id)
                        && namespace.map_or(true, |ns| c.namespace() == ns)
                })
                .cloned()
        })
    }

    pub fn get_connector_by_rdns(&self, rdns: &str) -> Option<Connector> {
        self.store.read(|s| {
            s.all_connectors
                .iter()
                .find(|c| c.metadata.rdns.as_deref() == Some(rdns))
                .cloned()
        })
    }

    pub fn get_auth_connector(&self, namespace: Option<&Namespace>) -> Option<Connector> {
        self.store.read(|s| {
            s.all_connectors
                .iter()
                .find(|c| {
                    c.kind == ConnectorKind::Auth
                        && c.id == ids::AUTH
                        && namespace.map_or(true, |ns| c.namespace() == ns)
                })
                .cloned()
        })
    }

    /// rdns of every announced wallet, used to hide duplicates from wallet lists
    pub fn get_announced_rdns(&self) -> Vec<String> {
        self.store.read(|s| {
            let mut rdns: Vec<String> = s
                .all_connectors
                .iter()
                .filter(|c| c.kind == ConnectorKind::Announced)
                .filter_map(|c| c.metadata.rdns.clone())
                .collect();
            rdns.dedup();
            rdns
        })
    }

    // ========================================================================
    // Active selection
    // ========================================================================

    pub fn set_active_connector_id(&self, namespace: &Namespace, connector_id: &str) {
        self.store.set_state(|s| {
            s.active_connector_ids
                .insert(namespace.clone(), connector_id.to_string());
        });
        self.persisted
            .set_connected_connector_id(namespace, connector_id);
        debug!("Active connector for {} is {}", namespace, connector_id);
    }

    pub fn get_active_connector_id(&self, namespace: &Namespace) -> Option<String> {
        self.store
            .read(|s| s.active_connector_ids.get(namespace).cloned())
    }

    pub fn remove_active_connector_id(&self, namespace: &Namespace) {
        self.store.set_state(|s| {
            s.active_connector_ids.remove(namespace);
        });
        self.persisted.delete_connected_connector_id(namespace);
        debug!("Cleared active connector for {}", namespace);
    }

    pub fn reset_active_connector_ids(&self) {
        let namespaces: Vec<Namespace> = self
            .store
            .read(|s| s.active_connector_ids.keys().cloned().collect());
        self.store.set_state(|s| s.active_connector_ids.clear());
        for namespace in &namespaces {
            self.persisted.delete_connected_connector_id(namespace);
        }
    }

    /// Connected in `namespace`, or in any namespace when `None`
    pub fn is_connected(&self, namespace: Option<&Namespace>) -> bool {
        self.store.read(|s| match namespace {
            Some(ns) => s.active_connector_ids.contains_key(ns),
            None => !s.active_connector_ids.is_empty(),
        })
    }

    /// Connector id persisted by a previous session
    pub fn stored_connector_id(&self, namespace: &Namespace) -> Option<String> {
        self.persisted.get_connected_connector_id(namespace)
    }

    pub fn subscribe_active_connector<C>(&self, namespace: &Namespace, callback: C) -> Subscription
    where
        C: FnMut(Option<String>) + Send + 'static,
    {
        let namespace = namespace.clone();
        self.store.subscribe(
            move |s| s.active_connector_ids.get(&namespace).cloned(),
            callback,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use std::sync::Arc;

    fn controller() -> (ConnectorController, PersistedState) {
        let persisted = PersistedState::new(Arc::new(MemoryStorage::new()), 5);
        (ConnectorController::new(persisted.clone()), persisted)
    }

    fn announced(id: &str, name: &str, ns: Namespace) -> Connector {
        Connector::new(id, name, ns, ConnectorKind::Announced)
    }

    #[test]
    fn test_add_connector_is_idempotent() {
        let (controller, _) = controller();
        for _ in 0..3 {
            controller.add_connector(announced("io.metamask", "MetaMask", Namespace::eip155()));
        }
        let state = controller.state();
        assert_eq!(state.all_connectors.len(), 1);
        assert_eq!(state.connectors.len(), 1);

        // Same name in another namespace is a different connector
        assert!(controller.add_connector(announced("mm-sol", "MetaMask", Namespace::solana())));
        assert_eq!(controller.state().connectors.len(), 1);
        assert_eq!(controller.get_connectors()[0].kind(), ConnectorKind::MultiChain);
    }

    #[test]
    fn test_set_connectors_batch_dedups() {
        let (controller, _) = controller();
        controller.set_connectors(vec![
            announced("io.metamask", "MetaMask", Namespace::eip155()),
            announced("io.metamask", "MetaMask", Namespace::eip155()),
            announced("phantom", "Phantom", Namespace::solana()),
        ]);
        assert_eq!(controller.state().all_connectors.len(), 2);
    }

    #[test]
    fn test_namespace_filter_hides_connectors() {
        let (controller, _) = controller();
        controller.add_connector(announced("io.metamask", "MetaMask", Namespace::eip155()));
        controller.add_connector(announced("phantom", "Phantom", Namespace::solana()));

        controller.filter_by_namespaces(&[Namespace::eip155()]);
        let merged = controller.get_connectors();
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].name(), "MetaMask");

        controller.filter_by_namespace(&Namespace::solana(), true);
        assert_eq!(controller.get_connectors().len(), 2);
        // Raw registry is untouched by filtering
        assert_eq!(controller.get_connectors_by_namespace(&Namespace::solana()).len(), 1);
    }

    #[test]
    fn test_lookups() {
        let (controller, _) = controller();
        controller.add_connector(
            announced("io.metamask", "MetaMask", Namespace::eip155()).with_rdns("io.metamask"),
        );
        controller.add_connector(Connector::new(
            ids::AUTH,
            "Auth",
            Namespace::solana(),
            ConnectorKind::Auth,
        ));

        assert!(controller
            .get_connector_by_id("io.metamask", Some(&Namespace::solana()))
            .is_none());
        assert!(controller
            .get_connector_by_id("IO.METAMASK", Some(&Namespace::eip155()))
            .is_some());
        assert_eq!(
            controller.get_connector_by_rdns("io.metamask").map(|c| c.id),
            Some("io.metamask".to_string())
        );
        assert!(controller.get_auth_connector(Some(&Namespace::eip155())).is_none());
        assert!(controller.get_auth_connector(None).is_some());
        assert_eq!(controller.get_announced_rdns(), vec!["io.metamask".to_string()]);
    }

    #[test]
    fn test_active_selection_is_persisted() {
        let (controller, persisted) = controller();
        controller.set_active_connector_id(&Namespace::eip155(), "io.metamask");
        controller.set_active_connector_id(&Namespace::solana(), "phantom");

        assert!(controller.is_connected(Some(&Namespace::eip155())));
        assert_eq!(
            persisted.get_connected_connector_id(&Namespace::eip155()).as_deref(),
            Some("io.metamask")
        );

        controller.remove_active_connector_id(&Namespace::eip155());
        assert!(controller.get_active_connector_id(&Namespace::eip155()).is_none());
        assert!(persisted.get_connected_connector_id(&Namespace::eip155()).is_none());
        assert!(controller.is_connected(None));

        controller.reset_active_connector_ids();
        assert!(!controller.is_connected(None));
        assert!(controller.stored_connector_id(&Namespace::solana()).is_none());
    }

    #[tokio::test]
    async fn test_subscribe_active_connector() {
        let (controller, _) = controller();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let _sub = controller.subscribe_active_connector(&Namespace::eip155(), move |id| {
            let _ = tx.send(id);
        });

        controller.set_active_connector_id(&Namespace::solana(), "phantom");
        controller.set_active_connector_id(&Namespace::eip155(), "io.metamask");

        let got = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
            .await
            .unwrap();
        assert_eq!(got, Some(Some("io.metamask".to_string())));
    }
}
