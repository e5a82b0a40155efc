//! State controllers
//!
//! Every mutation of connector, connection and network state goes through one
//! of the three controllers. Connect, disconnect and network switches are
//! serialized per namespace by [`NamespaceGuards`]; provider events never take
//! a guard and instead bump the namespace's [`Epochs`] so that a stale
//! in-flight operation can tell it lost.

pub mod chain;
pub mod connection;
pub mod connector;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

use crate::caip::Namespace;
use crate::config::OperationPolicy;
use crate::error::ConnectError;

pub use chain::{AccountState, ChainController, ChainState, ChainView, NamespaceState, NetworkState};
pub use connection::{ConnectionController, ConnectionState, DisconnectParams, WalletConnectState};
pub use connector::{ConnectorController, ConnectorState};

/// One async lock per namespace
pub(crate) struct NamespaceGuards {
    policy: OperationPolicy,
    locks: Mutex<HashMap<Namespace, Arc<AsyncMutex<()>>>>,
}

impl NamespaceGuards {
    pub(crate) fn new(policy: OperationPolicy) -> Self {
        Self {
            policy,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, namespace: &Namespace) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks
            .entry(namespace.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Take the namespace guard according to the configured policy
    pub(crate) async fn acquire(
        &self,
        namespace: &Namespace,
    ) -> Result<OwnedMutexGuard<()>, ConnectError> {
        let lock = self.lock_for(namespace);
        match self.policy {
            OperationPolicy::Reject => lock.try_lock_owned().map_err(|_| {
                debug!("Rejecting operation on busy namespace {}", namespace);
                ConnectError::OperationInProgress(namespace.to_string())
            }),
            OperationPolicy::Wait => Ok(lock.lock_owned().await),
        }
    }

    /// Queue for the guard regardless of policy
    pub(crate) async fn wait(&self, namespace: &Namespace) -> OwnedMutexGuard<()> {
        self.lock_for(namespace).lock_owned().await
    }
}

/// Per-namespace generation counters
#[derive(Default)]
pub(crate) struct Epochs {
    inner: Mutex<HashMap<Namespace, u64>>,
}

impl Epochs {
    pub(crate) fn get(&self, namespace: &Namespace) -> u64 {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.get(namespace).copied().unwrap_or(0)
    }

    pub(crate) fn bump(&self, namespace: &Namespace) -> u64 {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let epoch = inner.entry(namespace.clone()).or_insert(0);
        *epoch += 1;
        *epoch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_reject_policy_fails_fast() {
        let guards = NamespaceGuards::new(OperationPolicy::Reject);
        let held = assert_ok!(guards.acquire(&Namespace::eip155()).await);

        let err = assert_err!(guards.acquire(&Namespace::eip155()).await);
        assert_eq!(err, ConnectError::OperationInProgress("eip155".to_string()));
        // Other namespaces are independent
        assert_ok!(guards.acquire(&Namespace::solana()).await);

        drop(held);
        assert_ok!(guards.acquire(&Namespace::eip155()).await);
    }

    #[tokio::test]
    async fn test_wait_policy_queues() {
        let guards = Arc::new(NamespaceGuards::new(OperationPolicy::Wait));
        let held = guards.acquire(&Namespace::eip155()).await.unwrap();

        let waiter = {
            let guards = guards.clone();
            tokio::spawn(async move { guards.acquire(&Namespace::eip155()).await.is_ok() })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        drop(held);
        assert!(waiter.await.unwrap());
    }

    #[test]
    fn test_epochs() {
        let epochs = Epochs::default();
        assert_eq!(epochs.get(&Namespace::eip155()), 0);
        assert_eq!(epochs.bump(&Namespace::eip155()), 1);
        assert_eq!(epochs.get(&Namespace::eip155()), 1);
        assert_eq!(epochs.get(&Namespace::solana()), 0);
    }
}
