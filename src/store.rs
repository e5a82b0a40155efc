//! Observable state containers
//!
//! Every controller keeps its state in a [`Store`]. Writers mutate through
//! closures so several fields change in one step; readers either snapshot the
//! state or subscribe to a projection of it and are notified only when that
//! projection changes.

use futures_util::Stream;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Watch-backed state with selector subscriptions
pub struct Store<S> {
    tx: watch::Sender<S>,
}

impl<S> Store<S>
where
    S: Clone + Send + Sync + 'static,
{
    pub fn new(initial: S) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    /// Snapshot of the whole state
    pub fn get_state(&self) -> S {
        self.tx.borrow().clone()
    }

    /// Read without cloning
    pub fn read<R>(&self, f: impl FnOnce(&S) -> R) -> R {
        f(&self.tx.borrow())
    }

    /// Apply a mutation and notify subscribers once
    pub fn set_state(&self, f: impl FnOnce(&mut S)) {
        self.tx.send_modify(f);
    }

    /// Apply a mutation that reports whether anything changed; subscribers
    /// are only woken when it returns `true`
    pub fn set_state_if(&self, f: impl FnOnce(&mut S) -> bool) -> bool {
        self.tx.send_if_modified(f)
    }

    /// Call `callback` with the selected projection each time it changes.
    /// The callback stops when the returned [`Subscription`] is dropped.
    pub fn subscribe<T, F, C>(&self, selector: F, mut callback: C) -> Subscription
    where
        T: PartialEq + Clone + Send + 'static,
        F: Fn(&S) -> T + Send + 'static,
        C: FnMut(T) + Send + 'static,
    {
        let mut rx = self.tx.subscribe();
        let mut last = selector(&rx.borrow_and_update());

        let handle = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let next = selector(&rx.borrow_and_update());
                if next != last {
                    callback(next.clone());
                    last = next;
                }
            }
        });

        Subscription { handle }
    }

    /// Stream of projection changes
    pub fn changes<T, F>(&self, selector: F) -> impl Stream<Item = T> + Send + 'static
    where
        T: PartialEq + Clone + Send + Sync + 'static,
        F: Fn(&S) -> T + Send + 'static,
    {
        let mut rx = self.tx.subscribe();
        let mut last = selector(&rx.borrow_and_update());
        async_stream::stream! {
            while rx.changed().await.is_ok() {
                let next = selector(&rx.borrow_and_update());
                if next != last {
                    last = next.clone();
                    yield next;
                }
            }
        }
    }
}

impl<S: Default + Clone + Send + Sync + 'static> Default for Store<S> {
    fn default() -> Self {
        Self::new(S::default())
    }
}

/// Handle to a running store subscription
pub struct Subscription {
    handle: JoinHandle<()>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[derive(Debug, Clone, Default)]
    struct Counter {
        value: u32,
        label: String,
    }

    #[test]
    fn test_set_state_multiple_fields() {
        let store = Store::new(Counter::default());
        store.set_state(|s| {
            s.value = 3;
            s.label = "three".to_string();
        });
        let state = store.get_state();
        assert_eq!(state.value, 3);
        assert_eq!(state.label, "three");
        assert_eq!(store.read(|s| s.value), 3);
    }

    #[tokio::test]
    async fn test_subscribe_only_on_projection_change() {
        let store = Store::new(Counter::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = store.subscribe(|s| s.value, move |v| {
            let _ = tx.send(v);
        });

        store.set_state(|s| s.label = "unrelated".to_string());
        tokio::task::yield_now().await;
        store.set_state(|s| s.value = 7);

        let got = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap();
        assert_eq!(got, Some(7));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_callbacks() {
        let store = Store::new(Counter::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sub = store.subscribe(|s| s.value, move |v| {
            let _ = tx.send(v);
        });
        sub.unsubscribe();

        store.set_state(|s| s.value = 1);
        let got = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await;
        // Sender was dropped with the aborted task
        assert!(matches!(got, Ok(None)));
    }

    #[tokio::test]
    async fn test_changes_stream() {
        let store = Store::new(Counter::default());
        let mut changes = Box::pin(store.changes(|s| s.label.clone()));

        store.set_state(|s| s.label = "a".to_string());
        assert_eq!(changes.next().await, Some("a".to_string()));
    }

    #[test]
    fn test_set_state_if_unchanged() {
        let store = Store::new(Counter::default());
        let changed = store.set_state_if(|s| {
            if s.value == 0 {
                return false;
            }
            s.value = 0;
            true
        });
        assert!(!changed);
    }
}
