//! [`ConnectionRegistry`] – single-slot holder for the live command channel.
//!
//! The reverse server's handlers register themselves here and the supervisor
//! waits on it. The slot is a [`tokio::sync::watch`] channel so a waiter is
//! woken by the registration itself rather than by polling.
//!
//! A handler leaving the slot calls [`ConnectionRegistry::release`] with its
//! own handle, which only empties the slot if nobody newer has registered in
//! the meantime.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::debug;

pub struct ConnectionRegistry<T> {
    slot: watch::Sender<Option<Arc<T>>>,
}

impl<T> ConnectionRegistry<T> {
    pub fn new() -> Self {
        let (slot, _) = watch::channel(None);
        Self { slot }
    }

    /// Replace the slot's occupant and wake every waiter.
    pub fn register(&self, entry: Arc<T>) {
        self.slot.send_replace(Some(entry));
        debug!("command channel registered");
    }

    /// Empty the slot unconditionally.
    pub fn clear(&self) {
        self.slot.send_replace(None);
    }

    /// Empty the slot if, and only if, `entry` is still the occupant.
    ///
    /// Returns whether the slot was cleared.
    pub fn release(&self, entry: &Arc<T>) -> bool {
        let released = self.slot.send_if_modified(|slot| {
            let owned = slot
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(current, entry));
            if owned {
                *slot = None;
            }
            owned
        });
        if released {
            debug!("command channel released");
        }
        released
    }

    /// The current occupant, without waiting.
    pub fn current(&self) -> Option<Arc<T>> {
        self.slot.borrow().clone()
    }

    /// Fetch the occupant.
    ///
    /// With `wait` set, blocks until the slot is populated or `timeout`
    /// elapses (`None` waits indefinitely); returns `None` on timeout.
    pub async fn get(&self, wait: bool, timeout: Option<Duration>) -> Option<Arc<T>> {
        if !wait {
            return self.current();
        }
        let mut rx = self.slot.subscribe();
        let populated = async move {
            // The sender lives as long as `self`, so `wait_for` cannot fail.
            rx.wait_for(Option::is_some).await.ok().and_then(|slot| slot.clone())
        };
        match timeout {
            Some(limit) => tokio::time::timeout(limit, populated).await.ok().flatten(),
            None => populated.await,
        }
    }

    /// A receiver that observes every registration and release.
    pub fn watch(&self) -> watch::Receiver<Option<Arc<T>>> {
        self.slot.subscribe()
    }
}

impl<T> Default for ConnectionRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn get_without_wait_returns_immediately() {
        let registry: ConnectionRegistry<u32> = ConnectionRegistry::new();
        assert!(registry.get(false, None).await.is_none());
        registry.register(Arc::new(7));
        assert_eq!(registry.get(false, None).await.as_deref(), Some(&7));
    }

    #[tokio::test]
    async fn waiting_get_times_out_empty() {
        let registry: ConnectionRegistry<u32> = ConnectionRegistry::new();
        let started = Instant::now();
        let got = registry.get(true, Some(Duration::from_millis(50))).await;
        assert!(got.is_none());
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn waiter_is_woken_by_registration() {
        let registry = Arc::new(ConnectionRegistry::<u32>::new());
        let waiter = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.get(true, Some(Duration::from_secs(5))).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        registry.register(Arc::new(3));
        let got = waiter.await.expect("waiter task panicked");
        assert_eq!(got.as_deref(), Some(&3));
    }

    #[tokio::test]
    async fn stale_release_keeps_newer_entry() {
        let registry = ConnectionRegistry::new();
        let old = Arc::new("old");
        let new = Arc::new("new");
        registry.register(Arc::clone(&old));
        registry.register(Arc::clone(&new));

        assert!(!registry.release(&old));
        assert_eq!(registry.current().as_deref(), Some(&"new"));

        assert!(registry.release(&new));
        assert!(registry.current().is_none());
    }

    #[test]
    fn clear_empties_the_slot() {
        let registry = ConnectionRegistry::new();
        registry.register(Arc::new(1u8));
        registry.clear();
        assert!(registry.current().is_none());
    }
}
