use std::ops::Deref;
use std::sync::Arc;
use tokio::sync::Notify;

/// Shared is a jointly-owned handle to a value whose teardown must be
/// observable: `wait_unique()` resolves once the caller's handle is the last
/// one alive. The log manager parks on this during teardown so that no
/// reader/writer still holds the replica or the network when the log reports
/// itself destroyed.
pub(crate) struct Shared<T> {
    // `None` only transiently inside drop, so the release notification fires
    // strictly after the refcount has decreased.
    value: Option<Arc<T>>,
    released: Arc<Notify>,
}

impl<T> Shared<T> {
    pub(crate) fn new(value: T) -> Self {
        Shared {
            value: Some(Arc::new(value)),
            released: Arc::new(Notify::new()),
        }
    }

    /// Resolves once `self` holds the only remaining reference.
    pub(crate) async fn wait_unique(&self) {
        loop {
            let released = self.released.notified();
            tokio::pin!(released);
            // Register interest before checking, so a concurrent drop cannot
            // slip between the check and the await.
            released.as_mut().enable();

            if Arc::strong_count(self.get()) == 1 {
                return;
            }

            released.await;
        }
    }

    fn get(&self) -> &Arc<T> {
        self.value.as_ref().expect("Shared value taken outside drop")
    }
}

impl<T> Clone for Shared<T> {
    fn clone(&self) -> Self {
        Shared {
            value: Some(Arc::clone(self.get())),
            released: Arc::clone(&self.released),
        }
    }
}

impl<T> Deref for Shared<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.get()
    }
}

impl<T> Drop for Shared<T> {
    fn drop(&mut self) {
        self.value.take();
        self.released.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Duration;

    #[tokio::test]
    async fn wait_unique_resolves_immediately_when_sole_owner() {
        let shared = Shared::new(5u64);
        shared.wait_unique().await;
    }

    #[tokio::test]
    async fn wait_unique_blocks_until_clones_drop() {
        // -- setup --
        let shared = Shared::new(String::from("replica"));
        let clone_a = shared.clone();
        let clone_b = shared.clone();

        // -- execute --
        let waiter = tokio::spawn(async move {
            shared.wait_unique().await;
            shared
        });

        // Still two outstanding clones; the waiter must not complete.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(clone_a);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(clone_b);

        // -- verify --
        let shared = waiter.await.unwrap();
        assert_eq!(*shared, "replica");
    }
}
