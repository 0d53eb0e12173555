use std::fmt;
use std::fmt::{Debug, Formatter};
use tokio::sync::oneshot;

/// Callback is the response half of a mailbox event. The actor fills it in
/// exactly once; the dispatching caller awaits the paired receiver. A caller
/// that has stopped waiting (timeout, drop) is observable via `closed()`.
pub(crate) struct Callback<O, E>(oneshot::Sender<Result<O, E>>);

impl<O, E> Callback<O, E> {
    pub(crate) fn new_pair() -> (Self, oneshot::Receiver<Result<O, E>>) {
        let (tx, rx) = oneshot::channel();
        (Callback(tx), rx)
    }

    pub(crate) fn send(self, message: Result<O, E>) {
        // Caller may have gone away (e.g. timed out). Nothing to do.
        let _ = self.0.send(message);
    }

    /// Resolves when the caller has dropped its receiver. Used by actors to
    /// abandon in-flight work whose result nobody will read.
    pub(crate) async fn closed(&mut self) {
        self.0.closed().await
    }
}

impl<O, E> Debug for Callback<O, E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callback").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn callback_round_trip() {
        let (cb, rx) = Callback::<u64, String>::new_pair();
        cb.send(Ok(42));
        assert_eq!(rx.await.unwrap(), Ok(42));
    }

    #[tokio::test]
    async fn callback_closed_after_receiver_drop() {
        let (mut cb, rx) = Callback::<u64, String>::new_pair();
        drop(rx);
        // Must resolve promptly, not hang.
        cb.closed().await;
    }
}
