//! Cancellable lease timers
//!
//! A lease is a renewable timeout after which an idle protocol object is
//! assumed dead. Firing never runs protocol code on the timer task:
//! it enqueues an event on a flume channel and the owning loop does the
//! teardown, so all state mutation stays with the owner.

use parking_lot::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// A cancellable timer that delivers an event when it fires
///
/// `one_shot` leases fire once per arm and are re-armed by `touch()`;
/// `periodic` leases re-arm themselves after each fire until cancelled.
/// Cancelling is idempotent, and a fire racing a cancel loses: the event
/// is not sent.
pub struct Lease<E>
where
    E: Clone + Send + 'static,
{
    duration: Duration,
    periodic: bool,
    tx: flume::Sender<E>,
    event: E,
    current: Mutex<Option<CancellationToken>>,
}

impl<E> Lease<E>
where
    E: Clone + Send + 'static,
{
    /// Create a one-shot lease; armed by the first `touch()`
    pub fn one_shot(duration: Duration, tx: flume::Sender<E>, event: E) -> Self {
        Self {
            duration,
            periodic: false,
            tx,
            event,
            current: Mutex::new(None),
        }
    }

    /// Create a periodic lease; armed by the first `touch()`
    pub fn periodic(duration: Duration, tx: flume::Sender<E>, event: E) -> Self {
        Self {
            duration,
            periodic: true,
            tx,
            event,
            current: Mutex::new(None),
        }
    }

    /// (Re)arm the lease, cancelling any previous arming
    pub fn touch(&self) {
        let token = CancellationToken::new();
        let previous = self.current.lock().replace(token.clone());
        if let Some(previous) = previous {
            previous.cancel();
        }

        let duration = self.duration;
        let periodic = self.periodic;
        let tx = self.tx.clone();
        let event = self.event.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(duration) => {
                        if token.is_cancelled() || tx.send(event.clone()).is_err() {
                            return;
                        }
                        if !periodic {
                            return;
                        }
                    }
                }
            }
        });
    }

    /// Cancel the lease; idempotent, safe to race against a fire
    pub fn cancel(&self) {
        if let Some(token) = self.current.lock().take() {
            token.cancel();
        }
    }
}

impl<E> Drop for Lease<E>
where
    E: Clone + Send + 'static,
{
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn one_shot_fires_once_after_duration() {
        let (tx, rx) = flume::unbounded();
        let lease = Lease::one_shot(Duration::from_millis(20), tx, "expired");
        lease.touch();

        assert_eq!(rx.recv_async().await.unwrap(), "expired");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn touch_rearms_and_cancel_is_idempotent() {
        let (tx, rx) = flume::unbounded();
        let lease = Lease::one_shot(Duration::from_millis(40), tx, ());
        lease.touch();
        tokio::time::sleep(Duration::from_millis(25)).await;

        // Renewed before expiry: nothing fires at the original deadline
        lease.touch();
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert!(rx.try_recv().is_err());

        lease.cancel();
        lease.cancel();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn periodic_fires_until_cancelled() {
        let (tx, rx) = flume::unbounded();
        let lease = Lease::periodic(Duration::from_millis(10), tx, ());
        lease.touch();

        rx.recv_async().await.unwrap();
        rx.recv_async().await.unwrap();
        lease.cancel();
    }
}
