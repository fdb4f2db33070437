//! Readiness board: hands executor readiness signals to waiting cold starts.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, oneshot};

/// Waiters keyed by instance ID. One waiter per pending instance.
#[derive(Clone, Default)]
pub struct ReadinessBoard {
    waiters: Arc<Mutex<HashMap<String, oneshot::Sender<u16>>>>,
}

impl ReadinessBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start waiting for `instance_id`. Must be called before the launch
    /// so a fast executor cannot signal into the void.
    pub async fn register(&self, instance_id: &str) -> oneshot::Receiver<u16> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().await.insert(instance_id.to_string(), tx);
        rx
    }

    /// Deliver the bound port. Returns false if nobody is waiting.
    pub async fn notify(&self, instance_id: &str, port: u16) -> bool {
        match self.waiters.lock().await.remove(instance_id) {
            Some(tx) => tx.send(port).is_ok(),
            None => false,
        }
    }

    /// Stop waiting for `instance_id`.
    pub async fn forget(&self, instance_id: &str) {
        self.waiters.lock().await.remove(instance_id);
    }

    pub async fn pending(&self) -> usize {
        self.waiters.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn notify_reaches_registered_waiter() {
        let board = ReadinessBoard::new();
        let rx = board.register("i-1").await;

        assert!(board.notify("i-1", 9001).await);
        assert_eq!(rx.await.unwrap(), 9001);
        assert_eq!(board.pending().await, 0);
    }

    #[tokio::test]
    async fn notify_without_waiter_is_false() {
        let board = ReadinessBoard::new();
        assert!(!board.notify("ghost", 9001).await);
    }

    #[tokio::test]
    async fn forget_drops_the_waiter() {
        let board = ReadinessBoard::new();
        let rx = board.register("i-1").await;
        board.forget("i-1").await;

        assert!(!board.notify("i-1", 9001).await);
        assert!(rx.await.is_err());
    }
}
