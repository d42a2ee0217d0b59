use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Serializes callback delivery against shutdown. Once `shut` returns, no
/// callback passed to `deliver` will run.
#[derive(Debug, Default)]
pub struct DeliveryGate {
    token: CancellationToken,
    delivery: Mutex<()>,
}

impl DeliveryGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_shut(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn deliver<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        let _guard = self.delivery.lock().await;
        if self.token.is_cancelled() {
            return None;
        }
        Some(f())
    }

    /// Idempotent. Waits for a delivery already in progress to finish.
    pub async fn shut(&self) {
        self.token.cancel();
        let _guard = self.delivery.lock().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn no_delivery_after_shut() {
        let gate = DeliveryGate::new();
        assert_eq!(gate.deliver(|| 1).await, Some(1));
        gate.shut().await;
        gate.shut().await;
        assert!(gate.is_shut());
        assert_eq!(gate.deliver(|| 2).await, None);
    }
}
