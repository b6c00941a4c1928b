//! Fatal/backpressure signalling.
//!
//! Each critical subsystem (the store, every destination adapter) owns
//! one [`FatalSignal`]: a closed-once condition that any holder can
//! raise and any number of tasks can await. The supervisor selects over
//! these to decide between a destination rebind and a full shutdown.

use tokio_util::sync::CancellationToken;

/// A one-shot, idempotent fatal condition.
#[derive(Debug, Clone, Default)]
pub struct FatalSignal {
    token: CancellationToken,
}

impl FatalSignal {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises the signal. Raising twice is harmless.
    pub fn raise(&self) {
        self.token.cancel();
    }

    #[must_use]
    pub fn is_raised(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Completes once the signal has been raised. Select-friendly.
    pub async fn raised(&self) {
        self.token.cancelled().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_raise_wakes_waiters() {
        let signal = FatalSignal::new();
        let waiter = signal.clone();
        let task = tokio::spawn(async move {
            waiter.raised().await;
            true
        });
        signal.raise();
        assert!(task.await.unwrap());
    }

    #[tokio::test]
    async fn test_raise_is_idempotent() {
        let signal = FatalSignal::new();
        assert!(!signal.is_raised());
        signal.raise();
        signal.raise();
        assert!(signal.is_raised());
        // a late waiter returns immediately
        signal.raised().await;
    }
}
