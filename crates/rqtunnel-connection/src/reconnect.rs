//! Reconnection logic with exponential backoff

use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Reconnection configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Initial backoff duration
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Backoff multiplier (1.0 = fixed backoff)
    pub multiplier: f64,
}

impl ReconnectConfig {
    /// Same delay before every attempt
    pub fn fixed(backoff: Duration) -> Self {
        Self {
            initial_backoff: backoff,
            max_backoff: backoff,
            multiplier: 1.0,
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

/// Reconnection errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReconnectError {
    #[error("Reconnection cancelled")]
    Cancelled,
}

/// Reconnection manager with exponential backoff
#[derive(Debug)]
pub struct ReconnectManager {
    config: ReconnectConfig,
    current_backoff: Duration,
    attempt: usize,
}

impl ReconnectManager {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            current_backoff: config.initial_backoff,
            config,
            attempt: 0,
        }
    }

    /// Wait before the next attempt, returning early if `cancel` fires
    pub async fn wait(&mut self, cancel: &CancellationToken) -> Result<(), ReconnectError> {
        self.attempt += 1;

        debug!(
            "Waiting {}ms before reconnection attempt {}",
            self.current_backoff.as_millis(),
            self.attempt
        );

        tokio::select! {
            _ = cancel.cancelled() => return Err(ReconnectError::Cancelled),
            _ = sleep(self.current_backoff) => {}
        }

        self.grow();
        Ok(())
    }

    /// Increase backoff, saturating at `max_backoff`
    fn grow(&mut self) {
        let scaled = self.current_backoff.as_secs_f64() * self.config.multiplier;
        let next_backoff =
            Duration::try_from_secs_f64(scaled).unwrap_or(self.config.max_backoff);

        self.current_backoff = next_backoff.min(self.config.max_backoff);
    }

    /// Reset backoff (call after successful connection)
    pub fn reset(&mut self) {
        if self.attempt > 0 {
            debug!("Resetting reconnection backoff");
        }
        self.current_backoff = self.config.initial_backoff;
        self.attempt = 0;
    }

    /// Get current attempt number
    pub fn attempt(&self) -> usize {
        self.attempt
    }

    /// Get current backoff duration
    pub fn current_backoff(&self) -> Duration {
        self.current_backoff
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> ReconnectConfig {
        ReconnectConfig {
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(100),
            multiplier: 2.0,
        }
    }

    #[tokio::test]
    async fn test_reconnect_backoff() {
        let cancel = CancellationToken::new();
        let mut manager = ReconnectManager::new(test_config());

        assert_eq!(manager.attempt(), 0);
        assert_eq!(manager.current_backoff(), Duration::from_millis(10));

        manager.wait(&cancel).await.unwrap();
        assert_eq!(manager.attempt(), 1);
        assert_eq!(manager.current_backoff(), Duration::from_millis(20));

        manager.wait(&cancel).await.unwrap();
        assert_eq!(manager.attempt(), 2);
        assert_eq!(manager.current_backoff(), Duration::from_millis(40));

        manager.wait(&cancel).await.unwrap();
        assert_eq!(manager.attempt(), 3);
        assert_eq!(manager.current_backoff(), Duration::from_millis(80));

        manager.wait(&cancel).await.unwrap();
        assert_eq!(manager.attempt(), 4);
        // Should cap at max_backoff
        assert_eq!(manager.current_backoff(), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_reconnect_reset() {
        let cancel = CancellationToken::new();
        let mut manager = ReconnectManager::new(test_config());

        manager.wait(&cancel).await.unwrap();
        manager.wait(&cancel).await.unwrap();

        assert_eq!(manager.attempt(), 2);

        manager.reset();

        assert_eq!(manager.attempt(), 0);
        assert_eq!(manager.current_backoff(), Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_fixed_backoff_does_not_grow() {
        let cancel = CancellationToken::new();
        let mut manager = ReconnectManager::new(ReconnectConfig::fixed(Duration::from_millis(5)));

        manager.wait(&cancel).await.unwrap();
        manager.wait(&cancel).await.unwrap();
        assert_eq!(manager.current_backoff(), Duration::from_millis(5));
    }

    #[test]
    fn test_growth_saturates_on_huge_backoff() {
        let mut manager = ReconnectManager::new(ReconnectConfig {
            initial_backoff: Duration::from_secs(u64::MAX / 2),
            max_backoff: Duration::MAX,
            multiplier: 4.0,
        });

        manager.grow();
        assert_eq!(manager.current_backoff(), Duration::MAX);
    }

    #[tokio::test]
    async fn test_wait_is_cancellable() {
        let cancel = CancellationToken::new();
        let mut manager = ReconnectManager::new(ReconnectConfig::fixed(Duration::from_secs(3600)));

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let result = tokio::time::timeout(Duration::from_secs(1), manager.wait(&cancel)).await;
        assert_eq!(result.unwrap(), Err(ReconnectError::Cancelled));
    }
}
