//! Suspension points of the engine (warm-up, pacing, back-off).

use async_trait::async_trait;
use std::sync::Mutex;
use std::time::Duration;

#[async_trait]
pub trait Pause: Send + Sync {
    async fn pause(&self, duration: Duration);
}

/// Sleeps on the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioPause;

#[async_trait]
impl Pause for TokioPause {
    async fn pause(&self, duration: Duration) {
        if !duration.is_zero() {
            tokio::time::sleep(duration).await;
        }
    }
}

/// Returns immediately and remembers every requested duration.
#[derive(Debug, Default)]
pub struct RecordedPause {
    requested: Mutex<Vec<Duration>>,
}

impl RecordedPause {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requested(&self) -> Vec<Duration> {
        self.requested
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    pub fn total(&self) -> Duration {
        self.requested().into_iter().sum()
    }
}

#[async_trait]
impl Pause for RecordedPause {
    async fn pause(&self, duration: Duration) {
        if let Ok(mut guard) = self.requested.lock() {
            guard.push(duration);
        }
        tokio::task::yield_now().await;
    }
}
