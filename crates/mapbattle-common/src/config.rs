use std::future::Future;
use std::time::Duration;

use crate::model::{CountryCode, QuestionMode, MAX_PLAYERS, TURN_SECONDS};
use crate::questions::{QuestionPool, DEFAULT_CATALOG};
use crate::store::{StoreError, StoreResult};

pub const SETTLE_DELAY: Duration = Duration::from_secs(3);

/// Bounded retry with exponential backoff for follow-on writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(1u32 << attempt.min(16))
    }

    /// Runs `op` until it succeeds, returns a non-retryable error, or the
    /// attempts run out. Conflicts and rejections are final.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> StoreResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e @ (StoreError::Conflict(_) | StoreError::Rejected(_))) => return Err(e),
                Err(e) if attempt + 1 >= attempts => return Err(e),
                Err(e) => {
                    let delay = self.backoff(attempt);
                    tracing::warn!("{} failed (attempt {}/{}): {}; retrying in {:?}", what, attempt + 1, attempts, e, delay);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Pause between an all-failed event and the rotation that follows it.
    pub settle_delay: Duration,
    pub turn_seconds: u32,
    /// How long a submitter waits to see its own rotation before resyncing.
    pub confirm_timeout: Duration,
    /// Age after which a move without its rotation is recovered by any client.
    pub stale_after: Duration,
    pub tick: Duration,
    pub retry: RetryPolicy,
    /// Submit a timeout when the local turn clock reaches zero.
    pub auto_timeout: bool,
    pub mode: QuestionMode,
    pub catalog: Vec<CountryCode>,
    pub max_players: u8,
    /// Seeds question and start-player choice; entropy when unset.
    pub seed: Option<u64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            settle_delay: SETTLE_DELAY,
            turn_seconds: TURN_SECONDS,
            confirm_timeout: Duration::from_secs(10),
            stale_after: Duration::from_secs(10),
            tick: Duration::from_secs(1),
            retry: RetryPolicy::default(),
            auto_timeout: true,
            mode: QuestionMode::Flag,
            catalog: DEFAULT_CATALOG.iter().map(|c| CountryCode::new(c)).collect(),
            max_players: MAX_PLAYERS,
            seed: None,
        }
    }
}

impl SessionConfig {
    pub fn question_pool(&self) -> QuestionPool {
        QuestionPool::new(self.catalog.clone(), self.mode)
    }
}
