//! Shared rate-limit/retry/backoff policy wrapping every provider call.
//!
//! The retry loop is an explicit state machine driven through an injected
//! [`Clock`], so backoff behavior is testable without real delays.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum FetchError {
    /// Network/auth failure; the caller treats the whole source as down
    /// for this fetch (and for the run, if it came from the catalog).
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),
    /// Explicit "too many requests" signal; callers back off the entire
    /// source for the remainder of the run, not just this request.
    #[error("rate limited by source")]
    RateLimited { cooldown: Option<Duration> },
    /// Benign: the item is absent from this source's index.
    #[error("item not found")]
    ItemNotFound,
    /// Malformed response; like `SourceUnavailable` for this single fetch
    /// but does not imply the whole source is down.
    #[error("malformed response: {0}")]
    Parse(String),
    /// Timeout / connection reset / 5xx-class response; retried with backoff.
    #[error("transient failure: {0}")]
    Transient(String),
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Transient(_))
    }
}

/// Classify a reqwest transport error before it reaches the retry loop.
pub fn classify_transport(err: reqwest::Error) -> FetchError {
    if err.is_timeout() || err.is_connect() {
        FetchError::Transient(err.to_string())
    } else {
        FetchError::SourceUnavailable(err.to_string())
    }
}

/// Default HTTP status classification. Adapters with source-specific
/// semantics (e.g. anti-bot 403s) remap before falling back to this.
pub fn classify_status(status: reqwest::StatusCode) -> FetchError {
    match status.as_u16() {
        404 | 410 => FetchError::ItemNotFound,
        429 => FetchError::RateLimited { cooldown: None },
        408 | 500..=599 => FetchError::Transient(format!("http {status}")),
        _ => FetchError::SourceUnavailable(format!("http {status}")),
    }
}

/// Injectable time source. Production uses [`TokioClock`]; tests substitute
/// a recording clock so the state machine runs without sleeping.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
    async fn sleep(&self, d: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, d: Duration) {
        tokio::time::sleep(d).await;
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Source-wide cooldown applied on an explicit rate-limit signal when
    /// the remote gives no Retry-After of its own.
    pub rate_limit_cooldown: Duration,
    /// Upper bound on the random jitter added to each backoff.
    pub max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            rate_limit_cooldown: Duration::from_secs(15 * 60),
            max_jitter: Duration::from_millis(250),
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff for the given 1-based attempt, capped at `max_delay`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let delay = self.base_delay.saturating_mul(2u32.saturating_pow(exp));
        delay.min(self.max_delay)
    }
}

/// Transition states of one fetch. Terminal: `Succeeded` / `Exhausted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RetryState {
    Idle,
    Attempting { attempt: u32 },
    Backoff { attempt: u32 },
    Succeeded,
    Exhausted,
}

pub struct ResilientFetcher<C: Clock = TokioClock> {
    source: &'static str,
    policy: RetryPolicy,
    clock: C,
    cooldown_until: Mutex<Option<DateTime<Utc>>>,
}

impl ResilientFetcher<TokioClock> {
    pub fn new(source: &'static str, policy: RetryPolicy) -> Self {
        Self::with_clock(source, policy, TokioClock)
    }
}

impl<C: Clock> ResilientFetcher<C> {
    pub fn with_clock(source: &'static str, policy: RetryPolicy, clock: C) -> Self {
        Self {
            source,
            policy,
            clock,
            cooldown_until: Mutex::new(None),
        }
    }

    /// Whether the source is in a rate-limit cooldown window.
    pub fn cooling_down(&self) -> bool {
        let guard = self.cooldown_until.lock().unwrap_or_else(|e| e.into_inner());
        matches!(*guard, Some(until) if until > self.clock.now())
    }

    fn enter_cooldown(&self, d: Duration) {
        let until = self.clock.now() + chrono::Duration::from_std(d).unwrap_or(chrono::Duration::zero());
        let mut guard = self.cooldown_until.lock().unwrap_or_else(|e| e.into_inner());
        *guard = Some(until);
    }

    /// Run `op` under the retry policy. `op` returns errors already classified
    /// into [`FetchError`]; only `Transient` is retried. The caller gets either
    /// a fully parsed value or an error, never partial data.
    pub async fn call<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, FetchError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        if self.cooling_down() {
            debug!(source = self.source, what, "skipping call: source cooling down");
            return Err(FetchError::RateLimited { cooldown: None });
        }

        let mut state = RetryState::Idle;
        let mut result: Option<Result<T, FetchError>> = None;

        loop {
            state = match state {
                RetryState::Idle => RetryState::Attempting { attempt: 1 },

                RetryState::Attempting { attempt } => match op().await {
                    Ok(value) => {
                        debug!(source = self.source, what, attempt, "fetch succeeded");
                        result = Some(Ok(value));
                        RetryState::Succeeded
                    }
                    Err(FetchError::RateLimited { cooldown }) => {
                        let d = cooldown.unwrap_or(self.policy.rate_limit_cooldown);
                        self.enter_cooldown(d);
                        warn!(
                            source = self.source,
                            what,
                            attempt,
                            cooldown_secs = d.as_secs(),
                            "rate limited; cooling down entire source"
                        );
                        result = Some(Err(FetchError::RateLimited { cooldown: Some(d) }));
                        RetryState::Exhausted
                    }
                    Err(err) if err.is_transient() && attempt < self.policy.max_attempts => {
                        warn!(
                            source = self.source,
                            what,
                            attempt,
                            error = %err,
                            "transient failure; backing off"
                        );
                        RetryState::Backoff { attempt }
                    }
                    Err(err) if err.is_transient() => {
                        warn!(
                            source = self.source,
                            what,
                            attempt,
                            error = %err,
                            "retries exhausted"
                        );
                        result = Some(Err(FetchError::SourceUnavailable(format!(
                            "{}: retries exhausted for {what}: {err}",
                            self.source
                        ))));
                        RetryState::Exhausted
                    }
                    Err(err) => {
                        debug!(source = self.source, what, attempt, error = %err, "permanent failure");
                        result = Some(Err(err));
                        RetryState::Exhausted
                    }
                },

                RetryState::Backoff { attempt } => {
                    let jitter_ms = self.policy.max_jitter.as_millis() as u64;
                    let jitter = if jitter_ms > 0 {
                        Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
                    } else {
                        Duration::ZERO
                    };
                    self.clock
                        .sleep(self.policy.backoff_delay(attempt) + jitter)
                        .await;
                    RetryState::Attempting { attempt: attempt + 1 }
                }

                RetryState::Succeeded | RetryState::Exhausted => break,
            };
        }

        result.unwrap_or_else(|| {
            Err(FetchError::SourceUnavailable(format!(
                "{}: fetch ended without outcome",
                self.source
            )))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    /// Virtual clock: sleeps advance `now` instantly and are recorded.
    struct MockClock {
        now_ms: Mutex<i64>,
        sleeps: Mutex<Vec<Duration>>,
    }

    impl MockClock {
        fn new() -> Self {
            Self {
                now_ms: Mutex::new(0),
                sleeps: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Clock for Arc<MockClock> {
        fn now(&self) -> DateTime<Utc> {
            let ms = *self.now_ms.lock().unwrap();
            DateTime::<Utc>::from_timestamp_millis(ms).unwrap()
        }

        async fn sleep(&self, d: Duration) {
            *self.now_ms.lock().unwrap() += d.as_millis() as i64;
            self.sleeps.lock().unwrap().push(d);
        }
    }

    fn no_jitter_policy() -> RetryPolicy {
        RetryPolicy {
            max_jitter: Duration::ZERO,
            ..RetryPolicy::default()
        }
    }

    fn fetcher(clock: Arc<MockClock>) -> ResilientFetcher<Arc<MockClock>> {
        ResilientFetcher::with_clock("test", no_jitter_policy(), clock)
    }

    #[tokio::test]
    async fn transient_failures_retry_then_succeed() {
        let clock = Arc::new(MockClock::new());
        let f = fetcher(clock.clone());
        let calls = AtomicU32::new(0);

        let out = f
            .call("op", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(FetchError::Transient("reset".into()))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(out.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // Exponential: 500ms then 1s, no jitter.
        let sleeps = clock.sleeps.lock().unwrap().clone();
        assert_eq!(
            sleeps,
            vec![Duration::from_millis(500), Duration::from_secs(1)]
        );
    }

    #[tokio::test]
    async fn exhausted_after_bounded_attempts() {
        let clock = Arc::new(MockClock::new());
        let f = fetcher(clock.clone());
        let calls = AtomicU32::new(0);

        let out: Result<(), _> = f
            .call("op", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(FetchError::Transient("timeout".into())) }
            })
            .await;

        assert!(matches!(out, Err(FetchError::SourceUnavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_failures_are_not_retried() {
        let clock = Arc::new(MockClock::new());
        let f = fetcher(clock.clone());
        let calls = AtomicU32::new(0);

        let out: Result<(), _> = f
            .call("op", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(FetchError::ItemNotFound) }
            })
            .await;

        assert!(matches!(out, Err(FetchError::ItemNotFound)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(clock.sleeps.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn rate_limit_cools_down_the_whole_source() {
        let clock = Arc::new(MockClock::new());
        let f = fetcher(clock.clone());

        let out: Result<(), _> = f
            .call("op", || async {
                Err(FetchError::RateLimited { cooldown: None })
            })
            .await;
        assert!(matches!(out, Err(FetchError::RateLimited { .. })));
        assert!(f.cooling_down());

        // Subsequent calls short-circuit without invoking the operation.
        let calls = AtomicU32::new(0);
        let out: Result<(), _> = f
            .call("op", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;
        assert!(matches!(out, Err(FetchError::RateLimited { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        // Once the cooldown window passes, calls flow again.
        *clock.now_ms.lock().unwrap() += 16 * 60 * 1000;
        assert!(!f.cooling_down());
        let out = f.call("op", || async { Ok(7) }).await;
        assert_eq!(out.unwrap(), 7);
    }

    #[test]
    fn backoff_is_capped() {
        let p = no_jitter_policy();
        assert_eq!(p.backoff_delay(1), Duration::from_millis(500));
        assert_eq!(p.backoff_delay(2), Duration::from_secs(1));
        assert_eq!(p.backoff_delay(10), Duration::from_secs(10));
    }

    #[test]
    fn status_classification() {
        use reqwest::StatusCode;
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND),
            FetchError::ItemNotFound
        ));
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            FetchError::RateLimited { .. }
        ));
        assert!(classify_status(StatusCode::SERVICE_UNAVAILABLE).is_transient());
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN),
            FetchError::SourceUnavailable(_)
        ));
    }
}
