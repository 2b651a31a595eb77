//! Exponential backoff retry for fetch, mutate and subscribe work.

use rand::Rng;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::error::CacheError;

/// Source of uniformly distributed numbers in `[0, 1)` used for jitter.
///
/// Inject a fixed implementation to make backoff delays deterministic in tests.
pub trait Randomizer: Send + Sync {
    fn next_f64(&self) -> f64;
}

/// Randomizer backed by the thread-local `rand` generator.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRandomizer;

impl Randomizer for ThreadRandomizer {
    fn next_f64(&self) -> f64 {
        rand::thread_rng().r#gen::<f64>()
    }
}

/// Randomizer that always returns the same value.
#[derive(Debug, Clone, Copy)]
pub struct FixedRandomizer(pub f64);

impl Randomizer for FixedRandomizer {
    fn next_f64(&self) -> f64 {
        self.0
    }
}

/// Decides whether an error is worth another attempt.
pub type RetryPredicate = Arc<dyn Fn(&CacheError) -> bool + Send + Sync>;

/// Configuration for retrying with exponential backoff.
#[derive(Clone)]
pub struct RetryOptions {
    /// Number of retries after the first attempt. `0` disables retrying.
    pub retry_count: usize,
    /// Delay before the first retry.
    pub initial_interval: Duration,
    /// Upper bound for the un-jittered delay.
    pub max_interval: Duration,
    /// Growth factor applied for each further retry.
    pub multiplier: f64,
    /// Jitter applied to each delay, as a fraction in `[0, 1]`.
    pub randomization_factor: f64,
    pub should_retry: RetryPredicate,
    pub randomizer: Arc<dyn Randomizer>,
}

impl Default for RetryOptions {
    fn default() -> Self {
        RetryOptions {
            retry_count: 3,
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(30),
            multiplier: 1.5,
            randomization_factor: 0.5,
            should_retry: Arc::new(CacheError::is_retryable),
            randomizer: Arc::new(ThreadRandomizer),
        }
    }
}

impl fmt::Debug for RetryOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryOptions")
            .field("retry_count", &self.retry_count)
            .field("initial_interval", &self.initial_interval)
            .field("max_interval", &self.max_interval)
            .field("multiplier", &self.multiplier)
            .field("randomization_factor", &self.randomization_factor)
            .finish_non_exhaustive()
    }
}

impl RetryOptions {
    /// Options that run the work exactly once.
    pub fn disabled() -> Self {
        RetryOptions {
            retry_count: 0,
            ..Default::default()
        }
    }

    /// Delay to wait before retry number `attempt` (0-based).
    pub fn backoff(&self, attempt: usize) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base = self.initial_interval.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);
        let base = base.min(self.max_interval.as_secs_f64());

        let factor = self.randomization_factor.clamp(0.0, 1.0);
        let random = self.randomizer.next_f64().clamp(0.0, 1.0);
        // Uniform in [1 - factor, 1 + factor].
        let jitter = 1.0 - factor + 2.0 * factor * random;

        let delay = Duration::from_secs_f64((base * jitter).max(0.0));
        delay.max(Duration::from_millis(1))
    }
}

/// Runs async work with retries according to [`RetryOptions`].
///
/// `halt` lets the caller stop early on errors that retrying cannot fix right
/// now, such as network errors while offline.
pub struct RetryFn<'a> {
    options: &'a RetryOptions,
    halt: Option<&'a (dyn Fn(&CacheError) -> bool + Send + Sync)>,
}

impl<'a> RetryFn<'a> {
    pub fn new(options: &'a RetryOptions) -> Self {
        RetryFn {
            options,
            halt: None,
        }
    }

    pub fn with_halt(mut self, halt: &'a (dyn Fn(&CacheError) -> bool + Send + Sync)) -> Self {
        self.halt = Some(halt);
        self
    }

    /// Run `work`, retrying failures.
    ///
    /// With `retry_count = N` the work runs at most `N + 1` times. The final
    /// attempt is not guarded and its error is returned as is.
    pub async fn run<T, F, Fut>(&self, mut work: F) -> Result<T, CacheError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CacheError>>,
    {
        for attempt in 0..self.options.retry_count {
            let err = match work().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if err.is_cancelled() || !(self.options.should_retry)(&err) {
                return Err(err);
            }
            if self.halt.is_some_and(|halt| halt(&err)) {
                tracing::debug!(error = %err, "retry halted");
                return Err(err);
            }
            let delay = self.options.backoff(attempt);
            tracing::debug!(
                attempt = attempt + 1,
                retry_count = self.options.retry_count,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying after failure"
            );
            tokio::time::sleep(delay).await;
        }
        work().await
    }
}
