//! Backoff logic for retrying transient failures.

#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    clippy::clone_on_ref_ptr,
    clippy::dbg_macro,
    missing_debug_implementations,
    missing_docs
)]

use std::{future::Future, time::Duration};

use observability_deps::tracing::warn;
use rand::prelude::*;

/// Backoff configuration.
#[derive(Debug, Clone, Copy)]
pub struct BackoffConfig {
    /// Initial backoff.
    pub init_backoff: Duration,

    /// Maximum backoff.
    pub max_backoff: Duration,

    /// Multiplier for the next backoff, before jitter.
    pub base: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            init_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(500),
            base: 3.,
        }
    }
}

/// [`Backoff`] can be created from a [`BackoffConfig`].
///
/// Consecutive calls to [`Backoff::next`] will return the next backoff
/// interval, uniformly sampled between the current interval and the current
/// interval times `base`.
#[derive(Debug)]
pub struct Backoff {
    init_backoff: f64,
    next_backoff_secs: f64,
    max_backoff_secs: f64,
    base: f64,
}

impl Backoff {
    /// Create a new [`Backoff`] from the provided [`BackoffConfig`].
    pub fn new(config: &BackoffConfig) -> Self {
        let init_backoff = config.init_backoff.as_secs_f64();
        Self {
            init_backoff,
            next_backoff_secs: init_backoff,
            max_backoff_secs: config.max_backoff.as_secs_f64(),
            base: config.base,
        }
    }

    /// Returns the next backoff duration to wait for.
    pub fn next(&mut self) -> Duration {
        let range = self.next_backoff_secs..(self.next_backoff_secs * self.base);
        let rand_backoff = rand::thread_rng().gen_range(range);

        let next_backoff = self.max_backoff_secs.min(rand_backoff);
        Duration::from_secs_f64(std::mem::replace(&mut self.next_backoff_secs, next_backoff))
    }

    /// Reset the backoff interval back to its initial value.
    pub fn reset(&mut self) {
        self.next_backoff_secs = self.init_backoff;
    }

    /// Perform an async operation that retries with a backoff on every error,
    /// until it succeeds.
    pub async fn retry_all_errors<F, F1, B, E>(&mut self, task_name: &str, mut do_stuff: F) -> B
    where
        F: FnMut() -> F1,
        F1: Future<Output = Result<B, E>>,
        E: std::error::Error,
    {
        loop {
            match do_stuff().await {
                Ok(v) => return v,
                Err(e) => {
                    let backoff = self.next();
                    warn!(
                        error=%e,
                        task_name,
                        backoff_secs = backoff.as_secs(),
                        "request encountered non-fatal error - backing off",
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn backoff_grows_and_caps() {
        let config = BackoffConfig {
            init_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(100),
            base: 2.,
        };
        let mut backoff = Backoff::new(&config);

        let first = backoff.next();
        assert_eq!(first, Duration::from_millis(10));

        for _ in 0..32 {
            let d = backoff.next();
            assert!(d <= Duration::from_millis(100), "backoff exceeded cap: {d:?}");
        }
    }

    #[tokio::test]
    async fn retries_until_success() {
        let attempts = AtomicUsize::new(0);
        let config = BackoffConfig {
            init_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            base: 1.1,
        };

        let got = Backoff::new(&config)
            .retry_all_errors("test", || {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 3 {
                        Err(std::io::Error::new(std::io::ErrorKind::Other, "nope"))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(got, 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }
}
