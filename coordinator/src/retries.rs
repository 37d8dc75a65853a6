//! Bounded retrying around coordinator-touching phases.
//!
//! [`Attempts`] is an explicit iterator of attempts: the caller pulls the
//! next [`Attempt`] only after a retryable failure, sleeps happen inside the
//! iterator, and the caller answers each attempt with a three-way verdict
//! (done / retry / fatal). Hardware errors are the retryable class; user and
//! logical errors terminate immediately.

use observability_deps::tracing::{debug, warn};
use std::time::Duration;

/// Backoff and budget of a retry loop.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total number of attempts (the first try included). Zero behaves as
    /// one.
    pub max_attempts: usize,
    /// Sleep before the first retry.
    pub initial_backoff: Duration,
    /// Upper bound on the sleep between retries.
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 20,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
        }
    }
}

/// One yielded attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempt {
    /// Zero-based attempt number.
    pub index: usize,
    /// Whether the budget is exhausted after this attempt.
    pub is_last: bool,
}

/// The caller's answer to an attempt, for use with [`retry_loop`].
#[derive(Debug)]
pub enum Verdict<T, E> {
    /// The phase completed.
    Done(T),
    /// Transient failure; run another attempt if the budget allows.
    Retry(E),
    /// Definite failure; stop immediately.
    Fatal(E),
}

/// An explicit iterator of retry attempts.
pub struct Attempts {
    name: &'static str,
    config: RetryConfig,
    next_index: usize,
    /// Attempts granted on top of the budget, e.g. for retries that must not
    /// count against it.
    extra: usize,
    skip_next_backoff: bool,
    next_backoff: Duration,
    action_after_last_failure: Option<Box<dyn FnOnce() + Send>>,
}

impl std::fmt::Debug for Attempts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Attempts")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("next_index", &self.next_index)
            .field("extra", &self.extra)
            .finish_non_exhaustive()
    }
}

impl Attempts {
    /// A fresh attempt budget for the phase `name`.
    pub fn new(name: &'static str, config: &RetryConfig) -> Self {
        Self {
            name,
            config: config.clone(),
            next_index: 0,
            extra: 0,
            skip_next_backoff: false,
            next_backoff: config.initial_backoff,
            action_after_last_failure: None,
        }
    }

    /// Grant one attempt that does not consume budget; the attempt that
    /// follows is taken without backoff.
    pub fn grant_extra_attempt(&mut self) {
        self.extra += 1;
        self.skip_next_backoff = true;
    }

    /// Register a hook to run when the budget ends in failure, via
    /// [`exhausted`](Self::exhausted).
    pub fn on_last_failure(&mut self, action: impl FnOnce() + Send + 'static) {
        self.action_after_last_failure = Some(Box::new(action));
    }

    /// Report that the final attempt failed with a retryable error: runs the
    /// registered last-failure hook, once.
    pub fn exhausted(&mut self) {
        warn!(name = self.name, attempts = self.next_index, "retries exhausted");
        if let Some(action) = self.action_after_last_failure.take() {
            action();
        }
    }

    fn budget(&self) -> usize {
        self.config.max_attempts.max(1) + self.extra
    }

    /// The next attempt, sleeping the backoff first for every attempt but
    /// the first. `None` once the budget is spent.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<Attempt> {
        if self.next_index >= self.budget() {
            return None;
        }

        let skip_backoff = std::mem::take(&mut self.skip_next_backoff);
        if self.next_index > 0 && !skip_backoff {
            debug!(
                name = self.name,
                attempt = self.next_index,
                backoff_ms = self.next_backoff.as_millis() as u64,
                "retrying after backoff"
            );
            std::thread::sleep(self.next_backoff);
            self.next_backoff = (self.next_backoff * 2).min(self.config.max_backoff);
        }

        let attempt = Attempt {
            index: self.next_index,
            is_last: self.next_index + 1 >= self.budget(),
        };
        self.next_index += 1;
        Some(attempt)
    }
}

/// Drive `body` under the attempt budget until it reports
/// [`Verdict::Done`] or fails for good.
pub fn retry_loop<T, E>(
    name: &'static str,
    config: &RetryConfig,
    mut body: impl FnMut(Attempt) -> Verdict<T, E>,
) -> Result<T, E> {
    let mut attempts = Attempts::new(name, config);
    loop {
        let attempt = attempts
            .next()
            .expect("attempt budget ends via is_last, not exhaustion");
        match body(attempt) {
            Verdict::Done(value) => return Ok(value),
            Verdict::Fatal(e) => return Err(e),
            Verdict::Retry(e) if attempt.is_last => {
                attempts.exhausted();
                return Err(e);
            }
            Verdict::Retry(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    fn quick(max_attempts: usize) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
        }
    }

    #[test]
    fn test_yields_budget_with_last_marker() {
        let mut attempts = Attempts::new("test", &quick(3));
        assert_eq!(
            attempts.next(),
            Some(Attempt {
                index: 0,
                is_last: false
            })
        );
        assert_eq!(
            attempts.next(),
            Some(Attempt {
                index: 1,
                is_last: false
            })
        );
        assert_eq!(
            attempts.next(),
            Some(Attempt {
                index: 2,
                is_last: true
            })
        );
        assert_eq!(attempts.next(), None);
    }

    #[test]
    fn test_extra_attempts_extend_budget() {
        let mut attempts = Attempts::new("test", &quick(1));
        let first = attempts.next().unwrap();
        assert!(first.is_last);

        attempts.grant_extra_attempt();
        let extra = attempts.next().unwrap();
        assert_eq!(extra.index, 1);
        assert!(extra.is_last);
        assert_eq!(attempts.next(), None);
    }

    #[test]
    fn test_last_failure_hook_runs_once() {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut attempts = Attempts::new("test", &quick(1));
        let captured = Arc::clone(&runs);
        attempts.on_last_failure(move || {
            captured.fetch_add(1, Ordering::SeqCst);
        });

        attempts.exhausted();
        attempts.exhausted();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_retry_loop_retries_then_succeeds() {
        let calls = AtomicUsize::new(0);
        let result: Result<&str, &str> = retry_loop("test", &quick(5), |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            if attempt.index < 2 {
                Verdict::Retry("transient")
            } else {
                Verdict::Done("ok")
            }
        });
        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_retry_loop_fatal_stops() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), &str> = retry_loop("test", &quick(5), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            Verdict::Fatal("definite")
        });
        assert_eq!(result.unwrap_err(), "definite");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_retry_loop_exhausts() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), &str> = retry_loop("test", &quick(3), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            Verdict::Retry("transient")
        });
        assert_eq!(result.unwrap_err(), "transient");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
